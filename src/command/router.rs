//! Endpoint routing table

use super::CommandHandler;
use super::handlers::{self, HandlerContext};
use async_trait::async_trait;
use robot_link_shared::{Command, CommandResult};
use tracing::{info, warn};

/// Maps endpoint names to handlers
pub struct Router {
    ctx: HandlerContext,
}

impl Router {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &HandlerContext {
        &self.ctx
    }

    /// Execute a command against the handler for its endpoint
    pub async fn route(&self, command: &Command) -> CommandResult {
        let ctx = &self.ctx;
        info!("[ROUTER] {}", command.endpoint);

        match command.endpoint.as_str() {
            "get-ip" => handlers::handle_get_ip(ctx).await,
            "list-projects" => handlers::handle_list_projects(ctx).await,
            "get-project" => handlers::handle_get_project(ctx).await,
            "switch-project" => handlers::handle_switch_project(ctx, command).await,
            "get-branch" => handlers::handle_get_branch(ctx).await,
            "get-branches" => handlers::handle_get_branches(ctx).await,
            "get-commit-hash" => handlers::handle_get_commit_hash(ctx).await,
            "get-target" => handlers::handle_get_target(ctx).await,
            "get-targets" => handlers::handle_get_targets(ctx).await,
            "get-project-directory" => handlers::handle_get_project_directory(ctx).await,
            "switch-branch" => handlers::handle_switch_branch(ctx, command).await,
            "change-target" => handlers::handle_change_target(ctx, command).await,
            "pull-changes" => handlers::handle_pull_changes(ctx).await,
            "install-project" => handlers::handle_install_project(ctx, command).await,
            "execute-target" => handlers::handle_execute_target(ctx).await,
            "tinker" => handlers::handle_tinker(ctx).await,
            "stop-execution" => handlers::handle_stop_execution(ctx).await,
            "list-devices" => handlers::handle_list_devices(ctx).await,
            "get-state" => handlers::handle_get_state(ctx, command).await,
            "get-states" => handlers::handle_get_states(ctx).await,
            "set-state" => handlers::handle_set_state(ctx, command).await,
            "execute-command" => handlers::handle_execute_command(ctx, command).await,
            "name" => handlers::handle_name(ctx).await,
            other => {
                warn!("[ROUTER] Unknown command: {}", other);
                CommandResult::failed("Command not recognized")
            }
        }
    }
}

#[async_trait]
impl CommandHandler for Router {
    async fn handle(&self, command: Command) -> CommandResult {
        self.route(&command).await
    }
}
