//! Project management handlers

use super::{done, reply, usage, HandlerContext};
use robot_link_shared::{Command, CommandResult};
use tracing::warn;

/// Load the selected project's device model, logging failures
async fn load_model(ctx: &HandlerContext) {
    let path = match ctx.model_path() {
        Ok(path) => path,
        Err(e) => {
            warn!("[PROJECT] No device model: {}", e);
            return;
        }
    };
    if let Err(e) = ctx.devices.load(&path).await {
        warn!("[PROJECT] Device model not loaded: {}", e);
    }
}

pub async fn handle_get_ip(ctx: &HandlerContext) -> CommandResult {
    reply(ctx.projects.local_ip().await)
}

pub async fn handle_list_projects(ctx: &HandlerContext) -> CommandResult {
    reply(ctx.projects.list_projects())
}

pub async fn handle_get_project(ctx: &HandlerContext) -> CommandResult {
    reply(ctx.projects.selected_project())
}

pub async fn handle_switch_project(ctx: &HandlerContext, command: &Command) -> CommandResult {
    let Some(id) = command.str_arg("project_id") else {
        return usage("switch-project <project_id>");
    };
    if let Err(e) = ctx.projects.switch_project(id) {
        return CommandResult::failed(e.to_string());
    }
    load_model(ctx).await;
    CommandResult::done()
}

pub async fn handle_get_branch(ctx: &HandlerContext) -> CommandResult {
    reply(ctx.projects.current_branch().await)
}

pub async fn handle_get_branches(ctx: &HandlerContext) -> CommandResult {
    reply(ctx.projects.branches().await.map(|b| b.join(",")))
}

pub async fn handle_get_commit_hash(ctx: &HandlerContext) -> CommandResult {
    reply(ctx.projects.commit_hash().await)
}

pub async fn handle_get_target(ctx: &HandlerContext) -> CommandResult {
    reply(ctx.projects.target())
}

pub async fn handle_get_targets(ctx: &HandlerContext) -> CommandResult {
    reply(ctx.projects.targets().map(|t| t.join(",")))
}

pub async fn handle_get_project_directory(ctx: &HandlerContext) -> CommandResult {
    reply(
        ctx.projects
            .project_directory()
            .map(|dir| dir.display().to_string()),
    )
}

pub async fn handle_switch_branch(ctx: &HandlerContext, command: &Command) -> CommandResult {
    let Some(branch) = command.str_arg("branch_name") else {
        return usage("switch-branch <branch_name>");
    };
    done(ctx.projects.switch_branch(branch).await)
}

pub async fn handle_change_target(ctx: &HandlerContext, command: &Command) -> CommandResult {
    let Some(target) = command.str_arg("target_name") else {
        return usage("change-target <target_name>");
    };
    done(ctx.projects.change_target(target))
}

pub async fn handle_pull_changes(ctx: &HandlerContext) -> CommandResult {
    done(ctx.projects.pull_changes().await)
}

pub async fn handle_install_project(ctx: &HandlerContext, command: &Command) -> CommandResult {
    let (Some(id), Some(url)) = (command.str_arg("project_id"), command.str_arg("url")) else {
        return usage("install-project <project_id> <url> [token]");
    };
    let token = command.str_arg("token");

    if let Err(e) = ctx.projects.install_project(id, url, token).await {
        return CommandResult::failed(e.to_string());
    }
    load_model(ctx).await;
    CommandResult::done()
}

/// Run a shell command in the selected project's directory
pub async fn handle_execute_command(ctx: &HandlerContext, command: &Command) -> CommandResult {
    let Some(shell) = command.str_arg("command") else {
        return usage("execute-command <command>");
    };
    reply(ctx.projects.run_shell(shell).await)
}

pub async fn handle_name(ctx: &HandlerContext) -> CommandResult {
    CommandResult::ok(ctx.projects.name())
}
