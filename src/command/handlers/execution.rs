//! Program execution handlers

use super::{done, HandlerContext};
use robot_link_shared::CommandResult;
use tracing::{info, warn};

/// Run the selected project's target under its environment
pub async fn handle_execute_target(ctx: &HandlerContext) -> CommandResult {
    let (env, script) = match ctx.projects.target_paths() {
        Ok(paths) => paths,
        Err(e) => return CommandResult::failed(e.to_string()),
    };

    if ctx.supervisor.start(&env, &script) {
        info!("[EXEC] Running {} (pid {:?})", script.display(), ctx.supervisor.pid());
        CommandResult::done()
    } else {
        CommandResult::failed("Failed to start program")
    }
}

/// Load the selected project's device model so the client can drive devices
/// without running a program
pub async fn handle_tinker(ctx: &HandlerContext) -> CommandResult {
    let path = match ctx.model_path() {
        Ok(path) => path,
        Err(e) => return CommandResult::failed(e.to_string()),
    };
    info!("[EXEC] Tinkering with {}", path.display());
    done(ctx.devices.load(&path).await)
}

/// Reset device state and stop the program
pub async fn handle_stop_execution(ctx: &HandlerContext) -> CommandResult {
    if let Err(e) = ctx.devices.reload().await {
        warn!("[EXEC] Device model not reloaded: {}", e);
    }
    if ctx.supervisor.is_running() {
        info!("[EXEC] Stopping pid {:?}", ctx.supervisor.pid());
    }
    ctx.supervisor.kill();
    CommandResult::done()
}
