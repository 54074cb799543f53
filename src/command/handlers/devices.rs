//! Device state handlers

use super::{done, reply, usage, HandlerContext};
use robot_link_shared::{Command, CommandResult};
use serde_json::Value;

pub async fn handle_list_devices(ctx: &HandlerContext) -> CommandResult {
    CommandResult::ok(ctx.devices.device_ids().await.join(","))
}

pub async fn handle_get_state(ctx: &HandlerContext, command: &Command) -> CommandResult {
    let Some(id) = command.str_arg("device_id") else {
        return usage("get-state <device_id>");
    };
    reply(ctx.devices.state_of(id).await.map(|state| state.to_string()))
}

pub async fn handle_get_states(ctx: &HandlerContext) -> CommandResult {
    reply(
        ctx.devices
            .all_states()
            .await
            .map(|states| Value::Object(states).to_string()),
    )
}

/// Apply `{"uuid": id, "state": value}`.
///
/// `state` may arrive JSON-encoded as a string; it is decoded once.
pub async fn handle_set_state(ctx: &HandlerContext, command: &Command) -> CommandResult {
    let (Some(id), Some(state)) = (command.str_arg("uuid"), command.payload.get("state")) else {
        return CommandResult::failed("Failed to parse state");
    };

    let state = match state {
        Value::String(encoded) => match serde_json::from_str(encoded) {
            Ok(decoded) => decoded,
            Err(_) => return CommandResult::failed("Failed to parse state"),
        },
        other => other.clone(),
    };

    done(ctx.devices.update_state(id, state).await)
}
