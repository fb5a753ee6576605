//! `probe` and `health`: one-shot session operations against a device.

use gatewatch_core::DeviceSessionManager;
use serde_json::json;

use super::Context;
use crate::cli::OutputFormat;
use crate::error::CliError;
use crate::output;

async fn authenticated(
    ctx: &Context,
    device_id: &str,
) -> Result<(DeviceSessionManager, gatewatch_core::AuthOutcome), CliError> {
    let config = ctx.registry.get(device_id)?;
    let sessions = ctx.session_manager();
    let outcome = sessions
        .authenticate(config)
        .await
        .map_err(|e| CliError::from_core(device_id, e))?;
    Ok((sessions, outcome))
}

pub async fn probe(ctx: &Context, device_id: &str, format: OutputFormat) -> Result<(), CliError> {
    let (sessions, outcome) = authenticated(ctx, device_id).await?;
    output::print(&outcome, format)?;
    sessions.logout(device_id).await;
    Ok(())
}

pub async fn health(ctx: &Context, device_id: &str, format: OutputFormat) -> Result<(), CliError> {
    let (sessions, outcome) = authenticated(ctx, device_id).await?;
    let health = sessions.device_health(device_id).await;
    output::print(
        &json!({
            "health": health,
            "sessionExpiresAt": outcome.expires_at,
        }),
        format,
    )?;
    sessions.logout(device_id).await;
    Ok(())
}
