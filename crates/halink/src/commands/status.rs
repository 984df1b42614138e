//! `halink status`: connect, report, disconnect.

use serde_json::json;

use halink_core::Session;

use crate::error::CliError;

pub async fn handle(session: &Session) -> Result<(), CliError> {
    let stats = session.stats().await?;
    let report = json!({
        "ha_version": session.handshake().ha_version,
        "state": stats.state,
        "phase": stats.phase,
        "pending_requests": stats.pending_requests,
        "subscriptions": stats.subscriptions,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
