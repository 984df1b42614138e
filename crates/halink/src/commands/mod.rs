//! Command dispatch for everything that needs a live session.

pub mod call;
pub mod config_cmd;
pub mod status;
pub mod watch;

use halink_core::{Session, SessionConfig};

use crate::cli::Command;
use crate::error::CliError;

pub async fn dispatch(cmd: Command, config: SessionConfig) -> Result<(), CliError> {
    let session = Session::connect(config).await?;

    let result = match cmd {
        Command::Watch(args) => watch::handle(&session, args).await,
        Command::Call(args) => call::handle(&session, args).await,
        Command::Status => status::handle(&session).await,
        Command::Config(_) | Command::Completions(_) => unreachable!("handled in main"),
    };

    session.close().await;
    result
}
