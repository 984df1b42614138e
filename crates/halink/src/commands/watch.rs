//! `halink watch`: stream matching events as JSON lines.

use std::io::Write;

use halink_core::{Category, EventFilter, Session};

use crate::cli::WatchArgs;
use crate::error::CliError;

pub async fn handle(session: &Session, args: WatchArgs) -> Result<(), CliError> {
    let filter = EventFilter::parse(&args.filter)?.with_category(Category::new(args.category));
    tracing::info!(%filter, "watching");

    let mut events = session.subscribe(filter).await?;
    let mut seen = 0usize;
    let mut stdout = std::io::stdout();

    loop {
        if args.limit.is_some_and(|limit| seen >= limit) {
            break;
        }

        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            // Stream ended without our asking: the session is gone.
            return Err(CliError::ConnectionLost {
                reason: "event stream ended".into(),
            });
        };

        if args.payload_only {
            serde_json::to_writer(&mut stdout, event.payload.as_ref())?;
        } else {
            serde_json::to_writer(&mut stdout, event.as_ref())?;
        }
        writeln!(stdout)?;
        stdout.flush()?;
        seen += 1;
    }

    if events.dropped() > 0 {
        tracing::warn!(dropped = events.dropped(), "output fell behind, some events were dropped");
    }
    Ok(())
}
