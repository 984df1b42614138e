//! `halink call`: send one command, print its result.

use serde_json::{Map, Value};

use halink_core::{CoreError, Request, Session};

use crate::cli::CallArgs;
use crate::error::CliError;

pub async fn handle(session: &Session, args: CallArgs) -> Result<(), CliError> {
    let request = build_request(&args)?;
    let result = session.call(request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn build_request(args: &CallArgs) -> Result<Request, CliError> {
    let mut payload = match args.data.as_deref() {
        Some(raw) => match serde_json::from_str::<Value>(raw)? {
            Value::Object(fields) => fields,
            _ => {
                return Err(CliError::Validation {
                    field: "--data".into(),
                    reason: "must be a JSON object".into(),
                });
            }
        },
        None => Map::new(),
    };
    payload.insert("type".into(), Value::String(args.kind.clone()));

    Request::from_value(Value::Object(payload)).map_err(|e| CoreError::from(e).into())
}
