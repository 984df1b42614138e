// In-process stand-in for the backend's WebSocket API.
//
// Speaks just enough of the protocol for session tests: the auth
// handshake, `subscribe_events` / `unsubscribe_events`, `ping`, and two
// test commands (`echo`, answered after an optional `delay_ms`, and
// `silent`, never answered). Events are pushed to every matching
// subscription on the current socket, tagged with the subscription id
// unless tagging is switched off, in which case one untagged frame goes
// out per event.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use halink_core::{ReconnectPolicy, SessionConfig};

pub const TOKEN: &str = "test-token";

enum Control {
    Emit(Value),
    Send(String),
    Drop,
}

#[derive(Default)]
struct Shared {
    connections: AtomicUsize,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    accepting: AtomicBool,
    ignore_pings: AtomicBool,
    tag_events: AtomicBool,
    /// delay before a successful `subscribe_events` result is sent
    subscribe_delay_ms: AtomicU64,
    rejected: Mutex<HashSet<String>>,
    /// subscription id → category on the current socket
    active: Mutex<HashMap<u64, String>>,
    current: Mutex<Option<mpsc::UnboundedSender<Control>>>,
}

pub struct MockBackend {
    pub url: Url,
    shared: Arc<Shared>,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());
        shared.accepting.store(true, Ordering::SeqCst);
        shared.tag_events.store(true, Ordering::SeqCst);

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if !accept_shared.accepting.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                tokio::spawn(serve(stream, Arc::clone(&accept_shared)));
            }
        });

        Self {
            url: Url::parse(&format!("ws://{addr}/api/websocket")).unwrap(),
            shared,
        }
    }

    /// Session config with short timeouts and fast reconnects.
    pub fn config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.url.clone(), SecretString::from(TOKEN.to_string()));
        config.request_timeout = Duration::from_secs(2);
        config.connect_timeout = Duration::from_secs(2);
        config.auth_timeout = Duration::from_secs(2);
        config.reconnect = ReconnectPolicy {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(200),
            max_retries: None,
            resubscribe_attempts: 3,
        };
        config
    }

    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn subscribes(&self) -> usize {
        self.shared.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.shared.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn active_subscriptions(&self) -> usize {
        self.shared.active.lock().unwrap().len()
    }

    pub fn reject_category(&self, category: &str) {
        self.shared.rejected.lock().unwrap().insert(category.to_owned());
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn ignore_pings(&self, ignore: bool) {
        self.shared.ignore_pings.store(ignore, Ordering::SeqCst);
    }

    /// Whether events carry their subscription id. Some backends omit it.
    pub fn tag_events(&self, tag: bool) {
        self.shared.tag_events.store(tag, Ordering::SeqCst);
    }

    /// Hold back successful `subscribe_events` results by `delay`.
    pub fn delay_subscribes(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap();
        self.shared.subscribe_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Push a `state_changed` event for `entity_id` to matching subscriptions.
    pub fn emit_state_changed(&self, entity_id: &str, state: &str) {
        self.emit(json!({
            "event_type": "state_changed",
            "time_fired": "2026-10-19T10:00:00+00:00",
            "origin": "LOCAL",
            "data": {
                "entity_id": entity_id,
                "new_state": { "entity_id": entity_id, "state": state }
            }
        }));
    }

    pub fn emit(&self, event: Value) {
        self.control(Control::Emit(event));
    }

    /// Send a raw text frame on the current socket.
    pub fn send_raw(&self, text: &str) {
        self.control(Control::Send(text.to_owned()));
    }

    /// Drop the current socket without a close frame.
    pub fn drop_connection(&self) {
        self.control(Control::Drop);
    }

    fn control(&self, control: Control) {
        if let Some(tx) = self.shared.current.lock().unwrap().as_ref() {
            let _ = tx.send(control);
        }
    }
}

/// Poll `condition` until it holds or `within` passes.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let (mut tx, mut rx) = ws.split();

    let greeting = json!({ "type": "auth_required", "ha_version": "2026.10.0" });
    if tx.send(Message::text(greeting.to_string())).await.is_err() {
        return;
    }
    let Some(Ok(Message::Text(text))) = rx.next().await else {
        return;
    };
    let auth: Value = serde_json::from_str(text.as_str()).unwrap_or(Value::Null);
    if auth["access_token"] != TOKEN {
        let verdict = json!({ "type": "auth_invalid", "message": "Invalid access token" });
        let _ = tx.send(Message::text(verdict.to_string())).await;
        let _ = tx.close().await;
        return;
    }
    let verdict = json!({ "type": "auth_ok", "ha_version": "2026.10.0" });
    if tx.send(Message::text(verdict.to_string())).await.is_err() {
        return;
    }

    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    shared.active.lock().unwrap().clear();
    *shared.current.lock().unwrap() = Some(control_tx.clone());

    loop {
        tokio::select! {
            control = control_rx.recv() => match control {
                Some(Control::Emit(event)) => {
                    let event_type = event["event_type"].as_str().unwrap_or_default().to_owned();
                    let targets: Vec<u64> = shared
                        .active
                        .lock()
                        .unwrap()
                        .iter()
                        .filter(|(_, category)| *category == "*" || **category == event_type)
                        .map(|(id, _)| *id)
                        .collect();
                    let frames: Vec<Value> = if shared.tag_events.load(Ordering::SeqCst) {
                        targets
                            .into_iter()
                            .map(|id| json!({ "id": id, "type": "event", "event": event }))
                            .collect()
                    } else if targets.is_empty() {
                        Vec::new()
                    } else {
                        vec![json!({ "type": "event", "event": event })]
                    };
                    for frame in frames {
                        if tx.send(Message::text(frame.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Control::Send(text)) => {
                    let _ = tx.send(Message::text(text)).await;
                }
                Some(Control::Drop) | None => break,
            },
            message = rx.next() => {
                let Some(Ok(Message::Text(text))) = message else { break };
                let Ok(command) = serde_json::from_str::<Value>(text.as_str()) else { continue };
                if let Some(reply) = handle_command(&command, &shared, &control_tx) {
                    if tx.send(Message::text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    shared.active.lock().unwrap().clear();
}

fn handle_command(
    command: &Value,
    shared: &Shared,
    control: &mpsc::UnboundedSender<Control>,
) -> Option<Value> {
    let id = command["id"].as_u64()?;
    match command["type"].as_str()? {
        "subscribe_events" => {
            shared.subscribes.fetch_add(1, Ordering::SeqCst);
            let category = command["event_type"].as_str().unwrap_or("*").to_owned();
            if shared.rejected.lock().unwrap().contains(&category) {
                return Some(failure(id, "not_allowed", "Subscription not allowed"));
            }
            shared.active.lock().unwrap().insert(id, category);
            let reply = success(id, Value::Null);
            match shared.subscribe_delay_ms.load(Ordering::SeqCst) {
                0 => Some(reply),
                delay => {
                    reply_later(control, reply, delay);
                    None
                }
            }
        }
        "unsubscribe_events" => {
            shared.unsubscribes.fetch_add(1, Ordering::SeqCst);
            let subscription = command["subscription"].as_u64().unwrap_or_default();
            if shared.active.lock().unwrap().remove(&subscription).is_some() {
                Some(success(id, Value::Null))
            } else {
                Some(failure(id, "not_found", "Subscription not found."))
            }
        }
        "ping" => {
            if shared.ignore_pings.load(Ordering::SeqCst) {
                None
            } else {
                Some(json!({ "id": id, "type": "pong" }))
            }
        }
        "echo" => {
            let reply = success(id, json!({ "echo": command["value"] }));
            match command["delay_ms"].as_u64() {
                Some(delay) => {
                    reply_later(control, reply, delay);
                    None
                }
                None => Some(reply),
            }
        }
        "silent" => None,
        _ => Some(failure(id, "unknown_command", "Unknown command.")),
    }
}

fn reply_later(control: &mpsc::UnboundedSender<Control>, reply: Value, delay_ms: u64) {
    let control = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let _ = control.send(Control::Send(reply.to_string()));
    });
}

fn success(id: u64, result: Value) -> Value {
    json!({ "id": id, "type": "result", "success": true, "result": result })
}

fn failure(id: u64, code: &str, message: &str) -> Value {
    json!({
        "id": id,
        "type": "result",
        "success": false,
        "error": { "code": code, "message": message }
    })
}
