// ── Session actor ──
//
// The one task that owns the upstream connection and everything keyed to
// it: pending requests, the subscription registry, the consumer table and
// the reconnection controller. Handles talk to it through `Command`s, so
// none of that state is shared.
//
// Life of the actor: serve one connection epoch until the socket is lost,
// fail what was in flight, back off and reconnect (still serving commands
// while offline), re-arm subscriptions, repeat. It stops on `close()`,
// when every handle is gone, or when reconnection gives up.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use halink_api::connection::millis;
use halink_api::{Category, EventEnvelope, Inbound, Request, Response, UpstreamConnection};

use crate::config::SessionConfig;
use crate::correlator::{CallReply, Completion, Correlator, Settled, Task};
use crate::error::CoreError;
use crate::fanout::{FanoutManager, Registration};
use crate::reconnect::ReconnectController;
use crate::registry::{Ensure, Registry, Rejected, Release, Subscribed};

use super::SessionStats;
use super::command::{Command, QueuedCall};

/// Why a connection epoch ended.
enum EpochEnd {
    Lost(CoreError),
    Stopped,
}

/// How a recovery attempt ended.
enum Recovery {
    /// A fresh socket is up; these commands arrived during the handshake.
    Reconnected(Vec<Command>),
    Stopped,
    GaveUp(CoreError),
}

pub(crate) struct SessionActor {
    connection: UpstreamConnection,
    correlator: Correlator,
    registry: Registry,
    fanout: FanoutManager,
    reconnect: ReconnectController,
    outbox: VecDeque<QueuedCall>,
    commands: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    fatal: Arc<OnceLock<CoreError>>,
    request_timeout: Duration,
    heartbeat_interval: Option<Duration>,
    /// Set when a write fails; ends the current epoch.
    link_error: Option<CoreError>,
}

impl SessionActor {
    pub(crate) fn new(
        connection: UpstreamConnection,
        commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
        fatal: Arc<OnceLock<CoreError>>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            connection,
            correlator: Correlator::new(),
            registry: Registry::new(),
            fanout: FanoutManager::new(),
            reconnect: ReconnectController::new(config.reconnect.clone()),
            outbox: VecDeque::new(),
            commands,
            cancel,
            fatal,
            request_timeout: config.request_timeout,
            heartbeat_interval: config.heartbeat_interval,
            link_error: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut deferred = Vec::new();
        let exit = loop {
            let lost = match self.serve_epoch(std::mem::take(&mut deferred)).await {
                EpochEnd::Lost(err) => err,
                EpochEnd::Stopped => break None,
            };
            self.on_connection_lost(&lost);
            match self.recover(lost).await {
                Recovery::Reconnected(commands) => deferred = commands,
                Recovery::Stopped => break None,
                Recovery::GaveUp(err) => break Some(err),
            }
        };
        self.shutdown(exit).await;
    }

    // ── Connected ────────────────────────────────────────────────

    async fn serve_epoch(&mut self, deferred: Vec<Command>) -> EpochEnd {
        self.begin_epoch(deferred).await;
        let mut heartbeat = self.heartbeat_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            if let Some(err) = self.link_error.take() {
                return EpochEnd::Lost(err);
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return EpochEnd::Stopped,
                batch = self.connection.recv() => match batch {
                    Ok(batch) => {
                        for inbound in batch {
                            self.on_inbound(inbound).await;
                        }
                    }
                    Err(e) => return EpochEnd::Lost(CoreError::from(e)),
                },
                id = self.correlator.next_expired() => {
                    let settled = self.correlator.expire(id);
                    self.on_settled(settled).await;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => return EpochEnd::Stopped,
                },
                () = tick(&mut heartbeat) => self.send_heartbeat().await,
            }
        }
    }

    /// Re-arm subscriptions and drain work queued while offline.
    async fn begin_epoch(&mut self, deferred: Vec<Command>) {
        let targets = self.registry.rearm_targets();
        if !targets.is_empty() {
            self.reconnect.resubscribing();
            info!(count = targets.len(), "re-arming subscriptions");
        }
        for category in targets {
            self.send_subscribe(&category, 1).await;
        }
        self.flush_outbox().await;
        for command in deferred {
            self.on_command(command).await;
        }
        self.try_finish_rearm();
    }

    /// Report `Connected` once every subscription has its upstream id
    /// (or is degraded).
    fn try_finish_rearm(&mut self) {
        if self.connection.state().is_connected()
            || !self.connection.is_open()
            || self.link_error.is_some()
            || !self.registry.is_settled()
        {
            return;
        }
        self.connection.mark_connected();
        self.reconnect.settled();
    }

    async fn flush_outbox(&mut self) {
        let now = Instant::now();
        while let Some(queued) = self.outbox.pop_front() {
            if queued.reply.is_closed() {
                continue;
            }
            let remaining = queued.deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                let _ = queued.reply.send(Err(CoreError::Timeout {
                    timeout_ms: millis(queued.timeout),
                }));
                continue;
            }
            self.send_request(&queued.request, Completion::Caller(queued.reply), remaining)
                .await;
        }
    }

    async fn on_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Response(response) => self.on_response(response).await,
            Inbound::Event(event) => self.on_event(event),
            Inbound::AuthRequired { .. } | Inbound::AuthOk { .. } | Inbound::AuthInvalid { .. } => {
                debug!("ignoring handshake message on an authenticated socket");
            }
        }
    }

    async fn on_response(&mut self, response: Response) {
        let outcome = if response.success {
            Ok(response.result)
        } else {
            let (code, message) = response.error.map_or_else(
                || ("unknown_error".to_owned(), "request failed".to_owned()),
                |e| (e.code, e.message),
            );
            Err(CoreError::Upstream { code, message })
        };
        let settled = self.correlator.resolve(response.id, outcome);
        self.on_settled(settled).await;
    }

    fn on_event(&mut self, event: EventEnvelope) {
        let routed = match event.subscription {
            Some(id) => match self.registry.category_for(id) {
                Some(category) => Some(category.clone()),
                None => {
                    debug!(
                        subscription = id,
                        event_type = %event.header.event_type,
                        "dropping event for unknown subscription"
                    );
                    return;
                }
            },
            None => None,
        };
        let event = Arc::new(event);
        let delivered = self.fanout.dispatch(&event, routed.as_ref());
        trace!(
            event_type = %event.header.event_type,
            entity_id = ?event.header.entity_id,
            delivered,
            "event dispatched"
        );
    }

    async fn on_settled(&mut self, settled: Settled) {
        let Settled::Internal { id, task, outcome } = settled else {
            return;
        };
        match task {
            Task::Subscribe(category) => self.on_subscribe_settled(category, id, outcome).await,
            Task::Unsubscribe(subscription) => {
                if let Err(e) = outcome {
                    debug!(subscription, error = %e, "unsubscribe failed (ignored)");
                }
            }
            Task::Heartbeat => match outcome {
                Ok(_) => trace!("heartbeat answered"),
                Err(CoreError::Timeout { timeout_ms }) => {
                    warn!(timeout_ms, "heartbeat unanswered, treating socket as dead");
                    if self.link_error.is_none() {
                        self.link_error = Some(CoreError::ConnectionFailed {
                            reason: format!("heartbeat unanswered after {timeout_ms}ms"),
                        });
                    }
                }
                Err(e) => debug!(error = %e, "heartbeat failed"),
            },
        }
    }

    async fn on_subscribe_settled(
        &mut self,
        category: Category,
        id: u64,
        outcome: Result<Value, CoreError>,
    ) {
        match outcome {
            Ok(_) => match self.registry.on_subscribed(&category, id) {
                Subscribed::Activated => {
                    let abandoned = self.fanout.activate(&category);
                    for _ in 0..abandoned {
                        self.release(&category).await;
                    }
                    self.try_finish_rearm();
                }
                Subscribed::Stale => {
                    debug!(%category, subscription = id, "subscription no longer wanted, cancelling");
                    self.send_request(
                        &Request::unsubscribe_events(id),
                        Completion::Internal(Task::Unsubscribe(id)),
                        self.request_timeout,
                    )
                    .await;
                    self.try_finish_rearm();
                }
            },
            Err(err) => {
                let budget = self.reconnect.policy().resubscribe_attempts;
                match self.registry.on_rejected(&category, id, budget) {
                    Rejected::Dropped => {
                        let message = match err {
                            CoreError::Upstream { message, .. } => message,
                            other => other.to_string(),
                        };
                        warn!(%category, %message, "upstream refused subscription");
                        let err = CoreError::Subscription {
                            category: category.to_string(),
                            message,
                        };
                        self.fanout.reject(&category, &err);
                        self.try_finish_rearm();
                    }
                    Rejected::Retry { attempt } => {
                        debug!(%category, attempt, error = %err, "re-subscribe failed, retrying");
                        self.send_subscribe(&category, attempt).await;
                    }
                    Rejected::Degraded | Rejected::Stale => self.try_finish_rearm(),
                }
            }
        }
    }

    async fn send_heartbeat(&mut self) {
        if self.connection.is_open() {
            self.send_request(
                &Request::ping(),
                Completion::Internal(Task::Heartbeat),
                self.request_timeout,
            )
            .await;
        }
    }

    // ── Commands (online or offline) ─────────────────────────────

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Call {
                request,
                timeout,
                reply,
            } => self.start_call(request, timeout, reply).await,
            Command::Subscribe { registration } => self.on_subscribe(registration).await,
            Command::Unsubscribe { consumer } => {
                if let Some(category) = self.fanout.remove(consumer) {
                    self.release(&category).await;
                }
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    async fn start_call(&mut self, request: Request, timeout: Duration, reply: CallReply) {
        if reply.is_closed() {
            return;
        }
        if self.connection.is_open() {
            self.send_request(&request, Completion::Caller(reply), timeout)
                .await;
        } else {
            self.outbox.retain(|queued| !queued.reply.is_closed());
            debug!(kind = request.kind(), queued = self.outbox.len() + 1, "upstream down, queueing call");
            self.outbox.push_back(QueuedCall {
                request,
                timeout,
                deadline: Instant::now() + timeout,
                reply,
            });
        }
    }

    async fn on_subscribe(&mut self, registration: Registration) {
        let category = registration.category().clone();
        match self.registry.ensure(&category, self.connection.is_open()) {
            Ensure::Ready => {
                if !self.fanout.add_live(registration) {
                    self.release(&category).await;
                }
            }
            Ensure::Subscribe => {
                self.fanout.park(registration);
                self.send_subscribe(&category, 1).await;
            }
            Ensure::Wait => self.fanout.park(registration),
        }
    }

    async fn release(&mut self, category: &Category) {
        match self.registry.release(category) {
            Release::Retained | Release::Dropped => {}
            Release::Unsubscribe(upstream_id) => {
                if self.connection.is_open() {
                    self.send_request(
                        &Request::unsubscribe_events(upstream_id),
                        Completion::Internal(Task::Unsubscribe(upstream_id)),
                        self.request_timeout,
                    )
                    .await;
                }
            }
        }
        // A removed entry may have been the last one a re-arm was waiting on.
        self.try_finish_rearm();
    }

    async fn send_subscribe(&mut self, category: &Category, attempt: u32) {
        let id = self
            .send_request(
                &Request::subscribe_events(category),
                Completion::Internal(Task::Subscribe(category.clone())),
                self.request_timeout,
            )
            .await;
        self.registry.mark_requested(category, id, attempt);
    }

    /// Register and write one request. A failed write ends the epoch; the
    /// request stays pending and is failed with the rest.
    async fn send_request(
        &mut self,
        request: &Request,
        completion: Completion,
        timeout: Duration,
    ) -> u64 {
        let id = self.correlator.register(completion, timeout);
        if let Err(e) = self.connection.send(id, request).await {
            warn!(id, kind = request.kind(), error = %e, "upstream write failed");
            if self.link_error.is_none() {
                self.link_error = Some(CoreError::from(e));
            }
        }
        id
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.connection.state(),
            phase: self.reconnect.phase(),
            pending_requests: self.correlator.len(),
            queued_calls: self.outbox.len(),
            subscriptions: self.registry.snapshot(),
            consumers: self.fanout.snapshot(),
        }
    }

    // ── Offline ──────────────────────────────────────────────────

    fn on_connection_lost(&mut self, reason: &CoreError) {
        warn!(error = %reason, "upstream connection lost");
        self.connection.mark_lost(self.reconnect.attempt() + 1);
        self.link_error = None;
        // Internal continuations are void with the socket; re-arm
        // reissues what is still wanted.
        let _ = self.correlator.fail_all(&CoreError::ConnectionClosed);
        self.registry.unbind_all();
    }

    async fn recover(&mut self, mut last_error: CoreError) -> Recovery {
        loop {
            let Some(delay) = self.reconnect.next_delay() else {
                return Recovery::GaveUp(CoreError::ConnectionLost {
                    reason: format!(
                        "gave up after {} reconnect attempts: {last_error}",
                        self.reconnect.attempt()
                    ),
                });
            };
            let attempt = self.reconnect.attempt();
            self.connection.mark_lost(attempt);
            info!(attempt, delay_ms = millis(delay), "waiting before reconnect");

            if !self.wait_offline(delay).await {
                return Recovery::Stopped;
            }

            self.reconnect.connecting();
            let mut deferred = Vec::new();
            let result = {
                let handshake = self.connection.reconnect(attempt);
                tokio::pin!(handshake);
                loop {
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Recovery::Stopped,
                        result = &mut handshake => break result,
                        Some(command) = self.commands.recv() => deferred.push(command),
                    }
                }
            };

            match result {
                Ok(info) => {
                    info!(attempt, ha_version = ?info.ha_version, "upstream reconnected");
                    return Recovery::Reconnected(deferred);
                }
                Err(e) if e.is_auth_failure() => {
                    error!(attempt, error = %e, "credentials rejected during reconnect");
                    return Recovery::GaveUp(CoreError::ConnectionLost {
                        reason: format!("credentials rejected during reconnect: {e}"),
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = CoreError::from(e);
                    for command in deferred {
                        self.on_command(command).await;
                    }
                }
            }
        }
    }

    /// Sleep out a backoff delay while still serving commands. Returns
    /// `false` if the session was stopped meanwhile.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => return false,
                },
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────

    async fn shutdown(mut self, gave_up: Option<CoreError>) {
        let err = match gave_up {
            Some(err) => {
                self.reconnect.give_up();
                error!(error = %err, "session unusable");
                let _ = self.fatal.set(err.clone());
                err
            }
            None => CoreError::ConnectionClosed,
        };
        self.cancel.cancel();

        let _ = self.correlator.fail_all(&err);
        for queued in self.outbox.drain(..) {
            let _ = queued.reply.send(Err(err.clone()));
        }
        self.fanout.close_all(&err);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.refuse(&err);
        }

        self.connection.close().await;
        info!("session stopped");
    }
}

/// Next heartbeat tick, or never when heartbeats are off.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
