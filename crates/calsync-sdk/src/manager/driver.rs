//! Session driver
//!
//! One task owns everything time-driven: the transport inbound channel, ack
//! timers, retry deadlines, the reconnect backoff and the heartbeat. Public
//! calls on the manager only mutate shared state under short locks and nudge
//! this loop through the command channel.
//!
//! The driver holds a weak reference to the shared state; once every manager
//! handle is gone the command channel closes and the loop ends.

use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

use super::Shared;
use crate::connection_state::ConnectionStatus;
use crate::error::CalsyncError;
use crate::events::SDKEvent;
use crate::protocol::{
    event_types, AckPayload, CalendarUpdateEvent, HeartbeatPayload, NackPayload, ProjectUpdateEvent,
    RealtimeEvent, ResourceUpdate, UpdateAction,
};
use crate::queue::{FailureOutcome, ResourceKey};
use crate::reconnect::{ReconnectController, ReconnectStep};
use crate::subscription::Topic;
use crate::sync::{LocalEdit, LocalResource, Resolution};
use crate::transport::{ConnectParams, TransportEvent};
use crate::utils::now_millis;
use crate::version::user_agent;

const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);

pub(crate) enum Command {
    /// Start connecting with a fresh reconnect budget; `done` fires once the
    /// first attempt settled
    Connect { done: oneshot::Sender<()> },
    /// New work in the queue
    Flush,
    Subscribe(Topic),
    Unsubscribe(Topic),
}

pub(crate) struct DriverHandle {
    pub(crate) commands: mpsc::UnboundedSender<Command>,
    pub(crate) task: JoinHandle<()>,
}

enum Step {
    Command(Option<Command>),
    Inbound(Option<TransportEvent>),
    AckTimeout(String),
    ReconnectDue,
    Heartbeat,
    RetryDue,
    Housekeeping,
}

pub(crate) struct Driver {
    shared: Weak<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    reconnect: ReconnectController,
    /// Present while connected
    inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    ack_timers: DelayQueue<String>,
    ack_keys: HashMap<String, delay_queue::Key>,
    reconnect_at: Option<Instant>,
    next_heartbeat: Option<Instant>,
    /// Topics subscribed on the current connection
    announced: HashSet<Topic>,
    housekeeping: Interval,
}

impl Driver {
    pub(crate) fn spawn(shared: &Arc<Shared>) -> DriverHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_PERIOD);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let driver = Driver {
            shared: Arc::downgrade(shared),
            commands: commands_rx,
            reconnect: ReconnectController::new(shared.config.reconnect_config.clone()),
            inbound: None,
            ack_timers: DelayQueue::new(),
            ack_keys: HashMap::new(),
            reconnect_at: None,
            next_heartbeat: None,
            announced: HashSet::new(),
            housekeeping,
        };
        DriverHandle {
            commands: commands_tx,
            task: tokio::spawn(driver.run()),
        }
    }

    async fn run(mut self) {
        debug!("session driver started");
        loop {
            let retry_deadline = {
                let Some(shared) = self.shared.upgrade() else { break };
                self.retry_deadline(&shared)
            };

            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                event = recv_inbound(&mut self.inbound) => Step::Inbound(event),
                Some(expired) = self.ack_timers.next(), if !self.ack_timers.is_empty() => {
                    Step::AckTimeout(expired.into_inner())
                }
                _ = sleep_until_opt(self.reconnect_at) => Step::ReconnectDue,
                _ = sleep_until_opt(self.next_heartbeat) => Step::Heartbeat,
                _ = sleep_until_opt(retry_deadline) => Step::RetryDue,
                _ = self.housekeeping.tick() => Step::Housekeeping,
            };

            let Some(shared) = self.shared.upgrade() else { break };
            let keep_running = self.handle(&shared, step).await;
            self.publish_reconnect_stats(&shared);
            if !keep_running {
                break;
            }
        }
        debug!("session driver stopped");
    }

    /// Returns `false` when the loop should end
    async fn handle(&mut self, shared: &Arc<Shared>, step: Step) -> bool {
        match step {
            Step::Command(None) => return false,
            Step::Command(Some(command)) => self.on_command(shared, command).await,
            Step::Inbound(Some(TransportEvent::Message(event))) => self.on_message(shared, event).await,
            Step::Inbound(Some(TransportEvent::Error(error))) => shared.report_error(error),
            Step::Inbound(Some(TransportEvent::Closed { reason })) => self.on_link_lost(shared, reason).await,
            Step::Inbound(None) => self.on_link_lost(shared, "transport channel closed".to_string()).await,
            Step::AckTimeout(item_id) => {
                self.ack_keys.remove(&item_id);
                let attempts = shared.queue.lock().get(&item_id).map(|item| item.retry_count + 1).unwrap_or(1);
                warn!("no ack for {} (attempt {})", item_id, attempts);
                self.fail_item(shared, &item_id, CalsyncError::SendTimeout { item_id: item_id.clone(), attempts });
                self.pump(shared).await;
            }
            Step::ReconnectDue => {
                self.reconnect_at = None;
                self.open(shared).await;
            }
            Step::Heartbeat => self.heartbeat(shared).await,
            Step::RetryDue => self.pump(shared).await,
            Step::Housekeeping => {
                let pruned = shared.queue.lock().prune(Instant::now());
                if pruned > 0 {
                    shared.emit_queue_snapshot();
                }
            }
        }
        true
    }

    fn publish_reconnect_stats(&self, shared: &Shared) {
        *shared.reconnect_stats.lock() = self.reconnect.stats();
    }

    fn retry_deadline(&self, shared: &Shared) -> Option<Instant> {
        if self.inbound.is_none() {
            return None;
        }
        let queue = shared.queue.lock();
        if queue.processing_count() >= shared.config.queue_config.max_in_flight {
            return None;
        }
        queue.next_retry_deadline(Instant::now())
    }

    // ========== Commands ==========

    async fn on_command(&mut self, shared: &Arc<Shared>, command: Command) {
        match command {
            Command::Connect { done } => {
                self.reconnect.reset();
                self.reconnect_at = None;
                if self.inbound.is_none() {
                    self.open(shared).await;
                } else {
                    shared.transition(ConnectionStatus::Connected);
                }
                self.publish_reconnect_stats(shared);
                let _ = done.send(());
            }
            Command::Flush => self.pump(shared).await,
            Command::Subscribe(topic) => {
                let wanted = shared.subscriptions.lock().contains(&topic);
                if self.inbound.is_some() && wanted && !self.announced.contains(&topic) {
                    if self.send_frame(shared, RealtimeEvent::subscribe(&topic)).await {
                        self.announced.insert(topic);
                    }
                }
            }
            Command::Unsubscribe(topic) => {
                let wanted = shared.subscriptions.lock().contains(&topic);
                if self.inbound.is_some() && !wanted && self.announced.remove(&topic) {
                    self.send_frame(shared, RealtimeEvent::unsubscribe(&topic)).await;
                }
            }
        }
    }

    // ========== Connection lifecycle ==========

    async fn open(&mut self, shared: &Arc<Shared>) {
        self.reconnect.begin_attempt();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let params = ConnectParams {
            url: shared.config.server_url.clone(),
            auth_token: shared.config.auth_token.clone(),
            user_agent: user_agent(),
            timeout: shared.config.connection_timeout(),
        };

        let timeout = shared.config.connection_timeout();
        let result = match tokio::time::timeout(timeout, shared.transport.open(&params, events_tx)).await {
            Ok(result) => result,
            Err(_) => Err(CalsyncError::Transport(format!("open timed out after {:?}", timeout))),
        };

        match result {
            Ok(()) => self.on_connected(shared, events_rx).await,
            Err(error) => {
                warn!("open failed: {}", error);
                shared.transition(ConnectionStatus::Error);
                shared.report_error(error.clone());
                if error.is_retryable() {
                    self.schedule_reconnect(shared);
                } else {
                    error!("not retrying after {} error", error.kind());
                }
            }
        }
    }

    async fn on_connected(&mut self, shared: &Arc<Shared>, events: mpsc::UnboundedReceiver<TransportEvent>) {
        info!("connected to {}", shared.config.server_url);
        self.inbound = Some(events);
        self.reconnect.mark_connected();
        shared.transition(ConnectionStatus::Connected);
        self.next_heartbeat = Some(Instant::now() + shared.config.heartbeat_interval());

        // the server forgets subscriptions with the connection
        self.announced.clear();
        let topics = shared.subscriptions.lock().topics();
        for topic in topics {
            if !self.send_frame(shared, RealtimeEvent::subscribe(&topic)).await {
                return;
            }
            self.announced.insert(topic);
        }

        self.pump(shared).await;
    }

    async fn on_link_lost(&mut self, shared: &Arc<Shared>, reason: String) {
        if self.inbound.take().is_none() {
            return;
        }
        warn!("connection lost: {}", reason);
        debug!("{}", shared.state.get_state().summary());

        self.ack_timers.clear();
        self.ack_keys.clear();
        self.next_heartbeat = None;
        self.announced.clear();

        let requeued = shared.queue.lock().requeue_in_flight();
        if !requeued.is_empty() {
            shared.emit_queue_snapshot();
        }

        shared.transport.close().await;
        shared.report_error(CalsyncError::Transport(reason));
        self.schedule_reconnect(shared);
    }

    fn schedule_reconnect(&mut self, shared: &Arc<Shared>) {
        match self.reconnect.on_failure() {
            ReconnectStep::RetryAfter { attempt, delay } => {
                debug!("reconnect #{} scheduled in {:?}", attempt, delay);
                self.reconnect_at = Some(Instant::now() + delay);
                shared.transition(ConnectionStatus::Reconnecting);
            }
            ReconnectStep::GiveUp { attempts } => {
                self.reconnect_at = None;
                shared.transition(ConnectionStatus::Error);
                shared.report_error(CalsyncError::ReconnectExhausted { attempts });
            }
        }
    }

    async fn heartbeat(&mut self, shared: &Arc<Shared>) {
        if self.inbound.is_none() {
            self.next_heartbeat = None;
            return;
        }
        let tick = shared.state.heartbeat_tick();
        if tick.missed >= shared.config.heartbeat_config.max_missed {
            self.on_link_lost(shared, format!("{} heartbeat(s) unanswered", tick.missed)).await;
            return;
        }
        self.next_heartbeat = Some(Instant::now() + shared.config.heartbeat_interval());
        self.send_frame(shared, RealtimeEvent::ping(tick.nonce)).await;
    }

    /// Sends a control frame; a failure takes the link down
    async fn send_frame(&mut self, shared: &Arc<Shared>, frame: RealtimeEvent) -> bool {
        let frame = match shared.config.user_id {
            Some(ref user_id) => frame.with_user(user_id.clone()),
            None => frame,
        };
        match shared.transport.send(&frame).await {
            Ok(()) => {
                shared.state.increment_sent();
                true
            }
            Err(error) => {
                warn!("failed to send {}: {}", frame.event_type, error);
                self.on_link_lost(shared, error.to_string()).await;
                false
            }
        }
    }

    // ========== Sync queue ==========

    /// Transmit eligible items until the queue or the in-flight window is exhausted
    async fn pump(&mut self, shared: &Arc<Shared>) {
        let ack_timeout = shared.config.ack_timeout();
        while self.inbound.is_some() {
            let item = {
                let mut queue = shared.queue.lock();
                if queue.processing_count() >= shared.config.queue_config.max_in_flight {
                    break;
                }
                match queue.next_pending(Instant::now()) {
                    Some(item) => item,
                    None => break,
                }
            };
            shared.emit_queue_snapshot();

            let frame = item.to_frame(shared.config.user_id.as_deref());
            match shared.transport.send(&frame).await {
                Ok(()) => {
                    shared.state.increment_sent();
                    debug!("sent {} {} (attempt {})", item.item_type.event_type(), item.id, item.retry_count + 1);
                    let key = self.ack_timers.insert(item.id.clone(), ack_timeout);
                    self.ack_keys.insert(item.id, key);
                }
                Err(error) => {
                    warn!("failed to send {}: {}", item.id, error);
                    let link_problem = error.is_retryable();
                    self.fail_item(shared, &item.id, error.clone());
                    if link_problem {
                        self.on_link_lost(shared, error.to_string()).await;
                        break;
                    }
                }
            }
        }
    }

    fn cancel_ack_timer(&mut self, item_id: &str) {
        if let Some(key) = self.ack_keys.remove(item_id) {
            self.ack_timers.remove(&key);
        }
    }

    fn complete_item(&mut self, shared: &Arc<Shared>, item_id: &str, version: Option<u64>) {
        self.cancel_ack_timer(item_id);
        let completed = shared.queue.lock().mark_completed(item_id, Instant::now());
        let Some(item) = completed else {
            debug!("ack for unknown or finished item {}", item_id);
            return;
        };

        if let Some(version) = version {
            let deleted = item.action == UpdateAction::Delete;
            shared.versions.store(LocalResource {
                resource_type: item.resource.resource_type,
                resource_id: item.resource.resource_id.clone(),
                version,
                data: if deleted { serde_json::Value::Null } else { item.data().clone() },
                updated_at: item.timestamp,
                updated_by: shared.config.user_id.clone(),
                deleted,
            });
        }

        shared.emit_queue_snapshot();
        let item_id = item.id.clone();
        shared.resolve_waiter(&item_id, Ok(item));
    }

    fn fail_item(&mut self, shared: &Arc<Shared>, item_id: &str, error: CalsyncError) {
        self.cancel_ack_timer(item_id);
        let outcome = shared.queue.lock().mark_failed(
            item_id,
            &error,
            &shared.config.retry_config,
            Instant::now(),
        );

        match outcome {
            None => debug!("late failure report for {} ignored", item_id),
            Some(FailureOutcome::Retrying { .. }) => shared.emit_queue_snapshot(),
            Some(FailureOutcome::Failed(item)) => {
                shared.emit_queue_snapshot();
                let final_error = match error {
                    CalsyncError::SendTimeout { .. } => CalsyncError::SendTimeout {
                        item_id: item.id.clone(),
                        attempts: item.retry_count,
                    },
                    CalsyncError::SendFailed { .. } => error,
                    other => CalsyncError::SendFailed {
                        item_id: item.id.clone(),
                        reason: other.to_string(),
                    },
                };
                error!("sync item {} failed: {}", item.id, final_error);
                shared.report_error(final_error.clone());
                shared.resolve_waiter(&item.id, Err(final_error));
            }
        }
    }

    // ========== Inbound ==========

    async fn on_message(&mut self, shared: &Arc<Shared>, event: RealtimeEvent) {
        shared.state.increment_received();
        let envelope_version = event.version;
        match event.event_type.as_str() {
            event_types::ACK => match serde_json::from_value::<AckPayload>(event.payload) {
                Ok(ack) => {
                    // the committed version may ride in the payload or the envelope
                    self.complete_item(shared, &ack.id, ack.version.or(envelope_version));
                    self.pump(shared).await;
                }
                Err(e) => shared.report_error(CalsyncError::InvalidData(format!("ack payload: {}", e))),
            },
            event_types::NACK => match serde_json::from_value::<NackPayload>(event.payload) {
                Ok(nack) => {
                    warn!("server rejected {}: {} (retryable: {})", nack.id, nack.reason, nack.retryable);
                    let error = if nack.retryable {
                        CalsyncError::Transport(format!("rejected by server: {}", nack.reason))
                    } else {
                        CalsyncError::SendFailed {
                            item_id: nack.id.clone(),
                            reason: nack.reason,
                        }
                    };
                    self.fail_item(shared, &nack.id, error);
                    self.pump(shared).await;
                }
                Err(e) => shared.report_error(CalsyncError::InvalidData(format!("nack payload: {}", e))),
            },
            event_types::PONG => {
                if let Ok(pong) = serde_json::from_value::<HeartbeatPayload>(event.payload) {
                    if let Some(latency) = shared.state.record_pong(pong.nonce) {
                        debug!("heartbeat latency {}ms", latency);
                    }
                }
            }
            event_types::PING => {
                if let Ok(ping) = serde_json::from_value::<HeartbeatPayload>(event.payload) {
                    self.send_frame(shared, RealtimeEvent::pong(ping.nonce)).await;
                }
            }
            event_types::CALENDAR_UPDATE | event_types::PROJECT_UPDATE => on_domain_event(shared, &event),
            other => debug!("ignoring {} frame", other),
        }
    }
}

fn on_domain_event(shared: &Shared, event: &RealtimeEvent) {
    let update = match ResourceUpdate::from_event(event) {
        Ok(Some(update)) => update,
        Ok(None) => return,
        Err(error) => {
            warn!("malformed {} event: {}", event.event_type, error);
            shared.report_error(error);
            return;
        }
    };

    let interested = shared.subscriptions.lock().is_interested(Some(&update.topic));
    if !interested {
        debug!("dropping {} for unsubscribed topic {}", event.event_type, update.topic);
        return;
    }

    let key = ResourceKey::new(update.resource_type, update.resource_id.clone());
    // our own write echoed back is not a concurrent edit
    let own_echo = update.user_id.is_some() && update.user_id == shared.config.user_id;
    let pending = if own_echo {
        None
    } else {
        let queue = shared.queue.lock();
        queue.latest_unfinished(&key).map(|item| LocalEdit {
            action: item.action,
            data: item.data().clone(),
            timestamp: item.timestamp,
            user_id: shared.config.user_id.clone(),
        })
    };
    let local = shared.versions.get(&key);

    match shared.resolver.resolve(local.as_ref(), pending.as_ref(), &update) {
        Resolution::Stale { local_version, inbound_version } => {
            debug!("stale {} v{} (local v{}) dropped", key, inbound_version, local_version);
        }
        Resolution::Apply(state) => {
            shared.versions.store(state);
            deliver(shared, event, None);
        }
        Resolution::Resolved { state, conflict } => {
            let resolved = (state.data.clone(), state.deleted);
            shared.versions.store(state);
            shared.events.emit(SDKEvent::ConflictDetected(conflict));
            deliver(shared, event, Some(resolved));
        }
        Resolution::NeedsManual(conflict) => {
            shared.manual_conflicts.lock().insert(key, conflict.clone());
            shared.events.emit(SDKEvent::ConflictDetected(conflict));
        }
    }
}

/// Fan a domain update out to subscribers, with resolved data when a
/// conflict changed what was applied
fn deliver(shared: &Shared, event: &RealtimeEvent, resolved: Option<(serde_json::Value, bool)>) {
    let resolve_action = |action: UpdateAction, deleted: bool| match (action, deleted) {
        (_, true) => UpdateAction::Delete,
        (UpdateAction::Delete, false) => UpdateAction::Update,
        (action, false) => action,
    };

    let sdk_event = match event.event_type.as_str() {
        event_types::CALENDAR_UPDATE => match CalendarUpdateEvent::from_event(event) {
            Ok(mut update) => {
                if let Some((data, deleted)) = resolved {
                    update.action = resolve_action(update.action, deleted);
                    update.data = data;
                }
                SDKEvent::CalendarUpdated(update)
            }
            Err(_) => return,
        },
        event_types::PROJECT_UPDATE => match ProjectUpdateEvent::from_event(event) {
            Ok(mut update) => {
                if let Some((data, deleted)) = resolved {
                    update.action = resolve_action(update.action, deleted);
                    update.data = data;
                }
                SDKEvent::ProjectUpdated(update)
            }
            Err(_) => return,
        },
        _ => return,
    };
    debug!("deliver {} at {}", sdk_event.event_type(), now_millis());
    shared.events.emit(sdk_event);
}

async fn recv_inbound(inbound: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>) -> Option<TransportEvent> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
