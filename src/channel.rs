//! Call-scoped signaling channel.
//!
//! A [`SignalingChannel`] subscribes to the broadcast topic `call:{callId}` and
//! exchanges [`SignalMessage`]s with the remote participant. The topic is
//! shared, so inbound messages not addressed to the local participant are
//! discarded here.
//!
//! Outbound messages sent before the subscription is ready are queued and
//! flushed in send order once it is. A failed transmission is re-queued rather
//! than dropped. Failed subscriptions are retried with capped exponential
//! backoff until the attempt budget is spent, after which the channel reports
//! [`ChannelStatus::Exhausted`] and must be replaced.

use crate::config::ChannelConfig;
use crate::transport::{ChannelEvent, ChannelTransport, SubscriptionStatus};
use bytes::Bytes;
use callcore::backoff::reconnect_delay;
use callcore::signal::{SignalKind, SignalMessage};
use callcore::types::{CallId, ParticipantId};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use log::{debug, info, trace, warn};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Idle,
    Joining,
    Subscribed,
    Closed,
    ChannelError,
    TimedOut,
    /// Reconnect attempts are spent. Terminal.
    Exhausted,
    /// `leave()` was called. Terminal.
    Left,
}

impl ChannelStatus {
    pub fn is_ready(self) -> bool {
        self == Self::Subscribed
    }

    /// A failed subscription that the reconnect policy applies to.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Closed | Self::ChannelError | Self::TimedOut)
    }
}

impl From<SubscriptionStatus> for ChannelStatus {
    fn from(status: SubscriptionStatus) -> Self {
        match status {
            SubscriptionStatus::Subscribed => Self::Subscribed,
            SubscriptionStatus::Closed => Self::Closed,
            SubscriptionStatus::ChannelError => Self::ChannelError,
            SubscriptionStatus::TimedOut => Self::TimedOut,
        }
    }
}

pub type SignalHandler = Arc<dyn Fn(SignalMessage) + Send + Sync>;

type JoinFuture = Shared<BoxFuture<'static, bool>>;

#[derive(Default)]
struct ChannelState {
    pending: VecDeque<SignalMessage>,
    reconnect_attempts: u32,
    /// Bumped on every join and on leave; stale readers compare against it.
    generation: u64,
    /// Set only once a join has settled as subscribed and flushed the queue.
    ready: bool,
    /// First failure the current subscription reported before it was ready.
    lost_before_ready: Option<ChannelStatus>,
    has_subscription: bool,
    reader: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    exhausted: bool,
    left: bool,
}

pub struct SignalingChannel {
    call_id: CallId,
    topic: String,
    local_id: ParticipantId,
    transport: Arc<dyn ChannelTransport>,
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    status_tx: watch::Sender<ChannelStatus>,
    handler: std::sync::Mutex<Option<SignalHandler>>,
    in_flight_join: std::sync::Mutex<Option<JoinFuture>>,
}

/// Records the first status a subscription reports; later ones are the
/// reader's business.
fn settle(settled: &watch::Sender<Option<SubscriptionStatus>>, status: SubscriptionStatus) {
    settled.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(status);
        true
    });
}

impl SignalingChannel {
    pub fn new(
        call_id: CallId,
        local_id: ParticipantId,
        transport: Arc<dyn ChannelTransport>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(ChannelStatus::Idle);
        Arc::new(Self {
            topic: call_id.topic(),
            call_id,
            local_id,
            transport,
            config,
            state: Mutex::new(ChannelState::default()),
            status_tx,
            handler: std::sync::Mutex::new(None),
            in_flight_join: std::sync::Mutex::new(None),
        })
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn reconnect_attempts(&self) -> u32 {
        self.state.lock().await.reconnect_attempts
    }

    /// Registers the inbound signal handler, replacing any previous one.
    pub fn on_signal<F>(&self, handler: F)
    where
        F: Fn(SignalMessage) + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Joins the topic. Resolves `true` once subscribed.
    ///
    /// Concurrent callers share the outcome of a single in-flight attempt. On
    /// failure or timeout the reconnect is already scheduled (unless the
    /// budget is spent) by the time this resolves `false`.
    pub async fn join(self: &Arc<Self>) -> bool {
        let join = {
            let mut slot = self.in_flight_join.lock().unwrap();
            match slot.as_ref() {
                Some(join) => join.clone(),
                None => {
                    let this = Arc::clone(self);
                    let join = async move { this.join_once().await }.boxed().shared();
                    *slot = Some(join.clone());
                    join
                }
            }
        };
        join.await
    }

    async fn join_once(self: Arc<Self>) -> bool {
        let _clear_in_flight = scopeguard::guard((), |_| {
            *self.in_flight_join.lock().unwrap() = None;
        });

        let (settled_tx, mut settled_rx) = watch::channel(None);
        let (generation, stale_subscription) = {
            let mut state = self.state.lock().await;
            if state.left || state.exhausted {
                debug!(target: "Call/Signaling", "Not joining {}: channel is closed for good", self.topic);
                return false;
            }
            if let Some(timer) = state.reconnect_timer.take() {
                timer.abort();
            }
            if let Some(reader) = state.reader.take() {
                reader.abort();
            }
            state.generation += 1;
            state.ready = false;
            state.lost_before_ready = None;
            self.status_tx.send_replace(ChannelStatus::Joining);
            (state.generation, std::mem::take(&mut state.has_subscription))
        };

        // Transport I/O runs outside the state lock so senders only ever queue.
        if stale_subscription {
            debug!(target: "Call/Signaling", "Disposing previous subscription to {}", self.topic);
            self.transport.unsubscribe(&self.topic).await;
        }
        let subscribed = self.transport.subscribe(&self.topic).await;

        {
            let mut state = self.state.lock().await;
            if state.left || state.generation != generation {
                drop(state);
                if subscribed.is_ok() {
                    self.transport.unsubscribe(&self.topic).await;
                }
                return false;
            }
            match subscribed {
                Ok(events) => {
                    state.has_subscription = true;
                    state.reader = Some(self.spawn_reader(generation, events, settled_tx));
                }
                Err(e) => {
                    warn!(target: "Call/Signaling", "Subscribe to {} failed: {e}", self.topic);
                    settled_tx.send_replace(Some(SubscriptionStatus::ChannelError));
                }
            }
        }

        let outcome = match tokio::time::timeout(
            self.config.join_timeout,
            settled_rx.wait_for(|status| status.is_some()),
        )
        .await
        {
            Ok(Ok(status)) => (*status).map_or(ChannelStatus::Closed, ChannelStatus::from),
            Ok(Err(_)) => ChannelStatus::Closed,
            Err(_) => ChannelStatus::TimedOut,
        };

        let mut state = self.state.lock().await;
        if state.left || state.generation != generation {
            return false;
        }
        if outcome.is_ready()
            && let Some(lost) = state.lost_before_ready
        {
            warn!(target: "Call/Signaling", "Subscription to {} dropped right after joining: {lost:?}", self.topic);
            self.status_tx.send_replace(lost);
            self.schedule_reconnect(&mut state);
            return false;
        }
        if outcome.is_ready() {
            state.ready = true;
            state.reconnect_attempts = 0;
            info!(target: "Call/Signaling", "Joined {}", self.topic);
            self.status_tx.send_replace(ChannelStatus::Subscribed);
            self.flush(&mut state).await;
            true
        } else {
            warn!(target: "Call/Signaling", "Join of {} failed: {outcome:?}", self.topic);
            self.status_tx.send_replace(outcome);
            self.schedule_reconnect(&mut state);
            false
        }
    }

    fn spawn_reader(
        self: &Arc<Self>,
        generation: u64,
        mut events: mpsc::Receiver<ChannelEvent>,
        settled_tx: watch::Sender<Option<SubscriptionStatus>>,
    ) -> JoinHandle<()> {
        let channel = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(this) = channel.upgrade() else {
                    return;
                };
                match event {
                    ChannelEvent::Message(frame) => this.dispatch(&frame),
                    ChannelEvent::Status(status) => {
                        settle(&settled_tx, status);
                        if status != SubscriptionStatus::Subscribed {
                            this.subscription_lost(generation, status.into()).await;
                        }
                    }
                }
            }
            settle(&settled_tx, SubscriptionStatus::Closed);
            if let Some(this) = channel.upgrade() {
                this.subscription_lost(generation, ChannelStatus::Closed).await;
            }
        })
    }

    fn dispatch(&self, frame: &[u8]) {
        let message = match SignalMessage::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(target: "Call/Signaling", "Discarding malformed signal on {}: {e}", self.topic);
                return;
            }
        };
        if !message.is_addressed_to(&self.local_id) {
            trace!(
                target: "Call/Signaling",
                "Ignoring {} addressed to {}",
                message.kind,
                message.receiver_id
            );
            return;
        }

        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(message),
            None => debug!(target: "Call/Signaling", "No handler registered, dropping {}", message.kind),
        }
    }

    /// The subscription of `generation` went away. Before the join has
    /// settled the failure is left for it to act on.
    async fn subscription_lost(self: Arc<Self>, generation: u64, status: ChannelStatus) {
        let mut state = self.state.lock().await;
        if state.generation != generation || state.left {
            return;
        }
        if !state.ready {
            state.lost_before_ready.get_or_insert(status);
            return;
        }
        state.ready = false;
        warn!(target: "Call/Signaling", "Subscription to {} lost: {status:?}", self.topic);
        self.status_tx.send_replace(status);
        self.schedule_reconnect(&mut state);
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ChannelState) {
        if state.reconnect_attempts >= self.config.max_reconnect_attempts {
            warn!(
                target: "Call/Signaling",
                "Giving up on {} after {} reconnect attempts",
                self.topic,
                state.reconnect_attempts
            );
            state.exhausted = true;
            self.status_tx.send_replace(ChannelStatus::Exhausted);
            return;
        }

        state.reconnect_attempts += 1;
        let attempt = state.reconnect_attempts;
        let delay = reconnect_delay(attempt, self.config.backoff_base, self.config.backoff_cap);
        info!(
            target: "Call/Signaling",
            "Rejoining {} in {:?} (attempt {}/{})",
            self.topic,
            delay,
            attempt,
            self.config.max_reconnect_attempts
        );

        let channel: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = channel.upgrade() {
                // Detached so that the join can cancel this timer's handle safely.
                tokio::spawn(async move {
                    this.join().await;
                });
            }
        });
        if let Some(previous) = state.reconnect_timer.replace(timer) {
            previous.abort();
        }
    }

    /// Sends a signal to `receiver`. Never blocks on readiness: until the
    /// channel is subscribed the message is queued.
    pub async fn send_signal(&self, kind: SignalKind, payload: Value, receiver: &ParticipantId) {
        let message = SignalMessage::new(kind, payload, self.local_id.clone(), receiver.clone());
        let mut state = self.state.lock().await;
        if state.left {
            debug!(target: "Call/Signaling", "Dropping {kind} on left channel {}", self.topic);
            return;
        }

        state.pending.push_back(message);
        if state.ready {
            self.flush(&mut state).await;
        } else {
            debug!(
                target: "Call/Signaling",
                "Queued {kind} for {} ({} pending)",
                self.topic,
                state.pending.len()
            );
        }
    }

    async fn flush(&self, state: &mut ChannelState) {
        while let Some(message) = state.pending.pop_front() {
            let frame = match message.encode() {
                Ok(frame) => Bytes::from(frame),
                Err(e) => {
                    warn!(target: "Call/Signaling", "Dropping unencodable {}: {e}", message.kind);
                    continue;
                }
            };
            if let Err(e) = self.transport.broadcast(&self.topic, frame).await {
                warn!(
                    target: "Call/Signaling",
                    "Sending {} on {} failed, re-queued: {e}",
                    message.kind,
                    self.topic
                );
                state.pending.push_front(message);
                break;
            }
            trace!(target: "Call/Signaling", "Sent {} to {}", message.kind, message.receiver_id);
        }
    }

    /// Unsubscribes and discards queued messages. Safe to call repeatedly and
    /// from any state.
    pub async fn leave(&self) {
        // An abandoned in-flight join keeps a strong reference to the channel.
        let abandoned = self.in_flight_join.lock().unwrap().take();
        drop(abandoned);

        let mut state = self.state.lock().await;
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        if state.has_subscription {
            self.transport.unsubscribe(&self.topic).await;
            state.has_subscription = false;
        }
        let discarded = state.pending.len();
        state.pending.clear();
        state.reconnect_attempts = 0;
        state.ready = false;
        state.generation += 1;
        if !std::mem::replace(&mut state.left, true) {
            info!(target: "Call/Signaling", "Left {} ({discarded} queued signals discarded)", self.topic);
        }
        self.status_tx.send_replace(ChannelStatus::Left);
    }
}
