//! Per-call orchestration.
//!
//! A [`CallNegotiator`] is a handle to an actor task that owns everything one
//! call attempt needs: the local stream, the peer transport, the signaling
//! channel, the quality monitor and the duration clock. Commands from the
//! handle, peer transport events, inbound signals and channel status changes
//! all arrive on one input queue and are fed through
//! [`Negotiation::apply`]; the returned [`Effect`]s are executed here.
//!
//! Every input produced by a resource is tagged with the generation of the
//! attempt that created it. Re-initialization bumps the generation, so events
//! from a torn-down transport or channel are discarded instead of acted on.

use crate::channel::{ChannelStatus, SignalingChannel};
use crate::collaborators::{CallHistoryStore, Notification, NotificationService};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::media::acquire_with_fallback;
use crate::quality::QualityMonitor;
use crate::transport::{
    ChannelTransport, LocalStream, MediaDevices, PeerEvent, PeerTransport, PeerTransportFactory,
    RemoteTrack,
};
use callcore::media::MediaLevel;
use callcore::quality::CallQuality;
use callcore::session::CallSession;
use callcore::signal::{SessionDescription, SignalError, SignalKind, SignalMessage};
use callcore::state::{
    CallPhase, CallWarning, Effect, InvalidTransition, Negotiation, NegotiationEvent,
    PeerConnectionState, Role,
};
use callcore::types::{CallId, ParticipantId};
use chrono::Utc;
use log::{debug, info, trace, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Everything a call talks to outside this crate.
#[derive(Clone)]
pub struct CallDependencies {
    pub channel_transport: Arc<dyn ChannelTransport>,
    pub media_devices: Arc<dyn MediaDevices>,
    pub peer_factory: Arc<dyn PeerTransportFactory>,
    pub notifications: Arc<dyn NotificationService>,
    pub history: Arc<dyn CallHistoryStore>,
}

/// Identity shown on the callee's ring screen.
#[derive(Debug, Clone, PartialEq)]
pub struct CallerProfile {
    pub id: ParticipantId,
    pub name: String,
    pub avatar: Option<String>,
}

/// Observable view of a call for rendering.
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub session: CallSession,
    pub phase: CallPhase,
    pub warnings: Vec<CallWarning>,
    /// User-facing explanation while the call is failed.
    pub failure_message: Option<&'static str>,
    pub media_level: Option<MediaLevel>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub remote_tracks: Vec<RemoteTrack>,
}

impl CallSnapshot {
    fn new(session: CallSession) -> Self {
        Self {
            session,
            phase: CallPhase::AcquiringMedia,
            warnings: Vec::new(),
            failure_message: None,
            media_level: None,
            audio_enabled: false,
            video_enabled: false,
            remote_tracks: Vec::new(),
        }
    }

    /// Wall-clock talk time so far, if the call ever connected.
    pub fn elapsed(&self) -> Option<chrono::TimeDelta> {
        self.session.started_at.map(|started| Utc::now() - started)
    }
}

enum Command {
    Hangup {
        done: Option<oneshot::Sender<()>>,
    },
    RemoteHangup {
        done: oneshot::Sender<()>,
    },
    Retry {
        reply: oneshot::Sender<Result<(), InvalidTransition>>,
    },
    SetAudio(bool),
    SetVideo(bool),
}

enum Input {
    Command(Command),
    Peer { generation: u64, event: PeerEvent },
    Signal { generation: u64, message: SignalMessage },
    ChannelStatus { generation: u64, status: ChannelStatus },
    ChannelJoined { generation: u64, joined: bool },
    OfferRetryElapsed { generation: u64 },
    Reinitialize,
}

/// Handle to a running call. Dropping it hangs up.
pub struct CallNegotiator {
    call_id: CallId,
    inputs: mpsc::UnboundedSender<Input>,
    snapshot: watch::Receiver<CallSnapshot>,
    quality: watch::Receiver<CallQuality>,
    duration: watch::Receiver<u64>,
    local_stream: watch::Receiver<Option<Arc<dyn LocalStream>>>,
}

impl CallNegotiator {
    /// Starts negotiating a call between `local` and `remote`.
    pub fn start(
        local: ParticipantId,
        remote: ParticipantId,
        role: Role,
        deps: CallDependencies,
        config: CallConfig,
    ) -> Self {
        let session = CallSession::new(local, remote, role == Role::Initiator);
        let call_id = session.call_id.clone();
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(CallSnapshot::new(session.clone()));
        let (duration_tx, duration) = watch::channel(0);
        let (stream_tx, local_stream) = watch::channel(None);
        let quality = QualityMonitor::new(config.quality_interval);
        let quality_rx = quality.subscribe();

        info!(
            target: "Call/Negotiator",
            "Starting call {call_id} as {role:?} with {}",
            session.remote_participant_id
        );

        let actor = CallActor {
            negotiation: Negotiation::new(
                role,
                config.max_recovery_attempts,
                config.offer_send_attempts,
            ),
            deps,
            config,
            inputs_tx: inputs_tx.clone(),
            generation: 0,
            view: CallSnapshot::new(session),
            snapshot_tx,
            stream_tx,
            duration_tx: Arc::new(duration_tx),
            quality,
            channel: None,
            peer: None,
            stream: None,
            tasks: Vec::new(),
            offer_retry: None,
            talk_time: Duration::ZERO,
            connected_at: None,
            duration_ticker: None,
        };
        tokio::spawn(actor.run(inputs_rx));

        Self {
            call_id,
            inputs: inputs_tx,
            snapshot,
            quality: quality_rx,
            duration,
            local_stream,
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn quality(&self) -> watch::Receiver<CallQuality> {
        self.quality.clone()
    }

    /// Whole seconds since the call first connected, updated every second.
    pub fn duration(&self) -> watch::Receiver<u64> {
        self.duration.clone()
    }

    pub fn local_stream(&self) -> Option<Arc<dyn LocalStream>> {
        self.local_stream.borrow().clone()
    }

    /// Ends the call and resolves once cleanup, history and notification
    /// side effects have run. Calling it again is a no-op.
    pub async fn hangup(&self) {
        let (done, finished) = oneshot::channel();
        let command = Command::Hangup { done: Some(done) };
        if self.inputs.send(Input::Command(command)).is_ok() {
            let _ = finished.await;
        }
    }

    /// Ends the call because the remote participant hung up. Runs local
    /// cleanup without notifying the remote side back.
    pub async fn remote_hangup(&self) {
        let (done, finished) = oneshot::channel();
        let command = Command::RemoteHangup { done };
        if self.inputs.send(Input::Command(command)).is_ok() {
            let _ = finished.await;
        }
    }

    /// Re-runs initialization after a device or signaling failure.
    pub async fn retry(&self) -> Result<(), CallError> {
        let (reply, result) = oneshot::channel();
        self.inputs
            .send(Input::Command(Command::Retry { reply }))
            .map_err(|_| CallError::Ended)?;
        result.await.map_err(|_| CallError::Ended)??;
        Ok(())
    }

    pub fn set_audio_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.inputs
            .send(Input::Command(Command::SetAudio(enabled)))
            .map_err(|_| CallError::Ended)
    }

    pub fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.inputs
            .send(Input::Command(Command::SetVideo(enabled)))
            .map_err(|_| CallError::Ended)
    }
}

impl Drop for CallNegotiator {
    fn drop(&mut self) {
        let _ = self
            .inputs
            .send(Input::Command(Command::Hangup { done: None }));
    }
}

/// Announces the call to `callee`, then starts negotiating as initiator.
///
/// The announcement is best effort: if it cannot be delivered the call still
/// starts, and will fail through the signaling path if nobody answers.
pub async fn start_outgoing_call(
    caller: CallerProfile,
    callee: ParticipantId,
    deps: CallDependencies,
    config: CallConfig,
) -> CallNegotiator {
    let announcement = Notification::Call {
        call_id: CallId::for_participants(&caller.id, &callee),
        caller_name: caller.name,
        caller_avatar: caller.avatar,
    };
    if let Err(e) = deps
        .notifications
        .notify(&callee, &caller.id, announcement)
        .await
    {
        warn!(target: "Call/Negotiator", "Failed to announce call to {callee}: {e:?}");
    }
    CallNegotiator::start(caller.id, callee, Role::Initiator, deps, config)
}

struct CallActor {
    deps: CallDependencies,
    config: CallConfig,
    negotiation: Negotiation,
    inputs_tx: mpsc::UnboundedSender<Input>,
    generation: u64,

    view: CallSnapshot,
    snapshot_tx: watch::Sender<CallSnapshot>,
    stream_tx: watch::Sender<Option<Arc<dyn LocalStream>>>,
    duration_tx: Arc<watch::Sender<u64>>,
    quality: QualityMonitor,

    channel: Option<Arc<SignalingChannel>>,
    peer: Option<Arc<dyn PeerTransport>>,
    stream: Option<Arc<dyn LocalStream>>,
    /// Pumps and the join task of the current attempt.
    tasks: Vec<JoinHandle<()>>,
    offer_retry: Option<JoinHandle<()>>,
    /// Talk time banked before the clock was last paused.
    talk_time: Duration,
    /// Start of the running clock segment, if the clock is running.
    connected_at: Option<Instant>,
    duration_ticker: Option<JoinHandle<()>>,
}

impl CallActor {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        self.initialize().await;

        while let Some(input) = inputs.recv().await {
            self.handle(input).await;
            if self.negotiation.phase().is_ended() {
                break;
            }
        }
        debug!(target: "Call/Negotiator", "Call {} actor finished", self.view.session.call_id);
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.handle_command(command).await,
            Input::Reinitialize => {
                if matches!(
                    self.negotiation.phase(),
                    CallPhase::AcquiringMedia | CallPhase::Recovering { .. }
                ) {
                    self.initialize().await;
                }
            }
            Input::Peer { generation, .. }
            | Input::Signal { generation, .. }
            | Input::ChannelStatus { generation, .. }
            | Input::ChannelJoined { generation, .. }
            | Input::OfferRetryElapsed { generation }
                if generation != self.generation =>
            {
                trace!(target: "Call/Negotiator", "Dropping input from stale attempt {generation}");
            }
            Input::Peer { event, .. } => self.handle_peer_event(event).await,
            Input::Signal { message, .. } => match signal_event(&message) {
                Ok(event) => {
                    let _ = self.apply(event).await;
                }
                Err(e) => {
                    warn!(target: "Call/Negotiator", "Ignoring malformed {}: {e}", message.kind);
                }
            },
            Input::ChannelStatus { status, .. } => match status {
                ChannelStatus::Subscribed => {
                    let _ = self.apply(NegotiationEvent::ChannelReady).await;
                }
                ChannelStatus::Exhausted => {
                    let _ = self.apply(NegotiationEvent::ChannelExhausted).await;
                }
                other => debug!(target: "Call/Negotiator", "Channel status {other:?}"),
            },
            Input::ChannelJoined { joined, .. } => {
                let _ = self.apply(NegotiationEvent::ChannelJoined(joined)).await;
            }
            Input::OfferRetryElapsed { .. } => {
                let _ = self.apply(NegotiationEvent::OfferRetryElapsed).await;
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Hangup { done } => {
                info!(target: "Call/Negotiator", "Hanging up {}", self.view.session.call_id);
                let _ = self.apply(NegotiationEvent::Hangup).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            Command::RemoteHangup { done } => {
                info!(target: "Call/Negotiator", "Remote side ended {}", self.view.session.call_id);
                let _ = self.apply(NegotiationEvent::RemoteHangup).await;
                let _ = done.send(());
            }
            Command::Retry { reply } => {
                let result = self.apply(NegotiationEvent::Retry).await;
                let _ = reply.send(result);
            }
            Command::SetAudio(enabled) => {
                if let Some(stream) = &self.stream {
                    stream.set_audio_enabled(enabled);
                }
                self.view.audio_enabled = enabled;
                self.publish();
            }
            Command::SetVideo(enabled) => {
                if let Some(stream) = &self.stream {
                    stream.set_video_enabled(enabled);
                }
                self.view.video_enabled = enabled;
                self.publish();
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let event = match event {
            PeerEvent::ConnectionState(state) => NegotiationEvent::ConnectionStateChanged(state),
            PeerEvent::IceConnectionState(state) => {
                NegotiationEvent::IceConnectionStateChanged(state)
            }
            PeerEvent::LocalCandidate(candidate) => NegotiationEvent::LocalCandidate(candidate),
            PeerEvent::RemoteTrack(track) => {
                debug!(target: "Call/Negotiator", "Remote {:?} track {}", track.kind, track.id);
                self.view.remote_tracks.push(track);
                self.publish();
                return;
            }
        };
        let _ = self.apply(event).await;
    }

    /// Feeds one event through the state machine and executes the effects.
    async fn apply(&mut self, event: NegotiationEvent) -> Result<(), InvalidTransition> {
        let result = self.negotiation.apply(event);
        match &result {
            Ok(effects) => {
                for effect in effects.clone() {
                    self.run_effect(effect).await;
                }
            }
            Err(e) => warn!(target: "Call/Negotiator", "Ignoring unexpected event: {e}"),
        }
        if matches!(self.negotiation.phase(), CallPhase::Failed(_)) {
            self.pause_clock();
        }
        self.publish();
        result.map(|_| ())
    }

    /// Acquires media, creates the peer transport and signaling channel and,
    /// as initiator, prepares the offer. Anything left from a previous
    /// attempt is released first.
    async fn initialize(&mut self) {
        self.release_resources().await;
        let generation = self.generation;

        let media = match acquire_with_fallback(self.deps.media_devices.as_ref()).await {
            Ok(media) => media,
            Err(e) => {
                warn!(target: "Call/Negotiator", "Media acquisition failed: {e}");
                let _ = self.apply(NegotiationEvent::MediaFailed(e.kind)).await;
                return;
            }
        };
        self.view.media_level = Some(media.level);
        self.view.audio_enabled = media.stream.has_audio();
        self.view.video_enabled = media.stream.has_video();
        self.stream = Some(media.stream.clone());
        self.stream_tx.send_replace(Some(media.stream.clone()));
        if self
            .apply(NegotiationEvent::MediaAcquired {
                warning: media.warning,
            })
            .await
            .is_err()
        {
            return;
        }

        let (peer, events) = match self.deps.peer_factory.create_transport().await {
            Ok(created) => created,
            Err(e) => {
                warn!(target: "Call/Negotiator", "Failed to create peer transport: {e:?}");
                self.report_transport_failure();
                return;
            }
        };
        if let Err(e) = peer.add_stream(media.stream).await {
            warn!(target: "Call/Negotiator", "Failed to attach local stream: {e:?}");
            peer.close().await;
            self.report_transport_failure();
            return;
        }
        self.peer = Some(peer.clone());
        self.tasks.push(spawn_peer_pump(generation, events, self.inputs_tx.clone()));

        let session = &self.view.session;
        let channel = SignalingChannel::new(
            session.call_id.clone(),
            session.local_participant_id.clone(),
            self.deps.channel_transport.clone(),
            self.config.channel.clone(),
        );
        let remote = session.remote_participant_id.clone();
        let inputs = self.inputs_tx.clone();
        channel.on_signal(move |message| {
            if message.sender_id != remote {
                debug!(target: "Call/Negotiator", "Ignoring signal from {}", message.sender_id);
                return;
            }
            let _ = inputs.send(Input::Signal {
                generation,
                message,
            });
        });
        self.tasks
            .push(spawn_status_pump(generation, &channel, self.inputs_tx.clone()));
        self.tasks
            .push(spawn_join(generation, channel.clone(), self.inputs_tx.clone()));
        self.channel = Some(channel);

        if self.negotiation.role() == Role::Initiator {
            match create_local_offer(peer.as_ref(), false).await {
                Ok(offer) => {
                    let _ = self.apply(NegotiationEvent::LocalOfferCreated(offer)).await;
                }
                Err(e) => {
                    warn!(target: "Call/Negotiator", "Failed to create offer: {e:?}");
                    self.report_transport_failure();
                }
            }
        }
    }

    async fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::Warn(warning) => {
                warn!(target: "Call/Negotiator", "{}", warning.message());
                if matches!(warning, CallWarning::Reconnecting { .. }) {
                    self.view
                        .warnings
                        .retain(|w| !matches!(w, CallWarning::Reconnecting { .. }));
                }
                if !self.view.warnings.contains(&warning) {
                    self.view.warnings.push(warning);
                }
            }
            Effect::SendOffer(offer) => {
                info!(target: "Call/Negotiator", "Sending offer");
                self.send(SignalKind::Offer, offer.to_payload()).await;
            }
            Effect::AnswerOffer(offer) => {
                if let Err(e) = self.answer(offer).await {
                    warn!(target: "Call/Negotiator", "Failed to answer offer: {e:?}");
                    self.report_transport_failure();
                }
            }
            Effect::ApplyAnswer(answer) => {
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                if let Err(e) = peer.set_remote_description(answer).await {
                    warn!(target: "Call/Negotiator", "Failed to apply answer: {e:?}");
                    self.report_transport_failure();
                }
            }
            Effect::ApplyCandidate(candidate) => {
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    debug!(target: "Call/Negotiator", "Remote candidate rejected: {e:?}");
                }
            }
            Effect::SendCandidate(candidate) => {
                self.send(SignalKind::IceCandidate, candidate.to_payload())
                    .await;
            }
            Effect::ScheduleOfferRetry { attempt } => {
                debug!(
                    target: "Call/Negotiator",
                    "Channel not ready, re-checking offer in {:?} ({attempt}/{})",
                    self.config.offer_retry_delay,
                    self.config.offer_send_attempts
                );
                let generation = self.generation;
                let delay = self.config.offer_retry_delay;
                let inputs = self.inputs_tx.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inputs.send(Input::OfferRetryElapsed { generation });
                });
                if let Some(previous) = self.offer_retry.replace(timer) {
                    previous.abort();
                }
            }
            Effect::RestartIce => {
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                match create_local_offer(peer.as_ref(), true).await {
                    Ok(offer) => self.send(SignalKind::Offer, offer.to_payload()).await,
                    Err(e) => {
                        warn!(target: "Call/Negotiator", "ICE restart failed: {e:?}");
                        self.report_transport_failure();
                    }
                }
            }
            Effect::MarkConnected => {
                info!(target: "Call/Negotiator", "Call {} connected", self.view.session.call_id);
                self.view.session.mark_connected(Utc::now());
                self.resume_clock();
            }
            Effect::StartQualityMonitor => {
                self.view.warnings.retain(|w| {
                    matches!(
                        w,
                        CallWarning::DegradedMedia { .. } | CallWarning::SignalingLost
                    )
                });
                if let Some(peer) = &self.peer {
                    self.quality.start(peer.clone());
                }
                // Reconnected after a retry from a failed state.
                if self.negotiation.ever_connected() {
                    self.resume_clock();
                }
            }
            Effect::ConnectionRestored => {
                info!(target: "Call/Negotiator", "Connection restored in place");
                self.view.warnings.retain(|w| {
                    !matches!(
                        w,
                        CallWarning::TransportDisconnected | CallWarning::IceRestarting
                    )
                });
            }
            Effect::StopQualityMonitor => self.quality.stop(),
            Effect::Reinitialize { attempt } => {
                info!(target: "Call/Negotiator", "Re-initializing call (attempt {attempt})");
                let _ = self.inputs_tx.send(Input::Reinitialize);
            }
            Effect::ReleaseResources => self.release_resources().await,
            Effect::Teardown { notify_remote } => self.teardown(notify_remote).await,
        }
    }

    async fn answer(&mut self, offer: SessionDescription) -> Result<(), anyhow::Error> {
        let Some(peer) = self.peer.clone() else {
            return Ok(());
        };
        peer.set_remote_description(offer).await?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        info!(target: "Call/Negotiator", "Sending answer");
        self.send(SignalKind::Answer, answer.to_payload()).await;
        Ok(())
    }

    async fn send(&self, kind: SignalKind, payload: Value) {
        match &self.channel {
            Some(channel) => {
                channel
                    .send_signal(kind, payload, &self.view.session.remote_participant_id)
                    .await
            }
            None => debug!(target: "Call/Negotiator", "No channel, dropping {kind}"),
        }
    }

    /// Errors raised while executing an effect are handled like the transport
    /// itself failing.
    fn report_transport_failure(&self) {
        let _ = self.inputs_tx.send(Input::Peer {
            generation: self.generation,
            event: PeerEvent::ConnectionState(PeerConnectionState::Failed),
        });
    }

    /// Starts a clock segment unless one is already running.
    fn resume_clock(&mut self) {
        if self.connected_at.is_some() {
            return;
        }
        let started = Instant::now();
        self.connected_at = Some(started);
        let banked = self.talk_time;
        let duration = self.duration_tx.clone();
        let ticker = tokio::spawn(async move {
            let period = Duration::from_secs(1);
            let mut interval = tokio::time::interval_at(started + period, period);
            loop {
                interval.tick().await;
                duration.send_replace((banked + started.elapsed()).as_secs());
            }
        });
        if let Some(previous) = self.duration_ticker.replace(ticker) {
            previous.abort();
        }
    }

    /// Stops the clock and banks the running segment. Returns the total.
    fn pause_clock(&mut self) -> Duration {
        if let Some(ticker) = self.duration_ticker.take() {
            ticker.abort();
        }
        if let Some(started) = self.connected_at.take() {
            self.talk_time += started.elapsed();
            self.duration_tx.send_replace(self.talk_time.as_secs());
        }
        self.talk_time
    }

    /// Drops every resource of the current attempt. Inputs still in flight
    /// from it become stale.
    async fn release_resources(&mut self) {
        self.generation += 1;
        self.quality.stop();
        if let Some(timer) = self.offer_retry.take() {
            timer.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.leave().await;
        }
        if let Some(peer) = self.peer.take() {
            peer.close().await;
        }
        if let Some(stream) = self.stream.take() {
            stream.stop();
            self.stream_tx.send_replace(None);
        }
        self.view.remote_tracks.clear();
    }

    async fn teardown(&mut self, notify_remote: bool) {
        let duration_seconds = self.pause_clock().as_secs();
        self.duration_tx.send_replace(duration_seconds);
        self.release_resources().await;

        let session = &self.view.session;
        let (caller, receiver) = session.caller_and_receiver();
        if session.is_initiator && self.negotiation.ever_connected() && duration_seconds > 0 {
            if let Err(e) = self
                .deps
                .history
                .record_call(caller, receiver, duration_seconds)
                .await
            {
                warn!(target: "Call/Negotiator", "Failed to record call history: {e:?}");
            }
        }
        if notify_remote {
            let ended = Notification::CallEnded {
                duration_seconds,
                missed: false,
            };
            if let Err(e) = self
                .deps
                .notifications
                .notify(
                    &session.remote_participant_id,
                    &session.local_participant_id,
                    ended,
                )
                .await
            {
                warn!(target: "Call/Negotiator", "Failed to send termination notification: {e:?}");
            }
        }
        info!(
            target: "Call/Negotiator",
            "Call {} torn down after {duration_seconds}s",
            session.call_id
        );
    }

    fn publish(&mut self) {
        let phase = self.negotiation.phase();
        self.view.phase = phase;
        self.view.session.state = phase.into();
        self.view.failure_message = match phase {
            CallPhase::Failed(reason) => Some(reason.user_message()),
            _ => None,
        };
        self.snapshot_tx.send_replace(self.view.clone());
    }
}

fn signal_event(message: &SignalMessage) -> Result<NegotiationEvent, SignalError> {
    Ok(match message.kind {
        SignalKind::Offer => NegotiationEvent::RemoteOffer(message.session_description()?),
        SignalKind::Answer => NegotiationEvent::RemoteAnswer(message.session_description()?),
        SignalKind::IceCandidate => NegotiationEvent::RemoteCandidate(message.ice_candidate()?),
    })
}

async fn create_local_offer(
    peer: &dyn PeerTransport,
    ice_restart: bool,
) -> Result<SessionDescription, anyhow::Error> {
    let offer = peer.create_offer(ice_restart).await?;
    peer.set_local_description(offer.clone()).await?;
    Ok(offer)
}

fn spawn_peer_pump(
    generation: u64,
    mut events: mpsc::Receiver<PeerEvent>,
    inputs: mpsc::UnboundedSender<Input>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if inputs.send(Input::Peer { generation, event }).is_err() {
                break;
            }
        }
    })
}

fn spawn_status_pump(
    generation: u64,
    channel: &SignalingChannel,
    inputs: mpsc::UnboundedSender<Input>,
) -> JoinHandle<()> {
    let mut status = channel.watch_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let status = *status.borrow_and_update();
            if inputs
                .send(Input::ChannelStatus { generation, status })
                .is_err()
            {
                break;
            }
        }
    })
}

fn spawn_join(
    generation: u64,
    channel: Arc<SignalingChannel>,
    inputs: mpsc::UnboundedSender<Input>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let joined = channel.join().await;
        let _ = inputs.send(Input::ChannelJoined { generation, joined });
    })
}
