use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use callcore::media::{DeviceErrorKind, MediaConstraints};
use callcore::quality::{
    CandidatePairState, CandidatePairStats, InboundRtpStats, MediaKind, TransportStats,
};
use callcore::signal::{IceCandidate, SessionDescription, SignalKind, SignalMessage};
use callcore::types::ParticipantId;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::collaborators::{CallHistoryStore, Notification, NotificationService, RingAlert};
use crate::error::DeviceError;
use crate::negotiator::CallDependencies;
use crate::transport::{
    ChannelEvent, ChannelTransport, LocalStream, MediaDevices, PeerEvent, PeerTransport,
    PeerTransportFactory, SubscriptionStatus,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// How [`ScriptedChannelTransport`] answers a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeScript {
    /// Reports `Subscribed` right away.
    Subscribe,
    /// Reports the given failure status right away.
    Fail(SubscriptionStatus),
    /// Reports nothing; the test pushes statuses itself.
    Manual,
    /// The subscribe call itself errors.
    Error,
    /// The subscribe call never returns.
    Stall,
}

/// Channel transport whose subscriptions follow a script.
pub struct ScriptedChannelTransport {
    default_script: Mutex<SubscribeScript>,
    scripts: Mutex<VecDeque<SubscribeScript>>,
    subscription: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
    subscribe_times: Mutex<Vec<Instant>>,
    unsubscribes: AtomicUsize,
    failing_broadcasts: AtomicUsize,
    /// Broadcasts wait while this is `false`.
    broadcast_gate: watch::Sender<bool>,
    sent: watch::Sender<Vec<SignalMessage>>,
}

impl ScriptedChannelTransport {
    pub fn new(script: SubscribeScript) -> Arc<Self> {
        let (sent, _) = watch::channel(Vec::new());
        Arc::new(Self {
            default_script: Mutex::new(script),
            scripts: Mutex::new(VecDeque::new()),
            subscription: Mutex::new(None),
            subscribe_times: Mutex::new(Vec::new()),
            unsubscribes: AtomicUsize::new(0),
            failing_broadcasts: AtomicUsize::new(0),
            broadcast_gate: watch::Sender::new(true),
            sent,
        })
    }

    pub fn set_default_script(&self, script: SubscribeScript) {
        *self.default_script.lock().unwrap() = script;
    }

    /// Overrides the script for the next subscribe call only.
    pub fn script_next(&self, script: SubscribeScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn fail_next_broadcasts(&self, count: usize) {
        self.failing_broadcasts.store(count, Ordering::SeqCst);
    }

    /// Holds every broadcast until [`Self::release_broadcasts`].
    pub fn hold_broadcasts(&self) {
        self.broadcast_gate.send_replace(false);
    }

    pub fn release_broadcasts(&self) {
        self.broadcast_gate.send_replace(true);
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribe_times.lock().unwrap().len()
    }

    pub fn subscribe_times(&self) -> Vec<Instant> {
        self.subscribe_times.lock().unwrap().clone()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.borrow().clone()
    }

    pub fn sent_of_kind(&self, kind: SignalKind) -> Vec<SignalMessage> {
        self.sent
            .borrow()
            .iter()
            .filter(|m| m.kind == kind)
            .cloned()
            .collect()
    }

    /// Waits until at least `count` messages of `kind` have been broadcast.
    pub async fn wait_for_sent(&self, kind: SignalKind, count: usize) {
        let mut sent = self.sent.subscribe();
        sent.wait_for(|messages| messages.iter().filter(|m| m.kind == kind).count() >= count)
            .await
            .unwrap();
    }

    fn current(&self) -> Option<mpsc::Sender<ChannelEvent>> {
        self.subscription.lock().unwrap().clone()
    }

    pub async fn push_status(&self, status: SubscriptionStatus) {
        let tx = self.current().expect("no live subscription");
        tx.send(ChannelEvent::Status(status)).await.unwrap();
    }

    pub async fn deliver(&self, message: &SignalMessage) {
        self.deliver_raw(Bytes::from(message.encode().unwrap())).await;
    }

    pub async fn deliver_raw(&self, frame: Bytes) {
        let tx = self.current().expect("no live subscription");
        tx.send(ChannelEvent::Message(frame)).await.unwrap();
    }

    /// Drops the live subscription as if the transport went away.
    pub fn drop_subscription(&self) {
        self.subscription.lock().unwrap().take();
    }
}

#[async_trait]
impl ChannelTransport for ScriptedChannelTransport {
    async fn subscribe(&self, _topic: &str) -> Result<mpsc::Receiver<ChannelEvent>, anyhow::Error> {
        self.subscribe_times.lock().unwrap().push(Instant::now());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.default_script.lock().unwrap());
        if script == SubscribeScript::Stall {
            return std::future::pending().await;
        }

        let (tx, rx) = mpsc::channel(32);
        match script {
            SubscribeScript::Subscribe => {
                tx.try_send(ChannelEvent::Status(SubscriptionStatus::Subscribed))?;
            }
            SubscribeScript::Fail(status) => {
                tx.try_send(ChannelEvent::Status(status))?;
            }
            SubscribeScript::Manual | SubscribeScript::Stall => {}
            SubscribeScript::Error => return Err(anyhow::anyhow!("scripted subscribe error")),
        }
        *self.subscription.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn broadcast(&self, _topic: &str, frame: Bytes) -> Result<(), anyhow::Error> {
        let mut gate = self.broadcast_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let failing = self
            .failing_broadcasts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!("scripted broadcast failure"));
        }
        let message = SignalMessage::decode(&frame)?;
        self.sent.send_modify(|sent| sent.push(message));
        Ok(())
    }

    async fn unsubscribe(&self, _topic: &str) {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.subscription.lock().unwrap().take();
    }
}

pub struct FakeStream {
    id: String,
    audio: bool,
    video: bool,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    stopped: AtomicUsize,
}

impl FakeStream {
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst) > 0
    }
}

impl LocalStream for FakeStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn has_audio(&self) -> bool {
        self.audio
    }

    fn has_video(&self) -> bool {
        self.video
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Capture devices that grant every request unless told otherwise.
#[derive(Default)]
pub struct FakeMediaDevices {
    deny_audio: Mutex<Option<DeviceErrorKind>>,
    deny_video: Mutex<Option<DeviceErrorKind>>,
    attempts: Mutex<Vec<MediaConstraints>>,
    streams: Mutex<Vec<Arc<FakeStream>>>,
}

impl FakeMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any request that includes audio fails with `kind`.
    pub fn deny_audio(&self, kind: DeviceErrorKind) {
        *self.deny_audio.lock().unwrap() = Some(kind);
    }

    /// Any request that includes video fails with `kind`.
    pub fn deny_video(&self, kind: DeviceErrorKind) {
        *self.deny_video.lock().unwrap() = Some(kind);
    }

    pub fn allow_all(&self) {
        self.deny_audio.lock().unwrap().take();
        self.deny_video.lock().unwrap().take();
    }

    pub fn attempts(&self) -> Vec<MediaConstraints> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn streams(&self) -> Vec<Arc<FakeStream>> {
        self.streams.lock().unwrap().clone()
    }

    pub fn latest_stream(&self) -> Arc<FakeStream> {
        self.streams.lock().unwrap().last().cloned().expect("no stream acquired")
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn LocalStream>, DeviceError> {
        self.attempts.lock().unwrap().push(constraints);
        if constraints.video
            && let Some(kind) = *self.deny_video.lock().unwrap()
        {
            return Err(DeviceError::new(kind, "camera unavailable"));
        }
        if constraints.audio
            && let Some(kind) = *self.deny_audio.lock().unwrap()
        {
            return Err(DeviceError::new(kind, "microphone unavailable"));
        }

        let mut streams = self.streams.lock().unwrap();
        let stream = Arc::new(FakeStream {
            id: format!("stream-{}", streams.len() + 1),
            audio: constraints.audio,
            video: constraints.video,
            audio_enabled: AtomicBool::new(constraints.audio),
            video_enabled: AtomicBool::new(constraints.video),
            stopped: AtomicUsize::new(0),
        });
        streams.push(stream.clone());
        Ok(stream)
    }
}

/// Peer transport double. Records every call and lets tests inject events.
pub struct FakePeer {
    id: usize,
    auto_connect: bool,
    events: Mutex<Option<mpsc::Sender<PeerEvent>>>,
    stats: Mutex<TransportStats>,
    stats_calls: AtomicUsize,
    offers: Mutex<Vec<bool>>,
    local_descriptions: Mutex<Vec<SessionDescription>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    streams: AtomicUsize,
    closed: AtomicBool,
}

impl FakePeer {
    fn with_events(id: usize, auto_connect: bool, events: Option<mpsc::Sender<PeerEvent>>) -> Self {
        Self {
            id,
            auto_connect,
            events: Mutex::new(events),
            stats: Mutex::new(TransportStats::default()),
            stats_calls: AtomicUsize::new(0),
            offers: Mutex::new(Vec::new()),
            local_descriptions: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            streams: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// A peer with no event stream, for driving stats directly.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::with_events(0, false, None))
    }

    pub fn emit(&self, event: PeerEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.try_send(event);
        }
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    /// `ice_restart` flag of every offer created, in order.
    pub fn offers(&self) -> Vec<bool> {
        self.offers.lock().unwrap().clone()
    }

    pub fn local_descriptions(&self) -> Vec<SessionDescription> {
        self.local_descriptions.lock().unwrap().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote_descriptions.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn gathered_candidate(&self) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{} 1 udp 2122260223 10.0.0.{} 9 typ host",
            self.id, self.id
        ))
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0)
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn add_stream(&self, _stream: Arc<dyn LocalStream>) -> Result<(), anyhow::Error> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, anyhow::Error> {
        let mut offers = self.offers.lock().unwrap();
        offers.push(ice_restart);
        Ok(SessionDescription::offer(format!(
            "v=0 peer{} offer{}",
            self.id,
            offers.len()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error> {
        Ok(SessionDescription::answer(format!("v=0 peer{} answer", self.id)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        self.local_descriptions.lock().unwrap().push(description);
        self.emit(PeerEvent::LocalCandidate(self.gathered_candidate()));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        self.remote_descriptions.lock().unwrap().push(description);
        if self.auto_connect {
            self.emit(PeerEvent::ConnectionState(
                callcore::state::PeerConnectionState::Connected,
            ));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, anyhow::Error> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.stats.lock().unwrap().clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    auto_connect: bool,
    failing_creates: AtomicUsize,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers report `Connected` as soon as a remote description is applied.
    pub fn auto_connecting() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    pub fn peers(&self) -> Vec<Arc<FakePeer>> {
        self.peers.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Arc<FakePeer> {
        self.peers.lock().unwrap().last().cloned().expect("no peer created")
    }
}

#[async_trait]
impl PeerTransportFactory for FakePeerFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), anyhow::Error> {
        let failing = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow::anyhow!("scripted transport creation failure"));
        }

        let (tx, rx) = mpsc::channel(64);
        let mut peers = self.peers.lock().unwrap();
        let peer = Arc::new(FakePeer::with_events(peers.len() + 1, self.auto_connect, Some(tx)));
        peers.push(peer.clone());
        Ok((peer, rx))
    }
}

pub fn stats_with(rtt_secs: f64, kind: MediaKind, lost: i64, received: u64) -> TransportStats {
    TransportStats {
        candidate_pairs: vec![CandidatePairStats {
            state: CandidatePairState::Succeeded,
            nominated: true,
            current_round_trip_time: Some(rtt_secs),
        }],
        inbound_rtp: vec![InboundRtpStats {
            kind,
            packets_lost: lost,
            packets_received: received,
        }],
    }
}

#[derive(Default)]
pub struct RecordingNotifications {
    sent: Mutex<Vec<(ParticipantId, ParticipantId, Notification)>>,
    failing: AtomicBool,
}

impl RecordingNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `(recipient, sender, notification)` in delivery order.
    pub fn sent(&self) -> Vec<(ParticipantId, ParticipantId, Notification)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationService for RecordingNotifications {
    async fn notify(
        &self,
        recipient: &ParticipantId,
        sender: &ParticipantId,
        notification: Notification,
    ) -> Result<(), anyhow::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("notification service unavailable"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((recipient.clone(), sender.clone(), notification));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHistory {
    records: Mutex<Vec<(ParticipantId, ParticipantId, u64)>>,
}

impl RecordingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(ParticipantId, ParticipantId, u64)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallHistoryStore for RecordingHistory {
    async fn record_call(
        &self,
        caller: &ParticipantId,
        receiver: &ParticipantId,
        duration_seconds: u64,
    ) -> Result<(), anyhow::Error> {
        self.records
            .lock()
            .unwrap()
            .push((caller.clone(), receiver.clone(), duration_seconds));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlert {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingAlert {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl RingAlert for RecordingAlert {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Every collaborator of a call, kept concrete so tests can inspect them.
pub struct TestCallEnv {
    pub channel: Arc<ScriptedChannelTransport>,
    pub devices: Arc<FakeMediaDevices>,
    pub peers: Arc<FakePeerFactory>,
    pub notifications: Arc<RecordingNotifications>,
    pub history: Arc<RecordingHistory>,
}

impl TestCallEnv {
    pub fn new() -> Self {
        init_logging();
        Self {
            channel: ScriptedChannelTransport::new(SubscribeScript::Subscribe),
            devices: Arc::new(FakeMediaDevices::new()),
            peers: Arc::new(FakePeerFactory::new()),
            notifications: Arc::new(RecordingNotifications::new()),
            history: Arc::new(RecordingHistory::new()),
        }
    }

    pub fn deps(&self) -> CallDependencies {
        CallDependencies {
            channel_transport: self.channel.clone(),
            media_devices: self.devices.clone(),
            peer_factory: self.peers.clone(),
            notifications: self.notifications.clone(),
            history: self.history.clone(),
        }
    }
}
