//! In-memory collaborators for unit tests
//!
//! Every fake yields a few times per call to mimic a network round-trip, so
//! concurrent callers interleave the way they would against a real SFU.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::credentials::{MockCredentialProvider, SessionCredentials};
use crate::error::ChannelError;
use crate::media::{LocalMedia, MediaConstraints, MediaDevices, MediaTrack};
use crate::negotiator::{
    CapabilityNegotiator, ConsumerHandle, ProducerHandle, RecvTransportHandle,
    SendTransportHandle, TransportHandle, TransportListener,
};
use crate::session::{Collaborators, SfuSession};
use crate::signaling::{
    CreateTransportRequest, ServerEvent, SignalingChannel, SignalingConnector,
};
use crate::types::{
    ConsumerDescriptor, ConsumerId, DtlsParameters, MediaKind, ParticipantId,
    ProducerAnnouncement, ProducerId, RoomId, RtpCapabilities, RtpParameters,
    TransportDirection, TransportId, TransportParams,
};

async fn network_delay() {
    for _ in 0..3 {
        tokio::task::yield_now().await;
    }
}

/// Let spawned tasks run until everything is idle (needs a paused clock)
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Yield until `condition` holds, without advancing the paused clock
pub async fn yield_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

pub fn new_producer(producer: &str, participant: &str, kind: MediaKind) -> ServerEvent {
    ServerEvent::NewProducer(ProducerAnnouncement::new(producer, participant, kind))
}

pub fn peer_disconnected(participant: &str) -> ServerEvent {
    ServerEvent::PeerDisconnected {
        participant_id: ParticipantId::from(participant),
    }
}

/// Router side of the signaling channel
#[derive(Default)]
pub struct FakeSignaling {
    next_id: AtomicUsize,
    send_creates: AtomicUsize,
    recv_creates: AtomicUsize,
    connects: AtomicUsize,
    produces: AtomicUsize,
    consumes: AtomicUsize,
    closes: AtomicUsize,
    create_failures: Mutex<VecDeque<String>>,
    connect_failure: Mutex<Option<String>>,
    consume_failures: Mutex<HashSet<ProducerId>>,
    producer_kinds: Mutex<HashMap<ProducerId, MediaKind>>,
    consumed: Mutex<Vec<ProducerId>>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn fail_next_create_transport(&self, message: &str) {
        self.create_failures.lock().push_back(message.to_string());
    }

    pub fn fail_connect(&self, message: &str) {
        *self.connect_failure.lock() = Some(message.to_string());
    }

    pub fn fail_consume(&self, producer: &str) {
        self.consume_failures.lock().insert(ProducerId::from(producer));
    }

    /// Kind reported in consumer descriptors for `producer` (video otherwise)
    pub fn register_producer(&self, producer: &str, kind: MediaKind) {
        self.producer_kinds.lock().insert(ProducerId::from(producer), kind);
    }

    pub fn create_transport_calls(&self, direction: TransportDirection) -> usize {
        match direction {
            TransportDirection::Send => self.send_creates.load(Ordering::SeqCst),
            TransportDirection::Recv => self.recv_creates.load(Ordering::SeqCst),
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn produce_calls(&self) -> usize {
        self.produces.load(Ordering::SeqCst)
    }

    pub fn consume_calls(&self) -> usize {
        self.consumes.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Producers successfully consumed, in request order
    pub fn consumed(&self) -> Vec<String> {
        self.consumed
            .lock()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect()
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn create_transport(
        &self,
        request: CreateTransportRequest,
    ) -> Result<TransportParams, ChannelError> {
        match request.direction {
            TransportDirection::Send => self.send_creates.fetch_add(1, Ordering::SeqCst),
            TransportDirection::Recv => self.recv_creates.fetch_add(1, Ordering::SeqCst),
        };
        network_delay().await;

        if let Some(message) = self.create_failures.lock().pop_front() {
            return Err(ChannelError::Remote(message));
        }

        Ok(TransportParams {
            id: TransportId::new(self.next_id(request.direction.as_str())),
            ice_parameters: serde_json::json!({ "usernameFragment": "frag" }),
            ice_candidates: Vec::new(),
            dtls_parameters: DtlsParameters::default(),
        })
    }

    async fn connect_transport(
        &self,
        _transport_id: &TransportId,
        _dtls_parameters: DtlsParameters,
    ) -> Result<(), ChannelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        network_delay().await;

        match self.connect_failure.lock().clone() {
            Some(message) => Err(ChannelError::Remote(message)),
            None => Ok(()),
        }
    }

    async fn produce(
        &self,
        _transport_id: &TransportId,
        kind: MediaKind,
        _rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, ChannelError> {
        self.produces.fetch_add(1, Ordering::SeqCst);
        network_delay().await;
        Ok(ProducerId::new(self.next_id(kind.as_str())))
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        _rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor, ChannelError> {
        self.consumes.fetch_add(1, Ordering::SeqCst);
        network_delay().await;

        if self.consume_failures.lock().contains(producer_id) {
            return Err(ChannelError::Remote(format!("cannot consume {producer_id}")));
        }

        let kind = self
            .producer_kinds
            .lock()
            .get(producer_id)
            .copied()
            .unwrap_or(MediaKind::Video);
        self.consumed.lock().push(producer_id.clone());

        Ok(ConsumerDescriptor {
            id: ConsumerId::new(self.next_id("consumer")),
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters: RtpParameters::default(),
        })
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Open-handle counters shared between the negotiator and its handles
#[derive(Default)]
struct OpenCounts {
    send_transports: AtomicUsize,
    recv_transports: AtomicUsize,
    producers: AtomicUsize,
    consumers: AtomicUsize,
}

/// Counts handles it builds and tracks which are still open
#[derive(Default)]
pub struct FakeNegotiator {
    send_created: AtomicUsize,
    recv_created: AtomicUsize,
    open: Arc<OpenCounts>,
    load_failure: Mutex<Option<String>>,
    produce_failures: Arc<Mutex<HashSet<MediaKind>>>,
}

impl FakeNegotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_load(&self, message: &str) {
        *self.load_failure.lock() = Some(message.to_string());
    }

    pub fn fail_produce(&self, kind: MediaKind) {
        self.produce_failures.lock().insert(kind);
    }

    pub fn send_transports_created(&self) -> usize {
        self.send_created.load(Ordering::SeqCst)
    }

    pub fn recv_transports_created(&self) -> usize {
        self.recv_created.load(Ordering::SeqCst)
    }

    pub fn open_send_transports(&self) -> usize {
        self.open.send_transports.load(Ordering::SeqCst)
    }

    pub fn open_recv_transports(&self) -> usize {
        self.open.recv_transports.load(Ordering::SeqCst)
    }

    pub fn open_producers(&self) -> usize {
        self.open.producers.load(Ordering::SeqCst)
    }

    pub fn open_consumers(&self) -> usize {
        self.open.consumers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityNegotiator for FakeNegotiator {
    async fn load(&self, router_capabilities: &RtpCapabilities) -> anyhow::Result<RtpCapabilities> {
        network_delay().await;
        if let Some(message) = self.load_failure.lock().clone() {
            anyhow::bail!(message);
        }
        Ok(router_capabilities.clone())
    }

    async fn create_send_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> anyhow::Result<Arc<dyn SendTransportHandle>> {
        network_delay().await;
        self.send_created.fetch_add(1, Ordering::SeqCst);
        self.open.send_transports.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(FakeSendTransport {
            inner: FakeTransport::new(params.id, listener, Arc::clone(&self.open)),
            produce_failures: Arc::clone(&self.produce_failures),
        }))
    }

    async fn create_recv_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> anyhow::Result<Arc<dyn RecvTransportHandle>> {
        network_delay().await;
        self.recv_created.fetch_add(1, Ordering::SeqCst);
        self.open.recv_transports.fetch_add(1, Ordering::SeqCst);

        Ok(Arc::new(FakeRecvTransport {
            inner: FakeTransport::new(params.id, listener, Arc::clone(&self.open)),
        }))
    }
}

struct FakeTransport {
    id: TransportId,
    listener: Arc<dyn TransportListener>,
    connected: AtomicBool,
    closed: AtomicBool,
    open: Arc<OpenCounts>,
}

impl FakeTransport {
    fn new(id: TransportId, listener: Arc<dyn TransportListener>, open: Arc<OpenCounts>) -> Self {
        Self {
            id,
            listener,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            open,
        }
    }

    /// Raise `on_connect` before the first flow, like a real transport does
    async fn connect_once(&self) -> anyhow::Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            self.listener.on_connect(DtlsParameters::default()).await?;
            self.connected.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// True the first time only
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

struct FakeSendTransport {
    inner: FakeTransport,
    produce_failures: Arc<Mutex<HashSet<MediaKind>>>,
}

impl TransportHandle for FakeSendTransport {
    fn id(&self) -> &TransportId {
        &self.inner.id
    }

    fn close(&self) {
        if self.inner.mark_closed() {
            self.inner.open.send_transports.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SendTransportHandle for FakeSendTransport {
    async fn produce(&self, track: &MediaTrack) -> anyhow::Result<Box<dyn ProducerHandle>> {
        self.inner.connect_once().await?;
        if self.produce_failures.lock().contains(&track.kind) {
            anyhow::bail!("encoder rejected {} track", track.kind);
        }

        let id = self
            .inner
            .listener
            .on_produce(track.kind, RtpParameters::default())
            .await?;
        self.inner.open.producers.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeProducer {
            id,
            kind: track.kind,
            closed: AtomicBool::new(false),
            open: Arc::clone(&self.inner.open),
        }))
    }
}

struct FakeRecvTransport {
    inner: FakeTransport,
}

impl TransportHandle for FakeRecvTransport {
    fn id(&self) -> &TransportId {
        &self.inner.id
    }

    fn close(&self) {
        if self.inner.mark_closed() {
            self.inner.open.recv_transports.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl RecvTransportHandle for FakeRecvTransport {
    async fn consume(
        &self,
        descriptor: &ConsumerDescriptor,
    ) -> anyhow::Result<Box<dyn ConsumerHandle>> {
        self.inner.connect_once().await?;
        network_delay().await;
        self.inner.open.consumers.fetch_add(1, Ordering::SeqCst);

        let mut consumer = FakeConsumer::new(
            descriptor.id.as_str(),
            descriptor.producer_id.as_str(),
            descriptor.kind,
        );
        consumer.open = Some(Arc::clone(&self.inner.open));
        Ok(Box::new(consumer))
    }
}

struct FakeProducer {
    id: ProducerId,
    kind: MediaKind,
    closed: AtomicBool,
    open: Arc<OpenCounts>,
}

impl ProducerHandle for FakeProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open.producers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Consumer whose clones share one closed flag
#[derive(Clone)]
pub struct FakeConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    closed: Arc<AtomicBool>,
    open: Option<Arc<OpenCounts>>,
}

impl FakeConsumer {
    pub fn new(id: &str, producer: &str, kind: MediaKind) -> Self {
        Self {
            id: ConsumerId::from(id),
            producer_id: ProducerId::from(producer),
            kind,
            closed: Arc::new(AtomicBool::new(false)),
            open: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ConsumerHandle for FakeConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> MediaTrack {
        MediaTrack::new(format!("track-{}", self.id), self.kind)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(open) = &self.open {
                open.consumers.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// Capture devices that hand out one track per requested kind
#[derive(Default)]
pub struct FakeMediaDevices {
    failure: Mutex<Option<String>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl FakeMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_acquire(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> anyhow::Result<LocalMedia> {
        network_delay().await;
        if let Some(message) = self.failure.lock().take() {
            anyhow::bail!(message);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);

        Ok(LocalMedia {
            audio: constraints
                .audio
                .then(|| MediaTrack::new("microphone", MediaKind::Audio)),
            video: constraints
                .video
                .then(|| MediaTrack::new("camera", MediaKind::Video)),
        })
    }

    fn release(&self, _media: LocalMedia) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Opens channels onto a shared [`FakeSignaling`]
///
/// Each open pushes any queued preamble events followed by the router
/// capabilities, unless capabilities are withheld.
pub struct FakeConnector {
    signaling: Arc<FakeSignaling>,
    opens: AtomicUsize,
    failure: Mutex<Option<String>>,
    withhold_capabilities: AtomicBool,
    preamble: Mutex<Vec<ServerEvent>>,
    sender: Mutex<Option<mpsc::Sender<ServerEvent>>>,
}

impl FakeConnector {
    pub fn new(signaling: Arc<FakeSignaling>) -> Self {
        Self {
            signaling,
            opens: AtomicUsize::new(0),
            failure: Mutex::new(None),
            withhold_capabilities: AtomicBool::new(false),
            preamble: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
        }
    }

    pub fn fail_next_open(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    pub fn withhold_capabilities(&self) {
        self.withhold_capabilities.store(true, Ordering::SeqCst);
    }

    /// Events delivered ahead of the router capabilities on the next open
    pub fn queue_before_capabilities(&self, events: Vec<ServerEvent>) {
        self.preamble.lock().extend(events);
    }

    /// Push a server event on the most recently opened channel; dropped if
    /// that channel has been closed
    pub fn push(&self, event: ServerEvent) {
        let sender = self.sender.lock().clone();
        if let Some(sender) = sender {
            let _ = sender.try_send(event);
        }
    }

    pub fn send_capabilities(&self) {
        self.push(ServerEvent::RouterCapabilities(RtpCapabilities::default()));
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingConnector for FakeConnector {
    async fn open(
        &self,
        _credentials: &SessionCredentials,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<ServerEvent>), ChannelError> {
        network_delay().await;
        if let Some(message) = self.failure.lock().take() {
            return Err(ChannelError::Remote(message));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(64);
        for event in self.preamble.lock().drain(..) {
            tx.try_send(event).unwrap();
        }
        if !self.withhold_capabilities.load(Ordering::SeqCst) {
            tx.try_send(ServerEvent::RouterCapabilities(RtpCapabilities::default()))
                .unwrap();
        }
        *self.sender.lock() = Some(tx);

        Ok((Arc::clone(&self.signaling) as Arc<dyn SignalingChannel>, rx))
    }
}

pub fn test_credentials() -> SessionCredentials {
    SessionCredentials {
        signaling_url: "wss://sfu.test/ws".to_string(),
        access_token: nanoid::nanoid!(),
        ice_servers: Vec::new(),
    }
}

pub fn accepting_credentials() -> MockCredentialProvider {
    let mut provider = MockCredentialProvider::new();
    provider
        .expect_acquire()
        .returning(|_, _| Ok(test_credentials()));
    provider
}

/// A session wired to fakes, plus handles to inspect them
pub struct Harness {
    pub session: Arc<SfuSession>,
    pub signaling: Arc<FakeSignaling>,
    pub connector: Arc<FakeConnector>,
    pub negotiator: Arc<FakeNegotiator>,
    pub media: Arc<FakeMediaDevices>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_credentials(accepting_credentials())
    }

    pub fn with_credentials(provider: MockCredentialProvider) -> Self {
        Self::with_config(ClientConfig::default(), provider)
    }

    pub fn with_config(config: ClientConfig, provider: MockCredentialProvider) -> Self {
        let signaling = Arc::new(FakeSignaling::new());
        let connector = Arc::new(FakeConnector::new(Arc::clone(&signaling)));
        let negotiator = Arc::new(FakeNegotiator::new());
        let media = Arc::new(FakeMediaDevices::new());

        let session = SfuSession::new(
            config,
            Collaborators {
                credentials: Arc::new(provider),
                media: Arc::clone(&media) as Arc<dyn MediaDevices>,
                signaling: Arc::clone(&connector) as Arc<dyn SignalingConnector>,
                negotiator: Arc::clone(&negotiator) as Arc<dyn CapabilityNegotiator>,
            },
        );

        Self {
            session: Arc::new(session),
            signaling,
            connector,
            negotiator,
            media,
        }
    }

    /// Connected as participant `me` in `room-1`
    pub async fn connected() -> Self {
        let harness = Self::new();
        harness
            .session
            .connect(RoomId::from("room-1"), ParticipantId::from("me"))
            .await
            .unwrap();
        harness
    }

    pub async fn broadcasting() -> Self {
        let harness = Self::connected().await;
        harness.session.start_broadcast().await.unwrap();
        harness
    }

    /// Announce a remote producer and let the session consume it
    pub async fn announce(&self, producer: &str, participant: &str, kind: MediaKind) {
        self.signaling.register_producer(producer, kind);
        self.connector.push(new_producer(producer, participant, kind));
        settle().await;
    }
}
