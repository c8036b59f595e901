// Connection controller: owns the session lifecycle for one user.
//
// `ChatSession` is the caller-facing handle. Each `connect` spawns one
// driver task, the single event loop for that run: it opens the
// transport, subscribes, forwards queued outbound frames, routes inbound
// frames, fires heartbeats and request timeouts, and sleeps between
// reconnect attempts. Caller operations never await; they take the state
// lock, mutate, and return.

mod state;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;

use supportchat_common::protocol::envelope::{generate_message_id, Envelope};
use supportchat_common::types::{ConnectionState, UserId};

use crate::config::{ClientConfig, DestinationConfig, EndpointConfig};
use crate::error::SessionError;
use crate::heartbeat::HeartbeatScheduler;
use crate::pending::PendingReply;
use crate::reconnect::ReconnectPolicy;
use crate::router::RouterStats;
use crate::subscription::SubscriptionRegistry;
use crate::transport::{sleep_until_opt, Link, Transport, TransportError};

use state::{ControllerState, Outbound};

const EVENT_CAPACITY: usize = 256;

// ── Options ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub endpoint: EndpointConfig,
    pub destinations: DestinationConfig,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl SessionOptions {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            destinations: config.destinations.clone(),
            reconnect: config.session.reconnect_policy(),
            heartbeat_interval: config.session.heartbeat_interval(),
            request_timeout: config.session.request_timeout(),
            connect_timeout: config.session.connect_timeout(),
        }
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// Notifications for observers registered via [`ChatSession::events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    Connected { user_id: UserId },
    /// Transport lost or caller disconnect.
    Disconnected { reason: String },
    /// An envelope meant for display.
    Inbound(Envelope),
    SessionAssigned { session_id: String },
    /// Reconnect attempts exhausted.
    Failed { attempts: u32 },
}

// ── Handle ──────────────────────────────────────────────────────────

struct Shared<T: Transport> {
    options: SessionOptions,
    transport: T,
    core: Mutex<ControllerState>,
}

impl<T: Transport> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` only if `epoch` is still the current run.
    fn with_core<R>(&self, epoch: u64, f: impl FnOnce(&mut ControllerState) -> R) -> Option<R> {
        let mut core = self.lock();
        if core.epoch != epoch {
            return None;
        }
        Some(f(&mut core))
    }
}

/// Tears the session down when the last `ChatSession` clone goes away.
/// The driver only holds `Shared`, so it cannot keep this alive.
struct Handle<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Drop for Handle<T> {
    fn drop(&mut self) {
        self.shared.lock().stop("session dropped");
    }
}

/// A realtime support-chat session for one user at a time.
pub struct ChatSession<T: Transport> {
    handle: Arc<Handle<T>>,
}

impl<T: Transport> Clone for ChatSession<T> {
    fn clone(&self) -> Self {
        Self { handle: Arc::clone(&self.handle) }
    }
}

impl<T: Transport> ChatSession<T> {
    pub fn new(options: SessionOptions, transport: T) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let core = ControllerState::new(
            HeartbeatScheduler::new(options.heartbeat_interval),
            SubscriptionRegistry::new(options.destinations.inbound.clone()),
            events,
        );
        let shared = Arc::new(Shared { options, transport, core: Mutex::new(core) });
        Self { handle: Arc::new(Handle { shared }) }
    }

    fn shared(&self) -> &Arc<Shared<T>> {
        &self.handle.shared
    }

    /// Start connecting as `user_id`. Returns once the attempt is
    /// scheduled; watch [`events`](Self::events) or [`status`](Self::status)
    /// for the outcome. Must be called from within a Tokio runtime.
    pub fn connect(&self, user_id: UserId) -> Result<(), SessionError> {
        let shared = self.shared();
        let url = shared
            .options
            .endpoint
            .url(user_id)
            .map_err(|e| SessionError::InvalidEndpoint(e.to_string()))?;

        let mut core = shared.lock();
        if core.user_id == Some(user_id) && core.state.is_active() {
            debug!(user_id = %user_id, state = %core.state, "connect ignored, session already active");
            return Ok(());
        }
        if core.state.is_active() {
            core.stop("switching user");
        }

        core.epoch += 1;
        core.failures = 0;
        core.user_id = Some(user_id);
        core.session_id = None;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        core.outbound = Some(outbound_tx);
        core.shutdown = Some(shutdown_tx);
        core.set_state(ConnectionState::Connecting);

        let run = Run { epoch: core.epoch, user_id, url, outbound_rx, shutdown_rx };
        drop(core);

        info!(user_id = %user_id, url = %run.url, "chat session starting");
        tokio::spawn(drive(Arc::clone(shared), run));
        Ok(())
    }

    /// Tear the session down: stop heartbeats, cancel any scheduled
    /// reconnect, drop the subscription and reject every pending request
    /// with `Cancelled`. Idempotent.
    pub fn disconnect(&self) {
        let mut core = self.shared().lock();
        core.stop("client disconnect");
        core.user_id = None;
    }

    pub fn status(&self) -> ConnectionState {
        self.shared().lock().state
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.shared().lock().user_id
    }

    /// Session id assigned by the server after `USER_CONNECT`.
    pub fn session_id(&self) -> Option<String> {
        self.shared().lock().session_id.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.shared().lock().pending.len()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.shared().lock().router.stats()
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared().lock().subscribe_events()
    }

    /// Fire-and-forget on the chat destination.
    pub fn send(&self, envelope: Envelope) -> Result<(), SessionError> {
        let shared = self.shared();
        let core = shared.lock();
        core.ensure_connected()?;
        let body = envelope.encode().map_err(|e| SessionError::Protocol(e.to_string()))?;
        core.enqueue(&shared.options.destinations.chat, body)
    }

    /// Send on the chat destination and await a correlated reply.
    ///
    /// The envelope's `messageId` is generated when absent. The pending
    /// entry exists before the frame is queued, so even an immediate reply
    /// finds it.
    pub fn request(&self, envelope: Envelope) -> Result<PendingReply, SessionError> {
        let shared = self.shared();
        let mut core = shared.lock();
        core.ensure_connected()?;
        request_locked(shared, &mut core, envelope)
    }

    /// Send a user chat message from the connected identity.
    pub fn send_chat(&self, content: impl Into<String>) -> Result<PendingReply, SessionError> {
        let shared = self.shared();
        let mut core = shared.lock();
        let user_id = core.ensure_connected()?;
        let envelope = Envelope::chat(generate_message_id(), content, user_id);
        request_locked(shared, &mut core, envelope)
    }

    /// Announce the user; the server answers with a session id.
    pub fn send_user_connect(&self) -> Result<(), SessionError> {
        let shared = self.shared();
        let core = shared.lock();
        let user_id = core.ensure_connected()?;
        let body = Envelope::user_connect(user_id)
            .encode()
            .map_err(|e| SessionError::Protocol(e.to_string()))?;
        core.enqueue(&shared.options.destinations.chat, body)
    }
}

fn request_locked<T: Transport>(
    shared: &Shared<T>,
    core: &mut ControllerState,
    mut envelope: Envelope,
) -> Result<PendingReply, SessionError> {
    let message_id = envelope.message_id.get_or_insert_with(generate_message_id).clone();
    let body = envelope.encode().map_err(|e| SessionError::Protocol(e.to_string()))?;
    let reply = core.pending.register(message_id.clone(), shared.options.request_timeout, Instant::now());
    if let Err(error) = core.enqueue(&shared.options.destinations.chat, body) {
        core.pending.settle(&message_id, Err(error.clone()));
        return Err(error);
    }
    Ok(reply)
}

// ── Driver ──────────────────────────────────────────────────────────

struct Run {
    epoch: u64,
    user_id: UserId,
    url: Url,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    shutdown_rx: watch::Receiver<bool>,
}

enum Exit {
    Shutdown,
    /// Link was up and then dropped.
    Lost(TransportError),
    /// Link opened but never reached `Connected`.
    SetupFailed(TransportError),
}

async fn drive<T: Transport>(shared: Arc<Shared<T>>, run: Run) {
    let Run { epoch, user_id, url, mut outbound_rx, mut shutdown_rx } = run;
    let policy = shared.options.reconnect;

    loop {
        if shared.with_core(epoch, |core| core.set_state(ConnectionState::Connecting)).is_none() {
            return;
        }
        debug!(user_id = %user_id, "opening transport");

        let opened = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            opened = timeout(shared.options.connect_timeout, shared.transport.open(&url, user_id)) => {
                opened.unwrap_or_else(|_| Err(TransportError::Connect("connect timed out".into())))
            }
        };

        let failure = match opened {
            Ok(mut link) => {
                let exit =
                    serve(&shared, epoch, user_id, &mut link, &mut outbound_rx, &mut shutdown_rx).await;
                match exit {
                    Exit::Shutdown => {
                        link.close().await;
                        return;
                    }
                    Exit::Lost(error) => {
                        let Some(delay) =
                            shared.with_core(epoch, |core| core.on_transport_lost(&error, &policy))
                        else {
                            return;
                        };
                        // Frames queued for the dead link are not replayed.
                        let mut discarded = 0usize;
                        while outbound_rx.try_recv().is_ok() {
                            discarded += 1;
                        }
                        if discarded > 0 {
                            debug!(discarded, "dropped outbound frames queued before transport loss");
                        }
                        Ok(delay)
                    }
                    Exit::SetupFailed(error) => Err(error),
                }
            }
            Err(error) => Err(error),
        };

        let delay = match failure {
            Ok(delay) => delay,
            Err(error) => {
                match shared.with_core(epoch, |core| core.on_attempt_failed(&error, &policy)) {
                    Some(Some(delay)) => delay,
                    _ => return,
                }
            }
        };

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Subscribe, then pump the link until it drops or the run is stopped.
async fn serve<T: Transport>(
    shared: &Shared<T>,
    epoch: u64,
    user_id: UserId,
    link: &mut T::Link,
    outbound_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Exit {
    let Some(subscription) = shared.with_core(epoch, |core| core.subscriptions.establish()) else {
        return Exit::Shutdown;
    };
    if let Err(error) = link.subscribe(&subscription).await {
        return Exit::SetupFailed(error);
    }
    if shared.with_core(epoch, |core| core.on_connected(Instant::now())).is_none() {
        return Exit::Shutdown;
    }

    loop {
        let Some((beat_due, expiry_due)) = shared
            .with_core(epoch, |core| (core.heartbeat.next_due(), core.pending.next_deadline()))
        else {
            return Exit::Shutdown;
        };

        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return Exit::Shutdown,
            _ = sleep_until_opt(expiry_due) => {
                shared.with_core(epoch, |core| core.pending.expire(Instant::now()));
            }
            _ = sleep_until_opt(beat_due) => {
                let beat = shared
                    .with_core(epoch, |core| core.heartbeat.poll(Instant::now(), user_id))
                    .flatten();
                if let Some(beat) = beat {
                    match beat.encode() {
                        Ok(body) => {
                            if let Err(error) = link.send(&shared.options.destinations.heartbeat, body).await {
                                return Exit::Lost(error);
                            }
                        }
                        Err(error) => warn!(%error, "failed to encode heartbeat"),
                    }
                }
            }
            Some(outbound) = outbound_rx.recv() => {
                if let Err(error) = link.send(&outbound.destination, outbound.body).await {
                    return Exit::Lost(error);
                }
            }
            inbound = link.recv() => match inbound {
                Ok(Some(frame)) => {
                    if shared.with_core(epoch, |core| core.dispatch(&frame.body)).is_none() {
                        return Exit::Shutdown;
                    }
                }
                Ok(None) => return Exit::Lost(TransportError::Closed),
                Err(error) => return Exit::Lost(error),
            },
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use supportchat_common::protocol::envelope::{EnvelopeType, Sender};

    use crate::subscription::Subscription;
    use crate::transport::InboundFrame;

    type Script = Result<Option<InboundFrame>, TransportError>;

    /// What the controller did on a mock link.
    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Sent {
        Subscribe(Subscription),
        Frame { destination: String, body: String },
        Close,
    }

    /// Server end of one mock link, handed to the test on every `open`.
    struct MockServer {
        sent_rx: mpsc::UnboundedReceiver<Sent>,
        inbound_tx: mpsc::UnboundedSender<Script>,
    }

    impl MockServer {
        async fn next(&mut self) -> Sent {
            timeout(Duration::from_secs(600), self.sent_rx.recv())
                .await
                .expect("link activity before timeout")
                .expect("link still open")
        }

        /// Next frame on `destination`, skipping everything else.
        async fn next_on(&mut self, destination: &str) -> Envelope {
            loop {
                if let Sent::Frame { destination: dest, body } = self.next().await {
                    if dest == destination {
                        return Envelope::decode(&body).expect("controller sends valid json");
                    }
                }
            }
        }

        fn push(&self, body: &str) {
            self.inbound_tx.send(Ok(Some(InboundFrame::new(body)))).expect("link alive");
        }

        fn fail(&self, error: TransportError) {
            self.inbound_tx.send(Err(error)).expect("link alive");
        }
    }

    struct MockLink {
        sent_tx: mpsc::UnboundedSender<Sent>,
        inbound_rx: mpsc::UnboundedReceiver<Script>,
    }

    impl Link for MockLink {
        async fn send(&mut self, destination: &str, body: String) -> Result<(), TransportError> {
            let _ = self.sent_tx.send(Sent::Frame { destination: destination.to_string(), body });
            Ok(())
        }

        async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
            let _ = self.sent_tx.send(Sent::Subscribe(subscription.clone()));
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<InboundFrame>, TransportError> {
            match self.inbound_rx.recv().await {
                Some(scripted) => scripted,
                None => Ok(None),
            }
        }

        async fn close(&mut self) {
            let _ = self.sent_tx.send(Sent::Close);
        }
    }

    /// Scripted outcome for one `open`.
    enum OpenScript {
        Fail(TransportError),
        /// Never completes; only the connect timeout ends it.
        Hang,
    }

    /// Transport with scripted open results; unscripted opens succeed.
    #[derive(Clone)]
    struct MockTransport {
        opens: Arc<AtomicUsize>,
        script: Arc<Mutex<VecDeque<OpenScript>>>,
        servers: mpsc::UnboundedSender<MockServer>,
    }

    impl MockTransport {
        fn new() -> (Self, mpsc::UnboundedReceiver<MockServer>) {
            let (servers, servers_rx) = mpsc::unbounded_channel();
            let transport = Self {
                opens: Arc::new(AtomicUsize::new(0)),
                script: Arc::new(Mutex::new(VecDeque::new())),
                servers,
            };
            (transport, servers_rx)
        }

        fn fail_next(&self, count: usize) {
            let mut script = self.script.lock().unwrap();
            for _ in 0..count {
                script.push_back(OpenScript::Fail(TransportError::Connect("connection refused".into())));
            }
        }

        fn hang_next(&self, count: usize) {
            let mut script = self.script.lock().unwrap();
            for _ in 0..count {
                script.push_back(OpenScript::Hang);
            }
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        type Link = MockLink;

        async fn open(&self, _url: &Url, _user_id: UserId) -> Result<MockLink, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let scripted = self.script.lock().unwrap().pop_front();
            match scripted {
                Some(OpenScript::Fail(error)) => return Err(error),
                Some(OpenScript::Hang) => std::future::pending::<()>().await,
                None => {}
            }
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let _ = self.servers.send(MockServer { sent_rx, inbound_tx });
            Ok(MockLink { sent_tx, inbound_rx })
        }
    }

    const USER: UserId = UserId::new(1001);

    fn session() -> (ChatSession<MockTransport>, MockTransport, mpsc::UnboundedReceiver<MockServer>) {
        let (transport, servers) = MockTransport::new();
        let session = ChatSession::new(SessionOptions::default(), transport.clone());
        (session, transport, servers)
    }

    async fn next_server(servers: &mut mpsc::UnboundedReceiver<MockServer>) -> MockServer {
        timeout(Duration::from_secs(600), servers.recv())
            .await
            .expect("transport opened before timeout")
            .expect("transport alive")
    }

    async fn wait_for_state(events: &mut broadcast::Receiver<SessionEvent>, want: ConnectionState) {
        timeout(Duration::from_secs(600), async {
            loop {
                if let SessionEvent::StateChanged(state) = events.recv().await.expect("events open") {
                    if state == want {
                        return;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {want}"));
    }

    /// Connect and wait until the session is usable.
    async fn connected() -> (
        ChatSession<MockTransport>,
        MockTransport,
        mpsc::UnboundedReceiver<MockServer>,
        MockServer,
    ) {
        let (session, transport, mut servers) = session();
        let mut events = session.events();
        session.connect(USER).unwrap();
        let mut server = next_server(&mut servers).await;
        assert!(matches!(server.next().await, Sent::Subscribe(_)));
        wait_for_state(&mut events, ConnectionState::Connected).await;
        (session, transport, servers, server)
    }

    fn chat_response(message_id: &str, code: i64, message: &str) -> String {
        format!(
            r#"{{"type":"CHAT_RESPONSE","messageId":"{message_id}","code":{code},"message":"{message}"}}"#
        )
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn connect_establishes_exactly_one_subscription() {
        let (session, transport, mut servers) = session();
        let mut events = session.events();
        assert_eq!(session.status(), ConnectionState::Disconnected);

        session.connect(USER).unwrap();
        assert_eq!(session.status(), ConnectionState::Connecting);

        let mut server = next_server(&mut servers).await;
        match server.next().await {
            Sent::Subscribe(sub) => {
                assert_eq!(sub.id, "sub-0");
                assert_eq!(sub.destination, "/user/queue/messages");
            }
            other => panic!("expected subscribe, got {other:?}"),
        }
        wait_for_state(&mut events, ConnectionState::Connected).await;
        assert_eq!(session.status(), ConnectionState::Connected);
        assert_eq!(session.user_id(), Some(USER));
        assert_eq!(transport.opens(), 1);
        assert!(server.sent_rx.try_recv().is_err(), "no second subscription");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_connect_with_same_identity_is_a_noop() {
        let (session, transport, mut servers) = session();
        let mut events = session.events();
        session.connect(USER).unwrap();
        session.connect(USER).unwrap();
        let _server = next_server(&mut servers).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;
        session.connect(USER).unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(session.status(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connecting_as_another_user_replaces_the_session() {
        let (session, transport, mut servers, mut old_server) = connected().await;

        session.connect(UserId::new(2002)).unwrap();
        assert_eq!(old_server.next().await, Sent::Close);
        let _new_server = next_server(&mut servers).await;
        assert_eq!(session.user_id(), Some(UserId::new(2002)));
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_end_in_failed() {
        let (session, transport, _servers) = session();
        let mut events = session.events();
        transport.fail_next(5);
        session.connect(USER).unwrap();

        let mut saw_reconnecting = false;
        let attempts = timeout(Duration::from_secs(600), async {
            loop {
                match events.recv().await.expect("events open") {
                    SessionEvent::StateChanged(ConnectionState::Reconnecting) => saw_reconnecting = true,
                    SessionEvent::Failed { attempts } => return attempts,
                    _ => {}
                }
            }
        })
        .await
        .expect("session should fail");

        assert!(saw_reconnecting);
        assert_eq!(attempts, 5);
        assert_eq!(session.status(), ConnectionState::Failed);
        assert_eq!(transport.opens(), 5);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.opens(), 5, "no attempts after failing");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_failed_starts_over() {
        let (session, transport, mut servers) = session();
        let mut events = session.events();
        transport.fail_next(5);
        session.connect(USER).unwrap();
        wait_for_state(&mut events, ConnectionState::Failed).await;

        session.connect(USER).unwrap();
        let _server = next_server(&mut servers).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;
        assert_eq!(transport.opens(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn open_hanging_past_connect_timeout_counts_as_a_failure() {
        let (transport, _servers) = MockTransport::new();
        let options = SessionOptions {
            reconnect: ReconnectPolicy::fixed(Duration::from_secs(3), 2),
            ..SessionOptions::default()
        };
        let connect_timeout = options.connect_timeout;
        let session = ChatSession::new(options, transport.clone());
        let mut events = session.events();
        transport.hang_next(2);
        let started = Instant::now();
        session.connect(USER).unwrap();

        wait_for_state(&mut events, ConnectionState::Reconnecting).await;
        assert_eq!(started.elapsed(), connect_timeout);

        let attempts = timeout(Duration::from_secs(600), async {
            loop {
                if let SessionEvent::Failed { attempts } = events.recv().await.expect("events open") {
                    return attempts;
                }
            }
        })
        .await
        .expect("hung opens exhaust the policy");
        assert_eq!(attempts, 2);
        assert_eq!(started.elapsed(), connect_timeout * 2 + Duration::from_secs(3));
        assert_eq!(session.status(), ConnectionState::Failed);
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_below_the_limit_recover() {
        let (session, transport, mut servers) = session();
        let mut events = session.events();
        transport.fail_next(4);
        let started = Instant::now();
        session.connect(USER).unwrap();

        let _server = next_server(&mut servers).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;
        assert_eq!(transport.opens(), 5);
        assert!(started.elapsed() >= Duration::from_secs(12), "4 fixed 3s delays");
    }

    // ── Heartbeat ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn heartbeats_flow_only_while_connected() {
        let (session, _transport, _servers, mut server) = connected().await;
        let start = Instant::now();

        let beat = server.next_on("/app/heartbeat").await;
        assert_eq!(beat.kind, EnvelopeType::Heartbeat);
        assert_eq!(beat.user_id, Some(USER));
        assert!(beat.timestamp.is_some());
        assert_eq!(start.elapsed(), Duration::from_secs(30));

        server.next_on("/app/heartbeat").await;
        assert_eq!(start.elapsed(), Duration::from_secs(60), "one beat per period");

        session.disconnect();
        assert_eq!(server.next().await, Sent::Close);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(server.sent_rx.try_recv().is_err(), "no heartbeat after disconnect");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_stop_while_reconnecting() {
        let (session, transport, mut servers, mut server) = connected().await;
        let connected_at = Instant::now();
        let mut events = session.events();
        // Keep reconnecting past the first beat's original due time.
        transport.fail_next(4);

        tokio::time::sleep(Duration::from_secs(20)).await;
        server.fail(TransportError::Io("connection reset".into()));
        wait_for_state(&mut events, ConnectionState::Reconnecting).await;

        tokio::time::sleep_until(connected_at + Duration::from_secs(31)).await;
        assert_eq!(session.status(), ConnectionState::Reconnecting);
        assert!(!session.shared().lock().heartbeat.is_running());
        assert!(server.sent_rx.try_recv().is_err(), "no heartbeat on the dead link");

        let mut fresh = next_server(&mut servers).await;
        assert!(matches!(fresh.next().await, Sent::Subscribe(_)));
        let reconnected_at = Instant::now();
        assert_eq!(transport.opens(), 6);

        fresh.next_on("/app/heartbeat").await;
        assert_eq!(reconnected_at.elapsed(), Duration::from_secs(30), "schedule restarts on connect");
    }

    // ── Request correlation ─────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn replies_settle_by_message_id() {
        let (session, _transport, _servers, mut server) = connected().await;

        let m1 = session.request(Envelope::chat("m1", "hello", USER)).unwrap();
        let m2 = session.request(Envelope::chat("m2", "again", USER)).unwrap();
        let m3 = session.request(Envelope::chat("m3", "anyone?", USER)).unwrap();
        assert_eq!(session.pending_count(), 3);

        for expected in ["m1", "m2", "m3"] {
            let sent = server.next_on("/app/chat").await;
            assert_eq!(sent.message_id.as_deref(), Some(expected));
        }

        server.push(&chat_response("m2", 1, "rejected"));
        server.push(&chat_response("m1", 0, "ok"));

        let ack = m1.await.expect("m1 succeeds");
        assert_eq!(ack.message_id, "m1");
        assert_eq!(ack.code, 0);
        assert_eq!(
            m2.await,
            Err(SessionError::RemoteRejected { code: 1, message: "rejected".into() })
        );

        assert_eq!(m3.await, Err(SessionError::Timeout));
        assert_eq!(session.pending_count(), 0);

        // Late reply for the timed-out request changes nothing.
        server.push(&chat_response("m3", 0, "late"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.pending_count(), 0);
        assert_eq!(session.status(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn send_chat_generates_id_and_sender() {
        let (session, _transport, _servers, mut server) = connected().await;
        let reply = session.send_chat("where is my order?").unwrap();

        let sent = server.next_on("/app/chat").await;
        assert_eq!(sent.kind, EnvelopeType::Chat);
        assert_eq!(sent.content.as_deref(), Some("where is my order?"));
        assert_eq!(sent.sender, Some(Sender::Id(1001)));
        let message_id = sent.message_id.expect("generated id");
        assert!(message_id.starts_with("msg_"));
        assert_eq!(reply.message_id(), message_id);

        server.push(&chat_response(&message_id, 0, "received"));
        let ack = reply.await.expect("acknowledged");
        assert_eq!(ack.message.as_deref(), Some("received"));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_every_pending_request() {
        let (session, _transport, _servers, _server) = connected().await;
        let replies: Vec<_> = (0..4).map(|i| session.send_chat(format!("msg {i}")).unwrap()).collect();
        assert_eq!(session.pending_count(), 4);

        session.disconnect();
        assert_eq!(session.status(), ConnectionState::Disconnected);
        assert_eq!(session.pending_count(), 0);
        for reply in replies {
            assert_eq!(reply.await, Err(SessionError::Cancelled));
        }

        session.disconnect();
        assert_eq!(session.status(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_require_a_connected_session() {
        let (session, _transport, _servers) = session();
        assert_eq!(session.send(Envelope::new(EnvelopeType::Chat)), Err(SessionError::NotConnected));
        assert!(matches!(session.send_chat("hi"), Err(SessionError::NotConnected)));
        assert_eq!(session.send_user_connect(), Err(SessionError::NotConnected));

        session.connect(USER).unwrap();
        assert!(matches!(session.send_chat("too early"), Err(SessionError::NotConnected)));
        assert_eq!(session.pending_count(), 0);
    }

    // ── Transport loss ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn transport_loss_rejects_pending_and_resubscribes() {
        let (session, transport, mut servers, server) = connected().await;
        let mut events = session.events();
        let reply = session.send_chat("in flight").unwrap();

        server.fail(TransportError::Io("connection reset".into()));
        assert_eq!(reply.await, Err(SessionError::TransportLost));
        wait_for_state(&mut events, ConnectionState::Reconnecting).await;

        let mut next = next_server(&mut servers).await;
        match next.next().await {
            Sent::Subscribe(sub) => assert_eq!(sub.id, "sub-1"),
            other => panic!("expected fresh subscription, got {other:?}"),
        }
        wait_for_state(&mut events, ConnectionState::Connected).await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn server_close_triggers_reconnect() {
        let (session, _transport, mut servers, server) = connected().await;
        let mut events = session.events();
        drop(server);

        let disconnected = timeout(Duration::from_secs(60), async {
            loop {
                if let SessionEvent::Disconnected { reason } = events.recv().await.unwrap() {
                    return reason;
                }
            }
        })
        .await
        .expect("disconnect event");
        assert!(disconnected.contains("closed"));
        let _next = next_server(&mut servers).await;
        wait_for_state(&mut events, ConnectionState::Connected).await;
    }

    // ── Inbound routing ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn only_system_chat_pushes_reach_observers() {
        let (session, _transport, _servers, server) = connected().await;
        let mut events = session.events();

        server.push(r#"{"type":"CHAT","sender":42,"content":"spoofed"}"#);
        server.push(r#"{"type":"CHAT","sender":0,"content":"Hi, how can I help?"}"#);
        server.push("{not json");
        server.push(r#"{"type":"AI_RESPONSE","messageId":"a-1","sender":0,"content":"answer"}"#);

        let mut shown = Vec::new();
        while shown.len() < 2 {
            if let SessionEvent::Inbound(envelope) = events.recv().await.unwrap() {
                shown.push(envelope.content.unwrap_or_default());
            }
        }
        assert_eq!(shown, vec!["Hi, how can I help?", "answer"]);

        let stats = session.router_stats();
        assert_eq!(stats.suppressed, 1);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.displayed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn user_connect_captures_session_id() {
        let (session, _transport, _servers, mut server) = connected().await;
        let mut events = session.events();
        session.send_user_connect().unwrap();

        let sent = server.next_on("/app/chat").await;
        assert_eq!(sent.kind, EnvelopeType::UserConnect);
        assert_eq!(sent.user_id, Some(USER));

        server.push(r#"{"type":"USER_CONNECT_RESPONSE","success":true,"sessionId":"s-42"}"#);
        loop {
            if let SessionEvent::SessionAssigned { session_id } = events.recv().await.unwrap() {
                assert_eq!(session_id, "s-42");
                break;
            }
        }
        assert_eq!(session.session_id().as_deref(), Some("s-42"));

        session.disconnect();
        assert_eq!(session.session_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_last_handle_closes_the_link() {
        let (session, _transport, _servers, mut server) = connected().await;
        let clone = session.clone();
        drop(session);
        assert_eq!(clone.status(), ConnectionState::Connected);
        drop(clone);
        assert_eq!(server.next().await, Sent::Close);
    }
}
