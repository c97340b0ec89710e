//! Client state machine: connect, reconnect with backoff, disconnect
//!
//! A [`Client`] drives one [`ConnectionHandler`] at a time. Connecting
//! performs the TCP dial, starts the handler's I/O loop, and fires the
//! identity negotiation; a recv-consumer task then pumps inbound messages to
//! `message` subscribers and owns the reconnect loop when the connection
//! drops. Status is a struct of independent flags (several are legitimately
//! true at once) with a derived primary connection phase.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionHandler;
use crate::types::{CommError, Message, SUBJECT_SHUTDOWN};

/// Deadline for one TCP dial (bind + connect). Expiry is reported as
/// [`CommError::Timeout`] and marks the status with `unexpected_closure`.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for winding down the connection handler during `disconnect`.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial reconnect backoff. Doubles per attempt up to [`BACKOFF_CAP`].
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(15);

/// Poll interval inside the backoff wait, so disabling reconnection is
/// observed promptly.
const BACKOFF_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval of the recv-consumer when the inbound queue is empty.
const CONSUMER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Client status: independent boolean facts, not a linear enum.
///
/// Several flags are typically set at once (`ok` + `connected`, or
/// `reconnecting` + `connecting` + `ok`). The single "current" connection
/// phase is derived by [`phase`](ClientStatus::phase).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatus {
    pub needs_init: bool,
    pub ok: bool,
    pub running: bool,
    pub not_connected: bool,
    pub connecting: bool,
    pub connected: bool,
    pub connect_failed: bool,
    pub reconnecting: bool,
    pub reconnect_failed: bool,
    pub disconnecting: bool,
    pub disconnect_failed: bool,
    pub unexpected_closure: bool,
}

/// The derived primary connection phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    NotConnected,
    Connecting,
    Connected,
}

impl ClientStatus {
    /// Status of a freshly built client: unconfigured and unconnected.
    pub fn fresh() -> Self {
        Self {
            needs_init: true,
            not_connected: true,
            ..Self::default()
        }
    }

    fn connecting() -> Self {
        Self {
            ok: true,
            connecting: true,
            ..Self::default()
        }
    }

    fn connected() -> Self {
        Self {
            ok: true,
            connected: true,
            ..Self::default()
        }
    }

    fn connect_failed(unexpected: bool) -> Self {
        Self {
            connect_failed: true,
            not_connected: true,
            unexpected_closure: unexpected,
            ..Self::default()
        }
    }

    fn reconnecting() -> Self {
        Self {
            ok: true,
            reconnecting: true,
            connecting: true,
            ..Self::default()
        }
    }

    fn reconnect_failed() -> Self {
        Self {
            reconnect_failed: true,
            not_connected: true,
            ..Self::default()
        }
    }

    fn disconnected_clean() -> Self {
        Self {
            ok: true,
            not_connected: true,
            ..Self::default()
        }
    }

    fn disconnect_failed(unexpected: bool) -> Self {
        Self {
            not_connected: true,
            disconnect_failed: true,
            unexpected_closure: unexpected,
            ..Self::default()
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        if self.connected {
            ConnectionPhase::Connected
        } else if self.connecting {
            ConnectionPhase::Connecting
        } else {
            ConnectionPhase::NotConnected
        }
    }

    /// Human-readable name of every set flag, for front-end display.
    pub fn flag_names(&self) -> Vec<&'static str> {
        let flags = [
            (self.needs_init, "needs-init"),
            (self.ok, "ok"),
            (self.running, "running"),
            (self.not_connected, "not-connected"),
            (self.connecting, "connecting"),
            (self.connected, "connected"),
            (self.connect_failed, "connect-failed"),
            (self.reconnecting, "reconnecting"),
            (self.reconnect_failed, "reconnect-failed"),
            (self.disconnecting, "disconnecting"),
            (self.disconnect_failed, "disconnect-failed"),
            (self.unexpected_closure, "unexpected-closure"),
        ];
        flags
            .into_iter()
            .filter_map(|(set, name)| set.then_some(name))
            .collect()
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.flag_names();
        if names.is_empty() {
            write!(f, "undefined")
        } else {
            write!(f, "{}", names.join(" | "))
        }
    }
}

/// The events a client can be subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Reconnect,
    ServerShutdown,
    Message,
    StateChange,
}

impl EventKind {
    /// Parse a subscription verb. Case-insensitive; `-`/`_` separators and a
    /// leading `on` are stripped, so `on-State_Change` means `statechange`.
    pub fn parse(verb: &str) -> Result<Self, CommError> {
        let normalized: String = verb
            .to_ascii_lowercase()
            .chars()
            .filter(|c| !matches!(c, '-' | '_'))
            .collect();
        let normalized = normalized.strip_prefix("on").unwrap_or(&normalized);
        match normalized {
            "connect" => Ok(Self::Connect),
            "disconnect" => Ok(Self::Disconnect),
            "reconnect" => Ok(Self::Reconnect),
            "servershutdown" => Ok(Self::ServerShutdown),
            "message" => Ok(Self::Message),
            "statechange" => Ok(Self::StateChange),
            _ => Err(CommError::UnknownEvent(verb.to_string())),
        }
    }
}

/// Payload delivered to subscriber callbacks.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connect { client_id: String },
    Disconnect,
    Reconnect { client_id: String },
    ServerShutdown,
    Message { message: Message },
    StateChange { from: ClientStatus, to: ClientStatus },
}

#[derive(Debug, Clone, Default)]
struct ClientConfig {
    address: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    interface: Option<String>,
    bind_port: Option<u16>,
}

struct ClientInner {
    attempt_reconnect: AtomicBool,
    config: Mutex<ClientConfig>,
    status: Mutex<ClientStatus>,
    conn: Mutex<Option<Arc<ConnectionHandler>>>,
    subscribers: Mutex<HashMap<EventKind, Vec<mpsc::UnboundedSender<ClientEvent>>>>,
    consumer_run: AtomicBool,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

/// A named client of the messaging layer.
///
/// Configure `address`, `port` and `client_id`, optionally subscribe to
/// events, then [`connect`](Client::connect). Cheap to clone; clones share
/// the same underlying state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Build an unconfigured client. With `attempt_reconnect`, a dropped
    /// connection is re-established automatically with exponential backoff.
    pub fn new(attempt_reconnect: bool) -> Self {
        info!("client inited");
        Self {
            inner: Arc::new(ClientInner {
                attempt_reconnect: AtomicBool::new(attempt_reconnect),
                config: Mutex::new(ClientConfig::default()),
                status: Mutex::new(ClientStatus::fresh()),
                conn: Mutex::new(None),
                subscribers: Mutex::new(HashMap::new()),
                consumer_run: AtomicBool::new(false),
                consumer: Mutex::new(None),
            }),
        }
    }

    /// A fresh 16-character alphanumeric client identity.
    pub fn generate_new_id() -> String {
        const ID_LENGTH: usize = 16;
        let mut rng = rand::thread_rng();
        (0..ID_LENGTH)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect()
    }

    pub fn status(&self) -> ClientStatus {
        *self.inner.status.lock().unwrap()
    }

    pub fn address(&self) -> Option<String> {
        self.inner.config.lock().unwrap().address.clone()
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.config.lock().unwrap().port
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.config.lock().unwrap().client_id.clone()
    }

    pub fn interface(&self) -> Option<String> {
        self.inner.config.lock().unwrap().interface.clone()
    }

    pub fn bind_port(&self) -> Option<u16> {
        self.inner.config.lock().unwrap().bind_port
    }

    pub fn set_address(&self, address: impl Into<String>) -> Result<(), CommError> {
        self.guard_not_running("address")?;
        self.inner.config.lock().unwrap().address = Some(address.into());
        self.inner.refresh_needs_init();
        Ok(())
    }

    pub fn set_port(&self, port: u16) -> Result<(), CommError> {
        self.guard_not_running("port")?;
        self.inner.config.lock().unwrap().port = Some(port);
        self.inner.refresh_needs_init();
        Ok(())
    }

    pub fn set_client_id(&self, client_id: impl Into<String>) -> Result<(), CommError> {
        self.guard_not_running("client id")?;
        self.inner.config.lock().unwrap().client_id = Some(client_id.into());
        self.inner.refresh_needs_init();
        Ok(())
    }

    pub fn set_interface(&self, interface: impl Into<String>) -> Result<(), CommError> {
        self.guard_not_running("interface")?;
        self.inner.config.lock().unwrap().interface = Some(interface.into());
        self.inner.refresh_needs_init();
        Ok(())
    }

    pub fn set_bind_port(&self, bind_port: u16) -> Result<(), CommError> {
        self.guard_not_running("bind port")?;
        self.inner.config.lock().unwrap().bind_port = Some(bind_port);
        self.inner.refresh_needs_init();
        Ok(())
    }

    /// Whether a dropped connection will be re-established automatically.
    /// Clearing this also aborts an in-progress reconnect wait.
    pub fn set_attempt_reconnect(&self, attempt: bool) {
        self.inner.attempt_reconnect.store(attempt, Ordering::SeqCst);
    }

    /// Register `callback` for the event named by `verb` (see
    /// [`EventKind::parse`] for the accepted spellings). Each subscriber gets
    /// its own dispatch channel and task: triggering an event never blocks
    /// the component that fired it, and one subscriber cannot affect another.
    pub fn subscribe<F>(&self, verb: &str, callback: F) -> Result<(), CommError>
    where
        F: Fn(ClientEvent) + Send + 'static,
    {
        let kind = EventKind::parse(verb)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                callback(event);
            }
        });
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(tx);
        Ok(())
    }

    /// Dial the configured server and negotiate this client's identity.
    ///
    /// Configuration errors are rejected up front with no side effects.
    /// Connection failures set `connect_failed | not_connected` (plus
    /// `unexpected_closure` when the dial deadline expired) and are also
    /// returned to the caller.
    pub async fn connect(&self) -> Result<(), CommError> {
        let config = self.inner.config.lock().unwrap().clone();
        let client_id = match Self::validate_config(&config) {
            Ok(id) => id,
            Err(e) => {
                error!("{}", e);
                return Err(e);
            }
        };
        let status = self.status();
        if status.needs_init {
            error!("client has some un-initialized fields");
            return Err(CommError::Configuration(
                "client has un-initialized fields".into(),
            ));
        }
        if !status.not_connected {
            error!("client is already connected");
            return Err(CommError::InvalidStateTransition(
                "client is already connected".into(),
            ));
        }

        self.inner.set_status(ClientStatus::connecting());
        match establish(&config).await {
            Ok(conn) => {
                *self.inner.conn.lock().unwrap() = Some(conn);
                info!("connected successfully, client id: {}", client_id);
                self.inner.set_status(ClientStatus::connected());
                self.inner.consumer_run.store(true, Ordering::SeqCst);
                let inner = self.inner.clone();
                *self.inner.consumer.lock().unwrap() = Some(tokio::spawn(recv_consumer(inner)));
                self.inner
                    .trigger(EventKind::Connect, ClientEvent::Connect { client_id });
                Ok(())
            }
            Err(e) => {
                error!("connect failed: {}", e);
                let timed_out = matches!(e, CommError::Timeout);
                self.inner.set_status(ClientStatus::connect_failed(timed_out));
                *self.inner.conn.lock().unwrap() = None;
                Err(e)
            }
        }
    }

    /// Tear the connection down in an orderly way.
    ///
    /// The `disconnect` event fires first, even when the call is rejected.
    /// Disables future reconnection, sends a best-effort `shutdown` message,
    /// stops the handler and joins the recv-consumer before returning.
    pub async fn disconnect(&self) -> Result<(), CommError> {
        self.inner.trigger(EventKind::Disconnect, ClientEvent::Disconnect);
        if !self.status().connected {
            error!("client is not connected");
            return Err(CommError::InvalidStateTransition(
                "client is not connected".into(),
            ));
        }

        self.inner.attempt_reconnect.store(false, Ordering::SeqCst);
        self.inner.consumer_run.store(false, Ordering::SeqCst);

        let conn = self.inner.conn.lock().unwrap().take();
        let mut timed_out = false;
        if let Some(conn) = conn {
            conn.send(Message::shutdown());
            if timeout(STOP_TIMEOUT, conn.stop(true)).await.is_err() {
                error!("timed out stopping the connection handler");
                timed_out = true;
            }
        }

        if timed_out {
            self.inner.set_status(ClientStatus::disconnect_failed(true));
        } else {
            self.inner.set_status(ClientStatus::disconnected_clean());
        }

        let consumer = self.inner.consumer.lock().unwrap().take();
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }

        if timed_out {
            Err(CommError::Timeout)
        } else {
            Ok(())
        }
    }

    fn guard_not_running(&self, field: &str) -> Result<(), CommError> {
        if self.status().running {
            return Err(CommError::InvalidStateTransition(format!(
                "client must be stopped before setting {field}"
            )));
        }
        Ok(())
    }

    fn validate_config(config: &ClientConfig) -> Result<String, CommError> {
        if config.address.is_none() {
            return Err(CommError::Configuration("address not set".into()));
        }
        if config.port.is_none() {
            return Err(CommError::Configuration("port not set".into()));
        }
        config
            .client_id
            .clone()
            .ok_or_else(|| CommError::Configuration("client id not set".into()))
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ClientInner {
    fn trigger(&self, kind: EventKind, event: ClientEvent) {
        let subscribers = self.subscribers.lock().unwrap();
        let Some(list) = subscribers.get(&kind) else {
            return;
        };
        for tx in list {
            if tx.send(event.clone()).is_err() {
                warn!("failed to dispatch {:?} event to a subscriber", kind);
            }
        }
    }

    /// Compute and apply a status transition. A no-op write (to == from) is
    /// skipped entirely and fires no event.
    fn set_status(&self, to: ClientStatus) {
        let from = {
            let mut status = self.status.lock().unwrap();
            if *status == to {
                return;
            }
            let from = *status;
            *status = to;
            from
        };
        debug!("client status change: [{}] -> [{}]", from, to);
        self.trigger(EventKind::StateChange, ClientEvent::StateChange { from, to });
    }

    /// Re-derive the `needs_init` flag after a configuration change.
    fn refresh_needs_init(&self) {
        let inited = {
            let config = self.config.lock().unwrap();
            config.address.is_some() && config.port.is_some() && config.client_id.is_some()
        };
        let mut next = *self.status.lock().unwrap();
        next.needs_init = !inited;
        self.set_status(next);
    }
}

/// The exponential backoff schedule: wait `min(0.1 * 2^attempt, 15)` seconds
/// before reconnect attempt `attempt + 1`.
fn backoff_delay(attempt: u32) -> Duration {
    let doubled = BACKOFF_INITIAL.saturating_mul(2u32.saturating_pow(attempt));
    doubled.min(BACKOFF_CAP)
}

/// Resolve the configured endpoint, optionally bind the local side, and dial
/// under [`CONNECT_TIMEOUT`].
async fn open_stream(config: &ClientConfig) -> Result<TcpStream, CommError> {
    let address = config.address.as_deref().unwrap_or_default();
    let port = config.port.unwrap_or_default();
    let addr: SocketAddr = lookup_host((address, port))
        .await?
        .next()
        .ok_or_else(|| CommError::Configuration(format!("address '{address}' did not resolve")))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;

    if let (Some(interface), Some(bind_port)) = (config.interface.as_deref(), config.bind_port) {
        let bind_addr: SocketAddr = format!("{interface}:{bind_port}")
            .parse()
            .map_err(|e| CommError::Configuration(format!("invalid bind interface: {e}")))?;
        debug!("binding outbound socket to {}", bind_addr);
        socket.bind(bind_addr)?;
    } else {
        debug!("using any available interface and port pair");
    }

    match timeout(CONNECT_TIMEOUT, socket.connect(addr)).await {
        Err(_elapsed) => Err(CommError::Timeout),
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => Err(CommError::Refused),
        Ok(Err(e)) => Err(e.into()),
    }
}

/// One full bind + connect + negotiate cycle, shared by `connect` and the
/// reconnect loop. The negotiation send is fire-and-forget.
async fn establish(config: &ClientConfig) -> Result<Arc<ConnectionHandler>, CommError> {
    let stream = open_stream(config).await?;
    let conn = Arc::new(ConnectionHandler::new(stream));
    conn.start()?;
    conn.send(Message::negotiation(config.client_id.as_deref().unwrap_or_default()));
    Ok(conn)
}

/// The per-connection recv-consumer: pumps inbound messages to subscribers,
/// reacts to a server-initiated shutdown, and owns the reconnect path when
/// the handler's loop dies.
async fn recv_consumer(inner: Arc<ClientInner>) {
    while inner.consumer_run.load(Ordering::SeqCst) {
        let conn = inner.conn.lock().unwrap().clone();
        let Some(conn) = conn else {
            break;
        };

        if !conn.is_running() {
            if !inner.attempt_reconnect.load(Ordering::SeqCst) {
                error!("server connection closed unexpectedly");
                return;
            }
            warn!("server connection closed, reconnecting...");
            if !reconnect_loop(&inner).await {
                return;
            }
            info!("reconnected");
            continue;
        }

        match conn.recv() {
            Some(message) if message.subject() == SUBJECT_SHUTDOWN => {
                info!("server is shutting down, closing connection");
                server_shutdown(&inner).await;
            }
            Some(message) => {
                inner.trigger(EventKind::Message, ClientEvent::Message { message });
            }
            None => sleep(CONSUMER_POLL_INTERVAL).await,
        }
    }
}

/// Reconnect with exponential backoff until success or until reconnection is
/// disabled. The wait is polled so `disconnect()` aborts it promptly.
async fn reconnect_loop(inner: &Arc<ClientInner>) -> bool {
    if !inner.attempt_reconnect.load(Ordering::SeqCst) {
        return false;
    }
    inner.set_status(ClientStatus::reconnecting());

    let mut attempt: u32 = 0;
    loop {
        let wait = backoff_delay(attempt);
        info!("attempting reconnect after {:.1}s...", wait.as_secs_f64());
        let start = Instant::now();
        while start.elapsed() < wait {
            if !inner.attempt_reconnect.load(Ordering::SeqCst) {
                warn!("no longer attempting reconnect");
                inner.set_status(ClientStatus::reconnect_failed());
                return false;
            }
            sleep(BACKOFF_POLL_INTERVAL).await;
        }
        attempt += 1;
        if reconnect_once(inner).await {
            break;
        }
    }

    inner.set_status(ClientStatus::connected());
    let client_id = inner
        .config
        .lock()
        .unwrap()
        .client_id
        .clone()
        .unwrap_or_default();
    info!("successfully reconnected, client id: {}", client_id);
    inner.trigger(EventKind::Reconnect, ClientEvent::Reconnect { client_id });
    true
}

/// One reconnect attempt: a fresh bind + connect + negotiate cycle. Failures
/// are expected while the server is away, so they log at debug only.
async fn reconnect_once(inner: &Arc<ClientInner>) -> bool {
    let config = inner.config.lock().unwrap().clone();
    match establish(&config).await {
        Ok(conn) => {
            *inner.conn.lock().unwrap() = Some(conn);
            true
        }
        Err(e) => {
            debug!("reconnect attempt failed: {}", e);
            false
        }
    }
}

/// Orderly teardown initiated by the server's `shutdown` message. Distinct
/// from an unexpected drop: no reconnection is attempted.
async fn server_shutdown(inner: &Arc<ClientInner>) {
    inner.trigger(EventKind::ServerShutdown, ClientEvent::ServerShutdown);
    inner.consumer_run.store(false, Ordering::SeqCst);
    let conn = inner.conn.lock().unwrap().take();
    if let Some(conn) = conn {
        conn.stop(true).await;
    }
    inner.set_status(ClientStatus::disconnected_clean());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn backoff_schedule_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(4), Duration::from_millis(1600));
        assert_eq!(backoff_delay(7), Duration::from_millis(12800));
        assert_eq!(backoff_delay(8), Duration::from_secs(15));
        assert_eq!(backoff_delay(30), Duration::from_secs(15));
    }

    #[test]
    fn event_verb_normalization() {
        assert_eq!(EventKind::parse("connect").unwrap(), EventKind::Connect);
        assert_eq!(EventKind::parse("onConnect").unwrap(), EventKind::Connect);
        assert_eq!(
            EventKind::parse("on-state_change").unwrap(),
            EventKind::StateChange
        );
        assert_eq!(EventKind::parse("MESSAGE").unwrap(), EventKind::Message);
        assert_eq!(
            EventKind::parse("ServerShutdown").unwrap(),
            EventKind::ServerShutdown
        );
        assert!(matches!(
            EventKind::parse("teleport"),
            Err(CommError::UnknownEvent(_))
        ));
    }

    #[test]
    fn phase_is_derived_from_flags() {
        assert_eq!(ClientStatus::fresh().phase(), ConnectionPhase::NotConnected);
        assert_eq!(
            ClientStatus::connecting().phase(),
            ConnectionPhase::Connecting
        );
        assert_eq!(ClientStatus::connected().phase(), ConnectionPhase::Connected);
        // Reconnecting carries both flags; connected state wins only when set.
        assert_eq!(
            ClientStatus::reconnecting().phase(),
            ConnectionPhase::Connecting
        );
    }

    #[test]
    fn status_display_names_every_set_flag() {
        let status = ClientStatus::connected();
        assert_eq!(status.to_string(), "ok | connected");
        assert_eq!(
            ClientStatus::fresh().flag_names(),
            vec!["needs-init", "not-connected"]
        );
        assert_eq!(ClientStatus::default().to_string(), "undefined");
    }

    #[test]
    fn needs_init_clears_once_fully_configured() {
        let client = Client::new(true);
        assert!(client.status().needs_init);

        client.set_address("127.0.0.1").unwrap();
        client.set_port(30000).unwrap();
        assert!(client.status().needs_init);

        client.set_client_id("abc123").unwrap();
        assert!(!client.status().needs_init);
    }

    #[test]
    fn setters_rejected_while_running() {
        let client = Client::new(true);
        let mut running = client.status();
        running.running = true;
        client.inner.set_status(running);

        assert!(matches!(
            client.set_address("10.0.0.1"),
            Err(CommError::InvalidStateTransition(_))
        ));
        assert!(matches!(
            client.set_port(1234),
            Err(CommError::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn generated_ids_are_alphanumeric() {
        let id = Client::generate_new_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, Client::generate_new_id());
    }

    #[tokio::test]
    async fn noop_transition_fires_no_statechange() {
        let client = Client::new(true);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        client
            .subscribe("statechange", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        client.inner.set_status(ClientStatus::connecting());
        client.inner.set_status(ClientStatus::connecting());
        sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_without_config_is_rejected() {
        let client = Client::new(true);
        assert!(matches!(
            client.connect().await,
            Err(CommError::Configuration(_))
        ));
        // No side effects: status is still the fresh one.
        assert!(client.status().needs_init);
        assert!(client.status().not_connected);
    }

    #[tokio::test]
    async fn connect_refused_sets_failure_flags() {
        let client = Client::new(false);
        client.set_address("127.0.0.1").unwrap();
        // Bind-then-drop guarantees an unused port.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        client.set_port(port).unwrap();
        client.set_client_id("abc123").unwrap();

        assert!(client.connect().await.is_err());
        let status = client.status();
        assert!(status.connect_failed);
        assert!(status.not_connected);
        assert_eq!(status.phase(), ConnectionPhase::NotConnected);
    }
}
