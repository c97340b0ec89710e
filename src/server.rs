//! The central server: accept loop, identity negotiation, client directory
//!
//! Each accepted socket is wrapped in a [`ConnectionHandler`] and must
//! deliver a `negotiation` message naming its client id within the handshake
//! deadline. Known ids are not duplicated: the existing handler is reopened
//! in place with the new socket, so anything still queued for that client
//! survives the reconnect.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::connection::ConnectionHandler;
use crate::types::{CommError, Message, SUBJECT_NEGOTIATION};

/// Accept poll timeout. Bounds how long the accept loop can go without
/// observing the run flag.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a fresh connection may take to deliver its negotiation message.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked with `(was_running, now_running)` on every server
/// running-state change.
pub type StateUpdateCallback = Arc<dyn Fn(bool, bool) + Send + Sync>;

type Directory = Arc<Mutex<HashMap<String, Arc<ConnectionHandler>>>>;

struct ServerInner {
    interface: Mutex<Option<String>>,
    port: Mutex<Option<u16>>,
    local_addr: Mutex<Option<SocketAddr>>,
    directory: Directory,
    status_callbacks: Mutex<Vec<StateUpdateCallback>>,
    should_run: Arc<AtomicBool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// The central messaging server.
///
/// Configure `interface` and `port`, then [`start`](Server::start). Cheap to
/// clone; clones share the same directory and state. Stopping leaves the
/// directory populated: a later `start` reuses the same instance and its
/// registered clients.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new() -> Self {
        info!("server inited");
        Self {
            inner: Arc::new(ServerInner {
                interface: Mutex::new(None),
                port: Mutex::new(None),
                local_addr: Mutex::new(None),
                directory: Arc::new(Mutex::new(HashMap::new())),
                status_callbacks: Mutex::new(Vec::new()),
                should_run: Arc::new(AtomicBool::new(false)),
                accept_task: Mutex::new(None),
            }),
        }
    }

    pub fn interface(&self) -> Option<String> {
        self.inner.interface.lock().unwrap().clone()
    }

    /// Set the bind interface. An empty string binds all interfaces; `*` is
    /// normalized to empty.
    pub fn set_interface(&self, interface: impl Into<String>) -> Result<(), CommError> {
        self.guard_stopped("interface")?;
        let mut interface = interface.into();
        if interface == "*" {
            interface = String::new();
        }
        *self.inner.interface.lock().unwrap() = Some(interface);
        Ok(())
    }

    pub fn port(&self) -> Option<u16> {
        *self.inner.port.lock().unwrap()
    }

    pub fn set_port(&self, port: u16) -> Result<(), CommError> {
        self.guard_stopped("port")?;
        *self.inner.port.lock().unwrap() = Some(port);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.should_run.load(Ordering::SeqCst)
    }

    /// The address the listener actually bound, once running. Useful when
    /// the configured port was 0 (ephemeral).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    /// Ids currently present in the directory, for front-end display.
    pub fn connected_ids(&self) -> Vec<String> {
        self.inner.directory.lock().unwrap().keys().cloned().collect()
    }

    pub fn status_str(&self) -> &'static str {
        if self.is_running() {
            "Running"
        } else {
            "Stopped"
        }
    }

    /// Register a callback fired with `(was_running, now_running)` whenever
    /// the server starts or stops.
    pub fn subscribe_to_state_update<F>(&self, callback: F)
    where
        F: Fn(bool, bool) + Send + Sync + 'static,
    {
        self.inner
            .status_callbacks
            .lock()
            .unwrap()
            .push(Arc::new(callback));
    }

    /// Bind the listening socket and start the accept loop.
    pub async fn start(&self) -> Result<(), CommError> {
        let interface = self
            .interface()
            .ok_or_else(|| CommError::Configuration("interface not set".into()))?;
        let port = self
            .port()
            .ok_or_else(|| CommError::Configuration("port not set".into()))?;
        if self.is_running() {
            return Err(CommError::InvalidStateTransition(
                "server is already running".into(),
            ));
        }

        // An empty interface means all of them.
        let bind_host = if interface.is_empty() {
            "0.0.0.0".to_string()
        } else {
            interface
        };
        let listener = TcpListener::bind((bind_host.as_str(), port)).await?;
        let local_addr = listener.local_addr()?;
        *self.inner.local_addr.lock().unwrap() = Some(local_addr);
        info!("server listening on {}", local_addr);

        self.inner.set_should_run(true);
        let should_run = self.inner.should_run.clone();
        let directory = self.inner.directory.clone();
        let handle = tokio::spawn(accept_loop(listener, should_run, directory));
        *self.inner.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop accepting, close the listener, and tell every registered client
    /// to shut down. The directory itself is kept.
    pub async fn stop(&self) -> Result<(), CommError> {
        self.inner.set_should_run(false);
        let handle = self.inner.accept_task.lock().unwrap().take();
        if let Some(handle) = handle {
            // The listener is owned by the loop and closes with it.
            let _ = handle.await;
        }
        *self.inner.local_addr.lock().unwrap() = None;

        let handlers: Vec<Arc<ConnectionHandler>> = {
            let directory = self.inner.directory.lock().unwrap();
            directory.values().cloned().collect()
        };
        for handler in &handlers {
            handler.send(Message::shutdown());
        }
        join_all(handlers.iter().map(|handler| handler.stop(false))).await;
        info!("server stopped");
        Ok(())
    }

    /// Send a message to one client by id, or to every registered client
    /// with `to == "*"`. Returns `false` for an unknown id.
    pub fn send(&self, to: &str, message: Message) -> bool {
        let directory = self.inner.directory.lock().unwrap();
        if to == "*" {
            for handler in directory.values() {
                handler.send(message.clone());
            }
            return true;
        }
        match directory.get(to) {
            Some(handler) => {
                handler.send(message);
                true
            }
            None => {
                error!("unknown client id {}", to);
                false
            }
        }
    }

    fn guard_stopped(&self, field: &str) -> Result<(), CommError> {
        if self.is_running() {
            return Err(CommError::InvalidStateTransition(format!(
                "server must be stopped before setting {field}"
            )));
        }
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerInner {
    fn set_should_run(&self, val: bool) {
        if self.should_run.load(Ordering::SeqCst) == val {
            error!("already in state running={}", val);
            return;
        }
        self.should_run.store(val, Ordering::SeqCst);
        let callbacks = self.status_callbacks.lock().unwrap().clone();
        for callback in callbacks {
            // Each callback runs on its own task: one failing or slow
            // subscriber cannot affect the others or the caller.
            tokio::spawn(async move { callback(!val, val) });
        }
    }
}

/// Accept connections until the run flag clears, handing each socket to
/// negotiation. Accept-poll timeouts are normal idling.
async fn accept_loop(listener: TcpListener, should_run: Arc<AtomicBool>, directory: Directory) {
    while should_run.load(Ordering::SeqCst) {
        match timeout(ACCEPT_TIMEOUT, listener.accept()).await {
            Err(_elapsed) => continue,
            Ok(Ok((stream, addr))) => negotiate_client_id(stream, addr, &directory).await,
            Ok(Err(e)) => {
                warn!("failed to accept connection: {}", e);
            }
        }
    }
}

/// Run the identity handshake on a fresh socket.
///
/// The connection must produce a `negotiation` message with a non-empty
/// string id within the deadline, or it is discarded. A known id means a
/// reconnecting client: the existing handler is reopened with the new
/// socket, preserving its queues and directory entry.
async fn negotiate_client_id(stream: TcpStream, addr: SocketAddr, directory: &Directory) {
    let probe = ConnectionHandler::new(stream);
    if let Err(e) = probe.start() {
        error!("could not start handler for {}: {}", addr, e);
        return;
    }

    let client_id = match probe.wait_for_recv(Some(NEGOTIATION_TIMEOUT)).await {
        Some(message) if message.subject() == SUBJECT_NEGOTIATION => {
            message.get_str("id").filter(|id| !id.is_empty()).map(String::from)
        }
        _ => None,
    };
    let Some(client_id) = client_id else {
        error!(
            "connection from {} failed: client did not complete negotiation before \
             timeout or negotiation was malformed",
            addr
        );
        probe.stop(false).await;
        return;
    };

    info!("new connection from {} with id '{}'", addr, client_id);
    let existing = {
        let directory = directory.lock().unwrap();
        directory.get(&client_id).cloned()
    };

    match existing {
        Some(handler) => {
            warn!("seen id '{}' before, reopening its handler", client_id);
            let Some(stream) = probe.release_stream().await else {
                error!("lost the socket from {} while reopening '{}'", addr, client_id);
                return;
            };
            // Anything the probe already read belongs to the real handler.
            handler.push_inbound(probe.drain_inbound());
            if handler.is_running() {
                // Stale loop from a half-open previous socket.
                warn!("stopping stale I/O loop for '{}'", client_id);
                handler.stop(true).await;
            }
            if let Err(e) = handler.reattach(stream) {
                error!("could not reattach socket for '{}': {}", client_id, e);
                return;
            }
            if let Err(e) = handler.start() {
                error!("could not restart handler for '{}': {}", client_id, e);
            }
        }
        None => {
            let handler = Arc::new(probe);
            directory
                .lock()
                .unwrap()
                .insert(client_id.clone(), handler);
            info!("registered new client '{}'", client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    #[test]
    fn star_interface_normalizes_to_empty() {
        let server = Server::new();
        server.set_interface("*").unwrap();
        assert_eq!(server.interface().as_deref(), Some(""));

        server.set_interface("127.0.0.1").unwrap();
        assert_eq!(server.interface().as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn start_requires_configuration() {
        let server = Server::new();
        assert!(matches!(
            server.start().await,
            Err(CommError::Configuration(_))
        ));
        server.set_interface("127.0.0.1").unwrap();
        assert!(matches!(
            server.start().await,
            Err(CommError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn state_update_callbacks_fire_on_start_and_stop() {
        let server = Server::new();
        server.set_interface("127.0.0.1").unwrap();
        server.set_port(0).unwrap();

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = transitions.clone();
        server.subscribe_to_state_update(move |was, now| {
            sink.lock().unwrap().push((was, now));
        });

        server.start().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        server.stop().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let seen = transitions.lock().unwrap().clone();
        assert_eq!(seen, vec![(false, true), (true, false)]);
    }

    #[tokio::test]
    async fn config_immutable_while_running() {
        let server = Server::new();
        server.set_interface("127.0.0.1").unwrap();
        server.set_port(0).unwrap();
        server.start().await.unwrap();

        assert!(matches!(
            server.set_port(12345),
            Err(CommError::InvalidStateTransition(_))
        ));
        assert!(matches!(
            server.set_interface("10.0.0.1"),
            Err(CommError::InvalidStateTransition(_))
        ));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn send_to_unknown_id_fails() {
        let server = Server::new();
        assert!(!server.send("nobody", Message::shutdown()));
        // Broadcast over an empty directory is a successful no-op.
        assert!(server.send("*", Message::shutdown()));
    }

    #[tokio::test]
    async fn second_start_while_running_is_rejected() {
        let server = Server::new();
        server.set_interface("127.0.0.1").unwrap();
        server.set_port(0).unwrap();
        server.start().await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        server.subscribe_to_state_update(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(
            server.start().await,
            Err(CommError::InvalidStateTransition(_))
        ));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        server.stop().await.unwrap();
    }
}
