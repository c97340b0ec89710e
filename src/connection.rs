//! The connection handler: one socket, two queues, one I/O-loop task
//!
//! A [`ConnectionHandler`] owns at most one live TCP stream. `start` spawns a
//! dedicated task that alternates a receive step (fill the inbound queue)
//! and a send step (drain the outbound queue), framing messages with
//! [`FrameCodec`]. Both queues are plain mutex-guarded deques: the lock is
//! held only to push or pop, never across an await, so `std::sync::Mutex`
//! suffices here.
//!
//! Cancellation is a single shared run flag observed at the top of every
//! loop iteration; socket reads poll under a short timeout so a cleared flag
//! is noticed promptly.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, warn};

use crate::codec::FrameCodec;
use crate::frame::CHUNK_SIZE;
use crate::types::{CommError, Message};

/// Poll timeout for one socket read. Bounds how long the loop can go
/// without observing the run flag.
const SOCKET_TIMEOUT: Duration = Duration::from_millis(250);

/// Poll interval for [`ConnectionHandler::wait_for_recv`].
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(10);

type MessageQueue = Arc<Mutex<VecDeque<Message>>>;

/// Outcome of one receive or send step inside the I/O loop.
enum Tick {
    /// Step made progress or had nothing to do.
    Ok,
    /// The connection is gone; the loop must stop.
    Closed,
}

/// Owns one live socket and pumps messages between it and a pair of FIFO
/// queues.
///
/// All methods take `&self`; the handler is designed to be shared behind an
/// [`Arc`] by whichever component owns the connection. A handler is never
/// rebound to a second socket except through [`reattach`], the server's
/// reopen path, which preserves the handler identity and both queues.
///
/// [`reattach`]: ConnectionHandler::reattach
pub struct ConnectionHandler {
    stream: Mutex<Option<TcpStream>>,
    outbound: MessageQueue,
    inbound: MessageQueue,
    should_run: Arc<AtomicBool>,
    close_on_exit: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<Option<TcpStream>>>>,
}

impl ConnectionHandler {
    /// Wrap an established stream. The handler is idle until [`start`] is
    /// called.
    ///
    /// [`start`]: ConnectionHandler::start
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            outbound: Arc::new(Mutex::new(VecDeque::new())),
            inbound: Arc::new(Mutex::new(VecDeque::new())),
            should_run: Arc::new(AtomicBool::new(false)),
            close_on_exit: Arc::new(AtomicBool::new(true)),
            task: Mutex::new(None),
        }
    }

    /// Whether the I/O loop task is currently alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the I/O loop on the handler's socket.
    pub fn start(&self) -> Result<(), CommError> {
        if self.is_running() {
            return Err(CommError::InvalidStateTransition(
                "connection handler is already running".into(),
            ));
        }
        let stream = self
            .stream
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| CommError::InvalidStateTransition("no socket attached".into()))?;

        self.should_run.store(true, Ordering::SeqCst);
        self.close_on_exit.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(io_loop(
            stream,
            self.outbound.clone(),
            self.inbound.clone(),
            self.should_run.clone(),
            self.close_on_exit.clone(),
        ));
        *self.task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Signal the I/O loop to exit. With `blocking` the call waits until the
    /// loop has fully wound down; otherwise the loop exits asynchronously.
    pub async fn stop(&self, blocking: bool) {
        self.should_run.store(false, Ordering::SeqCst);
        if !blocking {
            return;
        }
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            // The loop closes its own socket; a panic in it is already logged.
            let _ = handle.await;
        }
    }

    /// Stop the loop and recover the stream un-closed.
    ///
    /// This is the first half of the server's reopen path: the negotiation
    /// probe's socket must survive the probe handler so it can be reattached
    /// to the directory handler for that client id.
    pub async fn release_stream(&self) -> Option<TcpStream> {
        self.close_on_exit.store(false, Ordering::SeqCst);
        self.should_run.store(false, Ordering::SeqCst);
        let handle = self.task.lock().unwrap().take();
        match handle {
            Some(handle) => handle.await.ok().flatten(),
            None => self.stream.lock().unwrap().take(),
        }
    }

    /// Attach a fresh stream to a stopped handler, preserving both queues.
    pub fn reattach(&self, stream: TcpStream) -> Result<(), CommError> {
        if self.is_running() {
            return Err(CommError::InvalidStateTransition(
                "cannot reattach while the I/O loop is running".into(),
            ));
        }
        *self.stream.lock().unwrap() = Some(stream);
        Ok(())
    }

    /// Enqueue a message for transmission. Non-blocking; always succeeds
    /// once the handler exists.
    pub fn send(&self, message: Message) {
        self.outbound.lock().unwrap().push_back(message);
    }

    /// Pop one received message, if any. Non-blocking.
    pub fn recv(&self) -> Option<Message> {
        self.inbound.lock().unwrap().pop_front()
    }

    /// Poll [`recv`] until a message appears or `timeout` elapses. A `None`
    /// timeout waits forever.
    ///
    /// [`recv`]: ConnectionHandler::recv
    pub async fn wait_for_recv(&self, wait: Option<Duration>) -> Option<Message> {
        let start = Instant::now();
        loop {
            if let Some(message) = self.recv() {
                return Some(message);
            }
            if let Some(limit) = wait {
                if start.elapsed() >= limit {
                    return None;
                }
            }
            sleep(RECV_POLL_INTERVAL).await;
        }
    }

    /// Move every received-but-unconsumed message out of this handler.
    /// Used by the server's reopen drain.
    pub(crate) fn drain_inbound(&self) -> Vec<Message> {
        self.inbound.lock().unwrap().drain(..).collect()
    }

    /// Append messages to the inbound queue, preserving order.
    pub(crate) fn push_inbound(&self, messages: Vec<Message>) {
        let mut queue = self.inbound.lock().unwrap();
        for message in messages {
            queue.push_back(message);
        }
    }
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("running", &self.is_running())
            .field("outbound", &self.outbound.lock().unwrap().len())
            .field("inbound", &self.inbound.lock().unwrap().len())
            .finish()
    }
}

/// The dedicated I/O loop. Returns the stream un-closed when the stop came
/// from the release path; in every other case the socket is shut down here
/// and the return value is `None`.
async fn io_loop(
    mut stream: TcpStream,
    outbound: MessageQueue,
    inbound: MessageQueue,
    should_run: Arc<AtomicBool>,
    close_on_exit: Arc<AtomicBool>,
) -> Option<TcpStream> {
    let mut codec = FrameCodec::new();
    let mut read_buf = BytesMut::with_capacity(CHUNK_SIZE);

    while should_run.load(Ordering::SeqCst) {
        if let Tick::Closed = recv_tick(&mut stream, &mut codec, &mut read_buf, &inbound).await {
            warn!("connection closed unexpectedly during receive step");
            should_run.store(false, Ordering::SeqCst);
            continue;
        }
        if let Tick::Closed = send_tick(&mut stream, &mut codec, &outbound, &should_run).await {
            warn!("connection closed unexpectedly during send step");
            should_run.store(false, Ordering::SeqCst);
            continue;
        }
    }

    if close_on_exit.load(Ordering::SeqCst) {
        // The socket may already be dead; shutdown errors are expected then.
        let _ = stream.shutdown().await;
        None
    } else {
        Some(stream)
    }
}

/// One receive step: read a chunk under the poll timeout and feed the
/// decoder. A read timeout is a no-op retry (partial frames stay buffered);
/// a zero-length read is connection loss. A frame that fails to decode is
/// logged and dropped; the loop continues.
async fn recv_tick(
    stream: &mut TcpStream,
    codec: &mut FrameCodec,
    read_buf: &mut BytesMut,
    inbound: &MessageQueue,
) -> Tick {
    let mut chunk = [0u8; CHUNK_SIZE];
    match timeout(SOCKET_TIMEOUT, stream.read(&mut chunk)).await {
        Err(_elapsed) => return Tick::Ok,
        Ok(Ok(0)) => return Tick::Closed,
        Ok(Ok(n)) => read_buf.extend_from_slice(&chunk[..n]),
        Ok(Err(e)) => {
            warn!("socket read failed: {}", e);
            return Tick::Closed;
        }
    }

    loop {
        match codec.decode(read_buf) {
            Ok(Some(message)) => {
                debug!("received '{}' frame", message.subject());
                inbound.lock().unwrap().push_back(message);
            }
            Ok(None) => return Tick::Ok,
            Err(e) => {
                // One frame dropped; the stream itself stays up.
                warn!("dropping undecodable frame: {}", e);
            }
        }
    }
}

/// One send step: pop at most one message and write its frame fully. A
/// zero-byte write or write error pushes the message back to the queue head
/// and reports the connection closed.
async fn send_tick(
    stream: &mut TcpStream,
    codec: &mut FrameCodec,
    outbound: &MessageQueue,
    should_run: &AtomicBool,
) -> Tick {
    let message = outbound.lock().unwrap().pop_front();
    let Some(message) = message else {
        return Tick::Ok;
    };

    let mut wire = BytesMut::new();
    if let Err(e) = codec.encode(&message, &mut wire) {
        // Unencodable message: fatal for this send only, never for the
        // connection. The message cannot be retried and is dropped.
        error!("failed to encode '{}' frame: {}", message.subject(), e);
        return Tick::Ok;
    }

    let mut written = 0;
    while written < wire.len() {
        match timeout(SOCKET_TIMEOUT, stream.write(&wire[written..])).await {
            Err(_elapsed) => {
                if should_run.load(Ordering::SeqCst) {
                    continue;
                }
                outbound.lock().unwrap().push_front(message);
                return Tick::Closed;
            }
            Ok(Ok(0)) => {
                outbound.lock().unwrap().push_front(message);
                return Tick::Closed;
            }
            Ok(Ok(n)) => written += n,
            Ok(Err(e)) => {
                warn!("socket write failed: {}", e);
                outbound.lock().unwrap().push_front(message);
                return Tick::Closed;
            }
        }
    }
    debug!("sent '{}' frame ({} bytes)", message.subject(), wire.len());
    Tick::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Payload;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn message(n: i64) -> Message {
        let mut payload = Payload::new();
        payload.insert("n".into(), json!(n));
        Message::new("test", payload)
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[test]
    fn queues_are_fifo_without_a_running_loop() {
        tokio_test::block_on(async {
            let (stream, _peer) = socket_pair().await;
            let handler = ConnectionHandler::new(stream);
            handler.send(message(1));
            handler.send(message(2));
            handler.push_inbound(vec![message(10), message(11)]);

            assert_eq!(handler.recv(), Some(message(10)));
            assert_eq!(handler.recv(), Some(message(11)));
            assert_eq!(handler.recv(), None);
        });
    }

    #[tokio::test]
    async fn wait_for_recv_times_out_empty() {
        let (stream, _peer) = socket_pair().await;
        let handler = ConnectionHandler::new(stream);
        let got = handler
            .wait_for_recv(Some(Duration::from_millis(50)))
            .await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (stream, _peer) = socket_pair().await;
        let handler = ConnectionHandler::new(stream);
        handler.start().unwrap();
        assert!(matches!(
            handler.start(),
            Err(CommError::InvalidStateTransition(_))
        ));
        handler.stop(true).await;
    }

    #[tokio::test]
    async fn reattach_rejected_while_running() {
        let (stream, _peer) = socket_pair().await;
        let (spare, _peer2) = socket_pair().await;
        let handler = ConnectionHandler::new(stream);
        handler.start().unwrap();
        assert!(matches!(
            handler.reattach(spare),
            Err(CommError::InvalidStateTransition(_))
        ));
        handler.stop(true).await;
    }

    #[tokio::test]
    async fn release_stream_recovers_socket() {
        let (stream, _peer) = socket_pair().await;
        let handler = ConnectionHandler::new(stream);
        handler.start().unwrap();
        let recovered = handler.release_stream().await;
        assert!(recovered.is_some());
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn stop_blocking_joins_the_loop() {
        let (stream, _peer) = socket_pair().await;
        let handler = ConnectionHandler::new(stream);
        handler.start().unwrap();
        assert!(handler.is_running());
        handler.stop(true).await;
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn peer_close_stops_the_loop() {
        let (stream, peer) = socket_pair().await;
        let handler = ConnectionHandler::new(stream);
        handler.start().unwrap();
        drop(peer);
        // Loop notices the zero-length read within one poll interval.
        tokio::time::sleep(SOCKET_TIMEOUT * 3).await;
        assert!(!handler.is_running());
    }
}
