//! One endpoint of a framed connection.
//!
//! A [`Peer`] owns the read loop and writer tasks and the heartbeat
//! and bye behaviours. Every inbound frame is tried as heartbeat traffic,
//! then as a bye token, then handed to the [`DataProcessor`]. When the loop
//! ends it records exactly one [`DisconnectionReason`] and emits
//! `on_disconnect`.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bye::{ByeMsg, ByeMsgConfig, ByeMsgListener};
use crate::config::PeerConfig;
use crate::encoding::{Charset, DataEncoding, DelimiterCodec};
use crate::error::PeerError;
use crate::heartbeat::{HeartBeat, HeartBeatConfig, HeartBeatFrame, HeartBeatListener, HB_REQUEST, HB_RESPONSE};
use crate::listeners::{ListenerId, Listeners};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Connecting,
    /// Remote unavailable; a reconnect attempt is scheduled.
    Waiting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, ConnectionState::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DisconnectionReason {
    NotDisconnected,
    LocalRequest,
    RemoteRequest,
    ConnectionLost,
    HeartbeatTimeout,
    RemoteError,
}

/// Application side of a peer. Frames that are neither heartbeat nor bye
/// are offered first as raw bytes, then decoded with the connection charset.
/// Returning `false` from both reports the frame as unknown data.
pub trait DataProcessor: Send + Sync {
    fn process_bytes(&self, _peer: &Peer, _data: &[u8]) -> bool {
        false
    }

    fn process_text(&self, _peer: &Peer, _data: &str) -> bool {
        false
    }
}

impl<F> DataProcessor for F
where
    F: Fn(&Peer, &str) -> bool + Send + Sync,
{
    fn process_text(&self, peer: &Peer, data: &str) -> bool {
        self(peer, data)
    }
}

pub trait PeerConnectionListener: Send + Sync {
    fn on_connecting(&self, _peer: &Peer) {}
    fn on_waiting(&self, _peer: &Peer) {}
    fn on_connect(&self, _peer: &Peer) {}
    fn on_disconnecting(&self, _peer: &Peer) {}
    fn on_disconnect(&self, _peer: &Peer) {}
    fn on_fail(&self, _peer: &Peer, _error: &str) {}
}

pub trait PeerDataListener: Send + Sync {
    fn on_data_rx(&self, _peer: &Peer, _data: &[u8]) {}
    fn on_data_tx(&self, _peer: &Peer, _data: &[u8]) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub local_id: String,
    pub remote_id: String,
    pub protocol: String,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    pub last_connection: Option<SystemTime>,
    pub last_disconnection: Option<SystemTime>,
    pub last_data_tx: Option<SystemTime>,
    pub last_data_rx: Option<SystemTime>,
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub frames_tx: u64,
    pub frames_rx: u64,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

enum Outgoing {
    Frame(Bytes, oneshot::Sender<io::Result<()>>),
    Close(oneshot::Sender<io::Result<()>>),
}

struct PeerInner {
    local_id: String,
    remote_id: String,
    protocol: String,
    encoding: DataEncoding,
    heartbeat: HeartBeat,
    bye: ByeMsg,
    processor: Arc<dyn DataProcessor>,
    state: watch::Sender<ConnectionState>,
    reason: OnceLock<DisconnectionReason>,
    writer: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    cancel: CancellationToken,
    addrs: Mutex<(Option<SocketAddr>, Option<SocketAddr>)>,
    stats: Mutex<ConnectionStats>,
    connection_listeners: Listeners<dyn PeerConnectionListener>,
    data_listeners: Listeners<dyn PeerDataListener>,
}

/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            self.inner.local_id, self.inner.remote_id, self.inner.protocol
        )
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("local_id", &self.inner.local_id)
            .field("remote_id", &self.inner.remote_id)
            .field("state", &self.state())
            .field("reason", &self.disconnection_reason())
            .finish()
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Peer {}

enum LoopExit {
    Cancelled,
    Bye,
    Failed(DisconnectionReason),
}

impl Peer {
    pub(crate) fn new(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        protocol: impl Into<String>,
        config: PeerConfig,
        processor: Arc<dyn DataProcessor>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(PeerInner {
                local_id: local_id.into(),
                remote_id: remote_id.into(),
                protocol: protocol.into(),
                encoding: config.encoding,
                heartbeat: HeartBeat::new(config.heartbeat),
                bye: ByeMsg::new(config.bye),
                processor,
                state,
                reason: OnceLock::new(),
                writer: Mutex::new(None),
                cancel: CancellationToken::new(),
                addrs: Mutex::new((None, None)),
                stats: Mutex::new(ConnectionStats::default()),
                connection_listeners: Listeners::default(),
                data_listeners: Listeners::default(),
            }),
        }
    }

    // Getters

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.inner.remote_id
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// `NotDisconnected` until the terminal `on_disconnect`, then fixed.
    pub fn disconnection_reason(&self) -> DisconnectionReason {
        self.inner
            .reason
            .get()
            .copied()
            .unwrap_or(DisconnectionReason::NotDisconnected)
    }

    pub fn encoding(&self) -> &DataEncoding {
        &self.inner.encoding
    }

    pub fn charset(&self) -> Charset {
        self.inner.encoding.charset
    }

    pub fn heartbeat_config(&self) -> HeartBeatConfig {
        self.inner.heartbeat.config()
    }

    /// A new read timeout applies from the next read.
    pub fn set_heartbeat_config(&self, config: HeartBeatConfig) {
        self.inner.heartbeat.set_config(config);
    }

    pub fn bye_config(&self) -> ByeMsgConfig {
        self.inner.bye.config()
    }

    pub fn set_bye_config(&self, config: ByeMsgConfig) {
        self.inner.bye.set_config(config);
    }

    pub(crate) fn adopt_heartbeat(&self, prev: &HeartBeatConfig, new: &HeartBeatConfig) {
        self.inner.heartbeat.adopt(prev, new);
    }

    pub(crate) fn adopt_bye(&self, prev: &ByeMsgConfig, new: &ByeMsgConfig) {
        self.inner.bye.adopt(prev, new);
    }

    pub fn is_heartbeat_waiting(&self) -> bool {
        self.inner.heartbeat.is_waiting()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let (local_addr, remote_addr) = *self.inner.addrs.lock();
        ConnectionInfo {
            local_id: self.inner.local_id.clone(),
            remote_id: self.inner.remote_id.clone(),
            protocol: self.inner.protocol.clone(),
            local_addr,
            remote_addr,
            state: self.state(),
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.lock().clone()
    }

    /// Resolves once the peer reached `Disconnected`.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| s.is_disconnected()).await;
    }

    /// Waits for `state`, giving up after `timeout`.
    pub async fn wait_for_state(&self, state: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.inner.state.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| *s == state)).await;
        matches!(reached, Ok(Ok(_)))
    }

    // Listeners

    pub fn add_connection_listener(&self, listener: Arc<dyn PeerConnectionListener>) -> ListenerId {
        self.inner.connection_listeners.add(listener)
    }

    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        self.inner.connection_listeners.remove(id)
    }

    pub fn add_data_listener(&self, listener: Arc<dyn PeerDataListener>) -> ListenerId {
        self.inner.data_listeners.add(listener)
    }

    pub fn remove_data_listener(&self, id: ListenerId) -> bool {
        self.inner.data_listeners.remove(id)
    }

    pub fn add_heartbeat_listener(&self, listener: Arc<dyn HeartBeatListener>) -> ListenerId {
        self.inner.heartbeat.add_listener(listener)
    }

    pub fn remove_heartbeat_listener(&self, id: ListenerId) -> bool {
        self.inner.heartbeat.remove_listener(id)
    }

    pub fn add_bye_listener(&self, listener: Arc<dyn ByeMsgListener>) -> ListenerId {
        self.inner.bye.add_listener(listener)
    }

    pub fn remove_bye_listener(&self, id: ListenerId) -> bool {
        self.inner.bye.remove_listener(id)
    }

    pub(crate) fn emit_fail(&self, error: &str) {
        warn!("Peer '{}' fail: {}", self.inner.local_id, error);
        self.inner
            .connection_listeners
            .emit(|l| l.on_fail(self, error));
    }

    // Lifecycle

    pub(crate) fn set_connecting(&self) {
        self.inner.state.send_replace(ConnectionState::Connecting);
        trace!("Peer '{}' connecting to '{}'", self.inner.local_id, self.inner.remote_id);
        self.inner
            .connection_listeners
            .emit(|l| l.on_connecting(self));
    }

    /// Enter `Waiting` unless a disconnect already started.
    pub(crate) fn set_waiting(&self) -> bool {
        let changed = self.inner.state.send_if_modified(|s| {
            if matches!(s, ConnectionState::Connecting | ConnectionState::Waiting) {
                *s = ConnectionState::Waiting;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Peer '{}' waiting to reconnect '{}'", self.inner.local_id, self.inner.remote_id);
            self.inner.connection_listeners.emit(|l| l.on_waiting(self));
        }
        changed
    }

    /// Record a setup failure on a peer that never connected.
    pub(crate) fn fail_setup(&self, error: &str) {
        self.emit_fail(error);
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    pub(crate) fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Take ownership of an established stream and start the read loop.
    ///
    /// Returns false (dropping the stream) if the peer was disconnected
    /// while the connection was being set up.
    pub(crate) async fn attach<S>(
        &self,
        stream: S,
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
    ) -> bool
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut slot = self.inner.writer.lock();
        let attached = !self.inner.cancel.is_cancelled()
            && self.inner.state.send_if_modified(|s| {
                if matches!(s, ConnectionState::Connecting | ConnectionState::Waiting) {
                    *s = ConnectionState::Connected;
                    true
                } else {
                    false
                }
            });
        if !attached {
            return false;
        }
        let (queue, outgoing) = mpsc::unbounded_channel();
        *slot = Some(queue);
        drop(slot);
        let writer: BoxedWriter = Box::new(writer);
        tokio::spawn(write_loop(writer, outgoing, self.inner.cancel.clone()));

        *self.inner.addrs.lock() = (local_addr, remote_addr);
        self.inner.stats.lock().last_connection = Some(SystemTime::now());

        let reader: BoxedReader = Box::new(reader);
        let frames = FramedRead::new(reader, self.inner.encoding.codec());

        info!("Peer '{}' connected to '{}'", self.inner.local_id, self.inner.remote_id);
        self.inner.connection_listeners.emit(|l| l.on_connect(self));

        tokio::spawn(self.clone().read_loop(frames));
        true
    }

    /// Send `data` followed by the delimiter. Resolves once the frame was
    /// written or the peer closed.
    pub async fn send_data(&self, data: impl AsRef<[u8]>) -> Result<(), PeerError> {
        let data = data.as_ref();
        let written = self.post(data)?;
        match written.await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => return Err(self.stream_error(source)),
            Err(_) => return Err(self.not_connected()),
        }
        self.record_tx(data);
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        let bytes = self.charset().encode(text).into_owned();
        self.send_data(bytes).await
    }

    /// Queue a heartbeat frame without waiting for the write.
    fn send_control(&self, data: &[u8]) -> Result<(), PeerError> {
        self.post(data)?;
        self.record_tx(data);
        Ok(())
    }

    fn post(&self, data: &[u8]) -> Result<oneshot::Receiver<io::Result<()>>, PeerError> {
        let mut frame = BytesMut::new();
        let mut codec = DelimiterCodec::new(self.inner.encoding.delimiter_bytes());
        codec
            .encode(data, &mut frame)
            .map_err(|source| self.stream_error(source))?;

        let (done, written) = oneshot::channel();
        let writer = self.inner.writer.lock();
        let queue = writer.as_ref().ok_or_else(|| self.not_connected())?;
        queue
            .send(Outgoing::Frame(frame.freeze(), done))
            .map_err(|_| self.not_connected())?;
        Ok(written)
    }

    fn record_tx(&self, data: &[u8]) {
        {
            let mut stats = self.inner.stats.lock();
            stats.bytes_tx += data.len() as u64;
            stats.frames_tx += 1;
            stats.last_data_tx = Some(SystemTime::now());
        }
        debug!("Peer '{}' tx {} bytes", self.inner.local_id, data.len());
        self.inner.data_listeners.emit(|l| l.on_data_tx(self, data));
    }

    /// Send a heartbeat request and start its waiter. A no-op while another
    /// request is outstanding.
    pub fn send_heartbeat(&self) -> Result<(), PeerError> {
        let Some(rx) = self.inner.heartbeat.begin() else {
            warn!(
                "Peer '{}' can't send HB message when already waiting for HB response",
                self.inner.local_id
            );
            return Ok(());
        };
        let request = self.charset().encode(HB_REQUEST).into_owned();
        if let Err(e) = self.send_control(&request) {
            self.inner.heartbeat.cancel();
            return Err(e);
        }
        self.inner.heartbeat.emit_send(self);

        let hb_timeout = self.inner.heartbeat.config().hb_timeout;
        tokio::spawn(self.clone().wait_heartbeat(rx, hb_timeout));
        Ok(())
    }

    async fn wait_heartbeat(self, rx: oneshot::Receiver<()>, hb_timeout: Duration) {
        match tokio::time::timeout(hb_timeout, rx).await {
            Ok(Ok(())) => {
                trace!("Peer '{}' HB response received", self.inner.local_id);
                self.inner.heartbeat.emit_success(&self);
            }
            // Slot released by disconnection.
            Ok(Err(_)) => {}
            Err(_) => {
                self.inner.heartbeat.set_timeout_expired();
                self.inner.heartbeat.cancel();
                self.inner.heartbeat.emit_fail(&self);
                self.emit_fail("HB reached timeout");
                if let Err(e) = self.do_disconnect(false).await {
                    warn!("Peer '{}' error disconnecting after HB timeout: {}", self.inner.local_id, e);
                }
            }
        }
    }

    /// Close the connection. A no-op if already disconnected or disconnecting.
    pub async fn disconnect(&self) -> Result<(), PeerError> {
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => Ok(()),
            _ => self.do_disconnect(true).await,
        }
    }

    async fn do_disconnect(&self, local_request: bool) -> Result<(), PeerError> {
        let previous = self.inner.state.send_replace(ConnectionState::Disconnecting);
        match previous {
            ConnectionState::Disconnected => {
                self.inner.state.send_replace(ConnectionState::Disconnected);
                return Ok(());
            }
            ConnectionState::Disconnecting => {}
            _ => {
                trace!("Peer '{}' disconnecting from '{}'", self.inner.local_id, self.inner.remote_id);
                self.inner
                    .connection_listeners
                    .emit(|l| l.on_disconnecting(self));
            }
        }

        // Nothing attached yet: stop the reconnection loop and terminate here.
        if matches!(previous, ConnectionState::Connecting | ConnectionState::Waiting) {
            self.inner.cancel.cancel();
            let writer_attached = self.inner.writer.lock().is_some();
            if !writer_attached {
                self.finish(self.local_close_reason());
                return Ok(());
            }
        }

        // Bye and close share one bound: a remote that stopped reading can't
        // hold the disconnect. Cancelling then releases the pending read.
        let hb_timeout = self.inner.heartbeat.config().hb_timeout;
        let closing = async {
            if local_request {
                if let Some(token) = self.inner.bye.outgoing(self.charset()) {
                    if let Err(e) = self.send_data(token).await {
                        warn!(
                            "Error disconnecting '{}' peer because can't send bye msg: {}",
                            self, e
                        );
                    }
                }
            }
            self.close_writer().await
        };
        let shutdown = match tokio::time::timeout(hb_timeout, closing).await {
            Ok(shutdown) => shutdown,
            Err(_) => {
                debug!("Peer '{}' writer stalled, dropping the connection", self.inner.local_id);
                Ok(())
            }
        };
        self.inner.cancel.cancel();

        match shutdown {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(PeerError::Disconnection {
                peer: self.inner.local_id.clone(),
                source: e,
            }),
            _ => Ok(()),
        }
    }

    /// Shut down the write half once every queued frame is written.
    async fn close_writer(&self) -> io::Result<()> {
        let (done, closed) = oneshot::channel();
        let queued = match self.inner.writer.lock().as_ref() {
            Some(queue) => queue.send(Outgoing::Close(done)).is_ok(),
            None => false,
        };
        if !queued {
            return Ok(());
        }
        closed.await.unwrap_or(Ok(()))
    }

    fn local_close_reason(&self) -> DisconnectionReason {
        if self.inner.heartbeat.is_timeout_expired() {
            DisconnectionReason::HeartbeatTimeout
        } else {
            DisconnectionReason::LocalRequest
        }
    }

    fn finish(&self, reason: DisconnectionReason) {
        if self.inner.reason.set(reason).is_err() {
            return;
        }
        self.inner.writer.lock().take();
        self.inner.cancel.cancel();
        self.inner.heartbeat.cancel();
        self.inner.stats.lock().last_disconnection = Some(SystemTime::now());

        info!(
            "Peer '{}' disconnected from '{}' ({:?})",
            self.inner.local_id, self.inner.remote_id, reason
        );
        self.inner.state.send_replace(ConnectionState::Disconnected);
        self.inner
            .connection_listeners
            .emit(|l| l.on_disconnect(self));
    }

    fn not_connected(&self) -> PeerError {
        PeerError::NotConnected(self.inner.local_id.clone())
    }

    fn stream_error(&self, source: io::Error) -> PeerError {
        PeerError::Stream {
            peer: self.inner.local_id.clone(),
            source,
        }
    }

    // Read loop

    async fn read_loop(self, mut frames: FramedRead<BoxedReader, DelimiterCodec>) {
        let token = self.inner.cancel.clone();

        let exit = loop {
            let timeout = self.inner.heartbeat.config().timeout;
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => break LoopExit::Cancelled,
                next = tokio::time::timeout(timeout, frames.next()) => next,
            };

            match next {
                Err(_) => {
                    // Outstanding probes are resolved by their waiter.
                    if self.inner.heartbeat.is_waiting() {
                        continue;
                    }
                    if let Err(e) = self.send_heartbeat() {
                        self.emit_fail(&format!("Error can't send heartbeat: {}", e));
                        break LoopExit::Failed(DisconnectionReason::ConnectionLost);
                    }
                }
                Ok(None) => {
                    self.emit_fail("Error reading data: reached end of stream");
                    break LoopExit::Failed(DisconnectionReason::ConnectionLost);
                }
                Ok(Some(Err(e))) => {
                    let reason = classify_read_error(&e);
                    if reason == DisconnectionReason::ConnectionLost {
                        self.emit_fail(&format!("Error reading data: {}", e));
                    }
                    break LoopExit::Failed(reason);
                }
                Ok(Some(Ok(frame))) => {
                    if self.dispatch(&frame) {
                        break LoopExit::Bye;
                    }
                }
            }
        };
        drop(frames);

        let reason = match exit {
            LoopExit::Bye => DisconnectionReason::RemoteRequest,
            LoopExit::Cancelled => self.local_close_reason(),
            // A local disconnect in progress wins over the error it caused.
            LoopExit::Failed(_) if token.is_cancelled() || self.state() == ConnectionState::Disconnecting => {
                self.local_close_reason()
            }
            LoopExit::Failed(reason) => reason,
        };
        self.finish(reason);
    }

    /// Returns true when the frame was the remote's bye.
    fn dispatch(&self, frame: &[u8]) -> bool {
        {
            let mut stats = self.inner.stats.lock();
            stats.bytes_rx += frame.len() as u64;
            stats.frames_rx += 1;
            stats.last_data_rx = Some(SystemTime::now());
        }
        debug!("Peer '{}' rx {} bytes", self.inner.local_id, frame.len());
        self.inner.data_listeners.emit(|l| l.on_data_rx(self, frame));

        let charset = self.charset();
        match self.inner.heartbeat.classify(frame, charset) {
            Some(HeartBeatFrame::Response) => {
                self.inner.heartbeat.acknowledge();
                return false;
            }
            Some(HeartBeatFrame::Request) => {
                let response = charset.encode(HB_RESPONSE).into_owned();
                if let Err(e) = self.send_control(&response) {
                    self.emit_fail(&format!("Error send HB response: {}", e));
                }
                return false;
            }
            None => {}
        }

        if self.inner.bye.is_bye(frame, charset) {
            debug!("Peer '{}' received bye from '{}'", self.inner.local_id, self.inner.remote_id);
            self.inner.bye.emit_bye(self);
            return true;
        }

        let text = charset.decode(frame);
        let processed = panic::catch_unwind(AssertUnwindSafe(|| {
            self.inner.processor.process_bytes(self, frame) || self.inner.processor.process_text(self, &text)
        }));
        match processed {
            Ok(true) => {}
            Ok(false) => self.emit_fail(&format!("Received unknown data '{}'", text)),
            Err(cause) => self.emit_fail(&format!(
                "Error occurred processing data '{}': {}",
                text,
                panic_message(cause.as_ref())
            )),
        }
        false
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("processor panicked")
}

/// Owns the write half. Every write races the peer cancellation, so closing
/// never waits behind a remote that stopped reading.
async fn write_loop(
    mut writer: BoxedWriter,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = outgoing.recv() => next,
        };
        match next {
            None => break,
            Some(Outgoing::Frame(frame, done)) => {
                let written = tokio::select! {
                    _ = cancel.cancelled() => Err(io::Error::new(io::ErrorKind::NotConnected, "peer closed while writing")),
                    written = async {
                        writer.write_all(&frame).await?;
                        writer.flush().await
                    } => written,
                };
                let failed = written.is_err();
                let _ = done.send(written);
                if failed {
                    break;
                }
            }
            Some(Outgoing::Close(done)) => {
                let closed = tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    closed = writer.shutdown() => closed,
                };
                let _ = done.send(closed);
                break;
            }
        }
    }
}

fn classify_read_error(err: &io::Error) -> DisconnectionReason {
    let tls_failure = err
        .get_ref()
        .is_some_and(|inner| inner.downcast_ref::<rustls::Error>().is_some());
    if tls_failure {
        return DisconnectionReason::RemoteError;
    }
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => {}
        _ => warn!("Exception on peer processing data not managed: {}", err),
    }
    DisconnectionReason::ConnectionLost
}
