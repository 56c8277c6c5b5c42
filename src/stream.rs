//! The XMPP TCP stream engine.
//!
//! `initialize` owns the transport exclusively while byte layers may still
//! be swapped: it connects, opens the stream, and runs feature negotiation
//! (STARTTLS, compression, stream restarts) inline. Once the layers are
//! final it splits the transport, installs the shared writer, seeds the
//! mailbox with the post-negotiation `<features/>` and starts the reader
//! and keepalive tasks.
//!
//! The reader task owns the parser and the read half. Each top-level
//! element goes into a mailbox of capacity one and the reader blocks until
//! the consumer takes it, so the server is backpressured one stanza at a
//! time. A single cancellation token is the universal teardown primitive:
//! idempotent, safe from any task, observed by every blocking operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, SecurityMode};
use crate::dns::{self, ConnectData};
use crate::error::Error;
use crate::keepalive;
use crate::negotiation::{FeatureNegotiator, Negotiation, TransportFlags};
use crate::transport::{self, ReadTransport, Transport, WriterHandle};
use crate::xml::{self, ns, Element, Frame, StanzaExtractor};

const STARTTLS_REQUEST: &str = "<starttls xmlns=\"urn:ietf:params:xml:ns:xmpp-tls\"/>";
const COMPRESS_REQUEST: &str =
    "<compress xmlns=\"http://jabber.org/protocol/compress\"><method>zlib</method></compress>";

/// How the stream ended, latched once and replayed to every later
/// `read_packet` call.
#[derive(Clone)]
enum Terminal {
    End,
    Failed(Error),
}

#[derive(Default)]
struct StreamState {
    /// Encrypted, whether or not the certificate verified.
    using_tls: bool,
    /// Encrypted with a verified certificate.
    secure_verified: bool,
    using_stream_compression: bool,
    using_tls_compression: bool,
    /// From the first stream header; never overwritten by later restarts.
    connection_id: Option<String>,
    /// The service name as negotiated: the server may identify itself via
    /// the header's `from`, which then governs stream reopens and SASL.
    service_name: String,
}

struct Shared {
    writer: WriterHandle,
    closed: CancellationToken,
    state: Mutex<StreamState>,
    outcome: Mutex<Option<Terminal>>,
    parser_reset: AtomicBool,
}

impl Shared {
    /// First outcome wins: an error latched by the reader is not demoted to
    /// a plain end-of-stream by a later force close.
    fn set_outcome(&self, outcome: Terminal) {
        let mut slot = self.outcome.lock().expect("outcome lock poisoned");
        if slot.is_none() {
            *slot = Some(outcome);
        }
    }

    fn flags(&self) -> TransportFlags {
        let state = self.state.lock().expect("state lock poisoned");
        TransportFlags {
            using_tls: state.using_tls,
            secure_verified: state.secure_verified,
            using_stream_compression: state.using_stream_compression,
            using_tls_compression: state.using_tls_compression,
        }
    }

    /// Read the stream header: validate the envelope, record the connection
    /// id (first header only) and the server-asserted service name. Returns
    /// true for a pre-1.0 server, which will never send `<features/>`.
    fn load_stream_settings(&self, header: &Element) -> Result<bool, Error> {
        if header.name() != "stream"
            || header.namespace() != Some(ns::STREAMS)
            || header.attr("xmlns") != Some(ns::CLIENT)
        {
            return Err(Error::ProtocolError("expected stream:stream".to_string()));
        }

        let version = xml::parse_version(header.attr("version"))?;

        let mut state = self.state.lock().expect("state lock poisoned");
        if state.connection_id.is_none() {
            if let Some(id) = header.attr("id") {
                state.connection_id = Some(id.to_string());
            }
        }
        if let Some(from) = header.attr("from") {
            if !from.is_empty() {
                state.service_name = from.to_string();
            }
        }

        Ok(version < 100)
    }

    /// Tear the connection down: latch the outcome, wake every waiter,
    /// close the outbound half. Idempotent and callable from any task,
    /// including the reader itself.
    async fn force_close(&self) {
        self.set_outcome(Terminal::End);
        self.closed.cancel();
        self.writer.close().await;
    }
}

/// Push-mode delivery of received packets, for callers that prefer
/// callbacks over the pull-based [`XmppStream::read_packet`].
pub trait PacketCallback: Send + 'static {
    /// A stanza arrived from the server.
    fn on_packet(&mut self, packet: Element);

    /// The connection was lost. Terminal; no further callbacks follow.
    fn on_error(&mut self, error: Error);

    /// The connection was lost but the transport can recover it on its own.
    /// The TCP transport never recovers; this exists for alternative
    /// transports implementing the same contract.
    fn on_recoverable_error(&mut self, _error: Error, _error_count: u32) {}
}

/// A single client-to-server XMPP stream over TCP.
///
/// One instance covers one connection attempt; after any disconnect the
/// stream is terminally closed and a fresh instance is needed.
pub struct XmppStream {
    config: Arc<ConnectionConfig>,
    shared: Arc<Shared>,
    mailbox: tokio::sync::Mutex<mpsc::Receiver<Element>>,
    initialized: AtomicBool,
    running: AtomicBool,
    callbacks_set: AtomicBool,
}

impl XmppStream {
    pub fn new(config: ConnectionConfig) -> Self {
        let service_name = config.service_name().to_string();
        // Placeholder receiver; initialize installs the live one.
        let (_tx, rx) = mpsc::channel(1);
        XmppStream {
            config: Arc::new(config),
            shared: Arc::new(Shared {
                writer: WriterHandle::new(),
                closed: CancellationToken::new(),
                state: Mutex::new(StreamState {
                    service_name,
                    ..StreamState::default()
                }),
                outcome: Mutex::new(None),
                parser_reset: AtomicBool::new(false),
            }),
            mailbox: tokio::sync::Mutex::new(rx),
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            callbacks_set: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Resolve the ordered candidate list for this service. Cancellable by
    /// `force_disconnect`; resolution failures fall back to the default
    /// candidate rather than failing the connection outright.
    pub async fn get_connect_data(&self) -> Result<ConnectData, Error> {
        if let Some(host) = self.config.host() {
            return Ok(ConnectData::fixed(host, self.config.port()));
        }

        let service = self.config.service_name().to_string();
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => Err(Error::Disconnected),
            resolved = dns::resolve(&service) => match resolved {
                Ok(data) => Ok(data),
                Err(e) => {
                    warn!(error = %e, "service discovery failed, using fallback");
                    Ok(ConnectData::fallback(&service))
                }
            },
        }
    }

    /// The discovery-less candidate list. Never fails and never blocks;
    /// meant for when `get_connect_data` is timing out.
    pub fn default_connect_data(&self) -> ConnectData {
        match self.config.host() {
            Some(host) => ConnectData::fixed(host, self.config.port()),
            None => ConnectData::fallback(self.config.service_name()),
        }
    }

    /// Establish the connection against `connect_data.candidate(attempt)`:
    /// TCP connect, stream open, transport feature negotiation. On return
    /// the first `read_packet` yields the post-negotiation `<features/>`.
    ///
    /// Any failure tears the connection down before returning.
    pub async fn initialize(&self, connect_data: &ConnectData, attempt: usize) -> Result<(), Error> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(Error::ProtocolError(
                "the connection has already been initialized".to_string(),
            ));
        }

        match self.establish(connect_data, attempt).await {
            Ok(()) => {
                self.running.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.shared.set_outcome(Terminal::Failed(e.clone()));
                self.shared.force_close().await;
                Err(e)
            }
        }
    }

    async fn establish(&self, connect_data: &ConnectData, attempt: usize) -> Result<(), Error> {
        let candidate = connect_data
            .candidate(attempt)
            .ok_or(Error::RemoteServerNotFound(connect_data.attempts()))?;

        info!(host = %candidate.host, port = candidate.port, attempt, "connecting");
        let mut transport = tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => return Err(Error::Disconnected),
            connected = Transport::connect(
                self.config.socket_connector(),
                &candidate.host,
                candidate.port,
            ) => connected?,
        };

        let mut extractor = StanzaExtractor::new();
        transport
            .write_str(&xml::open_stream_tag(&self.service_name()))
            .await?;

        let tls_provider = self.config.tls_provider();
        let mut negotiator = FeatureNegotiator::new(
            self.config.security_mode(),
            self.config.compression_enabled(),
            tls_provider.available(),
            transport::zlib_available(),
        );

        let features = loop {
            let element = match self.read_frame(&mut transport, &mut extractor).await? {
                Frame::StreamHeader(header) => {
                    if self.shared.load_stream_settings(&header)? {
                        // Pre-1.0 servers never send <features/>; stand one
                        // in so negotiation concludes uniformly.
                        Element::legacy_features()
                    } else {
                        continue;
                    }
                }
                Frame::Stanza(element) => element,
                Frame::StreamEnd => return Err(Error::StreamTerminated),
            };

            let flags = self.shared.flags();
            match negotiator.on_element(&element, &flags)? {
                Negotiation::SendStartTls => transport.write_str(STARTTLS_REQUEST).await?,
                Negotiation::SendCompress => transport.write_str(COMPRESS_REQUEST).await?,
                Negotiation::EnableTls => {
                    // SNI and certificate checks use the original service
                    // name, not whatever `from` the server asserted.
                    let tls = transport
                        .enable_tls(&tls_provider, self.config.service_name(), candidate.port)
                        .await?;

                    {
                        let mut state = self.shared.state.lock().expect("state lock poisoned");
                        state.using_tls = true;
                        state.secure_verified = tls.verify_failure.is_none();
                        state.using_tls_compression = tls.negotiated_compression.is_some();
                    }

                    if let Some(reason) = tls.verify_failure {
                        if self.config.security_mode() == SecurityMode::Required {
                            return Err(Error::SecurityRequired(reason));
                        }
                        warn!(reason = %reason, "continuing with unverified TLS connection");
                    }

                    info!(host = %candidate.host, "TLS established, restarting stream");
                    extractor.reset();
                    transport
                        .write_str(&xml::open_stream_tag(&self.service_name()))
                        .await?;
                }
                Negotiation::EnableCompression => {
                    transport.enable_compression()?;
                    self.shared
                        .state
                        .lock()
                        .expect("state lock poisoned")
                        .using_stream_compression = true;

                    info!("stream compression enabled, restarting stream");
                    extractor.reset();
                    transport
                        .write_str(&xml::open_stream_tag(&self.service_name()))
                        .await?;
                }
                Negotiation::Complete(features) => break features,
                Negotiation::Ignore => {}
            }
        };

        // The byte layers are final: switch to the steady-state shape.
        let (read_transport, write_transport) = transport.split();
        self.shared.writer.install(write_transport).await;

        let (tx, rx) = mpsc::channel(1);
        *self.mailbox.lock().await = rx;
        tx.send(features)
            .await
            .map_err(|_| Error::Disconnected)?;

        tokio::spawn(reader_loop(
            read_transport,
            extractor,
            tx,
            self.shared.clone(),
        ));
        keepalive::spawn(
            self.shared.writer.clone(),
            self.config.keepalive_interval(),
            self.shared.closed.clone(),
        );

        info!(host = %candidate.host, port = candidate.port, "connection established");
        Ok(())
    }

    /// Read one frame during negotiation, while this task still owns the
    /// whole transport.
    async fn read_frame(
        &self,
        transport: &mut Transport,
        extractor: &mut StanzaExtractor,
    ) -> Result<Frame, Error> {
        let mut bytes = Vec::new();
        loop {
            if let Some(frame) = extractor.next_frame()? {
                return Ok(frame);
            }

            bytes.clear();
            let n = tokio::select! {
                biased;
                _ = self.shared.closed.cancelled() => return Err(Error::Disconnected),
                result = transport.read_chunk(&mut bytes) => result?,
            };
            if n == 0 {
                return Err(Error::StreamTerminated);
            }
            extractor.feed(&bytes)?;
        }
    }

    /// Take the next received stanza. Blocks until one is available.
    ///
    /// `Ok(None)` means the stream has ended; an `Err` means it failed. Both
    /// are terminal: every subsequent call returns the same value without
    /// blocking.
    pub async fn read_packet(&self) -> Result<Option<Element>, Error> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::NotConnected);
        }

        let mut mailbox = self.mailbox.lock().await;
        tokio::select! {
            biased;
            received = mailbox.recv() => match received {
                Some(element) => Ok(Some(element)),
                None => self.terminal_result(),
            },
            _ = self.shared.closed.cancelled() => {
                // A stanza already handed over must not be lost to the race
                // with close.
                match mailbox.try_recv() {
                    Ok(element) => Ok(Some(element)),
                    Err(_) => self.terminal_result(),
                }
            }
        }
    }

    /// Switch to push delivery: a dispatcher task drains the mailbox into
    /// `callbacks`. Stanzas received before this call were buffered by the
    /// mailbox backpressure, so the first delivery — the pending packet or
    /// the terminal error — happens without waiting for new I/O.
    ///
    /// Must only be called once, after `initialize` (and any authentication
    /// driven through `read_packet`) is finished; from then on the mailbox
    /// belongs to the dispatcher.
    pub fn set_packet_callbacks<C: PacketCallback>(self: &Arc<Self>, mut callbacks: C) {
        if self.callbacks_set.swap(true, Ordering::SeqCst) {
            warn!("packet callbacks are already set, ignoring");
            return;
        }

        let stream = self.clone();
        tokio::spawn(async move {
            loop {
                match stream.read_packet().await {
                    Ok(Some(packet)) => callbacks.on_packet(packet),
                    // Closed locally; the caller asked for this.
                    Ok(None) => break,
                    Err(e) => {
                        callbacks.on_error(e);
                        break;
                    }
                }
            }
        });
    }

    fn terminal_result(&self) -> Result<Option<Element>, Error> {
        let outcome = self.shared.outcome.lock().expect("outcome lock poisoned");
        match outcome.clone() {
            Some(Terminal::Failed(e)) => Err(e),
            Some(Terminal::End) | None => Ok(None),
        }
    }

    /// Write raw stanza XML to the server. Serialized against all other
    /// writers (application, keepalive, negotiation-era swaps) by the writer
    /// slot lock.
    pub async fn write_packet(&self, packet: &str) -> Result<(), Error> {
        self.shared.writer.write_str(packet).await
    }

    /// Restart the stream: discard parser state and send a fresh opening
    /// envelope.
    ///
    /// Always safe to call; the underlying byte stream may or may not have
    /// changed. Transport-level restarts (TLS, compression) happen inside
    /// `initialize`; this operation serves the post-`<success/>` SASL
    /// restart, where the bytes keep flowing on the same socket.
    pub async fn stream_reset(&self) -> Result<(), Error> {
        self.shared.parser_reset.store(true, Ordering::SeqCst);
        self.shared
            .writer
            .write_str(&xml::open_stream_tag(&self.service_name()))
            .await
    }

    /// Close the stream cleanly: send the pending payload (if any) together
    /// with `</stream:stream>`, give the server up to the reply timeout to
    /// close its side, then force. Never fails; a failed write simply falls
    /// through to the force close.
    pub async fn graceful_disconnect(&self, final_payload: Option<&str>) {
        if self.shared.closed.is_cancelled() {
            self.force_disconnect().await;
            return;
        }

        let mut packet = final_payload.unwrap_or("").to_string();
        packet.push_str("</stream:stream>");
        if let Err(e) = self.shared.writer.write_str(&packet).await {
            debug!(error = %e, "graceful close write failed, forcing disconnect");
            self.force_disconnect().await;
            return;
        }

        tokio::select! {
            _ = self.shared.closed.cancelled() => {}
            _ = tokio::time::sleep(self.config.reply_timeout()) => {
                debug!("server did not close the stream in time, forcing disconnect");
            }
        }
        self.force_disconnect().await;
    }

    /// Forcibly tear the connection down. Idempotent; safe from any task.
    /// Anything blocked in `read_packet` observes the end of stream
    /// immediately.
    pub async fn force_disconnect(&self) {
        self.shared.force_close().await;
    }

    /// The stream id assigned by the server, once the first stream header
    /// has arrived.
    pub fn connection_id(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .expect("state lock poisoned")
            .connection_id
            .clone()
    }

    /// True when the connection is encrypted with a verified certificate.
    pub fn is_secure(&self) -> bool {
        self.shared.state.lock().expect("state lock poisoned").secure_verified
    }

    /// True when traffic is compressed, at either the stream or TLS layer.
    pub fn is_compressed(&self) -> bool {
        let state = self.shared.state.lock().expect("state lock poisoned");
        state.using_stream_compression || state.using_tls_compression
    }

    /// The negotiated service name: the configured one until the server
    /// asserts its own via the stream header.
    pub fn service_name(&self) -> String {
        self.shared
            .state
            .lock()
            .expect("state lock poisoned")
            .service_name
            .clone()
    }
}

/// Steady-state reader: parse frames off the read half, deliver stanzas
/// through the mailbox one at a time, absorb stream headers, and on any
/// fault latch the outcome and tear the connection down.
async fn reader_loop(
    mut read: ReadTransport,
    mut extractor: StanzaExtractor,
    tx: mpsc::Sender<Element>,
    shared: Arc<Shared>,
) {
    let result: Result<(), Error> = async {
        let mut bytes = Vec::new();
        loop {
            if shared.parser_reset.swap(false, Ordering::SeqCst) {
                extractor.reset();
            }

            let frame = loop {
                if let Some(frame) = extractor.next_frame()? {
                    break frame;
                }

                bytes.clear();
                let n = tokio::select! {
                    biased;
                    _ = shared.closed.cancelled() => return Err(Error::Disconnected),
                    result = read.read_chunk(&mut bytes) => result?,
                };
                if n == 0 {
                    return Err(Error::StreamTerminated);
                }
                // A reset requested while we were blocked reading applies
                // to everything buffered before these bytes: they are the
                // first of the restarted stream.
                if shared.parser_reset.swap(false, Ordering::SeqCst) {
                    extractor.reset();
                }
                extractor.feed(&bytes)?;
            };

            match frame {
                Frame::StreamHeader(header) => {
                    // A restarted stream announces itself again; absorb the
                    // header and keep reading. Pre-1.0 servers get the
                    // stand-in features here too.
                    if shared.load_stream_settings(&header)? {
                        deliver(&tx, &shared, Element::legacy_features()).await?;
                    }
                }
                Frame::Stanza(element) => deliver(&tx, &shared, element).await?,
                Frame::StreamEnd => return Err(Error::StreamTerminated),
            }
        }
    }
    .await;

    match result {
        // Cancelled, or the consumer went away; the close path already ran
        // or nobody is left to care.
        Ok(()) | Err(Error::Disconnected) => debug!("reader task exiting"),
        Err(e) => {
            debug!(error = %e, "reader terminating the connection");
            shared.set_outcome(Terminal::Failed(e));
            shared.force_close().await;
        }
    }
}

/// Hand one element to the consumer, blocking until the single mailbox slot
/// is free. This is the backpressure point: the next element is not parsed
/// until the previous one is consumed.
async fn deliver(
    tx: &mpsc::Sender<Element>,
    shared: &Shared,
    element: Element,
) -> Result<(), Error> {
    tokio::select! {
        biased;
        sent = tx.send(element) => sent.map_err(|_| Error::Disconnected),
        _ = shared.closed.cancelled() => Err(Error::Disconnected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sasl::StaticCredentials;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const SERVER_HEADER: &str = "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        from='example.com' id='c2s-1' version='1.0'>";
    const PLAIN_FEATURES: &str = "<stream:features>\
        <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
        <mechanism>PLAIN</mechanism></mechanisms></stream:features>";

    fn test_config(port: u16) -> ConnectionConfig {
        ConnectionConfig::new("example.com", StaticCredentials::new("secret"))
            .with_host("127.0.0.1", port)
            .with_security_mode(SecurityMode::Disabled)
            .with_keepalive_interval(Duration::ZERO)
            .with_reply_timeout(Duration::from_millis(200))
    }

    async fn read_until(socket: &mut TcpStream, pattern: &str) -> String {
        let mut collected = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            let text = String::from_utf8_lossy(&collected).into_owned();
            if text.contains(pattern) {
                return text;
            }
            let n = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
                .await
                .expect("server read timed out")
                .expect("server read failed");
            assert!(n > 0, "client closed while waiting for {:?}", pattern);
            collected.extend_from_slice(&buf[..n]);
        }
    }

    /// Accepts one connection, answers the stream open with a header and the
    /// PLAIN features, then hands the socket to `script`.
    async fn serve_one<F, Fut>(script: F) -> (u16, tokio::task::JoinHandle<()>)
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_until(&mut socket, "<stream:stream").await;
            socket
                .write_all(format!("{}{}", SERVER_HEADER, PLAIN_FEATURES).as_bytes())
                .await
                .unwrap();
            script(socket).await;
        });
        (port, handle)
    }

    #[tokio::test]
    async fn initialize_surfaces_features_and_stream_settings() {
        let (port, server) = serve_one(|mut socket| async move {
            // Hold the socket open until the client is done inspecting.
            let _ = read_until(&mut socket, "</stream:stream>").await;
        })
        .await;

        let stream = XmppStream::new(test_config(port));
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();

        assert_eq!(stream.connection_id(), Some("c2s-1".to_string()));
        assert_eq!(stream.service_name(), "example.com");
        assert!(!stream.is_secure());
        assert!(!stream.is_compressed());

        let features = stream.read_packet().await.unwrap().expect("features");
        assert_eq!(features.name(), "features");
        assert!(features.child("mechanisms").is_some());

        stream.graceful_disconnect(None).await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn stanzas_are_delivered_in_order() {
        let (port, _server) = serve_one(|mut socket| async move {
            socket
                .write_all(b"<message id='m1'/><message id='m2'/><message id='m3'/>")
                .await
                .unwrap();
            // Keep the socket alive while the client reads.
            let _ = read_until(&mut socket, "</stream:stream>").await;
        })
        .await;

        let stream = XmppStream::new(test_config(port));
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();

        let _features = stream.read_packet().await.unwrap().unwrap();
        for expected in ["m1", "m2", "m3"] {
            let stanza = stream.read_packet().await.unwrap().expect("stanza");
            assert_eq!(stanza.attr("id"), Some(expected));
        }
        stream.graceful_disconnect(None).await;
    }

    #[tokio::test]
    async fn force_disconnect_unblocks_reader_and_latches_end() {
        let (port, _server) = serve_one(|mut socket| async move {
            // Send nothing further; the client reader stays blocked.
            let mut buf = [0u8; 1024];
            let _ = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf)).await;
        })
        .await;

        let stream = Arc::new(XmppStream::new(test_config(port)));
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();
        let _features = stream.read_packet().await.unwrap().unwrap();

        let reading = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.read_packet().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        stream.force_disconnect().await;

        let blocked_result = tokio::time::timeout(Duration::from_secs(1), reading)
            .await
            .expect("blocked read_packet should return promptly")
            .unwrap();
        assert!(matches!(blocked_result, Ok(None)));

        // Terminal state sticks without blocking.
        assert!(matches!(stream.read_packet().await, Ok(None)));
        assert!(matches!(stream.read_packet().await, Ok(None)));
    }

    #[tokio::test]
    async fn force_disconnect_is_idempotent() {
        let (port, _server) = serve_one(|mut socket| async move {
            let mut buf = [0u8; 1024];
            let _ = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf)).await;
        })
        .await;

        let stream = XmppStream::new(test_config(port));
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();
        let _features = stream.read_packet().await.unwrap().unwrap();

        stream.force_disconnect().await;
        stream.force_disconnect().await;
        stream.force_disconnect().await;
        assert!(matches!(stream.read_packet().await, Ok(None)));
    }

    #[tokio::test]
    async fn server_stream_end_surfaces_terminated_error() {
        let (port, _server) = serve_one(|mut socket| async move {
            socket.write_all(b"</stream:stream>").await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf)).await;
        })
        .await;

        let stream = XmppStream::new(test_config(port));
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();
        let _features = stream.read_packet().await.unwrap().unwrap();

        assert!(matches!(
            stream.read_packet().await,
            Err(Error::StreamTerminated)
        ));
        // The error is the terminal value for every later call too.
        assert!(matches!(
            stream.read_packet().await,
            Err(Error::StreamTerminated)
        ));
    }

    #[tokio::test]
    async fn write_after_close_is_not_connected() {
        let (port, _server) = serve_one(|_socket| async move {}).await;

        let stream = XmppStream::new(test_config(port));
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();
        stream.force_disconnect().await;

        assert!(matches!(
            stream.write_packet("<presence/>").await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn graceful_disconnect_sends_payload_with_stream_end() {
        let (port, server) = serve_one(|mut socket| async move {
            let received = read_until(&mut socket, "</stream:stream>").await;
            assert!(received.contains("<presence type=\"unavailable\"/></stream:stream>"));
            socket.write_all(b"</stream:stream>").await.unwrap();
        })
        .await;

        let stream = XmppStream::new(test_config(port));
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();
        let _features = stream.read_packet().await.unwrap().unwrap();

        stream
            .graceful_disconnect(Some("<presence type=\"unavailable\"/>"))
            .await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn keepalive_writes_a_space_when_idle() {
        let (port, server) = serve_one(|mut socket| async move {
            let mut buf = [0u8; 64];
            let n = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
                .await
                .expect("expected a keepalive before timeout")
                .unwrap();
            assert!(n > 0);
            assert_eq!(&buf[..n], b" ");
        })
        .await;

        let config = test_config(port).with_keepalive_interval(Duration::from_millis(50));
        let stream = XmppStream::new(config);
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();

        server.await.unwrap();
        stream.force_disconnect().await;
    }

    #[tokio::test]
    async fn packet_callbacks_get_features_then_stanzas_then_error() {
        let (port, _server) = serve_one(|mut socket| async move {
            socket.write_all(b"<message id='m1'/>").await.unwrap();
            socket.write_all(b"</stream:stream>").await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf)).await;
        })
        .await;

        struct Recorder {
            names: Arc<Mutex<Vec<String>>>,
            done: tokio::sync::mpsc::UnboundedSender<()>,
        }
        impl PacketCallback for Recorder {
            fn on_packet(&mut self, packet: Element) {
                self.names.lock().unwrap().push(packet.name().to_string());
            }
            fn on_error(&mut self, error: Error) {
                self.names
                    .lock()
                    .unwrap()
                    .push(format!("error:{}", matches!(error, Error::StreamTerminated)));
                let _ = self.done.send(());
            }
        }

        let stream = Arc::new(XmppStream::new(test_config(port)));
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();

        let names = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        stream.set_packet_callbacks(Recorder {
            names: names.clone(),
            done: done_tx,
        });

        tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
            .await
            .expect("callback dispatch should reach the terminal error");
        assert_eq!(
            *names.lock().unwrap(),
            vec!["features", "message", "error:true"]
        );
    }

    #[tokio::test]
    async fn attempt_past_candidate_list_is_remote_server_not_found() {
        let stream = XmppStream::new(test_config(1));
        let data = ConnectData::fixed("127.0.0.1", 1);
        let err = stream.initialize(&data, 1).await.unwrap_err();
        assert!(matches!(err, Error::RemoteServerNotFound(1)));
    }

    #[tokio::test]
    async fn read_before_initialize_is_not_connected() {
        let stream = XmppStream::new(test_config(1));
        assert!(matches!(
            stream.read_packet().await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn legacy_server_yields_synthetic_features() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_until(&mut socket, "<stream:stream").await;
            // No version attribute: a pre-1.0 server that will never send
            // <features/>.
            socket
                .write_all(
                    b"<stream:stream xmlns='jabber:client' \
                      xmlns:stream='http://etherx.jabber.org/streams' id='old-1'>",
                )
                .await
                .unwrap();
            let mut buf = [0u8; 1024];
            let _ = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf)).await;
        });

        let stream = XmppStream::new(test_config(port));
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();

        let features = stream.read_packet().await.unwrap().expect("features");
        assert!(features.is("features", ns::STREAMS));
        assert!(features.children().is_empty());
        stream.force_disconnect().await;
    }

    #[cfg(feature = "zlib")]
    #[tokio::test]
    async fn compression_is_negotiated_and_used_both_ways() {
        use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

        fn deflate(codec: &mut Compress, data: &[u8]) -> Vec<u8> {
            let mut out = vec![0u8; data.len() + 64];
            let before = codec.total_out();
            codec
                .compress(data, &mut out, FlushCompress::Sync)
                .unwrap();
            out.truncate((codec.total_out() - before) as usize);
            out
        }

        fn inflate(codec: &mut Decompress, data: &[u8]) -> Vec<u8> {
            let mut out = vec![0u8; 16 * 1024];
            let before = codec.total_out();
            codec
                .decompress(data, &mut out, FlushDecompress::None)
                .unwrap();
            out.truncate((codec.total_out() - before) as usize);
            out
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_until(&mut socket, "<stream:stream").await;
            socket
                .write_all(
                    format!(
                        "{}<stream:features>\
                         <compression xmlns='http://jabber.org/protocol/compress'>\
                         <method>zlib</method></compression></stream:features>",
                        SERVER_HEADER
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();

            read_until(&mut socket, "</compress>").await;
            socket
                .write_all(b"<compressed xmlns='http://jabber.org/protocol/compress'/>")
                .await
                .unwrap();

            // Everything from here on is deflated in both directions.
            let mut deflater = Compress::new(Compression::new(9), true);
            let mut inflater = Decompress::new(true);

            let mut buf = [0u8; 4096];
            let mut opened = Vec::new();
            while !String::from_utf8_lossy(&opened).contains("<stream:stream") {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0);
                opened.extend(inflate(&mut inflater, &buf[..n]));
            }

            let reply = format!("{}{}", SERVER_HEADER, PLAIN_FEATURES);
            let compressed = deflate(&mut deflater, reply.as_bytes());
            socket.write_all(&compressed).await.unwrap();

            // Expect a compressed stanza from the client.
            let mut received = Vec::new();
            while !String::from_utf8_lossy(&received).contains("<presence/>") {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0);
                received.extend(inflate(&mut inflater, &buf[..n]));
            }
        });

        let stream = XmppStream::new(test_config(port));
        let data = stream.get_connect_data().await.unwrap();
        stream.initialize(&data, 0).await.unwrap();
        assert!(stream.is_compressed());

        let features = stream.read_packet().await.unwrap().expect("features");
        assert!(features.child("mechanisms").is_some());

        stream.write_packet("<presence/>").await.unwrap();
        server.await.unwrap();
        stream.force_disconnect().await;
    }
}
