//! The byte-level transport stack: a TCP socket that TLS and deflate layers
//! are swapped into mid-stream.
//!
//! During negotiation the whole stack is owned by one task, because enabling
//! TLS replaces the socket wholesale. Once the layers are final the stack
//! splits into a read half (owned by the reader task) and a write half
//! (shared behind [`WriterHandle`], whose slot lock serializes every write).

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::{BoxFuture, SocketConnector, TlsProvider, TlsSession};
use crate::error::Error;

const READ_CHUNK_SIZE: usize = 8_192;

/// Current time as milliseconds since the UNIX epoch, for activity tracking.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The socket, before or after the TLS upgrade.
enum TcpSocket {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for TcpSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpSocket::Plain(s) => Pin::new(s).poll_read(cx, buf),
            TcpSocket::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TcpSocket::Plain(s) => Pin::new(s).poll_write(cx, buf),
            TcpSocket::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpSocket::Plain(s) => Pin::new(s).poll_flush(cx),
            TcpSocket::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TcpSocket::Plain(s) => Pin::new(s).poll_shutdown(cx),
            TcpSocket::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// What the TLS handshake reported, recorded into the stream state.
pub(crate) struct TlsInfo {
    pub(crate) verify_failure: Option<String>,
    pub(crate) negotiated_compression: Option<String>,
}

/// The full transport stack, exclusively owned during negotiation.
pub(crate) struct Transport {
    socket: Option<TcpSocket>,
    inflater: Option<zlib::Inflater>,
    deflater: Option<zlib::Deflater>,
    scratch: Box<[u8; READ_CHUNK_SIZE]>,
}

impl Transport {
    pub(crate) async fn connect(
        connector: &Arc<dyn SocketConnector>,
        host: &str,
        port: u16,
    ) -> io::Result<Transport> {
        let stream = connector.connect(host, port).await?;
        Ok(Transport {
            socket: Some(TcpSocket::Plain(stream)),
            inflater: None,
            deflater: None,
            scratch: Box::new([0u8; READ_CHUNK_SIZE]),
        })
    }

    /// Upgrade the socket to TLS. `server_name` is the original service name
    /// (RFC 6120 §13.7.2: certificates name the XMPP domain, not the SRV
    /// target). TCP keepalive stays off; the application-level keepalive
    /// covers liveness.
    pub(crate) async fn enable_tls(
        &mut self,
        provider: &Arc<dyn TlsProvider>,
        server_name: &str,
        port: u16,
    ) -> Result<TlsInfo, Error> {
        let socket = match self.socket.take() {
            Some(TcpSocket::Plain(tcp)) => tcp,
            Some(tls @ TcpSocket::Tls(_)) => {
                self.socket = Some(tls);
                return Err(Error::ProtocolError(
                    "TLS negotiated twice on one stream".to_string(),
                ));
            }
            None => return Err(Error::NotConnected),
        };

        let session = provider.attach(socket, server_name, port).await?;
        let TlsSession {
            stream,
            verify_failure,
            negotiated_compression,
        } = session;
        self.socket = Some(TcpSocket::Tls(Box::new(stream)));
        Ok(TlsInfo {
            verify_failure,
            negotiated_compression,
        })
    }

    /// Install the deflate codec pair over the current socket, both
    /// directions, level 9, sync-flushed on every write.
    #[cfg(feature = "zlib")]
    pub(crate) fn enable_compression(&mut self) -> Result<(), Error> {
        if self.inflater.is_some() {
            return Err(Error::CompressionFailed(
                "compression negotiated twice on one stream".to_string(),
            ));
        }
        self.inflater = Some(zlib::Inflater::new());
        self.deflater = Some(zlib::Deflater::new());
        Ok(())
    }

    #[cfg(not(feature = "zlib"))]
    pub(crate) fn enable_compression(&mut self) -> Result<(), Error> {
        Err(Error::CompressionFailed(
            "built without the zlib feature".to_string(),
        ))
    }

    /// Read one chunk off the wire, inflating if compression is active.
    /// Appends to `out` and returns the number of decoded bytes; zero means
    /// end of stream.
    pub(crate) async fn read_chunk(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))?;
        let n = socket.read(&mut self.scratch[..]).await?;
        if n == 0 {
            return Ok(0);
        }
        let before = out.len();
        match &mut self.inflater {
            Some(inflater) => inflater.inflate(&self.scratch[..n], out)?,
            None => out.extend_from_slice(&self.scratch[..n]),
        }
        Ok(out.len() - before)
    }

    /// Write and flush, deflating if compression is active.
    pub(crate) async fn write_str(&mut self, data: &str) -> io::Result<()> {
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))?;
        match &mut self.deflater {
            Some(deflater) => {
                let mut encoded = Vec::with_capacity(data.len() / 2 + 16);
                deflater.deflate(data.as_bytes(), &mut encoded)?;
                socket.write_all(&encoded).await?;
            }
            None => socket.write_all(data.as_bytes()).await?,
        }
        socket.flush().await
    }

    /// Split into the reader-task half and the shared writer half. Only
    /// called once the byte layers are final.
    pub(crate) fn split(mut self) -> (ReadTransport, WriteTransport) {
        let socket = self.socket.take().expect("transport already closed");
        let (read_half, write_half) = tokio::io::split(socket);
        (
            ReadTransport {
                read: read_half,
                inflater: self.inflater,
                scratch: self.scratch,
            },
            WriteTransport {
                write: write_half,
                deflater: self.deflater,
            },
        )
    }
}

/// Read side after the split: socket half plus the inflate layer.
pub(crate) struct ReadTransport {
    read: ReadHalf<TcpSocket>,
    inflater: Option<zlib::Inflater>,
    scratch: Box<[u8; READ_CHUNK_SIZE]>,
}

impl ReadTransport {
    pub(crate) async fn read_chunk(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let n = self.read.read(&mut self.scratch[..]).await?;
        if n == 0 {
            return Ok(0);
        }
        let before = out.len();
        match &mut self.inflater {
            Some(inflater) => inflater.inflate(&self.scratch[..n], out)?,
            None => out.extend_from_slice(&self.scratch[..n]),
        }
        debug!(data = %String::from_utf8_lossy(&out[before..]), "received");
        Ok(out.len() - before)
    }
}

/// Write side after the split: socket half plus the deflate layer.
pub(crate) struct WriteTransport {
    write: WriteHalf<TcpSocket>,
    deflater: Option<zlib::Deflater>,
}

impl WriteTransport {
    async fn write_str(&mut self, data: &str) -> io::Result<()> {
        match &mut self.deflater {
            Some(deflater) => {
                let mut encoded = Vec::with_capacity(data.len() / 2 + 16);
                deflater.deflate(data.as_bytes(), &mut encoded)?;
                self.write.write_all(&encoded).await?;
            }
            None => self.write.write_all(data.as_bytes()).await?,
        }
        self.write.flush().await
    }
}

/// Shared handle to the current writer.
///
/// The slot is `None` before the connection is established and again after
/// close; writes then fail with [`Error::NotConnected`]. The slot lock is
/// held for the whole write and flush, so no write ever interleaves with
/// another or observes a half-installed writer.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    slot: Arc<tokio::sync::Mutex<Option<WriteTransport>>>,
    last_activity: Arc<AtomicU64>,
}

impl WriterHandle {
    pub(crate) fn new() -> Self {
        WriterHandle {
            slot: Arc::new(tokio::sync::Mutex::new(None)),
            last_activity: Arc::new(AtomicU64::new(now_millis())),
        }
    }

    pub(crate) async fn install(&self, writer: WriteTransport) {
        let mut slot = self.slot.lock().await;
        *slot = Some(writer);
        self.last_activity.store(now_millis(), Ordering::Relaxed);
    }

    pub(crate) async fn write_str(&self, data: &str) -> Result<(), Error> {
        let mut slot = self.slot.lock().await;
        let writer = slot.as_mut().ok_or(Error::NotConnected)?;
        writer.write_str(data).await?;
        self.last_activity.store(now_millis(), Ordering::Relaxed);
        debug!(data = %data, "sent");
        Ok(())
    }

    /// How long the outbound stream has been idle.
    pub(crate) fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_millis(now_millis().saturating_sub(last))
    }

    /// Drop the writer, closing the outbound half. Idempotent.
    pub(crate) async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(mut writer) = slot.take() {
            if let Err(e) = writer.write.shutdown().await {
                debug!(error = %e, "error shutting down writer");
            }
        }
    }
}

/// Initialize the rustls crypto provider (idempotent, cheap after the first
/// call).
fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();
    });
}

/// The process-wide default TLS provider, backed by the system's native
/// root certificates.
pub(crate) fn native_tls_provider() -> Arc<dyn TlsProvider> {
    static PROVIDER: OnceLock<Arc<NativeTlsProvider>> = OnceLock::new();
    PROVIDER.get_or_init(|| Arc::new(NativeTlsProvider::new())).clone()
}

/// TLS via rustls with the platform trust store.
///
/// Verification failures do not abort the handshake; they are recorded and
/// reported through [`TlsSession::verify_failure`], so the stream state can
/// distinguish "encrypted" from "encrypted and verified" and the security
/// policy decides what to do about it.
pub struct NativeTlsProvider {
    roots: Option<Arc<RootCertStore>>,
}

impl NativeTlsProvider {
    pub fn new() -> Self {
        init_crypto_provider();

        let mut root_store = RootCertStore::empty();
        let native_certs = rustls_native_certs::load_native_certs();
        for cert in native_certs.certs {
            if let Err(e) = root_store.add(cert) {
                debug!(error = %e, "skipping unusable native root certificate");
            }
        }

        if root_store.is_empty() {
            warn!("no system root certificates found; TLS is unavailable");
            NativeTlsProvider { roots: None }
        } else {
            NativeTlsProvider {
                roots: Some(Arc::new(root_store)),
            }
        }
    }
}

impl Default for NativeTlsProvider {
    fn default() -> Self {
        NativeTlsProvider::new()
    }
}

impl TlsProvider for NativeTlsProvider {
    fn available(&self) -> bool {
        self.roots.is_some()
    }

    fn attach<'a>(
        &'a self,
        socket: TcpStream,
        server_name: &'a str,
        _port: u16,
    ) -> BoxFuture<'a, Result<TlsSession, Error>> {
        Box::pin(async move {
            let roots = self
                .roots
                .clone()
                .ok_or_else(|| Error::TlsHandshakeFailed("no trust roots available".to_string()))?;

            let verifier = RecordingCertVerifier::new(roots)?;
            let failure = verifier.failure.clone();
            let config = ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(verifier))
                .with_no_client_auth();

            let connector = TlsConnector::from(Arc::new(config));
            let name = ServerName::try_from(server_name.to_string())
                .map_err(|e| Error::TlsHandshakeFailed(format!("invalid server name: {}", e)))?;

            let stream = connector
                .connect(name, socket)
                .await
                .map_err(|e| Error::TlsHandshakeFailed(e.to_string()))?;

            let verify_failure = failure.lock().expect("verifier lock poisoned").take();
            Ok(TlsSession {
                stream,
                verify_failure,
                // rustls never negotiates TLS-level compression.
                negotiated_compression: None,
            })
        })
    }
}

/// Delegates to webpki verification, but records a failure instead of
/// aborting the handshake.
#[derive(Debug)]
struct RecordingCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    failure: Arc<Mutex<Option<String>>>,
}

impl RecordingCertVerifier {
    fn new(roots: Arc<RootCertStore>) -> Result<Self, Error> {
        let inner = WebPkiServerVerifier::builder(roots)
            .build()
            .map_err(|e| Error::TlsHandshakeFailed(format!("verifier setup failed: {}", e)))?;
        Ok(RecordingCertVerifier {
            inner,
            failure: Arc::new(Mutex::new(None)),
        })
    }
}

impl ServerCertVerifier for RecordingCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => Ok(verified),
            Err(e) => {
                warn!(error = %e, "server certificate did not verify; connection is encrypted but not secure");
                *self.failure.lock().expect("verifier lock poisoned") = Some(e.to_string());
                Ok(ServerCertVerified::assertion())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

#[cfg(feature = "zlib")]
mod zlib {
    //! Symmetric deflate codecs, sync-flushed so every stanza crosses the
    //! wire immediately instead of lingering in the compressor.

    use std::io;

    use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

    const CODEC_CHUNK: usize = 8_192;
    const COMPRESSION_LEVEL: u32 = 9;

    pub(crate) struct Deflater {
        inner: Compress,
    }

    impl Deflater {
        pub(crate) fn new() -> Self {
            Deflater {
                inner: Compress::new(Compression::new(COMPRESSION_LEVEL), true),
            }
        }

        pub(crate) fn deflate(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
            loop {
                let before_in = self.inner.total_in();
                let before_out = self.inner.total_out();
                let mut chunk = [0u8; CODEC_CHUNK];

                self.inner
                    .compress(input, &mut chunk, FlushCompress::Sync)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                let consumed = (self.inner.total_in() - before_in) as usize;
                let produced = (self.inner.total_out() - before_out) as usize;
                out.extend_from_slice(&chunk[..produced]);
                input = &input[consumed..];

                // Sync flush is complete once all input is consumed and the
                // codec stopped filling the output buffer.
                if input.is_empty() && produced < chunk.len() {
                    return Ok(());
                }
            }
        }
    }

    pub(crate) struct Inflater {
        inner: Decompress,
    }

    impl Inflater {
        pub(crate) fn new() -> Self {
            Inflater {
                inner: Decompress::new(true),
            }
        }

        pub(crate) fn inflate(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> io::Result<()> {
            loop {
                let before_in = self.inner.total_in();
                let before_out = self.inner.total_out();
                let mut chunk = [0u8; CODEC_CHUNK];

                self.inner
                    .decompress(input, &mut chunk, FlushDecompress::None)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

                let consumed = (self.inner.total_in() - before_in) as usize;
                let produced = (self.inner.total_out() - before_out) as usize;
                out.extend_from_slice(&chunk[..produced]);
                input = &input[consumed..];

                // Done once the input is drained and the codec stopped
                // filling the output buffer. A stalled codec with leftover
                // input is waiting for the rest of the deflate block.
                if (input.is_empty() && produced < chunk.len())
                    || (consumed == 0 && produced == 0)
                {
                    return Ok(());
                }
            }
        }
    }

}

#[cfg(not(feature = "zlib"))]
mod zlib {
    //! Stubs so the transport compiles without the codec; negotiation never
    //! offers zlib in this configuration.

    use std::io;

    pub(crate) struct Deflater;
    pub(crate) struct Inflater;

    impl Deflater {
        pub(crate) fn deflate(&mut self, _input: &[u8], _out: &mut Vec<u8>) -> io::Result<()> {
            unreachable!("compression cannot be enabled without the zlib feature")
        }
    }

    impl Inflater {
        pub(crate) fn inflate(&mut self, _input: &[u8], _out: &mut Vec<u8>) -> io::Result<()> {
            unreachable!("compression cannot be enabled without the zlib feature")
        }
    }
}

/// Whether a deflate implementation is compiled in.
pub(crate) fn zlib_available() -> bool {
    cfg!(feature = "zlib")
}
