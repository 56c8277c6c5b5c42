//! Connection configuration and the collaborator interfaces the engine
//! consumes: socket construction, TLS attachment and legacy (pre-SASL)
//! authentication. All of them can be replaced for testing or for exotic
//! deployments; defaults cover the normal case.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::Error;
use crate::sasl::{CredentialHandler, MechanismRegistry};
use crate::stream::XmppStream;

/// TCP connection timeout applied to each candidate attempt.
///
/// Without this, the OS default applies — which can be 30-120 seconds for
/// unreachable hosts, leaving the caller with no feedback while later SRV
/// candidates go untried.
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default interval between idle keepalive writes. Zero disables keepalives.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default time to wait for a direct reply (bind and session IQs, graceful
/// stream shutdown).
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Security policy for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// TLS with a verified certificate is mandatory; fail otherwise.
    Required,
    /// Use TLS when the server offers it. The default.
    Enabled,
    /// Never negotiate TLS, even if the server requires it.
    Disabled,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Creates the TCP socket for a connection attempt. The default connects
/// directly; replacements can route through proxies or in-process fixtures.
pub trait SocketConnector: Send + Sync {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<TcpStream>>;
}

/// Direct TCP connection under [`TCP_CONNECT_TIMEOUT`].
pub struct TcpConnector;

impl SocketConnector for TcpConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<TcpStream>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(
                TCP_CONNECT_TIMEOUT,
                TcpStream::connect((host, port)),
            )
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "TCP connect timed out after {}s to {}:{}",
                        TCP_CONNECT_TIMEOUT.as_secs(),
                        host,
                        port
                    ),
                )
            })??;
            stream.set_nodelay(true)?;
            Ok(stream)
        })
    }
}

/// Outcome of a TLS attachment: the encrypted stream plus what the handshake
/// learned. `verify_failure` is `None` when the certificate chain verified;
/// otherwise the connection is encrypted but not secure.
pub struct TlsSession {
    pub stream: tokio_rustls::client::TlsStream<TcpStream>,
    pub verify_failure: Option<String>,
    pub negotiated_compression: Option<String>,
}

/// Builds TLS sessions over an established socket. A pre-built context is
/// injected; the engine never manages certificate stores itself.
pub trait TlsProvider: Send + Sync {
    /// Whether TLS can be attempted at all (e.g. trust roots were found).
    fn available(&self) -> bool;

    /// Perform the handshake over `socket`, using `server_name` for SNI and
    /// certificate verification. `server_name` is the original service name,
    /// not the SRV target host.
    fn attach<'a>(
        &'a self,
        socket: TcpStream,
        server_name: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<TlsSession, Error>>;
}

/// Legacy (non-SASL, XEP-0078 style) authentication, consulted only when the
/// preference list shares no mechanism with the server. External collaborator;
/// the engine only defines the seam.
pub trait LegacyAuthenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        stream: &'a XmppStream,
        username: &'a str,
        resource: &'a str,
    ) -> BoxFuture<'a, Result<String, Error>>;

    fn authenticate_anonymously<'a>(
        &'a self,
        stream: &'a XmppStream,
    ) -> BoxFuture<'a, Result<String, Error>>;
}

/// Configuration for one connection. Immutable once handed to
/// [`XmppStream::new`]; the negotiated service name (which the server may
/// rewrite via the stream header's `from`) lives on the stream, not here.
pub struct ConnectionConfig {
    service_name: String,
    host: Option<String>,
    port: u16,
    security_mode: SecurityMode,
    compression_enabled: bool,
    reply_timeout: Duration,
    keepalive_interval: Duration,
    socket_connector: Arc<dyn SocketConnector>,
    tls_provider: Option<Arc<dyn TlsProvider>>,
    credentials: Arc<dyn CredentialHandler>,
    sasl_registry: MechanismRegistry,
    legacy_auth: Option<Arc<dyn LegacyAuthenticator>>,
}

impl ConnectionConfig {
    /// Configuration for the given XMPP service (the logical domain, e.g.
    /// `example.com`), with SRV discovery and default collaborators.
    pub fn new(service_name: impl Into<String>, credentials: Arc<dyn CredentialHandler>) -> Self {
        ConnectionConfig {
            service_name: service_name.into(),
            host: None,
            port: 5222,
            security_mode: SecurityMode::Enabled,
            compression_enabled: true,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            socket_connector: Arc::new(TcpConnector),
            tls_provider: None,
            credentials,
            sasl_registry: MechanismRegistry::default(),
            legacy_auth: None,
        }
    }

    /// Connect to an explicit host and port instead of SRV discovery.
    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = port;
        self
    }

    pub fn with_security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Zero disables the keepalive task entirely.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_socket_connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.socket_connector = connector;
        self
    }

    pub fn with_tls_provider(mut self, provider: Arc<dyn TlsProvider>) -> Self {
        self.tls_provider = Some(provider);
        self
    }

    pub fn with_sasl_registry(mut self, registry: MechanismRegistry) -> Self {
        self.sasl_registry = registry;
        self
    }

    pub fn with_legacy_auth(mut self, auth: Arc<dyn LegacyAuthenticator>) -> Self {
        self.legacy_auth = Some(auth);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    pub fn socket_connector(&self) -> &Arc<dyn SocketConnector> {
        &self.socket_connector
    }

    /// The injected TLS provider, or the process-wide native-roots provider.
    pub(crate) fn tls_provider(&self) -> Arc<dyn TlsProvider> {
        match &self.tls_provider {
            Some(p) => p.clone(),
            None => crate::transport::native_tls_provider(),
        }
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialHandler> {
        &self.credentials
    }

    pub fn sasl_registry(&self) -> &MechanismRegistry {
        &self.sasl_registry
    }

    pub fn legacy_auth(&self) -> Option<&Arc<dyn LegacyAuthenticator>> {
        self.legacy_auth.as_ref()
    }
}
