//! Client-side XMPP stream engine over TCP.
//!
//! One [`XmppStream`] covers the whole life of a connection: SRV candidate
//! resolution, TCP connect, the `<stream:stream>` envelope, transport
//! feature negotiation (STARTTLS and zlib stream compression, with the
//! stream restarts they require), SASL authentication with resource binding
//! and session establishment, then steady-state stanza exchange until
//! disconnect.
//!
//! ```no_run
//! use xmpp_stream::{ConnectionConfig, SaslAuthentication, StaticCredentials, XmppStream};
//!
//! # async fn connect() -> Result<(), xmpp_stream::Error> {
//! let config = ConnectionConfig::new("example.com", StaticCredentials::new("secret"));
//! let stream = XmppStream::new(config);
//!
//! let connect_data = stream.get_connect_data().await?;
//! stream.initialize(&connect_data, 0).await?;
//!
//! let features = stream.read_packet().await?.expect("features");
//! let mut auth = SaslAuthentication::new(&stream);
//! let jid = auth.authenticate("alice", "phone", &features).await?;
//!
//! stream.write_packet("<presence/>").await?;
//! while let Some(stanza) = stream.read_packet().await? {
//!     println!("{} from {:?}", stanza.name(), stanza.attr("from"));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Received stanzas are handed over one at a time through a single-slot
//! mailbox: the reader does not parse the next element until the previous
//! one is consumed, so a slow consumer backpressures the server instead of
//! buffering unboundedly.

mod config;
mod dns;
mod error;
mod keepalive;
mod negotiation;
mod stream;
mod transport;
mod xml;

pub mod sasl;

pub use config::{
    BoxFuture, ConnectionConfig, LegacyAuthenticator, SecurityMode, SocketConnector, TlsProvider,
    TlsSession,
};
pub use dns::{ConnectCandidate, ConnectData};
pub use error::Error;
pub use sasl::{
    CredentialHandler, Mechanism, MechanismRegistry, SaslAuthentication, StaticCredentials,
};
pub use stream::{PacketCallback, XmppStream};
pub use transport::NativeTlsProvider;
pub use xml::Element;
