//! SASL authentication, resource binding and session establishment.
//!
//! The registry maps mechanism names to driver factories and carries the
//! ordered preference list (position 0 = most preferred). It is a value
//! owned by the connection configuration, not process-wide state; the
//! default covers the built-in mechanisms.
//!
//! [`SaslAuthentication`] walks the preference list against the server's
//! advertisement, runs the challenge loop for the chosen mechanism over the
//! stream, and on `<success/>` restarts the stream, binds the resource and
//! establishes a session when the server offers one.

pub mod mechanism;

mod digest_md5;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use base64::prelude::*;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::stream::XmppStream;
use crate::xml::{ns, Element};

pub use mechanism::{Mechanism, MechanismContext, MechanismFactory};

/// How long to wait for `<success/>` or `<failure/>` once a mechanism
/// exchange has started.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the post-authentication `<features/>` advertising
/// resource binding.
const BIND_TIMEOUT: Duration = Duration::from_secs(30);

/// The slice anonymous authentication waits per packet before giving up.
const ANONYMOUS_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// How the challenge-loop wait is applied.
#[derive(PartialEq)]
enum WaitPolicy {
    /// One deadline for the whole exchange.
    Overall,
    /// The deadline re-arms on every received packet, so it bounds silence
    /// rather than the exchange.
    PerPacket,
}

/// Supplies the secrets a mechanism asks for.
pub trait CredentialHandler: Send + Sync {
    /// Authentication name; `None` means "use the id the caller passed to
    /// `authenticate`".
    fn name(&self) -> Option<String> {
        None
    }

    fn password(&self) -> Result<String, Error>;

    /// Realm for DIGEST-MD5, seeded with the server's default realm.
    fn realm(&self, server_default: &str) -> String {
        server_default.to_string()
    }
}

/// Fixed credentials known up front.
pub struct StaticCredentials {
    name: Option<String>,
    password: String,
}

impl StaticCredentials {
    pub fn new(password: impl Into<String>) -> Arc<Self> {
        Arc::new(StaticCredentials {
            name: None,
            password: password.into(),
        })
    }

    pub fn with_name(name: impl Into<String>, password: impl Into<String>) -> Arc<Self> {
        Arc::new(StaticCredentials {
            name: Some(name.into()),
            password: password.into(),
        })
    }
}

impl CredentialHandler for StaticCredentials {
    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    fn password(&self) -> Result<String, Error> {
        Ok(self.password.clone())
    }
}

/// Mechanism constructors plus the ordered preference list.
///
/// Registering makes a mechanism constructible; supporting puts it in the
/// preference order that selection walks. The split allows a mechanism to
/// stay available for explicit use without being picked automatically
/// (EXTERNAL, in the default set).
pub struct MechanismRegistry {
    implemented: HashMap<String, MechanismFactory>,
    preferences: Vec<String>,
}

impl MechanismRegistry {
    pub fn empty() -> Self {
        MechanismRegistry {
            implemented: HashMap::new(),
            preferences: Vec::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, factory: MechanismFactory) {
        self.implemented.insert(name.into(), factory);
    }

    /// Remove a mechanism entirely, preference entry included.
    pub fn unregister(&mut self, name: &str) {
        self.implemented.remove(name);
        self.unsupport(name);
    }

    /// Prepend to the preference list (most preferred).
    pub fn support(&mut self, name: impl Into<String>) {
        self.preferences.insert(0, name.into());
    }

    /// Insert at a preference position; out-of-range clamps to the end.
    pub fn support_at(&mut self, name: impl Into<String>, index: usize) {
        let index = index.min(self.preferences.len());
        self.preferences.insert(index, name.into());
    }

    /// Drop from the preference list; the mechanism stays registered.
    pub fn unsupport(&mut self, name: &str) {
        self.preferences.retain(|p| p != name);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.implemented.contains_key(name)
    }

    pub fn preferences(&self) -> &[String] {
        &self.preferences
    }

    pub(crate) fn factory(&self, name: &str) -> Option<MechanismFactory> {
        self.implemented.get(name).copied()
    }
}

impl Default for MechanismRegistry {
    fn default() -> Self {
        let mut registry = MechanismRegistry::empty();
        registry.register("EXTERNAL", mechanism::external);
        registry.register("GSSAPI", mechanism::gssapi);
        registry.register("DIGEST-MD5", digest_md5::digest_md5);
        registry.register("CRAM-MD5", mechanism::cram_md5);
        registry.register("PLAIN", mechanism::plain);
        registry.register("ANONYMOUS", mechanism::anonymous);

        registry.support("ANONYMOUS");
        registry.support("PLAIN");
        registry.support("CRAM-MD5");
        registry.support("DIGEST-MD5");
        registry.support("GSSAPI");
        registry
    }
}

/// One authentication attempt over an initialized stream.
pub struct SaslAuthentication<'a> {
    stream: &'a XmppStream,
    server_mechanisms: Vec<String>,
    negotiated: bool,
    failed: bool,
    error_condition: Option<String>,
    resource_bound: bool,
    session_supported: bool,
}

impl<'a> SaslAuthentication<'a> {
    pub fn new(stream: &'a XmppStream) -> Self {
        SaslAuthentication {
            stream,
            server_mechanisms: Vec::new(),
            negotiated: false,
            failed: false,
            error_condition: None,
            resource_bound: false,
            session_supported: false,
        }
    }

    fn reset(&mut self) {
        self.server_mechanisms.clear();
        self.negotiated = false;
        self.failed = false;
        self.error_condition = None;
        self.resource_bound = false;
        self.session_supported = false;
    }

    /// The mechanisms a `<features/>` advertises.
    pub fn server_mechanisms(features: &Element) -> Vec<String> {
        features
            .child("mechanisms")
            .map(|mechanisms| {
                mechanisms
                    .children()
                    .iter()
                    .filter(|c| c.name() == "mechanism")
                    .map(|c| c.text().trim().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Authenticate `username` against the given post-negotiation
    /// `<features/>`, bind `resource` (empty lets the server assign one) and
    /// establish a session if offered. Returns the full JID.
    ///
    /// Mechanisms are tried most-preferred first; one that cannot be
    /// initialized locally is skipped, but once a mechanism is on the wire
    /// its failure is final — silently retrying weaker mechanisms would
    /// downgrade security.
    pub async fn authenticate(
        &mut self,
        username: &str,
        resource: &str,
        features: &Element,
    ) -> Result<String, Error> {
        self.reset();
        self.server_mechanisms = Self::server_mechanisms(features);
        debug!(mechanisms = ?self.server_mechanisms, "server advertised SASL mechanisms");

        let registry = self.stream.config().sasl_registry();
        let preferences: Vec<String> = registry.preferences().to_vec();

        let mut wire_failure: Option<Error> = None;
        for name in &preferences {
            if !registry.is_registered(name)
                || !self.server_mechanisms.iter().any(|m| m == name)
            {
                continue;
            }

            match self.authenticate_with(name, username, resource).await {
                Ok(jid) => return Ok(jid),
                Err(Error::MechanismNotSupported(name)) => {
                    debug!(mechanism = %name, "mechanism unavailable locally, trying next");
                    continue;
                }
                Err(e @ Error::AuthTimeout) => return Err(e),
                Err(e) => {
                    // A shared mechanism was attempted and failed; stop.
                    wire_failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = wire_failure {
            return Err(e);
        }

        // Nothing shared with the server: legacy authentication is the last
        // resort, if the caller wired one in.
        warn!("no SASL mechanism shared with the server");
        match self.stream.config().legacy_auth() {
            Some(legacy) => legacy.authenticate(self.stream, username, resource).await,
            None => Err(Error::NoSharedAuthMechanism),
        }
    }

    /// Anonymous login: no credentials, server-assigned identity. The
    /// exchange waits in 5 s slices, re-armed on every received packet; a
    /// silent server surfaces `AuthTimeout`. Only a transport (I/O) fault
    /// falls back to legacy anonymous authentication, when available.
    pub async fn authenticate_anonymously(&mut self) -> Result<String, Error> {
        self.reset();

        let mut driver = mechanism::anonymous(self.mechanism_context(""))?;
        match self
            .run_mechanism(driver.as_mut(), ANONYMOUS_AUTH_TIMEOUT, WaitPolicy::PerPacket)
            .await
        {
            Ok(()) => self.finish_session("").await,
            Err(e @ Error::Io(_)) => match self.stream.config().legacy_auth() {
                Some(legacy) => {
                    debug!(error = %e, "anonymous SASL hit a transport fault, trying legacy authentication");
                    legacy.authenticate_anonymously(self.stream).await
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    fn mechanism_context(&self, username: &str) -> MechanismContext {
        let service_name = self.stream.service_name();
        MechanismContext {
            authentication_id: username.to_string(),
            digest_uri: format!("xmpp/{}", service_name),
            service_name,
            credentials: self.stream.config().credentials().clone(),
        }
    }

    async fn authenticate_with(
        &mut self,
        mechanism_name: &str,
        username: &str,
        resource: &str,
    ) -> Result<String, Error> {
        let factory = self
            .stream
            .config()
            .sasl_registry()
            .factory(mechanism_name)
            .ok_or_else(|| Error::MechanismNotSupported(mechanism_name.to_string()))?;
        let mut driver = factory(self.mechanism_context(username))?;

        info!(mechanism = mechanism_name, "starting SASL authentication");
        self.run_mechanism(driver.as_mut(), AUTH_TIMEOUT, WaitPolicy::Overall)
            .await?;
        self.finish_session(resource).await
    }

    /// The challenge loop: send `<auth/>`, answer `<challenge/>`s, stop on
    /// `<success/>` or `<failure/>`.
    async fn run_mechanism(
        &mut self,
        driver: &mut dyn Mechanism,
        wait: Duration,
        policy: WaitPolicy,
    ) -> Result<(), Error> {
        let auth = match driver.initial_response()? {
            Some(data) if data.is_empty() => format!(
                "<auth xmlns=\"{}\" mechanism=\"{}\">=</auth>",
                ns::SASL,
                driver.name()
            ),
            Some(data) => format!(
                "<auth xmlns=\"{}\" mechanism=\"{}\">{}</auth>",
                ns::SASL,
                driver.name(),
                BASE64_STANDARD.encode(&data)
            ),
            None => format!(
                "<auth xmlns=\"{}\" mechanism=\"{}\"/>",
                ns::SASL,
                driver.name()
            ),
        };
        self.stream.write_packet(&auth).await?;

        let mut deadline = tokio::time::Instant::now() + wait;
        while !self.negotiated && !self.failed {
            let element = self.next_packet_before(deadline, Error::AuthTimeout).await?;
            if policy == WaitPolicy::PerPacket {
                deadline = tokio::time::Instant::now() + wait;
            }
            if element.namespace() != Some(ns::SASL) {
                debug!(element = element.name(), "ignoring non-SASL element during authentication");
                continue;
            }

            match element.name() {
                "challenge" => {
                    let challenge = decode_base64(element.text())?;
                    let response = driver.evaluate_challenge(&challenge)?;
                    let reply = if response.is_empty() {
                        format!("<response xmlns=\"{}\"/>", ns::SASL)
                    } else {
                        format!(
                            "<response xmlns=\"{}\">{}</response>",
                            ns::SASL,
                            BASE64_STANDARD.encode(&response)
                        )
                    };
                    self.stream.write_packet(&reply).await?;
                }
                "success" => {
                    // Some mechanisms carry their final verification data in
                    // the success element itself.
                    let data = element.text().trim();
                    if !data.is_empty() && !driver.is_complete() {
                        driver.evaluate_challenge(&decode_base64(data)?)?;
                    }
                    self.negotiated = true;
                }
                "failure" => {
                    self.failed = true;
                    self.error_condition = element
                        .children()
                        .iter()
                        .find(|c| c.name() != "text")
                        .map(|c| c.name().to_string());
                }
                other => debug!(element = other, "ignoring SASL element"),
            }
        }

        if self.failed {
            return Err(Error::AuthFailed {
                mechanism: driver.name().to_string(),
                condition: self.error_condition.clone(),
            });
        }
        Ok(())
    }

    /// After `<success/>`: restart the stream, wait for the new features to
    /// offer binding, bind the resource, and establish the session. A server
    /// that advertises neither `<bind/>` nor `<session/>` fails the
    /// respective step.
    async fn finish_session(&mut self, resource: &str) -> Result<String, Error> {
        self.stream.stream_reset().await?;
        self.await_bind_offer().await?;

        let jid = self.bind_resource(resource).await?;
        if !self.session_supported {
            return Err(Error::SessionNotOffered);
        }
        self.establish_session().await?;
        info!(jid = %jid, "authentication complete");
        Ok(jid)
    }

    async fn await_bind_offer(&mut self) -> Result<(), Error> {
        let deadline = tokio::time::Instant::now() + BIND_TIMEOUT;
        while !self.resource_bound {
            let element = self.next_packet_before(deadline, Error::AuthTimeout).await?;
            if element.name() != "features" {
                debug!(element = element.name(), "ignoring element while waiting for bind");
                continue;
            }

            for child in element.children() {
                if child.is("bind", ns::BIND) {
                    self.resource_bound = true;
                } else if child.is("session", ns::SESSION) {
                    self.session_supported = true;
                }
            }

            if !self.resource_bound {
                // This features set is final for the restarted stream; no
                // bind offer is coming.
                return Err(Error::BindNotOffered);
            }
        }
        Ok(())
    }

    async fn bind_resource(&mut self, resource: &str) -> Result<String, Error> {
        let id = next_packet_id();
        let iq = format!(
            "<iq id=\"{}\" type=\"set\"><bind xmlns=\"{}\"><resource>{}</resource></bind></iq>",
            id,
            ns::BIND,
            quick_xml::escape::escape(resource)
        );
        self.stream.write_packet(&iq).await?;

        let reply = self.await_iq_reply(&id).await?;
        reply
            .child("bind")
            .and_then(|bind| bind.child("jid"))
            .map(|jid| jid.text().trim().to_string())
            .ok_or_else(|| Error::ProtocolError("bind result missing <jid>".to_string()))
    }

    async fn establish_session(&mut self) -> Result<(), Error> {
        let id = next_packet_id();
        let iq = format!(
            "<iq id=\"{}\" type=\"set\"><session xmlns=\"{}\"/></iq>",
            id,
            ns::SESSION
        );
        self.stream.write_packet(&iq).await?;
        self.await_iq_reply(&id).await?;
        Ok(())
    }

    /// Wait for the IQ reply matching `id`, under the configured reply
    /// timeout. An error reply surfaces its condition.
    async fn await_iq_reply(&self, id: &str) -> Result<Element, Error> {
        let reply_timeout = self.stream.config().reply_timeout();
        let deadline = tokio::time::Instant::now() + reply_timeout;
        loop {
            let element = self
                .next_packet_before(deadline, Error::Timeout(reply_timeout))
                .await?;
            if element.name() != "iq" || element.attr("id") != Some(id) {
                debug!(element = element.name(), "ignoring element while waiting for IQ reply");
                continue;
            }

            return match element.attr("type") {
                Some("result") => Ok(element),
                Some("error") => Err(Error::IqError(error_condition(&element))),
                other => Err(Error::ProtocolError(format!(
                    "unexpected IQ reply type {:?}",
                    other
                ))),
            };
        }
    }

    /// Read the next packet, mapping deadline expiry to `timeout_error` and
    /// end-of-stream to `StreamTerminated`.
    async fn next_packet_before(
        &self,
        deadline: tokio::time::Instant,
        timeout_error: Error,
    ) -> Result<Element, Error> {
        match tokio::time::timeout_at(deadline, self.stream.read_packet()).await {
            Err(_) => Err(timeout_error),
            Ok(Err(e)) => Err(e),
            Ok(Ok(None)) => Err(Error::StreamTerminated),
            Ok(Ok(Some(element))) => Ok(element),
        }
    }
}

fn error_condition(iq: &Element) -> String {
    iq.child("error")
        .and_then(|error| {
            error
                .children()
                .iter()
                .find(|c| c.name() != "text")
                .map(|c| c.name().to_string())
        })
        .unwrap_or_else(|| "undefined-condition".to_string())
}

fn decode_base64(text: &str) -> Result<Vec<u8>, Error> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    BASE64_STANDARD
        .decode(trimmed)
        .map_err(|e| Error::ProtocolError(format!("invalid base64 in SASL exchange: {}", e)))
}

/// Stanza ids: a per-process random prefix plus a counter, so replies can be
/// matched without colliding across reconnects.
fn next_packet_id() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    static PREFIX: OnceLock<String> = OnceLock::new();
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let prefix = PREFIX.get_or_init(|| {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(5)
            .map(char::from)
            .collect()
    });
    format!("{}-{}", prefix, COUNTER.fetch_add(1, Ordering::Relaxed))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}
