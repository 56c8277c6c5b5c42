//! SASL mechanism drivers.
//!
//! Each driver handles one named challenge/response protocol; the
//! authentication loop in the parent module moves the bytes. Drivers are
//! built by registry factories; a factory fails with
//! [`Error::MechanismNotSupported`] when the mechanism cannot work on this
//! system, which makes the loop move on to the next preference.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use md5::Md5;

use crate::error::Error;
use crate::sasl::CredentialHandler;

/// Everything a mechanism may need at construction time.
pub struct MechanismContext {
    /// The authentication id, normally the bare username.
    pub authentication_id: String,
    /// The negotiated service name (from the stream header), not the
    /// transport host.
    pub service_name: String,
    /// `"xmpp/" + service_name`, for mechanisms that bind to a service.
    pub digest_uri: String,
    pub credentials: Arc<dyn CredentialHandler>,
}

impl MechanismContext {
    /// The name to authenticate as: the handler's, or the authentication id
    /// given to the driver.
    fn authentication_name(&self) -> String {
        self.credentials
            .name()
            .unwrap_or_else(|| self.authentication_id.clone())
    }
}

/// One SASL mechanism mid-exchange.
pub trait Mechanism: Send {
    fn name(&self) -> &'static str;

    /// The payload for the `<auth/>` element: `None` sends an empty element,
    /// `Some` with empty bytes sends the explicit empty response (`=`).
    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, Error> {
        Ok(None)
    }

    /// Answer one decoded `<challenge/>`.
    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, Error>;

    /// True once the mechanism has nothing left to verify; `<success/>`
    /// carrying data is fed through `evaluate_challenge` only while this is
    /// false.
    fn is_complete(&self) -> bool;
}

impl std::fmt::Debug for dyn Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mechanism").field("name", &self.name()).finish()
    }
}

pub type MechanismFactory = fn(MechanismContext) -> Result<Box<dyn Mechanism>, Error>;

/// RFC 4616 PLAIN: `authzid NUL authcid NUL password` in one shot.
struct Plain {
    authcid: String,
    password: String,
    sent: bool,
}

pub(crate) fn plain(ctx: MechanismContext) -> Result<Box<dyn Mechanism>, Error> {
    let password = ctx.credentials.password()?;
    Ok(Box::new(Plain {
        authcid: ctx.authentication_name(),
        password,
        sent: false,
    }))
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, Error> {
        self.sent = true;
        let mut payload = Vec::with_capacity(self.authcid.len() + self.password.len() + 2);
        payload.push(0);
        payload.extend_from_slice(self.authcid.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.password.as_bytes());
        Ok(Some(payload))
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::ProtocolError(
            "unexpected challenge for PLAIN".to_string(),
        ))
    }

    fn is_complete(&self) -> bool {
        self.sent
    }
}

/// SASL ANONYMOUS: no credentials at all; any challenge gets an empty
/// response.
struct Anonymous;

pub(crate) fn anonymous(_ctx: MechanismContext) -> Result<Box<dyn Mechanism>, Error> {
    Ok(Box::new(Anonymous))
}

impl Mechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }

    fn is_complete(&self) -> bool {
        true
    }
}

/// SASL EXTERNAL: authentication was already established out of band
/// (typically the TLS client certificate). Sends the explicit empty
/// response.
struct External {
    sent: bool,
}

pub(crate) fn external(_ctx: MechanismContext) -> Result<Box<dyn Mechanism>, Error> {
    Ok(Box::new(External { sent: false }))
}

impl Mechanism for External {
    fn name(&self) -> &'static str {
        "EXTERNAL"
    }

    fn initial_response(&mut self) -> Result<Option<Vec<u8>>, Error> {
        self.sent = true;
        Ok(Some(Vec::new()))
    }

    fn evaluate_challenge(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::ProtocolError(
            "unexpected challenge for EXTERNAL".to_string(),
        ))
    }

    fn is_complete(&self) -> bool {
        self.sent
    }
}

/// RFC 2195 CRAM-MD5: one challenge, answered with
/// `username SP hex(HMAC-MD5(password, challenge))`.
struct CramMd5 {
    username: String,
    password: String,
    complete: bool,
}

pub(crate) fn cram_md5(ctx: MechanismContext) -> Result<Box<dyn Mechanism>, Error> {
    let password = ctx.credentials.password()?;
    Ok(Box::new(CramMd5 {
        username: ctx.authentication_name(),
        password,
        complete: false,
    }))
}

impl Mechanism for CramMd5 {
    fn name(&self) -> &'static str {
        "CRAM-MD5"
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, Error> {
        if self.complete {
            return Err(Error::ProtocolError(
                "unexpected second challenge for CRAM-MD5".to_string(),
            ));
        }

        let mut mac = Hmac::<Md5>::new_from_slice(self.password.as_bytes())
            .map_err(|_| Error::MechanismNotSupported("CRAM-MD5".to_string()))?;
        mac.update(challenge);
        let digest = mac.finalize().into_bytes();

        self.complete = true;
        Ok(format!("{} {}", self.username, crate::sasl::hex(&digest)).into_bytes())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

/// GSSAPI requires a platform Kerberos stack, which is not bundled; the
/// factory reports the mechanism unsupported so the authentication loop
/// moves on to the next preference.
pub(crate) fn gssapi(_ctx: MechanismContext) -> Result<Box<dyn Mechanism>, Error> {
    Err(Error::MechanismNotSupported("GSSAPI".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sasl::StaticCredentials;

    fn ctx(username: &str, password: &str) -> MechanismContext {
        MechanismContext {
            authentication_id: username.to_string(),
            service_name: "example.com".to_string(),
            digest_uri: "xmpp/example.com".to_string(),
            credentials: StaticCredentials::new(password),
        }
    }

    #[test]
    fn plain_initial_response_is_nul_separated() {
        let mut mechanism = plain(ctx("alice", "secret")).unwrap();
        let initial = mechanism.initial_response().unwrap().unwrap();
        assert_eq!(initial, b"\0alice\0secret");
        assert!(mechanism.is_complete());
    }

    #[test]
    fn plain_rejects_challenges() {
        let mut mechanism = plain(ctx("alice", "secret")).unwrap();
        mechanism.initial_response().unwrap();
        assert!(mechanism.evaluate_challenge(b"data").is_err());
    }

    #[test]
    fn external_sends_explicit_empty_response() {
        let mut mechanism = external(ctx("alice", "secret")).unwrap();
        let initial = mechanism.initial_response().unwrap().unwrap();
        assert!(initial.is_empty());
    }

    #[test]
    fn anonymous_has_no_initial_response() {
        let mut mechanism = anonymous(ctx("", "")).unwrap();
        assert_eq!(mechanism.initial_response().unwrap(), None);
        assert!(mechanism.is_complete());
        assert_eq!(mechanism.evaluate_challenge(b"x").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn cram_md5_matches_rfc_2195_example() {
        let mut mechanism = cram_md5(ctx("tim", "tanstaaftanstaaf")).unwrap();
        assert!(!mechanism.is_complete());
        let response = mechanism
            .evaluate_challenge(b"<1896.697170952@postoffice.reston.mci.net>")
            .unwrap();
        assert_eq!(
            String::from_utf8(response).unwrap(),
            "tim b913a602c7eda7a495b4e6e7334d3890"
        );
        assert!(mechanism.is_complete());
    }

    #[test]
    fn gssapi_is_reported_unsupported() {
        let err = gssapi(ctx("alice", "secret")).unwrap_err();
        assert!(matches!(err, Error::MechanismNotSupported(name) if name == "GSSAPI"));
    }
}
