//! DIGEST-MD5 (RFC 2831), the `qop=auth` subset XMPP servers use.
//!
//! First challenge: parse the directives, compute the response digest with a
//! fresh cnonce, answer with the full directive list. Second challenge (or
//! data carried in `<success/>`): verify the server's `rspauth` so a
//! man-in-the-middle cannot fake the outcome.

use std::collections::HashMap;
use std::sync::Arc;

use md5::{Digest, Md5};
use rand::Rng;

use crate::error::Error;
use crate::sasl::mechanism::{Mechanism, MechanismContext};
use crate::sasl::{hex, CredentialHandler};

const NONCE_COUNT: &str = "00000001";

enum State {
    Initial,
    Responded,
    Complete,
}

pub(crate) struct DigestMd5 {
    username: String,
    password: String,
    credentials: Arc<dyn CredentialHandler>,
    digest_uri: String,
    cnonce: String,
    state: State,
    expected_rspauth: Option<String>,
}

pub(crate) fn digest_md5(ctx: MechanismContext) -> Result<Box<dyn Mechanism>, Error> {
    let password = ctx.credentials.password()?;
    let username = ctx
        .credentials
        .name()
        .unwrap_or_else(|| ctx.authentication_id.clone());
    let cnonce: String = {
        let mut rng = rand::thread_rng();
        (0..2).map(|_| format!("{:016x}", rng.gen::<u64>())).collect()
    };
    Ok(Box::new(DigestMd5 {
        username,
        password,
        credentials: ctx.credentials,
        digest_uri: ctx.digest_uri,
        cnonce,
        state: State::Initial,
        expected_rspauth: None,
    }))
}

impl DigestMd5 {
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, Error> {
        let challenge = std::str::from_utf8(challenge)
            .map_err(|_| Error::ProtocolError("DIGEST-MD5 challenge is not UTF-8".to_string()))?;
        let directives = parse_directives(challenge);

        let nonce = directives
            .get("nonce")
            .ok_or_else(|| Error::ProtocolError("DIGEST-MD5 challenge missing nonce".to_string()))?;

        // Only qop=auth is implemented; integrity and confidentiality layers
        // are not used over XMPP.
        let qop_offered = directives
            .get("qop")
            .map(|qop| qop.split(',').any(|q| q.trim() == "auth"))
            .unwrap_or(true);
        if !qop_offered {
            return Err(Error::MechanismNotSupported("DIGEST-MD5".to_string()));
        }

        // The callback decides the realm, seeded with the server's default.
        let server_realm = directives.get("realm").map(String::as_str).unwrap_or("");
        let realm = self.credentials.realm(server_realm);

        let response = self.compute_response("AUTHENTICATE", &realm, nonce);
        self.expected_rspauth = Some(self.compute_response("", &realm, nonce));

        let mut reply = format!(
            "username=\"{}\",realm=\"{}\",nonce=\"{}\",cnonce=\"{}\",nc={},qop=auth,digest-uri=\"{}\",response={}",
            self.username, realm, nonce, self.cnonce, NONCE_COUNT, self.digest_uri, response
        );
        if directives.get("charset").map(String::as_str) == Some("utf-8") {
            reply.push_str(",charset=utf-8");
        }

        self.state = State::Responded;
        Ok(reply.into_bytes())
    }

    fn verify_rspauth(&mut self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let data = std::str::from_utf8(data)
            .map_err(|_| Error::ProtocolError("DIGEST-MD5 rspauth is not UTF-8".to_string()))?;
        let directives = parse_directives(data);
        let rspauth = directives.get("rspauth").ok_or_else(|| {
            Error::ProtocolError("DIGEST-MD5 server response missing rspauth".to_string())
        })?;

        if Some(rspauth.as_str()) != self.expected_rspauth.as_deref() {
            return Err(Error::AuthFailed {
                mechanism: "DIGEST-MD5".to_string(),
                condition: Some("server response could not be verified".to_string()),
            });
        }

        self.state = State::Complete;
        Ok(Vec::new())
    }

    /// The RFC 2831 response digest. `method` is `"AUTHENTICATE"` for the
    /// client response and empty for the server's `rspauth`.
    fn compute_response(&self, method: &str, realm: &str, nonce: &str) -> String {
        let secret = md5(format!("{}:{}:{}", self.username, realm, self.password).as_bytes());

        let mut a1 = secret.to_vec();
        a1.extend_from_slice(format!(":{}:{}", nonce, self.cnonce).as_bytes());
        let ha1 = hex(&md5(&a1));

        let a2 = format!("{}:{}", method, self.digest_uri);
        let ha2 = hex(&md5(a2.as_bytes()));

        hex(&md5(
            format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, nonce, NONCE_COUNT, self.cnonce, ha2
            )
            .as_bytes(),
        ))
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn evaluate_challenge(&mut self, challenge: &[u8]) -> Result<Vec<u8>, Error> {
        match self.state {
            State::Initial => self.respond(challenge),
            State::Responded => self.verify_rspauth(challenge),
            State::Complete => Err(Error::ProtocolError(
                "unexpected challenge after DIGEST-MD5 completed".to_string(),
            )),
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self.state, State::Complete)
    }
}

fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Parse `key=value,key="quoted value"` directive lists. Unknown keys are
/// kept; the caller picks what it needs.
fn parse_directives(input: &str) -> HashMap<String, String> {
    let mut directives = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(end) = stripped.find('"') else { break };
            value = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }

        directives.insert(key, value);
    }

    directives
}
