//! Transport feature negotiation, driven by the server's `<features/>`.
//!
//! The machine itself does no I/O: each server element maps to a decision
//! that the stream engine executes (write a request, swap in a byte layer,
//! restart the stream, or hand the features upward and stop). TLS is always
//! attempted before compression, and a given `<features/>` yields at most
//! one zlib attempt.

use tracing::{debug, warn};

use crate::config::SecurityMode;
use crate::error::Error;
use crate::xml::{ns, Element};

/// What the engine should do next.
#[derive(Debug, PartialEq)]
pub(crate) enum Negotiation {
    /// Write `<starttls/>`; `<proceed/>` or `<failure/>` follows.
    SendStartTls,
    /// Write `<compress><method>zlib</method></compress>`; `<compressed/>`
    /// or `<failure/>` follows.
    SendCompress,
    /// `<proceed/>` arrived: perform the TLS handshake, then restart the
    /// stream.
    EnableTls,
    /// `<compressed/>` arrived: install the deflate codecs, then restart
    /// the stream.
    EnableCompression,
    /// Transport negotiation is finished; the features belong to the layer
    /// above (SASL).
    Complete(Element),
    /// Benign server noise during negotiation; keep waiting.
    Ignore,
}

/// Current transport facts the decisions depend on.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TransportFlags {
    pub(crate) using_tls: bool,
    pub(crate) secure_verified: bool,
    pub(crate) using_stream_compression: bool,
    pub(crate) using_tls_compression: bool,
}

pub(crate) struct FeatureNegotiator {
    security_mode: SecurityMode,
    compression_enabled: bool,
    tls_available: bool,
    zlib_available: bool,
    /// The most recent `<features/>` advertised `<starttls/>`.
    tls_offered: bool,
    /// The server marked starttls `<required/>`.
    tls_required_by_server: bool,
    /// Compression methods advertised in the most recent `<features/>`.
    /// Methods are removed as they are attempted so a `<failure/>` cannot
    /// loop on the same method.
    compression_methods: Vec<String>,
    features: Option<Element>,
}

impl FeatureNegotiator {
    pub(crate) fn new(
        security_mode: SecurityMode,
        compression_enabled: bool,
        tls_available: bool,
        zlib_available: bool,
    ) -> Self {
        FeatureNegotiator {
            security_mode,
            compression_enabled,
            tls_available,
            zlib_available,
            tls_offered: false,
            tls_required_by_server: false,
            compression_methods: Vec::new(),
            features: None,
        }
    }

    /// Feed the next element received during stream initialization.
    pub(crate) fn on_element(
        &mut self,
        element: &Element,
        flags: &TransportFlags,
    ) -> Result<Negotiation, Error> {
        if element.name() == "features" {
            self.load_features(element, flags)?;
            return self.negotiate_feature(flags);
        }

        if element.is("proceed", ns::TLS) {
            return Ok(Negotiation::EnableTls);
        }

        if element.is("failure", ns::TLS) {
            // The server offered STARTTLS but aborted when we used it. The
            // stream is done for.
            return Err(Error::TlsHandshakeFailed(
                "server failed while initializing TLS".to_string(),
            ));
        }

        if element.is("failure", ns::COMPRESS) {
            // Not fatal: retry against the features we already have, with
            // the failed method no longer a candidate.
            warn!("server rejected stream compression, continuing without it");
            return self.negotiate_feature(flags);
        }

        if element.is("compressed", ns::COMPRESS) {
            return Ok(Negotiation::EnableCompression);
        }

        debug!(element = element.name(), "ignoring element during stream initialization");
        Ok(Negotiation::Ignore)
    }

    fn load_features(&mut self, features: &Element, flags: &TransportFlags) -> Result<(), Error> {
        self.tls_offered = false;
        self.tls_required_by_server = false;
        self.compression_methods.clear();

        for child in features.children() {
            if !flags.using_tls && child.is("starttls", ns::TLS) {
                self.tls_offered = true;

                if child.child("required").is_some() {
                    self.tls_required_by_server = true;
                    if self.security_mode == SecurityMode::Disabled {
                        return Err(Error::SecurityForbidden);
                    }
                }
            } else if child.is("compression", ns::COMPRESS) {
                for method in child.children() {
                    if method.name() == "method" {
                        self.compression_methods.push(method.text().to_string());
                    }
                }
            }
        }

        self.features = Some(features.clone());
        Ok(())
    }

    /// Pick the next feature to negotiate from the current `<features/>`,
    /// or conclude that transport negotiation is complete.
    fn negotiate_feature(&mut self, flags: &TransportFlags) -> Result<Negotiation, Error> {
        // If TLS is required but the server doesn't offer it, give up now.
        // Features are parsed a second time after TLS is established, so
        // check whether we're already secure first.
        if !flags.secure_verified
            && !self.tls_offered
            && self.security_mode == SecurityMode::Required
        {
            return Err(Error::SecurityRequired(
                "server does not offer STARTTLS".to_string(),
            ));
        }

        if !flags.using_tls && self.tls_offered && self.security_mode != SecurityMode::Disabled {
            if self.tls_available {
                return Ok(Negotiation::SendStartTls);
            }

            // Encryption was offered, but we can't initialize it. Fatal when
            // either side insists on it.
            if self.security_mode == SecurityMode::Required || self.tls_required_by_server {
                return Err(Error::SecurityRequired(
                    "no TLS implementation available".to_string(),
                ));
            }
        }

        // Compression is negotiated after encryption, and skipped entirely
        // when the TLS layer already compresses.
        if self.compression_enabled
            && !flags.using_stream_compression
            && !flags.using_tls_compression
            && self.zlib_available
        {
            if let Some(index) = self.compression_methods.iter().position(|m| m == "zlib") {
                // One attempt per <features/>: a <failure/> re-enters this
                // method and must not find zlib again.
                self.compression_methods.remove(index);
                return Ok(Negotiation::SendCompress);
            }
        }

        // Nothing left to negotiate at the transport level; the features we
        // just received belong to the application.
        let features = self.features.clone().ok_or_else(|| {
            Error::ProtocolError("negotiation concluded before any <features/>".to_string())
        })?;
        Ok(Negotiation::Complete(features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse_element;

    fn features(xml: &str) -> Element {
        parse_element(xml).unwrap()
    }

    const STARTTLS_FEATURES: &str = "<stream:features>\
        <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>\
        </stream:features>";
    const PLAIN_FEATURES: &str = "<stream:features>\
        <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
        <mechanism>PLAIN</mechanism></mechanisms></stream:features>";
    const COMPRESSION_FEATURES: &str = "<stream:features>\
        <compression xmlns='http://jabber.org/protocol/compress'>\
        <method>zlib</method></compression></stream:features>";

    fn negotiator(mode: SecurityMode) -> FeatureNegotiator {
        FeatureNegotiator::new(mode, true, true, true)
    }

    #[test]
    fn starttls_is_attempted_when_offered() {
        let mut n = negotiator(SecurityMode::Enabled);
        let step = n
            .on_element(&features(STARTTLS_FEATURES), &TransportFlags::default())
            .unwrap();
        assert_eq!(step, Negotiation::SendStartTls);
    }

    #[test]
    fn tls_required_but_not_offered_fails() {
        let mut n = negotiator(SecurityMode::Required);
        let err = n
            .on_element(&features(PLAIN_FEATURES), &TransportFlags::default())
            .unwrap_err();
        assert!(matches!(err, Error::SecurityRequired(_)));
    }

    #[test]
    fn tls_required_by_server_but_disabled_fails() {
        let mut n = negotiator(SecurityMode::Disabled);
        let required = "<stream:features>\
            <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
            </stream:features>";
        let err = n
            .on_element(&features(required), &TransportFlags::default())
            .unwrap_err();
        assert!(matches!(err, Error::SecurityForbidden));
    }

    #[test]
    fn tls_offer_is_ignored_when_security_disabled() {
        let mut n = negotiator(SecurityMode::Disabled);
        let step = n
            .on_element(&features(STARTTLS_FEATURES), &TransportFlags::default())
            .unwrap();
        assert!(matches!(step, Negotiation::Complete(_)));
    }

    #[test]
    fn tls_unavailable_and_required_fails() {
        let mut n = FeatureNegotiator::new(SecurityMode::Required, true, false, true);
        let err = n
            .on_element(&features(STARTTLS_FEATURES), &TransportFlags::default())
            .unwrap_err();
        assert!(matches!(err, Error::SecurityRequired(_)));
    }

    #[test]
    fn tls_comes_before_compression() {
        let both = "<stream:features>\
            <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>\
            <compression xmlns='http://jabber.org/protocol/compress'>\
            <method>zlib</method></compression></stream:features>";
        let mut n = negotiator(SecurityMode::Enabled);
        let step = n
            .on_element(&features(both), &TransportFlags::default())
            .unwrap();
        assert_eq!(step, Negotiation::SendStartTls);
    }

    #[test]
    fn compression_is_attempted_once_per_features() {
        let mut n = negotiator(SecurityMode::Enabled);
        let flags = TransportFlags::default();

        let step = n.on_element(&features(COMPRESSION_FEATURES), &flags).unwrap();
        assert_eq!(step, Negotiation::SendCompress);

        // The server rejects it; the same features must not yield another
        // <compress/> attempt.
        let failure = features("<failure xmlns='http://jabber.org/protocol/compress'/>");
        let step = n.on_element(&failure, &flags).unwrap();
        assert!(matches!(step, Negotiation::Complete(_)));
    }

    #[test]
    fn compressed_enables_the_codec() {
        let mut n = negotiator(SecurityMode::Enabled);
        let flags = TransportFlags::default();
        n.on_element(&features(COMPRESSION_FEATURES), &flags).unwrap();

        let compressed = features("<compressed xmlns='http://jabber.org/protocol/compress'/>");
        let step = n.on_element(&compressed, &flags).unwrap();
        assert_eq!(step, Negotiation::EnableCompression);
    }

    #[test]
    fn compression_skipped_when_tls_layer_compresses() {
        let mut n = negotiator(SecurityMode::Enabled);
        let flags = TransportFlags {
            using_tls: true,
            secure_verified: true,
            using_tls_compression: true,
            ..TransportFlags::default()
        };
        let step = n.on_element(&features(COMPRESSION_FEATURES), &flags).unwrap();
        assert!(matches!(step, Negotiation::Complete(_)));
    }

    #[test]
    fn tls_failure_is_fatal() {
        let mut n = negotiator(SecurityMode::Enabled);
        let failure = features("<failure xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        let err = n.on_element(&failure, &TransportFlags::default()).unwrap_err();
        assert!(matches!(err, Error::TlsHandshakeFailed(_)));
    }

    #[test]
    fn proceed_enables_tls() {
        let mut n = negotiator(SecurityMode::Enabled);
        let proceed = features("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        let step = n.on_element(&proceed, &TransportFlags::default()).unwrap();
        assert_eq!(step, Negotiation::EnableTls);
    }

    #[test]
    fn unknown_elements_are_consumed_silently() {
        let mut n = negotiator(SecurityMode::Enabled);
        let noise = features("<sm xmlns='urn:xmpp:sm:3'/>");
        let step = n.on_element(&noise, &TransportFlags::default()).unwrap();
        assert_eq!(step, Negotiation::Ignore);
    }

    #[test]
    fn plain_features_complete_immediately() {
        let mut n = negotiator(SecurityMode::Enabled);
        let step = n
            .on_element(&features(PLAIN_FEATURES), &TransportFlags::default())
            .unwrap();
        let Negotiation::Complete(f) = step else {
            panic!("expected completion, got {:?}", step);
        };
        assert!(f.child("mechanisms").is_some());
    }

    #[test]
    fn second_features_after_tls_reaches_completion() {
        // After the TLS restart the server advertises mechanisms only; the
        // negotiation must reach a fixed point and surface them.
        let mut n = negotiator(SecurityMode::Required);
        let flags = TransportFlags::default();
        assert_eq!(
            n.on_element(&features(STARTTLS_FEATURES), &flags).unwrap(),
            Negotiation::SendStartTls
        );

        let secured = TransportFlags {
            using_tls: true,
            secure_verified: true,
            ..TransportFlags::default()
        };
        let step = n.on_element(&features(PLAIN_FEATURES), &secured).unwrap();
        assert!(matches!(step, Negotiation::Complete(_)));
    }
}
