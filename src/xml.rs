//! XML plumbing for the stream: an owned element tree, stanza boundary
//! extraction from a raw byte stream, and the stream header helpers.
//!
//! Extraction works the way the wire does: bytes accumulate in a buffer and
//! `next_frame` re-scans for one complete top-level element at a time. An
//! incomplete tail is simply left in place for the next read. The
//! `<stream:stream>` opening is special — it never closes, so it is returned
//! as a frame of its own the moment its start tag is complete.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::ResolveResult;
use quick_xml::{NsReader, Reader};
use tracing::debug;

use crate::error::Error;

pub(crate) mod ns {
    pub const STREAMS: &str = "http://etherx.jabber.org/streams";
    pub const CLIENT: &str = "jabber:client";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const COMPRESS: &str = "http://jabber.org/protocol/compress";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
}

/// Maximum allowed size for the stanza extraction buffer.
///
/// If the buffer exceeds this limit without yielding a complete stanza, the
/// connection is closed. Typical stanzas are a few KB; the largest legitimate
/// ones (vCard avatars, history pages) rarely exceed 100 KB.
const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

/// An XML element with its namespace, attributes, text and child elements.
/// Attribute order is irrelevant; child order is document order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub(crate) name: String,
    pub(crate) namespace: Option<String>,
    pub(crate) attributes: Vec<(String, String)>,
    pub(crate) children: Vec<Element>,
    pub(crate) text: String,
}

impl Element {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Direct text content of this element (children excluded).
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    /// First child with the given local name, any namespace.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// True if this element has the given local name and namespace.
    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace.as_deref() == Some(namespace)
    }

    /// The stand-in `<features/>` for pre-1.0 servers that never send one.
    pub(crate) fn legacy_features() -> Element {
        Element {
            name: "features".to_string(),
            namespace: Some(ns::STREAMS.to_string()),
            ..Element::default()
        }
    }
}

/// One top-level unit produced by the extractor.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    /// The `<stream:stream>` opening tag, attributes only. Exactly once per
    /// stream (and once more after each stream restart).
    StreamHeader(Element),
    /// A complete depth-1 child of the stream.
    Stanza(Element),
    /// `</stream:stream>` — the server is closing the stream.
    StreamEnd,
}

/// Stanza boundary extraction over an accumulated byte buffer.
pub(crate) struct StanzaExtractor {
    buffer: Vec<u8>,
}

impl StanzaExtractor {
    pub(crate) fn new() -> Self {
        StanzaExtractor { buffer: Vec::new() }
    }

    /// Append raw stream bytes. Fails when the buffer grows past the cap
    /// without ever forming a complete stanza.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
            return Err(Error::ProtocolError(format!(
                "stanza buffer exceeded {} bytes without a complete stanza",
                MAX_STANZA_BUFFER_SIZE
            )));
        }
        Ok(())
    }

    /// Discard buffered state for a stream restart. Bytes still in the buffer
    /// belong to the stream that is being torn down.
    pub(crate) fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!(
                bytes = self.buffer.len(),
                "discarding buffered stream data on reset"
            );
        }
        self.buffer.clear();
    }

    /// Extract the next complete frame, or `None` if more bytes are needed.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, Error> {
        match scan(&self.buffer)? {
            Some((raw, consumed)) => {
                let frame = match raw {
                    Scan::Header(start, end) => Frame::StreamHeader(parse_stream_header(
                        text_slice(&self.buffer, start, end)?,
                    )?),
                    Scan::Stanza(start, end) => {
                        Frame::Stanza(parse_element(text_slice(&self.buffer, start, end)?)?)
                    }
                    Scan::End => Frame::StreamEnd,
                };
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

enum Scan {
    Header(usize, usize),
    Stanza(usize, usize),
    End,
}

fn text_slice(buffer: &[u8], start: usize, end: usize) -> Result<&str, Error> {
    std::str::from_utf8(&buffer[start..end])
        .map_err(|e| Error::ProtocolError(format!("stream is not valid UTF-8: {}", e)))
}

/// Locate one complete top-level unit in `buffer`. Returns the unit and the
/// number of bytes consumed, or `None` when the buffer holds only a partial
/// unit.
fn scan(buffer: &[u8]) -> Result<Option<(Scan, usize)>, Error> {
    // The stream closing tag appears alone, without a matching opening tag
    // in the buffer.
    if let Some(start) = buffer
        .iter()
        .position(|&b| b != b' ' && b != b'\t' && b != b'\n' && b != b'\r')
    {
        if buffer[start..].starts_with(b"</stream:stream>") {
            return Ok(Some((Scan::End, start + b"</stream:stream>".len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut in_stanza = false;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
            | Ok(Event::DocType(_)) => continue,
            Ok(Event::Start(e)) => {
                if !in_stanza && is_stream_name(&e) {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Scan::Header(0, tag_end), tag_end)));
                }

                depth += 1;
                if !in_stanza && depth == 1 {
                    in_stanza = true;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if !in_stanza && is_stream_name(&e) {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Scan::Header(0, tag_end), tag_end)));
                }

                // Self-closing top-level stanza, e.g. <proceed/>.
                if !in_stanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Scan::Stanza(pos, tag_end), tag_end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {
                // Interstitial whitespace and keepalives between stanzas.
            }
            Ok(Event::End(e)) => {
                if depth == 0 && e.local_name().as_ref() == b"stream" {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Scan::End, tag_end)));
                }

                depth = depth.saturating_sub(1);
                if in_stanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Scan::Stanza(stanza_start, tag_end), tag_end)));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // The buffer ends mid-tag; the rest is coming.
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(e) => {
                return Err(Error::ProtocolError(format!("malformed XML: {}", e)));
            }
        }
    }
}

fn is_stream_name(e: &BytesStart<'_>) -> bool {
    e.local_name().as_ref() == b"stream" || e.name().as_ref() == b"stream:stream"
}

/// Parse one complete element (with its end tag) into a tree.
pub(crate) fn parse_element(xml: &str) -> Result<Element, Error> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;
    reader.config_mut().expand_empty_elements = true;

    let mut stack: Vec<Element> = Vec::new();
    loop {
        match reader.read_resolved_event() {
            Ok((resolution, Event::Start(e))) => {
                stack.push(element_from_start(resolution, &e, false)?);
            }
            Ok((_, Event::End(_))) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| Error::ProtocolError("unbalanced end tag".to_string()))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(el),
                    None => return Ok(el),
                }
            }
            Ok((_, Event::Text(t))) => {
                if let Some(el) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::ProtocolError(format!("bad text content: {}", e)))?;
                    el.text.push_str(&text);
                }
            }
            Ok((_, Event::CData(t))) => {
                if let Some(el) = stack.last_mut() {
                    el.text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Ok((_, Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_))) => {}
            Ok((_, Event::Empty(_))) => unreachable!("empty elements are expanded"),
            Ok((_, Event::Eof)) => {
                return Err(Error::ProtocolError("truncated element".to_string()))
            }
            Err(e) => return Err(Error::ProtocolError(format!("malformed XML: {}", e))),
        }
    }
}

/// Parse the attributes of a `<stream:stream>` opening tag. Unlike stanzas,
/// xmlns declarations are kept so the caller can validate the default
/// namespace.
pub(crate) fn parse_stream_header(xml: &str) -> Result<Element, Error> {
    let mut reader = NsReader::from_str(xml);
    reader.config_mut().check_end_names = false;

    loop {
        match reader.read_resolved_event() {
            Ok((resolution, Event::Start(e))) | Ok((resolution, Event::Empty(e))) => {
                return element_from_start(resolution, &e, true);
            }
            Ok((_, Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::Text(_))) => {}
            Ok((_, Event::Eof)) => {
                return Err(Error::ProtocolError("truncated stream header".to_string()))
            }
            Ok(_) => {
                return Err(Error::ProtocolError(
                    "expected stream header start tag".to_string(),
                ))
            }
            Err(e) => return Err(Error::ProtocolError(format!("malformed XML: {}", e))),
        }
    }
}

fn element_from_start(
    resolution: ResolveResult<'_>,
    e: &BytesStart<'_>,
    keep_xmlns: bool,
) -> Result<Element, Error> {
    let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
    let namespace = match resolution {
        ResolveResult::Bound(namespace) => {
            Some(String::from_utf8_lossy(namespace.as_ref()).into_owned())
        }
        ResolveResult::Unbound => None,
        // Stanzas are parsed standalone, outside the stream envelope that
        // declares the stream prefix; resolve it by hand.
        ResolveResult::Unknown(prefix) if prefix == b"stream" => Some(ns::STREAMS.to_string()),
        ResolveResult::Unknown(_) => None,
    };

    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::ProtocolError(format!("bad attribute: {}", e)))?;
        let key = attr.key.as_ref();
        if !keep_xmlns && (key == b"xmlns" || key.starts_with(b"xmlns:")) {
            continue;
        }
        let value = attr
            .unescape_value()
            .map_err(|e| Error::ProtocolError(format!("bad attribute value: {}", e)))?;
        attributes.push((
            String::from_utf8_lossy(key).into_owned(),
            value.into_owned(),
        ));
    }

    Ok(Element {
        name,
        namespace,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

/// The exact stream opening envelope.
pub(crate) fn open_stream_tag(service_name: &str) -> String {
    format!(
        "<stream:stream to=\"{}\" xmlns=\"jabber:client\" \
         xmlns:stream=\"http://etherx.jabber.org/streams\" version=\"1.0\">",
        quick_xml::escape::escape(service_name)
    )
}

/// Parse the stream header `version` attribute into `100 * major + minor`.
/// The attribute is only present for version 1.0 and higher; absent means a
/// pre-1.0 server and parses as 90.
pub(crate) fn parse_version(version: Option<&str>) -> Result<u32, Error> {
    let Some(v) = version else { return Ok(90) };

    let (major_part, minor_part) = match v.split_once('.') {
        Some((major, minor)) => (major, minor),
        None => (v, ""),
    };

    let valid = !major_part.is_empty()
        && major_part.bytes().all(|b| b.is_ascii_digit())
        && minor_part.bytes().all(|b| b.is_ascii_digit());
    if !valid {
        return Err(Error::ProtocolError(format!(
            "invalid version string from server: {:?}",
            v
        )));
    }

    let major: u32 = major_part
        .parse()
        .map_err(|_| Error::ProtocolError(format!("invalid version string from server: {:?}", v)))?;
    let minor: u32 = if minor_part.is_empty() {
        0
    } else {
        minor_part.parse().map_err(|_| {
            Error::ProtocolError(format!("invalid version string from server: {:?}", v))
        })?
    };

    Ok(major * 100 + minor % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract_all(input: &[u8]) -> Vec<Frame> {
        let mut extractor = StanzaExtractor::new();
        extractor.feed(input).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = extractor.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    // --- extractor ---

    #[test]
    fn extracts_stream_header() {
        let frames = extract_all(
            b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
              xmlns:stream='http://etherx.jabber.org/streams' id='c1' version='1.0'>",
        );
        assert_eq!(frames.len(), 1);
        let Frame::StreamHeader(header) = &frames[0] else {
            panic!("expected header, got {:?}", frames[0]);
        };
        assert_eq!(header.name(), "stream");
        assert_eq!(header.namespace(), Some(ns::STREAMS));
        assert_eq!(header.attr("id"), Some("c1"));
        assert_eq!(header.attr("version"), Some("1.0"));
        assert_eq!(header.attr("xmlns"), Some("jabber:client"));
    }

    #[test]
    fn extracts_header_then_features_in_order() {
        let frames = extract_all(
            b"<stream:stream xmlns='jabber:client' \
              xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>\
              <stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>\
              </stream:features><iq type='get'/>",
        );
        assert_eq!(frames.len(), 3);
        assert!(matches!(&frames[0], Frame::StreamHeader(_)));
        let Frame::Stanza(features) = &frames[1] else {
            panic!("expected stanza");
        };
        assert_eq!(features.name(), "features");
        assert_eq!(features.namespace(), Some(ns::STREAMS));
        let starttls = features.child("starttls").unwrap();
        assert_eq!(starttls.namespace(), Some(ns::TLS));
        let Frame::Stanza(iq) = &frames[2] else {
            panic!("expected stanza");
        };
        assert_eq!(iq.name(), "iq");
    }

    #[test]
    fn incomplete_stanza_waits_for_more_bytes() {
        let mut extractor = StanzaExtractor::new();
        extractor.feed(b"<iq type='set'><bind xmlns='urn:ietf").unwrap();
        assert!(extractor.next_frame().unwrap().is_none());

        extractor
            .feed(b":params:xml:ns:xmpp-bind'/></iq>")
            .unwrap();
        let frame = extractor.next_frame().unwrap().unwrap();
        let Frame::Stanza(iq) = frame else {
            panic!("expected stanza");
        };
        assert_eq!(iq.name(), "iq");
        assert_eq!(iq.child("bind").unwrap().namespace(), Some(ns::BIND));
    }

    #[test]
    fn whitespace_between_stanzas_is_skipped() {
        let frames = extract_all(b"<presence/> \n\t <message><body>hi</body></message>");
        assert_eq!(frames.len(), 2);
        let Frame::Stanza(message) = &frames[1] else {
            panic!("expected stanza");
        };
        assert_eq!(message.child("body").unwrap().text(), "hi");
    }

    #[test]
    fn whitespace_only_buffer_yields_nothing() {
        let mut extractor = StanzaExtractor::new();
        extractor.feed(b"   \n ").unwrap();
        assert!(extractor.next_frame().unwrap().is_none());
    }

    #[test]
    fn stream_end_is_reported() {
        let frames = extract_all(b"<presence/></stream:stream>");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], Frame::StreamEnd);
    }

    #[test]
    fn stream_end_alone_is_reported() {
        let frames = extract_all(b" </stream:stream>");
        assert_eq!(frames, vec![Frame::StreamEnd]);
    }

    #[test]
    fn buffer_cap_is_enforced() {
        let mut extractor = StanzaExtractor::new();
        extractor.feed(b"<message><body>").unwrap();
        let filler = vec![b'a'; MAX_STANZA_BUFFER_SIZE];
        assert!(matches!(
            extractor.feed(&filler),
            Err(Error::ProtocolError(_))
        ));
    }

    #[test]
    fn reset_discards_buffered_bytes() {
        let mut extractor = StanzaExtractor::new();
        extractor.feed(b"<iq type='set'><bind").unwrap();
        extractor.reset();
        extractor.feed(b"<presence/>").unwrap();
        let frame = extractor.next_frame().unwrap().unwrap();
        assert!(matches!(frame, Frame::Stanza(el) if el.name() == "presence"));
    }

    // --- element parsing ---

    #[test]
    fn parses_nested_elements_with_namespaces_and_text() {
        let el = parse_element(
            "<iq id='b1' type='result'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>alice@example.com/phone</jid></bind></iq>",
        )
        .unwrap();
        assert_eq!(el.name(), "iq");
        assert_eq!(el.attr("id"), Some("b1"));
        let bind = el.child("bind").unwrap();
        assert!(bind.is("bind", ns::BIND));
        assert_eq!(bind.child("jid").unwrap().text(), "alice@example.com/phone");
    }

    #[test]
    fn attribute_and_text_entities_are_unescaped() {
        let el = parse_element("<message from='a&amp;b'><body>x &lt; y</body></message>").unwrap();
        assert_eq!(el.attr("from"), Some("a&b"));
        assert_eq!(el.child("body").unwrap().text(), "x < y");
    }

    #[test]
    fn stream_prefixed_element_resolves_to_streams_namespace() {
        let el = parse_element("<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>")
            .unwrap();
        assert!(el.is("features", ns::STREAMS));
    }

    #[test]
    fn truncated_element_is_an_error() {
        assert!(parse_element("<iq><bind>").is_err());
    }

    // --- stream open tag ---

    #[test]
    fn open_tag_is_the_exact_literal() {
        assert_eq!(
            open_stream_tag("example.com"),
            "<stream:stream to=\"example.com\" xmlns=\"jabber:client\" \
             xmlns:stream=\"http://etherx.jabber.org/streams\" version=\"1.0\">"
        );
    }

    // --- version parsing ---

    #[test]
    fn version_parses_to_major_times_100_plus_minor() {
        assert_eq!(parse_version(Some("1.0")).unwrap(), 100);
        assert_eq!(parse_version(Some("1.5")).unwrap(), 105);
        assert_eq!(parse_version(Some("2.99")).unwrap(), 299);
        assert_eq!(parse_version(Some("0.9")).unwrap(), 9);
        assert_eq!(parse_version(Some("1")).unwrap(), 100);
        assert_eq!(parse_version(Some("1.")).unwrap(), 100);
    }

    #[test]
    fn missing_version_parses_as_90() {
        assert_eq!(parse_version(None).unwrap(), 90);
    }

    #[test]
    fn malformed_versions_are_protocol_errors() {
        for bad in ["abc", "1.x", "", ".5", "1.0.0", "-1.0"] {
            assert!(
                matches!(parse_version(Some(bad)), Err(Error::ProtocolError(_))),
                "expected error for {:?}",
                bad
            );
        }
    }

    #[test]
    fn legacy_features_element_is_in_streams_namespace() {
        let el = Element::legacy_features();
        assert!(el.is("features", ns::STREAMS));
        assert!(el.children().is_empty());
    }
}
