//! Minimal chat stanza model
//!
//! Presence, message and IQ payloads travel over the channels as serialized
//! XML. This module reads only what the transport needs: the root kind, the
//! addressing attributes, the type, and the `show`/`status`/`body` children.
//! Every other child element is kept verbatim so it survives a round trip.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{TransportError, TransportResult};
use crate::types::Jid;

/// Namespace of the marker element carried by room-join presences
pub const MUC_NAMESPACE: &str = "http://jabber.org/protocol/muc";

/// Namespace of delayed-delivery stamps
pub const DELAY_NAMESPACE: &str = "urn:xmpp:delay";

/// Root element of a stanza
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    fn element_name(self) -> &'static str {
        match self {
            StanzaKind::Message => "message",
            StanzaKind::Presence => "presence",
            StanzaKind::Iq => "iq",
        }
    }

    fn from_element_name(name: &[u8]) -> Option<Self> {
        match name {
            b"message" => Some(StanzaKind::Message),
            b"presence" => Some(StanzaKind::Presence),
            b"iq" => Some(StanzaKind::Iq),
            _ => None,
        }
    }
}

/// Availability classification of a presence stanza
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceType {
    /// No `type` attribute
    Available,
    Unavailable,
    Probe,
    /// subscribe, error, ...
    Other(String),
}

/// A parsed chat stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    pub kind: StanzaKind,
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub stanza_type: Option<String>,
    pub id: Option<String>,
    pub show: Option<String>,
    pub status: Option<String>,
    pub body: Option<String>,
    /// Raw XML of every other child element, in document order
    pub extensions: Vec<String>,
}

impl Stanza {
    /// Create an empty stanza of the given kind.
    pub fn new(kind: StanzaKind) -> Self {
        Self {
            kind,
            from: None,
            to: None,
            stanza_type: None,
            id: None,
            show: None,
            status: None,
            body: None,
            extensions: Vec::new(),
        }
    }

    /// Create an available presence.
    pub fn presence() -> Self {
        Self::new(StanzaKind::Presence)
    }

    /// Create a presence with the given `type`.
    pub fn presence_of_type(presence_type: &str) -> Self {
        Self::presence().with_type(presence_type)
    }

    pub fn with_from(mut self, from: Jid) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_type(mut self, stanza_type: impl Into<String>) -> Self {
        self.stanza_type = Some(stanza_type.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether this is a presence stanza.
    pub fn is_presence(&self) -> bool {
        self.kind == StanzaKind::Presence
    }

    /// Whether this is a message stanza.
    pub fn is_message(&self) -> bool {
        self.kind == StanzaKind::Message
    }

    /// Classify a presence by its `type` attribute.
    pub fn presence_type(&self) -> PresenceType {
        match self.stanza_type.as_deref() {
            None => PresenceType::Available,
            Some("unavailable") => PresenceType::Unavailable,
            Some("probe") => PresenceType::Probe,
            Some(other) => PresenceType::Other(other.to_string()),
        }
    }

    /// Available presences carry no `type` attribute.
    pub fn is_available(&self) -> bool {
        self.is_presence() && self.stanza_type.is_none()
    }

    pub fn is_probe(&self) -> bool {
        self.is_presence() && self.presence_type() == PresenceType::Probe
    }

    /// Whether a message is addressed to a room.
    pub fn is_groupchat(&self) -> bool {
        self.is_message() && self.stanza_type.as_deref() == Some("groupchat")
    }

    /// Append a raw child element.
    pub fn add_extension(&mut self, raw_xml: impl Into<String>) {
        self.extensions.push(raw_xml.into());
    }

    /// Append the `<x xmlns="http://jabber.org/protocol/muc"/>` room marker.
    pub fn add_muc_marker(&mut self) {
        self.add_extension(format!("<x xmlns=\"{}\"/>", MUC_NAMESPACE));
    }

    /// Whether the room marker element is present.
    pub fn has_muc_marker(&self) -> bool {
        self.extensions
            .iter()
            .any(|ext| ext.starts_with("<x") && ext.contains(MUC_NAMESPACE))
    }

    /// Append a delayed-delivery stamp for a payload produced at `timestamp_ms`.
    pub fn add_delay(&mut self, timestamp_ms: i64, from: Option<&Jid>, reason: &str) {
        let stamp = chrono::DateTime::from_timestamp_millis(timestamp_ms)
            .unwrap_or_default()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let from_attr = from
            .map(|jid| format!(" from=\"{}\"", escape(jid.as_str())))
            .unwrap_or_default();
        self.add_extension(format!(
            "<delay xmlns=\"{}\"{} stamp=\"{}\">{}</delay>",
            DELAY_NAMESPACE,
            from_attr,
            stamp,
            escape(reason)
        ));
    }

    /// Whether a delayed-delivery stamp is attached.
    pub fn has_delay(&self) -> bool {
        self.extensions
            .iter()
            .any(|ext| ext.starts_with("<delay") && ext.contains(DELAY_NAMESPACE))
    }

    /// Serialize to XML.
    ///
    /// Attributes and children are written in a fixed order, so two equal
    /// stanzas always produce the same bytes.
    pub fn to_xml(&self) -> String {
        let name = self.kind.element_name();
        let mut out = String::with_capacity(128);
        out.push('<');
        out.push_str(name);
        push_attr(&mut out, "from", self.from.as_ref().map(Jid::as_str));
        push_attr(&mut out, "to", self.to.as_ref().map(Jid::as_str));
        push_attr(&mut out, "type", self.stanza_type.as_deref());
        push_attr(&mut out, "id", self.id.as_deref());

        let has_children = self.show.is_some()
            || self.status.is_some()
            || self.body.is_some()
            || !self.extensions.is_empty();
        if !has_children {
            out.push_str("/>");
            return out;
        }
        out.push('>');
        push_text_child(&mut out, "show", self.show.as_deref());
        push_text_child(&mut out, "status", self.status.as_deref());
        push_text_child(&mut out, "body", self.body.as_deref());
        for ext in &self.extensions {
            out.push_str(ext);
        }
        out.push_str("</");
        out.push_str(name);
        out.push('>');
        out
    }

    /// Parse a stanza from XML.
    pub fn from_xml(xml: &str) -> TransportResult<Self> {
        // Text is kept verbatim. Whitespace between child elements arrives
        // as Text events outside any text child and is skipped below.
        let mut reader = Reader::from_str(xml);

        let (mut stanza, self_closing) = loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(start) => break (root_from(&start)?, false),
                Event::Empty(start) => break (root_from(&start)?, true),
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => continue,
                Event::Text(_) => continue,
                Event::Eof => return Err(TransportError::Stanza("empty document".to_string())),
                other => {
                    return Err(TransportError::Stanza(format!(
                        "unexpected content before root: {:?}",
                        other
                    )))
                }
            }
        };
        if self_closing {
            return Ok(stanza);
        }

        loop {
            let before = reader.buffer_position();
            match reader.read_event().map_err(xml_err)? {
                Event::Start(child) => {
                    let local = child.local_name();
                    match local.as_ref() {
                        b"show" => stanza.show = Some(read_text(&mut reader, &child)?),
                        b"status" => stanza.status = Some(read_text(&mut reader, &child)?),
                        b"body" => stanza.body = Some(read_text(&mut reader, &child)?),
                        _ => {
                            reader.read_to_end(child.name()).map_err(xml_err)?;
                            let raw = &xml[before..reader.buffer_position()];
                            stanza.extensions.push(raw.trim().to_string());
                        }
                    }
                }
                Event::Empty(child) => match child.local_name().as_ref() {
                    b"show" => stanza.show = Some(String::new()),
                    b"status" => stanza.status = Some(String::new()),
                    b"body" => stanza.body = Some(String::new()),
                    _ => {
                        let raw = &xml[before..reader.buffer_position()];
                        stanza.extensions.push(raw.trim().to_string());
                    }
                },
                Event::End(_) => break,
                Event::Eof => {
                    return Err(TransportError::Stanza("unterminated stanza".to_string()))
                }
                _ => continue,
            }
        }
        Ok(stanza)
    }
}

fn root_from(start: &BytesStart<'_>) -> TransportResult<Stanza> {
    let kind = StanzaKind::from_element_name(start.local_name().as_ref()).ok_or_else(|| {
        TransportError::Stanza(format!(
            "unsupported root element {}",
            String::from_utf8_lossy(start.name().as_ref())
        ))
    })?;
    let mut stanza = Stanza::new(kind);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| TransportError::Stanza(format!("bad attribute: {}", e)))?;
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        match attr.key.as_ref() {
            b"from" => stanza.from = Some(Jid::parse(&value)?),
            b"to" => stanza.to = Some(Jid::parse(&value)?),
            b"type" => stanza.stanza_type = Some(value),
            b"id" => stanza.id = Some(value),
            _ => {}
        }
    }
    Ok(stanza)
}

fn read_text(reader: &mut Reader<&[u8]>, start: &BytesStart<'_>) -> TransportResult<String> {
    let mut text = String::new();
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Text(t) => text.push_str(&t.unescape().map_err(xml_err)?),
            Event::CData(c) => text.push_str(&String::from_utf8_lossy(&c)),
            Event::End(end) if end.name() == start.name() => return Ok(text),
            Event::Eof => {
                return Err(TransportError::Stanza(format!(
                    "unterminated <{}>",
                    String::from_utf8_lossy(start.name().as_ref())
                )))
            }
            _ => continue,
        }
    }
}

fn push_attr(out: &mut String, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape(value));
        out.push('"');
    }
}

fn push_text_child(out: &mut String, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        out.push('<');
        out.push_str(name);
        out.push('>');
        out.push_str(&escape(value));
        out.push_str("</");
        out.push_str(name);
        out.push('>');
    }
}

fn xml_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Stanza(e.to_string())
}
