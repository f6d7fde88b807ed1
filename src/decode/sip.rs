// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SIP decoding: request/response line, mandatory headers, the 3GPP
//! P-header family, IMS/VoLTE extension headers, and an SDP body parser
//! with media sections and RFC 3312 QoS preconditions.

use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { status_code: u16, reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct ViaHeader {
    pub raw: String,
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MediaDescription {
    pub media: String,
    pub port: u16,
    pub proto: String,
    pub payload_types: Vec<u16>,
    pub connection_address: Option<String>,
    pub direction: Option<String>,
    pub codecs: Vec<(u16, String)>,
    pub bandwidth_kbps: Option<u32>,
    /// RFC 3312 `a=curr:`/`a=des:`/`a=conf:` precondition lines, raw.
    pub qos_preconditions: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SdpBody {
    pub session_connection_address: Option<String>,
    pub media: Vec<MediaDescription>,
}

#[derive(Debug, Clone)]
pub struct SipMessage {
    pub start_line: StartLine,
    headers: Vec<(String, String)>,
    pub body: Option<SdpBody>,
}

fn canonical_header_name(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    match lower.as_str() {
        "i" => "call-id",
        "f" => "from",
        "t" => "to",
        "v" => "via",
        "l" => "content-length",
        "m" => "contact",
        "k" => "supported",
        "s" => "subject",
        "c" => "content-type",
        "e" => "content-encoding",
        "o" => "event",
        "r" => "refer-to",
        "b" => "referred-by",
        other => return other.to_string(),
    }
    .to_string()
}

fn split_tagged(value: &str) -> (String, Option<String>) {
    // "Alice" <sip:alice@x.com>;tag=abc123
    let mut display = value.trim();
    let mut tag = None;
    for part in value.split(';').skip(1) {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("tag=") {
            tag = Some(t.trim().to_string());
        }
    }
    if let Some(semi) = display.find(';') {
        display = &display[..semi];
    }
    (display.trim().to_string(), tag)
}

impl SipMessage {
    pub fn parse(bytes: &[u8]) -> Result<SipMessage, DecodeError> {
        let header_end = bytes
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|p| p + 4)
            .ok_or(DecodeError::Malformed { what: "sip", reason: "no header terminator".into() })?;
        let header_block = std::str::from_utf8(&bytes[..header_end - 4])
            .map_err(|_| DecodeError::Malformed { what: "sip", reason: "non-utf8 headers".into() })?;
        let body_bytes = &bytes[header_end..];

        let mut lines = header_block.split("\r\n");
        let first = lines.next().ok_or(DecodeError::Malformed {
            what: "sip",
            reason: "missing start line".into(),
        })?;
        let start_line = parse_start_line(first)?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some(colon) = line.find(':') else { continue };
            let name = canonical_header_name(&line[..colon]);
            let value = line[colon + 1..].trim().to_string();
            headers.push((name, value));
        }

        let body = if body_bytes.is_empty() {
            None
        } else {
            std::str::from_utf8(body_bytes).ok().map(parse_sdp)
        };

        Ok(SipMessage { start_line, headers, body })
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers.iter().filter(|(k, _)| k == name).map(|(_, v)| v.as_str()).collect()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("call-id")
    }

    pub fn from_tag(&self) -> Option<String> {
        self.header("from").and_then(|v| split_tagged(v).1)
    }

    pub fn to_tag(&self) -> Option<String> {
        self.header("to").and_then(|v| split_tagged(v).1)
    }

    pub fn from_display(&self) -> Option<String> {
        self.header("from").map(|v| split_tagged(v).0)
    }

    pub fn to_display(&self) -> Option<String> {
        self.header("to").map(|v| split_tagged(v).0)
    }

    pub fn cseq(&self) -> Option<(u32, String)> {
        let v = self.header("cseq")?;
        let mut parts = v.split_whitespace();
        let number = parts.next()?.parse().ok()?;
        let method = parts.next()?.to_string();
        Some((number, method))
    }

    pub fn top_via_branch(&self) -> Option<String> {
        let via = self.header("via")?;
        via.split(';').find_map(|p| p.trim().strip_prefix("branch=")).map(str::to_string)
    }

    pub fn contact(&self) -> Option<&str> {
        self.header("contact")
    }

    pub fn expires(&self) -> Option<u32> {
        self.header("expires").and_then(|v| v.parse().ok())
    }

    pub fn p_asserted_identity(&self) -> Option<&str> {
        self.header("p-asserted-identity")
    }

    pub fn p_preferred_identity(&self) -> Option<&str> {
        self.header("p-preferred-identity")
    }

    pub fn p_charging_vector_icid(&self) -> Option<String> {
        let v = self.header("p-charging-vector")?;
        v.split(';').find_map(|p| p.trim().strip_prefix("icid-value=")).map(|s| s.trim_matches('"').to_string())
    }

    pub fn event(&self) -> Option<&str> {
        self.header("event")
    }

    pub fn subscription_state(&self) -> Option<&str> {
        self.header("subscription-state")
    }

    pub fn request_uri(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.start_line {
            StartLine::Response { status_code, .. } => Some(*status_code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason_phrase(&self) -> Option<&str> {
        match &self.start_line {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    pub fn all_via(&self) -> Vec<&str> {
        self.header_all("via")
    }
}

fn parse_start_line(line: &str) -> Result<StartLine, DecodeError> {
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let mut parts = rest.splitn(2, ' ');
        let code = parts.next().unwrap_or("");
        let reason = parts.next().unwrap_or("").to_string();
        let status_code = code.parse().map_err(|_| DecodeError::Malformed {
            what: "sip",
            reason: "bad status code".into(),
        })?;
        return Ok(StartLine::Response { status_code, reason });
    }
    let mut parts = line.splitn(3, ' ');
    let method = parts.next().ok_or(DecodeError::Malformed { what: "sip", reason: "empty start line".into() })?;
    let uri = parts.next().ok_or(DecodeError::Malformed { what: "sip", reason: "missing request-uri".into() })?;
    Ok(StartLine::Request { method: method.to_string(), uri: uri.to_string() })
}

fn parse_sdp(text: &str) -> SdpBody {
    let mut sdp = SdpBody::default();
    let mut current: Option<MediaDescription> = None;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        let Some((kind, value)) = line.split_once('=') else { continue };
        match kind {
            "c" => {
                // c=IN IP4 203.0.113.10
                let addr = value.split_whitespace().nth(2).map(str::to_string);
                if let Some(m) = current.as_mut() {
                    m.connection_address = addr;
                } else {
                    sdp.session_connection_address = addr;
                }
            },
            "m" => {
                if let Some(m) = current.take() {
                    sdp.media.push(m);
                }
                let mut parts = value.split_whitespace();
                let media = parts.next().unwrap_or("").to_string();
                let port = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                let proto = parts.next().unwrap_or("").to_string();
                let payload_types = parts.filter_map(|p| p.parse().ok()).collect();
                current = Some(MediaDescription { media, port, proto, payload_types, ..Default::default() });
            },
            "a" => {
                if let Some(m) = current.as_mut() {
                    if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
                        if let Some((pt, name)) = rtpmap.split_once(' ') {
                            if let Ok(pt) = pt.parse() {
                                m.codecs.push((pt, name.to_string()));
                            }
                        }
                    } else if value == "sendrecv"
                        || value == "sendonly"
                        || value == "recvonly"
                        || value == "inactive"
                    {
                        m.direction = Some(value.to_string());
                    } else if value.starts_with("curr:") || value.starts_with("des:") || value.starts_with("conf:")
                    {
                        m.qos_preconditions.push(value.to_string());
                    }
                }
            },
            "b" => {
                if let Some(m) = current.as_mut()
                    && let Some((_, kbps)) = value.split_once(':')
                {
                    m.bandwidth_kbps = kbps.parse().ok();
                }
            },
            _ => {},
        }
    }
    if let Some(m) = current.take() {
        sdp.media.push(m);
    }
    sdp
}

impl SdpBody {
    pub fn has_video(&self) -> bool {
        self.media.iter().any(|m| m.media == "video")
    }

    pub fn has_audio(&self) -> bool {
        self.media.iter().any(|m| m.media == "audio")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Vec<u8> {
        b"INVITE sip:bob@example.com SIP/2.0\r\n\
Call-ID: abc123@host\r\n\
From: \"Alice\" <sip:alice@example.com>;tag=1928301774\r\n\
To: <sip:bob@example.com>\r\n\
CSeq: 1 INVITE\r\n\
Via: SIP/2.0/UDP pc1.example.com;branch=z9hG4bK776asdhds\r\n\
P-Charging-Vector: icid-value=\"icid.1\"\r\n\
Content-Length: 0\r\n\r\n"
            .to_vec()
    }

    #[test]
    fn parses_request_line_and_headers() {
        let m = SipMessage::parse(&invite()).expect("parse");
        assert_eq!(m.method(), Some("INVITE"));
        assert_eq!(m.call_id(), Some("abc123@host"));
        assert_eq!(m.from_tag(), Some("1928301774".to_string()));
        assert_eq!(m.to_tag(), None);
        assert_eq!(m.cseq(), Some((1, "INVITE".to_string())));
        assert_eq!(m.top_via_branch(), Some("z9hG4bK776asdhds".to_string()));
        assert_eq!(m.p_charging_vector_icid(), Some("icid.1".to_string()));
    }

    #[test]
    fn parses_response_status_line() {
        let msg = b"SIP/2.0 486 Busy Here\r\nCall-ID: x\r\n\r\n";
        let m = SipMessage::parse(msg).expect("parse");
        assert_eq!(m.status_code(), Some(486));
        assert_eq!(m.reason_phrase(), Some("Busy Here"));
    }

    #[test]
    fn parses_sdp_media_sections() {
        let mut msg = b"INVITE sip:bob@x SIP/2.0\r\nCall-ID: c\r\nContent-Length: 10\r\n\r\n".to_vec();
        let sdp = b"v=0\r\no=- 1 1 IN IP4 1.1.1.1\r\nc=IN IP4 1.1.1.1\r\nm=audio 49170 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\n";
        msg.truncate(msg.len() - 2);
        msg.extend_from_slice(b"\r\n");
        msg.extend_from_slice(sdp);
        let m = SipMessage::parse(&msg).expect("parse");
        let sdp = m.body.expect("sdp");
        assert_eq!(sdp.media.len(), 1);
        assert!(sdp.has_audio());
        assert_eq!(sdp.media[0].codecs[0].1, "PCMU/8000");
    }
}
