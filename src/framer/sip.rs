// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SIP framing: find `CRLF CRLF`, read `Content-Length` from the headers,
//! declare the message complete once `headers + content_length` bytes are
//! present.

use tracing::warn;

use super::Framer;

const MAX_HEADER_SEARCH: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct SipFramer {
    buf: Vec<u8>,
}

impl SipFramer {
    pub fn new() -> Self {
        SipFramer::default()
    }

    /// Case-insensitive header line search for `Content-Length` or its
    /// compact form `l`. Returns the declared length, defaulting to 0 if the
    /// header is absent (SIP permits a bodyless message with no
    /// Content-Length on unreliable transports only, but reassembled TCP
    /// streams are reliable so an absent header means "no body").
    fn content_length(headers: &[u8]) -> usize {
        for line in headers.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let Some(colon) = line.iter().position(|&b| b == b':') else { continue };
            let name = &line[..colon];
            let is_cl = name.eq_ignore_ascii_case(b"Content-Length") || name.eq_ignore_ascii_case(b"l");
            if !is_cl {
                continue;
            }
            let value = &line[colon + 1..];
            let value = std::str::from_utf8(value).unwrap_or("").trim();
            if let Ok(n) = value.parse::<usize>() {
                return n;
            }
        }
        0
    }

    fn find_header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }
}

impl Framer for SipFramer {
    fn process_data(&mut self, bytes: &[u8], on_message: &mut dyn FnMut(&[u8])) {
        self.buf.extend_from_slice(bytes);
        loop {
            let Some(header_end) = Self::find_header_end(&self.buf) else {
                if self.buf.len() > MAX_HEADER_SEARCH {
                    warn!(
                        len = self.buf.len(),
                        "sip framer: no CRLFCRLF within 64KiB, abandoning buffer"
                    );
                    self.buf.clear();
                }
                return;
            };
            let content_length = Self::content_length(&self.buf[..header_end]);
            let total = header_end + content_length;
            if self.buf.len() < total {
                return;
            }
            let message = self.buf[..total].to_vec();
            on_message(&message);
            self.buf.drain(..total);
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_one_message_with_body() {
        let mut f = SipFramer::new();
        let msg = b"INVITE sip:bob@example.com SIP/2.0\r\nContent-Length: 5\r\n\r\nhello";
        let mut out = Vec::new();
        f.process_data(msg, &mut |m| out.push(m.to_vec()));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0], msg.to_vec());
    }

    #[test]
    fn compact_content_length_header() {
        let mut f = SipFramer::new();
        let msg = b"BYE sip:bob@example.com SIP/2.0\r\nl: 2\r\n\r\nhi";
        let mut out = Vec::new();
        f.process_data(msg, &mut |m| out.push(m.to_vec()));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn partial_then_complete() {
        let mut f = SipFramer::new();
        let mut out = Vec::new();
        f.process_data(b"OPTIONS sip:x SIP/2.0\r\nContent-Leng", &mut |m| out.push(m.to_vec()));
        assert!(out.is_empty());
        f.process_data(b"th: 0\r\n\r\n", &mut |m| out.push(m.to_vec()));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn overflow_abandons_buffer() {
        let mut f = SipFramer::new();
        let mut out = Vec::new();
        let junk = vec![b'x'; MAX_HEADER_SEARCH + 1];
        f.process_data(&junk, &mut |m| out.push(m.to_vec()));
        assert!(out.is_empty());
        assert!(f.buf.is_empty());
    }
}
