// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! HTTP/2 framing for the Gx/Gy/Rx-adjacent N-interfaces that ride HTTP/2
//! (5G service-based interfaces are out of this crate's protocol set, but
//! the generic frame boundary is shared infrastructure any HTTP/2-carried
//! correlation input would need). Recognises the 24-byte connection preface
//! once, then reads 9-byte frame headers whose first 3 bytes are the
//! payload length.

use super::Framer;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
const FRAME_HEADER_LEN: usize = 9;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct Http2Framer {
    buf: Vec<u8>,
    preface_consumed: bool,
}

impl Http2Framer {
    pub fn new() -> Self {
        Http2Framer::default()
    }
}

impl Framer for Http2Framer {
    fn process_data(&mut self, bytes: &[u8], on_message: &mut dyn FnMut(&[u8])) {
        self.buf.extend_from_slice(bytes);

        if !self.preface_consumed {
            if self.buf.len() < PREFACE.len() {
                return;
            }
            if self.buf.starts_with(PREFACE) {
                self.buf.drain(..PREFACE.len());
            }
            self.preface_consumed = true;
        }

        loop {
            if self.buf.len() < FRAME_HEADER_LEN {
                return;
            }
            let len =
                ((self.buf[0] as usize) << 16) | ((self.buf[1] as usize) << 8) | (self.buf[2] as usize);
            if len > MAX_FRAME_LEN {
                self.buf.clear();
                return;
            }
            let total = FRAME_HEADER_LEN + len;
            if self.buf.len() < total {
                return;
            }
            let frame = self.buf[..total].to_vec();
            on_message(&frame);
            self.buf.drain(..total);
        }
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.preface_consumed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_preface_and_frames_header() {
        let mut f = Http2Framer::new();
        let mut data = PREFACE.to_vec();
        data.extend_from_slice(&[0, 0, 0, 0x04, 0, 0, 0, 0, 0]); // empty SETTINGS frame
        let mut out = Vec::new();
        f.process_data(&data, &mut |m| out.push(m.to_vec()));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 9);
    }
}
