// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! RTP header decoding (RFC 3550): version, SSRC, sequence number,
//! timestamp, payload type — the fields the VoLTE RTP leg needs for jitter,
//! loss, and MOS estimation.

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub rtp_timestamp: u32,
    pub ssrc: u32,
    pub payload_len: usize,
}

pub fn parse(bytes: &[u8]) -> Result<RtpPacket, DecodeError> {
    if bytes.len() < 12 {
        return Err(DecodeError::TooShort { need: 12, have: bytes.len() });
    }
    let version = (bytes[0] >> 6) & 0x03;
    let padding = bytes[0] & 0x20 != 0;
    let cc = (bytes[0] & 0x0F) as usize;
    let marker = bytes[1] & 0x80 != 0;
    let payload_type = bytes[1] & 0x7F;
    let sequence_number = u16::from_be_bytes([bytes[2], bytes[3]]);
    let rtp_timestamp = u32::from_be_bytes(bytes[4..8].try_into().unwrap_or_default());
    let ssrc = u32::from_be_bytes(bytes[8..12].try_into().unwrap_or_default());
    let header_len = 12 + cc * 4;
    if bytes.len() < header_len {
        return Err(DecodeError::TooShort { need: header_len, have: bytes.len() });
    }
    Ok(RtpPacket {
        version,
        padding,
        marker,
        payload_type,
        sequence_number,
        rtp_timestamp,
        ssrc,
        payload_len: bytes.len() - header_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_header() {
        let mut pkt = vec![0x80, 0x00, 0x00, 0x01];
        pkt.extend_from_slice(&160u32.to_be_bytes());
        pkt.extend_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        pkt.extend_from_slice(&[0u8; 160]);
        let r = parse(&pkt).expect("parse");
        assert_eq!(r.version, 2);
        assert_eq!(r.sequence_number, 1);
        assert_eq!(r.ssrc, 0xDEAD_BEEF);
        assert_eq!(r.payload_len, 160);
    }
}
