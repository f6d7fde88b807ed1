// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! DIAMETER base protocol decoding (RFC 6733): 20-byte header, AVP walk with
//! 4-byte alignment padding and vendor-flag presence, grouped-AVP recursion,
//! and typed accessors. Application projections (Cx/Sh/Gx/Rx/Gy/S6a) live in
//! `apps`.

pub mod apps;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bitflags::bitflags;

use crate::error::DecodeError;

pub const HEADER_LEN: usize = 20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DiameterHeaderFlags: u8 {
        const REQUEST = 0x80;
        const PROXIABLE = 0x40;
        const ERROR = 0x20;
        const RETRANSMIT = 0x10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AvpFlags: u8 {
        const VENDOR = 0x80;
        const MANDATORY = 0x40;
        const PROTECTED = 0x20;
    }
}

#[derive(Debug, Clone)]
pub struct Avp {
    pub code: u32,
    pub flags: AvpFlags,
    pub vendor_id: Option<u32>,
    pub data: Vec<u8>,
}

impl Avp {
    pub fn as_u32(&self) -> Option<u32> {
        (self.data.len() >= 4).then(|| u32::from_be_bytes(self.data[..4].try_into().unwrap_or_default()))
    }

    pub fn as_u64(&self) -> Option<u64> {
        (self.data.len() >= 8).then(|| u64::from_be_bytes(self.data[..8].try_into().unwrap_or_default()))
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Address AVP format per RFC 6733 §4.3.1: 2-byte address family, then
    /// the address bytes (4 for IPv4, 16 for IPv6).
    pub fn as_address(&self) -> Option<IpAddr> {
        if self.data.len() < 2 {
            return None;
        }
        let family = u16::from_be_bytes([self.data[0], self.data[1]]);
        match family {
            1 if self.data.len() >= 6 => {
                Some(IpAddr::V4(Ipv4Addr::new(self.data[2], self.data[3], self.data[4], self.data[5])))
            },
            2 if self.data.len() >= 18 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.data[2..18]);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            },
            _ => None,
        }
    }

    /// Framed-IPv6-Prefix AVP format: 1 byte reserved, 1 byte prefix length,
    /// then up to 16 bytes of prefix.
    pub fn as_ipv6_prefix(&self) -> Option<IpAddr> {
        if self.data.len() < 2 {
            return None;
        }
        let mut octets = [0u8; 16];
        let avail = (self.data.len() - 2).min(16);
        octets[..avail].copy_from_slice(&self.data[2..2 + avail]);
        Some(IpAddr::V6(Ipv6Addr::from(octets)))
    }

    /// Walks this AVP's data as a grouped AVP.
    pub fn grouped(&self) -> Vec<Avp> {
        parse_avps(&self.data).unwrap_or_default()
    }

    pub fn find<'a>(avps: &'a [Avp], code: u32) -> Option<&'a Avp> {
        avps.iter().find(|a| a.code == code)
    }

    pub fn find_all<'a>(avps: &'a [Avp], code: u32) -> Vec<&'a Avp> {
        avps.iter().filter(|a| a.code == code).collect()
    }
}

#[derive(Debug, Clone)]
pub struct DiameterMessage {
    pub version: u8,
    pub flags: DiameterHeaderFlags,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
    pub avps: Vec<Avp>,
}

impl DiameterMessage {
    pub fn is_request(&self) -> bool {
        self.flags.contains(DiameterHeaderFlags::REQUEST)
    }

    pub fn session_id(&self) -> Option<String> {
        Avp::find(&self.avps, AVP_SESSION_ID).and_then(|a| a.as_str()).map(str::to_string)
    }

    pub fn result_code(&self) -> Option<u32> {
        if let Some(a) = Avp::find(&self.avps, AVP_RESULT_CODE) {
            return a.as_u32();
        }
        Avp::find(&self.avps, AVP_EXPERIMENTAL_RESULT)
            .and_then(|a| Avp::find(&a.grouped(), AVP_EXPERIMENTAL_RESULT_CODE))
            .and_then(|a| a.as_u32())
    }

    pub fn is_error_result(&self) -> bool {
        match self.result_code() {
            Some(code) => !(2000..=2999).contains(&code),
            None => false,
        }
    }
}

pub const AVP_SESSION_ID: u32 = 263;
pub const AVP_RESULT_CODE: u32 = 268;
pub const AVP_EXPERIMENTAL_RESULT: u32 = 297;
pub const AVP_EXPERIMENTAL_RESULT_CODE: u32 = 298;

pub fn parse(bytes: &[u8]) -> Result<DiameterMessage, DecodeError> {
    if bytes.len() < HEADER_LEN {
        return Err(DecodeError::TooShort { need: HEADER_LEN, have: bytes.len() });
    }
    let version = bytes[0];
    let length = ((bytes[1] as usize) << 16) | ((bytes[2] as usize) << 8) | bytes[3] as usize;
    if length < HEADER_LEN || length > bytes.len() {
        return Err(DecodeError::LengthMismatch { declared: length, available: bytes.len() });
    }
    let flags = DiameterHeaderFlags::from_bits_truncate(bytes[4]);
    let command_code = ((bytes[5] as u32) << 16) | ((bytes[6] as u32) << 8) | bytes[7] as u32;
    let application_id = u32::from_be_bytes(bytes[8..12].try_into().unwrap_or_default());
    let hop_by_hop_id = u32::from_be_bytes(bytes[12..16].try_into().unwrap_or_default());
    let end_to_end_id = u32::from_be_bytes(bytes[16..20].try_into().unwrap_or_default());

    let avps = parse_avps(&bytes[HEADER_LEN..length])?;

    Ok(DiameterMessage { version, flags, command_code, application_id, hop_by_hop_id, end_to_end_id, avps })
}

fn parse_avps(mut buf: &[u8]) -> Result<Vec<Avp>, DecodeError> {
    let mut avps = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 8 {
            return Err(DecodeError::TooShort { need: 8, have: buf.len() });
        }
        let code = u32::from_be_bytes(buf[0..4].try_into().unwrap_or_default());
        let flags = AvpFlags::from_bits_truncate(buf[4]);
        let avp_len = ((buf[5] as usize) << 16) | ((buf[6] as usize) << 8) | buf[7] as usize;
        if avp_len < 8 || avp_len > buf.len() {
            return Err(DecodeError::LengthMismatch { declared: avp_len, available: buf.len() });
        }
        let (vendor_id, data_start) = if flags.contains(AvpFlags::VENDOR) {
            if avp_len < 12 {
                return Err(DecodeError::TooShort { need: 12, have: avp_len });
            }
            (Some(u32::from_be_bytes(buf[8..12].try_into().unwrap_or_default())), 12)
        } else {
            (None, 8)
        };
        let data = buf[data_start..avp_len].to_vec();
        let padded_len = avp_len.div_ceil(4) * 4;
        avps.push(Avp { code, flags, vendor_id, data });
        buf = &buf[padded_len.min(buf.len())..];
    }
    Ok(avps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avp(code: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&code.to_be_bytes());
        out.push(0x40); // Mandatory
        let len = 8 + data.len();
        out.push(((len >> 16) & 0xff) as u8);
        out.push(((len >> 8) & 0xff) as u8);
        out.push((len & 0xff) as u8);
        out.extend_from_slice(data);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        out
    }

    fn header(app_id: u32, flags: u8, body_len: usize) -> Vec<u8> {
        let total = HEADER_LEN + body_len;
        let mut h = vec![1u8, ((total >> 16) & 0xff) as u8, ((total >> 8) & 0xff) as u8, (total & 0xff) as u8];
        h.push(flags);
        h.extend_from_slice(&[0, 0, 272]); // CER/CEA-like, doesn't matter for the test
        h.extend_from_slice(&app_id.to_be_bytes());
        h.extend_from_slice(&1u32.to_be_bytes());
        h.extend_from_slice(&2u32.to_be_bytes());
        h
    }

    #[test]
    fn parses_header_and_session_id_avp() {
        let sid = avp(AVP_SESSION_ID, b"host.example.com;1;2");
        let mut msg = header(16777251, 0x80, sid.len());
        msg.extend_from_slice(&sid);
        let d = parse(&msg).expect("parse");
        assert!(d.is_request());
        assert_eq!(d.application_id, 16777251);
        assert_eq!(d.session_id(), Some("host.example.com;1;2".to_string()));
    }

    #[test]
    fn result_code_drives_error_flag() {
        let rc = avp(AVP_RESULT_CODE, &5012u32.to_be_bytes());
        let mut msg = header(16777238, 0x00, rc.len());
        msg.extend_from_slice(&rc);
        let d = parse(&msg).expect("parse");
        assert_eq!(d.result_code(), Some(5012));
        assert!(d.is_error_result());
    }
}
