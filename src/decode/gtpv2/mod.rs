// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! GTPv2-C header and Information Element decoding (3GPP TS 29.274), IE type
//! and message type numbering grounded on
//! `protocol_parsers/gtp/gtpv2_types.h`.

pub mod ie;

use std::net::IpAddr;

pub use ie::{BearerQos, FTeid, Ie, Paa, Uli};

use crate::error::DecodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    EchoRequest = 1,
    EchoResponse = 2,
    CreateSessionRequest = 32,
    CreateSessionResponse = 33,
    ModifyBearerRequest = 34,
    ModifyBearerResponse = 35,
    DeleteSessionRequest = 36,
    DeleteSessionResponse = 37,
    CreateBearerRequest = 95,
    CreateBearerResponse = 96,
    UpdateBearerRequest = 97,
    UpdateBearerResponse = 98,
    DeleteBearerRequest = 99,
    DeleteBearerResponse = 100,
    Other(u8),
}

impl From<u8> for MessageType {
    fn from(v: u8) -> Self {
        match v {
            1 => MessageType::EchoRequest,
            2 => MessageType::EchoResponse,
            32 => MessageType::CreateSessionRequest,
            33 => MessageType::CreateSessionResponse,
            34 => MessageType::ModifyBearerRequest,
            35 => MessageType::ModifyBearerResponse,
            36 => MessageType::DeleteSessionRequest,
            37 => MessageType::DeleteSessionResponse,
            95 => MessageType::CreateBearerRequest,
            96 => MessageType::CreateBearerResponse,
            97 => MessageType::UpdateBearerRequest,
            98 => MessageType::UpdateBearerResponse,
            99 => MessageType::DeleteBearerRequest,
            100 => MessageType::DeleteBearerResponse,
            other => MessageType::Other(other),
        }
    }
}

pub mod ie_type {
    pub const IMSI: u8 = 1;
    pub const CAUSE: u8 = 2;
    pub const APN: u8 = 71;
    pub const EPS_BEARER_ID: u8 = 73;
    pub const IP_ADDRESS_V4: u8 = 74;
    pub const MEI: u8 = 75;
    pub const MSISDN: u8 = 76;
    pub const PAA: u8 = 79;
    pub const BEARER_QOS: u8 = 80;
    pub const RAT_TYPE: u8 = 82;
    pub const SERVING_NETWORK: u8 = 83;
    pub const ULI: u8 = 86;
    pub const F_TEID: u8 = 87;
    pub const BEARER_CONTEXT: u8 = 93;
    pub const LINKED_EBI: u8 = 73;
}

/// GTPv2-C success causes (spec §4.G): Request Accepted and its three
/// partial-acceptance variants.
pub const SUCCESS_CAUSES: [u8; 4] = [16, 17, 18, 19];

#[derive(Debug, Clone)]
pub struct Gtpv2Message {
    pub message_type: u8,
    pub teid: Option<u32>,
    pub sequence: u32,
    pub ies: Vec<Ie>,
}

impl Gtpv2Message {
    pub fn kind(&self) -> MessageType {
        MessageType::from(self.message_type)
    }

    pub fn find(&self, ie_type: u8) -> Option<&Ie> {
        self.ies.iter().find(|ie| ie.ie_type == ie_type)
    }

    pub fn find_all(&self, ie_type: u8) -> Vec<&Ie> {
        self.ies.iter().filter(|ie| ie.ie_type == ie_type).collect()
    }

    pub fn imsi(&self) -> Option<String> {
        self.find(ie_type::IMSI).map(|ie| crate::decode::tbcd::decode(&ie.data))
    }

    pub fn msisdn(&self) -> Option<String> {
        self.find(ie_type::MSISDN).map(|ie| crate::decode::tbcd::decode(&ie.data))
    }

    pub fn mei(&self) -> Option<String> {
        self.find(ie_type::MEI).map(|ie| crate::decode::tbcd::decode(&ie.data))
    }

    pub fn apn(&self) -> Option<String> {
        self.find(ie_type::APN).map(|ie| ie::decode_apn(&ie.data))
    }

    pub fn cause(&self) -> Option<u8> {
        self.find(ie_type::CAUSE).and_then(|ie| ie.data.first().copied())
    }

    pub fn serving_network(&self) -> Option<(String, String)> {
        self.find(ie_type::SERVING_NETWORK).and_then(|ie| ie::decode_plmn(&ie.data))
    }

    pub fn rat_type(&self) -> Option<u8> {
        self.find(ie_type::RAT_TYPE).and_then(|ie| ie.data.first().copied())
    }

    pub fn paa(&self) -> Option<Paa> {
        self.find(ie_type::PAA).and_then(|ie| ie::decode_paa(&ie.data))
    }

    pub fn f_teids(&self) -> Vec<FTeid> {
        self.find_all(ie_type::F_TEID).into_iter().filter_map(|ie| ie::decode_fteid(&ie.data)).collect()
    }

    pub fn bearer_contexts(&self) -> Vec<Gtpv2Message> {
        self.find_all(ie_type::BEARER_CONTEXT)
            .into_iter()
            .filter_map(|ie| parse_ies(&ie.data).ok())
            .map(|ies| Gtpv2Message { message_type: self.message_type, teid: self.teid, sequence: self.sequence, ies })
            .collect()
    }

    pub fn eps_bearer_id(&self) -> Option<u8> {
        self.find(ie_type::EPS_BEARER_ID).and_then(|ie| ie.data.first().copied())
    }

    pub fn bearer_qos(&self) -> Option<BearerQos> {
        self.find(ie_type::BEARER_QOS).and_then(|ie| ie::decode_bearer_qos(&ie.data))
    }

    pub fn uli(&self) -> Option<Uli> {
        self.find(ie_type::ULI).map(|ie| ie::decode_uli(&ie.data))
    }

    /// Downlink-resolvable addresses for this session's F-TEIDs, usable as
    /// F-TEID index keys.
    pub fn f_teid_keys(&self) -> Vec<(IpAddr, u32)> {
        self.f_teids()
            .into_iter()
            .flat_map(|f| {
                let mut keys = Vec::new();
                if let Some(v4) = f.ipv4 {
                    keys.push((IpAddr::V4(v4), f.teid));
                }
                if let Some(v6) = f.ipv6 {
                    keys.push((IpAddr::V6(v6), f.teid));
                }
                keys
            })
            .collect()
    }
}

pub fn parse(bytes: &[u8]) -> Result<Gtpv2Message, DecodeError> {
    if bytes.len() < 8 {
        return Err(DecodeError::TooShort { need: 8, have: bytes.len() });
    }
    let flags = bytes[0];
    let has_teid = flags & 0x08 != 0;
    let message_type = bytes[1];
    let msg_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let total = 4 + msg_len;
    if bytes.len() < total {
        return Err(DecodeError::LengthMismatch { declared: total, available: bytes.len() });
    }
    let mut offset = 4;
    let teid = if has_teid {
        if bytes.len() < offset + 4 {
            return Err(DecodeError::TooShort { need: offset + 4, have: bytes.len() });
        }
        let t = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap_or_default());
        offset += 4;
        Some(t)
    } else {
        None
    };
    if bytes.len() < offset + 3 {
        return Err(DecodeError::TooShort { need: offset + 3, have: bytes.len() });
    }
    let sequence = ((bytes[offset] as u32) << 16) | ((bytes[offset + 1] as u32) << 8) | bytes[offset + 2] as u32;
    offset += 4; // sequence (3 bytes) + 1 spare byte

    let ies = parse_ies(&bytes[offset..total])?;
    Ok(Gtpv2Message { message_type, teid, sequence, ies })
}

fn parse_ies(mut buf: &[u8]) -> Result<Vec<Ie>, DecodeError> {
    let mut ies = Vec::new();
    while buf.len() >= 4 {
        let ie_type = buf[0];
        let length = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let instance = buf[3] & 0x0F;
        if buf.len() < 4 + length {
            return Err(DecodeError::LengthMismatch { declared: 4 + length, available: buf.len() });
        }
        let data = buf[4..4 + length].to_vec();
        ies.push(Ie { ie_type, instance, data });
        buf = &buf[4 + length..];
    }
    Ok(ies)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ie(ie_type: u8, data: &[u8]) -> Vec<u8> {
        let mut out = vec![ie_type, (data.len() >> 8) as u8, (data.len() & 0xff) as u8, 0];
        out.extend_from_slice(data);
        out
    }

    #[test]
    fn parses_create_session_request_with_imsi_and_apn() {
        let imsi_ie = ie(ie_type::IMSI, &crate::decode::tbcd::encode("001010123456789"));
        let apn_ie = ie(ie_type::APN, b"\x03ims");
        let mut body = imsi_ie;
        body.extend_from_slice(&apn_ie);

        let mut msg = vec![0x48, MessageType::CreateSessionRequest as u8, 0, 0];
        msg.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        msg.extend_from_slice(&[0, 0, 1, 0]);
        msg.extend_from_slice(&body);
        let total_len = msg.len() - 4;
        msg[2] = (total_len >> 8) as u8;
        msg[3] = (total_len & 0xff) as u8;

        let m = parse(&msg).expect("parse");
        assert_eq!(m.teid, Some(0x1234_5678));
        assert_eq!(m.sequence, 1);
        assert_eq!(m.imsi().as_deref(), Some("001010123456789"));
        assert_eq!(m.apn().as_deref(), Some("ims"));
    }
}
