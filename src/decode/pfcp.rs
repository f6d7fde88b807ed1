// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! PFCP (3GPP TS 29.244, N4 interface) neutral record: only the fields the
//! correlators consume (F-SEID, F-TEID, Node-Id, Cause, UE-IP, recovery
//! timestamp), not a full IE walk — PFCP sessions are not separately
//! correlated by this crate (out of the VoLTE fusion set), the record only
//! needs to be available to the Field Registry / export layer.

use std::net::IpAddr;

use crate::{decode::gtpv2::ie::decode_fteid, error::DecodeError};

#[derive(Debug, Clone, Default)]
pub struct PfcpMessage {
    pub message_type: u8,
    pub seid: Option<u64>,
    pub sequence: u32,
    pub f_teid: Option<(u32, Option<IpAddr>)>,
    pub node_id: Option<String>,
    pub cause: Option<u8>,
    pub ue_ip: Option<IpAddr>,
    pub recovery_timestamp: Option<u32>,
}

mod ie_type {
    pub const CAUSE: u8 = 19;
    pub const NODE_ID: u8 = 60;
    pub const F_SEID: u8 = 57;
    pub const F_TEID: u8 = 21;
    pub const UE_IP_ADDRESS: u8 = 93;
    pub const RECOVERY_TIME_STAMP: u8 = 96;
}

pub fn parse(bytes: &[u8]) -> Result<PfcpMessage, DecodeError> {
    if bytes.len() < 8 {
        return Err(DecodeError::TooShort { need: 8, have: bytes.len() });
    }
    let flags = bytes[0];
    let has_seid = flags & 0x01 != 0;
    let message_type = bytes[1];
    let msg_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    let mut offset = 4;
    let seid = if has_seid {
        if bytes.len() < offset + 8 {
            return Err(DecodeError::TooShort { need: offset + 8, have: bytes.len() });
        }
        let v = u64::from_be_bytes(bytes[offset..offset + 8].try_into().unwrap_or_default());
        offset += 8;
        Some(v)
    } else {
        None
    };
    if bytes.len() < offset + 3 {
        return Err(DecodeError::TooShort { need: offset + 3, have: bytes.len() });
    }
    let sequence = ((bytes[offset] as u32) << 16) | ((bytes[offset + 1] as u32) << 8) | bytes[offset + 2] as u32;
    offset += 4;

    let end = (4 + msg_len).min(bytes.len());
    let mut msg = PfcpMessage { message_type, seid, sequence, ..Default::default() };
    let mut buf = &bytes[offset.min(end)..end];
    while buf.len() >= 4 {
        let ie_type = u16::from_be_bytes([buf[0], buf[1]]);
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            break;
        }
        let data = &buf[4..4 + len];
        match ie_type as u8 {
            ie_type::CAUSE => msg.cause = data.first().copied(),
            ie_type::NODE_ID => msg.node_id = Some(String::from_utf8_lossy(data).into_owned()),
            ie_type::F_SEID => {
                if data.len() >= 9 {
                    msg.seid.get_or_insert(u64::from_be_bytes(data[1..9].try_into().unwrap_or_default()));
                }
            },
            ie_type::F_TEID => {
                if let Some(f) = decode_fteid(data) {
                    msg.f_teid = Some((f.teid, f.ipv4.map(IpAddr::V4).or(f.ipv6.map(IpAddr::V6))));
                }
            },
            ie_type::UE_IP_ADDRESS => {
                if data.len() >= 4 {
                    msg.ue_ip = Some(IpAddr::V4(std::net::Ipv4Addr::new(data[0], data[1], data[2], data[3])));
                }
            },
            ie_type::RECOVERY_TIME_STAMP => {
                if data.len() >= 4 {
                    msg.recovery_timestamp = Some(u32::from_be_bytes(data[..4].try_into().unwrap_or_default()));
                }
            },
            _ => {},
        }
        buf = &buf[4 + len..];
    }
    Ok(msg)
}
