// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The neutral message record: a tagged sum over every decoded protocol,
//! each carrying its own fields plus a shared metadata envelope. Grounded on
//! `common/parsed_packet.h`'s `ParsedPacket{protocol, message}` pair, with
//! the protocol tag and payload merged into one Rust enum instead of a
//! separate tag plus `std::variant`.

use std::net::IpAddr;

use enum_dispatch::enum_dispatch;

use crate::{
    decode::{diameter::DiameterMessage, gtpv2::Gtpv2Message, pfcp::PfcpMessage, rtp::RtpPacket,
             s1ap::S1apMessage, sip::SipMessage},
    net::Direction,
    time::Timestamp,
};

/// Per-message capture metadata, carried alongside every decoded record.
#[derive(Debug, Clone, Copy)]
pub struct MessageMeta {
    pub timestamp: Timestamp,
    pub frame_number: u64,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub direction: Option<Direction>,
}

/// A single extractor-dispatch capability every message kind implements: its
/// own tag name, used by the field registry's diagnostics and the filter.
#[enum_dispatch]
pub trait TaggedMessage {
    fn protocol_tag(&self) -> &'static str;
}

impl TaggedMessage for SipMessage {
    fn protocol_tag(&self) -> &'static str {
        "sip"
    }
}
impl TaggedMessage for DiameterMessage {
    fn protocol_tag(&self) -> &'static str {
        "diameter"
    }
}
impl TaggedMessage for Gtpv2Message {
    fn protocol_tag(&self) -> &'static str {
        "gtpv2"
    }
}
impl TaggedMessage for PfcpMessage {
    fn protocol_tag(&self) -> &'static str {
        "pfcp"
    }
}
impl TaggedMessage for S1apMessage {
    fn protocol_tag(&self) -> &'static str {
        "s1ap"
    }
}
impl TaggedMessage for RtpPacket {
    fn protocol_tag(&self) -> &'static str {
        "rtp"
    }
}

#[enum_dispatch(TaggedMessage)]
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    Sip(SipMessage),
    Diameter(DiameterMessage),
    Gtpv2(Gtpv2Message),
    Pfcp(PfcpMessage),
    S1ap(S1apMessage),
    Rtp(RtpPacket),
}

/// One decoded message plus its capture envelope — the unit correlators
/// consume.
#[derive(Debug, Clone)]
pub struct DecodedMessage {
    pub meta: MessageMeta,
    pub body: ParsedMessage,
}
