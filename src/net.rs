// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The five-tuple and directional types shared across the reassembler,
//! framers, decoders and correlators.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// (src_ip, dst_ip, src_port, dst_port, ip_proto). Equality is bidirectional:
/// a tuple and its reverse compare equal and hash identically, so a stream
/// can be looked up regardless of which side sent the packet being matched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FiveTuple {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub ip_proto: u8,
}

impl FiveTuple {
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16, ip_proto: u8) -> Self {
        FiveTuple { src_ip, dst_ip, src_port, dst_port, ip_proto }
    }

    pub fn reversed(&self) -> Self {
        FiveTuple {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            ip_proto: self.ip_proto,
        }
    }

    /// The orientation-independent key used by hash maps keyed on "the flow"
    /// rather than "this direction of the flow": the lexicographically
    /// smaller (ip, port) pair is always listed first.
    fn canonical_key(&self) -> (IpAddr, u16, IpAddr, u16, u8) {
        let a = (self.src_ip, self.src_port);
        let b = (self.dst_ip, self.dst_port);
        if a <= b {
            (a.0, a.1, b.0, b.1, self.ip_proto)
        } else {
            (b.0, b.1, a.0, a.1, self.ip_proto)
        }
    }

    /// True if `self` names the canonical "client" side fixed at stream
    /// birth, i.e. the lexicographically smaller (ip, port) endpoint.
    pub fn is_client_side(&self) -> bool {
        (self.src_ip, self.src_port) <= (self.dst_ip, self.dst_port)
    }
}

impl PartialEq for FiveTuple {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_key() == other.canonical_key()
    }
}
impl Eq for FiveTuple {}

impl std::hash::Hash for FiveTuple {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical_key().hash(state);
    }
}

impl std::fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}<->{}:{}/{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.ip_proto
        )
    }
}

/// Direction of a reassembled byte run or a decoded message, relative to the
/// canonical client side fixed at stream birth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}
