// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Content-signature protocol detection, independent of port, grounded on
//! `ndpi_engine/protocol_detector.cpp`.

const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedProtocol {
    Sip,
    Diameter,
    GtpC,
    GtpU,
    Stun,
    Rtp,
    Unknown,
}

/// Detects a protocol from raw payload bytes plus the transport ports that
/// carried it. Only TCP (6) and UDP (17) are considered, matching the
/// original's content-based detector.
pub fn detect(data: &[u8], src_port: u16, dst_port: u16, ip_proto: u8) -> Option<DetectedProtocol> {
    if data.len() < 4 || (ip_proto != 17 && ip_proto != 6) {
        return None;
    }
    if is_sip_payload(data) {
        return Some(DetectedProtocol::Sip);
    }
    if is_diameter_payload(data) {
        return Some(DetectedProtocol::Diameter);
    }
    if is_gtp_payload(data) {
        return Some(gtp_protocol_type(data));
    }
    if is_stun_payload(data) {
        return Some(DetectedProtocol::Stun);
    }
    let port_in_rtp_range =
        (src_port >= 1024 && src_port % 2 == 0) || (dst_port >= 1024 && dst_port % 2 == 0);
    if port_in_rtp_range && is_rtp_payload(data) {
        return Some(DetectedProtocol::Rtp);
    }
    None
}

const SIP_METHODS: &[&str] = &[
    "INVITE ", "ACK ", "BYE ", "CANCEL ", "OPTIONS ", "REGISTER ", "UPDATE ", "PRACK ",
    "SUBSCRIBE ", "NOTIFY ", "PUBLISH ", "MESSAGE ", "INFO ", "REFER ",
];
const SIP_MANDATORY_HEADERS: &[&str] =
    &["Call-ID:", "i:", "From:", "f:", "To:", "t:", "CSeq:", "Via:", "v:"];

pub fn is_sip_payload(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    let check_len = data.len().min(4096);
    let text = String::from_utf8_lossy(&data[..check_len]);

    if !text.contains("SIP/2.0") {
        return false;
    }
    for method in SIP_METHODS {
        if text.starts_with(method) {
            return true;
        }
    }
    if let Some(rest) = text.strip_prefix("SIP/2.0 ")
        && rest.len() >= 3
        && rest.as_bytes()[..3].iter().all(u8::is_ascii_digit)
    {
        return true;
    }
    let header_count = SIP_MANDATORY_HEADERS.iter().filter(|h| text.contains(*h)).count();
    header_count >= 2
}

pub fn is_diameter_payload(data: &[u8]) -> bool {
    if data.len() < 20 {
        return false;
    }
    if data[0] != 0x01 {
        return false;
    }
    let msg_len = ((data[1] as u32) << 16) | ((data[2] as u32) << 8) | data[3] as u32;
    if !(20..=65535).contains(&msg_len) {
        return false;
    }
    let flags = data[4];
    if flags & 0x0F != 0 {
        return false;
    }
    // Tolerate fragmentation: a partial message is still a valid header.
    data.len() as u32 >= 20
}

pub fn is_gtp_payload(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    let version = (data[0] >> 5) & 0x07;
    let pt = (data[0] >> 4) & 0x01;
    (version == 1 || version == 2) && pt == 1
}

pub fn gtp_protocol_type(data: &[u8]) -> DetectedProtocol {
    if !is_gtp_payload(data) {
        return DetectedProtocol::Unknown;
    }
    let version = (data[0] >> 5) & 0x07;
    let msg_type = data[1];
    match version {
        2 => DetectedProtocol::GtpC,
        1 if msg_type == 0xFF => DetectedProtocol::GtpU,
        1 => DetectedProtocol::GtpC,
        _ => DetectedProtocol::Unknown,
    }
}

pub fn is_stun_payload(data: &[u8]) -> bool {
    if data.len() < 20 {
        return false;
    }
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    if magic != STUN_MAGIC_COOKIE {
        return false;
    }
    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type & 0xC000 != 0 {
        return false;
    }
    let msg_len = u16::from_be_bytes([data[2], data[3]]);
    msg_len % 4 == 0
}

pub fn is_rtp_payload(data: &[u8]) -> bool {
    if data.len() < 12 {
        return false;
    }
    let version = (data[0] >> 6) & 0x03;
    if version != 2 {
        return false;
    }
    let cc = data[0] & 0x0F;
    let payload_type = data[1] & 0x7F;
    if cc > 15 || payload_type > 127 {
        return false;
    }
    let header_len = 12 + (cc as usize) * 4;
    data.len() >= header_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_sip_invite() {
        let msg = b"INVITE sip:bob@example.com SIP/2.0\r\n";
        assert_eq!(detect(msg, 5060, 5060, 6), Some(DetectedProtocol::Sip));
    }

    #[test]
    fn detects_diameter_header() {
        let mut h = [0u8; 20];
        h[0] = 1;
        h[3] = 20;
        assert_eq!(detect(&h, 3868, 3868, 6), Some(DetectedProtocol::Diameter));
    }

    #[test]
    fn detects_gtpv2_c() {
        let mut h = [0u8; 12];
        h[0] = 0x40; // version 2, PT=1
        assert_eq!(detect(&h, 2123, 2123, 17), Some(DetectedProtocol::GtpC));
    }

    #[test]
    fn detects_gtpv1_u_by_message_type() {
        let mut h = [0u8; 12];
        h[0] = 0x30; // version 1, PT=1
        h[1] = 0xFF;
        assert_eq!(detect(&h, 2152, 2152, 17), Some(DetectedProtocol::GtpU));
    }

    #[test]
    fn rtp_requires_port_heuristic() {
        let mut h = [0u8; 12];
        h[0] = 0x80; // version 2
        h[1] = 0x00;
        assert_eq!(detect(&h, 5061, 5061, 17), None);
        assert_eq!(detect(&h, 40000, 40000, 17), Some(DetectedProtocol::Rtp));
    }
}
