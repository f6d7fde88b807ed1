// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! End-to-end scenarios spanning decode, correlation and subscriber
//! context tracking: the cross-module behaviours a single unit test can't
//! exercise on its own.

use std::net::{IpAddr, Ipv4Addr};

use volte_correlator::{
    correlator::{gtpv2::Gtpv2Correlator, sip::SipCorrelator},
    decode::{gtpv2, sip::SipMessage},
    message::MessageMeta,
    net::{Direction, FiveTuple},
    subscriber::SubscriberStore,
    time::Timestamp,
    transport::reassembler::{ReassemblyCallbacks, TcpFlags, TcpReassembler, TcpSegment},
    volte::{CallState, VolteCorrelator},
};

fn meta(ts: i64) -> MessageMeta {
    MessageMeta {
        timestamp: Timestamp::from_micros(ts),
        frame_number: 1,
        src_ip: "10.0.0.1".parse().expect("valid ip"),
        dst_ip: "10.0.0.2".parse().expect("valid ip"),
        src_port: 5060,
        dst_port: 5060,
        direction: Some(Direction::ClientToServer),
    }
}

fn sip(raw: &[u8]) -> SipMessage {
    SipMessage::parse(raw).expect("valid sip message")
}

#[test]
fn sip_voice_call_completes() {
    let sip_corr = SipCorrelator::new();
    let volte = VolteCorrelator::new();

    let invite = sip(b"INVITE sip:bob@ims.example SIP/2.0\r\nCall-ID: call-1\r\nFrom: <sip:alice@ims.example>;tag=a\r\nTo: <sip:bob@ims.example>\r\nContent-Length: 0\r\n\r\n");
    let ringing = sip(b"SIP/2.0 180 Ringing\r\nCall-ID: call-1\r\nFrom: <sip:alice@ims.example>;tag=a\r\nTo: <sip:bob@ims.example>;tag=b\r\nContent-Length: 0\r\n\r\n");
    let ok = sip(b"SIP/2.0 200 OK\r\nCall-ID: call-1\r\nFrom: <sip:alice@ims.example>;tag=a\r\nTo: <sip:bob@ims.example>;tag=b\r\nContent-Length: 0\r\n\r\n");
    let ack = sip(b"ACK sip:bob@ims.example SIP/2.0\r\nCall-ID: call-1\r\nFrom: <sip:alice@ims.example>;tag=a\r\nTo: <sip:bob@ims.example>;tag=b\r\nContent-Length: 0\r\n\r\n");
    let bye = sip(b"BYE sip:bob@ims.example SIP/2.0\r\nCall-ID: call-1\r\nFrom: <sip:alice@ims.example>;tag=a\r\nTo: <sip:bob@ims.example>;tag=b\r\nContent-Length: 0\r\n\r\n");

    for (msg, ts) in [(&invite, 0i64), (&ringing, 1_000_000), (&ok, 2_000_000), (&ack, 2_500_000)] {
        let m = meta(ts);
        sip_corr.process_message(&m, msg);
        volte.on_sip(&m, msg);
    }

    let call_id = "call-1".to_string();
    for seq in 0..1500u16 {
        volte.on_rtp(&meta(3_000_000), &call_id, 0xAAAA, seq, 160u32.wrapping_mul(seq as u32), 160, true);
    }

    let bye_meta = meta(12_000_000);
    sip_corr.process_message(&bye_meta, &bye);
    volte.on_sip(&bye_meta, &bye);

    let call = volte.get_call(&call_id).expect("call present");
    assert_eq!(call.state, CallState::Completed);
    assert_eq!(call.metrics.setup_time_ms, Some(2));
    assert_eq!(call.metrics.total_call_duration_ms, Some(12));
    let rtp = call.rtp.expect("rtp leg present");
    assert_eq!(rtp.uplink.packets, 1500);

    assert_eq!(sip_corr.stats().sessions_created, 1);
}

#[test]
fn sip_call_failed_486() {
    let volte = VolteCorrelator::new();
    let invite = sip(b"INVITE sip:bob@ims.example SIP/2.0\r\nCall-ID: call-2\r\nContent-Length: 0\r\n\r\n");
    let busy = sip(b"SIP/2.0 486 Busy Here\r\nCall-ID: call-2\r\nContent-Length: 0\r\n\r\n");
    volte.on_sip(&meta(0), &invite);
    volte.on_sip(&meta(500_000), &busy);

    let call = volte.get_call("call-2").expect("call present");
    assert_eq!(call.state, CallState::Failed);
    assert_eq!(call.state_reason.as_deref(), Some("486 Busy Here"));
    assert!(call.rtp.is_none());
}

#[test]
fn sip_call_cancelled() {
    let volte = VolteCorrelator::new();
    let invite = sip(b"INVITE sip:bob@ims.example SIP/2.0\r\nCall-ID: call-3\r\nContent-Length: 0\r\n\r\n");
    let ringing = sip(b"SIP/2.0 180 Ringing\r\nCall-ID: call-3\r\nContent-Length: 0\r\n\r\n");
    let cancel = sip(b"CANCEL sip:bob@ims.example SIP/2.0\r\nCall-ID: call-3\r\nContent-Length: 0\r\n\r\n");
    volte.on_sip(&meta(0), &invite);
    volte.on_sip(&meta(500_000), &ringing);
    volte.on_sip(&meta(900_000), &cancel);

    let call = volte.get_call("call-3").expect("call present");
    assert_eq!(call.state, CallState::Cancelled);
    assert!(call.sip.as_ref().expect("sip leg").ringing_time.is_some());
    assert!(call.sip.as_ref().expect("sip leg").answer_time.is_none());
}

fn gtp_ie(ie_type: u8, data: &[u8]) -> Vec<u8> {
    let mut out = vec![ie_type, (data.len() >> 8) as u8, (data.len() & 0xff) as u8, 0];
    out.extend_from_slice(data);
    out
}

fn create_session_request(teid: u32, seq: u32, imsi: &str, apn: &str) -> Vec<u8> {
    let imsi_ie = gtp_ie(gtpv2::ie_type::IMSI, &volte_correlator::decode::tbcd::encode(imsi));
    let mut apn_bytes = vec![apn.len() as u8];
    apn_bytes.extend_from_slice(apn.as_bytes());
    let apn_ie = gtp_ie(gtpv2::ie_type::APN, &apn_bytes);
    let mut body = imsi_ie;
    body.extend_from_slice(&apn_ie);
    let mut msg = vec![0x48, gtpv2::MessageType::CreateSessionRequest as u8, 0, 0];
    msg.extend_from_slice(&teid.to_be_bytes());
    msg.extend_from_slice(&[(seq >> 16) as u8, (seq >> 8) as u8, seq as u8, 0]);
    msg.extend_from_slice(&body);
    let total_len = msg.len() - 4;
    msg[2] = (total_len >> 8) as u8;
    msg[3] = (total_len & 0xff) as u8;
    msg
}

fn create_session_response_with_fteid(teid: u32, seq: u32, cause: u8, fteid_ip: Ipv4Addr, fteid_teid: u32) -> Vec<u8> {
    let cause_ie = gtp_ie(gtpv2::ie_type::CAUSE, &[cause]);
    let mut fteid_data = vec![0x80 | 7u8]; // ipv4 present, interface type 7 (S5/S8 PGW GTP-U)
    fteid_data.extend_from_slice(&fteid_teid.to_be_bytes());
    fteid_data.extend_from_slice(&fteid_ip.octets());
    let fteid_ie = gtp_ie(gtpv2::ie_type::F_TEID, &fteid_data);
    let mut msg = vec![0x48, gtpv2::MessageType::CreateSessionResponse as u8, 0, 0];
    msg.extend_from_slice(&teid.to_be_bytes());
    msg.extend_from_slice(&[(seq >> 16) as u8, (seq >> 8) as u8, seq as u8, 0]);
    msg.extend_from_slice(&cause_ie);
    msg.extend_from_slice(&fteid_ie);
    let total_len = msg.len() - 4;
    msg[2] = (total_len >> 8) as u8;
    msg[3] = (total_len & 0xff) as u8;
    msg
}

#[test]
fn fteid_gtpu_lookup_resolves_session_and_imsi() {
    let corr = Gtpv2Correlator::new();
    let req = gtpv2::parse(&create_session_request(0x1234_5678, 1, "001010123456789", "ims")).expect("parse request");
    corr.process_message(&req);
    let pgw_ip = Ipv4Addr::new(192, 168, 1, 1);
    let resp = gtpv2::parse(&create_session_response_with_fteid(0x1234_5678, 1, 16, pgw_ip, 0x1234_5678))
        .expect("parse response");
    corr.process_message(&resp);

    let control_teid = corr
        .find_by_fteid_gtpu(Ipv4Addr::new(10, 0, 0, 1).into(), IpAddr::V4(pgw_ip), 0x1234_5678)
        .expect("f-teid resolves");
    assert_eq!(control_teid, 0x1234_5678);
    let imsi = corr.with_session(control_teid, |s| s.imsi.clone()).flatten();
    assert_eq!(imsi.as_deref(), Some("001010123456789"));
}

struct Collector {
    delivered: Vec<u8>,
    calls: u32,
}

impl ReassemblyCallbacks for Collector {
    fn on_data(&mut self, _ft: &FiveTuple, _dir: Direction, bytes: &[u8], _ts: Timestamp) {
        self.delivered.extend_from_slice(bytes);
        self.calls += 1;
    }
}

fn segment(seq: u32, payload: &[u8]) -> TcpSegment {
    TcpSegment {
        seq,
        ack: 0,
        flags: TcpFlags::PSH | TcpFlags::ACK,
        payload: payload.to_vec().into(),
        timestamp: Timestamp::from_micros(0),
    }
}

#[test]
fn retransmission_is_idempotent() {
    let ft = FiveTuple::new("10.0.0.1".parse().expect("ip"), "10.0.0.2".parse().expect("ip"), 4000, 4001, 6);
    let mut reassembler = TcpReassembler::new(16, 65536);
    let mut collector = Collector { delivered: Vec::new(), calls: 0 };
    for _ in 0..5 {
        reassembler.process_packet(&ft, segment(1001, b"HELLO"), &mut collector);
    }
    assert_eq!(collector.calls, 1);
    assert_eq!(collector.delivered, b"HELLO");
    assert!(reassembler.stats().retransmissions >= 4);
}

#[test]
fn out_of_order_segments_reassemble_in_order() {
    let ft = FiveTuple::new("10.0.0.1".parse().expect("ip"), "10.0.0.2".parse().expect("ip"), 4000, 4001, 6);
    let mut reassembler = TcpReassembler::new(16, 65536);
    let mut collector = Collector { delivered: Vec::new(), calls: 0 };
    reassembler.process_packet(&ft, segment(1001, b"AAA"), &mut collector);
    reassembler.process_packet(&ft, segment(1007, b"CCC"), &mut collector);
    reassembler.process_packet(&ft, segment(1004, b"BBB"), &mut collector);
    assert_eq!(collector.delivered, b"AAABBBCCC");
}

#[test]
fn subscriber_merge_unifies_indices() {
    let store = SubscriberStore::new(100);
    let now = Timestamp::from_micros(0);
    let a = store.get_or_create_by_imsi("001010123456789", now);
    store.update_ue_ip(a, "192.168.1.1".parse().expect("ip"), now);
    let b = store.create_temporary(now);
    store.update_msisdn(b, "15550001111", now);
    store.update_ue_ip(b, "192.168.1.2".parse().expect("ip"), now);

    store.merge(a, b);

    assert_eq!(store.find_by_msisdn("15550001111").map(|c| c.id), Some(a));
    assert_eq!(store.find_by_ue_ip("192.168.1.2".parse().expect("ip")).map(|c| c.id), Some(a));
    assert_eq!(store.find_by_ue_ip("192.168.1.1".parse().expect("ip")).map(|c| c.id), Some(a));
    assert!(store.find_by_id(b).is_none());
}
