// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Demonstration entry point: wires the reassembler, framers, detector and
//! decoders into the three signalling correlators, the subscriber context
//! store and the VoLTE call correlator, then drives a handful of synthetic
//! messages through the whole pipeline end to end.
//!
//! Reading capture files is out of scope for this crate (spec §Non-goals);
//! this binary exists to exercise the library surface the way an operator's
//! own ingest front-end would, not to replace one.

use std::net::IpAddr;

use anyhow::{Context, Result};
use tracing::info;
use volte_correlator::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    correlator::{diameter::DiameterCorrelator, gtpv2::Gtpv2Correlator, sip::SipCorrelator},
    decode::{diameter, gtpv2, sip},
    detect::{self, DetectedProtocol},
    framer::{DiameterFramer, Framer, SipFramer},
    message::MessageMeta,
    net::{Direction, FiveTuple},
    registry::Filter,
    subscriber::SubscriberStore,
    time::Timestamp,
    transport::reassembler::{ReassemblyCallbacks, TcpFlags, TcpReassembler, TcpSegment},
    volte::VolteCorrelator,
};

/// Routes reassembled TCP byte runs through the right framer, decoder and
/// correlator for the five-tuple's detected protocol.
struct Pipeline {
    filter: Filter,
    sip_framer: SipFramer,
    diameter_framer: DiameterFramer,
    sip: SipCorrelator,
    gtpv2: Gtpv2Correlator,
    diameter: DiameterCorrelator,
    subscribers: SubscriberStore,
    volte: VolteCorrelator,
}

impl Pipeline {
    fn new(cfg: &Config) -> Pipeline {
        let filter = match &cfg.correlation.filter_rules_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).unwrap_or_default();
                Filter::from_lines(&text)
            },
            None => Filter::default(),
        };
        Pipeline {
            filter,
            sip_framer: SipFramer::new(),
            diameter_framer: DiameterFramer::new(),
            sip: SipCorrelator::new(),
            gtpv2: Gtpv2Correlator::new(),
            diameter: DiameterCorrelator::new(),
            subscribers: SubscriberStore::new(cfg.correlation.max_subscriber_contexts),
            volte: VolteCorrelator::new(),
        }
    }

    fn dispatch_sip(&mut self, meta: &MessageMeta, raw: &[u8]) {
        let msg = match sip::SipMessage::parse(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "dropping unparseable sip message");
                return;
            },
        };
        if !self.filter.rules.is_empty()
            && !self.filter.evaluate(&volte_correlator::message::ParsedMessage::Sip(msg.clone()))
        {
            return;
        }
        if let (Some(imsi), Some(call_id)) = (msg.p_asserted_identity(), msg.call_id()) {
            let id = self.subscribers.get_or_create_by_imsi(imsi, meta.timestamp);
            self.subscribers.update_call_id(id, call_id, meta.timestamp);
        }
        self.sip.process_message(meta, &msg);
        self.volte.on_sip(meta, &msg);
    }

    fn dispatch_diameter(&mut self, meta: &MessageMeta, raw: &[u8]) {
        let msg = match diameter::parse(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "dropping unparseable diameter message");
                return;
            },
        };
        let handled = self.diameter.process_message(&msg);
        if !handled {
            return;
        }
        match diameter::apps::interface_from_application_id(msg.application_id) {
            diameter::apps::Interface::Rx => self.volte.on_diameter_rx(meta, &msg, None),
            diameter::apps::Interface::Gx => {
                if let Some(session_id) = msg.session_id() {
                    self.volte.on_diameter_gx(meta, &msg, &session_id);
                }
            },
            _ => {},
        }
    }

    fn dispatch_gtpv2(&mut self, meta: &MessageMeta, raw: &[u8]) {
        let msg = match gtpv2::parse(raw) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(error = %e, "dropping unparseable gtpv2 message");
                return;
            },
        };
        if let Some(imsi) = msg.imsi() {
            let id = self.subscribers.get_or_create_by_imsi(&imsi, meta.timestamp);
            if let Some(msisdn) = msg.msisdn() {
                self.subscribers.update_msisdn(id, &msisdn, meta.timestamp);
            }
        }
        self.gtpv2.process_message(&msg);
    }

    fn report(&self) {
        info!(stats = ?self.sip.stats(), "sip correlator");
        info!(stats = ?self.gtpv2.stats(), "gtpv2 correlator");
        info!(stats = ?self.diameter.stats(), "diameter correlator");
        info!(subscribers = self.subscribers.len(), "subscriber context store");
        for call in self.volte.get_all_calls() {
            info!(
                call_id = %call.call_id,
                state = ?call.state,
                setup_ms = ?call.metrics.setup_time_ms,
                duration_ms = ?call.metrics.total_call_duration_ms,
                "volte call"
            );
        }
    }
}

/// Byte-run sink for one detected-protocol stream, handed to the
/// reassembler per packet.
struct StreamCollector<'a> {
    pipeline: &'a mut Pipeline,
    protocol: Option<DetectedProtocol>,
    src_port: u16,
    dst_port: u16,
    frame_number: u64,
}

impl ReassemblyCallbacks for StreamCollector<'_> {
    fn on_data(&mut self, ft: &FiveTuple, dir: Direction, bytes: &[u8], ts: Timestamp) {
        let protocol = *self.protocol.get_or_insert_with(|| {
            detect::detect(bytes, self.src_port, self.dst_port, ft.ip_proto).unwrap_or(DetectedProtocol::Unknown)
        });
        self.frame_number += 1;
        let meta = MessageMeta {
            timestamp: ts,
            frame_number: self.frame_number,
            src_ip: ft.src_ip,
            dst_ip: ft.dst_ip,
            src_port: self.src_port,
            dst_port: self.dst_port,
            direction: Some(dir),
        };
        match protocol {
            DetectedProtocol::Sip => {
                let mut messages = Vec::new();
                self.pipeline.sip_framer.process_data(bytes, &mut |msg| messages.push(msg.to_vec()));
                for raw in messages {
                    self.pipeline.dispatch_sip(&meta, &raw);
                }
            },
            DetectedProtocol::Diameter => {
                let mut messages = Vec::new();
                self.pipeline.diameter_framer.process_data(bytes, &mut |msg| messages.push(msg.to_vec()));
                for raw in messages {
                    self.pipeline.dispatch_diameter(&meta, &raw);
                }
            },
            _ => {},
        }
    }

    fn on_close(&mut self, _ft: &FiveTuple) {
        self.pipeline.sip_framer.reset();
        self.pipeline.diameter_framer.reset();
    }
}

/// A loopback TCP segment carrying one SIP message, client to server.
fn sip_segment(seq: u32, payload: &[u8], ts_us: i64) -> TcpSegment {
    TcpSegment { seq, ack: 0, flags: TcpFlags::PSH | TcpFlags::ACK, payload: payload.to_vec().into(), timestamp: Timestamp::from_micros(ts_us) }
}

/// Builds a minimal GTPv2-C Create Session Request carrying an IMSI, the
/// way the decoder's own tests construct one: flags byte with the TEID
/// flag set, message type, TEID, sequence, then a flat IE list.
fn create_session_request(teid: u32, sequence: u32, imsi: &str) -> Vec<u8> {
    fn ie(ie_type: u8, data: &[u8]) -> Vec<u8> {
        let mut out = vec![ie_type, (data.len() >> 8) as u8, (data.len() & 0xff) as u8, 0];
        out.extend_from_slice(data);
        out
    }
    let imsi_ie = ie(1, &volte_correlator::decode::tbcd::encode(imsi));
    let mut msg = vec![0x48, 32, 0, 0];
    msg.extend_from_slice(&teid.to_be_bytes());
    msg.extend_from_slice(&[(sequence >> 16) as u8, (sequence >> 8) as u8, sequence as u8, 0]);
    msg.extend_from_slice(&imsi_ie);
    let total_len = msg.len() - 4;
    msg[2] = (total_len >> 8) as u8;
    msg[3] = (total_len & 0xff) as u8;
    msg
}

#[tokio::main]
async fn main() -> Result<()> {
    let _guard = init_logger(
        resolve_config_path("config/logger.yaml").context("resolving logger config")?.to_str().context("non-utf8 path")?,
    )?;

    let cfg = resolve_config_path("config/volte-correlator.yaml")
        .and_then(Config::load_from_file)
        .context("failed to resolve or load config")?;

    let mut pipeline = Pipeline::new(&cfg);

    let ft = FiveTuple::new(
        "10.0.0.1".parse::<IpAddr>().expect("valid ip"),
        "10.0.0.2".parse::<IpAddr>().expect("valid ip"),
        5060,
        5060,
        6,
    );
    let mut reassembler = TcpReassembler::new(cfg.ingest.max_tcp_streams, cfg.ingest.max_tcp_buffer_per_stream);

    let invite = b"INVITE sip:bob@ims.example SIP/2.0\r\n\
Call-ID: demo-call-1@ims.example\r\n\
From: <sip:alice@ims.example>;tag=1\r\n\
To: <sip:bob@ims.example>\r\n\
P-Asserted-Identity: <sip:+15550001111@ims.example>\r\n\
P-Charging-Vector: icid-value=icid-demo-1\r\n\
Content-Length: 0\r\n\r\n";
    let ringing = b"SIP/2.0 180 Ringing\r\nCall-ID: demo-call-1@ims.example\r\nContent-Length: 0\r\n\r\n";
    let ok = b"SIP/2.0 200 OK\r\nCall-ID: demo-call-1@ims.example\r\nContent-Length: 0\r\n\r\n";
    let ack = b"ACK sip:bob@ims.example SIP/2.0\r\nCall-ID: demo-call-1@ims.example\r\nContent-Length: 0\r\n\r\n";
    let bye = b"BYE sip:bob@ims.example SIP/2.0\r\nCall-ID: demo-call-1@ims.example\r\nContent-Length: 0\r\n\r\n";

    let base_ts = 1_700_000_000_000_000i64;
    let sip_frames: [(&[u8], i64); 5] =
        [(invite, base_ts), (ringing, base_ts + 1_000_000), (ok, base_ts + 2_000_000), (ack, base_ts + 2_500_000), (
            bye,
            base_ts + 12_000_000,
        )];

    let mut seq = 1000u32;
    for (payload, ts) in sip_frames {
        let segment = sip_segment(seq, payload, ts);
        seq = seq.wrapping_add(payload.len() as u32);
        let mut collector = StreamCollector { pipeline: &mut pipeline, protocol: None, src_port: 5060, dst_port: 5060, frame_number: 0 };
        reassembler.process_packet(&ft, segment, &mut collector);
    }

    info!(stats = ?reassembler.stats(), "tcp reassembler");

    // GTPv2-C runs over UDP: no reassembly or framing needed, each datagram
    // is already a whole message.
    let gtp_meta = MessageMeta {
        timestamp: Timestamp::from_micros(base_ts),
        frame_number: 1,
        src_ip: "10.1.0.1".parse::<IpAddr>().expect("valid ip"),
        dst_ip: "10.1.0.2".parse::<IpAddr>().expect("valid ip"),
        src_port: 2123,
        dst_port: 2123,
        direction: Some(Direction::ClientToServer),
    };
    let create_session = create_session_request(0x1234_5678, 1, "001010123456789");
    pipeline.dispatch_gtpv2(&gtp_meta, &create_session);

    pipeline.report();

    Ok(())
}
