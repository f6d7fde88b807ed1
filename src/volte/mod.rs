// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! VoLTE call correlator: fuses a SIP dialog, a Rx session, a Gx session, a
//! GTP bearer, and an RTP flow into one `VolteCall`, keyed by SIP Call-ID,
//! with the state machine DAG and the seven setup/duration metrics.

use std::{collections::HashMap, net::IpAddr, sync::Mutex};

use crate::{
    decode::{diameter::DiameterMessage, gtpv2::Gtpv2Message, sip::SipMessage},
    message::MessageMeta,
    time::Timestamp,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Initiating,
    Trying,
    Ringing,
    Answered,
    Confirmed,
    MediaActive,
    Terminating,
    Completed,
    Failed,
    Cancelled,
}

impl CallState {
    fn is_terminal(self) -> bool {
        matches!(self, CallState::Completed | CallState::Failed | CallState::Cancelled)
    }

    fn is_pre_confirmed(self) -> bool {
        matches!(
            self,
            CallState::Initiating | CallState::Trying | CallState::Ringing | CallState::Answered
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct SipLeg {
    pub invite_time: Option<Timestamp>,
    pub trying_time: Option<Timestamp>,
    pub ringing_time: Option<Timestamp>,
    pub answer_time: Option<Timestamp>,
    pub ack_time: Option<Timestamp>,
    pub bye_time: Option<Timestamp>,
    pub codec: Option<String>,
    pub remote_rtp: Option<(IpAddr, u16)>,
}

#[derive(Debug, Clone, Default)]
pub struct RxLeg {
    pub aar_time: Option<Timestamp>,
    pub aaa_time: Option<Timestamp>,
    pub media_components: Vec<(Option<String>, Option<u32>)>,
    pub result_code: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct GxLeg {
    pub rar_time: Option<Timestamp>,
    pub raa_time: Option<Timestamp>,
    pub charging_rules: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BearerLeg {
    pub teid_uplink: Option<u32>,
    pub teid_downlink: Option<u32>,
    pub ebi: Option<u8>,
    pub qci: Option<u8>,
    pub gbr_ul: u64,
    pub gbr_dl: u64,
    pub request_time: Option<Timestamp>,
    pub response_time: Option<Timestamp>,
}

#[derive(Debug, Clone, Default)]
pub struct RtpDirStats {
    pub packets: u64,
    pub bytes: u64,
    pub loss: u64,
    pub jitter_ms: f64,
    last_seq: Option<u16>,
    last_arrival_us: Option<i64>,
    last_rtp_ts: Option<u32>,
}

impl RtpDirStats {
    fn observe(&mut self, seq: u16, rtp_ts: u32, len: usize, arrival: Timestamp) {
        self.packets += 1;
        self.bytes += len as u64;
        if let Some(prev) = self.last_seq {
            let gap = seq.wrapping_sub(prev);
            if gap > 1 && gap < 0x8000 {
                self.loss += u64::from(gap - 1);
            }
        }
        if let (Some(prev_arrival), Some(prev_ts)) = (self.last_arrival_us, self.last_rtp_ts) {
            // RFC 3550 §6.4.1 interarrival jitter, 8 kHz assumption for narrowband voice.
            let arrival_diff_ticks = ((arrival.0 - prev_arrival) as f64 / 1000.0) * 8.0;
            let ts_diff = (rtp_ts.wrapping_sub(prev_ts)) as f64;
            let d = (arrival_diff_ticks - ts_diff).abs();
            self.jitter_ms += (d - self.jitter_ms) / 16.0;
        }
        self.last_seq = Some(seq);
        self.last_arrival_us = Some(arrival.0);
        self.last_rtp_ts = Some(rtp_ts);
    }

    fn loss_fraction(&self) -> f64 {
        let total = self.packets + self.loss;
        if total == 0 {
            0.0
        } else {
            self.loss as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RtpLeg {
    pub ssrc: Option<u32>,
    pub uplink: RtpDirStats,
    pub downlink: RtpDirStats,
    pub first_rtp_time: Option<Timestamp>,
    pub last_rtp_time: Option<Timestamp>,
}

impl RtpLeg {
    /// A simple loss/jitter-weighted MOS estimate in the spirit of the
    /// ITU-T E-model, not a certified implementation.
    pub fn estimated_mos(&self) -> f64 {
        let loss_pct = (self.uplink.loss_fraction() + self.downlink.loss_fraction()) * 50.0;
        let jitter_ms = (self.uplink.jitter_ms + self.downlink.jitter_ms) / 2.0;
        let mos = 4.5 - loss_pct * 0.15 - jitter_ms * 0.02;
        mos.clamp(1.0, 4.5)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Metrics {
    pub setup_time_ms: Option<i64>,
    pub post_dial_delay_ms: Option<i64>,
    pub answer_delay_ms: Option<i64>,
    pub bearer_setup_time_ms: Option<i64>,
    pub rx_authorization_time_ms: Option<i64>,
    pub total_call_duration_ms: Option<i64>,
    pub media_duration_ms: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct VolteCall {
    pub call_id: String,
    pub icid: Option<String>,
    pub imsi: Option<String>,
    pub msisdn: Option<String>,
    pub calling_number: Option<String>,
    pub called_number: Option<String>,
    pub sip: Option<SipLeg>,
    pub rx: Option<RxLeg>,
    pub gx: Option<GxLeg>,
    pub bearer: Option<BearerLeg>,
    pub rtp: Option<RtpLeg>,
    pub state: CallState,
    pub state_reason: Option<String>,
    pub metrics: Metrics,
    pub last_updated: Timestamp,
}

impl VolteCall {
    fn new(call_id: String, now: Timestamp) -> VolteCall {
        VolteCall {
            call_id,
            icid: None,
            imsi: None,
            msisdn: None,
            calling_number: None,
            called_number: None,
            sip: None,
            rx: None,
            gx: None,
            bearer: None,
            rtp: None,
            state: CallState::Initiating,
            state_reason: None,
            metrics: Metrics::default(),
            last_updated: now,
        }
    }

    fn recompute_metrics(&mut self) {
        let sip = self.sip.as_ref();
        self.metrics.setup_time_ms = sip.and_then(|s| Some(s.answer_time?.delta_ms(s.invite_time?)));
        self.metrics.post_dial_delay_ms = sip.and_then(|s| Some(s.ringing_time?.delta_ms(s.invite_time?)));
        self.metrics.answer_delay_ms = sip.and_then(|s| Some(s.answer_time?.delta_ms(s.ringing_time?)));
        self.metrics.total_call_duration_ms = sip.and_then(|s| Some(s.bye_time?.delta_ms(s.invite_time?)));
        if let Some(b) = &self.bearer {
            self.metrics.bearer_setup_time_ms = (|| Some(b.response_time?.delta_ms(b.request_time?)))();
        }
        if let Some(rx) = &self.rx {
            self.metrics.rx_authorization_time_ms = (|| Some(rx.aaa_time?.delta_ms(rx.aar_time?)))();
        }
        if let Some(rtp) = &self.rtp {
            self.metrics.media_duration_ms = (|| Some(rtp.last_rtp_time?.delta_ms(rtp.first_rtp_time?)))();
        }
    }

    fn transition(&mut self, next: CallState, reason: Option<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = next;
        if reason.is_some() {
            self.state_reason = reason;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
}

impl Stats {
    pub fn active_calls(&self, calls: &HashMap<String, VolteCall>) -> u64 {
        calls.values().filter(|c| !c.state.is_terminal()).count() as u64
    }
}

struct Inner {
    calls: HashMap<String, VolteCall>,
    by_icid: HashMap<String, String>,
    by_rx_session: HashMap<String, String>,
    by_teid: HashMap<u32, String>,
    by_imsi: HashMap<String, Vec<String>>,
    stats: Stats,
}

pub struct VolteCorrelator {
    inner: Mutex<Inner>,
}

impl Default for VolteCorrelator {
    fn default() -> VolteCorrelator {
        VolteCorrelator::new()
    }
}

impl VolteCorrelator {
    pub fn new() -> VolteCorrelator {
        VolteCorrelator {
            inner: Mutex::new(Inner {
                calls: HashMap::new(),
                by_icid: HashMap::new(),
                by_rx_session: HashMap::new(),
                by_teid: HashMap::new(),
                by_imsi: HashMap::new(),
                stats: Stats::default(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("volte correlator mutex poisoned")
    }

    pub fn stats(&self) -> Stats {
        self.lock().stats
    }

    pub fn active_call_count(&self) -> u64 {
        let guard = self.lock();
        guard.stats.active_calls(&guard.calls)
    }

    pub fn get_call(&self, call_id: &str) -> Option<VolteCall> {
        self.lock().calls.get(call_id).cloned()
    }

    pub fn get_all_calls(&self) -> Vec<VolteCall> {
        self.lock().calls.values().cloned().collect()
    }

    pub fn get_active_calls(&self) -> Vec<VolteCall> {
        self.lock().calls.values().filter(|c| !c.state.is_terminal()).cloned().collect()
    }

    pub fn on_sip(&self, meta: &MessageMeta, msg: &SipMessage) {
        let Some(call_id) = msg.call_id().map(str::to_string) else { return };
        let mut guard = self.lock();
        let is_new = !guard.calls.contains_key(&call_id);
        let method = msg.method().map(str::to_string);
        let is_invite_request = method.as_deref() == Some("INVITE");
        if is_new && !is_invite_request {
            // Only INVITE opens a new call; other early messages for an
            // unseen Call-ID (retransmits, out-of-order captures) are
            // dropped rather than starting a call on a non-INVITE.
            return;
        }
        if is_new {
            guard.calls.insert(call_id.clone(), VolteCall::new(call_id.clone(), meta.timestamp));
            guard.stats.total_calls += 1;
        }
        let call = guard.calls.get_mut(&call_id).expect("just ensured present");
        call.last_updated = meta.timestamp;
        let sip = call.sip.get_or_insert_with(SipLeg::default);

        if let Some(icid) = msg.p_charging_vector_icid() {
            call.icid.get_or_insert(icid.clone());
            guard.by_icid.insert(icid, call_id.clone());
        }
        if call.calling_number.is_none()
            && let Some(pai) = msg.p_asserted_identity()
        {
            call.calling_number = Some(crate::correlator::sip::normalize_msisdn(pai, false));
        }
        if call.called_number.is_none()
            && let Some(to) = msg.to_display()
        {
            call.called_number = Some(crate::correlator::sip::normalize_msisdn(&to, false));
        }
        if let Some(sdp) = &msg.body {
            for m in &sdp.media {
                if let Some((pt, name)) = m.codecs.first() {
                    sip.codec.get_or_insert(format!("{pt} {name}"));
                }
                if let (Some(addr), Some(port)) = (&m.connection_address, Some(m.port))
                    && let Ok(ip) = addr.parse::<IpAddr>()
                {
                    sip.remote_rtp.get_or_insert((ip, port));
                }
            }
        }

        match (method.as_deref(), msg.status_code()) {
            (Some("INVITE"), _) => {
                sip.invite_time.get_or_insert(meta.timestamp);
                call.transition(CallState::Trying, None);
            },
            (Some("ACK"), _) => {
                sip.ack_time.get_or_insert(meta.timestamp);
                call.transition(CallState::Confirmed, None);
            },
            (Some("BYE"), _) => {
                sip.bye_time.get_or_insert(meta.timestamp);
                call.transition(CallState::Terminating, None);
                call.transition(CallState::Completed, None);
                guard.stats.successful_calls += 1;
            },
            (Some("CANCEL"), _) => {
                if call.state.is_pre_confirmed() {
                    call.transition(CallState::Cancelled, None);
                }
            },
            (None, Some(100)) => {
                sip.trying_time.get_or_insert(meta.timestamp);
                call.transition(CallState::Trying, None);
            },
            (None, Some(180)) | (None, Some(183)) => {
                sip.ringing_time.get_or_insert(meta.timestamp);
                call.transition(CallState::Ringing, None);
            },
            (None, Some(code)) if (200..300).contains(&code) => {
                sip.answer_time.get_or_insert(meta.timestamp);
                call.transition(CallState::Answered, None);
            },
            (None, Some(code)) if code >= 300 => {
                let reason = format!("{code} {}", msg.reason_phrase().unwrap_or_default());
                if call.state.is_pre_confirmed() {
                    call.transition(CallState::Failed, Some(reason));
                    guard.stats.failed_calls += 1;
                }
            },
            _ => {},
        }
        call.recompute_metrics();
    }

    /// Matches on ICID if known, else falls back to a caller-supplied UE-IP
    /// match (looked up against the subscriber store upstream).
    pub fn on_diameter_rx(&self, meta: &MessageMeta, msg: &DiameterMessage, call_id_hint: Option<&str>) {
        let mut guard = self.lock();
        let call_id = match call_id_hint {
            Some(c) => c.to_string(),
            None => {
                let Some(session_id) = msg.session_id() else { return };
                let Some(found) = guard.by_rx_session.get(&session_id).cloned() else { return };
                found
            },
        };
        let Some(call) = guard.calls.get_mut(&call_id) else { return };
        call.last_updated = meta.timestamp;
        let rx = call.rx.get_or_insert_with(RxLeg::default);
        if msg.is_request() {
            rx.aar_time.get_or_insert(meta.timestamp);
        } else {
            rx.aaa_time.get_or_insert(meta.timestamp);
            rx.result_code = msg.result_code();
        }
        rx.media_components = crate::decode::diameter::apps::rx_media_components(msg);
        if let Some(session_id) = msg.session_id() {
            guard.by_rx_session.insert(session_id, call_id.clone());
        }
        call.recompute_metrics();
    }

    pub fn on_diameter_gx(&self, meta: &MessageMeta, msg: &DiameterMessage, call_id_hint: &str) {
        let mut guard = self.lock();
        let Some(call) = guard.calls.get_mut(call_id_hint) else { return };
        call.last_updated = meta.timestamp;
        let gx = call.gx.get_or_insert_with(GxLeg::default);
        if msg.is_request() {
            gx.rar_time.get_or_insert(meta.timestamp);
        } else {
            gx.raa_time.get_or_insert(meta.timestamp);
        }
        for rule in crate::decode::diameter::apps::gx_charging_rule_names(msg) {
            if !gx.charging_rules.contains(&rule) {
                gx.charging_rules.push(rule);
            }
        }
        call.recompute_metrics();
    }

    /// QCI 1 identifies the VoLTE voice bearer (spec §4.J); other bearers
    /// are ignored by this correlator.
    pub fn on_gtp_bearer(&self, meta: &MessageMeta, msg: &Gtpv2Message, call_id_hint: &str, is_request: bool) {
        if msg.bearer_qos().is_none_or(|q| q.qci != 1) {
            return;
        }
        let mut guard = self.lock();
        let Some(call) = guard.calls.get_mut(call_id_hint) else { return };
        call.last_updated = meta.timestamp;
        let bearer = call.bearer.get_or_insert_with(BearerLeg::default);
        if is_request {
            bearer.request_time.get_or_insert(meta.timestamp);
        } else {
            bearer.response_time.get_or_insert(meta.timestamp);
        }
        if let Some(ebi) = msg.eps_bearer_id() {
            bearer.ebi = Some(ebi);
        }
        if let Some(q) = msg.bearer_qos() {
            bearer.qci = Some(q.qci);
            bearer.gbr_ul = q.guaranteed_bitrate_ul;
            bearer.gbr_dl = q.guaranteed_bitrate_dl;
        }
        for (ip, teid) in msg.f_teid_keys() {
            let _ = ip;
            guard.by_teid.insert(teid, call_id_hint.to_string());
            let bearer = guard.calls.get_mut(call_id_hint).expect("present").bearer.get_or_insert_with(BearerLeg::default);
            if bearer.teid_uplink.is_none() {
                bearer.teid_uplink = Some(teid);
            } else {
                bearer.teid_downlink.get_or_insert(teid);
            }
        }
        call.recompute_metrics();
    }

    /// On first hit for a call, creates the RTP leg and transitions
    /// CONFIRMED → MEDIA_ACTIVE.
    pub fn on_rtp(
        &self,
        meta: &MessageMeta,
        call_id: &str,
        ssrc: u32,
        sequence_number: u16,
        rtp_timestamp: u32,
        payload_len: usize,
        uplink: bool,
    ) {
        let mut guard = self.lock();
        let Some(call) = guard.calls.get_mut(call_id) else { return };
        call.last_updated = meta.timestamp;
        let first_hit = call.rtp.is_none();
        let rtp = call.rtp.get_or_insert_with(RtpLeg::default);
        rtp.ssrc.get_or_insert(ssrc);
        rtp.first_rtp_time.get_or_insert(meta.timestamp);
        rtp.last_rtp_time = Some(meta.timestamp);
        let dir = if uplink { &mut rtp.uplink } else { &mut rtp.downlink };
        dir.observe(sequence_number, rtp_timestamp, payload_len, meta.timestamp);
        if first_hit && call.state == CallState::Confirmed {
            call.transition(CallState::MediaActive, None);
        }
        call.recompute_metrics();
    }

    /// Removes every call in a terminal state older than `retention`
    /// relative to `now`. Returns the count removed.
    pub fn cleanup_completed(&self, now: Timestamp, retention_us: i64) -> usize {
        let mut guard = self.lock();
        let stale: Vec<String> = guard
            .calls
            .iter()
            .filter(|(_, c)| c.state.is_terminal() && now.0 - c.last_updated.0 > retention_us)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            guard.calls.remove(id);
            guard.by_icid.retain(|_, v| v != id);
            guard.by_rx_session.retain(|_, v| v != id);
            guard.by_teid.retain(|_, v| v != id);
            for v in guard.by_imsi.values_mut() {
                v.retain(|c| c != id);
            }
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ts: i64) -> MessageMeta {
        MessageMeta {
            timestamp: Timestamp(ts),
            frame_number: 1,
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 5060,
            dst_port: 5060,
            direction: None,
        }
    }

    fn msg(raw: &str) -> SipMessage {
        SipMessage::parse(raw.replace('\n', "\r\n").as_bytes()).expect("parse")
    }

    #[test]
    fn call_state_progresses_to_completed() {
        let corr = VolteCorrelator::new();
        corr.on_sip(&meta(0), &msg("INVITE sip:b@x SIP/2.0\nCall-ID: v1\nFrom: <sip:a@x>;tag=1\nTo: <sip:b@x>\nCSeq: 1 INVITE\nVia: SIP/2.0/UDP h;branch=z1\nContent-Length: 0\n\n"));
        corr.on_sip(&meta(1_000_000), &msg("SIP/2.0 180 Ringing\nCall-ID: v1\nFrom: <sip:a@x>;tag=1\nTo: <sip:b@x>;tag=2\nCSeq: 1 INVITE\nVia: SIP/2.0/UDP h;branch=z1\nContent-Length: 0\n\n"));
        corr.on_sip(&meta(2_000_000), &msg("SIP/2.0 200 OK\nCall-ID: v1\nFrom: <sip:a@x>;tag=1\nTo: <sip:b@x>;tag=2\nCSeq: 1 INVITE\nVia: SIP/2.0/UDP h;branch=z1\nContent-Length: 0\n\n"));
        corr.on_sip(&meta(2_100_000), &msg("ACK sip:b@x SIP/2.0\nCall-ID: v1\nFrom: <sip:a@x>;tag=1\nTo: <sip:b@x>;tag=2\nCSeq: 1 ACK\nVia: SIP/2.0/UDP h;branch=z1\nContent-Length: 0\n\n"));
        corr.on_sip(&meta(10_000_000), &msg("BYE sip:b@x SIP/2.0\nCall-ID: v1\nFrom: <sip:a@x>;tag=1\nTo: <sip:b@x>;tag=2\nCSeq: 2 BYE\nVia: SIP/2.0/UDP h;branch=z2\nContent-Length: 0\n\n"));

        let call = corr.get_call("v1").expect("call");
        assert_eq!(call.state, CallState::Completed);
        assert_eq!(call.metrics.setup_time_ms, Some(2));
        assert_eq!(call.metrics.total_call_duration_ms, Some(10));
    }

    #[test]
    fn failure_response_sets_state_reason() {
        let corr = VolteCorrelator::new();
        corr.on_sip(&meta(0), &msg("INVITE sip:b@x SIP/2.0\nCall-ID: v2\nFrom: <sip:a@x>;tag=1\nTo: <sip:b@x>\nCSeq: 1 INVITE\nVia: SIP/2.0/UDP h;branch=z1\nContent-Length: 0\n\n"));
        corr.on_sip(&meta(1_000_000), &msg("SIP/2.0 486 Busy Here\nCall-ID: v2\nFrom: <sip:a@x>;tag=1\nTo: <sip:b@x>;tag=2\nCSeq: 1 INVITE\nVia: SIP/2.0/UDP h;branch=z1\nContent-Length: 0\n\n"));
        let call = corr.get_call("v2").expect("call");
        assert_eq!(call.state, CallState::Failed);
        assert_eq!(call.state_reason.as_deref(), Some("486 Busy Here"));
    }
}
