// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! DIAMETER correlator: Session-Id sessions, Hop-by-Hop-Id request/answer
//! pairing, interface detection from the first message's Application-Id,
//! and the session-wide error flag.
//!
//! Request handling for an unseen Session-Id always creates the session
//! (create-on-unknown); an answer for an unseen Session-Id is dropped as a
//! correlation miss, since it cannot be the session-opening event.

use std::{collections::HashMap, net::IpAddr, sync::Mutex};

use crate::decode::diameter::{apps, apps::Interface, DiameterMessage};

#[derive(Debug, Clone, Default)]
pub struct DiameterSession {
    pub session_id: String,
    pub interface: Option<Interface>,
    pub imsi: Option<String>,
    pub msisdn: Option<String>,
    pub framed_ip: Option<IpAddr>,
    pub apn: Option<String>,
    pub rat_type: Option<u32>,
    pub public_identity: Option<String>,
    pub icid: Option<String>,
    pub cc_request: Option<(u32, u32)>,
    pub charging_rule_names: Vec<String>,
    pub qci: Option<u32>,
    pub result_codes: Vec<u32>,
    pub has_errors: bool,
    pending_requests: HashMap<u32, ()>,
    pub message_count: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub sessions_created: u64,
    pub answers_dropped_unknown: u64,
    pub pairs_matched: u64,
}

struct Inner {
    sessions: HashMap<String, DiameterSession>,
    stats: Stats,
}

pub struct DiameterCorrelator {
    inner: Mutex<Inner>,
}

impl Default for DiameterCorrelator {
    fn default() -> DiameterCorrelator {
        DiameterCorrelator::new()
    }
}

impl DiameterCorrelator {
    pub fn new() -> DiameterCorrelator {
        DiameterCorrelator { inner: Mutex::new(Inner { sessions: HashMap::new(), stats: Stats::default() }) }
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().expect("diameter correlator mutex poisoned").stats
    }

    pub fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&DiameterSession) -> R) -> Option<R> {
        let guard = self.inner.lock().expect("diameter correlator mutex poisoned");
        guard.sessions.get(session_id).map(f)
    }

    /// Processes one DIAMETER message. Returns `false` if it was dropped as
    /// an answer referencing an unknown session (a correlation miss).
    pub fn process_message(&self, msg: &DiameterMessage) -> bool {
        let Some(session_id) = msg.session_id() else { return false };
        let mut guard = self.inner.lock().expect("diameter correlator mutex poisoned");

        let is_request = msg.is_request();
        if !is_request && !guard.sessions.contains_key(&session_id) {
            guard.stats.answers_dropped_unknown += 1;
            return false;
        }

        let is_new = !guard.sessions.contains_key(&session_id);
        let session = guard.sessions.entry(session_id.clone()).or_insert_with(|| DiameterSession {
            session_id: session_id.clone(),
            ..Default::default()
        });
        if is_new {
            guard.stats.sessions_created += 1;
        }

        if session.interface.is_none() {
            session.interface = Some(apps::interface_from_application_id(msg.application_id));
        }
        if session.imsi.is_none() {
            session.imsi = apps::imsi(msg);
        }
        if session.msisdn.is_none() {
            session.msisdn = apps::msisdn(msg);
        }
        if session.framed_ip.is_none() {
            session.framed_ip = apps::framed_ip(msg);
        }
        if session.apn.is_none() {
            session.apn = apps::apn(msg);
        }
        if session.rat_type.is_none() {
            session.rat_type = apps::rat_type(msg);
        }
        if session.public_identity.is_none() {
            session.public_identity = apps::public_identity(msg);
        }
        if let Some((ty, num)) = apps::cc_request(msg) {
            session.cc_request = Some((ty, num));
        }
        let rules = apps::gx_charging_rule_names(msg);
        for r in rules {
            if !session.charging_rule_names.contains(&r) {
                session.charging_rule_names.push(r);
            }
        }
        if let Some(qci) = apps::gx_qci(msg) {
            session.qci = Some(qci);
        }

        if is_request {
            session.pending_requests.insert(msg.hop_by_hop_id, ());
        } else if session.pending_requests.remove(&msg.hop_by_hop_id).is_some() {
            guard.stats.pairs_matched += 1;
        }

        if !is_request
            && let Some(code) = msg.result_code()
        {
            session.result_codes.push(code);
            if !(2000..=2999).contains(&code) {
                session.has_errors = true;
            }
        }
        session.message_count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avp(code: u32, flags: u8, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&code.to_be_bytes());
        out.push(flags);
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

    fn header(app_id: u32, flags: u8, hbh: u32, body_len: usize) -> Vec<u8> {
        let total = 20 + body_len;
        let mut h = vec![1u8, ((total >> 16) & 0xff) as u8, ((total >> 8) & 0xff) as u8, (total & 0xff) as u8];
        h.push(flags);
        h.extend_from_slice(&[0, 0, 272]);
        h.extend_from_slice(&app_id.to_be_bytes());
        h.extend_from_slice(&hbh.to_be_bytes());
        h.extend_from_slice(&2u32.to_be_bytes());
        h
    }

    #[test]
    fn request_creates_session_answer_pairs_by_hbh() {
        let corr = DiameterCorrelator::new();
        let sid = avp(263, 0x40, b"host;1;2");
        let mut req = header(16777251, 0x80, 42, sid.len());
        req.extend_from_slice(&sid);
        let req_msg = crate::decode::diameter::parse(&req).unwrap();
        assert!(corr.process_message(&req_msg));

        let mut ans = header(16777251, 0x00, 42, sid.len());
        ans.extend_from_slice(&sid);
        let ans_msg = crate::decode::diameter::parse(&ans).unwrap();
        assert!(corr.process_message(&ans_msg));

        assert_eq!(corr.stats().pairs_matched, 1);
        let interface = corr.with_session("host;1;2", |s| s.interface).flatten();
        assert_eq!(interface, Some(Interface::S6a));
    }

    #[test]
    fn answer_for_unknown_session_is_dropped() {
        let corr = DiameterCorrelator::new();
        let sid = avp(263, 0x40, b"neverseen;1;2");
        let mut ans = header(16777238, 0x00, 1, sid.len());
        ans.extend_from_slice(&sid);
        let ans_msg = crate::decode::diameter::parse(&ans).unwrap();
        assert!(!corr.process_message(&ans_msg));
        assert_eq!(corr.stats().answers_dropped_unknown, 1);
    }

    #[test]
    fn error_result_code_sets_has_errors() {
        let corr = DiameterCorrelator::new();
        let sid = avp(263, 0x40, b"err;1;2");
        let mut req = header(16777238, 0x80, 1, sid.len());
        req.extend_from_slice(&sid);
        corr.process_message(&crate::decode::diameter::parse(&req).unwrap());

        let rc = avp(268, 0x40, &5012u32.to_be_bytes());
        let mut ans = header(16777238, 0x00, 1, sid.len() + rc.len());
        ans.extend_from_slice(&sid);
        ans.extend_from_slice(&rc);
        corr.process_message(&crate::decode::diameter::parse(&ans).unwrap());

        assert!(corr.with_session("err;1;2", |s| s.has_errors).unwrap());
    }
}
