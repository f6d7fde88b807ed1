// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! GTPv2 correlator: (control-TEID, sequence) session creation, bearer
//! lifecycle, the F-TEID set/index, and the session state machine.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{Mutex, RwLock},
};

use crate::decode::gtpv2::{Gtpv2Message, MessageType, SUCCESS_CAUSES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Creating,
    Active,
    Modifying,
    Deleting,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerType {
    Default,
    Dedicated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerState {
    Creating,
    Active,
    Modifying,
    Deleting,
    Deleted,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TunnelEndpoint {
    pub ip: Option<IpAddr>,
    pub teid: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct GtpBearer {
    pub ebi: u8,
    pub linked_ebi: Option<u8>,
    pub bearer_type: BearerType,
    pub qci: Option<u8>,
    pub mbr_ul: u64,
    pub mbr_dl: u64,
    pub gbr_ul: u64,
    pub gbr_dl: u64,
    pub state: BearerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdnClass {
    Ims,
    Internet,
    Emergency,
    Mms,
    Other,
}

pub fn classify_pdn(apn: &str) -> PdnClass {
    let lower = apn.to_ascii_lowercase();
    if lower.contains("emergency") || lower.contains("sos") {
        PdnClass::Emergency
    } else if lower.contains("ims") {
        PdnClass::Ims
    } else if lower.contains("mms") {
        PdnClass::Mms
    } else if lower.contains("internet") || lower.contains("default") {
        PdnClass::Internet
    } else {
        PdnClass::Other
    }
}

pub struct Gtpv2Session {
    pub control_teid: u32,
    pub creation_sequence: u32,
    pub imsi: Option<String>,
    pub msisdn: Option<String>,
    pub mei: Option<String>,
    pub apn: Option<String>,
    pub pdn_class: Option<PdnClass>,
    pub paa: Option<IpAddr>,
    pub rat_type: Option<u8>,
    pub serving_network: Option<(String, String)>,
    pub bearers: HashMap<u8, GtpBearer>,
    pub f_teids: Vec<(IpAddr, u32)>,
    pub state: SessionState,
    pub message_count: u64,
}

impl Gtpv2Session {
    fn new(control_teid: u32, creation_sequence: u32) -> Gtpv2Session {
        Gtpv2Session {
            control_teid,
            creation_sequence,
            imsi: None,
            msisdn: None,
            mei: None,
            apn: None,
            pdn_class: None,
            paa: None,
            rat_type: None,
            serving_network: None,
            bearers: HashMap::new(),
            f_teids: Vec::new(),
            state: SessionState::Creating,
            message_count: 0,
        }
    }

    /// Determines the default bearer (smallest EBI) and marks every other
    /// bearer dedicated with that EBI as its linked-bearer-id.
    pub fn finalize_bearers(&mut self) {
        let Some(&default_ebi) = self.bearers.keys().min() else { return };
        for (ebi, bearer) in self.bearers.iter_mut() {
            if *ebi == default_ebi {
                bearer.bearer_type = BearerType::Default;
                bearer.linked_ebi = None;
            } else {
                bearer.bearer_type = BearerType::Dedicated;
                bearer.linked_ebi = Some(default_ebi);
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub sessions_created: u64,
    pub salvage_sessions: u64,
    pub bearers_created: u64,
}

struct Inner {
    by_creation_key: HashMap<(u32, u32), u32>,
    sessions: HashMap<u32, Gtpv2Session>,
    stats: Stats,
}

pub struct Gtpv2Correlator {
    inner: Mutex<Inner>,
    f_teid_index: RwLock<HashMap<(IpAddr, u32), u32>>,
}

impl Default for Gtpv2Correlator {
    fn default() -> Gtpv2Correlator {
        Gtpv2Correlator::new()
    }
}

impl Gtpv2Correlator {
    pub fn new() -> Gtpv2Correlator {
        Gtpv2Correlator {
            inner: Mutex::new(Inner {
                by_creation_key: HashMap::new(),
                sessions: HashMap::new(),
                stats: Stats::default(),
            }),
            f_teid_index: RwLock::new(HashMap::new()),
        }
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().expect("gtpv2 correlator mutex poisoned").stats
    }

    pub fn find_by_control_teid(&self, teid: u32) -> bool {
        self.inner.lock().expect("gtpv2 correlator mutex poisoned").sessions.contains_key(&teid)
    }

    /// Resolves a GTP-U packet's session, trying downlink (dst) before
    /// uplink (src), per spec §4.G.
    pub fn find_by_fteid_gtpu(&self, src_ip: IpAddr, dst_ip: IpAddr, teid: u32) -> Option<u32> {
        let index = self.f_teid_index.read().expect("f-teid index poisoned");
        index.get(&(dst_ip, teid)).or_else(|| index.get(&(src_ip, teid))).copied()
    }

    pub fn with_session<R>(&self, control_teid: u32, f: impl FnOnce(&Gtpv2Session) -> R) -> Option<R> {
        let guard = self.inner.lock().expect("gtpv2 correlator mutex poisoned");
        guard.sessions.get(&control_teid).map(f)
    }

    pub fn process_message(&self, msg: &Gtpv2Message) {
        let mut guard = self.inner.lock().expect("gtpv2 correlator mutex poisoned");

        let control_teid = match msg.kind() {
            MessageType::CreateSessionRequest | MessageType::CreateSessionResponse => {
                let key = (msg.teid.unwrap_or(0), msg.sequence);
                if let Some(&existing) = guard.by_creation_key.get(&key) {
                    existing
                } else {
                    let teid = msg.teid.unwrap_or(msg.sequence);
                    guard.by_creation_key.insert(key, teid);
                    guard.sessions.insert(teid, Gtpv2Session::new(teid, msg.sequence));
                    guard.stats.sessions_created += 1;
                    teid
                }
            },
            _ => match msg.teid {
                Some(teid) if guard.sessions.contains_key(&teid) => teid,
                Some(teid) => {
                    guard.sessions.insert(teid, Gtpv2Session::new(teid, msg.sequence));
                    guard.stats.sessions_created += 1;
                    guard.stats.salvage_sessions += 1;
                    teid
                },
                None => return,
            },
        };

        let kind = msg.kind();
        let mut new_fteids = Vec::new();
        let mut bearers_created = 0u64;
        {
            let session = guard.sessions.get_mut(&control_teid).expect("just inserted or looked up");
            session.message_count += 1;

            if session.imsi.is_none() {
                session.imsi = msg.imsi();
            }
            if session.msisdn.is_none() {
                session.msisdn = msg.msisdn();
            }
            if session.mei.is_none() {
                session.mei = msg.mei();
            }
            if session.apn.is_none()
                && let Some(apn) = msg.apn()
            {
                session.pdn_class = Some(classify_pdn(&apn));
                session.apn = Some(apn);
            }
            if session.rat_type.is_none() {
                session.rat_type = msg.rat_type();
            }
            if session.serving_network.is_none() {
                session.serving_network = msg.serving_network();
            }
            if session.paa.is_none()
                && let Some(paa) = msg.paa()
            {
                session.paa = paa.ipv4.map(IpAddr::V4).or(paa.ipv6.map(IpAddr::V6));
            }

            for key in msg.f_teid_keys() {
                if !session.f_teids.contains(&key) {
                    session.f_teids.push(key);
                    new_fteids.push(key);
                }
            }
            for bearer_ctx in msg.bearer_contexts() {
                let Some(ebi) = bearer_ctx.eps_bearer_id() else { continue };
                for key in bearer_ctx.f_teid_keys() {
                    if !session.f_teids.contains(&key) {
                        session.f_teids.push(key);
                        new_fteids.push(key);
                    }
                }
                let qos = bearer_ctx.bearer_qos();
                let is_new = !session.bearers.contains_key(&ebi);
                if is_new {
                    bearers_created += 1;
                }
                let bearer = session.bearers.entry(ebi).or_insert_with(|| GtpBearer {
                    ebi,
                    linked_ebi: None,
                    bearer_type: BearerType::Default,
                    qci: None,
                    mbr_ul: 0,
                    mbr_dl: 0,
                    gbr_ul: 0,
                    gbr_dl: 0,
                    state: BearerState::Creating,
                });
                if let Some(q) = qos {
                    bearer.qci = Some(q.qci);
                    bearer.mbr_ul = q.max_bitrate_ul;
                    bearer.mbr_dl = q.max_bitrate_dl;
                    bearer.gbr_ul = q.guaranteed_bitrate_ul;
                    bearer.gbr_dl = q.guaranteed_bitrate_dl;
                }
                bearer.state = BearerState::Active;
            }

            let cause_success = msg.cause().is_some_and(|c| SUCCESS_CAUSES.contains(&c));
            session.state = match kind {
                MessageType::CreateSessionRequest => SessionState::Creating,
                MessageType::CreateSessionResponse if cause_success => SessionState::Active,
                MessageType::ModifyBearerRequest | MessageType::UpdateBearerRequest => SessionState::Modifying,
                MessageType::ModifyBearerResponse | MessageType::UpdateBearerResponse if cause_success => {
                    SessionState::Active
                },
                MessageType::DeleteSessionRequest => SessionState::Deleting,
                MessageType::DeleteSessionResponse => SessionState::Deleted,
                _ => session.state,
            };
            if kind == MessageType::CreateSessionResponse && cause_success {
                session.finalize_bearers();
            }
        }
        guard.stats.bearers_created += bearers_created;

        drop(guard);
        if !new_fteids.is_empty() {
            let mut index = self.f_teid_index.write().expect("f-teid index poisoned");
            for key in new_fteids {
                index.insert(key, control_teid);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{gtpv2, tbcd};

    fn ie(ie_type: u8, data: &[u8]) -> Vec<u8> {
        let mut out = vec![ie_type, (data.len() >> 8) as u8, (data.len() & 0xff) as u8, 0];
        out.extend_from_slice(data);
        out
    }

    fn create_session_request(teid: u32, seq: u32, imsi: &str, apn: &str) -> Vec<u8> {
        let imsi_ie = ie(gtpv2::ie_type::IMSI, &tbcd::encode(imsi));
        let apn_ie = ie(gtpv2::ie_type::APN, &{
            let mut v = vec![apn.len() as u8];
            v.extend_from_slice(apn.as_bytes());
            v
        });
        let mut body = imsi_ie;
        body.extend_from_slice(&apn_ie);
        let mut msg = vec![0x48, MessageType::CreateSessionRequest as u8, 0, 0];
        msg.extend_from_slice(&teid.to_be_bytes());
        msg.extend_from_slice(&[(seq >> 16) as u8, (seq >> 8) as u8, seq as u8, 0]);
        msg.extend_from_slice(&body);
        let total_len = msg.len() - 4;
        msg[2] = (total_len >> 8) as u8;
        msg[3] = (total_len & 0xff) as u8;
        msg
    }

    fn create_session_response(teid: u32, seq: u32, cause: u8) -> Vec<u8> {
        let cause_ie = ie(gtpv2::ie_type::CAUSE, &[cause]);
        let mut msg = vec![0x48, MessageType::CreateSessionResponse as u8, 0, 0];
        msg.extend_from_slice(&teid.to_be_bytes());
        msg.extend_from_slice(&[(seq >> 16) as u8, (seq >> 8) as u8, seq as u8, 0]);
        msg.extend_from_slice(&cause_ie);
        let total_len = msg.len() - 4;
        msg[2] = (total_len >> 8) as u8;
        msg[3] = (total_len & 0xff) as u8;
        msg
    }

    #[test]
    fn establishment_reaches_active_and_is_findable_by_imsi() {
        let corr = Gtpv2Correlator::new();
        let req = gtpv2::parse(&create_session_request(0x1234_5678, 1, "001010123456789", "ims")).unwrap();
        corr.process_message(&req);
        let resp = gtpv2::parse(&create_session_response(0x1234_5678, 1, 16)).unwrap();
        corr.process_message(&resp);

        assert!(corr.find_by_control_teid(0x1234_5678));
        let imsi = corr.with_session(0x1234_5678, |s| s.imsi.clone()).flatten();
        assert_eq!(imsi.as_deref(), Some("001010123456789"));
        let state = corr.with_session(0x1234_5678, |s| s.state).unwrap();
        assert_eq!(state, SessionState::Active);
        let pdn = corr.with_session(0x1234_5678, |s| s.pdn_class).flatten();
        assert_eq!(pdn, Some(PdnClass::Ims));
    }

    #[test]
    fn pdn_classification_substrings() {
        assert_eq!(classify_pdn("IMS"), PdnClass::Ims);
        assert_eq!(classify_pdn("default.apn"), PdnClass::Internet);
        assert_eq!(classify_pdn("sos.emergency"), PdnClass::Emergency);
    }
}
