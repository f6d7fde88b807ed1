// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SIP correlator: Call-ID sessions, (Call-ID, from-tag, to-tag) dialogs
//! with to-tag promotion and fork detection, branch+CSeq-method
//! transactions with the RFC 3261 state machine, and session-finalisation
//! classification.

use std::{collections::HashMap, net::IpAddr, sync::Mutex};

use crate::{decode::sip::SipMessage, message::MessageMeta, time::Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Registration,
    Deregistration,
    VoiceCall,
    VideoCall,
    EmergencyCall,
    SmsMessage,
    SubscribeNotify,
    Options,
    Refer,
    Info,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Init,
    Calling,
    Proceeding,
    Early,
    Confirmed,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Trying,
    Proceeding,
    Completed,
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub meta: MessageMeta,
    pub method: Option<String>,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct SipTransaction {
    pub branch: String,
    pub method: String,
    pub state: TransactionState,
    pub request: Option<RecordedMessage>,
    pub responses: Vec<RecordedMessage>,
}

impl SipTransaction {
    fn new(branch: String, method: String) -> SipTransaction {
        SipTransaction { branch, method, state: TransactionState::Trying, request: None, responses: Vec::new() }
    }

    fn on_request(&mut self, recorded: RecordedMessage) {
        self.request = Some(recorded);
    }

    fn on_response(&mut self, recorded: RecordedMessage) {
        let is_invite = self.method.eq_ignore_ascii_case("INVITE");
        if let Some(code) = recorded.status_code {
            self.state = match (is_invite, code) {
                (_, 100..=199) => TransactionState::Proceeding,
                (true, 200..=299) => TransactionState::Confirmed,
                (true, _) => TransactionState::Completed,
                (false, _) => TransactionState::Completed,
            };
        }
        self.responses.push(recorded);
    }
}

/// Key uniquely identifying a dialog once its to-tag is known; while early,
/// `to_tag` is `None` and the key only distinguishes by from-tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SipDialog {
    pub id: DialogId,
    pub state: DialogState,
    pub transactions: HashMap<String, SipTransaction>,
    pub forked_dialogs: Vec<DialogId>,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
}

impl SipDialog {
    fn transaction_key(branch: &str, method: &str) -> String {
        format!("{branch}:{}", method.to_ascii_uppercase())
    }
}

#[derive(Debug, Clone)]
pub struct SipSession {
    pub call_id: String,
    pub dialogs: HashMap<DialogId, SipDialog>,
    /// Early dialogs are looked up by from-tag alone until a to-tag arrives;
    /// this maps from-tag to the current (possibly early) dialog id.
    by_from_tag: HashMap<String, DialogId>,
    pub session_type: SessionType,
    pub caller: Option<String>,
    pub callee: Option<String>,
    pub ue_ips: Vec<IpAddr>,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    first_request_method: Option<String>,
    expires_zero_seen: bool,
    invite_had_video: bool,
    invite_had_audio: bool,
    request_uri_is_emergency: bool,
}

impl SipSession {
    fn new(call_id: String, now: Timestamp) -> SipSession {
        SipSession {
            call_id,
            dialogs: HashMap::new(),
            by_from_tag: HashMap::new(),
            session_type: SessionType::Unknown,
            caller: None,
            callee: None,
            ue_ips: Vec::new(),
            first_seen: now,
            last_seen: now,
            first_request_method: None,
            expires_zero_seen: false,
            invite_had_video: false,
            invite_had_audio: false,
            request_uri_is_emergency: false,
        }
    }

    /// Classifies the session type from everything observed so far (spec
    /// §4.F finalisation rule).
    fn classify(&self) -> SessionType {
        match self.first_request_method.as_deref() {
            Some("REGISTER") if self.expires_zero_seen => SessionType::Deregistration,
            Some("REGISTER") => SessionType::Registration,
            Some("MESSAGE") => SessionType::SmsMessage,
            Some("SUBSCRIBE") | Some("NOTIFY") => SessionType::SubscribeNotify,
            Some("OPTIONS") => SessionType::Options,
            Some("REFER") => SessionType::Refer,
            Some("INFO") => SessionType::Info,
            Some("INVITE") if self.request_uri_is_emergency => SessionType::EmergencyCall,
            Some("INVITE") if self.invite_had_video => SessionType::VideoCall,
            Some("INVITE") if self.invite_had_audio => SessionType::VoiceCall,
            _ => SessionType::Unknown,
        }
    }
}

/// Normalises a SIP party header value into digits-only MSISDN, keeping a
/// leading `+` only for emergency numbers (spec §4.F).
pub fn normalize_msisdn(raw: &str, emergency: bool) -> String {
    let uri_part = raw.find("sip:").map(|p| &raw[p + 4..]).unwrap_or(raw);
    let user = uri_part.split(['@', ';', '>']).next().unwrap_or(uri_part);
    let mut digits: String = user.chars().filter(|c| c.is_ascii_digit()).collect();
    if emergency && user.trim_start().starts_with('+') {
        digits.insert(0, '+');
    }
    digits
}

fn is_emergency_uri(uri: &str) -> bool {
    uri.contains("urn:service:sos")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub sessions_created: u64,
    pub dialogs_created: u64,
    pub forks_detected: u64,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SipSession>,
    stats: Stats,
}

/// Coarse-locked per spec §5: one mutex covers lookup, session update, and
/// dialog/transaction index maintenance for the whole correlator instance.
pub struct SipCorrelator {
    inner: Mutex<Inner>,
}

impl Default for SipCorrelator {
    fn default() -> SipCorrelator {
        SipCorrelator::new()
    }
}

impl SipCorrelator {
    pub fn new() -> SipCorrelator {
        SipCorrelator { inner: Mutex::new(Inner::default()) }
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().expect("sip correlator mutex poisoned").stats
    }

    /// Processes one SIP message against its session/dialog/transaction.
    pub fn process_message(&self, meta: &MessageMeta, msg: &SipMessage) {
        let Some(call_id) = msg.call_id().map(str::to_string) else { return };
        let mut guard = self.inner.lock().expect("sip correlator mutex poisoned");
        let stats_new_session = !guard.sessions.contains_key(&call_id);
        let session = guard.sessions.entry(call_id.clone()).or_insert_with(|| SipSession::new(call_id, meta.timestamp));
        if stats_new_session {
            guard.stats.sessions_created += 1;
        }
        apply_message(session, &mut guard.stats, meta, msg);
    }

    /// Returns a snapshot of the session's classification and parties once
    /// the caller considers it complete (e.g. on BYE, or at enumeration
    /// time for the export layer).
    pub fn finalize(&self, call_id: &str) -> Option<(SessionType, Option<String>, Option<String>, Vec<IpAddr>)> {
        let guard = self.inner.lock().expect("sip correlator mutex poisoned");
        let session = guard.sessions.get(call_id)?;
        Some((session.classify(), session.caller.clone(), session.callee.clone(), session.ue_ips.clone()))
    }

    pub fn dialog_state(&self, call_id: &str, dialog: &DialogId) -> Option<DialogState> {
        let guard = self.inner.lock().expect("sip correlator mutex poisoned");
        guard.sessions.get(call_id)?.dialogs.get(dialog).map(|d| d.state)
    }
}

fn apply_message(session: &mut SipSession, stats: &mut Stats, meta: &MessageMeta, msg: &SipMessage) {
    session.last_seen = meta.timestamp;

    let from_tag = msg.from_tag().unwrap_or_default();
    let to_tag = msg.to_tag();

    let dialog_id = locate_or_create_dialog(session, stats, &from_tag, to_tag.clone(), meta.timestamp);

    let (method, status_code) = match msg.method() {
        Some(m) => (Some(m.to_string()), None),
        None => (None, msg.status_code()),
    };
    if session.first_request_method.is_none()
        && let Some(m) = &method
    {
        session.first_request_method = Some(m.clone());
        if m.eq_ignore_ascii_case("INVITE") {
            session.request_uri_is_emergency = msg.request_uri().is_some_and(is_emergency_uri);
        }
    }
    if msg.method().is_some_and(|m| m.eq_ignore_ascii_case("REGISTER")) && msg.expires() == Some(0) {
        session.expires_zero_seen = true;
    }
    if let Some(sdp) = &msg.body {
        session.invite_had_video |= sdp.has_video();
        session.invite_had_audio |= sdp.has_audio();
    }

    if let Some(dialog) = session.dialogs.get_mut(&dialog_id) {
        let branch = msg.top_via_branch().unwrap_or_default();
        let cseq_method = msg.cseq().map(|(_, m)| m).or_else(|| method.clone()).unwrap_or_default();
        let key = SipDialog::transaction_key(&branch, &cseq_method);
        let txn = dialog
            .transactions
            .entry(key)
            .or_insert_with(|| SipTransaction::new(branch.clone(), cseq_method.clone()));
        let recorded = RecordedMessage { meta: *meta, method: method.clone(), status_code };
        if method.is_some() {
            txn.on_request(recorded);
        } else {
            txn.on_response(recorded);
        }
        dialog.last_seen = meta.timestamp;
        update_dialog_state(dialog, method.as_deref(), status_code, to_tag.is_some(), &cseq_method);
    }

    if let Some(m) = &method
        && m.eq_ignore_ascii_case("INVITE")
    {
        if let Some(pai) = msg.p_asserted_identity() {
            session.caller.get_or_insert_with(|| normalize_msisdn(pai, session.request_uri_is_emergency));
        } else if let Some(ppi) = msg.p_preferred_identity() {
            session.caller.get_or_insert_with(|| normalize_msisdn(ppi, session.request_uri_is_emergency));
        } else if let Some(from) = msg.from_display() {
            session.caller.get_or_insert(normalize_msisdn(&from, session.request_uri_is_emergency));
        }
        if let Some(to) = msg.to_display() {
            session.callee.get_or_insert(normalize_msisdn(&to, false));
        }
        if let Some(contact) = msg.contact() {
            extract_ip_from_uri(contact).into_iter().for_each(|ip| push_ue_ip(session, ip));
        }
    }
    if let Some(sdp) = &msg.body
        && let Some(addr) = &sdp.session_connection_address
        && let Ok(ip) = addr.parse::<IpAddr>()
    {
        push_ue_ip(session, ip);
    }
}

fn push_ue_ip(session: &mut SipSession, ip: IpAddr) {
    if !session.ue_ips.contains(&ip) {
        session.ue_ips.push(ip);
    }
}

fn extract_ip_from_uri(contact: &str) -> Option<IpAddr> {
    let at = contact.find('@')?;
    let rest = &contact[at + 1..];
    let end = rest.find([':', '>', ';']).unwrap_or(rest.len());
    rest[..end].parse().ok()
}

fn locate_or_create_dialog(
    session: &mut SipSession,
    stats: &mut Stats,
    from_tag: &str,
    to_tag: Option<String>,
    now: Timestamp,
) -> DialogId {
    if let Some(current) = session.by_from_tag.get(from_tag).cloned() {
        match (&current.to_tag, &to_tag) {
            (None, Some(new_to)) => {
                // First to-tag seen: promote the early dialog's key atomically.
                let mut dialog = session.dialogs.remove(&current).expect("indexed dialog must exist");
                let new_id = DialogId {
                    call_id: current.call_id.clone(),
                    from_tag: from_tag.to_string(),
                    to_tag: Some(new_to.clone()),
                };
                dialog.id = new_id.clone();
                session.dialogs.insert(new_id.clone(), dialog);
                session.by_from_tag.insert(from_tag.to_string(), new_id.clone());
                new_id
            },
            (Some(existing_to), Some(new_to)) if existing_to != new_to => {
                // Fork: a second distinct to-tag for the same (Call-ID, from-tag).
                let forked_id = DialogId {
                    call_id: current.call_id.clone(),
                    from_tag: from_tag.to_string(),
                    to_tag: Some(new_to.clone()),
                };
                let mut forked = SipDialog {
                    id: forked_id.clone(),
                    state: DialogState::Early,
                    transactions: HashMap::new(),
                    forked_dialogs: vec![current.clone()],
                    first_seen: now,
                    last_seen: now,
                };
                if let Some(original) = session.dialogs.get_mut(&current) {
                    original.forked_dialogs.push(forked_id.clone());
                }
                forked.forked_dialogs.push(current.clone());
                session.dialogs.insert(forked_id.clone(), forked);
                session.by_from_tag.insert(from_tag.to_string(), forked_id.clone());
                stats.forks_detected += 1;
                stats.dialogs_created += 1;
                forked_id
            },
            _ => current,
        }
    } else {
        let id = DialogId { call_id: session.call_id.clone(), from_tag: from_tag.to_string(), to_tag };
        session.dialogs.insert(
            id.clone(),
            SipDialog {
                id: id.clone(),
                state: DialogState::Init,
                transactions: HashMap::new(),
                forked_dialogs: Vec::new(),
                first_seen: now,
                last_seen: now,
            },
        );
        session.by_from_tag.insert(from_tag.to_string(), id.clone());
        stats.dialogs_created += 1;
        id
    }
}

fn update_dialog_state(
    dialog: &mut SipDialog,
    method: Option<&str>,
    status_code: Option<u16>,
    has_to_tag: bool,
    cseq_method: &str,
) {
    let is_invite_response = cseq_method.eq_ignore_ascii_case("INVITE");
    match (method, status_code) {
        (Some(m), _) if m.eq_ignore_ascii_case("INVITE") => dialog.state = DialogState::Calling,
        (Some(m), _) if m.eq_ignore_ascii_case("BYE") || m.eq_ignore_ascii_case("CANCEL") => {
            dialog.state = DialogState::Terminated;
        },
        (None, Some(code)) if (100..200).contains(&code) && !has_to_tag => dialog.state = DialogState::Proceeding,
        (None, Some(code)) if (100..200).contains(&code) && has_to_tag => dialog.state = DialogState::Early,
        (None, Some(code)) if (200..300).contains(&code) && is_invite_response => {
            dialog.state = DialogState::Confirmed;
        },
        (None, Some(code)) if code >= 300 && is_invite_response => dialog.state = DialogState::Terminated,
        _ => {},
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn meta(ts: i64) -> MessageMeta {
        MessageMeta {
            timestamp: Timestamp(ts),
            frame_number: 1,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port: 5060,
            dst_port: 5060,
            direction: None,
        }
    }

    fn msg(raw: &str) -> SipMessage {
        SipMessage::parse(raw.replace('\n', "\r\n").as_bytes()).expect("parse")
    }

    #[test]
    fn dialog_promotes_on_to_tag_and_confirms_on_2xx() {
        let corr = SipCorrelator::new();
        let invite = msg(
            "INVITE sip:bob@x SIP/2.0\n\
Call-ID: c1\n\
From: <sip:alice@x>;tag=ft\n\
To: <sip:bob@x>\n\
CSeq: 1 INVITE\n\
Via: SIP/2.0/UDP h;branch=z9hG4bK1\n\
Content-Length: 0\n\n",
        );
        corr.process_message(&meta(0), &invite);
        let ok = msg(
            "SIP/2.0 200 OK\n\
Call-ID: c1\n\
From: <sip:alice@x>;tag=ft\n\
To: <sip:bob@x>;tag=tt\n\
CSeq: 1 INVITE\n\
Via: SIP/2.0/UDP h;branch=z9hG4bK1\n\
Content-Length: 0\n\n",
        );
        corr.process_message(&meta(1), &ok);

        let dialog_id = DialogId { call_id: "c1".into(), from_tag: "ft".into(), to_tag: Some("tt".into()) };
        assert_eq!(corr.dialog_state("c1", &dialog_id), Some(DialogState::Confirmed));
    }

    #[test]
    fn second_distinct_to_tag_is_a_fork() {
        let corr = SipCorrelator::new();
        let invite = msg(
            "INVITE sip:bob@x SIP/2.0\n\
Call-ID: c2\n\
From: <sip:alice@x>;tag=ft\n\
To: <sip:bob@x>\n\
CSeq: 1 INVITE\n\
Via: SIP/2.0/UDP h;branch=z9hG4bK2\n\
Content-Length: 0\n\n",
        );
        corr.process_message(&meta(0), &invite);
        let ringing1 = msg(
            "SIP/2.0 180 Ringing\nCall-ID: c2\nFrom: <sip:alice@x>;tag=ft\nTo: <sip:bob@x>;tag=t1\nCSeq: 1 INVITE\nVia: SIP/2.0/UDP h;branch=z9hG4bK2\nContent-Length: 0\n\n",
        );
        let ringing2 = msg(
            "SIP/2.0 180 Ringing\nCall-ID: c2\nFrom: <sip:alice@x>;tag=ft\nTo: <sip:bob@x>;tag=t2\nCSeq: 1 INVITE\nVia: SIP/2.0/UDP h;branch=z9hG4bK2\nContent-Length: 0\n\n",
        );
        corr.process_message(&meta(1), &ringing1);
        corr.process_message(&meta(2), &ringing2);
        assert_eq!(corr.stats().forks_detected, 1);
    }

    #[test]
    fn normalizes_msisdn_digits_only() {
        assert_eq!(normalize_msisdn("\"Alice\" <sip:+15551234567@x>;tag=1", false), "15551234567");
        assert_eq!(normalize_msisdn("<sip:+911@x>", true), "+911");
    }
}
