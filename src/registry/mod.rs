// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Field Registry & Filter: a process-wide, dotted-key named-field view over
//! any decoded message, plus rule-based accept/drop evaluation. Reshaped per
//! the "global singletons" design note as a `once_cell::sync::Lazy` built
//! once from a static extractor table, rather than a value threaded through
//! every call site — the key set is fixed at compile time, so there is no
//! construction-order hazard to begin with.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::message::ParsedMessage;

/// The one value shape every extractor returns, whatever the source field's
/// native type. Cross-protocol safety (spec §4.E): a key whose tag does not
/// match the message returns a type-appropriate zero value, never `None`
/// and never a panic.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Int(i64),
    Bool(bool),
    Float(f64),
}

impl FieldValue {
    fn zero_str() -> Self {
        FieldValue::Str(String::new())
    }

    fn zero_int() -> Self {
        FieldValue::Int(0)
    }

    fn zero_bool() -> Self {
        FieldValue::Bool(false)
    }
}

type Extractor = fn(&ParsedMessage) -> FieldValue;

static REGISTRY: Lazy<HashMap<&'static str, Extractor>> = Lazy::new(build_registry);

fn build_registry() -> HashMap<&'static str, Extractor> {
    let mut m: HashMap<&'static str, Extractor> = HashMap::new();

    m.insert("sip.call_id", |msg| match msg {
        ParsedMessage::Sip(s) => FieldValue::Str(s.call_id().unwrap_or_default().to_string()),
        _ => FieldValue::zero_str(),
    });
    m.insert("sip.method", |msg| match msg {
        ParsedMessage::Sip(s) => FieldValue::Str(s.method().unwrap_or_default().to_string()),
        _ => FieldValue::zero_str(),
    });
    m.insert("sip.status_code", |msg| match msg {
        ParsedMessage::Sip(s) => FieldValue::Int(s.status_code().map(i64::from).unwrap_or_default()),
        _ => FieldValue::zero_int(),
    });
    m.insert("sip.from_tag", |msg| match msg {
        ParsedMessage::Sip(s) => FieldValue::Str(s.from_tag().unwrap_or_default()),
        _ => FieldValue::zero_str(),
    });
    m.insert("sip.to_tag", |msg| match msg {
        ParsedMessage::Sip(s) => FieldValue::Str(s.to_tag().unwrap_or_default()),
        _ => FieldValue::zero_str(),
    });
    m.insert("sip.has_sdp", |msg| match msg {
        ParsedMessage::Sip(s) => FieldValue::Bool(s.body.is_some()),
        _ => FieldValue::zero_bool(),
    });

    m.insert("diameter.session_id", |msg| match msg {
        ParsedMessage::Diameter(d) => FieldValue::Str(d.session_id().unwrap_or_default()),
        _ => FieldValue::zero_str(),
    });
    m.insert("diameter.application_id", |msg| match msg {
        ParsedMessage::Diameter(d) => FieldValue::Int(i64::from(d.application_id)),
        _ => FieldValue::zero_int(),
    });
    m.insert("diameter.result_code", |msg| match msg {
        ParsedMessage::Diameter(d) => FieldValue::Int(d.result_code().map(i64::from).unwrap_or_default()),
        _ => FieldValue::zero_int(),
    });
    m.insert("diameter.is_request", |msg| match msg {
        ParsedMessage::Diameter(d) => FieldValue::Bool(d.is_request()),
        _ => FieldValue::zero_bool(),
    });
    m.insert("diameter.imsi", |msg| match msg {
        ParsedMessage::Diameter(d) => FieldValue::Str(super::decode::diameter::apps::imsi(d).unwrap_or_default()),
        _ => FieldValue::zero_str(),
    });

    m.insert("gtpv2.imsi", |msg| match msg {
        ParsedMessage::Gtpv2(g) => FieldValue::Str(g.imsi().unwrap_or_default()),
        _ => FieldValue::zero_str(),
    });
    m.insert("gtpv2.msisdn", |msg| match msg {
        ParsedMessage::Gtpv2(g) => FieldValue::Str(g.msisdn().unwrap_or_default()),
        _ => FieldValue::zero_str(),
    });
    m.insert("gtpv2.apn", |msg| match msg {
        ParsedMessage::Gtpv2(g) => FieldValue::Str(g.apn().unwrap_or_default()),
        _ => FieldValue::zero_str(),
    });
    m.insert("gtpv2.teid", |msg| match msg {
        ParsedMessage::Gtpv2(g) => FieldValue::Int(i64::from(g.teid.unwrap_or(0))),
        _ => FieldValue::zero_int(),
    });
    m.insert("gtpv2.cause", |msg| match msg {
        ParsedMessage::Gtpv2(g) => FieldValue::Int(i64::from(g.cause().unwrap_or(0))),
        _ => FieldValue::zero_int(),
    });
    m.insert("gtpv2.message_type", |msg| match msg {
        ParsedMessage::Gtpv2(g) => FieldValue::Int(i64::from(g.message_type)),
        _ => FieldValue::zero_int(),
    });

    m.insert("rtp.ssrc", |msg| match msg {
        ParsedMessage::Rtp(r) => FieldValue::Int(i64::from(r.ssrc)),
        _ => FieldValue::zero_int(),
    });
    m.insert("rtp.payload_type", |msg| match msg {
        ParsedMessage::Rtp(r) => FieldValue::Int(i64::from(r.payload_type)),
        _ => FieldValue::zero_int(),
    });
    m.insert("rtp.sequence_number", |msg| match msg {
        ParsedMessage::Rtp(r) => FieldValue::Int(i64::from(r.sequence_number)),
        _ => FieldValue::zero_int(),
    });

    m.insert("s1ap.procedure_code", |msg| match msg {
        ParsedMessage::S1ap(s) => FieldValue::Int(i64::from(s.procedure_code)),
        _ => FieldValue::zero_int(),
    });
    m.insert("s1ap.imsi", |msg| match msg {
        ParsedMessage::S1ap(s) => FieldValue::Str(s.imsi().unwrap_or_default()),
        _ => FieldValue::zero_str(),
    });

    m.insert("pfcp.seid", |msg| match msg {
        ParsedMessage::Pfcp(p) => FieldValue::Int(p.seid.map(|v| v as i64).unwrap_or_default()),
        _ => FieldValue::zero_int(),
    });
    m.insert("pfcp.cause", |msg| match msg {
        ParsedMessage::Pfcp(p) => FieldValue::Int(p.cause.map(i64::from).unwrap_or_default()),
        _ => FieldValue::zero_int(),
    });

    m
}

/// Looks up `key` and evaluates it against `message`. Unknown keys return
/// `None` (a filter rule referencing a typo'd key never matches, it doesn't
/// panic) — distinct from a known key on the wrong protocol, which yields a
/// zero value per the cross-protocol-safety contract.
pub fn get(message: &ParsedMessage, key: &str) -> Option<FieldValue> {
    REGISTRY.get(key).map(|extractor| extractor(message))
}

/// A single `field OP literal` filter rule.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRule {
    pub field_key: String,
    pub op: Op,
    pub value: FieldValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl Op {
    fn from_token(tok: &str) -> Option<Op> {
        match tok {
            "==" => Some(Op::Eq),
            "!=" => Some(Op::Ne),
            ">" => Some(Op::Gt),
            "<" => Some(Op::Lt),
            ">=" => Some(Op::Ge),
            "<=" => Some(Op::Le),
            _ => None,
        }
    }
}

/// Infers the literal's type: integer if it parses as `i64`, float if it
/// parses as `f64` and contains a `.`, `true`/`false` as bool, otherwise a
/// string (optionally dequoted).
fn parse_literal(raw: &str) -> FieldValue {
    let raw = raw.trim();
    if raw == "true" || raw == "false" {
        return FieldValue::Bool(raw == "true");
    }
    if raw.contains('.') {
        if let Ok(f) = raw.parse::<f64>() {
            return FieldValue::Float(f);
        }
    } else if let Ok(i) = raw.parse::<i64>() {
        return FieldValue::Int(i);
    }
    let unquoted = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(raw);
    FieldValue::Str(unquoted.to_string())
}

impl FilterRule {
    /// Parses a single rule of the form `field.key OP literal`.
    pub fn parse(rule: &str) -> Option<FilterRule> {
        let rule = rule.trim();
        for op_tok in ["==", "!=", ">=", "<=", ">", "<"] {
            if let Some(pos) = rule.find(op_tok) {
                let field_key = rule[..pos].trim().to_string();
                let op = Op::from_token(op_tok)?;
                let value = parse_literal(&rule[pos + op_tok.len()..]);
                return Some(FilterRule { field_key, op, value });
            }
        }
        None
    }

    fn matches(&self, message: &ParsedMessage) -> bool {
        let Some(actual) = get(message, &self.field_key) else { return false };
        compare(&actual, self.op, &self.value)
    }
}

fn compare(actual: &FieldValue, op: Op, literal: &FieldValue) -> bool {
    use FieldValue::*;
    match (actual, literal) {
        (Int(a), Int(b)) => compare_ord(*a, *b, op),
        (Float(a), Float(b)) => compare_ord_f64(*a, *b, op),
        (Int(a), Float(b)) => compare_ord_f64(*a as f64, *b, op),
        (Float(a), Int(b)) => compare_ord_f64(*a, *b as f64, op),
        (Bool(a), Bool(b)) => compare_eq(a, b, op),
        (Str(a), Str(b)) => compare_ord_str(a, b, op),
        _ => false,
    }
}

fn compare_eq<T: PartialEq>(a: &T, b: &T, op: Op) -> bool {
    match op {
        Op::Eq => a == b,
        Op::Ne => a != b,
        _ => false,
    }
}

fn compare_ord<T: PartialOrd>(a: T, b: T, op: Op) -> bool {
    match op {
        Op::Eq => a == b,
        Op::Ne => a != b,
        Op::Gt => a > b,
        Op::Lt => a < b,
        Op::Ge => a >= b,
        Op::Le => a <= b,
    }
}

fn compare_ord_f64(a: f64, b: f64, op: Op) -> bool {
    match op {
        Op::Eq => a == b,
        Op::Ne => a != b,
        Op::Gt => a > b,
        Op::Lt => a < b,
        Op::Ge => a >= b,
        Op::Le => a <= b,
    }
}

fn compare_ord_str(a: &str, b: &str, op: Op) -> bool {
    match op {
        Op::Eq => a == b,
        Op::Ne => a != b,
        Op::Gt => a > b,
        Op::Lt => a < b,
        Op::Ge => a >= b,
        Op::Le => a <= b,
    }
}

/// A set of rules with OR semantics: `evaluate(message) = ∃ rule matching`.
/// Whether `true` means drop or keep is the consumer's decision (spec §4.E).
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub rules: Vec<FilterRule>,
}

impl Filter {
    pub fn from_lines(text: &str) -> Filter {
        let rules = text.lines().filter_map(|l| {
            let l = l.trim();
            if l.is_empty() || l.starts_with('#') {
                None
            } else {
                FilterRule::parse(l)
            }
        }).collect();
        Filter { rules }
    }

    pub fn evaluate(&self, message: &ParsedMessage) -> bool {
        self.rules.iter().any(|r| r.matches(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::sip::SipMessage;

    fn sip_invite() -> ParsedMessage {
        let raw = b"INVITE sip:bob@x SIP/2.0\r\nCall-ID: abc\r\nContent-Length: 0\r\n\r\n";
        ParsedMessage::Sip(SipMessage::parse(raw).unwrap())
    }

    #[test]
    fn extracts_known_field() {
        let msg = sip_invite();
        assert_eq!(get(&msg, "sip.call_id"), Some(FieldValue::Str("abc".to_string())));
    }

    #[test]
    fn cross_protocol_returns_zero_not_panic() {
        let msg = sip_invite();
        assert_eq!(get(&msg, "gtpv2.imsi"), Some(FieldValue::zero_str()));
    }

    #[test]
    fn unknown_key_returns_none() {
        let msg = sip_invite();
        assert_eq!(get(&msg, "nonexistent.key"), None);
    }

    #[test]
    fn filter_rule_matches_equality() {
        let msg = sip_invite();
        let filter = Filter::from_lines("sip.call_id == abc");
        assert!(filter.evaluate(&msg));
    }

    #[test]
    fn filter_rule_type_inference() {
        let rule = FilterRule::parse("diameter.result_code >= 2000").unwrap();
        assert_eq!(rule.value, FieldValue::Int(2000));
        assert_eq!(rule.op, Op::Ge);
    }
}
