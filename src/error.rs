// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Structured error taxonomy for the correlation engine.
//!
//! Decoders and correlators never propagate errors synchronously up to the
//! caller in the hot path — they discard the offending message, bump a
//! counter, and keep going (see `crate::error` taxonomy policy). These types
//! exist so the discard path still carries a reason, for logging and for the
//! rare spot (config loading, registry construction) where `?` propagation is
//! the right shape.

use thiserror::Error;

/// A single decoder's reason for discarding a message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short: need at least {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },
    #[error("length field lies: declared {declared}, available {available}")]
    LengthMismatch { declared: usize, available: usize },
    #[error("unaligned AVP/IE padding at offset {offset}")]
    AlignmentViolation { offset: usize },
    #[error("unknown enumerant {value:#x} in field {field}")]
    UnknownEnumerant { field: &'static str, value: u64 },
    #[error("malformed {what}: {reason}")]
    Malformed {
        what: &'static str,
        reason: String,
    },
}

/// A correlator could not find (and could not legally create) the
/// session/dialog/call a message refers to.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("no session for key {key} ({protocol})")]
    UnknownSession { protocol: &'static str, key: String },
    #[error("answer references unknown hop-by-hop id {hbh:#x}")]
    UnpairedAnswer { hbh: u32 },
    #[error("index entry for {field} points at a destroyed session")]
    DanglingIndex { field: &'static str },
}

/// NAS security operations: key/algorithm state errors, surfaced to the
/// caller rather than silently discarded, since a failed decrypt/verify is
/// itself an interesting event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NasSecurityError {
    #[error("{alg} ciphering requires a key, none set on this context")]
    MissingEncryptionKey { alg: &'static str },
    #[error("{alg} integrity requires a key, none set on this context")]
    MissingIntegrityKey { alg: &'static str },
    #[error("ciphering algorithm {0} has no implementation")]
    UnsupportedCipher(&'static str),
    #[error("integrity algorithm {0} has no implementation")]
    UnsupportedIntegrity(&'static str),
}

/// Raised only by configuration loading, where `anyhow::Context` propagation
/// is appropriate (outside the per-message hot path).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
