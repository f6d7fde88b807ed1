// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A single timestamp representation used end-to-end.
//!
//! The original mixed `system_clock::time_point`, raw `double` seconds, and
//! `uint64` milliseconds across modules, which leaked overflow bugs at the
//! export boundary. This crate picks one representation — microseconds since
//! the Unix epoch, signed — and converts only where a caller needs a
//! `chrono::DateTime` for display.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Microseconds since the Unix epoch. `0` is used as "unset" by convention in
/// `Option<Timestamp>` fields throughout the crate, never as a valid
/// standalone sentinel — callers should use `Option` rather than a magic
/// zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    pub fn from_millis(millis: i64) -> Self {
        Timestamp(millis.saturating_mul(1_000))
    }

    pub fn micros(self) -> i64 {
        self.0
    }

    /// Difference in milliseconds, `self - earlier`. Negative if `self`
    /// precedes `earlier`.
    pub fn delta_ms(self, earlier: Timestamp) -> i64 {
        (self.0 - earlier.0) / 1_000
    }

    pub fn to_chrono(self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_micros(self.0).unwrap_or_default()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_chrono().to_rfc3339())
    }
}
