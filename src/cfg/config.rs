// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// TCP reassembly limits (spec §4.A).
    pub ingest: IngestConfig,
    /// Correlator/store capacity and retention knobs (spec §4.I/§4.J).
    pub correlation: CorrelationConfig,
    /// Per-protocol decode/correlate enable flags.
    pub protocols: ProtocolConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IngestConfig {
    #[serde(rename = "MaxTcpStreams")]
    /// Upper bound on concurrently tracked TCP streams.
    pub max_tcp_streams: usize,

    #[serde(rename = "MaxTcpBufferPerStream")]
    /// Per-stream out-of-order buffer cap, in bytes.
    pub max_tcp_buffer_per_stream: usize,

    #[serde(rename = "TcpIdleTimeout", with = "serde_secs")]
    /// A stream with no traffic for this long is reclaimed.
    pub tcp_idle_timeout: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CorrelationConfig {
    #[serde(rename = "MaxSubscriberContexts")]
    /// Capacity of the subscriber context store before LRU eviction.
    pub max_subscriber_contexts: usize,

    #[serde(rename = "VolteCallRetention", with = "serde_secs")]
    /// How long a completed/failed/cancelled VoLTE call record is kept
    /// before `cleanup_completed` reclaims it.
    pub volte_call_retention: Duration,

    #[serde(default, rename = "FilterRulesPath", skip_serializing_if = "Option::is_none")]
    /// Optional path to a field-filter rule file (one rule per line, `#`
    /// comments allowed). Absent means every message passes.
    pub filter_rules_path: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ProtocolConfig {
    #[serde(rename = "Sip", default = "default_true")]
    pub sip: bool,
    #[serde(rename = "Gtpv2", default = "default_true")]
    pub gtpv2: bool,
    #[serde(rename = "Diameter", default = "default_true")]
    pub diameter: bool,
    #[serde(rename = "Pfcp", default = "default_true")]
    pub pfcp: bool,
    #[serde(rename = "S1ap", default = "default_true")]
    pub s1ap: bool,
    #[serde(rename = "Rtp", default = "default_true")]
    pub rtp: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ProtocolConfig {
    fn default() -> ProtocolConfig {
        ProtocolConfig { sip: true, gtpv2: true, diameter: true, pfcp: true, s1ap: true, rtp: true }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants; there is nothing to derive here (unlike the
    /// iSCSI negotiation config this is descended from), just bounds
    /// checking on capacity knobs.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.ingest.max_tcp_streams >= 1, "MaxTcpStreams must be >= 1");
        ensure!(self.ingest.max_tcp_buffer_per_stream >= 1, "MaxTcpBufferPerStream must be >= 1");
        ensure!(self.correlation.max_subscriber_contexts >= 1, "MaxSubscriberContexts must be >= 1");
        if let Some(path) = &self.correlation.filter_rules_path {
            ensure!(!path.is_empty(), "FilterRulesPath must not be empty when present");
        }
        Ok(())
    }
}

/// Serde helper for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_yaml() {
        let yaml = r#"
ingest:
  MaxTcpStreams: 4096
  MaxTcpBufferPerStream: 1048576
  TcpIdleTimeout: 300
correlation:
  MaxSubscriberContexts: 100000
  VolteCallRetention: 60
protocols: {}
"#;
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate_and_normalize().expect("valid");
        assert_eq!(cfg.ingest.max_tcp_streams, 4096);
        assert!(cfg.protocols.sip);
        assert_eq!(cfg.correlation.volte_call_retention, Duration::from_secs(60));
    }

    #[test]
    fn rejects_zero_capacity() {
        let mut cfg = Config {
            ingest: IngestConfig {
                max_tcp_streams: 0,
                max_tcp_buffer_per_stream: 1,
                tcp_idle_timeout: Duration::from_secs(1),
            },
            correlation: CorrelationConfig {
                max_subscriber_contexts: 1,
                volte_call_retention: Duration::from_secs(1),
                filter_rules_path: None,
            },
            protocols: ProtocolConfig::default(),
        };
        assert!(cfg.validate_and_normalize().is_err());
    }
}
