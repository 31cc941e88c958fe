// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    address::{ANONYMOUS_NODE_ID, address_from_string},
    frame::{HEADER_LEN, MIN_MTU_PAYLOAD},
};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Transport-wide parameters (spec §6.4).
    pub transport: TransportSection,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransportSection {
    #[serde(rename = "LocalNodeId", default)]
    /// Assigned node-ID, or omitted/absent for an anonymous node.
    pub local_node_id: Option<u16>,

    #[serde(rename = "Interfaces")]
    /// 1 to 3 local IPv4 addresses, one per redundant interface.
    pub interfaces: Vec<String>,

    #[serde(rename = "MtuBytes", default = "default_mtu_bytes")]
    /// Payload capacity per datagram, not counting the 24-byte header.
    pub mtu_bytes: usize,

    #[serde(rename = "TxQueueCapacityPerInterface", default = "default_tx_queue_capacity")]
    /// Maximum queued-but-unsent datagrams per interface before MemoryError.
    pub tx_queue_capacity_per_interface: usize,

    #[serde(rename = "TransferIdTimeoutMs", with = "serde_millis", default = "default_transfer_id_timeout")]
    /// How long a partially-reassembled transfer is kept before being
    /// abandoned.
    pub transfer_id_timeout: Duration,

    #[serde(rename = "RxPayloadArenaBytes", default = "default_rx_payload_arena_bytes")]
    /// Upper bound on one reassembled transfer's payload size.
    pub rx_payload_arena_bytes: usize,

    #[serde(rename = "SessionArenaCapacity", default = "default_session_arena_capacity")]
    /// Expected number of concurrently open sessions, used to size the
    /// session registries up front.
    pub session_arena_capacity: usize,
}

fn default_mtu_bytes() -> usize {
    1200
}

fn default_tx_queue_capacity() -> usize {
    64
}

fn default_transfer_id_timeout() -> Duration {
    crate::session::input::DEFAULT_TRANSFER_ID_TIMEOUT
}

fn default_rx_payload_arena_bytes() -> usize {
    65536
}

fn default_session_arena_capacity() -> usize {
    32
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and resolves derived fields (spec §4.10).
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        let t = &self.transport;

        ensure!(
            !t.interfaces.is_empty() && t.interfaces.len() <= 3,
            "Interfaces must list between 1 and 3 addresses, got {}",
            t.interfaces.len()
        );
        for iface in &t.interfaces {
            let addr = address_from_string(iface);
            ensure!(
                !addr.is_unspecified(),
                "interface address {iface:?} resolved to 0.0.0.0"
            );
        }

        if let Some(id) = t.local_node_id {
            ensure!(
                id != ANONYMOUS_NODE_ID,
                "LocalNodeId must not be the anonymous sentinel {ANONYMOUS_NODE_ID}"
            );
        }

        ensure!(
            t.mtu_bytes >= HEADER_LEN + MIN_MTU_PAYLOAD,
            "MtuBytes must be at least {} (header + minimum payload)",
            HEADER_LEN + MIN_MTU_PAYLOAD
        );
        ensure!(
            t.tx_queue_capacity_per_interface >= 1,
            "TxQueueCapacityPerInterface must be >= 1"
        );
        ensure!(
            t.rx_payload_arena_bytes >= MIN_MTU_PAYLOAD,
            "RxPayloadArenaBytes must be able to hold at least one frame"
        );
        ensure!(
            t.session_arena_capacity >= 1,
            "SessionArenaCapacity must be >= 1"
        );

        Ok(())
    }
}

/// Serde helper for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            transport: TransportSection {
                local_node_id: Some(42),
                interfaces: vec!["127.0.0.1".to_string()],
                mtu_bytes: default_mtu_bytes(),
                tx_queue_capacity_per_interface: default_tx_queue_capacity(),
                transfer_id_timeout: default_transfer_id_timeout(),
                rx_payload_arena_bytes: default_rx_payload_arena_bytes(),
                session_arena_capacity: default_session_arena_capacity(),
            },
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        let mut cfg = sample();
        cfg.validate_and_normalize().expect("valid");
    }

    #[test]
    fn rejects_too_many_interfaces() {
        let mut cfg = sample();
        cfg.transport.interfaces = vec![
            "127.0.0.1".to_string(),
            "127.0.0.2".to_string(),
            "127.0.0.3".to_string(),
            "127.0.0.4".to_string(),
        ];
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn rejects_anonymous_sentinel_as_local_node_id() {
        let mut cfg = sample();
        cfg.transport.local_node_id = Some(ANONYMOUS_NODE_ID);
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn rejects_mtu_below_floor() {
        let mut cfg = sample();
        cfg.transport.mtu_bytes = 16;
        assert!(cfg.validate_and_normalize().is_err());
    }

    #[test]
    fn parses_yaml_with_defaults_applied() {
        let yaml = "transport:\n  Interfaces: [\"127.0.0.1\"]\n";
        let mut cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        cfg.validate_and_normalize().expect("valid");
        assert_eq!(cfg.transport.mtu_bytes, default_mtu_bytes());
        assert!(cfg.transport.local_node_id.is_none());
    }
}
