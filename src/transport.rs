// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transport coordinator (spec §4.9): owns the local node-ID and interface
//! set, hands out session objects, and drives the single-threaded
//! cooperative event loop.

use std::{
    cell::Cell,
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    address::{NodeId, address_from_string, multicast_group_for_message, multicast_group_for_service},
    cfg::config::Config,
    error::{TransportError, TransportResult},
    frame::{HEADER_LEN, MIN_MTU_PAYLOAD},
    queue::TxQueue,
    session::{
        input::{InputGroup, InputSession},
        output::{OutputSession, OutputTarget, drain_one},
        registry::SessionRegistry,
        specifier::{DataSpecifier, InputSessionSpecifier, OutputSessionSpecifier, PayloadMetadata, Role},
    },
    socket::CyphalSocket,
    stats::{Counters, Stats},
};

/// Parameters a [`Transport`] is constructed with (spec §6.1, §6.4).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub local_node_id: NodeId,
    /// 1 to 3 local addresses, one per redundant interface.
    pub interface_addresses: Vec<Ipv4Addr>,
    pub mtu_payload_capacity: usize,
    pub tx_queue_capacity_per_interface: usize,
    pub transfer_id_timeout: Duration,
    pub rx_payload_extent_bytes: usize,
    pub session_arena_capacity: usize,
}

impl TransportConfig {
    /// Derives a `TransportConfig` from a loaded [`Config`] (spec §4.10).
    pub fn from_cfg(cfg: &Config) -> TransportResult<Self> {
        let t = &cfg.transport;
        let local_node_id = match t.local_node_id {
            Some(id) => NodeId::new(id)?,
            None => NodeId::ANONYMOUS,
        };
        let interface_addresses = t.interfaces.iter().map(|s| address_from_string(s)).collect();
        Ok(Self {
            local_node_id,
            interface_addresses,
            mtu_payload_capacity: t.mtu_bytes.saturating_sub(HEADER_LEN),
            tx_queue_capacity_per_interface: t.tx_queue_capacity_per_interface,
            transfer_id_timeout: t.transfer_id_timeout,
            rx_payload_extent_bytes: t.rx_payload_arena_bytes,
            session_arena_capacity: t.session_arena_capacity,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Uninitialized,
    Initialized,
    Closed,
}

/// Computes the multicast group an output session of `specifier` publishes
/// to (spec §3.2).
fn destination_group(specifier: &OutputSessionSpecifier) -> TransportResult<Ipv4Addr> {
    match specifier.0.data_specifier.role {
        Role::Message => Ok(multicast_group_for_message(specifier.0.data_specifier.id)),
        Role::ServiceProvider | Role::ServiceConsumer => {
            let remote = specifier.0.remote_node_id.ok_or_else(|| {
                TransportError::InvalidStateError("service output requires a remote node-id".into())
            })?;
            Ok(multicast_group_for_service(remote))
        },
    }
}

/// The coordinator every publish/subscribe and request/response operation
/// goes through. One `Transport` owns one local node-ID and one fixed set
/// of redundant interfaces for its lifetime.
pub struct Transport {
    config: TransportConfig,
    state: Cell<LifecycleState>,
    output_sessions: SessionRegistry<OutputSessionSpecifier, OutputSession>,
    output_targets: SessionRegistry<(usize, Ipv4Addr), OutputTarget>,
    input_sessions: SessionRegistry<InputSessionSpecifier, InputSession>,
    input_groups: SessionRegistry<Ipv4Addr, InputGroup>,
    stats: Arc<Counters>,
}

impl Transport {
    pub fn new(config: TransportConfig) -> TransportResult<Self> {
        if config.interface_addresses.is_empty() || config.interface_addresses.len() > 3 {
            return Err(TransportError::InvalidArgumentError(format!(
                "expected 1..=3 interfaces, got {}",
                config.interface_addresses.len()
            )));
        }
        Ok(Self {
            config,
            state: Cell::new(LifecycleState::Uninitialized),
            output_sessions: SessionRegistry::new(),
            output_targets: SessionRegistry::new(),
            input_sessions: SessionRegistry::new(),
            input_groups: SessionRegistry::new(),
            stats: Arc::new(Counters::default()),
        })
    }

    pub fn local_node_id(&self) -> NodeId {
        self.config.local_node_id
    }

    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Transitions Uninitialized -> Initialized. Sessions cannot be created
    /// before this call (spec §4.9).
    pub fn initialize(&self) -> TransportResult<()> {
        match self.state.get() {
            LifecycleState::Uninitialized => {
                if self.config.mtu_payload_capacity < MIN_MTU_PAYLOAD {
                    return Err(TransportError::InvalidArgumentError(format!(
                        "mtu_payload_capacity {} is below the minimum of {} (header is {} bytes)",
                        self.config.mtu_payload_capacity, MIN_MTU_PAYLOAD, HEADER_LEN
                    )));
                }
                self.state.set(LifecycleState::Initialized);
                debug!(node_id = %self.config.local_node_id, "transport initialized");
                Ok(())
            },
            LifecycleState::Initialized => {
                Err(TransportError::InvalidStateError("already initialized".into()))
            },
            LifecycleState::Closed => Err(TransportError::ResourceClosedError),
        }
    }

    /// Idempotent: closes every session and socket owned by this transport.
    pub fn close(&self) {
        if self.state.get() == LifecycleState::Closed {
            return;
        }
        self.state.set(LifecycleState::Closed);
        for session in self.output_sessions.values() {
            session.close();
        }
        for session in self.input_sessions.values() {
            session.close();
        }
        for target in self.output_targets.values() {
            target.socket.close();
        }
        for group in self.input_groups.values() {
            group.close();
        }
    }

    fn require_initialized(&self) -> TransportResult<()> {
        match self.state.get() {
            LifecycleState::Uninitialized => Err(TransportError::UninitializedError),
            LifecycleState::Initialized => Ok(()),
            LifecycleState::Closed => Err(TransportError::ResourceClosedError),
        }
    }

    /// Returns (creating if necessary) the output session for `data_specifier`
    /// addressed to `remote_node_id` (spec §4.6, §4.7).
    pub fn get_output_session(
        &self,
        data_specifier: DataSpecifier,
        remote_node_id: Option<u16>,
    ) -> TransportResult<Arc<OutputSession>> {
        self.require_initialized()?;
        if !data_specifier.is_message() && self.config.local_node_id.is_anonymous() {
            return Err(TransportError::InvalidArgumentError(
                "an anonymous transport cannot open a service output session".into(),
            ));
        }
        let specifier = OutputSessionSpecifier::new(data_specifier, remote_node_id)?;
        let group = destination_group(&specifier)?;
        let config = &self.config;

        self.output_sessions.get_or_try_insert_with(specifier, || {
            let mut targets = Vec::with_capacity(config.interface_addresses.len());
            for (index, local_addr) in config.interface_addresses.iter().enumerate() {
                let target = self.output_targets.get_or_try_insert_with((index, group), || {
                    let socket = Arc::new(CyphalSocket::bind_output(*local_addr, group)?);
                    Ok(OutputTarget {
                        socket,
                        queue: std::cell::RefCell::new(TxQueue::new(
                            config.tx_queue_capacity_per_interface,
                        )),
                    })
                })?;
                targets.push(target);
            }
            OutputSession::new(
                specifier,
                PayloadMetadata { extent_bytes: config.rx_payload_extent_bytes },
                config.local_node_id,
                targets,
            )
        })
    }

    /// Returns (creating if necessary) the input session for `data_specifier`,
    /// optionally restricted to `remote_node_id` (spec §4.6, §4.8).
    pub fn get_input_session(
        &self,
        data_specifier: DataSpecifier,
        remote_node_id: Option<u16>,
    ) -> TransportResult<Arc<InputSession>> {
        self.require_initialized()?;
        let specifier = InputSessionSpecifier::new(data_specifier, remote_node_id);
        let group = self.input_group_address(&specifier)?;
        let config = &self.config;

        self.input_groups.get_or_try_insert_with(group, || {
            let mut sockets = Vec::with_capacity(config.interface_addresses.len());
            for local_addr in &config.interface_addresses {
                sockets.push(Arc::new(CyphalSocket::bind_input(*local_addr, group)?));
            }
            InputGroup::new(sockets)
        })?;

        let session = self.input_sessions.get_or_try_insert_with(specifier, || {
            InputSession::new(
                specifier,
                PayloadMetadata { extent_bytes: config.rx_payload_extent_bytes },
                self.stats.clone(),
            )
        })?;
        session.set_transfer_id_timeout(config.transfer_id_timeout);
        Ok(session)
    }

    fn input_group_address(&self, specifier: &InputSessionSpecifier) -> TransportResult<Ipv4Addr> {
        match specifier.0.data_specifier.role {
            Role::Message => Ok(multicast_group_for_message(specifier.0.data_specifier.id)),
            Role::ServiceProvider | Role::ServiceConsumer => {
                if self.config.local_node_id.is_anonymous() {
                    return Err(TransportError::InvalidStateError(
                        "service input sessions require a non-anonymous local node-id".into(),
                    ));
                }
                Ok(multicast_group_for_service(self.config.local_node_id.get()))
            },
        }
    }

    fn distinct_input_group_addresses(&self) -> Vec<Ipv4Addr> {
        let mut groups = Vec::new();
        for session in self.input_sessions.values() {
            if let Ok(addr) = self.input_group_address(&session.specifier())
                && !groups.contains(&addr)
            {
                groups.push(addr);
            }
        }
        groups
    }

    fn listeners_for_group(&self, group: Ipv4Addr) -> Vec<Arc<InputSession>> {
        self.input_sessions
            .values()
            .into_iter()
            .filter(|session| {
                self.input_group_address(&session.specifier())
                    .map(|addr| addr == group)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Activates response output sessions for requests a service provider's
    /// input session just reassembled (spec §4.7: a response session is
    /// inactive until a matching request is observed). The response output
    /// session must already exist, addressed to the request's source node.
    fn activate_pending_responses(&self) {
        for session in self.input_sessions.values() {
            if session.specifier().0.data_specifier.role != Role::ServiceProvider {
                continue;
            }
            let Some((Some(remote), transfer_id)) = session.take_last_finished() else {
                continue;
            };
            let response_ds = session.specifier().0.data_specifier;
            let Ok(response_specifier) = OutputSessionSpecifier::new(response_ds, Some(remote))
            else {
                continue;
            };
            if let Some(response_session) = self.output_sessions.get(&response_specifier) {
                response_session.record_matching_request(transfer_id);
            }
        }
    }

    /// Drains pending TX queues and services every input group once per
    /// iteration, for up to `max_duration` (spec §4.9). Returns early if the
    /// transport has no sessions at all; otherwise keeps servicing input
    /// groups with a fair share of the remaining budget until the deadline
    /// elapses.
    pub async fn run_for(&self, max_duration: Duration) -> TransportResult<()> {
        self.require_initialized()?;
        let deadline = Instant::now() + max_duration;

        if self.output_targets.is_empty() && self.input_sessions.is_empty() {
            return Ok(());
        }

        loop {
            for target in self.output_targets.values() {
                drain_one(&target)?;
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let remaining = deadline - now;

            let group_addrs = self.distinct_input_group_addresses();
            if group_addrs.is_empty() {
                tokio::time::sleep(remaining.min(Duration::from_millis(20))).await;
                continue;
            }

            let slice = (remaining / group_addrs.len() as u32).max(Duration::from_millis(1));
            for group_addr in group_addrs {
                let Some(group) = self.input_groups.get(&group_addr) else { continue };
                let listeners = self.listeners_for_group(group_addr);
                match group.service(slice, &listeners).await {
                    Ok(()) | Err(TransportError::Timeout) => self.activate_pending_responses(),
                    Err(e) => return Err(e),
                }
                if Instant::now() >= deadline {
                    return Ok(());
                }
            }
        }
    }
}
