// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Input session (spec §4.8): reassembles multi-frame transfers and
//! deduplicates across redundant interfaces, plus [`InputGroup`], the
//! shared socket/poller bundle one multicast group's redundant interfaces
//! are read through.
//!
//! Two input sessions can legitimately listen on the very same multicast
//! group: a promiscuous and a selective subscriber to one subject, or two
//! service sessions on this node's own service group distinguished only by
//! service-id/role. Binding each session its own socket to that group would
//! split the traffic between them under `SO_REUSEPORT` instead of
//! delivering it to both, so the socket and poller are owned once per
//! group by [`InputGroup`] and the transport fans each received datagram
//! out to every session registered on that group.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, trace};

use crate::{
    address::Priority,
    error::{TransportError, TransportResult},
    frame::{decode_header, transfer_crc, validate_port_id},
    poller::ReadinessPoller,
    session::specifier::{InputSessionSpecifier, PayloadMetadata},
    socket::CyphalSocket,
    stats::{Counters, Stats},
};

/// Default window a partially-reassembled transfer is kept alive for before
/// it is abandoned (spec §3.7, §6.3).
pub const DEFAULT_TRANSFER_ID_TIMEOUT: Duration = Duration::from_secs(2);

/// A transfer delivered to the application.
#[derive(Debug, Clone)]
pub struct InboundTransfer {
    pub source_node_id: Option<u16>,
    pub priority: Priority,
    pub transfer_id: u64,
    pub payload: Vec<u8>,
}

struct PartialTransfer {
    transfer_id: u64,
    priority: Priority,
    expected_frame_index: u32,
    buffer: Vec<u8>,
    last_activity: Instant,
}

#[derive(Default)]
struct SourceState {
    last_delivered_transfer_id: Option<u64>,
    partial: Option<PartialTransfer>,
}

pub struct InputSession {
    specifier: InputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    reassembly: RefCell<HashMap<u16, SourceState>>,
    inbound: RefCell<VecDeque<InboundTransfer>>,
    transfer_id_timeout: Cell<Duration>,
    stats: Arc<Counters>,
    closed: Cell<bool>,
    /// `(source_node_id, transfer_id)` of the most recently reassembled
    /// transfer, consumed once by the transport to auto-activate a matching
    /// response output session for request input sessions (spec §4.7).
    last_finished: Cell<Option<(Option<u16>, u64)>>,
}

impl InputSession {
    pub fn new(
        specifier: InputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        stats: Arc<Counters>,
    ) -> TransportResult<Self> {
        validate_port_id(
            specifier.0.data_specifier.role.transfer_kind(false),
            specifier.0.data_specifier.id,
        )?;
        Ok(Self {
            specifier,
            payload_metadata,
            reassembly: RefCell::new(HashMap::new()),
            inbound: RefCell::new(VecDeque::new()),
            transfer_id_timeout: Cell::new(DEFAULT_TRANSFER_ID_TIMEOUT),
            stats,
            closed: Cell::new(false),
            last_finished: Cell::new(None),
        })
    }

    pub fn specifier(&self) -> InputSessionSpecifier {
        self.specifier
    }

    pub fn payload_metadata(&self) -> PayloadMetadata {
        self.payload_metadata
    }

    pub fn set_transfer_id_timeout(&self, timeout: Duration) {
        self.transfer_id_timeout.set(timeout);
    }

    /// Pops the oldest fully reassembled transfer, if any.
    pub fn receive(&self) -> Option<InboundTransfer> {
        self.inbound.borrow_mut().pop_front()
    }

    pub fn close(&self) {
        self.closed.set(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Snapshot of the transport-wide reassembly counters this session
    /// reports into (spec §3.9/§6.5); shared across every session on the
    /// same transport, not a per-session-only tally.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Takes (clearing) the most recently reassembled transfer's
    /// `(source_node_id, transfer_id)`, for the transport's request/response
    /// auto-activation pass (spec §4.7).
    pub(crate) fn take_last_finished(&self) -> Option<(Option<u16>, u64)> {
        self.last_finished.take()
    }

    /// Feeds one received datagram to this session. A no-op if the datagram
    /// does not match this session's port-id, transfer kind, or (for a
    /// selective session) remote node-ID — every session on a shared
    /// [`InputGroup`] sees every datagram and filters independently.
    pub(crate) fn process_datagram(&self, bytes: &[u8]) {
        if self.closed.get() {
            return;
        }
        let Some(header) = decode_header(bytes) else {
            self.stats.inc_header_crc_failure();
            return;
        };

        if header.port_id != self.specifier.0.data_specifier.id {
            return;
        }
        let expected_kind = self.specifier.0.data_specifier.role.transfer_kind(false);
        if header.kind != expected_kind {
            return;
        }
        if let Some(remote) = self.specifier.0.remote_node_id
            && header.source_node_id != remote
        {
            return;
        }

        let payload = &bytes[crate::frame::HEADER_LEN..];
        let end_of_transfer = header.end_of_transfer;
        let frame_index = header.frame_index;

        let mut table = self.reassembly.borrow_mut();
        let state = table.entry(header.source_node_id).or_default();

        if let Some(last) = state.last_delivered_transfer_id {
            if header.transfer_id < last {
                self.stats.inc_transfer_id_regression();
                return;
            }
            if header.transfer_id == last {
                self.stats.inc_duplicate_transfer_dropped();
                return;
            }
        }

        match &mut state.partial {
            Some(partial) if partial.transfer_id == header.transfer_id => {
                if frame_index != partial.expected_frame_index {
                    // Either a retransmit of an already-consumed frame from a
                    // slower redundant interface, or genuine reordering.
                    // Neither is recoverable under strict in-order reassembly.
                    self.stats.inc_out_of_order_frame();
                    return;
                }
                if partial.buffer.len() + payload.len() > self.payload_metadata.extent_bytes + 4 {
                    debug!(
                        source = header.source_node_id,
                        transfer_id = header.transfer_id,
                        "reassembly exceeded extent, abandoning transfer"
                    );
                    state.partial = None;
                    return;
                }
                partial.buffer.extend_from_slice(payload);
                partial.expected_frame_index += 1;
                partial.last_activity = Instant::now();
                if end_of_transfer {
                    let finished = state.partial.take().expect("just matched Some");
                    self.finish_transfer(state, header.source_node_id, finished, header.priority);
                }
            },
            _ => {
                if frame_index != 0 {
                    // First observed frame of a transfer we never saw the
                    // start of; nothing to anchor reassembly to.
                    self.stats.inc_out_of_order_frame();
                    return;
                }
                if end_of_transfer {
                    let finished = PartialTransfer {
                        transfer_id: header.transfer_id,
                        priority: header.priority,
                        expected_frame_index: 1,
                        buffer: payload.to_vec(),
                        last_activity: Instant::now(),
                    };
                    self.finish_transfer(state, header.source_node_id, finished, header.priority);
                } else {
                    state.partial = Some(PartialTransfer {
                        transfer_id: header.transfer_id,
                        priority: header.priority,
                        expected_frame_index: 1,
                        buffer: payload.to_vec(),
                        last_activity: Instant::now(),
                    });
                }
            },
        }
    }

    fn finish_transfer(
        &self,
        state: &mut SourceState,
        source_node_id: u16,
        mut finished: PartialTransfer,
        priority: Priority,
    ) {
        if finished.expected_frame_index > 1 {
            // Multi-frame transfer: the final 4 bytes are the trailing CRC.
            if finished.buffer.len() < 4 {
                self.stats.inc_transfer_crc_failure();
                return;
            }
            let split_at = finished.buffer.len() - 4;
            let crc_bytes: [u8; 4] = finished.buffer[split_at..]
                .try_into()
                .expect("checked length");
            finished.buffer.truncate(split_at);
            if u32::from_le_bytes(crc_bytes) != transfer_crc(&finished.buffer) {
                self.stats.inc_transfer_crc_failure();
                return;
            }
        }

        let source =
            (source_node_id != crate::address::ANONYMOUS_NODE_ID).then_some(source_node_id);
        state.last_delivered_transfer_id = Some(finished.transfer_id);
        self.last_finished.set(Some((source, finished.transfer_id)));
        self.inbound.borrow_mut().push_back(InboundTransfer {
            source_node_id: source,
            priority,
            transfer_id: finished.transfer_id,
            payload: finished.buffer,
        });
        trace!(
            source_node_id,
            transfer_id = finished.transfer_id,
            "delivered transfer"
        );
    }

    pub(crate) fn sweep_expired(&self) {
        let timeout = self.transfer_id_timeout.get();
        let now = Instant::now();
        let mut table = self.reassembly.borrow_mut();
        for state in table.values_mut() {
            if let Some(partial) = &state.partial
                && now.duration_since(partial.last_activity) > timeout
            {
                state.partial = None;
                self.stats.inc_reassembly_timeout();
            }
        }
    }
}

/// Owns the sockets and poller for one multicast group's redundant
/// interfaces, shared by every [`InputSession`] listening on that group
/// (spec §4.3, §4.8).
pub struct InputGroup {
    sockets: Vec<Arc<CyphalSocket>>,
    poller: RefCell<ReadinessPoller>,
}

impl InputGroup {
    pub fn new(sockets: Vec<Arc<CyphalSocket>>) -> TransportResult<Self> {
        if sockets.is_empty() {
            return Err(TransportError::InvalidStateError(
                "input group requires at least one interface".into(),
            ));
        }
        let mut poller = ReadinessPoller::new();
        for socket in &sockets {
            poller.register(socket.clone())?;
        }
        Ok(Self {
            sockets,
            poller: RefCell::new(poller),
        })
    }

    /// Waits up to `timeout` for a readable socket, drains every pending
    /// datagram off it, dispatches each to every session in `listeners`,
    /// then sweeps their reassembly state for timed-out partials.
    pub async fn service(
        &self,
        timeout: Duration,
        listeners: &[Arc<InputSession>],
    ) -> TransportResult<()> {
        let ready = match self.poller.borrow().poll(timeout).await {
            Ok(indices) => indices,
            Err(TransportError::Timeout) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut buf = vec![0u8; 65536];
        for index in ready {
            loop {
                let received = self.sockets[index].try_receive_from(&mut buf)?;
                match received {
                    Some((n, _from)) => {
                        for session in listeners {
                            session.process_datagram(&buf[..n]);
                        }
                    },
                    None => break,
                }
            }
        }

        for session in listeners {
            session.sweep_expired();
        }
        Ok(())
    }

    pub fn close(&self) {
        for socket in &self.sockets {
            socket.close();
        }
    }
}
