// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Output session (spec §4.7): publishes a transfer by encoding it into
//! frames and enqueuing them onto every redundant interface's TX queue.

use std::{
    cell::{Cell, RefCell},
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    address::{NodeId, Priority},
    error::{SendOutcome, TransportError, TransportResult},
    frame::{encode_header, fragment_payload, validate_port_id, wire_node_id, ParsedHeader},
    queue::TxQueue,
    session::specifier::{OutputSessionSpecifier, PayloadMetadata},
    socket::CyphalSocket,
};

/// One (interface, destination) pair's wire-out wiring: a socket connected
/// to the destination group and the TX queue every output session sending
/// to that destination over that interface shares (spec §3.8). The
/// transport caches these by `(interface_index, destination_group)` so two
/// sessions that happen to publish to the same subject over the same
/// interface drain through one socket instead of racing two.
pub struct OutputTarget {
    pub socket: Arc<CyphalSocket>,
    pub queue: RefCell<TxQueue>,
}

pub struct OutputSession {
    specifier: OutputSessionSpecifier,
    payload_metadata: PayloadMetadata,
    local_node_id: NodeId,
    targets: Vec<Arc<OutputTarget>>,
    transfer_id: Cell<u64>,
    /// Set by the transport when a matching request arrives for a response
    /// session; consumed by the next `send` (spec §4.7's "inactive until
    /// first matching request" rule, resolved as a one-shot activation
    /// since the spec does not define a reuse policy across responses).
    pending_response_transfer_id: RefCell<Option<u64>>,
    closed: Cell<bool>,
}

impl OutputSession {
    pub fn new(
        specifier: OutputSessionSpecifier,
        payload_metadata: PayloadMetadata,
        local_node_id: NodeId,
        targets: Vec<Arc<OutputTarget>>,
    ) -> TransportResult<Self> {
        validate_port_id(
            specifier.0.data_specifier.role.transfer_kind(true),
            specifier.0.data_specifier.id,
        )?;
        if targets.is_empty() {
            return Err(TransportError::InvalidStateError(
                "output session requires at least one interface".into(),
            ));
        }
        Ok(Self {
            specifier,
            payload_metadata,
            local_node_id,
            targets,
            transfer_id: Cell::new(0),
            pending_response_transfer_id: RefCell::new(None),
            closed: Cell::new(false),
        })
    }

    pub fn specifier(&self) -> OutputSessionSpecifier {
        self.specifier
    }

    pub fn payload_metadata(&self) -> PayloadMetadata {
        self.payload_metadata
    }

    fn is_response(&self) -> bool {
        matches!(
            self.specifier.0.data_specifier.role,
            crate::session::specifier::Role::ServiceProvider
        ) && !self.specifier.0.data_specifier.is_message()
    }

    /// Called by the transport when an input session observes a request
    /// matching this response session's remote node-ID, activating it.
    pub fn record_matching_request(&self, transfer_id: u64) {
        *self.pending_response_transfer_id.borrow_mut() = Some(transfer_id);
    }

    /// Publishes `payload`. See spec §4.7 for the enqueue/partial-success
    /// rules and the transfer-ID increment policy.
    pub fn send(
        &self,
        payload: &[u8],
        priority: Priority,
        deadline: Instant,
        mtu_payload_capacity: usize,
    ) -> TransportResult<SendOutcome> {
        if self.closed.get() {
            return Err(TransportError::ResourceClosedError);
        }

        let transfer_id = if self.is_response() {
            let pending = self.pending_response_transfer_id.borrow_mut().take();
            match pending {
                Some(id) => id,
                None => return Err(TransportError::NotReady),
            }
        } else {
            self.transfer_id.get()
        };

        let kind = self.specifier.0.data_specifier.role.transfer_kind(true);
        let port_id = self.specifier.0.data_specifier.id;
        let destination_node_id = wire_node_id(self.specifier.0.remote_node_id);
        let source_node_id = wire_node_id(
            (!self.local_node_id.is_anonymous()).then(|| self.local_node_id.get()),
        );

        let fragments = fragment_payload(payload, mtu_payload_capacity);
        let last_index = fragments.len() - 1;

        let mut accepted_interfaces: u8 = 0;
        let mut first_error: Option<TransportError> = None;

        for target in &self.targets {
            let mut all_pushed = true;
            for (index, fragment) in fragments.iter().enumerate() {
                let header = ParsedHeader {
                    priority,
                    source_node_id,
                    destination_node_id,
                    kind,
                    port_id,
                    transfer_id,
                    frame_index: index as u32,
                    end_of_transfer: index == last_index,
                };
                let mut datagram = Vec::with_capacity(crate::frame::HEADER_LEN + fragment.len());
                datagram.extend_from_slice(&encode_header(&header));
                datagram.extend_from_slice(fragment);

                let push_result = target.queue.borrow_mut().push(priority, deadline, datagram);
                if let Err(e) = push_result {
                    all_pushed = false;
                    first_error.get_or_insert(e);
                    break;
                }
            }
            if all_pushed {
                accepted_interfaces += 1;
            }
        }

        if accepted_interfaces == 0 {
            return Err(first_error.unwrap_or(TransportError::MemoryError));
        }

        if !self.is_response() {
            self.transfer_id.set(transfer_id.wrapping_add(1));
        }

        debug!(
            port_id,
            transfer_id,
            accepted_interfaces,
            total_interfaces = self.targets.len(),
            "enqueued transfer"
        );

        if accepted_interfaces as usize == self.targets.len() {
            Ok(SendOutcome::Success)
        } else {
            Ok(SendOutcome::PartialSuccess { accepted_interfaces })
        }
    }

    pub fn close(&self) {
        self.closed.set(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

/// Drains at most one datagram from `target`'s queue onto the wire, called
/// from `Transport::run_for` (spec §4.9 step 1) for every live output
/// target. Closing the underlying socket is the transport's job, not an
/// individual session's: several sessions may share one target.
pub fn drain_one(target: &OutputTarget) -> TransportResult<()> {
    let now = Instant::now();
    let mut queue = target.queue.borrow_mut();
    let dropped = queue.drop_expired(now);
    if dropped > 0 {
        warn!(dropped, "dropped expired TX queue items");
    }
    let Some(item) = queue.peek() else { return Ok(()) };
    if item.deadline <= now {
        return Ok(());
    }
    // try_send is non-blocking; a WouldBlock result leaves the item queued
    // for the next run_for call.
    match target.socket.try_send(&item.payload) {
        Ok(true) => {
            queue.pop();
            Ok(())
        },
        Ok(false) => Ok(()),
        Err(TransportError::ResourceClosedError) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::session::specifier::DataSpecifier;

    fn make_targets(group: Ipv4Addr) -> Vec<Arc<OutputTarget>> {
        let socket =
            Arc::new(CyphalSocket::bind_output(Ipv4Addr::new(127, 0, 0, 1), group).expect("bind"));
        vec![Arc::new(OutputTarget {
            socket,
            queue: RefCell::new(TxQueue::new(64)),
        })]
    }

    #[tokio::test]
    async fn message_send_increments_transfer_id() {
        let specifier =
            OutputSessionSpecifier::new(DataSpecifier::message(7509).expect("valid"), None)
                .expect("broadcast ok");
        let session = OutputSession::new(
            specifier,
            PayloadMetadata { extent_bytes: 256 },
            NodeId::new(42).expect("valid"),
            make_targets(Ipv4Addr::new(239, 0, 29, 85)),
        )
        .expect("construct");

        let deadline = Instant::now() + Duration::from_secs(1);
        session.send(b"hi", Priority::Nominal, deadline, 256).expect("send 1");
        session.send(b"hi", Priority::Nominal, deadline, 256).expect("send 2");
        assert_eq!(session.transfer_id.get(), 2);
    }

    #[tokio::test]
    async fn response_session_is_inactive_until_request_observed() {
        let specifier = OutputSessionSpecifier::new(
            DataSpecifier::service_provider(430).expect("valid"),
            Some(10),
        )
        .expect("unicast ok");
        let session = OutputSession::new(
            specifier,
            PayloadMetadata { extent_bytes: 256 },
            NodeId::new(11).expect("valid"),
            make_targets(Ipv4Addr::new(239, 1, 0, 10)),
        )
        .expect("construct");

        let deadline = Instant::now() + Duration::from_secs(1);
        assert!(matches!(
            session.send(b"resp", Priority::Nominal, deadline, 256),
            Err(TransportError::NotReady)
        ));

        session.record_matching_request(0);
        session
            .send(b"resp", Priority::Nominal, deadline, 256)
            .expect("now active");
        // Responses mirror the request transfer-id and never auto-increment.
        assert_eq!(session.transfer_id.get(), 0);
    }

    #[tokio::test]
    async fn close_marks_session_closed_without_touching_shared_socket() {
        let specifier = OutputSessionSpecifier::new(DataSpecifier::message(1).expect("valid"), None)
            .expect("ok");
        let session = OutputSession::new(
            specifier,
            PayloadMetadata { extent_bytes: 64 },
            NodeId::ANONYMOUS,
            make_targets(Ipv4Addr::new(239, 0, 0, 1)),
        )
        .expect("construct");
        session.close();
        session.close();
        assert!(session.is_closed());
        assert!(matches!(
            session.send(b"x", Priority::Nominal, Instant::now(), 256),
            Err(TransportError::ResourceClosedError)
        ));
    }
}
