// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Session specifier value types (spec §3.3), grounded on
//! `libcyphal::transport::{DataSpecifier, SessionSpecifier, InputSessionSpecifier,
//! OutputSessionSpecifier}` (`transport/data_specifier.hpp`,
//! `transport/session.hpp`).

use crate::{
    address::{TransferKind, is_valid_service_id, is_valid_subject_id},
    error::TransportError,
};

/// Role a data specifier plays, matching
/// `libcyphal::transport::DataSpecifier::Role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Message,
    ServiceProvider,
    ServiceConsumer,
}

impl Role {
    pub fn transfer_kind(self, is_output: bool) -> TransferKind {
        match (self, is_output) {
            (Role::Message, _) => TransferKind::Message,
            (Role::ServiceProvider, true) => TransferKind::Response,
            (Role::ServiceProvider, false) => TransferKind::Request,
            (Role::ServiceConsumer, true) => TransferKind::Request,
            (Role::ServiceConsumer, false) => TransferKind::Response,
        }
    }
}

/// `(id, role)` pair identifying a port (spec §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataSpecifier {
    pub id: u16,
    pub role: Role,
}

impl DataSpecifier {
    pub fn message(subject_id: u16) -> Result<Self, TransportError> {
        if !is_valid_subject_id(subject_id) {
            return Err(TransportError::InvalidArgumentError(format!(
                "subject-id {subject_id} exceeds 13-bit range"
            )));
        }
        Ok(Self {
            id: subject_id,
            role: Role::Message,
        })
    }

    pub fn service_provider(service_id: u16) -> Result<Self, TransportError> {
        Self::service(service_id, Role::ServiceProvider)
    }

    pub fn service_consumer(service_id: u16) -> Result<Self, TransportError> {
        Self::service(service_id, Role::ServiceConsumer)
    }

    fn service(service_id: u16, role: Role) -> Result<Self, TransportError> {
        if !is_valid_service_id(service_id) {
            return Err(TransportError::InvalidArgumentError(format!(
                "service-id {service_id} exceeds 9-bit range"
            )));
        }
        Ok(Self { id: service_id, role })
    }

    pub fn is_message(self) -> bool {
        matches!(self.role, Role::Message)
    }
}

/// A data specifier plus an optional remote node-ID: the key for looking up
/// session objects in the registry (spec §3.3, glossary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionSpecifier {
    pub data_specifier: DataSpecifier,
    pub remote_node_id: Option<u16>,
}

/// Input session key. Absent `remote_node_id` means promiscuous (accept
/// from any source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputSessionSpecifier(pub SessionSpecifier);

impl InputSessionSpecifier {
    pub fn new(data_specifier: DataSpecifier, remote_node_id: Option<u16>) -> Self {
        Self(SessionSpecifier {
            data_specifier,
            remote_node_id,
        })
    }

    pub fn is_promiscuous(&self) -> bool {
        self.0.remote_node_id.is_none()
    }
}

/// Output session key. A service data specifier MUST carry a remote
/// node-ID; constructing one without it is a programmer error (spec §3.3
/// invariant), surfaced as `InvalidArgumentError` rather than the original
/// source's debug-assert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputSessionSpecifier(pub SessionSpecifier);

impl OutputSessionSpecifier {
    pub fn new(
        data_specifier: DataSpecifier,
        remote_node_id: Option<u16>,
    ) -> Result<Self, TransportError> {
        if !data_specifier.is_message() && remote_node_id.is_none() {
            return Err(TransportError::InvalidArgumentError(
                "service transfers must be unicast (remote node-id required)".into(),
            ));
        }
        Ok(Self(SessionSpecifier {
            data_specifier,
            remote_node_id,
        }))
    }

    pub fn is_broadcast(&self) -> bool {
        self.0.remote_node_id.is_none()
    }
}

/// Maximum reassembly buffer size an input session will ever allocate
/// (spec §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadMetadata {
    pub extent_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_output_without_remote_node_is_rejected() {
        let ds = DataSpecifier::service_consumer(430).expect("valid service id");
        assert!(matches!(
            OutputSessionSpecifier::new(ds, None),
            Err(TransportError::InvalidArgumentError(_))
        ));
    }

    #[test]
    fn message_output_without_remote_node_is_broadcast() {
        let ds = DataSpecifier::message(7509).expect("valid subject id");
        let spec = OutputSessionSpecifier::new(ds, None).expect("broadcast ok");
        assert!(spec.is_broadcast());
    }

    #[test]
    fn subject_id_above_range_rejected() {
        assert!(matches!(
            DataSpecifier::message(8192),
            Err(TransportError::InvalidArgumentError(_))
        ));
    }

    #[test]
    fn service_id_above_range_rejected() {
        assert!(matches!(
            DataSpecifier::service_provider(512),
            Err(TransportError::InvalidArgumentError(_))
        ));
    }
}
