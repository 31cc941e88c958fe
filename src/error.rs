// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Layered result/status model for the transport (spec §7).
//!
//! `Success` and `PartialSuccess` are not error variants: they are carried by
//! [`SendOutcome`], the `Ok` side of a fallible send. Everything else a
//! transport operation can fail with is a [`TransportError`] variant.

use std::fmt;

use thiserror::Error;

/// Which layer observed the failure, mirrored from the status word the
/// original implementation packs result-kind/layer/errno into a single
/// value. We keep the same three-layer split but as a plain enum field
/// instead of bit-packed flags, since nothing downstream needs the packed
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Network,
    Transport,
    Presentation,
    Application,
}

/// Outcome of a redundant-interface send: either every interface accepted
/// the datagram, or only some did (best-effort policy, spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    PartialSuccess { accepted_interfaces: u8 },
}

impl SendOutcome {
    pub fn succeeded(self) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("poll returned no events within the deadline")]
    Timeout,

    #[error("response session has not yet observed a matching request")]
    NotReady,

    #[error("operation attempted on a closed resource")]
    ResourceClosedError,

    #[error("operation attempted before initialize()")]
    UninitializedError,

    #[error("arena exhausted or capacity reached")]
    MemoryError,

    #[error("bind/connect rejected by the kernel (errno {errno})")]
    AddressError { errno: i32, source: std::io::Error },

    #[error("connection failed (errno {errno})")]
    ConnectionError { errno: i32, source: std::io::Error },

    #[error("network syscall failed (errno {errno})")]
    NetworkSystemError { errno: i16, source: std::io::Error },

    #[error("invalid argument: {0}")]
    InvalidArgumentError(String),

    #[error("invalid state: {0}")]
    InvalidStateError(String),

    #[error("not implemented: {0}")]
    NotImplementedError(&'static str),
}

impl TransportError {
    /// Wraps an I/O error observed at the socket boundary, classifying it
    /// per spec §4.2's bind/connect/send error mapping.
    pub fn from_bind_io(err: std::io::Error) -> Self {
        let errno = err.raw_os_error().unwrap_or(0);
        match err.kind() {
            std::io::ErrorKind::AddrNotAvailable | std::io::ErrorKind::AddrInUse => {
                TransportError::AddressError { errno, source: err }
            },
            _ => TransportError::NetworkSystemError {
                errno: errno.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
                source: err,
            },
        }
    }

    pub fn from_connect_io(err: std::io::Error) -> Self {
        let errno = err.raw_os_error().unwrap_or(0);
        match err.kind() {
            std::io::ErrorKind::AddrNotAvailable => {
                TransportError::AddressError { errno, source: err }
            },
            _ => TransportError::ConnectionError { errno, source: err },
        }
    }

    pub fn from_syscall_io(err: std::io::Error) -> Self {
        let errno = err.raw_os_error().unwrap_or(0);
        TransportError::NetworkSystemError {
            errno: errno.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
            source: err,
        }
    }

    /// Status is truthy iff kind in {Success, PartialSuccess}; errors are
    /// never truthy, so this is always false. Kept for symmetry with
    /// [`SendOutcome::succeeded`] and the `succeeded_or_timed_out` helper
    /// below, which together reproduce the "status is a tri-state result"
    /// shape from spec §7.
    pub fn succeeded(&self) -> bool {
        false
    }
}

/// `succeeded_or_timed_out` helper for poll callers (spec §7): a timeout is
/// not success, but it is not an actionable failure either.
pub fn succeeded_or_timed_out<T>(result: &TransportResult<T>) -> bool {
    match result {
        Ok(_) => true,
        Err(TransportError::Timeout) => true,
        Err(_) => false,
    }
}

pub type TransportResult<T> = Result<T, TransportError>;

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Layer::Network => "network",
            Layer::Transport => "transport",
            Layer::Presentation => "presentation",
            Layer::Application => "application",
        };
        write!(f, "{s}")
    }
}
