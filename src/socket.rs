// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Datagram socket primitives (spec §4.2), grounded on the
//! `libcyphal::network::ip::Socket` contract (`network/ip/socket.hpp`) and
//! built the way the teacher crate layers async I/O over a non-blocking
//! handle in `client/common.rs::io_with_timeout`.
//!
//! A [`CyphalSocket`] owns exactly one `tokio::net::UdpSocket`, built through
//! `socket2` so the transport can set the options the kernel does not expose
//! through `tokio::net` directly (multicast egress interface, SO_REUSEPORT,
//! TTL).

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::atomic::{AtomicBool, Ordering},
};

use socket2::{Domain, Protocol, Socket as Socket2, Type};
use tracing::{debug, trace, warn};

use crate::{
    address::{CYPHAL_UDP_PORT, MULTICAST_TTL},
    error::{TransportError, TransportResult},
};

/// A single UDP datagram socket bound to one local interface.
#[derive(Debug)]
pub struct CyphalSocket {
    inner: tokio::net::UdpSocket,
    local_addr: SocketAddrV4,
    closed: AtomicBool,
}

impl CyphalSocket {
    /// Builds and binds an **output** socket: bound to an ephemeral port on
    /// `local_addr`, egress interface pinned to `local_addr`, TTL 16,
    /// connected to `(remote_group, CYPHAL_UDP_PORT)`.
    pub fn bind_output(
        local_addr: Ipv4Addr,
        remote_group: Ipv4Addr,
    ) -> TransportResult<Self> {
        let socket = new_udp_socket2()?;
        socket
            .bind(&SocketAddrV4::new(local_addr, 0).into())
            .map_err(TransportError::from_bind_io)?;
        socket
            .set_multicast_if_v4(&local_addr)
            .map_err(TransportError::from_bind_io)?;
        socket
            .set_multicast_ttl_v4(MULTICAST_TTL)
            .map_err(TransportError::from_bind_io)?;
        socket
            .connect(&SocketAddrV4::new(remote_group, CYPHAL_UDP_PORT).into())
            .map_err(TransportError::from_connect_io)?;

        let local = socket_local_v4(&socket)?;
        debug!(?local, ?remote_group, "bound output socket");
        Self::from_socket2(socket, local)
    }

    /// Builds an **input** socket joined to `group` on `local_addr`. On
    /// Unix, binds to the multicast group address with SO_REUSEADDR /
    /// SO_REUSEPORT set beforehand so multiple Cyphal nodes can coexist on
    /// one host; on non-Unix targets binds to ANY with the fixed port
    /// instead, matching the platform split in spec §4.2.
    pub fn bind_input(local_addr: Ipv4Addr, group: Ipv4Addr) -> TransportResult<Self> {
        let socket = new_udp_socket2()?;
        socket
            .set_reuse_address(true)
            .map_err(TransportError::from_bind_io)?;
        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .map_err(TransportError::from_bind_io)?;

        let bind_addr = if cfg!(unix) {
            SocketAddrV4::new(group, CYPHAL_UDP_PORT)
        } else {
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CYPHAL_UDP_PORT)
        };
        socket
            .bind(&bind_addr.into())
            .map_err(TransportError::from_bind_io)?;
        socket
            .join_multicast_v4(&group, &local_addr)
            .map_err(TransportError::from_bind_io)?;

        debug!(?local_addr, ?group, "bound input socket");
        Self::from_socket2(socket, SocketAddrV4::new(local_addr, CYPHAL_UDP_PORT))
    }

    fn from_socket2(socket: Socket2, local_addr: SocketAddrV4) -> TransportResult<Self> {
        socket
            .set_nonblocking(true)
            .map_err(TransportError::from_syscall_io)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let inner = tokio::net::UdpSocket::from_std(std_socket)
            .map_err(TransportError::from_syscall_io)?;
        Ok(Self {
            inner,
            local_addr,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::ResourceClosedError)
        } else {
            Ok(())
        }
    }

    /// Non-blocking send on a connected (output) socket.
    pub fn try_send(&self, bytes: &[u8]) -> TransportResult<bool> {
        self.check_open()?;
        match self.inner.try_send(bytes) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(TransportError::from_syscall_io(e)),
        }
    }

    /// Non-blocking receive, returning `None` on EAGAIN/EWOULDBLOCK.
    pub fn try_receive_from(
        &self,
        buf: &mut [u8],
    ) -> TransportResult<Option<(usize, SocketAddr)>> {
        self.check_open()?;
        match self.inner.try_recv_from(buf) {
            Ok((n, addr)) => {
                trace!(bytes = n, from = %addr, "received datagram");
                Ok(Some((n, addr)))
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::from_syscall_io(e)),
        }
    }

    /// Suspends until either the write half is ready or the deadline
    /// elapses. The only suspension points in the transport live here and
    /// in [`crate::poller::ReadinessPoller::poll`] (spec §5).
    pub async fn writable(&self) -> TransportResult<()> {
        self.check_open()?;
        self.inner
            .writable()
            .await
            .map_err(TransportError::from_syscall_io)
    }

    pub async fn readable(&self) -> TransportResult<()> {
        self.check_open()?;
        self.inner
            .readable()
            .await
            .map_err(TransportError::from_syscall_io)
    }

    /// Idempotent close: the first call marks the socket closed; subsequent
    /// calls are no-ops (spec §4.2).
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            warn!(local = %self.local_addr, "closing socket");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn new_udp_socket2() -> TransportResult<Socket2> {
    Socket2::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(TransportError::from_syscall_io)
}

fn socket_local_v4(socket: &Socket2) -> TransportResult<SocketAddrV4> {
    match socket.local_addr().map_err(TransportError::from_syscall_io)?.as_socket() {
        Some(SocketAddr::V4(v4)) => Ok(v4),
        _ => Err(TransportError::InvalidStateError(
            "socket bound to a non-IPv4 address".into(),
        )),
    }
}
