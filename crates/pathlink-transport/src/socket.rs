//! UDP sockets for QUIC endpoints.
//!
//! [`PathRoutedSocket`] sits between quinn and the kernel socket on the dial
//! side. quinn addresses every datagram to the logical peer; the socket
//! rewrites the destination to the next hop of the path the selector
//! currently prefers, and maps replies arriving from any next hop back to
//! the peer. Path switches therefore take effect on the next datagram
//! without quinn seeing an address change.

use pathlink_core::PathSelector;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use std::collections::HashSet;
use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, ready};

/// Socket buffer size requested from the kernel
const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Bind a non-blocking UDP socket with enlarged buffers.
pub(crate) fn bind_udp(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    if addr.is_ipv6() {
        // Dual-stack where the platform allows it
        if let Err(e) = socket.set_only_v6(false) {
            tracing::debug!("dual-stack unavailable: {e}");
        }
    }
    socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Wildcard address of the same family as `target`
pub(crate) fn unspecified_for(target: SocketAddr) -> SocketAddr {
    if target.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    }
}

/// UDP socket routing datagrams over the selector's preferred path
pub struct PathRoutedSocket {
    inner: Arc<dyn AsyncUdpSocket>,
    peer: SocketAddr,
    selector: Arc<dyn PathSelector>,
    hops: Mutex<HashSet<SocketAddr>>,
}

impl PathRoutedSocket {
    /// Route datagrams for `peer` through `selector`
    pub fn new(
        inner: Arc<dyn AsyncUdpSocket>,
        peer: SocketAddr,
        selector: Arc<dyn PathSelector>,
    ) -> Self {
        Self {
            inner,
            peer,
            selector,
            hops: Mutex::new(HashSet::new()),
        }
    }

    /// Logical peer address seen by quinn
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Underlay address for a datagram quinn addressed to `destination`
    fn route(&self, destination: SocketAddr) -> SocketAddr {
        if destination != self.peer {
            return destination;
        }
        match self.selector.path() {
            Some(path) => {
                let hop = path.underlay_for(destination);
                if hop != destination {
                    self.hops
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(hop);
                }
                hop
            }
            None => destination,
        }
    }
}

impl fmt::Debug for PathRoutedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathRoutedSocket")
            .field("peer", &self.peer)
            .field("path", &self.selector.path().map(|p| p.id.clone()))
            .finish_non_exhaustive()
    }
}

impl AsyncUdpSocket for PathRoutedSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        Arc::clone(&self.inner).create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        let destination = self.route(transmit.destination);
        if destination == transmit.destination {
            return self.inner.try_send(transmit);
        }
        self.inner.try_send(&Transmit {
            destination,
            ecn: transmit.ecn,
            contents: transmit.contents,
            segment_size: transmit.segment_size,
            src_ip: transmit.src_ip,
        })
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let count = ready!(self.inner.poll_recv(cx, bufs, meta))?;
        let hops = self.hops.lock().unwrap_or_else(PoisonError::into_inner);
        if !hops.is_empty() {
            for m in &mut meta[..count] {
                if hops.contains(&m.addr) {
                    m.addr = self.peer;
                }
            }
        }
        Poll::Ready(Ok(count))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn max_transmit_segments(&self) -> usize {
        self.inner.max_transmit_segments()
    }

    fn max_receive_segments(&self) -> usize {
        self.inner.max_receive_segments()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }
}
