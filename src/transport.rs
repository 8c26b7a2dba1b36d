//! Transport adapter.
//!
//! The endpoint drives the NIC through the [`Transport`] trait: burst TX,
//! burst RX into pool buffers, in-order send-completion reclaim, and memory
//! registration. [`UdpTransport`] is the packet shim shipped with the crate;
//! RDMA-class adapters implement the same trait.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use crate::buffer::PktBufPool;
use crate::error::{Error, Result};

/// Maximum packets pulled from the wire per RX burst.
pub const RX_BURST_MAX: usize = 32;

/// Memory-region registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemKey(pub u32);

/// One packet handed to the transport for transmission.
///
/// Packets larger than the inline limit must point into a registered region;
/// the transport reads them in place.
pub struct TxPacket<'a> {
    /// Destination datapath address.
    pub dst: SocketAddr,
    /// Full packet bytes (header + payload).
    pub data: &'a [u8],
    /// Registration key of the region `data` lives in.
    pub lkey: Option<MemKey>,
}

/// One received packet, resident in a pool buffer until freed.
#[derive(Debug, Clone, Copy)]
pub struct RxPacket {
    /// Sender datapath address.
    pub src: SocketAddr,
    /// Pool buffer holding the packet.
    pub buf_idx: usize,
    /// Packet length in bytes.
    pub len: usize,
}

/// Packet-level transport interface.
///
/// Contract: send completions are reported in order of submission; received
/// packets preserve per-peer order on a lossless fabric, and the reliability
/// layer above recovers when they do not.
pub trait Transport {
    /// Maximum packet size (header + payload) in bytes.
    fn mtu(&self) -> usize;

    /// Threshold below which a packet may be copied inline instead of read
    /// from registered memory.
    fn max_inline(&self) -> usize;

    /// Local datapath address, exchanged during session setup.
    fn local_addr(&self) -> SocketAddr;

    /// Register a memory region and mint its key.
    fn register(&mut self, addr: *const u8, len: usize) -> Result<MemKey>;

    /// Enqueue a burst of packets. Returns the number accepted.
    fn tx_burst(&mut self, pkts: &[TxPacket<'_>]) -> Result<usize>;

    /// Pull received packets into pool buffers. Returns the number received.
    fn rx_burst(&mut self, pool: &mut PktBufPool, out: &mut Vec<RxPacket>) -> usize;

    /// Number of sends completed since the last call.
    fn reclaim_tx_completions(&mut self) -> usize;
}

/// UDP datagram transport.
///
/// Completion model: a datagram handed to the socket is complete; the next
/// `reclaim_tx_completions` call reports everything sent since the previous
/// one, in submission order.
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    mtu: usize,
    max_inline: usize,
    next_key: u32,
    unclaimed_completions: usize,
}

impl UdpTransport {
    /// Default MTU when none is given.
    pub const DEFAULT_MTU: usize = 4096;

    /// Bind a datapath socket. Pass port 0 for an ephemeral port.
    pub fn new(bind: impl ToSocketAddrs, mtu: usize, max_inline: usize) -> Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        if mtu == 0 {
            return Err(Error::InvalidConfig("mtu cannot be 0".into()));
        }
        Ok(Self {
            socket,
            local_addr,
            mtu,
            max_inline,
            next_key: 1,
            unclaimed_completions: 0,
        })
    }

    /// Bind on loopback with the default MTU.
    pub fn new_loopback() -> Result<Self> {
        Self::new("127.0.0.1:0", Self::DEFAULT_MTU, 64)
    }
}

impl Transport for UdpTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    fn max_inline(&self) -> usize {
        self.max_inline
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn register(&mut self, _addr: *const u8, len: usize) -> Result<MemKey> {
        if len == 0 {
            return Err(Error::InvalidConfig("cannot register empty region".into()));
        }
        let key = MemKey(self.next_key);
        self.next_key = self.next_key.wrapping_add(1);
        Ok(key)
    }

    fn tx_burst(&mut self, pkts: &[TxPacket<'_>]) -> Result<usize> {
        let mut sent = 0;
        for pkt in pkts {
            debug_assert!(
                pkt.data.len() <= self.mtu,
                "packet exceeds mtu: {} > {}",
                pkt.data.len(),
                self.mtu
            );
            debug_assert!(
                pkt.data.len() <= self.max_inline || pkt.lkey.is_some(),
                "non-inline packet from unregistered memory"
            );
            match self.socket.send_to(pkt.data, pkt.dst) {
                Ok(_) => {}
                // A full socket buffer loses the datagram; the reliability
                // layer retransmits.
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    tracing::trace!(dst = %pkt.dst, "tx_burst: socket full, datagram dropped");
                }
                Err(e) => return Err(Error::Io(e)),
            }
            sent += 1;
        }
        self.unclaimed_completions += sent;
        Ok(sent)
    }

    fn rx_burst(&mut self, pool: &mut PktBufPool, out: &mut Vec<RxPacket>) -> usize {
        let mut received = 0;
        while received < RX_BURST_MAX {
            let Some(buf_idx) = pool.alloc() else {
                break;
            };
            match self.socket.recv_from(pool.slot_mut(buf_idx)) {
                Ok((len, src)) => {
                    out.push(RxPacket { src, buf_idx, len });
                    received += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    pool.free(buf_idx);
                    break;
                }
                Err(e) => {
                    pool.free(buf_idx);
                    tracing::warn!(error = %e, "rx_burst: recv_from failed");
                    break;
                }
            }
        }
        received
    }

    fn reclaim_tx_completions(&mut self) -> usize {
        std::mem::take(&mut self.unclaimed_completions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_transport_roundtrip() {
        let mut a = UdpTransport::new_loopback().unwrap();
        let mut b = UdpTransport::new_loopback().unwrap();
        let mut pool = PktBufPool::new(8, a.mtu()).unwrap();

        let payload = b"ping".as_slice();
        let pkts = [TxPacket {
            dst: b.local_addr(),
            data: payload,
            lkey: None,
        }];
        assert_eq!(a.tx_burst(&pkts).unwrap(), 1);
        assert_eq!(a.reclaim_tx_completions(), 1);
        assert_eq!(a.reclaim_tx_completions(), 0);

        let mut out = Vec::new();
        let mut received = 0;
        for _ in 0..200 {
            received = b.rx_burst(&mut pool, &mut out);
            if received > 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(received, 1);
        assert_eq!(out[0].len, 4);
        assert_eq!(&pool.slot(out[0].buf_idx)[..4], payload);
        assert_eq!(out[0].src, a.local_addr());
    }

    #[test]
    fn test_register_mints_distinct_keys() {
        let mut t = UdpTransport::new_loopback().unwrap();
        let region = [0u8; 64];
        let k1 = t.register(region.as_ptr(), region.len()).unwrap();
        let k2 = t.register(region.as_ptr(), region.len()).unwrap();
        assert_ne!(k1, k2);
    }
}
