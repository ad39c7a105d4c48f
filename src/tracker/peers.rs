use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("compact peer list length {0} is not a multiple of 6")]
pub struct BadPeerList(pub usize);

/// One address from a tracker's compact peer list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    /// Decodes the compact binary list: 6-byte records, 4 for the IP and
    /// 2 big-endian for the port.
    pub fn unmarshal(bin: &[u8]) -> Result<Vec<Peer>, BadPeerList> {
        if bin.len() % 6 != 0 {
            return Err(BadPeerList(bin.len()));
        }
        let peers = bin
            .chunks_exact(6)
            .map(|rec| Peer {
                ip: Ipv4Addr::new(rec[0], rec[1], rec[2], rec[3]),
                port: u16::from_be_bytes([rec[4], rec[5]]),
            })
            .collect();
        Ok(peers)
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}
