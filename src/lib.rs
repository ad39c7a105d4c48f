pub mod bitfield;

pub mod metainfo;
pub mod storage;
pub mod torrent;
pub mod utils;

pub mod tracker {
    pub mod http;
    pub mod peers;
}

pub mod peer {
    pub mod connection;
    pub mod handshake;
    pub mod message;
}
