use crate::tracker::peers::{BadPeerList, Peer};
use log::debug;
use serde::Deserialize;
use serde_bytes::ByteBuf;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use url::Url;
use urlencoding::encode_binary;

/// Port advertised to trackers. We never actually listen on it.
pub const TRACKER_PORT: u16 = 6889;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("invalid announce url: {0}")]
    Url(#[from] url::ParseError),
    #[error("announce url has no host")]
    NoHost,
    #[error("tracker request failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed tracker http response")]
    BadResponse,
    #[error("tracker answered with http status {0}")]
    Status(u16),
    #[error("malformed tracker body: {0}")]
    Decode(#[from] serde_bencode::Error),
    #[error(transparent)]
    PeerList(#[from] BadPeerList),
}

/// The part of the announce response we care about: `{interval, peers}`.
#[derive(Debug, Deserialize)]
struct AnnounceResponse {
    #[serde(default)]
    interval: u64,
    peers: ByteBuf,
}

/// One announce endpoint with its query string built up front; the query
/// never changes between announces.
pub struct Tracker {
    pub announce: String,
    host: String,
    port: u16,
    path_and_query: String,
}

impl Tracker {
    pub fn new(
        announce: &str,
        length: u64,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> Result<Tracker, TrackerError> {
        let url = Url::parse(announce)?;
        let host = url.host_str().ok_or(TrackerError::NoHost)?.to_string();
        let port = url.port().unwrap_or(80);
        let path_and_query = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
            url.path(),
            encode_binary(&info_hash),
            encode_binary(&peer_id),
            TRACKER_PORT,
            length
        );
        Ok(Tracker {
            announce: announce.to_string(),
            host,
            port,
            path_and_query,
        })
    }

    /// One announce round trip: GET, parse the response head, bencode-decode
    /// the body, unmarshal the compact peer list.
    pub fn request_peers(&self) -> Result<Vec<Peer>, TrackerError> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or(TrackerError::NoHost)?;
        let mut stream = TcpStream::connect_timeout(&addr, REQUEST_TIMEOUT)?;
        stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
        stream.set_write_timeout(Some(REQUEST_TIMEOUT))?;

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.path_and_query, self.host
        );
        stream.write_all(request.as_bytes())?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw)?;

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut res = httparse::Response::new(&mut headers);
        let body_start = match res.parse(&raw) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) | Err(_) => return Err(TrackerError::BadResponse),
        };
        match res.code {
            Some(200) => {}
            Some(code) => return Err(TrackerError::Status(code)),
            None => return Err(TrackerError::BadResponse),
        }

        let response: AnnounceResponse = serde_bencode::from_bytes(&raw[body_start..])?;
        let peers = Peer::unmarshal(&response.peers)?;
        debug!(
            "tracker {} returned {} peers (interval {}s)",
            self.announce,
            peers.len(),
            response.interval
        );
        Ok(peers)
    }
}
