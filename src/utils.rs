use rand::Rng;

// http://www.bittorrent.org/beps/bep_0020.html
const PEER_ID_PREFIX: &[u8; 8] = b"-BR0001-";

/// 20-byte peer id: fixed client prefix plus 12 random bytes, regenerated
/// on every run.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[8..]);
    peer_id
}
