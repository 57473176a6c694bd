use rand::distributions::Alphanumeric;
use rand::Rng;

const PEER_ID_PREFIX: &[u8; 8] = b"-SB0100-";

/// Generates a random Azureus-style peer ID
pub fn generate_peer_id() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut peer_id = [0; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    peer_id[PEER_ID_PREFIX.len()..]
        .iter_mut()
        .for_each(|byte| *byte = rng.sample(Alphanumeric));
    peer_id
}
