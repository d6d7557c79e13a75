//! Framed blob encoding for the append-only shard files.
//!
//! Every shard file is a plain concatenation of self-delimiting frames. A
//! reader that catches a writer mid-append may see a truncated final frame;
//! [`unpack`] silently drops it and returns every frame that is fully
//! present. There are no per-frame checksums: the engine re-executes inputs
//! whose features are unknown, so the data is always recoverable.

use bincode::{
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::DecodeError,
    Decode, Encode,
};

use crate::feature::{Feature, FeatureVec};

/// Tag byte opening every frame.
const FRAME_TAG: u8 = 0xD5;

/// Stable content hash of an input (16-byte MD5 digest). Pairs a features
/// frame with the corpus frame it describes.
pub type InputHash = [u8; 16];

/// Length of an [`InputHash`] in bytes.
pub const INPUT_HASH_LEN: usize = 16;

/// One on-disk frame: a tag byte, a fixed-width length, and the payload.
#[derive(Encode, Decode, Debug)]
struct Frame {
    tag: u8,
    payload: Vec<u8>,
}

fn frame_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// Wraps `payload` into a single frame suitable for appending to a shard
/// file.
pub fn pack(payload: &[u8]) -> Vec<u8> {
    let frame = Frame {
        tag: FRAME_TAG,
        payload: payload.to_vec(),
    };
    bincode::encode_to_vec(&frame, frame_config())
        .expect("frame encoding cannot fail for in-memory buffers")
}

/// Splits `blob` back into frame payloads.
///
/// Returns every frame whose full extent is present; a trailing partial
/// frame (or any tail that no longer parses) is dropped without error.
pub fn unpack(blob: &[u8]) -> Vec<Vec<u8>> {
    let mut payloads = Vec::new();
    let mut offset = 0;
    while offset < blob.len() {
        match bincode::decode_from_slice::<Frame, _>(&blob[offset..], frame_config()) {
            Ok((frame, consumed)) if frame.tag == FRAME_TAG => {
                payloads.push(frame.payload);
                offset += consumed;
            }
            // A wrong tag means we lost framing; everything from here on is
            // unusable, same as a truncated tail.
            Ok(_) => break,
            Err(DecodeError::UnexpectedEnd { .. }) => break,
            Err(_) => break,
        }
    }
    payloads
}

/// Computes the stable content hash of an input.
pub fn hash_input(input: &[u8]) -> InputHash {
    md5::compute(input).0
}

/// Lowercase-hex rendering of an input hash, used for content-addressed
/// file names.
pub fn hash_hex(hash: &InputHash) -> String {
    format!("{:x}", md5::Digest(*hash))
}

/// Builds the payload of a features frame: the input's hash followed by the
/// features as native-endian 64-bit words.
pub fn pack_features_and_hash(input: &[u8], features: &FeatureVec) -> Vec<u8> {
    let mut payload = Vec::with_capacity(INPUT_HASH_LEN + features.len() * 8);
    payload.extend_from_slice(&hash_input(input));
    for &feature in features {
        payload.extend_from_slice(&feature.to_ne_bytes());
    }
    payload
}

/// Parses a features-frame payload back into its hash and feature words.
///
/// Returns `None` when the payload is too short to carry a hash; a trailing
/// partial word is ignored.
pub fn unpack_features_and_hash(payload: &[u8]) -> Option<(InputHash, FeatureVec)> {
    if payload.len() < INPUT_HASH_LEN {
        return None;
    }
    let mut hash = [0u8; INPUT_HASH_LEN];
    hash.copy_from_slice(&payload[..INPUT_HASH_LEN]);
    let features: FeatureVec = payload[INPUT_HASH_LEN..]
        .chunks_exact(8)
        .map(|word| Feature::from_ne_bytes(word.try_into().expect("chunk is 8 bytes")))
        .collect();
    Some((hash, features))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips_multiple_frames() {
        let frames: Vec<Vec<u8>> = vec![vec![], vec![1, 2, 3], vec![0xFF; 1000]];
        let mut blob = Vec::new();
        for frame in &frames {
            blob.extend_from_slice(&pack(frame));
        }
        assert_eq!(unpack(&blob), frames);
    }

    #[test]
    fn unpack_tolerates_a_truncated_final_frame() {
        let mut blob = pack(&[1, 2, 3]);
        blob.extend_from_slice(&pack(&[4, 5, 6, 7]));
        let full = unpack(&blob);
        assert_eq!(full.len(), 2);
        // Every truncation point after the first frame yields exactly the
        // first frame, as if the partial tail were absent.
        let first_frame_len = pack(&[1, 2, 3]).len();
        for cut in first_frame_len..blob.len() - 1 {
            assert_eq!(unpack(&blob[..cut]), vec![vec![1, 2, 3]], "cut at {cut}");
        }
    }

    #[test]
    fn unpack_of_garbage_returns_nothing() {
        assert!(unpack(&[]).is_empty());
        assert!(unpack(&[0x00, 0x01, 0x02]).is_empty());
    }

    #[test]
    fn features_payload_round_trips() {
        let input = vec![9u8, 8, 7];
        let features: FeatureVec = vec![1, u64::MAX, 42];
        let payload = pack_features_and_hash(&input, &features);
        let (hash, decoded) = unpack_features_and_hash(&payload).unwrap();
        assert_eq!(hash, hash_input(&input));
        assert_eq!(decoded, features);
    }

    #[test]
    fn features_payload_ignores_partial_trailing_word() {
        let payload = pack_features_and_hash(&[1], &vec![5, 6]);
        let (_, decoded) = unpack_features_and_hash(&payload[..payload.len() - 3]).unwrap();
        assert_eq!(decoded, vec![5]);
    }

    #[test]
    fn short_features_payload_is_rejected() {
        assert!(unpack_features_and_hash(&[0u8; INPUT_HASH_LEN - 1]).is_none());
    }

    #[test]
    fn hash_is_stable_and_hex_is_lowercase() {
        let hash = hash_input(b"abc");
        assert_eq!(hash, hash_input(b"abc"));
        let hex = hash_hex(&hash);
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
