//! Key encoding for the durable store's column family.
//!
//! Numeric values use big-endian encoding so lexicographic key order
//! matches insertion order. Destination names are length-prefixed with a
//! big-endian u16 so names of different lengths never produce colliding
//! prefixes.

const SEPARATOR: u8 = b':';

fn encode_string(s: &str) -> Vec<u8> {
    // Capped at u16::MAX bytes; destination names never get near that.
    let bytes = &s.as_bytes()[..s.len().min(u16::MAX as usize)];
    let mut buf = Vec::with_capacity(2 + bytes.len());
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    buf
}

/// Build a slot key: `{destination}:{seq}`.
pub(crate) fn slot_key(destination: &str, seq: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(destination.len() + 11);
    key.extend_from_slice(&encode_string(destination));
    key.push(SEPARATOR);
    key.extend_from_slice(&(seq as u64).to_be_bytes());
    key
}

/// Build a prefix for iterating every slot of one destination.
pub(crate) fn destination_prefix(destination: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(destination.len() + 3);
    prefix.extend_from_slice(&encode_string(destination));
    prefix.push(SEPARATOR);
    prefix
}

/// Extract the sequence number from a slot key with the given prefix.
pub(crate) fn parse_seq(key: &[u8], prefix: &[u8]) -> Option<i64> {
    let rest = key.strip_prefix(prefix)?;
    let bytes: [u8; 8] = rest.try_into().ok()?;
    Some(u64::from_be_bytes(bytes) as i64)
}
