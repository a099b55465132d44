//! Deterministic document identifiers.
//!
//! Every persisted document id is a truncated blake3 digest over the values
//! that identify it, so importing the same capture twice addresses the same
//! documents.

use crate::flow::{Direction, FlowKey};

const ID_BYTES: usize = 16;

fn digest_id(parts: &[&[u8]]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(&hasher.finalize().as_bytes()[..ID_BYTES])
}

/// Id of a connection: the capture it came from, its key and the frame that
/// opened it. Reuse of a 4-tuple later in the capture gets a different id.
pub fn connection_id(capture_id: &str, key: &FlowKey, first_frame: u64) -> String {
    digest_id(&[
        capture_id.as_bytes(),
        &key.to_bytes(),
        &first_frame.to_le_bytes(),
    ])
}

pub fn match_id(connection_id: &str, rule_id: &str, direction: Direction, offset: u64) -> String {
    digest_id(&[
        connection_id.as_bytes(),
        rule_id.as_bytes(),
        direction.as_str().as_bytes(),
        &offset.to_le_bytes(),
    ])
}

pub fn chunk_id(connection_id: &str, index: u64) -> String {
    digest_id(&[connection_id.as_bytes(), &index.to_le_bytes()])
}
