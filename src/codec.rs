//! Wire format for gossip envelopes and join-time snapshots.
//!
//! An envelope is a single kind-tag byte followed by its payload. Data
//! envelopes (`b'd'`) carry a JSON array of [`Mutation`]s. Any other tag is
//! reserved for future message kinds and is ignored by this version.

use crate::error::{Error, Result};
use crate::ops::Mutation;
use crate::types::Snapshot;

/// Kind tag of an envelope carrying a mutation batch
pub const DATA_TAG: u8 = b'd';

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Data(Vec<Mutation>),
}

pub fn encode_mutations(batch: &[Mutation]) -> Result<Vec<u8>> {
    let mut buf = vec![DATA_TAG];
    serde_json::to_writer(&mut buf, batch).map_err(Error::Encode)?;
    Ok(buf)
}

/// Decode a received envelope.
///
/// Returns `Ok(None)` for an empty buffer or an unrecognised tag; only a data
/// envelope with a malformed payload is an error.
pub fn decode_envelope(buf: &[u8]) -> Result<Option<Envelope>> {
    let Some((&tag, payload)) = buf.split_first() else {
        return Ok(None);
    };
    match tag {
        DATA_TAG => {
            let batch = serde_json::from_slice(payload).map_err(|source| Error::Decode {
                what: "mutation batch",
                source,
            })?;
            Ok(Some(Envelope::Data(batch)))
        }
        _ => Ok(None),
    }
}

pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>> {
    serde_json::to_vec(snapshot).map_err(Error::Encode)
}

pub fn decode_snapshot(buf: &[u8]) -> Result<Snapshot> {
    serde_json::from_slice(buf).map_err(|source| Error::Decode {
        what: "snapshot",
        source,
    })
}
