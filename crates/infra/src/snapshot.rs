//! Versioned byte encoding of tag states.
//!
//! A snapshot only saves refold work; a state that fails to decode or was
//! produced by another projector version is discarded and rebuilt.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dcbkit_events::TagState;

use crate::registry::ProjectorEntry;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("snapshot decoding failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unsupported snapshot format v{0}")]
    UnsupportedFormat(u32),

    #[error("snapshot of {found_name}@{found_version} does not match projector {name}@{version}")]
    ProjectorMismatch {
        name: String,
        version: String,
        found_name: String,
        found_version: String,
    },
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    v: u32,
    state: &'a TagState,
}

#[derive(Deserialize)]
struct Envelope {
    v: u32,
    state: serde_json::Value,
}

pub fn encode_tag_state(state: &TagState) -> Result<Vec<u8>, SnapshotError> {
    serde_json::to_vec(&EnvelopeRef {
        v: SNAPSHOT_FORMAT_VERSION,
        state,
    })
    .map_err(SnapshotError::Encode)
}

pub fn decode_tag_state(bytes: &[u8]) -> Result<TagState, SnapshotError> {
    let envelope: Envelope = serde_json::from_slice(bytes).map_err(SnapshotError::Decode)?;
    if envelope.v != SNAPSHOT_FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedFormat(envelope.v));
    }
    serde_json::from_value(envelope.state).map_err(SnapshotError::Decode)
}

/// Decode and require that the snapshot was folded by `projector`'s current version.
pub fn decode_tag_state_for(
    bytes: &[u8],
    projector: &ProjectorEntry,
) -> Result<TagState, SnapshotError> {
    let state = decode_tag_state(bytes)?;
    if !state.is_compatible_with(projector.name, projector.version) {
        return Err(SnapshotError::ProjectorMismatch {
            name: projector.name.to_string(),
            version: projector.version.to_string(),
            found_name: state.projector_name,
            found_version: state.projector_version,
        });
    }
    Ok(state)
}
