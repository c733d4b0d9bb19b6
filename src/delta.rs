use fast_rsync::Signature;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("corrupt signature")]
    CorruptSignature,
    #[error("diff computation failed")]
    DiffFailed,
    #[error("corrupt diff")]
    CorruptDiff,
}

/// Compute a binary delta that transforms the data summarized by
/// `signature_bytes` into `new_data`.
pub fn diff(signature_bytes: &[u8], new_data: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let signature = Signature::deserialize(signature_bytes.to_vec())
        .map_err(|_| DeltaError::CorruptSignature)?;
    let indexed = signature.index();
    let mut out = Vec::new();
    fast_rsync::diff(&indexed, new_data, &mut out).map_err(|_| DeltaError::DiffFailed)?;
    Ok(out)
}

/// Apply a delta produced by [`diff`] to the original data.
pub fn apply(old_data: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut out = Vec::new();
    fast_rsync::apply(old_data, delta, &mut out).map_err(|_| DeltaError::CorruptDiff)?;
    Ok(out)
}
