//! Strategy choice and part planning.
//!
//! A part plan maps part numbers `1..=N` onto contiguous, non-overlapping
//! byte ranges that tile `[0, len)`; only the final part may be short.

use super::{checksum, error::ClientError, payload::Payload};
use crate::{config::UploadPolicy, models::multipart::ByteRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SingleShot,
    Multipart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedPart {
    pub part_number: u32,
    pub range: ByteRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    pub chunk_size: u64,
    pub parts: Vec<PlannedPart>,
}

impl PartPlan {
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.parts.last().map(|p| p.range.end).unwrap_or(0)
    }
}

/// Everything decided before the first network call.
#[derive(Debug, Clone)]
pub struct PreparedUpload {
    pub content_type: String,
    /// Base64 SHA-256 of the whole payload.
    pub checksum: String,
    pub total_size: u64,
    pub strategy: Strategy,
    /// Present for multipart uploads only.
    pub plan: Option<PartPlan>,
}

/// Reject unsupported types and empty payloads. Runs before any I/O.
pub fn validate(policy: &UploadPolicy, content_type: &str, len: u64) -> Result<(), ClientError> {
    if !policy.accepts(content_type) {
        return Err(ClientError::UnsupportedMediaType(content_type.to_string()));
    }
    if len == 0 {
        return Err(ClientError::EmptyPayload);
    }
    Ok(())
}

pub fn choose_strategy(policy: &UploadPolicy, len: u64) -> Strategy {
    if len <= policy.single_shot_threshold {
        Strategy::SingleShot
    } else {
        Strategy::Multipart
    }
}

/// Chunk size for a payload of `len` bytes: the tier's size, raised to the
/// store minimum and to whatever keeps the part count within `max_parts`.
pub fn chunk_size_for(policy: &UploadPolicy, len: u64) -> u64 {
    let tiered = policy
        .tiers
        .iter()
        .find(|tier| len <= tier.up_to)
        .map(|tier| tier.chunk_size)
        .unwrap_or(policy.largest_chunk);
    let max_parts = policy.max_parts.max(1);
    // Smallest size such that max_parts * size >= len.
    let count_bound = if len == 0 { 0 } else { 1 + (len - 1) / max_parts };
    tiered.max(policy.min_part_size).max(count_bound).max(1)
}

pub fn plan_parts(policy: &UploadPolicy, len: u64) -> PartPlan {
    let chunk_size = chunk_size_for(policy, len);
    let mut parts = Vec::with_capacity(len.div_ceil(chunk_size) as usize);
    let mut start = 0;
    while start < len {
        let end = (start + chunk_size).min(len);
        parts.push(PlannedPart {
            part_number: parts.len() as u32 + 1,
            range: ByteRange::new(start, end),
        });
        start = end;
    }
    PartPlan { chunk_size, parts }
}

/// Validate, checksum and plan `payload`.
pub async fn prepare(
    policy: &UploadPolicy,
    payload: &Payload,
    content_type: &str,
) -> Result<PreparedUpload, ClientError> {
    let total_size = payload.len();
    validate(policy, content_type, total_size)?;
    let checksum = checksum::sha256_base64(payload).await?;
    let strategy = choose_strategy(policy, total_size);
    let plan = match strategy {
        Strategy::SingleShot => None,
        Strategy::Multipart => Some(plan_parts(policy, total_size)),
    };
    Ok(PreparedUpload {
        content_type: content_type.to_string(),
        checksum,
        total_size,
        strategy,
        plan,
    })
}
