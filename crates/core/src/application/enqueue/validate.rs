// Enqueue request validation

use super::EnqueueRequest;
use crate::error::{AppError, Result};

/// Maximum job type length
pub const MAX_JOB_TYPE_LEN: usize = 64;

/// Maximum nesting depth of a payload
pub const MAX_PAYLOAD_DEPTH: usize = 32;

/// Reject malformed requests before they reach the store
pub fn validate_request(req: &EnqueueRequest) -> Result<()> {
    validate_job_type(&req.job_type)?;
    validate_payload(&req.payload)?;
    Ok(())
}

fn validate_job_type(job_type: &str) -> Result<()> {
    if job_type.is_empty() {
        return Err(AppError::Validation("job type must not be empty".to_string()));
    }
    if job_type.len() > MAX_JOB_TYPE_LEN {
        return Err(AppError::Validation(format!(
            "job type too long ({} > {MAX_JOB_TYPE_LEN})",
            job_type.len()
        )));
    }
    let valid = job_type
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(AppError::Validation(format!(
            "job type must be alphanumeric with '_', '.', '-': {job_type}"
        )));
    }
    Ok(())
}

fn validate_payload(payload: &serde_json::Value) -> Result<()> {
    if !payload.is_object() {
        return Err(AppError::Validation(
            "payload must be a JSON object".to_string(),
        ));
    }
    let depth = depth_of(payload);
    if depth > MAX_PAYLOAD_DEPTH {
        return Err(AppError::Validation(format!(
            "payload nested too deep ({depth} > {MAX_PAYLOAD_DEPTH})"
        )));
    }
    Ok(())
}

fn depth_of(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Object(map) => 1 + map.values().map(depth_of).max().unwrap_or(0),
        serde_json::Value::Array(items) => 1 + items.iter().map(depth_of).max().unwrap_or(0),
        _ => 0,
    }
}
