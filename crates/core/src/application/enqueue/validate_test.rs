//! Unit tests for enqueue validation

use super::*;
use serde_json::json;

#[test]
fn test_validate_job_type_empty() {
    let req = EnqueueRequest::new("", json!({}));
    let result = validate_request(&req);
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("empty"));
}

#[test]
fn test_validate_job_type_too_long() {
    let req = EnqueueRequest::new("a".repeat(MAX_JOB_TYPE_LEN + 1), json!({}));
    let result = validate_request(&req);
    assert!(result.unwrap_err().to_string().contains("too long"));

    let req = EnqueueRequest::new("a".repeat(MAX_JOB_TYPE_LEN), json!({}));
    assert!(validate_request(&req).is_ok());
}

#[test]
fn test_validate_job_type_invalid_chars() {
    let req = EnqueueRequest::new("feeds fetch!", json!({}));
    let result = validate_request(&req);
    assert!(result.unwrap_err().to_string().contains("alphanumeric"));

    let req = EnqueueRequest::new("feeds.fetch-v2_b", json!({}));
    assert!(validate_request(&req).is_ok());
}

#[test]
fn test_validate_payload_must_be_object() {
    for payload in [json!([1, 2]), json!("text"), json!(null), json!(3)] {
        let req = EnqueueRequest::new("x", payload);
        assert!(validate_request(&req)
            .unwrap_err()
            .to_string()
            .contains("JSON object"));
    }
}

#[test]
fn test_validate_payload_depth() {
    let mut deep = json!({});
    for _ in 0..MAX_PAYLOAD_DEPTH {
        deep = json!({ "inner": deep });
    }
    // MAX_PAYLOAD_DEPTH + 1 levels
    let req = EnqueueRequest::new("x", deep.clone());
    assert!(validate_request(&req)
        .unwrap_err()
        .to_string()
        .contains("too deep"));

    let ok = deep["inner"].clone();
    assert!(validate_request(&EnqueueRequest::new("x", ok)).is_ok());
}
