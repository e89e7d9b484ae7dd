//! Value encoding for persisted rows.
//!
//! Task records are stored as JSON; the id high-water mark is stored as the
//! id's fixed-width hex encoding so it stays human-readable in store dumps.

use thiserror::Error;

use crate::ids::{TaskId, TaskIdParseError};
use crate::task::TaskData;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("task record is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("persisted task id is invalid: {0}")]
    InvalidId(#[from] TaskIdParseError),
}

pub fn encode_task_data(data: &TaskData) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(data)?)
}

pub fn decode_task_data(raw: &[u8]) -> Result<TaskData, CodecError> {
    Ok(serde_json::from_slice(raw)?)
}

pub fn encode_task_id(id: &TaskId) -> Vec<u8> {
    id.to_hex().into_bytes()
}

pub fn decode_task_id(raw: &[u8]) -> Result<TaskId, CodecError> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| CodecError::InvalidId(TaskIdParseError::Hex("not utf-8".to_string())))?;
    Ok(TaskId::from_hex(s)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_data_round_trips() {
        let data = TaskData {
            handler_id: "renew_certificate".to_string(),
            parameters: vec![json!({"domain": "example.com"}), json!(42)],
            timestamp_ms: 1_700_000_000_000,
            delay_ms: 250,
            priority: -3,
            deadline_ms: 30_000,
            path: vec!["certs".to_string(), "renew".to_string()],
        };
        let raw = encode_task_data(&data).unwrap();
        let back = decode_task_data(&raw).unwrap();
        assert_eq!(back.handler_id, data.handler_id);
        assert_eq!(back.parameters, data.parameters);
        assert_eq!(back.priority, data.priority);
        assert_eq!(back.path, data.path);
    }

    #[test]
    fn task_id_round_trips() {
        let id = TaskId::from_parts(1_700_000_000_000, 7, 0xdead_beef);
        let raw = encode_task_id(&id);
        assert_eq!(decode_task_id(&raw).unwrap(), id);
    }

    #[test]
    fn garbage_id_is_rejected() {
        assert!(decode_task_id(b"not-an-id").is_err());
        assert!(decode_task_id(&[0xFF, 0xFE]).is_err());
    }
}
