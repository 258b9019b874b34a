//! Base64 form of binary buffers for the JSON rendering of a message.
//!
//! On the wire buffers travel as raw frame parts; this is only used when a
//! message is dumped as JSON (logs, `--json` output, bridges to frontends).

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn serialize_buffers<S>(data: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    data.iter()
        .map(|bytes| BASE64_STANDARD.encode(bytes))
        .collect::<Vec<_>>()
        .serialize(serializer)
}

/// `null` and a missing field both yield no buffers.
pub fn deserialize_buffers<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Option<Vec<String>> = Option::deserialize(deserializer)?;
    encoded
        .unwrap_or_default()
        .iter()
        .map(|s| {
            BASE64_STANDARD
                .decode(s)
                .map(Bytes::from)
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::message::JupyterMessage;

    fn message_json(buffers: &str) -> String {
        format!(
            r#"{{
                "header": {{
                    "date": "2025-05-14T14:32:23.490Z",
                    "msg_id": "m1",
                    "msg_type": "comm_msg",
                    "session": "s",
                    "username": "u",
                    "version": "5.3"
                }},
                "parent_header": {{}},
                "metadata": {{}},
                "content": {{}}
                {}
            }}"#,
            buffers
        )
    }

    #[test]
    fn test_buffers_decode_from_base64() {
        let json = message_json(r#", "buffers": ["aGVsbG8=", "AAEC"]"#);
        let msg: JupyterMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(&msg.buffers[0][..], b"hello");
        assert_eq!(&msg.buffers[1][..], &[0u8, 1, 2]);
    }

    #[test]
    fn test_buffers_encode_to_base64() {
        let json = message_json(r#", "buffers": ["aGVsbG8="]"#);
        let msg: JupyterMessage = serde_json::from_str(&json).unwrap();
        let out = serde_json::to_value(&msg).unwrap();
        assert_eq!(out["buffers"], serde_json::json!(["aGVsbG8="]));
    }

    #[test]
    fn test_missing_or_null_buffers() {
        let msg: JupyterMessage = serde_json::from_str(&message_json("")).unwrap();
        assert!(msg.buffers.is_empty());
        let msg: JupyterMessage =
            serde_json::from_str(&message_json(r#", "buffers": null"#)).unwrap();
        assert!(msg.buffers.is_empty());
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let json = message_json(r#", "buffers": ["not base64!"]"#);
        assert!(serde_json::from_str::<JupyterMessage>(&json).is_err());
    }
}
