//! Jupyter message model as carried over the kernel WebSocket.
//!
//! Content and metadata stay as raw JSON so protocol adapters can rewrite
//! their shape between major versions before anything downstream parses them.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::base64::{deserialize_buffers, serialize_buffers};

/// The four queue-backed channels multiplexed on one kernel WebSocket.
///
/// Heartbeat is not listed here: it is derived from WebSocket ping/pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
    Control,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Shell,
        Channel::Iopub,
        Channel::Stdin,
        Channel::Control,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::Iopub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(Channel::Shell),
            "iopub" => Ok(Channel::Iopub),
            "stdin" => Ok(Channel::Stdin),
            "control" => Ok(Channel::Control),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}

/// Message header. `msg_id` is unique within the issuing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub session: String,
    #[serde(
        serialize_with = "serialize_date",
        deserialize_with = "deserialize_date"
    )]
    pub date: DateTime<Utc>,
    /// Protocol version string. Absent on v4 headers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A Jupyter message with JSON content and out-of-band binary buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JupyterMessage {
    pub header: Header,

    #[serde(
        default,
        serialize_with = "serialize_parent_header",
        deserialize_with = "deserialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default = "empty_object")]
    pub metadata: Value,

    #[serde(default = "empty_object")]
    pub content: Value,

    #[serde(
        default,
        serialize_with = "serialize_buffers",
        deserialize_with = "deserialize_buffers"
    )]
    pub buffers: Vec<Bytes>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

impl JupyterMessage {
    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// `msg_id` of the request this message answers, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// True for an iopub `status` message with the given execution state.
    pub fn is_status(&self, execution_state: &str) -> bool {
        self.header.msg_type == "status"
            && self.content.get("execution_state").and_then(Value::as_str) == Some(execution_state)
    }
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Default::default())
}

fn serialize_date<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&date.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
}

/// Parse an ISO 8601 date. Kernels that omit the offset are taken as UTC.
pub fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn deserialize_date<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        Some(s) => parse_date(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid header date: {}", s))),
        None => Ok(Utc::now()),
    }
}

fn serialize_parent_header<S>(parent: &Option<Header>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match parent {
        Some(header) => header.serialize(serializer),
        None => empty_object().serialize(serializer),
    }
}

/// `{}`, `null` and a missing field all mean "no parent".
pub fn deserialize_parent_header<'de, D>(deserializer: D) -> Result<Option<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) if map.is_empty() => Ok(None),
        Some(other) => Header::deserialize(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: &str = r#"
    {
        "header": {
            "date": "2025-05-14T14:32:23.490Z",
            "msg_id": "test-id",
            "msg_type": "kernel_info_request",
            "session": "test-session",
            "username": "",
            "version": "5.3"
        },
        "parent_header": {},
        "metadata": {},
        "content": {},
        "buffers": [],
        "channel": "shell"
    }
    "#;

    #[test]
    fn test_deserialize_empty_parent_header() {
        let msg: JupyterMessage = serde_json::from_str(MSG).unwrap();
        assert!(msg.parent_header.is_none());
        assert_eq!(msg.channel, Some(Channel::Shell));
        assert_eq!(msg.msg_type(), "kernel_info_request");
    }

    #[test]
    fn test_deserialize_null_parent_header() {
        let json = MSG.replace(r#""parent_header": {}"#, r#""parent_header": null"#);
        let msg: JupyterMessage = serde_json::from_str(&json).unwrap();
        assert!(msg.parent_header.is_none());
    }

    #[test]
    fn test_none_parent_serializes_as_empty_object() {
        let msg: JupyterMessage = serde_json::from_str(MSG).unwrap();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["parent_header"], serde_json::json!({}));
    }

    #[test]
    fn test_naive_date_is_utc() {
        let dt = parse_date("2025-05-14T14:32:23.490123").unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-05-14T14:32:23.490123+00:00");
    }

    #[test]
    fn test_offset_date_is_normalized() {
        let dt = parse_date("2025-05-14T16:32:23+02:00").unwrap();
        assert_eq!(dt, parse_date("2025-05-14T14:32:23Z").unwrap());
    }

    #[test]
    fn test_is_status() {
        let json = MSG
            .replace("kernel_info_request", "status")
            .replace(r#""content": {}"#, r#""content": {"execution_state": "restarting"}"#);
        let msg: JupyterMessage = serde_json::from_str(&json).unwrap();
        assert!(msg.is_status("restarting"));
        assert!(!msg.is_status("idle"));
    }

    #[test]
    fn test_channel_from_str() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!("hb".parse::<Channel>().is_err());
    }
}
