//! Message adapters between Jupyter protocol major versions.
//!
//! Messages are built and consumed in the library's native major version.
//! When a kernel reports a different major version, outgoing messages pass
//! through [`adapt_send`] and incoming ones through [`adapt_recv`]. The
//! differences live in rule tables, not per-field branches.

use serde_json::{Map, Value};

use crate::message::{Header, JupyterMessage};

/// A message type that changed name between v4 and v5.
struct MsgTypeRule {
    v5: &'static str,
    v4: &'static str,
}

const MSG_TYPE_RULES: &[MsgTypeRule] = &[
    MsgTypeRule { v5: "execute_result", v4: "pyout" },
    MsgTypeRule { v5: "execute_input", v4: "pyin" },
    MsgTypeRule { v5: "error", v4: "pyerr" },
    MsgTypeRule { v5: "inspect_request", v4: "object_info_request" },
    MsgTypeRule { v5: "inspect_reply", v4: "object_info_reply" },
];

/// A content key that changed name, scoped to a v5 message type.
struct FieldRule {
    msg_type: &'static str,
    v5: &'static str,
    v4: &'static str,
}

const FIELD_RULES: &[FieldRule] = &[
    FieldRule { msg_type: "stream", v5: "text", v4: "data" },
    FieldRule { msg_type: "inspect_request", v5: "code", v4: "oname" },
    FieldRule { msg_type: "complete_request", v5: "code", v4: "line" },
];

/// Header version string stamped on messages adapted up to v5.
const V5_HEADER_VERSION: &str = "5.0";

/// Parse the major component of a `protocol_version` such as `"5.3"`.
pub fn parse_major(protocol_version: &str) -> Option<u32> {
    protocol_version.split('.').next()?.trim().parse().ok()
}

/// Rewrite an outgoing message from `from` (native) to the kernel's `to`.
pub fn adapt_send(msg: JupyterMessage, from: u32, to: u32) -> JupyterMessage {
    translate(msg, from, to)
}

/// Rewrite an incoming message from the kernel's `from` to native `to`.
pub fn adapt_recv(msg: JupyterMessage, from: u32, to: u32) -> JupyterMessage {
    translate(msg, from, to)
}

/// Whether a message from `from` to `to` is rewritten at all.
pub fn is_supported(from: u32, to: u32) -> bool {
    from == to || matches!((from, to), (5, 4) | (4, 5))
}

fn translate(mut msg: JupyterMessage, from: u32, to: u32) -> JupyterMessage {
    match (from, to) {
        (5, 4) => {
            let v5_type = msg.header.msg_type.clone();
            rename_fields(&mut msg.content, &v5_type, Direction::Down);
            header_down(&mut msg.header);
            if let Some(parent) = msg.parent_header.as_mut() {
                header_down(parent);
            }
        }
        (4, 5) => {
            header_up(&mut msg.header);
            if let Some(parent) = msg.parent_header.as_mut() {
                header_up(parent);
            }
            let v5_type = msg.header.msg_type.clone();
            rename_fields(&mut msg.content, &v5_type, Direction::Up);
        }
        _ => {}
    }
    msg
}

#[derive(Clone, Copy)]
enum Direction {
    Down,
    Up,
}

fn header_down(header: &mut Header) {
    if let Some(rule) = MSG_TYPE_RULES.iter().find(|r| r.v5 == header.msg_type) {
        header.msg_type = rule.v4.to_string();
    }
    header.version = None;
}

fn header_up(header: &mut Header) {
    if let Some(rule) = MSG_TYPE_RULES.iter().find(|r| r.v4 == header.msg_type) {
        header.msg_type = rule.v5.to_string();
    }
    header.version = Some(V5_HEADER_VERSION.to_string());
}

fn rename_fields(content: &mut Value, v5_msg_type: &str, direction: Direction) {
    let Some(map) = content.as_object_mut() else {
        return;
    };
    for rule in FIELD_RULES.iter().filter(|r| r.msg_type == v5_msg_type) {
        let (from_key, to_key) = match direction {
            Direction::Down => (rule.v5, rule.v4),
            Direction::Up => (rule.v4, rule.v5),
        };
        move_key(map, from_key, to_key);
    }
}

fn move_key(map: &mut Map<String, Value>, from_key: &str, to_key: &str) {
    if let Some(value) = map.remove(from_key) {
        map.insert(to_key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn message(msg_type: &str, content: Value) -> JupyterMessage {
        JupyterMessage {
            header: Header {
                msg_id: "s_1_0".into(),
                msg_type: msg_type.into(),
                username: "u".into(),
                session: "s".into(),
                date: Utc::now(),
                version: Some("5.3".into()),
            },
            parent_header: None,
            metadata: json!({}),
            content,
            buffers: vec![],
            channel: None,
        }
    }

    #[test]
    fn test_parse_major() {
        assert_eq!(parse_major("5.3"), Some(5));
        assert_eq!(parse_major("4.1"), Some(4));
        assert_eq!(parse_major("6"), Some(6));
        assert_eq!(parse_major("x.y"), None);
        assert_eq!(parse_major(""), None);
    }

    #[test]
    fn test_same_version_is_identity() {
        let msg = message("execute_request", json!({"code": "1"}));
        assert_eq!(adapt_send(msg.clone(), 5, 5), msg);
    }

    #[test]
    fn test_v5_to_v4_renames_type_and_fields() {
        let msg = message("inspect_request", json!({"code": "len", "cursor_pos": 3}));
        let adapted = adapt_send(msg, 5, 4);
        assert_eq!(adapted.header.msg_type, "object_info_request");
        assert_eq!(adapted.header.version, None);
        assert_eq!(adapted.content["oname"], "len");
        assert!(adapted.content.get("code").is_none());
    }

    #[test]
    fn test_v4_stream_comes_back_as_v5() {
        let mut msg = message("stream", json!({"name": "stdout", "data": "10\n"}));
        msg.header.version = None;
        let adapted = adapt_recv(msg, 4, 5);
        assert_eq!(adapted.content["text"], "10\n");
        assert_eq!(adapted.header.version.as_deref(), Some("5.0"));
    }

    #[test]
    fn test_v4_pyerr_becomes_error() {
        let msg = message("pyerr", json!({"ename": "NameError"}));
        let adapted = adapt_recv(msg, 4, 5);
        assert_eq!(adapted.header.msg_type, "error");
    }

    #[test]
    fn test_down_then_up_is_identity_on_content() {
        let msg = message("stream", json!({"name": "stdout", "text": "hi"}));
        let back = adapt_recv(adapt_send(msg.clone(), 5, 4), 4, 5);
        assert_eq!(back.content, msg.content);
        assert_eq!(back.header.msg_type, msg.header.msg_type);
    }

    #[test]
    fn test_unknown_versions_pass_through() {
        let msg = message("execute_request", json!({"code": "1"}));
        assert!(!is_supported(5, 7));
        assert_eq!(adapt_send(msg.clone(), 5, 7), msg);
    }
}
