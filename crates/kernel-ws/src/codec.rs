//! Binary framing for the `v1.kernel.websocket.jupyter.org` protocol.
//!
//! Every WebSocket message is one binary frame:
//!
//! ```text
//! [N: u64 le] [offset_0: u64 le] ... [offset_{N-1}: u64 le]
//! [channel name: offset_0..offset_1]
//! [header][parent_header][metadata][content][buffer_0]...
//! ```
//!
//! `offset_0 == 8 * (N + 1)` and the last offset equals the frame length.
//! The four message parts are UTF-8 JSON, buffers are raw bytes.

use bytes::Bytes;
use serde_json::Value;

use crate::error::KernelWsError;
use crate::message::{deserialize_parent_header, empty_object, Header, JupyterMessage};

const WORD: usize = 8;

/// Number of JSON parts that precede the binary buffers.
const JSON_PARTS: usize = 4;

/// Lay out `channel` followed by `parts` as a v1 frame.
pub fn serialize_frame(channel: &str, parts: &[&[u8]]) -> Vec<u8> {
    let n_offsets = parts.len() + 2;
    let mut offsets = Vec::with_capacity(n_offsets);
    let mut position = WORD * (n_offsets + 1);
    offsets.push(position);
    position += channel.len();
    offsets.push(position);
    for part in parts {
        position += part.len();
        offsets.push(position);
    }

    let mut frame = Vec::with_capacity(position);
    frame.extend_from_slice(&(n_offsets as u64).to_le_bytes());
    for offset in &offsets {
        frame.extend_from_slice(&(*offset as u64).to_le_bytes());
    }
    frame.extend_from_slice(channel.as_bytes());
    for part in parts {
        frame.extend_from_slice(part);
    }
    frame
}

fn read_word(frame: &[u8], index: usize) -> Result<usize, KernelWsError> {
    let start = index * WORD;
    let bytes: [u8; WORD] = frame
        .get(start..start + WORD)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| KernelWsError::protocol("frame truncated inside offset table"))?;
    usize::try_from(u64::from_le_bytes(bytes))
        .map_err(|_| KernelWsError::protocol("frame offset does not fit in memory"))
}

/// Split a v1 frame into its channel name and the parts that follow it.
pub fn deserialize_frame(frame: &[u8]) -> Result<(String, Vec<&[u8]>), KernelWsError> {
    let n_offsets = read_word(frame, 0)?;
    if n_offsets < 2 {
        return Err(KernelWsError::Protocol(format!(
            "frame declares {} offsets, need at least 2",
            n_offsets
        )));
    }
    // Guard the allocation below against a hostile count.
    if n_offsets > frame.len() / WORD {
        return Err(KernelWsError::Protocol(format!(
            "frame declares {} offsets but is only {} bytes",
            n_offsets,
            frame.len()
        )));
    }

    let offsets = (1..=n_offsets)
        .map(|i| read_word(frame, i))
        .collect::<Result<Vec<_>, _>>()?;

    if offsets[0] != WORD * (n_offsets + 1) {
        return Err(KernelWsError::Protocol(format!(
            "first offset is {}, expected {}",
            offsets[0],
            WORD * (n_offsets + 1)
        )));
    }
    if offsets.windows(2).any(|w| w[0] > w[1]) {
        return Err(KernelWsError::protocol("frame offsets are not increasing"));
    }
    if offsets[n_offsets - 1] > frame.len() {
        return Err(KernelWsError::Protocol(format!(
            "last offset {} is past the end of a {} byte frame",
            offsets[n_offsets - 1],
            frame.len()
        )));
    }

    let channel = std::str::from_utf8(&frame[offsets[0]..offsets[1]])
        .map_err(|_| KernelWsError::protocol("channel name is not UTF-8"))?
        .to_string();
    let parts = offsets[1..]
        .windows(2)
        .map(|w| &frame[w[0]..w[1]])
        .collect();
    Ok((channel, parts))
}

/// Serialize a message for `channel`.
pub fn encode_message(channel: &str, msg: &JupyterMessage) -> Result<Vec<u8>, KernelWsError> {
    let header = serde_json::to_vec(&msg.header)?;
    let parent = match &msg.parent_header {
        Some(parent) => serde_json::to_vec(parent)?,
        None => b"{}".to_vec(),
    };
    let metadata = serde_json::to_vec(&msg.metadata)?;
    let content = serde_json::to_vec(&msg.content)?;

    let mut parts: Vec<&[u8]> = vec![&header, &parent, &metadata, &content];
    parts.extend(msg.buffers.iter().map(|b| b.as_ref()));
    Ok(serialize_frame(channel, &parts))
}

/// Rebuild a message from the parts following the channel name.
pub fn decode_parts(channel: &str, parts: &[&[u8]]) -> Result<JupyterMessage, KernelWsError> {
    if parts.len() < JSON_PARTS {
        return Err(KernelWsError::Protocol(format!(
            "message on {} has {} parts, expected at least {}",
            channel,
            parts.len(),
            JSON_PARTS
        )));
    }

    let header: Header = serde_json::from_slice(parts[0])
        .map_err(|e| KernelWsError::Protocol(format!("bad header: {}", e)))?;
    let parent_value: Value = parse_json_part(parts[1])?;
    let parent_header = deserialize_parent_header(parent_value)
        .map_err(|e| KernelWsError::Protocol(format!("bad parent header: {}", e)))?;
    let metadata = parse_json_part(parts[2])?;
    let content = parse_json_part(parts[3])?;
    let buffers = parts[JSON_PARTS..]
        .iter()
        .map(|b| Bytes::copy_from_slice(b))
        .collect();

    Ok(JupyterMessage {
        header,
        parent_header,
        metadata,
        content,
        buffers,
        channel: channel.parse().ok(),
    })
}

fn parse_json_part(part: &[u8]) -> Result<Value, KernelWsError> {
    if part.is_empty() {
        return Ok(empty_object());
    }
    serde_json::from_slice(part).map_err(|e| KernelWsError::Protocol(format!("bad JSON part: {}", e)))
}

/// Deserialize a full frame into its channel and message.
pub fn decode_message(frame: &[u8]) -> Result<(String, JupyterMessage), KernelWsError> {
    let (channel, parts) = deserialize_frame(frame)?;
    let msg = decode_parts(&channel, &parts)?;
    Ok((channel, msg))
}
