//! JSON wire format for relay links.
//!
//! A message is a positional JSON array `[id, meta, tag, sourceURI, destURI, portId, ...]` with
//!  command specific trailing fields. A terminal value is `true` for regular completion, or the
//!  tuple `["__ERROR__", message]` for an error. The first frame on a link is the sender's vars
//!  table as a JSON object.
//!
//! On a byte stream, each frame is prefixed by its length as an unsigned varint.

use std::collections::BTreeMap;
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use serde_json::{json, Map, Value};

use crate::error::MeshError;
use crate::messaging::message::*;
use crate::pull::End;


pub const ERROR_MARKER: &str = "__ERROR__";

pub const MAX_FRAME_SIZE: usize = 16*1024*1024;
const MAX_VARINT_LEN: usize = 10;


fn malformed(detail: impl Into<String>) -> anyhow::Error {
    MeshError::Malformed(detail.into()).into()
}

pub fn end_to_json(end: &End) -> Value {
    match end {
        End::Done => Value::Bool(true),
        End::Error(e) => json!([ERROR_MARKER, e.to_string()]),
    }
}

pub fn end_from_json(value: &Value) -> anyhow::Result<End> {
    match value {
        Value::Bool(true) => Ok(End::Done),
        Value::Array(arr) if arr.len() == 2 && arr[0].as_str() == Some(ERROR_MARKER) => {
            let msg = match &arr[1] {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(End::Error(MeshError::Remote(msg)))
        }
        other => Err(malformed(format!("not a terminal value: {}", other))),
    }
}

fn abort_to_json(abort: &Option<End>) -> Value {
    match abort {
        None => Value::Null,
        Some(end) => end_to_json(end),
    }
}

fn abort_from_json(value: Option<&Value>) -> anyhow::Result<Option<End>> {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => Ok(None),
        Some(v) => Ok(Some(end_from_json(v)?)),
    }
}

fn meta_to_json(meta: &MeshMeta) -> Value {
    let mut result = Map::new();
    if let Some(cont) = meta.cont {
        result.insert("cont".to_string(), Value::from(cont));
    }
    Value::Object(result)
}

fn meta_from_json(value: Option<&Value>) -> MeshMeta {
    MeshMeta {
        cont: value
            .and_then(|v| v.get("cont"))
            .and_then(Value::as_u64),
    }
}

pub fn message_to_json(message: &Message) -> Value {
    let mut result = vec![
        Value::from(message.id.as_str()),
        meta_to_json(&message.meta),
        Value::from(message.kind().tag()),
        Value::from(message.source_uri()),
        Value::from(message.dest_uri()),
    ];

    match &message.command {
        Command::Open(d) | Command::Req(d) => {
            result.push(Value::from(d.port_id.as_str()));
            result.push(abort_to_json(&d.abort));
        }
        Command::Res(d) => {
            result.push(Value::from(d.peer_port_id.as_str()));
            result.push(Value::from(d.reply_id.as_str()));
            result.push(Value::Array(d.payload.clone()));
        }
        Command::Continue(d) => {
            result.push(Value::from(d.peer_port_id.as_str()));
            result.push(Value::from(d.reply_id.as_str()));
        }
        Command::End(d) => {
            result.push(Value::from(d.peer_port_id.as_str()));
            result.push(Value::from(d.reply_id.as_str()));
            result.push(end_to_json(&d.end));
        }
        Command::SinkEnd(d) => {
            result.push(Value::from(d.port_id.as_str()));
            result.push(end_to_json(&d.end));
        }
    }
    Value::Array(result)
}

fn str_at(arr: &[Value], idx: usize) -> anyhow::Result<String> {
    arr.get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed(format!("expected a string at position {}", idx)))
}

fn required(arr: &[Value], idx: usize) -> anyhow::Result<&Value> {
    arr.get(idx)
        .ok_or_else(|| malformed(format!("missing field at position {}", idx)))
}

pub fn message_from_json(value: &Value) -> anyhow::Result<Message> {
    let arr = match value.as_array() {
        Some(arr) => arr,
        None => return Err(malformed("message is not an array")),
    };

    let id = str_at(arr, 0)?;
    let meta = meta_from_json(arr.get(1));
    let tag = str_at(arr, 2)?;
    let kind = CommandKind::from_tag(&tag)
        .ok_or_else(|| MeshError::UnknownCommand(tag.clone()))?;
    let source_uri = str_at(arr, 3)?;
    let dest_uri = str_at(arr, 4)?;

    let command = match kind {
        CommandKind::Open | CommandKind::Req => {
            let data = RequestData {
                source_uri,
                dest_uri,
                port_id: str_at(arr, 5)?,
                abort: abort_from_json(arr.get(6))?,
            };
            if kind == CommandKind::Open { Command::Open(data) } else { Command::Req(data) }
        }
        CommandKind::Res => {
            let payload = match required(arr, 7)? {
                Value::Array(items) => items.clone(),
                _ => return Err(malformed("res payload is not an array")),
            };
            Command::Res(ResData {
                source_uri,
                dest_uri,
                peer_port_id: str_at(arr, 5)?,
                reply_id: str_at(arr, 6)?,
                payload,
            })
        }
        CommandKind::Continue => Command::Continue(ContinueData {
            source_uri,
            dest_uri,
            peer_port_id: str_at(arr, 5)?,
            reply_id: str_at(arr, 6)?,
        }),
        CommandKind::End => Command::End(EndData {
            source_uri,
            dest_uri,
            peer_port_id: str_at(arr, 5)?,
            reply_id: str_at(arr, 6)?,
            end: end_from_json(required(arr, 7)?)?,
        }),
        CommandKind::SinkEnd => Command::SinkEnd(SinkEndData {
            source_uri,
            dest_uri,
            port_id: str_at(arr, 5)?,
            end: end_from_json(required(arr, 6)?)?,
        }),
    };

    Ok(Message { id, meta, command })
}

pub fn frame_to_json(frame: &RelayFrame) -> Value {
    match frame {
        RelayFrame::Vars(vars) => Value::Object(vars.iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect()),
        RelayFrame::Message(message) => message_to_json(message),
    }
}

pub fn frame_from_json(value: &Value) -> anyhow::Result<RelayFrame> {
    match value {
        Value::Object(map) => {
            let mut vars = BTreeMap::new();
            for (k, v) in map {
                match v.as_str() {
                    Some(v) => { vars.insert(k.clone(), v.to_string()); }
                    None => return Err(malformed(format!("value of var {} is not a string", k))),
                }
            }
            Ok(RelayFrame::Vars(vars))
        }
        other => Ok(RelayFrame::Message(message_from_json(other)?)),
    }
}


/// Appends a length-prefixed frame to `buf`.
pub fn encode_frame(frame: &RelayFrame, buf: &mut BytesMut) {
    let body = frame_to_json(frame).to_string();
    buf.put_u64_varint(body.len() as u64);
    buf.put_slice(body.as_bytes());
}

/// Reassembles length-prefixed frames from arbitrarily chunked input.
#[derive(Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}
impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        Default::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Returns the next complete frame, or `None` if more input is needed.
    pub fn try_next(&mut self) -> anyhow::Result<Option<RelayFrame>> {
        let mut peek = &self.buf[..];
        let len = match peek.get_u64_varint() {
            Ok(len) => len as usize,
            Err(_) if self.buf.len() < MAX_VARINT_LEN => return Ok(None),
            Err(e) => bail!("invalid frame length prefix: {:?}", e),
        };
        if len > MAX_FRAME_SIZE {
            bail!("frame of {} bytes exceeds the maximum frame size", len);
        }
        if peek.remaining() < len {
            return Ok(None);
        }

        let header_len = self.buf.len() - peek.remaining();
        self.buf.advance(header_len);
        let body = self.buf.split_to(len);

        let value: Value = serde_json::from_slice(&body)?;
        Ok(Some(frame_from_json(&value)?))
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}
