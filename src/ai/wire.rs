//! Binary codec for the inference-worker protocol.
//!
//! Every message travels as a 4-byte big-endian length prefix followed by a
//! tagged payload. Integers are big-endian; strings are u16-length-prefixed
//! UTF-8; optional strings carry a one-byte presence flag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::ai::types::{BBox, Detection};

/// Upper bound on a single message payload. Larger prefixes indicate a
/// desynchronized or hostile peer and reset the connection.
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

const TAG_INIT: u8 = 1;
const TAG_INIT_OK: u8 = 2;
const TAG_FRAME: u8 = 3;
const TAG_RESULT: u8 = 4;
const TAG_END: u8 = 5;
const TAG_HEARTBEAT: u8 = 6;

/// Codec errors. Any of these resets the connection.
#[derive(Debug, Clone, Error)]
pub enum WireError {
    #[error("truncated message")]
    Truncated,

    #[error("unknown message tag {0}")]
    BadTag(u8),

    #[error("invalid utf-8 in string field")]
    BadUtf8,

    #[error("payload length {0} exceeds limit")]
    Oversize(usize),
}

/// Messages exchanged with the inference worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Init {
        model: String,
        width: u32,
        height: u32,
        format: String,
    },
    InitOk,
    Frame {
        frame_id: u64,
        session_id: Option<String>,
        width: u32,
        height: u32,
        capture_ts_ns: u64,
        data: Bytes,
    },
    Result {
        frame_id: u64,
        detections: Vec<Detection>,
    },
    End {
        session_id: String,
    },
    Heartbeat,
}

impl WorkerMessage {
    /// Encode into `dst` with the length prefix included.
    pub fn encode(&self, dst: &mut BytesMut) {
        let payload = self.encode_payload();
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
    }

    fn encode_payload(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            WorkerMessage::Init {
                model,
                width,
                height,
                format,
            } => {
                buf.put_u8(TAG_INIT);
                put_string(&mut buf, model);
                buf.put_u32(*width);
                buf.put_u32(*height);
                put_string(&mut buf, format);
            }
            WorkerMessage::InitOk => buf.put_u8(TAG_INIT_OK),
            WorkerMessage::Frame {
                frame_id,
                session_id,
                width,
                height,
                capture_ts_ns,
                data,
            } => {
                buf.put_u8(TAG_FRAME);
                buf.put_u64(*frame_id);
                put_opt_string(&mut buf, session_id.as_deref());
                buf.put_u32(*width);
                buf.put_u32(*height);
                buf.put_u64(*capture_ts_ns);
                buf.put_u32(data.len() as u32);
                buf.extend_from_slice(data);
            }
            WorkerMessage::Result {
                frame_id,
                detections,
            } => {
                buf.put_u8(TAG_RESULT);
                buf.put_u64(*frame_id);
                buf.put_u16(detections.len() as u16);
                for d in detections {
                    put_opt_string(&mut buf, d.track_id.as_deref());
                    put_string(&mut buf, &d.cls);
                    buf.put_f32(d.conf);
                    buf.put_f32(d.bbox.x);
                    buf.put_f32(d.bbox.y);
                    buf.put_f32(d.bbox.w);
                    buf.put_f32(d.bbox.h);
                }
            }
            WorkerMessage::End { session_id } => {
                buf.put_u8(TAG_END);
                put_string(&mut buf, session_id);
            }
            WorkerMessage::Heartbeat => buf.put_u8(TAG_HEARTBEAT),
        }
        buf
    }

    /// Decode one payload (without the length prefix).
    pub fn decode(payload: &mut Bytes) -> Result<Self, WireError> {
        if payload.remaining() < 1 {
            return Err(WireError::Truncated);
        }
        let tag = payload.get_u8();
        match tag {
            TAG_INIT => {
                let model = get_string(payload)?;
                let (width, height) = (get_u32(payload)?, get_u32(payload)?);
                let format = get_string(payload)?;
                Ok(WorkerMessage::Init {
                    model,
                    width,
                    height,
                    format,
                })
            }
            TAG_INIT_OK => Ok(WorkerMessage::InitOk),
            TAG_FRAME => {
                let frame_id = get_u64(payload)?;
                let session_id = get_opt_string(payload)?;
                let (width, height) = (get_u32(payload)?, get_u32(payload)?);
                let capture_ts_ns = get_u64(payload)?;
                let len = get_u32(payload)? as usize;
                if payload.remaining() < len {
                    return Err(WireError::Truncated);
                }
                let data = payload.copy_to_bytes(len);
                Ok(WorkerMessage::Frame {
                    frame_id,
                    session_id,
                    width,
                    height,
                    capture_ts_ns,
                    data,
                })
            }
            TAG_RESULT => {
                let frame_id = get_u64(payload)?;
                let count = get_u16(payload)? as usize;
                let mut detections = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let track_id = get_opt_string(payload)?;
                    let cls = get_string(payload)?;
                    let conf = get_f32(payload)?;
                    let bbox = BBox {
                        x: get_f32(payload)?,
                        y: get_f32(payload)?,
                        w: get_f32(payload)?,
                        h: get_f32(payload)?,
                    };
                    detections.push(Detection {
                        track_id,
                        cls,
                        conf,
                        bbox,
                    });
                }
                Ok(WorkerMessage::Result {
                    frame_id,
                    detections,
                })
            }
            TAG_END => Ok(WorkerMessage::End {
                session_id: get_string(payload)?,
            }),
            TAG_HEARTBEAT => Ok(WorkerMessage::Heartbeat),
            other => Err(WireError::BadTag(other)),
        }
    }
}

/// Try to extract one length-prefixed payload from the read buffer.
/// Returns `Ok(None)` when more bytes are needed.
pub fn try_read_payload(buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Err(WireError::Oversize(len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).freeze()))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn put_opt_string(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn get_u16(buf: &mut Bytes) -> Result<u16, WireError> {
    if buf.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> Result<u32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, WireError> {
    if buf.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_u64())
}

fn get_f32(buf: &mut Bytes) -> Result<f32, WireError> {
    if buf.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(buf.get_f32())
}

fn get_string(buf: &mut Bytes) -> Result<String, WireError> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::BadUtf8)
}

fn get_opt_string(buf: &mut Bytes) -> Result<Option<String>, WireError> {
    if buf.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    match buf.get_u8() {
        0 => Ok(None),
        _ => Ok(Some(get_string(buf)?)),
    }
}
