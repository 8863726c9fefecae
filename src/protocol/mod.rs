//! Bus wire framing.
//! - 16-byte little-endian message header
//! - OP_SEND / OP_REPLY frames: flags, target address (cstring), JSON body

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 16;

pub const OP_SEND: i32 = 3001;
pub const OP_REPLY: i32 = 3002;

/// Reply flag: a continuation may be sent in response to this reply.
pub const FLAG_MORE_EXIST: u32 = 1;

// flags + empty address
const MIN_BODY_LEN: usize = 4 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let mut b = &buf[..HEADER_LEN];
        Some(Self {
            message_length: b.get_i32_le(),
            request_id: b.get_i32_le(),
            response_to: b.get_i32_le(),
            op_code: b.get_i32_le(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: i32,
    /// Request id this frame answers; 0 for new requests.
    pub response_to: i32,
    pub op_code: i32,
    pub flags: u32,
    /// Target address; empty on replies and continuations.
    pub address: String,
    pub body: Bytes,
}

impl Frame {
    pub fn send(request_id: i32, address: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self { request_id, response_to: 0, op_code: OP_SEND, flags: 0, address: address.into(), body: body.into() }
    }

    /// A continuation request answering the reply `response_to`.
    pub fn continuation(request_id: i32, response_to: i32, body: impl Into<Bytes>) -> Self {
        Self { request_id, response_to, op_code: OP_SEND, flags: 0, address: String::new(), body: body.into() }
    }

    pub fn reply(request_id: i32, response_to: i32, more_exist: bool, body: impl Into<Bytes>) -> Self {
        Self {
            request_id,
            response_to,
            op_code: OP_REPLY,
            flags: if more_exist { FLAG_MORE_EXIST } else { 0 },
            address: String::new(),
            body: body.into(),
        }
    }

    pub fn more_exist(&self) -> bool {
        self.flags & FLAG_MORE_EXIST != 0
    }

    pub fn encode(&self) -> Bytes {
        let len = HEADER_LEN + MIN_BODY_LEN + self.address.len() + self.body.len();
        let mut out = BytesMut::with_capacity(len);
        out.put_i32_le(len as i32);
        out.put_i32_le(self.request_id);
        out.put_i32_le(self.response_to);
        out.put_i32_le(self.op_code);
        out.put_u32_le(self.flags);
        out.put_slice(self.address.as_bytes());
        out.put_u8(0);
        out.put_slice(&self.body);
        out.freeze()
    }

    /// Decode the part of a frame following its header.
    pub fn decode(hdr: MessageHeader, body: Bytes) -> Result<Self> {
        if body.len() < MIN_BODY_LEN {
            return Err(Error::Protocol("truncated frame".into()));
        }
        let mut body = body;
        let flags = body.get_u32_le();
        let nul = body
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("unterminated address".into()))?;
        let address = std::str::from_utf8(&body[..nul])
            .map_err(|_| Error::Protocol("address is not UTF-8".into()))?
            .to_string();
        body.advance(nul + 1);
        Ok(Self {
            request_id: hdr.request_id,
            response_to: hdr.response_to,
            op_code: hdr.op_code,
            flags,
            address,
            body,
        })
    }
}

/// Read one frame. `None` on a clean end of stream between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max_len: usize) -> Result<Option<Frame>> {
    let mut header_buf = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e.into());
    }
    let hdr = MessageHeader::parse(&header_buf).ok_or_else(|| Error::Protocol("invalid message header".into()))?;
    let total = usize::try_from(hdr.message_length).unwrap_or(0);
    if total < HEADER_LEN + MIN_BODY_LEN {
        return Err(Error::Protocol(format!("invalid message length {}", hdr.message_length)));
    }
    if total > max_len {
        return Err(Error::Protocol(format!("message of {} bytes exceeds limit of {}", total, max_len)));
    }
    let mut body = BytesMut::zeroed(total - HEADER_LEN);
    reader.read_exact(&mut body).await?;
    Frame::decode(hdr, body.freeze()).map(Some)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
