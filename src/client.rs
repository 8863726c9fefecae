//! Minimal async client for the persistor bus.
//!
//! Requests on one client are sequential: each call writes a frame and waits
//! for the reply that answers it.

use crate::Document;
use crate::error::{Error, Result};
use crate::protocol::{Frame, OP_REPLY, read_frame, write_frame};
use crate::reply::STATUS_MORE_EXIST;
use rand::Rng;
use serde_json::Value;
use tokio::net::{TcpStream, ToSocketAddrs};

const MAX_REPLY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Reply {
    /// Frame id of the reply; continuations answer it.
    pub id: i32,
    pub more_exist: bool,
    pub body: Document,
}

impl Reply {
    pub fn status(&self) -> &str {
        self.body.get("status").and_then(Value::as_str).unwrap_or("")
    }
}

pub struct Client {
    stream: TcpStream,
    next_id: i32,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        // Random start keeps ids of concurrent clients apart in logs
        let next_id = rand::thread_rng().gen_range(1..1_000_000);
        Ok(Self { stream, next_id })
    }

    fn take_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = if id == i32::MAX { 1 } else { id + 1 };
        id
    }

    /// Send a request to `address`.
    pub async fn send(&mut self, address: &str, body: &Value) -> Result<Reply> {
        let id = self.take_id();
        let frame = Frame::send(id, address, serde_json::to_vec(body)?);
        self.round_trip(frame).await
    }

    /// Ask for the next batch of a `more-exist` reply.
    pub async fn continue_from(&mut self, reply_id: i32) -> Result<Reply> {
        let id = self.take_id();
        let frame = Frame::continuation(id, reply_id, &b"{}"[..]);
        self.round_trip(frame).await
    }

    /// Send a find and follow continuations; returns every result.
    pub async fn find_all(&mut self, address: &str, body: &Value) -> Result<Vec<Value>> {
        let mut reply = self.send(address, body).await?;
        let mut out = Vec::new();
        loop {
            match reply.body.get("results") {
                Some(Value::Array(docs)) => out.extend(docs.iter().cloned()),
                _ => {
                    let msg = reply.body.get("message").and_then(Value::as_str).unwrap_or("no results");
                    return Err(Error::Msg(msg.to_string()));
                }
            }
            if reply.status() != STATUS_MORE_EXIST {
                return Ok(out);
            }
            reply = self.continue_from(reply.id).await?;
        }
    }

    async fn round_trip(&mut self, frame: Frame) -> Result<Reply> {
        write_frame(&mut self.stream, &frame).await?;
        let reply = read_frame(&mut self.stream, MAX_REPLY_BYTES)
            .await?
            .ok_or_else(|| Error::Protocol("connection closed".into()))?;
        if reply.op_code != OP_REPLY || reply.response_to != frame.request_id {
            return Err(Error::Protocol(format!(
                "unexpected frame op_code={} response_to={}",
                reply.op_code, reply.response_to
            )));
        }
        let body: Document = serde_json::from_slice(&reply.body)?;
        Ok(Reply { id: reply.request_id, more_exist: reply.more_exist(), body })
    }
}
