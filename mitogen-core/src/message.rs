//! Wire framing for routed messages.
//!
//! Every message travels as a fixed 27 byte big-endian header followed by
//! exactly `len` payload bytes:
//!
//! ```text
//! +-------+--------+--------+---------+--------+----------+-------+-----+---------+
//! | magic | dst_id | src_id | auth_id | handle | reply_to | flags | len | payload |
//! |  u16  |  u32   |  u32   |   u32   |  u32   |   u32    |  u8   | u32 |  [len]  |
//! +-------+--------+--------+---------+--------+----------+-------+-----+---------+
//! ```
//!
//! `auth_id` is the context whose authority the message carries. It equals
//! `src_id` unless a trusted stream stamped its own authority on the way.
//!
//! [`MessageDecoder`] only yields a [`Message`] once its whole frame is
//! buffered, however the transport fragments it.
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

use crate::{CallError, DeadReason, Error, Result};

pub type ContextId = u32;
pub type Handle = u32;

/// Context id of the master process.
pub const MASTER_ID: ContextId = 0;

/// Reserved handle for synthetic disconnect notices.
pub const DISCONNECT: Handle = 0;
/// `reply_to` value meaning no reply is expected.
pub const NO_REPLY: Handle = 0;

pub const CALL_FUNCTION: Handle = 101;
pub const ADD_ROUTE: Handle = 103;
pub const DEL_ROUTE: Handle = 104;
pub const ALLOCATE_ID: Handle = 105;
pub const SHUTDOWN: Handle = 106;
pub const CONTEXT_SERVICE: Handle = 110;
pub const FILE_SERVICE: Handle = 111;

/// Dynamically allocated handles start here; lower values are well-known.
pub const FIRST_DYNAMIC_HANDLE: Handle = 1000;

pub const HEADER_LEN: usize = 27;
const MAGIC: u16 = 0x4d49;
const FLAG_DEAD: u8 = 0x01;

/// A routed unit of data.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub dst_id: ContextId,
    pub src_id: ContextId,
    pub auth_id: ContextId,
    pub handle: Handle,
    pub reply_to: Handle,
    pub is_dead: bool,
    pub data: Bytes,
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message({} <- {} (auth {}), handle={}, reply_to={}, dead={}, {} bytes)",
            self.dst_id,
            self.src_id,
            self.auth_id,
            self.handle,
            self.reply_to,
            self.is_dead,
            self.data.len()
        )
    }
}

impl Message {
    pub fn new(dst_id: ContextId, handle: Handle, data: impl Into<Bytes>) -> Self {
        Self {
            dst_id,
            src_id: MASTER_ID,
            auth_id: MASTER_ID,
            handle,
            reply_to: NO_REPLY,
            is_dead: false,
            data: data.into(),
        }
    }

    /// Message whose payload is the plain JSON encoding of `value`.
    pub fn encoded<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::new(MASTER_ID, NO_REPLY, serde_json::to_vec(value)?))
    }

    /// Message carrying `value` as a successful reply envelope, the format
    /// [`Message::unpickle`] expects.
    pub fn pickled<T: Serialize>(value: &T) -> Result<Self> {
        Self::encoded(&Ok::<&T, CallError>(value))
    }

    /// Dead message explaining why it was synthesized.
    pub fn dead(reason: &DeadReason) -> Self {
        let data = serde_json::to_vec(reason).unwrap_or_default();
        Self {
            is_dead: true,
            ..Self::new(MASTER_ID, NO_REPLY, data)
        }
    }

    /// Reply envelope addressed to this message's sender and reply handle.
    pub fn reply<T: Serialize>(&self, result: &std::result::Result<T, CallError>) -> Result<Self> {
        Ok(Self {
            dst_id: self.src_id,
            handle: self.reply_to,
            ..Self::encoded(result)?
        })
    }

    pub fn with_dst(mut self, dst_id: ContextId, handle: Handle) -> Self {
        self.dst_id = dst_id;
        self.handle = handle;
        self
    }

    pub fn with_reply_to(mut self, reply_to: Handle) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn dead_reason(&self) -> DeadReason {
        serde_json::from_slice(&self.data).unwrap_or(DeadReason::Disconnected)
    }

    /// Decode the payload as plain JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        if self.is_dead {
            return Err(self.dead_reason().into());
        }
        Ok(serde_json::from_slice(&self.data)?)
    }

    /// Decode a reply envelope, surfacing a remote failure as
    /// [`Error::Call`].
    pub fn unpickle<T: DeserializeOwned>(&self) -> Result<T> {
        self.decode::<std::result::Result<T, CallError>>()?
            .map_err(Error::Call)
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.frame_len());
        dst.put_u16(MAGIC);
        dst.put_u32(self.dst_id);
        dst.put_u32(self.src_id);
        dst.put_u32(self.auth_id);
        dst.put_u32(self.handle);
        dst.put_u32(self.reply_to);
        dst.put_u8(if self.is_dead { FLAG_DEAD } else { 0 });
        dst.put_u32(self.data.len() as u32);
        dst.put_slice(&self.data);
    }

    pub fn to_frame(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.encode(&mut buf);
        buf.to_vec()
    }
}

/// Incremental frame decoder owning a stream's read buffer.
pub struct MessageDecoder {
    buf: BytesMut,
    max_message_size: usize,
}

impl MessageDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete message, `Ok(None)` if more bytes are needed.
    pub fn decode(&mut self) -> Result<Option<Message>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = &self.buf[..HEADER_LEN];
        let magic = header.get_u16();
        if magic != MAGIC {
            return Err(Error::Protocol(format!("bad magic: {magic:#06x}")));
        }
        let dst_id = header.get_u32();
        let src_id = header.get_u32();
        let auth_id = header.get_u32();
        let handle = header.get_u32();
        let reply_to = header.get_u32();
        let flags = header.get_u8();
        let len = header.get_u32() as usize;
        if len > self.max_message_size {
            return Err(Error::Protocol(format!(
                "message too large (max {} bytes)",
                self.max_message_size
            )));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let data = self.buf.split_to(len).freeze();
        Ok(Some(Message {
            dst_id,
            src_id,
            auth_id,
            handle,
            reply_to,
            is_dead: flags & FLAG_DEAD != 0,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: u32, len: usize) -> Message {
        Message {
            dst_id: i,
            src_id: i + 1,
            auth_id: i + 2,
            handle: 1000 + i,
            reply_to: 2000 + i,
            is_dead: i % 3 == 0,
            data: Bytes::from((0..len).map(|b| (b % 251) as u8).collect::<Vec<_>>()),
        }
    }

    #[test]
    fn fragmented_frames_decode_exactly() {
        let messages: Vec<_> = (0..20).map(|i| sample(i, (i as usize * 37) % 300)).collect();
        let mut wire = BytesMut::new();
        for m in &messages {
            m.encode(&mut wire);
        }

        for chunk in [1usize, 2, 3, 7, 26, 27, 28, 64, 4096] {
            let mut decoder = MessageDecoder::new(1024);
            let mut out = Vec::new();
            for piece in wire.chunks(chunk) {
                decoder.extend(piece);
                while let Some(m) = decoder.decode().unwrap() {
                    out.push(m);
                }
            }
            assert_eq!(out, messages, "chunk size {chunk}");
            assert_eq!(decoder.buffered(), 0);
        }
    }

    #[test]
    fn irregular_fragments_decode_exactly() {
        let messages: Vec<_> = (0..10).map(|i| sample(i, 100 + i as usize)).collect();
        let mut wire = Vec::new();
        for m in &messages {
            wire.extend_from_slice(&m.to_frame());
        }
        let mut decoder = MessageDecoder::new(1024);
        let mut out = Vec::new();
        let mut pos = 0;
        let mut step = 1;
        while pos < wire.len() {
            let end = (pos + step).min(wire.len());
            decoder.extend(&wire[pos..end]);
            while let Some(m) = decoder.decode().unwrap() {
                out.push(m);
            }
            pos = end;
            step = step * 7 % 61 + 1;
        }
        assert_eq!(out, messages);
    }

    #[test]
    fn partial_frame_yields_nothing() {
        let frame = sample(1, 50).to_frame();
        let mut decoder = MessageDecoder::new(1024);
        decoder.extend(&frame[..frame.len() - 1]);
        assert!(decoder.decode().unwrap().is_none());
        decoder.extend(&frame[frame.len() - 1..]);
        assert_eq!(decoder.decode().unwrap(), Some(sample(1, 50)));
    }

    #[test]
    fn header_layout() {
        let msg = Message {
            dst_id: 1,
            src_id: 2,
            auth_id: 3,
            handle: 4,
            reply_to: 5,
            is_dead: true,
            data: Bytes::from_static(b"xy"),
        };
        assert_eq!(
            msg.to_frame(),
            [
                0x4d, 0x49, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0, 4, 0, 0, 0, 5, 1, 0, 0, 0,
                2, b'x', b'y'
            ]
        );
    }

    #[test]
    fn rejects_bad_magic() {
        let mut frame = sample(1, 4).to_frame();
        frame[0] = 0;
        let mut decoder = MessageDecoder::new(1024);
        decoder.extend(&frame);
        assert!(matches!(decoder.decode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn rejects_oversize_frame() {
        let frame = sample(1, 8192).to_frame();
        let mut decoder = MessageDecoder::new(4096);
        decoder.extend(&frame[..HEADER_LEN]);
        match decoder.decode() {
            Err(Error::Protocol(msg)) => assert_eq!(msg, "message too large (max 4096 bytes)"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unpickle_surfaces_remote_errors() {
        let ok = Message::pickled(&123u32).unwrap();
        assert_eq!(ok.unpickle::<u32>().unwrap(), 123);

        let request = Message::new(5, 1000, Vec::new()).with_reply_to(1234);
        let failed = request
            .reply::<()>(&Err(CallError::new("remote went bang")))
            .unwrap();
        assert_eq!(failed.dst_id, request.src_id);
        assert_eq!(failed.handle, 1234);
        match failed.unpickle::<()>() {
            Err(Error::Call(e)) => assert_eq!(e.message(), "remote went bang"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dead_messages_carry_their_reason() {
        let dead = Message::dead(&DeadReason::NoRoute(9));
        assert!(dead.is_dead);
        assert!(matches!(dead.unpickle::<u32>(), Err(Error::Routing(9))));
        let dead = Message::dead(&DeadReason::Disconnected);
        assert!(matches!(
            dead.unpickle::<u32>(),
            Err(Error::Dead(DeadReason::Disconnected))
        ));
    }
}
