// src/transfer/frame.rs
//! Peer-to-peer transfer framing
//!
//! Every frame is `[u8 tag][u32 BE length][payload]` with the payload capped
//! at [`MAX_PAYLOAD`] bytes.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest payload a single frame may carry
pub const MAX_PAYLOAD: usize = 64 * 1024;

const TAG_HELLO: u8 = 1;
const TAG_DATA: u8 = 2;
const TAG_PAUSE: u8 = 3;
const TAG_RESUME: u8 = 4;
const TAG_END: u8 = 5;
const TAG_CANCEL: u8 = 6;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unknown frame tag {0}")]
    UnknownTag(u8),

    #[error("frame payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),

    #[error("malformed {0} frame: {1}")]
    Malformed(&'static str, String),

    #[error("connection closed mid-frame")]
    Truncated,
}

/// First frame on every connection, sent by the file owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub transfer_id: String,
    pub sender_id: String,
    pub file_name: String,
    pub total_size: u64,
    /// Base64 sealed box holding the per-transfer payload key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Hello(Hello),
    Data(Vec<u8>),
    Pause(u64),
    Resume(u64),
    End(u64),
    Cancel,
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "HELLO",
            Frame::Data(_) => "DATA",
            Frame::Pause(_) => "PAUSE",
            Frame::Resume(_) => "RESUME",
            Frame::End(_) => "END",
            Frame::Cancel => "CANCEL",
        }
    }

    fn encode(&self) -> Result<(u8, Vec<u8>), FrameError> {
        let encoded = match self {
            Frame::Hello(hello) => (
                TAG_HELLO,
                serde_json::to_vec(hello).map_err(|e| FrameError::Malformed("HELLO", e.to_string()))?,
            ),
            Frame::Data(bytes) => (TAG_DATA, bytes.clone()),
            Frame::Pause(offset) => (TAG_PAUSE, offset.to_be_bytes().to_vec()),
            Frame::Resume(offset) => (TAG_RESUME, offset.to_be_bytes().to_vec()),
            Frame::End(total) => (TAG_END, total.to_be_bytes().to_vec()),
            Frame::Cancel => (TAG_CANCEL, Vec::new()),
        };
        if encoded.1.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(encoded.1.len()));
        }
        Ok(encoded)
    }

    fn decode(tag: u8, payload: Vec<u8>) -> Result<Self, FrameError> {
        fn offset(name: &'static str, payload: &[u8]) -> Result<u64, FrameError> {
            let bytes: [u8; 8] = payload
                .try_into()
                .map_err(|_| FrameError::Malformed(name, format!("expected 8 bytes, got {}", payload.len())))?;
            Ok(u64::from_be_bytes(bytes))
        }

        match tag {
            TAG_HELLO => serde_json::from_slice(&payload)
                .map(Frame::Hello)
                .map_err(|e| FrameError::Malformed("HELLO", e.to_string())),
            TAG_DATA => Ok(Frame::Data(payload)),
            TAG_PAUSE => Ok(Frame::Pause(offset("PAUSE", &payload)?)),
            TAG_RESUME => Ok(Frame::Resume(offset("RESUME", &payload)?)),
            TAG_END => Ok(Frame::End(offset("END", &payload)?)),
            TAG_CANCEL if payload.is_empty() => Ok(Frame::Cancel),
            TAG_CANCEL => Err(FrameError::Malformed("CANCEL", "unexpected payload".to_string())),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

/// Reads frames from an async reader
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncReadExt + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Next frame, or `Ok(None)` on a clean close between frames
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let mut header = [0u8; 5];
        let first = self.reader.read(&mut header[..1]).await?;
        if first == 0 {
            return Ok(None);
        }
        self.read_exact(&mut header[1..]).await?;

        let tag = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload).await?;
        Frame::decode(tag, payload).map(Some)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes frames to an async writer.
///
/// The encoded frame is kept until every byte is out. If a write future is
/// dropped part-way the writer stays dirty, and the next write finishes the
/// interrupted frame before starting its own.
pub struct FrameWriter<W> {
    writer: W,
    pending: Vec<u8>,
    written: usize,
}

impl<W: AsyncWriteExt + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, pending: Vec::new(), written: 0 }
    }

    pub fn is_dirty(&self) -> bool {
        self.written < self.pending.len()
    }

    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        let (tag, payload) = frame.encode()?;
        self.finish_pending().await?;

        self.pending.clear();
        self.pending.push(tag);
        self.pending.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.pending.extend_from_slice(&payload);
        self.written = 0;
        self.finish_pending().await
    }

    /// Push out whatever is left of the last frame
    async fn finish_pending(&mut self) -> Result<(), FrameError> {
        while self.written < self.pending.len() {
            let n = self.writer.write(&self.pending[self.written..]).await?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            self.written += n;
        }
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
