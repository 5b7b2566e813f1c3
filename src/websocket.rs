//! RFC 6455 WebSocket frames over an already-upgraded connection.
//!
//! Grounded on the frame/message split used by `fastwebsockets`
//! (`examples/other_examples/ff9a1778_willrnch-fastwebsockets...`): a raw
//! frame codec underneath, with fragmentation reassembly folded into one
//! message-level `receive()` so callers never see a bare continuation frame,
//! matching the message-oriented contract in the specification rather than
//! `fastwebsockets`' frame-oriented one.

use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{errors::WebSocketErrorKind, limits::WebSocketLimits};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from a client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Which side of the connection this [`WebSocket`] plays. Controls masking:
/// clients mask outgoing frames, servers never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            _ => return None,
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

struct Frame {
    fin: bool,
    opcode: OpCode,
    payload: Vec<u8>,
}

/// A reassembled, application-visible WebSocket message.
#[derive(Debug)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    /// A close frame was received (and already echoed back). The connection
    /// should be torn down after observing this.
    Close(Option<(u16, String)>),
}

/// A WebSocket connection in either role, after the HTTP upgrade completed.
pub struct WebSocket<IO> {
    io: IO,
    role: Role,
    limits: WebSocketLimits,
    closed: bool,
    fragment: Option<(OpCode, Vec<u8>)>,
}

impl<IO: AsyncRead + AsyncWrite + Unpin> WebSocket<IO> {
    pub fn new(io: IO, role: Role, limits: WebSocketLimits) -> Self {
        Self {
            io,
            role,
            limits,
            closed: false,
            fragment: None,
        }
    }

    /// Reads and reassembles the next application message, transparently
    /// answering pings and dropping pongs. Returns `Ok(Message::Close(..))`
    /// exactly once, after which the socket should not be read again.
    pub async fn receive(&mut self) -> Result<Message, WebSocketErrorKind> {
        loop {
            let frame = self.read_frame().await?;

            match frame.opcode {
                OpCode::Ping => {
                    if frame.payload.len() > 125 {
                        return Err(WebSocketErrorKind::LargeControlFrame);
                    }
                    self.write_frame(OpCode::Pong, &frame.payload).await?;
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    let parsed = parse_close_payload(&frame.payload);
                    let echo = frame.payload;
                    let _ = self.write_frame(OpCode::Close, &echo).await;
                    self.closed = true;
                    return Ok(Message::Close(parsed));
                }
                OpCode::Text | OpCode::Binary if frame.fin => {
                    if self.fragment.is_some() {
                        return Err(WebSocketErrorKind::NestedFragment);
                    }
                    return self.finish_message(frame.opcode, frame.payload);
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragment.is_some() {
                        return Err(WebSocketErrorKind::NestedFragment);
                    }
                    self.fragment = Some((frame.opcode, frame.payload));
                }
                OpCode::Continuation => {
                    let Some((kind, mut buf)) = self.fragment.take() else {
                        return Err(WebSocketErrorKind::UnexpectedContinuation);
                    };
                    buf.extend_from_slice(&frame.payload);
                    if buf.len() > self.limits.max_message_size {
                        return Err(WebSocketErrorKind::MessageTooLarge);
                    }
                    if frame.fin {
                        return self.finish_message(kind, buf);
                    }
                    self.fragment = Some((kind, buf));
                }
            }
        }
    }

    fn finish_message(&mut self, opcode: OpCode, payload: Vec<u8>) -> Result<Message, WebSocketErrorKind> {
        match opcode {
            OpCode::Text => {
                simdutf8::basic::from_utf8(&payload).map_err(|_| WebSocketErrorKind::InvalidUtf8)?;
                // `simdutf8` already proved validity; `String::from_utf8`
                // only re-checks it, cheaply, once more.
                let text = String::from_utf8(payload).map_err(|_| WebSocketErrorKind::InvalidUtf8)?;
                Ok(Message::Text(text))
            }
            OpCode::Binary => Ok(Message::Binary(payload)),
            _ => unreachable!("finish_message only called for Text/Binary"),
        }
    }

    /// Sends a text message.
    pub async fn send_text(&mut self, text: &str) -> Result<(), WebSocketErrorKind> {
        self.write_frame(OpCode::Text, text.as_bytes()).await
    }

    /// Sends a binary message.
    pub async fn send_binary(&mut self, data: &[u8]) -> Result<(), WebSocketErrorKind> {
        self.write_frame(OpCode::Binary, data).await
    }

    /// Sends a ping; payload must not exceed 125 bytes.
    pub async fn ping(&mut self, payload: &[u8]) -> Result<(), WebSocketErrorKind> {
        if payload.len() > 125 {
            return Err(WebSocketErrorKind::LargeControlFrame);
        }
        self.write_frame(OpCode::Ping, payload).await
    }

    /// Sends a close frame with an optional code/reason and marks the
    /// socket closed; further sends will fail.
    pub async fn close(&mut self, code: Option<u16>, reason: &str) -> Result<(), WebSocketErrorKind> {
        let mut payload = Vec::new();
        if let Some(code) = code {
            payload.extend_from_slice(&code.to_be_bytes());
            payload.extend_from_slice(reason.as_bytes());
        }
        let result = self.write_frame(OpCode::Close, &payload).await;
        self.closed = true;
        result
    }

    async fn write_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), WebSocketErrorKind> {
        if self.closed && opcode != OpCode::Close {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "write after close").into());
        }

        let mask = self.role == Role::Client;
        let mut header = Vec::with_capacity(14);
        header.push(0x80 | opcode.as_u8());

        let len = payload.len();
        let mask_bit = if mask { 0x80 } else { 0x00 };
        if len < 126 {
            header.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            header.push(mask_bit | 126);
            header.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            header.push(mask_bit | 127);
            header.extend_from_slice(&(len as u64).to_be_bytes());
        }

        self.io.write_all(&header).await?;
        if mask {
            let key = random_mask_key();
            self.io.write_all(&key).await?;
            let mut masked = payload.to_vec();
            apply_mask(&mut masked, &key);
            self.io.write_all(&masked).await?;
        } else {
            self.io.write_all(payload).await?;
        }
        self.io.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame, WebSocketErrorKind> {
        let mut head = [0u8; 2];
        self.io.read_exact(&mut head).await?;

        let fin = head[0] & 0x80 != 0;
        if head[0] & 0x70 != 0 {
            return Err(WebSocketErrorKind::ReservedFlags);
        }
        let opcode = OpCode::from_u8(head[0] & 0x0F).ok_or(WebSocketErrorKind::InvalidOpcode)?;
        let masked = head[1] & 0x80 != 0;
        let len_bits = head[1] & 0x7F;

        let len = match len_bits {
            126 => {
                let mut ext = [0u8; 2];
                self.io.read_exact(&mut ext).await?;
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.io.read_exact(&mut ext).await?;
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };

        if opcode.is_control() && len > 125 {
            return Err(WebSocketErrorKind::LargeControlFrame);
        }
        if len > self.limits.max_frame_size {
            return Err(WebSocketErrorKind::MessageTooLarge);
        }

        let mask_key = if masked {
            let mut key = [0u8; 4];
            self.io.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        let mut payload = vec![0u8; len];
        self.io.read_exact(&mut payload).await?;
        if let Some(key) = mask_key {
            apply_mask(&mut payload, &key);
        }

        Ok(Frame { fin, opcode, payload })
    }
}

fn apply_mask(data: &mut [u8], key: &[u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

fn random_mask_key() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

fn parse_close_payload(payload: &[u8]) -> Option<(u16, String)> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    Some((code, reason))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn mask_roundtrip() {
        let key = [1, 2, 3, 4];
        let mut data = b"hello world".to_vec();
        apply_mask(&mut data, &key);
        apply_mask(&mut data, &key);
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn parse_close_payload_empty() {
        assert_eq!(parse_close_payload(&[]), None);
    }

    #[test]
    fn parse_close_payload_with_reason() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        assert_eq!(parse_close_payload(&payload), Some((1000, "bye".to_string())));
    }
}
