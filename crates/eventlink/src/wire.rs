// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multipart message framing shared by the request/reply and publish
//! channels.
//!
//! # Greeting
//!
//! Both peers send a 6-byte greeting right after the TCP connection opens and
//! read the other side's:
//!
//! ```text
//! ┌──────────────┬─────────┬─────────────┐
//! │ "ELNK"       │ version │ socket kind │
//! │ 4 bytes      │ 1 byte  │ 1 byte      │
//! └──────────────┴─────────┴─────────────┘
//! ```
//!
//! # Frames
//!
//! ```text
//! ┌────────┬──────────────┬─────────────────┐
//! │ flags  │ length (BE)  │ body            │
//! │ 1 byte │ 4 bytes      │ length bytes    │
//! └────────┴──────────────┴─────────────────┘
//! ```
//!
//! A message is every frame up to and including the first frame without the
//! `MORE` flag. Requests and replies are single-frame messages; publishes are
//! two frames, topic first.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::trace;

use crate::errors::WireError;

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const FLAG_MORE: u8 = 0x01;
const FRAME_HEADER_LEN: usize = 5;
const GREETING_MAGIC: &[u8; 4] = b"ELNK";
const PROTOCOL_VERSION: u8 = 1;

/// A message as an ordered list of frames.
pub type Multipart = Vec<Bytes>;

/// A framed connection after a successful greeting.
pub type Connection<S = TcpStream> = Framed<S, MultipartCodec>;

/// Role a peer plays on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum SocketKind {
    #[display("REQ")]
    Req,
    #[display("REP")]
    Rep,
    #[display("PUB")]
    Pub,
    #[display("SUB")]
    Sub,
}

impl SocketKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Req => 1,
            Self::Rep => 2,
            Self::Pub => 3,
            Self::Sub => 4,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Req),
            2 => Some(Self::Rep),
            3 => Some(Self::Pub),
            4 => Some(Self::Sub),
            _ => None,
        }
    }

    /// The only kind this socket may talk to.
    pub fn peer(self) -> Self {
        match self {
            Self::Req => Self::Rep,
            Self::Rep => Self::Req,
            Self::Pub => Self::Sub,
            Self::Sub => Self::Pub,
        }
    }
}

/// Codec for multipart messages.
#[derive(Debug, Default)]
pub struct MultipartCodec {
    pending: Vec<Bytes>,
}

impl Decoder for MultipartCodec {
    type Item = Multipart;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if src.len() < FRAME_HEADER_LEN {
                return Ok(None);
            }
            let flags = src[0];
            let len = (&src[1..FRAME_HEADER_LEN]).get_u32() as usize;
            if len > MAX_FRAME_LEN {
                return Err(WireError::FrameTooLarge(len));
            }
            if src.len() < FRAME_HEADER_LEN + len {
                src.reserve(FRAME_HEADER_LEN + len - src.len());
                return Ok(None);
            }
            src.advance(FRAME_HEADER_LEN);
            self.pending.push(src.split_to(len).freeze());
            if flags & FLAG_MORE == 0 {
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
        }
    }
}

impl Encoder<Multipart> for MultipartCodec {
    type Error = WireError;

    fn encode(&mut self, frames: Multipart, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frames.is_empty() {
            dst.put_u8(0);
            dst.put_u32(0);
            return Ok(());
        }
        let last = frames.len() - 1;
        for (i, frame) in frames.iter().enumerate() {
            if frame.len() > MAX_FRAME_LEN {
                return Err(WireError::FrameTooLarge(frame.len()));
            }
            dst.reserve(FRAME_HEADER_LEN + frame.len());
            dst.put_u8(if i < last { FLAG_MORE } else { 0 });
            dst.put_u32(frame.len() as u32);
            dst.put_slice(frame);
        }
        Ok(())
    }
}

/// Exchanges greetings and checks that the peer is the matching kind.
pub async fn handshake<S>(stream: &mut S, local: SocketKind) -> Result<SocketKind, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut greeting = [0u8; 6];
    greeting[..4].copy_from_slice(GREETING_MAGIC);
    greeting[4] = PROTOCOL_VERSION;
    greeting[5] = local.to_byte();
    stream.write_all(&greeting).await?;
    stream.flush().await?;

    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            WireError::Closed
        } else {
            WireError::Io(e)
        }
    })?;
    if &reply[..4] != GREETING_MAGIC {
        return Err(WireError::Greeting("bad magic".to_string()));
    }
    if reply[4] != PROTOCOL_VERSION {
        return Err(WireError::Greeting(format!(
            "unsupported version {}",
            reply[4]
        )));
    }
    let remote = SocketKind::from_byte(reply[5])
        .ok_or_else(|| WireError::Greeting(format!("unknown socket kind {}", reply[5])))?;
    if remote != local.peer() {
        return Err(WireError::Greeting(format!(
            "{local} socket cannot talk to {remote}"
        )));
    }
    trace!("handshake complete: {local} <-> {remote}");
    Ok(remote)
}

/// Opens a TCP connection to `addr` and performs the greeting.
pub async fn connect(addr: &str, local: SocketKind) -> Result<Connection, WireError> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    handshake(&mut stream, local).await?;
    Ok(Framed::new(stream, MultipartCodec::default()))
}

/// Performs the greeting on an accepted stream.
pub async fn accept(mut stream: TcpStream, local: SocketKind) -> Result<Connection, WireError> {
    stream.set_nodelay(true)?;
    handshake(&mut stream, local).await?;
    Ok(Framed::new(stream, MultipartCodec::default()))
}
