//! Length-framed reads/writes over a bare [`TcpStream`], with an
//! optional AES-256-CBC layer for `SECURE_TCP` endpoints.
//!
//! A zero-byte payload is framed as a sentinel length (`i32::MAX`)
//! rather than a literal `0`, so a legitimate empty message can never
//! be mistaken for a connection that closed mid-frame. In secure
//! mode the length header is itself one AES block, encrypted and
//! sent before the (separately encrypted) payload.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::crypto::CryptoContext;
use crate::{Error, Result};

const ZERO_LEN_SENTINEL: i32 = i32::MAX;
const MAX_FRAME_LEN: usize = (1 << 28) - 1;
const AES_BLOCK_LEN: usize = 16;

/// Result of a single `recv_sized` call.
#[derive(Debug)]
pub enum Frame {
    /// A legitimate zero-byte application message.
    Empty,
    Payload(Vec<u8>),
    /// The peer closed the connection cleanly between frames.
    Eof,
}

pub struct TcpEndpoint {
    stream: TcpStream,
    crypto: Option<CryptoContext>,
}

impl TcpEndpoint {
    pub fn new(stream: TcpStream, crypto: Option<CryptoContext>) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream, crypto })
    }

    pub async fn connect(addr: SocketAddr, crypto: Option<CryptoContext>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, crypto)
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub async fn send_sized(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(Error::OversizedFrame);
        }
        let len: i32 = if payload.is_empty() {
            ZERO_LEN_SENTINEL
        } else {
            payload.len() as i32
        };
        let header = len.to_le_bytes();

        match &self.crypto {
            Some(ctx) => {
                self.stream.write_all(&ctx.encrypt(&header)).await?;
                if !payload.is_empty() {
                    self.stream.write_all(&ctx.encrypt(payload)).await?;
                }
            }
            None => {
                self.stream.write_all(&header).await?;
                if !payload.is_empty() {
                    self.stream.write_all(payload).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn recv_sized(&mut self) -> Result<Frame> {
        let len = match self.read_length_header().await? {
            Some(len) => len,
            None => return Ok(Frame::Eof),
        };

        if len == ZERO_LEN_SENTINEL {
            return Ok(Frame::Empty);
        }
        if len < 0 || len as usize > MAX_FRAME_LEN {
            return Err(Error::OversizedFrame);
        }
        let len = len as usize;

        let payload = match &self.crypto {
            Some(ctx) => {
                let padded_len = (len / AES_BLOCK_LEN + 1) * AES_BLOCK_LEN;
                let mut ciphertext = vec![0u8; padded_len];
                self.read_exact_or_violation(&mut ciphertext).await?;
                let plaintext = ctx.decrypt(&ciphertext)?;
                if plaintext.len() != len {
                    return Err(Error::FramingViolation);
                }
                plaintext
            }
            None => {
                let mut buf = vec![0u8; len];
                self.read_exact_or_violation(&mut buf).await?;
                buf
            }
        };
        Ok(Frame::Payload(payload))
    }

    /// Reads the length header, returning `None` if the peer closed
    /// the stream before sending a single byte of a new frame.
    async fn read_length_header(&mut self) -> Result<Option<i32>> {
        match &self.crypto {
            Some(ctx) => {
                let mut header_ct = [0u8; AES_BLOCK_LEN];
                if !self.read_or_eof(&mut header_ct).await? {
                    return Ok(None);
                }
                let plain = ctx.decrypt(&header_ct)?;
                if plain.len() != 4 {
                    return Err(Error::FramingViolation);
                }
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&plain);
                Ok(Some(i32::from_le_bytes(bytes)))
            }
            None => {
                let mut header = [0u8; 4];
                if !self.read_or_eof(&mut header).await? {
                    return Ok(None);
                }
                Ok(Some(i32::from_le_bytes(header)))
            }
        }
    }

    /// Fills `buf` entirely, returning `Ok(false)` only if the peer
    /// closed the connection before a single byte arrived. Any EOF
    /// after a partial fill is a framing violation, not a clean close.
    async fn read_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(Error::FramingViolation);
            }
            filled += n;
        }
        Ok(true)
    }

    async fn read_exact_or_violation(&mut self, buf: &mut [u8]) -> Result<()> {
        if !self.read_or_eof(buf).await? {
            return Err(Error::FramingViolation);
        }
        Ok(())
    }
}
