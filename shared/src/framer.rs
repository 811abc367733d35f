//! Length-prefixed, type-tagged framing over a byte stream.
//!
//! ```text
//! +------------------+-----------+-------------------------+
//! | size (u16 LE)    | type (u8) | body (size - 3 bytes)   |
//! +------------------+-----------+-------------------------+
//! ```
//!
//! `size` counts the whole frame, header included. Once a [`PacketCipher`]
//! is installed, `type + body` are sealed by it and only `size` stays in the
//! clear.

use crate::packet::{Message, PacketType};

/// Bytes before the type tag.
pub const SIZE_PREFIX: usize = 2;
/// Size prefix plus type tag.
pub const HEADER_SIZE: usize = SIZE_PREFIX + 1;
/// Largest frame a stream connection carries by default.
pub const TCP_MTU: usize = 32767;

/// Errors produced while framing or decoding packets.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("declared frame size {size} is smaller than the header")]
    Undersized { size: usize },

    #[error("frame size {size} exceeds maximum {max}")]
    Oversized { size: usize, max: usize },

    #[error("unknown packet type {0}")]
    UnknownType(u8),

    #[error("packet type {0:?} is not valid in this direction")]
    WrongDirection(PacketType),

    #[error("malformed {kind:?} body: {source}")]
    Body {
        kind: PacketType,
        source: bincode::Error,
    },

    #[error("{kind:?} carries {extra} unexpected bytes")]
    TrailingBytes { kind: PacketType, extra: usize },

    #[error("failed to encode packet body: {0}")]
    Encode(bincode::Error),

    #[error("sealed frame failed to open")]
    Cipher,
}

/// Symmetric encryption applied to the tagged part of each frame.
///
/// The handshake that derives keys is not part of this crate; an
/// authenticator hands a ready cipher to the session once it succeeds.
pub trait PacketCipher: Send {
    fn seal(&mut self, plain: &[u8]) -> Vec<u8>;

    /// Returns `None` when the frame fails authentication.
    fn open(&mut self, sealed: &[u8]) -> Option<Vec<u8>>;

    /// Bytes `seal` adds to every frame, such as an authentication tag.
    fn overhead(&self) -> usize {
        0
    }
}

/// Result of trying to take one frame off a buffer.
#[derive(Debug)]
pub enum Decoded<M> {
    Packet { packet: M, consumed: usize },
    NeedMoreData,
}

/// Encoder/decoder with a fixed maximum frame size.
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    max_frame_size: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(TCP_MTU)
    }
}

impl Framer {
    /// The size is clamped between the header size and what the `u16`
    /// prefix can express.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.clamp(HEADER_SIZE, u16::MAX as usize),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Reads the declared size of the next frame, if the prefix is buffered.
    ///
    /// `quota` is the most this connection could ever buffer; a frame that
    /// can never fit is malformed rather than pending.
    pub fn peek_size(&self, buffer: &[u8], quota: usize) -> Result<Option<usize>, FrameError> {
        if buffer.len() < SIZE_PREFIX {
            return Ok(None);
        }

        let size = u16::from_le_bytes([buffer[0], buffer[1]]) as usize;
        if size < HEADER_SIZE {
            return Err(FrameError::Undersized { size });
        }

        let max = self.max_frame_size.min(quota);
        if size > max {
            return Err(FrameError::Oversized { size, max });
        }

        Ok(Some(size))
    }

    /// Takes one complete frame off the front of `buffer`.
    pub fn decode<M: Message>(
        &self,
        buffer: &[u8],
        quota: usize,
        cipher: Option<&mut (dyn PacketCipher + 'static)>,
    ) -> Result<Decoded<M>, FrameError> {
        let size = match self.peek_size(buffer, quota)? {
            Some(size) if buffer.len() >= size => size,
            _ => return Ok(Decoded::NeedMoreData),
        };

        let sealed = &buffer[SIZE_PREFIX..size];
        let opened;
        let tagged: &[u8] = match cipher {
            Some(cipher) => {
                opened = cipher.open(sealed).ok_or(FrameError::Cipher)?;
                &opened
            }
            None => sealed,
        };

        let (&tag, body) = tagged.split_first().ok_or(FrameError::Cipher)?;
        let kind = PacketType::from_u8(tag).ok_or(FrameError::UnknownType(tag))?;
        if kind.direction() != M::DIRECTION {
            return Err(FrameError::WrongDirection(kind));
        }

        let packet = M::decode_body(kind, body)?;
        Ok(Decoded::Packet {
            packet,
            consumed: size,
        })
    }

    /// Produces one complete frame for `packet`.
    pub fn encode<M: Message>(
        &self,
        packet: &M,
        cipher: Option<&mut (dyn PacketCipher + 'static)>,
    ) -> Result<Vec<u8>, FrameError> {
        let body = packet.encode_body()?;

        let mut tagged = Vec::with_capacity(1 + body.len());
        tagged.push(packet.packet_type() as u8);
        tagged.extend_from_slice(&body);

        let sealed = match cipher {
            Some(cipher) => cipher.seal(&tagged),
            None => tagged,
        };

        let size = SIZE_PREFIX + sealed.len();
        if size > self.max_frame_size {
            return Err(FrameError::Oversized {
                size,
                max: self.max_frame_size,
            });
        }

        let mut frame = Vec::with_capacity(size);
        frame.extend_from_slice(&(size as u16).to_le_bytes());
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Decodes every complete frame in `buffer`, stopping at the first
    /// partial one. Returns the packets and the number of bytes used.
    pub fn decode_all<M: Message>(&self, buffer: &[u8]) -> Result<(Vec<M>, usize), FrameError> {
        let mut packets = Vec::new();
        let mut offset = 0;

        while let Decoded::Packet { packet, consumed } =
            self.decode::<M>(&buffer[offset..], usize::MAX, None)?
        {
            packets.push(packet);
            offset += consumed;
        }

        Ok((packets, offset))
    }
}
