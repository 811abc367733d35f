//! Wire protocol shared by the session server and its clients.
//!
//! - [`command`]: client/company identities and scheduled command packets
//! - [`packet`]: packet type tags, error codes and packet bodies
//! - [`framer`]: length-prefixed framing and the encryption seam

pub mod command;
pub mod framer;
pub mod packet;

pub use command::{ClientId, CommandPacket, CommandRequest, CompanyId};
pub use framer::{Decoded, FrameError, Framer, PacketCipher, HEADER_SIZE, TCP_MTU};
pub use packet::{
    ChatAction, ChatDestination, ClientInfo, ClientPacket, Direction, ErrorCode, GameInfo,
    GrfIdentifier, Message, PacketType, ServerPacket,
};

/// Revision string a client must present in `JOIN`.
pub const NETWORK_REVISION: &str = concat!("lockstep-", env!("CARGO_PKG_VERSION"));
/// Longest client name, in bytes.
pub const NETWORK_CLIENT_NAME_LENGTH: usize = 24;
/// Longest chat message, in bytes.
pub const NETWORK_CHAT_LENGTH: usize = 900;
/// Longest server name, in bytes.
pub const NETWORK_NAME_LENGTH: usize = 80;
/// Longest remote console command, in bytes.
pub const NETWORK_RCONCOMMAND_LENGTH: usize = 500;
/// Framing plus the length prefix bincode puts before a map chunk.
pub const MAP_DATA_OVERHEAD: usize = HEADER_SIZE + 8;
/// Framing plus the fixed fields of a distributed `COMMAND`: client id,
/// company, command id, data length prefix, frame and the own-command flag.
pub const COMMAND_OVERHEAD: usize = HEADER_SIZE + 2 + 1 + 2 + 8 + 4 + 1;
