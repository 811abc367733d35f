//! Identities and the command packets that drive the lockstep simulation.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire identity of a connected client.
///
/// Identities are small and dense: a session in pool slot `n` is
/// `ClientId(n + 1)`. `ClientId(0)` is reserved for the server itself, so
/// server-issued chat and commands can be attributed without a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u16);

impl ClientId {
    pub const SERVER: ClientId = ClientId(0);

    pub fn from_slot(slot: usize) -> Self {
        ClientId(slot as u16 + 1)
    }

    /// Pool slot this identity maps to, `None` for the server identity.
    pub fn slot(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Company (player context) a client plays as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompanyId(pub u8);

impl CompanyId {
    pub const SPECTATOR: CompanyId = CompanyId(255);
    pub const NEW_COMPANY: CompanyId = CompanyId(254);

    pub fn is_spectator(self) -> bool {
        self == Self::SPECTATOR
    }

    /// True for spectator, new-company, or an index below `max_companies`.
    pub fn is_valid_playas(self, max_companies: u8) -> bool {
        self == Self::SPECTATOR || self == Self::NEW_COMPANY || self.0 < max_companies
    }
}

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SPECTATOR => write!(f, "spectator"),
            Self::NEW_COMPANY => write!(f, "new company"),
            CompanyId(index) => write!(f, "company {}", index + 1),
        }
    }
}

/// A command as a client submits it. The server decides who sent it and
/// at which frame it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub company: CompanyId,
    pub cmd: u16,
    pub data: Vec<u8>,
}

impl CommandRequest {
    pub fn into_packet(self, client_id: ClientId) -> CommandPacket {
        CommandPacket {
            client_id,
            company: self.company,
            cmd: self.cmd,
            data: self.data,
            frame: 0,
            my_cmd: false,
        }
    }
}

/// A scheduled command, as distributed to every client.
///
/// Every recipient applies it at `frame`, in the order it was received.
/// `my_cmd` is only set in the copy delivered back to the originator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPacket {
    pub client_id: ClientId,
    pub company: CompanyId,
    pub cmd: u16,
    pub data: Vec<u8>,
    pub frame: u32,
    pub my_cmd: bool,
}
