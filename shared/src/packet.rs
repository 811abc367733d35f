//! Packet types and bodies of the game protocol.
//!
//! Every frame on the wire carries one [`PacketType`] tag followed by a
//! bincode-encoded body. Client→server packets decode into [`ClientPacket`],
//! server→client packets into [`ServerPacket`]; a tag from the wrong
//! direction is a decode error, not a packet.

use crate::command::{ClientId, CommandPacket, CommandRequest, CompanyId};
use crate::framer::FrameError;
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Type tag of a frame. The numeric value is the byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    ClientGameInfo = 0,
    ServerGameInfo = 1,
    ClientJoin = 2,
    ServerAuthRequest = 3,
    ClientAuthResponse = 4,
    ServerEnableEncryption = 5,
    ClientIdentify = 6,
    ServerCheckNewGrfs = 7,
    ClientNewGrfsChecked = 8,
    ServerWelcome = 9,
    ServerClientInfo = 10,
    ClientGetMap = 11,
    ServerWait = 12,
    ServerMapBegin = 13,
    ServerMapSize = 14,
    ServerMapData = 15,
    ServerMapDone = 16,
    ClientMapOk = 17,
    ServerJoin = 18,
    ServerFrame = 19,
    ClientAck = 20,
    ServerSync = 21,
    ClientCommand = 22,
    ServerCommand = 23,
    ClientChat = 24,
    ServerChat = 25,
    ServerExternalChat = 26,
    ClientRcon = 27,
    ServerRconResult = 28,
    ClientMove = 29,
    ServerMove = 30,
    ClientSetName = 31,
    ServerConfigUpdate = 32,
    ClientQuit = 33,
    ServerQuit = 34,
    ClientError = 35,
    ServerError = 36,
    ServerErrorQuit = 37,
    ServerShutdown = 38,
    ServerNewGame = 39,
}

/// Which side of the connection sends a packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        use PacketType::*;
        let kind = match tag {
            0 => ClientGameInfo,
            1 => ServerGameInfo,
            2 => ClientJoin,
            3 => ServerAuthRequest,
            4 => ClientAuthResponse,
            5 => ServerEnableEncryption,
            6 => ClientIdentify,
            7 => ServerCheckNewGrfs,
            8 => ClientNewGrfsChecked,
            9 => ServerWelcome,
            10 => ServerClientInfo,
            11 => ClientGetMap,
            12 => ServerWait,
            13 => ServerMapBegin,
            14 => ServerMapSize,
            15 => ServerMapData,
            16 => ServerMapDone,
            17 => ClientMapOk,
            18 => ServerJoin,
            19 => ServerFrame,
            20 => ClientAck,
            21 => ServerSync,
            22 => ClientCommand,
            23 => ServerCommand,
            24 => ClientChat,
            25 => ServerChat,
            26 => ServerExternalChat,
            27 => ClientRcon,
            28 => ServerRconResult,
            29 => ClientMove,
            30 => ServerMove,
            31 => ClientSetName,
            32 => ServerConfigUpdate,
            33 => ClientQuit,
            34 => ServerQuit,
            35 => ClientError,
            36 => ServerError,
            37 => ServerErrorQuit,
            38 => ServerShutdown,
            39 => ServerNewGame,
            _ => return None,
        };
        Some(kind)
    }

    pub fn direction(self) -> Direction {
        use PacketType::*;
        match self {
            ClientGameInfo | ClientJoin | ClientAuthResponse | ClientIdentify
            | ClientNewGrfsChecked | ClientGetMap | ClientMapOk | ClientAck | ClientCommand
            | ClientChat | ClientRcon | ClientMove | ClientSetName | ClientQuit | ClientError => {
                Direction::ClientToServer
            }
            _ => Direction::ServerToClient,
        }
    }
}

/// Reason codes carried by `ERROR`, `ERROR_QUIT` and client `ERROR` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    General,
    Desync,
    SavegameFailed,
    ConnectionLost,
    IllegalPacket,
    NewGrfMismatch,
    NotAuthorized,
    NotExpected,
    WrongRevision,
    NameInUse,
    CompanyMismatch,
    Kicked,
    Cheater,
    Full,
    TooManyCommands,
    TimeoutPassword,
    TimeoutComputer,
    TimeoutMap,
    TimeoutJoin,
    InvalidClientName,
}

impl ErrorCode {
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::General => "general error",
            ErrorCode::Desync => "desync error",
            ErrorCode::SavegameFailed => "could not load map",
            ErrorCode::ConnectionLost => "connection lost",
            ErrorCode::IllegalPacket => "protocol error",
            ErrorCode::NewGrfMismatch => "extension content mismatch",
            ErrorCode::NotAuthorized => "not authorized",
            ErrorCode::NotExpected => "received invalid or unexpected packet",
            ErrorCode::WrongRevision => "wrong revision",
            ErrorCode::NameInUse => "client name already in use",
            ErrorCode::CompanyMismatch => "company mismatch",
            ErrorCode::Kicked => "kicked by server",
            ErrorCode::Cheater => "was trying to use a cheat",
            ErrorCode::Full => "server full",
            ErrorCode::TooManyCommands => "was sending too many commands",
            ErrorCode::TimeoutPassword => "received no password in time",
            ErrorCode::TimeoutComputer => "general timeout",
            ErrorCode::TimeoutMap => "downloading map took too long",
            ErrorCode::TimeoutJoin => "processing map took too long",
            ErrorCode::InvalidClientName => "invalid client name",
        }
    }
}

/// Where a client wants its chat message to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatDestination {
    Broadcast,
    Company(CompanyId),
    Client(ClientId),
}

/// How a relayed chat line is presented to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatAction {
    Chat,
    ChatCompany,
    ChatClient,
    ServerMessage,
}

impl From<ChatDestination> for ChatAction {
    fn from(destination: ChatDestination) -> Self {
        match destination {
            ChatDestination::Broadcast => ChatAction::Chat,
            ChatDestination::Company(_) => ChatAction::ChatCompany,
            ChatDestination::Client(_) => ChatAction::ChatClient,
        }
    }
}

/// Identifies one piece of extension content the client must also have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrfIdentifier {
    pub grfid: u32,
    pub md5sum: [u8; 16],
}

/// Public information about a joined client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub playas: CompanyId,
    pub name: String,
    pub public_key: String,
}

/// Answer to a `GAME_INFO` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    pub server_name: String,
    pub revision: String,
    pub clients_on: u8,
    pub clients_max: u8,
    pub companies_max: u8,
    pub frame: u32,
    pub use_password: bool,
}

/// Packets a client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    GameInfo,
    Join { revision: String },
    AuthResponse { payload: Vec<u8> },
    Identify { name: String, playas: CompanyId },
    NewGrfsChecked,
    GetMap,
    MapOk,
    Ack { frame: u32, token: u8 },
    Command(CommandRequest),
    Chat { destination: ChatDestination, message: String, data: i64 },
    Rcon { password: String, command: String },
    Move { company: CompanyId },
    SetName { name: String },
    Quit,
    Error { code: ErrorCode },
}

/// Packets the server sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerPacket {
    GameInfo(GameInfo),
    AuthRequest { challenge: Vec<u8> },
    EnableEncryption,
    CheckNewGrfs { grfs: Vec<GrfIdentifier> },
    Welcome { client_id: ClientId },
    ClientInfo(ClientInfo),
    Wait { waiting: u8 },
    MapBegin { frame: u32 },
    MapSize { bytes: u32 },
    MapData { chunk: Vec<u8> },
    MapDone,
    Join { client_id: ClientId },
    Frame { frame: u32, frame_max: u32, token: Option<u8> },
    Sync { frame: u32, seed: u32 },
    Command(CommandPacket),
    Chat {
        action: ChatAction,
        client_id: ClientId,
        self_send: bool,
        message: String,
        data: i64,
    },
    ExternalChat { source: String, colour: u16, user: String, message: String },
    RconResult { colour: u16, text: String },
    Move { client_id: ClientId, company: CompanyId },
    ConfigUpdate { max_companies: u8, server_name: String },
    Quit { client_id: ClientId },
    Error { code: ErrorCode, reason: String },
    ErrorQuit { client_id: ClientId, code: ErrorCode },
    Shutdown,
    NewGame,
}

/// A packet family the framer can put on and take off the wire.
pub trait Message: Sized {
    const DIRECTION: Direction;

    fn packet_type(&self) -> PacketType;

    fn encode_body(&self) -> Result<Vec<u8>, FrameError>;

    fn decode_body(kind: PacketType, body: &[u8]) -> Result<Self, FrameError>;
}

/// Fixed-width little-endian integers, and no slack after the body.
fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

fn write<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, FrameError> {
    codec().serialize(value).map_err(FrameError::Encode)
}

fn read<T: DeserializeOwned>(kind: PacketType, body: &[u8]) -> Result<T, FrameError> {
    codec()
        .deserialize(body)
        .map_err(|source| FrameError::Body { kind, source })
}

fn empty(kind: PacketType, body: &[u8]) -> Result<(), FrameError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(FrameError::TrailingBytes {
            kind,
            extra: body.len(),
        })
    }
}

impl Message for ClientPacket {
    const DIRECTION: Direction = Direction::ClientToServer;

    fn packet_type(&self) -> PacketType {
        match self {
            ClientPacket::GameInfo => PacketType::ClientGameInfo,
            ClientPacket::Join { .. } => PacketType::ClientJoin,
            ClientPacket::AuthResponse { .. } => PacketType::ClientAuthResponse,
            ClientPacket::Identify { .. } => PacketType::ClientIdentify,
            ClientPacket::NewGrfsChecked => PacketType::ClientNewGrfsChecked,
            ClientPacket::GetMap => PacketType::ClientGetMap,
            ClientPacket::MapOk => PacketType::ClientMapOk,
            ClientPacket::Ack { .. } => PacketType::ClientAck,
            ClientPacket::Command(_) => PacketType::ClientCommand,
            ClientPacket::Chat { .. } => PacketType::ClientChat,
            ClientPacket::Rcon { .. } => PacketType::ClientRcon,
            ClientPacket::Move { .. } => PacketType::ClientMove,
            ClientPacket::SetName { .. } => PacketType::ClientSetName,
            ClientPacket::Quit => PacketType::ClientQuit,
            ClientPacket::Error { .. } => PacketType::ClientError,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            ClientPacket::GameInfo
            | ClientPacket::NewGrfsChecked
            | ClientPacket::GetMap
            | ClientPacket::MapOk
            | ClientPacket::Quit => Ok(Vec::new()),
            ClientPacket::Join { revision } => write(revision),
            ClientPacket::AuthResponse { payload } => write(payload),
            ClientPacket::Identify { name, playas } => write(&(name, playas)),
            ClientPacket::Ack { frame, token } => write(&(frame, token)),
            ClientPacket::Command(request) => write(request),
            ClientPacket::Chat {
                destination,
                message,
                data,
            } => write(&(destination, message, data)),
            ClientPacket::Rcon { password, command } => write(&(password, command)),
            ClientPacket::Move { company } => write(company),
            ClientPacket::SetName { name } => write(name),
            ClientPacket::Error { code } => write(code),
        }
    }

    fn decode_body(kind: PacketType, body: &[u8]) -> Result<Self, FrameError> {
        let packet = match kind {
            PacketType::ClientGameInfo => {
                empty(kind, body)?;
                ClientPacket::GameInfo
            }
            PacketType::ClientJoin => ClientPacket::Join {
                revision: read(kind, body)?,
            },
            PacketType::ClientAuthResponse => ClientPacket::AuthResponse {
                payload: read(kind, body)?,
            },
            PacketType::ClientIdentify => {
                let (name, playas): (String, CompanyId) = read(kind, body)?;
                ClientPacket::Identify { name, playas }
            }
            PacketType::ClientNewGrfsChecked => {
                empty(kind, body)?;
                ClientPacket::NewGrfsChecked
            }
            PacketType::ClientGetMap => {
                empty(kind, body)?;
                ClientPacket::GetMap
            }
            PacketType::ClientMapOk => {
                empty(kind, body)?;
                ClientPacket::MapOk
            }
            PacketType::ClientAck => {
                let (frame, token): (u32, u8) = read(kind, body)?;
                ClientPacket::Ack { frame, token }
            }
            PacketType::ClientCommand => ClientPacket::Command(read(kind, body)?),
            PacketType::ClientChat => {
                let (destination, message, data): (ChatDestination, String, i64) =
                    read(kind, body)?;
                ClientPacket::Chat {
                    destination,
                    message,
                    data,
                }
            }
            PacketType::ClientRcon => {
                let (password, command): (String, String) = read(kind, body)?;
                ClientPacket::Rcon { password, command }
            }
            PacketType::ClientMove => ClientPacket::Move {
                company: read(kind, body)?,
            },
            PacketType::ClientSetName => ClientPacket::SetName {
                name: read(kind, body)?,
            },
            PacketType::ClientQuit => {
                empty(kind, body)?;
                ClientPacket::Quit
            }
            PacketType::ClientError => ClientPacket::Error {
                code: read(kind, body)?,
            },
            other => return Err(FrameError::WrongDirection(other)),
        };
        Ok(packet)
    }
}

impl Message for ServerPacket {
    const DIRECTION: Direction = Direction::ServerToClient;

    fn packet_type(&self) -> PacketType {
        match self {
            ServerPacket::GameInfo(_) => PacketType::ServerGameInfo,
            ServerPacket::AuthRequest { .. } => PacketType::ServerAuthRequest,
            ServerPacket::EnableEncryption => PacketType::ServerEnableEncryption,
            ServerPacket::CheckNewGrfs { .. } => PacketType::ServerCheckNewGrfs,
            ServerPacket::Welcome { .. } => PacketType::ServerWelcome,
            ServerPacket::ClientInfo(_) => PacketType::ServerClientInfo,
            ServerPacket::Wait { .. } => PacketType::ServerWait,
            ServerPacket::MapBegin { .. } => PacketType::ServerMapBegin,
            ServerPacket::MapSize { .. } => PacketType::ServerMapSize,
            ServerPacket::MapData { .. } => PacketType::ServerMapData,
            ServerPacket::MapDone => PacketType::ServerMapDone,
            ServerPacket::Join { .. } => PacketType::ServerJoin,
            ServerPacket::Frame { .. } => PacketType::ServerFrame,
            ServerPacket::Sync { .. } => PacketType::ServerSync,
            ServerPacket::Command(_) => PacketType::ServerCommand,
            ServerPacket::Chat { .. } => PacketType::ServerChat,
            ServerPacket::ExternalChat { .. } => PacketType::ServerExternalChat,
            ServerPacket::RconResult { .. } => PacketType::ServerRconResult,
            ServerPacket::Move { .. } => PacketType::ServerMove,
            ServerPacket::ConfigUpdate { .. } => PacketType::ServerConfigUpdate,
            ServerPacket::Quit { .. } => PacketType::ServerQuit,
            ServerPacket::Error { .. } => PacketType::ServerError,
            ServerPacket::ErrorQuit { .. } => PacketType::ServerErrorQuit,
            ServerPacket::Shutdown => PacketType::ServerShutdown,
            ServerPacket::NewGame => PacketType::ServerNewGame,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            ServerPacket::EnableEncryption
            | ServerPacket::MapDone
            | ServerPacket::Shutdown
            | ServerPacket::NewGame => Ok(Vec::new()),
            ServerPacket::GameInfo(info) => write(info),
            ServerPacket::AuthRequest { challenge } => write(challenge),
            ServerPacket::CheckNewGrfs { grfs } => write(grfs),
            ServerPacket::Welcome { client_id } => write(client_id),
            ServerPacket::ClientInfo(info) => write(info),
            ServerPacket::Wait { waiting } => write(waiting),
            ServerPacket::MapBegin { frame } => write(frame),
            ServerPacket::MapSize { bytes } => write(bytes),
            ServerPacket::MapData { chunk } => write(chunk),
            ServerPacket::Join { client_id } => write(client_id),
            ServerPacket::Frame {
                frame,
                frame_max,
                token,
            } => write(&(frame, frame_max, token)),
            ServerPacket::Sync { frame, seed } => write(&(frame, seed)),
            ServerPacket::Command(packet) => write(packet),
            ServerPacket::Chat {
                action,
                client_id,
                self_send,
                message,
                data,
            } => write(&(action, client_id, self_send, message, data)),
            ServerPacket::ExternalChat {
                source,
                colour,
                user,
                message,
            } => write(&(source, colour, user, message)),
            ServerPacket::RconResult { colour, text } => write(&(colour, text)),
            ServerPacket::Move { client_id, company } => write(&(client_id, company)),
            ServerPacket::ConfigUpdate {
                max_companies,
                server_name,
            } => write(&(max_companies, server_name)),
            ServerPacket::Quit { client_id } => write(client_id),
            ServerPacket::Error { code, reason } => write(&(code, reason)),
            ServerPacket::ErrorQuit { client_id, code } => write(&(client_id, code)),
        }
    }

    fn decode_body(kind: PacketType, body: &[u8]) -> Result<Self, FrameError> {
        let packet = match kind {
            PacketType::ServerGameInfo => ServerPacket::GameInfo(read(kind, body)?),
            PacketType::ServerAuthRequest => ServerPacket::AuthRequest {
                challenge: read(kind, body)?,
            },
            PacketType::ServerEnableEncryption => {
                empty(kind, body)?;
                ServerPacket::EnableEncryption
            }
            PacketType::ServerCheckNewGrfs => ServerPacket::CheckNewGrfs {
                grfs: read(kind, body)?,
            },
            PacketType::ServerWelcome => ServerPacket::Welcome {
                client_id: read(kind, body)?,
            },
            PacketType::ServerClientInfo => ServerPacket::ClientInfo(read(kind, body)?),
            PacketType::ServerWait => ServerPacket::Wait {
                waiting: read(kind, body)?,
            },
            PacketType::ServerMapBegin => ServerPacket::MapBegin {
                frame: read(kind, body)?,
            },
            PacketType::ServerMapSize => ServerPacket::MapSize {
                bytes: read(kind, body)?,
            },
            PacketType::ServerMapData => ServerPacket::MapData {
                chunk: read(kind, body)?,
            },
            PacketType::ServerMapDone => {
                empty(kind, body)?;
                ServerPacket::MapDone
            }
            PacketType::ServerJoin => ServerPacket::Join {
                client_id: read(kind, body)?,
            },
            PacketType::ServerFrame => {
                let (frame, frame_max, token): (u32, u32, Option<u8>) = read(kind, body)?;
                ServerPacket::Frame {
                    frame,
                    frame_max,
                    token,
                }
            }
            PacketType::ServerSync => {
                let (frame, seed): (u32, u32) = read(kind, body)?;
                ServerPacket::Sync { frame, seed }
            }
            PacketType::ServerCommand => ServerPacket::Command(read(kind, body)?),
            PacketType::ServerChat => {
                let (action, client_id, self_send, message, data): (
                    ChatAction,
                    ClientId,
                    bool,
                    String,
                    i64,
                ) = read(kind, body)?;
                ServerPacket::Chat {
                    action,
                    client_id,
                    self_send,
                    message,
                    data,
                }
            }
            PacketType::ServerExternalChat => {
                let (source, colour, user, message): (String, u16, String, String) =
                    read(kind, body)?;
                ServerPacket::ExternalChat {
                    source,
                    colour,
                    user,
                    message,
                }
            }
            PacketType::ServerRconResult => {
                let (colour, text): (u16, String) = read(kind, body)?;
                ServerPacket::RconResult { colour, text }
            }
            PacketType::ServerMove => {
                let (client_id, company): (ClientId, CompanyId) = read(kind, body)?;
                ServerPacket::Move { client_id, company }
            }
            PacketType::ServerConfigUpdate => {
                let (max_companies, server_name): (u8, String) = read(kind, body)?;
                ServerPacket::ConfigUpdate {
                    max_companies,
                    server_name,
                }
            }
            PacketType::ServerQuit => ServerPacket::Quit {
                client_id: read(kind, body)?,
            },
            PacketType::ServerError => {
                let (code, reason): (ErrorCode, String) = read(kind, body)?;
                ServerPacket::Error { code, reason }
            }
            PacketType::ServerErrorQuit => {
                let (client_id, code): (ClientId, ErrorCode) = read(kind, body)?;
                ServerPacket::ErrorQuit { client_id, code }
            }
            PacketType::ServerShutdown => {
                empty(kind, body)?;
                ServerPacket::Shutdown
            }
            PacketType::ServerNewGame => {
                empty(kind, body)?;
                ServerPacket::NewGame
            }
            other => return Err(FrameError::WrongDirection(other)),
        };
        Ok(packet)
    }
}
