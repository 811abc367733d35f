//! Per-connection state: lifecycle status, receive budget, liveness
//! bookkeeping and the outbound side of one client.

use crate::error::CloseReason;
use crate::pool::SessionKey;
use log::{debug, trace};
use shared::{
    ClientId, ClientInfo, ClientPacket, CommandPacket, CompanyId, Decoded, ErrorCode, Framer,
    Message, PacketCipher, PacketType, ServerPacket,
};
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Lifecycle of a client, in the only order it may advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClientStatus {
    /// Connected, nothing said yet.
    Inactive,
    /// Challenge sent, waiting for the response.
    AuthGame,
    /// Authenticated, waiting for name and company.
    Identify,
    /// Waiting for the client to confirm its extension content.
    NewGrfsCheck,
    /// Welcomed, may request the map.
    Authorized,
    /// Queued behind another map download.
    MapWait,
    /// Receiving the map.
    Map,
    /// Map sent, waiting for `MAP_OK`.
    DoneMap,
    /// Catching up on frames that passed during the download.
    PreActive,
    /// Fully joined.
    Active,
}

impl ClientStatus {
    /// Packet types this status accepts besides `QUIT` and `ERROR`.
    pub fn accepts(self, kind: PacketType) -> bool {
        use PacketType::*;
        if matches!(kind, ClientQuit | ClientError) {
            return true;
        }

        match self {
            ClientStatus::Inactive => matches!(kind, ClientJoin | ClientGameInfo),
            ClientStatus::AuthGame => kind == ClientAuthResponse,
            ClientStatus::Identify => kind == ClientIdentify,
            ClientStatus::NewGrfsCheck => kind == ClientNewGrfsChecked,
            ClientStatus::Authorized => kind == ClientGetMap,
            ClientStatus::MapWait | ClientStatus::Map => false,
            ClientStatus::DoneMap => kind == ClientMapOk,
            ClientStatus::PreActive => matches!(kind, ClientAck | ClientChat),
            ClientStatus::Active => matches!(
                kind,
                ClientAck | ClientCommand | ClientChat | ClientSetName | ClientRcon | ClientMove
            ),
        }
    }

    /// Error code sent when a session overstays in this status.
    pub fn timeout_code(self) -> ErrorCode {
        match self {
            ClientStatus::AuthGame => ErrorCode::TimeoutPassword,
            ClientStatus::Map => ErrorCode::TimeoutMap,
            ClientStatus::DoneMap | ClientStatus::PreActive => ErrorCode::TimeoutJoin,
            _ => ErrorCode::TimeoutComputer,
        }
    }
}

/// Item on a connection's outbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Bytes(Vec<u8>),
    Close,
}

/// Write half of a connection.
pub trait Transport: Send {
    /// Queues bytes for the peer. `false` means the connection is gone.
    fn send(&mut self, bytes: Vec<u8>) -> bool;

    /// Flushes what was queued, then closes.
    fn close(&mut self);
}

impl Transport for mpsc::UnboundedSender<Outgoing> {
    fn send(&mut self, bytes: Vec<u8>) -> bool {
        mpsc::UnboundedSender::send(self, Outgoing::Bytes(bytes)).is_ok()
    }

    fn close(&mut self) {
        let _ = mpsc::UnboundedSender::send(self, Outgoing::Close);
    }
}

/// Server-side state of one connected client.
pub struct ClientSession {
    key: SessionKey,
    transport: Box<dyn Transport>,
    address: SocketAddr,
    status: ClientStatus,
    /// Server frame at which `status` was entered.
    status_frame: u32,

    /// Bytes this session may still have dispatched before the next refill.
    receive_limit: usize,
    inbound: Vec<u8>,
    cipher: Option<Box<dyn PacketCipher>>,

    pub name: String,
    pub playas: CompanyId,
    pub peer_public_key: Option<String>,

    /// Last frame the client acknowledged, and the server frame at the time.
    pub last_frame: u32,
    pub last_frame_server: u32,
    /// Outstanding liveness token, 0 when none.
    pub last_token: u8,
    /// Server frame at which the last token reply arrived.
    pub last_token_frame: u32,
    /// Set once the slow-client warning was given.
    pub lag_test: u8,
    /// Server frame of the last `WAIT` update.
    pub last_wait_frame: u32,

    /// Commands scheduled for this client, sent as one write per flush.
    outgoing_queue: Vec<CommandPacket>,
}

impl ClientSession {
    pub fn new(
        key: SessionKey,
        transport: Box<dyn Transport>,
        address: SocketAddr,
        receive_limit: usize,
        frame: u32,
    ) -> Self {
        Self {
            key,
            transport,
            address,
            status: ClientStatus::Inactive,
            status_frame: frame,
            receive_limit,
            inbound: Vec::new(),
            cipher: None,
            name: String::new(),
            playas: CompanyId::SPECTATOR,
            peer_public_key: None,
            last_frame: frame,
            last_frame_server: frame,
            last_token: 0,
            last_token_frame: frame,
            lag_test: 0,
            last_wait_frame: frame,
            outgoing_queue: Vec::new(),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn id(&self) -> ClientId {
        self.key.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }

    pub fn status_frame(&self) -> u32 {
        self.status_frame
    }

    pub fn set_status(&mut self, status: ClientStatus, frame: u32) {
        debug_assert!(status >= self.status, "status may only advance");
        trace!("Client {} {:?} -> {:?}", self.key.id, self.status, status);
        self.status = status;
        self.status_frame = frame;
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            client_id: self.key.id,
            playas: self.playas,
            name: self.name.clone(),
            public_key: self.peer_public_key.clone().unwrap_or_default(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Bytes the installed cipher adds to each outgoing frame.
    pub fn cipher_overhead(&self) -> usize {
        self.cipher.as_ref().map_or(0, |cipher| cipher.overhead())
    }

    /// Installs `cipher` for both directions, starting with the next frame.
    pub fn enable_encryption(&mut self, cipher: Box<dyn PacketCipher>) {
        self.cipher = Some(cipher);
    }

    pub fn receive_limit(&self) -> usize {
        self.receive_limit
    }

    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Adds the per-tick receive allowance, capped at `burst`.
    pub fn replenish(&mut self, bytes_per_frame: usize, burst: usize) {
        self.receive_limit = (self.receive_limit + bytes_per_frame).min(burst);
    }

    /// Buffers bytes read from the socket.
    pub fn push_received(&mut self, bytes: &[u8], burst: usize) -> Result<(), CloseReason> {
        self.inbound.extend_from_slice(bytes);
        if self.inbound.len() > burst {
            return Err(CloseReason::ResourceExhausted("receive buffer over budget"));
        }
        Ok(())
    }

    /// Takes the next complete frame, if the receive budget covers it.
    ///
    /// A frame larger than the remaining budget stays buffered until later
    /// refills make room for it.
    pub fn next_packet(
        &mut self,
        framer: &Framer,
        burst: usize,
    ) -> Result<Option<ClientPacket>, CloseReason> {
        let Some(size) = framer.peek_size(&self.inbound, burst)? else {
            return Ok(None);
        };
        if size > self.receive_limit || size > self.inbound.len() {
            return Ok(None);
        }

        match framer.decode::<ClientPacket>(&self.inbound, burst, self.cipher.as_deref_mut())? {
            Decoded::Packet { packet, consumed } => {
                self.inbound.drain(..consumed);
                self.receive_limit -= consumed;
                trace!("Client {} <- {:?}", self.key.id, packet.packet_type());
                Ok(Some(packet))
            }
            Decoded::NeedMoreData => Ok(None),
        }
    }

    /// Frames and sends one packet.
    pub fn send(&mut self, framer: &Framer, packet: &ServerPacket) -> Result<(), CloseReason> {
        let frame = framer.encode(packet, self.cipher.as_deref_mut())?;
        if self.transport.send(frame) {
            Ok(())
        } else {
            Err(CloseReason::ConnectionLost)
        }
    }

    /// Frames several packets and sends them as one write.
    pub fn send_all<'a, I>(&mut self, framer: &Framer, packets: I) -> Result<(), CloseReason>
    where
        I: IntoIterator<Item = &'a ServerPacket>,
    {
        let mut batch = Vec::new();
        for packet in packets {
            batch.extend(framer.encode(packet, self.cipher.as_deref_mut())?);
        }
        if batch.is_empty() || self.transport.send(batch) {
            Ok(())
        } else {
            Err(CloseReason::ConnectionLost)
        }
    }

    pub fn queue_command(&mut self, command: CommandPacket) {
        self.outgoing_queue.push(command);
    }

    pub fn queued_commands(&self) -> usize {
        self.outgoing_queue.len()
    }

    pub fn command_queue(&self) -> &[CommandPacket] {
        &self.outgoing_queue
    }

    /// Sends every queued command as a single write.
    pub fn flush_command_queue(&mut self, framer: &Framer) -> Result<(), CloseReason> {
        if self.outgoing_queue.is_empty() {
            return Ok(());
        }

        let packets: Vec<ServerPacket> = self
            .outgoing_queue
            .drain(..)
            .map(ServerPacket::Command)
            .collect();
        debug!("Client {} flushing {} commands", self.key.id, packets.len());
        self.send_all(framer, &packets)
    }

    /// Flushes and closes the transport. The session is unusable afterwards.
    pub fn close_transport(&mut self) {
        self.outgoing_queue.clear();
        self.transport.close();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub struct NullTransport;

    impl Transport for NullTransport {
        fn send(&mut self, _bytes: Vec<u8>) -> bool {
            true
        }

        fn close(&mut self) {}
    }

    /// Reversible byte mangling standing in for a real cipher.
    pub struct XorCipher(pub u8);

    impl PacketCipher for XorCipher {
        fn seal(&mut self, plain: &[u8]) -> Vec<u8> {
            plain.iter().map(|b| b ^ self.0).collect()
        }

        fn open(&mut self, sealed: &[u8]) -> Option<Vec<u8>> {
            Some(sealed.iter().map(|b| b ^ self.0).collect())
        }
    }

    /// Appends a fixed tag to every frame, like an AEAD cipher would.
    pub struct TagCipher;

    pub const TAG: [u8; 16] = [0xC5; 16];

    impl PacketCipher for TagCipher {
        fn seal(&mut self, plain: &[u8]) -> Vec<u8> {
            let mut sealed = plain.to_vec();
            sealed.extend_from_slice(&TAG);
            sealed
        }

        fn open(&mut self, sealed: &[u8]) -> Option<Vec<u8>> {
            sealed.strip_suffix(&TAG[..]).map(<[u8]>::to_vec)
        }

        fn overhead(&self) -> usize {
            TAG.len()
        }
    }
}
