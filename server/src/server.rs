//! The session core: owns every session and drives them one tick at a time.
//!
//! `Server` is plain owned state with no locks. Whatever feeds it bytes (the
//! tokio layer in [`crate::network`], or a test) calls [`Server::accept`],
//! [`Server::receive`], [`Server::on_client_disconnected`] and
//! [`Server::on_tick`] from one task. All packet handlers return
//! `Result<(), CloseReason>`; the dispatcher closes the session on `Err`.

use crate::auth::{AuthGateway, AuthStep, Authenticator};
use crate::broadcaster::CommandBroadcaster;
use crate::config::ServerConfig;
use crate::error::CloseReason;
use crate::map_transfer::{MapTransfer, PumpProgress, TransferGrant};
use crate::pool::{SessionKey, SessionPool};
use crate::session::{ClientSession, ClientStatus, Transport};
use crate::world::Simulation;
use log::{debug, info, warn};
use rand::Rng;
use shared::{
    ChatAction, ChatDestination, ClientId, ClientPacket, CommandRequest, CompanyId, ErrorCode,
    Framer, GameInfo, ServerPacket, COMMAND_OVERHEAD, NETWORK_CHAT_LENGTH,
    NETWORK_CLIENT_NAME_LENGTH, NETWORK_RCONCOMMAND_LENGTH,
};
use std::net::SocketAddr;

/// Text colour of a refused remote console command.
pub const RCON_COLOUR_ERROR: u16 = 3;
/// Highest ` #n` suffix tried when a name is taken.
const MAX_NAME_SUFFIX: u32 = 100;
/// Lag points before a client is dropped.
const MAX_LAG_UNITS: u32 = 3;

/// Something the embedding application may want to react to.
#[derive(Debug)]
pub enum ServerEvent {
    Joined {
        client_id: ClientId,
        name: String,
        address: SocketAddr,
    },
    /// Carries the whole key, so a slot reused since cannot be mistaken for
    /// the departed session.
    Disconnected {
        key: SessionKey,
        address: SocketAddr,
        reason: CloseReason,
    },
    Chat {
        client_id: ClientId,
        destination: ChatDestination,
        message: String,
    },
    /// An authenticated remote console command, to be answered with
    /// [`Server::send_rcon_result`].
    Rcon { client_id: ClientId, command: String },
}

pub struct Server<S: Simulation> {
    config: ServerConfig,
    framer: Framer,
    pool: SessionPool,
    sim: S,
    auth: AuthGateway,
    map: MapTransfer,
    broadcaster: CommandBroadcaster,
    /// Last frame clients may simulate up to.
    frame_max: u32,
    last_sync_frame: u32,
    events: Vec<ServerEvent>,
    /// Sessions that failed while another one was being handled.
    doomed: Vec<(SessionKey, CloseReason)>,
}

impl<S: Simulation> Server<S> {
    pub fn new(config: ServerConfig, sim: S, authenticator: Box<dyn Authenticator>) -> Self {
        let config = config.sanitized();
        let frame = sim.frame();
        Self {
            framer: Framer::new(config.max_frame_size),
            pool: SessionPool::new(config.max_clients),
            map: MapTransfer::new(config.map_chunk_size, config.map_chunks_per_tick),
            broadcaster: CommandBroadcaster::new(
                config.commands_per_frame,
                config.max_commands_in_queue,
            ),
            auth: AuthGateway::new(authenticator),
            config,
            sim,
            frame_max: frame,
            last_sync_frame: frame,
            events: Vec::new(),
            doomed: Vec::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Live configuration. Call [`Server::push_config_update`] after changing
    /// anything clients see.
    pub fn config_mut(&mut self) -> &mut ServerConfig {
        &mut self.config
    }

    pub fn framer(&self) -> Framer {
        self.framer
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    pub fn frame(&self) -> u32 {
        self.sim.frame()
    }

    pub fn frame_max(&self) -> u32 {
        self.frame_max
    }

    pub fn session(&self, key: SessionKey) -> Option<&ClientSession> {
        self.pool.get(key)
    }

    pub fn session_count(&self) -> usize {
        self.pool.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.pool
            .iter()
            .filter(|session| session.status() == ClientStatus::Active)
            .count()
    }

    /// Session currently downloading the map.
    pub fn map_holder(&self) -> Option<SessionKey> {
        self.map.holder()
    }

    pub fn take_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Admits a new connection, or answers and closes it when the address is
    /// banned or the server is full.
    pub fn accept(
        &mut self,
        mut transport: Box<dyn Transport>,
        address: SocketAddr,
    ) -> Option<SessionKey> {
        if self.config.is_banned(address.ip()) {
            warn!("Refusing banned address {}", address);
            self.refuse(transport.as_mut(), ErrorCode::NotAuthorized);
            return None;
        }

        match self.pool.allocate(
            transport,
            address,
            self.config.bytes_per_frame_burst,
            self.sim.frame(),
        ) {
            Ok(key) => Some(key),
            Err(full) => {
                let mut transport = full.0;
                warn!("Refusing {}: server full", address);
                self.refuse(transport.as_mut(), ErrorCode::Full);
                None
            }
        }
    }

    fn refuse(&self, transport: &mut dyn Transport, code: ErrorCode) {
        let packet = ServerPacket::Error {
            code,
            reason: code.description().to_string(),
        };
        match self.framer.encode(&packet, None) {
            Ok(frame) => {
                transport.send(frame);
            }
            Err(e) => warn!("Failed to encode refusal: {}", e),
        }
        transport.close();
    }

    /// Buffers bytes read from `key`'s connection and handles every complete
    /// frame the receive budget allows.
    pub fn receive(&mut self, key: SessionKey, bytes: &[u8]) {
        let burst = self.config.bytes_per_frame_burst;
        let Some(session) = self.pool.get_mut(key) else {
            debug!("Dropping {} bytes for stale session {:?}", bytes.len(), key);
            return;
        };

        if let Err(reason) = session.push_received(bytes, burst) {
            self.close_session(key, reason);
            self.reap();
            return;
        }

        self.drain_input(key);
    }

    /// The peer's connection is gone.
    pub fn on_client_disconnected(&mut self, key: SessionKey) {
        self.close_session(key, CloseReason::ConnectionLost);
        self.reap();
    }

    /// Queues a command issued by the server itself. Commands too large to
    /// relay to every session are dropped.
    pub fn on_client_command(&mut self, request: CommandRequest) {
        let size = COMMAND_OVERHEAD + request.data.len();
        if size > self.command_frame_limit() {
            warn!("Dropping server command {} of {} bytes", request.cmd, size);
            return;
        }
        self.broadcaster.enqueue_server(request);
    }

    /// Largest `COMMAND` frame every current session can still receive once
    /// its cipher has sealed it.
    fn command_frame_limit(&self) -> usize {
        let overhead = self
            .pool
            .iter()
            .map(ClientSession::cipher_overhead)
            .max()
            .unwrap_or(0);
        self.framer.max_frame_size().saturating_sub(overhead)
    }

    fn drain_input(&mut self, key: SessionKey) {
        let burst = self.config.bytes_per_frame_burst;
        let framer = self.framer;

        loop {
            let Some(session) = self.pool.get_mut(key) else {
                return;
            };

            let packet = match session.next_packet(&framer, burst) {
                Ok(Some(packet)) => packet,
                Ok(None) => return,
                Err(reason) => {
                    self.close_session(key, reason);
                    self.reap();
                    return;
                }
            };

            if let Err(reason) = self.handle_packet(key, packet) {
                self.close_session(key, reason);
            }
            self.reap();
        }
    }

    fn handle_packet(&mut self, key: SessionKey, packet: ClientPacket) -> Result<(), CloseReason> {
        let session = self.pool.get(key).ok_or(CloseReason::ConnectionLost)?;
        let kind = shared::Message::packet_type(&packet);
        if !session.status().accepts(kind) {
            warn!(
                "Client {} sent {:?} while {:?}",
                session.id(),
                kind,
                session.status()
            );
            return Err(CloseReason::ProtocolViolation(kind));
        }

        match packet {
            ClientPacket::GameInfo => self.handle_game_info(key),
            ClientPacket::Join { revision } => self.handle_join(key, &revision),
            ClientPacket::AuthResponse { payload } => self.handle_auth_response(key, &payload),
            ClientPacket::Identify { name, playas } => self.handle_identify(key, name, playas),
            ClientPacket::NewGrfsChecked => self.handle_newgrfs_checked(key),
            ClientPacket::GetMap => self.handle_getmap(key),
            ClientPacket::MapOk => self.handle_map_ok(key),
            ClientPacket::Ack { frame, token } => self.handle_ack(key, frame, token),
            ClientPacket::Command(request) => {
                let limit = self.command_frame_limit();
                let session = self.pool.get(key).ok_or(CloseReason::ConnectionLost)?;
                self.broadcaster.enqueue(session, request, &self.sim, limit)
            }
            ClientPacket::Chat {
                destination,
                message,
                data,
            } => self.handle_chat(key, destination, message, data),
            ClientPacket::Rcon { password, command } => self.handle_rcon(key, &password, command),
            ClientPacket::Move { company } => self.handle_move(key, company),
            ClientPacket::SetName { name } => self.handle_set_name(key, name),
            ClientPacket::Quit => Err(CloseReason::ClientQuit),
            ClientPacket::Error { code } => {
                warn!("Client {} reported error: {}", key.id, code.description());
                if code == ErrorCode::NewGrfMismatch {
                    Err(CloseReason::NewGrfMismatch)
                } else {
                    Err(CloseReason::ClientError(code))
                }
            }
        }
    }

    fn send(&mut self, key: SessionKey, packet: &ServerPacket) -> Result<(), CloseReason> {
        let framer = self.framer;
        self.pool
            .get_mut(key)
            .ok_or(CloseReason::ConnectionLost)?
            .send(&framer, packet)
    }

    /// Sends `packet` to every session `filter` picks. Failed recipients are
    /// closed once the current step is done.
    fn broadcast<F>(&mut self, packet: &ServerPacket, filter: F)
    where
        F: Fn(&ClientSession) -> bool,
    {
        let framer = self.framer;
        for session in self.pool.iter_mut() {
            if !filter(session) {
                continue;
            }
            if let Err(reason) = session.send(&framer, packet) {
                self.doomed.push((session.key(), reason));
            }
        }
    }

    fn game_info(&self) -> GameInfo {
        GameInfo {
            server_name: self.config.server_name.clone(),
            revision: self.config.revision.clone(),
            clients_on: self.pool.len().min(u8::MAX as usize) as u8,
            clients_max: self.pool.capacity().min(u8::MAX as usize) as u8,
            companies_max: self.config.max_companies,
            frame: self.sim.frame(),
            use_password: self.config.server_password.is_some(),
        }
    }

    fn handle_game_info(&mut self, key: SessionKey) -> Result<(), CloseReason> {
        let info = self.game_info();
        self.send(key, &ServerPacket::GameInfo(info))?;
        Err(CloseReason::ClientQuit)
    }

    fn handle_join(&mut self, key: SessionKey, revision: &str) -> Result<(), CloseReason> {
        if revision != self.config.revision {
            info!(
                "Client {} has wrong revision {:?}, expected {:?}",
                key.id, revision, self.config.revision
            );
            return Err(CloseReason::Rejected(ErrorCode::WrongRevision));
        }

        let frame = self.sim.frame();
        let challenge = self.auth.begin(key.id);
        let session = self.pool.get_mut(key).ok_or(CloseReason::ConnectionLost)?;
        session.set_status(ClientStatus::AuthGame, frame);
        session.send(&self.framer, &ServerPacket::AuthRequest { challenge })
    }

    fn handle_auth_response(&mut self, key: SessionKey, payload: &[u8]) -> Result<(), CloseReason> {
        let address = self
            .pool
            .get(key)
            .ok_or(CloseReason::ConnectionLost)?
            .address();

        match self.auth.respond(key.id, address, payload)? {
            AuthStep::Challenge(challenge) => {
                self.send(key, &ServerPacket::AuthRequest { challenge })
            }
            AuthStep::Done {
                peer_public_key,
                cipher,
            } => {
                let frame = self.sim.frame();
                let framer = self.framer;
                let session = self.pool.get_mut(key).ok_or(CloseReason::ConnectionLost)?;
                session.peer_public_key = peer_public_key;
                if let Some(cipher) = cipher {
                    session.send(&framer, &ServerPacket::EnableEncryption)?;
                    session.enable_encryption(cipher);
                }
                session.set_status(ClientStatus::Identify, frame);
                info!("Client {} from {} authenticated", key.id, address);
                Ok(())
            }
        }
    }

    /// Resolves `name` against every other session, appending ` #n` when it
    /// is taken.
    fn unique_name(&self, key: SessionKey, name: &str) -> Option<String> {
        let taken = |candidate: &str| {
            self.pool
                .iter()
                .any(|session| session.key() != key && session.name == candidate)
        };

        if !taken(name) {
            return Some(name.to_string());
        }
        (2..=MAX_NAME_SUFFIX)
            .map(|n| format!("{} #{}", name, n))
            .find(|candidate| !taken(candidate))
    }

    fn checked_name(&self, key: SessionKey, name: &str) -> Result<String, CloseReason> {
        if !is_valid_client_name(name) {
            return Err(CloseReason::Rejected(ErrorCode::InvalidClientName));
        }
        self.unique_name(key, name)
            .ok_or(CloseReason::Rejected(ErrorCode::NameInUse))
    }

    fn handle_identify(
        &mut self,
        key: SessionKey,
        name: String,
        playas: CompanyId,
    ) -> Result<(), CloseReason> {
        let name = self.checked_name(key, &name)?;
        if !playas.is_valid_playas(self.config.max_companies) {
            return Err(CloseReason::Rejected(ErrorCode::CompanyMismatch));
        }

        let frame = self.sim.frame();
        let grfs = self.config.newgrfs.clone();
        let session = self.pool.get_mut(key).ok_or(CloseReason::ConnectionLost)?;
        info!("Client {} identified as {:?} ({})", key.id, name, playas);
        session.name = name;
        session.playas = playas;
        session.set_status(ClientStatus::NewGrfsCheck, frame);
        session.send(&self.framer, &ServerPacket::CheckNewGrfs { grfs })
    }

    fn handle_newgrfs_checked(&mut self, key: SessionKey) -> Result<(), CloseReason> {
        let frame = self.sim.frame();
        let others: Vec<ServerPacket> = self
            .pool
            .iter()
            .filter(|other| other.key() != key && other.status() >= ClientStatus::Authorized)
            .map(|other| ServerPacket::ClientInfo(other.info()))
            .collect();

        let session = self.pool.get_mut(key).ok_or(CloseReason::ConnectionLost)?;
        session.set_status(ClientStatus::Authorized, frame);
        session.send(&self.framer, &ServerPacket::Welcome { client_id: key.id })?;
        session.send_all(&self.framer, &others)
    }

    fn handle_getmap(&mut self, key: SessionKey) -> Result<(), CloseReason> {
        self.grant_map(key)?;
        self.send_wait_updates();
        Ok(())
    }

    /// Asks the coordinator for the download slot and moves the session to
    /// `MAP` or `MAP_WAIT` accordingly.
    fn grant_map(&mut self, key: SessionKey) -> Result<(), CloseReason> {
        let sim = &self.sim;
        let grant = self
            .map
            .begin(key, || Ok((sim.frame(), sim.snapshot()?)))
            .map_err(|e| CloseReason::SavegameFailed(e.to_string()))?;

        let frame = self.sim.frame();
        let session = self.pool.get_mut(key).ok_or(CloseReason::ConnectionLost)?;
        match grant {
            TransferGrant::Granted => {
                session.set_status(ClientStatus::Map, frame);
                // Commands already distributed but not yet in the snapshot.
                for command in self.broadcaster.scheduled() {
                    let mut copy = command.clone();
                    copy.my_cmd = copy.client_id == key.id;
                    session.queue_command(copy);
                }
            }
            TransferGrant::Queued(_) => {
                session.set_status(ClientStatus::MapWait, frame);
            }
        }
        Ok(())
    }

    fn send_wait_updates(&mut self) {
        let frame = self.sim.frame();
        let framer = self.framer;
        let waiting: Vec<SessionKey> = self.map.waiting().collect();

        for (position, key) in waiting.into_iter().enumerate() {
            let Some(session) = self.pool.get_mut(key) else {
                continue;
            };
            session.last_wait_frame = frame;
            let packet = ServerPacket::Wait {
                waiting: (position + 1).min(u8::MAX as usize) as u8,
            };
            if let Err(reason) = session.send(&framer, &packet) {
                self.doomed.push((key, reason));
            }
        }
    }

    /// Frees the download slot held or waited for by `key`, promoting the
    /// next waiter.
    fn release_map_slot(&mut self, key: SessionKey) {
        let was_involved = self.map.holder() == Some(key) || self.map.waiting().any(|k| k == key);
        if let Some(next) = self.map.complete_or_abort(key) {
            info!("Client {} promoted to map download", next.id);
            if let Err(reason) = self.grant_map(next) {
                // Closing `next` promotes the waiter after it.
                self.close_session(next, reason);
            }
        }
        if was_involved {
            self.send_wait_updates();
        }
    }

    fn handle_map_ok(&mut self, key: SessionKey) -> Result<(), CloseReason> {
        let frame = self.sim.frame();
        let seed = self.sim.sync_seed();
        let frame_max = self.frame_max;
        let framer = self.framer;
        let token = new_token();

        let session = self.pool.get_mut(key).ok_or(CloseReason::ConnectionLost)?;
        session.set_status(ClientStatus::PreActive, frame);
        session.last_frame = frame;
        session.last_frame_server = frame;
        session.last_token_frame = frame;
        session.last_token = token;
        session.flush_command_queue(&framer)?;
        session.send_all(
            &framer,
            &[
                ServerPacket::Frame {
                    frame,
                    frame_max,
                    token: Some(token),
                },
                ServerPacket::Sync { frame, seed },
            ],
        )?;

        let info = session.info();
        let address = session.address();
        info!("Client {} ({}) joined the game", key.id, info.name);

        self.broadcast(&ServerPacket::ClientInfo(info.clone()), |s| {
            s.status() >= ClientStatus::Authorized
        });
        self.broadcast(&ServerPacket::Join { client_id: key.id }, |s| {
            s.status() >= ClientStatus::Authorized
        });
        let update = self.config_update();
        self.send(key, &update)?;

        self.events.push(ServerEvent::Joined {
            client_id: key.id,
            name: info.name,
            address,
        });
        Ok(())
    }

    fn handle_ack(&mut self, key: SessionKey, frame: u32, token: u8) -> Result<(), CloseReason> {
        let server_frame = self.sim.frame();
        let catch_up = self.config.catch_up_frames;
        let session = self.pool.get_mut(key).ok_or(CloseReason::ConnectionLost)?;

        if session.status() == ClientStatus::PreActive {
            if frame.saturating_add(catch_up) < server_frame {
                return Ok(());
            }
            session.set_status(ClientStatus::Active, server_frame);
            session.last_token_frame = server_frame;
            info!("Client {} is now active", key.id);
        }

        if session.last_token != 0 && token == session.last_token {
            session.last_token_frame = server_frame;
            session.last_token = 0;
        }

        session.last_frame = frame;
        session.last_frame_server = server_frame;
        Ok(())
    }

    fn handle_chat(
        &mut self,
        key: SessionKey,
        destination: ChatDestination,
        mut message: String,
        data: i64,
    ) -> Result<(), CloseReason> {
        truncate_at_char_boundary(&mut message, NETWORK_CHAT_LENGTH);
        let sender = self.pool.get(key).ok_or(CloseReason::ConnectionLost)?;
        let from = sender.id();
        let sender_company = sender.playas;
        let action = ChatAction::from(destination);

        let relay = |self_send: bool| ServerPacket::Chat {
            action,
            client_id: from,
            self_send,
            message: message.clone(),
            data,
        };
        let in_game = |s: &ClientSession| s.status() > ClientStatus::Authorized;

        match destination {
            ChatDestination::Broadcast => {
                self.broadcast(&relay(false), in_game);
            }
            ChatDestination::Company(company) => {
                self.broadcast(&relay(false), |s| in_game(s) && s.playas == company);
                if sender_company != company {
                    self.send(key, &relay(true))?;
                }
            }
            ChatDestination::Client(target) if target == ClientId::SERVER => {}
            ChatDestination::Client(target) => {
                let Some(target_key) = self.pool.key_of(target) else {
                    debug!("Client {} chatted to unknown client {}", from, target);
                    return Ok(());
                };
                if !self.pool.get(target_key).is_some_and(in_game) {
                    debug!("Client {} chatted to client {} not in game", from, target);
                    return Ok(());
                }
                if let Err(reason) = self.send(target_key, &relay(false)) {
                    self.doomed.push((target_key, reason));
                }
                if target_key != key {
                    self.send(key, &relay(true))?;
                }
            }
        }

        info!("[chat] {} -> {:?}: {}", from, destination, message);
        self.events.push(ServerEvent::Chat {
            client_id: from,
            destination,
            message,
        });
        Ok(())
    }

    fn handle_rcon(
        &mut self,
        key: SessionKey,
        password: &str,
        command: String,
    ) -> Result<(), CloseReason> {
        let authorized = self
            .config
            .rcon_password
            .as_deref()
            .is_some_and(|expected| !expected.is_empty() && expected == password);
        if !authorized {
            warn!("Client {} sent rcon with a wrong password", key.id);
            return self.send(
                key,
                &ServerPacket::RconResult {
                    colour: RCON_COLOUR_ERROR,
                    text: "Access Denied".to_string(),
                },
            );
        }
        if command.len() > NETWORK_RCONCOMMAND_LENGTH {
            warn!("Client {} sent an overlong rcon command", key.id);
            return Ok(());
        }

        info!("Client {} executing rcon {:?}", key.id, command);
        self.events.push(ServerEvent::Rcon {
            client_id: key.id,
            command,
        });
        Ok(())
    }

    fn handle_move(&mut self, key: SessionKey, company: CompanyId) -> Result<(), CloseReason> {
        if !(company.is_spectator() || company.0 < self.config.max_companies) {
            warn!("Client {} tried to move to invalid {}", key.id, company);
            return Ok(());
        }

        let session = self.pool.get_mut(key).ok_or(CloseReason::ConnectionLost)?;
        if session.playas == company {
            return Ok(());
        }
        session.playas = company;
        info!("Client {} moved to {}", key.id, company);

        self.broadcast(
            &ServerPacket::Move {
                client_id: key.id,
                company,
            },
            |s| s.status() >= ClientStatus::Authorized,
        );
        Ok(())
    }

    fn handle_set_name(&mut self, key: SessionKey, name: String) -> Result<(), CloseReason> {
        let name = self.checked_name(key, &name)?;
        let session = self.pool.get_mut(key).ok_or(CloseReason::ConnectionLost)?;
        if session.name == name {
            return Ok(());
        }

        info!("Client {} renamed {:?} -> {:?}", key.id, session.name, name);
        session.name = name;
        let info = session.info();
        self.broadcast(&ServerPacket::ClientInfo(info), |s| {
            s.status() >= ClientStatus::Authorized
        });
        Ok(())
    }

    /// Closes every session queued for closing, including any that fail as a
    /// consequence.
    fn reap(&mut self) {
        while !self.doomed.is_empty() {
            for (key, reason) in std::mem::take(&mut self.doomed) {
                self.close_session(key, reason);
            }
        }
    }

    /// Tears one session down: tells the peer why, releases its slot and any
    /// map slot, drops its pending commands and tells the others.
    fn close_session(&mut self, key: SessionKey, reason: CloseReason) {
        let Some(mut session) = self.pool.release(key) else {
            return;
        };
        let status = session.status();
        let address = session.address();

        match &reason {
            CloseReason::ClientQuit | CloseReason::ServerShutdown | CloseReason::NewGame => {
                info!("Client {} ({}) left: {}", key.id, address, reason)
            }
            _ => warn!("Closing client {} ({}) in {:?}: {}", key.id, address, status, reason),
        }

        if let Some(code) = reason.peer_code() {
            let packet = ServerPacket::Error {
                code,
                reason: code.description().to_string(),
            };
            if let Err(e) = session.send(&self.framer, &packet) {
                debug!("Could not tell client {} why: {}", key.id, e);
            }
        }
        session.close_transport();

        self.broadcaster.purge(key.id);
        if status == ClientStatus::AuthGame {
            self.auth.abandon(key.id);
        }
        if self.map.holder() == Some(key) {
            info!("Map transfer to client {} ended", key.id);
        }
        self.release_map_slot(key);

        let announce = match reason {
            CloseReason::ServerShutdown | CloseReason::NewGame => false,
            CloseReason::ClientQuit => status >= ClientStatus::DoneMap,
            _ => status >= ClientStatus::Authorized,
        };
        if announce {
            let packet = match reason.broadcast_code() {
                Some(code) => ServerPacket::ErrorQuit {
                    client_id: key.id,
                    code,
                },
                None => ServerPacket::Quit { client_id: key.id },
            };
            self.broadcast(&packet, |s| s.status() >= ClientStatus::Authorized);
        }

        self.events.push(ServerEvent::Disconnected {
            key,
            address,
            reason,
        });
    }

    /// One server tick: advance the world, distribute commands, send frames,
    /// check liveness and timeouts, move the map download along and refill
    /// receive budgets.
    pub fn on_tick(&mut self) {
        self.sim.advance();
        self.broadcaster.run_due(&mut self.sim);
        let frame = self.sim.frame();

        let mut send_frame = false;
        if frame >= self.frame_max {
            self.frame_max = frame.wrapping_add(self.config.frame_freq);
            send_frame = true;
        }
        let send_sync = frame.wrapping_sub(self.last_sync_frame) >= self.config.sync_freq;
        if send_sync {
            self.last_sync_frame = frame;
        }

        let distributed = self.broadcaster.flush(&mut self.pool, self.frame_max);
        if distributed > 0 {
            debug!("Frame {}: distributed {} commands", frame, distributed);
        }

        self.check_sessions(frame);
        self.reap();

        self.send_frames(frame, send_frame, send_sync);
        self.reap();

        self.pump_map();
        self.reap();

        for key in self.pool.keys() {
            if let Some(session) = self.pool.get_mut(key) {
                session.replenish(self.config.bytes_per_frame, self.config.bytes_per_frame_burst);
            }
            self.drain_input(key);
        }
    }

    fn check_sessions(&mut self, frame: u32) {
        let config = &self.config;
        let framer = self.framer;
        let mut waits = Vec::new();

        for session in self.pool.iter_mut() {
            let in_status = frame.saturating_sub(session.status_frame());
            let verdict = match session.status() {
                ClientStatus::Active => check_liveness(session, frame, config),
                ClientStatus::MapWait => {
                    if frame.saturating_sub(session.last_wait_frame) >= config.wait_resend_frames {
                        waits.push(session.key());
                    }
                    Ok(())
                }
                status => {
                    let limit = match status {
                        ClientStatus::AuthGame => config.max_auth_frames,
                        ClientStatus::Map => config.max_download_frames,
                        ClientStatus::DoneMap | ClientStatus::PreActive => config.max_join_frames,
                        _ => config.max_init_frames,
                    };
                    if in_status > limit {
                        Err(CloseReason::Timeout(status))
                    } else {
                        Ok(())
                    }
                }
            };
            if let Err(reason) = verdict {
                self.doomed.push((session.key(), reason));
            }
        }

        if waits.is_empty() {
            return;
        }
        let positions: Vec<SessionKey> = self.map.waiting().collect();
        for key in waits {
            let Some(position) = positions.iter().position(|k| *k == key) else {
                continue;
            };
            if let Some(session) = self.pool.get_mut(key) {
                session.last_wait_frame = frame;
                let packet = ServerPacket::Wait {
                    waiting: (position + 1).min(u8::MAX as usize) as u8,
                };
                if let Err(reason) = session.send(&framer, &packet) {
                    self.doomed.push((key, reason));
                }
            }
        }
    }

    fn send_frames(&mut self, frame: u32, send_frame: bool, send_sync: bool) {
        let framer = self.framer;
        let frame_max = self.frame_max;
        let seed = self.sim.sync_seed();

        for session in self.pool.iter_mut() {
            if session.status() < ClientStatus::PreActive {
                continue;
            }

            let mut packets = Vec::with_capacity(2);
            if send_frame {
                let token = if session.last_token == 0 {
                    session.last_token = new_token();
                    Some(session.last_token)
                } else {
                    None
                };
                packets.push(ServerPacket::Frame {
                    frame,
                    frame_max,
                    token,
                });
            }
            if send_sync {
                packets.push(ServerPacket::Sync { frame, seed });
            }

            let result = session
                .flush_command_queue(&framer)
                .and_then(|_| session.send_all(&framer, &packets));
            if let Err(reason) = result {
                self.doomed.push((session.key(), reason));
            }
        }
    }

    fn pump_map(&mut self) {
        let Some(key) = self.map.holder() else {
            return;
        };
        let frame = self.sim.frame();
        let Some(session) = self.pool.get_mut(key) else {
            self.release_map_slot(key);
            return;
        };

        match self.map.pump(session, &self.framer) {
            Ok(PumpProgress::InProgress) => {}
            Ok(PumpProgress::Done) => {
                session.set_status(ClientStatus::DoneMap, frame);
                info!("Client {} finished downloading the map", key.id);
                self.release_map_slot(key);
            }
            Err(CloseReason::ConnectionLost) => {
                self.close_session(key, CloseReason::TransferAborted);
            }
            Err(reason) => self.close_session(key, reason),
        }
    }

    /// Kicks the client holding `id`. Returns whether there was one.
    pub fn kick(&mut self, id: ClientId) -> bool {
        let Some(key) = self.pool.key_of(id) else {
            return false;
        };
        self.close_session(key, CloseReason::Kicked);
        self.reap();
        true
    }

    /// Kicks the client holding `id` and refuses its address from now on.
    pub fn ban(&mut self, id: ClientId) -> bool {
        let Some(key) = self.pool.key_of(id) else {
            return false;
        };
        if let Some(session) = self.pool.get(key) {
            let ip = session.address().ip();
            if !self.config.banned.contains(&ip) {
                info!("Banning {}", ip);
                self.config.banned.push(ip);
            }
        }
        self.close_session(key, CloseReason::Banned);
        self.reap();
        true
    }

    pub fn send_rcon_result(&mut self, id: ClientId, colour: u16, text: String) {
        let Some(key) = self.pool.key_of(id) else {
            debug!("Rcon result for unknown client {}", id);
            return;
        };
        if let Err(reason) = self.send(key, &ServerPacket::RconResult { colour, text }) {
            self.close_session(key, reason);
        }
        self.reap();
    }

    fn config_update(&self) -> ServerPacket {
        ServerPacket::ConfigUpdate {
            max_companies: self.config.max_companies,
            server_name: self.config.server_name.clone(),
        }
    }

    /// Sends the current client-visible settings to everyone in game.
    pub fn push_config_update(&mut self) {
        let update = self.config_update();
        self.broadcast(&update, |s| s.status() >= ClientStatus::PreActive);
        self.reap();
    }

    /// Relays a chat line from outside the game to everyone in game.
    pub fn send_external_chat(&mut self, source: &str, colour: u16, user: &str, message: &str) {
        let mut message = message.to_string();
        truncate_at_char_boundary(&mut message, NETWORK_CHAT_LENGTH);
        let packet = ServerPacket::ExternalChat {
            source: source.to_string(),
            colour,
            user: user.to_string(),
            message,
        };
        self.broadcast(&packet, |s| s.status() >= ClientStatus::PreActive);
        self.reap();
    }

    /// Tells every client the server is going down, then closes them all.
    pub fn shutdown(&mut self) {
        info!("Shutting down {} sessions", self.pool.len());
        self.broadcast(&ServerPacket::Shutdown, |_| true);
        self.map.cancel_all();
        self.doomed.clear();
        for key in self.pool.keys() {
            self.close_session(key, CloseReason::ServerShutdown);
        }
        self.doomed.clear();
    }

    /// Tells every client a new game is starting, closes them all and resets
    /// the world.
    pub fn new_game(&mut self) {
        info!("Starting a new game");
        self.broadcast(&ServerPacket::NewGame, |_| true);
        self.map.cancel_all();
        self.doomed.clear();
        for key in self.pool.keys() {
            self.close_session(key, CloseReason::NewGame);
        }
        self.doomed.clear();

        self.broadcaster.clear();
        self.sim.reset();
        self.frame_max = self.sim.frame();
        self.last_sync_frame = self.sim.frame();
    }
}

/// Token lag and frame lag of an active client.
fn check_liveness(
    session: &mut ClientSession,
    frame: u32,
    config: &ServerConfig,
) -> Result<(), CloseReason> {
    if frame.saturating_sub(session.last_token_frame) > config.max_lag_frames {
        return Err(CloseReason::LivenessTimeout("no reply to frame token"));
    }

    let lag_units = frame.saturating_sub(session.last_frame_server) / config.lag_unit_frames;
    if lag_units > MAX_LAG_UNITS {
        return Err(CloseReason::LivenessTimeout("too far behind"));
    }
    if lag_units >= 1 {
        if session.lag_test == 0 {
            warn!("Client {} is slow, {} frames behind", session.id(), frame - session.last_frame_server);
            session.lag_test = 1;
        }
    } else {
        session.lag_test = 0;
    }
    Ok(())
}

fn new_token() -> u8 {
    rand::thread_rng().gen_range(1..=u8::MAX)
}

/// Non-empty, at most [`NETWORK_CLIENT_NAME_LENGTH`] bytes, no control
/// characters, not blank.
pub fn is_valid_client_name(name: &str) -> bool {
    !name.trim().is_empty()
        && name.len() <= NETWORK_CLIENT_NAME_LENGTH
        && !name.chars().any(char::is_control)
}

fn truncate_at_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
