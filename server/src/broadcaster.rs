//! Command collection and lockstep distribution.
//!
//! Commands from all clients go into one FIFO. Each tick `flush` schedules
//! what is due for `frame_max + 1` and hands the very same sequence to every
//! session that is, or is about to be, part of the game. Every client thus
//! applies the same commands at the same frame in the same order.

use crate::error::CloseReason;
use crate::pool::SessionPool;
use crate::session::{ClientSession, ClientStatus};
use crate::world::Simulation;
use log::{debug, warn};
use shared::{
    ClientId, CommandPacket, CommandRequest, ErrorCode, FrameError, PacketType, COMMAND_OVERHEAD,
};
use std::collections::{HashMap, VecDeque};

pub struct CommandBroadcaster {
    incoming: VecDeque<CommandPacket>,
    /// Distributed commands the server's own world has not run yet.
    scheduled: VecDeque<CommandPacket>,
    commands_per_frame: usize,
    max_commands_in_queue: usize,
}

impl CommandBroadcaster {
    pub fn new(commands_per_frame: usize, max_commands_in_queue: usize) -> Self {
        Self {
            incoming: VecDeque::new(),
            scheduled: VecDeque::new(),
            commands_per_frame: commands_per_frame.max(1),
            max_commands_in_queue,
        }
    }

    /// Commands waiting for distribution.
    pub fn pending(&self) -> usize {
        self.incoming.len()
    }

    pub fn pending_from(&self, client: ClientId) -> usize {
        self.incoming
            .iter()
            .filter(|command| command.client_id == client)
            .count()
    }

    /// Distributed commands the server's world has yet to run, in order.
    pub fn scheduled(&self) -> impl Iterator<Item = &CommandPacket> {
        self.scheduled.iter()
    }

    /// Validates and buffers a command a client sent.
    ///
    /// `max_frame` is the largest `COMMAND` frame every recipient can take.
    /// A request whose relayed copy would exceed it is malformed.
    pub fn enqueue(
        &mut self,
        session: &ClientSession,
        request: CommandRequest,
        sim: &dyn Simulation,
        max_frame: usize,
    ) -> Result<(), CloseReason> {
        if session.status() != ClientStatus::Active {
            return Err(CloseReason::ProtocolViolation(PacketType::ClientCommand));
        }

        let size = COMMAND_OVERHEAD + request.data.len();
        if size > max_frame {
            warn!(
                "Client {} sent command {} too large to relay ({} bytes)",
                session.id(),
                request.cmd,
                size
            );
            return Err(CloseReason::Malformed(FrameError::Oversized {
                size,
                max: max_frame,
            }));
        }

        if request.company != session.playas {
            warn!(
                "Client {} sent command {} for {} while playing as {}",
                session.id(),
                request.cmd,
                request.company,
                session.playas
            );
            return Err(CloseReason::Rejected(ErrorCode::CompanyMismatch));
        }

        if !sim.is_valid_command(request.cmd) {
            warn!("Client {} sent unknown command {}", session.id(), request.cmd);
            return Err(CloseReason::Rejected(ErrorCode::IllegalPacket));
        }

        if self.pending_from(session.id()) >= self.max_commands_in_queue {
            return Err(CloseReason::Rejected(ErrorCode::TooManyCommands));
        }

        self.incoming.push_back(request.into_packet(session.id()));
        Ok(())
    }

    /// Buffers a command issued by the server itself.
    pub fn enqueue_server(&mut self, request: CommandRequest) {
        self.incoming.push_back(request.into_packet(ClientId::SERVER));
    }

    /// Drops everything `client` still had waiting.
    pub fn purge(&mut self, client: ClientId) {
        let before = self.incoming.len();
        self.incoming.retain(|command| command.client_id != client);
        let dropped = before - self.incoming.len();
        if dropped > 0 {
            debug!("Dropped {} pending commands of client {}", dropped, client);
        }
    }

    /// Schedules this tick's commands for `frame_max + 1` and queues them on
    /// every session from `MAP` onwards, in slot order.
    ///
    /// At most `commands_per_frame` commands per sender go out per flush; the
    /// rest keep their place for the next one. Returns how many went out.
    pub fn flush(&mut self, pool: &mut SessionPool, frame_max: u32) -> usize {
        if self.incoming.is_empty() {
            return 0;
        }

        let mut sent_per_client: HashMap<ClientId, usize> = HashMap::new();
        let mut due = Vec::new();
        let mut held = VecDeque::with_capacity(self.incoming.len());

        for mut command in self.incoming.drain(..) {
            let sent = sent_per_client.entry(command.client_id).or_insert(0);
            if *sent < self.commands_per_frame {
                *sent += 1;
                command.frame = frame_max.wrapping_add(1);
                due.push(command);
            } else {
                held.push_back(command);
            }
        }
        self.incoming = held;

        for session in pool.iter_mut() {
            if session.status() < ClientStatus::Map {
                continue;
            }
            for command in &due {
                let mut copy = command.clone();
                copy.my_cmd = copy.client_id == session.id();
                session.queue_command(copy);
            }
        }

        let count = due.len();
        self.scheduled.extend(due);
        count
    }

    /// Runs every scheduled command whose frame the world has reached.
    pub fn run_due(&mut self, sim: &mut dyn Simulation) {
        while let Some(command) = self.scheduled.front() {
            if command.frame > sim.frame() {
                break;
            }
            if let Some(command) = self.scheduled.pop_front() {
                sim.execute(&command);
            }
        }
    }

    /// Forgets everything, for a new game.
    pub fn clear(&mut self) {
        self.incoming.clear();
        self.scheduled.clear();
    }
}
