//! The simulation the server runs in lockstep with its clients, and a small
//! ledger world implementing it.

use bincode::Options;
use log::info;
use serde::{Deserialize, Serialize};
use shared::{CommandPacket, CompanyId};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to serialize world: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("world unavailable: {0}")]
    Unavailable(String),
}

/// The deterministic world the server keeps in lockstep with its clients.
pub trait Simulation: Send {
    /// Current simulation frame.
    fn frame(&self) -> u32;

    /// Runs one frame.
    fn advance(&mut self);

    /// Full state, in the format clients load on join.
    fn snapshot(&self) -> Result<Vec<u8>, SnapshotError>;

    /// Checksum clients compare against their own state on `SYNC`.
    fn sync_seed(&self) -> u32;

    /// Applies a distributed command to the server's own copy.
    fn execute(&mut self, command: &CommandPacket);

    fn is_valid_command(&self, cmd: u16) -> bool;

    /// Starts over with a fresh world.
    fn reset(&mut self) {}
}

pub const CMD_DEPOSIT: u16 = 0;
pub const CMD_WITHDRAW: u16 = 1;
const COMMAND_COUNT: u16 = 2;

/// Minimal deterministic world: one balance per company, changed by
/// deposit/withdraw commands carrying a little-endian `i64` amount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerWorld {
    frame: u32,
    seed: u32,
    balances: BTreeMap<CompanyId, i64>,
}

impl LedgerWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, SnapshotError> {
        Ok(codec().deserialize(bytes)?)
    }

    pub fn balance(&self, company: CompanyId) -> i64 {
        self.balances.get(&company).copied().unwrap_or(0)
    }

    pub fn deposit(company: CompanyId, amount: i64) -> shared::CommandRequest {
        shared::CommandRequest {
            company,
            cmd: CMD_DEPOSIT,
            data: amount.to_le_bytes().to_vec(),
        }
    }

    fn mix(&mut self, value: u32) {
        self.seed = self.seed.rotate_left(5) ^ value.wrapping_mul(0x9E37_79B9);
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

impl Simulation for LedgerWorld {
    fn frame(&self) -> u32 {
        self.frame
    }

    fn advance(&mut self) {
        self.frame = self.frame.wrapping_add(1);
        self.mix(self.frame);
    }

    fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(codec().serialize(self)?)
    }

    fn sync_seed(&self) -> u32 {
        self.seed
    }

    fn execute(&mut self, command: &CommandPacket) {
        let amount = <[u8; 8]>::try_from(command.data.as_slice())
            .map(i64::from_le_bytes)
            .unwrap_or(0);
        let balance = self.balances.entry(command.company).or_insert(0);
        match command.cmd {
            CMD_DEPOSIT => *balance = balance.wrapping_add(amount),
            CMD_WITHDRAW => *balance = balance.wrapping_sub(amount),
            _ => return,
        }
        self.mix(command.cmd as u32 ^ amount as u32);
    }

    fn is_valid_command(&self, cmd: u16) -> bool {
        cmd < COMMAND_COUNT
    }

    fn reset(&mut self) {
        info!("Ledger reset at frame {}", self.frame);
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ClientId;

    fn command(cmd: u16, amount: i64) -> CommandPacket {
        let mut request = LedgerWorld::deposit(CompanyId(0), amount);
        request.cmd = cmd;
        request.into_packet(ClientId(1))
    }

    #[test]
    fn test_commands_change_balances() {
        let mut world = LedgerWorld::new();
        world.execute(&command(CMD_DEPOSIT, 50));
        world.execute(&command(CMD_WITHDRAW, 20));
        assert_eq!(world.balance(CompanyId(0)), 30);
        assert_eq!(world.balance(CompanyId(1)), 0);
    }

    #[test]
    fn test_same_inputs_same_seed() {
        let mut a = LedgerWorld::new();
        let mut b = LedgerWorld::new();
        for world in [&mut a, &mut b] {
            world.advance();
            world.execute(&command(CMD_DEPOSIT, 7));
            world.advance();
        }
        assert_eq!(a.sync_seed(), b.sync_seed());

        b.execute(&command(CMD_DEPOSIT, 1));
        assert_ne!(a.sync_seed(), b.sync_seed());
    }

    #[test]
    fn test_snapshot_restores_world() {
        let mut world = LedgerWorld::new();
        world.advance();
        world.execute(&command(CMD_DEPOSIT, 99));

        let restored = LedgerWorld::from_snapshot(&world.snapshot().unwrap()).unwrap();
        assert_eq!(restored, world);
        assert_eq!(restored.frame(), 1);
    }

    #[test]
    fn test_unknown_command_is_invalid() {
        let world = LedgerWorld::new();
        assert!(world.is_valid_command(CMD_DEPOSIT));
        assert!(!world.is_valid_command(COMMAND_COUNT));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut world = LedgerWorld::new();
        world.advance();
        world.execute(&command(CMD_DEPOSIT, 5));
        world.reset();
        assert_eq!(world, LedgerWorld::new());
    }
}
