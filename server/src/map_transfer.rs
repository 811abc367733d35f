//! Single-flight map download.
//!
//! Only one session receives the map at any time. Everyone else asking for
//! it waits in a FIFO queue; when the current download finishes or its
//! session goes away, the earliest waiter is promoted and gets a freshly
//! taken snapshot.

use crate::error::CloseReason;
use crate::pool::SessionKey;
use crate::session::ClientSession;
use crate::world::SnapshotError;
use log::{debug, info};
use shared::{Framer, ServerPacket, MAP_DATA_OVERHEAD};
use std::collections::VecDeque;

/// Answer to a map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferGrant {
    Granted,
    /// Queued at this 1-based position.
    Queued(usize),
}

/// Progress of the active download after one pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpProgress {
    InProgress,
    Done,
}

struct ActiveTransfer {
    key: SessionKey,
    frame: u32,
    data: Vec<u8>,
    offset: usize,
    header_sent: bool,
}

pub struct MapTransfer {
    active: Option<ActiveTransfer>,
    waiting: VecDeque<SessionKey>,
    chunk_size: usize,
    chunks_per_tick: usize,
}

impl MapTransfer {
    pub fn new(chunk_size: usize, chunks_per_tick: usize) -> Self {
        Self {
            active: None,
            waiting: VecDeque::new(),
            chunk_size: chunk_size.max(1),
            chunks_per_tick: chunks_per_tick.max(1),
        }
    }

    /// Session currently downloading.
    pub fn holder(&self) -> Option<SessionKey> {
        self.active.as_ref().map(|active| active.key)
    }

    pub fn waiting(&self) -> impl Iterator<Item = SessionKey> + '_ {
        self.waiting.iter().copied()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Grants the download slot to `key` if it is free, else queues it.
    ///
    /// `snapshot` is only taken on a grant. If it fails nothing is granted.
    pub fn begin<F>(&mut self, key: SessionKey, snapshot: F) -> Result<TransferGrant, SnapshotError>
    where
        F: FnOnce() -> Result<(u32, Vec<u8>), SnapshotError>,
    {
        if self.active.is_some() {
            self.waiting.push_back(key);
            debug!("Client {} queued for map at {}", key.id, self.waiting.len());
            return Ok(TransferGrant::Queued(self.waiting.len()));
        }

        let (frame, data) = snapshot()?;
        info!(
            "Client {} granted map download ({} bytes, frame {})",
            key.id,
            data.len(),
            frame
        );
        self.active = Some(ActiveTransfer {
            key,
            frame,
            data,
            offset: 0,
            header_sent: false,
        });
        Ok(TransferGrant::Granted)
    }

    /// Sends this tick's share of the map to the holder, as one write.
    ///
    /// Chunks shrink below the configured size when the session's cipher
    /// would otherwise push a sealed `MAP_DATA` over the frame limit.
    pub fn pump(
        &mut self,
        session: &mut ClientSession,
        framer: &Framer,
    ) -> Result<PumpProgress, CloseReason> {
        let Some(active) = self.active.as_mut().filter(|a| a.key == session.key()) else {
            return Ok(PumpProgress::InProgress);
        };

        let room = framer
            .max_frame_size()
            .saturating_sub(MAP_DATA_OVERHEAD + session.cipher_overhead());
        let chunk_size = self.chunk_size.min(room).max(1);

        let mut packets = Vec::with_capacity(self.chunks_per_tick + 3);
        if !active.header_sent {
            packets.push(ServerPacket::MapBegin {
                frame: active.frame,
            });
            packets.push(ServerPacket::MapSize {
                bytes: active.data.len() as u32,
            });
            active.header_sent = true;
        }

        for _ in 0..self.chunks_per_tick {
            if active.offset >= active.data.len() {
                break;
            }
            let end = (active.offset + chunk_size).min(active.data.len());
            packets.push(ServerPacket::MapData {
                chunk: active.data[active.offset..end].to_vec(),
            });
            active.offset = end;
        }

        let done = active.offset >= active.data.len();
        if done {
            packets.push(ServerPacket::MapDone);
        }

        session.send_all(framer, &packets)?;
        Ok(if done {
            PumpProgress::Done
        } else {
            PumpProgress::InProgress
        })
    }

    /// Drops the running download and every waiter without promoting
    /// anyone, for when all sessions are about to close.
    pub fn cancel_all(&mut self) {
        if self.active.take().is_some() || !self.waiting.is_empty() {
            debug!("Cancelling map transfer and {} waiters", self.waiting.len());
        }
        self.waiting.clear();
    }

    /// Forgets `key`, whether it was downloading or waiting.
    ///
    /// When the slot is free afterwards, the earliest waiter is taken off the
    /// queue and returned; the caller must `begin` it.
    pub fn complete_or_abort(&mut self, key: SessionKey) -> Option<SessionKey> {
        if self.holder() == Some(key) {
            self.active = None;
            debug!("Client {} released the map slot", key.id);
        } else {
            self.waiting.retain(|waiting| *waiting != key);
        }

        if self.active.is_none() {
            self.waiting.pop_front()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SessionPool;
    use crate::session::test_support::TagCipher;
    use crate::session::Outgoing;
    use shared::{Decoded, TCP_MTU};
    use std::net::SocketAddr;
    use tokio::sync::mpsc;

    fn pool_with(n: usize) -> (SessionPool, Vec<(SessionKey, mpsc::UnboundedReceiver<Outgoing>)>) {
        let mut pool = SessionPool::new(n);
        let sessions = (0..n)
            .map(|i| {
                let (tx, rx) = mpsc::unbounded_channel();
                let key = pool
                    .allocate(
                        Box::new(tx),
                        SocketAddr::from(([127, 0, 0, 1], 5000 + i as u16)),
                        1 << 16,
                        0,
                    )
                    .unwrap();
                (key, rx)
            })
            .collect();
        (pool, sessions)
    }

    fn snapshot(frame: u32, len: usize) -> impl FnOnce() -> Result<(u32, Vec<u8>), SnapshotError> {
        move || Ok((frame, (0..len).map(|b| b as u8).collect()))
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<ServerPacket> {
        let mut packets = Vec::new();
        while let Ok(Outgoing::Bytes(bytes)) = rx.try_recv() {
            let (mut decoded, _) = Framer::default()
                .decode_all::<ServerPacket>(&bytes)
                .unwrap();
            packets.append(&mut decoded);
        }
        packets
    }

    #[test]
    fn test_first_request_granted_rest_queued_in_order() {
        let (_pool, sessions) = pool_with(3);
        let mut transfer = MapTransfer::new(16, 1);

        assert_eq!(
            transfer.begin(sessions[0].0, snapshot(1, 4)).unwrap(),
            TransferGrant::Granted
        );
        assert_eq!(
            transfer.begin(sessions[1].0, snapshot(1, 4)).unwrap(),
            TransferGrant::Queued(1)
        );
        assert_eq!(
            transfer.begin(sessions[2].0, snapshot(1, 4)).unwrap(),
            TransferGrant::Queued(2)
        );
        assert_eq!(transfer.holder(), Some(sessions[0].0));
    }

    #[test]
    fn test_queued_request_takes_no_snapshot() {
        let (_pool, sessions) = pool_with(2);
        let mut transfer = MapTransfer::new(16, 1);
        transfer.begin(sessions[0].0, snapshot(1, 4)).unwrap();

        let grant = transfer
            .begin(sessions[1].0, || panic!("snapshot taken for a waiter"))
            .unwrap();
        assert_eq!(grant, TransferGrant::Queued(1));
    }

    #[test]
    fn test_stream_is_chunked_across_pumps() {
        let (mut pool, mut sessions) = pool_with(1);
        let (key, rx) = &mut sessions[0];
        let mut transfer = MapTransfer::new(4, 2);
        let framer = Framer::default();
        transfer.begin(*key, snapshot(7, 10)).unwrap();

        let session = pool.get_mut(*key).unwrap();
        assert_eq!(transfer.pump(session, &framer).unwrap(), PumpProgress::InProgress);
        assert_eq!(
            received(rx),
            vec![
                ServerPacket::MapBegin { frame: 7 },
                ServerPacket::MapSize { bytes: 10 },
                ServerPacket::MapData {
                    chunk: vec![0, 1, 2, 3]
                },
                ServerPacket::MapData {
                    chunk: vec![4, 5, 6, 7]
                },
            ]
        );

        assert_eq!(transfer.pump(session, &framer).unwrap(), PumpProgress::Done);
        assert_eq!(
            received(rx),
            vec![
                ServerPacket::MapData { chunk: vec![8, 9] },
                ServerPacket::MapDone
            ]
        );
    }

    #[test]
    fn test_abort_promotes_earliest_waiter() {
        let (_pool, sessions) = pool_with(3);
        let mut transfer = MapTransfer::new(16, 1);
        let (a, b, c) = (sessions[0].0, sessions[1].0, sessions[2].0);
        transfer.begin(a, snapshot(1, 4)).unwrap();
        transfer.begin(b, snapshot(1, 4)).unwrap();
        transfer.begin(c, snapshot(1, 4)).unwrap();

        assert_eq!(transfer.complete_or_abort(a), Some(b));
        assert_eq!(transfer.holder(), None);
        assert_eq!(transfer.begin(b, snapshot(2, 4)).unwrap(), TransferGrant::Granted);
        assert_eq!(transfer.waiting().collect::<Vec<_>>(), vec![c]);
    }

    #[test]
    fn test_waiter_leaving_keeps_holder() {
        let (_pool, sessions) = pool_with(3);
        let mut transfer = MapTransfer::new(16, 1);
        let (a, b, c) = (sessions[0].0, sessions[1].0, sessions[2].0);
        transfer.begin(a, snapshot(1, 4)).unwrap();
        transfer.begin(b, snapshot(1, 4)).unwrap();
        transfer.begin(c, snapshot(1, 4)).unwrap();

        assert_eq!(transfer.complete_or_abort(b), None);
        assert_eq!(transfer.holder(), Some(a));
        assert_eq!(transfer.waiting().collect::<Vec<_>>(), vec![c]);
    }

    #[test]
    fn test_failed_snapshot_leaves_slot_free() {
        let (_pool, sessions) = pool_with(2);
        let mut transfer = MapTransfer::new(16, 1);

        let result = transfer.begin(sessions[0].0, || {
            Err(SnapshotError::Unavailable("disk".into()))
        });
        assert!(result.is_err());
        assert_eq!(transfer.holder(), None);
        assert_eq!(
            transfer.begin(sessions[1].0, snapshot(1, 1)).unwrap(),
            TransferGrant::Granted
        );
    }

    #[test]
    fn test_pump_ignores_non_holder() {
        let (mut pool, mut sessions) = pool_with(2);
        let mut transfer = MapTransfer::new(16, 1);
        transfer.begin(sessions[0].0, snapshot(1, 4)).unwrap();

        let other = pool.get_mut(sessions[1].0).unwrap();
        assert_eq!(
            transfer.pump(other, &Framer::default()).unwrap(),
            PumpProgress::InProgress
        );
        assert!(received(&mut sessions[1].1).is_empty());
    }

    #[test]
    fn test_chunks_leave_room_for_cipher_overhead() {
        let (mut pool, mut sessions) = pool_with(1);
        let (key, rx) = &mut sessions[0];
        let mut transfer = MapTransfer::new(TCP_MTU - MAP_DATA_OVERHEAD, 4);
        let framer = Framer::default();
        transfer.begin(*key, snapshot(3, 100_000)).unwrap();

        let session = pool.get_mut(*key).unwrap();
        session.enable_encryption(Box::new(TagCipher));

        let mut map = Vec::new();
        let mut client_cipher = TagCipher;
        for _ in 0..10 {
            let progress = transfer.pump(session, &framer).unwrap();
            while let Ok(Outgoing::Bytes(bytes)) = rx.try_recv() {
                let mut offset = 0;
                while let Decoded::Packet { packet, consumed } = framer
                    .decode::<ServerPacket>(&bytes[offset..], usize::MAX, Some(&mut client_cipher))
                    .unwrap()
                {
                    assert!(consumed <= framer.max_frame_size());
                    if let ServerPacket::MapData { chunk } = packet {
                        map.extend(chunk);
                    }
                    offset += consumed;
                }
            }
            if progress == PumpProgress::Done {
                break;
            }
        }

        assert_eq!(map.len(), 100_000);
        assert_eq!(transfer.holder(), Some(*key));
    }

    #[test]
    fn test_cancel_all_promotes_nobody() {
        let (_pool, sessions) = pool_with(3);
        let mut transfer = MapTransfer::new(16, 1);
        let (a, b, c) = (sessions[0].0, sessions[1].0, sessions[2].0);
        transfer.begin(a, snapshot(1, 4)).unwrap();
        transfer.begin(b, snapshot(1, 4)).unwrap();
        transfer.begin(c, snapshot(1, 4)).unwrap();

        transfer.cancel_all();
        assert_eq!(transfer.holder(), None);
        assert_eq!(transfer.waiting_len(), 0);
        assert_eq!(transfer.complete_or_abort(a), None);
    }
}
