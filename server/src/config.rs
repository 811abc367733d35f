//! Server configuration and its defaults.

use shared::{GrfIdentifier, HEADER_SIZE, MAP_DATA_OVERHEAD, NETWORK_REVISION, TCP_MTU};
use std::net::IpAddr;
use std::time::Duration;

/// Frames per "game day"; the unit for lag points and catch-up slack.
pub const DAY_FRAMES: u32 = 74;

/// Tunables for one server instance.
///
/// Frame-based limits are counted in server frames, which advance once per
/// tick.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_name: String,
    pub revision: String,
    /// Capacity of the session pool.
    pub max_clients: usize,
    pub max_companies: u8,
    pub server_password: Option<String>,
    pub rcon_password: Option<String>,
    /// Addresses refused at accept time.
    pub banned: Vec<IpAddr>,
    /// Extension content every client must have.
    pub newgrfs: Vec<GrfIdentifier>,
    pub tick_duration: Duration,

    /// Largest frame accepted or sent.
    pub max_frame_size: usize,
    /// Receive budget added to every session per tick.
    pub bytes_per_frame: usize,
    /// Ceiling of the receive budget and of buffered unprocessed input.
    pub bytes_per_frame_burst: usize,

    /// Frames between `FRAME` packets.
    pub frame_freq: u32,
    /// Frames between `SYNC` packets.
    pub sync_freq: u32,
    /// Commands distributed per sender per tick.
    pub commands_per_frame: usize,
    /// Commands a session may have pending before it is dropped.
    pub max_commands_in_queue: usize,

    pub map_chunk_size: usize,
    pub map_chunks_per_tick: usize,
    pub wait_resend_frames: u32,

    /// How far behind a pre-active client may be and still count as caught up.
    pub catch_up_frames: u32,
    /// Token replies older than this close the session.
    pub max_lag_frames: u32,
    /// Frames per lag point.
    pub lag_unit_frames: u32,

    pub max_init_frames: u32,
    pub max_auth_frames: u32,
    pub max_download_frames: u32,
    pub max_join_frames: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "Unnamed Server".to_string(),
            revision: NETWORK_REVISION.to_string(),
            max_clients: 25,
            max_companies: 15,
            server_password: None,
            rcon_password: None,
            banned: Vec::new(),
            newgrfs: Vec::new(),
            tick_duration: Duration::from_millis(30),
            max_frame_size: TCP_MTU,
            bytes_per_frame: 8192,
            bytes_per_frame_burst: 65536,
            frame_freq: 0,
            sync_freq: 100,
            commands_per_frame: 2,
            max_commands_in_queue: 16,
            map_chunk_size: TCP_MTU - MAP_DATA_OVERHEAD,
            map_chunks_per_tick: 16,
            wait_resend_frames: 2 * DAY_FRAMES,
            catch_up_frames: DAY_FRAMES,
            max_lag_frames: 500,
            lag_unit_frames: DAY_FRAMES,
            max_init_frames: 100,
            max_auth_frames: 2000,
            max_download_frames: 1000,
            max_join_frames: 500,
        }
    }
}

impl ServerConfig {
    /// Clamps values that would make the server unable to make progress.
    pub fn sanitized(mut self) -> Self {
        self.max_clients = self.max_clients.clamp(1, u16::MAX as usize - 1);
        // Same bounds the framer applies.
        self.max_frame_size = self.max_frame_size.clamp(HEADER_SIZE, u16::MAX as usize);
        self.bytes_per_frame_burst = self.bytes_per_frame_burst.max(self.max_frame_size);
        self.bytes_per_frame = self.bytes_per_frame.clamp(1, self.bytes_per_frame_burst);
        self.map_chunk_size = self
            .map_chunk_size
            .clamp(1, self.max_frame_size.saturating_sub(MAP_DATA_OVERHEAD).max(1));
        self.map_chunks_per_tick = self.map_chunks_per_tick.max(1);
        self.sync_freq = self.sync_freq.max(1);
        self.commands_per_frame = self.commands_per_frame.max(1);
        self.lag_unit_frames = self.lag_unit_frames.max(1);
        self.wait_resend_frames = self.wait_resend_frames.max(1);
        self
    }

    pub fn is_banned(&self, address: IpAddr) -> bool {
        self.banned.contains(&address)
    }
}
