//! Headless client that joins a running server, loads the map and then
//! follows the game in lockstep, checking every `SYNC` against its own copy
//! of the world.

use clap::Parser;
use server::auth::PasswordAuthenticator;
use server::world::{LedgerWorld, Simulation};
use shared::{
    ClientPacket, CommandPacket, CompanyId, Decoded, Framer, Message, ServerPacket,
    NETWORK_REVISION,
};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:3979")]
    server: String,
    /// Client name
    #[clap(short, long, default_value = "bot")]
    name: String,
    /// Server password
    #[clap(long)]
    password: Option<String>,
    /// Company to play as (0-based); spectates when omitted
    #[clap(short, long)]
    company: Option<u8>,
    /// Frames between deposits when playing a company
    #[clap(long, default_value = "50")]
    deposit_every: u32,
    /// Seconds to stay connected
    #[clap(short, long, default_value = "30")]
    duration: u64,
}

struct Connection {
    stream: TcpStream,
    framer: Framer,
    buffer: Vec<u8>,
}

impl Connection {
    async fn send(&mut self, packet: ClientPacket) -> Result<(), Box<dyn std::error::Error>> {
        let frame = self.framer.encode(&packet, None)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<ServerPacket, Box<dyn std::error::Error>> {
        loop {
            if let Decoded::Packet { packet, consumed } =
                self.framer
                    .decode::<ServerPacket>(&self.buffer, usize::MAX, None)?
            {
                self.buffer.drain(..consumed);
                return Ok(packet);
            }

            let mut chunk = [0u8; 4096];
            let len = self.stream.read(&mut chunk).await?;
            if len == 0 {
                return Err("server closed the connection".into());
            }
            self.buffer.extend_from_slice(&chunk[..len]);
        }
    }
}

/// The bot's copy of the world and the commands it has yet to run.
struct Mirror {
    world: LedgerWorld,
    commands: VecDeque<CommandPacket>,
    pending_sync: Option<(u32, u32)>,
    desyncs: u32,
}

impl Mirror {
    fn advance_to(&mut self, frame: u32) {
        while self.world.frame() < frame {
            self.world.advance();
            while let Some(command) = self.commands.front() {
                if command.frame > self.world.frame() {
                    break;
                }
                if let Some(command) = self.commands.pop_front() {
                    self.world.execute(&command);
                }
            }
        }
        self.check_sync();
    }

    fn check_sync(&mut self) {
        if let Some((frame, seed)) = self.pending_sync {
            if self.world.frame() == frame {
                if self.world.sync_seed() != seed {
                    self.desyncs += 1;
                    println!("Desync at frame {}", frame);
                }
                self.pending_sync = None;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let playas = args.company.map(CompanyId).unwrap_or(CompanyId::SPECTATOR);

    println!("Connecting to {}", args.server);
    let stream = TcpStream::connect(&args.server).await?;
    stream.set_nodelay(true)?;
    let mut conn = Connection {
        stream,
        framer: Framer::default(),
        buffer: Vec::new(),
    };

    conn.send(ClientPacket::Join {
        revision: NETWORK_REVISION.to_string(),
    })
    .await?;

    // Handshake up to the map download.
    loop {
        match conn.recv().await? {
            ServerPacket::AuthRequest { challenge } => {
                let password = args.password.clone().unwrap_or_default();
                let payload = PasswordAuthenticator::reply_for(&challenge, &password);
                conn.send(ClientPacket::AuthResponse { payload }).await?;
                // Without encryption the server is ready for IDENTIFY at once.
                conn.send(ClientPacket::Identify {
                    name: args.name.clone(),
                    playas,
                })
                .await?;
            }
            ServerPacket::EnableEncryption => {
                return Err("server requires encryption, which this bot does not speak".into());
            }
            ServerPacket::CheckNewGrfs { grfs } => {
                println!("Server uses {} extensions", grfs.len());
                conn.send(ClientPacket::NewGrfsChecked).await?;
            }
            ServerPacket::Welcome { client_id } => {
                println!("Welcome, we are client {}", client_id);
                conn.send(ClientPacket::GetMap).await?;
                break;
            }
            ServerPacket::Error { code, reason } => {
                return Err(format!("refused: {:?} ({})", code, reason).into());
            }
            other => println!("Ignoring {:?} during handshake", other.packet_type()),
        }
    }

    let mut map = Vec::new();
    let world = loop {
        match conn.recv().await? {
            ServerPacket::Wait { waiting } => println!("Waiting for map, {} ahead of us", waiting),
            ServerPacket::MapBegin { frame } => println!("Map download starts at frame {}", frame),
            ServerPacket::MapSize { bytes } => map.reserve(bytes as usize),
            ServerPacket::MapData { chunk } => map.extend_from_slice(&chunk),
            ServerPacket::MapDone => break LedgerWorld::from_snapshot(&map)?,
            ServerPacket::Error { code, reason } => {
                return Err(format!("map download failed: {:?} ({})", code, reason).into());
            }
            _ => {}
        }
    };
    println!("Loaded {} byte map at frame {}", map.len(), world.frame());
    conn.send(ClientPacket::MapOk).await?;

    let mut mirror = Mirror {
        world,
        commands: VecDeque::new(),
        pending_sync: None,
        desyncs: 0,
    };
    let mut last_deposit = 0;
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    while Instant::now() < deadline {
        let packet = match timeout(Duration::from_millis(500), conn.recv()).await {
            Ok(packet) => packet?,
            Err(_) => continue,
        };

        match packet {
            ServerPacket::Frame { frame, token, .. } => {
                mirror.advance_to(frame);
                conn.send(ClientPacket::Ack {
                    frame,
                    token: token.unwrap_or(0),
                })
                .await?;

                if args.company.is_some() && frame.saturating_sub(last_deposit) >= args.deposit_every {
                    last_deposit = frame;
                    conn.send(ClientPacket::Command(LedgerWorld::deposit(playas, 1)))
                        .await?;
                }
            }
            ServerPacket::Sync { frame, seed } => {
                mirror.pending_sync = Some((frame, seed));
                mirror.check_sync();
            }
            ServerPacket::Command(command) => mirror.commands.push_back(command),
            ServerPacket::Chat {
                client_id, message, ..
            } => println!("<{}> {}", client_id, message),
            ServerPacket::Shutdown => {
                println!("Server is shutting down");
                break;
            }
            ServerPacket::Error { code, reason } => {
                println!("Disconnected: {:?} ({})", code, reason);
                break;
            }
            _ => {}
        }
    }

    if args.company.is_some() {
        println!(
            "Balance of {} at frame {}: {}",
            playas,
            mirror.world.frame(),
            mirror.world.balance(playas)
        );
    }
    println!("Done with {} desyncs", mirror.desyncs);

    conn.send(ClientPacket::Quit).await.ok();
    Ok(())
}
