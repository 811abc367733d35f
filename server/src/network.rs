//! Server network layer: TCP accept/read/write tasks around the single loop
//! that owns the [`Server`].

use crate::pool::SessionKey;
use crate::server::{Server, ServerEvent};
use crate::session::Outgoing;
use crate::world::Simulation;
use log::{debug, error, info, warn};
use shared::{ClientId, CommandRequest};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

const READ_BUFFER_SIZE: usize = 4096;

/// Messages sent from network tasks and handles to the main server loop
#[derive(Debug)]
pub enum NetworkMessage {
    Connected {
        conn: u64,
        address: SocketAddr,
        transport: mpsc::UnboundedSender<Outgoing>,
        /// Dropping this stops the connection's reader.
        cancel: oneshot::Sender<()>,
    },
    Data {
        conn: u64,
        bytes: Vec<u8>,
    },
    Closed {
        conn: u64,
    },
    Admin(AdminCommand),
    Shutdown,
}

/// Administrative operations forwarded from outside the loop.
#[derive(Debug)]
pub enum AdminCommand {
    Kick(ClientId),
    Ban(ClientId),
    RconResult {
        client_id: ClientId,
        colour: u16,
        text: String,
    },
    ExternalChat {
        source: String,
        colour: u16,
        user: String,
        message: String,
    },
    ServerCommand(CommandRequest),
    PushConfigUpdate,
    NewGame,
}

/// Cloneable way to talk to a running [`NetworkServer`].
#[derive(Debug, Clone)]
pub struct NetworkHandle {
    tx: mpsc::UnboundedSender<NetworkMessage>,
}

impl NetworkHandle {
    pub fn admin(&self, command: AdminCommand) -> bool {
        self.tx.send(NetworkMessage::Admin(command)).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.tx.send(NetworkMessage::Shutdown).is_ok()
    }
}

struct Connection {
    key: Option<SessionKey>,
    _cancel: oneshot::Sender<()>,
}

/// TCP front end driving a [`Server`] at a fixed tick rate.
pub struct NetworkServer<S: Simulation> {
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    server: Server<S>,
    tick_duration: Duration,
    connections: HashMap<u64, Connection>,
    events: Option<mpsc::UnboundedSender<ServerEvent>>,

    // Communication channels
    net_tx: mpsc::UnboundedSender<NetworkMessage>,
    net_rx: mpsc::UnboundedReceiver<NetworkMessage>,
}

impl<S: Simulation> NetworkServer<S> {
    pub async fn bind(addr: &str, server: Server<S>) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let tick_duration = server.config().tick_duration;

        Ok(Self {
            listener: Some(listener),
            local_addr,
            server,
            tick_duration,
            connections: HashMap::new(),
            events: None,
            net_tx,
            net_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> NetworkHandle {
        NetworkHandle {
            tx: self.net_tx.clone(),
        }
    }

    pub fn server(&self) -> &Server<S> {
        &self.server
    }

    /// Forwards every [`ServerEvent`] to the returned receiver instead of
    /// only logging it.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = self
            .listener
            .take()
            .ok_or("network server is already running")?;
        tokio::spawn(accept_loop(listener, self.net_tx.clone()));

        let mut tick_interval = interval(self.tick_duration);
        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.net_rx.recv() => {
                    match message {
                        Some(NetworkMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            self.server.shutdown();
                            self.dispatch_events();
                            break;
                        }
                        Some(message) => self.handle_message(message),
                    }
                },

                _ = tick_interval.tick() => {
                    self.server.on_tick();

                    let frame = self.server.frame();
                    if frame % 1000 == 0 && self.server.session_count() > 0 {
                        debug!(
                            "Frame {}: {} sessions, {} active",
                            frame,
                            self.server.session_count(),
                            self.server.active_session_count()
                        );
                    }
                },
            }

            self.dispatch_events();
        }

        Ok(())
    }

    fn handle_message(&mut self, message: NetworkMessage) {
        match message {
            NetworkMessage::Connected {
                conn,
                address,
                transport,
                cancel,
            } => {
                info!("Connection {} from {}", conn, address);
                let key = self.server.accept(Box::new(transport), address);
                if key.is_some() {
                    self.connections.insert(
                        conn,
                        Connection {
                            key,
                            _cancel: cancel,
                        },
                    );
                }
            }
            NetworkMessage::Data { conn, bytes } => {
                match self.connections.get(&conn).and_then(|c| c.key) {
                    Some(key) => self.server.receive(key, &bytes),
                    None => debug!("Dropping {} bytes from closed connection {}", bytes.len(), conn),
                }
            }
            NetworkMessage::Closed { conn } => {
                if let Some(key) = self.connections.remove(&conn).and_then(|c| c.key) {
                    self.server.on_client_disconnected(key);
                }
            }
            NetworkMessage::Admin(command) => self.handle_admin(command),
            NetworkMessage::Shutdown => {}
        }
    }

    fn handle_admin(&mut self, command: AdminCommand) {
        match command {
            AdminCommand::Kick(id) => {
                if !self.server.kick(id) {
                    warn!("Cannot kick unknown client {}", id);
                }
            }
            AdminCommand::Ban(id) => {
                if !self.server.ban(id) {
                    warn!("Cannot ban unknown client {}", id);
                }
            }
            AdminCommand::RconResult {
                client_id,
                colour,
                text,
            } => self.server.send_rcon_result(client_id, colour, text),
            AdminCommand::ExternalChat {
                source,
                colour,
                user,
                message,
            } => self
                .server
                .send_external_chat(&source, colour, &user, &message),
            AdminCommand::ServerCommand(request) => self.server.on_client_command(request),
            AdminCommand::PushConfigUpdate => self.server.push_config_update(),
            AdminCommand::NewGame => self.server.new_game(),
        }
    }

    /// Logs server events, stops readers of closed sessions and forwards
    /// events to the subscriber.
    fn dispatch_events(&mut self) {
        for event in self.server.take_events() {
            match &event {
                ServerEvent::Joined {
                    client_id,
                    name,
                    address,
                } => info!("Client {} ({}) joined from {}", client_id, name, address),
                ServerEvent::Disconnected {
                    key,
                    address,
                    reason,
                } => {
                    info!("Client {} ({}) disconnected: {}", key.id, address, reason);
                    self.connections.retain(|_, c| c.key != Some(*key));
                }
                ServerEvent::Chat { .. } => {}
                ServerEvent::Rcon { client_id, command } => {
                    if self.events.is_none() {
                        debug!("No console for rcon {:?} from {}", command, client_id);
                        self.server.send_rcon_result(
                            *client_id,
                            crate::server::RCON_COLOUR_ERROR,
                            "No console attached".to_string(),
                        );
                    }
                }
            }

            if let Some(events) = &self.events {
                if events.send(event).is_err() {
                    self.events = None;
                }
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, net_tx: mpsc::UnboundedSender<NetworkMessage>) {
    let mut next_conn: u64 = 0;

    loop {
        match listener.accept().await {
            Ok((stream, address)) => {
                let conn = next_conn;
                next_conn += 1;
                if !spawn_connection(conn, stream, address, &net_tx) {
                    break;
                }
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// Spawns reader and writer tasks for one connection. Returns `false` once
/// the main loop is gone.
fn spawn_connection(
    conn: u64,
    stream: TcpStream,
    address: SocketAddr,
    net_tx: &mpsc::UnboundedSender<NetworkMessage>,
) -> bool {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle for {}: {}", address, e);
    }
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();

    tokio::spawn(write_loop(write_half, out_rx));

    // Connected must be queued before the reader can queue any data.
    let connected = NetworkMessage::Connected {
        conn,
        address,
        transport: out_tx,
        cancel: cancel_tx,
    };
    if net_tx.send(connected).is_err() {
        return false;
    }

    tokio::spawn(read_loop(conn, read_half, cancel_rx, net_tx.clone()));
    true
}

async fn read_loop<R: AsyncRead + Unpin>(
    conn: u64,
    mut reader: R,
    mut cancel: oneshot::Receiver<()>,
    net_tx: mpsc::UnboundedSender<NetworkMessage>,
) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = &mut cancel => return,
            result = reader.read(&mut buffer) => match result {
                Ok(0) => break,
                Ok(len) => {
                    let bytes = buffer[..len].to_vec();
                    if net_tx.send(NetworkMessage::Data { conn, bytes }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!("Read error on connection {}: {}", conn, e);
                    break;
                }
            },
        }
    }

    let _ = net_tx.send(NetworkMessage::Closed { conn });
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Bytes(bytes) => {
                if let Err(e) = writer.write_all(&bytes).await {
                    debug!("Write error: {}", e);
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }

    let _ = writer.shutdown().await;
}
