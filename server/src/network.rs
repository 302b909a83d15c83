//! Server network layer: UDP transport in front of the session manager

use crate::broadcast::{BroadcastGateway, EventSink};
use crate::client_manager::ClientManager;
use crate::manager::{ManagerConfig, SessionManager};
use crate::store::SessionStore;
use crate::text::TextProvider;
use crate::utils::SystemClock;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    ConnectionId, Packet, RaceError, Request, Response, ServerEvent, MAX_PACKET_SIZE,
    PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

const DEPARTURE_ATTEMPTS: u32 = 30;
const DEPARTURE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ClientTimeout {
        client_id: ConnectionId,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages queued for the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    /// Resolved to an address at send time; dropped if the client is gone.
    SendToClient {
        client_id: ConnectionId,
        packet: Packet,
    },
}

impl EventSink for mpsc::UnboundedSender<OutboundMessage> {
    fn deliver(&self, connection: ConnectionId, event: &ServerEvent) -> bool {
        self.send(OutboundMessage::SendToClient {
            client_id: connection,
            packet: Packet::Event(event.clone()),
        })
        .is_ok()
    }
}

/// Work queued on a connection's worker, applied in arrival order
#[derive(Debug)]
enum Job {
    Request { request_id: u32, request: Request },
    /// Leave any race the connection is in, then stop the worker.
    Depart,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: usize,
    /// Silence after which a client is treated as disconnected.
    pub client_timeout: Duration,
    pub manager: ManagerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 256,
            client_timeout: Duration::from_secs(10),
            manager: ManagerConfig::default(),
        }
    }
}

/// Main server coordinating the transport and race sessions
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    sessions: Arc<SessionManager>,
    client_timeout: Duration,
    workers: HashMap<ConnectionId, mpsc::UnboundedSender<Job>>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Server {
    pub async fn new(
        addr: &str,
        config: ServerConfig,
        store: Arc<dyn SessionStore>,
        texts: Arc<dyn TextProvider>,
    ) -> Result<Self, BoxError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let gateway = Arc::new(BroadcastGateway::new(Arc::new(outbound_tx.clone())));
        let sessions = Arc::new(SessionManager::new(
            store,
            gateway,
            texts,
            Arc::new(SystemClock),
            config.manager,
        ));

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            sessions,
            client_timeout: config.client_timeout,
            workers: HashMap::new(),
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut outbound_rx =
            std::mem::replace(&mut self.outbound_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    OutboundMessage::SendToClient { client_id, packet } => {
                        let addr = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addr(client_id)
                        };

                        let Some(addr) = addr else {
                            debug!("Dropping packet for departed client {}", client_id);
                            continue;
                        };
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send to client {}: {}", client_id, e);
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let timeout = self.client_timeout;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts(timeout)
                };

                for client_id in timed_out {
                    info!("Client {} timed out", client_id);
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), BoxError> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self
            .outbound_tx
            .send(OutboundMessage::SendPacket { packet, addr })
        {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    async fn client_for(&self, addr: SocketAddr) -> Option<ConnectionId> {
        let clients = self.clients.read().await;
        clients.find_client_by_addr(addr)
    }

    /// Hands a job to the connection's worker, starting one if needed.
    fn queue(&mut self, client_id: ConnectionId, job: Job) {
        let job = match self.workers.get(&client_id) {
            Some(worker) => match worker.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let worker = spawn_worker(
            Arc::clone(&self.sessions),
            self.outbound_tx.clone(),
            client_id,
        );
        if worker.send(job).is_err() {
            error!("Worker for client {} stopped before its first job", client_id);
            return;
        }
        self.workers.insert(client_id, worker);
    }

    /// Queues the connection's departure behind its pending requests and
    /// forgets its worker.
    fn depart(&mut self, client_id: ConnectionId) {
        self.queue(client_id, Job::Depart);
        self.workers.remove(&client_id);
    }

    /// Processes one incoming packet. Session work is handed to a
    /// per-connection worker, so a slow race never holds up the others while
    /// each client's requests still apply in the order they arrived.
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                info!(
                    "Client connecting from {} (version: {})",
                    addr, client_version
                );

                if client_version != PROTOCOL_VERSION {
                    warn!("Rejecting {}: protocol version {}", addr, client_version);
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Protocol version mismatch".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                // Remove existing connection if present
                if let Some(existing_id) = self.client_for(addr).await {
                    info!("Removing existing client {} from {}", existing_id, addr);
                    {
                        let mut clients = self.clients.write().await;
                        clients.remove_client(&existing_id);
                    }
                    self.depart(existing_id);
                }

                let client_id = {
                    let mut clients = self.clients.write().await;
                    clients.add_client(addr)
                };

                let response = match client_id {
                    Some(client_id) => Packet::Connected { client_id },
                    None => Packet::Disconnected {
                        reason: "Server full".to_string(),
                    },
                };
                self.send_packet(response, addr);
            }

            Packet::Heartbeat { .. } => {
                let touched = {
                    let mut clients = self.clients.write().await;
                    match clients.find_client_by_addr(addr) {
                        Some(client_id) => clients.touch(client_id),
                        None => false,
                    }
                };
                if !touched {
                    debug!("Heartbeat from unknown address {}", addr);
                }
            }

            Packet::Request {
                request_id,
                request,
            } => {
                let Some(client_id) = self.client_for(addr).await else {
                    warn!("Request from unconnected address {}", addr);
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Not connected".to_string(),
                        },
                        addr,
                    );
                    return;
                };
                self.clients.write().await.touch(client_id);
                self.queue(
                    client_id,
                    Job::Request {
                        request_id,
                        request,
                    },
                );
            }

            Packet::Disconnect => {
                if let Some(client_id) = self.client_for(addr).await {
                    {
                        let mut clients = self.clients.write().await;
                        clients.remove_client(&client_id);
                    }
                    self.depart(client_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), BoxError> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        info!("Server started successfully");

        while let Some(message) = self.server_rx.recv().await {
            match message {
                ServerMessage::PacketReceived { packet, addr } => {
                    self.handle_packet(packet, addr).await;
                }
                ServerMessage::ClientTimeout { client_id } => self.depart(client_id),
                ServerMessage::Shutdown => break,
            }
        }

        info!("Server shutting down");
        Ok(())
    }
}

/// Spawns the task that applies one connection's jobs in order. Responses go
/// out through the sender task, addressed by client id.
fn spawn_worker(
    sessions: Arc<SessionManager>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    client_id: ConnectionId,
) -> mpsc::UnboundedSender<Job> {
    let (tx, mut rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                Job::Request {
                    request_id,
                    request,
                } => {
                    let Some(result) = dispatch(&sessions, client_id, request).await else {
                        continue;
                    };
                    let packet = Packet::Response { request_id, result };
                    if let Err(e) = outbound_tx.send(OutboundMessage::SendToClient {
                        client_id,
                        packet,
                    }) {
                        error!("Failed to queue response for client {}: {}", client_id, e);
                    }
                }
                Job::Depart => {
                    depart_with_retry(&sessions, client_id).await;
                    break;
                }
            }
        }
        debug!("Worker for client {} stopped", client_id);
    });

    tx
}

/// Runs a request against the session manager. Progress updates are
/// fire-and-forget and produce no response.
async fn dispatch(
    sessions: &SessionManager,
    client_id: ConnectionId,
    request: Request,
) -> Option<Result<Response, RaceError>> {
    let result = match request {
        Request::CreateRace => sessions
            .create_race(client_id)
            .await
            .map(Response::RaceCreated),
        Request::JoinRace { pin, name } => sessions
            .join_race(&pin, &name, client_id)
            .await
            .map(Response::JoinedRace),
        Request::StartRace { pin } => sessions
            .start_race(&pin, client_id)
            .await
            .map(Response::RaceStarted),
        Request::ProgressUpdate {
            pin,
            progress,
            wpm,
            accuracy,
        } => {
            sessions
                .progress_update(&pin, client_id, progress, wpm, accuracy)
                .await;
            return None;
        }
        Request::FinishRace { pin, wpm, accuracy } => sessions
            .finish_race(&pin, client_id, wpm, accuracy)
            .await
            .map(Response::Leaderboard),
    };

    if let Err(e) = &result {
        debug!("Request from client {} failed: {}", client_id, e);
    }
    Some(result)
}

/// A departure that cannot be committed keeps the race bound to the
/// connection, so it is retried until the store recovers.
async fn depart_with_retry(sessions: &SessionManager, client_id: ConnectionId) {
    for attempt in 1..=DEPARTURE_ATTEMPTS {
        match sessions.handle_disconnect(client_id).await {
            Ok(()) => return,
            Err(e) => {
                warn!(
                    "Departure of client {} failed (attempt {}/{}): {}",
                    client_id, attempt, DEPARTURE_ATTEMPTS, e
                );
                if attempt < DEPARTURE_ATTEMPTS {
                    tokio::time::sleep(DEPARTURE_RETRY_DELAY).await;
                }
            }
        }
    }
    error!("Giving up on departure of client {}", client_id);
}
