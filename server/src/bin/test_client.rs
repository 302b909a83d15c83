//! Scripted race participant for exercising a running server by hand.
//!
//! Start a host with `test_client --create`, note the printed pin, then run
//! one or more racers with `test_client --pin <pin> --name Bob`.

use bincode::{deserialize, serialize};
use clap::Parser;
use log::{info, warn};
use server::network::BoxError;
use server::utils::get_timestamp;
use shared::{
    Packet, Pin, RaceError, Request, Response, ServerEvent, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep, timeout};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Create a race and start it after the lobby delay
    #[arg(long)]
    create: bool,

    /// Race to join
    #[arg(long)]
    pin: Option<Pin>,

    /// Display name when joining
    #[arg(short, long, default_value = "Racer")]
    name: String,

    /// Seconds the host waits in the lobby before starting
    #[arg(long, default_value = "10")]
    lobby_secs: u64,

    /// Simulated typing speed reported to the server
    #[arg(long, default_value = "60")]
    wpm: f64,

    /// Delay between progress updates in milliseconds
    #[arg(long, default_value = "250")]
    step_ms: u64,
}

struct RaceClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
    next_request_id: u32,
}

impl RaceClient {
    async fn connect(server_addr: &str) -> Result<Self, BoxError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let mut client = RaceClient {
            socket,
            server_addr: server_addr.parse()?,
            next_request_id: 1,
        };

        client
            .send(&Packet::Connect {
                client_version: PROTOCOL_VERSION,
            })
            .await?;
        match client.recv(Duration::from_secs(5)).await? {
            Packet::Connected { client_id } => info!("Connected as client {}", client_id),
            Packet::Disconnected { reason } => return Err(reason.into()),
            other => return Err(format!("unexpected handshake reply: {:?}", other).into()),
        }
        Ok(client)
    }

    async fn send(&self, packet: &Packet) -> Result<(), BoxError> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn recv(&self, wait: Duration) -> Result<Packet, BoxError> {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (len, _) = timeout(wait, self.socket.recv_from(&mut buf)).await??;
        Ok(deserialize(&buf[..len])?)
    }

    async fn heartbeat(&self) -> Result<(), BoxError> {
        self.send(&Packet::Heartbeat {
            timestamp: get_timestamp(),
        })
        .await
    }

    /// Sends a request and waits for its response, printing any events that
    /// arrive in between.
    async fn request(
        &mut self,
        request: Request,
    ) -> Result<Result<Response, RaceError>, BoxError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.send(&Packet::Request {
            request_id,
            request,
        })
        .await?;

        loop {
            match self.recv(Duration::from_secs(5)).await? {
                Packet::Response {
                    request_id: id,
                    result,
                } if id == request_id => return Ok(result),
                Packet::Event(event) => print_event(&event),
                Packet::Disconnected { reason } => return Err(reason.into()),
                other => warn!("Ignoring {:?}", other),
            }
        }
    }

    /// Prints events until `done` accepts one, keeping the connection alive.
    async fn watch<F>(&self, mut done: F) -> Result<ServerEvent, BoxError>
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = heartbeat.tick() => self.heartbeat().await?,
                packet = self.recv(Duration::from_secs(60)) => match packet? {
                    Packet::Event(event) => {
                        print_event(&event);
                        if done(&event) {
                            return Ok(event);
                        }
                    }
                    Packet::Disconnected { reason } => return Err(reason.into()),
                    _ => {}
                },
            }
        }
    }
}

fn print_event(event: &ServerEvent) {
    match event {
        ServerEvent::PlayerJoined { player, players, .. } => {
            println!("{} joined ({} in lobby)", player.name, players.len())
        }
        ServerEvent::RaceStarted(started) => println!("Race started: \"{}\"", started.text),
        ServerEvent::ProgressBroadcast { players, .. } => {
            for p in players {
                println!("  {:<12} {:>5.1}% {:>5.1} wpm", p.name, p.progress * 100.0, p.wpm);
            }
        }
        ServerEvent::LeaderboardUpdate(board) | ServerEvent::RaceFinished(board) => {
            println!("Leaderboard ({}):", event.name());
            for (rank, p) in board.leaderboard.iter().enumerate() {
                println!(
                    "  {}. {} {:.1} wpm in {} ms",
                    rank + 1,
                    p.name,
                    p.wpm,
                    p.finish_time_ms.unwrap_or_default()
                );
            }
        }
        ServerEvent::PlayerLeft { player_id, .. } => println!("Player {} left", player_id),
        ServerEvent::RaceClosed { pin } => println!("Race {} closed", pin),
        other => println!("{}", other.name()),
    }
}

async fn host(client: &mut RaceClient, args: &Args) -> Result<(), BoxError> {
    let pin = match client.request(Request::CreateRace).await? {
        Ok(Response::RaceCreated(created)) => created.pin,
        other => return Err(format!("create failed: {:?}", other).into()),
    };
    println!("Race pin: {}", pin);

    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    for _ in 0..(args.lobby_secs / HEARTBEAT_INTERVAL.as_secs()).max(1) {
        heartbeat.tick().await;
        client.heartbeat().await?;
    }

    match client.request(Request::StartRace { pin }).await? {
        Ok(_) => {}
        Err(e) => return Err(format!("start failed: {}", e).into()),
    }

    client
        .watch(|event| matches!(event, ServerEvent::RaceFinished(_)))
        .await?;
    Ok(())
}

async fn race(client: &mut RaceClient, pin: Pin, args: &Args) -> Result<(), BoxError> {
    match client
        .request(Request::JoinRace {
            pin: pin.clone(),
            name: args.name.clone(),
        })
        .await?
    {
        Ok(Response::JoinedRace(joined)) => {
            println!("Joined race {} as {}", joined.pin, joined.player.name)
        }
        other => return Err(format!("join failed: {:?}", other).into()),
    }

    client
        .watch(|event| matches!(event, ServerEvent::RaceStarted(_)))
        .await?;

    for step in 1..=10 {
        sleep(Duration::from_millis(args.step_ms)).await;
        client
            .send(&Packet::Request {
                request_id: 0,
                request: Request::ProgressUpdate {
                    pin: pin.clone(),
                    progress: step as f64 / 10.0,
                    wpm: args.wpm,
                    accuracy: 98.0,
                },
            })
            .await?;
    }

    match client
        .request(Request::FinishRace {
            pin,
            wpm: args.wpm,
            accuracy: 98.0,
        })
        .await?
    {
        Ok(_) => println!("Finished"),
        Err(e) => warn!("Finish rejected: {}", e),
    }

    client
        .watch(|event| {
            matches!(
                event,
                ServerEvent::RaceFinished(_) | ServerEvent::RaceClosed { .. }
            )
        })
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();
    let args = Args::parse();

    let mut client = RaceClient::connect(&args.server).await?;

    let result = match (args.create, args.pin.clone()) {
        (true, _) => host(&mut client, &args).await,
        (false, Some(pin)) => race(&mut client, pin, &args).await,
        (false, None) => Err("pass --create or --pin <pin>".into()),
    };

    client.send(&Packet::Disconnect).await?;
    result
}
