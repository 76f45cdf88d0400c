//! Client transport: one ARQ link to the server, driven by a single task.

use crate::game::{ClientSession, ClientStatus};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use shared::arq::DEFAULT_WINDOW_SIZE;
use shared::grid::{DEFAULT_COLS, DEFAULT_ROWS};
use shared::payload::ClaimRequest;
use shared::{wire, ArqLink, LinkStats, Message, MessageType, SendOutcome, SessionEvent};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// How long `leave` waits for the LEAVE to be acknowledged.
const LEAVE_LINGER: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_addr: String,
    pub rows: usize,
    pub cols: usize,
    pub window_size: u32,
    pub retransmit_interval: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{}", shared::DEFAULT_PORT),
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            window_size: DEFAULT_WINDOW_SIZE,
            retransmit_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
enum Command {
    Claim {
        row: u8,
        col: u8,
        reply: oneshot::Sender<SendOutcome>,
    },
    Rejoin {
        reply: oneshot::Sender<SendOutcome>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<LinkStats>,
    },
}

pub struct Client;

impl Client {
    /// Binds an ephemeral socket, sends JOIN_REQUEST and starts the client
    /// task. Session events arrive on the returned receiver.
    pub async fn connect(
        config: ClientConfig,
    ) -> Result<(ClientHandle, mpsc::UnboundedReceiver<SessionEvent>), Box<dyn std::error::Error>>
    {
        let server_addr: std::net::SocketAddr = config.server_addr.parse()?;
        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(server_addr).await?;
        info!("Connecting to {} from {}", server_addr, socket.local_addr()?);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = ClientSession::new(config.rows, config.cols);
        let (status_tx, status_rx) = watch::channel(session.status());

        let mut worker = Worker {
            link: ArqLink::new(config.window_size, Instant::now()),
            socket,
            session,
            events: event_tx,
            status: status_tx,
            config,
        };
        worker.join(Instant::now());
        worker.flush().await;

        let task = tokio::spawn(worker.run(command_rx));
        Ok((
            ClientHandle {
                commands: command_tx,
                status: status_rx,
                task,
            },
            event_rx,
        ))
    }
}

/// Handle used by input and presentation code
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ClientStatus>,
    task: JoinHandle<()>,
}

impl ClientHandle {
    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    /// Originates a CLAIM_REQUEST for the local player.
    ///
    /// Returns [`SendOutcome::Rejected`] without sending when the player has
    /// not joined, the match is not running, or the cell is off the grid.
    pub async fn submit_claim(&self, row: u8, col: u8) -> SendOutcome {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Claim { row, col, reply }).is_err() {
            return SendOutcome::Closed;
        }
        rx.await.unwrap_or(SendOutcome::Closed)
    }

    /// Starts over on a fresh link and joins again.
    pub async fn rejoin(&self) -> SendOutcome {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Rejoin { reply }).is_err() {
            return SendOutcome::Closed;
        }
        rx.await.unwrap_or(SendOutcome::Closed)
    }

    pub async fn link_stats(&self) -> Option<LinkStats> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Stats { reply }).ok()?;
        rx.await.ok()
    }

    /// Sends LEAVE, waits briefly for its ack and stops the task.
    pub async fn leave(self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Leave { reply }).is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = self.task.await {
            error!("Client task panicked: {}", e);
        }
    }
}

struct Worker {
    link: ArqLink,
    socket: UdpSocket,
    session: ClientSession,
    events: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Sender<ClientStatus>,
    config: ClientConfig,
}

impl Worker {
    fn join(&mut self, now: Instant) -> SendOutcome {
        self.link.send(MessageType::JoinRequest, &[], now)
    }

    fn claim(&mut self, row: u8, col: u8, now: Instant) -> SendOutcome {
        if !self.session.can_claim(row, col) {
            debug!("Not sending claim ({}, {}) in {:?}", row, col, self.session.phase());
            return SendOutcome::Rejected;
        }

        let claim = Message::ClaimRequest(ClaimRequest {
            row,
            col,
            ack_hint: self.link.piggyback_ack() as u16,
        });
        let outcome = self.link.send(claim.kind(), &claim.to_payload(), now);
        if outcome == SendOutcome::WindowFull {
            debug!("Window full, claim ({}, {}) dropped", row, col);
        }
        outcome
    }

    fn rejoin(&mut self, now: Instant) -> SendOutcome {
        info!("Rejoining with a fresh link");
        self.link.close();
        self.link = ArqLink::new(self.config.window_size, now);
        self.session.reset();
        self.publish_status();
        self.join(now)
    }

    fn on_datagram(&mut self, bytes: &[u8], now: Instant) {
        let packet = match wire::try_decode(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping datagram from server: {}", e);
                return;
            }
        };

        let received = self.link.on_receive(packet, now);
        for packet in received.delivered {
            match Message::parse(packet.header.msg_type, &packet.payload) {
                Ok(message) => {
                    for event in self.session.apply(message) {
                        let _ = self.events.send(event);
                    }
                }
                Err(e) => warn!("Dropping packet from server: {}", e),
            }
        }
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = self.session.status();
        if *self.status.borrow() != status {
            let _ = self.status.send(status);
        }
    }

    async fn flush(&mut self) {
        for bytes in self.link.drain_outgoing() {
            if let Err(e) = self.socket.send(&bytes).await {
                error!("Failed to send to server: {}", e);
            }
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut retransmit = interval(self.config.retransmit_interval);
        retransmit.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut buffer = vec![0u8; wire::MAX_DATAGRAM_LEN];
        let mut leaving: Option<(Instant, oneshot::Sender<()>)> = None;

        loop {
            tokio::select! {
                result = self.socket.recv(&mut buffer) => match result {
                    Ok(len) => self.on_datagram(&buffer[..len], Instant::now()),
                    Err(e) => {
                        // ICMP unreachable surfaces here while the server is down.
                        debug!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = retransmit.tick() => {
                    self.link.poll_retransmit(Instant::now());
                }
                _ = heartbeat.tick() => self.link.send_heartbeat(),
                command = commands.recv(), if leaving.is_none() => match command {
                    Some(Command::Claim { row, col, reply }) => {
                        let _ = reply.send(self.claim(row, col, Instant::now()));
                    }
                    Some(Command::Rejoin { reply }) => {
                        let _ = reply.send(self.rejoin(Instant::now()));
                    }
                    Some(Command::Stats { reply }) => {
                        let _ = reply.send(self.link.stats());
                    }
                    Some(Command::Leave { reply }) => {
                        info!("Leaving");
                        self.link.send(MessageType::Leave, &[], Instant::now());
                        leaving = Some((Instant::now() + LEAVE_LINGER, reply));
                    }
                    None => {
                        self.link.send(MessageType::Leave, &[], Instant::now());
                        self.flush().await;
                        break;
                    }
                },
            }

            self.flush().await;

            let done = leaving.as_ref().map_or(false, |(deadline, _)| {
                self.link.in_flight() == 0 || Instant::now() >= *deadline
            });
            if done {
                if let Some((_, reply)) = leaving.take() {
                    let _ = reply.send(());
                }
                break;
            }
        }

        self.link.close();
        debug!("Client task stopped");
    }
}
