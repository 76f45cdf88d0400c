//! Server network layer: UDP endpoint and the tasks that drive the session

use crate::config::ServerConfig;
use crate::peer_registry::{new_link_table, LinkTable};
use crate::session::{Inbound, Session};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use shared::{wire, MessageType, SessionEvent};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Capacity of the receive → session channel. The receive task waits for
/// room instead of dropping data it has already acknowledged.
pub const INBOUND_CAPACITY: usize = 1024;

/// Counters shared by all server tasks
#[derive(Debug, Default)]
pub struct ServerStats {
    pub datagrams_received: AtomicU64,
    /// Truncated, foreign, or corrupted datagrams.
    pub transport_drops: AtomicU64,
    pub unknown_peer_drops: AtomicU64,
    /// Unknown message types and malformed payloads.
    pub protocol_drops: AtomicU64,
    pub claims_accepted: AtomicU64,
    pub claims_rejected: AtomicU64,
    pub snapshots_sent: AtomicU64,
    pub window_full_drops: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatsSnapshot {
    pub datagrams_received: u64,
    pub transport_drops: u64,
    pub unknown_peer_drops: u64,
    pub protocol_drops: u64,
    pub claims_accepted: u64,
    pub claims_rejected: u64,
    pub snapshots_sent: u64,
    pub window_full_drops: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ServerStatsSnapshot {
            datagrams_received: get(&self.datagrams_received),
            transport_drops: get(&self.transport_drops),
            unknown_peer_drops: get(&self.unknown_peer_drops),
            protocol_drops: get(&self.protocol_drops),
            claims_accepted: get(&self.claims_accepted),
            claims_rejected: get(&self.claims_rejected),
            snapshots_sent: get(&self.snapshots_sent),
            window_full_drops: get(&self.window_full_drops),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bound but not yet running server
pub struct Server {
    socket: Arc<UdpSocket>,
    config: ServerConfig,
    links: LinkTable,
    stats: Arc<ServerStats>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let config = config.normalized();
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        Ok(Server {
            socket,
            config,
            links: new_link_table(),
            stats: Arc::new(ServerStats::default()),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Starts the receive, retransmission and session tasks.
    ///
    /// Session events are delivered on the returned receiver until the
    /// server shuts down.
    pub fn spawn(self) -> (ServerHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let local_addr = self.socket.local_addr().ok();
        let session = Session::new(
            self.config.clone(),
            Arc::clone(&self.links),
            event_tx,
            Arc::clone(&self.stats),
            Instant::now(),
        );

        let tasks = vec![
            tokio::spawn(receive_loop(
                Arc::clone(&self.socket),
                Arc::clone(&self.links),
                Arc::clone(&self.stats),
                inbound_tx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(retransmit_loop(
                Arc::clone(&self.socket),
                Arc::clone(&self.links),
                self.config.retransmit_interval,
                shutdown_rx.clone(),
            )),
            tokio::spawn(session_loop(
                Arc::clone(&self.socket),
                session,
                inbound_rx,
                self.config.clone(),
                Arc::clone(&self.stats),
                shutdown_rx,
            )),
        ];

        info!("Server started successfully");
        let handle = ServerHandle {
            shutdown: shutdown_tx,
            tasks,
            stats: self.stats,
            local_addr,
        };
        (handle, event_rx)
    }
}

/// Running server
pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    stats: Arc<ServerStats>,
    local_addr: Option<SocketAddr>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> ServerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Signals every task to stop and waits until they have.
    pub async fn shutdown(self) {
        info!("Server shutting down");
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Server task panicked: {}", e);
            }
        }
    }
}

async fn send_all(socket: &UdpSocket, datagrams: Vec<(SocketAddr, Vec<u8>)>) {
    for (addr, bytes) in datagrams {
        if let Err(e) = socket.send_to(&bytes, addr).await {
            error!("Failed to send to {}: {}", addr, e);
        }
    }
}

/// Validates datagrams, runs them through the owning link, acks right away
/// and forwards in-order deliveries to the session task.
async fn receive_loop(
    socket: Arc<UdpSocket>,
    links: LinkTable,
    stats: Arc<ServerStats>,
    inbound: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer = vec![0u8; wire::MAX_DATAGRAM_LEN];

    loop {
        let (len, addr) = tokio::select! {
            _ = shutdown.changed() => break,
            result = socket.recv_from(&mut buffer) => match result {
                Ok(received) => received,
                Err(e) => {
                    error!("Error receiving packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            },
        };
        bump(&stats.datagrams_received);

        let packet = match wire::try_decode(&buffer[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                bump(&stats.transport_drops);
                debug!("Dropping datagram from {}: {}", addr, e);
                continue;
            }
        };

        let link = links.read().get(&addr).cloned();
        let is_join = packet.header.seq == 0 && packet.header.kind() == Ok(MessageType::JoinRequest);

        let forward = match link {
            Some(link) => {
                let (outgoing, delivered) = {
                    let mut link = link.lock();
                    if link.is_restart(&packet.header) {
                        (Vec::new(), Err(packet))
                    } else {
                        let received = link.on_receive(packet, Instant::now());
                        (link.drain_outgoing(), Ok(received.delivered))
                    }
                };
                send_all(&socket, outgoing.into_iter().map(|b| (addr, b)).collect()).await;

                match delivered {
                    Ok(packets) => packets
                        .into_iter()
                        .map(|packet| Inbound::Deliver { addr, packet })
                        .collect(),
                    Err(packet) => vec![Inbound::Connect { addr, packet }],
                }
            }
            None if is_join => vec![Inbound::Connect { addr, packet }],
            None => {
                bump(&stats.unknown_peer_drops);
                debug!("Dropping {:?} from unknown endpoint {}", packet.header.kind(), addr);
                Vec::new()
            }
        };

        for item in forward {
            if inbound.send(item).await.is_err() {
                warn!("Session task is gone, stopping receiver");
                return;
            }
        }
    }
    debug!("Receive task stopped");
}

/// Resends timed-out packets on every link.
async fn retransmit_loop(
    socket: Arc<UdpSocket>,
    links: LinkTable,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let outgoing: Vec<(SocketAddr, Vec<u8>)> = {
            let links = links.read();
            links
                .iter()
                .flat_map(|(addr, link)| {
                    let mut link = link.lock();
                    link.poll_retransmit(now);
                    link.drain_outgoing()
                        .into_iter()
                        .map(|bytes| (*addr, bytes))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        send_all(&socket, outgoing).await;
    }
    debug!("Retransmit task stopped");
}

/// Sole owner of the session: drains deliveries, runs timers and flushes
/// whatever the session queued.
async fn session_loop(
    socket: Arc<UdpSocket>,
    mut session: Session,
    mut inbound: mpsc::Receiver<Inbound>,
    config: ServerConfig,
    stats: Arc<ServerStats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut poll = interval(config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report = interval(config.stats_interval);
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            message = inbound.recv() => match message {
                Some(message) => session.handle(message, Instant::now()),
                None => break,
            },
            _ = poll.tick() => session.poll(Instant::now()),
            _ = report.tick() => {
                debug!(
                    "{:?} with {} peers, snapshot {}: {:?}",
                    session.phase(),
                    session.registry().len(),
                    session.snapshot_id(),
                    stats.snapshot()
                );
            }
        }

        send_all(&socket, session.take_outgoing()).await;
    }
    debug!("Session task stopped");
}
