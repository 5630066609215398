//! Real-time position fan-out
//!
//! [`FanOutHub`] owns the connection registry. Each socket gets a bounded
//! outbound channel and the hub only ever `try_send`s into it, so a slow
//! client never stalls a broadcast. A connection whose channel is closed or
//! full counts as a failed send and is removed on the spot.

pub mod protocol;
pub mod socket;

use chrono::Utc;
use fleet_common::events::{EventBus, FleetEvent};
use fleet_common::DevicePosition;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::positions::latest_positions_for_user;
use crate::session::SessionGateway;
use protocol::{ClientMessage, ServerFrame, ServerMessage};

pub use socket::serve_socket;

/// Interval of the idle-connection sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Frames a connection may have queued before it is dropped
pub const CLIENT_BUFFER: usize = 256;

struct ClientConnection {
    user_id: Option<String>,
    /// Empty means every device
    vehicle_filter: HashSet<String>,
    last_ping: Instant,
    sender: mpsc::Sender<ServerFrame>,
}

impl ClientConnection {
    fn wants(&self, device_id: &str) -> bool {
        self.vehicle_filter.is_empty() || self.vehicle_filter.contains(device_id)
    }
}

/// Read-only view of one connection
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub user_id: Option<String>,
    pub vehicle_filter: Vec<String>,
}

pub struct FanOutHub {
    clients: RwLock<HashMap<Uuid, ClientConnection>>,
    sessions: Arc<dyn SessionGateway>,
    pool: SqlitePool,
    ping_timeout: Duration,
}

impl FanOutHub {
    pub fn new(sessions: Arc<dyn SessionGateway>, pool: SqlitePool, ping_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            sessions,
            pool,
            ping_timeout,
        }
    }

    /// Add a connection and greet it with `connection_established`
    pub async fn register(&self) -> (Uuid, mpsc::Receiver<ServerFrame>) {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(CLIENT_BUFFER);
        let _ = sender.try_send(ServerMessage::ConnectionEstablished { connection_id: id }.into());

        let mut clients = self.clients.write().await;
        clients.insert(
            id,
            ClientConnection {
                user_id: None,
                vehicle_filter: HashSet::new(),
                last_ping: Instant::now(),
                sender,
            },
        );
        debug!(connection_id = %id, total = clients.len(), "Client connected");
        (id, receiver)
    }

    pub async fn unregister(&self, id: Uuid) {
        if self.clients.write().await.remove(&id).is_some() {
            debug!(connection_id = %id, "Client disconnected");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn connection_info(&self, id: Uuid) -> Option<ConnectionInfo> {
        let clients = self.clients.read().await;
        clients.get(&id).map(|client| {
            let mut vehicle_filter: Vec<String> = client.vehicle_filter.iter().cloned().collect();
            vehicle_filter.sort();
            ConnectionInfo {
                connection_id: id,
                user_id: client.user_id.clone(),
                vehicle_filter,
            }
        })
    }

    /// Parse and dispatch one text frame from a client
    pub async fn handle_text(&self, id: Uuid, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle_message(id, message).await,
            Err(e) => {
                debug!(connection_id = %id, "Unparseable client frame: {}", e);
                self.send(id, ServerMessage::error("INVALID_MESSAGE", e.to_string()))
                    .await;
            }
        }
    }

    pub async fn handle_message(&self, id: Uuid, message: ClientMessage) {
        match message {
            ClientMessage::Authenticate { token } => self.authenticate(id, &token).await,
            ClientMessage::SubscribeVehicles { vehicle_ids } => self.subscribe(id, vehicle_ids).await,
            ClientMessage::Ping => self.ping(id).await,
            ClientMessage::RequestPositionUpdate => self.send_snapshot(id).await,
        }
    }

    /// Bind a user to the connection
    ///
    /// A rejected token leaves the connection open and unauthenticated.
    pub async fn authenticate(&self, id: Uuid, token: &str) {
        let user_id = match self.sessions.resolve_client_token(token).await {
            Ok(Some(user_id)) => user_id,
            Ok(None) => {
                self.send(id, ServerMessage::AuthError {
                    message: "invalid or expired token".to_string(),
                })
                .await;
                return;
            }
            Err(e) => {
                self.send(id, ServerMessage::AuthError {
                    message: e.to_string(),
                })
                .await;
                return;
            }
        };

        let bound = {
            let mut clients = self.clients.write().await;
            match clients.get_mut(&id) {
                Some(client) => {
                    client.user_id = Some(user_id.clone());
                    true
                }
                None => false,
            }
        };

        if bound {
            info!(connection_id = %id, user_id = %user_id, "Client authenticated");
            self.send(id, ServerMessage::Authenticated { user_id }).await;
        }
    }

    /// Replace the connection's vehicle filter
    pub async fn subscribe(&self, id: Uuid, vehicle_ids: Vec<String>) {
        let filter: HashSet<String> = vehicle_ids
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();

        let updated = {
            let mut clients = self.clients.write().await;
            clients.get_mut(&id).map(|client| {
                client.vehicle_filter = filter;
                let mut ids: Vec<String> = client.vehicle_filter.iter().cloned().collect();
                ids.sort();
                ids
            })
        };

        if let Some(vehicle_ids) = updated {
            debug!(connection_id = %id, vehicles = vehicle_ids.len(), "Subscription updated");
            self.send(id, ServerMessage::SubscriptionUpdated { vehicle_ids }).await;
        }
    }

    pub async fn ping(&self, id: Uuid) {
        let known = {
            let mut clients = self.clients.write().await;
            match clients.get_mut(&id) {
                Some(client) => {
                    client.last_ping = Instant::now();
                    true
                }
                None => false,
            }
        };
        if known {
            self.send(id, ServerMessage::Pong).await;
        }
    }

    /// Latest position per device for the connection's user and filter
    pub async fn send_snapshot(&self, id: Uuid) {
        let scope = {
            let clients = self.clients.read().await;
            clients.get(&id).map(|client| {
                (
                    client.user_id.clone(),
                    client.vehicle_filter.iter().cloned().collect::<Vec<_>>(),
                )
            })
        };

        let Some((user_id, filter)) = scope else {
            return;
        };
        let Some(user_id) = user_id else {
            self.send(
                id,
                ServerMessage::error("AUTH_REQUIRED", "authenticate before requesting positions"),
            )
            .await;
            return;
        };

        match latest_positions_for_user(&self.pool, &user_id, &filter).await {
            Ok(positions) => {
                self.send(id, ServerMessage::PositionUpdate { positions }).await;
            }
            Err(e) => {
                warn!(connection_id = %id, "Position snapshot query failed: {}", e);
                self.send(id, ServerMessage::error("SNAPSHOT_FAILED", "could not load positions"))
                    .await;
            }
        }
    }

    /// Push a persisted position to every interested connection
    ///
    /// Returns how many connections received it. Connections whose channel
    /// is gone or full are dropped from the registry.
    pub async fn broadcast_position_update(&self, position: &DevicePosition) -> usize {
        let frame = ServerFrame::from(ServerMessage::LivePositionUpdate {
            position: position.clone(),
        });

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, client) in clients.iter() {
                if !client.wants(&position.device_id) {
                    continue;
                }
                if client.sender.try_send(frame.clone()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.write().await;
            for id in &dead {
                clients.remove(id);
                warn!(connection_id = %id, "Dropped client after failed send");
            }
        }
        delivered
    }

    /// Remove connections whose last ping is older than the timeout
    pub async fn sweep_idle(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let mut clients = self.clients.write().await;
        let idle: Vec<Uuid> = clients
            .iter()
            .filter(|(_, client)| now.saturating_duration_since(client.last_ping) > self.ping_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            // Dropping the sender ends the socket's writer task
            clients.remove(id);
            info!(connection_id = %id, "Evicted idle client");
        }
        idle
    }

    async fn send(&self, id: Uuid, message: ServerMessage) {
        let failed = {
            let clients = self.clients.read().await;
            match clients.get(&id) {
                Some(client) => client.sender.try_send(message.into()).is_err(),
                None => false,
            }
        };
        if failed {
            self.unregister(id).await;
        }
    }

    /// Forward persisted positions from the event bus to clients
    pub async fn run_event_listener(self: Arc<Self>, event_bus: EventBus, cancel: CancellationToken) {
        let mut rx = event_bus.subscribe();
        info!("Fan-out hub listening for persisted positions");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(FleetEvent::PositionsPersisted { positions, .. }) => {
                        for position in &positions {
                            self.broadcast_position_update(position).await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Fan-out hub lagged behind the event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Periodic idle sweep
    pub async fn run_sweep(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = self.sweep_idle().await;
                    if !evicted.is_empty() {
                        debug!(evicted = evicted.len(), at = %Utc::now(), "Idle sweep finished");
                    }
                }
            }
        }
    }
}
