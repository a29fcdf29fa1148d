//! Connection registry: who is connected to the relay, and in what role.
//!
//! Connections enter a role map only after announcing themselves (`register`
//! or `register-browser`). Both maps sit behind their own `RwLock`, so every
//! insert and delete is atomic per entry; inbound HTTP handlers only read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};

use super::envelope::Envelope;

/// Length of relay-assigned connection ids.
const CONN_ID_LEN: usize = 9;

/// Short random id for a new connection (e.g. `k3j9x0a1b`).
pub fn new_connection_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(CONN_ID_LEN);
    id
}

/// A registered connection (agent or status observer).
pub struct Connection {
    pub id: String,
    /// Outbound envelopes, drained by the connection's writer task.
    pub tx: mpsc::Sender<Envelope>,
    /// Registration order; the lowest live value is the active agent.
    pub seq: u64,
    pub connected_since: Instant,
    /// Last heartbeat as ms since the registry epoch (lock-free).
    pub last_seen_ms: Arc<AtomicU64>,
    /// Tells the connection's read loop to stop.
    pub shutdown: Arc<watch::Sender<bool>>,
}

/// Cheap handle to the agent chosen for a request.
#[derive(Clone)]
pub struct AgentHandle {
    pub id: String,
    pub tx: mpsc::Sender<Envelope>,
    pub connected_since: Instant,
}

/// Role a removed connection held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Observer,
}

/// Agents and observers currently connected to the relay.
#[derive(Clone)]
pub struct Registry {
    agents: Arc<RwLock<HashMap<String, Connection>>>,
    observers: Arc<RwLock<HashMap<String, Connection>>>,
    next_seq: Arc<AtomicU64>,
    epoch: Instant,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            observers: Arc::new(RwLock::new(HashMap::new())),
            next_seq: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn build(
        &self,
        id: &str,
        tx: mpsc::Sender<Envelope>,
        shutdown: Arc<watch::Sender<bool>>,
    ) -> Connection {
        Connection {
            id: id.to_string(),
            tx,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            connected_since: Instant::now(),
            last_seen_ms: Arc::new(AtomicU64::new(self.now_ms())),
            shutdown,
        }
    }

    /// Record `id` as an agent. Re-registering keeps the original position.
    pub async fn register_agent(
        &self,
        id: &str,
        tx: mpsc::Sender<Envelope>,
        shutdown: Arc<watch::Sender<bool>>,
    ) {
        let mut agents = self.agents.write().await;
        if agents.contains_key(id) {
            warn!(conn_id = %id, "Agent registered twice on the same connection");
            return;
        }
        let conn = self.build(id, tx, shutdown);
        agents.insert(id.to_string(), conn);
        info!(conn_id = %id, agents = agents.len(), "Agent registered");
    }

    /// Record `id` as a status observer.
    pub async fn register_observer(
        &self,
        id: &str,
        tx: mpsc::Sender<Envelope>,
        shutdown: Arc<watch::Sender<bool>>,
    ) {
        let conn = self.build(id, tx, shutdown);
        let mut observers = self.observers.write().await;
        observers.insert(id.to_string(), conn);
        info!(conn_id = %id, observers = observers.len(), "Observer registered");
    }

    /// Drop `id` from both maps. Returns the roles it held.
    pub async fn remove(&self, id: &str) -> Vec<Role> {
        let mut roles = Vec::new();
        if self.agents.write().await.remove(id).is_some() {
            roles.push(Role::Agent);
        }
        if self.observers.write().await.remove(id).is_some() {
            roles.push(Role::Observer);
        }
        roles
    }

    /// The earliest-registered agent whose writer is still open.
    pub async fn active_agent(&self) -> Option<AgentHandle> {
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|c| !c.tx.is_closed())
            .min_by_key(|c| c.seq)
            .map(|c| AgentHandle {
                id: c.id.clone(),
                tx: c.tx.clone(),
                connected_since: c.connected_since,
            })
    }

    pub async fn has_agent(&self) -> bool {
        self.agents.read().await.values().any(|c| !c.tx.is_closed())
    }

    /// Refresh the liveness timestamp of an agent.
    pub async fn touch(&self, id: &str) {
        if let Some(conn) = self.agents.read().await.get(id) {
            conn.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
        }
    }

    /// `(agents, observers)` counts.
    pub async fn counts(&self) -> (usize, usize) {
        let agents = self.agents.read().await.len();
        let observers = self.observers.read().await.len();
        (agents, observers)
    }

    /// Forward an envelope to every registered connection except `from`.
    /// Returns how many connections accepted it.
    pub async fn broadcast_except(&self, from: &str, envelope: &Envelope) -> usize {
        let mut delivered = 0;
        for map in [&self.agents, &self.observers] {
            let conns = map.read().await;
            for conn in conns.values().filter(|c| c.id != from) {
                if conn.tx.try_send(envelope.clone()).is_ok() {
                    delivered += 1;
                } else {
                    warn!(
                        conn_id = %conn.id,
                        "Dropped forwarded envelope (backpressure or closed)"
                    );
                }
            }
        }
        delivered
    }

    /// Evict agents silent for longer than `timeout_secs` and close their
    /// connections. Returns the evicted ids.
    ///
    /// Single write-lock pass with atomic timestamp reads, so a heartbeat that
    /// lands mid-sweep is either seen or the agent survives to the next pass.
    pub async fn sweep_dead_agents(&self, timeout_secs: u64) -> Vec<String> {
        let timeout_ms = timeout_secs * 1000;
        let now_ms = self.now_ms();
        let mut agents = self.agents.write().await;
        let dead: Vec<String> = agents
            .values()
            .filter(|c| now_ms.saturating_sub(c.last_seen_ms.load(Ordering::Relaxed)) > timeout_ms)
            .map(|c| c.id.clone())
            .collect();
        for id in &dead {
            if let Some(conn) = agents.remove(id) {
                let _ = conn.shutdown.send(true);
                warn!(conn_id = %id, "Evicted agent (heartbeat timeout)");
            }
        }
        dead
    }

    /// Close every connection and clear both maps (relay shutdown).
    pub async fn close_all(&self) {
        for map in [&self.agents, &self.observers] {
            let mut conns = map.write().await;
            for conn in conns.values() {
                let _ = conn.shutdown.send(true);
            }
            conns.clear();
        }
    }
}
