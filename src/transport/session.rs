//! Session registry
//!
//! Tracks per-peer state: address, traffic counters, activity. Sessions
//! are created on handshake, refreshed by any traffic or an explicit
//! keepalive, and torn down on CLOSE or after the idle timeout (30 s by
//! default). The registry owns the records; callers get clones of the
//! snapshot, never references into the map.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info};

/// Default idle expiry
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-peer session record
#[derive(Debug, Clone)]
pub struct Session {
    /// Wire identifier, unique per registry
    pub session_id: u32,
    /// Peer address
    pub remote_addr: SocketAddr,
    /// Creation time
    pub created_at: Instant,
    /// Most recent traffic or keepalive
    pub last_activity: Instant,
    /// Bytes sent toward the peer
    pub bytes_sent: u64,
    /// Bytes received from the peer
    pub bytes_received: u64,
    /// Next sequence number the peer should see
    pub next_expected_seq: u32,
    /// Smoothed round-trip time toward this peer, milliseconds
    pub srtt_ms: f64,
    /// RTT variance, milliseconds
    pub rttvar_ms: f64,
    /// Loss-event rate toward this peer
    pub loss_rate: f64,
    /// Estimated available bandwidth, bits per second
    pub bandwidth_bps: u64,
}

/// Why a session left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent CLOSE or the engine shut down
    Explicit,
    /// No traffic within the idle timeout
    IdleTimeout,
}

/// Registry of live sessions, engine-owned
///
/// The mutex guards a plain map; no lock is ever held across an await.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u32, Session>>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    /// Create an empty registry with the given idle timeout
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    /// Live session count
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no sessions are live
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Open a session toward `remote_addr` with a fresh random id
    pub fn create(&self, remote_addr: SocketAddr, now: Instant) -> Session {
        let mut sessions = self.sessions.lock();
        let mut rng = rand::thread_rng();
        let session_id = loop {
            let candidate: u32 = rng.gen();
            if candidate != 0 && !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        let session = Session {
            session_id,
            remote_addr,
            created_at: now,
            last_activity: now,
            bytes_sent: 0,
            bytes_received: 0,
            next_expected_seq: 0,
            srtt_ms: 0.0,
            rttvar_ms: 0.0,
            loss_rate: 0.0,
            bandwidth_bps: 0,
        };
        sessions.insert(session_id, session.clone());
        info!(session_id, %remote_addr, "session created");
        session
    }

    /// Snapshot one session
    pub fn get(&self, session_id: u32) -> Option<Session> {
        self.sessions.lock().get(&session_id).cloned()
    }

    /// Refresh activity (any traffic or keepalive)
    pub fn touch(&self, session_id: u32, now: Instant) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&session_id) {
            Some(session) => {
                session.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Account bytes sent on a session and refresh activity
    pub fn record_sent(&self, session_id: u32, bytes: usize, seq: u32, now: Instant) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(&session_id) {
            session.bytes_sent += bytes as u64;
            session.next_expected_seq = seq.wrapping_add(1);
            session.last_activity = now;
        }
    }

    /// Account bytes received on a session and refresh activity
    pub fn record_received(&self, session_id: u32, bytes: usize, now: Instant) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(&session_id) {
            session.bytes_received += bytes as u64;
            session.last_activity = now;
        }
    }

    /// Mirror the congestion controller's estimates into a session record
    pub fn update_estimates(
        &self,
        session_id: u32,
        srtt_ms: f64,
        rttvar_ms: f64,
        loss_rate: f64,
        bandwidth_bps: u64,
    ) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(&session_id) {
            session.srtt_ms = srtt_ms;
            session.rttvar_ms = rttvar_ms;
            session.loss_rate = loss_rate;
            session.bandwidth_bps = bandwidth_bps;
        }
    }

    /// Remove a session explicitly
    pub fn close(&self, session_id: u32) -> Option<Session> {
        let removed = self.sessions.lock().remove(&session_id);
        if let Some(ref session) = removed {
            info!(session_id = session.session_id, "session closed");
        }
        removed
    }

    /// Expire sessions idle past the timeout
    ///
    /// Returns the expired records so the caller can emit status
    /// callbacks and free per-session resources.
    pub fn sweep_idle(&self, now: Instant) -> Vec<Session> {
        let mut sessions = self.sessions.lock();
        let expired: Vec<u32> = sessions
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_activity) > self.idle_timeout)
            .map(|(&id, _)| id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| {
                let session = sessions.remove(&id);
                if let Some(ref s) = session {
                    debug!(
                        session_id = s.session_id,
                        idle_for = ?now.duration_since(s.last_activity),
                        "session expired idle"
                    );
                }
                session
            })
            .collect()
    }
}
