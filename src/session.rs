//! Logical sessions: idle/absolute timeout accounting and transaction
//! scaffolding. Transactions track state and an operation log only; no
//! atomicity or isolation is provided.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Quiescence after which an active session is marked idle.
const IDLE_AFTER: Duration = Duration::from_secs(60);

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_ABSOLUTE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Idle,
    TxnInProgress,
    TxnCommitted,
    TxnAborted,
    Expired,
    Ended,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub number: i64,
    pub operations: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub connection_id: u64,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub state: SessionState,
    pub idle_timeout: Duration,
    pub absolute_timeout: Duration,
    pub txn: Option<Transaction>,
}

impl Session {
    fn new(id: Uuid, connection_id: u64, idle: Duration, absolute: Duration) -> Self {
        let now = Instant::now();
        Self {
            id,
            connection_id,
            created_at: now,
            last_activity: now,
            state: SessionState::Active,
            idle_timeout: idle,
            absolute_timeout: absolute,
            txn: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        if self.state == SessionState::Idle {
            self.state = SessionState::Active;
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.state == SessionState::TxnInProgress
    }

    fn expire(&mut self) {
        if self.in_transaction() {
            tracing::warn!(session = %self.id.simple(), "expiring session aborts open transaction");
        }
        self.txn = None;
        self.state = SessionState::Expired;
    }
}

/// Process-wide session table, swept on a fixed cadence.
pub struct SessionManager {
    sessions: Mutex<HashMap<Uuid, Session>>,
    idle_timeout: Duration,
    absolute_timeout: Duration,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration, absolute_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
            absolute_timeout,
        }
    }

    pub async fn start_session(&self, connection_id: u64) -> Uuid {
        let id = Uuid::new_v4();
        let session = Session::new(id, connection_id, self.idle_timeout, self.absolute_timeout);
        self.sessions.lock().await.insert(id, session);
        tracing::debug!(session = %id.simple(), connection_id, "session started");
        id
    }

    pub async fn touch(&self, id: Uuid) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(s) => {
                s.touch();
                true
            }
            None => false,
        }
    }

    pub async fn refresh_sessions(&self, ids: &[Uuid]) -> usize {
        let mut refreshed = 0;
        for id in ids {
            if self.touch(*id).await {
                refreshed += 1;
            }
        }
        refreshed
    }

    pub async fn end_sessions(&self, ids: &[Uuid]) -> usize {
        let mut sessions = self.sessions.lock().await;
        let mut ended = 0;
        for id in ids {
            if let Some(mut s) = sessions.remove(id) {
                if s.in_transaction() {
                    s.txn = None;
                    s.state = SessionState::TxnAborted;
                }
                s.state = SessionState::Ended;
                ended += 1;
            }
        }
        ended
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn get(&self, id: Uuid) -> Option<Session> {
        self.sessions.lock().await.get(&id).cloned()
    }

    pub async fn start_transaction(&self, id: Uuid, number: i64) -> Result<(), String> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&id).ok_or("no such session")?;
        if session.in_transaction() {
            return Err("transaction already in progress".to_string());
        }
        session.txn = Some(Transaction {
            number,
            operations: Vec::new(),
        });
        session.state = SessionState::TxnInProgress;
        session.touch();
        Ok(())
    }

    pub async fn record_operation(&self, id: Uuid, op: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(&id) {
            session.touch();
            if let Some(txn) = &mut session.txn {
                txn.operations.push(op.to_string());
            }
        }
    }

    pub async fn commit_transaction(&self, id: Uuid) -> Result<(), String> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&id).ok_or("no such session")?;
        if !session.in_transaction() {
            return Err("no transaction in progress".to_string());
        }
        session.txn = None;
        session.state = SessionState::TxnCommitted;
        session.touch();
        Ok(())
    }

    pub async fn abort_transaction(&self, id: Uuid) -> Result<(), String> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(&id).ok_or("no such session")?;
        if !session.in_transaction() {
            return Err("no transaction in progress".to_string());
        }
        session.txn = None;
        session.state = SessionState::TxnAborted;
        session.touch();
        Ok(())
    }

    /// One sweeper pass: quiesce active sessions, expire timed-out ones, and
    /// drop the expired. Returns how many expired.
    pub async fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let mut expired = Vec::new();
        for (id, session) in sessions.iter_mut() {
            let since_activity = session.last_activity.elapsed();
            let age = session.created_at.elapsed();
            if age > session.absolute_timeout || since_activity > session.idle_timeout {
                session.expire();
                expired.push(*id);
            } else if session.state == SessionState::Active && since_activity > IDLE_AFTER {
                session.state = SessionState::Idle;
            }
        }
        for id in &expired {
            sessions.remove(id);
            tracing::debug!(session = %id.simple(), "session expired");
        }
        expired.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT, DEFAULT_ABSOLUTE_TIMEOUT)
    }
}

/// Background ticker walking the session table.
pub fn spawn_sweeper(
    manager: Arc<SessionManager>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let n = manager.sweep().await;
                    if n > 0 {
                        tracing::debug!(expired = n, "session sweep");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_touch_end() {
        let mgr = SessionManager::default();
        let id = mgr.start_session(7).await;
        assert_eq!(mgr.session_count().await, 1);
        assert!(mgr.touch(id).await);
        assert_eq!(mgr.get(id).await.unwrap().connection_id, 7);
        assert_eq!(mgr.end_sessions(&[id]).await, 1);
        assert_eq!(mgr.session_count().await, 0);
        assert!(!mgr.touch(id).await);
    }

    #[tokio::test]
    async fn transaction_state_machine() {
        let mgr = SessionManager::default();
        let id = mgr.start_session(1).await;

        assert!(mgr.commit_transaction(id).await.is_err());
        mgr.start_transaction(id, 1).await.unwrap();
        assert!(mgr.start_transaction(id, 2).await.is_err());
        mgr.record_operation(id, "insert").await;
        assert_eq!(
            mgr.get(id).await.unwrap().txn.unwrap().operations,
            vec!["insert"]
        );
        mgr.commit_transaction(id).await.unwrap();
        assert_eq!(mgr.get(id).await.unwrap().state, SessionState::TxnCommitted);

        mgr.start_transaction(id, 2).await.unwrap();
        mgr.abort_transaction(id).await.unwrap();
        assert_eq!(mgr.get(id).await.unwrap().state, SessionState::TxnAborted);
    }

    #[tokio::test]
    async fn sweep_expires_past_timeouts() {
        let mgr = SessionManager::new(Duration::from_millis(10), Duration::from_secs(3600));
        let id = mgr.start_session(1).await;
        mgr.start_transaction(id, 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mgr.sweep().await, 1);
        assert_eq!(mgr.session_count().await, 0);
    }

    #[tokio::test]
    async fn sweep_keeps_fresh_sessions() {
        let mgr = SessionManager::default();
        let _id = mgr.start_session(1).await;
        assert_eq!(mgr.sweep().await, 0);
        assert_eq!(mgr.session_count().await, 1);
    }
}
