//! Redis lock-based election.
//!
//! Acquisition is `SET key instance_id NX EX ttl`; renewal and release
//! are Lua compare-scripts so only the holder can extend or delete. A
//! PRIMARY that finds the lock gone (or held by someone else) flips to
//! STANDBY and terminates the process: another instance has already
//! taken over, and a restart is the cleanest way back into the pool.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, StandbyError};

/// Election tick period. Intentionally hardcoded: the TTL is the
/// configurable knob, and renewal must stay well inside it.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Delay before fail-stop exit so the final log lines flush.
const FAIL_STOP_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ElectionConfig {
    pub redis_url: String,
    pub lock_key: String,
    pub lock_ttl_seconds: u64,
    pub instance_id: String,
    /// Terminate the process when an established PRIMARY loses the
    /// lock unexpectedly (fail-stop). Disabled in tests.
    pub fail_stop_on_loss: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "relay:router:primary".to_string(),
            lock_ttl_seconds: 30,
            instance_id: Uuid::new_v4().to_string(),
            fail_stop_on_loss: true,
        }
    }
}

impl ElectionConfig {
    pub fn new(redis_url: String) -> Self {
        Self {
            redis_url,
            ..Default::default()
        }
    }

    pub fn with_lock_key(mut self, key: String) -> Self {
        self.lock_key = key;
        self
    }

    pub fn with_instance_id(mut self, id: String) -> Self {
        self.instance_id = id;
        self
    }

    pub fn with_lock_ttl(mut self, seconds: u64) -> Self {
        self.lock_ttl_seconds = seconds;
        self
    }

    pub fn without_fail_stop(mut self) -> Self {
        self.fail_stop_on_loss = false;
        self
    }
}

/// Election role of this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Primary,
    Standby,
    /// Election has not resolved: startup, or Redis unreachable.
    Unknown,
}

/// Observable snapshot of the election state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockState {
    pub role: Role,
    pub last_refresh: Option<DateTime<Utc>>,
    pub lock_holder: Option<String>,
    pub redis_available: bool,
}

pub struct Election {
    config: ElectionConfig,
    conn: ConnectionManager,
    role_tx: watch::Sender<Role>,
    role_rx: watch::Receiver<Role>,
    last_refresh: parking_lot::RwLock<Option<DateTime<Utc>>>,
    lock_holder: parking_lot::RwLock<Option<String>>,
    redis_available: AtomicBool,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Election {
    pub async fn new(config: ElectionConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| StandbyError::Connection(e.to_string()))?;

        let conn = ConnectionManager::new(client).await?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let (role_tx, role_rx) = watch::channel(Role::Unknown);

        Ok(Self {
            config,
            conn,
            role_tx,
            role_rx,
            last_refresh: parking_lot::RwLock::new(None),
            lock_holder: parking_lot::RwLock::new(None),
            redis_available: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn role(&self) -> Role {
        *self.role_rx.borrow()
    }

    pub fn is_primary(&self) -> bool {
        self.role() == Role::Primary
    }

    pub fn redis_available(&self) -> bool {
        self.redis_available.load(Ordering::SeqCst)
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Subscribe to role changes. Consumed by the dispatch engine gate
    /// and the traffic registrar.
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.role_rx.clone()
    }

    pub fn state(&self) -> LockState {
        LockState {
            role: self.role(),
            last_refresh: *self.last_refresh.read(),
            lock_holder: self.lock_holder.read().clone(),
            redis_available: self.redis_available(),
        }
    }

    /// Start the election: one immediate tick, then the periodic task.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StandbyError::AlreadyRunning);
        }

        info!(
            instance_id = %self.config.instance_id,
            lock_key = %self.config.lock_key,
            ttl_seconds = self.config.lock_ttl_seconds,
            "Starting leader election"
        );

        // Resolve the initial role before returning so callers can gate
        // processing on it immediately.
        self.tick().await;

        let election = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            interval.tick().await; // initial tick already ran

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        election.tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!(instance_id = %election.config.instance_id, "Leader election shutting down");
                        election.release().await;
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// One election tick: renew when PRIMARY, try-acquire otherwise.
    async fn tick(&self) {
        let mut conn = self.conn.clone();

        if self.is_primary() {
            match self.extend_lock(&mut conn).await {
                Ok(true) => {
                    self.redis_available.store(true, Ordering::SeqCst);
                    *self.last_refresh.write() = Some(Utc::now());
                    debug!(instance_id = %self.config.instance_id, "Extended primary lease");
                }
                Ok(false) => {
                    // Another instance holds the lock: we were PRIMARY
                    // and lost it. Fail-stop so the orchestrator
                    // restarts this instance clean.
                    self.redis_available.store(true, Ordering::SeqCst);
                    self.observe_holder(&mut conn).await;
                    warn!(
                        instance_id = %self.config.instance_id,
                        holder = ?*self.lock_holder.read(),
                        "Lost primary lock unexpectedly"
                    );
                    self.set_role(Role::Standby);
                    if self.config.fail_stop_on_loss {
                        error!(
                            instance_id = %self.config.instance_id,
                            "Terminating after primary lock loss"
                        );
                        tokio::spawn(async {
                            tokio::time::sleep(FAIL_STOP_DELAY).await;
                            std::process::exit(1);
                        });
                    }
                }
                Err(e) => {
                    error!(error = %e, "Redis unavailable while renewing primary lease");
                    self.redis_available.store(false, Ordering::SeqCst);
                    // Processing must stop: the lock will expire and
                    // another instance may take over.
                    self.set_role(Role::Unknown);
                }
            }
        } else {
            match self.try_acquire(&mut conn).await {
                Ok(true) => {
                    self.redis_available.store(true, Ordering::SeqCst);
                    *self.last_refresh.write() = Some(Utc::now());
                    *self.lock_holder.write() = Some(self.config.instance_id.clone());
                    info!(instance_id = %self.config.instance_id, "Acquired primary lock");
                    self.set_role(Role::Primary);
                }
                Ok(false) => {
                    self.redis_available.store(true, Ordering::SeqCst);
                    self.observe_holder(&mut conn).await;
                    debug!(
                        instance_id = %self.config.instance_id,
                        holder = ?*self.lock_holder.read(),
                        "Primary lock held elsewhere"
                    );
                    self.set_role(Role::Standby);
                }
                Err(e) => {
                    error!(error = %e, "Redis unavailable during election");
                    self.redis_available.store(false, Ordering::SeqCst);
                    self.set_role(Role::Unknown);
                }
            }
        }
    }

    async fn try_acquire(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let result: Option<String> = redis::cmd("SET")
            .arg(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.lock_ttl_seconds)
            .query_async(conn)
            .await?;

        Ok(result.is_some())
    }

    /// Atomic extend-if-mine.
    async fn extend_lock(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                redis.call("EXPIRE", KEYS[1], ARGV[2])
                return 1
            else
                return 0
            end
        "#;

        let result: i32 = redis::Script::new(script)
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg(self.config.lock_ttl_seconds)
            .invoke_async(conn)
            .await?;

        Ok(result == 1)
    }

    /// Record the observed lock holder for monitoring.
    async fn observe_holder(&self, conn: &mut ConnectionManager) {
        let holder: std::result::Result<Option<String>, _> = redis::cmd("GET")
            .arg(&self.config.lock_key)
            .query_async(conn)
            .await;

        if let Ok(holder) = holder {
            *self.lock_holder.write() = holder;
        }
    }

    /// Release the lock eagerly so a standby can take over within one
    /// cycle instead of waiting for TTL expiry.
    async fn release(&self) {
        if !self.is_primary() {
            self.set_role(Role::Standby);
            return;
        }

        let mut conn = self.conn.clone();

        let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                redis.call("DEL", KEYS[1])
                return 1
            else
                return 0
            end
        "#;

        match redis::Script::new(script)
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .invoke_async::<i32>(&mut conn)
            .await
        {
            Ok(1) => {
                info!(instance_id = %self.config.instance_id, "Released primary lock");
            }
            Ok(_) => {
                debug!(instance_id = %self.config.instance_id, "Primary lock was already gone");
            }
            Err(e) => {
                error!(error = %e, "Failed to release primary lock");
            }
        }

        self.set_role(Role::Standby);
    }

    fn set_role(&self, role: Role) {
        let previous = *self.role_rx.borrow();
        if previous != role {
            info!(
                instance_id = %self.config.instance_id,
                from = ?previous,
                to = ?role,
                "Election role changed"
            );
        }
        let _ = self.role_tx.send(role);
    }

    pub async fn shutdown(&self) {
        info!(instance_id = %self.config.instance_id, "Stopping leader election");
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ElectionConfig::default();
        assert_eq!(config.lock_ttl_seconds, 30);
        assert_eq!(config.lock_key, "relay:router:primary");
        assert!(config.fail_stop_on_loss);
        assert_eq!(REFRESH_INTERVAL, Duration::from_secs(10));
    }

    #[test]
    fn config_builder() {
        let config = ElectionConfig::new("redis://localhost:6380".to_string())
            .with_lock_key("custom:lock".to_string())
            .with_instance_id("router-a".to_string())
            .with_lock_ttl(15)
            .without_fail_stop();

        assert_eq!(config.redis_url, "redis://localhost:6380");
        assert_eq!(config.lock_key, "custom:lock");
        assert_eq!(config.instance_id, "router-a");
        assert_eq!(config.lock_ttl_seconds, 15);
        assert!(!config.fail_stop_on_loss);
    }

    #[test]
    fn role_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Role::Primary).unwrap(), "\"PRIMARY\"");
        assert_eq!(serde_json::to_string(&Role::Standby).unwrap(), "\"STANDBY\"");
        assert_eq!(serde_json::to_string(&Role::Unknown).unwrap(), "\"UNKNOWN\"");
    }
}
