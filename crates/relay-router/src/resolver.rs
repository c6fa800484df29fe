//! Config resolver: loads the routing topology and keeps it fresh.
//!
//! The topology (pools + queues) comes from either the local config
//! file or a remote control-plane endpoint. Remote fetches use bounded
//! retries; refreshes hash the definition set so unchanged topologies
//! are not re-applied.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::DispatchEngine;
use crate::error::RouterError;
use crate::warning::WarningStore;
use crate::Result;
use relay_common::{
    PoolConfig, QueueConfig, QueueKind, RouterTopology, WarningCategory, WarningSeverity,
};

/// Where the topology comes from.
#[derive(Debug, Clone)]
pub enum TopologySource {
    /// Definitions from the local config file.
    Local(RouterTopology),
    /// Remote control-plane endpoint.
    Remote {
        url: String,
        max_attempts: u32,
        retry_delay: Duration,
    },
}

/// Remote payload, camelCase like the rest of the wire formats.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteTopology {
    #[serde(default)]
    processing_pools: Vec<RemotePool>,
    #[serde(default)]
    queues: Vec<RemoteQueue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemotePool {
    code: String,
    concurrency: u32,
    #[serde(default)]
    rate_limit_per_minute: Option<u32>,
    #[serde(default = "default_remote_capacity")]
    queue_capacity: u32,
}

fn default_remote_capacity() -> u32 {
    100
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteQueue {
    #[serde(alias = "queueName")]
    queue_name: Option<String>,
    #[serde(alias = "queueUri")]
    queue_uri: String,
    #[serde(default)]
    kind: Option<QueueKind>,
    #[serde(default)]
    visibility_timeout: Option<u32>,
    #[serde(default)]
    wait_time_seconds: Option<u32>,
    #[serde(default)]
    max_messages: Option<u32>,
}

impl From<RemoteTopology> for RouterTopology {
    fn from(remote: RemoteTopology) -> Self {
        RouterTopology {
            pools: remote
                .processing_pools
                .into_iter()
                .map(|p| PoolConfig {
                    code: p.code,
                    concurrency: p.concurrency,
                    rate_limit_per_minute: p.rate_limit_per_minute,
                    queue_capacity: p.queue_capacity,
                })
                .collect(),
            queues: remote
                .queues
                .into_iter()
                .map(|q| QueueConfig {
                    name: q.queue_name.unwrap_or_else(|| q.queue_uri.clone()),
                    uri: q.queue_uri,
                    kind: q.kind.unwrap_or(QueueKind::Sqs),
                    visibility_timeout: q.visibility_timeout.unwrap_or(120),
                    wait_time_seconds: q.wait_time_seconds.unwrap_or(5),
                    max_messages: q.max_messages.unwrap_or(10),
                })
                .collect(),
        }
    }
}

pub struct ConfigResolver {
    source: TopologySource,
    http: reqwest::Client,
    engine: Arc<DispatchEngine>,
    warnings: Arc<WarningStore>,
    refresh_interval: Duration,
    last_hash: parking_lot::Mutex<Option<u64>>,
}

impl ConfigResolver {
    pub fn new(
        source: TopologySource,
        engine: Arc<DispatchEngine>,
        warnings: Arc<WarningStore>,
        refresh_interval: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            source,
            http,
            engine,
            warnings,
            refresh_interval,
            last_hash: parking_lot::Mutex::new(None),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.source, TopologySource::Remote { .. })
    }

    /// Fetch and apply the initial topology. Fails fast: the router
    /// cannot start without definitions.
    pub async fn initial(&self) -> Result<RouterTopology> {
        let topology = self.fetch().await?;

        if topology.pools.is_empty() {
            return Err(RouterError::Config(
                "topology defines no pools".to_string(),
            ));
        }

        Arc::clone(&self.engine).apply_topology(topology.clone()).await?;
        *self.last_hash.lock() = Some(topology_hash(&topology));

        info!(
            pools = topology.pools.len(),
            queues = topology.queues.len(),
            "Initial topology applied"
        );

        Ok(topology)
    }

    /// Refresh: fetch, compare, apply when changed.
    pub async fn refresh(&self) -> Result<bool> {
        let topology = match self.fetch().await {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "Topology refresh fetch failed, keeping current definitions");
                self.warnings.add(
                    WarningCategory::Configuration,
                    WarningSeverity::Error,
                    format!("Topology refresh failed: {}", e),
                    "ConfigResolver".to_string(),
                );
                return Err(e);
            }
        };

        let new_hash = topology_hash(&topology);
        let changed = {
            let last = self.last_hash.lock();
            Some(new_hash) != *last
        };

        if !changed {
            debug!("Topology unchanged, skipping reload");
            return Ok(false);
        }

        info!(
            pools = topology.pools.len(),
            queues = topology.queues.len(),
            "Topology changed, applying"
        );

        if Arc::clone(&self.engine).apply_topology(topology).await? {
            *self.last_hash.lock() = Some(new_hash);
        }

        Ok(true)
    }

    async fn fetch(&self) -> Result<RouterTopology> {
        match &self.source {
            TopologySource::Local(topology) => Ok(topology.clone()),
            TopologySource::Remote {
                url,
                max_attempts,
                retry_delay,
            } => {
                let mut last_error = String::new();

                for attempt in 1..=*max_attempts {
                    match self.fetch_remote(url).await {
                        Ok(topology) => {
                            if attempt > 1 {
                                info!(attempt = attempt, "Topology fetched after retries");
                            }
                            return Ok(topology);
                        }
                        Err(e) => {
                            last_error = e.to_string();
                            if attempt < *max_attempts {
                                warn!(
                                    attempt = attempt,
                                    max_attempts = max_attempts,
                                    error = %last_error,
                                    "Topology fetch failed, retrying"
                                );
                                tokio::time::sleep(*retry_delay).await;
                            }
                        }
                    }
                }

                error!(
                    attempts = max_attempts,
                    error = %last_error,
                    "Topology fetch failed after all attempts"
                );
                Err(RouterError::TopologySource(last_error))
            }
        }
    }

    async fn fetch_remote(&self, url: &str) -> Result<RouterTopology> {
        let response = self.http.get(url).send().await?;

        if !response.status().is_success() {
            return Err(RouterError::TopologySource(format!(
                "topology endpoint returned {}",
                response.status()
            )));
        }

        let remote: RemoteTopology = response.json().await?;
        Ok(remote.into())
    }
}

/// Stable hash of the definition set for change detection.
fn topology_hash(topology: &RouterTopology) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();

    for pool in &topology.pools {
        pool.code.hash(&mut hasher);
        pool.concurrency.hash(&mut hasher);
        pool.rate_limit_per_minute.hash(&mut hasher);
        pool.queue_capacity.hash(&mut hasher);
    }
    for queue in &topology.queues {
        queue.name.hash(&mut hasher);
        queue.uri.hash(&mut hasher);
        queue.visibility_timeout.hash(&mut hasher);
        queue.wait_time_seconds.hash(&mut hasher);
        queue.max_messages.hash(&mut hasher);
    }

    hasher.finish()
}

/// Spawn the periodic refresh task.
pub fn spawn_refresh_task(
    resolver: Arc<ConfigResolver>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let interval = resolver.refresh_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // initial apply already happened

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = resolver.refresh().await {
                        warn!(error = %e, "Scheduled topology refresh failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Topology refresh task shutting down");
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_payload_parses() {
        let json = r#"{
            "processingPools": [
                {"code": "P1", "concurrency": 4, "rateLimitPerMinute": 120},
                {"code": "P2", "concurrency": 2, "queueCapacity": 50}
            ],
            "queues": [
                {"queueName": "events.fifo", "queueUri": "https://sqs.test/events.fifo"}
            ]
        }"#;

        let remote: RemoteTopology = serde_json::from_str(json).unwrap();
        let topology: RouterTopology = remote.into();

        assert_eq!(topology.pools.len(), 2);
        assert_eq!(topology.pools[0].rate_limit_per_minute, Some(120));
        assert_eq!(topology.pools[0].queue_capacity, 100);
        assert_eq!(topology.pools[1].queue_capacity, 50);
        assert_eq!(topology.queues[0].name, "events.fifo");
        assert_eq!(topology.queues[0].kind, QueueKind::Sqs);
    }

    #[test]
    fn hash_detects_changes() {
        let base = RouterTopology {
            pools: vec![PoolConfig {
                code: "P1".to_string(),
                concurrency: 4,
                rate_limit_per_minute: None,
                queue_capacity: 100,
            }],
            queues: vec![],
        };

        let mut changed = base.clone();
        changed.pools[0].concurrency = 8;

        assert_eq!(topology_hash(&base), topology_hash(&base));
        assert_ne!(topology_hash(&base), topology_hash(&changed));
    }
}
