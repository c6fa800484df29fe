//! ALB target-group registration strategy.
//!
//! Registers this instance's IP and port with an Elastic Load Balancing
//! v2 target group. The IP is taken from the ECS container metadata
//! endpoint when available, falling back to the local hostname lookup;
//! credentials come from the ambient AWS identity.

use async_trait::async_trait;
use aws_sdk_elasticloadbalancingv2::types::TargetDescription;
use aws_sdk_elasticloadbalancingv2::Client;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::{Result, TrafficError, TrafficStatus, TrafficStrategy};

/// ECS task metadata endpoint environment variable (v4).
const ECS_METADATA_ENV: &str = "ECS_CONTAINER_METADATA_URI_V4";

#[derive(Debug, Clone)]
pub struct AlbConfig {
    pub target_group_arn: String,
    pub port: u16,
    /// Explicit IP override; auto-detected when empty.
    pub ip_address: String,
}

pub struct AlbTargetGroupStrategy {
    client: Client,
    config: AlbConfig,
    ip_address: String,
    registered: AtomicBool,
    last_operation: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
}

impl AlbTargetGroupStrategy {
    pub async fn new(client: Client, config: AlbConfig) -> Result<Self> {
        if config.target_group_arn.is_empty() {
            return Err(TrafficError::Config(
                "target group ARN is required".to_string(),
            ));
        }

        let ip_address = if config.ip_address.is_empty() {
            detect_ip_address().await?
        } else {
            config.ip_address.clone()
        };

        info!(
            target_group = %config.target_group_arn,
            ip = %ip_address,
            port = config.port,
            "ALB traffic strategy initialized"
        );

        Ok(Self {
            client,
            config,
            ip_address,
            registered: AtomicBool::new(false),
            last_operation: RwLock::new(None),
            last_error: RwLock::new(None),
        })
    }

    fn target(&self) -> Result<TargetDescription> {
        Ok(TargetDescription::builder()
            .id(&self.ip_address)
            .port(self.config.port as i32)
            .build())
    }

    fn record(&self, registered: bool, error: Option<String>) {
        self.registered.store(registered, Ordering::SeqCst);
        *self.last_operation.write() = Some(Utc::now());
        *self.last_error.write() = error;
    }
}

#[async_trait]
impl TrafficStrategy for AlbTargetGroupStrategy {
    fn strategy_type(&self) -> &str {
        "ALB_TARGET_GROUP"
    }

    async fn register(&self) -> Result<()> {
        let target = self.target()?;
        let result = self
            .client
            .register_targets()
            .target_group_arn(&self.config.target_group_arn)
            .targets(target)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(
                    target_group = %self.config.target_group_arn,
                    ip = %self.ip_address,
                    port = self.config.port,
                    "Registered with target group"
                );
                self.record(true, None);
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                self.record(false, Some(detail.clone()));
                Err(TrafficError::LoadBalancer(detail))
            }
        }
    }

    async fn deregister(&self) -> Result<()> {
        let target = self.target()?;
        let result = self
            .client
            .deregister_targets()
            .target_group_arn(&self.config.target_group_arn)
            .targets(target)
            .send()
            .await;

        match result {
            Ok(_) => {
                info!(
                    target_group = %self.config.target_group_arn,
                    ip = %self.ip_address,
                    "Deregistered from target group"
                );
                self.record(false, None);
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                *self.last_operation.write() = Some(Utc::now());
                *self.last_error.write() = Some(detail.clone());
                Err(TrafficError::LoadBalancer(detail))
            }
        }
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn status(&self) -> TrafficStatus {
        TrafficStatus {
            enabled: true,
            strategy_type: self.strategy_type().to_string(),
            registered: self.is_registered(),
            target_info: Some(format!(
                "{} -> {}:{}",
                self.config.target_group_arn, self.ip_address, self.config.port
            )),
            last_operation: *self.last_operation.read(),
            last_error: self.last_error.read().clone(),
        }
    }
}

/// Detect this instance's IP: ECS task metadata first, then the local
/// hostname's resolved address.
async fn detect_ip_address() -> Result<String> {
    if let Ok(metadata_uri) = std::env::var(ECS_METADATA_ENV) {
        debug!(uri = %metadata_uri, "Detecting IP from ECS metadata endpoint");
        match fetch_ecs_ip(&metadata_uri).await {
            Ok(ip) => return Ok(ip),
            Err(e) => {
                debug!(error = %e, "ECS metadata lookup failed, falling back to hostname");
            }
        }
    }

    let hostname = hostname_lookup()?;
    Ok(hostname)
}

async fn fetch_ecs_ip(metadata_uri: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .map_err(|e| TrafficError::AddressDetection(e.to_string()))?;

    let task: serde_json::Value = client
        .get(format!("{}/task", metadata_uri))
        .send()
        .await
        .map_err(|e| TrafficError::AddressDetection(e.to_string()))?
        .json()
        .await
        .map_err(|e| TrafficError::AddressDetection(e.to_string()))?;

    task.pointer("/Containers/0/Networks/0/IPv4Addresses/0")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            TrafficError::AddressDetection("no IPv4 address in task metadata".to_string())
        })
}

fn hostname_lookup() -> Result<String> {
    use std::net::ToSocketAddrs;

    let hostname = std::env::var("HOSTNAME")
        .map_err(|_| TrafficError::AddressDetection("HOSTNAME not set".to_string()))?;

    let addr = (hostname.as_str(), 0u16)
        .to_socket_addrs()
        .map_err(|e| TrafficError::AddressDetection(e.to_string()))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| {
            TrafficError::AddressDetection(format!("no IPv4 address for host {}", hostname))
        })?;

    Ok(addr.ip().to_string())
}
