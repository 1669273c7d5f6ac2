//! Provider health monitoring.
//!
//! A background loop probes each configured provider on a fixed interval
//! and stores the result in a per-provider atomic flag, so the scheduler's
//! `is_available` query is a lock-free load. Providers without a probe
//! target are assumed available.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{MonitorConfig, ProbeTarget};

struct MonitorInner {
    status: HashMap<String, AtomicBool>,
    targets: Vec<ProbeTarget>,
    client: reqwest::Client,
    probe_timeout: Duration,
    probe_interval: Duration,
}

/// Tracks which external providers are currently reachable.
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
}

impl ResourceMonitor {
    pub fn new(client: reqwest::Client, config: &MonitorConfig) -> Self {
        // Flags start optimistic so nothing stalls before the first probe.
        let status = config
            .targets
            .iter()
            .map(|t| (t.provider_id.clone(), AtomicBool::new(true)))
            .collect();

        Self {
            inner: Arc::new(MonitorInner {
                status,
                targets: config.targets.clone(),
                client,
                probe_timeout: Duration::from_millis(config.probe_timeout_ms),
                probe_interval: Duration::from_millis(config.probe_interval_ms),
            }),
        }
    }

    /// Whether a provider is currently believed reachable. O(1) and
    /// lock-free; providers with no probe target report available.
    pub fn is_available(&self, provider_id: &str) -> bool {
        self.inner
            .status
            .get(provider_id)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(true)
    }

    /// Override a provider's availability. Used by adapters that learn of
    /// an outage out-of-band, and by tests.
    pub fn set_available(&self, provider_id: &str, available: bool) {
        if let Some(flag) = self.inner.status.get(provider_id) {
            flag.store(available, Ordering::Relaxed);
        }
    }

    /// Probe every configured target once and update the flags.
    pub async fn probe_all(&self) {
        for target in &self.inner.targets {
            let available = self.probe(target).await;
            if let Some(flag) = self.inner.status.get(&target.provider_id) {
                let previous = flag.swap(available, Ordering::Relaxed);
                if previous != available {
                    tracing::info!(
                        provider = %target.provider_id,
                        available,
                        "provider availability changed"
                    );
                }
            }
        }
    }

    async fn probe(&self, target: &ProbeTarget) -> bool {
        if let Some(url) = &target.health_url {
            let request = self
                .inner
                .client
                .get(url)
                .timeout(self.inner.probe_timeout)
                .send();
            return match request.await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    tracing::debug!(provider = %target.provider_id, error = %e, "health probe failed");
                    false
                }
            };
        }
        if let Some(var) = &target.credential_env {
            return std::env::var(var).is_ok_and(|v| !v.is_empty());
        }
        true
    }

    /// Spawn the periodic probe loop. Runs until `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.inner.probe_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => monitor.probe_all().await,
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
