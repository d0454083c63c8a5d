use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use fleet_common::endpoint::{candidate_urls, clean_host, CandidatePlan, PROBE_PATHS};
use fleet_common::error::Result;
use fleet_common::{EndpointDiscoveryResult, FleetError, Instance, InstanceStatus};
use fleet_remote::RemoteService;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub plan: CandidatePlan,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            plan: CandidatePlan::default(),
        }
    }
}

struct CachedEndpoint {
    host: String,
    hints: Vec<u32>,
    result: EndpointDiscoveryResult,
}

/// Finds which candidate `host:port` answers as the generation service.
///
/// Successful results are cached per instance while it stays `running`
/// with the same address metadata.
pub struct EndpointDiscovery {
    remote: Arc<dyn RemoteService>,
    settings: DiscoverySettings,
    cache: Mutex<HashMap<Uuid, CachedEndpoint>>,
}

impl EndpointDiscovery {
    pub fn new(remote: Arc<dyn RemoteService>, settings: DiscoverySettings) -> Self {
        Self {
            remote,
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut HashMap<Uuid, CachedEndpoint>) -> R) -> R {
        let mut guard = match self.cache.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn invalidate(&self, instance_id: Uuid) -> bool {
        let removed = self.with_cache(|c| c.remove(&instance_id).is_some());
        if removed {
            tracing::debug!("discovery: cache invalidated for instance {}", instance_id);
        }
        removed
    }

    pub fn cached(&self, instance_id: Uuid) -> Option<EndpointDiscoveryResult> {
        self.with_cache(|c| c.get(&instance_id).map(|e| e.result.clone()))
    }

    /// Probe the candidates for `instance`. Never mutates the instance.
    ///
    /// Returns a result with `resolved_url = None` when nothing answered;
    /// `Err` only for missing/malformed address metadata.
    pub async fn discover_endpoint(&self, instance: &Instance) -> Result<EndpointDiscoveryResult> {
        let raw_host = instance.host.as_deref().unwrap_or("");
        let host = clean_host(raw_host).ok_or_else(|| {
            FleetError::Configuration(format!(
                "instance {} has no usable host (got '{}')",
                instance.id, raw_host
            ))
        })?;

        let running = instance.status == InstanceStatus::Running;
        if !running {
            self.invalidate(instance.id);
        } else if let Some(hit) = self.with_cache(|c| {
            c.get(&instance.id)
                .filter(|e| e.host == host && e.hints == instance.port_hints)
                .map(|e| e.result.clone())
        }) {
            return Ok(hit);
        }

        let candidates = candidate_urls(&host, &instance.port_hints, &self.settings.plan);
        let attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(url) = self.sweep(&candidates).await {
                let result = EndpointDiscoveryResult {
                    instance_id: instance.id,
                    attempted_urls: candidates.clone(),
                    resolved_url: Some(url.clone()),
                    resolved_at: Utc::now(),
                };
                tracing::info!(
                    "🔎 discovery: instance {} answers at {} (sweep {}/{})",
                    instance.id,
                    url,
                    attempt,
                    attempts
                );
                if running {
                    self.with_cache(|c| {
                        c.insert(
                            instance.id,
                            CachedEndpoint {
                                host: host.clone(),
                                hints: instance.port_hints.clone(),
                                result: result.clone(),
                            },
                        )
                    });
                }
                return Ok(result);
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        tracing::warn!(
            "🔎 discovery: no endpoint for instance {} after {} sweep(s); tried {}",
            instance.id,
            attempts,
            candidates.join(", ")
        );
        Ok(EndpointDiscoveryResult {
            instance_id: instance.id,
            attempted_urls: candidates,
            resolved_url: None,
            resolved_at: Utc::now(),
        })
    }

    /// One pass over every candidate. A transport error skips the remaining
    /// paths of that candidate (nothing listens there).
    async fn sweep(&self, candidates: &[String]) -> Option<String> {
        for base in candidates {
            for path in PROBE_PATHS {
                let url = format!("{}{}", base, path);
                match self.remote.probe(&url).await {
                    Ok(true) => return Some(base.clone()),
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::trace!("discovery: probe {} failed: {}", url, e);
                        break;
                    }
                }
            }
        }
        None
    }

    /// Base URL for `instance`, or `TransientNetwork` listing every attempted URL.
    pub async fn resolve_base_url(&self, instance: &Instance) -> Result<String> {
        let result = self.discover_endpoint(instance).await?;
        match result.resolved_url {
            Some(url) => Ok(url),
            None => Err(FleetError::TransientNetwork(format!(
                "no reachable endpoint; attempted: {}",
                result.attempted_urls.join(", ")
            ))),
        }
    }
}
