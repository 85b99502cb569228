//! Per-engine health tracking, the dynamic engine-weight formula, and the
//! Closed → Open → Half-Open circuit breaker that keeps a misbehaving
//! search engine from being selected. State is cached in memory for the
//! hot path and mirrored to the store on every transition so health
//! survives a restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;

use crate::config::Config;
use crate::store::Store;
use crate::types::{CircuitState, DomainBudget, EngineHealth, PolicyError};

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

pub struct PolicyEngine {
    store: Arc<dyn Store>,
    config: Config,
    circuit_config: CircuitBreakerConfig,
    health: DashMap<String, EngineHealth>,
    half_open_calls: DashMap<String, u32>,
    last_mile_calls: DashMap<String, (NaiveDate, u32)>,
}

impl PolicyEngine {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        Self {
            store,
            config,
            circuit_config: CircuitBreakerConfig::default(),
            health: DashMap::new(),
            half_open_calls: DashMap::new(),
            last_mile_calls: DashMap::new(),
        }
    }

    pub fn with_circuit_config(mut self, circuit_config: CircuitBreakerConfig) -> Self {
        self.circuit_config = circuit_config;
        self
    }

    async fn health_for(&self, engine: &str) -> Result<EngineHealth, PolicyError> {
        if let Some(h) = self.health.get(engine) {
            return Ok(h.clone());
        }
        let loaded = self
            .store
            .get_engine_health(engine)
            .await
            .map_err(|e| PolicyError::UnknownEngine(format!("{engine}: {e}")))?
            .unwrap_or_else(|| EngineHealth {
                engine: engine.to_string(),
                ..EngineHealth::default()
            });
        self.health.insert(engine.to_string(), loaded.clone());
        Ok(loaded)
    }

    async fn persist(&self, health: &EngineHealth) -> Result<(), PolicyError> {
        self.store
            .record_engine_result(health)
            .await
            .map_err(|e| PolicyError::UnknownEngine(e.to_string()))
    }

    /// Circuit-breaker gate. Open transitions to HalfOpen once the cooldown
    /// elapses; HalfOpen admits a bounded number of probe calls.
    pub async fn check_engine_available(&self, engine: &str) -> Result<(), PolicyError> {
        let mut h = self.health_for(engine).await?;
        match h.circuit_state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let cooldown_until = h.cooldown_until.unwrap_or_else(Utc::now);
                if Utc::now() >= cooldown_until {
                    h.circuit_state = CircuitState::HalfOpen;
                    self.half_open_calls.insert(engine.to_string(), 1);
                    tracing::info!(engine, "circuit transitioning to half-open");
                    self.health.insert(engine.to_string(), h.clone());
                    self.persist(&h).await?;
                    Ok(())
                } else {
                    let remaining_s = (cooldown_until - Utc::now()).num_seconds().max(0) as u64;
                    Err(PolicyError::CircuitOpen {
                        engine: engine.to_string(),
                        remaining_s,
                    })
                }
            }
            CircuitState::HalfOpen => {
                let mut calls = self.half_open_calls.entry(engine.to_string()).or_insert(0);
                if *calls < self.circuit_config.half_open_max_calls {
                    *calls += 1;
                    Ok(())
                } else {
                    Err(PolicyError::CircuitOpen {
                        engine: engine.to_string(),
                        remaining_s: 0,
                    })
                }
            }
        }
    }

    /// Updates success/captcha/latency rates and drives the circuit breaker
    /// transitions. `success` reflects whether the request completed
    /// without a transport or engine-side error (a CAPTCHA challenge with
    /// no other failure still counts as a success here; it is tracked
    /// separately via `captcha_rate`).
    pub async fn record_engine_result(&self, engine: &str, success: bool, latency_ms: f64, captcha: bool) -> Result<(), PolicyError> {
        let mut h = self.health_for(engine).await?;

        const EWMA_ALPHA: f64 = 0.2;
        let sample = if success { 1.0 } else { 0.0 };
        h.success_rate_1h = EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * h.success_rate_1h;
        h.success_rate_24h = (EWMA_ALPHA / 12.0) * sample + (1.0 - EWMA_ALPHA / 12.0) * h.success_rate_24h;
        h.captcha_rate = EWMA_ALPHA * (captcha as u8 as f64) + (1.0 - EWMA_ALPHA) * h.captcha_rate;
        h.median_latency_ms = 0.5 * latency_ms + 0.5 * h.median_latency_ms;
        h.last_used_at = Some(Utc::now());

        match h.circuit_state {
            CircuitState::Closed => {
                if success {
                    h.consecutive_failures = 0;
                } else {
                    h.consecutive_failures += 1;
                    if h.consecutive_failures >= self.circuit_config.failure_threshold {
                        h.circuit_state = CircuitState::Open;
                        h.cooldown_until = Some(Utc::now() + chrono::Duration::from_std(self.circuit_config.recovery_timeout).unwrap());
                        tracing::warn!(engine, failures = h.consecutive_failures, "circuit tripped open");
                    }
                }
            }
            CircuitState::HalfOpen => {
                if success {
                    h.circuit_state = CircuitState::Closed;
                    h.consecutive_failures = 0;
                    self.half_open_calls.remove(engine);
                    tracing::info!(engine, "circuit recovered, now closed");
                } else {
                    h.circuit_state = CircuitState::Open;
                    h.cooldown_until = Some(Utc::now() + chrono::Duration::from_std(self.circuit_config.recovery_timeout).unwrap());
                    self.half_open_calls.remove(engine);
                    tracing::warn!(engine, "circuit recovery failed, back to open");
                }
            }
            CircuitState::Open => {
                if !success {
                    h.consecutive_failures += 1;
                }
            }
        }

        self.health.insert(engine.to_string(), h.clone());
        self.persist(&h).await
    }

    /// `success_factor = 0.6·r1h + 0.4·r24h`; `captcha_penalty = 1 − 0.5·captcha_rate`;
    /// `latency_factor = 1/(1+median_latency_ms/1000)`; blended against the
    /// static `base_weight` with confidence decaying over 48h of disuse.
    pub fn dynamic_engine_weight(base_weight: f64, health: &EngineHealth) -> f64 {
        let success_factor = 0.6 * health.success_rate_1h + 0.4 * health.success_rate_24h;
        let captcha_penalty = 1.0 - 0.5 * health.captcha_rate;
        let latency_factor = 1.0 / (1.0 + health.median_latency_ms / 1000.0);
        let raw = base_weight * success_factor * captcha_penalty * latency_factor;

        let hours_since_use = health
            .last_used_at
            .map(|t| (Utc::now() - t).num_seconds() as f64 / 3600.0)
            .unwrap_or(48.0);
        let confidence = (1.0 - hours_since_use / 48.0).max(0.1);

        (confidence * raw + (1.0 - confidence) * base_weight).clamp(0.1, 1.0)
    }

    pub async fn can_request_to_domain(&self, domain: &str) -> Result<(), PolicyError> {
        let cfg = self
            .config
            .domain(domain)
            .ok_or_else(|| PolicyError::UnknownDomain(domain.to_string()))?;
        let budget = self
            .store
            .get_domain_budget(domain)
            .await
            .map_err(|e| PolicyError::UnknownDomain(e.to_string()))?
            .unwrap_or(DomainBudget {
                domain: domain.to_string(),
                date: Utc::now().date_naive(),
                requests_today: 0,
                pages_today: 0,
                max_requests_per_day: cfg.max_requests_per_day,
                max_pages_per_day: cfg.max_pages_per_day,
            });
        if budget.requests_today >= cfg.max_requests_per_day || budget.pages_today >= cfg.max_pages_per_day {
            return Err(PolicyError::NoEngineAvailable(format!("daily budget exhausted for {domain}")));
        }
        Ok(())
    }

    pub fn can_use_tor(&self, domain: &str) -> bool {
        let ratio = self.config.domain(domain).map(|d| d.tor_usage_ratio).unwrap_or(0.0);
        ratio > 0.0 && ratio <= self.config.tor.max_usage_ratio
    }

    /// Picks the highest-weighted engine among those configured for
    /// `category` whose circuit is not open, ties broken by lower
    /// `median_latency_ms`.
    pub async fn select_engine(&self, category: &str) -> Result<String, PolicyError> {
        let candidates: Vec<_> = self
            .config
            .engines
            .iter()
            .filter(|e| e.categories.iter().any(|c| c == category))
            .collect();
        if candidates.is_empty() {
            return Err(PolicyError::NoEngineAvailable(category.to_string()));
        }

        let mut best: Option<(String, f64, f64)> = None;
        for engine_cfg in candidates {
            if self.check_engine_available(&engine_cfg.name).await.is_err() {
                continue;
            }
            let health = self.health_for(&engine_cfg.name).await?;
            let weight = Self::dynamic_engine_weight(engine_cfg.weight, &health);
            let latency = health.median_latency_ms;
            let replace = match &best {
                None => true,
                Some((_, best_weight, best_latency)) => Self::beats((weight, latency), (*best_weight, *best_latency)),
            };
            if replace {
                best = Some((engine_cfg.name.clone(), weight, latency));
            }
        }

        best.map(|(name, _, _)| name).ok_or_else(|| PolicyError::NoEngineAvailable(category.to_string()))
    }

    /// True when `(weight, latency)` should replace `best` as the selected
    /// engine: strictly higher weight wins outright, a tied weight falls
    /// back to lower `median_latency_ms`.
    fn beats(candidate: (f64, f64), best: (f64, f64)) -> bool {
        let (weight, latency) = candidate;
        let (best_weight, best_latency) = best;
        weight > best_weight || (weight == best_weight && latency < best_latency)
    }

    /// The "final 10%" engine set (§4.2): once a task's harvest rate has
    /// reached 0.9, only engines marked `last_mile` for `category` are
    /// offered, each gated by its own daily counter (separate from the
    /// general candidate path's circuit-only gate) so the last-mile engines
    /// stay strictly rate-limited regardless of how much budget remains
    /// elsewhere. Returns an empty set below the threshold.
    pub fn last_mile_engines(&self, category: &str, harvest_rate: f64) -> Vec<String> {
        if harvest_rate < 0.9 {
            return Vec::new();
        }
        self.config
            .engines
            .iter()
            .filter(|e| e.last_mile && e.categories.iter().any(|c| c == category))
            .filter(|e| !matches!(self.health.get(&e.name).map(|h| h.circuit_state), Some(CircuitState::Open)))
            .filter(|e| self.last_mile_slot_available(&e.name, e.daily_limit))
            .map(|e| e.name.clone())
            .collect()
    }

    fn last_mile_slot_available(&self, engine: &str, daily_limit: u32) -> bool {
        let today = Utc::now().date_naive();
        let mut entry = self.last_mile_calls.entry(engine.to_string()).or_insert((today, 0));
        if entry.0 != today {
            *entry = (today, 0);
        }
        entry.1 < daily_limit
    }

    /// Records a last-mile fetch against the engine's daily counter.
    pub fn record_last_mile_use(&self, engine: &str) {
        let today = Utc::now().date_naive();
        let mut entry = self.last_mile_calls.entry(engine.to_string()).or_insert((today, 0));
        if entry.0 != today {
            *entry = (today, 0);
        }
        entry.1 += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainConfig, EngineConfig, PaginationType};
    use crate::store::SqliteStore;
    use crate::types::DomainCategory;
    use std::collections::HashMap;

    fn engine_cfg(name: &str, weight: f64, category: &str) -> EngineConfig {
        EngineConfig {
            name: name.to_string(),
            qps: 1.0,
            weight,
            categories: vec![category.to_string()],
            daily_limit: 1000,
            concurrency: 2,
            pagination_type: PaginationType::Offset,
            operator_mapping: HashMap::new(),
            last_mile: false,
        }
    }

    fn last_mile_engine_cfg(name: &str, weight: f64, category: &str, daily_limit: u32) -> EngineConfig {
        EngineConfig { last_mile: true, daily_limit, ..engine_cfg(name, weight, category) }
    }

    #[tokio::test]
    async fn weight_decays_with_failures() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut config = Config::default();
        config.engines.push(engine_cfg("semantic-scholar", 0.9, "academic"));
        let policy = PolicyEngine::new(store, config);

        let healthy = EngineHealth {
            engine: "semantic-scholar".into(),
            ..EngineHealth::default()
        };
        let full_weight = PolicyEngine::dynamic_engine_weight(0.9, &healthy);

        let degraded = EngineHealth {
            success_rate_1h: 0.1,
            success_rate_24h: 0.2,
            captcha_rate: 0.8,
            ..healthy
        };
        let degraded_weight = PolicyEngine::dynamic_engine_weight(0.9, &degraded);
        assert!(degraded_weight < full_weight);
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_failures() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = Config::default();
        let policy = PolicyEngine::new(store, config).with_circuit_config(CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        });

        for _ in 0..2 {
            policy.record_engine_result("flaky", false, 500.0, false).await.unwrap();
            assert!(policy.check_engine_available("flaky").await.is_ok());
        }
        policy.record_engine_result("flaky", false, 500.0, false).await.unwrap();
        assert!(policy.check_engine_available("flaky").await.is_err());
    }

    #[tokio::test]
    async fn circuit_recovers_after_cooldown() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = Config::default();
        let policy = PolicyEngine::new(store, config).with_circuit_config(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(1),
            half_open_max_calls: 1,
        });

        policy.record_engine_result("flaky", false, 500.0, false).await.unwrap();
        assert!(policy.check_engine_available("flaky").await.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(policy.check_engine_available("flaky").await.is_ok());
        policy.record_engine_result("flaky", true, 500.0, false).await.unwrap();

        let health = policy.health_for("flaky").await.unwrap();
        assert_eq!(health.circuit_state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn select_engine_prefers_higher_weight() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut config = Config::default();
        config.engines.push(engine_cfg("weak", 0.3, "academic"));
        config.engines.push(engine_cfg("strong", 0.9, "academic"));
        let policy = PolicyEngine::new(store, config);

        let chosen = policy.select_engine("academic").await.unwrap();
        assert_eq!(chosen, "strong");
    }

    #[test]
    fn tie_break_prefers_lower_latency() {
        assert!(PolicyEngine::beats((0.5, 100.0), (0.5, 200.0)));
        assert!(!PolicyEngine::beats((0.5, 200.0), (0.5, 100.0)));
        assert!(!PolicyEngine::beats((0.4, 50.0), (0.5, 200.0)));
    }

    #[tokio::test]
    async fn last_mile_engines_empty_below_harvest_threshold() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut config = Config::default();
        config.engines.push(last_mile_engine_cfg("archive-crawl", 0.2, "academic", 5));
        let policy = PolicyEngine::new(store, config);

        assert!(policy.last_mile_engines("academic", 0.5).is_empty());
        assert_eq!(policy.last_mile_engines("academic", 0.9), vec!["archive-crawl".to_string()]);
    }

    #[tokio::test]
    async fn last_mile_engines_excludes_engines_without_the_flag() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut config = Config::default();
        config.engines.push(engine_cfg("general-search", 0.8, "academic"));
        let policy = PolicyEngine::new(store, config);

        assert!(policy.last_mile_engines("academic", 0.95).is_empty());
    }

    #[tokio::test]
    async fn last_mile_engines_respects_daily_limit() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut config = Config::default();
        config.engines.push(last_mile_engine_cfg("archive-crawl", 0.2, "academic", 2));
        let policy = PolicyEngine::new(store, config);

        policy.record_last_mile_use("archive-crawl");
        policy.record_last_mile_use("archive-crawl");
        assert!(policy.last_mile_engines("academic", 0.95).is_empty());
    }

    #[tokio::test]
    async fn domain_budget_blocks_when_exhausted() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let mut config = Config::default();
        config.domains.push(DomainConfig {
            domain: "paywalled.example".to_string(),
            category: DomainCategory::News,
            qps: 1.0,
            max_requests_per_day: 1,
            max_pages_per_day: 1,
            tor_usage_ratio: 0.0,
        });
        store.set_domain_caps("paywalled.example", 1, 1).await.unwrap();
        store.increment_domain_counters("paywalled.example", 1, 1).await.unwrap();
        let policy = PolicyEngine::new(store, config);
        assert!(policy.can_request_to_domain("paywalled.example").await.is_err());
    }
}
