use std::str::FromStr;
use std::sync::Arc;

use crate::audit::{ActorResolver, ContextActorResolver, FixedActorResolver, DEFAULT_ACTOR, FALLBACK_ACTOR};
use crate::utils::RetryConfig;

// ============================================================================
// Runtime Configuration
// ============================================================================
//
// Everything is read from environment variables:
// - DATABASE_URL: Postgres connection string (unset: in-memory store)
// - DATABASE_MAX_CONNECTIONS: pool size (default 5)
// - AUDIT_ACTOR_SOURCE: "fixed" or "context" (default fixed)
// - AUDIT_DEFAULT_ACTOR: identity used by the fixed source (default admin)
// - AUDIT_FALLBACK_ACTOR: identity for anonymous callers (default unknown)
// - AUDIT_RETRY_ATTEMPTS: attempts per transaction (default 3)
// - METRICS_PORT: metrics/health HTTP port, 0 disables it (default 9090)
//
// ============================================================================

/// Where revision actors come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorSource {
    /// Every revision is attributed to the default actor.
    Fixed,
    /// The caller's principal, or the fallback actor when there is none.
    Context,
}

impl FromStr for ActorSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(ActorSource::Fixed),
            "context" => Ok(ActorSource::Context),
            other => Err(anyhow::anyhow!("Unknown actor source: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub actor_source: ActorSource,
    pub default_actor: String,
    pub fallback_actor: String,
    pub retry_attempts: u32,
    pub metrics_port: u16,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            actor_source: ActorSource::Fixed,
            default_actor: DEFAULT_ACTOR.to_string(),
            fallback_actor: FALLBACK_ACTOR.to_string(),
            retry_attempts: 3,
            metrics_port: 9090,
        }
    }
}

impl AuditConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key/value source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = get("DATABASE_URL") {
            config.database_url = Some(url);
        }
        if let Some(value) = get("DATABASE_MAX_CONNECTIONS") {
            config.max_connections = parse("DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = get("AUDIT_ACTOR_SOURCE") {
            config.actor_source = value.parse()?;
        }
        if let Some(actor) = get("AUDIT_DEFAULT_ACTOR") {
            config.default_actor = actor.trim().to_string();
        }
        if let Some(actor) = get("AUDIT_FALLBACK_ACTOR") {
            config.fallback_actor = actor.trim().to_string();
        }
        if let Some(value) = get("AUDIT_RETRY_ATTEMPTS") {
            config.retry_attempts = parse("AUDIT_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = get("METRICS_PORT") {
            config.metrics_port = parse("METRICS_PORT", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("DATABASE_MAX_CONNECTIONS cannot be 0"));
        }
        if self.retry_attempts == 0 {
            return Err(anyhow::anyhow!("AUDIT_RETRY_ATTEMPTS cannot be 0"));
        }
        Ok(())
    }

    pub fn actor_resolver(&self) -> Arc<dyn ActorResolver> {
        match self.actor_source {
            ActorSource::Fixed => Arc::new(FixedActorResolver::new(self.default_actor.clone())),
            ActorSource::Context => Arc::new(ContextActorResolver::new(self.fallback_actor.clone())),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.retry_attempts)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port != 0
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid {} value: {}", key, value))
}
