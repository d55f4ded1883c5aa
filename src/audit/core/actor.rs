use uuid::Uuid;

// ============================================================================
// Actor Attribution
// ============================================================================
//
// Resolvers are consulted once per revision allocation. They never fail:
// an unattributed revision is recorded under a fallback identity rather
// than losing the history altogether.
//
// ============================================================================

/// Identity used when no resolver is configured.
pub const DEFAULT_ACTOR: &str = "admin";

/// Identity used when a resolver cannot determine who is acting.
pub const FALLBACK_ACTOR: &str = "unknown";

/// Explicit execution context handed to a transaction.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Authenticated principal, if any.
    pub principal: Option<String>,
    /// Groups related transactions for tracing.
    pub correlation_id: Option<Uuid>,
}

impl ExecutionContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_principal(principal: impl Into<String>) -> Self {
        Self {
            principal: Some(principal.into()),
            ..Self::default()
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Produces the identity a revision is attributed to.
pub trait ActorResolver: Send + Sync {
    fn resolve(&self, ctx: &ExecutionContext) -> String;
}

/// Attributes every revision to the same identity, ignoring the context.
#[derive(Debug, Clone)]
pub struct FixedActorResolver {
    identity: String,
}

impl FixedActorResolver {
    pub fn new(identity: impl Into<String>) -> Self {
        let identity = identity.into();
        if identity.trim().is_empty() {
            return Self::default();
        }
        Self { identity }
    }
}

impl Default for FixedActorResolver {
    fn default() -> Self {
        Self {
            identity: DEFAULT_ACTOR.to_string(),
        }
    }
}

impl ActorResolver for FixedActorResolver {
    fn resolve(&self, _ctx: &ExecutionContext) -> String {
        self.identity.clone()
    }
}

/// Attributes revisions to the context's principal.
#[derive(Debug, Clone)]
pub struct ContextActorResolver {
    fallback: String,
}

impl ContextActorResolver {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self {
            fallback: fallback.into(),
        }
    }
}

impl Default for ContextActorResolver {
    fn default() -> Self {
        Self::new(FALLBACK_ACTOR)
    }
}

impl ActorResolver for ContextActorResolver {
    fn resolve(&self, ctx: &ExecutionContext) -> String {
        match ctx.principal.as_deref().map(str::trim) {
            Some(principal) if !principal.is_empty() => principal.to_string(),
            _ => {
                tracing::warn!(
                    fallback = %self.fallback,
                    correlation_id = ?ctx.correlation_id,
                    "No principal in execution context, using fallback actor"
                );
                self.fallback.clone()
            }
        }
    }
}
