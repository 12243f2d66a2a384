//! Access-control seam.
//!
//! Authorization decisioning lives outside this crate; the core only asks
//! allow/deny before executing mutating or schema operations. A configured
//! fail-open policy decides what happens when the authorizer itself errors.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ClusterError;

/// Action classes checked against the authorizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
    Schema,
    Admin,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "read",
            Action::Write => "write",
            Action::Schema => "schema",
            Action::Admin => "admin",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// External authorization hook.
#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn authorize(
        &self,
        actor: &str,
        action: Action,
        scope: &str,
    ) -> anyhow::Result<Decision>;
}

/// Default permissive authorizer.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _: &str, _: Action, _: &str) -> anyhow::Result<Decision> {
        Ok(Decision::Allow)
    }
}

/// Gate wrapping an authorizer with a transport-error policy.
#[derive(Clone)]
pub struct AuthGate {
    inner: Arc<dyn Authorizer>,
    fail_open: bool,
}

impl AuthGate {
    pub fn new(inner: Arc<dyn Authorizer>, fail_open: bool) -> Self {
        Self { inner, fail_open }
    }

    pub fn allow_all() -> Self {
        Self::new(Arc::new(AllowAll), false)
    }

    pub async fn check(
        &self,
        actor: &str,
        action: Action,
        scope: &str,
    ) -> Result<(), ClusterError> {
        match self.inner.authorize(actor, action, scope).await {
            Ok(Decision::Allow) => Ok(()),
            Ok(Decision::Deny) => Err(ClusterError::Unauthorized {
                actor: actor.to_string(),
                action: action.as_str().to_string(),
                scope: scope.to_string(),
            }),
            Err(err) if self.fail_open => {
                tracing::warn!(actor, action = action.as_str(), scope, error = ?err,
                    "authorizer unreachable; failing open");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(actor, action = action.as_str(), scope, error = ?err,
                    "authorizer unreachable; failing closed");
                Err(ClusterError::Unauthorized {
                    actor: actor.to_string(),
                    action: action.as_str().to_string(),
                    scope: scope.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Flaky;

    #[async_trait]
    impl Authorizer for Flaky {
        async fn authorize(&self, _: &str, _: Action, _: &str) -> anyhow::Result<Decision> {
            anyhow::bail!("authorizer endpoint unreachable")
        }
    }

    #[tokio::test]
    async fn fail_open_policy_controls_errors() {
        let open = AuthGate::new(Arc::new(Flaky), true);
        assert!(open.check("alice", Action::Write, "table/users").await.is_ok());

        let closed = AuthGate::new(Arc::new(Flaky), false);
        let err = closed
            .check("alice", Action::Write, "table/users")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Unauthorized { .. }));
    }
}
