//! Blessings, discharges and the principal/authorizer seam (spec §6
//! item 5, §9 "Security context"). These are minimal in-process types:
//! the production credential store and discharge-fetching protocol are
//! explicitly external collaborators (spec §1); this module only
//! carries enough shape for the cache, flow manager, client and server
//! to compose a call security context.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A delegation certificate chain naming a principal, presented during
/// handshake. Represented here as an opaque signed string; real chain
/// verification belongs to the external credential store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Blessing(pub String);

/// A fresh token that satisfies a third-party caveat on a [`Blessing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discharge(pub String);

/// An immutable snapshot of the blessings and discharges presented (or
/// held) by one side of a call, taken at `Start` per spec §9.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blessings {
    names: Vec<Blessing>,
}

impl Blessings {
    /// An empty blessing set.
    pub fn empty() -> Self {
        Blessings::default()
    }

    /// Builds a blessing set from the given names.
    pub fn new(names: Vec<Blessing>) -> Self {
        Blessings { names }
    }

    /// The human-readable names carried by these blessings.
    pub fn names(&self) -> Vec<String> {
        self.names.iter().map(|b| b.0.clone()).collect()
    }

    fn as_set(&self) -> HashSet<&str> {
        self.names.iter().map(|b| b.0.as_str()).collect()
    }
}

/// A principal's durable identity: its default blessings, and the
/// logic for choosing which blessings to present to a given peer.
pub trait Principal: Send + Sync {
    /// The blessings presented when no peer-specific selection applies.
    fn default_blessings(&self) -> Blessings;

    /// Selects the blessings to present to a peer that has presented
    /// `remote_blessings`, per the principal's `BlessingStore` policy.
    fn for_peer(&self, remote_blessings: &Blessings) -> Blessings;
}

/// A `Principal` that always presents one fixed, unconditional identity.
/// Grounded in the teacher's certificate-based trust config shapes
/// (`AuthConfig`/`CertificateInfo`), simplified to the single-identity
/// case that is enough to drive the handshake end to end.
#[derive(Debug, Clone)]
pub struct FixedPrincipal {
    blessings: Blessings,
}

impl FixedPrincipal {
    /// Builds a principal that always presents `name`.
    pub fn named(name: impl Into<String>) -> Self {
        FixedPrincipal {
            blessings: Blessings::new(vec![Blessing(name.into())]),
        }
    }
}

impl Principal for FixedPrincipal {
    fn default_blessings(&self) -> Blessings {
        self.blessings.clone()
    }

    fn for_peer(&self, _remote_blessings: &Blessings) -> Blessings {
        self.blessings.clone()
    }
}

/// Evaluated once per dial attempt: authorizes the remote peer's
/// blessings, or rejects with [`CoreError::NotTrusted`] (spec §4.6
/// step 3c, suberror `ServerAuthorizeFailed`, non-retryable).
#[async_trait]
pub trait PeerAuthorizer: Send + Sync {
    /// Returns `Ok(())` if `remote` is an acceptable peer identity.
    async fn authorize_peer(&self, remote: &Blessings) -> Result<()>;
}

/// Accepts any peer whose blessing names intersect an allow-list; an
/// empty allow-list accepts everyone. Used by tests and as the
/// permissive default.
pub struct AllowListAuthorizer {
    allowed: Vec<String>,
}

impl AllowListAuthorizer {
    /// Accepts only peers presenting at least one of `allowed`.
    pub fn new(allowed: Vec<String>) -> Self {
        AllowListAuthorizer { allowed }
    }

    /// Accepts every peer unconditionally.
    pub fn permissive() -> Self {
        AllowListAuthorizer { allowed: Vec::new() }
    }
}

#[async_trait]
impl PeerAuthorizer for AllowListAuthorizer {
    async fn authorize_peer(&self, remote: &Blessings) -> Result<()> {
        if self.allowed.is_empty() {
            return Ok(());
        }
        let remote_set = remote.as_set();
        if self.allowed.iter().any(|a| remote_set.contains(a.as_str())) {
            Ok(())
        } else {
            Err(CoreError::NotTrusted(format!(
                "remote blessings {:?} not in allow-list {:?}",
                remote.names(),
                self.allowed
            )))
        }
    }
}

/// Evaluated per method call (spec §4.5 step 7): authorizes the
/// caller's security context against the tags the method declared.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns `Ok(())` if the caller may invoke a method tagged with
    /// `tags`.
    async fn authorize(&self, caller: &Blessings, tags: &[String]) -> Result<()>;
}

/// Authorizes every call unconditionally. The default for dispatchers
/// that rely entirely on peer-level trust established at dial time.
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(&self, _caller: &Blessings, _tags: &[String]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_list_accepts_matching_name() {
        let auth = AllowListAuthorizer::new(vec!["alice".into()]);
        let blessings = Blessings::new(vec![Blessing("alice".into())]);
        assert!(auth.authorize_peer(&blessings).await.is_ok());
    }

    #[tokio::test]
    async fn allow_list_rejects_non_matching_name() {
        let auth = AllowListAuthorizer::new(vec!["alice".into()]);
        let blessings = Blessings::new(vec![Blessing("mallory".into())]);
        let err = auth.authorize_peer(&blessings).await.unwrap_err();
        assert!(matches!(err, CoreError::NotTrusted(_)));
    }

    #[tokio::test]
    async fn permissive_accepts_anything() {
        let auth = AllowListAuthorizer::permissive();
        assert!(auth.authorize_peer(&Blessings::empty()).await.is_ok());
    }

    #[test]
    fn fixed_principal_is_peer_invariant() {
        let p = FixedPrincipal::named("server1");
        assert_eq!(p.default_blessings(), p.for_peer(&Blessings::empty()));
    }
}
