//! The `Dispatcher`/`Invoker` external interfaces (spec §6 items 2-3)
//! and the reserved-name dispatch path (spec §9 "Reserved names").
//!
//! Grounded in the teacher's `RequestHandler` trait (`server.rs`):
//! same async-trait-over-a-suffix shape, generalized from a single
//! fixed opcode set to an open method/suffix lookup.

use async_trait::async_trait;

use crate::error::{CoreError, Result};
use crate::security::{AllowAllAuthorizer, Authorizer, Blessings};

/// One positional argument or result, opaque to the core. Invokers
/// encode/decode their own typed arguments into this representation;
/// the core only moves bytes.
pub type ArgValue = Vec<u8>;

/// A reflection-or-generated bridge that turns decoded positional
/// arguments into a method call and returns positional results (spec
/// §6 item 3).
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Declares the expected argument count and method tags for
    /// `method`, used by the server to validate `NumPosArgs` before
    /// decoding (spec §4.5 step 6).
    async fn prepare(&self, method: &str) -> Result<(u32, Vec<String>)>;

    /// Invokes `method` with the decoded positional `args`, streaming
    /// via `send`/`recv` callbacks mirroring spec §4.5 step 8's
    /// `Send(item)`/`Recv(&item)` framing. Returns positional results.
    async fn invoke(
        &self,
        method: &str,
        caller: &Blessings,
        args: Vec<ArgValue>,
    ) -> Result<Vec<ArgValue>>;
}

/// Lookup function from suffix to `(invoker, authorizer)` (spec §6
/// item 2).
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Resolves `suffix` to an invoker and its authorizer, or
    /// `CoreError::UnknownSuffix` if no object lives there.
    async fn lookup(&self, suffix: &str) -> Result<(Box<dyn Invoker>, Box<dyn Authorizer>)>;
}

/// Routes `__`-prefixed methods and reserved suffixes to a distinct
/// dispatcher, matching spec §9's reserved-names rule. Falls through
/// to the user dispatcher for everything else.
pub struct ReservedAwareDispatcher {
    reserved: Box<dyn Dispatcher>,
    user: Box<dyn Dispatcher>,
    leaf: bool,
}

impl ReservedAwareDispatcher {
    /// Composes a reserved dispatcher (introspection: `Signature`,
    /// `Glob`) with the user-supplied dispatcher. `leaf` mirrors a
    /// server declared as a leaf object: any non-empty suffix is
    /// rejected with `UnknownSuffix` rather than routed to `user`.
    pub fn new(reserved: Box<dyn Dispatcher>, user: Box<dyn Dispatcher>, leaf: bool) -> Self {
        ReservedAwareDispatcher { reserved, user, leaf }
    }

    /// Routes a `(suffix, method)` pair per spec §4.5 step 5.
    pub async fn route(
        &self,
        suffix: &str,
        method: &str,
    ) -> Result<(Box<dyn Invoker>, Box<dyn Authorizer>)> {
        if method.starts_with("__") {
            return self.reserved.lookup(suffix).await;
        }
        if is_reserved_suffix(suffix) {
            return self.reserved.lookup(suffix).await;
        }
        if self.leaf && !suffix.is_empty() {
            return Err(CoreError::UnknownSuffix(suffix.to_string()));
        }
        self.user.lookup(suffix).await
    }
}

fn is_reserved_suffix(suffix: &str) -> bool {
    suffix.split('/').any(|seg| seg.starts_with("__"))
}

/// A reserved dispatcher implementing only introspection; always
/// reports `UnknownMethod` for anything other than `__Signature`
/// /`__Glob`, matching spec §9's statement that reserved dispatch is a
/// distinct code path sharing only the flow handler.
pub struct IntrospectionDispatcher;

struct IntrospectionInvoker;

#[async_trait]
impl Invoker for IntrospectionInvoker {
    async fn prepare(&self, method: &str) -> Result<(u32, Vec<String>)> {
        match method {
            "__Signature" | "__Glob" => Ok((0, Vec::new())),
            other => Err(CoreError::UnknownMethod {
                method: other.to_string(),
                suffix: "__".to_string(),
            }),
        }
    }

    async fn invoke(
        &self,
        method: &str,
        _caller: &Blessings,
        _args: Vec<ArgValue>,
    ) -> Result<Vec<ArgValue>> {
        match method {
            "__Signature" | "__Glob" => Ok(Vec::new()),
            other => Err(CoreError::UnknownMethod {
                method: other.to_string(),
                suffix: "__".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Dispatcher for IntrospectionDispatcher {
    async fn lookup(&self, _suffix: &str) -> Result<(Box<dyn Invoker>, Box<dyn Authorizer>)> {
        Ok((Box::new(IntrospectionInvoker), Box::new(AllowAllAuthorizer)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyUserDispatcher;

    #[async_trait]
    impl Dispatcher for EmptyUserDispatcher {
        async fn lookup(&self, suffix: &str) -> Result<(Box<dyn Invoker>, Box<dyn Authorizer>)> {
            Err(CoreError::UnknownSuffix(suffix.to_string()))
        }
    }

    #[tokio::test]
    async fn reserved_method_routes_to_reserved_dispatcher() {
        let routed = ReservedAwareDispatcher::new(
            Box::new(IntrospectionDispatcher),
            Box::new(EmptyUserDispatcher),
            false,
        );
        let (invoker, _) = routed.route("a/b", "__Signature").await.unwrap();
        let (n, _) = invoker.prepare("__Signature").await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn leaf_server_rejects_nonempty_suffix() {
        let routed = ReservedAwareDispatcher::new(
            Box::new(IntrospectionDispatcher),
            Box::new(EmptyUserDispatcher),
            true,
        );
        let err = routed.route("a/b", "Get").await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownSuffix(_)));
    }

    #[tokio::test]
    async fn non_reserved_falls_through_to_user() {
        let routed = ReservedAwareDispatcher::new(
            Box::new(IntrospectionDispatcher),
            Box::new(EmptyUserDispatcher),
            false,
        );
        let err = routed.route("a/b", "Get").await.unwrap_err();
        assert!(matches!(err, CoreError::UnknownSuffix(_)));
    }
}
