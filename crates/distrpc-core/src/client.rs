//! Client Core (C6, spec §4.6): per-call state machine
//! Resolve → Filter → ParallelDial → Race → Start → Finish, with
//! at-most-once retry semantics.
//!
//! Grounded in the teacher's `TransportClient` composition shape (a
//! config struct plus a `Metrics` collector wrapping the actual send
//! path). The teacher's `circuitbreaker`/`flowcontrol`/`health`
//! integrations have no counterpart in the call state machine this
//! module implements and are dropped rather than carried forward
//! unused.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::config::ClientConfig;
use crate::dispatch::ArgValue;
use crate::endpoint::{filter_and_order_servers, Endpoint, ServerCandidate};
use crate::error::{CoreError, Result};
use crate::flow::Flow;
use crate::manager::FlowManager;
use crate::metrics::Metrics;
use crate::namespace::Namespace;
use crate::protocol::{decode_frame, encode_frame, RequestHeader, ResponseHeader};
use crate::retry::{classify_action, BackoffSchedule, RetryAction};
use crate::security::PeerAuthorizer;

/// What a retry wait resolved to.
enum RetryOutcome {
    Retry,
    GiveUp,
}

/// Converts `error` into `CoreError::Canceled` when `cancel` fired,
/// regardless of what `error` otherwise was — cancellation trumps a
/// concurrently-pending timeout.
fn finalize_error(error: CoreError, cancel: &CancelToken) -> CoreError {
    if cancel.is_cancelled() {
        CoreError::Canceled("call cancelled".to_string())
    } else {
        error
    }
}

/// An error from a call attempt, tagged with whether `Start` had
/// already been invoked on the winning Flow when it occurred. Only
/// pre-Start errors are eligible for retry (spec §4.6 "Retry policy").
enum CallAttemptError {
    PreStart(CoreError),
    PostStart(CoreError),
}

/// A name-resolving, retrying RPC client.
pub struct Client {
    manager: Arc<FlowManager>,
    namespace: Arc<dyn Namespace>,
    config: ClientConfig,
    metrics: Arc<Metrics>,
    closed: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Builds a client dialing through `manager`, resolving names
    /// against `namespace`.
    pub fn new(manager: Arc<FlowManager>, namespace: Arc<dyn Namespace>, config: ClientConfig) -> Arc<Self> {
        Arc::new(Client {
            manager,
            namespace,
            config,
            metrics: Arc::new(Metrics::new()),
            closed: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Exposes the metrics collector for callers that want a snapshot.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn track_background(&self, handle: JoinHandle<()>) {
        self.background.lock().unwrap().push(handle);
    }

    /// Resolves `name`, dials the best server, and runs `Start` (header
    /// + positional args), retrying per spec §4.6's policy until either
    /// a call begins or the deadline is exhausted. Once `Start` has
    /// been attempted on a Flow the call is no longer retryable,
    /// regardless of outcome.
    pub async fn start_call(
        client: &Arc<Client>,
        name: &str,
        method: &str,
        args: Vec<ArgValue>,
        peer_authorizer: Arc<dyn PeerAuthorizer>,
        cancel: CancelToken,
    ) -> Result<Call> {
        if client.closed.load(Ordering::SeqCst) {
            return Err(CoreError::BadState("client close already called".into()));
        }
        if cancel.is_cancelled() {
            return Err(CoreError::Canceled("call cancelled before start".to_string()));
        }

        let deadline_at = Instant::now() + client.config.default_deadline;
        let mut backoff = client.config.backoff_schedule();
        let mut cached: Option<(String, Vec<ServerCandidate>)> = None;

        loop {
            let (suffix, servers) = match &cached {
                Some(c) => c.clone(),
                None => match resolve_servers(client, name).await {
                    Ok(v) => v,
                    Err(e) => match wait_for_retry(&e, &mut backoff, deadline_at, &cancel).await {
                        RetryOutcome::Retry => continue,
                        RetryOutcome::GiveUp => return Err(finalize_error(e, &cancel)),
                    },
                },
            };

            match dial_and_start(client, &suffix, &servers, method, &args, peer_authorizer.clone(), deadline_at, &cancel).await {
                Ok(call) => return Ok(call),
                Err(CallAttemptError::PostStart(e)) => return Err(e),
                Err(CallAttemptError::PreStart(e)) => {
                    let action = classify_action(&e);
                    match wait_for_retry(&e, &mut backoff, deadline_at, &cancel).await {
                        RetryOutcome::GiveUp => return Err(finalize_error(e, &cancel)),
                        RetryOutcome::Retry => {
                            cached = match action {
                                RetryAction::RetryConnection => Some((suffix, servers)),
                                _ => None,
                            };
                        }
                    }
                }
            }
        }
    }

    /// Marks the client closed and waits for every background
    /// loser-flow cleanup task spawned by a race to finish (spec §4.6
    /// `Close`). New `start_call`s fail immediately afterwards.
    pub async fn close(client: &Arc<Client>) {
        client.closed.store(true, Ordering::SeqCst);
        let handles: Vec<_> = std::mem::take(&mut *client.background.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Waits out the next backoff delay if `error` is retryable and the
/// deadline allows it, racing the wait against `cancel`. Returns
/// `GiveUp` when the caller must stop and surface `error` (or
/// `Canceled`, if `cancel` won the race — see [`finalize_error`]).
async fn wait_for_retry(
    error: &CoreError,
    backoff: &mut BackoffSchedule,
    deadline_at: Instant,
    cancel: &CancelToken,
) -> RetryOutcome {
    if cancel.is_cancelled() {
        return RetryOutcome::GiveUp;
    }
    if classify_action(error) == RetryAction::NoRetry {
        return RetryOutcome::GiveUp;
    }
    let remaining = deadline_at.saturating_duration_since(Instant::now());
    let Some(delay) = backoff.next(remaining) else {
        return RetryOutcome::GiveUp;
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => RetryOutcome::GiveUp,
        _ = tokio::time::sleep(delay) => RetryOutcome::Retry,
    }
}

/// Resolve + Filter (spec §4.6 steps 1-2).
async fn resolve_servers(client: &Arc<Client>, name: &str) -> Result<(String, Vec<ServerCandidate>)> {
    let entry = match client.namespace.resolve(name).await {
        Ok(e) => e,
        Err(e @ CoreError::NoExist(_)) => return Err(e),
        Err(e @ CoreError::Timeout(_)) => return Err(e),
        Err(other) => return Err(CoreError::NoServers(other.to_string())),
    };

    let candidates: Vec<ServerCandidate> = entry
        .servers
        .iter()
        .map(|s| ServerCandidate { address: s.address.clone() })
        .collect();
    let ordered = filter_and_order_servers(&candidates, &client.config.preferred_protocols, &[])?;
    Ok((entry.name, ordered))
}

/// ParallelDial + Race + Start (spec §4.6 steps 3-5).
async fn dial_and_start(
    client: &Arc<Client>,
    suffix: &str,
    servers: &[ServerCandidate],
    method: &str,
    args: &[ArgValue],
    peer_authorizer: Arc<dyn PeerAuthorizer>,
    deadline_at: Instant,
    cancel: &CancelToken,
) -> std::result::Result<Call, CallAttemptError> {
    let flow = race_dial(client, servers, peer_authorizer, deadline_at, cancel)
        .await
        .map_err(CallAttemptError::PreStart)?;

    let header = RequestHeader::call(suffix, method, args.len() as u32);
    if let Err(e) = write_frame(&flow, &header).await {
        flow.close();
        return Err(CallAttemptError::PostStart(e));
    }
    for item in args {
        if let Err(e) = flow.write(item).await {
            flow.close();
            return Err(CallAttemptError::PostStart(e));
        }
    }
    client.metrics.inc_requests_sent();
    Ok(Call::new(flow, deadline_at, cancel.clone()))
}

/// Parses `address` (already in `protocol/address` form) and dials it
/// through the manager. A malformed address falls through
/// [`classify_action`]'s default `NoRetry`, matching the spec's
/// non-rooted-name failure (spec §4.6 step 3a-c).
async fn dial_one(
    manager: Arc<FlowManager>,
    address: String,
    peer_authorizer: Arc<dyn PeerAuthorizer>,
    cancel: CancelToken,
) -> Result<Flow> {
    let endpoint = Endpoint::parse(&address)?;
    FlowManager::dial(&manager, &endpoint, &*peer_authorizer, &cancel).await
}

/// Races a dial against every candidate server. Blocks until at least
/// one dial task completes, then drains any other already-finished
/// completions without blocking; walks them in original-index order
/// and the first with a live Flow wins. Every other Flow — already
/// completed or still in flight — is closed, the latter by a detached
/// background task (spec §4.6 step 4).
async fn race_dial(
    client: &Arc<Client>,
    servers: &[ServerCandidate],
    peer_authorizer: Arc<dyn PeerAuthorizer>,
    deadline_at: Instant,
    cancel: &CancelToken,
) -> Result<Flow> {
    if servers.is_empty() {
        return Err(CoreError::NoServers("no candidate servers survived filtering".into()));
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, Result<Flow>)>();
    for (i, server) in servers.iter().enumerate() {
        let tx = tx.clone();
        let manager = client.manager.clone();
        let address = server.address.clone();
        let authorizer = peer_authorizer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = dial_one(manager, address, authorizer, cancel).await;
            let _ = tx.send((i, result));
        });
    }
    drop(tx);

    let n = servers.len();
    let mut slots: Vec<Option<Result<Flow>>> = (0..n).map(|_| None).collect();
    let mut received = 0;
    let mut winner = None;
    let mut gave_up_err: Option<CoreError> = None;

    while received < n && winner.is_none() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                gave_up_err = Some(CoreError::Canceled("dial race cancelled".to_string()));
                break;
            }
            _ = tokio::time::sleep_until(deadline_at) => {
                gave_up_err = Some(CoreError::Timeout(deadline_at.saturating_duration_since(Instant::now())));
                break;
            }
            recv = rx.recv() => {
                let Some((i, result)) = recv else { break };
                slots[i] = Some(result);
                received += 1;
                while let Ok((i2, result2)) = rx.try_recv() {
                    slots[i2] = Some(result2);
                    received += 1;
                }
                for slot in slots.iter_mut() {
                    if matches!(slot, Some(Ok(_))) {
                        winner = slot.take();
                        break;
                    }
                }
            }
        }
    }

    let mut last_err = None;
    for slot in slots.into_iter().flatten() {
        match slot {
            Ok(flow) => flow.close(),
            Err(e) => last_err = Some(e),
        }
    }

    let background = tokio::spawn(async move {
        while let Some((_, result)) = rx.recv().await {
            if let Ok(flow) = result {
                flow.close();
            }
        }
    });
    client.track_background(background);

    match winner {
        Some(Ok(flow)) => Ok(flow),
        _ => Err(gave_up_err
            .or(last_err)
            .unwrap_or_else(|| CoreError::NoServers("all dial attempts failed".into()))),
    }
}

async fn write_frame<T: serde::Serialize>(flow: &Flow, value: &T) -> Result<()> {
    let buf = encode_frame(value)?;
    flow.write(&buf).await
}

/// An in-flight call after `Start` has succeeded: positional args are
/// already on the wire, and only the final response remains (spec
/// §4.6 steps 7-8). This runtime's wire protocol always completes in
/// one Start/Finish round — `server.rs`'s handler reads exactly
/// `NumPosArgs` raw items at Start and never waits on a later
/// end-of-stream sentinel — so `Call` carries no separate mid-call
/// streaming API.
pub struct Call {
    flow: Flow,
    close_sent: AtomicBool,
    deadline_at: Instant,
    cancel: CancelToken,
}

impl Call {
    fn new(flow: Flow, deadline_at: Instant, cancel: CancelToken) -> Self {
        Call {
            flow,
            close_sent: AtomicBool::new(false),
            deadline_at,
            cancel,
        }
    }

    /// Marks the argument side of the call closed. Idempotent (spec
    /// §4.6 step 7 `CloseSend`); has no separate wire effect here since
    /// the argument list is already complete after `Start`.
    pub async fn close_send(&self) -> Result<()> {
        self.close_sent.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Reads one frame off the flow, racing it against the call's
    /// deadline and cancellation token so a stalled peer cannot hang
    /// `Finish` past either.
    async fn read_deadlined(&self) -> Result<Option<Vec<u8>>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CoreError::Canceled("call cancelled".to_string())),
            _ = tokio::time::sleep_until(self.deadline_at) => {
                Err(CoreError::Timeout(self.deadline_at.saturating_duration_since(Instant::now())))
            }
            result = self.flow.read() => result,
        }
    }

    /// Implicitly closes the send side, decodes the final
    /// `ResponseHeader`, validates the positional result count, and
    /// decodes each result (spec §4.6 step 8 `Finish`).
    pub async fn finish(&self, expected_results: usize) -> Result<Vec<Vec<u8>>> {
        self.close_send().await?;

        let raw = self
            .read_deadlined()
            .await?
            .ok_or_else(|| CoreError::BadProtocol("flow closed before final response".into()))?;
        let header: ResponseHeader = decode_frame(&raw)?;

        if let Some(wire_err) = header.error {
            return Err(wire_err.into());
        }
        if !header.end_stream_results {
            return Err(CoreError::BadProtocol("expected final response header".into()));
        }
        if header.num_pos_results as usize != expected_results {
            return Err(CoreError::BadProtocol(format!(
                "expected {expected_results} positional results, server declared {}",
                header.num_pos_results
            )));
        }

        let mut results = Vec::with_capacity(expected_results);
        for _ in 0..expected_results {
            let item = self
                .read_deadlined()
                .await?
                .ok_or_else(|| CoreError::BadProtocol("flow closed mid-result".into()))?;
            results.push(item);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{Dispatcher, Invoker};
    use crate::namespace::{InMemoryNamespace, MountedServer};
    use crate::security::{AllowAllAuthorizer, Authorizer, Blessings};
    use crate::server::Server;
    use crate::transport::{TcpTransport, Transport};
    use async_trait::async_trait;
    use std::time::Duration;

    struct EchoInvoker;

    #[async_trait]
    impl Invoker for EchoInvoker {
        async fn prepare(&self, _method: &str) -> Result<(u32, Vec<String>)> {
            Ok((1, Vec::new()))
        }

        async fn invoke(&self, _method: &str, _caller: &Blessings, args: Vec<ArgValue>) -> Result<Vec<ArgValue>> {
            Ok(args)
        }
    }

    struct RejectInvoker;

    #[async_trait]
    impl Invoker for RejectInvoker {
        async fn prepare(&self, _method: &str) -> Result<(u32, Vec<String>)> {
            Ok((0, Vec::new()))
        }

        async fn invoke(&self, _method: &str, _caller: &Blessings, _args: Vec<ArgValue>) -> Result<Vec<ArgValue>> {
            Err(CoreError::Internal("method always fails".into()))
        }
    }

    struct EchoDispatcher;

    #[async_trait]
    impl Dispatcher for EchoDispatcher {
        async fn lookup(&self, _suffix: &str) -> Result<(Box<dyn Invoker>, Box<dyn Authorizer>)> {
            Ok((Box::new(EchoInvoker), Box::new(AllowAllAuthorizer)))
        }
    }

    struct RejectDispatcher;

    #[async_trait]
    impl Dispatcher for RejectDispatcher {
        async fn lookup(&self, _suffix: &str) -> Result<(Box<dyn Invoker>, Box<dyn Authorizer>)> {
            Ok((Box::new(RejectInvoker), Box::new(AllowAllAuthorizer)))
        }
    }

    struct NoAuth;

    #[async_trait]
    impl PeerAuthorizer for NoAuth {
        async fn authorize_peer(&self, _remote: &Blessings) -> Result<()> {
            Ok(())
        }
    }

    async fn start_dispatcher_server(dispatcher: Box<dyn Dispatcher>) -> Arc<Server> {
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
        let config = crate::config::ServerConfig {
            listen_specs: vec![crate::config::ListenSpec::new("tcp", "127.0.0.1:0")],
            drain_timeout: Duration::from_millis(500),
            leaf: false,
        };
        let server = Server::new(transport, Blessings::empty(), config);
        Server::listen(&server, &[]).await.unwrap();
        Server::serve_dispatcher(&server, "", dispatcher);
        server
    }

    fn client_over(server: &Server, name: &str) -> Arc<Client> {
        let local_ep = server.listening_endpoints().remove(0);
        let ns = Arc::new(InMemoryNamespace::new());
        ns.mount(
            name,
            vec![MountedServer {
                address: format!("tcp/{}", local_ep.address()),
                blessing_patterns: vec![],
            }],
        );
        let client_transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
        let manager = FlowManager::new(client_transport, Blessings::empty());
        Client::new(manager, ns, ClientConfig::default())
    }

    #[tokio::test]
    async fn unary_call_roundtrip_through_client() {
        let server = start_dispatcher_server(Box::new(EchoDispatcher)).await;
        let client = client_over(&server, "echo");

        let call = Client::start_call(
            &client,
            "echo",
            "Echo",
            vec![b"hello".to_vec()],
            Arc::new(NoAuth),
            CancelToken::none(),
        )
        .await
        .unwrap();
        let results = call.finish(1).await.unwrap();
        assert_eq!(results, vec![b"hello".to_vec()]);

        Client::close(&client).await;
        Server::stop(&server).await;
    }

    #[tokio::test]
    async fn dispatcher_error_surfaces_through_finish() {
        let server = start_dispatcher_server(Box::new(RejectDispatcher)).await;
        let client = client_over(&server, "reject");

        let call = Client::start_call(&client, "reject", "Fail", vec![], Arc::new(NoAuth), CancelToken::none())
            .await
            .unwrap();
        let err = call.finish(0).await.unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));

        Client::close(&client).await;
        Server::stop(&server).await;
    }

    #[tokio::test]
    async fn unresolvable_name_exhausts_retries_and_surfaces_no_exist() {
        let ns = Arc::new(InMemoryNamespace::new());
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
        let manager = FlowManager::new(transport, Blessings::empty());
        let config = ClientConfig {
            default_deadline: Duration::from_millis(150),
            ..ClientConfig::default()
        };
        let client = Client::new(manager, ns, config);

        let err = Client::start_call(&client, "missing", "Echo", vec![], Arc::new(NoAuth), CancelToken::none())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NoExist(_)));
        Client::close(&client).await;
    }

    #[tokio::test]
    async fn start_call_after_close_fails_immediately() {
        let ns = Arc::new(InMemoryNamespace::new());
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
        let manager = FlowManager::new(transport, Blessings::empty());
        let client = Client::new(manager, ns, ClientConfig::default());

        Client::close(&client).await;
        let err = Client::start_call(&client, "echo", "Echo", vec![], Arc::new(NoAuth), CancelToken::none())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BadState(_)));
    }

    #[tokio::test]
    async fn start_call_is_cancelled_before_dial() {
        let ns = Arc::new(InMemoryNamespace::new());
        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
        let manager = FlowManager::new(transport, Blessings::empty());
        let client = Client::new(manager, ns, ClientConfig::default());

        let (cancel, handle) = crate::cancel::new_cancel_pair();
        handle.cancel(crate::cancel::CancelReason::UserRequested);
        let err = Client::start_call(&client, "echo", "Echo", vec![], Arc::new(NoAuth), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Canceled(_)));
        Client::close(&client).await;
    }

    #[tokio::test]
    async fn finish_times_out_when_server_never_responds() {
        struct StallInvoker;

        #[async_trait]
        impl Invoker for StallInvoker {
            async fn prepare(&self, _method: &str) -> Result<(u32, Vec<String>)> {
                Ok((1, Vec::new()))
            }

            async fn invoke(&self, _method: &str, _caller: &Blessings, _args: Vec<ArgValue>) -> Result<Vec<ArgValue>> {
                std::future::pending().await
            }
        }

        struct StallDispatcher;

        #[async_trait]
        impl Dispatcher for StallDispatcher {
            async fn lookup(&self, _suffix: &str) -> Result<(Box<dyn Invoker>, Box<dyn Authorizer>)> {
                Ok((Box::new(StallInvoker), Box::new(AllowAllAuthorizer)))
            }
        }

        let server = start_dispatcher_server(Box::new(StallDispatcher)).await;
        let local_ep = server.listening_endpoints().remove(0);
        let ns = Arc::new(InMemoryNamespace::new());
        ns.mount(
            "stall",
            vec![MountedServer {
                address: format!("tcp/{}", local_ep.address()),
                blessing_patterns: vec![],
            }],
        );
        let client_transport: Arc<dyn Transport> = Arc::new(TcpTransport::new());
        let manager = FlowManager::new(client_transport, Blessings::empty());
        let config = ClientConfig {
            default_deadline: Duration::from_millis(150),
            ..ClientConfig::default()
        };
        let client = Client::new(manager, ns, config);

        let call = Client::start_call(&client, "stall", "Stall", vec![b"hi".to_vec()], Arc::new(NoAuth), CancelToken::none())
            .await
            .unwrap();
        let err = call.finish(1).await.unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));

        Client::close(&client).await;
        Server::stop(&server).await;
    }
}
