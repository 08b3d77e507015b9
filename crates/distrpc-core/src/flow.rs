//! `Flow`: a bidirectional byte/message channel with close semantics,
//! carrying local/remote blessings and discharges (spec §4.2).
//!
//! A single flow's writes and reads are each strictly ordered; no
//! ordering is guaranteed across different flows on the same
//! connection (spec §5).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, Weak};

use tokio::sync::mpsc;

use crate::connection::{Connection, StreamId};
use crate::endpoint::Endpoint;
use crate::error::{CoreError, Result};
use crate::security::{Blessings, Discharge};

/// Lifecycle state of a [`Flow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowState {
    /// Both halves open.
    Open = 0,
    /// This side has closed its write half; reads still possible.
    HalfClosedLocal = 1,
    /// The peer has closed its write half; writes still possible.
    HalfClosedRemote = 2,
    /// Both halves closed.
    Closed = 3,
}

impl From<u8> for FlowState {
    fn from(v: u8) -> Self {
        match v {
            0 => FlowState::Open,
            1 => FlowState::HalfClosedLocal,
            2 => FlowState::HalfClosedRemote,
            _ => FlowState::Closed,
        }
    }
}

/// One logical, multiplexed stream inside a [`Connection`], used for
/// exactly one RPC direction-pair. Owned by exactly one Connection;
/// holds only a non-owning back-pointer to it (spec §9 design note on
/// the Connection/Flow cyclic reference).
pub struct Flow {
    connection: Weak<Connection>,
    stream_id: StreamId,
    incoming: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    state: AtomicU8,
    local_endpoint: Option<Endpoint>,
    remote_endpoint: Option<Endpoint>,
    local_blessings: Blessings,
    remote_blessings: Blessings,
    local_discharges: Vec<Discharge>,
    remote_discharges: Vec<Discharge>,
}

impl Flow {
    pub(crate) fn new(
        connection: Weak<Connection>,
        stream_id: StreamId,
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
        local_endpoint: Option<Endpoint>,
        remote_endpoint: Option<Endpoint>,
        local_blessings: Blessings,
        remote_blessings: Blessings,
        local_discharges: Vec<Discharge>,
        remote_discharges: Vec<Discharge>,
    ) -> Self {
        Flow {
            connection,
            stream_id,
            incoming: Mutex::new(incoming),
            state: AtomicU8::new(FlowState::Open as u8),
            local_endpoint,
            remote_endpoint,
            local_blessings,
            remote_blessings,
            local_discharges,
            remote_discharges,
        }
    }

    /// Current flow state.
    pub fn state(&self) -> FlowState {
        FlowState::from(self.state.load(Ordering::SeqCst))
    }

    /// This side's endpoint, if known.
    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.local_endpoint.as_ref()
    }

    /// The peer's endpoint.
    pub fn remote_endpoint(&self) -> Option<&Endpoint> {
        self.remote_endpoint.as_ref()
    }

    /// Blessings this side presented.
    pub fn local_blessings(&self) -> &Blessings {
        &self.local_blessings
    }

    /// Blessings the peer presented.
    pub fn remote_blessings(&self) -> &Blessings {
        &self.remote_blessings
    }

    /// Discharges this side presented.
    pub fn local_discharges(&self) -> &[Discharge] {
        &self.local_discharges
    }

    /// Discharges the peer presented.
    pub fn remote_discharges(&self) -> &[Discharge] {
        &self.remote_discharges
    }

    fn touch_connection(&self) {
        if let Some(conn) = self.connection.upgrade() {
            conn.touch();
        }
    }

    /// Appends bytes as one atomic framed write. Fails with
    /// `BadState` once the local write half is closed.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        match self.state() {
            FlowState::Closed | FlowState::HalfClosedLocal => {
                return Err(CoreError::BadState("write on a flow with closed write half".into()));
            }
            _ => {}
        }
        let conn = self
            .connection
            .upgrade()
            .ok_or_else(|| CoreError::BadState("flow's connection has been closed".into()))?;
        conn.send_framed(self.stream_id, bytes).await?;
        self.touch_connection();
        Ok(())
    }

    /// Alias for [`Flow::write`]: every write on this transport is
    /// already an atomic framed message.
    pub async fn write_message(&self, bytes: &[u8]) -> Result<()> {
        self.write(bytes).await
    }

    /// Blocks until the next framed message arrives, or returns
    /// `Ok(None)` on end-of-stream (peer closed its write half).
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        // `std::sync::Mutex` cannot be held across an `.await`, so the
        // receiver is taken out, awaited on, then put back.
        let mut rx = {
            let mut guard = self.incoming.lock().unwrap();
            std::mem::replace(&mut *guard, unusable_receiver())
        };
        let result = rx.recv().await;
        *self.incoming.lock().unwrap() = rx;
        match result {
            Some(msg) => {
                self.touch_connection();
                Ok(Some(msg))
            }
            None => {
                self.mark_remote_closed();
                Ok(None)
            }
        }
    }

    /// Alias for [`Flow::read`].
    pub async fn read_message(&self) -> Result<Option<Vec<u8>>> {
        self.read().await
    }

    fn mark_remote_closed(&self) {
        let new_state = match self.state() {
            FlowState::HalfClosedLocal => FlowState::Closed,
            FlowState::Open => FlowState::HalfClosedRemote,
            other => other,
        };
        self.state.store(new_state as u8, Ordering::SeqCst);
    }

    fn mark_local_closed(&self) {
        let new_state = match self.state() {
            FlowState::HalfClosedRemote => FlowState::Closed,
            FlowState::Open => FlowState::HalfClosedLocal,
            other => other,
        };
        self.state.store(new_state as u8, Ordering::SeqCst);
        if new_state == FlowState::Closed {
            if let Some(conn) = self.connection.upgrade() {
                conn.deregister_flow(self.stream_id);
            }
        }
    }

    /// Idempotently closes the local write half and signals the
    /// remote peer. The flow becomes `Closed` once both halves are
    /// done.
    pub fn close(&self) {
        self.mark_local_closed();
    }

    /// Writes `bytes` then immediately closes the local write half.
    pub async fn write_and_close(&self, bytes: &[u8]) -> Result<()> {
        let result = self.write(bytes).await;
        self.close();
        result
    }
}

fn unusable_receiver() -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(tx);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_state_transitions_to_closed_from_either_half() {
        assert_eq!(FlowState::from(0) as u8, FlowState::Open as u8);
        assert_eq!(FlowState::from(3) as u8, FlowState::Closed as u8);
    }
}
