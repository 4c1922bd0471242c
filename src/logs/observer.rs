//! Forwarding a log stream to a remote observer.
//!
//! The observer side of a stream is an explicit state machine published on a
//! `watch` channel:
//!
//! ```text
//! Connected --send fails--> Reconnecting { attempt: 1..=max_attempts } --ok--> Connected
//!                                        \--attempts exhausted--> Failed
//! ```
//!
//! Transport failures never reach the poll loop feeding the subscription.
//! Updates that arrive while reconnecting queue in the subscription; a
//! subscriber that falls too far behind skips ahead, which is lossless
//! because every snapshot carries the full log state.

use super::sync::{LogSubscription, LogUpdate};
use crate::config::ObserverConfig;
use crate::state_machine::RunPhase;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("observer disconnected: {0}")]
    Disconnected(String),
    #[error("observer rejected update: {0}")]
    Rejected(String),
}

/// Push channel to one observer (a websocket, an SSE response, a terminal)
#[async_trait]
pub trait ObserverTransport: Send {
    async fn send(&mut self, update: &LogUpdate) -> Result<(), TransportError>;

    /// Re-establish the channel after a failed send
    async fn reconnect(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnection gave up; the subscription has been dropped
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting ({attempt})"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Bounded exponential backoff between reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Delay before the given 1-based attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl From<&ObserverConfig> for BackoffPolicy {
    fn from(config: &ObserverConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ObserverConfig::default())
    }
}

/// How forwarding ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The run finished and the final update was delivered
    Completed(RunPhase),
    /// The stream closed without a completion message (run deleted, say)
    StreamClosed,
    /// Reconnection gave up after this many attempts
    ObserverLost { attempts: u32 },
}

/// Deliver every update of `subscription` to `transport` until the run
/// completes, the stream closes, or the observer is lost.
pub async fn forward_to_observer<T: ObserverTransport>(
    mut subscription: LogSubscription,
    transport: &mut T,
    policy: &BackoffPolicy,
    state: &watch::Sender<ConnectionState>,
) -> ForwardOutcome {
    let run_id = subscription.run_id();
    state.send_replace(ConnectionState::Connected);

    while let Some(update) = subscription.recv().await {
        if let Err(e) = transport.send(&update).await {
            warn!(%run_id, error = %e, "Observer send failed");
            if !redeliver(transport, &update, policy, state).await {
                state.send_replace(ConnectionState::Failed);
                warn!(%run_id, attempts = policy.max_attempts, "❌ Observer connection lost");
                return ForwardOutcome::ObserverLost {
                    attempts: policy.max_attempts,
                };
            }
        }

        if let LogUpdate::Completed { phase, .. } = update {
            debug!(%run_id, %phase, "Log stream delivered to completion");
            return ForwardOutcome::Completed(phase);
        }
    }

    ForwardOutcome::StreamClosed
}

/// Reconnect with backoff and resend `update`; false once attempts are exhausted.
async fn redeliver<T: ObserverTransport>(
    transport: &mut T,
    update: &LogUpdate,
    policy: &BackoffPolicy,
    state: &watch::Sender<ConnectionState>,
) -> bool {
    for attempt in 1..=policy.max_attempts {
        state.send_replace(ConnectionState::Reconnecting { attempt });
        let delay = policy.delay(attempt);
        debug!(attempt, ?delay, "Reconnecting observer");
        tokio::time::sleep(delay).await;

        let result = match transport.reconnect().await {
            Ok(()) => transport.send(update).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                state.send_replace(ConnectionState::Connected);
                info!(attempt, "🔌 Observer reconnected");
                return true;
            }
            Err(e) => debug!(attempt, error = %e, "Observer reconnect attempt failed"),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    /// Fails the first `failing_sends` sends and the first `failing_reconnects` reconnects
    #[derive(Default)]
    struct ScriptedTransport {
        failing_sends: usize,
        failing_reconnects: usize,
        reconnects: usize,
        delivered: Vec<LogUpdate>,
    }

    #[async_trait]
    impl ObserverTransport for ScriptedTransport {
        async fn send(&mut self, update: &LogUpdate) -> Result<(), TransportError> {
            if self.failing_sends > 0 {
                self.failing_sends -= 1;
                return Err(TransportError::Disconnected("socket closed".to_string()));
            }
            self.delivered.push(update.clone());
            Ok(())
        }

        async fn reconnect(&mut self) -> Result<(), TransportError> {
            self.reconnects += 1;
            if self.failing_reconnects > 0 {
                self.failing_reconnects -= 1;
                return Err(TransportError::Disconnected("still down".to_string()));
            }
            Ok(())
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(250),
            max_attempts: 3,
        }
    }

    fn snapshot(run_id: Uuid, bytes: usize) -> LogUpdate {
        LogUpdate::Snapshot {
            run_id,
            run_phase: RunPhase::Running,
            entries: Vec::new(),
            total_bytes: bytes,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(250));
        assert_eq!(policy.delay(40), Duration::from_millis(250));
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(
            ConnectionState::Reconnecting { attempt: 2 }.to_string(),
            "reconnecting (2)"
        );
        assert_eq!(ConnectionState::Failed.to_string(), "failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_and_redelivers() {
        let run_id = Uuid::new_v4();
        let (tx, rx) = broadcast::channel(8);
        tx.send(snapshot(run_id, 10)).unwrap();
        tx.send(LogUpdate::Completed {
            run_id,
            phase: RunPhase::Succeeded,
        })
        .unwrap();

        let mut transport = ScriptedTransport {
            failing_sends: 1,
            failing_reconnects: 1,
            ..Default::default()
        };
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        let outcome = forward_to_observer(
            LogSubscription::new(run_id, rx, None),
            &mut transport,
            &policy(),
            &state_tx,
        )
        .await;

        assert_eq!(outcome, ForwardOutcome::Completed(RunPhase::Succeeded));
        assert_eq!(transport.reconnects, 2);
        assert_eq!(transport.delivered.len(), 2);
        assert_eq!(transport.delivered[0], snapshot(run_id, 10));
        assert_eq!(*state_rx.borrow(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let run_id = Uuid::new_v4();
        let (tx, rx) = broadcast::channel(8);
        tx.send(snapshot(run_id, 1)).unwrap();

        let mut transport = ScriptedTransport {
            failing_sends: 1,
            failing_reconnects: usize::MAX,
            ..Default::default()
        };
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);

        let started = tokio::time::Instant::now();
        let outcome = forward_to_observer(
            LogSubscription::new(run_id, rx, None),
            &mut transport,
            &policy(),
            &state_tx,
        )
        .await;

        assert_eq!(outcome, ForwardOutcome::ObserverLost { attempts: 3 });
        assert_eq!(*state_rx.borrow(), ConnectionState::Failed);
        assert_eq!(transport.reconnects, 3);
        // 100ms + 200ms + 250ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(550));
        // dropping the subscription detached it from the stream
        assert_eq!(tx.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_stream_ends_forwarding() {
        let run_id = Uuid::new_v4();
        let (tx, rx) = broadcast::channel(8);
        drop(tx);

        let mut transport = ScriptedTransport::default();
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Connected);
        let outcome = forward_to_observer(
            LogSubscription::new(run_id, rx, None),
            &mut transport,
            &BackoffPolicy::default(),
            &state_tx,
        )
        .await;

        assert_eq!(outcome, ForwardOutcome::StreamClosed);
        assert!(transport.delivered.is_empty());
    }
}
