//! Publish acknowledgement tracking.
//!
//! Every `["EVENT", ...]` sent to a relay registers a waiter keyed by
//! (relay, event id). The relay's `["OK", id, accepted, message]` resolves it;
//! the pool resolves leftovers with `PublishTimeout` or `PoolClosed`.

use crate::error::ClientError;
use crate::relay_url::RelayUrl;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

/// A relay's answer to a published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayAck {
    /// The relay stored (or already had) the event
    pub accepted: bool,
    /// Machine-readable prefix and text, e.g. `"duplicate: already have this event"`
    pub message: Option<String>,
}

/// Per-relay results of one publish call.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub event_id: String,
    pub results: HashMap<RelayUrl, Result<RelayAck, ClientError>>,
}

impl PublishOutcome {
    /// Relays that acknowledged with `accepted = true`.
    pub fn accepted(&self) -> Vec<&RelayUrl> {
        self.results
            .iter()
            .filter(|(_, result)| matches!(result, Ok(ack) if ack.accepted))
            .map(|(url, _)| url)
            .collect()
    }

    /// Relays that answered but refused the event.
    pub fn rejected(&self) -> Vec<&RelayUrl> {
        self.results
            .iter()
            .filter(|(_, result)| matches!(result, Ok(ack) if !ack.accepted))
            .map(|(url, _)| url)
            .collect()
    }

    /// Relays that never answered (timeout, not connected, closed).
    pub fn failed(&self) -> Vec<&RelayUrl> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_err())
            .map(|(url, _)| url)
            .collect()
    }

    pub fn result(&self, relay: &RelayUrl) -> Option<&Result<RelayAck, ClientError>> {
        self.results.get(relay)
    }

    pub fn satisfies(&self, policy: AckPolicy) -> bool {
        policy.is_satisfied(self.accepted().len(), self.results.len())
    }
}

/// How many acceptances make a publish successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// At least one relay accepted
    #[default]
    Any,
    /// Every targeted relay accepted
    All,
    /// Strictly more than half of the targeted relays accepted
    Quorum,
}

impl AckPolicy {
    pub fn is_satisfied(self, accepted: usize, total: usize) -> bool {
        match self {
            AckPolicy::Any => accepted > 0,
            AckPolicy::All => total > 0 && accepted == total,
            AckPolicy::Quorum => accepted * 2 > total,
        }
    }
}

type AckSender = oneshot::Sender<Result<RelayAck, ClientError>>;

#[derive(Default)]
pub(crate) struct Publisher {
    pending: Mutex<HashMap<(RelayUrl, String), Vec<AckSender>>>,
}

impl Publisher {
    pub(crate) fn register(
        &self,
        relay: &RelayUrl,
        event_id: &str,
    ) -> oneshot::Receiver<Result<RelayAck, ClientError>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .entry((relay.clone(), event_id.to_string()))
            .or_default()
            .push(tx);
        rx
    }

    /// Apply an OK frame. False when nobody was waiting for it.
    pub(crate) fn resolve(&self, relay: &RelayUrl, event_id: &str, ack: RelayAck) -> bool {
        let waiters = self
            .pending
            .lock()
            .remove(&(relay.clone(), event_id.to_string()));
        match waiters {
            Some(waiters) => {
                for tx in waiters {
                    let _ = tx.send(Ok(ack.clone()));
                }
                true
            }
            None => {
                debug!("Unsolicited OK for {} from {}", event_id, relay);
                false
            }
        }
    }

    /// Forget waiters whose receiver is gone (timed out or cancelled).
    pub(crate) fn forget(&self, relay: &RelayUrl, event_id: &str) {
        let mut pending = self.pending.lock();
        let key = (relay.clone(), event_id.to_string());
        if let Some(waiters) = pending.get_mut(&key) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                pending.remove(&key);
            }
        }
    }

    /// Someone is still waiting for an OK from `relay`.
    pub(crate) fn has_pending(&self, relay: &RelayUrl) -> bool {
        self.pending.lock().keys().any(|(url, _)| url == relay)
    }

    /// Resolve everything pending on `relay` with `error`.
    pub(crate) fn fail_relay(&self, relay: &RelayUrl, error: ClientError) {
        let drained: Vec<AckSender> = {
            let mut pending = self.pending.lock();
            let keys: Vec<(RelayUrl, String)> = pending
                .keys()
                .filter(|(url, _)| url == relay)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key))
                .flatten()
                .collect()
        };
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub(crate) fn fail_all(&self, error: ClientError) {
        let drained: Vec<AckSender> = self.pending.lock().drain().flat_map(|(_, v)| v).collect();
        for tx in drained {
            let _ = tx.send(Err(error.clone()));
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay(host: &str) -> RelayUrl {
        RelayUrl::parse(&format!("wss://{}", host)).unwrap()
    }

    #[test]
    fn test_ack_policies() {
        assert!(AckPolicy::Any.is_satisfied(1, 3));
        assert!(!AckPolicy::Any.is_satisfied(0, 3));
        assert!(AckPolicy::All.is_satisfied(3, 3));
        assert!(!AckPolicy::All.is_satisfied(2, 3));
        assert!(!AckPolicy::All.is_satisfied(0, 0));
        assert!(AckPolicy::Quorum.is_satisfied(2, 3));
        assert!(!AckPolicy::Quorum.is_satisfied(2, 4));
        assert!(AckPolicy::Quorum.is_satisfied(3, 4));
    }

    #[tokio::test]
    async fn test_resolve_only_matching_relay() {
        let publisher = Publisher::default();
        let rx_a = publisher.register(&relay("a.example"), "e1");
        let mut rx_b = publisher.register(&relay("b.example"), "e1");

        let ack = RelayAck {
            accepted: true,
            message: None,
        };
        assert!(publisher.resolve(&relay("a.example"), "e1", ack.clone()));
        assert!(!publisher.resolve(&relay("a.example"), "e1", ack.clone()));

        assert_eq!(rx_a.await.unwrap(), Ok(ack));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(publisher.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_fail_relay_and_forget() {
        let publisher = Publisher::default();
        let rx_a = publisher.register(&relay("a.example"), "e1");
        let rx_b = publisher.register(&relay("b.example"), "e1");

        assert!(publisher.has_pending(&relay("a.example")));
        publisher.fail_relay(&relay("a.example"), ClientError::PoolClosed);
        assert_eq!(rx_a.await.unwrap(), Err(ClientError::PoolClosed));
        assert!(!publisher.has_pending(&relay("a.example")));
        assert!(publisher.has_pending(&relay("b.example")));

        drop(rx_b);
        publisher.forget(&relay("b.example"), "e1");
        assert_eq!(publisher.pending_len(), 0);
    }

    #[test]
    fn test_outcome_partitions() {
        let mut results = HashMap::new();
        results.insert(
            relay("a.example"),
            Ok(RelayAck {
                accepted: true,
                message: None,
            }),
        );
        results.insert(
            relay("b.example"),
            Ok(RelayAck {
                accepted: false,
                message: Some("blocked: spam".to_string()),
            }),
        );
        results.insert(
            relay("c.example"),
            Err(ClientError::PublishTimeout(std::time::Duration::from_secs(1))),
        );
        let outcome = PublishOutcome {
            event_id: "e1".to_string(),
            results,
        };

        assert_eq!(outcome.accepted(), vec![&relay("a.example")]);
        assert_eq!(outcome.rejected(), vec![&relay("b.example")]);
        assert_eq!(outcome.failed(), vec![&relay("c.example")]);
        assert!(outcome.satisfies(AckPolicy::Any));
        assert!(!outcome.satisfies(AckPolicy::Quorum));
    }
}
