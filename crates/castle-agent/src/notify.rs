//! Leader side of the agent notification protocol

use castle_common::keys::{self, STATUS_FAILED_PREFIX, STATUS_SUCCEEDED, STATUS_TRIGGER};
use castle_common::{Error, Result};
use castle_kv::{KvStore, TxnOp, util};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How a round of agent notifications ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOutcome {
    pub succeeded: BTreeSet<String>,
    /// Node to failure reason
    pub failed: BTreeMap<String, String>,
    /// Nodes that did not answer before the deadline
    pub outstanding: BTreeSet<String>,
}

impl AgentOutcome {
    fn record(&mut self, node: &str, status: Option<&str>) {
        self.succeeded.remove(node);
        self.failed.remove(node);
        self.outstanding.remove(node);
        match status {
            Some(STATUS_SUCCEEDED) => {
                self.succeeded.insert(node.to_string());
            }
            Some(s) if s.starts_with(STATUS_FAILED_PREFIX) => {
                let reason = s
                    .strip_prefix(STATUS_FAILED_PREFIX)
                    .unwrap_or_default()
                    .trim_start_matches(':')
                    .trim();
                self.failed.insert(node.to_string(), reason.to_string());
            }
            _ => {
                self.outstanding.insert(node.to_string());
            }
        }
    }
}

/// Smallest strict majority of `n`; zero for no nodes
#[must_use]
pub const fn majority(n: usize) -> usize {
    if n == 0 { 0 } else { n / 2 + 1 }
}

/// Ask `agent` on every node in `nodes` to reconcile
pub async fn trigger_agents(store: &dyn KvStore, nodes: &[String], agent: &str) -> Result<()> {
    if nodes.is_empty() {
        return Ok(());
    }
    let ops = nodes
        .iter()
        .map(|node| TxnOp::set(keys::notify_status(node, agent), STATUS_TRIGGER))
        .collect();
    store.transaction(ops).await?;
    info!("Triggered agent {} on nodes {:?}", agent, nodes);
    Ok(())
}

/// Wait until every notified agent answered or `deadline` passed.
///
/// Fails with `Timeout` (some agents still outstanding) or `External`
/// (agents reported failure) when fewer than `threshold` succeeded.
/// Outstanding agents keep working; they report into the next round.
pub async fn wait_for_agents(
    store: &dyn KvStore,
    nodes: &[String],
    agent: &str,
    threshold: usize,
    deadline: Duration,
) -> Result<AgentOutcome> {
    let until = Instant::now() + deadline;
    let by_key: BTreeMap<String, &str> = nodes
        .iter()
        .map(|node| (keys::notify_status(node, agent), node.as_str()))
        .collect();
    let mut outcome = AgentOutcome::default();

    'rounds: loop {
        let index = store.current_index().await?;
        for (key, node) in &by_key {
            let status = util::get_optional(store, key).await?;
            outcome.record(node, status.as_deref());
        }
        if outcome.outstanding.is_empty() || Instant::now() >= until {
            break;
        }

        let mut watcher = store.watch(keys::NOTIFY, true, Some(index)).await?;
        while !outcome.outstanding.is_empty() {
            match tokio::time::timeout_at(until, watcher.next()).await {
                Err(_) => break 'rounds,
                Ok(Some(Ok(event))) => {
                    if let Some(node) = by_key.get(&event.key) {
                        outcome.record(node, event.value.as_deref());
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!("Watch on agent status broke, re-reading: {}", e);
                    continue 'rounds;
                }
                Ok(None) => continue 'rounds,
            }
        }
        break;
    }

    debug!("Agent {} outcome: {:?}", agent, outcome);
    if outcome.succeeded.len() >= threshold {
        return Ok(outcome);
    }
    let summary = format!(
        "agent {agent}: {} of {} succeeded (need {threshold}), failed {:?}, outstanding {:?}",
        outcome.succeeded.len(),
        nodes.len(),
        outcome.failed,
        outcome.outstanding
    );
    if outcome.outstanding.is_empty() {
        Err(Error::external(summary))
    } else {
        Err(Error::timeout(summary))
    }
}

/// [`trigger_agents`] followed by [`wait_for_agents`]
pub async fn trigger_and_wait(
    store: &dyn KvStore,
    nodes: &[String],
    agent: &str,
    threshold: usize,
    deadline: Duration,
) -> Result<AgentOutcome> {
    trigger_agents(store, nodes, agent).await?;
    wait_for_agents(store, nodes, agent, threshold, deadline).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use castle_kv::MemoryStore;
    use std::sync::Arc;

    fn nodes(ids: &[&str]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_majority() {
        assert_eq!(majority(0), 0);
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 2);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(5), 3);
    }

    #[tokio::test]
    async fn test_wait_collects_answers() {
        let store = Arc::new(MemoryStore::new());
        let ids = nodes(&["a", "b"]);
        trigger_agents(store.as_ref(), &ids, "mon").await.unwrap();
        assert_eq!(
            store.get(&keys::notify_status("a", "mon")).await.unwrap(),
            STATUS_TRIGGER
        );

        let answer = store.clone();
        tokio::spawn(async move {
            answer
                .set(&keys::notify_status("a", "mon"), STATUS_SUCCEEDED, None)
                .await
                .unwrap();
            answer
                .set(&keys::notify_status("b", "mon"), "failed: disk gone", None)
                .await
                .unwrap();
        });

        let outcome = wait_for_agents(store.as_ref(), &ids, "mon", 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.succeeded, BTreeSet::from(["a".to_string()]));
        assert_eq!(outcome.failed["b"], "disk gone");
        assert!(outcome.outstanding.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let store = MemoryStore::new();
        let ids = nodes(&["a", "b", "c"]);
        trigger_agents(&store, &ids, "osd").await.unwrap();
        store
            .set(&keys::notify_status("a", "osd"), STATUS_SUCCEEDED, None)
            .await
            .unwrap();

        let err = wait_for_agents(&store, &ids, "osd", 2, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        // threshold zero never fails, it only bounds the wait
        let outcome = wait_for_agents(&store, &ids, "osd", 0, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome.outstanding.len(), 2);
    }

    #[tokio::test]
    async fn test_all_failed_is_external() {
        let store = MemoryStore::new();
        let ids = nodes(&["a"]);
        store
            .set(&keys::notify_status("a", "rgw"), "failed: boom", None)
            .await
            .unwrap();
        let err = wait_for_agents(&store, &ids, "rgw", 1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::External { .. }));
    }
}
