//! Liveness heartbeats
//!
//! Every node writes its timestamp into `healthcheck` on each tick. The
//! bucket grows with every node that ever joined, so once per scrub period
//! the leader of the live nodes drops it and everyone re-announces.

use crate::config::AliveConfig;
use crate::error::NodeError;
use crate::node::{NetworkService, NodeContext};
use crate::protocol::HEALTHCHECK;
use crate::services::leader::leader;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshvpn_ledger::Ledger;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct AliveService {
    config: AliveConfig,
}

impl AliveService {
    pub fn new(config: AliveConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NetworkService for AliveService {
    fn name(&self) -> &str {
        "alive"
    }

    async fn run(&self, ctx: NodeContext) -> Result<(), NodeError> {
        let AliveConfig { announce, scrub, max } = self.config.clone();
        let last_scrub = Arc::new(Mutex::new(Instant::now()));
        let local = ctx.peer_id.to_string();
        let ledger = ctx.ledger.clone();

        ctx.ledger.announce(ctx.cancel.clone(), announce, move || {
            let now = Utc::now().to_rfc3339();
            if let Err(e) = ledger.add_value(HEALTHCHECK, &local, &now) {
                tracing::warn!("Heartbeat failed: {}", e);
            }

            scrub_if_due(&ledger, &local, &mut last_scrub.lock(), scrub, max);
            async {}
        });
        Ok(())
    }
}

/// Drop `healthcheck` once `scrub` has passed since `mark` and we lead the
/// live nodes. Every node resets its mark so only one scrub happens per
/// period. Returns whether this node scrubbed.
fn scrub_if_due(ledger: &Ledger, local: &str, mark: &mut Instant, scrub: Duration, max: Duration) -> bool {
    let nodes = available_nodes(ledger, max);
    if nodes.is_empty() || mark.elapsed() < scrub {
        return false;
    }
    *mark = Instant::now();
    if leader(&nodes).as_deref() != Some(local) {
        return false;
    }
    tracing::debug!("Scrubbing {} healthchecks", nodes.len());
    if let Err(e) = ledger.delete_bucket(HEALTHCHECK) {
        tracing::warn!("Scrub failed: {}", e);
        return false;
    }
    true
}

/// Peers whose last heartbeat is younger than `max`, sorted
pub fn available_nodes(ledger: &Ledger, max: Duration) -> Vec<String> {
    let Some(bucket) = ledger.bucket(HEALTHCHECK) else {
        return Vec::new();
    };
    let now = Utc::now();
    let max = chrono::Duration::from_std(max).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));

    // BTreeMap iteration keeps the result sorted
    bucket
        .into_iter()
        .filter(|(_, value)| {
            value
                .as_string()
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .and_then(|seen| seen.with_timezone(&Utc).checked_add_signed(max))
                .is_some_and(|deadline| deadline > now)
        })
        .map(|(peer, _)| peer)
        .collect()
}
