//! Leadership tracking and membership reconciliation.
//!
//! A watcher follows `Raft::metrics()` and flips the local leader flag. While
//! this replica leads, a background loop keeps the voter set equal to the
//! configured peers.

use crate::error::{RaftNodeError, Result};
use crate::types::{DepotNodeId, DepotRaft};
use openraft::BasicNode;
use openraft::ServerState;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{info, warn};

const RAFT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

struct Reconciler {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Leadership {
    raft: DepotRaft,
    local_id: DepotNodeId,
    desired: BTreeMap<DepotNodeId, BasicNode>,
    reconcile_interval: Duration,
    is_leader: AtomicBool,
    reconciler: Mutex<Option<Reconciler>>,
}

impl Leadership {
    /// `desired` is the full configured membership, local node included.
    pub fn new(
        raft: DepotRaft,
        local_id: DepotNodeId,
        desired: BTreeMap<DepotNodeId, BasicNode>,
        reconcile_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            raft,
            local_id,
            desired,
            reconcile_interval,
            is_leader: AtomicBool::new(false),
            reconciler: Mutex::new(None),
        })
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Follows raft metrics until the raft instance shuts down.
    pub fn spawn_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut metrics = this.raft.metrics();
            loop {
                let leading = {
                    let current = metrics.borrow();
                    current.state == ServerState::Leader
                        && current.current_leader == Some(this.local_id)
                };

                if leading && !this.is_leader() {
                    this.on_leader_start().await;
                } else if !leading && this.is_leader() {
                    this.on_leader_stop().await;
                }

                if metrics.changed().await.is_err() {
                    break;
                }
            }

            if this.is_leader() {
                this.on_leader_stop().await;
            }
        })
    }

    pub async fn on_leader_start(self: &Arc<Self>) {
        let mut reconciler = self.reconciler.lock().await;
        self.is_leader.store(true, Ordering::Release);
        info!("node {} became leader", self.local_id);

        if reconciler.is_some() {
            return;
        }

        let (stop, mut stopped) = watch::channel(false);
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(this.reconcile_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stopped.changed() => break,
                }
                if *stopped.borrow() {
                    break;
                }

                if let Err(error) = reconcile_once(&this.raft, &this.desired).await {
                    warn!("membership reconciliation failed: {}", error);
                }
            }
        });

        *reconciler = Some(Reconciler { stop, handle });
    }

    pub async fn on_leader_stop(&self) {
        let mut reconciler = self.reconciler.lock().await;
        self.is_leader.store(false, Ordering::Release);
        info!("node {} stepped down", self.local_id);

        if let Some(Reconciler { stop, handle }) = reconciler.take() {
            let _ = stop.send(true);
            if let Err(error) = handle.await {
                warn!("reconciliation loop exited abnormally: {}", error);
            }
        }
    }
}

/// One reconciliation round. Returns whether membership was changed.
pub async fn reconcile_once(
    raft: &DepotRaft,
    desired: &BTreeMap<DepotNodeId, BasicNode>,
) -> Result<bool> {
    let membership = {
        let metrics = raft.metrics();
        let current = metrics.borrow();
        current.membership_config.membership().clone()
    };

    let mut changed = false;
    for (id, node) in desired {
        if membership.get_node(id).is_some() {
            continue;
        }

        timeout(RAFT_CALL_TIMEOUT, raft.add_learner(*id, node.clone(), false))
            .await
            .map_err(|_| RaftNodeError::Raft(format!("add_learner {} timed out", id)))?
            .map_err(|error| RaftNodeError::Raft(format!("add_learner {}: {}", id, error)))?;
        info!("added learner {} at {}", id, node.addr);
        changed = true;
    }

    let voters: BTreeSet<DepotNodeId> = membership.voter_ids().collect();
    let wanted: BTreeSet<DepotNodeId> = desired.keys().copied().collect();
    if voters != wanted {
        timeout(
            RAFT_CALL_TIMEOUT,
            raft.change_membership(wanted.clone(), false),
        )
        .await
        .map_err(|_| RaftNodeError::Raft("change_membership timed out".to_string()))?
        .map_err(|error| RaftNodeError::Raft(format!("change_membership: {}", error)))?;
        info!("voters changed from {:?} to {:?}", voters, wanted);
        changed = true;
    }

    Ok(changed)
}
