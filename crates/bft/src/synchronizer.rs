//! Missing-commit catch-up.
//!
//! A node can accept a block header whose committing lockset it never saw,
//! for example after joining late or crossing a partition. The synchronizer
//! fetches the proof from peers: it remembers which peer proposed at which
//! height, requests the lockset from a peer known to hold it (falling back
//! to a broadcast), and blocks in [`Synchronizer::verify_votes`] until the
//! proof is persisted.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use lockstep_messages::Message;
use lockstep_types::{BlockHeader, Hash, Height, Proposal};
use tracing::{debug, trace};

use crate::consensus::ConsensusManager;
use crate::store::StoreError;
use crate::traits::PeerId;

/// Catch-up errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// A lockset was persisted for the block but its quorum names a
    /// different hash.
    #[error("stored lockset quorum {got:?} does not match header {expected}")]
    QuorumMismatch {
        /// The header hash the proof was requested for.
        expected: Hash,
        /// The quorum target actually found.
        got: Option<Hash>,
    },

    /// Reading the persisted proof failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fetches committing locksets the local store is missing.
pub struct Synchronizer {
    retry_interval: Duration,
    // Heights with an outstanding fetch.
    requested: Mutex<HashSet<Height>>,
    // Which peer proposed at which height; those peers hold the data.
    proposal_peers: Mutex<HashMap<Height, PeerId>>,
}

impl Synchronizer {
    pub(crate) fn new(retry_interval: Duration) -> Self {
        Self {
            retry_interval,
            requested: Mutex::new(HashSet::new()),
            proposal_peers: Mutex::new(HashMap::new()),
        }
    }

    /// Record which peer delivered a proposal, so later catch-up can target
    /// a peer that has the data.
    pub(crate) fn on_proposal(&self, proposal: &Proposal, peer: PeerId) {
        let mut peers = self.proposal_peers.lock().expect("lock poisoned");
        peers.insert(proposal.height(), peer);
    }

    /// Ask peers for the committing lockset of `height`. Retries re-send;
    /// the request is idempotent on the receiver.
    pub fn request(&self, cm: &ConsensusManager, height: Height) {
        let fresh = self
            .requested
            .lock()
            .expect("lock poisoned")
            .insert(height);
        if !fresh {
            trace!(height, "re-requesting committing lockset");
        }
        let target = {
            let peers = self.proposal_peers.lock().expect("lock poisoned");
            peers.get(&height).copied()
        };
        match target {
            Some(peer) => {
                debug!(height, %peer, "requesting committing lockset");
                cm.transport().request_precommit_locksets(peer, vec![height]);
            }
            None => {
                debug!(height, "no peer known for height, broadcasting request");
                cm.broadcast(Message::GetPrecommitLockSets(vec![height]));
            }
        }
    }

    /// Mark a height's fetch as satisfied.
    pub(crate) fn satisfied(&self, height: Height) {
        self.requested.lock().expect("lock poisoned").remove(&height);
    }

    /// Block until a committing lockset with quorum on `header` is
    /// persisted, requesting and retrying while it is missing.
    pub fn verify_votes(
        &self,
        cm: &ConsensusManager,
        header: &BlockHeader,
    ) -> Result<(), SyncError> {
        let blockhash = header.hash();
        loop {
            if let Some(lockset) = cm.store().precommit_lockset(&blockhash)? {
                return match lockset.has_quorum() {
                    Some(hash) if hash == blockhash => {
                        self.satisfied(header.number);
                        Ok(())
                    }
                    got => Err(SyncError::QuorumMismatch {
                        expected: blockhash,
                        got,
                    }),
                };
            }
            debug!(
                height = header.number,
                blockhash = %blockhash,
                "commit lockset missing, syncing with peers"
            );
            self.request(cm, header.number);
            std::thread::sleep(self.retry_interval);
        }
    }
}

impl std::fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synchronizer")
            .field(
                "in_flight",
                &self.requested.lock().expect("lock poisoned").len(),
            )
            .finish()
    }
}
