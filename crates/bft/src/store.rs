//! Persistent consensus state.
//!
//! Exactly two key families are persisted: the lockset that committed the
//! latest block (replayed on restart) and one lockset per committed block
//! hash (served to catching-up peers). Both commit-path writes go through a
//! single atomic batch so a commit lockset can never exist without the
//! matching "last committing" pointer.

use std::sync::Arc;

use lockstep_types::{Hash, PrecommitLockSet};
use tracing::debug;

use crate::traits::KvStore;

/// Key of the lockset that committed the latest block.
pub const LAST_COMMITTING_LOCKSET_KEY: &[u8] = b"last_committing_lockset";

fn precommit_lockset_key(blockhash: &Hash) -> Vec<u8> {
    let mut key = b"precommitLockset:".to_vec();
    key.extend_from_slice(hex::encode(blockhash.as_bytes()).as_bytes());
    key
}

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing store failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A persisted value did not decode.
    #[error("corrupt stored value under {key}: {reason}")]
    Corrupt {
        /// Key the value was read from.
        key: String,
        /// Decoder error.
        reason: String,
    },
}

/// Typed wrapper over the byte store for the two persistent key families.
#[derive(Clone)]
pub struct ConsensusStore {
    db: Arc<dyn KvStore>,
}

impl ConsensusStore {
    /// Wrap a byte store.
    pub fn new(db: Arc<dyn KvStore>) -> Self {
        Self { db }
    }

    /// Load the lockset that committed the latest block, if any.
    pub fn last_committing_lockset(&self) -> Result<Option<PrecommitLockSet>, StoreError> {
        self.load(LAST_COMMITTING_LOCKSET_KEY)
    }

    /// Persist the lockset that committed the latest block.
    pub fn store_last_committing_lockset(
        &self,
        lockset: &PrecommitLockSet,
    ) -> Result<(), StoreError> {
        self.db
            .put(LAST_COMMITTING_LOCKSET_KEY, encode(lockset))
    }

    /// Load the committing lockset of a block, if persisted.
    pub fn precommit_lockset(&self, blockhash: &Hash) -> Result<Option<PrecommitLockSet>, StoreError> {
        self.load(&precommit_lockset_key(blockhash))
    }

    /// Persist the committing lockset of a block.
    pub fn store_precommit_lockset(
        &self,
        blockhash: &Hash,
        lockset: &PrecommitLockSet,
    ) -> Result<(), StoreError> {
        self.db.put(&precommit_lockset_key(blockhash), encode(lockset))
    }

    /// Persist a commit: the block's lockset and the "last committing"
    /// pointer, atomically.
    pub fn store_commit(
        &self,
        blockhash: &Hash,
        lockset: &PrecommitLockSet,
    ) -> Result<(), StoreError> {
        let bytes = encode(lockset);
        debug!(%blockhash, "persisting commit lockset");
        self.db.put_batch(vec![
            (precommit_lockset_key(blockhash), bytes.clone()),
            (LAST_COMMITTING_LOCKSET_KEY.to_vec(), bytes),
        ])
    }

    fn load(&self, key: &[u8]) -> Result<Option<PrecommitLockSet>, StoreError> {
        let Some(bytes) = self.db.get(key)? else {
            return Ok(None);
        };
        let lockset = bincode::deserialize(&bytes).map_err(|e| StoreError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })?;
        Ok(Some(lockset))
    }
}

impl std::fmt::Debug for ConsensusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusStore").finish_non_exhaustive()
    }
}

fn encode(lockset: &PrecommitLockSet) -> Vec<u8> {
    bincode::serialize(lockset).expect("canonical encoding of an in-memory value cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testonly::MemoryStore;
    use crate::traits::KvStore as _;
    use lockstep_types::{PrecommitVote, SecretKey};

    fn lockset(hash: Hash) -> PrecommitLockSet {
        let key = SecretKey::generate();
        let mut set = PrecommitLockSet::new(1);
        set.add(PrecommitVote::block(1, 0, hash, &key).unwrap(), false)
            .unwrap();
        set
    }

    #[test]
    fn test_roundtrip() {
        let store = ConsensusStore::new(Arc::new(MemoryStore::new()));
        let hash = Hash::keccak(b"block");
        let set = lockset(hash);

        assert_eq!(store.precommit_lockset(&hash).unwrap(), None);
        store.store_precommit_lockset(&hash, &set).unwrap();
        assert_eq!(store.precommit_lockset(&hash).unwrap(), Some(set));
    }

    #[test]
    fn test_commit_writes_both_keys() {
        let store = ConsensusStore::new(Arc::new(MemoryStore::new()));
        let hash = Hash::keccak(b"block");
        let set = lockset(hash);

        store.store_commit(&hash, &set).unwrap();
        assert_eq!(store.precommit_lockset(&hash).unwrap(), Some(set.clone()));
        assert_eq!(store.last_committing_lockset().unwrap(), Some(set));
    }

    #[test]
    fn test_corrupt_value_is_reported() {
        let db = Arc::new(MemoryStore::new());
        db.put(LAST_COMMITTING_LOCKSET_KEY, vec![0xff]).unwrap();
        let store = ConsensusStore::new(db);
        assert!(matches!(
            store.last_committing_lockset(),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
