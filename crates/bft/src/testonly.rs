//! In-memory collaborators and a multi-node harness for tests.
//!
//! The [`Hub`] delivers broadcasts synchronously on the calling thread,
//! which makes multi-node scenarios deterministic: a tick of every node in
//! turn plays out one full exchange. Per-link cuts simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex, Weak};

use lockstep_messages::Message;
use lockstep_types::{
    Address, Block, BlockHeader, Height, PrecommitLockSet, SecretKey, Transaction,
};

use crate::clock::ManualClock;
use crate::config::BftConfig;
use crate::consensus::ConsensusManager;
use crate::store::StoreError;
use crate::traits::{Chain, KvStore, PeerId, TransactionPool, Transport};

/// In-memory byte store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.lock().expect("lock poisoned").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .insert(key.to_vec(), value);
        Ok(())
    }

    fn put_batch(&self, batch: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().expect("lock poisoned");
        for (key, value) in batch {
            entries.insert(key, value);
        }
        Ok(())
    }
}

/// In-memory linear chain.
#[derive(Debug)]
pub struct MemoryChain {
    blocks: Mutex<Vec<Block>>,
}

impl MemoryChain {
    /// Create a chain holding only the genesis block.
    pub fn new(genesis: Block) -> Self {
        Self {
            blocks: Mutex::new(vec![genesis]),
        }
    }

    /// Append a committed block as the new head.
    pub fn import(&self, block: Block) {
        let mut blocks = self.blocks.lock().expect("lock poisoned");
        assert_eq!(
            block.parent_hash(),
            blocks.last().expect("chain has genesis").hash(),
            "imported block must extend the head"
        );
        blocks.push(block);
    }
}

impl Chain for MemoryChain {
    fn current_block(&self) -> Block {
        self.blocks
            .lock()
            .expect("lock poisoned")
            .last()
            .expect("chain has genesis")
            .clone()
    }

    fn genesis(&self) -> Block {
        self.blocks.lock().expect("lock poisoned")[0].clone()
    }

    fn block_by_number(&self, number: Height) -> Option<Block> {
        self.blocks
            .lock()
            .expect("lock poisoned")
            .get(number as usize)
            .cloned()
    }
}

/// In-memory transaction pool.
#[derive(Debug, Default)]
pub struct MemoryPool {
    pending: Mutex<Vec<Transaction>>,
}

impl MemoryPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pending transaction.
    pub fn submit(&self, tx: Transaction) {
        self.pending.lock().expect("lock poisoned").push(tx);
    }
}

impl TransactionPool for MemoryPool {
    fn pending(&self) -> Vec<Transaction> {
        self.pending.lock().expect("lock poisoned").clone()
    }
}

/// Synchronous in-process message hub with per-link cuts.
#[derive(Default)]
pub struct Hub {
    nodes: Mutex<Vec<(PeerId, Weak<ConsensusManager>)>>,
    cuts: Mutex<HashSet<(PeerId, PeerId)>>,
    sent: Mutex<Vec<(PeerId, Message)>>,
}

impl Hub {
    /// Create an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node to the hub.
    pub fn register(&self, id: PeerId, node: &Arc<ConsensusManager>) {
        self.nodes
            .lock()
            .expect("lock poisoned")
            .push((id, Arc::downgrade(node)));
    }

    /// The transport endpoint for one node.
    pub fn endpoint(self: &Arc<Self>, id: PeerId) -> Arc<HubTransport> {
        Arc::new(HubTransport {
            hub: self.clone(),
            id,
        })
    }

    /// Stop delivering messages from `from` to `to`.
    pub fn cut(&self, from: PeerId, to: PeerId) {
        self.cuts.lock().expect("lock poisoned").insert((from, to));
    }

    /// Stop delivering anything to or from `id`.
    pub fn isolate(&self, id: PeerId) {
        let peers: Vec<PeerId> = {
            let nodes = self.nodes.lock().expect("lock poisoned");
            nodes.iter().map(|(peer, _)| *peer).collect()
        };
        let mut cuts = self.cuts.lock().expect("lock poisoned");
        for peer in peers {
            cuts.insert((id, peer));
            cuts.insert((peer, id));
        }
    }

    /// Remove every cut.
    pub fn heal_all(&self) {
        self.cuts.lock().expect("lock poisoned").clear();
    }

    /// Number of messages emitted through the hub so far.
    pub fn message_count(&self) -> usize {
        self.sent.lock().expect("lock poisoned").len()
    }

    /// Messages emitted through the hub so far.
    pub fn messages(&self) -> Vec<(PeerId, Message)> {
        self.sent.lock().expect("lock poisoned").clone()
    }

    fn is_cut(&self, from: PeerId, to: PeerId) -> bool {
        self.cuts.lock().expect("lock poisoned").contains(&(from, to))
    }

    fn peers(&self) -> Vec<(PeerId, Weak<ConsensusManager>)> {
        self.nodes.lock().expect("lock poisoned").clone()
    }

    fn record(&self, from: PeerId, message: &Message) {
        self.sent
            .lock()
            .expect("lock poisoned")
            .push((from, message.clone()));
    }
}

/// One node's view of the [`Hub`].
pub struct HubTransport {
    hub: Arc<Hub>,
    id: PeerId,
}

impl Transport for HubTransport {
    fn broadcast(&self, message: Message) {
        self.hub.record(self.id, &message);
        // Snapshot first: delivery re-enters the hub when a peer replies.
        for (peer, node) in self.hub.peers() {
            if peer == self.id || self.hub.is_cut(self.id, peer) {
                continue;
            }
            if let Some(node) = node.upgrade() {
                node.handle_message(message.clone(), self.id);
            }
        }
    }

    fn send_precommit_locksets(&self, peer: PeerId, locksets: Vec<PrecommitLockSet>) {
        let message = Message::PrecommitLockSets(locksets);
        self.hub.record(self.id, &message);
        if self.hub.is_cut(self.id, peer) {
            return;
        }
        let target = self
            .hub
            .peers()
            .into_iter()
            .find(|(id, _)| *id == peer)
            .and_then(|(_, node)| node.upgrade());
        if let Some(node) = target {
            node.handle_message(message, self.id);
        }
    }

    fn request_precommit_locksets(&self, peer: PeerId, heights: Vec<Height>) {
        let message = Message::GetPrecommitLockSets(heights);
        self.hub.record(self.id, &message);
        if self.hub.is_cut(self.id, peer) {
            return;
        }
        let target = self
            .hub
            .peers()
            .into_iter()
            .find(|(id, _)| *id == peer)
            .and_then(|(_, node)| node.upgrade());
        if let Some(node) = target {
            node.handle_message(message, self.id);
        }
    }
}

/// A deterministic genesis block shared by every node in a test net.
pub fn genesis_block() -> Block {
    Block::new(
        BlockHeader {
            number: 0,
            parent_hash: lockstep_types::Hash::ZERO,
            proposer: Address::default(),
            timestamp: 0,
            extra: b"genesis".to_vec(),
        },
        vec![],
    )
}

/// A candidate block extending the chain head, sealed by `proposer`.
pub fn make_candidate(chain: &MemoryChain, proposer: Address) -> Block {
    let head = chain.current_block();
    Block::new(
        BlockHeader {
            number: head.number() + 1,
            parent_hash: head.hash(),
            proposer,
            timestamp: 1_000 * (head.number() + 1),
            extra: vec![],
        },
        vec![Transaction(vec![head.number() as u8 + 1])],
    )
}

/// One validator node wired to the hub.
pub struct TestNode {
    /// Hub address of this node.
    pub id: PeerId,
    /// Validator address of this node.
    pub address: Address,
    /// Raw signing key bytes, for rebuilding the node (restart tests).
    pub key_bytes: Vec<u8>,
    /// The engine under test.
    pub cm: Arc<ConsensusManager>,
    /// This node's chain store.
    pub chain: Arc<MemoryChain>,
    /// This node's transaction pool.
    pub pool: Arc<MemoryPool>,
    /// This node's persistent store.
    pub db: Arc<MemoryStore>,
}

impl TestNode {
    /// Start the node on the next height with a fresh candidate block.
    /// Returns the channel the committed block arrives on.
    pub fn begin(&self) -> Receiver<Block> {
        let candidate = make_candidate(&self.chain, self.address);
        let (found, receiver) = sync_channel(1);
        assert!(self.cm.begin_height(candidate, found));
        receiver
    }

    /// Import a committed block and start on the following height.
    pub fn advance(&self, block: Block) -> Receiver<Block> {
        self.chain.import(block);
        self.begin()
    }
}

/// A network of validator nodes over one [`Hub`] and one shared manual
/// clock.
pub struct TestNet {
    /// The message hub.
    pub hub: Arc<Hub>,
    /// Shared test clock.
    pub clock: Arc<ManualClock>,
    /// Nodes in canonical validator order.
    pub nodes: Vec<TestNode>,
}

impl TestNet {
    /// Build a net of `n` honest validators.
    pub fn new(n: usize) -> Self {
        Self::new_with(n, |_, _| {})
    }

    /// Build a net of `n` validators, letting the test adjust each node's
    /// configuration before construction.
    pub fn new_with(n: usize, customize: impl Fn(usize, &mut BftConfig)) -> Self {
        let keys: Vec<SecretKey> = (0..n).map(|_| SecretKey::generate()).collect();
        let validators: Vec<Address> = keys.iter().map(|k| k.address()).collect();
        let hub = Hub::new();
        let clock = Arc::new(ManualClock::new());

        let nodes = keys
            .into_iter()
            .enumerate()
            .map(|(i, key)| {
                let id = PeerId(i as u64);
                let address = key.address();
                let key_bytes = key.to_bytes();
                let chain = Arc::new(MemoryChain::new(genesis_block()));
                let pool = Arc::new(MemoryPool::new());
                let db = Arc::new(MemoryStore::new());
                let mut config = BftConfig::new(validators.clone(), key);
                config.sync_retry_interval = std::time::Duration::from_millis(1);
                customize(i, &mut config);
                let cm = Arc::new(
                    ConsensusManager::new(
                        config,
                        chain.clone(),
                        pool.clone(),
                        hub.endpoint(id),
                        db.clone(),
                        clock.clone(),
                    )
                    .expect("engine construction"),
                );
                hub.register(id, &cm);
                TestNode {
                    id,
                    address,
                    key_bytes,
                    cm,
                    chain,
                    pool,
                    db,
                }
            })
            .collect();

        Self { hub, clock, nodes }
    }

    /// Start every node on the next height.
    pub fn begin_all(&self) -> Vec<Receiver<Block>> {
        self.nodes.iter().map(TestNode::begin).collect()
    }

    /// One driver tick on every node, in order.
    pub fn tick(&self) {
        for node in &self.nodes {
            node.cm.process();
        }
    }

    /// One driver tick on a subset of nodes, in order.
    pub fn tick_only(&self, indices: &[usize]) {
        for &i in indices {
            self.nodes[i].cm.process();
        }
    }

    /// Tick until `done` holds or `max_ticks` elapse; returns whether `done`
    /// held.
    pub fn run_until(&self, max_ticks: usize, mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..max_ticks {
            if done() {
                return true;
            }
            self.tick();
        }
        done()
    }

    /// Index into `nodes` of the elected proposer for `(height, round)`.
    pub fn proposer_index(&self, height: Height, round: u64) -> usize {
        let proposer = self.nodes[0].cm.contract().proposer(height, round);
        self.nodes
            .iter()
            .position(|node| node.address == proposer)
            .expect("proposer is one of the nodes")
    }
}
