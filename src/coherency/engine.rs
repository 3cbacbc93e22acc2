//! Coherency Protocol Engine
//!
//! Implements MOESI over the network for every node attached to it.
//!
//! ## Responsibilities
//! - **Reads**: serve hits from the local store; on a miss fetch the line from
//!   the owner (or any sharer), or initialise it from the backing store when
//!   nobody holds it.
//! - **Writes**: write in place when MODIFIED/EXCLUSIVE; otherwise invalidate
//!   every other copy and wait for all acknowledgments before touching local
//!   state. A write that cannot collect every ACK changes nothing locally.
//! - **Inbound messages**: answer READ_REQUEST, give up copies on
//!   INVALIDATE/WRITE_REQUEST, route DATA_RESPONSE/ACK to transactions and
//!   persist WRITEBACK.
//!
//! Initiators of the same line (read miss, write, eviction, migration) are
//! serialized by a per-line async lock. Inbound handlers never take it, which
//! is what lets an initiator hold it while it waits on remote acks.
//!
//! ## Remote engines
//! The directory is authoritative only for nodes hosted by this engine. Peers
//! living on other engines are snooped: a miss with no local holder asks
//! every remote peer for the line, and a write invalidates every remote peer.
//! Two initiators on different engines racing for one line are arbitrated
//! by node id. The lower id answers the other with [`LINE_BUSY`], the higher
//! id gives way and retries its own operation.

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use rand::Rng;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::backing::BackingStore;
use super::cache::CacheLineStore;
use super::directory::{CoherencyDirectory, CoherencyViolation, ViolationKind};
use super::stats::{CoherencyCounters, CoherencyStats};
use super::types::*;
use crate::config::CoherencyConfig;
use crate::error::{CoherencyError, CoherencyResult};
use crate::membership::types::NodeId;
use crate::transaction::{TransactionKind, TransactionManager};
use crate::transport::message::{Message, MessagePayload, MessageType};
use crate::transport::{Transport, handler};

/// Refusal reason of a node whose own operation on the line takes precedence.
pub const LINE_BUSY: &str = "line busy";

/// Told about accesses that reached a line through its write-capable holder.
pub trait AccessObserver: Send + Sync {
    fn remote_access(&self, owner: &NodeId, accessor: &NodeId, address: Address);
}

/// An initiator's claim on a line while it talks to other engines. Dropping
/// it withdraws the claim.
struct PendingLine<'a> {
    pending: &'a DashMap<(NodeId, Address), Option<NodeId>>,
    key: (NodeId, Address),
}

impl PendingLine<'_> {
    /// The node this initiator gave way to, if any.
    fn yielded_to(&self) -> Option<NodeId> {
        self.pending
            .get(&self.key)
            .and_then(|entry| entry.value().clone())
    }
}

impl Drop for PendingLine<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

/// What a peer answered inside a coherency transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoherencyReply {
    Data {
        data: Option<Vec<u8>>,
        version: u64,
    },
    Ack {
        data: Option<Vec<u8>>,
        version: u64,
        error: Option<String>,
    },
}

pub struct ClusterCoherencyEngine {
    config: CoherencyConfig,
    home_node: Option<NodeId>,
    directory: Arc<CoherencyDirectory>,
    cache: CacheLineStore,
    backing: Arc<dyn BackingStore>,
    transactions: TransactionManager<CoherencyReply>,
    endpoints: DashMap<NodeId, Arc<dyn Transport>>,
    line_locks: DashMap<Address, Arc<AsyncMutex<()>>>,
    pending: DashMap<(NodeId, Address), Option<NodeId>>,
    held: DashSet<(NodeId, Address)>,
    departed: DashSet<NodeId>,
    retired_versions: DashMap<Address, u64>,
    observers: RwLock<Vec<Weak<dyn AccessObserver>>>,
    counters: CoherencyCounters,
}

impl ClusterCoherencyEngine {
    pub fn new(config: CoherencyConfig, backing: Arc<dyn BackingStore>) -> Arc<Self> {
        Self::with_directory(config, Arc::new(CoherencyDirectory::new()), backing)
    }

    pub fn with_directory(
        config: CoherencyConfig,
        directory: Arc<CoherencyDirectory>,
        backing: Arc<dyn BackingStore>,
    ) -> Arc<Self> {
        let home_node = config.home_node.as_deref().map(NodeId::from);
        Arc::new(Self {
            config,
            home_node,
            directory,
            cache: CacheLineStore::new(),
            backing,
            transactions: TransactionManager::new(),
            endpoints: DashMap::new(),
            line_locks: DashMap::new(),
            pending: DashMap::new(),
            held: DashSet::new(),
            departed: DashSet::new(),
            retired_versions: DashMap::new(),
            observers: RwLock::new(Vec::new()),
            counters: CoherencyCounters::default(),
        })
    }

    /// Hosts the transport's node on this engine and registers the coherency
    /// message handlers on it.
    pub fn attach_node(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let node = transport.local_node().clone();
        let engine: Weak<Self> = Arc::downgrade(self);

        let coherency_handler = handler(move |message: Message| {
            let engine = engine.clone();
            async move {
                if let Some(engine) = engine.upgrade() {
                    engine.handle_message(message).await;
                }
            }
        });

        for kind in [
            MessageType::ReadRequest,
            MessageType::WriteRequest,
            MessageType::Invalidate,
            MessageType::DataResponse,
            MessageType::Ack,
            MessageType::Writeback,
        ] {
            transport.register_handler(kind, coherency_handler.clone());
        }

        self.departed.remove(&node);
        self.endpoints.insert(node.clone(), transport);
        tracing::info!("Attached node {} to coherency engine", node);
    }

    pub fn observe_accesses(&self, observer: Weak<dyn AccessObserver>) {
        self.observers.write().push(observer);
    }

    pub fn is_attached(&self, node: &NodeId) -> bool {
        self.endpoints.contains_key(node)
    }

    pub fn attached_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.endpoints.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    pub fn directory(&self) -> &Arc<CoherencyDirectory> {
        &self.directory
    }

    pub fn config(&self) -> &CoherencyConfig {
        &self.config
    }

    /// State of `node`'s copy according to its local store.
    pub fn state_of(&self, node: &NodeId, address: Address) -> MoesiState {
        self.cache.state(node, address)
    }

    pub fn cached_line(&self, node: &NodeId, address: Address) -> Option<CacheLine> {
        self.cache.get(node, address)
    }

    pub fn line_count(&self, node: &NodeId) -> usize {
        self.cache.line_count(node)
    }

    pub fn stats(&self) -> CoherencyStats {
        self.counters
            .snapshot(self.transactions.depth(), self.cache.total_lines())
    }

    // --- Public operations ---

    /// Reads `size` bytes at `address` on behalf of `node`.
    pub async fn read(
        &self,
        node: &NodeId,
        address: Address,
        size: usize,
    ) -> CoherencyResult<Vec<u8>> {
        self.endpoint(node)?;

        let mut out = Vec::with_capacity(size);
        for span in split_range(address, size) {
            let line = self.read_line(node, span.line).await?;
            out.extend_from_slice(&line[span.offset..span.offset + span.len]);
        }
        Ok(out)
    }

    /// Writes `data` at `address` on behalf of `node`. Each touched line is
    /// committed independently; a failure leaves the failing line untouched.
    pub async fn write(&self, node: &NodeId, address: Address, data: &[u8]) -> CoherencyResult<()> {
        self.endpoint(node)?;

        let mut consumed = 0usize;
        for span in split_range(address, data.len()) {
            let chunk = &data[consumed..consumed + span.len];
            self.write_line(node, span.line, span.offset, chunk).await?;
            consumed += span.len;
        }
        Ok(())
    }

    /// Writes back (if dirty) and drops `node`'s copy. Evicting a line that is
    /// not cached is a successful no-op.
    pub async fn evict_cache_line(&self, node: &NodeId, address: Address) -> CoherencyResult<()> {
        let address = line_base(address);
        let _guard = self.lock_line(address).await;
        self.evict_locked(node, address).await
    }

    /// Writes back every dirty line of `node` and keeps them cached clean.
    pub async fn flush(&self, node: &NodeId) -> CoherencyResult<usize> {
        let mut flushed = 0;

        for line in self.cache.dirty_lines(node) {
            let _guard = self.lock_line(line.address).await;
            let Some(current) = self.cache.get(node, line.address) else {
                continue;
            };
            if !current.is_dirty() {
                continue;
            }

            self.write_back(node, &current).await?;

            let mut lines = self.cache.lock();
            if let Some(cached) = lines
                .get_mut(node)
                .and_then(|node_lines| node_lines.get_mut(&current.address))
            {
                cached.state = cached.state.after_writeback();
                self.directory
                    .set_state(current.address, node, cached.state);
            }
            flushed += 1;
        }

        tracing::debug!("Flushed {} dirty lines of {}", flushed, node);
        Ok(flushed)
    }

    /// Gracefully removes a hosted node: every line is written back and
    /// evicted before the endpoint is dropped.
    pub async fn detach_node(&self, node: &NodeId) -> CoherencyResult<()> {
        for address in self.cache.node_addresses(node) {
            self.evict_cache_line(node, address).await?;
        }
        self.endpoints.remove(node);
        self.departed.insert(node.clone());
        tracing::info!("Detached node {} from coherency engine", node);
        Ok(())
    }

    /// Forgets everything a departed node held. Dirty data it never wrote
    /// back is lost and reported.
    pub fn drop_node(&self, node: &NodeId) {
        let lines = self.cache.remove_node(node);
        let lost = self.directory.remove_node(node);
        // A hosted node that leaves must not be snooped as a remote peer.
        if self.endpoints.remove(node).is_some() {
            self.departed.insert(node.clone());
        }
        self.held.retain(|(holder, _)| holder != node);

        if !lost.is_empty() {
            tracing::error!(
                "Node {} departed holding {} dirty lines; their data is lost: {:x?}",
                node,
                lost.len(),
                lost
            );
        }
        tracing::info!(
            "Dropped node {} ({} cached lines, {} dirty directory entries)",
            node,
            lines.len(),
            lost.len()
        );
    }

    /// Reports directory entries that break the single-owner rules plus any
    /// disagreement between a hosted node's store and the directory.
    pub fn verify(&self) -> Vec<CoherencyViolation> {
        let mut violations = self.directory.verify();
        let mut seen: HashSet<(NodeId, Address)> = HashSet::new();

        for (node, address, cached) in self.cache.states() {
            let recorded = self.directory.get_state(address, &node);
            seen.insert((node.clone(), address));
            if cached != recorded {
                violations.push(CoherencyViolation {
                    address,
                    kind: ViolationKind::DirectoryMismatch {
                        node: node.clone(),
                        cached,
                        recorded,
                    },
                    holders: vec![(node, recorded)],
                });
            }
        }

        for (address, holders) in self.directory.snapshot() {
            for (node, recorded) in holders {
                if self.is_attached(&node) && !seen.contains(&(node.clone(), address)) {
                    violations.push(CoherencyViolation {
                        address,
                        kind: ViolationKind::DirectoryMismatch {
                            node: node.clone(),
                            cached: MoesiState::Invalid,
                            recorded,
                        },
                        holders: vec![(node, recorded)],
                    });
                }
            }
        }

        if !violations.is_empty() {
            tracing::warn!("Coherency verification found {} violations", violations.len());
        }
        violations
    }

    // --- Read path ---

    async fn read_line(&self, node: &NodeId, address: Address) -> CoherencyResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.read_line_once(node, address).await {
                Err(CoherencyError::Busy { node: winner, .. })
                    if attempt + 1 < self.config.contention_retries =>
                {
                    attempt += 1;
                    self.back_off(node, address, &winner, attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn read_line_once(&self, node: &NodeId, address: Address) -> CoherencyResult<Vec<u8>> {
        if let Some(line) = self.cache.touch(node, address) {
            CoherencyCounters::bump(&self.counters.read_hits);
            return Ok(line.bytes().to_vec());
        }

        let _guard = self.lock_line(address).await;

        // Another local caller may have filled the line while we waited.
        if let Some(line) = self.cache.touch(node, address) {
            CoherencyCounters::bump(&self.counters.read_hits);
            return Ok(line.bytes().to_vec());
        }

        CoherencyCounters::bump(&self.counters.read_misses);
        let pending = self.claim_line(node, address);

        let holders: HashMap<NodeId, MoesiState> = self
            .directory
            .holders(address)
            .into_iter()
            .filter(|(holder, _)| holder != node)
            .collect();

        let owner = holders
            .iter()
            .find(|(_, state)| state.is_write_capable())
            .map(|(holder, _)| holder.clone());

        let source = match owner {
            Some(owner) => Some(owner),
            None => {
                let mut sharers: Vec<NodeId> = holders.keys().cloned().collect();
                sharers.sort();
                sharers.choose(&mut rand::thread_rng()).cloned()
            }
        };

        let fetched = match source {
            Some(source) => {
                tracing::debug!("{} read miss on {:#x}, fetching from {}", node, address, source);
                Some(self.fetch_line(node, &source, address).await?)
            }
            None => self.snoop_line(node, address).await?,
        };

        let (data, version, state) = match fetched {
            Some((data, version)) => (data, version, MoesiState::Shared),
            None => {
                tracing::debug!("{} first touch of {:#x}", node, address);
                let data = self
                    .backing
                    .load(address, CACHE_LINE_SIZE)
                    .map_err(|e| CoherencyError::Backing(e.to_string()))?;
                (data, self.retired_version(address), MoesiState::Exclusive)
            }
        };

        self.make_room(node, address).await;

        {
            let mut lines = self.cache.lock();
            if let Some(winner) = pending.yielded_to() {
                return Err(CoherencyError::Busy {
                    address,
                    node: winner,
                });
            }
            self.directory.set_state(address, node, state);
            let line = CacheLine::new(address, node.clone(), data.clone(), state, version);
            lines.entry(node.clone()).or_default().insert(address, line);
        }

        Ok(data)
    }

    /// Asks `source` for its copy of the line.
    async fn fetch_line(
        &self,
        node: &NodeId,
        source: &NodeId,
        address: Address,
    ) -> CoherencyResult<(Vec<u8>, u64)> {
        let mut replies = self
            .request_all(
                node,
                address,
                HashSet::from([source.clone()]),
                TransactionKind::Read,
                MessagePayload::ReadRequest { address },
            )
            .await?;

        match replies.remove(source) {
            Some(CoherencyReply::Data {
                data: Some(data),
                version,
            }) if data.len() == CACHE_LINE_SIZE => Ok((data, version)),
            Some(CoherencyReply::Data { data: Some(data), .. }) => Err(CoherencyError::Rejected {
                address,
                node: source.clone(),
                reason: format!("line of {} bytes", data.len()),
            }),
            Some(CoherencyReply::Data { data: None, .. }) => Err(CoherencyError::Rejected {
                address,
                node: source.clone(),
                reason: "no valid copy".to_string(),
            }),
            Some(CoherencyReply::Ack { .. }) => Err(CoherencyError::Rejected {
                address,
                node: source.clone(),
                reason: "unexpected ack".to_string(),
            }),
            None => Err(CoherencyError::Rejected {
                address,
                node: source.clone(),
                reason: "empty response".to_string(),
            }),
        }
    }

    /// Asks every peer on another engine for the line. `None` when none of
    /// them holds a valid copy.
    async fn snoop_line(
        &self,
        node: &NodeId,
        address: Address,
    ) -> CoherencyResult<Option<(Vec<u8>, u64)>> {
        let peers: HashSet<NodeId> = self.remote_peers(node)?.into_iter().collect();
        if peers.is_empty() {
            return Ok(None);
        }

        tracing::debug!("{} read miss on {:#x}, snooping {:?}", node, address, peers);
        let replies = self
            .request_all(
                node,
                address,
                peers,
                TransactionKind::Read,
                MessagePayload::ReadRequest { address },
            )
            .await?;

        let mut freshest: Option<(Vec<u8>, u64)> = None;
        for reply in replies.into_values() {
            if let CoherencyReply::Data {
                data: Some(data),
                version,
            } = reply
                && data.len() == CACHE_LINE_SIZE
                && freshest.as_ref().is_none_or(|(_, best)| version > *best)
            {
                freshest = Some((data, version));
            }
        }
        Ok(freshest)
    }

    // --- Write path ---

    async fn write_line(
        &self,
        node: &NodeId,
        address: Address,
        offset: usize,
        bytes: &[u8],
    ) -> CoherencyResult<()> {
        let mut attempt = 0;
        loop {
            match self.write_line_once(node, address, offset, bytes).await {
                Err(CoherencyError::Busy { node: winner, .. })
                    if attempt + 1 < self.config.contention_retries =>
                {
                    attempt += 1;
                    self.back_off(node, address, &winner, attempt).await;
                }
                other => return other,
            }
        }
    }

    async fn write_line_once(
        &self,
        node: &NodeId,
        address: Address,
        offset: usize,
        bytes: &[u8],
    ) -> CoherencyResult<()> {
        if self.try_write_hit(node, address, offset, bytes) {
            return Ok(());
        }

        let _guard = self.lock_line(address).await;

        if self.try_write_hit(node, address, offset, bytes) {
            return Ok(());
        }

        CoherencyCounters::bump(&self.counters.write_misses);
        let pending = self.claim_line(node, address);

        let local = self.cache.get(node, address).filter(CacheLine::is_valid);
        let targets = self.coherence_targets(node, address)?;

        let kind = if local.is_some() {
            TransactionKind::Invalidate
        } else {
            TransactionKind::Write
        };

        tracing::debug!(
            "{} write {} on {:#x}: invalidating {:?}",
            node,
            if local.is_some() { "upgrade" } else { "miss" },
            address,
            targets
        );

        // Nothing below runs unless every holder acknowledged.
        let replies = self.invalidate_others(node, address, targets, kind).await?;

        let mut freshest: Option<(u64, Vec<u8>)> =
            local.as_ref().map(|line| (line.version, line.bytes().to_vec()));
        for reply in replies.into_values() {
            if let CoherencyReply::Ack {
                data: Some(data),
                version,
                ..
            } = reply
                && data.len() == CACHE_LINE_SIZE
                && freshest.as_ref().is_none_or(|(best, _)| version > *best)
            {
                freshest = Some((version, data));
            }
        }

        let (base_version, base_data) = match freshest {
            Some(found) => found,
            None => {
                let data = self
                    .backing
                    .load(address, CACHE_LINE_SIZE)
                    .map_err(|e| CoherencyError::Backing(e.to_string()))?;
                (0, data)
            }
        };
        let base_version = base_version.max(self.retired_version(address));

        if local.is_none() {
            self.make_room(node, address).await;
        }

        let mut line = CacheLine::new(address, node.clone(), base_data, MoesiState::Modified, base_version);
        line.apply_write(offset, bytes);

        {
            let mut lines = self.cache.lock();
            if let Some(winner) = pending.yielded_to() {
                return Err(CoherencyError::Busy {
                    address,
                    node: winner,
                });
            }
            let stale = self.directory.invalidate_all_except(address, node);
            if !stale.is_empty() {
                tracing::error!(
                    "Holders {:?} appeared on {:#x} during {}'s write",
                    stale,
                    address,
                    node
                );
            }
            self.directory.set_state(address, node, MoesiState::Modified);
            lines.entry(node.clone()).or_default().insert(address, line);
        }

        Ok(())
    }

    /// Applies the write in place if `node` holds the line MODIFIED or
    /// EXCLUSIVE.
    fn try_write_hit(&self, node: &NodeId, address: Address, offset: usize, bytes: &[u8]) -> bool {
        let mut lines = self.cache.lock();
        let Some(line) = lines
            .get_mut(node)
            .and_then(|node_lines| node_lines.get_mut(&address))
        else {
            return false;
        };

        if !line.is_valid() || !line.state.is_exclusive() {
            return false;
        }

        line.apply_write(offset, bytes);
        self.directory.set_state(address, node, MoesiState::Modified);
        CoherencyCounters::bump(&self.counters.write_hits);
        true
    }

    /// Sends INVALIDATE (or WRITE_REQUEST for a miss) to every target and
    /// waits until all of them acknowledge. Any missing or negative ACK fails
    /// the whole call.
    pub(crate) async fn invalidate_others(
        &self,
        node: &NodeId,
        address: Address,
        targets: HashSet<NodeId>,
        kind: TransactionKind,
    ) -> CoherencyResult<HashMap<NodeId, CoherencyReply>> {
        let payload = match kind {
            TransactionKind::Write => MessagePayload::WriteRequest { address },
            _ => MessagePayload::Invalidate { address },
        };
        CoherencyCounters::add(&self.counters.invalidations_sent, targets.len() as u64);
        self.request_all(node, address, targets, kind, payload).await
    }

    /// Sends `payload` to every target inside one transaction and waits for
    /// all of them. A negative ACK from any target fails the call.
    async fn request_all(
        &self,
        node: &NodeId,
        address: Address,
        targets: HashSet<NodeId>,
        kind: TransactionKind,
        payload: MessagePayload,
    ) -> CoherencyResult<HashMap<NodeId, CoherencyReply>> {
        if targets.is_empty() {
            return Ok(HashMap::new());
        }

        let transport = self.endpoint(node)?;
        let handle = self
            .transactions
            .begin(node.clone(), kind, Some(address), targets.clone());
        let id = handle.id;

        let mut sorted: Vec<NodeId> = targets.into_iter().collect();
        sorted.sort();

        for target in &sorted {
            let request = Message::new(node.clone(), Some(target.clone()), id, payload.clone());
            if !transport.send(request).await {
                self.transactions.cancel(id);
                tracing::warn!(
                    "{:?} of {:#x} aborted: {} unreachable",
                    kind,
                    address,
                    target
                );
                return Err(CoherencyError::Unreachable {
                    address,
                    node: target.clone(),
                });
            }
        }

        let transaction = match self
            .transactions
            .wait(handle, self.config.transaction_timeout())
            .await
        {
            Ok(transaction) => transaction,
            Err(timeout) => {
                CoherencyCounters::bump(&self.counters.timeouts);
                tracing::warn!(
                    "{:?} of {:#x} by {} timed out; missing {:?}",
                    kind,
                    address,
                    node,
                    timeout.missing
                );
                return Err(CoherencyError::Timeout {
                    address,
                    missing: timeout.missing,
                    waited_ms: timeout.waited.as_millis() as u64,
                });
            }
        };

        for (responder, reply) in &transaction.responses {
            if let CoherencyReply::Ack {
                error: Some(reason),
                ..
            } = reply
            {
                return Err(if reason == LINE_BUSY {
                    CoherencyError::Busy {
                        address,
                        node: responder.clone(),
                    }
                } else {
                    CoherencyError::Rejected {
                        address,
                        node: responder.clone(),
                        reason: reason.clone(),
                    }
                });
            }
        }

        Ok(transaction.responses)
    }

    /// Every node that may hold the line besides `node`: hosted holders from
    /// the directory plus all peers on other engines.
    pub(crate) fn coherence_targets(
        &self,
        node: &NodeId,
        address: Address,
    ) -> CoherencyResult<HashSet<NodeId>> {
        let mut targets: HashSet<NodeId> = self
            .directory
            .holders(address)
            .into_keys()
            .filter(|holder| holder != node)
            .collect();
        targets.extend(self.remote_peers(node)?);
        Ok(targets)
    }

    /// Peers reachable from `node` that this engine does not host.
    fn remote_peers(&self, node: &NodeId) -> CoherencyResult<Vec<NodeId>> {
        let transport = self.endpoint(node)?;
        Ok(transport
            .peers()
            .into_iter()
            .filter(|peer| !self.is_attached(peer) && !self.departed.contains(peer))
            .collect())
    }

    async fn back_off(&self, node: &NodeId, address: Address, winner: &NodeId, attempt: u32) {
        CoherencyCounters::bump(&self.counters.contentions);
        let jitter = rand::thread_rng().gen_range(1..=10u64);
        tracing::debug!(
            "{} lost {:#x} to {}, retry {} in {}ms",
            node,
            address,
            winner,
            attempt,
            jitter * u64::from(attempt)
        );
        tokio::time::sleep(Duration::from_millis(jitter * u64::from(attempt))).await;
    }

    // --- Eviction / writeback ---

    /// Caller holds the line lock.
    pub(crate) async fn evict_locked(&self, node: &NodeId, address: Address) -> CoherencyResult<()> {
        let Some(line) = self.cache.get(node, address) else {
            self.directory.set_state(address, node, MoesiState::Invalid);
            return Ok(());
        };

        if line.is_dirty() {
            self.write_back(node, &line).await?;
        }

        self.cache.evict(node, address, &self.directory);
        self.retire_version(address, line.version);
        CoherencyCounters::bump(&self.counters.evictions);
        tracing::debug!("{} evicted {:#x} (v{})", node, address, line.version);
        Ok(())
    }

    /// Persists a dirty line, locally or at the configured home node.
    pub(crate) async fn write_back(&self, node: &NodeId, line: &CacheLine) -> CoherencyResult<()> {
        CoherencyCounters::bump(&self.counters.writebacks);
        self.retire_version(line.address, line.version);

        let remote_home = self
            .home_node
            .as_ref()
            .filter(|home| !self.is_attached(home))
            .cloned();

        let Some(home) = remote_home else {
            return self
                .backing
                .store(line.address, line.bytes())
                .map_err(|e| CoherencyError::Backing(e.to_string()));
        };

        let transport = self.endpoint(node)?;
        let handle = self.transactions.begin(
            node.clone(),
            TransactionKind::Writeback,
            Some(line.address),
            HashSet::from([home.clone()]),
        );
        let id = handle.id;

        let message = Message::new(
            node.clone(),
            Some(home.clone()),
            id,
            MessagePayload::Writeback {
                address: line.address,
                data: line.bytes().to_vec(),
                version: line.version,
            },
        )
        .with_ack();

        if !transport.send(message).await {
            self.transactions.cancel(id);
            return Err(CoherencyError::Unreachable {
                address: line.address,
                node: home,
            });
        }

        match self
            .transactions
            .wait(handle, self.config.transaction_timeout())
            .await
        {
            Ok(mut transaction) => match transaction.responses.remove(&home) {
                Some(CoherencyReply::Ack { error: Some(reason), .. }) => {
                    Err(CoherencyError::Backing(reason))
                }
                _ => Ok(()),
            },
            Err(timeout) => {
                CoherencyCounters::bump(&self.counters.timeouts);
                Err(CoherencyError::Timeout {
                    address: line.address,
                    missing: timeout.missing,
                    waited_ms: timeout.waited.as_millis() as u64,
                })
            }
        }
    }

    /// Evicts least recently used lines of `node` until it is under capacity.
    /// Lines busy with another operation are skipped.
    async fn make_room(&self, node: &NodeId, incoming: Address) {
        let Some(capacity) = self.config.max_lines_per_node else {
            return;
        };

        while self.cache.line_count(node) >= capacity.max(1) {
            let mut evicted = false;

            for victim in self.cache.lru_order(node) {
                if victim == incoming {
                    continue;
                }
                let lock = self.line_lock(victim);
                let Ok(_guard) = lock.try_lock_owned() else {
                    continue;
                };
                match self.evict_locked(node, victim).await {
                    Ok(()) => {
                        evicted = true;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Could not evict {:#x} from {}: {}", victim, node, e);
                    }
                }
            }

            if !evicted {
                tracing::warn!("{} is over capacity but no line could be evicted", node);
                return;
            }
        }
    }

    // --- Inbound messages ---

    pub async fn handle_message(&self, message: Message) {
        let Some(node) = message.target_node.clone() else {
            tracing::warn!(
                "Broadcast {:?} from {} ignored by coherency engine",
                message.message_type(),
                message.source_node
            );
            return;
        };

        if !self.is_attached(&node) {
            tracing::warn!("{:?} for unattached node {}", message.message_type(), node);
            return;
        }

        match &message.payload {
            MessagePayload::ReadRequest { address } => {
                self.handle_read_request(&node, &message, *address).await;
            }
            MessagePayload::WriteRequest { address } | MessagePayload::Invalidate { address } => {
                self.handle_invalidate(&node, &message, *address).await;
            }
            MessagePayload::DataResponse { data, version, .. } => {
                self.transactions.respond(
                    message.sequence_id,
                    &message.source_node,
                    CoherencyReply::Data {
                        data: data.clone(),
                        version: *version,
                    },
                );
            }
            MessagePayload::Ack {
                data,
                version,
                error,
                ..
            } => {
                self.transactions.respond(
                    message.sequence_id,
                    &message.source_node,
                    CoherencyReply::Ack {
                        data: data.clone(),
                        version: *version,
                        error: error.clone(),
                    },
                );
            }
            MessagePayload::Writeback {
                address,
                data,
                version,
            } => {
                self.handle_writeback(&node, &message, *address, data, *version)
                    .await;
            }
            MessagePayload::Migrate { .. }
            | MessagePayload::MigrateCommit { .. }
            | MessagePayload::MigrateAbort { .. }
            | MessagePayload::NodeAnnounce { .. }
            | MessagePayload::Heartbeat
            | MessagePayload::Leave
            | MessagePayload::KernelSubmit { .. }
            | MessagePayload::KernelFetch { .. }
            | MessagePayload::KernelExecute { .. }
            | MessagePayload::KernelResult { .. }
            | MessagePayload::Delivered { .. } => {
                tracing::warn!(
                    "Coherency engine received unrelated {:?}",
                    message.message_type()
                );
            }
        }
    }

    async fn handle_read_request(&self, node: &NodeId, message: &Message, address: Address) {
        let address = line_base(address);
        let requester = message.source_node.clone();

        let outcome = {
            let mut lines = self.cache.lock();
            if !self.arbitrate(node, &requester, address) {
                None
            } else {
                match lines
                    .get_mut(node)
                    .and_then(|node_lines| node_lines.get_mut(&address))
                {
                    Some(line) if line.is_valid() => {
                        let was_owner = line.state.is_write_capable();
                        let downgraded = line.state.after_remote_read();
                        if downgraded != line.state {
                            tracing::debug!(
                                "{} downgrades {:#x} {:?} -> {:?} for {}",
                                node,
                                address,
                                line.state,
                                downgraded,
                                requester
                            );
                        }
                        line.state = downgraded;
                        line.sharers.insert(requester.clone());

                        let mut changes = vec![(node.clone(), downgraded)];
                        if self.is_attached(&requester) {
                            changes.push((requester.clone(), MoesiState::Shared));
                        }
                        self.directory.apply(address, &changes);
                        Some(Some((line.bytes().to_vec(), line.version, was_owner)))
                    }
                    _ => Some(None),
                }
            }
        };

        let payload = match outcome {
            None => {
                tracing::debug!("{} holds {:#x}, {} must retry", node, address, requester);
                Self::busy_ack(address)
            }
            Some(Some((data, version, was_owner))) => {
                if was_owner {
                    self.notify_remote_access(node, &requester, address);
                }
                MessagePayload::DataResponse {
                    address,
                    data: Some(data),
                    version,
                }
            }
            Some(None) => {
                tracing::debug!("{} asked {} for {:#x} but it holds no copy", requester, node, address);
                MessagePayload::DataResponse {
                    address,
                    data: None,
                    version: 0,
                }
            }
        };

        self.reply(node, message, payload).await;
    }

    async fn handle_invalidate(&self, node: &NodeId, message: &Message, address: Address) {
        let address = line_base(address);
        let requester = &message.source_node;
        CoherencyCounters::bump(&self.counters.invalidations_received);

        let removed = {
            let mut lines = self.cache.lock();
            if self.arbitrate(node, requester, address) {
                let removed = lines
                    .get_mut(node)
                    .and_then(|node_lines| node_lines.remove(&address));
                self.directory.set_state(address, node, MoesiState::Invalid);
                Some(removed)
            } else {
                None
            }
        };

        let Some(removed) = removed else {
            tracing::debug!("{} holds {:#x}, {} must retry", node, address, requester);
            self.reply(node, message, Self::busy_ack(address)).await;
            return;
        };

        let (data, version) = match removed {
            Some(line) if line.is_valid() => {
                if line.state.is_write_capable()
                    && matches!(message.payload, MessagePayload::WriteRequest { .. })
                {
                    self.notify_remote_access(node, requester, address);
                }
                // On failure the requester still receives the bytes in the ack.
                if line.is_dirty()
                    && let Err(e) = self.write_back(node, &line).await
                {
                    tracing::error!("Writeback of {:#x} from {} failed: {}", address, node, e);
                }
                self.retire_version(address, line.version);
                (Some(line.bytes().to_vec()), line.version)
            }
            _ => (None, 0),
        };

        tracing::debug!(
            "{} invalidated {:#x} for {} (had copy: {})",
            node,
            address,
            requester,
            data.is_some()
        );

        self.reply(
            node,
            message,
            MessagePayload::Ack {
                address,
                data,
                version,
                error: None,
            },
        )
        .await;
    }

    /// Whether an inbound request from `requester` may act on `node`'s copy
    /// now. Caller holds the store lock.
    fn arbitrate(&self, node: &NodeId, requester: &NodeId, address: Address) -> bool {
        if self.held.contains(&(node.clone(), address)) {
            return false;
        }
        match self.pending.get_mut(&(node.clone(), address)) {
            None => true,
            Some(_) if node < requester => false,
            Some(mut claim) => {
                if claim.is_none() {
                    *claim = Some(requester.clone());
                }
                true
            }
        }
    }

    fn busy_ack(address: Address) -> MessagePayload {
        MessagePayload::Ack {
            address,
            data: None,
            version: 0,
            error: Some(LINE_BUSY.to_string()),
        }
    }

    fn notify_remote_access(&self, owner: &NodeId, accessor: &NodeId, address: Address) {
        if owner == accessor {
            return;
        }
        for observer in self.observers.read().iter() {
            if let Some(observer) = observer.upgrade() {
                observer.remote_access(owner, accessor, address);
            }
        }
    }

    async fn handle_writeback(
        &self,
        node: &NodeId,
        message: &Message,
        address: Address,
        data: &[u8],
        version: u64,
    ) {
        let error = match self.backing.store(address, data) {
            Ok(()) => {
                self.retire_version(address, version);
                CoherencyCounters::bump(&self.counters.writebacks);
                None
            }
            Err(e) => {
                tracing::error!("Home {} failed to persist {:#x}: {}", node, address, e);
                Some(e.to_string())
            }
        };

        self.reply(
            node,
            message,
            MessagePayload::Ack {
                address,
                data: None,
                version,
                error,
            },
        )
        .await;
    }

    async fn reply(&self, node: &NodeId, request: &Message, payload: MessagePayload) {
        let Ok(transport) = self.endpoint(node) else {
            return;
        };
        let response = request.reply(node.clone(), payload);
        if !transport.send(response).await {
            tracing::warn!(
                "{} could not reply to {} (seq {})",
                node,
                request.source_node,
                request.sequence_id
            );
        }
    }

    // --- Helpers shared with page migration ---

    pub(crate) fn endpoint(&self, node: &NodeId) -> CoherencyResult<Arc<dyn Transport>> {
        self.endpoints
            .get(node)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoherencyError::UnknownNode(node.clone()))
    }

    pub(crate) fn cache(&self) -> &CacheLineStore {
        &self.cache
    }

    pub(crate) fn backing(&self) -> &Arc<dyn BackingStore> {
        &self.backing
    }

    pub(crate) fn transactions(&self) -> &TransactionManager<CoherencyReply> {
        &self.transactions
    }

    pub(crate) fn counters(&self) -> &CoherencyCounters {
        &self.counters
    }

    pub(crate) fn line_lock(&self, address: Address) -> Arc<AsyncMutex<()>> {
        self.line_locks
            .entry(line_base(address))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub(crate) async fn lock_line(&self, address: Address) -> OwnedMutexGuard<()> {
        self.line_lock(address).lock_owned().await
    }

    fn claim_line(&self, node: &NodeId, address: Address) -> PendingLine<'_> {
        let key = (node.clone(), line_base(address));
        self.pending.insert(key.clone(), None);
        PendingLine {
            pending: &self.pending,
            key,
        }
    }

    /// Makes every other node's request for `node`'s copy of the line
    /// answer busy until [`Self::release_line`].
    pub(crate) fn hold_line(&self, node: &NodeId, address: Address) {
        self.held.insert((node.clone(), line_base(address)));
    }

    pub(crate) fn release_line(&self, node: &NodeId, address: Address) {
        self.held.remove(&(node.clone(), line_base(address)));
    }

    pub fn is_held(&self, node: &NodeId, address: Address) -> bool {
        self.held.contains(&(node.clone(), line_base(address)))
    }

    /// Installs a freshly fetched line and records it in the directory.
    pub(crate) fn install_line(&self, node: &NodeId, line: CacheLine) {
        let mut lines = self.cache.lock();
        self.directory.set_state(line.address, node, line.state);
        lines
            .entry(node.clone())
            .or_default()
            .insert(line.address, line);
    }

    pub(crate) fn retired_version(&self, address: Address) -> u64 {
        self.retired_versions
            .get(&line_base(address))
            .map(|entry| *entry.value())
            .unwrap_or(0)
    }

    pub(crate) fn retire_version(&self, address: Address, version: u64) {
        self.retired_versions
            .entry(line_base(address))
            .and_modify(|known| *known = (*known).max(version))
            .or_insert(version);
    }
}
