//! Page Migration Manager
//!
//! Moves a whole page (64 lines) to a new home node in two phases:
//!
//! 1. The owner gathers the freshest copy of every line into one blob and
//!    ships it in a MIGRATE message. The target only stages it.
//! 2. Once the target has acknowledged, the owner drops its own copies and
//!    sends MIGRATE_COMMIT; the target installs the page as 64 EXCLUSIVE
//!    lines. A phase-1 failure sends MIGRATE_ABORT instead.
//!
//! Both sides answer other nodes' requests for the page's lines with a busy
//! refusal while the handoff is in flight. Staged pages that never see a
//! commit are discarded after twice the transaction timeout.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use super::types::{MemoryPage, MigrationCandidate};
use crate::coherency::engine::{AccessObserver, ClusterCoherencyEngine, CoherencyReply};
use crate::coherency::stats::CoherencyCounters;
use crate::coherency::types::*;
use crate::error::{CoherencyError, MigrationError, MigrationResult};
use crate::membership::types::NodeId;
use crate::transaction::TransactionKind;
use crate::transport::message::{Message, MessagePayload, MessageType};
use crate::transport::{Transport, handler};

/// A page received in phase 1, waiting for its commit.
struct StagedPage {
    from: NodeId,
    data: Vec<u8>,
    versions: Vec<u64>,
    token: u64,
}

/// Releases the held lines of a page when dropped.
struct HeldPage<'a> {
    engine: &'a ClusterCoherencyEngine,
    node: NodeId,
    page: Address,
}

impl<'a> HeldPage<'a> {
    fn hold(engine: &'a ClusterCoherencyEngine, node: &NodeId, page: Address) -> Self {
        for line in page_lines(page) {
            engine.hold_line(node, line);
        }
        Self {
            engine,
            node: node.clone(),
            page,
        }
    }
}

impl Drop for HeldPage<'_> {
    fn drop(&mut self) {
        for line in page_lines(self.page) {
            self.engine.release_line(&self.node, line);
        }
    }
}

pub struct PageMigrationManager {
    engine: Arc<ClusterCoherencyEngine>,
    pages: Mutex<HashMap<Address, MemoryPage>>,
    staged: Mutex<HashMap<(NodeId, Address), StagedPage>>,
}

impl PageMigrationManager {
    /// Creates the manager and subscribes it to the engine's remote-access
    /// notifications.
    pub fn new(engine: Arc<ClusterCoherencyEngine>) -> Arc<Self> {
        let manager = Arc::new(Self {
            engine,
            pages: Mutex::new(HashMap::new()),
            staged: Mutex::new(HashMap::new()),
        });
        let observer: Weak<dyn AccessObserver> = Arc::<Self>::downgrade(&manager);
        manager.engine.observe_accesses(observer);
        manager
    }

    /// Registers the migration handlers for a node hosted by the engine.
    pub fn attach_node(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let migration_handler = handler(move |message: Message| {
            let manager = manager.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    manager.handle_message(message).await;
                }
            }
        });

        for kind in [
            MessageType::Migrate,
            MessageType::MigrateCommit,
            MessageType::MigrateAbort,
        ] {
            transport.register_handler(kind, migration_handler.clone());
        }
    }

    pub fn page(&self, address: Address) -> Option<MemoryPage> {
        self.pages.lock().get(&page_base(address)).cloned()
    }

    pub fn pages(&self) -> Vec<MemoryPage> {
        let mut pages: Vec<MemoryPage> = self.pages.lock().values().cloned().collect();
        pages.sort_by_key(|page| page.address);
        pages
    }

    /// Whether `node` has a page staged and waiting for its commit.
    pub fn is_staged(&self, node: &NodeId, address: Address) -> bool {
        self.staged
            .lock()
            .contains_key(&(node.clone(), page_base(address)))
    }

    /// Tracked owner, or for an untracked page the first node that owns one
    /// of its lines.
    pub fn page_owner(&self, address: Address) -> Option<NodeId> {
        let page = page_base(address);
        if let Some(tracked) = self.pages.lock().get(&page) {
            return Some(tracked.owner.clone());
        }
        self.derive_owner(page)
    }

    fn derive_owner(&self, page: Address) -> Option<NodeId> {
        let directory = self.engine.directory();
        page_lines(page).find_map(|line| directory.get_owner(line))
    }

    /// Counts an access by `node`, starting to track the page if needed.
    pub fn record_access(&self, node: &NodeId, address: Address) {
        let page = page_base(address);
        let owner = self.derive_owner(page).unwrap_or_else(|| node.clone());
        self.count_access(page, owner, node);
    }

    fn count_access(&self, page: Address, owner_if_untracked: NodeId, node: &NodeId) {
        let mut pages = self.pages.lock();
        let entry = pages
            .entry(page)
            .or_insert_with(|| MemoryPage::new(page, owner_if_untracked));

        if &entry.owner == node {
            entry.owner_accesses += 1;
        } else {
            *entry.remote_accesses.entry(node.clone()).or_default() += 1;
            entry.sharers.insert(node.clone());
        }
    }

    /// Pages whose busiest remote accessor has at least `min_remote_accesses`
    /// accesses and more than the owner itself. Busiest first.
    pub fn migration_candidates(&self, min_remote_accesses: u64) -> Vec<MigrationCandidate> {
        let pages = self.pages.lock();
        let mut candidates: Vec<MigrationCandidate> = pages
            .values()
            .filter_map(|page| {
                let (node, count) = page.busiest_remote()?;
                (count >= min_remote_accesses && count > page.owner_accesses).then(|| {
                    MigrationCandidate {
                        page: page.address,
                        owner: page.owner.clone(),
                        suggested_owner: node.clone(),
                        remote_accesses: count,
                        owner_accesses: page.owner_accesses,
                    }
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.remote_accesses
                .cmp(&a.remote_accesses)
                .then_with(|| a.page.cmp(&b.page))
        });
        candidates
    }

    /// Moves the page containing `address` from `requester` to `target`.
    ///
    /// Only the page owner may migrate it. A failure before the target
    /// staged the page leaves the owner with ownership and its cached lines.
    /// After a failed commit the owner no longer caches the page; its data
    /// was written back before it was shipped.
    pub async fn migrate_page(
        &self,
        requester: &NodeId,
        address: Address,
        target: &NodeId,
    ) -> MigrationResult<()> {
        let page = page_base(address);
        if requester == target {
            return Err(MigrationError::SameNode(page));
        }

        let transport = self.engine.endpoint(requester)?;

        let owner = self
            .page_owner(page)
            .unwrap_or_else(|| requester.clone());
        if &owner != requester {
            return Err(MigrationError::NotOwner {
                page,
                requester: requester.clone(),
                owner,
            });
        }

        tracing::info!("Migrating page {:#x} from {} to {}", page, requester, target);

        // Always ascending.
        let mut guards = Vec::with_capacity(LINES_PER_PAGE);
        for line in page_lines(page) {
            guards.push(self.engine.lock_line(line).await);
        }
        let _held = HeldPage::hold(&self.engine, requester, page);

        let mut blob = Vec::with_capacity(PAGE_SIZE);
        let mut versions = Vec::with_capacity(LINES_PER_PAGE);
        for line in page_lines(page) {
            let (data, version) = self.collect_line(requester, line).await?;
            blob.extend_from_slice(&data);
            versions.push(version);
        }

        // Phase 1: the target stages the page.
        let staged = self
            .exchange(
                &transport,
                requester,
                target,
                page,
                MessagePayload::Migrate {
                    page,
                    data: blob,
                    versions: versions.clone(),
                },
            )
            .await;
        if let Err(e) = staged {
            if matches!(e, MigrationError::Timeout(_)) {
                let abort = Message::new(
                    requester.clone(),
                    Some(target.clone()),
                    transport.next_sequence_id(),
                    MessagePayload::MigrateAbort { page },
                );
                if !transport.send(abort).await {
                    tracing::warn!("Could not tell {} to drop staged page {:#x}", target, page);
                }
            }
            return Err(e);
        }

        // Phase 2: give up local copies, then let the target install.
        for (line, version) in page_lines(page).zip(&versions) {
            self.engine
                .cache()
                .evict(requester, line, self.engine.directory());
            self.engine.retire_version(line, *version);
        }

        if let Err(e) = self
            .exchange(
                &transport,
                requester,
                target,
                page,
                MessagePayload::MigrateCommit { page },
            )
            .await
        {
            tracing::error!(
                "Commit of page {:#x} to {} failed: {}; the page falls back to the backing store",
                page,
                target,
                e
            );
            return Err(e);
        }

        {
            let mut pages = self.pages.lock();
            let record = pages
                .entry(page)
                .or_insert_with(|| MemoryPage::new(page, requester.clone()));
            if &record.owner != target {
                record.migrated_to(target.clone());
            }
        }
        CoherencyCounters::bump(&self.engine.counters().migrations);

        drop(guards);
        tracing::info!("Page {:#x} now lives on {}", page, target);
        Ok(())
    }

    /// Sends one migration message to `target` and waits for its ACK.
    async fn exchange(
        &self,
        transport: &Arc<dyn Transport>,
        requester: &NodeId,
        target: &NodeId,
        page: Address,
        payload: MessagePayload,
    ) -> MigrationResult<()> {
        let handle = self.engine.transactions().begin(
            requester.clone(),
            TransactionKind::Migrate,
            Some(page),
            HashSet::from([target.clone()]),
        );
        let id = handle.id;

        let message = Message::new(requester.clone(), Some(target.clone()), id, payload).with_ack();
        if !transport.send(message).await {
            self.engine.transactions().cancel(id);
            tracing::warn!("Migration of {:#x} failed: {} unreachable", page, target);
            return Err(MigrationError::TargetUnreachable(target.clone()));
        }

        let timeout = self.engine.config().transaction_timeout();
        let mut transaction = match self.engine.transactions().wait(handle, timeout).await {
            Ok(transaction) => transaction,
            Err(_) => {
                CoherencyCounters::bump(&self.engine.counters().timeouts);
                tracing::warn!("Migration of {:#x} to {} timed out", page, target);
                return Err(MigrationError::Timeout(page));
            }
        };

        match transaction.responses.remove(target) {
            Some(CoherencyReply::Ack { error: None, .. }) => Ok(()),
            Some(CoherencyReply::Ack {
                error: Some(reason),
                ..
            }) => Err(MigrationError::Rejected {
                node: target.clone(),
                reason,
            }),
            _ => Err(MigrationError::Rejected {
                node: target.clone(),
                reason: "unexpected reply".to_string(),
            }),
        }
    }

    /// Freshest bytes and version of one line. Every other copy is
    /// invalidated; dirty ones are written back so the target may hold the
    /// line EXCLUSIVE.
    async fn collect_line(
        &self,
        requester: &NodeId,
        line: Address,
    ) -> Result<(Vec<u8>, u64), CoherencyError> {
        let others = self.engine.coherence_targets(requester, line)?;

        let replies = self
            .engine
            .invalidate_others(requester, line, others, TransactionKind::Migrate)
            .await?;

        let local = self
            .engine
            .cached_line(requester, line)
            .filter(CacheLine::is_valid);
        if let Some(local) = &local
            && local.is_dirty()
        {
            self.engine.write_back(requester, local).await?;
        }

        let mut freshest = local.map(|line| (line.version, line.bytes().to_vec()));
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

        match freshest {
            Some((version, data)) => Ok((data, version)),
            None => {
                let data = self
                    .engine
                    .backing()
                    .load(line, CACHE_LINE_SIZE)
                    .map_err(|e| CoherencyError::Backing(e.to_string()))?;
                Ok((data, self.engine.retired_version(line)))
            }
        }
    }

    pub async fn handle_message(self: &Arc<Self>, message: Message) {
        let Some(node) = message.target_node.clone() else {
            return;
        };

        let Ok(transport) = self.engine.endpoint(&node) else {
            tracing::warn!("{:?} for unattached node {}", message.message_type(), node);
            return;
        };

        let (page, error) = match &message.payload {
            MessagePayload::Migrate {
                page,
                data,
                versions,
            } => (
                *page,
                self.stage_page(&node, &message, *page, data, versions),
            ),
            MessagePayload::MigrateCommit { page } => (*page, self.commit_page(&node, *page)),
            MessagePayload::MigrateAbort { page } => {
                if self.discard_staged(&node, *page, None) {
                    tracing::info!("{} dropped staged page {:#x} on abort", node, page);
                }
                return;
            }
            _ => {
                tracing::warn!(
                    "Migration manager received unrelated {:?}",
                    message.message_type()
                );
                return;
            }
        };

        if let Some(reason) = &error {
            tracing::warn!("{} refused {:?} of page {:#x}: {}", node, message.message_type(), page, reason);
        }

        let ack = message.reply(
            node.clone(),
            MessagePayload::Ack {
                address: page,
                data: None,
                version: 0,
                error,
            },
        );
        if !transport.send(ack).await {
            tracing::warn!("{} could not acknowledge page {:#x}", node, page);
        }
    }

    /// Validates and stages a shipped page. Returns the refusal reason, if any.
    fn stage_page(
        self: &Arc<Self>,
        node: &NodeId,
        message: &Message,
        page: Address,
        data: &[u8],
        versions: &[u64],
    ) -> Option<String> {
        if page != page_base(page) {
            return Some(format!("{:#x} is not page aligned", page));
        }
        if data.len() != PAGE_SIZE || versions.len() != LINES_PER_PAGE {
            return Some(format!(
                "malformed page: {} bytes, {} versions",
                data.len(),
                versions.len()
            ));
        }

        let token = message.sequence_id;
        let previous = self.staged.lock().insert(
            (node.clone(), page),
            StagedPage {
                from: message.source_node.clone(),
                data: data.to_vec(),
                versions: versions.to_vec(),
                token,
            },
        );
        if previous.is_none() {
            for line in page_lines(page) {
                self.engine.hold_line(node, line);
            }
        }

        let manager = Arc::downgrade(self);
        let expire_node = node.clone();
        let expiry = self.engine.config().transaction_timeout() * 2;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            if let Some(manager) = manager.upgrade()
                && manager.discard_staged(&expire_node, page, Some(token))
            {
                tracing::warn!("Staged page {:#x} on {} expired without a commit", page, expire_node);
            }
        });

        tracing::debug!("{} staged page {:#x} from {}", node, page, message.source_node);
        None
    }

    /// Drops a staged page and releases its lines. With `token` set only
    /// that particular staging is dropped.
    fn discard_staged(&self, node: &NodeId, page: Address, token: Option<u64>) -> bool {
        let mut staged = self.staged.lock();
        let key = (node.clone(), page);
        let matches = staged
            .get(&key)
            .is_some_and(|entry| token.is_none_or(|token| entry.token == token));
        if !matches {
            return false;
        }
        staged.remove(&key);
        drop(staged);

        for line in page_lines(page) {
            self.engine.release_line(node, line);
        }
        true
    }

    /// Installs a staged page. Returns the refusal reason, if any.
    fn commit_page(&self, node: &NodeId, page: Address) -> Option<String> {
        let Some(staged) = self.staged.lock().remove(&(node.clone(), page)) else {
            return Some(format!("no staged page {:#x}", page));
        };

        for ((line, chunk), version) in page_lines(page)
            .zip(staged.data.chunks_exact(CACHE_LINE_SIZE))
            .zip(&staged.versions)
        {
            self.engine.install_line(
                node,
                CacheLine::new(line, node.clone(), chunk.to_vec(), MoesiState::Exclusive, *version),
            );
            self.engine.release_line(node, line);
        }

        let mut pages = self.pages.lock();
        let record = pages
            .entry(page)
            .or_insert_with(|| MemoryPage::new(page, staged.from.clone()));
        if &record.owner != node {
            record.migrated_to(node.clone());
        }

        tracing::info!("{} received page {:#x} from {}", node, page, staged.from);
        None
    }
}

impl AccessObserver for PageMigrationManager {
    fn remote_access(&self, owner: &NodeId, accessor: &NodeId, address: Address) {
        self.count_access(page_base(address), owner.clone(), accessor);
    }
}
