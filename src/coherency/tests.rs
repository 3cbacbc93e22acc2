//! Coherency Module Tests
//!
//! ## Test Scopes
//! - **Building blocks**: state predicates, range splitting, directory,
//!   cache line store and backing store.
//! - **Protocol**: multi-node reads and writes over the in-process network,
//!   including the ordering of concurrent writers.
//! - **Failure handling**: silent and unreachable peers, partial
//!   invalidation, node departure and verification.
//! - **Separate engines**: one engine per node, so every peer is remote and
//!   coherence relies on snooping and arbitration alone.

#[cfg(test)]
mod tests {
    use crate::coherency::backing::{BackingStore, MemoryBackingStore};
    use crate::coherency::cache::CacheLineStore;
    use crate::coherency::directory::{CoherencyDirectory, ViolationKind};
    use crate::coherency::engine::ClusterCoherencyEngine;
    use crate::coherency::types::*;
    use crate::config::CoherencyConfig;
    use crate::error::CoherencyError;
    use crate::membership::types::NodeId;
    use crate::transport::local::LocalNetwork;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    struct Cluster {
        network: Arc<LocalNetwork>,
        engine: Arc<ClusterCoherencyEngine>,
        backing: Arc<MemoryBackingStore>,
    }

    fn cluster_with(nodes: &[&str], config: CoherencyConfig) -> Cluster {
        let network = LocalNetwork::new();
        let backing = Arc::new(MemoryBackingStore::new());
        let engine = ClusterCoherencyEngine::new(config, backing.clone());
        for node in nodes {
            engine.attach_node(network.endpoint(*node));
        }
        Cluster {
            network,
            engine,
            backing,
        }
    }

    fn cluster(nodes: &[&str]) -> Cluster {
        cluster_with(nodes, CoherencyConfig::default())
    }

    fn id(node: &str) -> NodeId {
        NodeId::from(node)
    }

    /// One engine per node over a shared network and backing store, the
    /// way separate processes are deployed.
    struct Nodes {
        backing: Arc<MemoryBackingStore>,
        engines: Vec<(NodeId, Arc<ClusterCoherencyEngine>)>,
    }

    impl Nodes {
        fn on(&self, node: &str) -> &Arc<ClusterCoherencyEngine> {
            self.engines
                .iter()
                .find(|(id, _)| id.as_str() == node)
                .map(|(_, engine)| engine)
                .expect("unknown node")
        }

        fn assert_consistent(&self) {
            for (node, engine) in &self.engines {
                let violations = engine.verify();
                assert!(violations.is_empty(), "{node}: {violations:?}");
            }
        }
    }

    fn separate_engines(nodes: &[&str]) -> Nodes {
        separate_engines_with(nodes, CoherencyConfig::default())
    }

    fn separate_engines_with(nodes: &[&str], config: CoherencyConfig) -> Nodes {
        let network = LocalNetwork::new();
        let backing = Arc::new(MemoryBackingStore::new());
        let engines = nodes
            .iter()
            .map(|node| {
                let engine = ClusterCoherencyEngine::new(config.clone(), backing.clone());
                engine.attach_node(network.endpoint(*node));
                (id(node), engine)
            })
            .collect();
        Nodes { backing, engines }
    }

    // ============================================================
    // TEST 1: Building blocks
    // ============================================================

    #[test]
    fn test_state_predicates() {
        use MoesiState::*;

        assert!(Modified.is_dirty() && Owned.is_dirty());
        assert!(!Exclusive.is_dirty() && !Shared.is_dirty());
        assert!(Exclusive.is_exclusive() && !Owned.is_exclusive());
        assert!(Owned.is_sharer() && Shared.is_sharer() && !Modified.is_sharer());

        assert_eq!(Modified.after_remote_read(), Owned);
        assert_eq!(Exclusive.after_remote_read(), Shared);
        assert_eq!(Modified.after_writeback(), Exclusive);
        assert_eq!(Owned.after_writeback(), Shared);
    }

    #[test]
    fn test_split_range_crosses_lines() {
        let spans = split_range(0x1030, 100);
        assert_eq!(
            spans,
            vec![
                LineSpan { line: 0x1000, offset: 0x30, len: 16 },
                LineSpan { line: 0x1040, offset: 0, len: 64 },
                LineSpan { line: 0x1080, offset: 0, len: 20 },
            ]
        );
        assert!(split_range(0x1000, 0).is_empty());
        assert_eq!(page_lines(0x2fff).count(), LINES_PER_PAGE);
        assert_eq!(page_lines(0x2fff).next(), Some(0x2000));
    }

    #[test]
    fn test_directory_stays_sparse() {
        let directory = CoherencyDirectory::new();
        let (a, b) = (id("a"), id("b"));

        directory.set_state(0x1008, &a, MoesiState::Shared);
        directory.set_state(0x1000, &b, MoesiState::Owned);
        assert_eq!(directory.get_state(0x1000, &a), MoesiState::Shared);
        assert_eq!(directory.get_owner(0x1000), Some(b.clone()));
        assert_eq!(directory.get_sharers(0x1000), HashSet::from([a.clone(), b.clone()]));

        let invalidated = directory.invalidate_all_except(0x1000, &b);
        assert_eq!(invalidated, HashSet::from([a.clone()]));
        assert_eq!(directory.get_state(0x1000, &a), MoesiState::Invalid);

        directory.set_state(0x1000, &b, MoesiState::Invalid);
        assert_eq!(directory.tracked_addresses(), 0);
    }

    #[test]
    fn test_directory_remove_node_reports_dirty_lines() {
        let directory = CoherencyDirectory::new();
        let a = id("a");
        directory.set_state(0x0, &a, MoesiState::Modified);
        directory.set_state(0x40, &a, MoesiState::Shared);
        directory.set_state(0x80, &a, MoesiState::Owned);
        directory.set_state(0x80, &id("b"), MoesiState::Shared);

        let mut dirty = directory.remove_node(&a);
        dirty.sort_unstable();
        assert_eq!(dirty, vec![0x0, 0x80]);
        assert_eq!(directory.tracked_addresses(), 1);
    }

    #[test]
    fn test_directory_verify_flags_conflicts() {
        let directory = CoherencyDirectory::new();
        directory.set_state(0x0, &id("a"), MoesiState::Modified);
        directory.set_state(0x0, &id("b"), MoesiState::Exclusive);
        directory.set_state(0x40, &id("a"), MoesiState::Exclusive);
        directory.set_state(0x40, &id("b"), MoesiState::Shared);
        directory.set_state(0x80, &id("a"), MoesiState::Owned);
        directory.set_state(0x80, &id("b"), MoesiState::Shared);

        let violations = directory.verify();
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].kind, ViolationKind::MultipleOwners);
        assert_eq!(violations[1].kind, ViolationKind::ExclusiveNotAlone);
    }

    #[test]
    fn test_cache_evict_updates_directory() {
        let store = CacheLineStore::new();
        let directory = CoherencyDirectory::new();
        let a = id("a");

        store.insert(&a, CacheLine::new(0x40, a.clone(), vec![1; 64], MoesiState::Exclusive, 0));
        directory.set_state(0x40, &a, MoesiState::Exclusive);
        assert!(store.has_valid_line(&a, 0x7f));

        let evicted = store.evict(&a, 0x40, &directory).unwrap();
        assert_eq!(evicted.bytes(), &[1; 64]);
        assert!(!store.has_valid_line(&a, 0x40));
        assert_eq!(directory.get_state(0x40, &a), MoesiState::Invalid);
    }

    #[test]
    fn test_backing_store_spans_pages_and_reads_zero() {
        let backing = MemoryBackingStore::new();
        assert_eq!(backing.load(0x5000, 16).unwrap(), vec![0; 16]);

        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        backing.store(0x0fa0, &data).unwrap();
        assert_eq!(backing.resident_pages(), 2);
        assert_eq!(backing.load(0x0fa0, 200).unwrap(), data);
    }

    // ============================================================
    // TEST 2: Protocol scenarios
    // ============================================================

    #[tokio::test]
    async fn test_write_then_remote_read_sees_data() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        c.engine.write(&a, 0x1000, &[0xFF; 64]).await.unwrap();
        let data = c.engine.read(&b, 0x1000, 64).await.unwrap();

        assert_eq!(data, vec![0xFF; 64]);
        // The dirty owner keeps supplying reads as OWNED.
        assert_eq!(c.engine.state_of(&a, 0x1000), MoesiState::Owned);
        assert_eq!(c.engine.state_of(&b, 0x1000), MoesiState::Shared);
        assert!(c.engine.verify().is_empty());
    }

    #[tokio::test]
    async fn test_remote_read_downgrades_exclusive_to_shared() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        // First touch: zero-filled, EXCLUSIVE.
        assert_eq!(c.engine.read(&a, 0x2000, 8).await.unwrap(), vec![0; 8]);
        assert_eq!(c.engine.state_of(&a, 0x2000), MoesiState::Exclusive);

        c.engine.read(&b, 0x2000, 8).await.unwrap();

        assert_eq!(c.engine.state_of(&a, 0x2000), MoesiState::Shared);
        assert_eq!(c.engine.state_of(&b, 0x2000), MoesiState::Shared);
        let directory = c.engine.directory();
        assert_eq!(directory.get_sharers(0x2000), HashSet::from([a.clone(), b.clone()]));
        assert_eq!(directory.get_owner(0x2000), None);
    }

    #[tokio::test]
    async fn test_concurrent_writers_serialize_through_invalidation() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        let (first, second) = tokio::join!(
            c.engine.write(&a, 0x3000, &[0xAA; 64]),
            c.engine.write(&b, 0x3000, &[0xBB; 64]),
        );
        first.unwrap();
        second.unwrap();

        let holders = c.engine.directory().holders(0x3000);
        assert_eq!(holders.len(), 1);
        let (winner, state) = holders.into_iter().next().unwrap();
        assert_eq!(state, MoesiState::Modified);

        let expected = if winner == a { [0xAA; 64] } else { [0xBB; 64] };
        let line = c.engine.cached_line(&winner, 0x3000).unwrap();
        assert_eq!(line.bytes(), &expected);
        // The second writer built on the first writer's version.
        assert_eq!(line.version, 2);

        let loser = if winner == a { b } else { a };
        assert_eq!(c.engine.state_of(&loser, 0x3000), MoesiState::Invalid);
        assert!(c.engine.verify().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_from_silent_owner_times_out() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        c.engine.read(&a, 0x4000, 64).await.unwrap();
        c.network.mute(&a);

        let started = tokio::time::Instant::now();
        let err = c.engine.read(&b, 0x4000, 64).await.unwrap_err();

        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(6));
        match &err {
            CoherencyError::Timeout { missing, address, .. } => {
                assert_eq!(missing, &vec![a.clone()]);
                assert_eq!(*address, 0x4000);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(err.is_transient());
        assert_eq!(c.engine.state_of(&a, 0x4000), MoesiState::Exclusive);
        assert_eq!(c.engine.state_of(&b, 0x4000), MoesiState::Invalid);
        assert_eq!(c.engine.stats().timeouts, 1);
    }

    #[tokio::test]
    async fn test_multi_line_write_is_visible_to_reader() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));
        let payload: Vec<u8> = (1..=100).collect();

        c.engine.write(&a, 0x5030, &payload).await.unwrap();
        let data = c.engine.read(&b, 0x5000, 0x100).await.unwrap();

        assert_eq!(&data[0x30..0x30 + 100], payload.as_slice());
        assert!(data[..0x30].iter().all(|byte| *byte == 0));
        assert!(data[0x30 + 100..].iter().all(|byte| *byte == 0));
    }

    #[tokio::test]
    async fn test_upgrade_invalidates_every_other_copy() {
        let c = cluster(&["a", "b", "c"]);
        let (a, b, cc) = (id("a"), id("b"), id("c"));

        for node in [&a, &b, &cc] {
            c.engine.read(node, 0x6000, 64).await.unwrap();
        }
        assert_eq!(c.engine.directory().get_sharers(0x6000).len(), 3);

        c.engine.write(&a, 0x6004, &[7, 7]).await.unwrap();

        let holders = c.engine.directory().holders(0x6000);
        assert_eq!(holders.len(), 1);
        assert_eq!(holders.get(&a), Some(&MoesiState::Modified));
        assert_eq!(c.engine.state_of(&b, 0x6000), MoesiState::Invalid);
        assert_eq!(c.engine.state_of(&cc, 0x6000), MoesiState::Invalid);

        let stats = c.engine.stats();
        assert_eq!(stats.invalidations_sent, 2);
        assert_eq!(stats.invalidations_received, 2);

        // The next reader misses and sees the new bytes.
        assert_eq!(c.engine.read(&b, 0x6004, 2).await.unwrap(), vec![7, 7]);
    }

    #[tokio::test]
    async fn test_versions_increase_with_every_write() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        let mut versions = Vec::new();
        for value in 1..=3u8 {
            c.engine.write(&a, 0x7000, &[value]).await.unwrap();
            versions.push(c.engine.cached_line(&a, 0x7000).unwrap().version);
        }
        c.engine.write(&b, 0x7000, &[9]).await.unwrap();
        versions.push(c.engine.cached_line(&b, 0x7000).unwrap().version);

        assert_eq!(versions, vec![1, 2, 3, 4]);
        let stats = c.engine.stats();
        assert_eq!(stats.write_hits, 2);
        assert_eq!(stats.write_misses, 2);
    }

    // ============================================================
    // TEST 3: Eviction, flush, capacity
    // ============================================================

    #[tokio::test]
    async fn test_evict_writes_back_and_is_idempotent() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        // Nothing cached: success, no-op.
        c.engine.evict_cache_line(&a, 0x8000).await.unwrap();

        c.engine.write(&a, 0x8000, &[0x11; 64]).await.unwrap();
        c.engine.evict_cache_line(&a, 0x8000).await.unwrap();
        c.engine.evict_cache_line(&a, 0x8000).await.unwrap();

        assert_eq!(c.backing.load(0x8000, 64).unwrap(), vec![0x11; 64]);
        assert_eq!(c.engine.directory().holders(0x8000).len(), 0);

        // Re-fetched from the backing store with the retired version carried on.
        assert_eq!(c.engine.read(&b, 0x8000, 64).await.unwrap(), vec![0x11; 64]);
        assert_eq!(c.engine.cached_line(&b, 0x8000).unwrap().version, 1);
        assert_eq!(c.engine.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_flush_cleans_dirty_lines() {
        let c = cluster(&["a"]);
        let a = id("a");

        c.engine.write(&a, 0x9000, &[1; 64]).await.unwrap();
        c.engine.write(&a, 0x9040, &[2; 64]).await.unwrap();

        assert_eq!(c.engine.flush(&a).await.unwrap(), 2);
        assert_eq!(c.engine.state_of(&a, 0x9000), MoesiState::Exclusive);
        assert_eq!(c.backing.load(0x9040, 64).unwrap(), vec![2; 64]);
        assert_eq!(c.engine.flush(&a).await.unwrap(), 0);
        assert!(c.engine.verify().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_used() {
        let config = CoherencyConfig {
            max_lines_per_node: Some(2),
            ..CoherencyConfig::default()
        };
        let c = cluster_with(&["a"], config);
        let a = id("a");

        c.engine.write(&a, 0x0, &[5; 64]).await.unwrap();
        c.engine.read(&a, 0x40, 1).await.unwrap();
        c.engine.read(&a, 0x80, 1).await.unwrap();

        assert_eq!(c.engine.line_count(&a), 2);
        assert_eq!(c.engine.state_of(&a, 0x0), MoesiState::Invalid);
        // The dirty victim was written back first.
        assert_eq!(c.backing.load(0x0, 64).unwrap(), vec![5; 64]);
    }

    // ============================================================
    // TEST 4: Failure handling
    // ============================================================

    #[tokio::test(start_paused = true)]
    async fn test_partial_invalidation_leaves_writer_unchanged() {
        let c = cluster(&["a", "b", "c"]);
        let (a, b, cc) = (id("a"), id("b"), id("c"));

        for node in [&a, &b, &cc] {
            c.engine.read(node, 0xa000, 64).await.unwrap();
        }
        c.network.mute(&cc);

        let err = c.engine.write(&a, 0xa000, &[1; 64]).await.unwrap_err();
        assert!(matches!(err, CoherencyError::Timeout { ref missing, .. } if missing == &vec![cc.clone()]));

        // No local transition without every ack.
        assert_eq!(c.engine.state_of(&a, 0xa000), MoesiState::Shared);
        assert_eq!(c.engine.read(&a, 0xa000, 1).await.unwrap(), vec![0]);
        // b acknowledged and is gone; c never heard about it.
        assert_eq!(c.engine.state_of(&b, 0xa000), MoesiState::Invalid);
        assert_eq!(c.engine.state_of(&cc, 0xa000), MoesiState::Shared);
        assert!(c.engine.verify().is_empty());

        // Once c is reachable again the retry succeeds.
        c.network.unmute(&cc);
        c.engine.write(&a, 0xa000, &[1; 64]).await.unwrap();
        assert_eq!(c.engine.state_of(&cc, 0xa000), MoesiState::Invalid);
    }

    #[tokio::test]
    async fn test_unreachable_holder_fails_fast() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        c.engine.read(&b, 0xb000, 64).await.unwrap();
        c.network.disconnect(&b);

        let err = c.engine.write(&a, 0xb000, &[1]).await.unwrap_err();
        assert_eq!(
            err,
            CoherencyError::Unreachable {
                address: 0xb000,
                node: b.clone()
            }
        );
        assert!(err.is_transient());
        assert_eq!(c.engine.state_of(&b, 0xb000), MoesiState::Exclusive);
    }

    #[tokio::test]
    async fn test_stale_directory_entry_is_rejected_not_zero_filled() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        // The directory claims a owns the line but a holds nothing.
        c.engine.directory().set_state(0xc000, &a, MoesiState::Exclusive);

        let err = c.engine.read(&b, 0xc000, 64).await.unwrap_err();
        assert!(matches!(err, CoherencyError::Rejected { ref node, .. } if node == &a));
        assert!(!err.is_transient());

        let violations = c.engine.verify();
        assert_eq!(violations.len(), 1);
        assert!(matches!(
            violations[0].kind,
            ViolationKind::DirectoryMismatch {
                cached: MoesiState::Invalid,
                recorded: MoesiState::Exclusive,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_drop_node_forgets_its_lines() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        c.engine.write(&a, 0xd000, &[3; 64]).await.unwrap();
        c.engine.drop_node(&a);

        assert!(!c.engine.is_attached(&a));
        assert_eq!(c.engine.directory().holders(0xd000).len(), 0);
        // The unwritten data died with the node.
        assert_eq!(c.engine.read(&b, 0xd000, 64).await.unwrap(), vec![0; 64]);

        let err = c.engine.read(&a, 0xd000, 1).await.unwrap_err();
        assert_eq!(err, CoherencyError::UnknownNode(a));
    }

    #[tokio::test]
    async fn test_detach_node_writes_everything_back() {
        let c = cluster(&["a", "b"]);
        let a = id("a");

        c.engine.write(&a, 0xe000, &[4; 64]).await.unwrap();
        c.engine.read(&a, 0xe040, 64).await.unwrap();
        c.engine.detach_node(&a).await.unwrap();

        assert_eq!(c.engine.attached_nodes(), vec![id("b")]);
        assert_eq!(c.backing.load(0xe000, 64).unwrap(), vec![4; 64]);
        assert_eq!(c.engine.directory().tracked_addresses(), 0);
    }

    #[tokio::test]
    async fn test_writeback_is_shipped_to_remote_home() {
        let network = LocalNetwork::new();

        let home_backing = Arc::new(MemoryBackingStore::new());
        let home_engine =
            ClusterCoherencyEngine::new(CoherencyConfig::default(), home_backing.clone());
        home_engine.attach_node(network.endpoint("home"));

        let config = CoherencyConfig {
            home_node: Some("home".to_string()),
            ..CoherencyConfig::default()
        };
        let local_backing = Arc::new(MemoryBackingStore::new());
        let engine = ClusterCoherencyEngine::new(config, local_backing.clone());
        engine.attach_node(network.endpoint("a"));
        let a = id("a");

        engine.write(&a, 0xf000, &[8; 64]).await.unwrap();
        engine.evict_cache_line(&a, 0xf000).await.unwrap();

        assert_eq!(home_backing.load(0xf000, 64).unwrap(), vec![8; 64]);
        assert_eq!(local_backing.resident_pages(), 0);
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let c = cluster(&["a"]);
        let a = id("a");

        c.engine.read(&a, 0x100, 4).await.unwrap();
        c.engine.read(&a, 0x104, 4).await.unwrap();
        c.engine.read(&a, 0x108, 4).await.unwrap();

        let stats = c.engine.stats();
        assert_eq!(stats.read_misses, 1);
        assert_eq!(stats.read_hits, 2);
        assert_eq!(stats.cached_lines, 1);
        assert_eq!(stats.pending_transactions, 0);
    }

    // ============================================================
    // TEST 5: One engine per node
    // ============================================================

    #[tokio::test]
    async fn test_remote_engine_reads_the_writers_data() {
        let n = separate_engines(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        n.on("a").write(&a, 0x1000, &[0xFF; 64]).await.unwrap();
        let data = n.on("b").read(&b, 0x1000, 64).await.unwrap();

        assert_eq!(data, vec![0xFF; 64]);
        assert_eq!(n.on("a").state_of(&a, 0x1000), MoesiState::Owned);
        assert_eq!(n.on("b").state_of(&b, 0x1000), MoesiState::Shared);
        // Nothing reached the backing store yet.
        assert_eq!(n.backing.load(0x1000, 64).unwrap(), vec![0; 64]);
        n.assert_consistent();
    }

    #[tokio::test]
    async fn test_remote_engine_read_downgrades_exclusive() {
        let n = separate_engines(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        assert_eq!(n.on("a").read(&a, 0x2000, 8).await.unwrap(), vec![0; 8]);
        assert_eq!(n.on("a").state_of(&a, 0x2000), MoesiState::Exclusive);

        n.on("b").read(&b, 0x2000, 8).await.unwrap();

        assert_eq!(n.on("a").state_of(&a, 0x2000), MoesiState::Shared);
        assert_eq!(n.on("b").state_of(&b, 0x2000), MoesiState::Shared);
        // A shared copy can no longer be written in place.
        n.on("a").write(&a, 0x2000, &[1]).await.unwrap();
        assert_eq!(n.on("b").state_of(&b, 0x2000), MoesiState::Invalid);
        assert_eq!(n.on("b").read(&b, 0x2000, 2).await.unwrap(), vec![1, 0]);
        n.assert_consistent();
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_separate_engines_leave_one_owner() {
        let n = separate_engines(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        let (first, second) = tokio::join!(
            n.on("a").write(&a, 0x3000, &[0xAA; 64]),
            n.on("b").write(&b, 0x3000, &[0xBB; 64]),
        );
        first.unwrap();
        second.unwrap();

        let state_a = n.on("a").state_of(&a, 0x3000);
        let state_b = n.on("b").state_of(&b, 0x3000);
        let (winner, loser_state, expected) = match (state_a, state_b) {
            (MoesiState::Modified, other) => (&a, other, [0xAA; 64]),
            (other, MoesiState::Modified) => (&b, other, [0xBB; 64]),
            states => panic!("no single modified holder: {:?}", states),
        };
        assert_eq!(loser_state, MoesiState::Invalid);

        let engine = if winner == &a { n.on("a") } else { n.on("b") };
        let line = engine.cached_line(winner, 0x3000).unwrap();
        assert_eq!(line.bytes(), &expected);
        assert_eq!(line.version, 2);

        // Both sides now read the surviving value.
        assert_eq!(n.on("a").read(&a, 0x3000, 64).await.unwrap(), expected.to_vec());
        assert_eq!(n.on("b").read(&b, 0x3000, 64).await.unwrap(), expected.to_vec());
        n.assert_consistent();
    }

    #[tokio::test]
    async fn test_remote_write_invalidates_previous_owner() {
        let n = separate_engines(&["a", "b", "c"]);
        let (a, b, cc) = (id("a"), id("b"), id("c"));

        n.on("a").write(&a, 0x4000, &[0xFF; 64]).await.unwrap();
        n.on("c").read(&cc, 0x4000, 64).await.unwrap();
        n.on("b").write(&b, 0x4010, &[1, 2]).await.unwrap();

        assert_eq!(n.on("a").state_of(&a, 0x4000), MoesiState::Invalid);
        assert_eq!(n.on("c").state_of(&cc, 0x4000), MoesiState::Invalid);
        assert_eq!(n.on("b").state_of(&b, 0x4000), MoesiState::Modified);

        // The previous owner's dirty bytes were merged, not lost.
        let data = n.on("a").read(&a, 0x4000, 64).await.unwrap();
        assert_eq!(&data[0x10..0x12], &[1, 2]);
        assert!(data[..0x10].iter().all(|byte| *byte == 0xFF));
        assert_eq!(n.on("b").state_of(&b, 0x4000), MoesiState::Owned);
        n.assert_consistent();
    }

    #[tokio::test]
    async fn test_eviction_racing_a_write_stays_consistent() {
        let c = cluster(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        for round in 0..16u8 {
            let line = 0x8000 + u64::from(round) * CACHE_LINE_SIZE as u64;
            c.engine.read(&a, line, 64).await.unwrap();
            c.engine.read(&b, line, 64).await.unwrap();

            let data = [round; 64];
            let (written, evicted) = tokio::join!(
                c.engine.write(&a, line, &data),
                c.engine.evict_cache_line(&a, line),
            );
            written.unwrap();
            evicted.unwrap();

            assert_eq!(c.engine.read(&b, line, 64).await.unwrap(), vec![round; 64]);
            assert!(c.engine.verify().is_empty(), "round {round}");
        }
    }

    #[tokio::test]
    async fn test_eviction_racing_a_remote_read_stays_consistent() {
        let n = separate_engines(&["a", "b"]);
        let (a, b) = (id("a"), id("b"));

        for round in 0..16u8 {
            let line = 0x9000 + u64::from(round) * CACHE_LINE_SIZE as u64;
            n.on("a").write(&a, line, &[round; 64]).await.unwrap();

            let (evicted, read) = tokio::join!(
                n.on("a").evict_cache_line(&a, line),
                n.on("b").read(&b, line, 64),
            );
            evicted.unwrap();
            assert_eq!(read.unwrap(), vec![round; 64]);
            assert_eq!(n.on("a").state_of(&a, line), MoesiState::Invalid);
            assert_eq!(n.backing.load(line, 64).unwrap(), vec![round; 64]);
        }
        n.assert_consistent();
    }

    #[tokio::test]
    async fn test_write_against_a_held_line_gives_up_busy() {
        let config = CoherencyConfig {
            contention_retries: 3,
            ..CoherencyConfig::default()
        };
        let n = separate_engines_with(&["a", "b"], config);
        let (a, b) = (id("a"), id("b"));

        n.on("b").read(&b, 0x6000, 64).await.unwrap();
        n.on("b").hold_line(&b, 0x6000);

        let err = n.on("a").write(&a, 0x6000, &[1]).await.unwrap_err();
        assert_eq!(
            err,
            CoherencyError::Busy {
                address: 0x6000,
                node: b.clone()
            }
        );
        assert!(err.is_transient());
        assert_eq!(n.on("a").stats().contentions, 2);
        assert_eq!(n.on("a").state_of(&a, 0x6000), MoesiState::Invalid);
        assert_eq!(n.on("b").state_of(&b, 0x6000), MoesiState::Exclusive);

        n.on("b").release_line(&b, 0x6000);
        n.on("a").write(&a, 0x6000, &[1]).await.unwrap();
        assert_eq!(n.on("b").state_of(&b, 0x6000), MoesiState::Invalid);
        n.assert_consistent();
    }
}
