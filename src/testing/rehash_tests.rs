//! Integration tests for the topology-change coordinator: timers follow
//! primary ownership across rehashes and view changes.

#[cfg(test)]
mod tests {
    use crate::expiration::ExpirationScheduler;
    use crate::session::store::{GridSessionStore, SessionStore};
    use crate::testing::{key_owned_by, wait_for, TestGrid};
    use crate::topology::{ConsistentHashTopology, TopologyChangeCoordinator};
    use crate::types::SessionKey;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        grid: Arc<TestGrid>,
        store: GridSessionStore,
        scheduler: ExpirationScheduler,
    }

    impl Fixture {
        fn new(grid: Arc<TestGrid>) -> Self {
            crate::testing::init_logging();
            let store = GridSessionStore::new(grid.clone(), Some(Duration::from_secs(300)));
            let scheduler = ExpirationScheduler::new(Arc::new(store.clone()));
            Self {
                grid,
                store,
                scheduler,
            }
        }

        fn start_coordinator(&self, requires_state_transfer: bool) -> crate::topology::CoordinatorHandle {
            TopologyChangeCoordinator::new(
                self.grid.clone(),
                Arc::new(self.store.clone()),
                self.scheduler.clone(),
                requires_state_transfer,
            )
            .start()
        }

        fn seed_session(&self, key: &SessionKey) {
            self.store
                .create_session(key.id().clone())
                .unwrap()
                .close();
        }
    }

    #[tokio::test]
    async fn test_rehash_schedules_newly_local_sessions() {
        // Node 2 owns everything; after the rehash node 1 takes over some
        // segments and must pick up their timers.
        let before = Arc::new(ConsistentHashTopology::balanced(1, &[2], 16, 1));
        let after = Arc::new(ConsistentHashTopology::balanced(2, &[1, 2], 16, 1));
        let grid = TestGrid::with_topology(1, before);
        let fixture = Fixture::new(grid.clone());

        let incoming = key_owned_by(&after, 1);
        let staying = key_owned_by(&after, 2);
        fixture.seed_session(&incoming);
        fixture.seed_session(&staying);

        let coordinator = fixture.start_coordinator(true);
        grid.install_rehash(after);

        assert!(
            wait_for(
                || fixture.scheduler.contains(incoming.id()),
                Duration::from_secs(5),
            )
            .await,
            "timer for the handed-over session never appeared"
        );
        assert!(!fixture.scheduler.contains(staying.id()));
        coordinator.stop();
    }

    #[tokio::test]
    async fn test_rehash_cancels_departing_sessions() {
        let before = Arc::new(ConsistentHashTopology::balanced(1, &[1], 16, 1));
        let after = Arc::new(ConsistentHashTopology::balanced(2, &[1, 2], 16, 1));
        let grid = TestGrid::with_topology(1, before);
        let fixture = Fixture::new(grid.clone());

        // Scheduled here while node 1 owned it; ownership moves to node 2.
        let departing = key_owned_by(&after, 2);
        fixture.seed_session(&departing);
        fixture.scheduler.schedule(
            departing.id().clone(),
            fixture.store.expiration(departing.id()).unwrap(),
        );

        let coordinator = fixture.start_coordinator(true);
        grid.install_rehash(after);

        assert!(
            wait_for(
                || !fixture.scheduler.contains(departing.id()),
                Duration::from_secs(5),
            )
            .await,
            "timer for the departing session was never cancelled"
        );
        coordinator.stop();
    }

    #[tokio::test]
    async fn test_handoff_arms_timer_on_exactly_one_node() {
        // One rehash observed by coordinators on both peers: the timer for a
        // moved session must settle on the new owner and nowhere else, while
        // an unmoved session keeps its single timer on the old owner.
        let before = Arc::new(ConsistentHashTopology::balanced(1, &[2], 16, 1));
        let after = Arc::new(ConsistentHashTopology::balanced(2, &[1, 2], 16, 1));
        let grid_a = TestGrid::with_topology(1, before);
        let grid_b = grid_a.peer(2);
        let fixture_a = Fixture::new(grid_a.clone());
        let fixture_b = Fixture::new(grid_b);

        let moved = key_owned_by(&after, 1);
        let staying = key_owned_by(&after, 2);
        fixture_b.seed_session(&moved);
        fixture_b.seed_session(&staying);
        fixture_b.scheduler.schedule(
            moved.id().clone(),
            fixture_b.store.expiration(moved.id()).unwrap(),
        );
        fixture_b.scheduler.schedule(
            staying.id().clone(),
            fixture_b.store.expiration(staying.id()).unwrap(),
        );

        let coordinator_a = fixture_a.start_coordinator(true);
        let coordinator_b = fixture_b.start_coordinator(true);
        grid_a.install_rehash(after);

        assert!(
            wait_for(
                || {
                    fixture_a.scheduler.contains(moved.id())
                        && !fixture_b.scheduler.contains(moved.id())
                },
                Duration::from_secs(5),
            )
            .await,
            "timer did not settle on the new owner"
        );
        assert!(fixture_b.scheduler.contains(staying.id()));
        assert!(!fixture_a.scheduler.contains(staying.id()));
        coordinator_a.stop();
        coordinator_b.stop();
    }

    #[tokio::test]
    async fn test_member_leave_without_state_transfer_reschedules() {
        // Invalidation-mode caches move no data; a leave still shifts
        // ownership, and every session the survivor now owns needs a timer.
        let before = Arc::new(ConsistentHashTopology::balanced(1, &[1, 2], 16, 1));
        let after = Arc::new(ConsistentHashTopology::balanced(2, &[1], 16, 1));
        let grid = TestGrid::with_topology(1, before.clone());
        let fixture = Fixture::new(grid.clone());

        let orphaned = key_owned_by(&before, 2);
        fixture.seed_session(&orphaned);

        let coordinator = fixture.start_coordinator(false);
        grid.install_topology(after);

        assert!(
            wait_for(
                || fixture.scheduler.contains(orphaned.id()),
                Duration::from_secs(5),
            )
            .await,
            "orphaned session never rescheduled after the leave"
        );
        coordinator.stop();
    }

    #[tokio::test]
    async fn test_member_join_without_state_transfer_is_ignored() {
        let before = Arc::new(ConsistentHashTopology::balanced(1, &[1], 16, 1));
        let after = Arc::new(ConsistentHashTopology::balanced(2, &[1, 2], 16, 1));
        let grid = TestGrid::with_topology(1, before.clone());
        let fixture = Fixture::new(grid.clone());

        let key = key_owned_by(&before, 1);
        fixture.seed_session(&key);

        let coordinator = fixture.start_coordinator(false);
        grid.install_topology(after);

        // No members left and no data moved; nothing to reschedule.
        assert!(
            !wait_for(|| fixture.scheduler.contains(key.id()), Duration::from_millis(300)).await
        );
        coordinator.stop();
    }

    #[tokio::test]
    async fn test_no_primary_segments_skips_pass() {
        // Node 1 never becomes a primary owner; the pass must not run.
        let before = Arc::new(ConsistentHashTopology::balanced(1, &[2], 16, 1));
        let after = Arc::new(ConsistentHashTopology::balanced(2, &[2, 3], 16, 1));
        let grid = TestGrid::with_topology(1, before);
        let fixture = Fixture::new(grid.clone());

        let key = key_owned_by(&after, 2);
        fixture.seed_session(&key);

        let coordinator = fixture.start_coordinator(true);
        grid.install_rehash(after);

        assert!(
            !wait_for(|| fixture.scheduler.contains(key.id()), Duration::from_millis(300)).await
        );
        coordinator.stop();
    }

    #[tokio::test]
    async fn test_passivated_sessions_covered_by_pass() {
        let before = Arc::new(ConsistentHashTopology::balanced(1, &[2], 16, 1));
        let after = Arc::new(ConsistentHashTopology::balanced(2, &[1, 2], 16, 1));
        let grid = TestGrid::with_topology(1, before);
        let fixture = Fixture::new(grid.clone());

        let incoming = key_owned_by(&after, 1);
        fixture.seed_session(&incoming);
        grid.mark_passivated(&incoming);

        let coordinator = fixture.start_coordinator(true);
        grid.install_rehash(after);

        assert!(
            wait_for(
                || fixture.scheduler.contains(incoming.id()),
                Duration::from_secs(5),
            )
            .await,
            "passivated session skipped by the scheduling pass"
        );
        coordinator.stop();
    }

    #[tokio::test]
    async fn test_rehash_marker_visible_in_flight() {
        let before = Arc::new(ConsistentHashTopology::balanced(1, &[1], 16, 1));
        let after = Arc::new(ConsistentHashTopology::balanced(7, &[1, 2], 16, 1));
        let grid = TestGrid::with_topology(1, before);
        let fixture = Fixture::new(grid.clone());

        let coordinator = fixture.start_coordinator(true);
        grid.emit(crate::grid::TopologyEvent::RehashPre {
            topology_id: 7,
            start: grid.topology().unwrap(),
            end: after.clone(),
        });
        assert!(
            wait_for(
                || coordinator.rehash_in_progress() == Some(7),
                Duration::from_secs(5),
            )
            .await
        );

        grid.emit(crate::grid::TopologyEvent::RehashPost {
            topology_id: 7,
            start: grid.topology().unwrap(),
            end: after,
        });
        assert!(
            wait_for(
                || coordinator.rehash_in_progress().is_none(),
                Duration::from_secs(5),
            )
            .await
        );
        coordinator.stop();
    }
}
