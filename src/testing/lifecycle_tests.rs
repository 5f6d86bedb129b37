//! End-to-end tests across the manager, store, scheduler, and dispatcher:
//! cross-node visibility, expiration, and primary-owner routing.

#[cfg(test)]
mod tests {
    use crate::config::SessionManagerConfig;
    use crate::expiration::{ExpirationScheduler, PrimaryOwnerScheduler};
    use crate::session::manager::SessionManager;
    use crate::session::store::{
        GridSessionStore, SessionExpirationListener, SessionStore,
    };
    use crate::testing::{key_owned_by, wait_for, LoopbackDispatcher, TestGrid};
    use crate::topology::ConsistentHashTopology;
    use crate::types::SessionId;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingExpirationListener {
        expired: Mutex<Vec<SessionId>>,
    }

    impl SessionExpirationListener for RecordingExpirationListener {
        fn session_expired(&self, id: &SessionId) {
            self.expired.lock().push(id.clone());
        }
    }

    #[tokio::test]
    async fn test_cross_node_session_visibility() {
        crate::testing::init_logging();
        let topology = Arc::new(ConsistentHashTopology::balanced(1, &[1, 2], 16, 1));
        let grid_a = TestGrid::with_topology(1, topology);
        let grid_b = grid_a.peer(2);
        let manager_a =
            SessionManager::new(grid_a.clone(), SessionManagerConfig::default()).unwrap();
        let manager_b =
            SessionManager::new(grid_b.clone(), SessionManagerConfig::default()).unwrap();

        let session = manager_a.create_session(SessionId::from("s1")).unwrap();
        session
            .set_attribute("user", Some(Bytes::from_static(b"alice")))
            .unwrap();
        session.request_done();

        let found = manager_b
            .find_session(&SessionId::from("s1"))
            .unwrap()
            .unwrap();
        assert_eq!(
            found.attribute("user").unwrap(),
            Some(Bytes::from_static(b"alice"))
        );
        found.invalidate().unwrap();

        assert!(manager_a
            .find_session(&SessionId::from("s1"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_local_context_not_replicated() {
        let topology = Arc::new(ConsistentHashTopology::balanced(1, &[1, 2], 16, 1));
        let grid_a = TestGrid::with_topology(1, topology);
        let grid_b = grid_a.peer(2);
        let manager_a =
            SessionManager::new(grid_a.clone(), SessionManagerConfig::default()).unwrap();
        let manager_b =
            SessionManager::new(grid_b.clone(), SessionManagerConfig::default()).unwrap();

        let session = manager_a.create_session(SessionId::from("s1")).unwrap();
        session
            .local_context()
            .set_websocket_channels(Some(Bytes::from_static(b"ch")));
        session.request_done();

        // The other node has its own, empty local context for the session.
        let found = manager_b
            .find_session(&SessionId::from("s1"))
            .unwrap()
            .unwrap();
        assert!(found.local_context().websocket_channels().is_none());
        found.request_done();
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expires_end_to_end() {
        let grid = TestGrid::single_node(1);
        let store = GridSessionStore::new(grid.clone(), Some(Duration::from_secs(2)));
        let listener = Arc::new(RecordingExpirationListener::default());
        store.register_expiration_listener(listener.clone());
        let scheduler = ExpirationScheduler::new(Arc::new(store.clone()));

        let session = store.create_session(SessionId::from("s1")).unwrap();
        session.close();
        scheduler.schedule(
            SessionId::from("s1"),
            store.expiration(&SessionId::from("s1")).unwrap(),
        );

        assert!(
            wait_for(|| grid.is_empty(), Duration::from_secs(10)).await,
            "session never expired"
        );
        assert_eq!(listener.expired.lock().as_slice(), &[SessionId::from("s1")]);
        assert!(store.find_session(&SessionId::from("s1")).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidation_beats_expiration() {
        let grid = TestGrid::single_node(1);
        let store = GridSessionStore::new(grid.clone(), Some(Duration::from_secs(2)));
        let listener = Arc::new(RecordingExpirationListener::default());
        store.register_expiration_listener(listener.clone());
        let scheduler = ExpirationScheduler::new(Arc::new(store.clone()));

        let session = store.create_session(SessionId::from("s1")).unwrap();
        scheduler.schedule(
            SessionId::from("s1"),
            store.expiration(&SessionId::from("s1")).unwrap(),
        );
        session.invalidate().unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        // The timer fired but found nothing; no expiration is reported.
        assert!(listener.expired.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remote_owner_gets_the_timer() {
        let topology = Arc::new(ConsistentHashTopology::balanced(1, &[1, 2], 16, 1));
        let grid_a = TestGrid::with_topology(1, topology.clone());
        let grid_b = grid_a.peer(2);
        let store_a = GridSessionStore::new(grid_a.clone(), Some(Duration::from_secs(60)));
        let store_b = GridSessionStore::new(grid_b.clone(), Some(Duration::from_secs(60)));

        let scheduler_a = ExpirationScheduler::new(Arc::new(store_a.clone()));
        let scheduler_b = ExpirationScheduler::new(Arc::new(store_b.clone()));
        let dispatcher = Arc::new(LoopbackDispatcher::new());
        dispatcher.register(2, scheduler_b.clone());
        let primary = PrimaryOwnerScheduler::new(grid_a.clone(), scheduler_a.clone(), dispatcher.clone());

        let key = key_owned_by(&topology, 2);
        store_a.create_session(key.id().clone()).unwrap().close();
        primary
            .schedule(key.id().clone(), store_a.expiration(key.id()).unwrap())
            .await
            .unwrap();

        assert!(scheduler_b.contains(key.id()));
        assert!(!scheduler_a.contains(key.id()));
        assert_eq!(dispatcher.sent().len(), 1);

        primary.cancel(key.id().clone()).await.unwrap();
        assert!(!scheduler_b.contains(key.id()));
    }

    #[tokio::test]
    async fn test_batches_commit_on_request_done() {
        let grid = TestGrid::single_node(1);
        let manager = SessionManager::new(grid.clone(), SessionManagerConfig::default()).unwrap();
        let batcher = grid.simple_batcher();

        let session = manager.create_session(SessionId::from("s1")).unwrap();
        session.request_done();
        assert_eq!(batcher.created_count(), 1);
        assert_eq!(batcher.committed_count(), 1);
        assert_eq!(batcher.rolled_back_count(), 0);
    }

    #[tokio::test]
    async fn test_affinity_biased_identifiers() {
        let grid = TestGrid::single_node(1);
        let manager = SessionManager::new(grid.clone(), SessionManagerConfig::default()).unwrap();
        manager.start();

        let id = manager.create_identifier().await;
        let key = crate::types::SessionKey::new(id.clone());
        assert_eq!(grid.topology().unwrap().primary_owner(&key), Some(1));

        let session = manager.create_session(id.clone()).unwrap();
        assert_eq!(session.id(), id);
        session.request_done();
        manager.stop();
    }
}
