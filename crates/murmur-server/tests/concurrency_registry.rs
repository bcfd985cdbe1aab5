//! Concurrency stress for the connection registry: parallel admits,
//! removals, and fan-outs must never lose or double-deliver frames to the
//! surviving connections.

use murmur_server::registry::{ConnectionRegistry, SESSION_BUFFER};
use tokio::sync::mpsc;
use uuid::Uuid;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_admit_and_remove_leaves_a_consistent_map() {
    let registry = ConnectionRegistry::new();

    let mut handles = Vec::new();
    for user in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let user_id = format!("user_{user}");
            let mut keep = Vec::new();
            for i in 0..50 {
                let conn_id = Uuid::new_v4();
                let (tx, rx) = mpsc::channel(SESSION_BUFFER);
                registry.admit(&user_id, conn_id, tx).await;
                if i % 2 == 0 {
                    registry.remove(&user_id, conn_id).await;
                } else {
                    keep.push((conn_id, rx));
                }
            }
            (user_id, keep)
        }));
    }

    for handle in handles {
        let (user_id, keep) = handle.await.expect("task completes");
        assert_eq!(registry.connection_count(&user_id).await, keep.len());

        let delivered = registry.fan_out(&user_id, "ping", Uuid::new_v4()).await;
        assert_eq!(delivered, keep.len());
        for (_, mut rx) in keep {
            assert_eq!(rx.try_recv().ok().as_deref(), Some("ping"));
            assert!(rx.try_recv().is_err(), "exactly one delivery per peer");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fan_outs_do_not_interfere_across_users() {
    let registry = ConnectionRegistry::new();

    let (a_tx, mut a_rx) = mpsc::channel(SESSION_BUFFER);
    registry.admit("alice", Uuid::new_v4(), a_tx).await;
    let (b_tx, mut b_rx) = mpsc::channel(SESSION_BUFFER);
    registry.admit("bob", Uuid::new_v4(), b_tx).await;

    let mut handles = Vec::new();
    for i in 0..100 {
        let registry = registry.clone();
        let (user, payload) = if i % 2 == 0 {
            ("alice", "for-alice")
        } else {
            ("bob", "for-bob")
        };
        handles.push(tokio::spawn(async move {
            registry.fan_out(user, payload, Uuid::new_v4()).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("task completes"), 1);
    }

    for _ in 0..50 {
        assert_eq!(a_rx.try_recv().ok().as_deref(), Some("for-alice"));
        assert_eq!(b_rx.try_recv().ok().as_deref(), Some("for-bob"));
    }
    assert!(a_rx.try_recv().is_err());
    assert!(b_rx.try_recv().is_err());
}
