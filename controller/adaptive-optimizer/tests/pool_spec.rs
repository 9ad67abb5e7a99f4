use adaptive_optimizer::error::PoolError;
use adaptive_optimizer::model::ConnectionParameters;
use adaptive_optimizer::pool::ConnectionPoolManager;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn params(pool_size: u32) -> ConnectionParameters {
    ConnectionParameters {
        pool_size,
        timeout: Duration::from_secs(5),
        retry_backoff: Duration::from_millis(100),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn given_concurrent_acquirers_when_pool_is_contended_then_active_never_exceeds_pool_size() {
    let manager = Arc::new(ConnectionPoolManager::new(50));
    manager.register("orders", params(5)).unwrap();
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let manager = manager.clone();
        let active = active.clone();
        let peak = peak.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let permit = manager.acquire("orders").await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let stats = manager.stats("orders").unwrap();
                assert!(stats.in_use <= stats.pool_size);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                manager.release(permit);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 5);
    let stats = manager.stats("orders").unwrap();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.acquired_total, 32 * 20);
}

#[tokio::test(start_paused = true)]
async fn given_grown_pool_when_waiter_is_blocked_then_it_is_admitted() {
    let manager = Arc::new(ConnectionPoolManager::new(50));
    manager.register("orders", params(1)).unwrap();
    let _held = manager.acquire("orders").await.unwrap();

    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.acquire("orders").await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.apply_parameters("orders", params(2)).unwrap();

    assert!(waiter.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn given_saturated_pool_when_timeout_elapses_then_backpressure_not_failure() {
    let manager = ConnectionPoolManager::new(50);
    manager
        .register(
            "orders",
            ConnectionParameters {
                timeout: Duration::from_millis(250),
                ..params(1)
            },
        )
        .unwrap();
    let _held = manager.acquire("orders").await.unwrap();

    let err = manager.acquire("orders").await.unwrap_err();

    assert_eq!(
        err,
        PoolError::Saturated {
            point_id: "orders".into(),
            waited: Duration::from_millis(250),
        }
    );
}
