//! Concurrent redemption of a single-use capability.
//!
//! Exactly one attempt may win, whether the racers share one store handle
//! or hold separate connections to the same file.

mod common;

use common::{issuance, redemption, service, RecordingDispatch};
use sealgate_core::{CapabilityError, CapabilityService, ExecutionResult, KeyStore};
use std::sync::Arc;
use tempfile::NamedTempFile;

fn tally(results: &[Result<ExecutionResult, CapabilityError>]) -> (usize, usize) {
    let wins = results.iter().filter(|r| r.is_ok()).count();
    let losses = results
        .iter()
        .filter(|r| {
            matches!(
                r,
                Err(CapabilityError::UsesExceeded | CapabilityError::UnknownKey)
            )
        })
        .count();
    (wins, losses)
}

async fn race_shared_store(n: usize) {
    let dispatch = RecordingDispatch::new();
    let svc = Arc::new(service(KeyStore::memory().unwrap(), dispatch.clone()));
    let token = svc.issue(&issuance(1, 0)).unwrap();

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let svc = Arc::clone(&svc);
            let req = redemption(&token);
            tokio::spawn(async move { svc.redeem(&req).await })
        })
        .collect();

    let mut results = Vec::with_capacity(n);
    for h in handles {
        results.push(h.await.unwrap());
    }

    assert_eq!(tally(&results), (1, n - 1), "n = {n}");
    assert_eq!(dispatch.calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_single_use_two_racers() {
    race_shared_store(2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_single_use_ten_racers() {
    race_shared_store(10).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_single_use_hundred_racers() {
    race_shared_store(100).await;
}

/// Separate SQLite connections on one file, one per thread.
#[test]
fn test_single_use_across_connections() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();

    let issuer = service(KeyStore::open(&path).unwrap(), RecordingDispatch::new());
    let token = issuer.issue(&issuance(1, 0)).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let path = path.clone();
            let req = redemption(&token);
            std::thread::spawn(move || {
                let svc: CapabilityService<RecordingDispatch> =
                    service(KeyStore::open(&path).unwrap(), RecordingDispatch::new());
                svc.authorize(&req).map(|ok| ok.uses)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let wins: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();

    assert_eq!(wins, vec![&1]);
    assert!(results.iter().all(|r| matches!(
        r,
        Ok(1) | Err(CapabilityError::UsesExceeded | CapabilityError::UnknownKey)
    )));
    assert!(issuer.store().fetch(&token.key_id).unwrap().is_none());
}

/// A bounded key charged from many connections never exceeds its limit.
#[test]
fn test_bounded_uses_across_connections() {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_path_buf();
    let store = KeyStore::open(&path).unwrap();
    let key = store.mint(b"material", 5, 0).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let key_id = key.key_id.clone();
            std::thread::spawn(move || {
                let store = KeyStore::open(&path).unwrap();
                (0..5)
                    .filter(|_| {
                        matches!(
                            store.consume_use(&key_id),
                            Ok(sealgate_core::ConsumeOutcome::Consumed { .. })
                        )
                    })
                    .count()
            })
        })
        .collect();

    let consumed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(consumed, 5);
    assert!(store.fetch(&key.key_id).unwrap().is_none());
}
