//! Integration tests for UnitOfWork
//!
//! These tests verify:
//! 1. Atomic commit across a domain store, the outbox and the receipt ledger
//! 2. Idempotent replay of a completed key
//! 3. Rollback on store failure, explicit rollback and drop
//! 4. Concurrent duplicates (fail fast and wait)
//! 5. Deadlines on begin and commit
//! 6. Engine write conflicts and retry with the same key

mod common;

use common::{TestHarness, NOTES_STORE};
use memoria_shared::{InFlightPolicy, UnitOfWorkState};
use memoria_storage_core::{IdempotencyKey, NewOutboxEvent, RetryPolicy, StorageError};
use memoria_storage_sqlite::{BeginOptions, Begun};
use serde_json::json;
use std::time::Duration;

fn memory_created(memory_id: &str) -> NewOutboxEvent {
    NewOutboxEvent::new(
        "Memory",
        memory_id,
        "MEMORY_CREATED",
        json!({"memory_id": memory_id}),
    )
}

#[tokio::test]
async fn test_commit_is_atomic_across_store_outbox_and_ledger() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let factory = h.runtime.units_of_work();

    let mut uow = factory
        .begin(BeginOptions::new().with_operation("create_memory"))
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;
    assert_eq!(uow.state(), UnitOfWorkState::Active);

    uow.register_store(h.notes_handle)?;
    h.notes.stage(uow.id(), "memory-1", "first birthday");
    let event_id = uow.enqueue_outbox(memory_created("memory-1"))?;
    uow.set_result(json!({"memory_id": "memory-1"}))?;

    let outcome = uow.commit().await?;
    assert_eq!(uow.state(), UnitOfWorkState::Committed);
    assert_eq!(outcome.event_ids, vec![event_id]);
    assert_eq!(outcome.result, json!({"memory_id": "memory-1"}));
    assert_eq!(outcome.receipt.sequence, 1);
    assert_eq!(outcome.receipt.stores_affected, vec![NOTES_STORE.to_string()]);

    assert_eq!(h.note("memory-1").await?.as_deref(), Some("first birthday"));
    let event = h
        .runtime
        .outbox()
        .get(event_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("outbox event missing"))?;
    assert_eq!(event.sequence_number, 1);
    assert_eq!(event.delivery_attempts, 0);
    assert_eq!(event.unit_of_work_id, Some(outcome.unit_of_work_id));

    let receipt = h
        .runtime
        .ledger()
        .find_by_unit_of_work(outcome.unit_of_work_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("receipt missing"))?;
    assert_eq!(receipt, outcome.receipt);
    assert!(h.runtime.ledger().verify_all().await?.is_intact());

    assert_eq!(h.count("unit_of_work_log").await?, 1);
    assert_eq!(h.notes.commits(), 1);
    assert_eq!(h.runtime.pool().stats().leased, 0);
    Ok(())
}

#[tokio::test]
async fn test_completed_key_is_replayed_without_side_effects() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let factory = h.runtime.units_of_work();
    let request = json!({"title": "beach trip", "owner": "family-7"});
    let key = IdempotencyKey::derive("create_memory", &request)?;

    let mut uow = factory
        .begin(BeginOptions::new().with_idempotency_key(key.clone()))
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;
    uow.register_store(h.notes_handle)?;
    h.notes.stage(uow.id(), "memory-2", "beach trip");
    uow.enqueue_outbox(memory_created("memory-2"))?;
    uow.set_result(json!({"memory_id": "memory-2"}))?;
    let first = uow.commit().await?;

    let again = IdempotencyKey::derive("create_memory", &json!({"owner": "family-7", "title": "beach trip"}))?;
    assert_eq!(again, key);

    match factory.begin(BeginOptions::new().with_idempotency_key(again)).await? {
        Begun::Replayed(cached) => {
            assert_eq!(cached.result, json!({"memory_id": "memory-2"}));
            assert_eq!(cached.unit_of_work_id, Some(first.unit_of_work_id));
            assert_eq!(cached.receipt_id, Some(first.receipt.id));
        }
        Begun::Started(_) => anyhow::bail!("completed key must be replayed"),
    }

    assert_eq!(h.count("notes").await?, 1);
    assert_eq!(h.count("outbox_events").await?, 1);
    assert_eq!(h.count("write_receipts").await?, 1);
    assert_eq!(h.runtime.metrics().idempotency_replays.get(), 1);
    Ok(())
}

#[tokio::test]
async fn test_store_failure_rolls_back_everything_and_frees_the_key() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let factory = h.runtime.units_of_work();
    let key = IdempotencyKey::from_raw("req-42");

    let mut uow = factory
        .begin(BeginOptions::new().with_idempotency_key(key.clone()))
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;
    uow.register_store(h.notes_handle)?;
    h.notes.stage(uow.id(), "memory-3", "never written");
    uow.enqueue_outbox(memory_created("memory-3"))?;
    h.notes.fail_next();

    let err = uow.commit().await.unwrap_err();
    assert!(matches!(err, StorageError::Store { .. }), "got {err:?}");
    assert_eq!(uow.state(), UnitOfWorkState::RolledBack);
    assert_eq!(h.notes.rollbacks(), 1);

    assert_eq!(h.count("notes").await?, 0);
    assert_eq!(h.count("outbox_events").await?, 0);
    assert_eq!(h.count("write_receipts").await?, 0);
    assert_eq!(h.count("unit_of_work_log").await?, 0);
    assert_eq!(h.count("idempotency_keys").await?, 0);

    // the caller retries with the same key and succeeds
    let mut retry = factory
        .begin(
            BeginOptions::new()
                .with_idempotency_key(key)
                .with_in_flight_policy(InFlightPolicy::Fail),
        )
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("released key must start fresh"))?;
    retry.register_store(h.notes_handle)?;
    h.notes.stage(retry.id(), "memory-3", "second try");
    retry.commit().await?;
    assert_eq!(h.note("memory-3").await?.as_deref(), Some("second try"));
    Ok(())
}

#[tokio::test]
async fn test_explicit_rollback_is_idempotent() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let mut uow = h
        .runtime
        .units_of_work()
        .begin(BeginOptions::new())
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;
    uow.register_store(h.notes_handle)?;
    uow.register_store(h.notes_handle)?;
    assert_eq!(uow.participants(), vec![NOTES_STORE]);
    uow.enqueue_outbox(memory_created("memory-4"))?;

    uow.rollback().await?;
    uow.rollback().await?;
    assert_eq!(uow.state(), UnitOfWorkState::RolledBack);
    assert_eq!(h.notes.rollbacks(), 1);
    assert_eq!(h.count("outbox_events").await?, 0);

    assert!(matches!(
        uow.enqueue_outbox(memory_created("memory-4")),
        Err(StorageError::InvalidState { .. })
    ));
    assert!(matches!(
        uow.commit().await,
        Err(StorageError::InvalidState { .. })
    ));
    assert_eq!(h.runtime.pool().stats().leased, 0);
    Ok(())
}

#[tokio::test]
async fn test_sequence_numbers_are_per_aggregate() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let factory = h.runtime.units_of_work();

    for events in [vec!["album-1", "album-1"], vec!["album-2", "album-1"]] {
        let mut uow = factory
            .begin(BeginOptions::new())
            .await?
            .into_started()
            .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;
        for aggregate in events {
            uow.enqueue_outbox(NewOutboxEvent::new(
                "Album",
                aggregate,
                "PHOTO_ADDED",
                json!({}),
            ))?;
        }
        uow.commit().await?;
    }

    let album_1: Vec<i64> = h
        .runtime
        .outbox()
        .list_by_aggregate("album-1")
        .await?
        .iter()
        .map(|e| e.sequence_number)
        .collect();
    let album_2: Vec<i64> = h
        .runtime
        .outbox()
        .list_by_aggregate("album-2")
        .await?
        .iter()
        .map(|e| e.sequence_number)
        .collect();
    assert_eq!(album_1, vec![1, 2, 3]);
    assert_eq!(album_2, vec![1]);
    Ok(())
}

#[tokio::test]
async fn test_in_flight_duplicate_fails_fast_or_waits() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let factory = h.runtime.units_of_work().clone();
    let key = IdempotencyKey::from_raw("upload-photo-9");

    let mut owner = factory
        .begin(BeginOptions::new().with_idempotency_key(key.clone()))
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;
    owner.set_result(json!({"photo_id": 9}))?;

    let err = factory
        .begin(
            BeginOptions::new()
                .with_idempotency_key(key.clone())
                .with_in_flight_policy(InFlightPolicy::Fail),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::IdempotencyInFlight { .. }));
    assert!(err.is_retryable());

    let waiter = {
        let factory = factory.clone();
        let key = key.clone();
        tokio::spawn(async move {
            factory
                .begin(
                    BeginOptions::new()
                        .with_idempotency_key(key)
                        .with_in_flight_policy(InFlightPolicy::Wait),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    owner.commit().await?;

    match waiter.await?? {
        Begun::Replayed(cached) => assert_eq!(cached.result, json!({"photo_id": 9})),
        Begun::Started(_) => anyhow::bail!("waiter must observe the owner's result"),
    }
    Ok(())
}

#[tokio::test]
async fn test_deadline_while_waiting_for_in_flight_key() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let factory = h.runtime.units_of_work();
    let key = IdempotencyKey::from_raw("slow-request");

    let mut owner = factory
        .begin(BeginOptions::new().with_idempotency_key(key.clone()))
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;

    let err = factory
        .begin(
            BeginOptions::new()
                .with_idempotency_key(key)
                .with_timeout(Duration::from_millis(150)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::DeadlineExceeded { .. }), "got {err:?}");
    // the waiter registration goes away with the waiter, not with the owner
    assert_eq!(h.runtime.idempotency().waiting_keys(), 0);

    owner.rollback().await?;
    Ok(())
}

#[tokio::test]
async fn test_commit_deadline_rolls_back_when_write_lock_is_held() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let key = IdempotencyKey::from_raw("blocked-commit");

    let mut uow = h
        .runtime
        .units_of_work()
        .begin(BeginOptions::new().with_idempotency_key(key.clone()))
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;
    uow.register_store(h.notes_handle)?;
    h.notes.stage(uow.id(), "memory-5", "blocked");

    let mut blocker = h.runtime.pool().acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *blocker).await?;

    let err = uow
        .commit_with_deadline(Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::DeadlineExceeded { .. }), "got {err:?}");
    assert_eq!(uow.state(), UnitOfWorkState::RolledBack);

    sqlx::query("ROLLBACK").execute(&mut *blocker).await?;
    blocker.release().await;

    assert_eq!(h.note("memory-5").await?, None);
    assert_eq!(h.count("write_receipts").await?, 0);

    // the reservation is released in the background once the lock frees up
    let mut released = false;
    for _ in 0..50 {
        if h.count("idempotency_keys").await? == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "reservation should be released after a deadline");
    Ok(())
}

#[tokio::test]
async fn test_dropped_unit_of_work_rolls_back_and_releases_key() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let factory = h.runtime.units_of_work();
    let key = IdempotencyKey::from_raw("abandoned");

    {
        let mut uow = factory
            .begin(BeginOptions::new().with_idempotency_key(key.clone()))
            .await?
            .into_started()
            .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;
        uow.register_store(h.notes_handle)?;
        uow.enqueue_outbox(memory_created("memory-6"))?;
    }

    let mut started = None;
    for _ in 0..50 {
        match factory
            .begin(
                BeginOptions::new()
                    .with_idempotency_key(key.clone())
                    .with_in_flight_policy(InFlightPolicy::Fail),
            )
            .await
        {
            Ok(Begun::Started(uow)) => {
                started = Some(uow);
                break;
            }
            Err(StorageError::IdempotencyInFlight { .. }) => {
                tokio::time::sleep(Duration::from_millis(20)).await
            }
            other => anyhow::bail!("unexpected begin outcome: {other:?}"),
        }
    }

    let mut uow = started.ok_or_else(|| anyhow::anyhow!("key was never released"))?;
    uow.rollback().await?;
    assert_eq!(h.count("outbox_events").await?, 0);
    assert_eq!(h.count("unit_of_work_log").await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_write_conflict_is_retryable_with_the_same_key() -> anyhow::Result<()> {
    let h = TestHarness::with_config(common::TestDatabase::new()?, |config| {
        config.database.busy_timeout_ms = 50;
    })
    .await?;
    let factory = h.runtime.units_of_work();
    let key = IdempotencyKey::from_raw("conflicting-write");

    let mut uow = factory
        .begin(BeginOptions::new().with_idempotency_key(key.clone()))
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;
    uow.register_store(h.notes_handle)?;
    h.notes.stage(uow.id(), "memory-7", "first try");

    let mut blocker = h.runtime.pool().acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *blocker).await?;

    let err = uow.commit().await.unwrap_err();
    assert!(matches!(err, StorageError::TransactionConflict { .. }), "got {err:?}");
    assert!(err.is_retryable());
    assert_eq!(uow.state(), UnitOfWorkState::RolledBack);

    sqlx::query("ROLLBACK").execute(&mut *blocker).await?;
    blocker.release().await;

    // the reservation outlives the conflicting writer only briefly
    let mut released = false;
    for _ in 0..100 {
        if h.count("idempotency_keys").await? == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "reservation should be released after a conflict");

    let mut retry = factory
        .begin(
            BeginOptions::new()
                .with_idempotency_key(key)
                .with_in_flight_policy(InFlightPolicy::Fail),
        )
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("retry must start fresh"))?;
    retry.register_store(h.notes_handle)?;
    h.notes.stage(retry.id(), "memory-7", "second try");
    retry.commit().await?;

    assert_eq!(h.note("memory-7").await?.as_deref(), Some("second try"));
    assert_eq!(h.count("write_receipts").await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_produce_one_side_effect() -> anyhow::Result<()> {
    const CALLERS: usize = 8;
    let h = TestHarness::with_config(common::TestDatabase::new()?, |config| {
        config.database.max_connections = CALLERS as u32;
        config.unit_of_work.in_flight_timeout_ms = 5_000;
    })
    .await?;
    let key = IdempotencyKey::derive("create_memory", &json!({"title": "first steps"}))?;

    let mut tasks = Vec::with_capacity(CALLERS);
    for caller in 0..CALLERS {
        let factory = h.runtime.units_of_work().clone();
        let notes = h.notes.clone();
        let handle = h.notes_handle;
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            match factory
                .begin(BeginOptions::new().with_idempotency_key(key))
                .await?
            {
                Begun::Replayed(cached) => Ok::<_, anyhow::Error>(cached.result),
                Begun::Started(mut uow) => {
                    uow.register_store(handle)?;
                    notes.stage(uow.id(), "memory-8", &format!("caller-{caller}"));
                    uow.set_result(json!({"memory_id": 8, "caller": caller}))?;
                    Ok(uow.commit().await?.result)
                }
            }
        }));
    }

    let mut results = Vec::with_capacity(CALLERS);
    for task in tasks {
        results.push(task.await??);
    }

    assert_eq!(h.count("notes").await?, 1);
    assert_eq!(h.count("write_receipts").await?, 1);
    assert!(results.iter().all(|r| *r == results[0]), "{results:?}");
    assert_eq!(
        h.runtime.metrics().idempotency_replays.get(),
        (CALLERS - 1) as u64
    );
    Ok(())
}

#[tokio::test]
async fn test_event_with_shrinking_backoff_is_rejected_at_enqueue() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let mut uow = h
        .runtime
        .units_of_work()
        .begin(BeginOptions::new())
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;

    let err = uow
        .enqueue_outbox(
            memory_created("memory-9").with_retry_policy(RetryPolicy::new(3, 1_000, 60_000, 0.5)),
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidRetryPolicy(_)), "got {err:?}");
    assert!(!err.is_retryable());

    uow.enqueue_outbox(
        memory_created("memory-9").with_retry_policy(RetryPolicy::new(5, 100, 1_000, 1.5)),
    )?;
    let outcome = uow.commit().await?;
    let event = h
        .runtime
        .outbox()
        .get(outcome.event_ids[0])
        .await?
        .ok_or_else(|| anyhow::anyhow!("event missing"))?;
    assert_eq!(event.retry_policy, RetryPolicy::new(5, 100, 1_000, 1.5));
    Ok(())
}
