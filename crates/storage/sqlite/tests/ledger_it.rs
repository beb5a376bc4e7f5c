//! Integration tests for ReceiptLedger

mod common;

use chrono::Utc;
use common::{app_migrations, TestHarness};
use memoria_storage_core::ledger::BreakKind;
use memoria_storage_core::{StorageError, StoreRegistry, WriteReceipt};
use memoria_storage_sqlite::{BeginOptions, StorageRuntime};
use std::time::Duration;

async fn commit_note(h: &TestHarness, key: &str) -> anyhow::Result<WriteReceipt> {
    let mut uow = h
        .runtime
        .units_of_work()
        .begin(BeginOptions::new())
        .await?
        .into_started()
        .ok_or_else(|| anyhow::anyhow!("expected a fresh unit of work"))?;
    uow.register_store(h.notes_handle)?;
    h.notes.stage(uow.id(), key, "value");
    Ok(uow.commit().await?.receipt)
}

#[tokio::test]
async fn test_commits_form_an_intact_chain() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    let mut receipts = Vec::new();
    for key in ["a", "b", "c"] {
        receipts.push(commit_note(&h, key).await?);
    }

    assert_eq!(
        receipts.iter().map(|r| r.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(receipts[1].prev_receipt_hash, receipts[0].chain_hash);
    assert_eq!(receipts[2].prev_receipt_hash, receipts[1].chain_hash);
    assert!(receipts.iter().all(|r| r.is_self_consistent()));
    assert_ne!(receipts[0].payload_hash, receipts[1].payload_hash);

    let ledger = h.runtime.ledger();
    assert_eq!(ledger.latest().await?, Some(receipts[2].clone()));
    assert_eq!(ledger.get(receipts[1].id).await?, Some(receipts[1].clone()));

    let report = ledger.verify_all().await?;
    assert_eq!(report.verified, 3);
    assert!(report.is_intact());
    report.ensure_intact()?;
    assert_eq!(h.runtime.metrics().receipts_appended.get(), 3);
    Ok(())
}

#[tokio::test]
async fn test_tampered_payload_hash_is_detected() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    for key in ["a", "b", "c"] {
        commit_note(&h, key).await?;
    }

    h.execute(&format!(
        "UPDATE write_receipts SET payload_hash = '{}' WHERE sequence = 2",
        "00".repeat(32)
    ))
    .await?;

    let report = h.runtime.ledger().verify_all().await?;
    assert_eq!(report.verified, 2);
    assert_eq!(report.corrupted, 1);
    let link = report
        .first_broken
        .clone()
        .ok_or_else(|| anyhow::anyhow!("expected a broken link"))?;
    assert_eq!(link.sequence, 2);
    assert_eq!(link.kind, BreakKind::ChainMismatch);

    assert!(matches!(
        report.ensure_intact(),
        Err(StorageError::ReceiptChainBroken { sequence: 2, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn test_deleted_receipt_is_reported_missing() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    for key in ["a", "b", "c"] {
        commit_note(&h, key).await?;
    }
    h.execute("DELETE FROM write_receipts WHERE sequence = 2").await?;

    let report = h.runtime.ledger().verify_all().await?;
    assert_eq!(report.missing, 1);
    assert_eq!(report.corrupted, 0);
    assert_eq!(report.verified, 2);
    let link = report
        .first_broken
        .ok_or_else(|| anyhow::anyhow!("expected a broken link"))?;
    assert_eq!(link.sequence, 2);
    assert_eq!(link.receipt_id, None);
    assert_eq!(link.kind, BreakKind::Missing);
    Ok(())
}

#[tokio::test]
async fn test_verify_range_is_anchored_on_the_preceding_receipt() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    commit_note(&h, "a").await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let window_start = Utc::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    commit_note(&h, "b").await?;
    commit_note(&h, "c").await?;

    let ledger = h.runtime.ledger();
    let report = ledger.verify_range(window_start, Utc::now()).await?;
    assert_eq!(report.verified, 2);
    assert!(report.is_intact());

    // a deletion just before the window still shows up
    h.execute("DELETE FROM write_receipts WHERE sequence = 1").await?;
    let report = ledger.verify_range(window_start, Utc::now()).await?;
    assert_eq!(report.missing, 1);
    assert_eq!(report.verified, 2);
    Ok(())
}

#[tokio::test]
async fn test_unreadable_hash_is_reported_not_raised() -> anyhow::Result<()> {
    let h = TestHarness::new().await?;
    commit_note(&h, "a").await?;
    commit_note(&h, "b").await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    let after_second = Utc::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let third = commit_note(&h, "c").await?;

    h.execute("UPDATE write_receipts SET chain_hash = 'tampered' WHERE sequence = 2")
        .await?;

    let ledger = h.runtime.ledger();
    let report = ledger.verify_all().await?;
    assert_eq!(report.verified, 2);
    assert_eq!(report.corrupted, 1);
    assert_eq!(report.missing, 0);
    let link = report
        .first_broken
        .clone()
        .ok_or_else(|| anyhow::anyhow!("expected a broken link"))?;
    assert_eq!(link.sequence, 2);
    assert_eq!(link.kind, BreakKind::Undecodable);
    assert!(link.receipt_id.is_some());
    assert!(matches!(
        report.ensure_intact(),
        Err(StorageError::ReceiptChainBroken { sequence: 2, .. })
    ));

    // an unreadable receipt just before the window does not abort it either
    let report = ledger.verify_range(after_second, Utc::now()).await?;
    assert_eq!(report.verified, 1);
    assert!(report.is_intact());
    assert_eq!(ledger.get(third.id).await?, Some(third));
    Ok(())
}

#[tokio::test]
async fn test_receipts_signed_by_another_key_fail_verification() -> anyhow::Result<()> {
    let h = TestHarness::with_config(common::TestDatabase::new()?, |config| {
        config.ledger.signing_key_hex = Some("11".repeat(32));
    })
    .await?;
    commit_note(&h, "a").await?;
    assert!(h.runtime.ledger().verify_all().await?.is_intact());

    let mut config = h.db.config();
    config.ledger.signing_key_hex = Some("22".repeat(32));
    let other = StorageRuntime::open(config, StoreRegistry::new(), app_migrations()?).await?;
    assert!(other.migration_report().is_noop());

    let report = other.ledger().verify_all().await?;
    assert_eq!(report.corrupted, 1);
    assert_eq!(
        report.first_broken.map(|link| link.kind),
        Some(BreakKind::InvalidSignature)
    );
    other.close().await;
    Ok(())
}
