mod common;

use std::collections::HashSet;
use std::time::Duration;

use codesync::app::{AppContext, AppParts};
use codesync::db;
use codesync::migrate;
use codesync::orchestrator::SyncOutcome;
use codesync::progress::SyncPhase;
use codesync::repo::{InMemoryRepository, PathFilter, RepositoryCatalog, RepositoryEntry};
use codesync::sync_state::{SqliteSyncStateStore, SyncStateStore};
use codesync_core::error::SyncError;
use codesync_core::merkle::MerkleTree;
use codesync_core::store::memory::InMemoryVectorDatabase;
use codesync_core::store::VectorDatabase;
use std::sync::Arc;
use tempfile::TempDir;

use common::*;

#[tokio::test]
async fn first_sync_indexes_every_file() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);

    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.commit.as_deref(), Some("rev-2"));
    assert_eq!(report.counts.changes_detected, 2);
    assert_eq!(report.counts.files_reindexed, 2);
    assert!(report.warnings.is_empty());
    assert_eq!(report.counts.vectors_upserted, fx.db.len());
    assert_eq!(fx.db.dimension(), Some(DIMS));

    let a = fx.db.records_for_file("src/a.ts");
    let b = fx.db.records_for_file("src/b.ts");
    assert!(!a.is_empty());
    assert!(!b.is_empty());
    for record in a.iter().chain(b.iter()) {
        assert_eq!(record.metadata.codebase_id, CODEBASE);
        assert_eq!(record.metadata.language, "typescript");
        assert_eq!(record.metadata.commit.as_deref(), Some("rev-2"));
        assert_ne!(record.metadata.obfuscated_path, record.metadata.file_path);
    }

    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    assert_eq!(record.last_commit.as_deref(), Some("rev-2"));
    assert_eq!(record.tree.root_hash, report.root_hash);
    let manifest_ids: HashSet<String> = record.chunk_manifest.values().flatten().cloned().collect();
    let indexed_ids: HashSet<String> = fx.db.ids().into_iter().collect();
    assert_eq!(manifest_ids, indexed_ids);

    let status = fx.ctx.codebase_status(CODEBASE).await.unwrap();
    assert!(status.synced);
    assert!(!status.syncing);
    assert_eq!(status.files, 2);
    assert_eq!(status.indexed_chunks, fx.db.len());
}

#[tokio::test]
async fn unchanged_repository_makes_no_index_or_embedding_calls() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);
    fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    let calls = (
        fx.db.upsert_calls(),
        fx.db.delete_calls(),
        fx.db.query_calls(),
        fx.db.create_calls(),
    );
    let embeds = fx.provider.calls();
    let puts = fx.state.put_count();

    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::NoChanges);
    assert_eq!(report.counts.changes_detected, 0);
    assert_eq!(
        (
            fx.db.upsert_calls(),
            fx.db.delete_calls(),
            fx.db.query_calls(),
            fx.db.create_calls(),
        ),
        calls
    );
    assert_eq!(fx.provider.calls(), embeds);
    assert_eq!(fx.state.put_count(), puts, "same commit, nothing to persist");
}

#[tokio::test]
async fn deleted_file_is_removed_without_embedding() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);
    fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    let b_vectors = fx.db.records_for_file("src/b.ts").len();
    let a_vectors = fx.db.records_for_file("src/a.ts").len();
    let embeds = fx.provider.calls();

    fx.repo.remove_file("src/b.ts");
    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.files_deleted, 1);
    assert_eq!(report.counts.files_reindexed, 0);
    assert_eq!(report.counts.vectors_deleted, b_vectors);
    assert_eq!(fx.provider.calls(), embeds);
    assert!(fx.db.records_for_file("src/b.ts").is_empty());
    assert_eq!(fx.db.records_for_file("src/a.ts").len(), a_vectors);

    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    assert!(!record.chunk_manifest.contains_key("src/b.ts"));
    let tree = MerkleTree::from_serialized(&record.tree).unwrap();
    assert!(tree.file_hash("src/b.ts").is_none());
}

#[tokio::test]
async fn unchanged_chunks_are_reused() {
    let fx = fixture(&[("src/a.ts", A_TS)]);
    let first = fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    let texts = fx.provider.texts();

    // Same line count, only the body of `two` changes.
    fx.repo.set_file("src/a.ts", &A_TS.replace("return 2;", "return 3;"));
    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.files_reindexed, 1);
    assert!(report.counts.chunks_reused >= 1);
    assert!(report.counts.chunks_embedded >= 1);
    assert!(report.counts.chunks_embedded < first.counts.chunks_embedded);
    assert_eq!(fx.provider.texts() - texts, report.counts.chunks_embedded);

    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    let manifest_ids: HashSet<String> = record.chunk_manifest.values().flatten().cloned().collect();
    let indexed_ids: HashSet<String> = fx.db.ids().into_iter().collect();
    assert_eq!(manifest_ids, indexed_ids, "stale chunk of `two` was retired");
}

#[tokio::test]
async fn failed_fetch_is_retried_on_next_sync() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);
    fx.repo.fail_blob("src/b.ts");

    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::PartialSuccess);
    assert_eq!(report.counts.files_reindexed, 1);
    assert!(report.warnings.iter().any(|w| w.contains("src/b.ts")));
    assert!(fx.db.records_for_file("src/b.ts").is_empty());

    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    let tree = MerkleTree::from_serialized(&record.tree).unwrap();
    assert!(tree.file_hash("src/a.ts").is_some());
    assert!(tree.file_hash("src/b.ts").is_none(), "failed new file is left out");

    fx.repo.clear_failures();
    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.changes_detected, 1);
    assert_eq!(report.counts.files_reindexed, 1);
    assert!(!fx.db.records_for_file("src/b.ts").is_empty());
}

#[tokio::test]
async fn dimension_mismatch_aborts_before_any_write() {
    let fx = fixture_with_provider(&[("src/a.ts", A_TS)], MockProvider::returning(DIMS, DIMS / 2));

    let err = fx.ctx.orchestrator.run(fx.request()).await.unwrap_err();

    assert!(matches!(err, SyncError::FatalConfig(_)), "got {:?}", err);
    assert_eq!(fx.db.create_calls(), 0);
    assert_eq!(fx.db.upsert_calls(), 0);
    assert_eq!(fx.db.delete_calls(), 0);
    assert_eq!(fx.state.put_count(), 0);
    assert!(fx.state.get_sync_record(CODEBASE).await.unwrap().is_none());
    assert!(!fx.ctx.orchestrator.is_syncing(CODEBASE), "lease released");
}

#[tokio::test]
async fn zero_declared_dimension_is_fatal() {
    let fx = fixture_with_provider(&[("src/a.ts", A_TS)], MockProvider::new(0));
    let err = fx.ctx.orchestrator.run(fx.request()).await.unwrap_err();
    assert!(matches!(err, SyncError::FatalConfig(_)));
    assert_eq!(fx.provider.calls(), 0);
}

#[tokio::test]
async fn second_sync_for_same_codebase_is_rejected() {
    let fx = fixture(&[("src/a.ts", A_TS)]);
    fx.repo.set_list_delay(Duration::from_millis(200));

    let job_id = fx.ctx.orchestrator.start(fx.request()).unwrap();
    assert!(fx.ctx.orchestrator.is_syncing(CODEBASE));

    let err = fx.ctx.orchestrator.start(fx.request()).unwrap_err();
    assert!(matches!(err, SyncError::AlreadyRunning(_)));
    let err = fx.ctx.orchestrator.run(fx.request()).await.unwrap_err();
    assert_eq!(err.code(), "sync_in_progress");

    let job = fx.wait_for_job(&job_id).await;
    assert_eq!(job.phase, SyncPhase::Complete);
    assert_eq!(job.progress, 100);
    assert_eq!(
        job.result.as_ref().map(|r| r.outcome),
        Some(SyncOutcome::Success)
    );
    assert!(!fx.ctx.orchestrator.is_syncing(CODEBASE));

    // Lease is free again.
    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::NoChanges);
}

#[tokio::test]
async fn full_sync_purges_and_reindexes() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);
    fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    let before = fx.db.len();
    let texts = fx.provider.texts();

    let report = fx.ctx.orchestrator.run(fx.request().full(true)).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.files_reindexed, 2);
    assert_eq!(report.counts.chunks_reused, 0);
    assert_eq!(report.counts.vectors_deleted, before);
    assert_eq!(fx.db.len(), before);
    assert_eq!(fx.provider.texts() - texts, before);
}

#[tokio::test]
async fn purge_keeps_webhook_credentials() {
    let fx = fixture(&[("src/a.ts", A_TS)]);
    fx.register_secret().await;
    fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    assert!(!fx.db.is_empty());

    let deleted = fx.ctx.purge(CODEBASE).await.unwrap();

    assert!(deleted > 0);
    assert!(fx.db.is_empty());
    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    assert!(!record.is_synced());
    assert_eq!(record.webhook.map(|w| w.secret).as_deref(), Some(SECRET));
}

#[tokio::test]
async fn sync_record_round_trips_through_sqlite() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("data/codesync.sqlite");
    let config = test_config(&db_path.display().to_string());

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    migrate::apply(&pool).await.unwrap();

    let repo = Arc::new(InMemoryRepository::with_files([("src/a.ts", A_TS), ("README.md", "# acme\n")]));
    let mut catalog = RepositoryCatalog::new();
    catalog.insert(RepositoryEntry {
        id: CODEBASE.to_string(),
        source: repo.clone(),
        default_branch: "main".to_string(),
        webhook_secret_env: None,
        paths: PathFilter::new(&["src/**".to_string()], &[]).unwrap(),
    });
    let ctx = AppContext::assemble(
        config.clone(),
        AppParts {
            catalog,
            state: Arc::new(SqliteSyncStateStore::new(pool.clone())),
            database: Arc::new(InMemoryVectorDatabase::new()),
            provider: Arc::new(MockProvider::new(DIMS)),
            observers: Vec::new(),
        },
    );
    let entry = ctx.catalog.get(CODEBASE).unwrap();
    let report = ctx
        .orchestrator
        .run(codesync::orchestrator::SyncRequest::for_entry(&entry))
        .await
        .unwrap();
    pool.close().await;

    let reopened = SqliteSyncStateStore::new(db::connect(&config).await.unwrap());
    let record = reopened.get_sync_record(CODEBASE).await.unwrap().unwrap();
    assert_eq!(record.tree.root_hash, report.root_hash);
    assert_eq!(record.last_commit.as_deref(), Some("rev-2"));
    assert_eq!(record.chunk_manifest.keys().collect::<Vec<_>>(), vec!["src/a.ts"]);
    assert!(MerkleTree::from_serialized(&record.tree).is_ok());

    assert!(reopened.delete_sync_record(CODEBASE).await.unwrap());
    assert!(reopened.get_sync_record(CODEBASE).await.unwrap().is_none());
}

#[tokio::test]
async fn modifying_one_file_leaves_the_other_untouched() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);
    fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    let a_before = fx.db.records_for_file("src/a.ts");
    let old_b: HashSet<String> = fx
        .db
        .records_for_file("src/b.ts")
        .into_iter()
        .map(|r| r.id)
        .collect();
    let texts = fx.provider.texts();

    fx.repo.set_file("src/b.ts", &B_TS.replace("41", "42"));
    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.changes_detected, 1);
    assert_eq!(report.counts.files_reindexed, 1);
    assert_eq!(report.counts.vectors_deleted, old_b.len());
    assert_eq!(fx.provider.texts() - texts, report.counts.chunks_embedded);

    let new_b: HashSet<String> = fx
        .db
        .records_for_file("src/b.ts")
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert!(!new_b.is_empty());
    assert!(new_b.is_disjoint(&old_b), "old b.ts vectors were deleted");
    assert_eq!(report.counts.vectors_upserted, new_b.len());
    assert_eq!(fx.db.records_for_file("src/a.ts"), a_before, "a.ts records are byte-identical");
}

#[tokio::test]
async fn failed_embedding_keeps_old_vectors_until_retry() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);
    fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    let old_b: Vec<String> = fx.db.records_for_file("src/b.ts").into_iter().map(|r| r.id).collect();
    let old_record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    let old_tree = MerkleTree::from_serialized(&old_record.tree).unwrap();

    fx.provider.fail_texts_containing("return 42");
    fx.repo.set_file("src/b.ts", &B_TS.replace("41", "42"));
    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::PartialSuccess);
    assert_eq!(report.counts.files_reindexed, 0);
    assert!(report.warnings.iter().any(|w| w.contains("src/b.ts") && w.contains("embedding failed")));
    let kept: Vec<String> = fx.db.records_for_file("src/b.ts").into_iter().map(|r| r.id).collect();
    assert_eq!(kept, old_b, "old vectors stay in the index");

    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    let tree = MerkleTree::from_serialized(&record.tree).unwrap();
    assert_eq!(tree.file_hash("src/b.ts"), old_tree.file_hash("src/b.ts"));
    assert_eq!(record.chunk_manifest.get("src/b.ts"), old_record.chunk_manifest.get("src/b.ts"));

    fx.provider.clear_failures();
    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.changes_detected, 1);
    assert_eq!(report.counts.files_reindexed, 1);
    let b = fx.db.records_for_file("src/b.ts");
    assert!(b.iter().any(|r| r.metadata.content_preview.contains("return 42")));
    assert!(b.iter().all(|r| !old_b.contains(&r.id)));

    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    let manifest_ids: HashSet<String> = record.chunk_manifest.values().flatten().cloned().collect();
    let indexed_ids: HashSet<String> = fx.db.ids().into_iter().collect();
    assert_eq!(manifest_ids, indexed_ids);
}

#[tokio::test]
async fn failed_upsert_records_what_the_index_holds_and_retries() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);
    fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    let old_record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    let old_tree = MerkleTree::from_serialized(&old_record.tree).unwrap();

    fx.db.fail_upserts_for_file("src/b.ts");
    fx.repo.set_file("src/b.ts", &B_TS.replace("41", "42"));
    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::PartialSuccess);
    assert_eq!(report.counts.files_reindexed, 0);
    assert!(report.warnings.iter().any(|w| w.contains("src/b.ts") && w.contains("upsert failed")));

    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    let tree = MerkleTree::from_serialized(&record.tree).unwrap();
    assert_eq!(tree.file_hash("src/b.ts"), old_tree.file_hash("src/b.ts"));
    assert_eq!(tree.file_hash("src/a.ts"), old_tree.file_hash("src/a.ts"));
    let manifest_ids: HashSet<String> = record.chunk_manifest.values().flatten().cloned().collect();
    let indexed_ids: HashSet<String> = fx.db.ids().into_iter().collect();
    assert_eq!(manifest_ids, indexed_ids, "manifest never claims vectors the index lacks");

    fx.db.clear_failures();
    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.changes_detected, 1);
    assert_eq!(report.counts.files_reindexed, 1);
    let b = fx.db.records_for_file("src/b.ts");
    assert!(b.iter().any(|r| r.metadata.content_preview.contains("return 42")));

    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    let manifest_ids: HashSet<String> = record.chunk_manifest.values().flatten().cloned().collect();
    let indexed_ids: HashSet<String> = fx.db.ids().into_iter().collect();
    assert_eq!(manifest_ids, indexed_ids);
    assert_eq!(
        fx.ctx.orchestrator.run(fx.request()).await.unwrap().outcome,
        SyncOutcome::NoChanges
    );
}

#[tokio::test]
async fn new_embedding_dimension_reindexes_every_file() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);
    fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    let indexed = fx.db.len();

    // Same repository, same state, a 12-dimensional model.
    let wider = fx.with_provider(MockProvider::new(12));
    let report = wider.ctx.orchestrator.run(wider.request()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.files_reindexed, 2);
    assert_eq!(report.counts.chunks_reused, 0);
    assert_eq!(fx.db.dimension(), Some(12));
    assert_eq!(fx.db.len(), indexed);
    assert!(!fx.db.records_for_file("src/a.ts").is_empty());
    assert!(fx.db.ids().iter().all(|id| fx.db.get(id).unwrap().values.len() == 12));

    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    let manifest_ids: HashSet<String> = record.chunk_manifest.values().flatten().cloned().collect();
    let indexed_ids: HashSet<String> = fx.db.ids().into_iter().collect();
    assert_eq!(manifest_ids, indexed_ids);

    let report = wider.ctx.orchestrator.run(wider.request()).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::NoChanges);
}

#[tokio::test]
async fn missing_index_forces_a_full_reindex() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);
    fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    let indexed = fx.db.len();

    fx.db.delete_index().await.unwrap();
    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.files_reindexed, 2);
    assert_eq!(fx.db.len(), indexed);
}

#[tokio::test]
async fn index_dropped_mid_sync_invalidates_the_record() {
    let fx = fixture(&[("src/a.ts", A_TS), ("src/b.ts", B_TS)]);
    fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    fx.repo.set_file("src/b.ts", &B_TS.replace("41", "42"));
    fx.repo.set_blob_delay(Duration::from_millis(200));
    let job_id = fx.ctx.orchestrator.start(fx.request()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    fx.db.delete_index().await.unwrap();

    let job = fx.wait_for_job(&job_id).await;
    assert_eq!(job.phase, SyncPhase::Error);
    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    assert!(!record.is_synced());

    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.files_reindexed, 2);
    assert!(!fx.db.records_for_file("src/a.ts").is_empty());
}

#[tokio::test]
async fn listing_paths_are_normalized_before_lookup() {
    let fx = fixture(&[("./src/a.ts", A_TS), ("lib\\b.ts", B_TS)]);

    let report = fx.ctx.orchestrator.run(fx.request()).await.unwrap();

    assert_eq!(report.outcome, SyncOutcome::Success);
    assert_eq!(report.counts.files_reindexed, 2);
    assert!(report.warnings.is_empty());
    assert!(!fx.db.records_for_file("src/a.ts").is_empty());
    assert!(!fx.db.records_for_file("lib/b.ts").is_empty());
    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    assert_eq!(
        record.chunk_manifest.keys().collect::<Vec<_>>(),
        vec!["lib/b.ts", "src/a.ts"]
    );
    assert_eq!(
        fx.ctx.orchestrator.run(fx.request()).await.unwrap().outcome,
        SyncOutcome::NoChanges
    );
}

#[tokio::test]
async fn webhook_stored_during_a_sync_survives_it() {
    let fx = fixture(&[("src/a.ts", A_TS)]);
    fx.repo.set_blob_delay(Duration::from_millis(200));
    let job_id = fx.ctx.orchestrator.start(fx.request()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Another process stores credentials while the run is past `Diffing`.
    fx.register_secret().await;

    let job = fx.wait_for_job(&job_id).await;
    assert_eq!(job.phase, SyncPhase::Complete);
    let record = fx.state.get_sync_record(CODEBASE).await.unwrap().unwrap();
    assert!(record.is_synced());
    assert_eq!(record.webhook.map(|w| w.secret).as_deref(), Some(SECRET));
}

#[tokio::test]
async fn purge_during_sync_is_rejected() {
    let fx = fixture(&[("src/a.ts", A_TS)]);
    fx.repo.set_list_delay(Duration::from_millis(200));
    let job_id = fx.ctx.orchestrator.start(fx.request()).unwrap();

    let err = fx.ctx.purge(CODEBASE).await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyRunning(_)));

    fx.wait_for_job(&job_id).await;
    assert!(!fx.db.is_empty(), "the sync's writes were not purged");
    assert!(fx.ctx.purge(CODEBASE).await.unwrap() > 0);
    assert!(fx.db.is_empty());
}
