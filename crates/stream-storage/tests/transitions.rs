//! Integration tests for file and slice state transitions.
//!
//! - Full lifecycle from writing to imported, with statistics following
//!   the storage level
//! - Invalid transitions and file/slice state combinations leave the
//!   stored state unchanged
//! - Slice rotation inside a file volume
//! - Retry bookkeeping, deletion and the buffer quota

mod common;

use common::{Fixture, sink_key, source_key, time};
use stream_core::ByteSize;
use stream_storage::{
    File, FileState, FileVolumeKey, Level, PerSlice, Rollback, Slice, SliceKey, SliceState, Value,
};

fn stats(compressed: ByteSize) -> Value {
    Value {
        slices_count: 1,
        first_record_at: Some(time("2000-01-01T01:10:00.000Z")),
        last_record_at: Some(time("2000-01-01T01:20:00.000Z")),
        records_count: 100,
        uncompressed_size: compressed,
        compressed_size: compressed,
        ..Default::default()
    }
}

/// A closed file with one closed slice and its statistics.
async fn closed_file(f: &Fixture) -> (File, Slice) {
    f.register_volumes(1);
    f.create_sink(&source_key(), "my-sink");
    let rollback = Rollback::new();

    let file = f
        .repo
        .file()
        .rotate(&rollback, time("2000-01-01T01:00:00.000Z"), &sink_key())
        .await
        .unwrap();
    let slice = f.repo.slice().list_in(&file.key).unwrap().remove(0);
    f.repo
        .statistics()
        .put(&[PerSlice {
            slice_key: slice.key.clone(),
            value: stats(ByteSize::kb(100)),
        }])
        .unwrap();

    f.repo
        .file()
        .rotate(&rollback, time("2000-01-01T02:00:00.000Z"), &sink_key())
        .await
        .unwrap();
    let file = f.repo.file().get(&file.key).unwrap();
    let slice = f.repo.slice().get(&slice.key).unwrap();
    assert_eq!(file.state, FileState::Closing);
    assert_eq!(slice.state, SliceState::Closing);
    (file, slice)
}

async fn upload_slice(f: &Fixture, key: &SliceKey) {
    let slices = f.repo.slice();
    slices
        .state_transition(time("2000-01-01T02:01:00.000Z"), key, SliceState::Closing, SliceState::Uploading)
        .await
        .unwrap();
    slices
        .state_transition(time("2000-01-01T02:02:00.000Z"), key, SliceState::Uploading, SliceState::Uploaded)
        .await
        .unwrap();
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_moves_statistics() {
    let f = Fixture::new(1);
    let (file, slice) = closed_file(&f).await;
    let statistics = f.repo.statistics();

    upload_slice(&f, &slice.key).await;
    let uploaded = f.repo.slice().get(&slice.key).unwrap();
    assert_eq!(uploaded.state, SliceState::Uploaded);
    assert_eq!(uploaded.uploading_at, Some(time("2000-01-01T02:01:00.000Z")));
    assert_eq!(uploaded.uploaded_at, Some(time("2000-01-01T02:02:00.000Z")));

    let s = statistics.file_stats(&file.key).unwrap();
    assert_eq!(s.local, Value::default());
    assert_eq!(s.staging.compressed_size, ByteSize::kb(100));
    assert_eq!(s.staging.staging_size, ByteSize::kb(100));

    let t = time("2000-01-01T03:00:00.000Z");
    let importing = f
        .repo
        .file()
        .state_transition(t, &file.key, FileState::Closing, FileState::Importing)
        .await
        .unwrap();
    assert_eq!(importing.importing_at, Some(t));
    assert_eq!(f.repo.file().list_in_level(&sink_key(), Level::Staging).unwrap(), vec![importing]);

    let t = time("2000-01-01T04:00:00.000Z");
    let imported = f
        .repo
        .file()
        .state_transition(t, &file.key, FileState::Importing, FileState::Imported)
        .await
        .unwrap();
    assert_eq!(imported.imported_at, Some(t));

    // Uploaded slices are imported together with the file.
    let slice = f.repo.slice().get(&slice.key).unwrap();
    assert_eq!(slice.state, SliceState::Imported);
    assert_eq!(slice.imported_at, Some(t));
    assert_eq!(
        f.repo.slice().list_in_level(&file.key, Level::Target).unwrap(),
        vec![slice]
    );
    assert!(f.repo.file().list_in_level(&sink_key(), Level::Staging).unwrap().is_empty());

    let s = statistics.file_stats(&file.key).unwrap();
    assert_eq!(s.staging, Value::default());
    assert_eq!(s.target.compressed_size, ByteSize::kb(100));
    assert_eq!(s.total.records_count, 100);

    // Each step happens exactly once.
    let err = f
        .repo
        .file()
        .state_transition(t, &file.key, FileState::Imported, FileState::Imported)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("unexpected file \"{}\" state transition from \"imported\" to \"imported\"", file.key)
    );
}

#[tokio::test]
async fn closing_only_via_rotation() {
    let f = Fixture::new(1);
    f.register_volumes(1);
    f.create_sink(&source_key(), "my-sink");
    let t = time("2000-01-01T01:00:00.000Z");
    let file = f.repo.file().rotate(&Rollback::new(), t, &sink_key()).await.unwrap();
    let slice = f.repo.slice().list_in(&file.key).unwrap().remove(0);

    let err = f
        .repo
        .file()
        .state_transition(t, &file.key, FileState::Writing, FileState::Closing)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "unexpected file transition to the state \"closing\", use Rotate* or Close* methods"
    );

    let err = f
        .repo
        .slice()
        .state_transition(t, &slice.key, SliceState::Writing, SliceState::Closing)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "unexpected slice transition to the state \"closing\", use Rotate or Close method"
    );

    assert_eq!(f.repo.file().get(&file.key).unwrap(), file);
    assert_eq!(f.repo.slice().get(&slice.key).unwrap(), slice);
}

#[tokio::test]
async fn state_mismatch_and_skipped_state() {
    let f = Fixture::new(1);
    let (file, _) = closed_file(&f).await;
    let t = time("2000-01-01T03:00:00.000Z");

    let err = f
        .repo
        .file()
        .state_transition(t, &file.key, FileState::Importing, FileState::Imported)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("file \"{}\" is in \"closing\" state, expected \"importing\"", file.key)
    );

    let err = f
        .repo
        .file()
        .state_transition(t, &file.key, FileState::Closing, FileState::Imported)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("unexpected file \"{}\" state transition from \"closing\" to \"imported\"", file.key)
    );
    assert_eq!(f.repo.file().get(&file.key).unwrap(), file);
}

#[tokio::test]
async fn unexpected_file_and_slice_combination() {
    let f = Fixture::new(1);
    let (file, slice) = closed_file(&f).await;
    let t = time("2000-01-01T03:00:00.000Z");

    // The slice is not uploaded yet.
    let err = f
        .repo
        .file()
        .state_transition(t, &file.key, FileState::Closing, FileState::Importing)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!(
            "unexpected slice \"{}\" state: unexpected combination: file state \"importing\" and slice state \"closing\"",
            slice.key
        )
    );
    assert_eq!(f.repo.file().get(&file.key).unwrap(), file);
    assert_eq!(f.repo.statistics().file_stats(&file.key).unwrap().local.compressed_size, ByteSize::kb(100));

    // A slice cannot be imported before its file.
    upload_slice(&f, &slice.key).await;
    let err = f
        .repo
        .slice()
        .state_transition(t, &slice.key, SliceState::Uploaded, SliceState::Imported)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!(
            "unexpected slice \"{}\" state: unexpected combination: file state \"closing\" and slice state \"imported\"",
            slice.key
        )
    );
    assert_eq!(f.repo.slice().get(&slice.key).unwrap().state, SliceState::Uploaded);
}

// ── Slice rotation ──────────────────────────────────────────────────

#[tokio::test]
async fn slice_rotate_and_close() {
    let f = Fixture::new(1);
    f.register_volumes(1);
    f.create_sink(&source_key(), "my-sink");
    let rollback = Rollback::new();
    let t1 = time("2000-01-01T01:00:00.000Z");
    let t2 = time("2000-01-01T01:30:00.000Z");

    let file = f.repo.file().rotate(&rollback, t1, &sink_key()).await.unwrap();
    let volume_key = FileVolumeKey::new(file.key.clone(), file.assignment.volumes[0].clone());
    let slices = f.repo.slice();

    let slice2 = slices.rotate(t2, &volume_key).await.unwrap();
    assert_eq!(slice2.state, SliceState::Writing);
    assert_eq!(slice2.key.opened_at(), t2);
    assert_eq!(slice2.staging.path, format!("2000-01-01T01:30:00.000Z_{}.csv.gz", volume_key.volume_id));
    assert_eq!(slices.list_in_state(&volume_key, SliceState::Writing).unwrap(), vec![slice2.clone()]);
    assert_eq!(slices.list_in_state(&volume_key, SliceState::Closing).unwrap().len(), 1);

    let err = slices.rotate(t2, &volume_key).await.unwrap_err();
    assert!(err.is_already_exists());
    assert_eq!(err.to_string(), format!("slice \"{}\" already exists in the file", slice2.key));

    slices.close(time("2000-01-01T01:40:00.000Z"), &volume_key).await.unwrap();
    assert!(slices.list_in_state(&volume_key, SliceState::Writing).unwrap().is_empty());

    // No new slice in a closed file.
    f.repo.file().close(time("2000-01-01T02:00:00.000Z"), &sink_key()).await.unwrap();
    let err = slices
        .rotate(time("2000-01-01T02:10:00.000Z"), &volume_key)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        format!(
            "slice cannot be created: unexpected file \"{}\" state \"closing\", expected \"writing\"",
            file.key
        )
    );
}

// ── Retry ───────────────────────────────────────────────────────────

#[tokio::test]
async fn increment_retry_and_reset_on_transition() {
    let f = Fixture::new(1);
    let (file, slice) = closed_file(&f).await;
    let t = time("2000-01-01T03:00:00.000Z");

    let failed = f.repo.file().increment_retry(t, &file.key, "import failed").await.unwrap();
    assert_eq!(failed.retry.retry_attempt, 1);
    assert_eq!(failed.retry.retry_reason, "import failed");
    assert_eq!(failed.retry.first_failed_at, Some(t));
    assert!(failed.retry.retry_after.is_some_and(|after| after > t));
    assert!(!failed.retry.allowed(t));

    let later = time("2000-01-01T03:05:00.000Z");
    let failed = f.repo.file().increment_retry(later, &file.key, "import failed again").await.unwrap();
    assert_eq!(failed.retry.retry_attempt, 2);
    assert_eq!(failed.retry.first_failed_at, Some(t));
    assert_eq!(failed.retry.last_failed_at, Some(later));
    assert_eq!(f.repo.file().get(&file.key).unwrap(), failed);

    let failed = f.repo.slice().increment_retry(t, &slice.key, "upload failed").await.unwrap();
    assert_eq!(failed.retry.retry_attempt, 1);

    // A successful transition resets the retry state.
    let uploading = f
        .repo
        .slice()
        .state_transition(later, &slice.key, SliceState::Closing, SliceState::Uploading)
        .await
        .unwrap();
    assert_eq!(uploading.retry, Default::default());
    assert!(uploading.retry.allowed(later));
}

// ── Delete ──────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_keeps_target_statistics() {
    let f = Fixture::new(1);
    let (file, slice) = closed_file(&f).await;
    upload_slice(&f, &slice.key).await;
    let t = time("2000-01-01T03:00:00.000Z");
    f.repo
        .file()
        .state_transition(t, &file.key, FileState::Closing, FileState::Importing)
        .await
        .unwrap();
    f.repo
        .file()
        .state_transition(t, &file.key, FileState::Importing, FileState::Imported)
        .await
        .unwrap();

    // Deleted slice statistics are rolled up into the file.
    f.repo.slice().delete(&slice.key).await.unwrap();
    assert!(f.repo.slice().get(&slice.key).unwrap_err().is_not_found());
    assert_eq!(f.repo.statistics().slice_stats(&slice.key).unwrap().total, Value::default());
    assert_eq!(
        f.repo.statistics().file_stats(&file.key).unwrap().target.compressed_size,
        ByteSize::kb(100)
    );

    // Deleted file statistics are rolled up into the sink.
    f.repo.file().delete(&file.key).await.unwrap();
    let err = f.repo.file().get(&file.key).unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("file \"{}\" not found in the sink", file.key)
    );
    assert!(f.repo.file().list_in_level(&sink_key(), Level::Target).unwrap().is_empty());
    let sink = f.repo.statistics().sink_stats(&sink_key()).unwrap();
    assert_eq!(sink.target.compressed_size, ByteSize::kb(100));
    assert_eq!(sink.target.records_count, 100);

    let err = f.repo.file().delete(&file.key).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn delete_file_removes_slices() {
    let f = Fixture::new(2);
    f.register_volumes(2);
    f.create_sink(&source_key(), "my-sink");
    let file = f
        .repo
        .file()
        .rotate(&Rollback::new(), time("2000-01-01T01:00:00.000Z"), &sink_key())
        .await
        .unwrap();
    assert_eq!(f.repo.slice().list_in(&file.key).unwrap().len(), 2);

    f.repo.file().delete(&file.key).await.unwrap();
    assert!(f.repo.file().list_all().unwrap().is_empty());
    assert!(f.repo.slice().list_in(&sink_key()).unwrap().is_empty());
    for level in Level::ALL {
        assert!(f.repo.slice().list_in_level(&sink_key(), level).unwrap().is_empty());
    }
}

// ── Quota ───────────────────────────────────────────────────────────

#[tokio::test]
async fn buffered_size_quota() {
    let mut config = stream_core::StorageConfig::default();
    config.level.local.volume.assignment.count = 2;
    config.quota.max_buffered_size = ByteSize::kb(1000);
    let f = Fixture::with_config(config);
    f.register_volumes(2);
    f.create_sink(&source_key(), "my-sink");
    let file = f
        .repo
        .file()
        .rotate(&Rollback::new(), time("2000-01-01T01:00:00.000Z"), &sink_key())
        .await
        .unwrap();
    let slices = f.repo.slice().list_in(&file.key).unwrap();

    f.repo
        .statistics()
        .put(&[PerSlice {
            slice_key: slices[0].key.clone(),
            value: stats(ByteSize::kb(600)),
        }])
        .unwrap();
    f.repo.check_quota(&sink_key()).unwrap();

    f.repo
        .statistics()
        .put(&[PerSlice {
            slice_key: slices[1].key.clone(),
            value: stats(ByteSize::kb(600)),
        }])
        .unwrap();
    let err = f.repo.check_quota(&sink_key()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "no free space in the buffer: the \"123/456/my-source/my-sink\" sink has \"1200KB\" buffered for upload, limit is \"1000KB\""
    );
}
