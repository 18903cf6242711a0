mod common;

use common::{BUCKET, stage_backend};
use flate2::Compression;
use flate2::write::GzEncoder;
use stage_transfer::StageTransferSession;
use stage_transfer::config::TransferConfig;
use stage_transfer::error::StageError;
use stage_transfer::models::{
    TransferDirection, TransferOptions, TransferRequest, TransferStatus,
};
use stage_transfer::services::compress::gunzip_bytes;
use stage_transfer::services::control_plane::ControlPlane;
use stage_transfer::services::storage::StageStorage;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ORIGINAL_CONTENTS: &str = "123,test1\n456,test2\n";

fn gzip_to_file(path: &Path, contents: &str) {
    let file = fs::File::create(path).unwrap();
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(contents.as_bytes()).unwrap();
    encoder.finish().unwrap();
}

fn session(
    backend: &common::StageBackend,
) -> StageTransferSession {
    StageTransferSession::open(
        Arc::clone(&backend.control_plane) as Arc<dyn ControlPlane>,
        Arc::clone(&backend.storage) as Arc<dyn StageStorage>,
        TransferConfig::default(),
    )
}

fn put_request(source: PathBuf, stage_ref: &str, parallelism: usize) -> TransferRequest {
    TransferRequest {
        source,
        stage_ref: stage_ref.to_string(),
        direction: TransferDirection::Upload,
        options: TransferOptions {
            parallelism: Some(parallelism),
            ..TransferOptions::default()
        },
    }
}

#[tokio::test]
async fn test_put_get_round_trip_with_pattern() {
    let backend = stage_backend();
    backend
        .control_plane
        .register_stage("%snow9144", "stages/tables/snow9144/");
    backend
        .control_plane
        .register_stage("~/snow9144", "stages/user/snow9144/");
    let session = session(&backend);

    // 1. Create a pre-compressed data file, as a loader would.
    let work_dir = tempfile::tempdir().unwrap();
    let data_file = work_dir.path().join("stage_rows.txt.gz");
    gzip_to_file(&data_file, ORIGINAL_CONTENTS);
    let compressed_size = fs::metadata(&data_file).unwrap().len();

    // 2. PUT onto the table stage with auto_compress and high parallelism.
    let rows = session
        .put(&put_request(data_file, "%snow9144", 30))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TransferStatus::Uploaded);
    assert_eq!(rows[0].file_name, "stage_rows.txt.gz");
    // Already gzip: uploaded as-is, no double compression, no extra suffix.
    assert_eq!(rows[0].target_size, compressed_size);
    assert_eq!(rows[0].error_message, "");

    let staged = backend
        .storage
        .read_object(BUCKET, "stages/tables/snow9144/stage_rows.txt.gz")
        .unwrap();
    assert_eq!(gunzip_bytes(&staged).unwrap(), ORIGINAL_CONTENTS.as_bytes());

    // 3. The database copies the table back out onto the user stage in
    //    gzip/CSV format. Emulated here by the storage plane itself.
    backend.storage.insert_object(
        BUCKET,
        "stages/user/snow9144/snow9144_0_0_0.csv.gz",
        staged.clone(),
    );

    // 4. GET from the user stage with a name pattern.
    let download_dir = work_dir.path().join("downloaded");
    let rows = session
        .get(&TransferRequest {
            source: download_dir.clone(),
            stage_ref: "~/snow9144".to_string(),
            direction: TransferDirection::Download,
            options: TransferOptions {
                name_pattern: Some("snow9144.*".to_string()),
                ..TransferOptions::default()
            },
        })
        .await
        .unwrap();

    assert_eq!(rows.len(), 1);
    assert!(rows[0].file_name.starts_with("snow9144"), "A file downloaded by GET");
    assert_eq!(rows[0].target_size, staged.len() as u64, "Return right file size");
    assert_eq!(rows[0].status, TransferStatus::Downloaded, "Return DOWNLOADED status");
    assert_eq!(rows[0].error_message, "", "Return no error message");

    // 5. Decompressed download must equal the original contents exactly.
    let downloaded = fs::read(download_dir.join(&rows[0].file_name)).unwrap();
    assert_eq!(
        gunzip_bytes(&downloaded).unwrap(),
        ORIGINAL_CONTENTS.as_bytes(),
        "Output is different from the original file"
    );
}

#[tokio::test]
async fn test_auto_compress_round_trip_plain_file() {
    let backend = stage_backend();
    backend
        .control_plane
        .register_stage("%plain", "stages/tables/plain/");
    let session = session(&backend);

    let work_dir = tempfile::tempdir().unwrap();
    let data_file = work_dir.path().join("rows.csv");
    fs::write(&data_file, ORIGINAL_CONTENTS).unwrap();

    let rows = session
        .put(&put_request(data_file, "%plain", 4))
        .await
        .unwrap();
    assert_eq!(rows[0].status, TransferStatus::Uploaded);
    assert!(rows[0].target_size > 0);
    assert_eq!(rows[0].error_message, "");
    assert!(rows[0].digest.is_some());

    // Compression suffix is applied to the remote key and the content
    // decompresses back to the original bytes.
    let staged = backend
        .storage
        .read_object(BUCKET, "stages/tables/plain/rows.csv.gz")
        .unwrap();
    assert_eq!(gunzip_bytes(&staged).unwrap(), ORIGINAL_CONTENTS.as_bytes());

    let download_dir = work_dir.path().join("out");
    let rows = session
        .get(&TransferRequest {
            source: download_dir.clone(),
            stage_ref: "%plain".to_string(),
            direction: TransferDirection::Download,
            options: TransferOptions::default(),
        })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, TransferStatus::Downloaded);
    let downloaded = fs::read(download_dir.join("rows.csv.gz")).unwrap();
    assert_eq!(gunzip_bytes(&downloaded).unwrap(), ORIGINAL_CONTENTS.as_bytes());
}

#[tokio::test]
async fn test_wildcard_upload_preserves_discovery_order() {
    let backend = stage_backend();
    backend
        .control_plane
        .register_stage("%many", "stages/tables/many/");
    let session = session(&backend);

    let work_dir = tempfile::tempdir().unwrap();
    for name in ["b.csv", "a.csv", "c.csv"] {
        fs::write(work_dir.path().join(name), ORIGINAL_CONTENTS).unwrap();
    }
    // One file is already staged: expect SKIPPED for it, UPLOADED for the rest.
    backend.storage.insert_object(
        BUCKET,
        "stages/tables/many/b.csv.gz",
        vec![0x1f, 0x8b],
    );

    let rows = session
        .put(&put_request(work_dir.path().join("*.csv"), "%many", 8))
        .await
        .unwrap();

    let names: Vec<_> = rows.iter().map(|r| r.file_name.as_str()).collect();
    assert_eq!(names, vec!["a.csv", "b.csv", "c.csv"]);
    assert_eq!(rows[0].status, TransferStatus::Uploaded);
    assert_eq!(rows[1].status, TransferStatus::Skipped);
    assert_eq!(rows[2].status, TransferStatus::Uploaded);
}

#[tokio::test]
async fn test_put_to_unknown_stage_fails_whole_request() {
    let backend = stage_backend();
    let session = session(&backend);

    let work_dir = tempfile::tempdir().unwrap();
    let data_file = work_dir.path().join("rows.csv");
    fs::write(&data_file, ORIGINAL_CONTENTS).unwrap();

    let err = session
        .put(&put_request(data_file, "%missing", 4))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::NotFound(_)));
}

#[tokio::test]
async fn test_closed_session_refuses_requests() {
    let backend = stage_backend();
    backend
        .control_plane
        .register_stage("%t", "stages/tables/t/");
    let session = session(&backend);

    let work_dir = tempfile::tempdir().unwrap();
    let data_file = work_dir.path().join("rows.csv");
    fs::write(&data_file, ORIGINAL_CONTENTS).unwrap();

    session.close();
    let err = session
        .put(&put_request(data_file, "%t", 4))
        .await
        .unwrap_err();
    assert!(matches!(err, StageError::Cancelled(_)));
}
