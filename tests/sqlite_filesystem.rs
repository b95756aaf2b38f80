//! The filesystem layer over the on-disk store.

use blobfs::{
    BlobFileSystem, CreateOptions, FsError, FsOptions, ObjectPath,
    store::{WriteMode, sqlite::SqliteStore},
};
use bytes::Bytes;
use std::sync::Arc;
use tempfile::TempDir;

async fn open_fs() -> (TempDir, BlobFileSystem) {
    let dir = tempfile::tempdir().unwrap();
    let db_url = format!("sqlite://{}", dir.path().join("meta/blobfs.db").display());
    let store = SqliteStore::connect(&db_url, dir.path().join("objects"))
        .await
        .unwrap();
    let fs = BlobFileSystem::new(Arc::new(store), FsOptions::default());
    fs.mkdir(&ObjectPath::bucket_root("disk").unwrap())
        .await
        .unwrap();
    (dir, fs)
}

fn path(key: &str) -> ObjectPath {
    ObjectPath::new("disk", key, true).unwrap()
}

#[tokio::test]
async fn directory_tree_lifecycle() {
    let (_dir, fs) = open_fs().await;

    fs.mkdir(&path("docs/")).await.unwrap();
    fs.mkdir(&path("docs/")).await.unwrap();
    for name in ["docs/a.txt", "docs/deep/b.txt"] {
        let mut writer = fs.create(&path(name), CreateOptions::create_new()).await.unwrap();
        writer.write(name.as_bytes());
        assert_eq!(writer.close().await.unwrap(), name.len() as u64);
    }

    let children = fs.list_children(&path("docs/")).await.unwrap();
    let keys: Vec<&str> = children.iter().map(|p| p.key()).collect();
    assert_eq!(keys, vec!["docs/a.txt", "docs/deep/"]);

    let mut reader = fs.open(&path("docs/deep/b.txt")).await.unwrap();
    reader.seek(5);
    assert_eq!(reader.read_to_end().await.unwrap(), b"deep/b.txt");

    assert!(matches!(
        fs.delete(&path("docs/"), false).await,
        Err(FsError::DirectoryNotEmpty(_))
    ));
    fs.delete(&path("docs/"), true).await.unwrap();
    assert!(!fs.exists(&path("docs/")).await.unwrap());
}

#[tokio::test]
async fn file_and_marker_with_one_name_coexist() {
    let (_dir, fs) = open_fs().await;
    let store = fs.store().clone();
    store
        .put("disk", "both", Bytes::from_static(b"file"), WriteMode::CreateNew)
        .await
        .unwrap();
    store
        .put("disk", "both/", Bytes::new(), WriteMode::CreateNew)
        .await
        .unwrap();

    assert!(!fs.stat(&path("both")).await.unwrap().is_directory);
    fs.mkdir(&path("both/")).await.unwrap();

    fs.delete(&path("both"), false).await.unwrap();
    assert!(fs.is_directory(&path("both")).await.unwrap());
}

#[tokio::test]
async fn mkdir_below_a_file_fails() {
    let (_dir, fs) = open_fs().await;
    let mut writer = fs.create(&path("f"), CreateOptions::overwrite()).await.unwrap();
    writer.write(b"x");
    writer.close().await.unwrap();

    assert!(matches!(
        fs.mkdir(&path("f/g/")).await,
        Err(FsError::PathIsFile(_))
    ));
    assert_eq!(fs.list_children(&path("")).await.unwrap(), vec![path("f")]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bulk_overwrites_of_distinct_files_all_land() {
    let (_dir, fs) = open_fs().await;
    let names: Vec<String> = (0..64).map(|i| format!("d/f{:02}", i)).collect();

    let task_fs = fs.clone();
    let written = fs
        .bulk()
        .run("overwrite", names.clone(), move |name| {
            let fs = task_fs.clone();
            async move {
                let mut writer = fs
                    .create(&ObjectPath::new("disk", name.clone(), false)?, CreateOptions::overwrite())
                    .await?;
                writer.write(name.as_bytes());
                writer.close().await.map(|_| ())
            }
        })
        .await
        .unwrap();
    assert_eq!(written, 64);

    let children = fs.list_children(&path("d/")).await.unwrap();
    assert_eq!(children.len(), 64);
}
