//! Behavioural contract of the filesystem layer, run against the in-memory
//! store through the shared integration helper.

use blobfs::{
    BlobFileSystem, CreateOptions, ErrorClass, FsError, FsOptions, ObjectPath, ReadOptions,
    TestBuckets,
    harness::IntegrationHelper,
    store::{ListParams, ObjectStore, WriteMode, memory::InMemoryStore},
};
use bytes::Bytes;
use std::{sync::Arc, time::Duration};

async fn setup_with(options: FsOptions) -> (IntegrationHelper, InMemoryStore) {
    let store = InMemoryStore::new();
    let fs = BlobFileSystem::new(Arc::new(store.clone()), options);
    let helper = IntegrationHelper::new(fs, TestBuckets::new("contract"));
    helper.before_all_tests().await.unwrap();
    (helper, store)
}

async fn setup() -> (IntegrationHelper, InMemoryStore) {
    setup_with(FsOptions::default()).await
}

fn path(bucket: &str, key: &str) -> ObjectPath {
    ObjectPath::new(bucket, key, true).unwrap()
}

async fn all_keys(store: &InMemoryStore, bucket: &str) -> Vec<String> {
    store
        .list(bucket, &ListParams::recursive(""))
        .await
        .unwrap()
        .objects
        .into_iter()
        .map(|o| o.key)
        .collect()
}

#[tokio::test]
async fn mkdir_through_a_file_changes_nothing() {
    let (h, store) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    h.create_objects_with_subdirs(&bucket, &["a/b"]).await.unwrap();
    h.write_text_file(&bucket, "top", "x").await.unwrap();
    let before = all_keys(&store, &bucket).await;

    for target in ["a/b/c/", "a/b/c/d/e/", "top/", "top/deeper/"] {
        let err = h.fs().mkdir(&path(&bucket, target)).await.unwrap_err();
        assert!(matches!(err, FsError::PathIsFile(_)), "{}: {:?}", target, err);
        assert_eq!(err.class(), ErrorClass::Structural);
    }

    assert_eq!(all_keys(&store, &bucket).await, before);
}

#[tokio::test]
async fn roundtrips_empty_small_and_large_files() {
    let (h, _) = setup().await;
    let large: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();

    for data in [Vec::new(), vec![7u8], large.clone()] {
        let p = h.unique_object_path("roundtrip").unwrap();
        assert_eq!(
            h.write_file(&p, &data, 1, false).await.unwrap(),
            data.len() as u64
        );
        assert_eq!(h.read_file(&p).await.unwrap(), data);
        assert_eq!(h.fs().stat(&p).await.unwrap().size, data.len() as u64);
    }

    let p = h.unique_object_path("ranged").unwrap();
    h.write_file(&p, &large, 1, false).await.unwrap();
    let mut reader = h.fs().open(&p).await.unwrap();
    reader.seek(65_000);
    let mut buf = vec![0u8; 10_000];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 5_000);
    assert_eq!(&buf[..5_000], &large[65_000..]);
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);

    reader.seek(10);
    let mut small = [0u8; 4];
    assert_eq!(reader.read(&mut small).await.unwrap(), 4);
    assert_eq!(&small, &large[10..14]);
    assert_eq!(reader.position(), 14);
}

#[tokio::test]
async fn read_text_at_honours_offsets() {
    let (h, _) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    let name = h.unique_object_name("text");
    h.write_text_file(&bucket, &name, "0123456789").await.unwrap();

    assert_eq!(h.read_text_file(&bucket, &name).await.unwrap(), "0123456789");
    assert_eq!(
        h.read_text_at(&bucket, &name, 7, 3, true).await.unwrap(),
        "789"
    );
    assert!(h.read_text_at(&bucket, &name, 2, 3, true).await.is_err());
}

#[tokio::test]
async fn delete_is_idempotent() {
    let (h, _) = setup().await;
    let p = h.unique_object_path("gone").unwrap();

    h.fs().delete(&p, false).await.unwrap();
    h.write_file(&p, b"data", 1, false).await.unwrap();
    h.fs().delete(&p, false).await.unwrap();
    h.fs().delete(&p, false).await.unwrap();
    assert!(!h.fs().exists(&p).await.unwrap());
}

#[tokio::test]
async fn bulk_created_files_all_list() {
    let (h, _) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    let names: Vec<String> = (0..100).map(|i| format!("many/file-{:03}", i)).collect();

    assert_eq!(h.create_objects(&bucket, &names).await.unwrap(), 100);
    let children = h.fs().list_children(&path(&bucket, "many/")).await.unwrap();
    assert_eq!(children.len(), 100);
    assert_eq!(children[0].key(), "many/file-000");

    for name in names.iter().take(3) {
        let info = h.fs().stat(&path(&bucket, name)).await.unwrap();
        assert_eq!(Some(info.size), h.expected_object_size(name, true));
    }
}

#[tokio::test]
async fn markers_count_as_directories_not_children() {
    let (h, _) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    h.create_objects_with_subdirs(&bucket, &["tree/a/x", "tree/b", "tree/c/"])
        .await
        .unwrap();

    let children = h.fs().list_children(&path(&bucket, "tree")).await.unwrap();
    let keys: Vec<&str> = children.iter().map(|p| p.key()).collect();
    assert_eq!(keys, vec!["tree/a/", "tree/b", "tree/c/"]);

    let info = h.fs().stat(&path(&bucket, "tree/c")).await.unwrap();
    assert!(info.is_directory);
    assert_eq!(
        h.fs().list_children(&path(&bucket, "tree/c/")).await.unwrap(),
        Vec::<ObjectPath>::new()
    );
    assert!(matches!(
        h.fs().list_children(&path(&bucket, "nowhere/")).await,
        Err(FsError::NotFound(_))
    ));
}

#[tokio::test]
async fn files_and_directories_do_not_shadow_each_other() {
    let (h, _) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    h.write_text_file(&bucket, "plain", "p").await.unwrap();
    h.fs().mkdir(&path(&bucket, "folder/")).await.unwrap();

    let err = h.fs().mkdir(&path(&bucket, "plain/")).await.unwrap_err();
    assert!(matches!(err, FsError::PathIsFile(_)));

    for options in [CreateOptions::create_new(), CreateOptions::overwrite()] {
        let err = h
            .fs()
            .create(&path(&bucket, "folder"), options)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FsError::PathIsDirectory(_)));
    }

    let err = h.fs().open(&path(&bucket, "folder")).await.err().unwrap();
    assert!(matches!(err, FsError::PathIsDirectory(_)));

    let err = h
        .fs()
        .create(&path(&bucket, "plain/child"), CreateOptions::overwrite())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FsError::PathIsFile(_)));
}

#[tokio::test]
async fn tie_break_when_file_and_directory_share_a_name() {
    let (h, store) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    for key in ["k", "k/", "k/child"] {
        store
            .put(&bucket, key, Bytes::from(key.to_string()), WriteMode::Overwrite)
            .await
            .unwrap();
    }
    let k = path(&bucket, "k");

    // File wins.
    assert!(!h.fs().stat(&k).await.unwrap().is_directory);
    assert_eq!(h.read_file(&k).await.unwrap(), b"k");
    let err = h
        .fs()
        .create(&k, CreateOptions::create_new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FsError::AlreadyExists(_)));

    // Directory wins.
    h.fs().mkdir(&path(&bucket, "k/")).await.unwrap();
    h.fs().mkdir(&path(&bucket, "k/sub/")).await.unwrap();
    let children = h.fs().list_children(&k).await.unwrap();
    let keys: Vec<&str> = children.iter().map(|p| p.key()).collect();
    assert_eq!(keys, vec!["k/child", "k/sub/"]);

    // Deleting the name removes the file and leaves the directory.
    h.fs().delete(&k, false).await.unwrap();
    assert!(store.head(&bucket, "k").await.unwrap().is_none());
    assert!(h.fs().stat(&k).await.unwrap().is_directory);
}

#[tokio::test]
async fn non_recursive_delete_refuses_populated_directory() {
    let (h, store) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    h.create_objects_with_subdirs(&bucket, &["full/one", "full/two"])
        .await
        .unwrap();
    let before = all_keys(&store, &bucket).await;

    let err = h.fs().delete(&path(&bucket, "full/"), false).await.unwrap_err();
    assert!(matches!(err, FsError::DirectoryNotEmpty(_)));
    assert_eq!(all_keys(&store, &bucket).await, before);

    h.fs().delete(&path(&bucket, "full/"), true).await.unwrap();
    assert!(all_keys(&store, &bucket).await.is_empty());
}

#[tokio::test]
async fn recursive_delete_reports_every_failed_child() {
    let (h, store) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    h.create_objects_with_subdirs(&bucket, &["doomed/a", "doomed/b", "doomed/c"])
        .await
        .unwrap();
    store.fail_key("doomed/b");

    let err = h
        .fs()
        .delete(&path(&bucket, "doomed/"), true)
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Partial);
    assert_eq!(err.failed_items(), vec!["doomed/b"]);
    assert!(matches!(err, FsError::PartialFailure { total: 3, .. }));

    assert_eq!(all_keys(&store, &bucket).await, vec!["doomed/", "doomed/b"]);

    store.clear_faults();
    h.fs().delete(&path(&bucket, "doomed/"), true).await.unwrap();
    assert!(all_keys(&store, &bucket).await.is_empty());
}

#[tokio::test]
async fn bulk_join_deadline_aborts_slow_batches() {
    let options = FsOptions {
        join_timeout: Duration::from_millis(50),
        ..FsOptions::default()
    };
    let (h, store) = setup_with(options).await;
    let bucket = h.shared_bucket_1.clone();
    store.set_latency(Duration::from_secs(2));

    let err = h
        .create_objects(&bucket, &["slow-1", "slow-2", "slow-3"])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FsError::Timeout {
            operation: "create",
            pending: 3,
            ..
        }
    ));
    assert_eq!(err.class(), ErrorClass::Transient);
}

#[tokio::test]
async fn rename_moves_files_and_trees() {
    let (h, store) = setup().await;
    let bucket = h.shared_bucket_1.clone();

    h.write_text_file(&bucket, "src.txt", "payload").await.unwrap();
    h.fs()
        .rename(&path(&bucket, "src.txt"), &path(&bucket, "moved/dst.txt"))
        .await
        .unwrap();
    assert_eq!(
        h.read_text_file(&bucket, "moved/dst.txt").await.unwrap(),
        "payload"
    );
    assert!(!h.fs().exists(&path(&bucket, "src.txt")).await.unwrap());

    h.create_objects_with_subdirs(&bucket, &["d1/x", "d1/sub/y"])
        .await
        .unwrap();
    h.fs()
        .rename(&path(&bucket, "d1/"), &path(&bucket, "d2/"))
        .await
        .unwrap();
    let keys = all_keys(&store, &bucket).await;
    assert!(keys.iter().all(|k| !k.starts_with("d1/")));
    for key in ["d2/", "d2/sub/", "d2/sub/y", "d2/x"] {
        assert!(keys.contains(&key.to_string()), "missing {}", key);
    }
    assert_eq!(h.read_text_file(&bucket, "d2/sub/y").await.unwrap(), "d1/sub/y");

    let err = h
        .fs()
        .rename(&path(&bucket, "d2/"), &path(&bucket, "d2/inner/"))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::InvalidPath { .. }));

    let err = h
        .fs()
        .rename(&path(&bucket, "d2/x"), &path(&bucket, "moved/dst.txt"))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists(_)));
}

#[tokio::test]
async fn rename_across_buckets() {
    let (h, _) = setup().await;
    let (one, two) = (h.shared_bucket_1.clone(), h.shared_bucket_2.clone());
    h.write_text_file(&one, "hop", "over").await.unwrap();

    h.fs()
        .rename(&path(&one, "hop"), &path(&two, "landed"))
        .await
        .unwrap();
    assert_eq!(h.read_text_file(&two, "landed").await.unwrap(), "over");
    assert!(!h.fs().exists(&path(&one, "hop")).await.unwrap());
}

#[tokio::test]
async fn rename_checks_the_source_before_anything_else() {
    let (h, _) = setup().await;
    let bucket = h.shared_bucket_1.clone();

    let missing = path(&bucket, "never-written");
    assert!(matches!(
        h.fs().rename(&missing, &missing).await,
        Err(FsError::NotFound(_))
    ));

    h.write_text_file(&bucket, "f", "data").await.unwrap();
    let err = h
        .fs()
        .rename(&path(&bucket, "f"), &path(&bucket, "f/"))
        .await
        .unwrap_err();
    assert!(matches!(err, FsError::InvalidPath { .. }));

    h.fs()
        .rename(&path(&bucket, "f"), &path(&bucket, "f"))
        .await
        .unwrap();
    assert_eq!(h.read_text_file(&bucket, "f").await.unwrap(), "data");
}

#[tokio::test]
async fn failed_directory_copy_leaves_the_source_tree() {
    let (h, store) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    h.create_objects_with_subdirs(&bucket, &["from/a", "from/b", "from/sub/c"])
        .await
        .unwrap();
    let sources: Vec<String> = all_keys(&store, &bucket)
        .await
        .into_iter()
        .filter(|k| k.starts_with("from/"))
        .collect();
    store.fail_key("to/b");

    let err = h
        .fs()
        .rename(&path(&bucket, "from/"), &path(&bucket, "to/"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FsError::PartialFailure {
            operation: "rename-copy",
            ..
        }
    ));
    assert_eq!(err.failed_items(), vec!["from/b"]);

    let remaining: Vec<String> = all_keys(&store, &bucket)
        .await
        .into_iter()
        .filter(|k| k.starts_with("from/"))
        .collect();
    assert_eq!(remaining, sources);
    assert_eq!(h.read_text_file(&bucket, "from/sub/c").await.unwrap(), "from/sub/c");
}

#[tokio::test]
async fn delete_in_a_missing_bucket_is_a_no_op() {
    let (h, _) = setup().await;
    let missing = h.unique_bucket_name("absent");

    h.fs().delete(&path(&missing, "file"), false).await.unwrap();
    h.fs().delete(&path(&missing, "dir/"), true).await.unwrap();
    assert!(!h.fs().bucket_exists(&missing).await.unwrap());
}

#[tokio::test]
async fn create_new_refuses_existing_objects() {
    let (h, _) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    h.write_text_file(&bucket, "once", "1").await.unwrap();

    assert!(h.write_text_file(&bucket, "once", "2").await.is_err());
    let err = h
        .fs()
        .create(&path(&bucket, "once"), CreateOptions::create_new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, FsError::AlreadyExists(_)));
    assert_eq!(h.read_text_file(&bucket, "once").await.unwrap(), "1");
}

#[tokio::test]
async fn lazy_open_defers_not_found() {
    let (h, _) = setup().await;
    let p = h.unique_object_path("absent").unwrap();

    assert!(matches!(h.fs().open(&p).await, Err(FsError::NotFound(_))));

    let lazy = ReadOptions {
        fast_fail_on_not_found: false,
        ..ReadOptions::default()
    };
    let mut reader = h.fs().open_with(&p, &lazy).await.unwrap();
    let mut buf = [0u8; 8];
    assert!(matches!(reader.read(&mut buf).await, Err(FsError::NotFound(_))));
}

#[tokio::test]
async fn concurrent_mkdir_of_one_directory_succeeds() {
    let (h, store) = setup().await;
    let bucket = h.shared_bucket_1.clone();
    let target = path(&bucket, "race/");

    let (a, b) = tokio::join!(h.fs().mkdir(&target), h.fs().mkdir(&target));
    a.unwrap();
    b.unwrap();
    assert_eq!(all_keys(&store, &bucket).await, vec!["race/"]);
}

#[tokio::test]
async fn sweep_removes_only_test_buckets() {
    let (h, _) = setup().await;
    let extra = h.create_unique_bucket("extra").await.unwrap();
    h.write_text_file(&extra, "file", "x").await.unwrap();
    h.fs().create_bucket("keep-me").await.unwrap();

    assert_eq!(h.after_all_tests().await.unwrap(), 3);
    assert!(!h.fs().bucket_exists(&extra).await.unwrap());
    assert!(!h.fs().bucket_exists(&h.shared_bucket_1).await.unwrap());
    assert!(h.fs().bucket_exists("keep-me").await.unwrap());
}

#[tokio::test]
async fn clear_bucket_keeps_the_bucket() {
    let (h, store) = setup().await;
    let bucket = h.shared_bucket_2.clone();
    h.create_objects_with_subdirs(&bucket, &["x/y/z", "w"])
        .await
        .unwrap();

    h.clear_bucket(&bucket).await.unwrap();
    assert!(all_keys(&store, &bucket).await.is_empty());
    assert!(h.fs().bucket_exists(&bucket).await.unwrap());
}
