//! End-to-end scan → upload → restore scenarios covering dedup, hard links,
//! deletions, and historical restore. Every test uses a disposable
//! `tempfile::tempdir()` root, a temp-file SQLite metadata store, and the
//! in-memory fake object store so none of this touches a real network.

use std::{
    os::unix::fs::{symlink, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
};

use s3backup::{
    arbiter::LargeBufferArbiter,
    infrastructure::{
        database::{entities, MetadataStore},
        gateway::{testing::FakeObjectStore, ObjectStore},
    },
    operations::{RestoreEngine, ScanEngine, UploadScheduler},
};
use sea_orm::EntityTrait;
use tokio_util::sync::CancellationToken;

const CHUNK_SIZE: u64 = 64 * 1024;
const BUFFER_SIZE: usize = 8 * 1024;

struct Harness {
    store: Arc<MetadataStore>,
    gateway: Arc<FakeObjectStore>,
}

impl Harness {
    async fn new(db_path: &Path) -> Self {
        let store = MetadataStore::open(db_path).await.expect("open metadata store");
        store.migrate().await.expect("run migrations");
        Self {
            store: Arc::new(store),
            gateway: Arc::new(FakeObjectStore::new()),
        }
    }

    fn gateway_dyn(&self) -> Arc<dyn ObjectStore> {
        self.gateway.clone()
    }

    async fn backup(&self, root: &Path) -> i64 {
        let upload_scheduler = UploadScheduler::new(4, 16, self.gateway_dyn(), LargeBufferArbiter::new(4), CHUNK_SIZE);
        let scan_engine = ScanEngine::new(
            self.store.clone(),
            upload_scheduler,
            8,
            CHUNK_SIZE,
            BUFFER_SIZE,
            CancellationToken::new(),
        );
        scan_engine.scan(root.to_path_buf()).await.expect("scan succeeds")
    }

    async fn restore(&self, target: &str, dest: &Path, generation: Option<i64>) {
        let engine = RestoreEngine::new(self.store.clone(), self.gateway_dyn(), LargeBufferArbiter::new(4), 8, CHUNK_SIZE);
        engine.restore(target, dest, generation).await.expect("restore succeeds");
    }

    async fn dirent_count(&self) -> usize {
        entities::Dirent::find().all(self.store.conn()).await.unwrap().len()
    }

    async fn version_count(&self) -> usize {
        entities::Version::find().all(self.store.conn()).await.unwrap().len()
    }
}

fn tmp() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp dir")
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_root_directory_round_trips() {
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();
    let dest = dir.path().join("b");
    std::fs::create_dir(&dest).unwrap();

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    harness.backup(&root).await;

    assert_eq!(harness.dirent_count().await, 1);
    assert_eq!(harness.version_count().await, 1);
    assert_eq!(harness.gateway.len().await, 0);

    harness.restore("all", &dest, None).await;
    assert!(dest.is_dir());
    let root_mode = std::fs::metadata(&root).unwrap().permissions().mode() & 0o7777;
    let dest_mode = std::fs::metadata(&dest).unwrap().permissions().mode() & 0o7777;
    assert_eq!(root_mode, dest_mode);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_small_file_hashes_to_known_key() {
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("f"), b"hello").unwrap();
    let dest = dir.path().join("b");
    std::fs::create_dir(&dest).unwrap();

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    harness.backup(&root).await;

    assert_eq!(harness.gateway.len().await, 1);
    let hash = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
    assert!(harness.gateway.get_bytes(hash).await.is_ok());

    harness.restore("all", &dest, None).await;
    assert_eq!(std::fs::read(dest.join("f")).unwrap(), b"hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn identical_contents_dedup_to_one_object() {
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();
    let contents = vec![0u8; 1024 * 1024];
    std::fs::write(root.join("f"), &contents).unwrap();
    std::fs::write(root.join("g"), &contents).unwrap();

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    harness.backup(&root).await;

    // 1 MiB / 64 KiB chunks => 16 chunks, each identical across f and g, so
    // exactly 16 distinct objects regardless of how many files reference them.
    assert_eq!(harness.gateway.len().await, 16);

    // Copying to a third name and re-backing-up must not add new objects.
    std::fs::write(root.join("h"), &contents).unwrap();
    harness.backup(&root).await;
    assert_eq!(harness.gateway.len().await, 16);
}

#[tokio::test(flavor = "multi_thread")]
async fn touch_without_content_change_adds_version_not_upload() {
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("f"), b"hello").unwrap();

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    harness.backup(&root).await;
    let versions_after_first = harness.version_count().await;
    let objects_after_first = harness.gateway.len().await;

    // Bump mtime without touching content.
    let now_secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let new_time = filetime::FileTime::from_unix_time(now_secs + 120, 0);
    filetime::set_file_mtime(root.join("f"), new_time).unwrap();

    harness.backup(&root).await;
    assert_eq!(harness.version_count().await, versions_after_first + 1);
    assert_eq!(harness.gateway.len().await, objects_after_first);
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_backup_with_no_changes_is_idempotent() {
    // spec.md §8 Idempotence: running backup twice with no filesystem
    // changes inserts exactly one new scan row and zero new version rows —
    // for every dirent in the tree, directories included.
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();
    std::fs::create_dir(root.join("sub")).unwrap();
    std::fs::write(root.join("f"), b"hello").unwrap();
    std::fs::write(root.join("sub").join("g"), b"world").unwrap();

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    harness.backup(&root).await;
    let versions_after_first = harness.version_count().await;
    let objects_after_first = harness.gateway.len().await;

    harness.backup(&root).await;

    let scans = harness.store.scans().await.unwrap();
    assert_eq!(scans.len(), 2);
    assert_eq!(harness.version_count().await, versions_after_first);
    assert_eq!(harness.gateway.len().await, objects_after_first);
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_after_no_op_rescan_still_finds_unchanged_files() {
    // version.parent_id points at the parent directory's version row; if an
    // unchanged directory were re-versioned on every scan, its unchanged
    // children would still carry the *old* parent_id and go missing from
    // children()/resolve_path() lookups against the newest root version.
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();
    std::fs::create_dir(root.join("sub")).unwrap();
    std::fs::write(root.join("f"), b"hello").unwrap();
    std::fs::write(root.join("sub").join("g"), b"world").unwrap();

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    harness.backup(&root).await;
    let k2 = harness.backup(&root).await;

    let dest = dir.path().join("b");
    std::fs::create_dir(&dest).unwrap();
    harness.restore("all", &dest, Some(k2)).await;

    assert_eq!(std::fs::read(dest.join("f")).unwrap(), b"hello");
    assert_eq!(std::fs::read(dest.join("sub").join("g")).unwrap(), b"world");
}

#[tokio::test(flavor = "multi_thread")]
async fn deletion_produces_tombstone_and_historical_restore_still_works() {
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("f"), b"hello").unwrap();

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    let k1 = harness.backup(&root).await;

    std::fs::remove_file(root.join("f")).unwrap();
    let k2 = harness.backup(&root).await;

    let dirent = entities::Dirent::find().all(harness.store.conn()).await.unwrap();
    let file_dirent = dirent
        .iter()
        .find(|d| matches!(d.dirent_kind(), entities::dirent::DirentKind::File))
        .expect("file dirent still present");
    assert!(file_dirent.is_deleted);

    let latest = harness.store.latest_version(file_dirent.id).await.unwrap().unwrap();
    assert!(latest.is_delmarker);

    let dest_k1 = dir.path().join("restore_k1");
    std::fs::create_dir(&dest_k1).unwrap();
    harness.restore("all", &dest_k1, Some(k1)).await;
    assert!(dest_k1.join("f").exists());

    let dest_k2 = dir.path().join("restore_k2");
    std::fs::create_dir(&dest_k2).unwrap();
    harness.restore("all", &dest_k2, Some(k2)).await;
    assert!(!dest_k2.join("f").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn historical_restore_across_generations_yields_each_generations_content() {
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("f"), b"version one").unwrap();

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    let k1 = harness.backup(&root).await;

    // ctime/mtime must actually change for the scan to see new content; sleep
    // briefly so the filesystem clock advances past 1-second mtime
    // resolution on some filesystems.
    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    std::fs::write(root.join("f"), b"version two, which is longer").unwrap();
    let k2 = harness.backup(&root).await;

    let dest1 = dir.path().join("d1");
    std::fs::create_dir(&dest1).unwrap();
    harness.restore("all", &dest1, Some(k1)).await;
    assert_eq!(std::fs::read(dest1.join("f")).unwrap(), b"version one");

    let dest2 = dir.path().join("d2");
    std::fs::create_dir(&dest2).unwrap();
    harness.restore("all", &dest2, Some(k2)).await;
    assert_eq!(std::fs::read(dest2.join("f")).unwrap(), b"version two, which is longer");
}

#[tokio::test(flavor = "multi_thread")]
async fn hard_linked_files_share_one_inode_after_restore() {
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("f"), b"x").unwrap();
    std::fs::hard_link(root.join("f"), root.join("g")).unwrap();

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    harness.backup(&root).await;

    // Content materialised exactly once.
    assert_eq!(harness.gateway.len().await, 1);

    let dest = dir.path().join("b");
    std::fs::create_dir(&dest).unwrap();
    harness.restore("all", &dest, None).await;

    let f_meta = std::fs::metadata(dest.join("f")).unwrap();
    let g_meta = std::fs::metadata(dest.join("g")).unwrap();
    assert_eq!(f_meta.ino(), g_meta.ino());
    assert_eq!(std::fs::read(dest.join("f")).unwrap(), b"x");
    assert_eq!(std::fs::read(dest.join("g")).unwrap(), b"x");
}

#[tokio::test(flavor = "multi_thread")]
async fn large_file_chunks_concatenate_back_to_original_bytes() {
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();

    // A few bytes over three chunk boundaries, non-uniform content so a
    // chunk-ordering bug (not just a dedup bug) would be caught.
    let mut contents = Vec::with_capacity((CHUNK_SIZE as usize) * 3 + 777);
    for i in 0..contents.capacity() {
        contents.push((i % 251) as u8);
    }
    std::fs::write(root.join("big"), &contents).unwrap();

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    harness.backup(&root).await;
    assert_eq!(harness.gateway.len().await, 4);

    let dest = dir.path().join("b");
    std::fs::create_dir(&dest).unwrap();
    harness.restore("all", &dest, None).await;
    assert_eq!(std::fs::read(dest.join("big")).unwrap(), contents);
}

#[tokio::test(flavor = "multi_thread")]
async fn symlink_and_xattrs_round_trip() {
    let dir = tmp();
    let root = dir.path().join("a");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("target"), b"payload").unwrap();
    symlink("target", root.join("link")).unwrap();
    // xattrs may be unsupported on the test filesystem (e.g. tmpfs without
    // user_xattr); best-effort, the round-trip assertion below still holds
    // either way since both sides read back whatever was actually set.
    let _ = xattr::set(root.join("target"), "user.comment", b"note");

    let harness = Harness::new(&dir.path().join("meta.db")).await;
    harness.backup(&root).await;

    let dest = dir.path().join("b");
    std::fs::create_dir(&dest).unwrap();
    harness.restore("all", &dest, None).await;

    let link_target = std::fs::read_link(dest.join("link")).unwrap();
    assert_eq!(link_target, PathBuf::from("target"));
    assert_eq!(std::fs::read(dest.join("target")).unwrap(), b"payload");

    if let Ok(Some(original)) = xattr::get(root.join("target"), "user.comment") {
        let restored = xattr::get(dest.join("target"), "user.comment").unwrap();
        assert_eq!(restored, Some(original));
    }
}
