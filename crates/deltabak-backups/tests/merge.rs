use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use deltabak_backups::{
    merge_chain, merge_state, merge_vhd, Chain, ChainError, ChainLocks, MergeJob, MergeOptions,
    MergeProgress, ProgressFn,
};
use deltabak_fs::{
    BoxedAsyncRead, BoxedFile, FileHandle, FsError, Handler, ListOptions, MemHandler, OpenMode,
};
use deltabak_vhd::{create_dynamic, open_vhd, CreateOptions, DiskType, VhdChain};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

const BLOCK_SIZE: u32 = 16 * 1024;
const SIZE: u64 = 8 * BLOCK_SIZE as u64;

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

async fn create(handler: &dyn Handler, path: &str, parent: Option<(&str, &str)>) {
    let file = handler.open_file(path, OpenMode::ReadWrite).await.unwrap();
    let mut options = CreateOptions::new(SIZE);
    options.block_size = BLOCK_SIZE;
    let mut vhd = create_dynamic(file, options).await.unwrap();
    if let Some((parent_path, parent_name)) = parent {
        let parent = open_vhd(handler, parent_path, OpenMode::Read).await.unwrap();
        vhd.set_parent(parent.footer(), parent_name).await.unwrap();
    }
}

async fn write(handler: &dyn Handler, path: &str, sector: u64, data: &[u8]) {
    let mut vhd = open_vhd(handler, path, OpenMode::ReadWrite).await.unwrap();
    vhd.write_data(sector, data).await.unwrap();
}

async fn read_flat(handler: &dyn Handler, leaf: &str) -> Vec<u8> {
    let mut chain = VhdChain::open(handler, leaf).await.unwrap();
    let mut buf = vec![0u8; chain.capacity() as usize];
    chain.read_at(0, &mut buf).await.unwrap();
    buf
}

/// `base.vhd` with two blocks of data and `child.vhd` touching six blocks. Returns the
/// expected merged content.
async fn parent_and_child(handler: &dyn Handler) -> Vec<u8> {
    create(handler, "/d/base.vhd", None).await;
    let base = random_bytes(2 * BLOCK_SIZE as usize, 1);
    write(handler, "/d/base.vhd", 0, &base).await;

    create(handler, "/d/child.vhd", Some(("/d/base.vhd", "base.vhd"))).await;
    let overlay = random_bytes(5 * BLOCK_SIZE as usize + 3 * 512, 2);
    write(handler, "/d/child.vhd", 20, &overlay).await;

    let mut expected = vec![0u8; SIZE as usize];
    expected[..base.len()].copy_from_slice(&base);
    expected[20 * 512..20 * 512 + overlay.len()].copy_from_slice(&overlay);
    expected
}

#[tokio::test]
async fn merge_folds_child_into_parent() {
    let handler = MemHandler::new();
    let expected = parent_and_child(&handler).await;
    assert_eq!(read_flat(&handler, "/d/child.vhd").await, expected);
    let child_uuid = open_vhd(&handler, "/d/child.vhd", OpenMode::Read)
        .await
        .unwrap()
        .footer()
        .uuid;

    let summary = merge_vhd(&handler, "/d/base.vhd", "/d/child.vhd", MergeOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.blocks, 6);
    assert_eq!(summary.resumed_at, None);
    assert!(!summary.already_merged);

    let merged = open_vhd(&handler, "/d/base.vhd", OpenMode::Read).await.unwrap();
    assert_eq!(merged.disk_type(), DiskType::Dynamic);
    assert_eq!(merged.footer().uuid, child_uuid);
    drop(merged);
    assert_eq!(read_flat(&handler, "/d/base.vhd").await, expected);
    assert!(!handler.exists("/d/.base.vhd.merge.json").await.unwrap());

    // A second attempt notices the identity switch and writes nothing.
    let before = handler.snapshot();
    let again = merge_vhd(&handler, "/d/base.vhd", "/d/child.vhd", MergeOptions::default())
        .await
        .unwrap();
    assert!(again.already_merged);
    assert_eq!(handler.snapshot(), before);
}

#[tokio::test]
async fn merge_chain_renames_parent_over_child() {
    let handler = MemHandler::new();
    let expected = parent_and_child(&handler).await;
    let job = MergeJob {
        chain: Chain::from_root(vec!["/d/base.vhd".to_string(), "/d/child.vhd".to_string()])
            .unwrap(),
        remove: true,
        merge: true,
    };

    let outcome = merge_chain(&handler, &job, &ChainLocks::new(), MergeOptions::default())
        .await
        .unwrap();
    assert!(outcome.renamed);
    assert!(outcome.skipped.is_empty());
    assert_eq!(handler.paths(), vec!["/d/child.vhd".to_string()]);
    assert_eq!(read_flat(&handler, "/d/child.vhd").await, expected);
}

#[tokio::test]
async fn merge_chain_without_remove_keeps_the_chain_readable() {
    let handler = MemHandler::new();
    let expected = parent_and_child(&handler).await;
    let chain =
        Chain::from_root(vec!["/d/base.vhd".to_string(), "/d/child.vhd".to_string()]).unwrap();
    let locks = ChainLocks::new();

    let job = MergeJob {
        chain: chain.clone(),
        remove: false,
        merge: true,
    };
    let outcome = merge_chain(&handler, &job, &locks, MergeOptions::default())
        .await
        .unwrap();
    assert!(!outcome.renamed);
    assert_eq!(outcome.summary.unwrap().blocks, 6);
    assert_eq!(read_flat(&handler, "/d/child.vhd").await, expected);

    let state = merge_state::load(&handler, "/d/base.vhd").await.unwrap().unwrap();
    assert_eq!(state.current_block, state.total_blocks);

    // The next pass allowed to remove only finishes the job.
    let job = MergeJob {
        chain,
        remove: true,
        merge: true,
    };
    let outcome = merge_chain(&handler, &job, &locks, MergeOptions::default())
        .await
        .unwrap();
    let summary = outcome.summary.unwrap();
    assert_eq!(summary.resumed_at, Some(6));
    assert_eq!(summary.merged_bytes, state.merged_data_size);
    assert_eq!(handler.paths(), vec!["/d/child.vhd".to_string()]);
    assert_eq!(read_flat(&handler, "/d/child.vhd").await, expected);
}

#[tokio::test]
async fn merge_job_without_merge_changes_nothing() {
    let handler = MemHandler::new();
    parent_and_child(&handler).await;
    let before = handler.snapshot();
    let job = MergeJob {
        chain: Chain::from_root(vec!["/d/base.vhd".to_string(), "/d/child.vhd".to_string()])
            .unwrap(),
        remove: true,
        merge: false,
    };
    let outcome = merge_chain(&handler, &job, &ChainLocks::new(), MergeOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.summary, None);
    assert_eq!(handler.snapshot(), before);
}

#[tokio::test]
async fn unrelated_disks_are_not_merged() {
    let handler = MemHandler::new();
    parent_and_child(&handler).await;
    create(&handler, "/d/other.vhd", None).await;

    let err = merge_vhd(&handler, "/d/other.vhd", "/d/child.vhd", MergeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::ParentMismatch { .. }), "{err}");

    let err = merge_vhd(&handler, "/d/child.vhd", "/d/base.vhd", MergeOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, ChainError::ParentMismatch { reason, .. } if reason == "child is not a differencing disk")
    );
}

#[tokio::test]
async fn progress_is_reported_per_interval() {
    let handler = MemHandler::new();
    parent_and_child(&handler).await;

    let reports = AtomicU32::new(0);
    let last = std::sync::Mutex::new(None::<MergeProgress>);
    let on_progress: &ProgressFn = &|progress: &MergeProgress| {
        reports.fetch_add(1, Ordering::SeqCst);
        *last.lock().unwrap() = Some(progress.clone());
    };
    let options = MergeOptions {
        progress_interval: Duration::ZERO,
        on_progress: Some(on_progress),
    };
    merge_vhd(&handler, "/d/base.vhd", "/d/child.vhd", options)
        .await
        .unwrap();

    // One report per block plus the final one.
    assert_eq!(reports.load(Ordering::SeqCst), 7);
    let last = last.lock().unwrap().clone().unwrap();
    assert_eq!((last.done, last.total), (6, 6));
}

/// Delegates to a [`MemHandler`], failing writes to one file once `fail` is set.
struct FlakyHandler {
    inner: MemHandler,
    target: String,
    fail: Arc<AtomicBool>,
}

struct FlakyFile {
    inner: BoxedFile,
    fail: Arc<AtomicBool>,
}

impl FlakyFile {
    fn check(&self) -> deltabak_fs::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FsError::Io(std::io::Error::other("injected write failure")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileHandle for FlakyFile {
    async fn len(&mut self) -> deltabak_fs::Result<u64> {
        self.inner.len().await
    }

    async fn set_len(&mut self, len: u64) -> deltabak_fs::Result<()> {
        self.check()?;
        self.inner.set_len(len).await
    }

    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> deltabak_fs::Result<()> {
        self.inner.read_at(offset, buf).await
    }

    async fn write_at(&mut self, offset: u64, buf: &[u8]) -> deltabak_fs::Result<()> {
        self.check()?;
        self.inner.write_at(offset, buf).await
    }

    async fn sync_all(&mut self) -> deltabak_fs::Result<()> {
        self.inner.sync_all().await
    }
}

#[async_trait::async_trait]
impl Handler for FlakyHandler {
    async fn list(&self, dir: &str, options: ListOptions<'_>) -> deltabak_fs::Result<Vec<String>> {
        self.inner.list(dir, options).await
    }

    async fn read_file(&self, path: &str) -> deltabak_fs::Result<Vec<u8>> {
        self.inner.read_file(path).await
    }

    async fn output_file(&self, path: &str, data: &[u8]) -> deltabak_fs::Result<()> {
        self.inner.output_file(path, data).await
    }

    async fn unlink(&self, path: &str) -> deltabak_fs::Result<()> {
        self.inner.unlink(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> deltabak_fs::Result<()> {
        self.inner.rename(from, to).await
    }

    async fn get_size(&self, path: &str) -> deltabak_fs::Result<u64> {
        self.inner.get_size(path).await
    }

    async fn mkdir_all(&self, dir: &str) -> deltabak_fs::Result<()> {
        self.inner.mkdir_all(dir).await
    }

    async fn open_file(&self, path: &str, mode: OpenMode) -> deltabak_fs::Result<BoxedFile> {
        let file = self.inner.open_file(path, mode).await?;
        if path != self.target {
            return Ok(file);
        }
        Ok(Box::new(FlakyFile {
            inner: file,
            fail: self.fail.clone(),
        }))
    }

    async fn create_read_stream(&self, path: &str, start: u64) -> deltabak_fs::Result<BoxedAsyncRead> {
        self.inner.create_read_stream(path, start).await
    }
}

#[tokio::test]
async fn interrupted_merge_resumes_from_saved_block() {
    let inner = MemHandler::new();
    let expected = parent_and_child(&inner).await;
    let fail = Arc::new(AtomicBool::new(false));
    let flaky = FlakyHandler {
        inner: inner.clone(),
        target: "/d/base.vhd".to_string(),
        fail: fail.clone(),
    };

    let on_progress: &ProgressFn = &|progress: &MergeProgress| {
        if progress.done == 2 {
            fail.store(true, Ordering::SeqCst);
        }
    };
    let options = MergeOptions {
        progress_interval: Duration::ZERO,
        on_progress: Some(on_progress),
    };
    let err = merge_vhd(&flaky, "/d/base.vhd", "/d/child.vhd", options)
        .await
        .unwrap_err();
    assert!(matches!(err, ChainError::PartialMerge { .. }), "{err}");

    let state = merge_state::load(&inner, "/d/base.vhd").await.unwrap().unwrap();
    assert_eq!(state.current_block, 2);
    assert_eq!(state.total_blocks, 6);
    // Still a valid disk, and still the parent of the child.
    assert_eq!(read_flat(&inner, "/d/child.vhd").await, expected);

    let summary = merge_vhd(&inner, "/d/base.vhd", "/d/child.vhd", MergeOptions::default())
        .await
        .unwrap();
    assert_eq!(summary.resumed_at, Some(2));
    assert_eq!(read_flat(&inner, "/d/base.vhd").await, expected);
    assert!(merge_state::load(&inner, "/d/base.vhd").await.unwrap().is_none());
}

#[tokio::test]
async fn merges_of_one_root_run_one_at_a_time() {
    let handler = MemHandler::new();
    let expected = parent_and_child(&handler).await;
    let locks = ChainLocks::new();
    let job = MergeJob {
        chain: Chain::from_root(vec!["/d/base.vhd".to_string(), "/d/child.vhd".to_string()])
            .unwrap(),
        remove: false,
        merge: true,
    };

    let (a, b) = tokio::join!(
        merge_chain(&handler, &job, &locks, MergeOptions::default()),
        merge_chain(&handler, &job, &locks, MergeOptions::default()),
    );
    let resumed: Vec<Option<u32>> = [a.unwrap(), b.unwrap()]
        .into_iter()
        .map(|outcome| outcome.summary.unwrap().resumed_at)
        .collect();
    // The second merge only starts once the first one saved its final state.
    assert!(resumed.contains(&None));
    assert!(resumed.contains(&Some(6)));
    assert_eq!(read_flat(&handler, "/d/child.vhd").await, expected);
}
