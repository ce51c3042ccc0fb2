//! Walks the filesystem, writes dirent/version rows, enqueues uploads (C5).
//!
//! Recursion is plain `tokio::spawn`, not the upload scheduler's bounded
//! worker pool: a directory's task waits on its children's handles before
//! returning, and awaiting those handles inside a fixed-size worker pool
//! would starve it once every worker is blocked on a child that can never
//! get a free worker to run on. The `db_max` bound instead gates the
//! metadata-transaction critical section of each entry via a semaphore,
//! which cannot deadlock the same way.

use std::{path::PathBuf, sync::Arc};

use futures::future::BoxFuture;
use futures_concurrency::future::Join;
use tokio::sync::Semaphore;
use tokio_stream::{wrappers::ReadDirStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
	chunker,
	error::{Error, Result},
	fsmeta::{self, Stat},
	infrastructure::database::{self, entities::version, DirentKind, EntryStat, MetadataStore},
	operations::upload::{UploadJob, UploadScheduler},
	xattr_codec,
};

pub struct ScanEngine {
	store: Arc<MetadataStore>,
	upload_scheduler: UploadScheduler,
	db_max: usize,
	chunk_size: u64,
	buffer_size: usize,
	cancel: CancellationToken,
}

impl ScanEngine {
	pub fn new(
		store: Arc<MetadataStore>,
		upload_scheduler: UploadScheduler,
		db_max: usize,
		chunk_size: u64,
		buffer_size: usize,
		cancel: CancellationToken,
	) -> Self {
		Self {
			store,
			upload_scheduler,
			db_max,
			chunk_size,
			buffer_size,
			cancel,
		}
	}

	/// Runs one full scan of `root_dir`, returning the new scan generation.
	pub async fn scan(&self, root_dir: PathBuf) -> Result<i64> {
		let fsid = fsmeta::filesystem_id(&root_dir)?;
		let scan_counter = self.store.begin_scan(&root_dir.to_string_lossy()).await?;

		let ctx = ScanContext {
			store: self.store.clone(),
			upload_scheduler: self.upload_scheduler.clone(),
			db_gate: Arc::new(Semaphore::new(self.db_max.max(1))),
			chunk_size: self.chunk_size,
			buffer_size: self.buffer_size,
			fsid,
			scan_counter,
			cancel: self.cancel.clone(),
		};

		process_dir(ctx, root_dir, version::ROOT_PARENT_ID).await?;

		if self.cancel.is_cancelled() {
			warn!(scan_counter, "scan cancelled, skipping deletion detection");
		} else {
			self.store.mark_deletions(scan_counter).await?;
		}

		Ok(scan_counter)
	}
}

#[derive(Clone)]
struct ScanContext {
	store: Arc<MetadataStore>,
	upload_scheduler: UploadScheduler,
	db_gate: Arc<Semaphore>,
	chunk_size: u64,
	buffer_size: usize,
	fsid: i64,
	scan_counter: i64,
	cancel: CancellationToken,
}

fn entry_stat(path: &std::path::Path, stat: &Stat, link_path: Option<String>) -> Result<EntryStat> {
	let name = path
		.file_name()
		.map(|n| n.to_string_lossy().into_owned())
		.unwrap_or_default();
	let xattrs = fsmeta::list_xattrs(path)?;
	Ok(EntryStat {
		name,
		size: stat.size,
		ctime: stat.ctime,
		mtime: stat.mtime,
		atime: stat.atime,
		permission: stat.permission,
		uid: stat.uid,
		gid: stat.gid,
		link_path,
		xattr: xattr_codec::encode(&xattrs),
	})
}

fn process_dir(ctx: ScanContext, path: PathBuf, parent_version_id: i64) -> BoxFuture<'static, Result<()>> {
	Box::pin(async move {
		if ctx.cancel.is_cancelled() {
			return Ok(());
		}

		let version_id = {
			let _permit = ctx.db_gate.acquire().await.expect("db gate never closed");
			let stat = fsmeta::lstat(&path)?;
			let txn = ctx.store.begin_entry_txn().await?;
			let (dirent_id, is_hardlink) =
				database::upsert_dirent(&txn, ctx.fsid, stat.inode, DirentKind::Directory, ctx.scan_counter).await?;

			if is_hardlink {
				let stat_row = entry_stat(&path, &stat, None)?;
				database::insert_version(&txn, dirent_id, parent_version_id, ctx.scan_counter, &stat_row, false, true)
					.await?;
				database::set_hardlink_flag(&txn, dirent_id).await?;
				txn.commit().await?;
				debug!(path = %path.display(), "directory seen twice this scan, treated as bind-mount hard link");
				return Ok(());
			}

			let latest = database::latest_version(&txn, dirent_id).await?;
			let unchanged = latest
				.as_ref()
				.map(|prev| prev.ctime == stat.ctime && prev.mtime == stat.mtime)
				.unwrap_or(false);

			let version_id = if unchanged {
				txn.commit().await?;
				latest.expect("unchanged implies a prior version exists").id
			} else {
				let stat_row = entry_stat(&path, &stat, None)?;
				let version_id =
					database::insert_version(&txn, dirent_id, parent_version_id, ctx.scan_counter, &stat_row, false, false)
						.await?;
				txn.commit().await?;
				version_id
			};
			version_id
		};

		let mut read_dir_stream = ReadDirStream::new(tokio::fs::read_dir(&path).await?);
		let mut entries = Vec::new();
		while let Some(entry) = read_dir_stream.next().await {
			entries.push(entry?.path());
		}

		// Children are independent directory entries, so their `lstat`s go out
		// concurrently rather than one at a time before any task is spawned.
		let stats = entries
			.iter()
			.map(|child_path| async move { (child_path.clone(), tokio::fs::symlink_metadata(child_path).await) })
			.collect::<Vec<_>>()
			.join()
			.await;

		let mut handles = Vec::new();
		for (child_path, meta) in stats {
			if ctx.cancel.is_cancelled() {
				break;
			}
			let meta = match meta {
				Ok(meta) => meta,
				Err(err) => {
					warn!(path = %child_path.display(), %err, "entry vanished between listing and stat, skipping");
					continue;
				}
			};

			let child_ctx = ctx.clone();
			if meta.is_dir() {
				handles.push(tokio::spawn(process_dir(child_ctx, child_path, version_id)));
			} else if meta.is_file() || meta.file_type().is_symlink() {
				handles.push(tokio::spawn(process_file(child_ctx, child_path, version_id)));
			}
			// device files, sockets, fifos: "other", skipped per the walk's classification rule
		}

		for handle in handles {
			handle
				.await
				.map_err(|err| Error::logic_violation(format!("scan task panicked: {err}")))??;
		}

		Ok(())
	})
}

fn process_file(ctx: ScanContext, path: PathBuf, parent_version_id: i64) -> BoxFuture<'static, Result<()>> {
	Box::pin(async move {
		if ctx.cancel.is_cancelled() {
			return Ok(());
		}

		let _permit = ctx.db_gate.acquire().await.expect("db gate never closed");
		let stat = fsmeta::lstat(&path)?;

		if stat.kind == DirentKind::Symlink {
			let link_target = fsmeta::read_link(&path)?;
			let txn = ctx.store.begin_entry_txn().await?;
			let (dirent_id, is_hardlink) =
				database::upsert_dirent(&txn, ctx.fsid, stat.inode, DirentKind::Symlink, ctx.scan_counter).await?;
			let stat_row = entry_stat(&path, &stat, Some(link_target))?;
			database::insert_version(&txn, dirent_id, parent_version_id, ctx.scan_counter, &stat_row, false, is_hardlink)
				.await?;
			if is_hardlink {
				database::set_hardlink_flag(&txn, dirent_id).await?;
			}
			txn.commit().await?;
			return Ok(());
		}

		let txn = ctx.store.begin_entry_txn().await?;
		let (dirent_id, is_hardlink) =
			database::upsert_dirent(&txn, ctx.fsid, stat.inode, DirentKind::File, ctx.scan_counter).await?;
		let latest = database::latest_version(&txn, dirent_id).await?;

		let (metadata_changed, contents_changed) = match &latest {
			None => (true, true),
			Some(prev) => {
				let ctime_changed = prev.ctime != stat.ctime;
				let mtime_changed = prev.mtime != stat.mtime;
				(ctime_changed || mtime_changed, mtime_changed)
			}
		};

		let version_id = if metadata_changed || is_hardlink {
			let stat_row = entry_stat(&path, &stat, None)?;
			Some(
				database::insert_version(
					&txn,
					dirent_id,
					parent_version_id,
					ctx.scan_counter,
					&stat_row,
					false,
					is_hardlink,
				)
				.await?,
			)
		} else {
			None
		};
		if is_hardlink {
			database::set_hardlink_flag(&txn, dirent_id).await?;
		}
		txn.commit().await?;
		drop(_permit);

		if !contents_changed || is_hardlink {
			return Ok(());
		}
		let version_id = version_id.expect("contents_changed implies a version was just inserted");

		let file = tokio::fs::File::open(&path).await?;
		let chunks = chunker::chunk_file(file, ctx.chunk_size, ctx.buffer_size).await?;
		let single_small_chunk = chunks.len() == 1 && chunks[0].size <= ctx.buffer_size as u64;

		let mut upload_handles = Vec::new();
		for chunk in &chunks {
			let already_present = {
				let txn = ctx.store.begin_entry_txn().await?;
				let already_present = database::record_chunk(&txn, version_id, &chunk.object_hash).await?;
				txn.commit().await?;
				already_present
			};

			if !already_present && chunk.size > 0 {
				let tail_bytes_if_small = single_small_chunk.then(|| chunk.tail_bytes.clone());
				upload_handles.push(
					ctx.upload_scheduler
						.submit(UploadJob {
							path: path.clone(),
							chunk_index: chunk.chunk_index,
							object_hash: chunk.object_hash.clone(),
							size: chunk.size,
							tail_bytes_if_small,
						})
						.await?,
				);
			}
		}

		// Uploads for this file's chunks run concurrently against the shared
		// s3_pool_size-bounded worker pool; this task only blocks on its own
		// chunks, never on siblings, so a slow/failed upload can't stall the
		// rest of the scan. A failure here is fatal for this file only, per
		// the upload scheduler's failure policy.
		for handle in upload_handles {
			handle
				.join()
				.await
				.map_err(Error::from)?
				.map_err(|err| Error::fatal_per_task(path.clone(), err))?;
		}

		Ok(())
	})
}
