//! Resolves `path@generation`, reconstructs the tree, replays attributes and
//! hard links (C7).

use std::{
	collections::HashMap,
	path::{Path, PathBuf},
	sync::Arc,
};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::debug;

use crate::{
	arbiter::LargeBufferArbiter,
	error::{Error, Result},
	fsmeta,
	infrastructure::{
		database::{entities::version, ChildRow, DirentKind, MetadataStore},
		gateway::ObjectStore,
	},
};

/// Publishes the path the first sibling of a hard-link set was restored to,
/// so later siblings can link to it instead of re-materialising content.
/// Waiting is cooperative (`Notify`), never a spin loop.
#[derive(Default)]
struct HardlinkRegistry {
	published: Mutex<HashMap<(i64, i64), PathBuf>>,
	notify: Notify,
}

impl HardlinkRegistry {
	/// Returns `Some(path)` once the `(fsid, inode)`'s first sibling has
	/// published its restored path; the caller awaits this before the
	/// first restorer has published anything.
	async fn wait_for(&self, key: (i64, i64)) -> PathBuf {
		loop {
			if let Some(path) = self.published.lock().await.get(&key).cloned() {
				return path;
			}
			self.notify.notified().await;
		}
	}

	async fn publish(&self, key: (i64, i64), path: PathBuf) {
		self.published.lock().await.insert(key, path);
		self.notify.notify_waiters();
	}
}

pub struct RestoreEngine {
	store: Arc<MetadataStore>,
	gateway: Arc<dyn ObjectStore>,
	arbiter: LargeBufferArbiter,
	restore_max: usize,
	chunk_size: u64,
}

impl RestoreEngine {
	pub fn new(
		store: Arc<MetadataStore>,
		gateway: Arc<dyn ObjectStore>,
		arbiter: LargeBufferArbiter,
		restore_max: usize,
		chunk_size: u64,
	) -> Self {
		Self {
			store,
			gateway,
			arbiter,
			restore_max,
			chunk_size,
		}
	}

	/// Restores `restore_target` ("all" or an absolute path under the
	/// configured root) into `restore_to` at `at_generation` (the maximum
	/// scan counter if `None`).
	pub async fn restore(&self, restore_target: &str, restore_to: &Path, at_generation: Option<i64>) -> Result<()> {
		let scans = self.store.scans().await?;
		let latest_scan = scans
			.last()
			.ok_or_else(|| Error::precondition_failed("no scans recorded, nothing to restore"))?;
		let at_generation = at_generation.unwrap_or(latest_scan.scan_counter);

		let relative = if restore_target == "all" {
			String::new()
		} else {
			restore_target
				.strip_prefix(&latest_scan.root_dir)
				.map(|s| s.trim_start_matches('/').to_string())
				.ok_or_else(|| {
					Error::precondition_failed(format!(
						"restore target {restore_target} is not under backed-up root {}",
						latest_scan.root_dir
					))
				})?
		};

		let components: Vec<String> = relative
			.split('/')
			.filter(|segment| !segment.is_empty())
			.map(str::to_owned)
			.collect();

		let (dirent_id, version_id, kind) = self
			.store
			.resolve_path(&components, at_generation)
			.await?
			.ok_or_else(|| Error::precondition_failed(format!("{restore_target} not found at generation {at_generation}")))?;

		let ctx = RestoreContext {
			store: self.store.clone(),
			gateway: self.gateway.clone(),
			arbiter: self.arbiter.clone(),
			hardlinks: Arc::new(HardlinkRegistry::default()),
			restore_gate: Arc::new(Semaphore::new(self.restore_max.max(1))),
			chunk_size: self.chunk_size,
			at_generation,
		};

		restore_obj(ctx, restore_to.to_path_buf(), dirent_id, version_id, kind).await
	}
}

#[derive(Clone)]
struct RestoreContext {
	store: Arc<MetadataStore>,
	gateway: Arc<dyn ObjectStore>,
	arbiter: LargeBufferArbiter,
	hardlinks: Arc<HardlinkRegistry>,
	restore_gate: Arc<Semaphore>,
	chunk_size: u64,
	at_generation: i64,
}

fn restore_obj(
	ctx: RestoreContext,
	target_path: PathBuf,
	dirent_id: i64,
	version_id: i64,
	kind: DirentKind,
) -> BoxFuture<'static, Result<()>> {
	Box::pin(async move {
		let version_row = version_row(&ctx.store, version_id).await?;

		if version_row.is_hardlink {
			restore_hardlink(&ctx, &target_path, dirent_id, version_id, &version_row).await?;
			return replay_attributes(&target_path, &version_row).await;
		}

		match kind {
			DirentKind::File => restore_file(&ctx, &target_path, version_id).await?,
			DirentKind::Directory => restore_directory(&target_path, &version_row).await?,
			DirentKind::Symlink => restore_symlink(&target_path, &version_row).await?,
		}

		if kind != DirentKind::Symlink {
			replay_attributes(&target_path, &version_row).await?;
		}

		if kind == DirentKind::Directory {
			restore_children(ctx, target_path, version_id).await?;
		}

		Ok(())
	})
}

async fn version_row(store: &MetadataStore, version_id: i64) -> Result<version::Model> {
	use sea_orm::EntityTrait;
	version::Entity::find_by_id(version_id)
		.one(store.conn())
		.await?
		.ok_or_else(|| Error::logic_violation(format!("version {version_id} referenced but missing")))
}

/// Finds the version of a hard-linked dirent whose `ver_object` rows
/// actually carry content: chunks are recorded only against the version
/// current when the first-scanned sibling was uploaded (scan.rs), not
/// against later siblings' promoted-to-hardlink versions, which have none.
/// Directories/symlinks never have chunk rows at all, so this falls back to
/// the earliest version (the first sibling seen) for those kinds.
async fn hardlink_content_version(ctx: &RestoreContext, dirent_id: i64) -> Result<i64> {
	use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};

	let versions = version::Entity::find()
		.filter(version::Column::DirentId.eq(dirent_id))
		.order_by_asc(version::Column::Id)
		.all(ctx.store.conn())
		.await?;

	for candidate in &versions {
		if !ctx.store.chunks_of(candidate.id).await?.is_empty() {
			return Ok(candidate.id);
		}
	}

	versions
		.first()
		.map(|v| v.id)
		.ok_or_else(|| Error::logic_violation("hardlink dirent has no versions"))
}

async fn restore_hardlink(
	ctx: &RestoreContext,
	target_path: &Path,
	dirent_id: i64,
	_version_id: i64,
	_version_row: &version::Model,
) -> Result<()> {
	// The dirent's `(fsid, inode)` isn't carried on the version row, but the
	// dirent id alone is already unique per inode within this store, so it
	// doubles as the registry key.
	let key = (dirent_id, 0i64);

	let mut registered = false;
	{
		let mut published = ctx.hardlinks.published.lock().await;
		if !published.contains_key(&key) {
			published.insert(key, target_path.to_path_buf());
			registered = true;
		}
	}

	if registered {
		if let Some(parent) = target_path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		// First sibling: materialise real content under its own path, then
		// the placeholder we just inserted becomes the real target other
		// siblings link to. The dirent's *latest* version is whichever
		// sibling was promoted to `is_hardlink` last and carries no
		// `ver_object` rows of its own. Content must be read from the
		// version that was current when the first sibling was scanned and
		// uploaded instead.
		let source_version_id = hardlink_content_version(ctx, dirent_id).await?;
		restore_file(ctx, target_path, source_version_id).await?;
		ctx.hardlinks.publish(key, target_path.to_path_buf()).await;
		return Ok(());
	}

	let first_path = ctx.hardlinks.wait_for(key).await;
	if let Some(parent) = target_path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	if target_path.symlink_metadata().is_ok() {
		tokio::fs::remove_file(target_path).await.ok();
	}
	tokio::fs::hard_link(&first_path, target_path).await?;
	Ok(())
}

async fn restore_file(ctx: &RestoreContext, target_path: &Path, version_id: i64) -> Result<()> {
	if let Some(parent) = target_path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	let hashes = ctx.store.chunks_of(version_id).await?;
	let mut file = tokio::fs::File::create(target_path).await?;
	use tokio::io::AsyncWriteExt;

	// `ver_object` records a chunk's hash but not its size, so the only way
	// to know whether a chunk is "large" (>= chunk_size/16, spec.md §4.7) is
	// to have already downloaded it. Gating every download behind the large-
	// buffer arbiter is the conservative reading: it still bounds peak
	// resident chunk bytes across concurrently-restoring files to
	// `lb_max * chunk_size`, at the cost of serialising small-chunk restores
	// that didn't strictly need to wait.
	for hash in hashes {
		let _permit = ctx.arbiter.acquire().await;
		let bytes = ctx.gateway.get_bytes(&hash).await?;
		file.write_all(&bytes).await?;
	}
	Ok(())
}

async fn restore_directory(target_path: &Path, version_row: &version::Model) -> Result<()> {
	match tokio::fs::create_dir(target_path).await {
		Ok(()) => Ok(()),
		Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
		Err(err) => Err(Error::from(err)),
	}?;
	fsmeta::chmod(target_path, version_row.permission)
}

async fn restore_symlink(target_path: &Path, version_row: &version::Model) -> Result<()> {
	let link_path = version_row
		.link_path
		.as_deref()
		.ok_or_else(|| Error::logic_violation("symlink version missing link_path"))?;
	if target_path.exists() || target_path.symlink_metadata().is_ok() {
		tokio::fs::remove_file(target_path).await.ok();
	}
	tokio::fs::symlink(link_path, target_path).await?;
	Ok(())
}

async fn replay_attributes(target_path: &Path, version_row: &version::Model) -> Result<()> {
	fsmeta::chmod(target_path, version_row.permission)?;
	fsmeta::lchown(target_path, version_row.uid, version_row.gid)?;
	fsmeta::set_times(target_path, version_row.mtime, version_row.atime)?;
	let xattrs = crate::xattr_codec::decode(&version_row.xattr)?;
	fsmeta::set_xattrs(target_path, &xattrs)?;
	Ok(())
}

async fn restore_children(ctx: RestoreContext, target_path: PathBuf, parent_version_id: i64) -> Result<()> {
	let children: Vec<ChildRow> = ctx
		.store
		.children(parent_version_id, ctx.at_generation)
		.await?
		.into_iter()
		.filter(|c| !c.is_delmarker)
		.collect();

	let mut handles = Vec::new();
	for child in children {
		let _permit = ctx.restore_gate.clone().acquire_owned().await.expect("restore gate never closed");
		let child_path = target_path.join(&child.name);
		let ctx = ctx.clone();
		handles.push(tokio::spawn(async move {
			let _permit = _permit;
			restore_obj(ctx, child_path, child.dirent_id, child.version_id, child.kind).await
		}));
	}

	for handle in handles {
		handle
			.await
			.map_err(|err| Error::logic_violation(format!("restore task panicked: {err}")))??;
	}

	debug!(path = %target_path.display(), "directory restore dispatched children");
	Ok(())
}
