//! Metadata store: schema owner for `dirent`/`version`/`ver_object`/`scan`.
//!
//! Every operation below is a thin, transaction-aware wrapper matching one
//! of the metadata store's documented primitives. `upsert_dirent` and
//! `insert_version` are generic over [`ConnectionTrait`] so a caller can run
//! both inside one [`DatabaseTransaction`] — the scan engine's per-entry
//! unit of work must commit or roll back atomically.

pub mod entities;
pub mod migration;

use std::{collections::HashMap, path::Path, time::Duration};

use chrono::Utc;
use sea_orm::{
	ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectOptions, ConnectionTrait,
	Database as SeaDatabase, DatabaseConnection, DatabaseTransaction, EntityTrait, QueryFilter,
	QueryOrder, Statement, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use tracing::info;

pub use entities::dirent::DirentKind;
use entities::{dirent, scan, ver_object, version};

/// Metadata snapshotted for one `insert_version` call.
#[derive(Debug, Clone)]
pub struct EntryStat {
	pub name: String,
	pub size: i64,
	pub ctime: i64,
	pub mtime: i64,
	pub atime: i64,
	pub permission: i64,
	pub uid: i64,
	pub gid: i64,
	pub link_path: Option<String>,
	/// Base64 encoding produced by [`crate::xattr_codec::encode`].
	pub xattr: String,
}

/// One row of `children(...)`.
#[derive(Debug, Clone)]
pub struct ChildRow {
	pub dirent_id: i64,
	pub version_id: i64,
	pub name: String,
	pub parent_id: i64,
	pub kind: DirentKind,
	pub is_delmarker: bool,
}

pub struct MetadataStore {
	conn: DatabaseConnection,
}

impl MetadataStore {
	pub async fn open(path: &Path) -> crate::error::Result<Self> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let db_url = format!("sqlite://{}?mode=rwc", path.display());
		let mut opt = ConnectOptions::new(db_url);
		opt.max_connections(10)
			.min_connections(1)
			.connect_timeout(Duration::from_secs(8))
			.sqlx_logging(false);

		let conn = SeaDatabase::connect(opt).await?;
		for pragma in [
			"PRAGMA journal_mode=WAL",
			"PRAGMA synchronous=NORMAL",
			"PRAGMA foreign_keys=ON",
		] {
			conn.execute(Statement::from_string(sea_orm::DatabaseBackend::Sqlite, pragma))
				.await?;
		}
		info!(path = %path.display(), "opened metadata store");
		Ok(Self { conn })
	}

	pub async fn migrate(&self) -> crate::error::Result<()> {
		migration::Migrator::up(&self.conn, None).await?;
		Ok(())
	}

	pub fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}

	/// Opens a unit-of-work transaction for one filesystem entry. The caller
	/// (the scan engine) MUST commit it after `upsert_dirent` +
	/// `insert_version` + any related updates succeed, or drop it to roll
	/// back on an error.
	pub async fn begin_entry_txn(&self) -> crate::error::Result<DatabaseTransaction> {
		Ok(self.conn.begin().await?)
	}

	/// Reads `MAX(scan_counter)` from `dirent`, adds 1, inserts a `scan` row.
	pub async fn begin_scan(&self, root_dir: &str) -> crate::error::Result<i64> {
		let txn = self.conn.begin().await?;

		let highest = dirent::Entity::find()
			.order_by_desc(dirent::Column::ScanCounter)
			.one(&txn)
			.await?;
		let scan_counter = highest.map(|d| d.scan_counter + 1).unwrap_or(1);

		let row = scan::ActiveModel {
			scan_counter: Set(scan_counter),
			start_time: Set(Utc::now()),
			root_dir: Set(root_dir.to_string()),
		};
		row.insert(&txn).await?;
		txn.commit().await?;
		Ok(scan_counter)
	}

	pub async fn scans(&self) -> crate::error::Result<Vec<scan::Model>> {
		Ok(scan::Entity::find()
			.order_by_asc(scan::Column::ScanCounter)
			.all(&self.conn)
			.await?)
	}

	pub async fn mark_deletions(&self, scan_counter: i64) -> crate::error::Result<()> {
		let txn = self.conn.begin().await?;

		let stale = dirent::Entity::find()
			.filter(dirent::Column::ScanCounter.lt(scan_counter))
			.filter(dirent::Column::IsDeleted.eq(false))
			.all(&txn)
			.await?;

		for stale_dirent in stale {
			let dirent_id = stale_dirent.id;
			let mut active: dirent::ActiveModel = stale_dirent.into();
			active.is_deleted = Set(true);
			active.update(&txn).await?;

			if let Some(latest) = latest_version(&txn, dirent_id).await? {
				if !latest.is_delmarker {
					let tombstone = version::ActiveModel {
						dirent_id: Set(dirent_id),
						is_delmarker: Set(true),
						is_hardlink: Set(false),
						name: Set(latest.name),
						size: Set(0),
						ctime: Set(latest.ctime),
						mtime: Set(latest.mtime),
						atime: Set(latest.atime),
						permission: Set(latest.permission),
						uid: Set(latest.uid),
						gid: Set(latest.gid),
						link_path: Set(None),
						xattr: Set(String::new()),
						scan_counter: Set(scan_counter),
						parent_id: Set(latest.parent_id),
						..Default::default()
					};
					tombstone.insert(&txn).await?;
				}
			}
		}

		txn.commit().await?;
		Ok(())
	}

	pub async fn resolve_path(
		&self,
		root_components: &[String],
		at_generation: i64,
	) -> crate::error::Result<Option<(i64, i64, DirentKind)>> {
		resolve_path(&self.conn, root_components, at_generation).await
	}

	pub async fn children(&self, parent_version_id: i64, at_generation: i64) -> crate::error::Result<Vec<ChildRow>> {
		children(&self.conn, parent_version_id, at_generation).await
	}

	pub async fn chunks_of(&self, version_id: i64) -> crate::error::Result<Vec<String>> {
		chunks_of(&self.conn, version_id).await
	}

	pub async fn latest_version(&self, dirent_id: i64) -> crate::error::Result<Option<version::Model>> {
		latest_version(&self.conn, dirent_id).await
	}
}

/// Selects by `(fsid, inode)`; inserts on first sighting, flags a hard link
/// when the same inode was already touched by this scan.
///
/// Two siblings sharing an inode (the hard-link case this function exists to
/// detect) can reach the insert branch concurrently, since `db_max` lets more
/// than one entry's transaction run at once. `idx_dirent_fsid_inode` is
/// unique, so the loser of that race gets a constraint violation rather than
/// a second row; it's treated the same as if `find()` had returned the
/// winner's row in the first place.
pub async fn upsert_dirent<C: ConnectionTrait>(
	conn: &C,
	fsid: i64,
	inode: i64,
	kind: DirentKind,
	scan_counter: i64,
) -> crate::error::Result<(i64, bool)> {
	let existing = dirent::Entity::find()
		.filter(dirent::Column::Fsid.eq(fsid))
		.filter(dirent::Column::Inode.eq(inode))
		.one(conn)
		.await?;

	match existing {
		None => {
			let active = dirent::ActiveModel {
				fsid: Set(fsid),
				inode: Set(inode),
				kind: Set(kind.into()),
				is_deleted: Set(false),
				scan_counter: Set(scan_counter),
				..Default::default()
			};
			match active.insert(conn).await {
				Ok(inserted) => Ok((inserted.id, false)),
				Err(err) if is_unique_violation(&err) => {
					let winner = dirent::Entity::find()
						.filter(dirent::Column::Fsid.eq(fsid))
						.filter(dirent::Column::Inode.eq(inode))
						.one(conn)
						.await?
						.ok_or_else(|| crate::error::Error::logic_violation("dirent unique violation but row missing on re-read"))?;
					Ok((winner.id, true))
				}
				Err(err) => Err(err.into()),
			}
		}
		Some(row) if row.scan_counter == scan_counter => Ok((row.id, true)),
		Some(row) => {
			let dirent_id = row.id;
			let mut active: dirent::ActiveModel = row.into();
			active.is_deleted = Set(false);
			active.scan_counter = Set(scan_counter);
			active.update(conn).await?;
			Ok((dirent_id, false))
		}
	}
}

/// SQLite's own wording for a `UNIQUE` constraint failure; sea-orm doesn't
/// expose a typed variant for it, so this is the stable signal to match on.
fn is_unique_violation(err: &sea_orm::DbErr) -> bool {
	err.to_string().contains("UNIQUE constraint failed")
}

pub async fn latest_version<C: ConnectionTrait>(
	conn: &C,
	dirent_id: i64,
) -> crate::error::Result<Option<version::Model>> {
	Ok(version::Entity::find()
		.filter(version::Column::DirentId.eq(dirent_id))
		.order_by_desc(version::Column::Id)
		.one(conn)
		.await?)
}

#[allow(clippy::too_many_arguments)]
pub async fn insert_version<C: ConnectionTrait>(
	conn: &C,
	dirent_id: i64,
	parent_version_id: i64,
	scan_counter: i64,
	stat: &EntryStat,
	is_delmarker: bool,
	is_hardlink: bool,
) -> crate::error::Result<i64> {
	let active = version::ActiveModel {
		dirent_id: Set(dirent_id),
		is_delmarker: Set(is_delmarker),
		is_hardlink: Set(is_hardlink),
		name: Set(stat.name.clone()),
		size: Set(stat.size),
		ctime: Set(stat.ctime),
		mtime: Set(stat.mtime),
		atime: Set(stat.atime),
		permission: Set(stat.permission),
		uid: Set(stat.uid),
		gid: Set(stat.gid),
		link_path: Set(stat.link_path.clone()),
		xattr: Set(stat.xattr.clone()),
		scan_counter: Set(scan_counter),
		parent_id: Set(parent_version_id),
		..Default::default()
	};
	Ok(active.insert(conn).await?.id)
}

pub async fn set_hardlink_flag<C: ConnectionTrait>(conn: &C, dirent_id: i64) -> crate::error::Result<()> {
	let versions = version::Entity::find()
		.filter(version::Column::DirentId.eq(dirent_id))
		.all(conn)
		.await?;
	for row in versions {
		let mut active: version::ActiveModel = row.into();
		active.is_hardlink = Set(true);
		active.update(conn).await?;
	}
	Ok(())
}

/// Appends to `ver_object`; the boolean is whether `object_hash` already had
/// a row anywhere in the table before this insert (the dedup signal).
pub async fn record_chunk<C: ConnectionTrait>(
	conn: &C,
	version_id: i64,
	object_hash: &str,
) -> crate::error::Result<bool> {
	let already_present = ver_object::Entity::find()
		.filter(ver_object::Column::ObjectHash.eq(object_hash))
		.one(conn)
		.await?
		.is_some();

	let active = ver_object::ActiveModel {
		ver_id: Set(version_id),
		object_hash: Set(object_hash.to_string()),
		..Default::default()
	};
	active.insert(conn).await?;

	Ok(already_present)
}

pub async fn chunks_of<C: ConnectionTrait>(conn: &C, version_id: i64) -> crate::error::Result<Vec<String>> {
	let rows = ver_object::Entity::find()
		.filter(ver_object::Column::VerId.eq(version_id))
		.order_by_asc(ver_object::Column::Id)
		.all(conn)
		.await?;
	Ok(rows.into_iter().map(|row| row.object_hash).collect())
}

/// For each distinct child name under `parent_version_id`, the most recent
/// version with `scan_counter <= at_generation`.
pub async fn children<C: ConnectionTrait>(
	conn: &C,
	parent_version_id: i64,
	at_generation: i64,
) -> crate::error::Result<Vec<ChildRow>> {
	let rows = version::Entity::find()
		.filter(version::Column::ParentId.eq(parent_version_id))
		.filter(version::Column::ScanCounter.lte(at_generation))
		.all(conn)
		.await?;

	let mut latest: HashMap<String, version::Model> = HashMap::new();
	for row in rows {
		match latest.get(&row.name) {
			Some(existing) if (existing.scan_counter, existing.id) >= (row.scan_counter, row.id) => {}
			_ => {
				latest.insert(row.name.clone(), row);
			}
		}
	}

	let dirent_ids: Vec<i64> = latest.values().map(|row| row.dirent_id).collect();
	let dirents = dirent::Entity::find()
		.filter(dirent::Column::Id.is_in(dirent_ids))
		.all(conn)
		.await?;
	let kinds: HashMap<i64, DirentKind> = dirents.into_iter().map(|d| (d.id, d.dirent_kind())).collect();

	let mut result: Vec<ChildRow> = latest
		.into_values()
		.map(|row| ChildRow {
			dirent_id: row.dirent_id,
			version_id: row.id,
			name: row.name,
			parent_id: row.parent_id,
			kind: kinds.get(&row.dirent_id).copied().unwrap_or(DirentKind::File),
			is_delmarker: row.is_delmarker,
		})
		.collect();
	result.sort_by(|a, b| b.version_id.cmp(&a.version_id));
	Ok(result)
}

/// Walks `root_components` from the synthetic root (`parent_version_id =
/// -1`), selecting the greatest `scan_counter <= at_generation` at each
/// level and skipping tombstones.
pub async fn resolve_path<C: ConnectionTrait>(
	conn: &C,
	root_components: &[String],
	at_generation: i64,
) -> crate::error::Result<Option<(i64, i64, DirentKind)>> {
	let root_candidates = children(conn, version::ROOT_PARENT_ID, at_generation).await?;
	let Some(mut current) = root_candidates.into_iter().find(|c| !c.is_delmarker) else {
		return Ok(None);
	};

	for segment in root_components {
		let kids = children(conn, current.version_id, at_generation).await?;
		match kids.into_iter().find(|c| &c.name == segment && !c.is_delmarker) {
			Some(found) => current = found,
			None => return Ok(None),
		}
	}

	Ok(Some((current.dirent_id, current.version_id, current.kind)))
}
