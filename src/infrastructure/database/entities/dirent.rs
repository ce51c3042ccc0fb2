//! One row per `(fsid, inode)` observed across all scans.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "dirent")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i64,
	/// Filesystem id from `statvfs(root_dir)`, constant across an entire scan.
	pub fsid: i64,
	pub inode: i64,
	pub kind: i32,
	pub is_deleted: bool,
	/// Counter of the most recent scan that observed this inode.
	pub scan_counter: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(has_many = "super::version::Entity")]
	Version,
}

impl Related<super::version::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::Version.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirentKind {
	File = 0,
	Directory = 1,
	Symlink = 2,
}

impl From<i32> for DirentKind {
	fn from(value: i32) -> Self {
		match value {
			0 => DirentKind::File,
			1 => DirentKind::Directory,
			2 => DirentKind::Symlink,
			_ => DirentKind::File,
		}
	}
}

impl From<DirentKind> for i32 {
	fn from(kind: DirentKind) -> Self {
		kind as i32
	}
}

impl Model {
	pub fn dirent_kind(&self) -> DirentKind {
		DirentKind::from(self.kind)
	}
}
