//! An immutable snapshot of a dirent's metadata at one scan.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "version")]
pub struct Model {
	#[sea_orm(primary_key)]
	pub id: i64,
	pub dirent_id: i64,
	pub is_delmarker: bool,
	pub is_hardlink: bool,
	pub name: String,
	pub size: i64,
	pub ctime: i64,
	pub mtime: i64,
	pub atime: i64,
	pub permission: i64,
	pub uid: i64,
	pub gid: i64,
	pub link_path: Option<String>,
	/// Base64-encoded length-prefixed xattr records; see `xattr_codec`.
	pub xattr: String,
	pub scan_counter: i64,
	/// Points at the parent *directory's version row*; `-1` for the
	/// synthetic root.
	pub parent_id: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(
		belongs_to = "super::dirent::Entity",
		from = "Column::DirentId",
		to = "super::dirent::Column::Id"
	)]
	Dirent,
	#[sea_orm(has_many = "super::ver_object::Entity")]
	VerObject,
}

impl Related<super::dirent::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::Dirent.def()
	}
}

impl Related<super::ver_object::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::VerObject.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}

/// Synthetic parent_id for the root of a tree.
pub const ROOT_PARENT_ID: i64 = -1;
