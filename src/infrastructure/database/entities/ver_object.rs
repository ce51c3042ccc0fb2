//! Ordered list of content-chunk hashes composing a version's content.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ver_object")]
pub struct Model {
	/// Doubles as the within-file chunk order key; rows for one version MUST
	/// be read back sorted ascending by this column.
	#[sea_orm(primary_key)]
	pub id: i64,
	pub ver_id: i64,
	pub object_hash: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
	#[sea_orm(
		belongs_to = "super::version::Entity",
		from = "Column::VerId",
		to = "super::version::Column::Id"
	)]
	Version,
}

impl Related<super::version::Entity> for Entity {
	fn to() -> RelationDef {
		Relation::Version.def()
	}
}

impl ActiveModelBehavior for ActiveModel {}
