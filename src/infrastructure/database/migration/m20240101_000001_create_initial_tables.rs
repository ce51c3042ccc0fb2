//! Creates `dirent`, `version`, `ver_object`, `scan`.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(Dirent::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(Dirent::Id)
							.big_integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(Dirent::Fsid).big_integer().not_null())
					.col(ColumnDef::new(Dirent::Inode).big_integer().not_null())
					.col(ColumnDef::new(Dirent::Kind).integer().not_null())
					.col(
						ColumnDef::new(Dirent::IsDeleted)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(ColumnDef::new(Dirent::ScanCounter).big_integer().not_null())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_dirent_fsid_inode")
					.table(Dirent::Table)
					.col(Dirent::Fsid)
					.col(Dirent::Inode)
					.unique()
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(Version::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(Version::Id)
							.big_integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(Version::DirentId).big_integer().not_null())
					.col(
						ColumnDef::new(Version::IsDelmarker)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(
						ColumnDef::new(Version::IsHardlink)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(ColumnDef::new(Version::Name).string().not_null())
					.col(ColumnDef::new(Version::Size).big_integer().not_null())
					.col(ColumnDef::new(Version::Ctime).big_integer().not_null())
					.col(ColumnDef::new(Version::Mtime).big_integer().not_null())
					.col(ColumnDef::new(Version::Atime).big_integer().not_null())
					.col(ColumnDef::new(Version::Permission).big_integer().not_null())
					.col(ColumnDef::new(Version::Uid).big_integer().not_null())
					.col(ColumnDef::new(Version::Gid).big_integer().not_null())
					.col(ColumnDef::new(Version::LinkPath).string())
					.col(
						ColumnDef::new(Version::Xattr)
							.text()
							.not_null()
							.default(""),
					)
					.col(ColumnDef::new(Version::ScanCounter).big_integer().not_null())
					.col(ColumnDef::new(Version::ParentId).big_integer().not_null())
					.foreign_key(
						ForeignKey::create()
							.name("fk_version_dirent")
							.from(Version::Table, Version::DirentId)
							.to(Dirent::Table, Dirent::Id),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_version_dirent_id")
					.table(Version::Table)
					.col(Version::DirentId)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_version_parent_name")
					.table(Version::Table)
					.col(Version::ParentId)
					.col(Version::Name)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(VerObject::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(VerObject::Id)
							.big_integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(VerObject::VerId).big_integer().not_null())
					.col(ColumnDef::new(VerObject::ObjectHash).string().not_null())
					.foreign_key(
						ForeignKey::create()
							.name("fk_ver_object_version")
							.from(VerObject::Table, VerObject::VerId)
							.to(Version::Table, Version::Id),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_ver_object_ver_id")
					.table(VerObject::Table)
					.col(VerObject::VerId)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_ver_object_hash")
					.table(VerObject::Table)
					.col(VerObject::ObjectHash)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(Scan::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(Scan::ScanCounter)
							.big_integer()
							.not_null()
							.primary_key(),
					)
					.col(
						ColumnDef::new(Scan::StartTime)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(Scan::RootDir).string().not_null())
					.to_owned(),
			)
			.await?;

		Ok(())
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(VerObject::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Version::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Dirent::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(Scan::Table).to_owned())
			.await?;
		Ok(())
	}
}

#[derive(DeriveIden)]
enum Dirent {
	Table,
	Id,
	Fsid,
	Inode,
	Kind,
	IsDeleted,
	ScanCounter,
}

#[derive(DeriveIden)]
enum Version {
	Table,
	Id,
	DirentId,
	IsDelmarker,
	IsHardlink,
	Name,
	Size,
	Ctime,
	Mtime,
	Atime,
	Permission,
	Uid,
	Gid,
	LinkPath,
	Xattr,
	ScanCounter,
	ParentId,
}

#[derive(DeriveIden)]
enum VerObject {
	Table,
	Id,
	VerId,
	ObjectHash,
}

#[derive(DeriveIden)]
enum Scan {
	Table,
	ScanCounter,
	StartTime,
	RootDir,
}
