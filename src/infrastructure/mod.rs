//! External-system collaborators: the metadata store (C2) and the object
//! store gateway (C1). Everything else in the crate depends on these two
//! modules' contracts, never on `sea_orm`/`aws_sdk_s3` directly.

pub mod database;
pub mod gateway;
