//! Incremental, content-addressed backup engine for S3-compatible object
//! stores.
//!
//! The crate is organised around the components in `SPEC_FULL.md` §2:
//! the scan/backup pipeline (`operations::scan`, `operations::upload`), the
//! metadata model (`infrastructure::database`), the restore engine
//! (`operations::restore`), and the run coordinator (`coordinator`) that
//! ties them together behind the CLI surface in `src/bin/main.rs`.

pub mod arbiter;
pub mod chunker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fsmeta;
pub mod infrastructure;
pub mod operations;
pub mod xattr_codec;

pub use config::Config;
pub use coordinator::{RunCoordinator, RunMode};
pub use error::{Error, Result};
