pub mod restore;
pub mod scan;
pub mod upload;

pub use restore::RestoreEngine;
pub use scan::ScanEngine;
pub use upload::{UploadJob, UploadScheduler};
