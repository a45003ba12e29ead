//! CLI commands implementation

pub mod evict;
pub mod files;
pub mod init;
pub mod jobs;
pub mod status;

pub use evict::*;
pub use files::*;
pub use init::*;
pub use jobs::*;
pub use status::*;
