//! The two stages that run privileged external tools: building the image
//! and flashing it onto the board.

pub mod build;
pub mod download;

pub use build::{build, BuildRequest};
pub use download::{download, DownloadRequest};
