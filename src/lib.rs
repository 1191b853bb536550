pub mod common;
pub mod downloader;
pub mod engine;
pub mod session;
