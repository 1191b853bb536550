pub mod client;
pub mod error;
pub mod models;

pub use client::{DEFAULT_API_BASE, ShareClient};
pub use error::ApiError;
