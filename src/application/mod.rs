//! Application services: the cache gateway, generation jobs, and the expiration watcher.

pub mod error;
pub mod gateway;
pub mod generator;
pub mod jobs;
pub mod watcher;
