pub mod backoff;
pub mod cache;
pub mod cleanup;
pub mod coordinator;
pub mod error;
pub mod jobs;
pub mod locks;
pub mod paths;
pub mod snapshot;
pub mod transfer;
pub mod upload_watcher;

#[cfg(test)]
pub(crate) mod fake;
