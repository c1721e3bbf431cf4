//! kmirror sync: the watch-synchronization engine.
//!
//! `ClusterMirror` owns the store and runs rounds forever. Each round runs one
//! `WatchSession` per registration (list, then watch from the listed version)
//! and coordinates them so the callback only ever sees a store in which every
//! registered kind has been fully listed. When any session's watch expires the
//! whole round is torn down and every kind is relisted.

#![forbid(unsafe_code)]

mod config;
mod mirror;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
mod round;
mod session;

pub use config::MirrorConfig;
pub use kmirror_store::{MirrorHandle, Snapshot};
pub use mirror::ClusterMirror;
pub use round::Callback;
