#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod core;
mod engine;
mod error;
mod executor;
mod future;
mod goal;
mod group;
mod listener;
mod store;
mod work;

pub use crate::cache::{Cacher, DataNode};
pub use crate::core::{Dynamic, Identity};
pub use crate::engine::{ComputeGoal, GoalContext};
pub use crate::error::{ExecutorError, GoalError, StoreError};
pub use crate::executor::Executor;
pub use crate::future::{GoalFuture, Outcome};
pub use crate::goal::{Goal, GoalBuilder, GoalHandle, SharedGoal};
pub use crate::group::GoalGroup;
pub use crate::listener::{GoalListener, Listeners};
pub use crate::store::{FileStore, MemoryStore, Store, TieredStore};
pub use crate::work::{Progress, WorkNode, WorkTree};

/// Installs a `tracing` subscriber reading the `RUST_LOG` filter from the
/// environment. Convenience for binaries embedding the library; call at
/// most once.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*, registry};

    registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();
}
