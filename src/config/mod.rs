//! Configuration types and loading.
//!
//! Provides all configuration structures for parley:
//! - `ParleyConfig`: Top-level configuration with validation
//! - Section configs: log, lock, invoker, runtime, agents

mod settings;

pub use settings::{
    AgentsConfig, BASE_DIR_ENV, InvokerConfig, LockConfig, LogConfig, ParleyConfig, RuntimeConfig,
};
