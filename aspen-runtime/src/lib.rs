//! # Aspen Runtime Library
//!
//! Memory manager for the Aspen language runtime. Aspen programs build
//! large, mutable, cyclic object graphs and fork them constantly — one
//! clone per simulation particle — so the one hard requirement here is
//! that clones *look* deep while *being* lazy: nothing is copied until a
//! write proves it necessary, and a given object is cloned at most once
//! per fork.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       ASPEN RUNTIME                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────┐   ┌────────────┐   ┌────────────────────┐   │
//! │  │  Pointers  │   │  Contexts  │   │       Memo         │   │
//! │  │ shared.rs  │──▶│ context.rs │──▶│      memo.rs       │   │
//! │  │ weak.rs    │   │ (fork tree)│   │ (original → clone) │   │
//! │  │ lazy.rs    │   └────────────┘   └────────────────────┘   │
//! │  │ eager.rs   │          │                   │              │
//! │  └────────────┘          ▼                   ▼              │
//! │        │          ┌────────────┐      ┌────────────┐        │
//! │        └─────────▶│   Slots    │─────▶│ Allocation │        │
//! │                   │ object.rs  │      │  alloc.rs  │        │
//! │                   │ counted.rs │      │ (pooled)   │        │
//! │                   └────────────┘      └────────────┘        │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Slots** hold a three-count header ([`counted::Counted`]) and the
//!   boxed object; shared, weak and memo counts drive a staged release
//!   protocol ending in the owner thread's pool.
//! - **Contexts** ([`context::Context`]) form the fork tree; each owns a
//!   [`memo::Memo`] mapping originals to their images in that branch.
//! - **Pointers** are where the semantics live: [`Shared`] owns,
//!   [`Weak`] observes, [`Lazy`] clones on first write after a fork,
//!   [`Eager`] clones immediately.
//! - **Freezing** ([`freeze`]) marks a graph immutable before it is
//!   shared with a fork; writes to frozen objects divert through the
//!   copy-on-write path.
//!
//! ## Example
//!
//! ```rust,ignore
//! use aspen_runtime::{create, Lazy};
//!
//! let state = create(Particle::new());
//! let ptr = Lazy::from_shared(&state);
//!
//! // Fork: cheap, nothing copied.
//! let mut fork = ptr.deep_clone();
//!
//! // First write in the fork copies exactly the touched object.
//! fork.get_mut().weight = 0.5;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod alloc;
pub mod config;
pub mod context;
pub mod counted;
pub mod eager;
pub mod freeze;
pub mod lazy;
pub mod lock;
pub mod log;
mod memo;
pub mod object;
pub mod shared;
pub mod thread;
pub mod weak;

// Re-exports
pub use config::{CloneMode, ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use context::Context;
pub use eager::Eager;
pub use freeze::{FinishWalk, FreezeWalk};
pub use lazy::Lazy;
pub use object::{create, create_with, Clonable, CloneSession};
pub use shared::{Init, Shared};
pub use weak::Weak;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the runtime with default configuration.
pub fn init() {
    init_with_config(RuntimeConfig::default());
}

/// Initialize the runtime with the given configuration.
///
/// The first initialization wins; the clone strategy, pool layout and
/// thread ceiling are fixed for the life of the process. Returns whether
/// this call installed the configuration.
pub fn init_with_config(config: RuntimeConfig) -> bool {
    log::set_level(config.log.level);
    log::set_format(config.log.format);
    log::set_timestamps(config.log.timestamps);
    let installed = config::set_runtime_config(config);
    if installed {
        log::debug(format!("aspen runtime {} initialized", VERSION));
    }
    installed
}

/// Initialize the runtime from `ASPEN_*` environment variables.
pub fn init_from_env() -> bool {
    init_with_config(RuntimeConfig::from_env())
}
