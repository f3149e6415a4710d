// Library surface shared by the CLI and the integration tests.
pub mod app_dirs;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod mastery;
pub mod selector;
pub mod session;
pub mod stats;
pub mod store;
pub mod util;

pub use engine::DictationEngine;
pub use error::{Error, Result};

pub type LearnerId = i64;
pub type WordId = i64;
pub type TaskId = i64;
pub type SessionId = i64;
