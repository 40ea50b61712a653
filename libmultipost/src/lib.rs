//! Multipost - multi-platform social post publishing core
//!
//! This library fans a post out to linked accounts across platforms,
//! drives each publish attempt through a retryable state machine, and
//! keeps platform credentials encrypted, refreshed, and race-free.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod platforms;
pub mod refresh;
pub mod target;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use credentials::{Credential, CredentialStore};
pub use db::Database;
pub use error::{MultipostError, Result};
pub use orchestrator::Orchestrator;
pub use target::RetryPolicy;
pub use types::{Platform, Post, PostStatus, SocialAccount, Target, TargetState};
