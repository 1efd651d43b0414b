//! Deploys folders from a storage root into up to three target roots by
//! symlink or copy, and reports where each folder stands.

pub mod backup;
pub mod cli;
pub mod config;
pub mod deploy;
pub mod error;
pub mod heuristic;
pub mod library;
pub mod logging;
pub mod plan;
pub mod resolver;
pub mod rules;
pub mod scan;
pub mod status;
pub mod store;

pub use config::{AppConfig, AppProfile};
pub use deploy::{AutoAnswer, Confirm, Decision, DeployOutcome, LinkEngine, UnlinkOutcome};
pub use error::{DeployError, DeployResult};
pub use rules::{LinkStatus, TargetKey};
pub use status::{get_link_status, LinkKind, LinkState};
pub use store::{FolderConfig, FolderStore};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
