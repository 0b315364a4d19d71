//! Error taxonomy shared by every crate in the workspace.
//!
//! Planning-rejections (§7 tier 1 of the design doc) never appear here —
//! they're absorbed into `Plan::Failed` values by the planner and never
//! escape as a `Result::Err`. Everything in this enum is either an
//! execution-failure (tier 2, caught per-plan by the run coordinator) or
//! a fatal error (tier 3, propagated out of the process).

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ssh session error: {0}")]
    Ssh(String),

    #[error("file transfer failed: {0}")]
    Transfer(String),

    #[error("hook command failed: {0}")]
    Hook(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
