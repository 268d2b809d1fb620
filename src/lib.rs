//! Bidirectional file synchronization between a local directory and a
//! path inside a Kubernetes pod container.
//!
//! A [`SyncSession`] drives two pipelines over long-lived exec streams:
//! the upstream side watches the local tree and ships tar archives into
//! the container, the downstream side polls the container listing and
//! mirrors remote changes back. A shared [`state::SyncState`] tracker
//! keeps both sides from echoing each other's writes, and deletions are
//! only honored for paths the tracker has actually seen.

pub mod archive;
pub mod delete;
pub mod downstream;
pub mod error;
pub mod exclusion;
pub mod exec;
pub mod logging;
pub mod protocol;
pub mod scan;
pub mod session;
pub mod state;
pub mod types;
pub mod upstream;
pub mod util;

pub use error::SyncError;
pub use exclusion::ExcludeMatcher;
pub use exec::{ExecClient, ExecStream, KubectlExecClient, PodHandle};
pub use session::{copy_initial, SessionOptions, SessionStatus, SyncSession};
pub use types::FileInformation;

// vim: ts=4
