//! distbuild: remote compilation slave orchestration.
//!
//! Extends a local parallel build with network-attached slaves: declare
//! them, register them, dispatch compile jobs to free slots and tear the
//! pool down cleanly at the end of the session.

pub mod capacity;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod paths;
pub mod session;
pub mod shutdown;
pub mod slave;
pub mod teardown;

pub use capacity::CapacitySnapshot;
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use job::{Job, JobEvent, JobState};
pub use session::{RegistrationReport, Session};
pub use teardown::{CleanupReport, TeardownReport};
