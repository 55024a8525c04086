//! Compilation slaves: declaration, connection state and the session registry.
//!
//! - `declare`: parse `host[:slots[:port]]` lists into declarations
//! - `state`: connection state machine (Unregistered → Registering → Active → Draining → Closed)
//! - `worker`: one slave with its slots and channel
//! - `registry`: all slaves and jobs of a session behind one lock
//! - `handshake`: connect, handshake and source sync for one slave

pub mod declare;
pub mod handshake;
pub mod registry;
pub mod state;
pub mod worker;

pub use declare::{SlaveDecl, parse_slave_attribute, parse_slave_entry, parse_slave_list};
pub use registry::{RegistrationTarget, Reservation, WorkerRegistry};
pub use state::{StateTransition, WorkerState};
pub use worker::{Worker, WorkerInfo};
