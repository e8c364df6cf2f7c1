//! Process supervisor for corral workers.
//!
//! [`Supervisor::run`](supervisor::Supervisor::run) keeps a worker process
//! alive according to its exit status and heartbeat, carrying the shared
//! data blob from one worker to the next.

pub mod errors;
pub mod restart;
pub mod spawn;
pub mod supervisor;

pub use errors::{Result, SupervisorError};
pub use restart::{WorkerExit, exit_like, should_exit};
pub use spawn::WorkerSpec;
pub use supervisor::Supervisor;
