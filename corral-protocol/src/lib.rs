//! Wire protocol shared by the corral supervisor and its worker process.
//!
//! The worker talks to the supervisor over a one-way pipe inherited at spawn
//! time. Every message is a 4-byte big-endian length followed by a bincode
//! payload (see [`protocol`]). The supervisor interprets the worker's exit
//! status using the sentinel codes defined here.

pub mod channel;
pub mod duration;
pub mod errors;
pub mod pipe;
pub mod protocol;
pub mod shared;
