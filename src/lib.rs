//! A small replicated-log consensus core.
//!
//! One [`replica::Replica`] maintains durable, ordered agreement on a
//! sequence of opaque commands across a fixed, odd-sized peer group using
//! the Raft algorithm, tolerating minority failures, message loss,
//! reordering, and duplication. The RPC transport and the stable storage
//! are supplied by the caller through the [`transport::Transport`] and
//! [`persist::Persister`] traits; committed commands come back in index
//! order on an apply channel.

pub mod message;
pub mod persist;
pub mod replica;
pub mod transport;

mod timer;
