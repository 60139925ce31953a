//! Replication adapter: delta wire format, transport boundary and the
//! session that keeps peers in step.

pub mod delta;
pub mod session;
pub mod transport;

pub use delta::Delta;
pub use session::{PollReport, Publisher, ReplicationSession};
pub use transport::{LoopbackTransport, Transport};
