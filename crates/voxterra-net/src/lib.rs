//! TCP transport for voxterra replication
//!
//! Frames are a u32 little-endian length followed by the encoded delta. Each
//! endpoint runs its socket on a tokio runtime owned by a background thread;
//! incoming frames are queued for [`Transport::try_recv`](voxterra::replication::Transport::try_recv).

pub mod frame;
pub mod tcp;

pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
pub use tcp::{TcpTransport, TcpTransportServer};
