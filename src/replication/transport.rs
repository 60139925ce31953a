//! Transport boundary for replication frames.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Mutex, PoisonError};

use crate::core::error::Error;
use crate::core::types::Result;

/// Ordered, reliable frame channel to one peer.
///
/// `try_recv` never blocks; the session polls it from the control thread.
pub trait Transport: Send + Sync {
    fn send(&self, frame: Vec<u8>) -> Result<()>;
    fn try_recv(&self) -> Option<Vec<u8>>;
}

/// In-process transport; [`LoopbackTransport::pair`] returns both ends.
#[derive(Debug)]
pub struct LoopbackTransport {
    tx: Sender<Vec<u8>>,
    rx: Mutex<Receiver<Vec<u8>>>,
}

impl LoopbackTransport {
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();
        (
            Self { tx: a_tx, rx: Mutex::new(b_rx) },
            Self { tx: b_tx, rx: Mutex::new(a_rx) },
        )
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| Error::Transport("loopback peer dropped".to_string()))
    }

    fn try_recv(&self) -> Option<Vec<u8>> {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
        match rx.try_recv() {
            Ok(frame) => Some(frame),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_is_crossed_and_ordered() {
        let (a, b) = LoopbackTransport::pair();
        a.send(vec![1]).unwrap();
        a.send(vec![2]).unwrap();
        b.send(vec![9]).unwrap();
        assert_eq!(b.try_recv(), Some(vec![1]));
        assert_eq!(b.try_recv(), Some(vec![2]));
        assert_eq!(b.try_recv(), None);
        assert_eq!(a.try_recv(), Some(vec![9]));
    }

    #[test]
    fn test_send_to_dropped_peer_fails() {
        let (a, b) = LoopbackTransport::pair();
        drop(b);
        assert!(matches!(a.send(vec![0]), Err(Error::Transport(_))));
        assert_eq!(a.try_recv(), None);
    }
}
