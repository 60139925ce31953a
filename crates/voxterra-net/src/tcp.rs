//! TCP endpoints implementing the replication transport

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};

use voxterra::replication::Transport;
use voxterra::{Error, Result};

use crate::frame::{read_frame, write_frame};

/// One side of a replication link.
///
/// Dropping the transport closes the connection.
pub struct TcpTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbox: Mutex<std_mpsc::Receiver<Vec<u8>>>,
    open: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl TcpTransport {
    /// Connect to a [`TcpTransportServer`].
    pub fn connect(addr: impl Into<SocketAddr>) -> Result<Self> {
        let addr = addr.into();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let runtime = runtime()?;
        thread::Builder::new()
            .name(format!("voxterra-net-{}", addr))
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpStream::connect(addr).await {
                        Ok(stream) => {
                            let (transport, link) = Link::new(addr);
                            let _ = ready_tx.send(Ok(transport));
                            link.run(stream).await;
                        }
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                        }
                    }
                });
            })?;
        match ready_rx.recv() {
            Ok(Ok(transport)) => {
                log::info!("Connected to replication peer {}", addr);
                Ok(transport)
            }
            Ok(Err(e)) => Err(Error::Transport(format!("connect to {}: {}", addr, e))),
            Err(_) => Err(Error::Transport(format!("connect to {}: network thread exited", addr))),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// False once the connection has closed in either direction.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Transport for TcpTransport {
    fn send(&self, frame: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Transport(format!("connection to {} is closed", self.peer)));
        }
        self.outbound
            .send(frame)
            .map_err(|_| Error::Transport(format!("connection to {} is closed", self.peer)))
    }

    fn try_recv(&self) -> Option<Vec<u8>> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner).try_recv().ok()
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("peer", &self.peer)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Socket side of a [`TcpTransport`], driven on the network runtime.
struct Link {
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inbox: std_mpsc::Sender<Vec<u8>>,
    open: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl Link {
    fn new(peer: SocketAddr) -> (TcpTransport, Link) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = std_mpsc::channel();
        let open = Arc::new(AtomicBool::new(true));
        let transport = TcpTransport {
            outbound: out_tx,
            inbox: Mutex::new(in_rx),
            open: Arc::clone(&open),
            peer,
        };
        let link = Link { outbound: out_rx, inbox: in_tx, open, peer };
        (transport, link)
    }

    async fn run(self, stream: TcpStream) {
        let Link { outbound, inbox, open, peer } = self;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay on {}: {}", peer, e);
        }
        let (reader, writer) = stream.into_split();
        tokio::select! {
            _ = read_loop(reader, inbox, peer) => {}
            _ = write_loop(writer, outbound, peer) => {}
        }
        open.store(false, Ordering::Release);
        log::info!("Replication link to {} closed", peer);
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inbox: std_mpsc::Sender<Vec<u8>>, peer: SocketAddr) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if inbox.send(frame).is_err() {
                    // Transport dropped.
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                log::warn!("Read from {} failed: {}", peer, e);
                return;
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>, peer: SocketAddr) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            log::warn!("Write to {} failed: {}", peer, e);
            return;
        }
    }
}

/// Accepts replication peers.
///
/// Dropping the server stops accepting and closes the accepted connections.
pub struct TcpTransportServer {
    local_addr: SocketAddr,
    accepted: Mutex<std_mpsc::Receiver<TcpTransport>>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TcpTransportServer {
    /// Bind and start accepting in the background. Port 0 picks a free port.
    pub fn bind(addr: impl Into<SocketAddr>) -> Result<Self> {
        let addr = addr.into();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (accepted_tx, accepted_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let runtime = runtime()?;
        let thread = thread::Builder::new()
            .name(format!("voxterra-net-listen-{}", addr))
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match TcpListener::bind(addr).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(listener.local_addr());
                    accept_loop(listener, accepted_tx, stop_rx).await;
                });
            })?;
        let local_addr = match ready_rx.recv() {
            Ok(Ok(local)) => local,
            Ok(Err(e)) => return Err(Error::Transport(format!("bind {}: {}", addr, e))),
            Err(_) => return Err(Error::Transport(format!("bind {}: network thread exited", addr))),
        };
        log::info!("Replication server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            accepted: Mutex::new(accepted_rx),
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next connected peer, if one is waiting.
    pub fn try_accept(&self) -> Option<TcpTransport> {
        self.accepted.lock().unwrap_or_else(PoisonError::into_inner).try_recv().ok()
    }

    /// Wait up to `timeout` for a peer.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<TcpTransport> {
        self.accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv_timeout(timeout)
            .map_err(|e| Error::Transport(format!("accept on {}: {}", self.local_addr, e)))
    }
}

async fn accept_loop(
    listener: TcpListener,
    accepted: std_mpsc::Sender<TcpTransport>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stop => return,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    log::info!("Replication peer connected from {}", peer);
                    let (transport, link) = Link::new(peer);
                    if accepted.send(transport).is_err() {
                        return;
                    }
                    tokio::spawn(link.run(stream));
                }
                Err(e) => {
                    log::error!("Replication server accept error: {}", e);
                }
            },
        }
    }
}

impl Drop for TcpTransportServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for TcpTransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransportServer")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

fn runtime() -> Result<Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
}
