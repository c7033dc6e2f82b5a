//! A TCP relay that can drop connections on demand.
//!
//! Sits between an agent and the synchronizer. Bytes are forwarded
//! unchanged until a cut is armed; the relay then forwards at most the
//! armed number of synchronizer-to-agent bytes and closes both sides,
//! which lands the drop inside whatever frame was in flight.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

const UNARMED: i64 = -1;

#[derive(Debug)]
struct Shared {
    upstream: SocketAddr,
    budget: AtomicI64,
    connections: AtomicUsize,
    cuts: AtomicUsize,
}

/// A relay between agents and one synchronizer.
pub struct FlakyProxy {
    addr: SocketAddr,
    shared: Arc<Shared>,
    acceptor: JoinHandle<()>,
}

impl FlakyProxy {
    /// Listens on an ephemeral loopback port and relays to `upstream`.
    pub async fn start(upstream: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            upstream,
            budget: AtomicI64::new(UNARMED),
            connections: AtomicUsize::new(0),
            cuts: AtomicUsize::new(0),
        });
        let acceptor = {
            let shared = shared.clone();
            tokio::spawn(async move {
                while let Ok((client, _)) = listener.accept().await {
                    let shared = shared.clone();
                    tokio::spawn(relay(client, shared));
                }
            })
        };
        Ok(Self {
            addr,
            shared,
            acceptor,
        })
    }

    /// Address agents should connect to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Cuts the next connection carrying data after `bytes` more
    /// synchronizer-to-agent bytes. One-shot.
    pub fn cut_after(&self, bytes: usize) {
        self.shared.budget.store(bytes as i64, Ordering::SeqCst);
    }

    /// Connections relayed so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Connections cut so far.
    pub fn cuts(&self) -> usize {
        self.shared.cuts.load(Ordering::SeqCst)
    }
}

impl Drop for FlakyProxy {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn relay(client: TcpStream, shared: Arc<Shared>) {
    let Ok(server) = TcpStream::connect(shared.upstream).await else {
        return;
    };
    shared.connections.fetch_add(1, Ordering::SeqCst);
    let (mut client_read, mut client_write) = client.into_split();
    let (mut server_read, mut server_write) = server.into_split();

    let upstream = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut client_read, &mut server_write).await;
        let _ = server_write.shutdown().await;
    });

    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = match server_read.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let (forward, cut) = take_budget(&shared.budget, n);
        if client_write.write_all(&buf[..forward]).await.is_err() {
            break;
        }
        if cut {
            shared.cuts.fetch_add(1, Ordering::SeqCst);
            debug!(forwarded = forward, "proxy cutting connection");
            break;
        }
    }
    upstream.abort();
    let _ = client_write.shutdown().await;
}

/// Returns how many of `n` bytes may pass and whether the connection must
/// then be cut.
fn take_budget(budget: &AtomicI64, n: usize) -> (usize, bool) {
    let mut current = budget.load(Ordering::SeqCst);
    loop {
        if current == UNARMED {
            return (n, false);
        }
        let remaining = current as usize;
        let (forward, next) = if n >= remaining {
            (remaining, UNARMED)
        } else {
            (n, (remaining - n) as i64)
        };
        match budget.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return (forward, next == UNARMED),
            Err(actual) => current = actual,
        }
    }
}
