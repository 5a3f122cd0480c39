//! Local port forwarding over a secure transport.
//!
//! Each mapping gets its own listener and accept loop. Every accepted
//! connection is relayed in both directions at once. A clean end-of-stream
//! shuts down the write side of the opposite endpoint so the peer sees the
//! half-close, and the other direction is given `HALF_CLOSE_LINGER` to
//! finish. An I/O error in either direction tears down both.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, ToolsError};

/// Byte stream returned by a [`Transport`].
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// An established secure session able to open streams to remote targets.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream>;
}

/// One forwarded port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl Mapping {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }
}

/// Running listeners for a set of mappings.
///
/// Closing (or dropping) the session stops accepting; connections already
/// being relayed drain on their own.
pub struct ForwardingSession {
    mappings: Vec<Mapping>,
    shutdown: CancellationToken,
}

impl ForwardingSession {
    /// Bind every mapping's local port and start accepting.
    ///
    /// If any port cannot be bound no loop is started.
    pub async fn open(
        transport: Arc<dyn Transport>,
        mappings: Vec<Mapping>,
        accept_backoff: Duration,
    ) -> Result<Self> {
        let mut listeners = Vec::with_capacity(mappings.len());
        for mapping in &mappings {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, mapping.local_port));
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                ToolsError::tunnel(format!("failed to listen on {}: {}", addr, e))
            })?;
            listeners.push(listener);
        }

        let shutdown = CancellationToken::new();
        for (listener, mapping) in listeners.into_iter().zip(mappings.iter().cloned()) {
            info!(
                "Forwarding 127.0.0.1:{} to {}:{}",
                mapping.local_port, mapping.remote_host, mapping.remote_port
            );
            tokio::spawn(accept_loop(
                listener,
                transport.clone(),
                mapping,
                accept_backoff,
                HALF_CLOSE_LINGER,
                shutdown.clone(),
            ));
        }

        Ok(Self { mappings, shutdown })
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Stop every accept loop and release the listeners.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for ForwardingSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// How long the opposite direction may keep running after one side of a
/// connection reached end-of-stream.
const HALF_CLOSE_LINGER: Duration = Duration::from_secs(30);

/// Source of inbound connections for an accept loop.
#[async_trait]
trait Accept: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Accept for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

async fn accept_loop<A: Accept>(
    mut listener: A,
    transport: Arc<dyn Transport>,
    mapping: Mapping,
    backoff: Duration,
    linger: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => res,
        };

        match accepted {
            Ok((inbound, peer)) => {
                debug!("Accepted {} on port {}", peer, mapping.local_port);
                let transport = transport.clone();
                let mapping = mapping.clone();
                tokio::spawn(async move {
                    relay(inbound, transport.as_ref(), &mapping, linger).await;
                });
            }
            Err(e) if is_transient(&e) => {
                debug!("Transient accept error on port {}: {}", mapping.local_port, e);
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                warn!("Stopped accepting on port {}: {}", mapping.local_port, e);
                break;
            }
        }
    }
    debug!("Listener on port {} closed", mapping.local_port);
}

fn is_transient(e: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
    ) {
        return true;
    }

    // ENFILE, EMFILE
    cfg!(unix) && matches!(e.raw_os_error(), Some(23) | Some(24))
}

async fn relay<S>(inbound: S, transport: &dyn Transport, mapping: &Mapping, linger: Duration)
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let remote = match transport
        .dial(&mapping.remote_host, mapping.remote_port)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            // Dropping the inbound connection closes it; the listener keeps going.
            debug!(
                "connect to {}:{} failed: {}",
                mapping.remote_host, mapping.remote_port, e
            );
            return;
        }
    };

    let (inbound_read, inbound_write) = tokio::io::split(inbound);
    let (remote_read, remote_write) = tokio::io::split(remote);
    let failed = CancellationToken::new();
    let outbound_done = CancellationToken::new();
    let inbound_done = CancellationToken::new();

    let (sent, received) = tokio::join!(
        copy_and_close(
            inbound_read,
            remote_write,
            Finish {
                failed: failed.clone(),
                done: outbound_done.clone(),
                peer_done: inbound_done.clone(),
                linger,
            }
        ),
        copy_and_close(
            remote_read,
            inbound_write,
            Finish {
                failed: failed.clone(),
                done: inbound_done,
                peer_done: outbound_done,
                linger,
            }
        ),
    );
    debug!(
        "Connection on port {} finished ({} bytes out, {} bytes in)",
        mapping.local_port, sent, received
    );
}

/// Signals shared by the two directions of one connection.
struct Finish {
    /// Cancelled by either direction on an I/O error.
    failed: CancellationToken,
    /// Cancelled by this direction once it stops.
    done: CancellationToken,
    /// The opposite direction's `done`.
    peer_done: CancellationToken,
    linger: Duration,
}

/// Copy until end-of-stream, then shut down `dest`. An error on this side
/// cancels the opposite direction; once the opposite direction has stopped,
/// this one gets at most `linger` more.
async fn copy_and_close<R, W>(mut src: R, mut dest: W, finish: Finish) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Finish {
        failed,
        done,
        peer_done,
        linger,
    } = finish;
    let lingered = async {
        peer_done.cancelled().await;
        tokio::time::sleep(linger).await;
    };

    let copied = tokio::select! {
        _ = failed.cancelled() => 0,
        _ = lingered => {
            debug!("Closing idle half-closed connection");
            0
        }
        res = tokio::io::copy(&mut src, &mut dest) => match res {
            Ok(n) => n,
            Err(e) => {
                debug!("Relay error: {}", e);
                failed.cancel();
                0
            }
        },
    };
    done.cancel();
    let _ = dest.shutdown().await;
    copied
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tunnel::ports::allocate_free_ports;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, DuplexStream as Pipe};
    use tokio::sync::mpsc;

    /// Transport that dials plain TCP, redirecting every target to `backend`.
    pub(crate) struct LoopbackTransport {
        pub backend: SocketAddr,
        pub dialed: Mutex<Vec<(String, u16)>>,
    }

    impl LoopbackTransport {
        pub fn new(backend: SocketAddr) -> Self {
            Self {
                backend,
                dialed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
            self.dialed.lock().unwrap().push((host.to_string(), port));
            let stream = TcpStream::connect(self.backend).await?;
            Ok(Box::new(stream))
        }
    }

    struct RefusingTransport;

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
            Err(ToolsError::tunnel(format!("{}:{} refused", host, port)))
        }
    }

    async fn open_one(transport: Arc<dyn Transport>) -> (ForwardingSession, u16) {
        let port = allocate_free_ports(1).await.unwrap()[0];
        let session = ForwardingSession::open(
            transport,
            vec![Mapping::new(port, "10.0.0.1", 3306)],
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        (session, port)
    }

    #[tokio::test]
    async fn test_forwards_bytes_and_propagates_close() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let transport = Arc::new(LoopbackTransport::new(backend_addr));
        let (_session, port) = open_one(transport.clone()).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"select num from ketchup").await.unwrap();
        client.shutdown().await.unwrap();

        let (mut server_side, _) = backend.accept().await.unwrap();
        let mut received = Vec::new();
        // read_to_end only returns once the relay propagated the close
        server_side.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, b"select num from ketchup");
        assert_eq!(
            transport.dialed.lock().unwrap().clone(),
            vec![("10.0.0.1".to_string(), 3306)]
        );
    }

    #[tokio::test]
    async fn test_round_trip() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = backend.accept().await.unwrap();
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).await.unwrap();
            buf.reverse();
            conn.write_all(&buf).await.unwrap();
        });

        let (_session, port) = open_one(Arc::new(LoopbackTransport::new(backend_addr))).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"cba");
    }

    #[tokio::test]
    async fn test_failed_dial_closes_inbound_and_keeps_listening() {
        let (_session, port) = open_one(Arc::new(RefusingTransport)).await;

        for _ in 0..2 {
            let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            let mut buf = Vec::new();
            let n = client.read_to_end(&mut buf).await.unwrap_or(0);
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn test_close_releases_listener() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (session, port) =
            open_one(Arc::new(LoopbackTransport::new(backend.local_addr().unwrap()))).await;
        session.close();

        let mut rebound = None;
        for _ in 0..50 {
            if let Ok(l) = TcpListener::bind(("127.0.0.1", port)).await {
                rebound = Some(l);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(rebound.is_some());
    }

    #[tokio::test]
    async fn test_open_fails_when_port_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = ForwardingSession::open(
            Arc::new(RefusingTransport),
            vec![Mapping::new(port, "10.0.0.1", 3306)],
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ToolsError::Tunnel { .. })));
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }
    /// Hands out a fixed sequence of accept results, then waits forever.
    struct ScriptedAcceptor {
        script: Arc<Mutex<VecDeque<io::Result<Pipe>>>>,
    }

    #[async_trait]
    impl Accept for ScriptedAcceptor {
        type Stream = Pipe;

        async fn accept(&mut self) -> io::Result<(Pipe, SocketAddr)> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(res) => res.map(|s| (s, SocketAddr::from((Ipv4Addr::LOCALHOST, 50000)))),
                None => std::future::pending().await,
            }
        }
    }

    /// Transport whose remote ends are handed to the test.
    struct PipeTransport {
        remotes: mpsc::UnboundedSender<Pipe>,
    }

    #[async_trait]
    impl Transport for PipeTransport {
        async fn dial(&self, _host: &str, _port: u16) -> Result<BoxedStream> {
            let (ours, theirs) = tokio::io::duplex(1024);
            let _ = self.remotes.send(theirs);
            Ok(Box::new(ours))
        }
    }

    fn pipe_transport() -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<Pipe>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(PipeTransport { remotes: tx }), rx)
    }

    fn scripted(
        results: Vec<io::Result<Pipe>>,
    ) -> (ScriptedAcceptor, Arc<Mutex<VecDeque<io::Result<Pipe>>>>) {
        let script = Arc::new(Mutex::new(results.into_iter().collect::<VecDeque<_>>()));
        (
            ScriptedAcceptor {
                script: script.clone(),
            },
            script,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_accept_errors_are_retried() {
        let (mut client, inbound) = tokio::io::duplex(1024);
        let (acceptor, script) = scripted(vec![
            Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            Err(io::Error::from(io::ErrorKind::ConnectionReset)),
            Ok(inbound),
        ]);
        let (transport, mut remotes) = pipe_transport();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(accept_loop(
            acceptor,
            transport,
            Mapping::new(50001, "10.0.0.1", 3306),
            Duration::from_millis(10),
            Duration::from_secs(30),
            shutdown.clone(),
        ));

        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();
        let mut remote = remotes.recv().await.unwrap();
        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();

        assert_eq!(received, b"ping");
        assert!(script.lock().unwrap().is_empty());
        assert!(!handle.is_finished());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_fatal_accept_error_stops_loop() {
        let (_client, inbound) = tokio::io::duplex(1024);
        let (acceptor, script) = scripted(vec![
            Err(io::Error::from(io::ErrorKind::PermissionDenied)),
            Ok(inbound),
        ]);
        let (transport, _remotes) = pipe_transport();

        tokio::time::timeout(
            Duration::from_secs(5),
            accept_loop(
                acceptor,
                transport,
                Mapping::new(50001, "10.0.0.1", 3306),
                Duration::from_millis(10),
                Duration::from_secs(30),
                CancellationToken::new(),
            ),
        )
        .await
        .unwrap();

        assert_eq!(script.lock().unwrap().len(), 1);
    }

    /// Every dial waits until `expected` dials are in flight at once.
    struct BarrierTransport {
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl Transport for BarrierTransport {
        async fn dial(&self, _host: &str, _port: u16) -> Result<BoxedStream> {
            self.barrier.wait().await;
            let (ours, _theirs) = tokio::io::duplex(64);
            Ok(Box::new(ours))
        }
    }

    #[tokio::test]
    async fn test_dials_run_concurrently() {
        let (_a, first) = tokio::io::duplex(64);
        let (_b, second) = tokio::io::duplex(64);
        let (acceptor, _script) = scripted(vec![Ok(first), Ok(second)]);
        let transport = Arc::new(BarrierTransport {
            barrier: tokio::sync::Barrier::new(3),
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(accept_loop(
            acceptor,
            transport.clone(),
            Mapping::new(50001, "10.0.0.1", 3306),
            Duration::from_millis(10),
            Duration::from_secs(30),
            shutdown.clone(),
        ));

        // Both relays must be dialing at the same time for the barrier to open.
        tokio::time::timeout(Duration::from_secs(5), transport.barrier.wait())
            .await
            .unwrap();
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_remote_is_closed_after_linger() {
        let (mut client, inbound) = tokio::io::duplex(1024);
        let (transport, mut remotes) = pipe_transport();
        let mapping = Mapping::new(50001, "10.0.0.1", 3306);

        let relayed = tokio::spawn(async move {
            relay(inbound, transport.as_ref(), &mapping, Duration::from_secs(30)).await;
        });

        client.write_all(b"quit").await.unwrap();
        client.shutdown().await.unwrap();

        // The remote reads the request and its end-of-stream but never answers.
        let mut remote = remotes.recv().await.unwrap();
        let mut received = Vec::new();
        remote.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"quit");

        let started = tokio::time::Instant::now();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();

        assert!(reply.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(29));
        relayed.await.unwrap();
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_after_half_close_is_delivered() {
        let (mut client, inbound) = tokio::io::duplex(1024);
        let (transport, mut remotes) = pipe_transport();
        let mapping = Mapping::new(50001, "10.0.0.1", 3306);

        tokio::spawn(async move {
            relay(inbound, transport.as_ref(), &mapping, Duration::from_secs(30)).await;
        });

        client.write_all(b"abc").await.unwrap();
        client.shutdown().await.unwrap();

        let mut remote = remotes.recv().await.unwrap();
        let mut request = Vec::new();
        remote.read_to_end(&mut request).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        remote.write_all(b"cba").await.unwrap();
        remote.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"cba");
    }
}
