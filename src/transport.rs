//! TLS transport
//!
//! A mutually-authenticated TLS listener with a bounded worker pool. The
//! accept loop runs on its own thread; each accepted connection takes a
//! worker slot (blocking the accept loop when all `queue.size` slots are
//! busy), performs the handshake, hands the stream to the handler for one
//! request/response exchange, and closes.
//!
//! Client certificates are required and verified against the configured
//! root bundle; trust is always strict. TLS 1.2 is the floor, with the
//! provider's modern suite list (ECDHE with AES-GCM or
//! ChaCha20-Poly1305). CRLs are not checked.

use std::fs::File;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConnection, StreamOwned};
use tracing::{debug, error, info};

use crate::error::{Error, Result};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One live, handshake-complete client connection.
pub type TlsStream = StreamOwned<ServerConnection, TcpStream>;

/// Paths and bind address for the TLS listener.
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub bind: String,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub ca_cert: PathBuf,
}

/// A running server: accept loop plus its worker pool.
pub struct Server {
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    workers: Arc<WorkerGate>,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Bind the listener and start serving. `handler` runs once per
    /// accepted connection, on a worker thread.
    pub fn serve<H>(options: &TlsOptions, queue_size: usize, handler: H) -> Result<Server>
    where
        H: Fn(&mut TlsStream) + Send + Sync + 'static,
    {
        let tls_config = Arc::new(build_tls_config(options)?);

        let listener = TcpListener::bind(&options.bind)
            .map_err(|err| Error::Transport(format!("binding {}: {err}", options.bind)))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| Error::Transport(format!("listener setup: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| Error::Transport(format!("listener setup: {err}")))?;

        info!(addr = %local_addr, queue_size, "listening");

        let shutdown = Arc::new(AtomicBool::new(false));
        let workers = Arc::new(WorkerGate::new(queue_size));
        let handler = Arc::new(handler);

        let accept_thread = {
            let shutdown = Arc::clone(&shutdown);
            let workers = Arc::clone(&workers);
            std::thread::spawn(move || {
                accept_loop(listener, tls_config, shutdown, workers, handler);
            })
        };

        Ok(Server {
            shutdown,
            accept_thread: Some(accept_thread),
            workers,
            local_addr,
        })
    }

    /// The bound address; useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, then block until every in-flight worker has run to
    /// completion. Workers are never cancelled: a half-committed merge
    /// would leak its temp file.
    pub fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        self.workers.drain();
        info!("server closed");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close();
    }
}

fn accept_loop<H>(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    shutdown: Arc<AtomicBool>,
    workers: Arc<WorkerGate>,
    handler: Arc<H>,
) where
    H: Fn(&mut TlsStream) + Send + Sync + 'static,
{
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "connection accepted");
                // Blocks when all slots are busy: backpressure on accept.
                workers.acquire();

                let tls_config = Arc::clone(&tls_config);
                let workers = Arc::clone(&workers);
                let handler = Arc::clone(&handler);
                std::thread::spawn(move || {
                    serve_connection(tls_config, stream, handler.as_ref());
                    workers.release();
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                if !shutdown.load(Ordering::Relaxed) {
                    error!(%err, "error receiving connection");
                }
            }
        }
    }
}

fn serve_connection<H>(tls_config: Arc<rustls::ServerConfig>, stream: TcpStream, handler: &H)
where
    H: Fn(&mut TlsStream),
{
    if let Err(err) = stream.set_nonblocking(false) {
        error!(%err, "connection setup failed");
        return;
    }

    let connection = match ServerConnection::new(tls_config) {
        Ok(connection) => connection,
        Err(err) => {
            error!(%err, "tls session setup failed");
            return;
        }
    };

    let mut tls = StreamOwned::new(connection, stream);

    // Drive the handshake to completion before handing over: a failure
    // here (e.g. an untrusted client certificate) terminates the
    // connection with no response.
    while tls.conn.is_handshaking() {
        if let Err(err) = tls.conn.complete_io(&mut tls.sock) {
            error!(%err, "tls handshake failed");
            return;
        }
    }

    handler(&mut tls);

    tls.conn.send_close_notify();
    let _ = tls.conn.complete_io(&mut tls.sock);
}

/// Build the rustls server config: required-and-verified client auth
/// against the CA bundle, TLS 1.2 minimum.
fn build_tls_config(options: &TlsOptions) -> Result<rustls::ServerConfig> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(&options.ca_cert)? {
        roots
            .add(cert)
            .map_err(|err| Error::Transport(format!("building root CA pool: {err}")))?;
    }

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|err| Error::Transport(format!("building client verifier: {err}")))?;

    let chain = read_certs(&options.server_cert)?;
    let key = read_private_key(&options.server_key)?;

    rustls::ServerConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS13,
        &rustls::version::TLS12,
    ])
    .with_client_cert_verifier(verifier)
    .with_single_cert(chain, key)
    .map_err(|err| Error::Transport(format!("loading server certificate: {err}")))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|err| Error::Transport(format!("reading {}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|err| Error::Transport(format!("parsing {}: {err}", path.display())))
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|err| Error::Transport(format!("reading {}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| Error::Transport(format!("parsing {}: {err}", path.display())))?
        .ok_or_else(|| Error::Transport(format!("{}: no private key found", path.display())))
}

/// Counting gate over worker slots: acquire blocks at capacity, drain
/// blocks until everything in flight has finished.
struct WorkerGate {
    max: usize,
    in_flight: Mutex<usize>,
    changed: Condvar,
}

impl WorkerGate {
    fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            in_flight: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut count = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while *count >= self.max {
            count = self
                .changed
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *count += 1;
    }

    fn release(&self) {
        let mut count = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        self.changed.notify_all();
    }

    fn drain(&self) {
        let mut count = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .changed
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
