#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use wirepool::{ConnectionManager, HttpVersion, Logger, Options, Waiter, WaiterReceipt};

pub fn manager(options: Options) -> ConnectionManager {
    ConnectionManager::new(options, Logger::disabled())
}

/// Submit a request-side waiter for a local origin.
pub fn acquire(
    mgr: &ConnectionManager,
    version: HttpVersion,
    tls: bool,
    addr: SocketAddr,
) -> (Arc<Waiter>, WaiterReceipt) {
    let (waiter, receipt) = Waiter::channel(version);
    let host = addr.ip().to_string();
    mgr.acquire_for_request(version, &host, tls, addr.port(), &host, &waiter)
        .expect("acquire_for_request");
    (waiter, receipt)
}

/// Poll a condition until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("eventually: condition not met within 2s");
}

#[derive(Clone)]
enum Behavior {
    /// Accept and keep the connection open until the peer or the test
    /// closes it.
    Hold,
    /// Write junk bytes instead of a TLS ServerHello.
    Garbage,
    /// Read an HTTP/1.1 request head, then either switch protocols (101)
    /// or answer with a full response.
    Upgrade { accept: bool },
    /// Complete a TLS handshake first, then hold.
    Tls { config: Arc<rustls::ServerConfig> },
}

/// A local origin server for driving the pool end to end.
pub struct Origin {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    close: Arc<Notify>,
}

impl Origin {
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Close every currently-established connection from the server side.
    pub fn close_connections(&self) {
        self.close.notify_waiters();
    }
}

pub async fn tcp_origin() -> Origin {
    spawn_origin(Behavior::Hold).await
}

pub async fn garbage_origin() -> Origin {
    spawn_origin(Behavior::Garbage).await
}

pub async fn upgrade_origin(accept: bool) -> Origin {
    spawn_origin(Behavior::Upgrade { accept }).await
}

pub async fn tls_origin(alpn: &[&[u8]]) -> (Origin, Vec<u8>) {
    let (config, cert_der) = server_tls_config(alpn);
    (spawn_origin(Behavior::Tls { config }).await, cert_der)
}

/// An address with nothing listening on it.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Self-signed ECDSA P-256 server config, returning the certificate DER for
/// fingerprint checks.
pub fn server_tls_config(alpn: &[&[u8]]) -> (Arc<rustls::ServerConfig>, Vec<u8>) {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let params = rcgen::CertificateParams::default();
    let cert = params.self_signed(&key_pair).unwrap();
    let cert_der_bytes = cert.der().to_vec();
    let cert_der = CertificateDer::from(cert_der_bytes.clone());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    (Arc::new(config), cert_der_bytes)
}

async fn spawn_origin(behavior: Behavior) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let close = Arc::new(Notify::new());

    let accepted_counter = accepted.clone();
    let close_signal = close.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            accepted_counter.fetch_add(1, Ordering::SeqCst);
            let behavior = behavior.clone();
            let close = close_signal.clone();
            tokio::spawn(async move {
                serve_one(stream, behavior, close).await;
            });
        }
    });

    Origin {
        addr,
        accepted,
        close,
    }
}

async fn serve_one(mut stream: TcpStream, behavior: Behavior, close: Arc<Notify>) {
    match behavior {
        Behavior::Hold => hold(stream, close).await,
        Behavior::Garbage => {
            let _ = stream.write_all(b"definitely not a handshake\r\n").await;
            let _ = stream.shutdown().await;
        }
        Behavior::Upgrade { accept } => {
            if read_request_head(&mut stream).await.is_err() {
                return;
            }
            let response: &[u8] = if accept {
                b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n"
            } else {
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok"
            };
            if stream.write_all(response).await.is_err() {
                return;
            }
            hold(stream, close).await;
        }
        Behavior::Tls { config } => {
            let acceptor = tokio_rustls::TlsAcceptor::from(config);
            match acceptor.accept(stream).await {
                Ok(tls_stream) => hold(tls_stream, close).await,
                Err(_) => {}
            }
        }
    }
}

async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(());
        }
    }
}

async fn hold<S>(mut stream: S, close: Arc<Notify>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            _ = close.notified() => {
                let _ = stream.shutdown().await;
                return;
            }
            read = stream.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        }
    }
}
