//! SOCKS5 Relay
//!
//! A standalone SOCKS5 server (RFC 1928) offered as an alternate transport
//! for clients that cannot run a tunnel. Username/password authentication
//! (RFC 1929) is required when credentials are configured.
//!
//! # Connection states
//!
//! ```text
//! Negotiate → [Authenticate] → Request → Connect → Relay
//! ```
//!
//! Only CONNECT is supported. Everything before Relay must finish within
//! the handshake timeout. Relaying ends as soon as either direction
//! reaches EOF or fails; both sockets are then dropped. Every state gives
//! way to shutdown.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// Authentication methods
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// Username/password sub-negotiation version
const USERPASS_VERSION: u8 = 0x01;

/// Commands
const CMD_CONNECT: u8 = 0x01;

/// Address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// Reply codes
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// How long `run` waits for open connections before aborting them
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Start the relay with the daemon
    pub enabled: bool,
    pub listen_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Buffer size per direction
    pub buffer_size: usize,
    /// Outbound dial timeout (seconds)
    pub connect_timeout_secs: u64,
    /// Deadline for greeting, auth and request (seconds)
    pub handshake_timeout_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1080),
            max_connections: 64,
            buffer_size: 4096,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 10,
            username: None,
            password: None,
        }
    }
}

impl ProxyConfig {
    /// Estimate memory usage
    pub fn memory_estimate(&self) -> usize {
        self.max_connections * (self.buffer_size * 2 + 512)
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }
}

/// Destination requested by the client
#[derive(Debug, Clone, PartialEq, Eq)]
enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Compare without bailing out at the first differing byte
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Encode a reply: VER REP RSV ATYP BND.ADDR BND.PORT
fn reply_frame(reply: u8, bound: Option<SocketAddr>) -> Vec<u8> {
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut frame = vec![SOCKS5_VERSION, reply, 0x00];
    match bound.ip() {
        IpAddr::V4(ip) => {
            frame.push(ADDR_IPV4);
            frame.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            frame.push(ADDR_IPV6);
            frame.extend_from_slice(&ip.octets());
        }
    }
    frame.extend_from_slice(&bound.port().to_be_bytes());
    frame
}

async fn send_reply<S>(stream: &mut S, reply: u8, bound: Option<SocketAddr>) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&reply_frame(reply, bound)).await?;
    Ok(())
}

async fn read_port<S: AsyncRead + Unpin>(stream: &mut S) -> Result<u16, ProxyError> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

/// SOCKS5 relay server
pub struct Socks5Relay {
    config: Arc<ProxyConfig>,
    listener: TcpListener,
    /// Limits concurrent connections
    semaphore: Arc<Semaphore>,
    active_connections: Arc<AtomicU64>,
}

impl Socks5Relay {
    /// Bind the listener
    pub async fn bind(config: ProxyConfig) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(config.listen_addr).await
            .map_err(|e| ProxyError::BindError(e.to_string()))?;

        info!(
            "SOCKS5 relay listening on {} (max {} connections, ~{:.1}MB buffers, auth {})",
            listener.local_addr()?,
            config.max_connections,
            config.memory_estimate() as f64 / (1024.0 * 1024.0),
            if config.credentials().is_some() { "required" } else { "off" },
        );

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
            config: Arc::new(config),
            listener,
            active_connections: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Proxy URL for client configuration
    pub fn proxy_url(&self) -> String {
        format!("socks5://{}", self.config.listen_addr)
    }

    /// Get number of active connections
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProxyError> {
        let mut connections = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permit = self.semaphore.clone().acquire_owned() => {
                    permit.map_err(|_| ProxyError::ShuttingDown)?
                }
            };

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let config = self.config.clone();
                        let active = self.active_connections.clone();
                        let conn_shutdown = shutdown.clone();
                        active.fetch_add(1, Ordering::Relaxed);

                        connections.spawn(async move {
                            debug!("SOCKS5 connection from {}", addr);
                            if let Err(e) = handle_connection(stream, &config, conn_shutdown).await {
                                debug!("SOCKS5 connection {} ended: {}", addr, e);
                            }
                            active.fetch_sub(1, Ordering::Relaxed);
                            drop(permit);
                        });
                    }
                    Err(e) => warn!("Accept error: {}", e),
                },
            }
        }

        info!("SOCKS5 relay stopping, waiting on {} connections", connections.len());
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("Aborting {} SOCKS5 connections still open after {:?}", connections.len(), SHUTDOWN_GRACE);
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    config: &ProxyConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let handshake = async {
        negotiate(&mut stream, config).await?;
        read_request(&mut stream).await
    };
    let deadline = Duration::from_secs(config.handshake_timeout_secs);
    let target = tokio::select! {
        result = tokio::time::timeout(deadline, handshake) => match result {
            Ok(target) => target?,
            Err(_) => return Err(ProxyError::HandshakeTimeout),
        },
        _ = stopped(&mut shutdown) => return Err(ProxyError::ShuttingDown),
    };
    debug!("SOCKS5 CONNECT to {}", target);

    let dial = tokio::select! {
        dial = connect(&target, Duration::from_secs(config.connect_timeout_secs)) => dial,
        _ = stopped(&mut shutdown) => return Err(ProxyError::ShuttingDown),
    };
    let remote = match dial {
        Ok(remote) => remote,
        Err(e) => {
            warn!("Failed to connect to {}: {}", target, e);
            let code = match e {
                ProxyError::ConnectTimeout(_) => REPLY_HOST_UNREACHABLE,
                _ => REPLY_CONNECTION_REFUSED,
            };
            send_reply(&mut stream, code, None).await?;
            return Err(e);
        }
    };

    send_reply(&mut stream, REPLY_SUCCESS, remote.local_addr().ok()).await?;
    relay(stream, remote, config.buffer_size, shutdown).await
}

/// Method selection and, when configured, username/password auth
async fn negotiate<S>(stream: &mut S, config: &ProxyConfig) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    if buf[0] != SOCKS5_VERSION {
        return Err(ProxyError::InvalidVersion(buf[0]));
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;

    let credentials = config.credentials();
    let wanted = if credentials.is_some() { AUTH_USERPASS } else { AUTH_NO_AUTH };
    if !methods.contains(&wanted) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(ProxyError::AuthNotSupported);
    }
    stream.write_all(&[SOCKS5_VERSION, wanted]).await?;

    let Some((username, password)) = credentials else {
        return Ok(());
    };

    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != USERPASS_VERSION {
        return Err(ProxyError::InvalidVersion(head[0]));
    }
    let mut user = vec![0u8; head[1] as usize];
    stream.read_exact(&mut user).await?;
    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut pass = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut pass).await?;

    let user_ok = constant_time_eq(&user, username.as_bytes());
    let pass_ok = constant_time_eq(&pass, password.as_bytes());
    if user_ok & pass_ok {
        stream.write_all(&[USERPASS_VERSION, 0x00]).await?;
        Ok(())
    } else {
        stream.write_all(&[USERPASS_VERSION, 0x01]).await?;
        Err(ProxyError::AuthFailed)
    }
}

async fn read_request<S>(stream: &mut S) -> Result<TargetAddr, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS5_VERSION {
        return Err(ProxyError::InvalidVersion(header[0]));
    }

    if header[1] != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
        return Err(ProxyError::UnsupportedCommand(header[1]));
    }

    let target = match header[3] {
        ADDR_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port))
        }
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let port = read_port(stream).await?;
            let domain = String::from_utf8(domain).map_err(|_| ProxyError::InvalidAddress)?;
            TargetAddr::Domain(domain, port)
        }
        ADDR_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = read_port(stream).await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port))
        }
        _ => {
            send_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED, None).await?;
            return Err(ProxyError::InvalidAddress);
        }
    };

    Ok(target)
}

async fn connect(target: &TargetAddr, timeout: Duration) -> Result<TcpStream, ProxyError> {
    let dial = async {
        match target {
            TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
            TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
        }
    };

    match tokio::time::timeout(timeout, dial).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::ConnectionFailed(e.to_string())),
        Err(_) => Err(ProxyError::ConnectTimeout(target.to_string())),
    }
}

/// Resolves once shutdown is requested; never if the sender is gone
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Copy both directions until one finishes, then drop both sockets
async fn relay(
    mut client: TcpStream,
    mut remote: TcpStream,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();

    let client_to_remote = async {
        let mut buf = vec![0u8; buffer_size];
        let mut total = 0u64;
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 { break; }
            remote_write.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        Ok::<_, std::io::Error>(total)
    };

    let remote_to_client = async {
        let mut buf = vec![0u8; buffer_size];
        let mut total = 0u64;
        loop {
            let n = remote_read.read(&mut buf).await?;
            if n == 0 { break; }
            client_write.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        Ok::<_, std::io::Error>(total)
    };

    tokio::select! {
        up = client_to_remote => debug!("Client side finished after {} bytes", up?),
        down = remote_to_client => debug!("Remote side finished after {} bytes", down?),
        _ = stopped(&mut shutdown) => debug!("Relay interrupted by shutdown"),
    }

    Ok(())
}

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to bind: {0}")]
    BindError(String),

    #[error("Invalid SOCKS version: {0:#04x}")]
    InvalidVersion(u8),

    #[error("No acceptable authentication method")]
    AuthNotSupported,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Invalid address")]
    InvalidAddress,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::JoinHandle;

    fn local_config() -> ProxyConfig {
        ProxyConfig {
            enabled: true,
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    async fn spawn_relay(config: ProxyConfig) -> (SocketAddr, watch::Sender<bool>, JoinHandle<Result<(), ProxyError>>) {
        let relay = Socks5Relay::bind(config).await.unwrap();
        let addr = relay.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(relay.run(rx));
        (addr, tx, handle)
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn connect_request(target: SocketAddr) -> Vec<u8> {
        let mut req = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00, ADDR_IPV4];
        match target.ip() {
            IpAddr::V4(ip) => req.extend_from_slice(&ip.octets()),
            IpAddr::V6(_) => unreachable!(),
        }
        req.extend_from_slice(&target.port().to_be_bytes());
        req
    }

    async fn greet(client: &mut TcpStream, methods: &[u8]) -> [u8; 2] {
        let mut hello = vec![SOCKS5_VERSION, methods.len() as u8];
        hello.extend_from_slice(methods);
        client.write_all(&hello).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_connect_and_relay() {
        let echo = echo_server().await;
        let (addr, shutdown, handle) = spawn_relay(local_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(greet(&mut client, &[AUTH_NO_AUTH]).await, [SOCKS5_VERSION, AUTH_NO_AUTH]);

        client.write_all(&connect_request(echo)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCESS);
        assert_eq!(reply[3], ADDR_IPV4);

        client.write_all(b"ping").await.unwrap();
        let mut pong = [0u8; 4];
        client.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"ping");

        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_no_acceptable_method() {
        let (addr, _shutdown, _handle) = spawn_relay(local_config()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(greet(&mut client, &[AUTH_USERPASS]).await, [SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]);
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let (addr, _shutdown, _handle) = spawn_relay(local_config()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        greet(&mut client, &[AUTH_NO_AUTH]).await;

        // BIND
        client.write_all(&[SOCKS5_VERSION, 0x02, 0x00, ADDR_IPV4, 127, 0, 0, 1, 0, 80]).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_unknown_address_type() {
        let (addr, _shutdown, _handle) = spawn_relay(local_config()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        greet(&mut client, &[AUTH_NO_AUTH]).await;

        client.write_all(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, 0x09]).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_ADDRESS_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_dial_failure_is_refused() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (addr, _shutdown, _handle) = spawn_relay(local_config()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        greet(&mut client, &[AUTH_NO_AUTH]).await;

        client.write_all(&connect_request(closed)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_CONNECTION_REFUSED);
    }

    fn domain_request(host: &str, port: u16) -> Vec<u8> {
        let mut req = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00, ADDR_DOMAIN, host.len() as u8];
        req.extend_from_slice(host.as_bytes());
        req.extend_from_slice(&port.to_be_bytes());
        req
    }

    #[tokio::test]
    async fn test_dial_timeout_is_host_unreachable() {
        let config = ProxyConfig { connect_timeout_secs: 0, ..local_config() };
        let (addr, _shutdown, _handle) = spawn_relay(config).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        greet(&mut client, &[AUTH_NO_AUTH]).await;

        // name lookup runs off-thread, so a zero deadline always expires first
        client.write_all(&domain_request("localhost", 9)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_HOST_UNREACHABLE);
    }

    #[tokio::test]
    async fn test_remote_close_ends_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"bye").await.unwrap();
        });

        let (addr, _shutdown, _handle) = spawn_relay(local_config()).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        greet(&mut client, &[AUTH_NO_AUTH]).await;
        client.write_all(&connect_request(target)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCESS);

        // the client socket only closes once the connection task is done
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut received))
            .await
            .expect("relay kept the client open")
            .unwrap();
        assert_eq!(received, b"bye");
    }

    #[tokio::test]
    async fn test_idle_client_releases_slot() {
        let config = ProxyConfig { max_connections: 1, handshake_timeout_secs: 1, ..local_config() };
        let (addr, _shutdown, _handle) = spawn_relay(config).await;

        let mut idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(3), greet(&mut client, &[AUTH_NO_AUTH]))
            .await
            .expect("second client was never served");
        assert_eq!(reply, [SOCKS5_VERSION, AUTH_NO_AUTH]);

        // the idle client was dropped by the relay
        let mut buf = [0u8; 1];
        assert_eq!(idle.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn test_shutdown_with_client_mid_handshake() {
        let (addr, shutdown, handle) = spawn_relay(local_config()).await;

        let _silent = TcpStream::connect(addr).await.unwrap();
        let mut greeted = TcpStream::connect(addr).await.unwrap();
        greet(&mut greeted, &[AUTH_NO_AUTH]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run() did not return after shutdown")
            .unwrap()
            .unwrap();
    }

    fn auth_config() -> ProxyConfig {
        ProxyConfig {
            username: Some("relay".into()),
            password: Some("s3cret".into()),
            ..local_config()
        }
    }

    async fn authenticate(client: &mut TcpStream, user: &str, pass: &str) -> [u8; 2] {
        let mut msg = vec![USERPASS_VERSION, user.len() as u8];
        msg.extend_from_slice(user.as_bytes());
        msg.push(pass.len() as u8);
        msg.extend_from_slice(pass.as_bytes());
        client.write_all(&msg).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        reply
    }

    #[tokio::test]
    async fn test_username_password_auth() {
        let echo = echo_server().await;
        let (addr, _shutdown, _handle) = spawn_relay(auth_config()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(greet(&mut client, &[AUTH_NO_AUTH, AUTH_USERPASS]).await, [SOCKS5_VERSION, AUTH_USERPASS]);
        assert_eq!(authenticate(&mut client, "relay", "s3cret").await, [USERPASS_VERSION, 0x00]);

        client.write_all(&connect_request(echo)).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCESS);

        let mut denied = TcpStream::connect(addr).await.unwrap();
        greet(&mut denied, &[AUTH_USERPASS]).await;
        assert_eq!(authenticate(&mut denied, "relay", "wrong!").await, [USERPASS_VERSION, 0x01]);

        // no-auth clients are turned away when credentials are set
        let mut anon = TcpStream::connect(addr).await.unwrap();
        assert_eq!(greet(&mut anon, &[AUTH_NO_AUTH]).await, [SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]);
    }

    #[test]
    fn test_reply_frame_layout() {
        let frame = reply_frame(REPLY_SUCCESS, Some("[::1]:8080".parse().unwrap()));
        assert_eq!(frame.len(), 4 + 16 + 2);
        assert_eq!(frame[3], ADDR_IPV6);
        assert_eq!(&frame[20..], &8080u16.to_be_bytes());

        assert_eq!(reply_frame(REPLY_HOST_UNREACHABLE, None), vec![5, 4, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_proxy_config() {
        let config = ProxyConfig::default();
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.handshake_timeout_secs, 10);
        assert!(config.memory_estimate() < 1024 * 1024);
        assert!(config.credentials().is_none());
    }
}
