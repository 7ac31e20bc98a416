//! TCP acceptor for hexlisten.
//!
//! Binds the listening socket, accepts connections, registers each one and
//! hands it to a dedicated worker thread. Connections beyond the registry
//! capacity are closed immediately.

use crate::config::{AcceptErrorPolicy, Config};
use crate::registry::{ConnectionDescriptor, ConnectionRegistry, RegistryError};
use crate::worker::Worker;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often the drain loop checks for finished workers.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Pause after a failed accept. A pending connection that cannot be accepted
/// (EMFILE, ENFILE) stays queued and would fail again immediately.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    Socket(io::Error),
    Bind(SocketAddr, io::Error),
    Listen(io::Error),
    Accept(io::Error),
    Spawn(usize, io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Socket(e) => write!(f, "Socket creation failed: {}", e),
            ServerError::Bind(addr, e) => write!(f, "Socket bind to {} failed: {}", addr, e),
            ServerError::Listen(e) => write!(f, "Socket listen failed: {}", e),
            ServerError::Accept(e) => write!(f, "Socket accept failed: {}", e),
            ServerError::Spawn(index, e) => {
                write!(f, "Failed to launch worker for connection {}: {}", index, e)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Socket(e)
            | ServerError::Bind(_, e)
            | ServerError::Listen(e)
            | ServerError::Accept(e)
            | ServerError::Spawn(_, e) => Some(e),
        }
    }
}

/// Triggers a graceful shutdown of a running server from another thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake_addr: SocketAddr,
}

impl ShutdownHandle {
    /// Request shutdown and wake the acceptor if it is blocked in `accept`.
    ///
    /// Returns false if shutdown was already requested.
    pub fn shutdown(&self) -> bool {
        if self.flag.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(e) = TcpStream::connect_timeout(&self.wake_addr, Duration::from_secs(1)) {
            debug!(error = %e, "Wake-up connection failed");
        }
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Server instance
pub struct Server {
    listener: Socket,
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<AtomicBool>,
    accept_errors: AcceptErrorPolicy,
    drain_timeout: Duration,
}

impl Server {
    /// Create the listening socket. Any failure here is fatal.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener = create_listener(addr, config.max_connections)?;
        let local_addr = listener
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);

        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        info!(
            address = %local_addr,
            capacity = registry.capacity(),
            "Socket is listening at {} ...",
            local_addr
        );

        Ok(Server {
            listener,
            local_addr,
            registry,
            shutdown: Arc::new(AtomicBool::new(false)),
            accept_errors: config.accept_errors,
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            wake_addr: wake_addr(self.local_addr),
        }
    }

    /// Accept connections until shutdown is requested, then drain workers.
    pub fn run(self) -> Result<(), ServerError> {
        let result = self.accept_loop();
        self.drain();
        result
    }

    fn accept_loop(&self) -> Result<(), ServerError> {
        loop {
            let accepted = self.listener.accept();

            if self.shutdown.load(Ordering::Acquire) {
                info!("Shutdown requested, no longer accepting connections");
                return Ok(());
            }

            match accepted {
                Ok((socket, addr)) => self.handle_accept(socket, addr)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => self.handle_accept_error(e)?,
            }
        }
    }

    /// Apply the accept error policy to a failed `accept`.
    fn handle_accept_error(&self, e: io::Error) -> Result<(), ServerError> {
        match self.accept_errors {
            AcceptErrorPolicy::Continue => {
                error!(error = %e, "Failed to accept connection");
                std::thread::sleep(ACCEPT_ERROR_BACKOFF);
                Ok(())
            }
            AcceptErrorPolicy::Fatal => {
                error!(error = %e, "Failed to accept connection, stopping");
                Err(ServerError::Accept(e))
            }
        }
    }

    fn handle_accept(&self, socket: Socket, addr: SockAddr) -> Result<(), ServerError> {
        let fd = socket.as_raw_fd();
        let peer = match addr.as_socket() {
            Some(peer) => peer,
            None => {
                warn!(fd, "Accepted connection without an IP peer address, closing");
                return Ok(());
            }
        };

        let stream: Arc<TcpStream> = Arc::new(socket.into());
        let worker_stream = Arc::clone(&stream);

        let index = match self.registry.register(ConnectionDescriptor::new(stream, peer)) {
            Ok(index) => index,
            Err(e) => {
                // Both shares of the handle are dropped here, closing the connection.
                warn!("{}", rejected_message(fd, peer, &e));
                return Ok(());
            }
        };
        debug!(conn = index, fd, peer = %peer, "Connection registered");
        info!("{}", accepted_message(index, fd, &addr, peer));

        let worker = Worker::new(
            index,
            worker_stream,
            Arc::clone(&self.registry),
            Arc::clone(&self.shutdown),
        );

        match worker.spawn() {
            Ok(handle) => {
                // A handle coming back means the worker already released its slot.
                let _ = self.registry.attach_worker(index, handle);
                Ok(())
            }
            Err(e) => {
                error!(conn = index, error = %e, "Failed to launch worker");
                self.registry.release(index);
                Err(ServerError::Spawn(index, e))
            }
        }
    }

    /// Close every connection and wait, up to the drain timeout, for workers.
    fn drain(&self) {
        let workers = self.registry.drain_workers();
        let open = self.registry.shutdown_all();
        info!(connections = open, workers = workers.len(), "Draining connection workers");

        let stragglers = wait_for_workers(workers, self.drain_timeout);
        if stragglers > 0 || !self.registry.is_empty() {
            warn!(
                workers = stragglers,
                connections = self.registry.len(),
                "Drain timeout reached, abandoning workers"
            );
        } else {
            info!("Server shutdown complete");
        }
    }
}

/// Create the listening socket with address reuse and the given backlog.
fn create_listener(addr: SocketAddr, backlog: usize) -> Result<Socket, ServerError> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(|e| {
        error!(error = %e, "Socket creation failed");
        ServerError::Socket(e)
    })?;
    socket.set_reuse_address(true).map_err(ServerError::Socket)?;
    info!("Socket created");

    socket.bind(&addr.into()).map_err(|e| {
        error!(address = %addr, error = %e, "Socket bind failed");
        ServerError::Bind(addr, e)
    })?;
    info!(address = %addr, "Socket bound");

    let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
    socket.listen(backlog).map_err(|e| {
        error!(error = %e, "Socket listen failed");
        ServerError::Listen(e)
    })?;

    Ok(socket)
}

/// Per-accept log line: slot index, fd, address length, family and peer.
fn accepted_message(index: usize, fd: RawFd, addr: &SockAddr, peer: SocketAddr) -> String {
    format!(
        "Socket accepted a new connection with conn = {}, connfd = {}, received address len = {}, client ip address family = {}, client ip address = {}",
        index,
        fd,
        addr.len(),
        addr.family(),
        peer
    )
}

fn rejected_message(fd: RawFd, peer: SocketAddr, reason: &RegistryError) -> String {
    format!(
        "Connection rejected: {}, connfd = {}, client ip address = {}",
        reason, fd, peer
    )
}

/// Loopback address that reaches a listener bound to `local`.
fn wake_addr(local: SocketAddr) -> SocketAddr {
    let ip = match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local.port())
}

/// Join workers as they finish. Returns how many were still running at the deadline.
fn wait_for_workers(workers: Vec<(usize, JoinHandle<()>)>, timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    let mut pending = workers;

    loop {
        let (finished, running): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|(_, h)| h.is_finished());

        for (index, handle) in finished {
            if handle.join().is_err() {
                warn!(conn = index, "Worker panicked");
            } else {
                debug!(conn = index, "Worker stopped");
            }
        }

        pending = running;
        if pending.is_empty() || Instant::now() >= deadline {
            return pending.len();
        }
        std::thread::sleep(DRAIN_POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::thread;

    fn test_config(max_connections: usize) -> Config {
        Config {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            max_connections,
            drain_timeout_secs: 2,
            ..Config::default()
        }
    }

    /// Bind on an ephemeral port and run the acceptor on a background thread.
    fn start(
        max_connections: usize,
    ) -> (
        SocketAddr,
        Arc<ConnectionRegistry>,
        ShutdownHandle,
        thread::JoinHandle<Result<(), ServerError>>,
    ) {
        let server = Server::bind(&test_config(max_connections)).unwrap();
        let addr = server.local_addr();
        let registry = server.registry();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());
        (addr, registry, shutdown, handle)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// True once the server has closed the connection.
    fn closed_by_server(stream: &mut TcpStream) -> bool {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 16];
        match stream.read(&mut buf) {
            Ok(0) => true,
            Err(e) => e.kind() == io::ErrorKind::ConnectionReset,
            Ok(_) => false,
        }
    }

    #[test]
    fn test_wake_addr() {
        assert_eq!(
            wake_addr("0.0.0.0:8080".parse().unwrap()),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            wake_addr("[::]:9000".parse().unwrap()),
            "[::1]:9000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            wake_addr("10.0.0.1:1".parse().unwrap()),
            "10.0.0.1:1".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = test_config(1);
        config.port = taken.local_addr().unwrap().port();

        match Server::bind(&config) {
            Err(ServerError::Bind(addr, _)) => assert_eq!(addr.port(), config.port),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("bind should fail on a port in use"),
        }
    }

    #[test]
    fn test_connections_get_sequential_slots() {
        let (addr, registry, shutdown, handle) = start(10);
        let mut clients = Vec::new();

        for expected in 0..10 {
            let client = TcpStream::connect(addr).unwrap();
            let local = client.local_addr().unwrap();
            clients.push(client);
            wait_until(|| registry.len() == expected + 1);

            let info = registry.get(expected).unwrap();
            assert_eq!(info.peer, local);
        }

        shutdown.shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_connection_beyond_capacity_rejected() {
        let (addr, registry, shutdown, handle) = start(2);

        let mut first = TcpStream::connect(addr).unwrap();
        let mut second = TcpStream::connect(addr).unwrap();
        wait_until(|| registry.len() == 2);

        let mut third = TcpStream::connect(addr).unwrap();
        assert!(closed_by_server(&mut third));
        assert_eq!(registry.len(), 2);

        // earlier connections are still serviced
        first.write_all(b"hello\n").unwrap();
        second.write_all(b"world\n").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(registry.len(), 2);

        shutdown.shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_peer_close_frees_slot() {
        let (addr, registry, shutdown, handle) = start(1);

        let mut client = TcpStream::connect(addr).unwrap();
        wait_until(|| registry.len() == 1);
        client.write_all(b"hello\n").unwrap();
        drop(client);
        wait_until(|| registry.is_empty());

        // the freed slot is available again
        let _client = TcpStream::connect(addr).unwrap();
        wait_until(|| registry.len() == 1);
        assert!(registry.get(0).is_some());

        shutdown.shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_zero_byte_connection() {
        let (addr, registry, shutdown, handle) = start(2);

        let client = TcpStream::connect(addr).unwrap();
        wait_until(|| registry.len() == 1);
        drop(client);
        wait_until(|| registry.is_empty());

        shutdown.shutdown();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_closes_open_connections() {
        let (addr, registry, shutdown, handle) = start(4);

        let mut a = TcpStream::connect(addr).unwrap();
        let mut b = TcpStream::connect(addr).unwrap();
        wait_until(|| registry.len() == 2);

        assert!(shutdown.shutdown());
        assert!(!shutdown.shutdown());
        assert!(shutdown.is_shutdown());
        handle.join().unwrap().unwrap();

        assert!(closed_by_server(&mut a));
        assert!(closed_by_server(&mut b));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_wait_for_workers_reports_stragglers() {
        let done = thread::spawn(|| {});
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let stuck = thread::spawn(move || {
            let _ = rx.recv();
        });

        let remaining = wait_for_workers(vec![(0, done), (1, stuck)], Duration::from_millis(100));
        assert_eq!(remaining, 1);
        drop(tx);
    }

    #[test]
    fn test_accepted_message_carries_index() {
        let peer: SocketAddr = "127.0.0.1:49686".parse().unwrap();
        let addr = SockAddr::from(peer);

        assert_eq!(
            accepted_message(3, 7, &addr, peer),
            "Socket accepted a new connection with conn = 3, connfd = 7, received address len = 16, \
             client ip address family = 2, client ip address = 127.0.0.1:49686"
        );
    }

    #[test]
    fn test_rejected_message() {
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let reason = RegistryError::CapacityExceeded { capacity: 10 };

        assert_eq!(
            rejected_message(9, peer, &reason),
            "Connection rejected: registry full (capacity 10), connfd = 9, client ip address = 127.0.0.1:5000"
        );
    }

    #[test]
    fn test_accept_error_continue_backs_off() {
        let server = Server::bind(&test_config(1)).unwrap();
        assert_eq!(server.accept_errors, AcceptErrorPolicy::Continue);

        let start = Instant::now();
        let emfile = io::Error::from_raw_os_error(24);
        assert!(server.handle_accept_error(emfile).is_ok());
        assert!(start.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[test]
    fn test_accept_error_fatal_stops() {
        let mut config = test_config(1);
        config.accept_errors = AcceptErrorPolicy::Fatal;
        let server = Server::bind(&config).unwrap();

        match server.handle_accept_error(io::Error::from_raw_os_error(24)) {
            Err(ServerError::Accept(e)) => assert_eq!(e.raw_os_error(), Some(24)),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
