//! Per-interface DHCPv4 listeners.
//!
//! Each server binds `0.0.0.0:67` restricted to one interface so that
//! broadcasts are received and several pools can be served side by side.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DhcpError;
use crate::handler::{SERVER_PORT, handle_datagram};
use crate::lease::LeaseTable;

const MAX_DATAGRAM: usize = 1500;

fn bind_socket(nic: &str) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    #[cfg(target_os = "linux")]
    socket.bind_device(Some(nic.as_bytes()))?;
    #[cfg(not(target_os = "linux"))]
    let _ = nic;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SERVER_PORT));
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// One listener bound to one interface.
#[derive(Debug)]
pub struct DhcpServer {
    nic: String,
    server_ip: Ipv4Addr,
    socket: UdpSocket,
    leases: Arc<LeaseTable>,
}

impl DhcpServer {
    /// Binds the listening socket. Must be called inside a Tokio runtime.
    pub fn bind(nic: &str, server_ip: Ipv4Addr, leases: Arc<LeaseTable>) -> Result<Self, DhcpError> {
        let bind_err = |source| DhcpError::Bind {
            nic: nic.to_string(),
            source,
        };
        let std_socket = bind_socket(nic).map_err(bind_err)?;
        let socket = UdpSocket::from_std(std_socket).map_err(bind_err)?;
        Ok(Self {
            nic: nic.to_string(),
            server_ip,
            socket,
            leases,
        })
    }

    /// Serves packets until `shutdown` flips to true or its sender is dropped.
    ///
    /// Parse and write errors are logged and never end the loop.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        info!(nic = %self.nic, server_ip = %self.server_ip, "DHCP server listening on 0.0.0.0:67");
        let mut buf = [0_u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            error!(nic = %self.nic, error = %e, "Failed to read from dhcp socket");
                            continue;
                        }
                    };
                    self.handle(&buf[..len], peer).await;
                }
            }
        }
        info!(nic = %self.nic, "DHCP server stopped");
    }

    async fn handle(&self, packet: &[u8], peer: SocketAddr) {
        match handle_datagram(&self.leases, packet, peer) {
            Ok(Some((reply, target))) => {
                if let Err(e) = self.socket.send_to(&reply, target).await {
                    warn!(nic = %self.nic, %target, error = %e, "Failed to send dhcp reply");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(nic = %self.nic, %peer, error = %e, "Dropping malformed packet"),
        }
    }
}

#[derive(Debug)]
struct RunningServer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Registry of running servers, at most one per interface.
#[derive(Debug)]
pub struct DhcpServerSet {
    leases: Arc<LeaseTable>,
    servers: Mutex<HashMap<String, RunningServer>>,
}

impl DhcpServerSet {
    /// Creates an empty registry serving from `leases`.
    pub fn new(leases: Arc<LeaseTable>) -> Self {
        Self {
            leases,
            servers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RunningServer>> {
        self.servers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease table the servers answer from.
    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    /// Binds a server on `nic` and serves in the background.
    ///
    /// Bind failures are returned; a second server on the same interface
    /// is refused.
    pub fn run(&self, nic: &str, server_ip: Ipv4Addr) -> Result<(), DhcpError> {
        let mut servers = self.lock();
        if servers.contains_key(nic) {
            return Err(DhcpError::InterfaceInUse(nic.to_string()));
        }
        let server = DhcpServer::bind(nic, server_ip, Arc::clone(&self.leases))?;
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(server.serve(rx));
        servers.insert(nic.to_string(), RunningServer { shutdown, handle });
        Ok(())
    }

    /// Whether a server runs on `nic`.
    pub fn is_running(&self, nic: &str) -> bool {
        self.lock().contains_key(nic)
    }

    /// Stops the server on `nic` and waits for its socket to close.
    pub async fn stop(&self, nic: &str) {
        let Some(running) = self.lock().remove(nic) else {
            debug!(nic = %nic, "No dhcp server running");
            return;
        };
        let _ = running.shutdown.send(true);
        if let Err(e) = running.handle.await {
            warn!(nic = %nic, error = %e, "DHCP server task failed");
        }
    }

    /// Stops every server.
    pub async fn stop_all(&self) {
        let nics: Vec<String> = self.lock().keys().cloned().collect();
        for nic in nics {
            self.stop(&nic).await;
        }
    }
}
