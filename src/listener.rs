//! Listening sockets and the accept loop.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;

use crate::config::{AddressFamily, ServerConfig};
use crate::engine::{self, ConnectionContext};
use crate::Server;

/// How long the accept loop waits before checking whether it should stop.
const POLL_INTERVAL_SECS: libc::time_t = 1;

/// Pause after running out of file descriptors, so the loop does not spin.
const EXHAUSTED_BACKOFF: Duration = Duration::from_millis(100);

/// A bound socket and the address it listens on.
#[derive(Debug)]
pub struct BoundListener {
    pub socket: TcpListener,
    pub addr: SocketAddr,
}

/// Addresses to listen on for the configured host, port and family.
pub fn resolve(config: &ServerConfig) -> Result<Vec<SocketAddr>> {
    let port = config.port;
    let addrs: Vec<SocketAddr> = match (&config.host, config.family) {
        (None, AddressFamily::Unspecified | AddressFamily::Inet) => {
            vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))]
        }
        (None, AddressFamily::Inet6) => vec![SocketAddr::from((Ipv6Addr::UNSPECIFIED, port))],
        (Some(host), family) => {
            let mut seen = HashSet::new();
            (host.as_str(), port)
                .to_socket_addrs()
                .with_context(|| format!("failed to resolve {}", host))?
                .filter(|addr| match family {
                    AddressFamily::Unspecified => true,
                    AddressFamily::Inet => addr.is_ipv4(),
                    AddressFamily::Inet6 => addr.is_ipv6(),
                })
                .filter(|addr| seen.insert(*addr))
                .collect()
        }
    };
    if addrs.is_empty() {
        return Err(anyhow!("no addresses to listen on"));
    }
    Ok(addrs)
}

/// Bind one listening socket per resolved address.
pub fn bind(config: &ServerConfig) -> Result<Vec<BoundListener>> {
    resolve(config)?
        .into_iter()
        .map(|addr| {
            // Sets `SO_REUSEADDR` implicitly.
            let socket = TcpListener::bind(addr)
                .with_context(|| format!("failed to create listening socket for {}", addr))?;
            let addr = socket.local_addr().unwrap_or(addr);
            println!("listening on: http://{}/", addr);
            Ok(BoundListener { socket, addr })
        })
        .collect()
}

/// Name of this machine.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    match nix::unistd::gethostname(&mut buf) {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            log::warn!("failed to get hostname: {}", e);
            "localhost".to_string()
        }
    }
}

fn configure(stream: &TcpStream, timeout: Option<Duration>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(timeout)?;
    stream.set_write_timeout(timeout)
}

/// Accept connections until `is_running` returns false, serving each on its own thread.
pub fn serve(
    listeners: &[BoundListener],
    server: Arc<Server>,
    is_running: fn() -> bool,
) -> Result<()> {
    while is_running() {
        let mut recv_set = FdSet::new();
        for listener in listeners {
            recv_set.insert(listener.socket.as_raw_fd());
        }
        let mut timeout = TimeVal::from(libc::timeval {
            tv_sec: POLL_INTERVAL_SECS,
            tv_usec: 0,
        });
        match select(None, Some(&mut recv_set), None, None, Some(&mut timeout)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => {
                if e.as_errno() == Some(Errno::EINTR) {
                    continue; // interrupted by signal
                }
                return Err(e).context("select() failed");
            }
        }

        for (index, listener) in listeners.iter().enumerate() {
            if recv_set.contains(listener.socket.as_raw_fd()) {
                accept_connection(index, listener, &server);
            }
        }
    }
    Ok(())
}

fn accept_connection(index: usize, listener: &BoundListener, server: &Arc<Server>) {
    let (stream, peer) = match listener.socket.accept() {
        Ok((stream, peer)) => (stream, peer),
        Err(e) => {
            log::warn!("accept() failed on {}: {}", listener.addr, e);
            if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                thread::sleep(EXHAUSTED_BACKOFF);
            }
            return;
        }
    };
    log::trace!("accepted {} on {}", peer, listener.addr);
    if let Err(e) = configure(&stream, server.config.timeout) {
        log::warn!("failed to configure connection from {}: {}", peer, e);
        return;
    }

    let server = Arc::clone(server);
    let context = ConnectionContext {
        stream,
        peer,
        listener: index,
    };
    let spawned = thread::Builder::new()
        .name(format!("conn {}", peer))
        .spawn(move || engine::run(&server, context));
    if let Err(e) = spawned {
        log::warn!("failed to start thread for {}: {}", peer, e);
    }
}
