use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::connection::{ConnectionGuard, ConnectionTracker};
use super::http_handler::HttpHandler;

/// Plain HTTP listener feeding every request through the [`HttpHandler`].
pub struct ProxyServer {
    bind: String,
    max_connections: usize,
    handler: Arc<HttpHandler>,
    connections: Arc<ConnectionTracker>,
}

impl ProxyServer {
    pub fn new(bind: impl Into<String>, max_connections: usize, handler: Arc<HttpHandler>) -> Self {
        Self {
            bind: bind.into(),
            max_connections,
            handler,
            connections: Arc::new(ConnectionTracker::new()),
        }
    }

    pub async fn run(&self) -> Result<()> {
        let listener = bind_tcp_listener(&self.bind)?;
        let listener = TcpListener::from_std(listener)?;
        info!(addr = %self.bind, "HTTP listener started");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    warn!("Failed to accept TCP connection: {}", err);
                    continue;
                }
            };

            let Some(guard) = self.connections.try_register(peer_addr, self.max_connections) else {
                debug!(peer = %peer_addr, "Max connections reached, dropping");
                drop(stream);
                continue;
            };

            let handler = Arc::clone(&self.handler);
            let connections = Arc::clone(&self.connections);
            tokio::spawn(handle_connection(stream, peer_addr, handler, connections, guard));
        }
    }
}

fn bind_tcp_listener(addr: &str) -> Result<std::net::TcpListener> {
    let sock_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid bind address: {}", addr))?;

    let domain = if sock_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&sock_addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket.listen(8192)?;

    Ok(socket.into())
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<HttpHandler>,
    connections: Arc<ConnectionTracker>,
    guard: ConnectionGuard,
) {
    let conn_id = guard.id();

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let connections = Arc::clone(&connections);
        async move {
            connections.increment_requests(conn_id);
            Ok::<_, hyper::Error>(handler.handle(req, peer).await)
        }
    });

    let conn = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service);

    if let Err(err) = conn.await {
        debug!(peer = %peer, connection_id = conn_id, error = %err, "HTTP connection error");
    }

    drop(guard);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_rejects_bad_address() {
        assert!(bind_tcp_listener("not-an-address").is_err());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = bind_tcp_listener("127.0.0.1:0").unwrap();
        let listener = TcpListener::from_std(listener).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
