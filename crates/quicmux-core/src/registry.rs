//! Process-wide registry of shared transport contexts.
//!
//! Consumers asking for a client connection to the same resolved peer
//! address and ALPN share one [`QuicConnection`]; consumers asking for a
//! server on the same bind address share one [`QuicServer`]. Each
//! acquisition is counted per consumer and the context is torn down when
//! the last reference is released.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transport::events::same_handler;
use crate::transport::{
    ConnectionHandler, EndpointRole, QuicConnection, QuicServer, TransportConfig,
    connect_with_users, listen_with_users, resolve_location,
};

static GLOBAL: LazyLock<Registry> = LazyLock::new(Registry::new);

/// A shared client connection or listening server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportContext {
    Client(QuicConnection),
    Server(QuicServer),
}

impl TransportContext {
    pub fn role(&self) -> EndpointRole {
        match self {
            TransportContext::Client(_) => EndpointRole::Client,
            TransportContext::Server(_) => EndpointRole::Server,
        }
    }

    pub fn connection(&self) -> Option<&QuicConnection> {
        match self {
            TransportContext::Client(conn) => Some(conn),
            TransportContext::Server(_) => None,
        }
    }

    pub fn server(&self) -> Option<&QuicServer> {
        match self {
            TransportContext::Client(_) => None,
            TransportContext::Server(server) => Some(server),
        }
    }

    fn add_user(&self, user: Arc<dyn ConnectionHandler>) {
        match self {
            TransportContext::Client(conn) => {
                conn.add_user(user);
            }
            TransportContext::Server(server) => {
                server.add_user(user);
            }
        }
    }

    fn remove_user(&self, user: &Arc<dyn ConnectionHandler>) {
        match self {
            TransportContext::Client(conn) => {
                conn.remove_user(user);
            }
            TransportContext::Server(server) => {
                server.remove_user(user);
            }
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            TransportContext::Client(conn) => conn.is_closed(),
            TransportContext::Server(server) => server.is_closed(),
        }
    }

    async fn destroy(&self) {
        match self {
            TransportContext::Client(conn) => {
                if let Err(e) = conn.disconnect(true, 0).await {
                    debug!(conn = conn.id(), error = %e, "disconnect failed");
                }
            }
            TransportContext::Server(server) => server.close().await,
        }
    }
}

struct Entry {
    addr: SocketAddr,
    /// Client ALPN; unused for servers.
    alpn: String,
    ctx: TransportContext,
    /// Consumers and how many times each acquired this context.
    users: Vec<(Arc<dyn ConnectionHandler>, usize)>,
}

impl Entry {
    fn acquire(&mut self, user: Arc<dyn ConnectionHandler>) {
        if let Some((_, count)) = self.users.iter_mut().find(|(u, _)| same_handler(u, &user)) {
            *count += 1;
            return;
        }
        self.ctx.add_user(Arc::clone(&user));
        self.users.push((user, 1));
    }

    fn reference_count(&self) -> usize {
        self.users.iter().map(|(_, count)| count).sum()
    }
}

#[derive(Default)]
struct RegistryInner {
    clients: Vec<Entry>,
    servers: Vec<Entry>,
}

impl RegistryInner {
    fn prune(&mut self) {
        self.clients.retain(|e| !e.ctx.is_closed());
        self.servers.retain(|e| !e.ctx.is_closed());
    }
}

/// Shared transport contexts keyed by address.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    /// Return the client connection to `config.location()` with the
    /// config's first ALPN, creating it if needed, and register `user`
    /// on it.
    pub async fn get_or_create_client(
        &self,
        user: Arc<dyn ConnectionHandler>,
        config: TransportConfig,
    ) -> Result<QuicConnection> {
        let addr = resolve_location(config.location()).await?;
        let alpn = config.alpn().first().cloned().unwrap_or_default();

        let mut inner = self.inner.lock().await;
        inner.prune();

        if let Some(entry) = inner
            .clients
            .iter_mut()
            .find(|e| e.addr == addr && e.alpn == alpn)
        {
            entry.acquire(Arc::clone(&user));
            debug!(peer = %addr, alpn = %alpn, refs = entry.reference_count(), "sharing client connection");
            if let TransportContext::Client(conn) = &entry.ctx {
                return Ok(conn.clone());
            }
        }

        let conn = connect_with_users(config, vec![Arc::clone(&user)]).await?;
        info!(conn = conn.id(), peer = %addr, alpn = %alpn, "registered client connection");
        inner.clients.push(Entry {
            addr,
            alpn,
            ctx: TransportContext::Client(conn.clone()),
            users: vec![(user, 1)],
        });
        Ok(conn)
    }

    /// Return the server bound at `config.location()`, creating it if
    /// needed, and register `user` on it.
    ///
    /// Sharing an existing server requires every ALPN of `config` to be
    /// accepted by that server.
    pub async fn get_or_create_server(
        &self,
        user: Arc<dyn ConnectionHandler>,
        config: TransportConfig,
    ) -> Result<QuicServer> {
        let requested = resolve_location(config.location()).await?;

        let mut inner = self.inner.lock().await;
        inner.prune();

        if requested.port() != 0
            && let Some(entry) = inner.servers.iter_mut().find(|e| e.addr == requested)
            && let TransportContext::Server(server) = &entry.ctx
        {
            let server = server.clone();
            let accepted = server.alpns();
            if !config.alpn().iter().all(|a| accepted.contains(a)) {
                return Err(Error::AlpnMismatch {
                    requested: config.alpn().to_vec(),
                    accepted: accepted.to_vec(),
                });
            }
            entry.acquire(user);
            debug!(addr = %requested, refs = entry.reference_count(), "sharing server");
            return Ok(server);
        }

        let server = listen_with_users(config, vec![Arc::clone(&user)]).await?;
        let addr = if requested.port() == 0 {
            server.local_addr()
        } else {
            requested
        };
        info!(addr = %addr, "registered server");
        inner.servers.push(Entry {
            addr,
            alpn: String::new(),
            ctx: TransportContext::Server(server.clone()),
            users: vec![(user, 1)],
        });
        Ok(server)
    }

    /// Drop one reference of `user` to `ctx`.
    ///
    /// Returns true if this destroyed the context.
    pub async fn release(&self, ctx: &TransportContext, user: &Arc<dyn ConnectionHandler>) -> bool {
        let mut inner = self.inner.lock().await;
        let list = match ctx.role() {
            EndpointRole::Client => &mut inner.clients,
            EndpointRole::Server => &mut inner.servers,
        };
        let Some(idx) = list.iter().position(|e| &e.ctx == ctx) else {
            return false;
        };

        let entry = &mut list[idx];
        if let Some(pos) = entry.users.iter().position(|(u, _)| same_handler(u, user)) {
            entry.users[pos].1 -= 1;
            if entry.users[pos].1 == 0 {
                let (removed, _) = entry.users.remove(pos);
                entry.ctx.remove_user(&removed);
            }
        }
        if !entry.users.is_empty() {
            return false;
        }

        let entry = list.remove(idx);
        drop(inner);
        info!(addr = %entry.addr, role = %entry.ctx.role(), "destroying unused context");
        entry.ctx.destroy().await;
        true
    }

    /// Number of live client connections.
    pub async fn client_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.prune();
        inner.clients.len()
    }

    /// Number of live servers.
    pub async fn server_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.prune();
        inner.servers.len()
    }
}
