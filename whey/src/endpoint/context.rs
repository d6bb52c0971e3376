//! Per-scope contexts: connection, session, request.
//!
//! Contexts are immutable once built and nest by ownership: a request
//! context holds its session (if any) and connection; neither can outlive
//! the connection context. Each carries a fresh id and a `tracing` span
//! scoped to it. Contexts travel with the work itself (the endpoint puts
//! them into request extensions), while a registry of weak references
//! allows lookup of live connections by id from the outside.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, Weak};
use std::{fmt, sync::Arc};

use tracing::Span;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);
static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

fn next(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed)
}

/// A process-unique context identifier, rendered like `c-0000002a`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId {
    prefix: char,
    seq: u64,
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:08x}", self.prefix, self.seq)
    }
}

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Context for one accepted socket.
pub struct ConnectionContext {
    id: ContextId,
    remote: SocketAddr,
    span: Span,
}

impl ConnectionContext {
    pub fn new(endpoint: &str, remote: SocketAddr) -> Arc<Self> {
        let id = ContextId {
            prefix: 'c',
            seq: next(&NEXT_CONNECTION),
        };
        let span = tracing::info_span!("connection", endpoint, id = %id, remote = %remote);
        Arc::new(Self { id, remote, span })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Context for one TLS (or HTTP/2) session on a connection.
pub struct SessionContext {
    id: ContextId,
    connection: Arc<ConnectionContext>,
    span: Span,
}

impl SessionContext {
    pub fn new(connection: Arc<ConnectionContext>) -> Arc<Self> {
        let id = ContextId {
            prefix: 's',
            seq: next(&NEXT_SESSION),
        };
        let span = tracing::info_span!(parent: connection.span(), "session", id = %id);
        Arc::new(Self {
            id,
            connection,
            span,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn connection(&self) -> &Arc<ConnectionContext> {
        &self.connection
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

/// Context for one request, inheriting from its session or connection.
pub struct RequestContext {
    id: ContextId,
    connection: Arc<ConnectionContext>,
    session: Option<Arc<SessionContext>>,
    span: Span,
}

impl RequestContext {
    pub fn new(
        connection: Arc<ConnectionContext>,
        session: Option<Arc<SessionContext>>,
    ) -> Arc<Self> {
        let id = ContextId {
            prefix: 'r',
            seq: next(&NEXT_REQUEST),
        };
        let parent = session
            .as_ref()
            .map(|session| session.span())
            .unwrap_or_else(|| connection.span());
        let span = tracing::info_span!(parent: parent, "request", id = %id);
        Arc::new(Self {
            id,
            connection,
            session,
            span,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn connection(&self) -> &Arc<ConnectionContext> {
        &self.connection
    }

    pub fn session(&self) -> Option<&Arc<SessionContext>> {
        self.session.as_ref()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .finish()
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("connection", &self.connection.id())
            .finish()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("connection", &self.connection.id())
            .field("session", &self.session.as_ref().map(|session| session.id()))
            .finish()
    }
}

/// Lookup of live connection contexts by id.
///
/// Entries are weak: dropping the last strong reference (the connection
/// task's) makes the entry dead, and dead entries are pruned on every
/// insert and lookup rather than requiring an unregister call.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    connections: Mutex<HashMap<ContextId, Weak<ConnectionContext>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, context: &Arc<ConnectionContext>) {
        let mut connections = self.lock();
        connections.retain(|_, weak| weak.strong_count() > 0);
        connections.insert(context.id(), Arc::downgrade(context));
    }

    pub fn connection(&self, id: ContextId) -> Option<Arc<ConnectionContext>> {
        let mut connections = self.lock();
        connections.retain(|_, weak| weak.strong_count() > 0);
        connections.get(&id).and_then(Weak::upgrade)
    }

    /// Snapshot of the currently live connections.
    pub fn connections(&self) -> Vec<Arc<ConnectionContext>> {
        let mut connections = self.lock();
        connections.retain(|_, weak| weak.strong_count() > 0);
        connections.values().filter_map(Weak::upgrade).collect()
    }

    pub fn len(&self) -> usize {
        let mut connections = self.lock();
        connections.retain(|_, weak| weak.strong_count() > 0);
        connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContextId, Weak<ConnectionContext>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
