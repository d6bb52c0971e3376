//! Endpoints: listening sockets that admit, classify, and dispatch
//! requests.
//!
//! An endpoint owns a read-only [`RoutingTable`] and optional references to
//! a [`RateLimiter`] and a [`RequestLogSink`], resolved by name out of the
//! component tree. Its accept loop admits connections through the
//! connection bucket, terminates TLS using the [`HostManager`]'s SNI
//! config, and serves each connection on its own task; per request it
//! consults the request bucket, walks the routing table with fallthrough,
//! and synthesizes `404`/`429`/`500` where the pipeline ends without an
//! application response.

mod context;
mod incoming;
mod io;
mod log;

pub use context::{ConnectionContext, ContextId, ContextRegistry, RequestContext, SessionContext};
pub use incoming::TcpIncoming;
pub use log::{ChannelLogSink, CompletedRequest, RequestLogSink, TracingLogSink};

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::{pin, Pin};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn, Instrument};

use self::incoming::is_transient_accept_error;
use self::io::EndpointIo;
use crate::app::{Application, Dispatch, Outcome};
use crate::body::Body;
use crate::component::{Component, StopSignal, Threadlet};
use crate::config::{EndpointConfig, Protocol};
use crate::host::HostManager;
use crate::limit::{RateLimitedWriter, RateLimiter};
use crate::problem::ProblemHandler;
use crate::routing::{Mount, RoutingTable};
use crate::Error;

const MIN_STOP_GRACE: Duration = Duration::from_secs(10);
const MAX_STOP_GRACE: Duration = Duration::from_secs(60);

/// A listener bound to an interface, port, and protocol.
pub struct Endpoint {
    name: String,
    interface: String,
    port: u16,
    shared: Arc<EndpointShared>,
    host_manager: Option<Arc<HostManager>>,
    threadlet: Threadlet,
    bound: Mutex<Option<SocketAddr>>,
}

struct EndpointShared {
    endpoint: String,
    protocol: Protocol,
    routing: RoutingTable,
    applications: HashMap<String, Arc<dyn Application>>,
    limiter: Option<Arc<RateLimiter>>,
    request_log: Option<Arc<dyn RequestLogSink>>,
    problems: Arc<ProblemHandler>,
    registry: ContextRegistry,
    stop_grace_period: Duration,
}

impl Endpoint {
    /// Builds an endpoint from its config section and already-resolved
    /// collaborators. Mount parsing, duplicate mounts, and unknown
    /// application references all fail here, at configuration time.
    pub fn new(
        config: &EndpointConfig,
        applications: &HashMap<String, Arc<dyn Application>>,
        limiter: Option<Arc<RateLimiter>>,
        request_log: Option<Arc<dyn RequestLogSink>>,
        host_manager: Option<Arc<HostManager>>,
        problems: Arc<ProblemHandler>,
    ) -> Result<Self, Error> {
        let mut routing = RoutingTable::new();
        let mut mounted: HashMap<String, Arc<dyn Application>> = HashMap::new();
        for mount_config in &config.mounts {
            let application = applications
                .get(&mount_config.application)
                .ok_or_else(|| {
                    Error::config(format!(
                        "endpoint {:?} mounts unknown application {:?}",
                        config.name, mount_config.application
                    ))
                })?;
            for at in mount_config.at.iter() {
                let mount = Mount::parse(at, &mount_config.application)?;
                routing.insert_mount(&mount)?;
            }
            mounted.insert(mount_config.application.clone(), Arc::clone(application));
        }

        let stop_grace_period = config
            .stop_grace_period
            .clamp(MIN_STOP_GRACE, MAX_STOP_GRACE);

        Ok(Self {
            name: config.name.clone(),
            interface: config.endpoint.interface.clone(),
            port: config.endpoint.port,
            shared: Arc::new(EndpointShared {
                endpoint: config.name.clone(),
                protocol: config.endpoint.protocol,
                routing,
                applications: mounted,
                limiter,
                request_log,
                problems,
                registry: ContextRegistry::new(),
                stop_grace_period,
            }),
            host_manager,
            threadlet: Threadlet::new(),
            bound: Mutex::new(None),
        })
    }

    /// The address the listener is bound to while running. With port 0 this
    /// is where the kernel put us.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.lock_bound()
    }

    /// Live connections on this endpoint.
    pub fn open_connections(&self) -> usize {
        self.shared.registry.len()
    }

    /// The endpoint's context registry.
    pub fn contexts(&self) -> &ContextRegistry {
        &self.shared.registry
    }

    fn bind_addr(&self) -> Result<SocketAddr, Error> {
        let ip = match self.interface.as_str() {
            "*" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            "::" => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            other => other.parse::<IpAddr>().map_err(|_| {
                Error::config(format!(
                    "endpoint {:?}: unparseable interface {:?}",
                    self.name, other
                ))
            })?,
        };
        Ok(SocketAddr::new(ip, self.port))
    }

    fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, Error> {
        if !self.shared.protocol.requires_tls() {
            return Ok(None);
        }
        let host_manager = self.host_manager.as_ref().ok_or_else(|| {
            Error::config(format!(
                "endpoint {:?} uses {:?} but no hosts are configured",
                self.name, self.shared.protocol
            ))
        })?;
        if !host_manager.has_hosts() {
            return Err(Error::config(format!(
                "endpoint {:?} uses {:?} but the host manager is empty",
                self.name, self.shared.protocol
            )));
        }
        let config = host_manager.server_config(self.shared.protocol);
        Ok(Some(TlsAcceptor::from(config)))
    }

    fn lock_bound(&self) -> MutexGuard<'_, Option<SocketAddr>> {
        self.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Component for Endpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn impl_init(&self, _is_reload: bool) -> Result<(), Error> {
        // Sensing only: prove the address parses and the TLS prerequisites
        // exist. No sockets are bound until start.
        self.bind_addr()?;
        self.tls_acceptor()?;
        Ok(())
    }

    async fn impl_start(&self, _is_reload: bool) -> Result<(), Error> {
        let addr = self.bind_addr()?;
        let tls = self.tls_acceptor()?;
        let incoming = TcpIncoming::bind(addr).map_err(Error::transport)?;
        let bound = incoming.local_addr().map_err(Error::transport)?;
        *self.lock_bound() = Some(bound);

        info!(
            endpoint = %self.name,
            addr = %bound,
            protocol = ?self.shared.protocol,
            "endpoint up"
        );

        self.threadlet.start(accept_loop(
            Arc::clone(&self.shared),
            incoming,
            tls,
            self.threadlet.signal(),
        ))
    }

    async fn impl_stop(&self, _will_reload: bool) -> Result<(), Error> {
        let stopped = self.threadlet.stop().await;
        *self.lock_bound() = None;
        info!(endpoint = %self.name, "endpoint down");
        stopped
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("interface", &self.interface)
            .field("port", &self.port)
            .field("protocol", &self.shared.protocol)
            .finish()
    }
}

async fn accept_loop(
    shared: Arc<EndpointShared>,
    incoming: TcpIncoming,
    tls: Option<TlsAcceptor>,
    signal: StopSignal,
) {
    let (drain_tx, drain_rx) = watch::channel(());
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = signal.when_stop_requested() => break,
            accepted = incoming.accept() => match accepted {
                Ok((stream, remote)) => {
                    connections.spawn(serve_connection(
                        Arc::clone(&shared),
                        stream,
                        remote,
                        tls.clone(),
                        drain_rx.clone(),
                    ));
                }
                Err(error) if is_transient_accept_error(&error) => {
                    debug!(endpoint = %shared.endpoint, %error, "transient accept error");
                }
                Err(error) => {
                    warn!(endpoint = %shared.endpoint, %error, "accept failed, listener closing");
                    break;
                }
            },
            Some(finished) = connections.join_next() => {
                reap_connection(&shared, finished).await;
            }
        }
    }

    // Unbind before draining so stop never races new arrivals.
    drop(incoming);
    drop(drain_rx);
    let _ = drain_tx.send(());

    let deadline = shared.stop_grace_period + Duration::from_secs(1);
    let drained = tokio::time::timeout(deadline, async {
        while let Some(finished) = connections.join_next().await {
            reap_connection(&shared, finished).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            endpoint = %shared.endpoint,
            "connections survived the drain deadline"
        );
        connections.shutdown().await;
    }
}

/// Collects one finished connection task. A clean or cancelled task is
/// routine; a panic is an uncaught problem and goes to the handler.
async fn reap_connection(shared: &EndpointShared, finished: Result<(), JoinError>) {
    let Err(error) = finished else {
        return;
    };
    if error.is_cancelled() {
        return;
    }
    shared
        .problems
        .handle_fatal(&format!("endpoint {} connection task", shared.endpoint), &error)
        .await;
}

async fn serve_connection(
    shared: Arc<EndpointShared>,
    stream: TcpStream,
    remote: SocketAddr,
    tls: Option<TlsAcceptor>,
    drain: watch::Receiver<()>,
) {
    let connection = ConnectionContext::new(&shared.endpoint, remote);
    shared.registry.register(&connection);
    let span = connection.span().clone();
    drive_connection(shared, connection, stream, tls, drain)
        .instrument(span)
        .await;
}

async fn drive_connection(
    shared: Arc<EndpointShared>,
    connection: Arc<ConnectionContext>,
    stream: TcpStream,
    tls: Option<TlsAcceptor>,
    mut drain: watch::Receiver<()>,
) {
    if let Some(limiter) = &shared.limiter {
        if !limiter.check_connection().await {
            debug!(code = "ratelimit-denied", "connection closed at admission");
            return;
        }
    }

    // The data bucket throttles the socket itself, so TLS and HTTP framing
    // count against it along with the payload they carry.
    let stream = match &shared.limiter {
        Some(limiter) => limiter.wrap_writer(stream),
        None => RateLimitedWriter::new(stream, None),
    };

    let (io, session) = match &tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => (
                EndpointIo::Tls(Box::new(tls_stream)),
                Some(SessionContext::new(Arc::clone(&connection))),
            ),
            Err(error) => {
                debug!(code = "tls-handshake", %error, "handshake failed");
                return;
            }
        },
        None => (EndpointIo::Plain(stream), None),
    };

    let service = RequestService {
        shared: Arc::clone(&shared),
        connection,
        session,
    };

    let builder = connection_builder(shared.protocol);
    let hyper_io = TokioIo::new(io);
    let hyper_service = TowerToHyperService::new(service);
    let mut conn = pin!(builder.serve_connection(hyper_io, hyper_service));

    // Serve until the connection finishes on its own or the endpoint asks
    // everyone to drain; a drain request converts into a bounded graceful
    // shutdown of this one connection.
    tokio::select! {
        result = conn.as_mut() => {
            if let Err(error) = result {
                debug!(%error, "connection ended with error");
            }
            return;
        }
        _ = drain.changed() => {
            conn.as_mut().graceful_shutdown();
        }
    }

    match tokio::time::timeout(shared.stop_grace_period, conn).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => debug!(%error, "connection ended with error"),
        Err(_) => debug!("connection closed at drain deadline"),
    }
}

fn connection_builder(protocol: Protocol) -> ConnectionBuilder<TokioExecutor> {
    let mut builder = ConnectionBuilder::new(TokioExecutor::new());
    match protocol {
        Protocol::Http2 => {
            builder = builder.http2_only();
            builder.http2().timer(TokioTimer::new());
        }
        Protocol::Http | Protocol::Https => {
            builder = builder.http1_only();
            builder.http1().timer(TokioTimer::new());
        }
    }
    builder
}

#[derive(Clone)]
struct RequestService {
    shared: Arc<EndpointShared>,
    connection: Arc<ConnectionContext>,
    session: Option<Arc<SessionContext>>,
}

impl tower_service::Service<Request<Incoming>> for RequestService {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Incoming>) -> Self::Future {
        let shared = Arc::clone(&self.shared);
        let connection = Arc::clone(&self.connection);
        let session = self.session.clone();
        Box::pin(async move { Ok(handle_request(shared, connection, session, request).await) })
    }
}

async fn handle_request(
    shared: Arc<EndpointShared>,
    connection: Arc<ConnectionContext>,
    session: Option<Arc<SessionContext>>,
    request: Request<Incoming>,
) -> Response<Body> {
    let started = tokio::time::Instant::now();
    let context = RequestContext::new(Arc::clone(&connection), session);
    let span = context.span().clone();

    async move {
        let mut request = request.map(Body::new);
        let url = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| request.uri().path().to_owned());
        let method = request.method().clone();
        request.extensions_mut().insert(Arc::clone(&context));
        request.extensions_mut().insert(Arc::clone(&connection));

        let (response, error_code) = process(shared.as_ref(), &request).await;

        if let Some(sink) = &shared.request_log {
            let completed = CompletedRequest {
                remote: connection.remote(),
                method: &method,
                url: &url,
                status: response.status(),
                response_bytes: response.body().size_hint().exact().unwrap_or(0),
                duration: started.elapsed(),
                error_code: error_code.as_deref(),
            };
            sink.log_completed_request(completed.render(sink.now()));
        }
        response
    }
    .instrument(span)
    .await
}

/// The admission-and-dispatch pipeline for one request. Never fails:
/// everything becomes a response plus an optional error code for the log.
async fn process(
    shared: &EndpointShared,
    request: &Request<Body>,
) -> (Response<Body>, Option<String>) {
    if let Some(limiter) = &shared.limiter {
        if !limiter.check_request().await {
            return (
                status_response(StatusCode::TOO_MANY_REQUESTS),
                Some("ratelimit-denied".to_owned()),
            );
        }
    }

    let Some(host) = request_host(request) else {
        return (
            status_response(StatusCode::BAD_REQUEST),
            Some("missing-host".to_owned()),
        );
    };

    for route in shared.routing.find(&host, request.uri().path()) {
        let Some(application) = shared.applications.get(&route.application) else {
            // References were resolved at build time; a miss here is a bug.
            warn!(application = %route.application, "mounted application is missing");
            return (
                status_response(StatusCode::INTERNAL_SERVER_ERROR),
                Some("unknown-application".to_owned()),
            );
        };
        let dispatch = Dispatch {
            base: route.base,
            extra: route.extra,
        };
        match application.handle(request, &dispatch).await {
            Outcome::Handled(response) => return (response, None),
            Outcome::Declined => continue,
            Outcome::Error(error) => {
                warn!(application = %route.application, %error, "application error");
                return (
                    status_response(StatusCode::INTERNAL_SERVER_ERROR),
                    Some(error_code(error.as_ref())),
                );
            }
        }
    }

    (
        status_response(StatusCode::NOT_FOUND),
        Some("not-found".to_owned()),
    )
}

fn status_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// The hostname a request addressed: URI authority (HTTP/2, absolute-form
/// HTTP/1.1) or the Host header, minus any port.
fn request_host(request: &Request<Body>) -> Option<String> {
    if let Some(host) = request.uri().host() {
        return Some(strip_port(host).to_owned());
    }
    let host = request.headers().get(http::header::HOST)?.to_str().ok()?;
    Some(strip_port(host).to_owned())
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Normalizes an application error to the short code column of the access
/// log.
fn error_code(error: &(dyn std::error::Error + 'static)) -> String {
    if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
        return format!("io-{:?}", io_error.kind()).to_ascii_lowercase();
    }
    if let Some(error) = error.downcast_ref::<Error>() {
        return match error.kind() {
            crate::ErrorKind::Config => "config-error",
            crate::ErrorKind::Transport => "transport-error",
            crate::ErrorKind::Lifecycle => "lifecycle-error",
        }
        .to_owned();
    }
    "application-error".to_owned()
}
