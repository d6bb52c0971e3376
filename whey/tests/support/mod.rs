//! Shared plumbing for the integration tests: tiny applications, a
//! registry-equipped environment, and a raw HTTP/1.1 client speaking over
//! real sockets.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use whey::app::{Application, Dispatch, Outcome};
use whey::component::{Component, ComponentTree, Environment};
use whey::{Body, Error};

/// Answers every request with its own name and the dispatch split, so
/// tests can see exactly which mount won and with what base/extra.
pub struct EchoApp {
    name: String,
}

#[async_trait]
impl Component for EchoApp {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Application for EchoApp {
    async fn handle(&self, _request: &Request<Body>, dispatch: &Dispatch) -> Outcome {
        let body = format!(
            "{} base={} extra={}",
            self.name,
            dispatch.base.as_base_string(),
            dispatch.extra.as_extra_string()
        );
        respond(StatusCode::OK, body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PickyOptions {
    decline_extra: String,
}

/// Declines requests whose dispatch remainder matches `declineExtra`,
/// otherwise behaves like [`EchoApp`].
pub struct PickyApp {
    name: String,
    decline_extra: String,
}

#[async_trait]
impl Component for PickyApp {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Application for PickyApp {
    async fn handle(&self, _request: &Request<Body>, dispatch: &Dispatch) -> Outcome {
        if dispatch.extra.as_extra_string() == self.decline_extra {
            return Outcome::Declined;
        }
        let body = format!(
            "{} base={} extra={}",
            self.name,
            dispatch.base.as_base_string(),
            dispatch.extra.as_extra_string()
        );
        respond(StatusCode::OK, body)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BytesOptions {
    size: usize,
}

/// Responds with a body of `size` filler bytes, for throughput tests.
pub struct BytesApp {
    name: String,
    size: usize,
}

#[async_trait]
impl Component for BytesApp {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Application for BytesApp {
    async fn handle(&self, _request: &Request<Body>, _dispatch: &Dispatch) -> Outcome {
        respond(StatusCode::OK, "x".repeat(self.size))
    }
}

/// Always fails, for error-translation tests.
pub struct FailingApp {
    name: String,
}

#[async_trait]
impl Component for FailingApp {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Application for FailingApp {
    async fn handle(&self, _request: &Request<Body>, _dispatch: &Dispatch) -> Outcome {
        Outcome::Error("handler exploded".into())
    }
}

/// Panics in its handler, for uncaught-problem routing tests.
pub struct PanickingApp {
    name: String,
}

#[async_trait]
impl Component for PanickingApp {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Application for PanickingApp {
    async fn handle(&self, _request: &Request<Body>, _dispatch: &Dispatch) -> Outcome {
        panic!("handler panicked")
    }
}

fn respond(status: StatusCode, body: String) -> Outcome {
    match Response::builder().status(status).body(Body::from(body)) {
        Ok(response) => Outcome::Handled(response),
        Err(error) => Outcome::Error(error.into()),
    }
}

/// An environment with the test application classes registered alongside
/// the builtins, and an exit hook that does nothing.
pub fn test_env() -> Environment {
    test_env_with_hook(Arc::new(|| {}))
}

/// As [`test_env`], with the given host exit hook.
pub fn test_env_with_hook(exit_hook: whey::problem::ExitHook) -> Environment {
    let mut env = Environment::new(exit_hook);
    env.applications
        .register("echo", |name, _options| {
            Ok(Arc::new(EchoApp { name: name.into() }) as Arc<dyn Application>)
        })
        .unwrap();
    env.applications
        .register("picky", |name, options| {
            let options: PickyOptions = serde_json::from_value(options.clone())
                .map_err(|error| Error::config(error.to_string()))?;
            Ok(Arc::new(PickyApp {
                name: name.into(),
                decline_extra: options.decline_extra,
            }) as Arc<dyn Application>)
        })
        .unwrap();
    env.applications
        .register("bytes", |name, options| {
            let options: BytesOptions = serde_json::from_value(options.clone())
                .map_err(|error| Error::config(error.to_string()))?;
            Ok(Arc::new(BytesApp {
                name: name.into(),
                size: options.size,
            }) as Arc<dyn Application>)
        })
        .unwrap();
    env.applications
        .register("failing", |name, _options| {
            Ok(Arc::new(FailingApp { name: name.into() }) as Arc<dyn Application>)
        })
        .unwrap();
    env.applications
        .register("panicking", |name, _options| {
            Ok(Arc::new(PanickingApp { name: name.into() }) as Arc<dyn Application>)
        })
        .unwrap();
    env
}

/// Builds, inits, and starts a tree from a JSON config value.
pub async fn start_tree(config: serde_json::Value) -> ComponentTree {
    let config = serde_json::from_value(config).expect("test config deserializes");
    let env = test_env();
    let tree = ComponentTree::build(&config, &env).expect("test config builds");
    tree.init(false).await.expect("tree inits");
    tree.start(false).await.expect("tree starts");
    tree
}

/// The bound address of a named endpoint.
pub fn addr_of(tree: &ComponentTree, endpoint: &str) -> SocketAddr {
    tree.endpoint(endpoint)
        .expect("endpoint exists")
        .local_addr()
        .expect("endpoint is bound")
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// One `GET` over a fresh connection, `Connection: close`.
pub async fn http_get(addr: SocketAddr, host: &str, target: &str) -> io::Result<RawResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    send_get(&mut stream, host, target).await?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    parse_response(&raw)
}

pub async fn send_get<S>(stream: &mut S, host: &str, target: &str) -> io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let request = format!("GET {target} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await
}

pub fn parse_response(raw: &[u8]) -> io::Result<RawResponse> {
    let text = String::from_utf8_lossy(raw);
    let (head, body) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no header terminator"))?;
    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty response"))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad status line"))?;
    let headers = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
        })
        .collect();
    Ok(RawResponse {
        status,
        headers,
        body: body.to_owned(),
    })
}
