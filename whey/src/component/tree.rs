use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::info;

use super::{AppRegistry, Component, Supervised};
use crate::app::{Application, Dispatch, Outcome};
use crate::body::Body;
use crate::config::{
    MemoryMonitorConfig, RateLimiterConfig, RequestLoggerConfig, ServerConfig,
};
use crate::endpoint::{Endpoint, RequestLogSink, TracingLogSink};
use crate::event::{ChainedEvent, EventEmitter};
use crate::host::HostManager;
use crate::limit::RateLimiter;
use crate::monitor::MemoryMonitor;
use crate::problem::{ExitHook, ProblemHandler};
use crate::Error;

/// Process-lifetime collaborators handed to every tree built in this
/// process: the application class registry, the uncaught-problem handler,
/// and the host exit hook. Constructed once, before the first tree.
pub struct Environment {
    pub applications: AppRegistry,
    pub problems: Arc<ProblemHandler>,
    pub exit_hook: ExitHook,
}

impl Environment {
    pub fn new(exit_hook: ExitHook) -> Self {
        Self {
            applications: AppRegistry::with_builtins(),
            problems: Arc::new(ProblemHandler::new(exit_hook.clone())),
            exit_hook,
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(ProblemHandler::process_exit_hook())
    }
}

/// Lifecycle events a tree appends to its event chain. Across a reload the
/// successor tree continues the predecessor's chain, so a consumer holding
/// the head sees the whole history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    Built,
    Started { is_reload: bool },
    Stopped { will_reload: bool },
}

/// The supervisory tree: every component in the system, held in its
/// dependency order.
///
/// `init` runs hosts, then services, then applications, then endpoints;
/// `start` does the same but brings endpoints up concurrently; `stop` runs
/// the exact reverse, with each endpoint bounding its own drain. Reload is
/// `stop(will_reload)`, build fresh, `start(is_reload)`; the trees share no
/// runtime state, only the event chain.
pub struct ComponentTree {
    host_manager: Option<Arc<HostManager>>,
    host_supervised: Option<Supervised>,
    services: Vec<Supervised>,
    applications: Vec<Supervised>,
    endpoints: Vec<Arc<Endpoint>>,
    endpoints_supervised: Vec<Arc<Supervised>>,
    problems: Arc<ProblemHandler>,
    head: Arc<ChainedEvent<TreeEvent>>,
    emitter: Mutex<Option<EventEmitter<TreeEvent>>>,
}

impl ComponentTree {
    /// Builds a tree from configuration. All cross-references (mount
    /// applications, endpoint services) resolve here or the build fails.
    pub fn build(config: &ServerConfig, env: &Environment) -> Result<Self, Error> {
        Self::build_inner(config, env, None)
    }

    fn build_inner(
        config: &ServerConfig,
        env: &Environment,
        prior_chain: Option<EventEmitter<TreeEvent>>,
    ) -> Result<Self, Error> {
        let host_manager = if config.hosts.is_empty() {
            None
        } else {
            Some(Arc::new(HostManager::from_configs("hosts", &config.hosts)?))
        };
        let host_supervised = host_manager
            .as_ref()
            .map(|manager| Supervised::new(Arc::clone(manager) as Arc<dyn Component>));

        let mut service_names = HashSet::new();
        let mut services = Vec::new();
        let mut rate_limiters: HashMap<String, Arc<RateLimiter>> = HashMap::new();
        let mut request_logs: HashMap<String, Arc<dyn RequestLogSink>> = HashMap::new();
        for service in &config.services {
            if !service_names.insert(service.name.clone()) {
                return Err(Error::config(format!(
                    "service {:?} defined twice",
                    service.name
                )));
            }
            match service.class.as_str() {
                "rate-limiter" => {
                    let options: RateLimiterConfig = parse_options(&service.name, &service.options)?;
                    let limiter = Arc::new(RateLimiter::new(&service.name, &options)?);
                    rate_limiters.insert(service.name.clone(), Arc::clone(&limiter));
                    services.push(Supervised::new(limiter as Arc<dyn Component>));
                }
                "request-logger" => {
                    // The directory/baseName target is validated here; the
                    // bundled sink hands lines to the log pipeline, and the
                    // on-disk writer consumes them externally.
                    let _options: RequestLoggerConfig =
                        parse_options(&service.name, &service.options)?;
                    let sink = Arc::new(TracingLogSink::new(&service.name));
                    request_logs.insert(
                        service.name.clone(),
                        Arc::clone(&sink) as Arc<dyn RequestLogSink>,
                    );
                    services.push(Supervised::new(sink as Arc<dyn Component>));
                }
                "memory-monitor" => {
                    let options: MemoryMonitorConfig =
                        parse_options(&service.name, &service.options)?;
                    let monitor = Arc::new(MemoryMonitor::new(
                        &service.name,
                        options,
                        env.exit_hook.clone(),
                    ));
                    services.push(Supervised::new(monitor as Arc<dyn Component>));
                }
                other => {
                    return Err(Error::config(format!(
                        "service {:?} has unknown class {other:?}",
                        service.name
                    )));
                }
            }
        }

        let mut applications: HashMap<String, Arc<dyn Application>> = HashMap::new();
        let mut application_components = Vec::new();
        for app_config in &config.applications {
            if applications.contains_key(&app_config.name) {
                return Err(Error::config(format!(
                    "application {:?} defined twice",
                    app_config.name
                )));
            }
            let application =
                env.applications
                    .create(&app_config.class, &app_config.name, &app_config.options)?;
            application_components.push(Supervised::new(
                Arc::new(AppComponent(Arc::clone(&application))) as Arc<dyn Component>,
            ));
            applications.insert(app_config.name.clone(), application);
        }

        let mut endpoint_names = HashSet::new();
        let mut endpoints = Vec::new();
        let mut endpoints_supervised = Vec::new();
        for endpoint_config in &config.endpoints {
            if !endpoint_names.insert(endpoint_config.name.clone()) {
                return Err(Error::config(format!(
                    "endpoint {:?} defined twice",
                    endpoint_config.name
                )));
            }
            let limiter = endpoint_config
                .services
                .rate_limiter
                .as_ref()
                .map(|name| {
                    rate_limiters.get(name).cloned().ok_or_else(|| {
                        Error::config(format!(
                            "endpoint {:?} references unknown rate limiter {name:?}",
                            endpoint_config.name
                        ))
                    })
                })
                .transpose()?;
            let request_log = endpoint_config
                .services
                .request_logger
                .as_ref()
                .map(|name| {
                    request_logs.get(name).cloned().ok_or_else(|| {
                        Error::config(format!(
                            "endpoint {:?} references unknown request logger {name:?}",
                            endpoint_config.name
                        ))
                    })
                })
                .transpose()?;
            let endpoint = Arc::new(Endpoint::new(
                endpoint_config,
                &applications,
                limiter,
                request_log,
                host_manager.clone(),
                Arc::clone(&env.problems),
            )?);
            endpoints.push(Arc::clone(&endpoint));
            endpoints_supervised.push(Arc::new(Supervised::new(endpoint as Arc<dyn Component>)));
        }

        let (head, emitter) = match prior_chain {
            Some(emitter) => {
                let emitter = emitter.emit(TreeEvent::Built);
                (Arc::clone(emitter.event()), emitter)
            }
            None => ChainedEvent::new(TreeEvent::Built),
        };

        Ok(Self {
            host_manager,
            host_supervised,
            services,
            applications: application_components,
            endpoints,
            endpoints_supervised,
            problems: Arc::clone(&env.problems),
            head,
            emitter: Mutex::new(Some(emitter)),
        })
    }

    /// The endpoints of this tree, in declaration order.
    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Looks up an endpoint by name.
    pub fn endpoint(&self, name: &str) -> Option<&Arc<Endpoint>> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.name() == name)
    }

    /// The host manager, if any hosts are configured.
    pub fn host_manager(&self) -> Option<&Arc<HostManager>> {
        self.host_manager.as_ref()
    }

    /// The first event this tree appended to its chain.
    pub fn events(&self) -> Arc<ChainedEvent<TreeEvent>> {
        Arc::clone(&self.head)
    }

    /// The most recent event in the chain, across reload generations.
    pub fn final_logged_event(&self) -> Arc<ChainedEvent<TreeEvent>> {
        self.head.latest()
    }

    pub async fn init(&self, is_reload: bool) -> Result<(), Error> {
        if let Some(host) = &self.host_supervised {
            host.init(is_reload).await?;
        }
        for service in &self.services {
            service.init(is_reload).await?;
        }
        for application in &self.applications {
            application.init(is_reload).await?;
        }
        for endpoint in &self.endpoints_supervised {
            endpoint.init(is_reload).await?;
        }
        Ok(())
    }

    /// Starts everything, dependencies first; independent endpoints come up
    /// concurrently.
    pub async fn start(&self, is_reload: bool) -> Result<(), Error> {
        if let Some(host) = &self.host_supervised {
            host.start(is_reload).await?;
        }
        for service in &self.services {
            service.start(is_reload).await?;
        }
        for application in &self.applications {
            application.start(is_reload).await?;
        }

        let mut tasks = JoinSet::new();
        for endpoint in &self.endpoints_supervised {
            let endpoint = Arc::clone(endpoint);
            tasks.spawn(async move { endpoint.start(is_reload).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.map_err(|error| {
                Error::lifecycle(format!("endpoint start task failed: {error}"))
            })??;
        }

        self.emit(TreeEvent::Started { is_reload });
        info!(is_reload, "component tree running");
        Ok(())
    }

    /// Stops everything in reverse start order. Stopping is best-effort:
    /// a failing component does not leave the rest running; each failure
    /// is recorded with the problem handler and the first is returned
    /// after the sweep completes.
    pub async fn stop(&self, will_reload: bool) -> Result<(), Error> {
        let mut first_error = None;

        let mut tasks = JoinSet::new();
        for endpoint in &self.endpoints_supervised {
            let endpoint = Arc::clone(endpoint);
            tasks.spawn(async move { endpoint.stop(will_reload).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    self.problems.record("endpoint stop", &error);
                    first_error.get_or_insert(error);
                }
                Err(error) => {
                    let error = Error::lifecycle(format!("endpoint stop task failed: {error}"));
                    self.problems.record("endpoint stop", &error);
                    first_error.get_or_insert(error);
                }
            }
        }

        for application in self.applications.iter().rev() {
            if let Err(error) = application.stop(will_reload).await {
                self.problems.record("application stop", &error);
                first_error.get_or_insert(error);
            }
        }
        for service in self.services.iter().rev() {
            if let Err(error) = service.stop(will_reload).await {
                self.problems.record("service stop", &error);
                first_error.get_or_insert(error);
            }
        }
        if let Some(host) = &self.host_supervised {
            if let Err(error) = host.stop(will_reload).await {
                self.problems.record("host manager stop", &error);
                first_error.get_or_insert(error);
            }
        }

        self.emit(TreeEvent::Stopped { will_reload });
        info!(will_reload, "component tree stopped");
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// In-process reload: stop this tree for reload, build a fresh one from
    /// the new configuration, and start it. The new tree continues this
    /// tree's event chain but shares none of its runtime state.
    pub async fn reload(
        &self,
        config: &ServerConfig,
        env: &Environment,
    ) -> Result<ComponentTree, Error> {
        self.stop(true).await?;
        let chain = self.lock_emitter().take();
        let next = Self::build_inner(config, env, chain)?;
        next.init(true).await?;
        next.start(true).await?;
        Ok(next)
    }

    fn emit(&self, event: TreeEvent) {
        let mut emitter = self.lock_emitter();
        if let Some(taken) = emitter.take() {
            *emitter = Some(taken.emit(event));
        }
    }

    fn lock_emitter(&self) -> MutexGuard<'_, Option<EventEmitter<TreeEvent>>> {
        self.emitter.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ComponentTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentTree")
            .field("hosts", &self.host_manager.is_some())
            .field("services", &self.services.len())
            .field("applications", &self.applications.len())
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

fn parse_options<T: serde::de::DeserializeOwned>(
    name: &str,
    options: &serde_json::Value,
) -> Result<T, Error> {
    serde_json::from_value(options.clone())
        .map_err(|error| Error::config(format!("service {name:?}: {error}")))
}

/// Adapter letting an erased application sit in the supervised tree.
struct AppComponent(Arc<dyn Application>);

#[async_trait]
impl Component for AppComponent {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn impl_init(&self, is_reload: bool) -> Result<(), Error> {
        self.0.impl_init(is_reload).await
    }

    async fn impl_start(&self, is_reload: bool) -> Result<(), Error> {
        self.0.impl_start(is_reload).await
    }

    async fn impl_stop(&self, will_reload: bool) -> Result<(), Error> {
        self.0.impl_stop(will_reload).await
    }
}

#[async_trait]
impl Application for AppComponent {
    async fn handle(&self, request: &http::Request<Body>, dispatch: &Dispatch) -> Outcome {
        self.0.handle(request, dispatch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redirector_config(port: u16) -> ServerConfig {
        serde_json::from_value(serde_json::json!({
            "applications": [{
                "name": "redirect",
                "class": "redirector",
                "target": "https://milk.com/boop/",
            }],
            "endpoints": [{
                "name": "main",
                "endpoint": { "interface": "127.0.0.1", "port": port, "protocol": "http" },
                "mounts": [{ "application": "redirect", "at": "//*/" }],
            }],
        }))
        .unwrap()
    }

    fn quiet_env() -> Environment {
        Environment::new(Arc::new(|| {}))
    }

    #[tokio::test]
    async fn builds_inits_starts_and_stops() {
        let env = quiet_env();
        let tree = ComponentTree::build(&redirector_config(0), &env).unwrap();
        tree.init(false).await.unwrap();
        tree.start(false).await.unwrap();

        let endpoint = tree.endpoint("main").unwrap();
        let addr = endpoint.local_addr().expect("bound after start");
        assert_ne!(addr.port(), 0);

        tree.stop(false).await.unwrap();
        assert!(endpoint.local_addr().is_none());
        // Idempotent.
        tree.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn unresolved_references_fail_the_build() {
        let env = quiet_env();

        let missing_app: ServerConfig = serde_json::from_value(serde_json::json!({
            "endpoints": [{
                "name": "main",
                "endpoint": { "interface": "127.0.0.1", "port": 0, "protocol": "http" },
                "mounts": [{ "application": "ghost", "at": "//*/" }],
            }],
        }))
        .unwrap();
        assert!(ComponentTree::build(&missing_app, &env).is_err());

        let missing_limiter: ServerConfig = serde_json::from_value(serde_json::json!({
            "endpoints": [{
                "name": "main",
                "endpoint": { "interface": "127.0.0.1", "port": 0, "protocol": "http" },
                "services": { "rateLimiter": "ghost" },
            }],
        }))
        .unwrap();
        assert!(ComponentTree::build(&missing_limiter, &env).is_err());
    }

    #[tokio::test]
    async fn duplicate_names_fail_the_build() {
        let env = quiet_env();
        let config: ServerConfig = serde_json::from_value(serde_json::json!({
            "services": [
                { "name": "limiter", "class": "rate-limiter" },
                { "name": "limiter", "class": "rate-limiter" },
            ],
        }))
        .unwrap();
        assert!(ComponentTree::build(&config, &env).is_err());
    }

    #[tokio::test]
    async fn reload_builds_a_running_successor_on_the_same_chain() {
        let env = quiet_env();
        let tree = ComponentTree::build(&redirector_config(0), &env).unwrap();
        tree.init(false).await.unwrap();
        tree.start(false).await.unwrap();

        let head = tree.events();
        let next = tree.reload(&redirector_config(0), &env).await.unwrap();

        let addr = next.endpoint("main").unwrap().local_addr();
        assert!(addr.is_some());

        // Walking from the first tree's head reaches the successor's
        // events: Built, Started, Stopped(reload), Built, Started(reload).
        let mut events = Vec::new();
        let mut node = head;
        events.push(node.payload().clone());
        while let Some(next_node) = node.next_now() {
            node = next_node;
            events.push(node.payload().clone());
        }
        assert_eq!(
            events,
            vec![
                TreeEvent::Built,
                TreeEvent::Started { is_reload: false },
                TreeEvent::Stopped { will_reload: true },
                TreeEvent::Built,
                TreeEvent::Started { is_reload: true },
            ]
        );

        next.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_service_class_fails_the_build() {
        let env = quiet_env();
        let config: ServerConfig = serde_json::from_value(serde_json::json!({
            "services": [{ "name": "x", "class": "flux-capacitor" }],
        }))
        .unwrap();
        assert!(ComponentTree::build(&config, &env).is_err());
    }
}
