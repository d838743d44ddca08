//! Valve lifecycle service — owns one valve's existence across start/stop cycles.
//!
//! A [`ValveService`] turns a [`ServiceDescriptor`] into a live, configured
//! valve registered with a [`HostServer`], and tears it down again on
//! [`stop`](ValveService::stop). All state sits behind a single mutex; the
//! public methods are the only way in, so readers never see a valve that is
//! half built or half torn down.
//!
//! # Start sequence
//!
//! 1. subscribe for path changes (only when a file path is configured)
//! 2. resolve `file_path` / `file_relative_to` through the [`PathManager`]
//! 3. instantiate the class through the [`ValveFactory`]
//! 4. apply `params` in declaration order
//! 5. register with the host
//!
//! Subscribing first means a base move that lands while the valve is being
//! built still queues an event for the new generation. Any failure releases
//! the subscription, discards the instance and leaves the service `Stopped`
//! with nothing registered.
//!
//! # Path changes
//!
//! The path callback never touches the valve. It posts a
//! [`ReconfigureEvent`] on the notifier channel every service is built with;
//! whoever drains that channel
//! (normally [`crate::supervisor::run`]) calls [`ValveService::reconfigure`],
//! which performs a full stop/start.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::factory::{FactoryError, ValveFactory};
use crate::host::{HostError, HostServer, RegistrationToken};
use crate::path::{CallbackHandle, PathCallback, PathError, PathEvent, PathManager};
use crate::supervisor::component_info::{ComponentInfo, ComponentStatus};
use crate::valve::{PropertyError, Valve};

// ── Descriptor ────────────────────────────────────────────────────────────────

/// Declarative description of one valve service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Unique within the host's registry.
    pub name: String,
    pub class_name: String,
    /// Isolation domain the class is resolved in; `None` = default module.
    pub module: Option<String>,
    pub file_path: Option<String>,
    pub file_relative_to: Option<String>,
    /// Applied in order; later entries may override earlier ones.
    pub params: Vec<(String, String)>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_name: class_name.into(),
            module: None,
            file_path: None,
            file_relative_to: None,
            params: Vec::new(),
        }
    }

    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn with_file(mut self, path: impl Into<String>, relative_to: Option<&str>) -> Self {
        self.file_path = Some(path.into());
        self.file_relative_to = relative_to.map(str::to_string);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }
}

// ── State & errors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Started => "started",
            ServiceState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{service}': cannot resolve file path: {source}")]
    PathResolution {
        service: String,
        #[source]
        source: PathError,
    },

    #[error("service '{service}': start failed: {source}")]
    StartFailure {
        service: String,
        #[source]
        source: FactoryError,
    },

    #[error("service '{service}': cannot apply property '{property}': {source}")]
    Configuration {
        service: String,
        property: String,
        #[source]
        source: PropertyError,
    },

    #[error("service '{service}': registration failed: {source}")]
    Registration {
        service: String,
        #[source]
        source: HostError,
    },

    #[error("service '{service}' is not started")]
    NotStarted { service: String },

    #[error("service '{service}' is already started")]
    AlreadyStarted { service: String },

    #[error("service '{service}' is defined more than once")]
    Duplicate { service: String },

    #[error("service '{service}': state lock poisoned")]
    Poisoned { service: String },
}

// ── Reconfiguration events ────────────────────────────────────────────────────

/// Posted by a service's path callback when its file location moves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigureEvent {
    pub service: String,
    /// Generation of the valve that was live when the change was observed.
    pub generation: u64,
    pub previous: Option<PathBuf>,
    pub current: Option<PathBuf>,
}

pub type ReconfigureSender = mpsc::UnboundedSender<ReconfigureEvent>;
pub type ReconfigureReceiver = mpsc::UnboundedReceiver<ReconfigureEvent>;

// ── Service ───────────────────────────────────────────────────────────────────

struct HandlerHandle {
    valve: Arc<dyn Valve>,
    token: RegistrationToken,
}

struct ServiceInner {
    descriptor: ServiceDescriptor,
    state: ServiceState,
    handler: Option<HandlerHandle>,
    callback: Option<CallbackHandle>,
    /// Incremented on every successful start.
    generation: u64,
    started_at: Option<Instant>,
    last_error: Option<String>,
}

pub struct ValveService {
    name: String,
    inner: Mutex<ServiceInner>,
    factory: Arc<ValveFactory>,
    paths: Arc<dyn PathManager>,
    host: Arc<dyn HostServer>,
    notifier: ReconfigureSender,
}

impl fmt::Debug for ValveService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValveService")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl ValveService {
    pub fn new(
        descriptor: ServiceDescriptor,
        factory: Arc<ValveFactory>,
        paths: Arc<dyn PathManager>,
        host: Arc<dyn HostServer>,
        notifier: ReconfigureSender,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            inner: Mutex::new(ServiceInner {
                descriptor,
                state: ServiceState::Stopped,
                handler: None,
                callback: None,
                generation: 0,
                started_at: None,
                last_error: None,
            }),
            factory,
            paths,
            host,
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> Result<MutexGuard<'_, ServiceInner>, ServiceError> {
        self.inner.lock().map_err(|_| ServiceError::Poisoned {
            service: self.name.clone(),
        })
    }

    pub fn state(&self) -> ServiceState {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Number of successful starts so far. Each start produces a fresh valve.
    pub fn generation(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    pub fn descriptor(&self) -> ServiceDescriptor {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .descriptor
            .clone()
    }

    pub fn params(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .descriptor
            .params
            .clone()
    }

    /// Create, configure and register the valve.
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        self.start_locked(&mut inner)
    }

    /// Release the path subscription, then deregister and drop the valve.
    ///
    /// Never fails. Calling it on a stopped service is a no-op. A lock
    /// poisoned by a panicking valve is recovered here: once the service is
    /// back to `Stopped` it may be started again.
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(service = %self.name, "state lock poisoned, forcing stop");
            poisoned.into_inner()
        });
        self.stop_locked(&mut inner);
        self.inner.clear_poison();
    }

    /// Stop then start under one lock acquisition, so no reader observes the
    /// gap between the two.
    pub fn restart(&self) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        self.stop_locked(&mut inner);
        self.start_locked(&mut inner)
    }

    /// Handle a path change posted by this service's callback.
    ///
    /// Returns `Ok(false)` when the event is stale: the valve it refers to is
    /// already gone (stopped or replaced by a later start).
    pub fn reconfigure(&self, event: &ReconfigureEvent) -> Result<bool, ServiceError> {
        let mut inner = self.lock()?;
        if inner.state != ServiceState::Started || inner.generation != event.generation {
            debug!(
                service = %self.name,
                event_generation = event.generation,
                generation = inner.generation,
                state = %inner.state,
                "ignoring stale path change"
            );
            return Ok(false);
        }
        info!(
            service = %self.name,
            previous = ?event.previous,
            current = ?event.current,
            "file path moved, restarting valve"
        );
        self.stop_locked(&mut inner);
        self.start_locked(&mut inner)?;
        Ok(true)
    }

    /// The live valve. Fails unless the service is started.
    pub fn current_handler(&self) -> Result<Arc<dyn Valve>, ServiceError> {
        let inner = self.lock()?;
        match (&inner.state, &inner.handler) {
            (ServiceState::Started, Some(handle)) => Ok(handle.valve.clone()),
            _ => Err(ServiceError::NotStarted {
                service: self.name.clone(),
            }),
        }
    }

    /// Replace the file path reference. Only allowed while stopped; the new
    /// location takes effect on the next start.
    pub fn set_paths(&self, path: Option<&str>, relative_to: Option<&str>) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        self.ensure_stopped(&inner)?;
        inner.descriptor.file_path = path.map(str::to_string);
        inner.descriptor.file_relative_to = relative_to.map(str::to_string);
        Ok(())
    }

    /// Replace the property list. Same rule as [`set_paths`](Self::set_paths).
    pub fn set_params(&self, params: Vec<(String, String)>) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        self.ensure_stopped(&inner)?;
        inner.descriptor.params = params;
        Ok(())
    }

    /// Status node for the supervisor's component tree.
    pub fn info(&self) -> ComponentInfo {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let status = match (inner.state, &inner.last_error) {
            (ServiceState::Started, _) => ComponentStatus::On,
            (_, Some(_)) => ComponentStatus::Err,
            _ => ComponentStatus::Off,
        };
        let mut node = ComponentInfo::leaf(
            &self.name,
            &inner.descriptor.class_name,
            inner.state.as_str(),
            status,
        );
        node.generation = Some(inner.generation);
        node.detail = inner.last_error.clone();
        node.uptime_ms = inner.started_at.map(|t| t.elapsed().as_millis() as u64);
        node
    }

    fn ensure_stopped(&self, inner: &ServiceInner) -> Result<(), ServiceError> {
        if inner.state == ServiceState::Stopped {
            Ok(())
        } else {
            Err(ServiceError::AlreadyStarted {
                service: self.name.clone(),
            })
        }
    }

    fn start_locked(&self, inner: &mut ServiceInner) -> Result<(), ServiceError> {
        self.ensure_stopped(inner)?;
        inner.state = ServiceState::Starting;
        let generation = inner.generation + 1;

        // Held in `inner` right away so a panic below still lets `stop`
        // release it.
        inner.callback = inner.descriptor.file_path.as_deref().map(|path| {
            self.paths.subscribe(
                path,
                inner.descriptor.file_relative_to.as_deref(),
                self.path_callback(generation),
            )
        });

        match self.bring_up(&inner.descriptor) {
            Ok(handler) => {
                info!(
                    service = %self.name,
                    class = %inner.descriptor.class_name,
                    generation,
                    watching = inner.callback.is_some(),
                    "valve started"
                );
                inner.handler = Some(handler);
                inner.generation = generation;
                inner.started_at = Some(Instant::now());
                inner.last_error = None;
                inner.state = ServiceState::Started;
                Ok(())
            }
            Err(e) => {
                if let Some(callback) = inner.callback.take() {
                    self.paths.unsubscribe(callback);
                }
                warn!(service = %self.name, error = %e, "valve failed to start");
                inner.last_error = Some(e.to_string());
                inner.state = ServiceState::Stopped;
                Err(e)
            }
        }
    }

    fn bring_up(&self, d: &ServiceDescriptor) -> Result<HandlerHandle, ServiceError> {
        let resolved = match &d.file_path {
            Some(path) => Some(
                self.paths
                    .resolve(path, d.file_relative_to.as_deref())
                    .map_err(|source| ServiceError::PathResolution {
                        service: self.name.clone(),
                        source,
                    })?,
            ),
            None => None,
        };

        let mut valve = self
            .factory
            .create(resolved.as_deref(), &d.class_name, d.module.as_deref())
            .map_err(|source| ServiceError::StartFailure {
                service: self.name.clone(),
                source,
            })?;

        // An error here drops the partially configured instance unregistered.
        for (property, value) in &d.params {
            valve
                .set_property(property, value)
                .map_err(|source| ServiceError::Configuration {
                    service: self.name.clone(),
                    property: property.clone(),
                    source,
                })?;
            debug!(service = %self.name, %property, %value, "property applied");
        }

        let valve: Arc<dyn Valve> = Arc::from(valve);
        let token = self
            .host
            .register(valve.clone())
            .map_err(|source| ServiceError::Registration {
                service: self.name.clone(),
                source,
            })?;

        Ok(HandlerHandle { valve, token })
    }

    fn stop_locked(&self, inner: &mut ServiceInner) {
        if inner.handler.is_none() && inner.callback.is_none() {
            inner.state = ServiceState::Stopped;
            return;
        }
        inner.state = ServiceState::Stopping;

        if let Some(callback) = inner.callback.take() {
            self.paths.unsubscribe(callback);
        }
        if let Some(HandlerHandle { valve, token }) = inner.handler.take() {
            if let Err(e) = self.host.deregister(token) {
                warn!(
                    service = %self.name,
                    class = valve.class_name(),
                    error = %e,
                    "valve deregistration failed"
                );
            }
        }

        inner.started_at = None;
        inner.state = ServiceState::Stopped;
        info!(service = %self.name, generation = inner.generation, "valve stopped");
    }

    fn path_callback(&self, generation: u64) -> PathCallback {
        let service = self.name.clone();
        let notifier = self.notifier.clone();
        Box::new(move |event: &PathEvent| {
            let msg = ReconfigureEvent {
                service: service.clone(),
                generation,
                previous: event.previous.clone(),
                current: event.current.clone(),
            };
            if notifier.send(msg).is_err() {
                warn!(%service, "reconfiguration channel closed; path change dropped");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ValvePipeline;
    use crate::path::PathRegistry;
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Records every property assignment; rejects `reject`, panics on `boom`.
    #[derive(Debug, Default)]
    struct Recorder {
        path: Option<PathBuf>,
        applied: Vec<(String, String)>,
    }

    impl Valve for Recorder {
        fn class_name(&self) -> &str {
            "test.Recorder"
        }
        fn set_property(&mut self, name: &str, value: &str) -> Result<(), PropertyError> {
            if name == "reject" {
                return Err(PropertyError::unknown(name));
            }
            if name == "boom" {
                panic!("valve blew up applying '{name}'");
            }
            self.applied.push((name.to_string(), value.to_string()));
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Host whose registration always fails.
    struct RefusingHost;

    impl HostServer for RefusingHost {
        fn register(&self, _valve: Arc<dyn Valve>) -> Result<RegistrationToken, HostError> {
            Err(HostError::Rejected("pipeline frozen".into()))
        }
        fn deregister(&self, token: RegistrationToken) -> Result<(), HostError> {
            Err(HostError::UnknownRegistration(token.id()))
        }
    }

    fn factory() -> Arc<ValveFactory> {
        let mut f = ValveFactory::new();
        f.register(None, "test.Recorder", || Ok(Box::new(Recorder::default())));
        f.register_with_path(None, "test.Recorder", |path| {
            Ok(Box::new(Recorder {
                path: Some(path.to_path_buf()),
                ..Recorder::default()
            }))
        });
        Arc::new(f)
    }

    struct Fixture {
        paths: Arc<PathRegistry>,
        host: Arc<ValvePipeline>,
        tx: ReconfigureSender,
        rx: ReconfigureReceiver,
    }

    impl Fixture {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                paths: Arc::new(PathRegistry::with_bases([("log.dir", "/a")])),
                host: Arc::new(ValvePipeline::new()),
                tx,
                rx,
            }
        }

        fn service(&self, d: ServiceDescriptor) -> ValveService {
            ValveService::new(d, factory(), self.paths.clone(), self.host.clone(), self.tx.clone())
        }
    }

    /// Moves `base` to `to` right after the first resolve, as a concurrent
    /// reload would while the valve is still being built.
    struct MovingPaths {
        inner: Arc<PathRegistry>,
        base: &'static str,
        to: &'static str,
        moved: AtomicBool,
        notified: std::sync::atomic::AtomicUsize,
    }

    impl PathManager for MovingPaths {
        fn resolve(&self, path: &str, relative_to: Option<&str>) -> Result<PathBuf, PathError> {
            let resolved = self.inner.resolve(path, relative_to)?;
            if !self.moved.swap(true, Ordering::SeqCst) {
                let n = self.inner.set_base(self.base, self.to);
                self.notified.store(n, Ordering::SeqCst);
            }
            Ok(resolved)
        }
        fn subscribe(&self, path: &str, relative_to: Option<&str>, on_change: PathCallback) -> CallbackHandle {
            self.inner.subscribe(path, relative_to, on_change)
        }
        fn unsubscribe(&self, handle: CallbackHandle) {
            self.inner.unsubscribe(handle)
        }
    }

    fn recorded_path(service: &ValveService) -> Option<PathBuf> {
        let valve = service.current_handler().unwrap();
        valve.as_any().downcast_ref::<Recorder>().unwrap().path.clone()
    }

    fn applied(service: &ValveService) -> Vec<(String, String)> {
        let valve = service.current_handler().unwrap();
        valve
            .as_any()
            .downcast_ref::<Recorder>()
            .expect("recorder valve")
            .applied
            .clone()
    }

    #[test]
    fn start_applies_params_in_order_once() {
        let fx = Fixture::new();
        let svc = fx.service(
            ServiceDescriptor::new("rec", "test.Recorder")
                .with_param("b", "2")
                .with_param("a", "1")
                .with_param("b", "3"),
        );
        svc.start().unwrap();
        assert_eq!(
            applied(&svc),
            vec![
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "3".to_string()),
            ]
        );
        assert_eq!(svc.state(), ServiceState::Started);
        assert_eq!(fx.host.len(), 1);
    }

    #[test]
    fn current_handler_requires_started() {
        let fx = Fixture::new();
        let svc = fx.service(ServiceDescriptor::new("rec", "test.Recorder"));
        assert!(matches!(svc.current_handler(), Err(ServiceError::NotStarted { .. })));
        svc.start().unwrap();
        assert!(svc.current_handler().is_ok());
        svc.stop();
        assert!(matches!(svc.current_handler(), Err(ServiceError::NotStarted { .. })));
    }

    #[test]
    fn configuration_failure_registers_nothing() {
        let fx = Fixture::new();
        let svc = fx.service(
            ServiceDescriptor::new("rec", "test.Recorder")
                .with_param("ok", "1")
                .with_param("reject", "x"),
        );
        let err = svc.start().unwrap_err();
        assert!(matches!(err, ServiceError::Configuration { ref property, .. } if property == "reject"));
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert!(fx.host.is_empty());
        assert!(svc.current_handler().is_err());
    }

    #[test]
    fn unknown_base_is_path_resolution_error() {
        let fx = Fixture::new();
        let svc = fx.service(ServiceDescriptor::new("rec", "test.Recorder").with_file("x.log", Some("nope")));
        assert!(matches!(svc.start(), Err(ServiceError::PathResolution { .. })));
        assert!(fx.host.is_empty());
        assert_eq!(fx.paths.subscription_count(), 0);
    }

    #[test]
    fn registration_failure_leaves_nothing_attached() {
        let paths = Arc::new(PathRegistry::with_bases([("log.dir", "/a")]));
        let svc = ValveService::new(
            ServiceDescriptor::new("rec", "test.Recorder").with_file("x.log", Some("log.dir")),
            factory(),
            paths.clone(),
            Arc::new(RefusingHost),
            mpsc::unbounded_channel().0,
        );
        assert!(matches!(svc.start(), Err(ServiceError::Registration { .. })));
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert_eq!(paths.subscription_count(), 0);
        svc.stop();
    }

    #[test]
    fn stop_twice_is_noop() {
        let fx = Fixture::new();
        let svc = fx.service(ServiceDescriptor::new("rec", "test.Recorder"));
        svc.start().unwrap();
        svc.stop();
        svc.stop();
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert!(fx.host.is_empty());
    }

    #[test]
    fn start_twice_is_rejected() {
        let fx = Fixture::new();
        let svc = fx.service(ServiceDescriptor::new("rec", "test.Recorder"));
        svc.start().unwrap();
        assert!(matches!(svc.start(), Err(ServiceError::AlreadyStarted { .. })));
        assert_eq!(fx.host.len(), 1);
    }

    #[test]
    fn each_start_builds_a_fresh_valve() {
        let fx = Fixture::new();
        let svc = fx.service(ServiceDescriptor::new("rec", "test.Recorder"));
        svc.start().unwrap();
        let first = svc.current_handler().unwrap();
        svc.stop();
        svc.start().unwrap();
        let second = svc.current_handler().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(svc.generation(), 2);
    }

    #[test]
    fn callback_exists_only_with_file_path() {
        let fx = Fixture::new();
        let plain = fx.service(ServiceDescriptor::new("plain", "test.Recorder"));
        let filed = fx.service(ServiceDescriptor::new("filed", "test.Recorder").with_file("x.log", Some("log.dir")));
        plain.start().unwrap();
        assert_eq!(fx.paths.subscription_count(), 0);
        filed.start().unwrap();
        assert_eq!(fx.paths.subscription_count(), 1);
        filed.stop();
        assert_eq!(fx.paths.subscription_count(), 0);
    }

    #[test]
    fn set_paths_rejected_while_started() {
        let fx = Fixture::new();
        let svc = fx.service(ServiceDescriptor::new("rec", "test.Recorder"));
        svc.start().unwrap();
        assert!(matches!(
            svc.set_paths(Some("y.log"), Some("log.dir")),
            Err(ServiceError::AlreadyStarted { .. })
        ));
        assert!(svc.set_params(vec![]).is_err());
        svc.stop();
        svc.set_paths(Some("y.log"), Some("log.dir")).unwrap();
        let d = svc.descriptor();
        assert_eq!(d.file_path.as_deref(), Some("y.log"));
        assert_eq!(d.file_relative_to.as_deref(), Some("log.dir"));
    }

    #[test]
    fn path_change_posts_event_and_reconfigure_replaces_valve() {
        let mut fx = Fixture::new();
        let svc = fx.service(ServiceDescriptor::new("rec", "test.Recorder").with_file("x.log", Some("log.dir")));
        svc.start().unwrap();
        let old = svc.current_handler().unwrap();

        assert_eq!(fx.paths.set_base("log.dir", "/b"), 1);
        let event = fx.rx.try_recv().unwrap();
        assert_eq!(event.current, Some(PathBuf::from("/b/x.log")));
        assert!(fx.rx.try_recv().is_err());

        assert!(svc.reconfigure(&event).unwrap());
        let new = svc.current_handler().unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(fx.host.len(), 1);
        assert_eq!(fx.paths.subscription_count(), 1);

        // Same event again refers to a valve that no longer exists.
        assert!(!svc.reconfigure(&event).unwrap());
    }

    #[test]
    fn info_reflects_state_and_errors() {
        let fx = Fixture::new();
        let svc = fx.service(ServiceDescriptor::new("rec", "test.Recorder").with_param("reject", "1"));
        assert_eq!(svc.info().state, ComponentStatus::Off);
        svc.start().unwrap_err();
        let node = svc.info();
        assert_eq!(node.state, ComponentStatus::Err);
        assert!(node.detail.unwrap().contains("reject"));

        svc.set_params(vec![]).unwrap();
        svc.start().unwrap();
        let node = svc.info();
        assert_eq!(node.state, ComponentStatus::On);
        assert_eq!(node.status, "started");
        assert_eq!(node.generation, Some(1));
    }

    #[test]
    fn base_moved_during_start_is_not_lost() {
        let fx = Fixture::new();
        let paths = Arc::new(MovingPaths {
            inner: fx.paths.clone(),
            base: "log.dir",
            to: "/b",
            moved: AtomicBool::new(false),
            notified: std::sync::atomic::AtomicUsize::new(0),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let svc = ValveService::new(
            ServiceDescriptor::new("rec", "test.Recorder").with_file("x.log", Some("log.dir")),
            factory(),
            paths.clone(),
            fx.host.clone(),
            tx,
        );

        svc.start().unwrap();
        assert_eq!(paths.notified.load(Ordering::SeqCst), 1);
        assert_eq!(recorded_path(&svc), Some(PathBuf::from("/a/x.log")));

        let event = rx.try_recv().expect("move during start queued an event");
        assert_eq!(event.generation, 1);
        assert!(svc.reconfigure(&event).unwrap());
        assert_eq!(recorded_path(&svc), Some(PathBuf::from("/b/x.log")));
        assert_eq!(svc.generation(), 2);
        assert_eq!(fx.paths.subscription_count(), 1);
        assert_eq!(fx.host.len(), 1);
    }

    #[test]
    fn failed_start_releases_early_subscription() {
        let fx = Fixture::new();
        let svc = fx.service(
            ServiceDescriptor::new("rec", "test.Recorder")
                .with_file("x.log", Some("log.dir"))
                .with_param("reject", "1"),
        );
        assert!(svc.start().is_err());
        assert_eq!(fx.paths.subscription_count(), 0);
        assert!(fx.host.is_empty());
    }

    #[test]
    fn every_service_forwards_path_changes() {
        let mut fx = Fixture::new();
        let svc = fx.service(ServiceDescriptor::new("rec", "test.Recorder").with_file("x.log", Some("log.dir")));
        svc.start().unwrap();

        assert_eq!(fx.paths.set_base("log.dir", "/b"), 1);
        while let Ok(event) = fx.rx.try_recv() {
            svc.reconfigure(&event).unwrap();
        }
        assert_eq!(svc.generation(), 2);
        assert_eq!(recorded_path(&svc), Some(PathBuf::from("/b/x.log")));
    }

    #[test]
    fn stop_recovers_from_panicking_valve() {
        let fx = Fixture::new();
        let svc = Arc::new(fx.service(
            ServiceDescriptor::new("rec", "test.Recorder")
                .with_file("x.log", Some("log.dir"))
                .with_param("boom", "1"),
        ));

        let starter = svc.clone();
        assert!(std::thread::spawn(move || starter.start()).join().is_err());
        assert!(matches!(svc.set_params(vec![]), Err(ServiceError::Poisoned { .. })));

        svc.stop();
        assert_eq!(svc.state(), ServiceState::Stopped);
        assert_eq!(fx.paths.subscription_count(), 0);
        assert!(fx.host.is_empty());

        svc.set_params(vec![("ok".into(), "1".into())]).unwrap();
        svc.start().unwrap();
        assert_eq!(applied(&svc), vec![("ok".to_string(), "1".to_string())]);
        assert_eq!(fx.paths.subscription_count(), 1);
    }
}
