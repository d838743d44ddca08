//! Supervisor — owns the valve services and drives their lifecycle.
//!
//! Services are started in the order they were added and stopped in reverse.
//! Path-change callbacks post [`ReconfigureEvent`]s on a shared channel;
//! [`run`] drains it and restarts the affected service until `shutdown` is
//! cancelled.

pub mod component_info;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::factory::ValveFactory;
use crate::host::HostServer;
use crate::path::PathManager;
use crate::service::{
    ReconfigureReceiver, ReconfigureSender, ServiceDescriptor, ServiceError, ValveService,
};
use component_info::ComponentInfo;

pub struct Supervisor {
    factory: Arc<ValveFactory>,
    paths: Arc<dyn PathManager>,
    host: Arc<dyn HostServer>,
    services: Vec<Arc<ValveService>>,
    events_tx: ReconfigureSender,
    events_rx: Option<ReconfigureReceiver>,
    started_at: Instant,
}

impl Supervisor {
    pub fn new(
        factory: Arc<ValveFactory>,
        paths: Arc<dyn PathManager>,
        host: Arc<dyn HostServer>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            factory,
            paths,
            host,
            services: Vec::new(),
            events_tx,
            events_rx: Some(events_rx),
            started_at: Instant::now(),
        }
    }

    /// Create a service for `descriptor`. Names must be unique.
    pub fn add(&mut self, descriptor: ServiceDescriptor) -> Result<Arc<ValveService>, ServiceError> {
        if self.service(&descriptor.name).is_some() {
            return Err(ServiceError::Duplicate {
                service: descriptor.name,
            });
        }
        debug!(service = %descriptor.name, class = %descriptor.class_name, "service added");
        let service = Arc::new(ValveService::new(
            descriptor,
            self.factory.clone(),
            self.paths.clone(),
            self.host.clone(),
            self.events_tx.clone(),
        ));
        self.services.push(service.clone());
        Ok(service)
    }

    pub fn service(&self, name: &str) -> Option<Arc<ValveService>> {
        self.services.iter().find(|s| s.name() == name).cloned()
    }

    pub fn services(&self) -> &[Arc<ValveService>] {
        &self.services
    }

    /// Receiver for reconfiguration events; hand it to [`run`]. Only the
    /// first call returns `Some`.
    pub fn take_events(&mut self) -> Option<ReconfigureReceiver> {
        self.events_rx.take()
    }

    /// Start every service in order. A failing service does not prevent the
    /// others from starting; the failures are returned.
    pub fn start_all(&self) -> Vec<ServiceError> {
        let failures: Vec<ServiceError> = self
            .services
            .iter()
            .filter_map(|s| s.start().err())
            .collect();
        info!(
            total = self.services.len(),
            failed = failures.len(),
            "valve services started"
        );
        failures
    }

    /// Stop every service, last added first.
    pub fn stop_all(&self) {
        for service in self.services.iter().rev() {
            service.stop();
        }
        info!(total = self.services.len(), "valve services stopped");
    }

    pub fn component_tree(&self) -> ComponentInfo {
        let children = self.services.iter().map(|s| s.info()).collect();
        let mut root = ComponentInfo::running("supervisor", "Supervisor", children);
        root.uptime_ms = Some(self.started_at.elapsed().as_millis() as u64);
        root
    }
}

/// Drain reconfiguration events until `shutdown` is cancelled or every
/// sender is gone.
///
/// Each event restarts the named service via
/// [`ValveService::reconfigure`]; stale events are skipped there.
pub async fn run(
    mut events: ReconfigureReceiver,
    shutdown: CancellationToken,
    services: Vec<Arc<ValveService>>,
) {
    let table: HashMap<String, Arc<ValveService>> = services
        .into_iter()
        .map(|s| (s.name().to_string(), s))
        .collect();

    info!(
        services = ?table.keys().collect::<Vec<_>>(),
        "supervisor ready"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("supervisor shutting down");
                break;
            }

            event = events.recv() => {
                let Some(event) = event else {
                    info!("reconfiguration channel closed, supervisor exiting");
                    break;
                };
                match table.get(&event.service) {
                    Some(service) => match service.reconfigure(&event) {
                        Ok(true) => info!(service = %event.service, generation = service.generation(), "valve reconfigured"),
                        Ok(false) => debug!(service = %event.service, "stale reconfiguration skipped"),
                        Err(e) => error!(service = %event.service, error = %e, "valve reconfiguration failed"),
                    },
                    None => warn!(service = %event.service, "reconfiguration for unknown service"),
                }
            }
        }
    }
}
