//! Provisioning the isolation backend and driving the guest IDE service
//!
//! Each call to [Orchestrator::initialize()] walks the state machine from the
//! top: probe for a backend, provision a guest, start the service through
//! its control script, and poll the readiness url.

pub mod control;
pub mod guest;
pub mod health;
pub mod local;

pub use self::{
    control::ServiceStatus,
    guest::{AliasOrigin, DistroAlias, Guest},
};

use crate::{
    assets::{AssetSource, BundledAssets},
    backend::{self, Backend},
    context::Context,
    errors::{InstallError, OrchestratorError},
    events::{EventBus, TerminalEvent},
    rootfs::{
        fetch::{Fetch, HttpFetcher},
        Installer,
    },
};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Where the orchestrator is in its lifecycle
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrchestratorState {
    Idle,
    ProbingBackend,
    Provisioning,
    Starting,
    HealthChecking,
    /// Guest service is up and answering
    Ready,
    /// No isolation backend, running in local mode
    Degraded,
    Failed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OrchestratorState::Idle => "idle",
            OrchestratorState::ProbingBackend => "probing backend",
            OrchestratorState::Provisioning => "provisioning",
            OrchestratorState::Starting => "starting",
            OrchestratorState::HealthChecking => "health checking",
            OrchestratorState::Ready => "ready",
            OrchestratorState::Degraded => "degraded",
            OrchestratorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Shared {
    state: OrchestratorState,
    backend: Option<Backend>,
    guest: Option<Guest>,
}

/// Brings up the guest environment and reports on it
#[derive(Debug)]
pub struct Orchestrator<F = HttpFetcher> {
    context: Context,
    events: EventBus,
    installer: Installer<F>,
    assets: Arc<dyn AssetSource>,
    shared: Mutex<Shared>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Orchestrator<HttpFetcher> {
    /// Orchestrator that downloads the rootfs over HTTP when needed
    pub fn new(context: Context, events: EventBus) -> Result<Self, OrchestratorError> {
        let fetcher = HttpFetcher::new(&context).map_err(InstallError::from)?;
        Ok(Orchestrator::with_fetcher(context, events, fetcher))
    }
}

impl<F: Fetch> Orchestrator<F> {
    pub fn with_fetcher(context: Context, events: EventBus, fetcher: F) -> Self {
        let installer = Installer::new(context.installation(), fetcher, events.clone());
        Orchestrator {
            context,
            events,
            installer,
            assets: Arc::new(BundledAssets),
            shared: Mutex::new(Shared {
                state: OrchestratorState::Idle,
                backend: None,
                guest: None,
            }),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Use a different asset source for the bootstrap script and local UI
    pub fn with_assets(mut self, assets: Arc<dyn AssetSource>) -> Self {
        self.installer = self.installer.with_assets(assets.clone());
        self.assets = assets;
        self
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: OrchestratorState) {
        log::debug!("orchestrator state: {}", state);
        self.shared().state = state;
    }

    pub fn state(&self) -> OrchestratorState {
        self.shared().state
    }

    /// Backend chosen by the last [initialize()](Orchestrator::initialize)
    pub fn backend(&self) -> Option<Backend> {
        self.shared().backend.clone()
    }

    /// Guest provisioned by the last [initialize()](Orchestrator::initialize)
    pub fn guest(&self) -> Option<Guest> {
        self.shared().guest.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn installer(&self) -> &Installer<F> {
        &self.installer
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Bring the environment up as far as this host allows
    ///
    /// Returns [OrchestratorState::Ready] or [OrchestratorState::Degraded].
    /// Any error leaves the state at [OrchestratorState::Failed], and a
    /// guest that was started but never became healthy is left running.
    pub async fn initialize(&self) -> Result<OrchestratorState, OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.initialize_inner().await {
            Ok(state) => {
                self.set_state(state);
                Ok(state)
            }
            Err(err) => {
                self.set_state(OrchestratorState::Failed);
                // the installer reports its own failures
                if !matches!(err, OrchestratorError::Install(_)) {
                    self.events
                        .emit(TerminalEvent::failure("environment setup failed", &err));
                }
                Err(err)
            }
        }
    }

    async fn initialize_inner(&self) -> Result<OrchestratorState, OrchestratorError> {
        self.set_state(OrchestratorState::ProbingBackend);
        let backend = backend::probe(&self.context);
        {
            let mut shared = self.shared();
            shared.backend = Some(backend.clone());
            shared.guest = None;
        }

        let guest = match &backend {
            Backend::Local => {
                self.events.emit(backend::unavailable_warning(&self.context));
                local::prepare_workspace(&self.context.workspace_dir(), self.assets.as_ref())
                    .await?;
                self.events.emit(TerminalEvent::status(format!(
                    "local workspace ready at {}",
                    self.context.workspace_dir().display()
                )));
                return Ok(OrchestratorState::Degraded);
            }
            Backend::ContainerEngine { engine } => {
                self.set_state(OrchestratorState::Provisioning);
                self.events
                    .emit(TerminalEvent::status(format!("using {}", backend)));
                guest::provision_container(
                    engine,
                    &self.context.backend,
                    &self.context.workspace_dir(),
                    &self.context.cache_dir.join("container"),
                    &self.events,
                )
                .await?
            }
            Backend::UserspaceDistro { tool } => {
                self.set_state(OrchestratorState::Provisioning);
                self.events
                    .emit(TerminalEvent::status(format!("using {}", backend)));
                self.installer.install().await?;
                guest::provision_distro(tool, &self.context.backend, &self.events).await?
            }
        };
        self.shared().guest = Some(guest.clone());

        self.set_state(OrchestratorState::Starting);
        self.events
            .emit(TerminalEvent::status(format!("starting IDE service in {}", guest)));
        let script = &self.context.backend.control_script;
        control::install(&guest, script, &self.context.backend.service_command)
            .await
            .map_err(|err| OrchestratorError::Start(err.to_string()))?;
        control::invoke(&guest, script, "start")
            .await
            .map_err(|err| OrchestratorError::Start(err.to_string()))?;

        self.set_state(OrchestratorState::HealthChecking);
        self.events.emit(TerminalEvent::status(format!(
            "waiting for {}",
            self.context.health.url
        )));
        health::wait_until_ready(&self.context.health).await?;
        self.events.emit(TerminalEvent::status(format!(
            "IDE ready at {}",
            self.context.health.url
        )));
        Ok(OrchestratorState::Ready)
    }

    /// Ask the guest service to stop
    ///
    /// A failing stop verb is logged and tolerated. Without a guest this does
    /// nothing.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        let guest = match self.guest() {
            Some(guest) => guest,
            None => return Ok(()),
        };
        match control::invoke(&guest, &self.context.backend.control_script, "stop").await {
            Ok(_) => self.events.emit(TerminalEvent::status("IDE service stopped")),
            Err(OrchestratorError::ControlScript { code, stderr, .. }) => {
                self.events.emit(TerminalEvent::warning(format!(
                    "stop exited with {:?}: {}",
                    code, stderr
                )));
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    /// Ask the control script whether the service is running
    pub async fn status(&self) -> Result<ServiceStatus, OrchestratorError> {
        let guest = self.guest().ok_or(OrchestratorError::NoGuest)?;
        let output =
            control::invoke(&guest, &self.context.backend.control_script, "status").await?;
        Ok(ServiceStatus::parse(&output))
    }

    /// Find an existing guest without provisioning or starting anything
    ///
    /// Lets `status` and `stop` work from a fresh process, for the command
    /// line front end. Returns `None` when no guest has been set up yet.
    pub async fn attach(&self) -> Result<Option<Guest>, OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        let backend = backend::probe(&self.context);
        let guest = match &backend {
            Backend::Local => None,
            Backend::ContainerEngine { engine } => Some(Guest::Container {
                engine: engine.clone(),
                name: self.context.backend.container_name.clone(),
            }),
            Backend::UserspaceDistro { tool } => {
                guest::find_distro(tool, &self.context.backend).await?
            }
        };
        let mut shared = self.shared();
        shared.backend = Some(backend);
        shared.guest = guest.clone();
        Ok(guest)
    }
}
