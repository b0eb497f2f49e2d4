#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("rootbox only works on linux or android");

#[macro_use] extern crate lazy_static;
#[macro_use] extern crate serde;

pub mod assets;
pub mod backend;
pub mod completion;
pub mod context;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod rootfs;
pub mod session;

pub use crate::{
    backend::Backend,
    context::Context,
    events::{EventBus, TerminalEvent},
    orchestrator::{Orchestrator, OrchestratorState, ServiceStatus},
    rootfs::{Installer, RootfsInstallation},
    session::{SessionState, ShellSession},
};
