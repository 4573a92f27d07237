//! Sandbox orchestration core: port allocation, dev-server processes,
//! readiness probing, public tunnels and the lifecycle that ties them
//! together.

pub mod config;
pub mod lifecycle;
pub mod logs;
pub mod port_alloc;
pub mod port_reaper;
pub mod process_manager;
pub mod readiness;
pub mod store;
pub mod support;
pub mod sync;
pub mod tunnel;

pub use config::AgentConfig;
pub use logs::{DevLog, LogTail};
pub use lifecycle::{
    CreateSandboxParams, LifecycleError, SandboxLifecycle, SandboxUrls, TeardownReport,
};
pub use port_alloc::{AllocError, PortAllocator, PortPool};
pub use port_reaper::{OsPortReaper, PortReaper, ReapReport};
pub use process_manager::{ProcessManager, StartError, StartOutcome};
pub use readiness::ReadinessProber;
pub use store::{DbSandboxStore, SandboxStore, StoreError};
pub use tunnel::{
    CommandTunnelProvider, TunnelError, TunnelHandle, TunnelManager, TunnelProvider,
    TunnelRegistry,
};
