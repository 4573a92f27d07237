use std::sync::Arc;

use themebox_agent::{
    AgentConfig, CommandTunnelProvider, DbSandboxStore, OsPortReaper, SandboxLifecycle,
    TunnelManager, TunnelRegistry,
};
use themebox_db::sea_orm::DatabaseConnection;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub lifecycle: Arc<SandboxLifecycle>,
}

impl AppState {
    /// Wires the lifecycle to the database, the OS reaper and the configured
    /// tunnel command. The tunnel registry lives as long as this state.
    pub fn new(cfg: &AgentConfig, db: Arc<DatabaseConnection>) -> Self {
        let store = Arc::new(DbSandboxStore::new(db.clone()));
        let reaper = Arc::new(OsPortReaper::new(cfg.kill_grace()));
        let provider = Arc::new(CommandTunnelProvider::from_config(&cfg.tunnel));
        let tunnels = Arc::new(TunnelManager::new(provider, TunnelRegistry::new(), &cfg.tunnel));

        Self {
            db,
            lifecycle: Arc::new(SandboxLifecycle::new(cfg, store, reaper, tunnels)),
        }
    }
}
