//! Application state management
//!
//! Central container shared by all request handlers: the repository, the
//! telephony gateway, the escalation orchestrator and the softphone sessions.
//! The parts carry their own synchronisation, so the container itself is
//! immutable and cheap to clone.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::config::Settings;
use crate::escalation::EscalationOrchestrator;
use crate::gateway::TelephonyGateway;
use crate::softphone::SoftphoneRegistry;
use crate::store::Repository;

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub gateway: Arc<dyn TelephonyGateway>,
    pub orchestrator: EscalationOrchestrator,
    pub softphones: Arc<SoftphoneRegistry>,
    pub settings: Arc<Settings>,
    start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        settings: Settings,
        repo: Arc<dyn Repository>,
        gateway: Arc<dyn TelephonyGateway>,
    ) -> Self {
        info!("Initializing application state");

        let orchestrator = EscalationOrchestrator::new(
            repo.clone(),
            gateway.clone(),
            settings.escalation.clone(),
            settings.gateway.dispatch_extension.clone(),
        );
        let softphones = Arc::new(SoftphoneRegistry::new(repo.clone(), gateway.clone()));

        Self {
            repo,
            gateway,
            orchestrator,
            softphones,
            settings: Arc::new(settings),
            start_time: Utc::now(),
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.start_time).num_seconds().max(0) as u64
    }

    pub fn gateway_configured(&self) -> bool {
        self.settings.gateway.has_credentials()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::ScriptedGateway;
    use crate::store::MemoryStore;

    fn state() -> AppState {
        let settings = Settings::from_source(|_| None).unwrap();
        AppState::new(
            settings,
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedGateway::new()),
        )
    }

    #[test]
    fn test_app_state_creation() {
        let state = state();
        assert!(state.uptime_seconds() < 5);
        assert!(!state.gateway_configured());
    }

    #[tokio::test]
    async fn test_clones_share_repository() {
        let state = state();
        let clone = state.clone();

        clone
            .repo
            .insert_client(crate::seed::client("Ida", "Pohl"))
            .await
            .unwrap();

        assert_eq!(state.repo.list_clients().await.unwrap().len(), 1);
    }
}
