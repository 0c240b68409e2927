//! Dispatcher console dashboard
//!
//! Snapshot polled by the console. Gateway failures degrade the active call
//! count to zero instead of failing the request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::config::DashboardSettings;
use crate::error::AppResult;
use crate::gateway::TelephonyGateway;
use crate::models::{AlertStatus, DeviceStatus, DispatcherStatus, EmergencyAlert};
use crate::softphone::{ConnectionState, SoftphoneRegistry};
use crate::store::Repository;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherSummary {
    pub id: Uuid,
    pub name: String,
    pub extension: String,
    pub status: DispatcherStatus,
    pub calls_handled: u32,
    pub softphone: ConnectionState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSnapshot {
    pub active_alerts: usize,
    pub new_alerts: usize,
    pub active_calls: usize,
    pub online_dispatchers: usize,
    pub online_devices: usize,
    pub low_battery_devices: usize,
    pub recent_alerts: Vec<EmergencyAlert>,
    pub dispatchers: Vec<DispatcherSummary>,
    /// Suggested seconds until the next poll
    pub poll_interval_secs: u64,
    pub generated_at: DateTime<Utc>,
}

pub async fn snapshot(
    repo: &dyn Repository,
    gateway: &dyn TelephonyGateway,
    softphones: &SoftphoneRegistry,
    settings: &DashboardSettings,
) -> AppResult<DashboardSnapshot> {
    let alerts = repo.list_alerts().await?;
    let devices = repo.list_devices().await?;
    let dispatchers = repo.list_dispatchers().await?;
    let states = softphones.states().await;

    let active_calls = match gateway.active_calls().await {
        Ok(calls) => calls.len(),
        Err(e) => {
            warn!(error = %e, "Active calls unavailable for dashboard");
            0
        }
    };

    let dispatchers: Vec<DispatcherSummary> = dispatchers
        .into_iter()
        .map(|d| DispatcherSummary {
            softphone: states.get(&d.id).cloned().unwrap_or(ConnectionState::Offline),
            id: d.id,
            name: d.name,
            extension: d.extension,
            status: d.status,
            calls_handled: d.calls_handled,
        })
        .collect();

    Ok(DashboardSnapshot {
        active_alerts: alerts.iter().filter(|a| !a.is_resolved()).count(),
        new_alerts: alerts.iter().filter(|a| a.status == AlertStatus::New).count(),
        active_calls,
        online_dispatchers: dispatchers
            .iter()
            .filter(|d| d.status == DispatcherStatus::Online)
            .count(),
        online_devices: devices
            .iter()
            .filter(|d| d.status == DeviceStatus::Online)
            .count(),
        low_battery_devices: devices.iter().filter(|d| d.is_low_battery()).count(),
        // list_alerts is newest first
        recent_alerts: alerts.into_iter().take(settings.recent_alerts).collect(),
        dispatchers,
        poll_interval_secs: settings.poll_interval_secs,
        generated_at: Utc::now(),
    })
}
