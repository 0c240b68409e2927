//! Business reporting
//!
//! KPI report computed on demand from the repository contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::{ChainAction, ChainActionType};
use crate::error::AppResult;
use crate::models::{
    AlertPriority, AlertStatus, AlertType, Client, Device, DeviceStatus, Dispatcher,
    EmergencyAlert,
};
use crate::store::Repository;

const PRIORITIES: [AlertPriority; 4] = [
    AlertPriority::Low,
    AlertPriority::Medium,
    AlertPriority::High,
    AlertPriority::Critical,
];
const STATUSES: [AlertStatus; 3] = [AlertStatus::New, AlertStatus::InProgress, AlertStatus::Resolved];
const DEVICE_STATUSES: [DeviceStatus; 3] = [
    DeviceStatus::Online,
    DeviceStatus::Offline,
    DeviceStatus::Maintenance,
];

/// Count for one category value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tally<K> {
    pub key: K,
    pub count: usize,
}

fn tally<K, T>(keys: &[K], items: &[T], key_of: impl Fn(&T) -> K) -> Vec<Tally<K>>
where
    K: Copy + PartialEq,
{
    keys.iter()
        .map(|key| Tally {
            key: *key,
            count: items.iter().filter(|item| key_of(*item) == *key).count(),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTotals {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTotals {
    pub total: usize,
    pub by_status: Vec<Tally<DeviceStatus>>,
    pub low_battery: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertTotals {
    pub total: usize,
    pub by_type: Vec<Tally<AlertType>>,
    pub by_priority: Vec<Tally<AlertPriority>>,
    pub by_status: Vec<Tally<AlertStatus>>,
    /// None until at least one alert was acknowledged
    pub mean_minutes_to_acknowledge: Option<f64>,
    pub mean_minutes_to_resolve: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiReport {
    pub generated_at: DateTime<Utc>,
    pub clients: ClientTotals,
    pub devices: DeviceTotals,
    pub alerts: AlertTotals,
    pub chain_actions: Vec<Tally<ChainActionType>>,
    pub calls_handled: u64,
}

/// Mean duration in minutes over the alerts that reached the given point
fn mean_minutes(
    alerts: &[EmergencyAlert],
    reached: impl Fn(&EmergencyAlert) -> Option<DateTime<Utc>>,
) -> Option<f64> {
    let (sum, count) = alerts
        .iter()
        .filter_map(|a| reached(a).map(|at| (at - a.raised_at).num_seconds().max(0) as f64 / 60.0))
        .fold((0.0, 0usize), |(sum, count), minutes| (sum + minutes, count + 1));

    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

pub fn build_report(
    clients: &[Client],
    devices: &[Device],
    alerts: &[EmergencyAlert],
    actions: &[ChainAction],
    dispatchers: &[Dispatcher],
) -> KpiReport {
    let active_clients = clients.iter().filter(|c| c.active).count();

    KpiReport {
        generated_at: Utc::now(),
        clients: ClientTotals {
            total: clients.len(),
            active: active_clients,
            inactive: clients.len() - active_clients,
        },
        devices: DeviceTotals {
            total: devices.len(),
            by_status: tally(&DEVICE_STATUSES, devices, |d| d.status),
            low_battery: devices.iter().filter(|d| d.is_low_battery()).count(),
        },
        alerts: AlertTotals {
            total: alerts.len(),
            by_type: tally(&AlertType::ALL, alerts, |a| a.alert_type),
            by_priority: tally(&PRIORITIES, alerts, |a| a.priority),
            by_status: tally(&STATUSES, alerts, |a| a.status),
            mean_minutes_to_acknowledge: mean_minutes(alerts, |a| a.acknowledged_at),
            mean_minutes_to_resolve: mean_minutes(alerts, |a| a.resolved_at),
        },
        chain_actions: tally(&ChainActionType::ALL, actions, |a| a.action_type),
        calls_handled: dispatchers.iter().map(|d| d.calls_handled as u64).sum(),
    }
}

pub async fn kpi_report(repo: &dyn Repository) -> AppResult<KpiReport> {
    let clients = repo.list_clients().await?;
    let devices = repo.list_devices().await?;
    let alerts = repo.list_alerts().await?;
    let actions = repo.list_all_actions().await?;
    let dispatchers = repo.list_dispatchers().await?;

    Ok(build_report(&clients, &devices, &alerts, &actions, &dispatchers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed;
    use chrono::Duration;
    use uuid::Uuid;

    fn count<K: PartialEq>(tallies: &[Tally<K>], key: K) -> usize {
        tallies
            .iter()
            .find(|t| t.key == key)
            .map(|t| t.count)
            .unwrap_or(0)
    }

    fn alert_after(alert_type: AlertType, ack_min: Option<i64>, resolve_min: Option<i64>) -> EmergencyAlert {
        let mut alert = EmergencyAlert::new(alert_type);
        alert.acknowledged_at = ack_min.map(|m| alert.raised_at + Duration::minutes(m));
        alert.resolved_at = resolve_min.map(|m| alert.raised_at + Duration::minutes(m));
        if alert.resolved_at.is_some() {
            alert.status = AlertStatus::Resolved;
        } else if alert.acknowledged_at.is_some() {
            alert.status = AlertStatus::InProgress;
        }
        alert
    }

    #[test]
    fn test_empty_report() {
        let report = build_report(&[], &[], &[], &[], &[]);
        assert_eq!(report.alerts.total, 0);
        assert!(report.alerts.mean_minutes_to_acknowledge.is_none());
        assert_eq!(report.chain_actions.len(), ChainActionType::ALL.len());
        assert_eq!(report.calls_handled, 0);
    }

    #[test]
    fn test_alert_kpis() {
        let alerts = vec![
            alert_after(AlertType::FallDetection, Some(2), Some(30)),
            alert_after(AlertType::FallDetection, Some(4), None),
            alert_after(AlertType::LowBattery, None, None),
        ];

        let report = build_report(&[], &[], &alerts, &[], &[]);

        assert_eq!(count(&report.alerts.by_type, AlertType::FallDetection), 2);
        assert_eq!(count(&report.alerts.by_priority, AlertPriority::Critical), 2);
        assert_eq!(count(&report.alerts.by_status, AlertStatus::New), 1);
        assert_eq!(report.alerts.mean_minutes_to_acknowledge, Some(3.0));
        assert_eq!(report.alerts.mean_minutes_to_resolve, Some(30.0));
    }

    #[test]
    fn test_directory_kpis() {
        let mut inactive = seed::client("Karl", "Vogel");
        inactive.active = false;
        let clients = vec![seed::client("Eva", "Roth"), inactive];

        let mut low = seed::device(None, "EB-1", crate::models::DeviceType::EmergencyButton);
        low.battery_level = Some(5);
        let mut offline = seed::device(None, "EB-2", crate::models::DeviceType::EmergencyButton);
        offline.status = DeviceStatus::Offline;

        let mut busy = seed::dispatcher("Anna", "e1");
        busy.calls_handled = 7;
        let mut other = seed::dispatcher("Jonas", "e2");
        other.calls_handled = 3;

        let actions = vec![
            ChainAction::new(Uuid::new_v4(), ChainActionType::FamilyNotified, "ok"),
            ChainAction::new(Uuid::new_v4(), ChainActionType::FamilyNotified, "ok"),
        ];

        let report = build_report(&clients, &[low, offline], &[], &actions, &[busy, other]);

        assert_eq!(report.clients.active, 1);
        assert_eq!(report.clients.inactive, 1);
        assert_eq!(report.devices.low_battery, 1);
        assert_eq!(count(&report.devices.by_status, DeviceStatus::Offline), 1);
        assert_eq!(count(&report.chain_actions, ChainActionType::FamilyNotified), 2);
        assert_eq!(report.calls_handled, 10);
    }

    #[tokio::test]
    async fn test_report_from_repository() {
        let store = crate::store::MemoryStore::new();
        seed::load_demo_data(&store).await.unwrap();

        let report = kpi_report(&store).await.unwrap();

        assert_eq!(report.clients.total, 2);
        assert_eq!(report.devices.total, 4);
    }
}
