//! Alert lifecycle
//!
//! Raising alerts from manual entry or device signals and moving them through
//! New -> InProgress -> Resolved. Repeated or backwards transitions are
//! reported in the result, never applied.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::models::{
    AlertChange, AlertInput, AlertStatus, DeviceSignal, DeviceStatus, EmergencyAlert,
};
use crate::store::Repository;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherRef {
    pub dispatcher_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    #[validate(length(min = 1, max = 64, message = "Resolution code is required"))]
    pub resolution: String,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    pub dispatcher_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NoteRequest {
    #[validate(length(min = 1, max = 2000))]
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignClientRequest {
    pub client_id: Uuid,
}

/// Result of a status change request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub success: bool,
    pub message: String,
    pub alert: EmergencyAlert,
}

/// Fails with NotFound when an attributed dispatcher does not exist
pub async fn ensure_dispatcher(repo: &dyn Repository, dispatcher_id: Option<Uuid>) -> AppResult<()> {
    if let Some(id) = dispatcher_id {
        if repo.get_dispatcher(id).await?.is_none() {
            return Err(AppError::dispatcher_not_found(id));
        }
    }
    Ok(())
}

pub async fn get_alert(repo: &dyn Repository, alert_id: Uuid) -> AppResult<EmergencyAlert> {
    repo.get_alert(alert_id)
        .await?
        .ok_or_else(|| AppError::alert_not_found(alert_id))
}

/// Create an alert from manual entry or a device
pub async fn raise_alert(repo: &dyn Repository, input: AlertInput) -> AppResult<EmergencyAlert> {
    let mut alert = EmergencyAlert::new(input.alert_type);
    if let Some(priority) = input.priority {
        alert.priority = priority;
    }
    alert.caller_number = input.caller_number;
    alert.heart_rate = input.heart_rate;
    alert.details = input.details;

    if let Some(device_id) = input.device_id {
        let mut device = repo
            .get_device(device_id)
            .await?
            .ok_or_else(|| AppError::device_not_found(device_id))?;
        alert.device_id = Some(device_id);
        alert.client_id = device.client_id;

        device.last_seen = Some(Utc::now());
        repo.update_device(device).await?;
    }

    if let Some(client_id) = input.client_id {
        if repo.get_client(client_id).await?.is_none() {
            return Err(AppError::client_not_found(client_id));
        }
        alert.client_id = Some(client_id);
    }

    let alert = repo.insert_alert(alert).await?;
    info!(
        alert_id = %alert.id,
        alert_type = ?alert.alert_type,
        priority = ?alert.priority,
        client_id = ?alert.client_id,
        "Alert raised"
    );
    Ok(alert)
}

/// Create an alert from a device signal, updating the device's telemetry
pub async fn raise_from_device(
    repo: &dyn Repository,
    device_id: Uuid,
    signal: DeviceSignal,
) -> AppResult<EmergencyAlert> {
    let mut device = repo
        .get_device(device_id)
        .await?
        .ok_or_else(|| AppError::device_not_found(device_id))?;

    if let Some(level) = signal.battery_level {
        device.battery_level = Some(level);
    }
    if device.status == DeviceStatus::Offline {
        device.status = DeviceStatus::Online;
    }
    repo.update_device(device).await?;

    raise_alert(
        repo,
        AlertInput {
            alert_type: signal.alert_type,
            priority: None,
            client_id: None,
            device_id: Some(device_id),
            caller_number: None,
            heart_rate: signal.heart_rate,
            details: signal.details,
        },
    )
    .await
}

/// New -> InProgress
pub async fn acknowledge(
    repo: &dyn Repository,
    alert_id: Uuid,
    dispatcher_id: Option<Uuid>,
) -> AppResult<StatusChange> {
    ensure_dispatcher(repo, dispatcher_id).await?;
    let update = repo
        .apply_alert_change(alert_id, AlertChange::Acknowledge { dispatcher_id })
        .await?;

    if !update.applied {
        let message = match update.alert.status {
            AlertStatus::Resolved => "Alert is already resolved",
            _ => "Alert is already acknowledged",
        };
        return Ok(StatusChange {
            success: false,
            message: message.to_string(),
            alert: update.alert,
        });
    }

    info!(alert_id = %alert_id, dispatcher_id = ?dispatcher_id, "Alert acknowledged");
    Ok(StatusChange {
        success: true,
        message: "Alert acknowledged".to_string(),
        alert: update.alert,
    })
}

/// Any open status -> Resolved (terminal)
pub async fn resolve(
    repo: &dyn Repository,
    alert_id: Uuid,
    request: ResolveRequest,
) -> AppResult<StatusChange> {
    ensure_dispatcher(repo, request.dispatcher_id).await?;
    let change = AlertChange::Resolve {
        resolution: request.resolution,
        notes: request.notes,
        dispatcher_id: request.dispatcher_id,
    };
    let update = repo.apply_alert_change(alert_id, change).await?;

    if !update.applied {
        return Ok(StatusChange {
            success: false,
            message: "Alert is already resolved".to_string(),
            alert: update.alert,
        });
    }

    info!(
        alert_id = %alert_id,
        resolution = ?update.alert.resolution,
        "Alert resolved"
    );
    Ok(StatusChange {
        success: true,
        message: "Alert resolved".to_string(),
        alert: update.alert,
    })
}

/// Notes remain writable in every status
pub async fn add_note(repo: &dyn Repository, alert_id: Uuid, note: &str) -> AppResult<EmergencyAlert> {
    let update = repo
        .apply_alert_change(alert_id, AlertChange::AppendNote(note.to_string()))
        .await?;
    Ok(update.alert)
}

/// Link an alert that arrived without a matched client
pub async fn assign_client(
    repo: &dyn Repository,
    alert_id: Uuid,
    client_id: Uuid,
) -> AppResult<StatusChange> {
    get_alert(repo, alert_id).await?;
    if repo.get_client(client_id).await?.is_none() {
        return Err(AppError::client_not_found(client_id));
    }

    let update = repo
        .apply_alert_change(alert_id, AlertChange::AssignClient(client_id))
        .await?;
    if !update.applied {
        return Ok(StatusChange {
            success: false,
            message: "Resolved alerts cannot be reassigned".to_string(),
            alert: update.alert,
        });
    }

    info!(alert_id = %alert_id, client_id = %client_id, "Client assigned to alert");
    Ok(StatusChange {
        success: true,
        message: "Client assigned".to_string(),
        alert: update.alert,
    })
}

/// Alerts newest first, optionally filtered by status
pub async fn list_alerts(
    repo: &dyn Repository,
    status: Option<AlertStatus>,
) -> AppResult<Vec<EmergencyAlert>> {
    let alerts = repo.list_alerts().await?;
    Ok(match status {
        Some(status) => alerts.into_iter().filter(|a| a.status == status).collect(),
        None => alerts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertType, DeviceType};
    use crate::seed;
    use crate::store::MemoryStore;

    fn resolve_request(code: &str) -> ResolveRequest {
        ResolveRequest {
            resolution: code.to_string(),
            notes: None,
            dispatcher_id: None,
        }
    }

    #[tokio::test]
    async fn test_device_alert_matches_client() {
        let store = MemoryStore::new();
        let client = store.insert_client(seed::client("Rita", "Vogel")).await.unwrap();
        let device = store
            .insert_device(seed::device(Some(client.id), "FD-9", DeviceType::FallDetector))
            .await
            .unwrap();

        let alert = raise_from_device(
            &store,
            device.id,
            DeviceSignal {
                alert_type: AlertType::FallDetection,
                heart_rate: None,
                battery_level: Some(40),
                details: Some("Fall in bathroom".into()),
            },
        )
        .await
        .unwrap();

        assert_eq!(alert.client_id, Some(client.id));
        assert_eq!(alert.device_id, Some(device.id));
        let device = store.get_device(device.id).await.unwrap().unwrap();
        assert_eq!(device.battery_level, Some(40));
    }

    #[tokio::test]
    async fn test_unmatched_alert_then_assign() {
        let store = MemoryStore::new();
        let alert = raise_alert(&store, AlertInput::of_type(AlertType::ManualAlert))
            .await
            .unwrap();
        assert!(alert.client_id.is_none());

        let client = store.insert_client(seed::client("Rita", "Vogel")).await.unwrap();
        let change = assign_client(&store, alert.id, client.id).await.unwrap();
        assert!(change.success);
        assert_eq!(change.alert.client_id, Some(client.id));
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_found() {
        let store = MemoryStore::new();
        let mut input = AlertInput::of_type(AlertType::FallDetection);
        input.device_id = Some(Uuid::new_v4());
        let err = raise_alert(&store, input).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(store.list_alerts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledge_resolved_alert_does_not_regress() {
        let store = MemoryStore::new();
        let alert = raise_alert(&store, AlertInput::of_type(AlertType::ManualAlert))
            .await
            .unwrap();

        assert!(acknowledge(&store, alert.id, None).await.unwrap().success);
        assert!(resolve(&store, alert.id, resolve_request("HELP_SENT")).await.unwrap().success);

        let change = acknowledge(&store, alert.id, None).await.unwrap();
        assert!(!change.success);
        assert_eq!(change.alert.status, AlertStatus::Resolved);
        let stored = store.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Resolved);
    }

    #[tokio::test]
    async fn test_resolve_twice_keeps_first_resolution() {
        let store = MemoryStore::new();
        let alert = raise_alert(&store, AlertInput::of_type(AlertType::InactivityAlert))
            .await
            .unwrap();

        resolve(&store, alert.id, resolve_request("FALSE_ALARM")).await.unwrap();
        let second = resolve(&store, alert.id, resolve_request("AMBULANCE")).await.unwrap();

        assert!(!second.success);
        assert_eq!(second.alert.resolution.as_deref(), Some("FALSE_ALARM"));
    }

    #[tokio::test]
    async fn test_notes_after_resolution() {
        let store = MemoryStore::new();
        let alert = raise_alert(&store, AlertInput::of_type(AlertType::ManualAlert))
            .await
            .unwrap();
        resolve(&store, alert.id, resolve_request("FALSE_ALARM")).await.unwrap();

        let alert = add_note(&store, alert.id, "Daughter confirmed all fine").await.unwrap();
        assert_eq!(alert.notes.as_deref(), Some("Daughter confirmed all fine"));
        assert_eq!(alert.status, AlertStatus::Resolved);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_notes_and_acknowledge_lose_nothing() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let alert = raise_alert(store.as_ref(), AlertInput::of_type(AlertType::FallDetection))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                add_note(store.as_ref(), alert.id, &format!("call attempt {}", i))
                    .await
                    .unwrap();
            }));
        }
        let acknowledger = store.clone();
        handles.push(tokio::spawn(async move {
            acknowledge(acknowledger.as_ref(), alert.id, None).await.unwrap();
        }));
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = get_alert(store.as_ref(), alert.id).await.unwrap();
        assert_eq!(stored.status, AlertStatus::InProgress);
        assert_eq!(stored.notes.unwrap().lines().count(), 10);
    }

    #[tokio::test]
    async fn test_unknown_dispatcher_rejected() {
        let store = MemoryStore::new();
        let alert = raise_alert(&store, AlertInput::of_type(AlertType::ManualAlert))
            .await
            .unwrap();
        let err = acknowledge(&store, alert.id, Some(Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_filter_by_status() {
        let store = MemoryStore::new();
        let first = raise_alert(&store, AlertInput::of_type(AlertType::ManualAlert))
            .await
            .unwrap();
        raise_alert(&store, AlertInput::of_type(AlertType::LowBattery))
            .await
            .unwrap();
        acknowledge(&store, first.id, None).await.unwrap();

        let open = list_alerts(&store, Some(AlertStatus::New)).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].alert_type, AlertType::LowBattery);
    }
}
