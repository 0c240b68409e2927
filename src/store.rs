//! Contact directory and alert repository
//!
//! [`Repository`] is the persistence seam used by every service. The
//! in-memory [`MemoryStore`] keeps all tables behind one async `RwLock`, so
//! each call is a single atomic unit.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::chain::ChainAction;
use crate::error::{AppError, AppResult};
use crate::models::{
    AlertChange, Client, ClientEmergencyInfo, Device, Dispatcher, DispatcherStatus,
    EmergencyAlert, EmergencyContact, Medication,
};

/// Outcome of a conditional chain-action insert
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Inserted(ChainAction),
    /// An action of the same type already existed for the alert
    Existing(ChainAction),
}

/// Stored alert after an [`AlertChange`]
#[derive(Debug, Clone, PartialEq)]
pub struct AlertUpdate {
    /// False when the alert's status refused the change
    pub applied: bool,
    pub alert: EmergencyAlert,
}

impl AppendOutcome {
    pub fn action(&self) -> &ChainAction {
        match self {
            AppendOutcome::Inserted(action) | AppendOutcome::Existing(action) => action,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, AppendOutcome::Inserted(_))
    }
}

#[async_trait]
pub trait Repository: Send + Sync {
    async fn insert_client(&self, client: Client) -> AppResult<Client>;
    async fn get_client(&self, id: Uuid) -> AppResult<Option<Client>>;
    async fn list_clients(&self) -> AppResult<Vec<Client>>;

    async fn insert_contact(&self, contact: EmergencyContact) -> AppResult<EmergencyContact>;
    /// Contacts of a client ordered by priority rank ascending
    async fn list_contacts(&self, client_id: Uuid) -> AppResult<Vec<EmergencyContact>>;

    async fn insert_medication(&self, medication: Medication) -> AppResult<Medication>;
    async fn list_medications(&self, client_id: Uuid) -> AppResult<Vec<Medication>>;

    async fn insert_device(&self, device: Device) -> AppResult<Device>;
    async fn get_device(&self, id: Uuid) -> AppResult<Option<Device>>;
    async fn list_devices(&self) -> AppResult<Vec<Device>>;
    async fn update_device(&self, device: Device) -> AppResult<Device>;

    async fn insert_dispatcher(&self, dispatcher: Dispatcher) -> AppResult<Dispatcher>;
    async fn get_dispatcher(&self, id: Uuid) -> AppResult<Option<Dispatcher>>;
    async fn list_dispatchers(&self) -> AppResult<Vec<Dispatcher>>;
    async fn set_dispatcher_status(
        &self,
        id: Uuid,
        status: DispatcherStatus,
    ) -> AppResult<Dispatcher>;
    async fn record_call_handled(&self, id: Uuid) -> AppResult<Dispatcher>;

    async fn insert_alert(&self, alert: EmergencyAlert) -> AppResult<EmergencyAlert>;
    async fn get_alert(&self, id: Uuid) -> AppResult<Option<EmergencyAlert>>;
    /// Alerts ordered newest first
    async fn list_alerts(&self) -> AppResult<Vec<EmergencyAlert>>;
    /// Read, change and store an alert under one lock. Changes the current
    /// status does not allow are refused, so the status never moves backwards.
    async fn apply_alert_change(&self, id: Uuid, change: AlertChange) -> AppResult<AlertUpdate>;

    async fn append_action(&self, action: ChainAction) -> AppResult<ChainAction>;
    /// Insert unless an action of the same type exists for the alert
    async fn append_action_once(&self, action: ChainAction) -> AppResult<AppendOutcome>;
    /// Actions of one alert in insertion order
    async fn list_actions(&self, alert_id: Uuid) -> AppResult<Vec<ChainAction>>;
    async fn list_all_actions(&self) -> AppResult<Vec<ChainAction>>;
}

/// Load the read-only emergency projection of a client
pub async fn load_emergency_info(
    repo: &dyn Repository,
    client_id: Uuid,
) -> AppResult<ClientEmergencyInfo> {
    let client = repo
        .get_client(client_id)
        .await?
        .ok_or_else(|| AppError::client_not_found(client_id))?;
    let contacts = repo.list_contacts(client_id).await?;
    let medications = repo.list_medications(client_id).await?;

    Ok(ClientEmergencyInfo::build(&client, contacts, medications))
}

#[derive(Debug, Default)]
struct Tables {
    clients: HashMap<Uuid, Client>,
    contacts: HashMap<Uuid, EmergencyContact>,
    medications: HashMap<Uuid, Medication>,
    devices: HashMap<Uuid, Device>,
    dispatchers: HashMap<Uuid, Dispatcher>,
    alerts: HashMap<Uuid, EmergencyAlert>,
    /// Append-only, kept in sequence order
    actions: Vec<ChainAction>,
    next_sequence: u64,
}

impl Tables {
    fn push_action(&mut self, mut action: ChainAction) -> ChainAction {
        self.next_sequence += 1;
        action.sequence = self.next_sequence;
        self.actions.push(action.clone());
        action
    }

    fn ensure_client(&self, id: Uuid) -> AppResult<()> {
        if self.clients.contains_key(&id) {
            Ok(())
        } else {
            Err(AppError::client_not_found(id))
        }
    }

    fn ensure_alert(&self, id: Uuid) -> AppResult<()> {
        if self.alerts.contains_key(&id) {
            Ok(())
        } else {
            Err(AppError::alert_not_found(id))
        }
    }
}

/// In-memory repository
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        info!("Initializing in-memory directory store");
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryStore {
    async fn insert_client(&self, client: Client) -> AppResult<Client> {
        let mut tables = self.tables.write().await;
        debug!(client_id = %client.id, "Inserting client");
        tables.clients.insert(client.id, client.clone());
        Ok(client)
    }

    async fn get_client(&self, id: Uuid) -> AppResult<Option<Client>> {
        Ok(self.tables.read().await.clients.get(&id).cloned())
    }

    async fn list_clients(&self) -> AppResult<Vec<Client>> {
        let tables = self.tables.read().await;
        let mut clients: Vec<Client> = tables.clients.values().cloned().collect();
        clients.sort_by(|a, b| {
            (&a.last_name, &a.first_name).cmp(&(&b.last_name, &b.first_name))
        });
        Ok(clients)
    }

    async fn insert_contact(&self, contact: EmergencyContact) -> AppResult<EmergencyContact> {
        let mut tables = self.tables.write().await;
        tables.ensure_client(contact.client_id)?;
        tables.contacts.insert(contact.id, contact.clone());
        Ok(contact)
    }

    async fn list_contacts(&self, client_id: Uuid) -> AppResult<Vec<EmergencyContact>> {
        let tables = self.tables.read().await;
        let mut contacts: Vec<EmergencyContact> = tables
            .contacts
            .values()
            .filter(|c| c.client_id == client_id)
            .cloned()
            .collect();
        contacts.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(contacts)
    }

    async fn insert_medication(&self, medication: Medication) -> AppResult<Medication> {
        let mut tables = self.tables.write().await;
        tables.ensure_client(medication.client_id)?;
        tables.medications.insert(medication.id, medication.clone());
        Ok(medication)
    }

    async fn list_medications(&self, client_id: Uuid) -> AppResult<Vec<Medication>> {
        let tables = self.tables.read().await;
        let mut medications: Vec<Medication> = tables
            .medications
            .values()
            .filter(|m| m.client_id == client_id)
            .cloned()
            .collect();
        medications.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        Ok(medications)
    }

    async fn insert_device(&self, device: Device) -> AppResult<Device> {
        let mut tables = self.tables.write().await;
        if let Some(client_id) = device.client_id {
            tables.ensure_client(client_id)?;
        }
        tables.devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn get_device(&self, id: Uuid) -> AppResult<Option<Device>> {
        Ok(self.tables.read().await.devices.get(&id).cloned())
    }

    async fn list_devices(&self) -> AppResult<Vec<Device>> {
        let tables = self.tables.read().await;
        let mut devices: Vec<Device> = tables.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.serial_number.cmp(&b.serial_number));
        Ok(devices)
    }

    async fn update_device(&self, device: Device) -> AppResult<Device> {
        let mut tables = self.tables.write().await;
        if !tables.devices.contains_key(&device.id) {
            return Err(AppError::device_not_found(device.id));
        }
        tables.devices.insert(device.id, device.clone());
        Ok(device)
    }

    async fn insert_dispatcher(&self, dispatcher: Dispatcher) -> AppResult<Dispatcher> {
        let mut tables = self.tables.write().await;
        tables.dispatchers.insert(dispatcher.id, dispatcher.clone());
        Ok(dispatcher)
    }

    async fn get_dispatcher(&self, id: Uuid) -> AppResult<Option<Dispatcher>> {
        Ok(self.tables.read().await.dispatchers.get(&id).cloned())
    }

    async fn list_dispatchers(&self) -> AppResult<Vec<Dispatcher>> {
        let tables = self.tables.read().await;
        let mut dispatchers: Vec<Dispatcher> = tables.dispatchers.values().cloned().collect();
        dispatchers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(dispatchers)
    }

    async fn set_dispatcher_status(
        &self,
        id: Uuid,
        status: DispatcherStatus,
    ) -> AppResult<Dispatcher> {
        let mut tables = self.tables.write().await;
        let dispatcher = tables
            .dispatchers
            .get_mut(&id)
            .ok_or_else(|| AppError::dispatcher_not_found(id))?;
        if dispatcher.status != status {
            dispatcher.status = status;
            dispatcher.status_changed_at = Utc::now();
        }
        Ok(dispatcher.clone())
    }

    async fn record_call_handled(&self, id: Uuid) -> AppResult<Dispatcher> {
        let mut tables = self.tables.write().await;
        let dispatcher = tables
            .dispatchers
            .get_mut(&id)
            .ok_or_else(|| AppError::dispatcher_not_found(id))?;
        dispatcher.calls_handled += 1;
        Ok(dispatcher.clone())
    }

    async fn insert_alert(&self, alert: EmergencyAlert) -> AppResult<EmergencyAlert> {
        let mut tables = self.tables.write().await;
        debug!(alert_id = %alert.id, alert_type = ?alert.alert_type, "Inserting alert");
        tables.alerts.insert(alert.id, alert.clone());
        Ok(alert)
    }

    async fn get_alert(&self, id: Uuid) -> AppResult<Option<EmergencyAlert>> {
        Ok(self.tables.read().await.alerts.get(&id).cloned())
    }

    async fn list_alerts(&self) -> AppResult<Vec<EmergencyAlert>> {
        let tables = self.tables.read().await;
        let mut alerts: Vec<EmergencyAlert> = tables.alerts.values().cloned().collect();
        alerts.sort_by(|a, b| b.raised_at.cmp(&a.raised_at));
        Ok(alerts)
    }

    async fn apply_alert_change(&self, id: Uuid, change: AlertChange) -> AppResult<AlertUpdate> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .alerts
            .get_mut(&id)
            .ok_or_else(|| AppError::alert_not_found(id))?;

        let applied = change.clone().apply(stored);
        if !applied {
            debug!(
                alert_id = %id,
                status = ?stored.status,
                change = ?change,
                "Alert change refused"
            );
        }
        Ok(AlertUpdate {
            applied,
            alert: stored.clone(),
        })
    }

    async fn append_action(&self, action: ChainAction) -> AppResult<ChainAction> {
        let mut tables = self.tables.write().await;
        tables.ensure_alert(action.alert_id)?;
        Ok(tables.push_action(action))
    }

    async fn append_action_once(&self, action: ChainAction) -> AppResult<AppendOutcome> {
        let mut tables = self.tables.write().await;
        tables.ensure_alert(action.alert_id)?;

        let existing = tables
            .actions
            .iter()
            .find(|a| a.alert_id == action.alert_id && a.action_type == action.action_type)
            .cloned();

        Ok(match existing {
            Some(existing) => {
                debug!(
                    alert_id = %action.alert_id,
                    action_type = ?action.action_type,
                    "Chain action already recorded"
                );
                AppendOutcome::Existing(existing)
            }
            None => AppendOutcome::Inserted(tables.push_action(action)),
        })
    }

    async fn list_actions(&self, alert_id: Uuid) -> AppResult<Vec<ChainAction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .actions
            .iter()
            .filter(|a| a.alert_id == alert_id)
            .cloned()
            .collect())
    }

    async fn list_all_actions(&self) -> AppResult<Vec<ChainAction>> {
        Ok(self.tables.read().await.actions.clone())
    }
}
