//! Data models for alerts, clients, devices and dispatchers
//!
//! Defines the core data structures used throughout the application.
//! All JSON uses camelCase field names to match the dispatcher console.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Kind of inbound signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    FallDetection,
    ManualAlert,
    InactivityAlert,
    HeartRateAlert,
    LowBattery,
    DeviceOffline,
}

impl AlertType {
    pub const ALL: [AlertType; 6] = [
        AlertType::FallDetection,
        AlertType::ManualAlert,
        AlertType::InactivityAlert,
        AlertType::HeartRateAlert,
        AlertType::LowBattery,
        AlertType::DeviceOffline,
    ];

    /// Human readable label used in notification texts
    pub fn label(&self) -> &'static str {
        match self {
            AlertType::FallDetection => "Fall detected",
            AlertType::ManualAlert => "Emergency button pressed",
            AlertType::InactivityAlert => "Unusual inactivity",
            AlertType::HeartRateAlert => "Abnormal heart rate",
            AlertType::LowBattery => "Device battery low",
            AlertType::DeviceOffline => "Device offline",
        }
    }

    pub fn default_priority(&self) -> AlertPriority {
        match self {
            AlertType::FallDetection => AlertPriority::Critical,
            AlertType::ManualAlert | AlertType::HeartRateAlert => AlertPriority::High,
            AlertType::InactivityAlert | AlertType::DeviceOffline => AlertPriority::Medium,
            AlertType::LowBattery => AlertPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// Alert status; variants are ordered so that status may only grow
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AlertStatus {
    New,
    InProgress,
    Resolved,
}

/// Emergency alert raised by a device or by manual entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyAlert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub priority: AlertPriority,
    pub status: AlertStatus,
    pub raised_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Originating device, if any
    pub device_id: Option<Uuid>,
    /// Matched client; may be filled in after the alert arrives
    pub client_id: Option<Uuid>,
    pub caller_number: Option<String>,
    /// Heart rate in BPM reported with the signal
    pub heart_rate: Option<u16>,
    /// Free-text detail included in notifications
    pub details: Option<String>,
    pub notes: Option<String>,
    pub resolution: Option<String>,
    pub acknowledged_by: Option<Uuid>,
    pub resolved_by: Option<Uuid>,
}

impl EmergencyAlert {
    pub fn new(alert_type: AlertType) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            priority: alert_type.default_priority(),
            status: AlertStatus::New,
            raised_at: Utc::now(),
            acknowledged_at: None,
            resolved_at: None,
            device_id: None,
            client_id: None,
            caller_number: None,
            heart_rate: None,
            details: None,
            notes: None,
            resolution: None,
            acknowledged_by: None,
            resolved_by: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status == AlertStatus::Resolved
    }

    /// Move New -> InProgress. Returns false when the alert was not New.
    pub fn acknowledge(&mut self, dispatcher_id: Option<Uuid>) -> bool {
        if self.status != AlertStatus::New {
            return false;
        }
        self.status = AlertStatus::InProgress;
        self.acknowledged_at = Some(Utc::now());
        self.acknowledged_by = dispatcher_id;
        true
    }

    /// Move to Resolved. Returns false when already resolved.
    pub fn resolve(
        &mut self,
        resolution: String,
        notes: Option<String>,
        dispatcher_id: Option<Uuid>,
    ) -> bool {
        if self.is_resolved() {
            return false;
        }
        let now = Utc::now();
        if self.acknowledged_at.is_none() {
            self.acknowledged_at = Some(now);
        }
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(now);
        self.resolution = Some(resolution);
        self.resolved_by = dispatcher_id;
        if let Some(note) = notes {
            self.append_note(&note);
        }
        true
    }

    /// Notes stay writable after resolution
    pub fn append_note(&mut self, note: &str) {
        let note = note.trim();
        if note.is_empty() {
            return;
        }
        self.notes = Some(match self.notes.take() {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, note),
            _ => note.to_string(),
        });
    }
}

/// A change applied to a stored alert in one atomic step
#[derive(Debug, Clone, PartialEq)]
pub enum AlertChange {
    Acknowledge {
        dispatcher_id: Option<Uuid>,
    },
    Resolve {
        resolution: String,
        notes: Option<String>,
        dispatcher_id: Option<Uuid>,
    },
    AppendNote(String),
    AssignClient(Uuid),
}

impl AlertChange {
    /// Apply to the alert in place. Returns false when the alert's status
    /// does not allow the change, leaving it untouched.
    pub fn apply(self, alert: &mut EmergencyAlert) -> bool {
        match self {
            AlertChange::Acknowledge { dispatcher_id } => alert.acknowledge(dispatcher_id),
            AlertChange::Resolve {
                resolution,
                notes,
                dispatcher_id,
            } => alert.resolve(resolution, notes, dispatcher_id),
            AlertChange::AppendNote(note) => {
                alert.append_note(&note);
                true
            }
            AlertChange::AssignClient(client_id) => {
                if alert.is_resolved() {
                    return false;
                }
                alert.client_id = Some(client_id);
                true
            }
        }
    }
}

/// Input DTO for manual alert entry and device signals
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AlertInput {
    pub alert_type: AlertType,
    pub priority: Option<AlertPriority>,
    pub client_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    #[validate(length(max = 32))]
    pub caller_number: Option<String>,
    #[validate(range(min = 20, max = 250, message = "Heart rate must be between 20 and 250 BPM"))]
    pub heart_rate: Option<u16>,
    #[validate(length(max = 500))]
    pub details: Option<String>,
}

impl AlertInput {
    pub fn of_type(alert_type: AlertType) -> Self {
        Self {
            alert_type,
            priority: None,
            client_id: None,
            device_id: None,
            caller_number: None,
            heart_rate: None,
            details: None,
        }
    }
}

/// Device-originated signal, device id comes from the path
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSignal {
    pub alert_type: AlertType,
    #[validate(range(min = 20, max = 250, message = "Heart rate must be between 20 and 250 BPM"))]
    pub heart_rate: Option<u16>,
    #[validate(range(max = 100))]
    pub battery_level: Option<u8>,
    #[validate(length(max = 500))]
    pub details: Option<String>,
}

// ---------------------------------------------------------------------------
// Contact directory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[validate(length(min = 1, max = 200))]
    pub street: String,
    #[validate(length(min = 1, max = 16))]
    pub postal_code: String,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
}

impl Address {
    pub fn formatted(&self) -> String {
        format!("{}, {} {}", self.street, self.postal_code, self.city)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: NaiveDate,
    pub address: Address,
    pub phone: Option<String>,
    pub conditions: Vec<String>,
    pub medical_notes: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Client {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Age in whole years at `today`
    pub fn age_on(&self, today: NaiveDate) -> u32 {
        let mut age = today.year() - self.birth_date.year();
        if (today.month(), today.day()) < (self.birth_date.month(), self.birth_date.day()) {
            age -= 1;
        }
        age.max(0) as u32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClientInput {
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    pub birth_date: NaiveDate,
    #[validate(nested)]
    pub address: Address,
    pub phone: Option<String>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[validate(length(max = 2000))]
    pub medical_notes: Option<String>,
}

impl From<ClientInput> for Client {
    fn from(input: ClientInput) -> Self {
        Client {
            id: Uuid::new_v4(),
            first_name: input.first_name,
            last_name: input.last_name,
            birth_date: input.birth_date,
            address: input.address,
            phone: input.phone,
            conditions: input.conditions,
            medical_notes: input.medical_notes,
            active: true,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relationship {
    Spouse,
    Child,
    Sibling,
    Parent,
    Friend,
    Neighbor,
    Caregiver,
    Physician,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyContact {
    pub id: Uuid,
    pub client_id: Uuid,
    pub name: String,
    pub relationship: Relationship,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    pub email: Option<String>,
    /// Lower ranks are contacted first
    pub priority: u8,
    pub is_key_holder: bool,
}

impl EmergencyContact {
    /// Mobile first, since SMS only reaches mobiles
    pub fn preferred_number(&self) -> Option<&str> {
        self.mobile
            .as_deref()
            .or(self.phone.as_deref())
            .filter(|n| !n.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ContactInput {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    pub relationship: Relationship,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(range(min = 1, max = 99))]
    pub priority: u8,
    #[serde(default)]
    pub is_key_holder: bool,
}

impl ContactInput {
    pub fn into_contact(self, client_id: Uuid) -> EmergencyContact {
        EmergencyContact {
            id: Uuid::new_v4(),
            client_id,
            name: self.name,
            relationship: self.relationship,
            phone: self.phone,
            mobile: self.mobile,
            email: self.email,
            priority: self.priority,
            is_key_holder: self.is_key_holder,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Medication {
    pub id: Uuid,
    pub client_id: Uuid,
    pub name: String,
    pub dosage: String,
    pub frequency: String,
    pub prescribed_by: Option<String>,
    /// Hints for responders, e.g. "blood thinner"
    pub emergency_notes: Option<String>,
    /// Higher values are read out first
    pub priority: u8,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct MedicationInput {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(length(min = 1, max = 50))]
    pub dosage: String,
    #[validate(length(min = 1, max = 100))]
    pub frequency: String,
    pub prescribed_by: Option<String>,
    #[validate(length(max = 500))]
    pub emergency_notes: Option<String>,
    #[serde(default)]
    #[validate(range(max = 10))]
    pub priority: u8,
}

impl MedicationInput {
    pub fn into_medication(self, client_id: Uuid) -> Medication {
        Medication {
            id: Uuid::new_v4(),
            client_id,
            name: self.name,
            dosage: self.dosage,
            frequency: self.frequency,
            prescribed_by: self.prescribed_by,
            emergency_notes: self.emergency_notes,
            priority: self.priority,
            active: true,
        }
    }
}

/// Read-only projection handed to dispatchers and responders
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEmergencyInfo {
    pub client_id: Uuid,
    pub full_name: String,
    pub birth_date: NaiveDate,
    pub age: u32,
    pub address: String,
    pub phone: Option<String>,
    pub medications: Vec<Medication>,
    pub emergency_contacts: Vec<EmergencyContact>,
    pub conditions: Vec<String>,
    pub medical_notes: Option<String>,
}

impl ClientEmergencyInfo {
    pub fn build(
        client: &Client,
        mut contacts: Vec<EmergencyContact>,
        medications: Vec<Medication>,
    ) -> Self {
        contacts.sort_by_key(|c| c.priority);
        let mut medications: Vec<Medication> =
            medications.into_iter().filter(|m| m.active).collect();
        medications.sort_by(|a, b| b.priority.cmp(&a.priority));

        Self {
            client_id: client.id,
            full_name: client.full_name(),
            birth_date: client.birth_date,
            age: client.age_on(Utc::now().date_naive()),
            address: client.address.formatted(),
            phone: client.phone.clone(),
            medications,
            emergency_contacts: contacts,
            conditions: client.conditions.clone(),
            medical_notes: client.medical_notes.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    EmergencyButton,
    FallDetector,
    Smartwatch,
    HomeStation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    Online,
    Offline,
    Maintenance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: Uuid,
    pub serial_number: String,
    pub device_type: DeviceType,
    pub client_id: Option<Uuid>,
    pub status: DeviceStatus,
    pub battery_level: Option<u8>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Battery percentage at or below which a device counts as low
pub const LOW_BATTERY_THRESHOLD: u8 = 15;

impl Device {
    pub fn is_low_battery(&self) -> bool {
        self.battery_level
            .map(|level| level <= LOW_BATTERY_THRESHOLD)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInput {
    #[validate(length(min = 1, max = 64))]
    pub serial_number: String,
    pub device_type: DeviceType,
    pub client_id: Option<Uuid>,
    #[validate(range(max = 100))]
    pub battery_level: Option<u8>,
}

impl From<DeviceInput> for Device {
    fn from(input: DeviceInput) -> Self {
        Device {
            id: Uuid::new_v4(),
            serial_number: input.serial_number,
            device_type: input.device_type,
            client_id: input.client_id,
            status: DeviceStatus::Online,
            battery_level: input.battery_level,
            last_seen: Some(Utc::now()),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatchers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatcherStatus {
    Online,
    Break,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DispatcherRole {
    Agent,
    Supervisor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatcher {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    /// Provider device extension used for this dispatcher's call-outs
    pub extension: String,
    pub status: DispatcherStatus,
    pub role: DispatcherRole,
    pub calls_handled: u32,
    pub status_changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherInput {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    pub phone: Option<String>,
    #[validate(length(min = 1, max = 16))]
    pub extension: String,
    pub role: DispatcherRole,
}

impl From<DispatcherInput> for Dispatcher {
    fn from(input: DispatcherInput) -> Self {
        Dispatcher {
            id: Uuid::new_v4(),
            name: input.name,
            email: input.email,
            phone: input.phone,
            extension: input.extension,
            status: DispatcherStatus::Offline,
            role: input.role,
            calls_handled: 0,
            status_changed_at: Utc::now(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub gateway_configured: bool,
}
