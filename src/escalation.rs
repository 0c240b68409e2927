//! Emergency Escalation Orchestrator
//!
//! Runs the dispatcher-driven notification steps for one alert: family,
//! physician, ambulance, medication read-out and the conference bridge. Each
//! attempt is appended to the chain action log whether or not the Gateway
//! accepted it; a failed channel never aborts the remaining steps.
//!
//! Steps have no enforced order. A step on a New alert acknowledges it first;
//! a step on a Resolved alert is refused with a message and writes nothing.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::chain::{
    ChainAction, ChainActionType, ConferenceParticipant, EscalationState, ParticipantRole,
};
use crate::config::EscalationSettings;
use crate::error::{AppError, AppResult};
use crate::gateway::{normalize_phone_number, GatewayOutcome, TelephonyGateway};
use crate::models::{
    AlertChange, ClientEmergencyInfo, EmergencyAlert, EmergencyContact, Medication, Relationship,
};
use crate::store::{load_emergency_info, Repository};

/// Longest free-text alert detail copied into an SMS
const MAX_DETAIL_IN_SMS: usize = 160;

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AmbulanceRequest {
    #[validate(length(min = 3, max = 32))]
    pub ambulance_number: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub incident_number: Option<String>,
    pub dispatcher_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInput {
    #[validate(length(min = 1, max = 100))]
    pub name: String,
    #[validate(length(min = 3, max = 32))]
    pub phone: String,
    pub role: ParticipantRole,
    pub dispatcher_id: Option<Uuid>,
}

/// Outcome of reaching one person by SMS and/or call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOutcome {
    pub contact_name: String,
    pub relationship: Relationship,
    pub number: Option<String>,
    pub sms: Option<GatewayOutcome>,
    pub call: Option<GatewayOutcome>,
    pub success: bool,
    pub result: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyNotificationResult {
    pub success: bool,
    pub message: String,
    pub successful_notifications: u32,
    pub total_contacts: u32,
    pub outcomes: Vec<NotificationOutcome>,
}

impl FamilyNotificationResult {
    fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            successful_notifications: 0,
            total_contacts: 0,
            outcomes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoctorNotificationResult {
    pub success: bool,
    pub message: String,
    pub doctor: Option<NotificationOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbulanceResult {
    pub success: bool,
    /// True when an earlier request already recorded the ambulance call
    pub already_called: bool,
    pub message: String,
    pub incident_number: Option<String>,
    pub ambulance_number: Option<String>,
    pub called_at: Option<DateTime<Utc>>,
    pub client_name: Option<String>,
    pub address: Option<String>,
    /// Read-out text for the responders
    pub medication_list: Option<String>,
}

impl AmbulanceResult {
    fn refused(message: impl Into<String>) -> Self {
        Self {
            success: false,
            already_called: false,
            message: message.into(),
            incident_number: None,
            ambulance_number: None,
            called_at: None,
            client_name: None,
            address: None,
            medication_list: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationListResult {
    pub success: bool,
    pub message: String,
    pub count: usize,
    pub medication_list: String,
    pub medications: Vec<Medication>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConferenceResult {
    pub success: bool,
    pub message: String,
    pub dial_in: Option<GatewayOutcome>,
    pub conference_active: bool,
    pub participants: Vec<ConferenceParticipant>,
}

/// Read model polled by the dispatcher console
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationStatus {
    pub alert: EmergencyAlert,
    pub client: Option<ClientEmergencyInfo>,
    pub state: EscalationState,
    pub actions: Vec<ChainAction>,
}

enum StepContext {
    Ready(EmergencyAlert),
    Refused(String),
}

// ---------------------------------------------------------------------------
// Text helpers
// ---------------------------------------------------------------------------

/// One line per medication, highest priority first
pub fn format_medication_list(medications: &[Medication]) -> String {
    if medications.is_empty() {
        return "No active medications on file".to_string();
    }

    medications
        .iter()
        .enumerate()
        .map(|(i, m)| {
            let mut line = format!("{}. {} {}, {}", i + 1, m.name, m.dosage, m.frequency);
            if let Some(prescriber) = &m.prescribed_by {
                line.push_str(&format!(" (prescribed by {})", prescriber));
            }
            if let Some(notes) = &m.emergency_notes {
                line.push_str(&format!(" - NOTE: {}", notes));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn detail_text(alert: &EmergencyAlert) -> String {
    let mut parts = Vec::new();
    if let Some(details) = alert.details.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        parts.push(details.chars().take(MAX_DETAIL_IN_SMS).collect::<String>());
    }
    if let Some(bpm) = alert.heart_rate {
        parts.push(format!("Heart rate {} bpm", bpm));
    }
    parts.join(". ")
}

fn family_message(alert: &EmergencyAlert, info: &ClientEmergencyInfo) -> String {
    let detail = detail_text(alert);
    let mut message = format!(
        "EMERGENCY: {} - {}, {}.",
        alert.alert_type.label(),
        info.full_name,
        info.address
    );
    if !detail.is_empty() {
        message.push_str(&format!(" {}.", detail));
    }
    message.push_str(" Please contact the emergency service hub immediately.");
    message
}

fn doctor_message(alert: &EmergencyAlert, info: &ClientEmergencyInfo) -> String {
    let detail = detail_text(alert);
    let mut message = format!(
        "EMERGENCY for your patient {} (born {}): {}.",
        info.full_name,
        info.birth_date.format("%d.%m.%Y"),
        alert.alert_type.label()
    );
    if !detail.is_empty() {
        message.push_str(&format!(" {}.", detail));
    }
    message.push_str(" Please call the emergency service hub.");
    message
}

/// e.g. INC-20240611-7Q2KX9
pub fn generate_incident_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect();
    format!("INC-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EscalationOrchestrator {
    repo: Arc<dyn Repository>,
    gateway: Arc<dyn TelephonyGateway>,
    settings: EscalationSettings,
    /// Extension used when no dispatcher is attributed
    dispatch_extension: String,
    /// One lock per alert, held from the duplicate check until the call is recorded
    ambulance_guards: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl EscalationOrchestrator {
    pub fn new(
        repo: Arc<dyn Repository>,
        gateway: Arc<dyn TelephonyGateway>,
        settings: EscalationSettings,
        dispatch_extension: String,
    ) -> Self {
        Self {
            repo,
            gateway,
            settings,
            dispatch_extension,
            ambulance_guards: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn ambulance_guard(&self, alert_id: Uuid) -> Arc<Mutex<()>> {
        self.ambulance_guards
            .lock()
            .await
            .entry(alert_id)
            .or_default()
            .clone()
    }

    /// Pause between gateway sends to stay under the provider rate limit
    async fn throttle(&self) {
        if self.settings.send_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.send_delay_ms)).await;
        }
    }

    /// Extension to dial from; also checks the dispatcher exists
    async fn extension_for(&self, dispatcher_id: Option<Uuid>) -> AppResult<String> {
        match dispatcher_id {
            Some(id) => self
                .repo
                .get_dispatcher(id)
                .await?
                .map(|d| d.extension)
                .ok_or_else(|| AppError::dispatcher_not_found(id)),
            None => Ok(self.dispatch_extension.clone()),
        }
    }

    async fn begin_step(&self, alert_id: Uuid, dispatcher_id: Option<Uuid>) -> AppResult<StepContext> {
        let update = self
            .repo
            .apply_alert_change(alert_id, AlertChange::Acknowledge { dispatcher_id })
            .await?;

        if update.alert.is_resolved() {
            warn!(alert_id = %alert_id, "Escalation step refused, alert already resolved");
            return Ok(StepContext::Refused("Alert is already resolved".to_string()));
        }
        if update.applied {
            info!(alert_id = %alert_id, "Alert acknowledged by escalation step");
        }

        Ok(StepContext::Ready(update.alert))
    }

    async fn client_info(&self, alert: &EmergencyAlert) -> AppResult<Option<ClientEmergencyInfo>> {
        match alert.client_id {
            Some(client_id) => Ok(Some(load_emergency_info(self.repo.as_ref(), client_id).await?)),
            None => Ok(None),
        }
    }

    async fn record(&self, action: ChainAction) -> AppResult<ChainAction> {
        let action = self.repo.append_action(action).await?;
        debug!(
            alert_id = %action.alert_id,
            sequence = action.sequence,
            action_type = ?action.action_type,
            succeeded = action.succeeded,
            "Chain action recorded"
        );
        Ok(action)
    }

    /// SMS the contact and optionally call; succeeds if any channel did
    async fn reach(
        &self,
        contact: &EmergencyContact,
        message: &str,
        also_call: bool,
        extension: &str,
    ) -> NotificationOutcome {
        let Some(number) = contact.preferred_number().map(normalize_phone_number) else {
            return NotificationOutcome {
                contact_name: contact.name.clone(),
                relationship: contact.relationship,
                number: None,
                sms: None,
                call: None,
                success: false,
                result: "No phone number on file".to_string(),
            };
        };

        let sms = self.gateway.send_sms(&number, message).await;
        let mut result = sms.describe("SMS");
        let mut success = sms.success;

        let call = if also_call {
            self.throttle().await;
            let dial = contact
                .phone
                .as_deref()
                .map(normalize_phone_number)
                .unwrap_or_else(|| number.clone());
            let call = self.gateway.initiate_call(extension, &dial).await;
            result.push_str("; ");
            result.push_str(&call.describe("Call"));
            success |= call.success;
            Some(call)
        } else {
            None
        };

        NotificationOutcome {
            contact_name: contact.name.clone(),
            relationship: contact.relationship,
            number: Some(number),
            sms: Some(sms),
            call,
            success,
            result,
        }
    }

    fn action_for(
        alert_id: Uuid,
        action_type: ChainActionType,
        outcome: &NotificationOutcome,
        dispatcher_id: Option<Uuid>,
    ) -> ChainAction {
        let reference = outcome
            .sms
            .as_ref()
            .and_then(|o| o.session_id.clone())
            .or_else(|| outcome.call.as_ref().and_then(|o| o.session_id.clone()));

        ChainAction::new(alert_id, action_type, outcome.result.clone())
            .target(outcome.contact_name.clone(), outcome.number.clone())
            .succeeded(outcome.success)
            .reference(reference)
            .by(dispatcher_id)
    }

    /// Notify every non-physician emergency contact in priority order
    pub async fn notify_family(
        &self,
        alert_id: Uuid,
        dispatcher_id: Option<Uuid>,
    ) -> AppResult<FamilyNotificationResult> {
        let extension = self.extension_for(dispatcher_id).await?;
        let alert = match self.begin_step(alert_id, dispatcher_id).await? {
            StepContext::Ready(alert) => alert,
            StepContext::Refused(message) => return Ok(FamilyNotificationResult::refused(message)),
        };
        let Some(info) = self.client_info(&alert).await? else {
            return Ok(FamilyNotificationResult::refused("Alert has no client assigned"));
        };

        let contacts: Vec<&EmergencyContact> = info
            .emergency_contacts
            .iter()
            .filter(|c| c.relationship != Relationship::Physician)
            .collect();

        if contacts.is_empty() {
            warn!(alert_id = %alert_id, client_id = %info.client_id, "No family contacts on file");
            return Ok(FamilyNotificationResult::refused(format!(
                "No emergency contacts on file for {}",
                info.full_name
            )));
        }

        let message = family_message(&alert, &info);
        let mut outcomes = Vec::with_capacity(contacts.len());

        for (index, contact) in contacts.iter().enumerate() {
            if index > 0 {
                self.throttle().await;
            }
            let outcome = self
                .reach(contact, &message, self.settings.call_family, &extension)
                .await;
            self.record(Self::action_for(
                alert_id,
                ChainActionType::FamilyNotified,
                &outcome,
                dispatcher_id,
            ))
            .await?;
            outcomes.push(outcome);
        }

        let total = outcomes.len() as u32;
        let successful = outcomes.iter().filter(|o| o.success).count() as u32;
        info!(
            alert_id = %alert_id,
            successful = successful,
            total = total,
            "Family notification finished"
        );

        Ok(FamilyNotificationResult {
            success: successful > 0,
            message: format!("{}/{} contacts notified", successful, total),
            successful_notifications: successful,
            total_contacts: total,
            outcomes,
        })
    }

    /// Notify the client's physician
    pub async fn notify_doctor(
        &self,
        alert_id: Uuid,
        dispatcher_id: Option<Uuid>,
    ) -> AppResult<DoctorNotificationResult> {
        let extension = self.extension_for(dispatcher_id).await?;
        let refused = |message: &str| DoctorNotificationResult {
            success: false,
            message: message.to_string(),
            doctor: None,
        };

        let alert = match self.begin_step(alert_id, dispatcher_id).await? {
            StepContext::Ready(alert) => alert,
            StepContext::Refused(message) => return Ok(refused(&message)),
        };
        let Some(info) = self.client_info(&alert).await? else {
            return Ok(refused("Alert has no client assigned"));
        };
        let Some(doctor) = info
            .emergency_contacts
            .iter()
            .find(|c| c.relationship == Relationship::Physician)
        else {
            info!(alert_id = %alert_id, "No physician on file, doctor notification skipped");
            return Ok(refused("No physician on file for this client"));
        };

        let outcome = self
            .reach(
                doctor,
                &doctor_message(&alert, &info),
                self.settings.call_doctor,
                &extension,
            )
            .await;
        self.record(Self::action_for(
            alert_id,
            ChainActionType::DoctorNotified,
            &outcome,
            dispatcher_id,
        ))
        .await?;

        Ok(DoctorNotificationResult {
            success: outcome.success,
            message: format!("{}: {}", outcome.contact_name, outcome.result),
            doctor: Some(outcome),
        })
    }

    fn ambulance_result(
        action: &ChainAction,
        already_called: bool,
        info: Option<&ClientEmergencyInfo>,
    ) -> AmbulanceResult {
        let message = if already_called {
            "Ambulance was already called for this alert".to_string()
        } else {
            action.result.clone()
        };
        AmbulanceResult {
            success: action.succeeded,
            already_called,
            message,
            incident_number: action.reference.clone(),
            ambulance_number: action.target_phone.clone(),
            called_at: Some(action.occurred_at),
            client_name: info.map(|i| i.full_name.clone()),
            address: info.map(|i| i.address.clone()),
            medication_list: action.notes.clone(),
        }
    }

    /// Call the ambulance at most once per alert
    pub async fn call_ambulance(
        &self,
        alert_id: Uuid,
        request: AmbulanceRequest,
    ) -> AppResult<AmbulanceResult> {
        let extension = self.extension_for(request.dispatcher_id).await?;
        let alert = match self.begin_step(alert_id, request.dispatcher_id).await? {
            StepContext::Ready(alert) => alert,
            StepContext::Refused(message) => return Ok(AmbulanceResult::refused(message)),
        };
        let info = self.client_info(&alert).await?;

        let guard = self.ambulance_guard(alert_id).await;
        let _dispatching = guard.lock().await;

        if let Some(existing) = self
            .repo
            .list_actions(alert_id)
            .await?
            .into_iter()
            .find(|a| a.action_type == ChainActionType::AmbulanceCalled)
        {
            info!(alert_id = %alert_id, "Ambulance already called, returning existing record");
            return Ok(Self::ambulance_result(&existing, true, info.as_ref()));
        }

        let number = normalize_phone_number(
            request
                .ambulance_number
                .as_deref()
                .unwrap_or(&self.settings.ambulance_number),
        );
        let incident = request
            .incident_number
            .clone()
            .unwrap_or_else(generate_incident_number);
        let medication_list = match &info {
            Some(info) => format_medication_list(&info.medications),
            None => "Client not identified, no medication data".to_string(),
        };

        let call = self.gateway.initiate_call(&extension, &number).await;
        if !call.success {
            warn!(alert_id = %alert_id, error = ?call.error, "Ambulance call failed at gateway");
        }

        let action = ChainAction::new(
            alert_id,
            ChainActionType::AmbulanceCalled,
            call.describe("Ambulance call"),
        )
        .target("Ambulance", Some(number))
        .succeeded(call.success)
        .reference(Some(incident))
        .notes(Some(medication_list))
        .by(request.dispatcher_id);

        let outcome = self.repo.append_action_once(action).await?;
        if outcome.was_inserted() {
            info!(
                alert_id = %alert_id,
                incident = ?outcome.action().reference,
                "Ambulance call recorded"
            );
        } else {
            warn!(alert_id = %alert_id, "Concurrent ambulance call detected, keeping first record");
        }
        Ok(Self::ambulance_result(
            outcome.action(),
            !outcome.was_inserted(),
            info.as_ref(),
        ))
    }

    /// Read-out list of active medications, highest priority first
    pub async fn provide_medication_list(
        &self,
        alert_id: Uuid,
        dispatcher_id: Option<Uuid>,
    ) -> AppResult<MedicationListResult> {
        self.extension_for(dispatcher_id).await?;
        let refused = |message: String| MedicationListResult {
            success: false,
            message,
            count: 0,
            medication_list: String::new(),
            medications: Vec::new(),
        };

        let alert = match self.begin_step(alert_id, dispatcher_id).await? {
            StepContext::Ready(alert) => alert,
            StepContext::Refused(message) => return Ok(refused(message)),
        };
        let Some(info) = self.client_info(&alert).await? else {
            return Ok(refused("Alert has no client assigned".to_string()));
        };

        let text = format_medication_list(&info.medications);
        let count = info.medications.len();
        self.record(
            ChainAction::new(
                alert_id,
                ChainActionType::MedicationListProvided,
                format!("{} active medications provided", count),
            )
            .target(info.full_name.clone(), None)
            .by(dispatcher_id),
        )
        .await?;

        Ok(MedicationListResult {
            success: true,
            message: format!("{} active medications", count),
            count,
            medication_list: text,
            medications: info.medications,
        })
    }

    async fn current_state(&self, alert_id: Uuid) -> AppResult<EscalationState> {
        Ok(EscalationState::replay(&self.repo.list_actions(alert_id).await?))
    }

    fn conference_result(
        success: bool,
        message: impl Into<String>,
        dial_in: Option<GatewayOutcome>,
        state: EscalationState,
    ) -> ConferenceResult {
        ConferenceResult {
            success,
            message: message.into(),
            dial_in,
            conference_active: state.conference_active,
            participants: state.participants,
        }
    }

    async fn dial_participant(
        &self,
        alert_id: Uuid,
        action_type: ChainActionType,
        participant: &ParticipantInput,
    ) -> AppResult<ConferenceResult> {
        let extension = self.extension_for(participant.dispatcher_id).await?;
        let number = normalize_phone_number(&participant.phone);
        let dial_in = self.gateway.initiate_call(&extension, &number).await;

        self.record(
            ChainAction::new(alert_id, action_type, dial_in.describe("Conference dial-in"))
                .target(participant.name.clone(), Some(number))
                .role(participant.role)
                .succeeded(dial_in.success)
                .reference(dial_in.session_id.clone())
                .by(participant.dispatcher_id),
        )
        .await?;

        let state = self.current_state(alert_id).await?;
        let message = format!(
            "{} participant(s) in conference",
            state.participants.len()
        );
        Ok(Self::conference_result(dial_in.success, message, Some(dial_in), state))
    }

    /// Open the conference bridge with its first participant
    pub async fn start_conference(
        &self,
        alert_id: Uuid,
        participant: ParticipantInput,
    ) -> AppResult<ConferenceResult> {
        self.extension_for(participant.dispatcher_id).await?;
        if let StepContext::Refused(message) =
            self.begin_step(alert_id, participant.dispatcher_id).await?
        {
            return Ok(Self::conference_result(false, message, None, self.current_state(alert_id).await?));
        }

        let state = self.current_state(alert_id).await?;
        if state.conference_active {
            return Ok(Self::conference_result(
                false,
                "A conference is already active for this alert",
                None,
                state,
            ));
        }

        info!(alert_id = %alert_id, participant = %participant.name, "Starting conference");
        self.dial_participant(alert_id, ChainActionType::ConferenceStarted, &participant)
            .await
    }

    /// Add a participant to the running conference
    pub async fn add_to_conference(
        &self,
        alert_id: Uuid,
        participant: ParticipantInput,
    ) -> AppResult<ConferenceResult> {
        self.extension_for(participant.dispatcher_id).await?;
        if let StepContext::Refused(message) =
            self.begin_step(alert_id, participant.dispatcher_id).await?
        {
            return Ok(Self::conference_result(false, message, None, self.current_state(alert_id).await?));
        }

        let state = self.current_state(alert_id).await?;
        if !state.conference_active {
            return Ok(Self::conference_result(
                false,
                "No active conference for this alert",
                None,
                state,
            ));
        }

        info!(alert_id = %alert_id, participant = %participant.name, "Adding conference participant");
        self.dial_participant(
            alert_id,
            ChainActionType::ConferenceParticipantAdded,
            &participant,
        )
        .await
    }

    pub async fn end_conference(
        &self,
        alert_id: Uuid,
        dispatcher_id: Option<Uuid>,
    ) -> AppResult<ConferenceResult> {
        self.extension_for(dispatcher_id).await?;
        if let StepContext::Refused(message) = self.begin_step(alert_id, dispatcher_id).await? {
            return Ok(Self::conference_result(false, message, None, self.current_state(alert_id).await?));
        }

        let state = self.current_state(alert_id).await?;
        if !state.conference_active {
            return Ok(Self::conference_result(
                false,
                "No active conference for this alert",
                None,
                state,
            ));
        }

        let participants = state.participants.len();
        self.record(
            ChainAction::new(
                alert_id,
                ChainActionType::ConferenceEnded,
                format!("Conference ended with {} participant(s)", participants),
            )
            .by(dispatcher_id),
        )
        .await?;

        info!(alert_id = %alert_id, "Conference ended");
        let state = self.current_state(alert_id).await?;
        Ok(Self::conference_result(true, "Conference ended", None, state))
    }

    /// Alert, client profile, action log and the replayed state
    pub async fn full_status(&self, alert_id: Uuid) -> AppResult<EscalationStatus> {
        let alert = self
            .repo
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| AppError::alert_not_found(alert_id))?;

        let client = match alert.client_id {
            Some(client_id) => match load_emergency_info(self.repo.as_ref(), client_id).await {
                Ok(info) => Some(info),
                Err(AppError::NotFound(_)) => {
                    warn!(alert_id = %alert_id, client_id = %client_id, "Alert references missing client");
                    None
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let actions = self.repo.list_actions(alert_id).await?;
        let state = EscalationState::replay(&actions);

        Ok(EscalationStatus {
            alert,
            client,
            state,
            actions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::{ScriptedGateway, Sent};
    use crate::models::{AlertInput, AlertStatus, AlertType};
    use crate::seed;
    use crate::store::MemoryStore;
    use crate::{alerts, config::Settings};

    struct Fixture {
        store: Arc<MemoryStore>,
        gateway: Arc<ScriptedGateway>,
        orchestrator: EscalationOrchestrator,
    }

    fn fixture_with_delay(delay_ms: u64) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let mut settings = Settings::from_source(|_| None).unwrap().escalation;
        settings.send_delay_ms = delay_ms;
        let orchestrator =
            EscalationOrchestrator::new(store.clone(), gateway.clone(), settings, "e0".into());
        Fixture {
            store,
            gateway,
            orchestrator,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_delay(0)
    }

    /// Client with `family` contacts, a physician and two medications
    async fn alert_for_client(fx: &Fixture, family: u8) -> (Uuid, Uuid) {
        let client = fx.store.insert_client(seed::client("Ilse", "Brandt")).await.unwrap();
        for rank in 1..=family {
            fx.store
                .insert_contact(seed::contact(client.id, &format!("Family {}", rank), rank))
                .await
                .unwrap();
        }
        fx.store.insert_contact(seed::physician(client.id, "Dr. Lang")).await.unwrap();
        fx.store
            .insert_medication(seed::medication(client.id, "Ramipril", "5 mg", 3))
            .await
            .unwrap();
        fx.store
            .insert_medication(seed::medication(client.id, "Apixaban", "2.5 mg", 9))
            .await
            .unwrap();

        let mut input = AlertInput::of_type(AlertType::FallDetection);
        input.client_id = Some(client.id);
        input.details = Some("Fall in the kitchen".into());
        let alert = alerts::raise_alert(fx.store.as_ref(), input).await.unwrap();
        (alert.id, client.id)
    }

    fn participant(name: &str, phone: &str, role: ParticipantRole) -> ParticipantInput {
        ParticipantInput {
            name: name.into(),
            phone: phone.into(),
            role,
            dispatcher_id: None,
        }
    }

    #[tokio::test]
    async fn test_family_partial_failure_is_recorded_per_contact() {
        let fx = fixture();
        let (alert_id, client_id) = alert_for_client(&fx, 3).await;
        let contacts = fx.store.list_contacts(client_id).await.unwrap();
        fx.gateway.fail_number(contacts[1].mobile.as_deref().unwrap());

        let result = fx.orchestrator.notify_family(alert_id, None).await.unwrap();

        assert_eq!(result.successful_notifications, 2);
        assert_eq!(result.total_contacts, 3);
        assert!(result.success);

        let actions = fx.store.list_actions(alert_id).await.unwrap();
        assert_eq!(actions.len(), 3);
        assert!(actions.iter().all(|a| a.action_type == ChainActionType::FamilyNotified));
        assert_eq!(actions[0].target_name.as_deref(), Some("Family 1"));
        assert!(!actions[1].succeeded);
        assert!(actions[1].result.contains("failed"));
        assert!(actions[2].succeeded);
    }

    #[tokio::test]
    async fn test_family_message_contents() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 1).await;
        fx.orchestrator.notify_family(alert_id, None).await.unwrap();

        let sent = fx.gateway.sent();
        let Sent::Sms { number, message } = &sent[0] else {
            panic!("expected SMS, got {:?}", sent[0]);
        };
        assert!(number.starts_with("+49171"));
        assert!(message.contains("Fall detected"));
        assert!(message.contains("Ilse Brandt"));
        assert!(message.contains("Fall in the kitchen"));
        // physician is not part of the family round
        assert_eq!(fx.gateway.sms_count(), 1);
    }

    #[tokio::test]
    async fn test_family_without_contacts_writes_nothing() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 0).await;

        let result = fx.orchestrator.notify_family(alert_id, None).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.total_contacts, 0);
        assert!(result.message.contains("No emergency contacts"));
        assert!(fx.store.list_actions(alert_id).await.unwrap().is_empty());
        assert_eq!(fx.gateway.sms_count(), 0);
    }

    #[tokio::test]
    async fn test_family_sends_are_throttled() {
        let fx = fixture_with_delay(25);
        let (alert_id, _) = alert_for_client(&fx, 3).await;

        let started = std::time::Instant::now();
        fx.orchestrator.notify_family(alert_id, None).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_gateway_outage_does_not_abort() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 2).await;
        fx.gateway.set_offline(true);

        let family = fx.orchestrator.notify_family(alert_id, None).await.unwrap();
        let doctor = fx.orchestrator.notify_doctor(alert_id, None).await.unwrap();

        assert_eq!(family.successful_notifications, 0);
        assert_eq!(family.total_contacts, 2);
        assert!(!doctor.success);
        assert_eq!(fx.store.list_actions(alert_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_notify_doctor() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 1).await;

        let result = fx.orchestrator.notify_doctor(alert_id, None).await.unwrap();

        assert!(result.success);
        let actions = fx.store.list_actions(alert_id).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ChainActionType::DoctorNotified);
        assert_eq!(actions[0].target_name.as_deref(), Some("Dr. Lang"));
    }

    #[tokio::test]
    async fn test_notify_doctor_without_physician_is_noop() {
        let fx = fixture();
        let client = fx.store.insert_client(seed::client("Otto", "Krause")).await.unwrap();
        let mut input = AlertInput::of_type(AlertType::ManualAlert);
        input.client_id = Some(client.id);
        let alert = alerts::raise_alert(fx.store.as_ref(), input).await.unwrap();

        let result = fx.orchestrator.notify_doctor(alert.id, None).await.unwrap();

        assert!(!result.success);
        assert!(result.doctor.is_none());
        assert!(fx.store.list_actions(alert.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ambulance_called_once() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 1).await;

        let first = fx
            .orchestrator
            .call_ambulance(alert_id, AmbulanceRequest::default())
            .await
            .unwrap();
        let second = fx
            .orchestrator
            .call_ambulance(
                alert_id,
                AmbulanceRequest {
                    incident_number: Some("OTHER".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!first.already_called);
        assert!(second.already_called);
        assert_eq!(first.incident_number, second.incident_number);
        assert_eq!(first.medication_list, second.medication_list);
        assert_eq!(first.ambulance_number.as_deref(), Some("112"));
        assert_eq!(fx.gateway.call_count(), 1);

        let ambulance_actions = fx
            .store
            .list_actions(alert_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.action_type == ChainActionType::AmbulanceCalled)
            .count();
        assert_eq!(ambulance_actions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_ambulance_calls_dial_once() {
        let fx = fixture();
        fx.gateway.set_call_latency(Duration::from_millis(50));
        let (alert_id, _) = alert_for_client(&fx, 1).await;

        let a = fx.orchestrator.clone();
        let b = fx.orchestrator.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.call_ambulance(alert_id, AmbulanceRequest::default()).await }),
            tokio::spawn(async move { b.call_ambulance(alert_id, AmbulanceRequest::default()).await }),
        );
        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();

        assert_eq!(fx.gateway.call_count(), 1);
        assert_eq!(first.incident_number, second.incident_number);
        assert!(first.already_called ^ second.already_called);
        assert_eq!(fx.store.list_actions(alert_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ambulance_returns_address_and_medications() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 1).await;

        let result = fx
            .orchestrator
            .call_ambulance(
                alert_id,
                AmbulanceRequest {
                    incident_number: Some("LST-4711".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.incident_number.as_deref(), Some("LST-4711"));
        assert_eq!(result.address.as_deref(), Some("Lindenallee 14, 10115 Berlin"));
        let meds = result.medication_list.unwrap();
        assert!(meds.starts_with("1. Apixaban"));
    }

    #[tokio::test]
    async fn test_medication_list_sorted_by_priority() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 1).await;

        let result = fx.orchestrator.provide_medication_list(alert_id, None).await.unwrap();

        assert_eq!(result.count, 2);
        let lines: Vec<&str> = result.medication_list.lines().collect();
        assert!(lines[0].contains("Apixaban 2.5 mg"));
        assert!(lines[1].contains("Ramipril 5 mg"));
        assert!(lines[0].contains("prescribed by Dr. Hoffmann"));
        let actions = fx.store.list_actions(alert_id).await.unwrap();
        assert_eq!(actions[0].action_type, ChainActionType::MedicationListProvided);
    }

    #[tokio::test]
    async fn test_conference_participants() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 1).await;

        fx.orchestrator
            .start_conference(alert_id, participant("Dispatcher", "030 5550000", ParticipantRole::Dispatcher))
            .await
            .unwrap();
        fx.orchestrator
            .add_to_conference(alert_id, participant("Daughter", "0171 5550001", ParticipantRole::Family))
            .await
            .unwrap();
        let result = fx
            .orchestrator
            .add_to_conference(alert_id, participant("Dr. Lang", "030 9876543", ParticipantRole::Doctor))
            .await
            .unwrap();

        assert!(result.conference_active);
        let names: Vec<_> = result.participants.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["Dispatcher", "Daughter", "Dr. Lang"]);
        assert_eq!(fx.store.list_actions(alert_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_conference_guards() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 1).await;

        let orphan = fx
            .orchestrator
            .add_to_conference(alert_id, participant("Son", "0171 5550002", ParticipantRole::Family))
            .await
            .unwrap();
        assert!(!orphan.success);

        fx.orchestrator
            .start_conference(alert_id, participant("A", "030 5550000", ParticipantRole::Dispatcher))
            .await
            .unwrap();
        let second_start = fx
            .orchestrator
            .start_conference(alert_id, participant("B", "030 5550001", ParticipantRole::Other))
            .await
            .unwrap();
        assert!(!second_start.success);

        let ended = fx.orchestrator.end_conference(alert_id, None).await.unwrap();
        assert!(ended.success);
        assert!(!ended.conference_active);
        assert!(ended.participants.is_empty());
    }

    #[tokio::test]
    async fn test_full_status_matches_replay() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 2).await;

        fx.orchestrator.notify_family(alert_id, None).await.unwrap();
        fx.orchestrator.call_ambulance(alert_id, AmbulanceRequest::default()).await.unwrap();
        fx.orchestrator
            .start_conference(alert_id, participant("A", "030 5550000", ParticipantRole::Dispatcher))
            .await
            .unwrap();

        let status = fx.orchestrator.full_status(alert_id).await.unwrap();
        let replayed = EscalationState::replay(&fx.store.list_actions(alert_id).await.unwrap());

        assert_eq!(status.state, replayed);
        assert!(status.state.family_notified());
        assert!(status.state.ambulance_called());
        assert!(!status.state.doctor_notified());
        assert!(status.state.conference_active);
        assert_eq!(status.client.unwrap().full_name, "Ilse Brandt");
    }

    #[tokio::test]
    async fn test_step_acknowledges_new_alert() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 1).await;

        fx.orchestrator.provide_medication_list(alert_id, None).await.unwrap();

        let alert = fx.store.get_alert(alert_id).await.unwrap().unwrap();
        assert_eq!(alert.status, AlertStatus::InProgress);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_step_acknowledge_keeps_concurrent_notes() {
        let fx = fixture();
        fx.gateway.set_call_latency(Duration::from_millis(20));
        let (alert_id, _) = alert_for_client(&fx, 1).await;

        let orchestrator = fx.orchestrator.clone();
        let step = tokio::spawn(async move {
            orchestrator
                .call_ambulance(alert_id, AmbulanceRequest::default())
                .await
        });
        for i in 0..5 {
            alerts::add_note(fx.store.as_ref(), alert_id, &format!("neighbour update {}", i))
                .await
                .unwrap();
        }
        step.await.unwrap().unwrap();

        let alert = fx.store.get_alert(alert_id).await.unwrap().unwrap();
        assert_eq!(alert.status, AlertStatus::InProgress);
        assert_eq!(alert.notes.unwrap().lines().count(), 5);
    }

    #[tokio::test]
    async fn test_resolved_alert_refuses_steps() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 2).await;
        alerts::resolve(
            fx.store.as_ref(),
            alert_id,
            alerts::ResolveRequest {
                resolution: "FALSE_ALARM".into(),
                notes: None,
                dispatcher_id: None,
            },
        )
        .await
        .unwrap();

        let family = fx.orchestrator.notify_family(alert_id, None).await.unwrap();
        let ambulance = fx
            .orchestrator
            .call_ambulance(alert_id, AmbulanceRequest::default())
            .await
            .unwrap();

        assert!(!family.success);
        assert!(!ambulance.success);
        assert!(fx.store.list_actions(alert_id).await.unwrap().is_empty());
        assert!(fx.gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_alert_reports_missing_client() {
        let fx = fixture();
        let alert = alerts::raise_alert(fx.store.as_ref(), AlertInput::of_type(AlertType::ManualAlert))
            .await
            .unwrap();

        let result = fx.orchestrator.notify_family(alert.id, None).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("no client"));

        let status = fx.orchestrator.full_status(alert.id).await.unwrap();
        assert!(status.client.is_none());
    }

    #[tokio::test]
    async fn test_dispatcher_extension_used_for_calls() {
        let fx = fixture();
        let (alert_id, _) = alert_for_client(&fx, 1).await;
        let dispatcher = fx
            .store
            .insert_dispatcher(seed::dispatcher("Lena", "e7"))
            .await
            .unwrap();

        let result = fx
            .orchestrator
            .call_ambulance(
                alert_id,
                AmbulanceRequest {
                    dispatcher_id: Some(dispatcher.id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(result.success);
        assert!(matches!(&fx.gateway.sent()[0], Sent::Call { from, .. } if from == "e7"));
        let actions = fx.store.list_actions(alert_id).await.unwrap();
        assert_eq!(actions[0].dispatcher_id, Some(dispatcher.id));
    }

    #[tokio::test]
    async fn test_unknown_alert_is_not_found() {
        let fx = fixture();
        let err = fx.orchestrator.notify_family(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_incident_number_format() {
        let incident = generate_incident_number();
        assert!(incident.starts_with("INC-"));
        assert_eq!(incident.len(), "INC-20240101-ABCDEF".len());
    }

    #[test]
    fn test_empty_medication_list_text() {
        assert_eq!(format_medication_list(&[]), "No active medications on file");
    }
}
