//! Escalation chain audit log
//!
//! Every escalation step writes one [`ChainAction`]. The log is append-only;
//! [`EscalationState`] is never stored and is always rebuilt by replaying it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainActionType {
    FamilyNotified,
    DoctorNotified,
    AmbulanceCalled,
    MedicationListProvided,
    ConferenceStarted,
    ConferenceParticipantAdded,
    ConferenceEnded,
}

impl ChainActionType {
    pub const ALL: [ChainActionType; 7] = [
        ChainActionType::FamilyNotified,
        ChainActionType::DoctorNotified,
        ChainActionType::AmbulanceCalled,
        ChainActionType::MedicationListProvided,
        ChainActionType::ConferenceStarted,
        ChainActionType::ConferenceParticipantAdded,
        ChainActionType::ConferenceEnded,
    ];
}

/// One audit-logged escalation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainAction {
    pub id: Uuid,
    pub alert_id: Uuid,
    /// Assigned by the repository on insert
    pub sequence: u64,
    pub action_type: ChainActionType,
    pub occurred_at: DateTime<Utc>,
    pub target_name: Option<String>,
    pub target_phone: Option<String>,
    pub result: String,
    pub succeeded: bool,
    /// Provider session id or incident number
    pub reference: Option<String>,
    pub notes: Option<String>,
    /// None for automated steps
    pub dispatcher_id: Option<Uuid>,
    /// Set on conference actions
    pub participant_role: Option<ParticipantRole>,
}

impl ChainAction {
    pub fn new(alert_id: Uuid, action_type: ChainActionType, result: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_id,
            sequence: 0,
            action_type,
            occurred_at: Utc::now(),
            target_name: None,
            target_phone: None,
            result: result.into(),
            succeeded: true,
            reference: None,
            notes: None,
            dispatcher_id: None,
            participant_role: None,
        }
    }

    pub fn target(mut self, name: impl Into<String>, phone: Option<String>) -> Self {
        self.target_name = Some(name.into());
        self.target_phone = phone;
        self
    }

    pub fn succeeded(mut self, succeeded: bool) -> Self {
        self.succeeded = succeeded;
        self
    }

    pub fn reference(mut self, reference: Option<String>) -> Self {
        self.reference = reference;
        self
    }

    pub fn notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn role(mut self, role: ParticipantRole) -> Self {
        self.participant_role = Some(role);
        self
    }

    pub fn by(mut self, dispatcher_id: Option<Uuid>) -> Self {
        self.dispatcher_id = dispatcher_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantRole {
    Family,
    Doctor,
    Ambulance,
    Dispatcher,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConferenceParticipant {
    pub name: String,
    pub phone: Option<String>,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
}

/// Escalation progress derived from the chain action log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationState {
    pub family_notified_at: Option<DateTime<Utc>>,
    pub family_notifications_succeeded: u32,
    pub family_notifications_attempted: u32,
    pub doctor_notified_at: Option<DateTime<Utc>>,
    pub ambulance_called_at: Option<DateTime<Utc>>,
    pub incident_number: Option<String>,
    pub medication_list_provided_at: Option<DateTime<Utc>>,
    pub conference_active: bool,
    pub participants: Vec<ConferenceParticipant>,
}

impl EscalationState {
    pub fn family_notified(&self) -> bool {
        self.family_notified_at.is_some()
    }

    pub fn doctor_notified(&self) -> bool {
        self.doctor_notified_at.is_some()
    }

    pub fn ambulance_called(&self) -> bool {
        self.ambulance_called_at.is_some()
    }

    /// Rebuild the state from an alert's actions. Input order does not
    /// matter; actions are applied in sequence order.
    pub fn replay(actions: &[ChainAction]) -> Self {
        let mut ordered: Vec<&ChainAction> = actions.iter().collect();
        ordered.sort_by_key(|a| a.sequence);

        let mut state = EscalationState::default();
        for action in ordered {
            state.apply(action);
        }
        state
    }

    fn apply(&mut self, action: &ChainAction) {
        let at = action.occurred_at;
        match action.action_type {
            ChainActionType::FamilyNotified => {
                self.family_notified_at.get_or_insert(at);
                self.family_notifications_attempted += 1;
                if action.succeeded {
                    self.family_notifications_succeeded += 1;
                }
            }
            ChainActionType::DoctorNotified => {
                self.doctor_notified_at.get_or_insert(at);
            }
            ChainActionType::AmbulanceCalled => {
                if self.ambulance_called_at.is_none() {
                    self.ambulance_called_at = Some(at);
                    self.incident_number = action.reference.clone();
                }
            }
            ChainActionType::MedicationListProvided => {
                self.medication_list_provided_at.get_or_insert(at);
            }
            ChainActionType::ConferenceStarted => {
                self.conference_active = true;
                self.participants.clear();
                self.participants.push(participant_of(action));
            }
            ChainActionType::ConferenceParticipantAdded => {
                if self.conference_active {
                    self.participants.push(participant_of(action));
                }
            }
            ChainActionType::ConferenceEnded => {
                self.conference_active = false;
                self.participants.clear();
            }
        }
    }
}

fn participant_of(action: &ChainAction) -> ConferenceParticipant {
    ConferenceParticipant {
        name: action.target_name.clone().unwrap_or_default(),
        phone: action.target_phone.clone(),
        role: action.participant_role.unwrap_or(ParticipantRole::Other),
        joined_at: action.occurred_at,
    }
}
