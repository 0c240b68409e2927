//! Dispatcher softphone sessions
//!
//! Each dispatcher has one connection state driven by Gateway responses.
//! Transitions that do not fit the current state are rejected with a
//! conflict; gateway failures leave the state where it was.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::gateway::{normalize_phone_number, GatewayOutcome, TelephonyGateway};
use crate::models::{Dispatcher, DispatcherStatus};
use crate::store::Repository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ConnectionState {
    Offline,
    Connecting,
    Online,
    /// Call requested, waiting for the Gateway to answer
    Dialing { number: String },
    InCall { call_id: String, number: String },
    Held { call_id: String, number: String },
}

impl ConnectionState {
    fn call_id(&self) -> Option<&str> {
        match self {
            ConnectionState::InCall { call_id, .. } | ConnectionState::Held { call_id, .. } => {
                Some(call_id)
            }
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ConnectionState::Offline => "offline",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Online => "online",
            ConnectionState::Dialing { .. } => "dialing",
            ConnectionState::InCall { .. } => "in a call",
            ConnectionState::Held { .. } => "holding a call",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftphoneSession {
    pub dispatcher_id: Uuid,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SoftphoneSession {
    fn offline(dispatcher_id: Uuid) -> Self {
        Self {
            dispatcher_id,
            state: ConnectionState::Offline,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Result of a call-control request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallControlResult {
    pub outcome: GatewayOutcome,
    /// Session affected by the request, if the call belongs to one
    pub session: Option<SoftphoneSession>,
}

pub struct SoftphoneRegistry {
    repo: Arc<dyn Repository>,
    gateway: Arc<dyn TelephonyGateway>,
    sessions: RwLock<HashMap<Uuid, SoftphoneSession>>,
}

impl SoftphoneRegistry {
    pub fn new(repo: Arc<dyn Repository>, gateway: Arc<dyn TelephonyGateway>) -> Self {
        Self {
            repo,
            gateway,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    async fn dispatcher(&self, dispatcher_id: Uuid) -> AppResult<Dispatcher> {
        self.repo
            .get_dispatcher(dispatcher_id)
            .await?
            .ok_or_else(|| AppError::dispatcher_not_found(dispatcher_id))
    }

    async fn set_state(
        &self,
        dispatcher_id: Uuid,
        state: ConnectionState,
        last_error: Option<String>,
    ) -> SoftphoneSession {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(dispatcher_id)
            .or_insert_with(|| SoftphoneSession::offline(dispatcher_id));
        session.state = state;
        session.last_error = last_error;
        session.updated_at = Utc::now();
        session.clone()
    }

    async fn current(&self, dispatcher_id: Uuid) -> SoftphoneSession {
        self.sessions
            .read()
            .await
            .get(&dispatcher_id)
            .cloned()
            .unwrap_or_else(|| SoftphoneSession::offline(dispatcher_id))
    }

    /// Connection state of every dispatcher that has a session
    pub async fn states(&self) -> HashMap<Uuid, ConnectionState> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, session)| (*id, session.state.clone()))
            .collect()
    }

    pub async fn session(&self, dispatcher_id: Uuid) -> AppResult<SoftphoneSession> {
        self.dispatcher(dispatcher_id).await?;
        Ok(self.current(dispatcher_id).await)
    }

    /// Probe the Gateway and go Online when it answers
    pub async fn connect(&self, dispatcher_id: Uuid) -> AppResult<SoftphoneSession> {
        self.dispatcher(dispatcher_id).await?;

        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(dispatcher_id)
                .or_insert_with(|| SoftphoneSession::offline(dispatcher_id));
            match session.state {
                ConnectionState::Offline => {
                    session.state = ConnectionState::Connecting;
                    session.updated_at = Utc::now();
                }
                ConnectionState::Connecting => {
                    return Err(AppError::Conflict(
                        "Softphone is already connecting".to_string(),
                    ))
                }
                _ => return Ok(session.clone()),
            }
        }

        match self.gateway.active_calls().await {
            Ok(_) => {
                self.repo
                    .set_dispatcher_status(dispatcher_id, DispatcherStatus::Online)
                    .await?;
                info!(dispatcher_id = %dispatcher_id, "Softphone connected");
                Ok(self.set_state(dispatcher_id, ConnectionState::Online, None).await)
            }
            Err(e) => {
                warn!(dispatcher_id = %dispatcher_id, error = %e, "Softphone connection failed");
                Ok(self
                    .set_state(dispatcher_id, ConnectionState::Offline, Some(e.to_string()))
                    .await)
            }
        }
    }

    pub async fn disconnect(&self, dispatcher_id: Uuid) -> AppResult<SoftphoneSession> {
        self.dispatcher(dispatcher_id).await?;

        let current = self.current(dispatcher_id).await;
        if current.state.call_id().is_some()
            || matches!(current.state, ConnectionState::Dialing { .. })
        {
            return Err(AppError::Conflict(
                "Hang up the active call before disconnecting".to_string(),
            ));
        }

        self.repo
            .set_dispatcher_status(dispatcher_id, DispatcherStatus::Offline)
            .await?;
        info!(dispatcher_id = %dispatcher_id, "Softphone disconnected");
        Ok(self.set_state(dispatcher_id, ConnectionState::Offline, None).await)
    }

    /// Dial out from the dispatcher's extension; requires Online
    pub async fn initiate_call(
        &self,
        dispatcher_id: Uuid,
        callee: &str,
    ) -> AppResult<CallControlResult> {
        let dispatcher = self.dispatcher(dispatcher_id).await?;
        let number = normalize_phone_number(callee);

        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .entry(dispatcher_id)
                .or_insert_with(|| SoftphoneSession::offline(dispatcher_id));
            if session.state != ConnectionState::Online {
                return Err(AppError::Conflict(format!(
                    "Cannot start a call while {}",
                    session.state.name()
                )));
            }
            session.state = ConnectionState::Dialing {
                number: number.clone(),
            };
            session.updated_at = Utc::now();
        }

        let outcome = self.gateway.initiate_call(&dispatcher.extension, &number).await;

        let session = match (outcome.success, &outcome.session_id) {
            (true, Some(call_id)) => {
                let session = self
                    .set_state(
                        dispatcher_id,
                        ConnectionState::InCall {
                            call_id: call_id.clone(),
                            number,
                        },
                        None,
                    )
                    .await;
                self.repo.record_call_handled(dispatcher_id).await?;
                info!(dispatcher_id = %dispatcher_id, call_id = %call_id, "Call started");
                session
            }
            _ => {
                warn!(dispatcher_id = %dispatcher_id, error = ?outcome.error, "Call could not be started");
                self.set_state(dispatcher_id, ConnectionState::Online, outcome.error.clone())
                    .await
            }
        };

        Ok(CallControlResult {
            outcome,
            session: Some(session),
        })
    }

    async fn owner_of(&self, call_id: &str) -> Option<SoftphoneSession> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.state.call_id() == Some(call_id))
            .cloned()
    }

    /// Hold or resume a call. Calls not owned by a session are forwarded as is.
    pub async fn hold(&self, call_id: &str, on_hold: bool) -> AppResult<CallControlResult> {
        let owner = self.owner_of(call_id).await;

        if let Some(session) = &owner {
            let valid = matches!(
                (&session.state, on_hold),
                (ConnectionState::InCall { .. }, true) | (ConnectionState::Held { .. }, false)
            );
            if !valid {
                return Err(AppError::Conflict(format!(
                    "Cannot {} a call while {}",
                    if on_hold { "hold" } else { "resume" },
                    session.state.name()
                )));
            }
        }

        let outcome = self.gateway.hold(call_id, on_hold).await;
        let session = match owner {
            Some(session) if outcome.success => {
                let number = match session.state {
                    ConnectionState::InCall { number, .. } | ConnectionState::Held { number, .. } => {
                        number
                    }
                    _ => String::new(),
                };
                let call_id = call_id.to_string();
                let state = if on_hold {
                    ConnectionState::Held { call_id, number }
                } else {
                    ConnectionState::InCall { call_id, number }
                };
                Some(self.set_state(session.dispatcher_id, state, None).await)
            }
            other => other,
        };

        Ok(CallControlResult { outcome, session })
    }

    /// End a call; the owning session returns to Online
    pub async fn hangup(&self, call_id: &str) -> AppResult<CallControlResult> {
        let owner = self.owner_of(call_id).await;
        let outcome = self.gateway.hangup(call_id).await;

        // provider may already have dropped the call, so the session is freed either way
        let session = match owner {
            Some(session) => Some(
                self.set_state(session.dispatcher_id, ConnectionState::Online, outcome.error.clone())
                    .await,
            ),
            None => None,
        };
        info!(call_id = %call_id, success = outcome.success, "Call hangup requested");

        Ok(CallControlResult { outcome, session })
    }

    pub async fn mute(&self, call_id: &str, muted: bool) -> AppResult<CallControlResult> {
        let outcome = self.gateway.mute(call_id, muted).await;
        Ok(CallControlResult {
            session: self.owner_of(call_id).await,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::{ScriptedGateway, Sent};
    use crate::seed;
    use crate::store::MemoryStore;

    async fn setup() -> (Arc<MemoryStore>, Arc<ScriptedGateway>, SoftphoneRegistry, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let dispatcher = store
            .insert_dispatcher(seed::dispatcher("Lena", "e4"))
            .await
            .unwrap();
        let registry = SoftphoneRegistry::new(store.clone(), gateway.clone());
        (store, gateway, registry, dispatcher.id)
    }

    #[tokio::test]
    async fn test_call_rejected_while_offline() {
        let (_, gateway, registry, id) = setup().await;

        let err = registry.initiate_call(id, "0171 111222").await.unwrap_err();

        assert!(matches!(err, AppError::Conflict(_)));
        assert!(gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn test_full_call_walk() {
        let (store, gateway, registry, id) = setup().await;

        let session = registry.connect(id).await.unwrap();
        assert_eq!(session.state, ConnectionState::Online);

        let started = registry.initiate_call(id, "0171 111222").await.unwrap();
        let ConnectionState::InCall { call_id, number } = started.session.unwrap().state else {
            panic!("expected InCall");
        };
        assert_eq!(number, "+49171111222");
        assert!(matches!(&gateway.sent()[0], Sent::Call { from, .. } if from == "e4"));

        let held = registry.hold(&call_id, true).await.unwrap();
        assert!(matches!(held.session.unwrap().state, ConnectionState::Held { .. }));

        let resumed = registry.hold(&call_id, false).await.unwrap();
        assert!(matches!(resumed.session.unwrap().state, ConnectionState::InCall { .. }));

        let ended = registry.hangup(&call_id).await.unwrap();
        assert_eq!(ended.session.unwrap().state, ConnectionState::Online);

        let dispatcher = store.get_dispatcher(id).await.unwrap().unwrap();
        assert_eq!(dispatcher.calls_handled, 1);
        assert_eq!(dispatcher.status, DispatcherStatus::Online);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_initiate_dials_once() {
        let (store, gateway, registry, id) = setup().await;
        gateway.set_call_latency(std::time::Duration::from_millis(50));
        let registry = Arc::new(registry);
        registry.connect(id).await.unwrap();

        let a = registry.clone();
        let b = registry.clone();
        let (first, second) = tokio::join!(
            tokio::spawn(async move { a.initiate_call(id, "0171 111222").await }),
            tokio::spawn(async move { b.initiate_call(id, "030 5550000").await }),
        );
        let results = [first.unwrap(), second.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(AppError::Conflict(_)))));
        assert_eq!(gateway.call_count(), 1);
        assert!(matches!(
            registry.session(id).await.unwrap().state,
            ConnectionState::InCall { .. }
        ));
        assert_eq!(store.get_dispatcher(id).await.unwrap().unwrap().calls_handled, 1);
    }

    #[tokio::test]
    async fn test_invalid_hold_transitions() {
        let (_, _, registry, id) = setup().await;
        registry.connect(id).await.unwrap();
        let started = registry.initiate_call(id, "030 5550000").await.unwrap();
        let call_id = started.outcome.session_id.unwrap();

        assert!(matches!(
            registry.hold(&call_id, false).await,
            Err(AppError::Conflict(_))
        ));
        registry.hold(&call_id, true).await.unwrap();
        assert!(matches!(
            registry.hold(&call_id, true).await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_fails_when_gateway_unreachable() {
        let (_, gateway, registry, id) = setup().await;
        gateway.set_offline(true);

        let session = registry.connect(id).await.unwrap();

        assert_eq!(session.state, ConnectionState::Offline);
        assert!(session.last_error.is_some());
    }

    #[tokio::test]
    async fn test_failed_call_stays_online() {
        let (store, gateway, registry, id) = setup().await;
        registry.connect(id).await.unwrap();
        gateway.fail_number("0171 999999");

        let result = registry.initiate_call(id, "0171 999999").await.unwrap();

        assert!(!result.outcome.success);
        assert_eq!(result.session.unwrap().state, ConnectionState::Online);
        assert_eq!(store.get_dispatcher(id).await.unwrap().unwrap().calls_handled, 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_call_rejected() {
        let (store, _, registry, id) = setup().await;
        registry.connect(id).await.unwrap();
        let call_id = registry
            .initiate_call(id, "030 5550000")
            .await
            .unwrap()
            .outcome
            .session_id
            .unwrap();

        assert!(matches!(registry.disconnect(id).await, Err(AppError::Conflict(_))));

        registry.hangup(&call_id).await.unwrap();
        let session = registry.disconnect(id).await.unwrap();
        assert_eq!(session.state, ConnectionState::Offline);
        let dispatcher = store.get_dispatcher(id).await.unwrap().unwrap();
        assert_eq!(dispatcher.status, DispatcherStatus::Offline);
    }

    #[tokio::test]
    async fn test_unowned_call_is_forwarded() {
        let (_, gateway, registry, _) = setup().await;

        let result = registry.mute("call-1", true).await.unwrap();

        assert!(result.outcome.success);
        assert!(result.session.is_none());
        assert_eq!(gateway.sent(), vec![Sent::Mute("call-1".into(), true)]);
    }

    #[tokio::test]
    async fn test_unknown_dispatcher() {
        let (_, _, registry, _) = setup().await;
        assert!(matches!(
            registry.session(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_state_serialization() {
        let state = ConnectionState::InCall {
            call_id: "c1".into(),
            number: "+4930".into(),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["state"], "inCall");
        assert_eq!(json["callId"], "c1");
    }
}
