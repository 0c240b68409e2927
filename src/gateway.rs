//! Telephony Gateway Adapter
//!
//! Wraps the provider's REST API (calls, SMS, call control) behind
//! [`TelephonyGateway`]. Failures are reported as [`GatewayOutcome`] values,
//! never raised, and nothing is retried here; retry policy belongs to callers.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::GatewaySettings;

/// Country prefix applied to national numbers
pub const DEFAULT_COUNTRY_PREFIX: &str = "+49";

/// Emergency and service short codes (112, 110, 19222) are dialled as-is
const MAX_SHORT_CODE_LEN: usize = 5;

/// Normalize a German phone number to E.164.
///
/// `0171111222` -> `+49171111222`, `+49171111222` unchanged,
/// `171111222` -> `+49171111222`, `0049171111222` -> `+49171111222`.
/// Short codes such as `112` stay unchanged.
pub fn normalize_phone_number(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '/' | '(' | ')' | '.'))
        .collect();

    if cleaned.is_empty() || cleaned.starts_with('+') || is_short_code(&cleaned) {
        return cleaned;
    }
    if let Some(rest) = cleaned.strip_prefix("00") {
        return format!("+{}", rest);
    }
    if let Some(rest) = cleaned.strip_prefix('0') {
        return format!("{}{}", DEFAULT_COUNTRY_PREFIX, rest);
    }
    format!("{}{}", DEFAULT_COUNTRY_PREFIX, cleaned)
}

fn is_short_code(number: &str) -> bool {
    number.len() <= MAX_SHORT_CODE_LEN
        && !number.starts_with('0')
        && number.chars().all(|c| c.is_ascii_digit())
}

/// Plausibility check used by input validation
pub fn is_plausible_phone_number(raw: &str) -> bool {
    let normalized = normalize_phone_number(raw);
    if normalized.len() >= 3 && is_short_code(&normalized) {
        return true;
    }
    let digits = normalized.trim_start_matches('+');
    (6..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

/// Result of a single provider request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayOutcome {
    pub success: bool,
    /// Provider-assigned session id, when the provider returns one
    pub session_id: Option<String>,
    pub error: Option<String>,
}

impl GatewayOutcome {
    pub fn ok(session_id: Option<String>) -> Self {
        Self {
            success: true,
            session_id,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
        }
    }

    /// Short result text for audit records, e.g. "SMS succeeded" / "SMS failed: busy"
    pub fn describe(&self, what: &str) -> String {
        match (self.success, &self.session_id, &self.error) {
            (true, Some(session), _) => format!("{} succeeded (session {})", what, session),
            (true, None, _) => format!("{} succeeded", what),
            (false, _, Some(error)) => format!("{} failed: {}", what, error),
            (false, _, None) => format!("{} failed", what),
        }
    }
}

impl From<Result<Option<String>, GatewayError>> for GatewayOutcome {
    fn from(result: Result<Option<String>, GatewayError>) -> Self {
        match result {
            Ok(session_id) => GatewayOutcome::ok(session_id),
            Err(e) => GatewayOutcome::failed(e.to_string()),
        }
    }
}

/// A call currently known to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCall {
    pub call_id: String,
    pub participants: Vec<String>,
    pub muted: bool,
    pub on_hold: bool,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway credentials are not configured")]
    NotConfigured,

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait TelephonyGateway: Send + Sync {
    /// Place a call from a provider device extension to a number
    async fn initiate_call(&self, from_extension: &str, to_number: &str) -> GatewayOutcome;
    async fn send_sms(&self, number: &str, message: &str) -> GatewayOutcome;
    async fn hangup(&self, call_id: &str) -> GatewayOutcome;
    async fn hold(&self, call_id: &str, on_hold: bool) -> GatewayOutcome;
    async fn mute(&self, call_id: &str, muted: bool) -> GatewayOutcome;
    async fn active_calls(&self) -> Result<Vec<ActiveCall>, GatewayError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallListResponse {
    #[serde(default)]
    data: Vec<ProviderCall>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderCall {
    call_id: String,
    #[serde(default)]
    muted: bool,
    #[serde(default)]
    hold: bool,
    #[serde(default)]
    participants: Vec<ProviderParticipant>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderParticipant {
    phone_number: Option<String>,
}

impl From<ProviderCall> for ActiveCall {
    fn from(call: ProviderCall) -> Self {
        ActiveCall {
            call_id: call.call_id,
            participants: call
                .participants
                .into_iter()
                .filter_map(|p| p.phone_number)
                .collect(),
            muted: call.muted,
            on_hold: call.hold,
        }
    }
}

/// REST implementation of the gateway
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    settings: GatewaySettings,
}

impl HttpGateway {
    pub fn new(settings: GatewaySettings) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;

        if settings.has_credentials() {
            info!(base_url = %settings.base_url, "Telephony gateway configured");
        } else {
            warn!("Telephony gateway credentials missing; calls and SMS will fail");
        }

        Ok(Self { client, settings })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<reqwest::Response, GatewayError> {
        let (Some(token_id), Some(token)) = (&self.settings.token_id, &self.settings.token) else {
            return Err(GatewayError::NotConfigured);
        };

        let response = request.basic_auth(token_id, Some(token)).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), body = %body, "Provider rejected request");
        Err(GatewayError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn session_request(&self, request: RequestBuilder) -> Result<Option<String>, GatewayError> {
        let response = self.execute(request).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        // Some endpoints answer 200 with an empty body
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        Ok(serde_json::from_slice::<SessionResponse>(&body)
            .ok()
            .and_then(|s| s.session_id))
    }
}

#[async_trait]
impl TelephonyGateway for HttpGateway {
    async fn initiate_call(&self, from_extension: &str, to_number: &str) -> GatewayOutcome {
        let callee = normalize_phone_number(to_number);
        debug!(from = %from_extension, callee = %callee, "Initiating call");

        let request = self.client.post(self.url("sessions/calls")).json(&json!({
            "deviceId": from_extension,
            "caller": from_extension,
            "callee": callee,
        }));
        self.session_request(request).await.into()
    }

    async fn send_sms(&self, number: &str, message: &str) -> GatewayOutcome {
        let recipient = normalize_phone_number(number);
        debug!(recipient = %recipient, length = message.len(), "Sending SMS");

        let request = self.client.post(self.url("sessions/sms")).json(&json!({
            "smsId": self.settings.sms_id,
            "recipient": recipient,
            "message": message,
        }));
        self.session_request(request).await.into()
    }

    async fn hangup(&self, call_id: &str) -> GatewayOutcome {
        let request = self.client.delete(self.url(&format!("calls/{}", call_id)));
        self.session_request(request).await.into()
    }

    async fn hold(&self, call_id: &str, on_hold: bool) -> GatewayOutcome {
        let request = self
            .client
            .put(self.url(&format!("calls/{}/hold", call_id)))
            .json(&json!({ "value": on_hold }));
        self.session_request(request).await.into()
    }

    async fn mute(&self, call_id: &str, muted: bool) -> GatewayOutcome {
        let request = self
            .client
            .put(self.url(&format!("calls/{}/muted", call_id)))
            .json(&json!({ "value": muted }));
        self.session_request(request).await.into()
    }

    async fn active_calls(&self) -> Result<Vec<ActiveCall>, GatewayError> {
        let response = self.execute(self.client.get(self.url("calls"))).await?;
        let calls: CallListResponse = response.json().await?;
        Ok(calls.data.into_iter().map(ActiveCall::from).collect())
    }
}
