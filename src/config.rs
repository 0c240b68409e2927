//! Configuration management module
//!
//! Loads and validates environment-based configuration.
//! Provider credentials are only ever read from the environment.

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid value for environment variable {0}")]
    ParseError(&'static str),
}

/// Server configuration settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Telephony provider settings
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    /// Base URL of the provider REST API
    pub base_url: String,
    /// Token id used as basic-auth user
    pub token_id: Option<String>,
    /// Personal access token used as basic-auth password
    pub token: Option<String>,
    /// Provider SMS extension used as sender
    pub sms_id: String,
    /// Device extension used for call-outs not tied to a dispatcher
    pub dispatch_extension: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

impl GatewaySettings {
    pub fn has_credentials(&self) -> bool {
        self.token_id.is_some() && self.token.is_some()
    }
}

/// Escalation chain settings
#[derive(Debug, Clone, Deserialize)]
pub struct EscalationSettings {
    /// Pause between consecutive gateway sends (provider rate limit)
    pub send_delay_ms: u64,
    /// Also place a voice call to each family contact
    pub call_family: bool,
    /// Also place a voice call to the physician
    pub call_doctor: bool,
    /// Number dialled when the dispatcher does not give one
    pub ambulance_number: String,
}

/// Dashboard polling settings
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardSettings {
    pub poll_interval_secs: u64,
    pub recent_alerts: usize,
}

/// Device simulator settings
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatorSettings {
    pub enabled: bool,
    /// Interval in milliseconds between simulated device ticks
    pub interval_ms: u64,
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub gateway: GatewaySettings,
    pub escalation: EscalationSettings,
    pub dashboard: DashboardSettings,
    pub simulator: SimulatorSettings,
    pub seed_demo_data: bool,
}

impl Settings {
    /// Load settings from environment variables
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load settings from an arbitrary key lookup
    pub fn from_source<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            server: ServerSettings {
                host: text("SERVER_HOST", "0.0.0.0"),
                port: parse(&lookup, "SERVER_PORT", 8080)?,
            },
            gateway: GatewaySettings {
                base_url: text("GATEWAY_BASE_URL", "https://api.sipgate.com/v2"),
                token_id: lookup("GATEWAY_TOKEN_ID").filter(|v| !v.is_empty()),
                token: lookup("GATEWAY_TOKEN").filter(|v| !v.is_empty()),
                sms_id: text("GATEWAY_SMS_ID", "s0"),
                dispatch_extension: text("GATEWAY_DISPATCH_EXTENSION", "e0"),
                timeout_ms: parse(&lookup, "GATEWAY_TIMEOUT_MS", 10_000)?,
            },
            escalation: EscalationSettings {
                send_delay_ms: parse(&lookup, "ESCALATION_SEND_DELAY_MS", 500)?,
                call_family: parse(&lookup, "ESCALATION_CALL_FAMILY", false)?,
                call_doctor: parse(&lookup, "ESCALATION_CALL_DOCTOR", false)?,
                ambulance_number: text("ESCALATION_AMBULANCE_NUMBER", "112"),
            },
            dashboard: DashboardSettings {
                poll_interval_secs: parse(&lookup, "DASHBOARD_POLL_INTERVAL_SECS", 30)?,
                recent_alerts: parse(&lookup, "DASHBOARD_RECENT_ALERTS", 10)?,
            },
            simulator: SimulatorSettings {
                enabled: parse(&lookup, "SIMULATOR_ENABLED", false)?,
                interval_ms: parse(&lookup, "SIMULATOR_INTERVAL_MS", 5_000)?,
            },
            seed_demo_data: parse(&lookup, "SEED_DEMO_DATA", false)?,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| SettingsError::ParseError(key)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings_from(pairs: &[(&str, &str)]) -> Result<Settings, SettingsError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_source(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_settings() {
        let settings = settings_from(&[]).unwrap();

        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.escalation.send_delay_ms, 500);
        assert_eq!(settings.escalation.ambulance_number, "112");
        assert_eq!(settings.dashboard.poll_interval_secs, 30);
        assert!(!settings.simulator.enabled);
        assert!(!settings.gateway.has_credentials());
    }

    #[test]
    fn test_custom_settings() {
        let settings = settings_from(&[
            ("SERVER_PORT", "3000"),
            ("ESCALATION_SEND_DELAY_MS", "250"),
            ("GATEWAY_TOKEN_ID", "token-id"),
            ("GATEWAY_TOKEN", "secret"),
            ("SIMULATOR_ENABLED", "true"),
        ])
        .unwrap();

        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.escalation.send_delay_ms, 250);
        assert!(settings.gateway.has_credentials());
        assert!(settings.simulator.enabled);
    }

    #[test]
    fn test_empty_credentials_are_ignored() {
        let settings = settings_from(&[("GATEWAY_TOKEN_ID", ""), ("GATEWAY_TOKEN", "x")]).unwrap();
        assert!(!settings.gateway.has_credentials());
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = settings_from(&[("SERVER_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("SERVER_PORT"));
    }
}
