//! Device Simulator
//!
//! Stands in for the home emergency devices during development. On every
//! tick one online device with an assigned client reports in: its battery
//! drains, a heart rate is sampled around a circadian baseline, and an alert
//! is raised when the reading calls for one:
//!
//! - FallDetection for fall-capable devices, rarely
//! - HeartRateAlert outside the normal band, mostly from simulated spikes
//! - LowBattery when the battery crosses the low threshold

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal, NormalError};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::alerts;
use crate::error::AppResult;
use crate::models::{
    AlertInput, AlertType, Device, DeviceStatus, DeviceType, EmergencyAlert, LOW_BATTERY_THRESHOLD,
};
use crate::store::Repository;

const HEART_RATE_LOW: u16 = 40;
const HEART_RATE_HIGH: u16 = 120;

pub struct DeviceSimulator {
    interval_ms: u64,
    /// Resting heart rate of the simulated clients
    base_heart_rate: f64,
    drift_factor: f64,
    heart_rate_noise: Normal<f64>,
    /// Chance per tick of a tachycardia spike
    spike_probability: f64,
    /// Chance per tick that a fall-capable device reports a fall
    fall_probability: f64,
    battery_drain: u8,
}

impl DeviceSimulator {
    pub fn new(interval_ms: u64) -> Result<Self, NormalError> {
        info!(interval_ms = interval_ms, "Initializing device simulator");

        Ok(Self {
            interval_ms,
            base_heart_rate: 72.0,
            drift_factor: 0.0,
            heart_rate_noise: Normal::new(0.0, 5.0)?,
            spike_probability: 0.02,
            fall_probability: 0.01,
            battery_drain: 1,
        })
    }

    pub async fn run(mut self, repo: Arc<dyn Repository>) {
        info!("Starting device simulation loop");

        let mut tick_interval = interval(Duration::from_millis(self.interval_ms));
        let mut rng = StdRng::from_entropy();

        loop {
            tick_interval.tick().await;
            if let Err(e) = self.tick(repo.as_ref(), &mut rng).await {
                warn!(error = %e, "Simulated device tick failed");
            }
        }
    }

    fn sample_heart_rate<R: Rng>(&mut self, rng: &mut R) -> u16 {
        self.drift_factor += 0.01;
        if self.drift_factor > std::f64::consts::PI * 2.0 {
            self.drift_factor = 0.0;
        }

        let circadian = (self.drift_factor * 2.0).sin() * 10.0;
        let spike = if rng.gen::<f64>() < self.spike_probability {
            rng.gen_range(75.0..110.0)
        } else {
            0.0
        };
        let bpm = self.base_heart_rate + circadian + self.heart_rate_noise.sample(rng) + spike;
        bpm.clamp(30.0, 220.0).round() as u16
    }

    /// One device reports in; returns the alert it raised, if any
    pub async fn tick<R: Rng>(
        &mut self,
        repo: &dyn Repository,
        rng: &mut R,
    ) -> AppResult<Option<EmergencyAlert>> {
        let candidates: Vec<Device> = repo
            .list_devices()
            .await?
            .into_iter()
            .filter(|d| d.status == DeviceStatus::Online && d.client_id.is_some())
            .collect();

        if candidates.is_empty() {
            debug!("No online devices with clients to simulate");
            return Ok(None);
        }

        let mut device = candidates[rng.gen_range(0..candidates.len())].clone();
        let previous_battery = device.battery_level.unwrap_or(100);
        let battery = previous_battery.saturating_sub(self.battery_drain);
        device.battery_level = Some(battery);
        device.last_seen = Some(Utc::now());
        let device = repo.update_device(device).await?;

        let heart_rate = self.sample_heart_rate(rng);
        let can_detect_falls = matches!(
            device.device_type,
            DeviceType::FallDetector | DeviceType::Smartwatch
        );

        debug!(
            serial = %device.serial_number,
            battery = battery,
            heart_rate = heart_rate,
            "Simulated device reading"
        );

        let mut input = if can_detect_falls && rng.gen::<f64>() < self.fall_probability {
            AlertInput::of_type(AlertType::FallDetection)
        } else if !(HEART_RATE_LOW..=HEART_RATE_HIGH).contains(&heart_rate) {
            let mut input = AlertInput::of_type(AlertType::HeartRateAlert);
            input.details = Some(format!("Heart rate {} bpm outside normal range", heart_rate));
            input
        } else if previous_battery > LOW_BATTERY_THRESHOLD && battery <= LOW_BATTERY_THRESHOLD {
            let mut input = AlertInput::of_type(AlertType::LowBattery);
            input.details = Some(format!("Battery at {}%", battery));
            input
        } else {
            return Ok(None);
        };

        input.device_id = Some(device.id);
        input.heart_rate = Some(heart_rate);
        let alert = alerts::raise_alert(repo, input).await?;
        warn!(
            alert_id = %alert.id,
            serial = %device.serial_number,
            alert_type = ?alert.alert_type,
            "Simulated device raised an alert"
        );
        Ok(Some(alert))
    }
}
