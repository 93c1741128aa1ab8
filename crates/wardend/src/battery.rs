//! Battery level source
//!
//! [`TermuxBattery`] reads `termux-battery-status`; [`FakeBattery`] is a
//! settable stand-in for tests.

use crate::exec::{run_command, ExecError};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

const STATUS_PROGRAM: &str = "termux-battery-status";

#[derive(Debug, Error)]
pub enum BatteryError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("unreadable battery status: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("battery percentage {0} is out of range")]
    OutOfRange(i64),

    #[error("{0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BatterySource: Send + Sync {
    /// Current charge, 0..=100
    async fn percentage(&self, timeout: Duration) -> Result<u8, BatteryError>;
}

#[derive(Debug, Deserialize)]
struct BatteryStatus {
    percentage: i64,
}

/// Extract the charge from `termux-battery-status` JSON output
pub fn parse_status(stdout: &str) -> Result<u8, BatteryError> {
    let status: BatteryStatus = serde_json::from_str(stdout)?;
    u8::try_from(status.percentage)
        .ok()
        .filter(|p| *p <= 100)
        .ok_or(BatteryError::OutOfRange(status.percentage))
}

#[derive(Debug, Default)]
pub struct TermuxBattery;

impl TermuxBattery {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BatterySource for TermuxBattery {
    async fn percentage(&self, timeout: Duration) -> Result<u8, BatteryError> {
        let output = run_command(STATUS_PROGRAM, &[], timeout).await?;
        parse_status(&output.stdout)
    }
}

/// Battery whose reading is set by the test
pub struct FakeBattery {
    reading: Mutex<Result<u8, String>>,
}

impl FakeBattery {
    pub fn new(level: u8) -> Self {
        Self {
            reading: Mutex::new(Ok(level)),
        }
    }

    pub fn set_level(&self, level: u8) {
        *self.reading.lock().unwrap_or_else(|e| e.into_inner()) = Ok(level);
    }

    /// Make every subsequent read fail with `error`
    pub fn set_error(&self, error: &str) {
        *self.reading.lock().unwrap_or_else(|e| e.into_inner()) = Err(error.to_string());
    }
}

#[async_trait]
impl BatterySource for FakeBattery {
    async fn percentage(&self, _timeout: Duration) -> Result<u8, BatteryError> {
        self.reading
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .map_err(BatteryError::Unavailable)
    }
}
