use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Telemetry {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub servo_state: i32,
    pub water_state: bool,
}

/// Command bodies published by the gateway on `control/<id>/<kind>`
#[derive(Debug, Deserialize)]
pub struct ServoCommand {
    pub target_angle: i32,
    pub command_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaterCommand {
    pub water_state: bool,
    pub command_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServoStatus<'a> {
    pub device_id: &'a str,
    pub final_angle: i32,
    pub status: &'a str,
}

#[derive(Debug, Serialize)]
pub struct WaterStatus<'a> {
    pub device_id: &'a str,
    pub water_state: bool,
    pub status: &'a str,
}
