use crate::errors::{Error, Result};
use crate::model::TelemetryRecord;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;
pub const SERVO_MIN: i32 = 0;
pub const SERVO_MAX: i32 = 180;

/// Validates a normalized telemetry record
pub fn validate(telemetry: &TelemetryRecord) -> Result<()> {
    if telemetry.device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    if let Some(temperature) = telemetry.temperature {
        if !temperature.is_finite() || !(TEMP_MIN..=TEMP_MAX).contains(&temperature) {
            return Err(Error::Validation(format!(
                "Temperature {} out of range [{}, {}]",
                temperature, TEMP_MIN, TEMP_MAX
            )));
        }
    }

    if let Some(humidity) = telemetry.humidity {
        if !humidity.is_finite() || !(HUMIDITY_MIN..=HUMIDITY_MAX).contains(&humidity) {
            return Err(Error::Validation(format!(
                "Humidity {} out of range [{}, {}]",
                humidity, HUMIDITY_MIN, HUMIDITY_MAX
            )));
        }
    }

    if let Some(pressure) = telemetry.pressure {
        if !pressure.is_finite() {
            return Err(Error::Validation(format!("Pressure {} is not finite", pressure)));
        }
    }

    if !(SERVO_MIN..=SERVO_MAX).contains(&telemetry.servo_state) {
        return Err(Error::Validation(format!(
            "Servo state {} out of range [{}, {}]",
            telemetry.servo_state, SERVO_MIN, SERVO_MAX
        )));
    }

    Ok(())
}

/// Clamps into [0, 180] and truncates toward zero. NaN maps to 0.
pub fn clamp_servo_angle(angle: f64) -> i32 {
    if angle.is_nan() {
        return SERVO_MIN;
    }
    angle.clamp(SERVO_MIN as f64, SERVO_MAX as f64).trunc() as i32
}

/// Reads a numeric angle from a JSON number or numeric string.
pub fn parse_angle(value: &Value) -> Result<f64> {
    let angle = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    angle
        .filter(|a| !a.is_nan())
        .ok_or_else(|| Error::Validation(format!("angle must be numeric, got {}", value)))
}

/// Total truthiness coercion for water valve states. Boolean-like strings
/// ("false", "off", "0", "closed", ...) are false.
pub fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            match s.as_str() {
                "" | "false" | "off" | "no" | "closed" | "close" => false,
                "true" | "on" | "yes" | "open" => true,
                other => other.parse::<f64>().map_or(true, |f| f != 0.0 && !f.is_nan()),
            }
        }
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Accepts RFC 3339 strings in any offset/precision, or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Validation(format!("Invalid timestamp '{}': {}", s, e))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| Error::Validation(format!("Invalid epoch timestamp {}", n))),
        other => Err(Error::Validation(format!("Invalid timestamp {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn telemetry() -> TelemetryRecord {
        TelemetryRecord {
            id: None,
            device_id: "dev-1".to_string(),
            temperature: Some(25.0),
            humidity: Some(60.0),
            pressure: Some(1013.2),
            servo_state: 90,
            water_state: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_valid_telemetry() {
        assert!(validate(&telemetry()).is_ok());
    }

    #[test]
    fn test_missing_sensor_values_are_valid() {
        let mut t = telemetry();
        t.temperature = None;
        t.humidity = None;
        t.pressure = None;
        assert!(validate(&t).is_ok());
    }

    #[test]
    fn test_invalid_temperature() {
        let mut t = telemetry();
        t.temperature = Some(150.0);
        assert!(validate(&t).is_err());
    }

    #[test]
    fn test_invalid_humidity() {
        let mut t = telemetry();
        t.humidity = Some(-1.0);
        assert!(validate(&t).is_err());
    }

    #[test]
    fn test_empty_device_id() {
        let mut t = telemetry();
        t.device_id = String::new();
        assert!(validate(&t).is_err());
    }

    #[test]
    fn test_clamp_servo_angle() {
        assert_eq!(clamp_servo_angle(200.0), 180);
        assert_eq!(clamp_servo_angle(-15.0), 0);
        assert_eq!(clamp_servo_angle(f64::INFINITY), 180);
        assert_eq!(clamp_servo_angle(f64::NEG_INFINITY), 0);
        assert_eq!(clamp_servo_angle(f64::NAN), 0);
        assert_eq!(clamp_servo_angle(89.9), 89);
        for angle in 0..=180 {
            assert_eq!(clamp_servo_angle(angle as f64), angle);
        }
        for tenth in -5000..5000 {
            let clamped = clamp_servo_angle(tenth as f64 / 10.0);
            assert!((SERVO_MIN..=SERVO_MAX).contains(&clamped));
        }
    }

    #[test]
    fn test_parse_angle() {
        assert_eq!(parse_angle(&json!(42)).unwrap(), 42.0);
        assert_eq!(parse_angle(&json!("120.5")).unwrap(), 120.5);
        assert!(parse_angle(&json!("left")).is_err());
        assert!(parse_angle(&json!(null)).is_err());
        assert!(parse_angle(&json!(true)).is_err());
    }

    #[test]
    fn test_coerce_bool() {
        let truthy = [
            json!(true),
            json!(1),
            json!(-3.5),
            json!("true"),
            json!("ON"),
            json!("1"),
            json!("open"),
            json!("yes"),
            json!({}),
        ];
        let falsy = [
            json!(false),
            json!(0),
            json!(0.0),
            json!("false"),
            json!("Off"),
            json!("0"),
            json!(""),
            json!(null),
            json!("closed"),
        ];

        for v in truthy.iter() {
            assert!(coerce_bool(v), "{} should be true", v);
        }
        for v in falsy.iter() {
            assert!(!coerce_bool(v), "{} should be false", v);
        }
        // Non-boolean-like strings follow plain truthiness
        assert!(coerce_bool(&json!("banana")));
    }

    #[test]
    fn test_parse_timestamp() {
        let utc = parse_timestamp(&json!("2024-05-01T10:00:00Z")).unwrap();
        let offset = parse_timestamp(&json!("2024-05-01T12:00:00.000+02:00")).unwrap();
        assert_eq!(utc, offset);

        let millis = parse_timestamp(&json!(utc.timestamp_millis())).unwrap();
        assert_eq!(millis, utc);

        assert!(parse_timestamp(&json!("yesterday")).is_err());
        assert!(parse_timestamp(&json!(false)).is_err());
    }
}
