use crate::model::CommandKind;
use tracing::debug;

pub const SENSOR_DATA: &str = "sensor/+/data";
pub const SERVO_STATUS: &str = "servo/+/status";
pub const WATER_STATUS: &str = "water/+/status";

/// Semantic kind of an inbound message, derived from its topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Telemetry,
    ServoStatus,
    WaterStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route<'a> {
    pub kind: MessageKind,
    pub device_id: &'a str,
}

struct TopicPattern {
    category: &'static str,
    suffix: &'static str,
    kind: MessageKind,
}

const PATTERNS: [TopicPattern; 3] = [
    TopicPattern {
        category: "sensor",
        suffix: "data",
        kind: MessageKind::Telemetry,
    },
    TopicPattern {
        category: "servo",
        suffix: "status",
        kind: MessageKind::ServoStatus,
    },
    TopicPattern {
        category: "water",
        suffix: "status",
        kind: MessageKind::WaterStatus,
    },
];

/// Maps `<category>/<device_id>/<suffix>` topics to message kinds.
#[derive(Debug, Clone)]
pub struct TopicRouter {
    enable_device_ack: bool,
}

impl TopicRouter {
    pub fn new(enable_device_ack: bool) -> Self {
        Self { enable_device_ack }
    }

    /// Subscription filters issued on every transition into `Connected`.
    pub fn subscriptions(&self) -> Vec<&'static str> {
        if self.enable_device_ack {
            vec![SENSOR_DATA, SERVO_STATUS, WATER_STATUS]
        } else {
            vec![SENSOR_DATA]
        }
    }

    pub fn route<'a>(&self, topic: &'a str) -> Option<Route<'a>> {
        let mut segments = topic.split('/');
        let (category, device_id, suffix) =
            match (segments.next(), segments.next(), segments.next(), segments.next()) {
                (Some(c), Some(d), Some(s), None) => (c, d, s),
                _ => {
                    debug!("Topic {} does not have three segments", topic);
                    return None;
                }
            };

        if device_id.is_empty() || device_id == "+" || device_id == "#" {
            return None;
        }

        PATTERNS
            .iter()
            .find(|p| p.category == category && p.suffix == suffix)
            .map(|p| Route {
                kind: p.kind,
                device_id,
            })
    }
}

pub fn command_topic(device_id: &str, kind: CommandKind) -> String {
    format!("control/{}/{}", device_id, kind.as_str())
}
