use crate::errors::Error;
use crate::ingest::TelemetryIngestor;
use crate::metrics::{
    DROPPED_MESSAGES_TOTAL, ROUTED_MESSAGES_TOTAL, STORAGE_FAILURES_TOTAL, TELEMETRY_STORED_TOTAL,
};
use crate::model::CommandKind;
use crate::topics::{MessageKind, TopicRouter};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Raw (topic, payload) pair as received from the broker
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Stored,
    AckRecorded,
    Advisory,
    Unmatched,
    Rejected,
    StorageFailed,
}

/// Routes inbound messages to their handler. Every message is consumed
/// exactly once; failures are logged and never retried.
#[derive(Clone)]
pub struct Dispatcher {
    router: TopicRouter,
    ingestor: TelemetryIngestor,
    enable_device_ack: bool,
}

impl Dispatcher {
    pub fn new(router: TopicRouter, ingestor: TelemetryIngestor, enable_device_ack: bool) -> Self {
        Self {
            router,
            ingestor,
            enable_device_ack,
        }
    }

    pub async fn handle(&self, message: &InboundMessage) -> Outcome {
        let Some(route) = self.router.route(&message.topic) else {
            debug!("Dropping message on unmatched topic {}", message.topic);
            DROPPED_MESSAGES_TOTAL.with_label_values(&["unmatched"]).inc();
            return Outcome::Unmatched;
        };
        ROUTED_MESSAGES_TOTAL.inc();

        let result = match route.kind {
            MessageKind::Telemetry => self
                .ingestor
                .ingest(route.device_id, &message.payload)
                .await
                .map(|_| Outcome::Stored),
            MessageKind::ServoStatus | MessageKind::WaterStatus if !self.enable_device_ack => {
                info!(
                    "Advisory status from {} on {}",
                    route.device_id, message.topic
                );
                Ok(Outcome::Advisory)
            }
            MessageKind::ServoStatus => self
                .ingestor
                .record_ack(CommandKind::Servo, route.device_id, &message.payload)
                .await
                .map(|_| Outcome::AckRecorded),
            MessageKind::WaterStatus => self
                .ingestor
                .record_ack(CommandKind::Water, route.device_id, &message.payload)
                .await
                .map(|_| Outcome::AckRecorded),
        };

        match result {
            Ok(outcome) => {
                if outcome == Outcome::Stored {
                    TELEMETRY_STORED_TOTAL.inc();
                }
                outcome
            }
            Err(e @ (Error::Parse(_) | Error::Validation(_) | Error::Json(_))) => {
                warn!("Dropping message on {}: {}", message.topic, e);
                DROPPED_MESSAGES_TOTAL.with_label_values(&["invalid"]).inc();
                Outcome::Rejected
            }
            Err(e) => {
                error!(
                    "Storage failure for message on {}, message lost: {}",
                    message.topic, e
                );
                STORAGE_FAILURES_TOTAL.inc();
                Outcome::StorageFailed
            }
        }
    }
}

pub async fn run_dispatcher(mut rx: mpsc::Receiver<InboundMessage>, dispatcher: Dispatcher) {
    info!("Starting dispatcher");

    while let Some(message) = rx.recv().await {
        dispatcher.handle(&message).await;
    }

    info!("Dispatcher stopped");
}
