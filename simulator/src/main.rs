mod telemetry;

use chrono::Utc;
use clap::Parser;
use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::collections::HashMap;
use std::time::Duration;
use telemetry::{ServoCommand, ServoStatus, Telemetry, WaterCommand, WaterStatus};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "simulator", about = "Simulates field devices for the telemetry gateway")]
struct Args {
    /// Broker host
    #[arg(long, env = "MQTT_BROKER", default_value = "localhost")]
    broker: String,

    #[arg(long, env = "MQTT_PORT", default_value_t = 1883)]
    port: u16,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 5)]
    devices: usize,

    /// Telemetry period per device
    #[arg(long, env = "INTERVAL_MS", default_value_t = 2000)]
    interval_ms: u64,

    #[arg(long, env = "DEVICE_PREFIX", default_value = "dev")]
    prefix: String,

    /// Do not answer commands on the status topics
    #[arg(long, env = "NO_ACK")]
    no_ack: bool,
}

/// Actuator state a device reports back in its telemetry
#[derive(Debug, Default, Clone, Copy)]
struct Actuators {
    servo_state: i32,
    water_state: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("Starting device simulator");
    info!(
        "Broker: {}:{}, Devices: {}, Interval: {}ms",
        args.broker, args.port, args.devices, args.interval_ms
    );

    let mut devices: HashMap<String, Actuators> = (0..args.devices)
        .map(|i| (format!("{}{}", args.prefix, i + 1), Actuators::default()))
        .collect();

    let client_id = format!("sim-{}", uuid::Uuid::new_v4());
    let mut mqtt_options = MqttOptions::new(&client_id, &args.broker, args.port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20000);

    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval_ms.max(1)));
    let mut rng = rand::thread_rng();

    loop {
        tokio::select! {
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        for topic in ["control/+/servo", "control/+/water"] {
                            if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                                error!("Subscribe to {} failed: {}", topic, e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        handle_command(
                            &client,
                            &mut devices,
                            &publish.topic,
                            &publish.payload,
                            !args.no_ack,
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT eventloop error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }

            _ = ticker.tick() => {
                for (device_id, actuators) in devices.iter() {
                    let telemetry = generate_telemetry(&mut rng, device_id.clone(), *actuators);
                    publish_json(&client, format!("sensor/{}/data", device_id), &telemetry);
                }
                debug!("Published telemetry for {} devices", devices.len());
            }
        }
    }
}

fn handle_command(
    client: &AsyncClient,
    devices: &mut HashMap<String, Actuators>,
    topic: &str,
    payload: &[u8],
    ack: bool,
) {
    let segments: Vec<&str> = topic.split('/').collect();
    let (device_id, kind) = match segments.as_slice() {
        ["control", device_id, kind] => (*device_id, *kind),
        _ => {
            warn!("Unexpected topic {}", topic);
            return;
        }
    };

    let Some(actuators) = devices.get_mut(device_id) else {
        debug!("Ignoring command for foreign device {}", device_id);
        return;
    };

    match kind {
        "servo" => match serde_json::from_slice::<ServoCommand>(payload) {
            Ok(command) => {
                actuators.servo_state = command.target_angle.clamp(0, 180);
                info!(
                    "{} servo -> {} (by {})",
                    device_id,
                    actuators.servo_state,
                    command.command_by.as_deref().unwrap_or("unknown")
                );
                if ack {
                    let status = ServoStatus {
                        device_id,
                        final_angle: actuators.servo_state,
                        status: "ok",
                    };
                    publish_json(client, format!("servo/{}/status", device_id), &status);
                }
            }
            Err(e) => warn!("Bad servo command for {}: {}", device_id, e),
        },
        "water" => match serde_json::from_slice::<WaterCommand>(payload) {
            Ok(command) => {
                actuators.water_state = command.water_state;
                info!(
                    "{} water -> {} (by {})",
                    device_id,
                    actuators.water_state,
                    command.command_by.as_deref().unwrap_or("unknown")
                );
                if ack {
                    let status = WaterStatus {
                        device_id,
                        water_state: actuators.water_state,
                        status: "ok",
                    };
                    publish_json(client, format!("water/{}/status", device_id), &status);
                }
            }
            Err(e) => warn!("Bad water command for {}: {}", device_id, e),
        },
        other => warn!("Unknown command kind {} for {}", other, device_id),
    }
}

/// Queues without awaiting; the caller also drives the event loop.
fn publish_json<T: serde::Serialize>(client: &AsyncClient, topic: String, body: &T) {
    let payload = match serde_json::to_vec(body) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to serialize payload for {}: {}", topic, e);
            return;
        }
    };

    if let Err(e) = client.try_publish(&topic, QoS::AtLeastOnce, false, payload) {
        warn!("Failed to publish to {}: {}", topic, e);
    }
}

fn generate_telemetry(rng: &mut impl Rng, device_id: String, actuators: Actuators) -> Telemetry {
    let temperature = if rng.gen_bool(0.05) {
        rng.gen_range(-50.0..100.0) // 5% outliers
    } else {
        rng.gen_range(15.0..35.0)
    };

    let humidity = if rng.gen_bool(0.05) {
        rng.gen_range(0.0..100.0) // 5% outliers
    } else {
        rng.gen_range(30.0..80.0)
    };

    Telemetry {
        device_id,
        timestamp: Utc::now(),
        temperature,
        humidity,
        pressure: rng.gen_range(990.0..1030.0),
        servo_state: actuators.servo_state,
        water_state: actuators.water_state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_generated_telemetry_carries_actuators() {
        let mut rng = StdRng::seed_from_u64(1);
        let actuators = Actuators {
            servo_state: 42,
            water_state: true,
        };
        let telemetry = generate_telemetry(&mut rng, "dev1".to_string(), actuators);

        assert_eq!(telemetry.servo_state, 42);
        assert!(telemetry.water_state);
        assert!((990.0..1030.0).contains(&telemetry.pressure));
    }

    #[test]
    fn test_commands_update_actuators() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("t", "localhost", 1883), 10);
        let mut devices = HashMap::from([("dev1".to_string(), Actuators::default())]);

        let commands: [(&str, &[u8]); 3] = [
            ("control/dev1/servo", br#"{"target_angle": 120}"#),
            ("control/dev1/water", br#"{"water_state": true}"#),
            ("control/other/servo", br#"{"target_angle": 5}"#),
        ];
        for (topic, payload) in commands {
            handle_command(&client, &mut devices, topic, payload, false);
        }

        assert_eq!(devices["dev1"].servo_state, 120);
        assert!(devices["dev1"].water_state);
        assert_eq!(devices.len(), 1);
    }
}
