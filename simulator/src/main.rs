mod telemetry;

use rand::Rng;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::env;
use std::time::Duration;
use telemetry::Envelope;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
struct SimDevice {
    id: i64,
    api_key: String,
}

#[tokio::main]
async fn main() {
    let server_url =
        env::var("SERVER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let mqtt_broker = env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .unwrap_or_else(|_| "1883".to_string())
        .parse()
        .unwrap_or(1883);
    let rate: u64 = env::var("RATE")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .unwrap_or(100);
    let num_devices: usize = env::var("DEVICES")
        .unwrap_or_else(|_| "10".to_string())
        .parse()
        .unwrap_or(10);

    tracing_subscriber::fmt::init();

    info!("starting IoTFlow simulator");
    info!(
        "server: {server_url}, broker: {mqtt_broker}:{mqtt_port}, rate: {rate} msg/s, devices: {num_devices}"
    );

    let run_id: u32 = rand::thread_rng().gen();

    // Register the fleet over HTTP first; MQTT publishing needs the keys.
    let http = reqwest::Client::new();
    let mut devices = Vec::with_capacity(num_devices);
    for i in 0..num_devices {
        let name = format!("sim-{run_id:08x}-{i}");
        match register_device(&http, &server_url, &name).await {
            Ok(device) => devices.push(device),
            Err(e) => warn!("registration failed for {name}: {e}"),
        }
    }
    if devices.is_empty() {
        error!("no devices registered, exiting");
        std::process::exit(1);
    }
    info!("registered {} devices", devices.len());

    let client_id = format!("iotflow-sim-{run_id:08x}");
    let mut mqtt_options = MqttOptions::new(&client_id, &mqtt_broker, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(true);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 20_000);

    tokio::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                error!("MQTT eventloop error: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    info!("connected, publishing telemetry");

    let delay = Duration::from_micros(1_000_000 / rate.max(1));
    let mut sent: u64 = 0;
    loop {
        for device in &devices {
            let envelope = if sent % 20 == 19 {
                Envelope::heartbeat(device.id, device.api_key.clone())
            } else {
                Envelope::random(device.id, device.api_key.clone())
            };
            let topic = if sent % 20 == 19 {
                format!("iotflow/devices/{}/status/heartbeat", device.id)
            } else {
                format!("iotflow/devices/{}/telemetry/sensors", device.id)
            };
            let payload = serde_json::to_vec(&envelope).unwrap();

            if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                warn!("publish failed: {e}");
            }
            sent += 1;
            if sent % 1_000 == 0 {
                info!("published {sent} messages");
            }
            tokio::time::sleep(delay).await;
        }
    }
}

async fn register_device(
    http: &reqwest::Client,
    server_url: &str,
    name: &str,
) -> Result<SimDevice, String> {
    let response = http
        .post(format!("{server_url}/api/v1/devices/register"))
        .json(&serde_json::json!({ "name": name, "device_type": "simulator" }))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !response.status().is_success() {
        return Err(format!("server answered {}", response.status()));
    }
    let body: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
    let id = body["device"]["id"]
        .as_i64()
        .ok_or("registration response missing device.id")?;
    let api_key = body["device"]["api_key"]
        .as_str()
        .ok_or("registration response missing device.api_key")?
        .to_string();
    Ok(SimDevice { id, api_key })
}
