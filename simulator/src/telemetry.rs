use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::json;

/// One simulated sensor reading, shaped like the server's MQTT envelope.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub api_key: String,
    pub device_id: i64,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn random(device_id: i64, api_key: String) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            api_key,
            device_id,
            timestamp: Utc::now(),
            data: json!({
                "temperature": round2(rng.gen_range(15.0..35.0)),
                "humidity": round2(rng.gen_range(30.0..80.0)),
                "battery": round2(rng.gen_range(20.0..100.0)),
            }),
        }
    }

    pub fn heartbeat(device_id: i64, api_key: String) -> Self {
        Self {
            api_key,
            device_id,
            timestamp: Utc::now(),
            data: json!({}),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_readings_stay_in_range() {
        for _ in 0..100 {
            let envelope = Envelope::random(1, "key".to_string());
            let temperature = envelope.data["temperature"].as_f64().unwrap();
            let humidity = envelope.data["humidity"].as_f64().unwrap();
            assert!((15.0..=35.0).contains(&temperature));
            assert!((30.0..=80.0).contains(&humidity));
        }
    }
}
