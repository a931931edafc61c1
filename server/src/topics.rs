/// MQTT topic tree:
///
/// ```text
/// iotflow/devices/{id}/telemetry/{sensors|events|metrics}   inbound, QoS 1
/// iotflow/devices/{id}/status/{heartbeat|online|offline}    inbound, QoS 1
/// iotflow/devices/{id}/commands/control                     outbound, QoS 1
/// ```
///
/// Only status online/offline are retained by the broker.
pub const BASE: &str = "iotflow";

pub const SUBSCRIPTIONS: [&str; 3] = [
    "iotflow/devices/+/telemetry/#",
    "iotflow/devices/+/status/#",
    "iotflow/devices/+/commands/#",
];

/// Last-Will topic announcing ingress death for operator visibility.
pub const LWT_TOPIC: &str = "$SYS/iotflow/ingress/offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryChannel {
    Sensors,
    Events,
    Metrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Heartbeat,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic {
    Telemetry {
        device_id: i64,
        channel: TelemetryChannel,
    },
    Status {
        device_id: i64,
        kind: StatusKind,
    },
    /// Loopback of our own outbound commands.
    Command {
        device_id: i64,
    },
}

impl InboundTopic {
    pub fn device_id(&self) -> i64 {
        match self {
            InboundTopic::Telemetry { device_id, .. }
            | InboundTopic::Status { device_id, .. }
            | InboundTopic::Command { device_id } => *device_id,
        }
    }

    pub fn is_telemetry(&self) -> bool {
        matches!(self, InboundTopic::Telemetry { .. })
    }
}

/// Parses an inbound topic. Anything outside the device tree is `None`.
pub fn parse(topic: &str) -> Option<InboundTopic> {
    let mut parts = topic.split('/');
    if parts.next()? != BASE || parts.next()? != "devices" {
        return None;
    }
    let device_id: i64 = parts.next()?.parse().ok()?;
    if device_id < 1 {
        return None;
    }
    let kind = parts.next()?;
    let leaf = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    match kind {
        "telemetry" => {
            let channel = match leaf {
                "sensors" => TelemetryChannel::Sensors,
                "events" => TelemetryChannel::Events,
                "metrics" => TelemetryChannel::Metrics,
                _ => return None,
            };
            Some(InboundTopic::Telemetry { device_id, channel })
        }
        "status" => {
            let kind = match leaf {
                "heartbeat" => StatusKind::Heartbeat,
                "online" => StatusKind::Online,
                "offline" => StatusKind::Offline,
                _ => return None,
            };
            Some(InboundTopic::Status { device_id, kind })
        }
        "commands" => Some(InboundTopic::Command { device_id }),
        _ => None,
    }
}

/// Topic for outbound control commands to one device.
pub fn command_topic(device_id: i64) -> String {
    format!("{BASE}/devices/{device_id}/commands/control")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_telemetry_channels() {
        assert_eq!(
            parse("iotflow/devices/1/telemetry/sensors"),
            Some(InboundTopic::Telemetry {
                device_id: 1,
                channel: TelemetryChannel::Sensors
            })
        );
        assert_eq!(
            parse("iotflow/devices/42/telemetry/metrics"),
            Some(InboundTopic::Telemetry {
                device_id: 42,
                channel: TelemetryChannel::Metrics
            })
        );
        assert_eq!(parse("iotflow/devices/1/telemetry/bogus"), None);
    }

    #[test]
    fn test_parse_status_kinds() {
        assert_eq!(
            parse("iotflow/devices/7/status/heartbeat"),
            Some(InboundTopic::Status {
                device_id: 7,
                kind: StatusKind::Heartbeat
            })
        );
        assert_eq!(
            parse("iotflow/devices/7/status/offline"),
            Some(InboundTopic::Status {
                device_id: 7,
                kind: StatusKind::Offline
            })
        );
    }

    #[test]
    fn test_parse_rejects_foreign_topics() {
        assert_eq!(parse("other/devices/1/telemetry/sensors"), None);
        assert_eq!(parse("iotflow/fleet/1/telemetry/sensors"), None);
        assert_eq!(parse("iotflow/devices/not-a-number/telemetry/sensors"), None);
        assert_eq!(parse("iotflow/devices/0/telemetry/sensors"), None);
        assert_eq!(parse("iotflow/devices/1/telemetry"), None);
        assert_eq!(parse("iotflow/devices/1/telemetry/sensors/extra"), None);
    }

    #[test]
    fn test_command_topic_round_trips() {
        let topic = command_topic(9);
        assert_eq!(topic, "iotflow/devices/9/commands/control");
        assert_eq!(parse(&topic), Some(InboundTopic::Command { device_id: 9 }));
    }
}
