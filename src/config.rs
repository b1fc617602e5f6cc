/// Runtime tunables shared by every sensor of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorOptions {
    /// Frames buffered between the capture thread and user callbacks.
    pub frame_queue_capacity: usize,
    /// Notifications buffered before new ones are dropped.
    pub notification_queue_capacity: usize,
    /// Poll interval of HID reader threads, so they notice a stop request.
    pub hid_read_timeout_ms: i32,
    /// Drop the newest frame when the queue is full instead of blocking capture.
    pub drop_on_full: bool,
}

impl Default for SensorOptions {
    fn default() -> Self {
        Self {
            frame_queue_capacity: 32,
            notification_queue_capacity: 64,
            hid_read_timeout_ms: 100,
            drop_on_full: true,
        }
    }
}

impl SensorOptions {
    /// Defaults overridden by `DEPTH_SENSOR_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let options = Self {
            frame_queue_capacity: read_env_usize(
                "DEPTH_SENSOR_FRAME_QUEUE",
                defaults.frame_queue_capacity,
            )
            .max(1),
            notification_queue_capacity: read_env_usize(
                "DEPTH_SENSOR_NOTIFICATION_QUEUE",
                defaults.notification_queue_capacity,
            )
            .max(1),
            hid_read_timeout_ms: read_env_i32(
                "DEPTH_SENSOR_HID_READ_TIMEOUT_MS",
                defaults.hid_read_timeout_ms,
            ),
            drop_on_full: read_env_bool("DEPTH_SENSOR_DROP_ON_FULL", defaults.drop_on_full),
        };
        log::debug!("Sensor options: {:?}", options);
        options
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn read_env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn read_env_i32(name: &str, default: i32) -> i32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool(" Yes "), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("DEPTH_SENSOR_FRAME_QUEUE", " 8 ");
        std::env::set_var("DEPTH_SENSOR_NOTIFICATION_QUEUE", "lots");
        let options = SensorOptions::from_env();
        std::env::remove_var("DEPTH_SENSOR_FRAME_QUEUE");
        std::env::remove_var("DEPTH_SENSOR_NOTIFICATION_QUEUE");

        assert_eq!(options.frame_queue_capacity, 8);
        assert_eq!(options.notification_queue_capacity, 64);
        assert!(options.drop_on_full);
    }
}
