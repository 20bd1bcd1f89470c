//! Utility functions for the provider directory

use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Generate a unique AMQP consumer tag with the given prefix
pub fn generate_consumer_tag(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Get the current UTC timestamp
pub fn current_timestamp() -> DateTime<Utc> {
    Utc::now()
}

/// Express a duration in fractional milliseconds for log lines
pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_unique_consumer_tags() {
        let tag1 = generate_consumer_tag("directory");
        let tag2 = generate_consumer_tag("directory");
        assert_ne!(tag1, tag2);
        assert!(tag1.starts_with("directory-"));
    }

    #[test]
    fn test_duration_ms() {
        assert_eq!(duration_ms(Duration::from_millis(250)), 250.0);
        assert_eq!(duration_ms(Duration::ZERO), 0.0);
    }
}
