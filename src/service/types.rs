//! Stream session descriptors

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifetime value meaning "never expires".
pub const LIFETIME_INFINITE: i64 = -1;

/// Public description of a running stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    /// None for streams that never expire.
    pub expires_at: Option<DateTime<Utc>>,
    pub lifetime_minutes: i64,
}

impl StreamInfo {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expiry| now >= expiry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infinite_lifetime_never_expires() {
        let info = StreamInfo {
            stream_id: "s".to_string(),
            source: "src".to_string(),
            started_at: Utc::now(),
            expires_at: None,
            lifetime_minutes: LIFETIME_INFINITE,
        };
        assert!(!info.is_expired(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn test_expiry_comparison() {
        let now = Utc::now();
        let info = StreamInfo {
            stream_id: "s".to_string(),
            source: "src".to_string(),
            started_at: now,
            expires_at: Some(now + chrono::Duration::minutes(5)),
            lifetime_minutes: 5,
        };
        assert!(!info.is_expired(now));
        assert!(info.is_expired(now + chrono::Duration::minutes(5)));
    }
}
