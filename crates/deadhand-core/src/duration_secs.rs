//! Serde helper for `chrono::Duration` stored as whole seconds.
//!
//! Use with `#[serde(with = "deadhand_core::duration_secs")]`.

use chrono::Duration;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_i64(duration.num_seconds())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = i64::deserialize(deserializer)?;
    Duration::try_seconds(secs)
        .ok_or_else(|| serde::de::Error::custom(format!("duration out of range: {secs}s")))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super")]
        window: Duration,
    }

    #[test]
    fn test_serializes_as_seconds() {
        let json = serde_json::to_string(&Wrapper {
            window: Duration::hours(2),
        })
        .unwrap();
        assert_eq!(json, r#"{"window":7200}"#);

        let parsed: Wrapper = serde_json::from_str(r#"{"window":90}"#).unwrap();
        assert_eq!(parsed.window, Duration::seconds(90));
    }
}
