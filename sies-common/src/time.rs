//! Timestamp helpers for the `timestamp` field carried by every protocol
//! message (spec §3.1: "monotonic wall-clock at emission").
//!
//! `SystemTime` is what the rest of the workspace stores and compares;
//! `DateTime<Utc>` is what goes over the wire in the JSON encoding. The
//! `serde` module below lets a struct field keep the ergonomic `SystemTime`
//! type while (de)serializing as RFC 3339.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serializer};
use std::time::SystemTime;

/// Current time, for stamping a freshly constructed message.
pub fn now() -> SystemTime {
    SystemTime::now()
}

/// Serializes a `SystemTime` as an RFC 3339 string.
pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let datetime: DateTime<Utc> = (*time).into();
    serializer.serialize_str(&datetime.to_rfc3339())
}

/// Deserializes an RFC 3339 string into a `SystemTime`.
pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| SystemTime::from(dt.with_timezone(&Utc)))
        .map_err(serde::de::Error::custom)
}

/// `Option<SystemTime>` variant, for fields like `checkpoint.end_time` that
/// are absent until the operation completes.
pub mod option {
    use super::*;

    pub fn serialize<S>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match time {
            Some(t) => {
                let datetime: DateTime<Utc> = (*t).into();
                serializer.serialize_some(&datetime.to_rfc3339())
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SystemTime>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "super")] SystemTime);

        let opt: Option<Wrapper> = Option::deserialize(deserializer)?;
        Ok(opt.map(|Wrapper(st)| st))
    }
}
