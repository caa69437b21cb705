//! Wall-clock time and ingress expiry deadlines.

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime};

const NANOS_PER_MILLI: u64 = 1_000_000;
const MILLIS_PER_SECOND: i64 = 1_000;
const MILLIS_PER_MINUTE: i64 = 60 * MILLIS_PER_SECOND;

/// Nanoseconds since the UNIX epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Time(u64);

pub const UNIX_EPOCH: Time = Time(0);

impl Time {
    pub const fn from_nanos_since_unix_epoch(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos_since_unix_epoch(self) -> u64 {
        self.0
    }

    pub const fn as_millis_since_unix_epoch(self) -> u64 {
        self.0 / NANOS_PER_MILLI
    }

    pub const fn from_millis_since_unix_epoch(millis: u64) -> Self {
        Self(millis * NANOS_PER_MILLI)
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        Self(self.0.saturating_sub(d.as_nanos() as u64))
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, d: Duration) -> Time {
        Time(self.0 + d.as_nanos() as u64)
    }
}

impl Sub<Time> for Time {
    type Output = Duration;

    fn sub(self, other: Time) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(other.0))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Where the current wall-clock time comes from.
///
/// Implementations must read the clock on every call; caching an instant
/// would break across host suspensions.
pub trait TimeSource: Send + Sync {
    fn current_time(&self) -> Time;
}

/// The stock time sources: the system clock, or a constant for tests.
pub enum TimeProvider {
    Constant(Time),
    SystemTime,
}

impl TimeSource for TimeProvider {
    fn current_time(&self) -> Time {
        match self {
            TimeProvider::Constant(time) => *time,
            TimeProvider::SystemTime => {
                let since_epoch = SystemTime::now()
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or_default();
                UNIX_EPOCH + since_epoch
            }
        }
    }
}

/// An ingress expiry deadline: an absolute nanosecond timestamp after which
/// a signed request is unacceptable to the network.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Expiry(u64);

impl Expiry {
    /// Computes the deadline `delta` past the drift-corrected clock.
    ///
    /// The result is rounded down to the whole minute when the rounded
    /// deadline still lies at least one minute ahead, otherwise down to the
    /// whole second. Coarse deadlines keep the request-id space small for
    /// replica-side duplicate detection without ever producing a deadline
    /// that is already past.
    pub fn from_delta(delta: Duration, drift_ms: i64, now: Time) -> Self {
        let corrected_ms = now.as_millis_since_unix_epoch() as i64 + drift_ms;
        let target_ms = corrected_ms + delta.as_millis() as i64;
        let floored_to_minute = target_ms - target_ms.rem_euclid(MILLIS_PER_MINUTE);
        let deadline_ms = if target_ms - corrected_ms >= MILLIS_PER_MINUTE
            && floored_to_minute - corrected_ms >= MILLIS_PER_MINUTE
        {
            floored_to_minute
        } else {
            (target_ms - target_ms.rem_euclid(MILLIS_PER_SECOND)).max(corrected_ms)
        };
        Self(deadline_ms.max(0) as u64 * NANOS_PER_MILLI)
    }

    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }
}

const EXPIRY_FIELD: &str = "__expiry__";

// The textual carrier is a decimal string: JSON tooling in other languages
// cannot be trusted with integers above 2^53.
impl Serialize for Expiry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Expiry", 1)?;
        s.serialize_field(EXPIRY_FIELD, &self.0.to_string())?;
        s.end()
    }
}

struct ExpiryVisitor;

impl<'de> Visitor<'de> for ExpiryVisitor {
    type Value = Expiry;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a map with a decimal `{EXPIRY_FIELD}` field")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Expiry, A::Error> {
        let mut nanos: Option<u64> = None;
        while let Some(key) = map.next_key::<String>()? {
            if key == EXPIRY_FIELD {
                let value = map.next_value::<DecimalU64>()?;
                nanos = Some(value.0);
            } else {
                return Err(de::Error::unknown_field(&key, &[EXPIRY_FIELD]));
            }
        }
        nanos
            .map(Expiry)
            .ok_or_else(|| de::Error::missing_field(EXPIRY_FIELD))
    }
}

impl<'de> Deserialize<'de> for Expiry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_struct("Expiry", &[EXPIRY_FIELD], ExpiryVisitor)
    }
}

struct DecimalU64(u64);

impl<'de> Deserialize<'de> for DecimalU64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DecimalVisitor;

        impl<'de> Visitor<'de> for DecimalVisitor {
            type Value = DecimalU64;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a u64 as a decimal string or integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<DecimalU64, E> {
                v.parse::<u64>()
                    .map(DecimalU64)
                    .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(v), &self))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<DecimalU64, E> {
                Ok(DecimalU64(v))
            }
        }

        deserializer.deserialize_any(DecimalVisitor)
    }
}
