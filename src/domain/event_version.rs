use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

/// Semantic version attached to every emitted event.
///
/// Minor and patch bumps are additive only, so two versions are compatible
/// exactly when their major components match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl EventVersion {
    pub const V1: EventVersion = EventVersion::new(1, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn is_compatible_with(&self, other: &EventVersion) -> bool {
        self.major == other.major
    }

    pub fn is_newer_than(&self, other: &EventVersion) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

impl Default for EventVersion {
    fn default() -> Self {
        Self::V1
    }
}

impl fmt::Display for EventVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid event version '{input}': expected major.minor.patch")]
pub struct VersionParseError {
    pub input: String,
}

impl FromStr for EventVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || VersionParseError {
            input: s.to_string(),
        };
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, VersionParseError> {
            parts.next().ok_or_else(err)?.parse().map_err(|_| err())
        };
        let version = EventVersion::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(err());
        }
        Ok(version)
    }
}

impl Serialize for EventVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Anything that carries an event type name and a schema version.
pub trait VersionedEvent {
    fn event_type(&self) -> &str;
    fn version(&self) -> EventVersion;
}

/// Decides whether a consumer can process an inbound event.
///
/// Never aborts processing on its own: a `false` result is the caller's to act on.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventVersionValidator;

impl EventVersionValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn is_supported<E>(&self, event: &E, expected: EventVersion, consumer_name: &str) -> bool
    where
        E: VersionedEvent + ?Sized,
    {
        let actual = event.version();

        if !actual.is_compatible_with(&expected) {
            warn!(
                consumer = consumer_name,
                event_type = event.event_type(),
                actual = %actual,
                expected = %expected,
                "Incompatible event major version"
            );
            return false;
        }

        match actual.cmp(&expected) {
            Ordering::Greater => info!(
                consumer = consumer_name,
                event_type = event.event_type(),
                actual = %actual,
                expected = %expected,
                "Event is newer than consumer expects; unknown additive fields are ignored"
            ),
            Ordering::Less => info!(
                consumer = consumer_name,
                event_type = event.event_type(),
                actual = %actual,
                expected = %expected,
                "Event is older than consumer expects; using backward compatible path"
            ),
            Ordering::Equal => {}
        }
        true
    }

    pub fn is_supported_any<E>(
        &self,
        event: &E,
        supported: &[EventVersion],
        consumer_name: &str,
    ) -> bool
    where
        E: VersionedEvent + ?Sized,
    {
        let actual = event.version();
        if supported.iter().any(|v| v.is_compatible_with(&actual)) {
            return true;
        }
        warn!(
            consumer = consumer_name,
            event_type = event.event_type(),
            actual = %actual,
            supported = ?supported.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Event version not in any supported major range"
        );
        false
    }
}
