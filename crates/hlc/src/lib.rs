//! HLC timestamps and CAS token handling.
//!
//! Every CAS token the cluster issues is a hybrid-logical-clock reading
//! rendered as nanoseconds since the Unix epoch. This crate provides the
//! timestamp type, a monotonic clock used by the in-process store to mint
//! CAS values, and the encoding/decoding of the mutation-CAS macro string
//! the server writes into extended attributes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Immutable HLC timestamp with total ordering.
///
/// The total ordering is: physical time, then logical counter. The logical
/// counter stays below 1000 so that the nanosecond rendering of a timestamp
/// preserves the ordering exactly.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct HlcTimestamp {
    /// Physical time component (microseconds since Unix epoch)
    pub physical: u64,
    /// Logical counter for uniqueness within same physical time
    pub logical: u32,
}

impl HlcTimestamp {
    /// Create a new HLC timestamp.
    pub const fn new(physical: u64, logical: u32) -> Self {
        Self { physical, logical }
    }

    /// Render as a nanosecond CAS token.
    pub fn as_nanos(&self) -> u64 {
        self.physical * 1_000 + self.logical as u64
    }

    /// Reconstruct from a nanosecond CAS token.
    pub fn from_nanos(nanos: u64) -> Self {
        Self {
            physical: nanos / 1_000,
            logical: (nanos % 1_000) as u32,
        }
    }

    /// Physical component in milliseconds, the granularity lease expiry
    /// comparisons run at.
    pub fn as_millis(&self) -> u64 {
        self.physical / 1_000
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.physical, self.logical)
    }
}

/// Error parsing a mutation-CAS macro string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CasParseError {
    #[error("CAS string missing 0x prefix: {0:?}")]
    MissingPrefix(String),

    #[error("CAS string is not 16 hex digits: {0:?}")]
    InvalidHex(String),
}

/// Render a nanosecond CAS the way the server expands the mutation-CAS
/// macro: `0x` followed by the 16 hex digits of the byte-swapped
/// (little-endian) value.
pub fn format_mutation_cas(nanos: u64) -> String {
    format!("0x{:016x}", nanos.swap_bytes())
}

/// Parse a mutation-CAS macro string back into a timestamp.
///
/// Callers decide what a parse failure means; the client record protocol
/// treats an unparseable heartbeat as an expired peer rather than an error
/// worth raising.
pub fn parse_mutation_cas(s: &str) -> Result<HlcTimestamp, CasParseError> {
    let hex = s
        .strip_prefix("0x")
        .ok_or_else(|| CasParseError::MissingPrefix(s.to_string()))?;
    if hex.len() != 16 {
        return Err(CasParseError::InvalidHex(s.to_string()));
    }
    let raw =
        u64::from_str_radix(hex, 16).map_err(|_| CasParseError::InvalidHex(s.to_string()))?;
    Ok(HlcTimestamp::from_nanos(raw.swap_bytes()))
}

/// HLC clock for generating timestamps.
///
/// Strictly monotonic: readings within the same microsecond are ordered by
/// the logical counter, and the counter rolls into the physical component
/// before it could disturb the nanosecond rendering.
pub struct HlcClock {
    last_physical: AtomicU64,
    logical: AtomicU32,
}

impl HlcClock {
    /// Create a new HLC clock.
    pub fn new() -> Self {
        Self {
            last_physical: AtomicU64::new(0),
            logical: AtomicU32::new(0),
        }
    }

    /// Generate a new HLC timestamp.
    pub fn now(&self) -> HlcTimestamp {
        let physical = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_micros() as u64;

        let last = self.last_physical.load(Ordering::SeqCst);

        if physical > last {
            // New physical time, reset logical counter
            self.last_physical.store(physical, Ordering::SeqCst);
            self.logical.store(0, Ordering::SeqCst);
            HlcTimestamp::new(physical, 0)
        } else {
            // Same physical time, increment logical counter
            let logical = self.logical.fetch_add(1, Ordering::SeqCst) + 1;
            if logical >= 1_000 {
                // Counter would bleed into the microsecond component of the
                // nanosecond rendering; advance physical time instead.
                let physical = self.last_physical.fetch_add(1, Ordering::SeqCst) + 1;
                self.logical.store(0, Ordering::SeqCst);
                HlcTimestamp::new(physical, 0)
            } else {
                HlcTimestamp::new(last, logical)
            }
        }
    }

    /// Generate a fresh CAS token.
    pub fn now_cas(&self) -> u64 {
        self.now().as_nanos()
    }
}

impl Default for HlcClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering() {
        let ts1 = HlcTimestamp::new(100, 0);
        let ts2 = HlcTimestamp::new(100, 1);
        let ts3 = HlcTimestamp::new(101, 0);

        // Physical time dominates
        assert!(ts1 < ts3);
        assert!(ts2 < ts3);

        // Logical counter breaks ties
        assert!(ts1 < ts2);
    }

    #[test]
    fn test_nanos_roundtrip() {
        let ts = HlcTimestamp::new(123_456_789, 10);
        assert_eq!(HlcTimestamp::from_nanos(ts.as_nanos()), ts);
        assert_eq!(ts.as_nanos(), 123_456_789_010);
    }

    #[test]
    fn test_nanos_preserves_ordering() {
        let earlier = HlcTimestamp::new(100, 999);
        let later = HlcTimestamp::new(101, 0);
        assert!(earlier.as_nanos() < later.as_nanos());
    }

    #[test]
    fn test_mutation_cas_roundtrip() {
        let ts = HlcTimestamp::new(1_700_000_000_000_000, 42);
        let s = format_mutation_cas(ts.as_nanos());
        assert!(s.starts_with("0x"));
        assert_eq!(s.len(), 18);
        assert_eq!(parse_mutation_cas(&s).unwrap(), ts);
    }

    #[test]
    fn test_mutation_cas_rejects_garbage() {
        assert!(matches!(
            parse_mutation_cas("no-prefix"),
            Err(CasParseError::MissingPrefix(_))
        ));
        assert!(matches!(
            parse_mutation_cas("0xnothexdigitshere"),
            Err(CasParseError::InvalidHex(_))
        ));
        assert!(matches!(
            parse_mutation_cas("0x1234"),
            Err(CasParseError::InvalidHex(_))
        ));
    }

    #[test]
    fn test_clock_generation() {
        let clock = HlcClock::new();

        let ts1 = clock.now();
        let ts2 = clock.now();
        let ts3 = clock.now();

        // Timestamps should be monotonically increasing
        assert!(ts1 < ts2);
        assert!(ts2 < ts3);
    }

    #[test]
    fn test_cas_tokens_monotonic() {
        let clock = HlcClock::new();
        let mut previous = 0;
        for _ in 0..5_000 {
            let cas = clock.now_cas();
            assert!(cas > previous);
            previous = cas;
        }
    }

    #[test]
    fn test_as_millis() {
        let ts = HlcTimestamp::new(1_234_567, 3);
        assert_eq!(ts.as_millis(), 1_234);
    }
}
