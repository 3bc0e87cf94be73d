use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, SecondsFormat, Utc};

use crate::{NodeId, VersoError};

/// Bits below the millisecond field: 10-bit sequence plus 8-bit node id.
const MILLIS_SHIFT: u32 = 18;
const SEQUENCE_SHIFT: u32 = 8;
const LOW_BITS: i64 = 0x3_FFFF;
const SEQUENCE_BITS: i64 = 0x3_FF00;
const NODE_BITS: i64 = 0xFF;

/// Largest per-millisecond sequence value.
pub const MAX_SEQUENCE: u16 = 1023;

/// Minimum rendered width; current-era identifiers are exactly this wide.
pub const TEXT_WIDTH: usize = 12;

const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Time-ordered, cluster-unique identifier.
///
/// Layout of the signed 64-bit value:
/// * bits 18..63: milliseconds since the Unix epoch
/// * bits 8..17:  per-millisecond sequence (0..=1023)
/// * bits 0..7:   node id (two's complement)
///
/// Ordering is numeric, which is also chronological. The text form is
/// uppercase base-36, zero-padded to [`TEXT_WIDTH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tuid(i64);

impl Tuid {
    pub const MIN: Tuid = Tuid(i64::MIN);
    pub const MAX: Tuid = Tuid(i64::MAX);

    pub const fn from_raw(raw: i64) -> Self {
        Tuid(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Pack the three fields. `sequence` is masked to 10 bits.
    pub const fn pack(millis: i64, sequence: u16, node_id: NodeId) -> Self {
        Tuid(
            ((millis << MILLIS_SHIFT) & !LOW_BITS)
                | (((sequence as i64) << SEQUENCE_SHIFT) & SEQUENCE_BITS)
                | ((node_id as u8) as i64 & NODE_BITS),
        )
    }

    /// Smallest identifier that can carry `millis`.
    pub const fn floor(millis: i64) -> Self {
        Tuid((millis << MILLIS_SHIFT) & !LOW_BITS)
    }

    /// Largest identifier that can carry `millis`.
    pub const fn ceiling(millis: i64) -> Self {
        Tuid((millis << MILLIS_SHIFT) | LOW_BITS)
    }

    /// The identifier immediately below this one, for use as an exclusive
    /// cursor that still admits `self`.
    pub const fn predecessor(self) -> Self {
        Tuid(self.0.saturating_sub(1))
    }

    pub const fn millis(self) -> i64 {
        self.0 >> MILLIS_SHIFT
    }

    pub const fn sequence(self) -> u16 {
        ((self.0 & SEQUENCE_BITS) >> SEQUENCE_SHIFT) as u16
    }

    pub const fn node_id(self) -> NodeId {
        (self.0 & NODE_BITS) as u8 as i8
    }

    pub fn created_at(self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis()).unwrap_or_default()
    }

    /// ISO-8601 instant with millisecond precision, e.g. `2014-12-06T15:38:25.468Z`.
    pub fn created_at_iso(self) -> String {
        self.created_at().to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// `yyyymmdd`
    pub fn year_month_day(self) -> i32 {
        let t = self.created_at();
        t.year() * 10_000 + t.month() as i32 * 100 + t.day() as i32
    }

    /// `yyyymm`
    pub fn year_month(self) -> i32 {
        let t = self.created_at();
        t.year() * 100 + t.month() as i32
    }

    /// `yyyyww` using ISO weeks (Monday start, week 1 holds the first Thursday).
    pub fn year_week(self) -> i32 {
        let week = self.created_at().iso_week();
        week.year() * 100 + week.week() as i32
    }

    /// `yyyyddd` with a 1-based ordinal day.
    pub fn year_day(self) -> i32 {
        let t = self.created_at();
        t.year() * 1000 + t.ordinal() as i32
    }

    /// Signed seconds from `self` to `other`, rounded half up. Negative when
    /// `other` is older.
    pub fn duration_seconds(self, other: Tuid) -> i64 {
        let delta_ms = other.millis() - self.millis();
        (delta_ms as f64 / 1000.0 + 0.5).floor() as i64
    }
}

impl fmt::Display for Tuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut magnitude = self.0.unsigned_abs();
        let mut buf = [b'0'; 13];
        let mut pos = buf.len();
        loop {
            pos -= 1;
            buf[pos] = DIGITS[(magnitude % 36) as usize];
            magnitude /= 36;
            if magnitude == 0 {
                break;
            }
        }
        let digits = &buf[pos..];
        if self.0 < 0 {
            f.write_str("-")?;
        } else {
            for _ in digits.len()..TEXT_WIDTH {
                f.write_str("0")?;
            }
        }
        // Only ASCII digits were written.
        f.write_str(std::str::from_utf8(digits).map_err(|_| fmt::Error)?)
    }
}

impl FromStr for Tuid {
    type Err = VersoError;

    /// Accepts any width and either letter case; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(VersoError::InvalidIdentifier("empty".into()));
        }
        i64::from_str_radix(trimmed, 36)
            .map(Tuid)
            .map_err(|e| VersoError::InvalidIdentifier(format!("'{trimmed}': {e}")))
    }
}

impl serde::Serialize for Tuid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Tuid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const T: i64 = 1_417_880_305_468; // 2014-12-06T15:38:25.468Z

    #[test]
    fn pack_matches_bit_layout() {
        let id = Tuid::pack(T, 3, 5);
        assert_eq!(id.raw(), (T << 18) | (3 << 8) | 5);
        assert_eq!(id.to_string().len(), TEXT_WIDTH);

        let back: Tuid = id.to_string().parse().unwrap();
        assert_eq!(back, id);
        assert_eq!(back.node_id(), 5);
        assert_eq!(back.sequence(), 3);
        assert_eq!(back.millis(), T);
        assert_eq!(back.created_at_iso(), "2014-12-06T15:38:25.468Z");
    }

    #[test]
    fn decodes_known_identifier() {
        let id: Tuid = "2TNSOS9L376Y".parse().unwrap();
        assert_eq!(id.raw(), 371_688_814_796_603_434);
        assert_eq!(id.millis(), T);
        assert_eq!(id.node_id(), 42);
        assert_eq!(id.to_string(), "2TNSOS9L376Y");
    }

    #[test]
    fn parse_is_lenient() {
        let upper: Tuid = "2TNSOS9L376Y".parse().unwrap();
        let lower: Tuid = "  2tnsos9l376y\n".parse().unwrap();
        assert_eq!(upper, lower);
        // Narrower and padded forms decode to the same value.
        let short: Tuid = "5M9S".parse().unwrap();
        let padded: Tuid = "000000005M9S".parse().unwrap();
        assert_eq!(short, padded);
        assert_eq!(short.raw(), 1 << 18);

        assert!("".parse::<Tuid>().is_err());
        assert!("not-base36!".parse::<Tuid>().is_err());
    }

    #[test]
    fn negative_node_ids_survive_packing() {
        let id = Tuid::pack(T, MAX_SEQUENCE, -127);
        assert_eq!(id.node_id(), -127);
        assert_eq!(id.sequence(), MAX_SEQUENCE);
        assert_eq!(id.millis(), T);
        assert!(id < Tuid::floor(T + 1));
    }

    #[test]
    fn floor_and_ceiling_bracket_a_millisecond() {
        let floor = Tuid::floor(T);
        let ceiling = Tuid::ceiling(T);
        for (seq, node) in [(0u16, 0i8), (0, -127), (MAX_SEQUENCE, 127), (500, -1)] {
            let id = Tuid::pack(T, seq, node);
            assert!(floor <= id && id <= ceiling);
        }
        assert_eq!(ceiling.raw() + 1, Tuid::floor(T + 1).raw());
        assert_eq!(floor.predecessor(), Tuid::ceiling(T - 1));
    }

    #[test]
    fn text_order_matches_numeric_order() {
        let mut ids: Vec<Tuid> = (0..200)
            .map(|_| {
                let millis = rand::random_range(0..(1i64 << 44));
                Tuid::pack(millis, rand::random_range(0..=MAX_SEQUENCE), rand::random())
            })
            .collect();
        ids.sort();
        let texts: Vec<String> = ids.iter().map(Tuid::to_string).collect();
        let mut sorted = texts.clone();
        sorted.sort();
        assert_eq!(texts, sorted);
    }

    #[test]
    fn calendar_fields_match_timestamp() {
        let millis = Utc.with_ymd_and_hms(2021, 1, 1, 12, 0, 0).unwrap().timestamp_millis();
        let id = Tuid::pack(millis, 0, 1);
        assert_eq!(id.year_month_day(), 20210101);
        assert_eq!(id.year_month(), 202101);
        // 2021-01-01 is a Friday in ISO week 53 of 2020.
        assert_eq!(id.year_week(), 202053);
        assert_eq!(id.year_day(), 2021001);

        let id = Tuid::pack(T, 0, 0);
        assert_eq!(id.year_month_day(), 20141206);
        assert_eq!(id.year_week(), 201449);
        assert_eq!(id.year_day(), 2014340);
    }

    #[test]
    fn calendar_round_trip_for_random_instants() {
        for _ in 0..100 {
            let millis = rand::random_range(0..4_102_444_800_000i64); // before 2100
            let id: Tuid = Tuid::pack(millis, 7, 3).to_string().parse().unwrap();
            let direct = DateTime::from_timestamp_millis(millis).unwrap();
            assert_eq!(
                id.year_month_day(),
                direct.year() * 10_000 + direct.month() as i32 * 100 + direct.day() as i32
            );
            assert_eq!(id.year_month(), direct.year() * 100 + direct.month() as i32);
            assert_eq!(id.year_day(), direct.year() * 1000 + direct.ordinal() as i32);
        }
    }

    #[test]
    fn duration_seconds_is_signed_and_rounded() {
        let a = Tuid::pack(T, 0, 0);
        let b = Tuid::pack(T + 2_500, 0, 0);
        let c = Tuid::pack(T + 2_499, 0, 0);
        assert_eq!(a.duration_seconds(b), 3);
        assert_eq!(a.duration_seconds(c), 2);
        assert_eq!(b.duration_seconds(a), -2);
        assert_eq!(a.duration_seconds(a), 0);
    }

    #[test]
    fn negative_values_render_with_sign() {
        let id = Tuid::from_raw(-36);
        assert_eq!(id.to_string(), "-10");
        assert_eq!("-10".parse::<Tuid>().unwrap(), id);
        assert_eq!(Tuid::MIN.to_string().parse::<Tuid>().unwrap(), Tuid::MIN);
        assert_eq!(Tuid::MAX.to_string(), "1Y2P0IJ32E8E7");
    }
}
