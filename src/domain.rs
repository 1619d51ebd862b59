//! Range domains (spec §3): the totally ordered, optionally discrete value
//! space an era's interval bounds live in. Generalizes the reference crate's
//! `range_subtype_category` char tag (`'D'`/`'N'`) into a typed enum covering
//! every domain spec §3 names.

use std::cmp::Ordering;

use crate::error::MergeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Integer,
    BigInt,
    Date,
    Timestamp,
    TimestampTz,
    Numeric,
}

impl Domain {
    pub fn from_str(s: &str) -> Result<Self, MergeError> {
        match s {
            "integer" | "int4" => Ok(Self::Integer),
            "bigint" | "int8" => Ok(Self::BigInt),
            "date" => Ok(Self::Date),
            "timestamp" => Ok(Self::Timestamp),
            "timestamptz" => Ok(Self::TimestampTz),
            "numeric" => Ok(Self::Numeric),
            other => Err(MergeError::RangeDomainUnsupported {
                domain: other.to_string(),
            }),
        }
    }

    /// True for domains whose step between consecutive representable values
    /// is fixed and nonzero (spec §3 "domain discreteness flag").
    pub fn is_discrete(&self) -> bool {
        matches!(self, Self::Integer | Self::BigInt | Self::Date)
    }

    /// True when finite bound values should compare as numbers rather than
    /// lexicographically-sorted strings. Date/timestamp/timestamptz values are
    /// carried as ISO-8601 text, which already sorts correctly lexicographically.
    fn compares_numerically(&self) -> bool {
        matches!(self, Self::Integer | Self::BigInt | Self::Numeric)
    }

    /// The fixed step between consecutive representable values, for domains
    /// where `is_discrete()` is true. Used to convert an inclusive `valid_to`
    /// end into the canonical exclusive `valid_until` and back (spec §4.3,
    /// §9's "discrete vs continuous" note). Mirrors the reference crate's
    /// `date_minus_one`, generalized to integer/bigint/date.
    pub fn discrete_step(&self) -> Option<DiscreteStep> {
        match self {
            Self::Integer | Self::BigInt => Some(DiscreteStep::Integral(1)),
            Self::Date => Some(DiscreteStep::CalendarDay),
            Self::Timestamp | Self::TimestampTz | Self::Numeric => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DiscreteStep {
    /// Add/subtract this many units for integer/bigint domains.
    Integral(i64),
    /// Add/subtract one calendar day, accounting for month/year rollover.
    CalendarDay,
}

/// A boundary value on a [`Domain`]'s totally ordered axis. `NegInfinity` and
/// `PosInfinity` are the sentinels spec §3 requires ("both may carry the
/// sentinels `-infinity`, `+infinity`"); `Finite` carries the value's textual
/// representation (the planner never needs to do arithmetic on it besides
/// comparison and, for discrete domains, computing a successor/predecessor).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BoundValue {
    NegInfinity,
    Finite(String),
    PosInfinity,
}

impl BoundValue {
    pub fn finite(s: impl Into<String>) -> Self {
        Self::Finite(s.into())
    }

    pub fn as_finite(&self) -> Option<&str> {
        match self {
            Self::Finite(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Self::NegInfinity | Self::PosInfinity)
    }

    pub fn compare(&self, other: &Self, domain: Domain) -> Ordering {
        use BoundValue::*;
        match (self, other) {
            (NegInfinity, NegInfinity) => Ordering::Equal,
            (NegInfinity, _) => Ordering::Less,
            (_, NegInfinity) => Ordering::Greater,
            (PosInfinity, PosInfinity) => Ordering::Equal,
            (PosInfinity, _) => Ordering::Greater,
            (_, PosInfinity) => Ordering::Less,
            (Finite(a), Finite(b)) => {
                if domain.compares_numerically() {
                    let an = parse_numeric(a);
                    let bn = parse_numeric(b);
                    an.partial_cmp(&bn).unwrap_or(Ordering::Equal)
                } else {
                    a.cmp(b)
                }
            }
        }
    }

    /// The discrete successor of this value (the smallest representable value
    /// strictly greater than `self`), used to convert `valid_to` (inclusive)
    /// into `valid_until` (exclusive). `None` for infinite sentinels or
    /// continuous domains.
    pub fn successor(&self, domain: Domain) -> Option<Self> {
        let Finite(s) = self else { return None };
        step_finite(s, domain, 1)
    }

    /// The discrete predecessor, the inverse of `successor`; used to derive
    /// the inclusive `valid_to` mirror from the canonical `valid_until`.
    pub fn predecessor(&self, domain: Domain) -> Option<Self> {
        let Finite(s) = self else { return None };
        step_finite(s, domain, -1)
    }
}

use BoundValue::Finite;

fn step_finite(s: &str, domain: Domain, direction: i64) -> Option<BoundValue> {
    match domain.discrete_step()? {
        DiscreteStep::Integral(n) => {
            let v: i64 = s.parse().ok()?;
            Some(BoundValue::Finite((v + direction * n).to_string()))
        }
        DiscreteStep::CalendarDay => shift_calendar_day(s, direction),
    }
}

/// Shift an ISO-8601 `YYYY-MM-DD` date string by `direction` calendar days
/// (`+1` or `-1`), accounting for month/year rollover and leap years.
/// Generalizes the reference crate's `date_minus_one`, which only subtracted.
fn shift_calendar_day(s: &str, direction: i64) -> Option<BoundValue> {
    let (y, m, d) = parse_ymd(s)?;
    let days = ymd_to_epoch_day(y, m, d) + direction;
    let (y2, m2, d2) = epoch_day_to_ymd(days);
    Some(BoundValue::Finite(format!("{y2:04}-{m2:02}-{d2:02}")))
}

fn parse_ymd(s: &str) -> Option<(i64, u32, u32)> {
    let mut parts = s.splitn(3, '-');
    let y: i64 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    let d: u32 = parts.next()?.parse().ok()?;
    Some((y, m, d))
}

fn is_leap_year(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

fn days_in_month(y: i64, m: u32) -> u32 {
    match m {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if is_leap_year(y) {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}

/// Days since the epoch `0000-03-01` (chosen so leap days fall at year end,
/// simplifying the leap-year arithmetic). Used only as an internal linear
/// axis for adding/subtracting one day; not exposed.
fn ymd_to_epoch_day(y: i64, m: u32, d: u32) -> i64 {
    let (y, m) = if m <= 2 { (y - 1, m + 12) } else { (y, m) };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let doy = (153 * (m as i64 - 3) + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

fn epoch_day_to_ymd(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

fn parse_numeric(s: &str) -> f64 {
    match s {
        "infinity" => f64::INFINITY,
        "-infinity" => f64::NEG_INFINITY,
        _ => s.parse::<f64>().unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calendar_day_rolls_over_month_and_year() {
        assert_eq!(
            shift_calendar_day("2024-01-31", 1),
            Some(BoundValue::Finite("2024-02-01".into()))
        );
        assert_eq!(
            shift_calendar_day("2024-12-31", 1),
            Some(BoundValue::Finite("2025-01-01".into()))
        );
        assert_eq!(
            shift_calendar_day("2024-03-01", -1),
            Some(BoundValue::Finite("2024-02-29".into())) // 2024 is a leap year
        );
        assert_eq!(
            shift_calendar_day("2023-03-01", -1),
            Some(BoundValue::Finite("2023-02-28".into()))
        );
    }

    #[test]
    fn numeric_bound_compares_by_value_not_lexicographically() {
        let a = BoundValue::finite("9");
        let b = BoundValue::finite("10");
        assert_eq!(a.compare(&b, Domain::Integer), Ordering::Less);
        // Lexicographically "10" < "9", confirming the numeric path is exercised.
        assert_eq!(a.as_finite().unwrap().cmp(b.as_finite().unwrap()), Ordering::Greater);
    }

    #[test]
    fn infinities_bound_every_finite_value() {
        let neg = BoundValue::NegInfinity;
        let pos = BoundValue::PosInfinity;
        let mid = BoundValue::finite("2024-01-01");
        assert_eq!(neg.compare(&mid, Domain::Date), Ordering::Less);
        assert_eq!(pos.compare(&mid, Domain::Date), Ordering::Greater);
    }
}
