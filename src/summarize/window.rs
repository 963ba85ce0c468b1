use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};

/// Parses a compact duration such as `2d`, `20m`, `1d2h3m4s` or `1.5h`.
///
/// Units must appear in `d`, `h`, `m`, `s` order, each at most once, and
/// at least one must be present.
pub fn parse_timedelta(value: &str) -> Result<Duration> {
    const UNITS: [(char, f64); 4] = [('d', 86_400.0), ('h', 3_600.0), ('m', 60.0), ('s', 1.0)];

    let mut rest = value.trim();
    if rest.is_empty() {
        bail!("empty duration");
    }

    let mut seconds = 0.0;
    let mut next_unit = 0;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .with_context(|| format!("duration {value:?} has a number without a unit"))?;
        if digits == 0 || !rest.starts_with(|c: char| c.is_ascii_digit()) {
            bail!("invalid duration {value:?}");
        }

        let number: f64 = rest[..digits]
            .parse()
            .with_context(|| format!("invalid number in duration {value:?}"))?;

        let unit = rest[digits..].chars().next().unwrap_or_default();
        let Some(pos) = UNITS[next_unit..].iter().position(|(u, _)| *u == unit) else {
            bail!("invalid or out-of-order unit {unit:?} in duration {value:?}");
        };

        seconds += number * UNITS[next_unit + pos].1;
        next_unit += pos + 1;
        rest = &rest[digits + unit.len_utf8()..];
    }

    Duration::try_milliseconds((seconds * 1000.0).round() as i64)
        .with_context(|| format!("duration {value:?} out of range"))
}

/// Resolves a window bound: a duration back from `now`, or an RFC 3339 timestamp.
pub fn parse_instant(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(delta) = parse_timedelta(value) {
        return now
            .checked_sub_signed(delta)
            .with_context(|| format!("{value:?} reaches before the earliest representable time"));
    }

    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("{value:?} is neither a duration nor an RFC 3339 timestamp"))
}

/// Floors `dt` to a multiple of `interval` since the Unix epoch.
pub fn snap_to_interval(dt: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = interval.num_milliseconds();
    if step <= 0 {
        return dt;
    }
    let ms = dt.timestamp_millis();
    DateTime::from_timestamp_millis(ms - ms.rem_euclid(step)).unwrap_or(dt)
}

/// A resolved aggregation range `[after, before)` and its bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SummaryWindow {
    pub after: DateTime<Utc>,
    pub before: DateTime<Utc>,
    pub interval: Duration,
}

impl SummaryWindow {
    /// Resolves `after`/`before`/`interval` strings against `now`.
    ///
    /// `after` is always snapped down to the interval. `before` is snapped
    /// only when it lies more than one interval in the past, so the last
    /// bucket is not cut short while it is still filling.
    pub fn resolve(after: &str, before: &str, interval: &str, now: DateTime<Utc>) -> Result<Self> {
        let interval = parse_timedelta(interval)
            .with_context(|| format!("parsing interval {interval:?}"))?;
        if interval <= Duration::zero() {
            bail!("interval must be positive");
        }

        let after = snap_to_interval(
            parse_instant(after, now).context("parsing after")?,
            interval,
        );

        let before = parse_instant(before, now).context("parsing before")?;
        let before = if now - before > interval {
            snap_to_interval(before, interval)
        } else {
            before
        };

        if before <= after {
            bail!("before ({before}) must be later than after ({after})");
        }

        Ok(Self {
            after,
            before,
            interval,
        })
    }
}
