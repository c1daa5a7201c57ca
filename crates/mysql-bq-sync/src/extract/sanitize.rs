//! Per-chunk value cleanup before rows leave the extractor.

use chrono::Duration;

use crate::core::{Chunk, SqlValue};

/// Text spellings that mean "no value".
pub const NULL_SENTINELS: &[&str] = &["", "null", "NULL", "nan", "None"];

/// Clean every cell of a chunk in place.
pub fn sanitize_chunk(chunk: &mut Chunk) {
    for row in &mut chunk.rows {
        for cell in row.iter_mut() {
            let value = std::mem::replace(cell, SqlValue::Null);
            *cell = sanitize_value(value);
        }
    }
}

/// Clean one value.
///
/// Intervals become `HH:MM:SS[.ffffff]` on a 24-hour clock, null bytes are
/// stripped from text, null sentinels and NaN become `Null`.
pub fn sanitize_value(value: SqlValue) -> SqlValue {
    match value {
        SqlValue::Interval(d) => SqlValue::Text(format_interval(d)),
        SqlValue::Text(s) => {
            let s = if s.contains('\0') { s.replace('\0', "") } else { s };
            if NULL_SENTINELS.contains(&s.as_str()) {
                SqlValue::Null
            } else {
                SqlValue::Text(s)
            }
        }
        SqlValue::Float(f) if f.is_nan() => SqlValue::Null,
        other => other,
    }
}

/// Render a duration as a time of day, wrapping whole days away.
pub fn format_interval(d: Duration) -> String {
    const DAY_MICROS: i64 = 86_400_000_000;
    let micros = d
        .num_microseconds()
        .unwrap_or_else(|| d.num_milliseconds().saturating_mul(1_000))
        .rem_euclid(DAY_MICROS);
    let secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    let base = format!("{:02}:{:02}:{:02}", secs / 3_600, (secs / 60) % 60, secs % 60);
    if frac == 0 {
        base
    } else {
        format!("{}.{:06}", base, frac)
    }
}
