//! JSON rendering for structured log records.
//!
//! Log writers hand over typed values; this module turns them into one
//! JSON object per record. Non-finite numbers render as `null` so records
//! stay parseable downstream.
use chrono::DateTime;
use serde_json::{Map, Number, Value};

/// Shown when a time value cannot be converted; deliberately conspicuous.
const FALLBACK_TIMESTAMP: &str = "2000-01-01T00:00:00.000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFormat {
    /// `2020-09-13T12:26:40.250000Z`
    Iso8601,
    /// Seconds since the epoch, fractional.
    Epoch,
    /// Integer milliseconds since the epoch.
    Millis,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    Bool(bool),
    Int(i64),
    Count(u64),
    Double(f64),
    /// Seconds of duration.
    Interval(f64),
    /// Seconds since the epoch; rendered per the configured [`TimeFormat`].
    Time(f64),
    Str(String),
    Vector(Vec<LogValue>),
    Set(Vec<LogValue>),
}

pub struct JsonFormatter {
    timestamps: TimeFormat,
}

impl JsonFormatter {
    pub fn new(timestamps: TimeFormat) -> Self {
        Self { timestamps }
    }

    /// Renders one record. Unset fields are skipped entirely rather than
    /// emitted as nulls.
    pub fn describe(&self, fields: &[(&str, Option<LogValue>)]) -> String {
        let mut record = Map::new();
        for (name, value) in fields {
            if let Some(value) = value {
                record.insert((*name).to_string(), self.build(value));
            }
        }
        Value::Object(record).to_string()
    }

    fn build(&self, value: &LogValue) -> Value {
        match value {
            LogValue::Bool(b) => Value::Bool(*b),
            LogValue::Int(i) => Value::Number((*i).into()),
            LogValue::Count(c) => Value::Number((*c).into()),
            LogValue::Double(d) | LogValue::Interval(d) => double_value(*d),
            LogValue::Time(t) => self.build_time(*t),
            LogValue::Str(s) => Value::String(s.clone()),
            LogValue::Vector(items) | LogValue::Set(items) => {
                Value::Array(items.iter().map(|item| self.build(item)).collect())
            }
        }
    }

    fn build_time(&self, t: f64) -> Value {
        match self.timestamps {
            TimeFormat::Iso8601 => Value::String(render_iso8601(t)),
            TimeFormat::Epoch => double_value(t),
            TimeFormat::Millis => {
                if t.is_finite() {
                    Value::Number(((t * 1000.0) as u64).into())
                } else {
                    Value::Null
                }
            }
        }
    }
}

fn double_value(d: f64) -> Value {
    Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null)
}

fn render_iso8601(t: f64) -> String {
    if !t.is_finite() {
        return FALLBACK_TIMESTAMP.to_string();
    }

    let secs = t.floor();
    let mut frac = t - secs;
    if frac < 0.0 {
        frac += 1.0;
    }

    match DateTime::from_timestamp(secs as i64, 0) {
        Some(dt) => format!(
            "{}.{:06}Z",
            dt.format("%Y-%m-%dT%H:%M:%S"),
            (frac * 1e6).round() as u32
        ),
        None => FALLBACK_TIMESTAMP.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_flat_record() {
        let formatter = JsonFormatter::new(TimeFormat::Epoch);
        let line = formatter.describe(&[
            ("alive", Some(LogValue::Bool(true))),
            ("count", Some(LogValue::Count(3))),
            ("name", Some(LogValue::Str("eth0".to_string()))),
        ]);
        assert_eq!(line, r#"{"alive":true,"count":3,"name":"eth0"}"#);
    }

    #[test]
    fn unset_fields_are_skipped() {
        let formatter = JsonFormatter::new(TimeFormat::Epoch);
        let line = formatter.describe(&[
            ("present", Some(LogValue::Int(-4))),
            ("absent", None),
        ]);
        assert_eq!(line, r#"{"present":-4}"#);
    }

    #[test]
    fn non_finite_doubles_render_as_null() {
        let formatter = JsonFormatter::new(TimeFormat::Epoch);
        let line = formatter.describe(&[
            ("nan", Some(LogValue::Double(f64::NAN))),
            ("inf", Some(LogValue::Interval(f64::INFINITY))),
        ]);
        assert_eq!(line, r#"{"nan":null,"inf":null}"#);
    }

    #[test]
    fn iso8601_timestamps_carry_microseconds() {
        let formatter = JsonFormatter::new(TimeFormat::Iso8601);
        let line = formatter.describe(&[("ts", Some(LogValue::Time(1_600_000_000.25)))]);
        assert_eq!(line, r#"{"ts":"2020-09-13T12:26:40.250000Z"}"#);
    }

    #[test]
    fn millis_timestamps_are_integers() {
        let formatter = JsonFormatter::new(TimeFormat::Millis);
        let line = formatter.describe(&[("ts", Some(LogValue::Time(1.5)))]);
        assert_eq!(line, r#"{"ts":1500}"#);
    }

    #[test]
    fn nested_vectors_become_arrays() {
        let formatter = JsonFormatter::new(TimeFormat::Epoch);
        let line = formatter.describe(&[(
            "hosts",
            Some(LogValue::Set(vec![
                LogValue::Str("10.0.0.1".to_string()),
                LogValue::Str("10.0.0.2".to_string()),
            ])),
        )]);
        assert_eq!(line, r#"{"hosts":["10.0.0.1","10.0.0.2"]}"#);
    }
}
