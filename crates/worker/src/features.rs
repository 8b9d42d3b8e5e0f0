//! Feature pipeline
//!
//! Pure functions turning raw time-series payloads into model-ready tensors
//! and back. Nothing here touches shared state: every function reads the
//! values passed to it and returns freshly allocated results.

use crate::model::Scaler;
use crate::tensor::Tensor;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use tidecast_common::{Result, ServeError};
use tracing::warn;

/// Column names tried in order when no index column is given
pub const TIMESTAMP_CANDIDATES: [&str; 4] = ["ts", "timestamp", "time", "date"];

/// Number of cyclical time encodings appended per row
pub const TIME_FEATURES: usize = 6;

/// A validated, timestamp-sorted, gap-filled time series
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    timestamps: Vec<DateTime<Utc>>,
    columns: BTreeMap<String, Vec<f64>>,
}

/// Sampling interval of a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timebase {
    /// Dominant (modal) spacing between consecutive rows
    pub interval: Duration,
    /// Last observed timestamp
    pub last: DateTime<Utc>,
    /// Whether every spacing equals the dominant one
    pub regular: bool,
}

impl Timebase {
    /// Timestamps of the next `steps` forecast rows
    ///
    /// Fails with [`ServeError::InvalidInput`] when a step lands outside
    /// the representable date range.
    pub fn forecast_timestamps(&self, steps: usize) -> Result<Vec<DateTime<Utc>>> {
        (1..=steps)
            .map(|step| {
                i32::try_from(step)
                    .ok()
                    .and_then(|i| self.interval.checked_mul(i))
                    .and_then(|offset| self.last.checked_add_signed(offset))
                    .ok_or_else(|| {
                        ServeError::invalid_input(format!(
                            "Forecast step {} at a {} ms interval after {} is out of range",
                            step,
                            self.interval.num_milliseconds(),
                            self.last.to_rfc3339()
                        ))
                    })
            })
            .collect()
    }
}

impl Frame {
    /// Build a frame from already parsed columns
    pub fn new(timestamps: Vec<DateTime<Utc>>, columns: BTreeMap<String, Vec<f64>>) -> Result<Self> {
        if let Some((name, col)) = columns.iter().find(|(_, c)| c.len() != timestamps.len()) {
            return Err(ServeError::invalid_input(format!(
                "Column '{}' has {} values but there are {} timestamps",
                name,
                col.len(),
                timestamps.len()
            )));
        }

        let mut order: Vec<usize> = (0..timestamps.len()).collect();
        order.sort_by_key(|&i| timestamps[i]);

        let timestamps = order.iter().map(|&i| timestamps[i]).collect();
        let mut sorted = BTreeMap::new();
        for (name, values) in columns {
            let mut values: Vec<f64> = order.iter().map(|&i| values[i]).collect();
            fill_missing(&name, &mut values)?;
            sorted.insert(name, values);
        }

        Ok(Self {
            timestamps,
            columns: sorted,
        })
    }

    /// Parse the JSON column map carried by a predict request or dataset object
    pub fn from_payload(data: &BTreeMap<String, Vec<Value>>, index_col: Option<&str>) -> Result<Self> {
        if data.is_empty() {
            return Err(ServeError::invalid_input("Payload has no columns"));
        }

        let index = match index_col {
            Some(name) => {
                if !data.contains_key(name) {
                    return Err(ServeError::invalid_input(format!(
                        "Index column '{}' not found",
                        name
                    )));
                }
                name
            }
            None => TIMESTAMP_CANDIDATES
                .iter()
                .copied()
                .find(|c| data.contains_key(*c))
                .ok_or_else(|| {
                    ServeError::invalid_input(format!(
                        "No timestamp column; expected one of {:?} or an index_col",
                        TIMESTAMP_CANDIDATES
                    ))
                })?,
        };

        let timestamps = data[index]
            .iter()
            .enumerate()
            .map(|(row, v)| {
                parse_timestamp(v).ok_or_else(|| {
                    ServeError::invalid_input(format!(
                        "Unparseable timestamp at row {} of '{}': {}",
                        row, index, v
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut columns = BTreeMap::new();
        for (name, raw) in data.iter().filter(|(name, _)| name.as_str() != index) {
            let values = raw
                .iter()
                .enumerate()
                .map(|(row, v)| {
                    parse_value(v).ok_or_else(|| {
                        ServeError::invalid_input(format!(
                            "Non-numeric value at row {} of '{}': {}",
                            row, name, v
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            columns.insert(name.clone(), values);
        }

        Self::new(timestamps, columns)
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Check if the frame has no rows
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Compute the dominant sampling interval
    ///
    /// Irregular spacing is tolerated with a warning; a zero dominant
    /// interval is rejected as [`ServeError::DegenerateTimebase`].
    pub fn timebase(&self) -> Result<Timebase> {
        let last = match self.timestamps.last() {
            Some(last) if self.timestamps.len() >= 2 => *last,
            _ => {
                return Err(ServeError::invalid_input(format!(
                    "At least two timestamps are required, got {}",
                    self.timestamps.len()
                )))
            }
        };

        let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
        for pair in self.timestamps.windows(2) {
            let diff = (pair[1] - pair[0]).num_milliseconds();
            *counts.entry(diff).or_insert(0) += 1;
        }

        // BTreeMap iterates ascending, so ties resolve to the smallest spacing
        let mut mode = (0i64, 0usize);
        for (&diff, &count) in &counts {
            if count > mode.1 {
                mode = (diff, count);
            }
        }

        if mode.0 == 0 {
            return Err(ServeError::degenerate_timebase(format!(
                "Dominant sampling interval is zero across {} timestamps",
                self.timestamps.len()
            )));
        }

        let regular = counts.len() == 1;
        if !regular {
            warn!(
                interval_ms = mode.0,
                distinct_intervals = counts.len(),
                "Irregular sampling; using dominant interval"
            );
        }

        Ok(Timebase {
            interval: Duration::milliseconds(mode.0),
            last,
            regular,
        })
    }
}

/// Forward-fill then back-fill missing values
fn fill_missing(name: &str, values: &mut [f64]) -> Result<()> {
    let first = values.iter().position(|v| v.is_finite()).ok_or_else(|| {
        ServeError::invalid_input(format!("Column '{}' has no valid values", name))
    })?;

    let mut last = values[first];
    for v in values.iter_mut() {
        if v.is_finite() {
            last = *v;
        } else {
            *v = last;
        }
    }
    Ok(())
}

fn parse_value(value: &Value) -> Option<f64> {
    match value {
        Value::Null => Some(f64::NAN),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => Some(f64::NAN),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Parse one timestamp cell
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let millis = (secs * 1000.0).round();
            if !millis.is_finite() {
                return None;
            }
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, format) {
            return Some(t.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|t| t.and_utc())
}

/// Cyclical encodings of one timestamp
///
/// Order: minute-of-day, day-of-week, day-of-year, each as (sin, cos).
pub fn time_features(ts: DateTime<Utc>) -> [f64; TIME_FEATURES] {
    let minute = (ts.hour() * 60 + ts.minute()) as f64 + ts.second() as f64 / 60.0;
    let dow = ts.weekday().num_days_from_monday() as f64;
    let doy = ts.ordinal0() as f64;

    let angles = [
        2.0 * PI * minute / 1440.0,
        2.0 * PI * dow / 7.0,
        2.0 * PI * doy / 365.25,
    ];
    [
        angles[0].sin(),
        angles[0].cos(),
        angles[1].sin(),
        angles[1].cos(),
        angles[2].sin(),
        angles[2].cos(),
    ]
}

/// Scale the last `window` rows of a frame into a `[window, width]` tensor
///
/// Columns follow the scaler's feature order; columns the scaler does not
/// name are ignored. With `with_time_features` each row also carries the
/// six cyclical encodings of its timestamp.
pub fn to_tensor(
    frame: &Frame,
    scaler: &Scaler,
    window: usize,
    with_time_features: bool,
) -> Result<Tensor<f64>> {
    if window == 0 {
        return Err(ServeError::invalid_input("Input window must be positive"));
    }
    if frame.len() < window {
        return Err(ServeError::invalid_input(format!(
            "Payload has {} rows but the model needs at least {}",
            frame.len(),
            window
        )));
    }

    let columns = scaler
        .feature_names()
        .iter()
        .map(|name| {
            frame.column(name).ok_or_else(|| {
                ServeError::invalid_input(format!("Missing feature column '{}'", name))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let start = frame.len() - window;
    let width = scaler.len() + if with_time_features { TIME_FEATURES } else { 0 };
    let mut data = Vec::with_capacity(window * width);
    for row in start..frame.len() {
        for (i, col) in columns.iter().enumerate() {
            data.push(scaler.transform(i, col[row]));
        }
        if with_time_features {
            data.extend_from_slice(&time_features(frame.timestamps[row]));
        }
    }

    Tensor::new(data, vec![window, width])
        .ok_or_else(|| ServeError::unhandled("Scaled window has inconsistent shape"))
}

/// Inverse-scale a `[steps, features]` tensor into named columns
pub fn from_tensor(tensor: &Tensor<f64>, scaler: &Scaler) -> Result<BTreeMap<String, Vec<f64>>> {
    if tensor.shape.len() != 2 || tensor.cols() != scaler.len() {
        return Err(ServeError::unhandled(format!(
            "Output shape {:?} does not match {} scaler features",
            tensor.shape,
            scaler.len()
        )));
    }

    let mut out: BTreeMap<String, Vec<f64>> = scaler
        .feature_names()
        .iter()
        .map(|name| (name.clone(), Vec::with_capacity(tensor.rows())))
        .collect();
    for row in tensor.iter_rows() {
        for (i, name) in scaler.feature_names().iter().enumerate() {
            if let Some(col) = out.get_mut(name) {
                col.push(scaler.inverse(i, row[i]));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{test_support, Scaler};
    use serde_json::json;

    fn payload(value: serde_json::Value) -> BTreeMap<String, Vec<Value>> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_from_payload_sorts_and_fills() {
        let data = payload(json!({
            "ts": ["2024-01-03", "2024-01-01", "2024-01-02", "2024-01-04"],
            "load": [3.0, null, "2.0", null],
        }));
        let frame = Frame::from_payload(&data, None).unwrap();

        assert_eq!(frame.len(), 4);
        assert_eq!(frame.column("load").unwrap(), &[2.0, 2.0, 3.0, 3.0]);
        assert!(frame.timestamps().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_from_payload_rejects_bad_columns() {
        let unequal = payload(json!({"ts": ["2024-01-01", "2024-01-02"], "load": [1.0]}));
        assert!(matches!(
            Frame::from_payload(&unequal, None),
            Err(ServeError::InvalidInput(_))
        ));

        let all_nan = payload(json!({"ts": ["2024-01-01", "2024-01-02"], "load": [null, null]}));
        assert!(matches!(
            Frame::from_payload(&all_nan, None),
            Err(ServeError::InvalidInput(_))
        ));

        let no_index = payload(json!({"load": [1.0, 2.0]}));
        assert!(Frame::from_payload(&no_index, None).is_err());
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        for v in [
            json!("2024-05-01T10:30:00Z"),
            json!("2024-05-01 10:30:00"),
            json!("2024-05-01T10:30:00"),
            json!(expected.timestamp()),
        ] {
            assert_eq!(parse_timestamp(&v), Some(expected), "{}", v);
        }
        assert!(parse_timestamp(&json!("yesterday")).is_none());
    }

    #[test]
    fn test_identical_timestamps_are_degenerate() {
        let data = payload(json!({
            "ts": ["2024-01-01 00:00:00", "2024-01-01 00:00:00", "2024-01-01 00:00:00"],
            "load": [1.0, 2.0, 3.0],
        }));
        let frame = Frame::from_payload(&data, None).unwrap();
        assert!(matches!(frame.timebase(), Err(ServeError::DegenerateTimebase(_))));
    }

    #[test]
    fn test_irregular_timebase_uses_mode() {
        let data = payload(json!({
            "time": ["2024-01-01 00:00:00", "2024-01-01 01:00:00", "2024-01-01 02:00:00", "2024-01-01 05:00:00"],
            "load": [1.0, 2.0, 3.0, 4.0],
        }));
        let frame = Frame::from_payload(&data, None).unwrap();
        let timebase = frame.timebase().unwrap();

        assert_eq!(timebase.interval, Duration::hours(1));
        assert!(!timebase.regular);
        let next = timebase.forecast_timestamps(2).unwrap();
        assert_eq!(next[0], Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap());
        assert_eq!(next[1], Utc.with_ymd_and_hms(2024, 1, 1, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_forecast_past_date_range_is_invalid_input() {
        let data = payload(json!({
            "ts": ["1800-01-01", "1900-01-01", "2000-01-01"],
            "load": [1.0, 2.0, 3.0],
        }));
        let timebase = Frame::from_payload(&data, None).unwrap().timebase().unwrap();

        assert_eq!(timebase.forecast_timestamps(3).unwrap().len(), 3);
        assert!(matches!(
            timebase.forecast_timestamps(10_000),
            Err(ServeError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_single_row_has_no_timebase() {
        let data = payload(json!({"ts": ["2024-01-01"], "load": [1.0]}));
        let frame = Frame::from_payload(&data, None).unwrap();
        assert!(matches!(frame.timebase(), Err(ServeError::InvalidInput(_))));
    }

    #[test]
    fn test_to_tensor_windowing_and_scaling() {
        let data = payload(json!({
            "ts": ["2024-01-01", "2024-01-02", "2024-01-03"],
            "load": [10.0, 20.0, 30.0],
            "ignored": [0.0, 0.0, 0.0],
        }));
        let frame = Frame::from_payload(&data, None).unwrap();
        let scaler = Scaler::new(test_support::scaler(&["load"], &[20.0], &[10.0])).unwrap();

        let tensor = to_tensor(&frame, &scaler, 2, false).unwrap();
        assert_eq!(tensor.shape, vec![2, 1]);
        assert_eq!(tensor.data, vec![0.0, 1.0]);

        let with_time = to_tensor(&frame, &scaler, 2, true).unwrap();
        assert_eq!(with_time.shape, vec![2, 1 + TIME_FEATURES]);

        let err = to_tensor(&frame, &scaler, 4, false).unwrap_err();
        assert!(matches!(err, ServeError::InvalidInput(_)));
    }

    #[test]
    fn test_missing_feature_column() {
        let data = payload(json!({"ts": ["2024-01-01", "2024-01-02"], "load": [1.0, 2.0]}));
        let frame = Frame::from_payload(&data, None).unwrap();
        let scaler = Scaler::new(test_support::scaler(&["temp"], &[0.0], &[1.0])).unwrap();
        assert!(to_tensor(&frame, &scaler, 2, false).is_err());
    }

    #[test]
    fn test_from_tensor_constant_feature_returns_mean() {
        let scaler = Scaler::new(test_support::scaler(
            &["load", "flag"],
            &[100.0, 7.5],
            &[10.0, 0.0],
        ))
        .unwrap();
        let tensor = Tensor::new(vec![1.0, 42.0, -2.0, f64::MAX], vec![2, 2]).unwrap();

        let out = from_tensor(&tensor, &scaler).unwrap();
        assert_eq!(out["load"], vec![110.0, 80.0]);
        assert_eq!(out["flag"], vec![7.5, 7.5]);
    }

    #[test]
    fn test_time_features_midnight_monday() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let f = time_features(ts);
        assert_eq!(f[0], 0.0);
        assert_eq!(f[1], 1.0);
        assert_eq!(f[2], 0.0);
        assert_eq!(f[4], 0.0);
    }
}
