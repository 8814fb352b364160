//! Panel parameters: the raw map supplied by the presentation layer and the
//! validated, canonical form that keys the result cache.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{GmpflowError, Result};

pub const START_DATE: &str = "start_date";
pub const END_DATE: &str = "end_date";
pub const BUCKET: &str = "bucket";

/// Time-truncation granularity applied to series panels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Day,
    Week,
    Month,
}

impl TimeBucket {
    pub const ALL: [TimeBucket; 3] = [TimeBucket::Day, TimeBucket::Week, TimeBucket::Month];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBucket::Day => "day",
            TimeBucket::Week => "week",
            TimeBucket::Month => "month",
        }
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeBucket {
    type Err = GmpflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "day" => Ok(TimeBucket::Day),
            "week" => Ok(TimeBucket::Week),
            "month" => Ok(TimeBucket::Month),
            other => Err(GmpflowError::invalid_param(
                BUCKET,
                format!("{other:?} is not one of day, week, month"),
            )),
        }
    }
}

/// Declared kind of a template parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Date,
    Bucket,
    #[serde(rename = "string")]
    Text,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Date => f.write_str("date"),
            ParamKind::Bucket => f.write_str("bucket"),
            ParamKind::Text => f.write_str("string"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Date(NaiveDate),
    Bucket(TimeBucket),
    Text(String),
}

impl ParamValue {
    /// Coerce into the declared kind. Text input is parsed; other mismatches are rejected.
    pub(crate) fn coerce(self, name: &str, kind: ParamKind) -> Result<ParamValue> {
        match (kind, self) {
            (ParamKind::Date, ParamValue::Date(d)) => Ok(ParamValue::Date(d)),
            (ParamKind::Date, ParamValue::Text(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(ParamValue::Date)
                .map_err(|e| {
                    GmpflowError::invalid_param(name, format!("{s:?} is not a YYYY-MM-DD date: {e}"))
                }),
            (ParamKind::Bucket, ParamValue::Bucket(b)) => Ok(ParamValue::Bucket(b)),
            (ParamKind::Bucket, ParamValue::Text(s)) => s
                .parse::<TimeBucket>()
                .map(ParamValue::Bucket)
                .map_err(|e| match e {
                    GmpflowError::InvalidParameter { reason, .. } => {
                        GmpflowError::invalid_param(name, reason)
                    }
                    other => other,
                }),
            (ParamKind::Text, ParamValue::Text(s)) => Ok(ParamValue::Text(s)),
            (kind, other) => Err(GmpflowError::invalid_param(
                name,
                format!("expected a {kind} value, got {other}"),
            )),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            ParamValue::Bucket(b) => write!(f, "{b}"),
            ParamValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<NaiveDate> for ParamValue {
    fn from(value: NaiveDate) -> Self {
        ParamValue::Date(value)
    }
}

impl From<TimeBucket> for ParamValue {
    fn from(value: TimeBucket) -> Self {
        ParamValue::Bucket(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

/// Parameters as collected from user input (date pickers, bucket selector).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryParams {
    values: BTreeMap<String, ParamValue>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard dashboard parameter set.
    pub fn range(start_date: NaiveDate, end_date: NaiveDate, bucket: TimeBucket) -> Self {
        Self::new()
            .with(START_DATE, start_date)
            .with(END_DATE, end_date)
            .with(BUCKET, bucket)
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<ParamValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Validated parameters, typed per the template schema and ordered by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CanonicalParams {
    values: BTreeMap<String, ParamValue>,
}

impl CanonicalParams {
    pub(crate) fn from_validated(values: BTreeMap<String, ParamValue>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn date(&self, name: &str) -> Option<NaiveDate> {
        match self.values.get(name) {
            Some(ParamValue::Date(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn bucket(&self) -> Option<TimeBucket> {
        match self.values.get(BUCKET) {
            Some(ParamValue::Bucket(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }
}

impl fmt::Display for CanonicalParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (name, value)) in self.values.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}
