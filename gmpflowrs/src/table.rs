//! Columnar result tables returned by a warehouse.

use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::error::{GmpflowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Number,
    Text,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Number(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Number(_) => Some(ValueKind::Number),
            Value::Text(_) => Some(ValueKind::Text),
            Value::Timestamp(_) => Some(ValueKind::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    fn approx_bytes(&self) -> usize {
        let inline = std::mem::size_of::<Value>();
        match self {
            Value::Text(s) => inline + s.len(),
            _ => inline,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
            Value::Timestamp(ts) if ts.time() == chrono::NaiveTime::MIN => {
                write!(f, "{}", ts.format("%Y-%m-%d"))
            }
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// A named, homogeneous column. Nulls are allowed in any column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Column {
    name: String,
    kind: Option<ValueKind>,
    values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Result<Self> {
        let name = name.into();
        let mut kind = None;
        for value in &values {
            match (kind, value.kind()) {
                (_, None) => {}
                (None, Some(k)) => kind = Some(k),
                (Some(expected), Some(k)) if expected != k => {
                    return Err(GmpflowError::Shape(format!(
                        "column {name} mixes {expected:?} and {k:?} values"
                    )));
                }
                _ => {}
            }
        }
        Ok(Self { name, kind, values })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` when every value is null.
    pub fn kind(&self) -> Option<ValueKind> {
        self.kind
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, row: usize) -> Option<&Value> {
        self.values.get(row)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Numeric view of the column; `None` if it holds non-numeric values.
    pub fn numbers(&self) -> Option<Vec<Option<f64>>> {
        match self.kind {
            Some(ValueKind::Number) | None => Some(self.values.iter().map(Value::as_f64).collect()),
            _ => None,
        }
    }
}

/// Ordered columns of equal length, as produced by one query execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultTable {
    columns: Vec<Column>,
    row_count: usize,
}

impl ResultTable {
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let row_count = columns.first().map_or(0, Column::len);
        if let Some(bad) = columns.iter().find(|c| c.len() != row_count) {
            return Err(GmpflowError::Shape(format!(
                "column {} has {} rows, expected {row_count}",
                bad.name,
                bad.len()
            )));
        }
        Ok(Self { columns, row_count })
    }

    /// Build from row-major data, e.g. rows decoded from a driver cursor.
    pub fn from_rows<S: AsRef<str>>(names: &[S], rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut buffers: Vec<Vec<Value>> = names
            .iter()
            .map(|_| Vec::with_capacity(rows.len()))
            .collect();
        for (idx, row) in rows.into_iter().enumerate() {
            if row.len() != names.len() {
                return Err(GmpflowError::Shape(format!(
                    "row {idx} has {} values, expected {}",
                    row.len(),
                    names.len()
                )));
            }
            for (buffer, value) in buffers.iter_mut().zip(row) {
                buffer.push(value);
            }
        }
        let columns = names
            .iter()
            .zip(buffers)
            .map(|(name, values)| Column::new(name.as_ref(), values))
            .collect::<Result<Vec<_>>>()?;
        Self::new(columns)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(Column::name)
    }

    /// Look up a column by exact name, falling back to an ASCII
    /// case-insensitive match (Snowflake upper-cases unquoted aliases).
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .or_else(|| self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Rough heap footprint, used to bound the result cache.
    pub fn approx_bytes(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.name.len() + c.values.iter().map(Value::approx_bytes).sum::<usize>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rows_builds_typed_columns() {
        let table = ResultTable::from_rows(
            &["source_chain", "txns"],
            vec![
                vec![Value::from("ethereum"), Value::from(12_i64)],
                vec![Value::from("osmosis"), Value::Null],
            ],
        )
        .unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.column("txns").unwrap().kind(), Some(ValueKind::Number));
        assert_eq!(
            table.column("txns").unwrap().numbers().unwrap(),
            vec![Some(12.0), None]
        );
    }

    #[test]
    fn mixed_columns_are_rejected() {
        let err = Column::new("v", vec![Value::from(1.0_f64), Value::from("x")]).unwrap_err();
        assert!(matches!(err, GmpflowError::Shape(_)));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = ResultTable::from_rows(&["a", "b"], vec![vec![Value::from(1.0_f64)]]).unwrap_err();
        assert!(matches!(err, GmpflowError::Shape(_)));
    }

    #[test]
    fn column_lookup_falls_back_to_case_insensitive() {
        let table =
            ResultTable::from_rows(&["UNIQUE_USERS"], vec![vec![Value::from(40_i64)]]).unwrap();
        assert!(table.column("unique_users").is_some());
        assert!(table.column("users").is_none());
    }

    #[test]
    fn display_formats_integral_numbers_without_fraction() {
        assert_eq!(Value::from(7.0_f64).to_string(), "7");
        assert_eq!(Value::from(2.5_f64).to_string(), "2.5");
    }
}
