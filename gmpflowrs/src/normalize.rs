//! Reshape raw result tables into the views the presentation layer consumes.
//!
//! Normalization never mutates the input table; every view owns a derived copy.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::error::{GmpflowError, Result};
use crate::table::{Column, ResultTable, Value, ValueKind};

/// Fill value for absent pivot cells.
pub const PIVOT_FILL: f64 = 0.0;

/// Result shape a template declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultShape {
    /// Exactly one row of named aggregates (KPI tiles).
    ScalarRow,
    /// Time-indexed rows, ascending by `time_column` as returned by the warehouse.
    Series { time_column: String },
    /// Categorical rows destined for a pivot or breakdown.
    PivotSource {
        dimensions: Vec<String>,
        measures: Vec<String>,
    },
}

impl ResultShape {
    /// Columns the shape requires the result to carry.
    pub fn required_columns(&self) -> Vec<&str> {
        match self {
            ResultShape::ScalarRow => Vec::new(),
            ResultShape::Series { time_column } => vec![time_column.as_str()],
            ResultShape::PivotSource {
                dimensions,
                measures,
            } => dimensions
                .iter()
                .chain(measures.iter())
                .map(String::as_str)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum NormalizedView {
    Scalar(ScalarRow),
    Series(SeriesView),
    Pivot(PivotSource),
}

impl NormalizedView {
    pub fn as_scalar(&self) -> Option<&ScalarRow> {
        match self {
            NormalizedView::Scalar(row) => Some(row),
            _ => None,
        }
    }

    pub fn as_series(&self) -> Option<&SeriesView> {
        match self {
            NormalizedView::Series(series) => Some(series),
            _ => None,
        }
    }

    pub fn as_pivot(&self) -> Option<&PivotSource> {
        match self {
            NormalizedView::Pivot(source) => Some(source),
            _ => None,
        }
    }
}

pub fn normalize(raw: &ResultTable, shape: &ResultShape) -> Result<NormalizedView> {
    let missing: Vec<&str> = shape
        .required_columns()
        .into_iter()
        .filter(|name| raw.column(name).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(GmpflowError::Shape(format!(
            "result is missing columns {} (have: {})",
            missing.join(", "),
            raw.column_names().collect::<Vec<_>>().join(", ")
        )));
    }

    match shape {
        ResultShape::ScalarRow => ScalarRow::from_table(raw).map(NormalizedView::Scalar),
        ResultShape::Series { time_column } => {
            SeriesView::from_table(raw, time_column).map(NormalizedView::Series)
        }
        ResultShape::PivotSource {
            dimensions,
            measures,
        } => PivotSource::from_table(raw, dimensions, measures).map(NormalizedView::Pivot),
    }
}

fn require_column<'a>(raw: &'a ResultTable, name: &str) -> Result<&'a Column> {
    raw.column(name).ok_or_else(|| {
        GmpflowError::Shape(format!(
            "result is missing column {name} (have: {})",
            raw.column_names().collect::<Vec<_>>().join(", ")
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalarRow {
    values: Vec<(String, Value)>,
}

impl ScalarRow {
    fn from_table(raw: &ResultTable) -> Result<Self> {
        match raw.row_count() {
            0 => Err(GmpflowError::EmptyResult(
                "no rows for the selected range".to_string(),
            )),
            1 => Ok(Self {
                values: raw
                    .columns()
                    .iter()
                    .map(|c| (c.name().to_string(), c.values()[0].clone()))
                    .collect(),
            }),
            n => Err(GmpflowError::Shape(format!(
                "scalar result expected one row, got {n}"
            ))),
        }
    }

    /// Same lookup rules as [`ResultTable::column`].
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(k, _)| k == name)
            .or_else(|| self.values.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)))
            .map(|(_, v)| v)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesView {
    time_column: String,
    times: Vec<NaiveDateTime>,
    columns: Vec<Column>,
}

impl SeriesView {
    fn from_table(raw: &ResultTable, time_column: &str) -> Result<Self> {
        let time = require_column(raw, time_column)?;
        let times = time
            .values()
            .iter()
            .enumerate()
            .map(|(row, value)| {
                value.as_timestamp().ok_or_else(|| {
                    GmpflowError::Shape(format!(
                        "time column {time_column} row {row} is {value:?}, expected a timestamp"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            time_column: time.name().to_string(),
            times,
            columns: raw.columns().to_vec(),
        })
    }

    pub fn time_column(&self) -> &str {
        &self.time_column
    }

    /// Bucket timestamps in warehouse order.
    pub fn times(&self) -> &[NaiveDateTime] {
        &self.times
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name() == name)
            .or_else(|| self.columns.iter().find(|c| c.name().eq_ignore_ascii_case(name)))
    }

    pub fn numbers(&self, name: &str) -> Option<Vec<Option<f64>>> {
        self.column(name).and_then(Column::numbers)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(Column::name)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotSource {
    dimensions: Vec<String>,
    measures: Vec<String>,
    table: ResultTable,
}

impl PivotSource {
    fn from_table(raw: &ResultTable, dimensions: &[String], measures: &[String]) -> Result<Self> {
        for name in dimensions {
            require_column(raw, name)?;
        }
        for name in measures {
            let column = require_column(raw, name)?;
            if !matches!(column.kind(), Some(ValueKind::Number) | None) {
                return Err(GmpflowError::Shape(format!("measure {name} is not numeric")));
            }
        }
        Ok(Self {
            dimensions: dimensions.to_vec(),
            measures: measures.to_vec(),
            table: raw.clone(),
        })
    }

    pub fn dimensions(&self) -> &[String] {
        &self.dimensions
    }

    pub fn measures(&self) -> &[String] {
        &self.measures
    }

    /// The categorical rows as returned, for tabular panels.
    pub fn table(&self) -> &ResultTable {
        &self.table
    }

    pub fn pivot(&self, row_dim: &str, col_dim: &str, measure: &str) -> Result<PivotGrid> {
        self.pivot_with_fill(row_dim, col_dim, measure, PIVOT_FILL)
    }

    /// Reshape into a sparse `row_dim x col_dim` grid of `measure`.
    ///
    /// Keys keep first-appearance order. Null measures are treated as absent
    /// and duplicate `(row, col)` pairs are summed.
    pub fn pivot_with_fill(
        &self,
        row_dim: &str,
        col_dim: &str,
        measure: &str,
        fill: f64,
    ) -> Result<PivotGrid> {
        let rows = require_column(&self.table, row_dim)?;
        let cols = require_column(&self.table, col_dim)?;
        let values = self.measure_values(measure)?;

        let mut row_keys = KeyIndex::default();
        let mut col_keys = KeyIndex::default();
        let mut cells = BTreeMap::new();
        for ((row, col), value) in rows.values().iter().zip(cols.values()).zip(values) {
            let r = row_keys.index_of(row);
            let c = col_keys.index_of(col);
            if let Some(v) = value {
                *cells.entry((r, c)).or_insert(0.0) += v;
            }
        }

        Ok(PivotGrid {
            row_dim: row_dim.to_string(),
            col_dim: col_dim.to_string(),
            measure: measure.to_string(),
            row_keys: row_keys.keys,
            col_keys: col_keys.keys,
            cells,
            fill,
        })
    }

    /// Sum `measure` per value of `dim`, in first-appearance order (pie charts).
    pub fn totals_by(&self, dim: &str, measure: &str) -> Result<Vec<(String, f64)>> {
        let keys = require_column(&self.table, dim)?;
        let values = self.measure_values(measure)?;
        let mut index = KeyIndex::default();
        let mut totals: Vec<f64> = Vec::new();
        for (key, value) in keys.values().iter().zip(values) {
            let idx = index.index_of(key);
            if idx == totals.len() {
                totals.push(0.0);
            }
            totals[idx] += value.unwrap_or(0.0);
        }
        Ok(index.keys.into_iter().zip(totals).collect())
    }

    fn measure_values(&self, measure: &str) -> Result<Vec<Option<f64>>> {
        require_column(&self.table, measure)?
            .numbers()
            .ok_or_else(|| GmpflowError::Shape(format!("measure {measure} is not numeric")))
    }
}

#[derive(Default)]
struct KeyIndex {
    keys: Vec<String>,
    positions: HashMap<String, usize>,
}

impl KeyIndex {
    fn index_of(&mut self, value: &Value) -> usize {
        let key = value.to_string();
        if let Some(&idx) = self.positions.get(&key) {
            return idx;
        }
        let idx = self.keys.len();
        self.keys.push(key.clone());
        self.positions.insert(key, idx);
        idx
    }
}

/// Sparse 2D grid; absent cells read as the fill value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotGrid {
    row_dim: String,
    col_dim: String,
    measure: String,
    row_keys: Vec<String>,
    col_keys: Vec<String>,
    #[serde(with = "sparse_cells")]
    cells: BTreeMap<(usize, usize), f64>,
    fill: f64,
}

/// Present cells as `[row, col, value]` triples; JSON maps cannot key on tuples.
mod sparse_cells {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        cells: &BTreeMap<(usize, usize), f64>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let triples: Vec<(usize, usize, f64)> =
            cells.iter().map(|(&(r, c), &v)| (r, c, v)).collect();
        triples.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<(usize, usize), f64>, D::Error> {
        let triples = Vec::<(usize, usize, f64)>::deserialize(deserializer)?;
        Ok(triples.into_iter().map(|(r, c, v)| ((r, c), v)).collect())
    }
}

impl PivotGrid {
    pub fn row_keys(&self) -> &[String] {
        &self.row_keys
    }

    pub fn col_keys(&self) -> &[String] {
        &self.col_keys
    }

    pub fn fill(&self) -> f64 {
        self.fill
    }

    /// Cell by key labels. `None` only when a key is not a known row or column.
    pub fn get(&self, row_key: &str, col_key: &str) -> Option<f64> {
        let r = self.row_keys.iter().position(|k| k == row_key)?;
        let c = self.col_keys.iter().position(|k| k == col_key)?;
        Some(self.value_at(r, c))
    }

    pub fn value_at(&self, row: usize, col: usize) -> f64 {
        self.cells.get(&(row, col)).copied().unwrap_or(self.fill)
    }

    /// Whether the cell was present in the source rows.
    pub fn is_present(&self, row: usize, col: usize) -> bool {
        self.cells.contains_key(&(row, col))
    }

    pub fn present_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        (0..self.row_keys.len())
            .map(|r| (0..self.col_keys.len()).map(|c| self.value_at(r, c)).collect())
            .collect()
    }
}
