//! Dynamic tabular container the validators operate on
//!
//! A [`DataTable`] is a row-major table with named columns and dynamically
//! typed cells. Column names are part of the table's identity; duplicate
//! names are rejected at construction. Validators read columns through
//! [`ColumnView`], which yields ascending row indices so the per-issue
//! ordering contract holds without extra sorting.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A single table cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view: integers widen to f64, text parses if it looks numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "string",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str(""),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl TryFrom<&serde_json::Value> for Value {
    type Error = Error;

    fn try_from(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(Error::InvalidInput(format!("Unrepresentable number: {n}")))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Text(s.clone())),
            other => Err(Error::InvalidInput(format!(
                "Nested values are not valid table cells: {other}"
            ))),
        }
    }
}

/// Row-major table with named columns.
#[derive(Debug, Clone, Default)]
pub struct DataTable {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<Value>>,
}

impl DataTable {
    /// Create an empty table with the given column names.
    ///
    /// Duplicate column names are rejected; the table's identity includes
    /// its column set.
    pub fn new<I, S>(columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let mut index = HashMap::with_capacity(columns.len());
        for (pos, name) in columns.iter().enumerate() {
            if index.insert(name.clone(), pos).is_some() {
                return Err(Error::InvalidInput(format!(
                    "Duplicate column name: {name}"
                )));
            }
        }
        Ok(Self {
            columns,
            index,
            rows: Vec::new(),
        })
    }

    /// Create a table from column names and row data.
    pub fn from_rows<I, S>(columns: I, rows: Vec<Vec<Value>>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::new(columns)?;
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Build a table from JSON records (one object per row).
    ///
    /// Columns are the union of all record keys in first-seen order; fields
    /// missing from a record become `Null`.
    pub fn from_json_records(records: &[serde_json::Value]) -> Result<Self> {
        let mut columns: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for record in records {
            let object = record.as_object().ok_or_else(|| {
                Error::InvalidInput("Each record must be a JSON object".to_string())
            })?;
            for key in object.keys() {
                if !index.contains_key(key) {
                    index.insert(key.clone(), columns.len());
                    columns.push(key.clone());
                }
            }
        }

        let mut table = Self::new(columns)?;
        for record in records {
            let object = record.as_object().expect("validated above");
            let mut row = vec![Value::Null; table.columns.len()];
            for (key, value) in object {
                let pos = table.index[key];
                row[pos] = Value::try_from(value)?;
            }
            table.rows.push(row);
        }
        Ok(table)
    }

    /// Append a row. The row arity must match the column count.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(Error::InvalidInput(format!(
                "Row has {} values, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<ColumnView<'_>> {
        self.index.get(name).map(|&pos| ColumnView { table: self, pos })
    }

    pub fn row(&self, idx: usize) -> Option<&[Value]> {
        self.rows.get(idx).map(|r| r.as_slice())
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let pos = *self.index.get(column)?;
        self.rows.get(row).map(|r| &r[pos])
    }
}

/// Read-only view of one column, iterating rows in ascending index order.
#[derive(Clone, Copy)]
pub struct ColumnView<'a> {
    table: &'a DataTable,
    pos: usize,
}

impl<'a> ColumnView<'a> {
    pub fn name(&self) -> &'a str {
        &self.table.columns[self.pos]
    }

    pub fn len(&self) -> usize {
        self.table.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a Value> + 'a {
        let pos = self.pos;
        self.table.rows.iter().map(move |row| &row[pos])
    }

    /// `(row_index, value)` pairs, ascending.
    pub fn indexed(&self) -> impl Iterator<Item = (usize, &'a Value)> + 'a {
        self.iter().enumerate()
    }

    /// Non-null text cells as `(row_index, &str)`, ascending.
    pub fn strings(&self) -> impl Iterator<Item = (usize, &'a str)> + 'a {
        self.indexed()
            .filter_map(|(idx, value)| value.as_str().map(|s| (idx, s)))
    }

    /// Row indices matching a predicate, ascending.
    pub fn rows_where<P>(&self, pred: P) -> Vec<usize>
    where
        P: Fn(&Value) -> bool,
    {
        self.indexed()
            .filter(|(_, value)| pred(value))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn null_rows(&self) -> Vec<usize> {
        self.rows_where(|v| v.is_null())
    }

    pub fn null_fraction(&self) -> f64 {
        if self.table.rows.is_empty() {
            return 0.0;
        }
        let nulls = self.iter().filter(|v| v.is_null()).count();
        nulls as f64 / self.table.rows.len() as f64
    }
}

// ============================================================================
// Tests
// ============================================================================
