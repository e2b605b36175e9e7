use postgres_types::{FromSql, ToSql};
use scheduler_core::error::{StoreError, StoreResult};
use std::fmt::Display;
use std::str::FromStr;
use tokio_postgres::Row;

/// Positional parameters collected while building a dynamic statement.
#[derive(Default)]
pub(crate) struct Params {
    values: Vec<Box<dyn ToSql + Sync + Send>>,
}

impl Params {
    /// Add a value and return its placeholder.
    pub fn push<T: ToSql + Sync + Send + 'static>(&mut self, value: T) -> String {
        self.values.push(Box::new(value));
        format!("${}", self.values.len())
    }

    pub fn refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|v| v.as_ref() as &(dyn ToSql + Sync))
            .collect()
    }
}

/// `WHERE` clause from a list of conditions; empty when there are none.
pub(crate) fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    }
}

pub(crate) fn page_clause(limit: Option<usize>, offset: usize, params: &mut Params) -> String {
    let mut clause = String::new();
    if let Some(limit) = limit {
        clause.push_str(&format!(" LIMIT {}", params.push(limit as i64)));
    }
    if offset > 0 {
        clause.push_str(&format!(" OFFSET {}", params.push(offset as i64)));
    }
    clause
}

pub(crate) fn get<'a, T: FromSql<'a>>(row: &'a Row, column: &str) -> StoreResult<T> {
    row.try_get(column)
        .map_err(|e| StoreError::Database(format!("Failed to read {}: {}", column, e)))
}

/// Read a text column holding a wire-format enum.
pub(crate) fn get_parsed<T>(row: &Row, column: &str) -> StoreResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: String = get(row, column)?;
    raw.parse()
        .map_err(|e| StoreError::Serialization(format!("{}: {}", column, e)))
}

pub(crate) fn get_parsed_opt<T>(row: &Row, column: &str) -> StoreResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let raw: Option<String> = get(row, column)?;
    raw.map(|r| {
        r.parse()
            .map_err(|e| StoreError::Serialization(format!("{}: {}", column, e)))
    })
    .transpose()
}

pub(crate) fn strings<T: Display>(values: &[T]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
