//! The result surface handed back to callers.

use uuid::Uuid;

use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::response::result::{self, ColumnSpec, Row};
use crate::frame::value::CqlValue;

/// The outcome of an executed statement.
///
/// A row query carries rows and column specs; `USE`, DDL and writes
/// carry none. Rows are ordered sequences of typed cells, addressable by
/// index or, through [`QueryResult::column_index`], by column name.
#[derive(Debug, Default)]
pub struct QueryResult {
    rows: Option<Vec<Row>>,
    col_specs: Vec<ColumnSpec>,
    set_keyspace: Option<String>,
    schema_change: Option<SchemaChangeEvent>,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
}

impl QueryResult {
    pub(crate) fn from_result(
        result: result::Result,
        warnings: Vec<String>,
        tracing_id: Option<Uuid>,
    ) -> Self {
        let mut query_result = QueryResult {
            tracing_id,
            warnings,
            ..Default::default()
        };
        match result {
            result::Result::Void => {}
            result::Result::Rows(rows) => {
                query_result.col_specs = rows.metadata.col_specs;
                query_result.rows = Some(rows.rows);
            }
            result::Result::SetKeyspace(set_keyspace) => {
                query_result.set_keyspace = Some(set_keyspace.keyspace_name);
            }
            result::Result::Prepared(_) => {
                // PREPARE goes through Session::prepare; a Prepared result
                // to a plain statement is surfaced as an empty result.
            }
            result::Result::SchemaChange(schema_change) => {
                query_result.schema_change = Some(schema_change.event);
            }
        }
        query_result
    }

    /// The rows of a row query; `None` for non-row results.
    pub fn rows(&self) -> Option<&[Row]> {
        self.rows.as_deref()
    }

    pub fn rows_num(&self) -> usize {
        self.rows.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn first_row(&self) -> Option<&Row> {
        self.rows.as_ref().and_then(|rows| rows.first())
    }

    pub fn col_specs(&self) -> &[ColumnSpec] {
        &self.col_specs
    }

    /// Index of the column with this name in the result metadata.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.col_specs.iter().position(|spec| spec.name == name)
    }

    /// Cell of `row` in the column named `name`; `None` when the column
    /// does not exist or the row is out of range, `Some(None)` for a
    /// database null.
    pub fn cell(&self, row: usize, name: &str) -> Option<&Option<CqlValue>> {
        let index = self.column_index(name)?;
        self.rows.as_ref()?.get(row)?.columns.get(index)
    }

    /// Keyspace name of a `USE` statement's result.
    pub fn set_keyspace(&self) -> Option<&str> {
        self.set_keyspace.as_deref()
    }

    pub fn schema_change(&self) -> Option<&SchemaChangeEvent> {
        self.schema_change.as_ref()
    }

    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}
