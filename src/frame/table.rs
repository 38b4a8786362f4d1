use crate::db::{RawValue, ResultSet};

use super::identifier::{extract_identifiers, DOCUMENT_ID_FIELD};
use super::unify::{unify_column, Column, ColumnData};

/// Name given to every frame produced for a query.
pub const FRAME_NAME: &str = "response";

/// Column-oriented result of one query: the identifier column followed by
/// one typed column per declared query column.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub name: String,
    pub row_count: usize,
    pub id: Column,
    pub columns: Vec<Column>,
}

impl Table {
    /// All columns in output order, identifier first.
    pub fn fields(&self) -> impl Iterator<Item = &Column> {
        std::iter::once(&self.id).chain(self.columns.iter())
    }

    pub fn field_count(&self) -> usize {
        self.columns.len() + 1
    }

    pub fn field(&self, name: &str) -> Option<&Column> {
        self.fields().find(|c| c.name == name)
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields().map(|c| c.name.as_str()).collect()
    }
}

/// Shape a raw result set into a [`Table`].
///
/// Rows shorter than the declared column list yield missing cells for the
/// columns they do not reach. Values past the last declared column are
/// ignored.
pub fn build_table(result: &ResultSet) -> Table {
    let row_count = result.row_count();
    let ids = extract_identifiers(&result.records, &result.columns);
    let id = Column::new(DOCUMENT_ID_FIELD, ColumnData::String(ids));

    let absent = RawValue::Null;
    let columns = result
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let values: Vec<&RawValue> = result
                .records
                .iter()
                .map(|row| row.get(idx).unwrap_or(&absent))
                .collect();
            unify_column(name, &values)
        })
        .collect();

    tracing::debug!(
        rows = row_count,
        columns = result.columns.len(),
        ragged = result.ragged_rows(),
        "table built"
    );

    Table {
        name: FRAME_NAME.to_string(),
        row_count,
        id,
        columns,
    }
}
