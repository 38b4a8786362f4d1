//! Result shaping: turns loosely typed query rows into typed columns.
//!
//! ```text
//! ResultSet (columns + ragged rows)
//!       ↓
//! Identifier extraction   (identifier.rs)
//!       ↓
//! Per-column unification  (unify.rs)
//!       ↓
//! Table                   (table.rs)
//! ```
mod identifier;
mod table;
mod unify;

pub use identifier::{
    document_id, extract_identifiers, path_column_index, DOCUMENT_ID_FIELD, DOCUMENT_PATH_FIELD,
};
pub use table::{build_table, Table, FRAME_NAME};
pub use unify::{resolve_type, unify_column, Column, ColumnData, FieldType};
