use crate::db::Row;

/// Column whose value is the full resource path of a document.
pub const DOCUMENT_PATH_FIELD: &str = "__name__";

/// Name of the synthetic identifier column placed first in every table.
pub const DOCUMENT_ID_FIELD: &str = "__document_id";

/// Index of the document-path column, matched case-insensitively.
pub fn path_column_index(columns: &[String]) -> Option<usize> {
    columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case(DOCUMENT_PATH_FIELD))
}

/// Final non-empty `/` segment of a document path.
pub fn document_id(path: &str) -> Option<&str> {
    path.rsplit('/').find(|segment| !segment.is_empty())
}

/// Derive one identifier per row from the document-path column.
pub fn extract_identifiers(rows: &[Row], columns: &[String]) -> Vec<Option<String>> {
    let Some(idx) = path_column_index(columns) else {
        return vec![None; rows.len()];
    };
    rows.iter()
        .map(|row| {
            row.get(idx)
                .and_then(|value| value.as_str())
                .and_then(document_id)
                .map(str::to_string)
        })
        .collect()
}
