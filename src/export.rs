use serde_json::{json, Value};

use crate::frame::Table;

/// Column-oriented frame: schema plus one value array per field.
pub fn frame_value(table: &Table) -> Value {
    let fields: Vec<Value> = table
        .fields()
        .map(|column| {
            json!({
                "name": column.name,
                "type": column.field_type().frame_type(),
                "typeInfo": { "frame": column.field_type(), "nullable": true },
            })
        })
        .collect();
    let values: Vec<Value> = table
        .fields()
        .map(|column| {
            Value::Array(
                (0..table.row_count)
                    .map(|row| column.data.cell_json(row))
                    .collect(),
            )
        })
        .collect();
    json!({
        "schema": { "name": table.name, "fields": fields },
        "data": { "values": values },
    })
}

pub fn to_frame_json(table: &Table) -> String {
    serde_json::to_string_pretty(&frame_value(table)).unwrap_or_else(|_| "{}".to_string())
}

/// Array of row objects, identifier first.
pub fn to_json(table: &Table) -> String {
    let mut rows_json: Vec<Value> = Vec::with_capacity(table.row_count);

    for row in 0..table.row_count {
        let mut obj = serde_json::Map::new();
        for column in table.fields() {
            obj.insert(column.name.clone(), column.data.cell_json(row));
        }
        rows_json.push(Value::Object(obj));
    }

    serde_json::to_string_pretty(&rows_json).unwrap_or_else(|_| "[]".to_string())
}

pub fn to_csv(table: &Table) -> String {
    let mut output = String::new();

    // Header
    let headers: Vec<String> = table.fields().map(|c| csv_escape(&c.name)).collect();
    output.push_str(&headers.join(","));
    output.push('\n');

    // Rows
    for row in 0..table.row_count {
        let cells: Vec<String> = table
            .fields()
            .map(|c| csv_escape(&c.data.cell_text(row).unwrap_or_default()))
            .collect();
        output.push_str(&cells.join(","));
        output.push('\n');
    }

    output
}

pub fn to_tsv(table: &Table) -> String {
    let mut output = String::new();

    // Header
    let headers: Vec<&str> = table.fields().map(|c| c.name.as_str()).collect();
    output.push_str(&headers.join("\t"));
    output.push('\n');

    // Rows
    for row in 0..table.row_count {
        let cells: Vec<String> = table
            .fields()
            .map(|c| {
                c.data
                    .cell_text(row)
                    .unwrap_or_default()
                    .replace(['\t', '\n'], " ")
            })
            .collect();
        output.push_str(&cells.join("\t"));
        output.push('\n');
    }

    output
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
