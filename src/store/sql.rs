use crate::catalog::{ColumnKind, ObjectTypeInfo};
use crate::record::Record;

pub(crate) fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `json_extract` over the payload bound at `?1`.
pub(crate) fn json_extract_for_column(column: &str) -> String {
    let escaped = column.replace('\\', "\\\\");
    let escaped = escaped.replace('"', "\\\"");
    format!("json_extract(?1, '$.\"{}\"')", escaped)
}

pub(crate) fn create_table_sql(info: &ObjectTypeInfo) -> String {
    let mut columns = Vec::with_capacity(info.columns.len());
    for column in &info.columns {
        if column.name == info.id_column {
            columns.push(format!(
                "{} INTEGER PRIMARY KEY AUTOINCREMENT",
                quote_ident(&column.name)
            ));
        } else {
            columns.push(format!(
                "{} {}",
                quote_ident(&column.name),
                column.kind.sql_type()
            ));
        }
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&info.table),
        columns.join(", ")
    )
}

pub(crate) fn guid_index_sql(info: &ObjectTypeInfo) -> Option<String> {
    let guid = info.guid_column.as_ref()?;
    Some(format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&format!("{}_guid_idx", info.table)),
        quote_ident(&info.table),
        quote_ident(guid)
    ))
}

/// Selects a row as a single JSON object; the binary column is left out.
pub(crate) fn select_json_sql(info: &ObjectTypeInfo, filter: &str) -> String {
    let pairs: Vec<String> = info
        .data_columns()
        .map(|column| format!("{}, {}", quote_literal(&column.name), quote_ident(&column.name)))
        .collect();
    format!(
        "SELECT json_object({}) FROM {} WHERE {} ORDER BY {}",
        pairs.join(", "),
        quote_ident(&info.table),
        filter,
        quote_ident(&info.id_column)
    )
}

/// Columns of `record` that exist on the type and may be written. The id
/// column is assigned by the store.
fn writable_columns<'a>(info: &'a ObjectTypeInfo, record: &Record) -> Vec<&'a str> {
    info.data_columns()
        .filter(|column| column.name != info.id_column && record.contains(&column.name))
        .map(|column| column.name.as_str())
        .collect()
}

/// Insert statement for one record shape. Data columns come from the JSON
/// payload at `?1`; the binary payload, when present, is bound at `?2`.
#[derive(Debug)]
pub(crate) struct RowInserter {
    pub sql: String,
    pub uses_payload: bool,
}

impl RowInserter {
    pub fn prepare(info: &ObjectTypeInfo, record: &Record, with_binary: bool) -> Self {
        let mut columns: Vec<String> = Vec::new();
        let mut values: Vec<String> = Vec::new();
        for column in writable_columns(info, record) {
            columns.push(quote_ident(column));
            values.push(json_extract_for_column(column));
        }
        if let (true, Some(binary)) = (with_binary, info.binary_column.as_ref()) {
            columns.push(quote_ident(binary));
            values.push("?2".to_string());
        }
        let uses_payload = !values.iter().all(|value| value == "?2");
        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(&info.table))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(&info.table),
                columns.join(", "),
                values.join(", ")
            )
        };
        Self { sql, uses_payload }
    }
}

/// Update statement: payload at `?1`, id at `?2`, binary at `?3`.
pub(crate) fn update_sql(
    info: &ObjectTypeInfo,
    record: &Record,
    with_binary: bool,
) -> Option<String> {
    let mut assignments: Vec<String> = writable_columns(info, record)
        .into_iter()
        .map(|column| format!("{} = {}", quote_ident(column), json_extract_for_column(column)))
        .collect();
    if let (true, Some(binary)) = (with_binary, info.binary_column.as_ref()) {
        assignments.push(format!("{} = ?3", quote_ident(binary)));
    }
    if assignments.is_empty() {
        return None;
    }
    Some(format!(
        "UPDATE {} SET {} WHERE {} = ?2",
        quote_ident(&info.table),
        assignments.join(", "),
        quote_ident(&info.id_column)
    ))
}

/// SQLite hands booleans back as 0/1; restore them from the column kind.
pub(crate) fn normalize_booleans(info: &ObjectTypeInfo, record: &mut Record) {
    for column in info.columns.iter().filter(|c| c.kind == ColumnKind::Boolean) {
        if let Some(value) = record.get_i64(&column.name) {
            record.set(column.name.clone(), value != 0);
        }
    }
}
