//! Helpers for generated SQL text.

/// Quote a string as a SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a partition key value for a `FOR VALUES IN (...)` clause: numeric
/// keys stay bare, everything else becomes a quoted literal.
pub fn key_value(value: &str) -> String {
    if value.parse::<i64>().is_ok() {
        value.to_string()
    } else {
        quote_literal(value)
    }
}
