use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a JSON string column, returning CorruptRow on parse failure.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::entry::Role;

    #[test]
    fn parse_enum_success() {
        let role: Role = parse_enum("user", "entries", "role").unwrap();
        assert_eq!(role, Role::User);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<Role, _> = parse_enum("moderator", "entries", "role");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "entries", column: "role", .. })
        ));
    }

    #[test]
    fn parse_json_success() {
        let v: serde_json::Value = parse_json(r#"{"key": "value"}"#, "entries", "content").unwrap();
        assert_eq!(v["key"], "value");
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<serde_json::Value, _> = parse_json("not json", "entries", "content");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "entries", column: "content", .. })
        ));
    }
}
