//! Quoting for the remote SQLite dialect.

/// Words SQLite refuses as bare identifiers in the positions we emit them.
const RESERVED: &[&str] = &[
    "abort", "action", "add", "all", "alter", "and", "as", "asc", "between", "by", "case",
    "check", "collate", "column", "commit", "constraint", "create", "cross", "default", "delete",
    "desc", "distinct", "drop", "else", "end", "escape", "except", "exists", "foreign", "from",
    "full", "group", "having", "in", "index", "inner", "insert", "intersect", "into", "is",
    "join", "key", "left", "like", "limit", "natural", "not", "null", "of", "offset", "on", "or",
    "order", "outer", "primary", "references", "right", "select", "set", "table",
    "then", "to", "transaction", "union", "unique", "update", "using", "values", "when",
    "where", "with",
];

fn is_bare_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.contains(&name.to_ascii_lowercase().as_str())
}

/// Emits `name` bare when SQLite would read it back unchanged, otherwise
/// double-quoted with embedded quotes doubled.
pub fn quote_identifier(name: &str) -> String {
    if is_bare_identifier(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Single-quoted string literal with embedded quotes doubled.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
