//! SQLite column affinity.
//!
//! A remote comparison matches DataFusion's only when SQLite compares the
//! stored values the way the locally mapped Arrow type does. A column with
//! NUMERIC affinity converts text operands to numbers before comparing, so it
//! cannot stand in for a local string column.

/// The affinity SQLite derives from a declared column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

/// SQLite's rules, first match wins: `INT`, then `CHAR`/`CLOB`/`TEXT`, then
/// `BLOB` or no type, then `REAL`/`FLOA`/`DOUB`, otherwise NUMERIC.
pub fn affinity(declared_type: &str) -> Affinity {
    let upper = declared_type.to_ascii_uppercase();
    let has = |needle: &str| upper.contains(needle);

    if has("INT") {
        Affinity::Integer
    } else if has("CHAR") || has("CLOB") || has("TEXT") {
        Affinity::Text
    } else if has("BLOB") || upper.trim().is_empty() {
        Affinity::Blob
    } else if has("REAL") || has("FLOA") || has("DOUB") {
        Affinity::Real
    } else {
        Affinity::Numeric
    }
}
