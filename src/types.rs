use crate::error::{OverlayError, Result};
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Boolean,
    Varchar,
    Double,
    Integer,
    Geometry,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

#[derive(Clone, Debug)]
pub(crate) struct ColumnSpecs {
    pub(crate) primary_key: String,
    pub(crate) other_columns: Vec<ColumnSpec>,
}

/// One row of a GeoPackage `gpkg_spatial_ref_sys` table.
///
/// Carried alongside layer data so the CRS survives the trip through the
/// store and back out to a GeoPackage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialRefSys {
    pub srs_name: String,
    pub srs_id: i32,
    pub organization: String,
    pub organization_coordsys_id: i32,
    pub definition: String,
    pub description: Option<String>,
}

impl SpatialRefSys {
    /// Placeholder entry for an SRS id with no known definition.
    pub fn undefined(srs_id: i32) -> Self {
        Self {
            srs_name: format!("Undefined SRS {srs_id}"),
            srs_id,
            organization: "NONE".to_string(),
            organization_coordsys_id: srs_id,
            definition: "undefined".to_string(),
            description: None,
        }
    }
}

const MAX_IDENT_LEN: usize = 64;

/// A validated table or column name.
///
/// Only ASCII letters, digits and `_` are accepted (first character must not
/// be a digit), which keeps every name safe to splice into SQL once quoted.
/// Values never go through `Ident`; they are bound as parameters.
///
/// Equality, hashing and ordering ignore ASCII case, as SQLite does when it
/// resolves table and column names: `ID` and `id` are the same column.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "String")]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut chars = name.chars();
        let valid_first = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
        let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        let reserved = name.to_ascii_lowercase().starts_with("sqlite_");

        if !valid_first || !valid_rest || reserved || name.len() > MAX_IDENT_LEN {
            return Err(OverlayError::InvalidIdentifier(name));
        }
        Ok(Self(name))
    }

    /// For compile-time names known to pass validation.
    pub(crate) fn new_unchecked(name: &str) -> Self {
        debug_assert!(Self::new(name).is_ok(), "invalid identifier {name}");
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for use in SQL text.
    pub fn quoted(&self) -> String {
        format!(r#""{}""#, self.0)
    }

    /// Derive a new identifier by appending a suffix (e.g. `_tmp`).
    pub fn with_suffix(&self, suffix: &str) -> Result<Self> {
        Self::new(format!("{}{suffix}", self.0))
    }
}

impl PartialEq for Ident {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for Ident {}

impl Hash for Ident {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl PartialOrd for Ident {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ident {
    fn cmp(&self, other: &Self) -> Ordering {
        fn lower(s: &Ident) -> impl Iterator<Item = u8> + '_ {
            s.0.bytes().map(|b| b.to_ascii_lowercase())
        }
        lower(self).cmp(lower(other))
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Ident {
    type Error = OverlayError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Ident {
    type Error = OverlayError;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl FromStr for Ident {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One category code of a reference layer's classification field.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
pub enum ClassValue {
    Integer(i64),
    Text(String),
}

impl fmt::Display for ClassValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for ClassValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for ClassValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl ToSql for ClassValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Self::Integer(v) => Ok(ToSqlOutput::Owned(Value::Integer(*v))),
            Self::Text(v) => v.to_sql(),
        }
    }
}

/// Why an operation decided there was nothing to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The target (table, column, id field) is already there.
    AlreadyPresent,
    /// The object to remove does not exist.
    Absent,
}

/// Result of a store mutation that did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Applied { rows: usize },
    Skipped(SkipReason),
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub fn rows(&self) -> usize {
        match self {
            Self::Applied { rows } => *rows,
            Self::Skipped(_) => 0,
        }
    }
}
