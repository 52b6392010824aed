use std::error::Error;
use std::fmt;
use std::path::PathBuf;

/// Crate error type for store, geometry and pipeline operations.
#[derive(Debug)]
pub enum OverlayError {
    /// Wraps errors returned by `rusqlite`.
    Sql(rusqlite::Error),
    /// Wraps errors returned by the `wkb` crate.
    Wkb(wkb::error::WkbError),
    /// Wraps I/O errors from reading or writing files.
    Io(std::io::Error),
    /// Wraps errors returned by the `csv` crate.
    Csv(csv::Error),
    /// Wraps errors returned by the Parquet writer/reader.
    Parquet(parquet::errors::ParquetError),
    /// Wraps errors returned by Arrow APIs.
    Arrow(arrow_schema::ArrowError),
    /// Wraps JSON (de)serialization errors of staging metadata.
    Json(serde_json::Error),
    /// Wraps TOML configuration parse errors.
    Config(toml::de::Error),
    /// A geometry type could not be mapped to a supported WKB geometry type.
    UnsupportedGeometryType(String),
    /// A column type declared in SQLite metadata is not supported by this crate.
    UnsupportedColumnType {
        column: String,
        declared_type: String,
    },
    /// Invalid or mixed `z` / `m` dimension flags in GeoPackage metadata.
    InvalidDimension { z: i8, m: i8 },
    /// Geometry blob does not start with the GeoPackage `GP` magic.
    InvalidGpkgGeometryMagic,
    /// Invalid GeoPackage geometry flags byte.
    InvalidGpkgGeometryFlags(u8),
    /// GeoPackage geometry blob is too short for the header and envelope.
    InvalidGpkgGeometryLength { len: usize, minimum: usize },
    /// A boolean operation received a geometry without area.
    NonPolygonalGeometry {
        function: &'static str,
        geometry_type: String,
    },
    /// An empty geometry could not be converted for computation.
    EmptyGeometry,
    /// A feature row has a `NULL` geometry value.
    NullGeometryValue,
    /// A table or column name failed identifier validation.
    InvalidIdentifier(String),
    /// An operation argument is inconsistent.
    InvalidArgument(String),
    /// A required input file does not exist.
    MissingFile { path: PathBuf },
    /// A required layer does not exist in a GeoPackage.
    MissingLayer { path: PathBuf, layer: String },
    /// A required table does not exist in the store.
    MissingTable { table: String },
    /// A required field does not exist on a table.
    MissingField { table: String, field: String },
    /// Layer schema has no primary key column.
    MissingPrimaryKeyColumn { layer_name: String },
    /// Layer schema has multiple primary key columns, which is unsupported.
    CompositePrimaryKeyUnsupported { layer_name: String },
    /// A layer with the same name already exists.
    LayerAlreadyExists { layer_name: String },
    /// Referenced `srs_id` does not exist in `gpkg_spatial_ref_sys`.
    MissingSpatialRefSysId { srs_id: u32 },
    /// Another write handle already holds the database file.
    StoreBusy { path: PathBuf },
    /// A store statement failed while running the named operation.
    Operation {
        operation: &'static str,
        target: String,
        source: Box<OverlayError>,
    },
    ReadOnly,
}

impl OverlayError {
    /// Attach operation context to an engine error.
    pub(crate) fn in_operation(self, operation: &'static str, target: impl Into<String>) -> Self {
        match self {
            // Already carries context; keep the innermost operation.
            Self::Operation { .. } => self,
            other => Self::Operation {
                operation,
                target: target.into(),
                source: Box::new(other),
            },
        }
    }
}

impl fmt::Display for OverlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(err) => write!(f, "{err}"),
            Self::Wkb(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Csv(err) => write!(f, "{err}"),
            Self::Parquet(err) => write!(f, "{err}"),
            Self::Arrow(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "{err}"),
            Self::Config(err) => write!(f, "invalid configuration: {err}"),
            Self::UnsupportedGeometryType(ty) => write!(f, "unsupported geometry type: {ty}"),
            Self::UnsupportedColumnType {
                column,
                declared_type,
            } => write!(
                f,
                "unsupported column type for column '{column}': {declared_type}"
            ),
            Self::InvalidDimension { z, m } => {
                write!(f, "invalid or mixed geometry dimension (z={z}, m={m})")
            }
            Self::InvalidGpkgGeometryMagic => write!(f, "not a gpkg geometry blob"),
            Self::InvalidGpkgGeometryFlags(flags) => {
                write!(f, "invalid gpkg geometry flags: {flags:#04x}")
            }
            Self::InvalidGpkgGeometryLength { len, minimum } => {
                write!(
                    f,
                    "invalid gpkg geometry length: got {len} bytes, expected at least {minimum}"
                )
            }
            Self::NonPolygonalGeometry {
                function,
                geometry_type,
            } => write!(
                f,
                "{function} expects polygonal geometries, got {geometry_type}"
            ),
            Self::EmptyGeometry => write!(f, "empty geometry"),
            Self::NullGeometryValue => write!(f, "feature has null geometry value"),
            Self::InvalidIdentifier(name) => write!(f, "invalid identifier: {name:?}"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::MissingFile { path } => write!(f, "file does not exist: {}", path.display()),
            Self::MissingLayer { path, layer } => {
                write!(f, "no such layer '{layer}' in {}", path.display())
            }
            Self::MissingTable { table } => write!(f, "no such table: {table}"),
            Self::MissingField { table, field } => {
                write!(f, "no such field '{field}' on table {table}")
            }
            Self::MissingPrimaryKeyColumn { layer_name } => {
                write!(f, "no primary key column found for layer: {layer_name}")
            }
            Self::CompositePrimaryKeyUnsupported { layer_name } => write!(
                f,
                "composite primary keys are not supported yet for layer: {layer_name}"
            ),
            Self::LayerAlreadyExists { layer_name } => {
                write!(f, "layer already exists: {layer_name}")
            }
            Self::MissingSpatialRefSysId { srs_id } => {
                write!(f, "srs_id {srs_id} not found in gpkg_spatial_ref_sys")
            }
            Self::StoreBusy { path } => write!(
                f,
                "database is held by another write handle: {}",
                path.display()
            ),
            Self::Operation {
                operation,
                target,
                source,
            } => write!(f, "{operation} failed on {target}: {source}"),
            Self::ReadOnly => write!(f, "operation not allowed on read-only connection"),
        }
    }
}

impl Error for OverlayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sql(err) => Some(err),
            Self::Wkb(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Csv(err) => Some(err),
            Self::Parquet(err) => Some(err),
            Self::Arrow(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::Operation { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for OverlayError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Sql(err)
    }
}

impl From<wkb::error::WkbError> for OverlayError {
    fn from(err: wkb::error::WkbError) -> Self {
        Self::Wkb(err)
    }
}

impl From<std::io::Error> for OverlayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<csv::Error> for OverlayError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err)
    }
}

impl From<parquet::errors::ParquetError> for OverlayError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        Self::Parquet(err)
    }
}

impl From<arrow_schema::ArrowError> for OverlayError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        Self::Arrow(err)
    }
}

impl From<serde_json::Error> for OverlayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl From<toml::de::Error> for OverlayError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err)
    }
}

/// Log a failed store operation and attach its name and target to the error.
pub(crate) fn operation_failed(
    operation: &'static str,
    target: impl fmt::Display,
) -> impl FnOnce(OverlayError) -> OverlayError {
    let target = target.to_string();
    move |err| {
        tracing::error!(operation, target = %target, error = %err, "store operation failed");
        err.in_operation(operation, target)
    }
}

/// Lift a crate error into a rusqlite user-function error.
pub(crate) fn to_sql_error(err: OverlayError) -> rusqlite::Error {
    match err {
        OverlayError::Sql(err) => err,
        other => rusqlite::Error::UserFunctionError(Box::new(other)),
    }
}

pub type Result<T> = std::result::Result<T, OverlayError>;
