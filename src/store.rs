//! Scoped access to the SQLite database file that holds all run state.

use crate::conversions::{column_type_from_str, column_type_from_typeof};
use crate::error::{OverlayError, Result};
use crate::ogc_sql::quote_name;
use crate::sql_functions::register_spatial_functions;
use crate::types::{ColumnSpec, ColumnType, Ident, SpatialRefSys};
use rusqlite::{Connection, ErrorCode, OpenFlags, OptionalExtension, Transaction};
use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Table in the store that records the SRS definitions of loaded layers.
pub(crate) const SRS_TABLE: &str = "spatial_ref_sys";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Owner of the single connection to a store file.
///
/// Write handles hold SQLite's exclusive lock for their whole lifetime, so a
/// second writer on the same file fails with [`OverlayError::StoreBusy`]. The
/// connection is released when the store is dropped or closed.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
    read_only: bool,
    spatial: Cell<bool>,
}

impl Store {
    /// Open a store file.
    ///
    /// Read-only opens require the file to exist; read-write opens create it.
    pub fn open<P: AsRef<Path>>(path: P, mode: AccessMode) -> Result<Self> {
        let path = path.as_ref();
        let conn = match mode {
            AccessMode::ReadOnly => {
                if !path.exists() {
                    return Err(OverlayError::MissingFile {
                        path: path.to_path_buf(),
                    });
                }
                Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
            }
            AccessMode::ReadWrite => {
                let conn = Connection::open(path)?;
                lock_exclusive(&conn, path)?;
                conn
            }
        };
        tracing::debug!(path = %path.display(), ?mode, "opened store");

        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
            read_only: mode == AccessMode::ReadOnly,
            spatial: Cell::new(false),
        })
    }

    /// Open a transient store, mainly for tests and scratch work.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            path: None,
            read_only: false,
            spatial: Cell::new(false),
        })
    }

    /// Register the spatial function set once per connection.
    pub fn ensure_spatial(&self) -> Result<()> {
        if self.spatial.get() {
            return Ok(());
        }
        register_spatial_functions(&self.conn)?;
        self.spatial.set(true);
        tracing::debug!("registered spatial functions");
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Start a write transaction; dropping it without commit rolls back.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        self.ensure_writable()?;
        Ok(self.conn.unchecked_transaction()?)
    }

    /// Close the connection, surfacing any error from SQLite.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| OverlayError::Sql(err))
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(OverlayError::ReadOnly);
        }
        Ok(())
    }

    /// List user tables in name order.
    pub fn list_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(tables)
    }

    pub fn table_exists(&self, table: &Ident) -> Result<bool> {
        Ok(table_exists(&self.conn, table.as_str())?)
    }

    pub fn field_exists(&self, table: &Ident, field: &Ident) -> Result<bool> {
        Ok(column_exists(&self.conn, table.as_str(), field.as_str())?)
    }

    /// Column names of a table in declaration order.
    pub fn table_columns(&self, table: &Ident) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
        let columns = stmt
            .query_map([table.as_str()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(columns)
    }

    /// Columns with their types.
    ///
    /// Columns created through `CREATE TABLE ... AS SELECT` may carry no
    /// declared type; their type is taken from the first non-null value.
    pub fn column_specs(&self, table: &Ident) -> Result<Vec<ColumnSpec>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")?;
        let declared = stmt
            .query_map([table.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<(String, String)>, _>>()?;

        let mut specs = Vec::with_capacity(declared.len());
        for (name, declared_type) in declared {
            let column_type = match column_type_from_str(&declared_type) {
                Some(column_type) => column_type,
                None => self
                    .probe_column_type(table, &name)?
                    .unwrap_or(ColumnType::Varchar),
            };
            specs.push(ColumnSpec { name, column_type });
        }
        Ok(specs)
    }

    fn probe_column_type(&self, table: &Ident, column: &str) -> Result<Option<ColumnType>> {
        let column = quote_name(column);
        let sql = format!(
            "SELECT typeof({column}) FROM {} WHERE {column} IS NOT NULL LIMIT 1",
            table.quoted()
        );
        let type_name: Option<String> = self
            .conn
            .query_row(&sql, [], |row| row.get(0))
            .optional()?;
        Ok(type_name.as_deref().and_then(column_type_from_typeof))
    }

    /// Fail with [`OverlayError::MissingTable`] unless the table exists.
    pub fn require_table(&self, table: &Ident) -> Result<()> {
        if !self.table_exists(table)? {
            return Err(OverlayError::MissingTable {
                table: table.to_string(),
            });
        }
        Ok(())
    }

    /// Fail with [`OverlayError::MissingField`] unless the column exists.
    pub fn require_field(&self, table: &Ident, field: &Ident) -> Result<()> {
        if !self.field_exists(table, field)? {
            return Err(OverlayError::MissingField {
                table: table.to_string(),
                field: field.to_string(),
            });
        }
        Ok(())
    }

    /// Remember an SRS definition so exports can write it back out.
    pub fn record_srs(&self, srs: &SpatialRefSys) -> Result<()> {
        self.ensure_writable()?;
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {SRS_TABLE} (
  srs_id INTEGER PRIMARY KEY,
  srs_name TEXT NOT NULL,
  organization TEXT NOT NULL,
  organization_coordsys_id INTEGER NOT NULL,
  definition TEXT NOT NULL,
  description TEXT
)"
        ))?;
        self.conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {SRS_TABLE} \
                (srs_id, srs_name, organization, organization_coordsys_id, definition, description) \
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ),
            rusqlite::params![
                srs.srs_id,
                srs.srs_name,
                srs.organization,
                srs.organization_coordsys_id,
                srs.definition,
                srs.description
            ],
        )?;
        Ok(())
    }

    /// Look up a recorded SRS definition by id.
    pub fn srs(&self, srs_id: i32) -> Result<Option<SpatialRefSys>> {
        if !table_exists(&self.conn, SRS_TABLE)? {
            return Ok(None);
        }
        let srs = self
            .conn
            .query_row(
                &format!(
                    "SELECT srs_name, srs_id, organization, organization_coordsys_id, definition, description \
                    FROM {SRS_TABLE} WHERE srs_id = ?1"
                ),
                [srs_id],
                |row| {
                    Ok(SpatialRefSys {
                        srs_name: row.get(0)?,
                        srs_id: row.get(1)?,
                        organization: row.get(2)?,
                        organization_coordsys_id: row.get(3)?,
                        definition: row.get(4)?,
                        description: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(srs)
    }
}

/// Open a store, make the spatial functions available, run `f` and close.
///
/// The connection is released whether `f` succeeds or fails.
pub fn with_connection<P, T, F>(path: P, mode: AccessMode, f: F) -> Result<T>
where
    P: AsRef<Path>,
    F: FnOnce(&Store) -> Result<T>,
{
    let store = Store::open(path, mode)?;
    store.ensure_spatial()?;
    let value = f(&store)?;
    store.close()?;
    Ok(value)
}

// With locking_mode=EXCLUSIVE the lock taken by the first write transaction
// is kept until the connection closes.
fn lock_exclusive(conn: &Connection, path: &Path) -> Result<()> {
    conn.busy_timeout(Duration::ZERO)?;
    conn.pragma_update_and_check(None, "locking_mode", "EXCLUSIVE", |row| {
        row.get::<_, String>(0)
    })?;
    match conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;") {
        Ok(()) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            Err(OverlayError::StoreBusy {
                path: path.to_path_buf(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1 COLLATE NOCASE)",
        [table],
        |row| row.get(0),
    )
}

pub(crate) fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2 COLLATE NOCASE)",
        [table, column],
        |row| row.get(0),
    )
}

#[cfg(test)]
mod tests {
    use super::{AccessMode, Store, with_connection};
    use crate::error::OverlayError;
    use crate::types::{ColumnType, Ident, SpatialRefSys};

    fn ident(name: &str) -> Ident {
        Ident::new(name).expect("valid identifier")
    }

    #[test]
    fn read_only_open_of_missing_file_fails_fast() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.db");
        let err = Store::open(&path, AccessMode::ReadOnly).expect_err("missing file");
        assert!(matches!(err, OverlayError::MissingFile { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn second_writer_is_refused() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.db");

        let first = Store::open(&path, AccessMode::ReadWrite)?;
        let err = Store::open(&path, AccessMode::ReadWrite).expect_err("lock held");
        assert!(matches!(err, OverlayError::StoreBusy { .. }));

        first.close()?;
        let again = Store::open(&path, AccessMode::ReadWrite)?;
        again.close()?;
        Ok(())
    }

    #[test]
    fn with_connection_releases_on_error() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.db");

        let result: crate::Result<()> = with_connection(&path, AccessMode::ReadWrite, |store| {
            store.connection().execute_batch("CREATE TABLE t (id INTEGER)")?;
            Err(OverlayError::InvalidArgument("boom".to_string()))
        });
        assert!(result.is_err());

        let tables = with_connection(&path, AccessMode::ReadWrite, |store| store.list_tables())?;
        assert_eq!(tables, vec!["t".to_string()]);
        Ok(())
    }

    #[test]
    fn catalog_checks() -> crate::Result<()> {
        let store = Store::open_in_memory()?;
        store.ensure_spatial()?;
        store.ensure_spatial()?;
        store
            .connection()
            .execute_batch("CREATE TABLE plots (id INTEGER, name TEXT, geom BLOB)")?;

        assert!(store.table_exists(&ident("plots"))?);
        assert!(store.table_exists(&ident("PLOTS"))?);
        assert!(!store.table_exists(&ident("other"))?);
        assert!(store.field_exists(&ident("plots"), &ident("name"))?);
        assert!(!store.field_exists(&ident("plots"), &ident("area"))?);
        assert_eq!(store.table_columns(&ident("plots"))?, vec!["id", "name", "geom"]);

        let err = store
            .require_field(&ident("plots"), &ident("area"))
            .expect_err("missing field");
        assert!(matches!(err, OverlayError::MissingField { .. }));
        let err = store.require_table(&ident("other")).expect_err("missing table");
        assert!(matches!(err, OverlayError::MissingTable { .. }));
        Ok(())
    }

    #[test]
    fn column_specs_probe_undeclared_types() -> crate::Result<()> {
        let store = Store::open_in_memory()?;
        store.connection().execute_batch(
            "CREATE TABLE src (id INTEGER, v REAL);
             INSERT INTO src VALUES (1, 2.5);
             CREATE TABLE derived AS SELECT id, v * 2 AS doubled, NULL AS empty FROM src;",
        )?;

        let specs = store.column_specs(&ident("derived"))?;
        let types: Vec<_> = specs.iter().map(|s| (s.name.as_str(), s.column_type)).collect();
        assert_eq!(
            types,
            vec![
                ("id", ColumnType::Integer),
                ("doubled", ColumnType::Double),
                ("empty", ColumnType::Varchar),
            ]
        );
        Ok(())
    }

    #[test]
    fn srs_records_roundtrip() -> crate::Result<()> {
        let store = Store::open_in_memory()?;
        assert_eq!(store.srs(25833)?, None);

        let srs = SpatialRefSys {
            srs_name: "ETRS89 / UTM zone 33N".to_string(),
            srs_id: 25833,
            organization: "EPSG".to_string(),
            organization_coordsys_id: 25833,
            definition: "PROJCS[\"ETRS89 / UTM zone 33N\"]".to_string(),
            description: None,
        };
        store.record_srs(&srs)?;
        store.record_srs(&srs)?;
        assert_eq!(store.srs(25833)?, Some(srs));
        Ok(())
    }

    #[test]
    fn read_only_store_rejects_transactions() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.db");
        Store::open(&path, AccessMode::ReadWrite)?.close()?;

        let store = Store::open(&path, AccessMode::ReadOnly)?;
        assert!(matches!(store.transaction(), Err(OverlayError::ReadOnly)));
        Ok(())
    }
}
