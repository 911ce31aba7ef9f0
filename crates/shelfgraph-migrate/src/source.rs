//! Read-only typed access to the relational snapshot.
//!
//! The snapshot is opened with SQLite's read-only, no-mutex flags. Tables are
//! read with keyset paging (`WHERE id > ? ORDER BY id LIMIT ?`), so every
//! sequence is lazy, yields rows in primary-key order and holds no statement
//! open between pages. Columns that older layouts lack are projected as NULL.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::MigrationError;

/// Rows fetched per page.
const PAGE_SIZE: i64 = 256;

/// A record type read from one source table.
pub trait SourceRecord: Sized {
    /// Table name.
    const TABLE: &'static str;

    /// Entity name used in errors.
    const ENTITY: &'static str;

    /// Columns projected, `id` first.
    const COLUMNS: &'static [&'static str];

    /// Decode a row projected in [`Self::COLUMNS`] order.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Primary key.
    fn id(&self) -> i64;
}

/// A row of the `user` table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserRow {
    pub id: i64,
    pub username: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub is_admin: Option<bool>,
    pub is_active: Option<bool>,
    pub share_current_reading: Option<bool>,
    pub share_reading_activity: Option<bool>,
    pub share_library: Option<bool>,
    pub created_at: Option<String>,
    pub failed_login_attempts: Option<i64>,
    pub locked_until: Option<String>,
    pub last_login: Option<String>,
    pub password_must_change: Option<bool>,
    pub password_changed_at: Option<String>,
    pub reading_streak_offset: Option<i64>,
}

impl SourceRecord for UserRow {
    const TABLE: &'static str = "user";
    const ENTITY: &'static str = "User";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "username",
        "email",
        "password_hash",
        "is_admin",
        "is_active",
        "share_current_reading",
        "share_reading_activity",
        "share_library",
        "created_at",
        "failed_login_attempts",
        "locked_until",
        "last_login",
        "password_must_change",
        "password_changed_at",
        "reading_streak_offset",
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            password_hash: row.get(3)?,
            is_admin: row.get(4)?,
            is_active: row.get(5)?,
            share_current_reading: row.get(6)?,
            share_reading_activity: row.get(7)?,
            share_library: row.get(8)?,
            created_at: row.get(9)?,
            failed_login_attempts: row.get(10)?,
            locked_until: row.get(11)?,
            last_login: row.get(12)?,
            password_must_change: row.get(13)?,
            password_changed_at: row.get(14)?,
            reading_streak_offset: row.get(15)?,
        })
    }

    fn id(&self) -> i64 {
        self.id
    }
}

/// A row of the `book` table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookRow {
    pub id: i64,
    pub user_id: Option<i64>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub isbn: Option<String>,
    pub reading_status: Option<String>,
    pub want_to_read: Option<bool>,
    pub library_only: Option<bool>,
    pub start_date: Option<String>,
    pub finish_date: Option<String>,
    pub uid: Option<String>,
    pub cover_url: Option<String>,
    pub description: Option<String>,
    /// Stored verbatim, possibly a partial date.
    pub published_date: Option<String>,
    pub page_count: Option<i64>,
    pub categories: Option<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub average_rating: Option<f64>,
    pub rating_count: Option<i64>,
    pub created_at: Option<String>,
}

impl SourceRecord for BookRow {
    const TABLE: &'static str = "book";
    const ENTITY: &'static str = "Book";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "user_id",
        "title",
        "author",
        "isbn",
        "reading_status",
        "want_to_read",
        "library_only",
        "start_date",
        "finish_date",
        "uid",
        "cover_url",
        "description",
        "published_date",
        "page_count",
        "categories",
        "publisher",
        "language",
        "average_rating",
        "rating_count",
        "created_at",
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            author: row.get(3)?,
            isbn: row.get(4)?,
            reading_status: row.get(5)?,
            want_to_read: row.get(6)?,
            library_only: row.get(7)?,
            start_date: row.get(8)?,
            finish_date: row.get(9)?,
            uid: row.get(10)?,
            cover_url: row.get(11)?,
            description: row.get(12)?,
            published_date: row.get(13)?,
            page_count: row.get(14)?,
            categories: row.get(15)?,
            publisher: row.get(16)?,
            language: row.get(17)?,
            average_rating: row.get(18)?,
            rating_count: row.get(19)?,
            created_at: row.get(20)?,
        })
    }

    fn id(&self) -> i64 {
        self.id
    }
}

/// A row of the `reading_log` table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadingLogRow {
    pub id: i64,
    pub book_id: Option<i64>,
    pub user_id: Option<i64>,
    pub date: Option<String>,
    pub notes: Option<String>,
    pub pages_read: Option<i64>,
    pub minutes_read: Option<i64>,
    pub created_at: Option<String>,
}

impl SourceRecord for ReadingLogRow {
    const TABLE: &'static str = "reading_log";
    const ENTITY: &'static str = "ReadingLog";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "book_id",
        "user_id",
        "date",
        "notes",
        "pages_read",
        "minutes_read",
        "created_at",
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            book_id: row.get(1)?,
            user_id: row.get(2)?,
            date: row.get(3)?,
            notes: row.get(4)?,
            pages_read: row.get(5)?,
            minutes_read: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn id(&self) -> i64 {
        self.id
    }
}

/// Layout of one source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableLayout {
    /// Table name.
    pub name: String,
    /// Row count at open time.
    pub rows: u64,
    /// Columns present, in table order.
    pub columns: Vec<String>,
    /// Known columns this table lacks; read as NULL.
    pub missing: Vec<String>,
    /// Columns with no graph property. A row holding a value in one of them
    /// fails to map.
    pub unmapped: Vec<String>,
}

impl TableLayout {
    fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

/// Layout of the whole snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLayout {
    /// Snapshot path.
    pub path: PathBuf,
    /// Size of the snapshot file in bytes.
    pub size: u64,
    /// The three migrated tables.
    pub tables: Vec<TableLayout>,
    /// Other tables found, which are not migrated.
    pub other_tables: Vec<String>,
}

impl SourceLayout {
    /// Look up a table.
    pub fn table(&self, name: &str) -> Option<&TableLayout> {
        self.tables.iter().find(|t| t.name == name)
    }
}

/// Read-only handle on the relational snapshot.
pub struct SourceReader {
    conn: Connection,
    path: PathBuf,
    layout: SourceLayout,
}

impl SourceReader {
    /// Open a snapshot and validate that it is closed cleanly and complete.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref().to_path_buf();
        let unavailable = |reason: String| MigrationError::SourceUnavailable {
            path: path.clone(),
            reason,
        };
        let corrupt = |reason: &str| MigrationError::SourceCorrupt {
            path: path.clone(),
            reason: reason.to_string(),
        };

        let metadata = std::fs::metadata(&path).map_err(|e| unavailable(e.to_string()))?;
        if !metadata.is_file() {
            return Err(unavailable("not a regular file".to_string()));
        }
        std::fs::File::open(&path).map_err(|e| unavailable(e.to_string()))?;

        if sidecar(&path, "-journal").exists() {
            return Err(corrupt("a hot rollback journal is present; the snapshot was taken mid-write"));
        }
        if std::fs::metadata(sidecar(&path, "-wal")).map_or(false, |m| m.len() > 0) {
            return Err(corrupt("an uncheckpointed write-ahead log is present"));
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| classify(&path, e))?;
        conn.busy_timeout(Duration::ZERO)
            .map_err(|e| classify(&path, e))?;

        let check: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| classify(&path, e))?;
        if check != "ok" {
            return Err(MigrationError::SourceCorrupt {
                path: path.clone(),
                reason: format!("integrity check failed: {check}"),
            });
        }

        let layout = discover(&conn, &path, metadata.len())?;
        info!(
            path = %path.display(),
            users = layout.table(UserRow::TABLE).map_or(0, |t| t.rows),
            books = layout.table(BookRow::TABLE).map_or(0, |t| t.rows),
            reading_logs = layout.table(ReadingLogRow::TABLE).map_or(0, |t| t.rows),
            "source opened"
        );

        Ok(Self { conn, path, layout })
    }

    /// Validate a snapshot and return its layout without keeping it open.
    pub fn inspect(path: impl AsRef<Path>) -> Result<SourceLayout, MigrationError> {
        Ok(Self::open(path)?.layout)
    }

    /// Snapshot path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Layout discovered at open time.
    pub fn layout(&self) -> &SourceLayout {
        &self.layout
    }

    /// Users in identifier order.
    pub fn users(&self) -> RowIter<'_, UserRow> {
        self.rows()
    }

    /// Books in identifier order.
    pub fn books(&self) -> RowIter<'_, BookRow> {
        self.rows()
    }

    /// Reading logs in identifier order.
    pub fn reading_logs(&self) -> RowIter<'_, ReadingLogRow> {
        self.rows()
    }

    /// Rows of any record type in identifier order.
    pub fn rows<T: SourceRecord>(&self) -> RowIter<'_, T> {
        RowIter {
            reader: self,
            projection: self.projection::<T>(),
            unmapped: self.unmapped::<T>().to_vec(),
            last_id: None,
            buffer: VecDeque::new(),
            exhausted: false,
            _record: PhantomData,
        }
    }

    /// Current row count of a table.
    pub fn count<T: SourceRecord>(&self) -> Result<u64, MigrationError> {
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", T::TABLE);
        self.scalar(T::TABLE, &sql)
    }

    /// Every identifier of a table, ascending.
    pub fn ids<T: SourceRecord>(&self) -> Result<Vec<i64>, MigrationError> {
        let sql = format!("SELECT id FROM \"{}\" ORDER BY id", T::TABLE);
        self.id_list(T::TABLE, &sql, None)
    }

    /// The `n` smallest identifiers, ascending.
    pub fn first_ids<T: SourceRecord>(&self, n: usize) -> Result<Vec<i64>, MigrationError> {
        let sql = format!("SELECT id FROM \"{}\" ORDER BY id ASC LIMIT ?1", T::TABLE);
        self.id_list(T::TABLE, &sql, Some(n))
    }

    /// The `n` largest identifiers, ascending.
    pub fn last_ids<T: SourceRecord>(&self, n: usize) -> Result<Vec<i64>, MigrationError> {
        let sql = format!("SELECT id FROM \"{}\" ORDER BY id DESC LIMIT ?1", T::TABLE);
        let mut ids = self.id_list(T::TABLE, &sql, Some(n))?;
        ids.reverse();
        Ok(ids)
    }

    /// Fetch one row by identifier.
    pub fn fetch<T: SourceRecord>(&self, id: i64) -> Result<Option<T>, MigrationError> {
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE id = ?1",
            self.projection::<T>(),
            T::TABLE
        );
        self.conn
            .prepare_cached(&sql)
            .and_then(|mut stmt| stmt.query_row(params![id], T::from_row).optional())
            .map_err(|e| self.read_error(T::TABLE, e))
    }

    /// Books whose owning user exists.
    pub fn owns_count(&self) -> Result<u64, MigrationError> {
        self.scalar(
            BookRow::TABLE,
            "SELECT COUNT(*) FROM \"book\" b JOIN \"user\" u ON u.id = b.user_id",
        )
    }

    /// Reading logs whose user exists.
    pub fn logged_count(&self) -> Result<u64, MigrationError> {
        self.scalar(
            ReadingLogRow::TABLE,
            "SELECT COUNT(*) FROM \"reading_log\" l JOIN \"user\" u ON u.id = l.user_id",
        )
    }

    /// Reading logs whose book exists.
    pub fn read_on_count(&self) -> Result<u64, MigrationError> {
        self.scalar(
            ReadingLogRow::TABLE,
            "SELECT COUNT(*) FROM \"reading_log\" l JOIN \"book\" b ON b.id = l.book_id",
        )
    }

    /// Known columns in [`SourceRecord::COLUMNS`] order, then unmapped ones.
    fn projection<T: SourceRecord>(&self) -> String {
        let table = self.layout.table(T::TABLE);
        T::COLUMNS
            .iter()
            .map(|column| match table {
                Some(t) if t.has_column(column) => format!("\"{column}\""),
                _ => format!("NULL AS \"{column}\""),
            })
            .chain(self.unmapped::<T>().iter().map(|c| format!("\"{c}\"")))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn unmapped<T: SourceRecord>(&self) -> &[String] {
        self.layout
            .table(T::TABLE)
            .map_or(&[], |t| t.unmapped.as_slice())
    }

    fn scalar(&self, table: &str, sql: &str) -> Result<u64, MigrationError> {
        let count: i64 = self
            .conn
            .query_row(sql, [], |row| row.get(0))
            .map_err(|e| self.read_error(table, e))?;
        Ok(count.max(0) as u64)
    }

    fn id_list(
        &self,
        table: &str,
        sql: &str,
        limit: Option<usize>,
    ) -> Result<Vec<i64>, MigrationError> {
        let run = || -> rusqlite::Result<Vec<i64>> {
            let id = |row: &Row<'_>| row.get::<_, i64>(0);
            let mut stmt = self.conn.prepare_cached(sql)?;
            let ids: rusqlite::Result<Vec<i64>> = match limit {
                Some(n) => stmt.query_map(params![n as i64], id)?.collect(),
                None => stmt.query_map([], id)?.collect(),
            };
            ids
        };
        run().map_err(|e| self.read_error(table, e))
    }

    fn read_error(&self, table: &str, err: rusqlite::Error) -> MigrationError {
        match err {
            rusqlite::Error::InvalidColumnType(_, column, found) => MigrationError::SourceCorrupt {
                path: self.path.clone(),
                reason: format!("{table}.{column} holds a {found} value"),
            },
            rusqlite::Error::IntegralValueOutOfRange(_, value) => MigrationError::SourceCorrupt {
                path: self.path.clone(),
                reason: format!("{table} holds out-of-range integer {value}"),
            },
            other => classify(&self.path, other),
        }
    }
}

/// Lazy, one-pass sequence of rows in identifier order.
///
/// A row holding a value in a column that has no graph property yields a
/// `FieldMapping` error and ends the sequence.
pub struct RowIter<'a, T> {
    reader: &'a SourceReader,
    projection: String,
    unmapped: Vec<String>,
    last_id: Option<i64>,
    buffer: VecDeque<Result<T, MigrationError>>,
    exhausted: bool,
    _record: PhantomData<T>,
}

impl<T: SourceRecord> RowIter<'_, T> {
    fn fetch_page(&mut self) -> Result<(), MigrationError> {
        let conn = &self.reader.conn;
        let extra = self.unmapped.len();
        let read_row = |row: &Row<'_>| decode::<T>(row, extra);
        let page = match self.last_id {
            None => {
                let sql = format!(
                    "SELECT {} FROM \"{}\" ORDER BY id LIMIT ?1",
                    self.projection,
                    T::TABLE
                );
                conn.prepare_cached(&sql).and_then(|mut stmt| {
                    let rows = stmt
                        .query_map(params![PAGE_SIZE], read_row)?
                        .collect::<rusqlite::Result<Vec<_>>>();
                    rows
                })
            }
            Some(after) => {
                let sql = format!(
                    "SELECT {} FROM \"{}\" WHERE id > ?1 ORDER BY id LIMIT ?2",
                    self.projection,
                    T::TABLE
                );
                conn.prepare_cached(&sql).and_then(|mut stmt| {
                    let rows = stmt
                        .query_map(params![after, PAGE_SIZE], read_row)?
                        .collect::<rusqlite::Result<Vec<_>>>();
                    rows
                })
            }
        }
        .map_err(|e| self.reader.read_error(T::TABLE, e))?;

        if (page.len() as i64) < PAGE_SIZE {
            self.exhausted = true;
        }
        debug!(table = T::TABLE, rows = page.len(), "source page read");
        for (record, unmapped) in page {
            self.last_id = Some(record.id());
            if let Some(index) = unmapped {
                self.exhausted = true;
                self.buffer.push_back(Err(MigrationError::field(
                    T::ENTITY,
                    record.id(),
                    &self.unmapped[index],
                    "holds a value but has no graph property",
                )));
                break;
            }
            self.buffer.push_back(Ok(record));
        }
        Ok(())
    }
}

impl<T: SourceRecord> Iterator for RowIter<'_, T> {
    type Item = Result<T, MigrationError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front()
    }
}

/// Decode a row and find the first unmapped column that holds a value.
fn decode<T: SourceRecord>(
    row: &Row<'_>,
    unmapped: usize,
) -> rusqlite::Result<(T, Option<usize>)> {
    let record = T::from_row(row)?;
    let base = T::COLUMNS.len();
    for index in 0..unmapped {
        if !matches!(row.get_ref(base + index)?, ValueRef::Null) {
            return Ok((record, Some(index)));
        }
    }
    Ok((record, None))
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn classify(path: &Path, err: rusqlite::Error) -> MigrationError {
    let corrupt = |reason: String| MigrationError::SourceCorrupt {
        path: path.to_path_buf(),
        reason,
    };
    match &err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::NotADatabase => corrupt("file is not a SQLite database".to_string()),
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                corrupt("database is locked by another connection".to_string())
            }
            ErrorCode::DatabaseCorrupt => corrupt("database disk image is malformed".to_string()),
            ErrorCode::CannotOpen | ErrorCode::PermissionDenied => {
                MigrationError::SourceUnavailable {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                }
            }
            _ => corrupt(err.to_string()),
        },
        _ => MigrationError::Sqlite(err),
    }
}

fn discover(conn: &Connection, path: &Path, size: u64) -> Result<SourceLayout, MigrationError> {
    let corrupt = |reason: String| MigrationError::SourceCorrupt {
        path: path.to_path_buf(),
        reason,
    };

    let mut all_tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .and_then(|mut stmt| {
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>();
            names
        })
        .map_err(|e| classify(path, e))?;

    let mut tables = Vec::new();
    for (name, known) in [
        (UserRow::TABLE, UserRow::COLUMNS),
        (BookRow::TABLE, BookRow::COLUMNS),
        (ReadingLogRow::TABLE, ReadingLogRow::COLUMNS),
    ] {
        let Some(pos) = all_tables.iter().position(|t| t == name) else {
            return Err(corrupt(format!("required table {name} is missing")));
        };
        all_tables.remove(pos);

        let columns: Vec<String> = conn
            .prepare(&format!("PRAGMA table_info(\"{name}\")"))
            .and_then(|mut stmt| {
                let names = stmt
                    .query_map([], |row| row.get(1))?
                    .collect::<rusqlite::Result<Vec<String>>>();
                names
            })
            .map_err(|e| classify(path, e))?;
        if !columns.iter().any(|c| c.eq_ignore_ascii_case("id")) {
            return Err(corrupt(format!("table {name} has no id column")));
        }

        let rows: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM \"{name}\""), [], |row| row.get(0))
            .map_err(|e| classify(path, e))?;
        let missing = known
            .iter()
            .filter(|k| !columns.iter().any(|c| c.eq_ignore_ascii_case(k)))
            .map(|k| k.to_string())
            .collect();
        let unmapped: Vec<String> = columns
            .iter()
            .filter(|c| !known.iter().any(|k| c.eq_ignore_ascii_case(k)))
            .cloned()
            .collect();
        if !unmapped.is_empty() {
            warn!(
                table = name,
                columns = %unmapped.join(", "),
                "source columns have no graph property"
            );
        }

        tables.push(TableLayout {
            name: name.to_string(),
            rows: rows.max(0) as u64,
            columns,
            missing,
            unmapped,
        });
    }

    all_tables.retain(|t| !t.starts_with("sqlite_"));
    Ok(SourceLayout {
        path: path.to_path_buf(),
        size,
        tables,
        other_tables: all_tables,
    })
}
