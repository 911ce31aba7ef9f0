//! Row to graph mapping.
//!
//! Pure functions: no I/O, no store access. Node mappers turn one source row
//! into one [`NodeDescriptor`]; edge mappers derive relationships from the
//! same rows and check both endpoints against the identifiers already mapped.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use shelfgraph_store::{
    EdgeTypeDef, GraphSchema, NodeTypeDef, Properties, PropertyDef, Value, ValueType,
};

use crate::error::MigrationError;
use crate::source::{BookRow, ReadingLogRow, UserRow};

/// Node label for users.
pub const USER: &str = "User";
/// Node label for books.
pub const BOOK: &str = "Book";
/// Node label for reading logs.
pub const READING_LOG: &str = "ReadingLog";

/// User owns book.
pub const OWNS: &str = "OWNS";
/// User logged reading activity.
pub const LOGGED: &str = "LOGGED";
/// Reading activity happened on a book.
pub const READ_ON: &str = "READ_ON";

/// Days from 0001-01-01 to 1970-01-01.
const EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Reading progress of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadingStatus {
    /// On the wish list.
    PlanToRead,
    /// Started, not finished.
    Reading,
    /// Finished.
    Read,
    /// Paused.
    OnHold,
    /// Abandoned.
    DidNotFinish,
    /// Owned, with no reading intent.
    LibraryOnly,
}

impl ReadingStatus {
    /// Stored value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::PlanToRead => "plan_to_read",
            ReadingStatus::Reading => "reading",
            ReadingStatus::Read => "read",
            ReadingStatus::OnHold => "on_hold",
            ReadingStatus::DidNotFinish => "did_not_finish",
            ReadingStatus::LibraryOnly => "library_only",
        }
    }

    /// Parse a stored value or one of its legacy aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        let status = match normalized.as_str() {
            "plan_to_read" | "want_to_read" => ReadingStatus::PlanToRead,
            "reading" | "currently_reading" => ReadingStatus::Reading,
            "read" | "has_read" | "finished" => ReadingStatus::Read,
            "on_hold" => ReadingStatus::OnHold,
            "did_not_finish" | "dnf" => ReadingStatus::DidNotFinish,
            "library_only" => ReadingStatus::LibraryOnly,
            _ => return None,
        };
        Some(status)
    }

    /// Status implied by legacy layouts that have no status column.
    pub fn derive(book: &BookRow) -> Self {
        if book.finish_date.is_some() {
            ReadingStatus::Read
        } else if book.start_date.is_some() {
            ReadingStatus::Reading
        } else if book.library_only == Some(true) {
            ReadingStatus::LibraryOnly
        } else {
            ReadingStatus::PlanToRead
        }
    }
}

impl fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDescriptor {
    /// Node label.
    pub label: &'static str,
    /// Source identifier, preserved verbatim.
    pub id: i64,
    /// Attributes.
    pub properties: Properties,
}

/// A relationship ready to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeDescriptor {
    /// Relationship type.
    pub edge_type: &'static str,
    /// Source node identifier.
    pub from: i64,
    /// Target node identifier.
    pub to: i64,
}

/// Identifiers mapped so far, per node label.
#[derive(Debug, Clone, Default)]
pub struct SeenIds {
    /// User identifiers.
    pub users: HashSet<i64>,
    /// Book identifiers.
    pub books: HashSet<i64>,
    /// Reading log identifiers.
    pub reading_logs: HashSet<i64>,
}

impl SeenIds {
    /// Create empty arenas.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapped node.
    pub fn record(&mut self, node: &NodeDescriptor) {
        if let Some(set) = self.arena_mut(node.label) {
            set.insert(node.id);
        }
    }

    /// Whether a node with this label and identifier was mapped.
    pub fn contains(&self, label: &str, id: i64) -> bool {
        match label {
            USER => self.users.contains(&id),
            BOOK => self.books.contains(&id),
            READING_LOG => self.reading_logs.contains(&id),
            _ => false,
        }
    }

    fn arena_mut(&mut self, label: &str) -> Option<&mut HashSet<i64>> {
        match label {
            USER => Some(&mut self.users),
            BOOK => Some(&mut self.books),
            READING_LOG => Some(&mut self.reading_logs),
            _ => None,
        }
    }
}

/// Node and edge types the mappers produce.
pub fn graph_schema() -> GraphSchema {
    GraphSchema::new()
        .with_node(
            NodeTypeDef::new(USER)
                .with_property(PropertyDef::required("id", ValueType::Int64))
                .with_property(PropertyDef::optional("username", ValueType::String))
                .with_property(PropertyDef::optional("email", ValueType::String))
                .with_property(PropertyDef::optional("password_hash", ValueType::String))
                .with_property(PropertyDef::optional("is_admin", ValueType::Bool))
                .with_property(PropertyDef::optional("is_active", ValueType::Bool))
                .with_property(PropertyDef::optional("share_current_reading", ValueType::Bool))
                .with_property(PropertyDef::optional("share_reading_activity", ValueType::Bool))
                .with_property(PropertyDef::optional("share_library", ValueType::Bool))
                .with_property(PropertyDef::optional("created_at", ValueType::Timestamp))
                .with_property(PropertyDef::optional("failed_login_attempts", ValueType::Int64))
                .with_property(PropertyDef::optional("locked_until", ValueType::Timestamp))
                .with_property(PropertyDef::optional("last_login", ValueType::Timestamp))
                .with_property(PropertyDef::optional("password_must_change", ValueType::Bool))
                .with_property(PropertyDef::optional("password_changed_at", ValueType::Timestamp))
                .with_property(PropertyDef::optional("reading_streak_offset", ValueType::Int64)),
        )
        .with_node(
            NodeTypeDef::new(BOOK)
                .with_property(PropertyDef::required("id", ValueType::Int64))
                .with_property(PropertyDef::required("title", ValueType::String))
                .with_property(PropertyDef::optional("author", ValueType::String))
                .with_property(PropertyDef::optional("isbn", ValueType::String))
                .with_property(PropertyDef::required("reading_status", ValueType::String))
                .with_property(PropertyDef::optional("start_date", ValueType::Date))
                .with_property(PropertyDef::optional("finish_date", ValueType::Date))
                .with_property(PropertyDef::optional("want_to_read", ValueType::Bool))
                .with_property(PropertyDef::optional("library_only", ValueType::Bool))
                .with_property(PropertyDef::optional("uid", ValueType::String))
                .with_property(PropertyDef::optional("cover_url", ValueType::String))
                .with_property(PropertyDef::optional("description", ValueType::String))
                .with_property(PropertyDef::optional("published_date", ValueType::String))
                .with_property(PropertyDef::optional("page_count", ValueType::Int64))
                .with_property(PropertyDef::optional("categories", ValueType::String))
                .with_property(PropertyDef::optional("publisher", ValueType::String))
                .with_property(PropertyDef::optional("language", ValueType::String))
                .with_property(PropertyDef::optional("average_rating", ValueType::Float64))
                .with_property(PropertyDef::optional("rating_count", ValueType::Int64))
                .with_property(PropertyDef::optional("created_at", ValueType::Timestamp)),
        )
        .with_node(
            NodeTypeDef::new(READING_LOG)
                .with_property(PropertyDef::required("id", ValueType::Int64))
                .with_property(PropertyDef::required("date", ValueType::Date))
                .with_property(PropertyDef::optional("notes", ValueType::String))
                .with_property(PropertyDef::optional("pages_read", ValueType::Int64))
                .with_property(PropertyDef::optional("minutes_read", ValueType::Int64))
                .with_property(PropertyDef::optional("created_at", ValueType::Timestamp)),
        )
        .with_edge(EdgeTypeDef::new(OWNS, USER, BOOK))
        .with_edge(EdgeTypeDef::new(LOGGED, USER, READING_LOG))
        .with_edge(EdgeTypeDef::new(READ_ON, BOOK, READING_LOG))
}

/// Map a user row.
pub fn map_user(row: &UserRow) -> Result<NodeDescriptor, MigrationError> {
    check_id(USER, row.id, "id", Some(row.id))?;

    let created_at = optional_timestamp(USER, row.id, "created_at", row.created_at.as_deref())?;
    let locked_until =
        optional_timestamp(USER, row.id, "locked_until", row.locked_until.as_deref())?;
    let last_login = optional_timestamp(USER, row.id, "last_login", row.last_login.as_deref())?;
    let password_changed_at = optional_timestamp(
        USER,
        row.id,
        "password_changed_at",
        row.password_changed_at.as_deref(),
    )?;
    let properties = Properties::new()
        .with("id", row.id)
        .with("username", row.username.clone())
        .with("email", row.email.clone())
        .with("password_hash", row.password_hash.clone())
        .with("is_admin", row.is_admin)
        .with("is_active", row.is_active)
        .with("share_current_reading", row.share_current_reading)
        .with("share_reading_activity", row.share_reading_activity)
        .with("share_library", row.share_library)
        .with("created_at", created_at)
        .with("failed_login_attempts", row.failed_login_attempts)
        .with("locked_until", locked_until)
        .with("last_login", last_login)
        .with("password_must_change", row.password_must_change)
        .with("password_changed_at", password_changed_at)
        .with("reading_streak_offset", row.reading_streak_offset);

    Ok(NodeDescriptor {
        label: USER,
        id: row.id,
        properties,
    })
}

/// Map a book row.
pub fn map_book(row: &BookRow) -> Result<NodeDescriptor, MigrationError> {
    check_id(BOOK, row.id, "id", Some(row.id))?;
    check_id(BOOK, row.id, "user_id", row.user_id)?;
    let title = row
        .title
        .clone()
        .ok_or_else(|| MigrationError::field(BOOK, row.id, "title", "is required"))?;

    let status = match row.reading_status.as_deref() {
        Some(raw) => ReadingStatus::parse(raw).ok_or_else(|| {
            MigrationError::field(
                BOOK,
                row.id,
                "reading_status",
                format!("has unknown value {raw:?}"),
            )
        })?,
        None => ReadingStatus::derive(row),
    };
    let start_date = optional_date(BOOK, row.id, "start_date", row.start_date.as_deref())?;
    let finish_date = optional_date(BOOK, row.id, "finish_date", row.finish_date.as_deref())?;
    let created_at = optional_timestamp(BOOK, row.id, "created_at", row.created_at.as_deref())?;

    let properties = Properties::new()
        .with("id", row.id)
        .with("title", title)
        .with("author", row.author.clone())
        .with("isbn", row.isbn.clone())
        .with("reading_status", status.as_str())
        .with("start_date", start_date)
        .with("finish_date", finish_date)
        .with("want_to_read", row.want_to_read)
        .with("library_only", row.library_only)
        .with("uid", row.uid.clone())
        .with("cover_url", row.cover_url.clone())
        .with("description", row.description.clone())
        .with("published_date", row.published_date.clone())
        .with("page_count", row.page_count)
        .with("categories", row.categories.clone())
        .with("publisher", row.publisher.clone())
        .with("language", row.language.clone())
        .with("average_rating", row.average_rating)
        .with("rating_count", row.rating_count)
        .with("created_at", created_at);

    Ok(NodeDescriptor {
        label: BOOK,
        id: row.id,
        properties,
    })
}

/// Map a reading log row.
pub fn map_reading_log(row: &ReadingLogRow) -> Result<NodeDescriptor, MigrationError> {
    check_id(READING_LOG, row.id, "id", Some(row.id))?;
    check_id(READING_LOG, row.id, "book_id", row.book_id)?;
    check_id(READING_LOG, row.id, "user_id", row.user_id)?;
    let date = match optional_date(READING_LOG, row.id, "date", row.date.as_deref())? {
        Value::Null => {
            return Err(MigrationError::field(READING_LOG, row.id, "date", "is required"));
        }
        date => date,
    };

    let created_at =
        optional_timestamp(READING_LOG, row.id, "created_at", row.created_at.as_deref())?;

    let properties = Properties::new()
        .with("id", row.id)
        .with("date", date)
        .with("notes", row.notes.clone())
        .with("pages_read", row.pages_read)
        .with("minutes_read", row.minutes_read)
        .with("created_at", created_at);

    Ok(NodeDescriptor {
        label: READING_LOG,
        id: row.id,
        properties,
    })
}

/// OWNS edge implied by a book's owning user.
pub fn owns_edge(row: &BookRow, seen: &SeenIds) -> Result<EdgeDescriptor, MigrationError> {
    let user_id = check_id(BOOK, row.id, "user_id", row.user_id)?;
    edge(OWNS, (BOOK, row.id), (USER, user_id), (BOOK, row.id), seen)
}

/// LOGGED edge implied by a reading log's user.
pub fn logged_edge(row: &ReadingLogRow, seen: &SeenIds) -> Result<EdgeDescriptor, MigrationError> {
    let user_id = check_id(READING_LOG, row.id, "user_id", row.user_id)?;
    edge(
        LOGGED,
        (READING_LOG, row.id),
        (USER, user_id),
        (READING_LOG, row.id),
        seen,
    )
}

/// READ_ON edge implied by a reading log's book.
pub fn read_on_edge(row: &ReadingLogRow, seen: &SeenIds) -> Result<EdgeDescriptor, MigrationError> {
    let book_id = check_id(READING_LOG, row.id, "book_id", row.book_id)?;
    edge(
        READ_ON,
        (READING_LOG, row.id),
        (BOOK, book_id),
        (READING_LOG, row.id),
        seen,
    )
}

fn edge(
    edge_type: &'static str,
    referrer: (&str, i64),
    from: (&str, i64),
    to: (&str, i64),
    seen: &SeenIds,
) -> Result<EdgeDescriptor, MigrationError> {
    for (label, id) in [from, to] {
        if !seen.contains(label, id) {
            return Err(MigrationError::DanglingReference {
                entity: referrer.0.to_string(),
                id: referrer.1,
                relation: edge_type.to_string(),
                target_entity: label.to_string(),
                target_id: id,
            });
        }
    }
    Ok(EdgeDescriptor {
        edge_type,
        from: from.1,
        to: to.1,
    })
}

fn check_id(
    entity: &str,
    row_id: i64,
    field: &str,
    value: Option<i64>,
) -> Result<i64, MigrationError> {
    match value {
        None => Err(MigrationError::field(entity, row_id, field, "is required")),
        Some(v) if v < 1 => Err(MigrationError::field(
            entity,
            row_id,
            field,
            format!("is out of range: {v}"),
        )),
        Some(v) => Ok(v),
    }
}

fn optional_date(
    entity: &str,
    id: i64,
    field: &str,
    raw: Option<&str>,
) -> Result<Value, MigrationError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(Value::Null),
        Some(s) => parse_date(s).map(Value::Date).ok_or_else(|| {
            MigrationError::field(entity, id, field, format!("is not a date: {s:?}"))
        }),
    }
}

fn optional_timestamp(
    entity: &str,
    id: i64,
    field: &str,
    raw: Option<&str>,
) -> Result<Value, MigrationError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(Value::Null),
        Some(s) => parse_timestamp(s).map(Value::Timestamp).ok_or_else(|| {
            MigrationError::field(entity, id, field, format!("is not a timestamp: {s:?}"))
        }),
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse a calendar date into days since the Unix epoch.
///
/// Accepts `YYYY-MM-DD` and the date part of the datetime forms SQLite
/// layouts store.
pub fn parse_date(raw: &str) -> Option<i32> {
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(raw).map(|dt| dt.date()))?;
    Some(date.num_days_from_ce() - EPOCH_DAYS_FROM_CE)
}

/// Parse a timestamp into microseconds since the Unix epoch, UTC.
///
/// Naive values are taken as UTC; a bare date means midnight.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    if let Some(dt) = parse_datetime(raw) {
        return Some(dt.and_utc().timestamp_micros());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_micros())
}

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}
