//! End-to-end migration runs against SQLite fixtures.

use std::fs;
use std::path::PathBuf;

use rusqlite::{params, Connection};
use shelfgraph_migrate::backup::sha256_file;
use shelfgraph_migrate::mapper::{graph_schema, BOOK, LOGGED, OWNS, READING_LOG, READ_ON, USER};
use shelfgraph_migrate::{
    BackupArtifact, BackupManager, ErrorKind, MigrationConfig, MigrationObserver,
    MigrationOrchestrator, Outcome, Phase,
};
use shelfgraph_store::{CollectionSummary, GraphStore, Properties, StoreConfig, Value};

const SCHEMA: &str = r#"
    CREATE TABLE user (
        id INTEGER PRIMARY KEY,
        username TEXT NOT NULL,
        email TEXT,
        password_hash TEXT,
        is_admin BOOLEAN DEFAULT 0,
        is_active BOOLEAN DEFAULT 1,
        share_current_reading BOOLEAN DEFAULT 1,
        share_reading_activity BOOLEAN DEFAULT 1,
        share_library BOOLEAN DEFAULT 0,
        created_at DATETIME,
        failed_login_attempts INTEGER DEFAULT 0,
        locked_until DATETIME,
        last_login DATETIME,
        password_must_change BOOLEAN DEFAULT 0,
        password_changed_at DATETIME,
        reading_streak_offset INTEGER DEFAULT 0
    );
    CREATE TABLE book (
        id INTEGER PRIMARY KEY,
        user_id INTEGER,
        title TEXT NOT NULL,
        author TEXT,
        isbn TEXT,
        reading_status TEXT,
        want_to_read BOOLEAN,
        library_only BOOLEAN,
        start_date DATE,
        finish_date DATE,
        uid TEXT,
        cover_url TEXT,
        description TEXT,
        published_date TEXT,
        page_count INTEGER,
        categories TEXT,
        publisher TEXT,
        language TEXT,
        average_rating REAL,
        rating_count INTEGER,
        created_at DATETIME
    );
    CREATE TABLE reading_log (
        id INTEGER PRIMARY KEY,
        book_id INTEGER,
        user_id INTEGER,
        date DATE NOT NULL,
        notes TEXT,
        pages_read INTEGER,
        minutes_read INTEGER,
        created_at DATETIME
    );
"#;

struct Library {
    dir: tempfile::TempDir,
    source: PathBuf,
}

impl Library {
    /// `users` users, `books` books owned round-robin, `logs` logs spread
    /// over the books and logged by each book's owner.
    fn new(users: i64, books: i64, logs: i64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("books.db");
        let conn = Connection::open(&source).unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        for id in 1..=users {
            conn.execute(
                "INSERT INTO user (id, username, email, password_hash, is_admin, created_at)
                 VALUES (?1, ?2, ?3, 'pbkdf2:sha256$x', ?4, '2024-01-01 10:00:00')",
                params![id, format!("reader{id}"), format!("r{id}@example.com"), id == 1],
            )
            .unwrap();
        }
        let statuses = ["read", "reading", "plan_to_read", "on_hold", "library_only"];
        for id in 1..=books {
            let status = statuses[(id as usize - 1) % statuses.len()];
            let finish: Option<&str> = (status == "read").then_some("2024-02-10");
            conn.execute(
                "INSERT INTO book (id, user_id, title, author, reading_status, start_date, finish_date)
                 VALUES (?1, ?2, ?3, 'Anon', ?4, '2024-01-05', ?5)",
                params![id, owner(id, users), format!("Book {id}"), status, finish],
            )
            .unwrap();
        }
        for id in 1..=logs {
            let book = (id - 1) % books + 1;
            conn.execute(
                "INSERT INTO reading_log (id, book_id, user_id, date, notes, pages_read)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    book,
                    owner(book, users),
                    format!("2024-03-{:02}", id),
                    format!("session {id}"),
                    id * 10
                ],
            )
            .unwrap();
        }

        Self { dir, source }
    }

    /// Runs with foreign key enforcement off so fixtures can hold orphans.
    fn execute(&self, sql: &str) {
        let conn = Connection::open(&self.source).unwrap();
        conn.execute_batch("PRAGMA foreign_keys = OFF;").unwrap();
        conn.execute_batch(sql).unwrap();
    }

    fn target(&self) -> PathBuf {
        self.dir.path().join("graph")
    }

    fn config(&self) -> MigrationConfig {
        MigrationConfig::new(&self.source, self.target())
            .with_backup_dir(self.dir.path().join("backups"))
            .with_batch_size(4)
            .with_sample_size(3)
    }

    fn run(&self) -> Outcome {
        MigrationOrchestrator::new(self.config()).run()
    }

    fn open_target(&self) -> GraphStore {
        GraphStore::open(StoreConfig::new(self.target())).unwrap()
    }
}

fn owner(book: i64, users: i64) -> i64 {
    (book - 1) % users + 1
}

fn phases(outcome: &Outcome) -> Vec<String> {
    outcome
        .report
        .transitions
        .iter()
        .map(|t| match &t.phase {
            Phase::Failed(_) => "Failed".to_string(),
            Phase::RolledBack(_) => "RolledBack".to_string(),
            other => other.to_string(),
        })
        .collect()
}

#[test]
fn test_small_library_migrates() {
    let library = Library::new(3, 5, 10);
    let outcome = library.run();

    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        phases(&outcome),
        vec!["BackingUp", "Reading", "WritingNodes", "WritingEdges", "Verifying", "Succeeded"]
    );

    let report = &outcome.report;
    assert_eq!(report.nodes(USER), Some(3));
    assert_eq!(report.nodes(BOOK), Some(5));
    assert_eq!(report.nodes(READING_LOG), Some(10));
    assert_eq!(report.edges(OWNS), Some(5));
    assert_eq!(report.edges(LOGGED), Some(10));
    assert_eq!(report.edges(READ_ON), Some(10));
    assert!(report.verification.as_ref().unwrap().sampled > 0);

    let store = library.open_target();
    assert_eq!(store.count_nodes(USER).unwrap(), 3);
    assert_eq!(store.count_nodes(BOOK).unwrap(), 5);
    assert_eq!(store.count_nodes(READING_LOG).unwrap(), 10);
    assert_eq!(store.count_edges(OWNS).unwrap(), 5);
    assert_eq!(store.count_edges(LOGGED).unwrap(), 10);
    assert_eq!(store.count_edges(READ_ON).unwrap(), 10);
    assert!(store.contains_edge(OWNS, 2, 5).unwrap());
    assert!(store.contains_edge(READ_ON, 5, 10).unwrap());
    assert!(store.completion().unwrap().is_some());

    let book = store.get_node(BOOK, 1).unwrap().unwrap();
    assert_eq!(
        book.properties.get("reading_status").and_then(|v| v.as_str()),
        Some("read")
    );
}

#[test]
fn test_dangling_owner_rolls_back_to_absent_target() {
    let library = Library::new(3, 5, 10);
    library.execute("INSERT INTO book (id, user_id, title) VALUES (6, 99, 'Orphan')");
    let digest = sha256_file(&library.source).unwrap();

    let outcome = library.run();
    let err = outcome.error.as_ref().unwrap();
    assert_eq!(err.kind(), ErrorKind::DanglingReference);
    assert!(err.to_string().contains("Book 6"), "{err}");
    assert!(matches!(outcome.report.final_phase, Phase::RolledBack(_)));
    assert_eq!(outcome.exit_code(), 3);

    assert!(!library.target().exists());
    assert_eq!(sha256_file(&library.source).unwrap(), digest);
    let backup = outcome.report.backup.as_ref().unwrap();
    assert_eq!(backup.manifest.sha256, digest);
}

#[test]
fn test_catalogue_columns_are_carried_over() {
    let library = Library::new(1, 1, 1);
    library.execute(
        "UPDATE user SET last_login = '2024-05-01 08:30:00', failed_login_attempts = 2,
                         password_must_change = 1, reading_streak_offset = 3 WHERE id = 1;
         UPDATE book SET uid = 'b-1', cover_url = 'https://covers.example/1.jpg',
                         description = 'A desert planet.', published_date = '1965',
                         page_count = 412, categories = 'Fiction, Science Fiction',
                         publisher = 'Chilton', language = 'en', average_rating = 4.25,
                         rating_count = 17, want_to_read = 0, library_only = 1,
                         created_at = '2024-01-02T03:04:05Z' WHERE id = 1;
         UPDATE reading_log SET created_at = '2024-03-01 21:00:00' WHERE id = 1;",
    );

    let outcome = library.run();
    assert!(outcome.error.is_none(), "{:?}", outcome.error);

    let store = library.open_target();
    let user = store.get_node(USER, 1).unwrap().unwrap().properties;
    assert_eq!(user.get("failed_login_attempts"), Some(&Value::Int64(2)));
    assert_eq!(user.get("password_must_change"), Some(&Value::Bool(true)));
    assert_eq!(user.get("reading_streak_offset"), Some(&Value::Int64(3)));
    assert!(matches!(user.get("last_login"), Some(Value::Timestamp(_))));
    assert_eq!(user.get("locked_until"), Some(&Value::Null));

    let book = store.get_node(BOOK, 1).unwrap().unwrap().properties;
    assert_eq!(book.get("uid"), Some(&Value::from("b-1")));
    assert_eq!(book.get("cover_url"), Some(&Value::from("https://covers.example/1.jpg")));
    assert_eq!(book.get("description"), Some(&Value::from("A desert planet.")));
    assert_eq!(book.get("published_date"), Some(&Value::from("1965")));
    assert_eq!(book.get("page_count"), Some(&Value::Int64(412)));
    assert_eq!(book.get("categories"), Some(&Value::from("Fiction, Science Fiction")));
    assert_eq!(book.get("publisher"), Some(&Value::from("Chilton")));
    assert_eq!(book.get("language"), Some(&Value::from("en")));
    assert_eq!(book.get("average_rating"), Some(&Value::Float64(4.25)));
    assert_eq!(book.get("rating_count"), Some(&Value::Int64(17)));
    assert_eq!(book.get("want_to_read"), Some(&Value::Bool(false)));
    assert_eq!(book.get("library_only"), Some(&Value::Bool(true)));
    assert_eq!(book.get("created_at"), Some(&Value::Timestamp(1_704_164_645_000_000)));

    let log = store.get_node(READING_LOG, 1).unwrap().unwrap().properties;
    assert!(matches!(log.get("created_at"), Some(Value::Timestamp(_))));
}

#[test]
fn test_value_in_unknown_column_fails_mapping() {
    let library = Library::new(2, 3, 3);
    library.execute(
        "ALTER TABLE book ADD COLUMN shelf TEXT;
         UPDATE book SET shelf = 'hallway' WHERE id = 2;",
    );

    let outcome = library.run();
    let err = outcome.error.as_ref().unwrap();
    assert_eq!(err.kind(), ErrorKind::FieldMappingError);
    assert!(err.to_string().contains("Book 2"), "{err}");
    assert!(err.to_string().contains("shelf"), "{err}");
    assert_eq!(outcome.exit_code(), 3);
    assert!(!library.target().exists());

    let layout = outcome.report.source_layout.as_ref().unwrap();
    assert_eq!(layout.table("book").unwrap().unmapped, vec!["shelf".to_string()]);
}

#[test]
fn test_empty_unknown_column_is_tolerated() {
    let library = Library::new(2, 3, 3);
    library.execute("ALTER TABLE reading_log ADD COLUMN mood TEXT;");

    let outcome = library.run();
    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(outcome.report.nodes(READING_LOG), Some(3));
}

/// Deletes one reading log node once every collection has been written.
struct DropReadingLog(i64);

impl MigrationObserver for DropReadingLog {
    fn on_collection_committed(&mut self, summary: &CollectionSummary, store: &GraphStore) {
        if summary.collection == READ_ON {
            assert!(store.remove_node(READING_LOG, self.0).unwrap());
        }
    }
}

#[test]
fn test_missing_node_fails_verification() {
    let library = Library::new(3, 5, 10);
    let outcome = MigrationOrchestrator::new(library.config())
        .with_observer(DropReadingLog(7))
        .run();

    let err = outcome.error.as_ref().unwrap();
    assert_eq!(err.kind(), ErrorKind::VerificationFailure);
    let message = err.to_string();
    assert!(message.contains("ReadingLog nodes: source 10, target 9, missing ids 7"), "{message}");
    assert!(matches!(outcome.report.final_phase, Phase::RolledBack(_)));
    assert_eq!(outcome.exit_code(), 3);
    assert_eq!(phases(&outcome).last().unwrap(), "RolledBack");
    assert!(!library.target().exists());
}

#[test]
fn test_rerun_is_noop() {
    let library = Library::new(3, 5, 10);
    let first = library.run();
    assert_eq!(first.exit_code(), 0);
    assert!(first.report.previous_run.is_none());

    let second = library.run();
    assert!(second.error.is_none(), "{:?}", second.error);
    assert_eq!(second.report.written(), 0);
    let previous = second.report.previous_run.as_ref().unwrap();
    assert_eq!(
        previous.source_sha256,
        first.report.backup.as_ref().unwrap().manifest.sha256
    );
    assert_eq!(second.report.nodes(READING_LOG), Some(10));
    assert_eq!(second.report.edges(OWNS), Some(5));

    let store = library.open_target();
    assert_eq!(store.count_nodes(READING_LOG).unwrap(), 10);
    assert_eq!(store.count_edges(READ_ON).unwrap(), 10);

    // Both runs kept their own backup.
    let backups = fs::read_dir(library.dir.path().join("backups"))
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name();
            name.to_string_lossy().ends_with(".db")
        })
        .count();
    assert_eq!(backups, 2);
}

#[test]
fn test_changed_row_collides_and_restores_target() {
    let library = Library::new(3, 5, 10);
    assert_eq!(library.run().exit_code(), 0);

    library.execute(
        "UPDATE book SET title = 'Retitled' WHERE id = 2;
         INSERT INTO user (id, username) VALUES (4, 'late');",
    );
    let outcome = library.run();
    let err = outcome.error.as_ref().unwrap();
    assert_eq!(err.kind(), ErrorKind::IdentifierCollision);
    assert!(err.to_string().contains("Book 2"), "{err}");
    assert_eq!(outcome.exit_code(), 3);

    // The user added by the failed run is gone; the rest is untouched.
    let store = library.open_target();
    assert_eq!(store.count_nodes(USER).unwrap(), 3);
    assert!(!store.contains_node(USER, 4).unwrap());
    let book = store.get_node(BOOK, 2).unwrap().unwrap();
    assert_eq!(book.properties.get("title").and_then(|v| v.as_str()), Some("Book 2"));
    assert!(store.completion().unwrap().is_some());
}

#[test]
fn test_incomplete_target_is_rebuilt() {
    let library = Library::new(3, 5, 10);
    {
        let store = library.open_target();
        store.declare_schema(&graph_schema()).unwrap();
        let mut users = store.begin_nodes(USER, 10).unwrap();
        users
            .put(42, Properties::new().with("id", 42i64).with("username", "stale"))
            .unwrap();
        users.commit().unwrap();
        store.flush().unwrap();
    }

    let outcome = library.run();
    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    let store = library.open_target();
    assert!(!store.contains_node(USER, 42).unwrap());
    assert_eq!(store.count_nodes(USER).unwrap(), 3);
}

#[test]
fn test_foreign_target_is_unavailable() {
    let library = Library::new(1, 1, 1);
    fs::create_dir_all(library.target()).unwrap();
    fs::write(library.target().join("notes.txt"), b"keep me").unwrap();

    let outcome = library.run();
    assert_eq!(
        outcome.error.as_ref().map(|e| e.kind()),
        Some(ErrorKind::TargetUnavailable)
    );
    assert!(matches!(outcome.report.final_phase, Phase::Failed(_)));
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(fs::read(library.target().join("notes.txt")).unwrap(), b"keep me");
}

#[test]
fn test_hot_journal_fails_before_writing() {
    let library = Library::new(1, 1, 1);
    let mut journal = library.source.clone().into_os_string();
    journal.push("-journal");
    fs::write(&journal, b"partial transaction").unwrap();

    let outcome = library.run();
    assert_eq!(
        outcome.error.as_ref().map(|e| e.kind()),
        Some(ErrorKind::SourceCorrupt)
    );
    assert_eq!(outcome.exit_code(), 1);
    assert!(!library.target().exists());
}

#[test]
fn test_empty_target_directory_is_kept_on_rollback() {
    let library = Library::new(2, 2, 2);
    library.execute("UPDATE reading_log SET date = 'someday' WHERE id = 2");
    fs::create_dir_all(library.target()).unwrap();

    let outcome = library.run();
    assert_eq!(
        outcome.error.as_ref().map(|e| e.kind()),
        Some(ErrorKind::FieldMappingError)
    );
    assert_eq!(outcome.exit_code(), 3);
    assert!(library.target().is_dir());
    assert_eq!(fs::read_dir(library.target()).unwrap().count(), 0);
}

#[test]
fn test_backup_reconstructs_source() {
    let library = Library::new(3, 5, 10);
    let outcome = library.run();
    let artifact = outcome.report.backup.clone().unwrap();

    let reloaded = BackupArtifact::load(&artifact.path).unwrap();
    let manager = BackupManager::new(library.dir.path().join("backups"));
    manager.verify(&reloaded).unwrap();

    let restored = library.dir.path().join("restored.db");
    manager.restore(&reloaded, &restored).unwrap();
    assert_eq!(fs::read(&restored).unwrap(), fs::read(&library.source).unwrap());
}

#[test]
fn test_legacy_layout_derives_status() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("legacy.db");
    Connection::open(&source)
        .unwrap()
        .execute_batch(
            "CREATE TABLE user (id INTEGER PRIMARY KEY, username TEXT, password_hash TEXT,
                                is_admin INTEGER, created_at TEXT);
             CREATE TABLE book (id INTEGER PRIMARY KEY, user_id INTEGER, title TEXT,
                                author TEXT, want_to_read INTEGER, library_only INTEGER,
                                start_date TEXT, finish_date TEXT);
             CREATE TABLE reading_log (id INTEGER PRIMARY KEY, book_id INTEGER,
                                       user_id INTEGER, date TEXT, notes TEXT);
             INSERT INTO user (id, username) VALUES (1, 'ada');
             INSERT INTO book (id, user_id, title, want_to_read, library_only, finish_date)
                 VALUES (1, 1, 'Read', 0, 0, '2023-05-01'),
                        (2, 1, 'Shelf', 0, 1, NULL),
                        (3, 1, 'Wish', 1, 0, NULL);
             INSERT INTO reading_log (id, book_id, user_id, date) VALUES (1, 1, 1, '2023-04-30');",
        )
        .unwrap();

    let config = MigrationConfig::new(&source, dir.path().join("graph"))
        .with_backup_dir(dir.path().join("backups"));
    let outcome = MigrationOrchestrator::new(config).run();
    assert!(outcome.error.is_none(), "{:?}", outcome.error);

    let store = GraphStore::open(StoreConfig::new(dir.path().join("graph"))).unwrap();
    let status = |id: i64| {
        store
            .get_node(BOOK, id)
            .unwrap()
            .unwrap()
            .properties
            .get("reading_status")
            .and_then(|v| v.as_str().map(str::to_string))
    };
    assert_eq!(status(1).as_deref(), Some("read"));
    assert_eq!(status(2).as_deref(), Some("library_only"));
    assert_eq!(status(3).as_deref(), Some("plan_to_read"));
}
