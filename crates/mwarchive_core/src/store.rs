use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tempfile::NamedTempFile;

use crate::error::{StorageError, StorageResult};
use crate::mediawiki::{PageContent, PageRef};

const PAGES_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pages (
    page_id INTEGER PRIMARY KEY,
    namespace INTEGER NOT NULL,
    title TEXT NOT NULL,
    text TEXT NOT NULL,
    rev_id INTEGER,
    parent_id INTEGER,
    rev_timestamp TEXT,
    rev_sha1 TEXT,
    rev_size INTEGER,
    content_model TEXT,
    content_format TEXT,
    retrieved_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pages_namespace_title ON pages(namespace, title);
"#;

/// NAME_MAX on common filesystems, in bytes.
const MAX_FILENAME_BYTES: usize = 255;

/// Durable destination for fetched pages.
pub trait Persister {
    /// True when the page is already stored and must not be fetched again.
    fn is_archived(&self, namespace: i32, page: &PageRef) -> StorageResult<bool>;

    fn persist(
        &mut self,
        namespace: i32,
        page: &PageRef,
        content: &PageContent,
    ) -> StorageResult<PersistOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistOutcome {
    Written,
    AlreadyPresent,
}

/// A page row as stored by [`SqliteStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub content: PageContent,
    pub retrieved_at: String,
}

/// Upsert-by-key backend: one row per page id, every column replaced on rewrite.
pub struct SqliteStore {
    connection: Connection,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> StorageResult<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(StorageError::io(
                "create database parent directory",
                parent.to_path_buf(),
            ))?;
        }
        let connection = Connection::open(db_path)
            .map_err(StorageError::sqlite("opening the archive database"))?;
        Self::from_connection(connection)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        let connection = Connection::open_in_memory()
            .map_err(StorageError::sqlite("opening an in-memory database"))?;
        Self::from_connection(connection)
    }

    fn from_connection(connection: Connection) -> StorageResult<Self> {
        connection
            .busy_timeout(Duration::from_secs(5))
            .map_err(StorageError::sqlite("setting the busy timeout"))?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(StorageError::sqlite("enabling WAL journal mode"))?;
        connection
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(StorageError::sqlite("enabling foreign keys"))?;
        connection
            .execute_batch(PAGES_SCHEMA_SQL)
            .map_err(StorageError::sqlite("initializing the pages schema"))?;
        Ok(Self { connection })
    }

    pub fn load(&self, page_id: i64) -> StorageResult<Option<ArchiveRecord>> {
        self.connection
            .query_row(
                "SELECT page_id, namespace, title, text, rev_id, parent_id, rev_timestamp,
                        rev_sha1, rev_size, content_model, content_format, retrieved_at
                 FROM pages WHERE page_id = ?1",
                [page_id],
                |row| {
                    Ok(ArchiveRecord {
                        content: PageContent {
                            page_id: row.get(0)?,
                            namespace: row.get(1)?,
                            title: row.get(2)?,
                            text: row.get(3)?,
                            revision_id: row.get::<_, Option<i64>>(4)?.unwrap_or_default(),
                            parent_revision_id: row.get::<_, Option<i64>>(5)?.unwrap_or_default(),
                            timestamp: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
                            sha1: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
                            size_bytes: row.get::<_, Option<i64>>(8)?.unwrap_or_default(),
                            content_model: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                            content_format: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
                        },
                        retrieved_at: row.get(11)?,
                    })
                },
            )
            .optional()
            .map_err(StorageError::sqlite("reading an archived page"))
    }

    pub fn count(&self) -> StorageResult<usize> {
        let count: i64 = self
            .connection
            .query_row("SELECT COUNT(*) FROM pages", [], |row| row.get(0))
            .map_err(StorageError::sqlite("counting archived pages"))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

impl Persister for SqliteStore {
    fn is_archived(&self, _namespace: i32, _page: &PageRef) -> StorageResult<bool> {
        Ok(false)
    }

    fn persist(
        &mut self,
        namespace: i32,
        _page: &PageRef,
        content: &PageContent,
    ) -> StorageResult<PersistOutcome> {
        self.connection
            .execute(
                "INSERT INTO pages (
                    page_id, namespace, title, text, rev_id, parent_id,
                    rev_timestamp, rev_sha1, rev_size, content_model, content_format, retrieved_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                ON CONFLICT(page_id) DO UPDATE SET
                    namespace = excluded.namespace,
                    title = excluded.title,
                    text = excluded.text,
                    rev_id = excluded.rev_id,
                    parent_id = excluded.parent_id,
                    rev_timestamp = excluded.rev_timestamp,
                    rev_sha1 = excluded.rev_sha1,
                    rev_size = excluded.rev_size,
                    content_model = excluded.content_model,
                    content_format = excluded.content_format,
                    retrieved_at = excluded.retrieved_at",
                params![
                    content.page_id,
                    namespace,
                    content.title,
                    content.text,
                    content.revision_id,
                    content.parent_revision_id,
                    content.timestamp,
                    content.sha1,
                    content.size_bytes,
                    content.content_model,
                    content.content_format,
                    retrieved_at_now(),
                ],
            )
            .map_err(StorageError::sqlite("upserting an archived page"))?;
        Ok(PersistOutcome::Written)
    }
}

/// Write-once file tree: `<root>/namespace_<ns>/<pageid>_<title>.txt`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Long titles are cut on a char boundary so the filename fits in
    /// `MAX_FILENAME_BYTES`.
    pub fn path_for(&self, namespace: i32, page: &PageRef) -> PathBuf {
        let prefix = format!("{}_", page.page_id);
        let budget = MAX_FILENAME_BYTES.saturating_sub(prefix.len() + ".txt".len());
        let sanitized = sanitize_title(&page.title);
        let fragment = truncate_to_bytes(&sanitized, budget).trim_end_matches(['_', '.']);
        let filename = if fragment.is_empty() {
            format!("{}.txt", page.page_id)
        } else {
            format!("{prefix}{fragment}.txt")
        };
        self.root
            .join(format!("namespace_{namespace}"))
            .join(filename)
    }
}

impl Persister for FileStore {
    fn is_archived(&self, namespace: i32, page: &PageRef) -> StorageResult<bool> {
        let path = self.path_for(namespace, page);
        path.try_exists().map_err(StorageError::io("check", path))
    }

    fn persist(
        &mut self,
        namespace: i32,
        page: &PageRef,
        content: &PageContent,
    ) -> StorageResult<PersistOutcome> {
        let path = self.path_for(namespace, page);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(StorageError::io("create directory", parent.to_path_buf()))?;
        }

        let rendered = format!("Title: {}\n\n{}", content.title, content.text);
        write_once(&path, |file| file.write_all(rendered.as_bytes()))
    }
}

/// Fill a sibling temp file, then move it into place without replacing an
/// existing file. A failed write never leaves anything at `path`.
fn write_once<F>(path: &Path, fill: F) -> StorageResult<PersistOutcome>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut staged = NamedTempFile::new_in(parent)
        .map_err(StorageError::io("create temp file in", parent.to_path_buf()))?;
    fill(staged.as_file_mut()).map_err(StorageError::io("write", path.to_path_buf()))?;
    staged
        .as_file()
        .sync_all()
        .map_err(StorageError::io("sync", path.to_path_buf()))?;

    match staged.persist_noclobber(path) {
        Ok(_) => Ok(PersistOutcome::Written),
        Err(error) if error.error.kind() == ErrorKind::AlreadyExists => {
            Ok(PersistOutcome::AlreadyPresent)
        }
        Err(error) => Err(StorageError::io("create", path.to_path_buf())(error.error)),
    }
}

fn truncate_to_bytes(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Filename-safe form of a page title: spaces become underscores, every run of
/// characters outside letters, digits, `_`, `.` and `-` collapses to one
/// underscore, and leading/trailing underscores and periods are trimmed.
pub fn sanitize_title(title: &str) -> String {
    let mut output = String::with_capacity(title.len());
    let mut in_disallowed_run = false;
    for ch in title.chars() {
        if ch == ' ' {
            output.push('_');
            in_disallowed_run = false;
        } else if ch.is_alphanumeric() || matches!(ch, '_' | '.' | '-') {
            output.push(ch);
            in_disallowed_run = false;
        } else if !in_disallowed_run {
            output.push('_');
            in_disallowed_run = true;
        }
    }
    output.trim_matches(|ch| ch == '_' || ch == '.').to_string()
}

fn retrieved_at_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{self, Write};

    use chrono::DateTime;
    use tempfile::tempdir;

    use super::{
        FileStore, MAX_FILENAME_BYTES, PersistOutcome, Persister, SqliteStore, sanitize_title,
        write_once,
    };
    use crate::mediawiki::{PageContent, PageRef};

    fn page_ref(page_id: i64, title: &str) -> PageRef {
        PageRef {
            page_id,
            title: title.to_string(),
            namespace: 0,
        }
    }

    fn content(page_id: i64, title: &str, text: &str, revision_id: i64) -> PageContent {
        PageContent {
            page_id,
            namespace: 0,
            title: title.to_string(),
            text: text.to_string(),
            revision_id,
            parent_revision_id: revision_id - 1,
            timestamp: "2026-02-19T00:00:00Z".to_string(),
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
            size_bytes: i64::try_from(text.len()).expect("size"),
            content_model: "wikitext".to_string(),
            content_format: "text/x-wiki".to_string(),
        }
    }

    #[test]
    fn sanitize_title_examples() {
        assert_eq!(sanitize_title(" Test:Page "), "Test_Page");
        assert_eq!(sanitize_title("Foo Bar/Baz?"), "Foo_Bar_Baz");
        assert_eq!(sanitize_title("..Ünïcode 東京 v1.2-beta.."), "Ünïcode_東京_v1.2-beta");
        assert_eq!(sanitize_title("???"), "");
    }

    #[test]
    fn sqlite_upsert_keeps_one_row_with_latest_values() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("data").join("archive.db");
        let mut store = SqliteStore::open(&db_path).expect("open store");
        let page = page_ref(42, "Alpha");

        store
            .persist(0, &page, &content(42, "Alpha", "first", 10))
            .expect("first write");
        let outcome = store
            .persist(4, &page, &content(42, "Alpha renamed", "second", 11))
            .expect("second write");

        assert_eq!(outcome, PersistOutcome::Written);
        assert_eq!(store.count().expect("count"), 1);
        let record = store.load(42).expect("load").expect("row exists");
        assert_eq!(record.content.namespace, 4);
        assert_eq!(record.content.title, "Alpha renamed");
        assert_eq!(record.content.text, "second");
        assert_eq!(record.content.revision_id, 11);
        assert_eq!(record.content.parent_revision_id, 10);
        assert!(record.retrieved_at.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(&record.retrieved_at).is_ok());
    }

    #[test]
    fn sqlite_store_never_reports_pages_as_archived() {
        let mut store = SqliteStore::open_in_memory().expect("open store");
        let page = page_ref(1, "Alpha");
        store
            .persist(0, &page, &content(1, "Alpha", "body", 2))
            .expect("write");
        assert!(!store.is_archived(0, &page).expect("check"));
    }

    #[test]
    fn file_store_writes_title_header_and_text() {
        let temp = tempdir().expect("tempdir");
        let mut store = FileStore::new(temp.path());
        let page = page_ref(7, "Help:Getting started");

        let outcome = store
            .persist(12, &page, &content(7, "Help:Getting started", "Body text", 3))
            .expect("write");

        assert_eq!(outcome, PersistOutcome::Written);
        let path = temp
            .path()
            .join("namespace_12")
            .join("7_Help_Getting_started.txt");
        assert_eq!(store.path_for(12, &page), path);
        assert_eq!(
            fs::read_to_string(path).expect("read"),
            "Title: Help:Getting started\n\nBody text"
        );
    }

    #[test]
    fn file_store_is_first_write_wins() {
        let temp = tempdir().expect("tempdir");
        let mut store = FileStore::new(temp.path());
        let page = page_ref(5, "Beta");
        assert!(!store.is_archived(0, &page).expect("check"));

        store
            .persist(0, &page, &content(5, "Beta", "original", 1))
            .expect("first write");
        let outcome = store
            .persist(0, &page, &content(5, "Beta", "changed", 2))
            .expect("second write");

        assert_eq!(outcome, PersistOutcome::AlreadyPresent);
        assert!(store.is_archived(0, &page).expect("check"));
        let path = store.path_for(0, &page);
        assert_eq!(
            fs::read_to_string(path).expect("read"),
            "Title: Beta\n\noriginal"
        );
    }

    #[test]
    fn file_store_falls_back_to_page_id_for_unprintable_titles() {
        let temp = tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());
        let path = store.path_for(0, &page_ref(99, "???"));
        assert_eq!(path, temp.path().join("namespace_0").join("99.txt"));
    }

    #[test]
    fn file_store_caps_long_titles_at_the_filename_limit() {
        let temp = tempdir().expect("tempdir");
        let mut store = FileStore::new(temp.path());

        let ascii = page_ref(123456, &"a".repeat(255));
        let path = store.path_for(0, &ascii);
        let name = path.file_name().and_then(|name| name.to_str()).expect("name");
        assert_eq!(name.len(), MAX_FILENAME_BYTES);
        assert!(name.starts_with("123456_aaa"));
        assert!(name.ends_with("a.txt"));
        assert_eq!(
            store
                .persist(0, &ascii, &content(123456, &ascii.title, "long", 1))
                .expect("write"),
            PersistOutcome::Written
        );
        assert!(store.is_archived(0, &ascii).expect("check"));

        let wide = page_ref(8, &"東".repeat(100));
        let path = store.path_for(0, &wide);
        let name = path.file_name().and_then(|name| name.to_str()).expect("name");
        assert!(name.len() <= MAX_FILENAME_BYTES);
        assert!(name.starts_with("8_東"));
        assert_eq!(path, store.path_for(0, &wide));
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("3_Gamma.txt");

        let error = write_once(&path, |file| {
            file.write_all(b"Title: Gam")?;
            Err(io::Error::other("disk full"))
        })
        .expect_err("write must fail");

        assert!(error.to_string().contains("disk full"));
        assert!(!path.exists());
        assert_eq!(fs::read_dir(temp.path()).expect("read dir").count(), 0);

        let outcome = write_once(&path, |file| file.write_all(b"Title: Gamma\n\nbody"))
            .expect("retry write");
        assert_eq!(outcome, PersistOutcome::Written);
        assert_eq!(
            fs::read_to_string(&path).expect("read"),
            "Title: Gamma\n\nbody"
        );
    }

    #[test]
    fn existence_check_surfaces_io_errors() {
        let temp = tempdir().expect("tempdir");
        let not_a_dir = temp.path().join("archive");
        fs::write(&not_a_dir, "plain file").expect("seed");
        let store = FileStore::new(&not_a_dir);

        let error = store
            .is_archived(0, &page_ref(1, "Alpha"))
            .expect_err("check must fail");

        assert!(error.to_string().contains("failed to check"));
    }

    #[test]
    fn write_once_keeps_an_existing_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("4_Delta.txt");
        fs::write(&path, "first").expect("seed");

        let outcome = write_once(&path, |file| file.write_all(b"second")).expect("write");

        assert_eq!(outcome, PersistOutcome::AlreadyPresent);
        assert_eq!(fs::read_to_string(&path).expect("read"), "first");
        assert_eq!(fs::read_dir(temp.path()).expect("read dir").count(), 1);
    }
}
