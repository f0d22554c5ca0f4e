//! The persistent dedup store: one `SQLite` file per base package holding every distinct
//! accepted text once.

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use textract_bolts::{os::base_package, Error};

/// File name of the store inside the package directory
pub const STORE_FILE_NAME: &str = "text.db";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS text_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    txt TEXT UNIQUE
);";

#[derive(Debug, Default)]
struct StoreInner {
    path: Option<PathBuf>,
    conn: Option<Connection>,
    path_logged: bool,
}

/// Deduplicating text store. All access is serialized behind one lock.
#[derive(Debug)]
pub struct TextStore {
    root: PathBuf,
    inner: Mutex<StoreInner>,
}

/// Where the store of `process_name` lives below `root`
#[must_use]
pub fn store_path(root: &Path, process_name: &str) -> PathBuf {
    root.join(base_package(process_name)).join(STORE_FILE_NAME)
}

impl TextStore {
    /// Create a store that will keep its files below `root`. Nothing is opened until
    /// [`TextStore::init`].
    #[must_use]
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            inner: Mutex::new(StoreInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind the store to `process_name` and open (or create) it. Safe to call on every attach.
    pub fn init(&self, process_name: &str) -> Result<PathBuf, Error> {
        let path = store_path(&self.root, process_name);
        let mut inner = self.lock();
        if inner.path.as_ref() != Some(&path) {
            inner.conn = None;
            inner.path_logged = false;
            inner.path = Some(path.clone());
        }
        Self::ensure_open_locked(&mut inner, true)?;
        Ok(path)
    }

    /// The path this store is bound to, if [`TextStore::init`] was called
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.lock().path.clone()
    }

    fn ensure_open_locked(inner: &mut StoreInner, log_path: bool) -> Result<(), Error> {
        let Some(path) = inner.path.clone() else {
            return Err(Error::illegal_state("text store used before init"));
        };

        if inner.conn.is_some() {
            if log_path && !inner.path_logged {
                log::info!("Text store: {}", path.display());
                inner.path_logged = true;
            }
            return Ok(());
        }

        let existed = path.exists();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(CREATE_TABLE)?;
        inner.conn = Some(conn);

        if log_path {
            log::info!(
                "Text store: {} ({})",
                path.display(),
                if existed { "existing" } else { "created" }
            );
            inner.path_logged = true;
        }
        Ok(())
    }

    fn connection(inner: &mut StoreInner) -> Result<&Connection, Error> {
        Self::ensure_open_locked(inner, false)?;
        inner
            .conn
            .as_ref()
            .ok_or_else(|| Error::illegal_state("text store is not open"))
    }

    fn exists_locked(conn: &Connection, text: &str) -> Result<bool, Error> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM text_log WHERE txt = ?1 LIMIT 1",
                params![text],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Record `text` unless it is empty or already stored.
    /// Returns `true` if a new row was written.
    pub fn insert_if_needed(&self, text: &str) -> Result<bool, Error> {
        if text.is_empty() {
            log::debug!("Skipping insert: empty text");
            return Ok(false);
        }

        let mut inner = self.lock();
        let conn = Self::connection(&mut inner)?;

        if Self::exists_locked(conn, text)? {
            log::debug!("Skipping insert: already stored -> {text}");
            return Ok(false);
        }

        match conn.execute("INSERT INTO text_log(txt) VALUES (?1)", params![text]) {
            Ok(_) => {
                log::info!("Stored new text: {text}");
                Ok(true)
            }
            // Somebody else wrote the same text through another connection.
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                log::debug!("Skipping insert: unique constraint -> {text}");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// `true` if `text` is stored
    pub fn contains(&self, text: &str) -> Result<bool, Error> {
        let mut inner = self.lock();
        let conn = Self::connection(&mut inner)?;
        Self::exists_locked(conn, text)
    }

    /// Number of stored texts
    pub fn count(&self) -> Result<usize, Error> {
        let mut inner = self.lock();
        let conn = Self::connection(&mut inner)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM text_log", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// All stored texts in insertion order
    pub fn texts(&self) -> Result<Vec<String>, Error> {
        let mut inner = self.lock();
        let conn = Self::connection(&mut inner)?;
        let mut stmt = conn.prepare("SELECT txt FROM text_log ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let texts = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(texts)
    }
}
