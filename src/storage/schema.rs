//! SQLite schema creation and versioned upgrades.
//!
//! The schema version lives in the `metadata` table under the `version` key.
//! A fresh database is created at [`SCHEMA_VERSION`]; an older one is backed
//! up next to the database file and then upgraded one version at a time.
//!
//! Table and column names (`projectTags`, `projectId`, `tagId`) follow the
//! layout of the first reef releases so their databases open in place. Text
//! columns are declared TEXT here; older files declare them STRING, which
//! SQLite stores with numeric affinity, so readers must accept numbers where
//! text is expected.

use crate::models::{ARCHIVED_TAG_COLOR, ARCHIVED_TAG_ID, ARCHIVED_TAG_NAME};
use crate::{Error, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use tracing::info;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 2;

/// Upgrade step from `version` to `version + 1`.
type Upgrader = fn(&Connection) -> Result<()>;

fn upgrader_for(version: u32) -> Option<Upgrader> {
    match version {
        1 => Some(upgrade_1_to_2),
        _ => None,
    }
}

/// Bring the database at `db_path` to [`SCHEMA_VERSION`].
pub(crate) fn prepare(conn: &mut Connection, db_path: &Path) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS metadata (key STRING PRIMARY KEY, value STRING)",
        [],
    )?;

    let version = match read_version(conn)? {
        Some(version) => version,
        None => {
            info!(path = %db_path.display(), "creating a new database");
            let tx = conn.transaction()?;
            create_schema(&tx)?;
            tx.commit()?;
            return Ok(());
        }
    };

    info!(version, "database version");

    if version == SCHEMA_VERSION {
        return Ok(());
    }
    if version > SCHEMA_VERSION {
        return Err(Error::Other(format!(
            "Database version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        )));
    }

    let backup = backup_path(db_path, version);
    std::fs::copy(db_path, &backup)?;
    info!(backup = %backup.display(), "backed up database before upgrade");

    let tx = conn.transaction()?;
    for from in version..SCHEMA_VERSION {
        let upgrader = upgrader_for(from).ok_or_else(|| {
            Error::Other(format!(
                "Cannot find database upgrader from version {} to version {}",
                from,
                from + 1
            ))
        })?;
        info!(from, to = from + 1, "upgrading database");
        upgrader(&tx)?;
    }
    write_version(&tx, SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(())
}

/// Read the schema version, `None` for a database that was never initialized.
///
/// The `value` column has no declared text type, so SQLite keeps a numeric
/// version as an INTEGER. Both forms are accepted.
pub(crate) fn read_version(conn: &Connection) -> Result<Option<u32>> {
    let value: Option<Value> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let parsed = match value {
        None => return Ok(None),
        Some(Value::Integer(v)) => u32::try_from(v).ok(),
        Some(Value::Text(ref v)) => v.trim().parse::<u32>().ok(),
        Some(_) => None,
    };
    parsed.map(Some).ok_or_else(|| {
        Error::Other(format!("Unable to parse the version string {:?}", value))
    })
}

fn write_version(conn: &Connection, version: u32) -> Result<()> {
    let updated = conn.execute(
        "UPDATE metadata SET value = ?1 WHERE key = 'version'",
        [version],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES ('version', ?1)",
            [version],
        )?;
    }
    Ok(())
}

/// Name of the copy taken before upgrading from `version`.
fn backup_path(db_path: &Path, version: u32) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f");
    let file_name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "reef.db".to_string());
    db_path.with_file_name(format!("{}-{}-version-{}", file_name, stamp, version))
}

const CREATE_TASKS: &str = r#"
    CREATE TABLE tasks (
        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
        projectId INTEGER NOT NULL,
        done BOOLEAN NOT NULL,
        priority INTEGER NOT NULL,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        FOREIGN KEY(projectId) REFERENCES projects(id)
    );
"#;

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            color TEXT NOT NULL
        );

        CREATE TABLE projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT UNIQUE NOT NULL,
            description TEXT NOT NULL
        );

        CREATE TABLE projectTags (
            projectId INTEGER NOT NULL,
            tagId INTEGER NOT NULL,
            CONSTRAINT PK_Pair PRIMARY KEY (projectId, tagId),
            FOREIGN KEY(projectId) REFERENCES projects(id),
            FOREIGN KEY(tagId) REFERENCES tags(id)
        );

        CREATE TABLE sessions (
            id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
            projectId INTEGER NOT NULL,
            timestamp DATETIME NOT NULL,
            duration INTEGER NOT NULL,
            FOREIGN KEY(projectId) REFERENCES projects(id)
        );
        "#,
    )?;
    conn.execute_batch(CREATE_TASKS)?;

    conn.execute(
        "INSERT INTO tags (id, name, color) VALUES (?1, ?2, ?3)",
        params![ARCHIVED_TAG_ID, ARCHIVED_TAG_NAME, ARCHIVED_TAG_COLOR],
    )?;

    write_version(conn, SCHEMA_VERSION)
}

/// Version 1 tasks only had a description; version 2 adds a title and a
/// priority. The old description becomes the title.
fn upgrade_1_to_2(conn: &Connection) -> Result<()> {
    conn.execute_batch("ALTER TABLE tasks RENAME TO _tasks_old;")?;
    conn.execute_batch(CREATE_TASKS)?;
    conn.execute_batch(
        r#"
        INSERT INTO tasks (id, projectId, done, priority, title, description)
            SELECT id, projectId, done, 1, description, '' FROM _tasks_old;

        DROP TABLE _tasks_old;
        "#,
    )?;
    Ok(())
}
