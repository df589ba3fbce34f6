//! Storage layer for Reef data.
//!
//! All records live in a single SQLite database, `reef.db`, inside the
//! configured database directory. The connection sits behind a mutex so the
//! store can be shared between the controller and read-only callers; every
//! mutating operation runs in one transaction.
//!
//! Aggregates (completeness, duration totals, project counts) are never
//! stored; they are computed on each read.

mod schema;

pub use schema::SCHEMA_VERSION;

use crate::models::{
    ARCHIVED_TAG_ID, DurationTotals, MAX_PRIORITY, Project, ProjectId, Session, SessionId,
    Summary, Tag, TagId, Task, TaskId, completeness,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, Transaction, params};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// File name of the database inside the database directory.
pub const DATABASE_FILE: &str = "reef.db";

/// Storage manager for a database directory.
pub struct Storage {
    /// Directory holding the database and its upgrade backups
    root: PathBuf,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("root", &self.root).finish()
    }
}

/// Result of comparing an old and a new tag set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDelta {
    /// Ids present only in the new set, ascending
    pub added: Vec<TagId>,
    /// Ids present only in the old set, ascending
    pub removed: Vec<TagId>,
}

impl TagDelta {
    /// Every id whose membership changed, ascending.
    pub fn changed(&self) -> Vec<TagId> {
        let mut ids: Vec<TagId> = self.added.iter().chain(&self.removed).copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Symmetric difference between two tag sets. Duplicates are ignored.
pub fn tag_delta(old: &[TagId], new: &[TagId]) -> TagDelta {
    let old: BTreeSet<TagId> = old.iter().copied().collect();
    let new: BTreeSet<TagId> = new.iter().copied().collect();
    TagDelta {
        added: new.difference(&old).copied().collect(),
        removed: old.difference(&new).copied().collect(),
    }
}

impl Storage {
    /// Open the database in `dir`, creating the directory and the schema if
    /// needed and upgrading an older schema in place.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let db_path = dir.join(DATABASE_FILE);
        let mut conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::prepare(&mut conn, &db_path)?;

        Ok(Self {
            root: dir.to_path_buf(),
            conn: Mutex::new(conn),
        })
    }

    /// Directory holding the database.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path of the database file.
    pub fn db_path(&self) -> PathBuf {
        self.root.join(DATABASE_FILE)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::StorageLock)
    }

    /// Run `f` inside a transaction, committing only if it succeeds.
    fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // === Tags ===

    /// Create a tag and return its id.
    pub fn create_tag(&self, name: &str, color: &str) -> Result<TagId> {
        validate_tag_name(name)?;
        self.write(|tx| {
            tx.execute(
                "INSERT INTO tags (name, color) VALUES (?1, ?2)",
                params![name, color],
            )
            .map_err(|e| conflict(e, || format!("Tag already exists: {}", name)))?;
            Ok(tx.last_insert_rowid() as TagId)
        })
    }

    /// Delete a tag, returning the projects that carried it.
    pub fn delete_tag(&self, id: TagId) -> Result<Vec<ProjectId>> {
        if id == ARCHIVED_TAG_ID {
            return Err(Error::InvalidArgument(
                "The Archived tag cannot be deleted".to_string(),
            ));
        }
        self.write(|tx| {
            require_tag(tx, id)?;
            let projects = read_project_ids_by_tag(tx, id)?;
            tx.execute("DELETE FROM projectTags WHERE tagId = ?1", [id])?;
            tx.execute("DELETE FROM tags WHERE id = ?1", [id])?;
            Ok(projects)
        })
    }

    /// Rename and recolor a tag.
    pub fn edit_tag(&self, id: TagId, new_name: &str, new_color: &str) -> Result<()> {
        if id == ARCHIVED_TAG_ID {
            return Err(Error::InvalidArgument(
                "The Archived tag cannot be edited".to_string(),
            ));
        }
        validate_tag_name(new_name)?;
        self.write(|tx| {
            let updated = tx
                .execute(
                    "UPDATE tags SET name = ?1, color = ?2 WHERE id = ?3",
                    params![new_name, new_color, id],
                )
                .map_err(|e| conflict(e, || format!("Tag already exists: {}", new_name)))?;
            if updated == 0 {
                return Err(tag_not_found(id));
            }
            Ok(())
        })
    }

    // === Projects ===

    /// Create a project carrying `tags` and return its id.
    pub fn create_project(
        &self,
        title: &str,
        description: &str,
        tags: &[TagId],
    ) -> Result<ProjectId> {
        self.write(|tx| {
            for &tag in tags {
                require_tag(tx, tag)?;
            }
            tx.execute(
                "INSERT INTO projects (title, description) VALUES (?1, ?2)",
                params![title, description],
            )
            .map_err(|e| conflict(e, || format!("Project already exists: {}", title)))?;
            let id = tx.last_insert_rowid() as ProjectId;

            for &tag in tags {
                tx.execute(
                    "INSERT OR IGNORE INTO projectTags (projectId, tagId) VALUES (?1, ?2)",
                    params![id, tag],
                )?;
            }
            Ok(id)
        })
    }

    /// Delete a project with its tasks and sessions, returning the tags it
    /// carried.
    pub fn delete_project(&self, id: ProjectId) -> Result<Vec<TagId>> {
        self.write(|tx| {
            require_project(tx, id)?;
            let tags = read_tag_ids(tx, id)?;
            tx.execute("DELETE FROM projectTags WHERE projectId = ?1", [id])?;
            tx.execute("DELETE FROM tasks WHERE projectId = ?1", [id])?;
            tx.execute("DELETE FROM sessions WHERE projectId = ?1", [id])?;
            tx.execute("DELETE FROM projects WHERE id = ?1", [id])?;
            Ok(tags)
        })
    }

    /// Update a project's fields and tag set.
    ///
    /// Only the associations that actually change are written. Returns the
    /// ids of the tags that were added or removed, not the final set.
    pub fn edit_project(
        &self,
        id: ProjectId,
        title: &str,
        description: &str,
        tags: &[TagId],
    ) -> Result<Vec<TagId>> {
        self.write(|tx| {
            require_project(tx, id)?;
            for &tag in tags {
                require_tag(tx, tag)?;
            }
            tx.execute(
                "UPDATE projects SET title = ?1, description = ?2 WHERE id = ?3",
                params![title, description, id],
            )
            .map_err(|e| conflict(e, || format!("Project already exists: {}", title)))?;

            let delta = tag_delta(&read_tag_ids(tx, id)?, tags);
            for &tag in &delta.added {
                tx.execute(
                    "INSERT OR IGNORE INTO projectTags (projectId, tagId) VALUES (?1, ?2)",
                    params![id, tag],
                )?;
            }
            for &tag in &delta.removed {
                tx.execute(
                    "DELETE FROM projectTags WHERE projectId = ?1 AND tagId = ?2",
                    params![id, tag],
                )?;
            }
            Ok(delta.changed())
        })
    }

    // === Tasks ===

    /// Add an open task to a project. Returns the project id.
    pub fn add_task(
        &self,
        project_id: ProjectId,
        title: &str,
        description: &str,
        priority: u8,
    ) -> Result<ProjectId> {
        validate_priority(priority)?;
        self.write(|tx| {
            require_project(tx, project_id)?;
            tx.execute(
                "INSERT INTO tasks (projectId, done, priority, title, description)
                 VALUES (?1, 0, ?2, ?3, ?4)",
                params![project_id, priority, title, description],
            )?;
            Ok(project_id)
        })
    }

    pub fn delete_task(&self, id: TaskId) -> Result<ProjectId> {
        self.write(|tx| {
            let project_id = task_project(tx, id)?;
            tx.execute("DELETE FROM tasks WHERE id = ?1", [id])?;
            Ok(project_id)
        })
    }

    /// Flip a task between open and done.
    pub fn toggle_task(&self, id: TaskId) -> Result<ProjectId> {
        self.write(|tx| {
            let project_id = task_project(tx, id)?;
            tx.execute("UPDATE tasks SET done = NOT done WHERE id = ?1", [id])?;
            Ok(project_id)
        })
    }

    pub fn edit_task(
        &self,
        id: TaskId,
        title: &str,
        description: &str,
        priority: u8,
    ) -> Result<ProjectId> {
        validate_priority(priority)?;
        self.write(|tx| {
            let project_id = task_project(tx, id)?;
            tx.execute(
                "UPDATE tasks SET title = ?1, description = ?2, priority = ?3 WHERE id = ?4",
                params![title, description, priority, id],
            )?;
            Ok(project_id)
        })
    }

    // === Sessions ===

    /// Record `duration` minutes of work at unix time `date`.
    pub fn add_session(&self, project_id: ProjectId, duration: u64, date: u64) -> Result<ProjectId> {
        self.write(|tx| {
            require_project(tx, project_id)?;
            tx.execute(
                "INSERT INTO sessions (projectId, timestamp, duration) VALUES (?1, ?2, ?3)",
                params![project_id, date, duration],
            )?;
            Ok(project_id)
        })
    }

    pub fn delete_session(&self, id: SessionId) -> Result<ProjectId> {
        self.write(|tx| {
            let project_id: Option<ProjectId> = tx
                .query_row(
                    "SELECT projectId FROM sessions WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            let project_id =
                project_id.ok_or_else(|| Error::NotFound(format!("Session not found: {}", id)))?;
            tx.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
            Ok(project_id)
        })
    }

    // === Reads ===

    pub fn get_tag_by_id(&self, id: TagId) -> Result<Tag> {
        let conn = self.lock()?;
        read_tag(&conn, id, Utc::now())
    }

    /// Every tag, ordered by id.
    pub fn get_tag_list(&self) -> Result<Vec<Tag>> {
        let conn = self.lock()?;
        let now = Utc::now();
        read_ids(&conn, "SELECT id FROM tags ORDER BY id", [])?
            .into_iter()
            .map(|id| read_tag(&conn, id, now))
            .collect()
    }

    pub fn get_project_by_id(&self, id: ProjectId) -> Result<Project> {
        let conn = self.lock()?;
        read_project(&conn, id, Utc::now())
    }

    pub fn get_summary_by_id(&self, id: ProjectId) -> Result<Summary> {
        let conn = self.lock()?;
        read_summary(&conn, id)
    }

    /// Summaries of every project, ordered by id.
    pub fn get_summary_list(&self) -> Result<Vec<Summary>> {
        let conn = self.lock()?;
        read_ids(&conn, "SELECT id FROM projects ORDER BY id", [])?
            .into_iter()
            .map(|id| read_summary(&conn, id))
            .collect()
    }

    /// Tags currently carried by a project, ascending.
    pub fn get_tag_ids_by_project(&self, id: ProjectId) -> Result<Vec<TagId>> {
        let conn = self.lock()?;
        require_project(&conn, id)?;
        read_tag_ids(&conn, id)
    }
}

// === Helpers ===

/// Map a constraint violation to `Conflict`, anything else as usual.
fn conflict(err: rusqlite::Error, message: impl FnOnce() -> String) -> Error {
    match err {
        rusqlite::Error::SqliteFailure(ref e, _) if e.code == ErrorCode::ConstraintViolation => {
            Error::Conflict(message())
        }
        other => other.into(),
    }
}

fn validate_tag_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidArgument("Tag name cannot be empty".to_string()));
    }
    Ok(())
}

fn validate_priority(priority: u8) -> Result<()> {
    if priority > MAX_PRIORITY {
        return Err(Error::InvalidArgument(format!(
            "Invalid priority {} (expected 0 to {})",
            priority, MAX_PRIORITY
        )));
    }
    Ok(())
}

fn tag_not_found(id: TagId) -> Error {
    Error::NotFound(format!("Tag not found: {}", id))
}

fn project_not_found(id: ProjectId) -> Error {
    Error::NotFound(format!("Project not found: {}", id))
}

fn exists(conn: &Connection, sql: &str, id: u64) -> Result<bool> {
    Ok(conn
        .query_row(sql, [id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn require_tag(conn: &Connection, id: TagId) -> Result<()> {
    if !exists(conn, "SELECT 1 FROM tags WHERE id = ?1", id)? {
        return Err(tag_not_found(id));
    }
    Ok(())
}

fn require_project(conn: &Connection, id: ProjectId) -> Result<()> {
    if !exists(conn, "SELECT 1 FROM projects WHERE id = ?1", id)? {
        return Err(project_not_found(id));
    }
    Ok(())
}

fn task_project(conn: &Connection, id: TaskId) -> Result<ProjectId> {
    conn.query_row("SELECT projectId FROM tasks WHERE id = ?1", [id], |row| {
        row.get(0)
    })
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("Task not found: {}", id)))
}

/// Read a text column that an older database may hold as a number.
fn text(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => v.to_string(),
        ValueRef::Null => String::new(),
    })
}

fn read_ids<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<u64>> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get(0))?
        .collect::<std::result::Result<Vec<u64>, _>>()?;
    Ok(ids)
}

fn read_tag_ids(conn: &Connection, project_id: ProjectId) -> Result<Vec<TagId>> {
    read_ids(
        conn,
        "SELECT tagId FROM projectTags WHERE projectId = ?1 ORDER BY tagId",
        [project_id],
    )
}

fn read_project_ids_by_tag(conn: &Connection, tag_id: TagId) -> Result<Vec<ProjectId>> {
    read_ids(
        conn,
        "SELECT projectId FROM projectTags WHERE tagId = ?1 ORDER BY projectId",
        [tag_id],
    )
}

fn read_completeness(conn: &Connection, project_id: ProjectId) -> Result<f32> {
    let (total, done): (u64, u64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(done), 0) FROM tasks WHERE projectId = ?1",
        [project_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(completeness(done, total))
}

fn read_tag(conn: &Connection, id: TagId, now: DateTime<Utc>) -> Result<Tag> {
    let (name, color): (String, String) = conn
        .query_row(
            "SELECT name, color FROM tags WHERE id = ?1",
            [id],
            |row| Ok((text(row, 0)?, text(row, 1)?)),
        )
        .optional()?
        .ok_or_else(|| tag_not_found(id))?;

    let num_projects: u32 = conn.query_row(
        "SELECT COUNT(*) FROM projectTags WHERE tagId = ?1",
        [id],
        |row| row.get(0),
    )?;

    let mut window = DurationTotals::window(now);
    let mut stmt = conn.prepare(
        "SELECT s.timestamp, s.duration FROM sessions s
         JOIN projectTags pt ON pt.projectId = s.projectId
         WHERE pt.tagId = ?1",
    )?;
    let rows = stmt.query_map([id], |row| Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?)))?;
    for row in rows {
        let (date, duration) = row?;
        window.add(date, duration);
    }
    let totals = window.finish();

    Ok(Tag {
        id,
        name,
        color,
        duration_total: totals.total,
        duration_month: totals.month,
        duration_week: totals.week,
        num_projects,
    })
}

fn read_summary(conn: &Connection, id: ProjectId) -> Result<Summary> {
    let title: String = conn
        .query_row("SELECT title FROM projects WHERE id = ?1", [id], |row| {
            text(row, 0)
        })
        .optional()?
        .ok_or_else(|| project_not_found(id))?;

    Ok(Summary {
        id,
        title,
        tags: read_tag_ids(conn, id)?,
        completeness: read_completeness(conn, id)?,
    })
}

fn read_tasks(conn: &Connection, project_id: ProjectId) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(
        "SELECT id, done, priority, title, description FROM tasks
         WHERE projectId = ?1 ORDER BY id",
    )?;
    let tasks = stmt
        .query_map([project_id], |row| {
            Ok(Task {
                id: row.get(0)?,
                project_id,
                done: row.get(1)?,
                priority: row.get(2)?,
                title: text(row, 3)?,
                description: text(row, 4)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(tasks)
}

fn read_sessions(conn: &Connection, project_id: ProjectId) -> Result<Vec<Session>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, duration FROM sessions WHERE projectId = ?1 ORDER BY id",
    )?;
    let sessions = stmt
        .query_map([project_id], |row| {
            Ok(Session {
                id: row.get(0)?,
                project_id,
                date: row.get(1)?,
                duration: row.get(2)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(sessions)
}

fn read_project(conn: &Connection, id: ProjectId, now: DateTime<Utc>) -> Result<Project> {
    let (title, description): (String, String) = conn
        .query_row(
            "SELECT title, description FROM projects WHERE id = ?1",
            [id],
            |row| Ok((text(row, 0)?, text(row, 1)?)),
        )
        .optional()?
        .ok_or_else(|| project_not_found(id))?;

    let tasks = read_tasks(conn, id)?;
    let sessions = read_sessions(conn, id)?;

    let done = tasks.iter().filter(|t| t.done).count() as u64;
    let mut window = DurationTotals::window(now);
    for session in &sessions {
        window.add(session.date, session.duration);
    }
    let totals = window.finish();

    Ok(Project {
        id,
        title,
        description,
        tags: read_tag_ids(conn, id)?,
        duration_total: totals.total,
        duration_month: totals.month,
        duration_week: totals.week,
        completeness: completeness(done, tasks.len() as u64),
        tasks,
        sessions,
    })
}
