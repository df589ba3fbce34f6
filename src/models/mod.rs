//! Data models for Reef entities.
//!
//! This module defines the core data structures:
//! - `Tag` - Labels attached to projects, with accumulated work time
//! - `Project` - A unit of work holding tasks and work sessions
//! - `Summary` - Lightweight projection of a project for list views
//! - `Task` - A to-do item owned by a project
//! - `Session` - A block of time spent on a project
//!
//! All types serialize with the camelCase field names the web UI expects.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

pub type TagId = u64;
pub type ProjectId = u64;
pub type TaskId = u64;
pub type SessionId = u64;

/// Id of the reserved tag that can be neither edited nor deleted.
pub const ARCHIVED_TAG_ID: TagId = 1;
pub const ARCHIVED_TAG_NAME: &str = "Archived";
pub const ARCHIVED_TAG_COLOR: &str = "#adadad";

/// Highest accepted task priority (0 = low, 1 = normal, 2 = high).
pub const MAX_PRIORITY: u8 = 2;

/// A tag with its derived statistics.
///
/// Durations are in minutes and cover every project carrying the tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub color: String,
    pub duration_total: u64,
    pub duration_month: u64,
    pub duration_week: u64,
    #[serde(rename = "numProjects")]
    pub num_projects: u32,
}

impl Tag {
    /// Whether this is the reserved "Archived" tag.
    pub fn is_reserved(&self) -> bool {
        self.id == ARCHIVED_TAG_ID
    }
}

/// List-view projection of a project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub id: ProjectId,
    pub title: String,
    pub tags: Vec<TagId>,
    pub completeness: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub title: String,
    pub description: String,
    pub priority: u8,
    pub done: bool,
}

/// A work session: `duration` minutes spent on a project at `date`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub project_id: ProjectId,
    /// Length of the session in minutes
    pub duration: u64,
    /// Unix timestamp (seconds) of the session
    pub date: u64,
}

/// A fully hydrated project.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: ProjectId,
    pub title: String,
    pub description: String,
    pub tags: Vec<TagId>,
    pub duration_total: u64,
    pub duration_month: u64,
    pub duration_week: u64,
    pub completeness: f32,
    pub tasks: Vec<Task>,
    pub sessions: Vec<Session>,
}

impl Project {
    /// Project the summary fields out of a full project.
    pub fn summary(&self) -> Summary {
        Summary {
            id: self.id,
            title: self.title.clone(),
            tags: self.tags.clone(),
            completeness: self.completeness,
        }
    }
}

/// Fraction of done tasks. A project without tasks is complete.
pub fn completeness(done: u64, total: u64) -> f32 {
    if total == 0 {
        return 1.0;
    }
    done as f32 / total as f32
}

/// Accumulated session time (minutes) over the fixed reporting windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationTotals {
    pub total: u64,
    pub month: u64,
    pub week: u64,
}

impl DurationTotals {
    /// Start accumulating relative to `now`.
    pub fn window(now: DateTime<Utc>) -> DurationWindow {
        let month_ago = now
            .checked_sub_months(Months::new(1))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let week_ago = now - Duration::days(7);
        DurationWindow {
            month_cutoff: month_ago.timestamp(),
            week_cutoff: week_ago.timestamp(),
            totals: DurationTotals::default(),
        }
    }
}

/// Accumulator for [`DurationTotals`]; sessions strictly after a cutoff count
/// towards that window.
#[derive(Debug, Clone)]
pub struct DurationWindow {
    month_cutoff: i64,
    week_cutoff: i64,
    totals: DurationTotals,
}

impl DurationWindow {
    pub fn add(&mut self, date: u64, duration: u64) {
        let date = i64::try_from(date).unwrap_or(i64::MAX);
        // Totals saturate instead of wrapping.
        self.totals.total = self.totals.total.saturating_add(duration);
        if date > self.month_cutoff {
            self.totals.month = self.totals.month.saturating_add(duration);
        }
        if date > self.week_cutoff {
            self.totals.week = self.totals.week.saturating_add(duration);
        }
    }

    pub fn finish(self) -> DurationTotals {
        self.totals
    }
}
