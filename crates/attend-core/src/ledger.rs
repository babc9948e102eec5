//! Attendance state machine per (identity, session).
//!
//! `absent` → `checked-in` → `complete`. Each timestamp is written at most
//! once. The store's atomic upsert keeps an already-set timestamp, so the
//! ledger compares the stored value with its own to detect a lost race.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{RecordStore, StoreError};
use crate::types::Usn;

/// Method tag stored on every face-driven mark.
pub const FACE_METHOD: &str = "face-auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    CheckIn,
    CheckOut,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CheckIn => "check-in",
            Self::CheckOut => "check-out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "check-in" => Ok(Self::CheckIn),
            "check-out" => Ok(Self::CheckOut),
            other => Err(format!("unknown mode: {other} (expected check-in or check-out)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerState {
    Absent,
    CheckedIn,
    Complete,
}

impl LedgerState {
    pub fn of(record: Option<&AttendanceRecord>) -> Self {
        match record {
            None => Self::Absent,
            Some(r) => r.state(),
        }
    }
}

/// Stored attendance row, unique on (usn, session_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub usn: Usn,
    pub session_id: String,
    pub class_name: String,
    pub subject: String,
    pub teacher_id: String,
    pub date: NaiveDate,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
    pub method: String,
    pub is_absent: bool,
}

impl AttendanceRecord {
    pub fn timestamp(&self, direction: Direction) -> Option<DateTime<Utc>> {
        match direction {
            Direction::CheckIn => self.check_in,
            Direction::CheckOut => self.check_out,
        }
    }

    pub fn state(&self) -> LedgerState {
        match (self.check_in, self.check_out) {
            (None, _) => LedgerState::Absent,
            (Some(_), None) => LedgerState::CheckedIn,
            (Some(_), Some(_)) => LedgerState::Complete,
        }
    }
}

/// Whether `direction` may be written given the current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Allowed,
    AlreadyMarked { at: DateTime<Utc> },
    NotCheckedIn,
}

pub fn transition(current: Option<&AttendanceRecord>, direction: Direction) -> Transition {
    let Some(record) = current else {
        return match direction {
            Direction::CheckIn => Transition::Allowed,
            Direction::CheckOut => Transition::NotCheckedIn,
        };
    };

    if let Some(at) = record.timestamp(direction) {
        return Transition::AlreadyMarked { at };
    }
    match (direction, record.check_in) {
        (Direction::CheckOut, None) => Transition::NotCheckedIn,
        _ => Transition::Allowed,
    }
}

/// Session fields as they arrive with a recognize request. Any of them may
/// be missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SessionContext {
    pub session_id: Option<String>,
    pub class_name: Option<String>,
    pub subject: Option<String>,
    pub teacher_id: Option<String>,
    pub mode: Option<Direction>,
}

/// A session context with every field present.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionMark {
    pub session_id: String,
    pub class_name: String,
    pub subject: String,
    pub teacher_id: String,
    pub direction: Direction,
}

impl SessionContext {
    /// Blank strings count as missing. On failure returns the names of the
    /// missing fields.
    pub fn complete(&self) -> Result<SessionMark, Vec<&'static str>> {
        fn present(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }

        let session_id = present(&self.session_id);
        let class_name = present(&self.class_name);
        let subject = present(&self.subject);
        let teacher_id = present(&self.teacher_id);

        match (session_id, class_name, subject, teacher_id, self.mode) {
            (Some(session_id), Some(class_name), Some(subject), Some(teacher_id), Some(direction)) => {
                Ok(SessionMark {
                    session_id,
                    class_name,
                    subject,
                    teacher_id,
                    direction,
                })
            }
            (session_id, class_name, subject, teacher_id, mode) => {
                let mut missing = Vec::new();
                if session_id.is_none() {
                    missing.push("session_id");
                }
                if class_name.is_none() {
                    missing.push("class_name");
                }
                if subject.is_none() {
                    missing.push("subject");
                }
                if teacher_id.is_none() {
                    missing.push("teacher_id");
                }
                if mode.is_none() {
                    missing.push("mode");
                }
                Err(missing)
            }
        }
    }
}

/// Upsert payload: write `at` into the `direction` column of the
/// (usn, session_id) row unless it is already set.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceMark {
    pub usn: Usn,
    pub session_id: String,
    pub class_name: String,
    pub subject: String,
    pub teacher_id: String,
    pub direction: Direction,
    pub at: DateTime<Utc>,
    pub date: NaiveDate,
    pub method: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkOutcome {
    Recorded(AttendanceRecord),
    AlreadyMarked { at: DateTime<Utc> },
    NotCheckedIn,
}

pub struct AttendanceLedger {
    records: Arc<dyn RecordStore>,
}

impl AttendanceLedger {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    pub async fn state(&self, usn: &Usn, session_id: &str) -> Result<LedgerState, StoreError> {
        let current = self.records.attendance(usn, session_id).await?;
        Ok(LedgerState::of(current.as_ref()))
    }

    /// Apply `session.direction` for `usn` at time `at`.
    pub async fn mark(
        &self,
        usn: &Usn,
        session: &SessionMark,
        at: DateTime<Utc>,
    ) -> Result<MarkOutcome, StoreError> {
        // Stored with microsecond precision; truncate so the read-back
        // comparison is exact.
        let at = at.trunc_subsecs(6);
        let direction = session.direction;

        let current = self.records.attendance(usn, &session.session_id).await?;
        match transition(current.as_ref(), direction) {
            Transition::Allowed => {}
            Transition::AlreadyMarked { at } => {
                tracing::info!(usn = %usn, session = %session.session_id, %direction, "already marked");
                return Ok(MarkOutcome::AlreadyMarked { at });
            }
            Transition::NotCheckedIn => {
                tracing::info!(usn = %usn, session = %session.session_id, "check-out without check-in");
                return Ok(MarkOutcome::NotCheckedIn);
            }
        }

        let mark = AttendanceMark {
            usn: usn.clone(),
            session_id: session.session_id.clone(),
            class_name: session.class_name.clone(),
            subject: session.subject.clone(),
            teacher_id: session.teacher_id.clone(),
            direction,
            at,
            date: at.with_timezone(&Local).date_naive(),
            method: FACE_METHOD,
        };
        let stored = self.records.upsert_attendance(&mark).await?;

        match stored.timestamp(direction) {
            Some(t) if t == at => {
                tracing::info!(usn = %usn, session = %session.session_id, %direction, at = %at, "attendance recorded");
                Ok(MarkOutcome::Recorded(stored))
            }
            Some(t) => {
                tracing::info!(usn = %usn, session = %session.session_id, %direction, "lost race, already marked");
                Ok(MarkOutcome::AlreadyMarked { at: t })
            }
            None => Err(StoreError::Query(format!(
                "attendance upsert for {usn}/{} did not set {direction}",
                session.session_id
            ))),
        }
    }
}
