use std::{borrow::Borrow, collections::BTreeMap, fmt};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CATALOG_VERSION: &str = "1.0";

/// Port value meaning "no advertised port".
pub const NO_PORT: i32 = -1;

/// Stable catalog identifier, assigned on create.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(pub String);

impl ProgramId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProgramId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ProgramId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProgramId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramStatus {
    Running,
    // Anything unrecognised in an old catalog is treated as not running.
    #[default]
    #[serde(other)]
    Stopped,
}

impl ProgramStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgramStatus::Running => "running",
            ProgramStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ProgramStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_port() -> i32 {
    NO_PORT
}

/// A user-declared command managed as a child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub status: ProgramStatus,
    #[serde(default)]
    pub pid: u32,
    #[serde(default = "default_port")]
    pub port: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    // Reserved: persisted verbatim, no behavior attached.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub restart_policy: String,
}

impl Program {
    /// Builds a fresh, stopped record from client input.
    pub fn from_draft(id: ProgramId, draft: ProgramDraft, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: draft.name.trim().to_string(),
            command: draft.command.trim().to_string(),
            working_dir: draft.working_dir.trim().to_string(),
            description: draft.description.trim().to_string(),
            status: ProgramStatus::Stopped,
            pid: 0,
            port: normalize_port(draft.port.unwrap_or(0)),
            created_at: now,
            updated_at: now,
            auto_start: false,
            restart_policy: String::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ProgramStatus::Running
    }

    /// Bumps `updated_at`, never moving it backwards or leaving it unchanged.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let floor = self.updated_at + Duration::microseconds(1);
        self.updated_at = if now > self.updated_at { now } else { floor };
    }

    pub fn mark_running(&mut self, pid: u32, now: DateTime<Utc>) {
        self.status = ProgramStatus::Running;
        self.pid = pid;
        self.touch(now);
    }

    pub fn mark_stopped(&mut self, now: DateTime<Utc>) {
        self.status = ProgramStatus::Stopped;
        self.pid = 0;
        self.touch(now);
    }

    /// Replaces the client-editable fields; status and pid are kept.
    pub fn apply_update(&mut self, update: ProgramUpdate, now: DateTime<Utc>) {
        self.name = update.name.trim().to_string();
        self.command = update.command.trim().to_string();
        self.working_dir = update.working_dir.trim().to_string();
        self.description = update.description.trim().to_string();
        if let Some(port) = update.port {
            self.port = normalize_port(port);
        }
        self.touch(now);
    }
}

/// 0 is "none" on the wire and is stored as -1.
pub fn normalize_port(port: i32) -> i32 {
    if port == 0 { NO_PORT } else { port }
}

/// Body of `POST /api/programs`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramDraft {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub port: Option<i32>,
}

/// Body of `PUT /api/programs/{id}`. `port` is only replaced when present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgramUpdate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub working_dir: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub port: Option<i32>,
}

fn null_as_empty<'de, D>(de: D) -> Result<BTreeMap<ProgramId, Program>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<ProgramId, Program>>::deserialize(de)?.unwrap_or_default())
}

fn default_version() -> String {
    CATALOG_VERSION.to_string()
}

/// The full persisted document: `{ "version": "1.0", "programs": { id: Program } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub programs: BTreeMap<ProgramId, Program>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            version: default_version(),
            programs: BTreeMap::new(),
        }
    }
}

impl Catalog {
    pub fn get(&self, id: &str) -> Option<&Program> {
        self.programs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Program> {
        self.programs.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.programs.contains_key(id)
    }

    pub fn insert(&mut self, program: Program) {
        self.programs.insert(program.id.clone(), program);
    }

    pub fn remove(&mut self, id: &str) -> Option<Program> {
        self.programs.remove(id)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Program> {
        self.programs.values()
    }

    /// Finds a record with exactly this name, skipping `except` if given.
    pub fn name_taken(&self, name: &str, except: Option<&str>) -> bool {
        self.programs
            .values()
            .any(|p| p.name == name && Some(p.id.as_str()) != except)
    }

    /// All records, oldest first, ties broken by name.
    pub fn sorted(&self) -> Vec<Program> {
        let mut out: Vec<Program> = self.programs.values().cloned().collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }
}

/// Resident memory of one program, as served by the memory endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramMemory {
    pub id: ProgramId,
    pub name: String,
    pub command: String,
    pub status: ProgramStatus,
    pub pid: u32,
    pub memory_usage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
}

/// Reply of the single-program memory query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMemory {
    pub id: ProgramId,
    pub pid: u32,
    pub memory_kb: u64,
    pub memory_mb: f64,
    pub memory_display: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemMemory {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchOutcome {
    Done { status: String },
    Failed { error: String },
}

impl BatchOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, BatchOutcome::Done { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: BTreeMap<String, BatchOutcome>,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn record(&mut self, id: &str, outcome: BatchOutcome) {
        self.summary.total += 1;
        if outcome.is_ok() {
            self.summary.success += 1;
        } else {
            self.summary.errors += 1;
        }
        self.results.insert(id.to_string(), outcome);
    }
}

/// Last lines of a program's newest capture files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogTail {
    pub id: ProgramId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_file: Option<String>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(now: DateTime<Utc>) -> Program {
        Program::from_draft(
            ProgramId::from("p1"),
            ProgramDraft {
                name: " sleeper ".to_string(),
                command: "sleep 30".to_string(),
                port: Some(0),
                ..Default::default()
            },
            now,
        )
    }

    #[test]
    fn program_id_is_non_empty() {
        let id = ProgramId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn draft_normalizes_port_and_trims() {
        let p = sample(Utc::now());
        assert_eq!(p.name, "sleeper");
        assert_eq!(p.port, NO_PORT);
        assert_eq!(p.status, ProgramStatus::Stopped);
        assert_eq!(p.pid, 0);
    }

    #[test]
    fn wire_shape_matches_catalog_format() {
        let p = sample(Utc::now());
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["status"], "stopped");
        assert_eq!(v["port"], -1);
        assert_eq!(v["pid"], 0);
        assert!(v.get("working_dir").is_none());
        assert!(v.get("auto_start").is_none());
    }

    #[test]
    fn unknown_status_reads_as_stopped() {
        let raw = r#"{"id":"a","name":"ab","command":"sleep 1","status":"crashed","pid":0,
            "created_at":"2024-01-01T00:00:00Z","updated_at":"2024-01-01T00:00:00Z"}"#;
        let p: Program = serde_json::from_str(raw).unwrap();
        assert_eq!(p.status, ProgramStatus::Stopped);
        assert_eq!(p.port, NO_PORT);
    }

    #[test]
    fn null_programs_map_is_empty() {
        let c: Catalog = serde_json::from_str(r#"{"version":"1.0","programs":null}"#).unwrap();
        assert!(c.is_empty());
        let c: Catalog = serde_json::from_str("{}").unwrap();
        assert_eq!(c.version, CATALOG_VERSION);
    }

    #[test]
    fn touch_is_strictly_monotonic() {
        let now = Utc::now();
        let mut p = sample(now);
        let before = p.updated_at;
        p.touch(now);
        assert!(p.updated_at > before);
        let older = now - Duration::seconds(10);
        let before = p.updated_at;
        p.touch(older);
        assert!(p.updated_at > before);
    }

    #[test]
    fn update_keeps_status_and_pid() {
        let now = Utc::now();
        let mut p = sample(now);
        p.mark_running(42, now);
        p.apply_update(
            ProgramUpdate {
                name: "renamed".to_string(),
                command: "sleep 5".to_string(),
                port: None,
                ..Default::default()
            },
            now,
        );
        assert_eq!(p.name, "renamed");
        assert_eq!(p.pid, 42);
        assert!(p.is_running());
        assert_eq!(p.port, NO_PORT);
    }

    #[test]
    fn name_taken_respects_exclusion() {
        let mut c = Catalog::default();
        c.insert(sample(Utc::now()));
        assert!(c.name_taken("sleeper", None));
        assert!(!c.name_taken("sleeper", Some("p1")));
        assert!(!c.name_taken("Sleeper", None));
    }

    #[test]
    fn batch_report_counts() {
        let mut r = BatchReport::default();
        r.record("a", BatchOutcome::Done { status: "started".to_string() });
        r.record("b", BatchOutcome::Failed { error: "program not found: b".to_string() });
        assert_eq!(r.summary, BatchSummary { total: 2, success: 1, errors: 1 });
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["results"]["a"]["status"], "started");
        assert!(v["results"]["b"]["error"].is_string());
    }
}
