//! The coordinator: turns catalog records into processes and keeps the
//! recorded status honest against the OS.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use progd_process::{
    BatchOutcome, BatchReport, Catalog, LogTail, ProcessMemory, Program, ProgramDraft, ProgramId,
    ProgramMemory, ProgramStatus, ProgramUpdate, SystemMemory,
};

use crate::{
    error::{Result, SupervisorError},
    log_sink::LogSink,
    runner::ProcessRunner,
    store::CatalogStore,
    validator,
};

type IdLock = Arc<tokio::sync::Mutex<()>>;

/// Holds one id's operation lock. On drop the map entry is evicted once no
/// other caller holds or awaits it, so the map stays bounded by in-flight ids.
struct IdGuard<'a> {
    locks: &'a Mutex<HashMap<String, IdLock>>,
    id: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for IdGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut map = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if map.get(&self.id).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(&self.id);
        }
    }
}

fn format_mb(mb: f64) -> String {
    format!("{mb:.2} MB")
}

pub struct Supervisor {
    store: CatalogStore,
    runner: ProcessRunner,
    logs: LogSink,
    // Serializes start/stop/update/delete per id so a slow launch or stop
    // never holds the catalog write lock.
    locks: Mutex<HashMap<String, IdLock>>,
}

impl Supervisor {
    pub fn new(store: CatalogStore, runner: ProcessRunner, logs: LogSink) -> Self {
        Self {
            store,
            runner,
            logs,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub fn runner(&self) -> &ProcessRunner {
        &self.runner
    }

    pub fn logs(&self) -> &LogSink {
        &self.logs
    }

    async fn lock_id(&self, id: &str) -> IdGuard<'_> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(id.to_string()).or_default().clone()
        };
        let mut held = IdGuard {
            locks: &self.locks,
            id: id.to_string(),
            guard: None,
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    pub async fn get_all(&self) -> Result<Vec<Program>> {
        Ok(self.store.load().await?.sorted())
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Program> {
        self.store
            .load()
            .await?
            .get(id)
            .cloned()
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    async fn validate_fields(
        name: &str,
        command: &str,
        working_dir: &str,
        port: Option<i32>,
    ) -> Result<()> {
        validator::validate_name(name)?;
        if let Some(port) = port {
            validator::validate_port(port)?;
        }
        validator::validate_command(command)?;
        validator::validate_working_dir(working_dir).await
    }

    pub async fn add(&self, draft: ProgramDraft) -> Result<Program> {
        Self::validate_fields(&draft.name, &draft.command, &draft.working_dir, draft.port).await?;

        let program = Program::from_draft(ProgramId::new(), draft, Utc::now());
        let created = self
            .store
            .update(|c| {
                if c.contains(program.id.as_str()) {
                    return Err(SupervisorError::DuplicateId(program.id.to_string()));
                }
                if c.name_taken(&program.name, None) {
                    return Err(SupervisorError::DuplicateName(program.name.clone()));
                }
                c.insert(program.clone());
                Ok(program)
            })
            .await?;

        tracing::info!(program_id = %created.id, name = %created.name, "program added");
        Ok(created)
    }

    /// Replaces the editable fields. Status and pid stay as stored.
    pub async fn update(&self, id: &str, update: ProgramUpdate) -> Result<Program> {
        Self::validate_fields(&update.name, &update.command, &update.working_dir, update.port)
            .await?;

        let _guard = self.lock_id(id).await;

        let updated = self
            .store
            .update(|c| {
                if !c.contains(id) {
                    return Err(SupervisorError::NotFound(id.to_string()));
                }
                let name = update.name.trim();
                if c.name_taken(name, Some(id)) {
                    return Err(SupervisorError::DuplicateName(name.to_string()));
                }
                let p = c
                    .get_mut(id)
                    .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
                p.apply_update(update, Utc::now());
                Ok(p.clone())
            })
            .await?;

        tracing::info!(program_id = id, "program updated");
        Ok(updated)
    }

    /// Stops the program first if it is recorded as running.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.lock_id(id).await;

        let program = self.get_by_id(id).await?;
        if program.is_running() {
            self.stop_locked(id).await?;
        }

        self.store
            .update(|c| {
                c.remove(id)
                    .map(|_| ())
                    .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
            })
            .await?;
        self.logs.release(id);

        tracing::info!(program_id = id, "program deleted");
        Ok(())
    }

    pub async fn start(&self, id: &str) -> Result<Program> {
        let _guard = self.lock_id(id).await;

        let program = self.get_by_id(id).await?;
        if program.is_running()
            && program.pid > 0
            && self.runner.is_alive(program.pid).await
            && self.runner.verify(program.pid, &program.command).await
        {
            return Err(SupervisorError::AlreadyRunning(program.pid));
        }

        // Any recorded pid is stale from here on.
        self.logs.release(id);
        let (streams, paths) = self.logs.open_launch(id).await?;

        let pid = match self
            .runner
            .start(&program.command, &program.working_dir, streams)
            .await
        {
            Ok(pid) => pid,
            Err(err) => {
                self.logs.release(id);
                if program.is_running() || program.pid != 0 {
                    if let Err(e) = self.set_stopped(id).await {
                        tracing::warn!(program_id = id, err = %e, "failed to clear stale pid");
                    }
                }
                let err = match err {
                    SupervisorError::StartFailed(reason) => {
                        match self.logs.stderr_excerpt(&paths).await {
                            Some(stderr) => {
                                SupervisorError::StartFailed(format!("{reason}; stderr: {stderr}"))
                            }
                            None => SupervisorError::StartFailed(reason),
                        }
                    }
                    other => other,
                };
                tracing::warn!(program_id = id, %err, "start failed");
                return Err(err);
            }
        };

        let saved = self
            .store
            .update(|c| {
                let p = c
                    .get_mut(id)
                    .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
                p.mark_running(pid, Utc::now());
                Ok(p.clone())
            })
            .await;

        match saved {
            Ok(p) => {
                tracing::info!(program_id = id, pid, stdout = %paths.stdout.display(), "program started");
                Ok(p)
            }
            Err(err) => {
                // Without a record nobody could stop it later.
                tracing::error!(program_id = id, pid, %err, "could not record launch; stopping child");
                if let Err(e) = self.runner.stop(pid).await {
                    tracing::error!(program_id = id, pid, err = %e, "failed to stop unrecorded child");
                }
                self.logs.release(id);
                Err(err)
            }
        }
    }

    /// Idempotent: a program that is already down is normalized to
    /// `(stopped, 0)` and reported as stopped.
    pub async fn stop(&self, id: &str) -> Result<Program> {
        let _guard = self.lock_id(id).await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: &str) -> Result<Program> {
        let program = self.get_by_id(id).await?;
        if !program.is_running() || !self.owns_live_process(&program).await {
            self.logs.release(id);
            if program.is_running() || program.pid != 0 {
                tracing::info!(program_id = id, pid = program.pid, "process already gone");
                return self.set_stopped(id).await;
            }
            return Ok(program);
        }

        let pid = program.pid;
        match self.runner.stop(pid).await {
            Ok(()) => {
                self.logs.release(id);
                let p = self.set_stopped(id).await?;
                tracing::info!(program_id = id, pid, "program stopped");
                Ok(p)
            }
            Err(err) => {
                tracing::error!(program_id = id, pid, %err, "stop failed");
                if !self.runner.is_alive(pid).await {
                    self.logs.release(id);
                    if let Err(e) = self.set_stopped(id).await {
                        tracing::warn!(program_id = id, err = %e, "failed to record stop");
                    }
                }
                Err(err)
            }
        }
    }

    async fn owns_live_process(&self, program: &Program) -> bool {
        program.pid > 0
            && self.runner.is_alive(program.pid).await
            && self.runner.verify(program.pid, &program.command).await
    }

    async fn set_stopped(&self, id: &str) -> Result<Program> {
        self.store
            .update(|c| {
                let p = c
                    .get_mut(id)
                    .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
                if p.is_running() || p.pid != 0 {
                    p.mark_stopped(Utc::now());
                }
                Ok(p.clone())
            })
            .await
    }

    pub async fn batch_start(&self, ids: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for id in dedup(ids) {
            let outcome = match self.start(id).await {
                Ok(_) => BatchOutcome::Done {
                    status: "started".to_string(),
                },
                Err(err) => BatchOutcome::Failed {
                    error: err.to_string(),
                },
            };
            report.record(id, outcome);
        }
        tracing::info!(
            total = report.summary.total,
            success = report.summary.success,
            "batch start finished"
        );
        report
    }

    pub async fn batch_stop(&self, ids: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for id in dedup(ids) {
            let outcome = match self.stop(id).await {
                Ok(_) => BatchOutcome::Done {
                    status: "stopped".to_string(),
                },
                Err(err) => BatchOutcome::Failed {
                    error: err.to_string(),
                },
            };
            report.record(id, outcome);
        }
        tracing::info!(
            total = report.summary.total,
            success = report.summary.success,
            "batch stop finished"
        );
        report
    }

    /// Corrects the stored status of one program against the OS.
    pub async fn reconcile(&self, id: &str) -> Result<Program> {
        let program = self.get_by_id(id).await?;
        self.reconcile_one(program)
            .await?
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    /// Reconciles every record and returns the corrected list, oldest first.
    pub async fn reconcile_all(&self) -> Result<Vec<Program>> {
        let programs = self.store.load().await?.sorted();
        let mut out = Vec::with_capacity(programs.len());
        for program in programs {
            if let Some(p) = self.reconcile_one(program).await? {
                out.push(p);
            }
        }
        Ok(out)
    }

    pub async fn refresh_all(&self) -> Result<Vec<Program>> {
        self.reconcile_all().await
    }

    /// Probes outside the lock, then applies the correction only if the
    /// stored (status, pid) is still what was observed. `None` if the record
    /// was deleted meanwhile.
    async fn reconcile_one(&self, observed: Program) -> Result<Option<Program>> {
        let (status, pid) = if observed.pid != 0 && self.owns_live_process(&observed).await {
            (ProgramStatus::Running, observed.pid)
        } else {
            (ProgramStatus::Stopped, 0)
        };
        if observed.status == status && observed.pid == pid {
            return Ok(Some(observed));
        }

        let id = observed.id.as_str();
        let corrected = self
            .store
            .update(|c| {
                let Some(p) = c.get_mut(id) else {
                    return Ok(None);
                };
                if p.status != observed.status || p.pid != observed.pid {
                    // Someone else moved it first.
                    return Ok(Some(p.clone()));
                }
                match status {
                    ProgramStatus::Running => p.mark_running(pid, Utc::now()),
                    ProgramStatus::Stopped => p.mark_stopped(Utc::now()),
                }
                Ok(Some(p.clone()))
            })
            .await?;

        if let Some(p) = &corrected
            && p.status == status
            && p.pid == pid
        {
            tracing::info!(
                program_id = id,
                from_pid = observed.pid,
                from_status = %observed.status,
                to_status = %status,
                "reconciled program state"
            );
            if status == ProgramStatus::Stopped {
                self.logs.release(id);
            }
        }
        Ok(corrected)
    }

    pub async fn get_status(&self, id: &str) -> Result<Program> {
        self.reconcile(id).await
    }

    pub async fn get_status_all(&self) -> Result<Vec<Program>> {
        self.reconcile_all().await
    }

    pub async fn get_running(&self) -> Result<Vec<Program>> {
        Ok(self
            .reconcile_all()
            .await?
            .into_iter()
            .filter(Program::is_running)
            .collect())
    }

    pub async fn get_stopped(&self) -> Result<Vec<Program>> {
        Ok(self
            .reconcile_all()
            .await?
            .into_iter()
            .filter(|p| !p.is_running())
            .collect())
    }

    pub async fn get_with_memory(&self) -> Result<Vec<ProgramMemory>> {
        let programs = self.reconcile_all().await?;
        let mut out = Vec::with_capacity(programs.len());
        for p in programs {
            let (memory_usage, memory_kb, memory_mb) = if p.is_running() {
                let (kb, mb) = self.runner.memory(p.pid).await;
                let usage = if kb > 0 {
                    format_mb(mb)
                } else {
                    "0 KB".to_string()
                };
                (usage, Some(kb), Some(mb))
            } else {
                ("0 KB".to_string(), None, None)
            };
            out.push(ProgramMemory {
                id: p.id,
                name: p.name,
                command: p.command,
                status: p.status,
                pid: p.pid,
                memory_usage,
                memory_kb,
                memory_mb,
            });
        }
        Ok(out)
    }

    pub async fn program_memory(&self, id: &str) -> Result<ProcessMemory> {
        let program = self.reconcile(id).await?;
        if !program.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        let (kb, mb) = self.runner.memory(program.pid).await;
        Ok(ProcessMemory {
            id: program.id,
            pid: program.pid,
            memory_kb: kb,
            memory_mb: mb,
            memory_display: if kb > 0 {
                format_mb(mb)
            } else {
                "N/A".to_string()
            },
        })
    }

    pub async fn system_memory(&self) -> Result<SystemMemory> {
        self.runner.system_memory().await
    }

    pub async fn log_tail(&self, id: &str, limit: usize) -> Result<LogTail> {
        let program = self.get_by_id(id).await?;
        self.logs.tail(&program.id, limit).await
    }

    pub async fn export_catalog(&self, path: &Path) -> Result<()> {
        let catalog = self.store.load().await?;
        self.store.export(path, &catalog).await?;
        tracing::info!(path = %path.display(), programs = catalog.len(), "catalog exported");
        Ok(())
    }

    /// Parses a previously exported catalog. Nothing is persisted.
    pub async fn import_catalog(&self, path: &Path) -> Result<Catalog> {
        self.store.import(path).await
    }
}

fn dedup(ids: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    ids.iter()
        .map(|s| s.as_str())
        .filter(|id| seen.insert(*id))
        .collect()
}
