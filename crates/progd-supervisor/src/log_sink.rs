//! Per-launch capture files for child stdout/stderr. The sink only creates
//! and hands out descriptors; the child writes to them directly.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use progd_process::{LogTail, ProgramId};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{
    error::{Result, SupervisorError},
    runner::LaunchStreams,
};

pub const DEFAULT_TAIL_LINES: usize = 100;
pub const MAX_TAIL_LINES: usize = 5_000;
pub const START_FAILURE_TAIL_BYTES: usize = 2 * 1024;

const TAIL_WINDOW_BYTES: u64 = 512 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

#[derive(Debug)]
struct OpenLaunch {
    paths: LaunchPaths,
    _stdout: std::fs::File,
    _stderr: std::fs::File,
}

#[derive(Debug)]
pub struct LogSink {
    dir: PathBuf,
    open: Mutex<HashMap<String, OpenLaunch>>,
}

// Keeps file names inside the log directory whatever the id looks like.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn launch_timestamp(file_name: &str, stem: &str) -> Option<u64> {
    file_name
        .strip_prefix(stem)?
        .strip_prefix('_')?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

fn split_lines_from_tail(buf: &[u8], max_lines: usize) -> Vec<String> {
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

fn truncate_utf8_tail(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let prefix = "(truncated)…";
    let keep = max_bytes.saturating_sub(prefix.len()).max(1);
    let mut start = s.len() - keep.min(s.len());
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    format!("{prefix}{}", &s[start..])
}

async fn read_tail(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    let mut f = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(SupervisorError::io(
                format!("failed to open {}", path.display()),
                e,
            ));
        }
    };
    let size = f
        .metadata()
        .await
        .map_err(|e| SupervisorError::io("failed to stat log file", e))?
        .len();
    let start = size.saturating_sub(TAIL_WINDOW_BYTES);
    f.seek(std::io::SeekFrom::Start(start))
        .await
        .map_err(|e| SupervisorError::io("failed to seek log file", e))?;

    let mut buf = Vec::with_capacity((size - start) as usize);
    f.read_to_end(&mut buf)
        .await
        .map_err(|e| SupervisorError::io("failed to read log file", e))?;

    let mut lines = split_lines_from_tail(&buf, max_lines.saturating_add(1));
    // The first line of a mid-file window is usually partial.
    if start > 0 && lines.len() > max_lines {
        lines.remove(0);
    }
    if lines.len() > max_lines {
        lines.drain(0..(lines.len() - max_lines));
    }
    Ok(lines)
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub async fn open_launch(&self, id: &str) -> Result<(LaunchStreams, LaunchPaths)> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            SupervisorError::io(format!("failed to create {}", self.dir.display()), e)
        })?;

        let ts = chrono::Utc::now().timestamp().max(0);
        let stdout_path = self.dir.join(format!("{}_{ts}.log", file_stem(id)));
        let stderr_path = self.dir.join(format!("{}_{ts}.log.err", file_stem(id)));

        let stdout = create(&stdout_path).await?;
        let stderr = create(&stderr_path).await?;
        let streams = LaunchStreams {
            stdout: stdout
                .try_clone()
                .map_err(|e| SupervisorError::io("failed to dup stdout", e))?,
            stderr: stderr
                .try_clone()
                .map_err(|e| SupervisorError::io("failed to dup stderr", e))?,
        };

        let paths = LaunchPaths {
            stdout: stdout_path,
            stderr: stderr_path,
        };
        let previous = self.lock().insert(
            id.to_string(),
            OpenLaunch {
                paths: paths.clone(),
                _stdout: stdout,
                _stderr: stderr,
            },
        );
        if previous.is_some() {
            tracing::debug!(program_id = id, "replaced stale launch logs");
        }
        Ok((streams, paths))
    }

    pub fn release(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    fn current(&self, id: &str) -> Option<LaunchPaths> {
        self.lock().get(id).map(|l| l.paths.clone())
    }

    pub async fn latest(&self, id: &str) -> Result<Option<LaunchPaths>> {
        let stem = file_stem(id);
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SupervisorError::io(
                    format!("failed to list {}", self.dir.display()),
                    e,
                ));
            }
        };

        let mut best: Option<(u64, PathBuf)> = None;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| SupervisorError::io("failed to list log dir", e))?
        {
            let name = entry.file_name();
            let Some(ts) = name.to_str().and_then(|n| launch_timestamp(n, &stem)) else {
                continue;
            };
            if best.as_ref().is_none_or(|(b, _)| ts > *b) {
                best = Some((ts, entry.path()));
            }
        }

        Ok(best.map(|(_, stdout)| {
            let mut err = stdout.clone().into_os_string();
            err.push(".err");
            LaunchPaths {
                stdout,
                stderr: PathBuf::from(err),
            }
        }))
    }

    pub async fn tail(&self, id: &ProgramId, limit: usize) -> Result<LogTail> {
        let limit = limit.clamp(1, MAX_TAIL_LINES);
        let open = self.current(id.as_str());
        let paths = match open {
            Some(paths) => Some(paths),
            None => self.latest(id.as_str()).await?,
        };
        let Some(paths) = paths else {
            return Ok(LogTail {
                id: id.clone(),
                ..Default::default()
            });
        };

        Ok(LogTail {
            id: id.clone(),
            stdout_file: paths
                .stdout
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            stdout: read_tail(&paths.stdout, limit).await?,
            stderr: read_tail(&paths.stderr, limit).await?,
        })
    }

    pub async fn stderr_excerpt(&self, paths: &LaunchPaths) -> Option<String> {
        let lines = read_tail(&paths.stderr, 20).await.ok()?;
        let text = lines.join("\n");
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(truncate_utf8_tail(text, START_FAILURE_TAIL_BYTES))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, OpenLaunch>> {
        self.open.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn create(path: &Path) -> Result<std::fs::File> {
    let f = tokio::fs::File::create(path)
        .await
        .map_err(|e| SupervisorError::io(format!("failed to create {}", path.display()), e))?;
    Ok(f.into_std().await)
}
