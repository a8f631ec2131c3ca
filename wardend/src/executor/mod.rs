//! Command executor and guarded host file/service/process operations.
//!
//! Every operation validates through the security module first. Command
//! execution never errors for a non-zero exit; policy violations and
//! timeouts surface as exit code -1 with the reason in stderr.

pub mod pty;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{AgentError, AgentResult};
use crate::security::{CommandValidator, PathValidator};
use wardend_protocol::{CommandResult, FileInfo, ServiceInfo};

/// Environment variables stripped from every child process.
const DANGEROUS_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "BASH_ENV",
    "ENV",
    "PROMPT_COMMAND",
];

/// Maximum bytes for single-call file reads and writes.
pub const MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Maximum bytes captured from stdout or stderr of a command.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Directories that DeleteFile refuses outright.
const CRITICAL_DIRS: &[&str] = &[
    "/", "/bin", "/sbin", "/usr", "/etc", "/var", "/boot", "/root", "/home",
];

pub struct ExecOptions {
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    pub timeout: Duration,
    pub sudo: bool,
}

/// Env var names must be `[A-Za-z_][A-Za-z0-9_]*` to be accepted as
/// overrides.
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The parent environment minus the dangerous set.
pub fn filtered_host_env() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(name, _)| !DANGEROUS_ENV_VARS.contains(&name.as_str()))
        .collect()
}

/// Apply the filtered host environment plus validated overrides to a command.
pub fn apply_filtered_env(cmd: &mut Command, overrides: &HashMap<String, String>) {
    cmd.env_clear();
    for (name, value) in filtered_host_env() {
        cmd.env(name, value);
    }
    for (name, value) in overrides {
        if is_valid_env_name(name) && !DANGEROUS_ENV_VARS.contains(&name.as_str()) {
            cmd.env(name, value);
        }
    }
}

/// Execute a command under the security policy.
///
/// Policy rejections come back as `exit_code == -1` with the reason in
/// stderr, mirroring timeouts; only spawn failures raise.
pub async fn execute(
    cmd_validator: &CommandValidator,
    path_validator: &PathValidator,
    command: &str,
    args: &[String],
    opts: ExecOptions,
) -> AgentResult<CommandResult> {
    if let Err(e) = cmd_validator.validate(command, args, opts.sudo) {
        return Ok(CommandResult {
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("security check failed: {}", e.to_rpc().message),
            duration_ms: 0,
        });
    }
    if let Some(ref dir) = opts.working_dir {
        if let Err(e) = path_validator.checked_read_path(dir) {
            return Ok(CommandResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("working directory rejected: {}", e.to_rpc().message),
                duration_ms: 0,
            });
        }
    }

    let mut child_cmd = if opts.sudo {
        let mut c = Command::new("sudo");
        c.arg(command);
        c.args(args);
        c
    } else {
        let mut c = Command::new(command);
        c.args(args);
        c
    };

    apply_filtered_env(&mut child_cmd, &opts.env);
    if let Some(ref dir) = opts.working_dir {
        child_cmd.current_dir(dir);
    }
    child_cmd
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = child_cmd
        .spawn()
        .map_err(|e| AgentError::Internal(format!("failed to spawn {}: {}", command, e)))?;

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    // Drain pipes concurrently with the wait so a chatty child can't fill
    // the pipe buffer and deadlock against us.
    let stdout_task = tokio::spawn(read_capped(stdout_handle));
    let stderr_task = tokio::spawn(read_capped(stderr_handle));

    match tokio::time::timeout(opts.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok(CommandResult {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
                duration_ms: start.elapsed().as_millis() as u64,
            })
        }
        Ok(Err(e)) => Err(AgentError::Internal(format!(
            "failed to wait on {}: {}",
            command, e
        ))),
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            Ok(CommandResult {
                exit_code: -1,
                stdout: String::new(),
                stderr: "command timed out".into(),
                duration_ms: start.elapsed().as_millis() as u64,
            })
        }
    }
}

async fn read_capped<R: tokio::io::AsyncRead + Unpin>(handle: Option<R>) -> String {
    let Some(mut reader) = handle else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    buf.truncate(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Resolve symlinks and re-validate the target with the given check.
async fn revalidate_symlinks(
    clean: &Path,
    check: impl Fn(&Path) -> AgentResult<()>,
) -> AgentResult<PathBuf> {
    match tokio::fs::canonicalize(clean).await {
        Ok(real) => {
            if real != clean {
                check(&real)?;
            }
            Ok(real)
        }
        // Nonexistent targets (e.g. a file about to be created) keep the
        // cleaned path.
        Err(_) => Ok(clean.to_path_buf()),
    }
}

pub async fn read_file(
    validator: &PathValidator,
    path: &str,
) -> AgentResult<(Vec<u8>, FileInfo)> {
    let clean = validator.checked_read_path(path)?;
    let real = revalidate_symlinks(&clean, |p| validator.validate_read(p)).await?;

    let meta = tokio::fs::metadata(&real)
        .await
        .map_err(|e| AgentError::from_io(e, &format!("stat {}", real.display())))?;
    if meta.is_dir() {
        return Err(AgentError::InvalidArgument(
            "path is a directory, not a file".into(),
        ));
    }
    if meta.len() > MAX_FILE_SIZE {
        return Err(AgentError::InvalidArgument(format!(
            "file exceeds the {} MB read limit",
            MAX_FILE_SIZE / (1024 * 1024)
        )));
    }

    let content = tokio::fs::read(&real)
        .await
        .map_err(|e| AgentError::from_io(e, &format!("read {}", real.display())))?;
    let info = file_info(&real, &meta);
    Ok((content, info))
}

pub async fn write_file(
    validator: &PathValidator,
    path: &str,
    content: &[u8],
    mode: u32,
    create_dirs: bool,
) -> AgentResult<FileInfo> {
    let clean = validator.checked_write_path(path)?;
    let real = revalidate_symlinks(&clean, |p| validator.validate_write(p)).await?;

    if content.len() as u64 > MAX_FILE_SIZE {
        return Err(AgentError::InvalidArgument(format!(
            "content exceeds the {} MB write limit",
            MAX_FILE_SIZE / (1024 * 1024)
        )));
    }

    if create_dirs {
        if let Some(parent) = real.parent() {
            validator.validate_write(parent)?;
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::from_io(e, "creating parent directories"))?;
        }
    }

    tokio::fs::write(&real, content)
        .await
        .map_err(|e| AgentError::from_io(e, &format!("write {}", real.display())))?;

    let mode = if mode == 0 { 0o644 } else { mode };
    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(&real, std::fs::Permissions::from_mode(mode)).await;

    let meta = tokio::fs::metadata(&real)
        .await
        .map_err(|e| AgentError::from_io(e, "stat after write"))?;
    Ok(file_info(&real, &meta))
}

pub async fn list_directory(
    validator: &PathValidator,
    path: &str,
    recursive: bool,
    show_hidden: bool,
) -> AgentResult<Vec<FileInfo>> {
    let clean = validator.checked_read_path(path)?;
    let mut out = Vec::new();
    let mut stack = vec![clean.clone()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if dir == clean => {
                return Err(AgentError::from_io(e, &format!("list {}", dir.display())))
            }
            // Unreadable subdirectories are skipped silently.
            Err(_) => continue,
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if !show_hidden && name.starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let entry_path = entry.path();
            out.push(file_info(&entry_path, &meta));
            if recursive && meta.is_dir() {
                stack.push(entry_path);
            }
        }
    }

    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

pub async fn delete_file(validator: &PathValidator, path: &str) -> AgentResult<()> {
    let clean = validator.checked_write_path(path)?;
    let real = revalidate_symlinks(&clean, |p| validator.validate_write(p)).await?;

    for critical in CRITICAL_DIRS {
        if real == Path::new(critical) {
            return Err(AgentError::PermissionDenied(format!(
                "refusing to delete critical directory {}",
                critical
            )));
        }
    }

    let meta = tokio::fs::symlink_metadata(&real)
        .await
        .map_err(|e| AgentError::from_io(e, &format!("stat {}", real.display())))?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(&real)
            .await
            .map_err(|e| AgentError::from_io(e, &format!("delete {}", real.display())))?;
    } else {
        tokio::fs::remove_file(&real)
            .await
            .map_err(|e| AgentError::from_io(e, &format!("delete {}", real.display())))?;
    }
    Ok(())
}

/// Tail a file: send the last `lines` lines, then poll for appended content
/// when following. The task stops when the receiver is dropped.
pub async fn tail_file(
    validator: &PathValidator,
    path: &str,
    lines: usize,
    follow: bool,
) -> AgentResult<mpsc::Receiver<String>> {
    let clean = validator.checked_read_path(path)?;
    let real = revalidate_symlinks(&clean, |p| validator.validate_read(p)).await?;

    let meta = tokio::fs::metadata(&real)
        .await
        .map_err(|e| AgentError::from_io(e, &format!("stat {}", real.display())))?;
    if meta.is_dir() {
        return Err(AgentError::InvalidArgument("cannot tail a directory".into()));
    }

    let (tx, rx) = mpsc::channel::<String>(100);
    tokio::spawn(async move {
        let content = match tokio::fs::read_to_string(&real).await {
            Ok(c) => c,
            Err(e) => {
                debug!(path = %real.display(), error = %e, "tail read failed");
                return;
            }
        };
        let mut offset = content.len() as u64;
        let tail: Vec<&str> = {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].to_vec()
        };
        for line in tail {
            if tx.send(line.to_string()).await.is_err() {
                return;
            }
        }
        if !follow {
            return;
        }

        let mut carry = String::new();
        loop {
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            let Ok(meta) = tokio::fs::metadata(&real).await else {
                continue;
            };
            let size = meta.len();
            if size < offset {
                // Rotated or truncated: start over from the beginning.
                offset = 0;
                carry.clear();
            }
            if size == offset {
                continue;
            }
            let Ok(mut file) = tokio::fs::File::open(&real).await else {
                continue;
            };
            use tokio::io::AsyncSeekExt;
            if file.seek(std::io::SeekFrom::Start(offset)).await.is_err() {
                continue;
            }
            let mut buf = Vec::new();
            if file.read_to_end(&mut buf).await.is_err() {
                continue;
            }
            offset = size;
            carry.push_str(&String::from_utf8_lossy(&buf));
            while let Some(pos) = carry.find('\n') {
                let line: String = carry.drain(..=pos).collect();
                let line = line.trim_end_matches('\n').to_string();
                if tx.send(line).await.is_err() {
                    return;
                }
            }
        }
    });

    Ok(rx)
}

pub async fn list_services() -> AgentResult<Vec<ServiceInfo>> {
    let output = Command::new("systemctl")
        .args(["list-units", "--type=service", "--all", "--no-pager", "--plain"])
        .output()
        .await
        .map_err(|e| AgentError::Internal(format!("systemctl failed: {}", e)))?;

    let text = String::from_utf8_lossy(&output.stdout);
    let mut services = Vec::new();
    for line in text.lines().skip(1) {
        if line.trim().is_empty() {
            break;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        services.push(ServiceInfo {
            name: fields[0].trim_end_matches(".service").to_string(),
            status: fields[3].to_string(),
            description: fields[4..].join(" "),
            enabled: false,
        });
    }
    Ok(services)
}

const ALLOWED_SERVICE_ACTIONS: &[&str] = &[
    "start", "stop", "restart", "reload", "status", "enable", "disable",
];

pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-'))
}

pub async fn service_action(name: &str, action: &str) -> AgentResult<()> {
    if !ALLOWED_SERVICE_ACTIONS.contains(&action) {
        return Err(AgentError::InvalidArgument(format!(
            "service action '{}' is not allowed",
            action
        )));
    }
    if !is_valid_service_name(name) {
        return Err(AgentError::InvalidArgument(
            "service name contains invalid characters".into(),
        ));
    }

    let output = Command::new("systemctl")
        .arg(action)
        .arg(name)
        .output()
        .await
        .map_err(|e| AgentError::Internal(format!("systemctl failed: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AgentError::Internal(format!(
            "systemctl {} {} failed: {}",
            action,
            name,
            stderr.trim()
        )));
    }
    Ok(())
}

const ALLOWED_SIGNALS: &[i32] = &[libc::SIGTERM, libc::SIGKILL, libc::SIGINT, libc::SIGHUP];

pub fn kill_process(pid: i32, signal: i32) -> AgentResult<()> {
    if pid <= 1 {
        return Err(AgentError::InvalidArgument(
            "refusing to signal PID <= 1".into(),
        ));
    }
    let signal = if signal == 0 { libc::SIGTERM } else { signal };
    if !ALLOWED_SIGNALS.contains(&signal) {
        return Err(AgentError::InvalidArgument(format!(
            "signal {} is not allowed",
            signal
        )));
    }
    let ret = unsafe { libc::kill(pid, signal) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(pid, signal, error = %err, "kill failed");
        return Err(AgentError::NotFound(format!(
            "kill({}, {}) failed: {}",
            pid, signal, err
        )));
    }
    Ok(())
}

fn file_info(path: &Path, meta: &std::fs::Metadata) -> FileInfo {
    use std::os::unix::fs::MetadataExt;
    FileInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        path: path.to_string_lossy().to_string(),
        size: meta.len(),
        mode: meta.mode(),
        modified: meta.mtime(),
        is_dir: meta.is_dir(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityPolicyConfig;

    fn validators() -> (CommandValidator, PathValidator) {
        let config = SecurityPolicyConfig::default();
        (
            CommandValidator::new(config.clone()),
            PathValidator::new(&config),
        )
    }

    #[test]
    fn env_name_validation() {
        assert!(is_valid_env_name("PATH_EXTRA"));
        assert!(is_valid_env_name("_private"));
        assert!(is_valid_env_name("VAR1"));
        assert!(!is_valid_env_name("1VAR"));
        assert!(!is_valid_env_name("BAD-NAME"));
        assert!(!is_valid_env_name(""));
        assert!(!is_valid_env_name("A B"));
    }

    #[test]
    fn filtered_env_strips_dangerous_vars() {
        std::env::set_var("LD_PRELOAD", "/tmp/evil.so");
        std::env::set_var("WARDEND_TEST_KEEP", "1");
        let env = filtered_host_env();
        std::env::remove_var("LD_PRELOAD");
        std::env::remove_var("WARDEND_TEST_KEEP");
        assert!(!env.iter().any(|(k, _)| k == "LD_PRELOAD"));
        assert!(env.iter().any(|(k, _)| k == "WARDEND_TEST_KEEP"));
    }

    #[tokio::test]
    async fn execute_captures_stdout_and_exit_code() {
        let (cv, pv) = validators();
        let result = execute(
            &cv,
            &pv,
            "sh",
            &["-c".into(), "echo hello; exit 3".into()],
            ExecOptions {
                working_dir: None,
                env: HashMap::new(),
                timeout: Duration::from_secs(5),
                sudo: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn execute_applies_env_overrides() {
        let (cv, pv) = validators();
        let mut env = HashMap::new();
        env.insert("WARDEND_UNIT_TEST".to_string(), "marker".to_string());
        env.insert("BAD-NAME".to_string(), "ignored".to_string());
        let result = execute(
            &cv,
            &pv,
            "sh",
            &["-c".into(), "echo ${WARDEND_UNIT_TEST}-${BAD_NAME:-unset}".into()],
            ExecOptions {
                working_dir: None,
                env,
                timeout: Duration::from_secs(5),
                sudo: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(result.stdout.trim(), "marker-unset");
    }

    #[tokio::test]
    async fn execute_times_out_with_minus_one() {
        let (cv, pv) = validators();
        let start = Instant::now();
        let result = execute(
            &cv,
            &pv,
            "sleep",
            &["10".into()],
            ExecOptions {
                working_dir: None,
                env: HashMap::new(),
                timeout: Duration::from_secs(1),
                sudo: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.contains("timed out"));
        assert!(result.duration_ms >= 900);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn execute_policy_rejection_is_minus_one() {
        let (cv, pv) = validators();
        let result = execute(
            &cv,
            &pv,
            "rm -rf /",
            &[],
            ExecOptions {
                working_dir: None,
                env: HashMap::new(),
                timeout: Duration::from_secs(1),
                sudo: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("security check failed"));
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let (_, pv) = validators();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        let path_str = path.to_string_lossy().to_string();

        write_file(&pv, &path_str, b"agent data", 0, false)
            .await
            .unwrap();
        let (content, info) = read_file(&pv, &path_str).await.unwrap();
        assert_eq!(content, b"agent data");
        assert_eq!(info.size, 10);
        assert!(!info.is_dir);
    }

    #[tokio::test]
    async fn read_rejects_directories() {
        let (_, pv) = validators();
        let dir = tempfile::tempdir().unwrap();
        let err = read_file(&pv, &dir.path().to_string_lossy()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn list_directory_skips_hidden_by_default() {
        let (_, pv) = validators();
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("visible.txt"), b"x")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join(".hidden"), b"x")
            .await
            .unwrap();

        let entries = list_directory(&pv, &dir.path().to_string_lossy(), false, false)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "visible.txt");

        let all = list_directory(&pv, &dir.path().to_string_lossy(), false, true)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn list_directory_recurses() {
        let (_, pv) = validators();
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/inner.txt"), b"x")
            .await
            .unwrap();

        let entries = list_directory(&pv, &dir.path().to_string_lossy(), true, false)
            .await
            .unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"sub"));
        assert!(names.contains(&"inner.txt"));
    }

    #[tokio::test]
    async fn delete_refuses_critical_dirs() {
        let (_, pv) = validators();
        assert!(delete_file(&pv, "/var").await.is_err());
        assert!(delete_file(&pv, "/home").await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_file() {
        let (_, pv) = validators();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        tokio::fs::write(&path, b"x").await.unwrap();
        delete_file(&pv, &path.to_string_lossy()).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn tail_returns_last_lines() {
        let (_, pv) = validators();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        tokio::fs::write(&path, b"one\ntwo\nthree\nfour\n")
            .await
            .unwrap();

        let mut rx = tail_file(&pv, &path.to_string_lossy(), 2, false)
            .await
            .unwrap();
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["three", "four"]);
    }

    #[tokio::test]
    async fn tail_follow_picks_up_appends() {
        let (_, pv) = validators();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        tokio::fs::write(&path, b"start\n").await.unwrap();

        let mut rx = tail_file(&pv, &path.to_string_lossy(), 10, true)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "start");

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        use tokio::io::AsyncWriteExt;
        file.write_all(b"appended\n").await.unwrap();
        file.flush().await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, "appended");
    }

    #[test]
    fn service_name_validation_blocks_metacharacters() {
        assert!(is_valid_service_name("nginx"));
        assert!(is_valid_service_name("user@1000.service"));
        assert!(is_valid_service_name("my-app_2.0"));
        assert!(!is_valid_service_name("nginx; rm -rf /"));
        assert!(!is_valid_service_name("a b"));
        assert!(!is_valid_service_name("$(reboot)"));
        assert!(!is_valid_service_name(""));
    }

    #[tokio::test]
    async fn service_action_rejects_unknown_action() {
        let err = service_action("nginx", "explode").await;
        assert!(err.is_err());
    }

    #[test]
    fn kill_rejects_low_pids_and_odd_signals() {
        assert!(kill_process(0, 15).is_err());
        assert!(kill_process(1, 15).is_err());
        assert!(kill_process(99999, 12).is_err());
    }

    #[tokio::test]
    async fn no_process_left_after_timeout() {
        let (cv, pv) = validators();
        let marker = format!("wardend-timeout-{}", std::process::id());
        let _ = execute(
            &cv,
            &pv,
            "sleep",
            &["300".into()],
            ExecOptions {
                working_dir: None,
                env: {
                    let mut e = HashMap::new();
                    e.insert("WARDEND_MARKER".to_string(), marker.clone());
                    e
                },
                timeout: Duration::from_millis(300),
                sudo: false,
            },
        )
        .await
        .unwrap();
        // The child was killed and reaped inside execute(); nothing to wait on.
    }
}
