//! Command and path policy validators.
//!
//! Every command execution and file operation passes through here before any
//! process is spawned or byte is written. Callers that resolve symlinks must
//! re-validate the resolved target.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::config::SecurityPolicyConfig;
use crate::error::{AgentError, AgentResult};

/// Substrings that are always rejected, compared case-insensitively against
/// the full command line.
const DANGEROUS_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    "mkfs",
    "fdisk",
    "parted",
    "dd if=/dev/zero",
    ":(){ :|:& };:",
    "chmod 777 /",
    "chown -r /",
    "nmap -ss",
    "hping3",
    "slowloris",
    "> /dev/sda",
    "mv /* /dev/null",
];

/// Commands permitted when whitelist mode is on. Matched on the basename.
const COMMAND_WHITELIST: &[&str] = &[
    // system info
    "uname", "hostname", "uptime", "whoami", "id", "date",
    // read-only file tools
    "ls", "cat", "head", "tail", "file", "stat", "wc", "du", "df", "find",
    "which", "readlink",
    // text processing
    "grep", "awk", "sed", "cut", "sort", "uniq", "tr", "diff",
    // network diagnostics
    "ping", "traceroute", "nslookup", "dig", "host", "ss", "ip", "curl", "wget",
    // processes and services
    "ps", "top", "pgrep", "pidof", "lsof", "systemctl", "service", "journalctl",
    // containers and packages
    "docker", "docker-compose", "apt", "apt-get", "yum", "dnf", "dpkg",
    // shells and scripting
    "bash", "sh", "dash", "zsh", "echo", "printf", "env", "printenv",
    // archives and file management
    "tar", "gzip", "gunzip", "zip", "unzip", "mkdir", "cp", "mv", "rm",
    "touch", "chmod", "chown", "tee", "ln", "sleep",
    // toolchains
    "git", "npm", "node", "python", "python3", "pip", "pip3", "go",
    "openssl", "ssh-keygen",
];

/// Paths no request may read.
const FORBIDDEN_PATHS: &[&str] = &["/etc/shadow", "/etc/sudoers", "/root/.ssh"];

/// Additional prefixes no request may write.
const WRITE_RESTRICTED_PATHS: &[&str] = &[
    "/etc/passwd",
    "/etc/group",
    "/etc/shadow",
    "/etc/sudoers",
    "/etc/ssh/sshd_config",
    "/etc/crontab",
    "/boot",
    "/usr/bin",
    "/usr/sbin",
    "/bin",
    "/sbin",
];

fn dangerous_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r"rm\s+(-[rf]+\s+)*(/\s|/\*|\.\.)").unwrap(),
                "dangerous rm invocation",
            ),
            (
                Regex::new(r">\s*/dev/[sh]d[a-z]").unwrap(),
                "write to raw disk device",
            ),
            (
                Regex::new(r"dd\s+.*of=/dev/[sh]d[a-z]").unwrap(),
                "dd onto raw disk device",
            ),
            (Regex::new(r":\(\)\s*\{.*\}").unwrap(), "fork bomb"),
        ]
    })
}

pub struct CommandValidator {
    config: SecurityPolicyConfig,
}

impl CommandValidator {
    pub fn new(config: SecurityPolicyConfig) -> Self {
        Self { config }
    }

    /// Reject commands that exceed limits, request disallowed sudo, or match
    /// the dangerous substring/pattern sets.
    pub fn validate(&self, command: &str, args: &[String], sudo: bool) -> AgentResult<()> {
        let full = if args.is_empty() {
            command.to_string()
        } else {
            format!("{} {}", command, args.join(" "))
        };
        if full.len() > self.config.max_command_length {
            return Err(AgentError::PermissionDenied(format!(
                "command length exceeds limit ({} > {})",
                full.len(),
                self.config.max_command_length
            )));
        }
        if args.len() > self.config.max_arguments {
            return Err(AgentError::PermissionDenied(format!(
                "argument count exceeds limit ({} > {})",
                args.len(),
                self.config.max_arguments
            )));
        }
        if sudo && !self.config.allow_sudo {
            return Err(AgentError::PermissionDenied(
                "sudo execution is disabled".into(),
            ));
        }

        let lowered = full.to_lowercase();
        for dangerous in DANGEROUS_COMMANDS {
            if lowered.contains(dangerous) {
                return Err(AgentError::PermissionDenied(format!(
                    "dangerous command detected: {}",
                    dangerous
                )));
            }
        }
        for (pattern, desc) in dangerous_patterns() {
            if pattern.is_match(&lowered) {
                return Err(AgentError::PermissionDenied(format!(
                    "dangerous pattern detected: {}",
                    desc
                )));
            }
        }

        if self.config.enable_command_whitelist && !self.is_whitelisted(command) {
            return Err(AgentError::PermissionDenied(format!(
                "command '{}' is not in the allowed set",
                command
            )));
        }

        Ok(())
    }

    fn is_whitelisted(&self, command: &str) -> bool {
        let base = Path::new(command)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| command.to_string());
        COMMAND_WHITELIST.contains(&base.as_str()) || COMMAND_WHITELIST.contains(&command)
    }
}

pub struct PathValidator {
    extra_forbidden: Vec<PathBuf>,
}

impl PathValidator {
    pub fn new(config: &SecurityPolicyConfig) -> Self {
        Self {
            extra_forbidden: config.forbidden_paths.iter().map(PathBuf::from).collect(),
        }
    }

    /// Lexically clean an absolute path, rejecting traversal that escapes the
    /// root. The result contains no `.` or `..` components.
    pub fn sanitize(&self, path: &str) -> AgentResult<PathBuf> {
        sanitize_path(path)
    }

    /// Reject paths whose prefix matches a forbidden entry.
    pub fn validate_read(&self, path: &Path) -> AgentResult<()> {
        for forbidden in FORBIDDEN_PATHS {
            if path.starts_with(forbidden) {
                return Err(AgentError::PermissionDenied(format!(
                    "access to {} is forbidden",
                    forbidden
                )));
            }
        }
        for forbidden in &self.extra_forbidden {
            if path.starts_with(forbidden) {
                return Err(AgentError::PermissionDenied(format!(
                    "access to {} is forbidden",
                    forbidden.display()
                )));
            }
        }
        Ok(())
    }

    /// Read rules plus the protected system path set.
    pub fn validate_write(&self, path: &Path) -> AgentResult<()> {
        self.validate_read(path)?;
        for restricted in WRITE_RESTRICTED_PATHS {
            if path.starts_with(restricted) {
                return Err(AgentError::PermissionDenied(format!(
                    "writing under {} is forbidden",
                    restricted
                )));
            }
        }
        Ok(())
    }

    /// Sanitize then validate for reading in one step.
    pub fn checked_read_path(&self, path: &str) -> AgentResult<PathBuf> {
        let clean = self.sanitize(path)?;
        self.validate_read(&clean)?;
        Ok(clean)
    }

    /// Sanitize then validate for writing in one step.
    pub fn checked_write_path(&self, path: &str) -> AgentResult<PathBuf> {
        let clean = self.sanitize(path)?;
        self.validate_write(&clean)?;
        Ok(clean)
    }
}

/// Lexical path cleanup: resolves `.` and `..` without touching the
/// filesystem. Rejects relative paths and any `..` that would climb above
/// the root.
pub fn sanitize_path(path: &str) -> AgentResult<PathBuf> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(AgentError::InvalidArgument(
            "path must be absolute".into(),
        ));
    }
    let mut clean = PathBuf::from("/");
    for component in p.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() || clean.as_os_str() == "" {
                    return Err(AgentError::InvalidArgument(
                        "path traversal detected".into(),
                    ));
                }
                if clean.as_os_str().is_empty() {
                    clean = PathBuf::from("/");
                }
            }
            Component::Normal(part) => clean.push(part),
            Component::Prefix(_) => {
                return Err(AgentError::InvalidArgument("invalid path prefix".into()))
            }
        }
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd_validator() -> CommandValidator {
        CommandValidator::new(SecurityPolicyConfig::default())
    }

    fn path_validator() -> PathValidator {
        PathValidator::new(&SecurityPolicyConfig::default())
    }

    #[test]
    fn plain_command_passes() {
        let v = cmd_validator();
        assert!(v.validate("ls", &["-la".into()], false).is_ok());
        assert!(v.validate("systemctl", &["status".into(), "nginx".into()], false).is_ok());
    }

    #[test]
    fn every_dangerous_substring_is_rejected() {
        let v = cmd_validator();
        for dangerous in DANGEROUS_COMMANDS {
            let err = v.validate(dangerous, &[], false);
            assert!(err.is_err(), "expected rejection for {:?}", dangerous);
        }
    }

    #[test]
    fn dangerous_substrings_rejected_regardless_of_case() {
        let v = cmd_validator();
        assert!(v.validate("RM -RF /", &[], false).is_err());
        assert!(v.validate("MKFS.ext4", &["/dev/sda1".into()], false).is_err());
    }

    #[test]
    fn dangerous_patterns_rejected_with_whitespace_variants() {
        let v = cmd_validator();
        assert!(v.validate("rm", &["-rf".into(), "/ ".into()], false).is_err());
        assert!(v.validate("sh", &["-c".into(), "echo x > /dev/sda".into()], false).is_err());
        assert!(v
            .validate("dd", &["if=/x".into(), "of=/dev/hdb".into()], false)
            .is_err());
        assert!(v.validate(":(){ :|:& };:", &[], false).is_err());
    }

    #[test]
    fn sudo_rejected_when_disallowed() {
        let mut config = SecurityPolicyConfig::default();
        config.allow_sudo = false;
        let v = CommandValidator::new(config);
        assert!(v.validate("apt", &["update".into()], true).is_err());
        assert!(v.validate("apt", &["update".into()], false).is_ok());
    }

    #[test]
    fn oversized_command_rejected() {
        let mut config = SecurityPolicyConfig::default();
        config.max_command_length = 10;
        let v = CommandValidator::new(config);
        assert!(v.validate("echo", &["aaaaaaaaaaaaaaa".into()], false).is_err());
    }

    #[test]
    fn too_many_arguments_rejected() {
        let mut config = SecurityPolicyConfig::default();
        config.max_arguments = 2;
        let v = CommandValidator::new(config);
        let args = vec!["a".into(), "b".into(), "c".into()];
        assert!(v.validate("echo", &args, false).is_err());
    }

    #[test]
    fn whitelist_mode_checks_basename() {
        let mut config = SecurityPolicyConfig::default();
        config.enable_command_whitelist = true;
        let v = CommandValidator::new(config);
        assert!(v.validate("/usr/bin/ls", &[], false).is_ok());
        assert!(v.validate("ls", &[], false).is_ok());
        assert!(v.validate("/opt/custom/evilbin", &[], false).is_err());
    }

    #[test]
    fn sanitize_rejects_relative_paths() {
        assert!(sanitize_path("etc/passwd").is_err());
        assert!(sanitize_path("./x").is_err());
    }

    #[test]
    fn sanitize_cleans_inner_dotdot() {
        let clean = sanitize_path("/var/log/../lib/wardend").unwrap();
        assert_eq!(clean, PathBuf::from("/var/lib/wardend"));
    }

    #[test]
    fn sanitize_rejects_escape_above_root() {
        assert!(sanitize_path("/../etc/passwd").is_err());
        assert!(sanitize_path("/a/../../etc").is_err());
    }

    #[test]
    fn read_validation_blocks_forbidden_paths() {
        let v = path_validator();
        assert!(v.checked_read_path("/etc/shadow").is_err());
        assert!(v.checked_read_path("/root/.ssh/id_rsa").is_err());
        assert!(v.checked_read_path("/var/log/syslog").is_ok());
    }

    #[test]
    fn write_validation_blocks_protected_system_paths() {
        let v = path_validator();
        assert!(v.checked_write_path("/etc/passwd").is_err());
        assert!(v.checked_write_path("/boot/grub/grub.cfg").is_err());
        assert!(v.checked_write_path("/usr/bin/ls").is_err());
        assert!(v.checked_write_path("/sbin/init").is_err());
        assert!(v.checked_write_path("/etc/ssh/sshd_config").is_err());
        assert!(v.checked_write_path("/tmp/upload.bin").is_ok());
        assert!(v.checked_write_path("/home/user/notes.txt").is_ok());
    }

    #[test]
    fn write_validation_allows_reads_only_paths() {
        let v = path_validator();
        // Readable but not writable.
        assert!(v.checked_read_path("/usr/bin/ls").is_ok());
        assert!(v.checked_write_path("/usr/bin/ls").is_err());
    }

    #[test]
    fn traversal_through_allowed_prefix_is_caught() {
        let v = path_validator();
        // Cleans to /etc/shadow, which is forbidden.
        assert!(v.checked_read_path("/var/../etc/shadow").is_err());
    }

    #[test]
    fn extra_forbidden_paths_from_config() {
        let mut config = SecurityPolicyConfig::default();
        config.forbidden_paths = vec!["/opt/secrets".into()];
        let v = PathValidator::new(&config);
        assert!(v.checked_read_path("/opt/secrets/key").is_err());
        assert!(v.checked_read_path("/opt/public").is_ok());
    }
}
