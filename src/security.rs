// Security policy enforced by an `AgentWorker` before dispatch, per spec.md
// 4.2.3: a blocked-command denylist and an environment allowlist.

use std::collections::HashMap;

/// Substrings that, if present anywhere in `task.command`, short-circuit
/// execution with `BLOCKED_COMMAND`.
pub const BLOCKED_COMMANDS: &[&str] = &[
    "rm -rf /",
    "mkfs",
    "dd if=/dev/zero",
    ":(){ :|:& };:",
    ":(){:|:&};:",
    "chmod -R 777 /",
    "chown -R",
    "sudo rm",
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    "iptables",
];

/// Host environment variables that may be forwarded to a worker's child
/// process. `WORKER_ID`/`WORKER_DIR` are injected by the worker itself, not
/// inherited from the host.
pub const ENV_WHITELIST: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "TERM", "NODE_ENV", "TZ", "LANG", "LC_ALL",
];

/// Returns true iff `command` contains any blocked substring.
pub fn is_blocked(command: &str) -> bool {
    BLOCKED_COMMANDS.iter().any(|pattern| command.contains(pattern))
}

/// Builds the environment for a child process: the host's allowlisted
/// variables, `WORKER_ID`/`WORKER_DIR`, then the task's own `env` merged
/// last (and therefore able to override anything prior).
pub fn filter_env(
    worker_id: &str,
    worker_dir: &std::path::Path,
    task_env: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for key in ENV_WHITELIST {
        if let Ok(value) = std::env::var(key) {
            env.insert((*key).to_string(), value);
        }
    }

    env.insert("WORKER_ID".to_string(), worker_id.to_string());
    env.insert("WORKER_DIR".to_string(), worker_dir.display().to_string());

    for (key, value) in task_env {
        env.insert(key.clone(), value.clone());
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_known_destructive_patterns() {
        assert!(is_blocked("rm -rf /"));
        assert!(is_blocked("sudo rm -rf /var/lib"));
        assert!(is_blocked("echo hi && shutdown -h now"));
    }

    #[test]
    fn allows_benign_commands() {
        assert!(!is_blocked("echo hello"));
        assert!(!is_blocked("cargo build --release"));
    }

    #[test]
    fn blocked_substring_anywhere_in_command_counts() {
        assert!(is_blocked("prefix chmod -R 777 / suffix"));
    }

    #[test]
    fn filter_env_does_not_leak_non_whitelisted_vars() {
        std::env::set_var("AGENT_POOL_TEST_SECRET", "leak-me-not");
        let task_env = HashMap::new();
        let env = filter_env("w1", std::path::Path::new("/tmp/w1"), &task_env);
        assert!(!env.contains_key("AGENT_POOL_TEST_SECRET"));
        std::env::remove_var("AGENT_POOL_TEST_SECRET");
    }

    #[test]
    fn filter_env_injects_worker_identity_and_merges_task_env_last() {
        let mut task_env = HashMap::new();
        task_env.insert("WORKER_ID".to_string(), "overridden".to_string());
        task_env.insert("CUSTOM".to_string(), "value".to_string());

        let env = filter_env("w1", std::path::Path::new("/tmp/w1"), &task_env);
        assert_eq!(env.get("WORKER_ID").map(String::as_str), Some("overridden"));
        assert_eq!(env.get("CUSTOM").map(String::as_str), Some("value"));
        assert!(env.contains_key("WORKER_DIR"));
    }
}
