//! Point-in-time resource usage of the server process.
//!
//! Used for display only; nothing in the controller depends on it.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use sysinfo::{Pid, System};
use tracing::debug;

use crate::error::LookupError;

/// Shells and runtimes commonly used to wrap a server binary
const WRAPPERS: &[&str] = &["java", "python", "python3", "bash", "sh"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub pid: u32,
    /// CPU usage since the previous lookup of the same pid; `None` on the first
    pub cpu_percent: Option<f32>,
    /// Resident set size
    pub memory_bytes: u64,
}

#[async_trait]
pub trait ProcessMetrics: Send + Sync {
    async fn lookup(&self, pid: u32) -> Result<ResourceSample, LookupError>;
}

/// A process that looks like the game server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProcess {
    pub pid: u32,
    pub command: String,
}

/// How a process matched the server description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Match {
    Binary,
    Wrapped,
}

struct Sampler {
    system: System,
    /// Pids refreshed at least once, so their CPU figure has a baseline
    sampled: HashSet<u32>,
}

pub struct ProcMetrics {
    inner: Mutex<Sampler>,
}

impl ProcMetrics {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Sampler {
                system: System::new(),
                sampled: HashSet::new(),
            }),
        }
    }

    /// Find the server process: a binary named in `names`, or a wrapper
    /// (java, shell, python) whose command line mentions one of `keywords`.
    /// A named binary wins over a wrapper.
    pub fn find_server_process(&self, names: &[String], keywords: &[String]) -> Option<ServerProcess> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.system.refresh_processes();

        let own_pid = std::process::id();
        let mut wrapped = None;
        for (pid, process) in guard.system.processes() {
            let pid = pid.as_u32();
            if pid == own_pid {
                continue;
            }
            let command = process.cmd().join(" ");
            match server_match(process.name(), &command, names, keywords) {
                Some(Match::Binary) => return Some(ServerProcess { pid, command }),
                Some(Match::Wrapped) if wrapped.is_none() => wrapped = Some(ServerProcess { pid, command }),
                _ => {}
            }
        }
        wrapped
    }
}

impl Default for ProcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessMetrics for ProcMetrics {
    async fn lookup(&self, pid: u32) -> Result<ResourceSample, LookupError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(LookupError::Unsupported);
        }
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let sampler = &mut *guard;

        let key = Pid::from_u32(pid);
        if !sampler.system.refresh_process(key) {
            sampler.sampled.remove(&pid);
            return Err(LookupError::ProcessGone(pid));
        }
        let process = sampler.system.process(key).ok_or(LookupError::ProcessGone(pid))?;
        let memory_bytes = process.memory();
        if memory_bytes == 0 && process.cmd().is_empty() {
            // Another user's process with its details hidden from us
            return Err(LookupError::PermissionDenied(pid));
        }

        let cpu_percent = (!sampler.sampled.insert(pid)).then(|| process.cpu_usage());
        debug!(pid, ?cpu_percent, memory_bytes, "sampled process");
        Ok(ResourceSample {
            pid,
            cpu_percent,
            memory_bytes,
        })
    }
}

fn server_match(name: &str, command: &str, names: &[String], keywords: &[String]) -> Option<Match> {
    if names.iter().any(|n| n == name) {
        return Some(Match::Binary);
    }
    if WRAPPERS.contains(&name) {
        let lower = command.to_lowercase();
        if keywords.iter().any(|k| lower.contains(&k.to_lowercase())) {
            return Some(Match::Wrapped);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_server_match() {
        let names = strings(&["bedrock_server"]);
        let keywords = strings(&["Minecraft", "paper"]);

        assert_eq!(
            server_match("bedrock_server", "./bedrock_server", &names, &keywords),
            Some(Match::Binary)
        );
        assert_eq!(
            server_match("java", "java -Xmx4G -jar paper-1.20.jar nogui", &names, &keywords),
            Some(Match::Wrapped)
        );
        assert_eq!(
            server_match("bash", "bash ./start_MINECRAFT.sh", &names, &keywords),
            Some(Match::Wrapped)
        );
        // Keywords only count for wrappers
        assert_eq!(server_match("vim", "vim paper.yml", &names, &keywords), None);
        assert_eq!(server_match("java", "java -jar gradle.jar", &names, &keywords), None);
    }

    #[tokio::test]
    async fn test_lookup_own_process() {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return;
        }
        let metrics = ProcMetrics::new();
        let pid = std::process::id();

        let first = metrics.lookup(pid).await.unwrap();
        assert_eq!(first.pid, pid);
        assert!(first.memory_bytes > 0);
        assert_eq!(first.cpu_percent, None);

        let second = metrics.lookup(pid).await.unwrap();
        assert!(second.cpu_percent.is_some());
    }

    #[tokio::test]
    async fn test_lookup_missing_process() {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return;
        }
        let metrics = ProcMetrics::new();
        // Above the default pid_max on every platform we run on
        let pid = 4_000_000_000;
        assert_eq!(metrics.lookup(pid).await, Err(LookupError::ProcessGone(pid)));
    }

    #[cfg(unix)]
    #[test]
    fn test_find_server_process_by_name() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let metrics = ProcMetrics::new();

        let found = metrics.find_server_process(&strings(&["sleep"]), &[]);
        let _ = child.kill();
        let _ = child.wait();

        let found = found.unwrap();
        assert!(found.command.starts_with("sleep"));
        assert!(metrics
            .find_server_process(&strings(&["no-such-server-binary"]), &[])
            .is_none());
    }
}
