use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{resolve_session, TmuxSession};
use crate::error::{AttachError, WriteError};
use crate::transport::{Channel, ChannelReader, ChannelWriter, Chunk, SessionHandle, Transport};

/// How many idle polls pass between liveness checks of the session
const LIVENESS_EVERY: u32 = 20;

/// Capture file size past which the reader empties it once caught up
const CAPTURE_LIMIT: u64 = 1 << 20;

/// Client for interacting with tmux via CLI.
///
/// Output is captured with `pipe-pane` into a file that the reader tails;
/// commands are typed into the pane with `send-keys`.
#[derive(Debug, Clone)]
pub struct TmuxClient {
    /// Path to tmux binary
    tmux_path: String,
    /// Directory for pipe-pane capture files
    capture_dir: PathBuf,
    /// Pane history lines replayed before live output
    backlog_lines: usize,
    poll_interval: Duration,
}

impl TmuxClient {
    pub fn new(capture_dir: impl Into<PathBuf>) -> Self {
        Self {
            tmux_path: "tmux".to_string(),
            capture_dir: capture_dir.into(),
            backlog_lines: 50,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_backlog_lines(mut self, lines: usize) -> Self {
        self.backlog_lines = lines;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// List all tmux sessions
    pub async fn list_sessions(&self) -> Result<Vec<TmuxSession>, AttachError> {
        let output = Command::new(&self.tmux_path)
            .args(["list-sessions", "-F", "#{session_id}|#{session_name}"])
            .output()
            .await
            .map_err(|e| AttachError::Unavailable(format!("failed to execute tmux: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_session(&stderr) || stderr.contains("no sessions") {
                return Ok(Vec::new());
            }
            return Err(AttachError::Unavailable(format!(
                "tmux list-sessions failed: {}",
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().filter_map(TmuxSession::parse).collect())
    }

    /// Last `backlog_lines` non-blank lines of the pane, newline terminated
    async fn capture_backlog(&self, target: &str) -> Option<Vec<u8>> {
        if self.backlog_lines == 0 {
            return None;
        }
        let start = format!("-{}", self.backlog_lines);
        let output = Command::new(&self.tmux_path)
            .args(["capture-pane", "-p", "-J", "-t", target, "-S", &start])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            debug!(target, "capture-pane failed, starting without backlog");
            return None;
        }

        let content = String::from_utf8_lossy(&output.stdout);
        let lines: Vec<&str> = content.trim_end().lines().collect();
        let skip = lines.len().saturating_sub(self.backlog_lines);
        let mut backlog = String::new();
        for line in &lines[skip..] {
            backlog.push_str(line);
            backlog.push('\n');
        }
        (!backlog.is_empty()).then(|| backlog.into_bytes())
    }

    fn capture_path(&self, name: &str) -> PathBuf {
        let file_name: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.capture_dir.join(format!("{file_name}.log"))
    }
}

#[async_trait]
impl Transport for TmuxClient {
    async fn discover(&self, name: &str) -> Result<SessionHandle, AttachError> {
        let sessions = self.list_sessions().await?;
        let handle = resolve_session(name, &sessions);
        debug!(session = name, discovery = ?handle.discovery, "resolved tmux session");
        Ok(handle)
    }

    async fn open(&self, session: &SessionHandle) -> Result<Channel, AttachError> {
        let target = session.require_target()?.to_string();
        let unavailable = |e: std::io::Error| AttachError::Unavailable(e.to_string());

        tokio::fs::create_dir_all(&self.capture_dir).await.map_err(unavailable)?;
        let path = self.capture_path(&session.name);
        File::create(&path).await.map_err(unavailable)?;

        let pipe_command = format!("cat >> {}", shell_quote(&path));
        let output = tmux(&self.tmux_path, &["pipe-pane", "-O", "-t", &target, &pipe_command])
            .await
            .map_err(unavailable)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_session(&stderr) {
                return Err(AttachError::NotFound(session.name.clone()));
            }
            return Err(AttachError::Unavailable(format!(
                "tmux pipe-pane failed: {}",
                stderr.trim()
            )));
        }

        // Piping starts before the backlog snapshot, so a line printed in
        // between may show up twice but is never lost.
        let backlog = self.capture_backlog(&target).await;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(unavailable)?;

        info!(session = %session.name, target = %target, capture = %path.display(), "attached to tmux session");

        Ok(Channel {
            writer: Box::new(PaneWriter {
                tmux_path: self.tmux_path.clone(),
                target: target.clone(),
                capture: path,
                closed: false,
            }),
            reader: Box::new(PaneReader {
                tmux_path: self.tmux_path.clone(),
                target,
                backlog,
                file,
                offset: 0,
                truncate_at: CAPTURE_LIMIT,
                poll_interval: self.poll_interval,
                idle_polls: 0,
            }),
        })
    }
}

/// Types command lines into the pane
struct PaneWriter {
    tmux_path: String,
    target: String,
    capture: PathBuf,
    closed: bool,
}

#[async_trait]
impl ChannelWriter for PaneWriter {
    async fn send(&mut self, text: &str) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::ChannelClosed);
        }
        let text = text.trim_end_matches(['\r', '\n']);
        check_write(tmux(&self.tmux_path, &send_keys_args(&self.target, text)).await)
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // pipe-pane without a command stops the pipe
        match tmux(&self.tmux_path, &["pipe-pane", "-t", &self.target]).await {
            Ok(output) if !output.status.success() => {
                debug!(target = %self.target, "pipe-pane stop failed, session likely gone");
            }
            Err(e) => warn!(error = %e, "failed to stop pipe-pane"),
            Ok(_) => {}
        }
        if let Err(e) = tokio::fs::remove_file(&self.capture).await {
            debug!(error = %e, capture = %self.capture.display(), "capture file not removed");
        }
    }
}

/// Tails the pipe-pane capture file
struct PaneReader {
    tmux_path: String,
    target: String,
    backlog: Option<Vec<u8>>,
    file: File,
    offset: u64,
    truncate_at: u64,
    poll_interval: Duration,
    idle_polls: u32,
}

impl PaneReader {
    async fn session_alive(&self) -> bool {
        Command::new(&self.tmux_path)
            .args(["has-session", "-t", &self.target])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Empty the capture file once everything in it has been read.
    ///
    /// `cat >>` appends, so the pipe keeps writing at the new end. Output
    /// written between the last read and the truncation is lost.
    async fn compact(&mut self) -> std::io::Result<()> {
        debug!(target = %self.target, bytes = self.offset, "truncating capture file");
        self.file.set_len(0).await?;
        self.file.seek(std::io::SeekFrom::Start(0)).await?;
        self.offset = 0;
        Ok(())
    }
}

#[async_trait]
impl ChannelReader for PaneReader {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Chunk>> {
        if let Some(backlog) = self.backlog.take() {
            return Ok(Some(Chunk::Backlog(backlog)));
        }

        let mut buf = vec![0u8; 8192];
        loop {
            let n = self.file.read(&mut buf).await?;
            if n > 0 {
                self.offset += n as u64;
                self.idle_polls = 0;
                buf.truncate(n);
                return Ok(Some(Chunk::Data(buf)));
            }

            if self.offset >= self.truncate_at {
                self.compact().await?;
                continue;
            }

            let len = self.file.metadata().await?.len();
            if len < self.offset {
                // Truncated underneath us; whatever was between is gone
                self.file.seek(std::io::SeekFrom::Start(0)).await?;
                self.offset = 0;
                return Ok(Some(Chunk::Discontinuity));
            }

            self.idle_polls += 1;
            if self.idle_polls % LIVENESS_EVERY == 0 && !self.session_alive().await {
                info!(target = %self.target, "tmux session ended");
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Type `text` literally, then Enter, in one tmux invocation. `--` keeps text
/// starting with `-` from being read as flags.
fn send_keys_args<'a>(target: &'a str, text: &'a str) -> [&'a str; 11] {
    [
        "send-keys", "-t", target, "-l", "--", text, ";", "send-keys", "-t", target, "Enter",
    ]
}

async fn tmux(tmux_path: &str, args: &[&str]) -> std::io::Result<Output> {
    Command::new(tmux_path).args(args).output().await
}

fn check_write(result: std::io::Result<Output>) -> Result<(), WriteError> {
    let output = result.map_err(|e| WriteError::Transient(e.to_string()))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if is_missing_session(&stderr) {
        Err(WriteError::ChannelClosed)
    } else {
        Err(WriteError::Transient(stderr.trim().to_string()))
    }
}

fn is_missing_session(stderr: &str) -> bool {
    stderr.contains("can't find")
        || stderr.contains("no server running")
        || stderr.contains("session not found")
        || stderr.contains("error connecting to")
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_session_detection() {
        assert!(is_missing_session("can't find session: minecraft"));
        assert!(is_missing_session("no server running on /tmp/tmux-0/default"));
        assert!(!is_missing_session("unknown key: Foo"));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote(Path::new("/tmp/it's.log")), r"'/tmp/it'\''s.log'");
    }

    #[test]
    fn test_send_keys_is_one_invocation() {
        assert_eq!(
            send_keys_args("$3", "-say hi; kill"),
            ["send-keys", "-t", "$3", "-l", "--", "-say hi; kill", ";", "send-keys", "-t", "$3", "Enter"]
        );
    }

    #[tokio::test]
    async fn test_reader_truncates_capture_when_caught_up() {
        use tokio::io::AsyncWriteExt;

        let path = std::env::temp_dir().join(format!("mcc-capture-{}.log", std::process::id()));
        tokio::fs::write(&path, b"one\ntwo\n").await.unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&path).await.unwrap();
        let mut reader = PaneReader {
            // `true` accepts any arguments, so the liveness check passes
            tmux_path: "true".to_string(),
            target: "$0".to_string(),
            backlog: Some(b"old\n".to_vec()),
            file,
            offset: 0,
            truncate_at: 4,
            poll_interval: Duration::from_millis(5),
            idle_polls: 0,
        };

        assert_eq!(reader.next_chunk().await.unwrap(), Some(Chunk::Backlog(b"old\n".to_vec())));
        assert_eq!(reader.next_chunk().await.unwrap(), Some(Chunk::Data(b"one\ntwo\n".to_vec())));

        // Caught up and past the limit: the file is emptied while waiting
        let idle = tokio::time::timeout(Duration::from_millis(50), reader.next_chunk()).await;
        assert!(idle.is_err());
        assert_eq!(tokio::fs::metadata(&path).await.unwrap().len(), 0);

        let mut pipe = OpenOptions::new().append(true).open(&path).await.unwrap();
        pipe.write_all(b"three\n").await.unwrap();
        pipe.flush().await.unwrap();
        assert_eq!(reader.next_chunk().await.unwrap(), Some(Chunk::Data(b"three\n".to_vec())));

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[test]
    fn test_capture_path_is_sanitized() {
        let client = TmuxClient::new("/tmp/captures");
        assert_eq!(
            client.capture_path("mc/server 1"),
            PathBuf::from("/tmp/captures/mc_server_1.log")
        );
    }
}
