//! Channel abstraction over an external, line-oriented session.
//!
//! A [`Transport`] discovers and opens sessions; an open [`Channel`] is split
//! into a writer half for commands and a reader half producing raw byte
//! chunks. [`LineReader`] turns the chunk stream into numbered [`RawLine`]s.

use std::collections::VecDeque;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{AttachError, WriteError};

/// Outcome of looking a session up by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    Found,
    NotFound,
    /// Several sessions matched; holds their names
    Ambiguous(Vec<String>),
}

/// A resolved reference to an external session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Name as requested by configuration
    pub name: String,
    /// Transport-specific target (e.g. tmux session id), set when found
    pub target: Option<String>,
    pub discovery: Discovery,
}

impl SessionHandle {
    pub fn found(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: Some(target.into()),
            discovery: Discovery::Found,
        }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: None,
            discovery: Discovery::NotFound,
        }
    }

    pub fn ambiguous(name: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            name: name.into(),
            target: None,
            discovery: Discovery::Ambiguous(candidates),
        }
    }

    /// The target to open, or the attach error matching the discovery status
    pub fn require_target(&self) -> Result<&str, AttachError> {
        match (&self.discovery, &self.target) {
            (Discovery::Found, Some(target)) => Ok(target),
            (Discovery::Ambiguous(candidates), _) => Err(AttachError::Ambiguous {
                name: self.name.clone(),
                candidates: candidates.clone(),
            }),
            _ => Err(AttachError::NotFound(self.name.clone())),
        }
    }
}

/// How a [`RawLine`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Regular line terminated by `\n`
    Newline,
    /// Cut at the configured maximum line length; the rest follows as another line
    Overflow,
    /// Partial line flushed when the stream ended
    EndOfStream,
}

/// One line of output as captured from the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub seq: u64,
    pub captured_at: SystemTime,
    pub text: String,
    pub termination: Termination,
    /// Scrollback captured when the channel opened, not live output
    pub backlog: bool,
}

#[cfg(test)]
impl RawLine {
    pub fn new(seq: u64, text: impl Into<String>) -> Self {
        Self {
            seq,
            captured_at: SystemTime::now(),
            text: text.into(),
            termination: Termination::Newline,
            backlog: false,
        }
    }
}

/// A unit delivered by a [`ChannelReader`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    /// Output that was already on screen when the channel opened
    Backlog(Vec<u8>),
    /// Output was lost between the previous chunk and the next one
    Discontinuity,
}

#[async_trait]
pub trait ChannelWriter: Send {
    /// Send one command line to the session
    async fn send(&mut self, text: &str) -> Result<(), WriteError>;

    /// Release the write side and anything the transport set up for the channel
    async fn close(&mut self);
}

#[async_trait]
pub trait ChannelReader: Send {
    /// Wait for the next chunk of output. `Ok(None)` means the stream ended.
    async fn next_chunk(&mut self) -> std::io::Result<Option<Chunk>>;
}

/// An open, bidirectional channel to a session
pub struct Channel {
    pub writer: Box<dyn ChannelWriter>,
    pub reader: Box<dyn ChannelReader>,
}

/// Capability to find and open sessions
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Resolve a session name. Only transport failures are errors; a missing
    /// or ambiguous name is reported through [`SessionHandle::discovery`].
    async fn discover(&self, name: &str) -> Result<SessionHandle, AttachError>;

    /// Open a channel to a discovered session
    async fn open(&self, session: &SessionHandle) -> Result<Channel, AttachError>;
}

/// Reassembles chunks into numbered lines.
///
/// The sequence is lazy and ends for good once the underlying reader ends;
/// a new one requires reopening the channel. A non-empty partial line left at
/// end of stream is delivered once, flagged [`Termination::EndOfStream`].
pub struct LineReader {
    source: Box<dyn ChannelReader>,
    buffer: Vec<u8>,
    ready: VecDeque<RawLine>,
    next_seq: u64,
    max_line_bytes: usize,
    /// Whether the buffered bytes came from the backlog
    backlog: bool,
    finished: bool,
}

impl LineReader {
    pub fn new(source: Box<dyn ChannelReader>, max_line_bytes: usize) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            ready: VecDeque::new(),
            next_seq: 0,
            max_line_bytes: max_line_bytes.max(1),
            backlog: false,
            finished: false,
        }
    }

    /// Sequence number the next line will carry
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub async fn next_line(&mut self) -> Option<RawLine> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(line);
            }
            if self.finished {
                return None;
            }

            match self.source.next_chunk().await {
                Ok(Some(Chunk::Data(bytes))) => self.ingest(&bytes, false),
                Ok(Some(Chunk::Backlog(bytes))) => self.ingest(&bytes, true),
                Ok(Some(Chunk::Discontinuity)) => self.skip_gap(),
                Ok(None) => self.finish(),
                Err(e) => {
                    warn!(error = %e, "channel read failed, ending line stream");
                    self.finish();
                }
            }
        }
    }

    fn ingest(&mut self, bytes: &[u8], backlog: bool) {
        self.backlog = backlog;
        let mut scan_from = self.buffer.len();
        self.buffer.extend_from_slice(bytes);

        while let Some(offset) = self.buffer[scan_from..].iter().position(|b| *b == b'\n') {
            let end = scan_from + offset;
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            self.emit_split(&line, Termination::Newline);
            scan_from = 0;
        }

        while self.buffer.len() > self.max_line_bytes {
            let cut = split_point(&self.buffer, self.max_line_bytes);
            let head: Vec<u8> = self.buffer.drain(..cut).collect();
            debug!(len = head.len(), "line exceeds maximum length, splitting");
            self.emit(&head, Termination::Overflow);
        }
    }

    fn skip_gap(&mut self) {
        if !self.buffer.is_empty() {
            debug!(bytes = self.buffer.len(), "discarding partial line before gap");
            self.buffer.clear();
        }
        warn!(skipped_seq = self.next_seq, "output discontinuity");
        self.next_seq += 1;
    }

    fn finish(&mut self) {
        if !self.buffer.is_empty() {
            let mut tail = std::mem::take(&mut self.buffer);
            if tail.last() == Some(&b'\r') {
                tail.pop();
            }
            self.emit_split(&tail, Termination::EndOfStream);
        }
        self.finished = true;
    }

    fn emit_split(&mut self, bytes: &[u8], termination: Termination) {
        let mut rest = bytes;
        while rest.len() > self.max_line_bytes {
            let (head, tail) = rest.split_at(split_point(rest, self.max_line_bytes));
            self.emit(head, Termination::Overflow);
            rest = tail;
        }
        self.emit(rest, termination);
    }

    fn emit(&mut self, bytes: &[u8], termination: Termination) {
        let line = RawLine {
            seq: self.next_seq,
            captured_at: SystemTime::now(),
            text: String::from_utf8_lossy(bytes).into_owned(),
            termination,
            backlog: self.backlog,
        };
        self.next_seq += 1;
        self.ready.push_back(line);
    }
}

/// Largest cut at or below `max` that does not land inside a UTF-8 sequence.
/// Falls back to `max` when no boundary is found (the bytes are not UTF-8).
fn split_point(bytes: &[u8], max: usize) -> usize {
    if bytes.len() <= max {
        return bytes.len();
    }
    let mut cut = max;
    while cut > 0 && (bytes[cut] & 0xC0) == 0x80 {
        cut -= 1;
    }
    if cut == 0 {
        max
    } else {
        cut
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory transport double fed by the test.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;

    #[derive(Default)]
    struct Shared {
        feed: Option<mpsc::UnboundedSender<Chunk>>,
        sent: Vec<String>,
        write_results: VecDeque<Result<(), WriteError>>,
        closed: bool,
        opens: usize,
    }

    /// Sessions are plain names; each open creates a fresh channel that the
    /// test drives through [`FakeTransport::push`] and friends.
    #[derive(Clone)]
    pub struct FakeTransport {
        sessions: Vec<String>,
        open_delay: Option<Duration>,
        shared: Arc<Mutex<Shared>>,
    }

    impl FakeTransport {
        pub fn new(sessions: &[&str]) -> Self {
            Self {
                sessions: sessions.iter().map(|s| s.to_string()).collect(),
                open_delay: None,
                shared: Arc::new(Mutex::new(Shared::default())),
            }
        }

        pub fn with_open_delay(mut self, delay: Duration) -> Self {
            self.open_delay = Some(delay);
            self
        }

        fn with_shared<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
            let mut shared = self.shared.lock().unwrap();
            f(&mut shared)
        }

        pub fn push(&self, chunk: Chunk) {
            self.with_shared(|s| {
                if let Some(feed) = &s.feed {
                    let _ = feed.send(chunk);
                }
            });
        }

        pub fn push_bytes(&self, bytes: &[u8]) {
            self.push(Chunk::Data(bytes.to_vec()));
        }

        pub fn push_line(&self, line: &str) {
            self.push_bytes(format!("{line}\n").as_bytes());
        }

        /// Deliver scrollback lines, as a transport does right after opening
        pub fn push_backlog(&self, lines: &[&str]) {
            let text: String = lines.iter().map(|l| format!("{l}\n")).collect();
            self.push(Chunk::Backlog(text.into_bytes()));
        }

        /// Script the outcome of upcoming writes, in order
        pub fn script_writes(&self, results: Vec<Result<(), WriteError>>) {
            self.with_shared(|s| s.write_results.extend(results));
        }

        /// End the output stream and fail all further writes
        pub fn hang_up(&self) {
            self.with_shared(|s| {
                s.feed = None;
                s.closed = true;
            });
        }

        pub fn sent(&self) -> Vec<String> {
            self.with_shared(|s| s.sent.clone())
        }

        pub fn opens(&self) -> usize {
            self.with_shared(|s| s.opens)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn discover(&self, name: &str) -> Result<SessionHandle, AttachError> {
            let matches: Vec<&String> = self.sessions.iter().filter(|s| s.starts_with(name)).collect();
            Ok(match matches.as_slice() {
                [] => SessionHandle::not_found(name),
                _ if self.sessions.iter().any(|s| s == name) => SessionHandle::found(name, name),
                [only] => SessionHandle::found(name, only.as_str()),
                many => SessionHandle::ambiguous(name, many.iter().map(|s| s.to_string()).collect()),
            })
        }

        async fn open(&self, session: &SessionHandle) -> Result<Channel, AttachError> {
            session.require_target()?;
            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.with_shared(|s| {
                s.feed = Some(tx);
                s.closed = false;
                s.opens += 1;
            });
            Ok(Channel {
                writer: Box::new(FakeWriter {
                    shared: self.shared.clone(),
                }),
                reader: Box::new(FakeReader { rx }),
            })
        }
    }

    struct FakeWriter {
        shared: Arc<Mutex<Shared>>,
    }

    #[async_trait]
    impl ChannelWriter for FakeWriter {
        async fn send(&mut self, text: &str) -> Result<(), WriteError> {
            let mut shared = self.shared.lock().unwrap();
            if let Some(result) = shared.write_results.pop_front() {
                if result.is_ok() {
                    shared.sent.push(text.to_string());
                }
                return result;
            }
            if shared.closed {
                return Err(WriteError::ChannelClosed);
            }
            shared.sent.push(text.to_string());
            Ok(())
        }

        async fn close(&mut self) {
            let mut shared = self.shared.lock().unwrap();
            shared.feed = None;
            shared.closed = true;
        }
    }

    pub struct FakeReader {
        rx: mpsc::UnboundedReceiver<Chunk>,
    }

    impl FakeReader {
        pub fn from_chunks(chunks: Vec<Chunk>) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            for chunk in chunks {
                let _ = tx.send(chunk);
            }
            Self { rx }
        }
    }

    #[async_trait]
    impl ChannelReader for FakeReader {
        async fn next_chunk(&mut self) -> std::io::Result<Option<Chunk>> {
            Ok(self.rx.recv().await)
        }
    }
}
