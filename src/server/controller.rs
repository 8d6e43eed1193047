use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::classifier::{classify, Event, Ruleset};
use super::state::{ServerState, ServerStateView};
use crate::config::Config;
use crate::error::{AttachError, CommandError, WriteError};
use crate::transport::{ChannelWriter, LineReader, RawLine, SessionHandle, Transport};

/// A command line as submitted by the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    pub submitted_at: SystemTime,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            submitted_at: SystemTime::now(),
        }
    }
}

/// One classified line together with the state it produced
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub line: RawLine,
    pub event: Event,
    pub state: ServerStateView,
}

/// Ordered stream of updates for one attachment.
///
/// Ends (`None`) when the read loop ends: detach, reattach, or the session
/// going away.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<StateUpdate>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<StateUpdate> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub session_name: String,
    pub attach_timeout: Duration,
    pub bootstrap_window: Duration,
    pub command_delay: Duration,
    pub max_line_bytes: usize,
    pub stop_command: String,
}

impl ControllerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            session_name: config.session_name.clone(),
            attach_timeout: config.attach_timeout(),
            bootstrap_window: config.bootstrap_window(),
            command_delay: config.command_delay(),
            max_line_bytes: config.max_line_bytes,
            stop_command: config.stop_command.clone(),
        }
    }
}

struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<StateUpdate>>,
    closed: bool,
}

type SharedSubscribers = Arc<Mutex<Subscribers>>;
type SharedWriter = Arc<tokio::sync::Mutex<Box<dyn ChannelWriter>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

enum Control {
    StopRequested,
}

/// A live attachment: the writer half plus the read loop owning the reader
struct Link {
    generation: u64,
    session: SessionHandle,
    writer: SharedWriter,
    control: mpsc::UnboundedSender<Control>,
    subscribers: SharedSubscribers,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Link {
    fn is_live(&self) -> bool {
        !self.task.is_finished()
    }

    async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "read loop task failed");
        }
        debug!(session = %self.session.name, "link shut down");
    }
}

/// Owns the attachment to one session and the server state derived from it.
///
/// Only the read loop mutates state; callers get snapshots through
/// [`current_state`](Self::current_state) and ordered updates through
/// [`subscribe`](Self::subscribe).
pub struct SessionController<T: Transport> {
    transport: T,
    config: ControllerConfig,
    ruleset: Arc<Ruleset>,
    state_tx: watch::Sender<ServerStateView>,
    link: Mutex<Option<Link>>,
    /// Serializes attach and detach
    attaching: tokio::sync::Mutex<()>,
    generations: AtomicU64,
}

impl<T: Transport> SessionController<T> {
    pub fn new(transport: T, config: ControllerConfig, ruleset: Ruleset) -> Self {
        let (state_tx, _) = watch::channel(ServerState::new().snapshot());
        Self {
            transport,
            config,
            ruleset: Arc::new(ruleset),
            state_tx,
            link: Mutex::new(None),
            attaching: tokio::sync::Mutex::new(()),
            generations: AtomicU64::new(0),
        }
    }

    /// Attach to the configured session, replacing any existing attachment.
    ///
    /// Bounded by the attach timeout. On failure the state is left as it was.
    /// The returned subscription is registered before the read loop starts
    /// reading, so it sees every line of the new attachment, backlog included.
    pub async fn attach(&self) -> Result<(SessionHandle, Subscription), AttachError> {
        let (session, start) = self.connect().await?;
        let updates = self.subscribe();
        let _ = start.send(());
        Ok((session, updates))
    }

    /// Open the channel and spawn a read loop that waits for the returned
    /// sender before reading
    async fn connect(&self) -> Result<(SessionHandle, oneshot::Sender<()>), AttachError> {
        let _guard = self.attaching.lock().await;
        self.teardown(None).await;

        let name = self.config.session_name.clone();
        let opened = tokio::time::timeout(self.config.attach_timeout, async {
            let session = self.transport.discover(&name).await?;
            let channel = self.transport.open(&session).await?;
            Ok::<_, AttachError>((session, channel))
        })
        .await
        .map_err(|_| AttachError::Timeout(name.clone()))
        .and_then(|r| r);

        let (session, channel) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                warn!(session = %name, error = %e, "attach failed");
                return Err(e);
            }
        };

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(channel.writer));
        let subscribers = Arc::new(Mutex::new(Subscribers {
            senders: Vec::new(),
            closed: false,
        }));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (start_tx, start_rx) = oneshot::channel();

        let read_loop = ReadLoop {
            session: session.name.clone(),
            reader: LineReader::new(channel.reader, self.config.max_line_bytes),
            ruleset: self.ruleset.clone(),
            state_tx: self.state_tx.clone(),
            subscribers: subscribers.clone(),
            writer: writer.clone(),
            bootstrap_window: self.config.bootstrap_window,
        };
        // Reset before the loop starts so no stale snapshot is observable
        self.state_tx.send_replace(ServerState::new().begin_bootstrap().snapshot());
        let task = tokio::spawn(read_loop.run(start_rx, shutdown_rx, control_rx));

        *lock(&self.link) = Some(Link {
            generation,
            session: session.clone(),
            writer,
            control: control_tx,
            subscribers,
            shutdown: shutdown_tx,
            task,
        });
        info!(session = %session.name, generation, "session attached");
        Ok((session, start_tx))
    }

    /// Drop the current attachment and attach again; the way out of a
    /// terminal phase.
    pub async fn reattach(&self) -> Result<(SessionHandle, Subscription), AttachError> {
        self.detach().await;
        self.attach().await
    }

    /// Close the channel and stop the read loop. Subscriptions end.
    pub async fn detach(&self) {
        let _guard = self.attaching.lock().await;
        self.teardown(None).await;
    }

    /// Take the link (only if it is still `generation`, when given) and shut it down
    async fn teardown(&self, generation: Option<u64>) {
        let link = {
            let mut slot = lock(&self.link);
            let replaced = matches!((slot.as_ref(), generation), (Some(link), Some(g)) if link.generation != g);
            if replaced {
                None
            } else {
                slot.take()
            }
        };
        if let Some(link) = link {
            link.shutdown().await;
        }
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.link).as_ref().is_some_and(Link::is_live)
    }

    /// Forward a command line to the session.
    ///
    /// Writes are serialized; a transient failure is retried once. A closed
    /// channel tears the attachment down.
    pub async fn submit_command(&self, text: impl Into<String>) -> Result<(), CommandError> {
        let command = Command::new(text);
        let (generation, writer, control) = {
            let link = lock(&self.link);
            match link.as_ref() {
                Some(link) if link.is_live() => (link.generation, link.writer.clone(), link.control.clone()),
                _ => return Err(CommandError::NotAttached),
            }
        };

        let mut writer = writer.lock().await;
        let result = match writer.send(&command.text).await {
            Err(WriteError::Transient(reason)) => {
                debug!(%reason, command = %command.text, "transient write failure, retrying");
                writer.send(&command.text).await
            }
            other => other,
        };

        match result {
            Ok(()) => {
                info!(command = %command.text, "command sent");
                if command.text.trim().eq_ignore_ascii_case(&self.config.stop_command) {
                    let _ = control.send(Control::StopRequested);
                }
                if !self.config.command_delay.is_zero() {
                    tokio::time::sleep(self.config.command_delay).await;
                }
                Ok(())
            }
            Err(e) => {
                warn!(command = %command.text, error = %e, "command rejected");
                drop(writer);
                if e == WriteError::ChannelClosed {
                    self.teardown(Some(generation)).await;
                }
                Err(CommandError::Rejected(e))
            }
        }
    }

    /// Updates for the current attachment, in capture order. A subscription
    /// taken while detached is already finished.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(link) = lock(&self.link).as_ref() {
            let mut subscribers = lock(&link.subscribers);
            if !subscribers.closed {
                subscribers.senders.push(tx);
            }
        }
        Subscription { rx }
    }

    pub fn current_state(&self) -> ServerStateView {
        self.state_tx.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch_state(&self) -> watch::Receiver<ServerStateView> {
        self.state_tx.subscribe()
    }
}

/// The single writer of [`ServerState`]
struct ReadLoop {
    session: String,
    reader: LineReader,
    ruleset: Arc<Ruleset>,
    state_tx: watch::Sender<ServerStateView>,
    subscribers: SharedSubscribers,
    writer: SharedWriter,
    bootstrap_window: Duration,
}

impl ReadLoop {
    async fn run(
        mut self,
        start: oneshot::Receiver<()>,
        mut shutdown: oneshot::Receiver<()>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        // The attaching caller subscribes first
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                self.finish().await;
                return;
            }
            _ = start => {}
        }

        let mut state = ServerState::new().begin_bootstrap();
        let bootstrap = tokio::time::sleep(self.bootstrap_window);
        tokio::pin!(bootstrap);
        let mut bootstrapping = true;

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!(session = %self.session, "read loop cancelled");
                    break;
                }
                Some(Control::StopRequested) = control.recv() => {
                    state = state.stop_requested();
                    self.state_tx.send_replace(state.snapshot());
                }
                _ = &mut bootstrap, if bootstrapping => {
                    bootstrapping = false;
                    state = state.end_bootstrap();
                    debug!(session = %self.session, phase = %state.phase(), "bootstrap window elapsed");
                    self.state_tx.send_replace(state.snapshot());
                }
                line = self.reader.next_line() => {
                    let Some(line) = line else {
                        info!(session = %self.session, "output stream ended");
                        break;
                    };
                    state = self.process(state, line);
                }
            }
        }

        self.finish().await;
    }

    async fn finish(&mut self) {
        lock(&self.subscribers).close();
        self.writer.lock().await.close().await;
        debug!(session = %self.session, next_seq = self.reader.next_seq(), "read loop finished");
    }

    fn process(&self, state: ServerState, line: RawLine) -> ServerState {
        let event = classify(&line, &self.ruleset);
        let state = if line.backlog {
            state.recall(&event, line.captured_at)
        } else {
            state.apply(&event, line.captured_at)
        };
        let state = state.observe_seq(line.seq);
        let view = state.snapshot();

        if event.is_recognized() {
            info!(session = %self.session, seq = line.seq, ?event, phase = %view.phase, "server event");
        } else {
            trace!(seq = line.seq, "unrecognized line");
        }

        self.state_tx.send_replace(view.clone());
        lock(&self.subscribers).publish(StateUpdate { line, event, state: view });
        state
    }
}

impl Subscribers {
    fn publish(&mut self, update: StateUpdate) {
        // drop subscribers whose receiving end is gone
        self.senders.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn close(&mut self) {
        self.closed = true;
        self.senders.clear();
    }
}
