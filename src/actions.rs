use crossterm::event::KeyEvent;

use crate::config::Config;
use crate::server::{ResourceSample, ServerStateView, StateUpdate};

/// Actions that can be dispatched through the application
#[derive(Debug, Clone)]
pub enum Action {
    /// A key was pressed
    KeyPress(KeyEvent),
    /// A classified line from the attached session
    Update(StateUpdate),
    /// Server state changed without a new line (bootstrap, stop request)
    StateChanged(ServerStateView),
    /// The update stream of the given attachment finished
    StreamEnded(u64),
    /// Latest resource sample, `None` when no server process was found
    Resources(Option<ResourceSample>),
    /// Informational message for the status line
    Info(String),
    /// An error occurred
    Error(String),
    /// Send a command line to the server
    Submit(String),
    /// Drop the attachment and attach again
    Reattach,
    /// Copy the console to the clipboard
    CopyConsole(String),
    /// Write the edited settings to the config file
    SaveConfig(Config),
}
