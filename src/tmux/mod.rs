mod client;

pub use client::TmuxClient;

use serde::{Deserialize, Serialize};

use crate::transport::SessionHandle;

/// A tmux session as reported by `list-sessions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmuxSession {
    /// Session ID (e.g., "$0")
    pub id: String,
    /// Session name
    pub name: String,
}

impl TmuxSession {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Parse one line of `#{session_id}|#{session_name}` output
    pub fn parse(line: &str) -> Option<Self> {
        let (id, name) = line.split_once('|')?;
        if id.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(id, name))
    }
}

/// Resolve a configured session name against the live session list.
///
/// An exact name match always wins. Otherwise the name is treated as a
/// prefix: a single match resolves, several are ambiguous.
pub fn resolve_session(name: &str, sessions: &[TmuxSession]) -> SessionHandle {
    if let Some(exact) = sessions.iter().find(|s| s.name == name) {
        return SessionHandle::found(name, exact.id.clone());
    }

    let candidates: Vec<&TmuxSession> = sessions.iter().filter(|s| s.name.starts_with(name)).collect();
    match candidates.as_slice() {
        [] => SessionHandle::not_found(name),
        [only] => SessionHandle::found(name, only.id.clone()),
        many => SessionHandle::ambiguous(name, many.iter().map(|s| s.name.clone()).collect()),
    }
}
