use std::borrow::Cow;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::transport::RawLine;

/// Semantic meaning of one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ServerStarted,
    ServerStopped,
    ServerCrashed,
    PlayerJoined { name: String },
    PlayerLeft { name: String },
    WorldSaved,
    /// Line matched no rule; the bulk of ordinary log output
    Unrecognized { raw: String },
}

impl Event {
    pub fn is_recognized(&self) -> bool {
        !matches!(self, Event::Unrecognized { .. })
    }
}

/// The kind of event a rule produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ServerStarted,
    ServerStopped,
    ServerCrashed,
    PlayerJoined,
    PlayerLeft,
    WorldSaved,
}

impl EventKind {
    fn needs_name(self) -> bool {
        matches!(self, EventKind::PlayerJoined | EventKind::PlayerLeft)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::ServerStarted => "server_started",
            EventKind::ServerStopped => "server_stopped",
            EventKind::ServerCrashed => "server_crashed",
            EventKind::PlayerJoined => "player_joined",
            EventKind::PlayerLeft => "player_left",
            EventKind::WorldSaved => "world_saved",
        };
        f.write_str(name)
    }
}

/// Serializable form of a rule, as written in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    /// Match `pattern` as a plain substring instead of a regex
    #[serde(default)]
    pub literal: bool,
    pub kind: EventKind,
}

/// Anchor a message pattern right after the log prefix: any run of bracketed
/// fields (timestamp, thread, level) and the separator that follows them.
/// Chat arrives as `<name> text` after the same prefix, so it never matches.
macro_rules! message {
    ($flags:literal, $body:literal) => {
        concat!($flags, r"^(?:\[[^\]]*\][:\s]*)*(?:", $body, ")")
    };
}

/// Default rules for Minecraft Bedrock and Java servers.
///
/// Order matters: crash markers come before stop markers because a crashing
/// server usually also reports that it stopped.
const DEFAULT_RULES: &[(&str, EventKind)] = &[
    (
        message!(
            "(?i)",
            r"-+\s*minecraft crash report|(?:the )?server (?:has )?crashed|exception in server tick loop|segmentation fault"
        ),
        EventKind::ServerCrashed,
    ),
    (
        message!("(?i)", r"quit correctly|server stopped|all dimensions are saved"),
        EventKind::ServerStopped,
    ),
    (
        message!("(?i)", r"server started\.?\s*$|done \([0-9.,]+s\)! for help"),
        EventKind::ServerStarted,
    ),
    (
        message!("(?i)", r"data saved\.|saved the game|all chunks are saved|saving chunks for level"),
        EventKind::WorldSaved,
    ),
    (message!("", r"Player connected: (?P<name>[^,]+)"), EventKind::PlayerJoined),
    (message!("", r"(?P<name>[\w.]+) joined the game"), EventKind::PlayerJoined),
    (message!("", r"Player disconnected: (?P<name>[^,]+)"), EventKind::PlayerLeft),
    (message!("", r"(?P<name>[\w.]+) left the game"), EventKind::PlayerLeft),
];

/// Terminal escape sequences (CSI, OSC, two-byte escapes)
static RE_ANSI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[@-Z\\-_]").unwrap()
});

#[derive(Debug, Clone)]
pub enum Pattern {
    Regex(Regex),
    Literal(String),
}

#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Pattern,
    kind: EventKind,
}

impl Rule {
    pub fn regex(pattern: &str, kind: EventKind) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Pattern::Regex(Regex::new(pattern)?),
            kind,
        })
    }

    pub fn literal(text: impl Into<String>, kind: EventKind) -> Self {
        Self {
            pattern: Pattern::Literal(text.into()),
            kind,
        }
    }

    fn has_name_capture(&self) -> bool {
        match &self.pattern {
            Pattern::Regex(re) => re.captures_len() > 1,
            Pattern::Literal(_) => false,
        }
    }

    fn apply(&self, text: &str) -> Option<Event> {
        let name = match &self.pattern {
            Pattern::Literal(needle) => {
                if !text.contains(needle.as_str()) {
                    return None;
                }
                None
            }
            Pattern::Regex(re) if self.kind.needs_name() => {
                let caps = re.captures(text)?;
                let name = caps.name("name").or_else(|| caps.get(1))?.as_str().trim();
                if name.is_empty() {
                    return None;
                }
                Some(name.to_string())
            }
            Pattern::Regex(re) => {
                if !re.is_match(text) {
                    return None;
                }
                None
            }
        };

        Some(match (self.kind, name) {
            (EventKind::ServerStarted, _) => Event::ServerStarted,
            (EventKind::ServerStopped, _) => Event::ServerStopped,
            (EventKind::ServerCrashed, _) => Event::ServerCrashed,
            (EventKind::WorldSaved, _) => Event::WorldSaved,
            (EventKind::PlayerJoined, Some(name)) => Event::PlayerJoined { name },
            (EventKind::PlayerLeft, Some(name)) => Event::PlayerLeft { name },
            // Player rules are checked for a capture group when the ruleset is built
            (EventKind::PlayerJoined | EventKind::PlayerLeft, None) => return None,
        })
    }
}

/// Ordered rules; the first matching rule decides the event
#[derive(Debug, Clone)]
pub struct Ruleset {
    rules: Vec<Rule>,
}

impl Ruleset {
    pub fn new(rules: Vec<Rule>) -> Result<Self, ConfigError> {
        for (index, rule) in rules.iter().enumerate() {
            if rule.kind.needs_name() && !rule.has_name_capture() {
                return Err(ConfigError::MissingNameCapture {
                    index,
                    kind: rule.kind.to_string(),
                });
            }
        }
        Ok(Self { rules })
    }

    pub fn from_specs(specs: &[RuleSpec]) -> Result<Self, ConfigError> {
        let rules = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                if spec.literal {
                    Ok(Rule::literal(spec.pattern.clone(), spec.kind))
                } else {
                    Rule::regex(&spec.pattern, spec.kind)
                        .map_err(|source| ConfigError::InvalidPattern { index, source })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(rules)
    }

    #[cfg(test)]
    pub fn builtin() -> Self {
        Self::from_specs(&Self::builtin_specs()).expect("built-in rules are valid")
    }

    pub fn builtin_specs() -> Vec<RuleSpec> {
        DEFAULT_RULES
            .iter()
            .map(|(pattern, kind)| RuleSpec {
                pattern: pattern.to_string(),
                literal: false,
                kind: *kind,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Classify one line. Pure: the same text always yields the same event.
pub fn classify(line: &RawLine, ruleset: &Ruleset) -> Event {
    let text = strip_escapes(&line.text);
    ruleset
        .rules
        .iter()
        .find_map(|rule| rule.apply(&text))
        .unwrap_or_else(|| Event::Unrecognized {
            raw: line.text.clone(),
        })
}

fn strip_escapes(text: &str) -> Cow<'_, str> {
    if text.contains('\x1b') {
        RE_ANSI.replace_all(text, "")
    } else {
        Cow::Borrowed(text)
    }
}
