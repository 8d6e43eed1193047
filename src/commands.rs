//! Operator console commands.
//!
//! Console input is either a local action (help, exit, reattach, ...), a
//! change to the saved settings, or a shorthand that expands into a server
//! command line.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::config::Config;

const NAMEDPOS_USAGE: &str = "namedpos list | namedpos add <name> <x y z> | namedpos del <name>";
const PLAYER_USAGE: &str = "player list | player add <name> | player del <name>";

/// Help text, in display order
pub const HELP: &[(&str, &str)] = &[
    ("help", "Display help information about available commands"),
    ("exit", "Exit the application"),
    ("sc <command>", "Send a command to the server"),
    ("raw <text>", "Send raw input directly to the server"),
    ("say <message>", "Broadcast a message to every player"),
    ("give <player> <item> [qty]", "Give items to a player"),
    ("qg <item> [qty]", "Give items to the default player"),
    ("enchant <player> <enchantment> [level]", "Enchant a player's held item"),
    ("effect <player> <effect> [seconds] [amplifier] [hide]", "Apply an effect to a player"),
    ("effectclear <player>", "Clear all effects from a player"),
    ("tp <player> <x y z | position | @player>", "Teleport a player"),
    ("namedpos list | add <name> <x y z> | del <name>", "Manage named positions for tp"),
    ("player list | add <name> | del <name>", "Manage known players; the first becomes the default"),
    ("reattach", "Reattach to the tmux session"),
    ("clear", "Clear the console"),
    ("copy", "Copy the console to the clipboard"),
];

/// What a line of operator input asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Send this line to the server
    Send(String),
    Help,
    Exit,
    Reattach,
    Clear,
    Copy,
    /// List or change a saved setting
    Setting(Setting),
}

/// Settings kept in the config file and edited from the console
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting {
    ListPositions,
    AddPosition { name: String, position: String },
    RemovePosition(String),
    ListPlayers,
    AddPlayer(String),
    RemovePlayer(String),
}

/// Result of applying a [`Setting`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Lines to show the operator
    pub lines: Vec<String>,
    /// Whether the config changed and needs saving
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("unknown command: {0} (try 'help')")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid quantity '{0}'")]
    InvalidQuantity(String),

    #[error("position must be three coordinates (x y z), numbers or ~ notation")]
    InvalidPosition,

    #[error("no default player set; use 'player add <name>' to add one first")]
    NoDefaultPlayer,

    #[error("position '{name}' already exists with value {position}")]
    PositionExists { name: String, position: String },

    #[error("position '{0}' does not exist")]
    UnknownPosition(String),

    #[error("player '{0}' is already in the list")]
    PlayerExists(String),

    #[error("player '{0}' is not in the list")]
    UnknownPlayer(String),
}

/// Settings the shorthands draw on
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub default_player: Option<&'a str>,
    pub named_positions: &'a BTreeMap<String, String>,
}

/// Parse one line of operator input. Blank input yields `None`.
pub fn parse(input: &str, ctx: &CommandContext<'_>) -> Result<Option<Operation>, UsageError> {
    let input = input.trim();
    let Some((name, rest)) = split_first(input) else {
        return Ok(None);
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let operation = match name {
        "help" => Operation::Help,
        "exit" | "quit" => Operation::Exit,
        "reattach" => Operation::Reattach,
        "clear" => Operation::Clear,
        "copy" => Operation::Copy,
        "sc" => {
            if args.is_empty() {
                return Err(UsageError::Usage("sc <command>"));
            }
            Operation::Send(args.join(" "))
        }
        "raw" => {
            if rest.is_empty() {
                return Err(UsageError::Usage("raw <text>"));
            }
            Operation::Send(rest.to_string())
        }
        "say" => {
            if rest.is_empty() {
                return Err(UsageError::Usage("say <message>"));
            }
            Operation::Send(format!("say {rest}"))
        }
        "give" => match args.as_slice() {
            [player, item, rest @ ..] => Operation::Send(give(player, item, rest.first().copied())?),
            _ => return Err(UsageError::Usage("give <player> <item> [qty]")),
        },
        "qg" => {
            let player = ctx.default_player.ok_or(UsageError::NoDefaultPlayer)?;
            match args.as_slice() {
                [item, rest @ ..] => Operation::Send(give(player, item, rest.first().copied())?),
                _ => return Err(UsageError::Usage("qg <item> [qty]")),
            }
        }
        "enchant" => match args.as_slice() {
            [player, enchantment] => Operation::Send(format!("enchant {player} {enchantment} 1")),
            [player, enchantment, level] => {
                let level = positive(level)?;
                Operation::Send(format!("enchant {player} {enchantment} {level}"))
            }
            _ => return Err(UsageError::Usage("enchant <player> <enchantment> [level]")),
        },
        "effect" => match args.as_slice() {
            [player, effect, rest @ ..] if rest.len() <= 3 => Operation::Send(effect_command(player, effect, rest)),
            _ => return Err(UsageError::Usage("effect <player> <effect> [seconds] [amplifier] [hide]")),
        },
        "effectclear" => match args.as_slice() {
            [player] => Operation::Send(format!("effect clear {player}")),
            _ => return Err(UsageError::Usage("effectclear <player>")),
        },
        "tp" => match args.as_slice() {
            [player, destination @ ..] if !destination.is_empty() => {
                Operation::Send(teleport(player, &destination.join(" "), ctx)?)
            }
            _ => return Err(UsageError::Usage("tp <player> <x y z | position | @player>")),
        },
        "namedpos" => Operation::Setting(match args.as_slice() {
            ["list"] => Setting::ListPositions,
            ["add", name, coords @ ..] if !coords.is_empty() => Setting::AddPosition {
                name: name.to_string(),
                position: position(&coords.join(" "))?,
            },
            ["del", name] => Setting::RemovePosition(name.to_string()),
            _ => return Err(UsageError::Usage(NAMEDPOS_USAGE)),
        }),
        "player" => Operation::Setting(match args.as_slice() {
            ["list"] => Setting::ListPlayers,
            ["add", name] => Setting::AddPlayer(name.to_string()),
            ["del", name] => Setting::RemovePlayer(name.to_string()),
            _ => return Err(UsageError::Usage(PLAYER_USAGE)),
        }),
        other => return Err(UsageError::Unknown(other.to_string())),
    };
    Ok(Some(operation))
}

impl Setting {
    /// Apply to `config`. Listing never changes it; a rejected change leaves
    /// it untouched.
    pub fn apply(&self, config: &mut Config) -> Result<Applied, UsageError> {
        let (lines, changed) = match self {
            Setting::ListPositions if config.named_positions.is_empty() => {
                (vec!["No named positions defined".to_string()], false)
            }
            Setting::ListPositions => (
                config
                    .named_positions
                    .iter()
                    .map(|(name, position)| format!("{name}: {position}"))
                    .collect(),
                false,
            ),
            Setting::AddPosition { name, position } => {
                if let Some(existing) = config.named_positions.get(name) {
                    return Err(UsageError::PositionExists {
                        name: name.clone(),
                        position: existing.clone(),
                    });
                }
                config.named_positions.insert(name.clone(), position.clone());
                (vec![format!("Added position '{name}': {position}")], true)
            }
            Setting::RemovePosition(name) => {
                if config.named_positions.remove(name).is_none() {
                    return Err(UsageError::UnknownPosition(name.clone()));
                }
                (vec![format!("Removed position '{name}'")], true)
            }
            Setting::ListPlayers if config.players.is_empty() => (vec!["No players in the list".to_string()], false),
            Setting::ListPlayers => (
                config
                    .players
                    .iter()
                    .map(|player| {
                        if config.default_player.as_ref() == Some(player) {
                            format!("{player} (default)")
                        } else {
                            player.clone()
                        }
                    })
                    .collect(),
                false,
            ),
            Setting::AddPlayer(name) => {
                if !config.players.insert(name.clone()) {
                    return Err(UsageError::PlayerExists(name.clone()));
                }
                let mut lines = vec![format!("Added player '{name}'")];
                if config.default_player.is_none() {
                    config.default_player = Some(name.clone());
                    lines.push(format!("'{name}' is now the default player"));
                }
                (lines, true)
            }
            Setting::RemovePlayer(name) => {
                if !config.players.remove(name) {
                    return Err(UsageError::UnknownPlayer(name.clone()));
                }
                let mut lines = vec![format!("Removed player '{name}'")];
                if config.default_player.as_ref() == Some(name) {
                    config.default_player = config.players.iter().next().cloned();
                    lines.push(match &config.default_player {
                        Some(next) => format!("'{next}' is now the default player"),
                        None => "No default player set".to_string(),
                    });
                }
                (lines, true)
            }
        };
        Ok(Applied { lines, changed })
    }
}

fn split_first(input: &str) -> Option<(&str, &str)> {
    if input.is_empty() {
        return None;
    }
    Some(match input.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim_start()),
        None => (input, ""),
    })
}

fn positive(value: &str) -> Result<u32, UsageError> {
    match value.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(UsageError::InvalidQuantity(value.to_string())),
    }
}

fn give(player: &str, item: &str, quantity: Option<&str>) -> Result<String, UsageError> {
    let quantity = quantity.map(positive).transpose()?.unwrap_or(1);
    Ok(format!("give {player} {item} {quantity}"))
}

/// Out of range or unparsable numbers fall back to sane values
fn effect_command(player: &str, effect: &str, rest: &[&str]) -> String {
    let seconds = rest
        .first()
        .map(|s| s.parse::<i64>().map(|n| n.max(1)).unwrap_or(30))
        .unwrap_or(30);
    let amplifier = rest
        .get(1)
        .map(|s| s.parse::<i64>().map(|n| n.clamp(0, 255)).unwrap_or(0))
        .unwrap_or(0);
    let hide = rest.get(2).copied().unwrap_or("true");
    format!("effect {player} {effect} {seconds} {amplifier} {hide}")
}

fn teleport(player: &str, destination: &str, ctx: &CommandContext<'_>) -> Result<String, UsageError> {
    if let Some(target) = destination.strip_prefix('@') {
        return Ok(format!("tp {player} {target}"));
    }

    let destination = ctx
        .named_positions
        .get(destination)
        .map(String::as_str)
        .unwrap_or(destination);
    Ok(format!("tp {player} {}", position(destination)?))
}

/// Three coordinates separated by spaces or commas, normalized to spaces
fn position(text: &str) -> Result<String, UsageError> {
    let coords: Vec<&str> = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .collect();
    if coords.len() != 3 || !coords.iter().all(|c| is_coordinate(c)) {
        return Err(UsageError::InvalidPosition);
    }
    Ok(coords.join(" "))
}

/// A number, `~`, or `~<offset>`
fn is_coordinate(value: &str) -> bool {
    let offset = value.strip_prefix('~').unwrap_or(value);
    (value.starts_with('~') && offset.is_empty()) || offset.parse::<f64>().is_ok()
}
