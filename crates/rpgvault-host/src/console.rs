//! Operator console: one command per line on stdin.
//!
//! ```text
//! join <player-uuid> <name>   connect a player
//! leave <player-uuid>         disconnect a player
//! xp <player-uuid> <amount>   grant experience
//! pay <player-uuid> <delta>   add (or spend, when negative) currency
//! save <player-uuid>          queue a save now
//! show <player-uuid>          print the cached record
//! quit                        flush and stop
//! ```
//!
//! Lines are parsed on a dedicated reader thread and delivered to the tick
//! loop over a channel. End of input counts as `quit`.

use std::io::BufRead;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use rpgvault_types::PlayerId;

use crate::error::CommandError;

/// A parsed console command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Connect a player.
    Join {
        /// The player.
        player_id: PlayerId,
        /// Display name.
        name: String,
    },
    /// Disconnect a player.
    Leave {
        /// The player.
        player_id: PlayerId,
    },
    /// Grant experience.
    Xp {
        /// The player.
        player_id: PlayerId,
        /// Experience to add.
        amount: u64,
    },
    /// Change currency.
    Pay {
        /// The player.
        player_id: PlayerId,
        /// Signed currency delta.
        delta: i64,
    },
    /// Queue a save now.
    Save {
        /// The player.
        player_id: PlayerId,
    },
    /// Print the cached record.
    Show {
        /// The player.
        player_id: PlayerId,
    },
    /// Flush everything and stop.
    Quit,
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "join" => {
            let player_id = player_arg("join", words.next())?;
            let name = words.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                return Err(CommandError::MissingArgument {
                    command: "join",
                    argument: "name",
                });
            }
            Command::Join { player_id, name }
        }
        "leave" => Command::Leave {
            player_id: player_arg("leave", words.next())?,
        },
        "xp" => Command::Xp {
            player_id: player_arg("xp", words.next())?,
            amount: number_arg("xp", words.next())?,
        },
        "pay" => Command::Pay {
            player_id: player_arg("pay", words.next())?,
            delta: number_arg("pay", words.next())?,
        },
        "save" => Command::Save {
            player_id: player_arg("save", words.next())?,
        },
        "show" => Command::Show {
            player_id: player_arg("show", words.next())?,
        },
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_owned())),
    };
    Ok(Some(command))
}

fn player_arg(command: &'static str, word: Option<&str>) -> Result<PlayerId, CommandError> {
    let value = word.ok_or(CommandError::MissingArgument {
        command,
        argument: "player id",
    })?;
    value
        .parse()
        .map_err(|source| CommandError::InvalidPlayerId {
            value: value.to_owned(),
            source,
        })
}

fn number_arg<T: std::str::FromStr>(
    command: &'static str,
    word: Option<&str>,
) -> Result<T, CommandError> {
    let value = word.ok_or(CommandError::MissingArgument {
        command,
        argument: "number",
    })?;
    value
        .parse()
        .ok()
        .ok_or_else(|| CommandError::InvalidNumber(value.to_owned()))
}

/// Start the stdin reader thread.
///
/// Parsed commands are sent on `commands`; the thread sends
/// [`Command::Quit`] and exits at end of input.
pub fn spawn_reader(commands: Sender<Command>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(String::from("rpgvault-console"))
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "Console read failed");
                        break;
                    }
                };
                match parse(&line) {
                    Ok(Some(command)) => {
                        let quit = command == Command::Quit;
                        if commands.send(command).is_err() || quit {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(error = %e, "Ignoring console input"),
                }
            }
            if commands.send(Command::Quit).is_err() {
                tracing::debug!("Tick loop already stopped");
            }
        })
}
