//! Error types for the reference host binary.
//!
//! [`HostError`] covers the startup steps `main` runs before the tick loop;
//! [`CommandError`] is a rejected console line and never stops the host.

/// Startup failure of the host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: rpgvault_core::ConfigError,
    },

    /// Connecting to the store failed.
    #[error("database error: {source}")]
    Database {
        /// The underlying database error.
        #[from]
        source: rpgvault_db::DbError,
    },

    /// The schema could not be brought up to date.
    #[error("schema error: {source}")]
    Schema {
        /// The underlying schema error.
        #[from]
        source: rpgvault_db::SchemaError,
    },

    /// The worker runtime could not be built.
    #[error("bridge error: {source}")]
    Bridge {
        /// The underlying bridge error.
        #[from]
        source: rpgvault_core::BridgeError,
    },

    /// The console reader thread could not be started.
    #[error("console error: {source}")]
    Console {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

/// A console line that could not be turned into a command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The first word is not a known command.
    #[error("unknown command '{0}'")]
    Unknown(String),

    /// A required argument is missing.
    #[error("'{command}' needs a {argument}")]
    MissingArgument {
        /// The command.
        command: &'static str,
        /// Name of the missing argument.
        argument: &'static str,
    },

    /// The player id is not a UUID.
    #[error("invalid player id '{value}': {source}")]
    InvalidPlayerId {
        /// The text given.
        value: String,
        /// The parse error.
        source: uuid::Error,
    },

    /// A numeric argument did not parse.
    #[error("invalid number '{0}'")]
    InvalidNumber(String),
}
