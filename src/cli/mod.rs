//! CLI interface for trayvault.
//!
//! Provides command-line argument parsing using clap.

use clap::{Args, Parser, Subcommand};

use crate::cord::CordKind;
use crate::path::StoragePath;
use crate::tray::TrayKind;

/// Command-line interface for trayvault.
#[derive(Parser)]
#[command(name = "trayvault")]
#[command(author, version, about = "Inspect and repair trays, cords and locks in an object store", long_about = None)]
pub struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// An object addressed by container and path.
#[derive(Debug, Clone, Args)]
pub struct Target {
    /// Container (local directory or bucket) holding the object.
    pub container: String,

    /// Object path inside the container, e.g. "/acct/u1/profile.json".
    pub path: String,
}

impl Target {
    #[must_use]
    pub fn storage_path(&self) -> StoragePath {
        StoragePath::new(self.container.as_str(), &self.path)
    }
}

/// Available CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// List all containers.
    Containers,

    /// Create a container.
    Mkcontainer {
        /// Name of the new container.
        container: String,
    },

    /// Remove an empty container.
    Rmcontainer {
        /// Name of the container.
        container: String,
    },

    /// List objects below a prefix.
    Ls {
        /// Container to list.
        container: String,

        /// Only list objects below this path.
        #[arg(default_value = "/")]
        prefix: String,

        /// Show size and modification time.
        #[arg(short, long)]
        long: bool,
    },

    /// Print the contents of an object.
    Cat {
        #[command(flatten)]
        target: Target,
    },

    /// Remove an object under its lock.
    Rm {
        #[command(flatten)]
        target: Target,

        /// Break the lock if it cannot be acquired in time.
        #[arg(short, long)]
        force: bool,
    },

    /// Total size of the objects below a prefix.
    Du {
        /// Container to measure.
        container: String,

        /// Only count objects below this path.
        #[arg(default_value = "/")]
        prefix: String,
    },

    /// Read and edit a tray (one JSON object per path).
    Tray {
        #[command(subcommand)]
        action: TrayAction,
    },

    /// Read and edit a cord (one JSON array of objects per path).
    Cord {
        #[command(subcommand)]
        action: CordAction,
    },

    /// Inspect or break sentinel locks.
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
}

/// Tray subcommands.
#[derive(Subcommand)]
pub enum TrayAction {
    /// Print one value, or the whole tray when no key is given.
    Get {
        #[command(flatten)]
        target: Target,

        /// Key to look up.
        key: Option<String>,
    },

    /// Store a value. Text that is not valid JSON is stored as a string.
    Put {
        #[command(flatten)]
        target: Target,

        /// Key to store under.
        key: String,

        /// Value as JSON, e.g. '{"tier":"pro"}', 42 or plain text.
        value: String,

        /// Tray variant to open the document as.
        #[arg(short, long, default_value = "persistent")]
        kind: TrayKind,
    },

    /// Remove a key.
    Remove {
        #[command(flatten)]
        target: Target,

        /// Key to remove.
        key: String,

        /// Tray variant to open the document as.
        #[arg(short, long, default_value = "persistent")]
        kind: TrayKind,
    },

    /// List the keys of a tray.
    Keys {
        #[command(flatten)]
        target: Target,
    },
}

/// Cord subcommands.
#[derive(Subcommand)]
pub enum CordAction {
    /// Append a JSON object.
    Append {
        #[command(flatten)]
        target: Target,

        /// Object to append, e.g. '{"user_id":"42","event":"login"}'.
        object: String,

        /// Cord variant to open the log as.
        #[arg(short, long, default_value = "persistent")]
        kind: CordKind,
    },

    /// Print the elements of a cord, one per line.
    Show {
        #[command(flatten)]
        target: Target,
    },

    /// Remove every element whose field equals a value.
    RemoveWhere {
        #[command(flatten)]
        target: Target,

        /// Field to compare.
        key: String,

        /// Value the field must equal.
        value: String,

        /// Compare as an integer instead of a string.
        #[arg(short, long)]
        int: bool,
    },
}

/// Lock subcommands.
#[derive(Subcommand)]
pub enum LockAction {
    /// Show who holds the lock on an object.
    Status {
        #[command(flatten)]
        target: Target,
    },

    /// Remove the lock on an object, whoever holds it.
    Break {
        #[command(flatten)]
        target: Target,
    },
}
