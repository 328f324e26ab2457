use std::io::Write;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use trayvault::cli::{Cli, Commands, CordAction, LockAction, TrayAction};
use trayvault::commands::{self, LockStatus, Session};

/// Environment variable holding the log filter, e.g. `trayvault=debug`.
const LOG_ENV: &str = "TRAYVAULT_LOG";

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::parse_from(["trayvault", "--help"]);
        return Ok(());
    };
    let session = Session::load()?;

    match command {
        Commands::Containers => {
            for container in commands::containers(&session)? {
                match container.created {
                    Some(created) => println!("{}\t{}", container.name, created.to_rfc3339()),
                    None => println!("{}", container.name),
                }
            }
        }
        Commands::Mkcontainer { container } => commands::make_container(&session, &container)?,
        Commands::Rmcontainer { container } => commands::remove_container(&session, &container)?,
        Commands::Ls { container, prefix, long } => {
            for object in commands::list(&session, &container, &prefix)? {
                if long {
                    let modified: chrono::DateTime<chrono::Utc> = object.last_modified.into();
                    println!("{:>10}  {}  {}", object.size, modified.to_rfc3339(), object.path.path());
                } else {
                    println!("{}", object.path.path());
                }
            }
        }
        Commands::Cat { target } => {
            let data = commands::cat(&session, &target)?;
            std::io::stdout().write_all(&data)?;
        }
        Commands::Rm { target, force } => commands::remove(&session, &target, force)?,
        Commands::Du { container, prefix } => {
            println!("{}", commands::disk_usage(&session, &container, &prefix)?);
        }
        Commands::Tray { action } => match action {
            TrayAction::Get { target, key } => match commands::tray_get(&session, &target, key.as_deref())? {
                Some(value) => print_json(&value)?,
                None => anyhow::bail!("Key not found: {}", key.unwrap_or_default()),
            },
            TrayAction::Put { target, key, value, kind } => {
                if let Some(previous) = commands::tray_put(&session, &target, &key, &value, kind)? {
                    eprintln!("Replaced: {previous}");
                }
            }
            TrayAction::Remove { target, key, kind } => {
                if commands::tray_remove(&session, &target, &key, kind)?.is_none() {
                    eprintln!("Key was not present: {key}");
                }
            }
            TrayAction::Keys { target } => {
                for key in commands::tray_keys(&session, &target)? {
                    println!("{key}");
                }
            }
        },
        Commands::Cord { action } => match action {
            CordAction::Append { target, object, kind } => {
                let size = commands::cord_append(&session, &target, &object, kind)?;
                eprintln!("Cord now has {size} elements");
            }
            CordAction::Show { target } => {
                for element in commands::cord_show(&session, &target)? {
                    println!("{}", serde_json::to_string(&element)?);
                }
            }
            CordAction::RemoveWhere { target, key, value, int } => {
                let removed = commands::cord_remove_where(&session, &target, &key, &value, int)?;
                for element in &removed {
                    println!("{}", serde_json::to_string(element)?);
                }
                eprintln!("Removed {} elements", removed.len());
            }
        },
        Commands::Lock { action } => match action {
            LockAction::Status { target } => match commands::lock_status(&session, &target)? {
                LockStatus::Free => println!("unlocked"),
                LockStatus::Held(Some(holder)) => {
                    let since = holder
                        .acquired_at()
                        .map_or_else(|| holder.time.to_string(), |t| t.to_rfc3339());
                    println!("locked by {} ({}) since {since}", holder.host, holder.ip);
                }
                LockStatus::Held(None) => println!("locked (holder unknown)"),
            },
            LockAction::Break { target } => {
                if commands::lock_break(&session, &target)? {
                    println!("lock broken");
                } else {
                    println!("not locked");
                }
            }
        },
    }

    Ok(())
}
