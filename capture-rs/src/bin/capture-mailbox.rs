//! CLI tool for inspecting captured mail in a file store
//!
//! # Usage
//!
//! ```bash
//! # List mailboxes and their message counts
//! capture-mailbox list --path /tmp/capture
//!
//! # Show the messages in one mailbox
//! capture-mailbox show user@example.com --path /tmp/capture
//!
//! # Print a message
//! capture-mailbox read user@example.com 20240101T120000-0001
//!
//! # Remove messages
//! capture-mailbox delete user@example.com 20240101T120000-0001
//! capture-mailbox purge user@example.com
//! ```

use anyhow::Context;
use capture_rs::storage::{DataStore, FileStore};
use capture_rs::utils::parse_email_address;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "capture-mailbox")]
#[command(about = "Inspect and clean captured mailboxes", long_about = None)]
struct Cli {
    /// File store root directory
    #[arg(short, long, default_value = "/tmp/capture")]
    path: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all mailboxes
    List,
    /// Show the messages in a mailbox
    Show {
        /// Mailbox address
        mailbox: String,
    },
    /// Print a message
    Read {
        /// Mailbox address
        mailbox: String,
        /// Message id
        id: String,
        /// Print only the header
        #[arg(long)]
        header: bool,
    },
    /// Delete every message in a mailbox
    Purge {
        /// Mailbox address
        mailbox: String,
    },
    /// Delete one message
    Delete {
        /// Mailbox address
        mailbox: String,
        /// Message id
        id: String,
    },
}

/// Mailboxes are keyed by normalized address
fn mailbox_name(address: &str) -> anyhow::Result<String> {
    let parsed = parse_email_address(address)
        .with_context(|| format!("Invalid mailbox address {:?}", address))?;
    Ok(parsed.normalized())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let store = FileStore::open(&cli.path)
        .await
        .with_context(|| format!("Failed to open store at {}", cli.path))?;

    match cli.command {
        Commands::List => {
            let mailboxes = store.all_mailboxes().await?;
            if mailboxes.is_empty() {
                println!("No mailboxes found.");
                return Ok(());
            }

            println!("{:<40} {:>8}", "Mailbox", "Messages");
            println!("{:-<49}", "");
            for mailbox in &mailboxes {
                let count = mailbox.get_messages().await?.len();
                println!("{:<40} {:>8}", mailbox.name(), count);
            }
            println!("\nTotal: {} mailbox(es)", mailboxes.len());
        }
        Commands::Show { mailbox } => {
            let mailbox = store.mailbox_for(&mailbox_name(&mailbox)?).await?;
            let messages = mailbox.get_messages().await?;
            if messages.is_empty() {
                println!("No messages in {}.", mailbox.name());
                return Ok(());
            }

            println!(
                "{:<22} {:<20} {:<30} {:>8}  {}",
                "Id", "Date", "From", "Size", "Subject"
            );
            println!("{:-<100}", "");
            for message in &messages {
                println!(
                    "{:<22} {:<20} {:<30} {:>8}  {}",
                    message.id(),
                    message.date().format("%Y-%m-%d %H:%M:%S"),
                    message.from(),
                    message.size(),
                    message.subject()
                );
            }
            println!("\nTotal: {} message(s)", messages.len());
        }
        Commands::Read {
            mailbox,
            id,
            header,
        } => {
            let mailbox = store.mailbox_for(&mailbox_name(&mailbox)?).await?;
            let message = mailbox.get_message(&id).await?;
            if header {
                print!("{}", message.read_header().await?);
            } else {
                let raw = message.read_raw().await?;
                print!("{}", String::from_utf8_lossy(&raw));
            }
        }
        Commands::Purge { mailbox } => {
            let mailbox = store.mailbox_for(&mailbox_name(&mailbox)?).await?;
            let count = mailbox.get_messages().await?.len();
            mailbox.purge().await?;
            println!("✓ Purged {} message(s) from {}", count, mailbox.name());
        }
        Commands::Delete { mailbox, id } => {
            let mailbox = store.mailbox_for(&mailbox_name(&mailbox)?).await?;
            let message = match mailbox.get_message(&id).await {
                Ok(message) => message,
                Err(e) if e.is_not_found() => {
                    eprintln!("Error: message {} does not exist in {}", id, mailbox.name());
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            };
            message.delete().await?;
            println!("✓ Message {} deleted", id);
        }
    }

    Ok(())
}
