//! Command execution.

use crate::identity::Identity;
use crate::{Cli, Commands};
use bytes::Bytes;
use colored::Colorize;
use msgrelay_client::Client;
use msgrelay_protocol::{ClientId, MessageType, PendingMessage, PublicKey, UserEntry, PUBLIC_KEY_SIZE};
use std::collections::HashMap;
use std::path::Path;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Executes a command and returns the formatted output.
pub async fn execute(client: Client, cli: &Cli) -> CliResult<String> {
    match &cli.command {
        Commands::Register {
            name,
            public_key,
            save,
        } => {
            let public_key = parse_public_key(public_key)?;
            let client_id = client.register(name.as_str(), public_key).await?;

            let mut output = format!(
                "{} {} as {}",
                "Registered".green(),
                name.cyan(),
                client_id.to_string().yellow()
            );
            if *save {
                Identity {
                    name: name.clone(),
                    client_id,
                }
                .save(&cli.identity)?;
                output.push_str(&format!(
                    "\n{} {}",
                    "Saved identity to".dimmed(),
                    cli.identity.display()
                ));
            }
            Ok(output)
        }

        Commands::Users => {
            let client = identify(client, cli)?;
            let users = client.users_list().await?;
            if users.is_empty() {
                return Ok("No other clients registered".yellow().to_string());
            }

            let mut output = format!("{}\n", "Registered clients:".bold());
            for user in &users {
                output.push_str(&format!("  {}  {}\n", user.client_id, user.name.cyan()));
            }
            Ok(output.trim_end().to_string())
        }

        Commands::PublicKey { target } => {
            let client = identify(client, cli)?;
            let target_id = resolve_target(&client, target).await?;
            let key = client.public_key(target_id).await?;
            Ok(format!(
                "{} {}\n{}",
                "Public key of".bold(),
                target.cyan(),
                hex::encode(key.as_bytes())
            ))
        }

        Commands::Send {
            target,
            message_type,
            content,
        } => {
            let message_type = MessageType(*message_type);
            if !message_type.is_valid() {
                return Err("message type must be between 1 and 255".into());
            }

            let client = identify(client, cli)?;
            let target_id = resolve_target(&client, target).await?;
            let content = read_content(content)?;
            let size = content.len();
            let message_id = client.send_message(target_id, message_type, content).await?;

            Ok(format!(
                "{} {} message {} to {} ({} bytes)",
                "Queued".green(),
                message_type.label(),
                message_id.to_string().yellow(),
                target.cyan(),
                size
            ))
        }

        Commands::Pull { save_dir } => {
            let client = identify(client, cli)?;
            let messages = client.pull_pending().await?;
            if messages.is_empty() {
                return Ok("No pending messages".yellow().to_string());
            }

            // Names are cosmetic; fall back to ids if the lookup fails.
            let names: HashMap<ClientId, String> = client
                .users_list()
                .await
                .map(|users| users.into_iter().map(|u| (u.client_id, u.name)).collect())
                .unwrap_or_default();

            let mut output = String::new();
            for message in &messages {
                output.push_str(&format_message(message, &names, save_dir.as_deref())?);
                output.push('\n');
            }
            Ok(output.trim_end().to_string())
        }
    }
}

/// Attaches the caller's client id from `--id` or the identity file.
fn identify(client: Client, cli: &Cli) -> CliResult<Client> {
    let client_id = match &cli.id {
        Some(id) => id.parse::<ClientId>()?,
        None => Identity::load(&cli.identity)?.client_id,
    };
    Ok(client.with_client_id(client_id))
}

/// Accepts a hex client id or a registered name.
async fn resolve_target(client: &Client, target: &str) -> CliResult<ClientId> {
    if let Ok(id) = target.parse::<ClientId>() {
        return Ok(id);
    }
    let users = client.users_list().await?;
    find_by_name(&users, target).ok_or_else(|| format!("no client named '{}'", target).into())
}

fn find_by_name(users: &[UserEntry], name: &str) -> Option<ClientId> {
    users.iter().find(|u| u.name == name).map(|u| u.client_id)
}

/// Parses `hex` or `@file`. A file may hold the raw key or its hex form.
fn parse_public_key(arg: &str) -> CliResult<PublicKey> {
    let bytes = match arg.strip_prefix('@') {
        Some(path) => {
            let raw = std::fs::read(path)?;
            if raw.len() == PUBLIC_KEY_SIZE {
                raw
            } else {
                hex::decode(String::from_utf8_lossy(&raw).trim())?
            }
        }
        None => hex::decode(arg.trim())?,
    };
    Ok(PublicKey::from_slice(&bytes)?)
}

/// Reads `@file` contents or takes the argument as text.
fn read_content(arg: &str) -> CliResult<Bytes> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(Bytes::from(std::fs::read(path)?)),
        None => Ok(Bytes::copy_from_slice(arg.as_bytes())),
    }
}

fn format_message(
    message: &PendingMessage,
    names: &HashMap<ClientId, String>,
    save_dir: Option<&Path>,
) -> CliResult<String> {
    let from = names
        .get(&message.source)
        .cloned()
        .unwrap_or_else(|| message.source.to_string());

    let header = format!(
        "{} {}  {} #{} ({}, {} bytes)",
        "From:".bold(),
        from.cyan(),
        "message".dimmed(),
        message.message_id,
        message.message_type.label(),
        message.content.len()
    );

    let body = match message.message_type {
        MessageType::SYMMETRIC_KEY_REQUEST => "Request for symmetric key".to_string(),
        MessageType::SYMMETRIC_KEY_SEND => "Symmetric key received".to_string(),
        MessageType::FILE => match save_dir {
            Some(dir) => {
                let path = dir.join(format!("msg_{}.bin", message.message_id));
                std::fs::write(&path, &message.content)?;
                format!("Saved to {}", path.display())
            }
            None => format!("<{} bytes of file data; use --save-dir>", message.content.len()),
        },
        _ => match std::str::from_utf8(&message.content) {
            Ok(text) => text.to_string(),
            Err(_) => hex::encode(&message.content),
        },
    };

    Ok(format!("{}\n{}\n{}", header, body, "-----".dimmed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_public_key_hex_and_file() {
        let hex_key = "ab".repeat(PUBLIC_KEY_SIZE);
        let key = parse_public_key(&hex_key).unwrap();
        assert!(key.as_bytes().iter().all(|b| *b == 0xab));

        assert!(parse_public_key("abcd").is_err());
        assert!(parse_public_key("zz").is_err());

        let dir = TempDir::new().unwrap();
        let raw = dir.path().join("key.bin");
        std::fs::write(&raw, [7u8; PUBLIC_KEY_SIZE]).unwrap();
        let key = parse_public_key(&format!("@{}", raw.display())).unwrap();
        assert_eq!(key.as_bytes()[0], 7);

        let text = dir.path().join("key.hex");
        std::fs::write(&text, format!("{}\n", hex_key)).unwrap();
        assert!(parse_public_key(&format!("@{}", text.display())).is_ok());
    }

    #[test]
    fn test_read_content() {
        assert_eq!(&read_content("hello").unwrap()[..], b"hello");

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, [0u8, 1, 2]).unwrap();
        assert_eq!(
            &read_content(&format!("@{}", path.display())).unwrap()[..],
            &[0, 1, 2]
        );
    }

    #[test]
    fn test_find_by_name() {
        let id = ClientId::generate();
        let users = vec![UserEntry {
            client_id: id,
            name: "zoe".to_string(),
        }];
        assert_eq!(find_by_name(&users, "zoe"), Some(id));
        assert_eq!(find_by_name(&users, "yan"), None);
    }

    #[test]
    fn test_format_message_saves_files() {
        colored::control::set_override(false);
        let dir = TempDir::new().unwrap();
        let source = ClientId::generate();
        let message = PendingMessage {
            source,
            message_id: 42,
            message_type: MessageType::FILE,
            content: Bytes::from_static(b"file body"),
        };
        let names = HashMap::from([(source, "quinn".to_string())]);

        let output = format_message(&message, &names, Some(dir.path())).unwrap();
        assert!(output.contains("quinn"));
        assert!(output.contains("#42"));
        assert_eq!(
            std::fs::read(dir.path().join("msg_42.bin")).unwrap(),
            b"file body"
        );

        let text = PendingMessage {
            message_type: MessageType::TEXT,
            content: Bytes::from_static(b"plain words"),
            ..message
        };
        let output = format_message(&text, &HashMap::new(), None).unwrap();
        assert!(output.contains("plain words"));
        assert!(output.contains(&source.to_string()));
    }
}
