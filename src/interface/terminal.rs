use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};

use crate::chat::Sender;
use crate::manager::Manager;
use crate::session::{SessionError, SessionStore};
use crate::store::KvStore;

const HELP: &str = "\
These commands are supported:
/new                 Start a new chat and switch to it.
/list                Show chats, most recent first.
/switch <n|id>       Switch to a chat.
/rename <n|id> name  Rename a chat.
/delete <n|id>       Delete a chat.
/history             Show the messages of the current chat.
/help                Display this text.
/quit                Leave.
Anything else is sent to the assistant.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    New,
    List,
    Switch(String),
    Rename(String, String),
    Delete(String),
    History,
    Help,
    Quit,
    Say(String),
}

impl Command {
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let line = line.trim_end_matches(['\r', '\n']);
        let Some(rest) = line.trim_start().strip_prefix('/') else {
            return Ok(Command::Say(line.to_string()));
        };

        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };

        match name {
            "new" => Ok(Command::New),
            "list" => Ok(Command::List),
            "history" => Ok(Command::History),
            "help" => Ok(Command::Help),
            "quit" | "exit" => Ok(Command::Quit),
            "switch" | "delete" if args.is_empty() => Err(format!("Usage: /{} <n|id>", name)),
            "switch" => Ok(Command::Switch(args.to_string())),
            "delete" => Ok(Command::Delete(args.to_string())),
            "rename" => match args.split_once(char::is_whitespace) {
                Some((target, new_name)) => {
                    Ok(Command::Rename(target.to_string(), new_name.to_string()))
                }
                None => Err("Usage: /rename <n|id> <name>".to_string()),
            },
            other => Err(format!("Unknown command: /{}", other)),
        }
    }
}

pub struct TerminalInterface<S: KvStore> {
    manager: Arc<Manager<S>>,
}

impl<S: KvStore> TerminalInterface<S> {
    pub fn new(manager: Arc<Manager<S>>) -> Self {
        Self { manager }
    }

    pub async fn run(&self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        let banner = format!("{}\n{}\n", self.handle(Command::List).await?, "Type /help for commands.");
        stdout.write_all(banner.as_bytes()).await?;

        loop {
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let output = match Command::parse(&line) {
                Ok(Command::Quit) => break,
                Ok(command) => match self.handle(command).await {
                    Ok(output) => output,
                    Err(e) => {
                        error!("Command failed: {:#}", e);
                        format!("Error: {}", e)
                    }
                },
                Err(usage) => usage,
            };

            stdout.write_all(output.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }

        info!("Terminal session closed");
        Ok(())
    }

    /// Executes one command and returns the text to show.
    pub async fn handle(&self, command: Command) -> Result<String> {
        match command {
            Command::Say(text) => match self.manager.submit(&text).await {
                Ok(reply) => Ok(format!("bot: {}", reply.text)),
                Err(SessionError::EmptyMessage) => Ok(String::new()),
                Err(SessionError::Busy(_)) => {
                    Ok("Still waiting for the previous reply.".to_string())
                }
                Err(e) => Err(e.into()),
            },
            Command::New => {
                let mut store = self.manager.sessions().await;
                let id = store.new_chat().await?;
                let name = store.get(&id).map(|s| s.name.clone()).unwrap_or_default();
                Ok(format!("Started {}", name))
            }
            Command::List => {
                let store = self.manager.sessions().await;
                Ok(render_list(&store))
            }
            Command::Switch(target) => {
                let mut store = self.manager.sessions().await;
                let id = resolve(&store, &target)?;
                store.switch_active(&id).await?;
                Ok(format!("Switched to {}", active_label(&store)))
            }
            Command::Rename(target, new_name) => {
                let mut store = self.manager.sessions().await;
                let id = resolve(&store, &target)?;
                if store.rename_session(&id, &new_name).await? {
                    Ok(format!("Renamed to {}", new_name.trim()))
                } else {
                    Ok("Name unchanged.".to_string())
                }
            }
            Command::Delete(target) => {
                let mut store = self.manager.sessions().await;
                let id = resolve(&store, &target)?;
                store.delete_session(&id).await?;
                Ok(format!("Deleted. Now in {}", active_label(&store)))
            }
            Command::History => {
                let store = self.manager.sessions().await;
                let Some(session) = store.active() else {
                    return Ok(String::new());
                };
                if session.messages.is_empty() {
                    return Ok("No messages yet.".to_string());
                }
                let lines: Vec<String> = session
                    .messages
                    .iter()
                    .map(|m| {
                        let who = match m.sender {
                            Sender::User => "you",
                            Sender::Bot => "bot",
                        };
                        format!("[{}] {}: {}", m.timestamp.format("%H:%M"), who, m.text)
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            Command::Help => Ok(HELP.to_string()),
            Command::Quit => Ok(String::new()),
        }
    }
}

fn render_list<S: KvStore>(store: &SessionStore<S>) -> String {
    store
        .sessions_by_activity()
        .iter()
        .enumerate()
        .map(|(i, session)| {
            let marker = if session.id == store.active_id() { "*" } else { " " };
            format!(
                "{} {}. {} ({} messages)",
                marker,
                i + 1,
                store.display_name(session),
                session.messages.len()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn active_label<S: KvStore>(store: &SessionStore<S>) -> String {
    store
        .active()
        .map(|s| store.display_name(s))
        .unwrap_or_default()
}

/// Accepts a 1-based position in the activity-ordered list or a raw id.
fn resolve<S: KvStore>(store: &SessionStore<S>, target: &str) -> Result<String> {
    if let Ok(position) = target.parse::<usize>() {
        if let Some(session) = position
            .checked_sub(1)
            .and_then(|i| store.sessions_by_activity().get(i).copied())
        {
            return Ok(session.id.clone());
        }
    }
    match store.get(target) {
        Some(session) => Ok(session.id.clone()),
        None => Err(SessionError::NotFound(target.to_string()).into()),
    }
}
