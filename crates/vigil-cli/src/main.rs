mod cli;

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use vigil_core::{MessageRecord, NetworkTaskRecord, StoreEvent, TaskState};
use vigil_logging::{LogConfig, VigilSubscriberBuilder};
use vigil_storage::{EventStore, ExportOptions, MessageFilter, StoreConfig, StoreOptions};
use vigil_transport::{ServerEvent, ViewerServer, ViewerServerConfig};

use crate::cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    VigilSubscriberBuilder::new()
        .with_config(LogConfig::cli(cli.log_level.clone()))
        .init()?;

    let config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StoreConfig::default(),
    };

    match cli.command {
        Command::Info { path } => {
            let store = open_readonly(&path, config).await?;
            println!("{}", serde_json::to_string_pretty(&store.info()?)?);
        }

        Command::Messages {
            path,
            level,
            label,
            session,
            since,
            limit,
            no_tasks,
            json,
        } => {
            let store = open_readonly(&path, config).await?;
            let filter = MessageFilter {
                min_level: level,
                label,
                session,
                since,
                until: None,
                include_tasks: !no_tasks,
                limit,
            };
            for message in store.messages(&filter)? {
                if json {
                    println!("{}", serde_json::to_string(&message)?);
                } else {
                    println!("{}", format_message(&message));
                }
            }
        }

        Command::Tasks {
            path,
            failed,
            limit,
            json,
        } => {
            let store = open_readonly(&path, config).await?;
            let mut tasks: Vec<NetworkTaskRecord> = store
                .all_network_tasks()?
                .into_iter()
                .filter(|task| !failed || task.state == TaskState::Failure)
                .collect();
            if let Some(limit) = limit {
                let skip = tasks.len().saturating_sub(limit);
                tasks.drain(..skip);
            }
            for task in &tasks {
                if json {
                    println!("{}", serde_json::to_string(task)?);
                } else {
                    println!("{}", format_task(task));
                }
            }
        }

        Command::Export {
            path,
            dest,
            sessions,
            since,
        } => {
            let store = open_existing(&path, config).await?;
            let mut options = ExportOptions::default();
            if !sessions.is_empty() {
                options = options.with_sessions(sessions);
            }
            if let Some(since) = since {
                options = options.with_since(since);
            }
            let exported = store.copy_with(&dest, options).await?;
            store.close().await?;
            println!(
                "Exported {} messages and {} tasks to {}",
                exported.message_count,
                exported.task_count,
                dest.display()
            );
        }

        Command::Sweep { path } => {
            let store = open_existing(&path, config).await?;
            let report = store.sweep().await?;
            store.close().await?;
            if report.is_empty() {
                println!("Nothing to remove");
            } else {
                println!(
                    "Removed {} messages, {} tasks, {} blobs, {} orphaned files ({} bytes) and {} sessions",
                    report.messages,
                    report.tasks,
                    report.blobs,
                    report.orphaned_files,
                    report.bytes_freed,
                    report.sessions
                );
            }
        }

        Command::Listen {
            bind,
            name,
            passcode,
            store,
        } => {
            let store = match store {
                Some(path) => Some(
                    EventStore::open(&path, StoreOptions::default(), config)
                        .await
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                ),
                None => None,
            };
            let mut server_config = ViewerServerConfig::new(name);
            server_config.passcode = passcode;
            let server = ViewerServer::bind(bind, server_config).await?;
            println!("Listening on {}", server.local_addr());

            listen(&server, store.as_ref()).await;
            server.shutdown();
            if let Some(store) = store {
                store.close().await?;
            }
        }
    }

    Ok(())
}

async fn open_readonly(path: &Path, config: StoreConfig) -> anyhow::Result<EventStore> {
    EventStore::open(path, StoreOptions::readonly(), config)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))
}

async fn open_existing(path: &Path, config: StoreConfig) -> anyhow::Result<EventStore> {
    let options = StoreOptions::default().with_create(false).with_sweep(false);
    EventStore::open(path, options, config)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))
}

/// Print events until interrupted
async fn listen(server: &ViewerServer, store: Option<&EventStore>) {
    let mut events = server.subscribe();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(ServerEvent::ClientConnected { client, hello }) => {
                    println!(
                        "#{client} connected: {} ({} {})",
                        hello.device_info.name,
                        hello.app_info.name.as_deref().unwrap_or("unknown app"),
                        hello.app_info.version.as_deref().unwrap_or(""),
                    );
                }
                Ok(ServerEvent::ClientRejected { client }) => {
                    println!("#{client} rejected: wrong passcode");
                }
                Ok(ServerEvent::ClientDisconnected { client }) => {
                    println!("#{client} disconnected");
                }
                Ok(ServerEvent::Event { client, event }) => {
                    println!("#{client} {}", format_event(&event));
                    if let Some(store) = store {
                        store.record(event);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Printing fell behind, events skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

fn format_message(message: &MessageRecord) -> String {
    format!(
        "{} {:<8} [{}] {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        message.level,
        message.label,
        message.text
    )
}

fn format_task(task: &NetworkTaskRecord) -> String {
    let status = match (task.state, task.status_code) {
        (TaskState::Pending, _) => "...".to_string(),
        (_, Some(code)) => code.to_string(),
        (_, None) => "ERR".to_string(),
    };
    format!(
        "{} {:<4} {:<6} {} ({:.0} ms)",
        task.created_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        status,
        task.http_method.as_deref().unwrap_or("GET"),
        task.url.as_deref().unwrap_or("<no url>"),
        task.duration * 1000.0
    )
}

fn format_event(event: &StoreEvent) -> String {
    match event {
        StoreEvent::MessageStored(e) => format!("{:<8} [{}] {}", e.level, e.label, e.message),
        StoreEvent::NetworkTaskCreated(e) => format!(
            "-> {} {}",
            e.original_request.http_method.as_deref().unwrap_or("GET"),
            e.original_request.url.as_deref().unwrap_or("<no url>")
        ),
        StoreEvent::NetworkTaskProgressUpdated(e) => {
            format!("   {} {}/{}", e.task_id, e.completed_unit_count, e.total_unit_count)
        }
        StoreEvent::NetworkTaskCompleted(e) => {
            let status = e
                .response
                .as_ref()
                .and_then(|r| r.status_code)
                .map(|code| code.to_string())
                .unwrap_or_else(|| "ERR".to_string());
            format!(
                "<- {} {}",
                status,
                e.original_request.url.as_deref().unwrap_or("<no url>")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use vigil_core::{
        Level, MessageCreated, NetworkRequest, NetworkResponse, NetworkTaskCompleted,
    };

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_messages_filters() {
        let cli = Cli::try_parse_from([
            "vigil", "messages", "logs", "--level", "warning", "--limit", "5", "--no-tasks",
        ])
        .unwrap();
        match cli.command {
            Command::Messages {
                level,
                limit,
                no_tasks,
                ..
            } => {
                assert_eq!(level, Some(Level::Warning));
                assert_eq!(limit, Some(5));
                assert!(no_tasks);
            }
            _ => panic!("expected messages"),
        }
        assert!(Cli::try_parse_from(["vigil", "messages", "logs", "--level", "loud"]).is_err());
    }

    #[test]
    fn test_format_event() {
        let message: StoreEvent = MessageCreated::new(Level::Error, "sync", "upload failed").into();
        assert_eq!(format_event(&message), "error    [sync] upload failed");

        let task: StoreEvent =
            NetworkTaskCompleted::new(uuid::Uuid::new_v4(), NetworkRequest::new("https://e.com/a"))
                .with_response(NetworkResponse::new(404))
                .into();
        assert_eq!(format_event(&task), "<- 404 https://e.com/a");
    }
}
