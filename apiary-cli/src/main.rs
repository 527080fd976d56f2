//! apiary - command-line front-end for the orchestrator.
//!
//! Operates directly on the data root named by `DATA_ROOT`; exit codes are
//! stable per error kind (0 on success).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use apiary_core::{Bee, HiveResult, NodeId};
use apiary_hive::{backend_from_env, Hive, HiveConfig};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "apiary", about = "Orchestrate containerized bee agents", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Swarm configuration operations.
    #[command(subcommand)]
    Swarm(SwarmCommand),
    /// Agent lifecycle and introspection.
    #[command(subcommand)]
    Node(NodeCommand),
    /// Topology mutations.
    #[command(subcommand)]
    Conn(ConnCommand),
    /// Send mail as the human and inspect queue depths.
    #[command(subcommand)]
    Mail(MailCommand),
    /// Human inbox/outbox history.
    #[command(subcommand)]
    Human(HumanCommand),
    /// Tail the live event stream as JSON lines.
    Events,
}

#[derive(Subcommand)]
enum SwarmCommand {
    /// Print the current registry snapshot.
    Get,
    /// Validate and persist a full configuration from a JSON file.
    Put {
        /// Path to the swarm config JSON.
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum NodeCommand {
    /// List agents with fresh runtime state.
    List,
    /// Register a new agent.
    Add {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// File whose contents become the agent's soul.
        #[arg(long)]
        soul_file: Option<PathBuf>,
    },
    /// Stop, deregister, and purge an agent.
    Remove { id: String },
    Start { id: String },
    Stop { id: String },
    /// Fresh container inspect.
    Status { id: String },
    /// The agent's computed neighborhood.
    Hierarchy { id: String },
    /// Tail of the agent's transcript log.
    Transcript {
        id: String,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Enumerate pending inbox mail.
    Inbox { id: String },
    /// Enumerate pending outbox mail.
    Outbox { id: String },
}

#[derive(Subcommand)]
enum ConnCommand {
    Add {
        from: String,
        to: String,
        #[arg(long)]
        bidirectional: bool,
    },
    Remove {
        from: String,
        to: String,
        #[arg(long)]
        bidirectional: bool,
    },
    SetBidir {
        from: String,
        to: String,
        enabled: bool,
    },
    /// Print the display-merged connection list.
    List,
}

#[derive(Subcommand)]
enum MailCommand {
    Send {
        #[arg(long)]
        to: String,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        body: String,
    },
    Counts,
}

#[derive(Subcommand)]
enum HumanCommand {
    Inbox,
    Outbox,
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("serialization error: {err}"),
    }
}

async fn run(command: Command) -> HiveResult<()> {
    let config = HiveConfig::from_env();
    let backend = backend_from_env(config.container_deadline)?;
    let hive: Arc<Hive> = Hive::bootstrap(config, backend).await?;

    let result = dispatch(&hive, command).await;
    hive.shutdown();
    result
}

async fn dispatch(hive: &Arc<Hive>, command: Command) -> HiveResult<()> {
    match command {
        Command::Swarm(SwarmCommand::Get) => {
            print_json(&hive.swarm_get().await);
        }
        Command::Swarm(SwarmCommand::Put { file }) => {
            let bytes = tokio::fs::read(&file).await?;
            let config = serde_json::from_slice(&bytes).map_err(|e| {
                apiary_core::HiveError::Validation(format!("config file unreadable: {e}"))
            })?;
            hive.swarm_put(config).await?;
            println!("swarm updated");
        }
        Command::Node(NodeCommand::List) => {
            print_json(&hive.list_agents().await?);
        }
        Command::Node(NodeCommand::Add {
            id,
            name,
            model,
            soul_file,
        }) => {
            let soul = match soul_file {
                Some(path) => Some(tokio::fs::read_to_string(path).await?),
                None => None,
            };
            let bee = Bee {
                name: name.unwrap_or_else(|| id.clone()),
                id: NodeId::from(id),
                model,
                soul,
            };
            hive.add_bee(bee).await?;
            println!("agent added");
        }
        Command::Node(NodeCommand::Remove { id }) => {
            hive.remove_node(&NodeId::from(id)).await?;
            println!("agent removed");
        }
        Command::Node(NodeCommand::Start { id }) => {
            print_json(&hive.start_agent(&NodeId::from(id)).await?);
        }
        Command::Node(NodeCommand::Stop { id }) => {
            print_json(&hive.stop_agent(&NodeId::from(id)).await?);
        }
        Command::Node(NodeCommand::Status { id }) => {
            print_json(&hive.agent_status(&NodeId::from(id)).await?);
        }
        Command::Node(NodeCommand::Hierarchy { id }) => {
            print_json(&hive.hierarchy(&NodeId::from(id)).await?);
        }
        Command::Node(NodeCommand::Transcript { id, limit }) => {
            for line in hive.transcript(&NodeId::from(id), limit).await? {
                println!("{line}");
            }
        }
        Command::Node(NodeCommand::Inbox { id }) => {
            print_json(&hive.node_inbox(&NodeId::from(id)).await?);
        }
        Command::Node(NodeCommand::Outbox { id }) => {
            print_json(&hive.node_outbox(&NodeId::from(id)).await?);
        }
        Command::Conn(ConnCommand::Add {
            from,
            to,
            bidirectional,
        }) => {
            hive.connect(NodeId::from(from), NodeId::from(to), bidirectional)
                .await?;
            println!("connection added");
        }
        Command::Conn(ConnCommand::Remove {
            from,
            to,
            bidirectional,
        }) => {
            hive.disconnect(NodeId::from(from), NodeId::from(to), bidirectional)
                .await?;
            println!("connection removed");
        }
        Command::Conn(ConnCommand::SetBidir { from, to, enabled }) => {
            hive.set_bidirectional(NodeId::from(from), NodeId::from(to), enabled)
                .await?;
            println!("connection updated");
        }
        Command::Conn(ConnCommand::List) => {
            print_json(&hive.merged_connections().await);
        }
        Command::Mail(MailCommand::Send { to, subject, body }) => {
            let mail = hive
                .send_human_mail(NodeId::from(to), subject, body, None)
                .await?;
            print_json(&mail);
        }
        Command::Mail(MailCommand::Counts) => {
            print_json(&hive.counts().await?);
        }
        Command::Human(HumanCommand::Inbox) => {
            print_json(&hive.human_inbox().await?);
        }
        Command::Human(HumanCommand::Outbox) => {
            print_json(&hive.human_outbox().await?);
        }
        Command::Events => {
            let mut events = hive.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => {
                        match event {
                            Some(event) => match serde_json::to_string(&event) {
                                Ok(line) => println!("{line}"),
                                Err(err) => eprintln!("serialization error: {err}"),
                            },
                            None => break,
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "apiary=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}
