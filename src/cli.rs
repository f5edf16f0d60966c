use clap::{Parser, Subcommand};

/// approvald: multi-tenant approval intake pipeline
#[derive(Parser)]
#[command(name = "approvald", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the intake server (and, unless disabled, in-process workers)
    Serve {
        /// Port to bind; defaults to PIPELINE_PORT
        #[arg(short, long)]
        port: Option<u16>,
        /// Only accept payloads; leave processing to `approvald worker`
        #[arg(long)]
        no_workers: bool,
    },

    /// Run processing workers without the intake server
    Worker {
        /// Worker count; defaults to WORKER_COUNT
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Inspect the tenant catalog
    Tenant {
        #[command(subcommand)]
        command: TenantCommands,
    },

    /// Inspect and replay dead-lettered messages
    DeadLetter {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },
}

#[derive(Subcommand)]
pub enum TenantCommands {
    /// List tenants as loaded from the tenant source
    List,
    /// Upsert every tenant in a YAML catalog into the tenants table
    Import {
        /// YAML file with a top-level `tenants:` list
        file: std::path::PathBuf,
    },
}

#[derive(Subcommand)]
pub enum DeadLetterCommands {
    /// List dead-lettered messages
    List {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Republish a dead-lettered request to the main topic
    Replay {
        /// Dead-letter message id or original message id
        message_id: uuid::Uuid,
        /// How many dead-letter messages to search
        #[arg(long, default_value = "100")]
        scan: usize,
    },
}
