//! precis CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use precis::{
    cache::FileType,
    commands::{
        cmd_delete_job, cmd_evict, cmd_get_file, cmd_get_job, cmd_init, cmd_list_jobs,
        cmd_put_file, cmd_stalled_jobs, cmd_status, print_eviction_stats, print_file_entry,
        print_file_response, print_job, print_jobs, print_status, EvictOptions,
    },
    config::Config,
    meta::{FileDb, JobDb},
    registry::{JobFilter, JobRegistry, SummaryStatus},
};
use std::path::{Path, PathBuf};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "precis")]
#[command(version, about = "Request dispatcher and cache for a text summarization pipeline", long_about = None)]
struct Cli {
    /// Path to config file (or its directory)
    #[arg(short, long, global = true, env = "PRECIS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize precis configuration and databases
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Show database and reference data status
    Status,

    /// Show one job without counting it as a request
    Job {
        /// Summary id
        job_id: String,
    },

    /// List jobs, newest first
    Jobs {
        /// Only jobs in this status
        #[arg(long)]
        status: Option<SummaryStatus>,

        /// Maximum number of jobs
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List jobs stuck in one stage past the configured deadline
    Stalled,

    /// Delete a completed job
    Delete {
        /// Summary id
        job_id: String,
    },

    /// Remove cache entries under the configured eviction policies
    Evict {
        /// Dry run - show what would be removed
        #[arg(long)]
        dry_run: bool,

        /// Override the idle time after which uncached entries go
        #[arg(long)]
        idle_secs: Option<u64>,

        /// Override the maximum number of jobs kept
        #[arg(long)]
        max_jobs: Option<usize>,

        /// Override the maximum number of file ids kept
        #[arg(long)]
        max_files: Option<usize>,
    },

    /// Store and fetch deduplicated files
    File {
        #[command(subcommand)]
        action: FileAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum FileAction {
    /// Store a local file
    Put {
        /// Path to the file
        path: PathBuf,

        /// File id (defaults to the content fingerprint)
        #[arg(long)]
        id: Option<String>,

        /// File type (guessed from the file name by default)
        #[arg(long = "type")]
        file_type: Option<FileType>,

        /// Let the entry be evicted once idle
        #[arg(long)]
        no_cache: bool,
    },

    /// Fetch a stored file
    Get {
        /// File id
        file_id: String,

        /// Write the bytes to this path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    // Handle init command specially (doesn't need existing config)
    if let Commands::Init { force } = cli.command {
        let base_dir = cli.config.as_deref().map(config_dir);
        let config = cmd_init(base_dir, force).await?;

        println!("✓ precis initialized at {}", config.paths.base_dir.display());
        println!("  Config: {}", config.paths.config_file.display());
        println!("  Jobs database: {}", config.paths.jobs_db.display());
        println!("  Files database: {}", config.paths.files_db.display());
        println!("\nEdit the config file to set eviction thresholds and the stage deadline.");
        return Ok(());
    }

    // Handle completions command (doesn't need config/db)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "precis", &mut std::io::stdout());
        return Ok(());
    }

    // Load configuration
    let config = load_config(cli.config.as_deref())?;

    let jobs = JobDb::open(&config).await?;
    let files = FileDb::open(&config).await?;
    let job_registry = JobRegistry::new(jobs.clone());

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Status => {
            let status = cmd_status(&config, &jobs, &files).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }

        Commands::Job { job_id } => {
            let job = cmd_get_job(&job_registry, &job_id).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&job)?);
            } else {
                print_job(&job);
            }
        }

        Commands::Jobs { status, limit } => {
            let filter = JobFilter { status, limit };
            let listed = cmd_list_jobs(&job_registry, &filter).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&listed)?);
            } else {
                print_jobs(&listed, "No jobs.");
            }
        }

        Commands::Stalled => {
            let stalled = cmd_stalled_jobs(&config, &job_registry).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stalled)?);
            } else {
                print_jobs(&stalled, "No stalled jobs.");
            }
        }

        Commands::Delete { job_id } => {
            cmd_delete_job(&job_registry, &job_id).await?;

            if cli.json {
                println!(r#"{{"status": "ok", "deleted": "{}"}}"#, job_id);
            } else {
                println!("✓ Job '{}' deleted", job_id);
            }
        }

        Commands::Evict {
            dry_run,
            idle_secs,
            max_jobs,
            max_files,
        } => {
            let options = EvictOptions {
                dry_run,
                uncached_idle_secs: idle_secs,
                max_jobs,
                max_files,
            };
            let stats = cmd_evict(&config, &jobs, &files, options).await?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_eviction_stats(&stats, dry_run);
            }
        }

        Commands::File { action } => match action {
            FileAction::Put {
                path,
                id,
                file_type,
                no_cache,
            } => {
                let response =
                    cmd_put_file(&config, &jobs, &files, &path, id, file_type, !no_cache).await?;

                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&response)?);
                } else {
                    print_file_response(&response);
                }
            }
            FileAction::Get { file_id, output } => {
                let (entry, size) =
                    cmd_get_file(&config, &jobs, &files, &file_id, output.as_deref()).await?;

                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&entry)?);
                } else {
                    print_file_entry(&entry, size);
                }
            }
        },
    }

    Ok(())
}

/// The base directory named by `--config`: the file's parent if it points at
/// a .toml file, otherwise the path itself
fn config_dir(path: &Path) -> PathBuf {
    if path.extension().map_or(false, |e| e == "toml") {
        path.parent()
            .map(PathBuf::from)
            .unwrap_or_else(Config::default_base_dir)
    } else {
        path.to_path_buf()
    }
}

fn load_config(path: Option<&Path>) -> precis::Result<Config> {
    let config_path = match path {
        Some(p) => config_dir(p).join("config.toml"),
        None => Config::default_config_path(),
    };

    if !config_path.exists() {
        eprintln!("Config file not found: {}", config_path.display());
        return Err(precis::Error::NotInitialized);
    }

    Config::load(&config_path)
}
