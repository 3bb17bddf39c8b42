use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use alcache::cli;
use alcache::config::Config;
use alcache::indexer::legacy::IdRange;
use alcache::logging::{self, LogFormat};
use alcache::refresh::worker;

#[derive(Parser)]
#[command(name = "alcache")]
#[command(author = "AL Tools Team")]
#[command(version)]
#[command(about = "Symbol cache for AL / C/AL application packages", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract and index every package in the configured package folders
    Refresh {
        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Do not draw a progress bar
        #[arg(short, long)]
        quiet: bool,
    },

    /// Update the table-field / page-source index from extracted sources
    Fields {
        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Only rescan this app's extracted sources
        #[arg(short, long)]
        app: Option<String>,
    },

    /// Query the cache
    Query {
        /// Query type: object, id, procedures, fields, source-table, table-type, search
        query_type: String,

        /// Object, table, page or variable name
        target: String,

        /// Object type, for procedure and search queries
        #[arg(short, long)]
        kind: Option<String>,

        /// Source file to read declarations from, for table-type queries
        #[arg(short, long)]
        source: Option<String>,

        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Output format: json, text
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show cache statistics
    Stats {
        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Break counts down by object type and package
        #[arg(long)]
        detailed: bool,
    },

    /// Empty the symbol cache
    Clear {
        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Also empty the field index
        #[arg(long)]
        fields: bool,
    },

    /// Filter a C/AL object export by id ranges and print it back
    Legacy {
        /// Object export (.txt)
        file: PathBuf,

        /// Id ranges to keep, e.g. 50000..99999 (repeatable)
        #[arg(short, long = "range")]
        ranges: Vec<IdRange>,

        /// Output format: text, json
        #[arg(short, long, default_value = "text")]
        format: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Watch sources and packages, keeping the caches current
    Watch {
        /// Project directory
        #[arg(short, long, default_value = ".")]
        project: String,

        /// Refresh once before watching
        #[arg(long)]
        refresh: bool,
    },

    /// Worker process entry point (JSON lines on stdin/stdout)
    #[command(hide = true)]
    Worker,
}

fn project_of(command: &Commands) -> Option<&str> {
    match command {
        Commands::Refresh { project, .. }
        | Commands::Fields { project, .. }
        | Commands::Query { project, .. }
        | Commands::Stats { project, .. }
        | Commands::Clear { project, .. }
        | Commands::Watch { project, .. } => Some(project),
        Commands::Legacy { .. } | Commands::Worker => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config logging settings apply when no flag overrides them.
    let logging_config = project_of(&cli.command)
        .map(|p| Config::from_project_dir(p).logging)
        .unwrap_or_default();
    let level = logging::level_from_flags(cli.debug, cli.verbose, &logging_config.level);
    logging::init_logging(&level, LogFormat::parse(&logging_config.format));

    match cli.command {
        Commands::Refresh { project, quiet } => {
            cli::refresh::refresh_project(project, quiet).await?;
        }

        Commands::Fields { project, app } => {
            cli::fields::update_fields(project, app).await?;
        }

        Commands::Query {
            query_type,
            target,
            kind,
            source,
            project,
            format,
        } => {
            cli::query::query_index(query_type, target, kind, source, project, format).await?;
        }

        Commands::Stats { project, detailed } => {
            cli::stats::show_stats(project, detailed).await?;
        }

        Commands::Clear { project, fields } => {
            cli::clear::clear_cache(project, fields).await?;
        }

        Commands::Legacy {
            file,
            ranges,
            format,
            output,
        } => {
            cli::legacy::filter_object(file, ranges, format, output)?;
        }

        Commands::Watch { project, refresh } => {
            info!("Watching project: {}", project);
            cli::watch::watch_project(project, refresh).await?;
        }

        Commands::Worker => {
            tokio::task::spawn_blocking(worker::run_stdio).await??;
        }
    }

    Ok(())
}
