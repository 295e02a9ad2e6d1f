//! `traceline` command line interface.
//!
//! Thin veneer over the library crates: every subcommand builds an
//! [`IndexStore`] from the connection flags and drives one library
//! operation, printing results as text or JSON to stdout.

use std::fs::File;
use std::io::{self, Write};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use tracing::Level;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use traceline_analyze::{AnalyzerContext, AnalyzerRegistry};
use traceline_aggregate::{AggregationContext, AggregatorRegistry};
use traceline_core::tracing_config::{level_from_env, TARGET_PREFIX};
use traceline_core::{EventBackend, SearchRequest, TracelineError, TracelineResult};
use traceline_datastore::{IndexStore, StoreConfig, TransportConfig};
use traceline_export::export_csv;

#[derive(Parser)]
#[command(name = "traceline", version, about = "Collaborative timeline analysis toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Backend connection flags shared by every subcommand.
#[derive(Args, Clone)]
struct ConnectionArgs {
    /// Search backend hostname.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Search backend port.
    #[arg(long, default_value_t = 9200)]
    port: u16,

    /// Connect over HTTPS.
    #[arg(long)]
    ssl: bool,

    /// Basic-auth username.
    #[arg(long)]
    user: Option<String>,

    /// Basic-auth password.
    #[arg(long)]
    password: Option<String>,
}

impl ConnectionArgs {
    fn connect(&self) -> TracelineResult<IndexStore> {
        let config = StoreConfig {
            transport: TransportConfig {
                host: self.host.clone(),
                port: self.port,
                ssl: self.ssl,
                user: self.user.clone(),
                password: self.password.clone(),
                ..TransportConfig::default()
            },
            ..StoreConfig::default()
        };
        IndexStore::connect(config)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create a timeline index.
    AddTimeline {
        /// Username recorded as the timeline owner.
        #[arg(long)]
        user: String,

        /// Search backend hostname.
        #[arg(long, default_value = "127.0.0.1")]
        server: String,

        /// Search backend port.
        #[arg(long, default_value_t = 9200)]
        port: u16,

        /// Timeline display name.
        #[arg(long)]
        name: String,

        /// Index name; a random one is generated when omitted.
        #[arg(long)]
        index: Option<String>,
    },

    /// Run analyzers against a timeline, dependencies first.
    RunAnalyzer {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Analyzer names to run.
        #[arg(long = "analyzer", required = true)]
        analyzers: Vec<String>,

        /// Sketch scoping labels and annotations.
        #[arg(long)]
        sketch: i64,

        /// Index holding the timeline.
        #[arg(long)]
        index: String,
    },

    /// Run one aggregator and print its result as JSON.
    RunAggregator {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Aggregator name.
        #[arg(long)]
        aggregator: String,

        /// Sketch scoping the aggregation.
        #[arg(long)]
        sketch: i64,

        /// Indices to aggregate over.
        #[arg(long = "index", required = true)]
        indices: Vec<String>,

        /// Aggregator parameters as a JSON object.
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Export all events matching a query as CSV.
    Export {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// Sketch scoping exported labels.
        #[arg(long)]
        sketch: i64,

        /// Indices to export from.
        #[arg(long = "index", required = true)]
        indices: Vec<String>,

        /// Query string; defaults to everything.
        #[arg(long, default_value = "*")]
        query: String,

        /// Output file; stdout when omitted.
        #[arg(long)]
        output: Option<String>,
    },

    /// List the available analyzers.
    ListAnalyzers,

    /// List the available aggregators.
    ListAggregators,
}

fn parse_params(raw: &str) -> TracelineResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(TracelineError::bad_query("--params must be a JSON object")),
        Err(err) => Err(TracelineError::bad_query(format!(
            "--params is not valid JSON: {err}"
        ))),
    }
}

fn run(cli: Cli) -> TracelineResult<()> {
    match cli.command {
        Command::AddTimeline {
            user,
            server,
            port,
            name,
            index,
        } => {
            let config = StoreConfig {
                transport: TransportConfig {
                    host: server,
                    port,
                    ..TransportConfig::default()
                },
                ..StoreConfig::default()
            };
            let store = IndexStore::connect(config)?;
            let index = index.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
            store.create_index(&index)?;
            println!("created timeline \"{name}\" for {user} in index {index}");
        }

        Command::RunAnalyzer {
            connection,
            analyzers,
            sketch,
            index,
        } => {
            let store = connection.connect()?;
            let ctx = AnalyzerContext::new(&store, sketch, index);
            let mut registry = AnalyzerRegistry::with_defaults();
            for (name, summary) in registry.run_pipeline(&analyzers, &ctx)? {
                println!("{name}: {summary}");
            }
        }

        Command::RunAggregator {
            connection,
            aggregator,
            sketch,
            indices,
            params,
        } => {
            let store = connection.connect()?;
            let params = parse_params(&params)?;
            let mut ctx = AggregationContext::new(&store, sketch, indices);
            ctx.mappings = store.field_mappings(&ctx.indices)?;
            let registry = AggregatorRegistry::with_defaults();
            let result = registry.run(&aggregator, &ctx, &params)?;
            let rendered = serde_json::to_string_pretty(&result)?;
            println!("{rendered}");
        }

        Command::Export {
            connection,
            sketch,
            indices,
            query,
            output,
        } => {
            let store = connection.connect()?;
            let request = SearchRequest::new(sketch, indices).with_query_string(&query);
            let rows = match output {
                Some(path) => export_csv(&store, &request, File::create(path)?)?,
                None => export_csv(&store, &request, io::stdout().lock())?,
            };
            eprintln!("exported {rows} events");
        }

        Command::ListAnalyzers => {
            for info in AnalyzerRegistry::with_defaults().list() {
                println!("{:<24} {}", info.name, info.description);
            }
        }

        Command::ListAggregators => {
            for info in AggregatorRegistry::with_defaults().list() {
                println!("{:<24} {}", info.name, info.description);
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    let level = level_from_env(Level::WARN);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{TARGET_PREFIX}={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let _ = writeln!(io::stderr(), "error: {err}");
            ExitCode::FAILURE
        }
    }
}
