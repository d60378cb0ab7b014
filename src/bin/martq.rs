use std::io::{self, Write};
use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use mart_query::app::{App, RunOptions, load_query};
use mart_query::config::ConfigLoader;
use mart_query::db::Dialect;
use mart_query::error::MartError;
use mart_query::format::FormatKind;
use mart_query::fs_util::AtomicOutput;
use mart_query::output::{JsonOutput, TracingProgress};

#[derive(Parser)]
#[command(name = "martq")]
#[command(about = "Batched attribute and sequence queries against a biological data mart")]
#[command(version, author)]
struct Cli {
    /// Config file; defaults to mart.json in the working directory.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run a query and write its results")]
    Run(RunArgs),
    #[command(about = "Print the SQL a query pages through")]
    Explain(ExplainArgs),
}

#[derive(Args)]
struct RunArgs {
    query: Utf8PathBuf,

    #[arg(long, value_enum, default_value_t = FormatKind::Tabulated)]
    format: FormatKind,

    #[arg(long)]
    separator: Option<char>,

    #[arg(long, default_value_t = 0)]
    limit: usize,

    #[arg(long)]
    output: Option<Utf8PathBuf>,

    #[arg(long, value_enum)]
    dialect: Option<Dialect>,

    #[arg(long)]
    summary: bool,
}

#[derive(Args)]
struct ExplainArgs {
    query: Utf8PathBuf,

    #[arg(long, value_enum)]
    dialect: Option<Dialect>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<MartError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MartError) -> u8 {
    match error {
        MartError::InvalidQuery(_)
        | MartError::Format(_)
        | MartError::MissingConfig
        | MartError::ConfigRead(_)
        | MartError::ConfigParse(_)
        | MartError::InvalidChunkSpec(_) => 2,
        MartError::IdListHttp(_) | MartError::IdListStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => {
            if let Some(dialect) = args.dialect {
                config.datasource.dialect = dialect;
            }
            let app = App::from_config(&config);
            let query = load_query(&args.query)?;
            let options = RunOptions {
                format: args.format,
                separator: args.separator,
                limit: args.limit,
            };

            let summary = match &args.output {
                Some(path) => {
                    let mut output = AtomicOutput::create(path)?;
                    let summary = app.run(query, &options, &mut output, &TracingProgress)?;
                    let written = output.commit()?;
                    tracing::info!(path = %written, "output written");
                    summary
                }
                None => {
                    let stdout = io::stdout();
                    let mut lock = stdout.lock();
                    let summary = app.run(query, &options, &mut lock, &TracingProgress)?;
                    lock.flush().into_diagnostic()?;
                    summary
                }
            };

            if args.summary {
                JsonOutput::print_summary(&summary).into_diagnostic()?;
            }
            Ok(())
        }
        Commands::Explain(args) => {
            if let Some(dialect) = args.dialect {
                config.datasource.dialect = dialect;
            }
            let app = App::from_config(&config);
            let query = load_query(&args.query)?;
            let result = app.explain(&query, &TracingProgress)?;
            JsonOutput::print_explain(&result).into_diagnostic()?;
            Ok(())
        }
    }
}
