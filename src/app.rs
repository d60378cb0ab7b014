use std::fs;
use std::io::Write;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;

use crate::config::ResolvedConfig;
use crate::db::{DataSource, SqliteDataSource};
use crate::dna::ChunkTableSpec;
use crate::error::MartError;
use crate::format::{DEFAULT_FASTA_WIDTH, FormatKind, FormatSpec};
use crate::query::{Query, QueryType};
use crate::runner::idlist::resolve_id_lists;
use crate::runner::sequence::final_query;
use crate::runner::{BatchSettings, QueryRunnerFactory, RunContext};
use crate::sql::{QueryCompiler, StarSchemaCompiler};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub format: FormatKind,
    /// Field separator; tab for tabulated output and `|` for FASTA headers when unset.
    pub separator: Option<char>,
    /// Zero means no limit beyond the query's own and the configured maximum.
    pub limit: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            format: FormatKind::Tabulated,
            separator: None,
            limit: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub dataset: String,
    pub query_type: QueryType,
    pub runner: String,
    pub written: usize,
    pub batches: usize,
    pub partitions: usize,
    pub started_at: String,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainResult {
    pub dataset: String,
    pub query_type: QueryType,
    pub dialect: String,
    pub sql: String,
    pub parameters: usize,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<S: DataSource> {
    source: S,
    settings: BatchSettings,
    sequence_store: Option<ChunkTableSpec>,
    fasta_line_width: usize,
    compiler: StarSchemaCompiler,
}

impl App<SqliteDataSource> {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        App::new(config.datasource.open(), config.batching.clone())
            .with_sequence_store(config.sequence_store.clone())
            .with_fasta_line_width(config.fasta_line_width)
    }
}

impl<S: DataSource> App<S> {
    pub fn new(source: S, settings: BatchSettings) -> Self {
        Self {
            source,
            settings,
            sequence_store: None,
            fasta_line_width: DEFAULT_FASTA_WIDTH,
            compiler: StarSchemaCompiler,
        }
    }

    pub fn with_sequence_store(mut self, spec: Option<ChunkTableSpec>) -> Self {
        self.sequence_store = spec;
        self
    }

    pub fn with_fasta_line_width(mut self, width: usize) -> Self {
        self.fasta_line_width = width;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn run(
        &self,
        query: Query,
        options: &RunOptions,
        out: &mut dyn Write,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, MartError> {
        let started_at = iso_timestamp();
        let start = Instant::now();
        let dataset = query.dataset().name.clone();
        let query_type = query.query_type();
        let format = self.format_spec(options);

        sink.event(ProgressEvent {
            message: format!(
                "phase=Plan; dataset={dataset}; source={}; dialect={}",
                self.source.name(),
                self.source.dialect()
            ),
            elapsed: None,
        });

        let mut runner = QueryRunnerFactory::create(self.context(), query, format, out)?;
        let runner_name = runner.name().to_string();
        sink.event(ProgressEvent {
            message: format!("phase=Execute; runner={runner_name}"),
            elapsed: Some(start.elapsed()),
        });

        let stats = runner.execute(options.limit, false)?;
        let elapsed = start.elapsed();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Done; written={}; batches={}",
                stats.units, stats.batches
            ),
            elapsed: Some(elapsed),
        });

        Ok(RunSummary {
            dataset,
            query_type,
            runner: runner_name,
            written: stats.units,
            batches: stats.batches,
            partitions: stats.partitions,
            started_at,
            elapsed_ms: elapsed.as_millis(),
        })
    }

    /// Renders the base statement a query would page through. Id lists that come from
    /// sub-queries or URLs are resolved first, so this may query the database.
    pub fn explain(&self, query: &Query, sink: &dyn ProgressSink) -> Result<ExplainResult, MartError> {
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; dataset={}", query.dataset().name),
            elapsed: None,
        });
        let target = match query.query_type() {
            QueryType::Attribute => query.clone(),
            QueryType::Sequence => final_query(query, QueryRunnerFactory::seq_type(query)?)?,
        };
        let target = resolve_id_lists(&target, self.context())?;
        let dialect = self.source.dialect();
        let select = if dialect.pages_by_offset() {
            self.compiler.to_sql(&target)?
        } else {
            self.compiler.to_sql_with_key(&target)?
        };
        let (sql, params) = select.render(dialect);
        Ok(ExplainResult {
            dataset: query.dataset().name.clone(),
            query_type: query.query_type(),
            dialect: dialect.to_string(),
            sql,
            parameters: params.len(),
        })
    }

    fn context(&self) -> RunContext<'_> {
        RunContext {
            source: &self.source,
            compiler: &self.compiler,
            settings: &self.settings,
            sequence_store: self.sequence_store.as_ref(),
        }
    }

    fn format_spec(&self, options: &RunOptions) -> FormatSpec {
        let format = match options.format {
            FormatKind::Tabulated => FormatSpec::tabulated('\t'),
            FormatKind::Fasta => FormatSpec::fasta().with_line_width(self.fasta_line_width),
        };
        match options.separator {
            Some(separator) => FormatSpec {
                separator,
                ..format
            },
            None => format,
        }
    }
}

pub fn load_query(path: &Utf8Path) -> Result<Query, MartError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| MartError::Filesystem(format!("read query {path}: {err}")))?;
    serde_json::from_str(&content)
        .map_err(|err| MartError::InvalidQuery(format!("parse {path}: {err}")))
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
