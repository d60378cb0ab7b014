//! Batched execution of mart queries.
//!
//! Every runner opens one connection per `execute` call, splits oversized id lists into
//! sub-queries and pages through results in adaptively sized batches: by `LIMIT`/`OFFSET`
//! on dialects that support it and by key everywhere else.

pub mod attribute;
pub mod batch;
pub mod factory;
pub mod idlist;
pub mod seq_type;
pub mod sequence;

use serde::Serialize;

use crate::db::DataSource;
use crate::dna::ChunkTableSpec;
use crate::error::MartError;
use crate::query::Query;
use crate::sql::QueryCompiler;

pub use attribute::AttributeQueryRunner;
pub use batch::BatchSettings;
pub use factory::QueryRunnerFactory;
pub use seq_type::SeqType;
pub use sequence::SequenceQueryRunner;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Rows for attribute queries, entities for sequence queries.
    pub units: usize,
    pub batches: usize,
    pub partitions: usize,
}

pub trait QueryRunner {
    fn name(&self) -> &'static str;

    /// Runs the query to completion. `limit` of zero falls back to the query's own limit,
    /// then to the configured maximum; sub-queries are never capped.
    fn execute(&mut self, limit: usize, is_sub_query: bool) -> Result<RunStats, MartError>;
}

#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub source: &'a dyn DataSource,
    pub compiler: &'a dyn QueryCompiler,
    pub settings: &'a BatchSettings,
    /// Chunk table used when the dataset does not name its own.
    pub sequence_store: Option<&'a ChunkTableSpec>,
}

pub(crate) fn effective_limit(
    limit: usize,
    query: &Query,
    settings: &BatchSettings,
    is_sub_query: bool,
) -> Option<usize> {
    if is_sub_query {
        return None;
    }
    [limit, query.limit()]
        .into_iter()
        .filter(|value| *value > 0)
        .min()
        .or(Some(settings.max_total_rows))
}
