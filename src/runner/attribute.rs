use std::io::Write;

use super::batch::{ExecutionPlan, Pager, RowBudget, RowConsumer};
use super::idlist::resolve_id_lists;
use super::{QueryRunner, RunContext, RunStats, effective_limit};
use crate::db::{SqlError, Value};
use crate::error::MartError;
use crate::format::FormatSpec;
use crate::query::Query;

/// Writes one line per result row: column values joined by the format's separator.
pub struct AttributeQueryRunner<'a> {
    context: RunContext<'a>,
    query: Query,
    format: FormatSpec,
    out: &'a mut dyn Write,
}

impl<'a> AttributeQueryRunner<'a> {
    pub fn new(
        context: RunContext<'a>,
        query: Query,
        format: FormatSpec,
        out: &'a mut dyn Write,
    ) -> Self {
        Self {
            context,
            query,
            format,
            out,
        }
    }
}

impl QueryRunner for AttributeQueryRunner<'_> {
    fn name(&self) -> &'static str {
        "attribute"
    }

    fn execute(&mut self, limit: usize, is_sub_query: bool) -> Result<RunStats, MartError> {
        let mut sink = TextRows {
            out: &mut *self.out,
            separator: self.format.separator,
        };
        let stats = run(self.context, &self.query, limit, is_sub_query, &mut sink)?;
        self.out.flush().map_err(write_failed)?;
        Ok(stats)
    }
}

/// Runs `query` as a sub-query and returns the first column of every row.
pub fn collect_ids(context: RunContext<'_>, query: &Query) -> Result<Vec<String>, MartError> {
    let mut sink = IdRows::default();
    run(context, query, 0, true, &mut sink)?;
    Ok(sink.ids)
}

trait RowSink {
    fn write_row(&mut self, values: &[Value]) -> Result<(), MartError>;
}

struct TextRows<'w> {
    out: &'w mut dyn Write,
    separator: char,
}

impl RowSink for TextRows<'_> {
    fn write_row(&mut self, values: &[Value]) -> Result<(), MartError> {
        let separator = self.separator.to_string();
        let line = values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(&separator);
        writeln!(self.out, "{line}").map_err(write_failed)
    }
}

#[derive(Default)]
struct IdRows {
    ids: Vec<String>,
}

impl RowSink for IdRows {
    fn write_row(&mut self, values: &[Value]) -> Result<(), MartError> {
        if let Some(id) = values.first().and_then(Value::as_text) {
            self.ids.push(id);
        }
        Ok(())
    }
}

/// Hands rows to a sink, dropping the leading key column on the keyset path.
struct Emitter<'s> {
    sink: &'s mut dyn RowSink,
    skip: usize,
}

impl RowConsumer for Emitter<'_> {
    fn accept(&mut self, row: Vec<Value>) -> Result<usize, MartError> {
        self.sink.write_row(row.get(self.skip..).unwrap_or_default())?;
        Ok(1)
    }

    fn finish(&mut self) -> Result<usize, MartError> {
        Ok(0)
    }
}

fn run(
    context: RunContext<'_>,
    query: &Query,
    limit: usize,
    is_sub_query: bool,
    sink: &mut dyn RowSink,
) -> Result<RunStats, MartError> {
    let query = resolve_id_lists(query, context)?;
    let plan = ExecutionPlan::new(&query, context.settings)?;
    let mut budget = RowBudget::new(effective_limit(
        limit,
        &query,
        context.settings,
        is_sub_query,
    ));

    let mut connection = context.source.connect().map_err(|err| {
        tracing::warn!(source = context.source.name(), error = %err, "connection failed");
        invalid_query(err)
    })?;
    let mut pager = Pager::new(
        connection.as_mut(),
        context.source.dialect(),
        context.settings,
        context.settings.max_key_rows,
        invalid_query,
    );

    for index in 0..plan.len() {
        if budget.is_exhausted() {
            break;
        }
        let partition = plan.query(index);
        run_partition(context, &mut pager, &partition, sink, &mut budget)?;
    }

    let stats = RunStats {
        units: budget.written(),
        batches: pager.batches(),
        partitions: plan.len(),
    };
    tracing::info!(
        dataset = %query.dataset().name,
        rows = stats.units,
        batches = stats.batches,
        partitions = stats.partitions,
        sub_query = is_sub_query,
        "attribute query finished"
    );
    Ok(stats)
}

fn run_partition(
    context: RunContext<'_>,
    pager: &mut Pager<'_>,
    query: &Query,
    sink: &mut dyn RowSink,
    budget: &mut RowBudget,
) -> Result<(), MartError> {
    if pager.dialect().pages_by_offset() {
        let select = context.compiler.to_sql(query)?;
        let mut emitter = Emitter { sink, skip: 0 };
        return pager.by_offset(&select, &mut emitter, budget, true);
    }

    let mut select = context.compiler.to_sql_with_key(query)?;
    let key = context.compiler.qualified_lowest_level_key(query);
    tracing::debug!(
        dialect = %pager.dialect(),
        key = %key,
        "keyset paging; rows with a null key are skipped"
    );
    let mut emitter = Emitter { sink, skip: 1 };
    if select.has_order() {
        // An explicit sort cannot be resumed by key.
        return pager.single(&select, &mut emitter, budget);
    }
    select.order_by(key.as_str());
    pager.by_key(&select, &key, &mut emitter, budget)
}

fn invalid_query(err: SqlError) -> MartError {
    MartError::InvalidQuery(err.to_string())
}

fn write_failed(err: std::io::Error) -> MartError {
    MartError::InvalidQuery(format!("write output: {err}"))
}
