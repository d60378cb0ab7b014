use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::db::{Dialect, MartConnection, SqlError, Value};
use crate::error::MartError;
use crate::query::{Filter, IdListFilter, Query};
use crate::sql::{Condition, SelectBuilder};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub initial_batch: usize,
    pub max_batch: usize,
    pub growth_factors: Vec<usize>,
    /// Id lists longer than this are split into sub-queries of this size.
    pub id_list_batch: usize,
    pub max_big_id_lists: usize,
    /// Rows one key may occupy in a single batch of an attribute query.
    pub max_key_rows: usize,
    pub max_sequence_key_rows: usize,
    /// Row cap applied when the caller passes no limit.
    pub max_total_rows: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            initial_batch: 5000,
            max_batch: 50000,
            growth_factors: vec![2, 2],
            id_list_batch: 1000,
            max_big_id_lists: 1,
            max_key_rows: 50000,
            max_sequence_key_rows: 750000,
            max_total_rows: 10_000_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchSizer {
    current: usize,
    max: usize,
    factors: Vec<usize>,
    step: usize,
}

impl BatchSizer {
    pub fn new(settings: &BatchSettings) -> Self {
        let max = settings.max_batch.max(1);
        Self {
            current: settings.initial_batch.clamp(1, max),
            max,
            factors: settings.growth_factors.clone(),
            step: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn grow(&mut self) {
        if self.factors.is_empty() {
            return;
        }
        let factor = self.factors[self.step % self.factors.len()];
        self.step += 1;
        self.current = self
            .current
            .saturating_mul(factor)
            .min(self.max)
            .max(self.current);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RowBudget {
    limit: Option<usize>,
    written: usize,
}

impl RowBudget {
    pub fn new(limit: Option<usize>) -> Self {
        Self { limit, written: 0 }
    }

    pub fn remaining(&self) -> Option<usize> {
        self.limit.map(|limit| limit.saturating_sub(self.written))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    pub fn record(&mut self, units: usize) {
        self.written += units;
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

pub trait RowConsumer {
    fn accept(&mut self, row: Vec<Value>) -> Result<usize, MartError>;

    /// Called once after the last row; flushes anything still buffered.
    fn finish(&mut self) -> Result<usize, MartError>;
}

pub struct Pager<'c> {
    connection: &'c mut dyn MartConnection,
    dialect: Dialect,
    sizer: BatchSizer,
    max_key_rows: usize,
    map_sql: fn(SqlError) -> MartError,
    batches: usize,
}

impl<'c> Pager<'c> {
    pub fn new(
        connection: &'c mut dyn MartConnection,
        dialect: Dialect,
        settings: &BatchSettings,
        max_key_rows: usize,
        map_sql: fn(SqlError) -> MartError,
    ) -> Self {
        Self {
            connection,
            dialect,
            sizer: BatchSizer::new(settings),
            max_key_rows: max_key_rows.max(1),
            map_sql,
            batches: 0,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// `LIMIT`/`OFFSET` paging. When `rows_are_units`, pages never ask for more rows than
    /// the budget still allows.
    pub fn by_offset(
        &mut self,
        base: &SelectBuilder,
        consumer: &mut dyn RowConsumer,
        budget: &mut RowBudget,
        rows_are_units: bool,
    ) -> Result<(), MartError> {
        let mut offset = 0usize;
        loop {
            let batch = self.sizer.current();
            let want = match budget.remaining() {
                Some(remaining) if rows_are_units => batch.min(remaining),
                _ => batch,
            };
            if want == 0 {
                return Ok(());
            }

            let mut select = base.clone();
            select.page(want, offset);
            let rows = self.fetch(&select, None)?;
            let fetched = rows.len();
            tracing::debug!(
                dialect = %self.dialect,
                offset,
                batch = want,
                fetched,
                "offset batch"
            );

            if feed(consumer, budget, rows)? {
                return Ok(());
            }
            if fetched < want {
                break;
            }
            offset += fetched;
            self.sizer.grow();
        }
        budget.record(consumer.finish()?);
        Ok(())
    }

    /// Keyset paging on an integer key that is the first column of every row. `base` must
    /// already order by `key_expr`.
    ///
    /// A full batch may end in the middle of a key, so the rows of its last key are held
    /// back and fetched again at the head of the next batch (`key >= tail`). A batch made
    /// entirely of one key is retried wider; a key with more rows than the per-key
    /// ceiling is an error.
    pub fn by_key(
        &mut self,
        base: &SelectBuilder,
        key_expr: &str,
        consumer: &mut dyn RowConsumer,
        budget: &mut RowBudget,
    ) -> Result<(), MartError> {
        let mut base = base.clone();
        base.condition(Condition::bare(format!("{key_expr} IS NOT NULL")));

        let mut watermark: Option<i64> = None;
        let mut batch = self.sizer.current();
        loop {
            let mut select = base.clone();
            if let Some(key) = watermark {
                select.condition(Condition::new(
                    format!("{key_expr} >= ?"),
                    vec![Value::Integer(key)],
                ));
            }
            let mut rows = self.fetch(&select, Some(batch))?;
            let fetched = rows.len();
            tracing::debug!(
                dialect = %self.dialect,
                watermark,
                batch,
                fetched,
                "key batch"
            );

            if fetched < batch {
                if feed(consumer, budget, rows)? {
                    return Ok(());
                }
                break;
            }

            let tail = row_key(rows.last(), key_expr)?;
            let keep = rows
                .iter()
                .rposition(|row| row.first().and_then(Value::as_i64) != Some(tail))
                .map_or(0, |index| index + 1);
            if keep == 0 {
                if batch > self.max_key_rows {
                    tracing::warn!(
                        key = tail,
                        limit = self.max_key_rows,
                        "single key exceeds the per-key batch ceiling"
                    );
                    return Err(MartError::KeyBatchOverflow {
                        key: tail,
                        limit: self.max_key_rows,
                    });
                }
                // One row past the ceiling shows whether the key really exceeds it.
                batch = batch
                    .saturating_mul(2)
                    .min(self.max_key_rows.saturating_add(1));
                tracing::debug!(key = tail, batch, "widening batch for a single key");
                continue;
            }

            rows.truncate(keep);
            if feed(consumer, budget, rows)? {
                return Ok(());
            }
            watermark = Some(tail);
            self.sizer.grow();
            batch = self.sizer.current();
        }
        budget.record(consumer.finish()?);
        Ok(())
    }

    pub fn single(
        &mut self,
        base: &SelectBuilder,
        consumer: &mut dyn RowConsumer,
        budget: &mut RowBudget,
    ) -> Result<(), MartError> {
        let rows = self.fetch(base, budget.remaining())?;
        tracing::debug!(dialect = %self.dialect, fetched = rows.len(), "single batch");
        if feed(consumer, budget, rows)? {
            return Ok(());
        }
        budget.record(consumer.finish()?);
        Ok(())
    }

    fn fetch(
        &mut self,
        select: &SelectBuilder,
        max_rows: Option<usize>,
    ) -> Result<Vec<Vec<Value>>, MartError> {
        let (sql, params) = select.render(self.dialect);
        self.batches += 1;
        let result = self
            .connection
            .query(&sql, &params, max_rows)
            .map_err(|err| {
                tracing::warn!(error = %err, sql = %sql, "batch query failed");
                (self.map_sql)(err)
            })?;
        Ok(result.rows)
    }
}

fn feed(
    consumer: &mut dyn RowConsumer,
    budget: &mut RowBudget,
    rows: Vec<Vec<Value>>,
) -> Result<bool, MartError> {
    for row in rows {
        budget.record(consumer.accept(row)?);
        if budget.is_exhausted() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn row_key(row: Option<&Vec<Value>>, key_expr: &str) -> Result<i64, MartError> {
    row.and_then(|row| row.first())
        .and_then(Value::as_i64)
        .ok_or_else(|| MartError::InvalidQuery(format!("key {key_expr} is not an integer")))
}

#[derive(Debug, Clone)]
pub enum ExecutionPlan {
    Single(Query),
    Partitioned {
        base: Query,
        filter: IdListFilter,
        chunks: Vec<Vec<String>>,
    },
}

impl ExecutionPlan {
    /// De-duplicates every id list and partitions the first one that is too long for a
    /// single `IN` list. Fails before any SQL runs when more lists are too long than allowed.
    pub fn new(query: &Query, settings: &BatchSettings) -> Result<Self, MartError> {
        let mut query = query.clone();
        let lists = query
            .filters()
            .iter()
            .filter_map(|filter| match filter {
                Filter::IdList(list) => Some(list.clone()),
                Filter::Basic(_) => None,
            })
            .collect::<Vec<_>>();

        let mut big = Vec::new();
        for list in lists {
            let Some(values) = list.values() else {
                return Err(MartError::InvalidQuery(format!(
                    "id list on {}.{} has not been resolved",
                    list.table, list.field
                )));
            };
            let unique = dedup(values);
            let deduped = list.with_values(unique);
            if deduped != list {
                query.replace_filter(&Filter::IdList(list), Filter::IdList(deduped.clone()));
            }
            if deduped.values().map_or(0, <[String]>::len) > settings.id_list_batch {
                big.push(deduped);
            }
        }

        if big.len() > settings.max_big_id_lists {
            return Err(MartError::InvalidQuery(format!(
                "{} id lists exceed {} identifiers; at most {} may",
                big.len(),
                settings.id_list_batch,
                settings.max_big_id_lists
            )));
        }

        let Some(filter) = big.into_iter().next() else {
            return Ok(ExecutionPlan::Single(query));
        };
        query.remove_filter(&Filter::IdList(filter.clone()));
        let chunks = filter
            .values()
            .unwrap_or_default()
            .chunks(settings.id_list_batch.max(1))
            .map(<[String]>::to_vec)
            .collect::<Vec<_>>();
        tracing::debug!(
            field = %filter.field,
            ids = chunks.iter().map(Vec::len).sum::<usize>(),
            partitions = chunks.len(),
            "partitioning id list"
        );
        Ok(ExecutionPlan::Partitioned {
            base: query,
            filter,
            chunks,
        })
    }

    pub fn len(&self) -> usize {
        match self {
            ExecutionPlan::Single(_) => 1,
            ExecutionPlan::Partitioned { chunks, .. } => chunks.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn query(&self, index: usize) -> Query {
        match self {
            ExecutionPlan::Single(query) => query.clone(),
            ExecutionPlan::Partitioned {
                base,
                filter,
                chunks,
            } => {
                let mut query = base.clone();
                query.add_filter(Filter::IdList(filter.with_values(chunks[index].clone())));
                query
            }
        }
    }
}

fn dedup(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter(|value| seen.insert(value.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::db::ResultSet;
    use crate::query::{Attribute, Dataset};

    #[test]
    fn sizer_grows_to_max() {
        let settings = BatchSettings {
            initial_batch: 5000,
            max_batch: 50000,
            growth_factors: vec![2, 2],
            ..BatchSettings::default()
        };
        let mut sizer = BatchSizer::new(&settings);
        let mut sizes = vec![sizer.current()];
        for _ in 0..5 {
            sizer.grow();
            sizes.push(sizer.current());
        }
        assert_eq!(sizes, vec![5000, 10000, 20000, 40000, 50000, 50000]);
    }

    #[test]
    fn budget_counts_down() {
        let mut budget = RowBudget::new(Some(3));
        budget.record(2);
        assert_eq!(budget.remaining(), Some(1));
        budget.record(1);
        assert!(budget.is_exhausted());
        assert!(!RowBudget::new(None).is_exhausted());
    }

    fn list_query(lists: &[usize]) -> Query {
        let mut query = Query::new(Dataset::new("gene", "gene_main", "gene_id_key"));
        query.add_attribute(Attribute::new("id", "gene_stable_id", "gene_main"));
        for (index, size) in lists.iter().enumerate() {
            let field = format!("field_{index}");
            let values = (0..*size).map(|value| format!("ID{value}"));
            query.add_filter(Filter::IdList(IdListFilter::from_values(
                field,
                "gene_main",
                values,
            )));
        }
        query
    }

    #[test]
    fn small_lists_run_as_one_query() {
        let plan = ExecutionPlan::new(&list_query(&[10, 20]), &BatchSettings::default()).unwrap();
        assert_matches!(plan, ExecutionPlan::Single(_));
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn big_list_is_partitioned_without_repeats() {
        let settings = BatchSettings {
            id_list_batch: 10,
            ..BatchSettings::default()
        };
        let mut query = list_query(&[25]);
        let Filter::IdList(list) = query.filters()[0].clone() else {
            unreachable!()
        };
        let mut values = list.values().unwrap().to_vec();
        values.extend(["ID3".to_string(), "ID4".to_string()]);
        query.replace_filter(&Filter::IdList(list.clone()), Filter::IdList(list.with_values(values)));

        let plan = ExecutionPlan::new(&query, &settings).unwrap();
        assert_eq!(plan.len(), 3);
        let mut seen = Vec::new();
        for index in 0..plan.len() {
            let partition = plan.query(index);
            assert_eq!(partition.filters().len(), 1);
            let Filter::IdList(chunk) = &partition.filters()[0] else {
                unreachable!()
            };
            seen.extend(chunk.values().unwrap().iter().cloned());
        }
        assert_eq!(seen.len(), 25);
        assert_eq!(seen.iter().collect::<HashSet<_>>().len(), 25);
    }

    #[test]
    fn two_big_lists_are_rejected() {
        let settings = BatchSettings {
            id_list_batch: 10,
            ..BatchSettings::default()
        };
        let err = ExecutionPlan::new(&list_query(&[11, 12]), &settings).unwrap_err();
        assert_matches!(err, MartError::InvalidQuery(_));
    }

    /// Serves `SELECT key, value` over an in-memory table, honoring `key >= ?` and max_rows.
    struct KeyedRows {
        rows: Vec<(i64, &'static str)>,
        statements: Vec<String>,
    }

    impl MartConnection for KeyedRows {
        fn query(
            &mut self,
            sql: &str,
            params: &[Value],
            max_rows: Option<usize>,
        ) -> Result<ResultSet, SqlError> {
            self.statements.push(sql.to_string());
            let from = params.first().and_then(Value::as_i64).unwrap_or(i64::MIN);
            let rows = self
                .rows
                .iter()
                .filter(|(key, _)| *key >= from)
                .take(max_rows.unwrap_or(usize::MAX))
                .map(|(key, value)| vec![Value::Integer(*key), Value::from(*value)])
                .collect();
            Ok(ResultSet {
                columns: vec!["k".to_string(), "v".to_string()],
                rows,
            })
        }
    }

    #[derive(Default)]
    struct Collect(Vec<(i64, String)>);

    impl RowConsumer for Collect {
        fn accept(&mut self, row: Vec<Value>) -> Result<usize, MartError> {
            self.0.push((row[0].as_i64().unwrap(), row[1].to_string()));
            Ok(1)
        }

        fn finish(&mut self) -> Result<usize, MartError> {
            Ok(0)
        }
    }

    fn key_settings() -> BatchSettings {
        BatchSettings {
            initial_batch: 2,
            max_batch: 4,
            growth_factors: vec![2],
            ..BatchSettings::default()
        }
    }

    #[test]
    fn keyset_paging_returns_every_row_once() {
        let rows = vec![
            (1, "a"),
            (2, "b"),
            (2, "c"),
            (2, "d"),
            (2, "e"),
            (2, "f"),
            (3, "g"),
            (4, "h"),
            (4, "i"),
            (5, "j"),
        ];
        let mut connection = KeyedRows {
            rows: rows.clone(),
            statements: Vec::new(),
        };
        let mut collected = Collect::default();
        let mut budget = RowBudget::new(None);
        let mut base = SelectBuilder::new("t");
        base.column("t.k").column("t.v").order_by("t.k");
        let mut pager = Pager::new(
            &mut connection,
            Dialect::Generic,
            &key_settings(),
            8,
            |err| MartError::InvalidQuery(err.to_string()),
        );
        pager.by_key(&base, "t.k", &mut collected, &mut budget).unwrap();
        assert!(pager.batches() > 2);

        let expected = rows
            .iter()
            .map(|(key, value)| (*key, value.to_string()))
            .collect::<Vec<_>>();
        assert_eq!(collected.0, expected);
        assert_eq!(budget.written(), 10);
        assert!(connection.statements[0].contains("(t.k IS NOT NULL)"));
        assert!(connection.statements[1].contains("(t.k >= ?)"));
    }

    #[test]
    fn keyset_paging_stops_at_budget() {
        let mut connection = KeyedRows {
            rows: vec![(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")],
            statements: Vec::new(),
        };
        let mut collected = Collect::default();
        let mut budget = RowBudget::new(Some(3));
        let mut base = SelectBuilder::new("t");
        base.column("t.k").column("t.v").order_by("t.k");
        let mut pager = Pager::new(
            &mut connection,
            Dialect::Oracle,
            &key_settings(),
            8,
            |err| MartError::InvalidQuery(err.to_string()),
        );
        pager.by_key(&base, "t.k", &mut collected, &mut budget).unwrap();
        assert_eq!(collected.0.len(), 3);
    }

    #[test]
    fn single_key_over_ceiling_is_fatal() {
        let mut connection = KeyedRows {
            rows: vec![(7, "a"); 6],
            statements: Vec::new(),
        };
        let mut collected = Collect::default();
        let mut budget = RowBudget::new(None);
        let mut base = SelectBuilder::new("t");
        base.column("t.k").column("t.v").order_by("t.k");
        let mut pager = Pager::new(
            &mut connection,
            Dialect::Generic,
            &key_settings(),
            4,
            |err| MartError::InvalidQuery(err.to_string()),
        );
        let err = pager
            .by_key(&base, "t.k", &mut collected, &mut budget)
            .unwrap_err();
        assert_matches!(err, MartError::KeyBatchOverflow { key: 7, limit: 4 });
        assert!(collected.0.is_empty());
    }

    #[test]
    fn key_filling_the_ceiling_exactly_pages() {
        let mut connection = KeyedRows {
            rows: vec![(7, "a"), (7, "b"), (7, "c"), (7, "d"), (8, "e")],
            statements: Vec::new(),
        };
        let mut collected = Collect::default();
        let mut budget = RowBudget::new(None);
        let mut base = SelectBuilder::new("t");
        base.column("t.k").column("t.v").order_by("t.k");
        let mut pager = Pager::new(
            &mut connection,
            Dialect::Generic,
            &key_settings(),
            4,
            |err| MartError::InvalidQuery(err.to_string()),
        );
        pager.by_key(&base, "t.k", &mut collected, &mut budget).unwrap();
        let keys = collected.0.iter().map(|(key, _)| *key).collect::<Vec<_>>();
        assert_eq!(keys, vec![7, 7, 7, 7, 8]);

        let mut connection = KeyedRows {
            rows: vec![(7, "a"); 4],
            statements: Vec::new(),
        };
        let mut collected = Collect::default();
        let mut pager = Pager::new(
            &mut connection,
            Dialect::Generic,
            &key_settings(),
            4,
            |err| MartError::InvalidQuery(err.to_string()),
        );
        pager
            .by_key(&base, "t.k", &mut collected, &mut RowBudget::new(None))
            .unwrap();
        assert_eq!(collected.0.len(), 4);
    }
}
