use std::io::Write;

use super::batch::{ExecutionPlan, Pager, RowBudget, RowConsumer};
use super::idlist::resolve_id_lists;
use super::seq_type::{EntityRecord, SeqType, StructureField};
use super::{QueryRunner, RunContext, RunStats, effective_limit};
use crate::db::{SqlError, Value};
use crate::dna::{ChunkTableSpec, DnaAdaptor, DnaSource};
use crate::error::MartError;
use crate::format::FormatSpec;
use crate::query::{Attribute, Dataset, Filter, IdListFilter, IdSource, Query};
use crate::sql::SelectBuilder;

pub struct SequenceQueryRunner<'a> {
    context: RunContext<'a>,
    query: Query,
    seq_type: SeqType,
    format: FormatSpec,
    out: &'a mut dyn Write,
}

impl<'a> SequenceQueryRunner<'a> {
    pub fn new(
        context: RunContext<'a>,
        query: Query,
        seq_type: SeqType,
        format: FormatSpec,
        out: &'a mut dyn Write,
    ) -> Self {
        Self {
            context,
            query,
            seq_type,
            format,
            out,
        }
    }

    pub fn seq_type(&self) -> SeqType {
        self.seq_type
    }

    fn chunk_spec(&self) -> Result<ChunkTableSpec, MartError> {
        if let Some(spec) = &self.query.dataset().sequence_store {
            return spec.parse();
        }
        self.context.sequence_store.cloned().ok_or_else(|| {
            MartError::Sequence(format!(
                "dataset {} has no sequence store configured",
                self.query.dataset().name
            ))
        })
    }

    fn run<D: DnaSource>(
        &mut self,
        dna: D,
        limit: usize,
        is_sub_query: bool,
    ) -> Result<(RunStats, D), MartError> {
        let context = self.context;
        let final_query = final_query(&self.query, self.seq_type)?;
        let header_count = final_query.attributes().len() - self.seq_type.fields().len();
        let final_query = resolve_id_lists(&final_query, context)?;
        let plan = ExecutionPlan::new(&final_query, context.settings)?;
        let mut budget = RowBudget::new(effective_limit(
            limit,
            &self.query,
            context.settings,
            is_sub_query,
        ));

        let mut connection = context.source.connect().map_err(|err| {
            tracing::warn!(source = context.source.name(), error = %err, "connection failed");
            sequence_failed(err)
        })?;
        let mut pager = Pager::new(
            connection.as_mut(),
            context.source.dialect(),
            context.settings,
            context.settings.max_sequence_key_rows,
            sequence_failed,
        );
        let description = self.query.sequence().cloned();
        let (left, right) = description
            .map(|description| (description.left_flank, description.right_flank))
            .unwrap_or_default();
        let mut grouper = EntityGrouper {
            seq_type: self.seq_type,
            header_count,
            left,
            right,
            format: self.format,
            out: &mut *self.out,
            dna,
            state: GroupState::Idle,
        };

        for index in 0..plan.len() {
            if budget.is_exhausted() {
                break;
            }
            let partition = plan.query(index);
            let select = structure_select(context, &partition, self.seq_type)?;
            let key = context.compiler.qualified_lowest_level_key(&partition);
            if pager.dialect().pages_by_offset() {
                pager.by_offset(&select, &mut grouper, &mut budget, false)?;
            } else {
                pager.by_key(&select, &key, &mut grouper, &mut budget)?;
            }
        }

        let stats = RunStats {
            units: budget.written(),
            batches: pager.batches(),
            partitions: plan.len(),
        };
        tracing::info!(
            dataset = %self.query.dataset().name,
            seq_type = self.seq_type.name(),
            entities = stats.units,
            batches = stats.batches,
            partitions = stats.partitions,
            "sequence query finished"
        );
        Ok((stats, grouper.dna))
    }
}

impl QueryRunner for SequenceQueryRunner<'_> {
    fn name(&self) -> &'static str {
        self.seq_type.name()
    }

    fn execute(&mut self, limit: usize, is_sub_query: bool) -> Result<RunStats, MartError> {
        let stats = if self.seq_type.needs_dna() {
            let adaptor = DnaAdaptor::open(self.context.source, self.chunk_spec()?)?;
            let (stats, adaptor) = self.run(adaptor, limit, is_sub_query)?;
            adaptor.close();
            stats
        } else {
            self.run(NoDna, limit, is_sub_query)?.0
        };
        self.out.flush().map_err(|err| {
            tracing::warn!(error = %err, "flushing sequence output failed");
            MartError::Sequence(format!("write output: {err}"))
        })?;
        Ok(stats)
    }
}

/// Rewrites a sequence query into a query on the structure table: one row per structure
/// record, keyed by the entity, carrying the caller's attributes as headers followed by
/// the structure fields the sequence type reads.
///
/// A dataset link turns the caller's filters into a sub-query on the reference dataset
/// whose exported identifiers filter the structure table.
pub fn final_query(query: &Query, seq_type: SeqType) -> Result<Query, MartError> {
    let description = query.sequence().ok_or_else(|| {
        MartError::InvalidQuery(format!(
            "query on {} has no sequence description",
            query.dataset().name
        ))
    })?;
    let structure = &description.structure;
    let fields = &structure.fields;

    let mut dataset = Dataset::new(
        query.dataset().name.clone(),
        structure.table.clone(),
        seq_type.key_column(fields),
    );
    dataset.sequence_store = query.dataset().sequence_store.clone();
    let mut structure_query = Query::new(dataset);

    match &description.link {
        Some(link) => {
            let mut reference = Query::new(link.reference.clone());
            reference.add_attribute(link.exportable.clone());
            for filter in query.filters() {
                reference.add_filter(filter.clone());
            }
            structure_query.add_filter(Filter::IdList(IdListFilter::new(
                link.importable.clone(),
                structure.table.clone(),
                IdSource::SubQuery(Box::new(reference)),
            )));
        }
        None => {
            for filter in query.filters() {
                structure_query.add_filter(filter.clone());
            }
        }
    }

    for attribute in query.attributes() {
        structure_query.add_attribute(attribute.clone());
    }
    for field in seq_type.fields() {
        structure_query.add_attribute(Attribute::new(
            format!("seq:{}", field.label()),
            field.column(fields),
            structure.table.clone(),
        ));
    }
    structure_query.set_limit(query.limit());
    Ok(structure_query)
}

fn structure_select(
    context: RunContext<'_>,
    query: &Query,
    seq_type: SeqType,
) -> Result<SelectBuilder, MartError> {
    let mut select = context.compiler.to_sql_with_key(query)?;
    select.order_by(context.compiler.qualified_lowest_level_key(query));
    if seq_type.fields().contains(&StructureField::Rank)
        && let Some(rank) = query
            .attributes()
            .iter()
            .find(|attribute| attribute.name == "seq:rank")
    {
        select.order_by(rank.qualified());
    }
    Ok(select)
}

enum GroupState {
    Idle,
    Accumulating(EntityRecord),
}

/// Folds key-ordered structure rows into entities and writes each one as soon as the
/// next key shows up.
struct EntityGrouper<'w, D: DnaSource> {
    seq_type: SeqType,
    header_count: usize,
    left: u64,
    right: u64,
    format: FormatSpec,
    out: &'w mut dyn Write,
    dna: D,
    state: GroupState,
}

impl<D: DnaSource> EntityGrouper<'_, D> {
    fn write(&mut self, entity: EntityRecord) -> Result<(), MartError> {
        let bodies = self
            .seq_type
            .render(&entity, self.left, self.right, &mut self.dna)?;
        let headers = entity.headers();
        for body in bodies {
            self.format
                .write_record(&mut *self.out, &headers, &body)
                .map_err(|err| {
                    tracing::warn!(key = entity.key, error = %err, "writing sequence failed");
                    MartError::Sequence(format!("write entity {}: {err}", entity.key))
                })?;
        }
        Ok(())
    }
}

impl<D: DnaSource> RowConsumer for EntityGrouper<'_, D> {
    fn accept(&mut self, row: Vec<Value>) -> Result<usize, MartError> {
        let key = row
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| MartError::Sequence("structure row without an integer key".into()))?;
        let split = (1 + self.header_count).min(row.len());
        let (headers, fields) = row[1..].split_at(split - 1);

        if !self.seq_type.groups_rows() {
            let mut entity = EntityRecord::new(key, self.header_count);
            entity.absorb(self.seq_type, headers, fields);
            self.write(entity)?;
            return Ok(1);
        }

        match std::mem::replace(&mut self.state, GroupState::Idle) {
            GroupState::Accumulating(mut current) if current.key == key => {
                current.absorb(self.seq_type, headers, fields);
                self.state = GroupState::Accumulating(current);
                Ok(0)
            }
            GroupState::Accumulating(finished) => {
                let mut next = EntityRecord::new(key, self.header_count);
                next.absorb(self.seq_type, headers, fields);
                self.state = GroupState::Accumulating(next);
                self.write(finished)?;
                Ok(1)
            }
            GroupState::Idle => {
                let mut entity = EntityRecord::new(key, self.header_count);
                entity.absorb(self.seq_type, headers, fields);
                self.state = GroupState::Accumulating(entity);
                Ok(0)
            }
        }
    }

    fn finish(&mut self) -> Result<usize, MartError> {
        match std::mem::replace(&mut self.state, GroupState::Idle) {
            GroupState::Accumulating(entity) => {
                self.write(entity)?;
                Ok(1)
            }
            GroupState::Idle => Ok(0),
        }
    }
}

struct NoDna;

impl DnaSource for NoDna {
    fn sequence(&mut self, chromosome: &str, start: u64, end: u64) -> Result<Vec<u8>, MartError> {
        Err(MartError::Sequence(format!(
            "no sequence store for {chromosome}:{start}-{end}"
        )))
    }
}

fn sequence_failed(err: SqlError) -> MartError {
    MartError::Sequence(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{DatasetLink, SequenceDescription, StructureSchema};

    fn transcript_query() -> Query {
        let mut query = Query::new(Dataset::new("tx", "transcript_main", "transcript_id_key"));
        query.add_attribute(Attribute::new("gene", "gene_stable_id", "structure"));
        query.set_sequence(Some(SequenceDescription::new(
            "cdna",
            StructureSchema::new("structure"),
        )));
        query
    }

    #[test]
    fn final_query_targets_structure_table() {
        let query = final_query(&transcript_query(), SeqType::Cdna).unwrap();
        assert_eq!(query.dataset().main_table, "structure");
        assert_eq!(query.dataset().primary_key, "transcript_id_key");
        let names = query
            .attributes()
            .iter()
            .map(|attribute| attribute.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "gene",
                "seq:rank",
                "seq:chromosome",
                "seq:exon_start",
                "seq:exon_end",
                "seq:strand"
            ]
        );
    }

    #[test]
    fn link_moves_filters_into_a_sub_query() {
        let mut query = transcript_query();
        query.add_filter(Filter::IdList(IdListFilter::from_values(
            "gene_stable_id",
            "gene_main",
            ["G1"],
        )));
        let description = query.sequence().cloned().unwrap().with_link(DatasetLink {
            reference: Dataset::new("gene", "gene_main", "gene_id_key"),
            exportable: Attribute::new("gene_key", "gene_id_key", "gene_main"),
            importable: "gene_id_key".to_string(),
        });
        query.set_sequence(Some(description));

        let structure_query = final_query(&query, SeqType::GeneExon).unwrap();
        assert_eq!(structure_query.dataset().primary_key, "gene_id_key");
        assert_eq!(structure_query.filters().len(), 1);
        let Filter::IdList(list) = &structure_query.filters()[0] else {
            panic!("expected id list");
        };
        let IdSource::SubQuery(reference) = &list.source else {
            panic!("expected sub-query");
        };
        assert_eq!(reference.dataset().main_table, "gene_main");
        assert_eq!(reference.filters().len(), 1);
    }

    #[test]
    fn grouper_writes_one_record_per_key() {
        let mut out = Vec::new();
        let mut grouper = EntityGrouper {
            seq_type: SeqType::Uniprot,
            header_count: 1,
            left: 0,
            right: 0,
            format: FormatSpec::tabulated('\t'),
            out: &mut out,
            dna: NoDna,
            state: GroupState::Idle,
        };
        let rows = [
            (1, "P1", "MAK"),
            (2, "P2", "MKV"),
        ];
        for (key, id, protein) in rows {
            let units = grouper
                .accept(vec![Value::Integer(key), Value::from(id), Value::from(protein)])
                .unwrap();
            assert_eq!(units, 1);
        }
        assert_eq!(grouper.finish().unwrap(), 0);
        assert_eq!(String::from_utf8(out).unwrap(), "P1\tMAK\nP2\tMKV\n");
    }
}
