use std::io::Write;

use super::{AttributeQueryRunner, QueryRunner, RunContext, SeqType, SequenceQueryRunner};
use crate::error::MartError;
use crate::format::FormatSpec;
use crate::query::{Query, QueryType};

/// Picks the runner for a query: attribute queries get the tabular runner, sequence
/// queries the sequence runner configured for their sequence type.
pub struct QueryRunnerFactory;

impl QueryRunnerFactory {
    pub fn create<'a>(
        context: RunContext<'a>,
        query: Query,
        format: FormatSpec,
        out: &'a mut dyn Write,
    ) -> Result<Box<dyn QueryRunner + 'a>, MartError> {
        match query.query_type() {
            QueryType::Attribute => {
                if format.is_fasta() {
                    return Err(MartError::Format(
                        "fasta output is only available for sequence queries".to_string(),
                    ));
                }
                Ok(Box::new(AttributeQueryRunner::new(context, query, format, out)))
            }
            QueryType::Sequence => {
                let seq_type = Self::seq_type(&query)?;
                Ok(Box::new(SequenceQueryRunner::new(
                    context, query, seq_type, format, out,
                )))
            }
        }
    }

    /// Resolves and validates the sequence type of a sequence query.
    pub fn seq_type(query: &Query) -> Result<SeqType, MartError> {
        let description = query.sequence().ok_or_else(|| {
            MartError::InvalidQuery("attribute queries have no sequence type".to_string())
        })?;
        let seq_type = SeqType::resolve(&description.seq_type)?;
        seq_type.validate_flanks(description.left_flank, description.right_flank)?;
        Ok(seq_type)
    }
}
