use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::db::{DataSource, MartConnection, Value};
use crate::error::MartError;
use crate::format::reverse_complement;
use crate::location::SequenceLocation;

/// Layout of a chunked sequence table. Parsed from the dataset parameter string
/// `table,chrCol,startCol,seqCol,chunkSize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTableSpec {
    pub table: String,
    pub chromosome_column: String,
    pub chunk_start_column: String,
    pub sequence_column: String,
    pub chunk_size: u64,
}

impl FromStr for ChunkTableSpec {
    type Err = MartError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value.split(',').map(str::trim).collect::<Vec<_>>();
        let [table, chromosome, chunk_start, sequence, size] = parts.as_slice() else {
            return Err(MartError::InvalidChunkSpec(format!(
                "expected 5 comma-separated fields, got {}: {value}",
                parts.len()
            )));
        };
        for identifier in [table, chromosome, chunk_start, sequence] {
            if !is_identifier(identifier) {
                return Err(MartError::InvalidChunkSpec(format!(
                    "not a table or column name: {identifier:?}"
                )));
            }
        }
        let chunk_size = size
            .parse::<u64>()
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| MartError::InvalidChunkSpec(format!("invalid chunk size: {size}")))?;

        Ok(Self {
            table: table.to_string(),
            chromosome_column: chromosome.to_string(),
            chunk_start_column: chunk_start.to_string(),
            sequence_column: sequence.to_string(),
            chunk_size,
        })
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
}

pub trait DnaSource {
    fn sequence(&mut self, chromosome: &str, start: u64, end: u64) -> Result<Vec<u8>, MartError>;

    /// Bases of `location`, reverse-complemented when it lies on the reverse strand.
    fn location_sequence(&mut self, location: &SequenceLocation) -> Result<Vec<u8>, MartError> {
        if location.is_empty() {
            return Ok(Vec::new());
        }
        let bases = self.sequence(location.chromosome(), location.start(), location.end())?;
        if location.strand().is_reverse() {
            Ok(reverse_complement(&bases))
        } else {
            Ok(bases)
        }
    }
}

/// Reads sequence from a chunked table, stitching ranges that cross chunk boundaries.
///
/// Holds one connection for its lifetime; the whole-chunk and substring statements are
/// prepared on it once and reused. Call [`DnaAdaptor::close`] when the owning runner is
/// done.
pub struct DnaAdaptor {
    connection: Box<dyn MartConnection>,
    spec: ChunkTableSpec,
    chunk_sql: String,
    substring_sql: String,
}

impl DnaAdaptor {
    pub fn open(source: &dyn DataSource, spec: ChunkTableSpec) -> Result<Self, MartError> {
        let connection = source.connect().map_err(|err| {
            tracing::warn!(source = source.name(), error = %err, "dna connection failed");
            MartError::Sequence(format!("connect to {}: {err}", source.name()))
        })?;
        Ok(Self::new(connection, spec))
    }

    pub fn new(connection: Box<dyn MartConnection>, spec: ChunkTableSpec) -> Self {
        let chunk_sql = format!(
            "SELECT {seq} FROM {table} WHERE {start} = ? AND {chr} = ?",
            seq = spec.sequence_column,
            table = spec.table,
            start = spec.chunk_start_column,
            chr = spec.chromosome_column,
        );
        let substring_sql = format!(
            "SELECT substr({seq}, ?, ?) FROM {table} WHERE {start} = ? AND {chr} = ?",
            seq = spec.sequence_column,
            table = spec.table,
            start = spec.chunk_start_column,
            chr = spec.chromosome_column,
        );
        Self {
            connection,
            spec,
            chunk_sql,
            substring_sql,
        }
    }

    pub fn spec(&self) -> &ChunkTableSpec {
        &self.spec
    }

    pub fn close(self) {
        tracing::debug!(table = %self.spec.table, "closing dna adaptor");
    }

    fn fetch_chunk(
        &mut self,
        chromosome: &str,
        start: u64,
        length: u64,
    ) -> Result<Vec<u8>, MartError> {
        let chunk_size = self.spec.chunk_size;
        let chunk_start = start - ((start - 1) % chunk_size);
        let within = start - chunk_start;
        let take = length.min(chunk_size - within);

        let result = (if within == 0 && take == chunk_size {
            self.connection.query(
                &self.chunk_sql,
                &[Value::Integer(chunk_start as i64), Value::from(chromosome)],
                Some(1),
            )
        } else {
            self.connection.query(
                &self.substring_sql,
                &[
                    Value::Integer(within as i64 + 1),
                    Value::Integer(take as i64),
                    Value::Integer(chunk_start as i64),
                    Value::from(chromosome),
                ],
                Some(1),
            )
        })
        .map_err(|err| {
            tracing::warn!(chromosome, start, error = %err, "dna chunk fetch failed");
            MartError::Sequence(format!(
                "fetch {chromosome}:{start} (+{take}) from {}: {err}",
                self.spec.table
            ))
        })?;

        let mut bytes = result
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .map(Value::into_bytes)
            .unwrap_or_default();
        bytes.truncate(take as usize);
        Ok(bytes)
    }
}

impl DnaSource for DnaAdaptor {
    /// A range with no stored bases at all comes back as `N`s of the requested length.
    /// A range that runs past the end of the stored sequence comes back short.
    fn sequence(&mut self, chromosome: &str, start: u64, end: u64) -> Result<Vec<u8>, MartError> {
        let start = start.max(1);
        if end < start {
            return Ok(Vec::new());
        }
        let length = end - start + 1;
        let mut bases = Vec::with_capacity(length as usize);
        while (bases.len() as u64) < length {
            let position = start + bases.len() as u64;
            let chunk = self.fetch_chunk(chromosome, position, length - bases.len() as u64)?;
            if chunk.is_empty() {
                break;
            }
            bases.extend_from_slice(&chunk);
        }

        if bases.is_empty() {
            tracing::debug!(chromosome, start, end, "no sequence stored, padding with N");
            return Ok(vec![b'N'; length as usize]);
        }
        if (bases.len() as u64) < length {
            tracing::debug!(
                chromosome,
                start,
                end,
                missing = length - bases.len() as u64,
                "sequence ends before requested range"
            );
        }
        Ok(bases)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_chunk_spec() {
        let spec: ChunkTableSpec = "dna_chunks, chr_name, chr_start, sequence, 100000"
            .parse()
            .unwrap();
        assert_eq!(spec.table, "dna_chunks");
        assert_eq!(spec.chunk_start_column, "chr_start");
        assert_eq!(spec.chunk_size, 100000);
    }

    #[test]
    fn parse_chunk_spec_rejects_bad_input() {
        let err = "dna_chunks,chr_name,chr_start".parse::<ChunkTableSpec>().unwrap_err();
        assert_matches!(err, MartError::InvalidChunkSpec(_));

        let err = "dna_chunks,chr_name,chr_start,sequence,0"
            .parse::<ChunkTableSpec>()
            .unwrap_err();
        assert_matches!(err, MartError::InvalidChunkSpec(_));

        let err = "dna;drop,chr_name,chr_start,sequence,10"
            .parse::<ChunkTableSpec>()
            .unwrap_err();
        assert_matches!(err, MartError::InvalidChunkSpec(_));
    }

    struct Fixed(Vec<u8>);

    impl DnaSource for Fixed {
        fn sequence(&mut self, _chr: &str, start: u64, end: u64) -> Result<Vec<u8>, MartError> {
            Ok(self.0[(start - 1) as usize..end as usize].to_vec())
        }
    }

    #[test]
    fn reverse_locations_are_complemented() {
        let mut source = Fixed(b"AACGTT".to_vec());
        let forward = SequenceLocation::new("1", 2, 4, crate::location::Strand::Forward);
        let reverse = SequenceLocation::new("1", 2, 4, crate::location::Strand::Reverse);
        assert_eq!(source.location_sequence(&forward).unwrap(), b"ACG");
        assert_eq!(source.location_sequence(&reverse).unwrap(), b"CGT");
    }
}
