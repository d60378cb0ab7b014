use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use mart_query::db::{Dialect, SqliteDataSource};
use mart_query::dna::{ChunkTableSpec, DnaAdaptor, DnaSource};
use mart_query::error::MartError;
use mart_query::location::{SequenceLocation, Strand};
use rusqlite::Connection;
use tempfile::TempDir;

fn chunk_store() -> (TempDir, SqliteDataSource) {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("dna.sqlite")).unwrap();
    let connection = Connection::open(path.as_std_path()).unwrap();
    connection
        .execute_batch(
            "CREATE TABLE dna_chunks (chr_name TEXT, chr_start INTEGER, sequence TEXT);
             INSERT INTO dna_chunks VALUES
                ('1', 1, 'ATGGCTAAAC'),
                ('1', 11, 'CCGGGTTTAA'),
                ('1', 21, 'GGGCCCAAAT');",
        )
        .unwrap();
    (temp, SqliteDataSource::new(path, Dialect::Generic))
}

fn adaptor(source: &SqliteDataSource) -> DnaAdaptor {
    let spec: ChunkTableSpec = "dna_chunks,chr_name,chr_start,sequence,10".parse().unwrap();
    DnaAdaptor::open(source, spec).unwrap()
}

#[test]
fn range_across_chunks_is_stitched() {
    let (_temp, source) = chunk_store();
    let mut dna = adaptor(&source);
    let bases = dna.sequence("1", 8, 23).unwrap();
    assert_eq!(bases, b"AACCCGGGTTTAAGGG");
    assert_eq!(bases.len(), 23 - 8 + 1);
    dna.close();
}

#[test]
fn exact_chunk_is_read_whole() {
    let (_temp, source) = chunk_store();
    let mut dna = adaptor(&source);
    assert_eq!(dna.sequence("1", 11, 20).unwrap(), b"CCGGGTTTAA");
    assert_eq!(dna.sequence("1", 1, 30).unwrap().len(), 30);
}

#[test]
fn missing_sequence_is_n_padded() {
    let (_temp, source) = chunk_store();
    let mut dna = adaptor(&source);
    assert_eq!(dna.sequence("2", 1, 5).unwrap(), b"NNNNN");
    assert_eq!(dna.sequence("1", 101, 104).unwrap(), b"NNNN");
}

#[test]
fn range_past_stored_end_comes_back_short() {
    let (_temp, source) = chunk_store();
    let mut dna = adaptor(&source);
    assert_eq!(dna.sequence("1", 25, 35).unwrap(), b"CCAAAT");
}

#[test]
fn reverse_strand_locations_are_reverse_complemented() {
    let (_temp, source) = chunk_store();
    let mut dna = adaptor(&source);
    let location = SequenceLocation::new("1", 1, 4, Strand::Reverse);
    assert_eq!(dna.location_sequence(&location).unwrap(), b"CCAT");

    let flank = SequenceLocation::new("1", 1, 4, Strand::Forward).left_flank_only(3);
    assert!(dna.location_sequence(&flank).unwrap().is_empty());
}

#[test]
fn unknown_table_is_a_sequence_error() {
    let (_temp, source) = chunk_store();
    let spec: ChunkTableSpec = "no_such_table,chr_name,chr_start,sequence,10".parse().unwrap();
    let mut dna = DnaAdaptor::open(&source, spec).unwrap();
    let err = dna.sequence("1", 1, 5).unwrap_err();
    assert_matches!(err, MartError::Sequence(_));
}
