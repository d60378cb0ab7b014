use std::sync::LazyLock;

use regex::Regex;

use crate::db::Value;
use crate::dna::DnaSource;
use crate::error::MartError;
use crate::format::translate;
use crate::location::{SequenceLocation, Strand};
use crate::query::StructureFields;

/// Written in place of a sequence when a transcript has no untranslated region.
pub const NO_UTR_SENTINEL: &str = "Sequence unavailable";

static FLANK_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(upstream|downstream)_(transcript|gene)_flank$").expect("valid flank regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqType {
    Coding,
    Peptide,
    Cdna,
    TranscriptExon,
    TranscriptExonIntron,
    UpstreamTranscriptFlank,
    DownstreamTranscriptFlank,
    GeneExon,
    GeneExonIntron,
    UpstreamGeneFlank,
    DownstreamGeneFlank,
    ThreeUtr,
    FiveUtr,
    Snp,
    Uniprot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityLevel {
    Transcript,
    Gene,
    Snp,
    Protein,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureField {
    Rank,
    Chromosome,
    ExonStart,
    ExonEnd,
    Strand,
    CodingStart,
    CodingEnd,
    SnpStart,
    Allele,
    ProteinSequence,
}

impl StructureField {
    pub fn column(self, fields: &StructureFields) -> &str {
        match self {
            StructureField::Rank => &fields.rank,
            StructureField::Chromosome => &fields.chromosome,
            StructureField::ExonStart => &fields.exon_start,
            StructureField::ExonEnd => &fields.exon_end,
            StructureField::Strand => &fields.strand,
            StructureField::CodingStart => &fields.coding_start,
            StructureField::CodingEnd => &fields.coding_end,
            StructureField::SnpStart => &fields.snp_start,
            StructureField::Allele => &fields.allele,
            StructureField::ProteinSequence => &fields.protein_sequence,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StructureField::Rank => "rank",
            StructureField::Chromosome => "chromosome",
            StructureField::ExonStart => "exon_start",
            StructureField::ExonEnd => "exon_end",
            StructureField::Strand => "strand",
            StructureField::CodingStart => "coding_start",
            StructureField::CodingEnd => "coding_end",
            StructureField::SnpStart => "snp_start",
            StructureField::Allele => "allele",
            StructureField::ProteinSequence => "protein_sequence",
        }
    }
}

const EXON_FIELDS: &[StructureField] = &[
    StructureField::Rank,
    StructureField::Chromosome,
    StructureField::ExonStart,
    StructureField::ExonEnd,
    StructureField::Strand,
];

const CODING_FIELDS: &[StructureField] = &[
    StructureField::Rank,
    StructureField::Chromosome,
    StructureField::ExonStart,
    StructureField::ExonEnd,
    StructureField::Strand,
    StructureField::CodingStart,
    StructureField::CodingEnd,
];

const SNP_FIELDS: &[StructureField] = &[
    StructureField::Chromosome,
    StructureField::SnpStart,
    StructureField::Strand,
    StructureField::Allele,
];

const UNIPROT_FIELDS: &[StructureField] = &[StructureField::ProteinSequence];

impl SeqType {
    pub fn resolve(name: &str) -> Result<Self, MartError> {
        let name = name.trim().to_ascii_lowercase();
        let seq_type = match name.as_str() {
            "coding" => SeqType::Coding,
            "peptide" => SeqType::Peptide,
            "cdna" => SeqType::Cdna,
            "transcript_exon" => SeqType::TranscriptExon,
            "transcript_exon_intron" => SeqType::TranscriptExonIntron,
            "gene_exon" => SeqType::GeneExon,
            "gene_exon_intron" => SeqType::GeneExonIntron,
            "3utr" => SeqType::ThreeUtr,
            "5utr" => SeqType::FiveUtr,
            "snp" => SeqType::Snp,
            other if other.starts_with("uniprot") => SeqType::Uniprot,
            other => {
                let Some(captures) = FLANK_TYPE.captures(other) else {
                    return Err(MartError::Format(format!("unknown sequence type {other:?}")));
                };
                match (&captures[1], &captures[2]) {
                    ("upstream", "transcript") => SeqType::UpstreamTranscriptFlank,
                    ("downstream", "transcript") => SeqType::DownstreamTranscriptFlank,
                    ("upstream", _) => SeqType::UpstreamGeneFlank,
                    _ => SeqType::DownstreamGeneFlank,
                }
            }
        };
        Ok(seq_type)
    }

    pub fn name(self) -> &'static str {
        match self {
            SeqType::Coding => "coding",
            SeqType::Peptide => "peptide",
            SeqType::Cdna => "cdna",
            SeqType::TranscriptExon => "transcript_exon",
            SeqType::TranscriptExonIntron => "transcript_exon_intron",
            SeqType::UpstreamTranscriptFlank => "upstream_transcript_flank",
            SeqType::DownstreamTranscriptFlank => "downstream_transcript_flank",
            SeqType::GeneExon => "gene_exon",
            SeqType::GeneExonIntron => "gene_exon_intron",
            SeqType::UpstreamGeneFlank => "upstream_gene_flank",
            SeqType::DownstreamGeneFlank => "downstream_gene_flank",
            SeqType::ThreeUtr => "3utr",
            SeqType::FiveUtr => "5utr",
            SeqType::Snp => "snp",
            SeqType::Uniprot => "uniprot",
        }
    }

    pub fn level(self) -> EntityLevel {
        match self {
            SeqType::GeneExon
            | SeqType::GeneExonIntron
            | SeqType::UpstreamGeneFlank
            | SeqType::DownstreamGeneFlank => EntityLevel::Gene,
            SeqType::Snp => EntityLevel::Snp,
            SeqType::Uniprot => EntityLevel::Protein,
            _ => EntityLevel::Transcript,
        }
    }

    pub fn key_column(self, fields: &StructureFields) -> &str {
        match self.level() {
            EntityLevel::Transcript => &fields.transcript_key,
            EntityLevel::Gene => &fields.gene_key,
            EntityLevel::Snp => &fields.snp_key,
            EntityLevel::Protein => &fields.protein_key,
        }
    }

    pub fn fields(self) -> &'static [StructureField] {
        match self {
            SeqType::Coding | SeqType::Peptide | SeqType::ThreeUtr | SeqType::FiveUtr => {
                CODING_FIELDS
            }
            SeqType::Snp => SNP_FIELDS,
            SeqType::Uniprot => UNIPROT_FIELDS,
            _ => EXON_FIELDS,
        }
    }

    /// Whether consecutive rows with one key form one entity. SNP and protein rows are
    /// complete on their own.
    pub fn groups_rows(self) -> bool {
        !matches!(self, SeqType::Snp | SeqType::Uniprot)
    }

    pub fn needs_dna(self) -> bool {
        !matches!(self, SeqType::Uniprot)
    }

    pub fn validate_flanks(self, left: u64, right: u64) -> Result<(), MartError> {
        let missing = match self {
            SeqType::UpstreamTranscriptFlank | SeqType::UpstreamGeneFlank => left == 0,
            SeqType::DownstreamTranscriptFlank | SeqType::DownstreamGeneFlank => right == 0,
            _ => false,
        };
        if missing {
            return Err(MartError::InvalidQuery(format!(
                "{} requires a flank length greater than zero",
                self.name()
            )));
        }
        Ok(())
    }

    /// Sequence bodies for one entity; exon types give one body per exon.
    pub fn render(
        self,
        entity: &EntityRecord,
        left: u64,
        right: u64,
        dna: &mut dyn DnaSource,
    ) -> Result<Vec<Vec<u8>>, MartError> {
        let segments = entity.ordered_segments();
        let body = match self {
            SeqType::Uniprot => entity.payload.clone().unwrap_or_default().into_bytes(),
            SeqType::Snp => {
                let Some(site) = segments.first() else {
                    return Ok(Vec::new());
                };
                let mut body = dna.location_sequence(&site.location.left_flank_only(left))?;
                body.extend_from_slice(entity.payload.as_deref().unwrap_or_default().as_bytes());
                body.extend(dna.location_sequence(&site.location.right_flank_only(right))?);
                body
            }
            SeqType::Cdna => {
                let pieces = segments.iter().map(|segment| segment.location.clone());
                flanked(pieces.collect(), left, right, dna)?
            }
            SeqType::Coding => flanked(coding_pieces(&segments), left, right, dna)?,
            SeqType::Peptide => {
                let mut coding = Vec::new();
                for piece in coding_pieces(&segments) {
                    coding.extend(dna.location_sequence(&piece)?);
                }
                translate(&coding)
            }
            SeqType::TranscriptExon => {
                return segments
                    .iter()
                    .map(|segment| dna.location_sequence(&segment.location))
                    .collect();
            }
            SeqType::GeneExon => {
                let mut exons = segments
                    .iter()
                    .map(|segment| segment.location.clone())
                    .collect::<Vec<_>>();
                exons.sort_by_key(|location| (location.start(), location.end()));
                exons.dedup();
                if exons.first().is_some_and(|exon| exon.strand().is_reverse()) {
                    exons.reverse();
                }
                return exons
                    .iter()
                    .map(|exon| dna.location_sequence(exon))
                    .collect();
            }
            SeqType::TranscriptExonIntron | SeqType::GeneExonIntron => match span(&segments) {
                Some(span) => {
                    dna.location_sequence(&span.extend_left_flank(left).extend_right_flank(right))?
                }
                None => return Ok(Vec::new()),
            },
            SeqType::UpstreamTranscriptFlank | SeqType::UpstreamGeneFlank => {
                match span(&segments) {
                    Some(span) => dna.location_sequence(&span.left_flank_only(left))?,
                    None => return Ok(Vec::new()),
                }
            }
            SeqType::DownstreamTranscriptFlank | SeqType::DownstreamGeneFlank => {
                match span(&segments) {
                    Some(span) => dna.location_sequence(&span.right_flank_only(right))?,
                    None => return Ok(Vec::new()),
                }
            }
            SeqType::ThreeUtr | SeqType::FiveUtr => {
                let pieces = utr_pieces(&segments, self == SeqType::ThreeUtr);
                if pieces.is_empty() {
                    tracing::debug!(key = entity.key, seq_type = self.name(), "no utr annotated");
                    NO_UTR_SENTINEL.as_bytes().to_vec()
                } else if self == SeqType::ThreeUtr {
                    flanked(pieces, 0, right, dna)?
                } else {
                    flanked(pieces, left, 0, dna)?
                }
            }
        };
        Ok(vec![body])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub rank: i64,
    pub location: SequenceLocation,
    pub coding: Option<(i64, i64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub key: i64,
    headers: Vec<Vec<String>>,
    segments: Vec<Segment>,
    payload: Option<String>,
}

impl EntityRecord {
    pub fn new(key: i64, header_count: usize) -> Self {
        Self {
            key,
            headers: vec![Vec::new(); header_count],
            segments: Vec::new(),
            payload: None,
        }
    }

    /// Adds one row: header column values, then the type's structure fields in order.
    pub fn absorb(&mut self, seq_type: SeqType, headers: &[Value], fields: &[Value]) {
        for (column, value) in self.headers.iter_mut().zip(headers) {
            if let Some(text) = value.as_text().filter(|text| !text.is_empty())
                && !column.contains(&text)
            {
                column.push(text);
            }
        }

        match seq_type {
            SeqType::Uniprot => {
                if self.payload.is_none() {
                    self.payload = fields.first().and_then(Value::as_text);
                }
            }
            SeqType::Snp => {
                let (Some(chromosome), Some(start)) = (text_at(fields, 0), int_at(fields, 1))
                else {
                    tracing::debug!(key = self.key, "snp row without a position");
                    return;
                };
                let strand = Strand::from_value(int_at(fields, 2).unwrap_or(1));
                self.push_segment(Segment {
                    rank: 0,
                    location: SequenceLocation::new(chromosome, start, start, strand),
                    coding: None,
                });
                if self.payload.is_none() {
                    self.payload = text_at(fields, 3);
                }
            }
            _ => {
                let (Some(chromosome), Some(start), Some(end)) =
                    (text_at(fields, 1), int_at(fields, 2), int_at(fields, 3))
                else {
                    tracing::debug!(key = self.key, "structure row without coordinates");
                    return;
                };
                let strand = Strand::from_value(int_at(fields, 4).unwrap_or(1));
                let coding = match (int_at(fields, 5), int_at(fields, 6)) {
                    (Some(coding_start), Some(coding_end)) => Some((coding_start, coding_end)),
                    _ => None,
                };
                self.push_segment(Segment {
                    rank: int_at(fields, 0).unwrap_or(0),
                    location: SequenceLocation::new(chromosome, start, end, strand),
                    coding,
                });
            }
        }
    }

    /// One header per column, repeated values collapsed and joined with commas. Entities
    /// without header columns are labelled by their key.
    pub fn headers(&self) -> Vec<String> {
        if self.headers.is_empty() {
            return vec![self.key.to_string()];
        }
        self.headers.iter().map(|values| values.join(",")).collect()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn push_segment(&mut self, segment: Segment) {
        if !self.segments.contains(&segment) {
            self.segments.push(segment);
        }
    }

    fn ordered_segments(&self) -> Vec<Segment> {
        let mut segments = self.segments.clone();
        segments.sort_by_key(|segment| segment.rank);
        segments
    }
}

fn text_at(values: &[Value], index: usize) -> Option<String> {
    values
        .get(index)
        .and_then(Value::as_text)
        .filter(|text| !text.is_empty())
}

fn int_at(values: &[Value], index: usize) -> Option<i64> {
    values.get(index).and_then(Value::as_i64)
}

fn span(segments: &[Segment]) -> Option<SequenceLocation> {
    let (first, rest) = segments.split_first()?;
    Some(
        rest.iter()
            .fold(first.location.clone(), |span, segment| span.span(&segment.location)),
    )
}

fn coding_pieces(segments: &[Segment]) -> Vec<SequenceLocation> {
    segments
        .iter()
        .filter_map(|segment| {
            let (start, end) = segment.coding?;
            let location = &segment.location;
            Some(SequenceLocation::new(
                location.chromosome(),
                start,
                end,
                location.strand(),
            ))
        })
        .filter(|piece| !piece.is_empty())
        .collect()
}

/// Parts of each exon outside the coding region, on the 3' or 5' side.
fn utr_pieces(segments: &[Segment], three_prime: bool) -> Vec<SequenceLocation> {
    let bounds = segments.iter().filter_map(|segment| segment.coding);
    let (Some(cds_start), Some(cds_end)) = (
        bounds.clone().map(|(start, _)| start).min(),
        bounds.map(|(_, end)| end).max(),
    ) else {
        return Vec::new();
    };

    segments
        .iter()
        .filter_map(|segment| {
            let location = &segment.location;
            let before = location.start() as i64..=cds_start - 1;
            let after = cds_end + 1..=location.end() as i64;
            let reverse = location.strand().is_reverse();
            let range = if three_prime != reverse { after } else { before };
            let start = (*range.start()).max(location.start() as i64);
            let end = (*range.end()).min(location.end() as i64);
            (start <= end).then(|| {
                SequenceLocation::new(location.chromosome(), start, end, location.strand())
            })
        })
        .collect()
}

fn flanked(
    pieces: Vec<SequenceLocation>,
    left: u64,
    right: u64,
    dna: &mut dyn DnaSource,
) -> Result<Vec<u8>, MartError> {
    let mut body = Vec::new();
    if let Some(first) = pieces.first()
        && left > 0
    {
        body.extend(dna.location_sequence(&first.left_flank_only(left))?);
    }
    for piece in &pieces {
        body.extend(dna.location_sequence(piece)?);
    }
    if let Some(last) = pieces.last()
        && right > 0
    {
        body.extend(dna.location_sequence(&last.right_flank_only(right))?);
    }
    Ok(body)
}
