use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    /// Mart tables store strand as `1` / `-1`; anything negative is the reverse strand.
    pub fn from_value(value: i64) -> Self {
        if value < 0 {
            Strand::Reverse
        } else {
            Strand::Forward
        }
    }

    pub fn is_reverse(self) -> bool {
        matches!(self, Strand::Reverse)
    }

    pub fn as_value(self) -> i64 {
        match self {
            Strand::Forward => 1,
            Strand::Reverse => -1,
        }
    }
}

/// A 1-based, inclusive genomic interval on one strand of a chromosome.
///
/// Starts are clamped to 1. A location whose end lies before its start is empty; flank
/// slicing produces such locations when there is nothing left of the chromosome start.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceLocation {
    chromosome: String,
    start: u64,
    end: u64,
    strand: Strand,
}

impl SequenceLocation {
    pub fn new(chromosome: impl Into<String>, start: i64, end: i64, strand: Strand) -> Self {
        Self {
            chromosome: chromosome.into(),
            start: start.max(1) as u64,
            end: end.max(0) as u64,
            strand,
        }
    }

    pub fn chromosome(&self) -> &str {
        &self.chromosome
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn strand(&self) -> Strand {
        self.strand
    }

    pub fn len(&self) -> u64 {
        if self.end >= self.start {
            self.end - self.start + 1
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extends the 5' side of the feature, which is the genomic left only on the forward strand.
    pub fn extend_left_flank(&self, length: u64) -> Self {
        match self.strand {
            Strand::Forward => self.with_bounds(self.start_i64() - length as i64, self.end_i64()),
            Strand::Reverse => self.with_bounds(self.start_i64(), self.end_i64() + length as i64),
        }
    }

    pub fn extend_right_flank(&self, length: u64) -> Self {
        match self.strand {
            Strand::Forward => self.with_bounds(self.start_i64(), self.end_i64() + length as i64),
            Strand::Reverse => self.with_bounds(self.start_i64() - length as i64, self.end_i64()),
        }
    }

    /// The `length` bases immediately 5' of the feature, excluding the feature itself.
    pub fn left_flank_only(&self, length: u64) -> Self {
        match self.strand {
            Strand::Forward => {
                self.with_bounds(self.start_i64() - length as i64, self.start_i64() - 1)
            }
            Strand::Reverse => self.with_bounds(self.end_i64() + 1, self.end_i64() + length as i64),
        }
    }

    /// The `length` bases immediately 3' of the feature, excluding the feature itself.
    pub fn right_flank_only(&self, length: u64) -> Self {
        match self.strand {
            Strand::Forward => self.with_bounds(self.end_i64() + 1, self.end_i64() + length as i64),
            Strand::Reverse => {
                self.with_bounds(self.start_i64() - length as i64, self.start_i64() - 1)
            }
        }
    }

    pub fn span(&self, other: &SequenceLocation) -> Self {
        Self {
            chromosome: self.chromosome.clone(),
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            strand: self.strand,
        }
    }

    fn start_i64(&self) -> i64 {
        self.start as i64
    }

    fn end_i64(&self) -> i64 {
        self.end as i64
    }

    fn with_bounds(&self, start: i64, end: i64) -> Self {
        Self::new(self.chromosome.clone(), start, end, self.strand)
    }
}

impl fmt::Display for SequenceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}-{}:{}",
            self.chromosome,
            self.start,
            self.end,
            self.strand.as_value()
        )
    }
}
