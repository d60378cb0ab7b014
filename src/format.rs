use std::io::{self, Write};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FASTA_WIDTH: usize = 80;
pub const FASTA_HEADER_SEPARATOR: char = '|';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    Tabulated,
    Fasta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSpec {
    pub kind: FormatKind,
    pub separator: char,
    pub line_width: usize,
}

impl FormatSpec {
    pub fn tabulated(separator: char) -> Self {
        Self {
            kind: FormatKind::Tabulated,
            separator,
            line_width: DEFAULT_FASTA_WIDTH,
        }
    }

    pub fn fasta() -> Self {
        Self {
            kind: FormatKind::Fasta,
            separator: FASTA_HEADER_SEPARATOR,
            line_width: DEFAULT_FASTA_WIDTH,
        }
    }

    pub fn with_line_width(mut self, width: usize) -> Self {
        self.line_width = width.max(1);
        self
    }

    pub fn is_fasta(&self) -> bool {
        matches!(self.kind, FormatKind::Fasta)
    }

    /// One record: a FASTA entry with a wrapped body, or a single tabulated line.
    pub fn write_record<W: Write + ?Sized>(
        &self,
        out: &mut W,
        headers: &[String],
        sequence: &[u8],
    ) -> io::Result<()> {
        let separator = self.separator.to_string();
        let header = headers.join(&separator);
        match self.kind {
            FormatKind::Fasta => {
                writeln!(out, ">{header}")?;
                for line in sequence.chunks(self.line_width) {
                    out.write_all(line)?;
                    out.write_all(b"\n")?;
                }
            }
            FormatKind::Tabulated => {
                out.write_all(header.as_bytes())?;
                if !headers.is_empty() {
                    out.write_all(separator.as_bytes())?;
                }
                out.write_all(sequence)?;
                out.write_all(b"\n")?;
            }
        }
        Ok(())
    }
}

pub fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'T' | b'U' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        b'a' => b't',
        b't' | b'u' => b'a',
        b'c' => b'g',
        b'g' => b'c',
        b'R' => b'Y',
        b'Y' => b'R',
        b'K' => b'M',
        b'M' => b'K',
        b'B' => b'V',
        b'V' => b'B',
        b'D' => b'H',
        b'H' => b'D',
        b'r' => b'y',
        b'y' => b'r',
        b'k' => b'm',
        b'm' => b'k',
        b'b' => b'v',
        b'v' => b'b',
        b'd' => b'h',
        b'h' => b'd',
        b'S' | b'W' | b'N' | b's' | b'w' | b'n' => base,
        _ => b'N',
    }
}

pub fn reverse_complement(bases: &[u8]) -> Vec<u8> {
    bases.iter().rev().map(|base| complement(*base)).collect()
}

// Standard genetic code, codons ordered TCAG at each position.
const AMINO_ACIDS: &[u8; 64] = b"FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";

fn base_index(base: u8) -> Option<usize> {
    match base.to_ascii_uppercase() {
        b'T' | b'U' => Some(0),
        b'C' => Some(1),
        b'A' => Some(2),
        b'G' => Some(3),
        _ => None,
    }
}

/// Translates complete codons; a trailing partial codon is dropped and codons with
/// ambiguous bases become `X`.
pub fn translate(bases: &[u8]) -> Vec<u8> {
    bases
        .chunks_exact(3)
        .map(|codon| {
            match (
                base_index(codon[0]),
                base_index(codon[1]),
                base_index(codon[2]),
            ) {
                (Some(first), Some(second), Some(third)) => {
                    AMINO_ACIDS[first * 16 + second * 4 + third]
                }
                _ => b'X',
            }
        })
        .collect()
}
