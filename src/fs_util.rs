use std::fs;
use std::io::{self, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::NamedTempFile;

use crate::error::MartError;

/// Output file that only appears at its destination once [`AtomicOutput::commit`]
/// succeeds. Dropping it uncommitted removes the temporary file.
pub struct AtomicOutput {
    writer: BufWriter<NamedTempFile>,
    dest: Utf8PathBuf,
}

impl AtomicOutput {
    pub fn create(dest: &Utf8Path) -> Result<Self, MartError> {
        let parent = match dest.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        };
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| MartError::Filesystem(format!("create {parent}: {err}")))?;
        let temp = tempfile::Builder::new()
            .prefix("martq-out")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| MartError::Filesystem(err.to_string()))?;
        Ok(Self {
            writer: BufWriter::new(temp),
            dest: dest.to_path_buf(),
        })
    }

    pub fn commit(self) -> Result<Utf8PathBuf, MartError> {
        let temp = self
            .writer
            .into_inner()
            .map_err(|err| MartError::Filesystem(err.error().to_string()))?;
        temp.persist(self.dest.as_std_path())
            .map_err(|err| MartError::Filesystem(format!("persist {}: {err}", self.dest)))?;
        Ok(self.dest)
    }
}

impl Write for AtomicOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_appears_on_commit() {
        let temp = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::from_path_buf(temp.path().join("out").join("genes.tsv")).unwrap();

        let mut output = AtomicOutput::create(&dest).unwrap();
        output.write_all(b"G1\tG2\n").unwrap();
        assert!(!dest.exists());
        let written = output.commit().unwrap();
        assert_eq!(written, dest);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "G1\tG2\n");
    }

    #[test]
    fn dropped_output_leaves_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let dest = Utf8PathBuf::from_path_buf(temp.path().join("genes.tsv")).unwrap();
        {
            let mut output = AtomicOutput::create(&dest).unwrap();
            output.write_all(b"partial").unwrap();
        }
        assert!(!dest.exists());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }
}
