use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::db::{Dialect, SqliteDataSource};
use crate::dna::ChunkTableSpec;
use crate::error::MartError;
use crate::format::DEFAULT_FASTA_WIDTH;
use crate::runner::BatchSettings;

pub const DEFAULT_CONFIG_FILE: &str = "mart.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub datasource: Option<DataSourceEntry>,
    #[serde(default)]
    pub batching: BatchingEntry,
    #[serde(default)]
    pub sequence_store: Option<String>,
    #[serde(default)]
    pub fasta_line_width: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DataSourceEntry {
    Shorthand(String),
    Detailed(DataSourceObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DataSourceObject {
    pub path: String,
    #[serde(default)]
    pub dialect: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BatchingEntry {
    pub initial_batch: Option<usize>,
    pub max_batch: Option<usize>,
    pub growth_factors: Option<Vec<usize>>,
    pub id_list_batch: Option<usize>,
    pub max_big_id_lists: Option<usize>,
    pub max_key_rows: Option<usize>,
    pub max_sequence_key_rows: Option<usize>,
    pub max_total_rows: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceSettings {
    pub path: Utf8PathBuf,
    pub dialect: Dialect,
    pub name: Option<String>,
}

impl DataSourceSettings {
    pub fn open(&self) -> SqliteDataSource {
        let source = SqliteDataSource::new(self.path.clone(), self.dialect);
        match &self.name {
            Some(name) => source.with_name(name.clone()),
            None => source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub datasource: DataSourceSettings,
    pub batching: BatchSettings,
    pub sequence_store: Option<ChunkTableSpec>,
    pub fasta_line_width: usize,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `mart.json` in the working directory. A relative datasource path
    /// is taken relative to the config file.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, MartError> {
        let config_path = Utf8PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));

        if path.is_none() && !config_path.exists() {
            return Err(MartError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| MartError::ConfigRead(config_path.clone().into_std_path_buf()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| MartError::ConfigParse(err.to_string()))?;

        let mut resolved = Self::resolve_config(config)?;
        if let Some(parent) = config_path.parent() {
            resolved.datasource.path = rebase(parent, &resolved.datasource.path);
        }
        tracing::debug!(
            config = %config_path,
            datasource = %resolved.datasource.path,
            dialect = %resolved.datasource.dialect,
            "config resolved"
        );
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, MartError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let datasource = match config.datasource {
            Some(DataSourceEntry::Shorthand(path)) => DataSourceSettings {
                path: Utf8PathBuf::from(path),
                dialect: Dialect::Generic,
                name: None,
            },
            Some(DataSourceEntry::Detailed(obj)) => DataSourceSettings {
                path: Utf8PathBuf::from(obj.path),
                dialect: obj
                    .dialect
                    .as_deref()
                    .map(Dialect::from_tag)
                    .unwrap_or_default(),
                name: obj.name,
            },
            None => {
                return Err(MartError::ConfigParse(
                    "missing \"datasource\" entry".to_string(),
                ));
            }
        };

        let batching = resolve_batching(config.batching)?;

        let sequence_store = config
            .sequence_store
            .as_deref()
            .map(str::parse::<ChunkTableSpec>)
            .transpose()?;

        let fasta_line_width = match config.fasta_line_width {
            Some(0) => {
                return Err(MartError::ConfigParse(
                    "fasta_line_width must be positive".to_string(),
                ));
            }
            Some(width) => width,
            None => DEFAULT_FASTA_WIDTH,
        };

        Ok(ResolvedConfig {
            schema_version,
            datasource,
            batching,
            sequence_store,
            fasta_line_width,
        })
    }
}

fn resolve_batching(entry: BatchingEntry) -> Result<BatchSettings, MartError> {
    let defaults = BatchSettings::default();
    let settings = BatchSettings {
        initial_batch: entry.initial_batch.unwrap_or(defaults.initial_batch),
        max_batch: entry.max_batch.unwrap_or(defaults.max_batch),
        growth_factors: entry.growth_factors.unwrap_or(defaults.growth_factors),
        id_list_batch: entry.id_list_batch.unwrap_or(defaults.id_list_batch),
        max_big_id_lists: entry.max_big_id_lists.unwrap_or(defaults.max_big_id_lists),
        max_key_rows: entry.max_key_rows.unwrap_or(defaults.max_key_rows),
        max_sequence_key_rows: entry
            .max_sequence_key_rows
            .unwrap_or(defaults.max_sequence_key_rows),
        max_total_rows: entry.max_total_rows.unwrap_or(defaults.max_total_rows),
    };

    let positive = [
        ("initial_batch", settings.initial_batch),
        ("max_batch", settings.max_batch),
        ("id_list_batch", settings.id_list_batch),
        ("max_key_rows", settings.max_key_rows),
        ("max_sequence_key_rows", settings.max_sequence_key_rows),
        ("max_total_rows", settings.max_total_rows),
    ];
    if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
        return Err(MartError::ConfigParse(format!("batching.{name} must be positive")));
    }
    if settings.growth_factors.contains(&0) {
        return Err(MartError::ConfigParse(
            "batching.growth_factors must be positive".to_string(),
        ));
    }
    if settings.max_batch < settings.initial_batch {
        return Err(MartError::ConfigParse(format!(
            "batching.max_batch ({}) is smaller than batching.initial_batch ({})",
            settings.max_batch, settings.initial_batch
        )));
    }
    Ok(settings)
}

fn rebase(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() || base.as_str().is_empty() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_config_shorthand() {
        let config = Config {
            datasource: Some(DataSourceEntry::Shorthand("mart.sqlite".to_string())),
            ..Config::default()
        };

        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.schema_version, 1);
        assert_eq!(resolved.datasource.dialect, Dialect::Generic);
        assert_eq!(resolved.batching, BatchSettings::default());
        assert_eq!(resolved.fasta_line_width, DEFAULT_FASTA_WIDTH);
        assert!(resolved.sequence_store.is_none());
    }

    #[test]
    fn missing_datasource_is_rejected() {
        let err = ConfigLoader::resolve_config(Config::default()).unwrap_err();
        assert_matches!(err, MartError::ConfigParse(_));
    }

    #[test]
    fn batch_bounds_are_checked() {
        let config = Config {
            datasource: Some(DataSourceEntry::Shorthand("mart.sqlite".to_string())),
            batching: BatchingEntry {
                initial_batch: Some(100),
                max_batch: Some(10),
                ..BatchingEntry::default()
            },
            ..Config::default()
        };
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, MartError::ConfigParse(_));
    }

    #[test]
    fn relative_paths_follow_config_file() {
        assert_eq!(
            rebase(Utf8Path::new("conf"), Utf8Path::new("mart.sqlite")),
            Utf8PathBuf::from("conf/mart.sqlite")
        );
        assert_eq!(
            rebase(Utf8Path::new(""), Utf8Path::new("mart.sqlite")),
            Utf8PathBuf::from("mart.sqlite")
        );
    }
}
