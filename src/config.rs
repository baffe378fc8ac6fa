//! Top-level configuration aggregate. Each subsystem owns its own config
//! struct; `CoreConfig` just groups them for a single deserialization point
//! (e.g. one TOML/YAML file covering the whole client). Loading/watching a
//! config file from disk is out of scope for this crate.

use serde::Deserialize;

use crate::assembler::AssemblerConfig;
use crate::correlator::CorrelatorConfig;
use crate::decompose::DecomposerConfig;
use crate::ingest::IngestConfig;
use crate::recoverer::RecovererConfig;
use crate::table::TableBuilderConfig;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub decomposer: DecomposerConfig,
    pub recoverer: RecovererConfig,
    pub correlator: CorrelatorConfig,
    pub assembler: AssemblerConfig,
    pub table_builder: TableBuilderConfig,
    pub ingest: IngestConfig,
}
