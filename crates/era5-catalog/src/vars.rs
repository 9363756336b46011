//! Parameter-code catalog: grib code to variable names.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{CatalogError, CatalogResult};
use crate::stream::Stream;

/// One catalog entry. A missing `cds_name` means the code is known but has
/// no downloadable counterpart on the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VariableEntry {
    pub name: String,
    #[serde(default)]
    pub cds_name: Option<String>,
}

/// Outcome of resolving a parameter code. Unusable codes are a normal,
/// non-fatal state; callers log and move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Available { name: String, cds_name: String },
    NoRemoteName { name: String },
    Unknown,
}

/// Lookup table from parameter code (e.g. "167.128") to variable names.
#[derive(Debug, Clone, Deserialize)]
pub struct VariableCatalog {
    pub variables: BTreeMap<String, VariableEntry>,
}

impl VariableCatalog {
    /// Load the catalog for a stream. The fire-index stream has its own
    /// table; all other streams share the main one.
    pub fn load(config_dir: &Path, stream: Stream) -> CatalogResult<Self> {
        let fname = match stream {
            Stream::CemsFire => "indices.yaml",
            _ => "variables.yaml",
        };
        let path = config_dir.join(fname);

        let content = std::fs::read_to_string(&path).map_err(|source| CatalogError::Read {
            path: path.clone(),
            source,
        })?;

        let catalog: VariableCatalog =
            serde_yaml::from_str(&content).map_err(|source| CatalogError::Parse {
                path: path.clone(),
                source,
            })?;

        debug!(
            count = catalog.variables.len(),
            path = %path.display(),
            "Loaded variable catalog"
        );
        Ok(catalog)
    }

    pub fn resolve(&self, code: &str) -> Resolution {
        match self.variables.get(code) {
            Some(entry) => match &entry.cds_name {
                Some(cds_name) => Resolution::Available {
                    name: entry.name.clone(),
                    cds_name: cds_name.clone(),
                },
                None => Resolution::NoRemoteName {
                    name: entry.name.clone(),
                },
            },
            None => Resolution::Unknown,
        }
    }

}
