//! Stream descriptors: per-(stream, timestep) settings for the remote archive.
//!
//! Each descriptor lives in its own YAML document under `streams/`, named
//! `era5_<stream>_<tstep>.yaml`, and is loaded once at startup.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;

use crate::error::{CatalogError, CatalogResult};

/// Reanalysis product category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Surface,
    Pressure,
    Wave,
    Land,
    CemsFire,
    Agera5,
    Wfde5,
}

impl Stream {
    pub const ALL: &'static [Stream] = &[
        Stream::Surface,
        Stream::Pressure,
        Stream::Wave,
        Stream::Land,
        Stream::CemsFire,
        Stream::Agera5,
        Stream::Wfde5,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Surface => "surface",
            Stream::Pressure => "pressure",
            Stream::Wave => "wave",
            Stream::Land => "land",
            Stream::CemsFire => "cems_fire",
            Stream::Agera5 => "agera5",
            Stream::Wfde5 => "wfde5",
        }
    }

    /// Dataset-family tag used in output filenames. Derived products carry a
    /// stream suffix, the reanalysis streams share the base tag.
    pub fn product_tag(&self) -> &'static str {
        match self {
            Stream::Land => "era5land",
            Stream::CemsFire => "era5fire",
            Stream::Agera5 => "era5agro",
            _ => "era5",
        }
    }

    /// Whether this stream is a derived product stored under the derived
    /// data root rather than the main data root.
    pub fn is_derived(&self) -> bool {
        matches!(self, Stream::CemsFire | Stream::Agera5 | Stream::Wfde5)
    }

    /// First year with published data for this stream.
    pub fn start_year(&self) -> i32 {
        match self {
            Stream::Land => 1981,
            _ => 1979,
        }
    }
}

impl FromStr for Stream {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "surface" => Ok(Stream::Surface),
            "pressure" => Ok(Stream::Pressure),
            "wave" => Ok(Stream::Wave),
            "land" => Ok(Stream::Land),
            "cems_fire" => Ok(Stream::CemsFire),
            "agera5" => Ok(Stream::Agera5),
            "wfde5" => Ok(Stream::Wfde5),
            other => Err(CatalogError::UnknownStream(other.to_string())),
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Temporal granularity of a requested file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timestep {
    Hour,
    Day,
    Month,
}

impl Timestep {
    /// Short tag used in descriptor filenames and output filenames.
    pub fn tag(&self) -> &'static str {
        match self {
            Timestep::Hour => "hr",
            Timestep::Day => "day",
            Timestep::Month => "mon",
        }
    }
}

impl FromStr for Timestep {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hr" => Ok(Timestep::Hour),
            "day" => Ok(Timestep::Day),
            "mon" => Ok(Timestep::Month),
            other => Err(CatalogError::UnknownTimestep(other.to_string())),
        }
    }
}

impl fmt::Display for Timestep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Output format requested from the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Netcdf,
    Grib,
    Zip,
    Tgz,
}

impl OutputFormat {
    /// Name used in the request payload.
    pub fn request_name(&self) -> &'static str {
        match self {
            OutputFormat::Netcdf => "netcdf",
            OutputFormat::Grib => "grib",
            OutputFormat::Zip => "zip",
            OutputFormat::Tgz => "tgz",
        }
    }

    /// On-disk extension. The interchange format normalizes to the short
    /// form, everything else keeps the request name.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Netcdf => "nc",
            OutputFormat::Grib => "grib",
            OutputFormat::Zip => "zip",
            OutputFormat::Tgz => "tgz",
        }
    }

    /// Valid (format, stream) combinations: archive formats for the derived
    /// products, netcdf/grib for the reanalysis streams.
    pub fn valid_for(&self, stream: Stream) -> bool {
        match self {
            OutputFormat::Zip | OutputFormat::Tgz => stream.is_derived(),
            OutputFormat::Netcdf | OutputFormat::Grib => !stream.is_derived(),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "netcdf" => Ok(OutputFormat::Netcdf),
            "grib" => Ok(OutputFormat::Grib),
            "zip" => Ok(OutputFormat::Zip),
            "tgz" => Ok(OutputFormat::Tgz),
            other => Err(CatalogError::UnknownFormat(other.to_string())),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.request_name())
    }
}

/// Static settings for one (stream, timestep) combination.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamDescriptor {
    /// Remote dataset identifier, e.g. "reanalysis-era5-single-levels".
    pub dsid: String,
    #[serde(default)]
    pub product_type: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    /// Grid resolution label used in filenames, e.g. "025".
    pub grid: String,
    /// Geographic bounding box as [north, west, south, east].
    pub area: Vec<f64>,
    /// Vertical level list; empty for surface-type streams.
    #[serde(default)]
    pub levels: Vec<String>,
    /// Parameter codes routinely fetched for this stream.
    #[serde(default)]
    pub params: Vec<String>,
}

impl StreamDescriptor {
    /// Load the descriptor for `name` (a stream key such as "surface" or the
    /// legacy "pressure51") at the given timestep.
    pub fn load(config_dir: &Path, name: &str, tstep: Timestep) -> CatalogResult<Self> {
        let path = config_dir
            .join("streams")
            .join(format!("era5_{}_{}.yaml", name, tstep.tag()));

        if !path.exists() {
            return Err(CatalogError::DescriptorNotFound {
                stream: name.to_string(),
                tstep: tstep.tag().to_string(),
            });
        }

        let content = std::fs::read_to_string(&path).map_err(|source| CatalogError::Read {
            path: path.clone(),
            source,
        })?;

        let desc: StreamDescriptor =
            serde_yaml::from_str(&content).map_err(|source| CatalogError::Parse {
                path: path.clone(),
                source,
            })?;

        debug!(dsid = %desc.dsid, path = %path.display(), "Loaded stream descriptor");
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_roundtrip() {
        for s in Stream::ALL {
            assert_eq!(&Stream::from_str(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn test_product_tags() {
        assert_eq!(Stream::Surface.product_tag(), "era5");
        assert_eq!(Stream::Land.product_tag(), "era5land");
        assert_eq!(Stream::CemsFire.product_tag(), "era5fire");
        assert_eq!(Stream::Agera5.product_tag(), "era5agro");
    }

    #[test]
    fn test_netcdf_extension_short_form() {
        assert_eq!(OutputFormat::Netcdf.extension(), "nc");
        assert_eq!(OutputFormat::Netcdf.request_name(), "netcdf");
        assert_eq!(OutputFormat::Grib.extension(), "grib");
    }

    #[test]
    fn test_format_stream_validity() {
        assert!(OutputFormat::Netcdf.valid_for(Stream::Surface));
        assert!(OutputFormat::Tgz.valid_for(Stream::CemsFire));
        assert!(!OutputFormat::Tgz.valid_for(Stream::Surface));
        assert!(!OutputFormat::Netcdf.valid_for(Stream::Agera5));
    }

    #[test]
    fn test_parse_surface_descriptor() {
        let yaml = r#"
dsid: reanalysis-era5-single-levels
product_type: reanalysis
grid: "025"
area: [90.0, -180.0, -90.0, 180.0]
levels: []
params:
  - "167.128"
  - "228.128"
"#;
        let desc: StreamDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.dsid, "reanalysis-era5-single-levels");
        assert_eq!(desc.product_type.as_deref(), Some("reanalysis"));
        assert!(desc.levels.is_empty());
        assert_eq!(desc.params.len(), 2);
    }

    #[test]
    fn test_parse_pressure_descriptor_with_levels() {
        let yaml = r#"
dsid: reanalysis-era5-pressure-levels
product_type: reanalysis
grid: "025"
area: [20.0, 78.0, -57.0, -140.0]
levels: ["850", "925", "1000"]
"#;
        let desc: StreamDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(desc.levels, vec!["850", "925", "1000"]);
        assert!(desc.params.is_empty());
    }
}
