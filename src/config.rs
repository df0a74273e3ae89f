use std::path::{Path, PathBuf};

/// Name of the staging directory under the output root where the listener
/// buffers files before the final sort pass.
pub const TRANSIT_DIR_NAME: &str = "temp_transit";

/// Network coordinates of the remote query/retrieve archive.
///
/// Loading these values (from files, environment, flags) is the caller's
/// business; the crate only consumes the filled-in struct.
#[derive(Debug, Clone)]
pub struct PacsNodeConfig {
    /// Hostname or IP of the archive.
    pub host: String,
    /// DICOM port of the archive.
    pub port: u16,
    /// AE title the archive answers to.
    pub called_ae_title: String,
    /// AE title we present ourselves as (and the C-MOVE destination).
    pub calling_ae_title: String,
    /// Maximum PDU length accepted by our SCU side.
    pub max_pdu_length: u32,
}

impl PacsNodeConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        PacsNodeConfig {
            host: host.into(),
            port,
            called_ae_title: "ANY-SCP".to_string(),
            calling_ae_title: "HARVEST-SCU".to_string(),
            max_pdu_length: 16384,
        }
    }

    /// Socket address string in the `AET@host:port` form expected by the
    /// association layer.
    pub fn addr(&self) -> String {
        format!("{}@{}:{}", self.called_ae_title, self.host, self.port)
    }
}

/// Whether sorted files are grouped into one subdirectory per series or
/// dropped directly into the patient directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeriesLayout {
    /// `output/<patient>/<series_number>_<series_description>/<file>`
    #[default]
    PerSeries,
    /// `output/<patient>/<file>`
    FlatPatient,
}

/// On-disk layout of the output tree.
#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub output_dir: PathBuf,
    pub layout: SeriesLayout,
}

impl OutputLayout {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        OutputLayout {
            output_dir: output_dir.into(),
            layout: SeriesLayout::default(),
        }
    }

    pub fn with_layout(mut self, layout: SeriesLayout) -> Self {
        self.layout = layout;
        self
    }

    /// The staging area where the listener buffers incoming files.
    pub fn transit_dir(&self) -> PathBuf {
        self.output_dir.join(TRANSIT_DIR_NAME)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_includes_called_ae_title() {
        let mut config = PacsNodeConfig::new("pacs.example.org", 104);
        config.called_ae_title = "ARCHIVE".to_string();
        assert_eq!(config.addr(), "ARCHIVE@pacs.example.org:104");
    }

    #[test]
    fn transit_dir_is_under_output() {
        let layout = OutputLayout::new("/data/out");
        assert_eq!(layout.transit_dir(), PathBuf::from("/data/out/temp_transit"));
    }
}
