// Optional configuration file: JSON with default image paths, merged
// beneath the command-line flags so a machine setup can be kept in one
// place.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// NOR flash (ROM) image.
    pub rom: Option<String>,
    /// EEPROM image.
    pub eeprom: Option<String>,
    /// CompactFlash image.
    pub compactflash: Option<String>,
    /// TF card image.
    pub tf_image: Option<String>,
    /// Host directory mounted for the guest.
    pub hostfs_root: Option<String>,
    /// Symbol map file for the debugger.
    pub map_file: Option<String>,
    /// Font binary loaded into the video board.
    pub font: Option<String>,
}

impl FileConfig {
    /// Load a config file; missing or invalid files fall back to defaults.
    pub fn load(path: &Path) -> FileConfig {
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(err) => {
                    log::error!("[CONFIG] invalid config {}: {}", path.display(), err);
                    FileConfig::default()
                }
            },
            Err(err) => {
                log::error!("[CONFIG] could not read {}: {}", path.display(), err);
                FileConfig::default()
            }
        }
    }
}
