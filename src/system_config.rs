// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};

use canonical_error::{CanonicalError, invalid_argument_error};
use log::warn;

/// Site and optics facts shared by the servers and the client tools.
/// Loaded from a `key = value` file; anything missing keeps its default.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub telescope: String,
    pub focal_length_mm: f64,
    // Arcsec per unbinned pixel.
    pub pixel_scale_arcsec: f64,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub camera_server: String,
    pub scope_server: String,
    pub mount: String,
    pub image_dir: PathBuf,
    pub filter_config: Option<PathBuf>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            telescope: "C14".to_string(),
            focal_length_mm: 2800.0,
            pixel_scale_arcsec: 0.56,
            latitude_deg: 41.57,
            longitude_deg: -71.3,
            camera_server: "127.0.0.1:16007".to_string(),
            scope_server: "127.0.0.1:16011".to_string(),
            mount: "127.0.0.1:3490".to_string(),
            image_dir: PathBuf::from("/home/ASTRO/IMAGES"),
            filter_config: None,
        }
    }
}

impl SystemConfig {
    pub fn parse(text: &str) -> Result<SystemConfig, CanonicalError> {
        let mut config = SystemConfig::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(
                || invalid_argument_error(
                    format!("config line {}: missing '='", lineno + 1).as_str()))?;
            let key = key.trim();
            let value = value.trim();
            let bad_number = || invalid_argument_error(
                format!("config line {}: bad number", lineno + 1).as_str());
            match key {
                "telescope" => config.telescope = value.to_string(),
                "focal_length_mm" =>
                    config.focal_length_mm = value.parse().map_err(|_| bad_number())?,
                "pixel_scale_arcsec" =>
                    config.pixel_scale_arcsec = value.parse().map_err(|_| bad_number())?,
                "latitude_deg" =>
                    config.latitude_deg = value.parse().map_err(|_| bad_number())?,
                "longitude_deg" =>
                    config.longitude_deg = value.parse().map_err(|_| bad_number())?,
                "camera_server" => config.camera_server = value.to_string(),
                "scope_server" => config.scope_server = value.to_string(),
                "mount" => config.mount = value.to_string(),
                "image_dir" => config.image_dir = PathBuf::from(value),
                "filter_config" =>
                    config.filter_config = Some(PathBuf::from(value)),
                _ => warn!("Unknown config key: {}", key),
            }
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<SystemConfig, CanonicalError> {
        let text = std::fs::read_to_string(path).map_err(
            |e| invalid_argument_error(
                format!("cannot read config {:?}: {}", path, e).as_str()))?;
        SystemConfig::parse(&text)
    }

    /// Loads the file named by NIGHTWATCH_CONFIG, if set; otherwise the
    /// defaults.
    pub fn load_default() -> SystemConfig {
        match std::env::var("NIGHTWATCH_CONFIG") {
            Ok(path) => match SystemConfig::load(Path::new(&path)) {
                Ok(config) => config,
                Err(e) => {
                    warn!("Config load failed ({}); using defaults", e.message);
                    SystemConfig::default()
                }
            },
            Err(_) => SystemConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let config = SystemConfig::parse(
            "# site\n\
             telescope = AP1600\n\
             pixel_scale_arcsec = 1.2\n\
             camera_server = otherhost:16007\n").unwrap();
        assert_eq!(config.telescope, "AP1600");
        assert_eq!(config.pixel_scale_arcsec, 1.2);
        assert_eq!(config.camera_server, "otherhost:16007");
        // Unspecified keys keep their defaults.
        assert_eq!(config.focal_length_mm, 2800.0);
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(SystemConfig::parse("telescope C14").is_err());
        assert!(SystemConfig::parse("focal_length_mm = abc").is_err());
    }

}  // mod tests.
