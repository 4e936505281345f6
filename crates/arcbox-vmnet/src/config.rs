//! Interface configuration from files and environment.
//!
//! Sources, later ones winning:
//!
//! 1. Default values
//! 2. A TOML file
//! 3. Environment variables (`VMNET_*`, nested keys separated by `__`)
//!
//! ## Example Configuration File
//!
//! ```toml
//! mode = "shared"
//! uuid = "67e55044-10b1-426f-9247-bb680e5fe0c8"
//!
//! [ipv4]
//! start = "192.168.105.2"
//! end = "192.168.105.254"
//! netmask = "255.255.255.0"
//! ```
//!
//! For bridged mode set `mode = "bridged"` and `bridge_interface = "en0"`.

use std::path::Path;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VmnetError};
use crate::interface::{InterfaceConfig, Ipv4Config, Mode};

/// Operating mode as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeSetting {
    /// Host-only.
    Host,
    /// Shared (NAT).
    #[default]
    Shared,
    /// Bridged; requires `bridge_interface`.
    Bridged,
}

/// vmnet interface settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmnetSettings {
    /// Operating mode.
    pub mode: ModeSetting,
    /// Host interface to bridge onto.
    pub bridge_interface: Option<String>,
    /// Fixed interface identifier. Keeps the MAC address stable across runs.
    pub uuid: Option<Uuid>,
    /// DHCP range for shared mode.
    pub ipv4: Option<Ipv4Config>,
}

impl VmnetSettings {
    /// Loads settings from `path` and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns [`VmnetError::Config`] if a source cannot be parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("VMNET_").split("__"))
            .extract()?)
    }

    /// Parses settings from a TOML string, ignoring the environment.
    ///
    /// # Errors
    ///
    /// Returns [`VmnetError::Config`] if the string cannot be parsed.
    pub fn from_toml(toml: &str) -> Result<Self> {
        Ok(Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?)
    }

    /// Validates the settings and converts them into an interface config.
    ///
    /// # Errors
    ///
    /// Returns [`VmnetError::Config`] for bridged mode without an interface.
    pub fn into_config(self) -> Result<InterfaceConfig> {
        let mode = match self.mode {
            ModeSetting::Host => Mode::Host,
            ModeSetting::Shared => Mode::Shared,
            ModeSetting::Bridged => match self.bridge_interface {
                Some(name) if !name.is_empty() => Mode::Bridged(name),
                _ => {
                    return Err(VmnetError::config(
                        "bridged mode requires bridge_interface",
                    ));
                }
            },
        };

        Ok(InterfaceConfig {
            mode,
            uuid: self.uuid,
            ipv4: self.ipv4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;

    #[test]
    fn test_defaults() {
        let config = VmnetSettings::from_toml("").unwrap().into_config().unwrap();
        assert_eq!(config, InterfaceConfig::shared());
    }

    #[test]
    fn test_shared_with_range() {
        let settings = VmnetSettings::from_toml(
            r#"
            mode = "shared"
            uuid = "67e55044-10b1-426f-9247-bb680e5fe0c8"

            [ipv4]
            start = "192.168.105.2"
            end = "192.168.105.254"
            netmask = "255.255.255.0"
            "#,
        )
        .unwrap();

        let config = settings.into_config().unwrap();
        assert_eq!(config.mode, Mode::Shared);
        assert_eq!(
            config.uuid,
            Some(Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap())
        );
        assert_eq!(
            config.ipv4,
            Some(Ipv4Config::new(
                Ipv4Addr::new(192, 168, 105, 2),
                Ipv4Addr::new(192, 168, 105, 254),
                Ipv4Addr::new(255, 255, 255, 0),
            ))
        );
    }

    #[test]
    fn test_bridged() {
        let settings =
            VmnetSettings::from_toml("mode = \"bridged\"\nbridge_interface = \"en0\"").unwrap();
        assert_eq!(
            settings.into_config().unwrap().mode,
            Mode::Bridged("en0".to_string())
        );
    }

    #[test]
    fn test_bridged_without_interface() {
        let settings = VmnetSettings::from_toml("mode = \"bridged\"").unwrap();
        assert!(matches!(
            settings.into_config(),
            Err(VmnetError::Config(_))
        ));
    }

    #[test]
    fn test_incomplete_range_rejected() {
        let err = VmnetSettings::from_toml("[ipv4]\nstart = \"192.168.105.2\"").unwrap_err();
        assert!(matches!(err, VmnetError::Config(_)));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(VmnetSettings::from_toml("mode = \"wifi\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mode = \"host\"").unwrap();

        let settings = VmnetSettings::load_from(file.path()).unwrap();
        assert_eq!(settings.mode, ModeSetting::Host);
    }

    #[test]
    fn test_load_from_missing_file() {
        let settings = VmnetSettings::load_from("/nonexistent/vmnet.toml").unwrap();
        assert_eq!(settings.mode, ModeSetting::Shared);
    }
}
