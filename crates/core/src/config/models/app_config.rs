use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    driver_node::{DriverConfig, NodeConfig},
    load_balancing::LoadBalancingConfig,
};
use crate::logging::LogConfig;

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub driver: DriverConfig,
    pub node: NodeConfig,
    pub load_balancing: LoadBalancingConfig,
    pub logging: LogConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TASKGRID_)
    ///
    /// # Arguments
    ///
    /// * `config_path` - Config file path, if None use default paths
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/taskgrid.toml",
                "taskgrid.toml",
                "/etc/taskgrid/config.toml",
            ];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKGRID")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.driver.validate().context("Driver配置验证失败")?;
        self.node.validate().context("Node配置验证失败")?;
        self.load_balancing
            .validate()
            .context("负载均衡配置验证失败")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Algorithm;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.load_balancing.algorithm, Algorithm::Proportional);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::from_toml(
            r#"
            [driver]
            bind_address = "127.0.0.1:0"
            admin_password = "secret"

            [load_balancing]
            algorithm = "fixed"
            size = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.driver.admin_password, "secret");
        assert_eq!(config.load_balancing.algorithm, Algorithm::Fixed);
        assert_eq!(config.load_balancing.size, 4);

        let text = config.to_toml().unwrap();
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_section_is_rejected() {
        let err = AppConfig::from_toml("[load_balancing]\nmax_bundle_size = 0\n").unwrap_err();
        assert!(format!("{err:#}").contains("负载均衡配置验证失败"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[node]\nprocessing_threads = 3").unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.node.processing_threads, 3);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(AppConfig::load(Some("/nonexistent/taskgrid.toml")).is_err());
    }

    #[test]
    fn test_bundled_config_file() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/taskgrid.toml");
        let config = AppConfig::from_toml(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(config.load_balancing.algorithm, Algorithm::Proportional);
        assert_eq!(config.node.processing_threads, 4);
        assert_eq!(config.node.properties.get("zone").map(String::as_str), Some("default"));
    }
}
