use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::share::{ShareAddress, ShareCredentials, is_share_relative};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sharemirror/config.toml";
pub const ENV_PREFIX: &str = "SHAREMIRROR_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("backup target '{target}' is missing: {}", missing.join(", "))]
    Incomplete {
        target: String,
        missing: Vec<String>,
    },

    #[error("backup target '{target}' has paths outside the share root: {}", fields.join(", "))]
    InvalidPaths { target: String, fields: Vec<String> },

    #[error("no backup target named '{0}'")]
    UnknownTarget(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub mount_root: PathBuf,
    pub stale_after_hours: u64,
    pub connect_timeout_secs: u64,
    pub reap_interval_secs: u64,
    pub deletion_policy: DeletionPolicy,
    pub logging: LoggingConfig,
    pub report: ReportConfig,
    pub targets: Vec<BackupTarget>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/sharemirror/locks.db"),
            mount_root: PathBuf::from("/mnt/shares"),
            stale_after_hours: 24,
            connect_timeout_secs: 10,
            reap_interval_secs: 3600,
            deletion_policy: DeletionPolicy::default(),
            logging: LoggingConfig::default(),
            report: ReportConfig::default(),
            targets: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Layer defaults, the TOML file, `SHAREMIRROR_*` env vars and CLI overrides, in that order.
    pub fn new<T: Serialize>(config_path: Option<&Path>, overrides: Option<&T>) -> Result<Self, ConfigError> {
        let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_after_hours as i64)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn target(&self, name: &str) -> Result<&BackupTarget, ConfigError> {
        self.targets
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))
    }
}

/// What to do with destination entries that no longer exist in the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionPolicy {
    /// Never delete; destinations only grow.
    #[default]
    Accumulate,
    /// Remove destination entries that are absent from the source.
    Mirror,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportChannelType {
    None,
    #[default]
    Log,
    Webhook,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub channel: ReportChannelType,
    pub webhook_url: Option<String>,
}

/// One independently scheduled replication job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupTarget {
    pub name: String,
    /// Seconds between scheduled runs in daemon mode.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    pub source: SourceEndpoint,
    pub destination: DestinationEndpoint,
    pub paths: Vec<PathPair>,
}

fn default_interval_secs() -> u64 {
    24 * 60 * 60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceEndpoint {
    pub host: String,
    pub share: String,
    pub domain: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationEndpoint {
    /// Candidate hosts in failover order.
    pub hosts: Vec<String>,
    pub share: String,
    pub domain: String,
    pub username: String,
    pub password: String,
}

/// A source subtree and where it lands on the destination share.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPair {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl SourceEndpoint {
    pub fn address(&self) -> ShareAddress {
        ShareAddress::new(
            &self.host,
            &self.share,
            ShareCredentials {
                domain: self.domain.clone(),
                username: self.username.clone(),
                password: self.password.clone(),
            },
        )
    }
}

impl DestinationEndpoint {
    pub fn credentials(&self) -> ShareCredentials {
        ShareCredentials {
            domain: self.domain.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

impl BackupTarget {
    /// Fail with every missing field at once rather than the first one found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        let mut require = |value: &str, field: &str| {
            if value.trim().is_empty() {
                missing.push(field.to_string());
            }
        };

        require(&self.name, "name");
        require(&self.source.host, "source.host");
        require(&self.source.share, "source.share");
        require(&self.source.username, "source.username");
        require(&self.source.password, "source.password");
        require(&self.destination.share, "destination.share");
        require(&self.destination.username, "destination.username");
        require(&self.destination.password, "destination.password");

        if self.destination.hosts.iter().all(|h| h.trim().is_empty()) {
            missing.push("destination.hosts".to_string());
        }
        if self.paths.is_empty() {
            missing.push("paths".to_string());
        }

        let mut invalid = Vec::new();
        for (i, pair) in self.paths.iter().enumerate() {
            for (side, path) in [("source", &pair.source), ("destination", &pair.destination)] {
                let field = format!("paths[{}].{}", i, side);
                if path.as_os_str().is_empty() {
                    missing.push(field);
                } else if !is_share_relative(path) {
                    invalid.push(field);
                }
            }
        }

        let target = if self.name.is_empty() {
            "<unnamed>".to_string()
        } else {
            self.name.clone()
        };

        if !missing.is_empty() {
            Err(ConfigError::Incomplete { target, missing })
        } else if !invalid.is_empty() {
            Err(ConfigError::InvalidPaths {
                target,
                fields: invalid,
            })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
database_path = "/tmp/locks.db"
stale_after_hours = 12
deletion_policy = "mirror"

[report]
channel = "webhook"
webhook_url = "http://alerts.local/hook"

[[targets]]
name = "LV1"
interval_secs = 3600

[targets.source]
host = "fs01"
share = "projects"
username = "svc"
password = "secret"

[targets.destination]
hosts = ["nas1", "nas2"]
share = "backup"
domain = "PLANT"
username = "svc"
password = "secret"

[[targets.paths]]
source = "Engineering"
destination = "LV1/Engineering"
"#;

    fn complete_target() -> BackupTarget {
        BackupTarget {
            name: "LV1".into(),
            interval_secs: 60,
            source: SourceEndpoint {
                host: "fs01".into(),
                share: "projects".into(),
                domain: String::new(),
                username: "svc".into(),
                password: "pw".into(),
            },
            destination: DestinationEndpoint {
                hosts: vec!["nas1".into()],
                share: "backup".into(),
                domain: String::new(),
                username: "svc".into(),
                password: "pw".into(),
            },
            paths: vec![PathPair {
                source: "a".into(),
                destination: "b".into(),
            }],
        }
    }

    #[test]
    fn loads_toml_over_defaults() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = AppConfig::new(Some(&path), None::<&()>).unwrap();

        assert_eq!(config.stale_after_hours, 12);
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.deletion_policy, DeletionPolicy::Mirror);
        assert_eq!(config.report.channel, ReportChannelType::Webhook);
        assert_eq!(config.targets.len(), 1);

        let target = config.target("LV1").unwrap();
        assert_eq!(target.destination.hosts, vec!["nas1", "nas2"]);
        assert_eq!(target.paths[0].destination, PathBuf::from("LV1/Engineering"));
        assert!(target.validate().is_ok());
        assert!(matches!(
            config.target("LV9"),
            Err(ConfigError::UnknownTarget(_))
        ));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempdir().unwrap();
        let config = AppConfig::new(Some(&temp.path().join("absent.toml")), None::<&()>).unwrap();
        assert_eq!(config.stale_after(), chrono::Duration::hours(24));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert!(config.targets.is_empty());
    }

    #[test]
    fn validate_lists_every_missing_field() {
        let mut target = complete_target();
        target.source.password.clear();
        target.destination.hosts.clear();
        target.paths.clear();

        match target.validate() {
            Err(ConfigError::Incomplete { target, missing }) => {
                assert_eq!(target, "LV1");
                assert_eq!(
                    missing,
                    vec!["source.password", "destination.hosts", "paths"]
                );
            }
            other => panic!("expected Incomplete, got {:?}", other),
        }
    }

    #[test]
    fn empty_path_pair_is_missing() {
        let mut target = complete_target();
        target.paths.push(PathPair {
            source: PathBuf::new(),
            destination: "LV1/Other".into(),
        });

        match target.validate() {
            Err(ConfigError::Incomplete { missing, .. }) => {
                assert_eq!(missing, vec!["paths[1].source"]);
            }
            other => panic!("expected Incomplete, got {:?}", other),
        }
    }

    #[test]
    fn paths_leaving_the_share_are_rejected() {
        let mut target = complete_target();
        target.paths = vec![
            PathPair {
                source: "Projects".into(),
                destination: "/srv/escaped".into(),
            },
            PathPair {
                source: "../other-share".into(),
                destination: "LV1/Other".into(),
            },
        ];

        match target.validate() {
            Err(ConfigError::InvalidPaths { target, fields }) => {
                assert_eq!(target, "LV1");
                assert_eq!(fields, vec!["paths[0].destination", "paths[1].source"]);
            }
            other => panic!("expected InvalidPaths, got {:?}", other),
        }
    }

    #[test]
    fn complete_target_validates() {
        assert!(complete_target().validate().is_ok());
    }
}
