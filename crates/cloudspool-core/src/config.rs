// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connector configuration, read from a JSON file at startup.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CloudspoolError, Result};

/// Attributes copied from the spooler into each printer record when the
/// config does not name its own list.
pub const DEFAULT_PRINTER_ATTRIBUTES: &[&str] = &[
    "printer-make-and-model",
    "printer-location",
    "color-supported",
    "sides-supported",
    "media-supported",
    "document-format-supported",
    "copies-supported",
];

/// Complete connector settings. Every field except the robot refresh token
/// has a usable default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    // -- Identity --
    /// Name this proxy registers its printers under.
    pub proxy_name: String,
    /// Refresh token of the robot (service account) identity.
    pub robot_refresh_token: String,
    /// Refresh token of the owning user, needed only for sharing.
    pub user_refresh_token: Option<String>,
    /// Scope new printers are shared with (e.g. a domain or group address).
    pub share_scope: Option<String>,

    // -- OAuth --
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub oauth_token_url: String,

    // -- Cloud --
    pub cloud_base_url: String,
    /// WebSocket URL of the push channel.
    pub push_url: String,
    pub request_timeout_secs: u64,

    // -- Push keepalive --
    pub push_ping_timeout_secs: u64,
    pub push_ping_interval_default_secs: u64,
    pub push_ping_interval_min_secs: u64,
    pub push_reconnect_backoff_initial_ms: u64,
    pub push_reconnect_backoff_max_secs: u64,

    // -- Local spooler --
    pub cups_server_uri: String,
    pub cups_printer_poll_interval_secs: u64,
    /// Maximum jobs pending in the local spooler per printer.
    pub cups_job_queue_size: usize,
    /// Submit jobs with the owner's full address instead of the local part.
    pub cups_job_full_username: bool,
    pub cups_ignore_raw_printers: bool,
    /// Attribute names copied into printer records; empty means the default list.
    pub cups_printer_attributes: Vec<String>,
    /// Derive cloud display names from `printer-info`.
    pub copy_printer_info_to_display_name: bool,
    pub local_call_timeout_secs: u64,
    pub job_status_poll_interval_secs: u64,

    // -- Dispatch --
    pub max_concurrent_downloads: usize,
    pub download_max_attempts: u32,
    pub download_backoff_base_ms: u64,
    pub download_backoff_max_secs: u64,
    pub status_update_max_attempts: u32,
    pub status_update_backoff_base_ms: u64,
    pub status_update_backoff_max_secs: u64,
    pub shutdown_drain_timeout_secs: u64,

    // -- Diagnostics --
    pub monitor_socket_filename: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            proxy_name: "cloudspool".into(),
            robot_refresh_token: String::new(),
            user_refresh_token: None,
            share_scope: None,

            oauth_client_id: String::new(),
            oauth_client_secret: String::new(),
            oauth_token_url: "https://accounts.google.com/o/oauth2/token".into(),

            cloud_base_url: "https://www.google.com/cloudprint".into(),
            push_url: "wss://push.cloudprint.example/session".into(),
            request_timeout_secs: 30,

            push_ping_timeout_secs: 5,
            push_ping_interval_default_secs: 120,
            push_ping_interval_min_secs: 10,
            push_reconnect_backoff_initial_ms: 500,
            push_reconnect_backoff_max_secs: 60,

            cups_server_uri: "ipp://localhost:631".into(),
            cups_printer_poll_interval_secs: 60,
            cups_job_queue_size: 3,
            cups_job_full_username: false,
            cups_ignore_raw_printers: true,
            cups_printer_attributes: Vec::new(),
            copy_printer_info_to_display_name: true,
            local_call_timeout_secs: 30,
            job_status_poll_interval_secs: 5,

            max_concurrent_downloads: 5,
            download_max_attempts: 3,
            download_backoff_base_ms: 2_000,
            download_backoff_max_secs: 60,
            status_update_max_attempts: 5,
            status_update_backoff_base_ms: 1_000,
            status_update_backoff_max_secs: 30,
            shutdown_drain_timeout_secs: 10,

            monitor_socket_filename: "/tmp/cloudspool-monitor.sock".into(),
        }
    }
}

impl ConnectorConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            CloudspoolError::Config(format!("read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| {
            CloudspoolError::Config(format!("parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the connector cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.robot_refresh_token.trim().is_empty() {
            return Err(CloudspoolError::Config("robot_refresh_token is required".into()));
        }
        if self.proxy_name.trim().is_empty() {
            return Err(CloudspoolError::Config("proxy_name must not be empty".into()));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(CloudspoolError::Config(
                "max_concurrent_downloads must be at least 1".into(),
            ));
        }
        if self.cups_job_queue_size == 0 {
            return Err(CloudspoolError::Config("cups_job_queue_size must be at least 1".into()));
        }
        if self.download_max_attempts == 0 || self.status_update_max_attempts == 0 {
            return Err(CloudspoolError::Config("attempt limits must be at least 1".into()));
        }
        for (name, value) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("push_ping_timeout_secs", self.push_ping_timeout_secs),
            ("cups_printer_poll_interval_secs", self.cups_printer_poll_interval_secs),
            ("job_status_poll_interval_secs", self.job_status_poll_interval_secs),
            ("local_call_timeout_secs", self.local_call_timeout_secs),
        ] {
            if value == 0 {
                return Err(CloudspoolError::Config(format!("{name} must be at least 1")));
            }
        }
        if self.push_ping_interval_min_secs == 0
            || self.push_ping_interval_min_secs > self.push_ping_interval_default_secs
        {
            return Err(CloudspoolError::Config(format!(
                "push_ping_interval_min_secs ({}) must be between 1 and the default ({})",
                self.push_ping_interval_min_secs, self.push_ping_interval_default_secs
            )));
        }
        Ok(())
    }

    /// Attribute names to copy from the spooler.
    pub fn printer_attributes(&self) -> Vec<String> {
        if self.cups_printer_attributes.is_empty() {
            DEFAULT_PRINTER_ATTRIBUTES.iter().map(|s| s.to_string()).collect()
        } else {
            self.cups_printer_attributes.clone()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn printer_poll_interval(&self) -> Duration {
        Duration::from_secs(self.cups_printer_poll_interval_secs)
    }

    pub fn local_call_timeout(&self) -> Duration {
        Duration::from_secs(self.local_call_timeout_secs)
    }

    pub fn job_status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.job_status_poll_interval_secs)
    }

    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_drain_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ConnectorConfig {
        ConnectorConfig {
            robot_refresh_token: "1/robot".into(),
            ..Default::default()
        }
    }

    #[test]
    fn default_requires_robot_token() {
        let err = ConnectorConfig::default().validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn min_ping_interval_cannot_exceed_default() {
        let config = ConnectorConfig {
            push_ping_interval_min_secs: 300,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = ConnectorConfig {
            max_concurrent_downloads: 0,
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_intervals_and_timeouts_are_rejected() {
        let cases: [(&str, fn(&mut ConnectorConfig)); 5] = [
            ("request_timeout_secs", |c| c.request_timeout_secs = 0),
            ("push_ping_timeout_secs", |c| c.push_ping_timeout_secs = 0),
            ("cups_printer_poll_interval_secs", |c| c.cups_printer_poll_interval_secs = 0),
            ("job_status_poll_interval_secs", |c| c.job_status_poll_interval_secs = 0),
            ("local_call_timeout_secs", |c| c.local_call_timeout_secs = 0),
        ];
        for (name, zero) in cases {
            let mut config = valid();
            zero(&mut config);
            match config.validate() {
                Err(CloudspoolError::Config(msg)) => assert!(msg.contains(name), "{msg}"),
                other => panic!("{name}=0 accepted: {other:?}"),
            }
        }
    }

    #[test]
    fn load_fills_missing_fields_with_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cloudspool.config.json");
        std::fs::write(
            &path,
            r#"{ "robot_refresh_token": "1/abc", "proxy_name": "office", "cups_job_queue_size": 2 }"#,
        )
        .expect("write config");

        let config = ConnectorConfig::load(&path).expect("load");
        assert_eq!(config.proxy_name, "office");
        assert_eq!(config.cups_job_queue_size, 2);
        assert_eq!(config.max_concurrent_downloads, 5);
        assert_eq!(config.printer_attributes().len(), DEFAULT_PRINTER_ATTRIBUTES.len());
    }

    #[test]
    fn load_reports_missing_file_as_config_error() {
        let err = ConnectorConfig::load("/nonexistent/cloudspool.json").unwrap_err();
        assert!(matches!(err, CloudspoolError::Config(_)));
    }
}
