// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! Plain configuration struct describing how to reach the broker. It is handed
//! to a transport implementation and only converted into the client library's
//! uri type at connect time; nothing here extends the library's own types.

use crate::errors::AmqpError;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use std::{env, str::FromStr};
use tracing::error;

pub const ENV_APP_NAME: &str = "APP_NAME";
pub const ENV_AMQP_HOST: &str = "AMQP_HOST";
pub const ENV_AMQP_PORT: &str = "AMQP_PORT";
pub const ENV_AMQP_USER: &str = "AMQP_USER";
pub const ENV_AMQP_PASSWORD: &str = "AMQP_PASSWORD";
pub const ENV_AMQP_VHOST: &str = "AMQP_VHOST";
pub const ENV_AMQP_HEARTBEAT: &str = "AMQP_HEARTBEAT";

/// Broker connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AmqpConfigs {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat timeout negotiated with the broker, `0` disables heartbeats.
    pub heartbeat_secs: u16,
    pub channel_max: u16,
    pub connection_timeout_ms: u64,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        AmqpConfigs {
            app_name: "rabbitmq-patterns".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            heartbeat_secs: 60,
            channel_max: 128,
            connection_timeout_ms: 120_000,
        }
    }
}

impl AmqpConfigs {
    /// Builds the configuration from defaults overlaid with the `AMQP_*` environment.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::default().overlay(|key| env::var(key).ok())
    }

    /// Overlays values returned by `lookup` on top of `self`.
    pub fn overlay<F>(mut self, lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_APP_NAME) {
            self.app_name = value;
        }
        if let Some(value) = lookup(ENV_AMQP_HOST) {
            self.host = value;
        }
        if let Some(value) = lookup(ENV_AMQP_PORT) {
            self.port = parse_number(ENV_AMQP_PORT, &value)?;
        }
        if let Some(value) = lookup(ENV_AMQP_USER) {
            self.user = value;
        }
        if let Some(value) = lookup(ENV_AMQP_PASSWORD) {
            self.password = value;
        }
        if let Some(value) = lookup(ENV_AMQP_VHOST) {
            self.vhost = value;
        }
        if let Some(value) = lookup(ENV_AMQP_HEARTBEAT) {
            self.heartbeat_secs = parse_number(ENV_AMQP_HEARTBEAT, &value)?;
        }

        Ok(self)
    }

    /// Builds the broker uri field by field, so credentials and vhost are
    /// never reparsed from text.
    pub fn uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat_secs),
                channel_max: Some(self.channel_max),
                connection_timeout: Some(self.connection_timeout_ms),
                ..Default::default()
            },
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, AmqpError> {
    value.trim().parse::<T>().map_err(|_| {
        error!(key = key, value = value, "invalid numeric configuration");
        AmqpError::ConfigError(key.to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_uri_targets_the_root_vhost() {
        let uri = AmqpConfigs::default().uri();

        assert_eq!(uri.scheme, AMQPScheme::AMQP);
        assert_eq!(uri.authority.host, "127.0.0.1");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.query.heartbeat, Some(60));
        assert_eq!(uri.query.channel_max, Some(128));
        assert_eq!(uri.query.connection_timeout, Some(120_000));
    }

    #[test]
    fn reserved_characters_in_credentials_stay_in_the_userinfo() {
        let cfg = AmqpConfigs {
            user: "svc:user".to_owned(),
            password: "p@ss/w:rd".to_owned(),
            ..AmqpConfigs::default()
        };

        let uri = cfg.uri();

        assert_eq!(uri.authority.userinfo.username, "svc:user");
        assert_eq!(uri.authority.userinfo.password, "p@ss/w:rd");
        assert_eq!(uri.authority.host, "127.0.0.1");
        assert_eq!(uri.authority.port, 5672);
    }

    #[test]
    fn overlay_reads_values_from_lookup() {
        let vars = HashMap::from([
            (ENV_AMQP_HOST, "broker.local"),
            (ENV_AMQP_PORT, "5673"),
            (ENV_AMQP_VHOST, "robots"),
        ]);

        let cfg = AmqpConfigs::default()
            .overlay(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(cfg.host, "broker.local");
        assert_eq!(cfg.port, 5673);
        assert_eq!(cfg.uri().vhost, "robots");
    }

    #[test]
    fn overlay_rejects_malformed_port() {
        let result = AmqpConfigs::default().overlay(|key| {
            if key == ENV_AMQP_PORT {
                Some("not-a-port".to_owned())
            } else {
                None
            }
        });

        assert_eq!(
            result,
            Err(AmqpError::ConfigError(ENV_AMQP_PORT.to_owned()))
        );
    }

    #[test]
    fn deserializes_partial_documents_with_defaults() {
        let cfg: AmqpConfigs = serde_json::from_str(r#"{"host": "10.0.0.2"}"#).unwrap();
        assert_eq!(cfg.host, "10.0.0.2");
        assert_eq!(cfg.port, 5672);
        assert_eq!(cfg.vhost, "/");
    }
}
