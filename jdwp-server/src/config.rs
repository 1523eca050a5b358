// Agent options
//
// Parses the classic `-agentlib:jdwp=` option string, e.g.
// `transport=dt_socket,server=y,suspend=n,address=*:8000,timeout=5000`

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("malformed option '{0}', expected key=value")]
    Malformed(String),

    #[error("unknown option '{0}'")]
    UnknownOption(String),

    #[error("unsupported transport '{0}', only dt_socket is available")]
    UnsupportedTransport(String),

    #[error("invalid value '{value}' for option '{key}'")]
    InvalidValue { key: String, value: String },

    #[error("attaching to a debugger requires an address")]
    MissingAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JdwpOptions {
    pub transport: String,
    /// Listen for a debugger (`true`) or attach to one (`false`)
    pub server: bool,
    pub host: String,
    /// 0 picks an ephemeral port when listening
    pub port: u16,
    /// Hold the initial thread at VM start until the debugger resumes it
    pub suspend: bool,
    /// Accept/attach/handshake timeout in milliseconds, 0 waits forever
    pub timeout: u64,
    pub queue_capacity: usize,
}

impl Default for JdwpOptions {
    fn default() -> Self {
        Self {
            transport: "dt_socket".to_string(),
            server: true,
            host: "127.0.0.1".to_string(),
            port: 0,
            suspend: false,
            timeout: 0,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl JdwpOptions {
    pub fn parse(options: &str) -> Result<Self, ConfigError> {
        let mut parsed = Self::default();
        let mut address = None;

        for entry in options.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| ConfigError::Malformed(entry.to_string()))?;

            match key {
                "transport" => {
                    if value != "dt_socket" {
                        return Err(ConfigError::UnsupportedTransport(value.to_string()));
                    }
                    parsed.transport = value.to_string();
                }
                "server" => parsed.server = parse_flag(key, value)?,
                "suspend" => parsed.suspend = parse_flag(key, value)?,
                "address" => address = Some(value.to_string()),
                "timeout" => parsed.timeout = parse_number(key, value)?,
                "queue" => parsed.queue_capacity = parse_number(key, value)?,
                _ => return Err(ConfigError::UnknownOption(key.to_string())),
            }
        }

        match address {
            Some(address) => parsed.set_address(&address)?,
            None if !parsed.server => return Err(ConfigError::MissingAddress),
            None => {}
        }

        if parsed.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue".to_string(),
                value: "0".to_string(),
            });
        }

        Ok(parsed)
    }

    /// Apply an `address` value: `port`, `host:port` or `*:port`
    pub fn set_address(&mut self, address: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: "address".to_string(),
            value: address.to_string(),
        };

        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => (Some(host), port),
            None => (None, address),
        };

        self.port = port.parse().map_err(|_| invalid())?;
        match host {
            Some("*") => self.host = "0.0.0.0".to_string(),
            Some("") => return Err(invalid()),
            Some(host) => self.host = host.to_string(),
            None => {}
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for JdwpOptions {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "y" | "yes" | "true" => Ok(true),
        "n" | "no" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_string() {
        let options: JdwpOptions = "transport=dt_socket,server=y,suspend=n,address=*:8000,timeout=5000"
            .parse()
            .unwrap();

        assert!(options.server);
        assert!(!options.suspend);
        assert_eq!(options.host, "0.0.0.0");
        assert_eq!(options.port, 8000);
        assert_eq!(options.timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(options.queue_capacity, DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_bare_port_keeps_default_host() {
        let options = JdwpOptions::parse("server=y,address=5005").unwrap();
        assert_eq!(options.address(), "127.0.0.1:5005");
        assert_eq!(options.timeout(), None);
    }

    #[test]
    fn test_attach_requires_address() {
        assert_eq!(JdwpOptions::parse("server=n"), Err(ConfigError::MissingAddress));

        let options = JdwpOptions::parse("server=n,address=debugger.local:9000").unwrap();
        assert!(!options.server);
        assert_eq!(options.host, "debugger.local");
    }

    #[test]
    fn test_rejects_bad_options() {
        assert!(matches!(
            JdwpOptions::parse("transport=dt_shmem"),
            Err(ConfigError::UnsupportedTransport(_))
        ));
        assert!(matches!(JdwpOptions::parse("server=maybe"), Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(JdwpOptions::parse("launch=/bin/true"), Err(ConfigError::UnknownOption(_))));
        assert!(matches!(JdwpOptions::parse("server"), Err(ConfigError::Malformed(_))));
        assert!(matches!(JdwpOptions::parse("address=:80"), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_options_serialize_as_json() {
        let options = JdwpOptions::parse("address=8000,suspend=y").unwrap();
        let json = serde_json::to_value(&options).unwrap();

        assert_eq!(json["port"], 8000);
        assert_eq!(json["suspend"], true);

        let back: JdwpOptions = serde_json::from_value(json).unwrap();
        assert_eq!(back, options);
    }
}
