use crate::error::{BridgeError, Result};
use crate::gpio::GpioPin;
use log::warn;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Load configuration from an INI-style file.
///
/// Sections: `[global]`, `[webhooks]`, `[security]` and one `[gpio.N]` per
/// zone. Keys are case-insensitive, `key = value` or `key: value`, full-line
/// comments start with `#` or `;`.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub global: GlobalConfig,
    pub webhooks: WebhooksConfig,
    pub security: SecurityConfig,
    pub zones: Vec<ZoneConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalConfig {
    /// Seconds before a webhook call is abandoned.
    pub url_timeout: f64,
    /// Seconds between full resyncs of every zone.
    pub update: u64,
    /// Quiet interval a new reading must hold before it is accepted.
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhooksConfig {
    pub host: String,
    pub port: u16,
    /// Minimum seconds between the start of consecutive webhook calls.
    pub delay: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityConfig {
    /// Security-system accessory id; empty disables the feature.
    pub id: String,
    /// Seconds between reads of the accessory's arming state.
    pub poll: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneConfig {
    pub pin: GpioPin,
    /// Contact-sensor accessory id.
    pub id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: GlobalConfig {
                url_timeout: 5.0,
                update: 180,
                debounce_ms: 50,
            },
            webhooks: WebhooksConfig {
                host: "127.0.0.1".to_string(),
                port: 51828,
                delay: 0.4,
            },
            security: SecurityConfig {
                id: String::new(),
                poll: 30,
            },
            zones: Vec::new(),
        }
    }
}

struct Entry<'a> {
    key: String,
    value: &'a str,
    line: usize,
}

struct Section<'a> {
    name: String,
    line: usize,
    entries: Vec<Entry<'a>>,
}

fn split_sections(content: &str) -> Result<Vec<Section<'_>>> {
    let mut sections: Vec<Section<'_>> = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim().to_string();
            if sections.iter().any(|s| s.name == name) {
                return Err(BridgeError::config(format!(
                    "line {}: duplicate section [{}]",
                    line_no, name
                )));
            }
            sections.push(Section {
                name,
                line: line_no,
                entries: Vec::new(),
            });
            continue;
        }

        // Split at the first '=' or ':'
        let Some(sep) = line.find(['=', ':']) else {
            return Err(BridgeError::config(format!(
                "line {}: expected 'key = value', got '{}'",
                line_no, line
            )));
        };
        let Some(section) = sections.last_mut() else {
            return Err(BridgeError::config(format!(
                "line {}: key outside of any section",
                line_no
            )));
        };
        section.entries.push(Entry {
            key: line[..sep].trim().to_ascii_lowercase(),
            value: line[sep + 1..].trim(),
            line: line_no,
        });
    }

    Ok(sections)
}

fn parse_value<T: std::str::FromStr>(section: &str, entry: &Entry<'_>) -> Result<T> {
    entry.value.parse().map_err(|_| {
        BridgeError::config(format!(
            "line {}: invalid value '{}' for {}.{}",
            entry.line, entry.value, section, entry.key
        ))
    })
}

fn unknown_key(section: &str, entry: &Entry<'_>) {
    warn!(
        "[Config] line {}: ignoring unknown key {}.{}",
        entry.line, section, entry.key
    );
}

impl Config {
    /// Read, parse, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            BridgeError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse file contents on top of the defaults and validate.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::default();

        for section in split_sections(content)? {
            let name = section.name.as_str();
            match name {
                "global" => {
                    for entry in &section.entries {
                        match entry.key.as_str() {
                            "url_timeout" => config.global.url_timeout = parse_value(name, entry)?,
                            "update" => config.global.update = parse_value(name, entry)?,
                            "debounce_ms" => config.global.debounce_ms = parse_value(name, entry)?,
                            _ => unknown_key(name, entry),
                        }
                    }
                }
                "webhooks" => {
                    for entry in &section.entries {
                        match entry.key.as_str() {
                            "host" => config.webhooks.host = entry.value.to_string(),
                            "port" => config.webhooks.port = parse_value(name, entry)?,
                            "delay" => config.webhooks.delay = parse_value(name, entry)?,
                            _ => unknown_key(name, entry),
                        }
                    }
                }
                "security" => {
                    for entry in &section.entries {
                        match entry.key.as_str() {
                            "id" => config.security.id = entry.value.to_string(),
                            "poll" => config.security.poll = parse_value(name, entry)?,
                            _ => unknown_key(name, entry),
                        }
                    }
                }
                _ => {
                    let Some(gpio) = name.strip_prefix("gpio.") else {
                        return Err(BridgeError::config(format!(
                            "line {}: unknown section [{}]",
                            section.line, name
                        )));
                    };
                    let number: u8 = gpio.trim().parse().map_err(|_| {
                        BridgeError::config(format!(
                            "line {}: GPIO '{}' is not a number in [{}]",
                            section.line, gpio, name
                        ))
                    })?;
                    let mut id = String::new();
                    for entry in &section.entries {
                        match entry.key.as_str() {
                            "id" => id = entry.value.to_string(),
                            _ => unknown_key(name, entry),
                        }
                    }
                    config.zones.push(ZoneConfig {
                        pin: GpioPin::new(number),
                        id,
                    });
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply `ALARM_*` environment overrides. Unparsable values are ignored.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("ALARM_WEBHOOK_HOST") {
            self.webhooks.host = host;
        }
        if let Some(port) = lookup("ALARM_WEBHOOK_PORT")
            && let Ok(p) = port.parse()
        {
            self.webhooks.port = p;
        }
        if let Some(id) = lookup("ALARM_SECURITY_ID") {
            self.security.id = id;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let global = &self.global;
        if !global.url_timeout.is_finite() || global.url_timeout <= 0.0 {
            return Err(BridgeError::config("global.url_timeout must be > 0"));
        }
        if global.update == 0 {
            return Err(BridgeError::config("global.update must be > 0"));
        }
        if global.debounce_ms == 0 {
            return Err(BridgeError::config("global.debounce_ms must be > 0"));
        }
        if self.webhooks.host.trim().is_empty() {
            return Err(BridgeError::config("webhooks.host is empty"));
        }
        if self.webhooks.port == 0 {
            return Err(BridgeError::config("webhooks.port must be > 0"));
        }
        if !self.webhooks.delay.is_finite() || self.webhooks.delay < 0.0 {
            return Err(BridgeError::config("webhooks.delay must be >= 0"));
        }
        if self.security.poll == 0 {
            return Err(BridgeError::config("security.poll must be > 0"));
        }

        let mut seen = HashSet::new();
        for zone in &self.zones {
            if zone.pin.header_pin().is_none() {
                return Err(BridgeError::config(format!(
                    "invalid GPIO {} in [gpio.{}]",
                    zone.pin.number(),
                    zone.pin.number()
                )));
            }
            if zone.id.trim().is_empty() {
                return Err(BridgeError::config(format!(
                    "missing id in [gpio.{}]",
                    zone.pin.number()
                )));
            }
            if !seen.insert(zone.pin) {
                return Err(BridgeError::config(format!("{} mapped twice", zone.pin)));
            }
        }
        Ok(())
    }

    pub fn url_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.global.url_timeout)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.global.update)
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.global.debounce_ms)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_secs_f64(self.webhooks.delay)
    }

    pub fn arming_poll_interval(&self) -> Duration {
        Duration::from_secs(self.security.poll)
    }
}
