use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use serde_derive::Deserialize;

use crate::messages::LifecycleState;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub dispatch: Option<DispatchConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        self.dispatch.clone().unwrap_or_default().settings()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DispatchConfig {
    pub debounce_ms: Option<u64>,
    pub background_delay_ms: Option<u64>,
    pub hidden_delay_ms: Option<u64>,
    pub terminated_delay_ms: Option<u64>,
}

impl DispatchConfig {
    pub fn settings(&self) -> DispatchSettings {
        let defaults = DispatchSettings::default();
        let or = |value: Option<u64>, fallback: Duration| {
            value.map(Duration::from_millis).unwrap_or(fallback)
        };
        DispatchSettings {
            debounce: or(self.debounce_ms, defaults.debounce),
            background_delay: or(self.background_delay_ms, defaults.background_delay),
            hidden_delay: or(self.hidden_delay_ms, defaults.hidden_delay),
            terminated_delay: or(self.terminated_delay_ms, defaults.terminated_delay),
        }
    }
}

/// Resolved dispatch timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Minimum gap between two notifications to the same address.
    pub debounce: Duration,
    pub background_delay: Duration,
    pub hidden_delay: Duration,
    pub terminated_delay: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            debounce: Duration::from_millis(5000),
            background_delay: Duration::from_millis(2000),
            hidden_delay: Duration::from_millis(1000),
            terminated_delay: Duration::from_millis(500),
        }
    }
}

impl DispatchSettings {
    /// Delay before the follow-up push for `state`, if it gets one.
    pub fn follow_up_delay(&self, state: LifecycleState) -> Option<Duration> {
        match state {
            LifecycleState::Background => Some(self.background_delay),
            LifecycleState::Hidden => Some(self.hidden_delay),
            LifecycleState::Terminated => Some(self.terminated_delay),
            LifecycleState::Foreground | LifecycleState::Unknown => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"

            [dispatch]
            debounce_ms = 60000
            hidden_delay_ms = 250
        "#;
        let config: AppConfig = toml::de::from_str(config_str).unwrap();
        assert!(config.mqtt.host == "localhost");
        assert!(config.dispatch.is_some());

        let settings = config.dispatch_settings();
        assert_eq!(settings.debounce, Duration::from_secs(60));
        assert_eq!(settings.hidden_delay, Duration::from_millis(250));
        assert_eq!(settings.background_delay, Duration::from_millis(2000));
        assert_eq!(settings.terminated_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_config_without_dispatch_section() {
        let config: AppConfig = toml::de::from_str("[mqtt]\nhost = \"broker\"\n").unwrap();
        assert_eq!(config.dispatch_settings(), DispatchSettings::default());
    }

    #[test]
    fn test_follow_up_delays() {
        let settings = DispatchSettings::default();
        assert_eq!(
            settings.follow_up_delay(LifecycleState::Terminated),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            settings.follow_up_delay(LifecycleState::Hidden),
            Some(Duration::from_millis(1000))
        );
        assert_eq!(settings.follow_up_delay(LifecycleState::Foreground), None);
        assert_eq!(settings.follow_up_delay(LifecycleState::Unknown), None);
    }
}
