//! Tracing initialisation for the `blockindex` binary.

use std::collections::HashMap;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level per component.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    pub level: String,
    /// Override per component: crate name → level
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Add a `crate=level` override, as given on the command line.
    pub fn add_component(&mut self, spec: &str) -> Option<()> {
        let (component, level) = spec.split_once('=')?;
        if component.is_empty() || level.is_empty() {
            return None;
        }
        self.components.insert(component.to_string(), level.to_string());
        Some(())
    }

    /// Filter directives, e.g. `"info,blockindex_core=debug"`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `config` when set.
/// Call once at startup.
pub fn init_tracing(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Logs go to stderr; stdout carries command output.
    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_levels_use_crate_names() {
        let mut config = LogConfig::default();
        config.components.insert("blockindex-core".into(), "debug".into());
        assert_eq!(config.directives(), "info,blockindex_core=debug");
    }

    #[test]
    fn component_override_parsing() {
        let mut config = LogConfig::default();
        assert!(config.add_component("blockindex-storage=trace").is_some());
        assert!(config.add_component("sqlx=warn").is_some());
        assert!(config.add_component("no-level").is_none());
        assert!(config.add_component("=debug").is_none());
        assert_eq!(config.directives(), "info,blockindex_storage=trace,sqlx=warn");
    }
}
