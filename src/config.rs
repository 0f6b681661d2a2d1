use crate::broadcast::DEFAULT_RETRANSMIT_MULT;
use serde::{Deserialize, Serialize};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Startup options of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unique node name; generated from the hostname when unset
    pub name: Option<String>,

    /// `host:port` to bind; unset binds the default address on an ephemeral port
    pub bind: Option<String>,

    /// Addresses of existing members to join at startup
    pub seeds: Vec<String>,

    pub retransmit_mult: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            bind: None,
            seeds: Vec::new(),
            retransmit_mult: DEFAULT_RETRANSMIT_MULT,
        }
    }
}

impl Config {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = Some(bind.into());
        self
    }

    pub fn with_seeds<I, S>(mut self, seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.seeds = seeds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retransmit_mult(mut self, retransmit_mult: usize) -> Self {
        self.retransmit_mult = retransmit_mult;
        self
    }
}

/// Parse a comma separated seed list, e.g. `"10.0.0.1:7946,10.0.0.2:7946"`
pub fn parse_seeds(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|seed| !seed.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seed_lists() {
        assert!(parse_seeds("").is_empty());
        assert_eq!(
            parse_seeds("a:1, b:2,,c:3 "),
            vec!["a:1".to_string(), "b:2".to_string(), "c:3".to_string()]
        );
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = serde_json::from_str(r#"{"seeds":["127.0.0.1:7946"]}"#).unwrap();
        assert_eq!(config.retransmit_mult, DEFAULT_RETRANSMIT_MULT);
        assert_eq!(config.name, None);
        assert_eq!(config.seeds, vec!["127.0.0.1:7946".to_string()]);
    }
}
