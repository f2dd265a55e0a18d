use anyhow::Context;
use dbpool::DbConfig;
use serde::Deserialize;
use std::path::Path;

/// The daemon configuration, read from a TOML file.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DepotConfig {
    pub database: DbConfig,

    /// Peer server processes that receive mailbox state announcements
    /// on the line-oriented control channel.
    #[serde(default)]
    pub peers: Vec<String>,
}

impl DepotConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }
}
