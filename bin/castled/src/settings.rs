//! Configuration loading and node identity

use anyhow::{Context, Result};
use castle_common::Config;
use config::{Environment, File, FileFormat};
use std::path::Path;

/// Name of the file under the config dir that keeps a generated node id
const NODE_ID_FILE: &str = "node-id";

/// Read `path` (when it exists) and apply `CASTLE_<SECTION>__<FIELD>`
/// environment overrides on top
pub fn load_config(path: &Path) -> Result<Config> {
    let source = config::Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix("CASTLE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("store.endpoints")
                .with_list_parse_key("osd.devices")
                .with_list_parse_key("osd.directories")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    source
        .try_deserialize()
        .with_context(|| format!("Invalid config {}", path.display()))
}

/// The configured node id, or the one kept under the config dir, or a new
/// one that is kept there for the next start
pub fn resolve_node_id(config: &Config) -> Result<String> {
    if !config.node.id.is_empty() {
        return Ok(config.node.id.clone());
    }
    let file = config.cluster.config_dir.join(NODE_ID_FILE);
    match std::fs::read_to_string(&file) {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", file.display())),
    }
    let id = uuid::Uuid::new_v4().simple().to_string();
    std::fs::create_dir_all(&config.cluster.config_dir)
        .with_context(|| format!("Failed to create {}", config.cluster.config_dir.display()))?;
    std::fs::write(&file, &id).with_context(|| format!("Failed to write {}", file.display()))?;
    Ok(id)
}
