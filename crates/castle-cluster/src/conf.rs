//! INI config file rendering
//!
//! Daemons and CLI connections read a `<cluster>.config` file with a
//! `[global]` section, one `[client.<user>]` section for the connecting
//! identity and one `[mon.<name>]` section per monitor.

use crate::info::ClusterInfo;
use crate::paths;
use castle_common::Result;
use castle_common::config::StoreType;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing::debug;

/// One `[name]` section; entries keep insertion order and empty values are
/// left out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Set `key`, replacing an earlier value
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        let key = key.into();
        let value = value.to_string();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An INI document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniFile {
    sections: Vec<Section>,
}

impl IniFile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Section by name, appended if missing
    pub fn section(&mut self, name: &str) -> &mut Section {
        if let Some(idx) = self.sections.iter().position(|s| s.name == name) {
            return &mut self.sections[idx];
        }
        self.sections.push(Section::new(name));
        let last = self.sections.len() - 1;
        &mut self.sections[last]
    }

    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == section)
            .and_then(|s| s.get(key))
    }

    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}]", section.name);
            for (key, value) in &section.entries {
                if !value.is_empty() {
                    let _ = writeln!(out, "{key} = {value}");
                }
            }
        }
        out
    }
}

/// Daemon debug level matching the active tracing filter
#[must_use]
pub fn debug_level() -> i32 {
    let current = LevelFilter::current();
    if current >= LevelFilter::TRACE {
        100
    } else if current >= LevelFilter::DEBUG {
        10
    } else if current >= LevelFilter::INFO {
        0
    } else {
        -1
    }
}

/// Settings of the `[global]` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalConfig {
    pub fsid: String,
    pub run_dir: PathBuf,
    pub mon_members: Vec<String>,
    pub store_type: StoreType,
    pub debug_level: i32,
    /// Set for directory-backed OSDs, whose local file system limits names
    pub osd_max_object_name_len: Option<u32>,
    pub osd_max_object_namespace_len: Option<u32>,
}

impl GlobalConfig {
    pub fn new(info: &ClusterInfo, run_dir: impl Into<PathBuf>, store_type: StoreType) -> Self {
        Self {
            fsid: info.fsid.clone(),
            run_dir: run_dir.into(),
            mon_members: info.monitor_names(),
            store_type,
            debug_level: debug_level(),
            osd_max_object_name_len: None,
            osd_max_object_namespace_len: None,
        }
    }

    /// Overrides needed when an OSD keeps its objects in a plain directory
    #[must_use]
    pub const fn for_directory_osd(mut self) -> Self {
        self.osd_max_object_name_len = Some(256);
        self.osd_max_object_namespace_len = Some(64);
        self
    }

    fn write_to(&self, section: &mut Section) {
        let bluestore = self.store_type == StoreType::Bluestore;
        section
            .set(
                "enable experimental unrecoverable data corrupting features",
                if bluestore { "bluestore rocksdb" } else { "" },
            )
            .set("fsid", &self.fsid)
            .set("run dir", self.run_dir.display())
            .set("mon initial members", self.mon_members.join(" "))
            .set("log file", "/dev/stdout")
            .set("mon cluster log file", "/dev/stdout")
            .set("mon keyvaluedb", "rocksdb");
        for subsystem in [
            "default", "rados", "mon", "osd", "bluestore", "filestore", "journal", "leveldb",
        ] {
            section.set(format!("debug {subsystem}"), self.debug_level);
        }
        section
            .set("filestore_omap_backend", "rocksdb")
            .set("osd pg bits", 11)
            .set("osd pgp bits", 11)
            .set("osd pool default size", 1)
            .set("osd pool default min size", 1)
            .set("osd pool default pg num", 100)
            .set("osd pool default pgp num", 100);
        if let Some(len) = self.osd_max_object_name_len {
            section.set("osd max object name len", len);
        }
        if let Some(len) = self.osd_max_object_namespace_len {
            section.set("osd max object namespace len", len);
        }
        section
            .set("osd objectstore", self.store_type.as_str())
            .set("rbd_default_features", 3)
            .set("fatal signal handlers", "false");
    }
}

/// Qualify a short user name as a client entity (`admin` -> `client.admin`).
/// Names that already carry a type (`osd.3`, `client.x`) are kept.
#[must_use]
pub fn qualified_user(user: &str) -> String {
    if user.contains('.') {
        user.to_string()
    } else {
        format!("client.{user}")
    }
}

/// Build the config document for `user`
#[must_use]
pub fn build_config(
    info: &ClusterInfo,
    global: &GlobalConfig,
    user: &str,
    keyring: &Path,
    client_settings: &BTreeMap<String, String>,
) -> IniFile {
    let mut ini = IniFile::new();
    global.write_to(ini.section("global"));

    let client = ini.section(&qualified_user(user));
    client.set("keyring", keyring.display());
    for (key, value) in client_settings {
        client.set(key.as_str(), value);
    }

    let mut monitors: Vec<_> = info.monitors.values().collect();
    monitors.sort_by(|a, b| a.name.cmp(&b.name));
    for mon in monitors {
        ini.section(&format!("mon.{}", mon.name))
            .set("name", &mon.name)
            .set("mon addr", &mon.endpoint);
    }
    ini
}

/// Render and write `<root>/<cluster>.config`, returning its path
pub fn generate_config_file(
    info: &ClusterInfo,
    root: &Path,
    global: &GlobalConfig,
    user: &str,
    keyring: &Path,
    client_settings: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    let path = paths::config_file(root, &info.name);
    std::fs::create_dir_all(root)?;
    let ini = build_config(info, global, user, keyring, client_settings);
    std::fs::write(&path, ini.render())
        .map_err(|e| castle_common::Error::from(e).context(format!("writing {}", path.display())))?;
    debug!("Wrote config file {}", path.display());
    Ok(path)
}

/// Write the admin keyring and config under `<configDir>/<cluster>` so
/// CLI tools on this node can reach the cluster
pub fn generate_admin_connection_config(info: &ClusterInfo, config_dir: &Path) -> Result<PathBuf> {
    let root = paths::admin_root(config_dir, &info.name);
    let keyring = paths::admin_keyring(config_dir, &info.name);
    crate::keyring::write_keyring(&keyring, &crate::keyring::admin_keyring(&info.admin_secret))?;
    let global = GlobalConfig::new(info, &root, StoreType::default());
    generate_config_file(info, &root, &global, crate::ADMIN_USER, &keyring, &BTreeMap::new())
}
