//! Local file layout under the node config directory

use std::path::{Path, PathBuf};

/// Config file for `cluster` under `root`: `<root>/<cluster>.config`
#[must_use]
pub fn config_file(root: &Path, cluster: &str) -> PathBuf {
    root.join(format!("{cluster}.config"))
}

/// Directory holding the admin connection config: `<configDir>/<cluster>`
#[must_use]
pub fn admin_root(config_dir: &Path, cluster: &str) -> PathBuf {
    config_dir.join(cluster)
}

/// `<configDir>/<cluster>/client.admin.keyring`
#[must_use]
pub fn admin_keyring(config_dir: &Path, cluster: &str) -> PathBuf {
    admin_root(config_dir, cluster).join("client.admin.keyring")
}

/// `<configDir>/bootstrap-osd`
#[must_use]
pub fn bootstrap_osd_root(config_dir: &Path) -> PathBuf {
    config_dir.join("bootstrap-osd")
}

/// `<configDir>/bootstrap-osd/<cluster>.keyring`
#[must_use]
pub fn bootstrap_osd_keyring(config_dir: &Path, cluster: &str) -> PathBuf {
    bootstrap_osd_root(config_dir).join(format!("{cluster}.keyring"))
}

/// Run directory of a monitor: `<configDir>/<name>`
#[must_use]
pub fn mon_root(config_dir: &Path, name: &str) -> PathBuf {
    config_dir.join(name)
}

/// `<configDir>/<name>/keyring`
#[must_use]
pub fn mon_keyring(config_dir: &Path, name: &str) -> PathBuf {
    mon_root(config_dir, name).join("keyring")
}

/// `<configDir>/<name>/mon.<name>`
#[must_use]
pub fn mon_data(config_dir: &Path, name: &str) -> PathBuf {
    mon_root(config_dir, name).join(format!("mon.{name}"))
}

/// Data directory of an OSD: `<configDir>/osd<id>`
#[must_use]
pub fn osd_root(config_dir: &Path, id: u32) -> PathBuf {
    config_dir.join(format!("osd{id}"))
}

/// Keyring written by `--mkkey` inside an OSD data directory
#[must_use]
pub fn osd_keyring(osd_root: &Path) -> PathBuf {
    osd_root.join("keyring")
}

/// Journal file of a filestore OSD
#[must_use]
pub fn osd_journal(osd_root: &Path) -> PathBuf {
    osd_root.join("journal")
}

/// Temp location of the monitor map used by `--mkfs`
#[must_use]
pub fn osd_temp_monmap(osd_root: &Path) -> PathBuf {
    osd_root.join("tmp").join("activate.monmap")
}

/// Run directory of a metadata server: `<configDir>/mds<id>`
#[must_use]
pub fn mds_root(config_dir: &Path, id: &str) -> PathBuf {
    config_dir.join(format!("mds{id}"))
}

/// Run directory of the object gateway: `<configDir>/rgw`
#[must_use]
pub fn rgw_root(config_dir: &Path) -> PathBuf {
    config_dir.join("rgw")
}

/// Directory holding the connection config of `user`. The admin shares
/// [`admin_root`] with the CLI tools.
#[must_use]
pub fn connection_root(config_dir: &Path, cluster: &str, user: &str) -> PathBuf {
    let qualified = crate::conf::qualified_user(user);
    if qualified == crate::conf::qualified_user(crate::ADMIN_USER) {
        admin_root(config_dir, cluster)
    } else {
        admin_root(config_dir, cluster).join(qualified)
    }
}

/// Keyring file for `user` when connecting to `cluster`
#[must_use]
pub fn user_keyring(config_dir: &Path, cluster: &str, user: &str) -> PathBuf {
    let user = user.strip_prefix("client.").unwrap_or(user);
    if user == crate::ADMIN_USER {
        return admin_keyring(config_dir, cluster);
    }
    if user == crate::BOOTSTRAP_OSD_USER {
        return bootstrap_osd_keyring(config_dir, cluster);
    }
    if let Some(id) = user.strip_prefix("osd.").and_then(|id| id.parse().ok()) {
        return osd_keyring(&osd_root(config_dir, id));
    }
    admin_root(config_dir, cluster).join(format!("{}.keyring", crate::conf::qualified_user(user)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_keyring() {
        let dir = Path::new("/var/lib/castle");
        assert_eq!(
            user_keyring(dir, "c1", "admin"),
            PathBuf::from("/var/lib/castle/c1/client.admin.keyring")
        );
        assert_eq!(
            user_keyring(dir, "c1", "client.bootstrap-osd"),
            PathBuf::from("/var/lib/castle/bootstrap-osd/c1.keyring")
        );
        assert_eq!(
            user_keyring(dir, "c1", "osd.3"),
            PathBuf::from("/var/lib/castle/osd3/keyring")
        );
        assert_eq!(
            config_file(&osd_root(dir, 3), "c1"),
            PathBuf::from("/var/lib/castle/osd3/c1.config")
        );
    }
}
