//! Keyring files
//!
//! A keyring is `[<entity>]` followed by a tab-indented `key = <base64>`
//! line and zero or more `caps <subsystem> = "<cap>"` lines.

use crate::commands;
use crate::connection::ClusterConnection;
use castle_common::{Error, Result};
use std::path::Path;
use tracing::info;

/// Keyring of the cluster administrator
#[must_use]
pub fn admin_keyring(secret: &str) -> String {
    format!(
        "[client.admin]\n\tkey = {secret}\n\tauid = 0\n\tcaps mds = \"allow *\"\n\tcaps mon = \"allow *\"\n\tcaps osd = \"allow *\"\n\tcaps mgr = \"allow *\"\n"
    )
}

/// Keyring a monitor is created with: the shared `mon.` key plus the admin
#[must_use]
pub fn mon_keyring(monitor_secret: &str, admin_secret: &str) -> String {
    format!(
        "[mon.]\n\tkey = {monitor_secret}\n\tcaps mon = \"allow *\"\n{}",
        admin_keyring(admin_secret)
    )
}

/// Keyring used to register new OSDs
#[must_use]
pub fn bootstrap_osd_keyring(secret: &str) -> String {
    format!(
        "[client.bootstrap-osd]\n\tkey = {secret}\n\tcaps mon = \"allow profile bootstrap-osd\"\n"
    )
}

/// Keyring holding only the key of `entity`
#[must_use]
pub fn entity_keyring(entity: &str, secret: &str) -> String {
    format!("[{entity}]\n\tkey = {secret}\n")
}

/// Write a keyring, creating its directory
pub fn write_keyring(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, contents)
        .map_err(|e| Error::from(e).context(format!("writing keyring {}", path.display())))
}

/// Fetch (or create) the key of `entity` with `caps` and write the keyring
/// rendered by `render`. Nothing happens when the file already exists.
pub async fn create_keyring(
    conn: &dyn ClusterConnection,
    entity: &str,
    caps: &[&str],
    path: &Path,
    render: impl FnOnce(&str) -> String + Send,
) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    let key = commands::auth_get_or_create_key(conn, entity, caps).await?;
    write_keyring(path, &render(&key))?;
    info!("Created keyring for {} at {}", entity, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockConnectionFactory;
    use crate::ConnectionFactory;

    #[test]
    fn test_templates() {
        assert_eq!(
            mon_keyring("M", "A"),
            "[mon.]\n\tkey = M\n\tcaps mon = \"allow *\"\n[client.admin]\n\tkey = A\n\tauid = 0\n\tcaps mds = \"allow *\"\n\tcaps mon = \"allow *\"\n\tcaps osd = \"allow *\"\n\tcaps mgr = \"allow *\"\n"
        );
        assert_eq!(
            bootstrap_osd_keyring("B"),
            "[client.bootstrap-osd]\n\tkey = B\n\tcaps mon = \"allow profile bootstrap-osd\"\n"
        );
    }

    #[tokio::test]
    async fn test_create_keyring_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootstrap-osd").join("c1.keyring");
        let factory = MockConnectionFactory::new();
        factory.on_json("auth get-or-create-key", serde_json::json!({"key": "KEY1"}));
        let conn = factory.connect(&crate::testing::sample_info(), "admin").await.unwrap();

        let caps = ["mon", "allow profile bootstrap-osd"];
        create_keyring(conn.as_ref(), "client.bootstrap-osd", &caps, &path, bootstrap_osd_keyring)
            .await
            .unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("key = KEY1"));

        factory.on_json("auth get-or-create-key", serde_json::json!({"key": "KEY2"}));
        create_keyring(conn.as_ref(), "client.bootstrap-osd", &caps, &path, bootstrap_osd_keyring)
            .await
            .unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("key = KEY1"));
        assert_eq!(factory.calls_with_prefix("auth get-or-create-key").len(), 1);
    }
}
