//! Typed monitor commands

use crate::command::MonCommand;
use crate::connection::ClusterConnection;
use castle_common::{Error, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Run `cmd` and decode its JSON output
pub async fn mon_json<T: DeserializeOwned>(conn: &dyn ClusterConnection, cmd: &MonCommand) -> Result<T> {
    let buf = conn.mon_command(cmd).await?;
    serde_json::from_slice(&buf)
        .map_err(|e| Error::external(format!("unparsable response to '{cmd}': {e}")))
}

/// Output of `mon_status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MonStatus {
    #[serde(default)]
    pub quorum: Vec<i32>,
    #[serde(default)]
    pub monmap: MonMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MonMap {
    #[serde(default)]
    pub mons: Vec<MonMapEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MonMapEntry {
    pub name: String,
    pub rank: i32,
}

impl MonStatus {
    /// True when `name` is in the monitor map and its rank is in quorum
    #[must_use]
    pub fn in_quorum(&self, name: &str) -> bool {
        self.monmap
            .mons
            .iter()
            .find(|m| m.name == name)
            .is_some_and(|m| self.quorum.contains(&m.rank))
    }
}

pub async fn mon_status(conn: &dyn ClusterConnection) -> Result<MonStatus> {
    mon_json(conn, &MonCommand::new("mon_status")).await
}

/// Purge a monitor from the monitor map
pub async fn mon_remove(conn: &dyn ClusterConnection, name: &str) -> Result<()> {
    conn.mon_command(&MonCommand::new("mon remove").arg("name", name))
        .await
        .map(|_| ())
}

/// Current monitor map in its binary encoding
pub async fn get_monmap(conn: &dyn ClusterConnection) -> Result<Vec<u8>> {
    conn.mon_command(&MonCommand::new("mon getmap")).await
}

#[derive(Deserialize)]
struct KeyResponse {
    key: String,
}

/// Key of `entity`, created with `caps` (subsystem/cap pairs) if missing
pub async fn auth_get_or_create_key(
    conn: &dyn ClusterConnection,
    entity: &str,
    caps: &[&str],
) -> Result<String> {
    let cmd = MonCommand::new("auth get-or-create-key")
        .arg("entity", entity)
        .arg("caps", caps.to_vec());
    let resp: KeyResponse = mon_json(conn, &cmd).await?;
    Ok(resp.key)
}

/// Register `entity` with the key held in `keyring`
pub async fn auth_add(
    conn: &dyn ClusterConnection,
    entity: &str,
    caps: &[&str],
    keyring: &[u8],
) -> Result<()> {
    let cmd = MonCommand::new("auth add")
        .arg("entity", entity)
        .arg("caps", caps.to_vec());
    conn.mon_command_with_input_buffer(&cmd, keyring).await.map(|_| ())
}

pub async fn auth_del(conn: &dyn ClusterConnection, entity: &str) -> Result<()> {
    conn.mon_command(&MonCommand::new("auth del").arg("entity", entity))
        .await
        .map(|_| ())
}

#[derive(Deserialize)]
struct OsdCreateResponse {
    osdid: u32,
}

/// Allocate a cluster-wide OSD id for `uuid`
pub async fn osd_create(conn: &dyn ClusterConnection, uuid: &str) -> Result<u32> {
    let cmd = MonCommand::new("osd create")
        .field("entity", format!("client.{}", crate::BOOTSTRAP_OSD_USER))
        .arg("uuid", uuid);
    let resp: OsdCreateResponse = mon_json(conn, &cmd).await?;
    Ok(resp.osdid)
}

pub async fn osd_out(conn: &dyn ClusterConnection, id: u32) -> Result<()> {
    conn.mon_command(&MonCommand::new("osd out").arg("ids", vec![id.to_string()]))
        .await
        .map(|_| ())
}

pub async fn osd_crush_remove(conn: &dyn ClusterConnection, id: u32) -> Result<()> {
    conn.mon_command(&MonCommand::new("osd crush remove").arg("name", format!("osd.{id}")))
        .await
        .map(|_| ())
}

pub async fn osd_rm(conn: &dyn ClusterConnection, id: u32) -> Result<()> {
    conn.mon_command(&MonCommand::new("osd rm").arg("ids", vec![id.to_string()]))
        .await
        .map(|_| ())
}

/// CRUSH weight of an OSD: its data capacity in TiB-like units, the
/// kilobytes of the file system divided by 2^30
#[must_use]
pub fn crush_weight(total_bytes: u64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let kb = (total_bytes / 1024) as f64;
    let weight = kb / 1_073_741_824.0;
    (weight * 10_000.0).round() / 10_000.0
}

/// Place (or move) an OSD in the CRUSH map
pub async fn osd_crush_create_or_move(
    conn: &dyn ClusterConnection,
    id: u32,
    weight: f64,
    location: &[String],
) -> Result<()> {
    let cmd = MonCommand::new("osd crush create-or-move")
        .arg("id", id)
        .arg("weight", weight)
        .arg("args", location.to_vec());
    conn.mon_command(&cmd).await.map(|_| ())
}

/// Create the default replicated rule with host as failure domain
pub async fn create_default_crush_rule(conn: &dyn ClusterConnection, name: &str) -> Result<()> {
    let cmd = MonCommand::new("osd crush rule create-simple")
        .arg("name", name)
        .arg("root", "default")
        .arg("type", "host");
    conn.mon_command(&cmd).await.map(|_| ())
}

pub async fn pool_create(conn: &dyn ClusterConnection, pool: &str, pg_num: u32) -> Result<()> {
    let cmd = MonCommand::new("osd pool create")
        .arg("pool", pool)
        .arg("pg_num", pg_num);
    conn.mon_command(&cmd).await.map(|_| ())
}

/// Output of `fs get`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FilesystemDetails {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub mdsmap: MdsMap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MdsMap {
    #[serde(default)]
    pub fs_name: String,
    #[serde(default)]
    pub info: BTreeMap<String, MdsInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MdsInfo {
    pub gid: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
}

/// Details of a file system; `NotFound` when it does not exist
pub async fn fs_get(conn: &dyn ClusterConnection, name: &str) -> Result<FilesystemDetails> {
    mon_json(conn, &MonCommand::new("fs get").arg("fs_name", name)).await
}

pub async fn fs_new(
    conn: &dyn ClusterConnection,
    name: &str,
    metadata_pool: &str,
    data_pool: &str,
) -> Result<()> {
    let cmd = MonCommand::new("fs new")
        .arg("fs_name", name)
        .arg("metadata", metadata_pool)
        .arg("data", data_pool);
    conn.mon_command(&cmd).await.map(|_| ())
}

pub async fn fs_set(conn: &dyn ClusterConnection, name: &str, var: &str, val: &str) -> Result<()> {
    let cmd = MonCommand::new("fs set")
        .arg("fs_name", name)
        .arg("var", var)
        .arg("val", val);
    conn.mon_command(&cmd).await.map(|_| ())
}

pub async fn fs_rm(conn: &dyn ClusterConnection, name: &str) -> Result<()> {
    let cmd = MonCommand::new("fs rm")
        .arg("fs_name", name)
        .arg("sure", "--yes-i-really-mean-it");
    conn.mon_command(&cmd).await.map(|_| ())
}

pub async fn mds_fail(conn: &dyn ClusterConnection, gid: u64) -> Result<()> {
    conn.mon_command(&MonCommand::new("mds fail").arg("who", gid.to_string()))
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConnectionFactory;
    use crate::testing::{MockConnectionFactory, sample_info};
    use serde_json::json;

    #[test]
    fn test_in_quorum() {
        let status: MonStatus = serde_json::from_value(json!({
            "quorum": [0, 2],
            "monmap": {"mons": [
                {"name": "mon0", "rank": 0},
                {"name": "mon1", "rank": 1},
                {"name": "mon2", "rank": 2},
            ]},
        }))
        .unwrap();
        assert!(status.in_quorum("mon0"));
        assert!(!status.in_quorum("mon1"));
        assert!(!status.in_quorum("mon9"));
    }

    #[test]
    fn test_crush_weight() {
        assert!((crush_weight(1_099_511_627_776) - 1.0).abs() < f64::EPSILON);
        assert!((crush_weight(1_073_741_824) - 0.001).abs() < f64::EPSILON);
        assert!(crush_weight(0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_osd_create() {
        let factory = MockConnectionFactory::new();
        factory.on_json("osd create", json!({"osdid": 3}));
        let conn = factory.connect(&sample_info(), "bootstrap-osd").await.unwrap();
        assert_eq!(osd_create(conn.as_ref(), "u-u-i-d").await.unwrap(), 3);

        let calls = factory.calls_with_prefix("osd create");
        assert_eq!(calls[0].user, "bootstrap-osd");
        assert_eq!(calls[0].json["entity"], "client.bootstrap-osd");
        assert_eq!(calls[0].json["uuid"], "u-u-i-d");
    }

    #[tokio::test]
    async fn test_bad_response_is_external() {
        let factory = MockConnectionFactory::new();
        factory.on("mon_status", b"not json".to_vec());
        let conn = factory.connect(&sample_info(), "admin").await.unwrap();
        let err = mon_status(conn.as_ref()).await.unwrap_err();
        assert!(matches!(err, Error::External { .. }));
    }

    #[tokio::test]
    async fn test_fs_get_mds_gids() {
        let factory = MockConnectionFactory::new();
        factory.on_json(
            "fs get",
            json!({"id": 1, "mdsmap": {"fs_name": "myfs", "info": {"gid_4107": {"gid": 4107, "name": "mds1", "state": "up:active"}}}}),
        );
        let conn = factory.connect(&sample_info(), "admin").await.unwrap();
        let fs = fs_get(conn.as_ref(), "myfs").await.unwrap();
        let gids: Vec<u64> = fs.mdsmap.info.values().map(|m| m.gid).collect();
        assert_eq!(gids, vec![4107]);
    }
}
