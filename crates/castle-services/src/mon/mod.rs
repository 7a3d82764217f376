//! Monitors
//!
//! The leader picks the nodes that host monitors and names each monitor
//! `mon<N>`. The monitor agent on a chosen node writes the keyring and
//! config, creates the monitor store once and runs `ceph-mon`.
//!
//! ```text
//! monitor/{desired,applied}/<node>/{id,ipaddress,port}
//! ```

pub mod agent;
pub mod leader;

pub use agent::{MON_AGENT, MonitorAgent};
pub use leader::{MonitorLeader, monitor_count};

use castle_cluster::MonitorEndpoint;
use std::collections::BTreeMap;

/// Port every monitor listens on
pub const MON_PORT: &str = "6790";

const ID: &str = "id";
const IP_ADDRESS: &str = "ipaddress";
const PORT: &str = "port";

/// Store properties describing `mon`
fn monitor_properties(mon: &MonitorEndpoint) -> BTreeMap<String, String> {
    let (ip, port) = mon
        .endpoint
        .rsplit_once(':')
        .unwrap_or((mon.endpoint.as_str(), MON_PORT));
    BTreeMap::from([
        (ID.to_string(), mon.name.clone()),
        (IP_ADDRESS.to_string(), ip.to_string()),
        (PORT.to_string(), port.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_properties() {
        let props = monitor_properties(&MonitorEndpoint::new("mon2", "10.0.0.3:6790"));
        assert_eq!(props[ID], "mon2");
        assert_eq!(props[IP_ADDRESS], "10.0.0.3");
        assert_eq!(props[PORT], "6790");
    }
}
