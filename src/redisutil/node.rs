//! A cluster node as reported by `CLUSTER NODES`.

use std::collections::BTreeSet;
use std::fmt;

use super::slot::{format_slots, parse_slot_field, Slot};
use crate::error::RedisError;

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Master,
    Slave,
    None,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => f.write_str("master"),
            NodeRole::Slave => f.write_str("slave"),
            NodeRole::None => f.write_str("none"),
        }
    }
}

/// A Redis cluster node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Cluster node id (40 hex chars).
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub role: NodeRole,
    /// Id of the master this node replicates, for replicas.
    pub master_ref: Option<String>,
    /// Slots owned by this node.
    pub slots: BTreeSet<Slot>,
    pub flags: Vec<String>,
    /// `connected` or `disconnected`.
    pub link_state: String,
    /// Pod backing this node, filled in when the snapshot is matched against pods.
    pub pod_name: Option<String>,
}

/// A list of nodes.
pub type Nodes = Vec<Node>;

impl Node {
    pub fn new(id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            port,
            role: NodeRole::Master,
            master_ref: None,
            slots: BTreeSet::new(),
            flags: vec!["master".to_string()],
            link_state: "connected".to_string(),
            pod_name: None,
        }
    }

    /// Parse one line of `CLUSTER NODES` output.
    ///
    /// `<id> <ip:port@cport> <flags> <master> <ping> <pong> <epoch> <link> <slot>...`
    pub fn from_cluster_nodes_line(line: &str) -> Result<Self, RedisError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(RedisError::Protocol(format!(
                "CLUSTER NODES line has {} fields: '{}'",
                fields.len(),
                line
            )));
        }

        let (ip, port) = parse_address(fields[1])?;
        let flags: Vec<String> = fields[2].split(',').map(|f| f.to_string()).collect();
        let role = if flags.iter().any(|f| f == "master") {
            NodeRole::Master
        } else if flags.iter().any(|f| f == "slave") {
            NodeRole::Slave
        } else {
            NodeRole::None
        };
        let master_ref = match fields[3] {
            "-" => None,
            id => Some(id.to_string()),
        };

        let mut slots = BTreeSet::new();
        for field in &fields[8..] {
            if let Some(range) = parse_slot_field(field)? {
                slots.extend(range.iter());
            }
        }

        Ok(Self {
            id: fields[0].to_string(),
            ip,
            port,
            role,
            master_ref,
            slots,
            flags,
            link_state: fields[7].to_string(),
            pod_name: None,
        })
    }

    pub fn ip_port(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    pub fn is_slave(&self) -> bool {
        self.role == NodeRole::Slave
    }

    pub fn has_slots(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn is_myself(&self) -> bool {
        self.has_flag("myself")
    }

    /// Node is flagged failing or possibly failing.
    pub fn has_failure(&self) -> bool {
        self.has_flag("fail") || self.has_flag("fail?")
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Turn this node into a replica of `master_id`.
    pub fn set_replica_of(&mut self, master_id: &str) {
        self.role = NodeRole::Slave;
        self.master_ref = Some(master_id.to_string());
        self.flags.retain(|f| f != "master");
        if !self.has_flag("slave") {
            self.flags.push("slave".to_string());
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{} {} {}", self.id, self.ip_port(), self.role)?;
        if let Some(master) = &self.master_ref {
            write!(f, " master:{}", master)?;
        }
        if self.has_slots() {
            write!(f, " slots:[{}]", format_slots(&self.slots))?;
        }
        f.write_str("}")
    }
}

/// Parse `ip:port@cport[,hostname]`.
fn parse_address(field: &str) -> Result<(String, u16), RedisError> {
    let addr = field.split(',').next().unwrap_or(field);
    let addr = addr.split('@').next().unwrap_or(addr);
    let (ip, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| RedisError::Protocol(format!("invalid node address '{}'", field)))?;
    let port = port
        .parse()
        .map_err(|_| RedisError::Protocol(format!("invalid port in '{}'", field)))?;
    Ok((ip.to_string(), port))
}
