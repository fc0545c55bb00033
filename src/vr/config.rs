//! Replica-set configuration: node descriptors, timeouts, and the
//! reconfiguration log-distance guard, plus its textual codec.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::rpc::Properties;
use crate::utils::{MetaError, ServerLocation};

use get_size::GetSize;
use serde::{Deserialize, Serialize};

/// Replica node ID type.
pub type NodeId = i64;

/// Unassigned node ID.
pub const NODE_ID_NONE: NodeId = -1;

/// Property name prefix the VR parameters are discovered under.
pub const VR_PARAMETERS_PREFIX: &str = "metaServer.vr.";

/// Per-node role flag bits.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Default, Hash, Serialize,
    Deserialize, GetSize,
)]
pub struct NodeFlags(pub u64);

impl NodeFlags {
    pub const NONE: NodeFlags = NodeFlags(0);
    /// Participates in quorum but never becomes primary and never replays.
    pub const WITNESS: NodeFlags = NodeFlags(0x1);
    /// May serve as primary and replays committed records.
    pub const ACTIVE: NodeFlags = NodeFlags(0x2);

    /// Raw bit value.
    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn is_witness(self) -> bool {
        self.0 & Self::WITNESS.0 != 0
    }

    pub fn is_active(self) -> bool {
        self.0 & Self::ACTIVE.0 != 0
    }
}

/// Descriptor of one replica node.
#[derive(
    Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize, GetSize,
)]
pub struct NodeInfo {
    /// Role flags.
    pub flags: NodeFlags,

    /// Primary-selection tie-break priority; lower is preferred.
    pub primary_order: i32,

    /// Listener endpoints, in preference order. Never empty in a valid
    /// configuration.
    pub locations: Vec<ServerLocation>,
}

impl NodeInfo {
    /// Creates a descriptor from parts.
    pub fn new(
        flags: NodeFlags,
        primary_order: i32,
        locations: Vec<ServerLocation>,
    ) -> Self {
        NodeInfo {
            flags,
            primary_order,
            locations,
        }
    }
}

/// The replica-set descriptor: node map plus protocol timing parameters.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct VrConfig {
    /// Node ID -> descriptor.
    pub nodes: BTreeMap<NodeId, NodeInfo>,

    /// Seconds of primary inactivity before a backup calls a view change.
    pub primary_timeout: i32,

    /// Seconds a primary waits for quorum acks before stepping down. Must
    /// exceed `primary_timeout`.
    pub backup_timeout: i32,

    /// Max records a replica may lag a new view's base by before it must
    /// pull a checkpoint instead of catching up in-view.
    pub change_view_max_log_distance: i64,

    /// Cap on listener locations per node.
    pub max_listeners_per_node: u32,
}

impl Default for VrConfig {
    fn default() -> Self {
        VrConfig {
            nodes: BTreeMap::new(),
            primary_timeout: 4,
            backup_timeout: 8,
            change_view_max_log_distance: 128 << 10,
            max_listeners_per_node: 16,
        }
    }
}

impl VrConfig {
    /// Whether no nodes are configured.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts a node descriptor; returns false if the id already exists.
    pub fn add_node(&mut self, id: NodeId, node: NodeInfo) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        self.nodes.insert(id, node);
        true
    }

    /// Removes a node; returns false if absent.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        self.nodes.remove(&id).is_some()
    }

    /// Whether the given node is a member.
    pub fn has_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Descriptor of a member node.
    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    /// Number of Active (non-witness) nodes.
    pub fn active_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.flags.is_active() && !n.flags.is_witness())
            .count()
    }

    /// Smallest majority of Active nodes.
    pub fn quorum(&self) -> usize {
        self.active_count() / 2 + 1
    }

    /// Whether the node's acks count toward quorum (Active or Witness).
    pub fn is_voting(&self, id: NodeId) -> bool {
        self.nodes
            .get(&id)
            .map(|n| n.flags.is_active() || n.flags.is_witness())
            .unwrap_or(false)
    }

    /// Whether the node may be chosen primary.
    pub fn is_primary_eligible(&self, id: NodeId) -> bool {
        self.nodes
            .get(&id)
            .map(|n| n.flags.is_active() && !n.flags.is_witness())
            .unwrap_or(false)
    }

    /// Serializes into the whitespace-token wire/checkpoint form:
    /// `nodeCount primaryTimeout backupTimeout changeViewMaxLogDistance
    /// maxListenersPerNode` followed by per-node records
    /// `nodeId locationCount flags primaryOrder loc1 loc2 ...`.
    pub fn encode(&self) -> String {
        let mut out = format!(
            "{} {} {} {} {}",
            self.nodes.len(),
            self.primary_timeout,
            self.backup_timeout,
            self.change_view_max_log_distance,
            self.max_listeners_per_node,
        );
        for (id, node) in &self.nodes {
            out.push_str(&format!(
                " {} {} {} {}",
                id,
                node.locations.len(),
                node.flags.bits(),
                node.primary_order,
            ));
            for loc in &node.locations {
                out.push_str(&format!(" {}", loc));
            }
        }
        out
    }

    /// Deserializes from the token form, all-or-nothing: on any malformed
    /// field the target is reset to the empty map and an error returned.
    /// Duplicate node ids keep the entry with the lower `primary_order`.
    pub fn decode(&mut self, text: &str) -> Result<(), MetaError> {
        match Self::decode_inner(text) {
            Ok(config) => {
                *self = config;
                Ok(())
            }
            Err(e) => {
                self.nodes.clear();
                Err(e)
            }
        }
    }

    fn decode_inner(text: &str) -> Result<VrConfig, MetaError> {
        let mut tokens = text.split_ascii_whitespace();

        let node_count = next_i64(&mut tokens, "nodeCount")?;
        if node_count < 0 {
            return Err(MetaError::msg("config invalid field 'nodeCount'"));
        }
        let primary_timeout = next_i64(&mut tokens, "primaryTimeout")?;
        if primary_timeout <= 0 {
            return Err(MetaError::msg(
                "config invalid field 'primaryTimeout'",
            ));
        }
        let backup_timeout = next_i64(&mut tokens, "backupTimeout")?;
        if backup_timeout <= 0 {
            return Err(MetaError::msg(
                "config invalid field 'backupTimeout'",
            ));
        }
        let change_view_max_log_distance =
            next_i64(&mut tokens, "changeViewMaxLogDistance")?;
        if change_view_max_log_distance < 0 {
            return Err(MetaError::msg(
                "config invalid field 'changeViewMaxLogDistance'",
            ));
        }
        let max_listeners_per_node =
            next_i64(&mut tokens, "maxListenersPerNode")?;
        if max_listeners_per_node <= 0 {
            return Err(MetaError::msg(
                "config invalid field 'maxListenersPerNode'",
            ));
        }

        let mut nodes: BTreeMap<NodeId, NodeInfo> = BTreeMap::new();
        let mut ingested = 0;
        while ingested < node_count {
            let id = next_i64(&mut tokens, "nodeId")?;
            if id < 0 {
                return Err(MetaError::msg("config invalid field 'nodeId'"));
            }
            let loc_count = next_i64(&mut tokens, "locationCount")?;
            if loc_count <= 0 {
                return Err(MetaError::msg(
                    "config invalid field 'locationCount'",
                ));
            }
            let flags =
                NodeFlags(next_i64(&mut tokens, "flags")? as u64);
            let primary_order =
                next_i64(&mut tokens, "primaryOrder")? as i32;
            let mut locations = Vec::with_capacity(loc_count as usize);
            for _ in 0..loc_count {
                let loc: ServerLocation =
                    next_token(&mut tokens, "location")?.parse()?;
                locations.push(loc);
            }

            let node = NodeInfo::new(flags, primary_order, locations);
            if let Some(have) = nodes.get(&id) {
                pf_warn!(
                    "duplicate node id {} in config; keeping lower primary order",
                    id
                );
                if node.primary_order < have.primary_order {
                    nodes.insert(id, node);
                }
            } else {
                nodes.insert(id, node);
            }
            ingested += 1;
        }

        Ok(VrConfig {
            nodes,
            primary_timeout: primary_timeout as i32,
            backup_timeout: backup_timeout as i32,
            change_view_max_log_distance,
            max_listeners_per_node: max_listeners_per_node as u32,
        })
    }

    /// Enforces the structural invariants. Configurations that cannot
    /// survive a single failure are permitted but logged.
    pub fn validate(&self) -> Result<(), MetaError> {
        if self.nodes.is_empty() {
            return logged_err!("config validate: no nodes configured");
        }
        if self.primary_timeout < 1 {
            return logged_err!(
                "config validate: primaryTimeout {} < 1",
                self.primary_timeout
            );
        }
        if self.backup_timeout <= self.primary_timeout {
            return logged_err!(
                "config validate: backupTimeout {} <= primaryTimeout {}",
                self.backup_timeout,
                self.primary_timeout
            );
        }
        if self.change_view_max_log_distance < 0 {
            return logged_err!(
                "config validate: changeViewMaxLogDistance {} < 0",
                self.change_view_max_log_distance
            );
        }
        if self.max_listeners_per_node < 1 {
            return logged_err!(
                "config validate: maxListenersPerNode {} < 1",
                self.max_listeners_per_node
            );
        }
        for (id, node) in &self.nodes {
            if node.locations.is_empty() {
                return logged_err!(
                    "config validate: node {} has no locations",
                    id
                );
            }
            if node.locations.len() > self.max_listeners_per_node as usize {
                return logged_err!(
                    "config validate: node {} exceeds {} listeners",
                    id,
                    self.max_listeners_per_node
                );
            }
            for loc in &node.locations {
                if !loc.is_valid() {
                    return logged_err!(
                        "config validate: node {} location '{}' invalid",
                        id,
                        loc
                    );
                }
            }
            if node.flags.is_active() && node.flags.is_witness() {
                return logged_err!(
                    "config validate: node {} flagged both Active and Witness",
                    id
                );
            }
        }
        let active = self.active_count();
        if active < 1 {
            return logged_err!("config validate: no Active node");
        }
        if active < 2 * self.quorum() - 1 {
            pf_warn!(
                "config with {} Active nodes cannot survive a failure",
                active
            );
        }
        Ok(())
    }

    /// Stable hash of the serialized form, carried in view-change messages
    /// to detect configuration disagreement between peers.
    pub fn config_hash(&self) -> u64 {
        crc32c::crc32c(self.encode().as_bytes()) as u64
    }

    /// Discovers a configuration from `metaServer.vr.`-prefixed name/value
    /// properties: `primaryTimeout`, `backupTimeout`,
    /// `changeViewMaxLogDistance`, `maxListenersPerNode`, plus per-node
    /// `nodes.<id>.flags`, `nodes.<id>.primaryOrder`,
    /// `nodes.<id>.listener.<n>`.
    pub fn from_properties(
        prefix: &str,
        props: &Properties,
    ) -> Result<VrConfig, MetaError> {
        let mut config = VrConfig::default();
        let mut listeners: BTreeMap<NodeId, BTreeMap<u32, ServerLocation>> =
            BTreeMap::new();

        for (name, value) in props.iter() {
            let Some(name) = name.strip_prefix(prefix) else {
                continue;
            };
            match name {
                "primaryTimeout" => config.primary_timeout = value.parse()?,
                "backupTimeout" => config.backup_timeout = value.parse()?,
                "changeViewMaxLogDistance" => {
                    config.change_view_max_log_distance = value.parse()?
                }
                "maxListenersPerNode" => {
                    config.max_listeners_per_node = value.parse()?
                }
                _ => {
                    let Some(rest) = name.strip_prefix("nodes.") else {
                        return Err(MetaError(format!(
                            "unknown vr parameter '{}'",
                            name
                        )));
                    };
                    let (id, field) =
                        rest.split_once('.').ok_or_else(|| {
                            MetaError(format!(
                                "malformed vr node parameter '{}'",
                                name
                            ))
                        })?;
                    let id: NodeId = id.parse()?;
                    let node = config.nodes.entry(id).or_default();
                    if field == "flags" {
                        node.flags = NodeFlags(value.parse()?);
                    } else if field == "primaryOrder" {
                        node.primary_order = value.parse()?;
                    } else if let Some(n) = field.strip_prefix("listener.") {
                        listeners
                            .entry(id)
                            .or_default()
                            .insert(n.parse()?, value.parse()?);
                    } else {
                        return Err(MetaError(format!(
                            "unknown vr node parameter '{}'",
                            name
                        )));
                    }
                }
            }
        }

        for (id, locs) in listeners {
            let node = config.nodes.entry(id).or_default();
            node.locations = locs.into_values().collect();
        }
        Ok(config)
    }
}

// Token-stream helpers for the whitespace codec.
fn next_token<'a>(
    tokens: &mut std::str::SplitAsciiWhitespace<'a>,
    what: &str,
) -> Result<&'a str, MetaError> {
    tokens
        .next()
        .ok_or_else(|| MetaError(format!("config missing field '{}'", what)))
}

fn next_i64(
    tokens: &mut std::str::SplitAsciiWhitespace<'_>,
    what: &str,
) -> Result<i64, MetaError> {
    next_token(tokens, what)?
        .parse()
        .map_err(|_| MetaError(format!("config invalid field '{}'", what)))
}

impl FromStr for VrConfig {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut config = VrConfig::default();
        config.decode(s)?;
        Ok(config)
    }
}

impl fmt::Display for VrConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    pub(crate) fn three_nodes() -> VrConfig {
        let mut config = VrConfig::default();
        for (id, order) in [(1, 0), (2, 1), (3, 2)] {
            config.add_node(
                id,
                NodeInfo::new(
                    NodeFlags::ACTIVE,
                    order,
                    vec![ServerLocation::new("10.0.0.1", 20000 + id as u16)],
                ),
            );
        }
        config
    }

    #[test]
    fn encode_decode_roundtrip() -> Result<(), MetaError> {
        let config = three_nodes();
        let mut decoded = VrConfig::default();
        decoded.decode(&config.encode())?;
        assert_eq!(decoded, config);
        Ok(())
    }

    #[test]
    fn decode_invalid_leaves_empty() {
        let mut config = three_nodes();
        // truncated: promises 2 nodes, delivers 1
        assert!(config
            .decode("2 4 8 1024 16 1 1 2 0 host:9999")
            .is_err());
        assert!(config.is_empty());

        let mut config = three_nodes();
        assert!(config.decode("1 0 8 1024 16 1 1 2 0 h:1").is_err());
        assert!(config.is_empty());

        let mut config = three_nodes();
        assert!(config.decode("garbage").is_err());
        assert!(config.is_empty());
    }

    #[test]
    fn decode_duplicate_keeps_lower_order() -> Result<(), MetaError> {
        // node 5 appears twice; the primaryOrder 1 entry must win
        let text = "2 4 8 1024 16 5 1 2 7 a:1000 5 1 2 1 b:2000";
        let config: VrConfig = text.parse()?;
        assert_eq!(config.nodes.len(), 1);
        let node = config.node(5).unwrap();
        assert_eq!(node.primary_order, 1);
        assert_eq!(node.locations, vec![ServerLocation::new("b", 2000)]);
        Ok(())
    }

    #[test]
    fn validate_rejections() {
        let mut config = three_nodes();
        config.validate().unwrap();

        config.backup_timeout = config.primary_timeout;
        assert!(config.validate().is_err());

        let mut config = three_nodes();
        config.nodes.get_mut(&1).unwrap().locations.clear();
        assert!(config.validate().is_err());

        // Witness and Active together is forbidden
        let mut config = three_nodes();
        config.nodes.get_mut(&2).unwrap().flags =
            NodeFlags(NodeFlags::ACTIVE.0 | NodeFlags::WITNESS.0);
        assert!(config.validate().is_err());

        // all witnesses: no Active node left
        let mut config = three_nodes();
        for node in config.nodes.values_mut() {
            node.flags = NodeFlags::WITNESS;
        }
        assert!(config.validate().is_err());

        let empty = VrConfig::default();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn quorum_counts_active_only() {
        let mut config = three_nodes();
        assert_eq!(config.active_count(), 3);
        assert_eq!(config.quorum(), 2);

        // adding a witness does not change the Active count
        config.add_node(
            4,
            NodeInfo::new(
                NodeFlags::WITNESS,
                9,
                vec![ServerLocation::new("10.0.0.1", 20004)],
            ),
        );
        assert_eq!(config.active_count(), 3);
        assert_eq!(config.quorum(), 2);
        assert!(config.is_voting(4));
        assert!(!config.is_primary_eligible(4));
    }

    #[test]
    fn hash_tracks_content() {
        let config = three_nodes();
        let mut other = config.clone();
        assert_eq!(config.config_hash(), other.config_hash());
        other.nodes.get_mut(&3).unwrap().primary_order = 9;
        assert_ne!(config.config_hash(), other.config_hash());
    }

    #[test]
    fn discover_from_properties() -> Result<(), MetaError> {
        let mut props = Properties::new();
        props.set("metaServer.vr.primaryTimeout", "2");
        props.set("metaServer.vr.backupTimeout", "5");
        props.set("metaServer.vr.changeViewMaxLogDistance", "4096");
        props.set("metaServer.vr.maxListenersPerNode", "4");
        props.set("metaServer.vr.nodes.1.flags", "2");
        props.set("metaServer.vr.nodes.1.primaryOrder", "0");
        props.set("metaServer.vr.nodes.1.listener.0", "h1:20001");
        props.set("metaServer.vr.nodes.2.flags", "2");
        props.set("metaServer.vr.nodes.2.primaryOrder", "1");
        props.set("metaServer.vr.nodes.2.listener.0", "h2:20002");
        props.set("metaServer.vr.nodes.2.listener.1", "h2alt:20002");
        props.set("unrelated.parameter", "ignored");

        let config =
            VrConfig::from_properties(VR_PARAMETERS_PREFIX, &props)?;
        assert_eq!(config.primary_timeout, 2);
        assert_eq!(config.backup_timeout, 5);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.node(2).unwrap().locations.len(), 2);
        config.validate()?;
        Ok(())
    }
}
