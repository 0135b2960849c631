//! Projection of the admin-facing policy model onto the data plane.
//!
//! Administrators author policies as AND/OR condition trees mixing
//! sign-in and access criteria. The gateway's engine wants a flat,
//! priority-ordered rule list, so the control plane walks each tree and
//! emits one flat rule per supported leaf condition. Trees are stored as
//! arenas of nodes with index children, which survives serialization
//! without back-reference gymnastics.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zerogate_policy::{Action, DestKind, RuleSpec, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Destination {
    Cidr { value: String },
    Sni { value: String },
    /// A published application: a named bundle of CIDRs that expands to
    /// one comma-joined `cidr` rule.
    App { name: String, cidrs: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionKind {
    User,
    Group,
    Device,
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    #[serde(default)]
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "lowercase")]
pub enum TreeNode {
    Branch { op: BranchOp, children: Vec<usize> },
    Leaf { condition: Condition },
}

/// Arena-stored condition tree; `root` indexes into `nodes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionTree {
    pub nodes: Vec<TreeNode>,
    pub root: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDoc {
    pub name: String,
    pub priority: i32,
    pub effect: Effect,
    pub destination: Destination,
    pub conditions: ConditionTree,
}

fn prefix_group(value: &str) -> String {
    if value.starts_with("group:") {
        value.to_string()
    } else {
        format!("group:{value}")
    }
}

/// Maps one leaf condition to a data-plane source criterion. `Network`
/// conditions are enforced at sign-in time and emit nothing here.
fn map_condition(policy: &str, c: &Condition) -> Option<(SourceKind, String)> {
    match c.kind {
        ConditionKind::User => {
            if c.field == "group" {
                Some((SourceKind::Identity, prefix_group(&c.value)))
            } else {
                Some((SourceKind::Identity, c.value.clone()))
            }
        }
        ConditionKind::Group => Some((SourceKind::Identity, prefix_group(&c.value))),
        ConditionKind::Device => {
            if c.field == "os" {
                Some((SourceKind::DeviceOs, c.value.clone()))
            } else {
                warn!(policy, field = %c.field, "unsupported device condition dropped");
                None
            }
        }
        ConditionKind::Network => {
            debug!(policy, "network condition enforced at sign-in, not per packet");
            None
        }
    }
}

/// DFS over the arena collecting every supported leaf. AND and OR both
/// flatten into the same list: the data plane has no conjunction, so a
/// conservative OR projection is used for the packet filter.
fn collect_sources(policy: &str, tree: &ConditionTree) -> Vec<(SourceKind, String)> {
    let mut out = Vec::new();
    let mut visited = vec![false; tree.nodes.len()];
    let mut stack = vec![tree.root];

    while let Some(idx) = stack.pop() {
        let Some(node) = tree.nodes.get(idx) else {
            warn!(policy, idx, "condition tree references a missing node");
            continue;
        };
        if std::mem::replace(&mut visited[idx], true) {
            continue;
        }
        match node {
            TreeNode::Leaf { condition } => {
                if let Some(mapped) = map_condition(policy, condition) {
                    out.push(mapped);
                }
            }
            TreeNode::Branch { children, .. } => {
                // Reverse keeps left-to-right leaf order on the stack.
                for &child in children.iter().rev() {
                    stack.push(child);
                }
            }
        }
    }
    out
}

fn map_destination(doc: &PolicyDoc) -> Option<(DestKind, String)> {
    match &doc.destination {
        Destination::Cidr { value } => Some((DestKind::Cidr, value.clone())),
        Destination::Sni { value } => Some((DestKind::Sni, value.clone())),
        Destination::App { name, cidrs } => {
            if cidrs.is_empty() {
                warn!(policy = %doc.name, app = %name, "application has no CIDRs, rule dropped");
                return None;
            }
            Some((DestKind::Cidr, cidrs.join(",")))
        }
    }
}

/// Flattens every policy document into data-plane rules. Unsupported
/// conditions cost the individual rule, never the bundle.
pub fn flatten(policies: &[PolicyDoc]) -> Vec<RuleSpec> {
    let mut rules = Vec::new();
    for doc in policies {
        let sources = collect_sources(&doc.name, &doc.conditions);
        if sources.is_empty() {
            continue;
        }
        let Some((dest_kind, dest_value)) = map_destination(doc) else {
            continue;
        };
        let action = match doc.effect {
            Effect::Allow => Action::Allow,
            Effect::Deny => Action::Deny,
        };
        for (source_kind, source_value) in sources {
            rules.push(RuleSpec {
                name: doc.name.clone(),
                priority: doc.priority,
                action,
                source_kind,
                source_value,
                dest_kind,
                dest_value: dest_value.clone(),
            });
        }
    }
    rules
}
