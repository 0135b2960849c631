use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

impl Action {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Identity,
    DeviceOs,
}

impl SourceKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Identity => "identity",
            SourceKind::DeviceOs => "device_os",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestKind {
    Cidr,
    Sni,
}

impl DestKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DestKind::Cidr => "cidr",
            DestKind::Sni => "sni",
        }
    }
}

/// One flat rule as it travels over the wire from the control plane.
///
/// `dest_value` holds a comma-separated CIDR list for `cidr` rules and
/// an exact hostname for `sni` rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub priority: i32,
    pub action: Action,
    pub source_kind: SourceKind,
    pub source_value: String,
    pub dest_kind: DestKind,
    pub dest_value: String,
}

/// The wire form of a whole policy bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BundleSpec {
    pub rules: Vec<RuleSpec>,
    pub default_block: bool,
}

impl BundleSpec {
    /// Deterministic content hash; equivalent bundles hash identically.
    pub fn content_hash(&self) -> String {
        if self.rules.is_empty() {
            return "empty".to_string();
        }
        let mut hasher = Sha256::new();
        for r in &self.rules {
            hasher.update(r.name.as_bytes());
            hasher.update(r.action.as_str().as_bytes());
            hasher.update(r.priority.to_string().as_bytes());
            hasher.update(r.source_kind.as_str().as_bytes());
            hasher.update(r.source_value.as_bytes());
            hasher.update(r.dest_kind.as_str().as_bytes());
            hasher.update(r.dest_value.as_bytes());
            hasher.update(b"|");
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DestMatcher {
    Cidr(Vec<Ipv4Net>),
    Sni(String),
}

/// A rule in its evaluated form: source value interned, destination
/// CIDRs pre-parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    pub name: String,
    pub priority: i32,
    pub action: Action,
    pub source_kind: SourceKind,
    pub source_value: String,
    pub(crate) dest: DestMatcher,
}

impl CompiledRule {
    fn from_spec(spec: &RuleSpec) -> Self {
        let dest = match spec.dest_kind {
            DestKind::Sni => DestMatcher::Sni(spec.dest_value.clone()),
            DestKind::Cidr => {
                let mut prefixes = Vec::new();
                for part in spec.dest_value.trim().split(',') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    match part.parse::<Ipv4Net>() {
                        Ok(net) => prefixes.push(net),
                        Err(err) => {
                            warn!(rule = %spec.name, cidr = part, %err, "dropping invalid destination CIDR");
                        }
                    }
                }
                DestMatcher::Cidr(prefixes)
            }
        };
        Self {
            name: spec.name.clone(),
            priority: spec.priority,
            action: spec.action,
            source_kind: spec.source_kind,
            source_value: spec.source_value.clone(),
            dest,
        }
    }

    fn to_spec(&self) -> RuleSpec {
        let (dest_kind, dest_value) = match &self.dest {
            DestMatcher::Sni(host) => (DestKind::Sni, host.clone()),
            DestMatcher::Cidr(nets) => (
                DestKind::Cidr,
                nets.iter()
                    .map(|n| n.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        };
        RuleSpec {
            name: self.name.clone(),
            priority: self.priority,
            action: self.action,
            source_kind: self.source_kind,
            source_value: self.source_value.clone(),
            dest_kind,
            dest_value,
        }
    }
}

/// A fully compiled bundle: rules sorted by descending priority (stable,
/// so wire order breaks ties), plus the default action and content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledBundle {
    pub(crate) rules: Vec<CompiledRule>,
    pub default_block: bool,
    hash: String,
}

impl CompiledBundle {
    pub fn compile(spec: &BundleSpec) -> Self {
        let hash = spec.content_hash();
        let mut rules: Vec<CompiledRule> = spec.rules.iter().map(CompiledRule::from_spec).collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules,
            default_block: spec.default_block,
            hash,
        }
    }

    pub fn empty() -> Self {
        Self::compile(&BundleSpec {
            rules: Vec::new(),
            default_block: true,
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Re-serialises the compiled rules, in compiled order.
    pub fn to_spec(&self) -> BundleSpec {
        BundleSpec {
            rules: self.rules.iter().map(CompiledRule::to_spec).collect(),
            default_block: self.default_block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, priority: i32, dest_value: &str) -> RuleSpec {
        RuleSpec {
            name: name.to_string(),
            priority,
            action: Action::Allow,
            source_kind: SourceKind::Identity,
            source_value: "a@x".to_string(),
            dest_kind: DestKind::Cidr,
            dest_value: dest_value.to_string(),
        }
    }

    #[test]
    fn compile_sorts_by_priority_descending() {
        let spec = BundleSpec {
            rules: vec![rule("low", 10, "10.0.0.0/8"), rule("high", 100, "10.0.0.5/32")],
            default_block: true,
        };
        let bundle = CompiledBundle::compile(&spec);
        assert_eq!(bundle.rules[0].name, "high");
        assert_eq!(bundle.rules[1].name, "low");
    }

    #[test]
    fn equal_priorities_keep_wire_order() {
        let spec = BundleSpec {
            rules: vec![rule("first", 50, "10.0.0.0/8"), rule("second", 50, "10.1.0.0/16")],
            default_block: false,
        };
        let bundle = CompiledBundle::compile(&spec);
        assert_eq!(bundle.rules[0].name, "first");
        assert_eq!(bundle.rules[1].name, "second");
    }

    #[test]
    fn invalid_cidr_is_dropped_without_rejecting_the_rule() {
        let spec = BundleSpec {
            rules: vec![rule("mixed", 1, "10.0.0.0/24, not-a-cidr ,192.168.0.0/16")],
            default_block: true,
        };
        let bundle = CompiledBundle::compile(&spec);
        match &bundle.rules[0].dest {
            DestMatcher::Cidr(nets) => assert_eq!(nets.len(), 2),
            other => panic!("unexpected matcher {other:?}"),
        }
    }

    #[test]
    fn content_hash_is_deterministic_and_order_sensitive() {
        let a = BundleSpec {
            rules: vec![rule("a", 1, "10.0.0.0/8"), rule("b", 2, "10.1.0.0/16")],
            default_block: true,
        };
        let b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());

        let mut swapped = a.clone();
        swapped.rules.reverse();
        assert_ne!(a.content_hash(), swapped.content_hash());
    }

    #[test]
    fn empty_bundle_hashes_to_sentinel() {
        let spec = BundleSpec::default();
        assert_eq!(spec.content_hash(), "empty");
    }

    #[test]
    fn compile_serialize_compile_is_stable() {
        let spec = BundleSpec {
            rules: vec![
                rule("a", 10, "10.0.0.0/24,192.168.1.0/24"),
                RuleSpec {
                    name: "s".to_string(),
                    priority: 5,
                    action: Action::Deny,
                    source_kind: SourceKind::DeviceOs,
                    source_value: "linux".to_string(),
                    dest_kind: DestKind::Sni,
                    dest_value: "example.com".to_string(),
                },
            ],
            default_block: true,
        };
        let once = CompiledBundle::compile(&spec);
        let twice = CompiledBundle::compile(&once.to_spec());
        assert_eq!(once.rules, twice.rules);
        assert_eq!(once.default_block, twice.default_block);
    }
}
