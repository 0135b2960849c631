use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use tracing::debug;
use zerogate_packet::{match_sni, SniVerdict};

use crate::rule::{Action, CompiledBundle, DestMatcher, SourceKind};

/// Who sent the packet, as established at handshake time.
///
/// Borrowed straight out of the session so evaluation allocates nothing.
#[derive(Debug, Clone, Copy)]
pub struct SourceCtx<'a> {
    pub ip: Ipv4Addr,
    pub identity: &'a str,
    pub groups: &'a [String],
    pub os: &'a str,
}

impl SourceCtx<'_> {
    fn matches_identity(&self, value: &str) -> bool {
        self.identity == value || self.groups.iter().any(|g| g == value)
    }
}

/// Holds the live bundle and answers per-packet decisions against it.
///
/// `install` publishes a fully compiled bundle with one pointer swap;
/// callers that need several reads against one consistent bundle take a
/// [`PolicyEngine::snapshot`] first.
pub struct PolicyEngine {
    bundle: ArcSwap<CompiledBundle>,
}

impl PolicyEngine {
    /// Starts with an empty, default-block bundle so nothing is forwarded
    /// before the first config install.
    pub fn new() -> Self {
        Self {
            bundle: ArcSwap::from_pointee(CompiledBundle::empty()),
        }
    }

    pub fn install(&self, bundle: CompiledBundle) {
        self.bundle.store(Arc::new(bundle));
    }

    pub fn snapshot(&self) -> Arc<CompiledBundle> {
        self.bundle.load_full()
    }

    /// Per-packet decision. `packet` is the raw IPv4 packet (for the SNI
    /// walk); `dst` its destination address.
    pub fn is_allowed(&self, packet: &[u8], source: &SourceCtx<'_>, dst: Ipv4Addr) -> bool {
        self.bundle.load().is_allowed(packet, source, dst)
    }

    /// The CIDRs any allow rule admits for this identity, in rule order.
    pub fn allowed_cidrs(&self, identity: &str, groups: &[String], os: &str) -> Vec<Ipv4Net> {
        self.bundle.load().allowed_cidrs(identity, groups, os)
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CompiledBundle {
    pub fn is_allowed(&self, packet: &[u8], source: &SourceCtx<'_>, dst: Ipv4Addr) -> bool {
        for rule in &self.rules {
            let src_match = match rule.source_kind {
                SourceKind::Identity => source.matches_identity(&rule.source_value),
                SourceKind::DeviceOs => rule.source_value.eq_ignore_ascii_case(source.os),
            };
            if !src_match {
                continue;
            }

            let dst_match = match &rule.dest {
                DestMatcher::Cidr(nets) => nets.iter().any(|net| net.contains(&dst)),
                // Bypass counts as matching so non-TLS traffic is not
                // spuriously blocked by SNI-scoped allow rules.
                DestMatcher::Sni(host) => matches!(
                    match_sni(packet, host),
                    SniVerdict::Match | SniVerdict::Bypass
                ),
            };
            if !dst_match {
                continue;
            }

            match rule.action {
                Action::Allow => return true,
                Action::Deny => {
                    debug!(rule = %rule.name, src = %source.ip, dst = %dst, "denied by rule");
                    return false;
                }
            }
        }

        if self.default_block {
            debug!(src = %source.ip, dst = %dst, "blocked by default policy");
            false
        } else {
            true
        }
    }

    /// Union of `cidr` destinations over allow rules whose source matches
    /// the identity, deduplicated, preserving rule order. This is the
    /// route set the client installs.
    pub fn allowed_cidrs(&self, identity: &str, groups: &[String], os: &str) -> Vec<Ipv4Net> {
        let mut routes: Vec<Ipv4Net> = Vec::new();
        for rule in &self.rules {
            if rule.action != Action::Allow {
                continue;
            }
            let src_match = match rule.source_kind {
                SourceKind::Identity => {
                    identity == rule.source_value || groups.iter().any(|g| *g == rule.source_value)
                }
                SourceKind::DeviceOs => rule.source_value.eq_ignore_ascii_case(os),
            };
            if !src_match {
                continue;
            }
            if let DestMatcher::Cidr(nets) = &rule.dest {
                for net in nets {
                    if !routes.contains(net) {
                        routes.push(*net);
                    }
                }
            }
        }
        routes
    }
}
