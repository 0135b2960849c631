//! The gateway's conditional-access engine.
//!
//! Policies arrive from the control plane as a flat, already-flattened
//! rule list ([`RuleSpec`]); this crate compiles them into a fixed
//! evaluation order, answers the per-packet allow/deny question, and
//! derives the route set a connected identity is entitled to.
//!
//! A compiled bundle is immutable. Updates are published with a single
//! atomic pointer swap, so an evaluation in flight sees either the old
//! bundle or the new one, never a mixture.

mod engine;
mod rule;

pub use engine::{PolicyEngine, SourceCtx};
pub use rule::{Action, BundleSpec, CompiledBundle, CompiledRule, DestKind, RuleSpec, SourceKind};
