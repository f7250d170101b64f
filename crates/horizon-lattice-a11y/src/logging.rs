//! Logging and debugging facilities for the relation cache.
//!
//! This module provides:
//! - Static `tracing` targets and span names for each subsystem
//! - Debug visualization of a snapshot's accessible tree and relations
//!
//! # Tracing Integration
//!
//! The cache never installs a subscriber. To see logs, install one in the
//! host application and filter by the targets in [`targets`]:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("horizon_lattice_a11y::engine=debug")
//!     .init();
//! ```
//!
//! # Debug Visualization
//!
//! ```ignore
//! use horizon_lattice_a11y::logging::AccessibleTreeDebug;
//!
//! let snapshot = cache.snapshot();
//! println!("{}", AccessibleTreeDebug::new().format(&snapshot));
//! ```

use std::fmt::{self, Write as FmtWrite};

use crate::registry::NodeId;
use crate::relation::RelationKind;
use crate::store::Snapshot;

/// Span names used by the relation cache.
pub mod span_names {
    /// Applying one change batch.
    pub const APPLY_BATCH: &str = "horizon_lattice_a11y::apply_batch";
    /// Reconciling the accessible tree with the content mirror.
    pub const RECONCILE: &str = "horizon_lattice_a11y::reconcile";
    /// Deriving relation tables.
    pub const DERIVE: &str = "horizon_lattice_a11y::derive";
    /// Dispatching change notifications.
    pub const DISPATCH: &str = "horizon_lattice_a11y::dispatch";
}

/// Target names for log filtering.
pub mod targets {
    /// Crate-level target.
    pub const A11Y: &str = "horizon_lattice_a11y";
    /// Node registry target.
    pub const REGISTRY: &str = "horizon_lattice_a11y::registry";
    /// Observer adapter target.
    pub const OBSERVER: &str = "horizon_lattice_a11y::observer";
    /// Relation engine target.
    pub const ENGINE: &str = "horizon_lattice_a11y::engine";
    /// Snapshot store target.
    pub const STORE: &str = "horizon_lattice_a11y::store";
    /// Notification dispatcher target.
    pub const DISPATCH: &str = "horizon_lattice_a11y::dispatch";
    /// Cache worker target.
    pub const CACHE: &str = "horizon_lattice_a11y::cache";
}

/// Style options for tree visualization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TreeStyle {
    /// ASCII characters for tree branches.
    Ascii,
    /// Unicode box-drawing characters.
    #[default]
    Unicode,
    /// Compact single-line representation.
    Compact,
}

/// Configuration for accessible tree debug output.
#[derive(Debug, Clone)]
pub struct TreeFormatOptions {
    /// The style of tree visualization.
    pub style: TreeStyle,
    /// Whether to show node IDs.
    pub show_ids: bool,
    /// Whether to show roles.
    pub show_roles: bool,
    /// Whether to list non-empty relations under each node.
    pub show_relations: bool,
    /// Maximum depth to traverse (None for unlimited).
    pub max_depth: Option<usize>,
    /// Indent size for each level.
    pub indent_size: usize,
}

impl Default for TreeFormatOptions {
    fn default() -> Self {
        Self {
            style: TreeStyle::default(),
            show_ids: true,
            show_roles: true,
            show_relations: false,
            max_depth: None,
            indent_size: 2,
        }
    }
}

impl TreeFormatOptions {
    /// Options including relations.
    pub fn detailed() -> Self {
        Self {
            show_relations: true,
            ..Default::default()
        }
    }

    /// Options for minimal output.
    pub fn minimal() -> Self {
        Self {
            show_ids: false,
            show_roles: false,
            show_relations: false,
            ..Default::default()
        }
    }
}

/// Renders the accessible tree of a [`Snapshot`].
#[derive(Debug, Clone, Default)]
pub struct AccessibleTreeDebug {
    options: TreeFormatOptions,
}

impl AccessibleTreeDebug {
    /// Create a visualizer with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a visualizer with custom options.
    pub fn with_options(options: TreeFormatOptions) -> Self {
        Self { options }
    }

    /// Format the whole tree of a snapshot.
    pub fn format(&self, snapshot: &Snapshot) -> String {
        let mut output = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_tree(snapshot, &mut output);
        output
    }

    /// Write the whole tree of a snapshot.
    pub fn write_tree(&self, snapshot: &Snapshot, output: &mut impl FmtWrite) -> fmt::Result {
        writeln!(
            output,
            "Accessible Tree {} ({} nodes):",
            snapshot.version(),
            snapshot.len()
        )?;
        match snapshot.root() {
            Some(root) => self.write_subtree(snapshot, root, 0, true, output),
            None => writeln!(output, "  (empty)"),
        }
    }

    fn write_subtree(
        &self,
        snapshot: &Snapshot,
        id: NodeId,
        depth: usize,
        is_last: bool,
        output: &mut impl FmtWrite,
    ) -> fmt::Result {
        if self.options.max_depth.is_some_and(|max| depth > max) {
            return Ok(());
        }
        let Some(info) = snapshot.node(id) else {
            return Ok(());
        };

        output.write_str(&self.build_prefix(depth, is_last))?;
        output.write_str(info.tag.as_deref().unwrap_or(info.role.name()))?;
        if let Some(dom_id) = &info.dom_id {
            write!(output, "#{dom_id}")?;
        }
        if self.options.show_ids {
            write!(output, " [{:?}]", id)?;
        }
        if self.options.show_roles {
            write!(output, " ({})", info.role.name())?;
        }
        output.write_char('\n')?;

        if self.options.show_relations {
            let prefix = self.build_relation_prefix(depth);
            for kind in RelationKind::ALL {
                let targets = snapshot.targets(kind, id);
                if !targets.is_empty() {
                    writeln!(output, "{prefix}  .{kind} -> {targets:?}")?;
                }
            }
        }

        let count = info.children.len();
        for (i, &child) in info.children.iter().enumerate() {
            self.write_subtree(snapshot, child, depth + 1, i + 1 == count, output)?;
        }
        Ok(())
    }

    fn build_prefix(&self, depth: usize, is_last: bool) -> String {
        if depth == 0 {
            return String::new();
        }

        let (branch, corner, last) = match self.options.style {
            TreeStyle::Ascii => ("|", "+--", "`--"),
            TreeStyle::Unicode => (
                "\u{2502}",
                "\u{251c}\u{2500}\u{2500}",
                "\u{2514}\u{2500}\u{2500}",
            ),
            TreeStyle::Compact => ("", "-", "-"),
        };

        let mut prefix = String::new();
        for _ in 0..(depth - 1) {
            prefix.push_str(branch);
            prefix.push_str(&" ".repeat(self.options.indent_size));
        }
        prefix.push_str(if is_last { last } else { corner });
        prefix.push(' ');
        prefix
    }

    fn build_relation_prefix(&self, depth: usize) -> String {
        let branch = match self.options.style {
            TreeStyle::Ascii => "|",
            TreeStyle::Unicode => "\u{2502}",
            TreeStyle::Compact => "",
        };
        let mut prefix = String::new();
        for _ in 0..depth {
            prefix.push_str(branch);
            prefix.push_str(&" ".repeat(self.options.indent_size));
        }
        prefix
    }
}
