//! MEMBER_OF derivation.
//!
//! Native radios form a group per `(form owner, name)`, where the form owner
//! is the nearest form-role ancestor or the document. A radio without a name
//! has no group. ARIA radios are grouped by their nearest `radiogroup`
//! ancestor and have no group without one. Every member of a group reports
//! the full member list in tree order, itself included.

use std::collections::HashMap;

use super::DeriveContext;
use crate::registry::NodeId;
use crate::role::AccessibleRole;
use crate::store::EdgeMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    Native { owner: NodeId, name: String },
    Aria { group: NodeId },
}

pub(crate) fn derive(ctx: &DeriveContext<'_>) -> EdgeMap {
    let mut groups: Vec<Vec<NodeId>> = Vec::new();
    let mut slot_of: HashMap<GroupKey, usize> = HashMap::new();

    for (id, node) in ctx.nodes() {
        let key = if node.is_native_radio() {
            let Some(name) = node.attribute("name").filter(|name| !name.is_empty()) else {
                continue;
            };
            let owner = ctx
                .nearest_ancestor(id, |a| a.role() == AccessibleRole::Form)
                .or(ctx.registry.root());
            let Some(owner) = owner else { continue };
            GroupKey::Native {
                owner,
                name: name.to_string(),
            }
        } else if node.role() == AccessibleRole::RadioButton {
            let Some(group) = ctx.nearest_ancestor(id, |a| a.role() == AccessibleRole::RadioGroup)
            else {
                continue;
            };
            GroupKey::Aria { group }
        } else {
            continue;
        };

        let slot = *slot_of.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(id);
    }

    let mut edges = EdgeMap::new();
    for members in groups {
        for &member in &members {
            edges.insert(member, members.clone());
        }
    }
    edges
}
