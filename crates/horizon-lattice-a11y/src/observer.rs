//! Document model notification adapter.
//!
//! [`DocumentObserver`] receives raw notifications from the document model as
//! they happen and turns each update cycle into one normalized
//! [`ChangeBatch`]. The relation engine only ever sees whole batches.
//!
//! # Normalization
//!
//! - attribute names are lower-cased,
//! - no-op attribute changes (`old == new`) are dropped,
//! - repeated changes to the same attribute, IDL property or popover state
//!   keep only the last value,
//! - a subtree inserted and removed within the cycle disappears together with
//!   every change addressed to it,
//! - changes to nodes removed later in the cycle (and not re-inserted) are
//!   dropped,
//! - unknown IDL properties are logged and dropped.
//!
//! A removal followed by an insertion of the same handle is kept as is: the
//! engine treats it as a move and preserves accessible identity.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::content::{ContentDescriptor, ContentHandle};
use crate::error::Result;
use crate::logging::targets;

/// IDL property naming a popover's invoker target.
pub const POPOVER_TARGET_PROPERTY: &str = "popoverTargetElement";

/// A raw notification from the document model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMutation {
    /// A content attribute changed.
    AttributeChanged {
        /// The element.
        node: ContentHandle,
        /// Attribute name as reported.
        name: String,
        /// Previous value.
        old_value: Option<String>,
        /// New value, `None` when removed.
        new_value: Option<String>,
    },
    /// A subtree was inserted.
    SubtreeInserted {
        /// The new parent.
        parent: ContentHandle,
        /// The inserted subtree.
        subtree: ContentDescriptor,
        /// Child index under the parent.
        index: usize,
    },
    /// A subtree was removed.
    SubtreeRemoved {
        /// The subtree root.
        node: ContentHandle,
    },
    /// An IDL property holding an element reference changed.
    IdlPropertyChanged {
        /// The element.
        node: ContentHandle,
        /// Property name.
        property: String,
        /// The new referenced element.
        target: Option<ContentHandle>,
    },
    /// A popover was shown or hidden.
    PopoverStateChanged {
        /// The popover element.
        node: ContentHandle,
        /// Whether it is now showing.
        showing: bool,
    },
}

/// A normalized change, as consumed by the relation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A subtree was inserted under `parent` at `index`.
    Inserted {
        /// The new parent.
        parent: ContentHandle,
        /// Child index under the parent.
        index: usize,
        /// The inserted subtree.
        subtree: ContentDescriptor,
    },
    /// A subtree was removed.
    Removed {
        /// The subtree root.
        node: ContentHandle,
    },
    /// An attribute was set (`Some`) or removed (`None`).
    AttributeChanged {
        /// The element.
        node: ContentHandle,
        /// Lower-case attribute name.
        name: String,
        /// New value.
        value: Option<String>,
    },
    /// The `popoverTargetElement` IDL property changed.
    PopoverTargetChanged {
        /// The invoker.
        node: ContentHandle,
        /// The new target.
        target: Option<ContentHandle>,
    },
    /// A popover was shown or hidden.
    PopoverToggled {
        /// The popover element.
        node: ContentHandle,
        /// Whether it is now showing.
        showing: bool,
    },
}

impl ChangeEvent {
    /// The content node a non-structural event addresses.
    pub fn target(&self) -> Option<ContentHandle> {
        match self {
            Self::AttributeChanged { node, .. }
            | Self::PopoverTargetChanged { node, .. }
            | Self::PopoverToggled { node, .. } => Some(*node),
            Self::Inserted { .. } | Self::Removed { .. } => None,
        }
    }

    /// Whether this event inserts or removes content.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Inserted { .. } | Self::Removed { .. })
    }
}

/// The normalized changes of one update cycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangeBatch {
    /// Update cycle number, starting at 1.
    pub cycle: u64,
    /// Events in application order.
    pub events: Vec<ChangeEvent>,
}

impl ChangeBatch {
    /// Whether the batch carries no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Receiver of normalized batches.
pub trait MutationSink {
    /// Hand a batch to the engine.
    fn deliver(&self, batch: ChangeBatch) -> Result<()>;
}

/// Collects raw notifications and emits one normalized batch per cycle.
///
/// All methods take `&self`; the observer can be shared with the document
/// model's notification callbacks.
#[derive(Debug, Default)]
pub struct DocumentObserver {
    pending: Mutex<Vec<RawMutation>>,
    cycle: AtomicU64,
}

impl DocumentObserver {
    /// Create an observer with no pending notifications.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a raw notification for the current cycle.
    pub fn record(&self, mutation: RawMutation) {
        tracing::trace!(target: targets::OBSERVER, ?mutation, "recorded mutation");
        self.pending.lock().push(mutation);
    }

    /// An attribute changed from `old` to `new`.
    pub fn on_attribute_changed(
        &self,
        node: ContentHandle,
        name: &str,
        old: Option<&str>,
        new: Option<&str>,
    ) {
        self.record(RawMutation::AttributeChanged {
            node,
            name: name.to_string(),
            old_value: old.map(str::to_string),
            new_value: new.map(str::to_string),
        });
    }

    /// A subtree was inserted under `parent` at `index`.
    pub fn on_subtree_inserted(
        &self,
        parent: ContentHandle,
        subtree: ContentDescriptor,
        index: usize,
    ) {
        self.record(RawMutation::SubtreeInserted {
            parent,
            subtree,
            index,
        });
    }

    /// A subtree was removed.
    pub fn on_subtree_removed(&self, node: ContentHandle) {
        self.record(RawMutation::SubtreeRemoved { node });
    }

    /// An element-reference IDL property changed.
    ///
    /// Only `popoverTargetElement` feeds relations; other properties are
    /// dropped.
    pub fn on_idl_property_changed(
        &self,
        node: ContentHandle,
        property: &str,
        target: Option<ContentHandle>,
    ) {
        if !property.eq_ignore_ascii_case(POPOVER_TARGET_PROPERTY) {
            tracing::warn!(target: targets::OBSERVER, %node, property, "dropping unknown IDL property change");
            return;
        }
        self.record(RawMutation::IdlPropertyChanged {
            node,
            property: property.to_string(),
            target,
        });
    }

    /// A popover was shown or hidden.
    pub fn on_popover_state_changed(&self, node: ContentHandle, showing: bool) {
        self.record(RawMutation::PopoverStateChanged { node, showing });
    }

    /// Number of raw notifications waiting for the end of the cycle.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Close the current cycle and return its normalized batch.
    ///
    /// Returns `None` when the cycle normalized to nothing.
    pub fn end_cycle(&self) -> Option<ChangeBatch> {
        let raw = std::mem::take(&mut *self.pending.lock());
        let raw_len = raw.len();
        let events = normalize(raw);
        if events.is_empty() {
            if raw_len > 0 {
                tracing::debug!(target: targets::OBSERVER, raw_len, "cycle normalized to nothing");
            }
            return None;
        }
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            target: targets::OBSERVER,
            cycle,
            raw_len,
            event_count = events.len(),
            "cycle closed"
        );
        Some(ChangeBatch { cycle, events })
    }

    /// Close the current cycle and deliver its batch, if any.
    ///
    /// Returns whether a batch was delivered.
    pub fn flush(&self, sink: &dyn MutationSink) -> Result<bool> {
        match self.end_cycle() {
            Some(batch) => {
                sink.deliver(batch)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// What a change is merged on. The epoch counts how often the handle was
/// inserted or removed earlier in the cycle; changes never merge across one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CoalesceKey {
    Attribute(ContentHandle, u32, String),
    PopoverTarget(ContentHandle, u32),
    PopoverToggle(ContentHandle, u32),
}

/// Convert one cycle of raw notifications into canonical events.
pub fn normalize(raw: Vec<RawMutation>) -> Vec<ChangeEvent> {
    // Convert, dropping no-op attribute changes. The previous value is kept
    // so a change that is reverted within the cycle can be dropped too.
    let mut events: Vec<Option<(ChangeEvent, Option<Option<String>>)>> = raw
        .into_iter()
        .filter_map(|mutation| match mutation {
            RawMutation::AttributeChanged {
                node,
                name,
                old_value,
                new_value,
            } => {
                if old_value == new_value {
                    return None;
                }
                Some((
                    ChangeEvent::AttributeChanged {
                        node,
                        name: name.to_ascii_lowercase(),
                        value: new_value,
                    },
                    Some(old_value),
                ))
            }
            RawMutation::SubtreeInserted {
                parent,
                subtree,
                index,
            } => Some((
                ChangeEvent::Inserted {
                    parent,
                    index,
                    subtree,
                },
                None,
            )),
            RawMutation::SubtreeRemoved { node } => Some((ChangeEvent::Removed { node }, None)),
            RawMutation::IdlPropertyChanged { node, target, .. } => {
                Some((ChangeEvent::PopoverTargetChanged { node, target }, None))
            }
            RawMutation::PopoverStateChanged { node, showing } => {
                Some((ChangeEvent::PopoverToggled { node, showing }, None))
            }
        })
        .map(Some)
        .collect();

    cancel_transient_subtrees(&mut events);
    drop_changes_to_removed(&mut events);
    coalesce(&mut events);

    events.into_iter().flatten().map(|(event, _)| event).collect()
}

type Slot = Option<(ChangeEvent, Option<Option<String>>)>;

/// Drop subtrees inserted and removed within the cycle.
fn cancel_transient_subtrees(events: &mut [Slot]) {
    // Handle of an inserted subtree root -> event index of that insertion.
    let mut open_inserts: HashMap<ContentHandle, usize> = HashMap::new();
    let mut cancelled: Vec<(usize, usize, Vec<ContentHandle>)> = Vec::new();

    for i in 0..events.len() {
        match events[i].as_ref().map(|(event, _)| event) {
            Some(ChangeEvent::Inserted { subtree, .. }) => {
                open_inserts.insert(subtree.handle, i);
            }
            Some(ChangeEvent::Removed { node }) => {
                if let Some(j) = open_inserts.remove(node) {
                    let handles = match events[j].as_ref() {
                        Some((ChangeEvent::Inserted { subtree, .. }, _)) => subtree.handles(),
                        _ => Vec::new(),
                    };
                    cancelled.push((j, i, handles));
                }
            }
            _ => {}
        }
    }

    for (start, end, handles) in cancelled {
        let Some((ChangeEvent::Inserted { parent, .. }, _)) = events[start].as_ref() else {
            continue;
        };
        let parent = *parent;
        // Later insertion indices under the same parent count the transient
        // node, so the pair has to stay.
        let shifts_siblings = events[start + 1..end].iter().flatten().any(
            |(event, _)| matches!(event, ChangeEvent::Inserted { parent: p, .. } if *p == parent),
        );
        if shifts_siblings {
            continue;
        }

        let mut handles: HashSet<ContentHandle> = handles.into_iter().collect();
        for slot in &mut events[start + 1..end] {
            match slot.as_ref().map(|(event, _)| event) {
                Some(ChangeEvent::Inserted { parent, subtree, .. }) => {
                    if handles.contains(parent) {
                        handles.extend(subtree.handles());
                        *slot = None;
                    } else {
                        // Moved out of the transient subtree; later changes stand.
                        for handle in subtree.handles() {
                            handles.remove(&handle);
                        }
                    }
                }
                Some(event) if event.target().is_some_and(|h| handles.contains(&h)) => {
                    *slot = None;
                }
                _ => {}
            }
        }
        events[start] = None;
        events[end] = None;
    }
}

/// Drop changes addressed to nodes that end the cycle removed.
fn drop_changes_to_removed(events: &mut [Slot]) {
    let mut last_removed: HashMap<ContentHandle, usize> = HashMap::new();
    let mut last_inserted: HashMap<ContentHandle, usize> = HashMap::new();
    for (i, slot) in events.iter().enumerate() {
        match slot.as_ref().map(|(event, _)| event) {
            Some(ChangeEvent::Removed { node }) => {
                last_removed.insert(*node, i);
            }
            Some(ChangeEvent::Inserted { subtree, .. }) => {
                for handle in subtree.handles() {
                    last_inserted.insert(handle, i);
                }
            }
            _ => {}
        }
    }

    for (i, slot) in events.iter_mut().enumerate() {
        let Some(handle) = slot.as_ref().and_then(|(event, _)| event.target()) else {
            continue;
        };
        let Some(&removed_at) = last_removed.get(&handle) else {
            continue;
        };
        let reinserted = last_inserted
            .get(&handle)
            .is_some_and(|&inserted_at| inserted_at > removed_at);
        if removed_at > i && !reinserted {
            *slot = None;
        }
    }
}

/// Keep only the last change per attribute, IDL property and popover state.
fn coalesce(events: &mut [Slot]) {
    let mut epochs: HashMap<ContentHandle, u32> = HashMap::new();
    let mut event_epochs = vec![0; events.len()];
    for (i, slot) in events.iter().enumerate() {
        match slot.as_ref().map(|(event, _)| event) {
            Some(ChangeEvent::Inserted { subtree, .. }) => {
                for handle in subtree.handles() {
                    *epochs.entry(handle).or_default() += 1;
                }
            }
            Some(ChangeEvent::Removed { node }) => {
                *epochs.entry(*node).or_default() += 1;
            }
            Some(event) => {
                if let Some(handle) = event.target() {
                    event_epochs[i] = epochs.get(&handle).copied().unwrap_or_default();
                }
            }
            None => {}
        }
    }

    // Key -> (index of the last occurrence, previous value before the first).
    let mut last: HashMap<CoalesceKey, (usize, Option<Option<String>>)> = HashMap::new();

    for i in (0..events.len()).rev() {
        let Some((event, old)) = events[i].as_ref() else {
            continue;
        };
        let epoch = event_epochs[i];
        let key = match event {
            ChangeEvent::AttributeChanged { node, name, .. } => {
                CoalesceKey::Attribute(*node, epoch, name.clone())
            }
            ChangeEvent::PopoverTargetChanged { node, .. } => {
                CoalesceKey::PopoverTarget(*node, epoch)
            }
            ChangeEvent::PopoverToggled { node, .. } => CoalesceKey::PopoverToggle(*node, epoch),
            _ => continue,
        };
        let old = old.clone();
        match last.get_mut(&key) {
            Some(entry) => {
                entry.1 = old;
                events[i] = None;
            }
            None => {
                last.insert(key, (i, old));
            }
        }
    }

    for (index, earliest_old) in last.into_values() {
        let reverted = match (&events[index], earliest_old) {
            (Some((ChangeEvent::AttributeChanged { value, .. }, _)), Some(old)) => *value == old,
            _ => false,
        };
        if reverted {
            events[index] = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentTree;

    fn h(n: u64) -> ContentHandle {
        ContentHandle(n)
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<ChangeBatch>>);

    impl MutationSink for Collect {
        fn deliver(&self, batch: ChangeBatch) -> Result<()> {
            self.0.lock().push(batch);
            Ok(())
        }
    }

    #[test]
    fn test_attribute_normalization() {
        let observer = DocumentObserver::new();
        observer.on_attribute_changed(h(1), "NAME", None, Some("a"));
        observer.on_attribute_changed(h(1), "name", Some("a"), Some("b"));
        observer.on_attribute_changed(h(2), "id", Some("x"), Some("x"));
        let batch = observer.end_cycle().unwrap();
        assert_eq!(batch.cycle, 1);
        assert_eq!(
            batch.events,
            vec![ChangeEvent::AttributeChanged {
                node: h(1),
                name: "name".into(),
                value: Some("b".into()),
            }]
        );
    }

    #[test]
    fn test_reverted_change_dropped() {
        let observer = DocumentObserver::new();
        observer.on_attribute_changed(h(1), "for", Some("a"), Some("b"));
        observer.on_attribute_changed(h(1), "for", Some("b"), Some("a"));
        assert!(observer.end_cycle().is_none());
    }

    #[test]
    fn test_insert_then_remove_cancels() {
        let observer = DocumentObserver::new();
        let subtree =
            ContentDescriptor::element(h(5), "div").with_child(ContentDescriptor::text(h(6)));
        observer.on_subtree_inserted(h(1), subtree, 0);
        observer.on_attribute_changed(h(6), "id", None, Some("t"));
        observer.on_attribute_changed(h(2), "id", None, Some("kept"));
        observer.on_subtree_removed(h(5));
        let batch = observer.end_cycle().unwrap();
        assert_eq!(batch.events.len(), 1);
        assert!(matches!(
            &batch.events[0],
            ChangeEvent::AttributeChanged { node, .. } if *node == h(2)
        ));
    }

    #[test]
    fn test_transient_sibling_kept_for_insertion_indices() {
        let observer = DocumentObserver::new();
        observer.on_subtree_inserted(h(1), ContentDescriptor::element(h(5), "div"), 0);
        observer.on_subtree_inserted(h(1), ContentDescriptor::element(h(6), "div"), 1);
        observer.on_subtree_removed(h(5));
        let batch = observer.end_cycle().unwrap();
        assert_eq!(batch.events.len(), 3);

        let mut tree = ContentTree::new(
            ContentDescriptor::document(h(1)).with_child(ContentDescriptor::element(h(2), "p")),
        );
        for event in batch.events {
            match event {
                ChangeEvent::Inserted { parent, index, subtree } => {
                    tree.insert(parent, index, subtree).unwrap();
                }
                ChangeEvent::Removed { node } => {
                    tree.remove(node).unwrap();
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(tree.get(h(1)).unwrap().children(), &[h(6), h(2)]);
    }

    #[test]
    fn test_move_is_preserved() {
        let observer = DocumentObserver::new();
        observer.on_subtree_removed(h(5));
        observer.on_subtree_inserted(h(2), ContentDescriptor::element(h(5), "input"), 0);
        observer.on_attribute_changed(h(5), "name", None, Some("g"));
        let batch = observer.end_cycle().unwrap();
        assert_eq!(batch.events.len(), 3);
        assert!(matches!(batch.events[0], ChangeEvent::Removed { .. }));
        assert!(matches!(batch.events[1], ChangeEvent::Inserted { .. }));
    }

    #[test]
    fn test_changes_not_merged_across_reinsertion() {
        let observer = DocumentObserver::new();
        observer.on_attribute_changed(h(4), "name", Some("a"), Some("n"));
        observer.on_subtree_removed(h(4));
        observer.on_subtree_inserted(
            h(2),
            ContentDescriptor::element(h(4), "input").with_attr("name", "n"),
            0,
        );
        observer.on_attribute_changed(h(4), "name", Some("n"), Some("a"));
        let batch = observer.end_cycle().unwrap();
        assert_eq!(
            batch.events.last(),
            Some(&ChangeEvent::AttributeChanged {
                node: h(4),
                name: "name".into(),
                value: Some("a".into()),
            })
        );

        // A subtree removal re-inserting the node resets it too.
        observer.on_popover_state_changed(h(6), true);
        observer.on_subtree_removed(h(5));
        observer.on_subtree_inserted(
            h(1),
            ContentDescriptor::element(h(5), "div").with_child(ContentDescriptor::element(h(6), "div")),
            0,
        );
        observer.on_popover_state_changed(h(6), false);
        let batch = observer.end_cycle().unwrap();
        assert_eq!(
            batch.events.last(),
            Some(&ChangeEvent::PopoverToggled {
                node: h(6),
                showing: false,
            })
        );
    }

    #[test]
    fn test_node_moved_out_of_transient_subtree_keeps_changes() {
        let observer = DocumentObserver::new();
        let subtree =
            ContentDescriptor::element(h(5), "div").with_child(ContentDescriptor::element(h(6), "input"));
        observer.on_subtree_inserted(h(1), subtree, 0);
        observer.on_subtree_removed(h(6));
        observer.on_subtree_inserted(h(2), ContentDescriptor::element(h(6), "input"), 0);
        observer.on_attribute_changed(h(6), "id", None, Some("moved"));
        observer.on_subtree_removed(h(5));
        let batch = observer.end_cycle().unwrap();
        assert!(batch
            .events
            .iter()
            .any(|e| matches!(e, ChangeEvent::Inserted { subtree, .. } if subtree.handle == h(6))));
        assert!(batch.events.contains(&ChangeEvent::AttributeChanged {
            node: h(6),
            name: "id".into(),
            value: Some("moved".into()),
        }));
    }

    #[test]
    fn test_changes_to_removed_nodes_dropped() {
        let observer = DocumentObserver::new();
        observer.on_attribute_changed(h(5), "name", None, Some("g"));
        observer.on_popover_state_changed(h(5), true);
        observer.on_subtree_removed(h(5));
        let batch = observer.end_cycle().unwrap();
        assert_eq!(batch.events, vec![ChangeEvent::Removed { node: h(5) }]);
    }

    #[test]
    fn test_idl_property_filtering() {
        let observer = DocumentObserver::new();
        observer.on_idl_property_changed(h(1), "ariaLabelledByElements", Some(h(2)));
        assert_eq!(observer.pending_len(), 0);
        observer.on_idl_property_changed(h(1), "POPOVERTARGETELEMENT", Some(h(2)));
        observer.on_idl_property_changed(h(1), "popoverTargetElement", Some(h(3)));
        let batch = observer.end_cycle().unwrap();
        assert_eq!(
            batch.events,
            vec![ChangeEvent::PopoverTargetChanged {
                node: h(1),
                target: Some(h(3)),
            }]
        );
    }

    #[test]
    fn test_flush_delivers_and_numbers_cycles() {
        let observer = DocumentObserver::new();
        let sink = Collect::default();
        assert!(!observer.flush(&sink).unwrap());
        observer.on_popover_state_changed(h(1), true);
        assert!(observer.flush(&sink).unwrap());
        observer.on_popover_state_changed(h(1), false);
        assert!(observer.flush(&sink).unwrap());
        let batches = sink.0.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].cycle, 1);
        assert_eq!(batches[1].cycle, 2);
    }
}
