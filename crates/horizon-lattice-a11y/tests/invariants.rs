//! Randomized mutation sequences; every committed snapshot must be consistent
//! and the mirror must match the document it was told about.

mod common;

use common::{Doc, Fixture};
use horizon_lattice_a11y::{
    ContentDescriptor, ContentHandle, ContentKind, ContentTree, RelationKind,
    POPOVER_TARGET_PROPERTY,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const IDS: &[&str] = &["a", "b", "c", "d", "e"];
const NAMES: &[&str] = &["g1", "g2"];
const TAGS: &[&str] = &[
    "div", "span", "input", "label", "button", "a", "figure", "figcaption", "fieldset",
];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

/// Rebuild a descriptor for a mirrored subtree, keeping its handles.
fn describe(content: &ContentTree, handle: ContentHandle) -> ContentDescriptor {
    let node = content.get(handle).expect("mirrored handle");
    ContentDescriptor {
        handle,
        kind: node.kind().clone(),
        attributes: node.attributes().clone(),
        popover_showing: node.popover_showing(),
        popover_target: node.popover_target(),
        children: node
            .children()
            .iter()
            .map(|&child| describe(content, child))
            .collect(),
    }
}

fn handles(content: &ContentTree) -> Vec<ContentHandle> {
    let mut out = Vec::new();
    let mut stack = vec![content.root()];
    while let Some(handle) = stack.pop() {
        out.push(handle);
        if let Some(node) = content.get(handle) {
            stack.extend(node.children().iter().copied());
        }
    }
    out.sort();
    out
}

fn elements(content: &ContentTree) -> Vec<ContentHandle> {
    handles(content)
        .into_iter()
        .filter(|&h| matches!(content.get(h).map(|n| n.kind()), Some(ContentKind::Element { .. })))
        .collect()
}

fn is_ancestor_or_self(content: &ContentTree, ancestor: ContentHandle, node: ContentHandle) -> bool {
    let mut current = Some(node);
    while let Some(handle) = current {
        if handle == ancestor {
            return true;
        }
        current = content.get(handle).and_then(|n| n.parent());
    }
    false
}

fn random_element(doc: &mut Doc, rng: &mut StdRng, depth: usize) -> ContentDescriptor {
    let tag = *TAGS.choose(rng).expect("tags");
    let mut attrs: Vec<(&str, &str)> = Vec::new();
    if rng.gen_bool(0.6) {
        attrs.push(("id", *IDS.choose(rng).expect("ids")));
    }
    match tag {
        "input" => {
            if rng.gen_bool(0.7) {
                attrs.push(("type", "radio"));
                attrs.push(("name", *NAMES.choose(rng).expect("names")));
            }
        }
        "label" if rng.gen_bool(0.5) => attrs.push(("for", *IDS.choose(rng).expect("ids"))),
        "fieldset" if rng.gen_bool(0.5) => attrs.push(("role", "radiogroup")),
        "div" if rng.gen_bool(0.3) => attrs.push(("popover", "")),
        "div" if rng.gen_bool(0.3) => attrs.push(("role", "radio")),
        "button" => attrs.push(("popovertarget", *IDS.choose(rng).expect("ids"))),
        "a" => attrs.push(("href", *["#a", "#b", "#g1", "x#c"].choose(rng).expect("hrefs"))),
        _ => {}
    }
    let mut element = doc.el(tag, &attrs);
    if depth > 0 {
        for _ in 0..rng.gen_range(0..3) {
            let child = random_element(doc, rng, depth - 1);
            element = element.with_child(child);
        }
    }
    element
}

/// The engine under test plus an independent copy of the document that
/// every mutation is applied to immediately.
struct Model {
    f: Fixture,
    truth: ContentTree,
}

impl Model {
    fn set_attr(&mut self, handle: ContentHandle, name: &str, value: Option<&str>) {
        let old = self
            .truth
            .get(handle)
            .and_then(|node| node.attribute(name))
            .map(str::to_string);
        self.f
            .observer
            .on_attribute_changed(handle, name, old.as_deref(), value);
        self.truth
            .set_attribute(handle, name, value.map(str::to_string))
            .expect("live handle");
    }

    fn toggle_popover(&mut self, handle: ContentHandle, showing: bool) {
        self.f.observer.on_popover_state_changed(handle, showing);
        self.truth
            .set_popover_showing(handle, showing)
            .expect("live handle");
    }

    fn set_popover_target(&mut self, handle: ContentHandle, target: Option<ContentHandle>) {
        self.f
            .observer
            .on_idl_property_changed(handle, POPOVER_TARGET_PROPERTY, target);
        self.truth
            .set_popover_target(handle, target)
            .expect("live handle");
    }

    fn insert(&mut self, parent: ContentHandle, index: usize, subtree: ContentDescriptor) {
        self.f.insert(parent, index, subtree.clone());
        self.truth
            .insert(parent, index, subtree)
            .expect("live parent");
    }

    fn remove(&mut self, handle: ContentHandle) {
        self.f.remove(handle);
        self.truth.remove(handle).expect("live handle");
    }
}

/// Record one random mutation in the current cycle.
fn mutate(m: &mut Model, rng: &mut StdRng) {
    let all = handles(&m.truth);
    let elements = elements(&m.truth);
    let Some(&target) = elements.choose(rng) else {
        let child = random_element(&mut m.f.doc, rng, 1);
        m.insert(Doc::ROOT, 0, child);
        return;
    };

    match rng.gen_range(0..10) {
        0 => {
            let value = rng.gen_bool(0.8).then(|| *IDS.choose(rng).expect("ids"));
            m.set_attr(target, "id", value);
        }
        1 => {
            let count = rng.gen_range(0..4);
            let list: Vec<&str> = (0..count).map(|_| *IDS.choose(rng).expect("ids")).collect();
            let value = list.join(" ");
            m.set_attr(target, "aria-labelledby", (count > 0).then_some(value.as_str()));
        }
        2 => {
            let value = rng.gen_bool(0.8).then(|| *NAMES.choose(rng).expect("names"));
            m.set_attr(target, "name", value);
        }
        3 => {
            let attr = *["for", "aria-details", "popovertarget"]
                .choose(rng)
                .expect("attributes");
            let value = rng.gen_bool(0.8).then(|| *IDS.choose(rng).expect("ids"));
            m.set_attr(target, attr, value);
        }
        4 => {
            let value = rng.gen_bool(0.3).then_some("");
            m.set_attr(target, "hidden", value);
        }
        5 => {
            let showing = !m.truth.get(target).is_some_and(|n| n.popover_showing());
            m.toggle_popover(target, showing);
        }
        6 => {
            let popover = elements.choose(rng).copied();
            m.set_popover_target(target, popover);
        }
        7 => {
            let parents: Vec<ContentHandle> = all
                .iter()
                .copied()
                .filter(|&h| !matches!(m.truth.get(h).map(|n| n.kind()), Some(ContentKind::Text)))
                .collect();
            let parent = *parents.choose(rng).expect("the root is always a candidate");
            let child = random_element(&mut m.f.doc, rng, 2);
            let index = rng.gen_range(0..4);
            m.insert(parent, index, child);
        }
        8 => m.remove(target),
        _ => {
            let parents: Vec<ContentHandle> = all
                .iter()
                .copied()
                .filter(|&h| !is_ancestor_or_self(&m.truth, target, h))
                .filter(|&h| !matches!(m.truth.get(h).map(|n| n.kind()), Some(ContentKind::Text)))
                .collect();
            let Some(&parent) = parents.choose(rng) else {
                return;
            };
            let subtree = describe(&m.truth, target);
            let index = rng.gen_range(0..4);
            m.remove(target);
            m.insert(parent, index, subtree);
        }
    }
}

fn run(seed: u64, steps: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut doc = Doc::new();
    let children: Vec<ContentDescriptor> =
        (0..4).map(|_| random_element(&mut doc, &mut rng, 2)).collect();
    let truth = ContentTree::new(ContentDescriptor::document(Doc::ROOT).with_children(children.clone()));
    let mut m = Model {
        f: Fixture::new(doc, children),
        truth,
    };

    for step in 0..steps {
        // Batches of one to three mutations share a cycle.
        for _ in 0..rng.gen_range(1..=3) {
            mutate(&mut m, &mut rng);
        }
        m.f.commit();

        let root = m.truth.root();
        assert_eq!(
            describe(m.f.engine.content(), root),
            describe(&m.truth, root),
            "mirror diverged at step {step} of seed {seed}"
        );

        let snapshot = m.f.snapshot();
        for node in snapshot.nodes_in_tree_order() {
            for kind in RelationKind::ALL {
                if let Some(targets) = snapshot.query(kind, node).expect("live node") {
                    assert!(targets.iter().all(|&t| snapshot.contains(t)));
                }
            }
        }
    }
}

#[test]
fn test_random_mutations_keep_invariants() {
    init_tracing();
    for seed in 0..16 {
        run(seed, 60);
    }
}

#[test]
fn test_long_random_sequence() {
    init_tracing();
    run(0x5eed, 400);
}
