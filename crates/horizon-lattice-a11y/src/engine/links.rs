//! LINKS_TO derivation.
//!
//! The fragment of a link is everything after the first `#` of its `href`,
//! taken literally: `#foo#bar` targets `foo#bar`. A node with that DOM id in
//! the link's scope wins; otherwise the first `<a>` with that `name`.

use super::DeriveContext;
use crate::role::AccessibleRole;
use crate::store::EdgeMap;

/// The fragment of an `href`, if it has a non-empty one.
pub(crate) fn fragment(href: &str) -> Option<&str> {
    let (_, fragment) = href.split_once('#')?;
    (!fragment.is_empty()).then_some(fragment)
}

pub(crate) fn derive(ctx: &DeriveContext<'_>) -> EdgeMap {
    let mut edges = EdgeMap::new();
    for (id, node) in ctx.nodes() {
        if node.role() != AccessibleRole::Link {
            continue;
        }
        let Some(anchor) = node.attribute("href").and_then(fragment) else {
            continue;
        };
        let scope = node.scope();
        let target = ctx.resolve(anchor, scope).or_else(|| {
            ctx.nodes()
                .find(|(_, candidate)| {
                    candidate.scope() == scope
                        && candidate.tag() == Some("a")
                        && candidate.attribute("name") == Some(anchor)
                })
                .map(|(candidate_id, _)| candidate_id)
        });
        if let Some(target) = target {
            edges.insert(id, vec![target]);
        }
    }
    edges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_after_first_hash() {
        assert_eq!(fragment("#foo"), Some("foo"));
        assert_eq!(fragment("#foo#bar"), Some("foo#bar"));
        assert_eq!(fragment("page.html#top"), Some("top"));
        assert_eq!(fragment("#"), None);
        assert_eq!(fragment("page.html"), None);
    }
}
