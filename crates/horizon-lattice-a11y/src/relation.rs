//! Relation kinds exposed by the cache.

use std::fmt;
use std::str::FromStr;

/// A typed, directed relation between accessible nodes.
///
/// Forward kinds are derived from content; reverse kinds are always built
/// from their forward partner so the pair stays symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationKind {
    /// Nodes labelling this node.
    LabelledBy,
    /// Nodes this node labels.
    LabelFor,
    /// Peers in the same radio group, including this node.
    MemberOf,
    /// Nodes providing extended details for this node.
    Details,
    /// Nodes this node provides details for.
    DetailsFor,
    /// The in-document destination of a link.
    LinksTo,
}

impl RelationKind {
    /// Number of relation kinds.
    pub const COUNT: usize = 6;

    /// Every relation kind, in table order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::LabelledBy,
        Self::LabelFor,
        Self::MemberOf,
        Self::Details,
        Self::DetailsFor,
        Self::LinksTo,
    ];

    /// Index of this kind in per-kind tables.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The kind holding the reverse edges of this one, if it has a distinct reverse.
    pub fn reverse(self) -> Option<Self> {
        match self {
            Self::LabelledBy => Some(Self::LabelFor),
            Self::LabelFor => Some(Self::LabelledBy),
            Self::Details => Some(Self::DetailsFor),
            Self::DetailsFor => Some(Self::Details),
            Self::MemberOf | Self::LinksTo => None,
        }
    }

    /// Whether an empty target list is reported as `None` rather than `Some(vec![])`.
    ///
    /// Details relations distinguish "no details right now" (an empty list)
    /// from the other kinds, which have no such state.
    pub fn is_nullable(self) -> bool {
        !matches!(self, Self::Details | Self::DetailsFor)
    }

    /// The external name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LabelledBy => "labelled_by",
            Self::LabelFor => "label_for",
            Self::MemberOf => "member_of",
            Self::Details => "details",
            Self::DetailsFor => "details_for",
            Self::LinksTo => "links_to",
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown relation name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown relation kind '{0}'")]
pub struct UnknownRelationKind(pub String);

impl FromStr for RelationKind {
    type Err = UnknownRelationKind;

    /// Accepts the snake-case names and the `RELATION_*` constant spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s
            .trim()
            .trim_start_matches("RELATION_")
            .trim_start_matches("relation_")
            .to_ascii_lowercase()
            .replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownRelationKind(s.to_string()))
    }
}

/// A compact set of relation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindSet(u8);

impl KindSet {
    /// The empty set.
    pub const EMPTY: Self = Self(0);

    /// Every kind.
    pub const ALL: Self = Self((1 << RelationKind::COUNT) - 1);

    /// Add a single kind.
    pub fn insert(&mut self, kind: RelationKind) {
        self.0 |= 1 << kind.index();
    }

    /// Add a kind, together with its reverse partner.
    pub fn insert_with_reverse(&mut self, kind: RelationKind) {
        self.0 |= 1 << kind.index();
        if let Some(reverse) = kind.reverse() {
            self.0 |= 1 << reverse.index();
        }
    }

    /// Union with another set.
    pub fn extend(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Check membership.
    pub fn contains(self, kind: RelationKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    /// Whether no kind is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate members in table order.
    pub fn iter(self) -> impl Iterator<Item = RelationKind> {
        RelationKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<RelationKind> for KindSet {
    fn from_iter<I: IntoIterator<Item = RelationKind>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for kind in iter {
            set.insert_with_reverse(kind);
        }
        set
    }
}
