// Textual XPath filter matching.
//
// The schema context is an out-of-scope collaborator: a real deployment
// would parse and validate XPath against loaded YANG modules and do semantic
// subset analysis. Absent that, this module implements a conservative
// prefix/predicate match: path segments are compared by name, and a
// predicate is only treated as a mismatch when *both* sides specify one and
// they differ textually. A predicate present on only one side is a
// wildcard — we'd rather dispatch an event to a subscriber that turns out
// not to care than silently drop it. This is conservative in the sense of
// never missing a true match, at the cost of occasional spurious matches;
// callbacks must tolerate spurious invocations.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    pub name: String,
    pub predicate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledXPath {
    pub raw: String,
    pub segments: Vec<PathSegment>,
}

fn parse_segments(path: &str) -> Vec<PathSegment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|segment| match segment.find('[') {
            Some(idx) => {
                let name = segment[..idx].to_string();
                let predicate = segment[idx..].trim_matches(|c| c == '[' || c == ']').to_string();
                PathSegment {
                    name,
                    predicate: Some(predicate),
                }
            }
            None => PathSegment {
                name: segment.to_string(),
                predicate: None,
            },
        })
        .collect()
}

impl CompiledXPath {
    /// Compiles a raw XPath string. A real implementation would consult the
    /// schema context here to reject paths that do not resolve against any
    /// loaded module; this textual stand-in accepts any syntactically
    /// splittable path.
    pub fn compile(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            segments: parse_segments(raw),
        }
    }

    fn segment_compatible(a: &PathSegment, b: &PathSegment) -> bool {
        if a.name != b.name {
            return false;
        }
        match (&a.predicate, &b.predicate) {
            (Some(pa), Some(pb)) => pa == pb,
            _ => true,
        }
    }

    /// True if `self` names the same node as, or an ancestor of, `other`.
    fn is_prefix_of(&self, other: &CompiledXPath) -> bool {
        if self.segments.len() > other.segments.len() {
            return false;
        }
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| Self::segment_compatible(a, b))
    }

    /// True if a changed node at `changed_path` falls under this filter: a
    /// subscription receives the change iff at least one changed node
    /// matches.
    pub fn matches_changed_path(&self, changed_path: &str) -> bool {
        let changed = CompiledXPath::compile(changed_path);
        self.is_prefix_of(&changed)
    }

    /// True if `self` is a strict ancestor of `other`. Ancestor providers
    /// must run strictly before descendant providers.
    pub fn is_strict_ancestor_of(&self, other: &CompiledXPath) -> bool {
        self.segments.len() < other.segments.len() && self.is_prefix_of(other)
    }

    /// Conservative, textual "could this request filter select data under
    /// this provider's path" test. Two paths are considered to potentially
    /// overlap unless they diverge by name at some shared depth; this never
    /// produces a false "cannot overlap" for two paths that truly do, but may
    /// keep some providers that turn out to be irrelevant once invoked.
    pub fn could_select_under(&self, provider_path: &CompiledXPath) -> bool {
        self.segments
            .iter()
            .zip(provider_path.segments.iter())
            .all(|(a, b)| Self::segment_compatible(a, b))
    }

    /// Builds the concrete xpath for one instance of a list node, given the
    /// exact predicate string identifying that instance (e.g.
    /// `"list[key='a']"` replacing the provider's unkeyed `"list"` segment).
    /// Used to address a specific parent instance when invoking a
    /// descendant operational provider.
    pub fn with_instance_segment(&self, instance_segment: &str) -> String {
        let mut segments: Vec<String> = self
            .segments
            .iter()
            .map(|s| match &s.predicate {
                Some(p) => format!("{}[{}]", s.name, p),
                None => s.name.clone(),
            })
            .collect();
        if let Some(last) = segments.last_mut() {
            *last = instance_segment.to_string();
        }
        format!("/{}", segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_basic() {
        let filter = CompiledXPath::compile("/m:x");
        assert!(filter.matches_changed_path("/m:x/v"));
        assert!(filter.matches_changed_path("/m:x"));
        assert!(!filter.matches_changed_path("/m:y/v"));
    }

    #[test]
    fn predicate_wildcard_when_one_sided() {
        let filter = CompiledXPath::compile("/m:c/list");
        assert!(filter.matches_changed_path("/m:c/list[key='a']/state"));
    }

    #[test]
    fn predicate_mismatch_when_both_specified() {
        let filter = CompiledXPath::compile("/m:c/list[key='a']");
        assert!(filter.matches_changed_path("/m:c/list[key='a']/state"));
        assert!(!filter.matches_changed_path("/m:c/list[key='b']/state"));
    }

    #[test]
    fn ancestor_ordering() {
        let parent = CompiledXPath::compile("/m:c/list");
        let child = CompiledXPath::compile("/m:c/list/state");
        assert!(parent.is_strict_ancestor_of(&child));
        assert!(!child.is_strict_ancestor_of(&parent));
    }

    #[test]
    fn instance_segment_substitution() {
        let provider = CompiledXPath::compile("/m:c/list/state");
        let addressed = provider.with_instance_segment("state");
        assert_eq!(addressed, "/m:c/list/state");

        let list_provider = CompiledXPath::compile("/m:c/list");
        let addressed = list_provider.with_instance_segment("list[key='a']");
        assert_eq!(addressed, "/m:c/list[key='a']");
    }
}
