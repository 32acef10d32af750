//! Segment trie backing the route table.
//!
//! Nodes live in a flat arena and refer to each other by index. A node holds
//! its static children, at most one parameter child, at most one wildcard
//! child, and the routes registered at that depth keyed by [`Slot`].
//!
//! Lookup is a depth-first walk that tries, in order: the static child, the
//! parameter child, the wildcard child. Parameter bindings are collected on
//! the way back up from a successful leaf, so a failed branch leaves nothing
//! behind and the tree itself is never written during a lookup.

use std::collections::HashMap;

use crate::error::RouteError;
use crate::method::Slot;

/// Index of a registered route in the route table.
pub(crate) type RouteId = usize;

type NodeId = usize;

const ROOT: NodeId = 0;

/// Name under which a wildcard capture is exposed in the params map.
pub(crate) const WILDCARD_PARAM: &str = "*";

/// One `/`-delimited token of a route pattern.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Segment {
    Static(String),
    Param(String),
    Wildcard,
}

/// Splits a pattern such as `/users/:id/files/*` into segments.
///
/// Empty segments are ignored, so `/a//b/` and `/a/b` are the same pattern.
pub(crate) fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let mut segments = Vec::with_capacity(raw.len());

    for (i, token) in raw.iter().enumerate() {
        let segment = if *token == "*" {
            if i + 1 != raw.len() {
                return Err(RouteError::WildcardNotLast { pattern: pattern.to_owned() });
            }
            Segment::Wildcard
        } else if let Some(name) = token.strip_prefix(':') {
            if name.is_empty() {
                return Err(RouteError::InvalidPattern {
                    pattern: pattern.to_owned(),
                    reason: "parameter name is empty",
                });
            }
            Segment::Param(name.to_owned())
        } else {
            Segment::Static((*token).to_owned())
        };
        segments.push(segment);
    }

    Ok(segments)
}

/// Successful lookup: the route plus its raw parameter values.
#[derive(Debug, Eq, PartialEq)]
pub(crate) struct Match {
    pub route: RouteId,
    pub params: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Node {
    statics: HashMap<String, NodeId>,
    param: Option<(String, NodeId)>,
    wildcard: Option<NodeId>,
    routes: HashMap<Slot, RouteId>,
}

#[derive(Debug)]
pub(crate) struct Trie {
    nodes: Vec<Node>,
}

impl Trie {
    pub fn new() -> Self {
        Self { nodes: vec![Node::default()] }
    }

    /// Stores `route` under `slot` at the node `segments` leads to, creating
    /// nodes as needed.
    pub fn insert(
        &mut self,
        slot: Slot,
        pattern: &str,
        segments: &[Segment],
        route: RouteId,
    ) -> Result<(), RouteError> {
        let mut node = ROOT;

        for segment in segments {
            node = match segment {
                Segment::Static(literal) => match self.nodes[node].statics.get(literal) {
                    Some(&child) => child,
                    None => {
                        let child = self.alloc();
                        self.nodes[node].statics.insert(literal.clone(), child);
                        child
                    }
                },
                Segment::Param(name) => match &self.nodes[node].param {
                    Some((existing, _)) if existing != name => {
                        return Err(RouteError::ParamConflict {
                            pattern: pattern.to_owned(),
                            existing: existing.clone(),
                            attempted: name.clone(),
                        });
                    }
                    Some((_, child)) => *child,
                    None => {
                        let child = self.alloc();
                        self.nodes[node].param = Some((name.clone(), child));
                        child
                    }
                },
                Segment::Wildcard => match self.nodes[node].wildcard {
                    Some(child) => child,
                    None => {
                        let child = self.alloc();
                        self.nodes[node].wildcard = Some(child);
                        child
                    }
                },
            };
        }

        let routes = &mut self.nodes[node].routes;
        if routes.contains_key(&slot) {
            return Err(RouteError::Duplicate {
                method: slot.to_string(),
                pattern: pattern.to_owned(),
            });
        }
        routes.insert(slot, route);
        Ok(())
    }

    /// Resolves a concrete path for `slot`.
    ///
    /// A node that matches structurally but has nothing registered for `slot`
    /// counts as a dead end, so the walk keeps backtracking into the param and
    /// wildcard branches before giving up.
    pub fn find(&self, slot: Slot, path: &str) -> Option<Match> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (route, mut params) = self.walk(ROOT, slot, &segments)?;
        // Bindings were pushed leaf-first.
        params.reverse();
        Some(Match { route, params })
    }

    fn walk(&self, node: NodeId, slot: Slot, rest: &[&str]) -> Option<(RouteId, Vec<(String, String)>)> {
        let node = &self.nodes[node];

        let Some((head, tail)) = rest.split_first() else {
            return node.routes.get(&slot).map(|&route| (route, Vec::new()));
        };

        if let Some(&child) = node.statics.get(*head) {
            if let Some(found) = self.walk(child, slot, tail) {
                return Some(found);
            }
        }

        if let Some((name, child)) = &node.param {
            if let Some((route, mut params)) = self.walk(*child, slot, tail) {
                params.push((name.clone(), (*head).to_owned()));
                return Some((route, params));
            }
        }

        // Terminal: swallows every remaining segment, nothing beneath it is walked.
        let child = node.wildcard?;
        let route = *self.nodes[child].routes.get(&slot)?;
        Some((route, vec![(WILDCARD_PARAM.to_owned(), rest.join("/"))]))
    }

    fn alloc(&mut self) -> NodeId {
        self.nodes.push(Node::default());
        self.nodes.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;

    const GET: Slot = Slot::Http(Method::Get);
    const POST: Slot = Slot::Http(Method::Post);

    fn trie(routes: &[(Slot, &str)]) -> Trie {
        let mut trie = Trie::new();
        for (id, (slot, pattern)) in routes.iter().enumerate() {
            let segments = parse_pattern(pattern).unwrap();
            trie.insert(*slot, pattern, &segments, id).unwrap();
        }
        trie
    }

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[test]
    fn parses_segments() {
        assert_eq!(
            parse_pattern("/users/:id/*").unwrap(),
            vec![
                Segment::Static("users".into()),
                Segment::Param("id".into()),
                Segment::Wildcard,
            ]
        );
        assert_eq!(parse_pattern("/").unwrap(), vec![]);
    }

    #[test]
    fn rejects_wildcard_before_the_end() {
        assert!(matches!(parse_pattern("/a/*/b"), Err(RouteError::WildcardNotLast { .. })));
        assert!(matches!(parse_pattern("/a/:"), Err(RouteError::InvalidPattern { .. })));
    }

    #[test]
    fn static_beats_param_at_the_same_depth() {
        // Registration order must not matter.
        let t = trie(&[(GET, "/a/:x"), (GET, "/a/b")]);
        assert_eq!(t.find(GET, "/a/b"), Some(Match { route: 1, params: vec![] }));
        assert_eq!(t.find(GET, "/a/c"), Some(Match { route: 0, params: params(&[("x", "c")]) }));
    }

    #[test]
    fn conflicting_param_names_fail_at_registration() {
        let mut t = trie(&[(GET, "/a/:x")]);
        let segments = parse_pattern("/a/:y").unwrap();
        let err = t.insert(POST, "/a/:y", &segments, 1).unwrap_err();
        assert!(matches!(
            err,
            RouteError::ParamConflict { ref existing, ref attempted, .. }
                if existing == "x" && attempted == "y"
        ));
    }

    #[test]
    fn same_param_name_may_be_shared() {
        let t = trie(&[(GET, "/users/:id"), (GET, "/users/:id/posts")]);
        assert_eq!(t.find(GET, "/users/7/posts").unwrap().params, params(&[("id", "7")]));
    }

    #[test]
    fn duplicate_method_and_pattern_is_rejected() {
        let mut t = trie(&[(GET, "/a")]);
        let segments = parse_pattern("/a/").unwrap();
        assert!(matches!(t.insert(GET, "/a/", &segments, 1), Err(RouteError::Duplicate { .. })));
    }

    #[test]
    fn wildcard_captures_the_remainder() {
        let t = trie(&[(GET, "/files/*")]);
        let m = t.find(GET, "/files/a/b/c.txt").unwrap();
        assert_eq!(m.params, params(&[("*", "a/b/c.txt")]));
        assert_eq!(t.find(GET, "/files"), None);
    }

    #[test]
    fn backtracks_from_a_failed_param_branch_into_the_wildcard() {
        let t = trie(&[(GET, "/a/:x/edit"), (GET, "/a/*")]);
        let m = t.find(GET, "/a/1/view").unwrap();
        assert_eq!(m.route, 1);
        // The param binding from the abandoned branch is gone.
        assert_eq!(m.params, params(&[("*", "1/view")]));
    }

    #[test]
    fn structural_match_for_another_method_is_a_miss() {
        let t = trie(&[(POST, "/login")]);
        assert_eq!(t.find(GET, "/login"), None);
    }

    #[test]
    fn missing_method_on_static_branch_falls_back_to_param() {
        let t = trie(&[(POST, "/a/b"), (GET, "/a/:x")]);
        assert_eq!(t.find(GET, "/a/b").unwrap().route, 1);
    }

    #[test]
    fn lookup_is_deterministic() {
        let t = trie(&[(GET, "/a/:x"), (GET, "/a/b"), (GET, "/a/*"), (GET, "/")]);
        for path in ["/", "/a/b", "/a/z", "/a/z/y", "/nope"] {
            assert_eq!(t.find(GET, path), t.find(GET, path));
        }
        assert_eq!(t.find(GET, "/").unwrap().route, 3);
        assert_eq!(t.find(GET, "/nope"), None);
    }

    #[test]
    fn upgrade_slot_is_independent_of_get() {
        let t = trie(&[(Slot::Upgrade, "/chat")]);
        assert!(t.find(Slot::Upgrade, "/chat").is_some());
        assert!(t.find(GET, "/chat").is_none());
    }
}
