//! Per-method radix-tree router.
//!
//! No direct structural template exists in the retrieval pack for this: the
//! teacher has no router at all, and `salvo_core`'s router is a filter
//! combinator rather than a trie. Built fresh in the crate's low-allocation
//! style — children are stored in `Vec`s sized at insertion, and route
//! strings are `'static` (supplied once at startup by the application, never
//! borrowed from a request).

use std::sync::Arc;

use crate::{http::types::Method, Handled, Request, Response};

/// A segment's kind, determined by its leading sigil at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Static,
    Param,
    Wildcard,
}

fn classify(segment: &str) -> (SegmentKind, &str) {
    if let Some(name) = segment.strip_prefix(':') {
        (SegmentKind::Param, name)
    } else if let Some(name) = segment.strip_prefix('*') {
        (SegmentKind::Wildcard, name)
    } else {
        (SegmentKind::Static, segment)
    }
}

/// Route parameters captured during a successful match.
#[derive(Debug, Clone, Default)]
pub struct Params {
    entries: Vec<(&'static str, String)>,
}

impl Params {
    fn bind(&mut self, name: &'static str, value: &str) {
        self.entries.push((name, value.to_string()));
    }

    fn unbind_from(&mut self, len: usize) {
        self.entries.truncate(len);
    }

    /// Looks up a captured parameter by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }
}

type BoxedHandler<S> = Arc<dyn for<'a> Fn(&'a mut S, &'a Request, &'a mut Response, &'a Params) -> Handled + Sync + Send>;

struct Node<S> {
    segment: String,
    kind: SegmentKind,
    param_name: &'static str,
    handler: Option<BoxedHandler<S>>,
    static_children: Vec<Node<S>>,
    param_child: Option<Box<Node<S>>>,
    wildcard_child: Option<Box<Node<S>>>,
}

impl<S> Node<S> {
    fn new(segment: &str, kind: SegmentKind, param_name: &'static str) -> Self {
        Self {
            segment: segment.to_string(),
            kind,
            param_name,
            handler: None,
            static_children: Vec::new(),
            param_child: None,
            wildcard_child: None,
        }
    }
}

/// A single per-method radix tree. A [`Router`] owns one tree per HTTP
/// method it has routes for.
pub struct MethodTree<S> {
    root: Node<S>,
}

impl<S> Default for MethodTree<S> {
    fn default() -> Self {
        Self {
            root: Node::new("", SegmentKind::Static, ""),
        }
    }
}

impl<S> MethodTree<S> {
    fn insert(&mut self, path: &'static str, handler: BoxedHandler<S>) {
        let mut node = &mut self.root;
        for raw_segment in path.split('/').filter(|s| !s.is_empty()) {
            let (kind, name) = classify(raw_segment);
            node = match kind {
                SegmentKind::Static => {
                    let idx = node
                        .static_children
                        .iter()
                        .position(|c| c.segment == name);
                    match idx {
                        Some(i) => &mut node.static_children[i],
                        None => {
                            node.static_children.insert(0, Node::new(name, kind, ""));
                            &mut node.static_children[0]
                        }
                    }
                }
                SegmentKind::Param => node
                    .param_child
                    .get_or_insert_with(|| Box::new(Node::new(name, kind, name))),
                SegmentKind::Wildcard => node
                    .wildcard_child
                    .get_or_insert_with(|| Box::new(Node::new(name, kind, name))),
            };
        }
        node.handler = Some(handler);
    }

    /// Matches `segments` (already split on `/`, empty ones skipped) against
    /// the tree, recording captured parameters in `params`. `full_path` is
    /// needed to compute the wildcard remainder without the query string.
    fn find<'a>(
        node: &'a Node<S>,
        segments: &[&str],
        params: &mut Params,
    ) -> Option<&'a BoxedHandler<S>> {
        let Some((head, tail)) = segments.split_first() else {
            return node.handler.as_ref();
        };

        for child in &node.static_children {
            if child.segment == *head {
                if let Some(h) = Self::find(child, tail, params) {
                    return Some(h);
                }
            }
        }

        if let Some(ref child) = node.param_child {
            let mark = params.entries.len();
            params.bind(child.param_name, head);
            if let Some(h) = Self::find(child, tail, params) {
                return Some(h);
            }
            params.unbind_from(mark);
        }

        if let Some(ref child) = node.wildcard_child {
            if child.handler.is_some() {
                let remainder = segments.join("/");
                params.bind(child.param_name, &remainder);
                return child.handler.as_ref();
            }
        }

        None
    }
}

/// A request router: one [`MethodTree`] per HTTP method.
pub struct Router<S = ()> {
    get: MethodTree<S>,
    post: MethodTree<S>,
    put: MethodTree<S>,
    patch: MethodTree<S>,
    delete: MethodTree<S>,
    head: MethodTree<S>,
    options: MethodTree<S>,
}

impl<S> Default for Router<S> {
    fn default() -> Self {
        Self {
            get: MethodTree::default(),
            post: MethodTree::default(),
            put: MethodTree::default(),
            patch: MethodTree::default(),
            delete: MethodTree::default(),
            head: MethodTree::default(),
            options: MethodTree::default(),
        }
    }
}

impl<S> Router<S> {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree_mut(&mut self, method: Method) -> &mut MethodTree<S> {
        match method {
            Method::Get => &mut self.get,
            Method::Post => &mut self.post,
            Method::Put => &mut self.put,
            Method::Patch => &mut self.patch,
            Method::Delete => &mut self.delete,
            Method::Head => &mut self.head,
            Method::Options => &mut self.options,
        }
    }

    fn tree(&self, method: Method) -> &MethodTree<S> {
        match method {
            Method::Get => &self.get,
            Method::Post => &self.post,
            Method::Put => &self.put,
            Method::Patch => &self.patch,
            Method::Delete => &self.delete,
            Method::Head => &self.head,
            Method::Options => &self.options,
        }
    }

    /// Registers a handler for `method` + `path`. `path` segments prefixed
    /// with `:` bind a named parameter; a single trailing `*name` captures
    /// the remainder of the path.
    pub fn route<F>(&mut self, method: Method, path: &'static str, handler: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut S, &'a Request, &'a mut Response, &'a Params) -> Handled
            + Sync
            + Send
            + 'static,
    {
        self.tree_mut(method).insert(path, Arc::new(handler));
        self
    }

    /// Looks up the handler for `method` against already-split `segments`,
    /// matching static > param > wildcard at each level.
    pub(crate) fn find(
        &self,
        method: Method,
        segments: &[&str],
    ) -> Option<(BoxedHandler<S>, Params)> {
        let mut params = Params::default();
        let handler = MethodTree::find(&self.tree(method).root, segments, &mut params)?;
        Some((handler.clone(), params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(path: &str) -> Vec<&str> {
        path.split('/').filter(|s| !s.is_empty()).collect()
    }

    #[test]
    fn static_beats_param() {
        let mut router: Router<()> = Router::new();
        router.route(Method::Get, "/users/me", |_, _, resp, _| {
            resp.status(crate::StatusCode::Ok).body("me")
        });
        router.route(Method::Get, "/users/:id", |_, _, resp, _| {
            resp.status(crate::StatusCode::Ok).body("id")
        });
        let (_, params) = router.find(Method::Get, &seg("/users/me")).unwrap();
        assert!(params.get("id").is_none());
    }

    #[test]
    fn param_binds_and_unbinds_on_backtrack() {
        let mut router: Router<()> = Router::new();
        router.route(Method::Get, "/a/:x/b/:y", |_, _, resp, _| {
            resp.status(crate::StatusCode::Ok).body("ok")
        });
        let (_, params) = router.find(Method::Get, &seg("/a/u/b/v")).unwrap();
        assert_eq!(params.get("x"), Some("u"));
        assert_eq!(params.get("y"), Some("v"));

        assert!(router.find(Method::Get, &seg("/a/u/c/v")).is_none());
    }

    #[test]
    fn wildcard_captures_remainder() {
        let mut router: Router<()> = Router::new();
        router.route(Method::Get, "/files/*p", |_, _, resp, _| {
            resp.status(crate::StatusCode::Ok).body("ok")
        });
        let (_, params) = router.find(Method::Get, &seg("/files/a/b")).unwrap();
        assert_eq!(params.get("p"), Some("a/b"));
    }

    #[test]
    fn no_match_returns_none() {
        let router: Router<()> = Router::new();
        assert!(router.find(Method::Get, &seg("/missing")).is_none());
    }
}
