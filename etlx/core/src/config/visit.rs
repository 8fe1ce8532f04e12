//! Depth-first traversal of the configuration tree.

use super::node::{DynamicQuery, Node, METADATA_KEY};

/// Receives every node of a tree, parents before children.
pub trait VisitMut {
    fn visit(&mut self, path: &[String], node: &mut Node);
}

/// Walk `node` depth first. `path` holds the map keys (or list indexes) leading to each node.
pub fn walk_mut<V: VisitMut + ?Sized>(node: &mut Node, visitor: &mut V) {
    let mut path = Vec::new();
    walk_inner(node, visitor, &mut path);
}

fn walk_inner<V: VisitMut + ?Sized>(node: &mut Node, visitor: &mut V, path: &mut Vec<String>) {
    visitor.visit(path, node);
    match node {
        Node::Map(map) => {
            for (key, child) in map.iter_mut() {
                path.push(key.clone());
                walk_inner(child, visitor, path);
                path.pop();
            }
        }
        Node::List(items) => {
            for (idx, child) in items.iter_mut().enumerate() {
                path.push(idx.to_string());
                walk_inner(child, visitor, path);
                path.pop();
            }
        }
        _ => {}
    }
}

/// Turns `get_dyn_queries[...]` strings found inside `metadata` blocks into [`Node::Dynamic`].
#[derive(Debug, Default)]
pub struct DynamicQueries {
    pub converted: usize,
}

impl VisitMut for DynamicQueries {
    fn visit(&mut self, path: &[String], node: &mut Node) {
        if !path.iter().any(|p| p == METADATA_KEY) {
            return;
        }
        if let Node::String(s) = node {
            if let Some(dq) = DynamicQuery::parse(s) {
                *node = Node::Dynamic(dq);
                self.converted += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::node::NodeMap;

    #[test]
    fn converts_only_inside_metadata() {
        let mut meta = NodeMap::new();
        meta.insert(
            "before_sql".into(),
            Node::List(vec![
                Node::from("LOAD json"),
                Node::from("get_dyn_queries[cols](a,b)"),
            ]),
        );
        let mut section = NodeMap::new();
        section.insert(METADATA_KEY.into(), Node::Map(meta));
        section.insert("raw".into(), Node::from("get_dyn_queries[cols]"));
        let mut root = Node::Map(section);

        let mut visitor = DynamicQueries::default();
        walk_mut(&mut root, &mut visitor);

        assert_eq!(visitor.converted, 1);
        let list = root.get("metadata").unwrap().get("before_sql").unwrap();
        assert!(matches!(list.as_list().unwrap()[1], Node::Dynamic(_)));
        assert_eq!(root.get_str("raw"), Some("get_dyn_queries[cols]"));
    }
}
