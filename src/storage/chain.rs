//! The file chain: real files and interleaved staging files, ordered by
//! absolute offset.
//!
//! Nodes live in an arena with stable indices; two parallel links run
//! through them. `next` visits every node, `next_real` skips staging
//! nodes. Staging nodes are temporary overlays: their bytes mirror a range
//! of some real file that has not been merged yet.

use std::path::PathBuf;

pub(crate) type NodeId = usize;

#[derive(Debug)]
pub(crate) struct RealFile {
    /// Path relative to the torrent directory (or the bare name for a
    /// single-file torrent).
    pub(crate) path: PathBuf,
    /// Declared final length, immutable.
    pub(crate) length: u64,
    /// Number of pieces intersecting this file.
    pub(crate) piece_count: usize,
}

#[derive(Debug)]
pub(crate) struct StagingFile {
    /// `<subdir>/<torrent_id>-<offset_padded>`, relative to the staging
    /// root.
    pub(crate) name: String,
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    Real(RealFile),
    Staging(StagingFile),
}

#[derive(Debug)]
pub(crate) struct Node {
    /// Absolute start in the torrent's byte space.
    pub(crate) offset: u64,
    /// Bytes currently materialized on disk.
    pub(crate) size: u64,
    pub(crate) kind: NodeKind,
    pub(crate) next: Option<NodeId>,
    pub(crate) next_real: Option<NodeId>,
}

impl Node {
    pub(crate) fn real(path: PathBuf, offset: u64, length: u64, piece_count: usize) -> Self {
        Self {
            offset,
            size: 0,
            kind: NodeKind::Real(RealFile {
                path,
                length,
                piece_count,
            }),
            next: None,
            next_real: None,
        }
    }

    pub(crate) fn staging(name: String, offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            kind: NodeKind::Staging(StagingFile { name }),
            next: None,
            next_real: None,
        }
    }

    pub(crate) fn is_staging(&self) -> bool {
        matches!(self.kind, NodeKind::Staging(_))
    }

    pub(crate) fn as_real(&self) -> Option<&RealFile> {
        match &self.kind {
            NodeKind::Real(r) => Some(r),
            NodeKind::Staging(_) => None,
        }
    }

    /// Declared length for real files; for staging files the current size
    /// (a staging file has no declared length).
    pub(crate) fn length(&self) -> u64 {
        match &self.kind {
            NodeKind::Real(r) => r.length,
            NodeKind::Staging(_) => self.size,
        }
    }

    /// One past the last materialized byte.
    pub(crate) fn data_end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Arena-backed chain. Node ids stay valid until the node is removed.
#[derive(Debug, Default)]
pub(crate) struct Chain {
    nodes: Vec<Option<Node>>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
}

impl Chain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn head(&self) -> Option<NodeId> {
        self.head
    }

    pub(crate) fn exists(&self, id: NodeId) -> bool {
        self.nodes.get(id).is_some_and(Option::is_some)
    }

    /// Panics on a removed id; chain ids are managed by the engine and a
    /// stale id is a logic error.
    pub(crate) fn node(&self, id: NodeId) -> &Node {
        self.nodes[id]
            .as_ref()
            .unwrap_or_else(|| panic!("stale chain node id {id}"))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id]
            .as_mut()
            .unwrap_or_else(|| panic!("stale chain node id {id}"))
    }

    /// Adds a node to the arena without linking it.
    pub(crate) fn push(&mut self, node: Node) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Some(node));
        id
    }

    /// Appends a real node at the tail. Used by the layout builders, where
    /// every node is real and arrives in offset order.
    pub(crate) fn append_real(&mut self, node: Node) -> NodeId {
        let id = self.push(node);
        match self.tail {
            Some(tail) => {
                let prev = self.node_mut(tail);
                prev.next = Some(id);
                prev.next_real = Some(id);
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        id
    }

    /// Splices `id` in directly after `pred`, inheriting `pred`'s links.
    pub(crate) fn insert_after(&mut self, pred: NodeId, id: NodeId) {
        let (next, next_real) = {
            let p = self.node(pred);
            (p.next, p.next_real)
        };
        {
            let n = self.node_mut(id);
            n.next = next;
            n.next_real = next_real;
        }
        self.node_mut(pred).next = Some(id);
        if self.tail == Some(pred) {
            self.tail = Some(id);
        }
    }

    /// Unlinks and drops `id`, which must be `pred`'s direct successor.
    pub(crate) fn unlink_after(&mut self, pred: NodeId, id: NodeId) {
        let next = self.node(id).next;
        self.node_mut(pred).next = next;
        if self.tail == Some(id) {
            self.tail = Some(pred);
        }
        self.nodes[id] = None;
    }

    /// The last node whose offset is at most `offset` (following `next`),
    /// i.e. the insertion predecessor for a node starting at `offset`.
    pub(crate) fn insertion_point(&self, offset: u64) -> Option<NodeId> {
        let mut cur = self.head?;
        while let Some(next) = self.node(cur).next {
            if self.node(next).offset > offset {
                break;
            }
            cur = next;
        }
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn real(offset: u64, length: u64) -> Node {
        Node::real(PathBuf::from(format!("f{offset}")), offset, length, 0)
    }

    fn ids(chain: &Chain) -> Vec<NodeId> {
        std::iter::successors(chain.head(), |&id| chain.node(id).next).collect()
    }

    fn real_ids(chain: &Chain) -> Vec<NodeId> {
        std::iter::successors(chain.head(), |&id| chain.node(id).next_real).collect()
    }

    #[test]
    fn append_links_both_chains() {
        let mut chain = Chain::new();
        let a = chain.append_real(real(0, 10));
        let b = chain.append_real(real(10, 5));
        assert_eq!(chain.node(a).next, Some(b));
        assert_eq!(chain.node(a).next_real, Some(b));
        assert_eq!(ids(&chain), vec![a, b]);
    }

    #[test]
    fn insert_staging_keeps_real_chain() {
        let mut chain = Chain::new();
        let a = chain.append_real(real(0, 10));
        let b = chain.append_real(real(10, 5));
        let s = chain.push(Node::staging("00/x-05".into(), 5, 3));
        chain.insert_after(a, s);

        assert_eq!(ids(&chain), vec![a, s, b]);
        assert_eq!(real_ids(&chain), vec![a, b]);
        assert_eq!(chain.node(s).next_real, Some(b));
    }

    #[test]
    fn unlink_restores_links() {
        let mut chain = Chain::new();
        let a = chain.append_real(real(0, 10));
        let b = chain.append_real(real(10, 5));
        let s = chain.push(Node::staging("00/x-05".into(), 5, 3));
        chain.insert_after(a, s);

        chain.unlink_after(a, s);
        assert!(!chain.exists(s));
        assert_eq!(ids(&chain), vec![a, b]);
    }

    #[test]
    fn insertion_point_finds_predecessor() {
        let mut chain = Chain::new();
        let a = chain.append_real(real(0, 10));
        let b = chain.append_real(real(10, 5));
        assert_eq!(chain.insertion_point(4), Some(a));
        assert_eq!(chain.insertion_point(10), Some(b));
        assert_eq!(chain.insertion_point(100), Some(b));
    }
}
