//! View-change agreement tree.
//!
//! During a view change every replica asserts the chain of (state digest,
//! history digest) pairs it believes follows the last agreed sequence
//! number. The tree merges those assertions: one node per distinct pair at
//! each sequence number, annotated with the replicas that support it. A
//! path is certified once every node on it reaches the quorum threshold.
//!
//! # Structure
//!
//! ```text
//! root (seq n)
//!  ├── (d1, h1) seq n+1   support {0,1,2}
//!  │    └── (d2, h2) seq n+2   support {0,1}
//!  └── (d1', h1') seq n+1  support {3}
//! ```
//!
//! Nodes live in an arena and are addressed by [`NodeIndex`]. Siblings keep
//! insertion order, which only matters for display.

use bulwark_types::{Hash, ReplicaId, SeqNo, SupportBitfield};
use std::fmt;
use std::ops::Index;
use tracing::{debug, warn};

// ═══════════════════════════════════════════════════════════════════════════
// Quorum Policy
// ═══════════════════════════════════════════════════════════════════════════

/// Which threshold a certification needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quorum {
    /// `f + 1`: at least one correct replica agrees.
    Weak,
    /// `2f + 1`: a majority of correct replicas agree.
    Strong,
}

/// Thresholds for a cluster of `n = 3f + 1` replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuorumPolicy {
    cluster_size: usize,
    faults: usize,
}

impl QuorumPolicy {
    pub fn for_cluster(cluster_size: usize) -> Self {
        Self {
            cluster_size,
            faults: cluster_size.saturating_sub(1) / 3,
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    /// Tolerated Byzantine replicas.
    pub fn faults(&self) -> usize {
        self.faults
    }

    pub fn weak(&self) -> usize {
        self.faults + 1
    }

    pub fn strong(&self) -> usize {
        2 * self.faults + 1
    }

    pub fn threshold(&self, quorum: Quorum) -> usize {
        match quorum {
            Quorum::Weak => self.weak(),
            Quorum::Strong => self.strong(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Nodes
// ═══════════════════════════════════════════════════════════════════════════

/// Stable handle to a node of one [`AgreementTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

/// One candidate state at one sequence number.
#[derive(Debug, Clone)]
pub struct AgreementNode {
    digest: Hash,
    history: Hash,
    seq: SeqNo,
    support: SupportBitfield,
    support_count: usize,
    children: Vec<NodeIndex>,
}

impl AgreementNode {
    fn new(digest: Hash, history: Hash, seq: SeqNo, cluster_size: usize) -> Self {
        Self {
            digest,
            history,
            seq,
            support: SupportBitfield::new(cluster_size),
            support_count: 0,
            children: Vec::new(),
        }
    }

    pub fn digest(&self) -> Hash {
        self.digest
    }

    pub fn history(&self) -> Hash {
        self.history
    }

    pub fn seq(&self) -> SeqNo {
        self.seq
    }

    pub fn support(&self) -> &SupportBitfield {
        &self.support
    }

    pub fn support_count(&self) -> usize {
        self.support_count
    }

    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tree
// ═══════════════════════════════════════════════════════════════════════════

/// Candidate successor states rooted at the last agreed sequence number.
#[derive(Debug, Clone)]
pub struct AgreementTree {
    nodes: Vec<AgreementNode>,
    policy: QuorumPolicy,
}

impl AgreementTree {
    /// Start a tree at the last agreed state.
    pub fn new(root_seq: SeqNo, digest: Hash, history: Hash, policy: QuorumPolicy) -> Self {
        let root = AgreementNode::new(digest, history, root_seq, policy.cluster_size());
        Self {
            nodes: vec![root],
            policy,
        }
    }

    pub fn root(&self) -> NodeIndex {
        NodeIndex(0)
    }

    pub fn policy(&self) -> QuorumPolicy {
        self.policy
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, node: NodeIndex) -> Option<&AgreementNode> {
        self.nodes.get(node.0)
    }

    /// The child of `parent` holding (`digest`, `history`), created on first
    /// sight at `parent.seq + 1`.
    pub fn get_or_create_child(&mut self, parent: NodeIndex, digest: Hash, history: Hash) -> NodeIndex {
        let existing = self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|c| {
                let child = &self.nodes[c.0];
                child.digest == digest && child.history == history
            });
        if let Some(child) = existing {
            return child;
        }

        let seq = self.nodes[parent.0].seq.next();
        let index = NodeIndex(self.nodes.len());
        self.nodes
            .push(AgreementNode::new(digest, history, seq, self.policy.cluster_size()));
        self.nodes[parent.0].children.push(index);
        debug!(seq = seq.0, digest = ?digest, "New agreement candidate");
        index
    }

    /// Mark `replica` as supporting `node`. Returns whether this was new.
    pub fn add_support(&mut self, node: NodeIndex, replica: ReplicaId) -> bool {
        let entry = &mut self.nodes[node.0];
        if replica.0 as usize >= entry.support.len() {
            warn!(replica = replica.0, cluster = entry.support.len(), "Support from unknown replica");
            return false;
        }
        if entry.support.set(replica) {
            entry.support_count += 1;
            true
        } else {
            false
        }
    }

    pub fn support_count(&self, node: NodeIndex) -> usize {
        self.nodes[node.0].support_count
    }

    /// Add a replica's asserted chain, starting just after the root. Returns
    /// the node at the end of the chain.
    pub fn record_vote(&mut self, replica: ReplicaId, path: &[(Hash, Hash)]) -> NodeIndex {
        let mut node = self.root();
        for &(digest, history) in path {
            node = self.get_or_create_child(node, digest, history);
            self.add_support(node, replica);
        }
        node
    }

    /// The deepest chain below the root whose every node meets `quorum`.
    ///
    /// Among equally deep chains the earliest inserted wins. With a strong
    /// quorum at most one child of any node can qualify.
    pub fn certified_path(&self, quorum: Quorum) -> Vec<NodeIndex> {
        let threshold = self.policy.threshold(quorum);
        self.deepest_from(self.root(), threshold)
    }

    fn deepest_from(&self, node: NodeIndex, threshold: usize) -> Vec<NodeIndex> {
        let mut best: Vec<NodeIndex> = Vec::new();
        for &child in &self.nodes[node.0].children {
            if self.nodes[child.0].support_count < threshold {
                continue;
            }
            let mut path = vec![child];
            path.extend(self.deepest_from(child, threshold));
            if path.len() > best.len() {
                best = path;
            }
        }
        best
    }

    fn render(&self, node: NodeIndex, prefix: &mut String, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entry = &self.nodes[node.0];
        write!(f, "{prefix}+Node({}, {} [", entry.seq, entry.support_count)?;
        for replica in 0..entry.support.len() as u32 {
            if entry.support.is_set(ReplicaId(replica)) {
                write!(f, " {replica}")?;
            } else {
                write!(f, " -")?;
            }
        }
        writeln!(f, "])")?;

        prefix.push(' ');
        for &child in &entry.children {
            self.render(child, prefix, f)?;
        }
        prefix.pop();
        Ok(())
    }
}

impl Index<NodeIndex> for AgreementTree {
    type Output = AgreementNode;

    fn index(&self, node: NodeIndex) -> &AgreementNode {
        &self.nodes[node.0]
    }
}

impl fmt::Display for AgreementTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(self.root(), &mut String::new(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn h(label: &str) -> Hash {
        Hash::from_bytes(label.as_bytes())
    }

    fn tree(n: usize) -> AgreementTree {
        AgreementTree::new(SeqNo(100), h("root"), h("root-hist"), QuorumPolicy::for_cluster(n))
    }

    #[test]
    fn test_quorum_policy() {
        let p = QuorumPolicy::for_cluster(4);
        assert_eq!((p.faults(), p.weak(), p.strong()), (1, 2, 3));
        let p = QuorumPolicy::for_cluster(7);
        assert_eq!((p.faults(), p.weak(), p.strong()), (2, 3, 5));
        let p = QuorumPolicy::for_cluster(1);
        assert_eq!((p.faults(), p.weak(), p.strong()), (0, 1, 1));
    }

    #[traced_test]
    #[test]
    fn test_get_or_create_child_is_keyed_by_value() {
        let mut t = tree(4);
        let root = t.root();
        let a = t.get_or_create_child(root, h("d1"), h("h1"));
        let again = t.get_or_create_child(root, h("d1"), h("h1"));
        let other_digest = t.get_or_create_child(root, h("d2"), h("h1"));
        let other_history = t.get_or_create_child(root, h("d1"), h("h2"));

        assert_eq!(a, again);
        assert_ne!(a, other_digest);
        assert_ne!(a, other_history);
        assert_ne!(other_digest, other_history);
        assert_eq!(t[root].children().len(), 3);
        assert_eq!(t.len(), 4);
        assert_eq!(t[a].seq(), SeqNo(101));

        let grandchild = t.get_or_create_child(a, h("d3"), h("h3"));
        assert_eq!(t[grandchild].seq(), SeqNo(102));
    }

    #[traced_test]
    #[test]
    fn test_add_support_is_idempotent() {
        let mut t = tree(4);
        let node = t.get_or_create_child(t.root(), h("d"), h("h"));

        assert!(t.add_support(node, ReplicaId(1)));
        assert!(!t.add_support(node, ReplicaId(1)));
        assert!(t.add_support(node, ReplicaId(3)));
        assert!(!t.add_support(node, ReplicaId(9)));
        assert_eq!(t.support_count(node), 2);
        assert_eq!(t[node].support().count(), 2);
    }

    #[traced_test]
    #[test]
    fn test_certified_path_follows_quorum() {
        let mut t = tree(4);
        let honest = [(h("d1"), h("h1")), (h("d2"), h("h2")), (h("d3"), h("h3"))];
        t.record_vote(ReplicaId(0), &honest);
        t.record_vote(ReplicaId(1), &honest);
        t.record_vote(ReplicaId(2), &honest[..2]);
        t.record_vote(ReplicaId(3), &[(h("evil"), h("evil"))]);

        let strong = t.certified_path(Quorum::Strong);
        assert_eq!(strong.len(), 2);
        assert_eq!(t[strong[1]].digest(), h("d2"));

        let weak = t.certified_path(Quorum::Weak);
        assert_eq!(weak.len(), 3);
        assert_eq!(t[weak[2]].seq(), SeqNo(103));
    }

    #[test]
    fn test_certified_path_empty_without_quorum() {
        let mut t = tree(4);
        t.record_vote(ReplicaId(0), &[(h("a"), h("a"))]);
        t.record_vote(ReplicaId(1), &[(h("b"), h("b"))]);
        assert!(t.certified_path(Quorum::Strong).is_empty());
    }

    #[test]
    fn test_display_renders_insertion_order() {
        let mut t = tree(4);
        let a = t.record_vote(ReplicaId(0), &[(h("a"), h("a"))]);
        t.record_vote(ReplicaId(2), &[(h("b"), h("b"))]);
        t.add_support(a, ReplicaId(1));

        let rendered = t.to_string();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(
            lines,
            vec![
                "+Node(100, 0 [ - - - -])",
                " +Node(101, 2 [ 0 1 - -])",
                " +Node(101, 1 [ - - 2 -])",
            ]
        );
    }
}
