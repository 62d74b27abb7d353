//! Deterministic, incrementally-repairable spanning tree rooted at the
//! current leader.
//!
//! The leader sits outside the balanced structure: it is always the parent
//! of whatever the AVL root happens to be. Everyone else is a node in an
//! AVL tree ordered by id. Mutually-referential parent/children pointers are
//! avoided by keeping one id-indexed map and storing neighbors by id, which
//! is also what makes node lookup and fan-out O(1)/O(children) instead of
//! needing a full tree walk.

use std::collections::HashMap;

use crate::protos::ServerId;

#[derive(Debug, Clone)]
struct AvlNode {
    address: String,
    parent: Option<ServerId>,
    left: Option<ServerId>,
    right: Option<ServerId>,
    height: i32,
}

/// A resolved view of one tree node, as handed to the multicast protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNode {
    pub id: ServerId,
    pub address: String,
    pub parent: Option<ServerId>,
    pub children: Vec<ServerId>,
}

#[derive(Debug, Clone, Default)]
pub struct SpanningTree {
    leader: Option<ServerId>,
    /// Root of the AVL structure over all non-leader ids.
    avl_root: Option<ServerId>,
    nodes: HashMap<ServerId, AvlNode>,
}

impl SpanningTree {
    pub fn new() -> Self {
        SpanningTree::default()
    }

    pub fn leader(&self) -> Option<ServerId> {
        self.leader
    }

    pub fn is_empty(&self) -> bool {
        self.leader.is_none()
    }

    /// Rebuilds the tree from scratch given a membership snapshot and the
    /// current leader id. Building a balanced BST directly from the sorted
    /// id sequence (rather than inserting one at a time) is what guarantees
    /// "same membership set + same root => identical tree" regardless of
    /// iteration order of the input map.
    pub fn rebuild(&mut self, members: &HashMap<ServerId, String>, leader: ServerId) {
        self.leader = Some(leader);
        self.nodes.clear();
        self.avl_root = None;

        if let Some(addr) = members.get(&leader) {
            self.nodes.insert(
                leader,
                AvlNode {
                    address: addr.clone(),
                    parent: None,
                    left: None,
                    right: None,
                    height: 1,
                },
            );
        }

        let mut rest: Vec<(ServerId, &String)> =
            members.iter().filter(|(id, _)| **id != leader).map(|(id, a)| (*id, a)).collect();
        rest.sort_by_key(|(id, _)| *id);

        self.avl_root = self.build_balanced(&rest, leader);
        if let Some(root) = self.avl_root {
            if let Some(n) = self.nodes.get_mut(&root) {
                n.parent = Some(leader);
            }
        }
    }

    /// Recursively builds a height-balanced BST from a sorted slice, the
    /// standard "sorted array -> balanced BST" construction.
    fn build_balanced(&mut self, sorted: &[(ServerId, &String)], parent: ServerId) -> Option<ServerId> {
        if sorted.is_empty() {
            return None;
        }
        let mid = sorted.len() / 2;
        let (id, addr) = &sorted[mid];

        let left = self.build_balanced(&sorted[..mid], *id);
        let right = self.build_balanced(&sorted[mid + 1..], *id);

        let left_h = left.map(|c| self.nodes[&c].height).unwrap_or(0);
        let right_h = right.map(|c| self.nodes[&c].height).unwrap_or(0);

        self.nodes.insert(
            *id,
            AvlNode {
                address: (*addr).clone(),
                parent: Some(parent),
                left,
                right,
                height: 1 + left_h.max(right_h),
            },
        );

        Some(*id)
    }

    fn height(&self, id: Option<ServerId>) -> i32 {
        id.map(|i| self.nodes[&i].height).unwrap_or(0)
    }

    fn update_height(&mut self, id: ServerId) {
        let (l, r) = {
            let n = &self.nodes[&id];
            (n.left, n.right)
        };
        let h = 1 + self.height(l).max(self.height(r));
        self.nodes.get_mut(&id).unwrap().height = h;
    }

    fn balance_factor(&self, id: ServerId) -> i32 {
        let n = &self.nodes[&id];
        self.height(n.left) - self.height(n.right)
    }

    /// Standard AVL left rotation. Returns the id that takes this subtree's
    /// former position.
    fn rotate_left(&mut self, id: ServerId) -> ServerId {
        let r = self.nodes[&id].right.expect("rotate_left requires a right child");
        let r_left = self.nodes[&r].left;

        self.nodes.get_mut(&id).unwrap().right = r_left;
        if let Some(rl) = r_left {
            self.nodes.get_mut(&rl).unwrap().parent = Some(id);
        }

        let old_parent = self.nodes[&id].parent;
        self.nodes.get_mut(&r).unwrap().left = Some(id);
        self.nodes.get_mut(&id).unwrap().parent = Some(r);
        self.nodes.get_mut(&r).unwrap().parent = old_parent;

        self.update_height(id);
        self.update_height(r);
        r
    }

    /// Standard AVL right rotation, mirror image of `rotate_left`.
    fn rotate_right(&mut self, id: ServerId) -> ServerId {
        let l = self.nodes[&id].left.expect("rotate_right requires a left child");
        let l_right = self.nodes[&l].right;

        self.nodes.get_mut(&id).unwrap().left = l_right;
        if let Some(lr) = l_right {
            self.nodes.get_mut(&lr).unwrap().parent = Some(id);
        }

        let old_parent = self.nodes[&id].parent;
        self.nodes.get_mut(&l).unwrap().right = Some(id);
        self.nodes.get_mut(&id).unwrap().parent = Some(l);
        self.nodes.get_mut(&l).unwrap().parent = old_parent;

        self.update_height(id);
        self.update_height(l);
        l
    }

    /// Rebalances the subtree rooted at `id`, returning the new subtree
    /// root. Assumes heights below `id` are already up to date.
    fn rebalance(&mut self, id: ServerId) -> ServerId {
        self.update_height(id);
        let bf = self.balance_factor(id);

        if bf > 1 {
            let left = self.nodes[&id].left.unwrap();
            if self.balance_factor(left) < 0 {
                let new_left = self.rotate_left(left);
                self.nodes.get_mut(&id).unwrap().left = Some(new_left);
            }
            return self.rotate_right(id);
        }
        if bf < -1 {
            let right = self.nodes[&id].right.unwrap();
            if self.balance_factor(right) > 0 {
                let new_right = self.rotate_right(right);
                self.nodes.get_mut(&id).unwrap().right = Some(new_right);
            }
            return self.rotate_left(id);
        }
        id
    }

    /// Inserts `id` into the AVL ordering beneath the leader. No-op if `id`
    /// already present or no leader is set.
    pub fn add_node(&mut self, id: ServerId, address: String) {
        if self.leader.is_none() || self.nodes.contains_key(&id) {
            return;
        }
        self.avl_root = Some(self.insert_rec(self.avl_root, id, address));
        let leader = self.leader.unwrap();
        if let Some(root) = self.avl_root {
            self.nodes.get_mut(&root).unwrap().parent = Some(leader);
        }
    }

    fn insert_rec(&mut self, current: Option<ServerId>, id: ServerId, address: String) -> ServerId {
        let current = match current {
            None => {
                self.nodes.insert(
                    id,
                    AvlNode {
                        address,
                        parent: None,
                        left: None,
                        right: None,
                        height: 1,
                    },
                );
                return id;
            }
            Some(c) => c,
        };

        if id < current {
            let new_left = self.insert_rec(self.nodes[&current].left, id, address);
            self.nodes.get_mut(&new_left).unwrap().parent = Some(current);
            self.nodes.get_mut(&current).unwrap().left = Some(new_left);
        } else if id > current {
            let new_right = self.insert_rec(self.nodes[&current].right, id, address);
            self.nodes.get_mut(&new_right).unwrap().parent = Some(current);
            self.nodes.get_mut(&current).unwrap().right = Some(new_right);
        } else {
            // Already present; nothing to do.
            return current;
        }

        self.rebalance(current)
    }

    /// Detaches the subtree at `id` and re-inserts each of its descendants
    /// one by one, rebalancing after each insertion.
    pub fn remove_node(&mut self, id: ServerId) {
        if Some(id) == self.leader {
            // The leader is replaced via `rebuild`, not removed from the tree.
            return;
        }
        let Some(node) = self.nodes.get(&id).cloned() else { return };

        let descendants = self.collect_descendants(id);

        // Detach `id` from its parent.
        if let Some(parent) = node.parent {
            if self.nodes[&parent].left == Some(id) {
                self.nodes.get_mut(&parent).unwrap().left = None;
            } else if self.nodes[&parent].right == Some(id) {
                self.nodes.get_mut(&parent).unwrap().right = None;
            }
            self.rebalance_ancestors(parent);
        } else if self.avl_root == Some(id) {
            self.avl_root = None;
        }

        for ancestor in descendants.iter() {
            self.nodes.remove(ancestor);
        }
        self.nodes.remove(&id);

        for (desc_id, desc_addr) in descendants {
            self.add_node(desc_id, desc_addr);
        }
    }

    /// Ids and addresses of every node in the subtree rooted at `id`,
    /// excluding `id` itself, in an arbitrary but fixed (DFS) order.
    fn collect_descendants(&self, id: ServerId) -> Vec<(ServerId, String)> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let node = &self.nodes[&id];
        if let Some(l) = node.left {
            stack.push(l);
        }
        if let Some(r) = node.right {
            stack.push(r);
        }
        while let Some(cur) = stack.pop() {
            let n = &self.nodes[&cur];
            out.push((cur, n.address.clone()));
            if let Some(l) = n.left {
                stack.push(l);
            }
            if let Some(r) = n.right {
                stack.push(r);
            }
        }
        out
    }

    fn rebalance_ancestors(&mut self, mut id: ServerId) {
        loop {
            let new_root = self.rebalance(id);
            let parent = self.nodes[&new_root].parent;
            match parent {
                Some(p) if Some(p) != self.leader => {
                    if self.nodes[&p].left == Some(id) {
                        self.nodes.get_mut(&p).unwrap().left = Some(new_root);
                    } else {
                        self.nodes.get_mut(&p).unwrap().right = Some(new_root);
                    }
                    id = p;
                }
                Some(leader) => {
                    self.avl_root = Some(new_root);
                    self.nodes.get_mut(&new_root).unwrap().parent = Some(leader);
                    break;
                }
                None => {
                    self.avl_root = Some(new_root);
                    break;
                }
            }
        }
    }

    /// Finds the node with the given id, used to locate self before
    /// fan-out. The leader sits outside the AVL structure proper, so its one
    /// child is always the current `avl_root` rather than whatever its
    /// (unused) `left`/`right` fields hold.
    pub fn find(&self, id: ServerId) -> Option<ResolvedNode> {
        let n = self.nodes.get(&id)?;
        let children = if Some(id) == self.leader {
            self.avl_root.into_iter().collect()
        } else {
            [n.left, n.right].into_iter().flatten().collect()
        };
        Some(ResolvedNode { id, address: n.address.clone(), parent: n.parent, children })
    }

    /// Depth-first listing of every node currently in the tree, rooted at
    /// the leader.
    pub fn print_tree(&self) -> Vec<ResolvedNode> {
        let mut out = Vec::new();
        if let Some(leader) = self.leader {
            let mut stack = vec![leader];
            while let Some(id) = stack.pop() {
                if let Some(resolved) = self.find(id) {
                    stack.extend(resolved.children.iter().rev().copied());
                    out.push(resolved);
                }
            }
        }
        out
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[ServerId]) -> HashMap<ServerId, String> {
        ids.iter().map(|id| (*id, format!("host{id}:9000"))).collect()
    }

    #[test]
    fn rebuild_is_rooted_at_leader_and_contains_all_ids() {
        let mut tree = SpanningTree::new();
        tree.rebuild(&members(&[1, 2, 3, 4, 5]), 1);
        assert_eq!(tree.leader(), Some(1));
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.find(1).unwrap().parent, None);
        for id in [2, 3, 4, 5] {
            assert!(tree.find(id).is_some());
        }
    }

    #[test]
    fn rebuild_is_deterministic_regardless_of_input_order() {
        let mut a = SpanningTree::new();
        a.rebuild(&members(&[5, 3, 1, 4, 2]), 1);

        let mut b = SpanningTree::new();
        b.rebuild(&members(&[1, 2, 3, 4, 5]), 1);

        for id in [1, 2, 3, 4, 5] {
            assert_eq!(a.find(id).unwrap().children, b.find(id).unwrap().children);
            assert_eq!(a.find(id).unwrap().parent, b.find(id).unwrap().parent);
        }
    }

    #[test]
    fn add_node_keeps_tree_balanced() {
        let mut tree = SpanningTree::new();
        tree.rebuild(&members(&[1]), 1);
        for id in 2..=10 {
            tree.add_node(id, format!("host{id}:9000"));
        }
        assert_balanced(&tree, tree.leader().unwrap());
    }

    #[test]
    fn remove_node_reattaches_descendants() {
        let mut tree = SpanningTree::new();
        tree.rebuild(&members(&[1, 2, 3, 4, 5, 6, 7]), 1);
        tree.remove_node(4);
        assert!(!tree.contains(4));
        for id in [2, 3, 5, 6, 7] {
            assert!(tree.contains(id));
        }
        assert_balanced(&tree, tree.leader().unwrap());
    }

    fn assert_balanced(tree: &SpanningTree, root: ServerId) {
        fn check(tree: &SpanningTree, id: ServerId) -> i32 {
            let node = tree.find(id).unwrap();
            let heights: Vec<i32> = node.children.iter().map(|c| check(tree, *c)).collect();
            let h = 1 + heights.iter().copied().max().unwrap_or(0);
            if node.children.len() == 2 {
                let diff = (heights[0] - heights[1]).abs();
                assert!(diff <= 1, "unbalanced at {id}: {heights:?}");
            }
            h
        }
        // The leader itself is allowed exactly one child (the AVL root); its
        // balance is not an AVL property, only the subtree beneath it is.
        let resolved = tree.find(root).unwrap();
        for child in resolved.children {
            check(tree, child);
        }
    }
}
