//! The nested permissioned tree: nodes whose parent assignments are ops,
//! governed by permission groups that are themselves materialized from ops
//! in the same op-set.

use crate::acl::{Groups, PermGroupId};
use crate::heads::DesiredHeads;
use crate::id::{DeviceId, ObjectId, StreamId, StreamRole};
use crate::op::Op;
use crate::opset::Replay;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identifies a tree node.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct TreeId([u8; 32]);

impl TreeId {
    /// Creates a node id from raw bytes.
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }

    /// Mints a fresh random node id.
    pub fn generate() -> Self {
        Self(ObjectId::generate().into())
    }

    /// The stream scope of this node's parent streams.
    pub fn scope(self) -> ObjectId {
        ObjectId::new(self.0)
    }
}

impl From<TreeId> for [u8; 32] {
    fn from(id: TreeId) -> Self {
        id.0
    }
}

impl From<TreeId> for ObjectId {
    fn from(id: TreeId) -> Self {
        ObjectId::new(id.0)
    }
}

impl std::fmt::Debug for TreeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

/// Ops of the tree domain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TreeOp {
    /// Assigns a node's parent. Authored to the child's parent stream.
    SetParent {
        /// Node being moved.
        child: TreeId,
        /// Its new parent.
        parent: TreeId,
    },
    /// Admits a writer group into a dynamic group. Authored to the group's
    /// perm stream.
    AddWriter {
        /// The group gaining a writer.
        group: PermGroupId,
        /// The admitted writer group.
        writer: PermGroupId,
    },
    /// Removes a writer group. The op's contributing heads pin the final
    /// admitted op per stream of the removed devices.
    RemoveWriter {
        /// The group losing a writer.
        group: PermGroupId,
        /// The removed writer group.
        writer: PermGroupId,
    },
}

/// One registered tree node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Node {
    admin: PermGroupId,
    parent_group: PermGroupId,
    parent: Option<TreeId>,
}

impl Node {
    /// The group writing *into* this node.
    pub fn admin(&self) -> PermGroupId {
        self.admin
    }

    /// The group assigning this node's parent from above.
    pub fn parent_group(&self) -> PermGroupId {
        self.parent_group
    }

    /// The current parent, if assigned.
    pub fn parent(&self) -> Option<TreeId> {
        self.parent
    }
}

/// The materialized tree state: a group arena plus node definitions.
///
/// Nodes and groups are registered when the initial value is built; ops
/// only mutate parents and memberships. The parent of each node is the one
/// assigned by its latest admitted set-parent; a subtree whose root lost
/// its place stays addressable by id even when no longer reachable from
/// any root.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Forest {
    groups: Groups<TreeOp>,
    nodes: BTreeMap<TreeId, Node>,
}

impl Forest {
    /// An empty forest.
    pub fn new() -> Self {
        Self {
            groups: Groups::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// Registers a static permission group.
    pub fn insert_static_group(
        &mut self,
        members: std::collections::BTreeSet<DeviceId>,
    ) -> PermGroupId {
        self.groups.insert_static(members)
    }

    /// Registers a dynamic permission group under `admin`.
    pub fn insert_dynamic_group(&mut self, admin: PermGroupId, nonce: u64) -> PermGroupId {
        self.groups.insert_dynamic(admin, nonce)
    }

    /// Registers a node. `admin` writes into the node, `parent_group`
    /// assigns its parent from above.
    pub fn insert_node(&mut self, id: TreeId, admin: PermGroupId, parent_group: PermGroupId) {
        self.nodes.insert(
            id,
            Node {
                admin,
                parent_group,
                parent: None,
            },
        );
    }

    /// The group arena.
    pub fn groups(&self) -> &Groups<TreeOp> {
        &self.groups
    }

    /// A registered node.
    pub fn node(&self, id: TreeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// The current parent of a node.
    pub fn parent(&self, id: TreeId) -> Option<TreeId> {
        self.nodes.get(&id).and_then(|node| node.parent)
    }

    /// Nodes whose parent is `id`, in id order.
    pub fn children(&self, id: TreeId) -> Vec<TreeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.parent == Some(id))
            .map(|(child, _)| *child)
            .collect()
    }

    /// Nodes with no parent, in id order.
    pub fn roots(&self) -> Vec<TreeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.parent.is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    /// The ids reachable from `root` through parent links, including
    /// `root`. This is the root-connected view; ids absent from it remain
    /// addressable via [`Forest::node`].
    pub fn subtree(&self, root: TreeId) -> Vec<TreeId> {
        let mut out = vec![root];
        let mut i = 0;
        while i < out.len() {
            let id = out[i];
            out.extend(self.children(id));
            i += 1;
        }
        out
    }

    /// Whether `id` sits below `ancestor` (or is it).
    pub fn is_descendant(&self, id: TreeId, ancestor: TreeId) -> bool {
        let mut cur = Some(id);
        let mut hops = 0;
        while let Some(node) = cur {
            if node == ancestor {
                return true;
            }
            cur = self.parent(node);
            // materialized trees are acyclic, but never trust a walk
            hops += 1;
            if hops > self.nodes.len() {
                break;
            }
        }
        false
    }

    fn authored_by_writer(&self, group: PermGroupId, streams: &[StreamId]) -> bool {
        streams
            .iter()
            .any(|s| self.groups.is_open_writer(group, s.device()))
    }

    fn apply_set_parent(&mut self, child: TreeId, parent: TreeId, streams: &[StreamId]) -> bool {
        let (admin, parent_group) = match self.nodes.get(&child) {
            Some(node) => (node.admin, node.parent_group),
            None => return false,
        };
        if !self.nodes.contains_key(&parent) {
            return false;
        }
        if !self.authored_by_writer(parent_group, streams)
            && !self.authored_by_writer(admin, streams)
        {
            return false;
        }
        if child == parent || self.is_descendant(parent, child) {
            return false;
        }
        match self.nodes.get_mut(&child) {
            Some(node) => {
                node.parent = Some(parent);
                true
            }
            None => false,
        }
    }
}

impl Default for Forest {
    fn default() -> Self {
        Self::new()
    }
}

impl Replay for Forest {
    type Payload = TreeOp;

    fn replay(&self, op: &Op<TreeOp>, streams: &[StreamId]) -> Self {
        let mut next = self.clone();
        match op.payload() {
            TreeOp::SetParent { child, parent } => {
                if !next.apply_set_parent(*child, *parent, streams) {
                    tracing::info!("set-parent {:?} -> {:?} not admitted", child, parent);
                }
            }
            TreeOp::AddWriter { group, writer } => {
                let admitted = match self.groups.admin(*group) {
                    Some(admin) if self.authored_by_writer(admin, streams) => {
                        next.groups.add_writer(*group, *writer)
                    }
                    _ => false,
                };
                if !admitted {
                    tracing::info!("add-writer {:?} -> {:?} not admitted", writer, group);
                }
            }
            TreeOp::RemoveWriter { group, writer } => {
                let admitted = match self.groups.admin(*group) {
                    Some(admin) if self.authored_by_writer(admin, streams) => next
                        .groups
                        .remove_writer(
                            *group,
                            *writer,
                            Arc::new(op.contributing().clone()),
                            op.timestamp(),
                        ),
                    _ => false,
                };
                if !admitted {
                    tracing::info!("remove-writer {:?} -> {:?} not admitted", writer, group);
                }
            }
        }
        next
    }

    fn desired_heads(&self) -> DesiredHeads<TreeOp> {
        let mut out = self.groups.desired_heads();
        for (id, node) in &self.nodes {
            self.groups
                .stream_heads(node.parent_group, id.scope(), StreamRole::Parent, &mut out);
            self.groups
                .stream_heads(node.admin, id.scope(), StreamRole::Parent, &mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heads::Heads;
    use crate::op::{OpList, Timestamp};
    use crate::opset::{OpSet, Persistent};
    use anyhow::Result;
    use std::sync::Arc;

    fn device(i: u8) -> DeviceId {
        DeviceId::new([i; 32])
    }

    fn node_id(i: u8) -> TreeId {
        TreeId::new([i; 32])
    }

    struct Fixture {
        owner: PermGroupId,
        root_group: PermGroupId,
        forest: Forest,
    }

    /// Forest with nodes r, x, y, z writable by device 1 through a dynamic
    /// group administered by the static group {1}.
    fn fixture() -> Fixture {
        let mut forest = Forest::new();
        let owner = forest.insert_static_group([device(1)].into());
        let root_group = forest.insert_dynamic_group(owner, 0);
        for i in [10, 11, 12, 13] {
            forest.insert_node(node_id(i), root_group, root_group);
        }
        Fixture {
            owner,
            root_group,
            forest,
        }
    }

    fn set_parent(ts: u64, child: TreeId, parent: TreeId) -> Arc<Op<TreeOp>> {
        Op::new(Timestamp::new(ts), TreeOp::SetParent { child, parent })
    }

    fn parent_stream(d: u8, child: TreeId) -> StreamId {
        StreamId::new(device(d), child.scope(), StreamRole::Parent)
    }

    #[test]
    fn test_parent_assignment() -> Result<()> {
        let fx = fixture();
        let (r, x, y) = (node_id(10), node_id(11), node_id(12));

        let mut remote = Heads::new();
        remote.insert(parent_stream(1, x), OpList::new(set_parent(10, x, r)));
        remote.insert(parent_stream(1, y), OpList::new(set_parent(20, y, x)));

        let set = OpSet::new(Persistent::new(fx.forest)).update(&remote)?;
        let forest = set.value().get();
        assert_eq!(forest.parent(x), Some(r));
        assert_eq!(forest.parent(y), Some(x));
        assert_eq!(forest.children(x), vec![y]);
        assert_eq!(forest.roots(), vec![r, node_id(13)]);
        assert_eq!(forest.subtree(r), vec![r, x, y]);
        Ok(())
    }

    #[test]
    fn test_parent_cycle_refused() -> Result<()> {
        let fx = fixture();
        let (x, y) = (node_id(11), node_id(12));

        // x under y, then y under x: exactly one wins
        let mut remote = Heads::new();
        remote.insert(parent_stream(1, x), OpList::new(set_parent(10, x, y)));
        remote.insert(parent_stream(1, y), OpList::new(set_parent(20, y, x)));

        let set = OpSet::new(Persistent::new(fx.forest)).update(&remote)?;
        let forest = set.value().get();
        assert_eq!(forest.parent(x), Some(y));
        assert_eq!(forest.parent(y), None);
        assert!(!forest.is_descendant(y, x));
        // the refused op is journaled all the same
        assert_eq!(set.journal().len(), 2);
        Ok(())
    }

    #[test]
    fn test_self_parent_refused() -> Result<()> {
        let fx = fixture();
        let x = node_id(11);
        let mut remote = Heads::new();
        remote.insert(parent_stream(1, x), OpList::new(set_parent(10, x, x)));

        let set = OpSet::new(Persistent::new(fx.forest)).update(&remote)?;
        assert_eq!(set.value().get().parent(x), None);
        Ok(())
    }

    #[test]
    fn test_reparent_orphans_but_keeps_addressable() -> Result<()> {
        let fx = fixture();
        let (r, x, y, z) = (node_id(10), node_id(11), node_id(12), node_id(13));

        // x under r, y under x, then x moves under z which hangs outside r
        let x_stream = OpList::new(set_parent(10, x, r)).append(set_parent(30, x, z))?;
        let mut remote = Heads::new();
        remote.insert(parent_stream(1, x), x_stream);
        remote.insert(parent_stream(1, y), OpList::new(set_parent(20, y, x)));

        let set = OpSet::new(Persistent::new(fx.forest)).update(&remote)?;
        let forest = set.value().get();
        assert_eq!(forest.parent(x), Some(z));
        // r's subtree no longer reaches x or y
        assert_eq!(forest.subtree(r), vec![r]);
        // but both stay addressable and keep their state
        assert_eq!(forest.parent(y), Some(x));
        assert!(forest.node(y).is_some());
        Ok(())
    }

    #[test]
    fn test_unauthorized_set_parent_rejected() -> Result<()> {
        let fx = fixture();
        let (r, x) = (node_id(10), node_id(11));

        // device 2 is not a writer anywhere; even when its stream reaches
        // the op-set the projection never exposes it
        let mut remote = Heads::new();
        remote.insert(parent_stream(2, x), OpList::new(set_parent(10, x, r)));

        let set = OpSet::new(Persistent::new(fx.forest)).update(&remote)?;
        assert_eq!(set.value().get().parent(x), None);
        assert!(set.heads().is_empty());
        Ok(())
    }

    #[test]
    fn test_writer_removal_reverts_reparent() -> Result<()> {
        let fx = fixture();
        let (r, x) = (node_id(10), node_id(11));
        let mut forest = fx.forest.clone();
        let b_static = forest.insert_static_group([device(2)].into());

        let perm = StreamId::new(device(1), fx.root_group.scope(), StreamRole::Perm);
        let b_parent = parent_stream(2, x);

        let add = Op::new(
            Timestamp::new(10),
            TreeOp::AddWriter {
                group: fx.root_group,
                writer: b_static,
            },
        );
        let moved = set_parent(20, x, r);
        let b_list = OpList::new(moved.clone());

        let mut remote = Heads::new();
        remote.insert(perm, OpList::new(add.clone()));
        remote.insert(b_parent, b_list.clone());

        let set = OpSet::new(Persistent::new(forest)).update(&remote)?;
        assert_eq!(set.value().get().parent(x), Some(r));

        // the admin removes device 2 without admitting any of its ops
        let remove = Op::revoking(
            Timestamp::new(30),
            TreeOp::RemoveWriter {
                group: fx.root_group,
                writer: b_static,
            },
            Default::default(),
        );
        let mut remote = Heads::new();
        remote.insert(perm, OpList::new(add).append(remove)?);
        remote.insert(b_parent, b_list);

        let set = set.update(&remote)?;
        // history rewrote: the reparent never happened
        assert_eq!(set.value().get().parent(x), None);
        assert_eq!(set.heads().get(&b_parent), None);
        Ok(())
    }

    #[test]
    fn test_unregistered_node_rejected() -> Result<()> {
        let fx = fixture();
        let ghost = TreeId::new([99; 32]);
        let x = node_id(11);

        let mut remote = Heads::new();
        remote.insert(
            parent_stream(1, ghost),
            OpList::new(set_parent(10, ghost, x)),
        );

        // the stream is not desired (unregistered scope), so nothing applies
        let set = OpSet::new(Persistent::new(fx.forest.clone())).update(&remote)?;
        assert_eq!(set.value().get(), &fx.forest);
        Ok(())
    }

    #[test]
    fn test_owner_group_always_writes() {
        let fx = fixture();
        // device 1 is open through the dynamic group's admin chain
        assert!(fx
            .forest
            .groups()
            .is_open_writer(fx.root_group, device(1)));
        assert!(!fx.forest.groups().is_open_writer(fx.owner, device(2)));
    }
}
