//! Permission groups and writer resolution.
//!
//! Groups are values held in an arena and referenced by id; objects never
//! hold back-pointers to the groups that govern them, which keeps the
//! group/object reference graph acyclic at the representation level even
//! when the governance graph is not. A static group is a fixed device set
//! and its identity *is* that set. A dynamic group owns a perm stream per
//! admin device; its membership is materialized from admitted add/remove
//! ops.

use crate::heads::DesiredHeads;
use crate::id::{DeviceId, ObjectId, StreamId, StreamRole};
use crate::op::{ContributingHeads, Timestamp};
use crepe::crepe;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Identifies a permission group.
///
/// Static ids are the digest of the sorted member set, dynamic ids are
/// derived from the admin's id and a disambiguator, so an id commits to
/// what the group *is* without carrying the value around.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct PermGroupId([u8; 32]);

impl PermGroupId {
    /// Creates a group id from raw bytes.
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }

    /// The stream scope of this group's perm streams.
    pub fn scope(self) -> ObjectId {
        ObjectId::new(self.0)
    }

    fn of_static(members: &BTreeSet<DeviceId>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for device in members {
            hasher.update(device.as_ref());
        }
        Self(hasher.finalize().into())
    }

    fn derive(admin: PermGroupId, nonce: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&admin.0);
        hasher.update(&nonce.to_be_bytes());
        Self(hasher.finalize().into())
    }
}

impl From<PermGroupId> for [u8; 32] {
    fn from(id: PermGroupId) -> Self {
        id.0
    }
}

impl AsRef<[u8; 32]> for PermGroupId {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PermGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

/// A writer's standing with respect to one group.
pub enum WriterStatus<P> {
    /// The device may write; its streams track the transport.
    Open,
    /// The device was removed; its streams are admitted only up to the
    /// heads the revoking op pinned.
    Closed {
        /// Final admitted op per stream, captured by the revocation.
        pins: Arc<ContributingHeads<P>>,
        /// When the revocation took effect.
        at: Timestamp,
    },
}

impl<P> Clone for WriterStatus<P> {
    fn clone(&self) -> Self {
        match self {
            WriterStatus::Open => WriterStatus::Open,
            WriterStatus::Closed { pins, at } => WriterStatus::Closed {
                pins: pins.clone(),
                at: *at,
            },
        }
    }
}

impl<P> std::fmt::Debug for WriterStatus<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            WriterStatus::Open => write!(f, "open"),
            WriterStatus::Closed { at, .. } => write!(f, "closed{:?}", at),
        }
    }
}

/// Membership of one writer group within a dynamic group.
pub enum Membership<P> {
    /// The writer group currently contributes its devices.
    Active,
    /// The writer group was removed; its devices are pinned to the heads
    /// the removal captured.
    Removed {
        /// Final admitted op per stream.
        pins: Arc<ContributingHeads<P>>,
        /// Timestamp of the removing op.
        at: Timestamp,
    },
}

impl<P> Clone for Membership<P> {
    fn clone(&self) -> Self {
        match self {
            Membership::Active => Membership::Active,
            Membership::Removed { pins, at } => Membership::Removed {
                pins: pins.clone(),
                at: *at,
            },
        }
    }
}

impl<P> PartialEq for Membership<P> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Membership::Active, Membership::Active) => true,
            (
                Membership::Removed { pins: a, at: x },
                Membership::Removed { pins: b, at: y },
            ) => x == y && a == b,
            _ => false,
        }
    }
}

impl<P> Eq for Membership<P> {}

impl<P> std::fmt::Debug for Membership<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Membership::Active => write!(f, "active"),
            Membership::Removed { at, .. } => write!(f, "removed{:?}", at),
        }
    }
}

struct GroupDef<P> {
    admin: PermGroupId,
    members: BTreeMap<PermGroupId, Membership<P>>,
}

impl<P> Clone for GroupDef<P> {
    fn clone(&self) -> Self {
        Self {
            admin: self.admin,
            members: self.members.clone(),
        }
    }
}

impl<P> PartialEq for GroupDef<P> {
    fn eq(&self, other: &Self) -> bool {
        self.admin == other.admin && self.members == other.members
    }
}

crepe! {
    @input
    struct Edge(PermGroupId, PermGroupId);

    @output
    struct Reaches(PermGroupId, PermGroupId);

    Reaches(x, y) <- Edge(x, y);
    Reaches(x, z) <- Reaches(x, y), Edge(y, z);
}

/// Arena of permission groups, referenced by id.
pub struct Groups<P> {
    statics: BTreeMap<PermGroupId, Arc<BTreeSet<DeviceId>>>,
    dynamics: BTreeMap<PermGroupId, GroupDef<P>>,
}

impl<P> Groups<P> {
    /// An empty arena.
    pub fn new() -> Self {
        Self {
            statics: BTreeMap::new(),
            dynamics: BTreeMap::new(),
        }
    }

    /// Registers a static group and returns its content-addressed id.
    pub fn insert_static(&mut self, members: BTreeSet<DeviceId>) -> PermGroupId {
        let id = PermGroupId::of_static(&members);
        self.statics.insert(id, Arc::new(members));
        id
    }

    /// Registers a dynamic group governed by `admin`, with an initially
    /// empty writer set. The nonce disambiguates sibling groups under the
    /// same admin.
    pub fn insert_dynamic(&mut self, admin: PermGroupId, nonce: u64) -> PermGroupId {
        let id = PermGroupId::derive(admin, nonce);
        self.dynamics.insert(
            id,
            GroupDef {
                admin,
                members: BTreeMap::new(),
            },
        );
        id
    }

    /// Whether the arena knows this id.
    pub fn contains(&self, id: PermGroupId) -> bool {
        self.statics.contains_key(&id) || self.dynamics.contains_key(&id)
    }

    /// The admin of a dynamic group.
    pub fn admin(&self, id: PermGroupId) -> Option<PermGroupId> {
        self.dynamics.get(&id).map(|def| def.admin)
    }

    /// Membership entry of `writer` in dynamic group `group`.
    pub fn membership(&self, group: PermGroupId, writer: PermGroupId) -> Option<&Membership<P>> {
        self.dynamics.get(&group)?.members.get(&writer)
    }

    /// Whether admitting `writer` into `group` would close a cycle in the
    /// governance graph: the group must not be reachable from its would-be
    /// writer over admin and active-member edges.
    pub fn would_cycle(&self, group: PermGroupId, writer: PermGroupId) -> bool {
        if group == writer {
            return true;
        }
        let mut runtime = Crepe::new();
        for (gid, def) in &self.dynamics {
            runtime.extend([Edge(*gid, def.admin)]);
            runtime.extend(
                def.members
                    .iter()
                    .filter(|(_, m)| matches!(m, Membership::Active))
                    .map(|(mid, _)| Edge(*gid, *mid)),
            );
        }
        let (reaches,) = runtime.run();
        reaches.contains(&Reaches(writer, group))
    }

    /// Admits a writer group. Returns false when the ids are unknown or
    /// admitting would close a governance cycle; such ops are no-ops.
    pub fn add_writer(&mut self, group: PermGroupId, writer: PermGroupId) -> bool {
        if !self.contains(writer) || self.would_cycle(group, writer) {
            return false;
        }
        match self.dynamics.get_mut(&group) {
            Some(def) => {
                def.members.insert(writer, Membership::Active);
                true
            }
            None => false,
        }
    }

    /// Removes a writer group, pinning its devices' streams to the heads
    /// the revoking op captured. Returns false when the writer was not a
    /// member.
    pub fn remove_writer(
        &mut self,
        group: PermGroupId,
        writer: PermGroupId,
        pins: Arc<ContributingHeads<P>>,
        at: Timestamp,
    ) -> bool {
        match self.dynamics.get_mut(&group) {
            Some(def) if def.members.contains_key(&writer) => {
                def.members.insert(writer, Membership::Removed { pins, at });
                true
            }
            _ => false,
        }
    }

    /// Whether `device` currently writes for `group`.
    ///
    /// Domains call this from `apply` with the op's authoring device.
    /// Because replay proceeds in ascending timestamp order, the value
    /// state at apply time is the state at the op's timestamp, so this is
    /// the "authorized at the point of the op" check.
    pub fn is_open_writer(&self, group: PermGroupId, device: DeviceId) -> bool {
        matches!(
            self.writer_devices(group).get(&device),
            Some(WriterStatus::Open)
        )
    }

    /// Resolves the devices that may write to objects governed by `group`.
    ///
    /// Static groups open every member. A dynamic group unions its admin's
    /// devices with every active member's; devices reachable only through
    /// removed members come back closed, carrying the removal's pins. Open
    /// beats closed: one authorized path suffices. Among removals the
    /// latest wins per device.
    pub fn writer_devices(&self, group: PermGroupId) -> BTreeMap<DeviceId, WriterStatus<P>> {
        let mut visiting = BTreeSet::new();
        self.resolve_writers(group, &mut visiting)
    }

    fn resolve_writers(
        &self,
        group: PermGroupId,
        visiting: &mut BTreeSet<PermGroupId>,
    ) -> BTreeMap<DeviceId, WriterStatus<P>> {
        if let Some(members) = self.statics.get(&group) {
            return members
                .iter()
                .map(|device| (*device, WriterStatus::Open))
                .collect();
        }
        let def = match self.dynamics.get(&group) {
            Some(def) => def,
            None => return BTreeMap::new(),
        };
        if !visiting.insert(group) {
            // governance cycles cannot be admitted, but an arena assembled
            // from scratch must not recurse forever on one
            return BTreeMap::new();
        }
        let mut out = self.resolve_writers(def.admin, visiting);
        for (writer, membership) in &def.members {
            match membership {
                Membership::Active => {
                    for (device, status) in self.resolve_writers(*writer, visiting) {
                        merge_status(&mut out, device, status);
                    }
                }
                Membership::Removed { pins, at } => {
                    for (device, _) in self.resolve_writers(*writer, visiting) {
                        merge_status(
                            &mut out,
                            device,
                            WriterStatus::Closed {
                                pins: pins.clone(),
                                at: *at,
                            },
                        );
                    }
                }
            }
        }
        visiting.remove(&group);
        out
    }

    /// Adds the streams of one governed object to a desired-heads map: one
    /// stream per resolved writer device, open or pinned per its status. A
    /// closed device whose pins carry no entry for a stream contributes
    /// nothing for it.
    pub fn stream_heads(
        &self,
        group: PermGroupId,
        scope: ObjectId,
        role: StreamRole,
        out: &mut DesiredHeads<P>,
    ) {
        for (device, status) in self.writer_devices(group) {
            let stream = StreamId::new(device, scope, role);
            match status {
                WriterStatus::Open => out.insert_open(stream),
                WriterStatus::Closed { pins, .. } => {
                    if let Some(list) = pins.get(&stream) {
                        out.insert_pinned(stream, list.clone());
                    }
                }
            }
        }
    }

    /// The perm streams of every dynamic group, as governed by its admin.
    pub fn desired_heads(&self) -> DesiredHeads<P> {
        let mut out = DesiredHeads::new();
        for (gid, def) in &self.dynamics {
            self.stream_heads(def.admin, gid.scope(), StreamRole::Perm, &mut out);
        }
        out
    }
}

fn merge_status<P>(
    out: &mut BTreeMap<DeviceId, WriterStatus<P>>,
    device: DeviceId,
    status: WriterStatus<P>,
) {
    let replace = match (out.get(&device), &status) {
        (None, _) => true,
        (Some(WriterStatus::Open), _) => false,
        (Some(WriterStatus::Closed { .. }), WriterStatus::Open) => true,
        (Some(WriterStatus::Closed { at: a, .. }), WriterStatus::Closed { at: b, .. }) => b > a,
    };
    if replace {
        out.insert(device, status);
    }
}

impl<P> Default for Groups<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for Groups<P> {
    fn clone(&self) -> Self {
        Self {
            statics: self.statics.clone(),
            dynamics: self.dynamics.clone(),
        }
    }
}

impl<P> PartialEq for Groups<P> {
    fn eq(&self, other: &Self) -> bool {
        self.statics == other.statics && self.dynamics == other.dynamics
    }
}

impl<P> Eq for Groups<P> {}

impl<P> std::fmt::Debug for Groups<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut m = f.debug_map();
        for (id, members) in &self.statics {
            m.entry(id, &format_args!("static {:?}", members));
        }
        for (id, def) in &self.dynamics {
            m.entry(
                id,
                &format_args!("admin {:?} members {:?}", def.admin, def.members),
            );
        }
        m.finish()
    }
}
