//! # A local-first permissioned-tree merge engine
//!
//! ## Streams and ops
//! Every device appends ops to its own streams. A stream is keyed by
//! `(device, object, role)`: one author, one object, one concern. A tree
//! node's parent assignments and a permission group's membership changes
//! are different streams even when the same device writes both. Streams
//! are append-only cons lists with the newest op at the head; a list's
//! position *is* the predecessor reference, and op identity is assigned
//! once at construction so comparing heads never walks histories.
//!
//! Ops carry wall-clock timestamps used only as opaque totally ordered
//! merge tokens. Two distinct ops may never share a timestamp; a tie is a
//! transport defect and fails the merge rather than being broken
//! arbitrarily, because any arbitrary break would diverge between peers
//! that saw the ops in different orders.
//!
//! ## The controlled op-set
//! The core of the crate is [`OpSet`]: a materialized value, the stream
//! heads it was computed from, and a journal of applied ops with undo
//! captures. [`OpSet::update`] takes whatever heads the transport
//! currently offers and produces the next snapshot:
//!
//! 1. the value is asked which streams it *wants*: its desired heads,
//!    each either open (track the transport) or pinned (admit no more than
//!    a named op);
//! 2. the desire is projected against the offered heads;
//! 3. the applied history is rewound to the common prefix and the missing
//!    ops are replayed in timestamp order through the domain's `apply`;
//! 4. because applying ops can change the value's desire (admitting a
//!    writer reveals streams, removing one conceals them), the projection
//!    is re-evaluated and the merge repeats until desire and reality
//!    agree.
//!
//! Every value is immutable with structural sharing, so `update` is a pure
//! function: snapshots can be held, compared, and handed across threads
//! freely, and merging is idempotent and insensitive to delivery order.
//!
//! ## Write permission
//! Objects reference permission groups by id; a [`Groups`] arena resolves
//! ids to values at materialization time, which keeps the representation
//! acyclic even though a group may govern the object that describes it. A
//! static group is a fixed device set. A dynamic group is materialized
//! from add-writer and remove-writer ops on its own perm streams, which
//! are in turn governed by the group's admin, all inside the same op-set.
//! That recursion is what the fix-point above is for.
//!
//! Removing a writer is retroactive. The removal op pins, per stream of
//! the removed devices, the final op the admin still admits; everything
//! after the pin is undone as if it had never been delivered. A removed
//! device that is admitted again resumes from its published head; the ops
//! it authored while unauthorized were never part of any admitted chain
//! and stay excluded. Replay order makes the admission check
//! time-consistent: ops apply in ascending timestamp order, so an op
//! authored before its author became a writer sees a value in which the
//! author is not yet a writer, and is journaled as a no-op.
//!
//! ## The tree
//! [`Forest`] materializes the nested permissioned tree on top of the
//! engine: set-parent ops move registered nodes, writer ops edit the
//! governing groups. Parent cycles are refused at apply time against the
//! already-materialized tree; governance cycles are refused by a datalog
//! closure over admin and member edges. A subtree whose root was moved
//! away drops out of the root-connected view but stays addressable by id.
//!
//! ## What this crate is not
//! Transport, storage, clock synchronization, and authentication live
//! elsewhere. The engine never performs I/O; [`Bundle`] only defines the
//! archived layout a transport or store would use to carry streams.
#![warn(missing_docs)]
mod acl;
mod error;
mod heads;
mod id;
mod op;
mod opset;
#[cfg(test)]
mod props;
mod tree;
mod util;
mod wire;

pub use crate::acl::{Groups, Membership, PermGroupId, WriterStatus};
pub use crate::error::{Error, InternalError, ProtocolError, Result};
pub use crate::heads::{AdvancedStreams, DesiredHeads, Head, Heads};
pub use crate::id::{DeviceId, ObjectId, StreamId, StreamRole};
pub use crate::op::{ContributingHeads, Op, OpId, OpIter, OpList, Timestamp};
pub use crate::opset::{Journal, Materialize, OpSet, Persistent, Replay};
pub use crate::tree::{Forest, Node, TreeId, TreeOp};
pub use crate::util::Ref;
pub use crate::wire::{Bundle, OpRecord, PayloadRecord, PinRecord, StreamRecord};
