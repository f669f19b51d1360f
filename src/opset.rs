//! The controlled op-set: a do/undo engine that keeps a materialized value,
//! the heads it was computed from, and a journal of applied ops, and that
//! merges remote heads through a fix-point over the value's own policy.

use crate::error::{InternalError, ProtocolError, Result};
use crate::heads::{AdvancedStreams, DesiredHeads, Heads};
use crate::id::StreamId;
use crate::op::{Op, OpId};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A value that can be materialized from ops with explicit per-op undo.
///
/// `apply` and `unapply` must be deterministic and pure, and `unapply` must
/// be the left inverse of `apply` at the state it is called on. An apply
/// that rejects an op for a domain reason (a cycle, an unknown target)
/// returns the value unchanged together with an undo that does nothing;
/// the op is still journaled so later undo stays well defined.
pub trait Materialize: Clone {
    /// Domain payload carried by ops.
    type Payload: Clone;
    /// Captured by `apply`, consumed by `unapply`.
    type Undo;

    /// Applies an op, returning the next value and the undo capture.
    /// `streams` names every stream the op was admitted on.
    fn apply(&self, op: &Op<Self::Payload>, streams: &[StreamId]) -> (Self, Self::Undo);

    /// Reverts the newest applied op. Must not fail: it replays a capture
    /// made by `apply` at exactly this state.
    fn unapply(&self, op: &Op<Self::Payload>, undo: &Self::Undo) -> Self;

    /// The streams this value wants to see, derived from the value itself.
    /// Must be stable under repeated calls on an unchanged value.
    fn desired_heads(&self) -> DesiredHeads<Self::Payload>;
}

/// A value materialized by pure replay, without hand-written inverses.
/// Wrap it in [`Persistent`] to obtain a [`Materialize`] whose undo is the
/// whole prior snapshot.
pub trait Replay: Clone {
    /// Domain payload carried by ops.
    type Payload: Clone;

    /// Applies an op, returning the next value. Rejected ops return the
    /// value unchanged.
    fn replay(&self, op: &Op<Self::Payload>, streams: &[StreamId]) -> Self;

    /// The streams this value wants to see.
    fn desired_heads(&self) -> DesiredHeads<Self::Payload>;
}

/// Whole-snapshot undo: stores the prior value as the undo capture and
/// swaps it back on `unapply`. The practical choice whenever the value is
/// immutable with structural sharing.
///
/// Also memoizes `desired_heads` per snapshot, which the fix-point calls
/// repeatedly; the cache is behind a mutex so snapshots stay freely
/// sharable across threads.
pub struct Persistent<T: Replay> {
    value: T,
    desired: Arc<Mutex<Option<DesiredHeads<T::Payload>>>>,
}

impl<T: Replay> Persistent<T> {
    /// Wraps a replay-only value.
    pub fn new(value: T) -> Self {
        Self {
            value,
            desired: Arc::new(Mutex::new(None)),
        }
    }

    /// The wrapped value.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Unwraps the value.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: Replay> Clone for Persistent<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            desired: self.desired.clone(),
        }
    }
}

impl<T: Replay + std::fmt::Debug> std::fmt::Debug for Persistent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

impl<T: Replay + PartialEq> PartialEq for Persistent<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: Replay + Eq> Eq for Persistent<T> {}

impl<T: Replay> std::ops::Deref for Persistent<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Replay> Materialize for Persistent<T> {
    type Payload = T::Payload;
    type Undo = T;

    fn apply(&self, op: &Op<T::Payload>, streams: &[StreamId]) -> (Self, T) {
        let prior = self.value.clone();
        (Self::new(self.value.replay(op, streams)), prior)
    }

    fn unapply(&self, _op: &Op<T::Payload>, undo: &T) -> Self {
        Self::new(undo.clone())
    }

    fn desired_heads(&self) -> DesiredHeads<T::Payload> {
        let mut cached = self.desired.lock();
        cached
            .get_or_insert_with(|| self.value.desired_heads())
            .clone()
    }
}

struct JournalNode<M: Materialize> {
    op: Arc<Op<M::Payload>>,
    streams: AdvancedStreams,
    undo: M::Undo,
    prev: Journal<M>,
}

/// The applied-op journal: a shared cons list, newest first, strictly
/// decreasing by timestamp.
pub struct Journal<M: Materialize>(Option<Arc<JournalNode<M>>>);

impl<M: Materialize> Journal<M> {
    fn empty() -> Self {
        Self(None)
    }

    fn push(&self, op: Arc<Op<M::Payload>>, streams: AdvancedStreams, undo: M::Undo) -> Self {
        Self(Some(Arc::new(JournalNode {
            op,
            streams,
            undo,
            prev: self.clone(),
        })))
    }

    fn pop(&self) -> Option<(Arc<JournalNode<M>>, Journal<M>)> {
        self.0.as_ref().map(|node| (node.clone(), node.prev.clone()))
    }

    /// The newest applied op.
    pub fn head_op(&self) -> Option<&Arc<Op<M::Payload>>> {
        self.0.as_ref().map(|node| &node.op)
    }

    /// Applied ops with their streams, newest to oldest.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<Op<M::Payload>>, &[StreamId])> {
        let mut cur = self.0.as_deref();
        std::iter::from_fn(move || {
            let node = cur?;
            cur = node.prev.0.as_deref();
            Some((&node.op, node.streams.as_slice()))
        })
    }

    /// Number of journaled ops.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether nothing has been applied.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl<M: Materialize> Clone for Journal<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M: Materialize> PartialEq for Journal<M> {
    fn eq(&self, other: &Self) -> bool {
        self.iter().map(|(op, _)| op.id()).eq(other.iter().map(|(op, _)| op.id()))
    }
}

impl<M: Materialize> Eq for Journal<M> {}

impl<M: Materialize> std::fmt::Debug for Journal<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(self.iter().map(|(op, _)| op)).finish()
    }
}

/// An immutable snapshot of a controlled op-set.
///
/// `update` is a pure function from a snapshot and remote heads to the next
/// snapshot; the caller replaces its reference to publish the result. Two
/// callers holding the same snapshot may update concurrently without
/// coordination and merge later by updating once more with the union of
/// their remotes.
pub struct OpSet<M: Materialize> {
    value: M,
    heads: Heads<M::Payload>,
    journal: Journal<M>,
}

impl<M: Materialize> OpSet<M> {
    /// A snapshot with no ops applied.
    pub fn new(value: M) -> Self {
        Self {
            value,
            heads: Heads::new(),
            journal: Journal::empty(),
        }
    }

    /// The materialized value.
    pub fn value(&self) -> &M {
        &self.value
    }

    /// The heads this value was computed from. This is what a device
    /// publishes to its peers as its authoritative stream heads.
    pub fn heads(&self) -> &Heads<M::Payload> {
        &self.heads
    }

    /// The applied-op journal.
    pub fn journal(&self) -> &Journal<M> {
        &self.journal
    }

    /// Identity of the newest applied op.
    pub fn journal_head(&self) -> Option<OpId> {
        self.journal.head_op().map(|op| op.id())
    }

    /// Merges the given remote heads into a new snapshot.
    ///
    /// The value's desired heads are projected against `remote`, the
    /// applied history is rewound to the common prefix, the missing ops are
    /// replayed in timestamp order, and the projection is re-evaluated
    /// until it agrees with the applied heads. Idempotent: updating twice
    /// with the same remotes returns an equal snapshot.
    pub fn update(&self, remote: &Heads<M::Payload>) -> Result<Self> {
        let mut next = self.clone();
        let mut touched = BTreeSet::new();
        let mut rounds = 0usize;
        loop {
            let desired = next.value.desired_heads().resolve(remote);
            if desired == next.heads {
                return Ok(next);
            }
            // Every genuine round consumes or reveals at least one op, so
            // the round count is bounded by the ops the walks have touched.
            rounds += 1;
            if rounds > touched.len() + 1 {
                return Err(ProtocolError::Divergence { rounds }.into());
            }
            tracing::trace!("merge round {}: {} desired streams", rounds, desired.len());
            next = next.merge(desired, &mut touched)?;
        }
    }

    /// One rewind-and-replay pass from the current heads to `desired`.
    fn merge(&self, desired: Heads<M::Payload>, touched: &mut BTreeSet<OpId>) -> Result<Self> {
        let mut desired_cur = desired.clone();
        let mut actual_cur = self.heads.clone();
        let mut pending: Vec<(Arc<Op<M::Payload>>, AdvancedStreams)> = Vec::new();
        let mut value = self.value.clone();
        let mut journal = self.journal.clone();

        // Peel the globally newest op until the remainders agree; that
        // point is the common prefix.
        while desired_cur != actual_cur {
            let d = desired_cur.newest()?;
            let a = actual_cur.newest()?;
            match (d, a) {
                (None, None) => break,
                (Some((op, streams)), None) => {
                    touched.insert(op.id());
                    desired_cur.retreat(&streams);
                    pending.push((op, streams));
                }
                (None, Some((op, streams))) => {
                    touched.insert(op.id());
                    value = Self::undo_one(&mut journal, &op, value)?;
                    actual_cur.retreat(&streams);
                }
                (Some((dop, dstreams)), Some((aop, astreams))) => {
                    if dop.id() == aop.id() {
                        // Shared op above a divergence: undo it and queue it
                        // for replay so the journal keeps strictly
                        // decreasing timestamps.
                        touched.insert(dop.id());
                        value = Self::undo_one(&mut journal, &aop, value)?;
                        actual_cur.retreat(&astreams);
                        desired_cur.retreat(&dstreams);
                        pending.push((dop, dstreams));
                    } else if dop.timestamp() == aop.timestamp() {
                        return Err(ProtocolError::TimestampCollision {
                            first: dop.id(),
                            second: aop.id(),
                            at: dop.timestamp(),
                        }
                        .into());
                    } else if dop.timestamp() > aop.timestamp() {
                        touched.insert(dop.id());
                        desired_cur.retreat(&dstreams);
                        pending.push((dop, dstreams));
                    } else {
                        touched.insert(aop.id());
                        value = Self::undo_one(&mut journal, &aop, value)?;
                        actual_cur.retreat(&astreams);
                    }
                }
            }
        }

        // Replay in ascending timestamp order.
        for (op, streams) in pending.into_iter().rev() {
            let (next, undo) = value.apply(&op, &streams);
            journal = journal.push(op, streams, undo);
            value = next;
        }

        Ok(Self {
            value,
            heads: desired,
            journal,
        })
    }

    fn undo_one(journal: &mut Journal<M>, op: &Arc<Op<M::Payload>>, value: M) -> Result<M> {
        let (entry, rest) = journal.pop().ok_or(InternalError::JournalUnderflow {
            op: op.id(),
        })?;
        if entry.op.id() != op.id() {
            return Err(InternalError::JournalSkew {
                expected: op.id(),
                found: entry.op.id(),
            }
            .into());
        }
        let prior = value.unapply(&entry.op, &entry.undo);
        *journal = rest;
        Ok(prior)
    }
}

impl<M: Materialize> Clone for OpSet<M> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            heads: self.heads.clone(),
            journal: self.journal.clone(),
        }
    }
}

impl<M: Materialize + PartialEq> PartialEq for OpSet<M> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value && self.heads == other.heads && self.journal == other.journal
    }
}

impl<M: Materialize + Eq> Eq for OpSet<M> {}

impl<M: Materialize + std::fmt::Debug> std::fmt::Debug for OpSet<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("OpSet")
            .field("value", &self.value)
            .field("heads", &self.heads)
            .field("journal", &self.journal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::op::{OpList, Timestamp};
    use crate::props::{arb_history, value_stream, TokenLog, TokenOp};
    use anyhow::Result;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    fn log(streams: &[StreamId]) -> TokenLog {
        TokenLog {
            streams: streams.iter().copied().collect(),
            tokens: vec![],
        }
    }

    fn note(ts: u64, token: &str) -> Arc<Op<TokenOp>> {
        Op::new(Timestamp::new(ts), TokenOp::Note(token.into()))
    }

    #[test]
    fn test_single_writer_append() -> Result<()> {
        let sa = value_stream(1);
        let sb = value_stream(2);
        let a0 = note(0, "a0");
        let a1 = note(10, "a1");
        let list = OpList::new(a0).append(a1.clone())?;

        let mut remote = Heads::new();
        remote.insert(sa, list.clone());

        let set = OpSet::new(log(&[sa, sb]));
        let set = set.update(&remote)?;
        assert_eq!(set.value().tokens, ["a0", "a1"]);
        assert_eq!(set.heads().get(&sa), Some(&list));
        assert_eq!(set.journal_head(), Some(a1.id()));
        Ok(())
    }

    #[test]
    fn test_reveal_undoes_and_replays() -> Result<()> {
        let sa = value_stream(1);
        let sb = value_stream(2);
        let a0 = note(0, "a0");
        let a_mid = note(5, "a_mid");
        let a1 = note(10, "a1");
        let b0 = note(20, "b0");

        let a_full = OpList::new(a0.clone())
            .append(a_mid.clone())?
            .append(a1.clone())?;
        let b_list = OpList::new(b0.clone());

        // the transport first shows a's stream truncated at a0
        let mut partial = Heads::new();
        partial.insert(sa, OpList::new(a0));
        partial.insert(sb, b_list.clone());

        let set = OpSet::new(log(&[sa, sb])).update(&partial)?;
        assert_eq!(set.value().tokens, ["a0", "b0"]);

        // the rest of a's stream arrives: b0 is undone, a_mid and a1 are
        // applied, b0 is replayed
        let mut full = Heads::new();
        full.insert(sa, a_full);
        full.insert(sb, b_list);

        let set = set.update(&full)?;
        assert_eq!(set.value().tokens, ["a0", "a_mid", "a1", "b0"]);

        // journal is newest first with strictly decreasing timestamps
        let stamps: Vec<_> = set
            .journal()
            .iter()
            .map(|(op, _)| op.timestamp().ticks())
            .collect();
        assert_eq!(stamps, vec![20, 10, 5, 0]);
        Ok(())
    }

    #[test]
    fn test_update_is_idempotent() -> Result<()> {
        let sa = value_stream(1);
        let sb = value_stream(2);
        let mut remote = Heads::new();
        remote.insert(sa, OpList::new(note(0, "a0")).append(note(10, "a1"))?);
        remote.insert(sb, OpList::new(note(5, "b0")));

        let once = OpSet::new(log(&[sa, sb])).update(&remote)?;
        let twice = once.update(&remote)?;
        assert_eq!(once, twice);
        Ok(())
    }

    #[test]
    fn test_heads_journal_agreement() -> Result<()> {
        let sa = value_stream(1);
        let sb = value_stream(2);
        let mut remote = Heads::new();
        remote.insert(sa, OpList::new(note(0, "a0")).append(note(10, "a1"))?);
        remote.insert(sb, OpList::new(note(5, "b0")));

        let set = OpSet::new(log(&[sa, sb])).update(&remote)?;

        // per-stream newest op derived from the journal matches the heads
        let mut derived: BTreeMap<StreamId, crate::OpId> = BTreeMap::new();
        for (op, streams) in set.journal().iter() {
            for stream in streams {
                derived.entry(*stream).or_insert_with(|| op.id());
            }
        }
        assert_eq!(derived.len(), set.heads().len());
        for (stream, list) in set.heads().iter() {
            assert_eq!(derived.get(stream), Some(&list.op().id()));
            // and every op visible in the heads was journaled
            let journaled: BTreeSet<_> = set.journal().iter().map(|(op, _)| op.id()).collect();
            for op in list.iter() {
                assert!(journaled.contains(&op.id()));
            }
        }
        Ok(())
    }

    #[test]
    fn test_timestamp_tie_is_fatal() {
        let sa = value_stream(1);
        let sb = value_stream(2);
        let mut remote = Heads::new();
        remote.insert(sa, OpList::new(note(3, "a")));
        remote.insert(sb, OpList::new(note(3, "b")));

        let err = OpSet::new(log(&[sa, sb])).update(&remote).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::TimestampCollision { .. })
        ));
    }

    #[test]
    fn test_rejected_op_is_journaled() -> Result<()> {
        let sa = value_stream(1);
        let sb = value_stream(2);
        let sc = value_stream(3);
        let rejected = Op::new(Timestamp::new(10), TokenOp::Reject);
        let a_list = OpList::new(note(0, "a0")).append(rejected)?;
        let b_list = OpList::new(note(20, "b0"));

        let mut remote = Heads::new();
        remote.insert(sa, a_list.clone());
        remote.insert(sb, b_list.clone());

        let set = OpSet::new(log(&[sa, sb, sc])).update(&remote)?;
        assert_eq!(set.value().tokens, ["a0", "b0"]);
        assert_eq!(set.journal().len(), 3);

        // rewinding across the journaled no-op must stay consistent:
        // revealing c0 rewinds b0 and the rejected op and replays them
        let mut full = Heads::new();
        full.insert(sa, a_list);
        full.insert(sb, b_list);
        full.insert(sc, OpList::new(note(5, "c0")));

        let set = set.update(&full)?;
        assert_eq!(set.value().tokens, ["a0", "c0", "b0"]);
        assert_eq!(set.journal().len(), 4);
        Ok(())
    }

    #[test]
    fn test_empty_update_is_noop() -> Result<()> {
        let set = OpSet::new(log(&[value_stream(1)]));
        let next = set.update(&Heads::new())?;
        assert_eq!(set, next);
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_incremental_delivery_converges(h in arb_history()) {
            let log = TokenLog {
                streams: h.streams.iter().copied().collect(),
                tokens: vec![],
            };
            let direct = OpSet::new(log.clone()).update(&h.full).unwrap();
            let staged = OpSet::new(log)
                .update(&h.partial)
                .unwrap()
                .update(&h.full)
                .unwrap();
            prop_assert_eq!(direct.value(), staged.value());
            prop_assert_eq!(direct.heads(), staged.heads());
        }

        #[test]
        fn prop_update_is_idempotent(h in arb_history()) {
            let log = TokenLog {
                streams: h.streams.iter().copied().collect(),
                tokens: vec![],
            };
            let once = OpSet::new(log).update(&h.full).unwrap();
            let twice = once.update(&h.full).unwrap();
            prop_assert_eq!(&once, &twice);
        }

        #[test]
        fn prop_journal_agrees_with_heads(h in arb_history()) {
            let log = TokenLog {
                streams: h.streams.iter().copied().collect(),
                tokens: vec![],
            };
            let set = OpSet::new(log).update(&h.full).unwrap();
            prop_assert_eq!(set.journal().len(), h.ops);

            // strictly decreasing timestamps, newest first
            let stamps: Vec<_> = set
                .journal()
                .iter()
                .map(|(op, _)| op.timestamp())
                .collect();
            prop_assert!(stamps.windows(2).all(|w| w[0] > w[1]));

            // newest journaled op per stream is the published head
            let mut derived: BTreeMap<StreamId, crate::OpId> = BTreeMap::new();
            for (op, streams) in set.journal().iter() {
                for stream in streams {
                    derived.entry(*stream).or_insert_with(|| op.id());
                }
            }
            for (stream, list) in set.heads().iter() {
                prop_assert_eq!(derived.get(stream), Some(&list.op().id()));
            }
        }
    }
}
