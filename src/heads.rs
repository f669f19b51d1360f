//! The heads algebra: maps from stream keys to the newest ops an op-set
//! is allowed to see, and the single backward step the merge walk is built
//! from.

use crate::error::{ProtocolError, Result};
use crate::id::StreamId;
use crate::op::{Op, OpList};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Streams advanced together by one step of the backward walk. Usually one;
/// more when several streams share a head op identity.
pub type AdvancedStreams = SmallVec<[StreamId; 4]>;

/// Concrete heads: for each stream, the list of ops an op-set sees.
pub struct Heads<P>(BTreeMap<StreamId, OpList<P>>);

impl<P> Heads<P> {
    /// Creates an empty head map.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Sets the visible list for a stream.
    pub fn insert(&mut self, stream: StreamId, list: OpList<P>) {
        self.0.insert(stream, list);
    }

    /// The visible list for a stream.
    pub fn get(&self, stream: &StreamId) -> Option<&OpList<P>> {
        self.0.get(stream)
    }

    /// Iterates over all streams.
    pub fn iter(&self) -> impl Iterator<Item = (&StreamId, &OpList<P>)> {
        self.0.iter()
    }

    /// Number of streams.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no stream is visible.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The newest head op across all streams, together with every stream
    /// whose head is that op.
    ///
    /// This is one step of the backward walk. Two streams may share a head
    /// identity and advance together; two *distinct* head ops sharing a
    /// timestamp cannot be ordered and fail the merge.
    pub fn newest(&self) -> Result<Option<(Arc<Op<P>>, AdvancedStreams)>> {
        let mut best: Option<(Arc<Op<P>>, AdvancedStreams)> = None;
        for (stream, list) in &self.0 {
            let op = list.op();
            best = match best {
                None => Some((op.clone(), SmallVec::from_elem(*stream, 1))),
                Some((top, mut streams)) => {
                    if op.timestamp() > top.timestamp() {
                        Some((op.clone(), SmallVec::from_elem(*stream, 1)))
                    } else if op.timestamp() == top.timestamp() && op.id() != top.id() {
                        return Err(ProtocolError::TimestampCollision {
                            first: top.id(),
                            second: op.id(),
                            at: op.timestamp(),
                        }
                        .into());
                    } else {
                        if op.id() == top.id() {
                            streams.push(*stream);
                        }
                        Some((top, streams))
                    }
                }
            };
        }
        Ok(best)
    }

    /// Removes the head op from each of the given streams, dropping streams
    /// whose list is exhausted. Paired with [`Heads::newest`].
    pub fn retreat(&mut self, streams: &[StreamId]) {
        for stream in streams {
            match self.0.get(stream).and_then(|list| list.prev().cloned()) {
                Some(prev) => {
                    self.0.insert(*stream, prev);
                }
                None => {
                    self.0.remove(stream);
                }
            }
        }
    }
}

impl<P> Default for Heads<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for Heads<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P> PartialEq for Heads<P> {
    fn eq(&self, other: &Self) -> bool {
        // OpList equality is head-identity equality, so this compares
        // domains plus head ops per key.
        self.0 == other.0
    }
}

impl<P> Eq for Heads<P> {}

impl<P> std::fmt::Debug for Heads<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

impl<P> FromIterator<(StreamId, OpList<P>)> for Heads<P> {
    fn from_iter<I: IntoIterator<Item = (StreamId, OpList<P>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One abstract head: track whatever the transport provides, or admit no
/// more than a pinned list.
pub enum Head<P> {
    /// Use the universe's entry for this stream.
    Open,
    /// Use no more than this list.
    Pinned(OpList<P>),
}

impl<P> Clone for Head<P> {
    fn clone(&self) -> Self {
        match self {
            Head::Open => Head::Open,
            Head::Pinned(list) => Head::Pinned(list.clone()),
        }
    }
}

impl<P> PartialEq for Head<P> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Head::Open, Head::Open) => true,
            (Head::Pinned(a), Head::Pinned(b)) => a == b,
            _ => false,
        }
    }
}

impl<P> Eq for Head<P> {}

impl<P> std::fmt::Debug for Head<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Head::Open => write!(f, "open"),
            Head::Pinned(list) => write!(f, "pinned{:?}", list),
        }
    }
}

/// Abstract heads as produced by a policy function: which streams an op-set
/// wants to see, and how far.
pub struct DesiredHeads<P>(BTreeMap<StreamId, Head<P>>);

impl<P> DesiredHeads<P> {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Marks a stream open. Open always wins: a writer authorized through
    /// any group is authorized.
    pub fn insert_open(&mut self, stream: StreamId) {
        self.0.insert(stream, Head::Open);
    }

    /// Pins a stream, unless it is already known open or pinned.
    pub fn insert_pinned(&mut self, stream: StreamId, list: OpList<P>) {
        self.0.entry(stream).or_insert(Head::Pinned(list));
    }

    /// The abstract head for a stream.
    pub fn get(&self, stream: &StreamId) -> Option<&Head<P>> {
        self.0.get(stream)
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&StreamId, &Head<P>)> {
        self.0.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Projects against a universe of available streams: open entries take
    /// the universe's list (or vanish if the universe has none), pinned
    /// entries are kept verbatim.
    pub fn resolve(&self, universe: &Heads<P>) -> Heads<P> {
        let mut out = Heads::new();
        for (stream, head) in &self.0 {
            match head {
                Head::Open => {
                    if let Some(list) = universe.get(stream) {
                        out.insert(*stream, list.clone());
                    }
                }
                Head::Pinned(list) => out.insert(*stream, list.clone()),
            }
        }
        out
    }
}

impl<P> Default for DesiredHeads<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for DesiredHeads<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P> PartialEq for DesiredHeads<P> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<P> Eq for DesiredHeads<P> {}

impl<P> std::fmt::Debug for DesiredHeads<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}
