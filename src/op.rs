use crate::error::{ProtocolError, Result};
use crate::id::StreamId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opaque totally ordered merge token.
///
/// Timestamps decide the order in which ops from different streams are
/// applied. The engine never interprets them as wall-clock time; callers
/// feeding real clocks should pack a hybrid `(time, device, counter)`
/// value so two devices can never mint the same token for different ops.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Wraps a raw tick count.
    pub const fn new(ticks: u64) -> Self {
        Self(ticks)
    }

    /// The raw tick count.
    pub fn ticks(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Identity of an op, assigned once at construction.
///
/// The engine compares ops by identity only; structural comparison of long
/// histories would be prohibitive and is never needed because an op object
/// is constructed exactly once and shared.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct OpId([u8; 32]);

impl OpId {
    /// Creates an op id from raw bytes.
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }

    /// Mints a fresh random op id.
    pub fn random() -> Self {
        let mut id = [0; 32];
        getrandom::getrandom(&mut id).unwrap();
        Self(id)
    }
}

impl From<OpId> for [u8; 32] {
    fn from(id: OpId) -> Self {
        id.0
    }
}

impl AsRef<[u8; 32]> for OpId {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..4]))
    }
}

/// Pins carried by a revocation op: for each stream being closed, the list
/// ending at the final op the revoker still admits.
pub type ContributingHeads<P> = BTreeMap<StreamId, OpList<P>>;

/// One immutable operation.
///
/// Ops are shared via [`Arc`] across every snapshot that applied them. The
/// payload type `P` is supplied by the domain; the engine only looks at
/// identity and timestamp.
pub struct Op<P> {
    id: OpId,
    timestamp: Timestamp,
    payload: P,
    contributing: ContributingHeads<P>,
}

impl<P> Op<P> {
    /// Creates a plain op with a fresh identity.
    pub fn new(timestamp: Timestamp, payload: P) -> Arc<Self> {
        Self::from_parts(OpId::random(), timestamp, payload, BTreeMap::new())
    }

    /// Creates a revocation op carrying pinned heads.
    pub fn revoking(
        timestamp: Timestamp,
        payload: P,
        contributing: ContributingHeads<P>,
    ) -> Arc<Self> {
        Self::from_parts(OpId::random(), timestamp, payload, contributing)
    }

    /// Creates an op with an explicit identity. Used by stream decoders
    /// which must preserve identities across the wire.
    pub fn from_parts(
        id: OpId,
        timestamp: Timestamp,
        payload: P,
        contributing: ContributingHeads<P>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            timestamp,
            payload,
            contributing,
        })
    }

    /// The op's identity.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// The op's merge token.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// The domain payload.
    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// The pinned heads, empty unless this is a revocation.
    pub fn contributing(&self) -> &ContributingHeads<P> {
        &self.contributing
    }
}

impl<P> PartialEq for Op<P> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<P> Eq for Op<P> {}

impl<P> std::fmt::Debug for Op<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}{:?}", self.id, self.timestamp)
    }
}

/// Non-empty immutable list of ops for one stream, newest at head.
///
/// Tails are shared: appending never copies, and two lists that fork from a
/// common history share it structurally. Two lists are equal iff their head
/// op identities are equal; global uniqueness of ops makes deep comparison
/// unnecessary.
pub struct OpList<P> {
    head: Arc<OpNode<P>>,
}

struct OpNode<P> {
    op: Arc<Op<P>>,
    prev: Option<OpList<P>>,
}

impl<P> OpList<P> {
    /// Starts a stream with its first op.
    pub fn new(op: Arc<Op<P>>) -> Self {
        Self {
            head: Arc::new(OpNode { op, prev: None }),
        }
    }

    /// Appends an op. The op must be newer than the current head; the list
    /// position is the predecessor reference, so a stale append means the
    /// author did not build on the stream head it published.
    pub fn append(&self, op: Arc<Op<P>>) -> Result<Self> {
        let head = self.op();
        if op.timestamp() <= head.timestamp() {
            return Err(ProtocolError::StaleAppend {
                op: op.id(),
                at: op.timestamp(),
                head: head.id(),
                head_at: head.timestamp(),
            }
            .into());
        }
        Ok(Self {
            head: Arc::new(OpNode {
                op,
                prev: Some(self.clone()),
            }),
        })
    }

    /// The newest op.
    pub fn op(&self) -> &Arc<Op<P>> {
        &self.head.op
    }

    /// The list without its newest op, if any ops remain.
    pub fn prev(&self) -> Option<&OpList<P>> {
        self.head.prev.as_ref()
    }

    /// Ops newest to oldest.
    pub fn iter(&self) -> OpIter<'_, P> {
        OpIter(Some(self))
    }

    /// Number of ops in the list.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Always false; lists are non-empty by construction.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether the list contains an op with the given identity.
    pub fn contains(&self, id: OpId) -> bool {
        self.iter().any(|op| op.id() == id)
    }

    /// The sub-list ending at the given op, used to capture revocation
    /// pins from an observed stream.
    pub fn truncate(&self, id: OpId) -> Option<OpList<P>> {
        let mut cur = Some(self);
        while let Some(list) = cur {
            if list.op().id() == id {
                return Some(list.clone());
            }
            cur = list.prev();
        }
        None
    }
}

impl<P> Clone for OpList<P> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
        }
    }
}

impl<P> PartialEq for OpList<P> {
    fn eq(&self, other: &Self) -> bool {
        self.op().id() == other.op().id()
    }
}

impl<P> Eq for OpList<P> {}

impl<P> std::fmt::Debug for OpList<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over a stream's ops, newest to oldest.
pub struct OpIter<'a, P>(Option<&'a OpList<P>>);

impl<'a, P> Iterator for OpIter<'a, P> {
    type Item = &'a Arc<Op<P>>;

    fn next(&mut self) -> Option<Self::Item> {
        let list = self.0.take()?;
        self.0 = list.prev();
        Some(list.op())
    }
}
