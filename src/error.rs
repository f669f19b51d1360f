use crate::op::{OpId, Timestamp};
use thiserror::Error;

/// Failures surfaced by a merge.
///
/// A failing [`update`](crate::OpSet::update) yields no new snapshot; the
/// prior snapshot stays intact and the caller may retry with corrected
/// inputs. Domain-level rejections (cycles, duplicate grants) are not
/// errors: they are absorbed as journaled no-ops.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum Error {
    /// A caller or the transport broke an invariant it was required to
    /// honor.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    /// An engine invariant broke. This is a bug, not bad input.
    #[error("internal invariant broken: {0}")]
    Internal(#[from] InternalError),
}

/// Invariant violations attributable to callers or the transport.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ProtocolError {
    /// Two distinct ops carry the same timestamp. Timestamps totally order
    /// ops during merge; a tie between different identities cannot be
    /// broken.
    #[error("ops {first} and {second} are distinct but share timestamp {at}")]
    TimestampCollision {
        /// One of the colliding ops.
        first: OpId,
        /// The other colliding op.
        second: OpId,
        /// The shared timestamp.
        at: Timestamp,
    },
    /// An append does not extend the head of its stream.
    #[error("op {op} at {at} does not extend stream head {head} at {head_at}")]
    StaleAppend {
        /// The op being appended.
        op: OpId,
        /// Its timestamp.
        at: Timestamp,
        /// The current stream head.
        head: OpId,
        /// The head's timestamp.
        head_at: Timestamp,
    },
    /// The merge fix-point failed to converge within its round cap. Either
    /// the transport delivered inconsistent streams or the policy function
    /// oscillates.
    #[error("merge exceeded {rounds} rounds without converging")]
    Divergence {
        /// Rounds executed before giving up.
        rounds: usize,
    },
    /// A revocation pin names an op that is not part of the delivered
    /// streams.
    #[error("op {op} pins head {head} which is not in the bundle")]
    DanglingPin {
        /// The revoking op.
        op: OpId,
        /// The missing pinned head.
        head: OpId,
    },
    /// An archived bundle failed structural validation.
    #[error("archived bundle failed validation")]
    InvalidArchive,
    /// An archived stream carries a role byte outside the known set.
    #[error("unknown stream role {0}")]
    UnknownRole(u8),
}

/// Invariant violations inside the engine itself.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum InternalError {
    /// An undo was required but the journal is empty.
    #[error("journal is empty while undoing {op}")]
    JournalUnderflow {
        /// The op that was to be undone.
        op: OpId,
    },
    /// The journal head is not the op the walk decided to undo.
    #[error("journal head {found} does not match undo target {expected}")]
    JournalSkew {
        /// The op the walk peeled.
        expected: OpId,
        /// The op actually on top of the journal.
        found: OpId,
    },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
