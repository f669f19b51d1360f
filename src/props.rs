//! Proptest strategies and shared fixtures for the engine tests.

use crate::heads::{DesiredHeads, Heads};
use crate::id::{DeviceId, ObjectId, StreamId, StreamRole};
use crate::op::{Op, OpList, Timestamp};
use crate::opset::Materialize;
use proptest::prelude::*;
use std::collections::BTreeSet;

/// The value stream of one numbered device over the shared test scope.
pub fn value_stream(device: u8) -> StreamId {
    StreamId::new(
        DeviceId::new([device; 32]),
        ObjectId::new([0; 32]),
        StreamRole::Value,
    )
}

/// Token-log domain: a fixed set of open streams and the tokens applied so
/// far, with hand-written per-op undo.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenLog {
    /// Streams the log admits.
    pub streams: BTreeSet<StreamId>,
    /// Tokens in application order.
    pub tokens: Vec<String>,
}

/// Ops of the token-log domain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenOp {
    /// Appends a token.
    Note(String),
    /// Applies as a journaled no-op, like a domain-level rejection.
    Reject,
}

impl Materialize for TokenLog {
    type Payload = TokenOp;
    type Undo = bool;

    fn apply(&self, op: &Op<TokenOp>, _streams: &[StreamId]) -> (Self, bool) {
        match op.payload() {
            TokenOp::Note(token) => {
                let mut next = self.clone();
                next.tokens.push(token.clone());
                (next, true)
            }
            TokenOp::Reject => (self.clone(), false),
        }
    }

    fn unapply(&self, _op: &Op<TokenOp>, undo: &bool) -> Self {
        let mut prior = self.clone();
        if *undo {
            prior.tokens.pop();
        }
        prior
    }

    fn desired_heads(&self) -> DesiredHeads<TokenOp> {
        let mut out = DesiredHeads::new();
        for stream in &self.streams {
            out.insert_open(*stream);
        }
        out
    }
}

/// A randomized multi-stream history plus a truncated delivery of it.
#[derive(Debug)]
pub struct History {
    /// Every stream of the history.
    pub streams: Vec<StreamId>,
    /// The complete delivery.
    pub full: Heads<TokenOp>,
    /// A per-stream prefix of the complete delivery.
    pub partial: Heads<TokenOp>,
    /// Total op count across streams.
    pub ops: usize,
}

const MAX_DEVICES: u64 = 8;

fn build_history(counts: Vec<usize>, cuts: Vec<usize>) -> History {
    let mut streams = Vec::new();
    let mut full = Heads::new();
    let mut partial = Heads::new();
    let mut ops = 0;
    for (device, (&count, &cut)) in counts.iter().zip(cuts.iter()).enumerate() {
        let stream = value_stream(device as u8 + 1);
        streams.push(stream);
        let mut list: Option<OpList<TokenOp>> = None;
        for index in 0..count {
            // globally unique, per-stream ascending
            let ticks = (index as u64 * MAX_DEVICES + device as u64) * 10;
            let op = Op::new(
                Timestamp::new(ticks),
                TokenOp::Note(format!("d{}o{}", device, index)),
            );
            list = Some(match list {
                Some(list) => list.append(op).expect("ascending by construction"),
                None => OpList::new(op),
            });
            ops += 1;
            if index + 1 == cut {
                partial.insert(stream, list.clone().expect("just built"));
            }
        }
        if let Some(list) = list {
            full.insert(stream, list);
        }
    }
    History {
        streams,
        full,
        partial,
        ops,
    }
}

prop_compose! {
    /// Up to four devices, each with a chain of notes and a delivery cut.
    pub fn arb_history()
        (counts in prop::collection::vec(0usize..6, 1..4))
        (cuts in counts.iter().map(|c| 0..=*c).collect::<Vec<_>>(), counts in Just(counts))
        -> History
    {
        build_history(counts, cuts)
    }
}
