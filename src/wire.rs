//! Archived representation of op streams.
//!
//! The engine itself performs no I/O; this module is the layout a transport
//! or store uses to carry tree-domain streams between devices. Everything
//! an op is made of survives the trip: identity, timestamp, payload, and
//! for revocations the pinned final op per closed stream. Pins travel as
//! op identities and are resolved against the bundle on decode.

use crate::acl::PermGroupId;
use crate::error::{ProtocolError, Result};
use crate::heads::Heads;
use crate::id::{DeviceId, ObjectId, StreamId, StreamRole};
use crate::op::{ContributingHeads, Op, OpId, OpList, Timestamp};
use crate::tree::{TreeId, TreeOp};
use crate::util::Ref;
use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;

/// A set of streams ready for archival.
#[derive(Archive, Debug, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
pub struct Bundle {
    /// One record per stream.
    pub streams: Vec<StreamRecord>,
}

/// One stream and its ops, oldest first.
#[derive(Archive, Debug, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
pub struct StreamRecord {
    /// Authoring device.
    pub device: [u8; 32],
    /// Object the stream contributes to.
    pub scope: [u8; 32],
    /// Stream role discriminant.
    pub role: u8,
    /// Ops oldest first.
    pub ops: Vec<OpRecord>,
}

/// One archived op.
#[derive(Archive, Debug, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
pub struct OpRecord {
    /// Op identity.
    pub id: [u8; 32],
    /// Merge token.
    pub timestamp: u64,
    /// Domain payload.
    pub payload: PayloadRecord,
    /// Revocation pins, empty for plain ops.
    pub pins: Vec<PinRecord>,
}

/// Archived tree-domain payload.
#[derive(Archive, Debug, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
pub enum PayloadRecord {
    /// A parent assignment.
    SetParent {
        /// Node being moved.
        child: [u8; 32],
        /// Its new parent.
        parent: [u8; 32],
    },
    /// A writer admission.
    AddWriter {
        /// Group gaining a writer.
        group: [u8; 32],
        /// Admitted writer group.
        writer: [u8; 32],
    },
    /// A writer removal.
    RemoveWriter {
        /// Group losing a writer.
        group: [u8; 32],
        /// Removed writer group.
        writer: [u8; 32],
    },
}

/// One pinned stream of a revocation: the final admitted op by identity.
#[derive(Archive, Debug, Deserialize, Serialize)]
#[archive_attr(derive(CheckBytes))]
pub struct PinRecord {
    /// Pinned stream's device.
    pub device: [u8; 32],
    /// Pinned stream's scope.
    pub scope: [u8; 32],
    /// Pinned stream's role discriminant.
    pub role: u8,
    /// Identity of the final admitted op.
    pub head: [u8; 32],
}

fn payload_record(op: &TreeOp) -> PayloadRecord {
    match op {
        TreeOp::SetParent { child, parent } => PayloadRecord::SetParent {
            child: (*child).into(),
            parent: (*parent).into(),
        },
        TreeOp::AddWriter { group, writer } => PayloadRecord::AddWriter {
            group: (*group).into(),
            writer: (*writer).into(),
        },
        TreeOp::RemoveWriter { group, writer } => PayloadRecord::RemoveWriter {
            group: (*group).into(),
            writer: (*writer).into(),
        },
    }
}

fn payload_from(record: &PayloadRecord) -> TreeOp {
    match record {
        PayloadRecord::SetParent { child, parent } => TreeOp::SetParent {
            child: TreeId::new(*child),
            parent: TreeId::new(*parent),
        },
        PayloadRecord::AddWriter { group, writer } => TreeOp::AddWriter {
            group: PermGroupId::new(*group),
            writer: PermGroupId::new(*writer),
        },
        PayloadRecord::RemoveWriter { group, writer } => TreeOp::RemoveWriter {
            group: PermGroupId::new(*group),
            writer: PermGroupId::new(*writer),
        },
    }
}

fn stream_id(device: &[u8; 32], scope: &[u8; 32], role: u8) -> Result<StreamId> {
    let role = StreamRole::from_u8(role).ok_or(ProtocolError::UnknownRole(role))?;
    Ok(StreamId::new(
        DeviceId::new(*device),
        ObjectId::new(*scope),
        role,
    ))
}

impl Bundle {
    /// Captures a head map into archivable records.
    pub fn from_heads(heads: &Heads<TreeOp>) -> Self {
        let mut streams = Vec::with_capacity(heads.len());
        for (stream, list) in heads.iter() {
            let mut ops: Vec<_> = list.iter().map(|op| op_record(op)).collect();
            ops.reverse();
            streams.push(StreamRecord {
                device: (*stream.device().as_ref()),
                scope: (*stream.scope().as_ref()),
                role: stream.role().as_u8(),
                ops,
            });
        }
        Self { streams }
    }

    /// Archives the bundle.
    pub fn archive(&self) -> Ref<Bundle> {
        Ref::archive(self)
    }

    /// Validates and deserializes an archived bundle.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let archived = rkyv::check_archived_root::<Bundle>(bytes)
            .map_err(|_| ProtocolError::InvalidArchive)?;
        // the Infallible deserializer cannot fail
        Ok(archived.deserialize(&mut rkyv::Infallible).unwrap())
    }

    /// Rebuilds the head map.
    ///
    /// Ops are reconstructed across streams in ascending timestamp order so
    /// every pin target exists by the time its revocation is built; a pin
    /// naming an op outside the bundle cannot be honored and fails the
    /// decode.
    pub fn to_heads(&self) -> Result<Heads<TreeOp>> {
        let mut flat = Vec::new();
        for record in &self.streams {
            let stream = stream_id(&record.device, &record.scope, record.role)?;
            for op in &record.ops {
                flat.push((stream, op));
            }
        }
        flat.sort_by_key(|(_, op)| op.timestamp);
        for pair in flat.windows(2) {
            let (_, a) = pair[0];
            let (_, b) = pair[1];
            if a.timestamp == b.timestamp && a.id != b.id {
                return Err(ProtocolError::TimestampCollision {
                    first: OpId::new(a.id),
                    second: OpId::new(b.id),
                    at: Timestamp::new(a.timestamp),
                }
                .into());
            }
        }

        let mut lists: BTreeMap<StreamId, OpList<TreeOp>> = BTreeMap::new();
        let mut by_id: BTreeMap<OpId, OpList<TreeOp>> = BTreeMap::new();
        for (stream, record) in flat {
            let mut pins: ContributingHeads<TreeOp> = BTreeMap::new();
            for pin in &record.pins {
                let pinned = stream_id(&pin.device, &pin.scope, pin.role)?;
                let head = OpId::new(pin.head);
                let list = by_id.get(&head).cloned().ok_or(ProtocolError::DanglingPin {
                    op: OpId::new(record.id),
                    head,
                })?;
                pins.insert(pinned, list);
            }
            let op = Op::from_parts(
                OpId::new(record.id),
                Timestamp::new(record.timestamp),
                payload_from(&record.payload),
                pins,
            );
            let list = match lists.get(&stream) {
                Some(list) => list.append(op)?,
                None => OpList::new(op),
            };
            by_id.insert(list.op().id(), list.clone());
            lists.insert(stream, list);
        }

        Ok(lists.into_iter().collect())
    }
}

fn op_record(op: &Op<TreeOp>) -> OpRecord {
    let pins = op
        .contributing()
        .iter()
        .map(|(stream, list)| PinRecord {
            device: (*stream.device().as_ref()),
            scope: (*stream.scope().as_ref()),
            role: stream.role().as_u8(),
            head: list.op().id().into(),
        })
        .collect();
    OpRecord {
        id: op.id().into(),
        timestamp: op.timestamp().ticks(),
        payload: payload_record(op.payload()),
        pins,
    }
}
