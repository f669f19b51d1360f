use std::str::FromStr;

/// Identifies the author of a stream of ops. A device is one replica; a
/// user with two laptops is two devices.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct DeviceId([u8; 32]);

impl DeviceId {
    /// Creates a device id from raw bytes.
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }

    /// Mints a fresh random device id.
    pub fn generate() -> Self {
        let mut id = [0; 32];
        getrandom::getrandom(&mut id).unwrap();
        Self(id)
    }
}

impl From<DeviceId> for [u8; 32] {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl AsRef<[u8; 32]> for DeviceId {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut id = [0; 44];
        base64::encode_config_slice(&self.0, base64::URL_SAFE, &mut id);
        write!(f, "{}", std::str::from_utf8(&id).expect("valid utf8"))
    }
}

impl FromStr for DeviceId {
    type Err = base64::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 44 {
            return Err(base64::DecodeError::InvalidLength);
        }
        let mut id = [0; 32];
        base64::decode_config_slice(s, base64::URL_SAFE, &mut id)?;
        Ok(Self(id))
    }
}

/// Identifies the object a stream contributes to: a tree node or a dynamic
/// permission group.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Creates an object id from raw bytes.
    pub fn new(id: [u8; 32]) -> Self {
        Self(id)
    }

    /// Mints a fresh random object id.
    pub fn generate() -> Self {
        let mut id = [0; 32];
        getrandom::getrandom(&mut id).unwrap();
        Self(id)
    }
}

impl From<ObjectId> for [u8; 32] {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl AsRef<[u8; 32]> for ObjectId {
    fn as_ref(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[0..2]))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut id = [0; 44];
        base64::encode_config_slice(&self.0, base64::URL_SAFE, &mut id);
        write!(f, "{}", std::str::from_utf8(&id).expect("valid utf8"))
    }
}

impl FromStr for ObjectId {
    type Err = base64::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 44 {
            return Err(base64::DecodeError::InvalidLength);
        }
        let mut id = [0; 32];
        base64::decode_config_slice(s, base64::URL_SAFE, &mut id)?;
        Ok(Self(id))
    }
}

/// Distinguishes the sub-streams one device keeps per object.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum StreamRole {
    /// Membership changes of a dynamic permission group.
    Perm,
    /// Payload writes to a plain value object.
    Value,
    /// Parent assignments of a tree node.
    Parent,
}

impl StreamRole {
    /// Role discriminant as stored in archived streams.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses a role discriminant.
    pub fn from_u8(u: u8) -> Option<Self> {
        match u {
            u if u == StreamRole::Perm as u8 => Some(StreamRole::Perm),
            u if u == StreamRole::Value as u8 => Some(StreamRole::Value),
            u if u == StreamRole::Parent as u8 => Some(StreamRole::Parent),
            _ => None,
        }
    }
}

/// Key of an append-only op stream: one device writing one role of one
/// object. Streams are globally unique.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StreamId {
    device: DeviceId,
    scope: ObjectId,
    role: StreamRole,
}

impl StreamId {
    /// Creates a stream key.
    pub fn new(device: DeviceId, scope: ObjectId, role: StreamRole) -> Self {
        Self {
            device,
            scope,
            role,
        }
    }

    /// The authoring device.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// The object this stream contributes to.
    pub fn scope(&self) -> ObjectId {
        self.scope
    }

    /// The sub-stream role.
    pub fn role(&self) -> StreamRole {
        self.role
    }
}

impl std::fmt::Debug for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}.{:?}/{:?}", self.device, self.scope, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = DeviceId::new([42; 32]);
        let s = id.to_string();
        assert_eq!(s.len(), 44);
        assert_eq!(s.parse::<DeviceId>().unwrap(), id);
        assert!("short".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_role_discriminants() {
        for role in [StreamRole::Perm, StreamRole::Value, StreamRole::Parent] {
            assert_eq!(StreamRole::from_u8(role.as_u8()), Some(role));
        }
        assert_eq!(StreamRole::from_u8(17), None);
    }
}
