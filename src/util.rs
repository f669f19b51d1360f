use rkyv::ser::serializers::AllocSerializer;
use rkyv::ser::Serializer;
use rkyv::{archived_root, AlignedVec, Archive, Archived, Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;

/// Zero-copy handle to the archived form of a `T`.
///
/// The bytes stay aligned for the archived layout; cloning shares them.
pub struct Ref<T> {
    marker: PhantomData<T>,
    bytes: Arc<AlignedVec>,
}

impl<T: Archive> Ref<T> {
    /// Wraps already-archived bytes. The caller vouches that `bytes` holds
    /// a valid archived `T`; validated entry points live beside the types
    /// they decode.
    pub fn new(bytes: AlignedVec) -> Self {
        Self {
            marker: PhantomData,
            bytes: Arc::new(bytes),
        }
    }

    /// Archives a value.
    pub fn archive(t: &T) -> Self
    where
        T: Serialize<AllocSerializer<256>>,
    {
        let mut ser = AllocSerializer::<256>::default();
        ser.serialize_value(t).unwrap();
        Self::new(ser.into_serializer().into_inner())
    }

    /// Deserializes back into an owned `T`.
    pub fn to_owned(&self) -> T
    where
        Archived<T>: Deserialize<T, rkyv::Infallible>,
    {
        // the Infallible deserializer cannot fail
        self.as_ref().deserialize(&mut rkyv::Infallible).unwrap()
    }

    /// The archived bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl<T: Archive> AsRef<Archived<T>> for Ref<T> {
    fn as_ref(&self) -> &Archived<T> {
        unsafe { archived_root::<T>(&self.bytes[..]) }
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            marker: PhantomData,
            bytes: self.bytes.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Ref({} bytes)", self.bytes.len())
    }
}
