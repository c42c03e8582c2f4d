use serde::{Serialize, de::DeserializeOwned};

use crate::{PeerId, error::Result};

/// One decoded inbound method call, handed to the registered dispatcher.
#[derive(Debug, Clone)]
pub struct MethodCall {
    pub src_peer: PeerId,
    pub invoke_id: u32,
    pub method_id: u32,
    pub args: rmpv::Value,
}

/// Application-level argument/return codec, supplied per service.
///
/// The core layer treats argument lists and return values as opaque: it only
/// moves `rmpv::Value` trees across this seam. The encoding on the wire is
/// whatever the registered serializer produces; the logical frame layout
/// around it is fixed by [`CallFrame`](crate::CallFrame) and
/// [`ReturnFrame`](crate::ReturnFrame).
pub trait MethodSerializer: Send + Sync {
    fn read_call(&self, method_id: u32, buf: &[u8]) -> Result<rmpv::Value>;
    fn write_call(&self, method_id: u32, args: &rmpv::Value, out: &mut Vec<u8>) -> Result<()>;
    fn read_return(&self, method_id: u32, buf: &[u8]) -> Result<rmpv::Value>;
    fn write_return(&self, method_id: u32, value: &rmpv::Value, out: &mut Vec<u8>) -> Result<()>;
}

/// Default MessagePack serializer.
///
/// Ignores the method id: every argument list and return value is one
/// self-describing msgpack value.
#[derive(Debug, Default, Clone, Copy)]
pub struct RmpSerializer;

impl MethodSerializer for RmpSerializer {
    fn read_call(&self, _method_id: u32, buf: &[u8]) -> Result<rmpv::Value> {
        Ok(rmp_serde::from_slice(buf)?)
    }

    fn write_call(&self, _method_id: u32, args: &rmpv::Value, out: &mut Vec<u8>) -> Result<()> {
        rmp_serde::encode::write(out, args)?;
        Ok(())
    }

    fn read_return(&self, _method_id: u32, buf: &[u8]) -> Result<rmpv::Value> {
        Ok(rmp_serde::from_slice(buf)?)
    }

    fn write_return(&self, _method_id: u32, value: &rmpv::Value, out: &mut Vec<u8>) -> Result<()> {
        rmp_serde::encode::write(out, value)?;
        Ok(())
    }
}

/// Converts a serde-serializable argument bundle into the seam value type.
pub fn to_value<T: Serialize>(value: &T) -> Result<rmpv::Value> {
    rmpv::ext::to_value(value).map_err(|e| {
        crate::Error::new(crate::ErrorKind::SerializeFailed, e.to_string())
    })
}

/// Converts a seam value back into a typed result.
pub fn from_value<T: DeserializeOwned>(value: rmpv::Value) -> Result<T> {
    Ok(rmpv::ext::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rmp_serializer_roundtrip() {
        let serializer = RmpSerializer;
        let args = to_value(&(42u32, "hello")).unwrap();

        let mut buf = Vec::new();
        serializer.write_call(7, &args, &mut buf).unwrap();
        let decoded = serializer.read_call(7, &buf).unwrap();
        assert_eq!(decoded, args);

        let (n, s): (u32, String) = from_value(decoded).unwrap();
        assert_eq!(n, 42);
        assert_eq!(s, "hello");
    }

    #[test]
    fn test_read_garbage() {
        let serializer = RmpSerializer;
        serializer.read_return(0, &[0xc1]).unwrap_err();
    }
}
