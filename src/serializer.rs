use std::{cmp::Ordering, convert::TryInto};

use crate::{error::Error, Result};

/// Byte-level codec and total order for one key or value type.
///
/// The engine stores keys and values as opaque byte strings; a serializer
/// pair supplied at tree creation gives them meaning. `compare` is the
/// order the tree maintains and must be a total order over the serialized
/// form.
///
/// Serializers are plain values constructed by the caller and passed in;
/// the engine holds no process-wide instances.
pub trait Serializer {
    type Item;

    /// Tag persisted in the tree header so a reopened tree can reject a
    /// mismatched serializer.
    fn type_tag(&self) -> u8;

    fn serialize(&self, item: &Self::Item) -> Vec<u8>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::Item>;

    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering>;
}

macro_rules! impl_int_serializer {
    ($name:ident, $t:ty, $tag:expr) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Serializer for $name {
            type Item = $t;

            fn type_tag(&self) -> u8 {
                $tag
            }

            fn serialize(&self, item: &$t) -> Vec<u8> {
                item.to_be_bytes().to_vec()
            }

            fn deserialize(&self, bytes: &[u8]) -> Result<$t> {
                let arr = bytes.try_into().map_err(|_| {
                    Error::corrupt(format!(
                        "expected {} bytes for {}, got {}",
                        std::mem::size_of::<$t>(),
                        stringify!($t),
                        bytes.len()
                    ))
                })?;
                Ok(<$t>::from_be_bytes(arr))
            }

            fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
                // decode before comparing so negative values order correctly
                Ok(self.deserialize(a)?.cmp(&self.deserialize(b)?))
            }
        }
    };
}

impl_int_serializer!(IntSerializer, i32, 1);
impl_int_serializer!(LongSerializer, i64, 2);

#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer for StringSerializer {
    type Item = String;

    fn type_tag(&self) -> u8 {
        3
    }

    fn serialize(&self, item: &String) -> Vec<u8> {
        item.as_bytes().to_vec()
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::corrupt(format!("invalid utf-8: {}", e)))
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        // byte order equals code-point order for utf-8
        Ok(a.cmp(b))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer for BytesSerializer {
    type Item = Vec<u8>;

    fn type_tag(&self) -> u8 {
        4
    }

    fn serialize(&self, item: &Vec<u8>) -> Vec<u8> {
        item.clone()
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(a.cmp(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_round_trip() {
        let s = LongSerializer;
        for v in [-5i64, -1, 0, 1, 42, i64::MIN, i64::MAX].iter() {
            let bytes = s.serialize(v);
            assert_eq!(s.deserialize(&bytes).unwrap(), *v);
        }
    }

    #[test]
    fn test_long_compare_negatives() {
        let s = LongSerializer;
        let a = s.serialize(&-3i64);
        let b = s.serialize(&2i64);
        assert_eq!(s.compare(&a, &b).unwrap(), Ordering::Less);
    }

    #[test]
    fn test_string_compare() {
        let s = StringSerializer;
        let a = s.serialize(&"abc".to_string());
        let b = s.serialize(&"abd".to_string());
        assert_eq!(s.compare(&a, &b).unwrap(), Ordering::Less);
        assert_eq!(s.compare(&a, &a).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_int_bad_length() {
        let s = IntSerializer;
        assert!(s.deserialize(&[1, 2, 3]).is_err());
    }
}
