mod reader;
mod writer;

pub use reader::{Reader, ReaderError};
pub use writer::Writer;

use std::collections::BTreeMap;

// The consensus wire codec.
//
// Every type crossing the network or the key-value store implements this
// trait. Encoding is canonical: fields in declaration order, counts and
// amounts as varuints, byte strings length-prefixed. Two nodes encoding
// the same value MUST produce the same bytes since block and transaction
// ids are hashes of those bytes.
pub trait Serializer {
    fn write(&self, writer: &mut Writer);

    fn read(reader: &mut Reader) -> Result<Self, ReaderError>
    where
        Self: Sized;

    fn size(&self) -> usize {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.total_write()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.write(&mut writer);
        writer.bytes()
    }

    fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ReaderError>
    where
        Self: Sized,
    {
        let mut reader = Reader::new(bytes);
        let value = Self::read(&mut reader)?;
        if reader.total_read() != bytes.len() {
            return Err(ReaderError::InvalidSize);
        }

        Ok(value)
    }

    fn from_hex(hex: &str) -> Result<Self, ReaderError>
    where
        Self: Sized,
    {
        let bytes = hex::decode(hex).map_err(|_| ReaderError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }
}

impl Serializer for u8 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u8(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u8()
    }

    fn size(&self) -> usize {
        1
    }
}

impl Serializer for u32 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u32(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u32()
    }

    fn size(&self) -> usize {
        4
    }
}

impl Serializer for u64 {
    fn write(&self, writer: &mut Writer) {
        writer.write_u64(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_u64()
    }

    fn size(&self) -> usize {
        8
    }
}

impl Serializer for bool {
    fn write(&self, writer: &mut Writer) {
        writer.write_bool(*self);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_bool()
    }

    fn size(&self) -> usize {
        1
    }
}

impl<T: Serializer> Serializer for Option<T> {
    fn write(&self, writer: &mut Writer) {
        match self {
            Some(value) => {
                writer.write_bool(true);
                value.write(writer);
            }
            None => writer.write_bool(false),
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        if reader.read_bool()? {
            Ok(Some(T::read(reader)?))
        } else {
            Ok(None)
        }
    }

    fn size(&self) -> usize {
        1 + self.as_ref().map(|v| v.size()).unwrap_or(0)
    }
}

impl<T: Serializer> Serializer for Vec<T> {
    fn write(&self, writer: &mut Writer) {
        writer.write_varuint(self.len() as u64);
        for item in self {
            item.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let count = reader.read_varuint()?;
        // Every element takes at least one byte, cap the allocation
        if count > reader.remaining() as u64 {
            return Err(ReaderError::InvalidSize);
        }

        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(T::read(reader)?);
        }

        Ok(items)
    }
}

impl<K: Serializer + Ord, V: Serializer> Serializer for BTreeMap<K, V> {
    fn write(&self, writer: &mut Writer) {
        writer.write_varuint(self.len() as u64);
        for (key, value) in self {
            key.write(writer);
            value.write(writer);
        }
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let count = reader.read_varuint()?;
        if count > reader.remaining() as u64 {
            return Err(ReaderError::InvalidSize);
        }

        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = K::read(reader)?;
            let value = V::read(reader)?;
            map.insert(key, value);
        }

        Ok(map)
    }
}
