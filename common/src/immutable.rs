use std::{ops::Deref, sync::Arc};

use crate::serializer::{Reader, ReaderError, Serializer, Writer};

// A value that is either owned or shared behind an Arc.
// Chain types are read far more often than they are built, so most
// call sites pass blocks and headers around as Immutable to avoid clones.
#[derive(Debug, Clone)]
pub enum Immutable<T> {
    Owned(T),
    Arc(Arc<T>),
}

impl<T> Immutable<T> {
    pub fn get_inner(&self) -> &T {
        match self {
            Immutable::Owned(v) => v,
            Immutable::Arc(v) => v,
        }
    }

    pub fn into_arc(self) -> Arc<T> {
        match self {
            Immutable::Owned(v) => Arc::new(v),
            Immutable::Arc(v) => v,
        }
    }
}

impl<T: Clone> Immutable<T> {
    pub fn into_owned(self) -> T {
        match self {
            Immutable::Owned(v) => v,
            Immutable::Arc(v) => Arc::try_unwrap(v).unwrap_or_else(|arc| (*arc).clone()),
        }
    }
}

impl<T> From<T> for Immutable<T> {
    fn from(value: T) -> Self {
        Immutable::Owned(value)
    }
}

impl<T> From<Arc<T>> for Immutable<T> {
    fn from(value: Arc<T>) -> Self {
        Immutable::Arc(value)
    }
}

impl<T> Deref for Immutable<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.get_inner()
    }
}

impl<T: Serializer> Serializer for Immutable<T> {
    fn write(&self, writer: &mut Writer) {
        self.get_inner().write(writer);
    }

    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        Ok(Immutable::Owned(T::read(reader)?))
    }

    fn size(&self) -> usize {
        self.get_inner().size()
    }
}

impl<T: serde::Serialize> serde::Serialize for Immutable<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.get_inner().serialize(serializer)
    }
}

impl<'de, T: serde::Deserialize<'de>> serde::Deserialize<'de> for Immutable<T> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Immutable::Owned(T::deserialize(deserializer)?))
    }
}
