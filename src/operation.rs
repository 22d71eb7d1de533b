//! Summary: Write operations accepted by the store and the write stream.
//! Copyright (c) YOAB. All rights reserved.

/// A single write against the store.
///
/// Operations are immutable once submitted. A batch is an ordered slice of
/// operations; later operations on the same key win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Insert or update a key-value pair.
    Put { key: Vec<u8>, value: Vec<u8> },
    /// Delete a key.
    Delete { key: Vec<u8> },
}

impl Operation {
    /// Creates a put operation.
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Operation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a delete operation.
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Operation::Delete { key: key.into() }
    }

    /// Returns the key this operation targets.
    pub fn key(&self) -> &[u8] {
        match self {
            Operation::Put { key, .. } | Operation::Delete { key } => key,
        }
    }

    /// Returns the value for puts, `None` for deletes.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Operation::Put { value, .. } => Some(value),
            Operation::Delete { .. } => None,
        }
    }

    /// Approximate in-memory footprint of the key and value.
    #[inline]
    pub fn size_hint(&self) -> usize {
        self.key().len() + self.value().map_or(0, <[u8]>::len)
    }
}
