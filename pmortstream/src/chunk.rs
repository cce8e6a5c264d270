use bytes::Bytes;

/// Bloc d'octets immuable positionné dans la source
///
/// Le contenu est partagé via [`Bytes`] : cloner un `Chunk` ne copie
/// jamais les données.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    offset: u64,
    data: Bytes,
}

impl Chunk {
    pub fn new(offset: u64, data: Bytes) -> Self {
        Self { offset, data }
    }

    /// Offset absolu du premier octet dans la source
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset absolu juste après le dernier octet
    pub fn end_offset(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}
