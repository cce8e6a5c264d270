//! Lecture positionnée de la source
//!
//! La source est une séquence d'octets finie, lue à un offset absolu.
//! Une lecture au-delà de la fin renvoie zéro octet : c'est le signal
//! d'épuisement, pas une erreur.

use crate::error::Result;
use bytes::Bytes;
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    sync::Mutex,
};

/// Source d'octets finie adressable par offset
#[async_trait::async_trait]
pub trait ByteSource: Send + Sync {
    /// Lit au plus `size` octets à partir de `offset`
    ///
    /// Renvoie moins d'octets (éventuellement aucun) en fin de source.
    async fn read_at(&self, offset: u64, size: usize) -> Result<Bytes>;

    /// Longueur totale de la source en octets
    async fn len(&self) -> Result<u64>;
}

/// Fichier sur disque
pub struct FileByteSource {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileByteSource {
    pub async fn open<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).await?;
        tracing::debug!("FileByteSource opened {:?}", path);
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait::async_trait]
impl ByteSource for FileByteSource {
    async fn read_at(&self, offset: u64, size: usize) -> Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let read = file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn len(&self) -> Result<u64> {
        let file = self.file.lock().await;
        Ok(file.metadata().await?.len())
    }
}

/// Source en mémoire
#[derive(Debug, Clone)]
pub struct MemoryByteSource {
    data: Bytes,
}

impl MemoryByteSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait::async_trait]
impl ByteSource for MemoryByteSource {
    async fn read_at(&self, offset: u64, size: usize) -> Result<Bytes> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(Bytes::new());
        }
        let start = offset as usize;
        let end = start.saturating_add(size).min(self.data.len());
        Ok(self.data.slice(start..end))
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }
}

/// Lecteur séquentiel propriétaire du curseur de lecture
///
/// Chaque pipeline possède son propre `SourceReader`, créé à l'offset
/// demandé. Le curseur n'avance que du nombre d'octets effectivement lus.
pub struct SourceReader {
    source: Arc<dyn ByteSource>,
    position: u64,
    read_size: usize,
}

impl SourceReader {
    pub fn new(source: Arc<dyn ByteSource>, offset: u64, read_size: usize) -> Self {
        Self {
            source,
            position: offset,
            read_size: read_size.max(1),
        }
    }

    /// Offset de la prochaine lecture
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Lecture à un offset arbitraire, sans toucher au curseur
    pub async fn read(&self, offset: u64, size: usize) -> Result<Bytes> {
        self.source.read_at(offset, size).await
    }

    /// Lit `read_size` octets au curseur et l'avance
    ///
    /// Un résultat vide signale la fin de la source.
    pub async fn read_next(&mut self) -> Result<Bytes> {
        let bytes = self.read(self.position, self.read_size).await?;
        self.position += bytes.len() as u64;
        Ok(bytes)
    }
}
