//! Re-découpage en chunks de taille fixe
//!
//! Le lecteur produit des blocs de taille quelconque ; le pacer a besoin de
//! blocs de `chunk_size` octets pour que chaque intervalle corresponde à la
//! même quantité de données. Seul le dernier chunk d'une source finie peut
//! être plus court.

use crate::Chunk;
use bytes::{Bytes, BytesMut};

pub struct ChunkNormalizer {
    chunk_size: usize,
    pending: BytesMut,
    next_offset: u64,
}

impl ChunkNormalizer {
    /// * `chunk_size` - taille des chunks produits (au moins 1)
    /// * `start_offset` - offset source du premier octet poussé
    pub fn new(chunk_size: usize, start_offset: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            pending: BytesMut::with_capacity(chunk_size),
            next_offset: start_offset,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Octets en attente d'un chunk complet
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Pousse un bloc et renvoie les chunks complets disponibles
    pub fn push(&mut self, mut input: Bytes) -> Vec<Chunk> {
        let mut out = Vec::new();

        // Compléter le reliquat en premier
        if !self.pending.is_empty() {
            let missing = self.chunk_size - self.pending.len();
            let take = missing.min(input.len());
            self.pending.extend_from_slice(&input.split_to(take));
            if self.pending.len() < self.chunk_size {
                return out;
            }
            let full = self.pending.split().freeze();
            out.push(self.make_chunk(full));
        }

        // Chunks entiers découpés directement dans l'entrée (sans copie)
        while input.len() >= self.chunk_size {
            let full = input.split_to(self.chunk_size);
            out.push(self.make_chunk(full));
        }

        if !input.is_empty() {
            self.pending.extend_from_slice(&input);
        }
        out
    }

    /// Vide le reliquat en fin de source
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = self.pending.split().freeze();
        Some(self.make_chunk(rest))
    }

    fn make_chunk(&mut self, data: Bytes) -> Chunk {
        let chunk = Chunk::new(self.next_offset, data);
        self.next_offset = chunk.end_offset();
        chunk
    }
}
