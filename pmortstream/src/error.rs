//! Types d'erreurs pour pmortstream

use std::io;

/// Erreurs du pipeline de diffusion temps réel
#[derive(Debug, thiserror::Error)]
pub enum RtStreamError {
    /// Échec de lecture de la source (distinct de la fin de source)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Opération appelée sur un pipeline non initialisé ou fermé
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Configuration invalide
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("YAML parsing failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Aucun runtime Tokio disponible pour lancer le pipeline
    #[error("no Tokio runtime available to spawn the pipeline")]
    NoRuntime,
}

impl RtStreamError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Vrai pour les erreurs d'usage (état invalide)
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState(_))
    }
}

/// Type Result spécialisé pour pmortstream
pub type Result<T> = std::result::Result<T, RtStreamError>;
