//! Configuration du flux temps réel
//!
//! La configuration se charge depuis un document YAML (section `rtstream`)
//! puis peut être surchargée par des variables d'environnement préfixées
//! par `PMORTSTREAM__`.
//!
//! ```yaml
//! rtstream:
//!   bitrate: 256000      # bits par seconde
//!   chunk_size: 32000
//!   read_size: 65536
//!   channel_size: 16
//! ```
//!
//! Le débit peut aussi être donné directement en octets par seconde avec
//! `byte_rate:`. Les deux clés sont exclusives.

use crate::error::{Result, RtStreamError};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};
use tracing::{debug, info};

/// Taille par défaut d'un chunk émis (octets)
pub const DEFAULT_CHUNK_SIZE: usize = 32_000;

/// Taille par défaut d'une lecture sur la source (octets)
pub const DEFAULT_READ_SIZE: usize = 64 * 1024;

/// Taille par défaut du channel entre lecteur et pacer.
/// Nombre de chunks normalisés pouvant attendre avant que le lecteur
/// soit bloqué (backpressure).
pub const DEFAULT_CHANNEL_SIZE: usize = 16;

const ENV_PREFIX: &str = "PMORTSTREAM__";

/// Débit cible, stocké en octets par seconde.
///
/// L'unité est toujours explicite à la construction : un débit "256000"
/// vaut 1 s par chunk de 32000 octets en bits/s, mais 125 ms en octets/s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bitrate {
    bytes_per_sec: f64,
}

impl Bitrate {
    /// Débit exprimé en bits par seconde
    pub fn from_bits_per_sec(bits: u64) -> Self {
        Self {
            bytes_per_sec: bits as f64 / 8.0,
        }
    }

    /// Débit exprimé en octets par seconde
    pub fn from_bytes_per_sec(bytes: u64) -> Self {
        Self {
            bytes_per_sec: bytes as f64,
        }
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_per_sec
    }

    pub fn bits_per_sec(&self) -> f64 {
        self.bytes_per_sec * 8.0
    }

    /// Intervalle nominal entre deux chunks de `chunk_size` octets
    pub fn base_delay(&self, chunk_size: usize) -> Duration {
        Duration::from_secs_f64(chunk_size as f64 / self.bytes_per_sec)
    }

    fn is_valid(&self) -> bool {
        self.bytes_per_sec.is_finite() && self.bytes_per_sec > 0.0
    }

    /// Débit en bits/s s'il est entier
    fn exact_bits_per_sec(&self) -> Option<u64> {
        let bits = self.bits_per_sec();
        (bits.fract() == 0.0 && bits <= u64::MAX as f64).then_some(bits as u64)
    }
}

/// Paramètres de construction d'un pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub bitrate: Bitrate,
    pub chunk_size: usize,
    pub read_size: usize,
    pub channel_size: usize,
}

impl StreamConfig {
    pub fn new(bitrate: Bitrate) -> Self {
        Self {
            bitrate,
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_size: DEFAULT_READ_SIZE,
            channel_size: DEFAULT_CHANNEL_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size;
        self
    }

    pub fn with_channel_size(mut self, channel_size: usize) -> Self {
        self.channel_size = channel_size;
        self
    }

    /// Intervalle nominal entre deux émissions
    pub fn base_delay(&self) -> Duration {
        self.bitrate.base_delay(self.chunk_size)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.bitrate.is_valid() {
            return Err(RtStreamError::config("bitrate must be positive"));
        }
        if self.chunk_size == 0 {
            return Err(RtStreamError::config("chunk_size must be positive"));
        }
        if self.read_size == 0 {
            return Err(RtStreamError::config("read_size must be positive"));
        }
        if self.channel_size == 0 {
            return Err(RtStreamError::config("channel_size must be positive"));
        }
        let secs = self.chunk_size as f64 / self.bitrate.bytes_per_sec();
        if Duration::try_from_secs_f64(secs).is_err() {
            return Err(RtStreamError::config(format!(
                "chunk_size {} at {:.3} bytes/s gives an unrepresentable delay",
                self.chunk_size,
                self.bitrate.bytes_per_sec()
            )));
        }
        Ok(())
    }

    /// Parse un document YAML contenant une section `rtstream`
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(yaml)?;
        let config = file.rtstream.into_config()?;
        config.validate()?;
        Ok(config)
    }

    /// Charge un fichier YAML puis applique les surcharges d'environnement
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rtstream configuration");
        let yaml = fs::read_to_string(path)?;
        let file: ConfigFile = serde_yaml::from_str(&yaml)?;
        let mut config = file.rtstream.into_config()?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Applique les variables `PMORTSTREAM__*` présentes dans l'environnement
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| env::var(key).ok())
    }

    /// Applique des surcharges fournies par `lookup` (nom complet de la variable)
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| -> Result<Option<u64>> {
            let key = format!("{}{}", ENV_PREFIX, name);
            match lookup(&key) {
                Some(raw) => {
                    debug!(key = %key, value = %raw, "Applying configuration override");
                    raw.trim()
                        .parse::<u64>()
                        .map(Some)
                        .map_err(|e| RtStreamError::config(format!("{}: {}", key, e)))
                }
                None => Ok(None),
            }
        };

        let get_size = |name: &str| -> Result<Option<usize>> {
            get(name)?
                .map(|value| {
                    usize::try_from(value).map_err(|_| {
                        RtStreamError::config(format!(
                            "{}{}: {} does not fit in usize",
                            ENV_PREFIX, name, value
                        ))
                    })
                })
                .transpose()
        };

        match (get("BITRATE")?, get("BYTE_RATE")?) {
            (Some(_), Some(_)) => {
                return Err(RtStreamError::config(format!(
                    "{prefix}BITRATE and {prefix}BYTE_RATE are mutually exclusive",
                    prefix = ENV_PREFIX
                )))
            }
            (Some(bits), None) => self.bitrate = Bitrate::from_bits_per_sec(bits),
            (None, Some(bytes)) => self.bitrate = Bitrate::from_bytes_per_sec(bytes),
            (None, None) => {}
        }
        if let Some(size) = get_size("CHUNK_SIZE")? {
            self.chunk_size = size;
        }
        if let Some(size) = get_size("READ_SIZE")? {
            self.read_size = size;
        }
        if let Some(size) = get_size("CHANNEL_SIZE")? {
            self.channel_size = size;
        }
        Ok(())
    }

    /// Section YAML équivalente
    ///
    /// Le débit est écrit en bits/s quand il est entier, sinon arrondi en
    /// octets/s.
    pub fn to_yaml_string(&self) -> Result<String> {
        let bits = self.bitrate.exact_bits_per_sec();
        let file = ConfigFile {
            rtstream: RtStreamSection {
                bitrate: bits,
                byte_rate: match bits {
                    Some(_) => None,
                    None => Some(self.bitrate.bytes_per_sec().round() as u64),
                },
                chunk_size: Some(self.chunk_size),
                read_size: Some(self.read_size),
                channel_size: Some(self.channel_size),
            },
        };
        Ok(serde_yaml::to_string(&file)?)
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct ConfigFile {
    rtstream: RtStreamSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RtStreamSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    byte_rate: Option<u64>,
    #[serde(default)]
    chunk_size: Option<usize>,
    #[serde(default)]
    read_size: Option<usize>,
    #[serde(default)]
    channel_size: Option<usize>,
}

impl RtStreamSection {
    fn into_config(self) -> Result<StreamConfig> {
        let bitrate = match (self.bitrate, self.byte_rate) {
            (Some(bits), None) => Bitrate::from_bits_per_sec(bits),
            (None, Some(bytes)) => Bitrate::from_bytes_per_sec(bytes),
            (Some(_), Some(_)) => {
                return Err(RtStreamError::config(
                    "`bitrate` and `byte_rate` are mutually exclusive",
                ))
            }
            (None, None) => {
                return Err(RtStreamError::config(
                    "missing `bitrate` (bits/s) or `byte_rate` (bytes/s)",
                ))
            }
        };

        Ok(StreamConfig {
            bitrate,
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            read_size: self.read_size.unwrap_or(DEFAULT_READ_SIZE),
            channel_size: self.channel_size.unwrap_or(DEFAULT_CHANNEL_SIZE),
        })
    }
}
