#![doc = r#"
PMORtStream - Diffusion temps réel d'une source pré-enregistrée

Cette crate délivre une source d'octets finie (typiquement un fichier audio)
au rythme d'un débit cible, de sorte que le consommateur reçoive les octets
à la cadence d'une lecture réelle : un direct simulé à partir d'un fichier.

# Architecture

Chaque pipeline est composé de deux tâches Tokio reliées par un channel
borné :

```text
ByteSource → SourceReader → ChunkNormalizer ──(mpsc)──► Pacer → observateurs
                  tâche de lecture                   tâche d'émission
```

- [`SourceReader`] lit la source à un offset absolu ;
- [`ChunkNormalizer`] redécoupe les blocs lus en chunks de `chunk_size` octets ;
- le pacer libère un chunk par intervalle `chunk_size / débit`, avec
  correction de dérive à chaque cycle et une pause qui conserve le temps
  déjà écoulé ;
- [`RtStream`] possède le pipeline actif, le reconstruit à chaque `seek` et
  conserve les observateurs de l'appelant.

# Exemple

```no_run
use pmortstream::{Bitrate, EventKind, RtStream, StreamConfig, StreamEvent};

#[tokio::main]
async fn main() -> pmortstream::Result<()> {
    let config = StreamConfig::new(Bitrate::from_bytes_per_sec(256_000));
    let mut stream = RtStream::open("track.flac", config).await?;

    stream.on(EventKind::Data, |event| {
        if let StreamEvent::Data(chunk) = event {
            println!("chunk @ {} ({} octets)", chunk.offset(), chunk.len());
        }
    })?;
    let mut end = stream.subscribe(&[EventKind::End, EventKind::Error])?;

    stream.start()?;
    end.recv().await;
    stream.close()?;
    Ok(())
}
```
"#]

mod chunk;
pub mod config;
mod controller;
mod error;
mod events;
mod normalizer;
mod pacer;
mod pipeline;
mod source;

pub use chunk::Chunk;
pub use config::{Bitrate, StreamConfig};
pub use controller::{RtStream, StreamState};
pub use error::{Result, RtStreamError};
pub use events::{Callback, EventKind, EventReceiver, ObserverId, StreamEvent};
pub use normalizer::ChunkNormalizer;
pub use pacer::{Drift, PacerState, PacingState, Transition};
pub use source::{ByteSource, FileByteSource, MemoryByteSource, SourceReader};
