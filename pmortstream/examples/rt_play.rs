//! Diffuse un fichier sur la sortie standard au rythme de son débit
//!
//! Usage:
//!   cargo run --example rt_play -- <fichier> [config.yaml] [offset]
//!
//! Sans fichier de configuration, le débit est de 256 kbit/s. Les
//! variables `PMORTSTREAM__*` surchargent le fichier de configuration.
//!
//! Exemple:
//!   cargo run --example rt_play -- track.mp3 rtstream.yaml > /dev/null

use pmortstream::{Bitrate, EventKind, RtStream, StreamConfig, StreamEvent};
use std::env;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Les logs vont sur stderr, stdout porte les données
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <fichier> [config.yaml] [offset]", args[0]);
        std::process::exit(1);
    }

    let config = match args.get(2) {
        Some(path) => StreamConfig::load(path)?,
        None => {
            let mut config = StreamConfig::new(Bitrate::from_bits_per_sec(256_000));
            config.apply_env_overrides()?;
            config.validate()?;
            config
        }
    };
    let offset: u64 = match args.get(3) {
        Some(raw) => raw.parse()?,
        None => 0,
    };

    let mut stream = RtStream::open(&args[1], config).await?;
    let total = stream.source().len().await?;
    let config = stream.config();
    eprintln!(
        "Diffusion de {} ({} octets) à {:.0} octets/s ({} octets toutes les {:?})",
        args[1],
        total,
        config.bitrate.bytes_per_sec(),
        config.chunk_size,
        config.base_delay()
    );
    let mut events = stream.subscribe(&[EventKind::Data, EventKind::End, EventKind::Error])?;
    stream.start()?;
    if offset > 0 {
        stream.seek(offset)?;
    }

    let mut stdout = tokio::io::stdout();
    let mut written: u64 = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nArrêt demandé");
                break;
            }
            event = events.recv() => match event {
                Some(StreamEvent::Data(chunk)) => {
                    stdout.write_all(chunk.data()).await?;
                    stdout.flush().await?;
                    written += chunk.len() as u64;
                }
                Some(StreamEvent::End) | None => break,
                Some(StreamEvent::Error(e)) => {
                    eprintln!("\nErreur de lecture: {}", e);
                    break;
                }
                Some(_) => {}
            },
        }
    }

    let position = stream.position();
    stream.close()?;
    eprintln!("{} octets diffusés (position {})", written, position);
    Ok(())
}
