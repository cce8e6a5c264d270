//! Contrôleur de flux temps réel
//!
//! [`RtStream`] possède le pipeline actif et expose les commandes de
//! lecture. Les observateurs enregistrés par l'appelant lui appartiennent :
//! ils sont conservés, avec leurs identifiants, à chaque reconstruction
//! du pipeline par [`RtStream::seek`].
//!
//! # Exemple
//!
//! ```no_run
//! use pmortstream::{Bitrate, EventKind, RtStream, StreamConfig, StreamEvent};
//!
//! # async fn example() -> pmortstream::Result<()> {
//! let config = StreamConfig::new(Bitrate::from_bits_per_sec(256_000));
//! let mut stream = RtStream::open("/tmp/track.flac", config).await?;
//!
//! let mut events = stream.subscribe(&[EventKind::Data, EventKind::End])?;
//! stream.start()?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         StreamEvent::Data(chunk) => println!("{} bytes @ {}", chunk.len(), chunk.offset()),
//!         StreamEvent::End => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use crate::{
    config::StreamConfig,
    events::{
        in_dispatch, Callback, Endpoint, EventKind, EventReceiver, Observer, ObserverId,
        ObserverOrigin, ObserverRegistry, StreamEvent,
    },
    pacer::PacerState,
    pipeline::{Outcome, Pipeline},
    source::{ByteSource, FileByteSource},
    Result, RtStreamError,
};
use std::{path::PathBuf, sync::Arc};
use tokio::{runtime::Handle, sync::mpsc};
use tracing::{debug, info};

/// État observable du flux
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    Running,
    Paused,
    Ended,
    Failed,
    Closed,
}

pub struct RtStream {
    source: Arc<dyn ByteSource>,
    config: StreamConfig,
    /// Observateurs enregistrés avant `start`
    staged: ObserverRegistry,
    pipeline: Option<Pipeline>,
    closed: bool,
}

impl RtStream {
    pub fn new(source: Arc<dyn ByteSource>, config: StreamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            config,
            staged: ObserverRegistry::new(),
            pipeline: None,
            closed: false,
        })
    }

    /// Ouvre un fichier et construit le flux
    pub async fn open<P: Into<PathBuf>>(path: P, config: StreamConfig) -> Result<Self> {
        let source = FileByteSource::open(path).await?;
        let len = source.len().await?;
        info!("RtStream: opened {} ({} bytes)", source.path().display(), len);
        Self::new(Arc::new(source), config)
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn ByteSource> {
        &self.source
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RtStreamError::InvalidState("stream is closed"));
        }
        Ok(())
    }

    /// Refuse les commandes qui reconstruisent ou détachent le pipeline
    /// depuis un callback en cours de livraison
    fn ensure_outside_dispatch(&self) -> Result<()> {
        if in_dispatch() {
            return Err(RtStreamError::InvalidState("called from an observer callback"));
        }
        Ok(())
    }

    fn active(&self) -> Result<&Pipeline> {
        self.ensure_open()?;
        self.pipeline
            .as_ref()
            .ok_or(RtStreamError::InvalidState("stream is not started"))
    }

    fn attach(&mut self, id: ObserverId, kind: EventKind, observer: Observer) {
        match &self.pipeline {
            Some(pipeline) => pipeline.register(id, kind, observer),
            None => self.staged.insert(id, kind, ObserverOrigin::Caller, observer),
        }
    }

    /// Enregistre un callback pour un type d'événement
    ///
    /// Le callback est appelé depuis la tâche du pipeline. Un `seek` ou un
    /// `close` appelé depuis le callback échoue avec
    /// [`RtStreamError::InvalidState`].
    pub fn on<F>(&mut self, kind: EventKind, callback: F) -> Result<ObserverId>
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let id = ObserverId::next();
        let callback: Callback = Arc::new(callback);
        self.attach(id, kind, Observer::Callback(callback));
        Ok(id)
    }

    /// Abonne un channel à plusieurs types d'événements
    ///
    /// Les événements arrivent dans leur ordre d'émission ; fermer le
    /// receiver désabonne le channel au dispatch suivant.
    pub fn subscribe(&mut self, kinds: &[EventKind]) -> Result<EventReceiver> {
        self.ensure_open()?;
        let id = ObserverId::next();
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in kinds {
            self.attach(id, *kind, Observer::Channel(tx.clone()));
        }
        Ok(EventReceiver::new(id, rx))
    }

    /// Retire toutes les entrées de l'abonnement `id`
    pub fn off(&mut self, id: ObserverId) -> bool {
        let staged = self.staged.remove(id);
        let live = self
            .pipeline
            .as_ref()
            .map(|pipeline| pipeline.unregister(id))
            .unwrap_or(false);
        staged || live
    }

    /// Construit le premier pipeline à l'offset 0 et lance l'émission
    pub fn start(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.pipeline.is_some() {
            return Err(RtStreamError::InvalidState("stream is already started"));
        }

        let pipeline = Pipeline::spawn(self.source.clone(), &self.config, 0, self.staged.clone())?;
        self.staged = ObserverRegistry::new();
        pipeline.start()?;
        self.pipeline = Some(pipeline);

        info!("RtStream started ({:.0} bytes/s)", self.config.bitrate.bytes_per_sec());
        Ok(())
    }

    /// Suspend l'émission ; sans effet si déjà en pause
    pub fn pause(&self) -> Result<()> {
        self.active()?.pause()?;
        Ok(())
    }

    /// Reprend l'émission ; sans effet si déjà en cours
    pub fn resume(&self) -> Result<()> {
        self.active()?.resume()?;
        Ok(())
    }

    /// Repositionne la lecture à `offset`
    ///
    /// Le pipeline courant est détaché avant la construction du nouveau :
    /// aucun événement de l'ancien pipeline ne peut suivre cet appel. Un
    /// flux en pause reste en pause. Un offset au-delà de la fin donne un
    /// `End` immédiat au démarrage de l'émission.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.ensure_outside_dispatch()?;
        self.active()?;
        Handle::try_current().map_err(|_| RtStreamError::NoRuntime)?;

        let Some(mut old) = self.pipeline.take() else {
            return Err(RtStreamError::InvalidState("stream is not started"));
        };
        let registry = old.snapshot_caller_owned();
        let paused = old.pacer_state() == PacerState::Paused;
        debug!(
            "RtStream: leaving pipeline at offset {} (position {})",
            old.offset(),
            old.position()
        );
        old.detach();
        drop(old);

        let pipeline = Pipeline::spawn(self.source.clone(), &self.config, offset, registry)?;
        if paused {
            pipeline.hold();
        } else {
            pipeline.start()?;
        }
        self.pipeline = Some(pipeline);

        info!("RtStream: seek to offset {}{}", offset, if paused { " (paused)" } else { "" });
        Ok(())
    }

    /// Ferme le flux : `Unsubscribe` puis `Close`, idempotent
    pub fn close(&mut self) -> Result<()> {
        self.ensure_outside_dispatch()?;
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.pipeline.take() {
            Some(mut pipeline) => pipeline.shutdown(),
            None => {
                let endpoint = Endpoint::new(std::mem::take(&mut self.staged));
                endpoint.detach_after([StreamEvent::Unsubscribe, StreamEvent::Close]);
            }
        }
        info!("RtStream closed");
        Ok(())
    }

    pub fn state(&self) -> StreamState {
        if self.closed {
            return StreamState::Closed;
        }
        let Some(pipeline) = &self.pipeline else {
            return StreamState::NotStarted;
        };
        match pipeline.outcome() {
            Outcome::Ended => StreamState::Ended,
            Outcome::Failed => StreamState::Failed,
            Outcome::Running => match pipeline.pacer_state() {
                PacerState::Paused => StreamState::Paused,
                _ => StreamState::Running,
            },
        }
    }

    /// Offset de départ du pipeline courant (0 avant `start`)
    pub fn offset(&self) -> u64 {
        self.pipeline.as_ref().map(Pipeline::offset).unwrap_or(0)
    }

    /// Offset source du prochain chunk à émettre
    pub fn position(&self) -> u64 {
        self.pipeline.as_ref().map(Pipeline::position).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Bitrate, source::MemoryByteSource};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };
    use std::time::Duration;

    fn stream(len: usize) -> RtStream {
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        let config = StreamConfig::new(Bitrate::from_bytes_per_sec(1_000)).with_chunk_size(10);
        RtStream::new(Arc::new(MemoryByteSource::new(data)), config).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = StreamConfig::new(Bitrate::from_bytes_per_sec(1_000)).with_chunk_size(0);
        let source = Arc::new(MemoryByteSource::new(vec![0u8; 4]));
        assert!(matches!(
            RtStream::new(source, config).err(),
            Some(RtStreamError::Config(_))
        ));
    }

    #[test]
    fn test_commands_before_start() {
        let mut stream = stream(100);
        assert_eq!(stream.state(), StreamState::NotStarted);
        assert!(stream.pause().unwrap_err().is_invalid_state());
        assert!(stream.resume().unwrap_err().is_invalid_state());
        assert!(stream.seek(10).unwrap_err().is_invalid_state());
        assert_eq!(stream.offset(), 0);
    }

    #[test]
    fn test_start_without_runtime_keeps_observers() {
        let mut stream = stream(100);
        stream.on(EventKind::Data, |_| {}).unwrap();
        assert!(matches!(stream.start(), Err(RtStreamError::NoRuntime)));
        assert_eq!(stream.staged.len(), 1);
        assert_eq!(stream.state(), StreamState::NotStarted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_is_rejected() {
        let mut stream = stream(100);
        stream.start().unwrap();
        assert!(stream.start().unwrap_err().is_invalid_state());
        assert_eq!(stream.state(), StreamState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_staged_observers_move_to_pipeline() {
        let mut stream = stream(30);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        stream
            .on(EventKind::Data, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        stream.start().unwrap();
        assert!(stream.staged.is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(stream.state(), StreamState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_removes_subscription() {
        let mut stream = stream(30);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = stream
            .on(EventKind::Data, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        stream.start().unwrap();

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(stream.off(id));
        assert!(!stream.off(id));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_state_and_seek_keeps_pause() {
        let mut stream = stream(100);
        let mut events = stream.subscribe(&[EventKind::Data, EventKind::Pause]).unwrap();
        stream.start().unwrap();

        stream.pause().unwrap();
        assert_eq!(stream.state(), StreamState::Paused);
        tokio::time::sleep(Duration::from_millis(1)).await;

        stream.seek(50).unwrap();
        assert_eq!(stream.state(), StreamState::Paused);
        assert_eq!(stream.offset(), 50);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // seul l'événement Pause de l'ancien pipeline a été reçu
        assert!(matches!(events.try_recv(), Ok(StreamEvent::Pause)));
        assert!(events.try_recv().is_err());

        stream.resume().unwrap();
        match events.recv().await {
            Some(StreamEvent::Data(chunk)) => assert_eq!(chunk.offset(), 50),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_after_end_restarts() {
        let mut stream = stream(20);
        let ends = Arc::new(AtomicUsize::new(0));
        let counter = ends.clone();
        stream
            .on(EventKind::End, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        stream.start().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(stream.state(), StreamState::Ended);

        stream.seek(10).unwrap();
        assert_eq!(stream.state(), StreamState::Running);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ends.load(Ordering::SeqCst), 2);
        assert_eq!(stream.position(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_emits_unsubscribe_then_close_once() {
        let mut stream = stream(100);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Unsubscribe, EventKind::Close] {
            let seen = seen.clone();
            stream
                .on(kind, move |event| seen.lock().unwrap().push(event.kind()))
                .unwrap();
        }
        stream.start().unwrap();

        stream.close().unwrap();
        stream.close().unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::Unsubscribe, EventKind::Close]
        );

        assert!(stream.pause().unwrap_err().is_invalid_state());
        assert!(stream.resume().unwrap_err().is_invalid_state());
        assert!(stream.seek(0).unwrap_err().is_invalid_state());
        assert!(stream.start().unwrap_err().is_invalid_state());
        assert!(stream.on(EventKind::Data, |_| {}).unwrap_err().is_invalid_state());
    }

    #[test]
    fn test_close_before_start_notifies_staged_observers() {
        let mut stream = stream(100);
        let mut events = stream.subscribe(&[EventKind::Close]).unwrap();
        stream.close().unwrap();
        assert!(matches!(events.try_recv(), Ok(StreamEvent::Close)));
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_and_close_from_callback_are_rejected() {
        let shared = Arc::new(Mutex::new(stream(100)));
        let rejected = Arc::new(AtomicUsize::new(0));
        let handle = shared.clone();
        let counter = rejected.clone();
        shared
            .lock()
            .unwrap()
            .on(EventKind::Data, move |_| {
                let mut stream = handle.lock().unwrap();
                if stream.seek(0).is_err_and(|e| e.is_invalid_state()) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                if stream.close().is_err_and(|e| e.is_invalid_state()) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
        shared.lock().unwrap().start().unwrap();

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(rejected.load(Ordering::SeqCst), 2);

        // le flux n'a été ni repositionné ni fermé par le callback
        let mut stream = shared.lock().unwrap();
        assert_eq!(stream.state(), StreamState::Running);
        assert_eq!(stream.offset(), 0);
        assert_eq!(stream.position(), 10);
        stream.close().unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
    }
}
