//! Pipeline SourceReader → ChunkNormalizer → Pacer
//!
//! Un pipeline correspond à un couple (source, offset). Il n'est jamais
//! repositionné : un `seek` le détruit et en construit un nouveau.

use crate::{
    config::StreamConfig,
    events::{Endpoint, EventKind, Observer, ObserverId, ObserverOrigin, ObserverRegistry, StreamEvent},
    normalizer::ChunkNormalizer,
    pacer::{Pacer, PacerState, Transition, Upstream},
    source::{ByteSource, SourceReader},
    Result, RtStreamError,
};
use std::sync::{Arc, Mutex};
use tokio::{
    runtime::Handle,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Issue observée d'un pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Outcome {
    #[default]
    Running,
    Ended,
    Failed,
}

pub(crate) struct Pipeline {
    offset: u64,
    endpoint: Arc<Endpoint>,
    pacer: Pacer,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    outcome: Arc<Mutex<Outcome>>,
}

impl Pipeline {
    /// Construit le pipeline et lance ses deux tâches
    ///
    /// Le pacer reste `Idle` : l'appelant choisit ensuite entre
    /// [`Pipeline::start`] et [`Pipeline::hold`].
    pub(crate) fn spawn(
        source: Arc<dyn ByteSource>,
        config: &StreamConfig,
        offset: u64,
        registry: ObserverRegistry,
    ) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| RtStreamError::NoRuntime)?;

        // Câblage interne en tête : l'issue est connue avant que les
        // observateurs de l'appelant ne reçoivent End ou Error
        let endpoint = Endpoint::new(ObserverRegistry::new());
        let outcome = Arc::new(Mutex::new(Outcome::Running));
        for (kind, value) in [(EventKind::End, Outcome::Ended), (EventKind::Error, Outcome::Failed)] {
            let outcome = outcome.clone();
            endpoint.register(
                kind,
                ObserverOrigin::Internal,
                Observer::Callback(Arc::new(move |_: &StreamEvent| {
                    *outcome.lock().unwrap_or_else(|p| p.into_inner()) = value;
                })),
            );
        }

        endpoint.extend(registry);

        let pacer = Pacer::new(config.base_delay(), offset);
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(config.channel_size);

        let reader = SourceReader::new(source, offset, config.read_size);
        let normalizer = ChunkNormalizer::new(config.chunk_size, offset);

        let tasks = vec![
            handle.spawn(read_loop(reader, normalizer, tx, endpoint.clone(), cancel.clone())),
            handle.spawn(pacer.clone().run(rx, endpoint.clone(), cancel.clone())),
        ];

        info!(
            "Pipeline spawned at offset {} (chunk_size={}, base_delay={:?})",
            offset,
            config.chunk_size,
            config.base_delay()
        );

        Ok(Self {
            offset,
            endpoint,
            pacer,
            cancel,
            tasks,
            outcome,
        })
    }

    /// Offset de départ du pipeline
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset du prochain chunk à émettre
    pub(crate) fn position(&self) -> u64 {
        self.pacer.position()
    }

    pub(crate) fn pacer_state(&self) -> PacerState {
        self.pacer.state()
    }

    pub(crate) fn outcome(&self) -> Outcome {
        *self.outcome.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn start(&self) -> Result<Transition> {
        self.pacer.start()
    }

    /// Démarre en pause, sans événement `Pause`
    pub(crate) fn hold(&self) {
        self.pacer.hold();
    }

    pub(crate) fn pause(&self) -> Result<Transition> {
        self.pacer.pause()
    }

    pub(crate) fn resume(&self) -> Result<Transition> {
        self.pacer.resume()
    }

    pub(crate) fn register(&self, id: ObserverId, kind: EventKind, observer: Observer) {
        self.endpoint
            .register_with_id(id, kind, ObserverOrigin::Caller, observer);
    }

    pub(crate) fn unregister(&self, id: ObserverId) -> bool {
        self.endpoint.unregister(id)
    }

    pub(crate) fn snapshot_caller_owned(&self) -> ObserverRegistry {
        self.endpoint.snapshot_caller_owned()
    }

    /// Diffuse `Unsubscribe` puis `Close` et détache le pipeline
    pub(crate) fn shutdown(&mut self) {
        self.endpoint
            .detach_after([StreamEvent::Unsubscribe, StreamEvent::Close]);
        self.detach();
    }

    /// Détache le pipeline : plus aucune émission, tâches arrêtées
    pub(crate) fn detach(&mut self) {
        if self.endpoint.is_detached() && self.tasks.is_empty() {
            return;
        }
        self.endpoint.detach();
        self.cancel.cancel();
        self.pacer.close();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        debug!("Pipeline at offset {} detached", self.offset);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn read_loop(
    mut reader: SourceReader,
    mut normalizer: ChunkNormalizer,
    tx: mpsc::Sender<Upstream>,
    endpoint: Arc<Endpoint>,
    cancel: CancellationToken,
) {
    debug!("Reader started at offset {}", reader.position());

    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Reader cancelled at {}", reader.position());
                return;
            }
            read = reader.read_next() => read,
        };

        match read {
            Ok(bytes) if bytes.is_empty() => {
                if let Some(tail) = normalizer.finish() {
                    if !forward(&tx, Ok(tail), &endpoint, &cancel).await {
                        return;
                    }
                }
                // La fermeture du channel signale la fin au pacer
                debug!("Reader: source exhausted at {}", reader.position());
                return;
            }
            Ok(bytes) => {
                for chunk in normalizer.push(bytes) {
                    if !forward(&tx, Ok(chunk), &endpoint, &cancel).await {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("Reader: read failed at {}: {}", reader.position(), e);
                forward(&tx, Err(Arc::new(e)), &endpoint, &cancel).await;
                return;
            }
        }
    }
}

/// Envoie un élément au pacer ; `false` si le pipeline est arrêté
async fn forward(
    tx: &mpsc::Sender<Upstream>,
    item: Upstream,
    endpoint: &Endpoint,
    cancel: &CancellationToken,
) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(TrySendError::Closed(_)) => false,
        Err(TrySendError::Full(item)) => {
            trace!("Reader: channel full, waiting for the pacer");
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                res = tx.send(item) => res.is_ok(),
            };
            if sent {
                endpoint.emit(StreamEvent::Drain);
            }
            sent
        }
    }
}
