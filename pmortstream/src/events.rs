//! Événements push-stream et registre d'observateurs
//!
//! Le consommateur s'abonne à des types d'événements ([`EventKind`]) soit
//! par callback ([`RtStream::on`](crate::RtStream::on)), soit par channel
//! ([`RtStream::subscribe`](crate::RtStream::subscribe)). Chaque pipeline
//! expose un [`Endpoint`] qui diffuse les événements dans l'ordre.
//!
//! Les entrées du registre sont marquées par leur origine : seules les
//! entrées [`ObserverOrigin::Caller`] sont transplantées lors d'un `seek`,
//! les entrées [`ObserverOrigin::Internal`] appartiennent au pipeline.

use crate::{Chunk, RtStreamError};
use std::{
    cell::Cell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::mpsc;

/// Types d'événements observables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Data,
    End,
    Error,
    Close,
    PreFinish,
    Finish,
    Drain,
    Unsubscribe,
    Pause,
    Resume,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::Data,
        EventKind::End,
        EventKind::Error,
        EventKind::Close,
        EventKind::PreFinish,
        EventKind::Finish,
        EventKind::Drain,
        EventKind::Unsubscribe,
        EventKind::Pause,
        EventKind::Resume,
    ];

    /// Événements liés au cycle de vie du branchement du flux
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EventKind::End
                | EventKind::Error
                | EventKind::Close
                | EventKind::PreFinish
                | EventKind::Finish
                | EventKind::Drain
                | EventKind::Unsubscribe
        )
    }
}

/// Événement diffusé aux observateurs
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Chunk émis par le pacer
    Data(Chunk),
    /// Source entièrement lue et dernier chunk prêt, juste avant `End`
    PreFinish,
    Finish,
    /// Dernier chunk émis
    End,
    /// Échec de lecture ; au plus une fois par pipeline
    Error(Arc<RtStreamError>),
    Close,
    /// Le lecteur a pu reprendre l'écriture après un channel plein
    Drain,
    /// Le consommateur a été détaché du flux
    Unsubscribe,
    Pause,
    Resume,
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::Data(_) => EventKind::Data,
            StreamEvent::PreFinish => EventKind::PreFinish,
            StreamEvent::Finish => EventKind::Finish,
            StreamEvent::End => EventKind::End,
            StreamEvent::Error(_) => EventKind::Error,
            StreamEvent::Close => EventKind::Close,
            StreamEvent::Drain => EventKind::Drain,
            StreamEvent::Unsubscribe => EventKind::Unsubscribe,
            StreamEvent::Pause => EventKind::Pause,
            StreamEvent::Resume => EventKind::Resume,
        }
    }
}

/// Callback d'observateur
pub type Callback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Identifiant d'un abonnement, stable à travers les `seek`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

impl ObserverId {
    pub(crate) fn next() -> Self {
        Self(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Propriétaire logique d'une entrée du registre
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserverOrigin {
    /// Enregistrée par l'appelant ; survit aux reconstructions
    Caller,
    /// Câblage interne du pipeline ; détruite avec lui
    Internal,
}

#[derive(Clone)]
pub(crate) enum Observer {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<StreamEvent>),
}

impl Observer {
    fn is_alive(&self) -> bool {
        match self {
            Observer::Callback(_) => true,
            Observer::Channel(tx) => !tx.is_closed(),
        }
    }

    fn deliver(&self, event: &StreamEvent) {
        match self {
            Observer::Callback(cb) => cb(event),
            Observer::Channel(tx) => {
                // Receiver fermé : l'entrée sera purgée au prochain dispatch
                let _ = tx.send(event.clone());
            }
        }
    }
}

#[derive(Clone)]
struct ObserverEntry {
    id: ObserverId,
    kind: EventKind,
    origin: ObserverOrigin,
    observer: Observer,
}

/// Ensemble des couples (type d'événement, observateur) d'un endpoint
#[derive(Clone, Default)]
pub(crate) struct ObserverRegistry {
    entries: Vec<ObserverEntry>,
}

impl ObserverRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(
        &mut self,
        id: ObserverId,
        kind: EventKind,
        origin: ObserverOrigin,
        observer: Observer,
    ) {
        self.entries.push(ObserverEntry {
            id,
            kind,
            origin,
            observer,
        });
    }

    /// Retire toutes les entrées portant `id`
    pub(crate) fn remove(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    /// Nombre d'entrées pour un type d'événement, toutes origines confondues
    #[cfg(test)]
    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    /// Nombre d'entrées enregistrées par l'appelant
    #[cfg(test)]
    pub(crate) fn caller_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.origin == ObserverOrigin::Caller)
            .count()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copie des seules entrées de l'appelant, dans leur ordre d'enregistrement
    pub(crate) fn snapshot_caller_owned(&self) -> ObserverRegistry {
        ObserverRegistry {
            entries: self
                .entries
                .iter()
                .filter(|e| e.origin == ObserverOrigin::Caller)
                .cloned()
                .collect(),
        }
    }

    /// Rattache les entrées de `other` après les entrées existantes
    pub(crate) fn extend(&mut self, other: ObserverRegistry) {
        self.entries.extend(other.entries);
    }

    /// Observateurs vivants pour `kind`, en purgeant les channels fermés
    fn observers_for(&mut self, kind: EventKind) -> Vec<Observer> {
        self.entries.retain(|e| e.observer.is_alive());
        self.entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.observer.clone())
            .collect()
    }
}

/// Receiver pour consommer des événements depuis un channel
pub struct EventReceiver {
    id: ObserverId,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl EventReceiver {
    pub(crate) fn new(id: ObserverId, rx: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self { id, rx }
    }

    /// Identifiant à passer à [`RtStream::off`](crate::RtStream::off)
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Attend le prochain événement
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Tente de recevoir un événement sans bloquer
    pub fn try_recv(&mut self) -> Result<StreamEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

#[derive(Debug, Default)]
struct Gate {
    detached: bool,
    errored: bool,
    ended: bool,
    closed: bool,
}

thread_local! {
    /// Profondeur de dispatch du thread courant
    static DISPATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Vrai si le thread courant est en train de livrer un événement
///
/// Un callback qui appellerait `seek` ou `close` reprendrait le verrou
/// `gate` déjà tenu par le dispatch en cours.
pub(crate) fn in_dispatch() -> bool {
    DISPATCH_DEPTH.with(|depth| depth.get() > 0)
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DispatchGuard
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Point d'exposition d'un pipeline
///
/// `gate` est tenu pendant toute la durée d'un dispatch ; `detach` prend le
/// même verrou, donc aucune émission ne peut suivre le détachement.
/// `seek` et `close` appelés depuis un callback sont refusés
/// (voir [`in_dispatch`]).
pub(crate) struct Endpoint {
    registry: Mutex<ObserverRegistry>,
    gate: Mutex<Gate>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Endpoint {
    pub(crate) fn new(registry: ObserverRegistry) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(registry),
            gate: Mutex::new(Gate::default()),
        })
    }

    pub(crate) fn register(
        &self,
        kind: EventKind,
        origin: ObserverOrigin,
        observer: Observer,
    ) -> ObserverId {
        let id = ObserverId::next();
        lock(&self.registry).insert(id, kind, origin, observer);
        id
    }

    pub(crate) fn register_with_id(
        &self,
        id: ObserverId,
        kind: EventKind,
        origin: ObserverOrigin,
        observer: Observer,
    ) {
        lock(&self.registry).insert(id, kind, origin, observer);
    }

    pub(crate) fn unregister(&self, id: ObserverId) -> bool {
        lock(&self.registry).remove(id)
    }

    pub(crate) fn snapshot_caller_owned(&self) -> ObserverRegistry {
        lock(&self.registry).snapshot_caller_owned()
    }

    #[cfg(test)]
    pub(crate) fn registry_len(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Rattache les entrées de `registry` après les entrées existantes
    pub(crate) fn extend(&self, registry: ObserverRegistry) {
        lock(&self.registry).extend(registry);
    }

    /// Diffuse `event` ; renvoie `false` si l'événement a été supprimé
    pub(crate) fn emit(&self, event: StreamEvent) -> bool {
        let mut gate = lock(&self.gate);
        self.dispatch(&mut gate, event)
    }

    /// Diffuse les derniers événements puis détache, sous un même verrou
    pub(crate) fn detach_after<I>(&self, events: I)
    where
        I: IntoIterator<Item = StreamEvent>,
    {
        let mut gate = lock(&self.gate);
        for event in events {
            self.dispatch(&mut gate, event);
        }
        gate.detached = true;
    }

    fn dispatch(&self, gate: &mut Gate, event: StreamEvent) -> bool {
        if gate.detached {
            return false;
        }

        let kind = event.kind();
        match kind {
            EventKind::Data | EventKind::End if gate.errored || gate.ended => return false,
            EventKind::Error if gate.errored => return false,
            EventKind::Close if gate.closed => return false,
            _ => {}
        }
        match kind {
            EventKind::Error => gate.errored = true,
            EventKind::End => gate.ended = true,
            EventKind::Close => gate.closed = true,
            _ => {}
        }

        let observers = lock(&self.registry).observers_for(kind);
        let _guard = DispatchGuard::enter();
        for observer in &observers {
            observer.deliver(&event);
        }
        true
    }

    /// Coupe définitivement la diffusion
    pub(crate) fn detach(&self) {
        lock(&self.gate).detached = true;
    }

    pub(crate) fn is_detached(&self) -> bool {
        lock(&self.gate).detached
    }
}
