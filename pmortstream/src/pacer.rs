//! Pacer - libère les chunks au rythme du débit cible
//!
//! Le pacer est composé de deux parties :
//!
//! - [`PacingState`] : la machine à états pure (`Idle → Scheduled ⇄ Paused →
//!   Closed`), sans horloge propre, qui calcule les échéances et la
//!   correction de dérive à partir des instants qu'on lui fournit.
//! - [`Pacer`] : le handle partagé et la boucle Tokio qui attend l'échéance,
//!   récupère le chunk suivant et le diffuse sur l'endpoint du pipeline.
//!
//! # Correction de dérive
//!
//! À chaque émission, `spent` est le temps réellement consommé par
//! l'intervalle (pauses exclues, attente de l'amont incluse). L'écart
//! `spent - budget` est retranché du budget de l'intervalle suivant :
//!
//! ```text
//! budget(n+1) = base_delay - (spent(n) - budget(n))      (borné à 0)
//! ```
//!
//! Un budget nul provoque une émission immédiate ; l'intervalle d'après
//! retrouve alors `base_delay`. La dérive cumulée reste bornée par la
//! gigue d'un seul cycle.

use crate::{
    events::{Endpoint, StreamEvent},
    Chunk, Result, RtStreamError,
};
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Élément transmis par le lecteur au pacer
pub(crate) type Upstream = std::result::Result<Chunk, Arc<RtStreamError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerState {
    /// Construit, pas encore démarré
    Idle,
    /// Timer armé, en attente de la prochaine émission
    Scheduled,
    /// Timer désarmé, temps écoulé gelé
    Paused,
    /// Terminal
    Closed,
}

/// Effet d'une commande sur la machine à états
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed,
    Unchanged,
}

/// Mesure de dérive d'un cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drift {
    /// Temps réellement consommé par l'intervalle (hors pauses)
    pub spent: Duration,
    /// Budget de l'intervalle qui se termine
    pub budget: Duration,
    /// Budget armé pour l'intervalle suivant
    pub next_budget: Duration,
}

impl Drift {
    /// Dépassement signé en millisecondes (négatif si en avance)
    pub fn overshoot_ms(&self) -> f64 {
        (self.spent.as_secs_f64() - self.budget.as_secs_f64()) * 1000.0
    }
}

#[derive(Debug, Clone)]
pub struct PacingState {
    base_delay: Duration,
    budget: Duration,
    elapsed: Duration,
    armed_at: Option<Instant>,
    state: PacerState,
}

fn closed_error() -> RtStreamError {
    RtStreamError::InvalidState("pacer is closed")
}

impl PacingState {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            budget: base_delay,
            elapsed: Duration::ZERO,
            armed_at: None,
            state: PacerState::Idle,
        }
    }

    pub fn state(&self) -> PacerState {
        self.state
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Budget de l'intervalle courant après correction
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Temps déjà consommé dans l'intervalle, hors segment en cours
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Temps consommé dans l'intervalle à l'instant `now`
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        match (self.state, self.armed_at) {
            (PacerState::Scheduled, Some(armed)) => {
                self.elapsed + now.saturating_duration_since(armed)
            }
            _ => self.elapsed,
        }
    }

    /// Reste à attendre une fois le timer armé
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed)
    }

    /// Échéance de la prochaine émission (seulement en `Scheduled`)
    pub fn deadline(&self) -> Option<Instant> {
        match (self.state, self.armed_at) {
            (PacerState::Scheduled, Some(armed)) => Some(armed + self.remaining()),
            _ => None,
        }
    }

    pub fn start(&mut self, now: Instant) -> Result<Transition> {
        match self.state {
            PacerState::Idle => {
                self.budget = self.base_delay;
                self.elapsed = Duration::ZERO;
                self.arm_timer(now);
                Ok(Transition::Changed)
            }
            PacerState::Scheduled | PacerState::Paused => Ok(Transition::Unchanged),
            PacerState::Closed => Err(closed_error()),
        }
    }

    pub fn pause(&mut self, now: Instant) -> Result<Transition> {
        match self.state {
            PacerState::Scheduled => {
                if let Some(armed) = self.armed_at.take() {
                    self.elapsed += now.saturating_duration_since(armed);
                }
                self.state = PacerState::Paused;
                Ok(Transition::Changed)
            }
            PacerState::Idle => {
                self.state = PacerState::Paused;
                Ok(Transition::Changed)
            }
            PacerState::Paused => Ok(Transition::Unchanged),
            PacerState::Closed => Err(closed_error()),
        }
    }

    pub fn resume(&mut self, now: Instant) -> Result<Transition> {
        match self.state {
            PacerState::Paused => {
                self.arm_timer(now);
                Ok(Transition::Changed)
            }
            PacerState::Idle => self.start(now),
            PacerState::Scheduled => Ok(Transition::Unchanged),
            PacerState::Closed => Err(closed_error()),
        }
    }

    pub fn close(&mut self) -> Transition {
        if self.state == PacerState::Closed {
            return Transition::Unchanged;
        }
        self.armed_at = None;
        self.state = PacerState::Closed;
        Transition::Changed
    }

    /// Enregistre une émission à `now` et réarme l'intervalle suivant
    pub fn on_emit(&mut self, now: Instant) -> Result<Drift> {
        if self.state != PacerState::Scheduled {
            return Err(RtStreamError::InvalidState("pacer is not scheduled"));
        }

        let spent = self.elapsed_at(now);
        let budget = self.budget;
        let next_budget = if spent >= budget {
            self.base_delay.saturating_sub(spent - budget)
        } else {
            self.base_delay + (budget - spent)
        };

        self.budget = next_budget;
        self.elapsed = Duration::ZERO;
        self.arm_timer(now);

        Ok(Drift {
            spent,
            budget,
            next_budget,
        })
    }

    /// Seule opération d'armement : le timer expire après `remaining()`
    fn arm_timer(&mut self, now: Instant) {
        self.armed_at = Some(now);
        self.state = PacerState::Scheduled;
    }
}

struct Inner {
    pacing: PacingState,
    /// Événements Pause/Resume à diffuser par la boucle
    notices: VecDeque<StreamEvent>,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
    position: AtomicU64,
}

/// Handle du pacer d'un pipeline
///
/// Les commandes modifient l'état partagé puis réveillent la boucle ; les
/// événements `Pause`/`Resume` sont diffusés par la boucle elle-même, ce
/// qui permet d'appeler `pause()` depuis un observateur.
#[derive(Clone)]
pub struct Pacer {
    shared: Arc<Shared>,
}

impl Pacer {
    /// * `base_delay` - intervalle nominal entre deux chunks
    /// * `start_offset` - offset source du premier chunk attendu
    pub fn new(base_delay: Duration, start_offset: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    pacing: PacingState::new(base_delay),
                    notices: VecDeque::new(),
                }),
                wake: Notify::new(),
                position: AtomicU64::new(start_offset),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> PacerState {
        self.lock().pacing.state()
    }

    /// Copie de l'état de pacing courant
    pub fn snapshot(&self) -> PacingState {
        self.lock().pacing.clone()
    }

    /// Offset source du prochain chunk à émettre
    pub fn position(&self) -> u64 {
        self.shared.position.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> Result<Transition> {
        let transition = self.lock().pacing.start(Instant::now())?;
        self.shared.wake.notify_one();
        Ok(transition)
    }

    pub fn pause(&self) -> Result<Transition> {
        let transition = {
            let mut inner = self.lock();
            let transition = inner.pacing.pause(Instant::now())?;
            if transition == Transition::Changed {
                inner.notices.push_back(StreamEvent::Pause);
            }
            transition
        };
        self.shared.wake.notify_one();
        Ok(transition)
    }

    pub fn resume(&self) -> Result<Transition> {
        let transition = {
            let mut inner = self.lock();
            let was_paused = inner.pacing.state() == PacerState::Paused;
            let transition = inner.pacing.resume(Instant::now())?;
            if transition == Transition::Changed && was_paused {
                inner.notices.push_back(StreamEvent::Resume);
            }
            transition
        };
        self.shared.wake.notify_one();
        Ok(transition)
    }

    pub fn close(&self) {
        self.lock().pacing.close();
        self.shared.wake.notify_one();
    }

    /// Passe de `Idle` à `Paused` sans diffuser d'événement
    pub(crate) fn hold(&self) {
        let mut inner = self.lock();
        if inner.pacing.state() == PacerState::Idle {
            let _ = inner.pacing.pause(Instant::now());
        }
    }

    fn flush_notices(&self, endpoint: &Endpoint) {
        let notices: Vec<StreamEvent> = self.lock().notices.drain(..).collect();
        for event in notices {
            endpoint.emit(event);
        }
    }

    fn complete(&self, endpoint: &Endpoint) {
        self.flush_notices(endpoint);
        self.lock().pacing.close();
        info!(position = self.position(), "Pacer: end of source reached");
        endpoint.emit(StreamEvent::PreFinish);
        endpoint.emit(StreamEvent::Finish);
        endpoint.emit(StreamEvent::End);
        endpoint.emit(StreamEvent::Close);
    }

    fn fail(&self, endpoint: &Endpoint, err: Arc<RtStreamError>) {
        self.flush_notices(endpoint);
        self.lock().pacing.close();
        warn!(position = self.position(), "Pacer: upstream failed: {}", err);
        endpoint.emit(StreamEvent::Error(err));
        endpoint.emit(StreamEvent::Close);
    }

    /// Boucle d'émission
    ///
    /// Un seul timer est armé à la fois : l'échéance vient de
    /// [`PacingState::deadline`] et est réévaluée après chaque commande.
    pub(crate) async fn run(
        self,
        mut rx: mpsc::Receiver<Upstream>,
        endpoint: Arc<Endpoint>,
        cancel: CancellationToken,
    ) {
        debug!(
            "Pacer::run started (base_delay={:?}, offset={})",
            self.snapshot().base_delay(),
            self.position()
        );
        let mut lookahead: Option<Chunk> = None;

        loop {
            self.flush_notices(&endpoint);

            let (state, deadline) = {
                let inner = self.lock();
                (inner.pacing.state(), inner.pacing.deadline())
            };
            if state == PacerState::Closed {
                break;
            }
            let scheduled = state == PacerState::Scheduled;

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Pacer cancelled");
                    break;
                }

                _ = self.shared.wake.notified() => continue,

                item = rx.recv(), if scheduled && lookahead.is_none() => {
                    match item {
                        Some(Ok(chunk)) => {
                            lookahead = Some(chunk);
                            continue;
                        }
                        Some(Err(err)) => {
                            self.fail(&endpoint, err);
                            break;
                        }
                        None => {
                            self.complete(&endpoint);
                            break;
                        }
                    }
                }

                _ = wait_until(deadline), if lookahead.is_some() => {}
            }

            // Échéance atteinte avec un chunk en main. Une pause a pu
            // survenir entre-temps : on garde alors le chunk.
            let drift = match self.lock().pacing.on_emit(Instant::now()) {
                Ok(drift) => drift,
                Err(_) => continue,
            };
            let Some(chunk) = lookahead.take() else {
                continue;
            };

            trace!(
                offset = chunk.offset(),
                len = chunk.len(),
                overshoot_ms = drift.overshoot_ms(),
                next_budget_ms = drift.next_budget.as_secs_f64() * 1000.0,
                "Pacer: emitting chunk"
            );
            self.shared
                .position
                .store(chunk.end_offset(), Ordering::SeqCst);
            endpoint.emit(StreamEvent::Data(chunk));
        }

        debug!("Pacer::run finished (position={})", self.position());
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
