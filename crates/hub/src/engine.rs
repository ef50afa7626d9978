//! The engine task: sole owner of the [`Reconciler`].
//!
//! Transports, the simulator and the dispatcher talk to it through an
//! [`EngineHandle`], which pushes [`Input`]s onto a bounded queue. After
//! every input that changed state the task publishes a fresh
//! [`Snapshot`] on a `watch` channel.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::reconciler::{
    Applied, Change, Confirmation, InboundEvent, MutationId, Reconciler, Resolution, Rollback,
    Snapshot, Stamp, Tier,
};

/// Default depth of the input queue.
pub const QUEUE_DEPTH: usize = 256;

pub enum Input {
    Inbound(InboundEvent),
    Link {
        tier: Tier,
        connected: bool,
    },
    Propose {
        change: Change,
        at: OffsetDateTime,
        reply: oneshot::Sender<Result<MutationId, EngineError>>,
    },
    Commit {
        id: MutationId,
        confirmation: Confirmation,
        stamp: Stamp,
        reply: oneshot::Sender<Result<Resolution, EngineError>>,
    },
    Rollback {
        id: MutationId,
        reply: oneshot::Sender<Rollback>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Input>,
    snapshots: watch::Receiver<Arc<Snapshot>>,
}

impl EngineHandle {
    async fn send(&self, input: Input) -> Result<(), EngineError> {
        self.tx
            .send(input)
            .await
            .map_err(|_| EngineError::EngineStopped)
    }

    pub async fn apply_inbound(&self, event: InboundEvent) -> Result<(), EngineError> {
        self.send(Input::Inbound(event)).await
    }

    pub async fn set_link(&self, tier: Tier, connected: bool) -> Result<(), EngineError> {
        self.send(Input::Link { tier, connected }).await
    }

    pub async fn propose(&self, change: Change) -> Result<MutationId, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Propose {
            change,
            at: OffsetDateTime::now_utc(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    pub async fn commit(
        &self,
        id: MutationId,
        confirmation: Confirmation,
        stamp: Stamp,
    ) -> Result<Resolution, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Commit {
            id,
            confirmation,
            stamp,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    pub async fn rollback(&self, id: MutationId) -> Result<Rollback, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Input::Rollback { id, reply }).await?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    /// The latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    /// A fresh receiver for change notifications.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshots.clone()
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Start the engine task. Confirmed changes are forwarded to `store` when
/// given. While the store queue is full they wait in a backlog that keeps
/// only the newest record per concern, so the engine never stalls and the
/// store always catches up to the latest state.
pub fn spawn(
    reconciler: Reconciler,
    store: Option<mpsc::Sender<Applied>>,
) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let (snap_tx, snap_rx) = watch::channel(Arc::new(reconciler.snapshot()));
    let task = tokio::spawn(run(reconciler, rx, snap_tx, store));
    (
        EngineHandle {
            tx,
            snapshots: snap_rx,
        },
        task,
    )
}

async fn run(
    mut reconciler: Reconciler,
    mut rx: mpsc::Receiver<Input>,
    snapshots: watch::Sender<Arc<Snapshot>>,
    store: Option<mpsc::Sender<Applied>>,
) {
    info!("engine started");
    let mut backlog = Backlog::default();

    loop {
        tokio::select! {
            biased;
            input = rx.recv() => {
                let Some(input) = input else { break };
                handle(&mut reconciler, input, &snapshots, store.as_ref(), &mut backlog);
            }
            permit = reserve(store.as_ref()), if !backlog.is_empty() => match permit {
                Some(permit) => backlog.send_one(permit),
                None => backlog.abandon(),
            },
        }
    }

    info!("engine input queue closed; stopping");
}

/// Apply one input. Every arm settles (forwards to the store and publishes)
/// before replying, so a caller that awaits a reply always sees its own
/// effect in the next snapshot it reads.
fn handle(
    reconciler: &mut Reconciler,
    input: Input,
    snapshots: &watch::Sender<Arc<Snapshot>>,
    store: Option<&mpsc::Sender<Applied>>,
    backlog: &mut Backlog,
) {
    let mut settle = |reconciler: &mut Reconciler, changed: bool| {
        if let Some(store) = store {
            for record in reconciler.take_applied() {
                backlog.forward(store, record);
            }
        } else {
            reconciler.take_applied();
        }
        if changed {
            snapshots.send_replace(Arc::new(reconciler.snapshot()));
        }
    };

    match input {
        Input::Inbound(event) => {
            let changed = reconciler.apply_inbound(&event);
            settle(reconciler, changed);
        }
        Input::Link { tier, connected } => {
            let changed = reconciler.set_link(tier, connected);
            if changed {
                info!(?tier, connected, "transport link changed");
            }
            settle(reconciler, changed);
        }
        Input::Propose { change, at, reply } => {
            let result = reconciler.propose(change, at);
            settle(reconciler, result.is_ok());
            let _ = reply.send(result);
        }
        Input::Commit {
            id,
            confirmation,
            stamp,
            reply,
        } => {
            let result = reconciler.commit(id, confirmation, stamp);
            settle(reconciler, true);
            let _ = reply.send(result);
        }
        Input::Rollback { id, reply } => {
            let result = reconciler.rollback(id);
            settle(reconciler, result == Rollback::Restored);
            let _ = reply.send(result);
        }
    }
}

/// Resolves once the store queue has room. Never resolves without a store.
async fn reserve(store: Option<&mpsc::Sender<Applied>>) -> Option<mpsc::Permit<'_, Applied>> {
    match store {
        Some(tx) => tx.reserve().await.ok(),
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Store backlog
// ---------------------------------------------------------------------------

/// Records that did not fit in the store queue, at most one per concern.
#[derive(Default)]
struct Backlog {
    records: VecDeque<Applied>,
    /// Records replaced by a newer one of the same concern.
    superseded: u64,
}

impl Backlog {
    fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Send `record` now if the queue has room and nothing is waiting,
    /// otherwise park it.
    fn forward(&mut self, store: &mpsc::Sender<Applied>, record: Applied) {
        self.flush(store);
        if !self.records.is_empty() {
            self.park(record);
            return;
        }
        match store.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!("store queue full; keeping newest record per concern until it drains");
                self.park(record);
            }
            Err(TrySendError::Closed(_)) => debug!("store writer gone; record dropped"),
        }
    }

    fn park(&mut self, record: Applied) {
        let concern = mem::discriminant(&record);
        match self.records.iter_mut().find(|r| mem::discriminant(*r) == concern) {
            Some(slot) => {
                *slot = record;
                self.superseded += 1;
            }
            None => self.records.push_back(record),
        }
    }

    fn flush(&mut self, store: &mpsc::Sender<Applied>) {
        while let Some(record) = self.records.pop_front() {
            match store.try_send(record) {
                Ok(()) => {}
                Err(TrySendError::Full(record)) => {
                    self.records.push_front(record);
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    self.abandon();
                    return;
                }
            }
        }
        self.report_drained();
    }

    fn send_one(&mut self, permit: mpsc::Permit<'_, Applied>) {
        if let Some(record) = self.records.pop_front() {
            permit.send(record);
        }
        if self.records.is_empty() {
            self.report_drained();
        }
    }

    fn report_drained(&mut self) {
        if self.superseded > 0 {
            info!(superseded = self.superseded, "store backlog drained");
            self.superseded = 0;
        }
    }

    fn abandon(&mut self) {
        debug!(dropped = self.records.len(), "store writer gone; backlog dropped");
        self.records.clear();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
