//! Participant-side synchronization.
//!
//! [`SyncClient`] applies local intents to its [`Replica`] immediately, records
//! them for undo and queues the matching operation for the server. Server
//! traffic is reconciled through [`SyncClient::receive`].
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    CollaborationError, Element, ElementId, ElementPatch, Operation, OperationKind, Point,
    PresenceTracker, Replica, Result, SessionId, SyncMessage, UndoManager, UserId,
};

/// Client for one document session
#[derive(Debug)]
pub struct SyncClient {
    session_id: SessionId,
    user_id: UserId,
    replica: Replica,
    undo: UndoManager,
    presence: PresenceTracker,
    tx: mpsc::UnboundedSender<SyncMessage>,
    presence_interval: Duration,
    last_presence: Option<Instant>,
    /// Set between `join` and the matching `session_state`
    awaiting_baseline: bool,
    /// Local edits sent while awaiting the baseline; replayed on top of it
    pending: Vec<Operation>,
}

impl SyncClient {
    /// Minimum spacing between cursor broadcasts
    pub const PRESENCE_INTERVAL: Duration = Duration::from_millis(50);

    /// Create a client; the receiver yields messages bound for the server
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
    ) -> (Self, mpsc::UnboundedReceiver<SyncMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let client = Self {
            session_id,
            user_id,
            replica: Replica::new(),
            undo: UndoManager::new(),
            presence: PresenceTracker::new(),
            tx,
            presence_interval: Self::PRESENCE_INTERVAL,
            last_presence: None,
            awaiting_baseline: false,
            pending: Vec::new(),
        };

        (client, rx)
    }

    pub fn with_presence_interval(mut self, interval: Duration) -> Self {
        self.presence_interval = interval;
        self
    }

    pub fn with_undo_levels(mut self, max_levels: usize) -> Self {
        self.undo = UndoManager::with_max_levels(max_levels);
        self
    }

    pub fn join(&mut self) -> Result<()> {
        self.send(SyncMessage::JoinSession {
            session_id: self.session_id.clone(),
        })?;
        self.awaiting_baseline = true;
        self.pending.clear();
        Ok(())
    }

    /// Locks only change through lock/unlock, so any carried lock is dropped
    pub fn create(&mut self, mut element: Element) -> Result<()> {
        element.validate()?;
        element.locked_by = None;
        self.commit(OperationKind::Create { element }, true)
    }

    /// Edit recorded for undo
    pub fn update(&mut self, element_id: ElementId, patch: ElementPatch) -> Result<()> {
        self.commit(OperationKind::Update { element_id, patch }, true)
    }

    /// Intermediate edit (live drag or resize); sent but not recorded
    pub fn update_transient(&mut self, element_id: ElementId, patch: ElementPatch) -> Result<()> {
        self.commit(OperationKind::Update { element_id, patch }, false)
    }

    /// Delete, capturing the element so the deletion can be undone
    pub fn delete(&mut self, element_id: ElementId) -> Result<()> {
        let Some(snapshot) = self.replica.get(&element_id).cloned() else {
            debug!("Delete of unknown element {} skipped", element_id);
            return Ok(());
        };

        self.commit(
            OperationKind::Delete {
                element_id,
                snapshot: Some(snapshot),
            },
            true,
        )
    }

    /// Lock state is decided by the server, so only the echo changes the replica
    pub fn lock(&self, element_id: ElementId) -> Result<()> {
        self.send_operation(self.operation(OperationKind::Lock { element_id }))
    }

    pub fn unlock(&self, element_id: ElementId) -> Result<()> {
        self.send_operation(self.operation(OperationKind::Unlock { element_id }))
    }

    /// Broadcast the cursor unless one went out within the presence interval.
    ///
    /// Returns whether the position was sent.
    pub fn move_cursor(&mut self, cursor: Point) -> Result<bool> {
        let now = Instant::now();
        if let Some(last) = self.last_presence {
            if now.duration_since(last) < self.presence_interval {
                trace!("Cursor update throttled");
                return Ok(false);
            }
        }

        self.send_operation(self.operation(OperationKind::Presence { cursor }))?;
        self.last_presence = Some(now);
        Ok(true)
    }

    /// Returns false when there is nothing to undo
    pub fn undo(&mut self) -> Result<bool> {
        match self.undo.undo(&mut self.replica) {
            Some(op) => self.send_edit(op).map(|_| true),
            None => Ok(false),
        }
    }

    /// Returns false when there is nothing to redo
    pub fn redo(&mut self) -> Result<bool> {
        match self.undo.redo(&mut self.replica) {
            Some(op) => self.send_edit(op).map(|_| true),
            None => Ok(false),
        }
    }

    /// Reconcile one message from the server
    pub fn receive(&mut self, msg: SyncMessage) -> Result<()> {
        match msg {
            SyncMessage::Connected { user_id } => {
                debug!("Server assigned participant id {}", user_id);
                self.user_id = user_id;
            }

            SyncMessage::SessionState {
                session_id,
                elements,
            } if session_id == self.session_id => {
                debug!("Baseline for {} with {} elements", session_id, elements.len());
                self.replica.reset(elements);

                // The snapshot predates these; the server applies them after it
                if self.awaiting_baseline {
                    for op in self.pending.drain(..) {
                        self.replica.apply(&op);
                    }
                    self.awaiting_baseline = false;
                }
            }

            SyncMessage::Operation { operation } if operation.session_id == self.session_id => {
                self.reconcile(operation);
            }

            SyncMessage::ParticipantLeft {
                session_id,
                user_id,
            } if session_id == self.session_id => {
                self.presence.remove(&user_id);
            }

            SyncMessage::Ping => self.send(SyncMessage::Pong)?,

            other => {
                trace!("Ignoring {} message", other.kind());
            }
        }

        Ok(())
    }

    fn reconcile(&mut self, op: Operation) {
        let own = op.user_id == self.user_id;

        if let OperationKind::Presence { cursor } = &op.kind {
            if !own {
                self.presence.update(&op.user_id, *cursor);
            }
            return;
        }

        // Own edits are already applied; lock state always follows the server
        if own && !op.kind.is_lock_state() {
            return;
        }

        self.replica.apply(&op);
    }

    /// Record (optionally), apply locally, then send
    fn commit(&mut self, kind: OperationKind, record: bool) -> Result<()> {
        let op = self.operation(kind);

        if record {
            self.undo.record(&op, &self.replica);
        }
        self.replica.apply(&op);

        self.send_edit(op)
    }

    /// Send an edit already applied to the replica
    fn send_edit(&mut self, op: Operation) -> Result<()> {
        if self.awaiting_baseline {
            self.pending.push(op.clone());
        }
        self.send_operation(op)
    }

    fn operation(&self, kind: OperationKind) -> Operation {
        Operation::new(self.session_id.clone(), self.user_id.clone(), kind)
    }

    fn send_operation(&self, operation: Operation) -> Result<()> {
        self.send(SyncMessage::Operation { operation })
    }

    fn send(&self, msg: SyncMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|e| CollaborationError::NetworkError(e.to_string()))
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn get(&self, id: &ElementId) -> Option<&Element> {
        self.replica.get(id)
    }

    /// Cursors of the other participants
    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }
}
