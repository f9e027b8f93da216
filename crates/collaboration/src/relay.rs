//! Operation relay: session membership, merge dispatch and fan-out.
//!
//! The relay owns the process-wide session registry. Sessions are created on
//! first join (loading from the repository) and live for the rest of the
//! process. Each session sits behind its own async mutex, so merging, fan-out
//! and write-through for one operation finish before the next operation for the
//! same session starts. Different sessions never wait on each other.
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OnceCell};
use tracing::{debug, error, info, warn};

use crate::{
    CollaborationError, DocumentRepository, DocumentState, MergeOutcome, Operation,
    OperationKind, PresenceTracker, Result, SessionId, SyncMessage, UserId,
};

type Outbox = mpsc::UnboundedSender<SyncMessage>;

/// Filled once the document has been loaded
type SessionSlot = Arc<OnceCell<Arc<Mutex<Session>>>>;

/// Server-side state of one document session
struct Session {
    id: SessionId,
    created_at: chrono::DateTime<chrono::Utc>,
    document: DocumentState,
    members: HashMap<UserId, Outbox>,
    presence: PresenceTracker,
}

impl Session {
    fn new(id: SessionId, document: DocumentState) -> Self {
        Self {
            id,
            created_at: chrono::Utc::now(),
            document,
            members: HashMap::new(),
            presence: PresenceTracker::new(),
        }
    }

    fn broadcast(&self, msg: &SyncMessage, exclude_user: Option<&UserId>) {
        for (user_id, tx) in &self.members {
            if Some(user_id) == exclude_user {
                continue;
            }

            // A closed outbox means the member is mid-disconnect
            if tx.send(msg.clone()).is_err() {
                debug!("Outbox of {} closed, skipping", user_id);
            }
        }
    }

    fn info(&self) -> SessionInfo {
        let mut participants: Vec<UserId> = self.members.keys().cloned().collect();
        participants.sort();

        SessionInfo {
            session_id: self.id.clone(),
            created_at: self.created_at,
            participants,
            elements: self.document.len(),
            locked_elements: self
                .document
                .elements()
                .values()
                .filter(|element| element.locked_by.is_some())
                .count(),
        }
    }
}

/// A live participant connection
struct Connection {
    tx: Outbox,
    sessions: HashSet<SessionId>,
}

/// Introspection view of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub participants: Vec<UserId>,
    pub elements: usize,
    pub locked_elements: usize,
}

/// Relay counters; protocol failures are silent toward clients and only show up here
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub sessions: usize,
    pub connections: usize,
    pub applied: u64,
    pub rejected: u64,
    pub ignored: u64,
    pub dropped: u64,
    pub persist_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    rejected: AtomicU64,
    ignored: AtomicU64,
    dropped: AtomicU64,
    persist_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Routes operations between the participants of each document session
pub struct Relay {
    repository: Arc<dyn DocumentRepository>,
    sessions: DashMap<SessionId, SessionSlot>,
    connections: DashMap<UserId, Connection>,
    counters: Counters,
}

impl Relay {
    pub fn new(repository: Arc<dyn DocumentRepository>) -> Self {
        Self {
            repository,
            sessions: DashMap::new(),
            connections: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Register a participant connection and announce its id
    pub fn connect(&self, user_id: UserId) -> mpsc::UnboundedReceiver<SyncMessage> {
        let (tx, rx) = mpsc::unbounded_channel();

        if let Err(e) = tx.send(SyncMessage::Connected {
            user_id: user_id.clone(),
        }) {
            debug!("Failed to announce id to {}: {}", user_id, e);
        }

        let previous = self.connections.insert(
            user_id.clone(),
            Connection {
                tx,
                sessions: HashSet::new(),
            },
        );
        if previous.is_some() {
            warn!("Participant {} reconnected over a live connection", user_id);
        }

        info!("Participant {} connected", user_id);
        rx
    }

    /// Dispatch one inbound protocol message
    pub async fn handle_message(&self, user_id: &UserId, msg: SyncMessage) -> Result<()> {
        match msg {
            SyncMessage::JoinSession { session_id } => self.join(user_id, session_id).await,

            SyncMessage::Operation { operation } => {
                self.submit(user_id, operation).await;
                Ok(())
            }

            SyncMessage::Ping => self.send_to(user_id, SyncMessage::Pong),

            SyncMessage::Pong => {
                debug!("Received pong from {}", user_id);
                Ok(())
            }

            other => {
                warn!("Unexpected {} message from {}", other.kind(), user_id);
                Counters::bump(&self.counters.dropped);
                Ok(())
            }
        }
    }

    /// Add the participant to a session and send it the current snapshot
    pub async fn join(&self, user_id: &UserId, session_id: SessionId) -> Result<()> {
        let tx = self
            .connections
            .get(user_id)
            .map(|conn| conn.tx.clone())
            .ok_or_else(|| CollaborationError::NetworkError(format!("{} is not connected", user_id)))?;

        let session = self.get_or_create_session(&session_id).await;
        {
            let mut session = session.lock().await;
            session.members.insert(user_id.clone(), tx.clone());

            tx.send(SyncMessage::SessionState {
                session_id: session_id.clone(),
                elements: session.document.snapshot(),
            })
            .map_err(|e| CollaborationError::NetworkError(e.to_string()))?;

            info!(
                "Participant {} joined session {} ({} elements, {} members)",
                user_id,
                session_id,
                session.document.len(),
                session.members.len()
            );
        }

        if let Some(mut conn) = self.connections.get_mut(user_id) {
            conn.sessions.insert(session_id);
        }

        Ok(())
    }

    /// Merge and fan out one operation from `user_id`
    pub async fn submit(&self, user_id: &UserId, mut op: Operation) {
        // Participants cannot speak for each other
        op.user_id = user_id.clone();

        let joined = self
            .connections
            .get(user_id)
            .map(|conn| conn.sessions.contains(&op.session_id))
            .unwrap_or(false);
        let session = self.live_session(&op.session_id);

        let session = match session {
            Some(session) if joined => session,
            _ => {
                debug!(
                    "Dropping {} from {} for unjoined session {}",
                    op.kind.action(),
                    user_id,
                    op.session_id
                );
                Counters::bump(&self.counters.dropped);
                return;
            }
        };

        let mut session = session.lock().await;

        if let OperationKind::Presence { cursor } = &op.kind {
            session.presence.update(user_id, *cursor);
            session.broadcast(&SyncMessage::Operation { operation: op.clone() }, Some(user_id));
            return;
        }

        let action = op.kind.action();
        match session.document.apply(op) {
            MergeOutcome::Applied(op) => {
                Counters::bump(&self.counters.applied);
                debug!(
                    "Applied {} on {:?} from {} in session {}",
                    action,
                    op.element_id(),
                    user_id,
                    session.id
                );

                session.broadcast(&SyncMessage::Operation { operation: op }, None);
                self.write_through(&session).await;
            }
            MergeOutcome::Rejected(reason) => {
                Counters::bump(&self.counters.rejected);
                info!("Rejected {} from {}: {:?}", action, user_id, reason);
            }
            MergeOutcome::Ignored(reason) => {
                Counters::bump(&self.counters.ignored);
                debug!("Ignored {} from {}: {:?}", action, user_id, reason);
            }
        }
    }

    /// Remove the participant everywhere, releasing every lock it held
    pub async fn disconnect(&self, user_id: &UserId) {
        let Some((_, conn)) = self.connections.remove(user_id) else {
            return;
        };

        for session_id in conn.sessions {
            let Some(session) = self.live_session(&session_id) else {
                continue;
            };
            let mut session = session.lock().await;

            session.members.remove(user_id);
            session.presence.remove(user_id);

            session.broadcast(
                &SyncMessage::ParticipantLeft {
                    session_id: session_id.clone(),
                    user_id: user_id.clone(),
                },
                None,
            );

            let unlocks = session.document.force_unlock_all(&session_id, user_id);
            if !unlocks.is_empty() {
                info!(
                    "Released {} locks held by {} in session {}",
                    unlocks.len(),
                    user_id,
                    session_id
                );
                for op in unlocks {
                    session.broadcast(&SyncMessage::Operation { operation: op }, None);
                }
                self.write_through(&session).await;
            }

            info!("Participant {} left session {}", user_id, session_id);
        }

        info!("Participant {} disconnected", user_id);
    }

    /// Ids of every live session
    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|slot| slot.value().initialized())
            .map(|slot| slot.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn session_info(&self, session_id: &SessionId) -> Option<SessionInfo> {
        let session = self.live_session(session_id)?;
        let session = session.lock().await;
        Some(session.info())
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            sessions: self
                .sessions
                .iter()
                .filter(|slot| slot.value().initialized())
                .count(),
            connections: self.connections.len(),
            applied: self.counters.applied.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            ignored: self.counters.ignored.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
        }
    }

    fn send_to(&self, user_id: &UserId, msg: SyncMessage) -> Result<()> {
        let conn = self
            .connections
            .get(user_id)
            .ok_or_else(|| CollaborationError::NetworkError(format!("{} is not connected", user_id)))?;

        conn.tx
            .send(msg)
            .map_err(|e| CollaborationError::NetworkError(e.to_string()))
    }

    fn live_session(&self, session_id: &SessionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions
            .get(session_id)
            .and_then(|slot| slot.value().get().cloned())
    }

    /// Only joins of the same session wait on its load
    async fn get_or_create_session(&self, session_id: &SessionId) -> Arc<Mutex<Session>> {
        let slot = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        slot.get_or_init(|| async {
            let document = match self.repository.load(session_id).await {
                Ok(Some(persisted)) => DocumentState::from_persisted(persisted),
                Ok(None) => DocumentState::new(),
                Err(e) => {
                    error!("Failed to load session {}, starting empty: {}", session_id, e);
                    DocumentState::new()
                }
            };

            info!("Creating session {} ({} elements)", session_id, document.len());
            Arc::new(Mutex::new(Session::new(session_id.clone(), document)))
        })
        .await
        .clone()
    }

    /// Persist the session; failures leave memory as is and are only counted
    async fn write_through(&self, session: &Session) {
        let persisted = session.document.to_persisted();
        if let Err(e) = self.repository.save(&session.id, &persisted).await {
            Counters::bump(&self.counters.persist_failures);
            error!("Failed to persist session {}: {}", session.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Element, ElementId, ElementPatch, MemoryRepository, PersistedDocument, Point};
    use async_trait::async_trait;

    fn session_id() -> SessionId {
        SessionId::parse("board").unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SyncMessage>) -> Vec<SyncMessage> {
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }
        messages
    }

    fn operations(messages: &[SyncMessage]) -> Vec<&Operation> {
        messages
            .iter()
            .filter_map(|msg| match msg {
                SyncMessage::Operation { operation } => Some(operation),
                _ => None,
            })
            .collect()
    }

    async fn joined(relay: &Relay, name: &str) -> (UserId, mpsc::UnboundedReceiver<SyncMessage>) {
        let user = UserId::from(name);
        let mut rx = relay.connect(user.clone());
        relay.join(&user, session_id()).await.unwrap();
        drain(&mut rx);
        (user, rx)
    }

    fn op(user: &UserId, kind: OperationKind) -> Operation {
        Operation::new(session_id(), user.clone(), kind)
    }

    fn create_rect(user: &UserId, id: &str) -> Operation {
        op(
            user,
            OperationKind::Create {
                element: Element::rectangle(0.0, 0.0, 10.0, 10.0).with_id(id),
            },
        )
    }

    fn lock(user: &UserId, id: &str) -> Operation {
        op(
            user,
            OperationKind::Lock {
                element_id: ElementId::from(id),
            },
        )
    }

    #[tokio::test]
    async fn test_connect_announces_id_and_join_sends_snapshot() {
        let relay = Relay::new(Arc::new(MemoryRepository::new()));
        let alice = UserId::from("alice");
        let mut rx = relay.connect(alice.clone());

        assert_eq!(
            rx.recv().await,
            Some(SyncMessage::Connected {
                user_id: alice.clone()
            })
        );

        tokio_test::assert_ok!(relay.join(&alice, session_id()).await);
        match rx.recv().await {
            Some(SyncMessage::SessionState {
                session_id: sid,
                elements,
            }) => {
                assert_eq!(sid, session_id());
                assert!(elements.is_empty());
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_applied_operations_reach_everyone_including_sender() {
        let relay = Relay::new(Arc::new(MemoryRepository::new()));
        let (alice, mut alice_rx) = joined(&relay, "alice").await;
        let (_bob, mut bob_rx) = joined(&relay, "bob").await;

        relay.submit(&alice, create_rect(&alice, "r")).await;

        let to_alice = drain(&mut alice_rx);
        let to_bob = drain(&mut bob_rx);
        assert_eq!(operations(&to_alice).len(), 1);
        assert_eq!(operations(&to_bob).len(), 1);
        assert!(operations(&to_bob)[0].server_timestamp.is_some());
        assert_eq!(relay.stats().applied, 1);
    }

    #[tokio::test]
    async fn test_presence_goes_to_others_only() {
        let relay = Relay::new(Arc::new(MemoryRepository::new()));
        let (alice, mut alice_rx) = joined(&relay, "alice").await;
        let (_bob, mut bob_rx) = joined(&relay, "bob").await;

        relay
            .submit(
                &alice,
                op(
                    &alice,
                    OperationKind::Presence {
                        cursor: Point(3.0, 4.0),
                    },
                ),
            )
            .await;

        assert!(drain(&mut alice_rx).is_empty());
        let to_bob = drain(&mut bob_rx);
        assert_eq!(operations(&to_bob).len(), 1);
        assert!(operations(&to_bob)[0].kind.is_presence());
    }

    #[tokio::test]
    async fn test_relay_overwrites_claimed_origin() {
        let relay = Relay::new(Arc::new(MemoryRepository::new()));
        let (alice, mut alice_rx) = joined(&relay, "alice").await;

        let forged = create_rect(&UserId::from("mallory"), "r");
        relay.submit(&alice, forged).await;

        let echoed = drain(&mut alice_rx);
        assert_eq!(operations(&echoed)[0].user_id, alice);
    }

    #[tokio::test]
    async fn test_unjoined_session_is_dropped() {
        let relay = Relay::new(Arc::new(MemoryRepository::new()));
        let carol = UserId::from("carol");
        let mut rx = relay.connect(carol.clone());
        drain(&mut rx);

        relay.submit(&carol, create_rect(&carol, "r")).await;

        assert!(drain(&mut rx).is_empty());
        assert!(relay.sessions().is_empty());
        assert_eq!(relay.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_lock_conflict_is_silent() {
        let relay = Relay::new(Arc::new(MemoryRepository::new()));
        let (alice, mut alice_rx) = joined(&relay, "alice").await;
        let (bob, mut bob_rx) = joined(&relay, "bob").await;

        relay.submit(&alice, create_rect(&alice, "r")).await;
        relay.submit(&alice, lock(&alice, "r")).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        relay.submit(&bob, lock(&bob, "r")).await;

        assert!(drain(&mut alice_rx).is_empty());
        assert!(drain(&mut bob_rx).is_empty());
        assert_eq!(relay.stats().rejected, 1);

        let info = relay.session_info(&session_id()).await.unwrap();
        assert_eq!(info.locked_elements, 1);
    }

    #[tokio::test]
    async fn test_disconnect_releases_locks_and_notifies() {
        let relay = Relay::new(Arc::new(MemoryRepository::new()));
        let (alice, mut alice_rx) = joined(&relay, "alice").await;
        let (bob, mut bob_rx) = joined(&relay, "bob").await;

        for id in ["a", "b"] {
            relay.submit(&alice, create_rect(&alice, id)).await;
            relay.submit(&bob, lock(&bob, id)).await;
        }
        drain(&mut alice_rx);
        drop(bob_rx);

        relay.disconnect(&bob).await;

        let messages = drain(&mut alice_rx);
        assert!(messages.iter().any(|msg| matches!(
            msg,
            SyncMessage::ParticipantLeft { user_id, .. } if *user_id == bob
        )));

        let unlocks = operations(&messages);
        assert_eq!(unlocks.len(), 2);
        assert!(unlocks
            .iter()
            .all(|op| op.user_id.is_system() && matches!(op.kind, OperationKind::Unlock { .. })));

        let info = relay.session_info(&session_id()).await.unwrap();
        assert_eq!(info.locked_elements, 0);
        assert_eq!(info.participants, vec![alice]);
    }

    #[tokio::test]
    async fn test_session_survives_turnover_and_persists() {
        let repo = Arc::new(MemoryRepository::new());
        let relay = Relay::new(repo.clone());
        let (alice, _alice_rx) = joined(&relay, "alice").await;

        relay.submit(&alice, create_rect(&alice, "r")).await;
        relay
            .submit(
                &alice,
                op(
                    &alice,
                    OperationKind::Update {
                        element_id: ElementId::from("r"),
                        patch: ElementPatch::resized_to(20.0, 10.0),
                    },
                ),
            )
            .await;
        relay.disconnect(&alice).await;

        let saved = repo.get(&session_id()).unwrap();
        assert_eq!(saved.elements[&ElementId::from("r")].width, 20.0);

        let (_bob, mut bob_rx) = {
            let bob = UserId::from("bob");
            let rx = relay.connect(bob.clone());
            (bob, rx)
        };
        relay.join(&UserId::from("bob"), session_id()).await.unwrap();
        let snapshot = drain(&mut bob_rx)
            .into_iter()
            .find_map(|msg| match msg {
                SyncMessage::SessionState { elements, .. } => Some(elements),
                _ => None,
            })
            .unwrap();
        assert_eq!(snapshot[&ElementId::from("r")].width, 20.0);
    }

    #[tokio::test]
    async fn test_existing_document_is_loaded_on_first_join() {
        let repo = Arc::new(MemoryRepository::new());
        let element = Element::ellipse(1.0, 1.0, 2.0, 2.0).with_id("e");
        let mut doc = PersistedDocument::default();
        doc.elements.insert(element.id.clone(), element);
        repo.save(&session_id(), &doc).await.unwrap();

        let relay = Relay::new(repo);
        let alice = UserId::from("alice");
        let mut rx = relay.connect(alice.clone());
        relay.join(&alice, session_id()).await.unwrap();

        let messages = drain(&mut rx);
        assert!(messages.iter().any(|msg| matches!(
            msg,
            SyncMessage::SessionState { elements, .. } if elements.contains_key(&ElementId::from("e"))
        )));
    }

    struct FailingRepository;

    #[async_trait]
    impl DocumentRepository for FailingRepository {
        async fn load(&self, _: &SessionId) -> Result<Option<PersistedDocument>> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into())
        }

        async fn save(&self, _: &SessionId, _: &PersistedDocument) -> Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into())
        }
    }

    #[tokio::test]
    async fn test_storage_failures_do_not_block_the_session() {
        let relay = Relay::new(Arc::new(FailingRepository));
        let (alice, mut alice_rx) = joined(&relay, "alice").await;

        relay.submit(&alice, create_rect(&alice, "r")).await;

        assert_eq!(operations(&drain(&mut alice_rx)).len(), 1);
        let stats = relay.stats();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.persist_failures, 1);
        assert_eq!(relay.session_info(&session_id()).await.unwrap().elements, 1);
    }

    #[tokio::test]
    async fn test_ping_and_unexpected_messages() {
        let relay = Relay::new(Arc::new(MemoryRepository::new()));
        let alice = UserId::from("alice");
        let mut rx = relay.connect(alice.clone());
        drain(&mut rx);

        relay.handle_message(&alice, SyncMessage::Ping).await.unwrap();
        assert_eq!(drain(&mut rx), vec![SyncMessage::Pong]);

        relay
            .handle_message(
                &alice,
                SyncMessage::Connected {
                    user_id: alice.clone(),
                },
            )
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(relay.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_concurrent_joins_share_one_session() {
        let relay = Arc::new(Relay::new(Arc::new(MemoryRepository::new())));

        let mut handles = Vec::new();
        for i in 0..16 {
            let relay = relay.clone();
            handles.push(tokio::spawn(async move {
                let user = UserId(format!("user-{}", i));
                let _rx = relay.connect(user.clone());
                relay.join(&user, session_id()).await.unwrap();
                _rx
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(relay.sessions().len(), 1);
        let info = relay.session_info(&session_id()).await.unwrap();
        assert_eq!(info.participants.len(), 16);
    }

    /// Holds `load` of the "slow" session until released
    struct GatedRepository {
        gate: tokio::sync::Notify,
    }

    #[async_trait]
    impl DocumentRepository for GatedRepository {
        async fn load(&self, session_id: &SessionId) -> Result<Option<PersistedDocument>> {
            if session_id.as_str() == "slow" {
                self.gate.notified().await;
            }
            Ok(None)
        }

        async fn save(&self, _: &SessionId, _: &PersistedDocument) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_load_does_not_block_other_sessions() {
        let repository = Arc::new(GatedRepository {
            gate: tokio::sync::Notify::new(),
        });
        let relay = Relay::new(repository.clone());
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let _alice_rx = relay.connect(alice.clone());
        let _bob_rx = relay.connect(bob.clone());

        let slow = relay.join(&alice, SessionId::parse("slow").unwrap());
        let fast = async {
            let joined = tokio::time::timeout(
                std::time::Duration::from_secs(1),
                relay.join(&bob, SessionId::parse("fast").unwrap()),
            )
            .await;
            // Only now let the slow load finish
            repository.gate.notify_one();
            joined
        };

        let (slow, fast) = tokio::join!(slow, fast);
        tokio_test::assert_ok!(slow);
        assert!(matches!(fast, Ok(Ok(()))));
        assert_eq!(relay.sessions().len(), 2);
    }
}
