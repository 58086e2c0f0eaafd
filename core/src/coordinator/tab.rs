// One tab's view of the leader election
//
// All protocol handling runs on a single task per tab: broadcast messages
// and timer deadlines are processed one at a time, so the state below is
// never touched by two handlers at once.

use super::{
    BroadcastChannel, CoordinatorConfig, CoordinatorError, CoordinatorState, ElectionEvent,
    TabBody, TabMessage,
};
use crate::crypto::guid;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type AppMessageHandler = Arc<dyn Fn(&TabMessage) + Send + Sync>;
/// Runs on the leader for each follower request; the result is sent back.
pub type RequestHandler = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type ElectedHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct TabHandlers {
    pub on_message: Option<AppMessageHandler>,
    pub on_request: Option<RequestHandler>,
    pub on_elected: Option<ElectedHandler>,
}

struct TabState {
    role: CoordinatorState,
    /// Followers known to the leader
    neighborhood: Vec<String>,
    election_deadline: Option<Instant>,
    pending_acks: HashMap<String, Instant>,
    pending_requests: HashMap<String, oneshot::Sender<Value>>,
}

struct Shared {
    id: String,
    config: CoordinatorConfig,
    channel: Arc<dyn BroadcastChannel>,
    handlers: TabHandlers,
    state: Mutex<TabState>,
    role: watch::Sender<CoordinatorState>,
}

/// Leader election participant for one tab.
pub struct TabCoordinator {
    shared: Arc<Shared>,
    role: watch::Receiver<CoordinatorState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TabCoordinator {
    /// Join the election: ask for leadership and claim it if nobody answers
    /// within the election timeout. Must be called inside a tokio runtime.
    pub fn start(
        channel: Arc<dyn BroadcastChannel>,
        config: CoordinatorConfig,
        handlers: TabHandlers,
    ) -> Result<Self, CoordinatorError> {
        let id = guid();
        let (role_tx, role_rx) = watch::channel(CoordinatorState::NoLeader);
        let receiver = channel.subscribe();

        let shared = Arc::new(Shared {
            id: id.clone(),
            config,
            channel,
            handlers,
            state: Mutex::new(TabState {
                role: CoordinatorState::NoLeader,
                neighborhood: Vec::new(),
                election_deadline: None,
                pending_acks: HashMap::new(),
                pending_requests: HashMap::new(),
            }),
            role: role_tx,
        });

        shared.begin_election()?;
        let task = tokio::spawn(run(shared.clone(), receiver));
        info!("Tab {} joined the election", short(&id));

        Ok(Self {
            shared,
            role: role_rx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> CoordinatorState {
        *self.role.borrow()
    }

    pub fn is_leader(&self) -> bool {
        self.state() == CoordinatorState::Leader
    }

    /// Followers the leader currently knows about.
    pub fn followers(&self) -> Vec<String> {
        self.shared.state.lock().neighborhood.clone()
    }

    /// Watch role changes.
    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.role.clone()
    }

    /// Resolve once this tab holds `state`.
    pub async fn wait_for(&self, state: CoordinatorState) -> Result<(), CoordinatorError> {
        let mut role = self.role.clone();
        role.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| CoordinatorError::Unloaded)
    }

    /// Broadcast an application message to the other tabs.
    pub fn post(&self, payload: Value) -> Result<(), CoordinatorError> {
        self.ensure_alive()?;
        self.shared
            .channel
            .post(TabMessage::broadcast(&self.shared.id, TabBody::App(payload)))
    }

    /// Ask the leader to handle `payload`. The leader answers its own
    /// requests directly.
    pub async fn request(&self, payload: Value) -> Result<Value, CoordinatorError> {
        self.ensure_alive()?;
        if self.is_leader() {
            let handler = self
                .shared
                .handlers
                .on_request
                .clone()
                .ok_or(CoordinatorError::NoRequestHandler)?;
            return Ok(handler(&payload));
        }

        let correlation_id = guid();
        let (tx, rx) = oneshot::channel();
        self.shared
            .state
            .lock()
            .pending_requests
            .insert(correlation_id.clone(), tx);
        self.shared.channel.post(TabMessage::broadcast(
            &self.shared.id,
            TabBody::Request {
                correlation_id: correlation_id.clone(),
                payload,
            },
        ))?;

        let timeout = self.shared.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(CoordinatorError::Unloaded),
            Err(_) => {
                self.shared
                    .state
                    .lock()
                    .pending_requests
                    .remove(&correlation_id);
                Err(CoordinatorError::RequestTimeout(timeout))
            }
        }
    }

    /// Leave the group, as a tab does before it closes. A leader hands
    /// leadership to a random follower; a follower tells the leader.
    pub fn unload(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        task.abort();

        let message = {
            let mut state = self.shared.state.lock();
            let message = if state.role == CoordinatorState::Leader {
                let nominee = state.neighborhood.choose(&mut rand::thread_rng()).cloned();
                info!(
                    "Leader {} resigning, nominee {:?}",
                    short(&self.shared.id),
                    nominee.as_deref().map(short)
                );
                TabMessage {
                    sender: self.shared.id.clone(),
                    recipient: nominee,
                    body: TabBody::LeaderDead {
                        followers: std::mem::take(&mut state.neighborhood),
                    },
                }
            } else {
                TabMessage::broadcast(&self.shared.id, TabBody::ChildUnload)
            };
            state.pending_requests.clear();
            self.shared.set_role(&mut state, ElectionEvent::Resigned);
            message
        };

        if let Err(e) = self.shared.channel.post(message) {
            warn!("Could not announce unload: {}", e);
        }
    }

    /// Tell the leader this tab may be going away without leaving the group.
    ///
    /// Mobile browsers unload background tabs that keep running. A tab that
    /// is still alive answers the leader's liveness check and stays in its
    /// follower list. Leaders and candidates have nothing to announce.
    pub fn announce_unload(&self) -> Result<(), CoordinatorError> {
        self.ensure_alive()?;
        if self.state() != CoordinatorState::Follower {
            return Ok(());
        }
        debug!("Tab {} announcing unload", short(&self.shared.id));
        self.shared
            .channel
            .post(TabMessage::broadcast(&self.shared.id, TabBody::ChildUnload))
    }

    fn ensure_alive(&self) -> Result<(), CoordinatorError> {
        if self.task.lock().is_none() {
            return Err(CoordinatorError::Unloaded);
        }
        Ok(())
    }
}

impl Drop for TabCoordinator {
    fn drop(&mut self) {
        self.unload();
    }
}

impl Shared {
    fn set_role(&self, state: &mut TabState, event: ElectionEvent) -> bool {
        let previous = state.role;
        state.role = previous.apply(event);
        if state.role != previous {
            debug!(
                "Tab {}: {:?} -> {:?} on {:?}",
                short(&self.id),
                previous,
                state.role,
                event
            );
            self.role.send_replace(state.role);
        }
        previous != CoordinatorState::Leader && state.role == CoordinatorState::Leader
    }

    fn begin_election(&self) -> Result<(), CoordinatorError> {
        {
            let mut state = self.state.lock();
            self.set_role(&mut state, ElectionEvent::Started);
            state.election_deadline = Some(Instant::now() + self.config.election_timeout);
        }
        self.channel
            .post(TabMessage::broadcast(&self.id, TabBody::RequestLeadership))
    }

    fn post(&self, message: TabMessage) {
        if let Err(e) = self.channel.post(message) {
            warn!("Tab {} could not post: {}", short(&self.id), e);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let state = self.state.lock();
        state
            .election_deadline
            .into_iter()
            .chain(state.pending_acks.values().copied())
            .min()
    }

    fn on_deadline(&self, now: Instant) {
        let elected = {
            let mut state = self.state.lock();
            let mut elected = false;
            if state.election_deadline.is_some_and(|deadline| deadline <= now) {
                state.election_deadline = None;
                elected = self.set_role(&mut state, ElectionEvent::ElectionTimedOut);
                if elected {
                    info!("Tab {} claimed leadership", short(&self.id));
                }
            }

            let expired: Vec<String> = state
                .pending_acks
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in expired {
                debug!("Follower {} did not answer, pruning", short(&id));
                state.pending_acks.remove(&id);
                state.neighborhood.retain(|member| *member != id);
            }
            elected
        };

        if elected {
            self.post(TabMessage::broadcast(&self.id, TabBody::LeaderExists));
            self.fire_elected();
        }
    }

    fn handle(&self, message: TabMessage) {
        if message.sender == self.id {
            return;
        }

        match &message.body {
            TabBody::RequestLeadership => {
                let mut state = self.state.lock();
                let role = state.role;
                match role {
                    CoordinatorState::Leader => {
                        if !state.neighborhood.contains(&message.sender) {
                            state.neighborhood.push(message.sender.clone());
                        }
                        drop(state);
                        self.post(TabMessage::to(&self.id, &message.sender, TabBody::LeaderExists));
                    }
                    // Concurrent candidates: the smaller id claims, the other
                    // waits for its announcement
                    CoordinatorState::Electing if message.sender < self.id => {
                        let deadline = Instant::now() + self.config.election_timeout * 2;
                        state.election_deadline = Some(deadline);
                        debug!("Tab {} yields to {}", short(&self.id), short(&message.sender));
                    }
                    CoordinatorState::Electing => {
                        if !state.neighborhood.contains(&message.sender) {
                            state.neighborhood.push(message.sender.clone());
                        }
                    }
                    _ => {}
                }
            }
            TabBody::LeaderExists => {
                // Addressed: answer to our request. Broadcast: a fresh claim.
                let claim = message.recipient.is_none();
                if message.is_for(&self.id) || claim {
                    let mut state = self.state.lock();
                    if claim && state.role == CoordinatorState::Leader {
                        if message.sender > self.id {
                            return;
                        }
                        info!("Tab {} defers to leader {}", short(&self.id), short(&message.sender));
                        state.neighborhood.clear();
                        self.set_role(&mut state, ElectionEvent::Resigned);
                    }
                    state.election_deadline = None;
                    self.set_role(&mut state, ElectionEvent::LeaderAnswered);
                }
            }
            TabBody::ChildUnload => {
                let mut state = self.state.lock();
                if state.role == CoordinatorState::Leader {
                    let deadline = Instant::now() + self.config.child_ack_timeout;
                    state.pending_acks.insert(message.sender.clone(), deadline);
                    drop(state);
                    self.post(TabMessage::to(&self.id, &message.sender, TabBody::IsChildAlive));
                }
            }
            TabBody::ChildStillAlive => {
                let mut state = self.state.lock();
                if state.role == CoordinatorState::Leader {
                    state.pending_acks.remove(&message.sender);
                }
            }
            TabBody::IsChildAlive => {
                if message.is_for(&self.id) {
                    self.post(TabMessage::to(&self.id, &message.sender, TabBody::ChildStillAlive));
                }
            }
            TabBody::LeaderDead { followers } => self.on_leader_dead(&message, followers),
            TabBody::Request {
                correlation_id,
                payload,
            } => self.on_request(&message.sender, correlation_id, payload),
            TabBody::Response {
                correlation_id,
                payload,
            } => {
                if message.is_for(&self.id) {
                    let pending = self.state.lock().pending_requests.remove(correlation_id);
                    if let Some(tx) = pending {
                        let _ = tx.send(payload.clone());
                    }
                }
            }
            TabBody::App(_) => {
                if let Some(handler) = &self.handlers.on_message {
                    handler(&message);
                }
            }
        }
    }

    fn on_leader_dead(&self, message: &TabMessage, followers: &[String]) {
        if message.is_for(&self.id) {
            {
                let mut state = self.state.lock();
                state.neighborhood = followers
                    .iter()
                    .filter(|id| **id != self.id)
                    .cloned()
                    .collect();
                state.election_deadline = None;
                self.set_role(&mut state, ElectionEvent::Nominated);
            }
            info!("Tab {} nominated as leader", short(&self.id));
            self.post(TabMessage::broadcast(&self.id, TabBody::LeaderExists));
            self.fire_elected();
            return;
        }

        // No nominee, or one that may be gone: compete again. A live nominee
        // answers with LeaderExists and ends the election.
        let role = self.state.lock().role;
        if role != CoordinatorState::Leader {
            debug!(
                "Tab {} saw leader {} resign, nominee {:?}",
                short(&self.id),
                short(&message.sender),
                message.recipient.as_deref().map(short)
            );
            if let Err(e) = self.begin_election() {
                warn!("Could not restart election: {}", e);
            }
        }
    }

    fn on_request(&self, sender: &str, correlation_id: &str, payload: &Value) {
        if self.state.lock().role != CoordinatorState::Leader {
            return;
        }
        let Some(handler) = &self.handlers.on_request else {
            debug!("Dropping follower request without a handler");
            return;
        };

        let answer = handler(payload);
        self.post(TabMessage::to(
            &self.id,
            sender,
            TabBody::Response {
                correlation_id: correlation_id.to_string(),
                payload: answer,
            },
        ));
    }

    fn fire_elected(&self) {
        if let Some(handler) = &self.handlers.on_elected {
            handler();
        }
    }
}

async fn run(shared: Arc<Shared>, mut receiver: broadcast::Receiver<TabMessage>) {
    loop {
        let deadline = shared.next_deadline();
        tokio::select! {
            received = receiver.recv() => match received {
                Ok(message) => shared.handle(message),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Tab {} missed {} broadcast message(s)", short(&shared.id), skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = sleep_until(deadline) => shared.on_deadline(Instant::now()),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LocalBroadcast;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn tab(channel: &LocalBroadcast, handlers: TabHandlers) -> TabCoordinator {
        TabCoordinator::start(
            Arc::new(channel.clone()),
            CoordinatorConfig::default(),
            handlers,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_tab_claims_leadership_after_timeout() {
        let channel = LocalBroadcast::default();
        let elected = Arc::new(AtomicUsize::new(0));
        let counter = elected.clone();
        let first = tab(
            &channel,
            TabHandlers {
                on_elected: Some(Arc::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..TabHandlers::default()
            },
        );

        assert_eq!(first.state(), CoordinatorState::Electing);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(first.state(), CoordinatorState::Electing);

        first.wait_for(CoordinatorState::Leader).await.unwrap();
        assert_eq!(elected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_candidates_elect_one_leader() {
        let channel = LocalBroadcast::default();
        let first = tab(&channel, TabHandlers::default());
        let second = tab(&channel, TabHandlers::default());

        tokio::time::sleep(Duration::from_secs(5)).await;

        let leaders = [&first, &second].iter().filter(|t| t.is_leader()).count();
        assert_eq!(leaders, 1);
        let follower = if first.is_leader() { &second } else { &first };
        assert_eq!(follower.state(), CoordinatorState::Follower);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_unload_is_pruned() {
        let channel = LocalBroadcast::default();
        let leader = tab(&channel, TabHandlers::default());
        leader.wait_for(CoordinatorState::Leader).await.unwrap();

        let follower = tab(&channel, TabHandlers::default());
        follower.wait_for(CoordinatorState::Follower).await.unwrap();
        assert_eq!(leader.followers(), vec![follower.id().to_string()]);

        follower.unload();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(leader.followers().is_empty());
        assert!(leader.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backgrounded_follower_stays_listed() {
        let channel = LocalBroadcast::default();
        let leader = tab(&channel, TabHandlers::default());
        leader.wait_for(CoordinatorState::Leader).await.unwrap();
        let follower = tab(&channel, TabHandlers::default());
        follower.wait_for(CoordinatorState::Follower).await.unwrap();

        follower.announce_unload().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(leader.followers(), vec![follower.id().to_string()]);
        assert_eq!(follower.state(), CoordinatorState::Follower);
        // Nothing to announce for the leader
        leader.announce_unload().unwrap();
        assert!(leader.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_takes_over_when_nominee_is_gone() {
        let channel = LocalBroadcast::default();
        let mut observer = channel.subscribe();
        let follower = tab(&channel, TabHandlers::default());

        // A leader that crashes out later answers the request
        assert_eq!(observer.recv().await.unwrap().body, TabBody::RequestLeadership);
        channel
            .post(TabMessage::to("old-leader", follower.id(), TabBody::LeaderExists))
            .unwrap();
        follower.wait_for(CoordinatorState::Follower).await.unwrap();

        // It nominates a tab that closed without saying so
        channel
            .post(TabMessage::to(
                "old-leader",
                "closed-tab",
                TabBody::LeaderDead {
                    followers: vec!["closed-tab".to_string(), follower.id().to_string()],
                },
            ))
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(10),
            follower.wait_for(CoordinatorState::Leader),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_nominee_keeps_others_following() {
        let channel = LocalBroadcast::default();
        let leader = tab(&channel, TabHandlers::default());
        leader.wait_for(CoordinatorState::Leader).await.unwrap();
        let first = tab(&channel, TabHandlers::default());
        first.wait_for(CoordinatorState::Follower).await.unwrap();
        let second = tab(&channel, TabHandlers::default());
        second.wait_for(CoordinatorState::Follower).await.unwrap();

        leader.unload();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let leaders = [&first, &second].iter().filter(|t| t.is_leader()).count();
        assert_eq!(leaders, 1);
        let follower = if first.is_leader() { &second } else { &first };
        assert_eq!(follower.state(), CoordinatorState::Follower);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_request_is_answered_by_leader() {
        let channel = LocalBroadcast::default();
        let leader = tab(
            &channel,
            TabHandlers {
                on_request: Some(Arc::new(|payload| {
                    serde_json::json!({ "echo": payload.clone() })
                })),
                ..TabHandlers::default()
            },
        );
        leader.wait_for(CoordinatorState::Leader).await.unwrap();
        let follower = tab(&channel, TabHandlers::default());
        follower.wait_for(CoordinatorState::Follower).await.unwrap();

        let answer = follower.request(serde_json::json!("ping")).await.unwrap();
        assert_eq!(answer, serde_json::json!({ "echo": "ping" }));

        leader.unload();
        follower.unload();
        assert_eq!(
            follower.request(serde_json::json!("late")).await.unwrap_err(),
            CoordinatorError::Unloaded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_app_messages_reach_other_tabs_only() {
        let channel = LocalBroadcast::default();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        let listener = tab(
            &channel,
            TabHandlers {
                on_message: Some(Arc::new(move |message: &TabMessage| {
                    sink.lock().push(message.body.clone());
                })),
                ..TabHandlers::default()
            },
        );
        listener.wait_for(CoordinatorState::Leader).await.unwrap();
        let talker = tab(&channel, TabHandlers::default());
        talker.wait_for(CoordinatorState::Follower).await.unwrap();

        talker.post(serde_json::json!({"kind": "disconnect"})).unwrap();
        listener.post(serde_json::json!({"kind": "ignored"})).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            *received.lock(),
            vec![TabBody::App(serde_json::json!({"kind": "disconnect"}))]
        );
    }
}
