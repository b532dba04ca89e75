//! Actor base: lifecycle state machine, topic dispatch, forwarding,
//! child registry, tree and metrics recursion.
//!
//! An [`ActorRef`] is the cloneable public handle to an actor in any mode.
//! Dispatch is location-transparent: the forwarding table is consulted
//! first (forwards are zero-cost local redirects), then the mode-specific
//! transport takes over.

pub(crate) mod balancer;
pub(crate) mod forked;
pub(crate) mod in_memory;
pub(crate) mod peer;
pub(crate) mod remote;

use crate::behavior::ActorDefinition;
use crate::error::{ActorError, Result};
use crate::message::{duplicate_args, Msg};
use crate::system::SystemShared;
use canopy_protocol::{ActorId, Mode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle states. Transitions are monotonic along
/// `new → ready → destroying → destroyed`, with `crashed` reachable from
/// `ready` when a forked or remote peer dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    New,
    Ready,
    Destroying,
    Destroyed,
    Crashed,
}

impl ActorState {
    pub(crate) fn not_ready_message(&self) -> &'static str {
        match self {
            ActorState::New => "Actor has not yet been initialized.",
            ActorState::Ready => "Actor is ready.",
            ActorState::Destroying => "Actor is being destroyed.",
            ActorState::Destroyed => "Actor has been destroyed.",
            ActorState::Crashed => "Actor has crashed.",
        }
    }
}

/// Topic matcher in a forwarding table: exact string or regular expression.
#[derive(Debug, Clone)]
pub enum TopicMatcher {
    Exact(String),
    Pattern(Regex),
}

impl TopicMatcher {
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicMatcher::Exact(s) => s == topic,
            TopicMatcher::Pattern(re) => re.is_match(topic),
        }
    }
}

impl From<&str> for TopicMatcher {
    fn from(s: &str) -> Self {
        TopicMatcher::Exact(s.to_string())
    }
}

impl From<String> for TopicMatcher {
    fn from(s: String) -> Self {
        TopicMatcher::Exact(s)
    }
}

impl From<Regex> for TopicMatcher {
    fn from(re: Regex) -> Self {
        TopicMatcher::Pattern(re)
    }
}

/// What happens when a remote worker stops answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnCrash {
    /// The proxy stays crashed; subsequent operations fail.
    #[default]
    Fail,
    /// Restart the worker from the original bootstrap envelope.
    Respawn,
}

/// Options for `create_child`. Unset fields fall back to the actor
/// configuration document, then to defaults.
#[derive(Default)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub mode: Option<Mode>,
    pub cluster_size: Option<usize>,
    /// Named cluster resolved through the system's cluster map.
    pub cluster: Option<String>,
    /// Inline `host[:port]` endpoints for remote actors.
    pub hosts: Vec<String>,
    pub ping_timeout: Option<Duration>,
    pub on_crash: Option<OnCrash>,
    pub custom_parameters: Map<String, Value>,
}

impl CreateOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// One node of a `tree()` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeNode {
    pub id: String,
    pub name: String,
    pub location: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}

pub(crate) enum ActorKind {
    InMemory(in_memory::InMemoryState),
    Forked(forked::ForkedState),
    Remote(remote::RemoteState),
    Balancer(balancer::BalancerState),
    Peer(peer::PeerState),
}

pub(crate) struct ActorInner {
    id: ActorId,
    name: String,
    mode: Mode,
    state: watch::Sender<ActorState>,
    parent: Option<ActorRef>,
    children: Mutex<Vec<ActorRef>>,
    forwards: Mutex<Vec<(TopicMatcher, ActorRef)>>,
    forward_all_unknown: Mutex<Option<ActorRef>>,
    custom_parameters: Map<String, Value>,
    system: Weak<SystemShared>,
    pub(crate) kind: ActorKind,
}

/// Handle to an actor in any execution mode.
#[derive(Clone)]
pub struct ActorRef {
    pub(crate) inner: Arc<ActorInner>,
}

impl std::fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("mode", &self.mode())
            .field("state", &self.state())
            .finish()
    }
}

impl ActorRef {
    pub(crate) fn construct(
        system: &Arc<SystemShared>,
        id: ActorId,
        parent: Option<ActorRef>,
        name: String,
        mode: Mode,
        custom_parameters: Map<String, Value>,
        kind: ActorKind,
    ) -> ActorRef {
        let actor = Self::construct_detached(system, id, parent, name, mode, custom_parameters, kind);
        system.actor_table.insert(id, actor.clone());
        actor
    }

    /// Construct without registering in the system actor table. Used for
    /// peer proxies, which are routing tokens rather than local actors.
    pub(crate) fn construct_detached(
        system: &Arc<SystemShared>,
        id: ActorId,
        parent: Option<ActorRef>,
        name: String,
        mode: Mode,
        custom_parameters: Map<String, Value>,
        kind: ActorKind,
    ) -> ActorRef {
        let (state, _) = watch::channel(ActorState::New);
        ActorRef {
            inner: Arc::new(ActorInner {
                id,
                name,
                mode,
                state,
                parent,
                children: Mutex::new(Vec::new()),
                forwards: Mutex::new(Vec::new()),
                forward_all_unknown: Mutex::new(None),
                custom_parameters,
                system: Arc::downgrade(system),
                kind,
            }),
        }
    }

    pub fn id(&self) -> ActorId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn state(&self) -> ActorState {
        *self.inner.state.borrow()
    }

    pub fn parent(&self) -> Option<ActorRef> {
        self.inner.parent.clone()
    }

    pub fn custom_parameters(&self) -> &Map<String, Value> {
        &self.inner.custom_parameters
    }

    pub(crate) fn set_state(&self, state: ActorState) {
        let changed = self.inner.state.send_replace(state) != state;
        if changed {
            tracing::debug!(actor = %self.inner.id, name = %self.inner.name, state = ?state, "actor state change");
        }
    }

    /// Atomically move `ready → crashed`. Returns false when the actor was
    /// in any other state, so concurrent crash observers act once.
    pub(crate) fn crash_if_ready(&self) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state == ActorState::Ready {
                *state = ActorState::Crashed;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn system(&self) -> Result<Arc<SystemShared>> {
        self.inner
            .system
            .upgrade()
            .ok_or_else(|| ActorError::Config("actor system has been destroyed".to_string()))
    }

    fn children_snapshot(&self) -> Vec<ActorRef> {
        self.inner
            .children
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    /// Fire-and-forget send. Resolves when the message is handed to the
    /// local handler task or accepted by the transport.
    pub async fn send(&self, topic: &str, args: Vec<Msg>) -> Result<()> {
        self.dispatch(topic, args, false, None).await.map(|_| ())
    }

    /// Request/response send. Resolves with the handler's return value.
    pub async fn send_and_receive(&self, topic: &str, args: Vec<Msg>) -> Result<Value> {
        self.dispatch(topic, args, true, None).await
    }

    /// Like [`send_and_receive`](Self::send_and_receive) with a deadline.
    /// Elapsed requests fail with a timeout error; a late response is
    /// discarded.
    pub async fn send_and_receive_timeout(
        &self,
        topic: &str,
        args: Vec<Msg>,
        timeout: Duration,
    ) -> Result<Value> {
        self.dispatch(topic, args, true, Some(timeout)).await
    }

    fn dispatch<'a>(
        &'a self,
        topic: &'a str,
        args: Vec<Msg>,
        receive: bool,
        timeout: Option<Duration>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            self.ensure_ready().await?;

            // Forwarding applies before transport.
            if let Some(target) = self.forward_target(topic).await {
                return target.dispatch(topic, args, receive, timeout).await;
            }

            self.send0(topic, args, receive, timeout).await
        })
    }

    async fn send0(
        &self,
        topic: &str,
        args: Vec<Msg>,
        receive: bool,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        match &self.inner.kind {
            ActorKind::InMemory(state) => match timeout {
                Some(deadline) if receive => {
                    tokio::time::timeout(
                        deadline,
                        in_memory::send0(self, state, topic, args, receive),
                    )
                    .await
                    .unwrap_or(Err(ActorError::Timeout))
                }
                _ => in_memory::send0(self, state, topic, args, receive).await,
            },
            ActorKind::Forked(state) => {
                peer::proxy_send(
                    &self.system()?,
                    &state.conn,
                    self.id(),
                    topic,
                    args,
                    receive,
                    timeout,
                )
                .await
            }
            ActorKind::Remote(state) => {
                let conn = state.conn().await?;
                peer::proxy_send(&self.system()?, &conn, self.id(), topic, args, receive, timeout)
                    .await
            }
            ActorKind::Balancer(state) => {
                let target = balancer::next_child(self, state)?;
                Box::pin(target.dispatch(topic, args, receive, timeout)).await
            }
            ActorKind::Peer(state) => {
                peer::proxy_send(
                    &self.system()?,
                    &state.conn,
                    self.id(),
                    topic,
                    args,
                    receive,
                    timeout,
                )
                .await
            }
        }
    }

    async fn ensure_ready(&self) -> Result<()> {
        loop {
            let state = self.state();
            match state {
                ActorState::Ready => return Ok(()),
                // A crashed remote proxy with respawn configured queues
                // sends until the replacement is up.
                ActorState::Crashed if self.respawns() => {
                    let mut rx = self.inner.state.subscribe();
                    let still_crashed = *rx.borrow() == ActorState::Crashed;
                    if still_crashed && rx.changed().await.is_err() {
                        return Err(ActorError::not_ready(ActorState::Crashed));
                    }
                }
                other => return Err(ActorError::not_ready(other)),
            }
        }
    }

    fn respawns(&self) -> bool {
        matches!(&self.inner.kind, ActorKind::Remote(state) if state.respawn)
    }

    async fn forward_target(&self, topic: &str) -> Option<ActorRef> {
        if let Ok(forwards) = self.inner.forwards.lock() {
            for (matcher, target) in forwards.iter() {
                if matcher.matches(topic) {
                    return Some(target.clone());
                }
            }
        }

        let fallback = self
            .inner
            .forward_all_unknown
            .lock()
            .ok()
            .and_then(|slot| slot.clone())?;
        // The fallback only wins when no explicit handler exists.
        if self.has_local_handler(topic).await {
            return None;
        }
        Some(fallback)
    }

    async fn has_local_handler(&self, topic: &str) -> bool {
        match &self.inner.kind {
            ActorKind::InMemory(state) => state.behavior.lock().await.handles(topic),
            // Proxy handlers live on the other side; assume they exist.
            _ => true,
        }
    }

    /// Add `(topic, parent)` pairs to this actor's forward list.
    pub fn forward_to_parent<M>(&self, topics: impl IntoIterator<Item = M>) -> Result<()>
    where
        M: Into<TopicMatcher>,
    {
        let parent = self
            .parent()
            .ok_or_else(|| ActorError::Config("actor has no parent to forward to".to_string()))?;
        let mut forwards = self
            .inner
            .forwards
            .lock()
            .map_err(|_| ActorError::Config("forward table poisoned".to_string()))?;
        for topic in topics {
            forwards.push((topic.into(), parent.clone()));
        }
        Ok(())
    }

    /// Route every topic without an explicit handler to the parent.
    pub fn forward_all_unknown_to_parent(&self) -> Result<()> {
        let parent = self
            .parent()
            .ok_or_else(|| ActorError::Config("actor has no parent to forward to".to_string()))?;
        if let Ok(mut slot) = self.inner.forward_all_unknown.lock() {
            *slot = Some(parent);
        }
        Ok(())
    }

    /// Add `(topic, child)` pairs to this actor's forward list. The target
    /// must be one of this actor's children.
    pub fn forward_to_child<M>(
        &self,
        child: &ActorRef,
        topics: impl IntoIterator<Item = M>,
    ) -> Result<()>
    where
        M: Into<TopicMatcher>,
    {
        let is_child = self
            .inner
            .children
            .lock()
            .map(|guard| guard.iter().any(|c| c.id() == child.id()))
            .unwrap_or(false);
        if !is_child {
            return Err(ActorError::Config(format!(
                "actor {} is not a child of {}",
                child.id(),
                self.id()
            )));
        }
        let mut forwards = self
            .inner
            .forwards
            .lock()
            .map_err(|_| ActorError::Config("forward table poisoned".to_string()))?;
        for topic in topics {
            forwards.push((topic.into(), child.clone()));
        }
        Ok(())
    }

    /// Create a child actor. Allowed while `new` (from the initialize
    /// hook) or `ready`.
    pub async fn create_child(
        &self,
        definition: impl Into<ActorDefinition>,
        options: CreateOptions,
    ) -> Result<ActorRef> {
        let state = self.state();
        if !matches!(state, ActorState::New | ActorState::Ready) {
            return Err(ActorError::not_ready(state));
        }

        let system = self.system()?;
        let resolved = system.resolve_options(&options)?;
        let definition = definition.into();

        let child = if resolved.cluster_size > 1 {
            balancer::create_cluster(system.clone(), self.clone(), definition, resolved).await?
        } else {
            match resolved.mode {
                Mode::InMemory => {
                    in_memory::create(
                        system.clone(),
                        ActorId::generate(),
                        Some(self.clone()),
                        definition,
                        &resolved,
                    )
                    .await?
                }
                Mode::Forked => {
                    forked::create(system.clone(), self.clone(), definition, &resolved).await?
                }
                Mode::Remote => {
                    remote::create(system.clone(), self.clone(), definition, &resolved).await?
                }
            }
        };

        if let Ok(mut children) = self.inner.children.lock() {
            children.push(child.clone());
        }
        Ok(child)
    }

    /// Destroy this actor: children first (reverse insertion order), then
    /// the behaviour's destroy hook, then transport resources.
    pub fn destroy(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            match self.state() {
                ActorState::Destroyed => return Ok(()),
                ActorState::Destroying => {
                    // Another task is already destroying; wait it out.
                    let mut rx = self.inner.state.subscribe();
                    while *rx.borrow() != ActorState::Destroyed {
                        if rx.changed().await.is_err() {
                            break;
                        }
                    }
                    return Ok(());
                }
                _ => self.set_state(ActorState::Destroying),
            }

            let children: Vec<ActorRef> = self
                .inner
                .children
                .lock()
                .map(|mut guard| guard.drain(..).rev().collect())
                .unwrap_or_default();
            for child in children {
                if let Err(err) = child.destroy().await {
                    tracing::warn!(
                        actor = %self.inner.id,
                        child = %child.id(),
                        "child destroy failed: {err}"
                    );
                }
            }

            match &self.inner.kind {
                ActorKind::InMemory(state) => {
                    if let Err(err) = state.behavior.lock().await.destroy().await {
                        tracing::warn!(actor = %self.inner.id, "destroy hook failed: {err}");
                    }
                }
                ActorKind::Forked(state) => forked::shutdown(self, state).await,
                ActorKind::Remote(state) => remote::shutdown(self, state).await,
                ActorKind::Balancer(_) | ActorKind::Peer(_) => {}
            }

            if let Some(system) = self.inner.system.upgrade() {
                system.actor_table.remove(&self.inner.id);
            }
            self.set_state(ActorState::Destroyed);
            Ok(())
        })
    }

    /// Depth-first snapshot of this actor and its non-destroyed
    /// descendants.
    pub fn tree(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<TreeNode>> + Send + '_>> {
        Box::pin(async move {
            match &self.inner.kind {
                ActorKind::Forked(state) => {
                    let mut node = peer::proxy_tree(&state.conn, self.id()).await?;
                    // The worker reports its own vantage point; the label that
                    // matters here is the mode relative to this process.
                    node.location = self.mode();
                    Ok(node)
                }
                ActorKind::Remote(state) => {
                    let conn = state.conn().await?;
                    let mut node = peer::proxy_tree(&conn, self.id()).await?;
                    node.location = self.mode();
                    Ok(node)
                }
                ActorKind::Peer(state) => peer::proxy_tree(&state.conn, self.id()).await,
                ActorKind::InMemory(_) | ActorKind::Balancer(_) => {
                    let mut nodes = Vec::new();
                    for child in self.children_snapshot() {
                        if matches!(child.state(), ActorState::Destroying | ActorState::Destroyed) {
                            continue;
                        }
                        nodes.push(child.tree().await?);
                    }
                    Ok(TreeNode {
                        id: self.inner.id.to_string(),
                        name: self.inner.name.clone(),
                        location: self.inner.mode,
                        children: if nodes.is_empty() { None } else { Some(nodes) },
                    })
                }
            }
        })
    }

    /// This actor's metric map merged with a mapping from child name to
    /// child metrics. Destroyed children are excluded.
    pub fn metrics(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Map<String, Value>>> + Send + '_>> {
        Box::pin(async move {
            match &self.inner.kind {
                ActorKind::Forked(state) => peer::proxy_metrics(&state.conn, self.id()).await,
                ActorKind::Remote(state) => {
                    let conn = state.conn().await?;
                    peer::proxy_metrics(&conn, self.id()).await
                }
                ActorKind::Peer(state) => peer::proxy_metrics(&state.conn, self.id()).await,
                ActorKind::InMemory(state) => {
                    let mut merged = state.behavior.lock().await.metrics();
                    for child in self.children_snapshot() {
                        if matches!(child.state(), ActorState::Destroying | ActorState::Destroyed)
                            || child.name().is_empty()
                        {
                            continue;
                        }
                        let child_metrics = child.metrics().await?;
                        merged.insert(child.name().to_string(), Value::Object(child_metrics));
                    }
                    Ok(merged)
                }
                ActorKind::Balancer(_) => {
                    let mut merged = Map::new();
                    for (index, child) in self.children_snapshot().into_iter().enumerate() {
                        if matches!(child.state(), ActorState::Destroying | ActorState::Destroyed) {
                            continue;
                        }
                        let child_metrics = child.metrics().await?;
                        merged.insert(index.to_string(), Value::Object(child_metrics));
                    }
                    Ok(merged)
                }
            }
        })
    }

    /// Fan a `send` out to every clustered child.
    pub async fn broadcast(&self, topic: &str, args: Vec<Msg>) -> Result<()> {
        match &self.inner.kind {
            ActorKind::Balancer(_) => balancer::broadcast(self, topic, args).await,
            _ => Err(ActorError::Config("actor is not clustered".to_string())),
        }
    }

    /// Fan a `send_and_receive` out to every clustered child, returning
    /// per-child responses in child order.
    pub async fn broadcast_and_receive(&self, topic: &str, args: Vec<Msg>) -> Result<Vec<Value>> {
        match &self.inner.kind {
            ActorKind::Balancer(_) => balancer::broadcast_and_receive(self, topic, args).await,
            _ => Err(ActorError::Config("actor is not clustered".to_string())),
        }
    }

    pub(crate) fn push_child(&self, child: ActorRef) {
        if let Ok(mut children) = self.inner.children.lock() {
            children.push(child);
        }
    }
}

pub(crate) fn duplicate_for_fanout(args: &[Msg]) -> Result<Vec<Msg>> {
    duplicate_args(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matcher_exact_and_pattern() {
        let exact = TopicMatcher::from("plus");
        assert!(exact.matches("plus"));
        assert!(!exact.matches("plusOne"));

        let pattern = TopicMatcher::from(Regex::new("^math\\.").unwrap());
        assert!(pattern.matches("math.add"));
        assert!(!pattern.matches("other.add"));
    }

    #[test]
    fn test_not_ready_messages_by_state() {
        assert!(ActorState::New
            .not_ready_message()
            .contains("has not yet been initialized"));
        assert!(ActorState::Destroyed.not_ready_message().contains("destroyed"));
        assert!(ActorState::Crashed.not_ready_message().contains("crashed"));
    }

    #[test]
    fn test_tree_node_serde_shape() {
        let node = TreeNode {
            id: "abc".to_string(),
            name: "root".to_string(),
            location: Mode::InMemory,
            children: None,
        };
        let value = serde_json::to_value(&node).unwrap();
        assert_eq!(value["location"], serde_json::json!("in-memory"));
        assert!(value.get("children").is_none());
    }
}
