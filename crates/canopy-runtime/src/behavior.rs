//! User behaviour: the topic→handler record an actor is constructed from.
//!
//! A behaviour is a capability record, not a class hierarchy: a dispatch
//! table plus optional `initialize`, `destroy` and `metrics` hooks. Two
//! ways to produce one:
//! - implement [`Behavior`] on your own type;
//! - assemble a [`Handlers`] table from async closures.
//!
//! Forked and remote actors cannot receive behaviour values across process
//! boundaries; they are created from names registered in the process-global
//! [`register_behavior`] registry, which the worker process resolves
//! locally.

use crate::actor::ActorRef;
use crate::error::{ActorError, Result};
use crate::message::Msg;
use crate::resource::ResourceSet;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;

/// An actor's user-supplied behaviour.
#[async_trait::async_trait]
pub trait Behavior: Send + 'static {
    /// Runs before the actor becomes ready. The actor is in the `new`
    /// state; sends to it fail until this returns.
    async fn initialize(&mut self, _actor: &ActorRef) -> Result<()> {
        Ok(())
    }

    /// Whether a handler exists for `topic`. Consulted before dispatch so
    /// forward-all-unknown routing can win when there is none.
    fn handles(&self, topic: &str) -> bool;

    /// Invoke the handler for `topic`.
    async fn handle(&mut self, topic: &str, args: Vec<Msg>) -> Result<Value>;

    /// Runs during destruction, after all children are gone.
    async fn destroy(&mut self) -> Result<()> {
        Ok(())
    }

    fn metrics(&self) -> Map<String, Value> {
        Map::new()
    }
}

impl std::fmt::Debug for dyn Behavior {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Behavior").finish_non_exhaustive()
    }
}

type HandlerFn = Box<dyn FnMut(Vec<Msg>) -> BoxFuture<'static, Result<Value>> + Send>;
type InitFn = Box<dyn FnMut(ActorRef) -> BoxFuture<'static, Result<()>> + Send>;
type DestroyFn = Box<dyn FnMut() -> BoxFuture<'static, Result<()>> + Send>;
type MetricsFn = Box<dyn Fn() -> Map<String, Value> + Send>;

/// Behaviour assembled from closures, one per topic.
#[derive(Default)]
pub struct Handlers {
    handlers: HashMap<String, HandlerFn>,
    init: Option<InitFn>,
    on_destroy: Option<DestroyFn>,
    metrics_fn: Option<MetricsFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for a topic.
    pub fn on<F, Fut>(mut self, topic: impl Into<String>, mut handler: F) -> Self
    where
        F: FnMut(Vec<Msg>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
    {
        self.handlers
            .insert(topic.into(), Box::new(move |args| Box::pin(handler(args))));
        self
    }

    pub fn on_initialize<F, Fut>(mut self, mut hook: F) -> Self
    where
        F: FnMut(ActorRef) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.init = Some(Box::new(move |actor| Box::pin(hook(actor))));
        self
    }

    pub fn on_destroy<F, Fut>(mut self, mut hook: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.on_destroy = Some(Box::new(move || Box::pin(hook())));
        self
    }

    pub fn with_metrics<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Map<String, Value> + Send + 'static,
    {
        self.metrics_fn = Some(Box::new(f));
        self
    }
}

#[async_trait::async_trait]
impl Behavior for Handlers {
    async fn initialize(&mut self, actor: &ActorRef) -> Result<()> {
        if let Some(init) = self.init.as_mut() {
            init(actor.clone()).await?;
        }
        Ok(())
    }

    fn handles(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    async fn handle(&mut self, topic: &str, args: Vec<Msg>) -> Result<Value> {
        match self.handlers.get_mut(topic) {
            Some(handler) => handler(args).await,
            None => Err(ActorError::NoHandler(topic.to_string())),
        }
    }

    async fn destroy(&mut self) -> Result<()> {
        if let Some(hook) = self.on_destroy.as_mut() {
            hook().await?;
        }
        Ok(())
    }

    fn metrics(&self) -> Map<String, Value> {
        self.metrics_fn.as_ref().map(|f| f()).unwrap_or_default()
    }
}

/// How a new actor's behaviour is specified.
pub enum ActorDefinition {
    /// A behaviour value. Only valid for in-memory children.
    Inline(Box<dyn Behavior>),
    /// A name resolved through the behaviour registry; required for
    /// forked and remote children.
    Registered(String),
}

impl ActorDefinition {
    pub fn behavior(behavior: impl Behavior) -> Self {
        ActorDefinition::Inline(Box::new(behavior))
    }
}

impl From<Handlers> for ActorDefinition {
    fn from(handlers: Handlers) -> Self {
        ActorDefinition::Inline(Box::new(handlers))
    }
}

impl From<&str> for ActorDefinition {
    fn from(name: &str) -> Self {
        ActorDefinition::Registered(name.to_string())
    }
}

impl From<String> for ActorDefinition {
    fn from(name: String) -> Self {
        ActorDefinition::Registered(name)
    }
}

type BehaviorFactory = Box<dyn Fn(&ResourceSet) -> Box<dyn Behavior> + Send + Sync>;

fn registry() -> &'static DashMap<String, BehaviorFactory> {
    static REGISTRY: OnceLock<DashMap<String, BehaviorFactory>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Register a behaviour factory under a name, making it creatable in any
/// mode from any process that links this code.
pub fn register_behavior<F>(name: impl Into<String>, factory: F)
where
    F: Fn(&ResourceSet) -> Box<dyn Behavior> + Send + Sync + 'static,
{
    registry().insert(name.into(), Box::new(factory));
}

pub(crate) fn resolve_behavior(name: &str, resources: &ResourceSet) -> Result<Box<dyn Behavior>> {
    match registry().get(name) {
        Some(factory) => Ok(factory(resources)),
        None => Err(ActorError::Config(format!(
            "behaviour \"{name}\" is not registered"
        ))),
    }
}
