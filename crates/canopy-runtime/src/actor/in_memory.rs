//! In-memory actors: direct invocation of the behaviour on the local
//! runtime. Fire-and-forget sends return once the invocation is spawned;
//! request/response sends await the handler.

use super::{ActorKind, ActorRef, ActorState};
use crate::behavior::{resolve_behavior, ActorDefinition, Behavior};
use crate::config::ResolvedOptions;
use crate::error::{ActorError, Result};
use crate::message::Msg;
use crate::system::SystemShared;
use canopy_protocol::{ActorId, Mode};
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;

pub(crate) struct InMemoryState {
    pub behavior: Arc<Mutex<Box<dyn Behavior>>>,
}

pub(crate) async fn create(
    system: Arc<SystemShared>,
    id: ActorId,
    parent: Option<ActorRef>,
    definition: ActorDefinition,
    options: &ResolvedOptions,
) -> Result<ActorRef> {
    let behavior = match definition {
        ActorDefinition::Inline(behavior) => behavior,
        ActorDefinition::Registered(name) => {
            let resources = system.resources().await?;
            resolve_behavior(&name, resources)?
        }
    };

    let state = InMemoryState {
        behavior: Arc::new(Mutex::new(behavior)),
    };
    let behavior = state.behavior.clone();
    let actor = ActorRef::construct(
        &system,
        id,
        parent,
        options.name.clone(),
        Mode::InMemory,
        options.custom_parameters.clone(),
        ActorKind::InMemory(state),
    );

    // The initialize hook runs with the actor still in `new`; sends to it
    // fail until it completes.
    {
        let mut behavior = behavior.lock().await;
        if let Err(err) = behavior.initialize(&actor).await {
            system.actor_table.remove(&actor.id());
            actor.set_state(ActorState::Destroyed);
            return Err(err);
        }
    }
    actor.set_state(ActorState::Ready);
    Ok(actor)
}

pub(crate) async fn send0(
    actor: &ActorRef,
    state: &InMemoryState,
    topic: &str,
    args: Vec<Msg>,
    receive: bool,
) -> Result<Value> {
    if receive {
        let mut behavior = state.behavior.lock().await;
        if !behavior.handles(topic) {
            return Err(ActorError::NoHandler(topic.to_string()));
        }
        match AssertUnwindSafe(behavior.handle(topic, args)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(ActorError::Handler(panic_message(panic))),
        }
    } else {
        {
            let behavior = state.behavior.lock().await;
            if !behavior.handles(topic) {
                return Err(ActorError::NoHandler(topic.to_string()));
            }
        }

        let behavior = state.behavior.clone();
        let topic = topic.to_string();
        let actor_id = actor.id();
        tokio::spawn(async move {
            let mut behavior = behavior.lock().await;
            match AssertUnwindSafe(behavior.handle(&topic, args)).catch_unwind().await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::warn!(actor = %actor_id, topic = %topic, "handler failed: {err}");
                }
                Err(panic) => {
                    tracing::warn!(
                        actor = %actor_id,
                        topic = %topic,
                        "handler panicked: {}",
                        panic_message(panic)
                    );
                }
            }
        });
        Ok(Value::Null)
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "handler panicked".to_string()
    }
}
