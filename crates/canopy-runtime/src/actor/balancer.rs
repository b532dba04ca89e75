//! Round-robin balancer over a cluster of same-behaviour children.
//!
//! A clustered `create_child` builds one balancer actor wrapping N
//! children, each created with cluster size 1 against a single resolved
//! endpoint. Sends rotate through the children; broadcasts fan out to all
//! of them. The balancer reports its children's mode label; no semantics
//! attach to it.

use super::{forked, in_memory, remote, ActorKind, ActorRef, ActorState};
use crate::behavior::ActorDefinition;
use crate::config::ResolvedOptions;
use crate::error::{ActorError, Result};
use crate::message::Msg;
use crate::system::SystemShared;
use canopy_protocol::{ActorId, Mode};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub(crate) struct BalancerState {
    counter: AtomicUsize,
}

pub(crate) async fn create_cluster(
    system: Arc<SystemShared>,
    parent: ActorRef,
    definition: ActorDefinition,
    options: ResolvedOptions,
) -> Result<ActorRef> {
    let definition = forked::registered_name(&definition)?;

    let balancer = ActorRef::construct(
        &system,
        ActorId::generate(),
        Some(parent),
        options.name.clone(),
        options.mode,
        options.custom_parameters.clone(),
        ActorKind::Balancer(BalancerState {
            counter: AtomicUsize::new(0),
        }),
    );

    for index in 0..options.cluster_size {
        let mut child_options = options.clone();
        child_options.cluster_size = 1;
        if !options.endpoints.is_empty() {
            // A single host with a larger cluster size puts every replica
            // on that host.
            child_options.endpoints =
                vec![options.endpoints[index % options.endpoints.len()].clone()];
        }

        let child_definition = ActorDefinition::Registered(definition.clone());
        let child = match options.mode {
            Mode::Forked => {
                forked::create(system.clone(), balancer.clone(), child_definition, &child_options)
                    .await?
            }
            Mode::Remote => {
                remote::create(system.clone(), balancer.clone(), child_definition, &child_options)
                    .await?
            }
            Mode::InMemory => {
                in_memory::create(
                    system.clone(),
                    ActorId::generate(),
                    Some(balancer.clone()),
                    child_definition,
                    &child_options,
                )
                .await?
            }
        };
        balancer.push_child(child);
    }

    balancer.set_state(ActorState::Ready);
    Ok(balancer)
}

pub(crate) fn next_child(balancer: &ActorRef, state: &BalancerState) -> Result<ActorRef> {
    let children = balancer
        .inner
        .children
        .lock()
        .map_err(|_| ActorError::Config("child registry poisoned".to_string()))?;
    if children.is_empty() {
        return Err(ActorError::Config("cluster has no children".to_string()));
    }
    let index = state.counter.fetch_add(1, Ordering::Relaxed) % children.len();
    Ok(children[index].clone())
}

pub(crate) async fn broadcast(balancer: &ActorRef, topic: &str, args: Vec<Msg>) -> Result<()> {
    let children: Vec<ActorRef> = balancer
        .inner
        .children
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or_default();

    for child in children {
        let args = super::duplicate_for_fanout(&args)?;
        child.send(topic, args).await?;
    }
    Ok(())
}

pub(crate) async fn broadcast_and_receive(
    balancer: &ActorRef,
    topic: &str,
    args: Vec<Msg>,
) -> Result<Vec<Value>> {
    let children: Vec<ActorRef> = balancer
        .inner
        .children
        .lock()
        .map(|guard| guard.clone())
        .unwrap_or_default();

    let mut requests = Vec::with_capacity(children.len());
    for child in &children {
        let args = super::duplicate_for_fanout(&args)?;
        requests.push(child.send_and_receive(topic, args));
    }
    futures::future::try_join_all(requests).await
}
