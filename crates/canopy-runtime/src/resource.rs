//! Resource definitions injected into behaviours.
//!
//! Resources are named, possibly interdependent singletons (connection
//! pools, caches) initialized before any behaviour that uses them.
//! Dependencies form a DAG; cycles are rejected during initialization with
//! the offending path in the error.

use crate::error::{ActorError, Result};
use dashmap::DashMap;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

#[async_trait::async_trait]
pub trait Resource: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Names of resources that must be initialized before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn initialize(&mut self, _resources: &ResourceSet) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    /// Escape hatch for consumers to downcast to the concrete type.
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

/// Initialized resources, in dependency order.
#[derive(Default)]
pub struct ResourceSet {
    by_name: HashMap<String, Arc<dyn Resource>>,
    init_order: Vec<String>,
}

impl std::fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceSet")
            .field("init_order", &self.init_order)
            .finish_non_exhaustive()
    }
}

impl ResourceSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Resource>> {
        self.by_name.get(name)
    }

    pub fn get_as<T: 'static>(&self, name: &str) -> Option<&T> {
        self.by_name.get(name)?.as_any().downcast_ref::<T>()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.init_order.iter().map(String::as_str)
    }

    /// Tear down in reverse initialization order, logging failures.
    pub(crate) async fn destroy_all(&self) {
        for name in self.init_order.iter().rev() {
            if let Some(resource) = self.by_name.get(name) {
                if let Err(err) = resource.destroy().await {
                    tracing::warn!(resource = %name, "resource destroy failed: {err}");
                }
            }
        }
    }
}

type ResourceFactory = Box<dyn Fn() -> Box<dyn Resource> + Send + Sync>;

fn registry() -> &'static DashMap<String, ResourceFactory> {
    static REGISTRY: OnceLock<DashMap<String, ResourceFactory>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Register a resource factory under a name, making it instantiable in
/// worker processes from the names carried by the bootstrap envelope.
pub fn register_resource<F>(name: impl Into<String>, factory: F)
where
    F: Fn() -> Box<dyn Resource> + Send + Sync + 'static,
{
    registry().insert(name.into(), Box::new(factory));
}

fn instantiate(name: &str) -> Result<Box<dyn Resource>> {
    match registry().get(name) {
        Some(factory) => Ok(factory()),
        None => Err(ActorError::Config(format!(
            "resource \"{name}\" is not registered"
        ))),
    }
}

/// Instantiate and initialize the named resources plus their transitive
/// dependencies, honouring the dependency DAG.
pub(crate) async fn initialize_resources(names: &[String]) -> Result<ResourceSet> {
    let mut pending: HashMap<String, Box<dyn Resource>> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut stack: Vec<String> = Vec::new();

    fn visit(
        name: &str,
        pending: &mut HashMap<String, Box<dyn Resource>>,
        order: &mut Vec<String>,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        if order.iter().any(|n| n == name) {
            return Ok(());
        }
        if stack.iter().any(|n| n == name) {
            let mut path = stack.join(" -> ");
            path.push_str(" -> ");
            path.push_str(name);
            return Err(ActorError::Config(format!(
                "cyclic resource dependency: {path}"
            )));
        }

        stack.push(name.to_string());
        if !pending.contains_key(name) {
            pending.insert(name.to_string(), instantiate(name)?);
        }
        let deps = pending[name].dependencies();
        for dep in &deps {
            visit(dep, pending, order, stack)?;
        }
        stack.pop();
        order.push(name.to_string());
        Ok(())
    }

    for name in names {
        visit(name, &mut pending, &mut order, &mut stack)?;
    }

    let mut set = ResourceSet::empty();
    for name in order {
        let mut resource = pending
            .remove(&name)
            .ok_or_else(|| ActorError::Config(format!("resource \"{name}\" vanished")))?;
        resource.initialize(&set).await?;
        set.by_name.insert(name.clone(), Arc::from(resource));
        set.init_order.push(name);
    }
    Ok(set)
}
