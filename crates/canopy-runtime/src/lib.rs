pub mod actor;
pub mod behavior;
mod bus;
mod config;
pub mod error;
mod inbound;
pub mod marshal;
pub mod message;
mod pending;
pub mod resource;
pub mod server;
pub mod system;
pub mod worker;

pub use actor::{ActorRef, ActorState, CreateOptions, OnCrash, TopicMatcher, TreeNode};
pub use behavior::{register_behavior, ActorDefinition, Behavior, Handlers};
pub use canopy_protocol::{ActorId, Mode};
pub use error::{ActorError, Result};
pub use marshal::{register_marshaller, Marshaller};
pub use message::Msg;
pub use resource::{register_resource, Resource, ResourceSet};
pub use server::ServerHandle;
pub use system::{ActorSystem, SystemOptions};
