//! Built-in handlers. Deployments extend the registry with their own.

mod actor_profile;
mod echo;
mod sleep_fail;

pub use actor_profile::ActorProfileBackfill;
pub use echo::Echo;
pub use sleep_fail::SleepThenFail;

use std::sync::Arc;

use crate::handler::HandlerRegistry;

pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(Echo));
    registry.register(Arc::new(SleepThenFail));
    registry.register(Arc::new(ActorProfileBackfill::default()));
    registry
}
