use std::sync::Arc;

use skyflow::handler::HandlerRegistry;

/// The registry this deployment runs with. Built-ins plus anything
/// site-specific registered below.
pub fn build_registry() -> Arc<HandlerRegistry> {
    let registry = skyflow::handlers::builtin_registry();
    // Site-specific handlers: make `registry` mut and register them here.
    Arc::new(registry)
}
