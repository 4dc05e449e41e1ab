//! Name → handler factory mapping.
//!
//! Handlers are registered explicitly; there is no discovery. The stock
//! names are `files`, `null`, and (with their features) `redis` and
//! `memcached`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use keepsake_handler::{FileHandler, HandlerContext, NullHandler, SessionError, SessionHandler};

/// Builds a fresh handler for one request.
pub type HandlerFactory =
    Arc<dyn Fn(&HandlerContext) -> Result<Box<dyn SessionHandler>, SessionError> + Send + Sync>;

/// The set of handlers a [`SessionManager`](crate::SessionManager) can use.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in handler.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("files", |ctx| Ok(Box::new(FileHandler::new(ctx.clone()))));
        registry.register("null", |_| Ok(Box::new(NullHandler::new())));
        #[cfg(feature = "redis")]
        registry.register("redis", |ctx| {
            Ok(Box::new(keepsake_handler::RedisHandler::redis(ctx.clone())?))
        });
        #[cfg(feature = "memcached")]
        registry.register("memcached", |ctx| {
            Ok(Box::new(keepsake_handler::MemcachedHandler::memcached(
                ctx.clone(),
            )?))
        });
        registry
    }

    /// Adds (or replaces) the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&HandlerContext) -> Result<Box<dyn SessionHandler>, SessionError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if self.factories.insert(name.clone(), Arc::new(factory)).is_some() {
            tracing::debug!(handler = %name, "replaced session handler factory");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds the handler registered as `name`.
    ///
    /// # Errors
    /// [`SessionError::Configuration`] for unknown names, or whatever the
    /// factory reports.
    pub fn create(
        &self,
        name: &str,
        ctx: &HandlerContext,
    ) -> Result<Box<dyn SessionHandler>, SessionError> {
        let factory = self.factories.get(name).ok_or_else(|| {
            SessionError::Configuration(format!(
                "unknown session driver {name:?} (registered: {})",
                self.names().join(", ")
            ))
        })?;
        factory(ctx)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use keepsake_handler::HandlerConfig;

    use super::*;

    fn ctx() -> HandlerContext {
        HandlerContext::new(Arc::new(HandlerConfig::default()))
    }

    #[test]
    fn test_with_defaults_registers_builtin_handlers() {
        let registry = HandlerRegistry::with_defaults();

        assert!(registry.contains("files"));
        assert!(registry.contains("null"));
        #[cfg(feature = "redis")]
        assert!(registry.contains("redis"));
        #[cfg(feature = "memcached")]
        assert!(registry.contains("memcached"));
    }

    #[test]
    fn test_create_returns_named_handler() {
        let registry = HandlerRegistry::with_defaults();

        let handler = registry.create("null", &ctx()).unwrap();
        assert_eq!(handler.name(), "null");
    }

    #[test]
    fn test_create_unknown_name_is_configuration_error() {
        let registry = HandlerRegistry::with_defaults();

        let result = registry.create("mongo", &ctx());
        assert!(
            matches!(result, Err(SessionError::Configuration(ref msg)) if msg.contains("mongo")),
            "expected Configuration error naming the driver"
        );
    }

    #[test]
    fn test_register_replaces_existing_factory() {
        let mut registry = HandlerRegistry::new();
        registry.register("files", |_| Ok(Box::new(NullHandler::new())));

        let handler = registry.create("files", &ctx()).unwrap();
        assert_eq!(handler.name(), "null");
        assert_eq!(registry.names(), vec!["files"]);
    }

    #[cfg(feature = "redis")]
    #[test]
    fn test_redis_factory_rejects_bad_save_path() {
        let ctx = HandlerContext::new(Arc::new(HandlerConfig {
            save_path: "http://not-redis".into(),
            ..Default::default()
        }));

        let result = HandlerRegistry::with_defaults().create("redis", &ctx);
        assert!(matches!(result, Err(SessionError::Configuration(_))));
    }
}
