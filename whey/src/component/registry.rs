use std::collections::HashMap;
use std::sync::Arc;

use crate::app::{Application, Redirector};
use crate::Error;

type AppFactory =
    Arc<dyn Fn(&str, &serde_json::Value) -> Result<Arc<dyn Application>, Error> + Send + Sync>;

/// The `class` registry for applications: maps a class name from
/// configuration to a factory producing instances of it.
///
/// Factories receive the instance name and the class-specific slice of the
/// config tree, and are expected to validate it eagerly so malformed
/// configuration fails the build rather than the first request.
#[derive(Clone)]
pub struct AppRegistry {
    factories: HashMap<String, AppFactory>,
}

impl AppRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the bundled application classes.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .register("redirector", |name, options| {
                let config = serde_json::from_value(options.clone())
                    .map_err(|error| Error::config(format!("redirector {name:?}: {error}")))?;
                Ok(Arc::new(Redirector::new(name, config)?) as Arc<dyn Application>)
            })
            .expect("empty registry cannot collide");
        registry
    }

    /// Registers a factory for a class name. Duplicate classes are an
    /// error.
    pub fn register<F>(&mut self, class: impl Into<String>, factory: F) -> Result<(), Error>
    where
        F: Fn(&str, &serde_json::Value) -> Result<Arc<dyn Application>, Error>
            + Send
            + Sync
            + 'static,
    {
        let class = class.into();
        if self.factories.contains_key(&class) {
            return Err(Error::config(format!(
                "application class {class:?} registered twice"
            )));
        }
        self.factories.insert(class, Arc::new(factory));
        Ok(())
    }

    /// Instantiates an application of the given class.
    pub fn create(
        &self,
        class: &str,
        name: &str,
        options: &serde_json::Value,
    ) -> Result<Arc<dyn Application>, Error> {
        let factory = self.factories.get(class).ok_or_else(|| {
            Error::config(format!("unknown application class {class:?} for {name:?}"))
        })?;
        factory(name, options)
    }
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for AppRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut classes: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        classes.sort_unstable();
        f.debug_struct("AppRegistry").field("classes", &classes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_redirector_is_registered() {
        let registry = AppRegistry::with_builtins();
        let app = registry
            .create(
                "redirector",
                "r",
                &serde_json::json!({ "target": "https://milk.com/" }),
            )
            .unwrap();
        assert_eq!(app.name(), "r");
    }

    #[test]
    fn unknown_class_is_an_error() {
        let registry = AppRegistry::with_builtins();
        assert!(registry
            .create("no-such-class", "x", &serde_json::Value::Null)
            .is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = AppRegistry::with_builtins();
        let result = registry.register("redirector", |_, _| unreachable!());
        assert!(result.is_err());
    }
}
