use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    RoutingRule,
    error::{Error, ErrorKind, Result},
    implement::MethodDispatcher,
    serializer::MethodSerializer,
};

/// One write-once map of the registry.
struct Table<V> {
    name: &'static str,
    map: RwLock<HashMap<String, V>>,
}

impl<V: Clone> Table<V> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            map: RwLock::default(),
        }
    }

    fn set(&self, key: &str, value: V) -> Result<()> {
        let mut map = self.map.write();
        if map.contains_key(key) {
            return Err(Error::new(
                ErrorKind::AlreadyRegistered,
                format!("{} already set for {key}", self.name),
            ));
        }
        map.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<V> {
        self.map.read().get(key).cloned().ok_or_else(|| {
            Error::new(
                ErrorKind::NotRegistered,
                format!("no {} registered for {key}", self.name),
            )
        })
    }
}

/// Process-wide service metadata: write-once associations populated by a
/// startup initialization routine and immutable afterwards.
///
/// Lookups on an unregistered key fail loudly: a missing entry is a
/// deployment/registration bug, not a runtime condition to recover from.
pub struct Registry {
    district: String,
    service_ids: Table<String>,
    dispatchers: Table<Arc<dyn MethodDispatcher>>,
    serializers: Table<Arc<dyn MethodSerializer>>,
    routing_rules: Table<Arc<RoutingRule>>,
}

impl Registry {
    #[must_use]
    pub fn new(district: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            district: district.into(),
            service_ids: Table::new("service id"),
            dispatchers: Table::new("dispatcher"),
            serializers: Table::new("serializer"),
            routing_rules: Table::new("routing rule"),
        })
    }

    /// Deployment/namespace scope used when computing transport addresses.
    #[must_use]
    pub fn district(&self) -> &str {
        &self.district
    }

    pub fn set_service_id(&self, service: &str, service_id: &str) -> Result<()> {
        self.service_ids.set(service, service_id.to_string())
    }

    pub fn service_id(&self, service: &str) -> Result<String> {
        self.service_ids.get(service)
    }

    pub fn set_dispatcher(&self, service: &str, dispatcher: Arc<dyn MethodDispatcher>) -> Result<()> {
        self.dispatchers.set(service, dispatcher)
    }

    pub fn dispatcher(&self, service: &str) -> Result<Arc<dyn MethodDispatcher>> {
        self.dispatchers.get(service)
    }

    pub fn set_serializer(&self, service: &str, serializer: Arc<dyn MethodSerializer>) -> Result<()> {
        self.serializers.set(service, serializer)
    }

    pub fn serializer(&self, service: &str) -> Result<Arc<dyn MethodSerializer>> {
        self.serializers.get(service)
    }

    /// Routing rules are keyed by service id, not service key. The key is
    /// stamped into the rule so adaptors can tag outbound envelopes.
    pub fn set_routing_rule(&self, service_id: &str, mut rule: RoutingRule) -> Result<()> {
        rule.service_id = service_id.to_string();
        self.routing_rules.set(service_id, Arc::new(rule))
    }

    pub fn routing_rule(&self, service_id: &str) -> Result<Arc<RoutingRule>> {
        self.routing_rules.get(service_id)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("district", &self.district)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::RmpSerializer;

    #[test]
    fn test_write_once() {
        let registry = Registry::new("dev");
        registry.set_service_id("Login", "login").unwrap();
        let err = registry.set_service_id("Login", "login2").unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyRegistered);
        assert_eq!(registry.service_id("Login").unwrap(), "login");
    }

    #[test]
    fn test_missing_lookup_is_loud() {
        let registry = Registry::new("dev");
        assert_eq!(
            registry.routing_rule("login").unwrap_err().kind,
            ErrorKind::NotRegistered
        );
        assert_eq!(
            registry.serializer("Login").err().unwrap().kind,
            ErrorKind::NotRegistered
        );

        registry
            .set_serializer("Login", Arc::new(RmpSerializer))
            .unwrap();
        registry.serializer("Login").unwrap();
    }
}
