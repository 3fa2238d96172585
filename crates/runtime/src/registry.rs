use cirrus_common::credentials::EndpointIdentity;
use cirrus_connectors::sources::d1::TableDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One attached database.
#[derive(Debug, Clone)]
pub struct AttachmentEntry {
    pub alias: String,
    pub database_name: String,
    pub database_id: String,
    pub identity: EndpointIdentity,
    /// Secret the identity was resolved from, if any.
    pub secret: Option<String>,
    pub tables: Vec<TableDescriptor>,
}

/// Attached databases keyed by alias. A later registration under the same
/// alias replaces the earlier one.
#[derive(Debug, Default)]
pub struct AttachmentRegistry {
    entries: Mutex<HashMap<String, Arc<AttachmentEntry>>>,
}

impl AttachmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Arc<AttachmentEntry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entry that was replaced, if any.
    pub fn register(&self, entry: AttachmentEntry) -> Option<Arc<AttachmentEntry>> {
        let alias = entry.alias.clone();
        let previous = self.entries().insert(alias.clone(), Arc::new(entry));
        if let Some(previous) = &previous {
            tracing::warn!(
                alias = %alias,
                previous_database = %previous.database_name,
                "Attachment replaced an existing alias"
            );
        }
        previous
    }

    pub fn lookup(&self, alias: &str) -> Option<Arc<AttachmentEntry>> {
        self.entries().get(alias).cloned()
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.entries().contains_key(alias)
    }

    pub fn unregister(&self, alias: &str) -> Option<Arc<AttachmentEntry>> {
        self.entries().remove(alias)
    }

    /// Aliases in sorted order.
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.entries().keys().cloned().collect();
        aliases.sort();
        aliases
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(alias: &str, database: &str) -> AttachmentEntry {
        AttachmentEntry {
            alias: alias.to_string(),
            database_name: database.to_string(),
            database_id: format!("{}-id", database),
            identity: EndpointIdentity::new("acct", "tok").with_target(format!("{}-id", database)),
            secret: None,
            tables: vec![],
        }
    }

    #[test]
    fn test_last_writer_wins() {
        let registry = AttachmentRegistry::new();
        assert!(registry.register(entry("demo", "first")).is_none());
        let replaced = registry.register(entry("demo", "second")).unwrap();
        assert_eq!(replaced.database_name, "first");
        assert_eq!(registry.lookup("demo").unwrap().database_name, "second");
        assert_eq!(registry.aliases(), vec!["demo"]);
    }

    #[test]
    fn test_unregister() {
        let registry = AttachmentRegistry::new();
        registry.register(entry("b", "b"));
        registry.register(entry("a", "a"));
        assert_eq!(registry.aliases(), vec!["a", "b"]);
        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert!(!registry.contains("a"));
        assert!(registry.contains("b"));
    }

    #[test]
    fn test_concurrent_registration_keeps_one_entry_per_alias() {
        let registry = Arc::new(AttachmentRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    registry.register(entry("shared", &format!("db{}", i)));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.aliases(), vec!["shared"]);
    }
}
