use dashmap::DashMap;
use ulid::Ulid;

use super::template::TemplateId;

/// Something that can sit in the pool registry.
pub trait Pooled {
    fn pool_id(&self) -> Ulid;
}

/// Retired instances available for reuse, keyed by template.
///
/// Each template's entry is a stack: `acquire` hands back the most recently
/// released instance.
pub struct PoolRegistry<T> {
    retired: DashMap<TemplateId, Vec<T>>,
}

impl<T: Pooled> PoolRegistry<T> {
    pub fn new() -> Self {
        Self {
            retired: DashMap::new(),
        }
    }

    /// Pop the most recently released instance for `template`
    pub fn acquire(&self, template: TemplateId) -> Option<T> {
        self.retired.get_mut(&template).and_then(|mut entry| entry.pop())
    }

    /// Push `item` into `template`'s entry.
    ///
    /// Releasing an instance that is already retired is a no-op; returns
    /// whether the item was actually inserted.
    pub fn release(&self, template: TemplateId, item: T) -> bool {
        let id = item.pool_id();
        let mut entry = self.retired.entry(template).or_default();
        if entry.iter().any(|retired| retired.pool_id() == id) {
            return false;
        }
        entry.push(item);
        true
    }

    pub fn retired_count(&self, template: TemplateId) -> usize {
        self.retired.get(&template).map(|entry| entry.len()).unwrap_or(0)
    }

    pub fn total_retired(&self) -> usize {
        self.retired.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn contains(&self, template: TemplateId, id: Ulid) -> bool {
        self.retired
            .get(&template)
            .map(|entry| entry.iter().any(|retired| retired.pool_id() == id))
            .unwrap_or(false)
    }

    /// Take every retired instance out of the registry
    pub fn drain(&self) -> Vec<(TemplateId, T)> {
        let templates: Vec<TemplateId> = self.retired.iter().map(|entry| *entry.key()).collect();
        let mut drained = Vec::new();
        for template in templates {
            if let Some((_, items)) = self.retired.remove(&template) {
                drained.extend(items.into_iter().map(|item| (template, item)));
            }
        }
        drained
    }
}

impl<T: Pooled> Default for PoolRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::template::EffectTemplate;

    #[derive(Debug)]
    struct Item(Ulid);

    impl Pooled for Item {
        fn pool_id(&self) -> Ulid {
            self.0
        }
    }

    fn template_id() -> TemplateId {
        EffectTemplate::new("t", "", Vec::new()).id()
    }

    #[test]
    fn test_acquire_on_empty_registry() {
        let registry: PoolRegistry<Item> = PoolRegistry::new();
        assert!(registry.acquire(template_id()).is_none());
    }

    #[test]
    fn test_acquire_returns_most_recent_release() {
        let registry = PoolRegistry::new();
        let template = template_id();
        let first = Ulid::new();
        let second = Ulid::new();

        assert!(registry.release(template, Item(first)));
        assert!(registry.release(template, Item(second)));
        assert_eq!(registry.retired_count(template), 2);

        assert_eq!(registry.acquire(template).unwrap().0, second);
        assert_eq!(registry.acquire(template).unwrap().0, first);
        assert!(registry.acquire(template).is_none());
    }

    #[test]
    fn test_double_release_is_idempotent() {
        let registry = PoolRegistry::new();
        let template = template_id();
        let id = Ulid::new();

        assert!(registry.release(template, Item(id)));
        assert!(!registry.release(template, Item(id)));
        assert_eq!(registry.retired_count(template), 1);
        assert!(registry.contains(template, id));
    }

    #[test]
    fn test_entries_are_per_template() {
        let registry = PoolRegistry::new();
        let a = template_id();
        let b = template_id();

        registry.release(a, Item(Ulid::new()));
        assert!(registry.acquire(b).is_none());
        assert_eq!(registry.retired_count(a), 1);
        assert_eq!(registry.total_retired(), 1);
    }

    #[test]
    fn test_drain_empties_registry() {
        let registry = PoolRegistry::new();
        let a = template_id();
        let b = template_id();
        registry.release(a, Item(Ulid::new()));
        registry.release(a, Item(Ulid::new()));
        registry.release(b, Item(Ulid::new()));

        let drained = registry.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained.iter().filter(|(t, _)| *t == a).count(), 2);
        assert_eq!(registry.total_retired(), 0);
    }
}
