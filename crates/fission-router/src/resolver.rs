//! Function reference resolution.
//!
//! A trigger names its function either directly or as a weighted set.
//! Resolution reads the Function catalog and memoizes the result per
//! trigger revision, so a trigger is only re-resolved when it changes or
//! when one of its functions moves to a new resource version.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use fission_core::{FissionError, FissionResult, Function, FunctionReferenceType, HttpTrigger};
use fission_state::StateStore;
use rand::Rng;
use tracing::debug;

/// Memo key: one entry per trigger revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerRef {
    pub namespace: String,
    pub trigger: String,
    pub resource_version: String,
}

impl TriggerRef {
    pub fn of(trigger: &HttpTrigger) -> Self {
        Self {
            namespace: trigger.metadata.namespace.clone(),
            trigger: trigger.metadata.name.clone(),
            resource_version: trigger.metadata.resource_version.clone(),
        }
    }
}

/// The functions behind a trigger.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub kind: FunctionReferenceType,
    pub functions: BTreeMap<String, Function>,
    /// Function name to weight. Empty for single-function references.
    pub weights: BTreeMap<String, u32>,
}

impl Resolved {
    pub fn single(function: Function) -> Self {
        Self {
            kind: FunctionReferenceType::Name,
            functions: BTreeMap::from([(function.metadata.name.clone(), function)]),
            weights: BTreeMap::new(),
        }
    }

    /// Pick the function for one request. Weighted sets draw a number in
    /// `[0, total)` and walk the cumulative weights.
    pub fn choose(&self) -> Option<&Function> {
        match self.kind {
            FunctionReferenceType::Name => self.functions.values().next(),
            FunctionReferenceType::FunctionWeights => {
                let total: u32 = self.weights.values().sum();
                if total == 0 {
                    return None;
                }
                let draw = rand::thread_rng().gen_range(0..total);
                self.pick(draw)
            }
        }
    }

    fn pick(&self, draw: u32) -> Option<&Function> {
        let mut ceiling = 0;
        for (name, weight) in &self.weights {
            ceiling += weight;
            if draw < ceiling {
                return self.functions.get(name);
            }
        }
        None
    }
}

pub struct FunctionResolver {
    store: StateStore,
    memo: Mutex<HashMap<TriggerRef, Resolved>>,
}

impl FunctionResolver {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, trigger: &HttpTrigger) -> FissionResult<Resolved> {
        let key = TriggerRef::of(trigger);
        if let Some(hit) = self.lock().get(&key) {
            return Ok(hit.clone());
        }

        let namespace = &trigger.metadata.namespace;
        let reference = &trigger.spec.function_reference;
        let resolved = match reference.kind {
            FunctionReferenceType::Name => Resolved::single(self.function(namespace, &reference.name)?),
            FunctionReferenceType::FunctionWeights => {
                if reference.function_weights.is_empty() {
                    return Err(FissionError::invalid_argument(format!(
                        "trigger {namespace}/{} has no function weights",
                        trigger.metadata.name
                    )));
                }
                let mut functions = BTreeMap::new();
                for name in reference.function_weights.keys() {
                    functions.insert(name.clone(), self.function(namespace, name)?);
                }
                Resolved {
                    kind: FunctionReferenceType::FunctionWeights,
                    functions,
                    weights: reference.function_weights.clone(),
                }
            }
        };

        debug!(trigger = %key.trigger, namespace = %key.namespace, functions = resolved.functions.len(), "resolved trigger");
        self.lock().insert(key, resolved.clone());
        Ok(resolved)
    }

    fn function(&self, namespace: &str, name: &str) -> FissionResult<Function> {
        self.store
            .get::<Function>(namespace, name)?
            .ok_or_else(|| FissionError::not_found(format!("function {namespace}/{name} not found")))
    }

    pub fn copy(&self) -> HashMap<TriggerRef, Resolved> {
        self.lock().clone()
    }

    pub fn delete(&self, key: &TriggerRef) {
        self.lock().remove(key);
    }

    /// Forget every memo that holds `function` at a different resource
    /// version. Returns how many were dropped.
    pub fn invalidate_function(&self, function: &Function) -> usize {
        let meta = &function.metadata;
        let stale: Vec<TriggerRef> = self
            .lock()
            .iter()
            .filter(|(key, resolved)| {
                key.namespace == meta.namespace
                    && resolved
                        .functions
                        .get(&meta.name)
                        .is_some_and(|f| f.metadata.resource_version != meta.resource_version)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.delete(key);
        }
        stale.len()
    }

    /// Forget every memo that refers to a deleted function.
    pub fn forget_function(&self, namespace: &str, name: &str) -> usize {
        let mut memo = self.lock();
        let before = memo.len();
        memo.retain(|key, resolved| key.namespace != namespace || !resolved.functions.contains_key(name));
        before - memo.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TriggerRef, Resolved>> {
        self.memo.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use fission_core::{FunctionReference, HttpTriggerSpec, ObjectMeta};

    use super::*;

    fn store_with(names: &[&str]) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        for name in names {
            store
                .create(Function {
                    metadata: ObjectMeta::new("default", name),
                    ..Default::default()
                })
                .unwrap();
        }
        store
    }

    fn trigger(reference: FunctionReference) -> HttpTrigger {
        HttpTrigger {
            metadata: ObjectMeta {
                resource_version: "1".into(),
                ..ObjectMeta::new("default", "t")
            },
            spec: HttpTriggerSpec {
                relative_url: "/hello".into(),
                function_reference: reference,
                ..Default::default()
            },
        }
    }

    fn by_name(name: &str) -> FunctionReference {
        FunctionReference {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_named_function() {
        let resolver = FunctionResolver::new(store_with(&["hello"]));
        let resolved = resolver.resolve(&trigger(by_name("hello"))).unwrap();
        assert_eq!(resolved.choose().unwrap().metadata.name, "hello");
        assert_eq!(resolver.copy().len(), 1);
    }

    #[test]
    fn missing_function_is_not_found() {
        let resolver = FunctionResolver::new(store_with(&[]));
        let err = resolver.resolve(&trigger(by_name("nope"))).unwrap_err();
        assert!(err.is(fission_core::ErrorCode::NotFound));
        assert!(resolver.copy().is_empty());
    }

    #[test]
    fn weighted_pick_walks_cumulative_weights() {
        let resolver = FunctionResolver::new(store_with(&["v1", "v2"]));
        let reference = FunctionReference {
            kind: FunctionReferenceType::FunctionWeights,
            function_weights: BTreeMap::from([("v1".to_string(), 80), ("v2".to_string(), 20)]),
            ..Default::default()
        };
        let resolved = resolver.resolve(&trigger(reference)).unwrap();
        assert_eq!(resolved.pick(0).unwrap().metadata.name, "v1");
        assert_eq!(resolved.pick(79).unwrap().metadata.name, "v1");
        assert_eq!(resolved.pick(80).unwrap().metadata.name, "v2");
        assert!(resolved.pick(100).is_none());
        for _ in 0..50 {
            assert!(resolved.choose().is_some());
        }
    }

    #[test]
    fn function_update_invalidates_memo() {
        let store = store_with(&["hello"]);
        let resolver = FunctionResolver::new(store.clone());
        resolver.resolve(&trigger(by_name("hello"))).unwrap();

        let current = store.get::<Function>("default", "hello").unwrap().unwrap();
        assert_eq!(resolver.invalidate_function(&current), 0);

        let mut updated = current.clone();
        updated.spec.function_timeout = 9;
        let updated = store.update(updated).unwrap();
        assert_eq!(resolver.invalidate_function(&updated), 1);
        assert!(resolver.copy().is_empty());
    }
}
