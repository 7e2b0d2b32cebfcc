use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{BatchError, BatchResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResourceKey {
    container: String,
    shared_name: String,
}

/// Lookup-or-create registry of shared resources keyed by
/// `(container, shared_name)`.
///
/// The first op invocation for a given key creates the resource; later
/// invocations of any op configured with the same key share it. Resources
/// live for the lifetime of their registration.
#[derive(Default)]
pub struct ResourceRegistry {
    resources: Mutex<HashMap<ResourceKey, Arc<dyn Any + Send + Sync>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_or_create<T, F>(
        &self,
        container: &str,
        shared_name: &str,
        create: F,
    ) -> BatchResult<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> BatchResult<Arc<T>>,
    {
        let key = ResourceKey {
            container: container.to_string(),
            shared_name: shared_name.to_string(),
        };
        let mut resources = self.resources.lock().unwrap();
        if let Some(existing) = resources.get(&key) {
            return existing.clone().downcast::<T>().map_err(|_| {
                BatchError::InvalidArgument(format!(
                    "resource {container}/{shared_name} exists but is not of the requested kind"
                ))
            });
        }
        let resource = create()?;
        resources.insert(key, resource.clone());
        Ok(resource)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.resources.lock().unwrap().len()
    }
}
