use std::collections::HashMap;
use std::fmt;

/// A deferred parameter application, bound to the state it mutates.
pub type ParamFn = Box<dyn FnOnce() + Send + 'static>;

/// Parameters in flight, keyed by the id of the component they target.
///
/// Each id maps to an ordered list of thunks. [`ParamSet::apply`] consumes a
/// component's thunks — parameters are applied at most once, in push order.
#[derive(Default)]
pub struct ParamSet {
    entries: HashMap<String, Vec<ParamFn>>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a thunk for the component identified by `id`.
    pub fn add(&mut self, id: impl Into<String>, apply: impl FnOnce() + Send + 'static) {
        self.entries
            .entry(id.into())
            .or_default()
            .push(Box::new(apply));
    }

    /// Run and remove every thunk queued for `id`, in push order.
    pub fn apply(&mut self, id: &str) {
        if let Some(thunks) = self.entries.remove(id) {
            for thunk in thunks {
                thunk();
            }
        }
    }

    /// Fold another set into this one, appending per id and preserving order.
    pub fn merge(&mut self, other: ParamSet) {
        for (id, thunks) in other.entries {
            self.entries.entry(id).or_default().extend(thunks);
        }
    }

    /// Extract the thunks queued for `id` into a new set.
    ///
    /// Used by the sink fan-out so each sink receives exactly the parameters
    /// addressed to it.
    pub fn split(&mut self, id: &str) -> ParamSet {
        let mut out = ParamSet::new();
        if let Some(thunks) = self.entries.remove(id) {
            out.entries.insert(id.to_string(), thunks);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ParamSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (id, thunks) in &self.entries {
            map.entry(id, &thunks.len());
        }
        map.finish()
    }
}
