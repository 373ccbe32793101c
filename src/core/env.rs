//! The supervisor-wide environment store.
//!
//! Holds the `NAME=value` set handed to newly launched services. The control
//! protocol mutates it through [`EnvStore::apply`], which accepts either an
//! assignment (`NAME=value`) or a bare name (unset) and reports whether an
//! existing binding was displaced; subscribed connections need that bit for
//! the event they broadcast.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Weak;

use thiserror::Error;

use super::ModelObserver;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("malformed environment assignment")]
    Malformed,
}

/// Result of one [`EnvStore::apply`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvUpdate {
    /// True when the operation replaced or removed an existing binding.
    pub overridden: bool,
}

#[derive(Default)]
pub struct EnvStore {
    vars: RefCell<BTreeMap<String, String>>,
    observers: RefCell<Vec<Weak<dyn ModelObserver>>>,
}

impl EnvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: Weak<dyn ModelObserver>) {
        self.observers.borrow_mut().push(observer);
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.vars.borrow().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.vars.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.borrow().is_empty()
    }

    /// Apply `NAME=value` (set) or `NAME` (unset) and notify observers.
    pub fn apply(&self, text: &str) -> Result<EnvUpdate, EnvError> {
        let (name, value) = match text.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (text, None),
        };
        if name.is_empty() || name.contains('\0') || value.is_some_and(|v| v.contains('\0')) {
            return Err(EnvError::Malformed);
        }

        let overridden = {
            let mut vars = self.vars.borrow_mut();
            match value {
                Some(value) => vars.insert(name.to_string(), value.to_string()).is_some(),
                None => vars.remove(name).is_some(),
            }
        };

        self.notify(text, overridden);
        Ok(EnvUpdate { overridden })
    }

    fn notify(&self, text: &str, overridden: bool) {
        let observers: Vec<_> = {
            let mut observers = self.observers.borrow_mut();
            observers.retain(|w| w.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.env_event(text, overridden);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_set_is_not_an_override() {
        let env = EnvStore::new();
        assert_eq!(env.apply("FOO=bar").unwrap(), EnvUpdate { overridden: false });
        assert_eq!(env.get("FOO").as_deref(), Some("bar"));
    }

    #[test]
    fn replacing_and_unsetting_report_override() {
        let env = EnvStore::new();
        env.apply("FOO=bar").unwrap();
        assert!(env.apply("FOO=baz").unwrap().overridden);
        assert_eq!(env.get("FOO").as_deref(), Some("baz"));

        assert!(env.apply("FOO").unwrap().overridden);
        assert_eq!(env.get("FOO"), None);

        // No binding left: unsetting again is not an override.
        assert!(!env.apply("FOO").unwrap().overridden);
    }

    #[test]
    fn empty_value_is_a_binding() {
        let env = EnvStore::new();
        env.apply("FOO=").unwrap();
        assert_eq!(env.get("FOO").as_deref(), Some(""));
        assert!(env.apply("FOO").unwrap().overridden);
    }

    #[test]
    fn malformed_rejected() {
        let env = EnvStore::new();
        assert_eq!(env.apply(""), Err(EnvError::Malformed));
        assert_eq!(env.apply("=value"), Err(EnvError::Malformed));
        assert_eq!(env.apply("FO\0O=x"), Err(EnvError::Malformed));
    }
}
