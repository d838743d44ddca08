//! Path resolution — named base paths and change notifications.
//!
//! [`PathManager`] is the collaborator the lifecycle service consumes: it
//! turns a `(path, relative_to)` pair into an absolute path and lets the
//! service subscribe to changes of the base it is relative to.
//! [`PathRegistry`] is the in-process implementation used by the binary and
//! the tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::expand_home;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("unknown base path '{base}' for '{path}'")]
    UnknownBase { base: String, path: String },

    #[error("path registry lock poisoned")]
    Poisoned,
}

/// Delivered to subscribers when the base they are relative to changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEvent {
    /// Name of the base path that changed.
    pub base: String,
    /// Resolved location before the change (`None` if the base was undefined).
    pub previous: Option<PathBuf>,
    /// Resolved location after the change (`None` if the base was removed).
    pub current: Option<PathBuf>,
}

pub type PathCallback = Box<dyn Fn(&PathEvent) + Send + Sync>;

/// Token for an active subscription. Not `Clone`: handing it back to
/// [`PathManager::unsubscribe`] consumes it, so a subscription can only be
/// released once.
#[derive(Debug, PartialEq, Eq)]
pub struct CallbackHandle {
    id: u64,
}

impl CallbackHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub trait PathManager: Send + Sync {
    /// Resolve `path` against the named base, or as-is when `relative_to` is `None`.
    fn resolve(&self, path: &str, relative_to: Option<&str>) -> Result<PathBuf, PathError>;

    /// Register `on_change` for changes affecting `(path, relative_to)`.
    fn subscribe(&self, path: &str, relative_to: Option<&str>, on_change: PathCallback) -> CallbackHandle;

    /// Drop a subscription. Unknown handles are ignored.
    fn unsubscribe(&self, handle: CallbackHandle);
}

struct Subscription {
    path: String,
    relative_to: Option<String>,
    callback: Arc<dyn Fn(&PathEvent) + Send + Sync>,
}

#[derive(Default)]
struct RegistryInner {
    bases: HashMap<String, PathBuf>,
    subscriptions: HashMap<u64, Subscription>,
}

/// In-process [`PathManager`] backed by a table of named base paths.
#[derive(Default)]
pub struct PathRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
}

impl PathRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry pre-populated with `bases`. No callbacks exist yet,
    /// so nothing fires.
    pub fn with_bases<I, K, V>(bases: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PathBuf>,
    {
        let registry = Self::new();
        {
            let mut inner = registry.lock();
            for (k, v) in bases {
                inner.bases.insert(k.into(), v.into());
            }
        }
        registry
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn base(&self, name: &str) -> Option<PathBuf> {
        self.lock().bases.get(name).cloned()
    }

    /// Define or move a base path. Every subscription relative to `name` is
    /// notified exactly once if the value actually changed.
    ///
    /// Returns the number of callbacks invoked.
    pub fn set_base(&self, name: &str, path: impl Into<PathBuf>) -> usize {
        self.update_base(name, Some(path.into()))
    }

    /// Remove a base path, notifying subscribers with `current: None`.
    pub fn remove_base(&self, name: &str) -> usize {
        self.update_base(name, None)
    }

    fn update_base(&self, name: &str, new: Option<PathBuf>) -> usize {
        let pending: Vec<(Arc<dyn Fn(&PathEvent) + Send + Sync>, PathEvent)> = {
            let mut inner = self.lock();
            let previous = match &new {
                Some(p) => inner.bases.insert(name.to_string(), p.clone()),
                None => inner.bases.remove(name),
            };
            if previous == new {
                return 0;
            }
            info!(base = name, ?previous, current = ?new, "base path changed");

            inner
                .subscriptions
                .values()
                .filter(|s| s.relative_to.as_deref() == Some(name))
                .map(|s| {
                    let event = PathEvent {
                        base: name.to_string(),
                        previous: previous.as_ref().map(|b| b.join(&s.path)),
                        current: new.as_ref().map(|b| b.join(&s.path)),
                    };
                    (s.callback.clone(), event)
                })
                .collect()
        };

        // Callbacks run without the lock so they may call back into the registry.
        for (callback, event) in &pending {
            callback(event);
        }
        pending.len()
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }
}

impl PathManager for PathRegistry {
    fn resolve(&self, path: &str, relative_to: Option<&str>) -> Result<PathBuf, PathError> {
        let Some(base_name) = relative_to else {
            return Ok(expand_home(path));
        };
        let inner = self.inner.lock().map_err(|_| PathError::Poisoned)?;
        let base = inner
            .bases
            .get(base_name)
            .ok_or_else(|| PathError::UnknownBase {
                base: base_name.to_string(),
                path: path.to_string(),
            })?;
        Ok(base.join(path))
    }

    fn subscribe(&self, path: &str, relative_to: Option<&str>, on_change: PathCallback) -> CallbackHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().subscriptions.insert(
            id,
            Subscription {
                path: path.to_string(),
                relative_to: relative_to.map(str::to_string),
                callback: Arc::from(on_change),
            },
        );
        debug!(id, path, relative_to, "path callback registered");
        CallbackHandle { id }
    }

    fn unsubscribe(&self, handle: CallbackHandle) {
        if self.lock().subscriptions.remove(&handle.id).is_some() {
            debug!(id = handle.id, "path callback removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (Arc<AtomicUsize>, PathCallback) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, Box::new(move |_: &PathEvent| {
            h.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn resolves_relative_to_named_base() {
        let reg = PathRegistry::with_bases([("log.dir", "/var/log/host")]);
        assert_eq!(
            reg.resolve("access.log", Some("log.dir")).unwrap(),
            PathBuf::from("/var/log/host/access.log")
        );
    }

    #[test]
    fn resolves_plain_path_without_base() {
        let reg = PathRegistry::new();
        assert_eq!(reg.resolve("/etc/a.conf", None).unwrap(), PathBuf::from("/etc/a.conf"));
    }

    #[test]
    fn unknown_base_fails() {
        let reg = PathRegistry::new();
        let err = reg.resolve("a.log", Some("nope")).unwrap_err();
        assert_eq!(
            err,
            PathError::UnknownBase {
                base: "nope".into(),
                path: "a.log".into()
            }
        );
    }

    #[test]
    fn change_fires_each_matching_subscription_once() {
        let reg = PathRegistry::with_bases([("log.dir", "/a")]);
        let (hits, cb) = counting();
        let (other_hits, other_cb) = counting();
        let _h = reg.subscribe("x.log", Some("log.dir"), cb);
        let _o = reg.subscribe("y.log", Some("data.dir"), other_cb);

        assert_eq!(reg.set_base("log.dir", "/b"), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(other_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unchanged_value_does_not_fire() {
        let reg = PathRegistry::with_bases([("log.dir", "/a")]);
        let (hits, cb) = counting();
        let _h = reg.subscribe("x.log", Some("log.dir"), cb);
        assert_eq!(reg.set_base("log.dir", "/a"), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn event_carries_old_and_new_locations() {
        let reg = PathRegistry::with_bases([("log.dir", "/a")]);
        let seen: Arc<Mutex<Vec<PathEvent>>> = Arc::default();
        let s = seen.clone();
        let _h = reg.subscribe(
            "x.log",
            Some("log.dir"),
            Box::new(move |e: &PathEvent| s.lock().unwrap().push(e.clone())),
        );
        reg.set_base("log.dir", "/b");
        reg.remove_base("log.dir");

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].previous, Some(PathBuf::from("/a/x.log")));
        assert_eq!(seen[0].current, Some(PathBuf::from("/b/x.log")));
        assert_eq!(seen[1].current, None);
    }

    #[test]
    fn unsubscribed_callback_never_fires() {
        let reg = PathRegistry::with_bases([("log.dir", "/a")]);
        let (hits, cb) = counting();
        let h = reg.subscribe("x.log", Some("log.dir"), cb);
        assert_eq!(reg.subscription_count(), 1);
        reg.unsubscribe(h);
        assert_eq!(reg.subscription_count(), 0);
        reg.set_base("log.dir", "/b");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_reenter_registry() {
        let reg = Arc::new(PathRegistry::with_bases([("log.dir", "/a")]));
        let r = reg.clone();
        let _h = reg.subscribe(
            "x.log",
            Some("log.dir"),
            Box::new(move |_: &PathEvent| {
                r.resolve("x.log", Some("log.dir")).unwrap();
            }),
        );
        assert_eq!(reg.set_base("log.dir", "/b"), 1);
    }
}
