//! Capability attachment.
//!
//! A capability is a named facet of a drive or block object (`partition`,
//! `filesystem`, `drive-ata`, ...). Each kind is described by a
//! [`CapabilityDef`]: an applicability test, a one-time connect hook and a
//! refresh function. [`reconcile`] is the single protocol used for built-in
//! and module-supplied kinds alike.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::configuration::ConfigSnapshot;
use super::device::UeventAction;
use super::graph::ObjectGraph;
use super::mounts::MountTable;
use crate::config::DriveSettings;

pub type CapabilityKind = &'static str;

/// Read-only view handed to capability functions during a dispatch cycle.
pub struct Env<'a> {
    pub graph: &'a ObjectGraph,
    pub mounts: &'a MountTable,
    pub config: &'a ConfigSnapshot,
    pub drive_settings: &'a HashMap<String, DriveSettings>,
}

/// Published state of one capability on one object.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Representation {
    props: Map<String, Value>,
}

impl Representation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all properties with the serialized form of `value`.
    /// Returns true when anything changed.
    pub fn set(&mut self, value: impl Serialize) -> bool {
        let props = match serde_json::to_value(value) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        if props == self.props {
            return false;
        }
        self.props = props;
        true
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.props.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.props.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(Value::Object(self.props.clone())).ok()
    }

    pub fn props(&self) -> &Map<String, Value> {
        &self.props
    }
}

pub type AppliesFn<O> = Box<dyn Fn(&O, &Env<'_>) -> bool + Send + Sync>;
pub type ConnectFn<O> = Box<dyn Fn(&O, &mut Representation) + Send + Sync>;
pub type RefreshFn<O> =
    Box<dyn Fn(&O, &Env<'_>, UeventAction, &mut Representation) -> bool + Send + Sync>;

pub struct CapabilityDef<O> {
    pub kind: CapabilityKind,
    pub applies: AppliesFn<O>,
    pub connect: ConnectFn<O>,
    pub refresh: RefreshFn<O>,
}

impl<O> CapabilityDef<O> {
    pub fn new(
        kind: CapabilityKind,
        applies: impl Fn(&O, &Env<'_>) -> bool + Send + Sync + 'static,
        refresh: impl Fn(&O, &Env<'_>, UeventAction, &mut Representation) -> bool
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            kind,
            applies: Box::new(applies),
            connect: Box::new(|_, _| {}),
            refresh: Box::new(refresh),
        }
    }

    pub fn on_connect(
        mut self,
        connect: impl Fn(&O, &mut Representation) + Send + Sync + 'static,
    ) -> Self {
        self.connect = Box::new(connect);
        self
    }
}

impl<O> fmt::Debug for CapabilityDef<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDef")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Bring one capability of one object in line with the object's current state.
///
/// Returns the entry to publish (or `None`) and whether the refresh reported a
/// configuration change. A freshly created representation is connected and
/// refreshed before it is returned, so it is never published half-built.
pub fn reconcile<O>(
    object: &O,
    def: &CapabilityDef<O>,
    env: &Env<'_>,
    action: UeventAction,
    current: Option<Representation>,
) -> (Option<Representation>, bool) {
    let applies = (def.applies)(object, env);

    let mut entry = match (current, applies) {
        (None, true) => {
            let mut rep = Representation::new();
            (def.connect)(object, &mut rep);
            Some(rep)
        }
        (Some(_), false) => None,
        (current, _) => current,
    };

    let changed = match entry.as_mut() {
        Some(rep) => (def.refresh)(object, env, action, rep),
        None => false,
    };

    (entry, changed)
}

/// Capability kind to published representation. Absent kind means not attached.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct CapabilityTable {
    entries: BTreeMap<CapabilityKind, Representation>,
}

impl CapabilityTable {
    pub fn get(&self, kind: &str) -> Option<&Representation> {
        self.entries.get(kind)
    }

    pub fn has(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = CapabilityKind> + '_ {
        self.entries.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Reconcile every definition against this table. Returns true if any
    /// refresh reported a configuration change.
    pub fn reconcile_all<O>(
        &mut self,
        object: &O,
        defs: &[CapabilityDef<O>],
        env: &Env<'_>,
        action: UeventAction,
    ) -> bool {
        let mut changed = false;
        for def in defs {
            let current = self.entries.remove(def.kind);
            let (next, c) = reconcile(object, def, env, action, current);
            if let Some(rep) = next {
                self.entries.insert(def.kind, rep);
            }
            changed |= c;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fake {
        applies: bool,
        value: u32,
    }

    fn def(connects: Arc<AtomicUsize>) -> CapabilityDef<Fake> {
        CapabilityDef::new(
            "fake",
            |o: &Fake, _| o.applies,
            |o: &Fake, _, _, rep| rep.set(serde_json::json!({ "value": o.value })),
        )
        .on_connect(move |_, _| {
            connects.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn with_env<R>(f: impl FnOnce(&Env<'_>) -> R) -> R {
        let graph = ObjectGraph::new();
        let mounts = MountTable::default();
        let config = ConfigSnapshot::default();
        let settings = HashMap::new();
        f(&Env {
            graph: &graph,
            mounts: &mounts,
            config: &config,
            drive_settings: &settings,
        })
    }

    #[test]
    fn attaches_once_and_refreshes_before_publication() {
        let connects = Arc::new(AtomicUsize::new(0));
        let d = def(connects.clone());
        with_env(|env| {
            let obj = Fake { applies: true, value: 7 };
            let (entry, changed) = reconcile(&obj, &d, env, UeventAction::Add, None);
            let entry = entry.unwrap();
            assert!(changed);
            assert_eq!(entry.get("value"), Some(&serde_json::json!(7)));
            assert_eq!(connects.load(Ordering::SeqCst), 1);

            let (entry, changed) = reconcile(&obj, &d, env, UeventAction::Change, Some(entry));
            assert!(entry.is_some());
            assert!(!changed);
            assert_eq!(connects.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn detaches_when_no_longer_applicable() {
        let connects = Arc::new(AtomicUsize::new(0));
        let d = def(connects);
        with_env(|env| {
            let mut table = CapabilityTable::default();
            let mut obj = Fake { applies: true, value: 1 };
            table.reconcile_all(&obj, std::slice::from_ref(&d), env, UeventAction::Add);
            assert!(table.has("fake"));

            obj.applies = false;
            let changed =
                table.reconcile_all(&obj, std::slice::from_ref(&d), env, UeventAction::Change);
            assert!(!changed);
            assert!(!table.has("fake"));
        });
    }

    #[test]
    fn absent_and_inapplicable_stays_absent() {
        let connects = Arc::new(AtomicUsize::new(0));
        let d = def(connects.clone());
        with_env(|env| {
            let obj = Fake { applies: false, value: 1 };
            let (entry, changed) = reconcile(&obj, &d, env, UeventAction::Add, None);
            assert!(entry.is_none());
            assert!(!changed);
            assert_eq!(connects.load(Ordering::SeqCst), 0);
        });
    }
}
