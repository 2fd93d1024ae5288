//! FQDN selector resolution
//!
//! The DNS resolver that maps names to addresses lives outside this crate. What
//! the compiler consumes is its result: for each selector, the named firewall
//! sets currently holding the resolved addresses. [`SetResolver`] is that
//! boundary.
//!
//! [`FqdnCache`] is an in-memory implementation safe for concurrent reads while
//! the resolution loop writes. [`ConsistentView`] pins one answer per selector
//! for the duration of a single ruleset build.

use crate::core::policy::{FqdnSelector, SelectorKey, SetRef};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cell::{OnceCell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Address family of a firewall set
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum SetFamily {
    #[default]
    #[strum(serialize = "ipv4_addr")]
    Ipv4,
    #[strum(serialize = "ipv6_addr")]
    Ipv6,
}

/// A firewall set as handed to the renderer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpSet {
    pub name: String,
    #[serde(default)]
    pub family: SetFamily,
    #[serde(default)]
    pub members: Vec<String>,
}

impl IpSet {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            family: SetFamily::Ipv4,
            members: Vec::new(),
        }
    }
}

/// Current resolution state of FQDN selectors
pub trait SetResolver {
    /// Returns the sets currently representing `selector`.
    ///
    /// With `create` set, an unknown selector is registered with a fresh,
    /// empty set. The compiler and change detector always pass `false`.
    fn get_sets(&self, selector: &FqdnSelector, create: bool) -> Vec<SetRef>;

    /// Returns every set the rendered ruleset has to declare
    fn sets_for_rendering(&self) -> Vec<IpSet>;
}

impl<T: SetResolver + ?Sized> SetResolver for &T {
    fn get_sets(&self, selector: &FqdnSelector, create: bool) -> Vec<SetRef> {
        (**self).get_sets(selector, create)
    }

    fn sets_for_rendering(&self) -> Vec<IpSet> {
        (**self).sets_for_rendering()
    }
}

impl<T: SetResolver + ?Sized> SetResolver for Arc<T> {
    fn get_sets(&self, selector: &FqdnSelector, create: bool) -> Vec<SetRef> {
        (**self).get_sets(selector, create)
    }

    fn sets_for_rendering(&self) -> Vec<IpSet> {
        (**self).sets_for_rendering()
    }
}

/// One selector's resolution, as exchanged with the resolution loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    #[serde(flatten)]
    pub selector: SelectorKey,
    #[serde(default)]
    pub sets: Vec<IpSet>,
}

#[derive(Debug, Default, Clone)]
struct CacheState {
    selectors: HashMap<SelectorKey, Vec<SetRef>>,
    sets: BTreeMap<String, IpSet>,
}

impl CacheState {
    fn insert(&mut self, key: SelectorKey, sets: Vec<IpSet>) {
        let refs = sets.iter().map(|s| SetRef::new(&s.name)).collect();
        for set in sets {
            self.sets.insert(set.name.clone(), set);
        }
        self.selectors.insert(key, refs);
    }

    /// Drops sets no selector refers to anymore
    fn prune(&mut self) {
        let selectors = &self.selectors;
        self.sets
            .retain(|name, _| selectors.values().flatten().any(|r| &r.name == name));
    }
}

/// In-memory FQDN → firewall-set cache.
///
/// Every update replaces a selector's answer under a single write lock, so a
/// reader sees either the old or the new answer, never a mix.
#[derive(Debug, Default)]
pub struct FqdnCache {
    state: RwLock<CacheState>,
}

impl FqdnCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<CacheEntry>) -> Self {
        let cache = Self::new();
        cache.replace_all(entries);
        cache
    }

    /// Replaces the answer for one selector
    pub fn update(&self, selector: SelectorKey, sets: Vec<IpSet>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        debug!("Updating sets for selector {selector}: {} set(s)", sets.len());
        state.insert(selector, sets);
        state.prune();
    }

    /// Forgets a selector and the sets only it referenced
    pub fn remove(&self, selector: &SelectorKey) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.selectors.remove(selector);
        state.prune();
    }

    /// Replaces the whole cache content in one step
    pub fn replace_all(&self, entries: Vec<CacheEntry>) {
        let mut fresh = CacheState::default();
        for entry in entries {
            fresh.insert(entry.selector, entry.sets);
        }
        fresh.prune();
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .selectors
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reads a JSON array of [`CacheEntry`] as written by the resolution loop
pub async fn load_entries(path: &std::path::Path) -> crate::core::error::Result<Vec<CacheEntry>> {
    let json = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&json)?)
}

/// Name of the set created for a selector the cache has not seen yet
pub fn set_name_for(selector: &SelectorKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(selector.match_name.as_bytes());
    hasher.update(b"|");
    hasher.update(selector.match_pattern.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("fqdn_{hex}")
}

impl SetResolver for FqdnCache {
    fn get_sets(&self, selector: &FqdnSelector, create: bool) -> Vec<SetRef> {
        let key = selector.key();
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(sets) = state.selectors.get(&key) {
                return sets.clone();
            }
        }
        if !create {
            return Vec::new();
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(sets) = state.selectors.get(&key) {
            return sets.clone();
        }
        let set = IpSet::empty(set_name_for(&key));
        let refs = vec![SetRef::new(&set.name)];
        debug!("Registered selector {key} with empty set {}", set.name);
        state.insert(key, vec![set]);
        refs
    }

    fn sets_for_rendering(&self) -> Vec<IpSet> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .sets
            .values()
            .cloned()
            .collect()
    }
}

/// Pins resolver answers for the duration of one ruleset build.
///
/// The first answer for a selector is reused for every later lookup of the same
/// selector, so two egress entries naming the same selector compile against
/// the same generation even if the resolution loop writes in between.
pub struct ConsistentView<R> {
    inner: R,
    answers: RefCell<HashMap<SelectorKey, Vec<SetRef>>>,
    rendering: OnceCell<Vec<IpSet>>,
}

impl<R: SetResolver> ConsistentView<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            answers: RefCell::new(HashMap::new()),
            rendering: OnceCell::new(),
        }
    }
}

impl<R: SetResolver> SetResolver for ConsistentView<R> {
    fn get_sets(&self, selector: &FqdnSelector, create: bool) -> Vec<SetRef> {
        let key = selector.key();
        if let Some(sets) = self.answers.borrow().get(&key) {
            return sets.clone();
        }
        let sets = self.inner.get_sets(selector, create);
        self.answers.borrow_mut().insert(key, sets.clone());
        sets
    }

    fn sets_for_rendering(&self) -> Vec<IpSet> {
        self.rendering
            .get_or_init(|| self.inner.sets_for_rendering())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn set(name: &str, members: &[&str]) -> IpSet {
        IpSet {
            name: name.to_string(),
            family: SetFamily::Ipv4,
            members: members.iter().map(|m| (*m).to_string()).collect(),
        }
    }

    #[test]
    fn test_unknown_selector_without_create_is_empty() {
        let cache = FqdnCache::new();
        assert!(cache.get_sets(&FqdnSelector::name("example.com"), false).is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_create_registers_empty_set_once() {
        let cache = FqdnCache::new();
        let selector = FqdnSelector::name("example.com");
        let first = cache.get_sets(&selector, true);
        let second = cache.get_sets(&selector, true);

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert!(first[0].name.starts_with("fqdn_"));
        assert_eq!(cache.sets_for_rendering(), vec![IpSet::empty(&first[0].name)]);
    }

    #[test]
    fn test_update_replaces_answer_and_prunes() {
        let cache = FqdnCache::new();
        let key = FqdnSelector::name("example.com").key();
        cache.update(key.clone(), vec![set("a", &["1.2.3.4"]), set("b", &[])]);
        cache.update(key, vec![set("b", &["5.6.7.8"])]);

        let sets = cache.get_sets(&FqdnSelector::name("example.com"), false);
        assert_eq!(sets, vec![SetRef::new("b")]);
        let rendered = cache.sets_for_rendering();
        assert_eq!(rendered, vec![set("b", &["5.6.7.8"])]);
    }

    #[test]
    fn test_remove_keeps_shared_sets() {
        let cache = FqdnCache::new();
        let one = FqdnSelector::name("one.example").key();
        let two = FqdnSelector::pattern("*.example").key();
        cache.update(one.clone(), vec![set("shared", &[])]);
        cache.update(two, vec![set("shared", &[]), set("only-two", &[])]);

        cache.remove(&one);
        let names: Vec<_> = cache.sets_for_rendering().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["only-two", "shared"]);
    }

    #[tokio::test]
    async fn test_load_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sets.json");
        std::fs::write(
            &path,
            r#"[{"matchName": "example.com", "sets": [{"name": "example_v4", "members": ["93.184.216.34"]}]}]"#,
        )
        .unwrap();

        let cache = FqdnCache::from_entries(load_entries(&path).await.unwrap());
        assert_eq!(
            cache.get_sets(&FqdnSelector::name("example.com"), false),
            vec![SetRef::new("example_v4")]
        );
        assert_eq!(cache.sets_for_rendering()[0].family, SetFamily::Ipv4);
    }

    #[test]
    fn test_set_name_is_stable() {
        let key = FqdnSelector::pattern("*.example.com").key();
        assert_eq!(set_name_for(&key), set_name_for(&key));
        assert_ne!(set_name_for(&key), set_name_for(&FqdnSelector::name("example.com").key()));
    }

    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl SetResolver for CountingResolver {
        fn get_sets(&self, _selector: &FqdnSelector, _create: bool) -> Vec<SetRef> {
            // Every call observes a new generation
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            vec![SetRef::new(format!("gen{n}"))]
        }

        fn sets_for_rendering(&self) -> Vec<IpSet> {
            Vec::new()
        }
    }

    #[test]
    fn test_consistent_view_pins_answers() {
        let inner = CountingResolver {
            calls: AtomicUsize::new(0),
        };
        let view = ConsistentView::new(&inner);
        let selector = FqdnSelector::name("example.com");

        let first = view.get_sets(&selector, false);
        let second = view.get_sets(&selector, false);
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);

        let other = view.get_sets(&FqdnSelector::name("other.com"), false);
        assert_ne!(first, other);
    }
}
