//! Memoized rule-set parsing keyed by location identity.
//!
//! Each location key owns a slot. Resolves of the same key serialize on the
//! slot's lock; different keys never contend beyond the short map lookup.
//! Invalidation is lazy: a change notification bumps the slot's generation
//! and the next `resolve` refetches.

use crate::error::{PipelineError, PipelineResult};
use crate::location::{
    FetchContext, FetchedSource, LocationKey, RuleSetConfiguration, RuleSetLocation,
    normalize_path,
};
use crate::ruleset::ParsedRuleSet;
use crate::watch::ChangeNotifier;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Cheap change detector for a source, compared before trusting a cached entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceStamp {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

/// Byte-stream access to rule-set content.
pub trait RuleSetSource: Send + Sync {
    fn open_stream(
        &self,
        location: &RuleSetLocation,
        ctx: &FetchContext,
    ) -> PipelineResult<Box<dyn Read + Send>>;

    /// A cheap stamp of the current content, when the source can offer one.
    fn stamp(&self, _location: &RuleSetLocation, _ctx: &FetchContext) -> Option<SourceStamp> {
        None
    }
}

/// Reads local files directly and downloads network locations.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRuleSetSource;

struct FetchedReader {
    file: File,
    _source: FetchedSource,
}

impl Read for FetchedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl RuleSetSource for DefaultRuleSetSource {
    fn open_stream(
        &self,
        location: &RuleSetLocation,
        ctx: &FetchContext,
    ) -> PipelineResult<Box<dyn Read + Send>> {
        let source = location.fetch(ctx)?;
        let file = source
            .open()
            .map_err(|e| PipelineError::unreachable(location, e))?;
        Ok(Box::new(FetchedReader {
            file,
            _source: source,
        }))
    }

    fn stamp(&self, location: &RuleSetLocation, ctx: &FetchContext) -> Option<SourceStamp> {
        let path = location.local_path(ctx)?;
        let meta = std::fs::metadata(path).ok()?;
        Some(SourceStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// One cached, parsed rule set. Immutable; replaced as a whole.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: LocationKey,
    pub rules: Arc<ParsedRuleSet>,
    /// SHA-256 of the content the rules were parsed from.
    pub fingerprint: String,
    pub stamp: Option<SourceStamp>,
    pub fetched_at: DateTime<Utc>,
    generation: u64,
    watched: bool,
}

#[derive(Default)]
struct Slot {
    invalidations: AtomicU64,
    entry: Mutex<Option<Arc<CacheEntry>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub fetches: usize,
    pub hits: usize,
    pub entries: usize,
}

pub struct RuleSetCache {
    source: Arc<dyn RuleSetSource>,
    ctx: FetchContext,
    slots: Mutex<HashMap<LocationKey, Arc<Slot>>>,
    notifier: RwLock<Option<Arc<dyn ChangeNotifier>>>,
    fetches: AtomicUsize,
    hits: AtomicUsize,
}

impl RuleSetCache {
    pub fn new(source: Arc<dyn RuleSetSource>, ctx: FetchContext) -> Self {
        Self {
            source,
            ctx,
            slots: Mutex::new(HashMap::new()),
            notifier: RwLock::new(None),
            fetches: AtomicUsize::new(0),
            hits: AtomicUsize::new(0),
        }
    }

    /// Cache over local files and HTTP(S) locations.
    pub fn with_default_source(ctx: FetchContext) -> Self {
        Self::new(Arc::new(DefaultRuleSetSource), ctx)
    }

    pub fn context(&self) -> &FetchContext {
        &self.ctx
    }

    /// Register path-based entries with `notifier` from now on.
    pub fn set_notifier(&self, notifier: Arc<dyn ChangeNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    fn slot(&self, key: &LocationKey) -> Arc<Slot> {
        self.slots.lock().entry(key.clone()).or_default().clone()
    }

    /// Return the parsed rule set for `config`, fetching and parsing it when
    /// no fresh entry exists.
    pub fn resolve(&self, config: &RuleSetConfiguration) -> PipelineResult<Arc<ParsedRuleSet>> {
        let location = &config.location;
        let key = location.key(&self.ctx);
        let slot = self.slot(&key);
        let mut guard = slot.entry.lock();

        if let Some(entry) = guard.as_ref()
            && self.is_fresh(&slot, entry, location)
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.rules.clone());
        }

        let generation = slot.invalidations.load(Ordering::Acquire);
        let stamp = self.source.stamp(location, &self.ctx);
        let bytes = match self.fetch_bytes(location) {
            Ok(bytes) => bytes,
            Err(err) => {
                *guard = None;
                return Err(err);
            }
        };
        let fingerprint = hex::encode(Sha256::digest(&bytes));

        let rules = match guard.as_ref() {
            Some(prev) if prev.fingerprint == fingerprint => prev.rules.clone(),
            _ => match ParsedRuleSet::parse(&bytes, &location.to_string()) {
                Ok(parsed) => Arc::new(parsed),
                Err(err) => {
                    *guard = None;
                    return Err(err);
                }
            },
        };

        let watched = guard.as_ref().is_some_and(|e| e.watched) || self.register_watch(&key);
        tracing::debug!(
            location = %key,
            fingerprint = &fingerprint[..12],
            rules = rules.rules.len(),
            "rule set loaded"
        );

        *guard = Some(Arc::new(CacheEntry {
            key,
            rules: rules.clone(),
            fingerprint,
            stamp,
            fetched_at: Utc::now(),
            generation,
            watched,
        }));
        Ok(rules)
    }

    fn is_fresh(&self, slot: &Slot, entry: &CacheEntry, location: &RuleSetLocation) -> bool {
        if slot.invalidations.load(Ordering::Acquire) != entry.generation {
            return false;
        }
        match (entry.stamp, self.source.stamp(location, &self.ctx)) {
            (Some(old), Some(new)) => old == new,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    fn fetch_bytes(&self, location: &RuleSetLocation) -> PipelineResult<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let mut stream = self.source.open_stream(location, &self.ctx)?;
        let mut bytes = Vec::new();
        stream
            .read_to_end(&mut bytes)
            .map_err(|e| PipelineError::unreachable(location, e))?;
        Ok(bytes)
    }

    fn register_watch(&self, key: &LocationKey) -> bool {
        let Some(path) = key.as_path() else {
            return false;
        };
        let Some(notifier) = self.notifier.read().clone() else {
            return false;
        };
        match notifier.watch(path) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(path = %path.display(), "cannot watch rule set: {err}");
                false
            }
        }
    }

    /// Mark the entry for `path` stale. Returns whether such an entry exists.
    pub fn mark_stale(&self, path: &Path) -> bool {
        let key = LocationKey::Path(normalize_path(path));
        self.invalidate_key(&key)
    }

    /// Mark the entry for `location` stale.
    pub fn invalidate(&self, location: &RuleSetLocation) -> bool {
        let key = location.key(&self.ctx);
        self.invalidate_key(&key)
    }

    fn invalidate_key(&self, key: &LocationKey) -> bool {
        let slot = self.slots.lock().get(key).cloned();
        match slot {
            Some(slot) => {
                slot.invalidations.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(location = %key, "rule set marked stale");
                true
            }
            None => false,
        }
    }

    /// Drop the entry for `location`.
    pub fn evict(&self, location: &RuleSetLocation) -> bool {
        let key = location.key(&self.ctx);
        let removed = self.slots.lock().remove(&key);
        if removed.is_some() {
            self.unwatch(&key);
        }
        removed.is_some()
    }

    /// Drop every entry no configuration in `live` references.
    pub fn retain<'a>(&self, live: impl IntoIterator<Item = &'a RuleSetConfiguration>) {
        let keep: HashSet<LocationKey> = live
            .into_iter()
            .map(|c| c.location.key(&self.ctx))
            .collect();
        let removed: Vec<LocationKey> = {
            let mut slots = self.slots.lock();
            let stale: Vec<LocationKey> = slots
                .keys()
                .filter(|k| !keep.contains(*k))
                .cloned()
                .collect();
            for key in &stale {
                slots.remove(key);
            }
            stale
        };
        for key in &removed {
            self.unwatch(key);
        }
    }

    fn unwatch(&self, key: &LocationKey) {
        if let (Some(path), Some(notifier)) = (key.as_path(), self.notifier.read().clone()) {
            notifier.unwatch(path);
        }
    }

    /// Current entry for a location, without refreshing it.
    pub fn peek(&self, location: &RuleSetLocation) -> Option<Arc<CacheEntry>> {
        let key = location.key(&self.ctx);
        let slot = self.slots.lock().get(&key).cloned()?;
        let entry = slot.entry.lock().clone();
        entry
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const RULES: &str = "name = \"basics\"\n[[rule]]\nid = \"a\"\nmessage = \"m\"\npattern = \"x\"\n";

    #[derive(Default)]
    struct MapSource {
        content: Mutex<HashMap<String, String>>,
    }

    impl RuleSetSource for MapSource {
        fn open_stream(
            &self,
            location: &RuleSetLocation,
            _ctx: &FetchContext,
        ) -> PipelineResult<Box<dyn Read + Send>> {
            let content = self.content.lock().get(&location.to_string()).cloned();
            match content {
                Some(text) => Ok(Box::new(Cursor::new(text.into_bytes()))),
                None => Err(PipelineError::unreachable(location, "not found")),
            }
        }
    }

    fn uri_config(uri: &str) -> RuleSetConfiguration {
        RuleSetConfiguration::new(1, "remote", RuleSetLocation::NetworkUri(uri.to_string()))
    }

    #[test]
    fn failed_fetch_drops_previous_entry() {
        let source = Arc::new(MapSource::default());
        source
            .content
            .lock()
            .insert("https://rules.test/a.toml".into(), RULES.into());
        let cache = RuleSetCache::new(source.clone(), FetchContext::default());
        let config = uri_config("https://rules.test/a.toml");

        cache.resolve(&config).unwrap();
        source.content.lock().clear();
        cache.invalidate(&config.location);

        let err = cache.resolve(&config).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigurationUnreachable { .. }));
        assert!(cache.peek(&config.location).is_none());
    }

    #[test]
    fn unchanged_content_reuses_parsed_rules() {
        let source = Arc::new(MapSource::default());
        source
            .content
            .lock()
            .insert("https://rules.test/a.toml".into(), RULES.into());
        let cache = RuleSetCache::new(source, FetchContext::default());
        let config = uri_config("https://rules.test/a.toml");

        let first = cache.resolve(&config).unwrap();
        cache.invalidate(&config.location);
        let second = cache.resolve(&config).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().fetches, 2);
    }

    #[test]
    fn retain_evicts_unreferenced_locations() {
        let source = Arc::new(MapSource::default());
        {
            let mut content = source.content.lock();
            content.insert("https://rules.test/a.toml".into(), RULES.into());
            content.insert("https://rules.test/b.toml".into(), RULES.into());
        }
        let cache = RuleSetCache::new(source, FetchContext::default());
        let a = uri_config("https://rules.test/a.toml");
        let b = uri_config("https://rules.test/b.toml");
        cache.resolve(&a).unwrap();
        cache.resolve(&b).unwrap();
        assert_eq!(cache.len(), 2);

        cache.retain([&a]);
        assert_eq!(cache.len(), 1);
        assert!(cache.peek(&a.location).is_some());
        assert!(cache.peek(&b.location).is_none());
    }
}
