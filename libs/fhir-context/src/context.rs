use crate::error::{Error, Result};
use crate::version::{extract_version_algorithm, select_from_version_index, VersionKey};
use async_trait::async_trait;
use ferrum_models::{ElementTypeInfo, StructureDefinition};
use lru::LruCache;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

/// The minimal contract the validation engine consumes from a conformance
/// resource store: "give me every known version of this canonical URL".
/// Package loading, registry fetches, and database-backed stores all
/// implement this and nothing more specific — the validator never needs to
/// know how a resource was obtained.
#[async_trait]
pub trait ConformanceResourceProvider: Send + Sync {
    /// Returns resources for a canonical URL (potentially multiple versions).
    ///
    /// For database-backed providers this typically returns the "active" set
    /// (e.g., current rows), while package-backed providers often return all
    /// known versions.
    async fn list_by_canonical(&self, canonical_url: &str) -> Result<Vec<Arc<Value>>>;

    /// Fetch a specific resource by canonical URL and business version.
    ///
    /// Default implementation falls back to `list_by_canonical` + in-memory selection.
    async fn get_by_canonical_and_version(
        &self,
        canonical_url: &str,
        version: &str,
    ) -> Result<Option<Arc<Value>>> {
        let resources = self.list_by_canonical(canonical_url).await?;
        let mut versions: BTreeMap<VersionKey, Arc<Value>> = BTreeMap::new();
        for resource in resources {
            let Some(url) = resource.get("url").and_then(|v| v.as_str()) else {
                continue;
            };
            if url != canonical_url {
                continue;
            }

            let version_str = resource
                .get("version")
                .and_then(|v| v.as_str())
                .unwrap_or("0");

            let algorithm = extract_version_algorithm(resource.as_ref());
            versions.insert(VersionKey::new(version_str, algorithm), resource);
        }

        Ok(select_from_version_index(&versions, Some(version)).cloned())
    }
}

pub struct FallbackConformanceProvider {
    primary: Arc<dyn ConformanceResourceProvider>,
    fallback: Arc<dyn ConformanceResourceProvider>,
}

impl FallbackConformanceProvider {
    pub fn new(
        primary: Arc<dyn ConformanceResourceProvider>,
        fallback: Arc<dyn ConformanceResourceProvider>,
    ) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl ConformanceResourceProvider for FallbackConformanceProvider {
    async fn list_by_canonical(&self, canonical_url: &str) -> Result<Vec<Arc<Value>>> {
        match self.primary.list_by_canonical(canonical_url).await {
            Ok(primary) if !primary.is_empty() => Ok(primary),
            Ok(_) => self.fallback.list_by_canonical(canonical_url).await,
            Err(primary_err) => match self.fallback.list_by_canonical(canonical_url).await {
                Ok(v) => Ok(v),
                Err(_) => Err(primary_err),
            },
        }
    }

    async fn get_by_canonical_and_version(
        &self,
        canonical_url: &str,
        version: &str,
    ) -> Result<Option<Arc<Value>>> {
        match self
            .primary
            .get_by_canonical_and_version(canonical_url, version)
            .await
        {
            Ok(Some(resource)) => Ok(Some(resource)),
            Ok(None) => {
                self.fallback
                    .get_by_canonical_and_version(canonical_url, version)
                    .await
            }
            Err(primary_err) => match self
                .fallback
                .get_by_canonical_and_version(canonical_url, version)
                .await
            {
                Ok(v) => Ok(v),
                Err(_) => Err(primary_err),
            },
        }
    }
}

/// A `FhirContext` backed by an async `ConformanceResourceProvider`, with a
/// TTL'd cache keyed by canonical URL (and, for exact-version lookups,
/// canonical+version). Bridges the provider's async interface onto the
/// synchronous `FhirContext` trait the walker calls on its hot path.
#[derive(Clone)]
pub struct FlexibleFhirContext(Arc<FlexibleFhirContextInner>);

#[derive(Clone, Eq, PartialEq, Hash)]
struct CanonicalVersionKey {
    canonical: String,
    version: String,
}

struct FlexibleFhirContextInner {
    provider: Arc<dyn ConformanceResourceProvider>,
    canonical_cache: Mutex<LruCache<String, CanonicalCacheEntry>>,
    version_cache: Mutex<LruCache<CanonicalVersionKey, VersionCacheEntry>>,
    ttl_millis: AtomicU64,
    handle: Handle,
}

struct CanonicalCacheEntry {
    loaded_at: Instant,
    versions: BTreeMap<VersionKey, Arc<Value>>,
}

struct VersionCacheEntry {
    loaded_at: Instant,
    resource: Option<Arc<Value>>,
}

impl FlexibleFhirContext {
    pub fn new(provider: Arc<dyn ConformanceResourceProvider>) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| Error::AsyncRuntimeUnavailable)?;
        Ok(Self::with_handle(handle, provider))
    }

    pub fn with_handle(handle: Handle, provider: Arc<dyn ConformanceResourceProvider>) -> Self {
        let capacity = NonZeroUsize::new(4096).unwrap();
        let canonical_cache = Mutex::new(LruCache::new(capacity));
        let version_cache = Mutex::new(LruCache::new(capacity));
        Self(Arc::new(FlexibleFhirContextInner {
            provider,
            canonical_cache,
            version_cache,
            ttl_millis: AtomicU64::new(60_000),
            handle,
        }))
    }

    pub fn with_cache_capacity(self, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        {
            let mut cache = self
                .0
                .canonical_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *cache = LruCache::new(capacity);
        }
        {
            let mut cache = self
                .0
                .version_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            *cache = LruCache::new(capacity);
        }
        self
    }

    pub fn with_ttl(self, ttl: Option<Duration>) -> Self {
        let millis = ttl.map(|d| d.as_millis() as u64).unwrap_or(0);
        self.0.ttl_millis.store(millis, AtomicOrdering::Relaxed);
        self
    }

    pub fn invalidate(&self, canonical_url: &str) {
        let mut canonical_cache = self
            .0
            .canonical_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        canonical_cache.pop(canonical_url);

        let mut version_cache = self
            .0
            .version_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let keys_to_remove: Vec<CanonicalVersionKey> = version_cache
            .iter()
            .filter(|(k, _)| k.canonical == canonical_url)
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys_to_remove {
            version_cache.pop(&k);
        }
    }

    pub fn clear_cache(&self) {
        let mut canonical_cache = self
            .0
            .canonical_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        canonical_cache.clear();
        drop(canonical_cache);

        let mut version_cache = self
            .0
            .version_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        version_cache.clear();
    }

    fn block_on<T>(&self, fut: impl Future<Output = T> + Send + 'static) -> T
    where
        T: Send + 'static,
    {
        let handle = self.0.handle.clone();

        // When called from within a Tokio runtime, `Handle::block_on` is not allowed.
        if Handle::try_current().is_ok() {
            // Prefer `block_in_place` on multithreaded runtimes to avoid starving the executor.
            if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread {
                return tokio::task::block_in_place(|| handle.block_on(fut));
            }

            // Current-thread runtimes can't use `block_in_place`: hop to a plain thread.
            let (tx, rx) = std::sync::mpsc::sync_channel(1);
            std::thread::spawn(move || {
                let _ = tx.send(handle.block_on(fut));
            });
            return rx.recv().expect("context async task thread died");
        }

        handle.block_on(fut)
    }

    async fn get_resource_by_url_async(
        inner: Arc<FlexibleFhirContextInner>,
        canonical_url: String,
        version: Option<String>,
    ) -> Result<Option<Arc<Value>>> {
        let ttl_millis = inner.ttl_millis.load(AtomicOrdering::Relaxed);
        let ttl = (ttl_millis != 0).then(|| Duration::from_millis(ttl_millis));

        // Exact-version lookup path.
        if let Some(ref version) = version {
            // 1) Try canonical cache first (fast if that canonical was resolved recently).
            {
                let mut cache = inner
                    .canonical_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = cache.get(&canonical_url) {
                    if ttl.is_some_and(|ttl| entry.loaded_at.elapsed() > ttl) {
                        // Expired: fall through.
                    } else if let Some(hit) =
                        select_from_version_index(&entry.versions, Some(version)).cloned()
                    {
                        return Ok(Some(hit));
                    }
                }
            }

            // 2) Try exact-version cache.
            let key = CanonicalVersionKey {
                canonical: canonical_url.clone(),
                version: version.clone(),
            };
            {
                let mut cache = inner
                    .version_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                if let Some(entry) = cache.get(&key) {
                    if ttl.is_some_and(|ttl| entry.loaded_at.elapsed() > ttl) {
                        // Expired: fall through.
                    } else {
                        return Ok(entry.resource.clone());
                    }
                }
            }

            // 3) Fetch exact version from provider (may include non-current/historical rows).
            let fetched = inner
                .provider
                .get_by_canonical_and_version(&canonical_url, version)
                .await?;

            // 4) Store (including negative cache entries).
            {
                let mut cache = inner
                    .version_cache
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                cache.put(
                    key,
                    VersionCacheEntry {
                        loaded_at: Instant::now(),
                        resource: fetched.clone(),
                    },
                );
            }

            return Ok(fetched);
        }

        // Latest lookup path: always derived from the canonical cache.
        {
            let mut cache = inner
                .canonical_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get(&canonical_url) {
                if ttl.is_some_and(|ttl| entry.loaded_at.elapsed() > ttl) {
                    // Expired: fall through to reload.
                } else {
                    return Ok(select_from_version_index(&entry.versions, None).cloned());
                }
            }
        }

        // Load from provider (no lock held while awaiting).
        let resources = inner.provider.list_by_canonical(&canonical_url).await?;

        let mut versions: BTreeMap<VersionKey, Arc<Value>> = BTreeMap::new();
        for resource in resources {
            let Some(url) = resource.get("url").and_then(|v| v.as_str()) else {
                continue;
            };
            if url != canonical_url {
                continue;
            }

            let version_str = resource
                .get("version")
                .and_then(|v| v.as_str())
                .unwrap_or("0");

            let algorithm = extract_version_algorithm(resource.as_ref());
            versions.insert(VersionKey::new(version_str, algorithm), resource);
        }

        let selected = select_from_version_index(&versions, None).cloned();

        {
            let mut cache = inner
                .canonical_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            cache.put(
                canonical_url,
                CanonicalCacheEntry {
                    loaded_at: Instant::now(),
                    versions,
                },
            );
        }

        Ok(selected)
    }
}

/// The engine's view of a conformance resource store: resolve canonical
/// URLs and type names to StructureDefinitions, and the handful of
/// navigation helpers the walker needs to resolve element types without
/// re-deriving them from a raw snapshot scan every time. This is the
/// `ProfileResolver` contract from the core spec, generalized with
/// convenience defaults built on top of its two required methods.
pub trait FhirContext: Send + Sync {
    fn get_resource_by_url(
        &self,
        canonical_url: &str,
        version: Option<&str>,
    ) -> Result<Option<Arc<Value>>>;

    /// Get the latest resource (highest version) for a canonical URL
    fn get_latest_resource_by_url(&self, canonical_url: &str) -> Result<Option<Arc<Value>>> {
        self.get_resource_by_url(canonical_url, None)
    }

    /// Get a StructureDefinition by canonical URL
    fn get_structure_definition(
        &self,
        canonical_url: &str,
    ) -> Result<Option<Arc<StructureDefinition>>> {
        if let Some(resource) = self.get_latest_resource_by_url(canonical_url)? {
            let sd: StructureDefinition = serde_json::from_value(Arc::unwrap_or_clone(resource))?;
            Ok(Some(Arc::new(sd)))
        } else {
            Ok(None)
        }
    }

    /// Get a StructureDefinition by type name (e.g., "Patient")
    fn get_core_structure_definition_by_type(
        &self,
        type_name: &str,
    ) -> Result<Option<Arc<StructureDefinition>>> {
        let canonical_url = format!("http://hl7.org/fhir/StructureDefinition/{}", type_name);
        self.get_structure_definition(&canonical_url)
    }

    /// Get a StructureDefinition from a resource (checks meta.profile or resourceType)
    fn get_structure_definition_from_resource(
        &self,
        resource: &Value,
    ) -> Result<Option<Arc<StructureDefinition>>> {
        // Try meta.profile first
        if let Some(profiles) = resource
            .get("meta")
            .and_then(|m| m.get("profile"))
            .and_then(|p| p.as_array())
        {
            if let Some(profile_url) = profiles.first().and_then(|v| v.as_str()) {
                if let Some(sd) = self.get_structure_definition(profile_url)? {
                    return Ok(Some(sd));
                }
            }
        }

        // Fallback to resourceType
        if let Some(resource_type) = resource.get("resourceType").and_then(|v| v.as_str()) {
            return self.get_core_structure_definition_by_type(resource_type);
        }

        Ok(None)
    }

    /// Resolve profile URLs for validation based on explicit profiles, meta.profile, and resourceType
    ///
    /// Returns a list of canonical URLs to validate against in priority order:
    /// 1. If explicit_profiles is provided, use those
    /// 2. Otherwise, if meta.profile is present, use those + base as fallback
    /// 3. Otherwise, use base profile for the resourceType
    fn resolve_validation_profiles(
        &self,
        resource: &Value,
        explicit_profiles: Option<&[String]>,
    ) -> Vec<String> {
        let mut profiles = Vec::new();

        // 1. Explicit profiles take highest priority
        if let Some(explicit) = explicit_profiles {
            profiles.extend(explicit.iter().cloned());
            return profiles;
        }

        // 2. Try meta.profile
        if let Some(meta_profiles) = resource
            .get("meta")
            .and_then(|m| m.get("profile"))
            .and_then(|p| p.as_array())
        {
            for profile_value in meta_profiles {
                if let Some(profile_url) = profile_value.as_str() {
                    profiles.push(profile_url.to_string());
                }
            }
        }

        // 3. Always include base profile as fallback
        if let Some(resource_type) = resource.get("resourceType").and_then(|v| v.as_str()) {
            let base_url = format!("http://hl7.org/fhir/StructureDefinition/{}", resource_type);
            // Only add base if not already in the list
            if !profiles.contains(&base_url) {
                profiles.push(base_url);
            }
        }

        profiles
    }

    /// Get element type information for a path segment
    ///
    /// Given a base type and a field name, returns the type information for that field.
    /// Handles choice types by returning all possible types.
    fn get_element_type(
        &self,
        base_type: &str,
        field_name: &str,
    ) -> Result<Option<ElementTypeInfo>> {
        let ensure_base_prefix = |name: &str| {
            let expected_prefix = format!("{}.", base_type);
            if name.starts_with(&expected_prefix) || name == base_type {
                name.to_string()
            } else {
                format!("{}.{}", base_type, name)
            }
        };

        let sd = self
            .get_core_structure_definition_by_type(base_type)?
            .ok_or_else(|| Error::StructureDefinitionNotFound(base_type.to_string()))?;

        // Get snapshot elements
        let snapshot = sd
            .snapshot
            .as_ref()
            .ok_or_else(|| Error::InvalidStructureDefinition("Missing snapshot".to_string()))?;

        // Build expected path
        let element_path = if field_name.contains("[x]") {
            ensure_base_prefix(field_name)
        } else {
            // Try exact match first
            let exact_path = ensure_base_prefix(field_name);
            if let Some(elem) = snapshot.get_element(&exact_path) {
                return Ok(elem.to_type_info());
            }

            // Try choice element
            let choice_path = ensure_base_prefix(&format!("{}[x]", field_name));
            if let Some(elem) = snapshot.get_element(&choice_path) {
                return Ok(elem.to_type_info());
            }

            // If still not found, return None
            return Ok(None);
        };

        // Find exact match for choice path
        if let Some(elem) = snapshot.get_element(&element_path) {
            return Ok(elem.to_type_info());
        }

        Ok(None)
    }

    /// Get choice type expansions for a choice element path
    ///
    /// Returns the list of possible types for a choice element (e.g., ["Quantity", "String", "CodeableConcept"])
    fn get_choice_expansions(
        &self,
        base_type: &str,
        field_name: &str,
    ) -> Result<Option<Vec<String>>> {
        let element_info = self.get_element_type(base_type, field_name)?;

        if let Some(info) = element_info {
            if info.is_choice {
                return Ok(Some(info.type_codes));
            }
        }

        Ok(None)
    }

    /// Resolve a navigation path (e.g., "name.given" starting from "Patient")
    ///
    /// Returns the type information for the final element in the path.
    fn resolve_path_type(&self, base_type: &str, path: &str) -> Result<Option<ElementTypeInfo>> {
        let segments: Vec<&str> = path.split('.').collect();
        let mut current_type = base_type.to_string();
        for (i, segment) in segments.iter().enumerate() {
            // Handle choice types
            let field_name = if segment.ends_with("[x]") {
                segment.to_string()
            } else {
                // Check if this is a choice variant (e.g., "valueQuantity")
                if let Some(base_name) = self.find_choice_base(&current_type, segment) {
                    // This is a choice variant, use the base choice path
                    format!("{}[x]", base_name)
                } else {
                    segment.to_string()
                }
            };

            let element_info = self.get_element_type(&current_type, &field_name)?;

            if let Some(info) = element_info {
                if i == segments.len() - 1 {
                    // Last segment - return its type info
                    return Ok(Some(info));
                } else {
                    // Continue navigation with the result type
                    if let Some(next_type) = info.type_codes.first() {
                        current_type = normalize_type_code(next_type);
                    } else {
                        return Ok(None);
                    }
                }
            } else {
                return Ok(None);
            }
        }

        Ok(None)
    }

    /// Find the base choice element name for a choice variant
    ///
    /// Example: "valueQuantity" -> "value"
    fn find_choice_base(&self, base_type: &str, field_name: &str) -> Option<String> {
        let sd = self
            .get_core_structure_definition_by_type(base_type)
            .ok()??;
        let snapshot = sd.snapshot.as_ref()?;

        for element in &snapshot.element {
            if element.is_choice_type() {
                // Extract the last part of the path (e.g., "value[x]" from "Observation.value[x]")
                let last_part = element.path.rsplit('.').next()?;
                if last_part.ends_with("[x]") {
                    let base_name = last_part.trim_end_matches("[x]");
                    // Check if field_name starts with this base name
                    if field_name.starts_with(base_name) && field_name.len() > base_name.len() {
                        // Return the full path prefix (e.g., "Observation.value")
                        let prefix = element.path.trim_end_matches("[x]");
                        return Some(prefix.to_string());
                    }
                }
            }
        }

        None
    }
}

impl<T: FhirContext + ?Sized> FhirContext for &T {
    fn get_resource_by_url(
        &self,
        canonical_url: &str,
        version: Option<&str>,
    ) -> Result<Option<Arc<Value>>> {
        (**self).get_resource_by_url(canonical_url, version)
    }

    fn get_latest_resource_by_url(&self, canonical_url: &str) -> Result<Option<Arc<Value>>> {
        (**self).get_latest_resource_by_url(canonical_url)
    }

    fn get_structure_definition(
        &self,
        canonical_url: &str,
    ) -> Result<Option<Arc<StructureDefinition>>> {
        (**self).get_structure_definition(canonical_url)
    }
}

/// Normalize a FHIRPath system-type URL or a StructureDefinition canonical
/// URL down to a bare type code (`http://hl7.org/fhirpath/System.String` →
/// `string`, `http://hl7.org/fhir/StructureDefinition/Patient` → `Patient`).
pub fn normalize_type_code(code: &str) -> String {
    if code.starts_with("http://hl7.org/fhirpath/System.") {
        return code
            .replace("http://hl7.org/fhirpath/System.", "")
            .to_lowercase();
    }
    if code.starts_with("http://hl7.org/fhir/StructureDefinition/") {
        return code.replace("http://hl7.org/fhir/StructureDefinition/", "");
    }
    code.to_string()
}

/// An in-memory `FhirContext` built from a preloaded set of conformance
/// resources (StructureDefinitions, ValueSets, CodeSystems). This is what
/// tests and the CLI construct directly; production callers wire a package
/// loader's output (or a database-backed `ConformanceResourceProvider`,
/// through `FlexibleFhirContext`) into the same shape — loading itself is
/// not this crate's concern.
pub struct InMemoryFhirContext {
    resources_by_canonical: std::collections::HashMap<String, BTreeMap<VersionKey, Arc<Value>>>,
    structure_definition_cache: Mutex<LruCache<String, Arc<StructureDefinition>>>,
}

impl InMemoryFhirContext {
    pub fn new() -> Self {
        Self {
            resources_by_canonical: std::collections::HashMap::new(),
            structure_definition_cache: Mutex::new(LruCache::new(NonZeroUsize::new(4096).unwrap())),
        }
    }

    pub fn from_resources(resources: impl IntoIterator<Item = Value>) -> Self {
        let mut ctx = Self::new();
        for resource in resources {
            ctx.add_resource(resource);
        }
        ctx
    }

    /// Insert an additional resource into this context's canonical index.
    ///
    /// The resource must have a `url` field. An optional `version` field is
    /// used for version-specific lookups; when absent the resource is
    /// indexed as "0".
    pub fn add_resource(&mut self, resource: Value) {
        let Some(canonical_url) = resource.get("url").and_then(|v| v.as_str()).map(String::from)
        else {
            return;
        };
        let version_str = resource
            .get("version")
            .and_then(|v| v.as_str())
            .unwrap_or("0")
            .to_string();
        let algorithm = extract_version_algorithm(&resource);
        self.resources_by_canonical
            .entry(canonical_url.clone())
            .or_default()
            .insert(VersionKey::new(&version_str, algorithm), Arc::new(resource));
        let mut cache = self
            .structure_definition_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        cache.pop(&canonical_url);
    }

    fn get_from_index(&self, canonical_url: &str, version: Option<&str>) -> Option<Arc<Value>> {
        let versions = self.resources_by_canonical.get(canonical_url)?;
        select_from_version_index(versions, version).cloned()
    }
}

impl Default for InMemoryFhirContext {
    fn default() -> Self {
        Self::new()
    }
}

impl FhirContext for InMemoryFhirContext {
    fn get_resource_by_url(
        &self,
        canonical_url: &str,
        version: Option<&str>,
    ) -> Result<Option<Arc<Value>>> {
        Ok(self.get_from_index(canonical_url, version))
    }

    fn get_structure_definition(
        &self,
        canonical_url: &str,
    ) -> Result<Option<Arc<StructureDefinition>>> {
        {
            let mut cache = self
                .structure_definition_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(canonical_url) {
                return Ok(Some(hit.clone()));
            }
        }

        let Some(resource) = self.get_from_index(canonical_url, None) else {
            return Ok(None);
        };
        let sd: StructureDefinition = serde_json::from_value(Arc::unwrap_or_clone(resource))?;
        let sd = Arc::new(sd);

        {
            let mut cache = self
                .structure_definition_cache
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            cache.put(canonical_url.to_string(), sd.clone());
        }

        Ok(Some(sd))
    }
}

#[async_trait]
impl ConformanceResourceProvider for InMemoryFhirContext {
    async fn list_by_canonical(&self, canonical_url: &str) -> Result<Vec<Arc<Value>>> {
        let Some(versions) = self.resources_by_canonical.get(canonical_url) else {
            return Ok(vec![]);
        };

        Ok(versions.values().cloned().collect())
    }

    async fn get_by_canonical_and_version(
        &self,
        canonical_url: &str,
        version: &str,
    ) -> Result<Option<Arc<Value>>> {
        Ok(self.get_from_index(canonical_url, Some(version)))
    }
}

impl FhirContext for FlexibleFhirContext {
    fn get_resource_by_url(
        &self,
        canonical_url: &str,
        version: Option<&str>,
    ) -> Result<Option<Arc<Value>>> {
        let inner = self.0.clone();
        let canonical_url = canonical_url.to_string();
        let version = version.map(|v| v.to_string());

        self.block_on(Self::get_resource_by_url_async(
            inner,
            canonical_url,
            version,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn create_mock_patient_sd() -> Value {
        json!({
            "resourceType": "StructureDefinition",
            "id": "Patient",
            "url": "http://hl7.org/fhir/StructureDefinition/Patient",
            "name": "Patient",
            "status": "active",
            "kind": "resource",
            "abstract": false,
            "type": "Patient",
            "snapshot": {
                "element": [
                    {"id": "Patient", "path": "Patient", "min": 0, "max": "*"},
                    {"id": "Patient.id", "path": "Patient.id", "type": [{"code": "id"}], "min": 0, "max": "1"},
                    {"id": "Patient.name", "path": "Patient.name", "type": [{"code": "HumanName"}], "min": 0, "max": "*"},
                    {"id": "Patient.name.given", "path": "Patient.name.given", "type": [{"code": "string"}], "min": 0, "max": "*"},
                    {"id": "Patient.name.family", "path": "Patient.name.family", "type": [{"code": "string"}], "min": 0, "max": "1"},
                    {"id": "Patient.birthDate", "path": "Patient.birthDate", "type": [{"code": "date"}], "min": 0, "max": "1"}
                ]
            }
        })
    }

    fn create_mock_observation_sd() -> Value {
        json!({
            "resourceType": "StructureDefinition",
            "id": "Observation",
            "url": "http://hl7.org/fhir/StructureDefinition/Observation",
            "name": "Observation",
            "status": "active",
            "kind": "resource",
            "abstract": false,
            "type": "Observation",
            "snapshot": {
                "element": [
                    {"id": "Observation", "path": "Observation", "min": 0, "max": "*"},
                    {"id": "Observation.status", "path": "Observation.status", "type": [{"code": "code"}], "min": 1, "max": "1"},
                    {
                        "id": "Observation.value[x]",
                        "path": "Observation.value[x]",
                        "type": [
                            {"code": "Quantity"},
                            {"code": "string"},
                            {"code": "CodeableConcept"}
                        ],
                        "min": 0,
                        "max": "1"
                    }
                ]
            }
        })
    }

    #[test]
    fn test_get_structure_definition_by_type() {
        let ctx = InMemoryFhirContext::from_resources([create_mock_patient_sd()]);
        let sd = ctx
            .get_core_structure_definition_by_type("Patient")
            .unwrap()
            .unwrap();
        assert_eq!(sd.type_, "Patient");
    }

    #[test]
    fn test_get_structure_definition_not_found() {
        let ctx = InMemoryFhirContext::new();
        assert!(ctx
            .get_core_structure_definition_by_type("Patient")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_get_element_type() {
        let ctx = InMemoryFhirContext::from_resources([create_mock_patient_sd()]);
        let info = ctx.get_element_type("Patient", "name").unwrap().unwrap();
        assert_eq!(info.type_codes, vec!["HumanName".to_string()]);
        assert!(!info.is_choice);
    }

    #[test]
    fn test_get_element_type_with_choice() {
        let ctx = InMemoryFhirContext::from_resources([create_mock_observation_sd()]);
        let info = ctx
            .get_element_type("Observation", "value[x]")
            .unwrap()
            .unwrap();
        assert!(info.is_choice);
        assert_eq!(info.type_codes.len(), 3);
    }

    #[test]
    fn test_get_choice_expansions() {
        let ctx = InMemoryFhirContext::from_resources([create_mock_observation_sd()]);
        let expansions = ctx
            .get_choice_expansions("Observation", "value[x]")
            .unwrap()
            .unwrap();
        assert!(expansions.contains(&"Quantity".to_string()));
    }

    #[test]
    fn test_find_choice_base() {
        let ctx = InMemoryFhirContext::from_resources([create_mock_observation_sd()]);
        let base = ctx.find_choice_base("Observation", "valueQuantity");
        assert_eq!(base, Some("Observation.value".to_string()));
    }

    #[test]
    fn test_resolve_path_type() {
        let ctx = InMemoryFhirContext::from_resources([
            create_mock_patient_sd(),
            json!({
                "resourceType": "StructureDefinition",
                "id": "HumanName",
                "url": "http://hl7.org/fhir/StructureDefinition/HumanName",
                "name": "HumanName",
                "status": "active",
                "kind": "complex-type",
                "abstract": false,
                "type": "HumanName",
                "snapshot": {
                    "element": [
                        {"id": "HumanName", "path": "HumanName", "min": 0, "max": "*"},
                        {"id": "HumanName.family", "path": "HumanName.family", "type": [{"code": "string"}], "min": 0, "max": "1"}
                    ]
                }
            }),
        ]);
        let info = ctx.resolve_path_type("Patient", "name.family").unwrap();
        assert!(info.is_some());
    }

    #[derive(Default)]
    struct CountingProvider {
        calls: AtomicUsize,
        resource: Mutex<Option<Value>>,
    }

    #[async_trait]
    impl ConformanceResourceProvider for CountingProvider {
        async fn list_by_canonical(&self, canonical_url: &str) -> Result<Vec<Arc<Value>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let guard = self.resource.lock().unwrap();
            match guard.as_ref() {
                Some(r) if r.get("url").and_then(|v| v.as_str()) == Some(canonical_url) => {
                    Ok(vec![Arc::new(r.clone())])
                }
                _ => Ok(vec![]),
            }
        }
    }

    #[tokio::test]
    async fn flexible_context_caches_by_canonical() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
            resource: Mutex::new(Some(create_mock_patient_sd())),
        });
        let ctx = FlexibleFhirContext::new(provider.clone()).unwrap();

        let url = "http://hl7.org/fhir/StructureDefinition/Patient";
        let first = ctx.get_resource_by_url(url, None).unwrap();
        let second = ctx.get_resource_by_url(url, None).unwrap();

        assert!(first.is_some());
        assert!(second.is_some());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }
}
