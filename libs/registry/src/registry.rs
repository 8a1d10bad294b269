use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use serde_json::Value;
use tracing::warn;

use crate::traits::{Direction, ProviderEntry, ProviderTraits};

/// Backends compiled into the gateway; the registry always knows these even
/// when the trait table on disk is absent or unreadable.
const BUILTIN_BACKENDS: &[&str] = &["phaxio", "sinch", "signalwire", "telephony"];

/// Static configuration for backend resolution: explicit per-direction
/// overrides win, then the single legacy setting, both validated against the
/// known id set.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub traits_path: PathBuf,
    pub providers_dir: PathBuf,
    pub default_backend: String,
    pub outbound_backend: Option<String>,
    pub inbound_backend: Option<String>,
}

#[derive(Default)]
struct RegistryState {
    providers: HashMap<String, ProviderEntry>,
    /// Non-canonical trait keys seen per provider id.
    schema_issues: BTreeMap<String, Vec<String>>,
    loaded_mtime: Option<SystemTime>,
}

/// Merged view over the base trait table and per-provider manifests.
/// Owned by the application root; `reload` replaces any ad hoc cache
/// mutation, and reads refresh lazily when the traits file mtime moves.
pub struct ProviderRegistry {
    settings: RegistrySettings,
    state: Mutex<RegistryState>,
}

impl ProviderRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        let registry = Self {
            settings,
            state: Mutex::new(RegistryState::default()),
        };
        registry.reload();
        registry
    }

    /// Rebuilds the merged registry from disk. Degrades to the built-in id
    /// set on unreadable input rather than failing closed.
    pub fn reload(&self) {
        let mut state = self.state.lock().expect("registry mutex");
        *state = self.build_state();
    }

    /// Reloads only when the traits file mtime changed since the last build.
    pub fn refresh_if_stale(&self) {
        let mtime = fs::metadata(&self.settings.traits_path)
            .and_then(|m| m.modified())
            .ok();
        let mut state = self.state.lock().expect("registry mutex");
        if state.loaded_mtime != mtime || state.providers.is_empty() {
            *state = self.build_state();
        }
    }

    fn build_state(&self) -> RegistryState {
        let mut state = RegistryState::default();
        state.loaded_mtime = fs::metadata(&self.settings.traits_path)
            .and_then(|m| m.modified())
            .ok();

        for (id, entry) in load_base_table(&self.settings.traits_path, &mut state.schema_issues) {
            state.providers.insert(id, entry);
        }
        // Manifest-declared traits overlay the base table.
        for (id, entry) in scan_manifest_traits(&self.settings.providers_dir, &mut state.schema_issues)
        {
            let merged = match state.providers.remove(&id) {
                Some(base) => ProviderEntry {
                    id: id.clone(),
                    kind: entry.kind.or(base.kind),
                    traits: base.traits.merged_with(&entry.traits),
                },
                None => entry,
            };
            state.providers.insert(id, merged);
        }
        state
    }

    /// Provider ids known to the gateway: the merged table, or the built-in
    /// set when the table is empty.
    pub fn known_backends(&self) -> Vec<String> {
        self.refresh_if_stale();
        let state = self.state.lock().expect("registry mutex");
        if state.providers.is_empty() {
            BUILTIN_BACKENDS.iter().map(|s| s.to_string()).collect()
        } else {
            let mut ids: Vec<String> = state.providers.keys().cloned().collect();
            ids.sort();
            ids
        }
    }

    fn is_known(&self, id: &str) -> bool {
        self.known_backends().iter().any(|b| b == id)
    }

    /// Effective outbound backend id: explicit override when valid, else the
    /// legacy default.
    pub fn active_outbound(&self) -> String {
        self.resolve(self.settings.outbound_backend.as_deref())
    }

    /// Effective inbound backend id, resolved the same way.
    pub fn active_inbound(&self) -> String {
        self.resolve(self.settings.inbound_backend.as_deref())
    }

    fn resolve(&self, explicit: Option<&str>) -> String {
        let candidate = explicit
            .unwrap_or(&self.settings.default_backend)
            .trim()
            .to_ascii_lowercase();
        if self.is_known(&candidate) {
            candidate
        } else {
            if !candidate.is_empty() {
                warn!(backend = %candidate, "unknown backend override, falling back to default");
            }
            self.settings.default_backend.clone()
        }
    }

    pub fn traits_for(&self, provider_id: &str) -> ProviderTraits {
        self.refresh_if_stale();
        let state = self.state.lock().expect("registry mutex");
        state
            .providers
            .get(provider_id)
            .map(|entry| entry.traits.clone())
            .unwrap_or_default()
    }

    pub fn kind_of(&self, provider_id: &str) -> Option<String> {
        self.refresh_if_stale();
        let state = self.state.lock().expect("registry mutex");
        state.providers.get(provider_id).and_then(|e| e.kind.clone())
    }

    /// Boolean trait lookup by direction; `Any` ORs both directions.
    pub fn has_trait(&self, direction: Direction, key: &str) -> bool {
        match direction {
            Direction::Outbound => self.traits_for(&self.active_outbound()).flag(key),
            Direction::Inbound => self.traits_for(&self.active_inbound()).flag(key),
            Direction::Any => {
                self.has_trait(Direction::Outbound, key) || self.has_trait(Direction::Inbound, key)
            }
        }
    }

    /// Trait value lookup; for `Any` the outbound value wins when present.
    pub fn trait_value(&self, direction: Direction, key: &str) -> Option<Value> {
        match direction {
            Direction::Outbound => self.traits_for(&self.active_outbound()).value(key).cloned(),
            Direction::Inbound => self.traits_for(&self.active_inbound()).value(key).cloned(),
            Direction::Any => self
                .trait_value(Direction::Outbound, key)
                .or_else(|| self.trait_value(Direction::Inbound, key)),
        }
    }

    /// Non-canonical trait keys seen per provider id during the last build.
    pub fn schema_issues(&self) -> BTreeMap<String, Vec<String>> {
        let state = self.state.lock().expect("registry mutex");
        state.schema_issues.clone()
    }
}

fn read_json(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable provider JSON, skipping");
            None
        }
    }
}

fn entry_from_object(
    id: &str,
    obj: &serde_json::Map<String, Value>,
    issues: &mut BTreeMap<String, Vec<String>>,
) -> ProviderEntry {
    let (traits, unknown) = obj
        .get("traits")
        .and_then(Value::as_object)
        .map(ProviderTraits::from_raw)
        .unwrap_or_default();
    if !unknown.is_empty() {
        issues.entry(id.to_string()).or_default().extend(unknown);
    }
    ProviderEntry {
        id: id.to_string(),
        kind: obj.get("kind").and_then(Value::as_str).map(str::to_string),
        traits,
    }
}

/// Accepts either an object keyed by provider id or a list of provider
/// objects, mirroring both shipped trait-table shapes.
fn load_base_table(
    path: &Path,
    issues: &mut BTreeMap<String, Vec<String>>,
) -> Vec<(String, ProviderEntry)> {
    let mut out = Vec::new();
    let Some(value) = read_json(path) else {
        return out;
    };
    match value {
        Value::Object(map) => {
            for (id, obj) in &map {
                if id == "_schema" {
                    continue;
                }
                if let Some(obj) = obj.as_object() {
                    out.push((id.clone(), entry_from_object(id, obj, issues)));
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter().filter_map(Value::as_object) {
                if let Some(id) = item.get("id").and_then(Value::as_str) {
                    out.push((id.to_string(), entry_from_object(id, item, issues)));
                }
            }
        }
        _ => {}
    }
    out
}

/// Scans `providers/<id>/manifest.json` for optional `traits` and `kind`.
fn scan_manifest_traits(
    dir: &Path,
    issues: &mut BTreeMap<String, Vec<String>>,
) -> Vec<(String, ProviderEntry)> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for dir_entry in entries.flatten() {
        let id = dir_entry.file_name().to_string_lossy().into_owned();
        let manifest_path = dir_entry.path().join("manifest.json");
        let Some(value) = read_json(&manifest_path) else {
            continue;
        };
        if let Some(obj) = value.as_object() {
            out.push((id.clone(), entry_from_object(&id, obj, issues)));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write_registry(dir: &Path, base: Value) -> RegistrySettings {
        let traits_path = dir.join("provider_traits.json");
        fs::write(&traits_path, serde_json::to_vec(&base).unwrap()).unwrap();
        RegistrySettings {
            traits_path,
            providers_dir: dir.join("providers"),
            default_backend: "telephony".into(),
            outbound_backend: None,
            inbound_backend: None,
        }
    }

    #[test]
    fn manifest_traits_override_base() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_registry(
            dir.path(),
            json!({
                "acmefax": { "kind": "cloud", "traits": { "supports_inbound": false } },
                "telephony": { "traits": { "requires_legacy_telephony": true } }
            }),
        );
        let provider_dir = settings.providers_dir.join("acmefax");
        fs::create_dir_all(&provider_dir).unwrap();
        fs::write(
            provider_dir.join("manifest.json"),
            serde_json::to_vec(&json!({
                "traits": { "supports_inbound": true, "made_up_key": 1 }
            }))
            .unwrap(),
        )
        .unwrap();

        let registry = ProviderRegistry::new(settings);
        assert!(registry.traits_for("acmefax").flag("supports_inbound"));
        assert_eq!(registry.kind_of("acmefax").as_deref(), Some("cloud"));
        let issues = registry.schema_issues();
        assert_eq!(issues.get("acmefax").unwrap(), &vec!["made_up_key".to_string()]);
    }

    #[test]
    fn unknown_override_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = write_registry(
            dir.path(),
            json!({ "telephony": {}, "phaxio": {} }),
        );
        settings.outbound_backend = Some("nonexistent".into());
        let registry = ProviderRegistry::new(settings);
        assert_eq!(registry.active_outbound(), "telephony");
        assert_eq!(registry.active_inbound(), "telephony");
    }

    #[test]
    fn explicit_per_direction_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = write_registry(
            dir.path(),
            json!({ "telephony": {}, "phaxio": {} }),
        );
        settings.outbound_backend = Some("phaxio".into());
        let registry = ProviderRegistry::new(settings);
        assert_eq!(registry.active_outbound(), "phaxio");
        assert_eq!(registry.active_inbound(), "telephony");
    }

    #[test]
    fn any_direction_is_logical_or() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = write_registry(
            dir.path(),
            json!({
                "phaxio": { "traits": { "supports_inbound": true } },
                "telephony": { "traits": { "requires_legacy_telephony": true } }
            }),
        );
        settings.outbound_backend = Some("phaxio".into());
        settings.inbound_backend = Some("telephony".into());
        let registry = ProviderRegistry::new(settings);
        assert!(registry.has_trait(Direction::Any, "supports_inbound"));
        assert!(registry.has_trait(Direction::Any, "requires_legacy_telephony"));
        assert!(!registry.has_trait(Direction::Outbound, "requires_legacy_telephony"));
    }

    #[test]
    fn missing_table_degrades_to_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RegistrySettings {
            traits_path: dir.path().join("absent.json"),
            providers_dir: dir.path().join("providers"),
            default_backend: "telephony".into(),
            outbound_backend: None,
            inbound_backend: None,
        };
        let registry = ProviderRegistry::new(settings);
        assert!(registry.known_backends().contains(&"phaxio".to_string()));
        assert_eq!(registry.active_outbound(), "telephony");
    }

    #[test]
    fn reload_picks_up_new_providers() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_registry(dir.path(), json!({ "telephony": {} }));
        let traits_path = settings.traits_path.clone();
        let registry = ProviderRegistry::new(settings);
        assert!(!registry.known_backends().contains(&"documo".to_string()));
        fs::write(
            &traits_path,
            serde_json::to_vec(&json!({ "telephony": {}, "documo": {} })).unwrap(),
        )
        .unwrap();
        registry.reload();
        assert!(registry.known_backends().contains(&"documo".to_string()));
    }
}
