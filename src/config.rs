//! Schema-validated daemon configuration store.
//!
//! The store holds named string-valued properties against a fixed schema.
//! Each property has a validator and an optional default; values are kept in
//! memory and persisted to a TOML file with a temp-then-rename write so a
//! crash mid-save never leaves a truncated config on disk.
//!
//! Unknown-property policy (both directions, documented here once): any
//! property name not in the schema is rejected with `no such property: <k>`.
//! Reads of a known-but-unset property resolve to its default, or the empty
//! string when the property has no default.

use std::collections::BTreeMap;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};

use anyhow::{Context, Result};
use tracing::debug;

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

type Validator = fn(&str) -> std::result::Result<(), String>;

struct Property {
    default: Option<&'static str>,
    validate: Validator,
}

fn schema() -> &'static BTreeMap<&'static str, Property> {
    static SCHEMA: OnceLock<BTreeMap<&'static str, Property>> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        BTreeMap::from([
            ("cpus", Property { default: Some("4"), validate: validate_cpus }),
            ("memory", Property { default: Some("8192"), validate: validate_memory }),
            ("bundle", Property { default: None, validate: validate_nonempty }),
            ("pull-secret-file", Property { default: None, validate: validate_nonempty }),
            ("nameserver", Property { default: None, validate: validate_ipv4 }),
            ("disable-update-check", Property { default: Some("false"), validate: validate_bool }),
        ])
    })
}

fn validate_cpus(value: &str) -> std::result::Result<(), String> {
    match value.parse::<u32>() {
        Ok(n) if n >= 4 => Ok(()),
        _ => Err(format!("requires an integer >= 4, got '{value}'")),
    }
}

fn validate_memory(value: &str) -> std::result::Result<(), String> {
    match value.parse::<u32>() {
        Ok(n) if n >= 8192 => Ok(()),
        _ => Err(format!("requires an integer >= 8192 (MiB), got '{value}'")),
    }
}

fn validate_nonempty(value: &str) -> std::result::Result<(), String> {
    if value.trim().is_empty() {
        Err("requires a non-empty value".to_owned())
    } else {
        Ok(())
    }
}

fn validate_ipv4(value: &str) -> std::result::Result<(), String> {
    value
        .parse::<Ipv4Addr>()
        .map(|_| ())
        .map_err(|_| format!("requires an IPv4 address, got '{value}'"))
}

fn validate_bool(value: &str) -> std::result::Result<(), String> {
    match value {
        "true" | "false" => Ok(()),
        _ => Err(format!("requires 'true' or 'false', got '{value}'")),
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// File-backed property store shared by all control-plane connection tasks.
///
/// Interior locking makes `&Store` safe to share; one `setconfig` request
/// holds the write lock across validation, mutation, and save, so all keys
/// of a request become visible together.
pub struct Store {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

/// Outcome of applying one `setconfig` request.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SetOutcome {
    /// Property names actually changed, in sorted order.
    pub changed: Vec<String>,
    /// Human-readable rejection messages for properties that failed
    /// validation or do not exist in the schema.
    pub rejected: Vec<String>,
}

impl Store {
    /// Load the store from `path`. A missing file yields an empty store;
    /// the file is created on first save.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str::<BTreeMap<String, String>>(&raw)
                .with_context(|| format!("parse config file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("read config file {}", path.display()));
            }
        };

        debug!(path = %path.display(), properties = values.len(), "config store loaded");
        Ok(Self { path, values: RwLock::new(values) })
    }

    /// Validate and apply a batch of properties, then persist once.
    ///
    /// Properties that pass validation are set; the rest are reported in
    /// `SetOutcome::rejected`. Nothing is written to disk when no property
    /// was accepted.
    pub fn set_all(&self, properties: &BTreeMap<String, String>) -> Result<SetOutcome> {
        let mut outcome = SetOutcome::default();

        let mut values = self
            .values
            .write()
            .expect("config store lock poisoned");

        for (key, value) in properties {
            match schema().get(key.as_str()) {
                None => outcome.rejected.push(format!("no such property: {key}")),
                Some(property) => match (property.validate)(value) {
                    Ok(()) => {
                        values.insert(key.clone(), value.clone());
                        outcome.changed.push(key.clone());
                    }
                    Err(reason) => outcome.rejected.push(format!("{key}: {reason}")),
                },
            }
        }

        if !outcome.changed.is_empty() {
            self.save(&values)?;
        }

        Ok(outcome)
    }

    /// Read one property. Unknown names are an `Err` with the rejection
    /// message; known-but-unset names resolve to the default or `""`.
    pub fn get(&self, key: &str) -> std::result::Result<String, String> {
        let Some(property) = schema().get(key) else {
            return Err(format!("no such property: {key}"));
        };

        let values = self
            .values
            .read()
            .expect("config store lock poisoned");

        Ok(values
            .get(key)
            .map(String::as_str)
            .or(property.default)
            .unwrap_or("")
            .to_owned())
    }

    /// Temp-then-rename write of the full property map.
    fn save(&self, values: &BTreeMap<String, String>) -> Result<()> {
        let rendered = toml::to_string_pretty(values).context("serialise config")?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create config directory {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("create temp config in {}", dir.display()))?;
        tmp.write_all(rendered.as_bytes()).context("write temp config")?;
        tmp.persist(&self.path)
            .with_context(|| format!("replace config file {}", self.path.display()))?;

        debug!(path = %self.path.display(), "config store saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
