use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

/// A fully resolved build definition. Every pipeline stage reads its own
/// section from this document; nothing is smuggled through the process
/// environment.
#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }
        let mut cur = &self.value;
        for seg in path.split('.') {
            cur = cur.as_table()?.get(seg)?;
        }
        Some(cur)
    }

    pub fn table_path(&self, path: &str) -> Option<&toml::value::Table> {
        self.value_path(path).and_then(Value::as_table)
    }

    pub fn has_table_path(&self, path: &str) -> bool {
        self.table_path(path).is_some()
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("failed to deserialize '{}': {e}", path)))?;
        Ok(Some(parsed))
    }
}

fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_tbl), Value::Table(overlay_tbl)) => {
            for (k, v) in overlay_tbl {
                match base_tbl.get_mut(&k) {
                    Some(slot) => merge_values(slot, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

// Root-level composition only: a single optional `extends` parent plus an
// `imports` list, each merged under the local document.
fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(parent) = value.get("extends").and_then(Value::as_str) {
        let parent_path = resolve_ref_path(path, parent);
        let loaded = load_value_inner(&parent_path, stack)?;
        merge_values(&mut out, loaded);
    }

    let imports: Vec<String> = match value.get("imports").and_then(Value::as_array) {
        Some(arr) => {
            let mut list = Vec::new();
            for v in arr {
                let Some(s) = v.as_str() else {
                    return Err(Error::config(format!(
                        "invalid imports entry in {} (expected string)",
                        path.display()
                    )));
                };
                if !s.trim().is_empty() {
                    list.push(s.trim().to_string());
                }
            }
            list
        }
        None => Vec::new(),
    };
    for imp in imports {
        let imp_path = resolve_ref_path(path, &imp);
        let loaded = load_value_inner(&imp_path, stack)?;
        merge_values(&mut out, loaded);
    }

    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
        tbl.remove("imports");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}
