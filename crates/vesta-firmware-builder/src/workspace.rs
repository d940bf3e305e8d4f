use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_root_dir() -> String {
    ".".into()
}

fn default_build_dir() -> String {
    "build".into()
}

fn default_out_dir() -> String {
    "out".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    /// Named path aliases, usable in config values as `@alias/...`. The
    /// external source trees (monitor, firmware) are normally declared here.
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            build_dir: default_build_dir(),
            out_dir: default_out_dir(),
            paths: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub build_dir: PathBuf,
    pub out_dir: PathBuf,
    pub named_dirs: BTreeMap<String, PathBuf>,
}

impl WorkspacePaths {
    /// Resolve a user-configured path:
    /// - `@alias/...` expands from `[workspace.paths.alias]`
    /// - absolute paths are used as-is
    /// - relative paths are rooted at the workspace root
    pub fn resolve_config_path(&self, raw: &str) -> Result<PathBuf> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::config("empty path"));
        }

        if let Some(after_at) = raw.strip_prefix('@') {
            let (alias, rest) = match after_at.split_once('/') {
                Some((a, r)) => (a.trim(), Some(r)),
                None => (after_at.trim(), None),
            };
            if alias.is_empty() {
                return Err(Error::config(format!("invalid alias path '{}'", raw)));
            }
            let base = self.named_dirs.get(alias).ok_or_else(|| {
                let known = self
                    .named_dirs
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ");
                Error::config(format!(
                    "unknown workspace path alias '{}' in '{}' (known: {})",
                    alias, raw, known
                ))
            })?;
            return Ok(match rest {
                Some(r) if !r.is_empty() => base.join(r),
                _ => base.to_path_buf(),
            });
        }

        let pb = PathBuf::from(raw);
        Ok(if pb.is_absolute() {
            pb
        } else {
            self.root.join(pb)
        })
    }
}

pub fn load_paths(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let cwd = std::env::current_dir().map_err(|e| Error::msg(format!("cwd error: {e}")))?;
    let root = resolve_abs_or_under(&cwd, &cfg.root_dir)?;
    let build_dir = resolve_sub_dir(&root, &cfg.build_dir)?;
    let out_dir = resolve_sub_dir(&root, &cfg.out_dir)?;

    let mut named_dirs = BTreeMap::new();
    named_dirs.insert("root".to_string(), root.clone());
    named_dirs.insert("build".to_string(), build_dir.clone());
    named_dirs.insert("out".to_string(), out_dir.clone());
    for (name, raw) in &cfg.paths {
        let key = name.trim();
        if key.is_empty() {
            return Err(Error::config("workspace.paths has an empty key"));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::config(format!(
                "workspace.paths key '{}' is invalid (allowed: a-zA-Z0-9_-)",
                key
            )));
        }
        if named_dirs.contains_key(key) {
            return Err(Error::config(format!(
                "workspace.paths key '{}' is reserved or duplicated",
                key
            )));
        }
        named_dirs.insert(key.to_string(), resolve_abs_or_under(&root, raw)?);
    }

    Ok(WorkspacePaths {
        root,
        build_dir,
        out_dir,
        named_dirs,
    })
}

/// Resolve the workspace and create the build/out directories.
pub fn init_dirs(cfg: &WorkspaceConfig) -> Result<WorkspacePaths> {
    let paths = load_paths(cfg)?;
    for dir in [&paths.build_dir, &paths.out_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", dir.display())))?;
    }
    Ok(paths)
}

fn resolve_abs_or_under(base: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace path"));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { base.join(pb) })
}

// build/out must stay inside the workspace root.
fn resolve_sub_dir(root: &Path, p: &str) -> Result<PathBuf> {
    let p = p.trim();
    if p.is_empty() {
        return Err(Error::config("empty workspace dir"));
    }
    let rel = Path::new(p);
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::config(format!(
            "invalid workspace dir '{}' (contains '..')",
            p
        )));
    }
    let pb = PathBuf::from(p);
    Ok(if pb.is_absolute() { pb } else { root.join(pb) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_paths() -> WorkspacePaths {
        let root = PathBuf::from("/tmp/vesta-root");
        let build_dir = root.join("build");
        let out_dir = root.join("out");
        let mut named_dirs = BTreeMap::new();
        named_dirs.insert("root".into(), root.clone());
        named_dirs.insert("build".into(), build_dir.clone());
        named_dirs.insert("out".into(), out_dir.clone());
        named_dirs.insert("firmware".into(), root.join("silicon/tfa"));
        WorkspacePaths {
            root,
            build_dir,
            out_dir,
            named_dirs,
        }
    }

    #[test]
    fn resolves_alias_and_relative_paths() {
        let ws = sample_paths();
        assert_eq!(
            ws.resolve_config_path("fv/FLASH0.fd").expect("relative"),
            ws.root.join("fv/FLASH0.fd")
        );
        assert_eq!(
            ws.resolve_config_path("@firmware/build/bl1.bin")
                .expect("alias"),
            ws.root.join("silicon/tfa/build/bl1.bin")
        );
    }

    #[test]
    fn rejects_unknown_alias() {
        let ws = sample_paths();
        let err = ws.resolve_config_path("@nope/x").unwrap_err().to_string();
        assert!(err.contains("unknown workspace path alias"), "{err}");
    }

    #[test]
    fn rejects_parent_traversal_in_build_dir() {
        let err = resolve_sub_dir(Path::new("/w"), "../escape")
            .unwrap_err()
            .to_string();
        assert!(err.contains(".."), "{err}");
    }
}
