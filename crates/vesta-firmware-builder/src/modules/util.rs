use std::fs;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::config::ConfigDoc;
use crate::error::{Error, Result};

pub fn build_name(doc: &ConfigDoc) -> String {
    doc.path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("build")
        .to_string()
}

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        ensure_dir(parent)?;
    }
    fs::write(p, s).map_err(|e| Error::msg(format!("failed to write {}: {e}", p.display())))
}

pub fn write_json_pretty(p: &Path, v: &serde_json::Value) -> Result<()> {
    let s = serde_json::to_string_pretty(v)
        .map_err(|e| Error::msg(format!("json encode error: {e}")))?;
    write_text(p, &s)
}

/// Parse a hexadecimal config value ("0x20000" or "20000").
pub fn parse_hex(raw: &str) -> Result<u64> {
    let s = raw.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if digits.is_empty() {
        return Err(Error::config(format!("empty hex value '{raw}'")));
    }
    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::config(format!("invalid hex value '{raw}': {e}")))
}

pub fn file_len(p: &Path) -> Result<u64> {
    Ok(fs::metadata(p)
        .map_err(|e| Error::msg(format!("failed to stat {}: {e}", p.display())))?
        .len())
}

pub fn sha256_file_hex(p: &Path) -> Result<String> {
    let mut f = fs::File::open(p)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", p.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", p.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn remove_path_if_exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_dir() {
                fs::remove_dir_all(path).map_err(|e| {
                    Error::msg(format!("failed to remove directory {}: {e}", path.display()))
                })?;
            } else {
                fs::remove_file(path).map_err(|e| {
                    Error::msg(format!("failed to remove file {}: {e}", path.display()))
                })?;
            }
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::msg(format!(
            "failed to inspect {}: {e}",
            path.display()
        ))),
    }
}

pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            ensure_dir(&out)?;
        } else if entry.file_type().is_symlink() {
            copy_symlink(p, &out)?;
        } else {
            if let Some(parent) = out.parent() {
                ensure_dir(parent)?;
            }
            fs::copy(p, &out).map_err(|e| {
                Error::msg(format!(
                    "failed to copy {} -> {}: {e}",
                    p.display(),
                    out.display()
                ))
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    use std::os::unix::fs::symlink;
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst)
            .map_err(|e| Error::msg(format!("failed to remove {}: {e}", dst.display())))?;
    }
    let target = fs::read_link(src)
        .map_err(|e| Error::msg(format!("failed to read symlink {}: {e}", src.display())))?;
    symlink(&target, dst).map_err(|e| {
        Error::msg(format!(
            "failed to create symlink {} -> {}: {e}",
            dst.display(),
            target.display()
        ))
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    fs::copy(src, dst).map_err(|e| {
        Error::msg(format!(
            "failed to copy {} -> {}: {e}",
            src.display(),
            dst.display()
        ))
    })?;
    Ok(())
}
