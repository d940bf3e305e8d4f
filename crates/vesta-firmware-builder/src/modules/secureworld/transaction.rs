use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::executor::ExecCtx;

/// All `*.patch` files in `dir`, in filename order. A missing directory is an
/// empty patch set.
pub fn collect_patches(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", dir.display())))?
    {
        let entry = entry.map_err(|e| Error::msg(format!("read_dir entry error: {e}")))?;
        let path = entry.path();
        if path.is_file()
            && path
                .extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext == "patch")
        {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Run `build` with `patches` applied to `repo`, guaranteeing the tree is back
/// at its captured base revision on every exit path after a successful apply.
///
/// - Capturing the base revision or applying the patches aborts without a
///   revert; an apply failure can leave the tree mid-patch (the error says so;
///   there is no automatic recovery).
/// - Once the patches are in, the revert runs whether the build succeeded or
///   not, and a revert failure is reported instead of the build's own result.
pub fn with_patched_tree<F>(
    ctx: &mut ExecCtx,
    repo: &Path,
    patches: &[PathBuf],
    build: F,
) -> Result<()>
where
    F: FnOnce(&mut ExecCtx) -> Result<()>,
{
    if patches.is_empty() {
        ctx.log(&format!(
            "no patches for {}; building unpatched",
            repo.display()
        ));
        return build(ctx);
    }

    let mut rev = Command::new("git");
    rev.arg("-C").arg(repo).arg("rev-parse").arg("HEAD");
    let base = ctx.run_cmd_capture(rev).map_err(|e| {
        Error::msg(format!(
            "failed to capture base revision of {}: {e}",
            repo.display()
        ))
    })?;
    ctx.log(&format!("base revision of {}: {base}", repo.display()));

    let mut am = Command::new("git");
    am.arg("-C").arg(repo).arg("am");
    for p in patches {
        am.arg(p);
    }
    ctx.log(&format!(
        "applying {} patch(es) to {}",
        patches.len(),
        repo.display()
    ));
    if let Err(e) = ctx.run_cmd(am) {
        return Err(Error::msg(format!(
            "patch apply failed in {} (the tree may be left mid-patch; restore it manually before the next run): {e}",
            repo.display()
        )));
    }

    let build_res = build(ctx);

    let mut checkout = Command::new("git");
    checkout.arg("-C").arg(repo).arg("checkout").arg(&base);
    match ctx.run_cmd(checkout) {
        Ok(()) => {
            ctx.log(&format!("reverted {} to {base}", repo.display()));
            build_res
        }
        Err(e) => Err(Error::Revert {
            repo: repo.to_path_buf(),
            detail: e.to_string(),
        }),
    }
}
