use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::{Module, util};
use crate::planner::{Plan, Task};

fn default_true() -> bool {
    true
}

fn default_flash_size() -> String {
    // 256 MiB, the size the emulator requires of each pflash image.
    "0x10000000".into()
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RegionConfig {
    pub name: String,
    /// Hex offset into the secure flash image.
    pub offset: String,
    /// Hex size limit of the region.
    pub size: String,
    /// Artifact to splice in (workspace config path).
    pub source: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlashConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Main firmware flash image.
    pub image: String,
    /// Secure flash image that receives the region patches.
    pub secure_image: String,
    #[serde(default = "default_flash_size")]
    pub size: String,
    pub regions: Vec<RegionConfig>,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: String::new(),
            secure_image: String::new(),
            size: default_flash_size(),
            regions: Vec::new(),
        }
    }
}

fn load_flash_cfg(doc: &ConfigDoc) -> Result<FlashConfig> {
    let cfg: FlashConfig = doc.deserialize_path("flash")?.unwrap_or_default();
    if cfg.image.trim().is_empty() || cfg.secure_image.trim().is_empty() {
        return Err(Error::config(
            "flash.image and flash.secure_image are required",
        ));
    }
    Ok(cfg)
}

/// Copy `source` into the region of `target` that starts at `offset` and is
/// `region_size` bytes long. The source must fit the region; on the failure
/// path the target is never opened. Bytes of the region past the end of the
/// source keep their previous content.
pub fn patch_region(target: &Path, offset: u64, region_size: u64, source: &Path) -> Result<()> {
    let source_len = util::file_len(source)?;
    if source_len > region_size {
        return Err(Error::OversizeSource {
            source: source.to_path_buf(),
            source_len,
            region_size,
        });
    }

    let data = std::fs::read(source)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", source.display())))?;
    let mut fd = OpenOptions::new()
        .read(true)
        .write(true)
        .open(target)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", target.display())))?;
    fd.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::msg(format!("seek failed in {}: {e}", target.display())))?;
    fd.write_all(&data)
        .map_err(|e| Error::msg(format!("write failed in {}: {e}", target.display())))?;
    Ok(())
}

/// Zero-pad `path` up to exactly `target_size` bytes. A file already at or
/// above the target is left untouched (never truncated), which also makes the
/// operation idempotent.
pub fn pad_image(path: &Path, target_size: u64) -> Result<()> {
    let current = util::file_len(path)?;
    if current >= target_size {
        return Ok(());
    }

    let mut fd = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    let zeros = [0u8; 64 * 1024];
    let mut remaining = target_size - current;
    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64) as usize;
        fd.write_all(&zeros[..n])
            .map_err(|e| Error::msg(format!("pad write failed in {}: {e}", path.display())))?;
        remaining -= n as u64;
    }
    Ok(())
}

pub struct PatchTask;

impl PatchTask {
    pub const ID: &'static str = "flash.patch";

    fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let cfg = load_flash_cfg(doc)?;
        let secure_image = ws.resolve_config_path(&cfg.secure_image)?;

        for region in &cfg.regions {
            let offset = util::parse_hex(&region.offset)?;
            let size = util::parse_hex(&region.size)?;
            let source = ws.resolve_config_path(&region.source)?;
            ctx.log(&format!(
                "patching region '{}' at {} ({} bytes max) from {}",
                region.name,
                region.offset,
                size,
                source.display()
            ));
            patch_region(&secure_image, offset, size, &source)?;
        }
        Ok(())
    }
}

pub struct FinalizeTask;

impl FinalizeTask {
    pub const ID: &'static str = "flash.finalize";

    fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let cfg = load_flash_cfg(doc)?;
        let size = util::parse_hex(&cfg.size)?;

        let mut artifacts = Vec::new();
        for raw in [&cfg.image, &cfg.secure_image] {
            let path = ws.resolve_config_path(raw)?;
            pad_image(&path, size)?;
            ctx.log(&format!("padded {} to {} bytes", path.display(), size));
            artifacts.push(serde_json::json!({
                "path": path.display().to_string(),
                "bytes": util::file_len(&path)?,
                "sha256": util::sha256_file_hex(&path)?,
            }));
        }

        let run_dir = ws.out_dir.join(util::build_name(doc));
        let manifest = serde_json::json!({
            "build": util::build_name(doc),
            "generated_at": chrono::Utc::now().to_rfc3339(),
            "flash_size": size,
            "artifacts": artifacts,
        });
        util::write_json_pretty(&run_dir.join("image-manifest.json"), &manifest)?;
        ctx.log(&format!(
            "wrote {}",
            run_dir.join("image-manifest.json").display()
        ));
        Ok(())
    }
}

pub struct FlashModule;

impl Module for FlashModule {
    fn id(&self) -> &'static str {
        "flash"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table_path(self.id())
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg: FlashConfig = doc.deserialize_path("flash")?.unwrap_or_default();
        if !cfg.enabled {
            return Err(Error::config("[flash].enabled=false is not allowed"));
        }

        plan.add(Task {
            id: PatchTask::ID.into(),
            label: "Patch flash regions".into(),
            module: self.id().into(),
            phase: "assemble".into(),
            after: vec!["core.init".into(), "secureworld:firmware?".into()],
            provides: vec!["image:patched".into()],
        })?;
        plan.add(Task {
            id: FinalizeTask::ID.into(),
            label: "Finalize flash images".into(),
            module: self.id().into(),
            phase: "assemble".into(),
            after: vec![PatchTask::ID.into()],
            provides: vec!["image:flash".into()],
        })
    }
}

impl ModuleExec for FlashModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(PatchTask::ID, PatchTask::exec)?;
        reg.add(FinalizeTask::ID, FinalizeTask::exec)
    }
}
