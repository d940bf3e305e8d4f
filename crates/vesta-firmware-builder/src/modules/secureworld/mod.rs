pub mod transaction;

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::core::{Toolchain, load_platform};
use crate::modules::{Module, util};
use crate::planner::{Plan, Task};
use crate::workspace::WorkspacePaths;

fn default_true() -> bool {
    true
}

fn default_log_level() -> u32 {
    40
}

fn default_features() -> Vec<String> {
    [
        "ENABLE_SME_FOR_SWD=1",
        "ENABLE_SVE_FOR_SWD=1",
        "ENABLE_SME_FOR_NS=1",
        "ENABLE_SVE_FOR_NS=1",
        "ENABLE_FEAT_HCX=1",
        "HOB_LIST=1",
        "TRANSFER_LIST=1",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_cross_compile() -> String {
    "aarch64-linux-gnu-".into()
}

fn default_clang_binary() -> String {
    "clang".into()
}

/// One named secure-partition entry of the layout descriptor.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PartitionConfig {
    pub image_file: String,
    pub image_offset: String,
    pub manifest_file: String,
    pub manifest_offset: String,
    pub package: Option<String>,
    pub uuid: String,
    pub owner: String,
    pub size: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecureWorldConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Secure-partition monitor source tree (workspace config path).
    pub monitor_dir: String,
    /// Trusted-firmware source tree (workspace config path).
    pub firmware_dir: String,
    /// PROJECT= value for the monitor build.
    pub monitor_project: String,
    /// PLATFORM= value for the monitor build.
    pub monitor_platform: String,
    /// Monitor output image, relative to `monitor_dir`; handed to the
    /// trusted-firmware build as its secure payload.
    pub monitor_image: String,
    /// Optional project directory synced into the monitor tree before its
    /// build (workspace config path).
    pub project_overlay: Option<String>,
    #[serde(default = "default_true")]
    pub apply_patches: bool,
    /// Directory of `*.patch` files applied to the firmware tree for the
    /// duration of its build (workspace config path).
    pub patches_dir: Option<String>,
    #[serde(default = "default_cross_compile")]
    pub cross_compile: String,
    #[serde(default = "default_clang_binary")]
    pub clang_binary: String,
    #[serde(default = "default_log_level")]
    pub log_level: u32,
    #[serde(default = "default_features")]
    pub features: Vec<String>,
    pub partitions: BTreeMap<String, PartitionConfig>,
}

impl Default for SecureWorldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor_dir: String::new(),
            firmware_dir: String::new(),
            monitor_project: "vesta".into(),
            monitor_platform: "secure_qemu_aarch64".into(),
            monitor_image: String::new(),
            project_overlay: None,
            apply_patches: true,
            patches_dir: None,
            cross_compile: default_cross_compile(),
            clang_binary: default_clang_binary(),
            log_level: default_log_level(),
            features: default_features(),
            partitions: BTreeMap::new(),
        }
    }
}

fn load_cfg(doc: &ConfigDoc) -> Result<SecureWorldConfig> {
    let cfg: SecureWorldConfig = doc.deserialize_path("secureworld")?.unwrap_or_default();
    for (field, value) in [
        ("secureworld.monitor_dir", &cfg.monitor_dir),
        ("secureworld.firmware_dir", &cfg.firmware_dir),
        ("secureworld.monitor_image", &cfg.monitor_image),
    ] {
        if value.trim().is_empty() {
            return Err(Error::config(format!("{field} is required")));
        }
    }
    Ok(cfg)
}

pub fn layout_descriptor_path(ws: &WorkspacePaths) -> PathBuf {
    ws.build_dir.join("sp_layout.json")
}

pub struct MonitorTask;

impl MonitorTask {
    pub const ID: &'static str = "secureworld.monitor";

    fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let cfg = load_cfg(doc)?;
        let monitor_dir = ws.resolve_config_path(&cfg.monitor_dir)?;

        if let Some(overlay) = cfg.project_overlay.as_deref().filter(|s| !s.trim().is_empty()) {
            let src = ws.resolve_config_path(overlay)?;
            let dest = monitor_dir.join("project").join(&cfg.monitor_project);
            util::remove_path_if_exists(&dest)?;
            ctx.log(&format!(
                "syncing project overlay {} -> {}",
                src.display(),
                dest.display()
            ));
            util::copy_dir_all(&src, &dest)?;
        }

        ctx.log(&format!(
            "building monitor (PROJECT={} PLATFORM={})",
            cfg.monitor_project, cfg.monitor_platform
        ));
        let mut cmd = Command::new("make");
        cmd.arg(format!("PROJECT={}", cfg.monitor_project))
            .arg(format!("PLATFORM={}", cfg.monitor_platform))
            .current_dir(&monitor_dir);
        ctx.run_cmd(cmd)
    }
}

pub struct LayoutTask;

impl LayoutTask {
    pub const ID: &'static str = "secureworld.layout";

    fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let cfg = load_cfg(doc)?;
        if cfg.partitions.is_empty() {
            return Err(Error::config(
                "secureworld.partitions must declare at least one secure partition",
            ));
        }

        let mut entries = serde_json::Map::new();
        for (name, part) in &cfg.partitions {
            if part.uuid.trim().is_empty() {
                return Err(Error::config(format!(
                    "secureworld.partitions.{name}.uuid is required"
                )));
            }
            // Offsets stay hex strings in the descriptor; parse to validate.
            util::parse_hex(&part.image_offset)?;
            util::parse_hex(&part.manifest_offset)?;
            if let Some(size) = &part.size {
                util::parse_hex(size)?;
            }

            let image_file = ws.resolve_config_path(&part.image_file)?;
            let manifest_file = ws.resolve_config_path(&part.manifest_file)?;
            let mut entry = serde_json::Map::new();
            entry.insert(
                "image".into(),
                serde_json::json!({
                    "file": image_file.display().to_string(),
                    "offset": part.image_offset,
                }),
            );
            entry.insert(
                "pm".into(),
                serde_json::json!({
                    "file": manifest_file.display().to_string(),
                    "offset": part.manifest_offset,
                }),
            );
            if let Some(package) = &part.package {
                entry.insert("package".into(), serde_json::json!(package));
            }
            entry.insert("uuid".into(), serde_json::json!(part.uuid));
            entry.insert("owner".into(), serde_json::json!(part.owner));
            if let Some(size) = &part.size {
                entry.insert("size".into(), serde_json::json!(size));
            }
            entries.insert(name.clone(), serde_json::Value::Object(entry));
        }

        let path = layout_descriptor_path(&ws);
        util::write_json_pretty(&path, &serde_json::Value::Object(entries))?;
        ctx.log(&format!("wrote layout descriptor {}", path.display()));
        Ok(())
    }
}

pub struct FirmwareTask;

impl FirmwareTask {
    pub const ID: &'static str = "secureworld.firmware";

    fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let cfg = load_cfg(doc)?;
        let platform = load_platform(doc)?;
        let firmware_dir = ws.resolve_config_path(&cfg.firmware_dir)?;
        let monitor_dir = ws.resolve_config_path(&cfg.monitor_dir)?;
        let monitor_image = monitor_dir.join(&cfg.monitor_image);
        let layout = layout_descriptor_path(&ws);

        let mut args: Vec<String> = Vec::new();
        match platform.toolchain()? {
            Toolchain::Gcc => {
                args.push(format!("CROSS_COMPILE={}", cfg.cross_compile));
                args.push(format!("-j{}", num_cpus::get().max(1)));
            }
            Toolchain::Clang => {
                args.push(format!("CC={}", cfg.clang_binary));
            }
        }
        args.push(format!("PLAT={}", platform.name.to_ascii_lowercase()));
        args.push(format!("ARCH={}", platform.arch.to_ascii_lowercase()));
        args.push(format!("DEBUG={}", if platform.is_debug() { 1 } else { 0 }));
        args.extend(cfg.features.iter().cloned());
        args.push("SPD=spmd".into());
        args.push("SPMD_SPM_AT_SEL2=1".into());
        args.push(format!("SP_LAYOUT_FILE={}", layout.display()));
        args.push(format!("LOG_LEVEL={}", cfg.log_level));
        args.push(format!("BL32={}", monitor_image.display()));
        args.push("all".into());
        args.push("fip".into());

        let script = ws.build_dir.join("firmware-build.sh");
        util::write_text(
            &script,
            &format!("#!/bin/bash\nset -e\nmake {}\n", args.join(" ")),
        )?;
        ctx.log(&format!("wrote build script {}", script.display()));

        let run_build = |ctx: &mut ExecCtx| {
            ctx.log("building trusted firmware");
            let mut cmd = Command::new("bash");
            cmd.arg(&script).current_dir(&firmware_dir);
            ctx.run_cmd(cmd)
        };

        let patches = match (cfg.apply_patches, cfg.patches_dir.as_deref()) {
            (true, Some(dir)) if !dir.trim().is_empty() => {
                transaction::collect_patches(&ws.resolve_config_path(dir)?)?
            }
            _ => Vec::new(),
        };
        if cfg.apply_patches && !patches.is_empty() {
            transaction::with_patched_tree(ctx, &firmware_dir, &patches, run_build)?;
        } else {
            run_build(ctx)?;
        }

        fs::remove_file(&script)
            .map_err(|e| Error::msg(format!("failed to remove {}: {e}", script.display())))?;
        Ok(())
    }
}

/// Teardown of the external trees. The firmware `distclean` is fatal on
/// failure; the monitor's `clean` target is known to be unreliable and a
/// nonzero exit from it is tolerated.
pub fn clean_trees(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let ws = ctx.workspace_paths_or_init(doc)?;
    let cfg = load_cfg(doc)?;
    let firmware_dir = ws.resolve_config_path(&cfg.firmware_dir)?;
    let monitor_dir = ws.resolve_config_path(&cfg.monitor_dir)?;

    ctx.log(&format!("cleaning firmware tree {}", firmware_dir.display()));
    let mut distclean = Command::new("make");
    distclean.arg("distclean").current_dir(&firmware_dir);
    ctx.run_cmd(distclean)?;

    ctx.log(&format!("cleaning monitor tree {}", monitor_dir.display()));
    let mut clean = Command::new("make");
    clean.arg("clean").current_dir(&monitor_dir);
    if let Err(e) = ctx.run_cmd(clean) {
        tracing::warn!("monitor clean failed (ignored): {e}");
        ctx.log(&format!("monitor clean failed (ignored): {e}"));
    }
    Ok(())
}

pub struct SecureWorldModule;

impl Module for SecureWorldModule {
    fn id(&self) -> &'static str {
        "secureworld"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table_path(self.id())
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg: SecureWorldConfig = doc.deserialize_path("secureworld")?.unwrap_or_default();
        if !cfg.enabled {
            return Ok(());
        }

        plan.add(Task {
            id: MonitorTask::ID.into(),
            label: "Build secure monitor".into(),
            module: self.id().into(),
            phase: "build".into(),
            after: vec!["core.init".into()],
            provides: vec!["secureworld:monitor".into()],
        })?;
        plan.add(Task {
            id: LayoutTask::ID.into(),
            label: "Write layout descriptor".into(),
            module: self.id().into(),
            phase: "build".into(),
            after: vec!["core.init".into()],
            provides: vec!["secureworld:layout".into()],
        })?;
        plan.add(Task {
            id: FirmwareTask::ID.into(),
            label: "Build trusted firmware".into(),
            module: self.id().into(),
            phase: "build".into(),
            after: vec![MonitorTask::ID.into(), LayoutTask::ID.into()],
            provides: vec!["secureworld:firmware".into()],
        })
    }
}

impl ModuleExec for SecureWorldModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(MonitorTask::ID, MonitorTask::exec)?;
        reg.add(LayoutTask::ID, LayoutTask::exec)?;
        reg.add(FirmwareTask::ID, FirmwareTask::exec)
    }
}
