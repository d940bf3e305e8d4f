use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::emulator::EmulatorConfig;
use crate::modules::{Module, core, util};
use crate::planner::{Plan, Task};

/// Presence of this test in the discovered set switches the run into
/// paging-audit mode, which changes how results are post-processed.
pub const PAGING_AUDIT_TEST: &str = "DxePagingAuditTestApp.efi";

fn default_true() -> bool {
    true
}

fn default_drive() -> String {
    "@out/VirtualDrive.img".into()
}

fn default_size_mb() -> u64 {
    60
}

fn default_search_root() -> String {
    "@build".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TestDriveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Removable-media image (workspace config path).
    #[serde(default = "default_drive")]
    pub drive: String,
    #[serde(default = "default_size_mb")]
    pub size_mb: u64,
    /// Wipe and recreate the drive before staging.
    pub wipe: bool,
    /// Root under which test binaries live; the architecture subdirectory is
    /// appended (workspace config path).
    #[serde(default = "default_search_root")]
    pub search_root: String,
    /// Comma-separated glob patterns; empty means "no tests, just boot".
    pub patterns: String,
}

impl Default for TestDriveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            drive: default_drive(),
            size_mb: default_size_mb(),
            wipe: false,
            search_root: default_search_root(),
            patterns: String::new(),
        }
    }
}

/// The removable-media image staged for the emulated target. Creation and
/// file transfer go through mtools so the host never mounts the image.
pub struct VirtualDrive {
    path: PathBuf,
}

impl VirtualDrive {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn wipe(&self, ctx: &ExecCtx) -> Result<()> {
        if util::remove_path_if_exists(&self.path)? {
            ctx.log(&format!("wiped {}", self.path.display()));
        }
        Ok(())
    }

    pub fn make_drive(&self, ctx: &ExecCtx, size_mb: u64) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            util::ensure_dir(parent)?;
        }
        let file = fs::File::create(&self.path)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", self.path.display())))?;
        file.set_len(size_mb * 1024 * 1024)
            .map_err(|e| Error::msg(format!("failed to size {}: {e}", self.path.display())))?;
        drop(file);

        let mut format = Command::new("mformat");
        format.arg("-i").arg(&self.path).arg("::");
        ctx.run_cmd(format)?;
        ctx.log(&format!(
            "created {} ({size_mb} MiB)",
            self.path.display()
        ));
        Ok(())
    }

    pub fn copy_in(&self, ctx: &ExecCtx, src: &Path) -> Result<()> {
        let mut cp = Command::new("mcopy");
        cp.arg("-o").arg("-i").arg(&self.path).arg(src).arg("::/");
        ctx.run_cmd(cp)
    }

    pub fn copy_out(&self, ctx: &ExecCtx, name: &str, dest_dir: &Path) -> Result<()> {
        util::ensure_dir(dest_dir)?;
        let mut cp = Command::new("mcopy");
        cp.arg("-n")
            .arg("-i")
            .arg(&self.path)
            .arg(format!("::/{name}"))
            .arg(dest_dir);
        ctx.run_cmd(cp)
    }

    /// Write the auto-run script executed by the target's shell on boot.
    pub fn add_startup_script(
        &self,
        ctx: &ExecCtx,
        commands: &[String],
        auto_shutdown: bool,
    ) -> Result<()> {
        let mut script = String::from("@echo -off\nfs0:\n");
        for c in commands {
            script.push_str(c);
            script.push('\n');
        }
        if auto_shutdown {
            script.push_str("reset -s\n");
        }

        let staging = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("startup.nsh");
        util::write_text(&staging, &script)?;
        self.copy_in(ctx, &staging)?;
        ctx.log(&format!(
            "staged startup script ({} command(s), auto_shutdown={auto_shutdown})",
            commands.len()
        ));
        Ok(())
    }

    pub fn add_tests(
        &self,
        ctx: &ExecCtx,
        tests: &[PathBuf],
        auto_run: bool,
        auto_shutdown: bool,
        paging_audit: bool,
    ) -> Result<()> {
        for test in tests {
            self.copy_in(ctx, test)?;
        }
        if paging_audit {
            ctx.log("paging-audit test staged; audit post-processing will run");
        }

        let commands: Vec<String> = if auto_run {
            tests
                .iter()
                .filter_map(|t| t.file_name().and_then(|s| s.to_str()))
                .map(String::from)
                .collect()
        } else {
            Vec::new()
        };
        self.add_startup_script(ctx, &commands, auto_shutdown)
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::config(format!("invalid test pattern '{pattern}': {e}")))
}

/// Expand comma-separated glob patterns against `search_dir`. Matches are
/// deduplicated and sorted per pattern, in pattern order; the same file may
/// appear once per pattern that matches it.
pub fn discover_tests(search_dir: &Path, patterns: &str) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !search_dir.is_dir() {
        return Ok(out);
    }

    for pattern in patterns.split(',') {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            continue;
        }
        let re = glob_to_regex(pattern)?;
        let mut matched = Vec::new();
        for entry in fs::read_dir(search_dir)
            .map_err(|e| Error::msg(format!("failed to read {}: {e}", search_dir.display())))?
        {
            let entry = entry.map_err(|e| Error::msg(format!("read_dir entry error: {e}")))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if re.is_match(name) {
                matched.push(path);
            }
        }
        matched.sort();
        matched.dedup();
        out.extend(matched);
    }
    Ok(out)
}

pub fn has_paging_audit(tests: &[PathBuf]) -> bool {
    tests
        .iter()
        .any(|t| t.file_name().and_then(|s| s.to_str()) == Some(PAGING_AUDIT_TEST))
}

/// Staging record handed to the emulator stage: which tests went onto the
/// drive and whether paging-audit mode is on.
#[derive(Debug, Clone, Deserialize, serde::Serialize, Default)]
pub struct StagingManifest {
    pub tests: Vec<String>,
    pub paging_audit: bool,
}

pub fn staging_manifest_path(ws: &crate::workspace::WorkspacePaths, doc: &ConfigDoc) -> PathBuf {
    ws.out_dir
        .join(util::build_name(doc))
        .join("testdrive-manifest.json")
}

pub struct StageTask;

impl StageTask {
    pub const ID: &'static str = "testdrive.stage";

    fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let cfg: TestDriveConfig = doc.deserialize_path("testdrive")?.unwrap_or_default();
        let emu: EmulatorConfig = doc.deserialize_path("emulator")?.unwrap_or_default();
        let platform = core::load_platform(doc)?;

        if emu.run_tests {
            if cfg.patterns.trim().is_empty() {
                tracing::warn!("running tests, but testdrive.patterns selects none");
                ctx.log("WARNING: run_tests is set but testdrive.patterns selects no tests");
            }
            if !cfg.wipe {
                ctx.log("testdrive.wipe=false: old files can persist and affect test results");
            }
            if !emu.shutdown_after_run {
                ctx.log(
                    "emulator.shutdown_after_run=false: close the emulator manually to gather results",
                );
            }
        }

        let drive = VirtualDrive::new(ws.resolve_config_path(&cfg.drive)?);
        if cfg.wipe {
            drive.wipe(ctx)?;
        }
        if !drive.exists() {
            drive.make_drive(ctx, cfg.size_mb)?;
        }

        let manifest = if cfg.patterns.trim().is_empty() {
            drive.add_startup_script(ctx, &[], emu.shutdown_after_run)?;
            StagingManifest::default()
        } else {
            let search_dir = ws
                .resolve_config_path(&cfg.search_root)?
                .join(platform.arch_subdir());
            let tests = discover_tests(&search_dir, &cfg.patterns)?;
            ctx.log(&format!(
                "discovered {} test(s) under {}",
                tests.len(),
                search_dir.display()
            ));
            let paging_audit = has_paging_audit(&tests);
            drive.add_tests(ctx, &tests, emu.run_tests, emu.shutdown_after_run, paging_audit)?;
            StagingManifest {
                tests: tests
                    .iter()
                    .filter_map(|t| t.file_name().and_then(|s| s.to_str()))
                    .map(String::from)
                    .collect(),
                paging_audit,
            }
        };

        let manifest_path = staging_manifest_path(&ws, doc);
        util::write_json_pretty(
            &manifest_path,
            &serde_json::to_value(&manifest)
                .map_err(|e| Error::msg(format!("json encode error: {e}")))?,
        )?;
        Ok(())
    }
}

pub struct TestDriveModule;

impl Module for TestDriveModule {
    fn id(&self) -> &'static str {
        "testdrive"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table_path(self.id())
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg: TestDriveConfig = doc.deserialize_path("testdrive")?.unwrap_or_default();
        if !cfg.enabled {
            return Ok(());
        }
        plan.add(Task {
            id: StageTask::ID.into(),
            label: "Stage virtual drive".into(),
            module: self.id().into(),
            phase: "stage".into(),
            after: vec!["core.init".into()],
            provides: vec!["testdrive:media".into()],
        })
    }
}

impl ModuleExec for TestDriveModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(StageTask::ID, StageTask::exec)
    }
}
