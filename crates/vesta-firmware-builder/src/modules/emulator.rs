use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::Command;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::executor::{ExecCtx, ModuleExec, TaskRegistry};
use crate::modules::testdrive::{StagingManifest, VirtualDrive, staging_manifest_path};
use crate::modules::{Module, core, flash, util};
use crate::planner::{Plan, Task};

fn default_true() -> bool {
    true
}

fn default_binary() -> String {
    "qemu-system-aarch64".into()
}

/// 90 days, after which an exemption decays and the test reports normally.
fn default_grace_secs() -> u64 {
    90 * 24 * 60 * 60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Machine-specific arguments; the flash and media drives are appended.
    pub args: Vec<String>,
    pub run_tests: bool,
    pub shutdown_after_run: bool,
    /// Where per-test records land (workspace config path); defaults to
    /// `@out/unit_test_results`.
    pub results_dir: Option<String>,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    /// Known-flaky tests and the time their exemption was registered.
    pub exemptions: BTreeMap<String, DateTime<Utc>>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: default_binary(),
            args: Vec::new(),
            run_tests: false,
            shutdown_after_run: false,
            results_dir: None,
            grace_secs: default_grace_secs(),
            exemptions: BTreeMap::new(),
        }
    }
}

/// A test is exempt iff it is registered and its grace window has not yet
/// elapsed. The boundary is strict: at exactly `grace_secs` the test reports
/// normally again.
pub fn is_exempt(
    name: &str,
    exemptions: &BTreeMap<String, DateTime<Utc>>,
    grace_secs: u64,
    now: DateTime<Utc>,
) -> bool {
    exemptions
        .get(name)
        .is_some_and(|registered| (now - *registered).num_seconds() < grace_secs as i64)
}

/// Partition test names into `(non_exempt, exempt)`. Pure; callers supply the
/// evaluation time.
pub fn partition_exempt<'a>(
    tests: &'a [String],
    exemptions: &BTreeMap<String, DateTime<Utc>>,
    grace_secs: u64,
    now: DateTime<Utc>,
) -> (Vec<&'a str>, Vec<&'a str>) {
    let mut non_exempt = Vec::new();
    let mut exempt = Vec::new();
    for name in tests {
        if is_exempt(name, exemptions, grace_secs, now) {
            exempt.push(name.as_str());
        } else {
            non_exempt.push(name.as_str());
        }
    }
    (non_exempt, exempt)
}

fn junit_failures(path: &Path) -> Result<u64> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {}: {e}", path.display())))?;
    let re = Regex::new(r#"failures="(\d+)""#).expect("failures pattern");
    let mut total = 0u64;
    for cap in re.captures_iter(&raw) {
        total += cap[1].parse::<u64>().unwrap_or(0);
    }
    Ok(total)
}

/// Harvest result records for `tests` off the drive into `results_dir` and
/// write one pass/fail record per test. Returns the failed-test count; a test
/// with no harvested record counts as failed.
fn report_results(
    ctx: &ExecCtx,
    drive: &VirtualDrive,
    tests: &[&str],
    results_dir: &Path,
) -> Result<usize> {
    let mut failed = 0usize;
    for name in tests {
        let stem = name.strip_suffix(".efi").unwrap_or(name);
        let junit_name = format!("{stem}_JUNIT.XML");

        let (passed, failures, detail) = match drive.copy_out(ctx, &junit_name, results_dir) {
            Ok(()) => {
                let failures = junit_failures(&results_dir.join(&junit_name))?;
                (failures == 0, failures, None)
            }
            Err(e) => (false, 0, Some(format!("no result record harvested: {e}"))),
        };
        if !passed {
            failed += 1;
        }

        let record = serde_json::json!({
            "test": name,
            "passed": passed,
            "failures": failures,
            "detail": detail,
        });
        util::write_json_pretty(&results_dir.join(format!("{stem}.result.json")), &record)?;
        ctx.log(&format!(
            "{}: {}",
            name,
            if passed { "PASS" } else { "FAIL" }
        ));
    }
    Ok(failed)
}

fn generate_paging_audit(
    ctx: &ExecCtx,
    drive: &VirtualDrive,
    audit_dir: &Path,
    version: &str,
    platform: &str,
) -> Result<()> {
    util::ensure_dir(audit_dir)?;
    if let Err(e) = drive.copy_out(ctx, "*.dat", audit_dir) {
        ctx.log(&format!("paging audit data harvest incomplete: {e}"));
    }
    let report = serde_json::json!({
        "platform": platform,
        "version": version,
        "generated_at": Utc::now().to_rfc3339(),
    });
    util::write_json_pretty(&audit_dir.join("paging-audit-report.json"), &report)?;
    ctx.log(&format!("wrote paging audit report in {}", audit_dir.display()));
    Ok(())
}

// Best-effort: the pipeline still runs from an un-tagged or non-git checkout.
fn detect_version(ctx: &ExecCtx, root: &Path) -> String {
    let mut rev = Command::new("git");
    rev.arg("-C").arg(root).arg("rev-parse").arg("HEAD");
    let Ok(hash) = ctx.run_cmd_capture(rev) else {
        return "Unknown".into();
    };
    if hash.is_empty() {
        return "Unknown".into();
    }
    let mut describe = Command::new("git");
    describe
        .arg("-C")
        .arg(root)
        .arg("describe")
        .arg(&hash)
        .arg("--tags");
    match ctx.run_cmd_capture(describe) {
        Ok(v) if !v.is_empty() => v,
        _ => "Unknown".into(),
    }
}

pub struct RunTask;

impl RunTask {
    pub const ID: &'static str = "emulator.run";

    fn exec(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
        let ws = ctx.workspace_paths_or_init(doc)?;
        let cfg: EmulatorConfig = doc.deserialize_path("emulator")?.unwrap_or_default();
        let platform = core::load_platform(doc)?;
        let flash_cfg: flash::FlashConfig = doc
            .deserialize_path("flash")?
            .ok_or_else(|| Error::config("emulator.run requires a [flash] section"))?;
        let drive_cfg: crate::modules::testdrive::TestDriveConfig =
            doc.deserialize_path("testdrive")?.unwrap_or_default();

        let image = ws.resolve_config_path(&flash_cfg.image)?;
        let secure_image = ws.resolve_config_path(&flash_cfg.secure_image)?;
        let drive = VirtualDrive::new(ws.resolve_config_path(&drive_cfg.drive)?);

        let mut cmd = Command::new(&cfg.binary);
        for arg in &cfg.args {
            cmd.arg(arg);
        }
        cmd.arg("-drive").arg(format!(
            "if=pflash,format=raw,unit=0,file={}",
            secure_image.display()
        ));
        cmd.arg("-drive").arg(format!(
            "if=pflash,format=raw,unit=1,file={}",
            image.display()
        ));
        cmd.arg("-drive")
            .arg(format!("file={},format=raw,media=disk", drive.path().display()));

        ctx.log(&format!("launching {}", cfg.binary));
        ctx.run_cmd(cmd)?;

        if !cfg.run_tests {
            return Ok(());
        }

        let manifest_path = staging_manifest_path(&ws, doc);
        let manifest: StagingManifest = match fs::read_to_string(&manifest_path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                Error::msg(format!("bad staging manifest {}: {e}", manifest_path.display()))
            })?,
            Err(_) => StagingManifest::default(),
        };

        let version = detect_version(ctx, &ws.root);
        let results_dir = match cfg.results_dir.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(raw) => ws.resolve_config_path(raw)?,
            None => ws.out_dir.join("unit_test_results"),
        };
        util::ensure_dir(&results_dir)?;

        if manifest.paging_audit {
            generate_paging_audit(
                ctx,
                &drive,
                &results_dir.join("paging_audit"),
                &version,
                &platform.name,
            )?;
        }

        let now = Utc::now();
        let (non_exempt, exempt) =
            partition_exempt(&manifest.tests, &cfg.exemptions, cfg.grace_secs, now);

        let exempt_failed = report_results(ctx, &drive, &exempt, &results_dir)?;
        if exempt_failed > 0 {
            ctx.log(&format!(
                "{exempt_failed} exempt test(s) failed (ignored while their grace window lasts)"
            ));
        }
        let failed = report_results(ctx, &drive, &non_exempt, &results_dir)?;

        let summary = serde_json::json!({
            "build": util::build_name(doc),
            "platform": platform.name,
            "version": version,
            "evaluated_at": now.to_rfc3339(),
            "tests": manifest.tests.len(),
            "exempt": exempt,
            "non_exempt": non_exempt,
            "failed": failed,
            "exempt_failed": exempt_failed,
        });
        util::write_json_pretty(&results_dir.join("summary.json"), &summary)?;

        if failed > 0 {
            return Err(Error::TestFailure { failed });
        }
        Ok(())
    }
}

pub struct EmulatorModule;

impl Module for EmulatorModule {
    fn id(&self) -> &'static str {
        "emulator"
    }

    fn detect(&self, doc: &ConfigDoc) -> bool {
        doc.has_table_path(self.id())
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        let cfg: EmulatorConfig = doc.deserialize_path("emulator")?.unwrap_or_default();
        if !cfg.enabled {
            return Ok(());
        }
        plan.add(Task {
            id: RunTask::ID.into(),
            label: "Run emulator".into(),
            module: self.id().into(),
            phase: "run".into(),
            after: vec!["image:done".into(), "testdrive:media?".into()],
            provides: vec![],
        })
    }
}

impl ModuleExec for EmulatorModule {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()> {
        reg.add(RunTask::ID, RunTask::exec)
    }
}
