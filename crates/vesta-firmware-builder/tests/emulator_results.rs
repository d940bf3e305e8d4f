use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use chrono::{Duration, Utc};

use vesta_firmware_builder::executor::{ExecCtx, StdoutSink, ToolRunner};
use vesta_firmware_builder::planner::Plan;
use vesta_firmware_builder::{Error, Result};

/// Emulates the run half of the pipeline: the emulator "runs" successfully,
/// and harvesting a test's result record materializes a JUnit file with the
/// scripted failure count.
struct EmulatedTarget {
    junit_failures: HashMap<String, u64>,
}

impl ToolRunner for EmulatedTarget {
    fn run(&self, cmd: &mut Command, _log: &mut dyn FnMut(&str)) -> Result<()> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        if program != "mcopy" {
            return Ok(());
        }
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let Some(name) = args
            .iter()
            .find_map(|a| a.strip_prefix("::/"))
            .map(String::from)
        else {
            return Ok(());
        };
        let Some(stem) = name.strip_suffix("_JUNIT.XML") else {
            return Ok(());
        };
        let Some(&failures) = self.junit_failures.get(stem) else {
            return Err(Error::tool(format!("mcopy: ::/{name} not found"), Some(1)));
        };
        let dest = PathBuf::from(args.last().expect("dest dir"));
        fs::create_dir_all(&dest).unwrap();
        fs::write(
            dest.join(&name),
            format!(r#"<testsuite failures="{failures}" tests="3"></testsuite>"#),
        )
        .unwrap();
        Ok(())
    }

    fn run_capture(&self, cmd: &mut Command) -> Result<String> {
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        if args.iter().any(|a| a == "rev-parse") {
            return Ok("0123456789abcdef".into());
        }
        Ok("v2.1.0".into())
    }
}

fn run_pipeline(root: &Path, junit_failures: &[(&str, u64)], exempt_a: bool) -> Result<()> {
    fs::create_dir_all(root.join("fv")).unwrap();
    fs::create_dir_all(root.join("tests-bin/AARCH64")).unwrap();
    fs::write(root.join("fv/FLASH0.fd"), vec![0u8; 0x40]).unwrap();
    fs::write(root.join("fv/SECURE_FLASH0.fd"), vec![0u8; 0x40]).unwrap();
    fs::write(root.join("tests-bin/AARCH64/A.efi"), b"efi").unwrap();
    fs::write(root.join("tests-bin/AARCH64/B.efi"), b"efi").unwrap();

    // A registered 10 days ago against a 90-day window.
    let exemption = if exempt_a {
        format!(
            "[emulator.exemptions]\n\"A.efi\" = \"{}\"\n",
            (Utc::now() - Duration::days(10)).to_rfc3339()
        )
    } else {
        String::new()
    };
    let build_file = root.join("emurun.toml");
    fs::write(
        &build_file,
        format!(
            r#"
[workspace]
root_dir = "{}"

[flash]
image = "fv/FLASH0.fd"
secure_image = "fv/SECURE_FLASH0.fd"
size = "0x40"

[testdrive]
search_root = "tests-bin"
patterns = "*.efi"

[emulator]
run_tests = true
shutdown_after_run = true
{exemption}
"#,
            root.display()
        ),
    )
    .unwrap();

    let doc = vesta_firmware_builder::config::load(&build_file)?;
    let mut plan = Plan::default();
    for m in vesta_firmware_builder::modules::builtin_modules() {
        if m.detect(&doc) {
            m.plan(&doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;

    let reg = vesta_firmware_builder::executor::builtin_registry()?;
    let runner = Arc::new(EmulatedTarget {
        junit_failures: junit_failures
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect(),
    });
    let mut ctx = ExecCtx::with_runner(false, Arc::new(StdoutSink::default()), runner);
    vesta_firmware_builder::executor::execute_plan(&doc, &plan, &reg, &mut ctx)
}

#[test]
fn exempt_failure_does_not_fail_the_run() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();

    run_pipeline(root, &[("A", 1), ("B", 0)], true).expect("run succeeds");

    let results = root.join("out/unit_test_results");
    let a: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(results.join("A.result.json")).unwrap()).unwrap();
    let b: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(results.join("B.result.json")).unwrap()).unwrap();
    // Exempt results stay visible in the sink even though they cannot fail
    // the run.
    assert_eq!(a["passed"], serde_json::json!(false));
    assert_eq!(b["passed"], serde_json::json!(true));

    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(results.join("summary.json")).unwrap()).unwrap();
    assert_eq!(summary["failed"], serde_json::json!(0));
    assert_eq!(summary["exempt_failed"], serde_json::json!(1));
    assert_eq!(summary["exempt"], serde_json::json!(["A.efi"]));
    assert_eq!(summary["non_exempt"], serde_json::json!(["B.efi"]));
    assert_eq!(summary["version"], serde_json::json!("v2.1.0"));
}

#[test]
fn non_exempt_failure_fails_the_run() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let err = run_pipeline(tmp.path(), &[("A", 1), ("B", 1)], true).unwrap_err();
    assert!(matches!(err, Error::TestFailure { failed: 1 }), "{err}");
}

#[test]
fn expired_exemption_fails_the_run_like_any_other_test() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let err = run_pipeline(tmp.path(), &[("A", 1), ("B", 0)], false).unwrap_err();
    assert!(matches!(err, Error::TestFailure { failed: 1 }), "{err}");
}
