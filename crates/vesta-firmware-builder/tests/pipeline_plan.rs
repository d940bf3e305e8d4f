use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex};

use vesta_firmware_builder::config::ConfigDoc;
use vesta_firmware_builder::executor::{ExecCtx, StdoutSink, ToolRunner};
use vesta_firmware_builder::planner::Plan;
use vesta_firmware_builder::{Error, Result};

fn doc_from(raw: &str) -> ConfigDoc {
    ConfigDoc {
        path: PathBuf::from("<mem>"),
        value: toml::from_str(raw).expect("toml"),
    }
}

fn build_plan(doc: &ConfigDoc) -> Result<Plan> {
    let mut plan = Plan::default();
    for m in vesta_firmware_builder::modules::builtin_modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;
    Ok(plan)
}

fn position(ids: &[String], id: &str) -> usize {
    ids.iter().position(|x| x == id).unwrap_or_else(|| panic!("{id} missing from {ids:?}"))
}

#[test]
fn full_pipeline_orders_build_patch_finalize_run() {
    let raw = r#"
[platform]
toolchain = "gcc"

[secureworld]
monitor_dir = "mon"
firmware_dir = "fw"
monitor_image = "out/monitor.bin"

[flash]
image = "fv/FLASH0.fd"
secure_image = "fv/SECURE_FLASH0.fd"

[[flash.regions]]
name = "bl1"
offset = "0x0"
size = "0x20000"
source = "fw/build/bl1.bin"

[testdrive]
patterns = ""

[emulator]
run_tests = false
"#;
    let doc = doc_from(raw);
    let plan = build_plan(&doc).expect("plan");
    let ids: Vec<String> = plan
        .ordered()
        .expect("ordered")
        .iter()
        .map(|t| t.id.clone())
        .collect();

    assert_eq!(ids[0], "core.init");
    assert!(position(&ids, "secureworld.monitor") < position(&ids, "secureworld.firmware"));
    assert!(position(&ids, "secureworld.layout") < position(&ids, "secureworld.firmware"));
    assert!(position(&ids, "secureworld.firmware") < position(&ids, "flash.patch"));
    assert!(position(&ids, "flash.patch") < position(&ids, "flash.finalize"));
    assert!(position(&ids, "flash.finalize") < position(&ids, "core.barrier.image"));
    assert!(position(&ids, "core.barrier.image") < position(&ids, "emulator.run"));
    assert!(position(&ids, "testdrive.stage") < position(&ids, "emulator.run"));
}

#[test]
fn unsupported_toolchain_fails_at_planning_time() {
    let err = build_plan(&doc_from("[platform]\ntoolchain = \"armclang\"\n"))
        .unwrap_err()
        .to_string();
    assert!(err.contains("unsupported toolchain"), "{err}");
}

/// Fails every `bash` invocation (the trusted-firmware build script) with a
/// fixed exit code; everything else succeeds.
#[derive(Default)]
struct FirmwareFails {
    calls: Mutex<Vec<String>>,
}

fn render(cmd: &Command) -> String {
    let mut s = cmd.get_program().to_string_lossy().into_owned();
    for a in cmd.get_args() {
        s.push(' ');
        s.push_str(&a.to_string_lossy());
    }
    s
}

impl ToolRunner for FirmwareFails {
    fn run(&self, cmd: &mut Command, _log: &mut dyn FnMut(&str)) -> Result<()> {
        let line = render(cmd);
        let program = cmd.get_program().to_string_lossy().into_owned();
        self.calls.lock().expect("calls lock").push(line);
        if program == "bash" {
            return Err(Error::tool("firmware build failed", Some(3)));
        }
        Ok(())
    }

    fn run_capture(&self, cmd: &mut Command) -> Result<String> {
        self.calls.lock().expect("calls lock").push(render(cmd));
        Ok("deadbeefcafebabe".into())
    }
}

#[test]
fn firmware_build_failure_short_circuits_region_patching() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let root = tmp.path();
    fs::create_dir_all(root.join("mon")).unwrap();
    fs::create_dir_all(root.join("fw")).unwrap();
    fs::create_dir_all(root.join("fv")).unwrap();
    let secure_image = root.join("fv/SECURE_FLASH0.fd");
    fs::write(&secure_image, vec![0x5au8; 0x100]).unwrap();
    fs::write(root.join("fv/FLASH0.fd"), vec![0x5au8; 0x80]).unwrap();
    fs::write(root.join("fw/bl1.bin"), vec![0x01u8; 0x10]).unwrap();

    let build_file = root.join("short-circuit.toml");
    fs::write(
        &build_file,
        format!(
            r#"
[workspace]
root_dir = "{}"

[secureworld]
monitor_dir = "mon"
firmware_dir = "fw"
monitor_image = "out/monitor.bin"

[secureworld.partitions.stmm]
image_file = "fv/BL32_AP_MM.fd"
image_offset = "0x2000"
manifest_file = "platform/stmm_config.dts"
manifest_offset = "0x1000"
package = "tl_pkg"
uuid = "eaba83d8-baaf-4eaf-8144-f7fdcbe544a7"
owner = "Plat"
size = "0x300000"

[flash]
image = "fv/FLASH0.fd"
secure_image = "fv/SECURE_FLASH0.fd"
size = "0x200"

[[flash.regions]]
name = "bl1"
offset = "0x0"
size = "0x20"
source = "fw/bl1.bin"
"#,
            root.display()
        ),
    )
    .unwrap();

    let doc = vesta_firmware_builder::config::load(&build_file).expect("load config");
    let plan = build_plan(&doc).expect("plan");
    let reg = vesta_firmware_builder::executor::builtin_registry().expect("registry");
    let runner = Arc::new(FirmwareFails::default());
    let mut ctx = ExecCtx::with_runner(false, Arc::new(StdoutSink::default()), runner.clone());

    let err = vesta_firmware_builder::executor::execute_plan(&doc, &plan, &reg, &mut ctx)
        .unwrap_err();
    assert_eq!(err.exit_code(), 3);

    // The monitor build ran, the firmware script was attempted, and nothing
    // after the failing stage touched the images.
    let calls = runner.calls.lock().unwrap().clone();
    assert!(calls.iter().any(|c| c.starts_with("make PROJECT=")), "{calls:?}");
    assert!(calls.iter().any(|c| c.starts_with("bash ")), "{calls:?}");
    assert_eq!(fs::read(&secure_image).unwrap(), vec![0x5au8; 0x100]);
    assert_eq!(fs::read(root.join("fv/FLASH0.fd")).unwrap().len(), 0x80);
}
