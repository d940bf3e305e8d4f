use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use vesta_firmware_builder::executor::{ExecCtx, StdoutSink, ToolRunner};
use vesta_firmware_builder::modules::secureworld::transaction::with_patched_tree;
use vesta_firmware_builder::{Error, Result};

const BASE_REV: &str = "deadbeefcafebabe";

fn render(cmd: &Command) -> String {
    let mut s = cmd.get_program().to_string_lossy().into_owned();
    for a in cmd.get_args() {
        s.push(' ');
        s.push_str(&a.to_string_lossy());
    }
    s
}

/// Scripted runner: records every invocation, fails any whose rendered
/// command line contains a configured needle.
#[derive(Default)]
struct ScriptedRunner {
    calls: Mutex<Vec<String>>,
    fail_containing: Vec<(String, i32)>,
}

impl ScriptedRunner {
    fn failing(needle: &str, code: i32) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_containing: vec![(needle.to_string(), code)],
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn check(&self, line: &str) -> Result<()> {
        for (needle, code) in &self.fail_containing {
            if line.contains(needle.as_str()) {
                return Err(Error::tool(format!("scripted failure for '{needle}'"), Some(*code)));
            }
        }
        Ok(())
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(&self, cmd: &mut Command, _log: &mut dyn FnMut(&str)) -> Result<()> {
        let line = render(cmd);
        self.calls.lock().expect("calls lock").push(line.clone());
        self.check(&line)
    }

    fn run_capture(&self, cmd: &mut Command) -> Result<String> {
        let line = render(cmd);
        self.calls.lock().expect("calls lock").push(line.clone());
        self.check(&line)?;
        if line.contains("rev-parse") {
            return Ok(BASE_REV.into());
        }
        Ok(String::new())
    }
}

fn ctx_with(runner: Arc<ScriptedRunner>) -> ExecCtx {
    let mut ctx = ExecCtx::with_runner(false, Arc::new(StdoutSink::default()), runner);
    ctx.set_task("test");
    ctx
}

fn patches() -> Vec<PathBuf> {
    vec![PathBuf::from("patches/0001-fix.patch")]
}

#[test]
fn apply_ok_build_ok_reverts_once() {
    let runner = Arc::new(ScriptedRunner::default());
    let mut ctx = ctx_with(runner.clone());
    let built = Mutex::new(false);

    with_patched_tree(&mut ctx, Path::new("/repo"), &patches(), |_ctx| {
        *built.lock().unwrap() = true;
        Ok(())
    })
    .expect("transaction");

    assert!(*built.lock().unwrap());
    let calls = runner.calls();
    assert_eq!(calls.len(), 3, "{calls:?}");
    assert!(calls[0].contains("rev-parse HEAD"), "{calls:?}");
    assert!(calls[1].contains(" am "), "{calls:?}");
    assert!(
        calls[2].contains(&format!("checkout {BASE_REV}")),
        "{calls:?}"
    );
}

#[test]
fn build_failure_still_reverts_and_is_propagated() {
    let runner = Arc::new(ScriptedRunner::default());
    let mut ctx = ctx_with(runner.clone());

    let err = with_patched_tree(&mut ctx, Path::new("/repo"), &patches(), |_ctx| {
        Err(Error::tool("make all fip failed", Some(7)))
    })
    .unwrap_err();

    assert_eq!(err.exit_code(), 7);
    let calls = runner.calls();
    let reverts = calls.iter().filter(|c| c.contains("checkout")).count();
    assert_eq!(reverts, 1, "{calls:?}");
}

#[test]
fn apply_failure_never_builds_and_never_reverts() {
    let runner = Arc::new(ScriptedRunner::failing(" am ", 128));
    let mut ctx = ctx_with(runner.clone());
    let built = Mutex::new(false);

    let err = with_patched_tree(&mut ctx, Path::new("/repo"), &patches(), |_ctx| {
        *built.lock().unwrap() = true;
        Ok(())
    })
    .unwrap_err();

    assert!(err.to_string().contains("mid-patch"), "{err}");
    assert!(!*built.lock().unwrap());
    let calls = runner.calls();
    assert!(!calls.iter().any(|c| c.contains("checkout")), "{calls:?}");
}

#[test]
fn revert_failure_supersedes_the_build_result() {
    let runner = Arc::new(ScriptedRunner::failing("checkout", 9));
    let mut ctx = ctx_with(runner.clone());

    // Build succeeded, but the tree could not be restored.
    let err = with_patched_tree(&mut ctx, Path::new("/repo"), &patches(), |_ctx| Ok(()))
        .unwrap_err();
    assert!(matches!(err, Error::Revert { .. }), "{err}");

    // A build failure is also superseded by the revert failure.
    let runner = Arc::new(ScriptedRunner::failing("checkout", 9));
    let mut ctx = ctx_with(runner.clone());
    let err = with_patched_tree(&mut ctx, Path::new("/repo"), &patches(), |_ctx| {
        Err(Error::tool("build broke", Some(2)))
    })
    .unwrap_err();
    assert!(matches!(err, Error::Revert { .. }), "{err}");
}

#[test]
fn empty_patch_set_skips_capture_and_revert() {
    let runner = Arc::new(ScriptedRunner::default());
    let mut ctx = ctx_with(runner.clone());

    with_patched_tree(&mut ctx, Path::new("/repo"), &[], |_ctx| Ok(())).expect("transaction");
    assert!(runner.calls().is_empty());
}
