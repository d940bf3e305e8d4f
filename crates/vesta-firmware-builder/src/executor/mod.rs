use std::collections::BTreeMap;
use std::io::{BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_log_line;
use crate::planner::Plan;
use crate::workspace::{WorkspaceConfig, WorkspacePaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    PipelineDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_ok: usize,
    tasks_failed: usize,
    log_lines: usize,
    failed_tasks: Vec<String>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    if s.started_at.is_none() {
                        s.started_at = Some(Instant::now());
                    }
                }
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                if let Ok(mut s) = self.state.lock() {
                    s.log_lines = s.log_lines.saturating_add(1);
                }
                println!("[{id}] {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok += 1;
                    } else {
                        s.tasks_failed += 1;
                        s.failed_tasks.push(id.clone());
                    }
                }
                if ok {
                    println!("DONE: {id} ({elapsed_ms}ms)");
                } else {
                    println!("FAIL: {id} ({elapsed_ms}ms) {}", error.unwrap_or_default());
                }
            }
            ExecEvent::PipelineDone { ok, error } => {
                let mut summary = String::from("SUMMARY:\n");
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    summary.push_str(&format!(
                        "  status: {}\n",
                        if ok { "ok" } else { "failed" }
                    ));
                    summary.push_str(&format!(
                        "  tasks: ok={} failed={}\n",
                        s.tasks_ok, s.tasks_failed
                    ));
                    summary.push_str(&format!("  logs: {}\n", s.log_lines));
                    summary.push_str(&format!("  elapsed_secs: {}\n", wall.as_secs()));
                    if !s.failed_tasks.is_empty() {
                        summary
                            .push_str(&format!("  failed_tasks: {}\n", s.failed_tasks.join(", ")));
                    }
                    *s = StdoutSinkState::default();
                }
                print!("{summary}");
                if let Some(e) = error {
                    println!("  error: {e}");
                }
            }
        }
    }
}

/// Injected capability for running external tools. The pipeline never spawns
/// a subprocess directly; tests substitute scripted fakes.
pub trait ToolRunner: Send + Sync {
    /// Run to completion, streaming output lines through `log`.
    fn run(&self, cmd: &mut Command, log: &mut dyn FnMut(&str)) -> Result<()>;

    /// Run to completion and capture trimmed stdout.
    fn run_capture(&self, cmd: &mut Command) -> Result<String>;
}

/// Real runner: spawns the child in its own process group with line-buffered,
/// sanitized output streaming.
#[derive(Default)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&self, cmd: &mut Command, log: &mut dyn FnMut(&str)) -> Result<()> {
        let what = describe_command(cmd);

        // Own process group; with stdin attached to the controlling TTY a
        // child read would trigger SIGTTIN and suspend the stage.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setpgid(0, 0) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::tool(format!("failed to spawn {what}: {e}"), None))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = stdout {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(out, tx));
        }
        if let Some(err) = stderr {
            let tx = tx.clone();
            std::thread::spawn(move || read_output_stream(err, tx));
        }
        drop(tx);

        for line in rx {
            let line = sanitize_log_line(&line);
            if !line.is_empty() {
                log(&line);
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::tool(format!("failed to wait for {what}: {e}"), None))?;
        if !status.success() {
            return Err(Error::tool(format!("{what} failed"), status.code()));
        }
        Ok(())
    }

    fn run_capture(&self, cmd: &mut Command) -> Result<String> {
        let what = describe_command(cmd);
        let out = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::tool(format!("failed to spawn {what}: {e}"), None))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::tool(
                format!("{what} failed: {}", stderr.trim()),
                out.status.code(),
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

pub fn describe_command(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args().take(2) {
        out.push(' ');
        out.push_str(&arg.to_string_lossy());
    }
    out
}

fn read_output_stream<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        for b in &buf[..n] {
            if *b == b'\n' || *b == b'\r' {
                if pending.is_empty() {
                    continue;
                }
                let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                pending.clear();
            } else {
                pending.push(*b);
                if pending.len() >= MAX_PENDING_BYTES {
                    let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
                    pending.clear();
                }
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
    }
}

pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub runner: Arc<dyn ToolRunner>,
    pub current_task_id: Option<String>,
    workspace_paths: Option<WorkspacePaths>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self::with_runner(dry_run, sink, Arc::new(ProcessRunner))
    }

    pub fn with_runner(dry_run: bool, sink: Arc<dyn ExecSink>, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            dry_run,
            sink,
            runner,
            current_task_id: None,
            workspace_paths: None,
        }
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    pub fn workspace_paths_or_init(&mut self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = &self.workspace_paths {
            return Ok(p.clone());
        }
        let ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        let paths = crate::workspace::init_dirs(&ws)?;
        self.workspace_paths = Some(paths.clone());
        Ok(paths)
    }

    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {:?}", cmd));
            return Ok(());
        }
        self.runner.run(&mut cmd, &mut |line| self.log(line))
    }

    pub fn run_cmd_capture(&self, mut cmd: Command) -> Result<String> {
        if self.dry_run {
            self.log(&format!("DRY-RUN (capture): {:?}", cmd));
            return Ok(String::new());
        }
        self.runner.run_capture(&mut cmd)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Run the plan strictly sequentially; the first failing task aborts the
/// pipeline and its error is returned unchanged.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());

        if ctx.dry_run {
            ctx.log(&format!("DRY-RUN: {} ({}/{})", task.id, task.module, task.phase));
            ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms: 0,
            });
            continue;
        }

        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                ctx.sink.emit(ExecEvent::PipelineDone {
                    ok: false,
                    error: Some(format!("task '{}' failed: {e}", task.id)),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::PipelineDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add("core.init", core_init)?;
    reg.add("core.barrier.image", core_barrier_image)?;
    crate::modules::secureworld::SecureWorldModule::register_tasks(&mut reg)?;
    crate::modules::flash::FlashModule::register_tasks(&mut reg)?;
    crate::modules::testdrive::TestDriveModule::register_tasks(&mut reg)?;
    crate::modules::emulator::EmulatorModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn core_init(doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    let paths = ctx.workspace_paths_or_init(doc)?;
    ctx.log(&format!("workspace.root = {}", paths.root.display()));
    ctx.log(&format!("workspace.build_dir = {}", paths.build_dir.display()));
    ctx.log(&format!("workspace.out_dir = {}", paths.out_dir.display()));
    for (name, path) in &paths.named_dirs {
        if name != "root" && name != "build" && name != "out" {
            ctx.log(&format!("workspace.paths.{} = {}", name, path.display()));
        }
    }
    Ok(())
}

fn core_barrier_image(_doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()> {
    // Pure ordering barrier; all work is done by dependencies.
    ctx.log("image barrier reached");
    Ok(())
}
