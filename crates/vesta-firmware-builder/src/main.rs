use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use vesta_firmware_builder::Result;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a build definition and print the computed task plan
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Load a build definition, compute the plan, and execute it
    Run {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print what would run without executing task bodies
        #[arg(long)]
        dry_run: bool,
    },
    /// Load a build definition and print the fully-resolved TOML
    Resolve {
        /// Path to a build definition TOML
        build: PathBuf,
    },
    /// Clean the external secure-world source trees
    Clean {
        /// Path to a build definition TOML
        build: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let res = match args.cmd {
        Command::Plan { build, dot } => cmd_plan(&build, dot),
        Command::Run { build, dry_run } => cmd_run(&build, dry_run),
        Command::Resolve { build } => cmd_resolve(&build),
        Command::Clean { build } => cmd_clean(&build),
    };
    if let Err(e) = res {
        tracing::error!("{e}");
        std::process::exit(e.exit_code());
    }
}

fn build_plan(doc: &vesta_firmware_builder::config::ConfigDoc) -> Result<vesta_firmware_builder::planner::Plan> {
    let mut plan = vesta_firmware_builder::planner::Plan::default();
    for m in vesta_firmware_builder::modules::builtin_modules() {
        if m.detect(doc) {
            m.plan(doc, &mut plan)?;
        }
    }
    plan.finalize_default()?;
    Ok(plan)
}

fn cmd_plan(path: &PathBuf, dot: bool) -> Result<()> {
    let doc = vesta_firmware_builder::config::load(path.as_path())?;
    let plan = build_plan(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    for (i, task) in plan.ordered()?.iter().enumerate() {
        println!(
            "{:>2}. {:<22}  {:<12} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &PathBuf) -> Result<()> {
    let doc = vesta_firmware_builder::config::load(path.as_path())?;
    let s = toml::to_string_pretty(&doc.value).unwrap_or_else(|_| format!("{:?}", doc.value));
    print!("{s}");
    Ok(())
}

fn cmd_run(path: &PathBuf, dry_run: bool) -> Result<()> {
    let doc = vesta_firmware_builder::config::load(path.as_path())?;
    let plan = build_plan(&doc)?;

    let reg = vesta_firmware_builder::executor::builtin_registry()?;
    let sink = Arc::new(vesta_firmware_builder::executor::StdoutSink::default());
    let mut ctx = vesta_firmware_builder::executor::ExecCtx::new(dry_run, sink);
    vesta_firmware_builder::executor::execute_plan(&doc, &plan, &reg, &mut ctx)
}

fn cmd_clean(path: &PathBuf) -> Result<()> {
    let doc = vesta_firmware_builder::config::load(path.as_path())?;
    let sink = Arc::new(vesta_firmware_builder::executor::StdoutSink::default());
    let mut ctx = vesta_firmware_builder::executor::ExecCtx::new(false, sink);
    ctx.set_task("clean");
    vesta_firmware_builder::modules::secureworld::clean_trees(&doc, &mut ctx)
}
