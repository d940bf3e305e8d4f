use serde::Deserialize;

use crate::config::ConfigDoc;
use crate::error::{Error, Result};
use crate::modules::Module;
use crate::planner::{Plan, Task};

const SUPPORTED_ARCHES: &[&str] = &["aarch64"];
const SUPPORTED_TARGETS: &[&str] = &["debug", "release"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolchain {
    Gcc,
    Clang,
}

impl Toolchain {
    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gcc" => Ok(Self::Gcc),
            "clang" => Ok(Self::Clang),
            other => Err(Error::config(format!(
                "unsupported toolchain '{}' (supported: gcc, clang)",
                other
            ))),
        }
    }
}

fn default_platform_name() -> String {
    "qemu_sbsa".into()
}

fn default_arch() -> String {
    "aarch64".into()
}

fn default_target() -> String {
    "debug".into()
}

fn default_toolchain() -> String {
    "gcc".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    #[serde(default = "default_platform_name")]
    pub name: String,
    #[serde(default = "default_arch")]
    pub arch: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_toolchain")]
    pub toolchain: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            name: default_platform_name(),
            arch: default_arch(),
            target: default_target(),
            toolchain: default_toolchain(),
        }
    }
}

impl PlatformConfig {
    pub fn toolchain(&self) -> Result<Toolchain> {
        Toolchain::parse(&self.toolchain)
    }

    pub fn is_debug(&self) -> bool {
        self.target.eq_ignore_ascii_case("debug")
    }

    /// Architecture subdirectory of build outputs (test binaries live under
    /// `<search root>/<ARCH>`).
    pub fn arch_subdir(&self) -> String {
        self.arch.to_ascii_uppercase()
    }
}

/// Load and validate the `[platform]` section. All toolchain/architecture
/// checks happen here, before any subprocess is spawned.
pub fn load_platform(doc: &ConfigDoc) -> Result<PlatformConfig> {
    let cfg: PlatformConfig = doc.deserialize_path("platform")?.unwrap_or_default();
    if !SUPPORTED_ARCHES.contains(&cfg.arch.to_ascii_lowercase().as_str()) {
        return Err(Error::config(format!(
            "unsupported architecture '{}' (supported: {})",
            cfg.arch,
            SUPPORTED_ARCHES.join(", ")
        )));
    }
    if !SUPPORTED_TARGETS.contains(&cfg.target.to_ascii_lowercase().as_str()) {
        return Err(Error::config(format!(
            "unsupported target '{}' (supported: {})",
            cfg.target,
            SUPPORTED_TARGETS.join(", ")
        )));
    }
    cfg.toolchain()?;
    Ok(cfg)
}

pub struct CoreModule;

impl Module for CoreModule {
    fn id(&self) -> &'static str {
        "core"
    }

    fn detect(&self, _doc: &ConfigDoc) -> bool {
        true
    }

    fn plan(&self, doc: &ConfigDoc, plan: &mut Plan) -> Result<()> {
        if let Some(root) = doc.value.as_table() {
            for key in root.keys() {
                if !matches!(
                    key.as_str(),
                    "workspace" | "platform" | "secureworld" | "flash" | "testdrive" | "emulator"
                ) {
                    return Err(Error::config(format!(
                        "config table '{}' is not supported; use workspace, platform, secureworld, flash, testdrive, emulator",
                        key
                    )));
                }
            }
        }

        // Pre-flight: fail the whole plan on a bad platform declaration.
        load_platform(doc)?;

        plan.add(Task {
            id: "core.init".into(),
            label: "Init".into(),
            module: self.id().into(),
            phase: "init".into(),
            after: vec![],
            provides: vec!["core:initialized".into()],
        })
    }
}
