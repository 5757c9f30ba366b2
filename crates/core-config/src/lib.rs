//! Engine option loading and parsing.
//!
//! The engine reads a flat option set once at startup from `vigil.toml`
//! (or an override path supplied by the embedder). Unknown fields are
//! ignored (TOML deserialization tolerance) so option files survive
//! version skew. Every option the consistency core consults lives here:
//! code-origin admission switches, conversion thresholds, flush tuning,
//! module filter lists, and the dispositions for writes aimed at the
//! host's own memory. `Options::apply` sanitizes the raw values (page
//! size must be a power of two, flush tuning must be non-zero) and the
//! sanitized copy is what the engine consumes.

use anyhow::Result;
use serde::Deserialize;
use std::{fs, path::PathBuf};
use tracing::{info, warn};

/// Disposition for an app write aimed at protected tool memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleModify {
    /// No special handling; treat like any other write.
    Off,
    /// Silently skip the write and report success to the app.
    #[default]
    Nop,
    /// Fail the operation back to the app.
    Fail,
    /// Terminate the process.
    Halt,
    /// Let the write through.
    Allow,
}

/// Code-origin admission switches (`[exec]` section).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    /// Allow execution from observed thread stacks.
    #[serde(default)]
    pub stack: bool,
    /// Allow execution from anywhere not otherwise classified.
    #[serde(default)]
    pub heap: bool,
    /// Admit any page mapped executable.
    #[serde(default)]
    pub if_x: bool,
    /// Admit pages mapped read-execute without write.
    #[serde(default = "default_true")]
    pub if_rx: bool,
    /// Admit addresses inside a loaded module's text section.
    #[serde(default = "default_true")]
    pub if_text: bool,
    /// Admit addresses inside any section of a loaded module.
    #[serde(default)]
    pub if_image: bool,
    /// Admit hook-displaced code reached from known code.
    #[serde(default = "default_true")]
    pub if_hook: bool,
    /// Admit regions the app allocated with execute permission.
    #[serde(default)]
    pub if_alloc: bool,
    /// Admit short trampoline patterns (matched bytes only, sandboxed).
    #[serde(default = "default_true")]
    pub if_trampoline: bool,
    /// Admit driver-space addresses.
    #[serde(default)]
    pub if_driver: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            stack: false,
            heap: false,
            if_x: false,
            if_rx: true,
            if_text: true,
            if_image: false,
            if_hook: true,
            if_alloc: false,
            if_trampoline: true,
            if_driver: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Conversion and reporting thresholds (`[thresholds]` section).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Thresholds {
    /// Writes to a read-only-converted page before it is created
    /// sandboxed instead on the next build.
    #[serde(default = "Thresholds::default_ro2sandbox")]
    pub ro2sandbox: u32,
    /// Sandbox self-write trips before a page is converted back to
    /// read-only protection.
    #[serde(default = "Thresholds::default_sandbox2ro")]
    pub sandbox2ro: u32,
    /// Security reports emitted before further reports are suppressed.
    #[serde(default = "Thresholds::default_report_max")]
    pub report_max: u32,
    /// Detect-mode violations tolerated before decisions revert to
    /// terminating.
    #[serde(default = "Thresholds::default_detect_mode_max")]
    pub detect_mode_max: u32,
    #[serde(default = "Thresholds::default_kill_thread_max")]
    pub kill_thread_max: u32,
    #[serde(default = "Thresholds::default_throw_exception_max")]
    pub throw_exception_max: u32,
    #[serde(default = "Thresholds::default_throw_exception_max_per_thread")]
    pub throw_exception_max_per_thread: u32,
    /// Shared flushes between full pending-list resets.
    #[serde(default = "Thresholds::default_reset_every_nth_pending")]
    pub reset_every_nth_pending: u32,
    /// Lazily deleted blocks tolerated before promotion to a pending
    /// entry.
    #[serde(default = "Thresholds::default_lazy_deletion_max_pending")]
    pub lazy_deletion_max_pending: u32,
    /// Initial capacity of a newly constructed area vector.
    #[serde(default = "Thresholds::default_vmarea_initial_size")]
    pub vmarea_initial_size: u32,
    /// Growth increment when an area vector fills.
    #[serde(default = "Thresholds::default_vmarea_increment_size")]
    pub vmarea_increment_size: u32,
}

impl Thresholds {
    const fn default_ro2sandbox() -> u32 {
        10
    }
    const fn default_sandbox2ro() -> u32 {
        20
    }
    const fn default_report_max() -> u32 {
        20
    }
    const fn default_detect_mode_max() -> u32 {
        50
    }
    const fn default_kill_thread_max() -> u32 {
        10
    }
    const fn default_throw_exception_max() -> u32 {
        10
    }
    const fn default_throw_exception_max_per_thread() -> u32 {
        2
    }
    const fn default_reset_every_nth_pending() -> u32 {
        35
    }
    const fn default_lazy_deletion_max_pending() -> u32 {
        64
    }
    const fn default_vmarea_initial_size() -> u32 {
        100
    }
    const fn default_vmarea_increment_size() -> u32 {
        100
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ro2sandbox: Self::default_ro2sandbox(),
            sandbox2ro: Self::default_sandbox2ro(),
            report_max: Self::default_report_max(),
            detect_mode_max: Self::default_detect_mode_max(),
            kill_thread_max: Self::default_kill_thread_max(),
            throw_exception_max: Self::default_throw_exception_max(),
            throw_exception_max_per_thread: Self::default_throw_exception_max_per_thread(),
            reset_every_nth_pending: Self::default_reset_every_nth_pending(),
            lazy_deletion_max_pending: Self::default_lazy_deletion_max_pending(),
            vmarea_initial_size: Self::default_vmarea_initial_size(),
            vmarea_increment_size: Self::default_vmarea_increment_size(),
        }
    }
}

/// Wildcard module filter lists (`[filters]` section). Patterns support
/// `*` and `?` and match case-insensitively against module names.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterLists {
    /// Modules whose text sections are exempt from origin violations.
    #[serde(default)]
    pub exempt_text: Vec<String>,
    /// Modules allowed to execute from heap memory.
    #[serde(default)]
    pub dll2heap: Vec<String>,
    /// Modules allowed to execute from stack memory.
    #[serde(default)]
    pub dll2stack: Vec<String>,
}

/// Write-to-tool-memory dispositions (`[modify]` section).
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ModifyConfig {
    /// App writes into the host tool's own memory.
    #[serde(default)]
    pub own: HandleModify,
    /// App writes into the protected system loader library.
    #[serde(default)]
    pub syslib: HandleModify,
}

/// Raw parsed option file.
#[derive(Debug, Clone, Deserialize)]
pub struct OptionsFile {
    #[serde(default = "OptionsFile::default_page_size")]
    pub page_size: u64,
    /// Report violations and continue instead of terminating.
    #[serde(default)]
    pub detect_mode: bool,
    /// Reflect violations to the app as synthesised exceptions (bounded
    /// by the throw thresholds) instead of terminating outright.
    #[serde(default)]
    pub throw_exception: bool,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub filters: FilterLists,
    #[serde(default)]
    pub modify: ModifyConfig,
}

impl OptionsFile {
    const fn default_page_size() -> u64 {
        4096
    }
}

impl Default for OptionsFile {
    fn default() -> Self {
        Self {
            page_size: Self::default_page_size(),
            detect_mode: false,
            throw_exception: false,
            exec: ExecConfig::default(),
            thresholds: Thresholds::default(),
            filters: FilterLists::default(),
            modify: ModifyConfig::default(),
        }
    }
}

/// Sanitized options as consumed by the engine.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub raw: Option<String>, // original file string (optional)
    pub file: OptionsFile,
}

/// Best-effort option path: working directory `vigil.toml`.
pub fn discover() -> PathBuf {
    PathBuf::from("vigil.toml")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Options> {
    let path = path.unwrap_or_else(discover);
    if let Ok(content) = fs::read_to_string(&path) {
        match toml::from_str::<OptionsFile>(&content) {
            Ok(file) => {
                let mut opts = Options {
                    raw: Some(content),
                    file,
                };
                opts.apply();
                Ok(opts)
            }
            Err(e) => {
                warn!(
                    target: "config",
                    error = %e,
                    path = %path.display(),
                    "option parse failed, using defaults"
                );
                Ok(Options::default())
            }
        }
    } else {
        Ok(Options::default())
    }
}

impl Options {
    /// Sanitize raw values in place. Returns self for chaining.
    pub fn apply(&mut self) -> &mut Self {
        let f = &mut self.file;
        if !f.page_size.is_power_of_two() || f.page_size < 512 {
            warn!(
                target: "config",
                page_size = f.page_size,
                "page_size must be a power of two >= 512, using 4096"
            );
            f.page_size = 4096;
        }
        if f.thresholds.lazy_deletion_max_pending == 0 {
            f.thresholds.lazy_deletion_max_pending = 1;
        }
        if f.thresholds.vmarea_initial_size == 0 {
            f.thresholds.vmarea_initial_size = Thresholds::default_vmarea_initial_size();
        }
        info!(
            target: "config",
            page_size = f.page_size,
            detect_mode = f.detect_mode,
            if_text = f.exec.if_text,
            if_rx = f.exec.if_rx,
            ro2sandbox = f.thresholds.ro2sandbox,
            sandbox2ro = f.thresholds.sandbox2ro,
            "options_applied"
        );
        self
    }

    pub fn page_size(&self) -> u64 {
        self.file.page_size
    }
}
