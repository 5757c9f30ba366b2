//! Code-origin policy gate.
//!
//! Before a brand-new source region is admitted to the executable catalog,
//! the gate decides whether the app may execute from it at all. Decisions
//! run through an ordered rule list: remembered future-executable entries
//! first, then the configured admission switches, then per-module
//! exemption lists and the trampoline pattern matcher, and finally the
//! stack/heap policies whose denial raises a violation. Violations carry a
//! synthesised threat identifier and an action for the translator to
//! enforce.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use core_config::Options;
use core_interval::{
    AppAddr, FragFlags, IntervalVector, PageProt, SharedVector, VectorPolicy, VmFlags,
};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod filters;
pub mod pattern;

pub use filters::{CompiledFilters, FilterList};
pub use pattern::{InstrSniffer, SniffedInstr, SniffedKind, TemplateMatch, match_trampoline};

/// Kinds of code-origin and control-transfer violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    StackExec,
    HeapExec,
    ReturnTarget,
    IndirectCallRct,
    IndirectJumpRct,
    AttackSimulation,
    AslrTarget,
    ProcessControl,
    GbopSource,
    HotPatchDetector,
    HotPatchProtector,
    ApcThreadShellcode,
}

impl ViolationKind {
    /// Suffix letter folded into the threat identifier.
    fn letter(self) -> char {
        match self {
            ViolationKind::StackExec => 'S',
            ViolationKind::HeapExec => 'H',
            ViolationKind::ReturnTarget => 'R',
            ViolationKind::IndirectCallRct => 'C',
            ViolationKind::IndirectJumpRct => 'J',
            ViolationKind::AttackSimulation => 'X',
            ViolationKind::AslrTarget => 'A',
            ViolationKind::ProcessControl => 'P',
            ViolationKind::GbopSource => 'G',
            ViolationKind::HotPatchDetector => 'D',
            ViolationKind::HotPatchProtector => 'T',
            ViolationKind::ApcThreadShellcode => 'K',
        }
    }
}

/// What the translator should do about a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Detect mode: log and keep going.
    Continue,
    TerminateThread,
    TerminateProcess,
    /// Reflect a synthesised exception to the app.
    ForgeException,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} violation [{threat_id}]")]
pub struct Violation {
    pub kind: ViolationKind,
    /// 11-character identifier derived from the source PC and the first
    /// four bytes at the target; stable across runs for filter matching.
    pub threat_id: String,
    pub action: Action,
}

/// A granted admission: the bounds and flags to catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub start: AppAddr,
    pub end: AppAddr,
    pub vm_flags: VmFlags,
    pub frag_flags: FragFlags,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginDecision {
    Admit(Admitted),
    Deny(Violation),
}

/// Inputs describing the execution attempt under judgment.
#[derive(Debug, Clone, Copy)]
pub struct OriginRequest<'a> {
    /// The address about to be executed.
    pub target: AppAddr,
    /// Source of the app's last exit branch.
    pub source_pc: AppAddr,
    /// Containing OS region bounds.
    pub region_start: AppAddr,
    pub region_end: AppAddr,
    pub prot: PageProt,
    /// Bytes starting at `target`, as many as the caller could read.
    pub target_bytes: &'a [u8],
    /// The attempting thread, when known; bounds the per-thread
    /// forge-exception budget.
    pub thread: Option<u32>,
}

/// Read-only environment queries the gate needs; implemented by the
/// engine over its module and thread collaborators.
pub trait OriginQuery {
    fn module_name(&self, addr: AppAddr) -> Option<String>;
    fn in_module_text(&self, addr: AppAddr) -> bool;
    fn in_module(&self, addr: AppAddr) -> bool;
    fn is_vsyscall(&self, addr: AppAddr) -> bool;
    fn on_thread_stack(&self, addr: AppAddr) -> bool;
    fn is_driver_address(&self, _addr: AppAddr) -> bool {
        false
    }
}

// Fixed seeds keep threat identifiers stable across runs.
const THREAT_SEEDS: (u64, u64, u64, u64) = (
    0x7669_6769_6c00_0001,
    0x646f_7269_6f00_0002,
    0x7468_7265_6174_0003,
    0x6964_5f73_6565_0004,
);

const THREAT_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Synthesize the 11-character threat identifier.
pub fn threat_id(kind: ViolationKind, source_pc: AppAddr, target_bytes: &[u8]) -> String {
    use std::hash::{BuildHasher, Hash, Hasher};
    let state = ahash::RandomState::with_seeds(
        THREAT_SEEDS.0,
        THREAT_SEEDS.1,
        THREAT_SEEDS.2,
        THREAT_SEEDS.3,
    );
    let mut h = state.build_hasher();
    source_pc.hash(&mut h);
    let prefix = target_bytes.get(..4).unwrap_or(target_bytes);
    prefix.hash(&mut h);
    let mut v = h.finish();
    let mut id = String::with_capacity(11);
    for _ in 0..10 {
        id.push(THREAT_ALPHABET[(v & 31) as usize] as char);
        v >>= 5;
    }
    id.push(kind.letter());
    id
}

/// The policy gate. One per engine.
pub struct PolicyGate {
    options: Arc<Options>,
    filters: CompiledFilters,
    sniffer: Arc<dyn InstrSniffer>,
    /// Regions pre-approved for admission on first actual execution.
    future: SharedVector<()>,
    /// Ranges already reported in detect mode; re-execution is silent.
    exemptions: SharedVector<()>,
    detect_used: AtomicU32,
    reports: AtomicU32,
    threads_killed: AtomicU32,
    thrown: AtomicU32,
    thrown_per_thread: std::sync::Mutex<std::collections::HashMap<u32, u32>>,
}

impl PolicyGate {
    pub fn new(options: Arc<Options>, sniffer: Arc<dyn InstrSniffer>) -> Self {
        let filters = CompiledFilters::compile(&options.file.filters);
        Self {
            options,
            filters,
            sniffer,
            future: SharedVector::new(IntervalVector::new(
                VectorPolicy::SHARED,
                "futureexec",
            )),
            exemptions: SharedVector::new(IntervalVector::new(
                VectorPolicy::SHARED,
                "exemptions",
            )),
            detect_used: AtomicU32::new(0),
            reports: AtomicU32::new(0),
            threads_killed: AtomicU32::new(0),
            thrown: AtomicU32::new(0),
            thrown_per_thread: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Re-run the trampoline matcher over a previously pattern-admitted
    /// range. A stale match means the bytes changed and the range must be
    /// re-judged from scratch.
    pub fn reverify_pattern(
        &self,
        bytes: &[u8],
        addr: AppAddr,
        known_code: &dyn Fn(AppAddr) -> bool,
    ) -> bool {
        match_trampoline(
            self.sniffer.as_ref(),
            bytes,
            addr,
            self.options.file.exec.if_hook,
            known_code,
        )
        .is_some()
    }

    /// Remember a region for admission on its first actual execution.
    /// Added by the protection-change handler when a page goes
    /// writable+executable; not yet catalogued, to avoid permanent
    /// admittance.
    pub fn add_future_region(&self, start: AppAddr, end: AppAddr, once_only: bool) {
        let vm = if once_only {
            VmFlags::ONCE_ONLY
        } else {
            VmFlags::empty()
        };
        if let Err(e) = self.future.add(start, end, vm, FragFlags::empty(), ()) {
            warn!(target: "policy", error = %e, "future region rejected");
            return;
        }
        debug!(
            target: "policy",
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            once_only,
            "future region added"
        );
    }

    pub fn remove_future_region(&self, start: AppAddr, end: AppAddr) {
        let _ = self.future.remove(start, end);
    }

    pub fn future_covers(&self, addr: AppAddr) -> bool {
        self.future.read().lookup(addr).is_some()
    }

    /// Count of detect-mode slots consumed so far.
    pub fn detect_mode_used(&self) -> u32 {
        self.detect_used.load(Ordering::Relaxed)
    }

    /// Run the ordered decision rules for a new source region.
    pub fn check_origin(
        &self,
        req: &OriginRequest<'_>,
        query: &dyn OriginQuery,
        known_code: &dyn Fn(AppAddr) -> bool,
    ) -> OriginDecision {
        self.origin_decision(req, query, known_code, false)
    }

    /// Rule evaluation without side effects: no report, no detect-mode
    /// slot, no once-only consumption. Used when a protection change asks
    /// "would this region be admitted?" rather than an actual execution.
    pub fn check_origin_probe(
        &self,
        req: &OriginRequest<'_>,
        query: &dyn OriginQuery,
        known_code: &dyn Fn(AppAddr) -> bool,
    ) -> OriginDecision {
        self.origin_decision(req, query, known_code, true)
    }

    fn origin_decision(
        &self,
        req: &OriginRequest<'_>,
        query: &dyn OriginQuery,
        known_code: &dyn Fn(AppAddr) -> bool,
        probe: bool,
    ) -> OriginDecision {
        let exec = &self.options.file.exec;
        let writable = if req.prot.is_writable() {
            VmFlags::WRITABLE
        } else {
            VmFlags::empty()
        };

        // 1. Explicit future-executable entry.
        {
            let guard = self.future.read();
            if let Some(area) = guard.lookup(req.target) {
                let (start, end) = (area.start, area.end);
                let once = area.vm_flags.contains(VmFlags::ONCE_ONLY);
                drop(guard);
                if once && !probe {
                    let _ = self.future.remove(start, end);
                }
                return self.admit(
                    start.max(req.region_start),
                    end.min(req.region_end),
                    writable | VmFlags::MOVED_FROM_FUTURE,
                    FragFlags::DYNGEN,
                    "future",
                );
            }
        }

        // 2. The vsyscall page is always legitimate.
        if query.is_vsyscall(req.target) {
            return self.admit(
                req.region_start,
                req.region_end,
                writable,
                FragFlags::empty(),
                "vsyscall",
            );
        }

        // 3. Text sections of loaded modules.
        if exec.if_text && query.in_module_text(req.target) {
            return self.admit(
                req.region_start,
                req.region_end,
                writable,
                FragFlags::empty(),
                "if_text",
            );
        }

        // 4. Protection-based admission.
        if (exec.if_x && req.prot.is_executable()) || (exec.if_rx && req.prot.is_rx()) {
            return self.admit(
                req.region_start,
                req.region_end,
                writable,
                FragFlags::empty(),
                "if_prot",
            );
        }

        // 5. Anywhere inside a loaded module.
        if exec.if_image && query.in_module(req.target) {
            return self.admit(
                req.region_start,
                req.region_end,
                writable,
                FragFlags::empty(),
                "if_image",
            );
        }

        if query.is_driver_address(req.target) && exec.if_driver {
            return self.admit(
                req.region_start,
                req.region_end,
                writable | VmFlags::DRIVER_ADDRESS,
                FragFlags::empty(),
                "if_driver",
            );
        }

        // 6. Exemptions: prior detect-mode continuations and per-module
        // relaxation lists.
        if self.exemptions.read().lookup(req.target).is_some() {
            return self.admit(
                req.region_start,
                req.region_end,
                writable,
                FragFlags::empty(),
                "exempted",
            );
        }
        let on_stack = query.on_thread_stack(req.target);
        if let Some(name) = query.module_name(req.target)
            && self.filters.exempt_text.matches(&name)
            && query.in_module_text(req.target)
        {
            return self.admit(
                req.region_start,
                req.region_end,
                writable,
                FragFlags::empty(),
                "exempt_text",
            );
        }
        if let Some(src) = query.module_name(req.source_pc) {
            let list = if on_stack {
                &self.filters.dll2stack
            } else {
                &self.filters.dll2heap
            };
            if list.matches(&src) {
                return self.admit(
                    req.region_start,
                    req.region_end,
                    writable,
                    FragFlags::empty(),
                    if on_stack { "dll2stack" } else { "dll2heap" },
                );
            }
        }

        // 7. Trampoline templates: admit only the matched bytes, sandboxed.
        if exec.if_trampoline
            && let Some(m) = match_trampoline(
                self.sniffer.as_ref(),
                req.target_bytes,
                req.target,
                exec.if_hook,
                known_code,
            )
        {
            return self.admit(
                req.target,
                req.target + m.len,
                writable | VmFlags::PATTERN_REVERIFY,
                FragFlags::SELFMOD_SANDBOXED,
                m.template,
            );
        }

        // 8/9. Stack and heap policies; denial is a violation.
        if on_stack {
            if exec.stack {
                return self.admit(
                    req.region_start,
                    req.region_end,
                    writable,
                    FragFlags::DYNGEN,
                    "executable_stack",
                );
            }
            return OriginDecision::Deny(self.deny(ViolationKind::StackExec, req, probe));
        }
        if exec.heap {
            return self.admit(
                req.region_start,
                req.region_end,
                writable,
                FragFlags::DYNGEN,
                "executable_heap",
            );
        }
        OriginDecision::Deny(self.deny(ViolationKind::HeapExec, req, probe))
    }

    fn deny(&self, kind: ViolationKind, req: &OriginRequest<'_>, probe: bool) -> Violation {
        if probe {
            return Violation {
                kind,
                threat_id: threat_id(kind, req.source_pc, req.target_bytes),
                action: Action::Continue,
            };
        }
        self.raise(kind, req)
    }

    fn admit(
        &self,
        start: AppAddr,
        end: AppAddr,
        vm_flags: VmFlags,
        frag_flags: FragFlags,
        reason: &'static str,
    ) -> OriginDecision {
        debug!(
            target: "policy",
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            reason,
            "region admitted"
        );
        OriginDecision::Admit(Admitted {
            start,
            end,
            vm_flags,
            frag_flags,
            reason,
        })
    }

    /// One forge-exception slot, honouring the global and per-thread
    /// throw thresholds.
    fn try_throw(&self, thread: Option<u32>) -> bool {
        let t = &self.options.file.thresholds;
        if self.thrown.fetch_add(1, Ordering::Relaxed) >= t.throw_exception_max {
            return false;
        }
        if let Some(id) = thread {
            let mut per = self
                .thrown_per_thread
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let count = per.entry(id).or_insert(0);
            if *count >= t.throw_exception_max_per_thread {
                return false;
            }
            *count += 1;
        }
        true
    }

    /// Raise a violation for the current request, deciding the action
    /// from the detect-mode budget and kill thresholds.
    pub fn raise_with(
        &self,
        kind: ViolationKind,
        source_pc: AppAddr,
        target_bytes: &[u8],
        exempt_range: Option<(AppAddr, AppAddr)>,
        thread: Option<u32>,
    ) -> Violation {
        let id = threat_id(kind, source_pc, target_bytes);
        let t = &self.options.file.thresholds;
        let reported = self.reports.fetch_add(1, Ordering::Relaxed);
        if reported < t.report_max {
            warn!(
                target: "policy",
                ?kind,
                threat_id = id.as_str(),
                source_pc = format_args!("{source_pc:#x}"),
                "security violation"
            );
        }
        let action = if self.options.file.detect_mode {
            let used = self.detect_used.fetch_add(1, Ordering::Relaxed);
            if used < t.detect_mode_max {
                // Record the range so re-execution does not consume
                // another detect-mode slot.
                if let Some((s, e)) = exempt_range {
                    let _ =
                        self.exemptions
                            .add(s, e, VmFlags::empty(), FragFlags::empty(), ());
                }
                Action::Continue
            } else {
                Action::TerminateProcess
            }
        } else if self.options.file.throw_exception && self.try_throw(thread) {
            Action::ForgeException
        } else {
            let killed = self.threads_killed.fetch_add(1, Ordering::Relaxed);
            if killed < t.kill_thread_max {
                Action::TerminateThread
            } else {
                Action::TerminateProcess
            }
        };
        info!(
            target: "policy",
            ?kind,
            threat_id = id.as_str(),
            ?action,
            "violation action"
        );
        Violation {
            kind,
            threat_id: id,
            action,
        }
    }

    fn raise(&self, kind: ViolationKind, req: &OriginRequest<'_>) -> Violation {
        self.raise_with(
            kind,
            req.source_pc,
            req.target_bytes,
            Some((req.region_start, req.region_end)),
            req.thread,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pattern::SniffedInstr;

    struct NullSniffer;
    impl InstrSniffer for NullSniffer {
        fn sniff(&self, _bytes: &[u8], _pc: AppAddr) -> Option<SniffedInstr> {
            None
        }
    }

    #[derive(Default)]
    struct Env {
        text: Vec<(AppAddr, AppAddr, &'static str)>,
        stacks: Vec<(AppAddr, AppAddr)>,
    }

    impl OriginQuery for Env {
        fn module_name(&self, addr: AppAddr) -> Option<String> {
            self.text
                .iter()
                .find(|(s, e, _)| *s <= addr && addr < *e)
                .map(|(_, _, n)| n.to_string())
        }
        fn in_module_text(&self, addr: AppAddr) -> bool {
            self.text.iter().any(|(s, e, _)| *s <= addr && addr < *e)
        }
        fn in_module(&self, addr: AppAddr) -> bool {
            self.in_module_text(addr)
        }
        fn is_vsyscall(&self, _addr: AppAddr) -> bool {
            false
        }
        fn on_thread_stack(&self, addr: AppAddr) -> bool {
            self.stacks.iter().any(|(s, e)| *s <= addr && addr < *e)
        }
    }

    fn gate_with(toml: &str) -> PolicyGate {
        let file: core_config::OptionsFile = toml::from_str(toml).unwrap();
        let mut opts = core_config::Options {
            raw: None,
            file,
        };
        opts.apply();
        PolicyGate::new(Arc::new(opts), Arc::new(NullSniffer))
    }

    fn heap_req(target: AppAddr) -> OriginRequest<'static> {
        OriginRequest {
            target,
            source_pc: 0x400000,
            region_start: target & !0xfff,
            region_end: (target & !0xfff) + 0x1000,
            prot: PageProt::READ | PageProt::WRITE,
            target_bytes: &[0xcc, 0xcc, 0xcc, 0xcc],
            thread: Some(1),
        }
    }

    #[test]
    fn rx_pages_admitted_when_configured() {
        let gate = gate_with("");
        let env = Env::default();
        let req = OriginRequest {
            prot: PageProt::READ | PageProt::EXEC,
            ..heap_req(0x7000)
        };
        match gate.check_origin(&req, &env, &|_| false) {
            OriginDecision::Admit(a) => assert_eq!(a.reason, "if_prot"),
            other => panic!("expected admit, got {other:?}"),
        }
    }

    #[test]
    fn module_text_admitted_before_prot() {
        let gate = gate_with("");
        let env = Env {
            text: vec![(0x7000, 0x8000, "app.dll")],
            ..Default::default()
        };
        let req = OriginRequest {
            prot: PageProt::READ | PageProt::EXEC,
            ..heap_req(0x7800)
        };
        match gate.check_origin(&req, &env, &|_| false) {
            OriginDecision::Admit(a) => assert_eq!(a.reason, "if_text"),
            other => panic!("expected admit, got {other:?}"),
        }
    }

    #[test]
    fn heap_exec_denied_by_default() {
        let gate = gate_with("");
        let env = Env::default();
        match gate.check_origin(&heap_req(0x9000), &env, &|_| false) {
            OriginDecision::Deny(v) => {
                assert_eq!(v.kind, ViolationKind::HeapExec);
                assert_eq!(v.action, Action::TerminateThread);
                assert_eq!(v.threat_id.len(), 11);
                assert!(v.threat_id.ends_with('H'));
            }
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn stack_exec_denied_and_distinct() {
        let gate = gate_with("");
        let env = Env {
            stacks: vec![(0x9000, 0xa000)],
            ..Default::default()
        };
        match gate.check_origin(&heap_req(0x9800), &env, &|_| false) {
            OriginDecision::Deny(v) => assert_eq!(v.kind, ViolationKind::StackExec),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    /// Detect mode honours its budget and records exemptions.
    #[test]
    fn detect_mode_budget_and_exemption() {
        let gate = gate_with("detect_mode = true\n[thresholds]\ndetect_mode_max = 2\n");
        let env = Env::default();

        // Three distinct heap pages: continue, continue, terminate.
        match gate.check_origin(&heap_req(0x10000), &env, &|_| false) {
            OriginDecision::Deny(v) => assert_eq!(v.action, Action::Continue),
            other => panic!("{other:?}"),
        }
        // The exempted first page re-executes without consuming a slot.
        match gate.check_origin(&heap_req(0x10400), &env, &|_| false) {
            OriginDecision::Admit(a) => assert_eq!(a.reason, "exempted"),
            other => panic!("{other:?}"),
        }
        assert_eq!(gate.detect_mode_used(), 1);

        match gate.check_origin(&heap_req(0x20000), &env, &|_| false) {
            OriginDecision::Deny(v) => assert_eq!(v.action, Action::Continue),
            other => panic!("{other:?}"),
        }
        match gate.check_origin(&heap_req(0x30000), &env, &|_| false) {
            OriginDecision::Deny(v) => assert_eq!(v.action, Action::TerminateProcess),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn future_entry_consumed_when_once_only() {
        let gate = gate_with("");
        let env = Env::default();
        gate.add_future_region(0x50000, 0x51000, true);
        let req = heap_req(0x50800);
        match gate.check_origin(&req, &env, &|_| false) {
            OriginDecision::Admit(a) => {
                assert_eq!(a.reason, "future");
                assert!(a.vm_flags.contains(VmFlags::MOVED_FROM_FUTURE));
            }
            other => panic!("{other:?}"),
        }
        assert!(!gate.future_covers(0x50800), "once-only entry consumed");
        // Second attempt falls through to heap denial.
        assert!(matches!(
            gate.check_origin(&req, &env, &|_| false),
            OriginDecision::Deny(_)
        ));
    }

    #[test]
    fn persistent_future_entry_survives() {
        let gate = gate_with("");
        let env = Env::default();
        gate.add_future_region(0x50000, 0x51000, false);
        let req = heap_req(0x50800);
        assert!(matches!(
            gate.check_origin(&req, &env, &|_| false),
            OriginDecision::Admit(_)
        ));
        assert!(gate.future_covers(0x50800));
    }

    #[test]
    fn dll2heap_exemption() {
        let gate = gate_with("[filters]\ndll2heap = [\"jit*\"]\n");
        let env = Env {
            text: vec![(0x400000, 0x500000, "jitcore.dll")],
            ..Default::default()
        };
        // Source inside jitcore.dll, target on the heap.
        match gate.check_origin(&heap_req(0x9000), &env, &|_| false) {
            OriginDecision::Admit(a) => assert_eq!(a.reason, "dll2heap"),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn throw_exception_budget_per_thread() {
        let gate = gate_with(
            "throw_exception = true\n[thresholds]\nthrow_exception_max = 10\nthrow_exception_max_per_thread = 2\n",
        );
        let env = Env::default();
        // Thread 1 gets two forged exceptions, then falls back to kills.
        for expected in [
            Action::ForgeException,
            Action::ForgeException,
            Action::TerminateThread,
        ] {
            match gate.check_origin(&heap_req(0x9000), &env, &|_| false) {
                OriginDecision::Deny(v) => assert_eq!(v.action, expected),
                other => panic!("{other:?}"),
            }
        }
        // A different thread still has its own budget.
        let mut req = heap_req(0x9000);
        req.thread = Some(2);
        match gate.check_origin(&req, &env, &|_| false) {
            OriginDecision::Deny(v) => assert_eq!(v.action, Action::ForgeException),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn probe_has_no_side_effects() {
        let gate = gate_with("detect_mode = true\n[thresholds]\ndetect_mode_max = 2\n");
        let env = Env::default();
        gate.add_future_region(0x50000, 0x51000, true);

        // Probing a denied region consumes no detect slot and records no
        // exemption.
        assert!(matches!(
            gate.check_origin_probe(&heap_req(0x9000), &env, &|_| false),
            OriginDecision::Deny(_)
        ));
        assert_eq!(gate.detect_mode_used(), 0);
        assert!(matches!(
            gate.check_origin(&heap_req(0x9000), &env, &|_| false),
            OriginDecision::Deny(v) if v.action == Action::Continue
        ));

        // Probing a once-only future entry does not consume it.
        assert!(matches!(
            gate.check_origin_probe(&heap_req(0x50800), &env, &|_| false),
            OriginDecision::Admit(_)
        ));
        assert!(gate.future_covers(0x50800));
    }

    #[test]
    fn threat_id_stable_and_kind_tagged() {
        let a = threat_id(ViolationKind::HeapExec, 0x1234, &[1, 2, 3, 4, 5]);
        let b = threat_id(ViolationKind::HeapExec, 0x1234, &[1, 2, 3, 4, 9]);
        assert_eq!(a, b, "only the first four target bytes participate");
        let c = threat_id(ViolationKind::StackExec, 0x1234, &[1, 2, 3, 4]);
        assert_ne!(a, c);
        assert_eq!(a.len(), 11);
    }
}
