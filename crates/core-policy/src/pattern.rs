//! Trampoline pattern matcher.
//!
//! A handful of legitimate code generators emit tiny one-or-two
//! instruction thunks into otherwise non-executable memory: loader
//! trampolines, PIC thunks, hook displacement stubs, COM marshalling
//! returns. Rather than admit whole regions for these, the gate matches
//! the bytes at the target against a small data-driven template table and
//! admits only the matched bytes, sandboxed and re-verified on the next
//! encounter.
//!
//! Decoding is delegated to the translator's decoder through the
//! read-only [`InstrSniffer`] seam; the matcher never looks at raw bytes
//! itself.

use core_interval::AppAddr;
use tracing::debug;

/// Minimal decoded view of one instruction, as much as templates need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffedKind {
    /// Load or push of an immediate value into a register or the stack.
    LoadImm { value: u64 },
    /// The PIC `call $+5; pop` style push of the instruction's own address.
    PushPc,
    /// Unconditional direct jump.
    DirectJump { target: AppAddr },
    /// Direct call.
    DirectCall { target: AppAddr },
    /// Near return.
    Return,
    /// Anything else (used by the hook-displacement template).
    Other,
}

#[derive(Debug, Clone, Copy)]
pub struct SniffedInstr {
    pub kind: SniffedKind,
    pub len: u8,
}

/// Read-only decoding seam onto the translator's decoder.
pub trait InstrSniffer: Send + Sync {
    /// Decode the single instruction at `pc`. `bytes` starts at `pc`;
    /// returns `None` when the bytes do not decode.
    fn sniff(&self, bytes: &[u8], pc: AppAddr) -> Option<SniffedInstr>;
}

/// One step of a template: a constraint on one sniffed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    LoadImm,
    PushPc,
    Return,
    /// Direct jump whose target is already-known code.
    JumpToKnown,
    /// Direct call whose target is already-known code.
    CallToKnown,
    /// Any single decodable instruction that is not a control transfer.
    Displaced,
}

struct Template {
    name: &'static str,
    steps: &'static [Step],
    /// Only matched when hook admission is enabled.
    hook_gated: bool,
}

/// The known trampoline shapes, most specific first.
const TEMPLATES: &[Template] = &[
    Template {
        name: "load_imm_jump",
        steps: &[Step::LoadImm, Step::JumpToKnown],
        hook_gated: false,
    },
    Template {
        name: "pic_push_jump",
        steps: &[Step::PushPc, Step::JumpToKnown],
        hook_gated: false,
    },
    Template {
        name: "com_ret_call",
        steps: &[Step::Return, Step::CallToKnown],
        hook_gated: false,
    },
    Template {
        name: "off_stack_return",
        steps: &[Step::Return],
        hook_gated: false,
    },
    Template {
        name: "hook_displacement",
        steps: &[Step::Displaced, Step::JumpToKnown],
        hook_gated: true,
    },
];

#[derive(Debug, Clone, Copy)]
pub struct TemplateMatch {
    /// Bytes covered by the matched instructions.
    pub len: u64,
    pub template: &'static str,
}

fn step_matches(
    step: Step,
    instr: &SniffedInstr,
    known_code: &dyn Fn(AppAddr) -> bool,
) -> bool {
    match (step, instr.kind) {
        (Step::LoadImm, SniffedKind::LoadImm { .. }) => true,
        (Step::PushPc, SniffedKind::PushPc) => true,
        (Step::Return, SniffedKind::Return) => true,
        (Step::JumpToKnown, SniffedKind::DirectJump { target }) => known_code(target),
        (Step::CallToKnown, SniffedKind::DirectCall { target }) => known_code(target),
        (
            Step::Displaced,
            SniffedKind::LoadImm { .. } | SniffedKind::PushPc | SniffedKind::Other,
        ) => true,
        _ => false,
    }
}

/// Match the bytes at `addr` against the template table. `known_code`
/// answers whether an address is already classified executable.
pub fn match_trampoline(
    sniffer: &dyn InstrSniffer,
    bytes: &[u8],
    addr: AppAddr,
    allow_hook: bool,
    known_code: &dyn Fn(AppAddr) -> bool,
) -> Option<TemplateMatch> {
    // Decode at most two instructions once, then try each template.
    let first = sniffer.sniff(bytes, addr)?;
    let second = bytes
        .get(first.len as usize..)
        .filter(|rest| !rest.is_empty())
        .and_then(|rest| sniffer.sniff(rest, addr + first.len as u64));

    for t in TEMPLATES {
        if t.hook_gated && !allow_hook {
            continue;
        }
        let matched = match t.steps {
            [only] => step_matches(*only, &first, known_code).then(|| first.len as u64),
            [a, b] => match second {
                Some(ref s)
                    if step_matches(*a, &first, known_code)
                        && step_matches(*b, s, known_code) =>
                {
                    Some(first.len as u64 + s.len as u64)
                }
                _ => None,
            },
            _ => None,
        };
        if let Some(len) = matched {
            debug!(
                target: "policy",
                addr = format_args!("{addr:#x}"),
                template = t.name,
                len,
                "trampoline pattern matched"
            );
            return Some(TemplateMatch {
                len,
                template: t.name,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Byte-coded fake decoder: each pseudo-instruction is two bytes,
    /// the first selecting the kind, the second an operand index.
    pub struct FakeSniffer;

    impl InstrSniffer for FakeSniffer {
        fn sniff(&self, bytes: &[u8], _pc: AppAddr) -> Option<SniffedInstr> {
            let op = *bytes.first()?;
            let arg = *bytes.get(1)? as u64;
            let kind = match op {
                0x01 => SniffedKind::LoadImm { value: arg },
                0x02 => SniffedKind::PushPc,
                0x03 => SniffedKind::DirectJump {
                    target: 0x1000 * arg,
                },
                0x04 => SniffedKind::DirectCall {
                    target: 0x1000 * arg,
                },
                0x05 => SniffedKind::Return,
                0x06 => SniffedKind::Other,
                _ => return None,
            };
            Some(SniffedInstr { kind, len: 2 })
        }
    }

    fn known(addr: AppAddr) -> bool {
        addr == 0x5000
    }

    #[test]
    fn load_imm_jump_matches() {
        // load-imm then jump to 0x5000 (known).
        let m = match_trampoline(&FakeSniffer, &[0x01, 0x10, 0x03, 0x05], 0x9000, false, &known)
            .unwrap();
        assert_eq!(m.template, "load_imm_jump");
        assert_eq!(m.len, 4);
    }

    #[test]
    fn jump_to_unknown_code_rejected() {
        assert!(
            match_trampoline(&FakeSniffer, &[0x01, 0x10, 0x03, 0x09], 0x9000, false, &known)
                .is_none()
        );
    }

    #[test]
    fn bare_return_matches_off_stack_template() {
        let m = match_trampoline(&FakeSniffer, &[0x05, 0x00], 0x9000, false, &known).unwrap();
        assert_eq!(m.template, "off_stack_return");
        assert_eq!(m.len, 2);
    }

    #[test]
    fn ret_then_known_call_prefers_com_template() {
        let m = match_trampoline(&FakeSniffer, &[0x05, 0x00, 0x04, 0x05], 0x9000, false, &known)
            .unwrap();
        assert_eq!(m.template, "com_ret_call");
        assert_eq!(m.len, 4);
    }

    #[test]
    fn hook_displacement_gated() {
        let bytes = [0x06, 0x00, 0x03, 0x05];
        assert!(match_trampoline(&FakeSniffer, &bytes, 0x9000, false, &known).is_none());
        let m = match_trampoline(&FakeSniffer, &bytes, 0x9000, true, &known).unwrap();
        assert_eq!(m.template, "hook_displacement");
    }

    #[test]
    fn undecodable_bytes_no_match() {
        assert!(match_trampoline(&FakeSniffer, &[0xff, 0x00], 0x9000, true, &known).is_none());
    }
}
