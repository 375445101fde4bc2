//! Argument locations for the compiled-Java and native (System V) conventions.

use crate::jit::registers::Register;
use crate::jit::x86_64::{Reg, Xmm};

use super::signature::BasicType;

/// Java argument registers, in order.
pub const J_RARGS: [Reg; 6] = [Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9, Reg::Rdi];
/// C argument registers, in order.
pub const C_RARGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];
/// Floating-point argument registers (both conventions).
pub const FP_ARGS: [Xmm; 8] = [
    Xmm::Xmm0,
    Xmm::Xmm1,
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
];

/// Current thread in compiled code.
pub const THREAD_REG: Reg = Reg::R15;
/// Callee `MethodBlock` on entry to adapters and resolution stubs.
pub const METHOD_REG: Reg = Reg::Rbx;
/// Inline-cache value at virtual call sites.
pub const IC_REG: Reg = Reg::Rax;
/// Caller's stack pointer when entering the interpreter.
pub const SENDER_SP_REG: Reg = Reg::R13;

/// Where one argument lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    Reg(Register),
    /// 8-byte outgoing stack slot, counted from the first stack argument.
    Stack(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgLayout {
    pub locations: Vec<ArgLocation>,
    /// Number of 8-byte stack slots used.
    pub stack_slots: u32,
}

fn assign(args: &[BasicType], gprs: &[Reg]) -> ArgLayout {
    let mut next_gpr = 0;
    let mut next_fp = 0;
    let mut stack_slots = 0;
    let mut locations = Vec::with_capacity(args.len());

    for ty in args {
        let location = if ty.is_floating() {
            if next_fp < FP_ARGS.len() {
                next_fp += 1;
                ArgLocation::Reg(Register::Xmm(FP_ARGS[next_fp - 1]))
            } else {
                stack_slots += 1;
                ArgLocation::Stack(stack_slots - 1)
            }
        } else if next_gpr < gprs.len() {
            next_gpr += 1;
            ArgLocation::Reg(Register::Gpr(gprs[next_gpr - 1]))
        } else {
            stack_slots += 1;
            ArgLocation::Stack(stack_slots - 1)
        };
        locations.push(location);
    }

    ArgLayout {
        locations,
        stack_slots,
    }
}

/// Locations for a compiled-Java call. `args` includes the receiver.
pub fn java_calling_convention(args: &[BasicType]) -> ArgLayout {
    assign(args, &J_RARGS)
}

/// Locations for a call into native code.
pub fn c_calling_convention(args: &[BasicType]) -> ArgLayout {
    assign(args, &C_RARGS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpr(r: Reg) -> ArgLocation {
        ArgLocation::Reg(Register::Gpr(r))
    }

    fn xmm(x: Xmm) -> ArgLocation {
        ArgLocation::Reg(Register::Xmm(x))
    }

    #[test]
    fn test_java_convention_mixed() {
        use BasicType::*;
        let layout = java_calling_convention(&[Object, Int, Double, Long, Float]);
        assert_eq!(
            layout.locations,
            vec![
                gpr(Reg::Rsi),
                gpr(Reg::Rdx),
                xmm(Xmm::Xmm0),
                gpr(Reg::Rcx),
                xmm(Xmm::Xmm1)
            ]
        );
        assert_eq!(layout.stack_slots, 0);
    }

    #[test]
    fn test_java_convention_spills_to_stack() {
        let args = vec![BasicType::Int; 8];
        let layout = java_calling_convention(&args);
        assert_eq!(layout.locations[5], gpr(Reg::Rdi));
        assert_eq!(layout.locations[6], ArgLocation::Stack(0));
        assert_eq!(layout.locations[7], ArgLocation::Stack(1));
        assert_eq!(layout.stack_slots, 2);
    }

    #[test]
    fn test_c_convention() {
        use BasicType::*;
        let layout = c_calling_convention(&[Long, Object, Int]);
        assert_eq!(
            layout.locations,
            vec![gpr(Reg::Rdi), gpr(Reg::Rsi), gpr(Reg::Rdx)]
        );

        let doubles = vec![Double; 10];
        let layout = c_calling_convention(&doubles);
        assert_eq!(layout.locations[7], xmm(Xmm::Xmm7));
        assert_eq!(layout.locations[8], ArgLocation::Stack(0));
        assert_eq!(layout.stack_slots, 2);
    }
}
