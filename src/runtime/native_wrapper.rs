//! Wrappers that let compiled code call native methods directly.
//!
//! A wrapper is entered like any compiled method. It moves the incoming
//! arguments into the C convention, passing object references as handles
//! (addresses of stack slots holding the reference, or null), marks the
//! thread as being in native code around the call, and converts the result
//! back.

use crate::error::InstallError;
use crate::jit::codebuf::CodeBuffer;
use crate::jit::installer::{CodeKind, CompiledCode, EntryOffsets, InstallContext, Site, SiteKind};
use crate::jit::registers::Register;
use crate::jit::stackmap::ReferenceMap;
use crate::jit::x86_64::{Cond, Reg, X86_64Assembler, Xmm};

use super::calling_convention::{
    ArgLayout, ArgLocation, IC_REG, J_RARGS, THREAD_REG, c_calling_convention,
    java_calling_convention,
};
use super::method::Method;
use super::objects::KLASS_OFFSET;
use super::signature::BasicType;
use super::thread::{
    THREAD_ENV_OFFSET, THREAD_LAST_JAVA_SP_OFFSET, THREAD_STATE_OFFSET, ThreadState,
    transition_from_native,
};

const DONE_LABEL: &str = "native_result_done";

/// Where a Java argument sits once the frame is built.
#[derive(Debug, Clone, Copy)]
struct Home {
    base: Reg,
    disp: i32,
}

/// Frame layout below the saved rbp, as offsets from rsp.
#[derive(Debug)]
struct Frame {
    spill: i32,
    mirror: i32,
    result: i32,
    size: i32,
}

impl Frame {
    fn new(c_layout: &ArgLayout, java_args: usize) -> Self {
        let spill = c_layout.stack_slots as i32 * 8;
        let mirror = spill + java_args as i32 * 8;
        let result = mirror + 8;
        let size = (result + 16 + 15) & !15;
        Self {
            spill,
            mirror,
            result,
            size,
        }
    }

    /// Stack slot (8-byte units from rsp) of an address relative to rsp or rbp.
    fn slot_of(&self, home: Home) -> u32 {
        let from_rsp = match home.base {
            Reg::Rbp => self.size + home.disp,
            _ => home.disp,
        };
        (from_rsp / 8) as u32
    }
}

fn store_to_c_arg(asm: &mut X86_64Assembler, location: ArgLocation, value: Reg) {
    match location {
        ArgLocation::Reg(Register::Gpr(reg)) => asm.mov_rr(reg, value),
        ArgLocation::Reg(Register::Xmm(_)) => {}
        ArgLocation::Stack(k) => asm.mov_mr(Reg::Rsp, k as i32 * 8, value),
    }
}

/// Pass the address of `home` as a handle, or null if it holds null.
fn emit_handle(asm: &mut X86_64Assembler, home: Home, location: ArgLocation) {
    asm.mov_rm(Reg::R10, home.base, home.disp);
    asm.lea(Reg::R11, home.base, home.disp);
    asm.test_rr(Reg::R10, Reg::R10);
    asm.cmov(Cond::E, Reg::R11, Reg::R10);
    store_to_c_arg(asm, location, Reg::R11);
}

fn emit_value(asm: &mut X86_64Assembler, home: Home, location: ArgLocation) {
    match location {
        ArgLocation::Reg(Register::Gpr(reg)) => asm.mov_rm(reg, home.base, home.disp),
        ArgLocation::Reg(Register::Xmm(xmm)) => asm.movsd_load(xmm, home.base, home.disp),
        ArgLocation::Stack(k) => {
            asm.mov_rm(Reg::R10, home.base, home.disp);
            asm.mov_mr(Reg::Rsp, k as i32 * 8, Reg::R10);
        }
    }
}

/// Generate the wrapper for `method`, calling `native_entry`.
pub fn generate(
    method: &Method,
    native_entry: u64,
    context: &InstallContext,
) -> Result<CompiledCode, InstallError> {
    let is_static = method.is_static();
    let java_types = method.signature().java_args(is_static);
    let normalized: Vec<BasicType> = java_types.iter().map(|t| t.normalized()).collect();
    let java_layout = java_calling_convention(&normalized);

    // env, then the class mirror for static methods, then the Java arguments
    let mut c_types = vec![BasicType::Long];
    if is_static {
        c_types.push(BasicType::Object);
    }
    let first_java = c_types.len();
    c_types.extend_from_slice(&normalized);
    let c_layout = c_calling_convention(&c_types);

    let frame = Frame::new(&c_layout, normalized.len());
    let mut buf = CodeBuffer::new();
    let mut asm = X86_64Assembler::new(&mut buf);
    let mut sites = Vec::new();

    let unverified_entry = if is_static {
        None
    } else {
        let entry = asm.offset() as u32;
        asm.cmp_rm(IC_REG, J_RARGS[0], KLASS_OFFSET);
        sites.push(Site::new(
            asm.offset() as u32,
            SiteKind::ForeignCall {
                destination: context.stubs.ic_miss,
                debug: None,
            },
        ));
        asm.jcc_rel32(Cond::Ne, 0);
        asm.align(16);
        Some(entry)
    };

    let verified_entry = asm.offset() as u32;
    asm.push(Reg::Rbp);
    asm.mov_rr(Reg::Rbp, Reg::Rsp);
    asm.sub_ri32(Reg::Rsp, frame.size);

    // Spill register arguments; stack arguments stay in the caller's frame.
    let mut homes = Vec::with_capacity(normalized.len());
    for (i, location) in java_layout.locations.iter().enumerate() {
        let spill = Home {
            base: Reg::Rsp,
            disp: frame.spill + i as i32 * 8,
        };
        let home = match *location {
            ArgLocation::Reg(Register::Gpr(reg)) => {
                asm.mov_mr(spill.base, spill.disp, reg);
                spill
            }
            ArgLocation::Reg(Register::Xmm(xmm)) => {
                asm.movsd_store(spill.base, spill.disp, xmm);
                spill
            }
            ArgLocation::Stack(k) => Home {
                base: Reg::Rbp,
                disp: 16 + k as i32 * 8,
            },
        };
        homes.push(home);
    }

    asm.mov_mr(THREAD_REG, THREAD_LAST_JAVA_SP_OFFSET, Reg::Rsp);

    let mut handle_slots = Vec::new();
    match c_layout.locations[0] {
        ArgLocation::Reg(Register::Gpr(reg)) => asm.lea(reg, THREAD_REG, THREAD_ENV_OFFSET),
        location => {
            asm.lea(Reg::R10, THREAD_REG, THREAD_ENV_OFFSET);
            store_to_c_arg(&mut asm, location, Reg::R10);
        }
    }

    if is_static {
        let mirror = Home {
            base: Reg::Rsp,
            disp: frame.mirror,
        };
        sites.push(Site::new(
            asm.offset() as u32,
            SiteKind::ObjectConstant {
                object: method.holder_mirror(),
                compressed: false,
            },
        ));
        asm.mov_ri64(Reg::R10, 0);
        asm.mov_mr(mirror.base, mirror.disp, Reg::R10);
        emit_handle(&mut asm, mirror, c_layout.locations[1]);
        handle_slots.push(frame.slot_of(mirror));
    }

    for (i, ty) in normalized.iter().enumerate() {
        let location = c_layout.locations[first_java + i];
        if ty.is_reference() {
            emit_handle(&mut asm, homes[i], location);
            handle_slots.push(frame.slot_of(homes[i]));
        } else {
            emit_value(&mut asm, homes[i], location);
        }
    }

    asm.mov_m32_imm32(THREAD_REG, THREAD_STATE_OFFSET, ThreadState::InNative as u32);
    sites.push(Site::new(
        asm.offset() as u32,
        SiteKind::ForeignCall {
            destination: native_entry,
            debug: Some(ReferenceMap {
                registers: Vec::new(),
                stack_slots: handle_slots,
            }),
        },
    ));
    asm.mov_ri64(Reg::R10, 0);
    asm.call_r(Reg::R10);

    asm.mov_mr(Reg::Rsp, frame.result, Reg::Rax);
    asm.movsd_store(Reg::Rsp, frame.result + 8, Xmm::Xmm0);

    asm.mov_rr(Reg::Rdi, THREAD_REG);
    sites.push(Site::new(
        asm.offset() as u32,
        SiteKind::ForeignCall {
            destination: transition_from_native as usize as u64,
            debug: None,
        },
    ));
    asm.mov_ri64(Reg::R10, 0);
    asm.call_r(Reg::R10);

    asm.mov_rm(Reg::Rax, Reg::Rsp, frame.result);
    asm.movsd_load(Xmm::Xmm0, Reg::Rsp, frame.result + 8);

    match method.signature().ret {
        BasicType::Boolean => {
            asm.cmp_r8_zero(Reg::Rax);
            asm.setcc(Cond::Ne, Reg::Rax);
            asm.movzx_r64_r8(Reg::Rax, Reg::Rax);
        }
        BasicType::Object | BasicType::Array => {
            asm.test_rr(Reg::Rax, Reg::Rax);
            asm.jcc_label(Cond::E, DONE_LABEL);
            asm.mov_rm(Reg::Rax, Reg::Rax, 0);
            asm.bind(DONE_LABEL);
        }
        _ => {}
    }

    asm.xor_rr(Reg::R10, Reg::R10);
    asm.mov_mr(THREAD_REG, THREAD_LAST_JAVA_SP_OFFSET, Reg::R10);
    asm.mov_rr(Reg::Rsp, Reg::Rbp);
    asm.pop(Reg::Rbp);
    asm.ret();

    buf.patch_forward_refs()?;

    let mut compiled = CompiledCode::new(
        &format!("native wrapper {}{}", method.name(), method.descriptor()),
        CodeKind::Method,
        buf.into_code(),
    );
    compiled.sites = sites;
    compiled.entries = EntryOffsets {
        verified_entry,
        unverified_entry,
    };
    compiled.frame_size = frame.size as u32 + 16;
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::SharedRuntime;
    use crate::runtime::method::AccessFlags;
    use crate::runtime::objects::ObjectRef;
    use crate::runtime::stubs::RuntimeEntryPoints;

    fn runtime() -> SharedRuntime {
        SharedRuntime::new(RuntimeConfig::default(), RuntimeEntryPoints::default()).unwrap()
    }

    #[test]
    fn test_frame_layout() {
        let c_layout = c_calling_convention(&vec![BasicType::Int; 8]);
        let frame = Frame::new(&c_layout, 6);
        assert_eq!(frame.spill, 16);
        assert_eq!(frame.mirror, 64);
        assert_eq!(frame.result, 72);
        assert_eq!(frame.size % 16, 0);
        assert!(frame.size >= frame.result + 16);
        assert_eq!(
            frame.slot_of(Home {
                base: Reg::Rbp,
                disp: 16
            }),
            (frame.size as u32 + 16) / 8
        );
    }

    #[test]
    fn test_static_wrapper_has_no_unverified_entry() {
        let rt = runtime();
        let method = Method::new("nop", "()V", AccessFlags(AccessFlags::STATIC | AccessFlags::NATIVE))
            .unwrap()
            .with_holder_mirror(ObjectRef(0x4000));
        let code = rt.create_native_wrapper(&method, 0x1234).unwrap();
        assert_eq!(code.kind(), CodeKind::Method);
        assert_eq!(code.entry_point(), code.verified_entry_point());
        // the mirror constant is an object immediate
        assert!(code.relocations().iter().any(|r| r.kind.is_oop()));
    }

    #[test]
    fn test_handle_slots_in_oop_map() {
        let rt = runtime();
        let method = Method::new(
            "put",
            "(ILjava/lang/Object;J[I)V",
            AccessFlags(AccessFlags::NATIVE),
        )
        .unwrap();
        let code = rt.create_native_wrapper(&method, 0x1234).unwrap();
        assert!(code.entry_point() < code.verified_entry_point());

        let maps: Vec<_> = code.oop_maps().iter().collect();
        assert_eq!(maps.len(), 1);
        // receiver, the Object and the array; the c stack area is empty
        let c_layout = c_calling_convention(&[
            BasicType::Long,
            BasicType::Object,
            BasicType::Int,
            BasicType::Object,
            BasicType::Long,
            BasicType::Object,
        ]);
        assert_eq!(c_layout.stack_slots, 0);
        assert_eq!(maps[0].stack_ref_slots(), vec![0, 2, 4]);
    }
}
