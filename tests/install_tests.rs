//! In-process tests that install code and run it.
//!
//! Java-convention callers and fake interpreter frames are assembled with
//! the crate's own encoder and installed like any other code.

#![cfg(all(target_arch = "x86_64", unix))]

use std::sync::Arc;

use jitlink::config::RuntimeConfig;
use jitlink::jit::code_blob::InstalledCode;
use jitlink::jit::codebuf::CodeBuffer;
use jitlink::jit::installer::{CallType, CodeKind, CompiledCode, Site, SiteKind};
use jitlink::jit::reloc::RelocKind;
use jitlink::jit::x86_64::{Reg, X86_64Assembler, Xmm};
use jitlink::runtime::SharedRuntime;
use jitlink::runtime::method::{AccessFlags, Method};
use jitlink::runtime::objects::ObjectRef;
use jitlink::runtime::stubs::RuntimeEntryPoints;
use jitlink::runtime::thread::{ManagedThread, SafepointGate, ThreadState};

fn runtime() -> SharedRuntime {
    SharedRuntime::new(RuntimeConfig::default(), RuntimeEntryPoints::default()).unwrap()
}

fn install(rt: &SharedRuntime, name: &str, f: impl FnOnce(&mut X86_64Assembler)) -> Arc<InstalledCode> {
    let mut buf = CodeBuffer::new();
    let mut asm = X86_64Assembler::new(&mut buf);
    f(&mut asm);
    rt.install(CompiledCode::new(name, CodeKind::Method, buf.into_code()))
        .unwrap()
}

type JavaCall = extern "C" fn(thread: u64, args: *const u64, entry: u64, method: u64) -> u64;

/// Calls `entry` with the compiled Java convention: args[0..6] in the Java
/// argument registers, args[6..8] on the stack, args[8..10] in xmm0/xmm1.
fn java_call_trampoline(rt: &SharedRuntime) -> Arc<InstalledCode> {
    install(rt, "java_call", |a| {
        a.push(Reg::Rbp);
        a.mov_rr(Reg::Rbp, Reg::Rsp);
        a.push(Reg::R15);
        a.push(Reg::Rbx);
        a.push(Reg::R13);
        a.push(Reg::R13); // keeps the call aligned
        a.mov_rr(Reg::R15, Reg::Rdi);
        a.mov_rr(Reg::Rbx, Reg::Rcx);
        a.mov_rr(Reg::R10, Reg::Rsi);
        a.mov_rr(Reg::R11, Reg::Rdx);
        a.mov_rm(Reg::Rax, Reg::R10, 56);
        a.push(Reg::Rax);
        a.mov_rm(Reg::Rax, Reg::R10, 48);
        a.push(Reg::Rax);
        a.movsd_load(Xmm::Xmm0, Reg::R10, 64);
        a.movsd_load(Xmm::Xmm1, Reg::R10, 72);
        for (i, reg) in [Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9, Reg::Rdi]
            .into_iter()
            .enumerate()
        {
            a.mov_rm(reg, Reg::R10, i as i32 * 8);
        }
        a.call_r(Reg::R11);
        a.mov_rm(Reg::R13, Reg::Rbp, -24);
        a.mov_rm(Reg::Rbx, Reg::Rbp, -16);
        a.mov_rm(Reg::R15, Reg::Rbp, -8);
        a.mov_rr(Reg::Rsp, Reg::Rbp);
        a.pop(Reg::Rbp);
        a.ret();
    })
}

type InterpreterCall = extern "C" fn(slots: *const u64, entry: u64, method: u64) -> u64;

/// Calls `entry` the way the interpreter would: `slots` pushed in order,
/// callee in the method register.
fn interpreter_trampoline(rt: &SharedRuntime, slots: usize) -> Arc<InstalledCode> {
    install(rt, "interpreter_call", |a| {
        a.push(Reg::Rbp);
        a.mov_rr(Reg::Rbp, Reg::Rsp);
        a.push(Reg::Rbx);
        a.mov_rr(Reg::Rbx, Reg::Rdx);
        a.mov_rr(Reg::R11, Reg::Rsi);
        a.mov_rr(Reg::R10, Reg::Rdi);
        for s in 0..slots {
            a.mov_rm(Reg::Rax, Reg::R10, s as i32 * 8);
            a.push(Reg::Rax);
        }
        a.call_r(Reg::R11);
        a.mov_rm(Reg::Rbx, Reg::Rbp, -8);
        a.mov_rr(Reg::Rsp, Reg::Rbp);
        a.pop(Reg::Rbp);
        a.ret();
    })
}

unsafe fn as_fn<T>(code: &InstalledCode) -> T {
    unsafe { std::mem::transmute_copy(&(code.verified_entry_point() as usize)) }
}

#[test]
fn test_i2c_moves_interpreter_slots_into_registers_and_stack() {
    let rt = runtime();
    let method = Method::new("f", "(IIIIIIII)I", AccessFlags(AccessFlags::STATIC)).unwrap();
    let entry = rt.link_method(&method).unwrap();
    let slots: Vec<u64> = (10..18).collect();
    let call_interp = interpreter_trampoline(&rt, slots.len());
    let call: InterpreterCall = unsafe { as_fn(&call_interp) };

    let cases: [(&str, fn(&mut X86_64Assembler)); 3] = [
        ("first", |a| a.mov_rr(Reg::Rax, Reg::Rsi)),
        ("sixth", |a| a.mov_rr(Reg::Rax, Reg::Rdi)),
        ("last", |a| a.mov_rm(Reg::Rax, Reg::Rsp, 16)),
    ];
    let expected = [10, 15, 17];
    for ((name, body), want) in cases.into_iter().zip(expected) {
        let target = install(&rt, name, |a| {
            body(a);
            a.ret();
        });
        method.set_from_compiled_entry(target.verified_entry_point());
        let got = call(slots.as_ptr(), entry.i2c_entry(), method.block_address());
        assert_eq!(got, want, "{}", name);
    }
}

#[test]
fn test_i2c_reads_two_slot_values_from_lower_slot() {
    let rt = runtime();
    let method = Method::new("g", "(IDJ)J", AccessFlags(AccessFlags::STATIC)).unwrap();
    let entry = rt.link_method(&method).unwrap();
    // int, double (two slots), long (two slots)
    let slots: Vec<u64> = vec![1, 0xBAD, 2.5f64.to_bits(), 0xBAD, 0x1234_5678_9ABC];
    let call_interp = interpreter_trampoline(&rt, slots.len());
    let call: InterpreterCall = unsafe { as_fn(&call_interp) };

    let target = install(&rt, "long_arg", |a| {
        a.mov_rr(Reg::Rax, Reg::Rdx);
        a.ret();
    });
    method.set_from_compiled_entry(target.verified_entry_point());
    assert_eq!(
        call(slots.as_ptr(), entry.i2c_entry(), method.block_address()),
        0x1234_5678_9ABC
    );

    let target = install(&rt, "double_arg", |a| {
        a.sub_ri32(Reg::Rsp, 8);
        a.movsd_store(Reg::Rsp, 0, Xmm::Xmm0);
        a.pop(Reg::Rax);
        a.ret();
    });
    method.set_from_compiled_entry(target.verified_entry_point());
    assert_eq!(
        call(slots.as_ptr(), entry.i2c_entry(), method.block_address()),
        2.5f64.to_bits()
    );
}

#[test]
fn test_c2i_builds_interpreter_frame() {
    let rt = runtime();
    let method = Method::new("h", "(IIIIIIII)I", AccessFlags(AccessFlags::STATIC)).unwrap();
    let entry = rt.link_method(&method).unwrap();
    let java_call = java_call_trampoline(&rt);
    let call: JavaCall = unsafe { as_fn(&java_call) };
    let args: Vec<u64> = (10..20).collect();

    // slot s of 8 sits at [rsp + 8 + (7 - s) * 8] on interpreter entry
    for (slot, want) in [(0, 10), (5, 15), (6, 16), (7, 17)] {
        let interpreter = install(&rt, "interpreter", |a| {
            a.mov_rm(Reg::Rax, Reg::Rsp, 8 + (7 - slot) * 8);
            a.ret();
        });
        method.set_interpreter_entry(interpreter.verified_entry_point());
        let got = call(0, args.as_ptr(), entry.c2i_entry(), method.block_address());
        assert_eq!(got, want, "slot {}", slot);
    }
}

#[test]
fn test_i2c_then_c2i_round_trip_through_method_entries() {
    let rt = runtime();
    let method = Method::new("r", "(JI)J", AccessFlags(AccessFlags::STATIC)).unwrap();
    let entry = rt.link_method(&method).unwrap();
    // interpreted caller -> i2c -> from_compiled (c2i) -> interpreter
    assert_eq!(method.from_compiled_entry(), entry.c2i_entry());
    let interpreter = install(&rt, "interpreter", |a| {
        // long value slot is slot 1 of 3
        a.mov_rm(Reg::Rax, Reg::Rsp, 8 + 8);
        a.ret();
    });
    method.set_interpreter_entry(interpreter.verified_entry_point());

    let slots = vec![0xBAD, 0x77, 5];
    let call_interp = interpreter_trampoline(&rt, slots.len());
    let call: InterpreterCall = unsafe { as_fn(&call_interp) };
    assert_eq!(
        call(slots.as_ptr(), entry.i2c_entry(), method.block_address()),
        0x77
    );
}

extern "C" fn native_add(env: *const u64, mirror: *const u64, a: i32, b: i32) -> i32 {
    let ok = unsafe { *env == 0xE17 && !mirror.is_null() && *mirror == 0x4000 };
    if ok { a + b } else { -1 }
}

extern "C" fn native_check(env: *const u64, this: *const u64, obj: *const u64) -> u8 {
    if env.is_null() || this.is_null() {
        return 3;
    }
    if obj.is_null() {
        return 2;
    }
    if unsafe { *this == 0x5000 && *obj == 0x6000 } { 0 } else { 3 }
}

static GLOBAL_OBJECT: u64 = 0x7777;

extern "C" fn native_global(_env: *const u64, _mirror: *const u64, want_null: i32) -> *const u64 {
    if want_null != 0 {
        std::ptr::null()
    } else {
        &GLOBAL_OBJECT
    }
}

#[test]
fn test_static_native_wrapper_passes_env_and_mirror() {
    let rt = runtime();
    let thread = ManagedThread::new(SafepointGate::new(), 0xE17);
    let method = Method::new("add", "(II)I", AccessFlags(AccessFlags::STATIC | AccessFlags::NATIVE))
        .unwrap()
        .with_holder_mirror(ObjectRef(0x4000));
    let wrapper = rt
        .create_native_wrapper(&method, native_add as usize as u64)
        .unwrap();

    let java_call = java_call_trampoline(&rt);
    let call: JavaCall = unsafe { as_fn(&java_call) };
    let mut args = [0u64; 10];
    args[0] = 3;
    args[1] = 4;
    let thread_ptr = &*thread as *const ManagedThread as u64;
    let got = call(thread_ptr, args.as_ptr(), wrapper.verified_entry_point(), 0);
    assert_eq!(got as u32 as i32, 7);
    assert_eq!(thread.state(), ThreadState::InJava);
    assert_eq!(thread.last_java_sp(), 0);
}

#[test]
fn test_native_wrapper_handlizes_objects_and_normalizes_boolean() {
    let rt = runtime();
    let thread = ManagedThread::new(SafepointGate::new(), 0);
    let method = Method::new("check", "(Ljava/lang/Object;)Z", AccessFlags(AccessFlags::NATIVE)).unwrap();
    let wrapper = rt
        .create_native_wrapper(&method, native_check as usize as u64)
        .unwrap();
    let java_call = java_call_trampoline(&rt);
    let call: JavaCall = unsafe { as_fn(&java_call) };
    let thread_ptr = &*thread as *const ManagedThread as u64;

    let mut args = [0u64; 10];
    args[0] = 0x5000;
    // null stays null; the native result 2 becomes true
    assert_eq!(call(thread_ptr, args.as_ptr(), wrapper.verified_entry_point(), 0), 1);
    args[1] = 0x6000;
    assert_eq!(call(thread_ptr, args.as_ptr(), wrapper.verified_entry_point(), 0), 0);
}

#[test]
fn test_native_wrapper_unhandlizes_object_result() {
    let rt = runtime();
    let thread = ManagedThread::new(SafepointGate::new(), 0);
    let method = Method::new(
        "global",
        "(I)Ljava/lang/Object;",
        AccessFlags(AccessFlags::STATIC | AccessFlags::NATIVE),
    )
    .unwrap();
    let wrapper = rt
        .create_native_wrapper(&method, native_global as usize as u64)
        .unwrap();
    let java_call = java_call_trampoline(&rt);
    let call: JavaCall = unsafe { as_fn(&java_call) };
    let thread_ptr = &*thread as *const ManagedThread as u64;

    let mut args = [0u64; 10];
    assert_eq!(call(thread_ptr, args.as_ptr(), wrapper.verified_entry_point(), 0), 0x7777);
    args[0] = 1;
    assert_eq!(call(thread_ptr, args.as_ptr(), wrapper.verified_entry_point(), 0), 0);
}

#[test]
fn test_data_reference_survives_relocation() {
    let rt = runtime();
    let mut buf = CodeBuffer::new();
    let mut asm = X86_64Assembler::new(&mut buf);
    asm.mov_rip(Reg::Rax, 0);
    asm.ret();
    let mut compiled = CompiledCode::new("load", CodeKind::Method, buf.into_code());
    compiled.data = 0xDEAD_BEEF_u64.to_le_bytes().to_vec();
    compiled.sites.push(Site::new(0, SiteKind::DataReference { data_offset: 0 }));

    let installed = rt.install(compiled).unwrap();
    let load: extern "C" fn() -> u64 = unsafe { as_fn(&installed) };
    assert_eq!(load(), 0xDEAD_BEEF);

    let moved = installed.relocate().unwrap();
    let load: extern "C" fn() -> u64 = unsafe { as_fn(&moved) };
    assert_eq!(load(), 0xDEAD_BEEF);
}

#[test]
fn test_every_call_kind_gets_one_entry() {
    let rt = runtime();
    let mut buf = CodeBuffer::new();
    let mut asm = X86_64Assembler::new(&mut buf);
    for _ in 0..0x10 {
        asm.nop();
    }
    asm.call_rel32(0); // 0x10 static
    asm.mov_ri64(Reg::Rax, 0); // 0x15 ic value
    asm.call_rel32(0); // 0x1f virtual
    asm.call_rel32(0); // 0x24 special
    asm.ret();

    let callee = |flags| Some(Arc::new(Method::new("c", "()V", AccessFlags(flags)).unwrap()));
    let mut compiled = CompiledCode::new("calls", CodeKind::Method, buf.into_code());
    compiled.sites = vec![
        Site::new(
            0x10,
            SiteKind::MethodCall {
                call_type: CallType::InvokeStatic,
                ic_mark: None,
                method: callee(AccessFlags::STATIC),
                debug: None,
            },
        ),
        Site::new(
            0x1f,
            SiteKind::MethodCall {
                call_type: CallType::InvokeVirtual,
                ic_mark: Some(0x15),
                method: callee(0),
                debug: None,
            },
        ),
        Site::new(
            0x24,
            SiteKind::MethodCall {
                call_type: CallType::InvokeSpecial,
                ic_mark: None,
                method: callee(0),
                debug: None,
            },
        ),
    ];

    let installed = rt.install(compiled).unwrap();
    let kinds: Vec<(u32, RelocKind)> = installed
        .relocations()
        .iter()
        .map(|r| (r.offset, r.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (0x10, RelocKind::StaticCall),
            (0x1f, RelocKind::VirtualCall { ic_mark: 0x15 }),
            (0x24, RelocKind::OptVirtualCall),
        ]
    );
    assert_eq!(
        installed.call_site(0x10).unwrap().destination().unwrap(),
        rt.stubs().resolve_static
    );
    assert_eq!(
        installed.call_site(0x24).unwrap().destination().unwrap(),
        rt.stubs().resolve_opt_virtual
    );
}
