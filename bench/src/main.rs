use jitlink::config::RuntimeConfig;
use jitlink::jit::codebuf::CodeBuffer;
use jitlink::jit::installer::{CallType, CodeKind, CompiledCode, PollKind, Site, SiteKind};
use jitlink::jit::x86_64::{Reg, X86_64Assembler};
use jitlink::runtime::SharedRuntime;
use jitlink::runtime::method::{AccessFlags, Method};
use jitlink::runtime::objects::ObjectRef;
use jitlink::runtime::stubs::RuntimeEntryPoints;
use serde::Serialize;
use std::time::Instant;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    iterations: usize,
    total_secs: f64,
    per_iteration_us: f64,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

fn time<F>(name: &str, iterations: usize, mut f: F) -> BenchmarkResult
where
    F: FnMut(usize),
{
    let start = Instant::now();
    for i in 0..iterations {
        f(i);
    }
    let total = start.elapsed().as_secs_f64();
    BenchmarkResult {
        name: name.to_string(),
        iterations,
        total_secs: total,
        per_iteration_us: total * 1e6 / iterations as f64,
    }
}

/// A unit with one site of every common kind: an oop, a data load, a
/// virtual call and a return poll.
fn sample_unit() -> CompiledCode {
    let mut buf = CodeBuffer::new();
    let mut asm = X86_64Assembler::new(&mut buf);
    asm.mov_ri64(Reg::Rax, 0);
    asm.mov_rip(Reg::Rcx, 0);
    let ic = asm.offset() as u32;
    asm.mov_ri64(Reg::Rax, 0);
    let call = asm.offset() as u32;
    asm.call_rel32(0);
    let poll = asm.offset() as u32;
    asm.poll_near(0);
    asm.ret();

    let callee = Method::new("callee", "(I)I", AccessFlags::default()).ok().map(Into::into);
    let mut compiled = CompiledCode::new("sample", CodeKind::Method, buf.into_code());
    compiled.data = vec![0; 8];
    compiled.sites = vec![
        Site::new(
            0,
            SiteKind::ObjectConstant {
                object: ObjectRef(0x1000),
                compressed: false,
            },
        ),
        Site::new(10, SiteKind::DataReference { data_offset: 0 }),
        Site::new(
            call,
            SiteKind::MethodCall {
                call_type: CallType::InvokeVirtual,
                ic_mark: Some(ic),
                method: callee,
                debug: None,
            },
        ),
        Site::new(
            poll,
            SiteKind::SafepointPoll {
                poll: PollKind::ReturnNear,
            },
        ),
    ];
    compiled
}

fn main() {
    let runtime = match SharedRuntime::new(RuntimeConfig::default(), RuntimeEntryPoints::default()) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };
    let mut results = Vec::new();

    let unit = sample_unit();
    results.push(time("install", 2_000, |_| {
        runtime.install(unit.clone()).unwrap();
    }));

    let installed = runtime.install(unit.clone()).unwrap();
    results.push(time("relocate", 2_000, |_| {
        installed.relocate().unwrap();
    }));

    // first lookups generate, the rest hit the cache
    let shapes = ["(I)V", "(J)V", "(D)V", "(IJ)V", "(Ljava/lang/Object;I)I", "(FDJ)J"];
    let methods: Vec<Method> = shapes
        .iter()
        .map(|d| Method::new("m", d, AccessFlags(AccessFlags::STATIC)).unwrap())
        .collect();
    results.push(time("adapter_lookup", 100_000, |i| {
        runtime.get_adapter(&methods[i % methods.len()]).unwrap();
    }));

    let native = Method::new("n", "(IJ)I", AccessFlags(AccessFlags::STATIC | AccessFlags::NATIVE))
        .unwrap();
    results.push(time("native_wrapper", 1_000, |_| {
        runtime.create_native_wrapper(&native, 0x1000).unwrap();
    }));

    let output = BenchmarkOutput { results };
    println!("{}", serde_json::to_string_pretty(&output).unwrap());
}
