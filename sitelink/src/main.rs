use clap::{Parser as ClapParser, ValueEnum};
use std::{process, sync::Arc, thread};

use sitelink::{
    Block, CallResult, CallShape, CallSite, CallType, CheckpointSite, CompiledFrame,
    CompiledMethod, DynamicMethod, GlobalSite, LinkerOptions, NativeCall, NativeMethod,
    NativeParam, RaiseError, Runtime, RuntimeCreateInfo, ScopeKind, Signature, StaticScope,
    ThreadContext, Value,
};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    Monomorphic,
    Polymorphic,
    Attribute,
    MethodMissing,
    Globals,
    Safepoint,
}

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scenarios to run, all of them if none are given
    #[arg(value_enum)]
    scenarios: Vec<Scenario>,

    #[arg(long, short, help = "Log every link and global caching decision")]
    verbose: bool,

    #[arg(long, default_value_t = 10_000, help = "Calls per scenario")]
    iterations: i64,

    #[arg(long, help = "Relinks before a call site goes megamorphic")]
    max_fail: Option<u32>,

    #[arg(long, help = "Receiver types a call site keeps chained")]
    max_poly: Option<usize>,

    #[arg(long, help = "Invalidations before a global site stops caching")]
    global_max_fail: Option<u32>,

    #[arg(long, help = "Bind every method through its generic calling convention")]
    generic_only: bool,

    #[arg(long, default_value_t = 4, help = "Threads for the safepoint scenario")]
    threads: usize,
}

impl Cli {
    fn options(&self) -> LinkerOptions {
        let mut options = LinkerOptions::from_env();
        options.log_binding |= self.verbose;
        options.log_globals |= self.verbose;
        if let Some(max_fail) = self.max_fail {
            options.max_fail = max_fail;
        }
        if let Some(max_poly) = self.max_poly {
            options.max_poly = max_poly;
        }
        if let Some(global_max_fail) = self.global_max_fail {
            options.global_max_fail = global_max_fail;
        }
        if self.generic_only {
            options.native_binding = false;
            options.compiled_binding = false;
            options.attr_binding = false;
        }
        options
    }
}

fn add(call: NativeCall<'_>) -> CallResult {
    match (call.receiver, &call.args[0]) {
        (Value::Fixnum(a), Value::Fixnum(b)) => Ok(Value::Fixnum(a.wrapping_add(*b))),
        (_, other) => Err(RaiseError::TypeError(format!(
            "{other} can't be coerced into Integer"
        ))),
    }
}

fn area(_ctx: &mut ThreadContext, frame: CompiledFrame<'_>) -> CallResult {
    match frame.receiver.as_object().map(|o| o.type_ref().name().to_string()) {
        Some(name) if name == "Square" => Ok(Value::Fixnum(4)),
        _ => Ok(Value::Fixnum(3)),
    }
}

fn echo_missing(call: NativeCall<'_>) -> CallResult {
    Ok(Value::array(call.args.to_vec()))
}

fn report(label: &str, site: &CallSite) {
    let stats = site.stats();
    println!(
        "{label:<16} {:<12} links={:<4} failures={:<4} depth={} kind={:?}",
        site.to_string(),
        stats.links,
        stats.failures,
        stats.depth,
        stats.kind
    );
}

fn monomorphic(runtime: &Arc<Runtime>, iterations: i64) -> Result<(), RaiseError> {
    let mut ctx = runtime.new_context();
    runtime.integer_class().define_method(DynamicMethod::native(
        runtime.symbol("+"),
        NativeMethod::new(add, &[NativeParam::Value]),
    ));
    let site = CallSite::new(runtime.symbol("+"), CallShape::fixed(1), CallType::Normal);
    let mut sum = Value::Fixnum(0);
    for i in 0..iterations {
        sum = site.call(&mut ctx, &sum, &[Value::Fixnum(i)], &Block::null())?;
    }
    println!("sum of 0..{iterations} = {sum}");
    report("monomorphic", &site);
    Ok(())
}

fn polymorphic(runtime: &Arc<Runtime>, iterations: i64) -> Result<(), RaiseError> {
    let mut ctx = runtime.new_context();
    let shape = runtime.define_class("Shape", None);
    let scope = Arc::new(
        StaticScope::new(ScopeKind::Method, Vec::new(), None)
            .with_signature(Signature::NO_ARGUMENTS)
            .at("shapes.rb", 1),
    );
    shape.define_method(DynamicMethod::compiled(
        runtime.symbol("corners"),
        CompiledMethod::new(area, scope),
    ));
    let receivers: Vec<_> = ["Triangle", "Square"]
        .into_iter()
        .map(|name| runtime.new_object(&runtime.define_class(name, Some(&shape))))
        .collect();

    let site = CallSite::new(runtime.symbol("corners"), CallShape::fixed(0), CallType::Normal);
    let mut corners = 0;
    for i in 0..iterations {
        let receiver = &receivers[i as usize % receivers.len()];
        corners += site
            .call(&mut ctx, receiver, &[], &Block::null())?
            .as_fixnum()
            .unwrap_or_default();
    }
    println!("corners counted = {corners}");
    report("polymorphic", &site);
    Ok(())
}

fn attribute(runtime: &Arc<Runtime>, iterations: i64) -> Result<(), RaiseError> {
    let mut ctx = runtime.new_context();
    let point = runtime.define_class("Point", None);
    let ivar = runtime.symbol("@x");
    point.define_method(DynamicMethod::attr_reader(runtime.symbol("x"), ivar.clone()));
    point.define_method(DynamicMethod::attr_writer(runtime.symbol("x="), ivar));
    let receiver = runtime.new_object(&point);

    let reader = CallSite::new(runtime.symbol("x"), CallShape::fixed(0), CallType::Normal);
    let writer = CallSite::new(runtime.symbol("x="), CallShape::fixed(1), CallType::Normal);
    println!("unset x = {}", reader.call(&mut ctx, &receiver, &[], &Block::null())?);
    for i in 0..iterations {
        writer.call(&mut ctx, &receiver, &[Value::Fixnum(i)], &Block::null())?;
    }
    println!("x = {}", reader.call(&mut ctx, &receiver, &[], &Block::null())?);
    report("attr reader", &reader);
    report("attr writer", &writer);
    Ok(())
}

fn method_missing(runtime: &Arc<Runtime>) -> Result<(), RaiseError> {
    let mut ctx = runtime.new_context();
    let ghost = runtime.define_class("Ghost", None);
    ghost.define_method(DynamicMethod::native(
        runtime.method_missing_name().clone(),
        NativeMethod::new(echo_missing, &[NativeParam::Values]),
    ));
    let receiver = runtime.new_object(&ghost);
    let site = CallSite::new(runtime.symbol("boo"), CallShape::variadic(), CallType::Normal);
    let result = site.call(
        &mut ctx,
        &receiver,
        &[Value::Fixnum(1), Value::string("two")],
        &Block::null(),
    )?;
    println!("method_missing received {result}");
    report("method_missing", &site);

    let plain = runtime.new_object(&runtime.define_class("Plain", None));
    if let Err(error) = site.call(&mut ctx, &plain, &[], &Block::null()) {
        println!("without a handler: {error}");
    }
    Ok(())
}

fn globals(runtime: &Arc<Runtime>, iterations: i64) {
    let ctx = runtime.new_context();
    let stable = GlobalSite::new(runtime.symbol("$config"), "globals.rb", 1);
    let churn = GlobalSite::new(runtime.symbol("$counter"), "globals.rb", 2);
    stable.set(&ctx, Value::string("production"));
    for i in 0..iterations {
        stable.get(&ctx);
        churn.set(&ctx, Value::Fixnum(i));
        churn.get(&ctx);
    }
    for site in [&stable, &churn] {
        println!(
            "{:<28} value={} failures={} demoted={}",
            site.to_string(),
            site.get(&ctx),
            site.failures(),
            site.is_demoted()
        );
    }
}

fn safepoint(runtime: &Arc<Runtime>, threads: usize) {
    let site = Arc::new(CheckpointSite::new());
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let mut ctx = runtime.new_context();
            let site = site.clone();
            let id = ctx.id();
            let handle = thread::spawn(move || {
                let mut spins = 0u64;
                loop {
                    if let Err(error) = site.poll(&mut ctx) {
                        return (spins, error);
                    }
                    spins += 1;
                    thread::yield_now();
                }
            });
            (id, handle)
        })
        .collect();

    for (id, _) in &workers {
        runtime.interrupt(*id, RaiseError::Raised(Value::string("stop")));
    }
    for (id, handle) in workers {
        match handle.join() {
            Ok((spins, error)) => println!("{id:?} stopped after {spins} polls: {error}"),
            Err(_) => println!("{id:?} panicked"),
        }
    }
    println!("checkpoint slow paths = {}", site.slow_paths());
}

fn run(cli: &Cli) -> Result<(), RaiseError> {
    let runtime = Runtime::new(RuntimeCreateInfo {
        options: cli.options(),
        ..Default::default()
    });
    let scenarios = if cli.scenarios.is_empty() {
        Scenario::value_variants().to_vec()
    } else {
        cli.scenarios.clone()
    };
    for scenario in scenarios {
        println!("== {scenario:?} ==");
        match scenario {
            Scenario::Monomorphic => monomorphic(&runtime, cli.iterations)?,
            Scenario::Polymorphic => polymorphic(&runtime, cli.iterations)?,
            Scenario::Attribute => attribute(&runtime, cli.iterations)?,
            Scenario::MethodMissing => method_missing(&runtime)?,
            Scenario::Globals => globals(&runtime, cli.iterations),
            Scenario::Safepoint => safepoint(&runtime, cli.threads),
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let default_filter = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    if let Err(error) = run(&cli) {
        eprintln!("Error: {error}");
        process::exit(1);
    }
}
