//! The `callstubs` command line tool.
//!
//! Emits snippets and thunks for a target and prints what was generated.
//! See `callstubs --help` for usage.

use anyhow::{Context, Result, anyhow};
use callstubs::buffer::{CodeBuffer, Section};
use callstubs::gc::GcMapRegistry;
use callstubs::reloc::RelocTarget;
use callstubs::snippet::SnippetLayout;
use callstubs::{
    CallDescriptor, CallKind, Config, ConstantPoolRef, Environment, HelperTable, SnippetRequest,
    SnippetSet, TerseSignature,
};
use clap::Parser;
use std::path::PathBuf;
use std::str::FromStr;
use target_lexicon::Triple;

/// Inspect out-of-line call snippets and interpreter-bridge thunks.
#[derive(Parser)]
#[command(name = "callstubs", version)]
struct Callstubs {
    /// TOML configuration file.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Parser)]
enum Subcommand {
    /// Emits the snippet of one call site
    Layout(LayoutCommand),
    /// Emits the interpreter-bridge thunk of a signature
    Thunk(ThunkCommand),
}

#[derive(clap::ValueEnum, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Static,
    Special,
    Virtual,
    Interface,
    Native,
    MethodHandle,
    Osr,
}

impl From<Kind> for CallKind {
    fn from(kind: Kind) -> CallKind {
        match kind {
            Kind::Static => CallKind::Static,
            Kind::Special => CallKind::Special,
            Kind::Virtual => CallKind::Virtual,
            Kind::Interface => CallKind::Interface,
            Kind::Native => CallKind::Native,
            Kind::MethodHandle => CallKind::MethodHandle,
            Kind::Osr => CallKind::OsrInduction,
        }
    }
}

/// Emits the snippet of one call site.
#[derive(Parser)]
struct LayoutCommand {
    /// Target triple.
    #[arg(long, default_value = "x86_64-unknown-linux-gnu")]
    target: String,

    /// Terse signature of the call, such as `(IJL)J`.
    #[arg(long, default_value = "()V")]
    signature: String,

    /// How the call dispatches.
    #[arg(long, value_enum, default_value = "static")]
    kind: Kind,

    /// The callee is not resolved yet.
    #[arg(long)]
    unresolved: bool,

    /// The callee is synchronized.
    #[arg(long)]
    sync: bool,

    /// The callee is a native method.
    #[arg(long)]
    native: bool,
}

/// Emits the interpreter-bridge thunk of a signature.
#[derive(Parser)]
struct ThunkCommand {
    /// Target triple.
    #[arg(long, default_value = "x86_64-unknown-linux-gnu")]
    target: String,

    /// Terse signature, such as `(IJL)J`.
    #[arg(long)]
    signature: String,
}

const HELPER_BASE: u64 = 0x0800_0000;
const CODE_BASE: u64 = 0x1000_0000;
const CONSTANT_POOL: u64 = 0x0c00_0000;
const METHOD: u64 = 0x0d00_0040;

fn environment(target: &str, config: Option<&PathBuf>) -> Result<Environment> {
    let triple = Triple::from_str(target).map_err(|e| anyhow!("bad target `{target}`: {e}"))?;
    let mut config = match config {
        Some(path) => Config::from_file(path)?,
        None => Config::new(),
    };
    if config.code_cache().address_base.is_none() {
        config.address_base(CODE_BASE);
    }
    Ok(Environment::new(
        triple,
        config,
        HelperTable::synthetic(HELPER_BASE, 0x40),
    )?)
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_layout(layout: &SnippetLayout) {
    let p = layout.pointer_size;
    println!("layout ({p}-byte pointers):");
    println!("  flush            {:>4} bytes", layout.flush_len);
    println!("  branch           {:>4} bytes", layout.branch_len);
    println!("  padding          {:>4} bytes", layout.padding);
    println!("  data             {:>4} bytes", layout.data_len);
    println!("  +{:<4} return address", layout.return_address);
    println!("  +{:<4} constant pool", layout.constant_pool);
    println!("  +{:<4} constant-pool index", layout.cp_index);
    if let Some(off) = layout.method {
        println!("  +{off:<4} method pointer");
    }
    if let Some(off) = layout.thunk {
        println!("  +{off:<4} thunk pointer");
    }
    if let Some(cache) = layout.cache {
        println!("  +{:<4} {} cache slots", cache.slots, cache.slot_count);
        println!("  +{:<4} cache state", cache.state);
    }
    println!("  +{:<4} dispatch helper index", layout.dispatch_helper);
    println!("  +{:<4} lock word", layout.lock_word);
}

impl LayoutCommand {
    fn execute(&self, config: Option<&PathBuf>) -> Result<()> {
        let env = environment(&self.target, config)?;
        let isa = env.isa();
        let sig = TerseSignature::parse(&self.signature)?;
        let kind = if self.native {
            CallKind::Native
        } else {
            self.kind.into()
        };
        let cp = ConstantPoolRef {
            address: CONSTANT_POOL,
            index: 1,
        };
        let mut desc = CallDescriptor::new(kind, sig.args(), sig.ret(), cp).with_method(METHOD);
        if self.unresolved {
            desc = desc.unresolved();
        }
        if self.sync {
            desc = desc.synchronized();
        }

        // A one-call method to wire to the snippet.
        let method_len = isa.branch_len();
        let method = env.code_cache().reserve(method_len, 16)?;

        let mut set = SnippetSet::new();
        let label = set.add(&env, SnippetRequest::new(desc, method_len).live_registers(1))?;
        set.wire_call_site(&env, 0, label)?;
        set.layout(&env)?;

        let mut call = CodeBuffer::new(Section::Method, method.addr, method_len);
        isa.emit_call(&mut call, RelocTarget::SnippetEntry(label))?;
        env.code_cache().write(method.addr, call.data())?;

        let mut gc_maps = GcMapRegistry::new();
        let stubs = set.emit(&env, &mut gc_maps)?;
        let event = stubs.link(&env, method.addr)?;

        let snippet = stubs
            .snippet(label)
            .ok_or_else(|| anyhow!("{label} was not emitted"))?;
        println!("target:  {} ({})", isa.triple(), isa.name());
        println!("snippet: {} {}", snippet.kind(), label);
        println!("helper:  {} (#{})", snippet.helper(), snippet.helper().index());
        println!("entry:   {:#x}", snippet.entry());
        print_layout(snippet.layout());

        let bytes = env.code_cache().read(snippet.entry(), snippet.len() as usize)?;
        println!("bytes:");
        for (i, chunk) in bytes.chunks(16).enumerate() {
            println!("  {:#010x}  {}", snippet.entry() + 16 * i as u64, hex(chunk));
        }
        println!("relocations:");
        for record in stubs.relocations().records() {
            println!("  {record}");
        }
        let pending: Vec<_> = event.pending().collect();
        if !pending.is_empty() {
            println!("pending until resolution:");
            for (_, record) in pending {
                println!("  {record}");
            }
        }
        for (addr, mask) in gc_maps.iter() {
            println!("gc map:  {addr:#x} live {mask:#x}");
        }
        if !env.trampolines().is_empty() {
            println!("trampolines: {}", env.trampolines().len());
        }
        Ok(())
    }
}

impl ThunkCommand {
    fn execute(&self, config: Option<&PathBuf>) -> Result<()> {
        let env = environment(&self.target, config)?;
        let sig = TerseSignature::parse(&self.signature)?;
        let thunk = env
            .get_or_create_thunk(&sig)
            .with_context(|| format!("failed to generate the thunk for `{sig}`"))?;
        println!("thunk {} at {:#x}, {} bytes", thunk.signature(), thunk.entry(), thunk.len());
        let bytes = env.code_cache().read(thunk.entry(), thunk.len() as usize)?;
        println!("  {}", hex(&bytes));
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Callstubs::parse();
    let config = args.config.as_ref();
    match args.subcommand {
        Subcommand::Layout(c) => c.execute(config),
        Subcommand::Thunk(c) => c.execute(config),
    }
}
