use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pybridge::bridge::host::Symbols;
use pybridge::bridge::step::gate::runtime_gates;
use pybridge::bridge::ProcessContext;
use pybridge::config::BridgeConfig;
use pybridge::linux::LinuxProcess;
use pybridge::version;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file, `~/.config/pybridge/config.toml` if omitted
    #[arg(long, env = "PYBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose attach and resolve diagnostics
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Locate and print the debug offsets header of a running interpreter
    Offsets { pid: u32 },
    /// Ask a running interpreter to execute a loader script
    Attach { pid: u32, loader: PathBuf },
    /// List step-in gates of the interpreter runtime
    Gates { pid: u32 },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::load(args.config.as_deref());
    config.verbose |= args.verbose;
    pybridge::log::set_verbose(config.verbose);
    let default_level = if config.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    match args.command {
        Command::Offsets { pid } => {
            let (process, mut ctx) = open(pid, config)?;
            let offsets = ctx
                .ensure_offsets(&process)
                .context("debug offsets not available")?;
            println!("version:               {}", offsets.runtime_version());
            println!("layout:                {:?}", offsets.layout);
            println!("free threaded:         {}", offsets.is_free_threaded());
            println!("remote debug disabled: {}", offsets.is_remote_debug_disabled());
            println!("eval breaker:          {}", offsets.eval_breaker);
            println!("remote support offset: {:#X}", offsets.remote_support_offset);
            println!("pending call offset:   {:#X}", offsets.pending_call_offset);
            println!("script path offset:    {:#X}", offsets.script_path_offset);
            println!("script path size:      {}", offsets.script_path_size);
            if !version::is_known_attach_version(offsets.runtime_version()) {
                println!(
                    "warning: remote attach is known to work on {} only",
                    version::supported_versions_to_string()
                );
            }
        }
        Command::Attach { pid, loader } => {
            let (process, mut ctx) = open(pid, config)?;
            let outcome = ctx.attach(&process, &loader);
            println!("{outcome}");
            if !outcome.is_success() {
                bail!("attach to process {pid} failed");
            }
        }
        Command::Gates { pid } => {
            let (process, ctx) = open(pid, config)?;
            let modules = ctx.modules();
            for gate in runtime_gates(modules.version()) {
                let addr = process
                    .function_address(&modules.runtime, gate.function)
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|| "not found".to_string());
                let exits = if gate.multiple_exits { "multiple exits" } else { "" };
                println!("{:<24} {addr:<18} {exits}", gate.function);
            }
        }
    }

    Ok(())
}

fn open(pid: u32, config: BridgeConfig) -> anyhow::Result<(LinuxProcess, ProcessContext)> {
    let process = LinuxProcess::new(pid)?;
    let runtime = process
        .runtime_module()
        .with_context(|| format!("process {pid} doesn't run an interpreter"))?;
    Ok((process, ProcessContext::new(config, runtime)))
}
