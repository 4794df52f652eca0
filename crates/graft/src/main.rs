use crate::args::Args;
use clap::Parser;
use graft_ir::IrContext;
use graft_jit::{JitConfig, JitSession};
use owo_colors::OwoColorize;
use owo_colors::Stream::Stderr;
use std::io::stderr;
use std::process::ExitCode;
use tracing::metadata::LevelFilter;
use tracing::{debug, error, info, trace};
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{Layer, Registry};

mod args;

/// Every function run by graft has this shape
type Entry = extern "C" fn(i64) -> i32;

fn main() -> eyre::Result<ExitCode> {
    color_eyre::install()?;
    let args = Args::parse();
    init_logging(args.logging().log_level_filter())?;
    trace!("starting graft with args: {args:?}");
    debug!("graft version: {}", env!("CARGO_PKG_VERSION"));

    let context = IrContext::new();
    let mut module_a = context.read_module(&args.module_a)?;
    let module_b = context.read_module(&args.module_b)?;
    args.plan().apply(&mut module_a, &module_b)?;

    eprint!("{module_a}");

    let config = JitConfig::default().opt_level(args.opt_level);
    let mut session = match JitSession::new(config) {
        Ok(session) => session,
        Err(e) => {
            error!("could not create jit session: {e}");
            eprintln!(
                "{} {e}",
                "EE Error:".if_supports_color(Stderr, |text| text.bright_red())
            );
            return Ok(ExitCode::FAILURE);
        }
    };
    session.load(&module_a)?;

    for name in &args.run {
        // get checks the signature, the module was verified by load
        let function = unsafe { session.get::<Entry>(name)? };
        let result = function(args.arg);
        info!("%{name} returned {result}");
        println!("{name}({}) = {result}", args.arg);
    }

    Ok(ExitCode::SUCCESS)
}

fn init_logging(level_filter: LevelFilter) -> eyre::Result<()> {
    let registry = Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .event_format(format().with_thread_ids(true))
                .with_writer(stderr)
                .with_filter(level_filter),
        )
        .with(ErrorLayer::default());

    tracing::subscriber::set_global_default(registry)?;

    Ok(())
}
