use anyhow::{Context, Result};
use clap::Parser;
use racewatch::cli::{Cli, OutputFormat};
use racewatch::config::InstrumentationConfig;
use racewatch::ir::Module;
use racewatch::json_output::JsonOutput;
use racewatch::pass::{InstrumentationPass, InstrumentedModule};
use racewatch::stats::InstrumentationStats;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(args: &Cli) -> Result<InstrumentationConfig> {
    let base = match &args.config {
        Some(path) => InstrumentationConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => InstrumentationConfig::default(),
    };
    Ok(args.apply_overrides(base))
}

fn print_text(module: &InstrumentedModule, stats: Option<&InstrumentationStats>) {
    println!("{}", module);
    if let Some(stats) = stats {
        stats.print_summary();
    }
}

fn print_json(module: &InstrumentedModule, stats: Option<&InstrumentationStats>) -> Result<()> {
    let mut output = JsonOutput::new(module);
    if let Some(stats) = stats {
        output.set_stats(stats);
    }
    println!("{}", output.to_json()?);
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let config = load_config(&args)?;
    let module = Module::from_file(&args.module)
        .with_context(|| format!("Failed to load module {}", args.module.display()))?;

    let mut pass = InstrumentationPass::new(config);
    let instrumented = pass.run_on_module(&module);
    let stats = args.stats.then(|| pass.stats());

    match args.format {
        OutputFormat::Text => print_text(&instrumented, stats),
        OutputFormat::Json => print_json(&instrumented, stats)?,
    }

    Ok(())
}
