use anyhow::{Context, Result};
use clap::Parser;
use diverdown::cli::{Cli, OutputFormat};
use diverdown::config::TracerConfig;
use diverdown::definition::Definition;
use diverdown::engine::Engine;
use diverdown::filter::EventFilter;
use diverdown::script::Program;
use diverdown::tracer::Tracer;
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

/// Print one line per recorded method call between sources
fn print_text(definition: &Definition) {
    match &definition.definition_group {
        Some(group) => println!("# {} [{}]", definition.title, group),
        None => println!("# {}", definition.title),
    }

    for source in definition.sources() {
        let mut dependencies = source.dependencies().peekable();
        if dependencies.peek().is_none() {
            println!("{}", source.source_name);
            continue;
        }
        for dependency in dependencies {
            for method_id in dependency.method_ids() {
                let paths: Vec<&str> = method_id.paths.iter().map(String::as_str).collect();
                println!(
                    "{} -> {}{}  {}",
                    source.source_name,
                    dependency.source_name,
                    method_id.human_method_name(),
                    paths.join(", ")
                );
            }
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let mut config = match &args.config {
        Some(path) => TracerConfig::from_file(path)?,
        None => TracerConfig::default(),
    };

    // The command line expression wins over the config file
    if let Some(expr) = args.filter {
        EventFilter::from_expr(&expr)?;
        config.trace = Some(expr);
    }

    let program = Program::from_file(&args.script)?;
    let engine = Engine::new();
    let script = program.install(&engine)?;

    let tracer = Tracer::new(&engine.space(), &config).context("Failed to configure tracer")?;
    let title = args.title.or(config.title).unwrap_or_default();
    let group = args.group.or(config.definition_group);

    let definition = tracer
        .trace(&engine, &title, group.as_deref(), || script.run(&engine))
        .context("Trace failed")?;

    match args.format {
        OutputFormat::Text => print_text(&definition),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&definition)
                .context("Failed to serialize definition")?;
            println!("{}", json);
        }
    }

    Ok(())
}
