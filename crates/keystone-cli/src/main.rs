//! Keystone command-line driver
//!
//! Compiles type declaration manifests to metadata images, inspects images,
//! and exercises the remote mirror against a live target process.

mod commands;
mod logging;
mod output;

use clap::{Parser, Subcommand};
use commands::CompileFlags;
use logging::{LogConfig, LogFormat, LogLevel};
use output::{resolve_color_choice, ColorWhen, Output};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keystone")]
#[command(about = "Type metadata compiler and remote mirror", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level; overrides KEYSTONE_LOG
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "compact")]
    log_format: LogFormat,

    /// When to color output
    #[arg(long, global = true, value_enum, default_value = "auto")]
    color: ColorWhen,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the metadata record layout of each declared type
    Layout {
        /// Manifest file
        manifest: PathBuf,
        /// Only this type
        #[arg(long = "type")]
        type_name: Option<String>,
        /// Print layouts as JSON
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        flags: CompileFlags,
    },

    /// Print every emitted symbol name
    Symbols {
        /// Manifest file
        manifest: PathBuf,
        /// Also print readable forms
        #[arg(short, long)]
        demangle: bool,
        #[command(flatten)]
        flags: CompileFlags,
    },

    /// Compile a manifest and write the linked image
    Emit {
        /// Manifest file
        manifest: PathBuf,
        /// Image file to write
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        flags: CompileFlags,
    },

    /// Print the header, sections, symbols and reflection records of an image
    Inspect {
        /// Image file
        image: PathBuf,
        /// Print a JSON summary instead
        #[arg(long)]
        json: bool,
    },

    /// Print readable forms of mangled symbols or types
    Demangle {
        /// Mangled names; stdin lines when omitted
        symbols: Vec<String>,
    },

    /// Load an image and answer mirror requests on stdin/stdout
    Serve {
        /// Image file
        image: PathBuf,
        /// Type to instantiate
        #[arg(long = "type")]
        type_name: String,
        /// Serve the instance inside an existential container
        #[arg(long)]
        existential: bool,
    },

    /// Run `serve` as a child process and inspect its instance over pipes
    ReflectTest {
        /// Image file
        image: PathBuf,
        /// Type to instantiate
        #[arg(long = "type")]
        type_name: String,
        /// Serve the instance inside an existential container
        #[arg(long)]
        existential: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let choice = resolve_color_choice(cli.color);
    LogConfig::new()
        .level(cli.log_level)
        .format(cli.log_format)
        .color(choice)
        .init();
    let mut out = Output::new(choice);

    match cli.command {
        Commands::Layout {
            manifest,
            type_name,
            json,
            flags,
        } => commands::layout::execute(&mut out, &manifest, type_name.as_deref(), json, &flags),
        Commands::Symbols {
            manifest,
            demangle,
            flags,
        } => commands::symbols::execute(&mut out, &manifest, demangle, &flags),
        Commands::Emit {
            manifest,
            output,
            flags,
        } => commands::emit::execute(&mut out, &manifest, &output, &flags),
        Commands::Inspect { image, json } => commands::inspect::execute(&mut out, &image, json),
        Commands::Demangle { symbols } => commands::demangle::execute(&mut out, &symbols),
        Commands::Serve {
            image,
            type_name,
            existential,
        } => commands::serve::execute(&image, &type_name, existential),
        Commands::ReflectTest {
            image,
            type_name,
            existential,
        } => commands::reflect::execute(&mut out, &image, &type_name, existential),
    }
}
