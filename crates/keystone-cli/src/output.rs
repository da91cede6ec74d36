//! Terminal output: color selection, headings and compiler diagnostics

use clap::ValueEnum;
use keystone_irgen::{emit_diagnostics, Diagnostic};
use std::io::{self, Write};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ColorWhen {
    #[default]
    Auto,
    Always,
    Never,
}

/// `NO_COLOR` beats `--color`, which beats terminal detection
pub fn resolve_color_choice(flag: ColorWhen) -> ColorChoice {
    if std::env::var_os("NO_COLOR").is_some() {
        return ColorChoice::Never;
    }
    match flag {
        ColorWhen::Always => ColorChoice::Always,
        ColorWhen::Never => ColorChoice::Never,
        ColorWhen::Auto => ColorChoice::Auto,
    }
}

/// Styled stdout and stderr
pub struct Output {
    stdout: StandardStream,
    stderr: StandardStream,
}

impl Output {
    pub fn new(choice: ColorChoice) -> Self {
        Self {
            stdout: StandardStream::stdout(choice),
            stderr: StandardStream::stderr(choice),
        }
    }

    pub fn stdout(&mut self) -> &mut StandardStream {
        &mut self.stdout
    }

    /// Bold section title on stdout
    pub fn heading(&mut self, text: &str) -> io::Result<()> {
        self.stdout.set_color(ColorSpec::new().set_bold(true))?;
        writeln!(self.stdout, "{}", text)?;
        self.stdout.reset()
    }

    /// Dimmed detail text without a newline
    pub fn dim(&mut self, text: &str) -> io::Result<()> {
        self.stdout
            .set_color(ColorSpec::new().set_fg(Some(Color::Cyan)))?;
        write!(self.stdout, "{}", text)?;
        self.stdout.reset()
    }

    /// Render diagnostics against manifest source on stderr
    pub fn diagnostics(&mut self, file_name: &str, source: &str, diagnostics: &[Diagnostic]) -> anyhow::Result<()> {
        if diagnostics.is_empty() {
            return Ok(());
        }
        emit_diagnostics(&mut self.stderr, file_name, source, diagnostics)?;
        Ok(())
    }
}
