//! Diagnostics for features the compiler cannot lower yet
//!
//! These never stop compilation: the emitter substitutes a placeholder and
//! keeps going so one run reports every problem in the manifest.

use codespan_reporting::diagnostic::{Diagnostic as CsDiagnostic, Label};
use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term;
use codespan_reporting::term::termcolor::WriteColor;
use keystone_ast::Span;

pub use codespan_reporting::diagnostic::Severity;

/// Error code for a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub &'static str);

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        self.0
    }
}

/// Feature not supported by the metadata emitter
pub const UNIMPLEMENTED: ErrorCode = ErrorCode("K0001");
/// Conformance is missing an associated type witness
pub const MISSING_WITNESS: ErrorCode = ErrorCode("K0002");

/// A compiler message, optionally tied to a manifest location
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<ErrorCode>,
    pub message: String,
    pub span: Option<Span>,
    pub label: Option<String>,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: None,
            message: message.into(),
            span: None,
            label: None,
            notes: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    /// "unimplemented: ..." error
    pub fn unimplemented(feature: impl AsRef<str>) -> Self {
        Self::error(format!("unimplemented: {}", feature.as_ref())).with_code(UNIMPLEMENTED)
    }

    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the primary location
    pub fn with_span(mut self, span: Option<Span>, label: impl Into<String>) -> Self {
        self.span = span;
        self.label = Some(label.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity >= Severity::Error
    }

    /// Convert to a codespan diagnostic against file `file_id`
    pub fn to_codespan(&self, file_id: usize) -> CsDiagnostic<usize> {
        let mut inner = CsDiagnostic::new(self.severity).with_message(&self.message);
        if let Some(code) = self.code {
            inner = inner.with_code(code.0);
        }
        if let Some(span) = self.span {
            let label = Label::primary(file_id, span.start..span.end)
                .with_message(self.label.clone().unwrap_or_default());
            inner = inner.with_labels(vec![label]);
        }
        inner.with_notes(self.notes.clone())
    }
}

/// Render diagnostics against the manifest they came from
pub fn emit_diagnostics(
    writer: &mut dyn WriteColor,
    file_name: &str,
    source: &str,
    diagnostics: &[Diagnostic],
) -> Result<(), codespan_reporting::files::Error> {
    let mut files = SimpleFiles::new();
    let file_id = files.add(file_name.to_string(), source.to_string());
    let config = term::Config::default();
    for diagnostic in diagnostics {
        term::emit(writer, &config, &files, &diagnostic.to_codespan(file_id))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codespan_reporting::term::termcolor::NoColor;

    #[test]
    fn test_unimplemented_is_an_error() {
        let diag = Diagnostic::unimplemented("metadata for generic function types");
        assert!(diag.is_error());
        assert_eq!(diag.code, Some(UNIMPLEMENTED));
        assert!(diag.message.starts_with("unimplemented: "));
        assert!(!Diagnostic::warning("w").is_error());
    }

    #[test]
    fn test_render_with_span() {
        let source = "[[types]]\nname = \"Box\"\n";
        let diag = Diagnostic::unimplemented("thing")
            .with_span(Some(Span::new(10, 22)), "declared here")
            .with_note("placeholder emitted");
        let mut out = NoColor::new(Vec::new());
        emit_diagnostics(&mut out, "types.toml", source, &[diag]).unwrap();
        let text = String::from_utf8(out.into_inner()).unwrap();
        assert!(text.contains("error[K0001]: unimplemented: thing"));
        assert!(text.contains("types.toml"));
        assert!(text.contains("declared here"));
        assert!(text.contains("placeholder emitted"));
    }
}
