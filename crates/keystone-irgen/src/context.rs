//! Per-session compiler state

use crate::blob::SymbolTable;
use crate::diagnostic::Diagnostic;
use crate::error::{IrGenError, IrGenResult};
use crate::layout::{LayoutCache, MetadataLayout};
use crate::typeinfo::TypeInfo;
use keystone_abi::{Arch, ObjectFormat, TargetAbi};
use keystone_ast::{DeclId, Manifest, NominalDecl, Program};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Code generation options
///
/// Loaded from the `[target]` and `[options]` tables of a manifest or from a
/// standalone TOML file; command-line flags override individual fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Architecture name
    pub arch: String,
    /// Object format name
    pub format: String,
    /// Pointer width override in bytes
    pub pointer_size: Option<u8>,
    /// Insert acquire fences on accessor fast paths
    pub tsan: bool,
    /// Emit reflection sections
    pub emit_reflection: bool,
    /// Omit the cache store that would rewrite the value just loaded
    pub skip_redundant_stores: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            arch: "x86_64".to_string(),
            format: "elf".to_string(),
            pointer_size: None,
            tsan: false,
            emit_reflection: true,
            skip_redundant_stores: true,
        }
    }
}

impl CompileOptions {
    /// Options taken from a manifest's `[target]` and `[options]` tables
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            arch: manifest.target.arch.clone(),
            format: manifest.target.format.clone(),
            tsan: manifest.options.tsan,
            emit_reflection: manifest.options.reflection,
            ..Self::default()
        }
    }

    /// Parse options from TOML text
    pub fn from_toml(source: &str) -> IrGenResult<Self> {
        toml::from_str(source).map_err(|e| IrGenError::InvalidTarget {
            message: e.to_string(),
        })
    }

    /// Resolve the target description
    pub fn target_abi(&self) -> IrGenResult<TargetAbi> {
        let arch: Arch = self.arch.parse().unwrap_or(Arch::Unknown);
        let format: ObjectFormat = self
            .format
            .parse()
            .map_err(|message| IrGenError::InvalidTarget { message })?;
        let mut target = TargetAbi::lookup(arch, format);
        if let Some(size) = self.pointer_size {
            if size != 4 && size != 8 {
                return Err(IrGenError::InvalidTarget {
                    message: format!("unsupported pointer size {}", size),
                });
            }
            target.pointer_size = size;
        }
        Ok(target)
    }
}

/// State shared by every stage of one compilation
pub struct CompilationContext<'a> {
    pub program: &'a Program,
    pub module: String,
    pub target: TargetAbi,
    pub options: CompileOptions,
    pub layouts: LayoutCache,
    pub symbols: SymbolTable,
    pub diagnostics: Vec<Diagnostic>,
}

impl<'a> CompilationContext<'a> {
    pub fn new(
        program: &'a Program,
        module: impl Into<String>,
        options: CompileOptions,
    ) -> IrGenResult<Self> {
        let target = options.target_abi()?;
        Ok(Self {
            program,
            module: module.into(),
            target,
            options,
            layouts: LayoutCache::new(),
            symbols: SymbolTable::new(),
            diagnostics: Vec::new(),
        })
    }

    pub fn pointer_size(&self) -> u8 {
        self.target.pointer_size
    }

    /// Declaration-level queries from this module's point of view
    pub fn types(&self) -> TypeInfo<'_> {
        TypeInfo::new(self.program, &self.module, &self.target)
    }

    pub fn decl(&self, id: DeclId) -> IrGenResult<&'a NominalDecl> {
        self.program.get(id).ok_or(IrGenError::UnknownDecl(id.0))
    }

    /// Metadata layout of a declaration, scanned on first request
    pub fn layout(&mut self, id: DeclId) -> IrGenResult<Arc<MetadataLayout>> {
        let info = TypeInfo::new(self.program, &self.module, &self.target);
        self.layouts.get_or_compute(&info, id)
    }

    pub fn diagnose(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_target() {
        let target = CompileOptions::default().target_abi().unwrap();
        assert_eq!(target.arch, Arch::X86_64);
        assert_eq!(target.pointer_size, 8);
        assert!(!target.objc_interop);
    }

    #[test]
    fn test_options_from_toml() {
        let options = CompileOptions::from_toml(
            "arch = \"arm64\"\nformat = \"macho\"\ntsan = true\npointer_size = 8\n",
        )
        .unwrap();
        assert!(options.tsan);
        assert!(options.emit_reflection);
        let target = options.target_abi().unwrap();
        assert!(target.objc_interop);
        assert_eq!(target.arch, Arch::Arm64);
    }

    #[test]
    fn test_bad_target_is_rejected() {
        let options = CompileOptions {
            format: "a.out".to_string(),
            ..CompileOptions::default()
        };
        assert!(matches!(
            options.target_abi(),
            Err(IrGenError::InvalidTarget { .. })
        ));
        let options = CompileOptions {
            pointer_size: Some(3),
            ..CompileOptions::default()
        };
        assert!(options.target_abi().is_err());
    }

    #[test]
    fn test_manifest_options() {
        let manifest = Manifest::parse(
            "[module]\nname = \"main\"\n[target]\narch = \"i386\"\n[options]\nreflection = false\n",
        )
        .unwrap();
        let options = CompileOptions::from_manifest(&manifest);
        assert!(!options.emit_reflection);
        assert_eq!(options.target_abi().unwrap().pointer_size, 4);
    }
}
