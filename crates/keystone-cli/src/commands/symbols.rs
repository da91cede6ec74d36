//! `keystone symbols`: every symbol a manifest compiles to

use super::{compile_manifest, CompileFlags};
use crate::output::Output;
use keystone_abi::mangle::demangle_to_string;
use std::io::Write;
use std::path::Path;

pub fn execute(out: &mut Output, manifest: &Path, demangle: bool, flags: &CompileFlags) -> anyhow::Result<()> {
    let compilation = compile_manifest(out, manifest, flags)?;
    for symbol in &compilation.symbols {
        if demangle {
            writeln!(out.stdout(), "{}  {}", symbol, demangle_to_string(symbol))?;
        } else {
            writeln!(out.stdout(), "{}", symbol)?;
        }
    }
    Ok(())
}
