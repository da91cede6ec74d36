//! `keystone demangle`

use crate::output::Output;
use keystone_abi::mangle::demangle_to_string;
use std::io::{BufRead, Write};

/// Readable form of each symbol; reads lines from stdin when none are given
pub fn execute(out: &mut Output, symbols: &[String]) -> anyhow::Result<()> {
    if symbols.is_empty() {
        for line in std::io::stdin().lock().lines() {
            let line = line?;
            writeln!(out.stdout(), "{}", demangle_to_string(line.trim()))?;
        }
        return Ok(());
    }
    for symbol in symbols {
        writeln!(out.stdout(), "{}", demangle_to_string(symbol))?;
    }
    Ok(())
}
