//! `keystone reflect-test`: drive the mirror against a `serve` child process

use crate::output::Output;
use anyhow::{bail, Context};
use keystone_abi::mangle::{MangledType, NominalKind};
use keystone_mirror::{InstanceKind, PipeMemoryReader, ReflectionContext};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

pub fn execute(out: &mut Output, image: &Path, type_name: &str, existential: bool) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("locating the keystone executable")?;
    let mut command = Command::new(exe);
    command
        .arg("serve")
        .arg(image)
        .arg("--type")
        .arg(type_name)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    if existential {
        command.arg("--existential");
    }
    let mut child = command.spawn().context("starting keystone serve")?;
    let (Some(to_target), Some(from_target)) = (child.stdin.take(), child.stdout.take()) else {
        bail!("serve process has no pipes");
    };

    let mut cx = ReflectionContext::new(PipeMemoryReader::new(from_target, to_target));
    let result = inspect(out, &mut cx);
    // Closing our end of the pipes lets the child exit even if a query failed.
    let finished = cx.reader().done();
    drop(cx);
    let status = child.wait().context("waiting for keystone serve")?;
    result?;
    finished?;
    if !status.success() {
        bail!("keystone serve exited with {}", status);
    }
    Ok(())
}

fn inspect<R: Read, W: Write>(
    out: &mut Output,
    cx: &mut ReflectionContext<PipeMemoryReader<R, W>>,
) -> anyhow::Result<()> {
    for info in cx.reader().reflection_infos()? {
        cx.add_reflection_info(&info)?;
    }
    let kind = cx.reader().instance_kind()?;
    let address = cx.reader().instance_address()?;
    debug!(?kind, address, "instance from target");

    let (typeref, info) = match kind {
        InstanceKind::Object => {
            let typeref = cx.typeref_for_instance(address)?;
            (typeref, cx.info_for_instance(address)?)
        }
        InstanceKind::Existential => {
            let any = cx.intern(MangledType::Existential(Vec::new()));
            let (typeref, start) = cx.project_existential(address, any)?;
            let is_class = matches!(
                cx.typeref(typeref)?,
                MangledType::Nominal {
                    kind: NominalKind::Class,
                    ..
                }
            );
            let info = if is_class {
                cx.info_for_instance(start)?
            } else {
                cx.info_for_typeref(typeref)?
            };
            writeln!(out.stdout(), "start address {:#x}", start)?;
            (typeref, info)
        }
        InstanceKind::None => bail!("target has no instance to inspect"),
    };

    out.heading("type reference")?;
    writeln!(out.stdout(), "{}", cx.dump_typeref(typeref)?)?;
    writeln!(out.stdout())?;
    out.heading("type info")?;
    writeln!(out.stdout(), "{}", info.dump())?;
    Ok(())
}
