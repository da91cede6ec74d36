//! `keystone serve`: target side of the pipe protocol
//!
//! Loads an image, materializes one instance of the named type and answers
//! mirror requests on stdin/stdout until told to stop.

use anyhow::{anyhow, bail, Context};
use keystone_abi::kind::vwt;
use keystone_abi::mangle::{demangle_symbol, Entity, MangledType, NominalKind};
use keystone_abi::Image;
use keystone_mirror::{InstanceKind, Responder};
use keystone_runtime::Runtime;
use std::path::Path;
use tracing::info;

pub fn execute(image_path: &Path, type_name: &str, existential: bool) -> anyhow::Result<()> {
    let image = Image::read_from_file(image_path)
        .with_context(|| format!("reading {}", image_path.display()))?;
    let runtime = Runtime::new()?;
    runtime.load(&image)?;
    let (kind, address) = materialize(&runtime, &image, type_name, existential)?;
    info!(ty = type_name, ?kind, address, "serving instance");

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let served = Responder::new(&runtime, stdin.lock(), stdout.lock())
        .with_instance(kind, address)
        .serve()?;
    info!(requests = served, "mirror session ended");
    Ok(())
}

/// Access function of the non-generic nominal type called `name`
pub fn find_accessor(image: &Image, name: &str) -> anyhow::Result<(String, NominalKind)> {
    for symbol in &image.symbols {
        if let Ok(Entity::TypeMetadataAccessor(MangledType::Nominal {
            name: found, kind, ..
        })) = demangle_symbol(&symbol.name)
        {
            if found == name {
                return Ok((symbol.name.clone(), kind));
            }
        }
    }
    bail!("image '{}' has no metadata accessor for '{}'", image.module, name)
}

/// Instance handed to the mirror
///
/// Class instances are served as objects unless `existential` is set; every
/// other value is a zeroed value inside an opaque existential container.
fn materialize(
    runtime: &Runtime,
    image: &Image,
    type_name: &str,
    existential: bool,
) -> anyhow::Result<(InstanceKind, u64)> {
    let (accessor, kind) = find_accessor(image, type_name)?;
    let metadata = runtime
        .invoke_symbol(&accessor, &[])
        .with_context(|| format!("calling {}", accessor))?;

    if kind == NominalKind::Class {
        let object = runtime.allocate_object(metadata)?;
        if !existential {
            return Ok((InstanceKind::Object, object));
        }
        let container = runtime.make_existential(metadata, &object.to_le_bytes(), &[])?;
        return Ok((InstanceKind::Existential, container));
    }

    let memory = runtime.memory();
    let table = memory.read_word(metadata.wrapping_sub(8))?;
    let size = memory.read_word(table + vwt::SIZE as u64 * 8)?;
    let size = usize::try_from(size).map_err(|_| anyhow!("{} has size {}", type_name, size))?;
    let container = runtime.make_existential(metadata, &vec![0u8; size], &[])?;
    Ok((InstanceKind::Existential, container))
}
