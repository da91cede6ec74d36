//! Target ABI description
//!
//! Per-architecture pointer facts: which bits of a heap object pointer are
//! always zero (spare bits), which bits a foreign object model reserves for
//! tagged pointers, and the lowest address a valid heap pointer can have.
//! The facts live in a table rather than in platform checks so adding a
//! platform is a data change.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instruction set architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    /// x86-64
    X86_64,
    /// 64-bit ARM
    Arm64,
    /// 32-bit x86
    I386,
    /// 32-bit ARM
    Arm,
    /// 64-bit PowerPC
    PowerPC64,
    /// IBM Z
    S390x,
    /// Anything not in the table
    Unknown,
}

impl FromStr for Arch {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "x86_64" | "amd64" => Arch::X86_64,
            "arm64" | "aarch64" => Arch::Arm64,
            "i386" | "i686" | "x86" => Arch::I386,
            "arm" | "armv7" | "armv7k" => Arch::Arm,
            "powerpc64" | "powerpc64le" | "ppc64le" => Arch::PowerPC64,
            "s390x" => Arch::S390x,
            _ => Arch::Unknown,
        })
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm64 => "arm64",
            Arch::I386 => "i386",
            Arch::Arm => "arm",
            Arch::PowerPC64 => "powerpc64",
            Arch::S390x => "s390x",
            Arch::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Object file format, which decides whether foreign object-model interop applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectFormat {
    /// Mach-O (Objective-C interop platforms)
    MachO,
    /// ELF
    Elf,
    /// COFF
    Coff,
    /// WebAssembly
    Wasm,
}

impl FromStr for ObjectFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "macho" | "mach-o" => Ok(ObjectFormat::MachO),
            "elf" => Ok(ObjectFormat::Elf),
            "coff" | "pe" => Ok(ObjectFormat::Coff),
            "wasm" => Ok(ObjectFormat::Wasm),
            other => Err(format!("unknown object format '{}'", other)),
        }
    }
}

/// Resolved pointer facts for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAbi {
    /// Architecture
    pub arch: Arch,
    /// Object format
    pub format: ObjectFormat,
    /// Pointer width in bytes
    pub pointer_size: u8,
    /// Bits guaranteed zero in any native heap object pointer
    pub spare_bits: u64,
    /// Bits reserved by the foreign object model's tagged pointers
    pub reserved_bits: u64,
    /// No valid heap pointer is below this value
    pub least_valid_pointer: u64,
    /// Whether classes interoperate with the Objective-C runtime
    pub objc_interop: bool,
}

struct AbiEntry {
    arch: Arch,
    pointer_size: u8,
    spare_bits: u64,
    foreign_reserved_bits: u64,
    least_valid_pointer: u64,
}

/// Architecture table. Foreign reserved bits apply only on interop formats.
const ABI_TABLE: &[AbiEntry] = &[
    AbiEntry {
        arch: Arch::X86_64,
        pointer_size: 8,
        spare_bits: 0xF000_0000_0000_0006,
        foreign_reserved_bits: 0x8000_0000_0000_0001,
        least_valid_pointer: 4096,
    },
    AbiEntry {
        arch: Arch::Arm64,
        pointer_size: 8,
        spare_bits: 0xF000_0000_0000_0007,
        foreign_reserved_bits: 0x8000_0000_0000_0000,
        least_valid_pointer: 4096,
    },
    AbiEntry {
        arch: Arch::I386,
        pointer_size: 4,
        spare_bits: 0x0000_0003,
        foreign_reserved_bits: 0,
        least_valid_pointer: 4096,
    },
    AbiEntry {
        arch: Arch::Arm,
        pointer_size: 4,
        spare_bits: 0x0000_0003,
        foreign_reserved_bits: 0,
        least_valid_pointer: 4096,
    },
    AbiEntry {
        arch: Arch::PowerPC64,
        pointer_size: 8,
        spare_bits: 0xF000_0000_0000_0007,
        foreign_reserved_bits: 0,
        least_valid_pointer: 4096,
    },
    AbiEntry {
        arch: Arch::S390x,
        pointer_size: 8,
        spare_bits: 0x0000_0000_0000_0007,
        foreign_reserved_bits: 0,
        least_valid_pointer: 4096,
    },
];

impl TargetAbi {
    /// Look up the pointer facts for an architecture and object format
    ///
    /// Unknown architectures get the most conservative answer: no spare or
    /// reserved bits, a least valid pointer of 1, and 8-byte pointers.
    pub fn lookup(arch: Arch, format: ObjectFormat) -> Self {
        let objc_interop = format == ObjectFormat::MachO;
        match ABI_TABLE.iter().find(|e| e.arch == arch) {
            Some(entry) => TargetAbi {
                arch,
                format,
                pointer_size: entry.pointer_size,
                spare_bits: entry.spare_bits,
                reserved_bits: if objc_interop {
                    entry.foreign_reserved_bits
                } else {
                    0
                },
                least_valid_pointer: entry.least_valid_pointer,
                objc_interop,
            },
            None => TargetAbi {
                arch,
                format,
                pointer_size: 8,
                spare_bits: 0,
                reserved_bits: 0,
                least_valid_pointer: 1,
                objc_interop,
            },
        }
    }

    /// Target of the running process
    pub fn host() -> Self {
        let arch = std::env::consts::ARCH.parse().unwrap_or(Arch::Unknown);
        let format = if cfg!(target_os = "macos") || cfg!(target_os = "ios") {
            ObjectFormat::MachO
        } else if cfg!(windows) {
            ObjectFormat::Coff
        } else {
            ObjectFormat::Elf
        };
        let mut abi = Self::lookup(arch, format);
        abi.pointer_size = std::mem::size_of::<usize>() as u8;
        abi
    }

    /// Spare bits usable for tagging native object pointers
    ///
    /// Bits reserved by the foreign object model are never available.
    pub fn usable_spare_bits(&self) -> u64 {
        self.spare_bits & !self.reserved_bits
    }

    /// Mask of bits that fit in one word
    pub fn word_mask(&self) -> u64 {
        if self.pointer_size >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.pointer_size as u32 * 8)) - 1
        }
    }
}
