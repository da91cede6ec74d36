//! Value layout rules
//!
//! The compiler, the runtime and the remote mirror must agree on the size,
//! alignment and stride of every type. This module is the single copy of the
//! rules: record (struct, tuple, class instance) layout, enum layout, and the
//! fixed shapes of builtin, function, metatype and existential values.

use crate::kind::vwt_flags;
use crate::bytes::align_up;
use serde::{Deserialize, Serialize};

/// Size, alignment and related facts about a value type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueLayout {
    /// Size in bytes
    pub size: u64,
    /// Alignment in bytes (power of two)
    pub align: u64,
    /// Distance between array elements
    pub stride: u64,
    /// Invalid bit patterns available to enclosing enums
    pub extra_inhabitants: u32,
    /// Copy is a memcpy
    pub pod: bool,
    /// Move is a memcpy
    pub bitwise_takable: bool,
}

impl ValueLayout {
    /// Plain-old-data scalar of the given size
    pub fn scalar(size: u64, extra_inhabitants: u32) -> Self {
        Self::pod(size, size.max(1), extra_inhabitants)
    }

    /// Plain-old-data layout with explicit alignment
    pub fn pod(size: u64, align: u64, extra_inhabitants: u32) -> Self {
        Self {
            size,
            align,
            stride: stride_of(size, align),
            extra_inhabitants,
            pod: true,
            bitwise_takable: true,
        }
    }

    /// Empty value (unit tuple, single no-payload case)
    pub fn empty() -> Self {
        Self::pod(0, 1, 0)
    }

    /// Strong reference to a heap object
    pub fn reference(pointer_size: u8, least_valid_pointer: u64) -> Self {
        Self {
            pod: false,
            ..Self::scalar(pointer_size as u64, pointer_extra_inhabitants(least_valid_pointer))
        }
    }

    /// Alignment mask (alignment minus one)
    pub fn align_mask(&self) -> u64 {
        self.align.saturating_sub(1)
    }

    /// Flags word for a value witness table
    pub fn vwt_flags(&self, pointer_size: u8) -> u64 {
        let mut flags = self.align_mask() & vwt_flags::ALIGN_MASK;
        if !self.pod {
            flags |= vwt_flags::IS_NON_POD;
        }
        if !self.fits_inline(pointer_size) {
            flags |= vwt_flags::IS_NON_INLINE;
        }
        if self.extra_inhabitants > 0 {
            flags |= vwt_flags::HAS_EXTRA_INHABITANTS;
        }
        if !self.bitwise_takable {
            flags |= vwt_flags::IS_NON_BITWISE_TAKABLE;
        }
        flags
    }

    /// Rebuild a layout from value witness table words
    pub fn from_vwt(size: u64, flags: u64, stride: u64, extra_inhabitants: u64) -> Self {
        Self {
            size,
            align: (flags & vwt_flags::ALIGN_MASK) + 1,
            stride,
            extra_inhabitants: extra_inhabitants.min(u32::MAX as u64) as u32,
            pod: flags & vwt_flags::IS_NON_POD == 0,
            bitwise_takable: flags & vwt_flags::IS_NON_BITWISE_TAKABLE == 0,
        }
    }

    /// Whether the value is stored inline in an existential container
    pub fn fits_inline(&self, pointer_size: u8) -> bool {
        let word = pointer_size as u64;
        self.size <= EXISTENTIAL_BUFFER_WORDS * word && self.align <= word && self.bitwise_takable
    }
}

/// Stride of a value: size rounded up to alignment, never zero
pub fn stride_of(size: u64, align: u64) -> u64 {
    (align_up(size as usize, align as usize) as u64).max(1)
}

fn pointer_extra_inhabitants(least_valid_pointer: u64) -> u32 {
    least_valid_pointer
        .saturating_sub(1)
        .min(i32::MAX as u64) as u32
}

/// Words in an existential container's inline buffer
pub const EXISTENTIAL_BUFFER_WORDS: u64 = 3;

/// Words in a heap object header (metadata pointer, reference counts)
pub const HEAP_OBJECT_HEADER_WORDS: u64 = 2;

/// Layout of a record: each field at its aligned offset, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    /// Byte offset of each field
    pub offsets: Vec<u64>,
    /// Layout of the whole record
    pub layout: ValueLayout,
}

/// Incremental record layout
pub struct RecordBuilder {
    size: u64,
    align: u64,
    offsets: Vec<u64>,
    extra_inhabitants: u32,
    pod: bool,
    bitwise_takable: bool,
}

impl RecordBuilder {
    /// Empty record
    pub fn new() -> Self {
        Self::with_start(0, 1)
    }

    /// Record whose fields start after a header of `size` bytes
    pub fn with_start(size: u64, align: u64) -> Self {
        Self {
            size,
            align: align.max(1),
            offsets: Vec::new(),
            extra_inhabitants: 0,
            pod: true,
            bitwise_takable: true,
        }
    }

    /// Append a field, returning its offset
    pub fn add_field(&mut self, field: &ValueLayout) -> u64 {
        let offset = align_up(self.size as usize, field.align as usize) as u64;
        self.size = offset + field.size;
        self.align = self.align.max(field.align);
        self.extra_inhabitants = self.extra_inhabitants.max(field.extra_inhabitants);
        self.pod &= field.pod;
        self.bitwise_takable &= field.bitwise_takable;
        self.offsets.push(offset);
        offset
    }

    /// Finish the record
    pub fn finish(self) -> RecordLayout {
        RecordLayout {
            layout: ValueLayout {
                size: self.size,
                align: self.align,
                stride: stride_of(self.size, self.align),
                extra_inhabitants: self.extra_inhabitants,
                pod: self.pod,
                bitwise_takable: self.bitwise_takable,
            },
            offsets: self.offsets,
        }
    }
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lay out a struct or tuple
pub fn layout_record(fields: &[ValueLayout]) -> RecordLayout {
    let mut builder = RecordBuilder::new();
    for field in fields {
        builder.add_field(field);
    }
    builder.finish()
}

/// Lay out the stored fields of a class instance after the heap header
/// (or after the superclass's fields, when `start` is given)
pub fn layout_instance(
    pointer_size: u8,
    start: Option<(u64, u64)>,
    fields: &[ValueLayout],
) -> RecordLayout {
    let word = pointer_size as u64;
    let (size, align) = start.unwrap_or((HEAP_OBJECT_HEADER_WORDS * word, word));
    let mut builder = RecordBuilder::with_start(size, align);
    for field in fields {
        builder.add_field(field);
    }
    builder.finish()
}

/// How an enum stores its cases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnumStrategy {
    /// No case carries a payload
    NoPayload,
    /// Exactly one case carries a payload
    SinglePayload,
    /// Several cases carry payloads
    MultiPayload,
}

/// Layout of an enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumLayout {
    /// Storage strategy
    pub strategy: EnumStrategy,
    /// Bytes of payload area (excluding the tag)
    pub payload_size: u64,
    /// Bytes of tag after the payload area
    pub tag_bytes: u64,
    /// Layout of the whole enum
    pub layout: ValueLayout,
}

/// Bytes needed to distinguish `count` values
pub fn tag_bytes_for(count: u64) -> u64 {
    match count {
        0 | 1 => 0,
        2..=0x100 => 1,
        0x101..=0x1_0000 => 2,
        _ => 4,
    }
}

/// Lay out an enum given the layouts of its payload cases and the number of
/// cases without payload
pub fn layout_enum(payloads: &[ValueLayout], empty_cases: u64) -> EnumLayout {
    match payloads {
        [] => {
            let tag = tag_bytes_for(empty_cases);
            let extra = if tag == 0 {
                0
            } else {
                ((1u64 << (tag * 8).min(32)) - empty_cases).min(u32::MAX as u64) as u32
            };
            EnumLayout {
                strategy: EnumStrategy::NoPayload,
                payload_size: 0,
                tag_bytes: tag,
                layout: ValueLayout::pod(tag, tag.max(1), extra),
            }
        }
        [payload] => {
            let available = payload.extra_inhabitants as u64;
            let (tag, extra) = if empty_cases <= available {
                (0, available - empty_cases)
            } else {
                (tag_bytes_for(empty_cases - available + 1), 0)
            };
            let size = payload.size + tag;
            EnumLayout {
                strategy: EnumStrategy::SinglePayload,
                payload_size: payload.size,
                tag_bytes: tag,
                layout: ValueLayout {
                    size,
                    align: payload.align,
                    stride: stride_of(size, payload.align),
                    extra_inhabitants: extra as u32,
                    pod: payload.pod,
                    bitwise_takable: payload.bitwise_takable,
                },
            }
        }
        many => {
            let payload_size = many.iter().map(|p| p.size).max().unwrap_or(0);
            let align = many.iter().map(|p| p.align).max().unwrap_or(1);
            let cases = many.len() as u64 + u64::from(empty_cases > 0);
            let tag = tag_bytes_for(cases).max(1);
            let size = payload_size + tag;
            EnumLayout {
                strategy: EnumStrategy::MultiPayload,
                payload_size,
                tag_bytes: tag,
                layout: ValueLayout {
                    size,
                    align,
                    stride: stride_of(size, align),
                    extra_inhabitants: 0,
                    pod: many.iter().all(|p| p.pod),
                    bitwise_takable: many.iter().all(|p| p.bitwise_takable),
                },
            }
        }
    }
}

/// Layout of a builtin type given its mangled name
pub fn builtin_layout(mangled: &str, pointer_size: u8, least_valid_pointer: u64) -> Option<ValueLayout> {
    let word = pointer_size as u64;
    Some(match mangled {
        "Bi1_" => ValueLayout::scalar(1, 254),
        "Bi8_" => ValueLayout::scalar(1, 0),
        "Bi16_" => ValueLayout::scalar(2, 0),
        "Bi32_" => ValueLayout::scalar(4, 0),
        "Bi64_" => ValueLayout::scalar(8, 0),
        "Bw" => ValueLayout::scalar(word, 0),
        "Bf32_" => ValueLayout::scalar(4, 0),
        "Bf64_" => ValueLayout::scalar(8, 0),
        "Bp" => ValueLayout::scalar(word, pointer_extra_inhabitants(least_valid_pointer)),
        "Bo" | "BO" => ValueLayout::reference(pointer_size, least_valid_pointer),
        _ => return None,
    })
}

/// Thick function value: function pointer plus retained context
pub fn function_layout(pointer_size: u8, least_valid_pointer: u64) -> ValueLayout {
    let word = pointer_size as u64;
    ValueLayout {
        size: 2 * word,
        align: word,
        stride: 2 * word,
        extra_inhabitants: pointer_extra_inhabitants(least_valid_pointer),
        pod: false,
        bitwise_takable: true,
    }
}

/// Thick metatype value: one metadata pointer
pub fn metatype_layout(pointer_size: u8, least_valid_pointer: u64) -> ValueLayout {
    ValueLayout::scalar(pointer_size as u64, pointer_extra_inhabitants(least_valid_pointer))
}

/// Existential container layout
///
/// Class-bound compositions hold one reference; others hold an inline buffer
/// and the dynamic type's metadata. Both add one witness table per protocol.
pub fn existential_layout(
    pointer_size: u8,
    class_bound: bool,
    witness_tables: u64,
    least_valid_pointer: u64,
) -> ValueLayout {
    let word = pointer_size as u64;
    let words = if class_bound {
        1 + witness_tables
    } else {
        EXISTENTIAL_BUFFER_WORDS + 1 + witness_tables
    };
    ValueLayout {
        size: words * word,
        align: word,
        stride: words * word,
        extra_inhabitants: pointer_extra_inhabitants(least_valid_pointer),
        pod: false,
        bitwise_takable: class_bound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_alignment_padding() {
        let int32 = builtin_layout("Bi32_", 8, 4096).unwrap();
        let bool_ = builtin_layout("Bi1_", 8, 4096).unwrap();
        let int64 = builtin_layout("Bi64_", 8, 4096).unwrap();

        let record = layout_record(&[int32, bool_]);
        assert_eq!(record.offsets, vec![0, 4]);
        assert_eq!(record.layout.size, 5);
        assert_eq!(record.layout.align, 4);
        assert_eq!(record.layout.stride, 8);
        assert_eq!(record.layout.extra_inhabitants, 254);

        let record = layout_record(&[bool_, int64]);
        assert_eq!(record.offsets, vec![0, 8]);
        assert_eq!(record.layout.size, 16);
    }

    #[test]
    fn test_empty_record_has_nonzero_stride() {
        let record = layout_record(&[]);
        assert_eq!(record.layout.size, 0);
        assert_eq!(record.layout.stride, 1);
    }

    #[test]
    fn test_instance_fields_follow_header() {
        let int32 = builtin_layout("Bi32_", 8, 4096).unwrap();
        let record = layout_instance(8, None, &[int32, int32]);
        assert_eq!(record.offsets, vec![16, 20]);
        assert_eq!(record.layout.size, 24);

        let sub = layout_instance(8, Some((record.layout.size, record.layout.align)), &[int32]);
        assert_eq!(sub.offsets, vec![24]);
    }

    #[test]
    fn test_enum_strategies() {
        let no_payload = layout_enum(&[], 3);
        assert_eq!(no_payload.strategy, EnumStrategy::NoPayload);
        assert_eq!(no_payload.layout.size, 1);
        assert_eq!(no_payload.layout.extra_inhabitants, 253);

        let reference = ValueLayout::reference(8, 4096);
        let optional = layout_enum(&[reference], 1);
        assert_eq!(optional.strategy, EnumStrategy::SinglePayload);
        assert_eq!(optional.tag_bytes, 0);
        assert_eq!(optional.layout.size, 8);

        let int32 = ValueLayout::scalar(4, 0);
        let tagged = layout_enum(&[int32], 2);
        assert_eq!(tagged.tag_bytes, 1);
        assert_eq!(tagged.layout.size, 5);

        let multi = layout_enum(&[int32, ValueLayout::scalar(8, 0)], 1);
        assert_eq!(multi.strategy, EnumStrategy::MultiPayload);
        assert_eq!(multi.payload_size, 8);
        assert_eq!(multi.layout.size, 9);
        assert_eq!(multi.layout.stride, 16);
    }

    #[test]
    fn test_inline_storage_rule() {
        let small = layout_record(&[ValueLayout::scalar(8, 0); 3]).layout;
        let large = layout_record(&[ValueLayout::scalar(8, 0); 4]).layout;
        assert!(small.fits_inline(8));
        assert!(!large.fits_inline(8));
        assert_ne!(large.vwt_flags(8) & vwt_flags::IS_NON_INLINE, 0);
    }

    #[test]
    fn test_vwt_flags_round_trip_alignment() {
        let layout = existential_layout(8, false, 1, 4096);
        assert_eq!(layout.size, 40);
        let flags = layout.vwt_flags(8);
        let back = ValueLayout::from_vwt(layout.size, flags, layout.stride, layout.extra_inhabitants as u64);
        assert_eq!(back, layout);
    }
}
