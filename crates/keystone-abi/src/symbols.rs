//! Symbols the runtime provides to every loaded image
//!
//! Images refer to these through bind entries; the loader resolves them
//! against the runtime's own tables.

use crate::mangle::MANGLING_PREFIX;

/// Mangled builtin type codes with runtime-provided metadata
pub const BUILTIN_CODES: [&str; 11] = [
    "Bi1_", "Bi8_", "Bi16_", "Bi32_", "Bi64_", "Bw", "Bf32_", "Bf64_", "Bp", "Bo", "BO",
];

/// Value witness table shared by every native class
pub const NATIVE_OBJECT_VWT: &str = "$sBoWV";

/// Heap object destructor installed in class metadata
pub const OBJECT_DESTROY: &str = "keystone_object_destroy";

/// Entry installed in vtable slots of methods stripped as dead code
pub const DELETED_METHOD_ERROR: &str = "keystone_deleted_method_error";

/// Word holding the mask applied to an object's isa word to find its class
pub const ISA_MASK: &str = "keystone_isa_mask";

/// Value witness functions shared by every value type, in table order
pub const VALUE_WITNESS_FUNCTIONS: [&str; 4] = [
    "keystone_vw_destroy",
    "keystone_vw_initialize_with_copy",
    "keystone_vw_assign_with_copy",
    "keystone_vw_initialize_with_take",
];

/// Metadata symbol for a builtin type code
pub fn builtin_metadata(code: &str) -> String {
    format!("{}{}N", MANGLING_PREFIX, code)
}

/// Value witness table symbol for a builtin type code
pub fn builtin_value_witnesses(code: &str) -> String {
    format!("{}{}WV", MANGLING_PREFIX, code)
}

/// Builtin code named by a metadata symbol, if it is one
pub fn builtin_code_of_metadata(symbol: &str) -> Option<&'static str> {
    let body = symbol.strip_prefix(MANGLING_PREFIX)?.strip_suffix('N')?;
    BUILTIN_CODES.iter().copied().find(|c| *c == body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_symbol_names() {
        assert_eq!(builtin_metadata("Bi32_"), "$sBi32_N");
        assert_eq!(builtin_value_witnesses("Bo"), NATIVE_OBJECT_VWT);
        assert_eq!(builtin_code_of_metadata("$sBi64_N"), Some("Bi64_"));
        assert_eq!(builtin_code_of_metadata("$s4main3FooVN"), None);
    }
}
