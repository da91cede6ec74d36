//! C API for the remote mirror
//!
//! Embedders (debuggers, crash reporters) drive the mirror through these
//! functions without linking any Rust:
//! - Contexts are opaque pointers created from a set of memory callbacks
//! - Type references are integer handles; 0 means failure
//! - Info and child records are plain structs; failures return them zeroed
//! - Nothing here panics or aborts on a bad target

use crate::context::{demangle, supported_metadata_version, ChildInfo, ReflectionContext};
use crate::lowering::{LayoutKind, TypeInfo};
use crate::reader::{
    CallbackReader, ReadBytesCallback, StringLengthCallback, SymbolAddressCallback, WidthCallback,
};
use crate::registry::{ReflectionInfo, RemoteSection};
use crate::typeref::TypeRefId;
use crate::MirrorResult;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use tracing::debug;

// ============================================================================
// Types
// ============================================================================

/// Opaque handle to a reflection context
#[repr(C)]
pub struct KeystoneReflectionContext {
    _private: [u8; 0],
}

/// A byte range in the target
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KeystoneSection {
    pub start: u64,
    pub size: u64,
}

/// Reflection sections of one image: field, associated type, builtin,
/// capture, typeref and string sections, in that order
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KeystoneReflectionInfo {
    pub sections: [KeystoneSection; 6],
}

/// Lowered type facts
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeystoneTypeInfo {
    /// `LayoutKind` value; 0 on failure
    pub kind: u32,
    pub size: u64,
    pub alignment: u64,
    pub stride: u64,
    pub num_fields: u32,
}

/// One child of a lowered type
///
/// `name` stays valid until the context is destroyed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KeystoneChildInfo {
    pub name: *const c_char,
    pub offset: u64,
    pub kind: u32,
    pub typeref: u64,
}

impl Default for KeystoneChildInfo {
    fn default() -> Self {
        Self {
            name: ptr::null(),
            offset: 0,
            kind: LayoutKind::Unknown as u32,
            typeref: 0,
        }
    }
}

// Internal representation of a context (not exposed to C)
struct ContextHandle {
    context: ReflectionContext<CallbackReader>,
    names: Vec<CString>,
}

// ============================================================================
// Helper Functions
// ============================================================================

unsafe fn handle<'a>(context: *mut KeystoneReflectionContext) -> Option<&'a mut ContextHandle> {
    (context as *mut ContextHandle).as_mut()
}

fn type_info(result: MirrorResult<std::sync::Arc<TypeInfo>>) -> KeystoneTypeInfo {
    match result {
        Ok(info) => KeystoneTypeInfo {
            kind: info.kind as u32,
            size: info.layout.size,
            alignment: info.layout.align,
            stride: info.layout.stride,
            num_fields: info.fields.len() as u32,
        },
        Err(e) => {
            debug!(error = %e, "type info query failed");
            KeystoneTypeInfo::default()
        }
    }
}

fn child_info(handle: &mut ContextHandle, result: MirrorResult<ChildInfo>) -> KeystoneChildInfo {
    match result {
        Ok(child) => {
            let name = CString::new(child.name).unwrap_or_default();
            let pointer = name.as_ptr();
            handle.names.push(name);
            KeystoneChildInfo {
                name: pointer,
                offset: child.offset,
                kind: child.kind as u32,
                typeref: child.typeref.raw(),
            }
        }
        Err(e) => {
            debug!(error = %e, "child query failed");
            KeystoneChildInfo::default()
        }
    }
}

fn typeref_result(result: MirrorResult<TypeRefId>) -> u64 {
    match result {
        Ok(id) => id.raw(),
        Err(e) => {
            debug!(error = %e, "type reference query failed");
            0
        }
    }
}

fn typeref_id(raw: u64) -> MirrorResult<TypeRefId> {
    TypeRefId::from_raw(raw).ok_or(crate::MirrorError::InvalidTypeRef(raw))
}

// ============================================================================
// Context Lifecycle
// ============================================================================

/// Version of the reflection record format this library reads
#[no_mangle]
pub extern "C" fn keystone_reflection_get_supported_metadata_version() -> u16 {
    supported_metadata_version()
}

/// Create a context that reads the target through callbacks
///
/// # Returns
/// * Non-null context on success
/// * NULL if any callback is missing
///
/// # Safety
/// The callbacks must stay callable with `reader_context` until the context
/// is destroyed with `keystone_reflection_destroy_context()`.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_create_context(
    reader_context: *mut c_void,
    pointer_size: Option<WidthCallback>,
    size_size: Option<WidthCallback>,
    read_bytes: Option<ReadBytesCallback>,
    string_length: Option<StringLengthCallback>,
    symbol_address: Option<SymbolAddressCallback>,
) -> *mut KeystoneReflectionContext {
    let (Some(pointer_size), Some(size_size), Some(read_bytes), Some(string_length), Some(symbol_address)) =
        (pointer_size, size_size, read_bytes, string_length, symbol_address)
    else {
        return ptr::null_mut();
    };
    let reader = CallbackReader::new(
        reader_context,
        pointer_size,
        size_size,
        read_bytes,
        string_length,
        symbol_address,
    );
    let handle = Box::new(ContextHandle {
        context: ReflectionContext::new(reader),
        names: Vec::new(),
    });
    Box::into_raw(handle) as *mut KeystoneReflectionContext
}

/// Destroy a context and every buffer it owns
///
/// # Safety
/// `context` must come from `keystone_reflection_create_context()` and must
/// not be used afterwards. NULL is ignored.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_destroy_context(context: *mut KeystoneReflectionContext) {
    if context.is_null() {
        return;
    }
    drop(Box::from_raw(context as *mut ContextHandle));
}

// ============================================================================
// Registration
// ============================================================================

/// Register one image's reflection sections
///
/// # Returns
/// * 1 on success, 0 if a section could not be read or parsed
///
/// # Safety
/// `context` must be a live context; `info` must point to a valid record.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_add_reflection_info(
    context: *mut KeystoneReflectionContext,
    info: *const KeystoneReflectionInfo,
) -> c_int {
    let (Some(handle), Some(info)) = (handle(context), info.as_ref()) else {
        return 0;
    };
    let info = ReflectionInfo {
        sections: info.sections.map(|section| RemoteSection {
            start: section.start,
            size: section.size,
        }),
    };
    match handle.context.add_reflection_info(&info) {
        Ok(()) => 1,
        Err(e) => {
            debug!(error = %e, "reflection info rejected");
            0
        }
    }
}

/// Read the isa mask into `out_mask`
///
/// # Safety
/// `context` must be a live context; `out_mask` must be writable.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_read_isa_mask(
    context: *mut KeystoneReflectionContext,
    out_mask: *mut u64,
) -> c_int {
    let Some(handle) = handle(context) else {
        return 0;
    };
    if out_mask.is_null() {
        return 0;
    }
    match handle.context.read_isa_mask() {
        Ok(mask) => {
            *out_mask = mask;
            1
        }
        Err(_) => 0,
    }
}

// ============================================================================
// Type References
// ============================================================================

/// Type reference for a metadata address, or 0
///
/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_typeref_for_metadata(
    context: *mut KeystoneReflectionContext,
    metadata: u64,
) -> u64 {
    match handle(context) {
        Some(handle) => typeref_result(handle.context.typeref_for_metadata(metadata)),
        None => 0,
    }
}

/// Type reference for the class of a heap object, or 0
///
/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_typeref_for_instance(
    context: *mut KeystoneReflectionContext,
    object: u64,
) -> u64 {
    match handle(context) {
        Some(handle) => typeref_result(handle.context.typeref_for_instance(object)),
        None => 0,
    }
}

/// Type reference for `length` bytes of mangled name, or 0
///
/// # Safety
/// `context` must be a live context; `name` must hold `length` bytes.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_typeref_for_mangled_name(
    context: *mut KeystoneReflectionContext,
    name: *const c_char,
    length: u64,
) -> u64 {
    let Some(handle) = handle(context) else {
        return 0;
    };
    if name.is_null() {
        return 0;
    }
    let bytes = std::slice::from_raw_parts(name as *const u8, length as usize);
    match std::str::from_utf8(bytes) {
        Ok(text) => typeref_result(handle.context.typeref_for_mangled_name(text)),
        Err(_) => 0,
    }
}

/// Number of generic arguments of a bound nominal type reference
///
/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_generic_argument_count(
    context: *mut KeystoneReflectionContext,
    typeref: u64,
) -> u32 {
    let Some(handle) = handle(context) else {
        return 0;
    };
    typeref_id(typeref)
        .and_then(|id| handle.context.generic_argument_count(id))
        .map(|count| count as u32)
        .unwrap_or(0)
}

/// Generic argument `index` of a type reference, or 0
///
/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_generic_argument(
    context: *mut KeystoneReflectionContext,
    typeref: u64,
    index: u32,
) -> u64 {
    let Some(handle) = handle(context) else {
        return 0;
    };
    typeref_result(typeref_id(typeref).and_then(|id| handle.context.generic_argument(id, index as usize)))
}

// ============================================================================
// Type Info
// ============================================================================

/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_info_for_typeref(
    context: *mut KeystoneReflectionContext,
    typeref: u64,
) -> KeystoneTypeInfo {
    match handle(context) {
        Some(handle) => type_info(typeref_id(typeref).and_then(|id| handle.context.info_for_typeref(id))),
        None => KeystoneTypeInfo::default(),
    }
}

/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_child_of_typeref(
    context: *mut KeystoneReflectionContext,
    typeref: u64,
    index: u32,
) -> KeystoneChildInfo {
    let Some(handle) = handle(context) else {
        return KeystoneChildInfo::default();
    };
    let result = typeref_id(typeref).and_then(|id| handle.context.child_of_typeref(id, index as usize));
    child_info(handle, result)
}

/// Instance layout for class metadata, value layout otherwise
///
/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_info_for_metadata(
    context: *mut KeystoneReflectionContext,
    metadata: u64,
) -> KeystoneTypeInfo {
    match handle(context) {
        Some(handle) => type_info(handle.context.info_for_metadata(metadata)),
        None => KeystoneTypeInfo::default(),
    }
}

/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_child_of_metadata(
    context: *mut KeystoneReflectionContext,
    metadata: u64,
    index: u32,
) -> KeystoneChildInfo {
    let Some(handle) = handle(context) else {
        return KeystoneChildInfo::default();
    };
    let result = handle.context.child_of_metadata(metadata, index as usize);
    child_info(handle, result)
}

/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_info_for_instance(
    context: *mut KeystoneReflectionContext,
    object: u64,
) -> KeystoneTypeInfo {
    match handle(context) {
        Some(handle) => type_info(handle.context.info_for_instance(object)),
        None => KeystoneTypeInfo::default(),
    }
}

/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_child_of_instance(
    context: *mut KeystoneReflectionContext,
    object: u64,
    index: u32,
) -> KeystoneChildInfo {
    let Some(handle) = handle(context) else {
        return KeystoneChildInfo::default();
    };
    let result = handle.context.child_of_instance(object, index as usize);
    child_info(handle, result)
}

// ============================================================================
// Existentials and Diagnostics
// ============================================================================

/// Dynamic type and value address inside an existential container
///
/// # Returns
/// * 1 with both out-parameters written on success
/// * 0 on failure, out-parameters untouched
///
/// # Safety
/// `context` must be a live context; out-parameters must be writable.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_project_existential(
    context: *mut KeystoneReflectionContext,
    address: u64,
    existential_typeref: u64,
    out_typeref: *mut u64,
    out_start: *mut u64,
) -> c_int {
    let Some(handle) = handle(context) else {
        return 0;
    };
    if out_typeref.is_null() || out_start.is_null() {
        return 0;
    }
    match typeref_id(existential_typeref).and_then(|id| handle.context.project_existential(address, id)) {
        Ok((dynamic, start)) => {
            *out_typeref = dynamic.raw();
            *out_start = start;
            1
        }
        Err(e) => {
            debug!(error = %e, "existential projection failed");
            0
        }
    }
}

/// Print a type reference tree to stdout
///
/// # Safety
/// `context` must be a live context.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_dump_typeref(
    context: *mut KeystoneReflectionContext,
    typeref: u64,
) {
    let Some(handle) = handle(context) else {
        return;
    };
    match typeref_id(typeref).and_then(|id| handle.context.dump_typeref(id)) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("<null type reference>"),
    }
}

/// Write the readable form of a NUL-terminated mangled name to `out`
///
/// At most `out_len - 1` bytes are written, always NUL-terminated when
/// `out_len` is non-zero.
///
/// # Returns
/// Length of the full readable form, which may exceed what was written
///
/// # Safety
/// `mangled` must be NUL-terminated; `out` must hold `out_len` bytes.
#[no_mangle]
pub unsafe extern "C" fn keystone_reflection_demangle(
    mangled: *const c_char,
    out: *mut c_char,
    out_len: u64,
) -> u64 {
    if mangled.is_null() {
        return 0;
    }
    let text = demangle(&CStr::from_ptr(mangled).to_string_lossy());
    if !out.is_null() && out_len > 0 {
        let count = text.len().min(out_len as usize - 1);
        ptr::copy_nonoverlapping(text.as_ptr(), out as *mut u8, count);
        *out.add(count) = 0;
    }
    text.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystone_runtime::Runtime;

    unsafe extern "C" fn pointer_size(_: *mut c_void) -> u8 {
        8
    }

    unsafe extern "C" fn read_bytes(context: *mut c_void, address: u64, dest: *mut c_void, size: u64) -> c_int {
        let runtime = &*(context as *const Runtime);
        match runtime.memory().read_bytes(address, size) {
            Ok(bytes) => {
                ptr::copy_nonoverlapping(bytes.as_ptr(), dest as *mut u8, bytes.len());
                1
            }
            Err(_) => 0,
        }
    }

    unsafe extern "C" fn string_length(context: *mut c_void, address: u64) -> u64 {
        let runtime = &*(context as *const Runtime);
        runtime
            .memory()
            .read_cstr(address)
            .map(|text| text.len() as u64)
            .unwrap_or(0)
    }

    unsafe extern "C" fn symbol_address(context: *mut c_void, name: *const c_char, length: u64) -> u64 {
        let runtime = &*(context as *const Runtime);
        let bytes = std::slice::from_raw_parts(name as *const u8, length as usize);
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|name| runtime.symbol(name))
            .unwrap_or(0)
    }

    #[test]
    fn test_callbacks_drive_a_context() {
        let rt = Runtime::new().unwrap();
        let int32 = rt.symbol("$sBi32_N").unwrap();
        let int64 = rt.symbol("$sBi64_N").unwrap();
        let tuple = rt.tuple_metadata(&[int64, int32]).unwrap();
        unsafe {
            let cx = keystone_reflection_create_context(
                &rt as *const Runtime as *mut c_void,
                Some(pointer_size),
                Some(pointer_size),
                Some(read_bytes),
                Some(string_length),
                Some(symbol_address),
            );
            assert!(!cx.is_null());

            let mut mask = 0;
            assert_eq!(keystone_reflection_read_isa_mask(cx, &mut mask), 1);
            assert_eq!(mask, u64::MAX);

            let id = keystone_reflection_typeref_for_metadata(cx, tuple);
            assert_ne!(id, 0);
            let info = keystone_reflection_info_for_typeref(cx, id);
            assert_eq!(info.kind, LayoutKind::Tuple as u32);
            assert_eq!((info.size, info.alignment, info.stride), (12, 8, 16));
            assert_eq!(info.num_fields, 2);

            let child = keystone_reflection_child_of_typeref(cx, id, 1);
            assert_eq!(CStr::from_ptr(child.name).to_str().unwrap(), "1");
            assert_eq!(child.offset, 8);
            assert_ne!(child.typeref, 0);

            let missing = keystone_reflection_child_of_typeref(cx, id, 5);
            assert!(missing.name.is_null());
            assert_eq!(keystone_reflection_typeref_for_metadata(cx, 8), 0);
            assert_eq!(keystone_reflection_info_for_typeref(cx, 0), KeystoneTypeInfo::default());

            let name = b"Bi32_";
            let by_name = keystone_reflection_typeref_for_mangled_name(cx, name.as_ptr() as *const c_char, 5);
            assert_eq!(keystone_reflection_generic_argument_count(cx, by_name), 0);
            assert_eq!(keystone_reflection_generic_argument(cx, by_name, 0), 0);
            keystone_reflection_destroy_context(cx);
        }
    }

    #[test]
    fn test_demangle_truncates_and_reports_length() {
        let symbol = CString::new("$s4main5PointVN").unwrap();
        let full = demangle("$s4main5PointVN");
        let mut buffer = [0 as c_char; 8];
        let length = unsafe {
            keystone_reflection_demangle(symbol.as_ptr(), buffer.as_mut_ptr(), buffer.len() as u64)
        };
        assert_eq!(length as usize, full.len());
        let written = unsafe { CStr::from_ptr(buffer.as_ptr()) };
        assert_eq!(written.to_str().unwrap(), &full[..7]);
        assert_eq!(keystone_reflection_get_supported_metadata_version(), 1);
    }

    #[test]
    fn test_missing_callbacks_are_rejected() {
        let cx = unsafe { keystone_reflection_create_context(ptr::null_mut(), None, None, None, None, None) };
        assert!(cx.is_null());
        unsafe { keystone_reflection_destroy_context(cx) };
    }
}
