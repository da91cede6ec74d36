//! Symbol and type name mangling
//!
//! Names are postfix: operands come first, operators after. A type is
//! mangled from its module and name (each length-prefixed) followed by a
//! kind letter, generic arguments are wrapped in `y ... G`, and every
//! emitted artifact appends a short operator naming what kind of entity it
//! is. There are no substitutions, so a name depends only on the entity.
//!
//! The demangler runs the same grammar backwards with a node stack.

use std::fmt;
use thiserror::Error;

/// Prefix of every mangled symbol
pub const MANGLING_PREFIX: &str = "$s";

/// Errors produced while demangling
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DemangleError {
    /// Missing `$s` prefix
    #[error("Symbol '{0}' does not start with {MANGLING_PREFIX}")]
    MissingPrefix(String),

    /// Input ended inside a production
    #[error("Unexpected end of mangled name at offset {0}")]
    UnexpectedEnd(usize),

    /// Character that starts no production
    #[error("Unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    /// Operator found the wrong operands on the stack
    #[error("Malformed mangled name at offset {0}")]
    Malformed(usize),
}

/// Kind letter of a nominal type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NominalKind {
    /// `V`
    Struct,
    /// `C`
    Class,
    /// `O`
    Enum,
    /// `P`
    Protocol,
}

impl NominalKind {
    /// Kind letter
    pub fn code(self) -> char {
        match self {
            NominalKind::Struct => 'V',
            NominalKind::Class => 'C',
            NominalKind::Enum => 'O',
            NominalKind::Protocol => 'P',
        }
    }

    fn from_code(c: char) -> Option<Self> {
        match c {
            'V' => Some(NominalKind::Struct),
            'C' => Some(NominalKind::Class),
            'O' => Some(NominalKind::Enum),
            'P' => Some(NominalKind::Protocol),
            _ => None,
        }
    }
}

/// A type in mangled form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MangledType {
    /// Builtin, holding its mangling (`Bi32_`, `Bo`, ...)
    Builtin(String),
    /// Nominal type, possibly with generic arguments
    Nominal {
        /// Defining module
        module: String,
        /// Type name
        name: String,
        /// Kind
        kind: NominalKind,
        /// Generic arguments
        args: Vec<MangledType>,
    },
    /// Generic parameter by flat index
    GenericParam(u32),
    /// Tuple
    Tuple(Vec<MangledType>),
    /// Function
    Function {
        /// Parameters
        params: Vec<MangledType>,
        /// Result
        result: Box<MangledType>,
    },
    /// Protocol composition; empty is `Any`
    Existential(Vec<MangledType>),
    /// Metatype
    Metatype(Box<MangledType>),
}

impl MangledType {
    /// Unbound nominal type
    pub fn nominal(module: impl Into<String>, name: impl Into<String>, kind: NominalKind) -> Self {
        MangledType::Nominal {
            module: module.into(),
            name: name.into(),
            kind,
            args: Vec::new(),
        }
    }

    /// Append the mangling of this type to `out`
    pub fn mangle_into(&self, out: &mut String) {
        match self {
            MangledType::Builtin(code) => out.push_str(code),
            MangledType::Nominal {
                module,
                name,
                kind,
                args,
            } => {
                push_identifier(out, module);
                push_identifier(out, name);
                out.push(kind.code());
                if !args.is_empty() {
                    out.push('y');
                    for arg in args {
                        arg.mangle_into(out);
                    }
                    out.push('G');
                }
            }
            MangledType::GenericParam(index) => match index {
                0 => out.push('x'),
                1 => out.push_str("q_"),
                n => {
                    out.push('q');
                    out.push_str(&(n - 2).to_string());
                    out.push('_');
                }
            },
            MangledType::Tuple(elements) => {
                mangle_list(out, elements);
                out.push('t');
            }
            MangledType::Function { params, result } => {
                result.mangle_into(out);
                mangle_list(out, params);
                out.push('t');
                out.push('c');
            }
            MangledType::Existential(protocols) => {
                mangle_list(out, protocols);
                out.push('p');
            }
            MangledType::Metatype(instance) => {
                instance.mangle_into(out);
                out.push('m');
            }
        }
    }

    /// Mangled type string (no prefix)
    pub fn mangle(&self) -> String {
        let mut out = String::new();
        self.mangle_into(&mut out);
        out
    }

    /// Mangled type name as stored in reflection records
    pub fn type_name(&self) -> String {
        self.mangle()
    }
}

fn push_identifier(out: &mut String, ident: &str) {
    out.push_str(&ident.len().to_string());
    out.push_str(ident);
}

fn mangle_list(out: &mut String, elements: &[MangledType]) {
    match elements.split_first() {
        None => out.push('y'),
        Some((first, rest)) => {
            first.mangle_into(out);
            out.push('_');
            for element in rest {
                element.mangle_into(out);
            }
        }
    }
}

fn builtin_display(code: &str) -> String {
    match code {
        "Bw" => "Builtin.Word".to_string(),
        "Bp" => "Builtin.RawPointer".to_string(),
        "Bo" => "Builtin.NativeObject".to_string(),
        "BO" => "Builtin.UnknownObject".to_string(),
        _ => {
            let body = code.trim_end_matches('_');
            if let Some(bits) = body.strip_prefix("Bi") {
                format!("Builtin.Int{}", bits)
            } else if let Some(bits) = body.strip_prefix("Bf") {
                format!("Builtin.FPIEEE{}", bits)
            } else {
                code.to_string()
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[MangledType], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for MangledType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MangledType::Builtin(code) => f.write_str(&builtin_display(code)),
            MangledType::Nominal {
                module, name, args, ..
            } => {
                write!(f, "{}.{}", module, name)?;
                if !args.is_empty() {
                    f.write_str("<")?;
                    write_list(f, args, ", ")?;
                    f.write_str(">")?;
                }
                Ok(())
            }
            MangledType::GenericParam(index) => write!(f, "τ_0_{}", index),
            MangledType::Tuple(elements) => {
                f.write_str("(")?;
                write_list(f, elements, ", ")?;
                f.write_str(")")
            }
            MangledType::Function { params, result } => {
                f.write_str("(")?;
                write_list(f, params, ", ")?;
                write!(f, ") -> {}", result)
            }
            MangledType::Existential(protocols) if protocols.is_empty() => f.write_str("Any"),
            MangledType::Existential(protocols) => {
                f.write_str("any ")?;
                write_list(f, protocols, " & ")
            }
            MangledType::Metatype(instance) => write!(f, "{}.Type", instance),
        }
    }
}

/// A linkable artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    /// `N`: metadata address point
    TypeMetadata(MangledType),
    /// `Mf`: full metadata object including the prefix before the address point
    FullTypeMetadata(MangledType),
    /// `Ma`: metadata access function
    TypeMetadataAccessor(MangledType),
    /// `ML`: access function cache slot
    TypeMetadataLazyCache(MangledType),
    /// `Ml`: once token for one-time metadata initialization
    TypeMetadataOnceToken(MangledType),
    /// `MP`: generic metadata pattern
    TypeMetadataPattern(MangledType),
    /// `Mi`: generic metadata instantiation function
    TypeMetadataInstantiationFunction(MangledType),
    /// `Mm`: metaclass
    Metaclass(MangledType),
    /// `Mn`: nominal type descriptor
    NominalTypeDescriptor(MangledType),
    /// `Mp`: protocol descriptor
    ProtocolDescriptor(MangledType),
    /// `MF`: field type accessor
    FieldTypeAccessor(MangledType),
    /// `MV`: field type vector cache
    FieldTypeVectorCache(MangledType),
    /// `Mo`: class metadata base offset
    ClassMetadataBaseOffset(MangledType),
    /// `MR`: reflection field descriptor
    ReflectionFieldDescriptor(MangledType),
    /// `MA`: reflection associated type descriptor of a conformance
    ReflectionAssociatedTypes(MangledType, MangledType),
    /// `MB`: reflection builtin type descriptor
    ReflectionBuiltinDescriptor(MangledType),
    /// `WV`: value witness table
    ValueWitnessTable(MangledType),
    /// `Wv`: field offset global
    FieldOffset(MangledType, String),
    /// `WP`: protocol witness table (conforming type, protocol)
    ProtocolWitnessTable(MangledType, MangledType),
    /// `Wt`: associated type witness accessor (conforming type, protocol, name)
    AssociatedTypeWitness(MangledType, MangledType, String),
    /// `F`: method implementation
    Method(MangledType, String),
}

impl Entity {
    /// Operator suffix
    pub fn operator(&self) -> &'static str {
        match self {
            Entity::TypeMetadata(_) => "N",
            Entity::FullTypeMetadata(_) => "Mf",
            Entity::TypeMetadataAccessor(_) => "Ma",
            Entity::TypeMetadataLazyCache(_) => "ML",
            Entity::TypeMetadataOnceToken(_) => "Ml",
            Entity::TypeMetadataPattern(_) => "MP",
            Entity::TypeMetadataInstantiationFunction(_) => "Mi",
            Entity::Metaclass(_) => "Mm",
            Entity::NominalTypeDescriptor(_) => "Mn",
            Entity::ProtocolDescriptor(_) => "Mp",
            Entity::FieldTypeAccessor(_) => "MF",
            Entity::FieldTypeVectorCache(_) => "MV",
            Entity::ClassMetadataBaseOffset(_) => "Mo",
            Entity::ReflectionFieldDescriptor(_) => "MR",
            Entity::ReflectionAssociatedTypes(..) => "MA",
            Entity::ReflectionBuiltinDescriptor(_) => "MB",
            Entity::ValueWitnessTable(_) => "WV",
            Entity::FieldOffset(..) => "Wv",
            Entity::ProtocolWitnessTable(..) => "WP",
            Entity::AssociatedTypeWitness(..) => "Wt",
            Entity::Method(..) => "F",
        }
    }

    /// Full mangled symbol name
    pub fn mangle(&self) -> String {
        let mut out = String::from(MANGLING_PREFIX);
        match self {
            Entity::FieldOffset(ty, name) | Entity::Method(ty, name) => {
                ty.mangle_into(&mut out);
                push_identifier(&mut out, name);
            }
            Entity::ProtocolWitnessTable(ty, proto) | Entity::ReflectionAssociatedTypes(ty, proto) => {
                ty.mangle_into(&mut out);
                proto.mangle_into(&mut out);
            }
            Entity::AssociatedTypeWitness(ty, proto, name) => {
                ty.mangle_into(&mut out);
                proto.mangle_into(&mut out);
                push_identifier(&mut out, name);
            }
            Entity::TypeMetadata(ty)
            | Entity::FullTypeMetadata(ty)
            | Entity::TypeMetadataAccessor(ty)
            | Entity::TypeMetadataLazyCache(ty)
            | Entity::TypeMetadataOnceToken(ty)
            | Entity::TypeMetadataPattern(ty)
            | Entity::TypeMetadataInstantiationFunction(ty)
            | Entity::Metaclass(ty)
            | Entity::NominalTypeDescriptor(ty)
            | Entity::ProtocolDescriptor(ty)
            | Entity::FieldTypeAccessor(ty)
            | Entity::FieldTypeVectorCache(ty)
            | Entity::ClassMetadataBaseOffset(ty)
            | Entity::ReflectionFieldDescriptor(ty)
            | Entity::ReflectionBuiltinDescriptor(ty)
            | Entity::ValueWitnessTable(ty) => ty.mangle_into(&mut out),
        }
        out.push_str(self.operator());
        out
    }

    fn description(&self) -> &'static str {
        match self {
            Entity::TypeMetadata(_) => "type metadata for",
            Entity::FullTypeMetadata(_) => "full type metadata for",
            Entity::TypeMetadataAccessor(_) => "type metadata accessor for",
            Entity::TypeMetadataLazyCache(_) => "lazy cache variable for type metadata for",
            Entity::TypeMetadataOnceToken(_) => "one-time initialization token for",
            Entity::TypeMetadataPattern(_) => "generic type metadata pattern for",
            Entity::TypeMetadataInstantiationFunction(_) => {
                "type metadata instantiation function for"
            }
            Entity::Metaclass(_) => "metaclass for",
            Entity::NominalTypeDescriptor(_) => "nominal type descriptor for",
            Entity::ProtocolDescriptor(_) => "protocol descriptor for",
            Entity::FieldTypeAccessor(_) => "field type accessor for",
            Entity::FieldTypeVectorCache(_) => "field type vector cache for",
            Entity::ClassMetadataBaseOffset(_) => "class metadata base offset for",
            Entity::ReflectionFieldDescriptor(_) => "reflection metadata field descriptor",
            Entity::ReflectionAssociatedTypes(..) => "reflection metadata associated type descriptor",
            Entity::ReflectionBuiltinDescriptor(_) => "reflection metadata builtin descriptor",
            Entity::ValueWitnessTable(_) => "value witness table for",
            Entity::FieldOffset(..) => "field offset for",
            Entity::ProtocolWitnessTable(..) => "protocol witness table for",
            Entity::AssociatedTypeWitness(..) => "associated type witness accessor for",
            Entity::Method(..) => "method",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = self.description();
        match self {
            Entity::FieldOffset(ty, name) | Entity::Method(ty, name) => {
                write!(f, "{} {}.{}", description, ty, name)
            }
            Entity::ProtocolWitnessTable(ty, proto) | Entity::ReflectionAssociatedTypes(ty, proto) => {
                write!(f, "{} {} : {}", description, ty, proto)
            }
            Entity::AssociatedTypeWitness(ty, proto, name) => {
                write!(f, "{} {} : {}.{}", description, ty, proto, name)
            }
            Entity::TypeMetadata(ty)
            | Entity::FullTypeMetadata(ty)
            | Entity::TypeMetadataAccessor(ty)
            | Entity::TypeMetadataLazyCache(ty)
            | Entity::TypeMetadataOnceToken(ty)
            | Entity::TypeMetadataPattern(ty)
            | Entity::TypeMetadataInstantiationFunction(ty)
            | Entity::Metaclass(ty)
            | Entity::NominalTypeDescriptor(ty)
            | Entity::ProtocolDescriptor(ty)
            | Entity::FieldTypeAccessor(ty)
            | Entity::FieldTypeVectorCache(ty)
            | Entity::ClassMetadataBaseOffset(ty)
            | Entity::ReflectionFieldDescriptor(ty)
            | Entity::ReflectionBuiltinDescriptor(ty)
            | Entity::ValueWitnessTable(ty) => write!(f, "{} {}", description, ty),
        }
    }
}

// ===== Demangling =====

#[derive(Debug)]
enum Node {
    Type(MangledType),
    Ident(String),
    ListStart,
}

struct Demangler<'a> {
    text: &'a [u8],
    pos: usize,
    stack: Vec<Node>,
}

impl<'a> Demangler<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text: text.as_bytes(),
            pos: 0,
            stack: Vec::new(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn next(&mut self) -> Result<u8, DemangleError> {
        let c = self.peek().ok_or(DemangleError::UnexpectedEnd(self.pos))?;
        self.pos += 1;
        Ok(c)
    }

    fn number(&mut self) -> Result<usize, DemangleError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(DemangleError::UnexpectedEnd(self.pos));
        }
        std::str::from_utf8(&self.text[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(DemangleError::Malformed(start))
    }

    fn expect(&mut self, c: u8) -> Result<(), DemangleError> {
        let at = self.pos;
        let found = self.next()?;
        if found != c {
            return Err(DemangleError::UnexpectedChar(found as char, at));
        }
        Ok(())
    }

    fn pop_type(&mut self) -> Result<MangledType, DemangleError> {
        match self.stack.pop() {
            Some(Node::Type(ty)) => Ok(ty),
            _ => Err(DemangleError::Malformed(self.pos)),
        }
    }

    fn pop_ident(&mut self) -> Result<String, DemangleError> {
        match self.stack.pop() {
            Some(Node::Ident(name)) => Ok(name),
            _ => Err(DemangleError::Malformed(self.pos)),
        }
    }

    fn pop_list(&mut self) -> Result<Vec<MangledType>, DemangleError> {
        let mut items = Vec::new();
        loop {
            match self.stack.pop() {
                Some(Node::ListStart) => break,
                Some(Node::Type(ty)) => items.push(ty),
                _ => return Err(DemangleError::Malformed(self.pos)),
            }
        }
        items.reverse();
        Ok(items)
    }

    fn builtin(&mut self) -> Result<MangledType, DemangleError> {
        let start = self.pos - 1;
        match self.next()? {
            b'i' | b'f' => {
                self.number()?;
                self.expect(b'_')?;
            }
            b'w' | b'p' | b'o' | b'O' => {}
            other => return Err(DemangleError::UnexpectedChar(other as char, self.pos - 1)),
        }
        let code = String::from_utf8_lossy(&self.text[start..self.pos]).into_owned();
        Ok(MangledType::Builtin(code))
    }

    /// Run until the input is exhausted or an entity operator is reached
    fn run_types(&mut self) -> Result<(), DemangleError> {
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => {
                    let len = self.number()?;
                    let start = self.pos;
                    let end = start
                        .checked_add(len)
                        .filter(|&end| end <= self.text.len())
                        .ok_or(DemangleError::UnexpectedEnd(self.text.len()))?;
                    let ident = std::str::from_utf8(&self.text[start..end])
                        .map_err(|_| DemangleError::Malformed(start))?;
                    self.stack.push(Node::Ident(ident.to_string()));
                    self.pos = end;
                }
                b'V' | b'C' | b'O' | b'P' => {
                    self.pos += 1;
                    let kind = NominalKind::from_code(c as char)
                        .ok_or(DemangleError::Malformed(self.pos))?;
                    let name = self.pop_ident()?;
                    let module = self.pop_ident()?;
                    self.stack.push(Node::Type(MangledType::Nominal {
                        module,
                        name,
                        kind,
                        args: Vec::new(),
                    }));
                }
                b'B' => {
                    self.pos += 1;
                    let ty = self.builtin()?;
                    self.stack.push(Node::Type(ty));
                }
                b'x' => {
                    self.pos += 1;
                    self.stack.push(Node::Type(MangledType::GenericParam(0)));
                }
                b'q' => {
                    self.pos += 1;
                    let index = if self.peek() == Some(b'_') {
                        1
                    } else {
                        self.number()? as u32 + 2
                    };
                    self.expect(b'_')?;
                    self.stack.push(Node::Type(MangledType::GenericParam(index)));
                }
                b'y' => {
                    self.pos += 1;
                    self.stack.push(Node::ListStart);
                }
                b'_' => {
                    self.pos += 1;
                    let first = self.pop_type()?;
                    self.stack.push(Node::ListStart);
                    self.stack.push(Node::Type(first));
                }
                b'G' => {
                    self.pos += 1;
                    let args = self.pop_list()?;
                    match self.pop_type()? {
                        MangledType::Nominal {
                            module, name, kind, ..
                        } => self.stack.push(Node::Type(MangledType::Nominal {
                            module,
                            name,
                            kind,
                            args,
                        })),
                        _ => return Err(DemangleError::Malformed(self.pos)),
                    }
                }
                b't' => {
                    self.pos += 1;
                    let elements = self.pop_list()?;
                    self.stack.push(Node::Type(MangledType::Tuple(elements)));
                }
                b'p' => {
                    self.pos += 1;
                    let protocols = self.pop_list()?;
                    self.stack.push(Node::Type(MangledType::Existential(protocols)));
                }
                b'c' => {
                    self.pos += 1;
                    let params = match self.pop_type()? {
                        MangledType::Tuple(params) => params,
                        _ => return Err(DemangleError::Malformed(self.pos)),
                    };
                    let result = self.pop_type()?;
                    self.stack.push(Node::Type(MangledType::Function {
                        params,
                        result: Box::new(result),
                    }));
                }
                b'm' => {
                    self.pos += 1;
                    let instance = self.pop_type()?;
                    self.stack.push(Node::Type(MangledType::Metatype(Box::new(instance))));
                }
                b'M' | b'W' | b'N' | b'F' => return Ok(()),
                other => return Err(DemangleError::UnexpectedChar(other as char, self.pos)),
            }
        }
        Ok(())
    }

    fn finish_type(&mut self) -> Result<MangledType, DemangleError> {
        let ty = self.pop_type()?;
        if !self.stack.is_empty() {
            return Err(DemangleError::Malformed(self.pos));
        }
        Ok(ty)
    }
}

/// Demangle a bare type mangling (no prefix, no entity operator)
pub fn demangle_type(text: &str) -> Result<MangledType, DemangleError> {
    let mut d = Demangler::new(text);
    d.run_types()?;
    if d.pos != d.text.len() {
        let c = d.text[d.pos] as char;
        return Err(DemangleError::UnexpectedChar(c, d.pos));
    }
    d.finish_type()
}

/// Demangle a full symbol name
pub fn demangle_symbol(symbol: &str) -> Result<Entity, DemangleError> {
    let body = symbol
        .strip_prefix(MANGLING_PREFIX)
        .ok_or_else(|| DemangleError::MissingPrefix(symbol.to_string()))?;
    let mut d = Demangler::new(body);
    d.run_types()?;
    let at = d.pos;
    let operator = &body[at..];
    let single = |d: &mut Demangler<'_>| d.finish_type();
    let entity = match operator {
        "N" => Entity::TypeMetadata(single(&mut d)?),
        "Mf" => Entity::FullTypeMetadata(single(&mut d)?),
        "Ma" => Entity::TypeMetadataAccessor(single(&mut d)?),
        "ML" => Entity::TypeMetadataLazyCache(single(&mut d)?),
        "Ml" => Entity::TypeMetadataOnceToken(single(&mut d)?),
        "MP" => Entity::TypeMetadataPattern(single(&mut d)?),
        "Mi" => Entity::TypeMetadataInstantiationFunction(single(&mut d)?),
        "Mm" => Entity::Metaclass(single(&mut d)?),
        "Mn" => Entity::NominalTypeDescriptor(single(&mut d)?),
        "Mp" => Entity::ProtocolDescriptor(single(&mut d)?),
        "MF" => Entity::FieldTypeAccessor(single(&mut d)?),
        "MV" => Entity::FieldTypeVectorCache(single(&mut d)?),
        "Mo" => Entity::ClassMetadataBaseOffset(single(&mut d)?),
        "MR" => Entity::ReflectionFieldDescriptor(single(&mut d)?),
        "MB" => Entity::ReflectionBuiltinDescriptor(single(&mut d)?),
        "WV" => Entity::ValueWitnessTable(single(&mut d)?),
        "Wv" | "F" => {
            let name = d.pop_ident()?;
            let ty = d.finish_type()?;
            if operator == "Wv" {
                Entity::FieldOffset(ty, name)
            } else {
                Entity::Method(ty, name)
            }
        }
        "WP" | "MA" => {
            let proto = d.pop_type()?;
            let ty = d.finish_type()?;
            if operator == "WP" {
                Entity::ProtocolWitnessTable(ty, proto)
            } else {
                Entity::ReflectionAssociatedTypes(ty, proto)
            }
        }
        "Wt" => {
            let name = d.pop_ident()?;
            let proto = d.pop_type()?;
            let ty = d.finish_type()?;
            Entity::AssociatedTypeWitness(ty, proto, name)
        }
        "" => return Err(DemangleError::UnexpectedEnd(at)),
        _ => {
            let c = operator.chars().next().unwrap_or('?');
            return Err(DemangleError::UnexpectedChar(c, at + MANGLING_PREFIX.len()));
        }
    };
    Ok(entity)
}

/// Readable form of a symbol, or the symbol itself when it does not demangle
pub fn demangle_to_string(symbol: &str) -> String {
    match demangle_symbol(symbol) {
        Ok(entity) => entity.to_string(),
        Err(_) => match demangle_type(symbol) {
            Ok(ty) => ty.to_string(),
            Err(_) => symbol.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int32() -> MangledType {
        MangledType::Builtin("Bi32_".to_string())
    }

    fn pair(args: Vec<MangledType>) -> MangledType {
        MangledType::Nominal {
            module: "main".to_string(),
            name: "Pair".to_string(),
            kind: NominalKind::Struct,
            args,
        }
    }

    #[test]
    fn test_nominal_symbol_names() {
        let point = MangledType::nominal("main", "Point", NominalKind::Struct);
        assert_eq!(
            Entity::TypeMetadataAccessor(point.clone()).mangle(),
            "$s4main5PointVMa"
        );
        assert_eq!(Entity::TypeMetadata(point.clone()).mangle(), "$s4main5PointVN");
        assert_eq!(
            Entity::FieldOffset(point, "x".to_string()).mangle(),
            "$s4main5PointV1xWv"
        );
        let shape = MangledType::nominal("geo", "Shape", NominalKind::Protocol);
        assert_eq!(Entity::ProtocolDescriptor(shape).mangle(), "$s3geo5ShapePMp");
    }

    #[test]
    fn test_structural_manglings() {
        assert_eq!(pair(vec![int32(), MangledType::GenericParam(0)]).mangle(), "4main4PairVyBi32_xG");
        assert_eq!(MangledType::Tuple(vec![]).mangle(), "yt");
        assert_eq!(
            MangledType::Tuple(vec![int32(), MangledType::GenericParam(1)]).mangle(),
            "Bi32__q_t"
        );
        assert_eq!(MangledType::GenericParam(4).mangle(), "q2_");
        assert_eq!(MangledType::Existential(vec![]).mangle(), "yp");
        assert_eq!(
            MangledType::Metatype(Box::new(int32())).mangle(),
            "Bi32_m"
        );
        let f = MangledType::Function {
            params: vec![int32()],
            result: Box::new(MangledType::Builtin("Bi1_".to_string())),
        };
        assert_eq!(f.mangle(), "Bi1_Bi32__tc");
    }

    #[test]
    fn test_demangle_round_trip() {
        let nested = MangledType::Function {
            params: vec![
                pair(vec![MangledType::Tuple(vec![]), MangledType::GenericParam(3)]),
                MangledType::Existential(vec![
                    MangledType::nominal("a", "P", NominalKind::Protocol),
                    MangledType::nominal("b", "Q", NominalKind::Protocol),
                ]),
            ],
            result: Box::new(MangledType::Metatype(Box::new(MangledType::nominal(
                "main",
                "Node",
                NominalKind::Class,
            )))),
        };
        let symbol = Entity::TypeMetadataAccessor(nested.clone()).mangle();
        assert_eq!(
            demangle_symbol(&symbol).unwrap(),
            Entity::TypeMetadataAccessor(nested.clone())
        );
        assert_eq!(demangle_type(&nested.mangle()).unwrap(), nested);
    }

    #[test]
    fn test_demangle_two_operand_entities() {
        let ty = pair(vec![int32(), int32()]);
        let proto = MangledType::nominal("main", "Shape", NominalKind::Protocol);
        let wt = Entity::ProtocolWitnessTable(ty.clone(), proto.clone());
        assert_eq!(demangle_symbol(&wt.mangle()).unwrap(), wt);
        let method = Entity::Method(ty, "area".to_string());
        assert_eq!(demangle_symbol(&method.mangle()).unwrap(), method);
    }

    #[test]
    fn test_readable_output() {
        assert_eq!(
            demangle_to_string("$s4main4PairVyBi32_Bi1_GMa"),
            "type metadata accessor for main.Pair<Builtin.Int32, Builtin.Int1>"
        );
        assert_eq!(demangle_to_string("Bp"), "Builtin.RawPointer");
        assert_eq!(demangle_to_string("not a symbol"), "not a symbol");
    }

    #[test]
    fn test_demangle_errors() {
        assert!(matches!(demangle_symbol("_T04main"), Err(DemangleError::MissingPrefix(_))));
        assert!(demangle_symbol("$s9mainVN").is_err());
        assert!(demangle_symbol("$s4main5PointV").is_err());
        assert!(demangle_symbol("$s4main5PointVZz").is_err());
        assert!(demangle_type("Bi32_G").is_err());
    }
}
