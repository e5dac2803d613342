//! Scalar values and call signatures crossing the host/guest boundary.
//!
//! The adapter moves exactly seven kinds of scalar between the host and a
//! guest module: 32- and 64-bit integers in signed and unsigned flavours,
//! both floating-point widths, and [`Word`], a guest address/handle.
//! Signedness only exists on the host side; at the wire level a `U32`, an
//! `I32` and a `Word` are the same 32-bit pattern.
//!
//! ## Authors
//!
//! The Wasm Executor Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the repository root directory for
//! information on licensing and copyright.

use std::fmt;
use wasmtime::{FuncType, Val, ValType};

/// The size, in bytes, of a [`Word`] in guest memory.
pub const WORD_SIZE: usize = 4;

////////////////////////////////////////////////////////////////////////////////
// Guest words.
////////////////////////////////////////////////////////////////////////////////

/// A 32-bit guest address or handle.
///
/// Type-distinct from a plain `u32` so that marshaling code cannot confuse a
/// pointer into guest linear memory with an ordinary integer, even though the
/// two are bit-identical on the wire.  The host may be 64-bit; a `Word` is
/// always exactly 32 bits wide.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Word(pub u32);

impl Word {
    /// Widens the word to a host-sized offset, e.g. for bounds arithmetic.
    #[inline]
    pub fn u64(self) -> u64 {
        self.0 as u64
    }
}

impl From<u32> for Word {
    fn from(value: u32) -> Self {
        Word(value)
    }
}

impl From<Word> for u32 {
    fn from(word: Word) -> Self {
        word.0
    }
}

impl fmt::Display for Word {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tagged values and their kinds.
////////////////////////////////////////////////////////////////////////////////

/// The kind of a single scalar parameter or return value.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueKind {
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Word,
}

impl ValueKind {
    /// The untagged runtime type this kind is carried as on the wire.
    pub(crate) fn wire_type(self) -> ValType {
        match self {
            ValueKind::I32 | ValueKind::U32 | ValueKind::Word => ValType::I32,
            ValueKind::I64 | ValueKind::U64 => ValType::I64,
            ValueKind::F32 => ValType::F32,
            ValueKind::F64 => ValType::F64,
        }
    }

    /// The all-zeroes wire value of this kind.
    pub(crate) fn zero_wire(self) -> Val {
        match self {
            ValueKind::I32 | ValueKind::U32 | ValueKind::Word => Val::I32(0),
            ValueKind::I64 | ValueKind::U64 => Val::I64(0),
            ValueKind::F32 => Val::F32(0),
            ValueKind::F64 => Val::F64(0),
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ValueKind::I32 => "i32",
            ValueKind::U32 => "u32",
            ValueKind::I64 => "i64",
            ValueKind::U64 => "u64",
            ValueKind::F32 => "f32",
            ValueKind::F64 => "f64",
            ValueKind::Word => "word",
        };
        write!(f, "{}", name)
    }
}

/// A single tagged scalar crossing the call boundary in either direction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WasmValue {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Word(Word),
}

impl WasmValue {
    /// The kind tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            WasmValue::I32(_) => ValueKind::I32,
            WasmValue::U32(_) => ValueKind::U32,
            WasmValue::I64(_) => ValueKind::I64,
            WasmValue::U64(_) => ValueKind::U64,
            WasmValue::F32(_) => ValueKind::F32,
            WasmValue::F64(_) => ValueKind::F64,
            WasmValue::Word(_) => ValueKind::Word,
        }
    }

    /// Packs the value into the runtime's untagged representation.
    pub(crate) fn to_wire(&self) -> Val {
        match *self {
            WasmValue::I32(x) => Val::I32(x),
            WasmValue::U32(x) => Val::I32(x as i32),
            WasmValue::I64(x) => Val::I64(x),
            WasmValue::U64(x) => Val::I64(x as i64),
            WasmValue::F32(x) => Val::F32(x.to_bits()),
            WasmValue::F64(x) => Val::F64(x.to_bits()),
            WasmValue::Word(w) => Val::I32(w.0 as i32),
        }
    }

    /// Decodes an untagged runtime value as the given kind.  Returns `None`
    /// if the wire type does not carry that kind.
    pub(crate) fn from_wire(kind: ValueKind, value: &Val) -> Option<WasmValue> {
        let decoded = match (kind, value) {
            (ValueKind::I32, Val::I32(x)) => WasmValue::I32(*x),
            (ValueKind::U32, Val::I32(x)) => WasmValue::U32(*x as u32),
            (ValueKind::Word, Val::I32(x)) => WasmValue::Word(Word(*x as u32)),
            (ValueKind::I64, Val::I64(x)) => WasmValue::I64(*x),
            (ValueKind::U64, Val::I64(x)) => WasmValue::U64(*x as u64),
            (ValueKind::F32, Val::F32(bits)) => WasmValue::F32(f32::from_bits(*bits)),
            (ValueKind::F64, Val::F64(bits)) => WasmValue::F64(f64::from_bits(*bits)),
            _otherwise => return None,
        };
        Some(decoded)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Signatures.
////////////////////////////////////////////////////////////////////////////////

/// A host-side call signature: an ordered list of parameter kinds and an
/// optional return kind.
///
/// One runtime-polymorphic descriptor drives both signature validation of a
/// looked-up export and argument packing/unpacking, for every arity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Signature {
    params: Vec<ValueKind>,
    ret: Option<ValueKind>,
}

impl Signature {
    /// Creates a signature from parameter kinds and an optional return kind.
    pub fn new(params: impl Into<Vec<ValueKind>>, ret: Option<ValueKind>) -> Self {
        Self {
            params: params.into(),
            ret,
        }
    }

    /// The parameter kinds, in declared order.
    #[inline]
    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    /// The return kind, or `None` for a void function.
    #[inline]
    pub fn ret(&self) -> Option<ValueKind> {
        self.ret
    }

    /// The runtime function type this signature is carried as on the wire.
    pub(crate) fn wire_type(&self) -> FuncType {
        FuncType::new(
            self.params.iter().map(|kind| kind.wire_type()),
            self.ret.iter().map(|kind| kind.wire_type()),
        )
    }

    /// Checks whether a runtime function type is wire-compatible with this
    /// signature.
    pub(crate) fn matches(&self, actual: &FuncType) -> bool {
        let expected = self.wire_type();
        expected.params().eq(actual.params()) && expected.results().eq(actual.results())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(")?;
        for (i, kind) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", kind)?;
        }
        match self.ret {
            Some(kind) => write!(f, ") -> {}", kind),
            None => write!(f, ") -> ()"),
        }
    }
}

/// Renders a runtime value type for diagnostics.
pub(crate) fn val_type_name(ty: &ValType) -> &'static str {
    match ty {
        ValType::I32 => "i32",
        ValType::I64 => "i64",
        ValType::F32 => "f32",
        ValType::F64 => "f64",
        ValType::V128 => "v128",
        ValType::FuncRef => "funcref",
        ValType::ExternRef => "externref",
    }
}

/// Renders a runtime function type for diagnostics, e.g. `(i32, i32) -> i32`.
pub(crate) fn describe_func_type(ty: &FuncType) -> String {
    let params: Vec<&str> = ty.params().map(|t| val_type_name(&t)).collect();
    let results: Vec<&str> = ty.results().map(|t| val_type_name(&t)).collect();
    match results.as_slice() {
        [] => format!("({}) -> ()", params.join(", ")),
        [single] => format!("({}) -> {}", params.join(", "), single),
        many => format!("({}) -> ({})", params.join(", "), many.join(", ")),
    }
}
