use std::fmt;

/// Handle to a heap record: slot index plus the generation the slot had
/// when the record was allocated. Copy semantics, the record lives in the heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub index: u32,
    pub generation: u32,
}

/// A symbol name of up to six characters packed into one word as base-40
/// digits, first character lowest. Code 0 terminates; 1..=26 are `a`..`z`,
/// 27..=36 are `0`..`9`, and 37, 38, 39 are `-`, `?`, `/`. Six base-40
/// digits stay below `u32::MAX`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedName(u32);

pub const PACKED_MAX_LEN: usize = 6;
const PACKED_RADIX: u32 = 40;

impl PackedName {
    /// Pack `name` inline, or `None` if it is empty, too long, or uses a
    /// character outside the inline alphabet.
    pub const fn pack(name: &str) -> Option<PackedName> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() > PACKED_MAX_LEN {
            return None;
        }
        let mut word: u32 = 0;
        let mut place: u32 = 1;
        let mut i = 0;
        while i < bytes.len() {
            let code = match char_code(bytes[i]) {
                Some(code) => code,
                None => return None,
            };
            word += code as u32 * place;
            if i + 1 < bytes.len() {
                place *= PACKED_RADIX;
            }
            i += 1;
        }
        Some(PackedName(word))
    }

    pub fn unpack(self) -> String {
        let mut name = String::with_capacity(PACKED_MAX_LEN);
        let mut word = self.0;
        for _ in 0..PACKED_MAX_LEN {
            match code_char(word % PACKED_RADIX) {
                Some(c) => name.push(c),
                None => break,
            }
            word /= PACKED_RADIX;
        }
        name
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

const fn char_code(byte: u8) -> Option<u8> {
    match byte {
        b'a'..=b'z' => Some(byte - b'a' + 1),
        b'0'..=b'9' => Some(byte - b'0' + 27),
        b'-' => Some(37),
        b'?' => Some(38),
        b'/' => Some(39),
        _ => None,
    }
}

fn code_char(code: u32) -> Option<char> {
    match code {
        1..=26 => Some((b'a' + (code - 1) as u8) as char),
        27..=36 => Some((b'0' + (code - 27) as u8) as char),
        37 => Some('-'),
        38 => Some('?'),
        39 => Some('/'),
        _ => None,
    }
}

/// A canonical symbol. Both encodings compare by identity only: a name
/// that packs inline is never given a heap record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sym {
    Short(PackedName),
    Heap(RecordId),
}

/// Smallest and largest integers carried as immediates (30-bit signed).
pub const IMMEDIATE_MIN: i64 = -(1 << 29);
pub const IMMEDIATE_MAX: i64 = (1 << 29) - 1;

/// The fundamental Lisp value. 12 bytes at most, always `Copy`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Nil,
    Int(i32),
    Symbol(Sym),
    Ref(RecordId),
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl Value {
    /// Immediate for `n`, or `None` if it needs a boxed record.
    pub fn immediate(n: i64) -> Option<Value> {
        if (IMMEDIATE_MIN..=IMMEDIATE_MAX).contains(&n) {
            Some(Value::Int(n as i32))
        } else {
            None
        }
    }

    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_symbol(self) -> Option<Sym> {
        match self {
            Value::Symbol(sym) => Some(sym),
            _ => None,
        }
    }

    pub fn as_ref(self) -> Option<RecordId> {
        match self {
            Value::Ref(id) => Some(id),
            _ => None,
        }
    }

    pub fn from_bool(b: bool) -> Value {
        if b {
            Value::Symbol(crate::symbol::sym::T)
        } else {
            Value::Nil
        }
    }
}

/// The closed set of runtime types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    String,
    Pair,
    /// Immediate integers and the boxed legacy records alike.
    Integer,
    Primitive,
    Symbol,
    Thunk,
    ActiveThunk,
    Closure,
}

impl Tag {
    pub const ALL: [Tag; 8] = [
        Tag::String,
        Tag::Pair,
        Tag::Integer,
        Tag::Primitive,
        Tag::Symbol,
        Tag::Thunk,
        Tag::ActiveThunk,
        Tag::Closure,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Tag::String => "string",
            Tag::Pair => "pair",
            Tag::Integer => "integer",
            Tag::Primitive => "primitive",
            Tag::Symbol => "symbol",
            Tag::Thunk => "thunk",
            Tag::ActiveThunk => "active-thunk",
            Tag::Closure => "closure",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Symbol(sym) => write!(f, "{:?}", sym),
            Value::Ref(id) => write!(f, "Ref({:?})", id),
        }
    }
}

impl fmt::Debug for Sym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sym::Short(p) => write!(f, "Sym({})", p.unpack()),
            Sym::Heap(id) => write!(f, "Sym({:?})", id),
        }
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.generation)
    }
}

impl fmt::Debug for PackedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackedName({})", self.unpack())
    }
}
