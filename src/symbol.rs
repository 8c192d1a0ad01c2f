use std::borrow::Cow;
use std::collections::HashMap;

use crate::error::LispResult;
use crate::heap::{GlobalSlot, Heap, Record};
use crate::value::{PackedName, RecordId, Sym, Value};

/// Buckets in the global binding table.
const GLOBAL_BUCKETS: usize = 64;

/// Well-known symbols. All of them pack inline, so they exist before any
/// table or heap does.
pub mod sym {
    use crate::value::{PackedName, Sym};

    const fn short(name: &str) -> Sym {
        match PackedName::pack(name) {
            Some(packed) => Sym::Short(packed),
            None => panic!("well-known symbol does not pack inline"),
        }
    }

    pub const T: Sym = short("t");
    pub const NIL: Sym = short("nil");
    pub const QUOTE: Sym = short("quote");
    pub const LAMBDA: Sym = short("lambda");
    pub const IF: Sym = short("if");
    pub const PROGN: Sym = short("progn");
    pub const SETQ: Sym = short("setq");
    pub const SETQQ: Sym = short("setqq");
    pub const DEFINE: Sym = short("define");
    pub const DE: Sym = short("de");
    pub const AND: Sym = short("and");
    pub const OR: Sym = short("or");
    pub const COND: Sym = short("cond");
}

/// Printable name of a symbol. Heap names live in their `Symbol` record,
/// so no table is needed.
pub fn symbol_name(heap: &Heap, sym: Sym) -> Cow<'_, str> {
    match sym {
        Sym::Short(packed) => Cow::Owned(packed.unpack()),
        Sym::Heap(id) => match heap.get(id) {
            Ok(Record::Symbol(name)) => Cow::Borrowed(&**name),
            _ => Cow::Borrowed("#<stale>"),
        },
    }
}

struct GlobalEntry {
    symbol: Sym,
    slot: GlobalSlot,
    next: Option<u32>,
}

/// Interned symbols plus the global bindings keyed by them. The bound
/// values live in the heap's root set; entries here only find them.
///
/// Names that pack inline never reach this table. Longer names get one
/// permanent `Symbol` record in the heap, shared by every later read.
pub struct SymbolTable {
    interned: HashMap<Box<str>, RecordId>,
    buckets: [Option<u32>; GLOBAL_BUCKETS],
    globals: Vec<GlobalEntry>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            interned: HashMap::new(),
            buckets: [None; GLOBAL_BUCKETS],
            globals: Vec::new(),
        }
    }

    /// Canonical symbol for `name`, allocating its record on first sight.
    pub fn intern(&mut self, heap: &mut Heap, name: &str) -> LispResult<Sym> {
        if let Some(packed) = PackedName::pack(name) {
            return Ok(Sym::Short(packed));
        }
        if let Some(&id) = self.interned.get(name) {
            return Ok(Sym::Heap(id));
        }
        let id = heap.allocate(Record::Symbol(name.into()))?;
        self.interned.insert(name.into(), id);
        Ok(Sym::Heap(id))
    }

    /// Symbol for `name` if it has already been interned. Inline names
    /// always exist.
    pub fn lookup(&self, name: &str) -> Option<Sym> {
        match PackedName::pack(name) {
            Some(packed) => Some(Sym::Short(packed)),
            None => self.interned.get(name).map(|&id| Sym::Heap(id)),
        }
    }

    pub fn name<'h>(&self, heap: &'h Heap, sym: Sym) -> Cow<'h, str> {
        symbol_name(heap, sym)
    }

    /// Number of symbols holding a heap record.
    pub fn count(&self) -> usize {
        self.interned.len()
    }

    // === Global bindings ===

    fn bucket(sym: Sym) -> usize {
        let key = match sym {
            Sym::Short(packed) => packed.bits(),
            Sym::Heap(id) => id.index ^ id.generation.rotate_left(16) ^ 0x8000_0000,
        };
        (key.wrapping_mul(0x9E37_79B9) >> 26) as usize
    }

    pub fn find_global(&self, sym: Sym) -> Option<GlobalSlot> {
        let mut cursor = self.buckets[Self::bucket(sym)];
        while let Some(index) = cursor {
            let entry = &self.globals[index as usize];
            if entry.symbol == sym {
                return Some(entry.slot);
            }
            cursor = entry.next;
        }
        None
    }

    /// Slot for `sym`, created bound to nil if absent.
    pub fn binding_slot(&mut self, heap: &mut Heap, sym: Sym) -> GlobalSlot {
        if let Some(slot) = self.find_global(sym) {
            return slot;
        }
        let bucket = Self::bucket(sym);
        let index = self.globals.len() as u32;
        let slot = heap.add_global();
        self.globals.push(GlobalEntry {
            symbol: sym,
            slot,
            next: self.buckets[bucket],
        });
        self.buckets[bucket] = Some(index);
        slot
    }

    pub fn define_global(&mut self, heap: &mut Heap, sym: Sym, value: Value) {
        let slot = self.binding_slot(heap, sym);
        heap.set_global(slot, value);
    }

    pub fn global_count(&self) -> usize {
        self.globals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_stay_out_of_the_heap() {
        let mut heap = Heap::new(16, 4);
        let mut table = SymbolTable::new();
        let a = table.intern(&mut heap, "car").unwrap();
        let b = table.intern(&mut heap, "car").unwrap();
        assert_eq!(a, b);
        assert!(matches!(a, Sym::Short(_)));
        assert_eq!(heap.live_count(), 0);
        assert_eq!(table.name(&heap, a), "car");
    }

    #[test]
    fn long_names_get_one_record() {
        let mut heap = Heap::new(16, 4);
        let mut table = SymbolTable::new();
        let a = table.intern(&mut heap, "substring").unwrap();
        let b = table.intern(&mut heap, "substring").unwrap();
        let c = table.intern(&mut heap, "x+1").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.live_count(), 2);
        assert_eq!(table.count(), 2);
        assert_eq!(table.name(&heap, a), "substring");
        assert_eq!(table.lookup("x+1"), Some(c));
        assert_eq!(table.lookup("never-seen"), None);
    }

    #[test]
    fn names_with_digits_stay_inline() {
        let mut heap = Heap::new(16, 4);
        let mut table = SymbolTable::new();
        let a = table.intern(&mut heap, "x1").unwrap();
        assert!(matches!(a, Sym::Short(_)));
        assert_eq!(table.intern(&mut heap, "x1").unwrap(), a);
        assert_eq!(table.name(&heap, a), "x1");
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn well_known_symbols_match_interning() {
        let mut heap = Heap::new(16, 4);
        let mut table = SymbolTable::new();
        assert_eq!(table.intern(&mut heap, "lambda").unwrap(), sym::LAMBDA);
        assert_eq!(table.intern(&mut heap, "setqq").unwrap(), sym::SETQQ);
        assert_eq!(table.intern(&mut heap, "t").unwrap(), sym::T);
    }

    #[test]
    fn globals_survive_bucket_collisions() {
        let mut heap = Heap::new(1024, 4);
        let mut table = SymbolTable::new();
        let syms: Vec<Sym> = (0..500)
            .map(|i| table.intern(&mut heap, &format!("global-{}", i)).unwrap())
            .collect();
        for (i, &s) in syms.iter().enumerate() {
            table.define_global(&mut heap, s, Value::Int(i as i32));
        }
        for (i, &s) in syms.iter().enumerate() {
            let slot = table.find_global(s).unwrap();
            assert_eq!(heap.global(slot), Value::Int(i as i32));
        }
        assert_eq!(table.global_count(), 500);
    }

    #[test]
    fn binding_slot_is_stable() {
        let mut heap = Heap::new(16, 4);
        let mut table = SymbolTable::new();
        assert_eq!(table.find_global(sym::COND), None);
        let slot = table.binding_slot(&mut heap, sym::COND);
        assert_eq!(heap.global(slot), Value::Nil);
        heap.set_global(slot, Value::Int(5));
        assert_eq!(table.binding_slot(&mut heap, sym::COND), slot);
        assert_eq!(heap.global(slot), Value::Int(5));
    }
}
