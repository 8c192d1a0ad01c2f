use std::fmt;
use std::mem;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::{LispError, LispResult};
use crate::eval::{Machine, Step};
use crate::value::{RecordId, Tag, Value};

/// Largest fixed arity served from the on-stack argument buffer.
pub const MAX_BUFFERED_ARGS: usize = 6;

/// Arity codes reported for the non-fixed calling conventions.
pub const ARITY_VARIADIC: i8 = 7;
pub const ARITY_SPECIAL: i8 = -1;
pub const ARITY_IF: i8 = -7;
pub const ARITY_LAMBDA: i8 = -16;

/// Calling convention and entry point of a primitive.
///
/// Evaluated conventions receive their arguments already evaluated; the
/// special ones get the caller's environment and the raw argument forms.
#[derive(Clone, Copy)]
pub enum Native {
    Fixed0(fn(&mut Machine) -> LispResult<Value>),
    Fixed1(fn(&mut Machine, Value) -> LispResult<Value>),
    Fixed2(fn(&mut Machine, Value, Value) -> LispResult<Value>),
    Fixed3(fn(&mut Machine, Value, Value, Value) -> LispResult<Value>),
    /// 4 to 6 evaluated arguments passed through a small stack buffer.
    Buffered(u8, fn(&mut Machine, &[Value]) -> LispResult<Value>),
    /// Any number of evaluated arguments, passed as a list.
    Variadic(fn(&mut Machine, Value) -> LispResult<Value>),
    /// `(env, raw args)`.
    Special(fn(&mut Machine, &mut Value, Value) -> LispResult<Step>),
    /// `(env, test, then, else-forms)`.
    If(fn(&mut Machine, &mut Value, Value, Value, Value) -> LispResult<Step>),
    /// `(lambda-form, env)`.
    Lambda(fn(&mut Machine, Value, Value) -> LispResult<Value>),
}

impl Native {
    pub fn arity_code(self) -> i8 {
        match self {
            Native::Fixed0(_) => 0,
            Native::Fixed1(_) => 1,
            Native::Fixed2(_) => 2,
            Native::Fixed3(_) => 3,
            Native::Buffered(n, _) => n as i8,
            Native::Variadic(_) => ARITY_VARIADIC,
            Native::Special(_) => ARITY_SPECIAL,
            Native::If(_) => ARITY_IF,
            Native::Lambda(_) => ARITY_LAMBDA,
        }
    }

    /// Number of arguments for the fixed conventions.
    pub fn fixed_arity(self) -> Option<usize> {
        match self.arity_code() {
            n @ 0..=6 => Some(n as usize),
            _ => None,
        }
    }
}

#[derive(Clone, Copy)]
pub struct Primitive {
    pub name: &'static str,
    pub native: Native,
}

/// A heap record. Every variant maps to exactly one `Tag`.
pub enum Record {
    String(String),
    Pair { car: Value, cdr: Value },
    BoxedInt(i64),
    Primitive(Primitive),
    Symbol(Box<str>),
    Thunk { expr: Value, env: Value },
    ActiveThunk { expr: Value, env: Value },
    Closure { lambda: Value, env: Value },
}

impl Record {
    pub fn tag(&self) -> Tag {
        match self {
            Record::String(_) => Tag::String,
            Record::Pair { .. } => Tag::Pair,
            Record::BoxedInt(_) => Tag::Integer,
            Record::Primitive(_) => Tag::Primitive,
            Record::Symbol(_) => Tag::Symbol,
            Record::Thunk { .. } => Tag::Thunk,
            Record::ActiveThunk { .. } => Tag::ActiveThunk,
            Record::Closure { .. } => Tag::Closure,
        }
    }

    /// Symbols and primitives live for the whole life of the heap.
    fn is_permanent(&self) -> bool {
        matches!(self, Record::Symbol(_) | Record::Primitive(_))
    }

    fn size_class(&self) -> SizeClass {
        match self {
            Record::String(s) if s.capacity() <= SHORT_STRING_BYTES => SizeClass::ShortString,
            Record::String(_) => SizeClass::Oversize,
            _ => SizeClass::Cell,
        }
    }

    /// The two values a record refers to, for records that refer to any.
    fn fields(&self) -> Option<(Value, Value)> {
        match self {
            Record::Pair { car, cdr } => Some((*car, *cdr)),
            Record::Thunk { expr, env } | Record::ActiveThunk { expr, env } => Some((*expr, *env)),
            Record::Closure { lambda, env } => Some((*lambda, *env)),
            _ => None,
        }
    }

    /// Bytes attributed to this record in allocation reports.
    pub fn footprint(&self) -> usize {
        mem::size_of::<Record>()
            + match self {
                Record::String(s) => s.capacity(),
                Record::Symbol(name) => name.len(),
                _ => 0,
            }
    }
}

/// Strings whose buffer fits here are recycled with their buffer.
pub const SHORT_STRING_BYTES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeClass {
    Cell,
    ShortString,
    Oversize,
}

impl SizeClass {
    fn free_list(self) -> Option<usize> {
        match self {
            SizeClass::Cell => Some(0),
            SizeClass::ShortString => Some(1),
            SizeClass::Oversize => None,
        }
    }
}

struct Slot {
    generation: u32,
    marked: bool,
    record: Option<Box<Record>>,
}

#[derive(Clone, Copy, Default)]
struct TagCounters {
    allocated: u64,
    live: usize,
    bytes: usize,
}

/// Handle to a global binding's value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalSlot(u32);

/// One active `evaluate` call. The collector roots both fields.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    pub expr: Value,
    pub env: Value,
}

/// Everything the collector treats as live. It sits beside the slot table
/// so a full table can collect before giving up.
#[derive(Default)]
pub struct RootSet {
    /// Top-level environment chain: `t`, `nil` and every top-level `define`.
    pub global_env: Value,
    pub frames: Vec<Frame>,
    /// Function heads, arguments and native intermediates not yet consumed.
    pub scratch: Vec<Value>,
    /// Thunks currently being run by some trampoline.
    pub active_thunks: Vec<RecordId>,
    globals: Vec<Value>,
    /// Records allocated since the evaluator last passed a safe point. Host
    /// and native code may still hold them in locals.
    pinned: Vec<RecordId>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GcStats {
    pub cycles: u64,
    pub freed: u64,
    pub last_freed: usize,
    pub last_duration: Duration,
}

/// The record arena. All heap values are allocated here and addressed by
/// `RecordId`; the table never holds more than `capacity` live records.
pub struct Heap {
    slots: Vec<Slot>,
    capacity: usize,
    live: usize,
    /// Round-robin position for the vacant-slot scan.
    cursor: usize,
    free: [Vec<Box<Record>>; 2],
    free_list_limit: usize,
    counters: [TagCounters; 8],
    reused: u64,
    pub roots: RootSet,
    gc_stats: GcStats,
}

impl Heap {
    pub fn new(capacity: usize, free_list_limit: usize) -> Self {
        Heap {
            slots: Vec::with_capacity(capacity.min(1024)),
            capacity,
            live: 0,
            cursor: 0,
            free: [Vec::new(), Vec::new()],
            free_list_limit,
            counters: [TagCounters::default(); 8],
            reused: 0,
            roots: RootSet::default(),
            gc_stats: GcStats::default(),
        }
    }

    /// Allocate a record. Strings should go through `alloc_string` so their
    /// buffers can be recycled.
    pub fn allocate(&mut self, record: Record) -> LispResult<RecordId> {
        self.ensure_room(record.fields())?;
        let shell = match record.size_class().free_list().and_then(|i| self.free[i].pop()) {
            Some(mut shell) => {
                *shell = record;
                self.reused += 1;
                shell
            }
            None => Box::new(record),
        };
        Ok(self.install(shell))
    }

    pub fn alloc_string(&mut self, text: &str) -> LispResult<RecordId> {
        self.ensure_room(None)?;
        let shell = if text.len() <= SHORT_STRING_BYTES {
            match self.free[1].pop() {
                Some(mut shell) => {
                    match shell.as_mut() {
                        Record::String(buf) => {
                            buf.clear();
                            buf.push_str(text);
                        }
                        other => *other = Record::String(text.to_owned()),
                    }
                    self.reused += 1;
                    shell
                }
                None => {
                    let mut buf = String::with_capacity(SHORT_STRING_BYTES);
                    buf.push_str(text);
                    Box::new(Record::String(buf))
                }
            }
        } else {
            Box::new(Record::String(text.to_owned()))
        };
        Ok(self.install(shell))
    }

    /// Make room for one more record, collecting first when the table is
    /// full. `pending` are the fields of the record about to be installed.
    fn ensure_room(&mut self, pending: Option<(Value, Value)>) -> LispResult<()> {
        if self.live < self.capacity {
            return Ok(());
        }
        debug!(live = self.live, "arena full, collecting");
        self.collect_with(pending)?;
        if self.live < self.capacity {
            return Ok(());
        }
        error!(
            live = self.live,
            capacity = self.capacity,
            "arena exhausted\n{}",
            self.report()
        );
        Err(LispError::ArenaExhausted {
            live: self.live,
            capacity: self.capacity,
        })
    }

    fn install(&mut self, record: Box<Record>) -> RecordId {
        let index = self.vacant_slot();
        let tag = record.tag();
        let bytes = record.footprint();
        let slot = &mut self.slots[index];
        slot.record = Some(record);
        slot.marked = false;
        let id = RecordId {
            index: index as u32,
            generation: slot.generation,
        };
        self.live += 1;
        let counters = &mut self.counters[tag.index()];
        counters.allocated += 1;
        counters.live += 1;
        counters.bytes += bytes;
        self.roots.pinned.push(id);
        id
    }

    /// Index of a free slot. Grows the table while it has no holes,
    /// otherwise scans round-robin from where the last scan stopped.
    fn vacant_slot(&mut self) -> usize {
        if self.live == self.slots.len() {
            self.slots.push(Slot {
                generation: 0,
                marked: false,
                record: None,
            });
            return self.slots.len() - 1;
        }
        let len = self.slots.len();
        loop {
            let index = self.cursor % len;
            self.cursor = (index + 1) % len;
            if self.slots[index].record.is_none() {
                return index;
            }
        }
    }

    /// Return a record's slot to the table. Only the collector and the
    /// trampoline's thunk recycling may call this.
    pub(crate) fn release(&mut self, id: RecordId) -> LispResult<()> {
        self.get(id)?;
        self.vacate(id.index as usize);
        Ok(())
    }

    fn vacate(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let Some(record) = slot.record.take() else {
            return;
        };
        slot.marked = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        let counters = &mut self.counters[record.tag().index()];
        counters.live -= 1;
        counters.bytes -= record.footprint();
        if let Some(list) = record.size_class().free_list() {
            if self.free[list].len() < self.free_list_limit {
                self.free[list].push(record);
            }
        }
    }

    #[inline]
    pub fn get(&self, id: RecordId) -> LispResult<&Record> {
        match self.slots.get(id.index as usize) {
            Some(slot) if slot.generation == id.generation => {
                slot.record.as_deref().ok_or_else(|| stale(id))
            }
            _ => Err(stale(id)),
        }
    }

    #[inline]
    pub fn get_mut(&mut self, id: RecordId) -> LispResult<&mut Record> {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation => {
                slot.record.as_deref_mut().ok_or_else(|| stale(id))
            }
            _ => Err(stale(id)),
        }
    }

    /// Tag of any value; `None` only for nil. Immediates never touch the table.
    pub fn tag_of(&self, val: Value) -> Option<Tag> {
        match val {
            Value::Nil => None,
            Value::Int(_) => Some(Tag::Integer),
            Value::Symbol(_) => Some(Tag::Symbol),
            Value::Ref(id) => self.get(id).ok().map(Record::tag),
        }
    }

    // === Pair helpers ===

    pub fn cons(&mut self, car: Value, cdr: Value) -> LispResult<Value> {
        self.allocate(Record::Pair { car, cdr }).map(Value::Ref)
    }

    /// `(car . cdr)` of a pair, `None` for anything else.
    #[inline]
    pub fn pair(&self, val: Value) -> LispResult<Option<(Value, Value)>> {
        match val {
            Value::Ref(id) => match self.get(id)? {
                Record::Pair { car, cdr } => Ok(Some((*car, *cdr))),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    /// Like `pair`, with nil halves for non-pairs.
    pub fn uncons(&self, val: Value) -> LispResult<(Value, Value)> {
        Ok(self.pair(val)?.unwrap_or((Value::Nil, Value::Nil)))
    }

    pub fn car(&self, val: Value) -> LispResult<Value> {
        Ok(self.uncons(val)?.0)
    }

    pub fn cdr(&self, val: Value) -> LispResult<Value> {
        Ok(self.uncons(val)?.1)
    }

    /// Returns false when `val` is not a pair.
    pub fn set_car(&mut self, val: Value, new: Value) -> LispResult<bool> {
        if let Value::Ref(id) = val {
            if let Record::Pair { car, .. } = self.get_mut(id)? {
                *car = new;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn set_cdr(&mut self, val: Value, new: Value) -> LispResult<bool> {
        if let Value::Ref(id) = val {
            if let Record::Pair { cdr, .. } = self.get_mut(id)? {
                *cdr = new;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Build a proper list from a slice of values.
    pub fn list(&mut self, values: &[Value]) -> LispResult<Value> {
        self.list_with_tail(values, Value::Nil)
    }

    pub fn list_with_tail(&mut self, values: &[Value], tail: Value) -> LispResult<Value> {
        let mut result = tail;
        for &val in values.iter().rev() {
            result = self.cons(val, result)?;
        }
        Ok(result)
    }

    /// A proper list of the scratch roots from `from` to the top. They stay
    /// rooted while the list is built.
    pub fn list_from_scratch(&mut self, from: usize) -> LispResult<Value> {
        let mut result = Value::Nil;
        for i in (from..self.roots.scratch.len()).rev() {
            let val = self.roots.scratch[i];
            result = self.cons(val, result)?;
        }
        Ok(result)
    }

    /// Elements of a list up to its first non-pair tail.
    pub fn list_to_vec(&self, val: Value) -> LispResult<Vec<Value>> {
        let mut result = Vec::new();
        let mut current = val;
        while let Some((car, cdr)) = self.pair(current)? {
            result.push(car);
            current = cdr;
        }
        Ok(result)
    }

    pub fn list_len(&self, val: Value) -> LispResult<usize> {
        let mut count = 0;
        let mut current = val;
        while let Some((_, cdr)) = self.pair(current)? {
            count += 1;
            current = cdr;
        }
        Ok(count)
    }

    // === Integers ===

    /// Immediate when `n` fits in 30 bits, otherwise a boxed record.
    pub fn make_int(&mut self, n: i64) -> LispResult<Value> {
        match Value::immediate(n) {
            Some(val) => Ok(val),
            None => self.allocate(Record::BoxedInt(n)).map(Value::Ref),
        }
    }

    /// Integer payload of either representation.
    pub fn int_value(&self, val: Value) -> LispResult<Option<i64>> {
        match val {
            Value::Int(n) => Ok(Some(n as i64)),
            Value::Ref(id) => match self.get(id)? {
                Record::BoxedInt(n) => Ok(Some(*n)),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    pub fn string_value(&self, val: Value) -> LispResult<Option<&str>> {
        match val {
            Value::Ref(id) => match self.get(id)? {
                Record::String(text) => Ok(Some(text.as_str())),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    // === Thunks ===

    /// Re-tag a pending thunk as in flight and hand back its `(expr, env)`.
    /// `None` if `id` is not a pending thunk.
    pub(crate) fn activate_thunk(&mut self, id: RecordId) -> LispResult<Option<(Value, Value)>> {
        let record = self.get_mut(id)?;
        let Record::Thunk { expr, env } = *record else {
            return Ok(None);
        };
        let bytes = record.footprint();
        *record = Record::ActiveThunk { expr, env };
        let pending = &mut self.counters[Tag::Thunk.index()];
        pending.live -= 1;
        pending.bytes -= bytes;
        let active = &mut self.counters[Tag::ActiveThunk.index()];
        active.live += 1;
        active.bytes += bytes;
        Ok(Some((expr, env)))
    }

    // === Global values ===

    /// A new global value slot, bound to nil.
    pub fn add_global(&mut self) -> GlobalSlot {
        self.roots.globals.push(Value::Nil);
        GlobalSlot(self.roots.globals.len() as u32 - 1)
    }

    pub fn global(&self, slot: GlobalSlot) -> Value {
        self.roots.globals[slot.0 as usize]
    }

    pub fn set_global(&mut self, slot: GlobalSlot, value: Value) {
        self.roots.globals[slot.0 as usize] = value;
    }

    // === Statistics ===

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn occupancy_percent(&self) -> usize {
        self.live * 100 / self.capacity.max(1)
    }

    /// Live records carrying `tag`.
    pub fn live_with_tag(&self, tag: Tag) -> usize {
        self.counters[tag.index()].live
    }

    pub fn report(&self) -> AllocReport {
        AllocReport {
            rows: Tag::ALL
                .iter()
                .map(|&tag| {
                    let c = self.counters[tag.index()];
                    AllocRow {
                        tag,
                        allocated: c.allocated,
                        live: c.live,
                        bytes: c.bytes,
                    }
                })
                .collect(),
            live: self.live,
            capacity: self.capacity,
            reused: self.reused,
        }
    }

    // === GC methods ===

    pub fn gc_stats(&self) -> GcStats {
        self.gc_stats
    }

    /// Forget the pinned records. Only valid where every value still needed
    /// is reachable from the root set.
    pub fn unpin_all(&mut self) {
        self.roots.pinned.clear();
    }

    pub fn pinned_count(&self) -> usize {
        self.roots.pinned.len()
    }

    /// Run a full mark-and-sweep cycle from the root set and the pinned
    /// records. Returns the number of records freed.
    pub fn collect(&mut self) -> LispResult<usize> {
        self.collect_with(None)
    }

    fn collect_with(&mut self, pending: Option<(Value, Value)>) -> LispResult<usize> {
        let started = Instant::now();

        self.mark_roots()?;
        if let Some((first, second)) = pending {
            self.mark(first)?;
            self.mark(second)?;
        }
        let freed = self.sweep()?;

        let elapsed = started.elapsed();
        self.gc_stats.cycles += 1;
        self.gc_stats.freed += freed as u64;
        self.gc_stats.last_freed = freed;
        self.gc_stats.last_duration = elapsed;
        debug!(
            freed,
            live = self.live,
            capacity = self.capacity,
            micros = elapsed.as_micros() as u64,
            "collection"
        );
        Ok(freed)
    }

    fn mark_roots(&mut self) -> LispResult<()> {
        self.mark(self.roots.global_env)?;
        for i in 0..self.roots.frames.len() {
            let frame = self.roots.frames[i];
            self.mark(frame.expr)?;
            self.mark(frame.env)?;
        }
        for i in 0..self.roots.scratch.len() {
            self.mark(self.roots.scratch[i])?;
        }
        for i in 0..self.roots.active_thunks.len() {
            self.mark(Value::Ref(self.roots.active_thunks[i]))?;
        }
        for i in 0..self.roots.globals.len() {
            self.mark(self.roots.globals[i])?;
        }

        // Released thunks leave stale pins behind.
        let slots = &self.slots;
        self.roots.pinned.retain(|id| {
            matches!(slots.get(id.index as usize),
                Some(slot) if slot.generation == id.generation && slot.record.is_some())
        });
        for i in 0..self.roots.pinned.len() {
            self.mark(Value::Ref(self.roots.pinned[i]))?;
        }
        Ok(())
    }

    /// Mark everything reachable from `val`: recursive over the first
    /// field, iterative over the rest, so native depth follows nesting
    /// rather than list length.
    pub fn mark(&mut self, val: Value) -> LispResult<()> {
        let mut current = val;
        loop {
            let Value::Ref(id) = current else {
                return Ok(());
            };
            let slot = match self.slots.get_mut(id.index as usize) {
                Some(slot) if slot.generation == id.generation && slot.record.is_some() => slot,
                _ => {
                    error!(?id, "reachable reference to a reclaimed slot");
                    return Err(LispError::HeapCorruption(format!(
                        "reachable reference {:?} points at a reclaimed slot",
                        id
                    )));
                }
            };
            if slot.marked {
                return Ok(());
            }
            slot.marked = true;
            let Some((first, rest)) = slot.record.as_deref().and_then(Record::fields) else {
                return Ok(());
            };
            self.mark(first)?;
            current = rest;
        }
    }

    /// Release every unmarked, non-permanent record and clear all marks.
    /// Returns the number of records freed.
    pub fn sweep(&mut self) -> LispResult<usize> {
        let mut freed = 0;
        let mut occupied = 0;
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            let permanent = match slot.record.as_deref() {
                Some(record) => record.is_permanent(),
                None if slot.marked => {
                    error!(index, "mark bit set on a vacant slot");
                    return Err(LispError::HeapCorruption(format!(
                        "mark bit set on vacant slot {}",
                        index
                    )));
                }
                None => continue,
            };
            if slot.marked || permanent {
                slot.marked = false;
                occupied += 1;
                continue;
            }
            self.vacate(index);
            freed += 1;
        }
        if occupied != self.live {
            error!(occupied, live = self.live, "live counter disagrees with slot table");
            return Err(LispError::HeapCorruption(format!(
                "{} occupied slots but {} counted live",
                occupied, self.live
            )));
        }
        Ok(freed)
    }

    #[cfg(test)]
    pub(crate) fn is_marked(&self, id: RecordId) -> bool {
        self.slots
            .get(id.index as usize)
            .map(|slot| slot.marked)
            .unwrap_or(false)
    }
}

fn stale(id: RecordId) -> LispError {
    LispError::StaleReference {
        index: id.index,
        generation: id.generation,
    }
}

pub struct AllocRow {
    pub tag: Tag,
    pub allocated: u64,
    pub live: usize,
    pub bytes: usize,
}

/// Per-tag allocation counters, for tuning memory-constrained targets.
pub struct AllocReport {
    pub rows: Vec<AllocRow>,
    pub live: usize,
    pub capacity: usize,
    pub reused: u64,
}

impl AllocReport {
    pub fn row(&self, tag: Tag) -> Option<&AllocRow> {
        self.rows.iter().find(|row| row.tag == tag)
    }
}

impl fmt::Display for AllocReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<13} {:>10} {:>7} {:>9}", "tag", "allocated", "live", "bytes")?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<13} {:>10} {:>7} {:>9}",
                row.tag.name(),
                row.allocated,
                row.live,
                row.bytes
            )?;
        }
        write!(
            f,
            "slots {}/{} live, {} shells reused",
            self.live, self.capacity, self.reused
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(heap: &mut Heap, car: Value, cdr: Value) -> RecordId {
        heap.cons(car, cdr).unwrap().as_ref().unwrap()
    }

    #[test]
    fn allocate_and_read_back() {
        let mut heap = Heap::new(16, 4);
        let id = pair(&mut heap, Value::Int(1), Value::Int(2));
        assert_eq!(heap.pair(Value::Ref(id)).unwrap(), Some((Value::Int(1), Value::Int(2))));
        assert_eq!(heap.live_count(), 1);
        assert_eq!(heap.tag_of(Value::Ref(id)), Some(Tag::Pair));
    }

    #[test]
    fn released_ids_go_stale() {
        let mut heap = Heap::new(16, 4);
        let id = pair(&mut heap, Value::Nil, Value::Nil);
        heap.release(id).unwrap();
        assert!(matches!(heap.get(id), Err(LispError::StaleReference { .. })));
        let again = pair(&mut heap, Value::Int(3), Value::Nil);
        assert_eq!(again.index, id.index);
        assert_ne!(again.generation, id.generation);
        assert!(heap.get(id).is_err());
        assert!(heap.release(id).is_err());
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut heap = Heap::new(3, 4);
        for _ in 0..3 {
            heap.cons(Value::Nil, Value::Nil).unwrap();
        }
        assert_eq!(
            heap.cons(Value::Nil, Value::Nil),
            Err(LispError::ArenaExhausted { live: 3, capacity: 3 })
        );
        assert_eq!(heap.live_count(), 3);
        // everything is still pinned, so the collection frees nothing
        assert_eq!(heap.gc_stats().cycles, 1);
        assert_eq!(heap.gc_stats().last_freed, 0);
    }

    #[test]
    fn reuse_scans_round_robin() {
        let mut heap = Heap::new(4, 4);
        let ids: Vec<_> = (0..4).map(|i| pair(&mut heap, Value::Int(i), Value::Nil)).collect();
        heap.release(ids[1]).unwrap();
        heap.release(ids[3]).unwrap();
        let a = pair(&mut heap, Value::Nil, Value::Nil);
        let b = pair(&mut heap, Value::Nil, Value::Nil);
        assert_eq!(a.index, 1);
        assert_eq!(b.index, 3);
    }

    #[test]
    fn shells_are_recycled_per_size_class() {
        let mut heap = Heap::new(8, 4);
        let s = heap.alloc_string("hello").unwrap();
        let p = pair(&mut heap, Value::Nil, Value::Nil);
        heap.release(s).unwrap();
        heap.release(p).unwrap();
        let s2 = heap.alloc_string("world").unwrap();
        let _p2 = pair(&mut heap, Value::Nil, Value::Nil);
        assert_eq!(heap.report().reused, 2);
        match heap.get(s2).unwrap() {
            Record::String(text) => assert_eq!(text, "world"),
            _ => panic!("expected string"),
        }
    }

    #[test]
    fn oversize_strings_are_not_recycled() {
        let mut heap = Heap::new(8, 4);
        let long = "x".repeat(SHORT_STRING_BYTES * 4);
        let s = heap.alloc_string(&long).unwrap();
        heap.release(s).unwrap();
        heap.alloc_string("short").unwrap();
        assert_eq!(heap.report().reused, 0);
    }

    #[test]
    fn sweep_frees_unmarked_and_keeps_marked() {
        let mut heap = Heap::new(16, 4);
        let inner = heap.cons(Value::Int(1), Value::Nil).unwrap();
        let outer = heap.cons(inner, Value::Nil).unwrap();
        let garbage = pair(&mut heap, Value::Int(9), Value::Nil);

        heap.mark(outer).unwrap();
        assert!(heap.is_marked(inner.as_ref().unwrap()));
        assert_eq!(heap.sweep().unwrap(), 1);
        assert!(heap.get(garbage).is_err());
        assert!(heap.pair(outer).unwrap().is_some());
        assert!(!heap.is_marked(outer.as_ref().unwrap()));
    }

    #[test]
    fn cycles_are_marked_once_and_reclaimed_when_dead() {
        let mut heap = Heap::new(16, 4);
        let a = heap.cons(Value::Int(1), Value::Nil).unwrap();
        let b = heap.cons(Value::Int(2), a).unwrap();
        heap.set_cdr(a, b).unwrap();

        heap.mark(a).unwrap();
        assert_eq!(heap.sweep().unwrap(), 0);
        assert_eq!(heap.sweep().unwrap(), 2);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn permanent_records_survive_sweep() {
        let mut heap = Heap::new(16, 4);
        let sym = heap.allocate(Record::Symbol("symbolic".into())).unwrap();
        assert_eq!(heap.sweep().unwrap(), 0);
        assert!(heap.get(sym).is_ok());
    }

    #[test]
    fn marking_a_stale_reference_is_corruption() {
        let mut heap = Heap::new(16, 4);
        let dead = pair(&mut heap, Value::Nil, Value::Nil);
        heap.release(dead).unwrap();
        let holder = heap.cons(Value::Ref(dead), Value::Nil).unwrap();
        assert!(matches!(heap.mark(holder), Err(LispError::HeapCorruption(_))));
    }

    #[test]
    fn long_lists_mark_without_deep_recursion() {
        let mut heap = Heap::new(200_000, 4);
        let mut list = Value::Nil;
        for i in 0..100_000 {
            list = heap.cons(Value::Int(i), list).unwrap();
        }
        heap.mark(list).unwrap();
        assert_eq!(heap.sweep().unwrap(), 0);
    }

    #[test]
    fn thunk_activation_moves_counters() {
        let mut heap = Heap::new(16, 4);
        let id = heap
            .allocate(Record::Thunk { expr: Value::Int(1), env: Value::Nil })
            .unwrap();
        assert_eq!(heap.live_with_tag(Tag::Thunk), 1);
        let parts = heap.activate_thunk(id).unwrap();
        assert_eq!(parts, Some((Value::Int(1), Value::Nil)));
        assert_eq!(heap.live_with_tag(Tag::Thunk), 0);
        assert_eq!(heap.live_with_tag(Tag::ActiveThunk), 1);
        let report = heap.report();
        assert_eq!(report.row(Tag::Thunk).unwrap().bytes, 0);
        assert_eq!(report.row(Tag::ActiveThunk).unwrap().bytes, mem::size_of::<Record>());
        assert_eq!(heap.activate_thunk(id).unwrap(), None);

        heap.release(id).unwrap();
        let row = heap.report();
        let row = row.row(Tag::ActiveThunk).unwrap();
        assert_eq!((row.live, row.bytes), (0, 0));
    }

    #[test]
    fn full_table_collects_before_failing() {
        let mut heap = Heap::new(3, 4);
        let keep = heap.cons(Value::Int(1), Value::Nil).unwrap();
        heap.roots.scratch.push(keep);
        heap.cons(Value::Int(2), Value::Nil).unwrap();
        heap.cons(Value::Int(3), Value::Nil).unwrap();
        heap.unpin_all();

        let fresh = heap.cons(Value::Int(4), Value::Nil).unwrap();
        assert_eq!(heap.gc_stats().cycles, 1);
        assert_eq!(heap.gc_stats().last_freed, 2);
        assert_eq!(heap.live_count(), 2);
        assert!(heap.pair(keep).unwrap().is_some());
        assert!(heap.pair(fresh).unwrap().is_some());
    }

    #[test]
    fn pinned_and_pending_records_survive_a_full_table() {
        let mut heap = Heap::new(3, 4);
        let old = heap.cons(Value::Int(1), Value::Nil).unwrap();
        heap.cons(Value::Int(2), Value::Nil).unwrap();
        heap.unpin_all();
        let recent = heap.cons(Value::Int(3), Value::Nil).unwrap();

        // `old` is only held here and in the pair being built.
        let outer = heap.cons(old, recent).unwrap();
        assert_eq!(heap.gc_stats().cycles, 1);
        assert_eq!(heap.live_count(), 3);
        assert_eq!(heap.pair(outer).unwrap(), Some((old, recent)));
        assert!(heap.pair(old).unwrap().is_some());
    }

    #[test]
    fn stale_pins_are_dropped() {
        let mut heap = Heap::new(4, 4);
        let id = heap
            .allocate(Record::Thunk { expr: Value::Nil, env: Value::Nil })
            .unwrap();
        heap.release(id).unwrap();
        assert_eq!(heap.pinned_count(), 1);
        assert_eq!(heap.collect().unwrap(), 0);
        assert_eq!(heap.pinned_count(), 0);
    }

    #[test]
    fn globals_are_roots() {
        let mut heap = Heap::new(4, 4);
        let slot = heap.add_global();
        let val = heap.cons(Value::Int(7), Value::Nil).unwrap();
        heap.set_global(slot, val);
        heap.cons(Value::Nil, Value::Nil).unwrap();
        heap.unpin_all();
        assert_eq!(heap.collect().unwrap(), 1);
        assert_eq!(heap.global(slot), val);
        assert!(heap.pair(val).unwrap().is_some());
    }

    #[test]
    fn report_lists_every_tag() {
        let mut heap = Heap::new(16, 4);
        heap.alloc_string("abc").unwrap();
        let report = heap.report();
        assert_eq!(report.rows.len(), Tag::ALL.len());
        assert_eq!(report.row(Tag::String).unwrap().live, 1);
        assert!(report.to_string().contains("string"));
    }
}
