use crate::heap::{Heap, Record};
use crate::symbol::symbol_name;
use crate::value::Value;

/// Deeper nesting than this prints as `...`.
const MAX_DEPTH: usize = 1000;
/// Longest list printed in full; guards against cdr cycles.
const MAX_ELEMENTS: usize = 10_000;

/// Print a value to a string.
pub fn print_val(val: Value, heap: &Heap) -> String {
    let mut out = String::new();
    print_inner(val, heap, &mut out, 0);
    out
}

fn print_inner(val: Value, heap: &Heap, out: &mut String, depth: usize) {
    if depth > MAX_DEPTH {
        out.push_str("...");
        return;
    }

    match val {
        Value::Nil => out.push_str("nil"),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Symbol(sym) => out.push_str(&symbol_name(heap, sym)),
        Value::Ref(id) => match heap.get(id) {
            Err(_) => out.push_str("#<stale>"),
            Ok(Record::String(text)) => out.push_str(text),
            Ok(Record::BoxedInt(n)) => out.push_str(&n.to_string()),
            Ok(Record::Symbol(name)) => out.push_str(name),
            Ok(Record::Primitive(prim)) => {
                out.push('#');
                out.push_str(prim.name);
            }
            Ok(Record::Thunk { expr, .. }) => {
                out.push_str("#thunk[");
                print_inner(*expr, heap, out, depth + 1);
                out.push(']');
            }
            Ok(Record::ActiveThunk { expr, .. }) => {
                out.push_str("#active-thunk[");
                print_inner(*expr, heap, out, depth + 1);
                out.push(']');
            }
            Ok(Record::Closure { lambda, .. }) => {
                out.push_str("#closure[");
                print_inner(*lambda, heap, out, depth + 1);
                out.push(']');
            }
            Ok(Record::Pair { car, cdr }) => print_list(*car, *cdr, heap, out, depth),
        },
    }
}

fn print_list(car: Value, cdr: Value, heap: &Heap, out: &mut String, depth: usize) {
    out.push('(');
    print_inner(car, heap, out, depth + 1);

    let mut current = cdr;
    let mut count = 1;
    loop {
        match heap.pair(current) {
            Ok(Some((next_car, next_cdr))) => {
                if count >= MAX_ELEMENTS {
                    out.push_str(" ...");
                    break;
                }
                out.push(' ');
                print_inner(next_car, heap, out, depth + 1);
                current = next_cdr;
                count += 1;
            }
            _ if current.is_nil() => break,
            _ => {
                out.push_str(" . ");
                print_inner(current, heap, out, depth + 1);
                break;
            }
        }
    }
    out.push(')');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{Native, Primitive};
    use crate::reader::Reader;
    use crate::symbol::SymbolTable;

    fn round_trip(text: &str) -> String {
        let mut heap = Heap::new(256, 8);
        let mut symbols = SymbolTable::new();
        let val = Reader::new(text, &mut heap, &mut symbols).read().unwrap().unwrap();
        print_val(val, &heap)
    }

    #[test]
    fn prints_atoms() {
        assert_eq!(round_trip("42"), "42");
        assert_eq!(round_trip("-7"), "-7");
        assert_eq!(round_trip("nil"), "nil");
        assert_eq!(round_trip("hello"), "hello");
        assert_eq!(round_trip("long-symbol-name"), "long-symbol-name");
        assert_eq!(round_trip("\"raw text\""), "raw text");
        assert_eq!(round_trip("9000000000"), "9000000000");
    }

    #[test]
    fn prints_lists() {
        assert_eq!(round_trip("(+ 3 4)"), "(+ 3 4)");
        assert_eq!(round_trip("(a (b c) ())"), "(a (b c) nil)");
        assert_eq!(round_trip("(a . b)"), "(a . b)");
        assert_eq!(round_trip("(1 2 . 3)"), "(1 2 . 3)");
        assert_eq!(round_trip("'x"), "(quote x)");
    }

    #[test]
    fn prints_records() {
        fn noop(_: &mut crate::eval::Machine) -> crate::error::LispResult<Value> {
            Ok(Value::Nil)
        }
        let mut heap = Heap::new(16, 4);
        let prim = heap
            .allocate(Record::Primitive(Primitive {
                name: "noop",
                native: Native::Fixed0(noop),
            }))
            .unwrap();
        assert_eq!(print_val(Value::Ref(prim), &heap), "#noop");
        let thunk = heap
            .allocate(Record::Thunk { expr: Value::Int(3), env: Value::Nil })
            .unwrap();
        assert_eq!(print_val(Value::Ref(thunk), &heap), "#thunk[3]");
    }

    #[test]
    fn cyclic_lists_terminate() {
        let mut heap = Heap::new(16, 4);
        let cell = heap.cons(Value::Int(1), Value::Nil).unwrap();
        heap.set_cdr(cell, cell).unwrap();
        let text = print_val(cell, &heap);
        assert!(text.ends_with(" ...)"));
    }

    #[test]
    fn stale_references_print_safely() {
        let mut heap = Heap::new(16, 4);
        let cell = heap.cons(Value::Int(1), Value::Nil).unwrap();
        heap.release(cell.as_ref().unwrap()).unwrap();
        assert_eq!(print_val(cell, &heap), "#<stale>");
    }
}
