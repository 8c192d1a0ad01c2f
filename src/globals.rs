use crate::error::LispResult;
use crate::heap::Heap;
use crate::symbol::sym;
use crate::value::{RecordId, Sym, Value};

/// Build the initial environment chain.
/// Each entry is a `(name . value)` cell. Pre-installs:
///   - t = t
///   - nil = nil
///
/// Primitives live in the global binding table, not in this chain.
pub fn initial_env(heap: &mut Heap) -> LispResult<Value> {
    let mut env = Value::Nil;

    macro_rules! def_global {
        ($sym:expr, $val:expr) => {
            env = env_extend(heap, $sym, $val, env)?;
        };
    }

    def_global!(sym::NIL, Value::Nil);
    def_global!(sym::T, Value::Symbol(sym::T));

    Ok(env)
}

/// Look up a binding in an environment chain.
/// Returns the `(name . value)` cell if found.
pub fn env_lookup(name: Sym, env: Value, heap: &Heap) -> LispResult<Option<RecordId>> {
    let mut current = env;
    while let Some((binding, rest)) = heap.pair(current)? {
        if let Some((bname, _)) = heap.pair(binding)? {
            if bname == Value::Symbol(name) {
                return Ok(binding.as_ref());
            }
        }
        current = rest;
    }
    Ok(None)
}

/// Prepend a fresh `(name . val)` cell to `env`.
pub fn env_extend(heap: &mut Heap, name: Sym, val: Value, env: Value) -> LispResult<Value> {
    let cell = heap.cons(Value::Symbol(name), val)?;
    heap.cons(cell, env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_env_binds_t_and_nil() {
        let mut heap = Heap::new(16, 4);
        let env = initial_env(&mut heap).unwrap();
        let t = env_lookup(sym::T, env, &heap).unwrap().unwrap();
        assert_eq!(heap.cdr(Value::Ref(t)).unwrap(), Value::Symbol(sym::T));
        let nil = env_lookup(sym::NIL, env, &heap).unwrap().unwrap();
        assert_eq!(heap.cdr(Value::Ref(nil)).unwrap(), Value::Nil);
        assert_eq!(env_lookup(sym::COND, env, &heap).unwrap(), None);
    }

    #[test]
    fn inner_bindings_shadow_outer() {
        let mut heap = Heap::new(16, 4);
        let outer = env_extend(&mut heap, sym::IF, Value::Int(1), Value::Nil).unwrap();
        let inner = env_extend(&mut heap, sym::IF, Value::Int(2), outer).unwrap();
        let cell = env_lookup(sym::IF, inner, &heap).unwrap().unwrap();
        assert_eq!(heap.cdr(Value::Ref(cell)).unwrap(), Value::Int(2));
        let cell = env_lookup(sym::IF, outer, &heap).unwrap().unwrap();
        assert_eq!(heap.cdr(Value::Ref(cell)).unwrap(), Value::Int(1));
    }
}
