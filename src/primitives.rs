use rand::Rng;
use tracing::debug;

use crate::error::LispResult;
use crate::eval::{Binding, Machine, Step};
use crate::globals::env_extend;
use crate::heap::{Heap, Native};
use crate::symbol::sym;
use crate::value::{Tag, Value};

/// Every built-in, bound globally by `install`.
const BUILTINS: &[(&str, Native)] = &[
    // Special forms
    ("quote", Native::Special(quote)),
    ("if", Native::If(if_form)),
    ("lambda", Native::Lambda(lambda)),
    ("progn", Native::Special(progn)),
    ("setq", Native::Special(setq)),
    ("setqq", Native::Special(setqq)),
    ("define", Native::Special(define)),
    ("de", Native::Special(de)),
    ("and", Native::Special(and)),
    ("or", Native::Special(or)),
    ("cond", Native::Special(cond)),
    // No arguments
    ("terpri", Native::Fixed0(terpri)),
    ("clock", Native::Fixed0(clock)),
    ("gc", Native::Fixed0(gc)),
    ("mem", Native::Fixed0(mem)),
    // One argument
    ("car", Native::Fixed1(car)),
    ("cdr", Native::Fixed1(cdr)),
    ("atom", Native::Fixed1(atom)),
    ("null", Native::Fixed1(null)),
    ("not", Native::Fixed1(null)),
    ("consp", Native::Fixed1(consp)),
    ("symbolp", Native::Fixed1(symbolp)),
    ("numberp", Native::Fixed1(numberp)),
    ("stringp", Native::Fixed1(stringp)),
    ("closurep", Native::Fixed1(closurep)),
    ("length", Native::Fixed1(length)),
    ("reverse", Native::Fixed1(reverse)),
    ("print", Native::Fixed1(print)),
    ("princ", Native::Fixed1(princ)),
    ("read", Native::Fixed1(read)),
    ("random", Native::Fixed1(random)),
    ("intern", Native::Fixed1(intern)),
    ("type-of", Native::Fixed1(type_of)),
    // Two arguments
    ("cons", Native::Fixed2(cons)),
    ("+", Native::Fixed2(add)),
    ("-", Native::Fixed2(sub)),
    ("*", Native::Fixed2(mul)),
    ("/", Native::Fixed2(div)),
    ("%", Native::Fixed2(rem)),
    ("=", Native::Fixed2(num_eq)),
    ("<", Native::Fixed2(lt)),
    (">", Native::Fixed2(gt)),
    ("<=", Native::Fixed2(le)),
    (">=", Native::Fixed2(ge)),
    ("eq", Native::Fixed2(eq)),
    ("equal", Native::Fixed2(equal)),
    ("setcar", Native::Fixed2(setcar)),
    ("setcdr", Native::Fixed2(setcdr)),
    ("set", Native::Fixed2(set)),
    ("eval", Native::Fixed2(eval)),
    ("apply", Native::Fixed2(apply)),
    ("assoc", Native::Fixed2(assoc)),
    ("nth", Native::Fixed2(nth)),
    ("mapcar", Native::Fixed2(mapcar)),
    // Three arguments
    ("substring", Native::Fixed3(substring)),
    // Any number
    ("list", Native::Variadic(list)),
    ("concat", Native::Variadic(concat)),
];

pub fn install(m: &mut Machine) -> LispResult<()> {
    for &(name, native) in BUILTINS {
        m.register(name, native)?;
    }
    Ok(())
}

// ============================================================================
// Argument helpers
// ============================================================================

/// Integer value of `val`, or a diagnostic naming the primitive.
fn number(m: &mut Machine, name: &str, val: Value) -> LispResult<Option<i64>> {
    let n = m.heap.int_value(val)?;
    if n.is_none() {
        let msg = format!("{}: not a number: {}", name, m.print_str(val));
        m.report(&msg);
    }
    Ok(n)
}

fn string(m: &mut Machine, name: &str, val: Value) -> LispResult<Option<String>> {
    let text = m.heap.string_value(val)?.map(str::to_owned);
    if text.is_none() {
        let msg = format!("{}: not a string: {}", name, m.print_str(val));
        m.report(&msg);
    }
    Ok(text)
}

fn not_a_pair(m: &mut Machine, name: &str, val: Value) -> Value {
    let msg = format!("{}: not a pair: {}", name, m.print_str(val));
    m.report(&msg);
    Value::Nil
}

// ============================================================================
// Special forms
// ============================================================================

/// (quote x)
fn quote(m: &mut Machine, _env: &mut Value, args: Value) -> LispResult<Step> {
    Ok(Step::Done(m.heap.car(args)?))
}

/// Evaluate all but the last form of `body`; the last is the tail step.
fn body_step(m: &mut Machine, env: &mut Value, body: Value) -> LispResult<Step> {
    let mut rest = body;
    loop {
        let Some((form, tail)) = m.heap.pair(rest)? else {
            return Ok(Step::Done(Value::Nil));
        };
        if m.heap.pair(tail)?.is_none() {
            return Ok(Step::Tail(form));
        }
        m.evaluate(form, env)?;
        rest = tail;
    }
}

/// (if test then else...) with an implicit progn over the else forms.
fn if_form(
    m: &mut Machine,
    env: &mut Value,
    test: Value,
    then: Value,
    elses: Value,
) -> LispResult<Step> {
    if m.evaluate(test, env)?.is_nil() {
        body_step(m, env, elses)
    } else {
        Ok(Step::Tail(then))
    }
}

/// (lambda params body...)
fn lambda(m: &mut Machine, form: Value, env: Value) -> LispResult<Value> {
    m.make_closure(form, env)
}

/// (progn forms...)
fn progn(m: &mut Machine, env: &mut Value, args: Value) -> LispResult<Step> {
    body_step(m, env, args)
}

/// (setq name expr): a lexical binding if one is visible, else global.
/// The global slot exists before `expr` runs.
fn setq(m: &mut Machine, env: &mut Value, args: Value) -> LispResult<Step> {
    let (target, rest) = m.heap.uncons(args)?;
    let Value::Symbol(name) = target else {
        let msg = format!("setq: not a symbol: {}", m.print_str(target));
        m.report(&msg);
        return Ok(Step::Done(Value::Nil));
    };
    let binding = match m.lookup(name, *env)? {
        Some(binding) => binding,
        None => Binding::Global(m.symbols.binding_slot(&mut m.heap, name)),
    };
    let expr = m.heap.car(rest)?;
    let val = m.evaluate(expr, env)?;
    m.set_binding(binding, val)?;
    Ok(Step::Done(val))
}

/// (setqq name raw): global, value not evaluated.
fn setqq(m: &mut Machine, _env: &mut Value, args: Value) -> LispResult<Step> {
    let (target, rest) = m.heap.uncons(args)?;
    let raw = m.heap.car(rest)?;
    match target {
        Value::Symbol(name) => {
            m.define_global(name, raw);
            Ok(Step::Done(raw))
        }
        _ => {
            let msg = format!("setqq: not a symbol: {}", m.print_str(target));
            m.report(&msg);
            Ok(Step::Done(Value::Nil))
        }
    }
}

/// (define name expr): a new binding in the current environment, visible
/// to `expr` itself so recursive definitions work.
fn define(m: &mut Machine, env: &mut Value, args: Value) -> LispResult<Step> {
    let (target, rest) = m.heap.uncons(args)?;
    let Value::Symbol(name) = target else {
        let msg = format!("define: not a symbol: {}", m.print_str(target));
        m.report(&msg);
        return Ok(Step::Done(Value::Nil));
    };
    *env = env_extend(&mut m.heap, name, Value::Nil, *env)?;
    let cell = m.heap.car(*env)?;
    let expr = m.heap.car(rest)?;
    let val = m.evaluate(expr, env)?;
    m.heap.set_cdr(cell, val)?;
    Ok(Step::Done(target))
}

/// (de name params body...): global function definition.
fn de(m: &mut Machine, env: &mut Value, args: Value) -> LispResult<Step> {
    let (target, lambda_tail) = m.heap.uncons(args)?;
    let Value::Symbol(name) = target else {
        let msg = format!("de: not a symbol: {}", m.print_str(target));
        m.report(&msg);
        return Ok(Step::Done(Value::Nil));
    };
    let form = m.cons(Value::Symbol(sym::LAMBDA), lambda_tail)?;
    let closure = m.make_closure(form, *env)?;
    m.define_global(name, closure);
    Ok(Step::Done(target))
}

/// (and forms...)
fn and(m: &mut Machine, env: &mut Value, args: Value) -> LispResult<Step> {
    let mut rest = args;
    while let Some((form, tail)) = m.heap.pair(rest)? {
        if m.heap.pair(tail)?.is_none() {
            return Ok(Step::Tail(form));
        }
        if m.evaluate(form, env)?.is_nil() {
            return Ok(Step::Done(Value::Nil));
        }
        rest = tail;
    }
    Ok(Step::Done(Value::Symbol(sym::T)))
}

/// (or forms...)
fn or(m: &mut Machine, env: &mut Value, args: Value) -> LispResult<Step> {
    let mut rest = args;
    while let Some((form, tail)) = m.heap.pair(rest)? {
        if m.heap.pair(tail)?.is_none() {
            return Ok(Step::Tail(form));
        }
        let val = m.evaluate(form, env)?;
        if !val.is_nil() {
            return Ok(Step::Done(val));
        }
        rest = tail;
    }
    Ok(Step::Done(Value::Nil))
}

/// (cond (test body...)...)
fn cond(m: &mut Machine, env: &mut Value, args: Value) -> LispResult<Step> {
    let mut clauses = args;
    while let Some((clause, rest)) = m.heap.pair(clauses)? {
        let (test, body) = m.heap.uncons(clause)?;
        let val = m.evaluate(test, env)?;
        if !val.is_nil() {
            if body.is_nil() {
                return Ok(Step::Done(val));
            }
            return body_step(m, env, body);
        }
        clauses = rest;
    }
    Ok(Step::Done(Value::Nil))
}

// ============================================================================
// System
// ============================================================================

fn terpri(m: &mut Machine) -> LispResult<Value> {
    m.write_out("\n");
    m.flush();
    Ok(Value::Nil)
}

/// (clock): milliseconds since start-up.
fn clock(m: &mut Machine) -> LispResult<Value> {
    let millis = m.uptime_millis().min(i64::MAX as u128) as i64;
    m.make_int(millis)
}

/// (gc): collect now and return the number of records freed. Nil inside
/// `evaluate_nogc`, where collection is held off.
fn gc(m: &mut Machine) -> LispResult<Value> {
    if m.collection_inhibited() {
        debug!("collection deferred: inhibited by the host");
        return Ok(Value::Nil);
    }
    let freed = m.collect()?;
    m.make_int(freed as i64)
}

/// (mem): print the allocation report, return the live record count.
fn mem(m: &mut Machine) -> LispResult<Value> {
    let report = m.allocation_report();
    m.write_out(&report.to_string());
    m.write_out("\n");
    m.make_int(report.live as i64)
}

// ============================================================================
// Lists and predicates
// ============================================================================

fn car(m: &mut Machine, x: Value) -> LispResult<Value> {
    m.heap.car(x)
}

fn cdr(m: &mut Machine, x: Value) -> LispResult<Value> {
    m.heap.cdr(x)
}

fn cons(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    m.cons(a, b)
}

fn atom(m: &mut Machine, x: Value) -> LispResult<Value> {
    Ok(Value::from_bool(!m.is(x, Tag::Pair)))
}

fn null(_m: &mut Machine, x: Value) -> LispResult<Value> {
    Ok(Value::from_bool(x.is_nil()))
}

fn consp(m: &mut Machine, x: Value) -> LispResult<Value> {
    Ok(Value::from_bool(m.is(x, Tag::Pair)))
}

fn symbolp(_m: &mut Machine, x: Value) -> LispResult<Value> {
    Ok(Value::from_bool(x.is_nil() || x.as_symbol().is_some()))
}

fn numberp(m: &mut Machine, x: Value) -> LispResult<Value> {
    Ok(Value::from_bool(m.is(x, Tag::Integer)))
}

fn stringp(m: &mut Machine, x: Value) -> LispResult<Value> {
    Ok(Value::from_bool(m.is(x, Tag::String)))
}

fn closurep(m: &mut Machine, x: Value) -> LispResult<Value> {
    Ok(Value::from_bool(m.is(x, Tag::Closure)))
}

/// (length x): elements of a list, characters of a string.
fn length(m: &mut Machine, x: Value) -> LispResult<Value> {
    let n = match m.heap.string_value(x)? {
        Some(text) => text.chars().count(),
        None => m.heap.list_len(x)?,
    };
    m.make_int(n as i64)
}

fn reverse(m: &mut Machine, x: Value) -> LispResult<Value> {
    let mut items = m.heap.list_to_vec(x)?;
    items.reverse();
    m.heap.list(&items)
}

fn list(_m: &mut Machine, args: Value) -> LispResult<Value> {
    Ok(args)
}

fn setcar(m: &mut Machine, p: Value, x: Value) -> LispResult<Value> {
    if m.heap.set_car(p, x)? {
        Ok(x)
    } else {
        Ok(not_a_pair(m, "setcar", p))
    }
}

fn setcdr(m: &mut Machine, p: Value, x: Value) -> LispResult<Value> {
    if m.heap.set_cdr(p, x)? {
        Ok(x)
    } else {
        Ok(not_a_pair(m, "setcdr", p))
    }
}

/// (assoc key alist): first entry whose car is `equal` to key.
fn assoc(m: &mut Machine, key: Value, alist: Value) -> LispResult<Value> {
    let mut rest = alist;
    while let Some((entry, tail)) = m.heap.pair(rest)? {
        if let Some((k, _)) = m.heap.pair(entry)? {
            if values_equal(&m.heap, k, key)? {
                return Ok(entry);
            }
        }
        rest = tail;
    }
    Ok(Value::Nil)
}

fn nth(m: &mut Machine, n: Value, list: Value) -> LispResult<Value> {
    let Some(mut n) = number(m, "nth", n)? else {
        return Ok(Value::Nil);
    };
    let mut rest = list;
    while let Some((item, tail)) = m.heap.pair(rest)? {
        if n == 0 {
            return Ok(item);
        }
        n -= 1;
        rest = tail;
    }
    Ok(Value::Nil)
}

/// (mapcar f list). Each call may collect, so the items and the results so
/// far are protected.
fn mapcar(m: &mut Machine, f: Value, list: Value) -> LispResult<Value> {
    let mark = m.root_mark();
    let result = map_protected(m, f, list);
    m.unprotect(mark);
    result
}

fn map_protected(m: &mut Machine, f: Value, list: Value) -> LispResult<Value> {
    let items = m.heap.list_to_vec(list)?;
    for &item in &items {
        m.protect(item);
    }
    let results = m.root_mark();
    for item in items {
        let val = m.call(f, &[item])?;
        m.protect(val);
    }
    m.heap.list_from_scratch(results)
}

// ============================================================================
// Equality
// ============================================================================

/// (eq a b): identity. Immediate integers and short symbols compare by value.
fn eq(_m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    Ok(Value::from_bool(a == b))
}

fn equal(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    Ok(Value::from_bool(values_equal(&m.heap, a, b)?))
}

/// Structural equality: integers by value, strings by content, pairs
/// element-wise. Recursive over cars, iterative over cdrs.
pub fn values_equal(heap: &Heap, a: Value, b: Value) -> LispResult<bool> {
    let (mut a, mut b) = (a, b);
    loop {
        if a == b {
            return Ok(true);
        }
        if let (Some(x), Some(y)) = (heap.int_value(a)?, heap.int_value(b)?) {
            return Ok(x == y);
        }
        if let (Some(x), Some(y)) = (heap.string_value(a)?, heap.string_value(b)?) {
            return Ok(x == y);
        }
        match (heap.pair(a)?, heap.pair(b)?) {
            (Some((a_car, a_cdr)), Some((b_car, b_cdr))) => {
                if !values_equal(heap, a_car, b_car)? {
                    return Ok(false);
                }
                a = a_cdr;
                b = b_cdr;
            }
            _ => return Ok(false),
        }
    }
}

// ============================================================================
// Arithmetic
// ============================================================================

fn arith(
    m: &mut Machine,
    name: &str,
    a: Value,
    b: Value,
    op: fn(i64, i64) -> Option<i64>,
) -> LispResult<Value> {
    let x = number(m, name, a)?;
    let y = number(m, name, b)?;
    let (Some(x), Some(y)) = (x, y) else {
        return Ok(Value::Nil);
    };
    match op(x, y) {
        Some(n) => m.make_int(n),
        None => {
            m.report(&format!("{}: division by zero", name));
            Ok(Value::Nil)
        }
    }
}

fn add(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    arith(m, "+", a, b, |x, y| Some(x.wrapping_add(y)))
}

fn sub(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    arith(m, "-", a, b, |x, y| Some(x.wrapping_sub(y)))
}

fn mul(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    arith(m, "*", a, b, |x, y| Some(x.wrapping_mul(y)))
}

fn div(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    arith(m, "/", a, b, |x, y| x.checked_div(y))
}

fn rem(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    arith(m, "%", a, b, |x, y| x.checked_rem(y))
}

fn compare(
    m: &mut Machine,
    name: &str,
    a: Value,
    b: Value,
    op: fn(i64, i64) -> bool,
) -> LispResult<Value> {
    let x = number(m, name, a)?;
    let y = number(m, name, b)?;
    match (x, y) {
        (Some(x), Some(y)) => Ok(Value::from_bool(op(x, y))),
        _ => Ok(Value::Nil),
    }
}

fn num_eq(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    compare(m, "=", a, b, |x, y| x == y)
}

fn lt(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    compare(m, "<", a, b, |x, y| x < y)
}

fn gt(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    compare(m, ">", a, b, |x, y| x > y)
}

fn le(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    compare(m, "<=", a, b, |x, y| x <= y)
}

fn ge(m: &mut Machine, a: Value, b: Value) -> LispResult<Value> {
    compare(m, ">=", a, b, |x, y| x >= y)
}

/// (random n): uniform in `0..n`.
fn random(m: &mut Machine, n: Value) -> LispResult<Value> {
    let Some(n) = number(m, "random", n)? else {
        return Ok(Value::Nil);
    };
    if n <= 0 {
        m.report(&format!("random: bound must be positive, got {}", n));
        return Ok(Value::Nil);
    }
    let pick = rand::thread_rng().gen_range(0..n);
    m.make_int(pick)
}

// ============================================================================
// Strings, symbols and I/O
// ============================================================================

/// (print x): printed form and a newline.
fn print(m: &mut Machine, x: Value) -> LispResult<Value> {
    m.print(x)
}

/// (princ x): printed form, no newline.
fn princ(m: &mut Machine, x: Value) -> LispResult<Value> {
    let text = m.print_str(x);
    m.write_out(&text);
    Ok(x)
}

/// (read "text"): first expression in a string.
fn read(m: &mut Machine, text: Value) -> LispResult<Value> {
    let Some(text) = string(m, "read", text)? else {
        return Ok(Value::Nil);
    };
    Ok(m.read(&text)?.unwrap_or(Value::Nil))
}

/// (intern "name")
fn intern(m: &mut Machine, name: Value) -> LispResult<Value> {
    if name.as_symbol().is_some() {
        return Ok(name);
    }
    let Some(text) = string(m, "intern", name)? else {
        return Ok(Value::Nil);
    };
    if text == "nil" {
        return Ok(Value::Nil);
    }
    Ok(Value::Symbol(m.intern(&text)?))
}

/// (type-of x): tag name as a symbol, nil for nil.
fn type_of(m: &mut Machine, x: Value) -> LispResult<Value> {
    match m.tag_of(x) {
        Some(tag) => Ok(Value::Symbol(m.intern(tag.name())?)),
        None => Ok(Value::Nil),
    }
}

/// (substring s start end): characters `start..end`, clamped; nil end
/// means the end of the string.
fn substring(m: &mut Machine, s: Value, start: Value, end: Value) -> LispResult<Value> {
    let Some(text) = string(m, "substring", s)? else {
        return Ok(Value::Nil);
    };
    let len = text.chars().count() as i64;
    let from = m.heap.int_value(start)?.unwrap_or(0).clamp(0, len);
    let to = match m.heap.int_value(end)? {
        Some(n) => n.clamp(from, len),
        None => len,
    };
    let piece: String = text
        .chars()
        .skip(from as usize)
        .take((to - from) as usize)
        .collect();
    m.make_string(&piece)
}

/// (concat x...): printed forms joined into one string.
fn concat(m: &mut Machine, args: Value) -> LispResult<Value> {
    let mut joined = String::new();
    for item in m.heap.list_to_vec(args)? {
        joined.push_str(&m.print_str(item));
    }
    m.make_string(&joined)
}

// ============================================================================
// Evaluation
// ============================================================================

/// (set name value): always the global slot.
fn set(m: &mut Machine, name: Value, val: Value) -> LispResult<Value> {
    match name {
        Value::Symbol(name) => {
            m.define_global(name, val);
            Ok(val)
        }
        _ => {
            let msg = format!("set: not a symbol: {}", m.print_str(name));
            m.report(&msg);
            Ok(Value::Nil)
        }
    }
}

/// (eval expr env): tail evaluation in `env`, nil meaning the top level.
fn eval(m: &mut Machine, expr: Value, env: Value) -> LispResult<Value> {
    let env = if env.is_nil() { m.global_env() } else { env };
    m.make_thunk(expr, env)
}

/// (apply f args)
fn apply(m: &mut Machine, f: Value, args: Value) -> LispResult<Value> {
    m.apply(f, args)
}
