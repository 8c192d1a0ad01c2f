use std::io::{self, Write};
use std::time::Instant;

use tracing::{debug, error, trace, warn};

use crate::config::Config;
use crate::error::{LispError, LispResult};
use crate::globals::{self, env_extend, env_lookup};
use crate::heap::{
    AllocReport, Frame, GcStats, GlobalSlot, Heap, Native, Primitive, Record, MAX_BUFFERED_ARGS,
};
use crate::primitives;
use crate::printer::print_val;
use crate::reader::{read_one_at, Reader};
use crate::symbol::{sym, symbol_name, SymbolTable};
use crate::value::{RecordId, Sym, Tag, Value};

/// What a single evaluation step hands back to the trampoline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Finished with this value.
    Done(Value),
    /// Continue with another expression in the same environment.
    Tail(Value),
    /// Continue with another expression in a different environment.
    TailIn { expr: Value, env: Value },
}

/// Where a symbol's value lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    /// A `(name . value)` cell in an environment chain.
    Local(RecordId),
    Global(GlobalSlot),
}

enum Callable {
    Primitive(Primitive),
    Closure { lambda: Value, env: Value },
    Not,
}

/// The interpreter. Roots live in `heap.roots`, where an allocation that
/// finds the arena full can reach them.
pub struct Machine {
    pub heap: Heap,
    pub symbols: SymbolTable,
    config: Config,

    /// Nonzero inside `evaluate_nogc`; safe points neither collect nor unpin.
    gc_inhibit: usize,

    out: Box<dyn Write>,
    err: Box<dyn Write>,
    diagnostics: usize,
    started: Instant,
}

impl Machine {
    pub fn new(config: Config) -> LispResult<Self> {
        config.validate()?;
        let mut heap = Heap::new(config.arena_capacity, config.free_list_limit);
        heap.roots.global_env = globals::initial_env(&mut heap)?;
        heap.roots.frames.reserve(config.max_frames.min(1024));

        let mut m = Machine {
            heap,
            symbols: SymbolTable::new(),
            config,
            gc_inhibit: 0,
            out: Box::new(io::stdout()),
            err: Box::new(io::stderr()),
            diagnostics: 0,
            started: Instant::now(),
        };

        // `t` also resolves when evaluating against an empty environment.
        m.define_global(sym::T, Value::Symbol(sym::T));
        primitives::install(&mut m)?;

        debug!(
            capacity = m.config.arena_capacity,
            live = m.heap.live_count(),
            globals = m.symbols.global_count(),
            "machine ready"
        );
        Ok(m)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn global_env(&self) -> Value {
        self.heap.roots.global_env
    }

    pub fn gc_stats(&self) -> GcStats {
        self.heap.gc_stats()
    }

    /// Number of diagnostics reported so far.
    pub fn diagnostics(&self) -> usize {
        self.diagnostics
    }

    pub fn frame_depth(&self) -> usize {
        self.heap.roots.frames.len()
    }

    /// True inside `evaluate_nogc`.
    pub fn collection_inhibited(&self) -> bool {
        self.gc_inhibit > 0
    }

    /// Milliseconds since the machine was created.
    pub fn uptime_millis(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Redirect printed output and diagnostics.
    pub fn set_output(&mut self, out: Box<dyn Write>, err: Box<dyn Write>) {
        self.out = out;
        self.err = err;
    }

    // ========================================================================
    // Constructors
    // ========================================================================

    pub fn cons(&mut self, car: Value, cdr: Value) -> LispResult<Value> {
        self.heap.cons(car, cdr)
    }

    pub fn make_string(&mut self, text: &str) -> LispResult<Value> {
        self.heap.alloc_string(text).map(Value::Ref)
    }

    pub fn make_int(&mut self, n: i64) -> LispResult<Value> {
        self.heap.make_int(n)
    }

    pub fn intern(&mut self, name: &str) -> LispResult<Sym> {
        self.symbols.intern(&mut self.heap, name)
    }

    /// A closure over `env` for a whole `(lambda params . body)` form.
    pub fn make_closure(&mut self, lambda: Value, env: Value) -> LispResult<Value> {
        self.heap.allocate(Record::Closure { lambda, env }).map(Value::Ref)
    }

    /// A deferred evaluation of `expr` in `env`. Only native code returning
    /// a tail call should make these; they must not be stored anywhere.
    pub fn make_thunk(&mut self, expr: Value, env: Value) -> LispResult<Value> {
        self.heap.allocate(Record::Thunk { expr, env }).map(Value::Ref)
    }

    /// Bind a host function as a global primitive.
    pub fn register(&mut self, name: &'static str, native: Native) -> LispResult<Value> {
        if let Native::Buffered(n, _) = native {
            if !(4..=MAX_BUFFERED_ARGS).contains(&(n as usize)) {
                return Err(LispError::Config(format!(
                    "{}: buffered primitives take 4 to {} arguments, not {}",
                    name, MAX_BUFFERED_ARGS, n
                )));
            }
        }
        let sym = self.intern(name)?;
        let prim = self
            .heap
            .allocate(Record::Primitive(Primitive { name, native }))?;
        self.define_global(sym, Value::Ref(prim));
        Ok(Value::Ref(prim))
    }

    pub fn define_global(&mut self, sym: Sym, val: Value) {
        self.symbols.define_global(&mut self.heap, sym, val);
    }

    // ========================================================================
    // Rooting for native code
    // ========================================================================

    /// Current depth of the scratch roots, to hand back to `unprotect`.
    pub fn root_mark(&self) -> usize {
        self.heap.roots.scratch.len()
    }

    /// Keep `val` alive until `unprotect` drops back below it. Native code
    /// holding values across `call` or `force` must protect them.
    pub fn protect(&mut self, val: Value) {
        self.heap.roots.scratch.push(val);
    }

    pub fn unprotect(&mut self, mark: usize) {
        self.heap.roots.scratch.truncate(mark);
    }

    // ========================================================================
    // Type queries
    // ========================================================================

    pub fn tag_of(&self, val: Value) -> Option<Tag> {
        self.heap.tag_of(val)
    }

    /// The one variant predicate. False for nil and stale references.
    pub fn is(&self, val: Value, tag: Tag) -> bool {
        self.heap.tag_of(val) == Some(tag)
    }

    fn callable(&self, f: Value) -> LispResult<Callable> {
        let Value::Ref(id) = f else {
            return Ok(Callable::Not);
        };
        Ok(match self.heap.get(id)? {
            Record::Primitive(prim) => Callable::Primitive(*prim),
            Record::Closure { lambda, env } => Callable::Closure {
                lambda: *lambda,
                env: *env,
            },
            _ => Callable::Not,
        })
    }

    // ========================================================================
    // Reading and printing
    // ========================================================================

    /// Read the first expression of `text`.
    pub fn read(&mut self, text: &str) -> LispResult<Option<Value>> {
        Reader::new(text, &mut self.heap, &mut self.symbols).read()
    }

    pub fn print_str(&self, val: Value) -> String {
        print_val(val, &self.heap)
    }

    /// Write the printed form and a newline to the output sink.
    pub fn print(&mut self, val: Value) -> LispResult<Value> {
        let text = self.print_str(val);
        self.write_out(&text);
        self.write_out("\n");
        Ok(val)
    }

    pub fn write_out(&mut self, text: &str) {
        if let Err(e) = self.out.write_all(text.as_bytes()) {
            warn!(error = %e, "output sink failed");
        }
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!(error = %e, "output sink failed");
        }
    }

    /// Recoverable error: tell the user, count it, carry on.
    pub fn report(&mut self, msg: &str) {
        warn!(diagnostic = msg);
        self.diagnostics += 1;
        if let Err(e) = writeln!(self.err, "*** {}", msg) {
            warn!(error = %e, "diagnostic sink failed");
        }
    }

    fn report_undefined(&mut self, sym: Sym) {
        let msg = format!("undefined symbol: {}", symbol_name(&self.heap, sym));
        self.report(&msg);
    }

    pub fn allocation_report(&self) -> AllocReport {
        self.heap.report()
    }

    // ========================================================================
    // Core evaluation entry points
    // ========================================================================

    /// Evaluate an expression in the global environment.
    ///
    /// A top-level `define` extends the global environment. On error the
    /// evaluation stack is discarded so the next call starts clean.
    pub fn eval(&mut self, expr: Value) -> LispResult<Value> {
        let mut env = self.heap.roots.global_env;
        match self.evaluate(expr, &mut env) {
            Ok(val) => {
                self.heap.roots.global_env = env;
                Ok(val)
            }
            Err(e) => {
                self.recover();
                Err(e)
            }
        }
    }

    fn recover(&mut self) {
        let roots = &mut self.heap.roots;
        roots.frames.clear();
        roots.scratch.clear();
        roots.active_thunks.clear();
        self.gc_inhibit = 0;
    }

    /// Read the expression starting at byte `pos` of `text`, returning it
    /// and the position after it. Between top-level evaluations nothing
    /// unrooted is held, so this collects first if the arena is full enough.
    pub fn read_next(&mut self, text: &str, pos: usize) -> LispResult<(Option<Value>, usize)> {
        if self.heap.roots.frames.is_empty() {
            self.safe_point()?;
        }
        read_one_at(text, pos, &mut self.heap, &mut self.symbols)
    }

    /// Read and evaluate every expression in `text`, one at a time.
    /// Returns the value of the last one, which stays valid until the next
    /// read or evaluation.
    pub fn eval_str(&mut self, text: &str) -> LispResult<Value> {
        let base = self.root_mark();
        let mut pos = 0;
        let mut last = Value::Nil;
        loop {
            // `last` is rooted while the next read may collect.
            self.unprotect(base);
            self.protect(last);
            let (expr, next) = self.read_next(text, pos)?;
            self.unprotect(base);
            let Some(expr) = expr else {
                return Ok(last);
            };
            pos = next;
            last = self.eval(expr)?;
        }
    }

    /// Evaluate `expr` in `env`. Definitions made directly in `env` (not in
    /// a closure body) extend it in place.
    pub fn evaluate(&mut self, expr: Value, env: &mut Value) -> LispResult<Value> {
        let depth = self.heap.roots.frames.len();
        if depth >= self.config.max_frames {
            error!(depth, "frame stack overflow");
            return Err(LispError::RecursionDepth(depth));
        }
        self.heap.roots.frames.push(Frame { expr, env: *env });
        trace!(depth = depth + 1, "push frame");
        let result = self.trampoline(expr, env);
        self.heap.roots.frames.pop();
        result
    }

    /// Like `evaluate`, but safe points never collect or unpin. For host
    /// code holding values the collector cannot see. A full arena still
    /// collects, keeping everything allocated since the last safe point.
    pub fn evaluate_nogc(&mut self, expr: Value, env: &mut Value) -> LispResult<Value> {
        self.gc_inhibit += 1;
        let result = self.evaluate(expr, env);
        self.gc_inhibit -= 1;
        result
    }

    fn trampoline(&mut self, mut expr: Value, caller_env: &mut Value) -> LispResult<Value> {
        let mut env = *caller_env;
        let mut shares_env = true;
        let mut in_flight: Option<RecordId> = None;

        loop {
            if let Some(frame) = self.heap.roots.frames.last_mut() {
                frame.expr = expr;
                frame.env = env;
            }
            self.safe_point()?;

            let step = self.step(expr, &mut env);
            if let Some(id) = in_flight.take() {
                self.retire_thunk(id)?;
            }

            match step? {
                Step::Tail(next) => expr = next,
                Step::TailIn {
                    expr: next,
                    env: next_env,
                } => {
                    expr = next;
                    env = next_env;
                    shares_env = false;
                }
                Step::Done(val) => match self.activate(val)? {
                    Some((id, thunk_expr, thunk_env)) => {
                        in_flight = Some(id);
                        if thunk_env != env {
                            shares_env = false;
                        }
                        expr = thunk_expr;
                        env = thunk_env;
                    }
                    None => {
                        if shares_env {
                            *caller_env = env;
                        }
                        return Ok(val);
                    }
                },
            }
        }
    }

    /// If `val` is a pending thunk, mark it in flight and return its parts.
    fn activate(&mut self, val: Value) -> LispResult<Option<(RecordId, Value, Value)>> {
        let Value::Ref(id) = val else {
            return Ok(None);
        };
        match self.heap.activate_thunk(id)? {
            Some((expr, env)) => {
                self.heap.roots.active_thunks.push(id);
                Ok(Some((id, expr, env)))
            }
            None => Ok(None),
        }
    }

    fn retire_thunk(&mut self, id: RecordId) -> LispResult<()> {
        let active = &mut self.heap.roots.active_thunks;
        if let Some(pos) = active.iter().rposition(|&t| t == id) {
            active.remove(pos);
        }
        self.heap.release(id)
    }

    fn step(&mut self, expr: Value, env: &mut Value) -> LispResult<Step> {
        match expr {
            Value::Symbol(s) => Ok(Step::Done(self.resolve(s, *env)?)),
            Value::Ref(id) => {
                let is_form = matches!(self.heap.get(id)?, Record::Pair { .. });
                if is_form {
                    self.apply_form(expr, env)
                } else {
                    Ok(Step::Done(expr))
                }
            }
            _ => Ok(Step::Done(expr)),
        }
    }

    // ========================================================================
    // Variable lookup
    // ========================================================================

    /// Lexical chain first, then the global table.
    pub fn lookup(&self, name: Sym, env: Value) -> LispResult<Option<Binding>> {
        if let Some(cell) = env_lookup(name, env, &self.heap)? {
            return Ok(Some(Binding::Local(cell)));
        }
        Ok(self.symbols.find_global(name).map(Binding::Global))
    }

    pub fn binding_value(&self, binding: Binding) -> LispResult<Value> {
        match binding {
            Binding::Local(cell) => self.heap.cdr(Value::Ref(cell)),
            Binding::Global(slot) => Ok(self.heap.global(slot)),
        }
    }

    pub fn set_binding(&mut self, binding: Binding, val: Value) -> LispResult<()> {
        match binding {
            Binding::Local(cell) => {
                self.heap.set_cdr(Value::Ref(cell), val)?;
            }
            Binding::Global(slot) => self.heap.set_global(slot, val),
        }
        Ok(())
    }

    fn resolve(&mut self, name: Sym, env: Value) -> LispResult<Value> {
        match self.lookup(name, env)? {
            Some(binding) => self.binding_value(binding),
            None => {
                self.report_undefined(name);
                Ok(Value::Nil)
            }
        }
    }

    // ========================================================================
    // Application
    // ========================================================================

    fn apply_form(&mut self, form: Value, env: &mut Value) -> LispResult<Step> {
        let base = self.root_mark();
        let result = self.apply_form_rooted(form, env);
        self.unprotect(base);
        result
    }

    fn apply_form_rooted(&mut self, form: Value, env: &mut Value) -> LispResult<Step> {
        let (head, args) = self.heap.uncons(form)?;
        let Some(f) = self.resolve_head(head, env)? else {
            return Ok(Step::Done(Value::Nil));
        };
        self.protect(f);

        match self.callable(f)? {
            Callable::Primitive(prim) => self.apply_primitive(prim, form, args, env),
            Callable::Closure { lambda, env: captured } => {
                self.apply_closure(lambda, captured, args, env)
            }
            Callable::Not => {
                let msg = format!("not a function: {}", self.print_str(head));
                self.report(&msg);
                Ok(Step::Done(Value::Nil))
            }
        }
    }

    /// The function a form's head denotes. A head that is neither a symbol
    /// bound to a function nor evaluates to one gets one more evaluation, so
    /// a variable holding a lambda form can be called directly.
    fn resolve_head(&mut self, head: Value, env: &mut Value) -> LispResult<Option<Value>> {
        let f = match head {
            Value::Symbol(name) => match self.lookup(name, *env)? {
                Some(binding) => self.binding_value(binding)?,
                None => {
                    self.report_undefined(name);
                    return Ok(None);
                }
            },
            _ => self.evaluate(head, env)?,
        };
        let retry = matches!(self.callable(f)?, Callable::Not)
            && (matches!(f, Value::Symbol(_)) || self.is(f, Tag::Pair));
        if retry {
            self.protect(f);
            return self.evaluate(f, env).map(Some);
        }
        Ok(Some(f))
    }

    fn apply_primitive(
        &mut self,
        prim: Primitive,
        form: Value,
        args: Value,
        env: &mut Value,
    ) -> LispResult<Step> {
        let val = match prim.native {
            Native::Special(f) => return f(self, env, args),
            Native::If(f) => {
                let (test, rest) = self.heap.uncons(args)?;
                let (then, elses) = self.heap.uncons(rest)?;
                return f(self, env, test, then, elses);
            }
            Native::Lambda(f) => f(self, form, *env)?,
            Native::Variadic(f) => {
                let base = self.root_mark();
                let mut rest = args;
                while let Some((arg, tail)) = self.heap.pair(rest)? {
                    let val = self.evaluate(arg, env)?;
                    self.protect(val);
                    rest = tail;
                }
                let list = self.heap.list_from_scratch(base)?;
                self.protect(list);
                f(self, list)?
            }
            fixed => {
                let n = fixed.fixed_arity().unwrap_or(0);
                let mut buf = [Value::Nil; MAX_BUFFERED_ARGS];
                self.evaluate_fixed(prim.name, args, env, &mut buf[..n])?;
                self.call_fixed(fixed, &buf[..n])?
            }
        };
        Ok(Step::Done(val))
    }

    /// Evaluate up to `out.len()` argument forms into `out`, rooting each.
    /// Missing arguments are nil; extra forms are not evaluated.
    fn evaluate_fixed(
        &mut self,
        name: &str,
        args: Value,
        env: &mut Value,
        out: &mut [Value],
    ) -> LispResult<()> {
        if self.config.strict_arity {
            let got = self.heap.list_len(args)?;
            if got != out.len() {
                return Err(LispError::Arity {
                    name: name.to_string(),
                    expected: out.len(),
                    got,
                });
            }
        }
        let mut rest = args;
        for slot in out.iter_mut() {
            *slot = match self.heap.pair(rest)? {
                Some((form, tail)) => {
                    rest = tail;
                    self.evaluate(form, env)?
                }
                None => Value::Nil,
            };
            self.protect(*slot);
        }
        Ok(())
    }

    fn call_fixed(&mut self, native: Native, args: &[Value]) -> LispResult<Value> {
        let arg = |i: usize| args.get(i).copied().unwrap_or(Value::Nil);
        match native {
            Native::Fixed0(f) => f(self),
            Native::Fixed1(f) => f(self, arg(0)),
            Native::Fixed2(f) => f(self, arg(0), arg(1)),
            Native::Fixed3(f) => f(self, arg(0), arg(1), arg(2)),
            Native::Buffered(_, f) => f(self, args),
            _ => Ok(Value::Nil),
        }
    }

    fn apply_closure(
        &mut self,
        lambda: Value,
        captured: Value,
        args: Value,
        env: &mut Value,
    ) -> LispResult<Step> {
        let base = self.root_mark();
        let mut rest = args;
        while let Some((form, tail)) = self.heap.pair(rest)? {
            let val = self.evaluate(form, env)?;
            self.protect(val);
            rest = tail;
        }

        if let Some(frame) = self.heap.roots.frames.last_mut() {
            frame.env = *env;
        }
        self.safe_point()?;

        let (params, body) = self.heap.uncons(self.heap.cdr(lambda)?)?;
        let local = self.bind_parameters(params, base, captured)?;
        self.sequence_body(body, local)
    }

    /// Bind `params` to the values in `scratch[base..]` on top of `captured`.
    /// Positional; a dotted or bare-symbol parameter takes the rest as a list.
    fn bind_parameters(&mut self, params: Value, base: usize, captured: Value) -> LispResult<Value> {
        let supplied = self.root_mark() - base;
        let mut env = captured;
        let mut params = params;
        let mut next = base;
        let mut positional = 0;
        let mut missing = false;

        loop {
            if let Value::Symbol(rest) = params {
                let list = self.heap.list_from_scratch(next)?;
                next = self.root_mark();
                env = env_extend(&mut self.heap, rest, list, env)?;
                break;
            }
            let Some((param, tail)) = self.heap.pair(params)? else {
                break;
            };
            let val = match self.heap.roots.scratch.get(next) {
                Some(&val) => {
                    next += 1;
                    val
                }
                None => {
                    missing = true;
                    Value::Nil
                }
            };
            if let Value::Symbol(name) = param {
                env = env_extend(&mut self.heap, name, val, env)?;
            }
            positional += 1;
            params = tail;
        }

        if self.config.strict_arity && (missing || next != self.root_mark()) {
            return Err(LispError::Arity {
                name: "lambda".into(),
                expected: positional,
                got: supplied,
            });
        }
        Ok(env)
    }

    /// Evaluate all but the last body form; the last is the tail step.
    fn sequence_body(&mut self, body: Value, mut env: Value) -> LispResult<Step> {
        let mut rest = body;
        loop {
            let Some((form, tail)) = self.heap.pair(rest)? else {
                return Ok(Step::Done(Value::Nil));
            };
            if self.heap.pair(tail)?.is_none() {
                return Ok(Step::TailIn { expr: form, env });
            }
            self.evaluate(form, &mut env)?;
            rest = tail;
        }
    }

    // ========================================================================
    // Host-side application
    // ========================================================================

    /// Apply `f` to an already evaluated argument list. Closures come back
    /// as a thunk for the caller to run (see `force`).
    pub fn apply(&mut self, f: Value, args: Value) -> LispResult<Value> {
        match self.callable(f)? {
            Callable::Closure { lambda, env } => {
                let base = self.root_mark();
                self.protect(f);
                self.protect(args);
                let result = self.closure_thunk(lambda, env, args);
                self.unprotect(base);
                result
            }
            Callable::Primitive(prim) => self.apply_primitive_to_values(prim, args),
            Callable::Not => {
                let msg = format!("not a function: {}", self.print_str(f));
                self.report(&msg);
                Ok(Value::Nil)
            }
        }
    }

    fn closure_thunk(&mut self, lambda: Value, captured: Value, args: Value) -> LispResult<Value> {
        let base = self.root_mark();
        let values = self.heap.list_to_vec(args)?;
        self.heap.roots.scratch.extend(values);
        let (params, body) = self.heap.uncons(self.heap.cdr(lambda)?)?;
        let local = self.bind_parameters(params, base, captured)?;
        let expr = match self.heap.pair(body)? {
            Some((only, Value::Nil)) => only,
            _ => self.heap.cons(Value::Symbol(sym::PROGN), body)?,
        };
        self.make_thunk(expr, local)
    }

    fn apply_primitive_to_values(&mut self, prim: Primitive, args: Value) -> LispResult<Value> {
        let mut env = self.heap.roots.global_env;
        let step = match prim.native {
            Native::Special(f) => f(self, &mut env, args)?,
            Native::If(f) => {
                let (test, rest) = self.heap.uncons(args)?;
                let (then, elses) = self.heap.uncons(rest)?;
                f(self, &mut env, test, then, elses)?
            }
            Native::Lambda(f) => {
                let form = self.heap.cons(Value::Symbol(sym::LAMBDA), args)?;
                return f(self, form, env);
            }
            Native::Variadic(f) => return f(self, args),
            fixed => {
                let n = fixed.fixed_arity().unwrap_or(0);
                let values = self.heap.list_to_vec(args)?;
                if self.config.strict_arity && values.len() != n {
                    return Err(LispError::Arity {
                        name: prim.name.to_string(),
                        expected: n,
                        got: values.len(),
                    });
                }
                let mut buf = [Value::Nil; MAX_BUFFERED_ARGS];
                for (slot, val) in buf[..n].iter_mut().zip(values) {
                    *slot = val;
                }
                return self.call_fixed(fixed, &buf[..n]);
            }
        };
        match step {
            Step::Done(val) => Ok(val),
            Step::Tail(expr) => self.make_thunk(expr, env),
            Step::TailIn { expr, env } => self.make_thunk(expr, env),
        }
    }

    /// Run `val` to completion if it is a thunk.
    pub fn force(&mut self, val: Value) -> LispResult<Value> {
        if !self.is(val, Tag::Thunk) {
            return Ok(val);
        }
        let mut env = self.heap.roots.global_env;
        self.evaluate(val, &mut env)
    }

    /// Call `f` on `args` and return the finished result. `f` and `args`
    /// stay rooted throughout; the result is unrooted, and anything else
    /// the caller holds must be protected first, since this may collect.
    pub fn call(&mut self, f: Value, args: &[Value]) -> LispResult<Value> {
        let base = self.root_mark();
        self.protect(f);
        self.heap.roots.scratch.extend_from_slice(args);
        let result = self.call_rooted(f, args);
        self.unprotect(base);
        result
    }

    fn call_rooted(&mut self, f: Value, args: &[Value]) -> LispResult<Value> {
        let list = self.heap.list(args)?;
        self.protect(list);
        let val = self.apply(f, list)?;
        self.force(val)
    }

    // ========================================================================
    // GC
    // ========================================================================

    /// Every value the evaluator still needs is rooted here. Collect if the
    /// arena is full enough, then drop the pins.
    fn safe_point(&mut self) -> LispResult<()> {
        if self.gc_inhibit > 0 {
            return Ok(());
        }
        if self.heap.occupancy_percent() >= self.config.gc_threshold_percent {
            self.heap.collect()?;
        }
        self.heap.unpin_all();
        Ok(())
    }

    /// Run a full mark-and-sweep cycle. Returns the number of records freed.
    ///
    /// Records allocated since the last safe point are kept as well, so host
    /// code may call this while holding values from the last evaluation.
    pub fn collect(&mut self) -> LispResult<usize> {
        self.heap.collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine_with(config: Config) -> Machine {
        let mut m = Machine::new(config).unwrap();
        m.set_output(Box::new(io::sink()), Box::new(io::sink()));
        m
    }

    fn machine() -> Machine {
        machine_with(Config::default())
    }

    fn run(m: &mut Machine, text: &str) -> String {
        let val = m.eval_str(text).unwrap();
        m.print_str(val)
    }

    #[test]
    fn self_evaluating_values() {
        let mut m = machine();
        assert_eq!(run(&mut m, "42"), "42");
        assert_eq!(run(&mut m, "\"hi\""), "hi");
        assert_eq!(run(&mut m, "nil"), "nil");
        assert_eq!(run(&mut m, "t"), "t");
    }

    #[test]
    fn undefined_symbol_is_a_diagnostic() {
        let mut m = machine();
        assert_eq!(run(&mut m, "zzz"), "nil");
        assert_eq!(m.diagnostics(), 1);
        assert_eq!(run(&mut m, "(zzz 1 2)"), "nil");
        assert_eq!(m.diagnostics(), 2);
    }

    #[test]
    fn applying_a_non_function_is_a_diagnostic() {
        let mut m = machine();
        assert_eq!(run(&mut m, "(1 2)"), "nil");
        assert_eq!(m.diagnostics(), 1);
    }

    #[test]
    fn top_level_define_extends_global_env() {
        let mut m = machine();
        run(&mut m, "(define x 5)");
        assert_eq!(run(&mut m, "x"), "5");
        run(&mut m, "(progn (define y 6) (define z 7))");
        assert_eq!(run(&mut m, "(+ y z)"), "13");
    }

    #[test]
    fn define_in_closure_body_stays_local() {
        let mut m = machine();
        run(&mut m, "(de f () (define inner 3) inner)");
        assert_eq!(run(&mut m, "(f)"), "3");
        assert_eq!(run(&mut m, "inner"), "nil");
        assert_eq!(m.diagnostics(), 1);
    }

    #[test]
    fn closures_capture_their_environment() {
        let mut m = machine();
        run(&mut m, "(de adder (n) (lambda (x) (+ x n)))");
        run(&mut m, "(setq add5 (adder 5))");
        assert_eq!(run(&mut m, "(add5 10)"), "15");
    }

    #[test]
    fn rest_parameters() {
        let mut m = machine();
        assert_eq!(run(&mut m, "((lambda (a . more) more) 1 2 3)"), "(2 3)");
        assert_eq!(run(&mut m, "((lambda args args) 1 2)"), "(1 2)");
        assert_eq!(run(&mut m, "((lambda (a . more) more) 1)"), "nil");
    }

    #[test]
    fn lenient_arity_by_default() {
        let mut m = machine();
        assert_eq!(run(&mut m, "((lambda (a b) b) 1)"), "nil");
        assert_eq!(run(&mut m, "((lambda (a) a) 1 2 3)"), "1");
        assert_eq!(run(&mut m, "(car '(1 2) '(3))"), "1");
        assert_eq!(run(&mut m, "(cons 1)"), "(1)");
    }

    #[test]
    fn strict_arity_rejects_mismatches() {
        let mut m = machine_with(Config {
            strict_arity: true,
            ..Config::default()
        });
        assert!(matches!(
            m.eval_str("((lambda (a b) b) 1)"),
            Err(LispError::Arity { expected: 2, got: 1, .. })
        ));
        assert!(matches!(
            m.eval_str("(car '(1) '(2))"),
            Err(LispError::Arity { expected: 1, got: 2, .. })
        ));
        assert_eq!(run(&mut m, "((lambda (a . r) r) 1 2)"), "(2)");
    }

    #[test]
    fn head_gets_one_extra_evaluation() {
        let mut m = machine();
        run(&mut m, "(setq f '(lambda (x) (* x x)))");
        assert_eq!(run(&mut m, "(f 7)"), "49");
    }

    #[test]
    fn tail_calls_run_in_constant_frames() {
        let mut m = machine_with(Config {
            max_frames: 32,
            ..Config::default()
        });
        run(&mut m, "(de loop (n acc) (if (= n 0) acc (loop (- n 1) (+ acc 1))))");
        assert_eq!(run(&mut m, "(loop 5000 0)"), "5000");
    }

    #[test]
    fn deep_recursion_hits_the_frame_bound() {
        let mut m = machine_with(Config {
            max_frames: 64,
            ..Config::default()
        });
        run(&mut m, "(de down (n) (if (= n 0) 0 (+ 1 (down (- n 1)))))");
        assert!(matches!(
            m.eval_str("(down 1000)"),
            Err(LispError::RecursionDepth(64))
        ));
        assert_eq!(m.frame_depth(), 0);
        assert_eq!(run(&mut m, "(down 5)"), "5");
    }

    #[test]
    fn thunks_are_released_after_running() {
        let mut m = machine();
        assert_eq!(run(&mut m, "(eval '(+ 1 2) nil)"), "3");
        assert_eq!(run(&mut m, "(apply (lambda (a b) (* a b)) '(6 7))"), "42");
        assert_eq!(run(&mut m, "(eval '(eval '(car '(9)) nil) nil)"), "9");
        assert_eq!(m.heap.live_with_tag(Tag::Thunk), 0);
        assert_eq!(m.heap.live_with_tag(Tag::ActiveThunk), 0);
    }

    #[test]
    fn host_apply_returns_a_thunk_until_forced() {
        let mut m = machine();
        let f = m.eval_str("(lambda (x) (+ x 1))").unwrap();
        let args = m.heap.list(&[Value::Int(41)]).unwrap();
        let thunk = m.apply(f, args).unwrap();
        assert!(m.is(thunk, Tag::Thunk));
        assert_eq!(m.force(thunk).unwrap(), Value::Int(42));
        assert!(!m.is(thunk, Tag::Thunk));
        assert_eq!(m.call(f, &[Value::Int(1)]).unwrap(), Value::Int(2));
    }

    #[test]
    fn host_apply_on_primitives() {
        let mut m = machine();
        let plus = m.eval_str("+").unwrap();
        assert_eq!(m.call(plus, &[Value::Int(2), Value::Int(3)]).unwrap(), Value::Int(5));
        let quote = m.eval_str("quote").unwrap();
        let sym = Value::Symbol(m.intern("abc").unwrap());
        assert_eq!(m.call(quote, &[sym]).unwrap(), sym);
    }

    #[test]
    fn evaluation_under_pressure_collects_at_safe_points() {
        let mut m = machine_with(Config {
            arena_capacity: 600,
            gc_threshold_percent: 50,
            ..Config::default()
        });
        run(&mut m, "(de churn (n) (if (= n 0) 'done (progn (list 1 2 3 4) (churn (- n 1)))))");
        assert_eq!(run(&mut m, "(churn 2000)"), "done");
        assert!(m.gc_stats().cycles > 0);
        assert!(m.heap.live_count() <= 600);
    }

    #[test]
    fn nogc_evaluation_defers_collection() {
        let mut m = machine_with(Config {
            arena_capacity: 400,
            gc_threshold_percent: 1,
            ..Config::default()
        });
        let expr = m.read("(list 1 2 3)").unwrap().unwrap();
        let mut env = m.global_env();
        let cycles = m.gc_stats().cycles;
        m.evaluate_nogc(expr, &mut env).unwrap();
        assert_eq!(m.gc_stats().cycles, cycles);
        assert!(!m.collection_inhibited());
    }

    const IOTA: &str = "(de iota (n acc) (if (= n 0) acc (iota (- n 1) (cons n acc))))";

    #[test]
    fn mapcar_collects_between_calls() {
        let mut m = machine_with(Config {
            arena_capacity: 1000,
            ..Config::default()
        });
        run(&mut m, IOTA);
        run(&mut m, "(setq xs (iota 60 nil))");
        let before = m.gc_stats().cycles;
        let mapped = "(mapcar (lambda (x) (progn (list 1 2 3 4 5 6 7 8 9 10) x)) xs)";
        assert_eq!(run(&mut m, &format!("(length {})", mapped)), "60");
        assert!(m.gc_stats().cycles > before);
        assert_eq!(run(&mut m, &format!("(equal {} xs)", mapped)), "t");
    }

    #[test]
    fn native_results_survive_a_full_arena() {
        let mut m = machine_with(Config {
            arena_capacity: 400,
            ..Config::default()
        });
        run(&mut m, IOTA);
        run(&mut m, "(setq xs (iota 100 nil))");
        let before = m.gc_stats().cycles;
        assert_eq!(
            run(&mut m, "(progn (reverse xs) (reverse xs) (reverse xs) (length xs))"),
            "100"
        );
        assert!(m.gc_stats().cycles > before);
        assert_eq!(run(&mut m, "(car (reverse xs))"), "100");
    }

    #[test]
    fn exhaustion_follows_a_collection() {
        let mut m = machine_with(Config {
            arena_capacity: 300,
            ..Config::default()
        });
        run(&mut m, IOTA);
        let before = m.gc_stats().cycles;
        let err = m.eval_str("(iota 1000 nil)").unwrap_err();
        assert!(matches!(err, LispError::ArenaExhausted { capacity: 300, .. }));
        assert!(m.gc_stats().cycles > before);
        assert!(m.heap.live_count() <= 300);
        assert_eq!(m.frame_depth(), 0);
    }

    #[test]
    fn protected_values_survive_host_calls() {
        let mut m = machine_with(Config {
            arena_capacity: 400,
            gc_threshold_percent: 50,
            ..Config::default()
        });
        run(&mut m, "(de churn (n) (if (= n 0) 'done (progn (list n n n) (churn (- n 1)))))");
        let churn = m.eval_str("churn").unwrap();
        let keep = m.heap.list(&[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap();
        let mark = m.root_mark();
        m.protect(keep);
        let before = m.gc_stats().cycles;
        let done = m.call(churn, &[Value::Int(500)]).unwrap();
        assert_eq!(m.print_str(done), "done");
        assert!(m.gc_stats().cycles > before);
        assert_eq!(m.print_str(keep), "(1 2 3)");
        m.unprotect(mark);
        assert_eq!(m.root_mark(), mark);
    }

    #[test]
    fn retired_thunks_leave_no_bytes_behind() {
        let mut m = machine();
        assert_eq!(run(&mut m, "(eval '1 nil)"), "1");
        let report = m.allocation_report();
        for tag in [Tag::Thunk, Tag::ActiveThunk] {
            let row = report.row(tag).unwrap();
            assert_eq!((row.live, row.bytes), (0, 0), "{}", tag.name());
        }
        assert!(report.row(Tag::Thunk).unwrap().allocated > 0);
    }

    #[test]
    fn machine_recovers_after_an_error() {
        let mut m = machine_with(Config {
            max_frames: 16,
            ..Config::default()
        });
        run(&mut m, "(de down (n) (+ 1 (down n)))");
        assert!(m.eval_str("(down 1)").is_err());
        assert!(!m.collection_inhibited());
        assert_eq!(run(&mut m, "(+ 1 1)"), "2");
    }

    #[test]
    fn lookup_prefers_lexical_bindings() {
        let mut m = machine();
        run(&mut m, "(setq v 1)");
        assert_eq!(run(&mut m, "((lambda (v) v) 2)"), "2");
        let v = m.intern("v").unwrap();
        let binding = m.lookup(v, Value::Nil).unwrap().unwrap();
        assert!(matches!(binding, Binding::Global(_)));
        assert_eq!(m.binding_value(binding).unwrap(), Value::Int(1));
    }
}
