use crate::error::LispResult;
use crate::heap::Heap;
use crate::symbol::{sym, SymbolTable};
use crate::value::Value;

/// Parses source text into heap structures.
///
/// The reader never fails on malformed text: a missing `)` closes at end
/// of input, an unterminated string ends there, and a stray `)` at top
/// level is skipped. Only allocation failures come back as errors.
pub struct Reader<'a> {
    input: &'a [u8],
    pos: usize,
    heap: &'a mut Heap,
    symbols: &'a mut SymbolTable,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a str, heap: &'a mut Heap, symbols: &'a mut SymbolTable) -> Self {
        Reader {
            input: input.as_bytes(),
            pos: 0,
            heap,
            symbols,
        }
    }

    /// Start reading at byte offset `pos`.
    pub fn at(mut self, pos: usize) -> Self {
        self.pos = pos.min(self.input.len());
        self
    }

    /// Read one expression. Returns None at EOF.
    pub fn read(&mut self) -> LispResult<Option<Value>> {
        loop {
            self.skip_whitespace_and_comments();
            match self.peek() {
                None => return Ok(None),
                Some(b')') => self.pos += 1,
                Some(_) => return self.read_expr().map(Some),
            }
        }
    }

    /// Return current position in input.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while matches!(self.peek(), Some(ch) if ch.is_ascii_whitespace()) {
                self.pos += 1;
            }
            if self.peek() == Some(b';') {
                while !matches!(self.peek(), None | Some(b'\n')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn read_expr(&mut self) -> LispResult<Value> {
        self.skip_whitespace_and_comments();
        match self.peek() {
            None => Ok(Value::Nil),
            Some(b'(') => {
                self.pos += 1;
                self.read_list()
            }
            Some(b'\'') => {
                self.pos += 1;
                self.read_quote()
            }
            Some(b'"') => {
                self.pos += 1;
                self.read_string()
            }
            Some(_) => self.read_atom(),
        }
    }

    /// Read the rest of a list after its `(`: `(a b c)`, `(a . b)`.
    fn read_list(&mut self) -> LispResult<Value> {
        let mut elements = Vec::new();
        let mut tail = Value::Nil;

        loop {
            self.skip_whitespace_and_comments();
            match self.peek() {
                None => break,
                Some(b')') => {
                    self.pos += 1;
                    break;
                }
                Some(b'.') if self.is_dot_separator() => {
                    self.pos += 1;
                    tail = self.read_expr()?;
                    self.skip_to_close();
                    break;
                }
                Some(_) => elements.push(self.read_expr()?),
            }
        }

        self.heap.list_with_tail(&elements, tail)
    }

    /// A lone `.` followed by a delimiter or end of input.
    fn is_dot_separator(&self) -> bool {
        match self.input.get(self.pos + 1) {
            None => true,
            Some(&next) => is_delimiter(next),
        }
    }

    /// Discard anything between a dotted tail and its `)`.
    fn skip_to_close(&mut self) {
        let mut depth = 0usize;
        while let Some(ch) = self.peek() {
            self.pos += 1;
            match ch {
                b'(' => depth += 1,
                b')' if depth == 0 => return,
                b')' => depth -= 1,
                _ => {}
            }
        }
    }

    /// `'x` -> `(quote x)`
    fn read_quote(&mut self) -> LispResult<Value> {
        let quoted = self.read_expr()?;
        self.heap.list(&[Value::Symbol(sym::QUOTE), quoted])
    }

    /// Read a string after its opening quote. No escapes.
    fn read_string(&mut self) -> LispResult<Value> {
        let start = self.pos;
        while !matches!(self.peek(), None | Some(b'"')) {
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.input[start..self.pos]);
        if self.peek().is_some() {
            self.pos += 1;
        }
        self.heap.alloc_string(&text).map(Value::Ref)
    }

    fn read_atom(&mut self) -> LispResult<Value> {
        let start = self.pos;
        while matches!(self.peek(), Some(ch) if !is_delimiter(ch)) {
            self.pos += 1;
        }
        let word = &self.input[start..self.pos];
        // Nothing before a closing paren, as in `(a . )` or `(a ')`.
        if word.is_empty() {
            return Ok(Value::Nil);
        }

        if let Some(n) = parse_integer(word) {
            return self.heap.make_int(n);
        }
        let name = String::from_utf8_lossy(word);
        if name == "nil" {
            return Ok(Value::Nil);
        }
        let sym = self.symbols.intern(self.heap, &name)?;
        Ok(Value::Symbol(sym))
    }
}

fn is_delimiter(ch: u8) -> bool {
    ch.is_ascii_whitespace() || matches!(ch, b'(' | b')' | b'"')
}

/// Digit-initial or `-digit` words are integers, taking the longest digit
/// prefix: `12abc` reads as 12. Saturates instead of overflowing.
fn parse_integer(word: &[u8]) -> Option<i64> {
    let (negative, digits) = match word {
        [b'-', rest @ ..] => (true, rest),
        _ => (false, word),
    };
    if !digits.first()?.is_ascii_digit() {
        return None;
    }
    let mut n: i64 = 0;
    for &d in digits.iter().take_while(|d| d.is_ascii_digit()) {
        n = n.saturating_mul(10).saturating_add((d - b'0') as i64);
    }
    Some(if negative { -n } else { n })
}

/// Read the first expression of `input` starting at byte `pos`.
/// Returns the value (None at end of input) and the position after it.
pub fn read_one_at(
    input: &str,
    pos: usize,
    heap: &mut Heap,
    symbols: &mut SymbolTable,
) -> LispResult<(Option<Value>, usize)> {
    let mut reader = Reader::new(input, heap, symbols).at(pos);
    let val = reader.read()?;
    Ok((val, reader.position()))
}
