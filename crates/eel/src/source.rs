//! Buffered access to module source code.
//!
//! The reader owns a cursor over a borrowed byte slice and provides the
//! low-level services the lexer is built on: single-byte reads with
//! unbounded push-back, position save/restore, numeric literal parsing,
//! and a cached line/column calculator for diagnostics.
//!
//! The cursor convention throughout is that `last()` returns the byte most
//! recently consumed, i.e. `data[pos - 1]`. The numeric parser relies on
//! this: the caller has already consumed the first character of a
//! candidate literal when it calls [`SourceReader::read_number`].

use strum::IntoStaticStr;

/// Column granularity used when expanding tabs in `linecount`.
pub const TAB_SIZE: usize = 8;

/// What kind of numeric literal [`SourceReader::read_number`] parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumKind {
    /// No decimal point was seen.
    Integer,
    /// A decimal point was seen.
    Real,
}

/// Why a numeric literal failed to parse.
///
/// `NoNumber` means the cursor was not at a numeric literal at all; the
/// other kinds mean a literal started but was malformed. In every failure
/// case the cursor is left where it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
pub enum NumError {
    BadBase,
    BigBase,
    BadInteger,
    BadFraction,
    BadExponent,
    NoNumber,
}

/// A parsed numeric literal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Number {
    pub value: f64,
    pub kind: NumKind,
}

/// Line/column cache for `linecount`.
///
/// Walking from the start of the buffer for every diagnostic is quadratic
/// in pathological cases, so the last computed position is remembered and
/// extended forward whenever the requested position is at or past it.
#[derive(Debug, Clone, Copy)]
struct LineCache {
    pos: usize,
    line: usize,
    col: usize,
}

/// Buffered source reader.
///
/// Does not own the source buffer.
#[derive(Debug)]
pub struct SourceReader<'src> {
    data: &'src [u8],
    pos: usize,
    cache: Option<LineCache>,
}

impl<'src> SourceReader<'src> {
    #[must_use]
    pub fn new(data: &'src [u8]) -> Self {
        Self {
            data,
            pos: 0,
            cache: None,
        }
    }

    /// Returns the last byte consumed, or `None` at the start of the buffer.
    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<u8> {
        if self.pos > 0 {
            Some(self.data[self.pos - 1])
        } else {
            None
        }
    }

    /// Consumes and returns the next byte, or `None` at end of buffer.
    #[inline]
    pub fn get_char(&mut self) -> Option<u8> {
        if self.pos < self.data.len() {
            let c = self.data[self.pos];
            self.pos += 1;
            Some(c)
        } else {
            None
        }
    }

    /// Pushes the last byte back. No depth limit.
    #[inline]
    pub fn unget(&mut self) {
        if self.pos > 0 {
            self.pos -= 1;
        }
    }

    /// Current cursor position.
    #[inline]
    #[must_use]
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Sets the cursor position, clamped to the buffer.
    #[inline]
    pub fn seek_set(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    /// Total buffer length.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Reads up to `count` bytes starting at the cursor, advancing past
    /// whatever was actually available.
    pub fn read(&mut self, count: usize) -> &'src [u8] {
        let end = (self.pos + count).min(self.data.len());
        let out = &self.data[self.pos..end];
        self.pos = end;
        out
    }

    /// Reads and parses a numeric literal.
    ///
    /// The first character of the candidate literal must already have been
    /// consumed (so that `last()` returns it). On success the cursor is
    /// left one past the last consumed figure and the parsed value and
    /// kind are returned. On failure the cursor is restored to where it
    /// was on entry.
    ///
    /// Accepted forms: an optional base prefix (`0x`, `0dd`, `0d`, `0o`,
    /// `0q`, `0b`, `0v`, or `0n(N)` with N in 2..=36), integer figures, an
    /// optional `.fraction`, and an optional exponent with marker in
    /// `{e, E, p, P, @}` and optional sign. The exponent scales by the
    /// literal's base, and its figures are read in that base as well.
    pub fn read_number(&mut self) -> Result<Number, NumError> {
        let startpos = self.pos;
        match self.read_number_inner() {
            Ok(num) => Ok(num),
            Err(e) => {
                self.seek_set(startpos);
                Err(e)
            }
        }
    }

    /// Translates the last consumed byte to a figure value, or `None` for
    /// anything that is not alphanumeric (including EOF).
    fn figure(&self) -> Option<u32> {
        let c = self.last()?;
        match c {
            b'0'..=b'9' => Some(u32::from(c - b'0')),
            b'A'..=b'Z' => Some(u32::from(c - b'A') + 10),
            b'a'..=b'z' => Some(u32::from(c - b'a') + 10),
            _ => None,
        }
    }

    /// Accumulates figures below `base` starting with the last consumed
    /// byte. Returns the number of figures, their value, and whether the
    /// loop stopped at end of buffer (in which case the final figure is
    /// the last consumed byte and there is no terminator to push back).
    fn parse_figures(&mut self, base: u32) -> (u32, f64, bool) {
        let mut figures = 0;
        let mut v = 0.0;
        loop {
            match self.figure() {
                Some(f) if f < base => {
                    v = v * f64::from(base) + f64::from(f);
                    figures += 1;
                    if self.get_char().is_none() {
                        return (figures, v, true);
                    }
                }
                _ => return (figures, v, false),
            }
        }
    }

    fn read_number_inner(&mut self) -> Result<Number, NumError> {
        let mut has_integer = false;
        let mut has_dot = false;
        let mut base: u32 = 10;

        let c = self.last().ok_or(NumError::NoNumber)?;
        if !c.is_ascii_digit() && c != b'.' {
            return Err(NumError::NoNumber);
        }

        // Decode base, if specified
        if c == b'0' {
            has_integer = true;
            let Some(c) = self.get_char() else {
                return Ok(Number {
                    value: 0.0,
                    kind: NumKind::Integer,
                });
            };
            match c {
                b'v' => {
                    // vigesimal, 0..[jJ]
                    base = 20;
                    self.get_char();
                }
                b'x' => {
                    // hexadecimal, 0..[fF]
                    base = 16;
                    self.get_char();
                }
                b'd' => {
                    let c = self.get_char().ok_or(NumError::NoNumber)?;
                    if c == b'd' {
                        // duodecimal, 0..[bB]
                        base = 12;
                        self.get_char();
                    } else {
                        // decimal, 0..9
                        base = 10;
                    }
                }
                b'o' => {
                    // octal, 0..7
                    base = 8;
                    self.get_char();
                }
                b'q' => {
                    // quartal, 0..3
                    base = 4;
                    self.get_char();
                }
                b'b' => {
                    // binary, 0..1
                    base = 2;
                    self.get_char();
                }
                b'n' => {
                    if self.get_char() != Some(b'(') {
                        return Err(NumError::BadBase);
                    }
                    base = 0;
                    loop {
                        let c = self.get_char().ok_or(NumError::BadBase)?;
                        if c == b')' {
                            self.get_char();
                            break;
                        }
                        if !c.is_ascii_digit() {
                            return Err(NumError::BadBase);
                        }
                        base = base * 10 + u32::from(c - b'0');
                        if base > 1000 {
                            return Err(NumError::BigBase);
                        }
                    }
                    if base < 2 {
                        return Err(NumError::BadBase);
                    }
                }
                _ => {
                    // Not a prefix; hand the byte back to the figure parser.
                    self.unget();
                }
            }
            if base > 36 {
                return Err(NumError::BigBase);
            }
        }

        // Integer part
        let mut i = 0.0;
        let mut at_eof = false;
        if self.last() != Some(b'.') {
            let (figures, v, eof) = self.parse_figures(base);
            if figures < u32::from(!has_integer) {
                return Err(NumError::BadInteger);
            }
            i = v;
            has_integer = true;
            at_eof = eof;
        } else {
            has_dot = true;
        }

        // Fraction part
        let mut f = 0.0;
        let mut has_fraction = false;
        if self.last() == Some(b'.') {
            has_dot = true;
            self.get_char();
            let (figures, v, eof) = self.parse_figures(base);
            if figures > 0 {
                f = v / f64::from(base).powi(i32::try_from(figures).map_err(|_| NumError::BadFraction)?);
                has_fraction = true;
            }
            at_eof = eof;
        }

        if has_dot && !(has_integer || has_fraction) {
            return Err(NumError::NoNumber);
        }

        // Exponent part. Markers only work when they are not eaten as
        // figures of a big-base literal, which is exactly the original
        // behavior.
        let mut e = 0.0;
        if !at_eof && matches!(self.last(), Some(b'e' | b'E' | b'p' | b'P' | b'@')) {
            let c = self.get_char().ok_or(NumError::BadExponent)?;
            let esign = match c {
                b'-' => {
                    self.get_char();
                    -1.0
                }
                b'+' => {
                    self.get_char();
                    1.0
                }
                _ => 1.0,
            };
            let (figures, v, eof) = self.parse_figures(base);
            if figures == 0 {
                return Err(NumError::BadExponent);
            }
            e = v * esign;
            at_eof = eof;
        }

        // Leave the cursor one past the last consumed figure: the figure
        // loops consume the terminating byte, so hand it back unless the
        // literal ran into the end of the buffer.
        if !at_eof {
            self.unget();
        }

        let value = (i + f) * f64::from(base).powf(e);
        Ok(Number {
            value,
            kind: if has_dot { NumKind::Real } else { NumKind::Integer },
        })
    }

    /// Calculates the line and column of `pos`.
    ///
    /// Tabs jump to the next multiple of [`TAB_SIZE`]; bytes 1..=8 count
    /// as that many newlines (stripped token-stream format). Returns
    /// `None` when `pos` is past the end of the buffer.
    pub fn linecount(&mut self, pos: usize) -> Option<(usize, usize)> {
        if pos > self.data.len() {
            return None;
        }
        let (mut l, mut c, mut p) = match self.cache {
            Some(cache) if pos >= cache.pos => (cache.line, cache.col, cache.pos),
            _ => (1, 1, 0),
        };
        while p < pos {
            let ch = self.data[p];
            p += 1;
            match ch {
                b'\n' => {
                    l += 1;
                    c = 1;
                }
                b'\t' => {
                    c += TAB_SIZE + 1;
                    c -= c % TAB_SIZE;
                }
                1..=8 => {
                    l += usize::from(ch);
                    c = 1;
                }
                _ => {
                    if ch >= b' ' {
                        c += 1;
                    }
                }
            }
        }
        self.cache = Some(LineCache { pos: p, line: l, col: c });
        Some((l, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Consumes the first byte and parses a number, the way the lexer does.
    fn parse(src: &str) -> (Result<Number, NumError>, usize) {
        let mut r = SourceReader::new(src.as_bytes());
        r.get_char();
        let res = r.read_number();
        (res, r.tell())
    }

    fn value_of(src: &str) -> f64 {
        let (res, _) = parse(src);
        res.expect("should parse").value
    }

    #[test]
    fn decimal_integers() {
        let (res, pos) = parse("1234;");
        let num = res.unwrap();
        assert_eq!(num.value, 1234.0);
        assert_eq!(num.kind, NumKind::Integer);
        // Cursor one past the last figure; ';' is the next byte.
        assert_eq!(pos, 4);
    }

    #[test]
    fn base_prefixes() {
        assert_eq!(value_of("0xFF "), 255.0);
        assert_eq!(value_of("0b1011 "), 11.0);
        assert_eq!(value_of("0o17 "), 15.0);
        assert_eq!(value_of("0q321 "), 57.0);
        assert_eq!(value_of("0d123 "), 123.0);
        assert_eq!(value_of("0dd10A "), 12.0 * 12.0 + 10.0);
        assert_eq!(value_of("0v1J "), 39.0);
        assert_eq!(value_of("0n(7)123 "), 1.0 * 49.0 + 2.0 * 7.0 + 3.0);
    }

    #[test]
    fn reals_and_exponents() {
        let (res, _) = parse("1.5;");
        let num = res.unwrap();
        assert_eq!(num.kind, NumKind::Real);
        assert_eq!(num.value, 1.5);

        assert_eq!(value_of("1e3 "), 1000.0);
        assert_eq!(value_of("2.5e-2 "), 0.025);
        assert_eq!(value_of("1p2 "), 100.0);
        assert_eq!(value_of("1@1 "), 10.0);
        // Hex exponents scale by 16 and read hex figures.
        assert_eq!(value_of("0x1p2 "), 256.0);
    }

    #[test]
    fn leading_dot_and_bare_zero() {
        let (res, _) = parse(".5;");
        assert_eq!(res.unwrap(), Number { value: 0.5, kind: NumKind::Real });

        let (res, _) = parse("0;");
        assert_eq!(res.unwrap(), Number { value: 0.0, kind: NumKind::Integer });

        // A lone dot is not a number, and the cursor must not move.
        let mut r = SourceReader::new(b". x");
        r.get_char();
        let before = r.tell();
        assert_eq!(r.read_number(), Err(NumError::NoNumber));
        assert_eq!(r.tell(), before);
    }

    #[test]
    fn zero_figure_integer_needs_prefix() {
        // "0x" with no figures: prefix consumed a char, so an empty
        // integer part is allowed and the value is 0.
        let (res, _) = parse("0x;");
        assert_eq!(res.unwrap().value, 0.0);
    }

    #[test]
    fn bad_bases() {
        let (res, _) = parse("0n(1)0 ");
        assert_eq!(res, Err(NumError::BadBase));
        let (res, _) = parse("0n(99)0 ");
        assert_eq!(res, Err(NumError::BigBase));
        let (res, _) = parse("0n[5] ");
        assert_eq!(res, Err(NumError::BadBase));
    }

    #[test]
    fn bad_exponent() {
        let (res, pos) = parse("1e+;");
        assert_eq!(res, Err(NumError::BadExponent));
        // Failure restores the cursor.
        assert_eq!(pos, 1);
    }

    #[test]
    fn eof_terminated_literal() {
        let (res, pos) = parse("42");
        assert_eq!(res.unwrap().value, 42.0);
        assert_eq!(pos, 2);
    }

    #[test]
    fn linecount_tabs_and_newlines() {
        let mut r = SourceReader::new(b"ab\ncd\tef\ngh");
        assert_eq!(r.linecount(0), Some((1, 1)));
        assert_eq!(r.linecount(3), Some((2, 1)));
        // Tab jumps to the next multiple of TAB_SIZE.
        assert_eq!(r.linecount(6), Some((2, 8)));
        assert_eq!(r.linecount(9), Some((3, 1)));
        assert_eq!(r.linecount(100), None);
    }

    #[test]
    fn linecount_compressed_newlines() {
        // Byte 3 counts as three newlines (stripped source format).
        let mut r = SourceReader::new(&[b'a', 3, b'b']);
        assert_eq!(r.linecount(2), Some((4, 1)));
        assert_eq!(r.linecount(3), Some((4, 2)));
    }

    #[test]
    fn linecount_cache_walks_forward() {
        let mut r = SourceReader::new(b"a\nb\nc\nd");
        assert_eq!(r.linecount(2), Some((2, 1)));
        // Forward from the cache.
        assert_eq!(r.linecount(6), Some((4, 1)));
        // Behind the cache: recomputed from the start.
        assert_eq!(r.linecount(0), Some((1, 1)));
    }

    #[test]
    fn unget_and_seek() {
        let mut r = SourceReader::new(b"xyz");
        assert_eq!(r.get_char(), Some(b'x'));
        assert_eq!(r.last(), Some(b'x'));
        r.unget();
        assert_eq!(r.get_char(), Some(b'x'));
        r.seek_set(2);
        assert_eq!(r.get_char(), Some(b'z'));
        assert_eq!(r.get_char(), None);
        assert_eq!(r.read(10), b"");
    }
}
