//! The lexer.
//!
//! One character of look-ahead, resolved against the current symbol
//! table: identifiers that name a known symbol come back as symbol
//! tokens, everything else as a plain [`Token::Name`]. A two-slot state
//! stack supports exactly one `unlex` plus one `relex` per context,
//! which is all the parser ever needs.
//!
//! Besides plain source text, the lexer accepts the stripped token-stream
//! format: bytes in `[128, 128+N)` are pre-tokenised symbol references
//! and bytes 1..=8 count as that many newlines.

use bitflags::bitflags;
use strum::{EnumIter, IntoStaticStr};

use crate::{
    diag::{CompileResult, ErrorKind},
    source::{NumError, NumKind},
    state::Cc,
    symtab::{FindFlags, Finder, SymKind, SymKinds, SymPayload, SymbolId},
};

/// Keywords. The names are the source spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    Include,
    Import,
    As,
    End,
    EelVersion,

    Return,
    If,
    Else,
    Switch,
    Case,
    Default,
    For,
    Do,
    While,
    Until,
    Break,
    Continue,
    Repeat,

    Try,
    Untry,
    Except,
    Throw,
    Retry,
    Exception,

    Local,
    Static,
    Upvalue,
    Export,
    Shadow,
    Constant,

    Procedure,

    True,
    False,
    Nil,

    Arguments,
    Tuples,
    Specified,
}

/// Tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Eof,
    /// A plain byte (punctuation, or any unclaimed character).
    Punct(u8),
    /// Real number literal; value in the lexer value.
    RealNum,
    /// Integer number literal; value in the lexer value.
    IntNum,
    /// String literal; bytes in the lexer value.
    Str,
    /// Identifier with no symbol binding; bytes in the lexer value.
    Name,
    /// The `(=)` weak assignment operator.
    WeakAssign,
    Kw(Keyword),
    /// Symbol-reference tokens; the symbol is in the lexer value.
    SymConstant,
    SymClass,
    SymVariable,
    SymFunction,
    SymOperator,
    /// Operator found by dropping a trailing `=`: a shorthand update.
    SymShortOp,
    SymBody,
    /// Any other symbol kind (namespaces, modules).
    SymGeneric,
}

/// Value attached to the current token.
#[derive(Debug, Clone, Default)]
pub enum Lval {
    #[default]
    None,
    Real(f64),
    Integer(i32),
    Str(Vec<u8>),
    Symbol(SymbolId),
}

impl Lval {
    /// The symbol reference; only valid on symbol tokens.
    #[must_use]
    pub fn symbol(&self) -> Option<SymbolId> {
        match self {
            Self::Symbol(s) => Some(*s),
            _ => None,
        }
    }
}

/// Saved lexer state, for `unlex`.
#[derive(Debug, Clone, Default)]
pub struct LexItem {
    pub token: Option<Token>,
    pub lval: Lval,
    pub pos: Option<usize>,
}

bitflags! {
    /// Per-call lexical rule tweaks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LexFlags: u8 {
        /// Report end-of-line as a token instead of whitespace.
        const REPORT_EOLN = 0x01;
        /// Do not search parent scopes when resolving identifiers.
        const LOCALS_ONLY = 0x02;
        /// Skip the operator scan.
        const NO_OPERATORS = 0x04;
        /// Return any printable character directly as a token.
        const CHARACTERS = 0x08;
        /// Do not skip leading whitespace.
        const NO_SKIPWHITE = 0x10;
    }
}

bitflags! {
    /// Declaration qualifiers collected ahead of a simple expression.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Qualifiers: u8 {
        const LOCAL = 0x01;
        const STATIC = 0x02;
        const UPVALUE = 0x04;
        const EXPORT = 0x08;
        const SHADOW = 0x10;
    }
}

/// Longest operator token, in bytes.
const MAX_OPERATOR_LEN: usize = 16;

/// First byte of the pre-tokenised symbol range.
pub const STRIP_TOKEN_BASE: u8 = 128;

fn is_operator_char(c: u8) -> bool {
    matches!(
        c,
        b'!' | b'#' | b'%' | b'&' | b'*' | b'+' | b'-' | b'/' | b':' | b'<' | b'=' | b'>' | b'?' | b'@' | b'^'
            | b'|' | b'~'
    )
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$'
}

fn is_name_cont(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

impl Cc<'_> {
    /// Reads one byte, mapping the stripped-format newline bytes to `\n`
    /// and rejecting other control bytes.
    fn lex_getchar(&mut self) -> CompileResult<Option<u8>> {
        let Some(c) = self.reader.get_char() else {
            return Ok(None);
        };
        if c >= b' ' {
            return Ok(Some(c));
        }
        match c {
            1..=8 => Ok(Some(b'\n')),
            b'\n' | b'\r' | b'\t' => Ok(Some(c)),
            _ => Err(self.error(ErrorKind::Syntax, "Illegal character! Binary file?")),
        }
    }

    /// Skips whitespace and comments; returns the first non-white byte.
    /// With `report_eoln`, a newline is returned instead of skipped.
    fn skipwhite(&mut self, report_eoln: bool) -> CompileResult<Option<u8>> {
        loop {
            let Some(c) = self.lex_getchar()? else {
                return Ok(None);
            };
            match c {
                b' ' | b'\t' | b'\r' => {}
                b'\n' => {
                    if report_eoln {
                        return Ok(Some(b'\n'));
                    }
                }
                b'/' => match self.lex_getchar()? {
                    Some(b'/') => {
                        // C++ style single line comment
                        while let Some(c) = self.lex_getchar()? {
                            if c == b'\n' {
                                break;
                            }
                        }
                    }
                    Some(b'*') => {
                        // C style comment
                        let mut prev = 0u8;
                        while let Some(c) = self.lex_getchar()? {
                            if prev == b'*' && c == b'/' {
                                break;
                            }
                            prev = c;
                        }
                    }
                    other => {
                        if other.is_some() {
                            self.reader.unget();
                        }
                        return Ok(Some(b'/'));
                    }
                },
                _ => return Ok(Some(c)),
            }
        }
    }

    /// Reads exactly `figures` digits in `base`.
    fn get_num(&mut self, base: u32, figures: u32) -> CompileResult<Option<u32>> {
        let mut value = 0u32;
        for _ in 0..figures {
            let Some(c) = self.lex_getchar()? else {
                return Err(self.error(ErrorKind::Syntax, "End of file inside string escape sequence!"));
            };
            let f = match c {
                b'0'..=b'9' => u32::from(c - b'0'),
                b'a'..=b'z' => u32::from(c - b'a') + 10,
                b'A'..=b'Z' => u32::from(c - b'A') + 10,
                _ => return Ok(None),
            };
            if f >= base {
                return Ok(None);
            }
            value = value * base + f;
        }
        Ok(Some(value))
    }

    /// Parses a quoted literal after its opening delimiter.
    ///
    /// Supports the C escape codes, `\0..\3` plus two octal digits,
    /// `\d` plus two decimal digits, `\x` plus two hex digits, and
    /// C-style continuation over whitespace. Raw newlines, returns and
    /// tabs inside the literal are filtered out.
    fn parse_string(&mut self, delim: u8) -> CompileResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let Some(c) = self.lex_getchar()? else {
                let what = if delim == b'"' { "string" } else { "character" };
                return Err(self.error(ErrorKind::Syntax, format!("End of file inside {what} literal!")));
            };
            let c = match c {
                b'\\' => {
                    let Some(e) = self.lex_getchar()? else {
                        return Err(self.error(ErrorKind::Syntax, "End of file inside string escape sequence!"));
                    };
                    match e {
                        lead @ b'0'..=b'3' => {
                            let Some(v) = self.get_num(8, 2)? else {
                                return Err(self.error(ErrorKind::Syntax, "Illegal octal number!"));
                            };
                            let v = u32::from(lead - b'0') * 64 + v;
                            u8::try_from(v)
                                .map_err(|_| self.error(ErrorKind::Syntax, "Illegal octal number!"))?
                        }
                        b'a' => 7,
                        b'b' => 8,
                        b'c' => 0,
                        b'd' => {
                            let Some(v) = self.get_num(10, 2)? else {
                                return Err(self.error(ErrorKind::Syntax, "Illegal decimal number!"));
                            };
                            u8::try_from(v)
                                .map_err(|_| self.error(ErrorKind::Syntax, "Illegal decimal number!"))?
                        }
                        b'f' => 12,
                        b'n' => b'\n',
                        b'r' => b'\r',
                        b't' => b'\t',
                        b'v' => 11,
                        b'x' => {
                            let Some(v) = self.get_num(16, 2)? else {
                                return Err(self.error(ErrorKind::Syntax, "Illegal hex number!"));
                            };
                            u8::try_from(v).map_err(|_| self.error(ErrorKind::Syntax, "Illegal hex number!"))?
                        }
                        other => {
                            out.push(other);
                            continue;
                        }
                    }
                }
                // Inline newlines and tabs are filtered out; unquote and
                // continue the literal to embed whitespace.
                b'\n' | b'\r' | b'\t' => continue,
                c => c,
            };
            if c == delim {
                // Look ahead for C style continuation, counting newlines.
                let mut got_nl = false;
                let next = loop {
                    match self.skipwhite(true)? {
                        Some(b'\n') => got_nl = true,
                        other => break other,
                    }
                };
                match next {
                    Some(n) if n == delim => {
                        if !got_nl {
                            self.warn("C style string continuation with no newline! Typo?");
                        }
                        continue;
                    }
                    Some(_) => {
                        self.reader.unget();
                        break;
                    }
                    None => break,
                }
            }
            out.push(c);
        }
        Ok(out)
    }

    /// Greedily gathers operator characters starting with `c`.
    fn grab_operator(&mut self, c: u8) -> CompileResult<Vec<u8>> {
        let mut word = Vec::new();
        let mut c = Some(c);
        loop {
            match c {
                Some(ch) if is_operator_char(ch) => {
                    if word.len() >= MAX_OPERATOR_LEN {
                        return Err(self.error(ErrorKind::Syntax, "That's a pretty long operator token...!"));
                    }
                    word.push(ch);
                }
                other => {
                    if other.is_some() && !word.is_empty() {
                        self.reader.unget();
                    }
                    return Ok(word);
                }
            }
            c = self.lex_getchar()?;
        }
    }

    /// Detects the `(=)` weak assignment trigraph after a `(`.
    fn check_weakassign(&mut self, c: u8) -> CompileResult<bool> {
        if c != b'(' {
            return Ok(false);
        }
        if self.lex_getchar()? == Some(b'=') {
            if self.lex_getchar()? == Some(b')') {
                return Ok(true);
            }
            self.reader.unget();
        }
        self.reader.unget();
        Ok(false)
    }

    /// Looks up `name` from `table` as the lexer does: any value-like
    /// symbol kind, recursing upward unless `locals_only`.
    fn lookup_name(&mut self, table: SymbolId, name: &[u8], locals_only: bool) -> Option<SymbolId> {
        if self.lex_hidden_scope {
            return None;
        }
        let nid = self.heap.new_string(name);
        let mut flags = FindFlags::MATCH_NAME | FindFlags::MATCH_KINDS;
        if !locals_only {
            flags |= FindFlags::RECURSE_UP;
        }
        let mut f = Finder::new(table, flags);
        f.name = Some(nid);
        f.kinds = SymKinds::KEYWORD
            | SymKinds::VARIABLE
            | SymKinds::UPVALUE
            | SymKinds::BODY
            | SymKinds::NAMESPACE
            | SymKinds::CONSTANT
            | SymKinds::CLASS
            | SymKinds::FUNCTION
            | SymKinds::OPERATOR;
        let hit = f.next(self.tree);
        self.heap.disown(nid);
        hit
    }

    fn lookup_operator(&mut self, table: SymbolId, word: &[u8], locals_only: bool) -> Option<SymbolId> {
        if self.lex_hidden_scope {
            return None;
        }
        let nid = self.heap.new_string(word);
        let mut flags = FindFlags::MATCH_NAME | FindFlags::MATCH_KINDS;
        if !locals_only {
            flags |= FindFlags::RECURSE_UP;
        }
        let mut f = Finder::new(table, flags);
        f.name = Some(nid);
        f.kinds = SymKinds::OPERATOR;
        let hit = f.next(self.tree);
        self.heap.disown(nid);
        hit
    }

    fn symbol_token(&mut self, sym: SymbolId) -> Token {
        let s = self.tree.get(sym);
        let token = match s.kind {
            SymKind::Keyword => match &s.payload {
                SymPayload::Keyword(kw) => Token::Kw(*kw),
                _ => Token::SymGeneric,
            },
            SymKind::Variable | SymKind::Upvalue => Token::SymVariable,
            SymKind::Body => Token::SymBody,
            SymKind::Constant => Token::SymConstant,
            SymKind::Class => Token::SymClass,
            SymKind::Function => Token::SymFunction,
            SymKind::Operator => Token::SymOperator,
            _ => Token::SymGeneric,
        };
        self.lval = Lval::Symbol(sym);
        token
    }

    /// Produces the next token.
    pub fn lex(&mut self, flags: LexFlags) -> CompileResult<Token> {
        // Push current state for unlex().
        self.lex_stack[1] = std::mem::take(&mut self.lex_stack[0]);
        self.lex_stack[0] = LexItem {
            token: Some(self.token),
            lval: std::mem::take(&mut self.lval),
            pos: Some(self.reader.tell()),
        };

        let token = self.lex_inner(flags)?;
        self.token = token;
        Ok(token)
    }

    fn lex_inner(&mut self, mut flags: LexFlags) -> CompileResult<Token> {
        let first = if flags.contains(LexFlags::NO_SKIPWHITE) {
            self.lex_getchar()?
        } else {
            self.skipwhite(flags.contains(LexFlags::REPORT_EOLN))?
        };
        let Some(mut c) = first else {
            return Ok(Token::Eof);
        };

        let mut st = self.symtab();

        // Pre-tokenised symbol? (stripped source format)
        if c >= STRIP_TOKEN_BASE {
            let ix = usize::from(c - STRIP_TOKEN_BASE);
            let Some(sym) = self.strip_token(ix) else {
                return Err(self.ierror(format!("Undefined stripped-source token {c}!")));
            };
            // The strip tool sometimes tokenizes field names; in
            // locals-only positions those turn back into plain names.
            if flags.contains(LexFlags::LOCALS_ONLY) {
                let name = match self.tree.get(sym).name {
                    Some(n) => self.heap.str_bytes(n).to_vec(),
                    None => Vec::new(),
                };
                self.lval = Lval::Str(name);
                return Ok(Token::Name);
            }
            let kind = self.tree.get(sym).kind;
            return match kind {
                SymKind::Keyword | SymKind::Class | SymKind::Operator => Ok(self.symbol_token(sym)),
                _ => Err(self.ierror(format!("Stripped-source token {c} names an unsupported symbol kind!"))),
            };
        }

        if flags.contains(LexFlags::CHARACTERS) && c > b' ' && c <= 127 {
            return Ok(Token::Punct(c));
        }

        // (Multi)character literal, packed big-endian so that the last
        // byte lands in the lowest bits.
        if c == b'\'' {
            let bytes = self.parse_string(b'\'')?;
            if bytes.len() > size_of::<i32>() {
                return Err(self.error(
                    ErrorKind::Syntax,
                    "Character literal too long for the integer type!",
                ));
            }
            let mut val = 0i32;
            for b in &bytes {
                val = (val << 8) | i32::from(*b);
            }
            self.lval = Lval::Integer(val);
            return Ok(Token::IntNum);
        }

        // String literal
        if c == b'"' {
            let bytes = self.parse_string(b'"')?;
            self.lval = Lval::Str(bytes);
            return Ok(Token::Str);
        }

        // Identifier or keyword
        while is_name_start(c) {
            let mut name = vec![c];
            loop {
                match self.lex_getchar()? {
                    Some(n) if is_name_cont(n) => name.push(n),
                    Some(_) => {
                        self.reader.unget();
                        break;
                    }
                    None => break,
                }
            }
            let Some(sym) = self.lookup_name(st, &name, flags.contains(LexFlags::LOCALS_ONLY)) else {
                self.lval = Lval::Str(name);
                return Ok(Token::Name);
            };
            if self.tree.get(sym).kind == SymKind::Namespace {
                // A namespace followed by '.' narrows subsequent lookups
                // rather than producing a value token.
                let next = self.skipwhite(flags.contains(LexFlags::REPORT_EOLN))?;
                if next != Some(b'.') {
                    if next.is_some() {
                        self.reader.unget();
                    }
                    self.lval = Lval::Symbol(sym);
                    return Ok(Token::SymGeneric);
                }
                st = sym;
                flags |= LexFlags::LOCALS_ONLY;
                match self.skipwhite(flags.contains(LexFlags::REPORT_EOLN))? {
                    Some(n) => {
                        c = n;
                        continue;
                    }
                    None => return Ok(Token::Eof),
                }
            }
            return Ok(self.symbol_token(sym));
        }

        // Operators
        if !flags.contains(LexFlags::NO_OPERATORS) {
            let pos = self.reader.tell();
            if self.check_weakassign(c)? {
                return Ok(Token::WeakAssign);
            }
            let mut word = self.grab_operator(c)?;
            let mut removed_eq = false;
            while !word.is_empty() {
                if let Some(sym) = self.lookup_operator(st, &word, flags.contains(LexFlags::LOCALS_ONLY)) {
                    let no_short = match &self.tree.get(sym).payload {
                        SymPayload::Operator(op) => op.no_short,
                        _ => false,
                    };
                    self.lval = Lval::Symbol(sym);
                    if no_short {
                        return Ok(Token::SymOperator);
                    }
                    if removed_eq {
                        // Re-consume the '=' that completes the
                        // shorthand form.
                        self.lex_getchar()?;
                        return Ok(Token::SymShortOp);
                    }
                    return Ok(Token::SymOperator);
                }
                let dropped = word.pop().expect("word is non-empty");
                removed_eq = dropped == b'=';
                self.reader.unget();
            }
            self.reader.seek_set(pos);
        }

        // Numeric literal
        match self.reader.read_number() {
            Ok(num) => {
                if num.kind == NumKind::Integer {
                    // Integers that fit the signed or unsigned 32-bit
                    // range become integer tokens; larger values fall
                    // back to reals.
                    if num.value >= i32::MIN.into() && num.value <= i32::MAX.into() && num.value.fract() == 0.0 {
                        #[expect(clippy::cast_possible_truncation, reason = "range-checked above")]
                        let i = num.value as i32;
                        self.lval = Lval::Integer(i);
                        return Ok(Token::IntNum);
                    }
                    if num.value >= 0.0 && num.value <= u32::MAX.into() && num.value.fract() == 0.0 {
                        #[expect(clippy::cast_possible_truncation, reason = "range-checked above")]
                        #[expect(clippy::cast_sign_loss, reason = "range-checked above")]
                        let u = num.value as u32;
                        self.lval = Lval::Integer(u.cast_signed());
                        return Ok(Token::IntNum);
                    }
                }
                self.lval = Lval::Real(num.value);
                return Ok(Token::RealNum);
            }
            Err(NumError::NoNumber) => {
                c = self.reader.last().unwrap_or(c);
            }
            Err(NumError::BadBase) => {
                return Err(self.error(ErrorKind::Numeric, "Bad base syntax in numeric literal!"));
            }
            Err(NumError::BigBase) => {
                return Err(self.error(ErrorKind::Numeric, "Too big base in numeric literal!"));
            }
            Err(NumError::BadInteger) => {
                return Err(self.error(ErrorKind::Numeric, "Bad integer part in numeric literal!"));
            }
            Err(NumError::BadFraction) => {
                return Err(self.error(ErrorKind::Numeric, "Bad fractional part in numeric literal!"));
            }
            Err(NumError::BadExponent) => {
                return Err(self.error(ErrorKind::Numeric, "Bad exponent in numeric literal!"));
            }
        }

        // Anything else is itself.
        Ok(Token::Punct(c))
    }

    /// Pushes the current token back. Only one level is supported per
    /// context.
    pub fn unlex(&mut self) -> CompileResult<()> {
        let Some(pos) = self.lex_stack[0].pos else {
            return Err(self.ierror("Too deep unlex()ing!"));
        };
        self.reader.seek_set(pos);
        let item = std::mem::take(&mut self.lex_stack[0]);
        self.lex_stack[0] = std::mem::take(&mut self.lex_stack[1]);
        self.token = item.token.unwrap_or(Token::Eof);
        self.lval = item.lval;
        Ok(())
    }

    /// Re-lexes the current token under different flags.
    pub fn relex(&mut self, flags: LexFlags) -> CompileResult<Token> {
        self.unlex()?;
        self.lex(flags)
    }

    /// Resets the lexer state stack; any pushed-back state is dropped.
    pub fn lexer_invalidate(&mut self) {
        self.lval = Lval::None;
        self.lex_stack = [LexItem::default(), LexItem::default()];
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn keyword_spellings() {
        let names: Vec<&'static str> = Keyword::iter().map(Into::into).collect();
        assert!(names.contains(&"eelversion"));
        assert!(names.contains(&"procedure"));
        assert!(names.contains(&"specified"));
        assert_eq!(names.len(), 37);
    }

    #[test]
    fn operator_charset() {
        for c in b"!#%&*+-/:<=>?@^|~" {
            assert!(is_operator_char(*c));
        }
        assert!(!is_operator_char(b'('));
        assert!(!is_operator_char(b'.'));
    }

    #[test]
    fn name_charset() {
        assert!(is_name_start(b'$'));
        assert!(is_name_start(b'_'));
        assert!(!is_name_cont(b'$'));
        assert!(is_name_cont(b'9'));
        assert!(!is_name_start(b'9'));
    }
}
