//! Cursor-oriented text scanner
//!
//! A small stateful cursor over a UTF-8 string, used by the Format-4 task
//! parser. Operates on codepoints, not bytes; extracted text is written to a
//! borrowed `String` sink. Backtracking is supported through `cursor` /
//! `restore_to`.

/// A scanning cursor over a borrowed string.
#[derive(Debug)]
pub struct Pig<'a> {
    value: &'a str,
    idx: usize,
}

impl<'a> Pig<'a> {
    pub fn new(value: &'a str) -> Self {
        Self { value, idx: 0 }
    }

    fn current(&self) -> Option<char> {
        self.value[self.idx..].chars().next()
    }

    /// If the rune at the cursor equals `ch`, advance past it.
    pub fn skip(&mut self, ch: char) -> bool {
        if self.current() == Some(ch) {
            self.idx += ch.len_utf8();
            return true;
        }
        false
    }

    /// Advance `n` runes. On end-of-stream the cursor is restored and
    /// `false` is returned.
    pub fn skip_n(&mut self, n: usize) -> bool {
        let save = self.idx;
        for _ in 0..n {
            match self.current() {
                Some(ch) => self.idx += ch.len_utf8(),
                None => {
                    self.idx = save;
                    return false;
                }
            }
        }
        true
    }

    /// Write runes from the cursor up to (not including) the first `end`
    /// rune, or to end-of-stream, into `sink`. The cursor lands on `end`
    /// (or at end-of-stream). Returns `false` only when already at
    /// end-of-stream.
    pub fn get_until(&mut self, end: char, sink: &mut String) -> bool {
        if self.current().is_none() {
            return false;
        }

        let save = self.idx;
        while let Some(ch) = self.current() {
            if ch == end {
                sink.push_str(&self.value[save..self.idx]);
                return true;
            }
            self.idx += ch.len_utf8();
        }

        sink.push_str(&self.value[save..self.idx]);
        true
    }

    /// Expect the rune at the cursor to be `quote`; scan to the matching
    /// unescaped `quote` and write the interior — backslashes preserved —
    /// into `sink`. A closing quote is one preceded by an even run of
    /// backslashes. The cursor lands past the closing quote. Fails (cursor
    /// untouched) when the first rune differs or the quote is unclosed.
    pub fn get_quoted(&mut self, quote: char, sink: &mut String) -> bool {
        if self.current() != Some(quote) {
            return false;
        }

        let start = self.idx + quote.len_utf8();
        let mut backslashes = 0usize;
        let mut pos = start;

        for ch in self.value[start..].chars() {
            if ch == quote && backslashes % 2 == 0 {
                sink.push_str(&self.value[start..pos]);
                self.idx = pos + quote.len_utf8();
                return true;
            }
            if ch == '\\' {
                backslashes += 1;
            } else {
                backslashes = 0;
            }
            pos += ch.len_utf8();
        }

        false
    }

    /// True at end-of-stream or on a NUL rune.
    pub fn eos(&self) -> bool {
        matches!(self.current(), None | Some('\0'))
    }

    /// Read consecutive ASCII digits as a non-negative integer. Fails
    /// without advancing when the cursor is not on a digit.
    pub fn get_digits(&mut self) -> Option<u64> {
        let save = self.idx;
        while matches!(self.current(), Some(ch) if ch.is_ascii_digit()) {
            self.idx += 1;
        }
        if self.idx == save {
            return None;
        }
        self.value[save..self.idx].parse().ok()
    }

    /// Read exactly `n` consecutive ASCII digits. Fails without advancing
    /// when fewer are available.
    pub fn get_n_digits(&mut self, n: usize) -> Option<u64> {
        let save = self.idx;
        for _ in 0..n {
            match self.current() {
                Some(ch) if ch.is_ascii_digit() => self.idx += 1,
                _ => {
                    self.idx = save;
                    return None;
                }
            }
        }
        self.value[save..self.idx].parse().ok()
    }

    /// Everything from the cursor to the end; the cursor lands at
    /// end-of-stream.
    pub fn get_remainder(&mut self) -> &'a str {
        let rest = &self.value[self.idx..];
        self.idx = self.value.len();
        rest
    }

    /// The rune at the cursor, without advancing.
    pub fn peek(&self) -> Option<char> {
        self.current()
    }

    pub fn cursor(&self) -> usize {
        self.idx
    }

    /// Rewind (or advance) the cursor to a saved position. Out-of-range
    /// values are ignored. Returns the resulting cursor.
    pub fn restore_to(&mut self, n: usize) -> usize {
        if n > 0 && n < self.value.len() {
            self.idx = n;
        }
        self.idx
    }
}
