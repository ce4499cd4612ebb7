//! Structured output section of a fuzzer-generated program run.
//!
//! Grammar, over the decoded stdout text:
//!
//! ```text
//! stdout   := <any text containing "timeout">            => Timeout
//!           | <text> "outputs" <text without '['> list <text>
//! list     := '[' ( item ( ',' item )* )? ']'
//! item     := integer | list
//! ```
//!
//! Whitespace is allowed around items. The first list after the sentinel is
//! the output section; its closing bracket is the balanced one.

use thiserror::Error;

/// Sentinel that precedes the output section.
pub const OUTPUT_SENTINEL: &str = "outputs";
/// Marker the runner prints when the program exceeded its own time budget.
pub const TIMEOUT_MARKER: &str = "timeout";

/// Output section parse failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputParseError {
    /// Stdout is not UTF-8.
    #[error("stdout is not valid UTF-8")]
    NotUtf8,
    /// No `outputs` sentinel.
    #[error("no `outputs` section in stdout")]
    MissingSentinel,
    /// No opening bracket after the sentinel.
    #[error("no list follows the `outputs` sentinel")]
    MissingList,
    /// Input ended before the list was closed.
    #[error("output list is not closed")]
    Unbalanced,
    /// Something other than an integer or list where an item was expected.
    #[error("unexpected {found:?} at offset {offset} in output list")]
    Unexpected {
        /// Offending text.
        found: String,
        /// Byte offset in stdout.
        offset: usize,
    },
}

/// One element of an output list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputValue {
    /// Integer element.
    Int(i64),
    /// Nested list.
    List(Vec<OutputValue>),
}

/// Parsed program output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramOutput {
    /// Comparable output values.
    Values(Vec<OutputValue>),
    /// The run reported a timeout; there is nothing to compare.
    Timeout,
}

/// Parse the output section from raw stdout.
pub fn parse_program_output(stdout: &[u8]) -> Result<ProgramOutput, OutputParseError> {
    let text = std::str::from_utf8(stdout).map_err(|_| OutputParseError::NotUtf8)?;
    if text.contains(TIMEOUT_MARKER) {
        return Ok(ProgramOutput::Timeout);
    }
    let sentinel = text
        .find(OUTPUT_SENTINEL)
        .ok_or(OutputParseError::MissingSentinel)?;
    let after = sentinel + OUTPUT_SENTINEL.len();
    let open = text[after..]
        .find('[')
        .map(|pos| after + pos)
        .ok_or(OutputParseError::MissingList)?;

    let mut parser = ListParser { text, pos: open };
    match parser.list()? {
        OutputValue::List(values) => Ok(ProgramOutput::Values(values)),
        OutputValue::Int(_) => Err(OutputParseError::MissingList),
    }
}

struct ListParser<'a> {
    text: &'a str,
    pos: usize,
}

impl ListParser<'_> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if !c.is_whitespace() {
                break;
            }
            self.pos += c.len_utf8();
        }
    }

    fn unexpected(&self) -> OutputParseError {
        match self.peek() {
            None => OutputParseError::Unbalanced,
            Some(c) => OutputParseError::Unexpected {
                found: c.to_string(),
                offset: self.pos,
            },
        }
    }

    fn list(&mut self) -> Result<OutputValue, OutputParseError> {
        // caller guarantees '['
        self.pos += 1;
        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(']') {
            self.pos += 1;
            return Ok(OutputValue::List(items));
        }
        loop {
            self.skip_whitespace();
            items.push(self.item()?);
            self.skip_whitespace();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(']') => {
                    self.pos += 1;
                    return Ok(OutputValue::List(items));
                }
                _ => return Err(self.unexpected()),
            }
        }
    }

    fn item(&mut self) -> Result<OutputValue, OutputParseError> {
        match self.peek() {
            Some('[') => self.list(),
            Some(c) if c == '-' || c == '+' || c.is_ascii_digit() => self.integer(),
            _ => Err(self.unexpected()),
        }
    }

    fn integer(&mut self) -> Result<OutputValue, OutputParseError> {
        let start = self.pos;
        if matches!(self.peek(), Some('-' | '+')) {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let literal = &self.text[start..self.pos];
        literal
            .parse::<i64>()
            .map(OutputValue::Int)
            .map_err(|_| OutputParseError::Unexpected {
                found: literal.to_string(),
                offset: start,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> ProgramOutput {
        ProgramOutput::Values(values.iter().copied().map(OutputValue::Int).collect())
    }

    #[test]
    fn parses_flat_output_list() {
        let stdout = b"Executing shader...\noutputs = [1, 2, 3]\ndone\n";
        assert_eq!(parse_program_output(stdout), Ok(ints(&[1, 2, 3])));
    }

    #[test]
    fn tolerates_text_between_sentinel_and_list() {
        let stdout = b"outputs: Buffer(0) { [4294967295, -7,0] } trailing ] bracket";
        assert_eq!(
            parse_program_output(stdout),
            Ok(ints(&[4_294_967_295, -7, 0]))
        );
    }

    #[test]
    fn nested_and_empty_lists() {
        assert_eq!(parse_program_output(b"outputs = []"), Ok(ints(&[])));
        assert_eq!(
            parse_program_output(b"outputs = [[1, 2], [3]]"),
            Ok(ProgramOutput::Values(vec![
                OutputValue::List(vec![OutputValue::Int(1), OutputValue::Int(2)]),
                OutputValue::List(vec![OutputValue::Int(3)]),
            ]))
        );
    }

    #[test]
    fn timeout_marker_wins() {
        assert_eq!(
            parse_program_output(b"outputs = [1]\ntimeout after 5s"),
            Ok(ProgramOutput::Timeout)
        );
    }

    #[test]
    fn explicit_failures_instead_of_truncation() {
        assert_eq!(
            parse_program_output(b"nothing here"),
            Err(OutputParseError::MissingSentinel)
        );
        assert_eq!(
            parse_program_output(b"outputs pending"),
            Err(OutputParseError::MissingList)
        );
        assert_eq!(
            parse_program_output(b"outputs = [1, 2"),
            Err(OutputParseError::Unbalanced)
        );
        assert!(matches!(
            parse_program_output(b"outputs = [1, x]"),
            Err(OutputParseError::Unexpected { .. })
        ));
        assert!(matches!(
            parse_program_output(b"outputs = [99999999999999999999]"),
            Err(OutputParseError::Unexpected { .. })
        ));
        assert_eq!(
            parse_program_output(&[0xff, 0xfe]),
            Err(OutputParseError::NotUtf8)
        );
    }
}
