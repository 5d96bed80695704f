//! Whitespace-token scanner for filter-argument files.
//!
//! Grammar: tokens are separated by whitespace; `#` starts a line
//! comment; backslash escapes `\n \v \t \r \# \\` and `\ ` (space) are
//! recognized inside tokens; a token longer than [`MAX_TOKEN`] bytes is
//! an error. Errors carry the source name and line number so they print
//! as `<source>:<line>: <message>`.

use std::io::BufRead;

use crate::error::ScanError;

/// Maximum token length, in bytes.
pub const MAX_TOKEN: usize = 256;

pub struct Scanner<R> {
    reader: R,
    name: String,
    line: u32,
    in_comment: bool,
    done: bool,
}

impl<R: BufRead> Scanner<R> {
    pub fn new(name: impl Into<String>, reader: R) -> Self {
        Scanner {
            reader,
            name: name.into(),
            line: 1,
            in_comment: false,
            done: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current line number (1-based).
    pub fn line(&self) -> u32 {
        self.line
    }

    fn read_byte(&mut self) -> Result<Option<u8>, ScanError> {
        let mut byte = [0u8; 1];
        loop {
            return match self.reader.read(&mut byte) {
                Ok(0) => Ok(None),
                Ok(_) => Ok(Some(byte[0])),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => Err(ScanError::Io {
                    name: self.name.clone(),
                    line: self.line,
                    source: e,
                }),
            };
        }
    }

    /// Produce the next token, or `None` at end of input.
    pub fn next_token(&mut self) -> Result<Option<String>, ScanError> {
        if self.done {
            return Ok(None);
        }
        let mut token: Vec<u8> = Vec::new();

        loop {
            let Some(byte) = self.read_byte()? else {
                self.done = true;
                break;
            };
            if byte == b'\n' {
                self.line += 1;
                self.in_comment = false;
                if !token.is_empty() {
                    break;
                }
                continue;
            }
            if self.in_comment {
                continue;
            }
            if byte == b'#' {
                self.in_comment = true;
                if !token.is_empty() {
                    break;
                }
                continue;
            }
            if byte.is_ascii_whitespace() {
                if !token.is_empty() {
                    break;
                }
                continue;
            }
            let out = if byte == b'\\' {
                let Some(esc) = self.read_byte()? else {
                    return Err(ScanError::BadEscape {
                        name: self.name.clone(),
                        line: self.line,
                        escape: '\\',
                    });
                };
                match esc {
                    b'n' => b'\n',
                    b'v' => 0x0b,
                    b't' => b'\t',
                    b'r' => b'\r',
                    b'#' => b'#',
                    b'\\' => b'\\',
                    b' ' => b' ',
                    other => {
                        return Err(ScanError::BadEscape {
                            name: self.name.clone(),
                            line: self.line,
                            escape: char::from(other),
                        })
                    }
                }
            } else {
                byte
            };
            if token.len() >= MAX_TOKEN {
                return Err(ScanError::TokenTooLong {
                    name: self.name.clone(),
                    line: self.line,
                    max: MAX_TOKEN,
                });
            }
            token.push(out);
        }

        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&token).into_owned()))
    }

    /// Collect every remaining token.
    pub fn tokens(mut self) -> Result<Vec<String>, ScanError> {
        let mut out = Vec::new();
        while let Some(tok) = self.next_token()? {
            out.push(tok);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn scan(input: &str) -> Vec<String> {
        Scanner::new("test", Cursor::new(input.as_bytes()))
            .tokens()
            .unwrap()
    }

    #[test]
    fn test_whitespace_separation() {
        assert_eq!(scan("a b\tc\nd"), vec!["a", "b", "c", "d"]);
        assert_eq!(scan("  leading   trailing  "), vec!["leading", "trailing"]);
        assert!(scan("").is_empty());
    }

    #[test]
    fn test_comments() {
        assert_eq!(scan("one # rest is gone\ntwo"), vec!["one", "two"]);
        assert_eq!(scan("# whole line\nx"), vec!["x"]);
        assert_eq!(scan("glued#comment\nnext"), vec!["glued", "next"]);
    }

    #[test]
    fn test_escapes() {
        assert_eq!(scan(r"a\ b"), vec!["a b"]);
        assert_eq!(scan(r"x\#y"), vec!["x#y"]);
        assert_eq!(scan(r"back\\slash"), vec![r"back\slash"]);
        assert_eq!(scan(r"tab\there"), vec!["tab\there"]);
    }

    #[test]
    fn test_bad_escape() {
        let err = Scanner::new("f", Cursor::new(br"bad\q".as_slice()))
            .tokens()
            .unwrap_err();
        assert!(err.to_string().starts_with("f:1:"));
    }

    #[test]
    fn test_line_numbers_in_errors() {
        let input = "ok\nok\n\\q";
        let err = Scanner::new("list.txt", Cursor::new(input.as_bytes()))
            .tokens()
            .unwrap_err();
        assert!(err.to_string().starts_with("list.txt:3:"), "{err}");
    }

    #[test]
    fn test_token_too_long() {
        let input = "a".repeat(MAX_TOKEN + 1);
        let err = Scanner::new("f", Cursor::new(input.into_bytes()))
            .tokens()
            .unwrap_err();
        assert!(matches!(err, ScanError::TokenTooLong { max, .. } if max == MAX_TOKEN));
    }

    #[test]
    fn test_max_length_token_accepted() {
        let input = "b".repeat(MAX_TOKEN);
        let toks = scan(&input);
        assert_eq!(toks.len(), 1);
        assert_eq!(toks[0].len(), MAX_TOKEN);
    }
}
