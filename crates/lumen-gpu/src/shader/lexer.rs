//! Tokenizer for the shading-language subset the engine rewrites.
//!
//! Tokens borrow from the input and cover it completely, so concatenating
//! every token's text reproduces the source byte for byte. Comments and
//! string literals are single tokens and never match identifiers.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Number,
    Punct,
    Whitespace,
    Newline,
    Comment,
    StringLit,
    /// A whole preprocessor line starting with `#`, without its newline.
    Directive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
}

impl<'a> Token<'a> {
    pub fn is_trivia(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Whitespace | TokenKind::Newline | TokenKind::Comment
        )
    }

    pub fn is_punct(&self, c: &str) -> bool {
        self.kind == TokenKind::Punct && self.text == c
    }

    pub fn is_ident(&self, name: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == name
    }
}

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_continue(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

pub fn tokenize(source: &str) -> Vec<Token<'_>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;
    let mut line_start = true;

    while pos < bytes.len() {
        let start = pos;
        let c = bytes[pos];
        let kind = match c {
            b'\n' => {
                pos += 1;
                TokenKind::Newline
            }
            b'\r' if bytes.get(pos + 1) == Some(&b'\n') => {
                pos += 2;
                TokenKind::Newline
            }
            b' ' | b'\t' | b'\r' => {
                while pos < bytes.len() && matches!(bytes[pos], b' ' | b'\t' | b'\r') {
                    if bytes[pos] == b'\r' && bytes.get(pos + 1) == Some(&b'\n') {
                        break;
                    }
                    pos += 1;
                }
                TokenKind::Whitespace
            }
            b'#' if line_start => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
                if pos > start && bytes[pos - 1] == b'\r' {
                    pos -= 1;
                }
                TokenKind::Directive
            }
            b'/' if bytes.get(pos + 1) == Some(&b'/') => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
                TokenKind::Comment
            }
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                pos += 2;
                while pos < bytes.len() && !(bytes[pos] == b'*' && bytes.get(pos + 1) == Some(&b'/')) {
                    pos += 1;
                }
                pos = (pos + 2).min(bytes.len());
                TokenKind::Comment
            }
            b'"' => {
                pos += 1;
                while pos < bytes.len() && bytes[pos] != b'"' && bytes[pos] != b'\n' {
                    if bytes[pos] == b'\\' {
                        pos += 1;
                    }
                    pos += 1;
                }
                pos = (pos + 1).min(bytes.len());
                TokenKind::StringLit
            }
            c if is_ident_start(c) => {
                while pos < bytes.len() && is_ident_continue(bytes[pos]) {
                    pos += 1;
                }
                TokenKind::Ident
            }
            c if c.is_ascii_digit() || (c == b'.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) => {
                while pos < bytes.len() {
                    let b = bytes[pos];
                    let exponent_sign = (b == b'+' || b == b'-')
                        && matches!(bytes[pos - 1], b'e' | b'E')
                        && !source[start..pos].starts_with("0x");
                    if b.is_ascii_alphanumeric() || b == b'.' || exponent_sign {
                        pos += 1;
                    } else {
                        break;
                    }
                }
                TokenKind::Number
            }
            _ => {
                // One punctuation character, or a UTF-8 sequence kept intact.
                pos += 1;
                while pos < bytes.len() && !source.is_char_boundary(pos) {
                    pos += 1;
                }
                TokenKind::Punct
            }
        };

        line_start = match kind {
            TokenKind::Newline => true,
            TokenKind::Whitespace => line_start,
            TokenKind::Comment => line_start && !source[start..pos].starts_with("//"),
            _ => false,
        };
        tokens.push(Token {
            kind,
            text: &source[start..pos],
        });
    }

    tokens
}

/// Tokens without whitespace, newlines, or comments.
pub fn significant<'a>(tokens: &[Token<'a>]) -> Vec<Token<'a>> {
    tokens.iter().filter(|t| !t.is_trivia()).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<(TokenKind, &str)> {
        tokenize(source)
            .into_iter()
            .filter(|t| !t.is_trivia())
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn test_tokens_cover_input() {
        let source = "#version 330\r\nuniform vec4 color; // tint\n/* a\nb */ float x = 1.5e-3;\n";
        let joined: String = tokenize(source).iter().map(|t| t.text).collect();
        assert_eq!(joined, source);
    }

    #[test]
    fn test_directive_only_at_line_start() {
        let tokens = kinds("  #define A 1\nx # y\n");
        assert_eq!(tokens[0], (TokenKind::Directive, "#define A 1"));
        assert_eq!(tokens[1], (TokenKind::Ident, "x"));
        assert_eq!(tokens[2], (TokenKind::Punct, "#"));
    }

    #[test]
    fn test_comments_hide_identifiers() {
        let tokens = kinds("a /* color */ b // color\n\"color\"");
        assert_eq!(
            tokens,
            vec![
                (TokenKind::Ident, "a"),
                (TokenKind::Ident, "b"),
                (TokenKind::StringLit, "\"color\""),
            ]
        );
        let all = tokenize("a /* color */ b");
        assert!(all.iter().any(|t| t.kind == TokenKind::Comment && t.text == "/* color */"));
    }

    #[test]
    fn test_numbers() {
        let tokens = kinds("1.0 .5 2e+3 0x1F 7u");
        let numbers: Vec<&str> = tokens.iter().map(|t| t.1).collect();
        assert_eq!(numbers, vec!["1.0", ".5", "2e+3", "0x1F", "7u"]);
        assert!(tokens.iter().all(|t| t.0 == TokenKind::Number));
    }

    #[test]
    fn test_member_access_is_punct() {
        let tokens = kinds("light.color");
        assert_eq!(tokens[1], (TokenKind::Punct, "."));
        assert_eq!(tokens[2], (TokenKind::Ident, "color"));
    }
}
