//! Tokenizer for the subset of shell syntax used by grub configuration
//! files.
//!
//! The kernel-argument rewriter edits a single identified line and does
//! not need a parse; this tokenizer exists for deeper analyses of grub
//! configs and stays a separate component. Every token carries its exact
//! source bytes, so concatenating `raw_content` over a token stream
//! reproduces the input.

pub mod scanner;

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use scanner::{FileScanner, SourceLoc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LBrace,
    RBrace,
    Bar,
    And,
    Semicolon,
    Lt,
    Gt,
    Space,
    Newline,
    Word,
    Comment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubWordKind {
    /// The leading unquoted part of a word; what a grub keyword looks like.
    KeywordString,
    /// Any other literal text, quoted or not.
    String,
    /// `$NAME` or `${NAME}` outside quotes.
    VarExpansion,
    /// `$NAME` or `${NAME}` inside a double-quoted string.
    QuotedVarExpansion,
}

/// Start and end positions of a token or sub-word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: SourceLoc,
    pub end: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub span: Span,
    pub kind: TokenKind,
    /// The token exactly as it appears in the grub file.
    pub raw_content: String,
    /// When `kind` is `Word`, the sub-words making up the word.
    pub sub_words: Vec<SubWord>,
}

#[derive(Debug, Clone)]
pub struct SubWord {
    pub span: Span,
    pub kind: SubWordKind,
    /// The sub-word exactly as it appears in the grub file.
    pub raw_content: String,
    /// The sub-word with quoting and escapes resolved; for expansions,
    /// the variable name.
    pub value: String,
}

pub fn tokenize_grub_config_file(path: &Path) -> Result<Vec<Token>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read grub config file ({})", path.display()))?;
    tokenize_grub_config(&content)
}

pub fn tokenize_grub_config(content: &str) -> Result<Vec<Token>> {
    let mut tokenizer = GrubConfigTokenizer {
        scanner: FileScanner::new(content),
        tokens: Vec::new(),
        sub_words: Vec::new(),
    };

    tokenizer
        .tokenize()
        .context("failed to tokenize grub config")?;

    Ok(tokenizer.tokens)
}

struct GrubConfigTokenizer<'a> {
    scanner: FileScanner<'a>,
    tokens: Vec<Token>,
    sub_words: Vec<SubWord>,
}

impl GrubConfigTokenizer<'_> {
    fn tokenize(&mut self) -> Result<()> {
        while let Some(c) = self.scanner.peek() {
            match c {
                // Metacharacters
                '{' | '}' | '|' | '&' | ';' | '<' | '>' | '\n' => {
                    let loc_start = self.scanner.loc();
                    self.scanner.next();

                    let kind = match c {
                        '{' => TokenKind::LBrace,
                        '}' => TokenKind::RBrace,
                        '|' => TokenKind::Bar,
                        '&' => TokenKind::And,
                        ';' => TokenKind::Semicolon,
                        '<' => TokenKind::Lt,
                        '>' => TokenKind::Gt,
                        _ => TokenKind::Newline,
                    };

                    let token = self.new_token(loc_start, kind);
                    self.tokens.push(token);
                }

                ' ' | '\t' => self.parse_space(),

                _ => self.parse_word()?,
            }
        }

        Ok(())
    }

    fn parse_word(&mut self) -> Result<()> {
        let loc_start = self.scanner.loc();

        // A '#' only starts a comment at the start of a word; a '#' in the
        // middle of a word is a literal character.
        if self.scanner.peek() == Some('#') {
            self.parse_comment();
            return Ok(());
        }

        self.sub_words.clear();
        let mut not_first = false;
        while let Some(c) = self.scanner.peek() {
            match c {
                // Metacharacters and spaces end the word.
                '{' | '}' | '|' | '&' | ';' | '<' | '>' | '\n' | ' ' | '\t' => break,

                '"' => self.parse_double_quoted_string()?,

                '\'' => self.parse_single_quoted_string()?,

                '$' => self.parse_variable_expansion(SubWordKind::VarExpansion)?,

                _ => self.parse_unquoted_string(not_first),
            }

            not_first = true;
        }

        let mut token = self.new_token(loc_start, TokenKind::Word);
        token.sub_words = std::mem::take(&mut self.sub_words);
        self.tokens.push(token);
        Ok(())
    }

    fn parse_space(&mut self) {
        let loc_start = self.scanner.loc();

        while let Some(c) = self.scanner.peek() {
            match c {
                ' ' | '\t' => {
                    self.scanner.next();
                }
                _ => break,
            }
        }

        let token = self.new_token(loc_start, TokenKind::Space);
        self.tokens.push(token);
    }

    fn parse_comment(&mut self) {
        let loc_start = self.scanner.loc();

        // Consume the '#' char.
        self.scanner.next();

        while let Some(c) = self.scanner.peek() {
            if c == '\n' {
                break;
            }
            self.scanner.next();
        }

        let token = self.new_token(loc_start, TokenKind::Comment);
        self.tokens.push(token);
    }

    fn parse_unquoted_string(&mut self, mut not_first: bool) {
        let mut loc_start = self.scanner.loc();
        let mut value = String::new();

        while let Some(c) = self.scanner.peek() {
            match c {
                '{' | '}' | '|' | '&' | ';' | '<' | '>' | ' ' | '\t' | '\n' | '"' | '\''
                | '$' => break,

                // Escape character
                '\\' => {
                    if !not_first {
                        not_first = true;

                        // Close out what was seen so far as the keyword part.
                        let loc_end = self.scanner.loc();
                        if loc_end.index != loc_start.index {
                            let sub_word = self.new_sub_word(
                                loc_start,
                                loc_end,
                                SubWordKind::KeywordString,
                                value.clone(),
                            );
                            self.sub_words.push(sub_word);
                        }

                        loc_start = self.scanner.loc();
                        value.clear();
                    }

                    // Consume the \ char.
                    self.scanner.next();

                    match self.scanner.peek() {
                        None => {
                            value.push('\\');
                            break;
                        }
                        Some('\n') => {
                            // Drop the escaped newline character.
                            self.scanner.next();
                        }
                        Some(escaped) => {
                            value.push(escaped);
                            self.scanner.next();
                        }
                    }
                }

                // Normal character
                _ => {
                    value.push(c);
                    self.scanner.next();
                }
            }
        }

        let kind = if not_first {
            SubWordKind::String
        } else {
            SubWordKind::KeywordString
        };

        let loc_end = self.scanner.loc();
        let sub_word = self.new_sub_word(loc_start, loc_end, kind, value);
        self.sub_words.push(sub_word);
    }

    fn parse_double_quoted_string(&mut self) -> Result<()> {
        let mut loc_start = self.scanner.loc();

        // Consume the " char.
        self.scanner.next();

        let mut value = String::new();
        loop {
            let Some(c) = self.scanner.peek() else {
                bail!(
                    "unexpected end-of-file during double-quoted string ({}:{})",
                    self.scanner.line(),
                    self.scanner.col()
                );
            };

            match c {
                // End of string
                '"' => {
                    self.scanner.next();
                    break;
                }

                // Escape character
                '\\' => {
                    self.scanner.next();

                    let Some(escaped) = self.scanner.peek() else {
                        bail!(
                            "unexpected end-of-file after '\\' character ({}:{})",
                            self.scanner.line(),
                            self.scanner.col()
                        );
                    };

                    match escaped {
                        // Within double-quoted strings, only some characters
                        // are valid escape sequences.
                        '$' | '"' | '\\' => value.push(escaped),

                        // Drop the escaped newline.
                        '\n' => {}

                        // Invalid escape sequences preserve the '\' character.
                        _ => {
                            value.push('\\');
                            value.push(escaped);
                        }
                    }

                    self.scanner.next();
                }

                // Variable expansion
                '$' => {
                    // Close out the current string sub-word.
                    let loc_end = self.scanner.loc();
                    if loc_end.index != loc_start.index {
                        let sub_word = self.new_sub_word(
                            loc_start,
                            loc_end,
                            SubWordKind::String,
                            value.clone(),
                        );
                        self.sub_words.push(sub_word);
                    }

                    self.parse_variable_expansion(SubWordKind::QuotedVarExpansion)?;

                    // Restart parsing the double-quoted string.
                    loc_start = self.scanner.loc();
                    value.clear();
                }

                // Normal character
                _ => {
                    value.push(c);
                    self.scanner.next();
                }
            }
        }

        let loc_end = self.scanner.loc();
        let sub_word = self.new_sub_word(loc_start, loc_end, SubWordKind::String, value);
        self.sub_words.push(sub_word);
        Ok(())
    }

    fn parse_single_quoted_string(&mut self) -> Result<()> {
        let loc_start = self.scanner.loc();

        // Consume the ' char.
        self.scanner.next();

        let mut value = String::new();
        loop {
            let Some(c) = self.scanner.peek() else {
                bail!(
                    "unexpected end-of-file during single-quoted string ({}:{})",
                    self.scanner.line(),
                    self.scanner.col()
                );
            };

            match c {
                // End of string
                '\'' => {
                    self.scanner.next();
                    break;
                }

                // No escapes inside single quotes.
                _ => {
                    value.push(c);
                    self.scanner.next();
                }
            }
        }

        let loc_end = self.scanner.loc();
        let sub_word = self.new_sub_word(loc_start, loc_end, SubWordKind::String, value);
        self.sub_words.push(sub_word);
        Ok(())
    }

    fn parse_variable_expansion(&mut self, kind: SubWordKind) -> Result<()> {
        let loc_start = self.scanner.loc();

        // Consume the $ char.
        self.scanner.next();

        // Check if the name is surrounded by braces.
        let mut uses_braces = false;
        if self.scanner.peek() == Some('{') {
            uses_braces = true;
            self.scanner.next();
        }

        let mut name = String::new();
        while let Some(c) = self.scanner.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                self.scanner.next();
            } else {
                break;
            }
        }

        if uses_braces {
            let Some(c) = self.scanner.peek() else {
                bail!(
                    "unexpected end-of-file while parsing variable expansion ({}:{})",
                    self.scanner.line(),
                    self.scanner.col()
                );
            };

            match c {
                '}' => {
                    self.scanner.next();
                }
                _ => bail!(
                    "missing }} in variable expansion ({}:{})",
                    self.scanner.line(),
                    self.scanner.col()
                ),
            }

            if name.is_empty() {
                bail!(
                    "variable expansion missing name ({}:{})",
                    loc_start.line,
                    loc_start.col
                );
            }
        } else if name.is_empty() {
            // The name is invalid, so '$' is interpreted as a normal character.
            let loc_end = self.scanner.loc();
            let sub_word = self.new_sub_word(
                loc_start,
                loc_end,
                SubWordKind::String,
                "$".to_string(),
            );
            self.sub_words.push(sub_word);
            return Ok(());
        }

        let loc_end = self.scanner.loc();
        let sub_word = self.new_sub_word(loc_start, loc_end, kind, name);
        self.sub_words.push(sub_word);
        Ok(())
    }

    fn new_token(&mut self, loc_start: SourceLoc, kind: TokenKind) -> Token {
        let loc_end = self.scanner.loc();
        let raw_content = self.scanner.content()[loc_start.index..loc_end.index].to_string();

        Token {
            span: Span {
                start: loc_start,
                end: loc_end,
            },
            kind,
            raw_content,
            sub_words: Vec::new(),
        }
    }

    fn new_sub_word(
        &mut self,
        loc_start: SourceLoc,
        loc_end: SourceLoc,
        kind: SubWordKind,
        value: String,
    ) -> SubWord {
        let raw_content = self.scanner.content()[loc_start.index..loc_end.index].to_string();

        SubWord {
            span: Span {
                start: loc_start,
                end: loc_end,
            },
            kind,
            raw_content,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reconstruct(tokens: &[Token]) -> String {
        tokens.iter().map(|t| t.raw_content.as_str()).collect()
    }

    #[test]
    fn test_simple_command() {
        let input = "set default=\"0\"\n";
        let tokens = tokenize_grub_config(input).unwrap();

        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Word,
                TokenKind::Space,
                TokenKind::Word,
                TokenKind::Newline
            ]
        );

        let default_word = &tokens[2];
        assert_eq!(default_word.raw_content, "default=\"0\"");
        assert_eq!(default_word.sub_words.len(), 2);
        assert_eq!(default_word.sub_words[0].kind, SubWordKind::KeywordString);
        assert_eq!(default_word.sub_words[0].value, "default=");
        assert_eq!(default_word.sub_words[1].kind, SubWordKind::String);
        assert_eq!(default_word.sub_words[1].value, "0");

        assert_eq!(reconstruct(&tokens), input);
    }

    #[test]
    fn test_variable_expansion_word() {
        let tokens = tokenize_grub_config("linux /boot/vmlinuz $kernelopts\n").unwrap();

        let kernelopts = &tokens[4];
        assert_eq!(kernelopts.kind, TokenKind::Word);
        assert_eq!(kernelopts.sub_words.len(), 1);
        assert_eq!(kernelopts.sub_words[0].kind, SubWordKind::VarExpansion);
        assert_eq!(kernelopts.sub_words[0].value, "kernelopts");
        assert_eq!(kernelopts.sub_words[0].raw_content, "$kernelopts");
    }

    #[test]
    fn test_braced_variable_expansion() {
        let tokens = tokenize_grub_config("${prefix_1}/grubenv").unwrap();

        assert_eq!(tokens.len(), 1);
        let word = &tokens[0];
        assert_eq!(word.sub_words[0].kind, SubWordKind::VarExpansion);
        assert_eq!(word.sub_words[0].value, "prefix_1");
        assert_eq!(word.sub_words[1].kind, SubWordKind::String);
        assert_eq!(word.sub_words[1].value, "/grubenv");
    }

    #[test]
    fn test_quoted_variable_expansion() {
        let tokens = tokenize_grub_config("\"root=$bootuuid ro\"").unwrap();

        let word = &tokens[0];
        assert_eq!(word.sub_words.len(), 3);
        assert_eq!(word.sub_words[0].kind, SubWordKind::String);
        assert_eq!(word.sub_words[0].value, "root=");
        assert_eq!(word.sub_words[1].kind, SubWordKind::QuotedVarExpansion);
        assert_eq!(word.sub_words[1].value, "bootuuid");
        assert_eq!(word.sub_words[2].kind, SubWordKind::String);
        assert_eq!(word.sub_words[2].value, " ro");
    }

    #[test]
    fn test_double_quote_escapes() {
        let tokens = tokenize_grub_config(r#""a\$b\"c\\d\xe""#).unwrap();

        let word = &tokens[0];
        assert_eq!(word.sub_words.len(), 1);
        // Valid escapes resolve; invalid ones keep the backslash.
        assert_eq!(word.sub_words[0].value, r#"a$b"c\d\xe"#);
    }

    #[test]
    fn test_single_quotes_are_literal() {
        let tokens = tokenize_grub_config(r"'a\$b'").unwrap();

        let word = &tokens[0];
        assert_eq!(word.sub_words[0].kind, SubWordKind::String);
        assert_eq!(word.sub_words[0].value, r"a\$b");
    }

    #[test]
    fn test_lone_dollar_is_literal() {
        let tokens = tokenize_grub_config("a$ b").unwrap();

        let word = &tokens[0];
        assert_eq!(word.sub_words.len(), 2);
        assert_eq!(word.sub_words[1].kind, SubWordKind::String);
        assert_eq!(word.sub_words[1].value, "$");
    }

    #[test]
    fn test_comment_only_at_word_start() {
        let tokens = tokenize_grub_config("# a comment\nfoo#bar\n").unwrap();

        assert_eq!(tokens[0].kind, TokenKind::Comment);
        assert_eq!(tokens[0].raw_content, "# a comment");

        let word = &tokens[2];
        assert_eq!(word.kind, TokenKind::Word);
        assert_eq!(word.sub_words[0].value, "foo#bar");
    }

    #[test]
    fn test_metacharacters() {
        let tokens = tokenize_grub_config("menuentry {\n} | & ; < >").unwrap();

        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Word,
                TokenKind::Space,
                TokenKind::LBrace,
                TokenKind::Newline,
                TokenKind::RBrace,
                TokenKind::Space,
                TokenKind::Bar,
                TokenKind::Space,
                TokenKind::And,
                TokenKind::Space,
                TokenKind::Semicolon,
                TokenKind::Space,
                TokenKind::Lt,
                TokenKind::Space,
                TokenKind::Gt
            ]
        );
    }

    #[test]
    fn test_escaped_newline_continues_word() {
        let tokens = tokenize_grub_config("ab\\\ncd efg").unwrap();

        let word = &tokens[0];
        assert_eq!(word.kind, TokenKind::Word);
        assert_eq!(word.raw_content, "ab\\\ncd");
        let value: String = word.sub_words.iter().map(|s| s.value.as_str()).collect();
        assert_eq!(value, "abcd");
    }

    #[test]
    fn test_eof_in_double_quoted_string_is_an_error() {
        let err = tokenize_grub_config("\"abc").unwrap_err();
        assert!(format!("{err:#}").contains("end-of-file during double-quoted string"));
    }

    #[test]
    fn test_eof_in_single_quoted_string_is_an_error() {
        let err = tokenize_grub_config("'abc").unwrap_err();
        assert!(format!("{err:#}").contains("end-of-file during single-quoted string"));
    }

    #[test]
    fn test_unclosed_braced_expansion_is_an_error() {
        let err = tokenize_grub_config("${foo").unwrap_err();
        assert!(format!("{err:#}").contains("end-of-file while parsing variable expansion"));
    }

    #[test]
    fn test_braced_expansion_missing_name_is_an_error() {
        let err = tokenize_grub_config("${}").unwrap_err();
        assert!(format!("{err:#}").contains("variable expansion missing name"));
    }

    #[test]
    fn test_error_location_points_at_offending_line() {
        let err = tokenize_grub_config("set a=1\n\"abc").unwrap_err();
        assert!(format!("{err:#}").contains("(2:5)"));
    }

    #[test]
    fn test_raw_content_reconstructs_input() {
        let input = concat!(
            "# GRUB boot menu\n",
            "set timeout=5\n",
            "search -n -u 1a2b3c4d -s\n",
            "menuentry 'My OS' {\n",
            "\tlinux /boot/vmlinuz console=tty0 \"$kernelopts\" rd.info\n",
            "\tinitrd ${prefix}/initrd.img\n",
            "}\n"
        );

        let tokens = tokenize_grub_config(input).unwrap();
        assert_eq!(reconstruct(&tokens), input);
    }
}
