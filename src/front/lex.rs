//! The lexer.

use derive_more::Display;
use regex::Regex;

/// Tokens in the program
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    pub kind: TokenKind,
    /// What part of the input this token carries.
    pub text: &'src str,
    /// 1-based source line the token starts on.
    pub line: u32,
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
pub enum TokenKind {
    #[display("id")]
    Id,
    #[display("num")]
    Num,
    #[display("hexnum")]
    HexNum,
    #[display("char")]
    CharLit,
    #[display("str")]
    Str,
    #[display("fn")]
    Fn,
    #[display("priv")]
    Priv,
    #[display("inline")]
    Inline,
    #[display("let")]
    Let,
    #[display("mut")]
    Mut,
    #[display("if")]
    If,
    #[display("else")]
    Else,
    #[display("while")]
    While,
    #[display("do")]
    Do,
    #[display("switch")]
    Switch,
    #[display("case")]
    Case,
    #[display("default")]
    Default,
    #[display("return")]
    Return,
    #[display("global")]
    Global,
    #[display("struct")]
    Struct,
    #[display("enum")]
    Enum,
    #[display("defer")]
    Defer,
    #[display("asm")]
    Asm,
    #[display("as")]
    As,
    #[display("->")]
    Arrow,
    #[display("==")]
    EqEq,
    #[display("!=")]
    NotEq,
    #[display("<=")]
    LtEq,
    #[display(">=")]
    GtEq,
    #[display("<<")]
    Shl,
    #[display(">>")]
    Shr,
    #[display("&&")]
    AndAnd,
    #[display("||")]
    OrOr,
    #[display("=")]
    Assign,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("/")]
    Slash,
    #[display("%")]
    Percent,
    #[display("&")]
    Amp,
    #[display("|")]
    Pipe,
    #[display("^")]
    Caret,
    #[display("~")]
    Tilde,
    #[display("!")]
    Bang,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display("[")]
    LBracket,
    #[display("]")]
    RBracket,
    #[display(";")]
    Semi,
    #[display(":")]
    Colon,
    #[display(",")]
    Comma,
    #[display(".")]
    Dot,
}

pub struct LexError(pub u32, pub char);

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Lexer error: unexpected character {:?} at line {}",
            self.1, self.0
        )
    }
}

impl std::fmt::Debug for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    line: u32,
    whitespace: Regex,
    matchers: Vec<(Regex, TokenKind)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        use TokenKind::*;
        let rule = |pattern: &str, kind: TokenKind| (Regex::new(pattern).unwrap(), kind);
        Lexer {
            input,
            pos: 0,
            line: 1,
            whitespace: Regex::new(r"\A(?:[ \t\f\r\n\v]|(?://.*))*").unwrap(),
            // Ordered: keywords before identifiers, long operators before
            // their prefixes.
            matchers: vec![
                rule(r"\Afn\b", Fn),
                rule(r"\Apriv\b", Priv),
                rule(r"\Ainline\b", Inline),
                rule(r"\Alet\b", Let),
                rule(r"\Amut\b", Mut),
                rule(r"\Aif\b", If),
                rule(r"\Aelse\b", Else),
                rule(r"\Awhile\b", While),
                rule(r"\Ado\b", Do),
                rule(r"\Aswitch\b", Switch),
                rule(r"\Acase\b", Case),
                rule(r"\Adefault\b", Default),
                rule(r"\Areturn\b", Return),
                rule(r"\Aglobal\b", Global),
                rule(r"\Astruct\b", Struct),
                rule(r"\Aenum\b", Enum),
                rule(r"\Adefer\b", Defer),
                rule(r"\Aasm\b", Asm),
                rule(r"\Aas\b", As),
                rule(r"\A0[xX][0-9a-fA-F]+", HexNum),
                rule(r"\A[0-9]+", Num),
                rule(r"\A'(?:[^'\\]|\\.)'", CharLit),
                rule(r#"\A"(?:[^"\\]|\\.)*""#, Str),
                rule(r"\A[A-Za-z_][A-Za-z0-9_]*", Id),
                rule(r"\A->", Arrow),
                rule(r"\A==", EqEq),
                rule(r"\A!=", NotEq),
                rule(r"\A<=", LtEq),
                rule(r"\A>=", GtEq),
                rule(r"\A<<", Shl),
                rule(r"\A>>", Shr),
                rule(r"\A&&", AndAnd),
                rule(r"\A\|\|", OrOr),
                rule(r"\A=", Assign),
                rule(r"\A<", Lt),
                rule(r"\A>", Gt),
                rule(r"\A\+", Plus),
                rule(r"\A-", Minus),
                rule(r"\A\*", Star),
                rule(r"\A/", Slash),
                rule(r"\A%", Percent),
                rule(r"\A&", Amp),
                rule(r"\A\|", Pipe),
                rule(r"\A\^", Caret),
                rule(r"\A~", Tilde),
                rule(r"\A!", Bang),
                rule(r"\A\(", LParen),
                rule(r"\A\)", RParen),
                rule(r"\A\{", LBrace),
                rule(r"\A\}", RBrace),
                rule(r"\A\[", LBracket),
                rule(r"\A\]", RBracket),
                rule(r"\A;", Semi),
                rule(r"\A:", Colon),
                rule(r"\A,", Comma),
                rule(r"\A\.", Dot),
            ],
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    // Skip comments and whitespace
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.line += self.input[self.pos..self.pos + m.end()]
                .bytes()
                .filter(|b| *b == b'\n')
                .count() as u32;
            self.pos += m.end()
        }
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, LexError> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }
        let rest = &self.input[self.pos..];
        for (regex, kind) in &self.matchers {
            if let Some(m) = regex.find(rest) {
                let token = Token {
                    kind: *kind,
                    text: &rest[..m.end()],
                    line: self.line,
                };
                self.pos += m.end();
                return Ok(Some(token));
            }
        }
        Err(LexError(self.line, rest.chars().next().unwrap()))
    }

    /// Lex the whole input up front.
    pub fn tokenize(mut self) -> Result<Vec<Token<'input>>, LexError> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next()? {
            tokens.push(token);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn keywords_beat_identifiers() {
        use TokenKind::*;
        assert_eq!(kinds("fn fnord"), vec![Fn, Id]);
        assert_eq!(kinds("return returns"), vec![Return, Id]);
    }

    #[test]
    fn long_operators_beat_prefixes() {
        use TokenKind::*;
        assert_eq!(kinds("<< < <= ="), vec![Shl, Lt, LtEq, Assign]);
        assert_eq!(kinds("a->b"), vec![Id, Arrow, Id]);
    }

    #[test]
    fn numbers_and_hex() {
        use TokenKind::*;
        assert_eq!(kinds("12 0x1f 'a'"), vec![Num, HexNum, CharLit]);
    }

    #[test]
    fn comments_and_lines() {
        let tokens = Lexer::new("a // comment\nb").tokenize().unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn error_reports_the_offending_char() {
        let err = Lexer::new("a ` b").tokenize().unwrap_err();
        assert_eq!(err.1, '`');
    }
}
