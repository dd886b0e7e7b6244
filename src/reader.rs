use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token
{
    Eof,
    Number(f64),
    Str(String),
    Name(String),
    RefName(String),
    True,
    False,
    Nil,
    DefStart,   // :
    DefEnd,     // ;
    ArrayStart, // [
    ArrayEnd,   // ]
    HashStart,  // {
    HashEnd,    // }
    Comma,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenInfo
{
    pub token: Token,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Token
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            Token::Eof => write!(f, "end of input"),
            Token::Number(n) => write!(f, "number {}", n),
            Token::Str(s) => write!(f, "string \"{}\"", s),
            Token::Name(n) => write!(f, "name '{}'", n),
            Token::RefName(n) => write!(f, "ref-name '@{}'", n),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Nil => write!(f, "nil"),
            Token::DefStart => write!(f, "':'"),
            Token::DefEnd => write!(f, "';'"),
            Token::ArrayStart => write!(f, "'['"),
            Token::ArrayEnd => write!(f, "']'"),
            Token::HashStart => write!(f, "'{{'"),
            Token::HashEnd => write!(f, "'}}'"),
            Token::Comma => write!(f, "','"),
            Token::Error(msg) => write!(f, "{}", msg),
        }
    }
}

/// Single-cursor lexer over a byte range. Produces one token per call and
/// keeps the last token around so callers can re-examine it after a nested
/// compile returns.
pub struct Reader<'a>
{
    input: &'a [u8],
    position: usize,
    line: u32,
    column: u32,
    last: Option<TokenInfo>,
}

fn is_name_start(byte: u8) -> bool
{
    byte.is_ascii_alphabetic() || matches!(byte, b'_' | b'$' | b'+' | b'<' | b'>' | b'=' | b'?' | b'.' | b'*' | b'%' | b'!')
}

fn is_name_char(byte: u8) -> bool
{
    is_name_start(byte) || byte.is_ascii_digit() || byte == b'-'
}

impl<'a> Reader<'a>
{
    pub fn new(source: &'a str) -> Self
    {
        Self {
            input: source.as_bytes(),
            position: 0,
            line: 1,
            column: 1,
            last: None,
        }
    }

    pub fn last(&self) -> Option<&TokenInfo>
    {
        self.last.as_ref()
    }

    pub fn next_token(&mut self) -> TokenInfo
    {
        let info = self.scan();
        self.last = Some(info.clone());
        info
    }

    fn scan(&mut self) -> TokenInfo
    {
        self.skip_whitespace_and_comments();

        let line = self.line;
        let column = self.column;
        let make = |token| TokenInfo { token, line, column };

        let byte = match self.current()
        {
            Some(b) => b,
            None => return make(Token::Eof),
        };

        match byte
        {
            b'"' => make(self.read_string()),
            b'\'' => make(self.read_char_literal()),
            b'@' => make(self.read_ref_name()),
            b':' =>
            {
                self.advance();
                make(Token::DefStart)
            }
            b';' =>
            {
                self.advance();
                make(Token::DefEnd)
            }
            b'[' =>
            {
                self.advance();
                make(Token::ArrayStart)
            }
            b']' =>
            {
                self.advance();
                make(Token::ArrayEnd)
            }
            b'{' =>
            {
                self.advance();
                make(Token::HashStart)
            }
            b'}' =>
            {
                self.advance();
                make(Token::HashEnd)
            }
            b',' =>
            {
                self.advance();
                make(Token::Comma)
            }
            b'-' =>
            {
                if self.peek().is_some_and(|b| b.is_ascii_digit())
                {
                    make(self.read_number())
                }
                else
                {
                    make(self.read_name())
                }
            }
            b if b.is_ascii_digit() =>
            {
                // A digit immediately followed by a letter reads as a name,
                // so 2dup is a word and not a number.
                if self.peek().is_some_and(|b| b.is_ascii_alphabetic())
                {
                    make(self.read_name())
                }
                else
                {
                    make(self.read_number())
                }
            }
            b if is_name_start(b) => make(self.read_name()),
            other =>
            {
                self.advance();
                make(Token::Error(format!("Parse error at '{}'", other as char)))
            }
        }
    }

    fn current(&self) -> Option<u8>
    {
        self.input.get(self.position).copied()
    }

    fn peek(&self) -> Option<u8>
    {
        self.input.get(self.position + 1).copied()
    }

    fn advance(&mut self)
    {
        if let Some(byte) = self.current()
        {
            if byte == b'\n'
            {
                self.line += 1;
                self.column = 1;
            }
            else
            {
                self.column += 1;
            }
            self.position += 1;
        }
    }

    fn skip_whitespace_and_comments(&mut self)
    {
        loop
        {
            match self.current()
            {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => self.advance(),
                Some(b'#') =>
                {
                    while self.current().is_some_and(|b| b != b'\n')
                    {
                        self.advance();
                    }
                }
                Some(b'(') =>
                {
                    while self.current().is_some_and(|b| b != b')')
                    {
                        self.advance();
                    }
                    self.advance(); // closing paren
                }
                _ => break,
            }
        }
    }

    fn read_string(&mut self) -> Token
    {
        self.advance(); // opening quote
        let start = self.position;
        while self.current().is_some_and(|b| b != b'"')
        {
            self.advance();
        }
        if self.current().is_none()
        {
            return Token::Error("Unterminated string".to_string());
        }
        let content = String::from_utf8_lossy(&self.input[start..self.position]).into_owned();
        self.advance(); // closing quote
        Token::Str(content)
    }

    fn read_char_literal(&mut self) -> Token
    {
        self.advance(); // opening quote
        let byte = match self.current()
        {
            Some(b) => b,
            None => return Token::Error("Unterminated character literal".to_string()),
        };
        self.advance();
        if self.current() != Some(b'\'')
        {
            return Token::Error("Unterminated character literal".to_string());
        }
        self.advance(); // closing quote
        Token::Number(byte as f64)
    }

    fn read_ref_name(&mut self) -> Token
    {
        self.advance(); // @
        if !self.current().is_some_and(is_name_start)
        {
            return Token::Error("Expected a name after '@'".to_string());
        }
        let start = self.position;
        while self.current().is_some_and(is_name_char)
        {
            self.advance();
        }
        let name = String::from_utf8_lossy(&self.input[start..self.position]).into_owned();
        Token::RefName(name)
    }

    fn read_number(&mut self) -> Token
    {
        let start = self.position;
        if self.current() == Some(b'-')
        {
            self.advance();
        }
        while self.current().is_some_and(|b| b.is_ascii_digit())
        {
            self.advance();
        }
        if self.current() == Some(b'.')
        {
            self.advance();
            while self.current().is_some_and(|b| b.is_ascii_digit())
            {
                self.advance();
            }
        }
        let text = String::from_utf8_lossy(&self.input[start..self.position]).into_owned();
        Token::Number(text.parse().unwrap_or(0.0))
    }

    fn read_name(&mut self) -> Token
    {
        let start = self.position;
        self.advance();
        while self.current().is_some_and(is_name_char)
        {
            self.advance();
        }
        let name = String::from_utf8_lossy(&self.input[start..self.position]).into_owned();
        if name.len() > 255
        {
            return Token::Error("Name too long".to_string());
        }
        match name.as_str()
        {
            "true" => Token::True,
            "false" => Token::False,
            "nil" => Token::Nil,
            _ => Token::Name(name),
        }
    }
}
