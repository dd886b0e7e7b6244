use crate::context::{CompileError, Context};
use crate::opcode::Op;
use crate::reader::{Reader, Token, TokenInfo};
use crate::value::Value;
use std::collections::VecDeque;

/// Compile one source fragment onto the context's bytecode buffer. The
/// caller appends the trailing `End` and handles rollback on error.
pub fn compile(ctx: &mut Context, source: &str) -> Result<(), CompileError>
{
    let mut compiler = Compiler::new(source);
    compiler.compile_code(ctx, Mode::TopLevel)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode
{
    TopLevel,
    Definition,
    IfBranch,
    ElseBranch,
    /// Executable body of an array literal, compiled from replayed tokens.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator
{
    Eof,
    DefEnd,
    Else,
    Then,
    ArrayEnd,
}

/// Single-pass, re-entrant compiler. Drives the reader one token at a
/// time; array literals record their tokens and replay them once for the
/// executable body.
struct Compiler<'a>
{
    reader: Reader<'a>,
    pending: Option<TokenInfo>,
    replay: Vec<VecDeque<TokenInfo>>,
}

fn err_at(at: &TokenInfo, message: impl Into<String>) -> CompileError
{
    CompileError {
        message: message.into(),
        line: at.line,
        column: at.column,
    }
}

impl<'a> Compiler<'a>
{
    fn new(source: &'a str) -> Self
    {
        Self {
            reader: Reader::new(source),
            pending: None,
            replay: Vec::new(),
        }
    }

    fn next(&mut self) -> TokenInfo
    {
        if let Some(tok) = self.pending.take()
        {
            return tok;
        }
        if let Some(queue) = self.replay.last_mut()
        {
            return queue.pop_front().unwrap_or(TokenInfo {
                token: Token::Eof,
                line: 0,
                column: 0,
            });
        }
        self.reader.next_token()
    }

    fn compile_code(&mut self, ctx: &mut Context, mode: Mode) -> Result<Terminator, CompileError>
    {
        loop
        {
            let tok = self.next();
            match &tok.token
            {
                Token::Eof => match mode
                {
                    Mode::TopLevel => return Ok(Terminator::Eof),
                    Mode::Definition =>
                    {
                        return Err(err_at(&tok, "Unterminated definition (missing ';')"))
                    }
                    Mode::IfBranch | Mode::ElseBranch =>
                    {
                        return Err(err_at(&tok, "'if' without 'then'"))
                    }
                    Mode::Block => return Err(err_at(&tok, "Unterminated array literal")),
                },
                Token::DefEnd =>
                {
                    if mode == Mode::Definition
                    {
                        return Ok(Terminator::DefEnd);
                    }
                    return Err(err_at(&tok, "Unexpected ';'"));
                }
                Token::ArrayEnd =>
                {
                    if mode == Mode::Block
                    {
                        return Ok(Terminator::ArrayEnd);
                    }
                    return Err(err_at(&tok, "Unexpected ']'"));
                }
                Token::HashEnd => return Err(err_at(&tok, "Unexpected '}'")),
                Token::Comma =>
                {
                    if mode != Mode::Block
                    {
                        return Err(err_at(&tok, "Unexpected ','"));
                    }
                    // Item separator inside a block body.
                }
                Token::Number(n) => self.compile_number(ctx, *n, &tok)?,
                Token::Str(s) => emit_string(ctx, s),
                Token::True => ctx.emit(Op::PushTrue),
                Token::False => ctx.emit(Op::PushFalse),
                Token::Nil => ctx.emit(Op::PushNil),
                Token::Name(n) if n == "if" => self.compile_if(ctx)?,
                Token::Name(n) if n == "else" =>
                {
                    if mode == Mode::IfBranch
                    {
                        return Ok(Terminator::Else);
                    }
                    return Err(err_at(&tok, "'else' outside a conditional"));
                }
                Token::Name(n) if n == "then" =>
                {
                    if matches!(mode, Mode::IfBranch | Mode::ElseBranch)
                    {
                        return Ok(Terminator::Then);
                    }
                    return Err(err_at(&tok, "'then' outside a conditional"));
                }
                Token::Name(n) => compile_name(ctx, n, &tok)?,
                Token::RefName(n) => emit_name_push(ctx, Op::PushRefName, n),
                Token::DefStart =>
                {
                    if mode == Mode::Block
                    {
                        return Err(err_at(
                            &tok,
                            "Definitions are not allowed inside array literals",
                        ));
                    }
                    self.compile_definition(ctx)?;
                }
                Token::ArrayStart =>
                {
                    self.compile_array(ctx)?;
                }
                Token::HashStart =>
                {
                    self.compile_hashmap(ctx)?;
                }
                Token::Error(msg) => return Err(err_at(&tok, msg.clone())),
            }
        }
    }

    /// Integer literals 1..5 fuse with a following `pick` or `move` into a
    /// single opcode; any other lookahead is compiled as the next token.
    fn compile_number(
        &mut self,
        ctx: &mut Context,
        value: f64,
        _at: &TokenInfo,
    ) -> Result<(), CompileError>
    {
        if value.fract() == 0.0 && (1.0..=5.0).contains(&value)
        {
            let depth = value as u8;
            let ahead = self.next();
            match &ahead.token
            {
                Token::Name(n) if n == "pick" =>
                {
                    if let Some(op) = Op::pick_for(depth)
                    {
                        ctx.emit(op);
                        return Ok(());
                    }
                }
                Token::Name(n) if n == "move" =>
                {
                    if let Some(op) = Op::move_for(depth)
                    {
                        ctx.emit(op);
                        return Ok(());
                    }
                }
                _ =>
                {}
            }
            emit_number(ctx, value);
            self.pending = Some(ahead);
            return Ok(());
        }
        emit_number(ctx, value);
        Ok(())
    }

    /// `if .. then` and `if .. else .. then` via reserved jumps patched
    /// when the terminator is seen.
    fn compile_if(&mut self, ctx: &mut Context) -> Result<(), CompileError>
    {
        let skip = ctx.reserve_jump();
        match self.compile_code(ctx, Mode::IfBranch)?
        {
            Terminator::Then =>
            {
                ctx.patch_jump(skip, Op::JmpFalse, ctx.here());
            }
            Terminator::Else =>
            {
                let over_else = ctx.reserve_jump();
                ctx.patch_jump(skip, Op::JmpFalse, ctx.here());
                self.compile_code(ctx, Mode::ElseBranch)?;
                ctx.patch_jump(over_else, Op::Jmp, ctx.here());
            }
            _ => unreachable!("if branch mode only terminates on else/then"),
        }
        Ok(())
    }

    /// `: name body ;` compiles to a jump over the body at runtime; the
    /// name is bound to the body's start address at compile time.
    fn compile_definition(&mut self, ctx: &mut Context) -> Result<(), CompileError>
    {
        let skip = ctx.reserve_jump();
        let body = ctx.here();
        let tok = self.next();
        let name = match &tok.token
        {
            Token::Name(n) if n == "if" || n == "else" || n == "then" =>
            {
                return Err(err_at(&tok, format!("'{}' is a reserved word", n)))
            }
            Token::Name(n) => n.clone(),
            other => return Err(err_at(&tok, format!("Definition requires a name, got {}", other))),
        };
        self.compile_code(ctx, Mode::Definition)?;
        ctx.emit(Op::Return);
        ctx.patch_jump(skip, Op::Jmp, ctx.here());
        ctx.names.put(Value::name(name), Value::CodeAddress(body));
        Ok(())
    }

    /// An array literal is compiled twice from one token stream:
    ///
    /// ```text
    /// PushArray <body>          ; fresh array tagged with its code address
    /// <item> Apush ...          ; builder, executed when the literal runs
    /// Jmp <after>
    /// body: <items, executable> Return
    /// after:
    /// ```
    ///
    /// In the builder a lone name is data (`PushName`); in the body it
    /// compiles to its call form, which is what higher-order natives
    /// invoke. The consumed tokens are returned so enclosing literals can
    /// replay them too.
    fn compile_array(&mut self, ctx: &mut Context) -> Result<Vec<TokenInfo>, CompileError>
    {
        let array_op = ctx.here() as usize;
        ctx.emit(Op::PushArray);
        ctx.emit_addr(0);

        let mut consumed: Vec<TokenInfo> = Vec::new();
        loop
        {
            let tok = self.next();
            match &tok.token
            {
                Token::ArrayEnd =>
                {
                    consumed.push(tok);
                    break;
                }
                Token::Eof => return Err(err_at(&tok, "Unterminated array literal")),
                Token::Comma =>
                {
                    consumed.push(tok);
                }
                Token::Number(n) =>
                {
                    emit_number(ctx, *n);
                    ctx.emit(Op::Apush);
                    consumed.push(tok);
                }
                Token::Str(s) =>
                {
                    emit_string(ctx, s);
                    ctx.emit(Op::Apush);
                    consumed.push(tok);
                }
                Token::True | Token::False | Token::Nil =>
                {
                    ctx.emit(match tok.token
                    {
                        Token::True => Op::PushTrue,
                        Token::False => Op::PushFalse,
                        _ => Op::PushNil,
                    });
                    ctx.emit(Op::Apush);
                    consumed.push(tok);
                }
                Token::Name(n) if n == "if" =>
                {
                    // Conditionals only exist in the executable body; the
                    // data form skips the whole chain.
                    consumed.push(tok);
                    self.skip_if_chain(&mut consumed)?;
                }
                Token::Name(n) =>
                {
                    emit_name_push(ctx, Op::PushName, n);
                    ctx.emit(Op::Apush);
                    consumed.push(tok);
                }
                Token::RefName(n) =>
                {
                    emit_name_push(ctx, Op::PushRefName, n);
                    ctx.emit(Op::Apush);
                    consumed.push(tok);
                }
                Token::ArrayStart =>
                {
                    consumed.push(tok);
                    let inner = self.compile_array(ctx)?;
                    ctx.emit(Op::Apush);
                    consumed.extend(inner);
                }
                Token::HashStart =>
                {
                    consumed.push(tok);
                    let inner = self.compile_hashmap(ctx)?;
                    ctx.emit(Op::Apush);
                    consumed.extend(inner);
                }
                Token::DefStart =>
                {
                    return Err(err_at(&tok, "Definitions are not allowed inside array literals"))
                }
                Token::DefEnd => return Err(err_at(&tok, "Unexpected ';'")),
                Token::HashEnd => return Err(err_at(&tok, "Unexpected '}'")),
                Token::Error(msg) => return Err(err_at(&tok, msg.clone())),
            }
        }

        let over_body = ctx.reserve_jump();
        let body = ctx.here();
        self.replay.push(consumed.iter().cloned().collect());
        let result = self.compile_code(ctx, Mode::Block);
        self.replay.pop();
        result?;
        ctx.emit(Op::Return);
        ctx.patch_addr(array_op + 1, body);
        ctx.patch_jump(over_body, Op::Jmp, ctx.here());
        Ok(consumed)
    }

    /// Consume an `if .. then` chain without emitting anything, leaving the
    /// tokens recorded for the body replay. Nested literals and nested
    /// conditionals are tracked so a `then` inside them does not close the
    /// outer chain.
    fn skip_if_chain(&mut self, consumed: &mut Vec<TokenInfo>) -> Result<(), CompileError>
    {
        let mut depth = 1u32;
        let mut brackets = 0u32;
        loop
        {
            let tok = self.next();
            match &tok.token
            {
                Token::Eof => return Err(err_at(&tok, "'if' without 'then'")),
                Token::ArrayStart | Token::HashStart => brackets += 1,
                Token::ArrayEnd | Token::HashEnd =>
                {
                    if brackets == 0
                    {
                        return Err(err_at(&tok, "'if' without 'then'"));
                    }
                    brackets -= 1;
                }
                Token::Name(n) if n == "if" && brackets == 0 => depth += 1,
                Token::Name(n) if n == "then" && brackets == 0 =>
                {
                    depth -= 1;
                    if depth == 0
                    {
                        consumed.push(tok);
                        return Ok(());
                    }
                }
                Token::Error(msg) => return Err(err_at(&tok, msg.clone())),
                _ =>
                {}
            }
            consumed.push(tok);
        }
    }

    /// `{ ... }` compiles to `PushHashmap`, then one `Hmput` per
    /// comma-separated group (and on `}`), skipped when the group is
    /// empty. Hashmaps carry no executable body.
    fn compile_hashmap(&mut self, ctx: &mut Context) -> Result<Vec<TokenInfo>, CompileError>
    {
        ctx.emit(Op::PushHashmap);
        let mut consumed: Vec<TokenInfo> = Vec::new();
        let mut compiled = false;
        loop
        {
            let tok = self.next();
            match &tok.token
            {
                Token::HashEnd =>
                {
                    consumed.push(tok);
                    if compiled
                    {
                        ctx.emit(Op::Hmput);
                    }
                    return Ok(consumed);
                }
                Token::Comma =>
                {
                    consumed.push(tok);
                    if compiled
                    {
                        ctx.emit(Op::Hmput);
                        compiled = false;
                    }
                }
                Token::Eof => return Err(err_at(&tok, "Unterminated hashmap literal")),
                Token::Number(n) =>
                {
                    emit_number(ctx, *n);
                    compiled = true;
                    consumed.push(tok);
                }
                Token::Str(s) =>
                {
                    emit_string(ctx, s);
                    compiled = true;
                    consumed.push(tok);
                }
                Token::True | Token::False | Token::Nil =>
                {
                    ctx.emit(match tok.token
                    {
                        Token::True => Op::PushTrue,
                        Token::False => Op::PushFalse,
                        _ => Op::PushNil,
                    });
                    compiled = true;
                    consumed.push(tok);
                }
                Token::Name(n) if n == "if" =>
                {
                    return Err(err_at(&tok, "Conditionals are not supported in hashmap literals"))
                }
                Token::Name(n) =>
                {
                    emit_name_push(ctx, Op::PushName, n);
                    compiled = true;
                    consumed.push(tok);
                }
                Token::RefName(n) =>
                {
                    emit_name_push(ctx, Op::PushRefName, n);
                    compiled = true;
                    consumed.push(tok);
                }
                Token::ArrayStart =>
                {
                    consumed.push(tok);
                    let inner = self.compile_array(ctx)?;
                    consumed.extend(inner);
                    compiled = true;
                }
                Token::HashStart =>
                {
                    consumed.push(tok);
                    let inner = self.compile_hashmap(ctx)?;
                    consumed.extend(inner);
                    compiled = true;
                }
                Token::DefStart =>
                {
                    return Err(err_at(&tok, "Definitions are not allowed inside hashmap literals"))
                }
                Token::DefEnd => return Err(err_at(&tok, "Unexpected ';'")),
                Token::ArrayEnd => return Err(err_at(&tok, "Unexpected ']'")),
                Token::Error(msg) => return Err(err_at(&tok, msg.clone())),
            }
        }
    }
}

/// Name resolution at compile time: user definition first, then the
/// native table, otherwise a compile error.
fn compile_name(ctx: &mut Context, name: &str, at: &TokenInfo) -> Result<(), CompileError>
{
    if let Value::CodeAddress(addr) = ctx.names.get(&Value::name(name))
    {
        ctx.emit(Op::Call);
        ctx.emit_addr(addr);
        return Ok(());
    }
    if let Some((idx, entry)) = ctx.native_lookup(name)
    {
        match entry.opcode
        {
            Some(op) => ctx.emit(op),
            None =>
            {
                ctx.emit(Op::Invoke);
                ctx.emit_u8((idx >> 8) as u8);
                ctx.emit_u8(idx as u8);
            }
        }
        return Ok(());
    }
    Err(err_at(at, format!("Undefined name: {}", name)))
}

/// Integers in i8/i16 range use the compact encodings, everything else
/// the raw 8-byte float representation.
fn emit_number(ctx: &mut Context, value: f64)
{
    if value.fract() == 0.0 && (-32768.0..=32767.0).contains(&value)
    {
        let int = value as i32;
        if (-128..=127).contains(&int)
        {
            ctx.emit(Op::PushInt8);
            ctx.emit_u8(int as i8 as u8);
        }
        else
        {
            ctx.emit(Op::PushInt16);
            ctx.emit_bytes(&(int as i16).to_le_bytes());
        }
    }
    else
    {
        ctx.emit(Op::PushNumber);
        ctx.emit_bytes(&value.to_le_bytes());
    }
}

fn emit_string(ctx: &mut Context, s: &str)
{
    let bytes = s.as_bytes();
    if bytes.len() <= 255
    {
        ctx.emit(Op::PushString);
        ctx.emit_u8(bytes.len() as u8);
    }
    else
    {
        ctx.emit(Op::PushStringLong);
        ctx.emit_bytes(&(bytes.len() as u32).to_le_bytes());
    }
    ctx.emit_bytes(bytes);
}

// The reader rejects names longer than 255 bytes, so the short encoding
// always fits.
fn emit_name_push(ctx: &mut Context, op: Op, name: &str)
{
    ctx.emit(op);
    ctx.emit_u8(name.len() as u8);
    ctx.emit_bytes(name.as_bytes());
}
