use crate::context::Context;
use crate::names::NameTable;
use crate::opcode::Op;
use crate::value::{ArrayData, Value};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// Pushed on the return stack by `call_block`; the matching `Return` ends
/// the nested run instead of jumping.
const RETURN_SENTINEL: u32 = u32::MAX;
const MAX_CALL_DEPTH: usize = 1 << 16;

/// Run from the context's program counter until `End`, leaving the counter
/// on the `End` byte so the next evaluation can continue there.
pub fn execute(ctx: &mut Context)
{
    run(ctx, false);
}

/// Invoke a compiled block body and come back. Used by every native that
/// defers execution (each, fold, cond, the ref-cell updaters, ...).
pub fn call_block(ctx: &mut Context, addr: u32)
{
    let saved = ctx.pc;
    ctx.rstack.push(RETURN_SENTINEL);
    ctx.pc = addr;
    run(ctx, true);
    ctx.pc = saved;
}

pub fn invoke_native(ctx: &mut Context, idx: u16)
{
    let (run, opcode) = match ctx.natives.get(idx as usize)
    {
        Some(entry) => (entry.run, entry.opcode),
        None =>
        {
            ctx.push_error(format!("Invalid native index {}", idx));
            return;
        }
    };
    if let Some(run) = run
    {
        if let Err(msg) = run(ctx)
        {
            ctx.push_error(msg);
        }
    }
    else if let Some(op) = opcode
    {
        exec_simple_op(ctx, op);
    }
}

fn run(ctx: &mut Context, until_sentinel: bool)
{
    ctx.run_depth += 1;
    loop
    {
        let at = ctx.pc as usize;
        if at >= ctx.bytecode.len()
        {
            ctx.pc = ctx.bytecode.len() as u32;
            break;
        }
        let op = match Op::from_u8(ctx.bytecode[at])
        {
            Some(op) => op,
            None =>
            {
                ctx.push_error(format!("Invalid opcode {} at {}", ctx.bytecode[at], at));
                break;
            }
        };
        ctx.pc += 1;
        match op
        {
            Op::End =>
            {
                ctx.pc = at as u32;
                break;
            }
            Op::Jmp =>
            {
                let addr = read_addr(ctx);
                ctx.pc = addr;
            }
            Op::JmpTrue =>
            {
                let addr = read_addr(ctx);
                jump_if(ctx, addr, true);
            }
            Op::JmpFalse =>
            {
                let addr = read_addr(ctx);
                jump_if(ctx, addr, false);
            }
            Op::Call =>
            {
                let addr = read_addr(ctx);
                if ctx.rstack.len() >= MAX_CALL_DEPTH
                {
                    ctx.push_error("Call depth exceeded");
                }
                else
                {
                    ctx.rstack.push(ctx.pc);
                    ctx.pc = addr;
                }
            }
            Op::Return => match ctx.rstack.pop()
            {
                Some(RETURN_SENTINEL) =>
                {
                    if until_sentinel
                    {
                        break;
                    }
                    ctx.push_error("Return stack underflow!");
                }
                Some(addr) => ctx.pc = addr,
                None => ctx.push_error("Return stack underflow!"),
            },
            Op::Invoke =>
            {
                let idx = read_u16(ctx);
                invoke_native(ctx, idx);
            }
            Op::PushNil => ctx.push(Value::Nil),
            Op::PushTrue => ctx.push(Value::True),
            Op::PushFalse => ctx.push(Value::False),
            Op::PushInt8 =>
            {
                let byte = read_u8(ctx) as i8;
                ctx.push(Value::Number(byte as f64));
            }
            Op::PushInt16 =>
            {
                let lo = read_u8(ctx);
                let hi = read_u8(ctx);
                let value = i16::from_le_bytes([lo, hi]);
                ctx.push(Value::Number(value as f64));
            }
            Op::PushNumber =>
            {
                let mut bytes = [0u8; 8];
                for slot in bytes.iter_mut()
                {
                    *slot = read_u8(ctx);
                }
                ctx.push(Value::Number(f64::from_le_bytes(bytes)));
            }
            Op::PushString =>
            {
                let len = read_u8(ctx) as usize;
                let text = read_str(ctx, len);
                ctx.push(Value::string(text));
            }
            Op::PushStringLong =>
            {
                let mut bytes = [0u8; 4];
                for slot in bytes.iter_mut()
                {
                    *slot = read_u8(ctx);
                }
                let len = u32::from_le_bytes(bytes) as usize;
                let text = read_str(ctx, len);
                ctx.push(Value::string(text));
            }
            Op::PushName =>
            {
                let len = read_u8(ctx) as usize;
                let text = read_str(ctx, len);
                ctx.push(Value::name(text));
            }
            Op::PushRefName =>
            {
                let len = read_u8(ctx) as usize;
                let text = read_str(ctx, len);
                ctx.push(Value::ref_name(text));
            }
            Op::PushArray =>
            {
                let code = read_addr(ctx);
                let data = if code == 0
                {
                    ArrayData::new(Vec::new())
                }
                else
                {
                    ArrayData::with_code(code)
                };
                ctx.push(Value::Array(Rc::new(RefCell::new(data))));
            }
            Op::PushHashmap =>
            {
                ctx.push(Value::Map(Rc::new(RefCell::new(NameTable::new()))));
            }
            simple => exec_simple_op(ctx, simple),
        }
    }
    ctx.run_depth -= 1;
}

/// The operand-free opcodes, shared between the main loop and `Invoke`
/// dispatch of direct-opcode native aliases.
pub fn exec_simple_op(ctx: &mut Context, op: Op)
{
    match op
    {
        Op::Plus => num_binop(ctx, "+", |a, b| a + b),
        Op::Minus => num_binop(ctx, "-", |a, b| a - b),
        Op::Mul => num_binop(ctx, "*", |a, b| a * b),
        Op::Div => num_binop(ctx, "/", |a, b| a / b),
        Op::Mod => int_binop(ctx, op),
        Op::Shl => int_binop(ctx, op),
        Op::Shr => int_binop(ctx, op),
        Op::Lt => num_cmp(ctx, "<", |a, b| a < b),
        Op::Gt => num_cmp(ctx, ">", |a, b| a > b),
        Op::Lte => num_cmp(ctx, "<=", |a, b| a <= b),
        Op::Gte => num_cmp(ctx, ">=", |a, b| a >= b),
        Op::Eq =>
        {
            if need(ctx, 2)
            {
                let b = ctx.stack.pop().unwrap_or(Value::Nil);
                let a = ctx.stack.pop().unwrap_or(Value::Nil);
                ctx.push(Value::boolean(a == b));
            }
        }
        Op::And =>
        {
            if need(ctx, 2)
            {
                let b = ctx.stack.pop().unwrap_or(Value::Nil);
                let a = ctx.stack.pop().unwrap_or(Value::Nil);
                ctx.push(Value::boolean(a.is_truthy() && b.is_truthy()));
            }
        }
        Op::Or =>
        {
            if need(ctx, 2)
            {
                let b = ctx.stack.pop().unwrap_or(Value::Nil);
                let a = ctx.stack.pop().unwrap_or(Value::Nil);
                ctx.push(Value::boolean(a.is_truthy() || b.is_truthy()));
            }
        }
        Op::Dup =>
        {
            if need(ctx, 1)
            {
                let top = ctx.stack[ctx.stack.len() - 1].clone();
                ctx.push(top);
            }
        }
        Op::Drop =>
        {
            if need(ctx, 1)
            {
                ctx.stack.pop();
            }
        }
        Op::Swap =>
        {
            if need(ctx, 2)
            {
                let len = ctx.stack.len();
                ctx.stack.swap(len - 1, len - 2);
            }
        }
        // (a b c -- b c a)
        Op::Rot => move_op(ctx, 2),
        // (a b -- a b a)
        Op::Over => pick_op(ctx, 1),
        // (a b -- b)
        Op::Nip =>
        {
            if need(ctx, 2)
            {
                let len = ctx.stack.len();
                ctx.stack.remove(len - 2);
            }
        }
        // (a b -- b a b)
        Op::Tuck =>
        {
            if need(ctx, 2)
            {
                let len = ctx.stack.len();
                let top = ctx.stack[len - 1].clone();
                ctx.stack.insert(len - 2, top);
            }
        }
        Op::Pick1 => pick_op(ctx, 1),
        Op::Pick2 => pick_op(ctx, 2),
        Op::Pick3 => pick_op(ctx, 3),
        Op::Pick4 => pick_op(ctx, 4),
        Op::Pick5 => pick_op(ctx, 5),
        Op::PickN =>
        {
            if let Some(count) = pop_count(ctx, "pick")
            {
                pick_op(ctx, count);
            }
        }
        Op::Move1 => move_op(ctx, 1),
        Op::Move2 => move_op(ctx, 2),
        Op::Move3 => move_op(ctx, 3),
        Op::Move4 => move_op(ctx, 4),
        Op::Move5 => move_op(ctx, 5),
        Op::MoveN =>
        {
            if let Some(count) = pop_count(ctx, "move")
            {
                move_op(ctx, count);
            }
        }
        Op::Apush => apush(ctx),
        Op::Hmput => hmput(ctx),
        Op::Print =>
        {
            if need(ctx, 1)
            {
                let value = ctx.stack.pop().unwrap_or(Value::Nil);
                print!("{}", value.inspect());
                let _ = std::io::stdout().flush();
            }
        }
        other => ctx.push_error(format!("Opcode {:?} requires operands", other)),
    }
}

// --- operand decoding ---------------------------------------------------

fn read_u8(ctx: &mut Context) -> u8
{
    let byte = ctx.bytecode.get(ctx.pc as usize).copied().unwrap_or(0);
    ctx.pc += 1;
    byte
}

fn read_u16(ctx: &mut Context) -> u16
{
    let hi = read_u8(ctx) as u16;
    let lo = read_u8(ctx) as u16;
    (hi << 8) | lo
}

fn read_addr(ctx: &mut Context) -> u32
{
    let b0 = read_u8(ctx) as u32;
    let b1 = read_u8(ctx) as u32;
    let b2 = read_u8(ctx) as u32;
    (b0 << 16) | (b1 << 8) | b2
}

fn read_str(ctx: &mut Context, len: usize) -> String
{
    let start = (ctx.pc as usize).min(ctx.bytecode.len());
    let end = (start + len).min(ctx.bytecode.len());
    let text = String::from_utf8_lossy(&ctx.bytecode[start..end]).into_owned();
    ctx.pc = end as u32;
    text
}

// --- opcode helpers -----------------------------------------------------

/// Every opcode states a minimum depth; a deficit pushes an error value
/// and execution resumes at the next opcode.
fn need(ctx: &mut Context, required: usize) -> bool
{
    if ctx.stack.len() < required
    {
        ctx.push_error(format!("Stack underflow! ({} < {})", ctx.stack.len(), required));
        return false;
    }
    true
}

fn jump_if(ctx: &mut Context, addr: u32, want_true: bool)
{
    if !need(ctx, 1)
    {
        return;
    }
    let value = ctx.stack.pop().unwrap_or(Value::Nil);
    if value.is_truthy() == want_true
    {
        ctx.pc = addr;
    }
}

fn num_binop(ctx: &mut Context, sym: &str, f: fn(f64, f64) -> f64)
{
    if !need(ctx, 2)
    {
        return;
    }
    let b = ctx.stack.pop().unwrap_or(Value::Nil);
    let a = ctx.stack.pop().unwrap_or(Value::Nil);
    match (a, b)
    {
        (Value::Number(x), Value::Number(y)) => ctx.push(Value::Number(f(x, y))),
        _ => ctx.push_error(format!("Type error: '{}' expects numbers", sym)),
    }
}

fn num_cmp(ctx: &mut Context, sym: &str, f: fn(f64, f64) -> bool)
{
    if !need(ctx, 2)
    {
        return;
    }
    let b = ctx.stack.pop().unwrap_or(Value::Nil);
    let a = ctx.stack.pop().unwrap_or(Value::Nil);
    match (a, b)
    {
        (Value::Number(x), Value::Number(y)) => ctx.push(Value::boolean(f(x, y))),
        _ => ctx.push_error(format!("Type error: '{}' expects numbers", sym)),
    }
}

/// Modulo and shifts coerce both operands to signed 64-bit integers.
fn int_binop(ctx: &mut Context, op: Op)
{
    if !need(ctx, 2)
    {
        return;
    }
    let b = ctx.stack.pop().unwrap_or(Value::Nil);
    let a = ctx.stack.pop().unwrap_or(Value::Nil);
    let (x, y) = match (a, b)
    {
        (Value::Number(x), Value::Number(y)) => (x as i64, y as i64),
        _ =>
        {
            let sym = match op
            {
                Op::Mod => "%",
                Op::Shl => "<<",
                _ => ">>",
            };
            ctx.push_error(format!("Type error: '{}' expects numbers", sym));
            return;
        }
    };
    let result = match op
    {
        Op::Mod =>
        {
            if y == 0
            {
                ctx.push_error("Modulo by zero");
                return;
            }
            x % y
        }
        Op::Shl => x.wrapping_shl(y as u32),
        _ => x.wrapping_shr(y as u32),
    };
    ctx.push(Value::Number(result as f64));
}

fn pop_count(ctx: &mut Context, who: &str) -> Option<usize>
{
    if !need(ctx, 1)
    {
        return None;
    }
    match ctx.stack.pop().unwrap_or(Value::Nil)
    {
        Value::Number(n) if n.is_finite() && n >= 0.0 => Some(n as usize),
        _ =>
        {
            ctx.push_error(format!("'{}' expects a non-negative number", who));
            None
        }
    }
}

/// Copy the (k+1)-th item from the top onto the top.
fn pick_op(ctx: &mut Context, k: usize)
{
    if !need(ctx, k + 1)
    {
        return;
    }
    let item = ctx.stack[ctx.stack.len() - 1 - k].clone();
    ctx.push(item);
}

/// Remove the (k+1)-th item from the top and push it, preserving the
/// relative order of the rest.
fn move_op(ctx: &mut Context, k: usize)
{
    if !need(ctx, k + 1)
    {
        return;
    }
    let idx = ctx.stack.len() - 1 - k;
    let item = ctx.stack.remove(idx);
    ctx.push(item);
}

fn apush(ctx: &mut Context)
{
    if !need(ctx, 2)
    {
        return;
    }
    let value = ctx.stack.pop().unwrap_or(Value::Nil);
    match ctx.stack.last()
    {
        Some(Value::Array(arr)) => arr.borrow_mut().items.push(value),
        _ => ctx.push_error("'apush' expects an array"),
    }
}

fn hmput(ctx: &mut Context)
{
    if !need(ctx, 3)
    {
        return;
    }
    let value = ctx.stack.pop().unwrap_or(Value::Nil);
    let key = ctx.stack.pop().unwrap_or(Value::Nil);
    if !key.is_hashable()
    {
        ctx.push_error(format!("Unhashable key: {}", key.type_name()));
        return;
    }
    match ctx.stack.last()
    {
        Some(Value::Map(map)) => map.borrow_mut().put(key, value),
        _ => ctx.push_error("'hmput' expects a hashmap"),
    }
}
