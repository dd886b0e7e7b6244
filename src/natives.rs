use crate::context::Context;
use crate::opcode::Op;
use crate::value::{ArrayData, Value};
use crate::vm;
use std::cell::RefCell;
use std::fs;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

/// One native table entry: a printable name plus either a direct opcode
/// the compiler inlines or a host function dispatched through `Invoke`.
/// The entry's position in the table is the `Invoke` operand.
pub struct NativeEntry
{
    pub name: String,
    pub opcode: Option<Op>,
    pub run: Option<NativeFn>,
}

/// Natives read and pop their arguments from the operand stack and push
/// their results; a returned error is pushed as an error value by the
/// dispatcher.
pub type NativeFn = fn(&mut Context) -> Result<(), String>;

fn alias(name: &str, opcode: Op) -> NativeEntry
{
    NativeEntry {
        name: name.to_string(),
        opcode: Some(opcode),
        run: None,
    }
}

fn func(name: &str, run: NativeFn) -> NativeEntry
{
    NativeEntry {
        name: name.to_string(),
        opcode: None,
        run: Some(run),
    }
}

pub fn builtins() -> Vec<NativeEntry>
{
    vec![
        // Direct-opcode aliases, inlined at compile time.
        alias("dup", Op::Dup),
        alias("drop", Op::Drop),
        alias("swap", Op::Swap),
        alias("rot", Op::Rot),
        alias("over", Op::Over),
        alias("nip", Op::Nip),
        alias("tuck", Op::Tuck),
        alias("pick", Op::PickN),
        alias("move", Op::MoveN),
        alias("+", Op::Plus),
        alias("-", Op::Minus),
        alias("*", Op::Mul),
        // The identifier set cannot lex '/'; kept for bytecode symmetry.
        alias("/", Op::Div),
        alias("%", Op::Mod),
        alias("<", Op::Lt),
        alias(">", Op::Gt),
        alias("<=", Op::Lte),
        alias(">=", Op::Gte),
        alias("<<", Op::Shl),
        alias(">>", Op::Shr),
        alias("=", Op::Eq),
        alias("and", Op::And),
        alias("or", Op::Or),
        alias(".", Op::Print),
        alias("apush", Op::Apush),
        alias("hmput", Op::Hmput),
        // Host functions.
        func("not", native_not),
        func("exec", native_exec),
        func("copy", native_copy),
        func("len", native_len),
        func("cat", native_cat),
        func("sort", native_sort),
        func("compare", native_compare),
        func("reverse", native_reverse),
        func("slice", native_slice),
        func("aget", native_aget),
        func("aset", native_aset),
        func("adel", native_adel),
        func("apop", native_apop),
        func("hmget", native_hmget),
        func("hmdel", native_hmdel),
        func("slurp", native_slurp),
        func("lines", native_lines),
        func("read", native_read),
        func("nl", native_nl),
        func("dump", native_dump),
        func("eval", native_eval),
        func("use", native_use),
        func("?", native_ref_get),
        func("!", native_ref_set),
        func("!!", native_ref_update),
        func("!?", native_ref_update_get),
        func("cond", native_cond),
        func("while", native_while),
        func("times", native_times),
        func("each", native_each),
        func("fold", native_fold),
        func("foldi", native_foldi),
        func("filter", native_filter),
    ]
}

// --- argument helpers ---------------------------------------------------

fn pop_value(ctx: &mut Context) -> Result<Value, String>
{
    ctx.pop().ok_or_else(|| "Stack underflow!".to_string())
}

fn pop_number(ctx: &mut Context, who: &str) -> Result<f64, String>
{
    match pop_value(ctx)?
    {
        Value::Number(n) => Ok(n),
        other => Err(format!("'{}' expects a number, got {}", who, other.type_name())),
    }
}

fn pop_string(ctx: &mut Context, who: &str) -> Result<Rc<String>, String>
{
    match pop_value(ctx)?
    {
        Value::String(s) => Ok(s),
        other => Err(format!("'{}' expects a string, got {}", who, other.type_name())),
    }
}

fn pop_array(ctx: &mut Context, who: &str) -> Result<Rc<RefCell<ArrayData>>, String>
{
    match pop_value(ctx)?
    {
        Value::Array(arr) => Ok(arr),
        other => Err(format!("'{}' expects an array, got {}", who, other.type_name())),
    }
}

/// A block is an array literal carrying compiled code, or a bare code
/// address.
fn pop_block(ctx: &mut Context, who: &str) -> Result<u32, String>
{
    match pop_value(ctx)?
    {
        Value::Array(arr) => arr
            .borrow()
            .code
            .ok_or_else(|| format!("'{}' expects a block", who)),
        Value::CodeAddress(addr) => Ok(addr),
        other => Err(format!("'{}' expects a block, got {}", who, other.type_name())),
    }
}

fn top_array(ctx: &Context, who: &str) -> Result<Rc<RefCell<ArrayData>>, String>
{
    match ctx.stack.last()
    {
        Some(Value::Array(arr)) => Ok(arr.clone()),
        Some(other) => Err(format!("'{}' expects an array, got {}", who, other.type_name())),
        None => Err("Stack underflow!".to_string()),
    }
}

fn oob(index: f64, max_inclusive: i64) -> String
{
    format!("Index out of bounds {} (0 - {} inclusive)", index as i64, max_inclusive)
}

// --- basics -------------------------------------------------------------

fn native_not(ctx: &mut Context) -> Result<(), String>
{
    let value = pop_value(ctx)?;
    ctx.push(Value::boolean(!value.is_truthy()));
    Ok(())
}

/// Execute the top of stack: blocks and code addresses are called, natives
/// invoked, names resolved through the name table; plain values go back.
fn native_exec(ctx: &mut Context) -> Result<(), String>
{
    let value = pop_value(ctx)?;
    match value
    {
        Value::Array(ref arr) =>
        {
            let code = arr.borrow().code;
            match code
            {
                Some(addr) => vm::call_block(ctx, addr),
                None => ctx.push(value),
            }
        }
        Value::CodeAddress(addr) => vm::call_block(ctx, addr),
        Value::Native(idx) => vm::invoke_native(ctx, idx),
        Value::Name(n) =>
        {
            if let Value::CodeAddress(addr) = ctx.names.get(&Value::Name(n.clone()))
            {
                vm::call_block(ctx, addr);
            }
            else if let Some((idx, _)) = ctx.native_lookup(&n)
            {
                vm::invoke_native(ctx, idx);
            }
            else
            {
                return Err(format!("Undefined name: {}", n));
            }
        }
        other => ctx.push(other),
    }
    Ok(())
}

fn native_copy(ctx: &mut Context) -> Result<(), String>
{
    let value = pop_value(ctx)?;
    ctx.push(value.deep_copy());
    Ok(())
}

// --- strings and arrays -------------------------------------------------

/// (coll -- coll n)
fn native_len(ctx: &mut Context) -> Result<(), String>
{
    let len = match ctx.stack.last()
    {
        Some(Value::Array(arr)) => arr.borrow().items.len(),
        Some(Value::String(s)) | Some(Value::Name(s)) => s.len(),
        Some(Value::Map(map)) => map.borrow().len(),
        Some(other) => return Err(format!("'len' expects a collection, got {}", other.type_name())),
        None => return Err("Stack underflow!".to_string()),
    };
    ctx.push(Value::Number(len as f64));
    Ok(())
}

fn cat_part(value: &Value, out: &mut Vec<u8>) -> Result<(), String>
{
    match value
    {
        Value::String(s) | Value::Name(s) => out.extend_from_slice(s.as_bytes()),
        Value::Number(n) => out.push((*n as i64 & 0xff) as u8),
        other => return Err(format!("'cat' expects strings or numbers, got {}", other.type_name())),
    }
    Ok(())
}

/// Strings and numbers concatenate into a string (a number contributes its
/// byte); two arrays concatenate into a fresh array.
fn native_cat(ctx: &mut Context) -> Result<(), String>
{
    let b = pop_value(ctx)?;
    let a = pop_value(ctx)?;
    if let (Value::Array(x), Value::Array(y)) = (&a, &b)
    {
        let mut items = x.borrow().items.clone();
        items.extend(y.borrow().items.iter().cloned());
        ctx.push(Value::array(items));
        return Ok(());
    }
    let mut bytes = Vec::new();
    cat_part(&a, &mut bytes)?;
    cat_part(&b, &mut bytes)?;
    ctx.push(Value::string(String::from_utf8_lossy(&bytes).into_owned()));
    Ok(())
}

/// (arr -- arr), sorted in place.
fn native_sort(ctx: &mut Context) -> Result<(), String>
{
    let arr = pop_array(ctx, "sort")?;
    arr.borrow_mut().items.sort_by(|a, b| a.compare(b));
    ctx.push(Value::Array(arr));
    Ok(())
}

fn native_compare(ctx: &mut Context) -> Result<(), String>
{
    let b = pop_value(ctx)?;
    let a = pop_value(ctx)?;
    let n = match a.compare(&b)
    {
        std::cmp::Ordering::Less => -1.0,
        std::cmp::Ordering::Equal => 0.0,
        std::cmp::Ordering::Greater => 1.0,
    };
    ctx.push(Value::Number(n));
    Ok(())
}

fn native_reverse(ctx: &mut Context) -> Result<(), String>
{
    match pop_value(ctx)?
    {
        Value::Array(arr) =>
        {
            arr.borrow_mut().items.reverse();
            ctx.push(Value::Array(arr));
        }
        Value::String(s) =>
        {
            ctx.push(Value::string(s.chars().rev().collect::<String>()));
        }
        other => return Err(format!("'reverse' expects an array or a string, got {}", other.type_name())),
    }
    Ok(())
}

/// (coll a b -- piece), half-open range with clamped bounds.
fn native_slice(ctx: &mut Context) -> Result<(), String>
{
    let end = pop_number(ctx, "slice")?;
    let start = pop_number(ctx, "slice")?;
    let coll = pop_value(ctx)?;
    let clamp = |n: f64, len: usize| -> usize {
        if n < 0.0
        {
            0
        }
        else
        {
            (n as usize).min(len)
        }
    };
    match coll
    {
        Value::Array(arr) =>
        {
            let items = arr.borrow();
            let from = clamp(start, items.items.len());
            let to = clamp(end, items.items.len()).max(from);
            ctx.push(Value::array(items.items[from..to].to_vec()));
        }
        Value::String(s) =>
        {
            let bytes = s.as_bytes();
            let from = clamp(start, bytes.len());
            let to = clamp(end, bytes.len()).max(from);
            ctx.push(Value::string(String::from_utf8_lossy(&bytes[from..to]).into_owned()));
        }
        other => return Err(format!("'slice' expects an array or a string, got {}", other.type_name())),
    }
    Ok(())
}

/// (coll i -- coll v); strings yield the byte value at the index.
fn native_aget(ctx: &mut Context) -> Result<(), String>
{
    let index = pop_number(ctx, "aget")?;
    let item = match ctx.stack.last()
    {
        Some(Value::Array(arr)) =>
        {
            let items = arr.borrow();
            let len = items.items.len();
            if index < 0.0 || index as usize >= len
            {
                return Err(oob(index, len as i64 - 1));
            }
            items.items[index as usize].clone()
        }
        Some(Value::String(s)) | Some(Value::Name(s)) =>
        {
            let bytes = s.as_bytes();
            if index < 0.0 || index as usize >= bytes.len()
            {
                return Err(oob(index, bytes.len() as i64 - 1));
            }
            Value::Number(bytes[index as usize] as f64)
        }
        Some(other) => return Err(format!("'aget' expects an array or a string, got {}", other.type_name())),
        None => return Err("Stack underflow!".to_string()),
    };
    ctx.push(item);
    Ok(())
}

/// (arr i v -- arr), in place; an index equal to the length appends.
fn native_aset(ctx: &mut Context) -> Result<(), String>
{
    let value = pop_value(ctx)?;
    let index = pop_number(ctx, "aset")?;
    let arr = top_array(ctx, "aset")?;
    let mut items = arr.borrow_mut();
    let len = items.items.len();
    if index < 0.0 || index as usize > len
    {
        return Err(oob(index, len as i64));
    }
    if index as usize == len
    {
        items.items.push(value);
    }
    else
    {
        items.items[index as usize] = value;
    }
    Ok(())
}

/// (arr i -- arr), removing the element and shifting the rest over.
fn native_adel(ctx: &mut Context) -> Result<(), String>
{
    let index = pop_number(ctx, "adel")?;
    let arr = top_array(ctx, "adel")?;
    let mut items = arr.borrow_mut();
    let len = items.items.len();
    if index < 0.0 || index as usize >= len
    {
        return Err(oob(index, len as i64 - 1));
    }
    items.items.remove(index as usize);
    Ok(())
}

/// (arr -- arr v), removing the last element.
fn native_apop(ctx: &mut Context) -> Result<(), String>
{
    let arr = top_array(ctx, "apop")?;
    let popped = arr.borrow_mut().items.pop();
    match popped
    {
        Some(value) =>
        {
            ctx.push(value);
            Ok(())
        }
        None => Err("Stack underflow!".to_string()),
    }
}

// --- hashmaps -----------------------------------------------------------

/// (hm k -- hm v), nil when the key is unbound.
fn native_hmget(ctx: &mut Context) -> Result<(), String>
{
    let key = pop_value(ctx)?;
    if !key.is_hashable()
    {
        return Err(format!("Unhashable key: {}", key.type_name()));
    }
    let value = match ctx.stack.last()
    {
        Some(Value::Map(map)) => map.borrow().get(&key),
        Some(other) => return Err(format!("'hmget' expects a hashmap, got {}", other.type_name())),
        None => return Err("Stack underflow!".to_string()),
    };
    ctx.push(value);
    Ok(())
}

/// (hm k -- hm)
fn native_hmdel(ctx: &mut Context) -> Result<(), String>
{
    let key = pop_value(ctx)?;
    if !key.is_hashable()
    {
        return Err(format!("Unhashable key: {}", key.type_name()));
    }
    match ctx.stack.last()
    {
        Some(Value::Map(map)) =>
        {
            map.borrow_mut().delete(&key);
            Ok(())
        }
        Some(other) => Err(format!("'hmdel' expects a hashmap, got {}", other.type_name())),
        None => Err("Stack underflow!".to_string()),
    }
}

// --- I/O ----------------------------------------------------------------

fn native_slurp(ctx: &mut Context) -> Result<(), String>
{
    let path = pop_string(ctx, "slurp")?;
    match fs::read_to_string(path.as_str())
    {
        Ok(contents) =>
        {
            ctx.push(Value::string(contents));
            Ok(())
        }
        Err(e) => Err(format!("Could not read {}: {}", path, e)),
    }
}

fn native_lines(ctx: &mut Context) -> Result<(), String>
{
    let text = pop_string(ctx, "lines")?;
    let lines = text.lines().map(Value::string).collect();
    ctx.push(Value::array(lines));
    Ok(())
}

/// Read one line from standard input; the end-of-input sentinel is pushed
/// when the stream is exhausted.
fn native_read(ctx: &mut Context) -> Result<(), String>
{
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line)
    {
        Ok(0) => ctx.push(Value::Eof),
        Ok(_) =>
        {
            while line.ends_with('\n') || line.ends_with('\r')
            {
                line.pop();
            }
            ctx.push(Value::string(line));
        }
        Err(e) => return Err(format!("Could not read input: {}", e)),
    }
    Ok(())
}

fn native_nl(_ctx: &mut Context) -> Result<(), String>
{
    print!("\n");
    let _ = io::stdout().flush();
    Ok(())
}

/// Print the whole operand stack, bottom first, without consuming it.
fn native_dump(ctx: &mut Context) -> Result<(), String>
{
    let mut out = String::new();
    for (idx, value) in ctx.stack.iter().enumerate()
    {
        if idx > 0
        {
            out.push(' ');
        }
        out.push_str(&value.inspect());
    }
    println!("{}", out);
    Ok(())
}

/// Compile and run a source string on this context. The caller's program
/// counter is restored afterwards; a compile failure becomes an error
/// value.
fn native_eval(ctx: &mut Context) -> Result<(), String>
{
    let source = pop_string(ctx, "eval")?;
    eval_nested(ctx, &source)
}

fn native_use(ctx: &mut Context) -> Result<(), String>
{
    let path = pop_string(ctx, "use")?;
    let source = fs::read_to_string(path.as_str())
        .map_err(|e| format!("Could not read {}: {}", path, e))?;
    eval_nested(ctx, &source)
}

fn eval_nested(ctx: &mut Context, source: &str) -> Result<(), String>
{
    let saved = ctx.pc;
    let result = ctx.eval(source);
    ctx.pc = saved;
    result.map_err(|e| e.to_string())
}

// --- ref cells ----------------------------------------------------------

/// Resolve a reference argument to its cell. Ref-names go through the
/// name table; the cell is created on first write, never on read.
fn resolve_cell(
    ctx: &mut Context,
    value: Value,
    create: bool,
    who: &str,
) -> Result<Option<Rc<RefCell<Value>>>, String>
{
    match value
    {
        Value::Reference(cell) => Ok(Some(cell)),
        Value::RefName(name) =>
        {
            let key = Value::RefName(name);
            if let Value::Reference(cell) = ctx.names.get(&key)
            {
                return Ok(Some(cell));
            }
            if !create
            {
                return Ok(None);
            }
            let cell = Rc::new(RefCell::new(Value::Nil));
            ctx.names.put(key, Value::Reference(cell.clone()));
            Ok(Some(cell))
        }
        other => Err(format!("'{}' expects a reference, got {}", who, other.type_name())),
    }
}

/// (ref -- v)
fn native_ref_get(ctx: &mut Context) -> Result<(), String>
{
    let reference = pop_value(ctx)?;
    let value = match resolve_cell(ctx, reference, false, "?")?
    {
        Some(cell) => cell.borrow().clone(),
        None => Value::Nil,
    };
    ctx.push(value);
    Ok(())
}

/// (ref v -- )
fn native_ref_set(ctx: &mut Context) -> Result<(), String>
{
    let value = pop_value(ctx)?;
    let reference = pop_value(ctx)?;
    if let Some(cell) = resolve_cell(ctx, reference, true, "!")?
    {
        *cell.borrow_mut() = value;
    }
    Ok(())
}

fn ref_update(ctx: &mut Context, who: &str) -> Result<Value, String>
{
    let block = pop_block(ctx, who)?;
    let reference = pop_value(ctx)?;
    let cell = match resolve_cell(ctx, reference, true, who)?
    {
        Some(cell) => cell,
        None => return Err(format!("'{}' expects a reference", who)),
    };
    let current = cell.borrow().clone();
    ctx.push(current);
    vm::call_block(ctx, block);
    let updated = pop_value(ctx)?;
    *cell.borrow_mut() = updated.clone();
    Ok(updated)
}

/// (ref blk -- ), applying the block to the cell content.
fn native_ref_update(ctx: &mut Context) -> Result<(), String>
{
    ref_update(ctx, "!!")?;
    Ok(())
}

/// (ref blk -- v), like `!!` but leaving the new content on the stack.
fn native_ref_update_get(ctx: &mut Context) -> Result<(), String>
{
    let updated = ref_update(ctx, "!?")?;
    ctx.push(updated);
    Ok(())
}

// --- control structures -------------------------------------------------

fn call_and_pop(ctx: &mut Context, addr: u32) -> Result<Value, String>
{
    vm::call_block(ctx, addr);
    pop_value(ctx)
}

/// Walk condition/action pairs. Conditions that are blocks are called,
/// plain values are tested directly; the first truthy condition's action
/// runs (or is pushed) and the walk stops.
fn native_cond(ctx: &mut Context) -> Result<(), String>
{
    let arr = pop_array(ctx, "cond")?;
    let items = arr.borrow().items.clone();
    let mut idx = 0;
    while idx < items.len()
    {
        if idx + 1 >= items.len()
        {
            return Err("Cond requires an array with alternating condition/action pairs.".to_string());
        }
        let truthy = match &items[idx]
        {
            Value::Array(cond_arr) => match cond_arr.borrow().code
            {
                Some(addr) => call_and_pop(ctx, addr)?.is_truthy(),
                None => true,
            },
            plain => plain.is_truthy(),
        };
        if truthy
        {
            match &items[idx + 1]
            {
                Value::Array(action) =>
                {
                    let code = action.borrow().code;
                    match code
                    {
                        Some(addr) => vm::call_block(ctx, addr),
                        None => ctx.push(items[idx + 1].clone()),
                    }
                }
                plain => ctx.push(plain.clone()),
            }
            return Ok(());
        }
        idx += 2;
    }
    Ok(())
}

/// (cond-blk body-blk -- ...)
fn native_while(ctx: &mut Context) -> Result<(), String>
{
    let body = pop_block(ctx, "while")?;
    let condition = pop_block(ctx, "while")?;
    loop
    {
        if !call_and_pop(ctx, condition)?.is_truthy()
        {
            return Ok(());
        }
        vm::call_block(ctx, body);
    }
}

/// (v n -- ...): call a block n times, or push a plain value n times.
fn native_times(ctx: &mut Context) -> Result<(), String>
{
    let n = pop_number(ctx, "times")?;
    let value = pop_value(ctx)?;
    let count = if n.is_finite() && n > 0.0 { n as usize } else { 0 };
    let code = match &value
    {
        Value::Array(arr) => arr.borrow().code,
        Value::CodeAddress(addr) => Some(*addr),
        _ => None,
    };
    for _ in 0..count
    {
        match code
        {
            Some(addr) => vm::call_block(ctx, addr),
            None => ctx.push(value.clone()),
        }
    }
    Ok(())
}

/// (arr blk -- arr'): map each element through the block into a fresh
/// array.
fn native_each(ctx: &mut Context) -> Result<(), String>
{
    let block = pop_block(ctx, "each")?;
    let arr = pop_array(ctx, "each")?;
    let items = arr.borrow().items.clone();
    let mut result = Vec::with_capacity(items.len());
    for item in items
    {
        ctx.push(item);
        result.push(call_and_pop(ctx, block)?);
    }
    ctx.push(Value::array(result));
    Ok(())
}

/// (arr blk -- acc): seed with the first element, then fold the rest.
fn native_fold(ctx: &mut Context) -> Result<(), String>
{
    let block = pop_block(ctx, "fold")?;
    let arr = pop_array(ctx, "fold")?;
    let items = arr.borrow().items.clone();
    let mut iter = items.into_iter();
    let mut acc = match iter.next()
    {
        Some(first) => first,
        None => return Err("'fold' expects a non-empty array".to_string()),
    };
    for item in iter
    {
        ctx.push(acc);
        ctx.push(item);
        acc = call_and_pop(ctx, block)?;
    }
    ctx.push(acc);
    Ok(())
}

/// Like fold, but the block also receives the element's index:
/// (acc elem i -- acc').
fn native_foldi(ctx: &mut Context) -> Result<(), String>
{
    let block = pop_block(ctx, "foldi")?;
    let arr = pop_array(ctx, "foldi")?;
    let items = arr.borrow().items.clone();
    let mut iter = items.into_iter().enumerate();
    let mut acc = match iter.next()
    {
        Some((_, first)) => first,
        None => return Err("'foldi' expects a non-empty array".to_string()),
    };
    for (idx, item) in iter
    {
        ctx.push(acc);
        ctx.push(item);
        ctx.push(Value::Number(idx as f64));
        acc = call_and_pop(ctx, block)?;
    }
    ctx.push(acc);
    Ok(())
}

/// (arr blk -- arr'): keep the elements whose predicate result is truthy.
fn native_filter(ctx: &mut Context) -> Result<(), String>
{
    let block = pop_block(ctx, "filter")?;
    let arr = pop_array(ctx, "filter")?;
    let items = arr.borrow().items.clone();
    let mut result = Vec::new();
    for item in items
    {
        ctx.push(item.clone());
        if call_and_pop(ctx, block)?.is_truthy()
        {
            result.push(item);
        }
    }
    ctx.push(Value::array(result));
    Ok(())
}
