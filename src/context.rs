use crate::compiler;
use crate::names::NameTable;
use crate::natives::{self, NativeEntry, NativeFn};
use crate::opcode::Op;
use crate::value::Value;
use crate::vm;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

/// Addresses are 3 bytes, so the code space tops out at 16 MiB.
pub const MAX_CODE: usize = 1 << 24;

#[derive(Debug, Clone, PartialEq)]
pub struct CompileError
{
    pub message: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for CompileError
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        if self.column > 0
        {
            write!(f, "Error at line {}:{}: {}", self.line, self.column, self.message)
        }
        else
        {
            write!(f, "Error at line {}: {}", self.line, self.message)
        }
    }
}

/// A single execution environment: operand stack, name table, bytecode
/// buffer, program counter, return stack, and the native table. Created
/// once and extended monotonically across evaluations.
pub struct Context
{
    pub stack: Vec<Value>,
    pub names: NameTable,
    pub bytecode: Vec<u8>,
    pub pc: u32,
    pub rstack: SmallVec<[u32; 32]>,
    pub natives: Vec<NativeEntry>,
    native_index: FxHashMap<String, u16>,
    pub(crate) run_depth: u32,
}

/// Set up a context and hand it to the callback for the lifetime of the
/// session.
pub fn init<F>(callback: F)
where
    F: FnOnce(&mut Context),
{
    let mut ctx = Context::new();
    callback(&mut ctx);
}

impl Context
{
    pub fn new() -> Self
    {
        let natives = natives::builtins();
        let mut native_index = FxHashMap::default();
        for (idx, entry) in natives.iter().enumerate()
        {
            native_index.insert(entry.name.clone(), idx as u16);
        }
        Self {
            stack: Vec::new(),
            names: NameTable::new(),
            bytecode: Vec::new(),
            pc: 0,
            rstack: SmallVec::new(),
            natives,
            native_index,
            run_depth: 0,
        }
    }

    /// Bind a host primitive; the compiler resolves the name to an
    /// `Invoke` of the new entry from now on.
    pub fn register_native(&mut self, name: &str, run: NativeFn)
    {
        let idx = self.natives.len() as u16;
        self.natives.push(NativeEntry {
            name: name.to_string(),
            opcode: None,
            run: Some(run),
        });
        self.native_index.insert(name.to_string(), idx);
    }

    pub fn native_lookup(&self, name: &str) -> Option<(u16, &NativeEntry)>
    {
        let idx = *self.native_index.get(name)?;
        Some((idx, &self.natives[idx as usize]))
    }

    /// Compile the source onto the bytecode buffer and execute it.
    ///
    /// A fresh top-level evaluation rewinds one byte over the trailing
    /// `End` so execution continues seamlessly from where the previous
    /// fragment stopped; evaluations nested inside a running program (the
    /// `eval` and `use` natives) append after the live region instead. A
    /// compile error truncates the buffer back to its pre-eval size and
    /// leaves the context usable.
    pub fn eval(&mut self, source: &str) -> Result<(), CompileError>
    {
        let rewound =
            self.run_depth == 0 && self.bytecode.last() == Some(&(Op::End as u8));
        if rewound
        {
            self.bytecode.pop();
        }
        let start = self.bytecode.len();

        let rollback = |ctx: &mut Context| {
            ctx.bytecode.truncate(start);
            if rewound
            {
                ctx.bytecode.push(Op::End as u8);
            }
        };

        if let Err(e) = compiler::compile(self, source)
        {
            rollback(self);
            return Err(e);
        }
        self.emit(Op::End);
        if self.bytecode.len() > MAX_CODE
        {
            rollback(self);
            return Err(CompileError {
                message: "Bytecode buffer overflow (16 MiB code space)".to_string(),
                line: 0,
                column: 0,
            });
        }

        self.pc = start as u32;
        vm::execute(self);
        Ok(())
    }

    // --- operand stack -------------------------------------------------

    pub fn push(&mut self, value: Value)
    {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Option<Value>
    {
        self.stack.pop()
    }

    pub fn push_error(&mut self, msg: impl Into<String>)
    {
        self.stack.push(Value::error(msg));
    }

    pub fn depth(&self) -> usize
    {
        self.stack.len()
    }

    // --- bytecode emission ---------------------------------------------

    pub fn here(&self) -> u32
    {
        self.bytecode.len() as u32
    }

    pub fn emit(&mut self, op: Op)
    {
        self.bytecode.push(op as u8);
    }

    pub fn emit_u8(&mut self, byte: u8)
    {
        self.bytecode.push(byte);
    }

    pub fn emit_bytes(&mut self, bytes: &[u8])
    {
        self.bytecode.extend_from_slice(bytes);
    }

    /// 3-byte big-endian address.
    pub fn emit_addr(&mut self, addr: u32)
    {
        self.bytecode.push((addr >> 16) as u8);
        self.bytecode.push((addr >> 8) as u8);
        self.bytecode.push(addr as u8);
    }

    /// Reserve space for a jump opcode plus its address, to be patched
    /// once the target is known.
    pub fn reserve_jump(&mut self) -> usize
    {
        let pos = self.bytecode.len();
        self.bytecode.extend_from_slice(&[0, 0, 0, 0]);
        pos
    }

    pub fn patch_jump(&mut self, pos: usize, op: Op, target: u32)
    {
        self.bytecode[pos] = op as u8;
        self.patch_addr(pos + 1, target);
    }

    pub fn patch_addr(&mut self, pos: usize, target: u32)
    {
        self.bytecode[pos] = (target >> 16) as u8;
        self.bytecode[pos + 1] = (target >> 8) as u8;
        self.bytecode[pos + 2] = target as u8;
    }
}

impl Default for Context
{
    fn default() -> Self
    {
        Self::new()
    }
}
