//! Bytecode listing for diagnostics.

use super::builtins::native_name;
use super::bytecode::{Module, operand_i32, operand_u8, operand_u16, operand_u32, operand_u64};
use super::error::FatalError;
use super::ops::{Opcode, PrimOp, PrimType, Shape};
use super::value::Value;

/// Disassembler for a module image.
pub struct Disassembler<'a> {
    module: &'a Module,
    output: String,
}

impl<'a> Disassembler<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self {
            module,
            output: String::new(),
        }
    }

    pub fn disassemble(&mut self) -> &str {
        if !self.module.strings.is_empty() {
            self.output.push_str("== String Constants ==\n");
            for (i, s) in self.module.strings.iter().enumerate() {
                self.output.push_str(&format!("  [{:04}] \"{}\"\n", i, escape(s)));
            }
            self.output.push('\n');
        }

        match self.module.globals() {
            Ok(globals) if !globals.is_empty() => {
                self.output.push_str("== Globals ==\n");
                for (i, g) in globals.iter().enumerate() {
                    self.output.push_str(&format!("  [{:04}] {:?}\n", i, g));
                }
                self.output.push('\n');
            }
            Ok(_) => {}
            Err(e) => self.output.push_str(&format!("== Globals: {} ==\n\n", e)),
        }

        for func in 0..self.module.functions.len() as u32 {
            self.disassemble_function(func);
            self.output.push('\n');
        }
        &self.output
    }

    fn disassemble_function(&mut self, func: u32) {
        let (header, start) = match (self.module.header(func), self.module.code_start(func)) {
            (Ok(h), Ok(s)) => (h, s),
            (Err(e), _) | (_, Err(e)) => {
                self.output.push_str(&format!("== Function[{}]: {} ==\n", func, e));
                return;
            }
        };
        let entry = if func == self.module.entry { " entry" } else { "" };
        self.output.push_str(&format!(
            "== Function[{}]: {} (formals: {}, locals: {}, upvalues: {}, stack: {}{}{}{}) ==\n",
            func,
            self.module.function_name(func),
            header.formals,
            header.frame_size,
            header.upvalues,
            header.eval_stack_depth,
            if header.is_strict() { ", strict" } else { "" },
            if header.uses_arguments() { ", arguments" } else { "" },
            entry,
        ));

        let end = self.function_end(func);
        let code = &self.module.code;
        let mut pc = start;
        while pc < end {
            self.output.push_str(&format!("{:04}: ", pc - start));
            match self.instruction(code, pc, start) {
                Ok(len) => pc += len,
                Err(e) => {
                    self.output.push_str(&format!("<{}>\n", e));
                    return;
                }
            }
            self.output.push('\n');
        }
    }

    /// First header offset after this function's, or the end of the blob.
    fn function_end(&self, func: u32) -> usize {
        let own = self.module.functions[func as usize] as usize;
        self.module
            .functions
            .iter()
            .map(|&o| o as usize)
            .filter(|&o| o > own)
            .min()
            .unwrap_or(self.module.code.len())
    }

    /// Render one instruction and return its length.
    fn instruction(&mut self, code: &[u8], pc: usize, start: usize) -> Result<usize, FatalError> {
        let byte = operand_u8(code, pc)?;
        let op = Opcode::from_u8(byte).ok_or(FatalError::UnknownOpcode { op: byte, pc: pc - start })?;
        let at = pc + 1;
        let rel = |off: i32| (pc - start) as i64 + off as i64;
        self.output.push_str(op.mnemonic());

        let text = match op.shape() {
            Shape::None => String::new(),
            Shape::U8 => format!(" {}", operand_u8(code, at)?),
            Shape::U16 => {
                let v = operand_u16(code, at)?;
                match op {
                    Opcode::PushNative => format!(" {} ; {}", v, native_name(v).unwrap_or("<?>")),
                    _ => format!(" {}", v),
                }
            }
            Shape::U32 => {
                let v = operand_u32(code, at)?;
                match op {
                    Opcode::PushString | Opcode::GetPropByName | Opcode::SetPropByName | Opcode::InitPropByName => {
                        let s = self.module.strings.get(v as usize).map_or("<?>", String::as_str);
                        format!(" {} ; \"{}\"", v, escape(s))
                    }
                    Opcode::PushFunction | Opcode::NewClosure => {
                        format!(" {} ; {}", v, self.module.function_name(v))
                    }
                    _ => format!(" {}", v),
                }
            }
            Shape::I32 => {
                let v = operand_i32(code, at)?;
                match op {
                    Opcode::PushInt => format!(" {}", v),
                    _ => format!(" {:04}", rel(v)),
                }
            }
            Shape::U64 => {
                let bits = operand_u64(code, at)?;
                match Value::from_bits(bits) {
                    Some(v) => format!(" {:?}", v),
                    None => format!(" {:#x}", bits),
                }
            }
            Shape::EnvSlot => format!(" {}, {}", operand_u8(code, at)?, operand_u16(code, at + 1)?),
            Shape::Prim => {
                let op_byte = operand_u8(code, at)?;
                let ty = operand_u8(code, at + 1)?;
                format!(
                    " {:?}.{}",
                    PrimOp::from_u8(op_byte).ok_or_else(|| FatalError::BadBytecode(format!("bad primitive op {}", op_byte)))?,
                    PrimType::from_u8(ty).map_or("?", PrimType::name)
                )
            }
            Shape::CallFn => {
                let func = operand_u32(code, at)?;
                let argc = operand_u8(code, at + 4)?;
                format!(" {}, {} ; {}", func, argc, self.module.function_name(func))
            }
            Shape::CallNative => {
                let id = operand_u16(code, at)?;
                let argc = operand_u8(code, at + 2)?;
                format!(" {}, {} ; {}", id, argc, native_name(id).unwrap_or("<?>"))
            }
            Shape::Try => {
                let target = |off: i32| if off == 0 { "-".to_string() } else { format!("{:04}", rel(off)) };
                format!(
                    " catch={} finally={}",
                    target(operand_i32(code, at)?),
                    target(operand_i32(code, at + 4)?)
                )
            }
            Shape::Switch => {
                let low = operand_i32(code, at)?;
                let count = operand_u16(code, at + 4)? as usize;
                let default = operand_i32(code, at + 6)?;
                let mut s = format!(" low={} default={:04} [", low, rel(default));
                for k in 0..count {
                    if k > 0 {
                        s.push_str(", ");
                    }
                    s.push_str(&format!("{:04}", rel(operand_i32(code, at + 10 + 4 * k)?)));
                }
                s.push(']');
                self.output.push_str(&s);
                return Ok(1 + 10 + 4 * count);
            }
        };
        self.output.push_str(&text);
        Ok(1 + op.shape().len().unwrap_or(0))
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('"', "\\\"")
}

/// Render a whole module.
pub fn disassemble(module: &Module) -> String {
    Disassembler::new(module).disassemble().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::bytecode::{Assembler, FunctionSpec, ModuleBuilder};

    #[test]
    fn test_listing_names_operands() {
        let mut b = ModuleBuilder::new();
        let mut asm = Assembler::new();
        let done = asm.label();
        asm.push_str("hi")
            .push_int(-3)
            .jump(Opcode::JumpIfFalse, done)
            .call_native(0, 1)
            .bind(done)
            .op(Opcode::ReturnUndefined);
        let main = b.function(FunctionSpec::new("main"), asm).unwrap();
        b.entry(main);
        let module = b.build().unwrap();

        let text = disassemble(&module);
        assert!(text.contains("== Function[0]: main (formals: 0, locals: 0, upvalues: 0, stack: 16 entry) =="));
        assert!(text.contains("0000: push.string"));
        assert!(text.contains("; \"hi\""));
        assert!(text.contains("push.int -3"));
        assert!(text.contains("jump.false 0019"));
        assert!(text.contains("call.native 0, 1 ; print"));
        assert!(text.contains("0019: return.undefined"));
    }

    #[test]
    fn test_bad_opcode_stops_listing() {
        let mut b = ModuleBuilder::new();
        let mut asm = Assembler::new();
        asm.op(Opcode::Nop).raw(0xEE).op(Opcode::ReturnUndefined);
        let main = b.function(FunctionSpec::new("main"), asm).unwrap();
        b.entry(main);
        let text = disassemble(&b.build().unwrap());
        assert!(text.contains("0000: nop"));
        assert!(text.contains("unknown opcode 0xee at pc 1"));
        assert!(!text.contains("return.undefined"));
    }
}
