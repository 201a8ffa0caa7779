//! Text assembler and disassembler.
//!
//! One statement per line. `;` starts a comment, `name:` defines a label at
//! the current code offset. Directives append constant pool entries in
//! order of appearance:
//!
//! ```text
//! .nil | .true | .false
//! .int -12
//! .str "hello\n"
//! .sym size
//! .method double 1 0 double_body   ; name args locals entry
//! .method area 0 0 area_body #4     ; optional scope constant
//! .object x=2 double=5             ; slot=constant index
//! ```
//!
//! Instructions use their lower-case mnemonic with `rN` registers, `#N`
//! constant indices and a label or absolute offset as jump target.

use core::fmt;
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::decoder::BytecodeDecoder;
use crate::image::{Constant, Image};
use crate::instruction::Instruction;
use crate::op::Op;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    /// 1-based source line.
    pub line: usize,
    pub message: String,
}

impl AsmError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for AsmError {}

enum Statement<'s> {
    Instruction { op: Op, operands: Vec<&'s str> },
    Method {
        name: String,
        args: u8,
        locals: u8,
        entry: &'s str,
        scope: Option<u16>,
    },
    Constant(Constant),
}

/// Assemble `source` into an image.
pub fn assemble(source: &str) -> Result<Image, AsmError> {
    let mut labels: HashMap<&str, u32> = HashMap::new();
    let mut statements = Vec::new();
    let mut offset = 0usize;

    for (index, raw) in source.lines().enumerate() {
        let line = index + 1;
        let mut text = strip_comment(raw).trim();

        while let Some((label, rest)) = split_label(text) {
            if labels.insert(label, offset as u32).is_some() {
                return Err(AsmError::new(line, format!("duplicate label `{label}`")));
            }
            text = rest.trim();
        }
        if text.is_empty() {
            continue;
        }

        let statement = parse_statement(text, line)?;
        if let Statement::Instruction { op, .. } = &statement {
            offset += op.width();
        }
        statements.push((line, statement));
    }

    let mut constants = Vec::new();
    let mut code = Vec::with_capacity(offset);
    for (line, statement) in statements {
        match statement {
            Statement::Constant(constant) => {
                if let Constant::Object { slots } = &constant {
                    for (name, idx) in slots {
                        if *idx as usize >= constants.len() {
                            return Err(AsmError::new(
                                line,
                                format!("slot `{name}` refers to undefined constant #{idx}"),
                            ));
                        }
                    }
                }
                constants.push(constant);
            }
            Statement::Method {
                name,
                args,
                locals,
                entry,
                scope,
            } => {
                if let Some(idx) = scope.filter(|&idx| idx as usize >= constants.len()) {
                    return Err(AsmError::new(
                        line,
                        format!("method `{name}` scope refers to undefined constant #{idx}"),
                    ));
                }
                let entry = resolve_target(entry, &labels, line)?;
                constants.push(Constant::Method {
                    name,
                    args,
                    locals,
                    entry,
                    scope,
                });
            }
            Statement::Instruction { op, operands } => {
                build_instruction(op, &operands, &labels, line)?.encode(&mut code);
            }
        }
    }

    Ok(Image::new(code, constants))
}

/// Render an image as assembler source that [`assemble`] accepts again.
///
/// Code offsets are kept as trailing comments and jump targets stay
/// numeric. Decoding stops at the first malformed instruction, which is
/// reported as a comment.
pub fn disassemble(image: &Image) -> String {
    let mut out = String::new();
    for (index, constant) in image.constants.iter().enumerate() {
        let text = match constant {
            Constant::Nil => ".nil".to_string(),
            Constant::Boolean(true) => ".true".to_string(),
            Constant::Boolean(false) => ".false".to_string(),
            Constant::Integer(value) => format!(".int {value}"),
            Constant::String(value) => format!(".str \"{}\"", escape(value)),
            Constant::Symbol(name) => format!(".sym {name}"),
            Constant::Method {
                name,
                args,
                locals,
                entry,
                scope: None,
            } => format!(".method {name} {args} {locals} {entry}"),
            Constant::Method {
                name,
                args,
                locals,
                entry,
                scope: Some(scope),
            } => format!(".method {name} {args} {locals} {entry} #{scope}"),
            Constant::Object { slots } => {
                let mut text = ".object".to_string();
                for (name, idx) in slots {
                    let _ = write!(text, " {name}={idx}");
                }
                text
            }
        };
        let _ = writeln!(out, "{text:<40} ; #{index}");
    }

    for item in BytecodeDecoder::new(&image.code) {
        match item {
            Ok((offset, instruction)) => {
                let _ = writeln!(out, "    {:<36} ; {offset:04}", instruction.to_string());
            }
            Err(err) => {
                let _ = writeln!(out, "; {err}");
                break;
            }
        }
    }
    out
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            ';' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

fn split_label(text: &str) -> Option<(&str, &str)> {
    let (label, rest) = text.split_once(':')?;
    if !label.is_empty() && label.chars().all(|c| c.is_alphanumeric() || c == '_') {
        Some((label, rest))
    } else {
        None
    }
}

fn parse_statement(text: &str, line: usize) -> Result<Statement<'_>, AsmError> {
    let (head, rest) = match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (text, ""),
    };

    let Some(directive) = head.strip_prefix('.') else {
        let op = Op::from_mnemonic(head)
            .ok_or_else(|| AsmError::new(line, format!("unknown instruction `{head}`")))?;
        let operands = rest
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        return Ok(Statement::Instruction { op, operands });
    };

    let words: Vec<&str> = rest.split_whitespace().collect();
    let constant = match directive {
        "nil" => Constant::Nil,
        "true" => Constant::Boolean(true),
        "false" => Constant::Boolean(false),
        "int" => {
            let [value] = words[..] else {
                return Err(AsmError::new(line, ".int takes one integer"));
            };
            let value = value
                .parse()
                .map_err(|_| AsmError::new(line, format!("invalid integer `{value}`")))?;
            Constant::Integer(value)
        }
        "str" => Constant::String(parse_string(rest, line)?),
        "sym" => {
            let [name] = words[..] else {
                return Err(AsmError::new(line, ".sym takes one name"));
            };
            Constant::Symbol(name.to_string())
        }
        "method" => {
            let (name, args, locals, entry, scope) = match words[..] {
                [name, args, locals, entry] => (name, args, locals, entry, None),
                [name, args, locals, entry, scope] => {
                    let idx = scope.strip_prefix('#').ok_or_else(|| {
                        AsmError::new(line, format!("expected #index scope, got `{scope}`"))
                    })?;
                    (name, args, locals, entry, Some(parse_number(idx, line)?))
                }
                _ => {
                    return Err(AsmError::new(
                        line,
                        ".method takes name, args, locals, entry and an optional #scope",
                    ));
                }
            };
            return Ok(Statement::Method {
                name: name.to_string(),
                args: parse_number(args, line)?,
                locals: parse_number(locals, line)?,
                entry,
                scope,
            });
        }
        "object" => {
            let mut slots = Vec::with_capacity(words.len());
            for word in words {
                let (name, idx) = word.split_once('=').ok_or_else(|| {
                    AsmError::new(line, format!("expected name=index, got `{word}`"))
                })?;
                slots.push((name.to_string(), parse_number(idx, line)?));
            }
            Constant::Object { slots }
        }
        other => return Err(AsmError::new(line, format!("unknown directive `.{other}`"))),
    };
    Ok(Statement::Constant(constant))
}

fn parse_number<T: std::str::FromStr>(text: &str, line: usize) -> Result<T, AsmError> {
    text.parse()
        .map_err(|_| AsmError::new(line, format!("invalid number `{text}`")))
}

fn parse_string(text: &str, line: usize) -> Result<String, AsmError> {
    let inner = text
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| AsmError::new(line, "expected a quoted string"))?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let escaped = match chars.next() {
            Some('n') => '\n',
            Some('t') => '\t',
            Some('r') => '\r',
            Some('0') => '\0',
            Some('"') => '"',
            Some('\\') => '\\',
            Some(other) => {
                return Err(AsmError::new(line, format!("unknown escape `\\{other}`")));
            }
            None => return Err(AsmError::new(line, "dangling escape")),
        };
        out.push(escaped);
    }
    Ok(out)
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

fn register(text: &str, line: usize) -> Result<u8, AsmError> {
    text.strip_prefix('r')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| AsmError::new(line, format!("expected register, got `{text}`")))
}

fn constant_index(text: &str, line: usize) -> Result<u16, AsmError> {
    text.strip_prefix('#')
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| AsmError::new(line, format!("expected constant index, got `{text}`")))
}

fn resolve_target(text: &str, labels: &HashMap<&str, u32>, line: usize) -> Result<u32, AsmError> {
    if let Ok(offset) = text.parse() {
        return Ok(offset);
    }
    labels
        .get(text)
        .copied()
        .ok_or_else(|| AsmError::new(line, format!("undefined label `{text}`")))
}

fn build_instruction(
    op: Op,
    operands: &[&str],
    labels: &HashMap<&str, u32>,
    line: usize,
) -> Result<Instruction, AsmError> {
    let expected = match op {
        Op::Noop | Op::Swap | Op::Dup | Op::Halt | Op::Ret => 0,
        Op::Push | Op::Pop | Op::Rotate | Op::Save | Op::Restore | Op::Array | Op::String => 1,
        Op::Jmp => 1,
        Op::Move | Op::LoadI | Op::Not | Op::AddSym | Op::FindSym => 2,
        _ => 3,
    };
    if operands.len() != expected {
        return Err(AsmError::new(
            line,
            format!(
                "`{}` takes {expected} operand(s), got {}",
                op.mnemonic(),
                operands.len()
            ),
        ));
    }

    let r = |i: usize| register(operands[i], line);
    let instruction = match op {
        Op::Noop => Instruction::Noop,
        Op::Swap => Instruction::Swap,
        Op::Dup => Instruction::Dup,
        Op::Halt => Instruction::Halt,
        Op::Ret => Instruction::Ret,
        Op::Push => Instruction::Push { src: r(0)? },
        Op::Pop => Instruction::Pop { dst: r(0)? },
        Op::Rotate => Instruction::Rotate { count: r(0)? },
        Op::Save => Instruction::Save { dst: r(0)? },
        Op::Restore => Instruction::Restore { src: r(0)? },
        Op::Array => Instruction::Array { count: r(0)? },
        Op::String => Instruction::String { count: r(0)? },
        Op::Jmp => Instruction::Jmp {
            target: resolve_target(operands[0], labels, line)?,
        },
        Op::Move => Instruction::Move { dst: r(0)?, src: r(1)? },
        Op::Not => Instruction::Not { dst: r(0)?, src: r(1)? },
        Op::AddSym => Instruction::AddSym { dst: r(0)?, src: r(1)? },
        Op::FindSym => Instruction::FindSym { dst: r(0)?, src: r(1)? },
        Op::LoadI => Instruction::LoadI {
            dst: r(0)?,
            idx: constant_index(operands[1], line)?,
        },
        Op::Send => Instruction::Send {
            receiver: r(0)?,
            message: r(1)?,
            sender: r(2)?,
        },
        Op::Add => Instruction::Add { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
        Op::Sub => Instruction::Sub { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
        Op::Mul => Instruction::Mul { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
        Op::Div => Instruction::Div { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
        Op::Mod => Instruction::Mod { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
        Op::Pow => Instruction::Pow { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
        Op::Eq => Instruction::Eq { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
        Op::Lt => Instruction::Lt { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
        Op::Lte => Instruction::Lte { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
        Op::Gt => Instruction::Gt { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
        Op::Gte => Instruction::Gte { dst: r(0)?, lhs: r(1)?, rhs: r(2)? },
    };
    Ok(instruction)
}
