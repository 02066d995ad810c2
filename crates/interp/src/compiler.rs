//! Single-pass bytecode compiler.
//!
//! A Pratt parser that emits straight into the chunk of the function being
//! compiled; there is no AST. One scope record exists per function under
//! compilation (the script itself counts as one), carrying its lexical
//! scopes and local slots. Forward jumps are emitted with placeholder
//! operands and patched once their target is known.
//!
//! Errors follow panic mode: the first error in a statement is reported,
//! the rest are swallowed until the parser resynchronises at a newline or a
//! statement keyword. Compilation always runs to the end of the source and
//! reports whether any error fired.

use std::fmt;

use mscript_core::{Heap, ObjFunction, Op, Value};

use crate::scanner::{Scanner, Token, TokenKind};

/// Locals per function, including the reserved callee slot.
pub const LOCALS_MAX: usize = 256;

/// Compilation failed; the diagnostics already went to stderr.
#[derive(Debug)]
pub struct CompileError;

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compilation failed")
    }
}

impl std::error::Error for CompileError {}

/// Compile a complete program into its top-level script function.
///
/// String and function constants are allocated on the given heap, so the
/// returned function must be run against a VM owning the same heap.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjFunction, CompileError> {
    tracing::debug!(target: "mscript::compile", "starting compilation");

    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        heap,
        records: Vec::new(),
        previous: Token::empty(),
        current: Token::empty(),
        had_error: false,
        panic_mode: false,
    };
    compiler.begin_record(FunctionKind::Script);
    compiler.advance();
    compiler.program();
    let function = compiler.end_record();

    tracing::debug!(
        target: "mscript::compile",
        "compilation finished {}successfully",
        if compiler.had_error { "un" } else { "" }
    );

    if compiler.had_error {
        Err(CompileError)
    } else {
        Ok(function)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Function,
    Or,
    And,
    Not,
    Isa,
    Comparison,
    Term,
    Factor,
    Unary,
    New,
    Address,
    Power,
    Call,
    Map,
    List,
    Quantity,
    Atom,
}

impl Precedence {
    /// One level tighter; used for left-associative operators.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Function,
            Precedence::Function => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Not,
            Precedence::Not => Precedence::Isa,
            Precedence::Isa => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::New,
            Precedence::New => Precedence::Address,
            Precedence::Address => Precedence::Power,
            Precedence::Power => Precedence::Call,
            Precedence::Call => Precedence::Map,
            Precedence::Map => Precedence::List,
            Precedence::List => Precedence::Quantity,
            Precedence::Quantity => Precedence::Atom,
            Precedence::Atom => Precedence::Atom,
        }
    }
}

type ParseFn<'src, 'heap> = fn(&mut Compiler<'src, 'heap>);

struct ParseRule<'src, 'heap> {
    prefix: Option<ParseFn<'src, 'heap>>,
    infix: Option<ParseFn<'src, 'heap>>,
    precedence: Precedence,
}

fn rule<'src, 'heap>(kind: TokenKind) -> ParseRule<'src, 'heap> {
    fn prefix<'src, 'heap>(f: ParseFn<'src, 'heap>) -> ParseRule<'src, 'heap> {
        ParseRule {
            prefix: Some(f),
            infix: None,
            precedence: Precedence::None,
        }
    }
    fn infix<'src, 'heap>(precedence: Precedence) -> ParseRule<'src, 'heap> {
        ParseRule {
            prefix: None,
            infix: Some(binary),
            precedence,
        }
    }
    fn nothing<'src, 'heap>() -> ParseRule<'src, 'heap> {
        ParseRule {
            prefix: None,
            infix: None,
            precedence: Precedence::None,
        }
    }

    match kind {
        TokenKind::Plus => infix(Precedence::Term),
        TokenKind::Minus => ParseRule {
            prefix: Some(unary),
            infix: Some(binary),
            precedence: Precedence::Term,
        },
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => infix(Precedence::Factor),
        TokenKind::Caret => infix(Precedence::Power),

        TokenKind::Equal
        | TokenKind::NotEqual
        | TokenKind::Less
        | TokenKind::Greater
        | TokenKind::LessEqual
        | TokenKind::GreaterEqual => infix(Precedence::Comparison),

        TokenKind::And => infix(Precedence::And),
        TokenKind::Or => infix(Precedence::Or),
        TokenKind::Not => prefix(unary),

        TokenKind::AtSign => prefix(variable),
        TokenKind::LeftParen => prefix(grouping),

        TokenKind::True | TokenKind::False | TokenKind::Null => prefix(literal),
        TokenKind::Number => prefix(number),
        TokenKind::Str => prefix(string),
        TokenKind::Identifier => prefix(variable),

        TokenKind::Function => ParseRule {
            prefix: Some(function),
            infix: None,
            precedence: Precedence::Function,
        },

        _ => nothing(),
    }
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

/// Per-function compilation state. The compiler keeps a stack of these,
/// one for each `function` form it is currently inside of.
#[derive(Debug)]
struct Record<'src> {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    scope_depth: u32,
}

enum Resolution {
    Local(u8),
    Global,
    Undefined,
}

enum AssignTarget {
    Local(u8),
    Global(u8),
    NewLocal,
}

struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    heap: &'heap mut Heap,
    records: Vec<Record<'src>>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

impl<'src> Compiler<'src, '_> {
    // ---- record and scope management ----

    fn begin_record(&mut self, kind: FunctionKind) {
        let mut locals = Vec::with_capacity(8);
        // slot 0 belongs to the callee itself
        locals.push(Local { name: "", depth: 0 });
        self.records.push(Record {
            function: ObjFunction::new(),
            kind,
            locals,
            scope_depth: 0,
        });
    }

    fn end_record(&mut self) -> ObjFunction {
        self.emit_return();
        let record = self.records.pop().expect("record stack is never empty");

        if !self.had_error && tracing::enabled!(target: "mscript::code", tracing::Level::DEBUG) {
            let name = match record.kind {
                FunctionKind::Script => "script",
                FunctionKind::Function => "function",
            };
            tracing::debug!(
                target: "mscript::code",
                "disassembly:\n{}",
                crate::debug::disassemble_chunk(&record.function.chunk, name)
            );
        }

        record.function
    }

    fn record(&self) -> &Record<'src> {
        self.records.last().expect("record stack is never empty")
    }

    fn record_mut(&mut self) -> &mut Record<'src> {
        self.records.last_mut().expect("record stack is never empty")
    }

    fn begin_scope(&mut self) {
        self.record_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let record = self.record_mut();
        record.scope_depth -= 1;
        let depth = record.scope_depth;

        let mut pops = 0;
        while record.locals.last().is_some_and(|local| local.depth > depth) {
            record.locals.pop();
            pops += 1;
        }
        for _ in 0..pops {
            self.emit_op(Op::Pop);
        }
    }

    // ---- token plumbing ----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token.line, token.lexeme);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    /// A statement terminator: a newline, or the end of the source.
    fn consume_newline(&mut self, message: &str) {
        if self.check(TokenKind::Newline) {
            self.advance();
        } else if !self.check(TokenKind::Eof) {
            self.error_at_current(message);
        }
    }

    fn skip_newlines(&mut self) {
        while self.matches(TokenKind::Newline) {}
    }

    // ---- error reporting ----

    fn error_at(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        eprintln!("Compiler Error: {} [line {}]", message, line);
        self.had_error = true;
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous.line, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.line, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Newline {
                return;
            }
            match self.current.kind {
                TokenKind::If | TokenKind::While | TokenKind::Return | TokenKind::Function => {
                    return;
                }
                _ => {}
            }
            self.advance();
        }
    }

    // ---- emission ----

    fn emit_byte(&mut self, byte: u8) {
        let line = self.current.line;
        self.record_mut().function.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_byte(op as u8);
    }

    fn emit_op_byte(&mut self, op: Op, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        self.emit_op(Op::Null);
        self.emit_op(Op::Return);
    }

    fn chunk_len(&self) -> usize {
        self.record().function.chunk.len()
    }

    /// Emit a jump with a placeholder operand; returns the operand offset
    /// for later patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    /// Back-fill a jump operand with the distance from the instruction after
    /// the operand to the current end of code, big-endian.
    fn patch_jump(&mut self, offset: usize) {
        let jump = self.chunk_len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much jump to code over");
        }
        let chunk = &mut self.record_mut().function.chunk;
        chunk.bytes[offset] = (jump >> 8) as u8;
        chunk.bytes[offset + 1] = jump as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let offset = self.chunk_len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large");
        }
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.record_mut().function.chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_byte(Op::Const, index);
    }

    // ---- name resolution ----

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let value = Value::Obj(self.heap.intern(name));
        self.make_constant(value)
    }

    /// Resolve a name: innermost matching local first, then "known global"
    /// when the identifier already sits in this chunk's constant pool.
    fn resolve(&mut self, name: &str) -> Resolution {
        for (slot, local) in self.record().locals.iter().enumerate().rev() {
            if local.name == name {
                return Resolution::Local(slot as u8);
            }
        }

        let ident = Value::Obj(self.heap.intern(name));
        match self.record().function.chunk.find_constant(&ident) {
            Some(_) => Resolution::Global,
            None => Resolution::Undefined,
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.record().locals.len() >= LOCALS_MAX {
            self.error("Too many local variables in one block");
            return;
        }
        let depth = self.record().scope_depth;
        self.record_mut().locals.push(Local { name, depth });
    }

    // ---- expressions ----

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expected an expression");
            return;
        };
        prefix(self);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                infix(self);
            }
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Function);
    }

    // ---- statements ----

    fn program(&mut self) {
        self.skip_newlines();
        while !self.matches(TokenKind::Eof) {
            self.statement();
            self.skip_newlines();
        }
    }

    /// Compile statements until EOF or one of the terminator kinds, inside
    /// a fresh lexical scope.
    fn block(&mut self, terminators: &[TokenKind]) {
        self.begin_scope();
        self.skip_newlines();
        while self.current.kind != TokenKind::Eof && !terminators.contains(&self.current.kind) {
            self.statement();
            self.skip_newlines();
        }
        self.end_scope();
    }

    fn statement(&mut self) {
        let kind = self.current.kind;
        let starts_expression =
            matches!(kind, TokenKind::Not | TokenKind::True | TokenKind::False);

        if kind.is_keyword() && !starts_expression {
            self.advance();
            match self.previous.kind {
                TokenKind::If => self.if_statement(),
                TokenKind::While => self.while_statement(),
                TokenKind::Return => self.return_statement(),
                _ => self.error("Expected a statement"),
            }
        } else if kind == TokenKind::Identifier && self.assignment_follows() {
            self.assignment();
        } else {
            self.expression_statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    /// One token of lookahead past the current identifier, on a scanner
    /// checkpoint so nothing is consumed.
    fn assignment_follows(&self) -> bool {
        let mut lookahead = self.scanner.clone();
        lookahead.next_token().kind == TokenKind::Assign
    }

    fn assignment(&mut self) {
        self.advance();
        let name = self.previous.lexeme;

        // Resolve before the expression so a first assignment to a global
        // plants the identifier in the pool, visible to the right-hand side.
        let target = match self.resolve(name) {
            Resolution::Local(slot) => AssignTarget::Local(slot),
            Resolution::Global => AssignTarget::Global(self.identifier_constant(name)),
            Resolution::Undefined => {
                if self.record().kind == FunctionKind::Script {
                    // script-level names are globals at any block depth
                    AssignTarget::Global(self.identifier_constant(name))
                } else {
                    AssignTarget::NewLocal
                }
            }
        };

        self.consume(TokenKind::Assign, "Expected '=' after variable name");
        self.expression();
        self.consume_newline("Expected newline after expression");

        match target {
            AssignTarget::Local(slot) => self.emit_op_byte(Op::SetLocal, slot),
            AssignTarget::Global(index) => self.emit_op_byte(Op::SetGlobal, index),
            // the expression's value stays on the stack as the new local
            AssignTarget::NewLocal => self.add_local(name),
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        if self.check(TokenKind::Assign) {
            self.error_at_current("Invalid assignment target");
        }
        self.consume_newline("Expected newline after expression");
        self.emit_op(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Then, "Expected 'then' after condition");
        self.consume_newline("Expected newline after 'then'");

        let mut then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.block(&[TokenKind::EndIf, TokenKind::Else, TokenKind::ElseIf]);

        let mut end_jumps = Vec::new();
        while self.matches(TokenKind::ElseIf) {
            end_jumps.push(self.emit_jump(Op::Jump));
            self.patch_jump(then_jump);
            self.emit_op(Op::Pop);

            self.expression();
            self.consume(TokenKind::Then, "Expected 'then' after condition");
            self.consume_newline("Expected newline after 'then'");

            then_jump = self.emit_jump(Op::JumpIfFalse);
            self.emit_op(Op::Pop);
            self.block(&[TokenKind::EndIf, TokenKind::Else, TokenKind::ElseIf]);
        }

        if self.matches(TokenKind::Else) {
            self.consume_newline("Expected newline after 'else'");
            end_jumps.push(self.emit_jump(Op::Jump));
            self.patch_jump(then_jump);
            self.emit_op(Op::Pop);
            self.block(&[TokenKind::EndIf]);
        } else {
            end_jumps.push(self.emit_jump(Op::Jump));
            self.patch_jump(then_jump);
            self.emit_op(Op::Pop);
        }

        self.consume(TokenKind::EndIf, "Expected 'end if'");
        for offset in end_jumps {
            self.patch_jump(offset);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.expression();
        self.consume_newline("Expected newline after expression");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);

        self.block(&[TokenKind::EndWhile]);
        self.consume(TokenKind::EndWhile, "Expected 'end while'");

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
    }

    fn return_statement(&mut self) {
        if self.matches(TokenKind::Newline) || self.check(TokenKind::Eof) {
            self.emit_return();
        } else {
            self.expression();
            self.consume_newline("Expected newline after expression");
            self.emit_op(Op::Return);
        }
    }
}

// ---- parse rule handlers ----

fn binary(c: &mut Compiler) {
    let operator = c.previous.kind;
    let precedence = rule(operator).precedence;
    // '^' is the one right-associative operator: recurse at its own level
    let next = if operator == TokenKind::Caret {
        precedence
    } else {
        precedence.next()
    };
    c.parse_precedence(next);

    match operator {
        TokenKind::Plus => c.emit_op(Op::Add),
        TokenKind::Minus => c.emit_op(Op::Subtract),
        TokenKind::Star => c.emit_op(Op::Multiply),
        TokenKind::Slash => c.emit_op(Op::Divide),
        TokenKind::Percent => c.emit_op(Op::Modulo),
        TokenKind::Caret => c.emit_op(Op::Power),

        TokenKind::Equal => c.emit_op(Op::Equal),
        TokenKind::NotEqual => c.emit_op(Op::NotEqual),
        TokenKind::Less => c.emit_op(Op::Less),
        TokenKind::Greater => c.emit_op(Op::Greater),
        TokenKind::LessEqual => c.emit_op(Op::LessEqual),
        TokenKind::GreaterEqual => c.emit_op(Op::GreaterEqual),

        TokenKind::And => c.emit_op(Op::And),
        TokenKind::Or => c.emit_op(Op::Or),
        _ => {}
    }
}

fn unary(c: &mut Compiler) {
    let operator = c.previous.kind;
    c.parse_precedence(Precedence::Unary);
    match operator {
        TokenKind::Minus => c.emit_op(Op::Negate),
        TokenKind::Not => c.emit_op(Op::Not),
        _ => {}
    }
}

fn grouping(c: &mut Compiler) {
    c.expression();
    c.consume(TokenKind::RightParen, "Expected ')' after expression");
}

fn number(c: &mut Compiler) {
    match c.previous.lexeme.parse::<f64>() {
        Ok(value) => c.emit_constant(Value::Num(value)),
        Err(_) => c.error("Invalid number literal"),
    }
}

fn string(c: &mut Compiler) {
    let lexeme = c.previous.lexeme;
    // strip the quotes, decode the doubled-quote escape
    let text = lexeme[1..lexeme.len() - 1].replace("\"\"", "\"");
    let obj = c.heap.take_string(text);
    c.emit_constant(Value::Obj(obj));
}

fn literal(c: &mut Compiler) {
    match c.previous.kind {
        TokenKind::Null => c.emit_op(Op::Null),
        TokenKind::True => c.emit_op(Op::True),
        TokenKind::False => c.emit_op(Op::False),
        _ => {}
    }
}

/// A bare identifier reads the variable and immediately invokes the result
/// with no arguments; the `@` sigil suppresses the implicit call.
fn variable(c: &mut Compiler) {
    let sigil = c.previous.kind == TokenKind::AtSign;
    if sigil {
        c.advance();
        if c.previous.kind != TokenKind::Identifier {
            c.error("Expected variable name after '@'");
            return;
        }
    }

    let name = c.previous.lexeme;
    match c.resolve(name) {
        Resolution::Local(slot) => c.emit_op_byte(Op::GetLocal, slot),
        Resolution::Global => {
            let index = c.identifier_constant(name);
            c.emit_op_byte(Op::GetGlobal, index);
        }
        Resolution::Undefined => {
            c.error("Undefined variable");
            return;
        }
    }

    if !sigil {
        c.emit_op_byte(Op::Invoke, 0);
    }
}

fn function(c: &mut Compiler) {
    c.begin_record(FunctionKind::Function);
    c.begin_scope();

    // no parameter list in the grammar yet
    c.consume_newline("Expected newline after 'function'");
    c.block(&[TokenKind::EndFunction]);
    c.consume(TokenKind::EndFunction, "Expected 'end function'");

    let function = c.end_record();
    let obj = c.heap.alloc_function(function);
    c.emit_constant(Value::Obj(obj));
}
