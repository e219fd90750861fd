//! Single-pass Pratt compiler
//!
//! Parses Salmon source and emits bytecode directly into chunks on the
//! shared heap; there is no intermediate tree. One `FnCompiler` frame per
//! enclosing function resolves locals and upvalue captures; a parallel
//! stack of `ClassCompiler` frames tracks `this`/`super` legality.
//!
//! Error handling is panic-mode: the first error in a statement is
//! recorded, the rest are suppressed until a synchronization point (`;` or
//! a statement-starting keyword). The collected diagnostics come back in
//! `Err`; the caller decides where they go.

use salmon_core::chunk::{Chunk, OpCode};
use salmon_core::heap::{Heap, ObjRef};
use salmon_core::object::{Obj, ObjArray, ObjFunction};
use salmon_core::value::Value;

use crate::scanner::{Scanner, Token, TokenKind};

/// One-byte slot operands bind locals and upvalues to 256 per function.
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARITY: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Function,
    Initializer,
    Method,
    Script,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth once initialized; `None` between declaration and the
    /// end of the initializer.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compiler state, chained through `enclosing`.
struct FnCompiler<'src> {
    enclosing: Option<Box<FnCompiler<'src>>>,
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<CompilerUpvalue>,
    scope_depth: usize,
}

impl<'src> FnCompiler<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        let mut function = ObjFunction::new();
        function.name = name;
        // Slot zero belongs to the VM: the receiver in methods, unnameable
        // otherwise.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: Some(0),
            is_captured: false,
        };
        FnCompiler {
            enclosing: None,
            function,
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    /// Newest-to-oldest scan. Returns the slot and whether the local has
    /// finished its initializer.
    fn resolve_local(&self, name: &str) -> Option<(u8, bool)> {
        for (index, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some((index as u8, local.depth.is_some()));
            }
        }
        None
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        let candidate = CompilerUpvalue { index, is_local };
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if *upvalue == candidate {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() == MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(candidate);
        self.function.upvalue_count = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }

    /// Recursive capture up the enclosing chain: a found local is flagged
    /// captured and recorded as a direct upvalue; otherwise the parent's
    /// upvalue is re-exported.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let Some(enclosing) = self.enclosing.as_deref_mut() else {
            return Ok(None);
        };
        if let Some((index, initialized)) = enclosing.resolve_local(name) {
            if !initialized {
                return Err("Can't read local variable in its own initializer.");
            }
            enclosing.locals[index as usize].is_captured = true;
            return self.add_upvalue(index, true).map(Some);
        }
        if let Some(upvalue) = enclosing.resolve_upvalue(name)? {
            return self.add_upvalue(upvalue, false).map(Some);
        }
        Ok(None)
    }
}

struct ClassCompiler {
    enclosing: Option<Box<ClassCompiler>>,
    has_superclass: bool,
}

type ParseFn<'src, 'h> = fn(&mut Parser<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

fn rule<'src, 'h>(
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
) -> ParseRule<'src, 'h> {
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

fn get_rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    use TokenKind::*;
    match kind {
        LeftParen => rule(Some(Parser::grouping), Some(Parser::call), Precedence::Call),
        LeftBracket => rule(
            Some(Parser::array_literal),
            Some(Parser::index),
            Precedence::Call,
        ),
        Dot => rule(None, Some(Parser::dot), Precedence::Call),
        Minus => rule(Some(Parser::unary), Some(Parser::binary), Precedence::Term),
        Plus => rule(None, Some(Parser::binary), Precedence::Term),
        Slash | Star => rule(None, Some(Parser::binary), Precedence::Factor),
        Bang => rule(Some(Parser::unary), None, Precedence::None),
        BangEqual | EqualEqual => rule(None, Some(Parser::binary), Precedence::Equality),
        Greater | GreaterEqual | Less | LessEqual => {
            rule(None, Some(Parser::binary), Precedence::Comparison)
        }
        Question => rule(None, Some(Parser::ternary), Precedence::Assignment),
        Identifier => rule(Some(Parser::variable), None, Precedence::None),
        String => rule(Some(Parser::string), None, Precedence::None),
        Number => rule(Some(Parser::number), None, Precedence::None),
        And => rule(None, Some(Parser::and_), Precedence::And),
        Or => rule(Some(Parser::lambda), Some(Parser::or_), Precedence::Or),
        False | Nil | True => rule(Some(Parser::literal), None, Precedence::None),
        Super => rule(Some(Parser::super_), None, Precedence::None),
        This => rule(Some(Parser::this_), None, Precedence::None),
        _ => rule(None, None, Precedence::None),
    }
}

pub struct Parser<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    current: Token<'src>,
    previous: Token<'src>,
    /// The token before `previous`; element assignment needs the name of
    /// the indexed variable after the `[` has been consumed.
    prev_previous: Token<'src>,
    /// Error-attribution state: the path and marker line of the section
    /// being compiled, updated by path-marker statements.
    path: String,
    last_line: u32,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<String>,
    compiler: Box<FnCompiler<'src>>,
    class_compiler: Option<Box<ClassCompiler>>,
}

/// Compile a whole script into a heap-resident function. On failure the
/// formatted diagnostics are returned instead; the heap may hold garbage
/// from the aborted compile, which the next collection clears.
pub fn compile(source: &str, path: &str, heap: &mut Heap) -> Result<ObjRef, Vec<String>> {
    let mut parser = Parser::new(source, path, heap);
    parser.advance();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
    }
    parser.finish()
}

impl<'src, 'h> Parser<'src, 'h> {
    fn new(source: &'src str, path: &str, heap: &'h mut Heap) -> Self {
        Parser {
            scanner: Scanner::new(source),
            heap,
            current: Token::synthetic(""),
            previous: Token::synthetic(""),
            prev_previous: Token::synthetic(""),
            path: path.to_string(),
            last_line: 0,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            compiler: Box::new(FnCompiler::new(FunctionKind::Script, None)),
            class_compiler: None,
        }
    }

    fn finish(mut self) -> Result<ObjRef, Vec<String>> {
        self.emit_return();
        if self.had_error {
            return Err(self.errors);
        }
        let compiler = std::mem::replace(
            &mut self.compiler,
            Box::new(FnCompiler::new(FunctionKind::Script, None)),
        );
        Ok(self.heap.alloc(Obj::Function(compiler.function)))
    }

    // ---- token plumbing ----

    fn advance(&mut self) {
        self.prev_previous = self.previous;
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let token = self.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // ---- diagnostics ----

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        // Lines are reported relative to the last path marker so each
        // preprocessed section keeps its own numbering.
        let line = token.line.saturating_sub(self.last_line);
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.errors.push(format!(
            "[file {}, line {}] Error{}: {}",
            self.path, line, location, message
        ));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- emission ----

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.compiler.function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    /// Emit a forward jump with a placeholder offset; returns the offset
    /// of the placeholder for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.current_chunk().code[offset] = ((jump >> 8) & 0xff) as u8;
        self.current_chunk().code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_return(&mut self) {
        if self.compiler.kind == FunctionKind::Initializer {
            self.emit_op_byte(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let constant = self.current_chunk().add_constant(value);
        if constant > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.heap.intern(name);
        self.make_constant(Value::Obj(string))
    }

    // ---- scopes and variables ----

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler.scope_depth -= 1;
        while let Some(local) = self.compiler.locals.last() {
            let out_of_scope = local
                .depth
                .is_none_or(|depth| depth > self.compiler.scope_depth);
            if !out_of_scope {
                break;
            }
            let captured = local.is_captured;
            self.compiler.locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.compiler.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.compiler.locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let mut shadowed = false;
        for local in self.compiler.locals.iter().rev() {
            if let Some(depth) = local.depth {
                if depth < self.compiler.scope_depth {
                    break;
                }
            }
            if local.name == name.lexeme {
                shadowed = true;
                break;
            }
        }
        if shadowed {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name.lexeme);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.compiler.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let depth = self.compiler.scope_depth;
        if let Some(local) = self.compiler.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.compiler.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    /// Resolution order: local, then upvalue, then global by name.
    fn resolve_variable(&mut self, name: Token<'src>) -> (OpCode, OpCode, u8) {
        if let Some((index, initialized)) = self.compiler.resolve_local(name.lexeme) {
            if !initialized {
                self.error("Can't read local variable in its own initializer.");
            }
            return (OpCode::GetLocal, OpCode::SetLocal, index);
        }
        match self.compiler.resolve_upvalue(name.lexeme) {
            Ok(Some(index)) => (OpCode::GetUpvalue, OpCode::SetUpvalue, index),
            Ok(None) => {
                let arg = self.identifier_constant(name.lexeme);
                (OpCode::GetGlobal, OpCode::SetGlobal, arg)
            }
            Err(message) => {
                self.error(message);
                let arg = self.identifier_constant(name.lexeme);
                (OpCode::GetGlobal, OpCode::SetGlobal, arg)
            }
        }
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let (get_op, set_op, arg) = self.resolve_variable(name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.match_token(TokenKind::PlusEqual) {
            self.compound_assign(get_op, set_op, arg, OpCode::Add);
        } else if can_assign && self.match_token(TokenKind::MinusEqual) {
            self.compound_assign(get_op, set_op, arg, OpCode::Subtract);
        } else if can_assign && self.match_token(TokenKind::StarEqual) {
            self.compound_assign(get_op, set_op, arg, OpCode::Multiply);
        } else if can_assign && self.match_token(TokenKind::SlashEqual) {
            self.compound_assign(get_op, set_op, arg, OpCode::Divide);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    /// `x op= e` is read, expression, binop, store.
    fn compound_assign(&mut self, get_op: OpCode, set_op: OpCode, arg: u8, op: OpCode) {
        self.emit_op_byte(get_op, arg);
        self.expression();
        self.emit_op(op);
        self.emit_op_byte(set_op, arg);
    }

    /// Store-only resolution, used by element assignment to write the
    /// freshly built array back into its named variable.
    fn emit_named_store(&mut self, name: Token<'src>) {
        let (_, set_op, arg) = self.resolve_variable(name);
        self.emit_op_byte(set_op, arg);
    }

    // ---- expression parsing ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = match self.previous.lexeme.parse() {
            Ok(value) => value,
            Err(_) => {
                self.error("Invalid number literal.");
                return;
            }
        };
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let raw = &lexeme[1..lexeme.len() - 1];
        let text = unescape(raw);
        let string = self.heap.intern(&text);
        self.emit_constant(Value::Obj(string));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => {}
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let precedence = get_rule(operator).precedence;
        self.parse_precedence(precedence.next());
        match operator {
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => {}
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self, _can_assign: bool) {
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.expression();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        self.consume(TokenKind::Colon, "Expect ':' after then branch of ternary.");
        self.expression();
        self.patch_jump(else_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(OpCode::GetProperty, name);
        }
    }

    fn array_literal(&mut self, _can_assign: bool) {
        self.consume(
            TokenKind::RightBracket,
            "Expect ']' after '[' to create an array.",
        );
        // Arrays are functional values; the empty array can live in the
        // constant pool because nothing ever mutates it in place.
        let array = self.heap.alloc(Obj::Array(ObjArray { values: Vec::new() }));
        self.emit_constant(Value::Obj(array));
    }

    fn index(&mut self, can_assign: bool) {
        let target = self.prev_previous;
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetElement);
            if target.kind == TokenKind::Identifier {
                self.emit_named_store(target);
            } else {
                self.error("Invalid assignment target.");
            }
        } else {
            self.emit_op(OpCode::GetElement);
        }
    }

    fn lambda(&mut self, _can_assign: bool) {
        self.begin_function(FunctionKind::Function, None);
        if !self.check(TokenKind::Or) {
            loop {
                self.add_parameter();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::Or, "Expect '|' after parameters.");
        self.consume(TokenKind::EqualEqual, "Expect '=>' after parameters.");
        self.consume(TokenKind::Greater, "Expect '=>' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before lambda body.");
        self.block();
        self.finish_function();
    }

    fn super_(&mut self, _can_assign: bool) {
        let has_superclass = self
            .class_compiler
            .as_ref()
            .map(|class| class.has_superclass);
        match has_superclass {
            None => self.error("Can't use 'super' outside of a class."),
            Some(false) => self.error("Can't use 'super' in a class with no superclass."),
            Some(true) => {}
        }
        if self.match_token(TokenKind::LeftParen) {
            // super(args): invoke the superclass initializer on this.
            let constant = self.identifier_constant("init");
            self.named_variable(Token::synthetic("this"), false);
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(OpCode::SuperInvoke, constant);
            self.emit_byte(arg_count);
            return;
        }
        self.consume(TokenKind::Dot, "Expect '.' or '(' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);
        self.named_variable(Token::synthetic("this"), false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(OpCode::GetSuper, name);
        }
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_compiler.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable(self.previous, false);
        if self.match_token(TokenKind::LeftParen) {
            // this(args): re-invoke init on the receiver.
            let arg_count = self.argument_list();
            let constant = self.identifier_constant("init");
            self.emit_op_byte(OpCode::Invoke, constant);
            self.emit_byte(arg_count);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == MAX_ARITY {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count.min(MAX_ARITY) as u8
    }

    // ---- functions and classes ----

    fn begin_function(&mut self, kind: FunctionKind, name: Option<&str>) {
        let name = name.map(|n| self.heap.intern(n));
        let mut frame = Box::new(FnCompiler::new(kind, name));
        std::mem::swap(&mut frame, &mut self.compiler);
        self.compiler.enclosing = Some(frame);
        self.begin_scope();
    }

    /// Close the innermost function: implicit return, pop the frame, and
    /// emit the closure with its captured-upvalue descriptors.
    fn finish_function(&mut self) {
        self.emit_return();
        let Some(enclosing) = self.compiler.enclosing.take() else {
            return;
        };
        let frame = std::mem::replace(&mut self.compiler, enclosing);
        let upvalues = frame.upvalues;
        let function = self.heap.alloc(Obj::Function(frame.function));
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in &upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn add_parameter(&mut self) {
        self.compiler.function.arity += 1;
        if self.compiler.function.arity > MAX_ARITY {
            self.error_at_current("Can't have more than 255 parameters.");
        }
        let constant = self.parse_variable("Expect parameter name.");
        self.define_variable(constant);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous.lexeme;
        self.begin_function(kind, Some(name));
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.add_parameter();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();
        self.finish_function();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_op_byte(OpCode::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();
        self.emit_op_byte(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.class_compiler = Some(Box::new(ClassCompiler {
            enclosing: self.class_compiler.take(),
            has_superclass: false,
        }));

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // A scope holding the superclass under the name 'super', so
            // method bodies can capture it.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);
            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = self.class_compiler.as_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self
            .class_compiler
            .as_ref()
            .is_some_and(|class| class.has_superclass);
        if has_superclass {
            self.end_scope();
        }
        self.class_compiler = self.class_compiler.take().and_then(|class| class.enclosing);
    }

    // ---- statements ----

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Functions may refer to themselves; initialize the binding before
        // compiling the body.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::PathMarker) {
            self.path_statement();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.compiler.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.compiler.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    /// `___path____ ~<path>`: re-attribute subsequent lines and emit the
    /// runtime path switch.
    fn path_statement(&mut self) {
        self.consume(TokenKind::FilePath, "Expect path name.");
        self.last_line = self.previous.line;
        let path = self.previous.lexeme.trim_start_matches('~').to_string();
        self.path = path.clone();
        let string = self.heap.intern(&path);
        let constant = self.make_constant(Value::Obj(string));
        self.emit_op_byte(OpCode::Constant, constant);
        self.emit_op(OpCode::Path);
    }
}

/// Interpret the `\n \t \r \\ \"` escapes of a string literal body.
/// Unknown escapes are preserved verbatim.
fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use salmon_core::chunk::OpCode;

    fn op(code: OpCode) -> u8 {
        code.into()
    }

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = match compile(source, "test.salmon", &mut heap) {
            Ok(function) => function,
            Err(errors) => panic!("unexpected compile errors: {:?}", errors),
        };
        (heap, function)
    }

    fn compile_err(source: &str) -> Vec<String> {
        let mut heap = Heap::new();
        match compile(source, "test.salmon", &mut heap) {
            Ok(_) => panic!("expected compile error"),
            Err(errors) => errors,
        }
    }

    /// Function constants of a chunk, in pool order.
    fn function_constants(heap: &Heap, function: ObjRef) -> Vec<ObjRef> {
        heap.function(function)
            .chunk
            .constants
            .iter()
            .filter_map(|value| match value {
                Value::Obj(r) => match heap.get(*r) {
                    Obj::Function(_) => Some(*r),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_expression_statement_bytecode() {
        let (heap, function) = compile_ok("1 + 2;");
        let chunk = &heap.function(function).chunk;
        assert_eq!(
            chunk.code,
            vec![
                op(OpCode::Constant),
                0,
                op(OpCode::Constant),
                1,
                op(OpCode::Add),
                op(OpCode::Pop),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
        assert_eq!(chunk.constants[0], Value::Number(1.0));
        assert_eq!(chunk.constants[1], Value::Number(2.0));
    }

    #[test]
    fn test_global_definition_and_compound_assignment() {
        let (heap, function) = compile_ok("var a := 1; a += 2;");
        let chunk = &heap.function(function).chunk;
        assert_eq!(
            chunk.code,
            vec![
                op(OpCode::Constant),
                1, // the number 1.0; constant 0 is the name "a"
                op(OpCode::DefineGlobal),
                0,
                op(OpCode::GetGlobal),
                2, // "a" is re-interned but the pool gets a fresh slot
                op(OpCode::Constant),
                3,
                op(OpCode::Add),
                op(OpCode::SetGlobal),
                2,
                op(OpCode::Pop),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
        // Interning still collapses the two "a" constants to one handle.
        assert_eq!(chunk.constants[0], chunk.constants[2]);
    }

    #[test]
    fn test_locals_use_slots_not_names() {
        let (heap, function) = compile_ok("{ var a := 1; a; }");
        let chunk = &heap.function(function).chunk;
        assert_eq!(
            chunk.code,
            vec![
                op(OpCode::Constant),
                0,
                op(OpCode::GetLocal),
                1,
                op(OpCode::Pop),
                op(OpCode::Pop),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
        // Only the number literal reaches the pool; locals have no name
        // constants.
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn test_assignment_uses_colon_equal() {
        // '=' is equality, so this parses as an expression statement
        // comparing a and 1.
        let (heap, function) = compile_ok("var a := 0; a = 1;");
        let chunk = &heap.function(function).chunk;
        let code = &chunk.code;
        assert!(code.contains(&op(OpCode::Equal)));
        assert!(!code[4..].contains(&op(OpCode::SetGlobal)));
    }

    #[test]
    fn test_closure_emits_upvalue_descriptors() {
        let (heap, script) = compile_ok(
            "fun outer() { var x := 1; fun inner() { return x; } return inner; }",
        );
        let outer = function_constants(&heap, script)[0];
        let inner = function_constants(&heap, outer)[0];
        let inner_fn = heap.function(inner);
        assert_eq!(inner_fn.upvalue_count, 1);
        // inner reads its captured x through upvalue 0.
        assert_eq!(
            inner_fn.chunk.code,
            vec![
                op(OpCode::GetUpvalue),
                0,
                op(OpCode::Return),
                op(OpCode::Nil),
                op(OpCode::Return),
            ]
        );
        // outer's CLOSURE instruction carries (is_local=1, index=1).
        let outer_fn = heap.function(outer);
        let closure_at = outer_fn
            .chunk
            .code
            .iter()
            .position(|&b| b == op(OpCode::Closure))
            .expect("outer must emit a closure");
        assert_eq!(outer_fn.chunk.code[closure_at + 2], 1);
        assert_eq!(outer_fn.chunk.code[closure_at + 3], 1);
    }

    #[test]
    fn test_nested_capture_goes_through_parent_upvalue() {
        let (heap, script) = compile_ok(
            "fun a() { var x := 1; fun b() { fun c() { return x; } } }",
        );
        let a = function_constants(&heap, script)[0];
        let b = function_constants(&heap, a)[0];
        let c = function_constants(&heap, b)[0];
        assert_eq!(heap.function(b).upvalue_count, 1);
        assert_eq!(heap.function(c).upvalue_count, 1);
        // b's closure descriptor for c says is_local=0: it re-exports its
        // own upvalue, not a stack slot.
        let b_fn = heap.function(b);
        let closure_at = b_fn
            .chunk
            .code
            .iter()
            .position(|&byte| byte == op(OpCode::Closure))
            .expect("b must emit a closure");
        assert_eq!(b_fn.chunk.code[closure_at + 2], 0);
        assert_eq!(b_fn.chunk.code[closure_at + 3], 0);
    }

    #[test]
    fn test_initializer_returns_receiver() {
        let (heap, script) = compile_ok("class A { init() { this.x := 1; } }");
        let init = function_constants(&heap, script)[0];
        let chunk = &heap.function(init).chunk;
        let tail = &chunk.code[chunk.code.len() - 3..];
        assert_eq!(tail, [op(OpCode::GetLocal), 0, op(OpCode::Return)]);
    }

    #[test]
    fn test_method_invocation_operands() {
        let (heap, script) = compile_ok("var a := A(); a.greet(1, 2);");
        let chunk = &heap.function(script).chunk;
        let invoke_at = chunk
            .code
            .iter()
            .position(|&byte| byte == op(OpCode::Invoke))
            .expect("expected OP_INVOKE");
        // name constant, then argc
        assert_eq!(chunk.code[invoke_at + 2], 2);
    }

    #[test]
    fn test_lambda_compiles_to_closure() {
        let (heap, script) = compile_ok("var f := | x | => { return x; };");
        let chunk = &heap.function(script).chunk;
        assert!(chunk.code.contains(&op(OpCode::Closure)));
        let lambda = function_constants(&heap, script)[0];
        let lambda_fn = heap.function(lambda);
        assert_eq!(lambda_fn.arity, 1);
        // Lambdas are anonymous.
        assert!(lambda_fn.name.is_none());
    }

    #[test]
    fn test_ternary_requires_colon() {
        let errors = compile_err("var x := true ? 1;");
        assert!(errors[0].contains("Expect ':' after then branch of ternary."));
    }

    #[test]
    fn test_ternary_emits_both_branches() {
        let (heap, script) = compile_ok("var x := false ? 1 : 2;");
        let chunk = &heap.function(script).chunk;
        assert!(chunk.code.contains(&op(OpCode::JumpIfFalse)));
        assert!(chunk.code.contains(&op(OpCode::Jump)));
        assert!(chunk.constants.contains(&Value::Number(1.0)));
        assert!(chunk.constants.contains(&Value::Number(2.0)));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let errors = compile_err("1 := 2;");
        assert_eq!(
            errors,
            vec!["[file test.salmon, line 1] Error at ':=': Invalid assignment target."]
        );
    }

    #[test]
    fn test_read_local_in_own_initializer() {
        let errors = compile_err("{ var a := a; }");
        assert!(errors[0].contains("Can't read local variable in its own initializer."));
    }

    #[test]
    fn test_duplicate_local_declaration() {
        let errors = compile_err("{ var a := 1; var a := 2; }");
        assert!(errors[0].contains("Already a variable with this name in this scope."));
    }

    #[test]
    fn test_return_outside_function() {
        let errors = compile_err("return 1;");
        assert!(errors[0].contains("Can't return from top-level code."));
    }

    #[test]
    fn test_return_value_from_initializer() {
        let errors = compile_err("class A { init() { return 1; } }");
        assert!(errors[0].contains("Can't return a value from an initializer."));
    }

    #[test]
    fn test_this_outside_class() {
        let errors = compile_err("this;");
        assert!(errors[0].contains("Can't use 'this' outside of a class."));
    }

    #[test]
    fn test_super_without_superclass() {
        let errors = compile_err("class A { m() { super.m(); } }");
        assert!(errors[0].contains("Can't use 'super' in a class with no superclass."));
    }

    #[test]
    fn test_class_cannot_inherit_itself() {
        let errors = compile_err("class A < A { }");
        assert!(errors[0].contains("A class can't inherit from itself."));
    }

    #[test]
    fn test_panic_mode_recovers_at_statement_boundary() {
        let errors = compile_err("var := 1; var ok := 2; fun := 3;");
        // One error per broken statement, none swallowed by the good one.
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("Expect variable name."));
        assert!(errors[1].contains("Expect function name."));
    }

    #[test]
    fn test_path_marker_rebases_error_lines() {
        let errors = compile_err("___path____ ~/lib/util.salmon\n\nvar := 1;");
        assert_eq!(
            errors,
            vec!["[file /lib/util.salmon, line 2] Error at ':=': Expect variable name."]
        );
    }

    #[test]
    fn test_path_marker_emits_path_switch() {
        let (heap, script) = compile_ok("___path____ ~/lib/util.salmon\nvar a := 1;");
        let chunk = &heap.function(script).chunk;
        assert_eq!(chunk.code[0], op(OpCode::Constant));
        assert_eq!(chunk.code[2], op(OpCode::Path));
        match chunk.constants[0] {
            Value::Obj(r) => assert_eq!(&*heap.string(r).chars, "/lib/util.salmon"),
            _ => panic!("path constant must be a string"),
        }
    }

    #[test]
    fn test_element_assignment_stores_back() {
        let (heap, script) = compile_ok("var a := []; a[0] := 1;");
        let chunk = &heap.function(script).chunk;
        let set_at = chunk
            .code
            .iter()
            .position(|&byte| byte == op(OpCode::SetElement))
            .expect("expected OP_SET_ELEMENT");
        assert_eq!(chunk.code[set_at + 1], op(OpCode::SetGlobal));
    }

    #[test]
    fn test_string_escapes_interpreted_once() {
        let (heap, script) = compile_ok(r#"var s := "a\n\"b\"";"#);
        let chunk = &heap.function(script).chunk;
        let text = chunk
            .constants
            .iter()
            .find_map(|value| match value {
                Value::Obj(r) => match heap.get(*r) {
                    Obj::String(s) => Some(s.chars.to_string()),
                    _ => None,
                },
                _ => None,
            })
            .filter(|t| t.contains('\n'));
        assert_eq!(text.as_deref(), Some("a\n\"b\""));
    }

    #[test]
    fn test_logical_operators_short_circuit_shape() {
        let (heap, script) = compile_ok("true & false | true;");
        let chunk = &heap.function(script).chunk;
        let jumps = chunk
            .code
            .iter()
            .filter(|&&byte| byte == op(OpCode::JumpIfFalse) || byte == op(OpCode::Jump))
            .count();
        // '&' contributes one conditional jump, '|' one conditional plus
        // one unconditional.
        assert_eq!(jumps, 3);
    }
}
