use std::collections::HashMap;

use crate::{
    bytecode::{
        chunk::{Chunk, ChunkError, Constant, FunctionId},
        compile_error::{CompileError, CompileErrorKind, CompileErrors},
        op::OpCode,
        program::{Function, Program},
    },
    frontend::{
        lexer::{Lexer, Span, Spanned},
        token::Token,
    },
    runtime::natives,
};

/// Lex and compile a whole source text.
pub fn compile(source: &str) -> Result<Program, CompileErrors> {
    let tokens = Lexer::new(source).tokenize_clean()?;
    Compiler::new(tokens).compile()
}

/// Deepest nesting of blocks and subexpressions the compiler accepts.
pub const MAX_NESTING: usize = 256;

/// Binding power, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    None,
    Assign,
    Or,
    And,
    Compare,
    Term,
    Factor,
    Bit,
    Unary,
    Literal,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assign,
            Assign => Or,
            Or => And,
            And => Compare,
            Compare => Term,
            Term => Factor,
            Factor => Bit,
            Bit => Unary,
            Unary | Literal => Literal,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool) -> Result<(), CompileError>;

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence) -> Self {
        Self {
            prefix,
            infix,
            precedence,
        }
    }
}

/// Static Pratt table: prefix action, infix action, and binding power per token.
fn rule(token: &Token) -> ParseRule {
    use Precedence as P;
    match token {
        Token::LParen => ParseRule::new(Some(Compiler::grouping), None, P::None),
        Token::Minus => ParseRule::new(Some(Compiler::unary), Some(Compiler::binary), P::Term),
        Token::Plus => ParseRule::new(None, Some(Compiler::binary), P::Term),
        Token::Star | Token::Slash => ParseRule::new(None, Some(Compiler::binary), P::Factor),
        Token::Amp | Token::Pipe | Token::Caret | Token::ShiftLeft | Token::ShiftRight => {
            ParseRule::new(None, Some(Compiler::binary), P::Bit)
        }
        Token::Bang | Token::Tilde => ParseRule::new(Some(Compiler::unary), None, P::None),
        Token::EqEq | Token::NotEq | Token::Lt | Token::Gt | Token::LtEq | Token::GtEq => {
            ParseRule::new(None, Some(Compiler::binary), P::Compare)
        }
        Token::And => ParseRule::new(None, Some(Compiler::and), P::And),
        Token::Or => ParseRule::new(None, Some(Compiler::or), P::Or),
        Token::Number(_) => ParseRule::new(Some(Compiler::number), None, P::None),
        Token::String(_) => ParseRule::new(Some(Compiler::string), None, P::None),
        Token::True | Token::False | Token::None => {
            ParseRule::new(Some(Compiler::literal), None, P::None)
        }
        Token::Ident(_) => ParseRule::new(Some(Compiler::variable), None, P::None),
        _ => ParseRule::new(None, None, P::None),
    }
}

/// Opcodes for an assignment-family token: (global form, local form).
fn assignment_ops(token: &Token) -> Option<(OpCode, OpCode)> {
    use OpCode::*;
    let ops = match token {
        Token::Assign => (SetGlobal, SetLocal),
        Token::PlusPlus => (IncGlobal, IncLocal),
        Token::MinusMinus => (DecGlobal, DecLocal),
        Token::PlusAssign => (AddAssignGlobal, AddAssignLocal),
        Token::MinusAssign => (SubAssignGlobal, SubAssignLocal),
        Token::StarAssign => (MultiplyAssignGlobal, MultiplyAssignLocal),
        Token::SlashAssign => (DivideAssignGlobal, DivideAssignLocal),
        Token::AmpAssign => (BitAndAssignGlobal, BitAndAssignLocal),
        Token::PipeAssign => (BitOrAssignGlobal, BitOrAssignLocal),
        Token::CaretAssign => (BitXorAssignGlobal, BitXorAssignLocal),
        Token::ShiftLeftAssign => (ShiftLeftAssignGlobal, ShiftLeftAssignLocal),
        Token::ShiftRightAssign => (ShiftRightAssignGlobal, ShiftRightAssignLocal),
        _ => return Option::None,
    };
    Some(ops)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Script,
    Runnable,
}

#[derive(Debug, Clone)]
struct Local {
    /// Empty for hidden slots such as repeat counters.
    name: String,
    depth: usize,
}

enum Target {
    Global(u8),
    Local(u8),
}

enum Callee {
    Runnable(usize),
    Native(usize),
}

pub struct Compiler {
    tokens: Vec<Spanned>,
    current: usize,

    /// Output: `functions[0]` is the script.
    functions: Vec<Function>,
    current_fn: FunctionId,
    mode: Mode,

    /// Block nesting inside the current runnable.
    scope_depth: usize,
    locals: Vec<Local>,

    /// Runnables declared so far, by name.
    runnables: HashMap<String, FunctionId>,

    /// Current statement and expression nesting.
    nesting: usize,

    errors: Vec<CompileError>,
}

impl Compiler {
    pub fn new(mut tokens: Vec<Spanned>) -> Self {
        if !matches!(tokens.last(), Some(Spanned { token: Token::Eof, .. })) {
            let span = tokens.last().map_or(Span { line: 1, col: 1 }, |t| t.span);
            tokens.push(Spanned {
                token: Token::Eof,
                span,
            });
        }
        Self {
            tokens,
            current: 0,
            functions: vec![Function::new("<script>", None)],
            current_fn: FunctionId::SCRIPT,
            mode: Mode::Script,
            scope_depth: 0,
            locals: Vec::new(),
            runnables: HashMap::new(),
            nesting: 0,
            errors: Vec::new(),
        }
    }

    pub fn compile(mut self) -> Result<Program, CompileErrors> {
        while !self.check(&Token::Eof) {
            self.declaration();
        }
        if self.errors.is_empty() {
            Ok(Program {
                functions: self.functions,
            })
        } else {
            Err(CompileErrors(self.errors))
        }
    }

    // =========================================================================
    // Token cursor
    // =========================================================================

    fn peek(&self) -> &Spanned {
        &self.tokens[self.current]
    }

    fn previous(&self) -> &Spanned {
        &self.tokens[self.current.saturating_sub(1)]
    }

    fn advance(&mut self) {
        if !matches!(self.peek().token, Token::Eof) {
            self.current += 1;
        }
    }

    fn check(&self, token: &Token) -> bool {
        &self.peek().token == token
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, token: &Token, message: &str) -> Result<(), CompileError> {
        if self.match_token(token) {
            Ok(())
        } else {
            Err(CompileError::unexpected(self.peek(), message))
        }
    }

    fn consume_ident(&mut self, message: &str) -> Result<String, CompileError> {
        match &self.peek().token {
            Token::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(CompileError::unexpected(self.peek(), message)),
        }
    }

    fn error_here(&self, kind: CompileErrorKind, message: impl Into<String>) -> CompileError {
        CompileError::new(kind, self.previous(), message)
    }

    /// Skip to the start of the next line.
    fn synchronize(&mut self) {
        loop {
            match self.peek().token {
                Token::Eof => return,
                Token::Newline => {
                    self.advance();
                    return;
                }
                _ => self.advance(),
            }
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.functions[self.current_fn.0].chunk
    }

    fn emit(&mut self, op: OpCode) {
        self.chunk().append(op as u8);
    }

    fn emit_with(&mut self, op: OpCode, operand: u8) {
        self.chunk().append2(op as u8, operand);
    }

    fn chunk_result<T>(&self, result: Result<T, ChunkError>) -> Result<T, CompileError> {
        result.map_err(|e| CompileError::from_chunk(self.previous(), e))
    }

    fn make_constant(&mut self, constant: Constant) -> Result<u8, CompileError> {
        let result = self.chunk().add_constant(constant);
        self.chunk_result(result)
    }

    fn identifier_constant(&mut self, name: &str) -> Result<u8, CompileError> {
        let result = self.chunk().add_string(name);
        self.chunk_result(result)
    }

    /// Emit a forward jump with a placeholder distance; returns the operand offset.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op);
        self.chunk().append2(0xff, 0xff);
        self.chunk().len() - 2
    }

    fn patch_jump(&mut self, at: usize) -> Result<(), CompileError> {
        let distance = self.chunk().len() - (at + 2);
        let distance = u16::try_from(distance).map_err(|_| {
            self.error_here(CompileErrorKind::JumpOverflow, "too much code to jump over")
        })?;
        self.chunk().patch_jump(at, distance);
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize) -> Result<(), CompileError> {
        self.emit(OpCode::Loop);
        let distance = self.chunk().len() + 2 - loop_start;
        let distance = u16::try_from(distance)
            .map_err(|_| self.error_here(CompileErrorKind::JumpOverflow, "loop body is too large"))?;
        let [hi, lo] = distance.to_be_bytes();
        self.chunk().append2(hi, lo);
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Run `f` one nesting level deeper.
    fn nested<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, CompileError>,
    ) -> Result<T, CompileError> {
        if self.nesting >= MAX_NESTING {
            return Err(CompileError::new(
                CompileErrorKind::NestingTooDeep,
                self.peek(),
                format!("nesting deeper than {} levels", MAX_NESTING),
            ));
        }
        self.nesting += 1;
        let result = f(self);
        self.nesting -= 1;
        result
    }

    fn declaration(&mut self) {
        if let Err(err) = self.nested(Self::statement) {
            self.errors.push(err);
            self.synchronize();
        }
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        match self.peek().token.clone() {
            Token::Newline => {
                self.advance();
                self.emit(OpCode::Newline);
                Ok(())
            }
            Token::Rat => {
                self.advance();
                self.var_declaration()
            }
            Token::Runnable => {
                self.advance();
                self.runnable_declaration()
            }
            Token::If => {
                self.advance();
                self.if_statement()
            }
            Token::While => {
                self.advance();
                self.while_statement()
            }
            Token::Repeat => {
                self.advance();
                self.repeat_statement()
            }
            Token::Return => {
                self.advance();
                self.return_statement()
            }
            t if t.is_block_end() => Err(CompileError::unexpected(
                self.peek(),
                format!("'{}' without an open block", t),
            )),
            _ => {
                self.expression()?;
                self.emit(OpCode::Pop);
                self.end_of_line()
            }
        }
    }

    /// Every statement ends at a newline (emitted as a line marker) or at EOF.
    fn end_of_line(&mut self) -> Result<(), CompileError> {
        if self.match_token(&Token::Newline) {
            self.emit(OpCode::Newline);
            Ok(())
        } else if self.check(&Token::Eof) {
            Ok(())
        } else {
            Err(CompileError::unexpected(
                self.peek(),
                "Expected end of line after statement",
            ))
        }
    }

    fn var_declaration(&mut self) -> Result<(), CompileError> {
        let name = self.consume_ident("Expected variable name after 'rat'")?;
        let name_token = self.previous().clone();

        if self.mode == Mode::Runnable {
            let redeclared = self
                .locals
                .iter()
                .rev()
                .take_while(|l| l.depth == self.scope_depth)
                .any(|l| l.name == name);
            if redeclared {
                return Err(CompileError::new(
                    CompileErrorKind::RedeclaredIdentifier,
                    &name_token,
                    format!("'{}' is already declared in this scope", name),
                ));
            }
        }

        if self.match_token(&Token::Assign) {
            self.expression()?;
        } else {
            self.emit(OpCode::None);
        }

        match self.mode {
            Mode::Script => {
                let index = self.identifier_constant(&name)?;
                self.emit_with(OpCode::DefineGlobal, index);
            }
            // The initializer's stack slot becomes the local.
            Mode::Runnable => self.add_local(name, &name_token)?,
        }
        self.end_of_line()
    }

    fn add_local(&mut self, name: String, at: &Spanned) -> Result<(), CompileError> {
        if self.locals.len() > u8::MAX as usize {
            return Err(CompileError::internal(at, "too many local variables in one runnable"));
        }
        let display = if name.is_empty() { "(repeat)" } else { &name };
        self.functions[self.current_fn.0]
            .locals
            .push(display.to_string());
        self.locals.push(Local {
            name,
            depth: self.scope_depth,
        });
        Ok(())
    }

    fn resolve_local(&self, name: &str) -> Option<u8> {
        if self.mode != Mode::Runnable {
            return None;
        }
        self.locals
            .iter()
            .rposition(|l| l.name == name)
            .map(|slot| slot as u8)
    }

    fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    /// Close a block, popping the locals it declared.
    fn end_scope(&mut self) {
        self.scope_depth -= 1;
        while self
            .locals
            .last()
            .is_some_and(|l| l.depth > self.scope_depth)
        {
            self.locals.pop();
            self.emit(OpCode::Pop);
        }
    }

    /// Statements up to (not including) one of `closers`.
    fn block(&mut self, opener: &str, closers: &[Token]) -> Result<(), CompileError> {
        self.begin_scope();
        while !closers.iter().any(|c| self.check(c)) && !self.check(&Token::Eof) {
            self.declaration();
        }
        self.end_scope();

        if self.check(&Token::Eof) {
            let closer = closers.last().map(|c| c.to_string()).unwrap_or_default();
            return Err(CompileError::unclosed(self.peek(), opener, &closer));
        }
        Ok(())
    }

    /// `:` then the end of the header line.
    fn block_header(&mut self, what: &str) -> Result<(), CompileError> {
        self.consume(&Token::Colon, &format!("Expected ':' after {}", what))
    }

    fn if_statement(&mut self) -> Result<(), CompileError> {
        self.expression()?;
        self.block_header("condition")?;
        self.end_of_line()?;

        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.block("if", &[Token::Else, Token::EndIf])?;
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump)?;
        self.emit(OpCode::Pop);

        if self.match_token(&Token::Else) {
            self.block_header("'else'")?;
            self.end_of_line()?;
            self.block("else", &[Token::EndIf])?;
        }
        self.consume(&Token::EndIf, "Expected 'endif'")?;
        self.patch_jump(end_jump)?;
        self.end_of_line()
    }

    fn while_statement(&mut self) -> Result<(), CompileError> {
        let loop_start = self.chunk().len();
        self.expression()?;
        self.block_header("condition")?;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.end_of_line()?;

        self.block("while", &[Token::EndWhile])?;
        self.consume(&Token::EndWhile, "Expected 'endwhile'")?;

        self.emit_loop(loop_start)?;
        self.patch_jump(exit_jump)?;
        self.emit(OpCode::Pop);
        self.end_of_line()
    }

    fn repeat_statement(&mut self) -> Result<(), CompileError> {
        self.expression()?;
        self.block_header("repeat count")?;
        self.emit(OpCode::Repeat);
        self.end_of_line()?;

        // Inside a runnable the counter sits where the next local would.
        let hidden = self.mode == Mode::Runnable;
        if hidden {
            let at = self.previous().clone();
            self.begin_scope();
            self.add_local(String::new(), &at)?;
        }

        let loop_start = self.chunk().len();
        let body = self.block("repeat", &[Token::EndRepeat]);

        // END_REPEAT pops the counter itself.
        if hidden {
            self.locals.pop();
            self.scope_depth -= 1;
        }
        body?;

        self.consume(&Token::EndRepeat, "Expected 'endrepeat'")?;
        self.emit(OpCode::EndRepeat);
        self.emit_loop(loop_start)?;
        self.end_of_line()
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        if self.mode != Mode::Runnable {
            return Err(CompileError::unexpected(
                self.previous(),
                "Can't return from top-level code",
            ));
        }
        if self.check(&Token::Newline) || self.check(&Token::Eof) {
            self.emit(OpCode::None);
        } else {
            self.expression()?;
        }
        self.emit(OpCode::Return);
        self.end_of_line()
    }

    fn runnable_declaration(&mut self) -> Result<(), CompileError> {
        if self.mode == Mode::Runnable {
            return Err(CompileError::new(
                CompileErrorKind::NestedRunnable,
                self.previous(),
                "runnables can't be declared inside other runnables",
            ));
        }

        let name = self.consume_ident("Expected runnable name")?;
        let name_token = self.previous().clone();
        if self.runnables.contains_key(&name) || natives::lookup(&name).is_some() {
            return Err(CompileError::new(
                CompileErrorKind::RedeclaredIdentifier,
                &name_token,
                format!("'{}' is already declared", name),
            ));
        }

        self.consume(&Token::LParen, "Expected '(' after runnable name")?;
        let mut params: Vec<(String, Spanned)> = Vec::new();
        if !self.check(&Token::RParen) {
            loop {
                let param = self.consume_ident("Expected parameter name")?;
                let at = self.previous().clone();
                if params.iter().any(|(p, _)| *p == param) {
                    return Err(CompileError::new(
                        CompileErrorKind::RedeclaredIdentifier,
                        &at,
                        format!("duplicate parameter '{}'", param),
                    ));
                }
                params.push((param, at));
                if !self.match_token(&Token::Comma) {
                    break;
                }
            }
        }
        self.consume(&Token::RParen, "Expected ')' after parameters")?;
        self.block_header("runnable signature")?;

        let id = FunctionId(self.functions.len());
        let mut function = Function::new(name.clone(), Some(self.current_fn));
        function.arity = params.len();
        self.functions.push(function);
        // Registered before the body so it can call itself.
        self.runnables.insert(name, id);

        let saved_fn = std::mem::replace(&mut self.current_fn, id);
        let saved_mode = std::mem::replace(&mut self.mode, Mode::Runnable);
        let saved_depth = std::mem::replace(&mut self.scope_depth, 1);
        let saved_locals = std::mem::take(&mut self.locals);

        let body = self.runnable_body(params);

        self.current_fn = saved_fn;
        self.mode = saved_mode;
        self.scope_depth = saved_depth;
        self.locals = saved_locals;
        body?;

        let newlines = self.functions[id.0]
            .chunk
            .instructions()
            .filter_map(Result::ok)
            .filter(|i| i.op == OpCode::Newline)
            .count();
        let line_count = u16::try_from(newlines).map_err(|_| {
            CompileError::new(
                CompileErrorKind::JumpOverflow,
                &name_token,
                "runnable body has too many lines",
            )
        })?;
        self.functions[id.0].line_count = line_count;

        let index = self.make_constant(Constant::Runnable(id))?;
        let [hi, lo] = line_count.to_be_bytes();
        self.emit_with(OpCode::DefineRunnable, index);
        self.chunk().append2(hi, lo);
        self.end_of_line()
    }

    fn runnable_body(&mut self, params: Vec<(String, Spanned)>) -> Result<(), CompileError> {
        for (param, at) in params {
            self.add_local(param, &at)?;
        }
        self.end_of_line()?;

        while !self.check(&Token::EndRunnable) && !self.check(&Token::Eof) {
            self.declaration();
        }
        if self.check(&Token::Eof) {
            return Err(CompileError::unclosed(self.peek(), "runnable", "endrunnable"));
        }
        self.advance();

        self.emit(OpCode::None);
        self.emit(OpCode::Return);
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self) -> Result<(), CompileError> {
        self.parse_precedence(Precedence::Assign)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<(), CompileError> {
        self.nested(|c| c.parse_operand(precedence))
    }

    fn parse_operand(&mut self, precedence: Precedence) -> Result<(), CompileError> {
        self.advance();
        let Some(prefix) = rule(&self.previous().token).prefix else {
            return Err(CompileError::unexpected(self.previous(), "Expected expression"));
        };
        let can_assign = precedence <= Precedence::Assign;
        prefix(self, can_assign)?;

        while precedence <= rule(&self.peek().token).precedence {
            self.advance();
            let Some(infix) = rule(&self.previous().token).infix else {
                return Err(CompileError::internal(self.previous(), "missing infix rule"));
            };
            infix(self, can_assign)?;
        }

        if assignment_ops(&self.peek().token).is_some() {
            return Err(CompileError::unexpected(self.peek(), "Invalid assignment target"));
        }
        Ok(())
    }

    fn grouping(&mut self, _can_assign: bool) -> Result<(), CompileError> {
        self.expression()?;
        self.consume(&Token::RParen, "Expected ')' after expression")
    }

    fn number(&mut self, _can_assign: bool) -> Result<(), CompileError> {
        let Token::Number(lexeme) = &self.previous().token else {
            return Err(CompileError::internal(self.previous(), "number rule on non-number"));
        };
        let lexeme = lexeme.clone();
        let result = self.chunk().add_number(&lexeme);
        let index = self.chunk_result(result)?;
        self.emit_with(OpCode::Constant, index);
        Ok(())
    }

    fn string(&mut self, _can_assign: bool) -> Result<(), CompileError> {
        let Token::String(text) = &self.previous().token else {
            return Err(CompileError::internal(self.previous(), "string rule on non-string"));
        };
        let text = text.clone();
        let index = self.identifier_constant(&text)?;
        self.emit_with(OpCode::Constant, index);
        Ok(())
    }

    fn literal(&mut self, _can_assign: bool) -> Result<(), CompileError> {
        match self.previous().token {
            Token::True => self.emit(OpCode::True),
            Token::False => self.emit(OpCode::False),
            _ => self.emit(OpCode::None),
        }
        Ok(())
    }

    fn unary(&mut self, _can_assign: bool) -> Result<(), CompileError> {
        let operator = self.previous().token.clone();
        self.parse_precedence(Precedence::Unary)?;
        match operator {
            Token::Minus => self.emit(OpCode::Negate),
            Token::Bang => self.emit(OpCode::Not),
            Token::Tilde => self.emit(OpCode::BitNot),
            _ => return Err(CompileError::internal(self.previous(), "unknown unary operator")),
        }
        Ok(())
    }

    fn binary(&mut self, _can_assign: bool) -> Result<(), CompileError> {
        let operator = self.previous().token.clone();
        self.parse_precedence(rule(&operator).precedence.next())?;

        match operator {
            Token::Plus => self.emit(OpCode::Add),
            Token::Minus => self.emit(OpCode::Sub),
            Token::Star => self.emit(OpCode::Multiply),
            Token::Slash => self.emit(OpCode::Divide),
            Token::Amp => self.emit(OpCode::BitAnd),
            Token::Pipe => self.emit(OpCode::BitOr),
            Token::Caret => self.emit(OpCode::BitXor),
            Token::ShiftLeft => self.emit(OpCode::ShiftLeft),
            Token::ShiftRight => self.emit(OpCode::ShiftRight),
            Token::EqEq => self.emit(OpCode::Equals),
            Token::NotEq => {
                self.emit(OpCode::Equals);
                self.emit(OpCode::Not);
            }
            Token::Lt => self.emit(OpCode::Less),
            Token::Gt => self.emit(OpCode::Greater),
            Token::LtEq => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            Token::GtEq => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            _ => return Err(CompileError::internal(self.previous(), "unknown binary operator")),
        }
        Ok(())
    }

    fn and(&mut self, _can_assign: bool) -> Result<(), CompileError> {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump)
    }

    fn or(&mut self, _can_assign: bool) -> Result<(), CompileError> {
        let end_jump = self.emit_jump(OpCode::JumpIfTrue);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump)
    }

    fn variable(&mut self, can_assign: bool) -> Result<(), CompileError> {
        let Token::Ident(name) = &self.previous().token else {
            return Err(CompileError::internal(self.previous(), "variable rule on non-identifier"));
        };
        let name = name.clone();

        if self.check(&Token::LParen) {
            return self.call(name);
        }

        let target = match self.resolve_local(&name) {
            Some(slot) => Target::Local(slot),
            None => Target::Global(self.identifier_constant(&name)?),
        };

        let assignment = if can_assign {
            assignment_ops(&self.peek().token)
        } else {
            None
        };
        let Some((global_op, local_op)) = assignment else {
            match target {
                Target::Local(slot) => self.emit_with(OpCode::GetLocal, slot),
                Target::Global(index) => self.emit_with(OpCode::GetGlobal, index),
            }
            return Ok(());
        };

        let operator = self.peek().token.clone();
        self.advance();
        if !matches!(operator, Token::PlusPlus | Token::MinusMinus) {
            self.expression()?;
        }
        match target {
            Target::Local(slot) => self.emit_with(local_op, slot),
            Target::Global(index) => self.emit_with(global_op, index),
        }
        Ok(())
    }

    fn call(&mut self, name: String) -> Result<(), CompileError> {
        let name_token = self.previous().clone();
        let callee = if let Some(id) = self.runnables.get(&name) {
            Callee::Runnable(self.functions[id.0].arity)
        } else if let Some(id) = natives::lookup(&name) {
            Callee::Native(natives::NATIVES[id.0].arity)
        } else {
            return Err(CompileError::new(
                CompileErrorKind::UndefinedRunnable,
                &name_token,
                format!("'{}' is not a declared runnable", name),
            ));
        };

        let index = self.identifier_constant(&name)?;
        self.emit_with(OpCode::GetGlobal, index);

        self.consume(&Token::LParen, "Expected '(' after runnable name")?;
        let mut argc = 0usize;
        if !self.check(&Token::RParen) {
            loop {
                self.expression()?;
                argc += 1;
                if !self.match_token(&Token::Comma) {
                    break;
                }
            }
        }
        self.consume(&Token::RParen, "Expected ')' after arguments")?;

        let arity = match callee {
            Callee::Runnable(arity) | Callee::Native(arity) => arity,
        };
        if argc != arity {
            return Err(CompileError::new(
                CompileErrorKind::UndefinedRunnable,
                &name_token,
                format!("'{}' expects {} argument(s) but got {}", name, arity, argc),
            ));
        }

        match callee {
            Callee::Runnable(_) => self.emit_with(OpCode::Call, index),
            Callee::Native(_) => {
                self.emit_with(OpCode::CallNative, index);
                self.chunk().append(argc as u8);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::verify::verify;
    use pretty_assertions::assert_eq;

    fn ops(chunk: &Chunk) -> Vec<OpCode> {
        chunk.instructions().map(|i| i.unwrap().op).collect()
    }

    fn compile_ok(source: &str) -> Program {
        let program = compile(source).unwrap_or_else(|e| panic!("compile failed:\n{}", e));
        verify(&program).unwrap();
        program
    }

    fn compile_err(source: &str) -> CompileErrors {
        match compile(source) {
            Ok(_) => panic!("expected compile error for {:?}", source),
            Err(e) => e,
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    #[test]
    fn test_global_declaration() {
        let program = compile_ok("rat x = 3");
        let chunk = &program.script().chunk;
        assert_eq!(ops(chunk), vec![OpCode::Constant, OpCode::DefineGlobal]);
        assert_eq!(
            chunk.constants,
            vec![Constant::Number(3.0), Constant::String("x".into())]
        );
    }

    #[test]
    fn test_declaration_without_initializer() {
        let program = compile_ok("rat y");
        assert_eq!(
            ops(&program.script().chunk),
            vec![OpCode::None, OpCode::DefineGlobal]
        );
    }

    #[test]
    fn test_precedence() {
        // 1 + 2 * 3 & 1 parses as 1 + (2 * (3 & 1))
        let program = compile_ok("1 + 2 * 3 & 1");
        assert_eq!(
            ops(&program.script().chunk),
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Constant,
                OpCode::BitAnd,
                OpCode::Multiply,
                OpCode::Add,
                OpCode::Pop,
            ]
        );
    }

    #[test]
    fn test_left_associative() {
        let program = compile_ok("8 - 4 - 2");
        assert_eq!(
            ops(&program.script().chunk),
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Sub,
                OpCode::Constant,
                OpCode::Sub,
                OpCode::Pop,
            ]
        );
    }

    #[test]
    fn test_comparison_desugaring() {
        let program = compile_ok("1 <= 2");
        assert_eq!(
            ops(&program.script().chunk),
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Greater,
                OpCode::Not,
                OpCode::Pop,
            ]
        );
    }

    #[test]
    fn test_unary_operators() {
        let program = compile_ok("-1\n!true\n~2");
        assert_eq!(
            ops(&program.script().chunk),
            vec![
                OpCode::Constant,
                OpCode::Negate,
                OpCode::Pop,
                OpCode::Newline,
                OpCode::True,
                OpCode::Not,
                OpCode::Pop,
                OpCode::Newline,
                OpCode::Constant,
                OpCode::BitNot,
                OpCode::Pop,
            ]
        );
    }

    #[test]
    fn test_and_or_leave_one_value() {
        let program = compile_ok("true and false or true");
        assert_eq!(
            ops(&program.script().chunk),
            vec![
                OpCode::True,
                OpCode::JumpIfFalse,
                OpCode::Pop,
                OpCode::False,
                OpCode::JumpIfTrue,
                OpCode::Pop,
                OpCode::True,
                OpCode::Pop,
            ]
        );
    }

    #[test]
    fn test_assignment_family_on_globals() {
        let program = compile_ok("rat x = 1\nx = 2\nx++\nx--\nx += 1\nx <<= 2");
        let chunk = &program.script().chunk;
        let emitted: Vec<_> = ops(chunk)
            .into_iter()
            .filter(|op| !matches!(op, OpCode::Newline | OpCode::Constant | OpCode::Pop))
            .collect();
        assert_eq!(
            emitted,
            vec![
                OpCode::DefineGlobal,
                OpCode::SetGlobal,
                OpCode::IncGlobal,
                OpCode::DecGlobal,
                OpCode::AddAssignGlobal,
                OpCode::ShiftLeftAssignGlobal,
            ]
        );
    }

    #[test]
    fn test_invalid_assignment_target() {
        let errors = compile_err("rat a = 1\nrat b = 2\na + b = 9");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.0[0].kind, CompileErrorKind::UnexpectedToken);
        assert_eq!(errors.0[0].line, 3);
        assert!(errors.0[0].message.contains("Invalid assignment target"));
    }

    #[test]
    fn test_missing_operand_is_expected_expression() {
        let errors = compile_err("print(1 +)");
        assert_eq!(errors.0[0].kind, CompileErrorKind::UnexpectedToken);
        assert_eq!(errors.0[0].message, "Expected expression");
        assert_eq!(errors.0[0].lexeme, ")");
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    #[test]
    fn test_if_else_pops_condition_once_per_path() {
        let program = compile_ok("if true:\n1\nelse:\n2\nendif");
        let chunk = &program.script().chunk;
        assert_eq!(
            ops(chunk),
            vec![
                OpCode::True,
                OpCode::Newline,
                OpCode::JumpIfFalse,
                OpCode::Pop,
                OpCode::Constant,
                OpCode::Pop,
                OpCode::Newline,
                OpCode::Jump,
                OpCode::Pop,
                OpCode::Newline,
                OpCode::Constant,
                OpCode::Pop,
                OpCode::Newline,
            ]
        );
    }

    #[test]
    fn test_jumps_land_on_block_starts() {
        let program = compile_ok("if true:\n1\nelse:\n2\nendif");
        let chunk = &program.script().chunk;
        let instrs: Vec<_> = chunk.instructions().map(Result::unwrap).collect();
        let jif = instrs.iter().find(|i| i.op == OpCode::JumpIfFalse).unwrap();
        let jmp = instrs.iter().find(|i| i.op == OpCode::Jump).unwrap();

        // Else path starts with its own POP
        let else_start = jif.jump_target().unwrap();
        assert_eq!(chunk.code[else_start], OpCode::Pop as u8);
        assert_eq!(else_start, jmp.next_offset());
        // Then path skips to the end
        assert_eq!(jmp.jump_target(), Some(chunk.len()));
    }

    #[test]
    fn test_while_loops_back_to_condition() {
        let program = compile_ok("rat i = 0\nwhile i < 3:\ni++\nendwhile");
        let chunk = &program.script().chunk;
        let instrs: Vec<_> = chunk.instructions().map(Result::unwrap).collect();
        let lp = instrs.iter().find(|i| i.op == OpCode::Loop).unwrap();
        let cond_start = instrs
            .iter()
            .find(|i| i.op == OpCode::GetGlobal)
            .unwrap()
            .offset;
        assert_eq!(lp.jump_target(), Some(cond_start));

        let exit = instrs.iter().find(|i| i.op == OpCode::JumpIfFalse).unwrap();
        let target = exit.jump_target().unwrap();
        assert_eq!(target, lp.next_offset());
        assert_eq!(chunk.code[target], OpCode::Pop as u8);
    }

    #[test]
    fn test_repeat_structure() {
        let program = compile_ok("repeat 3:\nprint(\"hi\")\nendrepeat");
        let chunk = &program.script().chunk;
        let instrs: Vec<_> = chunk.instructions().map(Result::unwrap).collect();
        let repeat = instrs.iter().find(|i| i.op == OpCode::Repeat).unwrap();
        let end = instrs.iter().position(|i| i.op == OpCode::EndRepeat).unwrap();
        let lp = &instrs[end + 1];
        assert_eq!(lp.op, OpCode::Loop);
        // Body starts after the header's line marker
        assert_eq!(lp.jump_target(), Some(repeat.next_offset() + 1));
    }

    #[test]
    fn test_block_locals_are_popped() {
        let program = compile_ok(
            "runnable f(a):\nif a:\nrat b = 1\nrat c = 2\nendif\nreturn a\nendrunnable",
        );
        let ops = ops(&program.functions[1].chunk);
        let jump = ops.iter().position(|op| *op == OpCode::Jump).unwrap();
        assert_eq!(
            &ops[jump - 3..jump],
            &[OpCode::Newline, OpCode::Pop, OpCode::Pop]
        );
    }

    // =========================================================================
    // Runnables
    // =========================================================================

    #[test]
    fn test_runnable_layout() {
        let program = compile_ok("rat x = 1\nrunnable add(a, b):\nreturn a + b\nendrunnable\nadd(1, 2)");
        assert_eq!(program.functions.len(), 2);
        let f = &program.functions[1];
        assert_eq!(f.name, "add");
        assert_eq!(f.arity, 2);
        assert_eq!(f.locals, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(f.enclosing, Some(FunctionId::SCRIPT));
        assert_eq!(f.line_count, 2);
        assert_eq!(
            ops(&f.chunk),
            vec![
                OpCode::Newline,
                OpCode::GetLocal,
                OpCode::GetLocal,
                OpCode::Add,
                OpCode::Return,
                OpCode::Newline,
                OpCode::None,
                OpCode::Return,
            ]
        );

        let script = &program.script().chunk;
        assert!(ops(script).contains(&OpCode::DefineRunnable));
        assert!(ops(script).contains(&OpCode::Call));
        assert_eq!(script.runnable_start_line(FunctionId(1)), Some(2));
        assert_eq!(program.start_line(FunctionId(1)), 2);
    }

    #[test]
    fn test_recursive_call_resolves() {
        compile_ok(
            "runnable fact(n):\nif n < 2:\nreturn 1\nendif\nreturn n * fact(n - 1)\nendrunnable\nprint(fact(5))",
        );
    }

    #[test]
    fn test_wrong_arity_is_undefined_runnable() {
        let errors = compile_err("runnable f(a):\nreturn a\nendrunnable\nf(1, 2)");
        assert_eq!(errors.0[0].kind, CompileErrorKind::UndefinedRunnable);
        assert_eq!(errors.0[0].line, 4);
    }

    #[test]
    fn test_unknown_callee() {
        let errors = compile_err("nope(1)");
        assert_eq!(errors.0[0].kind, CompileErrorKind::UndefinedRunnable);
    }

    #[test]
    fn test_native_call_encoding() {
        let program = compile_ok("print(1)");
        let chunk = &program.script().chunk;
        let call = chunk
            .instructions()
            .map(Result::unwrap)
            .find(|i| i.op == OpCode::CallNative)
            .unwrap();
        assert_eq!(
            chunk.read_constant(call.byte(0)),
            Some(&Constant::String("print".into()))
        );
        assert_eq!(call.byte(1), 1);
    }

    #[test]
    fn test_nested_runnable_rejected() {
        let errors = compile_err("runnable f():\nrunnable g():\nendrunnable\nendrunnable");
        assert!(errors.iter().any(|e| e.kind == CompileErrorKind::NestedRunnable));
    }

    #[test]
    fn test_redeclared_local() {
        let errors = compile_err("runnable f(a):\nrat a = 1\nendrunnable");
        assert_eq!(errors.0[0].kind, CompileErrorKind::RedeclaredIdentifier);
    }

    #[test]
    fn test_shadowing_in_inner_block_allowed() {
        compile_ok("runnable f(a):\nif true:\nrat a = 2\nendif\nreturn a\nendrunnable");
    }

    #[test]
    fn test_return_at_top_level() {
        let errors = compile_err("return 1");
        assert_eq!(errors.0[0].kind, CompileErrorKind::UnexpectedToken);
    }

    #[test]
    fn test_repeat_counter_keeps_slots_aligned() {
        let program = compile_ok(
            "runnable f(a):\nrepeat 2:\nrat b = a\nb += 1\nendrepeat\nreturn a\nendrunnable",
        );
        let f = &program.functions[1];
        let slots: Vec<u8> = f
            .chunk
            .instructions()
            .map(Result::unwrap)
            .filter(|i| matches!(i.op, OpCode::AddAssignLocal))
            .map(|i| i.byte(0))
            .collect();
        // a = 0, counter = 1, b = 2
        assert_eq!(slots, vec![2]);
    }

    // =========================================================================
    // Error recovery
    // =========================================================================

    #[test]
    fn test_errors_are_collected_per_line() {
        let errors = compile_err("rat = 1\nprint(2)\n)\nrat ok = 3");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors.0[0].line, 1);
        assert_eq!(errors.0[1].line, 3);
    }

    #[test]
    fn test_unclosed_block() {
        let errors = compile_err("while true:\nprint(1)\n");
        assert_eq!(errors.0[0].kind, CompileErrorKind::UnclosedBlock);
    }

    #[test]
    fn test_stray_block_end() {
        let errors = compile_err("endif");
        assert!(errors.0[0].message.contains("without an open block"));
    }

    #[test]
    fn test_constants_overflow() {
        let source: String = (0..300).map(|i| format!("{}\n", i)).collect();
        let errors = compile_err(&source);
        assert_eq!(errors.0[0].kind, CompileErrorKind::ConstantsOverflow);
        assert_eq!(errors.0[0].line, 257);
    }

    #[test]
    fn test_numeric_overflow() {
        let source = format!("rat x = {}", "9".repeat(50));
        let errors = compile_err(&source);
        assert_eq!(errors.0[0].kind, CompileErrorKind::NumericOverflow);
    }

    #[test]
    fn test_lexer_failure_is_unrecognized_token() {
        let errors = compile_err("rat x = $");
        assert_eq!(errors.0[0].kind, CompileErrorKind::UnrecognizedToken);
    }

    #[test]
    fn test_deep_parentheses_are_rejected() {
        let source = format!("print({}1{})", "(".repeat(200_000), ")".repeat(200_000));
        let errors = compile_err(&source);
        assert_eq!(errors.0[0].kind, CompileErrorKind::NestingTooDeep);
        assert_eq!(errors.code(), 111);

        let source = format!("print({}1{})", "(".repeat(100), ")".repeat(100));
        compile_ok(&source);
    }

    #[test]
    fn test_deep_blocks_are_rejected() {
        let depth = MAX_NESTING + 10;
        let source = format!(
            "{}print(1)\n{}",
            "if true:\n".repeat(depth),
            "endif\n".repeat(depth)
        );
        let errors = compile_err(&source);
        assert_eq!(errors.0[0].kind, CompileErrorKind::NestingTooDeep);
    }

    #[test]
    fn test_deep_unary_chain_is_rejected() {
        let source = format!("rat x = {}1", "- ".repeat(100_000));
        let errors = compile_err(&source);
        assert_eq!(errors.0[0].kind, CompileErrorKind::NestingTooDeep);
    }

    #[test]
    fn test_nesting_depth_resets_between_statements() {
        let line = format!("print({}1{})\n", "(".repeat(200), ")".repeat(200));
        compile_ok(&line.repeat(5));
    }
}
