//! Recursive-descent parser over ES5 plus arrow functions, template
//! literals, and `let`/`const` at the lexer level. Grammar entry point is
//! `Program`; `parse_lazy` re-enters at an arbitrary function-body span
//! for the second pass of the two-pass lazy parse.

use crate::ast::*;
use crate::error::{ErrorManager, ParseError, ParseResult};
use crate::token::{Keyword, Lexer, LexerCheckpoint, Token, TokenKind};

/// A function body larger than this (in source bytes) is deferred: the
/// pre-parse pass records its `[start, end)` range and discards the
/// parsed statements rather than keeping them live in the `Program` it
/// returns.
pub const LAZY_BODY_THRESHOLD_BYTES: u32 = 160;

/// Exceeding this many nested statement/expression productions aborts
/// the current production with a diagnostic rather than blowing the host
/// stack on crafted input — "low thousands" per the grammar this parser
/// follows.
pub const MAX_RECURSION_DEPTH: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseMode {
    Eager,
    PreParse,
    LazyParse,
}

#[derive(Debug, Clone)]
pub struct FunctionRange {
    pub start: u32,
    pub end: u32,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PreParseResult {
    pub function_ranges: Vec<FunctionRange>,
}

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    cur: Token,
    strict: bool,
    depth: usize,
    mode: ParseMode,
    no_in: bool,
    errors: ErrorManager,
    function_ranges: Vec<FunctionRange>,
}

/// Increments the recursion counter on construction, decrements on drop —
/// the same scoped save/restore shape as the strict-mode flag, so a
/// parse error returned mid-production still leaves the counter correct.
struct TrackRecursion {
    depth: *mut usize,
}

impl Drop for TrackRecursion {
    fn drop(&mut self) {
        // SAFETY: `depth` points at the `Parser::depth` field of the
        // `Parser` that created this guard, which outlives the guard
        // (the guard is only ever held in a local of a `Parser` method).
        unsafe {
            *self.depth -= 1;
        }
    }
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, start: u32, end: u32, mode: ParseMode) -> ParseResult<Self> {
        let mut lexer = Lexer::new_slice(source, start, end);
        let cur = lexer.next_token(true)?;
        Ok(Self {
            lexer,
            cur,
            strict: false,
            depth: 0,
            mode,
            no_in: false,
            errors: ErrorManager::new(),
            function_ranges: Vec::new(),
        })
    }

    pub fn parse_program(source: &'a str) -> (Option<Program>, ErrorManager) {
        let mut parser = match Parser::new(source, 0, source.len() as u32, ParseMode::Eager) {
            Ok(p) => p,
            Err(e) => {
                let mut errors = ErrorManager::new();
                errors.record(e);
                return (None, errors);
            }
        };
        let program = parser.run_program();
        (program, parser.errors)
    }

    /// First pass: parses the whole program but discards bodies of
    /// functions over `LAZY_BODY_THRESHOLD_BYTES`, keeping only their
    /// `[start, end)` range. `tracing` records entry the way GC cycles
    /// and interpreter runs do.
    pub fn pre_parse(source: &'a str) -> (Option<Program>, PreParseResult, ErrorManager) {
        let _span = tracing::debug_span!("parser.pre_parse", bytes = source.len()).entered();
        let mut parser = match Parser::new(source, 0, source.len() as u32, ParseMode::PreParse) {
            Ok(p) => p,
            Err(e) => {
                let mut errors = ErrorManager::new();
                errors.record(e);
                return (None, PreParseResult::default(), errors);
            }
        };
        let program = parser.run_program();
        (program, PreParseResult { function_ranges: parser.function_ranges }, parser.errors)
    }

    /// Second pass: re-enters exactly `[start, end)` (the span pre-parse
    /// recorded for one deferred function body, braces included) and
    /// parses it fully, in isolation from the rest of the source.
    pub fn parse_lazy(source: &'a str, start: u32, end: u32) -> ParseResult<Vec<Stmt>> {
        let _span = tracing::debug_span!("parser.lazy_parse", start, end).entered();
        let mut parser = Parser::new(source, start, end, ParseMode::LazyParse)?;
        parser.expect_punct("{")?;
        let body = parser.parse_statement_list_until_rbrace()?;
        parser.expect_punct("}")?;
        Ok(body)
    }

    fn run_program(&mut self) -> Option<Program> {
        let start = self.cur.start;
        let body = self.parse_directive_prologue_and_statements(true);
        let end = self.cur.end;
        if self.errors.has_errors() {
            return None;
        }
        Some(Program { body, strict: self.strict, loc: SourceLoc::new(start, end) })
    }

    // ---- token plumbing ----------------------------------------------

    fn regex_allowed(&self) -> bool {
        !matches!(
            &self.cur.kind,
            TokenKind::Identifier(_)
                | TokenKind::Number(_)
                | TokenKind::String(_)
                | TokenKind::TemplateRaw(_)
                | TokenKind::Regex { .. }
                | TokenKind::Punct(")")
                | TokenKind::Punct("]")
                | TokenKind::Keyword(Keyword::This)
        )
    }

    fn bump(&mut self) -> ParseResult<()> {
        let allowed = self.regex_allowed();
        self.cur = self.lexer.next_token(allowed)?;
        Ok(())
    }

    fn checkpoint(&self) -> (LexerCheckpoint, Token) {
        (self.lexer.checkpoint(), self.cur.clone())
    }

    fn restore(&mut self, cp: (LexerCheckpoint, Token)) {
        self.lexer.restore(cp.0);
        self.cur = cp.1;
    }

    fn track_recursion(&mut self) -> ParseResult<TrackRecursion> {
        if self.depth >= MAX_RECURSION_DEPTH {
            return Err(ParseError::RecursionLimit { offset: self.cur.start });
        }
        self.depth += 1;
        Ok(TrackRecursion { depth: &mut self.depth as *mut usize })
    }

    fn unexpected(&self, message: impl Into<String>) -> ParseError {
        ParseError::UnexpectedToken { offset: self.cur.start, message: message.into() }
    }

    fn expect_punct(&mut self, p: &'static str) -> ParseResult<()> {
        if self.cur.is_punct(p) {
            self.bump()
        } else {
            Err(self.unexpected(format!("expected '{p}'")))
        }
    }

    fn eat_punct(&mut self, p: &str) -> ParseResult<bool> {
        if self.cur.is_punct(p) {
            self.bump()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_keyword(&mut self, k: Keyword) -> ParseResult<()> {
        if self.cur.is_keyword(k) {
            self.bump()
        } else {
            Err(self.unexpected(format!("expected keyword {k:?}")))
        }
    }

    fn expect_identifier(&mut self) -> ParseResult<String> {
        match self.cur.kind.clone() {
            TokenKind::Identifier(name) => {
                self.bump()?;
                Ok(name)
            }
            TokenKind::Keyword(Keyword::Of) => {
                // `of` is a contextual keyword; usable as a binding name
                // everywhere except immediately after `for (x`.
                self.bump()?;
                Ok("of".to_string())
            }
            _ => Err(self.unexpected("expected identifier")),
        }
    }

    /// `eatSemi`: succeeds (consuming `;`) on an explicit `;`, or on `}`,
    /// EOF, or a line terminator before the current token — ASI's three
    /// escape hatches. Reports `';' expected` otherwise unless `optional`.
    fn eat_semi(&mut self, optional: bool) -> ParseResult<()> {
        if self.eat_punct(";")? {
            return Ok(());
        }
        if self.cur.is_punct("}") || self.cur.is_eof() || self.cur.preceded_by_newline {
            return Ok(());
        }
        if optional {
            return Ok(());
        }
        Err(ParseError::MissingSemicolon { offset: self.cur.start })
    }

    // ---- statements -----------------------------------------------------

    fn parse_directive_prologue_and_statements(&mut self, is_program: bool) -> Vec<Stmt> {
        let saved_strict = self.strict;
        let mut body = Vec::new();
        let mut in_prologue = true;
        loop {
            if self.cur.is_eof() || (!is_program && self.cur.is_punct("}")) {
                break;
            }
            if self.errors.has_errors() {
                break;
            }
            let directive = if in_prologue { self.peek_directive() } else { None };
            match self.parse_statement() {
                Ok(stmt) => {
                    if in_prologue {
                        match &directive {
                            Some(text) if text == "use strict" => self.strict = true,
                            Some(_) => {}
                            None => in_prologue = false,
                        }
                    }
                    body.push(stmt);
                }
                Err(e) => {
                    self.errors.record(e);
                    break;
                }
            }
        }
        if !is_program {
            self.strict = saved_strict;
        }
        body
    }

    /// Looks at the current statement without consuming it: is it a bare
    /// string-literal expression statement (a directive candidate)? If
    /// so, returns its cooked text.
    fn peek_directive(&mut self) -> Option<String> {
        if let TokenKind::String(s) = &self.cur.kind {
            let cp = self.checkpoint();
            let text = s.clone();
            let _ = self.bump();
            let is_directive_end = self.cur.is_punct(";") || self.cur.is_punct("}") || self.cur.is_eof() || self.cur.preceded_by_newline;
            self.restore(cp);
            if is_directive_end {
                return Some(text);
            }
        }
        None
    }

    fn parse_statement_list_until_rbrace(&mut self) -> ParseResult<Vec<Stmt>> {
        Ok(self.parse_directive_prologue_and_statements(false))
    }

    fn parse_statement(&mut self) -> ParseResult<Stmt> {
        let _guard = self.track_recursion()?;
        match &self.cur.kind {
            TokenKind::Punct("{") => self.parse_block(),
            TokenKind::Punct(";") => {
                let loc = SourceLoc::new(self.cur.start, self.cur.end);
                self.bump()?;
                Ok(Stmt::Empty(loc))
            }
            TokenKind::Keyword(Keyword::Var) | TokenKind::Keyword(Keyword::Let) | TokenKind::Keyword(Keyword::Const) => {
                self.parse_var_statement()
            }
            TokenKind::Keyword(Keyword::Function) => self.parse_function_declaration(),
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::Do) => self.parse_do_while(),
            TokenKind::Keyword(Keyword::Return) => self.parse_return(),
            TokenKind::Keyword(Keyword::Throw) => self.parse_throw(),
            TokenKind::Keyword(Keyword::Try) => self.parse_try(),
            TokenKind::Keyword(Keyword::Break) => self.parse_break_continue(true),
            TokenKind::Keyword(Keyword::Continue) => self.parse_break_continue(false),
            TokenKind::Keyword(Keyword::Debugger) => {
                let loc = SourceLoc::new(self.cur.start, self.cur.end);
                self.bump()?;
                self.eat_semi(false)?;
                Ok(Stmt::Empty(loc))
            }
            _ => self.parse_expression_or_labeled_statement(),
        }
    }

    fn parse_block(&mut self) -> ParseResult<Stmt> {
        let start = self.cur.start;
        self.expect_punct("{")?;
        let body = self.parse_statement_list_until_rbrace()?;
        let end = self.cur.end;
        self.expect_punct("}")?;
        Ok(Stmt::Block { body, loc: SourceLoc::new(start, end) })
    }

    fn parse_var_kind(&mut self) -> ParseResult<VarKind> {
        let kind = match &self.cur.kind {
            TokenKind::Keyword(Keyword::Var) => VarKind::Var,
            TokenKind::Keyword(Keyword::Let) => VarKind::Let,
            TokenKind::Keyword(Keyword::Const) => VarKind::Const,
            _ => return Err(self.unexpected("expected var/let/const")),
        };
        self.bump()?;
        Ok(kind)
    }

    fn parse_var_declarators(&mut self) -> ParseResult<Vec<(String, Option<Expr>)>> {
        let mut decls = Vec::new();
        loop {
            let name = self.expect_identifier()?;
            let init = if self.eat_punct("=")? { Some(self.parse_assignment_expression()?) } else { None };
            decls.push((name, init));
            if !self.eat_punct(",")? {
                break;
            }
        }
        Ok(decls)
    }

    fn parse_var_statement(&mut self) -> ParseResult<Stmt> {
        let start = self.cur.start;
        let kind = self.parse_var_kind()?;
        let decls = self.parse_var_declarators()?;
        let end = self.cur.start;
        self.eat_semi(false)?;
        Ok(Stmt::VarDecl { kind, decls, loc: SourceLoc::new(start, end) })
    }

    fn parse_function_declaration(&mut self) -> ParseResult<Stmt> {
        let node = self.parse_function_node(false)?;
        Ok(Stmt::FunctionDecl(node))
    }

    /// `is_expression` suppresses the lazy-threshold side table — only
    /// top-level function declarations are worth deferring; a function
    /// expression passed to a call that runs immediately gains nothing
    /// from being parsed twice.
    fn parse_function_node(&mut self, is_expression: bool) -> ParseResult<FunctionNode> {
        let start = self.cur.start;
        self.expect_keyword(Keyword::Function)?;
        let name = if let TokenKind::Identifier(_) = &self.cur.kind { Some(self.expect_identifier()?) } else { None };
        let params = self.parse_param_list()?;
        let body_start = self.cur.start;
        let saved_strict = self.strict;
        self.expect_punct("{")?;
        let body_stmts = self.parse_statement_list_until_rbrace()?;
        let body_strict = self.strict;
        let body_end = self.cur.end;
        self.expect_punct("}")?;
        self.strict = saved_strict;

        let body = if !is_expression && self.mode == ParseMode::PreParse && body_end - body_start > LAZY_BODY_THRESHOLD_BYTES {
            self.function_ranges.push(FunctionRange { start: body_start, end: body_end, name: name.clone() });
            FunctionBody::Lazy { start: body_start, end: body_end }
        } else {
            FunctionBody::Parsed(body_stmts)
        };

        Ok(FunctionNode { name, params, body, strict: body_strict, is_arrow: false, loc: SourceLoc::new(start, body_end) })
    }

    fn parse_param_list(&mut self) -> ParseResult<Vec<String>> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        if !self.cur.is_punct(")") {
            loop {
                params.push(self.expect_identifier()?);
                if !self.eat_punct(",")? {
                    break;
                }
            }
        }
        self.expect_punct(")")?;
        Ok(params)
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let start = self.cur.start;
        self.expect_keyword(Keyword::If)?;
        self.expect_punct("(")?;
        let test = self.parse_expression()?;
        self.expect_punct(")")?;
        let consequent = Box::new(self.parse_statement()?);
        let alternate = if self.cur.is_keyword(Keyword::Else) {
            self.bump()?;
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };
        let end = alternate.as_ref().map(|a| a.loc().end).unwrap_or(consequent.loc().end);
        Ok(Stmt::If { test, consequent, alternate, loc: SourceLoc::new(start, end) })
    }

    fn parse_for_init(&mut self) -> ParseResult<ForInit> {
        if matches!(self.cur.kind, TokenKind::Keyword(Keyword::Var) | TokenKind::Keyword(Keyword::Let) | TokenKind::Keyword(Keyword::Const)) {
            let kind = self.parse_var_kind()?;
            self.no_in = true;
            let name = self.expect_identifier()?;
            let init = if self.eat_punct("=")? { Some(self.parse_assignment_expression()?) } else { None };
            let mut decls = vec![(name, init)];
            while self.eat_punct(",")? {
                let name = self.expect_identifier()?;
                let init = if self.eat_punct("=")? { Some(self.parse_assignment_expression()?) } else { None };
                decls.push((name, init));
            }
            self.no_in = false;
            Ok(ForInit::VarDecl { kind, decls })
        } else {
            self.no_in = true;
            let expr = self.parse_expression()?;
            self.no_in = false;
            Ok(ForInit::Expr(expr))
        }
    }

    fn parse_for(&mut self) -> ParseResult<Stmt> {
        let start = self.cur.start;
        self.expect_keyword(Keyword::For)?;
        self.expect_punct("(")?;

        if self.eat_punct(";")? {
            return self.parse_for_classic_rest(start, None);
        }

        let init = self.parse_for_init()?;
        if self.cur.is_keyword(Keyword::In) {
            self.bump()?;
            let right = self.parse_expression()?;
            self.expect_punct(")")?;
            let body = Box::new(self.parse_statement()?);
            let end = body.loc().end;
            return Ok(Stmt::ForIn { left: Box::new(init), right, body, loc: SourceLoc::new(start, end) });
        }
        if self.cur.is_keyword(Keyword::Of) {
            self.bump()?;
            let right = self.parse_assignment_expression()?;
            self.expect_punct(")")?;
            let body = Box::new(self.parse_statement()?);
            let end = body.loc().end;
            return Ok(Stmt::ForOf { left: Box::new(init), right, body, loc: SourceLoc::new(start, end) });
        }
        self.expect_punct(";")?;
        self.parse_for_classic_rest(start, Some(Box::new(init)))
    }

    fn parse_for_classic_rest(&mut self, start: u32, init: Option<Box<ForInit>>) -> ParseResult<Stmt> {
        let test = if self.cur.is_punct(";") { None } else { Some(self.parse_expression()?) };
        self.expect_punct(";")?;
        let update = if self.cur.is_punct(")") { None } else { Some(self.parse_expression()?) };
        self.expect_punct(")")?;
        let body = Box::new(self.parse_statement()?);
        let end = body.loc().end;
        Ok(Stmt::For { init, test, update, body, loc: SourceLoc::new(start, end) })
    }

    fn parse_while(&mut self) -> ParseResult<Stmt> {
        let start = self.cur.start;
        self.expect_keyword(Keyword::While)?;
        self.expect_punct("(")?;
        let test = self.parse_expression()?;
        self.expect_punct(")")?;
        let body = Box::new(self.parse_statement()?);
        let end = body.loc().end;
        Ok(Stmt::While { test, body, loc: SourceLoc::new(start, end) })
    }

    fn parse_do_while(&mut self) -> ParseResult<Stmt> {
        let start = self.cur.start;
        self.expect_keyword(Keyword::Do)?;
        let body = Box::new(self.parse_statement()?);
        self.expect_keyword(Keyword::While)?;
        self.expect_punct("(")?;
        let test = self.parse_expression()?;
        self.expect_punct(")")?;
        let end = self.cur.start;
        self.eat_semi(true)?;
        Ok(Stmt::DoWhile { body, test, loc: SourceLoc::new(start, end) })
    }

    fn parse_return(&mut self) -> ParseResult<Stmt> {
        let start = self.cur.start;
        self.expect_keyword(Keyword::Return)?;
        let argument = if self.cur.is_punct(";") || self.cur.is_punct("}") || self.cur.is_eof() || self.cur.preceded_by_newline {
            None
        } else {
            Some(self.parse_expression()?)
        };
        let end = self.cur.start;
        self.eat_semi(false)?;
        Ok(Stmt::Return { argument, loc: SourceLoc::new(start, end) })
    }

    fn parse_throw(&mut self) -> ParseResult<Stmt> {
        let start = self.cur.start;
        self.expect_keyword(Keyword::Throw)?;
        if self.cur.preceded_by_newline {
            return Err(self.unexpected("illegal newline after throw"));
        }
        let argument = self.parse_expression()?;
        let end = self.cur.start;
        self.eat_semi(false)?;
        Ok(Stmt::Throw { argument, loc: SourceLoc::new(start, end) })
    }

    fn parse_try(&mut self) -> ParseResult<Stmt> {
        let start = self.cur.start;
        self.expect_keyword(Keyword::Try)?;
        let block = match self.parse_block()? {
            Stmt::Block { body, .. } => body,
            _ => unreachable!("parse_block always returns Stmt::Block"),
        };

        let mut handler = None;
        if self.cur.is_keyword(Keyword::Catch) {
            self.bump()?;
            let param = if self.eat_punct("(")? {
                let name = self.expect_identifier()?;
                self.expect_punct(")")?;
                Some(name)
            } else {
                None
            };
            let catch_body = match self.parse_block()? {
                Stmt::Block { body, .. } => body,
                _ => unreachable!(),
            };
            handler = Some((param, catch_body));
        }

        let mut finalizer = None;
        if self.cur.is_keyword(Keyword::Finally) {
            self.bump()?;
            let fin_body = match self.parse_block()? {
                Stmt::Block { body, .. } => body,
                _ => unreachable!(),
            };
            finalizer = Some(fin_body);
        }

        if handler.is_none() && finalizer.is_none() {
            return Err(self.unexpected("missing catch or finally after try"));
        }

        let end = self.cur.start;
        Ok(Stmt::Try { block, handler, finalizer, loc: SourceLoc::new(start, end) })
    }

    fn parse_break_continue(&mut self, is_break: bool) -> ParseResult<Stmt> {
        let start = self.cur.start;
        self.bump()?;
        let label = if !self.cur.preceded_by_newline && matches!(self.cur.kind, TokenKind::Identifier(_)) {
            Some(self.expect_identifier()?)
        } else {
            None
        };
        let end = self.cur.start;
        self.eat_semi(false)?;
        let loc = SourceLoc::new(start, end);
        Ok(if is_break { Stmt::Break { label, loc } } else { Stmt::Continue { label, loc } })
    }

    /// An expression statement whose expression turned out to be a bare
    /// identifier, immediately followed by `:`, is promoted to a labeled
    /// statement instead — the one place statement-level lookahead on an
    /// already-parsed expression changes what node comes out.
    fn parse_expression_or_labeled_statement(&mut self) -> ParseResult<Stmt> {
        let start = self.cur.start;
        let expr = self.parse_expression()?;
        if let Some(name) = expr.as_bare_identifier() {
            if self.cur.is_punct(":") {
                let label = name.to_string();
                self.bump()?;
                let body = Box::new(self.parse_statement()?);
                let end = body.loc().end;
                return Ok(Stmt::Labeled { label, body, loc: SourceLoc::new(start, end) });
            }
        }
        let end = self.cur.start;
        self.eat_semi(false)?;
        Ok(Stmt::Expr(expr))
    }

    // ---- expressions ------------------------------------------------

    fn parse_expression(&mut self) -> ParseResult<Expr> {
        let start = self.cur.start;
        let first = self.parse_assignment_expression()?;
        if !self.cur.is_punct(",") {
            return Ok(first);
        }
        let mut expressions = vec![first];
        while self.eat_punct(",")? {
            expressions.push(self.parse_assignment_expression()?);
        }
        let end = self.cur.start;
        Ok(Expr::Sequence { expressions, loc: SourceLoc::new(start, end) })
    }

    fn parse_assignment_expression(&mut self) -> ParseResult<Expr> {
        let _guard = self.track_recursion()?;

        if let Some(arrow) = self.try_parse_arrow_function()? {
            return Ok(arrow);
        }

        let start = self.cur.start;
        let left = self.parse_conditional_expression()?;
        let op = match &self.cur.kind {
            TokenKind::Punct("=") => AssignOp::Assign,
            TokenKind::Punct("+=") => AssignOp::AddAssign,
            TokenKind::Punct("-=") => AssignOp::SubAssign,
            TokenKind::Punct("*=") => AssignOp::MulAssign,
            TokenKind::Punct("/=") => AssignOp::DivAssign,
            TokenKind::Punct("%=") => AssignOp::ModAssign,
            TokenKind::Punct("&=") => AssignOp::BitAndAssign,
            TokenKind::Punct("|=") => AssignOp::BitOrAssign,
            TokenKind::Punct("^=") => AssignOp::BitXorAssign,
            TokenKind::Punct("<<=") => AssignOp::ShlAssign,
            TokenKind::Punct(">>=") => AssignOp::ShrAssign,
            TokenKind::Punct(">>>=") => AssignOp::UshrAssign,
            _ => return Ok(left),
        };
        self.bump()?;
        let value = self.parse_assignment_expression()?;
        let end = self.cur.start;
        Ok(Expr::Assignment { op, target: Box::new(left), value: Box::new(value), loc: SourceLoc::new(start, end) })
    }

    /// Arrow functions need lookahead past what a normal LL(1) grammar
    /// gives: `(a, b)` is indistinguishable from a parenthesized
    /// sequence expression until the `=>` after the closing `)` is seen.
    /// Snapshot, try the param-list shape, and roll back on mismatch.
    fn try_parse_arrow_function(&mut self) -> ParseResult<Option<Expr>> {
        let start = self.cur.start;

        if let TokenKind::Identifier(name) = self.cur.kind.clone() {
            let cp = self.checkpoint();
            self.bump()?;
            if self.cur.is_punct("=>") && !self.cur.preceded_by_newline {
                self.bump()?;
                let node = self.parse_arrow_body(start, vec![name])?;
                return Ok(Some(Expr::ArrowFunctionExpr(Box::new(node))));
            }
            self.restore(cp);
            return Ok(None);
        }

        if self.cur.is_punct("(") {
            let cp = self.checkpoint();
            if let Ok(params) = self.parse_param_list() {
                if self.cur.is_punct("=>") && !self.cur.preceded_by_newline {
                    self.bump()?;
                    let node = self.parse_arrow_body(start, params)?;
                    return Ok(Some(Expr::ArrowFunctionExpr(Box::new(node))));
                }
            }
            self.restore(cp);
        }

        Ok(None)
    }

    fn parse_arrow_body(&mut self, start: u32, params: Vec<String>) -> ParseResult<FunctionNode> {
        let saved_strict = self.strict;
        let (body, end) = if self.cur.is_punct("{") {
            self.bump()?;
            let stmts = self.parse_statement_list_until_rbrace()?;
            let end = self.cur.end;
            self.expect_punct("}")?;
            (stmts, end)
        } else {
            let expr = self.parse_assignment_expression()?;
            let end = expr.loc().end;
            (vec![Stmt::Return { argument: Some(expr), loc: SourceLoc::new(start, end) }], end)
        };
        let strict = self.strict;
        self.strict = saved_strict;
        Ok(FunctionNode { name: None, params, body: FunctionBody::Parsed(body), strict, is_arrow: true, loc: SourceLoc::new(start, end) })
    }

    fn parse_conditional_expression(&mut self) -> ParseResult<Expr> {
        let start = self.cur.start;
        let test = self.parse_binary_expression(0)?;
        if !self.eat_punct("?")? {
            return Ok(test);
        }
        let consequent = self.parse_assignment_expression()?;
        self.expect_punct(":")?;
        let alternate = self.parse_assignment_expression()?;
        let end = self.cur.start;
        Ok(Expr::Conditional { test: Box::new(test), consequent: Box::new(consequent), alternate: Box::new(alternate), loc: SourceLoc::new(start, end) })
    }

    fn binary_op_and_precedence(&self) -> Option<(u8, BinOrLogic)> {
        use BinOrLogic::*;
        Some(match &self.cur.kind {
            TokenKind::Punct("||") => (1, Logic(LogicalOp::Or)),
            TokenKind::Punct("??") => (1, Logic(LogicalOp::NullishCoalesce)),
            TokenKind::Punct("&&") => (2, Logic(LogicalOp::And)),
            TokenKind::Punct("|") => (3, Bin(BinaryOp::BitOr)),
            TokenKind::Punct("^") => (4, Bin(BinaryOp::BitXor)),
            TokenKind::Punct("&") => (5, Bin(BinaryOp::BitAnd)),
            TokenKind::Punct("==") => (6, Bin(BinaryOp::Eq)),
            TokenKind::Punct("!=") => (6, Bin(BinaryOp::Ne)),
            TokenKind::Punct("===") => (6, Bin(BinaryOp::StrictEq)),
            TokenKind::Punct("!==") => (6, Bin(BinaryOp::StrictNe)),
            TokenKind::Punct("<") => (7, Bin(BinaryOp::Lt)),
            TokenKind::Punct(">") => (7, Bin(BinaryOp::Gt)),
            TokenKind::Punct("<=") => (7, Bin(BinaryOp::Le)),
            TokenKind::Punct(">=") => (7, Bin(BinaryOp::Ge)),
            TokenKind::Keyword(Keyword::Instanceof) => (7, Bin(BinaryOp::Instanceof)),
            TokenKind::Keyword(Keyword::In) if !self.no_in => (7, Bin(BinaryOp::In)),
            TokenKind::Punct("<<") => (8, Bin(BinaryOp::Shl)),
            TokenKind::Punct(">>") => (8, Bin(BinaryOp::Shr)),
            TokenKind::Punct(">>>") => (8, Bin(BinaryOp::Ushr)),
            TokenKind::Punct("+") => (9, Bin(BinaryOp::Add)),
            TokenKind::Punct("-") => (9, Bin(BinaryOp::Sub)),
            TokenKind::Punct("*") => (10, Bin(BinaryOp::Mul)),
            TokenKind::Punct("/") => (10, Bin(BinaryOp::Div)),
            TokenKind::Punct("%") => (10, Bin(BinaryOp::Mod)),
            _ => return None,
        })
    }

    /// Precedence climbing over a fixed table rather than an explicit
    /// operator stack: a `match` on `(min_prec, token)` covers every
    /// level this grammar's table uses without materializing a stack.
    fn parse_binary_expression(&mut self, min_prec: u8) -> ParseResult<Expr> {
        let start = self.cur.start;
        let mut left = self.parse_unary_expression()?;
        loop {
            let Some((prec, kind)) = self.binary_op_and_precedence() else { break };
            if prec < min_prec {
                break;
            }
            self.bump()?;
            let right = self.parse_binary_expression(prec + 1)?;
            let end = self.cur.start;
            left = match kind {
                BinOrLogic::Bin(op) => Expr::Binary { op, left: Box::new(left), right: Box::new(right), loc: SourceLoc::new(start, end) },
                BinOrLogic::Logic(op) => Expr::Logical { op, left: Box::new(left), right: Box::new(right), loc: SourceLoc::new(start, end) },
            };
        }
        Ok(left)
    }

    fn parse_unary_expression(&mut self) -> ParseResult<Expr> {
        let start = self.cur.start;
        let op = match &self.cur.kind {
            TokenKind::Punct("+") => Some(UnaryOp::Plus),
            TokenKind::Punct("-") => Some(UnaryOp::Minus),
            TokenKind::Punct("!") => Some(UnaryOp::Not),
            TokenKind::Punct("~") => Some(UnaryOp::BitNot),
            TokenKind::Keyword(Keyword::Typeof) => Some(UnaryOp::Typeof),
            TokenKind::Keyword(Keyword::Void) => Some(UnaryOp::Void),
            TokenKind::Keyword(Keyword::Delete) => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.bump()?;
            let argument = self.parse_unary_expression()?;
            let end = self.cur.start;
            return Ok(Expr::Unary { op, argument: Box::new(argument), loc: SourceLoc::new(start, end) });
        }
        if self.cur.is_punct("++") || self.cur.is_punct("--") {
            let op = if self.cur.is_punct("++") { UpdateOp::Inc } else { UpdateOp::Dec };
            self.bump()?;
            let argument = self.parse_unary_expression()?;
            let end = self.cur.start;
            return Ok(Expr::Update { op, argument: Box::new(argument), prefix: true, loc: SourceLoc::new(start, end) });
        }
        self.parse_postfix_expression()
    }

    fn parse_postfix_expression(&mut self) -> ParseResult<Expr> {
        let start = self.cur.start;
        let argument = self.parse_call_or_new_expression()?;
        if !self.cur.preceded_by_newline && (self.cur.is_punct("++") || self.cur.is_punct("--")) {
            let op = if self.cur.is_punct("++") { UpdateOp::Inc } else { UpdateOp::Dec };
            self.bump()?;
            let end = self.cur.start;
            return Ok(Expr::Update { op, argument: Box::new(argument), prefix: false, loc: SourceLoc::new(start, end) });
        }
        Ok(argument)
    }

    fn parse_call_or_new_expression(&mut self) -> ParseResult<Expr> {
        let start = self.cur.start;
        let mut expr = if self.cur.is_keyword(Keyword::New) {
            self.bump()?;
            let callee = self.parse_member_expression_no_call(start)?;
            let arguments = if self.cur.is_punct("(") { self.parse_arguments()? } else { Vec::new() };
            let end = self.cur.start;
            Expr::New { callee: Box::new(callee), arguments, loc: SourceLoc::new(start, end) }
        } else {
            self.parse_member_expression_no_call(start)?
        };

        loop {
            if self.cur.is_punct("(") {
                let arguments = self.parse_arguments()?;
                let end = self.cur.start;
                expr = Expr::Call { callee: Box::new(expr), arguments, loc: SourceLoc::new(start, end) };
            } else if self.cur.is_punct(".") {
                self.bump()?;
                let name = self.expect_identifier()?;
                let end = self.cur.start;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: Box::new(Expr::Identifier { name, loc: SourceLoc::new(start, end) }),
                    computed: false,
                    loc: SourceLoc::new(start, end),
                };
            } else if self.cur.is_punct("[") {
                self.bump()?;
                let property = self.parse_expression()?;
                self.expect_punct("]")?;
                let end = self.cur.start;
                expr = Expr::Member { object: Box::new(expr), property: Box::new(property), computed: true, loc: SourceLoc::new(start, end) };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_member_expression_no_call(&mut self, start: u32) -> ParseResult<Expr> {
        let mut expr = if self.cur.is_keyword(Keyword::New) {
            self.bump()?;
            let callee = self.parse_member_expression_no_call(start)?;
            let arguments = if self.cur.is_punct("(") { self.parse_arguments()? } else { Vec::new() };
            let end = self.cur.start;
            Expr::New { callee: Box::new(callee), arguments, loc: SourceLoc::new(start, end) }
        } else {
            self.parse_primary_expression()?
        };
        loop {
            if self.cur.is_punct(".") {
                self.bump()?;
                let name = self.expect_identifier()?;
                let end = self.cur.start;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: Box::new(Expr::Identifier { name, loc: SourceLoc::new(start, end) }),
                    computed: false,
                    loc: SourceLoc::new(start, end),
                };
            } else if self.cur.is_punct("[") {
                self.bump()?;
                let property = self.parse_expression()?;
                self.expect_punct("]")?;
                let end = self.cur.start;
                expr = Expr::Member { object: Box::new(expr), property: Box::new(property), computed: true, loc: SourceLoc::new(start, end) };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_arguments(&mut self) -> ParseResult<Vec<Expr>> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        if !self.cur.is_punct(")") {
            loop {
                args.push(self.parse_assignment_expression()?);
                if !self.eat_punct(",")? {
                    break;
                }
            }
        }
        self.expect_punct(")")?;
        Ok(args)
    }

    fn parse_primary_expression(&mut self) -> ParseResult<Expr> {
        let start = self.cur.start;
        let end = self.cur.end;
        match self.cur.kind.clone() {
            TokenKind::Number(value) => {
                self.bump()?;
                Ok(Expr::NumberLiteral { value, loc: SourceLoc::new(start, end) })
            }
            TokenKind::String(value) => {
                self.bump()?;
                Ok(Expr::StringLiteral { value, loc: SourceLoc::new(start, end) })
            }
            TokenKind::Regex { pattern, flags } => {
                self.bump()?;
                Ok(Expr::Regex { pattern, flags, loc: SourceLoc::new(start, end) })
            }
            TokenKind::TemplateRaw(raw) => {
                self.bump()?;
                self.parse_template_literal(&raw, start)
            }
            TokenKind::Keyword(Keyword::True) => {
                self.bump()?;
                Ok(Expr::BoolLiteral { value: true, loc: SourceLoc::new(start, end) })
            }
            TokenKind::Keyword(Keyword::False) => {
                self.bump()?;
                Ok(Expr::BoolLiteral { value: false, loc: SourceLoc::new(start, end) })
            }
            TokenKind::Keyword(Keyword::Null) => {
                self.bump()?;
                Ok(Expr::NullLiteral { loc: SourceLoc::new(start, end) })
            }
            TokenKind::Keyword(Keyword::This) => {
                self.bump()?;
                Ok(Expr::ThisExpr { loc: SourceLoc::new(start, end) })
            }
            TokenKind::Keyword(Keyword::Function) => {
                let node = self.parse_function_node(true)?;
                Ok(Expr::FunctionExpr(Box::new(node)))
            }
            TokenKind::Identifier(name) => {
                self.bump()?;
                Ok(Expr::Identifier { name, loc: SourceLoc::new(start, end) })
            }
            TokenKind::Keyword(Keyword::Of) => {
                self.bump()?;
                Ok(Expr::Identifier { name: "of".into(), loc: SourceLoc::new(start, end) })
            }
            TokenKind::Punct("(") => {
                self.bump()?;
                let expr = self.parse_expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            TokenKind::Punct("[") => self.parse_array_literal(),
            TokenKind::Punct("{") => self.parse_object_literal(),
            _ => Err(self.unexpected("expected expression")),
        }
    }

    fn parse_array_literal(&mut self) -> ParseResult<Expr> {
        let start = self.cur.start;
        self.expect_punct("[")?;
        let mut elements = Vec::new();
        while !self.cur.is_punct("]") {
            if self.cur.is_punct(",") {
                elements.push(None);
                self.bump()?;
                continue;
            }
            elements.push(Some(self.parse_assignment_expression()?));
            if !self.cur.is_punct("]") {
                self.expect_punct(",")?;
            }
        }
        let end = self.cur.end;
        self.expect_punct("]")?;
        Ok(Expr::ArrayLiteral { elements, loc: SourceLoc::new(start, end) })
    }

    fn parse_object_literal(&mut self) -> ParseResult<Expr> {
        let start = self.cur.start;
        self.expect_punct("{")?;
        let mut properties = Vec::new();
        while !self.cur.is_punct("}") {
            let key = self.parse_property_key()?;
            self.expect_punct(":")?;
            let value = self.parse_assignment_expression()?;
            properties.push((key, value));
            if !self.cur.is_punct("}") {
                self.expect_punct(",")?;
            }
        }
        let end = self.cur.end;
        self.expect_punct("}")?;
        Ok(Expr::ObjectLiteral { properties, loc: SourceLoc::new(start, end) })
    }

    fn parse_property_key(&mut self) -> ParseResult<PropertyKeyNode> {
        match self.cur.kind.clone() {
            TokenKind::Identifier(name) => {
                self.bump()?;
                Ok(PropertyKeyNode::Identifier(name))
            }
            TokenKind::Keyword(kw) => {
                let name = format!("{kw:?}").to_lowercase();
                self.bump()?;
                Ok(PropertyKeyNode::Identifier(name))
            }
            TokenKind::String(value) => {
                self.bump()?;
                Ok(PropertyKeyNode::String(value))
            }
            TokenKind::Number(value) => {
                self.bump()?;
                Ok(PropertyKeyNode::Number(value))
            }
            _ => Err(self.unexpected("expected property key")),
        }
    }

    /// Splits a raw ``` `a${expr}b` ``` token into cooked text chunks and
    /// the embedded expressions between them, recursively invoking this
    /// same grammar on each `${...}` span rather than teaching the lexer
    /// to nest. Sub-expression spans are relative to their own `${...}`
    /// slice, not the outer source — fine for evaluation, which is all
    /// downstream code needs them for.
    fn parse_template_literal(&mut self, raw: &str, loc_start: u32) -> ParseResult<Expr> {
        let inner = &raw[1..raw.len() - 1];
        let bytes = inner.as_bytes();
        let mut quasis = Vec::new();
        let mut expressions = Vec::new();
        let mut cooked = String::new();
        let mut i = 0usize;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() => {
                    cooked.push(crate::token::unescape(bytes[i + 1]));
                    i += 2;
                }
                b'$' if bytes.get(i + 1) == Some(&b'{') => {
                    quasis.push(std::mem::take(&mut cooked));
                    let expr_start = i + 2;
                    let mut depth = 1i32;
                    let mut j = expr_start;
                    while j < bytes.len() && depth > 0 {
                        match bytes[j] {
                            b'{' => depth += 1,
                            b'}' => depth -= 1,
                            _ => {}
                        }
                        if depth > 0 {
                            j += 1;
                        }
                    }
                    let expr_src = &inner[expr_start..j];
                    let mut sub_lexer = Lexer::new(expr_src);
                    let sub_cur = sub_lexer.next_token(true)?;
                    let mut sub_parser = Parser {
                        lexer: sub_lexer,
                        cur: sub_cur,
                        strict: self.strict,
                        depth: self.depth,
                        mode: ParseMode::Eager,
                        no_in: false,
                        errors: ErrorManager::new(),
                        function_ranges: Vec::new(),
                    };
                    expressions.push(sub_parser.parse_expression()?);
                    i = j + 1;
                }
                _ => {
                    let ch_len = inner[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
                    cooked.push_str(&inner[i..i + ch_len]);
                    i += ch_len;
                }
            }
        }
        quasis.push(cooked);
        Ok(Expr::TemplateLiteral { quasis, expressions, loc: SourceLoc::new(loc_start, loc_start + raw.len() as u32) })
    }
}

#[derive(Debug, Clone, Copy)]
enum BinOrLogic {
    Bin(BinaryOp),
    Logic(LogicalOp),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Program {
        let (program, errors) = Parser::parse_program(src);
        assert!(!errors.has_errors(), "unexpected parse errors: {:?}", errors.errors());
        program.expect("parse_program returned None without recording an error")
    }

    #[test]
    fn parses_var_and_binary_expression() {
        let program = parse_ok("var x = 1 + 2 * 3;");
        assert_eq!(program.body.len(), 1);
        match &program.body[0] {
            Stmt::VarDecl { kind: VarKind::Var, decls, .. } => {
                assert_eq!(decls.len(), 1);
                assert_eq!(decls[0].0, "x");
                match decls[0].1.as_ref().unwrap() {
                    Expr::Binary { op: BinaryOp::Add, right, .. } => {
                        assert!(matches!(**right, Expr::Binary { op: BinaryOp::Mul, .. }));
                    }
                    other => panic!("expected addition at top, got {other:?}"),
                }
            }
            other => panic!("expected var decl, got {other:?}"),
        }
    }

    #[test]
    fn precedence_climbing_binds_multiplication_tighter_than_addition() {
        let program = parse_ok("1 + 2 * 3;");
        match &program.body[0] {
            Stmt::Expr(Expr::Binary { op: BinaryOp::Add, .. }) => {}
            other => panic!("expected top-level addition, got {other:?}"),
        }
    }

    #[test]
    fn for_loop_excludes_in_operator_from_its_head_via_no_in() {
        // Without the no_in context flag this would parse `x in y` as a
        // single relational expression and never find the loop body.
        let program = parse_ok("for (x in y) { z; }");
        assert!(matches!(program.body[0], Stmt::ForIn { .. }));
    }

    #[test]
    fn asi_inserts_semicolon_before_newline() {
        let program = parse_ok("var a = 1\nvar b = 2");
        assert_eq!(program.body.len(), 2);
    }

    #[test]
    fn labeled_statement_distinguished_from_expression_statement() {
        let program = parse_ok("outer: while (true) { break outer; }");
        match &program.body[0] {
            Stmt::Labeled { label, body, .. } => {
                assert_eq!(label, "outer");
                assert!(matches!(**body, Stmt::While { .. }));
            }
            other => panic!("expected labeled statement, got {other:?}"),
        }
    }

    #[test]
    fn arrow_function_lookahead_rolls_back_to_parenthesized_expression() {
        let program = parse_ok("(a + b);");
        assert!(matches!(program.body[0], Stmt::Expr(Expr::Binary { .. })));

        let program = parse_ok("(a, b) => a + b;");
        assert!(matches!(program.body[0], Stmt::Expr(Expr::ArrowFunctionExpr(_))));
    }

    #[test]
    fn single_identifier_arrow_function_skips_parens() {
        let program = parse_ok("x => x * 2;");
        match &program.body[0] {
            Stmt::Expr(Expr::ArrowFunctionExpr(node)) => {
                assert_eq!(node.params, vec!["x".to_string()]);
                assert!(node.is_arrow);
            }
            other => panic!("expected arrow function expression, got {other:?}"),
        }
    }

    #[test]
    fn use_strict_directive_propagates_to_function_body() {
        let program = parse_ok("'use strict';\nfunction f() { return 1; }");
        assert!(program.strict);
        match &program.body[1] {
            Stmt::FunctionDecl(node) => assert!(node.strict),
            other => panic!("expected function declaration, got {other:?}"),
        }
    }

    #[test]
    fn template_literal_splits_quasis_and_expressions() {
        let program = parse_ok("`a${1 + 1}b`;");
        match &program.body[0] {
            Stmt::Expr(Expr::TemplateLiteral { quasis, expressions, .. }) => {
                assert_eq!(quasis, &vec!["a".to_string(), "b".to_string()]);
                assert_eq!(expressions.len(), 1);
            }
            other => panic!("expected template literal, got {other:?}"),
        }
    }

    #[test]
    fn try_catch_finally_all_present() {
        let program = parse_ok("try { a(); } catch (e) { b(); } finally { c(); }");
        match &program.body[0] {
            Stmt::Try { handler: Some((Some(name), _)), finalizer: Some(_), .. } => {
                assert_eq!(name, "e");
            }
            other => panic!("expected full try/catch/finally, got {other:?}"),
        }
    }

    #[test]
    fn deeply_nested_parens_hit_recursion_limit_instead_of_overflowing_the_stack() {
        let src = format!("{}0{}", "(".repeat(MAX_RECURSION_DEPTH + 10), ")".repeat(MAX_RECURSION_DEPTH + 10));
        let (program, errors) = Parser::parse_program(&src);
        assert!(program.is_none());
        assert!(matches!(errors.first(), Some(ParseError::RecursionLimit { .. })));
    }

    /// Parser idempotence: re-entering a deferred function body through
    /// `parse_lazy` must produce the same statements an eager parse of
    /// the whole program would have found inside that body.
    #[test]
    fn lazy_parse_matches_eager_parse_of_the_same_function_body() {
        let body_stmts = "{ var total = 0; var scale = 3; var offset = 7; for (var i = 0; i < 10; i = i + 1) { total = total + i * scale + offset; if (total > 1000) { break; } } return total; }";
        let src = format!("function big() {body_stmts}");

        let (pre_program, pre_result, pre_errors) = Parser::pre_parse(&src);
        assert!(!pre_errors.has_errors());
        let pre_program = pre_program.unwrap();
        assert_eq!(pre_result.function_ranges.len(), 1);

        let range = &pre_result.function_ranges[0];
        match &pre_program.body[0] {
            Stmt::FunctionDecl(node) => {
                assert!(matches!(node.body, FunctionBody::Lazy { .. }));
            }
            other => panic!("expected function declaration, got {other:?}"),
        }

        let lazy_body = Parser::parse_lazy(&src, range.start, range.end).unwrap();

        let (eager_program, eager_errors) = Parser::parse_program(&src);
        assert!(!eager_errors.has_errors());
        let eager_body = match &eager_program.unwrap().body[0] {
            Stmt::FunctionDecl(node) => match &node.body {
                FunctionBody::Parsed(stmts) => stmts.len(),
                FunctionBody::Lazy { .. } => panic!("eager parse should never defer"),
            },
            other => panic!("expected function declaration, got {other:?}"),
        };

        assert_eq!(lazy_body.len(), eager_body);
    }
}
