//! Recursive-descent parser (spec §4.2, component 4): turns a token stream
//! into a [`Program`]. Syntax errors are collected into a `Vec` — a stanza
//! that fails to parse is skipped (resynchronizing on the next `start`/`end`
//! at the same nesting depth) so later stanzas still get a chance to report
//! their own errors in one pass.

use rust_decimal::Decimal;

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::unit::Unit;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<ParseError>,
}

type PResult<T> = Result<T, ()>;

impl Parser {
    pub fn new(source: &str) -> Self {
        match Lexer::new(source).tokenize() {
            Ok(tokens) => Self { tokens, pos: 0, errors: Vec::new() },
            Err(lex_errors) => Self { tokens: vec![eof_token()], pos: 0, errors: lex_errors },
        }
    }

    pub fn parse_program(mut self) -> Result<Program, Vec<ParseError>> {
        let mut program = Program::default();

        while !self.at_eof() {
            match self.parse_stanza(&mut program) {
                Ok(()) => {}
                Err(()) => self.recover_to_next_stanza(),
            }
        }

        if self.errors.is_empty() {
            if program.policy("default").is_none() {
                program.policies.insert(0, Policy { name: "default".to_string(), applications: Vec::new() });
            }
            Ok(program)
        } else {
            Err(self.errors)
        }
    }

    // --- top level ---

    fn parse_stanza(&mut self, program: &mut Program) -> PResult<()> {
        self.expect_ident("start")?;
        let head = self.peek_ident().ok_or_else(|| self.err("expected 'about', 'default', 'policy', or 'simulations'"))?;
        match head.as_str() {
            "about" => {
                self.advance();
                self.skip_until_matching_end()?;
            }
            "default" => {
                self.advance();
                let applications = self.parse_applications()?;
                self.expect_ident("end")?;
                program.policies.push(Policy { name: "default".to_string(), applications });
            }
            "policy" => {
                self.advance();
                let name = self.expect_string()?;
                let applications = self.parse_applications()?;
                self.expect_ident("end")?;
                program.policies.push(Policy { name, applications });
            }
            "simulations" => {
                self.advance();
                while self.peek_ident_is("start") {
                    let scenario = self.parse_scenario()?;
                    program.scenarios.push(scenario);
                }
                self.expect_ident("end")?;
            }
            other => return Err(self.err(format!("unexpected stanza '{other}'"))),
        }
        Ok(())
    }

    fn parse_applications(&mut self) -> PResult<Vec<Application>> {
        let mut apps = Vec::new();
        while self.peek_ident_is("start") && self.peek_nth_ident_is(1, "application") {
            self.advance(); // start
            self.advance(); // application
            let name = self.expect_string()?;
            let substances = self.parse_substances()?;
            self.expect_ident("end")?;
            apps.push(Application { name, substances });
        }
        Ok(apps)
    }

    fn parse_substances(&mut self) -> PResult<Vec<Substance>> {
        let mut subs = Vec::new();
        while self.peek_ident_is("start") && self.peek_nth_ident_is(1, "substance") {
            self.advance(); // start
            self.advance(); // substance
            let name = self.expect_string()?;
            let mut commands = Vec::new();
            while !self.peek_ident_is("end") {
                commands.push(self.parse_command()?);
            }
            self.expect_ident("end")?;
            subs.push(Substance { name, commands });
        }
        Ok(subs)
    }

    fn parse_scenario(&mut self) -> PResult<Scenario> {
        self.expect_ident("start")?;
        self.expect_ident("scenario")?;
        let name = self.expect_string()?;
        let mut policies = Vec::new();
        let mut start_year = None;
        let mut end_year = None;
        let mut trials = 1u32;

        while !self.peek_ident_is("end") {
            let kw = self.peek_ident().ok_or_else(|| self.err("expected scenario directive"))?;
            match kw.as_str() {
                "policy" => {
                    self.advance();
                    policies.push(self.expect_string()?);
                }
                "years" => {
                    self.advance();
                    start_year = Some(self.expect_year_literal()?);
                    self.expect_ident("to")?;
                    end_year = Some(self.expect_year_literal()?);
                }
                "trials" => {
                    self.advance();
                    let n = self.expect_number()?;
                    trials = n.to_string().parse().map_err(|_| self.err("invalid 'trials' count"))?;
                }
                other => return Err(self.err(format!("unexpected scenario directive '{other}'"))),
            }
        }
        self.expect_ident("end")?;

        if !policies.iter().any(|p| p == "default") {
            policies.insert(0, "default".to_string());
        }

        Ok(Scenario {
            name,
            policies,
            start_year: start_year.ok_or_else(|| self.err("scenario is missing 'years <start> to <end>'"))?,
            end_year: end_year.ok_or_else(|| self.err("scenario is missing 'years <start> to <end>'"))?,
            trials,
        })
    }

    // --- commands ---

    fn parse_command(&mut self) -> PResult<Command> {
        let kw = self.peek_ident().ok_or_else(|| self.err("expected a command"))?;
        let cmd = match kw.as_str() {
            "enable" => {
                self.advance();
                let channel = self.expect_channel()?;
                Command::Enable(channel)
            }
            "initial" => {
                self.advance();
                self.expect_ident("charge")?;
                let channel = self.expect_channel()?;
                let value = self.parse_expr()?;
                let during = self.parse_optional_during()?;
                Command::InitialCharge { value, channel, during }
            }
            "equals" => {
                self.advance();
                let value = self.parse_expr()?;
                let during = self.parse_optional_during()?;
                Command::Equals { value, during }
            }
            "set" => {
                self.advance();
                let stream = self.expect_stream()?;
                self.expect_ident("to")?;
                let value = self.parse_expr()?;
                let during = self.parse_optional_during()?;
                Command::Set { stream, value, during }
            }
            "change" => {
                self.advance();
                let stream = self.expect_stream()?;
                self.expect_ident("by")?;
                let value = self.parse_expr()?;
                let during = self.parse_optional_during()?;
                Command::Change { stream, value, during }
            }
            "cap" => {
                self.advance();
                let stream = self.expect_stream()?;
                self.expect_ident("at")?;
                let value = self.parse_expr()?;
                let displacing = self.parse_optional_displacing()?;
                let during = self.parse_optional_during()?;
                Command::Cap { stream, value, displacing, during }
            }
            "floor" => {
                self.advance();
                let stream = self.expect_stream()?;
                self.expect_ident("at")?;
                let value = self.parse_expr()?;
                let displacing = self.parse_optional_displacing()?;
                let during = self.parse_optional_during()?;
                Command::Floor { stream, value, displacing, during }
            }
            "recharge" => {
                self.advance();
                let population_pct = self.parse_expr()?;
                self.expect_ident("with")?;
                let intensity = self.parse_expr()?;
                let during = self.parse_optional_during()?;
                Command::Recharge { population_pct, intensity, during }
            }
            "retire" => {
                self.advance();
                let amount = self.parse_expr()?;
                let during = self.parse_optional_during()?;
                Command::Retire { amount, during }
            }
            "recover" => {
                self.advance();
                let percent = self.parse_expr()?;
                self.expect_ident("reuse")?;
                let reuse = self.parse_expr()?;
                let displacing = self.parse_optional_displacing()?;
                let during = self.parse_optional_during()?;
                Command::Recover { percent, reuse, displacing, during }
            }
            "replace" => {
                self.advance();
                let amount = self.parse_expr()?;
                self.expect_ident("of")?;
                let from_stream = self.expect_stream()?;
                self.expect_ident("with")?;
                let to_substance = self.expect_string()?;
                let during = self.parse_optional_during()?;
                Command::Replace { amount, from_stream, to_substance, during }
            }
            "define" => {
                self.advance();
                let name = self.expect_ident_any()?;
                self.expect_symbol_eq()?;
                let expr = self.parse_expr()?;
                Command::Define { name, expr }
            }
            other => return Err(self.err(format!("unknown command '{other}'"))),
        };
        Ok(cmd)
    }

    fn parse_optional_displacing(&mut self) -> PResult<Option<String>> {
        if self.peek_ident_is("displacing") {
            self.advance();
            Ok(Some(self.expect_string()?))
        } else {
            Ok(None)
        }
    }

    fn parse_optional_during(&mut self) -> PResult<YearMatcher> {
        if !self.peek_ident_is("during") {
            return Ok(YearMatcher::all());
        }
        self.advance();
        let start = self.parse_year_bound()?;
        if self.peek_ident_is("to") {
            self.advance();
            let end = self.parse_year_bound()?;
            Ok(YearMatcher { start: Some(start), end: Some(end) })
        } else {
            Ok(YearMatcher { start: Some(start), end: Some(start) })
        }
    }

    fn parse_year_bound(&mut self) -> PResult<YearBound> {
        if self.peek_ident_is("begin") {
            self.advance();
            return Ok(YearBound::Begin);
        }
        if self.peek_ident_is("onwards") {
            self.advance();
            return Ok(YearBound::Onwards);
        }
        Ok(YearBound::Value(self.expect_year_literal()?))
    }

    // --- expressions ---

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> PResult<Expr> {
        let left = self.parse_logical()?;
        if self.peek_ident_is("if") {
            self.advance();
            let cond = self.parse_logical()?;
            self.expect_ident("else")?;
            let else_val = self.parse_ternary()?;
            Ok(Expr::Ternary { cond: Box::new(cond), if_true: Box::new(left), if_false: Box::new(else_val) })
        } else {
            Ok(left)
        }
    }

    fn parse_logical(&mut self) -> PResult<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = if self.peek_ident_is("and") {
                LogicalOp::And
            } else if self.peek_ident_is("or") {
                LogicalOp::Or
            } else if self.peek_ident_is("xor") {
                LogicalOp::Xor
            } else {
                break;
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Logical(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let left = self.parse_additive()?;
        let op = match self.peek_kind() {
            Some(TokenKind::Lt) => Some(CompareOp::Lt),
            Some(TokenKind::Le) => Some(CompareOp::Le),
            Some(TokenKind::Gt) => Some(CompareOp::Gt),
            Some(TokenKind::Ge) => Some(CompareOp::Ge),
            Some(TokenKind::EqEq) => Some(CompareOp::Eq),
            Some(TokenKind::Ne) => Some(CompareOp::Ne),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_additive()?;
            Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
        } else {
            Ok(left)
        }
    }

    fn parse_additive(&mut self) -> PResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => BinOp::Add,
                Some(TokenKind::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::BinOp(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> PResult<Expr> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Star) => BinOp::Mul,
                Some(TokenKind::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_power()?;
            left = Expr::BinOp(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let base = self.parse_unary()?;
        if matches!(self.peek_kind(), Some(TokenKind::Caret)) {
            self.advance();
            let exp = self.parse_power()?; // right-associative
            Ok(Expr::BinOp(Box::new(base), BinOp::Pow, Box::new(exp)))
        } else {
            Ok(base)
        }
    }

    fn parse_unary(&mut self) -> PResult<Expr> {
        if matches!(self.peek_kind(), Some(TokenKind::Minus)) {
            self.advance();
            let inner = self.parse_unary()?;
            Ok(Expr::Neg(Box::new(inner)))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> PResult<Expr> {
        if matches!(self.peek_kind(), Some(TokenKind::LParen)) {
            self.advance();
            let inner = self.parse_expr()?;
            self.expect_symbol(TokenKind::RParen, ")")?;
            return Ok(inner);
        }

        if let Some(n) = self.peek_number() {
            self.advance();
            return self.parse_number_with_optional_unit(n);
        }

        let ident = self.peek_ident().ok_or_else(|| self.err("expected an expression"))?;
        match ident.as_str() {
            "get" => self.parse_get(),
            "limit" => {
                self.advance();
                let value = self.parse_expr()?;
                self.expect_ident("to")?;
                self.expect_symbol(TokenKind::LBracket, "[")?;
                let lo = self.parse_expr()?;
                self.expect_symbol(TokenKind::Comma, ",")?;
                let hi = self.parse_expr()?;
                self.expect_symbol(TokenKind::RBracket, "]")?;
                Ok(Expr::Limit { value: Box::new(value), lo: Box::new(lo), hi: Box::new(hi) })
            }
            "sample" => {
                self.advance();
                let mode = self.expect_ident_any()?;
                match mode.as_str() {
                    "uniformly" => {
                        self.expect_ident("from")?;
                        let lo = self.parse_expr()?;
                        self.expect_ident("to")?;
                        let hi = self.parse_expr()?;
                        Ok(Expr::SampleUniform { lo: Box::new(lo), hi: Box::new(hi) })
                    }
                    "normally" => {
                        self.expect_ident("mean")?;
                        self.expect_ident("of")?;
                        let mean = self.parse_expr()?;
                        self.expect_ident("std")?;
                        self.expect_ident("of")?;
                        let std = self.parse_expr()?;
                        Ok(Expr::SampleNormal { mean: Box::new(mean), std: Box::new(std) })
                    }
                    other => Err(self.err(format!("unknown sampling mode '{other}'"))),
                }
            }
            "yearselapsed" | "years_elapsed" => {
                self.advance();
                Ok(Expr::YearsElapsed)
            }
            "year" => {
                self.advance();
                Ok(Expr::YearAbsolute)
            }
            _ => {
                self.advance();
                Ok(Expr::Var(ident))
            }
        }
    }

    fn parse_get(&mut self) -> PResult<Expr> {
        self.expect_ident("get")?;
        let stream = self.expect_stream()?;
        let of_substance = if self.peek_ident_is("of") {
            self.advance();
            Some(self.expect_string()?)
        } else {
            None
        };
        let as_unit = if self.peek_ident_is("as") {
            self.advance();
            Some(self.expect_unit()?)
        } else {
            None
        };
        Ok(Expr::Get { stream, of_substance, as_unit })
    }

    fn parse_number_with_optional_unit(&mut self, n: Decimal) -> PResult<Expr> {
        if let Some(unit) = self.try_consume_unit_suffix() {
            Ok(Expr::UnitLiteral(n, unit))
        } else {
            Ok(Expr::Number(n))
        }
    }

    /// A unit suffix is one or more unit-like identifiers, optionally
    /// `/ <ident>` for a ratio (e.g. `5 kg`, `3 tCO2e / mt`). Returns `None`
    /// (without consuming) if the next token isn't a recognized unit atom.
    fn try_consume_unit_suffix(&mut self) -> Option<Unit> {
        let start = self.pos;
        let first = self.peek_ident()?;
        if Unit::parse(&first).is_none() {
            return None;
        }
        self.advance();
        if matches!(self.peek_kind(), Some(TokenKind::Slash)) {
            let save = self.pos;
            self.advance();
            if let Some(second) = self.peek_ident() {
                if Unit::parse(&second).is_some() {
                    self.advance();
                    return Unit::parse(&format!("{first} / {second}"));
                }
            }
            self.pos = save;
        }
        let parsed = Unit::parse(&first);
        if parsed.is_none() {
            self.pos = start;
        }
        parsed
    }

    // --- token helpers ---

    fn at_eof(&self) -> bool {
        matches!(self.tokens.get(self.pos).map(|t| &t.kind), Some(TokenKind::Eof) | None)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn peek_ident(&self) -> Option<String> {
        match self.peek_kind() {
            Some(TokenKind::Ident(s)) => Some(s.to_lowercase()),
            _ => None,
        }
    }

    fn peek_nth_ident_is(&self, n: usize, want: &str) -> bool {
        matches!(self.tokens.get(self.pos + n).map(|t| &t.kind), Some(TokenKind::Ident(s)) if s.eq_ignore_ascii_case(want))
    }

    fn peek_ident_is(&self, want: &str) -> bool {
        self.peek_ident().as_deref() == Some(want)
    }

    fn peek_number(&self) -> Option<Decimal> {
        match self.peek_kind() {
            Some(TokenKind::Number(n)) => Some(*n),
            _ => None,
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn expect_ident(&mut self, want: &str) -> PResult<()> {
        if self.peek_ident_is(want) {
            self.advance();
            Ok(())
        } else {
            let found = self.peek_ident().unwrap_or_else(|| "<non-identifier>".to_string());
            Err(self.err(format!("expected '{want}', found '{found}'")))
        }
    }

    fn expect_ident_any(&mut self) -> PResult<String> {
        self.peek_ident().map(|s| {
            self.advance();
            s
        }).ok_or_else(|| self.err("expected an identifier"))
    }

    fn expect_string(&mut self) -> PResult<String> {
        match self.peek_kind() {
            Some(TokenKind::String(s)) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => Err(self.err("expected a quoted string")),
        }
    }

    fn expect_number(&mut self) -> PResult<Decimal> {
        self.peek_number().map(|n| {
            self.advance();
            n
        }).ok_or_else(|| self.err("expected a number"))
    }

    fn expect_year_literal(&mut self) -> PResult<i32> {
        let n = self.expect_number()?;
        n.to_string().parse::<i32>().map_err(|_| self.err("expected an integer year"))
    }

    fn expect_channel(&mut self) -> PResult<Channel> {
        let ident = self.expect_ident_any()?;
        match ident.as_str() {
            "manufacture" => Ok(Channel::Manufacture),
            "import" => Ok(Channel::Import),
            "export" => Ok(Channel::Export),
            "recycle" => Ok(Channel::Recycle),
            other => Err(self.err(format!("unknown channel '{other}'"))),
        }
    }

    fn expect_stream(&mut self) -> PResult<StreamKind> {
        let ident = self.expect_ident_any()?;
        StreamKind::parse(&ident).ok_or_else(|| self.err(format!("unknown stream '{ident}'")))
    }

    fn expect_unit(&mut self) -> PResult<Unit> {
        let first = self.expect_ident_any()?;
        if matches!(self.peek_kind(), Some(TokenKind::Slash)) {
            self.advance();
            let second = self.expect_ident_any()?;
            return Unit::parse(&format!("{first} / {second}")).ok_or_else(|| self.err("unknown unit"));
        }
        Unit::parse(&first).ok_or_else(|| self.err(format!("unknown unit '{first}'")))
    }

    fn expect_symbol(&mut self, kind: TokenKind, text: &str) -> PResult<()> {
        if self.peek_kind() == Some(&kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("expected '{text}'")))
        }
    }

    fn expect_symbol_eq(&mut self) -> PResult<()> {
        self.expect_symbol(TokenKind::Eq, "=")
    }

    fn skip_until_matching_end(&mut self) -> PResult<()> {
        let mut depth = 1;
        loop {
            if self.at_eof() {
                return Err(self.err("unterminated 'start' stanza"));
            }
            if self.peek_ident_is("start") {
                depth += 1;
            } else if self.peek_ident_is("end") {
                depth -= 1;
                if depth == 0 {
                    self.advance();
                    return Ok(());
                }
            }
            self.advance();
        }
    }

    fn recover_to_next_stanza(&mut self) {
        while !self.at_eof() && !self.peek_ident_is("start") {
            self.advance();
        }
    }

    fn err(&mut self, message: impl Into<String>) -> () {
        let (line, column) = self.tokens.get(self.pos).map(|t| (t.line, t.column)).unwrap_or((0, 0));
        self.errors.push(ParseError::new(line, column, message));
    }
}

fn eof_token() -> Token {
    Token { kind: TokenKind::Eof, line: 0, column: 0 }
}
