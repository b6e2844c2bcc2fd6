use serde_json::Value;

use super::ast::{BinaryOp, Expr, Segment, Stmt, UnaryOp};
use super::lexer::{tokenize, Token, TokenKind};
use crate::errors::ExecutionError;

/// Deepest nesting of blocks, parentheses and unary operators a snippet may use
pub const MAX_DEPTH: usize = 64;

fn too_deep(offset: usize) -> ExecutionError {
    ExecutionError::Syntax {
        offset,
        message: "nesting too deep".to_string(),
    }
}

/// Parses a script section into statements
pub fn parse_script(source: &str) -> Result<Vec<Stmt>, ExecutionError> {
    let tokens = tokenize(source, 0)?;
    let mut parser = Parser::new(tokens);
    let mut statements = Vec::new();
    while !parser.at(&TokenKind::Eof) {
        statements.push(parser.statement()?);
    }
    Ok(statements)
}

/// Parses a single expression, e.g. the inside of a `{{ ... }}` tag
pub fn parse_expression(source: &str, base: usize) -> Result<Expr, ExecutionError> {
    let tokens = tokenize(source, base)?;
    let mut parser = Parser::new(tokens);
    let expr = parser.expression()?;
    parser.expect(&TokenKind::Eof, "end of expression")?;
    Ok(expr)
}

struct Frame {
    condition: Option<Expr>,
    then_branch: Vec<Segment>,
    else_branch: Vec<Segment>,
    in_else: bool,
    offset: usize,
}

impl Frame {
    fn new(condition: Option<Expr>, offset: usize) -> Self {
        Self {
            condition,
            then_branch: Vec::new(),
            else_branch: Vec::new(),
            in_else: false,
            offset,
        }
    }

    fn push(&mut self, segment: Segment) {
        if self.in_else {
            self.else_branch.push(segment);
        } else {
            self.then_branch.push(segment);
        }
    }
}

/// Parses markup with `{{ expr }}` interpolation and `{{#if}}`/`{{else}}`/`{{/if}}` blocks
pub fn parse_template(source: &str) -> Result<Vec<Segment>, ExecutionError> {
    let mut stack = vec![Frame::new(None, 0)];
    let mut pos = 0;

    while let Some(rel) = source[pos..].find("{{") {
        let open = pos + rel;
        if open > pos {
            top(&mut stack).push(Segment::Text(source[pos..open].to_string()));
        }

        let close = source[open + 2..]
            .find("}}")
            .map(|c| open + 2 + c)
            .ok_or_else(|| ExecutionError::Syntax {
                offset: open,
                message: "unclosed '{{' tag".to_string(),
            })?;

        let raw = &source[open + 2..close];
        let leading = raw.len() - raw.trim_start().len();
        let tag = raw.trim();
        let tag_offset = open + 2 + leading;

        if let Some(rest) = tag.strip_prefix("#if") {
            if stack.len() > MAX_DEPTH {
                return Err(too_deep(open));
            }
            let condition = parse_expression(rest, tag_offset + 3)?;
            stack.push(Frame::new(Some(condition), open));
        } else if tag == "else" {
            let frame = top(&mut stack);
            if frame.condition.is_none() || frame.in_else {
                return Err(ExecutionError::Syntax {
                    offset: open,
                    message: "unexpected '{{else}}'".to_string(),
                });
            }
            frame.in_else = true;
        } else if tag == "/if" {
            if stack.len() < 2 {
                return Err(ExecutionError::Syntax {
                    offset: open,
                    message: "'{{/if}}' without matching '{{#if}}'".to_string(),
                });
            }
            let frame = stack.pop().ok_or_else(|| ExecutionError::Syntax {
                offset: open,
                message: "template stack underflow".to_string(),
            })?;
            let segment = Segment::If {
                condition: frame.condition.unwrap_or(Expr::Literal(Value::Bool(false))),
                then_branch: frame.then_branch,
                else_branch: frame.else_branch,
            };
            top(&mut stack).push(segment);
        } else {
            let expr = parse_expression(tag, tag_offset)?;
            top(&mut stack).push(Segment::Interpolation(expr));
        }

        pos = close + 2;
    }

    if pos < source.len() {
        top(&mut stack).push(Segment::Text(source[pos..].to_string()));
    }

    if stack.len() > 1 {
        let offset = stack.last().map(|f| f.offset).unwrap_or(0);
        return Err(ExecutionError::Syntax {
            offset,
            message: "'{{#if}}' block is never closed".to_string(),
        });
    }

    Ok(stack.pop().map(|f| f.then_branch).unwrap_or_default())
}

fn top(stack: &mut [Frame]) -> &mut Frame {
    // The root frame is never popped, so the stack is never empty here.
    let last = stack.len() - 1;
    &mut stack[last]
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    /// Every recursive production goes through here; pair with `ascend`
    fn descend(&mut self) -> Result<(), ExecutionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(too_deep(self.peek().offset));
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn peek(&self) -> &Token {
        let idx = self.pos.min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        let idx = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token, ExecutionError> {
        if self.at(kind) {
            Ok(self.advance())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn error(&self, message: String) -> ExecutionError {
        let token = self.peek();
        ExecutionError::Syntax {
            offset: token.offset,
            message: format!("{} (found {:?})", message, token.kind),
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, ExecutionError> {
        match self.peek().kind.clone() {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    fn end_statement(&mut self) {
        self.eat(&TokenKind::Semi);
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ExecutionError> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        self.descend()?;
        let mut body = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            if self.at(&TokenKind::Eof) {
                return Err(self.error("unclosed block".to_string()));
            }
            body.push(self.statement()?);
        }
        self.advance();
        self.ascend();
        Ok(body)
    }

    fn statement(&mut self) -> Result<Stmt, ExecutionError> {
        match self.peek().kind.clone() {
            TokenKind::Semi => {
                self.advance();
                Ok(Stmt::Expr(Expr::Literal(Value::Null)))
            }
            TokenKind::Let => {
                self.advance();
                let name = self.ident("variable name")?;
                self.expect(&TokenKind::Assign, "'='")?;
                let value = self.expression()?;
                self.end_statement();
                Ok(Stmt::Let { name, value })
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.at(&TokenKind::Semi)
                    || self.at(&TokenKind::RBrace)
                    || self.at(&TokenKind::Eof)
                {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.end_statement();
                Ok(Stmt::Return(value))
            }
            TokenKind::If => self.if_statement(),
            TokenKind::While => {
                self.advance();
                let condition = self.expression()?;
                let body = self.block()?;
                Ok(Stmt::While { condition, body })
            }
            TokenKind::Ident(name) if name == "style" => self.style_statement(),
            TokenKind::Ident(name)
                if (name == "output" || name == "print")
                    && self.peek_at(1) == &TokenKind::LParen =>
            {
                let offset = self.advance().offset;
                let args = self.call_args()?;
                if args.len() != 1 {
                    return Err(ExecutionError::Syntax {
                        offset,
                        message: format!("{}() takes exactly one argument", name),
                    });
                }
                self.end_statement();
                let value = args.into_iter().next().unwrap_or(Expr::Literal(Value::Null));
                Ok(Stmt::Output {
                    value,
                    newline: name == "print",
                })
            }
            TokenKind::Ident(name) if self.peek_at(1) == &TokenKind::Assign => {
                self.advance();
                self.advance();
                let value = self.expression()?;
                self.end_statement();
                Ok(Stmt::Assign { name, value })
            }
            _ => {
                let expr = self.expression()?;
                self.end_statement();
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, ExecutionError> {
        self.expect(&TokenKind::If, "'if'")?;
        let condition = self.expression()?;
        let then_branch = self.block()?;
        let else_branch = if self.eat(&TokenKind::Else) {
            if self.at(&TokenKind::If) {
                self.descend()?;
                let chained = self.if_statement()?;
                self.ascend();
                vec![chained]
            } else {
                self.block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If {
            condition,
            then_branch,
            else_branch,
        })
    }

    fn style_statement(&mut self) -> Result<Stmt, ExecutionError> {
        // `style` may also be read as an ordinary variable when not assigned to.
        let is_assignment = matches!(
            (self.peek_at(1), self.peek_at(2), self.peek_at(3)),
            (TokenKind::Dot, TokenKind::Ident(_), TokenKind::Assign)
        ) || matches!(
            (self.peek_at(1), self.peek_at(2), self.peek_at(3), self.peek_at(4)),
            (
                TokenKind::LBracket,
                TokenKind::Str(_),
                TokenKind::RBracket,
                TokenKind::Assign
            )
        );
        if !is_assignment {
            let expr = self.expression()?;
            self.end_statement();
            return Ok(Stmt::Expr(expr));
        }

        self.advance();
        let property = if self.eat(&TokenKind::Dot) {
            camel_to_kebab(&self.ident("style property")?)
        } else {
            self.advance();
            let name = match self.advance().kind {
                TokenKind::Str(s) => s,
                _ => return Err(self.error("expected style property string".to_string())),
            };
            self.expect(&TokenKind::RBracket, "']'")?;
            name.trim().to_lowercase()
        };
        self.expect(&TokenKind::Assign, "'='")?;
        let value = self.expression()?;
        self.end_statement();
        Ok(Stmt::SetStyle { property, value })
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ExecutionError> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.at(&TokenKind::RParen) {
            loop {
                args.push(self.expression()?);
                if !self.eat(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        Ok(args)
    }

    fn expression(&mut self) -> Result<Expr, ExecutionError> {
        self.descend()?;
        let expr = self.conditional()?;
        self.ascend();
        Ok(expr)
    }

    fn conditional(&mut self) -> Result<Expr, ExecutionError> {
        let condition = self.binary(0)?;
        if self.eat(&TokenKind::Question) {
            let then_value = self.expression()?;
            self.expect(&TokenKind::Colon, "':'")?;
            let else_value = self.expression()?;
            return Ok(Expr::Conditional {
                condition: Box::new(condition),
                then_value: Box::new(then_value),
                else_value: Box::new(else_value),
            });
        }
        Ok(condition)
    }

    /// Precedence climbing over the binary operator table
    fn binary(&mut self, min_prec: u8) -> Result<Expr, ExecutionError> {
        let mut left = self.unary()?;
        while let Some((op, prec)) = binary_op(&self.peek().kind) {
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.binary(prec + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExecutionError> {
        let op = match self.peek().kind {
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Bang => UnaryOp::Not,
            _ => return self.postfix(),
        };
        self.advance();
        self.descend()?;
        let operand = self.unary()?;
        self.ascend();
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ExecutionError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                let offset = self.peek().offset;
                let property = self.ident("property name")?;
                if self.at(&TokenKind::LParen) {
                    let mut args = vec![expr];
                    args.extend(self.call_args()?);
                    expr = Expr::Call {
                        function: method_alias(&property).to_string(),
                        args,
                        offset,
                    };
                } else {
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
            } else if self.eat(&TokenKind::LBracket) {
                let index = self.expression()?;
                self.expect(&TokenKind::RBracket, "']'")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExecutionError> {
        let token = self.advance();
        let expr = match token.kind {
            TokenKind::Number(n) => Expr::Literal(number_value(n)),
            TokenKind::Str(s) => Expr::Literal(Value::String(s)),
            TokenKind::True => Expr::Literal(Value::Bool(true)),
            TokenKind::False => Expr::Literal(Value::Bool(false)),
            TokenKind::Null => Expr::Literal(Value::Null),
            TokenKind::LParen => {
                let inner = self.expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
                inner
            }
            TokenKind::Ident(name) => {
                if self.at(&TokenKind::LParen) {
                    let args = self.call_args()?;
                    Expr::Call {
                        function: name,
                        args,
                        offset: token.offset,
                    }
                } else {
                    Expr::Var {
                        name,
                        offset: token.offset,
                    }
                }
            }
            other => {
                return Err(ExecutionError::Syntax {
                    offset: token.offset,
                    message: format!("unexpected token {:?}", other),
                });
            }
        };
        Ok(expr)
    }
}

fn binary_op(kind: &TokenKind) -> Option<(BinaryOp, u8)> {
    let entry = match kind {
        TokenKind::OrOr => (BinaryOp::Or, 1),
        TokenKind::AndAnd => (BinaryOp::And, 2),
        TokenKind::EqEq => (BinaryOp::Eq, 3),
        TokenKind::NotEq => (BinaryOp::NotEq, 3),
        TokenKind::Lt => (BinaryOp::Lt, 4),
        TokenKind::Le => (BinaryOp::Le, 4),
        TokenKind::Gt => (BinaryOp::Gt, 4),
        TokenKind::Ge => (BinaryOp::Ge, 4),
        TokenKind::Plus => (BinaryOp::Add, 5),
        TokenKind::Minus => (BinaryOp::Sub, 5),
        TokenKind::Star => (BinaryOp::Mul, 6),
        TokenKind::Slash => (BinaryOp::Div, 6),
        TokenKind::Percent => (BinaryOp::Rem, 6),
        _ => return None,
    };
    Some(entry)
}

fn method_alias(method: &str) -> &str {
    match method {
        "toUpperCase" => "upper",
        "toLowerCase" => "lower",
        "toFixed" => "fixed",
        "includes" => "contains",
        "toString" => "str",
        other => other,
    }
}

fn number_value(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// `fontWeight` -> `font-weight`, matching how inline style properties are written
pub fn camel_to_kebab(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            out.push('-');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_multiplies_before_adding() {
        let expr = parse_expression("1 + 2 * 3", 0).unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::Add,
                right,
                ..
            } => assert!(matches!(*right, Expr::Binary { op: BinaryOp::Mul, .. })),
            other => panic!("unexpected tree {:?}", other),
        }
    }

    #[test]
    fn parses_else_if_chain() {
        let stmts = parse_script("if a > 1 { print('x'); } else if b { print('y'); } else { print('z'); }")
            .unwrap();
        assert_eq!(stmts.len(), 1);
        match &stmts[0] {
            Stmt::If { else_branch, .. } => {
                assert!(matches!(else_branch[0], Stmt::If { .. }));
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn style_assignment_forms() {
        let stmts = parse_script("style.fontWeight = 'bold'; style[\"Color\"] = 'red';").unwrap();
        assert_eq!(
            stmts[0],
            Stmt::SetStyle {
                property: "font-weight".to_string(),
                value: Expr::Literal(Value::String("bold".to_string())),
            }
        );
        assert!(matches!(&stmts[1], Stmt::SetStyle { property, .. } if property == "color"));
    }

    #[test]
    fn method_calls_desugar_to_builtins() {
        let expr = parse_expression("name.toUpperCase()", 0).unwrap();
        assert!(matches!(expr, Expr::Call { ref function, ref args, .. } if function == "upper" && args.len() == 1));
    }

    #[test]
    fn template_with_nested_blocks() {
        let segments =
            parse_template("Hi {{name}}{{#if vip}}!{{#if gold}}*{{/if}}{{else}}.{{/if}}").unwrap();
        assert_eq!(segments.len(), 3);
        assert!(matches!(segments[1], Segment::Interpolation(Expr::Var { ref name, offset: 5 }) if name == "name"));
        match &segments[2] {
            Segment::If {
                then_branch,
                else_branch,
                ..
            } => {
                assert_eq!(then_branch.len(), 2);
                assert_eq!(else_branch, &vec![Segment::Text(".".to_string())]);
            }
            other => panic!("unexpected segment {:?}", other),
        }
    }

    #[test]
    fn unclosed_if_is_rejected() {
        assert!(matches!(
            parse_template("{{#if a}}open"),
            Err(ExecutionError::Syntax { .. })
        ));
        assert!(matches!(
            parse_template("text {{/if}}"),
            Err(ExecutionError::Syntax { .. })
        ));
    }

    #[test]
    fn unclosed_tag_is_rejected() {
        assert!(matches!(
            parse_template("Hello {{name"),
            Err(ExecutionError::Syntax { offset: 6, .. })
        ));
    }

    #[test]
    fn deeply_nested_parentheses_are_rejected() {
        let source = format!("output({}1{})", "(".repeat(5_000), ")".repeat(5_000));
        let err = parse_script(&source).unwrap_err();
        assert!(matches!(err, ExecutionError::Syntax { ref message, .. } if message == "nesting too deep"));

        let shallow = format!("{}1{}", "(".repeat(20), ")".repeat(20));
        assert_eq!(parse_expression(&shallow, 0).unwrap(), Expr::Literal(number_value(1.0)));
    }

    #[test]
    fn deeply_nested_blocks_and_operators_are_rejected() {
        let blocks = format!("{}output(1);{}", "if a { ".repeat(MAX_DEPTH + 1), "}".repeat(MAX_DEPTH + 1));
        assert!(matches!(
            parse_script(&blocks),
            Err(ExecutionError::Syntax { ref message, .. }) if message == "nesting too deep"
        ));

        let negations = format!("{}x", "-".repeat(5_000));
        assert!(matches!(
            parse_expression(&negations, 0),
            Err(ExecutionError::Syntax { ref message, .. }) if message == "nesting too deep"
        ));

        let chain = format!("if a {{ }}{}", " else if a { }".repeat(5_000));
        assert!(parse_script(&chain).is_err());
    }

    #[test]
    fn deeply_nested_template_blocks_are_rejected() {
        let source = format!("{}x{}", "{{#if a}}".repeat(5_000), "{{/if}}".repeat(5_000));
        assert!(matches!(
            parse_template(&source),
            Err(ExecutionError::Syntax { ref message, .. }) if message == "nesting too deep"
        ));

        let nested = format!("{}x{}", "{{#if a}}".repeat(10), "{{/if}}".repeat(10));
        assert_eq!(parse_template(&nested).unwrap().len(), 1);
    }

    #[test]
    fn ternary_parses() {
        let expr = parse_expression("x > 1 ? 'many' : 'one'", 0).unwrap();
        assert!(matches!(expr, Expr::Conditional { .. }));
    }
}
