//! Boolean/arithmetic expression evaluator used by `#if`/`#elif` and by
//! numeric `#define` values.
//!
//! A single left-to-right pass tokenizes the expression and builds a syntax
//! tree with two explicit stacks (pending operators, finished nodes) honoring
//! operator priority. Nodes live in an append-only arena and reference their
//! children by index, so the arena may grow without invalidating anything;
//! evaluation is a read-only post-order walk over the frozen arena.
//!
//! Variables are resolved at parse time against a per-instance table keyed by
//! a 32-bit name hash. Single-argument functions come from a [`FuncRegistry`]
//! injected at construction and shared immutably between instances.

use std::collections::HashMap;
use std::sync::Arc;

use crate::scan::{is_ident_char, is_ident_start};

const EPSILON: f32 = 1e-6;

pub type EvalFn = Arc<dyn Fn(f32) -> f32 + Send + Sync>;

/// 32-bit FNV-1a. Collisions between variable names are not detected; this is
/// a documented limitation of the variable table.
fn name_hash(s: &str) -> u32 {
    let mut h = 0x811c_9dc5u32;
    for &b in s.as_bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Greater,
    Less,
    GreaterEq,
    LessEq,
    Equal,
    NotEqual,
    And,
    Or,
    Not,
    Defined,
    NotDefined,
    Call,
    OpenParen,
}

impl Op {
    /// Lowest to highest: `||` < `&&` < comparisons < `+ -` < `* /` < `^`
    /// < `! defined !defined` < function call. `(` sits below everything as
    /// the stack sentinel.
    fn priority(self) -> u32 {
        match self {
            Op::OpenParen => 0,
            Op::Or => 1,
            Op::And => 2,
            Op::Greater
            | Op::Less
            | Op::GreaterEq
            | Op::LessEq
            | Op::Equal
            | Op::NotEqual => 3,
            Op::Add | Op::Sub => 4,
            Op::Mul | Op::Div => 5,
            Op::Pow => 6,
            Op::Not | Op::Defined | Op::NotDefined => 7,
            Op::Call => 8,
        }
    }

    fn is_unary(self) -> bool {
        matches!(self, Op::Not | Op::Defined | Op::NotDefined | Op::Call)
    }
}

/// Arena node. Children are arena indices, never references.
#[derive(Clone)]
struct Node {
    operand: f32,
    op: Option<Op>,
    left: Option<usize>,
    right: Option<usize>,
    src_index: usize,
    func: Option<EvalFn>,
}

impl Node {
    fn leaf(operand: f32, src_index: usize) -> Self {
        Self {
            operand,
            op: None,
            left: None,
            right: None,
            src_index,
            func: None,
        }
    }

    fn op(op: Op, src_index: usize) -> Self {
        Self {
            operand: 0.0,
            op: Some(op),
            left: None,
            right: None,
            src_index,
            func: None,
        }
    }

    fn call(func: EvalFn, src_index: usize) -> Self {
        Self {
            operand: 0.0,
            op: Some(Op::Call),
            left: None,
            right: None,
            src_index,
            func: Some(func),
        }
    }

    fn priority(&self) -> u32 {
        self.op.map_or(0, Op::priority)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EvalErrorKind {
    #[error("one of operands is missing")]
    MissingOperand,
    #[error("unmatched parenthesis")]
    UnmatchedParenthesis,
    #[error("unknown symbol")]
    UnknownSymbol,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{kind} at column {index}")]
pub struct EvalError {
    pub kind: EvalErrorKind,
    /// Character index into the evaluated expression.
    pub index: usize,
}

impl EvalError {
    fn new(kind: EvalErrorKind, index: usize) -> Self {
        Self { kind, index }
    }
}

/// Registry of single-argument functions callable from expressions.
///
/// Built once, then shared immutably (`Arc`) between evaluator instances.
#[derive(Clone, Default)]
pub struct FuncRegistry {
    map: HashMap<u32, EvalFn>,
}

impl FuncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-seeded with `sin`, `cos` and `abs`.
    pub fn common() -> Self {
        let mut reg = Self::new();
        reg.register("sin", f32::sin);
        reg.register("cos", f32::cos);
        reg.register("abs", f32::abs);
        reg
    }

    /// Returns `false` (and leaves the registry untouched) when `name` is
    /// already taken.
    pub fn register(&mut self, name: &str, f: impl Fn(f32) -> f32 + Send + Sync + 'static) -> bool {
        let id = name_hash(name);
        if self.map.contains_key(&id) {
            return false;
        }
        self.map.insert(id, Arc::new(f));
        true
    }

    fn get(&self, name: &str) -> Option<&EvalFn> {
        self.map.get(&name_hash(name))
    }
}

#[derive(Debug)]
enum TokKind {
    Number(f32),
    Ident(String),
    Op(Op),
    /// Bare `!` (not the `!(`/`!defined` forms); inverts the next leaf when no
    /// operand precedes it, otherwise acts as a logical-not operator.
    Bang,
    Open,
    Close,
}

#[derive(Debug)]
struct Token {
    at: usize,
    kind: TokKind,
}

/// Tokenize one expression. Multi-character operators are recognized first,
/// then the `defined`/`!defined` keywords (case-insensitive, with an optional
/// parenthesized operand whose closing `)` is swallowed), then numeric
/// literals, identifiers and single-character operators. Unrecognized
/// characters are skipped.
fn tokenize(expr: &str) -> Vec<Token> {
    let chars: Vec<char> = expr.chars().collect();
    let mut out = Vec::new();
    let mut swallow_close = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == ' ' || c == '\t' {
            i += 1;
            continue;
        }

        if let Some(&next) = chars.get(i + 1) {
            let two = match (c, next) {
                ('=', '=') => Some(Op::Equal),
                ('!', '=') => Some(Op::NotEqual),
                ('>', '=') => Some(Op::GreaterEq),
                ('<', '=') => Some(Op::LessEq),
                ('&', '&') => Some(Op::And),
                ('|', '|') => Some(Op::Or),
                _ => None,
            };
            if let Some(op) = two {
                out.push(Token {
                    at: i,
                    kind: TokKind::Op(op),
                });
                i += 2;
                continue;
            }
        }

        if c == '!' {
            if ident_run(&chars, i + 1).eq_ignore_ascii_case("defined") {
                out.push(Token {
                    at: i,
                    kind: TokKind::Op(Op::NotDefined),
                });
                i += 1 + "defined".len();
                consume_defined_paren(&chars, &mut i, &mut swallow_close);
                continue;
            }

            // `!(` lowers to a logical-not stack operator; a plain `!` is
            // resolved by the tree builder from context.
            let mut j = i + 1;
            while j < chars.len() && (chars[j] == ' ' || chars[j] == '\t') {
                j += 1;
            }
            let kind = if chars.get(j) == Some(&'(') {
                TokKind::Op(Op::Not)
            } else {
                TokKind::Bang
            };
            out.push(Token { at: i, kind });
            i += 1;
            continue;
        }

        if is_ident_start(c) {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            let name: String = chars[start..i].iter().collect();
            if name.eq_ignore_ascii_case("defined") {
                out.push(Token {
                    at: start,
                    kind: TokKind::Op(Op::Defined),
                });
                consume_defined_paren(&chars, &mut i, &mut swallow_close);
            } else {
                out.push(Token {
                    at: start,
                    kind: TokKind::Ident(name),
                });
            }
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            out.push(Token {
                at: start,
                kind: TokKind::Number(parse_float_prefix(&text)),
            });
            continue;
        }

        let kind = match c {
            '(' => Some(TokKind::Open),
            ')' => {
                if swallow_close {
                    swallow_close = false;
                    i += 1;
                    continue;
                }
                Some(TokKind::Close)
            }
            '+' => Some(TokKind::Op(Op::Add)),
            '-' => Some(TokKind::Op(Op::Sub)),
            '*' => Some(TokKind::Op(Op::Mul)),
            '/' => Some(TokKind::Op(Op::Div)),
            '^' => Some(TokKind::Op(Op::Pow)),
            '>' => Some(TokKind::Op(Op::Greater)),
            '<' => Some(TokKind::Op(Op::Less)),
            _ => None,
        };
        if let Some(kind) = kind {
            out.push(Token { at: i, kind });
        }
        i += 1;
    }

    out
}

/// Longest valid prefix of a digit/dot run, the way `strtof` reads it; a
/// malformed literal like `1.2.3` reads as `1.2`.
fn parse_float_prefix(text: &str) -> f32 {
    let mut s = text;
    loop {
        match s.parse() {
            Ok(v) => return v,
            Err(_) if s.len() > 1 => s = &s[..s.len() - 1],
            Err(_) => return 0.0,
        }
    }
}

fn ident_run(chars: &[char], from: usize) -> String {
    let mut end = from;
    if chars.get(from).copied().is_some_and(is_ident_start) {
        while end < chars.len() && is_ident_char(chars[end]) {
            end += 1;
        }
    }
    chars[from..end].iter().collect()
}

/// After a `defined`/`!defined` keyword: skip blanks and, when the operand is
/// parenthesized, consume the `(` and arrange for its `)` to be dropped.
fn consume_defined_paren(chars: &[char], i: &mut usize, swallow_close: &mut bool) {
    let mut j = *i;
    while j < chars.len() && (chars[j] == ' ' || chars[j] == '\t') {
        j += 1;
    }
    if chars.get(j) == Some(&'(') {
        *i = j + 1;
        *swallow_close = true;
    }
}

/// Tokenizes and evaluates boolean/arithmetic expressions over a variable
/// table and a shared function registry.
///
/// The transient parse state (node arena, operator/node stacks) is reset at
/// the start of every [`evaluate`](Self::evaluate) call; the variable table
/// persists until [`clear_variables`](Self::clear_variables).
pub struct ExpressionEvaluator {
    vars: HashMap<u32, f32>,
    funcs: Arc<FuncRegistry>,
    nodes: Vec<Node>,
    op_stack: Vec<Node>,
    node_stack: Vec<usize>,
    last_expr: String,
    last_error: Option<EvalError>,
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionEvaluator {
    /// Evaluator with the [`FuncRegistry::common`] function set.
    pub fn new() -> Self {
        Self::with_functions(Arc::new(FuncRegistry::common()))
    }

    pub fn with_functions(funcs: Arc<FuncRegistry>) -> Self {
        Self {
            vars: HashMap::new(),
            funcs,
            nodes: Vec::new(),
            op_stack: Vec::new(),
            node_stack: Vec::new(),
            last_expr: String::new(),
            last_error: None,
        }
    }

    pub fn set_variable(&mut self, name: &str, value: f32) {
        self.vars.insert(name_hash(name), value);
    }

    pub fn remove_variable(&mut self, name: &str) {
        self.vars.remove(&name_hash(name));
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.vars.contains_key(&name_hash(name))
    }

    pub fn clear_variables(&mut self) {
        self.vars.clear();
    }

    /// Evaluates `expr` (up to the first line break) to a single float.
    pub fn evaluate(&mut self, expr: &str) -> Result<f32, EvalError> {
        self.reset();
        self.last_expr = expr
            .split(['\n', '\r'])
            .next()
            .unwrap_or_default()
            .to_string();

        match self.build_and_eval() {
            Ok(v) => Ok(v),
            Err(e) => {
                self.last_error = Some(e);
                Err(e)
            }
        }
    }

    /// The pulled diagnostic for the previous failed [`evaluate`](Self::evaluate):
    /// message, expression text, and a caret line marking the failure column.
    /// `None` when the previous call succeeded.
    pub fn last_error_report(&self) -> Option<String> {
        let err = self.last_error?;
        let len = self.last_expr.chars().count();
        let mut caret: Vec<char> = vec![' '; len.max(err.index + 1)];
        caret[err.index] = '^';
        let caret: String = caret.into_iter().collect();
        Some(format!("{}\n{}\n{}\n", err.kind, self.last_expr, caret))
    }

    fn reset(&mut self) {
        self.nodes.clear();
        self.op_stack.clear();
        self.node_stack.clear();
        self.last_error = None;
    }

    fn build_and_eval(&mut self) -> Result<f32, EvalError> {
        let tokens = tokenize(&self.last_expr);

        let mut last_token_operand = false;
        let mut negate_operand = false;
        let mut invert_operand = false;

        for tok in tokens {
            match tok.kind {
                TokKind::Number(value) => {
                    let mut value = value;
                    if negate_operand {
                        value = -value;
                    }
                    if invert_operand {
                        value = if value.abs() > EPSILON { 0.0 } else { 1.0 };
                    }
                    self.push_leaf(value, tok.at);
                    last_token_operand = true;
                    negate_operand = false;
                    invert_operand = false;
                }
                TokKind::Ident(name) => {
                    if let Some(func) = self.funcs.get(&name) {
                        self.op_stack.push(Node::call(func.clone(), tok.at));
                        last_token_operand = false;
                        continue;
                    }

                    let pending = self.top_op();
                    match self.vars.get(&name_hash(&name)).copied() {
                        Some(stored) => {
                            let mut value = stored;
                            if negate_operand {
                                value = -value;
                            }
                            if invert_operand {
                                value = if value.abs() > EPSILON { 0.0 } else { 1.0 };
                            }
                            // defined/!defined care about presence, not value.
                            if pending == Some(Op::Defined) {
                                value = 1.0;
                            }
                            if pending == Some(Op::NotDefined) {
                                value = 0.0;
                            }
                            self.push_leaf(value, tok.at);
                        }
                        None => {
                            if pending == Some(Op::Defined) {
                                self.push_leaf(0.0, tok.at);
                            } else if pending == Some(Op::NotDefined) {
                                self.push_leaf(1.0, tok.at);
                            } else {
                                return Err(EvalError::new(EvalErrorKind::UnknownSymbol, tok.at));
                            }
                        }
                    }
                    last_token_operand = true;
                    negate_operand = false;
                    invert_operand = false;
                }
                TokKind::Bang => {
                    if last_token_operand {
                        self.drain_while_ge(Op::Not.priority())?;
                        self.op_stack.push(Node::op(Op::Not, tok.at));
                        last_token_operand = false;
                    } else {
                        invert_operand = true;
                    }
                }
                TokKind::Op(Op::Not) => {
                    self.op_stack.push(Node::op(Op::Not, tok.at));
                    last_token_operand = false;
                }
                TokKind::Op(op) => {
                    if op == Op::Sub && !last_token_operand {
                        negate_operand = true;
                        continue;
                    }
                    // Equal priority pops too: the left part evaluates first.
                    self.drain_while_ge(op.priority())?;
                    self.op_stack.push(Node::op(op, tok.at));
                    last_token_operand = false;
                }
                TokKind::Open => {
                    self.op_stack.push(Node::op(Op::OpenParen, tok.at));
                    last_token_operand = false;
                }
                TokKind::Close => {
                    loop {
                        match self.op_stack.last() {
                            None => {
                                return Err(EvalError::new(
                                    EvalErrorKind::UnmatchedParenthesis,
                                    tok.at,
                                ));
                            }
                            Some(top) if top.op == Some(Op::OpenParen) => break,
                            Some(_) => {
                                if let Some(n) = self.op_stack.pop() {
                                    self.connect(n)?;
                                }
                            }
                        }
                    }
                    self.op_stack.pop();

                    // A `!(...)` or `name(...)` wrapper binds the whole group.
                    if self.top_op() == Some(Op::Not) {
                        if let Some(n) = self.op_stack.pop() {
                            self.connect(n)?;
                        }
                    }
                    if self.top_op() == Some(Op::Call) {
                        if let Some(n) = self.op_stack.pop() {
                            self.connect(n)?;
                        }
                    }
                    last_token_operand = true;
                }
            }
        }

        while let Some(top) = self.op_stack.last() {
            if top.op == Some(Op::OpenParen) {
                return Err(EvalError::new(
                    EvalErrorKind::UnmatchedParenthesis,
                    top.src_index,
                ));
            }
            if let Some(n) = self.op_stack.pop() {
                self.connect(n)?;
            }
        }

        // Exactly one index remains on the node stack: the tree root.
        match self.node_stack.last().copied() {
            Some(root) => self.eval_node(root),
            None => Err(EvalError::new(EvalErrorKind::MissingOperand, 0)),
        }
    }

    fn push_leaf(&mut self, value: f32, src_index: usize) {
        self.node_stack.push(self.nodes.len());
        self.nodes.push(Node::leaf(value, src_index));
    }

    fn top_op(&self) -> Option<Op> {
        self.op_stack.last().and_then(|n| n.op)
    }

    /// Pops operators with priority >= `priority`, connecting each to its
    /// operands from the node stack.
    fn drain_while_ge(&mut self, priority: u32) -> Result<(), EvalError> {
        while self
            .op_stack
            .last()
            .is_some_and(|top| top.op != Some(Op::OpenParen) && top.priority() >= priority)
        {
            let Some(n) = self.op_stack.pop() else { break };
            self.connect(n)?;
        }
        Ok(())
    }

    /// Attaches operands (one for unary, two for binary) from the node stack
    /// and appends the finished node back onto it.
    fn connect(&mut self, mut n: Node) -> Result<(), EvalError> {
        let unary = n.op.is_some_and(Op::is_unary);
        n.right = Some(
            self.node_stack
                .pop()
                .ok_or(EvalError::new(EvalErrorKind::MissingOperand, n.src_index))?,
        );
        if !unary {
            n.left = Some(
                self.node_stack
                    .pop()
                    .ok_or(EvalError::new(EvalErrorKind::MissingOperand, n.src_index))?,
            );
        }
        self.node_stack.push(self.nodes.len());
        self.nodes.push(n);
        Ok(())
    }

    /// Post-order evaluation over the frozen arena. No node is appended while
    /// this walk is in progress.
    fn eval_node(&self, index: usize) -> Result<f32, EvalError> {
        let node = &self.nodes[index];
        let Some(op) = node.op else {
            return Ok(node.operand);
        };

        let missing = EvalError::new(EvalErrorKind::MissingOperand, node.src_index);
        let right = node.right.ok_or(missing)?;
        let y = self.eval_node(right)?;

        if op.is_unary() {
            return match op {
                Op::Defined | Op::NotDefined => {
                    // Presence was already decided at parse time; the operand
                    // leaf carries the truth value.
                    Ok(if y == 0.0 { 0.0 } else { 1.0 })
                }
                Op::Not => Ok(if y.abs() > EPSILON { 0.0 } else { 1.0 }),
                Op::Call => {
                    let func = node.func.as_ref().ok_or(missing)?;
                    Ok(func(y))
                }
                _ => Err(missing),
            };
        }

        let left = node.left.ok_or(missing)?;
        let x = self.eval_node(left)?;

        let out = match op {
            Op::Add => x + y,
            Op::Sub => x - y,
            Op::Mul => x * y,
            Op::Div => x / y,
            Op::Pow => x.powf(y),
            Op::Greater => f32::from(x > y),
            Op::Less => f32::from(x < y),
            Op::GreaterEq => f32::from(x >= y),
            Op::LessEq => f32::from(x <= y),
            Op::Equal => f32::from((x - y).abs() < EPSILON),
            Op::NotEqual => f32::from((x - y).abs() >= EPSILON),
            Op::And => f32::from(x.abs() > EPSILON && y.abs() > EPSILON),
            Op::Or => f32::from(x.abs() > EPSILON || y.abs() > EPSILON),
            _ => return Err(missing),
        };
        Ok(out)
    }
}
