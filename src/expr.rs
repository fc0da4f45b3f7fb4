//! Math variables: derived numeric columns built from a user expression.
//!
//! Expressions arrive as text such as `1+<mathvar>Kidney</mathvar>*2`. Each
//! `<mathvar>` span names a dataset column. The rest of the text must be
//! plain arithmetic: numbers, `+ - * / % // **`, unary signs and brackets.
//! Anything else is rejected by the parser instead of being handed to a
//! general evaluator.

use crate::dataset::{Column, Dataset};
use crate::error::{PlotError, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};

const OPEN_TAG: &str = "<mathvar>";
const CLOSE_TAG: &str = "</mathvar>";

/// A stored math variable. Persists as `[raw_expression, display_name, visible]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "(String, String, bool)", into = "(String, String, bool)")]
pub struct MathVar {
    pub raw_expression: String,
    pub display_name: String,
    pub visible: bool,
}

impl MathVar {
    pub fn new(raw_expression: &str) -> Self {
        MathVar {
            raw_expression: raw_expression.to_string(),
            display_name: String::new(),
            visible: true,
        }
    }
}

impl From<(String, String, bool)> for MathVar {
    fn from((raw_expression, display_name, visible): (String, String, bool)) -> Self {
        MathVar {
            raw_expression,
            display_name,
            visible,
        }
    }
}

impl From<MathVar> for (String, String, bool) {
    fn from(v: MathVar) -> Self {
        (v.raw_expression, v.display_name, v.visible)
    }
}

/// Result of a successful evaluation.
#[derive(Debug)]
pub struct Evaluated {
    /// Column name: the expression with the placeholder tags removed.
    pub name: String,
    pub column: Column,
    /// `prior_vars` with the new variable appended.
    pub vars: Vec<MathVar>,
}

/// Evaluate `raw_expression` against `dataset`.
///
/// On failure `prior_vars` is left as it was; the caller decides whether to
/// surface or skip the error.
pub fn evaluate(dataset: &Dataset, prior_vars: &[MathVar], raw_expression: &str) -> Result<Evaluated> {
    let expression = html_unescape(raw_expression).replace('\u{a0}', " ");
    let name = expression.replace(OPEN_TAG, "").replace(CLOSE_TAG, "");

    let tokens = tokenize(&expression)?;
    let ast = Parser::new(tokens).parse()?;
    let values = match ast.eval(dataset)? {
        Value::Scalar(v) => vec![v; dataset.row_count()],
        Value::Vector(v) => v,
    };

    let mut vars = prior_vars.to_vec();
    vars.push(MathVar::new(raw_expression));

    Ok(Evaluated {
        name,
        column: Column::numeric(values),
        vars,
    })
}

/// Re-apply stored variables in order, adding each derived column to the
/// dataset. Variables that no longer evaluate are skipped with a warning.
pub fn replay(
    dataset: &mut Dataset,
    stored: &[MathVar],
    mut on_progress: impl FnMut(usize, usize),
) -> Vec<MathVar> {
    let mut computed: Vec<MathVar> = Vec::with_capacity(stored.len());
    for (i, var) in stored.iter().enumerate() {
        info!("Computing math variable {}", var.raw_expression);
        match evaluate(dataset, &computed, &var.raw_expression) {
            Ok(out) => {
                if let Err(e) = dataset.set_column(&out.name, out.column) {
                    warn!("Math variable {} not restored: {}", var.raw_expression, e);
                    continue;
                }
                computed = out.vars;
                if let Some(last) = computed.last_mut() {
                    last.display_name = var.display_name.clone();
                    last.visible = var.visible;
                }
            }
            Err(e) => {
                warn!("Error computing math variable {}: {}", var.raw_expression, e);
                continue;
            }
        }
        on_progress(i + 1, stored.len());
    }
    computed
}

/// Decode HTML character references the client leaves in submitted text.
pub fn html_unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let end = match rest.find(';') {
            Some(e) if e <= 10 => e,
            _ => {
                out.push('&');
                rest = &rest[1..];
                continue;
            }
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => {
                if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                    u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok().and_then(char::from_u32)
                } else {
                    None
                }
            }
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Num(f64),
    Col(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn syntax_error(msg: impl std::fmt::Display) -> PlotError {
    PlotError::Expression(format!("SyntaxError: {}", msg))
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut i = 0;
    let bytes = src.as_bytes();
    while i < src.len() {
        let rest = &src[i..];
        if let Some(after) = rest.strip_prefix(OPEN_TAG) {
            let close = after
                .find(CLOSE_TAG)
                .ok_or_else(|| syntax_error("unterminated column reference"))?;
            tokens.push(Token::Col(after[..close].to_string()));
            i += OPEN_TAG.len() + close + CLOSE_TAG.len();
            continue;
        }
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\n' | b'\r' => i += 1,
            b'(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            b')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            b'*' if rest.starts_with("**") => {
                tokens.push(Token::Op("**"));
                i += 2;
            }
            b'/' if rest.starts_with("//") => {
                tokens.push(Token::Op("//"));
                i += 2;
            }
            b'+' | b'-' | b'*' | b'/' | b'%' => {
                tokens.push(Token::Op(match c {
                    b'+' => "+",
                    b'-' => "-",
                    b'*' => "*",
                    b'/' => "/",
                    _ => "%",
                }));
                i += 1;
            }
            b'0'..=b'9' | b'.' => {
                let len = number_len(rest);
                let text = &rest[..len];
                let v: f64 = text
                    .parse()
                    .map_err(|_| syntax_error(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Num(v));
                i += len;
            }
            _ => {
                let word: String = rest
                    .chars()
                    .take_while(|ch| ch.is_alphanumeric() || *ch == '_')
                    .collect();
                if word.is_empty() {
                    let ch = rest.chars().next().unwrap_or('?');
                    return Err(syntax_error(format!("unexpected character '{}'", ch)));
                }
                return Err(PlotError::Expression(format!(
                    "UndefinedVariableError: name '{}' is not defined",
                    word
                )));
            }
        }
    }
    Ok(tokens)
}

/// Length of the numeric literal at the start of `s` (digits, one dot,
/// optional exponent).
fn number_len(s: &str) -> usize {
    let b = s.as_bytes();
    let mut i = 0;
    while i < b.len() && (b[i].is_ascii_digit() || b[i] == b'.') {
        i += 1;
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        let mut j = i + 1;
        if j < b.len() && (b[j] == b'+' || b[j] == b'-') {
            j += 1;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            while j < b.len() && b[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

#[derive(Debug)]
enum Expr {
    Num(f64),
    Col(String),
    Neg(Box<Expr>),
    Bin(&'static str, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn parse(mut self) -> Result<Expr> {
        if self.tokens.is_empty() {
            return Err(syntax_error("empty expression"));
        }
        let e = self.additive()?;
        if let Some(t) = self.tokens.get(self.pos) {
            return Err(syntax_error(format!("unexpected token {:?}", t)));
        }
        Ok(e)
    }

    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(op),
            _ => None,
        }
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.multiplicative()?;
        while let Some(op @ ("+" | "-")) = self.peek_op() {
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(op @ ("*" | "/" | "//" | "%")) = self.peek_op() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek_op() {
            Some("-") => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some("+") => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // `**` binds tighter than unary minus on its left and is right-associative.
    fn power(&mut self) -> Result<Expr> {
        let base = self.atom()?;
        if self.peek_op() == Some("**") {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(Expr::Bin("**", Box::new(base), Box::new(exp)));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match tok {
            Some(Token::Num(v)) => Ok(Expr::Num(v)),
            Some(Token::Col(name)) => Ok(Expr::Col(name)),
            Some(Token::LParen) => {
                let e = self.additive()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(e)
                    }
                    _ => Err(syntax_error("missing ')'")),
                }
            }
            Some(t) => Err(syntax_error(format!("unexpected token {:?}", t))),
            None => Err(syntax_error("unexpected end of expression")),
        }
    }
}

enum Value {
    Scalar(f64),
    Vector(Vec<f64>),
}

fn apply(op: &str, a: f64, b: f64) -> f64 {
    match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        "/" => a / b,
        "//" => (a / b).floor(),
        // Sign follows the divisor, as for Python floats.
        "%" => a - b * (a / b).floor(),
        "**" => a.powf(b),
        _ => f64::NAN,
    }
}

impl Expr {
    fn eval(&self, ds: &Dataset) -> Result<Value> {
        Ok(match self {
            Expr::Num(v) => Value::Scalar(*v),
            Expr::Col(name) => {
                let col = ds
                    .column(name)
                    .map_err(|_| PlotError::Expression(format!("KeyError: '{}'", name)))?;
                let values = col.as_f64().ok_or_else(|| {
                    PlotError::Expression(format!(
                        "TypeError: column '{}' is not numeric",
                        name
                    ))
                })?;
                Value::Vector(values.to_vec())
            }
            Expr::Neg(inner) => match inner.eval(ds)? {
                Value::Scalar(v) => Value::Scalar(-v),
                Value::Vector(v) => Value::Vector(v.into_iter().map(|x| -x).collect()),
            },
            Expr::Bin(op, lhs, rhs) => match (lhs.eval(ds)?, rhs.eval(ds)?) {
                (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(apply(op, a, b)),
                (Value::Vector(a), Value::Scalar(b)) => {
                    Value::Vector(a.into_iter().map(|x| apply(op, x, b)).collect())
                }
                (Value::Scalar(a), Value::Vector(b)) => {
                    Value::Vector(b.into_iter().map(|y| apply(op, a, y)).collect())
                }
                (Value::Vector(a), Value::Vector(b)) => Value::Vector(
                    a.into_iter().zip(b).map(|(x, y)| apply(op, x, y)).collect(),
                ),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        Dataset::from_columns(vec![
            ("Kidney".to_string(), Column::numeric(vec![1.0, 2.0, f64::NAN])),
            ("Liver Size".to_string(), Column::numeric(vec![10.0, 20.0, 30.0])),
            (
                "label".to_string(),
                Column::Text(vec![Some("a".into()), Some("b".into()), None]),
            ),
        ])
        .unwrap()
    }

    fn values(col: &Column) -> Vec<f64> {
        col.as_f64().unwrap().to_vec()
    }

    #[test]
    fn placeholders_become_column_references() {
        let ds = dataset();
        let out = evaluate(&ds, &[], "1+<mathvar>Kidney</mathvar>*2").unwrap();
        assert_eq!(out.name, "1+Kidney*2");
        let v = values(&out.column);
        assert_eq!(&v[..2], &[3.0, 5.0]);
        assert!(v[2].is_nan());
        assert_eq!(out.vars, vec![MathVar::new("1+<mathvar>Kidney</mathvar>*2")]);
    }

    #[test]
    fn escaped_client_text_is_normalised() {
        let ds = dataset();
        let raw = "&lt;mathvar&gt;Liver&nbsp;Size&lt;/mathvar&gt;&nbsp;/&nbsp;10";
        let out = evaluate(&ds, &[], raw).unwrap();
        assert_eq!(out.name, "Liver Size / 10");
        assert_eq!(values(&out.column), vec![1.0, 2.0, 3.0]);
        // The stored expression is the raw client text.
        assert_eq!(out.vars[0].raw_expression, raw);
    }

    #[test]
    fn precedence_and_python_operators() {
        let ds = dataset();
        let v = |e: &str| values(&evaluate(&ds, &[], e).unwrap().column)[0];
        assert_eq!(v("2+3*4"), 14.0);
        assert_eq!(v("(2+3)*4"), 20.0);
        assert_eq!(v("-2**2"), -4.0);
        assert_eq!(v("2**3**2"), 512.0);
        assert_eq!(v("7//2"), 3.0);
        assert_eq!(v("-7%3"), 2.0);
        assert_eq!(v("1.5e1-5"), 10.0);
    }

    #[test]
    fn failures_do_not_append_variables() {
        let ds = dataset();
        let prior = vec![MathVar::new("1")];
        for bad in [
            "<mathvar>Missing</mathvar>+1",
            "<mathvar>label</mathvar>*2",
            "1+",
            "(1+2",
            "import_os",
            "",
        ] {
            match evaluate(&ds, &prior, bad) {
                Err(PlotError::Expression(_)) => {}
                other => panic!("{:?} should fail, got {:?}", bad, other.map(|o| o.name)),
            }
        }
        assert_eq!(prior.len(), 1);
    }

    #[test]
    fn replay_matches_incremental_evaluation() {
        let stored = vec![
            MathVar::new("<mathvar>Kidney</mathvar>+1"),
            MathVar::new("<mathvar>Kidney+1</mathvar>*<mathvar>Liver Size</mathvar>"),
        ];

        // Incremental: evaluate and assign one at a time.
        let mut inc = dataset();
        let mut vars = Vec::new();
        for v in &stored {
            let out = evaluate(&inc, &vars, &v.raw_expression).unwrap();
            inc.set_column(&out.name, out.column).unwrap();
            vars = out.vars;
        }

        let mut replayed = dataset();
        let mut calls = 0;
        let computed = replay(&mut replayed, &stored, |_, _| calls += 1);

        assert_eq!(computed, vars);
        assert_eq!(calls, 2);
        for name in ["Kidney+1", "Kidney+1*Liver Size"] {
            let a = inc.numeric(name).unwrap();
            let b = replayed.numeric(name).unwrap();
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(b) {
                assert!(x == y || (x.is_nan() && y.is_nan()));
            }
        }
    }

    #[test]
    fn replay_skips_variables_that_no_longer_evaluate() {
        let stored = vec![
            MathVar::new("<mathvar>Renamed</mathvar>*2"),
            MathVar::new("<mathvar>Kidney</mathvar>*2"),
        ];
        let mut ds = dataset();
        let computed = replay(&mut ds, &stored, |_, _| {});
        assert_eq!(computed, vec![MathVar::new("<mathvar>Kidney</mathvar>*2")]);
        assert!(ds.has_column("Kidney*2"));
        assert!(!ds.has_column("Renamed*2"));
    }

    #[test]
    fn math_var_serialises_as_triple() {
        let v = MathVar {
            raw_expression: "1".into(),
            display_name: "one".into(),
            visible: false,
        };
        assert_eq!(serde_json::to_string(&v).unwrap(), r#"["1","one",false]"#);
        let back: MathVar = serde_json::from_str(r#"["1","one",false]"#).unwrap();
        assert_eq!(back, v);
    }
}
