//! Condition evaluator for `when`, `while`, `until` and `filter` expressions.
//!
//! ```text
//! {status} == done
//! {count} >= 3 and {title} contains "urgent"
//! {branch} starts with feature/ or {force} is not empty
//! ```
//!
//! Clauses are combined strictly left to right; `and`/`or` have no
//! precedence and there are no parentheses. Evaluation never mutates the
//! context.

use crate::context::{single_placeholder, VariableContext};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("'{op}' needs numeric operands, got '{left}' and '{right}'")]
    NonNumeric {
        op: &'static str,
        left: String,
        right: String,
    },

    #[error("'{clause}' is neither a comparison, a single {{var}} nor a quoted literal")]
    Malformed { clause: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conjunction {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    IsEmpty,
    IsNotEmpty,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Operator {
    fn symbol(self) -> &'static str {
        match self {
            Operator::IsEmpty => "is empty",
            Operator::IsNotEmpty => "is not empty",
            Operator::Contains => "contains",
            Operator::NotContains => "not contains",
            Operator::StartsWith => "starts with",
            Operator::EndsWith => "ends with",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
        }
    }
}

/// Word operators carry a leading space and must be followed by whitespace
/// or the end of the clause. `unary` operators take no right operand.
struct OperatorToken {
    text: &'static str,
    op: Operator,
    word: bool,
    unary: bool,
}

const OPERATORS: &[OperatorToken] = &[
    OperatorToken { text: " is not empty", op: Operator::IsNotEmpty, word: true, unary: true },
    OperatorToken { text: " is empty", op: Operator::IsEmpty, word: true, unary: true },
    OperatorToken { text: " not contains", op: Operator::NotContains, word: true, unary: false },
    OperatorToken { text: " contains", op: Operator::Contains, word: true, unary: false },
    OperatorToken { text: " starts with", op: Operator::StartsWith, word: true, unary: false },
    OperatorToken { text: " ends with", op: Operator::EndsWith, word: true, unary: false },
    OperatorToken { text: "==", op: Operator::Eq, word: false, unary: false },
    OperatorToken { text: "!=", op: Operator::Ne, word: false, unary: false },
    OperatorToken { text: ">=", op: Operator::Ge, word: false, unary: false },
    OperatorToken { text: "<=", op: Operator::Le, word: false, unary: false },
    OperatorToken { text: ">", op: Operator::Gt, word: false, unary: false },
    OperatorToken { text: "<", op: Operator::Lt, word: false, unary: false },
];

#[derive(Debug, Clone, PartialEq)]
enum Clause<'a> {
    Compare {
        left: &'a str,
        op: Operator,
        right: &'a str,
    },
    /// A lone `{path}` or quoted literal
    Truthy(&'a str),
    /// No operator matched and the text is not a truthiness operand
    Malformed(&'a str),
}

/// Evaluate a condition. Evaluation errors make the failing clause false.
pub fn evaluate(condition: &str, vars: &VariableContext) -> bool {
    fold(condition, |clause| match eval_clause(clause, vars) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("[Condition] '{}': {} (treated as false)", condition, e);
            false
        }
    })
}

/// Evaluate a condition, surfacing the first evaluation error.
pub fn try_evaluate(condition: &str, vars: &VariableContext) -> Result<bool, ConditionError> {
    let mut first_err = None;
    let result = fold(condition, |clause| match eval_clause(clause, vars) {
        Ok(v) => v,
        Err(e) => {
            first_err.get_or_insert(e);
            false
        }
    });
    match first_err {
        Some(e) => Err(e),
        None => Ok(result),
    }
}

fn fold(condition: &str, mut eval: impl FnMut(&Clause) -> bool) -> bool {
    let mut acc: Option<bool> = None;
    for (conj, text) in split_clauses(condition) {
        let value = eval(&parse_clause(text));
        acc = Some(match (acc, conj) {
            (None, _) => value,
            (Some(prev), Some(Conjunction::Or)) => prev || value,
            (Some(prev), _) => prev && value,
        });
    }
    acc.unwrap_or(false)
}

fn starts_with_ci(s: &str, pat: &str) -> bool {
    s.len() >= pat.len() && s.is_char_boundary(pat.len()) && s[..pat.len()].eq_ignore_ascii_case(pat)
}

/// Split on ` and ` / ` or ` outside quotes and braces.
fn split_clauses(condition: &str) -> Vec<(Option<Conjunction>, &str)> {
    let mut clauses = Vec::new();
    let mut pending: Option<Conjunction> = None;
    let mut start = 0;
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut skip_until = 0;

    let mut prev: Option<char> = None;

    for (i, c) in condition.char_indices() {
        let at_token_start = prev.map_or(true, char::is_whitespace);
        prev = Some(c);
        if i < skip_until {
            continue;
        }
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' if at_token_start => quote = Some(c),
                '{' => depth += 1,
                '}' => depth = depth.saturating_sub(1),
                c if c.is_whitespace() && depth == 0 => {
                    let rest = &condition[i..];
                    let hit = [(" and ", Conjunction::And), (" or ", Conjunction::Or)]
                        .into_iter()
                        .find(|(pat, _)| starts_with_ci(rest, pat));
                    if let Some((pat, conj)) = hit {
                        clauses.push((pending, &condition[start..i]));
                        pending = Some(conj);
                        start = i + pat.len();
                        // keep the trailing space of the keyword out of the scan
                        skip_until = start;
                    }
                }
                _ => {}
            },
        }
    }
    clauses.push((pending, &condition[start..]));
    clauses
}

fn parse_clause(text: &str) -> Clause<'_> {
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut prev: Option<char> = None;

    for (i, c) in text.char_indices() {
        let at_token_start = prev.map_or(true, char::is_whitespace);
        prev = Some(c);
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
                continue;
            }
            None => match c {
                '\'' | '"' if at_token_start => {
                    quote = Some(c);
                    continue;
                }
                '{' => {
                    depth += 1;
                    continue;
                }
                '}' => {
                    depth = depth.saturating_sub(1);
                    continue;
                }
                _ if depth > 0 => continue,
                _ => {}
            },
        }

        let rest = &text[i..];
        for token in OPERATORS {
            if !starts_with_ci(rest, token.text) {
                continue;
            }
            let after = &rest[token.text.len()..];
            if token.word && !(after.is_empty() || after.starts_with(char::is_whitespace)) {
                continue;
            }
            if token.unary && !after.trim().is_empty() {
                continue;
            }
            return Clause::Compare {
                left: text[..i].trim(),
                op: token.op,
                right: after.trim(),
            };
        }
    }
    let text = text.trim();
    if single_placeholder(text).is_some() || is_quoted(text) {
        Clause::Truthy(text)
    } else {
        Clause::Malformed(text)
    }
}

fn is_quoted(s: &str) -> bool {
    ['"', '\''].into_iter().any(|q| {
        s.len() >= 2 && s.starts_with(q) && s.ends_with(q) && !s[1..s.len() - 1].contains(q)
    })
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

fn as_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn eval_clause(clause: &Clause, vars: &VariableContext) -> Result<bool, ConditionError> {
    match clause {
        Clause::Truthy(text) => {
            let v = vars.interpolate(unquote(text));
            let v = v.trim();
            Ok(!(v.is_empty() || v.eq_ignore_ascii_case("false") || v == "0"))
        }
        Clause::Malformed(text) => Err(ConditionError::Malformed {
            clause: text.to_string(),
        }),
        Clause::Compare { left, op, right } => {
            let l = vars.interpolate(unquote(left));
            let r = vars.interpolate(unquote(right));
            compare(&l, *op, &r)
        }
    }
}

fn compare(l: &str, op: Operator, r: &str) -> Result<bool, ConditionError> {
    let ll = l.to_lowercase();
    let rl = r.to_lowercase();
    let numbers = as_number(l).zip(as_number(r));

    let result = match op {
        Operator::IsEmpty => l.trim().is_empty(),
        Operator::IsNotEmpty => !l.trim().is_empty(),
        Operator::Contains => ll.contains(&rl),
        Operator::NotContains => !ll.contains(&rl),
        Operator::StartsWith => ll.starts_with(&rl),
        Operator::EndsWith => ll.ends_with(&rl),
        Operator::Eq => match numbers {
            Some((a, b)) => a == b,
            None => l.trim() == r.trim(),
        },
        Operator::Ne => match numbers {
            Some((a, b)) => a != b,
            None => l.trim() != r.trim(),
        },
        Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
            let (a, b) = numbers.ok_or_else(|| ConditionError::NonNumeric {
                op: op.symbol(),
                left: l.to_string(),
                right: r.to_string(),
            })?;
            match op {
                Operator::Gt => a > b,
                Operator::Ge => a >= b,
                Operator::Lt => a < b,
                _ => a <= b,
            }
        }
    };
    Ok(result)
}
