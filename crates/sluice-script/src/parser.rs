//! pest-backed parser producing the [`crate::ast`] tree.

use pest::iterators::Pair;
use pest::Parser;

use crate::ast::{BinOp, Expr, Stmt, StmtKind, UnaryOp};
use crate::error::{ScriptError, ScriptResult};

#[derive(pest_derive::Parser)]
#[grammar = "grammar.pest"]
struct SluiceParser;

/// Parse a full script into statements.
pub fn parse(source: &str) -> ScriptResult<Vec<Stmt>> {
    let mut pairs = SluiceParser::parse(Rule::program, source).map_err(pest_to_error)?;
    let program = pairs
        .next()
        .ok_or_else(|| tree_error(1, "empty parse result"))?;

    let mut statements = Vec::new();
    for pair in program.into_inner() {
        if pair.as_rule() != Rule::statement {
            continue; // EOI
        }
        let line = pair.line_col().0;
        let inner = pair
            .into_inner()
            .next()
            .ok_or_else(|| tree_error(line, "statement without body"))?;
        let kind = match inner.as_rule() {
            Rule::import_stmt => {
                let module = inner
                    .into_inner()
                    .find(|pair| pair.as_rule() == Rule::ident)
                    .ok_or_else(|| tree_error(line, "import without module"))?;
                StmtKind::Import(module.as_str().to_string())
            }
            Rule::assignment => {
                let mut parts = inner.into_inner();
                let name = parts
                    .next()
                    .ok_or_else(|| tree_error(line, "assignment without target"))?
                    .as_str()
                    .to_string();
                let value_pair = parts
                    .next()
                    .ok_or_else(|| tree_error(line, "assignment without value"))?;
                StmtKind::Assign {
                    name,
                    value: build_expr(value_pair)?,
                }
            }
            Rule::expr => StmtKind::Expr(build_expr(inner)?),
            other => return Err(tree_error(line, &format!("unexpected rule {other:?}"))),
        };
        statements.push(Stmt { line, kind });
    }
    Ok(statements)
}

/// Quick syntax probe: `Ok(())` when the source parses.
pub fn check(source: &str) -> ScriptResult<()> {
    parse(source).map(|_| ())
}

fn build_expr(pair: Pair<Rule>) -> ScriptResult<Expr> {
    let line = pair.line_col().0;
    match pair.as_rule() {
        Rule::expr | Rule::group => {
            let inner = pair
                .into_inner()
                .next()
                .ok_or_else(|| tree_error(line, "empty expression"))?;
            build_expr(inner)
        }
        Rule::comparison | Rule::sum | Rule::product => build_binary_chain(pair),
        Rule::unary => {
            let inner = pair
                .into_inner()
                .next()
                .ok_or_else(|| tree_error(line, "empty unary"))?;
            build_expr(inner)
        }
        Rule::neg => {
            let inner = pair
                .into_inner()
                .next()
                .ok_or_else(|| tree_error(line, "negation without operand"))?;
            Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(build_expr(inner)?),
            })
        }
        Rule::postfix => build_postfix(pair),
        Rule::primary => {
            let inner = pair
                .into_inner()
                .next()
                .ok_or_else(|| tree_error(line, "empty primary"))?;
            build_expr(inner)
        }
        Rule::int => pair
            .as_str()
            .parse::<i64>()
            .map(Expr::Int)
            .map_err(|e| tree_error(line, &format!("integer literal out of range: {e}"))),
        Rule::float => pair
            .as_str()
            .parse::<f64>()
            .map(Expr::Float)
            .map_err(|e| tree_error(line, &format!("bad float literal: {e}"))),
        Rule::string => Ok(Expr::Str(unescape(pair.as_str()))),
        Rule::bool_lit => Ok(Expr::Bool(pair.as_str() == "true")),
        Rule::null_lit => Ok(Expr::Null),
        Rule::missing_lit => Ok(Expr::Missing),
        Rule::ident => Ok(Expr::Ident(pair.as_str().to_string())),
        Rule::list => {
            let items = pair
                .into_inner()
                .map(build_expr)
                .collect::<ScriptResult<Vec<_>>>()?;
            Ok(Expr::List(items))
        }
        Rule::map => {
            let mut entries = Vec::new();
            for entry in pair.into_inner() {
                let entry_line = entry.line_col().0;
                let mut parts = entry.into_inner();
                let key_pair = parts
                    .next()
                    .ok_or_else(|| tree_error(entry_line, "map entry without key"))?;
                let key_inner = key_pair
                    .into_inner()
                    .next()
                    .ok_or_else(|| tree_error(entry_line, "empty map key"))?;
                let key = match key_inner.as_rule() {
                    Rule::string => unescape(key_inner.as_str()),
                    _ => key_inner.as_str().to_string(),
                };
                let value_pair = parts
                    .next()
                    .ok_or_else(|| tree_error(entry_line, "map entry without value"))?;
                entries.push((key, build_expr(value_pair)?));
            }
            Ok(Expr::Map(entries))
        }
        other => Err(tree_error(line, &format!("unexpected rule {other:?}"))),
    }
}

fn build_postfix(pair: Pair<Rule>) -> ScriptResult<Expr> {
    let line = pair.line_col().0;
    let mut inner = pair.into_inner();
    let primary = inner
        .next()
        .ok_or_else(|| tree_error(line, "postfix without primary"))?;
    let mut expr = build_expr(primary)?;

    for op in inner {
        let op_line = op.line_col().0;
        let op = op
            .into_inner()
            .next()
            .ok_or_else(|| tree_error(op_line, "empty postfix operation"))?;
        expr = match op.as_rule() {
            Rule::call_args => {
                let args = op
                    .into_inner()
                    .map(build_expr)
                    .collect::<ScriptResult<Vec<_>>>()?;
                Expr::Call {
                    target: Box::new(expr),
                    args,
                }
            }
            Rule::attr_access => {
                let name = op
                    .into_inner()
                    .next()
                    .ok_or_else(|| tree_error(op_line, "attribute without name"))?
                    .as_str()
                    .to_string();
                Expr::Attr {
                    target: Box::new(expr),
                    name,
                }
            }
            Rule::index => {
                let index = op
                    .into_inner()
                    .next()
                    .ok_or_else(|| tree_error(op_line, "index without expression"))?;
                Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(build_expr(index)?),
                }
            }
            other => return Err(tree_error(op_line, &format!("unexpected rule {other:?}"))),
        };
    }
    Ok(expr)
}

fn build_binary_chain(pair: Pair<Rule>) -> ScriptResult<Expr> {
    let line = pair.line_col().0;
    let mut inner = pair.into_inner();
    let first = inner
        .next()
        .ok_or_else(|| tree_error(line, "empty operator chain"))?;
    let mut lhs = build_expr(first)?;

    while let Some(op_pair) = inner.next() {
        let op = bin_op(op_pair.as_str()).ok_or_else(|| {
            tree_error(op_pair.line_col().0, &format!("unknown operator {}", op_pair.as_str()))
        })?;
        let rhs_pair = inner
            .next()
            .ok_or_else(|| tree_error(line, "operator without right operand"))?;
        let rhs = build_expr(rhs_pair)?;
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
    }
    Ok(lhs)
}

fn bin_op(symbol: &str) -> Option<BinOp> {
    Some(match symbol {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "%" => BinOp::Rem,
        "==" => BinOp::Eq,
        "!=" => BinOp::Ne,
        "<" => BinOp::Lt,
        "<=" => BinOp::Le,
        ">" => BinOp::Gt,
        ">=" => BinOp::Ge,
        _ => return None,
    })
}

/// Strip quotes and resolve the escape set the grammar admits.
fn unescape(raw: &str) -> String {
    let body = &raw[1..raw.len().saturating_sub(1)];
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
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
            Some('\'') => out.push('\''),
            Some(other) => {
                // Grammar rejects this; keep the text if it slips through.
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn pest_to_error(err: pest::error::Error<Rule>) -> ScriptError {
    let line = match err.line_col {
        pest::error::LineColLocation::Pos((line, _)) => line,
        pest::error::LineColLocation::Span((line, _), _) => line,
    };
    ScriptError::Parse {
        line,
        message: err.variant.message().to_string(),
    }
}

fn tree_error(line: usize, message: &str) -> ScriptError {
    ScriptError::Parse {
        line,
        message: message.to_string(),
    }
}
