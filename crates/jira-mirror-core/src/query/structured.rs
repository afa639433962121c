//! Structured-query front-end: a JQL subset.
//!
//! ```text
//! query      := or_expr [ORDER BY field [ASC|DESC]]
//! or_expr    := and_expr (OR and_expr)*
//! and_expr   := unary (AND unary)*
//! unary      := NOT unary | '(' or_expr ')' | comparison
//! comparison := field op value
//!             | field [NOT] IN '(' value (',' value)* ')'
//!             | field IS [NOT] (EMPTY | NULL)
//! op         := '=' | '!=' | '<' | '<=' | '>' | '>=' | '~' | '!~'
//! ```
//!
//! Parsing never guesses: an unknown field, an operator the field does not
//! support, or a value of the wrong type is a [`QueryError::Syntax`]
//! carrying the byte offset of the offending token.

use crate::fields::{Field, FieldCatalog, FieldKind};
use crate::normalize::{code_for, parse_loose_date, EnumKind};

use super::{
    CompareOp, CompiledQuery, Operand, Predicate, QueryError, QueryFrontend, QueryMode, Ranking,
    SortSpec,
};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Str(String),
    Op(CompareOp),
    LParen,
    RParen,
    Comma,
    End,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    pos: usize,
}

fn op_symbol(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "!=",
        CompareOp::Lt => "<",
        CompareOp::Le => "<=",
        CompareOp::Gt => ">",
        CompareOp::Ge => ">=",
        CompareOp::Contains => "~",
        CompareOp::NotContains => "!~",
    }
}

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | ',' | '"' | '\'' | '=' | '!' | '<' | '>' | '~')
}

fn lex(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let tok = match c {
            '(' => {
                chars.next();
                Tok::LParen
            }
            ')' => {
                chars.next();
                Tok::RParen
            }
            ',' => {
                chars.next();
                Tok::Comma
            }
            '"' | '\'' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        ch if ch == c => {
                            closed = true;
                            break;
                        }
                        ch => value.push(ch),
                    }
                }
                if !closed {
                    return Err(QueryError::syntax(pos, "unterminated string"));
                }
                Tok::Str(value)
            }
            '=' => {
                chars.next();
                Tok::Op(CompareOp::Eq)
            }
            '~' => {
                chars.next();
                Tok::Op(CompareOp::Contains)
            }
            '!' => {
                chars.next();
                match chars.peek().map(|&(_, c)| c) {
                    Some('=') => {
                        chars.next();
                        Tok::Op(CompareOp::Ne)
                    }
                    Some('~') => {
                        chars.next();
                        Tok::Op(CompareOp::NotContains)
                    }
                    _ => return Err(QueryError::syntax(pos, "expected '!=' or '!~'")),
                }
            }
            '<' | '>' => {
                chars.next();
                let or_equal = matches!(chars.peek(), Some(&(_, '=')));
                if or_equal {
                    chars.next();
                }
                Tok::Op(match (c, or_equal) {
                    ('<', false) => CompareOp::Lt,
                    ('<', true) => CompareOp::Le,
                    ('>', false) => CompareOp::Gt,
                    _ => CompareOp::Ge,
                })
            }
            _ => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if !is_word_char(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                Tok::Word(word)
            }
        };
        tokens.push(Token { tok, pos });
    }
    tokens.push(Token {
        tok: Tok::End,
        pos: input.len(),
    });
    Ok(tokens)
}

/// Deepest nesting of parentheses and `NOT` a query may use.
pub const MAX_DEPTH: usize = 64;

struct Parser<'a> {
    tokens: Vec<Token>,
    idx: usize,
    depth: usize,
    catalog: &'a FieldCatalog,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.idx.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        tok
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(&self.peek().tok, Tok::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), QueryError> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(QueryError::syntax(self.peek().pos, format!("expected {}", kw)))
        }
    }

    fn expect(&mut self, want: Tok, what: &str) -> Result<(), QueryError> {
        let t = self.advance();
        if t.tok == want {
            Ok(())
        } else {
            Err(QueryError::syntax(t.pos, format!("expected {}", what)))
        }
    }

    fn parse(&mut self) -> Result<(Predicate, Ranking), QueryError> {
        if self.peek().tok == Tok::End {
            return Err(QueryError::syntax(0, "empty query"));
        }
        let predicate = if self.at_keyword("ORDER") {
            Predicate::All
        } else {
            self.or_expr()?
        };
        let ranking = if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            Ranking::Sort(self.sort_spec()?)
        } else {
            Ranking::Sort(SortSpec::updated_desc())
        };
        let t = self.peek();
        if t.tok != Tok::End {
            return Err(QueryError::syntax(t.pos, "unexpected token"));
        }
        Ok((predicate, ranking))
    }

    fn or_expr(&mut self) -> Result<Predicate, QueryError> {
        let mut parts = vec![self.and_expr()?];
        while self.eat_keyword("OR") {
            parts.push(self.and_expr()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Predicate::Or(parts)
        })
    }

    fn and_expr(&mut self) -> Result<Predicate, QueryError> {
        let mut parts = vec![self.unary()?];
        while self.eat_keyword("AND") {
            parts.push(self.unary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Predicate::And(parts)
        })
    }

    fn unary(&mut self) -> Result<Predicate, QueryError> {
        if self.at_keyword("NOT") {
            self.descend()?;
            self.advance();
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Predicate::Not(Box::new(inner)));
        }
        if self.peek().tok == Tok::LParen {
            self.descend()?;
            self.advance();
            let inner = self.or_expr()?;
            self.expect(Tok::RParen, "')'")?;
            self.depth -= 1;
            return Ok(inner);
        }
        self.comparison()
    }

    /// Enter one nesting level at the current token.
    fn descend(&mut self) -> Result<(), QueryError> {
        if self.depth >= MAX_DEPTH {
            return Err(QueryError::syntax(
                self.peek().pos,
                format!("query nests deeper than {} levels", MAX_DEPTH),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    fn field(&mut self) -> Result<(Field, usize), QueryError> {
        let t = self.advance();
        let name = match t.tok {
            Tok::Word(w) | Tok::Str(w) => w,
            _ => return Err(QueryError::syntax(t.pos, "expected a field name")),
        };
        match self.catalog.resolve(&name) {
            Some(field) => Ok((field, t.pos)),
            None => Err(QueryError::syntax(
                t.pos,
                format!("unknown field '{}'", name),
            )),
        }
    }

    fn sort_spec(&mut self) -> Result<SortSpec, QueryError> {
        let (field, pos) = self.field()?;
        if !field.is_sortable() {
            return Err(QueryError::syntax(
                pos,
                format!("cannot order by '{}'", field.name()),
            ));
        }
        let descending = if self.eat_keyword("DESC") {
            true
        } else {
            self.eat_keyword("ASC");
            false
        };
        Ok(SortSpec { field, descending })
    }

    fn comparison(&mut self) -> Result<Predicate, QueryError> {
        let (field, _) = self.field()?;
        let t = self.advance();
        match t.tok {
            Tok::Op(op) => {
                check_operator(&field, op, t.pos)?;
                let value = self.advance();
                if is_empty_keyword(&value.tok) {
                    return match op {
                        CompareOp::Eq => Ok(Predicate::Empty {
                            field,
                            negated: false,
                        }),
                        CompareOp::Ne => Ok(Predicate::Empty {
                            field,
                            negated: true,
                        }),
                        _ => Err(QueryError::syntax(
                            value.pos,
                            format!("EMPTY cannot be used with '{}'", op_symbol(op)),
                        )),
                    };
                }
                let value = operand(&field, &value)?;
                Ok(Predicate::Compare { field, op, value })
            }
            Tok::Word(w) if w.eq_ignore_ascii_case("IN") => self.in_list(field, false),
            Tok::Word(w) if w.eq_ignore_ascii_case("NOT") => {
                self.expect_keyword("IN")?;
                self.in_list(field, true)
            }
            Tok::Word(w) if w.eq_ignore_ascii_case("IS") => {
                let negated = self.eat_keyword("NOT");
                let value = self.advance();
                if !is_empty_keyword(&value.tok) {
                    return Err(QueryError::syntax(value.pos, "expected EMPTY or NULL"));
                }
                Ok(Predicate::Empty { field, negated })
            }
            _ => Err(QueryError::syntax(
                t.pos,
                format!("expected an operator after '{}'", field.name()),
            )),
        }
    }

    fn in_list(&mut self, field: Field, negated: bool) -> Result<Predicate, QueryError> {
        self.expect(Tok::LParen, "'(' after IN")?;
        let mut values = Vec::new();
        loop {
            let value = self.advance();
            values.push(operand(&field, &value)?);
            let sep = self.advance();
            match sep.tok {
                Tok::Comma => continue,
                Tok::RParen => break,
                _ => return Err(QueryError::syntax(sep.pos, "expected ',' or ')'")),
            }
        }
        Ok(Predicate::In {
            field,
            values,
            negated,
        })
    }
}

fn is_empty_keyword(tok: &Tok) -> bool {
    matches!(tok, Tok::Word(w) if w.eq_ignore_ascii_case("EMPTY") || w.eq_ignore_ascii_case("NULL"))
}

fn check_operator(field: &Field, op: CompareOp, pos: usize) -> Result<(), QueryError> {
    if op.is_ordering() && !field.is_ordered() {
        return Err(QueryError::syntax(
            pos,
            format!(
                "operator '{}' needs a date or number field, '{}' is neither",
                op_symbol(op),
                field.name()
            ),
        ));
    }
    if matches!(op, CompareOp::Contains | CompareOp::NotContains) && !field.is_textual() {
        return Err(QueryError::syntax(
            pos,
            format!(
                "operator '{}' needs a text field, '{}' is not",
                op_symbol(op),
                field.name()
            ),
        ));
    }
    Ok(())
}

fn operand(field: &Field, token: &Token) -> Result<Operand, QueryError> {
    let text = match &token.tok {
        Tok::Word(w) | Tok::Str(w) => w.clone(),
        _ => return Err(QueryError::syntax(token.pos, "expected a value")),
    };
    match field.kind() {
        FieldKind::Key => Ok(Operand::Text(text.to_uppercase())),
        FieldKind::Enum => {
            let kind = if *field == Field::Priority {
                EnumKind::Priority
            } else {
                EnumKind::Status
            };
            Ok(Operand::Enum {
                code: code_for(kind, &text),
                label: text,
            })
        }
        FieldKind::Date => parse_loose_date(&text).map(Operand::Date).ok_or_else(|| {
            QueryError::syntax(
                token.pos,
                format!(
                    "invalid date '{}': use yyyy-MM-dd, \"yyyy-MM-dd HH:mm\" or RFC 3339",
                    text
                ),
            )
        }),
        FieldKind::Number => text.trim().parse::<f64>().map(Operand::Number).map_err(|_| {
            QueryError::syntax(token.pos, format!("invalid number '{}'", text))
        }),
        FieldKind::Text | FieldKind::Identity | FieldKind::Multi => Ok(Operand::Text(text)),
    }
}

/// Parse a structured query into a predicate and ordering.
pub fn parse(raw: &str, catalog: &FieldCatalog) -> Result<(Predicate, Ranking), QueryError> {
    let tokens = lex(raw)?;
    Parser {
        tokens,
        idx: 0,
        depth: 0,
        catalog,
    }
    .parse()
}

/// Structured-query front-end.
pub struct Structured;

impl QueryFrontend for Structured {
    fn mode(&self) -> QueryMode {
        QueryMode::Jql
    }

    fn compile(&self, raw: &str, catalog: &FieldCatalog) -> Result<CompiledQuery, QueryError> {
        let (predicate, ranking) = parse(raw, catalog)?;
        Ok(CompiledQuery {
            mode: QueryMode::Jql,
            source: raw.to_string(),
            predicate,
            ranking,
        })
    }
}
