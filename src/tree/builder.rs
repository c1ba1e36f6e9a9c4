//! Typed tree construction.
//!
//! Second pass of parsing: gives the reader's syntax tree meaning. Decodes
//! opcodes, checks fields and arity, resolves block labels and enforces the
//! typing rules, producing an owned [`Method`]. Any failure aborts the whole
//! method; no partial tree is ever returned.

use super::reader::{SExpr, Value};
use super::{Block, Condition, DataType, Immediate, Method, Node, Opcode};
use crate::core::error::{ParseError, ParseResult};
use hashbrown::HashMap;

pub fn build_method(expr: &SExpr<'_>) -> ParseResult<Method> {
    if expr.head != "method" {
        return Err(ParseError::malformed(
            expr.position,
            format!("expected 'method' but found '{}'", expr.head),
        ));
    }
    check_fields(expr, &["name", "return", "args"])?;
    let name = name_field(expr, "name")?.map(str::to_string);
    let return_type = type_field(expr, "return")?
        .ok_or_else(|| missing(expr, "return"))?;
    let params = match expr.field("args") {
        None => Vec::new(),
        Some(field) => match &field.value {
            Value::List(items) => items
                .iter()
                .map(|v| value_type(v, field.position))
                .collect::<ParseResult<Vec<_>>>()?,
            _ => return Err(ParseError::malformed(field.position, "'args' must be a list of types")),
        },
    };
    if let Some(p) = params.iter().find(|t| **t == DataType::NoType) {
        return Err(ParseError::malformed(expr.position, format!("parameter of type {p}")));
    }
    if expr.children.is_empty() {
        return Err(ParseError::malformed(expr.position, "method has no blocks"));
    }

    let mut labels: HashMap<&str, usize> = HashMap::new();
    for (index, block) in expr.children.iter().enumerate() {
        if block.head != "block" {
            return Err(ParseError::malformed(
                block.position,
                format!("expected 'block' but found '{}'", block.head),
            ));
        }
        check_fields(block, &["name"])?;
        if let Some(label) = name_field(block, "name")? {
            if labels.insert(label, index).is_some() {
                return Err(ParseError::malformed(
                    block.position,
                    format!("duplicate block label '{label}'"),
                ));
            }
        }
    }

    let builder = Builder {
        params: &params,
        return_type,
        labels,
    };
    let mut blocks = Vec::with_capacity(expr.children.len());
    for block in expr.children.iter() {
        let trees = block
            .children
            .iter()
            .map(|t| builder.build(t))
            .collect::<ParseResult<Vec<_>>>()?;
        blocks.push(Block {
            name: name_field(block, "name")?.map(str::to_string),
            trees,
        });
    }
    drop(builder);

    Ok(Method {
        name,
        return_type,
        params,
        blocks,
    })
}

struct Builder<'p, 'a> {
    params: &'p [DataType],
    return_type: DataType,
    labels: HashMap<&'a str, usize>,
}

impl Builder<'_, '_> {
    /// Builds a tree in value position.
    fn build_value(&self, e: &SExpr<'_>) -> ParseResult<Node> {
        let node = self.build(e)?;
        let produces_value = match node.opcode {
            Opcode::StoreIndirect | Opcode::Return | Opcode::Goto | Opcode::IfCmp(_) => false,
            _ => node.ty != DataType::NoType,
        };
        if !produces_value {
            return Err(ParseError::malformed(
                e.position,
                format!("'{}' does not produce a value", e.head),
            ));
        }
        Ok(node)
    }

    fn build(&self, e: &SExpr<'_>) -> ParseResult<Node> {
        let (opcode, declared) = decode(e.head).ok_or_else(|| {
            ParseError::malformed(e.position, format!("unknown opcode '{}'", e.head))
        })?;
        let children = e
            .children
            .iter()
            .map(|c| self.build_value(c))
            .collect::<ParseResult<Vec<_>>>()?;

        match opcode {
            Opcode::Load => {
                check_fields(e, &["parm"])?;
                arity(e, &children, 0)?;
                let ty = scalar(declared);
                let (parm, at) = int_field(e, "parm")?.ok_or_else(|| missing(e, "parm"))?;
                let found = usize::try_from(parm)
                    .ok()
                    .and_then(|i| self.params.get(i))
                    .ok_or_else(|| {
                        ParseError::malformed(
                            at,
                            format!("parameter index {parm} out of range for {} parameters", self.params.len()),
                        )
                    })?;
                if *found != ty {
                    return Err(ParseError::mismatch(e.head, ty, found));
                }
                Ok(Node::new(opcode, ty, Immediate::Parm(parm as u32), children))
            }
            Opcode::Const => {
                if let Some(field) = e.fields.iter().find(|f| f.key.is_some()) {
                    return Err(ParseError::malformed(
                        field.position,
                        format!("unexpected field on '{}'", e.head),
                    ));
                }
                arity(e, &children, 0)?;
                let ty = scalar(declared);
                let mut values = e.positional();
                let field = values
                    .next()
                    .ok_or_else(|| ParseError::malformed(e.position, format!("'{}' needs a value", e.head)))?;
                if let Some(extra) = values.next() {
                    return Err(ParseError::malformed(extra.position, "constant takes a single value"));
                }
                let imm = match (&field.value, ty.is_floating()) {
                    (Value::Int(v), false) => Immediate::Int(fit_integer(*v, ty).ok_or_else(|| {
                        ParseError::malformed(field.position, format!("constant {v} out of range for {ty}"))
                    })?),
                    (Value::Int(v), true) => Immediate::Float(*v as f64),
                    (Value::Float(v), true) => Immediate::Float(*v),
                    _ => {
                        return Err(ParseError::malformed(
                            field.position,
                            format!("invalid literal for '{}'", e.head),
                        ))
                    }
                };
                Ok(Node::new(opcode, ty, imm, children))
            }
            Opcode::LoadIndirect | Opcode::StoreIndirect => {
                let store = opcode == Opcode::StoreIndirect;
                let ty = match declared {
                    Some(ty) => {
                        check_fields(e, &["offset"])?;
                        ty
                    }
                    None => {
                        check_fields(e, &["offset", "type"])?;
                        let ty = type_field(e, "type")?.ok_or_else(|| missing(e, "type"))?;
                        if !ty.is_vector() {
                            return Err(ParseError::mismatch(e.head, "vector type", ty));
                        }
                        ty
                    }
                };
                arity(e, &children, if store { 2 } else { 1 })?;
                expect_type(e.head, &children[0], DataType::Address)?;
                if store {
                    expect_type(e.head, &children[1], ty)?;
                }
                let offset = match int_field(e, "offset")? {
                    None => 0,
                    Some((v, at)) => i32::try_from(v)
                        .map_err(|_| ParseError::malformed(at, format!("offset {v} out of range")))?,
                };
                Ok(Node::new(opcode, ty, Immediate::Offset(offset), children))
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => match declared {
                Some(ty) => {
                    check_fields(e, &[])?;
                    arity(e, &children, 2)?;
                    expect_type(e.head, &children[0], ty)?;
                    expect_type(e.head, &children[1], ty)?;
                    Ok(Node::new(opcode, ty, Immediate::None, children))
                }
                None => {
                    check_fields(e, &["type"])?;
                    arity(e, &children, 2)?;
                    let ty = match type_field(e, "type")? {
                        Some(ty) => ty,
                        None => children[0].ty,
                    };
                    let Some(lane) = ty.lane_type() else {
                        return Err(ParseError::mismatch(e.head, "vector type", ty));
                    };
                    if opcode == Opcode::Div && !lane.is_float() {
                        return Err(ParseError::mismatch(e.head, "VectorFloat or VectorDouble", ty));
                    }
                    expect_type(e.head, &children[0], ty)?;
                    expect_type(e.head, &children[1], ty)?;
                    Ok(Node::new(opcode, ty, Immediate::None, children))
                }
            },
            Opcode::And | Opcode::Or | Opcode::Xor => {
                check_fields(e, &[])?;
                arity(e, &children, 2)?;
                let ty = scalar(declared);
                expect_type(e.head, &children[0], ty)?;
                expect_type(e.head, &children[1], ty)?;
                Ok(Node::new(opcode, ty, Immediate::None, children))
            }
            Opcode::Shl | Opcode::Shr | Opcode::UShr | Opcode::Rol => {
                check_fields(e, &[])?;
                arity(e, &children, 2)?;
                let ty = scalar(declared);
                expect_type(e.head, &children[0], ty)?;
                expect_type(e.head, &children[1], DataType::Int32)?;
                Ok(Node::new(opcode, ty, Immediate::None, children))
            }
            Opcode::Neg | Opcode::Sqrt => {
                check_fields(e, &[])?;
                arity(e, &children, 1)?;
                let ty = scalar(declared);
                expect_type(e.head, &children[0], ty)?;
                Ok(Node::new(opcode, ty, Immediate::None, children))
            }
            Opcode::Return => {
                check_fields(e, &[])?;
                let ty = scalar(declared);
                if ty != self.return_type {
                    return Err(ParseError::mismatch(e.head, self.return_type, ty));
                }
                if ty == DataType::NoType {
                    arity(e, &children, 0)?;
                } else {
                    arity(e, &children, 1)?;
                    expect_type(e.head, &children[0], ty)?;
                }
                Ok(Node::new(opcode, ty, Immediate::None, children))
            }
            Opcode::Goto => {
                check_fields(e, &["target"])?;
                arity(e, &children, 0)?;
                let target = self.target(e)?;
                Ok(Node::new(opcode, DataType::NoType, Immediate::Target(target), children))
            }
            Opcode::IfCmp(_) => {
                check_fields(e, &["target"])?;
                arity(e, &children, 2)?;
                let ty = scalar(declared);
                expect_type(e.head, &children[0], ty)?;
                expect_type(e.head, &children[1], ty)?;
                let target = self.target(e)?;
                Ok(Node::new(opcode, ty, Immediate::Target(target), children))
            }
            Opcode::Call => {
                check_fields(e, &["address", "args"])?;
                let ty = scalar(declared);
                let (address, position) = int_field(e, "address")?.ok_or_else(|| missing(e, "address"))?;
                let address = u64::try_from(address)
                    .map_err(|_| ParseError::malformed(position, format!("call address {address} is negative")))?;
                if let Some(field) = e.field("args") {
                    let Value::List(items) = &field.value else {
                        return Err(ParseError::malformed(field.position, "'args' must be a list of types"));
                    };
                    if items.len() != children.len() {
                        return Err(ParseError::mismatch(
                            e.head,
                            format!("{} arguments", items.len()),
                            format!("{} arguments", children.len()),
                        ));
                    }
                    for (item, child) in items.iter().zip(&children) {
                        expect_type(e.head, child, value_type(item, field.position)?)?;
                    }
                }
                if let Some(bad) = children.iter().find(|c| c.ty.is_vector()) {
                    return Err(ParseError::mismatch(e.head, "scalar argument", bad.ty));
                }
                Ok(Node::new(opcode, ty, Immediate::Address(address), children))
            }
        }
    }

    fn target(&self, e: &SExpr<'_>) -> ParseResult<usize> {
        let label = name_field(e, "target")?.ok_or_else(|| missing(e, "target"))?;
        self.labels.get(label).copied().ok_or_else(|| {
            ParseError::malformed(e.position, format!("undefined block label '{label}'"))
        })
    }
}

/// Splits a mnemonic into opcode and type. `None` type means a vector opcode
/// whose type comes from a field or the children.
fn decode(head: &str) -> Option<(Opcode, Option<DataType>)> {
    match head {
        "goto" => return Some((Opcode::Goto, Some(DataType::NoType))),
        "return" => return Some((Opcode::Return, Some(DataType::NoType))),
        "call" => return Some((Opcode::Call, Some(DataType::NoType))),
        _ => {}
    }
    if let Some(rest) = head.strip_prefix("if") {
        let (ty, cond) = if let Some(c) = rest.strip_prefix("icmp") {
            (DataType::Int32, c)
        } else if let Some(c) = rest.strip_prefix("lcmp") {
            (DataType::Int64, c)
        } else {
            return None;
        };
        let cond = Condition::ALL.into_iter().find(|c| c.suffix() == cond)?;
        return Some((Opcode::IfCmp(cond), Some(ty)));
    }

    let (prefix, stem) = head.split_at(head.char_indices().nth(1)?.0);
    let ty = match prefix {
        "b" => Some(DataType::Int8),
        "s" => Some(DataType::Int16),
        "i" => Some(DataType::Int32),
        "l" => Some(DataType::Int64),
        "f" => Some(DataType::Float),
        "d" => Some(DataType::Double),
        "a" => Some(DataType::Address),
        "v" => None,
        _ => return None,
    };
    let opcode = match stem {
        "load" => Opcode::Load,
        "const" => Opcode::Const,
        "loadi" => Opcode::LoadIndirect,
        "storei" => Opcode::StoreIndirect,
        "add" => Opcode::Add,
        "sub" => Opcode::Sub,
        "mul" => Opcode::Mul,
        "div" => Opcode::Div,
        "and" => Opcode::And,
        "or" => Opcode::Or,
        "xor" => Opcode::Xor,
        "shl" => Opcode::Shl,
        "shr" => Opcode::Shr,
        "ushr" => Opcode::UShr,
        "rol" => Opcode::Rol,
        "neg" => Opcode::Neg,
        "sqrt" => Opcode::Sqrt,
        "return" => Opcode::Return,
        "call" => Opcode::Call,
        _ => return None,
    };

    use DataType::*;
    let legal = match (opcode, ty) {
        (Opcode::LoadIndirect | Opcode::StoreIndirect, _) => true,
        (Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div, None) => true,
        (_, None) => false,
        (Opcode::Load | Opcode::Const, Some(_)) => true,
        (Opcode::Add | Opcode::Sub | Opcode::Mul, Some(t)) => matches!(t, Int32 | Int64 | Float | Double),
        (Opcode::Div | Opcode::Sqrt, Some(t)) => matches!(t, Float | Double),
        (
            Opcode::And | Opcode::Or | Opcode::Xor | Opcode::Shl | Opcode::Shr | Opcode::UShr
            | Opcode::Rol | Opcode::Neg,
            Some(t),
        ) => matches!(t, Int32 | Int64),
        (Opcode::Return | Opcode::Call, Some(t)) => matches!(t, Int32 | Int64 | Float | Double | Address),
        _ => false,
    };
    legal.then_some((opcode, ty))
}

/// Type of a scalar opcode; vector opcodes never reach the callers.
fn scalar(declared: Option<DataType>) -> DataType {
    declared.unwrap_or(DataType::NoType)
}

fn fit_integer(v: i64, ty: DataType) -> Option<i64> {
    let fits = match ty {
        DataType::Int8 => i8::try_from(v).is_ok() || u8::try_from(v).is_ok(),
        DataType::Int16 => i16::try_from(v).is_ok() || u16::try_from(v).is_ok(),
        DataType::Int32 => i32::try_from(v).is_ok() || u32::try_from(v).is_ok(),
        _ => true,
    };
    fits.then_some(v)
}

fn expect_type(opcode: &str, child: &Node, expected: DataType) -> ParseResult<()> {
    if child.ty == expected {
        Ok(())
    } else {
        Err(ParseError::mismatch(opcode, expected, child.ty))
    }
}

fn arity(e: &SExpr<'_>, children: &[Node], expected: usize) -> ParseResult<()> {
    if children.len() == expected {
        Ok(())
    } else {
        Err(ParseError::malformed(
            e.position,
            format!("'{}' expects {expected} children, found {}", e.head, children.len()),
        ))
    }
}

fn check_fields(e: &SExpr<'_>, allowed: &[&str]) -> ParseResult<()> {
    for field in e.fields.iter() {
        match field.key {
            Some(key) if !allowed.contains(&key) => {
                return Err(ParseError::malformed(
                    field.position,
                    format!("unexpected field '{key}' on '{}'", e.head),
                ))
            }
            None => {
                return Err(ParseError::malformed(
                    field.position,
                    format!("unexpected value on '{}'", e.head),
                ))
            }
            _ => {}
        }
    }
    Ok(())
}

fn missing(e: &SExpr<'_>, key: &str) -> ParseError {
    ParseError::malformed(e.position, format!("'{}' requires field '{key}'", e.head))
}

fn int_field(e: &SExpr<'_>, key: &str) -> ParseResult<Option<(i64, usize)>> {
    match e.field(key) {
        None => Ok(None),
        Some(f) => match f.value {
            Value::Int(v) => Ok(Some((v, f.position))),
            _ => Err(ParseError::malformed(f.position, format!("'{key}' must be an integer"))),
        },
    }
}

fn type_field(e: &SExpr<'_>, key: &str) -> ParseResult<Option<DataType>> {
    e.field(key).map(|f| value_type(&f.value, f.position)).transpose()
}

fn value_type(value: &Value<'_>, position: usize) -> ParseResult<DataType> {
    match value {
        Value::Ident(name) | Value::Str(name) => DataType::from_name(name)
            .ok_or_else(|| ParseError::malformed(position, format!("unknown type '{name}'"))),
        _ => Err(ParseError::malformed(position, "expected a type name")),
    }
}

fn name_field<'a>(e: &SExpr<'a>, key: &str) -> ParseResult<Option<&'a str>> {
    match e.field(key) {
        None => Ok(None),
        Some(f) => match f.value {
            Value::Ident(name) | Value::Str(name) => Ok(Some(name)),
            _ => Err(ParseError::malformed(f.position, format!("'{key}' must be a name"))),
        },
    }
}
