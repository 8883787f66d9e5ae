use std::fmt::{self, Write as _};

#[cfg(feature = "tabular")]
use sha2::{Digest, Sha256};
use wf_domain::{ParamValue, Table};

/// Turns a parameter into the text stored in the `params` field.
///
/// `None` means the parameter is unrepresentable and is left out of the
/// fingerprint altogether.
pub trait ParamSerializer: fmt::Debug + Send + Sync {
    fn serialize(&self, param: &ParamValue) -> Option<String>;
}

/// Textual representation of primitives and standard containers.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinParamSerializer;

impl ParamSerializer for BuiltinParamSerializer {
    fn serialize(&self, param: &ParamValue) -> Option<String> {
        repr(param, &|_| None)
    }
}

/// Builtin representation plus content hashes for tabular values, so that
/// changed data is detected rather than just a changed object.
#[cfg(feature = "tabular")]
#[derive(Debug, Default, Clone, Copy)]
pub struct TabularParamSerializer;

#[cfg(feature = "tabular")]
impl ParamSerializer for TabularParamSerializer {
    fn serialize(&self, param: &ParamValue) -> Option<String> {
        repr(param, &|table| Some(table_repr(table)))
    }
}

/// Pick the richest serializer compiled into this build.
#[must_use]
pub fn select_param_serializer() -> Box<dyn ParamSerializer> {
    #[cfg(feature = "tabular")]
    {
        Box::new(TabularParamSerializer)
    }
    #[cfg(not(feature = "tabular"))]
    {
        Box::new(BuiltinParamSerializer)
    }
}

type TableRepr<'a> = dyn Fn(&Table) -> Option<String> + 'a;

fn repr(param: &ParamValue, table: &TableRepr<'_>) -> Option<String> {
    let text = match param {
        ParamValue::None => "None".to_string(),
        ParamValue::Bool(true) => "True".to_string(),
        ParamValue::Bool(false) => "False".to_string(),
        ParamValue::Int(value) => value.to_string(),
        ParamValue::Float(value) => float_repr(*value),
        ParamValue::Str(value) => quote_str(value),
        ParamValue::Bytes(value) => quote_bytes(value),
        ParamValue::Range { start, stop, step } => {
            if *step == 1 {
                format!("range({start}, {stop})")
            } else {
                format!("range({start}, {stop}, {step})")
            }
        }
        ParamValue::List(items) => format!("[{}]", join(items, table)?),
        ParamValue::Tuple(items) if items.len() == 1 => format!("({},)", join(items, table)?),
        ParamValue::Tuple(items) => format!("({})", join(items, table)?),
        ParamValue::Dict(entries) => {
            let mut parts = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                parts.push(format!("{}: {}", quote_str(key), repr(value, table)?));
            }
            format!("{{{}}}", parts.join(", "))
        }
        ParamValue::Set(items) if items.is_empty() => "set()".to_string(),
        ParamValue::Set(items) => {
            let mut parts = items
                .iter()
                .map(|item| repr(item, table))
                .collect::<Option<Vec<_>>>()?;
            parts.sort();
            parts.dedup();
            format!("{{{}}}", parts.join(", "))
        }
        ParamValue::Table(value) => table(value)?,
        ParamValue::Opaque { .. } => return None,
    };
    Some(text)
}

fn join(items: &[ParamValue], table: &TableRepr<'_>) -> Option<String> {
    let parts = items
        .iter()
        .map(|item| repr(item, table))
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join(", "))
}

fn float_repr(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        let text = if value > 0.0 { "inf" } else { "-inf" };
        text.to_string()
    } else {
        format!("{value:?}")
    }
}

fn quote_str(value: &str) -> String {
    let quote = if value.contains('\'') && !value.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(value.len() + 2);
    out.push(quote);
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02x}", u32::from(c));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

fn quote_bytes(value: &[u8]) -> String {
    let mut out = String::with_capacity(value.len() + 3);
    out.push_str("b'");
    for byte in value {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(char::from(*byte)),
            other => {
                let _ = write!(out, "\\x{other:02x}");
            }
        }
    }
    out.push('\'');
    out
}

/// One 64-bit hash per row, covering the row position and every cell.
#[cfg(feature = "tabular")]
fn table_repr(table: &Table) -> String {
    let hashes: Vec<String> = table
        .rows
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let mut hasher = Sha256::new();
            hasher.update(idx.to_le_bytes());
            for cell in row {
                let text = repr(cell, &|_| None).unwrap_or_else(|| cell_type_name(cell));
                hasher.update((text.len() as u64).to_le_bytes());
                hasher.update(text.as_bytes());
            }
            let digest = hasher.finalize();
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            u64::from_le_bytes(bytes).to_string()
        })
        .collect();
    format!("[{}]", hashes.join(", "))
}

#[cfg(feature = "tabular")]
fn cell_type_name(cell: &ParamValue) -> String {
    match cell {
        ParamValue::Opaque { type_name } => format!("<{type_name}>"),
        _ => "<table>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wf_domain::params::ParamValue as P;

    fn builtin(param: &ParamValue) -> Option<String> {
        BuiltinParamSerializer.serialize(param)
    }

    #[test]
    fn primitives_use_literal_forms() {
        assert_eq!(builtin(&P::None).as_deref(), Some("None"));
        assert_eq!(builtin(&P::Bool(true)).as_deref(), Some("True"));
        assert_eq!(builtin(&P::Int(-3)).as_deref(), Some("-3"));
        assert_eq!(builtin(&P::Float(1.0)).as_deref(), Some("1.0"));
        assert_eq!(builtin(&P::Float(f64::NAN)).as_deref(), Some("nan"));
        assert_eq!(builtin(&P::from("it's")).as_deref(), Some("\"it's\""));
        assert_eq!(builtin(&P::from("a\nb")).as_deref(), Some("'a\\nb'"));
        assert_eq!(
            builtin(&P::Bytes(vec![b'h', 0, b'\''])).as_deref(),
            Some("b'h\\x00\\''")
        );
        assert_eq!(
            builtin(&P::Range {
                start: 0,
                stop: 10,
                step: 2
            })
            .as_deref(),
            Some("range(0, 10, 2)")
        );
    }

    #[test]
    fn containers_are_order_sensitive_except_sets() {
        let list = P::List(vec![P::Int(1), P::from("x")]);
        assert_eq!(builtin(&list).as_deref(), Some("[1, 'x']"));
        let swapped = P::List(vec![P::from("x"), P::Int(1)]);
        assert_ne!(builtin(&list), builtin(&swapped));

        assert_eq!(builtin(&P::Tuple(vec![P::Int(1)])).as_deref(), Some("(1,)"));

        let mut dict = indexmap::IndexMap::new();
        dict.insert("k".to_string(), P::Bool(false));
        assert_eq!(builtin(&P::Dict(dict)).as_deref(), Some("{'k': False}"));

        let a = P::Set(vec![P::Int(2), P::Int(1)]);
        let b = P::Set(vec![P::Int(1), P::Int(2)]);
        assert_eq!(builtin(&a), builtin(&b));
        assert_eq!(builtin(&P::Set(vec![])).as_deref(), Some("set()"));
    }

    #[test]
    fn opaque_values_are_unrepresentable_even_when_nested() {
        let opaque = P::Opaque {
            type_name: "Model".to_string(),
        };
        assert!(builtin(&opaque).is_none());
        assert!(builtin(&P::List(vec![P::Int(1), opaque])).is_none());
    }

    #[test]
    fn builtin_does_not_represent_tables() {
        let table = Table::new(["a"]).with_row(vec![P::Int(1)]);
        assert!(builtin(&P::Table(table)).is_none());
    }

    #[cfg(feature = "tabular")]
    #[test]
    fn tabular_hashes_follow_the_data() {
        let serializer = TabularParamSerializer;
        let table = |v: i64| P::Table(Table::new(["a", "b"]).with_row(vec![P::Int(v), P::from("x")]));
        let first = serializer.serialize(&table(1));
        assert!(first.as_deref().is_some_and(|text| text.starts_with('[')));
        assert_eq!(first, serializer.serialize(&table(1)));
        assert_ne!(first, serializer.serialize(&table(2)));
        assert_eq!(
            serializer.serialize(&P::Int(4)),
            BuiltinParamSerializer.serialize(&P::Int(4))
        );
    }
}
