use indexmap::IndexMap;

/// A job parameter value.
///
/// The variants mirror the primitive and container types that have a stable
/// textual representation. Anything else is carried as [`ParamValue::Opaque`]
/// and never takes part in change detection.
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Range { start: i64, stop: i64, step: i64 },
    List(Vec<ParamValue>),
    Tuple(Vec<ParamValue>),
    Dict(IndexMap<String, ParamValue>),
    Set(Vec<ParamValue>),
    Table(Table),
    Opaque { type_name: String },
}

/// Columnar data passed as a parameter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ParamValue>>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_row(mut self, row: Vec<ParamValue>) -> Self {
        self.rows.push(row);
        self
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}
