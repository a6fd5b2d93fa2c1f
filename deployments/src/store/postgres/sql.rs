//! Renders filters, updates and index definitions as SQL over a JSONB
//! `doc` column. Values go through [`Params`]: data statements bind them,
//! index definitions inline them as escaped literals because partial index
//! predicates cannot carry bind parameters.

use crate::store::update::{UpdateOp, set_path};
use crate::store::{Document, Filter, IndexModel, IndexOrder, SortOrder, Update};
use serde_json::Value;

const MAX_IDENT_LEN: usize = 63;

/// Values referenced by a rendered statement, in placeholder order.
#[derive(Debug, Default)]
pub struct Params {
    values: Vec<Value>,
    inline: bool,
}

impl Params {
    /// Placeholders numbered from `$1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Escaped literals instead of placeholders.
    pub fn inline() -> Self {
        Self {
            values: Vec::new(),
            inline: true,
        }
    }

    fn json(&mut self, value: &Value) -> String {
        if self.inline {
            return format!("{}::jsonb", quote_literal(&value.to_string()));
        }
        self.bind(value.clone())
    }

    /// Adds a JSONB parameter and returns its placeholder.
    pub fn bind(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("${}::jsonb", self.values.len())
    }

    fn text(&mut self, text: &str) -> String {
        if self.inline {
            return quote_literal(text);
        }
        self.values.push(Value::String(text.to_string()));
        format!("(${}::jsonb #>> '{{}}')", self.values.len())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_literal(text: &str) -> String {
    let escaped = text.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{escaped}'")
    }
}

fn path_literal(path: &str) -> String {
    let elements: Vec<String> = path
        .split('.')
        .map(|segment| {
            format!(
                "\"{}\"",
                segment.replace('\\', "\\\\").replace('"', "\\\"")
            )
        })
        .collect();
    quote_literal(&format!("{{{}}}", elements.join(",")))
}

pub fn field(col: &str, path: &str) -> String {
    format!("({col} #> {})", path_literal(path))
}

fn text_field(col: &str, path: &str) -> String {
    format!("({col} #>> {})", path_literal(path))
}

fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn comparison(col: &str, path: &str, op: &str, value: &Value, params: &mut Params) -> String {
    let f = field(col, path);
    let v = params.json(value);
    format!("COALESCE(jsonb_typeof({f}) = jsonb_typeof({v}) AND {f} {op} {v}, FALSE)")
}

/// Boolean SQL expression for `filter` evaluated against the JSONB
/// expression `col`. Never yields SQL NULL.
pub fn render_filter(filter: &Filter, col: &str, params: &mut Params) -> String {
    match filter {
        Filter::All => "TRUE".to_string(),
        Filter::Eq(path, Value::Null) => {
            let f = field(col, path);
            format!("({f} IS NULL OR {f} = 'null'::jsonb)")
        }
        Filter::Eq(path, value) => {
            format!("COALESCE({} = {}, FALSE)", field(col, path), params.json(value))
        }
        Filter::Ne(path, Value::Null) => {
            render_filter(&Filter::NotNull(path.clone()), col, params)
        }
        Filter::Ne(path, value) => {
            format!("({} IS DISTINCT FROM {})", field(col, path), params.json(value))
        }
        Filter::Gt(path, value) => comparison(col, path, ">", value, params),
        Filter::Gte(path, value) => comparison(col, path, ">=", value, params),
        Filter::Lt(path, value) => comparison(col, path, "<", value, params),
        Filter::Lte(path, value) => comparison(col, path, "<=", value, params),
        Filter::In(path, values) => render_filter(
            &Filter::Or(
                values
                    .iter()
                    .map(|value| Filter::Eq(path.clone(), value.clone()))
                    .collect(),
            ),
            col,
            params,
        ),
        Filter::Exists(path, true) => format!("({} IS NOT NULL)", field(col, path)),
        Filter::Exists(path, false) => format!("({} IS NULL)", field(col, path)),
        Filter::NotNull(path) => format!("COALESCE({} <> 'null'::jsonb, FALSE)", field(col, path)),
        Filter::ElemMatch {
            array,
            field: elem_field,
            value,
        } => {
            let mut element = Document::new();
            set_path(&mut element, elem_field, value.clone());
            let f = field(col, array);
            format!(
                "COALESCE(jsonb_typeof({f}) = 'array' AND {f} @> {}, FALSE)",
                params.json(&Value::Array(vec![Value::Object(element)]))
            )
        }
        Filter::Contains(path, text) => format!(
            "COALESCE(jsonb_typeof({}) = 'string' AND {} ILIKE {}, FALSE)",
            field(col, path),
            text_field(col, path),
            params.text(&format!("%{}%", escape_like(text)))
        ),
        Filter::And(filters) if filters.is_empty() => "TRUE".to_string(),
        Filter::And(filters) => join(filters, col, " AND ", params),
        Filter::Or(filters) if filters.is_empty() => "FALSE".to_string(),
        Filter::Or(filters) => join(filters, col, " OR ", params),
        Filter::Not(filter) => format!("(NOT {})", render_filter(filter, col, params)),
    }
}

fn join(filters: &[Filter], col: &str, separator: &str, params: &mut Params) -> String {
    let parts: Vec<String> = filters
        .iter()
        .map(|filter| render_filter(filter, col, params))
        .collect();
    format!("({})", parts.join(separator))
}

// Makes sure every parent object of `path` exists so jsonb_set can create
// the leaf. Parents are read from the untouched `col`.
fn with_parents(col: &str, path: &str) -> String {
    let segments: Vec<&str> = path.split('.').collect();
    let mut expr = col.to_string();
    for depth in 1..segments.len() {
        let prefix = segments[..depth].join(".");
        let parent = field(col, &prefix);
        expr = format!(
            "jsonb_set({expr}, {}, CASE WHEN jsonb_typeof({parent}) = 'object' THEN {parent} ELSE '{{}}'::jsonb END, true)",
            path_literal(&prefix)
        );
    }
    expr
}

fn render_op(op: &UpdateOp, col: &str, params: &mut Params) -> String {
    match op {
        UpdateOp::Set(path, value) => format!(
            "jsonb_set({}, {}, {}, true)",
            with_parents(col, path),
            path_literal(path),
            params.json(value)
        ),
        UpdateOp::Unset(path) => format!("({col} #- {})", path_literal(path)),
        UpdateOp::Inc(path, by) => {
            let f = field(col, path);
            format!(
                "jsonb_set({}, {}, to_jsonb(COALESCE(CASE WHEN jsonb_typeof({f}) = 'number' THEN {}::numeric END, 0) + {by}), true)",
                with_parents(col, path),
                path_literal(path),
                text_field(col, path)
            )
        }
        UpdateOp::Push(path, value) => {
            let f = field(col, path);
            format!(
                "jsonb_set({}, {}, (CASE WHEN jsonb_typeof({f}) = 'array' THEN {f} ELSE '[]'::jsonb END) || jsonb_build_array({}), true)",
                with_parents(col, path),
                path_literal(path),
                params.json(value)
            )
        }
        UpdateOp::SetWhen { cases, .. } if cases.is_empty() => col.to_string(),
        UpdateOp::SetWhen { path, cases } => {
            let branches: Vec<String> = cases
                .iter()
                .map(|(filter, value)| {
                    format!(
                        "WHEN {} THEN jsonb_set({}, {}, {}, true)",
                        render_filter(filter, col, params),
                        with_parents(col, path),
                        path_literal(path),
                        params.json(value)
                    )
                })
                .collect();
            format!("CASE {} ELSE {col} END", branches.join(" "))
        }
    }
}

/// Expression computing the updated document from `source`. Each operation
/// is a lateral stage reading the previous stage's result. `OFFSET 0` keeps
/// the planner from folding a stage into the next one.
pub fn render_update(update: &Update, source: &str, params: &mut Params) -> String {
    let ops = update.ops();
    if ops.is_empty() {
        return source.to_string();
    }
    let mut sql = format!("(SELECT s{}.doc FROM (SELECT {source}) AS s0(doc)", ops.len());
    for (i, op) in ops.iter().enumerate() {
        sql.push_str(&format!(
            " CROSS JOIN LATERAL (SELECT {} OFFSET 0) AS s{}(doc)",
            render_op(op, &format!("s{i}.doc"), params),
            i + 1
        ));
    }
    sql.push(')');
    sql
}

pub fn render_sort(path: &str, order: SortOrder) -> String {
    match order {
        SortOrder::Asc => format!("ORDER BY {} ASC NULLS FIRST", field("c.doc", path)),
        SortOrder::Desc => format!("ORDER BY {} DESC NULLS LAST", field("c.doc", path)),
    }
}

fn fnv1a(text: &str) -> u32 {
    text.bytes().fold(0x811c_9dc5, |hash: u32, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

/// Physical index name, unique within the schema and within Postgres'
/// identifier length limit.
pub fn index_name(collection: &str, name: &str) -> String {
    let raw = format!("{collection}_{name}");
    let sanitized: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.len() <= MAX_IDENT_LEN {
        return sanitized;
    }
    format!("{}_{:08x}", &sanitized[..MAX_IDENT_LEN - 9], fnv1a(&raw))
}

pub fn render_create_index(schema: &str, collection: &str, index: &IndexModel) -> String {
    let keys: Vec<String> = index
        .keys
        .iter()
        .map(|(path, order)| match order {
            IndexOrder::Asc => format!("({})", field("doc", path)),
            IndexOrder::Desc => format!("({}) DESC", field("doc", path)),
            IndexOrder::Text => format!("(lower({}))", text_field("doc", path)),
        })
        .collect();

    let mut predicates = Vec::new();
    if index.sparse {
        predicates.push(render_filter(
            &Filter::Or(
                index
                    .keys
                    .iter()
                    .map(|(path, _)| Filter::Exists(path.clone(), true))
                    .collect(),
            ),
            "doc",
            &mut Params::inline(),
        ));
    }
    if let Some(partial) = &index.partial {
        predicates.push(render_filter(partial, "doc", &mut Params::inline()));
    }
    let predicate = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {}.{} ({}){predicate}",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index_name(collection, &index.name)),
        quote_ident(schema),
        quote_ident(collection),
        keys.join(", ")
    )
}
