//! Built-in schema adapter.
//!
//! A small declarative schema covering what request validation needs in
//! practice: typed scalars with coercion from strings (path params and query
//! values always arrive as strings), string formats, ranges, arrays and
//! objects with required/optional fields. Objects keep only their declared
//! fields.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Number, Value, json};

use super::{FieldErrors, Outcome, SchemaRef, Validator};
use crate::error::HttpError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Format {
    Email,
    Uuid,
}

#[derive(Clone, Debug)]
enum Kind {
    Any,
    String {
        format: Option<Format>,
        min_length: Option<usize>,
        max_length: Option<usize>,
    },
    Integer { min: Option<f64>, max: Option<f64> },
    Number { min: Option<f64>, max: Option<f64> },
    Boolean,
    Array(Box<Schema>),
    Object(Vec<Field>),
}

#[derive(Clone, Debug)]
struct Field {
    name: String,
    schema: Schema,
    required: bool,
}

/// A declarative schema understood by [`SchemaValidator`].
///
/// Modifiers that do not apply to a schema's type (`.uuid()` on an integer,
/// `.field()` on a string) are ignored.
#[derive(Clone, Debug)]
pub struct Schema {
    kind: Kind,
}

impl Schema {
    pub fn any() -> Self {
        Self { kind: Kind::Any }
    }

    pub fn string() -> Self {
        Self { kind: Kind::String { format: None, min_length: None, max_length: None } }
    }

    /// Accepts integers, whole floats like `3.0` and their string forms,
    /// producing a JSON integer.
    pub fn integer() -> Self {
        Self { kind: Kind::Integer { min: None, max: None } }
    }

    /// Accepts numbers and numeric strings, producing a JSON number.
    pub fn number() -> Self {
        Self { kind: Kind::Number { min: None, max: None } }
    }

    /// Accepts booleans and the strings `"true"` / `"false"`.
    pub fn boolean() -> Self {
        Self { kind: Kind::Boolean }
    }

    pub fn array(items: Schema) -> Self {
        Self { kind: Kind::Array(Box::new(items)) }
    }

    pub fn object() -> Self {
        Self { kind: Kind::Object(Vec::new()) }
    }

    pub fn uuid(self) -> Self {
        self.format(Format::Uuid)
    }

    pub fn email(self) -> Self {
        self.format(Format::Email)
    }

    pub fn min_length(mut self, n: usize) -> Self {
        if let Kind::String { min_length, .. } = &mut self.kind {
            *min_length = Some(n);
        }
        self
    }

    pub fn max_length(mut self, n: usize) -> Self {
        if let Kind::String { max_length, .. } = &mut self.kind {
            *max_length = Some(n);
        }
        self
    }

    pub fn min(mut self, n: f64) -> Self {
        if let Kind::Integer { min, .. } | Kind::Number { min, .. } = &mut self.kind {
            *min = Some(n);
        }
        self
    }

    pub fn max(mut self, n: f64) -> Self {
        if let Kind::Integer { max, .. } | Kind::Number { max, .. } = &mut self.kind {
            *max = Some(n);
        }
        self
    }

    /// Adds a required field to an object schema.
    pub fn field(self, name: impl Into<String>, schema: Schema) -> Self {
        self.push_field(name.into(), schema, true)
    }

    /// Adds a field that may be absent or `null`.
    pub fn optional_field(self, name: impl Into<String>, schema: Schema) -> Self {
        self.push_field(name.into(), schema, false)
    }

    fn format(mut self, f: Format) -> Self {
        if let Kind::String { format, .. } = &mut self.kind {
            *format = Some(f);
        }
        self
    }

    fn push_field(mut self, name: String, schema: Schema, required: bool) -> Self {
        if let Kind::Object(fields) = &mut self.kind {
            fields.retain(|f| f.name != name);
            fields.push(Field { name, schema, required });
        }
        self
    }

    /// Checks `value`, returning the coerced value or `None` after recording
    /// at least one error under `path`.
    fn check(&self, value: &Value, path: &str, errors: &mut FieldErrors) -> Option<Value> {
        let mut fail = |message: String| -> Option<Value> {
            let key = if path.is_empty() { "$".to_owned() } else { path.to_owned() };
            errors.entry(key).or_default().push(message);
            None
        };

        match &self.kind {
            Kind::Any => Some(value.clone()),

            Kind::String { format, min_length, max_length } => {
                let Some(s) = value.as_str() else { return fail("expected a string".into()) };
                let len = s.chars().count();
                if let Some(min) = min_length.filter(|&m| len < m) {
                    return fail(format!("must be at least {min} characters"));
                }
                if let Some(max) = max_length.filter(|&m| len > m) {
                    return fail(format!("must be at most {max} characters"));
                }
                match format {
                    Some(Format::Uuid) if uuid::Uuid::parse_str(s).is_err() => {
                        fail("must be a valid UUID".into())
                    }
                    Some(Format::Email) if !is_email(s) => {
                        fail("must be a valid email address".into())
                    }
                    _ => Some(value.clone()),
                }
            }

            Kind::Integer { min, max } => {
                let n = match value {
                    Value::Number(n) => integral(n),
                    Value::String(s) => s.trim().parse::<Number>().ok().as_ref().and_then(integral),
                    _ => None,
                };
                let Some(n) = n else { return fail("expected an integer".into()) };
                match check_range(n.as_f64().unwrap_or_default(), *min, *max) {
                    Ok(()) => Some(Value::Number(n)),
                    Err(message) => fail(message),
                }
            }

            Kind::Number { min, max } => {
                let n = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                let Some(n) = n.and_then(Number::from_f64) else {
                    return fail("expected a number".into());
                };
                let as_f64 = n.as_f64().unwrap_or_default();
                match check_range(as_f64, *min, *max) {
                    Ok(()) => Some(Value::Number(n)),
                    Err(message) => fail(message),
                }
            }

            Kind::Boolean => match value {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::String(s) if s == "true" => Some(Value::Bool(true)),
                Value::String(s) if s == "false" => Some(Value::Bool(false)),
                _ => fail("expected a boolean".into()),
            },

            Kind::Array(items) => {
                let Some(values) = value.as_array() else { return fail("expected an array".into()) };
                let mut out = Vec::with_capacity(values.len());
                let mut ok = true;
                for (i, item) in values.iter().enumerate() {
                    match items.check(item, &join(path, &i.to_string()), errors) {
                        Some(v) => out.push(v),
                        None => ok = false,
                    }
                }
                ok.then_some(Value::Array(out))
            }

            Kind::Object(fields) => {
                let Some(map) = value.as_object() else { return fail("expected an object".into()) };
                let mut out = Map::new();
                let mut ok = true;
                for field in fields {
                    let field_path = join(path, &field.name);
                    match map.get(&field.name) {
                        None | Some(Value::Null) if field.required => {
                            errors.entry(field_path).or_default().push("is required".to_owned());
                            ok = false;
                        }
                        None | Some(Value::Null) => {}
                        Some(v) => match field.schema.check(v, &field_path, errors) {
                            Some(v) => {
                                out.insert(field.name.clone(), v);
                            }
                            None => ok = false,
                        },
                    }
                }
                ok.then_some(Value::Object(out))
            }
        }
    }

    /// JSON-schema-like description.
    pub fn describe(&self) -> Value {
        match &self.kind {
            Kind::Any => json!({}),
            Kind::String { format, min_length, max_length } => {
                let mut out = json!({ "type": "string" });
                match format {
                    Some(Format::Uuid) => out["format"] = json!("uuid"),
                    Some(Format::Email) => out["format"] = json!("email"),
                    None => {}
                }
                if let Some(n) = min_length {
                    out["minLength"] = json!(n);
                }
                if let Some(n) = max_length {
                    out["maxLength"] = json!(n);
                }
                out
            }
            Kind::Integer { min, max } => with_range(json!({ "type": "integer" }), *min, *max),
            Kind::Number { min, max } => with_range(json!({ "type": "number" }), *min, *max),
            Kind::Boolean => json!({ "type": "boolean" }),
            Kind::Array(items) => json!({ "type": "array", "items": items.describe() }),
            Kind::Object(fields) => {
                let properties: Map<String, Value> =
                    fields.iter().map(|f| (f.name.clone(), f.schema.describe())).collect();
                let required: Vec<&str> =
                    fields.iter().filter(|f| f.required).map(|f| f.name.as_str()).collect();
                json!({ "type": "object", "properties": properties, "required": required })
            }
        }
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() { key.to_owned() } else { format!("{path}.{key}") }
}

/// `n` as a JSON integer, if it has no fractional part.
fn integral(n: &Number) -> Option<Number> {
    if let Some(i) = n.as_i64() {
        return Some(i.into());
    }
    if let Some(u) = n.as_u64() {
        return Some(u.into());
    }
    let f = n.as_f64().filter(|f| f.is_finite() && f.fract() == 0.0)?;
    if f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some((f as i64).into())
    } else {
        None
    }
}

fn check_range(n: f64, min: Option<f64>, max: Option<f64>) -> Result<(), String> {
    if let Some(min) = min.filter(|&m| n < m) {
        return Err(format!("must be greater than or equal to {min}"));
    }
    if let Some(max) = max.filter(|&m| n > m) {
        return Err(format!("must be less than or equal to {max}"));
    }
    Ok(())
}

fn with_range(mut out: Value, min: Option<f64>, max: Option<f64>) -> Value {
    if let Some(min) = min {
        out["minimum"] = json!(min);
    }
    if let Some(max) = max {
        out["maximum"] = json!(max);
    }
    out
}

// ASCII local part and domain, no leading or trailing dots, alphabetic TLD.
static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9._%+-]*[a-zA-Z0-9])?@[a-zA-Z0-9]([a-zA-Z0-9.-]*[a-zA-Z0-9])?\.[a-zA-Z]{2,}$",
    )
    .expect("email pattern compiles")
});

fn is_email(s: &str) -> bool {
    !s.contains("..") && EMAIL.is_match(s)
}

/// The default [`Validator`]: understands [`Schema`] values.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchemaValidator;

impl SchemaValidator {
    fn downcast(schema: &SchemaRef) -> Option<&Schema> {
        schema.as_ref().downcast_ref::<Schema>()
    }
}

#[async_trait]
impl Validator for SchemaValidator {
    async fn validate(&self, schema: &SchemaRef, data: Value) -> Result<Outcome, HttpError> {
        let schema = Self::downcast(schema).ok_or_else(|| {
            HttpError::internal("SchemaValidator was given a schema that is not a tsu_core::Schema")
        })?;

        let mut errors = FieldErrors::new();
        Ok(match schema.check(&data, "", &mut errors) {
            Some(value) if errors.is_empty() => Outcome::Valid(value),
            _ => Outcome::Invalid(errors),
        })
    }

    fn describe(&self, schema: &SchemaRef) -> Value {
        Self::downcast(schema).map(Schema::describe).unwrap_or_else(|| json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn check(schema: &Schema, value: Value) -> Result<Value, FieldErrors> {
        let mut errors = FieldErrors::new();
        match schema.check(&value, "", &mut errors) {
            Some(v) => Ok(v),
            None => Err(errors),
        }
    }

    #[test]
    fn uuid_format() {
        let schema = Schema::object().field("id", Schema::string().uuid());
        let ok = check(&schema, json!({ "id": "11111111-1111-1111-1111-111111111111" })).unwrap();
        assert_eq!(ok["id"], "11111111-1111-1111-1111-111111111111");

        let err = check(&schema, json!({ "id": "not-a-uuid" })).unwrap_err();
        assert_eq!(err["id"], vec!["must be a valid UUID".to_owned()]);
    }

    #[test]
    fn coerces_strings_from_query_and_params() {
        let schema = Schema::object()
            .field("page", Schema::integer().min(1.0))
            .field("ratio", Schema::number())
            .field("draft", Schema::boolean());
        let out = check(&schema, json!({ "page": "3", "ratio": "0.5", "draft": "false" })).unwrap();
        assert_eq!(out, json!({ "page": 3, "ratio": 0.5, "draft": false }));

        let err = check(&schema, json!({ "page": "0", "ratio": "x", "draft": "no" })).unwrap_err();
        assert_eq!(err.len(), 3);
    }

    #[test]
    fn email_format_rejects_whitespace_and_markup() {
        let schema = Schema::string().email();
        for ok in ["alice@example.com", "first.last+tag@mail.example.org"] {
            assert!(check(&schema, json!(ok)).is_ok(), "{ok}");
        }
        for bad in ["not an email@example.com", "<script>@x.y", "a\tb@c.d", "a..b@example.com", "a@b", "@example.com"] {
            let err = check(&schema, json!(bad)).unwrap_err();
            assert_eq!(err["$"], vec!["must be a valid email address".to_owned()], "{bad}");
        }
    }

    #[test]
    fn integers_accept_whole_floats_and_large_unsigned() {
        let schema = Schema::integer();
        assert_eq!(check(&schema, json!(3.0)).unwrap(), json!(3));
        assert_eq!(check(&schema, json!(u64::MAX)).unwrap(), json!(u64::MAX));
        assert_eq!(check(&schema, json!("18446744073709551615")).unwrap(), json!(u64::MAX));
        assert_eq!(check(&schema, json!("-7")).unwrap(), json!(-7));
        assert!(check(&schema, json!(3.5)).is_err());
        assert!(check(&schema, json!("3.5")).is_err());
    }

    #[test]
    fn reports_every_failing_field() {
        let schema = Schema::object()
            .field("email", Schema::string().email())
            .field("name", Schema::string().min_length(2))
            .optional_field("tags", Schema::array(Schema::string()));
        let err = check(&schema, json!({ "email": "nope", "name": "a", "tags": ["ok", 3] })).unwrap_err();
        assert!(err.contains_key("email"));
        assert!(err.contains_key("name"));
        assert!(err.contains_key("tags.1"));
    }

    #[test]
    fn required_optional_and_unknown_fields() {
        let schema = Schema::object()
            .field("name", Schema::string())
            .optional_field("nick", Schema::string());

        let err = check(&schema, json!({})).unwrap_err();
        assert_eq!(err["name"], vec!["is required".to_owned()]);

        let out = check(&schema, json!({ "name": "alice", "admin": true })).unwrap();
        assert_eq!(out, json!({ "name": "alice" }));
    }

    #[test]
    fn non_object_root_is_reported_at_dollar() {
        let err = check(&Schema::object(), Value::Null).unwrap_err();
        assert!(err.contains_key("$"));
    }

    #[test]
    fn describes_as_json_schema() {
        let schema = Schema::object()
            .field("id", Schema::string().uuid())
            .optional_field("limit", Schema::integer().min(1.0).max(100.0));
        assert_eq!(
            schema.describe(),
            json!({
                "type": "object",
                "properties": {
                    "id": { "type": "string", "format": "uuid" },
                    "limit": { "type": "integer", "minimum": 1.0, "maximum": 100.0 }
                },
                "required": ["id"]
            })
        );
    }

    #[tokio::test]
    async fn foreign_schema_types_are_an_adapter_failure() {
        let foreign: SchemaRef = Arc::new("not a schema");
        let err = SchemaValidator.validate(&foreign, json!({})).await.unwrap_err();
        assert_eq!(err.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(SchemaValidator.describe(&foreign), json!({}));
    }
}
