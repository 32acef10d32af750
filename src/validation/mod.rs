//! Schema validation stage.
//!
//! A route may bind a schema to the query, the path params or the body.
//! The stage runs after route middleware and before the
//! handler. For every location that has a schema, the raw value is handed to
//! the configured [`Validator`]; on success the context value is replaced by
//! the validated (possibly coerced) one, on failure the field errors are
//! collected under that location. Locations without a schema pass through
//! untouched. If anything failed the stage returns
//! [`HttpError::Validation`] and the handler never runs.
//!
//! The stage knows nothing about schema libraries. Schemas are opaque
//! [`SchemaRef`]s; only the validator adapter looks inside them. The built-in
//! adapter is [`SchemaValidator`], which understands [`Schema`].

mod schema;

pub use schema::{Schema, SchemaValidator};

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::context::Context;
use crate::error::HttpError;
use crate::middleware::{ChainFn, Next};
use crate::response::Response;

/// A request location a schema can be bound to.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Query,
    Params,
    Body,
}

impl Location {
    pub const ALL: [Location; 3] = [Self::Query, Self::Params, Self::Body];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Query  => "query",
            Self::Params => "params",
            Self::Body   => "body",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field path → messages. `$` addresses the value itself.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Field errors grouped by location. Serializes as
/// `{ "params": { "id": ["must be a valid UUID"] } }`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<Location, FieldErrors>);

impl ValidationErrors {
    pub fn add(&mut self, location: Location, field: impl Into<String>, message: impl Into<String>) {
        self.0
            .entry(location)
            .or_default()
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    /// Merges a whole report for one location.
    pub fn extend(&mut self, location: Location, errors: FieldErrors) {
        let slot = self.0.entry(location).or_default();
        for (field, messages) in errors {
            slot.entry(field).or_default().extend(messages);
        }
    }

    pub fn get(&self, location: Location) -> Option<&FieldErrors> {
        self.0.get(&location)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An opaque schema, interpreted only by the configured [`Validator`].
pub type SchemaRef = Arc<dyn Any + Send + Sync>;

/// Result of validating one location.
#[derive(Debug)]
pub enum Outcome {
    /// Validated data, replacing the raw value in the context.
    Valid(Value),
    Invalid(FieldErrors),
}

/// The pluggable schema capability.
///
/// Implement this to plug in another schema library. `validate` may be
/// synchronous in practice; it is async so adapters can call out to I/O.
/// Returning `Err` means the adapter itself failed (for example it was handed
/// a schema type it does not understand) and surfaces as a 500.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, schema: &SchemaRef, data: Value) -> Result<Outcome, HttpError>;

    /// A JSON-schema-like description of `schema`, for documentation tooling.
    fn describe(&self, schema: &SchemaRef) -> Value;
}

/// Per-route schemas.
///
/// ```rust
/// use tsu_core::{Schema, Schemas};
///
/// let schemas = Schemas::new()
///     .params(Schema::object().field("id", Schema::string().uuid()))
///     .query(Schema::object().optional_field("page", Schema::integer().min(1.0)));
/// ```
#[derive(Clone, Default)]
pub struct Schemas {
    query: Option<SchemaRef>,
    params: Option<SchemaRef>,
    body: Option<SchemaRef>,
}

impl Schemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, schema: impl Any + Send + Sync) -> Self {
        self.query = Some(Arc::new(schema));
        self
    }

    pub fn params(mut self, schema: impl Any + Send + Sync) -> Self {
        self.params = Some(Arc::new(schema));
        self
    }

    pub fn body(mut self, schema: impl Any + Send + Sync) -> Self {
        self.body = Some(Arc::new(schema));
        self
    }

    pub fn get(&self, location: Location) -> Option<&SchemaRef> {
        match location {
            Location::Query  => self.query.as_ref(),
            Location::Params => self.params.as_ref(),
            Location::Body   => self.body.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        Location::ALL.iter().all(|&l| self.get(l).is_none())
    }

    /// Describes every bound schema through `validator`, keyed by location.
    pub fn describe(&self, validator: &dyn Validator) -> BTreeMap<Location, Value> {
        Location::ALL
            .into_iter()
            .filter_map(|l| Some((l, validator.describe(self.get(l)?))))
            .collect()
    }
}

impl fmt::Debug for Schemas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound: Vec<_> = Location::ALL.into_iter().filter(|&l| self.get(l).is_some()).collect();
        f.debug_struct("Schemas").field("bound", &bound).finish()
    }
}

/// Runs every bound schema against `ctx`, replacing validated values.
pub(crate) async fn validate(
    ctx: &mut Context,
    schemas: &Schemas,
    validator: &dyn Validator,
) -> Result<(), HttpError> {
    let mut errors = ValidationErrors::default();

    for location in Location::ALL {
        let Some(schema) = schemas.get(location) else { continue };
        if location == Location::Body {
            ctx.parse_body().await;
        }
        let raw = ctx.input(location).clone();
        match validator.validate(schema, raw).await? {
            Outcome::Valid(value) => ctx.set_input(location, value),
            Outcome::Invalid(report) => errors.extend(location, report),
        }
    }

    if errors.is_empty() { Ok(()) } else { Err(HttpError::Validation(errors)) }
}

/// Wraps [`validate`] as a chain stage.
pub(crate) fn stage(schemas: Schemas, validator: Arc<dyn Validator>) -> ChainFn {
    Arc::new(move |mut ctx: Context, next: Next| -> BoxFuture<'static, Result<Response, HttpError>> {
        let schemas = schemas.clone();
        let validator = Arc::clone(&validator);
        Box::pin(async move {
            validate(&mut ctx, &schemas, validator.as_ref()).await?;
            next.run(ctx).await
        })
    })
}
