//! Persistence key templates.
//!
//! A template is literal text with `{field}` placeholders, e.g. `user.{id}`. Placeholders name
//! top-level fields of the request message; nested paths are not supported. Templates are parsed
//! once and checked against the request type's field list when the endpoint is configured, so a
//! typo never surfaces as a runtime miss.
//!
//! The field list is taken from the request type's serde `Deserialize` impl: a derived struct
//! announces its fields through `deserialize_struct`, which [request_schema] intercepts.

use micro_rpc_core::error::ConfigError;
use regex::Regex;
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde_json::Value;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("placeholder pattern"));

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl KeyTemplate {
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidKeyTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };
        if template.is_empty() {
            return Err(invalid("empty template"));
        }
        let mut segments = Vec::new();
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let (whole, field) = match (caps.get(0), caps.get(1)) {
                (Some(w), Some(f)) => (w, f),
                _ => continue,
            };
            push_literal(&mut segments, &template[last..whole.start()]).map_err(invalid)?;
            segments.push(Segment::Field(field.as_str().to_string()));
            last = whole.end();
        }
        push_literal(&mut segments, &template[last..]).map_err(invalid)?;
        Ok(Self { source: template.to_string(), segments })
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of appearance.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(f) => Some(f.as_str()),
            Segment::Literal(_) => None,
        })
    }

    #[inline]
    pub fn has_placeholders(&self) -> bool {
        self.fields().next().is_some()
    }

    /// Every placeholder must name a field of `schema`.
    pub fn validate(&self, schema: &RequestSchema) -> Result<(), ConfigError> {
        for field in self.fields() {
            if !schema.fields.contains(&field) {
                return Err(ConfigError::UnknownKeyField {
                    template: self.source.clone(),
                    field: field.to_string(),
                    message: schema.message.to_string(),
                    available: schema.fields.join(", "),
                });
            }
        }
        Ok(())
    }

    /// Substitute placeholders with the string form of the request's fields.
    ///
    /// `request` is the request message as a JSON value; a missing field resolves to "".
    pub fn resolve(&self, request: &Value) -> String {
        let mut key = String::with_capacity(self.source.len() + 16);
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => key.push_str(s),
                Segment::Field(f) => {
                    if let Some(v) = request.get(f) {
                        push_field(&mut key, v);
                    }
                }
            }
        }
        key
    }
}

impl std::fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

fn push_literal(segments: &mut Vec<Segment>, lit: &str) -> Result<(), &'static str> {
    if lit.contains('{') || lit.contains('}') {
        return Err("unbalanced brace or placeholder with non-word characters");
    }
    if !lit.is_empty() {
        segments.push(Segment::Literal(lit.to_string()));
    }
    Ok(())
}

/// Strings verbatim, numbers in decimal, booleans as words, null as nothing, anything else as
/// compact JSON.
fn push_field(key: &mut String, v: &Value) {
    match v {
        Value::String(s) => key.push_str(s),
        Value::Number(n) => key.push_str(&n.to_string()),
        Value::Bool(b) => key.push_str(if *b { "true" } else { "false" }),
        Value::Null => {}
        other => key.push_str(&other.to_string()),
    }
}

/// Name and top-level fields of a request message type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestSchema {
    pub message: &'static str,
    pub fields: &'static [&'static str],
}

/// Field list of `T`, None when `T` does not deserialize as a struct with named fields.
pub fn request_schema<T: DeserializeOwned>() -> Option<RequestSchema> {
    let mut probe = SchemaProbe { schema: None };
    let _ = T::deserialize(&mut probe);
    probe.schema
}

/// Check `template` against the request type `T`.
pub fn validate_for<T: DeserializeOwned>(
    template: &KeyTemplate, message: &str,
) -> Result<(), ConfigError> {
    if !template.has_placeholders() {
        return Ok(());
    }
    match request_schema::<T>() {
        Some(schema) => template.validate(&schema),
        None => Err(ConfigError::NoRequestSchema(message.to_string())),
    }
}

struct SchemaProbe {
    schema: Option<RequestSchema>,
}

impl<'de> Deserializer<'de> for &mut SchemaProbe {
    type Error = de::value::Error;

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, Self::Error> {
        Err(de::Error::custom("not a struct"))
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self, name: &'static str, fields: &'static [&'static str], _visitor: V,
    ) -> Result<V::Value, Self::Error> {
        self.schema = Some(RequestSchema { message: name, fields });
        Err(de::Error::custom("schema captured"))
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map enum identifier ignored_any
    }
}
