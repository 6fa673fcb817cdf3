//! Schema and ontology validation, and the gate that applies both to candidates

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use crate::error::ParleyError;
use crate::tools::{ToolRegistry, COMPARE_TARGET, ONTOLOGY_VALIDATE, SCHEMA_VALIDATE};
use crate::types::{
    FieldError, Ontology, ToolId, TranslationInputs, Turn, TurnKind, ValidationResult,
    ValidationTarget,
};

// ============================================================================
// JSON schema (draft-07 subset: type, enum, const, required, properties,
// additionalProperties, items, minimum, maximum)
// ============================================================================

/// Deepest nesting of data the schema walk descends into
pub const MAX_SCHEMA_DEPTH: usize = 64;

/// Validate data against a JSON schema, collecting every violation
pub fn validate_against_schema(data: &Value, schema: &Value) -> ValidationResult {
    let mut errors = Vec::new();
    check_schema(data, schema, "", 0, &mut errors);
    ValidationResult::from_errors(ValidationTarget::Schema, errors)
}

fn field_name(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false)
        }
        _ => true,
    }
}

fn check_schema(
    value: &Value,
    schema: &Value,
    path: &str,
    depth: usize,
    errors: &mut Vec<FieldError>,
) {
    if depth > MAX_SCHEMA_DEPTH {
        errors.push(FieldError::new(
            field_name(path),
            format!("nesting exceeds maximum depth of {MAX_SCHEMA_DEPTH}"),
        ));
        return;
    }

    // `true` and `{}` accept anything
    let Some(schema) = schema.as_object() else {
        if schema == &Value::Bool(false) {
            errors.push(FieldError::new(field_name(path), "no value is allowed here"));
        }
        return;
    };

    if let Some(expected) = schema.get("type") {
        let types: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !types.is_empty() && !types.iter().any(|t| type_matches(value, t)) {
            errors.push(FieldError::new(
                field_name(path),
                format!("{value} is not of type '{}'", types.join("', '")),
            ));
            return;
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            errors.push(FieldError::new(
                field_name(path),
                format!("{value} is not one of {}", Value::Array(options.clone())),
            ));
        }
    }

    if let Some(expected) = schema.get("const") {
        if expected != value {
            errors.push(FieldError::new(
                field_name(path),
                format!("{expected} was expected"),
            ));
        }
    }

    match value {
        Value::Object(map) => check_object(map, schema, path, depth, errors),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    let item_path = format!("{}[{i}]", field_name(path));
                    check_schema(item, item_schema, &item_path, depth + 1, errors);
                }
            }
        }
        Value::Number(n) => {
            let Some(n) = n.as_f64() else { return };
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    errors.push(FieldError::new(
                        field_name(path),
                        format!("{n} is less than the minimum of {min}"),
                    ));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    errors.push(FieldError::new(
                        field_name(path),
                        format!("{n} is greater than the maximum of {max}"),
                    ));
                }
            }
        }
        _ => {}
    }
}

fn check_object(
    map: &Map<String, Value>,
    schema: &Map<String, Value>,
    path: &str,
    depth: usize,
    errors: &mut Vec<FieldError>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !map.contains_key(name) {
                errors.push(FieldError::new(
                    join_path(path, name),
                    format!("'{name}' is a required property"),
                ));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    for (key, child) in map {
        let child_path = join_path(path, key);
        match properties.and_then(|p| p.get(key)) {
            Some(prop_schema) => check_schema(child, prop_schema, &child_path, depth + 1, errors),
            None => match schema.get("additionalProperties") {
                Some(Value::Bool(false)) => errors.push(FieldError::new(
                    child_path,
                    format!("Additional property '{key}' is not allowed"),
                )),
                Some(extra @ Value::Object(_)) => {
                    check_schema(child, extra, &child_path, depth + 1, errors)
                }
                _ => {}
            },
        }
    }
}

// ============================================================================
// Ontology
// ============================================================================

const RDF: [&str; 2] = ["http://www.w3.org/1999/02/22-rdf-syntax-ns#", "rdf:"];
const RDFS: [&str; 2] = ["http://www.w3.org/2000/01/rdf-schema#", "rdfs:"];
const OWL: [&str; 2] = ["http://www.w3.org/2002/07/owl#", "owl:"];
const XSD: [&str; 2] = ["http://www.w3.org/2001/XMLSchema#", "xsd:"];

fn is_term(iri: &str, namespaces: &[&str], local: &str) -> bool {
    namespaces
        .iter()
        .any(|ns| iri.strip_prefix(ns) == Some(local))
}

/// Last segment of an IRI or prefixed name
fn local_name(iri: &str) -> &str {
    iri.rsplit(['#', '/', ':']).next().unwrap_or(iri)
}

/// Properties and classes declared by an ontology, keyed by local name
#[derive(Debug, Default)]
struct OntologyIndex {
    /// property -> declared xsd range, if any
    properties: BTreeMap<String, Option<String>>,
    classes: BTreeSet<String>,
}

impl OntologyIndex {
    fn build(ontology: &Ontology) -> Self {
        let mut index = Self::default();

        for t in &ontology.triples {
            let is_type = t.predicate == "a" || is_term(&t.predicate, &RDF, "type");
            if !is_type {
                continue;
            }
            let declares_property = is_term(&t.object, &RDF, "Property")
                || is_term(&t.object, &OWL, "DatatypeProperty")
                || is_term(&t.object, &OWL, "ObjectProperty");
            let declares_class =
                is_term(&t.object, &OWL, "Class") || is_term(&t.object, &RDFS, "Class");

            if declares_property {
                index
                    .properties
                    .entry(local_name(&t.subject).to_string())
                    .or_insert(None);
            } else if declares_class {
                index.classes.insert(local_name(&t.subject).to_string());
            }
        }

        for t in &ontology.triples {
            if !is_term(&t.predicate, &RDFS, "range") {
                continue;
            }
            if let Some(range) = index.properties.get_mut(local_name(&t.subject)) {
                if XSD.iter().any(|ns| t.object.starts_with(ns)) {
                    *range = Some(local_name(&t.object).to_string());
                }
            }
        }

        index
    }
}

fn datatype_matches(value: &Value, xsd: &str) -> bool {
    match xsd {
        "string" | "anyURI" | "date" | "dateTime" | "time" => value.is_string(),
        "integer" | "int" | "long" | "short" | "nonNegativeInteger" | "positiveInteger" => {
            value.is_i64() || value.is_u64()
        }
        "decimal" | "double" | "float" => value.is_number(),
        "boolean" => value.is_boolean(),
        _ => true,
    }
}

/// Check that every field is a property the ontology declares, with a value of
/// the declared datatype. An empty ontology imposes no constraints.
pub fn validate_against_ontology(data: &Value, ontology: &Ontology) -> ValidationResult {
    if ontology.is_empty() {
        return ValidationResult::from_errors(ValidationTarget::Ontology, Vec::new());
    }

    let Some(map) = data.as_object() else {
        return ValidationResult::from_errors(
            ValidationTarget::Ontology,
            vec![FieldError::new("$", "target data must be an object")],
        );
    };

    let index = OntologyIndex::build(ontology);
    let mut errors = Vec::new();

    for (key, value) in map {
        if key == "@type" {
            let known = value
                .as_str()
                .map(|class| index.classes.contains(local_name(class)))
                .unwrap_or(false);
            if !known {
                errors.push(FieldError::new(
                    key.as_str(),
                    format!("{value} is not a class defined in the ontology"),
                ));
            }
            continue;
        }
        if key.starts_with('@') {
            continue;
        }

        match index.properties.get(key.as_str()) {
            Some(Some(range)) if !datatype_matches(value, range) => {
                errors.push(FieldError::new(
                    key.as_str(),
                    format!("{value} does not match range xsd:{range}"),
                ));
            }
            Some(_) => {}
            None => errors.push(FieldError::new(
                key.as_str(),
                format!("'{key}' is not a property defined in the ontology"),
            )),
        }
    }

    ValidationResult::from_errors(ValidationTarget::Ontology, errors)
}

// ============================================================================
// Reference comparison
// ============================================================================

/// Diff data against the known-good target record for the same source.
///
/// Objects are compared key by key in sorted order, recursing into nested
/// objects; any other pair of values must be equal. Mismatches print the
/// expected value first.
pub fn compare_with_reference(data: &Value, reference: &Value) -> ValidationResult {
    let mut errors = Vec::new();
    diff_values(data, reference, "", &mut errors);
    ValidationResult::from_errors(ValidationTarget::Reference, errors)
}

fn diff_values(data: &Value, reference: &Value, path: &str, errors: &mut Vec<FieldError>) {
    let (Value::Object(actual), Value::Object(expected)) = (data, reference) else {
        if data != reference {
            errors.push(FieldError::new(
                field_name(path),
                format!("Value mismatch at '{}': {reference} != {data}", field_name(path)),
            ));
        }
        return;
    };

    let keys: BTreeSet<&String> = actual.keys().chain(expected.keys()).collect();
    for key in keys {
        let child_path = join_path(path, key);
        match (actual.get(key), expected.get(key)) {
            (Some(a), Some(e)) => diff_values(a, e, &child_path, errors),
            (None, _) => errors.push(FieldError::new(
                child_path.as_str(),
                format!("Key '{child_path}' is missing in target data."),
            )),
            (Some(_), None) => errors.push(FieldError::new(
                child_path.as_str(),
                format!("Key '{child_path}' must not be in target data."),
            )),
        }
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Checks candidate target data against the target schema and ontology
/// through the tool registry, and against a reference record when the inputs
/// carry one. Nothing is cached; every candidate is re-run.
pub struct ValidationGate {
    schema: Value,
    ontology: Ontology,
    reference: Option<Value>,
}

impl ValidationGate {
    pub fn new(schema: Value, ontology: Ontology) -> Self {
        Self {
            schema,
            ontology,
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: Value) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn from_inputs(inputs: &TranslationInputs) -> Self {
        let gate = Self::new(inputs.target_schema.clone(), inputs.target_ontology.clone());
        match &inputs.reference_target {
            Some(reference) => gate.with_reference(reference.clone()),
            None => gate,
        }
    }

    /// Most recent candidate proposed by an agent
    pub fn latest_candidate(transcript: &[Arc<Turn>]) -> Option<&Value> {
        transcript
            .iter()
            .rev()
            .filter(|turn| turn.kind == TurnKind::Agent)
            .find_map(|turn| turn.candidate())
    }

    /// Validate a candidate; schema errors precede ontology errors, which
    /// precede reference differences
    #[instrument(skip_all)]
    pub async fn evaluate(
        &self,
        candidate: &Value,
        registry: &ToolRegistry,
    ) -> Result<ValidationResult, ParleyError> {
        let schema = self
            .run(
                registry,
                SCHEMA_VALIDATE,
                json!({ "data": candidate, "schema": self.schema }),
            )
            .await?;
        let ontology = self
            .run(
                registry,
                ONTOLOGY_VALIDATE,
                json!({ "data": candidate, "ontology": self.ontology }),
            )
            .await?;

        let mut combined = schema.merge(ontology);
        if let Some(reference) = &self.reference {
            let diff = self
                .run(
                    registry,
                    COMPARE_TARGET,
                    json!({ "data": candidate, "reference": reference }),
                )
                .await?;
            combined = combined.merge(diff);
        }
        debug!(passed = combined.passed, errors = combined.errors.len(), "Validated candidate");
        Ok(combined)
    }

    async fn run(
        &self,
        registry: &ToolRegistry,
        tool: &str,
        arguments: Value,
    ) -> Result<ValidationResult, ParleyError> {
        let tool_id = ToolId::from(tool);
        let value = registry.invoke(&tool_id, arguments).await?;
        serde_json::from_value(value).map_err(|e| {
            ParleyError::tool_execution(&tool_id, format!("malformed validation result: {e}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{asset_ontology, asset_schema, candidate_turn};
    use crate::types::{AgentRole, Triple};
    use std::time::Duration;

    #[test]
    fn test_schema_missing_required_field() {
        let data = json!({"Name_notes": "CV-CV-Abutment-G-P"});
        let result = validate_against_schema(&data, &asset_schema());

        assert!(!result.passed);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "Asset_Code");
        assert_eq!(result.errors[0].message, "'Asset_Code' is a required property");
    }

    #[test]
    fn test_schema_additional_and_type_errors() {
        let data = json!({"Name_notes": 7, "Asset_Code": "x", "QTY": 110});
        let result = validate_against_schema(&data, &asset_schema());

        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["Name_notes", "QTY"]);
        assert!(result.errors[1].message.contains("not allowed"));
    }

    #[test]
    fn test_schema_nested_paths() {
        let schema = json!({
            "type": "object",
            "properties": {
                "parts": {"type": "array", "items": {"type": "object", "required": ["id"]}},
                "qty": {"type": "integer", "minimum": 1}
            }
        });
        let data = json!({"parts": [{"id": 1}, {}], "qty": 0});
        let result = validate_against_schema(&data, &schema);

        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["parts[1].id", "qty"]);
    }

    #[test]
    fn test_schema_root_type() {
        let result = validate_against_schema(&json!([1]), &json!({"type": "object"}));
        assert_eq!(result.errors[0].field, "$");
    }

    /// `levels` objects wrapped around a string leaf, with the matching schema
    fn nested(levels: usize) -> (Value, Value) {
        let mut data = json!("leaf");
        let mut schema = json!({"type": "string"});
        for _ in 0..levels {
            data = json!({ "n": data });
            schema = json!({"type": "object", "properties": {"n": schema}});
        }
        (data, schema)
    }

    #[test]
    fn test_schema_depth_is_bounded() {
        let (data, schema) = nested(MAX_SCHEMA_DEPTH);
        assert!(validate_against_schema(&data, &schema).passed);

        let (data, schema) = nested(MAX_SCHEMA_DEPTH + 10);
        let result = validate_against_schema(&data, &schema);
        assert!(!result.passed);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            result.errors[0].message,
            format!("nesting exceeds maximum depth of {MAX_SCHEMA_DEPTH}")
        );
        assert_eq!(result.errors[0].field.matches('.').count(), MAX_SCHEMA_DEPTH);
    }

    #[test]
    fn test_reference_comparison_messages() {
        let reference = json!({"Name_notes": "CV", "Asset_Code": "9cf0", "Dims": {"h": 2, "w": 1}});
        let data = json!({"Name_notes": "CV", "Extra": true, "Dims": {"h": 3, "w": 1}});
        let result = compare_with_reference(&data, &reference);

        assert!(!result.passed);
        assert_eq!(result.validated_against, vec![ValidationTarget::Reference]);
        let messages: Vec<&str> = result.errors.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Key 'Asset_Code' is missing in target data.",
                "Value mismatch at 'Dims.h': 2 != 3",
                "Key 'Extra' must not be in target data.",
            ]
        );

        assert!(compare_with_reference(&reference, &reference).passed);
        let root = compare_with_reference(&json!([1]), &json!([2]));
        assert_eq!(root.errors[0].field, "$");
    }

    #[test]
    fn test_ontology_accepts_declared_properties() {
        let data = json!({"Name_notes": "CV", "Asset_Code": "9cf0", "@type": "ex:Asset"});
        let result = validate_against_ontology(&data, &asset_ontology());
        assert!(result.passed, "{:?}", result.errors);
        assert_eq!(result.validated_against, vec![ValidationTarget::Ontology]);
    }

    #[test]
    fn test_ontology_rejects_unknown_and_mistyped() {
        let mut ontology = asset_ontology();
        ontology.triples.push(Triple::new(
            "http://example.org/asset#Quantity",
            "rdf:type",
            "owl:DatatypeProperty",
        ));
        ontology.triples.push(Triple::new(
            "http://example.org/asset#Quantity",
            "http://www.w3.org/2000/01/rdf-schema#range",
            "http://www.w3.org/2001/XMLSchema#integer",
        ));

        let data = json!({"Asset_Code": "9cf0", "Colour": "red", "Quantity": "ten", "@type": "ex:Bridge"});
        let result = validate_against_ontology(&data, &ontology);

        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["@type", "Colour", "Quantity"]);
    }

    #[test]
    fn test_empty_ontology_passes() {
        let result = validate_against_ontology(&json!({"anything": 1}), &Ontology::default());
        assert!(result.passed);
    }

    #[test]
    fn test_latest_candidate() {
        let transcript = vec![
            Arc::new(candidate_turn(0, json!({"a": 1}))),
            Arc::new(crate::testing::agent_turn(1, "Planner", AgentRole::Planner)),
            Arc::new(candidate_turn(2, json!({"a": 2}))),
        ];
        assert_eq!(
            ValidationGate::latest_candidate(&transcript),
            Some(&json!({"a": 2}))
        );
        assert!(ValidationGate::latest_candidate(&transcript[1..2]).is_none());
    }

    #[tokio::test]
    async fn test_gate_combines_schema_before_ontology() {
        let registry = ToolRegistry::with_validators(Duration::from_secs(1));
        let gate = ValidationGate::new(asset_schema(), asset_ontology());

        let candidate = json!({"Name_notes": "CV", "Colour": "red"});
        let result = gate.evaluate(&candidate, &registry).await.unwrap();

        assert!(!result.passed);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        // schema: missing Asset_Code, extra Colour; ontology: unknown Colour
        assert_eq!(fields, vec!["Asset_Code", "Colour", "Colour"]);
        assert_eq!(
            result.validated_against,
            vec![ValidationTarget::Schema, ValidationTarget::Ontology]
        );
    }

    #[tokio::test]
    async fn test_gate_is_deterministic() {
        let registry = ToolRegistry::with_validators(Duration::from_secs(1));
        let gate = ValidationGate::new(asset_schema(), asset_ontology());

        let candidates = [
            json!({}),
            json!({"Name_notes": "CV"}),
            json!({"Name_notes": 1, "Asset_Code": [], "z": null, "a": true}),
            json!({"Name_notes": "CV", "Asset_Code": "9cf0"}),
            json!("not an object"),
        ];

        for candidate in &candidates {
            let first = gate.evaluate(candidate, &registry).await.unwrap();
            for _ in 0..5 {
                let again = gate.evaluate(candidate, &registry).await.unwrap();
                assert_eq!(
                    serde_json::to_vec(&first).unwrap(),
                    serde_json::to_vec(&again).unwrap()
                );
            }
        }
    }

    #[tokio::test]
    async fn test_gate_checks_reference_last() {
        let registry = ToolRegistry::with_validators(Duration::from_secs(1));
        let inputs = TranslationInputs {
            target_schema: asset_schema(),
            target_ontology: asset_ontology(),
            reference_target: Some(json!({"Name_notes": "CV", "Asset_Code": "9cf0"})),
            ..Default::default()
        };
        let gate = ValidationGate::from_inputs(&inputs);

        // Valid against schema and ontology, but not the expected record
        let result = gate
            .evaluate(&json!({"Name_notes": "CV", "Asset_Code": "0000"}), &registry)
            .await
            .unwrap();
        assert!(!result.passed);
        assert_eq!(
            result.validated_against,
            vec![
                ValidationTarget::Schema,
                ValidationTarget::Ontology,
                ValidationTarget::Reference
            ]
        );
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            result.errors[0].message,
            "Value mismatch at 'Asset_Code': \"9cf0\" != \"0000\""
        );

        let result = gate
            .evaluate(&json!({"Name_notes": "CV", "Asset_Code": "9cf0"}), &registry)
            .await
            .unwrap();
        assert!(result.passed);
    }

    #[tokio::test]
    async fn test_gate_surfaces_missing_tool() {
        let registry = ToolRegistry::new(Duration::from_secs(1));
        let gate = ValidationGate::new(asset_schema(), asset_ontology());
        let err = gate.evaluate(&json!({}), &registry).await.unwrap_err();
        assert!(matches!(err, ParleyError::UnknownTool(_)));
    }
}
