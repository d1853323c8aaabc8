//! Filters and projects change records into search-document field
//! mutations, consulting the type-mapping registry along the way.
//!
//! Two transformer families (property-graph, RDF), each with a string-only
//! mode, are expressed as one `Transformer` trait with two concrete
//! structs parameterized by a `string_only` flag rather than four separate
//! types — the filter/projection logic is identical across the mode
//! switch except at the handful of points called out below.

pub mod mapping;

use cdx_config::{HandlerAdditionalParams, ReplicationScope};
use cdx_schemas::{document_id, ChangeRecord, DocumentType, GraphElementType, RecordData, SearchDocument, ValueObject, EDGE_ID_PREFIX, VERTEX_ID_PREFIX};
use mapping::{MappingRegistry, SearchFieldType};

pub const RDF_TYPE_PREDICATE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

const RECOGNIZED_DECLARED_TYPES: &[&str] = &[
    "bool",
    "boolean",
    "int",
    "integer",
    "byte",
    "short",
    "long",
    "float",
    "double",
    "decimal",
    "datetime",
    "date",
    "time",
    "string",
    "geo_point",
    "nonnegativeinteger",
    "nonpositiveinteger",
    "negativeinteger",
    "unsignedbyte",
    "unsignedint",
    "unsignedlong",
    "unsignedshort",
];

fn is_recognized_declared_type(declared: &str) -> bool {
    RECOGNIZED_DECLARED_TYPES.contains(&declared)
}

#[derive(Debug, Clone)]
pub enum Projection {
    EntityType(String),
    Predicate { key: String, value: ValueObject },
}

#[derive(Debug, Clone)]
pub struct ProjectedField {
    pub entity_id: String,
    pub document_type: DocumentType,
    pub projection: Projection,
}

/// Common surface for both transformer families: filter a record, project
/// it to a field mutation, and assemble the upsert body for a new document.
///
/// `field_key`/`field_value`/`upsert_body` have default implementations —
/// concrete transformers only need to supply `filter_and_project`.
pub trait Transformer: Send + Sync {
    fn filter_and_project(&self, record: &ChangeRecord, registry: &mut MappingRegistry, params: &HandlerAdditionalParams) -> Option<ProjectedField>;

    fn field_key(&self, field: &ProjectedField) -> String {
        match &field.projection {
            Projection::EntityType(_) => "entity_type".to_string(),
            Projection::Predicate { key, .. } => key.clone(),
        }
    }

    fn field_value(&self, field: &ProjectedField) -> serde_json::Value {
        match &field.projection {
            Projection::EntityType(t) => serde_json::Value::String(t.clone()),
            Projection::Predicate { value, .. } => value.value.clone(),
        }
    }

    fn upsert_body(&self, entity_id: &str, document_type: DocumentType, fields: &[ProjectedField]) -> SearchDocument {
        let mut doc = SearchDocument::new(entity_id, document_type);
        for field in fields {
            match &field.projection {
                Projection::EntityType(t) => doc.entity_type.push(t.clone()),
                Projection::Predicate { key, value } => {
                    doc.predicates.entry(key.clone()).or_default().push(value.clone());
                }
            }
        }
        doc
    }
}

/// Gremlin property-graph transformer. `string_only=true` additionally
/// drops any non-string, non-date literal and omits `datatype` on emitted
/// value objects.
pub struct PropertyGraphTransformer {
    pub string_only: bool,
}

impl PropertyGraphTransformer {
    pub fn new(string_only: bool) -> Self {
        Self { string_only }
    }
}

impl Transformer for PropertyGraphTransformer {
    fn filter_and_project(
        &self,
        record: &ChangeRecord,
        registry: &mut MappingRegistry,
        params: &HandlerAdditionalParams,
    ) -> Option<ProjectedField> {
        let RecordData::PropertyGraph(payload) = &record.data else {
            return None;
        };

        if params.replication_scope == ReplicationScope::NodesOnly && payload.r#type.is_edge() {
            return None;
        }

        let document_type = if payload.r#type.is_edge() { DocumentType::Edge } else { DocumentType::Vertex };

        if payload.key == "label" {
            let label = payload.value.as_ref()?.value.as_str()?.to_string();
            return Some(ProjectedField {
                entity_id: payload.id.clone(),
                document_type,
                projection: Projection::EntityType(label),
            });
        }

        if !payload.r#type.is_property() {
            return None;
        }

        let typed = payload.value.as_ref()?;
        let declared_type = typed.data_type.to_ascii_lowercase();

        if !is_recognized_declared_type(&declared_type) {
            return None;
        }
        if params.properties_to_exclude.iter().any(|p| p == &payload.key) {
            return None;
        }
        if params.datatypes_to_exclude.iter().any(|t| t.eq_ignore_ascii_case(&declared_type)) {
            return None;
        }

        let es_type = match registry.get_or_create(&payload.key, &declared_type) {
            Ok(t) => t,
            Err(conflict) => {
                registry.invalidate(&conflict.field_name);
                return None;
            }
        };

        if !mapping::validate(&typed.value, es_type) {
            return None;
        }

        if self.string_only && !matches!(es_type, SearchFieldType::String | SearchFieldType::Date) {
            return None;
        }

        let coerced = mapping::coerce(&typed.value, es_type);
        let value_object = build_value_object(coerced, es_type, &declared_type, self.string_only, None, None);

        Some(ProjectedField {
            entity_id: payload.id.clone(),
            document_type,
            projection: Projection::Predicate {
                key: payload.key.clone(),
                value: value_object,
            },
        })
    }
}

/// SPARQL/RDF transformer. Mirrors [`PropertyGraphTransformer`]'s
/// `string_only` contract.
pub struct RdfTransformer {
    pub string_only: bool,
}

impl RdfTransformer {
    pub fn new(string_only: bool) -> Self {
        Self { string_only }
    }
}

fn xsd_local_name(iri: &str) -> &str {
    iri.rsplit(['#', '/']).next().unwrap_or(iri)
}

const INFINITE_OR_NAN_TOKENS: &[&str] = &["inf", "+inf", "-inf", "nan"];

impl Transformer for RdfTransformer {
    fn filter_and_project(
        &self,
        record: &ChangeRecord,
        registry: &mut MappingRegistry,
        params: &HandlerAdditionalParams,
    ) -> Option<ProjectedField> {
        let RecordData::Rdf { parsed, .. } = &record.data else {
            return None;
        };

        if parsed.subject_is_blank_node {
            return None;
        }

        let is_rdf_type = parsed.predicate == RDF_TYPE_PREDICATE;
        if !is_rdf_type && !parsed.object.is_literal {
            return None;
        }

        if is_rdf_type {
            return Some(ProjectedField {
                entity_id: parsed.subject.clone(),
                document_type: DocumentType::RdfResource,
                projection: Projection::EntityType(parsed.object.value.clone()),
            });
        }

        if params.properties_to_exclude.iter().any(|p| p == &parsed.predicate) {
            return None;
        }

        let declared_type = parsed
            .object
            .datatype
            .as_deref()
            .map(xsd_local_name)
            .unwrap_or("string")
            .to_ascii_lowercase();

        if params.datatypes_to_exclude.iter().any(|t| t.eq_ignore_ascii_case(&declared_type)) {
            return None;
        }

        if let Some(lang) = &parsed.object.language {
            if !mapping::validate_language_tag(lang) {
                return None;
            }
        }

        if matches!(declared_type.as_str(), "float" | "double" | "decimal")
            && INFINITE_OR_NAN_TOKENS.contains(&parsed.object.value.trim().to_ascii_lowercase().as_str())
        {
            return None;
        }

        let json_value = serde_json::Value::String(parsed.object.value.clone());
        let es_type = match registry.get_or_create(&parsed.predicate, &declared_type) {
            Ok(t) => t,
            Err(conflict) => {
                registry.invalidate(&conflict.field_name);
                return None;
            }
        };

        if !mapping::validate(&json_value, es_type) {
            return None;
        }

        if self.string_only && !matches!(es_type, SearchFieldType::String | SearchFieldType::Date) {
            return None;
        }

        let coerced = mapping::coerce(&json_value, es_type);
        let value_object = build_value_object(
            coerced,
            es_type,
            parsed.object.datatype.as_deref().unwrap_or(""),
            self.string_only,
            parsed.graph.clone(),
            parsed.object.language.clone(),
        );

        Some(ProjectedField {
            entity_id: parsed.subject.clone(),
            document_type: DocumentType::RdfResource,
            projection: Projection::Predicate {
                key: parsed.predicate.clone(),
                value: value_object,
            },
        })
    }
}

fn build_value_object(
    value: serde_json::Value,
    es_type: SearchFieldType,
    declared_type: &str,
    string_only: bool,
    graph: Option<String>,
    language: Option<String>,
) -> ValueObject {
    if string_only {
        return ValueObject {
            value,
            datatype: None,
            graph,
            language,
        };
    }

    let datatype = if matches!(es_type, SearchFieldType::String) || declared_type.is_empty() {
        None
    } else {
        Some(declared_type.to_string())
    };

    ValueObject { value, datatype, graph, language }
}

/// Select the concrete transformer for a query language and indexing mode.
/// `enable_non_string_indexing = false` activates the string-only variant.
pub fn select_transformer(language: cdx_config::QueryLanguage, enable_non_string_indexing: bool) -> Box<dyn Transformer> {
    let string_only = !enable_non_string_indexing;
    match language {
        cdx_config::QueryLanguage::PropertyGraph => Box::new(PropertyGraphTransformer::new(string_only)),
        cdx_config::QueryLanguage::Rdf => Box::new(RdfTransformer::new(string_only)),
    }
}

/// `document_id` prefix for a property-graph element, exposed so the bulk
/// executor can compute the same ES `_id` the aggregator keyed its runs by.
pub fn property_graph_document_id(entity_id: &str, element_type: GraphElementType) -> String {
    let prefix = if element_type.is_edge() { EDGE_ID_PREFIX } else { VERTEX_ID_PREFIX };
    document_id(prefix, entity_id)
}

pub fn rdf_document_id(subject: &str) -> String {
    document_id("", subject)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdx_schemas::{EventId, Op, PropertyGraphPayload, RdfObject, RdfQuad, TypedValue};

    fn default_params() -> HandlerAdditionalParams {
        HandlerAdditionalParams::default()
    }

    fn label_record(id: &str, label: &str) -> ChangeRecord {
        ChangeRecord {
            event_id: EventId { commit_num: 1, op_num: 0 },
            op: Op::Add,
            data: RecordData::PropertyGraph(PropertyGraphPayload {
                id: id.to_string(),
                r#type: GraphElementType::Vl,
                key: "label".to_string(),
                value: Some(TypedValue {
                    value: serde_json::json!(label),
                    data_type: "string".to_string(),
                }),
                from: None,
                to: None,
            }),
            commit_timestamp_millis: 0,
        }
    }

    fn property_record(id: &str, key: &str, value: serde_json::Value, data_type: &str) -> ChangeRecord {
        ChangeRecord {
            event_id: EventId { commit_num: 1, op_num: 0 },
            op: Op::Add,
            data: RecordData::PropertyGraph(PropertyGraphPayload {
                id: id.to_string(),
                r#type: GraphElementType::Vp,
                key: key.to_string(),
                value: Some(TypedValue { value, data_type: data_type.to_string() }),
                from: None,
                to: None,
            }),
            commit_timestamp_millis: 0,
        }
    }

    #[test]
    fn vertex_label_projects_to_entity_type() {
        let transformer = PropertyGraphTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let field = transformer
            .filter_and_project(&label_record("v1", "Person"), &mut registry, &default_params())
            .unwrap();
        assert!(matches!(field.projection, Projection::EntityType(ref t) if t == "Person"));
    }

    #[test]
    fn property_record_gets_coerced_value_object_with_datatype() {
        let transformer = PropertyGraphTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let record = property_record("v1", "age", serde_json::json!("42"), "int");
        let field = transformer.filter_and_project(&record, &mut registry, &default_params()).unwrap();
        match field.projection {
            Projection::Predicate { key, value } => {
                assert_eq!(key, "age");
                assert_eq!(value.value, serde_json::json!(42));
                assert_eq!(value.datatype.as_deref(), Some("int"));
            }
            _ => panic!("expected predicate projection"),
        }
    }

    #[test]
    fn string_typed_value_omits_datatype() {
        let transformer = PropertyGraphTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let record = property_record("v1", "name", serde_json::json!("Ada"), "string");
        let field = transformer.filter_and_project(&record, &mut registry, &default_params()).unwrap();
        match field.projection {
            Projection::Predicate { value, .. } => assert!(value.datatype.is_none()),
            _ => panic!("expected predicate projection"),
        }
    }

    #[test]
    fn invalid_value_for_declared_type_is_dropped() {
        let transformer = PropertyGraphTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let record = property_record("v1", "age", serde_json::json!("not-a-number"), "int");
        assert!(transformer.filter_and_project(&record, &mut registry, &default_params()).is_none());
    }

    #[test]
    fn excluded_property_key_is_dropped() {
        let transformer = PropertyGraphTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let mut params = default_params();
        params.properties_to_exclude = vec!["age".to_string()];
        let record = property_record("v1", "age", serde_json::json!(42), "int");
        assert!(transformer.filter_and_project(&record, &mut registry, &params).is_none());
    }

    #[test]
    fn conflicting_declared_type_drops_record_and_invalidates_mapping() {
        let transformer = PropertyGraphTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let params = default_params();

        let first = property_record("v1", "age", serde_json::json!(42), "int");
        assert!(transformer.filter_and_project(&first, &mut registry, &params).is_some());

        let conflicting = property_record("v2", "age", serde_json::json!("forty-two"), "string");
        assert!(transformer.filter_and_project(&conflicting, &mut registry, &params).is_none());
        assert!(registry.get("age").is_none(), "conflicting mapping must be invalidated");
    }

    #[test]
    fn string_only_mode_drops_non_string_non_date_values() {
        let transformer = PropertyGraphTransformer::new(true);
        let mut registry = MappingRegistry::new();
        let record = property_record("v1", "age", serde_json::json!(42), "int");
        assert!(transformer.filter_and_project(&record, &mut registry, &default_params()).is_none());
    }

    #[test]
    fn edges_are_dropped_when_replication_scope_is_nodes_only() {
        let transformer = PropertyGraphTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let mut params = default_params();
        params.replication_scope = ReplicationScope::NodesOnly;
        let edge_record = ChangeRecord {
            event_id: EventId { commit_num: 1, op_num: 0 },
            op: Op::Add,
            data: RecordData::PropertyGraph(PropertyGraphPayload {
                id: "e1".to_string(),
                r#type: GraphElementType::E,
                key: "label".to_string(),
                value: Some(TypedValue { value: serde_json::json!("knows"), data_type: "string".to_string() }),
                from: Some("v1".to_string()),
                to: Some("v2".to_string()),
            }),
            commit_timestamp_millis: 0,
        };
        assert!(transformer.filter_and_project(&edge_record, &mut registry, &params).is_none());
    }

    fn rdf_type_record(subject: &str, class_iri: &str) -> ChangeRecord {
        ChangeRecord {
            event_id: EventId { commit_num: 1, op_num: 0 },
            op: Op::Add,
            data: RecordData::Rdf {
                stmt: String::new(),
                parsed: RdfQuad {
                    subject: subject.to_string(),
                    subject_is_blank_node: false,
                    predicate: RDF_TYPE_PREDICATE.to_string(),
                    object: RdfObject { value: class_iri.to_string(), is_literal: false, datatype: None, language: None },
                    graph: None,
                },
            },
            commit_timestamp_millis: 0,
        }
    }

    #[test]
    fn rdf_type_triple_projects_to_entity_type() {
        let transformer = RdfTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let field = transformer
            .filter_and_project(&rdf_type_record("http://ex/s1", "http://ex/Person"), &mut registry, &default_params())
            .unwrap();
        assert!(matches!(field.projection, Projection::EntityType(ref t) if t == "http://ex/Person"));
    }

    #[test]
    fn rdf_blank_node_subject_is_dropped() {
        let transformer = RdfTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let mut record = rdf_type_record("b0", "http://ex/Person");
        if let RecordData::Rdf { parsed, .. } = &mut record.data {
            parsed.subject_is_blank_node = true;
        }
        assert!(transformer.filter_and_project(&record, &mut registry, &default_params()).is_none());
    }

    #[test]
    fn rdf_non_literal_non_type_predicate_is_dropped() {
        let transformer = RdfTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let record = ChangeRecord {
            event_id: EventId { commit_num: 1, op_num: 0 },
            op: Op::Add,
            data: RecordData::Rdf {
                stmt: String::new(),
                parsed: RdfQuad {
                    subject: "http://ex/s1".to_string(),
                    subject_is_blank_node: false,
                    predicate: "http://ex/knows".to_string(),
                    object: RdfObject { value: "http://ex/s2".to_string(), is_literal: false, datatype: None, language: None },
                    graph: None,
                },
            },
            commit_timestamp_millis: 0,
        };
        assert!(transformer.filter_and_project(&record, &mut registry, &default_params()).is_none());
    }

    #[test]
    fn rdf_literal_predicate_with_typed_datatype_gets_iri_datatype() {
        let transformer = RdfTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let record = ChangeRecord {
            event_id: EventId { commit_num: 1, op_num: 0 },
            op: Op::Add,
            data: RecordData::Rdf {
                stmt: String::new(),
                parsed: RdfQuad {
                    subject: "http://ex/s1".to_string(),
                    subject_is_blank_node: false,
                    predicate: "http://ex/age".to_string(),
                    object: RdfObject {
                        value: "42".to_string(),
                        is_literal: true,
                        datatype: Some("http://www.w3.org/2001/XMLSchema#integer".to_string()),
                        language: None,
                    },
                    graph: None,
                },
            },
            commit_timestamp_millis: 0,
        };
        let field = transformer.filter_and_project(&record, &mut registry, &default_params()).unwrap();
        match field.projection {
            Projection::Predicate { value, .. } => {
                assert_eq!(value.datatype.as_deref(), Some("http://www.w3.org/2001/XMLSchema#integer"));
            }
            _ => panic!("expected predicate projection"),
        }
    }

    #[test]
    fn rdf_invalid_language_tag_is_dropped() {
        let transformer = RdfTransformer::new(false);
        let mut registry = MappingRegistry::new();
        let record = ChangeRecord {
            event_id: EventId { commit_num: 1, op_num: 0 },
            op: Op::Add,
            data: RecordData::Rdf {
                stmt: String::new(),
                parsed: RdfQuad {
                    subject: "http://ex/s1".to_string(),
                    subject_is_blank_node: false,
                    predicate: "http://ex/label".to_string(),
                    object: RdfObject {
                        value: "bonjour".to_string(),
                        is_literal: true,
                        datatype: None,
                        language: Some("this-tag-is-way-too-long-to-be-valid".to_string()),
                    },
                    graph: None,
                },
            },
            commit_timestamp_millis: 0,
        };
        assert!(transformer.filter_and_project(&record, &mut registry, &default_params()).is_none());
    }
}
