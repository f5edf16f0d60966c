//! Built-in payload converters.
//!
//! `standard` accepts the canonical JSON shape and checks it against a JSON
//! schema before deserializing. `flat` accepts the single-level documents
//! older tenants send, where every unknown key is an extension field.

use std::collections::BTreeMap;

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::strategy::TenantStrategy;
use crate::errors::ConversionError;
use crate::models::arx::{
    ActionDetail, ApprovalIdentifier, ApprovalRequestExpression, Approver, NotificationDetail,
    Operation, TelemetryVector,
};
use crate::models::tenant::TenantInfo;

static STANDARD_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let schema = json!({
        "type": "object",
        "required": ["ApprovalIdentifier"],
        "properties": {
            "Operation": { "type": "string" },
            "Action": { "type": "string" },
            "ApprovalIdentifier": {
                "type": "object",
                "required": ["DocumentNumber"],
                "properties": {
                    "DocumentNumber": { "type": "string" },
                    "DisplayDocumentNumber": { "type": "string" },
                    "FiscalYear": { "type": "string" }
                }
            },
            "Approvers": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["Alias"],
                    "properties": {
                        "Alias": { "type": "string" },
                        "Name": { "type": "string" }
                    }
                }
            },
            "ActionDetail": {
                "type": "object",
                "properties": {
                    "Name": { "type": "string" },
                    "Comment": { "type": "string" },
                    "ActionBy": { "type": "string" },
                    "Date": { "type": "string" },
                    "Attachments": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["Name"],
                            "properties": {
                                "Name": { "type": "string" },
                                "Url": { "type": "string" },
                                "FileSize": { "type": "integer", "minimum": 0 }
                            }
                        }
                    }
                }
            },
            "NotificationDetail": { "type": "object" },
            "AdditionalData": { "type": "object" },
            "Telemetry": {
                "type": "object",
                "properties": {
                    "Xcv": { "type": "string" },
                    "Tcv": { "type": "string" },
                    "BusinessProcessName": { "type": "string" }
                }
            }
        }
    });
    JSONSchema::compile(&schema).expect("standard payload schema must compile")
});

fn parse_object(raw: &[u8]) -> Result<Value, ConversionError> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ConversionError::Empty);
    }
    let value: Value = serde_json::from_slice(raw)?;
    if !value.is_object() {
        return Err(ConversionError::Shape("payload must be a JSON object".into()));
    }
    Ok(value)
}

fn parse_operation(value: Option<&str>) -> Result<Operation, ConversionError> {
    match value {
        None => Ok(Operation::default()),
        Some(op) => Operation::parse(op)
            .ok_or_else(|| ConversionError::Shape(format!("unknown operation '{}'", op))),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StandardPayload {
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    action: Option<String>,
    approval_identifier: ApprovalIdentifier,
    #[serde(default)]
    approvers: Vec<Approver>,
    #[serde(default)]
    action_detail: Option<ActionDetail>,
    #[serde(default)]
    notification_detail: Option<NotificationDetail>,
    #[serde(default)]
    additional_data: BTreeMap<String, Value>,
    #[serde(default)]
    telemetry: Option<TelemetryVector>,
}

pub struct StandardStrategy;

impl TenantStrategy for StandardStrategy {
    fn tag(&self) -> &'static str {
        "standard"
    }

    fn convert(
        &self,
        tenant: &TenantInfo,
        raw: &[u8],
    ) -> Result<ApprovalRequestExpression, ConversionError> {
        let value = parse_object(raw)?;

        if let Err(errors) = STANDARD_SCHEMA.validate(&value) {
            let messages = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{}: {}", path, e)
                    }
                })
                .collect();
            return Err(ConversionError::Schema(messages));
        }

        let payload: StandardPayload = serde_json::from_value(value)?;
        let operation = parse_operation(payload.operation.as_deref())?;

        let action_detail = match (payload.action_detail, payload.action) {
            (Some(mut detail), Some(action)) if detail.name.is_empty() => {
                detail.name = action;
                Some(detail)
            }
            (Some(detail), _) => Some(detail),
            (None, Some(action)) => Some(ActionDetail {
                name: action,
                ..Default::default()
            }),
            (None, None) => None,
        };

        let mut arx =
            ApprovalRequestExpression::new(&tenant.tenant_id, payload.approval_identifier, operation);
        arx.approvers = payload.approvers;
        arx.action_detail = action_detail;
        arx.notification_detail = payload.notification_detail;
        arx.additional_data = payload.additional_data;
        arx.telemetry = payload.telemetry.unwrap_or_default();
        Ok(arx)
    }
}

/// Keys the flat format maps onto canonical fields.
const FLAT_KNOWN_KEYS: &[&str] = &[
    "DocumentNumber",
    "DisplayDocumentNumber",
    "FiscalYear",
    "Operation",
    "Action",
    "Comment",
    "ActionBy",
    "Approver",
    "Approvers",
    "Xcv",
    "Tcv",
    "BusinessProcessName",
];

pub struct FlatStrategy;

impl FlatStrategy {
    fn text(map: &Map<String, Value>, key: &str) -> Result<Option<String>, ConversionError> {
        match map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(ConversionError::Shape(format!(
                "field '{}' must be a string",
                key
            ))),
        }
    }
}

impl TenantStrategy for FlatStrategy {
    fn tag(&self) -> &'static str {
        "flat"
    }

    fn convert(
        &self,
        tenant: &TenantInfo,
        raw: &[u8],
    ) -> Result<ApprovalRequestExpression, ConversionError> {
        let value = parse_object(raw)?;
        let Value::Object(map) = value else {
            return Err(ConversionError::Shape("payload must be a JSON object".into()));
        };

        let document_number = Self::text(&map, "DocumentNumber")?
            .ok_or_else(|| ConversionError::Shape("missing field 'DocumentNumber'".into()))?;
        let identifier = ApprovalIdentifier {
            document_number,
            display_document_number: Self::text(&map, "DisplayDocumentNumber")?.unwrap_or_default(),
            fiscal_year: Self::text(&map, "FiscalYear")?.unwrap_or_default(),
        };
        let operation = parse_operation(Self::text(&map, "Operation")?.as_deref())?;

        let mut arx = ApprovalRequestExpression::new(&tenant.tenant_id, identifier, operation);

        // "Approver" holds one alias, "Approvers" a comma separated list.
        let mut aliases = Vec::new();
        if let Some(single) = Self::text(&map, "Approver")? {
            aliases.push(single);
        }
        if let Some(list) = Self::text(&map, "Approvers")? {
            aliases.extend(list.split(',').map(|a| a.trim().to_string()));
        }
        arx.approvers = aliases
            .into_iter()
            .filter(|a| !a.is_empty())
            .map(|alias| Approver { alias, name: None })
            .collect();

        let action = Self::text(&map, "Action")?;
        let comment = Self::text(&map, "Comment")?;
        let action_by = Self::text(&map, "ActionBy")?;
        if action.is_some() || comment.is_some() || action_by.is_some() {
            arx.action_detail = Some(ActionDetail {
                name: action.unwrap_or_default(),
                comment,
                action_by,
                ..Default::default()
            });
        }

        arx.telemetry = TelemetryVector {
            xcv: Self::text(&map, "Xcv")?.unwrap_or_default(),
            tcv: Self::text(&map, "Tcv")?.unwrap_or_default(),
            business_process_name: Self::text(&map, "BusinessProcessName")?.unwrap_or_default(),
        };

        arx.additional_data = map
            .into_iter()
            .filter(|(k, _)| !FLAT_KNOWN_KEYS.contains(&k.as_str()))
            .collect();

        Ok(arx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(strategy: &str) -> TenantInfo {
        TenantInfo {
            tenant_id: "11111111-1111-1111-1111-111111111111".into(),
            doc_type_id: uuid::Uuid::new_v4(),
            name: String::new(),
            strategy_tag: strategy.into(),
            validation_tag: "default".into(),
            enabled: true,
            routing: Default::default(),
            validation: Default::default(),
            max_attempts: None,
        }
    }

    #[test]
    fn test_standard_minimal_payload() {
        let raw = br#"{
            "tenantId": "11111111-1111-1111-1111-111111111111",
            "Action": "Approve",
            "ApprovalIdentifier": {"DocumentNumber": "PO123", "FiscalYear": "2024"}
        }"#;
        let arx = StandardStrategy.convert(&tenant("standard"), raw).unwrap();
        assert_eq!(arx.tenant_id(), "11111111-1111-1111-1111-111111111111");
        assert_eq!(arx.operation, Operation::Create);
        assert_eq!(arx.approval_identifier.document_number, "PO123");
        assert_eq!(arx.approval_identifier.fiscal_year, "2024");
        assert_eq!(arx.action_name(), Some("Approve"));
    }

    #[test]
    fn test_standard_is_deterministic() {
        let raw = br#"{
            "Operation": "update",
            "ApprovalIdentifier": {"DocumentNumber": "PO9", "FiscalYear": "2023"},
            "Approvers": [{"Alias": "alice"}, {"Alias": "bob", "Name": "Bob"}],
            "ActionDetail": {"Name": "Approve", "Attachments": [{"Name": "a.pdf", "FileSize": 10}]},
            "AdditionalData": {"z": 1, "a": [1, 2], "m": {"k": "v"}}
        }"#;
        let t = tenant("standard");
        let first = StandardStrategy.convert(&t, raw).unwrap();
        for _ in 0..5 {
            assert_eq!(StandardStrategy.convert(&t, raw).unwrap(), first);
        }
        assert_eq!(first.operation, Operation::Update);
        assert_eq!(first.attachments().len(), 1);
    }

    #[test]
    fn test_standard_schema_violations_reported() {
        let raw = br#"{"ApprovalIdentifier": {"FiscalYear": 2024}, "Approvers": "alice"}"#;
        let err = StandardStrategy.convert(&tenant("standard"), raw).unwrap_err();
        match err {
            ConversionError::Schema(messages) => assert!(messages.len() >= 3, "{:?}", messages),
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_standard_rejects_unknown_operation() {
        let raw = br#"{"Operation": "Archive", "ApprovalIdentifier": {"DocumentNumber": "X"}}"#;
        assert!(matches!(
            StandardStrategy.convert(&tenant("standard"), raw),
            Err(ConversionError::Shape(_))
        ));
    }

    #[test]
    fn test_non_json_and_empty_payloads() {
        let t = tenant("standard");
        assert!(matches!(StandardStrategy.convert(&t, b"  "), Err(ConversionError::Empty)));
        assert!(matches!(StandardStrategy.convert(&t, b"<xml/>"), Err(ConversionError::NotJson(_))));
        assert!(matches!(StandardStrategy.convert(&t, b"[1,2]"), Err(ConversionError::Shape(_))));
    }

    #[test]
    fn test_flat_payload_maps_extension_fields() {
        let raw = br#"{
            "DocumentNumber": "TR-77",
            "FiscalYear": 2024,
            "Approver": "carol",
            "Approvers": "dave, erin",
            "Action": "Reject",
            "Comment": "over budget",
            "Tcv": "tcv-flat",
            "Amount": 1250.5,
            "CostCenter": "CC-1"
        }"#;
        let arx = FlatStrategy.convert(&tenant("flat"), raw).unwrap();
        assert_eq!(arx.approval_identifier.fiscal_year, "2024");
        assert_eq!(arx.approver_aliases(), vec!["carol", "dave", "erin"]);
        assert_eq!(arx.action_name(), Some("Reject"));
        assert_eq!(arx.telemetry.tcv, "tcv-flat");
        assert_eq!(arx.additional_data.len(), 2);
        assert_eq!(arx.additional_data["CostCenter"], "CC-1");
    }

    #[test]
    fn test_flat_requires_document_number() {
        let raw = br#"{"FiscalYear": "2024"}"#;
        assert!(matches!(
            FlatStrategy.convert(&tenant("flat"), raw),
            Err(ConversionError::Shape(_))
        ));
    }
}
