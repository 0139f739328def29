//! The `salesforce` handler's job payload shape and CRM response
//! normalisation (spec §4.3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{endpoint, payload, token, type, client_id, idempotency_key, user_id?, api_key_id?}`
/// (spec §4.3 "Handler contract").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesforceJob {
    pub endpoint: String,
    pub payload: Value,
    pub token: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub client_id: String,
    pub idempotency_key: String,
    pub user_id: Option<uuid::Uuid>,
    pub api_key_id: Option<uuid::Uuid>,
}

/// One normalised CRM result item (spec §4.3 step 4).
#[derive(Debug, Clone)]
pub struct CrmResultItem {
    pub success: Option<bool>,
    pub order_id: Option<String>,
    pub id: Option<String>,
    pub message: Option<String>,
}

/// The CRM response body may be a bare array, `{data: [...]}`, or a single
/// object — duck-typed in the original, made explicit here (spec §7 redesign
/// flag "duck-typed response parsing").
fn items_from_response_data(data: &Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items.clone(),
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(items)) => items.clone(),
            Some(single) => vec![single.clone()],
            None => vec![data.clone()],
        },
        other => vec![other.clone()],
    }
}

/// Items that carry a non-null `Success` field (spec §4.3 step 4: "If the
/// response carries a non-null `Success` field").
pub fn normalize_crm_results(data: &Value) -> Vec<CrmResultItem> {
    items_from_response_data(data)
        .into_iter()
        .filter_map(|item| {
            let success = item.get("Success").and_then(Value::as_bool);
            if item.get("Success").map(Value::is_null).unwrap_or(true) {
                return None;
            }
            Some(CrmResultItem {
                success,
                order_id: item.get("OrderId").and_then(Value::as_str).map(str::to_string),
                id: item.get("Id").and_then(Value::as_str).map(str::to_string),
                message: item.get("Message").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect()
}

/// `reference_id` preference order (spec §4.3 step 4): response `OrderId` →
/// payload `SourceExternalId` → payload `PledgeId` → payload
/// `TransactionDetails.SourceExternalId`.
pub fn resolve_reference_id(item: &CrmResultItem, payload: &Value) -> Option<String> {
    item.order_id
        .clone()
        .or_else(|| payload.get("SourceExternalId").and_then(Value::as_str).map(str::to_string))
        .or_else(|| payload.get("PledgeId").and_then(Value::as_str).map(str::to_string))
        .or_else(|| {
            payload
                .get("TransactionDetails")
                .and_then(|td| td.get("SourceExternalId"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_bare_array_response() {
        let data = json!([{"Success": true, "OrderId": "O1", "Id": "I1", "Message": "ok"}]);
        let items = normalize_crm_results(&data);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].order_id.as_deref(), Some("O1"));
    }

    #[test]
    fn normalizes_wrapped_array_response() {
        let data = json!({"data": [{"Success": true, "OrderId": "O1", "Id": "I1", "Message": "ok"}]});
        let items = normalize_crm_results(&data);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn normalizes_single_object_response() {
        let data = json!({"Success": true, "OrderId": "O1", "Id": "I1", "Message": "ok"});
        let items = normalize_crm_results(&data);
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn skips_items_with_null_or_missing_success() {
        let data = json!([{"OrderId": "O1"}, {"Success": null, "OrderId": "O2"}]);
        let items = normalize_crm_results(&data);
        assert!(items.is_empty());
    }

    #[test]
    fn reference_id_prefers_response_order_id() {
        let item = CrmResultItem { success: Some(true), order_id: Some("O1".into()), id: None, message: None };
        let payload = json!({"SourceExternalId": "S1"});
        assert_eq!(resolve_reference_id(&item, &payload), Some("O1".to_string()));
    }

    #[test]
    fn reference_id_falls_back_through_payload_fields() {
        let item = CrmResultItem { success: Some(true), order_id: None, id: None, message: None };

        let payload = json!({"SourceExternalId": "S1"});
        assert_eq!(resolve_reference_id(&item, &payload), Some("S1".to_string()));

        let payload = json!({"PledgeId": "P1"});
        assert_eq!(resolve_reference_id(&item, &payload), Some("P1".to_string()));

        let payload = json!({"TransactionDetails": {"SourceExternalId": "T1"}});
        assert_eq!(resolve_reference_id(&item, &payload), Some("T1".to_string()));

        let payload = json!({});
        assert_eq!(resolve_reference_id(&item, &payload), None);
    }
}
