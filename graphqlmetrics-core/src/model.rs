// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Usage reports as submitted by routers.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// Kind of GraphQL operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationType {
    /// Name stored in the columnar store.
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperationType::Query => "query",
            OperationType::Mutation => "mutation",
            OperationType::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usage of a single field, possibly resolved by several subgraphs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldUsage {
    pub path: Vec<String>,
    /// Enclosing type names. A set: order carries no meaning.
    pub type_names: Vec<String>,
    /// A set: order carries no meaning.
    pub subgraph_ids: Vec<String>,
    pub count: u64,
    pub named_type: String,
}

/// Usage of a field argument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArgumentUsage {
    pub path: Vec<String>,
    pub type_name: String,
    pub subgraph_ids: Vec<String>,
    pub count: u64,
    pub named_type: String,
}

/// Usage of an input object field or input value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputUsage {
    pub path: Vec<String>,
    pub type_name: String,
    pub subgraph_ids: Vec<String>,
    pub count: u64,
    pub named_type: String,
}

/// Everything a router reports about one executed operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaUsageRecord {
    /// Content hash of `request_document`. The same hash always denotes the same document.
    pub operation_hash: String,
    pub operation_name: String,
    pub operation_type: OperationType,
    pub request_document: String,
    pub schema_version: String,
    pub client_name: String,
    pub client_version: String,
    pub http_status_code: i32,
    pub has_error: bool,
    pub field_usages: Vec<FieldUsage>,
    pub argument_usages: Vec<ArgumentUsage>,
    pub input_usages: Vec<InputUsage>,
    pub attributes: BTreeMap<String, String>,
}

impl SchemaUsageRecord {
    /// Number of usage-metric rows this record expands to.
    pub fn usage_count(&self) -> usize {
        self.field_usages.len() + self.argument_usages.len() + self.input_usages.len()
    }
}

/// A flat list of usage records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageReport {
    pub schema_usage: Vec<SchemaUsageRecord>,
}

/// `request_count` identical executions of `schema_usage`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregatedUsageRecord {
    pub schema_usage: SchemaUsageRecord,
    pub request_count: u64,
}

/// A list of aggregated usage records.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregatedUsageReport {
    pub aggregation: Vec<AggregatedUsageRecord>,
}

/// Identity of the caller, established by the authentication layer in front of the service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub organization_id: String,
    pub federated_graph_id: String,
}

impl Claims {
    pub fn new(organization_id: impl Into<String>, federated_graph_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            federated_graph_id: federated_graph_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_router_json() {
        let report: UsageReport = serde_json::from_str(
            r#"{
                "schemaUsage": [{
                    "operationHash": "123",
                    "operationName": "Employees",
                    "operationType": "mutation",
                    "requestDocument": "mutation Employees { a }",
                    "httpStatusCode": 200,
                    "fieldUsages": [{"path": ["a"], "typeNames": ["Mutation"], "count": 2}],
                    "attributes": {"region": "eu"}
                }]
            }"#,
        )
        .unwrap();

        let record = &report.schema_usage[0];
        assert_eq!(record.operation_type, OperationType::Mutation);
        assert_eq!(record.http_status_code, 200);
        assert_eq!(record.field_usages[0].count, 2);
        assert!(record.field_usages[0].subgraph_ids.is_empty());
        assert_eq!(record.client_name, "");
        assert_eq!(record.attributes["region"], "eu");
        assert_eq!(record.usage_count(), 1);
    }

    #[test]
    fn operation_type_names() {
        assert_eq!(OperationType::Subscription.to_string(), "subscription");
        assert_eq!(
            serde_json::to_string(&OperationType::Query).unwrap(),
            r#""query""#
        );
    }
}
