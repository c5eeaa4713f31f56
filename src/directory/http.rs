//! Microsoft Graph / Azure Resource Manager implementation of `DirectoryClient`.
//!
//! Directory roles go through Microsoft Graph v1.0; resource roles go through
//! the ARM `Microsoft.Authorization` provider.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc, Weekday};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::models::{
    AccessReviewCycle, AccessReviewSummary, ApprovalSetting, EligibilityGrant,
    EligibilityRequest, Escalation, GrantExpiration, GrantState, IdempotencyKey, Namespace,
    PolicyId, PolicyRule, Recurrence, ReviewDecision, RoleDefinition, RuleKind, Scope, ScopeKind,
};
use super::DirectoryClient;
use crate::auth::{Audience, TokenManager};
use crate::config::Config;
use crate::error::DirectoryError;
use crate::iso8601;

/// API version for PIM operations.
const API_VERSION_PIM: &str = "2020-10-01";

/// API version for role definitions.
const API_VERSION_ROLES: &str = "2022-04-01";

/// HTTP request timeout.
const HTTP_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Header carrying the deterministic key of a creation request.
const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Header correlating a request with server-side logs.
const CLIENT_REQUEST_ID_HEADER: &str = "client-request-id";

/// Error codes the directory uses for "this assignment already exists".
const EXISTS_ERROR_CODES: &[&str] = &["RoleAssignmentExists", "RoleEligibilityScheduleExists"];

/// Directory client backed by Graph and ARM REST calls.
pub struct GraphDirectoryClient {
    http_client: Client,
    tokens: Arc<TokenManager>,
    graph_base_url: String,
    management_base_url: String,
}

impl GraphDirectoryClient {
    /// Create a new directory client.
    pub fn new(config: &Config, tokens: Arc<TokenManager>) -> Result<Self, DirectoryError> {
        let http_client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| DirectoryError::Unknown(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            tokens,
            graph_base_url: config.api.graph_base_url.trim_end_matches('/').to_string(),
            management_base_url: config
                .api
                .management_base_url
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn graph_url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, DirectoryError> {
        build_url(&format!("{}{}", self.graph_base_url, path), query)
    }

    fn arm_url(
        &self,
        path: &str,
        api_version: &str,
        query: &[(&str, &str)],
    ) -> Result<Url, DirectoryError> {
        let mut pairs = vec![("api-version", api_version)];
        pairs.extend_from_slice(query);
        build_url(&format!("{}{}", self.management_base_url, path), &pairs)
    }

    /// Send a request with a bearer token and map non-success statuses.
    async fn execute(
        &self,
        audience: Audience,
        request: RequestBuilder,
    ) -> Result<Response, DirectoryError> {
        let token = self.tokens.access_token(audience).await?;
        let request_id = Uuid::new_v4();
        let response = request
            .bearer_auth(token.as_str())
            .header(CLIENT_REQUEST_ID_HEADER, request_id.to_string())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let body = response.text().await.unwrap_or_default();
        debug!(
            "Directory call failed (request {}): HTTP {} - {}",
            request_id, status, body
        );

        Err(classify_status(status.as_u16(), retry_after, &body))
    }

    /// GET a JSON document; a 404 yields `None`.
    async fn get_json<T: DeserializeOwned>(
        &self,
        audience: Audience,
        url: Url,
    ) -> Result<Option<T>, DirectoryError> {
        debug!("GET {}", url);
        match self.execute(audience, self.http_client.get(url)).await {
            Ok(response) => response.json::<T>().await.map(Some).map_err(|e| {
                DirectoryError::Unknown(format!("invalid response: {}", e))
            }),
            Err(DirectoryError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Send a JSON body, discarding the response body.
    async fn send_json<B: Serialize + ?Sized>(
        &self,
        audience: Audience,
        method: Method,
        url: Url,
        body: &B,
        key: Option<IdempotencyKey>,
    ) -> Result<(), DirectoryError> {
        debug!("{} {}", method, url);
        let mut request = self.http_client.request(method, url).json(body);
        if let Some(key) = key {
            request = request.header(IDEMPOTENCY_KEY_HEADER, key.to_string());
        }
        self.execute(audience, request).await.map(|_| ())
    }
}

#[async_trait]
impl DirectoryClient for GraphDirectoryClient {
    async fn resolve_principal(&self, identifier: &str) -> Result<Option<String>, DirectoryError> {
        let identifier = identifier.trim();
        let path = if Uuid::parse_str(identifier).is_ok() {
            format!("/directoryObjects/{}", identifier)
        } else {
            format!("/users/{}", urlencoding::encode(identifier))
        };
        let url = self.graph_url(&path, &[("$select", "id")])?;

        let object: Option<DirectoryObject> = self.get_json(Audience::Graph, url).await?;
        Ok(object.map(|o| o.id))
    }

    async fn find_role_definition(
        &self,
        name: &str,
        namespace: Namespace,
        scope: &Scope,
    ) -> Result<Option<RoleDefinition>, DirectoryError> {
        match namespace {
            Namespace::Directory => {
                let filter = format!("displayName eq '{}'", odata_literal(name));
                let url = self.graph_url(
                    "/roleManagement/directory/roleDefinitions",
                    &[("$filter", &filter)],
                )?;
                let body: Option<ListResponse<GraphRoleDefinition>> =
                    self.get_json(Audience::Graph, url).await?;

                Ok(body
                    .and_then(|b| b.value.into_iter().find(|r| r.display_name == name))
                    .map(|r| RoleDefinition {
                        id: r.id,
                        display_name: r.display_name,
                        namespace,
                    }))
            }
            Namespace::ResourceScoped => {
                let filter = format!("roleName eq '{}'", odata_literal(name));
                let url = self.arm_url(
                    &format!("{}/providers/Microsoft.Authorization/roleDefinitions", scope.id),
                    API_VERSION_ROLES,
                    &[("$filter", &filter)],
                )?;
                let body: Option<ListResponse<ArmRoleDefinition>> =
                    self.get_json(Audience::Management, url).await?;

                Ok(body
                    .and_then(|b| {
                        b.value
                            .into_iter()
                            .find(|r| r.properties.role_name == name)
                    })
                    .map(|r| RoleDefinition {
                        id: r.id,
                        display_name: r.properties.role_name,
                        namespace,
                    }))
            }
        }
    }

    async fn get_policy_id(
        &self,
        role: &RoleDefinition,
        scope: &Scope,
    ) -> Result<Option<PolicyId>, DirectoryError> {
        match role.namespace {
            Namespace::Directory => {
                let filter = format!(
                    "scopeId eq '{}' and scopeType eq 'DirectoryRole' and roleDefinitionId eq '{}'",
                    odata_literal(&scope.id),
                    odata_literal(&role.id)
                );
                let url = self.graph_url(
                    "/policies/roleManagementPolicyAssignments",
                    &[("$filter", &filter)],
                )?;
                let body: Option<ListResponse<GraphPolicyAssignment>> =
                    self.get_json(Audience::Graph, url).await?;

                Ok(body
                    .and_then(|b| b.value.into_iter().next())
                    .map(|a| PolicyId {
                        id: a.policy_id,
                        namespace: Namespace::Directory,
                    }))
            }
            Namespace::ResourceScoped => {
                let filter = format!("roleDefinitionId eq '{}'", odata_literal(&role.id));
                let url = self.arm_url(
                    &format!(
                        "{}/providers/Microsoft.Authorization/roleManagementPolicyAssignments",
                        scope.id
                    ),
                    API_VERSION_PIM,
                    &[("$filter", &filter)],
                )?;
                let body: Option<ListResponse<ArmPolicyAssignment>> =
                    self.get_json(Audience::Management, url).await?;

                Ok(body
                    .and_then(|b| b.value.into_iter().next())
                    .map(|a| PolicyId {
                        id: a.properties.policy_id,
                        namespace: Namespace::ResourceScoped,
                    }))
            }
        }
    }

    async fn get_policy_rules(&self, policy: &PolicyId) -> Result<Vec<PolicyRule>, DirectoryError> {
        let raw_rules = match policy.namespace {
            Namespace::Directory => {
                let url = self.graph_url(
                    &format!("/policies/roleManagementPolicies/{}/rules", policy.id),
                    &[],
                )?;
                let body: Option<ListResponse<Value>> = self.get_json(Audience::Graph, url).await?;
                body.map(|b| b.value)
            }
            Namespace::ResourceScoped => {
                let url = self.arm_url(&policy.id, API_VERSION_PIM, &[])?;
                let body: Option<ArmPolicy> = self.get_json(Audience::Management, url).await?;
                body.map(|b| b.properties.rules)
            }
        }
        .ok_or_else(|| DirectoryError::NotFound(format!("policy {}", policy.id)))?;

        Ok(raw_rules.iter().filter_map(parse_rule).collect())
    }

    async fn update_policy_rule(
        &self,
        policy: &PolicyId,
        rule: &PolicyRule,
    ) -> Result<(), DirectoryError> {
        let body = rule_body(rule, policy.namespace);
        match policy.namespace {
            Namespace::Directory => {
                let url = self.graph_url(
                    &format!(
                        "/policies/roleManagementPolicies/{}/rules/{}",
                        policy.id,
                        rule.kind().rule_id()
                    ),
                    &[],
                )?;
                self.send_json(Audience::Graph, Method::PATCH, url, &body, None)
                    .await
            }
            Namespace::ResourceScoped => {
                let url = self.arm_url(&policy.id, API_VERSION_PIM, &[])?;
                let wrapped = json!({ "properties": { "rules": [body] } });
                self.send_json(Audience::Management, Method::PATCH, url, &wrapped, None)
                    .await
            }
        }
    }

    async fn list_eligibility(
        &self,
        principal_id: &str,
        role: &RoleDefinition,
        scope: &Scope,
    ) -> Result<Option<EligibilityGrant>, DirectoryError> {
        match scope.kind {
            ScopeKind::Directory => {
                let filter = format!(
                    "principalId eq '{}' and roleDefinitionId eq '{}' and directoryScopeId eq '{}'",
                    odata_literal(principal_id),
                    odata_literal(&role.id),
                    odata_literal(&scope.id)
                );
                let url = self.graph_url(
                    "/roleManagement/directory/roleEligibilitySchedules",
                    &[("$filter", &filter)],
                )?;
                let body: Option<ListResponse<GraphEligibilitySchedule>> =
                    self.get_json(Audience::Graph, url).await?;

                Ok(body
                    .and_then(|b| b.value.into_iter().next())
                    .map(GraphEligibilitySchedule::into_grant))
            }
            ScopeKind::Resource => {
                let filter = format!(
                    "principalId eq '{}' and roleDefinitionId eq '{}'",
                    odata_literal(principal_id),
                    odata_literal(&role.id)
                );
                let url = self.arm_url(
                    &format!(
                        "{}/providers/Microsoft.Authorization/roleEligibilitySchedules",
                        scope.id
                    ),
                    API_VERSION_PIM,
                    &[("$filter", &filter)],
                )?;
                let body: Option<ListResponse<ArmEligibilitySchedule>> =
                    self.get_json(Audience::Management, url).await?;

                // Listing at a scope also returns inherited schedules from parent scopes.
                Ok(body
                    .and_then(|b| {
                        b.value
                            .into_iter()
                            .find(|s| s.properties.scope.eq_ignore_ascii_case(&scope.id))
                    })
                    .map(ArmEligibilitySchedule::into_grant))
            }
        }
    }

    async fn create_eligibility(
        &self,
        request: &EligibilityRequest,
        key: IdempotencyKey,
    ) -> Result<(), DirectoryError> {
        let schedule_info = ScheduleInfo::for_request(request, request.scope.kind);

        info!(
            "Creating eligibility for principal {} on role {} at {}",
            request.principal_id, request.role_id, request.scope
        );

        match request.scope.kind {
            ScopeKind::Directory => {
                let body = GraphEligibilityRequestBody {
                    action: "adminAssign",
                    justification: &request.justification,
                    role_definition_id: &request.role_id,
                    directory_scope_id: &request.scope.id,
                    principal_id: &request.principal_id,
                    schedule_info,
                };
                let url =
                    self.graph_url("/roleManagement/directory/roleEligibilityScheduleRequests", &[])?;
                self.send_json(Audience::Graph, Method::POST, url, &body, Some(key))
                    .await
            }
            ScopeKind::Resource => {
                // ARM creates are PUTs on a caller-chosen name, which makes the
                // idempotency key the resource name itself.
                let body = ArmEligibilityRequestBody {
                    properties: ArmEligibilityProperties {
                        principal_id: &request.principal_id,
                        role_definition_id: &request.role_id,
                        request_type: "AdminAssign",
                        justification: &request.justification,
                        schedule_info,
                    },
                };
                let url = self.arm_url(
                    &format!(
                        "{}/providers/Microsoft.Authorization/roleEligibilityScheduleRequests/{}",
                        request.scope.id, key
                    ),
                    API_VERSION_PIM,
                    &[],
                )?;
                self.send_json(Audience::Management, Method::PUT, url, &body, None)
                    .await
            }
        }
    }

    async fn list_access_review(
        &self,
        name: &str,
    ) -> Result<Option<AccessReviewSummary>, DirectoryError> {
        let filter = format!("displayName eq '{}'", odata_literal(name));
        let url = self.graph_url(
            "/identityGovernance/accessReviews/definitions",
            &[("$filter", &filter)],
        )?;
        let body: Option<ListResponse<AccessReviewItem>> =
            self.get_json(Audience::Graph, url).await?;

        Ok(body
            .and_then(|b| b.value.into_iter().find(|r| r.display_name == name))
            .map(|r| AccessReviewSummary {
                id: r.id,
                name: r.display_name,
                status: r.status,
            }))
    }

    async fn create_access_review(
        &self,
        cycle: &AccessReviewCycle,
        key: IdempotencyKey,
    ) -> Result<(), DirectoryError> {
        let body = AccessReviewDefinitionBody::from_cycle(cycle);
        let url = self.graph_url("/identityGovernance/accessReviews/definitions", &[])?;

        info!("Creating access review '{}' ({})", cycle.name, cycle.recurrence);
        self.send_json(Audience::Graph, Method::POST, url, &body, Some(key))
            .await
    }
}

/// Join a base URL and properly encoded query parameters.
fn build_url(base: &str, query: &[(&str, &str)]) -> Result<Url, DirectoryError> {
    let mut url = Url::parse(base)
        .map_err(|e| DirectoryError::Validation(format!("invalid URL '{}': {}", base, e)))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
}

/// Escape a value for use inside an OData string literal.
fn odata_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Parse a `Retry-After` header: delta seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<StdDuration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(StdDuration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(StdDuration::ZERO))
}

/// Map a non-success HTTP status and its body to the error taxonomy.
pub fn classify_status(
    status: u16,
    retry_after: Option<StdDuration>,
    body: &str,
) -> DirectoryError {
    let (code, message) = error_details(body);
    let reason = match (&code, &message) {
        (Some(code), Some(message)) => format!("HTTP {} {}: {}", status, code, message),
        (Some(code), None) => format!("HTTP {} {}", status, code),
        (None, Some(message)) => format!("HTTP {}: {}", status, message),
        (None, None) => format!("HTTP {}", status),
    };
    let exists = code
        .as_deref()
        .map(|c| EXISTS_ERROR_CODES.contains(&c))
        .unwrap_or(false);

    match status {
        400 | 409 | 422 if exists => DirectoryError::Conflict(reason),
        400 | 422 => DirectoryError::Validation(reason),
        401 | 403 => DirectoryError::Unauthorized(reason),
        404 => DirectoryError::NotFound(reason),
        409 => DirectoryError::Conflict(reason),
        429 => DirectoryError::Throttled { retry_after },
        408 | 500 | 502 | 503 | 504 => DirectoryError::Transient(reason),
        _ => DirectoryError::Unknown(reason),
    }
}

/// Extract `error.code` and `error.message` from a Graph or ARM error body.
fn error_details(body: &str) -> (Option<String>, Option<String>) {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return (None, None);
    };
    let error = &value["error"];
    (
        error["code"].as_str().map(str::to_string),
        error["message"].as_str().map(str::to_string),
    )
}

// --- Policy rule mapping ---

fn rule_type_name(kind: RuleKind) -> &'static str {
    match kind {
        RuleKind::Expiration => "RoleManagementPolicyExpirationRule",
        RuleKind::Enablement => "RoleManagementPolicyEnablementRule",
        RuleKind::Approval => "RoleManagementPolicyApprovalRule",
        RuleKind::Notification => "RoleManagementPolicyNotificationRule",
    }
}

fn graph_rule_type(kind: RuleKind) -> String {
    format!("#microsoft.graph.unified{}", rule_type_name(kind))
}

fn approver_json(id: &str, namespace: Namespace) -> Value {
    match namespace {
        Namespace::Directory => json!({
            "@odata.type": "#microsoft.graph.singleUser",
            "userId": id,
        }),
        Namespace::ResourceScoped => json!({
            "id": id,
            "userType": "User",
            "isBackup": false,
        }),
    }
}

/// Build the wire representation of a rule for `namespace`.
pub fn rule_body(rule: &PolicyRule, namespace: Namespace) -> Value {
    let mut body = match rule {
        PolicyRule::Expiration { max_duration } => json!({
            "isExpirationRequired": true,
            "maximumDuration": iso8601::format_duration(*max_duration),
        }),
        PolicyRule::Enablement {
            mfa,
            justification,
            ticketing,
        } => {
            let mut enabled = Vec::new();
            if *mfa {
                enabled.push("MultiFactorAuthentication");
            }
            if *justification {
                enabled.push("Justification");
            }
            if *ticketing {
                enabled.push("Ticketing");
            }
            json!({ "enabledRules": enabled })
        }
        PolicyRule::Approval(setting) => {
            let approvers: Vec<Value> = setting
                .approver_ids
                .iter()
                .map(|id| approver_json(id, namespace))
                .collect();
            let (escalation_enabled, escalation_minutes, escalation_approvers) =
                match &setting.escalation {
                    Some(e) => (
                        true,
                        e.after_minutes,
                        e.approver_ids
                            .iter()
                            .map(|id| approver_json(id, namespace))
                            .collect::<Vec<_>>(),
                    ),
                    None => (false, 0, Vec::new()),
                };
            json!({
                "setting": {
                    "isApprovalRequired": setting.required,
                    "isApprovalRequiredForExtension": false,
                    "isRequestorJustificationRequired": true,
                    "approvalMode": "SingleStage",
                    "approvalStages": [{
                        "approvalStageTimeOutInDays": setting.stage_timeout_days,
                        "isApproverJustificationRequired": setting.approver_justification_required,
                        "escalationTimeInMinutes": escalation_minutes,
                        "isEscalationEnabled": escalation_enabled,
                        "primaryApprovers": approvers,
                        "escalationApprovers": escalation_approvers,
                    }],
                }
            })
        }
        PolicyRule::Notification { enabled } => json!({
            "notificationType": "Email",
            "recipientType": "Admin",
            "notificationLevel": if *enabled { "All" } else { "Critical" },
            "isDefaultRecipientsEnabled": enabled,
            "notificationRecipients": [],
        }),
    };

    let kind = rule.kind();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("id".into(), json!(kind.rule_id()));
        obj.insert(
            "target".into(),
            json!({
                "caller": "EndUser",
                "operations": ["All"],
                "level": "Assignment",
                "inheritableSettings": [],
                "enforcedSettings": [],
            }),
        );
        match namespace {
            Namespace::Directory => {
                obj.insert("@odata.type".into(), json!(graph_rule_type(kind)));
            }
            Namespace::ResourceScoped => {
                obj.insert("ruleType".into(), json!(rule_type_name(kind)));
            }
        }
    }
    body
}

fn approver_ids(list: Option<&Value>) -> BTreeSet<String> {
    list.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|a| a.get("userId").or_else(|| a.get("id")))
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// A numeric setting, `default` when absent. `None` when it does not fit a `u32`.
fn u32_setting(value: &Value, default: u32) -> Option<u32> {
    if value.is_null() {
        return Some(default);
    }
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

/// Parse a Graph or ARM rule. Rules of unmanaged kinds yield `None`.
///
/// A rule carrying values this model cannot hold also yields `None`, so the
/// reconciler treats it as differing and rewrites it.
pub fn parse_rule(value: &Value) -> Option<PolicyRule> {
    let kind = RuleKind::from_rule_id(value.get("id")?.as_str()?)?;
    match kind {
        RuleKind::Expiration => {
            let raw = value.get("maximumDuration")?.as_str()?;
            Some(PolicyRule::Expiration {
                max_duration: iso8601::parse_duration(raw).ok()?,
            })
        }
        RuleKind::Enablement => {
            let enabled: Vec<&str> = value
                .get("enabledRules")
                .and_then(Value::as_array)
                .map(|rules| rules.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            Some(PolicyRule::Enablement {
                mfa: enabled.contains(&"MultiFactorAuthentication"),
                justification: enabled.contains(&"Justification"),
                ticketing: enabled.contains(&"Ticketing"),
            })
        }
        RuleKind::Approval => {
            let setting = value.get("setting")?;
            let required = setting.get("isApprovalRequired")?.as_bool()?;
            let stage = setting
                .get("approvalStages")
                .and_then(Value::as_array)
                .and_then(|stages| stages.first());

            let (approvers, timeout, justification, escalation) = match stage {
                Some(stage) => {
                    let escalation = if stage["isEscalationEnabled"].as_bool().unwrap_or(false) {
                        Some(Escalation {
                            after_minutes: u32_setting(&stage["escalationTimeInMinutes"], 0)?,
                            approver_ids: approver_ids(stage.get("escalationApprovers")),
                        })
                    } else {
                        None
                    };
                    (
                        approver_ids(stage.get("primaryApprovers")),
                        u32_setting(&stage["approvalStageTimeOutInDays"], 1)?,
                        stage["isApproverJustificationRequired"]
                            .as_bool()
                            .unwrap_or(false),
                        escalation,
                    )
                }
                None => (BTreeSet::new(), 1, false, None),
            };

            Some(PolicyRule::Approval(ApprovalSetting::from_remote(
                required,
                approvers,
                timeout,
                justification,
                escalation,
            )))
        }
        RuleKind::Notification => Some(PolicyRule::Notification {
            enabled: value
                .get("isDefaultRecipientsEnabled")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }),
    }
}

// --- API Response Types ---

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct DirectoryObject {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRoleDefinition {
    id: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct ArmRoleDefinition {
    id: String,
    properties: ArmRoleDefinitionProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmRoleDefinitionProperties {
    role_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphPolicyAssignment {
    policy_id: String,
}

#[derive(Debug, Deserialize)]
struct ArmPolicyAssignment {
    properties: ArmPolicyAssignmentProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmPolicyAssignmentProperties {
    policy_id: String,
}

#[derive(Debug, Deserialize)]
struct ArmPolicy {
    properties: ArmPolicyProperties,
}

#[derive(Debug, Deserialize)]
struct ArmPolicyProperties {
    #[serde(default)]
    rules: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEligibilitySchedule {
    id: String,
    principal_id: String,
    role_definition_id: String,
    directory_scope_id: String,
    schedule_info: Option<GraphScheduleInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphScheduleInfo {
    start_date_time: Option<DateTime<Utc>>,
    expiration: Option<GraphExpiration>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphExpiration {
    #[serde(rename = "type")]
    expiration_type: Option<String>,
    end_date_time: Option<DateTime<Utc>>,
    duration: Option<String>,
}

impl GraphEligibilitySchedule {
    fn into_grant(self) -> EligibilityGrant {
        let start_time = self
            .schedule_info
            .as_ref()
            .and_then(|s| s.start_date_time)
            .unwrap_or_else(Utc::now);
        let expiration = self
            .schedule_info
            .and_then(|s| s.expiration)
            .map(|e| match (e.expiration_type.as_deref(), e.end_date_time, e.duration) {
                (_, Some(end), _) => GrantExpiration::AtDateTime(end),
                (Some("afterDuration"), None, Some(d)) => iso8601::parse_duration(&d)
                    .map(GrantExpiration::AfterDuration)
                    .unwrap_or(GrantExpiration::Never),
                _ => GrantExpiration::Never,
            })
            .unwrap_or(GrantExpiration::Never);

        EligibilityGrant {
            id: Some(self.id),
            principal_id: self.principal_id,
            role_id: self.role_definition_id,
            scope: Scope {
                kind: ScopeKind::Directory,
                id: self.directory_scope_id,
            },
            start_time,
            expiration,
            state: GrantState::Eligible,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ArmEligibilitySchedule {
    id: String,
    properties: ArmEligibilityScheduleProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArmEligibilityScheduleProperties {
    principal_id: String,
    role_definition_id: String,
    scope: String,
    start_date_time: Option<DateTime<Utc>>,
    end_date_time: Option<DateTime<Utc>>,
}

impl ArmEligibilitySchedule {
    fn into_grant(self) -> EligibilityGrant {
        let p = self.properties;
        EligibilityGrant {
            id: Some(self.id),
            principal_id: p.principal_id,
            role_id: p.role_definition_id,
            scope: Scope {
                kind: ScopeKind::Resource,
                id: p.scope,
            },
            start_time: p.start_date_time.unwrap_or_else(Utc::now),
            expiration: p
                .end_date_time
                .map(GrantExpiration::AtDateTime)
                .unwrap_or(GrantExpiration::Never),
            state: GrantState::Eligible,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessReviewItem {
    id: String,
    display_name: String,
    status: Option<String>,
}

// --- Request Body Types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphEligibilityRequestBody<'a> {
    action: &'static str,
    justification: &'a str,
    role_definition_id: &'a str,
    directory_scope_id: &'a str,
    principal_id: &'a str,
    schedule_info: ScheduleInfo,
}

#[derive(Debug, Serialize)]
struct ArmEligibilityRequestBody<'a> {
    properties: ArmEligibilityProperties<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArmEligibilityProperties<'a> {
    principal_id: &'a str,
    role_definition_id: &'a str,
    request_type: &'static str,
    justification: &'a str,
    schedule_info: ScheduleInfo,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleInfo {
    start_date_time: String,
    expiration: Expiration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Expiration {
    #[serde(rename = "type")]
    expiration_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_date_time: Option<String>,
}

impl ScheduleInfo {
    /// Graph spells expiration types in camelCase, ARM in PascalCase.
    fn for_request(request: &EligibilityRequest, kind: ScopeKind) -> Self {
        let graph = kind == ScopeKind::Directory;
        let expiration = match request.expiration {
            GrantExpiration::AfterDuration(d) => Expiration {
                expiration_type: if graph { "afterDuration" } else { "AfterDuration" },
                duration: Some(iso8601::format_duration(d)),
                end_date_time: None,
            },
            GrantExpiration::AtDateTime(at) => Expiration {
                expiration_type: if graph { "afterDateTime" } else { "AfterDateTime" },
                duration: None,
                end_date_time: Some(at.to_rfc3339()),
            },
            GrantExpiration::Never => Expiration {
                expiration_type: if graph { "noExpiration" } else { "NoExpiration" },
                duration: None,
                end_date_time: None,
            },
        };
        Self {
            start_date_time: request.start_time.to_rfc3339(),
            expiration,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessReviewDefinitionBody<'a> {
    display_name: &'a str,
    description_for_admins: &'a str,
    description_for_reviewers: &'a str,
    scope: QueryScope<'a>,
    reviewers: Vec<ReviewerScope>,
    fallback_reviewers: Vec<ReviewerScope>,
    settings: ReviewSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryScope<'a> {
    #[serde(rename = "@odata.type")]
    odata_type: &'static str,
    query: &'a str,
    query_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewerScope {
    query: String,
    query_type: &'static str,
}

impl ReviewerScope {
    fn user(id: &str) -> Self {
        Self {
            query: format!("/users/{}", id),
            query_type: "MicrosoftGraph",
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewSettings {
    mail_notifications_enabled: bool,
    reminder_notifications_enabled: bool,
    justification_required_on_approval: bool,
    default_decision_enabled: bool,
    default_decision: &'static str,
    instance_duration_in_days: u32,
    auto_apply_decisions_enabled: bool,
    recommendations_enabled: bool,
    recurrence: RecurrenceBody,
}

#[derive(Debug, Serialize)]
struct RecurrenceBody {
    pattern: PatternBody,
    range: RangeBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PatternBody {
    #[serde(rename = "type")]
    pattern_type: &'static str,
    interval: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    day_of_month: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    days_of_week: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RangeBody {
    #[serde(rename = "type")]
    range_type: &'static str,
    start_date: String,
}

fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

impl<'a> AccessReviewDefinitionBody<'a> {
    fn from_cycle(cycle: &'a AccessReviewCycle) -> Self {
        let pattern = match &cycle.recurrence {
            Recurrence::Weekly { interval } => PatternBody {
                pattern_type: "weekly",
                interval: *interval,
                day_of_month: None,
                days_of_week: vec![day_name(cycle.start_date.weekday()).to_string()],
            },
            Recurrence::Monthly {
                interval,
                day_of_month,
            } => PatternBody {
                pattern_type: "absoluteMonthly",
                interval: *interval,
                day_of_month: Some(*day_of_month),
                days_of_week: Vec::new(),
            },
        };

        Self {
            display_name: &cycle.name,
            description_for_admins: &cycle.description,
            description_for_reviewers: &cycle.description,
            scope: QueryScope {
                odata_type: "#microsoft.graph.accessReviewQueryScope",
                query: &cycle.scope.query,
                query_type: "MicrosoftGraph",
            },
            reviewers: cycle.reviewer_ids.iter().map(|id| ReviewerScope::user(id)).collect(),
            fallback_reviewers: cycle
                .fallback_reviewer_ids
                .iter()
                .map(|id| ReviewerScope::user(id))
                .collect(),
            settings: ReviewSettings {
                mail_notifications_enabled: true,
                reminder_notifications_enabled: true,
                justification_required_on_approval: true,
                default_decision_enabled: true,
                default_decision: match cycle.default_decision {
                    ReviewDecision::Allow => "Approve",
                    ReviewDecision::Deny => "Deny",
                },
                instance_duration_in_days: cycle.instance_duration_days,
                auto_apply_decisions_enabled: cycle.auto_apply_decisions,
                recommendations_enabled: true,
                recurrence: RecurrenceBody {
                    pattern,
                    range: RangeBody {
                        range_type: "noEnd",
                        start_date: cycle.start_date.format("%Y-%m-%d").to_string(),
                    },
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::models::ReviewScope;
    use chrono::{Duration, NaiveDate, TimeZone};

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(401, None, ""),
            DirectoryError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(403, None, ""),
            DirectoryError::Unauthorized(_)
        ));
        assert!(matches!(
            classify_status(404, None, ""),
            DirectoryError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(409, None, ""),
            DirectoryError::Conflict(_)
        ));
        assert!(matches!(
            classify_status(503, None, ""),
            DirectoryError::Transient(_)
        ));
        assert!(matches!(
            classify_status(418, None, ""),
            DirectoryError::Unknown(_)
        ));
        assert_eq!(
            classify_status(429, Some(StdDuration::from_secs(3)), ""),
            DirectoryError::Throttled {
                retry_after: Some(StdDuration::from_secs(3))
            }
        );
    }

    #[test]
    fn test_existing_assignment_is_conflict() {
        let body = r#"{"error":{"code":"RoleAssignmentExists","message":"The Role assignment already exists."}}"#;
        match classify_status(400, None, body) {
            DirectoryError::Conflict(reason) => {
                assert!(reason.contains("RoleAssignmentExists"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let body = r#"{"error":{"code":"InvalidPolicyRule","message":"bad duration"}}"#;
        match classify_status(400, None, body) {
            DirectoryError::Validation(reason) => {
                assert_eq!(reason, "HTTP 400 InvalidPolicyRule: bad duration");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_retry_after() {
        let now = Utc.with_ymd_and_hms(2026, 10, 17, 12, 0, 0).unwrap();
        assert_eq!(
            parse_retry_after("30", now),
            Some(StdDuration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Sat, 17 Oct 2026 12:00:10 GMT", now),
            Some(StdDuration::from_secs(10))
        );
        assert_eq!(
            parse_retry_after("Sat, 17 Oct 2026 11:00:00 GMT", now),
            Some(StdDuration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn test_odata_literal_escapes_quotes() {
        assert_eq!(odata_literal("O'Brien"), "O''Brien");
    }

    #[test]
    fn test_build_url_encodes_filter() {
        let url = build_url(
            "https://graph.microsoft.com/v1.0/roleManagement/directory/roleDefinitions",
            &[("$filter", "displayName eq 'Global Administrator'")],
        )
        .unwrap();
        let query = url.query().unwrap();
        assert!(!query.contains(' '));
        assert!(!query.contains('\''));
        let pairs: Vec<_> = url.query_pairs().collect();
        assert_eq!(pairs[0].1, "displayName eq 'Global Administrator'");
    }

    #[test]
    fn test_graph_rule_type_names() {
        assert_eq!(
            graph_rule_type(RuleKind::Expiration),
            "#microsoft.graph.unifiedRoleManagementPolicyExpirationRule"
        );
        assert_eq!(
            graph_rule_type(RuleKind::Notification),
            "#microsoft.graph.unifiedRoleManagementPolicyNotificationRule"
        );
    }

    #[test]
    fn test_parse_graph_rules() {
        let rules = json!([
            {
                "@odata.type": "#microsoft.graph.unifiedRoleManagementPolicyExpirationRule",
                "id": "Expiration_EndUser_Assignment",
                "isExpirationRequired": true,
                "maximumDuration": "PT8H"
            },
            {
                "@odata.type": "#microsoft.graph.unifiedRoleManagementPolicyEnablementRule",
                "id": "Enablement_EndUser_Assignment",
                "enabledRules": ["Justification", "MultiFactorAuthentication"]
            },
            {
                "@odata.type": "#microsoft.graph.unifiedRoleManagementPolicyApprovalRule",
                "id": "Approval_EndUser_Assignment",
                "setting": {
                    "isApprovalRequired": true,
                    "approvalStages": [{
                        "approvalStageTimeOutInDays": 1,
                        "isApproverJustificationRequired": true,
                        "escalationTimeInMinutes": 0,
                        "isEscalationEnabled": false,
                        "primaryApprovers": [
                            {"@odata.type": "#microsoft.graph.singleUser", "userId": "approver-1"}
                        ],
                        "escalationApprovers": []
                    }]
                }
            },
            {
                "@odata.type": "#microsoft.graph.unifiedRoleManagementPolicyExpirationRule",
                "id": "Expiration_Admin_Eligibility",
                "maximumDuration": "P365D"
            }
        ]);

        let parsed: Vec<_> = rules.as_array().unwrap().iter().filter_map(parse_rule).collect();
        assert_eq!(parsed.len(), 3, "unmanaged rules are skipped");
        assert_eq!(
            parsed[0],
            PolicyRule::Expiration {
                max_duration: Duration::hours(8)
            }
        );
        assert_eq!(
            parsed[1],
            PolicyRule::Enablement {
                mfa: true,
                justification: true,
                ticketing: false
            }
        );
        assert_eq!(
            parsed[2],
            PolicyRule::Approval(ApprovalSetting::single_stage(
                ["approver-1".to_string()].into_iter().collect(),
                None
            ))
        );
    }

    #[test]
    fn test_out_of_range_approval_values_read_as_differing() {
        let rule = |timeout: Value, escalation: Value| {
            json!({
                "id": "Approval_EndUser_Assignment",
                "setting": {
                    "isApprovalRequired": true,
                    "approvalStages": [{
                        "approvalStageTimeOutInDays": timeout,
                        "isApproverJustificationRequired": true,
                        "escalationTimeInMinutes": escalation,
                        "isEscalationEnabled": true,
                        "primaryApprovers": [{"userId": "approver-1"}],
                        "escalationApprovers": [{"userId": "approver-2"}]
                    }]
                }
            })
        };

        assert!(parse_rule(&rule(json!(1), json!(30))).is_some());
        // 2^32 + 1 would truncate to 1 day.
        assert_eq!(parse_rule(&rule(json!(4_294_967_297u64), json!(30))), None);
        assert_eq!(parse_rule(&rule(json!(1), json!(4_294_967_296u64))), None);
        assert_eq!(parse_rule(&rule(json!(1), json!(-5))), None);
    }

    #[test]
    fn test_rule_bodies_read_back_identically() {
        let escalation = Escalation {
            after_minutes: 60,
            approver_ids: ["backup-approver".to_string()].into_iter().collect(),
        };
        let rules = [
            PolicyRule::Expiration {
                max_duration: Duration::minutes(90),
            },
            PolicyRule::Enablement {
                mfa: true,
                justification: false,
                ticketing: true,
            },
            PolicyRule::Approval(ApprovalSetting::single_stage(
                ["a".to_string(), "b".to_string()].into_iter().collect(),
                Some(escalation),
            )),
            PolicyRule::Notification { enabled: false },
        ];

        for namespace in [Namespace::Directory, Namespace::ResourceScoped] {
            for rule in &rules {
                let body = rule_body(rule, namespace);
                assert_eq!(parse_rule(&body).as_ref(), Some(rule), "{:?}", namespace);
            }
        }
    }

    #[test]
    fn test_arm_rule_body_shape() {
        let rule = PolicyRule::Approval(ApprovalSetting::single_stage(
            ["approver-1".to_string()].into_iter().collect(),
            None,
        ));
        let body = rule_body(&rule, Namespace::ResourceScoped);
        assert_eq!(body["ruleType"], "RoleManagementPolicyApprovalRule");
        assert!(body.get("@odata.type").is_none());

        let stage = &body["setting"]["approvalStages"][0];
        assert_eq!(stage["approvalStageTimeOutInDays"], 1);
        assert_eq!(stage["isEscalationEnabled"], false);
        assert_eq!(stage["escalationTimeInMinutes"], 0);
        assert_eq!(stage["primaryApprovers"][0]["id"], "approver-1");
        assert_eq!(stage["primaryApprovers"][0]["userType"], "User");
    }

    #[test]
    fn test_graph_schedule_into_grant() {
        let json = r#"{
            "id": "sched-1",
            "principalId": "user-1",
            "roleDefinitionId": "role-1",
            "directoryScopeId": "/",
            "status": "Provisioned",
            "scheduleInfo": {
                "startDateTime": "2026-10-01T00:00:00Z",
                "expiration": {"type": "afterDateTime", "endDateTime": "2026-12-30T00:00:00Z", "duration": null}
            }
        }"#;
        let schedule: GraphEligibilitySchedule = serde_json::from_str(json).unwrap();
        let grant = schedule.into_grant();

        assert_eq!(grant.id.as_deref(), Some("sched-1"));
        assert_eq!(grant.scope, Scope::tenant());
        assert_eq!(
            grant.expiration,
            GrantExpiration::AtDateTime(Utc.with_ymd_and_hms(2026, 12, 30, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_eligibility_request_bodies() {
        let now = Utc.with_ymd_and_hms(2026, 10, 17, 9, 0, 0).unwrap();
        let request = EligibilityRequest::starting_at(
            "user-1",
            "role-1",
            Scope::tenant(),
            GrantExpiration::AfterDuration(Duration::days(90)),
            now,
            "managed by pimgov",
        )
        .unwrap();

        let body = GraphEligibilityRequestBody {
            action: "adminAssign",
            justification: &request.justification,
            role_definition_id: &request.role_id,
            directory_scope_id: &request.scope.id,
            principal_id: &request.principal_id,
            schedule_info: ScheduleInfo::for_request(&request, ScopeKind::Directory),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["directoryScopeId"], "/");
        assert_eq!(value["scheduleInfo"]["expiration"]["type"], "afterDuration");
        assert_eq!(value["scheduleInfo"]["expiration"]["duration"], "P90D");
        assert!(value["scheduleInfo"]["expiration"].get("endDateTime").is_none());

        let arm = serde_json::to_value(ScheduleInfo::for_request(&request, ScopeKind::Resource))
            .unwrap();
        assert_eq!(arm["expiration"]["type"], "AfterDuration");
    }

    #[test]
    fn test_access_review_body_is_fail_closed() {
        let cycle = AccessReviewCycle {
            name: "Monthly-Admin-Review".into(),
            description: "Privileged role review".into(),
            scope: ReviewScope::role_eligibility("role-1"),
            reviewer_ids: vec!["reviewer-1".into()],
            fallback_reviewer_ids: vec!["fallback-1".into()],
            recurrence: Recurrence::Monthly {
                interval: 1,
                day_of_month: 1,
            },
            instance_duration_days: 14,
            start_date: NaiveDate::from_ymd_opt(2026, 10, 17).unwrap(),
            auto_apply_decisions: true,
            default_decision: ReviewDecision::Deny,
        };
        let value = serde_json::to_value(AccessReviewDefinitionBody::from_cycle(&cycle)).unwrap();

        assert_eq!(value["displayName"], "Monthly-Admin-Review");
        assert_eq!(value["settings"]["defaultDecision"], "Deny");
        assert_eq!(value["settings"]["autoApplyDecisionsEnabled"], true);
        assert_eq!(value["settings"]["defaultDecisionEnabled"], true);
        assert_eq!(value["settings"]["instanceDurationInDays"], 14);
        assert_eq!(
            value["settings"]["recurrence"]["pattern"]["type"],
            "absoluteMonthly"
        );
        assert_eq!(value["settings"]["recurrence"]["pattern"]["dayOfMonth"], 1);
        assert_eq!(
            value["settings"]["recurrence"]["range"]["startDate"],
            "2026-10-17"
        );
        assert_eq!(value["reviewers"][0]["query"], "/users/reviewer-1");
        assert_eq!(value["fallbackReviewers"][0]["query"], "/users/fallback-1");
        assert_eq!(
            value["scope"]["@odata.type"],
            "#microsoft.graph.accessReviewQueryScope"
        );

        let mut weekly = cycle.clone();
        weekly.recurrence = Recurrence::Weekly { interval: 1 };
        weekly.instance_duration_days = 5;
        let value = serde_json::to_value(AccessReviewDefinitionBody::from_cycle(&weekly)).unwrap();
        let pattern = &value["settings"]["recurrence"]["pattern"];
        assert_eq!(pattern["type"], "weekly");
        assert_eq!(pattern["daysOfWeek"][0], "saturday");
        assert!(pattern.get("dayOfMonth").is_none());
    }
}
