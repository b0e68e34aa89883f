//! RPC method dispatch onto CheckinControl

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use habitd_core::types::{CreateResponseInput, ResponseFilter, UserUpdate};
use habitd_core::CheckinControl;

use crate::protocol::{Request, RequestId, Response, RpcError, JSONRPC_VERSION};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseIdParams {
    response_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReminderIdParams {
    reminder_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpcomingParams {
    user_id: String,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateParams {
    user_id: String,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuickLogParams {
    user_id: String,
    text: String,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserIdParams {
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserUpdateParams {
    user_id: String,
    #[serde(flatten)]
    update: UserUpdate,
}

fn parse_params<T: for<'de> Deserialize<'de>>(params: Option<Value>) -> Result<T, RpcError> {
    let value = params.unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| RpcError::InvalidParams(e.to_string()))
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::Internal(e.to_string()))
}

/// JSON-RPC service over the core operations
pub struct ApiService {
    control: Arc<CheckinControl>,
}

impl ApiService {
    pub fn new(control: Arc<CheckinControl>) -> Self {
        Self { control }
    }

    /// Parse and handle one line-delimited request
    pub async fn handle_line(&self, line: &str) -> Response {
        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => return Response::error(RequestId::Null, RpcError::ParseError(e.to_string())),
        };
        self.handle(request).await
    }

    pub async fn handle(&self, request: Request) -> Response {
        if request.jsonrpc != JSONRPC_VERSION {
            return Response::error(
                request.id,
                RpcError::InvalidRequest(format!("unsupported version: {}", request.jsonrpc)),
            );
        }
        debug!(method = %request.method, "RPC request");
        let id = request.id.clone();
        match self.dispatch(&request.method, request.params).await {
            Ok(result) => Response::success(id, result),
            Err(error) => Response::error(id, error),
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "responses.create" => {
                let input: CreateResponseInput = parse_params(params)?;
                let response = self
                    .control
                    .create_response(input)
                    .await
                    .map_err(|e| RpcError::App(e.to_string()))?;
                to_value(response)
            }
            "responses.list" => {
                let filter: ResponseFilter = parse_params(params)?;
                let responses =
                    self.control.list_responses(&filter).map_err(|e| RpcError::App(e.to_string()))?;
                to_value(responses)
            }
            "responses.delete" => {
                let p: ResponseIdParams = parse_params(params)?;
                let deleted = self
                    .control
                    .delete_response(&p.response_id)
                    .map_err(|e| RpcError::App(e.to_string()))?;
                Ok(json!({ "success": deleted }))
            }
            "llm.process_response" => {
                let p: ResponseIdParams = parse_params(params)?;
                let success = self
                    .control
                    .process_response(&p.response_id)
                    .await
                    .map_err(|e| RpcError::App(e.to_string()))?;
                Ok(json!({ "success": success }))
            }
            "llm.reprocess_response" => {
                let p: ResponseIdParams = parse_params(params)?;
                let success = self
                    .control
                    .reprocess_response(&p.response_id)
                    .await
                    .map_err(|e| RpcError::App(e.to_string()))?;
                Ok(json!({ "success": success }))
            }
            "reminders.upcoming" => {
                let p: UpcomingParams = parse_params(params)?;
                let reminders = self
                    .control
                    .upcoming_reminders(&p.user_id, p.limit.unwrap_or(10))
                    .map_err(|e| RpcError::App(e.to_string()))?;
                to_value(reminders)
            }
            "reminders.get" => {
                let p: ReminderIdParams = parse_params(params)?;
                let reminder = self
                    .control
                    .get_reminder(&p.reminder_id)
                    .map_err(|e| RpcError::App(e.to_string()))?
                    .ok_or_else(|| RpcError::App(format!("Reminder not found: {}", p.reminder_id)))?;
                let responses = self
                    .control
                    .reminder_responses(&p.reminder_id)
                    .map_err(|e| RpcError::App(e.to_string()))?;
                Ok(json!({ "reminder": to_value(reminder)?, "responses": to_value(responses)? }))
            }
            "reminders.acknowledge" => {
                let p: ReminderIdParams = parse_params(params)?;
                let success = self
                    .control
                    .acknowledge_reminder(&p.reminder_id)
                    .map_err(|e| RpcError::App(e.to_string()))?;
                Ok(json!({ "success": success }))
            }
            "reminders.generate" => {
                let p: GenerateParams = parse_params(params)?;
                let created = self
                    .control
                    .generate_reminders(&p.user_id, p.force)
                    .map_err(|e| RpcError::App(e.to_string()))?;
                Ok(json!({ "created": created }))
            }
            "quicklog.create" => {
                let p: QuickLogParams = parse_params(params)?;
                let result = self
                    .control
                    .quick_log(&p.user_id, &p.text, p.timestamp)
                    .await
                    .map_err(|e| RpcError::App(e.to_string()))?;
                to_value(result)
            }
            "users.list" => {
                let users = self.control.list_users().map_err(|e| RpcError::App(e.to_string()))?;
                to_value(users)
            }
            "users.get" => {
                let p: UserIdParams = parse_params(params)?;
                let user = self
                    .control
                    .get_user(&p.user_id)
                    .map_err(|e| RpcError::App(e.to_string()))?
                    .ok_or_else(|| RpcError::App(format!("User not found: {}", p.user_id)))?;
                to_value(user)
            }
            "users.update" => {
                let p: UserUpdateParams = parse_params(params)?;
                let user = self
                    .control
                    .update_user(&p.user_id, &p.update)
                    .map_err(|e| RpcError::App(e.to_string()))?;
                to_value(user)
            }
            "health.check" => {
                let (available, model) = self.control.llm_health().await;
                Ok(json!({
                    "status": "ok",
                    "llmAvailable": available,
                    "model": model,
                }))
            }
            other => Err(RpcError::MethodNotFound(other.to_string())),
        }
    }
}
