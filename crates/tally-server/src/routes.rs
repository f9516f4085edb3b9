//! Single-endpoint JSON RPC surface
//!
//! Every operation arrives as a POST to `/` with an `action`
//! discriminator. Mutations against the presence table are intercepted
//! before the generic path: heartbeats and logouts are presence
//! operations, and direct inserts into it are refused.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Map, Value};
use tally_core::protocol::{Action, RpcRequest, RpcResponse, PRESENCE_TABLE};
use tally_core::{Record, TableDef};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::db::Authority;
use crate::error::AppError;
use crate::presence;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Authority>>,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(rpc))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn rpc(
    State(state): State<AppState>,
    Json(request): Json<RpcRequest>,
) -> Result<Json<RpcResponse>, AppError> {
    let db = state
        .db
        .lock()
        .map_err(|_| AppError::Database("state lock poisoned".to_string()))?;
    let now_ms = chrono::Utc::now().timestamp_millis();
    dispatch(&db, request, now_ms).map(Json)
}

fn dispatch(db: &Authority, request: RpcRequest, now_ms: i64) -> Result<RpcResponse, AppError> {
    match request.action {
        Action::InitSchema => {
            db.init_schema()?;
            tracing::info!("schema initialized");
            Ok(RpcResponse::ok())
        }
        Action::FetchHydrationData => {
            let mut data = Map::new();
            for (table, records) in db.fetch_all()? {
                data.insert(table, serde_json::to_value(records)?);
            }
            Ok(RpcResponse::with_data(Value::Object(data)))
        }
        Action::RemoteLogin => remote_login(db, &request, now_ms),
        Action::Insert | Action::Update | Action::Delete => mutate(db, request, now_ms),
    }
}

fn mutate(db: &Authority, request: RpcRequest, now_ms: i64) -> Result<RpcResponse, AppError> {
    let table = request
        .table
        .as_deref()
        .ok_or_else(|| AppError::bad_request("mutation requires a table"))?;
    let data = request
        .data
        .clone()
        .ok_or_else(|| AppError::bad_request("mutation requires a data payload"))?;

    if table == PRESENCE_TABLE {
        return presence_mutation(db, request.action, &data, now_ms);
    }

    let def = db
        .registry()
        .get(table)
        .ok_or_else(|| AppError::bad_request(format!("unknown table: {table}")))?;
    let record =
        Record::from_wire(data.0, def).map_err(|e| AppError::BadRequest(e.to_string()))?;

    match request.action {
        Action::Insert => db.insert(def, &record)?,
        Action::Update => db.update(def, &record)?,
        Action::Delete => db.delete(def, &record)?,
        _ => unreachable!("mutate only receives mutation actions"),
    }
    Ok(RpcResponse::ok())
}

fn presence_mutation(
    db: &Authority,
    action: Action,
    data: &Record,
    now_ms: i64,
) -> Result<RpcResponse, AppError> {
    let user_id = required_field(data, "userId")?;
    match action {
        Action::Update => {
            let device_id = required_field(data, "deviceId")?;
            presence::heartbeat(db.connection(), &user_id, &device_id, now_ms)?;
        }
        Action::Delete => presence::release(db.connection(), &user_id)?,
        _ => {
            return Err(AppError::bad_request(
                "sessions are managed through REMOTE_LOGIN",
            ))
        }
    }
    Ok(RpcResponse::ok())
}

fn remote_login(db: &Authority, request: &RpcRequest, now_ms: i64) -> Result<RpcResponse, AppError> {
    let username = request
        .username
        .as_deref()
        .ok_or_else(|| AppError::bad_request("login requires a username"))?;
    let password = request
        .password
        .as_deref()
        .ok_or_else(|| AppError::bad_request("login requires a password"))?;
    let device_id = request
        .device_id
        .as_deref()
        .ok_or_else(|| AppError::bad_request("login requires a deviceId"))?;

    let user = db
        .find_user(username)?
        .filter(|u| u.get("password").and_then(Value::as_str) == Some(password))
        .ok_or_else(|| AppError::bad_request("invalid username or password"))?;
    let user_id = user_primary_key(db, &user)?;

    if !presence::claim(db.connection(), &user_id, device_id, now_ms)? {
        return Err(AppError::SessionActive(user_id));
    }
    tracing::info!(user_id, device_id, "login accepted");
    Ok(RpcResponse {
        success: true,
        user: Some(user),
        ..RpcResponse::default()
    })
}

fn user_primary_key(db: &Authority, user: &Record) -> Result<String, AppError> {
    let users: &TableDef = db
        .registry()
        .get("users")
        .ok_or_else(|| AppError::Database("registry has no users table".to_string()))?;
    user.primary_key_of(users)
        .ok_or_else(|| AppError::Database("stored user record has no userId".to_string()))
}

fn required_field(record: &Record, field: &str) -> Result<String, AppError> {
    record
        .get(field)
        .and_then(Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| AppError::bad_request(format!("payload requires a {field} value")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tally_core::protocol::MutationKind;
    use tally_core::Registry;

    use super::*;

    fn db_with_user() -> Authority {
        let db = Authority::open_in_memory(Registry::retail()).unwrap();
        db.init_schema().unwrap();
        let users = db.registry().get("users").unwrap();
        let ada = Record::from_json(json!({
            "userId": "u1", "username": "ada", "password": "pw", "role": "admin",
        }))
        .unwrap();
        db.insert(users, &ada).unwrap();
        db
    }

    fn login_request(username: &str, password: &str, device_id: &str) -> RpcRequest {
        let mut request = RpcRequest::bare(Action::RemoteLogin);
        request.username = Some(username.to_string());
        request.password = Some(password.to_string());
        request.device_id = Some(device_id.to_string());
        request
    }

    #[test]
    fn login_returns_the_user_record() {
        let db = db_with_user();
        let response = dispatch(&db, login_request("ada", "pw", "device-a"), 0).unwrap();
        assert!(response.success);
        let user = response.user.unwrap();
        assert_eq!(user.get("userId"), Some(&json!("u1")));
    }

    #[test]
    fn login_rejects_bad_credentials_and_concurrent_devices() {
        let db = db_with_user();
        let err = dispatch(&db, login_request("ada", "wrong", "device-a"), 0).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        dispatch(&db, login_request("ada", "pw", "device-a"), 0).unwrap();
        let err = dispatch(&db, login_request("ada", "pw", "device-b"), 50_000).unwrap_err();
        assert!(matches!(err, AppError::SessionActive(user) if user == "u1"));
    }

    #[test]
    fn mutation_decodes_wire_encoded_structured_fields() {
        let db = db_with_user();
        let payload = Record::from_json(json!({
            "id": "p1",
            "price": "3.50",
            "variants": "[{\"size\":\"S\"}]",
        }))
        .unwrap();
        let request = RpcRequest::mutation(MutationKind::Insert, "products", payload);
        dispatch(&db, request, 0).unwrap();

        let all = db.fetch_all().unwrap();
        assert_eq!(all["products"][0].get("price"), Some(&json!(3.5)));
        assert_eq!(
            all["products"][0].get("variants"),
            Some(&json!([{ "size": "S" }]))
        );
    }

    #[test]
    fn duplicate_insert_surfaces_the_conflict_error() {
        let db = db_with_user();
        let payload = Record::from_json(json!({ "id": "p1" })).unwrap();
        let request = RpcRequest::mutation(MutationKind::Insert, "products", payload);
        dispatch(&db, request.clone(), 0).unwrap();
        let err = dispatch(&db, request, 0).unwrap_err();
        assert!(matches!(err, AppError::DuplicateId(key) if key == "p1"));
    }

    #[test]
    fn presence_updates_bypass_the_generic_mutation_path() {
        let db = db_with_user();
        dispatch(&db, login_request("ada", "pw", "device-a"), 0).unwrap();

        let beat = Record::from_json(json!({ "userId": "u1", "deviceId": "device-a" })).unwrap();
        let request = RpcRequest::mutation(MutationKind::Update, "sessions", beat);
        dispatch(&db, request, 60_000).unwrap();
        let holder = presence::get(db.connection(), "u1").unwrap().unwrap();
        assert_eq!(holder.last_heartbeat_at, 60_000);

        let bye = Record::from_json(json!({ "userId": "u1" })).unwrap();
        let request = RpcRequest::mutation(MutationKind::Delete, "sessions", bye);
        dispatch(&db, request, 61_000).unwrap();
        assert!(presence::get(db.connection(), "u1").unwrap().is_none());
    }

    #[test]
    fn direct_inserts_into_the_presence_table_are_refused() {
        let db = db_with_user();
        let payload = Record::from_json(json!({ "userId": "u1", "deviceId": "d" })).unwrap();
        let request = RpcRequest::mutation(MutationKind::Insert, "sessions", payload);
        assert!(matches!(
            dispatch(&db, request, 0).unwrap_err(),
            AppError::BadRequest(_)
        ));
    }

    #[test]
    fn hydration_returns_every_registry_table() {
        let db = db_with_user();
        let response = dispatch(&db, RpcRequest::bare(Action::FetchHydrationData), 0).unwrap();
        let data = response.data.unwrap();
        let tables = data.as_object().unwrap();
        assert_eq!(tables.len(), 6);
        assert_eq!(tables["users"].as_array().unwrap().len(), 1);
        assert!(!tables.contains_key("sessions"));
    }
}
