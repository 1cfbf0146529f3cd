//! In-memory emulation of the upstream task service.
//!
//! # Design
//! Serves the two endpoint classes the batch engine talks to: the Sync-style
//! `/sync` command endpoint and the REST-style `/tasks/{id}` mutations. Each
//! class has its own request counter and throttle, so tests can script 429
//! responses for one budget without touching the other.
//!
//! The `/sync` endpoint deliberately does NOT substitute `temp_id` references
//! inside a single request. A command referencing a temp id it has not seen
//! as a real id fails with "not found", which keeps client-side staging
//! honest.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use uuid::Uuid;

/// Id of the project every store starts with.
pub const INBOX_PROJECT_ID: &str = "inbox";

const REST_LIMIT: u64 = 1000;
const SYNC_LIMIT: u64 = 100;
const WINDOW_SECS: u64 = 900;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub description: String,
    pub project_id: String,
    pub section_id: Option<String>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    pub priority: u8,
    pub due_string: Option<String>,
    pub due_date: Option<String>,
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub checked: bool,
}

/// Everything the mock knows about. Tasks are typed; the remaining entity
/// kinds are kept as the JSON objects they were created from.
#[derive(Debug)]
pub struct Store {
    pub tasks: HashMap<String, Task>,
    pub projects: HashMap<String, Value>,
    pub sections: HashMap<String, Value>,
    pub labels: HashMap<String, Value>,
    pub notes: HashMap<String, Value>,
    pub reminders: HashMap<String, Value>,
    pub filters: HashMap<String, Value>,
}

impl Default for Store {
    fn default() -> Self {
        let mut projects = HashMap::new();
        projects.insert(
            INBOX_PROJECT_ID.to_string(),
            json!({"id": INBOX_PROJECT_ID, "name": "Inbox"}),
        );
        Self {
            tasks: HashMap::new(),
            projects,
            sections: HashMap::new(),
            labels: HashMap::new(),
            notes: HashMap::new(),
            reminders: HashMap::new(),
            filters: HashMap::new(),
        }
    }
}

/// Endpoint class, mirroring the two independent upstream rate-limit budgets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Budget {
    Rest,
    Sync,
}

#[derive(Debug, Default)]
struct ClassLimits {
    requests: AtomicU64,
    /// Requests up to this count are never throttled.
    throttle_from: AtomicU64,
    throttled: AtomicU32,
    retry_after_ms: AtomicU64,
}

/// Shared handle to the mock's state. Cloning is cheap; all clones observe
/// the same store and counters.
#[derive(Clone, Debug, Default)]
pub struct MockState {
    db: Arc<RwLock<Store>>,
    rest: Arc<ClassLimits>,
    sync: Arc<ClassLimits>,
}

impl MockState {
    pub fn new() -> Self {
        Self::default()
    }

    fn limits(&self, budget: Budget) -> &ClassLimits {
        match budget {
            Budget::Rest => &self.rest,
            Budget::Sync => &self.sync,
        }
    }

    /// Answer the next `count` requests of `budget` with 429. `u32::MAX`
    /// throttles forever.
    pub fn throttle(&self, budget: Budget, count: u32, retry_after: Duration) {
        self.throttle_after(budget, 0, count, retry_after);
    }

    /// Like [`MockState::throttle`], but lets the next `after` requests of
    /// `budget` through first.
    pub fn throttle_after(&self, budget: Budget, after: u64, count: u32, retry_after: Duration) {
        let limits = self.limits(budget);
        limits
            .retry_after_ms
            .store(retry_after.as_millis() as u64, Ordering::SeqCst);
        let seen = limits.requests.load(Ordering::SeqCst);
        limits.throttle_from.store(seen + after, Ordering::SeqCst);
        limits.throttled.store(count, Ordering::SeqCst);
    }

    /// Number of requests received for `budget`, throttled ones included.
    pub fn requests(&self, budget: Budget) -> u64 {
        self.limits(budget).requests.load(Ordering::SeqCst)
    }

    pub async fn seed_task(&self, content: &str) -> String {
        let id = new_id();
        let task = Task {
            id: id.clone(),
            content: content.to_string(),
            description: String::new(),
            project_id: INBOX_PROJECT_ID.to_string(),
            section_id: None,
            parent_id: None,
            labels: Vec::new(),
            priority: 1,
            due_string: None,
            due_date: None,
            assignee_id: None,
            checked: false,
        };
        self.db.write().await.tasks.insert(id.clone(), task);
        id
    }

    pub async fn seed_project(&self, name: &str) -> String {
        let id = new_id();
        self.db
            .write()
            .await
            .projects
            .insert(id.clone(), json!({"id": id, "name": name}));
        id
    }

    pub async fn task(&self, id: &str) -> Option<Task> {
        self.db.read().await.tasks.get(id).cloned()
    }

    /// Runs `f` against the store under the read lock.
    pub async fn inspect<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        f(&*self.db.read().await)
    }
}

pub fn app() -> Router {
    app_with_state(MockState::new())
}

pub fn app_with_state(state: MockState) -> Router {
    Router::new()
        .route("/sync", post(sync))
        .route("/tasks/{id}", get(get_task).post(update_task))
        .route("/tasks/{id}/close", post(close_task))
        .route("/tasks/{id}/reopen", post(reopen_task))
        .route("/tasks/{id}/move", post(move_task))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

pub async fn run_with_state(listener: TcpListener, state: MockState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

async fn rate_limit(State(state): State<MockState>, req: Request, next: Next) -> Response {
    let (budget, limit) = if req.uri().path().ends_with("/sync") {
        (Budget::Sync, SYNC_LIMIT)
    } else {
        (Budget::Rest, REST_LIMIT)
    };
    let limits = state.limits(budget);
    let seen = limits.requests.fetch_add(1, Ordering::SeqCst) + 1;

    let throttled = seen > limits.throttle_from.load(Ordering::SeqCst)
        && limits
            .throttled
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(n),
                n => Some(n - 1),
            })
            .is_ok();

    if throttled {
        let secs = limits.retry_after_ms.load(Ordering::SeqCst) as f64 / 1000.0;
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too many requests. Please retry later.",
                "error_tag": "LIMITS_REACHED",
                "http_code": 429,
                "error_extra": {"retry_after": secs},
            })),
        )
            .into_response();
        insert_header(&mut response, "retry-after", &secs.to_string());
        insert_header(&mut response, "x-ratelimit-remaining", "0");
        insert_header(&mut response, "x-ratelimit-reset", &secs.to_string());
        return response;
    }

    let mut response = next.run(req).await;
    let remaining = limit.saturating_sub(seen);
    insert_header(&mut response, "x-ratelimit-remaining", &remaining.to_string());
    insert_header(&mut response, "x-ratelimit-reset", &WINDOW_SECS.to_string());
    response
}

fn insert_header(response: &mut Response, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

type HandlerError = (StatusCode, Json<Value>);

fn rest_error(status: StatusCode, message: &str) -> HandlerError {
    (status, Json(json!({"error": message})))
}

fn task_not_found() -> HandlerError {
    rest_error(StatusCode::NOT_FOUND, "Task not found")
}

#[derive(Deserialize)]
pub struct MoveTask {
    pub project_id: Option<String>,
    pub section_id: Option<String>,
    pub parent_id: Option<String>,
}

async fn get_task(
    State(state): State<MockState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, HandlerError> {
    let store = state.db.read().await;
    store.tasks.get(&id).cloned().map(Json).ok_or_else(task_not_found)
}

async fn update_task(
    State(state): State<MockState>,
    Path(id): Path<String>,
    Json(fields): Json<Map<String, Value>>,
) -> Result<Json<Task>, HandlerError> {
    let mut store = state.db.write().await;
    let task = store.tasks.get_mut(&id).ok_or_else(task_not_found)?;
    apply_task_fields(task, &fields).map_err(|e| rest_error(StatusCode::BAD_REQUEST, &e))?;
    Ok(Json(task.clone()))
}

async fn close_task(
    State(state): State<MockState>,
    Path(id): Path<String>,
) -> Result<StatusCode, HandlerError> {
    let mut store = state.db.write().await;
    let task = store.tasks.get_mut(&id).ok_or_else(task_not_found)?;
    task.checked = true;
    Ok(StatusCode::NO_CONTENT)
}

async fn reopen_task(
    State(state): State<MockState>,
    Path(id): Path<String>,
) -> Result<StatusCode, HandlerError> {
    let mut store = state.db.write().await;
    let task = store.tasks.get_mut(&id).ok_or_else(task_not_found)?;
    task.checked = false;
    Ok(StatusCode::NO_CONTENT)
}

async fn move_task(
    State(state): State<MockState>,
    Path(id): Path<String>,
    Json(input): Json<MoveTask>,
) -> Result<Json<Task>, HandlerError> {
    let mut store = state.db.write().await;
    if !store.tasks.contains_key(&id) {
        return Err(task_not_found());
    }
    let target = move_target(&input.project_id, &input.section_id, &input.parent_id)
        .map_err(|e| rest_error(StatusCode::BAD_REQUEST, &e))?;
    relocate(&mut store, &id, target).map_err(|e| rest_error(StatusCode::BAD_REQUEST, &e))?;
    let task = store.tasks.get(&id).cloned().ok_or_else(task_not_found)?;
    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// Shared mutation helpers
// ---------------------------------------------------------------------------

enum MoveTarget<'a> {
    Project(&'a str),
    Section(&'a str),
    Parent(&'a str),
}

fn move_target<'a>(
    project_id: &'a Option<String>,
    section_id: &'a Option<String>,
    parent_id: &'a Option<String>,
) -> Result<MoveTarget<'a>, String> {
    match (project_id, section_id, parent_id) {
        (Some(p), None, None) => Ok(MoveTarget::Project(p)),
        (None, Some(s), None) => Ok(MoveTarget::Section(s)),
        (None, None, Some(p)) => Ok(MoveTarget::Parent(p)),
        _ => Err("exactly one of project_id, section_id or parent_id is required".to_string()),
    }
}

fn relocate(store: &mut Store, id: &str, target: MoveTarget<'_>) -> Result<(), String> {
    let (project_id, section_id, parent_id) = match target {
        MoveTarget::Project(p) => {
            if !store.projects.contains_key(p) {
                return Err("Project not found".to_string());
            }
            (p.to_string(), None, None)
        }
        MoveTarget::Section(s) => {
            let section = store.sections.get(s).ok_or("Section not found")?;
            let project = section["project_id"].as_str().unwrap_or(INBOX_PROJECT_ID);
            (project.to_string(), Some(s.to_string()), None)
        }
        MoveTarget::Parent(p) => {
            if p == id {
                return Err("Parent task not found".to_string());
            }
            let parent = store.tasks.get(p).ok_or("Parent task not found")?;
            (parent.project_id.clone(), parent.section_id.clone(), Some(p.to_string()))
        }
    };
    let task = store.tasks.get_mut(id).ok_or("Task not found")?;
    task.project_id = project_id;
    task.section_id = section_id;
    task.parent_id = parent_id;
    Ok(())
}

fn apply_task_fields(task: &mut Task, fields: &Map<String, Value>) -> Result<(), String> {
    for (key, value) in fields {
        match key.as_str() {
            "content" => task.content = string_field(key, value)?,
            "description" => task.description = string_field(key, value)?,
            "priority" => {
                task.priority = value
                    .as_u64()
                    .filter(|p| (1..=4).contains(p))
                    .ok_or("priority must be an integer between 1 and 4")? as u8;
            }
            "labels" => {
                let labels = value.as_array().ok_or("labels must be a list")?;
                task.labels = labels
                    .iter()
                    .map(|l| l.as_str().map(str::to_string).ok_or("labels must be strings"))
                    .collect::<Result<Vec<String>, &str>>()?;
            }
            "due_string" => task.due_string = optional_string_field(key, value)?,
            "due_date" => task.due_date = optional_string_field(key, value)?,
            "assignee_id" => task.assignee_id = optional_string_field(key, value)?,
            _ => {}
        }
    }
    Ok(())
}

fn string_field(key: &str, value: &Value) -> Result<String, String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| format!("{key} must be a string"))
}

fn optional_string_field(key: &str, value: &Value) -> Result<Option<String>, String> {
    if value.is_null() {
        return Ok(None);
    }
    string_field(key, value).map(Some)
}

// ---------------------------------------------------------------------------
// Sync endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub commands: Vec<SyncCommand>,
}

#[derive(Debug, Deserialize)]
pub struct SyncCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub uuid: String,
    pub temp_id: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub sync_status: HashMap<String, Value>,
    pub temp_id_mapping: HashMap<String, String>,
}

struct CommandError {
    code: u32,
    http_code: u16,
    message: String,
}

impl CommandError {
    fn not_found(what: &str) -> Self {
        Self {
            code: 22,
            http_code: 404,
            message: format!("{what} not found"),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: 20,
            http_code: 400,
            message: message.into(),
        }
    }

    fn into_status(self) -> Value {
        json!({"error": self.message, "error_code": self.code, "http_code": self.http_code})
    }
}

async fn sync(
    State(state): State<MockState>,
    Json(input): Json<SyncRequest>,
) -> Json<SyncResponse> {
    let mut store = state.db.write().await;
    let mut sync_status = HashMap::new();
    let mut temp_id_mapping = HashMap::new();

    for command in &input.commands {
        let status = match apply_command(&mut store, command) {
            Ok(created) => {
                if let (Some(real_id), Some(temp_id)) = (created, &command.temp_id) {
                    temp_id_mapping.insert(temp_id.clone(), real_id);
                }
                Value::String("ok".to_string())
            }
            Err(e) => e.into_status(),
        };
        sync_status.insert(command.uuid.clone(), status);
    }

    Json(SyncResponse {
        sync_status,
        temp_id_mapping,
    })
}

fn arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, CommandError> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CommandError::invalid(format!("missing argument `{key}`")))
}

fn optional_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

fn existing_task<'a>(
    store: &'a mut Store,
    args: &Map<String, Value>,
    key: &str,
) -> Result<&'a mut Task, CommandError> {
    let id = arg(args, key)?;
    store
        .tasks
        .get_mut(id)
        .ok_or_else(|| CommandError::not_found("Task"))
}

fn create_entity(map: &mut HashMap<String, Value>, args: &Map<String, Value>) -> String {
    let id = new_id();
    let mut entity = args.clone();
    entity.insert("id".to_string(), Value::String(id.clone()));
    map.insert(id.clone(), Value::Object(entity));
    id
}

/// Applies one command, returning the id of the entity it created, if any.
fn apply_command(store: &mut Store, command: &SyncCommand) -> Result<Option<String>, CommandError> {
    let args = &command.args;
    match command.kind.as_str() {
        "item_add" => {
            let content = arg(args, "content")?.to_string();
            let mut project_id = optional_arg(args, "project_id")
                .unwrap_or(INBOX_PROJECT_ID)
                .to_string();
            if !store.projects.contains_key(&project_id) {
                return Err(CommandError::not_found("Project"));
            }
            let section_id = optional_arg(args, "section_id").map(str::to_string);
            if let Some(section) = &section_id {
                let section = store
                    .sections
                    .get(section)
                    .ok_or_else(|| CommandError::not_found("Section"))?;
                if let Some(p) = section["project_id"].as_str() {
                    project_id = p.to_string();
                }
            }
            let parent_id = optional_arg(args, "parent_id").map(str::to_string);
            if let Some(parent) = &parent_id {
                let parent = store
                    .tasks
                    .get(parent)
                    .ok_or_else(|| CommandError::not_found("Parent task"))?;
                project_id = parent.project_id.clone();
            }
            let id = new_id();
            let mut task = Task {
                id: id.clone(),
                content,
                description: String::new(),
                project_id,
                section_id,
                parent_id,
                labels: Vec::new(),
                priority: 1,
                due_string: None,
                due_date: None,
                assignee_id: None,
                checked: false,
            };
            let mut rest = args.clone();
            for key in ["content", "project_id", "section_id", "parent_id"] {
                rest.remove(key);
            }
            apply_task_fields(&mut task, &rest).map_err(CommandError::invalid)?;
            store.tasks.insert(id.clone(), task);
            Ok(Some(id))
        }
        "item_update" => {
            let task = existing_task(store, args, "id")?;
            let mut fields = args.clone();
            fields.remove("id");
            apply_task_fields(task, &fields).map_err(CommandError::invalid)?;
            Ok(None)
        }
        "item_delete" => {
            let id = arg(args, "id")?;
            store
                .tasks
                .remove(id)
                .map(|_| None)
                .ok_or_else(|| CommandError::not_found("Task"))
        }
        "item_close" => {
            existing_task(store, args, "id")?.checked = true;
            Ok(None)
        }
        "item_uncomplete" => {
            existing_task(store, args, "id")?.checked = false;
            Ok(None)
        }
        "item_move" => {
            let id = arg(args, "id")?.to_string();
            if !store.tasks.contains_key(&id) {
                return Err(CommandError::not_found("Task"));
            }
            let project_id = optional_arg(args, "project_id").map(str::to_string);
            let section_id = optional_arg(args, "section_id").map(str::to_string);
            let parent_id = optional_arg(args, "parent_id").map(str::to_string);
            let target =
                move_target(&project_id, &section_id, &parent_id).map_err(CommandError::invalid)?;
            relocate(store, &id, target).map_err(|e| CommandError {
                code: 22,
                http_code: 404,
                message: e,
            })?;
            Ok(None)
        }
        "project_add" => {
            arg(args, "name")?;
            Ok(Some(create_entity(&mut store.projects, args)))
        }
        "section_add" => {
            arg(args, "name")?;
            let project_id = arg(args, "project_id")?;
            if !store.projects.contains_key(project_id) {
                return Err(CommandError::not_found("Project"));
            }
            Ok(Some(create_entity(&mut store.sections, args)))
        }
        "label_add" => {
            arg(args, "name")?;
            Ok(Some(create_entity(&mut store.labels, args)))
        }
        "note_add" => {
            arg(args, "content")?;
            match (optional_arg(args, "item_id"), optional_arg(args, "project_id")) {
                (Some(item_id), _) if !store.tasks.contains_key(item_id) => {
                    return Err(CommandError::not_found("Task"));
                }
                (None, Some(project_id)) if !store.projects.contains_key(project_id) => {
                    return Err(CommandError::not_found("Project"));
                }
                (None, None) => {
                    return Err(CommandError::invalid("missing argument `item_id`"));
                }
                _ => {}
            }
            Ok(Some(create_entity(&mut store.notes, args)))
        }
        "filter_add" => {
            arg(args, "name")?;
            arg(args, "query")?;
            Ok(Some(create_entity(&mut store.filters, args)))
        }
        "reminder_add" => {
            let item_id = arg(args, "item_id")?;
            if !store.tasks.contains_key(item_id) {
                return Err(CommandError::not_found("Task"));
            }
            Ok(Some(create_entity(&mut store.reminders, args)))
        }
        "reminder_update" => {
            let id = arg(args, "id")?;
            let reminder = store
                .reminders
                .get_mut(id)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| CommandError::not_found("Reminder"))?;
            for (key, value) in args {
                reminder.insert(key.clone(), value.clone());
            }
            Ok(None)
        }
        "reminder_delete" => {
            let id = arg(args, "id")?;
            store
                .reminders
                .remove(id)
                .map(|_| None)
                .ok_or_else(|| CommandError::not_found("Reminder"))
        }
        "shared_label_rename" => {
            let old = arg(args, "name_old")?;
            let new = arg(args, "name_new")?;
            for task in store.tasks.values_mut() {
                for label in task.labels.iter_mut().filter(|l| l.as_str() == old) {
                    *label = new.to_string();
                }
            }
            Ok(None)
        }
        "shared_label_remove" => {
            let name = arg(args, "name")?;
            for task in store.tasks.values_mut() {
                task.labels.retain(|l| l != name);
            }
            Ok(None)
        }
        other => Err(CommandError::invalid(format!("Unknown command type `{other}`"))),
    }
}
