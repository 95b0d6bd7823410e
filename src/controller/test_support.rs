//! In-memory stand-ins for the Kubernetes API and pod exec used by the
//! controller tests

use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use super::refresh::{ExecOutput, PodExecutor};
use crate::error::Result;

const COLLECTIONS: &[&str] = &[
    "vpngws",
    "keepaliveds",
    "ipsecconns",
    "pods",
    "secrets",
    "statefulsets",
    "daemonsets",
];

#[derive(Default)]
struct Store {
    objects: BTreeMap<String, Value>,
    requests: Vec<String>,
    version: u64,
}

impl Store {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// Object store answering get, list (with equality label selectors),
/// create, replace, merge patch and delete. Replaces carrying a stale
/// resourceVersion get a 409.
#[derive(Default)]
pub struct FakeApiServer {
    store: Mutex<Store>,
}

fn object_key<K: Resource<DynamicType = ()>>(namespace: &str, name: &str) -> String {
    format!("{}/{}", K::url_path(&(), Some(namespace)), name)
}

impl FakeApiServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert<K>(&self, obj: &K)
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        let key = object_key::<K>(&namespace, &obj.name_any());
        let mut store = self.store.lock().unwrap();
        let mut value = serde_json::to_value(obj).unwrap();
        value["metadata"]["resourceVersion"] = json!(store.next_version());
        store.objects.insert(key, value);
    }

    pub fn get<K>(&self, namespace: &str, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let store = self.store.lock().unwrap();
        store
            .objects
            .get(&object_key::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).unwrap())
    }

    /// Every request seen so far as `"<METHOD> <path>"`
    pub fn requests(&self) -> Vec<String> {
        self.store.lock().unwrap().requests.clone()
    }

    /// Requests that were not reads
    pub fn writes(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| !r.starts_with("GET "))
            .collect()
    }

    pub fn clear_requests(&self) {
        self.store.lock().unwrap().requests.clear();
    }

    pub fn client(self: &Arc<Self>) -> Client {
        let server = Arc::clone(self);
        let service = tower::service_fn(move |request: Request<Body>| {
            let server = Arc::clone(&server);
            async move {
                let (parts, body) = request.into_parts();
                let bytes = body.collect_bytes().await.unwrap();
                let (status, value) = server.handle(
                    &parts.method,
                    parts.uri.path(),
                    parts.uri.query().unwrap_or_default(),
                    &bytes,
                );
                let response = Response::builder()
                    .status(status)
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&value).unwrap()))
                    .unwrap();
                Ok::<_, Infallible>(response)
            }
        });
        Client::new(service, "default")
    }

    fn handle(&self, method: &Method, path: &str, query: &str, body: &[u8]) -> (StatusCode, Value) {
        let mut store = self.store.lock().unwrap();
        store.requests.push(format!("{method} {path}"));

        let (key, subresource) = match path.strip_suffix("/status") {
            Some(key) => (key, true),
            None => (path, false),
        };
        let is_collection = key
            .rsplit('/')
            .next()
            .is_some_and(|last| COLLECTIONS.contains(&last));

        match *method {
            Method::GET if is_collection => {
                let selector = label_selector(query);
                let items: Vec<Value> = store
                    .objects
                    .iter()
                    .filter(|(k, _)| k.rsplit_once('/').map(|(parent, _)| parent) == Some(key))
                    .filter(|(_, v)| selector_matches(&selector, v))
                    .map(|(_, v)| v.clone())
                    .collect();
                let version = store.version.to_string();
                (
                    StatusCode::OK,
                    json!({
                        "apiVersion": "v1",
                        "kind": "List",
                        "metadata": { "resourceVersion": version },
                        "items": items,
                    }),
                )
            }
            Method::GET => match store.objects.get(key) {
                Some(obj) => (StatusCode::OK, obj.clone()),
                None => failure(StatusCode::NOT_FOUND, "NotFound"),
            },
            Method::POST => {
                let mut obj: Value = serde_json::from_slice(body).unwrap();
                let name = obj["metadata"]["name"].as_str().unwrap_or_default().to_string();
                let key = format!("{key}/{name}");
                if store.objects.contains_key(&key) {
                    return failure(StatusCode::CONFLICT, "AlreadyExists");
                }
                obj["metadata"]["uid"] = json!(format!("uid-{name}"));
                obj["metadata"]["resourceVersion"] = json!(store.next_version());
                store.objects.insert(key, obj.clone());
                (StatusCode::CREATED, obj)
            }
            Method::PUT => {
                let Some(stored) = store.objects.get(key).cloned() else {
                    return failure(StatusCode::NOT_FOUND, "NotFound");
                };
                let mut incoming: Value = serde_json::from_slice(body).unwrap();
                if let Some(sent) = incoming["metadata"]["resourceVersion"].as_str() {
                    if Some(sent) != stored["metadata"]["resourceVersion"].as_str() {
                        return failure(StatusCode::CONFLICT, "Conflict");
                    }
                }
                let mut updated = if subresource {
                    let mut obj = stored;
                    obj["status"] = incoming["status"].take();
                    obj
                } else {
                    incoming["status"] = stored["status"].clone();
                    incoming
                };
                updated["metadata"]["resourceVersion"] = json!(store.next_version());
                store.objects.insert(key.to_string(), updated.clone());
                (StatusCode::OK, updated)
            }
            Method::PATCH => {
                let Some(mut obj) = store.objects.get(key).cloned() else {
                    return failure(StatusCode::NOT_FOUND, "NotFound");
                };
                let patch: Value = serde_json::from_slice(body).unwrap();
                merge_patch(&mut obj, &patch);
                obj["metadata"]["resourceVersion"] = json!(store.next_version());
                store.objects.insert(key.to_string(), obj.clone());
                (StatusCode::OK, obj)
            }
            Method::DELETE => match store.objects.remove(key) {
                Some(obj) => (StatusCode::OK, obj),
                None => failure(StatusCode::NOT_FOUND, "NotFound"),
            },
            _ => failure(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed"),
        }
    }
}

fn failure(code: StatusCode, reason: &str) -> (StatusCode, Value) {
    (
        code,
        json!({
            "apiVersion": "v1",
            "kind": "Status",
            "metadata": {},
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": code.as_u16(),
        }),
    )
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).unwrap()
}

/// `key=value` and bare `key` terms of the request's label selector
fn label_selector(query: &str) -> Vec<(String, Option<String>)> {
    query
        .split('&')
        .filter_map(|pair| pair.strip_prefix("labelSelector="))
        .flat_map(|raw| {
            percent_decode(raw)
                .split(',')
                .filter(|term| !term.is_empty())
                .map(|term| match term.split_once('=') {
                    Some((k, v)) => (k.to_string(), Some(v.to_string())),
                    None => (term.to_string(), None),
                })
                .collect::<Vec<_>>()
        })
        .collect()
}

fn selector_matches(selector: &[(String, Option<String>)], obj: &Value) -> bool {
    let labels = &obj["metadata"]["labels"];
    selector.iter().all(|(key, value)| match value {
        Some(value) => labels[key.as_str()].as_str() == Some(value.as_str()),
        None => !labels[key.as_str()].is_null(),
    })
}

/// Scripted exec replies per pod; unknown pods hang forever
#[derive(Default)]
pub struct FakeExecutor {
    replies: Mutex<HashMap<String, ExecOutput>>,
    calls: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl FakeExecutor {
    pub fn reply(self, pod: &str, output: ExecOutput) -> Self {
        self.set_reply(pod, output);
        self
    }

    pub fn set_reply(&self, pod: &str, output: ExecOutput) {
        self.replies.lock().unwrap().insert(pod.to_string(), output);
    }

    pub fn calls(&self) -> Vec<(String, String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PodExecutor for FakeExecutor {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        command: Vec<String>,
    ) -> Result<ExecOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((pod.to_string(), container.to_string(), command));
        let reply = self.replies.lock().unwrap().get(pod).cloned();
        match reply {
            Some(output) => Ok(output),
            None => std::future::pending().await,
        }
    }
}

pub fn exec_ok() -> ExecOutput {
    ExecOutput {
        stdout: "reloaded".to_string(),
        success: true,
        ..Default::default()
    }
}
