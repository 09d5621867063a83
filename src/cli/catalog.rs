//! Demo catalog served by `cosync replay` and `cosync demo`.
//!
//! * `echo` context: the credential string is the client id; request `echo`
//!   returns its params.
//! * `room` context: a chat log per room. Request `say` appends a message,
//!   `add_item` appends to the shared list and touches `list`.
//! * `list` query: the shared list, optionally filtered by `params.prefix`.
//! * `other` query: a constant, bound to its own path.

use crate::context::{ContextConfig, ContextInfo, RequestCall};
use crate::error::SyncError;
use crate::events::{EventPath, PathEventTree};
use crate::protocol::ContextDescriptor;
use crate::query::QueryCall;
use crate::server::SyncServer;
use crate::types::{ClientId, ContextId};
use anyhow::bail;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

pub const LIST_PATH: &str = "list";

#[derive(Clone, Default)]
pub struct DemoCatalog {
    list: Arc<Mutex<Vec<String>>>,
    rooms: Arc<Mutex<HashMap<ContextId, Vec<Value>>>>,
}

fn authorize(credential: Value) -> anyhow::Result<ClientId> {
    match credential.as_str() {
        Some(token) if !token.is_empty() => Ok(ClientId::new(token)),
        _ => bail!("bad token"),
    }
}

impl DemoCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> Vec<String> {
        self.list.lock().clone()
    }

    /// Register every demo query and context on `server`.
    pub async fn install(&self, server: &SyncServer) -> Result<(), SyncError> {
        let list = Arc::clone(&self.list);
        server.register_query_with_trigger(
            "list",
            move |call: QueryCall| {
                let list = Arc::clone(&list);
                async move {
                    let prefix = call.param("prefix").as_str().unwrap_or_default().to_string();
                    let items: Vec<String> = list
                        .lock()
                        .iter()
                        .filter(|item| item.starts_with(&prefix))
                        .cloned()
                        .collect();
                    Ok(json!(items))
                }
            },
            |_params: Option<&Value>| EventPath::parse(LIST_PATH),
        );
        server.register_query("other", |_call: QueryCall| async move { Ok(json!("static")) });

        server.add_context(echo_context()).await?;
        server
            .add_context(self.room_context(server.tree().clone()))
            .await?;
        Ok(())
    }

    fn room_context(&self, tree: PathEventTree) -> ContextConfig {
        let rooms_for_data = Arc::clone(&self.rooms);
        let rooms_for_say = Arc::clone(&self.rooms);
        let rooms_for_close = Arc::clone(&self.rooms);
        let list = Arc::clone(&self.list);

        ContextConfig::new("room", |credential: Value| async move { authorize(credential) })
            .data(move |info: ContextInfo| {
                let rooms = Arc::clone(&rooms_for_data);
                async move {
                    let messages = rooms.lock().get(&info.id).cloned().unwrap_or_default();
                    Ok(json!({ "messages": messages }))
                }
            })
            .status(|_info: ContextInfo, clients: Vec<ClientId>| async move {
                Ok(json!({ "clients": clients }))
            })
            .request("say", move |call: RequestCall| {
                let rooms = Arc::clone(&rooms_for_say);
                async move {
                    let Some(text) = call.params.as_ref().and_then(Value::as_str) else {
                        bail!("say expects a string");
                    };
                    let message = json!({ "from": call.client, "text": text });
                    let mut rooms = rooms.lock();
                    let log = rooms.entry(call.info.id.clone()).or_default();
                    log.push(message);
                    Ok(json!(log.len()))
                }
            })
            .request("add_item", move |call: RequestCall| {
                let list = Arc::clone(&list);
                let tree = tree.clone();
                async move {
                    let Some(item) = call.params.as_ref().and_then(Value::as_str) else {
                        bail!("add_item expects a string");
                    };
                    let len = {
                        let mut list = list.lock();
                        list.push(item.to_string());
                        list.len()
                    };
                    tree.touch(&EventPath::parse(LIST_PATH));
                    Ok(json!(len))
                }
            })
            .on_close(move |info: ContextInfo| {
                let rooms = Arc::clone(&rooms_for_close);
                async move {
                    rooms.lock().remove(&info.id);
                    Ok(())
                }
            })
    }
}

fn echo_context() -> ContextConfig {
    ContextConfig::new("echo", |credential: Value| async move { authorize(credential) })
        .request("echo", |call: RequestCall| async move {
            Ok(call.params.unwrap_or(Value::Null))
        })
}

/// Walkthrough script for `cosync demo`
pub const DEMO_SCRIPT: &str = r#"# echo: join then request
{"connection":"alice","message":{"event":"join","credential":"u1","context":{"name":"echo"}}}
{"connection":"alice","message":{"event":"request","context_id":"$echo","request":{"name":"echo","params":"hi"}}}
# room: {} and absent params are different rooms
{"connection":"alice","message":{"event":"join","credential":"u1","context":{"name":"room","params":{}}}}
{"connection":"bob","message":{"event":"join","credential":"u2","context":{"name":"room"}}}
# list: two subscribers share one query, one mutation, one update each
{"connection":"alice","message":{"event":"query","name":"list"}}
{"connection":"bob","message":{"event":"query","name":"list"}}
{"connection":"carol","message":{"event":"query","name":"other"}}
{"connection":"bob","message":{"event":"request","context_id":"$room","request":{"name":"add_item","params":"apples"}}}
# a bad credential is rejected
{"connection":"mallory","message":{"event":"join","credential":null,"context":{"name":"echo"}}}
{"connection":"bob","disconnect":true}
"#;

/// Context ids the demo script refers to as `$name`
pub fn demo_placeholders() -> Vec<(&'static str, ContextId)> {
    vec![
        ("$echo", ContextDescriptor::new("echo", None).id()),
        ("$room", ContextDescriptor::new("room", None).id()),
    ]
}
