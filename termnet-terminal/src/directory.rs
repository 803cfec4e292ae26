//! Local view of the realm's terminals, fed by `ListTerminals` snapshots and
//! `TerminalInfo` channel updates.

use serde_json::Value;
use termnet_core::{TerminalInfo, Validator};
use tokio::sync::watch;

pub struct Directory {
    terminals: watch::Sender<Vec<TerminalInfo>>,
    ready: watch::Sender<bool>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            terminals: watch::Sender::new(Vec::new()),
            ready: watch::Sender::new(false),
        }
    }

    pub fn snapshot(&self) -> Vec<TerminalInfo> {
        self.terminals.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<TerminalInfo>> {
        self.terminals.subscribe()
    }

    pub fn get(&self, terminal_id: &str) -> Option<TerminalInfo> {
        self.terminals
            .borrow()
            .iter()
            .find(|t| t.terminal_id == terminal_id)
            .cloned()
    }

    /// Install a full snapshot.
    pub fn replace(&self, terminals: Vec<TerminalInfo>) {
        self.terminals.send_replace(terminals);
        self.ready.send_replace(true);
    }

    /// Upsert one descriptor. Older updates than the stored one are ignored.
    pub fn merge(&self, info: TerminalInfo) {
        self.terminals.send_if_modified(|list| {
            match list.iter_mut().find(|t| t.terminal_id == info.terminal_id) {
                Some(existing) if existing.updated_at > info.updated_at => false,
                Some(existing) => {
                    *existing = info;
                    true
                }
                None => {
                    list.push(info);
                    true
                }
            }
        });
        self.ready.send_replace(true);
    }

    pub fn remove(&self, terminal_id: &str) {
        self.terminals.send_if_modified(|list| {
            let before = list.len();
            list.retain(|t| t.terminal_id != terminal_id);
            list.len() != before
        });
    }

    /// Resolves once anything has been loaded.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        let _ = rx.wait_for(|r| *r).await;
    }

    /// Terminals advertising `method` with a schema that accepts `req`.
    pub fn providers(&self, method: &str, req: &Value, validator: &dyn Validator) -> Vec<String> {
        self.terminals
            .borrow()
            .iter()
            .filter(|t| {
                t.services_for(method)
                    .any(|s| validator.validate(&s.schema, req))
            })
            .map(|t| t.terminal_id.clone())
            .collect()
    }
}
