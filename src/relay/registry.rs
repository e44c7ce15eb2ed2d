use std::collections::HashMap;

use serde_json::{Value, json};
use uuid::Uuid;

/// Kind of a debuggable target the broker exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Page,
    Iframe,
}

impl TargetKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Iframe => "iframe",
        }
    }
}

/// A tab (or OOPIF child) the extension has told the broker about.
#[derive(Debug, Clone)]
pub struct TargetEntry {
    /// Stable opaque identity. Browser-provided when available, otherwise
    /// synthesized as `tab-<tabId>`.
    pub target_id: String,
    pub tab_id: u64,
    pub kind: TargetKind,
    pub url: String,
    pub title: String,
    pub attached: bool,
}

impl TargetEntry {
    /// The `TargetInfo` shape CDP clients expect in Target-domain payloads.
    #[must_use]
    pub fn target_info(&self) -> Value {
        json!({
            "targetId": self.target_id,
            "type": self.kind.as_str(),
            "title": self.title,
            "url": self.url,
            "attached": self.attached,
            "canAccessOpener": false,
        })
    }
}

/// A client's binding to a target, minted by `Target.attachToTarget`.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session_id: String,
    pub client_id: u64,
    pub target_id: String,
    pub tab_id: u64,
    /// Set once the first `Runtime.enable` has been processed for this
    /// session, so the disable/enable re-emission runs only once.
    pub runtime_enabled: bool,
}

/// Outcome of minting a session for a (client, target) pair.
#[derive(Debug)]
pub struct MintOutcome {
    pub session_id: String,
    pub tab_id: u64,
    /// False when the pair already had an active session (returned as-is).
    pub created: bool,
}

/// Mirror of the extension's attached-tab set, plus the session table.
///
/// Source of truth for `Target.getTargets` and for synthesized Target-domain
/// lifecycle events. All mutation happens under the broker's registry lock;
/// fan-out works on snapshots cloned out of the lock.
#[derive(Debug, Default)]
pub struct Registry {
    targets: HashMap<String, TargetEntry>,
    tab_index: HashMap<u64, String>,
    sessions: HashMap<String, SessionEntry>,
    /// Browser-assigned child (OOPIF) session ids observed on extension
    /// traffic, mapped to the tab they belong to.
    child_sessions: HashMap<String, u64>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or refresh a tab. Returns the target id and whether the entry
    /// is new.
    pub fn upsert_tab(
        &mut self,
        tab_id: u64,
        target_id: Option<&str>,
        url: Option<&str>,
        title: Option<&str>,
    ) -> (String, bool) {
        if let Some(existing_id) = self.tab_index.get(&tab_id).cloned() {
            let entry = self
                .targets
                .get_mut(&existing_id)
                .expect("tab index points at a live target");
            if let Some(url) = url {
                entry.url = url.to_owned();
            }
            if let Some(title) = title {
                entry.title = title.to_owned();
            }
            return (existing_id, false);
        }

        let target_id = target_id
            .map_or_else(|| format!("tab-{tab_id}"), str::to_owned);
        self.targets.insert(
            target_id.clone(),
            TargetEntry {
                target_id: target_id.clone(),
                tab_id,
                kind: TargetKind::Page,
                url: url.unwrap_or_default().to_owned(),
                title: title.unwrap_or_default().to_owned(),
                attached: false,
            },
        );
        self.tab_index.insert(tab_id, target_id.clone());
        (target_id, true)
    }

    /// Record an OOPIF child target reported from within a tab.
    pub fn upsert_child_target(
        &mut self,
        target_id: &str,
        tab_id: u64,
        url: Option<&str>,
        title: Option<&str>,
    ) {
        let entry = self
            .targets
            .entry(target_id.to_owned())
            .or_insert_with(|| TargetEntry {
                target_id: target_id.to_owned(),
                tab_id,
                kind: TargetKind::Iframe,
                url: String::new(),
                title: String::new(),
                attached: true,
            });
        if let Some(url) = url {
            entry.url = url.to_owned();
        }
        if let Some(title) = title {
            entry.title = title.to_owned();
        }
    }

    #[must_use]
    pub fn get(&self, target_id: &str) -> Option<&TargetEntry> {
        self.targets.get(target_id)
    }

    #[must_use]
    pub fn target_for_tab(&self, tab_id: u64) -> Option<&TargetEntry> {
        self.tab_index
            .get(&tab_id)
            .and_then(|id| self.targets.get(id))
    }

    pub fn set_attached(&mut self, target_id: &str, attached: bool) {
        if let Some(entry) = self.targets.get_mut(target_id) {
            entry.attached = attached;
        }
    }

    /// Remove a target (and its index entry). Sessions are not touched; use
    /// [`remove_sessions_for_target`](Self::remove_sessions_for_target) first.
    pub fn remove_target(&mut self, target_id: &str) -> Option<TargetEntry> {
        let entry = self.targets.remove(target_id)?;
        self.tab_index.remove(&entry.tab_id);
        Some(entry)
    }

    /// Remove every target, returning the removed entries.
    pub fn clear_targets(&mut self) -> Vec<TargetEntry> {
        self.tab_index.clear();
        self.targets.drain().map(|(_, entry)| entry).collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<TargetEntry> {
        self.targets.values().cloned().collect()
    }

    #[must_use]
    pub fn attached_targets(&self) -> Vec<TargetEntry> {
        self.targets
            .values()
            .filter(|t| t.attached)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Mint a session for a (client, target) pair, or return the existing
    /// one. Returns `None` if the target is unknown.
    pub fn mint_session(&mut self, client_id: u64, target_id: &str) -> Option<MintOutcome> {
        let tab_id = self.targets.get(target_id)?.tab_id;

        if let Some(existing) = self
            .sessions
            .values()
            .find(|s| s.client_id == client_id && s.target_id == target_id)
        {
            return Some(MintOutcome {
                session_id: existing.session_id.clone(),
                tab_id,
                created: false,
            });
        }

        let session_id = Uuid::new_v4().to_string();
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                session_id: session_id.clone(),
                client_id,
                target_id: target_id.to_owned(),
                tab_id,
                runtime_enabled: false,
            },
        );
        Some(MintOutcome {
            session_id,
            tab_id,
            created: true,
        })
    }

    /// Bind a caller-chosen session id to a (client, target) pair, used when
    /// the id was already handed to the extension (`createTab`). Falls back
    /// to the pair's existing session if one is active.
    pub fn bind_session(
        &mut self,
        session_id: &str,
        client_id: u64,
        target_id: &str,
    ) -> Option<MintOutcome> {
        let tab_id = self.targets.get(target_id)?.tab_id;

        if let Some(existing) = self
            .sessions
            .values()
            .find(|s| s.client_id == client_id && s.target_id == target_id)
        {
            return Some(MintOutcome {
                session_id: existing.session_id.clone(),
                tab_id,
                created: false,
            });
        }

        self.sessions.insert(
            session_id.to_owned(),
            SessionEntry {
                session_id: session_id.to_owned(),
                client_id,
                target_id: target_id.to_owned(),
                tab_id,
                runtime_enabled: false,
            },
        );
        Some(MintOutcome {
            session_id: session_id.to_owned(),
            tab_id,
            created: true,
        })
    }

    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<&SessionEntry> {
        self.sessions.get(session_id)
    }

    pub fn session_mut(&mut self, session_id: &str) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(session_id)
    }

    pub fn remove_session(&mut self, session_id: &str) -> Option<SessionEntry> {
        self.sessions.remove(session_id)
    }

    #[must_use]
    pub fn sessions_for_tab(&self, tab_id: u64) -> Vec<SessionEntry> {
        self.sessions
            .values()
            .filter(|s| s.tab_id == tab_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn sessions_for_target(&self, target_id: &str) -> Vec<SessionEntry> {
        self.sessions
            .values()
            .filter(|s| s.target_id == target_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn session_count_for_client(&self, client_id: u64) -> usize {
        self.sessions
            .values()
            .filter(|s| s.client_id == client_id)
            .count()
    }

    /// True if any session other than `session_id` is bound to the target.
    #[must_use]
    pub fn target_has_other_sessions(&self, target_id: &str, session_id: &str) -> bool {
        self.sessions
            .values()
            .any(|s| s.target_id == target_id && s.session_id != session_id)
    }

    /// Remove all sessions belonging to a client (on disconnect/drop).
    pub fn remove_client_sessions(&mut self, client_id: u64) -> Vec<SessionEntry> {
        let ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.client_id == client_id)
            .map(|s| s.session_id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.sessions.remove(id))
            .collect()
    }

    /// Remove all sessions bound to a target.
    pub fn remove_sessions_for_target(&mut self, target_id: &str) -> Vec<SessionEntry> {
        let ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.target_id == target_id)
            .map(|s| s.session_id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.sessions.remove(id))
            .collect()
    }

    /// Remove every session (user-canceled detach, extension gone).
    pub fn drain_sessions(&mut self) -> Vec<SessionEntry> {
        self.child_sessions.clear();
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    pub fn register_child_session(&mut self, child_session_id: &str, tab_id: u64) {
        self.child_sessions
            .insert(child_session_id.to_owned(), tab_id);
    }

    pub fn remove_child_session(&mut self, child_session_id: &str) {
        self.child_sessions.remove(child_session_id);
    }

    #[must_use]
    pub fn child_session_tab(&self, child_session_id: &str) -> Option<u64> {
        self.child_sessions.get(child_session_id).copied()
    }
}
