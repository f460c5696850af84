use chrono::{DateTime, Utc};
use obsd_core::{ConnectionState, SessionId};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheStore};
use crate::error::SessionError;
use crate::event_handler::{ObsEvent, SessionEvent};
use crate::mailbox;
use crate::task_pool::TaskPoolHandle;
use crate::tracker::TrackerHandle;

const COMPONENT: &str = "scene_manager";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SceneEntry {
    pub name: String,
    pub index: i64,
}

/// Scene collection as last reported by OBS.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SceneSnapshot {
    pub scenes: Vec<SceneEntry>,
    pub current_program_scene: Option<String>,
    /// Only meaningful while studio mode is on.
    pub current_preview_scene: Option<String>,
    pub studio_mode: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

impl SceneSnapshot {
    /// Fold one event into the snapshot. Returns whether anything changed.
    pub fn apply_event(&mut self, event: &ObsEvent) -> bool {
        match event.event_type.as_str() {
            "SceneListChanged" => match event.data.get("scenes").and_then(parse_scenes) {
                Some(scenes) => {
                    self.scenes = scenes;
                    true
                }
                None => false,
            },
            "CurrentProgramSceneChanged" => match event.str_field("sceneName") {
                Some(name) => {
                    self.current_program_scene = Some(name.to_string());
                    true
                }
                None => false,
            },
            "CurrentPreviewSceneChanged" => match event.str_field("sceneName") {
                Some(name) => {
                    self.current_preview_scene = Some(name.to_string());
                    true
                }
                None => false,
            },
            "StudioModeStateChanged" => match event.bool_field("studioModeEnabled") {
                Some(enabled) => {
                    self.set_studio_mode(enabled);
                    true
                }
                None => false,
            },
            "SceneCreated" => {
                if event.bool_field("isGroup") == Some(true) {
                    return false;
                }
                let Some(name) = event.str_field("sceneName") else {
                    return false;
                };
                if self.scenes.iter().any(|s| s.name == name) {
                    return false;
                }
                let index = self.scenes.iter().map(|s| s.index + 1).max().unwrap_or(0);
                self.scenes.push(SceneEntry {
                    name: name.to_string(),
                    index,
                });
                true
            }
            "SceneRemoved" => {
                let Some(name) = event.str_field("sceneName") else {
                    return false;
                };
                let before = self.scenes.len();
                self.scenes.retain(|s| s.name != name);
                if self.current_program_scene.as_deref() == Some(name) {
                    self.current_program_scene = None;
                }
                if self.current_preview_scene.as_deref() == Some(name) {
                    self.current_preview_scene = None;
                }
                self.scenes.len() != before
            }
            "SceneNameChanged" => {
                let (Some(old), Some(new)) =
                    (event.str_field("oldSceneName"), event.str_field("sceneName"))
                else {
                    return false;
                };
                for scene in self.scenes.iter_mut().filter(|s| s.name == old) {
                    scene.name = new.to_string();
                }
                for current in [
                    &mut self.current_program_scene,
                    &mut self.current_preview_scene,
                ] {
                    if current.as_deref() == Some(old) {
                        *current = Some(new.to_string());
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Replace the snapshot from a `GetSceneList` response.
    pub fn apply_scene_list(&mut self, data: &Value) {
        if let Some(scenes) = data.get("scenes").and_then(parse_scenes) {
            self.scenes = scenes;
        }
        self.current_program_scene = data
            .get("currentProgramSceneName")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.current_preview_scene = data
            .get("currentPreviewSceneName")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    /// Apply a `GetStudioModeEnabled` response.
    pub fn apply_studio_mode(&mut self, data: &Value) {
        if let Some(enabled) = data.get("studioModeEnabled").and_then(Value::as_bool) {
            self.set_studio_mode(enabled);
        }
    }

    fn set_studio_mode(&mut self, enabled: bool) {
        self.studio_mode = enabled;
        if !enabled {
            self.current_preview_scene = None;
        }
    }
}

fn parse_scenes(value: &Value) -> Option<Vec<SceneEntry>> {
    let list = value.as_array()?;
    Some(
        list.iter()
            .enumerate()
            .filter_map(|(position, scene)| {
                let name = scene.get("sceneName")?.as_str()?;
                let index = scene
                    .get("sceneIndex")
                    .and_then(Value::as_i64)
                    .unwrap_or(position as i64);
                Some(SceneEntry {
                    name: name.to_string(),
                    index,
                })
            })
            .collect(),
    )
}

pub(crate) enum SceneMsg {
    GetState {
        reply: oneshot::Sender<SceneSnapshot>,
    },
    Refresh,
    Refreshed {
        list: Value,
        studio_mode: Value,
    },
}

#[derive(Clone)]
pub struct SceneManagerHandle {
    tx: mpsc::UnboundedSender<SceneMsg>,
}

impl SceneManagerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SceneMsg>) -> Self {
        Self { tx }
    }

    pub async fn get_state(&self) -> Result<SceneSnapshot, SessionError> {
        mailbox::call(&self.tx, COMPONENT, |reply| SceneMsg::GetState { reply }).await
    }

    /// Re-read the scene list from OBS in the background.
    pub fn refresh(&self) {
        mailbox::cast(&self.tx, COMPONENT, SceneMsg::Refresh);
    }
}

pub(crate) struct SceneManager {
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<SceneMsg>,
    mailbox: mpsc::UnboundedSender<SceneMsg>,
    events: broadcast::Receiver<SessionEvent>,
    tracker: TrackerHandle,
    pool: TaskPoolHandle,
    cache: CacheEntry<SceneSnapshot>,
    cancel: CancellationToken,
    snapshot: SceneSnapshot,
}

impl SceneManager {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: SessionId,
        mailbox: mpsc::UnboundedSender<SceneMsg>,
        rx: mpsc::UnboundedReceiver<SceneMsg>,
        events: broadcast::Receiver<SessionEvent>,
        tracker: TrackerHandle,
        pool: TaskPoolHandle,
        cache: &CacheStore<SceneSnapshot>,
        cancel: CancellationToken,
    ) -> Self {
        let snapshot = SceneSnapshot::default();
        let cache = cache.register(session_id.clone(), snapshot.clone());
        Self {
            session_id,
            rx,
            mailbox,
            events,
            tracker,
            pool,
            cache,
            cancel,
            snapshot,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Ok(SessionEvent::Obs(event)) => {
                        if self.snapshot.apply_event(&event) {
                            self.publish();
                        }
                    }
                    Ok(SessionEvent::Connection(ConnectionState::Ready)) => self.refresh(),
                    Ok(SessionEvent::Connection(_)) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(session_id = %self.session_id, skipped = n, "scene manager lagged, refreshing");
                        self.refresh();
                    }
                    Err(RecvError::Closed) => break,
                },
                msg = self.rx.recv() => match msg {
                    Some(SceneMsg::GetState { reply }) => {
                        let _ = reply.send(self.snapshot.clone());
                    }
                    Some(SceneMsg::Refresh) => self.refresh(),
                    Some(SceneMsg::Refreshed { list, studio_mode }) => {
                        self.snapshot.apply_scene_list(&list);
                        self.snapshot.apply_studio_mode(&studio_mode);
                        self.publish();
                    }
                    None => break,
                },
            }
        }
    }

    fn publish(&mut self) {
        self.snapshot.last_updated = Some(Utc::now());
        self.cache.set(self.snapshot.clone());
    }

    fn refresh(&self) {
        let tracker = self.tracker.clone();
        let mailbox = self.mailbox.clone();
        debug!(session_id = %self.session_id, "refreshing scenes");
        let spawned = self.pool.spawn("scene_refresh", async move {
            let list = tracker.send_request("GetSceneList", None).await?;
            let studio_mode = tracker.send_request("GetStudioModeEnabled", None).await?;
            let _ = mailbox.send(SceneMsg::Refreshed { list, studio_mode });
            Ok(())
        });
        if let Err(e) = spawned {
            warn!(session_id = %self.session_id, error = %e, "scene refresh not scheduled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, data: Value) -> ObsEvent {
        ObsEvent::new(event_type, data)
    }

    fn names(s: &SceneSnapshot) -> Vec<&str> {
        s.scenes.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn scene_list_response_replaces_snapshot() {
        let mut s = SceneSnapshot::default();
        s.apply_scene_list(&json!({
            "currentProgramSceneName": "Live",
            "currentPreviewSceneName": null,
            "scenes": [
                {"sceneIndex": 1, "sceneName": "Live"},
                {"sceneIndex": 0, "sceneName": "BRB"}
            ]
        }));
        assert_eq!(names(&s), vec!["Live", "BRB"]);
        assert_eq!(s.scenes[1].index, 0);
        assert_eq!(s.current_program_scene.as_deref(), Some("Live"));
        assert_eq!(s.current_preview_scene, None);
    }

    #[test]
    fn targeted_events_patch_fields() {
        let mut s = SceneSnapshot::default();
        assert!(s.apply_event(&event("SceneCreated", json!({"sceneName": "Intro", "isGroup": false}))));
        assert!(s.apply_event(&event("SceneCreated", json!({"sceneName": "Outro", "isGroup": false}))));
        assert!(!s.apply_event(&event("SceneCreated", json!({"sceneName": "Group 1", "isGroup": true}))));
        assert_eq!(names(&s), vec!["Intro", "Outro"]);
        assert_eq!(s.scenes[1].index, 1);

        assert!(s.apply_event(&event("CurrentProgramSceneChanged", json!({"sceneName": "Intro"}))));
        assert!(s.apply_event(&event(
            "SceneNameChanged",
            json!({"oldSceneName": "Intro", "sceneName": "Opening"})
        )));
        assert_eq!(s.current_program_scene.as_deref(), Some("Opening"));
        assert_eq!(names(&s), vec!["Opening", "Outro"]);

        assert!(s.apply_event(&event("SceneRemoved", json!({"sceneName": "Opening"}))));
        assert_eq!(names(&s), vec!["Outro"]);
        assert_eq!(s.current_program_scene, None);
    }

    #[test]
    fn studio_mode_controls_preview() {
        let mut s = SceneSnapshot::default();
        s.apply_event(&event("StudioModeStateChanged", json!({"studioModeEnabled": true})));
        s.apply_event(&event("CurrentPreviewSceneChanged", json!({"sceneName": "Next"})));
        assert!(s.studio_mode);
        assert_eq!(s.current_preview_scene.as_deref(), Some("Next"));
        s.apply_studio_mode(&json!({"studioModeEnabled": false}));
        assert!(!s.studio_mode);
        assert_eq!(s.current_preview_scene, None);
    }

    #[test]
    fn unrelated_events_change_nothing() {
        let mut s = SceneSnapshot::default();
        s.apply_event(&event("SceneCreated", json!({"sceneName": "A"})));
        let before = s.clone();
        assert!(!s.apply_event(&event("InputMuteStateChanged", json!({"inputName": "Mic"}))));
        assert!(!s.apply_event(&event("SceneListChanged", json!({"scenes": "oops"}))));
        assert!(!s.apply_event(&event("CurrentProgramSceneChanged", json!({}))));
        assert_eq!(s, before);
    }

    #[tokio::test]
    async fn manager_mirrors_events_into_cache() {
        let (stream_tx, _) = broadcast::channel(16);
        let (tracker_tx, _tracker_rx) = mpsc::unbounded_channel();
        let (pool_tx, _pool_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let store = CacheStore::new();
        let id = SessionId::from("scenes");
        let cancel = CancellationToken::new();
        let manager = SceneManager::new(
            id.clone(),
            tx.clone(),
            rx,
            stream_tx.subscribe(),
            TrackerHandle::new(tracker_tx),
            TaskPoolHandle::new(pool_tx),
            &store,
            cancel.clone(),
        );
        assert_eq!(store.get(&id), Some(SceneSnapshot::default()));
        let task = tokio::spawn(manager.run());
        let handle = SceneManagerHandle::new(tx);

        stream_tx
            .send(SessionEvent::Obs(std::sync::Arc::new(event(
                "CurrentProgramSceneChanged",
                json!({"sceneName": "Live"}),
            ))))
            .unwrap();
        let state = handle.get_state().await.unwrap();
        assert_eq!(state.current_program_scene.as_deref(), Some("Live"));
        assert_eq!(store.get(&id).unwrap().current_program_scene.as_deref(), Some("Live"));

        cancel.cancel();
        task.await.unwrap();
        assert!(!store.contains(&id));
    }
}
