use chromiumoxide::cdp::browser_protocol::page::{
    EventJavascriptDialogOpening, HandleJavaScriptDialogParams,
};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::Page;
use futures::StreamExt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Live registry of in-flight sessions, shared between the pool and Stats.
pub type ActiveSessions = Arc<RwLock<Vec<Arc<SessionHandle>>>>;

/// One browser session owned by one in-flight task.
///
/// A handle is registered in the active-sessions registry before the page
/// exists so the concurrency ceiling counts in-progress creation. The page
/// lives in its own browser context (own cookies and storage) whose id is
/// parked here for disposal; page and context id are each attached at most
/// once. Teardown dismisses any pending JavaScript dialogs first (a page
/// with an open dialog refuses to close), then closes the page; it is a
/// no-op when no page was ever attached.
pub struct SessionHandle {
    id: Uuid,
    created_at: Instant,
    page: Mutex<Option<Page>>,
    context_id: Mutex<Option<BrowserContextId>>,
    // Shared with the dialog listener task.
    pending_dialogs: Arc<Mutex<Vec<String>>>,
    dialog_listener: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Instant::now(),
            page: Mutex::new(None),
            context_id: Mutex::new(None),
            pending_dialogs: Arc::new(Mutex::new(Vec::new())),
            dialog_listener: Mutex::new(None),
        }
    }

    /// Park the id of the browser context backing this session. The owner
    /// disposes the context after teardown via
    /// [`take_context_id`](Self::take_context_id).
    pub fn set_context_id(&self, id: BrowserContextId) {
        if let Ok(mut slot) = self.context_id.lock() {
            *slot = Some(id);
        }
    }

    pub fn take_context_id(&self) -> Option<BrowserContextId> {
        self.context_id.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn lifetime(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Attach the underlying page and start collecting dialog events.
    pub async fn attach_page(&self, page: Page) {
        match page.event_listener::<EventJavascriptDialogOpening>().await {
            Ok(mut stream) => {
                let session_id = self.id;
                let pending = Arc::clone(&self.pending_dialogs);
                let listener = tokio::spawn(async move {
                    while let Some(event) = stream.next().await {
                        debug!(session_id = %session_id, message = %event.message, "dialog opened");
                        if let Ok(mut list) = pending.lock() {
                            list.push(event.message.clone());
                        }
                    }
                });
                if let Ok(mut slot) = self.dialog_listener.lock() {
                    *slot = Some(listener);
                }
            }
            Err(e) => {
                debug!(session_id = %self.id, error = %e, "dialog listener unavailable");
            }
        }

        if let Ok(mut slot) = self.page.lock() {
            *slot = Some(page);
        }
    }

    pub fn page(&self) -> Option<Page> {
        self.page.lock().ok().and_then(|slot| slot.clone())
    }

    pub fn pending_dialog_count(&self) -> usize {
        self.pending_dialogs
            .lock()
            .map(|list| list.len())
            .unwrap_or(0)
    }

    /// Ordered teardown: dismiss pending dialogs, stop the listener, close
    /// the page. Every step swallows its own failure; a dialog that already
    /// vanished must not keep the session open.
    pub async fn close(&self) {
        let page = self.page.lock().ok().and_then(|mut slot| slot.take());

        let Some(page) = page else {
            return;
        };

        let pending = self
            .pending_dialogs
            .lock()
            .map(|mut list| list.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();

        for message in pending {
            match HandleJavaScriptDialogParams::builder().accept(false).build() {
                Ok(params) => {
                    if let Err(e) = page.execute(params).await {
                        debug!(session_id = %self.id, dialog = %message, error = %e, "dialog already gone");
                    }
                }
                Err(e) => {
                    debug!(session_id = %self.id, error = %e, "dialog dismiss params")
                }
            }
        }

        if let Ok(mut slot) = self.dialog_listener.lock() {
            if let Some(listener) = slot.take() {
                listener.abort();
            }
        }

        if let Err(e) = page.close().await {
            debug!(session_id = %self.id, error = %e, "page close failed");
        }
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_without_page_is_noop() {
        let handle = SessionHandle::new();
        assert!(handle.page().is_none());
        handle.close().await;
        handle.close().await;
        assert_eq!(handle.pending_dialog_count(), 0);
    }

    #[test]
    fn context_id_is_surrendered_once() {
        let handle = SessionHandle::new();
        assert!(handle.take_context_id().is_none());

        handle.set_context_id(BrowserContextId::new("ctx-1"));
        assert!(handle.take_context_id().is_some());
        assert!(handle.take_context_id().is_none());
    }

    #[test]
    fn handles_get_distinct_ids() {
        let a = SessionHandle::new();
        let b = SessionHandle::new();
        assert_ne!(a.id(), b.id());
    }
}
