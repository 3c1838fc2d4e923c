//! Scoped lifecycle of an external rendering surface.
//!
//! A [`ViewportManager`] binds one engine instance to one mount point for the
//! lifetime of the owning view: it attaches once, loads the reference structure on
//! request and disposes the instance exactly once on teardown, including when
//! teardown wins the race against a slow attach.

mod headless;

pub(crate) use headless::HeadlessEngine;

use crate::error::ViewportError;
use anyhow::Result;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

/// Reference structure loaded by `load_sample`.
pub const SAMPLE_STRUCTURE_URL: &str = "https://files.rcsb.org/download/1CRN.pdb";

/// Where a surface lives. A zero-sized mount has not been laid out yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub id: String,
    pub width: u32,
    pub height: u32,
}

impl MountPoint {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
        }
    }

    pub fn is_laid_out(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// A live engine instance bound to a surface.
pub trait ViewportHandle: Send + Sync + 'static {
    fn load_file(&mut self, url: &str) -> impl Future<Output = Result<()>> + Send;

    /// Fit the camera to whatever is loaded.
    fn auto_view(&mut self);

    /// Release the instance and the resources it holds.
    fn dispose(self) -> Result<()>;
}

/// Creates engine instances. Attaching may take a while (engine start-up).
pub trait ViewportEngine: Send + Sync + 'static {
    type Handle: ViewportHandle;

    fn attach(&self, mount: &MountPoint) -> impl Future<Output = Result<Self::Handle>> + Send;
}

pub struct ViewportSession<H> {
    mount_id: String,
    handle: H,
    loaded: bool,
}

impl<H> ViewportSession<H> {
    pub fn mount_id(&self) -> &str {
        &self.mount_id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }
}

// `attempt` is held by the call doing the work; a dead one means that call was
// cancelled and the state no longer describes anything.
enum Slot<H> {
    Empty,
    Initializing { mount_id: String, attempt: Weak<()> },
    Live(ViewportSession<H>),
    // The session is out on a `SessionLease` while its structure loads.
    Loading { mount_id: String, attempt: Weak<()> },
    // Final: nothing is attached after teardown.
    TornDown,
}

impl<H> Slot<H> {
    fn clear_abandoned(&mut self) {
        let abandoned = match self {
            Slot::Initializing { attempt, .. } | Slot::Loading { attempt, .. } => {
                attempt.strong_count() == 0
            }
            _ => false,
        };
        if abandoned {
            tracing::debug!("clearing abandoned viewport operation");
            *self = Slot::Empty;
        }
    }

    /// Mount the slot is bound to, live or pending.
    fn bound_mount(&self) -> Option<&str> {
        match self {
            Slot::Initializing { mount_id, .. } | Slot::Loading { mount_id, .. } => {
                Some(mount_id.as_str())
            }
            Slot::Live(session) => Some(session.mount_id.as_str()),
            Slot::Empty | Slot::TornDown => None,
        }
    }
}

fn dispose_quietly<H: ViewportHandle>(handle: H) {
    if let Err(e) = handle.dispose() {
        tracing::warn!(error = %e, "viewport dispose failed");
    }
}

pub struct ViewportManager<E: ViewportEngine> {
    engine: E,
    sample_url: String,
    slot: Mutex<Slot<E::Handle>>,
}

impl<E: ViewportEngine> ViewportManager<E> {
    pub fn new(engine: E, sample_url: impl Into<String>) -> Self {
        Self {
            engine,
            sample_url: sample_url.into(),
            slot: Mutex::new(Slot::Empty),
        }
    }

    /// Attach an engine instance to `mount`.
    ///
    /// A second call for the same mount collapses onto the existing (or pending)
    /// session; a different mount is rejected while a session is bound.
    pub async fn initialize(&self, mount: &MountPoint) -> Result<(), ViewportError> {
        if !mount.is_laid_out() {
            return Err(ViewportError::MountUnavailable(mount.id.clone()));
        }

        let attempt = Arc::new(());
        {
            let mut slot = self.slot.lock().await;
            slot.clear_abandoned();
            if matches!(*slot, Slot::TornDown) {
                return Err(ViewportError::TornDown);
            }
            if let Some(bound) = slot.bound_mount() {
                if bound != mount.id {
                    return Err(ViewportError::AlreadyBound(bound.to_string()));
                }
                tracing::debug!(mount = %mount.id, "viewport already initialized");
                return Ok(());
            }
            *slot = Slot::Initializing {
                mount_id: mount.id.clone(),
                attempt: Arc::downgrade(&attempt),
            };
        }

        // The lock is released while the engine starts so teardown can run meanwhile.
        // If this future is dropped here, `attempt` dies with it.
        let attached = self.engine.attach(mount).await;

        let mut slot = self.slot.lock().await;
        match attached {
            Err(e) => {
                if matches!(*slot, Slot::Initializing { .. }) {
                    *slot = Slot::Empty;
                }
                Err(ViewportError::Engine(e))
            }
            Ok(handle) => {
                if matches!(*slot, Slot::TornDown) {
                    drop(slot);
                    tracing::debug!(mount = %mount.id, "viewport ready after teardown, disposing");
                    dispose_quietly(handle);
                    return Err(ViewportError::TornDown);
                }
                tracing::debug!(mount = %mount.id, "viewport attached");
                *slot = Slot::Live(ViewportSession {
                    mount_id: mount.id.clone(),
                    handle,
                    loaded: false,
                });
                Ok(())
            }
        }
    }

    /// Fetch the reference structure into the surface and fit the view to it.
    /// Each call fetches again. Without a live session this does nothing.
    ///
    /// The slot is not locked during the fetch, so teardown never waits on it; a
    /// session torn down mid-load is disposed once the load returns.
    pub async fn load_sample(&self) -> Result<(), ViewportError> {
        let mut lease = {
            let mut slot = self.slot.lock().await;
            slot.clear_abandoned();
            match std::mem::replace(&mut *slot, Slot::Empty) {
                Slot::Live(session) => {
                    let attempt = Arc::new(());
                    *slot = Slot::Loading {
                        mount_id: session.mount_id.clone(),
                        attempt: Arc::downgrade(&attempt),
                    };
                    SessionLease {
                        slot: &self.slot,
                        session: Some(session),
                        _attempt: attempt,
                    }
                }
                other => {
                    if matches!(other, Slot::Loading { .. }) {
                        tracing::debug!("load_sample while another load is running");
                    } else {
                        tracing::debug!("load_sample without a viewport session");
                    }
                    *slot = other;
                    return Ok(());
                }
            }
        };

        let res = lease.load(&self.sample_url).await;
        lease.give_back().await;
        res
    }

    pub async fn is_loaded(&self) -> bool {
        matches!(&*self.slot.lock().await, Slot::Live(s) if s.loaded)
    }

    /// Run `f` against the live session, if any.
    pub async fn with_session<R>(&self, f: impl FnOnce(&ViewportSession<E::Handle>) -> R) -> Option<R> {
        match &*self.slot.lock().await {
            Slot::Live(session) => Some(f(session)),
            _ => None,
        }
    }

    /// Dispose the session, if any. Later calls and a pending attach become no-ops
    /// (the late instance is disposed on arrival, as is a session out on a load).
    pub async fn teardown(&self) {
        let mut slot = self.slot.lock().await;
        match std::mem::replace(&mut *slot, Slot::TornDown) {
            Slot::Live(session) => {
                tracing::debug!(mount = %session.mount_id, "disposing viewport");
                dispose_quietly(session.handle);
            }
            Slot::Loading { mount_id, .. } => {
                tracing::debug!(mount = %mount_id, "viewport will be disposed after its load");
            }
            _ => {}
        }
    }
}

/// A session taken out of the slot for the length of one load.
struct SessionLease<'a, H: ViewportHandle> {
    slot: &'a Mutex<Slot<H>>,
    session: Option<ViewportSession<H>>,
    _attempt: Arc<()>,
}

impl<H: ViewportHandle> SessionLease<'_, H> {
    async fn load(&mut self, url: &str) -> Result<(), ViewportError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.handle.load_file(url).await?;
        session.handle.auto_view();
        session.loaded = true;
        Ok(())
    }

    async fn give_back(mut self) {
        let mut slot = self.slot.lock().await;
        if let Some(session) = self.session.take() {
            return_session(&mut slot, session);
        }
    }
}

impl<H: ViewportHandle> Drop for SessionLease<'_, H> {
    // Only reached with a session when the load was cancelled.
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match self.slot.try_lock() {
            Ok(mut slot) => return_session(&mut slot, session),
            // The slot clears itself once `_attempt` is gone.
            Err(_) => dispose_quietly(session.handle),
        }
    }
}

fn return_session<H: ViewportHandle>(slot: &mut Slot<H>, session: ViewportSession<H>) {
    if matches!(slot, Slot::Loading { .. }) {
        *slot = Slot::Live(session);
    } else {
        tracing::debug!(mount = %session.mount_id, "viewport torn down during load, disposing");
        dispose_quietly(session.handle);
    }
}

impl<E: ViewportEngine> Drop for ViewportManager<E> {
    fn drop(&mut self) {
        if let Slot::Live(session) = std::mem::replace(self.slot.get_mut(), Slot::TornDown) {
            dispose_quietly(session.handle);
        }
    }
}
