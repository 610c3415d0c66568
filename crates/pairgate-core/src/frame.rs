//! Authentication frame handle, mount descriptor and single-slot registry.
//!
//! The frame is owned by whatever component mounted it. The registry only keeps
//! a weak reference so orchestration code can find the live frame without being
//! handed it, and a dropped frame reads as absent.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Result;
use url::Url;

use crate::config::FrameConfig;

/// Document ready state reported by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

/// Signal raised by a frame's document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSignal {
    Load,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

pub type FrameListener = Box<dyn Fn(&FrameSignal) + Send + Sync>;

/// Live handle to a mounted authentication frame.
pub trait FrameHandle: Send + Sync {
    /// Ready state of the frame's document.
    ///
    /// `None` when the document cannot be read (cross-origin).
    fn ready_state(&self) -> Option<ReadyState>;

    /// Subscribes to load and error signals.
    fn add_listener(&self, listener: FrameListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId);

    /// Reassigns the frame's source to itself, forcing a full reload.
    fn reload(&self);
}

/// Sequence number of one registration; identifies a frame instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountId(u64);

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered frame, upgraded for the duration of a step.
#[derive(Clone)]
pub struct MountedFrame {
    pub id: MountId,
    pub handle: Arc<dyn FrameHandle>,
}

#[derive(Default)]
struct Slot {
    next_mount: u64,
    current: Option<(MountId, Weak<dyn FrameHandle>)>,
}

/// Single-slot registry of the currently mounted frame.
///
/// Cloning yields another handle to the same slot.
#[derive(Clone, Default)]
pub struct FrameRegistry {
    slot: Arc<Mutex<Slot>>,
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `frame` in the slot (replacing any previous one), or clears it.
    ///
    /// Returns the mount id assigned to the new registration.
    pub fn set_frame(&self, frame: Option<&Arc<dyn FrameHandle>>) -> Option<MountId> {
        match frame {
            Some(frame) => Some(self.register(Arc::downgrade(frame))),
            None => {
                self.lock().current = None;
                None
            }
        }
    }

    fn register(&self, frame: Weak<dyn FrameHandle>) -> MountId {
        let mut slot = self.lock();
        slot.next_mount += 1;
        let id = MountId(slot.next_mount);
        slot.current = Some((id, frame));
        id
    }

    /// Returns the live frame handle, if one is registered and still alive.
    pub fn get_frame(&self) -> Option<Arc<dyn FrameHandle>> {
        self.current().map(|mounted| mounted.handle)
    }

    /// Returns the live frame together with its mount id.
    pub fn current(&self) -> Option<MountedFrame> {
        let slot = self.lock();
        let (id, weak) = slot.current.as_ref()?;
        weak.upgrade().map(|handle| MountedFrame { id: *id, handle })
    }

    /// Registers `frame` until the returned guard is dropped.
    pub fn mount<F>(&self, frame: &Arc<F>) -> MountGuard
    where
        F: FrameHandle + 'static,
    {
        let weak: Weak<F> = Arc::downgrade(frame);
        let weak: Weak<dyn FrameHandle> = weak;
        let id = self.register(weak);
        tracing::debug!(mount = %id, "authentication frame mounted");
        MountGuard {
            registry: self.clone(),
            id,
        }
    }

    /// Clears the slot only if it still holds mount `id`.
    fn unmount(&self, id: MountId) {
        let mut slot = self.lock();
        if slot.current.as_ref().is_some_and(|(current, _)| *current == id) {
            slot.current = None;
            tracing::debug!(mount = %id, "authentication frame unmounted");
        }
    }
}

/// Keeps a frame registered; unregisters it on drop.
///
/// A guard never clears a registration made after its own.
#[must_use = "the frame is unmounted when the guard is dropped"]
pub struct MountGuard {
    registry: FrameRegistry,
    id: MountId,
}

impl MountGuard {
    pub fn id(&self) -> MountId {
        self.id
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        self.registry.unmount(self.id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Hidden,
    Visible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

/// Description of the embeddable identity-provider surface.
#[derive(Debug, Clone)]
pub struct FrameSpec {
    pub src: Url,
    pub visible: FrameGeometry,
}

impl FrameSpec {
    /// Sandbox permissions granted to the frame.
    pub const SANDBOX: &'static [&'static str] =
        &["allow-scripts", "allow-forms", "allow-same-origin"];

    pub fn from_config(config: &FrameConfig) -> Result<Self> {
        Ok(Self {
            src: config.effective_base_url()?,
            visible: FrameGeometry {
                width: config.visible_width,
                height: config.visible_height,
            },
        })
    }

    pub fn geometry(&self, visibility: Visibility) -> FrameGeometry {
        match visibility {
            Visibility::Hidden => FrameGeometry {
                width: 0,
                height: 0,
            },
            Visibility::Visible => self.visible,
        }
    }

    /// Value of the frame's `sandbox` attribute.
    pub fn sandbox_attr(&self) -> String {
        Self::SANDBOX.join(" ")
    }
}
