//! Per-session handler set

use lumen_ipc::{Completion, DisplayServer, HandlerResult, SessionCredentials};
use lumen_protocol::{
    Buffer, BufferSubmission, ConnectParameters, Connection, DisplayConfiguration, Platform,
    Screencast, ScreencastId, ScreencastParameters, SideChannel, Surface, SurfaceId,
    SurfaceParameters, Void,
};
use lumen_util::{LumenError, Result};
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};

use crate::{BufferExecutor, DisplayState, SUPPORTED_PIXEL_FORMATS, ShmBuffer};

/// Buffers a surface cycles through once fully grown
pub const SWAP_CHAIN_DEPTH: usize = 3;

/// Byte written to a surface's event channel for each submitted frame
pub const FRAME_SUBMITTED_EVENT: u8 = 1;

/// Privileged operations a session may use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPermissions {
    pub screencast: bool,
    pub display_configuration: bool,
}

impl SessionPermissions {
    pub fn all() -> Self {
        Self {
            screencast: true,
            display_configuration: true,
        }
    }

    pub fn none() -> Self {
        Self {
            screencast: false,
            display_configuration: false,
        }
    }
}

struct SurfaceRecord {
    name: String,
    width: i32,
    height: i32,
    pixel_format: u32,
    /// Server end of the channel whose other end went to the client
    events: UnixStream,
    buffers: Vec<Arc<ShmBuffer>>,
    current: usize,
    frames_submitted: u64,
}

impl SurfaceRecord {
    /// Grow the chain until it is full, then cycle through it
    fn advance(&mut self, next_buffer_id: &mut i32) -> Result<Arc<ShmBuffer>> {
        if self.buffers.len() < SWAP_CHAIN_DEPTH {
            *next_buffer_id += 1;
            let buffer = Arc::new(ShmBuffer::allocate(
                *next_buffer_id,
                self.width,
                self.height,
                self.pixel_format,
            )?);
            self.buffers.push(buffer);
            self.current = self.buffers.len() - 1;
        } else {
            self.current = (self.current + 1) % self.buffers.len();
        }
        Ok(self.buffers[self.current].clone())
    }

    fn notify_frame(&self) {
        let mut events = &self.events;
        match events.write(&[FRAME_SUBMITTED_EVENT]) {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                trace!(surface = %self.name, "Frame event dropped, client not reading");
            }
            Err(e) => debug!(surface = %self.name, error = %e, "Frame event channel closed"),
        }
    }
}

struct ScreencastRecord {
    buffer: Arc<ShmBuffer>,
    frames_captured: u64,
}

#[derive(Default)]
struct SessionState {
    connected: bool,
    application_name: String,
    surfaces: HashMap<i32, SurfaceRecord>,
    screencasts: HashMap<i32, ScreencastRecord>,
    next_surface_id: i32,
    next_screencast_id: i32,
    next_buffer_id: i32,
}

/// Handlers for one client session.
///
/// Surfaces and screencasts are owned by the session and go away with it.
/// `next_buffer` and `screencast_buffer` are answered from the shared
/// [`BufferExecutor`] rather than on the dispatching thread.
pub struct SessionMediator {
    credentials: SessionCredentials,
    permissions: SessionPermissions,
    display: Arc<DisplayState>,
    executor: Arc<BufferExecutor>,
    state: Mutex<SessionState>,
}

impl SessionMediator {
    pub fn new(
        credentials: SessionCredentials,
        permissions: SessionPermissions,
        display: Arc<DisplayState>,
        executor: Arc<BufferExecutor>,
    ) -> Self {
        Self {
            credentials,
            permissions,
            display,
            executor,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn credentials(&self) -> SessionCredentials {
        self.credentials
    }

    pub fn permissions(&self) -> SessionPermissions {
        self.permissions
    }

    pub fn surface_count(&self) -> usize {
        self.lock().surfaces.len()
    }

    pub fn screencast_count(&self) -> usize {
        self.lock().screencasts.len()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected(&self) -> Result<MutexGuard<'_, SessionState>> {
        let state = self.lock();
        if !state.connected {
            return Err(LumenError::NotConnected);
        }
        Ok(state)
    }

    /// Answer `done` with `buffer` from the executor thread
    fn complete_later(&self, buffer: Arc<ShmBuffer>, done: Completion<Buffer>) {
        self.executor.spawn(move || match buffer.to_message() {
            Ok(message) => done.complete(message),
            Err(e) => done.fail(format!("cannot share buffer {}: {e}", buffer.id())),
        });
    }
}

fn to_dimension(value: u32, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| LumenError::invalid(format!("{what} {value} out of range")))
}

impl DisplayServer for SessionMediator {
    fn connect(&self, params: ConnectParameters, done: Completion<Connection>) -> HandlerResult {
        let mut state = self.lock();
        if state.connected {
            return Err(LumenError::invalid("session is already connected").into());
        }

        let (ours, theirs) = UnixStream::pair()?;
        self.display.subscribe(ours)?;

        state.connected = true;
        state.application_name = params.application_name;
        info!(
            application = %state.application_name,
            pid = self.credentials.pid(),
            "Session connected"
        );
        drop(state);

        done.complete(Connection {
            platform: Some(Platform {
                data: Vec::new(),
                side_channel: SideChannel::with_fds(vec![OwnedFd::from(theirs)]),
            }),
            display_configuration: Some(self.display.configuration()),
            surface_pixel_formats: SUPPORTED_PIXEL_FORMATS.to_vec(),
            error: None,
        });
        Ok(())
    }

    fn create_surface(
        &self,
        params: SurfaceParameters,
        done: Completion<Surface>,
    ) -> HandlerResult {
        let mut state = self.connected()?;

        let buffer_id = state.next_buffer_id + 1;
        let buffer = Arc::new(ShmBuffer::allocate(
            buffer_id,
            params.width,
            params.height,
            params.pixel_format,
        )?);
        let message = buffer.to_message()?;
        let (ours, theirs) = UnixStream::pair()?;
        ours.set_nonblocking(true)?;

        state.next_buffer_id = buffer_id;
        state.next_surface_id += 1;
        let id = state.next_surface_id;
        state.surfaces.insert(
            id,
            SurfaceRecord {
                name: params.surface_name.clone(),
                width: params.width,
                height: params.height,
                pixel_format: params.pixel_format,
                events: ours,
                buffers: vec![buffer.clone()],
                current: 0,
                frames_submitted: 0,
            },
        );
        drop(state);

        debug!(
            surface_id = id,
            name = %params.surface_name,
            width = params.width,
            height = params.height,
            "Surface created"
        );
        done.retain(buffer);
        done.complete(Surface {
            id: Some(SurfaceId { value: id }),
            width: params.width,
            height: params.height,
            pixel_format: params.pixel_format,
            side_channel: SideChannel::with_fds(vec![OwnedFd::from(theirs)]),
            buffer: Some(message),
            error: None,
        });
        Ok(())
    }

    fn next_buffer(&self, params: SurfaceId, done: Completion<Buffer>) -> HandlerResult {
        let buffer = {
            let mut state = self.connected()?;
            let SessionState {
                surfaces,
                next_buffer_id,
                ..
            } = &mut *state;
            let surface = surfaces
                .get_mut(&params.value)
                .ok_or(LumenError::SurfaceNotFound(params.value))?;
            surface.advance(next_buffer_id)?
        };
        trace!(surface_id = params.value, buffer_id = buffer.id(), "Next buffer chosen");
        self.complete_later(buffer, done);
        Ok(())
    }

    fn submit_buffer(&self, params: BufferSubmission, done: Completion<Void>) -> HandlerResult {
        let mut state = self.connected()?;
        let surface_id = params.surface_id.value;
        let surface = state
            .surfaces
            .get_mut(&surface_id)
            .ok_or(LumenError::SurfaceNotFound(surface_id))?;

        let [fd] = params.buffer.side_channel.fds.as_slice() else {
            return Err(
                LumenError::invalid("a submitted buffer carries exactly one descriptor").into(),
            );
        };
        let buffer_id = params.buffer.buffer_id;
        let Some(buffer) = surface.buffers.iter().find(|b| b.id() == buffer_id) else {
            return Err(LumenError::invalid(format!(
                "buffer {buffer_id} does not belong to surface {surface_id}"
            ))
            .into());
        };
        if !buffer.is_backed_by(fd) {
            return Err(LumenError::invalid(format!(
                "descriptor does not refer to buffer {buffer_id}"
            ))
            .into());
        }

        surface.frames_submitted += 1;
        surface.notify_frame();
        trace!(
            surface_id,
            buffer_id,
            frames = surface.frames_submitted,
            "Buffer submitted"
        );
        drop(state);

        done.complete(Void::default());
        Ok(())
    }

    fn release_surface(&self, params: SurfaceId, done: Completion<Void>) -> HandlerResult {
        let released = self
            .connected()?
            .surfaces
            .remove(&params.value)
            .ok_or(LumenError::SurfaceNotFound(params.value))?;
        debug!(
            surface_id = params.value,
            frames = released.frames_submitted,
            "Surface released"
        );
        done.complete(Void::default());
        Ok(())
    }

    fn configure_display(
        &self,
        params: DisplayConfiguration,
        done: Completion<DisplayConfiguration>,
    ) -> HandlerResult {
        drop(self.connected()?);
        if !self.permissions.display_configuration {
            return Err(LumenError::permission("display configuration is not allowed").into());
        }
        done.complete(self.display.apply(&params)?);
        Ok(())
    }

    fn create_screencast(
        &self,
        params: ScreencastParameters,
        done: Completion<Screencast>,
    ) -> HandlerResult {
        let mut state = self.connected()?;
        if !self.permissions.screencast {
            return Err(LumenError::permission("screencast is not allowed").into());
        }
        if params.region.width == 0 || params.region.height == 0 {
            return Err(LumenError::invalid("screencast region is empty").into());
        }

        let buffer_id = state.next_buffer_id + 1;
        let buffer = Arc::new(ShmBuffer::allocate(
            buffer_id,
            to_dimension(params.width, "width")?,
            to_dimension(params.height, "height")?,
            params.pixel_format,
        )?);
        let message = buffer.to_message()?;

        state.next_buffer_id = buffer_id;
        state.next_screencast_id += 1;
        let id = state.next_screencast_id;
        state.screencasts.insert(
            id,
            ScreencastRecord {
                buffer: buffer.clone(),
                frames_captured: 0,
            },
        );
        drop(state);

        debug!(screencast_id = id, region = ?params.region, "Screencast created");
        done.retain(buffer);
        done.complete(Screencast {
            id: Some(ScreencastId { value: id }),
            buffer: Some(message),
            error: None,
        });
        Ok(())
    }

    fn screencast_buffer(&self, params: ScreencastId, done: Completion<Buffer>) -> HandlerResult {
        let buffer = {
            let mut state = self.connected()?;
            let screencast = state
                .screencasts
                .get_mut(&params.value)
                .ok_or(LumenError::ScreencastNotFound(params.value))?;
            screencast.frames_captured += 1;
            screencast.buffer.clone()
        };
        self.complete_later(buffer, done);
        Ok(())
    }

    fn release_screencast(&self, params: ScreencastId, done: Completion<Void>) -> HandlerResult {
        let released = self
            .connected()?
            .screencasts
            .remove(&params.value)
            .ok_or(LumenError::ScreencastNotFound(params.value))?;
        debug!(
            screencast_id = params.value,
            frames = released.frames_captured,
            "Screencast released"
        );
        done.complete(Void::default());
        Ok(())
    }

    fn disconnect(&self, _params: Void, done: Completion<Void>) -> HandlerResult {
        let mut state = self.lock();
        if state.connected {
            info!(
                application = %state.application_name,
                surfaces = state.surfaces.len(),
                screencasts = state.screencasts.len(),
                "Session disconnecting"
            );
        }
        state.connected = false;
        state.surfaces.clear();
        state.screencasts.clear();
        drop(state);

        done.complete(Void::default());
        Ok(())
    }
}
