use super::DisconnectedState;
use crate::core::Result;
use crate::storage::LiveSession;
use std::ops::{Deref, DerefMut};
use tracing::{Level, event};

/// Keeps a session attached for its lifetime; detaches on drop.
///
/// Dropping the scope while a local transaction is open cannot detach; the
/// session then stays attached and a warning is logged.
pub struct AttachScope<'a> {
    state: &'a mut DisconnectedState,
    active: bool,
}

impl<'a> AttachScope<'a> {
    pub(super) fn new(state: &'a mut DisconnectedState) -> Self {
        Self {
            state,
            active: true,
        }
    }

    /// Detaches now and hands the session back.
    pub fn detach(mut self) -> Result<Box<dyn LiveSession>> {
        let session = self.state.detach()?;
        self.active = false;
        Ok(session)
    }
}

impl Deref for AttachScope<'_> {
    type Target = DisconnectedState;

    fn deref(&self) -> &DisconnectedState {
        self.state
    }
}

impl DerefMut for AttachScope<'_> {
    fn deref_mut(&mut self) -> &mut DisconnectedState {
        self.state
    }
}

impl Drop for AttachScope<'_> {
    fn drop(&mut self) {
        if !self.active || !self.state.is_attached() {
            return;
        }
        if let Err(err) = self.state.detach() {
            event!(Level::WARN, error = %err, "attach scope dropped, session stays attached");
        }
    }
}

/// Keeps reads falling through to the live source for its lifetime.
pub struct ConnectScope<'a> {
    state: &'a mut DisconnectedState,
    active: bool,
}

impl<'a> ConnectScope<'a> {
    pub(super) fn new(state: &'a mut DisconnectedState) -> Self {
        Self {
            state,
            active: true,
        }
    }

    /// Disconnects now, committing the chained local transaction.
    pub fn disconnect(mut self) -> Result<()> {
        self.state.disconnect()?;
        self.active = false;
        Ok(())
    }
}

impl Deref for ConnectScope<'_> {
    type Target = DisconnectedState;

    fn deref(&self) -> &DisconnectedState {
        self.state
    }
}

impl DerefMut for ConnectScope<'_> {
    fn deref_mut(&mut self) -> &mut DisconnectedState {
        self.state
    }
}

impl Drop for ConnectScope<'_> {
    fn drop(&mut self) {
        if !self.active || !self.state.is_connected() {
            return;
        }
        if let Err(err) = self.state.disconnect() {
            event!(Level::WARN, error = %err, "connect scope dropped with uncommitted local changes");
        }
    }
}
