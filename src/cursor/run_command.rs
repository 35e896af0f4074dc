//! Cursor over the reply of a cursor-returning command.

use super::base::CursorCore;
use super::{Replay, ShellCursor};
use crate::error::ShellResult;
use crate::provider::NativeCursor;
use crate::reconstruct::{ChainStep, ConstructionRecord};
use crate::session::SessionRef;

const CLASS: &str = "RunCommandCursor";

pub struct RunCommandCursor {
    core: CursorCore<dyn NativeCursor>,
}

impl_cursor_object!(RunCommandCursor, CLASS);

impl ShellCursor for RunCommandCursor {
    type Native = dyn NativeCursor;

    fn core(&self) -> &CursorCore<dyn NativeCursor> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut CursorCore<dyn NativeCursor> {
        &mut self.core
    }
}

impl RunCommandCursor {
    pub fn new(
        native: Box<dyn NativeCursor>,
        record: ConstructionRecord,
        session: Option<SessionRef>,
    ) -> Self {
        Self {
            core: CursorCore::new(native, record, session),
        }
    }
}

impl Replay for RunCommandCursor {
    fn replay_step(&mut self, step: &ChainStep) -> ShellResult<()> {
        self.replay_common(step)
    }
}
