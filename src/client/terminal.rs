use crossterm::terminal;

use crate::error::{MuxError, Result};

/// Puts the terminal into raw mode for the lifetime of the guard; restored
/// on drop, including on error paths.
pub struct RawModeGuard {
    engaged: bool,
}

impl RawModeGuard {
    pub fn engage() -> Result<Self> {
        terminal::enable_raw_mode()
            .map_err(|e| MuxError::System(format!("enabling raw mode: {e}")))?;
        Ok(RawModeGuard { engaged: true })
    }

    pub fn disengage(&mut self) {
        if self.engaged {
            let _ = terminal::disable_raw_mode();
            self.engaged = false;
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.disengage();
    }
}

/// Current terminal dimensions as `(rows, cols)`.
pub fn window_size() -> Result<(u16, u16)> {
    let (cols, rows) =
        terminal::size().map_err(|e| MuxError::System(format!("querying terminal size: {e}")))?;
    Ok((rows, cols))
}
