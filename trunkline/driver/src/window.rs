use std::sync::{Mutex, MutexGuard, PoisonError};

use trunkline_pac::device::{Board, RegisterAddress, RegisterIo, RegisterValue};
use trunkline_pac::register::{DMACR, FMR};

use crate::error::Result;

/// A card's register window behind its exclusion lock.
///
/// Every multi-step register sequence goes through [`exclusive`], so a
/// read-modify-write from one context never interleaves with another
/// context's access to the same card.
///
/// [`exclusive`]: RegisterWindow::exclusive
///
pub struct RegisterWindow<W> {
    io: Mutex<W>,
}

impl<W: RegisterIo> RegisterWindow<W> {
    pub fn new(io: W) -> Self {
        Self {
            io: Mutex::new(io),
        }
    }

    fn lock(&self) -> MutexGuard<'_, W> {
        // A panic mid-sequence leaves the hardware in whatever state it
        // reached; the registers themselves are still usable.
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exclusive<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&W) -> R,
    {
        let io = self.lock();
        f(&io)
    }

    /// Like [`exclusive`](Self::exclusive), with the typed register view.
    pub fn board<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Board<'_, W>) -> R,
    {
        let io = self.lock();
        f(&Board::new(&*io))
    }

    pub fn read(&self, address: RegisterAddress) -> Result<RegisterValue> {
        Ok(self.lock().read(address)?)
    }

    pub fn write(&self, address: RegisterAddress, value: RegisterValue) -> Result<()> {
        Ok(self.lock().write(address, value)?)
    }

    pub fn framer_modify<F>(&self, span: usize, f: F) -> Result<()>
    where
        F: FnOnce(FMR) -> FMR,
    {
        self.board(|board| Ok(board.span(span).fmr().modify(f)?))
    }

    pub fn dma_modify<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(DMACR) -> DMACR,
    {
        self.board(|board| Ok(board.dmacr().modify(f)?))
    }

    pub fn into_inner(self) -> W {
        self.io.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::MemoryWindow;
    use trunkline_pac::register::LineMode;

    #[test]
    fn framer_modify_preserves_other_fields() {
        let memory = MemoryWindow::new();
        let window = RegisterWindow::new(memory.clone());

        window.board(|b| b.span(2).fmr().write(|w| w.with_MODE(LineMode::E1).with_TX_ENB(1))).unwrap();
        window.framer_modify(2, |m| m.with_FORCE_LOS(1)).unwrap();

        let fmr = window.board(|b| b.span(2).fmr().read()).unwrap();
        assert_eq!(fmr.MODE(), LineMode::E1);
        assert_eq!(fmr.TX_ENB(), 1);
        assert_eq!(fmr.FORCE_LOS(), 1);
    }

    #[test]
    fn dma_modify_is_one_read_and_one_write() {
        let memory = MemoryWindow::new();
        let window = RegisterWindow::new(memory.clone());

        window.dma_modify(|m| m.with_RUN(1)).unwrap();

        let journal = memory.take_journal();
        assert_eq!(journal, vec![(0x0003, 0x8000)]);
    }
}
