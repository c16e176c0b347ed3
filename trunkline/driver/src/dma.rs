use log::{debug, info, warn};

use trunkline_pac::device::{RegisterIo, CHANNELS_PER_SPAN};

use crate::error::{Error, Result};
use crate::window::RegisterWindow;

/// Samples per channel in one DMA frame (one millisecond tick).
pub const CHUNK: usize = 8;

/// The receive identity is a free-running 7-bit counter.
pub const IDENT_MODULUS: usize = 128;

/// Deepest ring the identity counter can tell apart.
pub const DEPTH_MAX: usize = IDENT_MODULUS - 1;

/// Bytes in one frame: `CHUNK` samples, each holding 32 timeslots for every
/// span.
pub const fn frame_size(spans: usize) -> usize {
    CHUNK * spans * CHANNELS_PER_SPAN
}

/// A region of DMA-visible memory.
#[derive(Debug)]
pub struct DmaRegion {
    bus_address: u32,
    memory: Vec<u8>,
}

impl DmaRegion {
    pub fn new(bus_address: u32, memory: Vec<u8>) -> Self {
        Self {
            bus_address,
            memory,
        }
    }

    pub fn bus_address(&self) -> u32 {
        self.bus_address
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

pub trait DmaAllocator: Send {
    fn allocate(&mut self, len: usize) -> Result<DmaRegion>;
    fn free(&mut self, region: DmaRegion);
}

/// Heap-backed allocator handing out synthetic, page-aligned bus addresses.
/// Used by simulated cards.
#[derive(Debug)]
pub struct HeapAllocator {
    next_bus_address: u32,
    limit: usize,
    outstanding: usize,
}

impl HeapAllocator {
    const PAGE: u32 = 0x1000;

    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Fail any allocation that would take more than `limit` bytes in use.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            next_bus_address: 0x1000_0000,
            limit,
            outstanding: 0,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HeapAllocator {
    fn allocate(&mut self, len: usize) -> Result<DmaRegion> {
        if self.outstanding.saturating_add(len) > self.limit {
            return Err(Error::Allocation(len));
        }
        let pages = u32::try_from(len).map_err(|_| Error::Allocation(len))? / Self::PAGE + 1;
        let bus_address = self.next_bus_address;
        self.next_bus_address = self.next_bus_address.wrapping_add(pages * Self::PAGE);
        self.outstanding += len;
        Ok(DmaRegion::new(bus_address, vec![0xff; len]))
    }

    fn free(&mut self, region: DmaRegion) {
        self.outstanding = self.outstanding.saturating_sub(region.len());
    }
}

///////////////////////////////////////////////////////////////////////

/// What one DMA tick did to the ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// The identity advanced by the per-interrupt amount.
    Normal,

    /// The identity advanced by some other amount within the ring depth.
    /// Every intervening frame was fanned out in order.
    Coalesced { frames: usize },

    /// The identity did not move.
    Spurious,

    /// The identity moved further than the ring is deep. Frames were lost
    /// and a deeper ring is wanted.
    Shortfall { missed: usize, needed: usize },

    /// As `Shortfall`, but the ring is already at its maximum depth.
    Overrun { missed: usize },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DmaCounters {
    pub missed_interrupts: u64,
    pub lossy_ticks: u64,
    pub latency_changes: u64,
    pub spurious: u64,
    pub coalesced: u64,
}

/// The card's receive/transmit frame ring and its identity tracking.
///
/// The region holds `depth` receive frames followed by `depth` transmit
/// frames. After an install the hardware fills receive frames in ring
/// order starting at frame 0, draining the transmit frame at the same index,
/// and bumps the receive identity once per frame. The ring keeps its own
/// cursor since the depth need not divide the identity modulus.
///
pub struct DmaRing {
    spans: usize,
    depth: usize,
    max_depth: usize,
    advance: usize,
    last_ident: Option<usize>,
    cursor: usize,
    pending_depth: Option<usize>,
    region: Option<DmaRegion>,
    counters: DmaCounters,
}

impl DmaRing {
    pub fn new(spans: usize, max_depth: usize, advance: usize) -> Self {
        assert!(spans > 0 && spans <= trunkline_pac::device::SPANS_MAX);

        Self {
            spans,
            depth: 0,
            max_depth: max_depth.min(DEPTH_MAX),
            advance: advance.max(1),
            last_ident: None,
            cursor: 0,
            pending_depth: None,
            region: None,
            counters: DmaCounters::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn frame_size(&self) -> usize {
        frame_size(self.spans)
    }

    pub fn counters(&self) -> DmaCounters {
        self.counters
    }

    pub fn pending_depth(&self) -> Option<usize> {
        self.pending_depth
    }

    pub fn region(&self) -> Option<&DmaRegion> {
        self.region.as_ref()
    }

    /// Allocate a ring of `depth` frames, point the hardware at it, and
    /// free the previous ring once the hardware reads back the new layout.
    ///
    /// The engine must be stopped. On failure the previous ring stays
    /// installed.
    ///
    pub fn install_buffers<W: RegisterIo>(
        &mut self,
        depth: usize,
        window: &RegisterWindow<W>,
        allocator: &mut dyn DmaAllocator,
    ) -> Result<()> {
        if depth == 0 || depth > DEPTH_MAX {
            return Err(Error::Config(format!("ring depth {depth} not in 1..={DEPTH_MAX}")));
        }

        let frame_size = self.frame_size();
        let region = allocator.allocate(2 * depth * frame_size)?;
        let rx_base = region.bus_address();
        let tx_base = rx_base.wrapping_add((depth * frame_size) as u32);

        let programmed = window.board(|board| -> Result<()> {
            board.set_dma_rx_base(rx_base)?;
            board.set_dma_tx_base(tx_base)?;
            board.dmacnt().write(|w| w.with_FRAMES(depth as u8))?;
            board.dmafsz().write(|w| w.with_SIZE(frame_size as u16))?;

            let checks = [
                (board.dmarxl().address(), rx_base, board.dma_rx_base()?),
                (board.dmatxl().address(), tx_base, board.dma_tx_base()?),
                (board.dmacnt().address(), depth as u32, board.dmacnt().read()?.FRAMES() as u32),
                (board.dmafsz().address(), frame_size as u32, board.dmafsz().read()?.SIZE() as u32),
            ];
            for (address, wrote, read) in checks {
                if wrote != read {
                    return Err(Error::SelfTest {
                        address,
                        wrote: wrote as u16,
                        read: read as u16,
                    });
                }
            }
            Ok(())
        });

        if let Err(e) = programmed {
            allocator.free(region);
            if let Some(old) = &self.region {
                let old_base = old.bus_address();
                let old_depth = self.depth;
                let restored = window.board(|board| -> Result<()> {
                    board.set_dma_rx_base(old_base)?;
                    board.set_dma_tx_base(old_base.wrapping_add((old_depth * frame_size) as u32))?;
                    board.dmacnt().write(|w| w.with_FRAMES(old_depth as u8))?;
                    Ok(())
                });
                if let Err(restore_error) = restored {
                    warn!("dma: restoring previous ring failed: {restore_error}");
                }
            }
            return Err(e);
        }

        if let Some(old) = self.region.replace(region) {
            allocator.free(old);
        }
        self.depth = depth;
        self.last_ident = None;
        self.cursor = 0;
        debug!("dma: installed {depth} frames of {frame_size} bytes at {rx_base:08x}");
        Ok(())
    }

    /// Give back the ring. The engine must be stopped.
    pub fn release_buffers(&mut self, allocator: &mut dyn DmaAllocator) {
        if let Some(region) = self.region.take() {
            allocator.free(region);
        }
        self.depth = 0;
        self.last_ident = None;
        self.cursor = 0;
        self.pending_depth = None;
    }

    /// Account for one DMA tick reporting receive identity `observed`.
    ///
    /// `fanout` is called with the frame index, receive frame and transmit
    /// frame for every frame the hardware completed since the last tick, in
    /// ring order.
    ///
    pub fn on_tick<F>(&mut self, observed: u8, mut fanout: F) -> TickOutcome
    where
        F: FnMut(usize, &[u8], &mut [u8]),
    {
        let observed = observed as usize % IDENT_MODULUS;

        let last = match self.last_ident.replace(observed) {
            Some(last) => last,
            None => {
                self.fan_out(0, &mut fanout);
                self.step(1);
                return TickOutcome::Normal;
            },
        };

        let advance = (observed + IDENT_MODULUS - last) % IDENT_MODULUS;

        if advance == 0 {
            self.counters.spurious += 1;
            return TickOutcome::Spurious;
        }

        if advance <= self.depth {
            for frame in 0..advance {
                self.fan_out(frame, &mut fanout);
            }
            self.step(advance);
            if advance == self.advance {
                return TickOutcome::Normal;
            }
            self.counters.coalesced += 1;
            return TickOutcome::Coalesced { frames: advance };
        }

        let missed = advance.saturating_sub(self.advance);
        self.counters.missed_interrupts += 1;
        self.fan_out(advance - 1, &mut fanout);
        self.step(advance);

        if self.depth >= self.max_depth {
            self.counters.lossy_ticks += 1;
            warn!("dma: {missed} ticks lost at maximum depth {}", self.depth);
            return TickOutcome::Overrun { missed };
        }

        let needed = advance + 1;
        if self.pending_depth.is_none() {
            let requested = if needed > self.max_depth {
                warn!("dma: need depth {needed}, limited to {}", self.max_depth);
                self.max_depth
            } else {
                needed
            };
            debug!("dma: {missed} ticks missed, requesting depth {requested}");
            self.pending_depth = Some(requested);
        }

        TickOutcome::Shortfall { missed, needed }
    }

    fn step(&mut self, frames: usize) {
        if self.depth != 0 {
            self.cursor = (self.cursor + frames) % self.depth;
        }
    }

    /// Hand out the frame `offset` places past the cursor.
    fn fan_out<F>(&mut self, offset: usize, fanout: &mut F)
    where
        F: FnMut(usize, &[u8], &mut [u8]),
    {
        let Some(region) = self.region.as_mut() else {
            return;
        };
        if self.depth == 0 {
            return;
        }

        let frame_size = frame_size(self.spans);
        let index = (self.cursor + offset) % self.depth;
        let (rx, tx) = region.memory.split_at_mut(self.depth * frame_size);
        let rx = &rx[index * frame_size..(index + 1) * frame_size];
        let tx = &mut tx[index * frame_size..(index + 1) * frame_size];
        fanout(index, rx, tx);
    }

    /// Deepen the ring to `new_depth`: stop the engine, swap buffers,
    /// restart. Deferred context only.
    ///
    /// Returns the depth actually installed. Requests above the configured
    /// maximum are truncated to it.
    ///
    pub fn request_latency_increase<W: RegisterIo>(
        &mut self,
        new_depth: usize,
        window: &RegisterWindow<W>,
        allocator: &mut dyn DmaAllocator,
    ) -> Result<usize> {
        self.pending_depth = None;

        let target = if new_depth > self.max_depth {
            warn!("dma: latency {new_depth} above maximum, using {}", self.max_depth);
            self.max_depth
        } else {
            new_depth
        };

        if target <= self.depth {
            return Ok(self.depth);
        }

        window.dma_modify(|m| m.with_RUN(0))?;
        let installed = self.install_buffers(target, window, allocator);
        window.dma_modify(|m| m.with_RUN(1))?;
        installed?;

        self.counters.latency_changes += 1;
        info!("dma: latency now {target} ms");
        Ok(target)
    }
}
