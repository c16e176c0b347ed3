#![allow(non_snake_case)]

use core::{marker::PhantomData, fmt};

use crate::register::*;

pub type RegisterAddress = u16;
pub type RegisterValue = u16;

/// Maximum number of spans a card can carry (octal cards).
pub const SPANS_MAX: usize = 8;

/// Channels addressable per span, regardless of line mode.
pub const CHANNELS_PER_SPAN: usize = 32;

/// Depth of the HDLC receive and transmit buffer windows.
pub const HDLC_BUFFER_LEN: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The bus transaction did not complete (master abort, surprise
    /// removal, mapping gone).
    Bus,

    /// The address is outside the mapped register window.
    Unmapped(RegisterAddress),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bus => write!(f, "register bus transaction failed"),
            Error::Unmapped(address) => write!(f, "register {address:04x} is not mapped"),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Word-wide access to the card's register window.
///
/// Burst variants walk consecutive addresses. Implementations that can do
/// better than one access per word (posted PCI bursts) override them.
///
pub trait RegisterIo {
    fn read(&self, address: RegisterAddress) -> Result<RegisterValue>;
    fn write(&self, address: RegisterAddress, value: RegisterValue) -> Result<()>;

    fn write_burst(&self, address: RegisterAddress, values: &[RegisterValue]) -> Result<()> {
        for (offset, &value) in values.iter().enumerate() {
            self.write(burst_address(address, offset)?, value)?;
        }
        Ok(())
    }

    fn write_smear(&self, address: RegisterAddress, value: RegisterValue, count: usize) -> Result<()> {
        for offset in 0..count {
            self.write(burst_address(address, offset)?, value)?;
        }
        Ok(())
    }

    fn read_burst(&self, address: RegisterAddress, values: &mut [RegisterValue]) -> Result<()> {
        for (offset, value) in values.iter_mut().enumerate() {
            *value = self.read(burst_address(address, offset)?)?;
        }
        Ok(())
    }
}

fn burst_address(address: RegisterAddress, offset: usize) -> Result<RegisterAddress> {
    let end = address as usize + offset;
    if end > RegisterAddress::MAX as usize {
        return Err(Error::Unmapped(address));
    }
    Ok(end as RegisterAddress)
}

impl<D: RegisterIo + ?Sized> RegisterIo for &D {
    fn read(&self, address: RegisterAddress) -> Result<RegisterValue> {
        (**self).read(address)
    }

    fn write(&self, address: RegisterAddress, value: RegisterValue) -> Result<()> {
        (**self).write(address, value)
    }

    fn write_burst(&self, address: RegisterAddress, values: &[RegisterValue]) -> Result<()> {
        (**self).write_burst(address, values)
    }

    fn write_smear(&self, address: RegisterAddress, value: RegisterValue, count: usize) -> Result<()> {
        (**self).write_smear(address, value, count)
    }

    fn read_burst(&self, address: RegisterAddress, values: &mut [RegisterValue]) -> Result<()> {
        (**self).read_burst(address, values)
    }
}

pub struct Access<'a, D, T>
where D: RegisterIo + ?Sized,
{
    device: &'a D,
    address: usize,
    t: PhantomData<T>,
}

impl<'a, D, T> Access<'a, D, T>
where D: RegisterIo + ?Sized,
{
    fn new(device: &'a D, address: usize) -> Self {
        Self {
            device,
            address,
            t: PhantomData,
        }
    }

    pub fn address(&self) -> RegisterAddress {
        self.address as RegisterAddress
    }
}

impl<D, T> Access<'_, D, T>
where D: RegisterIo + ?Sized,
      T: From<u16>,
{
    fn get_typed(&self, address: usize) -> Result<T> {
        assert!(address < 0x10000);
        Ok(T::from(self.device.read(address as RegisterAddress)?))
    }

    pub fn read(&self) -> Result<T> {
        self.get_typed(self.address)
    }
}

impl<D, T> Access<'_, D, T>
where D: RegisterIo + ?Sized,
      T: From<u16> + Into<u16>,
{
    fn set_typed(&self, address: usize, value: T) -> Result<()> {
        assert!(address < 0x10000);
        self.device.write(address as RegisterAddress, value.into())
    }

    pub fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(T) -> T,
    {
        let value = T::from(0);
        let new_value = f(value);
        self.set_typed(self.address, new_value)
    }

    pub fn modify<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(T) -> T,
    {
        let value = self.read()?;
        let new_value = f(value);
        self.set_typed(self.address, new_value)
    }
}

///////////////////////////////////////////////////////////////////////
// Span

pub struct Span<'a, D>
where D: RegisterIo + ?Sized,
{
    device: &'a D,
    index: usize,
}

impl<'a, D> Span<'a, D>
where D: RegisterIo + ?Sized,
{
    fn new(device: &'a D, index: usize) -> Self {
        assert!(index < SPANS_MAX);

        Self {
            device,
            index,
        }
    }

    fn access<T>(&self, offset: usize) -> Access<'a, D, T> {
        Access::new(self.device, Addressing::span_nxx(self.index, offset))
    }

    fn access_channel<T>(&self, block_offset: usize, channel: usize) -> Access<'a, D, T> {
        Access::new(self.device, Addressing::span_nxx_channel(self.index, block_offset, channel))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> &'a D {
        self.device
    }

    // Framer

    pub fn fmr   (&self) -> Access<'a, D, FMR>   { self.access(0x00) }
    pub fn frsr  (&self) -> Access<'a, D, FRSR>  { self.access(0x01) }
    pub fn fier  (&self) -> Access<'a, D, FIER>  { self.access(0x02) }
    pub fn rscr0 (&self) -> Access<'a, D, RSChR> { self.rscr(0) }
    pub fn rscr1 (&self) -> Access<'a, D, RSChR> { self.rscr(1) }

    pub fn rscr(&self, index: usize) -> Access<'a, D, RSChR> {
        const MAP: [usize; 2] = [0x03, 0x04];
        assert!(index < MAP.len());
        self.access(MAP[index])
    }

    /// Receive signaling change bitmap, channel 0 in bit 0.
    pub fn rscr_bitmap(&self) -> Result<u32> {
        let low = self.rscr0().read()?.CH() as u32;
        let high = self.rscr1().read()?.CH() as u32;
        Ok(low | (high << 16))
    }

    // Robbed-bit signaling

    pub fn rsar(&self, channel: usize) -> Access<'a, D, RSAR> { self.access_channel(0x20, channel) }
    pub fn tscr(&self, channel: usize) -> Access<'a, D, TSCR> { self.access_channel(0x40, channel) }

    // HDLC

    pub fn hcr   (&self) -> Access<'a, D, HCR>   { self.access(0x80) }
    pub fn hsr   (&self) -> Access<'a, D, HSR>   { self.access(0x81) }
    pub fn himr  (&self) -> Access<'a, D, HIMR>  { self.access(0x82) }
    pub fn htsf0 (&self) -> Access<'a, D, HTSF>  { self.htsf(0) }
    pub fn htsf1 (&self) -> Access<'a, D, HTSF>  { self.htsf(1) }
    pub fn hifg  (&self) -> Access<'a, D, HIFG>  { self.access(0x85) }
    pub fn hrbc  (&self) -> Access<'a, D, HRBC>  { self.access(0x86) }
    pub fn hmode (&self) -> Access<'a, D, HMODE> { self.access(0x87) }

    pub fn htsf(&self, index: usize) -> Access<'a, D, HTSF> {
        const MAP: [usize; 2] = [0x83, 0x84];
        assert!(index < MAP.len());
        self.access(MAP[index])
    }

    pub fn hrxbuf(&self, index: usize) -> Access<'a, D, HBUF> {
        assert!(index < HDLC_BUFFER_LEN);
        self.access(0xc0 + index)
    }

    pub fn htxbuf(&self, index: usize) -> Access<'a, D, HBUF> {
        assert!(index < HDLC_BUFFER_LEN);
        self.access(0xe0 + index)
    }
}

pub struct Spans<'a, D>
where D: RegisterIo + ?Sized,
{
    device: &'a D,
    count: usize,
    n: usize,
}

impl<'a, D> Iterator for Spans<'a, D>
where D: RegisterIo + ?Sized,
{
    type Item = Span<'a, D>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.n < self.count {
            let result = Span::new(self.device, self.n);
            self.n += 1;
            Some(result)
        } else {
            None
        }
    }
}

///////////////////////////////////////////////////////////////////////
// Board

/// Typed view of one card's register window.
///
pub struct Board<'a, D>
where D: RegisterIo + ?Sized,
{
    device: &'a D,
}

impl<'a, D> Board<'a, D>
where D: RegisterIo + ?Sized,
{
    pub fn new(device: &'a D) -> Self {
        Self {
            device,
        }
    }

    fn access<T>(&self, offset: usize) -> Access<'a, D, T> {
        Access::new(self.device, Addressing::global(offset))
    }

    pub fn span(&self, index: usize) -> Span<'a, D> {
        Span::new(self.device, index)
    }

    pub fn spans(&self, count: usize) -> Spans<'a, D> {
        assert!(count <= SPANS_MAX);
        Spans {
            device: self.device,
            count,
            n: 0,
        }
    }

    pub fn gsr    (&self) -> Access<'a, D, GSR>     { self.access(0x0000) }
    pub fn gier   (&self) -> Access<'a, D, GIER>    { self.access(0x0001) }
    pub fn fisb   (&self) -> Access<'a, D, FISB>    { self.access(0x0002) }
    pub fn dmacr  (&self) -> Access<'a, D, DMACR>   { self.access(0x0003) }
    pub fn dmarxl (&self) -> Access<'a, D, DMAADDR> { self.access(0x0004) }
    pub fn dmarxh (&self) -> Access<'a, D, DMAADDR> { self.access(0x0005) }
    pub fn dmatxl (&self) -> Access<'a, D, DMAADDR> { self.access(0x0006) }
    pub fn dmatxh (&self) -> Access<'a, D, DMAADDR> { self.access(0x0007) }
    pub fn dmacnt (&self) -> Access<'a, D, DMACNT>  { self.access(0x0008) }
    pub fn dmafsz (&self) -> Access<'a, D, DMAFSZ>  { self.access(0x0009) }
    pub fn scratch(&self) -> Access<'a, D, SCRATCH> { self.access(0x000a) }
    pub fn revid  (&self) -> Access<'a, D, REVID>   { self.access(0x000b) }
    pub fn clksel (&self) -> Access<'a, D, CLKSEL>  { self.access(0x0010) }
    pub fn tsicr  (&self) -> Access<'a, D, TSICR>   { self.access(0x0020) }
    pub fn tsisrc (&self) -> Access<'a, D, TSISLOT> { self.access(0x0021) }
    pub fn tsidst (&self) -> Access<'a, D, TSISLOT> { self.access(0x0022) }

    /// 32-bit receive ring base address, split over DMARXL/DMARXH.
    pub fn dma_rx_base(&self) -> Result<u32> {
        let low = self.dmarxl().read()?.ADDR() as u32;
        let high = self.dmarxh().read()?.ADDR() as u32;
        Ok((high << 16) | low)
    }

    pub fn set_dma_rx_base(&self, base: u32) -> Result<()> {
        self.dmarxl().write(|w| w.with_ADDR(base as u16))?;
        self.dmarxh().write(|w| w.with_ADDR((base >> 16) as u16))
    }

    /// 32-bit transmit ring base address, split over DMATXL/DMATXH.
    pub fn dma_tx_base(&self) -> Result<u32> {
        let low = self.dmatxl().read()?.ADDR() as u32;
        let high = self.dmatxh().read()?.ADDR() as u32;
        Ok((high << 16) | low)
    }

    pub fn set_dma_tx_base(&self, base: u32) -> Result<()> {
        self.dmatxl().write(|w| w.with_ADDR(base as u16))?;
        self.dmatxh().write(|w| w.with_ADDR((base >> 16) as u16))
    }
}

/// Register window addressing abstraction
///
pub struct Addressing {}

impl Addressing {
    /// Size of the register window in words: the global block at 0x0000
    /// followed by one 0x100 word block per span.
    pub const WINDOW_LEN: usize = 0x100 * (SPANS_MAX + 1);

    pub fn global(offset: usize) -> usize {
        assert!(offset < Self::WINDOW_LEN);
        offset
    }

    /// Registers of the form 0xNxx, where span N occupies block N + 1.
    pub fn span_nxx(span: usize, offset: usize) -> usize {
        assert!(span < SPANS_MAX);
        assert!(offset < 0x100);
        Self::global(((span + 1) << 8) | offset)
    }

    /// Registers of the form 0xNxx where offset points to a series of
    /// per-channel registers.
    pub fn span_nxx_channel(span: usize, block_offset: usize, channel: usize) -> usize {
        assert!(block_offset & 0x1f == 0);
        assert!(channel < CHANNELS_PER_SPAN);
        Self::span_nxx(span, block_offset + channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addressing_span_nxx() {
        assert_eq!(Addressing::span_nxx(0, 0x00), 0x0100);
        assert_eq!(Addressing::span_nxx(7, 0x81), 0x0881);
        assert_eq!(Addressing::span_nxx(3, 0xff), 0x04ff);
    }

    #[test]
    #[should_panic(expected="span < SPANS_MAX")]
    fn addressing_span_nxx_bad_span_index() {
        let _ = Addressing::span_nxx(8, 0x00);
    }

    #[test]
    #[should_panic(expected="offset < 0x100")]
    fn addressing_span_nxx_bad_offset() {
        let _ = Addressing::span_nxx(0, 0x100);
    }

    #[test]
    fn addressing_span_nxx_channel() {
        assert_eq!(Addressing::span_nxx_channel(0, 0x20,  0), 0x0120);
        assert_eq!(Addressing::span_nxx_channel(0, 0x40, 31), 0x015f);
        assert_eq!(Addressing::span_nxx_channel(7, 0x20, 23), 0x0837);
    }

    #[test]
    #[should_panic(expected="channel < CHANNELS_PER_SPAN")]
    fn addressing_span_nxx_channel_bad_channel() {
        let _ = Addressing::span_nxx_channel(0, 0x20, 32);
    }

    #[test]
    #[should_panic(expected="block_offset & 0x1f == 0")]
    fn addressing_span_nxx_channel_bad_offset() {
        let _ = Addressing::span_nxx_channel(0, 0x21, 0);
    }

    #[test]
    fn addressing_global() {
        assert_eq!(Addressing::global(0x0000), 0x0000);
        assert_eq!(Addressing::global(0x08ff), 0x08ff);
    }

    #[test]
    #[should_panic(expected="offset < Self::WINDOW_LEN")]
    fn addressing_global_bad_offset() {
        let _ = Addressing::global(0x0900);
    }
}
