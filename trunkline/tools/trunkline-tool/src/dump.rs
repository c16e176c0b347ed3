use console::{style, Color};

use trunkline_pac::device::{Addressing, Board, RegisterAddress, RegisterIo, Result, Span};

pub fn registers_dump_raw<D: RegisterIo>(device: &D) -> Result<()> {
    for address in 0..Addressing::WINDOW_LEN {
        let value = device.read(address as RegisterAddress)?;
        if address % 16 == 0 {
            print!("{address:04x}:");
        }
        print!(" {value:04x}");
        if address % 16 == 15 {
            println!();
        }
    }

    Ok(())
}

pub fn registers_dump_global<D: RegisterIo>(board: &Board<D>) -> Result<()> {
    let revid = board.revid().read()?;
    println!("Card\tGEN={}, PORTS={}, REV=0x{:02x}", revid.GEN(), revid.PORTS(), revid.REV());

    println!("Global\t{:?}", board.gsr    ().read()?);
    println!("\t{:?}",       board.gier   ().read()?);
    println!("\t{:?}",       board.fisb   ().read()?);
    println!("DMA\t{:?}",    board.dmacr  ().read()?);
    println!("\tRX=0x{:08x} TX=0x{:08x}", board.dma_rx_base()?, board.dma_tx_base()?);
    println!("\t{:?}",       board.dmacnt ().read()?);
    println!("\t{:?}",       board.dmafsz ().read()?);
    println!("Clock\t{:?}",  board.clksel ().read()?);
    println!("TSI\t{:?}",    board.tsicr  ().read()?);
    println!("\t{:?}",       board.tsisrc ().read()?);
    println!("\t{:?}",       board.tsidst ().read()?);

    Ok(())
}

pub fn registers_dump_span<D: RegisterIo>(span: &Span<D>) -> Result<()> {
    let color = |v| if v != 0 { Color::Red } else { Color::Green };

    let frsr = span.frsr().read()?;
    println!("SPAN {} [{}][{}][{}][{}]",
        span.index(),
        style("LOS").fg(color(frsr.LOS())),
        style("LFA").fg(color(frsr.LFA())),
        style("AIS").fg(color(frsr.AIS())),
        style("RAI").fg(color(frsr.RAI())),
    );
    println!("\t{:?}", span.fmr  ().read()?);
    println!("\t{:?}", frsr);
    println!("\t{:?}", span.fier ().read()?);
    println!("\tRSCR=0x{:08x}", span.rscr_bitmap()?);

    println!("\tHDLC\t{:?}", span.hmode().read()?);
    println!("\t\t{:?}",     span.hsr  ().read()?);
    println!("\t\t{:?}",     span.himr ().read()?);
    println!("\t\t{:?}",     span.hrbc ().read()?);

    print!("\tRSAR");
    for channel in 0..trunkline_pac::device::CHANNELS_PER_SPAN {
        if channel % 8 == 0 {
            print!("\n\t  {channel:02}:");
        }
        print!(" {:04b}", span.rsar(channel).read()?.ABCD());
    }
    println!();

    Ok(())
}

pub fn registers_dump_debug<D: RegisterIo>(board: &Board<D>, spans: usize) -> Result<()> {
    registers_dump_global(board)?;

    for span in board.spans(spans) {
        registers_dump_span(&span)?;
    }

    Ok(())
}
