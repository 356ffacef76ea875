// low-level driver routines for the 16550a UART.

use crate::console;
use crate::memlayout::UART0;
use crate::proc::CPUS;

pub static UART: Uart = Uart;

// the UART control registers, mapped at address UART0.
// some have different meanings for read vs write.
// http://byterunner.com/16550.html
const RHR: usize = 0; // receive holding register (for input bytes)
const THR: usize = 0; // transmit holding register (for output bytes)
const IER: usize = 1; // interrupt enable register
const FCR: usize = 2; // FIFO control register
const LCR: usize = 3; // line control register
const LSR: usize = 5; // line status register

const IER_RX_ENABLE: u8 = 1 << 0;
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const FCR_FIFO_CLEAR: u8 = 3 << 1; // clear the content of the two FIFOs
const LCR_EIGHT_BITS: u8 = 3;
const LCR_BAUD_LATCH: u8 = 1 << 7; // special mode to set baud rate
const LSR_RX_READY: u8 = 1 << 0; // input is waiting to be read from RHR
const LSR_TX_IDLE: u8 = 1 << 5; // THR can accept another character to send

fn read_reg(reg: usize) -> u8 {
    unsafe { ((UART0 + reg) as *const u8).read_volatile() }
}

fn write_reg(reg: usize, data: u8) {
    unsafe { ((UART0 + reg) as *mut u8).write_volatile(data) }
}

pub struct Uart;

impl Uart {
    // read one input character from the UART, if any.
    fn getc(&self) -> Option<u8> {
        if read_reg(LSR) & LSR_RX_READY != 0 {
            Some(read_reg(RHR))
        } else {
            None
        }
    }

    // handle a uart interrupt: the device is telling us
    // input has arrived. called from trap.rs.
    pub fn intr(&self) {
        while let Some(c) = self.getc() {
            console::CONS.intr(c);
        }
    }
}

pub unsafe fn init() {
    // disable interrupts.
    write_reg(IER, 0x00);

    // special mode to set baud rate.
    write_reg(LCR, LCR_BAUD_LATCH);

    // LSB for baud rate of 38.4K.
    write_reg(THR, 0x03);

    // MSB for baud rate of 38.4K.
    write_reg(IER, 0x00);

    // leave set-baud mode,
    // and set word length to 8 bits, no parity.
    write_reg(LCR, LCR_EIGHT_BITS);

    // reset and enable FIFOs.
    write_reg(FCR, FCR_FIFO_ENABLE | FCR_FIFO_CLEAR);

    // enable receive interrupts.
    write_reg(IER, IER_RX_ENABLE);
}

// write one character to the uart, polling for space.
// used by the printer and to echo console input; it spins
// rather than sleeping, so it also works from interrupt
// handlers and the panic path.
pub fn putc_sync(c: u8) {
    let _intr_lock = CPUS.intr_lock();

    // wait for Transmit Holding Empty to be set in LSR.
    while read_reg(LSR) & LSR_TX_IDLE == 0 {}
    write_reg(THR, c);
}
