// Console input and output, to the uart.
// Reads are one line at a time.
// Implements special input characters:
//   newline -- end of line
//   control-h -- backspace
//   control-u -- kill line
//   control-d -- end of file
//   control-p -- print process list

use crate::file::{Device, Major, DEVSW};
use crate::proc::{procdump, CopyInOut, Process, CPUS, PROCS};
use crate::spinlock::Mutex;
use crate::uart;
use crate::vm::VirtAddr;
use core::num::Wrapping;

pub static CONS: Mutex<Cons> = Mutex::new(Cons::new(), "cons");

const BS: u8 = 0x08;

// Control-x
const fn ctrl(x: u8) -> u8 {
    x - b'@'
}

const INPUT_BUF: usize = 128;

pub struct Cons {
    buf: [u8; INPUT_BUF],
    r: Wrapping<usize>, // Read index
    w: Wrapping<usize>, // Write index
    e: Wrapping<usize>, // Edit index
}

impl Cons {
    const fn new() -> Cons {
        Cons {
            buf: [0; INPUT_BUF],
            r: Wrapping(0),
            w: Wrapping(0),
            e: Wrapping(0),
        }
    }
}

impl Device for Mutex<Cons> {
    //
    // user read()s from the console go here.
    // copy (up to) a whole input line to dst.
    //
    fn read(&self, mut dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let p = CPUS.my_proc().unwrap();
        let mut cons = self.lock();
        let target = n;
        let mut left = n;

        while left > 0 {
            // wait until interrupt handler has put some
            // input into cons.buf.
            while cons.r == cons.w {
                if p.killed() {
                    return Err(());
                }
                cons = p.sleep(&cons.r as *const _ as usize, cons);
            }

            let c = cons.buf[cons.r.0 % INPUT_BUF];
            cons.r += Wrapping(1);

            if c == ctrl(b'D') {
                // end-of-file
                if left < target {
                    // Save ^D for next time, to make sure
                    // caller gets a 0-byte result.
                    cons.r -= Wrapping(1);
                }
                break;
            }

            // copy the input byte to the user-space buffer.
            if unsafe { p.either_copyout(dst, &c) }.is_err() {
                break;
            }

            dst += 1;
            left -= 1;

            if c == b'\n' {
                // a whole line has arrived, return to
                // the user-level read().
                break;
            }
        }

        Ok(target - left)
    }

    //
    // user write()s to the console go here.
    //
    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        for i in 0..n {
            let mut c: u8 = 0;
            if unsafe { CPUS.my_proc().unwrap().either_copyin(&mut c, src + i) }.is_err() {
                return Ok(i);
            }
            putc(c);
        }
        Ok(n)
    }

    fn major(&self) -> Major {
        Major::Console
    }
}

impl Mutex<Cons> {
    //
    // the console input interrupt handler.
    // UART.intr() calls this for each input character.
    // do erase/kill processing, append to cons.buf,
    // wake up read() if a whole line has arrived.
    //
    pub fn intr(&self, c: u8) {
        let mut cons = self.lock();
        match c {
            // Print process list.
            m if m == ctrl(b'P') => procdump(),
            // Kill line.
            m if m == ctrl(b'U') => {
                while cons.e != cons.w
                    && cons.buf[(cons.e - Wrapping(1)).0 % INPUT_BUF] != b'\n'
                {
                    cons.e -= Wrapping(1);
                    putc(ctrl(b'H'));
                }
            }
            // Backspace or delete key.
            m if m == ctrl(b'H') || m == b'\x7f' => {
                if cons.e != cons.w {
                    cons.e -= Wrapping(1);
                    putc(ctrl(b'H'));
                }
            }
            _ => {
                if c != 0 && (cons.e - cons.r).0 < INPUT_BUF {
                    let c = if c == b'\r' { b'\n' } else { c };

                    // echo back to the user.
                    putc(c);

                    // store for consumption by read().
                    let e_idx = cons.e.0 % INPUT_BUF;
                    cons.buf[e_idx] = c;
                    cons.e += Wrapping(1);

                    if c == b'\n' || c == ctrl(b'D') || (cons.e - cons.r).0 == INPUT_BUF {
                        // wake up read() if a whole line (or
                        // end-of-file) has arrived.
                        cons.w = cons.e;
                        PROCS.wakeup(&cons.r as *const _ as usize);
                    }
                }
            }
        }
    }
}

pub fn init() {
    unsafe { uart::init() }

    // connect console reads and writes to the device table.
    DEVSW.set(Major::Console, &CONS).unwrap();
}

//
// send one character to the uart.
// called by printf(), and to echo input characters,
// but not from write().
//
pub fn putc(c: u8) {
    if c == ctrl(b'H') {
        // the user typed backspace; overwrite with a space.
        uart::putc_sync(BS);
        uart::putc_sync(b' ');
        uart::putc_sync(BS);
    } else {
        uart::putc_sync(c);
    }
}
