// The physical 18-bit address space: 128 KiW of RAM below 760000 and the
// I/O page above it. Word access only at this level; byte access is a
// read-modify-write of the containing word for device space and direct
// indexing for RAM.

use crate::interrupts::{InterruptQueue, Trap, INT_BUS};
use crate::mmu::Mmu;
use crate::rk05::Rk05;
use crate::terminal::Terminal;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

pub const MEMORY_WORDS: usize = 128 * 1024;

pub struct Bus {
    pub mem: Vec<u16>,
    pub mmu: Mmu,
    pub cons: Terminal,
    pub rk: Rk05,
    pub lks: Arc<AtomicU16>,
    pub intq: InterruptQueue,
}

impl Bus {
    pub fn new(cons: Terminal, rk: Rk05, lks: Arc<AtomicU16>, intq: InterruptQueue) -> Bus {
        Bus { mem: vec![0; MEMORY_WORDS], mmu: Mmu::new(), cons, rk, lks, intq }
    }

    // The PSW at 777776 never reaches the bus; the CPU intercepts it to run
    // the mode switch.
    pub fn read16(&self, a: u32) -> Result<u16, Trap> {
        if a & 1 != 0 {
            return Err(Trap::new(INT_BUS, format!("read from odd address {:06o}", a)));
        }
        if a < 0o760000 {
            return Ok(self.mem[(a >> 1) as usize]);
        }
        match a {
            0o777546 => Ok(self.lks.load(Ordering::SeqCst)),
            0o777570 => Ok(0o173030), // console switch register
            0o777572 => Ok(self.mmu.sr0),
            0o777576 => Ok(self.mmu.sr2),
            _ if a & 0o777770 == 0o777560 => Ok(self.cons.read16(a)),
            _ if (0o777400..=0o777412).contains(&a) => Ok(self.rk.read16(a)),
            0o777776 => Err(Trap::new(INT_BUS, "PSW is CPU-resident".to_string())),
            _ if a & 0o777600 == 0o772200 || a & 0o777600 == 0o777600 => self.mmu.read16(a),
            _ => Err(Trap::new(INT_BUS, format!("read from invalid address {:06o}", a))),
        }
    }

    pub fn write16(&mut self, a: u32, v: u16) -> Result<(), Trap> {
        if a & 1 != 0 {
            return Err(Trap::new(INT_BUS, format!("write to odd address {:06o}", a)));
        }
        if a < 0o760000 {
            self.mem[(a >> 1) as usize] = v;
            return Ok(());
        }
        match a {
            0o777546 => {
                self.lks.store(v, Ordering::SeqCst);
                Ok(())
            }
            0o777572 => {
                self.mmu.sr0 = v;
                Ok(())
            }
            _ if a & 0o777770 == 0o777560 => {
                self.cons.write16(a, v);
                Ok(())
            }
            _ if (0o777400..=0o777412).contains(&a) => {
                let Bus { rk, mem, .. } = self;
                rk.write16(a, v, mem);
                Ok(())
            }
            0o777776 => Err(Trap::new(INT_BUS, "PSW is CPU-resident".to_string())),
            _ if a & 0o777600 == 0o772200 || a & 0o777600 == 0o777600 => {
                self.mmu.write16(a, v);
                Ok(())
            }
            _ => Err(Trap::new(INT_BUS, format!("write to invalid address {:06o}", a))),
        }
    }

    pub fn read8(&self, a: u32) -> Result<u16, Trap> {
        let val = self.read16(a & !1)?;
        Ok(if a & 1 != 0 { val >> 8 } else { val & 0xFF })
    }

    pub fn write8(&mut self, a: u32, v: u16) -> Result<(), Trap> {
        if a < 0o760000 {
            let w = (a >> 1) as usize;
            if a & 1 != 0 {
                self.mem[w] = (self.mem[w] & 0xFF) | ((v & 0xFF) << 8);
            } else {
                self.mem[w] = (self.mem[w] & 0xFF00) | (v & 0xFF);
            }
            Ok(())
        } else if a & 1 != 0 {
            let old = self.read16(a & !1)?;
            self.write16(a & !1, (old & 0xFF) | ((v & 0xFF) << 8))
        } else {
            let old = self.read16(a & !1)?;
            self.write16(a & !1, (old & 0xFF00) | (v & 0xFF))
        }
    }
}
