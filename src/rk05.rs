// RK05 cartridge disk: seven registers at 777400..777412, one drive,
// 203 cylinders x 2 surfaces x 12 sectors x 512 bytes.

use crate::interrupts::{InterruptQueue, INT_RK};
use log::warn;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub const EXPECTED_IMAGE_LENGTH: usize = 2_077_696;

// Error bits in RKER
pub const RKOVR: u16 = 1 << 14;
pub const RKNXD: u16 = 1 << 7;
pub const RKNXC: u16 = 1 << 6;
pub const RKNXS: u16 = 1 << 5;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("unexpected image length {got} != {want}")]
    BadLength { got: usize, want: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Rk05 {
    pub ds: u16,
    pub er: u16,
    pub cs: u16,
    pub wc: u16,
    pub ba: u32,
    pub db: u16,
    drive: u16,
    sector: u16,
    surface: u16,
    cylinder: u16,
    pub disk: Arc<Mutex<Vec<u8>>>,
    intq: InterruptQueue,
}

impl Rk05 {
    pub fn new(disk: Vec<u8>, intq: InterruptQueue) -> Result<Rk05, ImageError> {
        if disk.len() != EXPECTED_IMAGE_LENGTH {
            return Err(ImageError::BadLength { got: disk.len(), want: EXPECTED_IMAGE_LENGTH });
        }
        let mut rk = Rk05 {
            ds: 0,
            er: 0,
            cs: 0,
            wc: 0,
            ba: 0,
            db: 0,
            drive: 0,
            sector: 0,
            surface: 0,
            cylinder: 0,
            disk: Arc::new(Mutex::new(disk)),
            intq,
        };
        rk.reset_regs();
        Ok(rk)
    }

    pub fn save_image(&self, path: &Path) -> Result<(), ImageError> {
        fs::write(path, &*self.disk.lock().unwrap())?;
        Ok(())
    }

    pub fn reset_regs(&mut self) {
        self.ds = (1 << 11) | (1 << 7) | (1 << 6);
        self.er = 0;
        self.cs = 1 << 7;
        self.wc = 0;
        self.ba = 0;
        self.db = 0;
    }

    pub fn read16(&self, a: u32) -> u16 {
        match a {
            0o777400 => self.ds,
            0o777402 => self.er,
            0o777404 => self.cs | (((self.ba & 0x30000) >> 12) as u16),
            0o777406 => self.wc,
            0o777410 => (self.ba & 0xFFFF) as u16,
            0o777412 => self.sector | (self.surface << 4) | (self.cylinder << 5) | (self.drive << 13),
            _ => panic!("invalid RK05 read {:06o}", a),
        }
    }

    pub fn write16(&mut self, a: u32, v: u16, mem: &mut [u16]) {
        match a {
            0o777400 | 0o777402 => {}
            0o777404 => {
                self.ba = (self.ba & 0xFFFF) | (((v & 0o60) as u32) << 12);
                let v = v & 0o17517; // writable bits
                self.cs &= !0o17517;
                self.cs |= v & !1; // GO bit does not latch
                if v & 1 != 0 {
                    self.go(mem);
                }
            }
            0o777406 => self.wc = v,
            0o777410 => self.ba = (self.ba & 0x30000) | v as u32,
            0o777412 => {
                self.drive = v >> 13;
                self.cylinder = (v >> 5) & 0o377;
                self.surface = (v >> 4) & 1;
                self.sector = v & 15;
            }
            _ => panic!("invalid RK05 write {:06o}", a),
        }
    }

    fn notready(&mut self) {
        self.ds &= !(1 << 6);
        self.cs &= !(1 << 7);
    }

    fn ready(&mut self) {
        self.ds |= 1 << 6;
        self.cs |= 1 << 7;
    }

    fn error(&mut self, code: u16) {
        self.ready();
        self.er |= code;
        self.cs |= (1 << 15) | (1 << 14);
        let msg = match code {
            RKOVR => "operation overflowed the disk",
            RKNXD => "invalid disk accessed",
            RKNXC => "invalid cylinder accessed",
            RKNXS => "invalid sector accessed",
            _ => "unknown RK05 error",
        };
        warn!("RK05: {}", msg);
    }

    fn go(&mut self, mem: &mut [u16]) {
        let op = (self.cs & 0xF) >> 1;
        match op {
            0 => {
                warn!("resetting the drive via op == 0");
                self.reset_regs();
            }
            1 => {
                self.notready();
                self.rwsec(true, mem);
            }
            2 => {
                self.notready();
                self.rwsec(false, mem);
            }
            _ => panic!("unimplemented RK05 operation {:#x}", op),
        }
    }

    /// Transfer whole sectors until the word count drains. The head advances
    /// past the end of each sector before the overflow check.
    fn rwsec(&mut self, write: bool, mem: &mut [u16]) {
        let disk = Arc::clone(&self.disk);
        let mut disk = disk.lock().unwrap();
        loop {
            if self.drive != 0 {
                return self.error(RKNXD);
            }
            if self.cylinder > 0o312 {
                return self.error(RKNXC);
            }
            if self.sector > 0o13 {
                return self.error(RKNXS);
            }
            let mut pos =
                (self.cylinder as usize * 24 + self.surface as usize * 12 + self.sector as usize) * 512;
            // the distributed image is shorter than the full cartridge;
            // sectors past its end read as zeros and swallow writes
            let backed = pos + 512 <= disk.len();
            if !backed {
                warn!("RK05: sector at byte {} is beyond the image", pos);
            }
            for _ in 0..256 {
                if self.wc == 0 {
                    break;
                }
                let w = (self.ba >> 1) as usize;
                if write {
                    if backed {
                        let val = mem[w];
                        disk[pos] = (val & 0xFF) as u8;
                        disk[pos + 1] = (val >> 8) as u8;
                    }
                } else {
                    mem[w] = if backed {
                        disk[pos] as u16 | ((disk[pos + 1] as u16) << 8)
                    } else {
                        0
                    };
                }
                self.ba += 2;
                self.wc = self.wc.wrapping_add(1);
                pos += 2;
            }
            self.sector += 1;
            if self.sector > 0o13 {
                self.sector = 0;
                self.surface += 1;
                if self.surface > 1 {
                    self.surface = 0;
                    self.cylinder += 1;
                    if self.cylinder > 0o312 {
                        return self.error(RKOVR);
                    }
                }
            }
            if self.wc == 0 {
                break;
            }
        }
        self.ready();
        if self.cs & (1 << 6) != 0 {
            self.intq.post(INT_RK, 5);
        }
    }
}
